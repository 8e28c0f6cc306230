use once_cell::sync::Lazy;
use regex::Regex;

use crate::*;

#[derive(Debug, Clone)]
pub struct RecognizerResult {
	pub entity_type: Strng,
	pub matched: String,
	pub start: usize,
	pub end: usize,
	pub score: f32,
}

pub trait Recognizer: Send + Sync {
	fn recognize(&self, text: &str) -> Vec<RecognizerResult>;
	fn name(&self) -> &str;
}

#[derive(Debug)]
struct Pattern {
	#[allow(dead_code)]
	name: String,
	regex: Regex,
	score: f32,
}

/// Scored regex matching with an optional candidate validator (e.g. Luhn for
/// card numbers). Matches failing validation are dropped entirely.
pub struct PatternRecognizer {
	patterns: Vec<Pattern>,
	entity_type: Strng,
	validator: Option<fn(&str) -> bool>,
}

impl PatternRecognizer {
	pub fn new(entity_type: &str) -> Self {
		Self {
			patterns: Vec::new(),
			entity_type: strng::new(entity_type),
			validator: None,
		}
	}

	pub fn with_validator(mut self, validator: fn(&str) -> bool) -> Self {
		self.validator = Some(validator);
		self
	}

	pub fn add_pattern(&mut self, name: &str, regex: &str, score: f32) {
		self.add_compiled(
			name,
			Regex::new(regex).expect("built-in pattern compiles"),
			score,
		);
	}

	pub fn add_compiled(&mut self, name: &str, regex: Regex, score: f32) {
		self.patterns.push(Pattern {
			name: name.to_string(),
			regex,
			score,
		});
	}
}

impl Recognizer for PatternRecognizer {
	fn recognize(&self, text: &str) -> Vec<RecognizerResult> {
		let mut results = Vec::new();
		for pattern in &self.patterns {
			for m in pattern.regex.find_iter(text) {
				let candidate = m.as_str();
				if let Some(validate) = self.validator
					&& !validate(candidate)
				{
					continue;
				}
				results.push(RecognizerResult {
					entity_type: self.entity_type.clone(),
					matched: candidate.to_string(),
					start: m.start(),
					end: m.end(),
					score: pattern.score,
				});
			}
		}
		results
	}

	fn name(&self) -> &str {
		&self.entity_type
	}
}

fn email() -> PatternRecognizer {
	let mut r = PatternRecognizer::new("EMAIL_ADDRESS");
	r.add_pattern(
		"standard email",
		r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+",
		0.85,
	);
	r
}

fn phone() -> PatternRecognizer {
	let mut r = PatternRecognizer::new("PHONE_NUMBER");
	r.add_pattern(
		"international",
		r"\+\d{1,3}[- ]?\(?\d{1,4}\)?[- ]?\d{2,4}[- ]?\d{2,4}([- ]?\d{2,4})?",
		0.6,
	);
	r.add_pattern(
		"us local",
		r"\b\(?\d{3}\)?[- .]\d{3}[- .]\d{4}\b",
		0.5,
	);
	r
}

fn us_ssn() -> PatternRecognizer {
	let mut r = PatternRecognizer::new("SSN");
	r.add_pattern("dashed", r"\b([0-9]{3})-([0-9]{2})-([0-9]{4})\b", 0.5);
	r.add_pattern("spaced", r"\b([0-9]{3})[ .]([0-9]{2})[ .]([0-9]{4})\b", 0.5);
	r.add_pattern("bare", r"\b[0-9]{9}\b", 0.05);
	r
}

fn credit_card() -> PatternRecognizer {
	let mut r = PatternRecognizer::new("CREDIT_CARD").with_validator(luhn);
	r.add_pattern(
		"visa",
		r"\b4\d{3}[- ]?(\d{3,4})[- ]?(\d{3,4})[- ]?(\d{3,5})\b",
		0.3,
	);
	r.add_pattern(
		"mastercard",
		r"\b5[0-5]\d{2}[- ]?(\d{3,4})[- ]?(\d{3,4})[- ]?(\d{3,5})\b",
		0.3,
	);
	r.add_pattern(
		"amex",
		r"\b3[47]\d{2}[- ]?(\d{3,4})[- ]?(\d{3,4})[- ]?(\d{3,5})\b",
		0.3,
	);
	r.add_pattern(
		"discover",
		r"\b6\d{3}[- ]?(\d{3,4})[- ]?(\d{3,4})[- ]?(\d{3,5})\b",
		0.3,
	);
	r
}

fn luhn(candidate: &str) -> bool {
	let digits = candidate
		.chars()
		.filter(|c| c.is_ascii_digit())
		.map(|c| c as u32 - '0' as u32)
		.collect::<Vec<_>>();
	if digits.len() < 12 {
		return false;
	}
	let sum: u32 = digits
		.iter()
		.rev()
		.enumerate()
		.map(|(i, &d)| {
			if i % 2 == 1 {
				let doubled = d * 2;
				if doubled > 9 { doubled - 9 } else { doubled }
			} else {
				d
			}
		})
		.sum();
	sum % 10 == 0
}

pub static EMAIL: Lazy<Arc<dyn Recognizer>> = Lazy::new(|| Arc::new(email()));
pub static PHONE: Lazy<Arc<dyn Recognizer>> = Lazy::new(|| Arc::new(phone()));
pub static SSN: Lazy<Arc<dyn Recognizer>> = Lazy::new(|| Arc::new(us_ssn()));
pub static CREDIT_CARD: Lazy<Arc<dyn Recognizer>> = Lazy::new(|| Arc::new(credit_card()));
