use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema_de!)]
pub struct WordCountSerde {
	#[serde(default)]
	pub request: Option<WordCountRule>,
	#[serde(default)]
	pub response: Option<WordCountRule>,
}

#[apply(schema_de!)]
pub struct WordCountRule {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub show_assessment: bool,
	#[serde(default)]
	pub passthrough_on_error: bool,
	#[serde(default)]
	pub min: usize,
	#[serde(default)]
	pub max: Option<usize>,
}

impl WordCountRule {
	fn into_guard(self) -> DirectionalGuard {
		DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(WordCountCheck {
				min: self.min,
				max: self.max,
			}),
		)
	}
}

pub fn build(name: Strng, config: WordCountSerde) -> Guardrail {
	Guardrail::new(
		name,
		config.request.map(WordCountRule::into_guard),
		config.response.map(WordCountRule::into_guard),
	)
}

struct WordCountCheck {
	min: usize,
	max: Option<usize>,
}

#[async_trait::async_trait]
impl Check for WordCountCheck {
	fn kind(&self) -> Strng {
		strng::literal!("WORD_COUNT_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let words = text.trim().split_whitespace().count();
		let max = self.max.unwrap_or(usize::MAX);
		let verdict = if words >= self.min && words <= max {
			Verdict::pass()
		} else {
			Verdict::fail(format!("word count {words} is outside the allowed range"))
		};
		Ok(verdict.with_assessment(serde_json::json!({
			"words": words,
			"min": self.min,
			"max": self.max,
		})))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn counts_whitespace_separated_tokens() {
		let check = WordCountCheck {
			min: 2,
			max: Some(3),
		};
		assert!(check.validate("  hello   world  ").await.unwrap().passed);
		assert!(check.validate("one two three").await.unwrap().passed);
		assert!(!check.validate("one").await.unwrap().passed);
		assert!(!check.validate("a b c d").await.unwrap().passed);
	}

	#[tokio::test]
	async fn empty_text_has_zero_words() {
		let check = WordCountCheck { min: 1, max: None };
		assert!(!check.validate("   ").await.unwrap().passed);
	}
}
