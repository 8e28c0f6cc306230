use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema_de!)]
pub struct SentenceCountSerde {
	#[serde(default)]
	pub request: Option<SentenceCountRule>,
	#[serde(default)]
	pub response: Option<SentenceCountRule>,
}

#[apply(schema_de!)]
pub struct SentenceCountRule {
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

impl SentenceCountRule {
	fn into_guard(self) -> DirectionalGuard {
		DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(SentenceCountCheck {
				min: self.min,
				max: self.max,
			}),
		)
	}
}

pub fn build(name: Strng, config: SentenceCountSerde) -> Guardrail {
	Guardrail::new(
		name,
		config.request.map(SentenceCountRule::into_guard),
		config.response.map(SentenceCountRule::into_guard),
	)
}

struct SentenceCountCheck {
	min: usize,
	max: Option<usize>,
}

fn count_sentences(text: &str) -> usize {
	text
		.trim()
		.split(['.', '!', '?'])
		.filter(|s| !s.trim().is_empty())
		.count()
}

#[async_trait::async_trait]
impl Check for SentenceCountCheck {
	fn kind(&self) -> Strng {
		strng::literal!("SENTENCE_COUNT_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let sentences = count_sentences(text);
		let max = self.max.unwrap_or(usize::MAX);
		let verdict = if sentences >= self.min && sentences <= max {
			Verdict::pass()
		} else {
			Verdict::fail(format!(
				"sentence count {sentences} is outside the allowed range"
			))
		};
		Ok(verdict.with_assessment(serde_json::json!({
			"sentences": sentences,
			"min": self.min,
			"max": self.max,
		})))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_on_terminators() {
		assert_eq!(count_sentences("One. Two! Three?"), 3);
		assert_eq!(count_sentences("No terminator"), 1);
		assert_eq!(count_sentences("Trailing dots..."), 1);
		assert_eq!(count_sentences(""), 0);
	}

	#[tokio::test]
	async fn bounds_enforced() {
		let check = SentenceCountCheck {
			min: 1,
			max: Some(2),
		};
		assert!(check.validate("First. Second.").await.unwrap().passed);
		assert!(!check.validate("A. B. C.").await.unwrap().passed);
	}
}
