use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema_de!)]
pub struct ContentLengthSerde {
	#[serde(default)]
	pub request: Option<ContentLengthRule>,
	#[serde(default)]
	pub response: Option<ContentLengthRule>,
}

#[apply(schema_de!)]
pub struct ContentLengthRule {
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

impl ContentLengthRule {
	fn into_guard(self) -> DirectionalGuard {
		DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(ContentLengthCheck {
				min: self.min,
				max: self.max,
			}),
		)
	}
}

pub fn build(name: Strng, config: ContentLengthSerde) -> Guardrail {
	Guardrail::new(
		name,
		config.request.map(ContentLengthRule::into_guard),
		config.response.map(ContentLengthRule::into_guard),
	)
}

/// Bounds on the UTF-8 byte length of the extracted payload.
struct ContentLengthCheck {
	min: usize,
	max: Option<usize>,
}

#[async_trait::async_trait]
impl Check for ContentLengthCheck {
	fn kind(&self) -> Strng {
		strng::literal!("CONTENT_LENGTH_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let len = text.len();
		let max = self.max.unwrap_or(usize::MAX);
		let verdict = if len >= self.min && len <= max {
			Verdict::pass()
		} else {
			Verdict::fail(format!(
				"content length {len} is outside the allowed range"
			))
		};
		Ok(verdict.with_assessment(serde_json::json!({
			"length": len,
			"min": self.min,
			"max": self.max,
		})))
	}
}
