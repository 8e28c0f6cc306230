use regex::Regex;

use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema_de!)]
pub struct RegexSerde {
	#[serde(default)]
	pub request: Option<RegexRule>,
	#[serde(default)]
	pub response: Option<RegexRule>,
}

#[apply(schema_de!)]
pub struct RegexRule {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub show_assessment: bool,
	#[serde(default)]
	pub passthrough_on_error: bool,
	#[serde(with = "serde_regex")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub regex: Regex,
}

impl RegexRule {
	fn into_guard(self) -> DirectionalGuard {
		DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(RegexCheck { regex: self.regex }),
		)
	}
}

pub fn build(name: Strng, config: RegexSerde) -> Guardrail {
	Guardrail::new(
		name,
		config.request.map(RegexRule::into_guard),
		config.response.map(RegexRule::into_guard),
	)
}

/// Predicate passes when the pattern matches; combine with `invert` to block
/// content that matches a denylist pattern.
struct RegexCheck {
	regex: Regex,
}

#[async_trait::async_trait]
impl Check for RegexCheck {
	fn kind(&self) -> Strng {
		strng::literal!("REGEX_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		match self.regex.find(text) {
			Some(m) => Ok(
				Verdict::pass().with_assessment(serde_json::json!({
					"pattern": self.regex.as_str(),
					"matched": m.as_str(),
				})),
			),
			None => Ok(
				Verdict::fail("content did not match the required pattern").with_assessment(
					serde_json::json!({
						"pattern": self.regex.as_str(),
					}),
				),
			),
		}
	}
}
