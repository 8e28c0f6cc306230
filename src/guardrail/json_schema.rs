use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema_de!)]
pub struct JsonSchemaSerde {
	#[serde(default)]
	pub request: Option<JsonSchemaRule>,
	#[serde(default)]
	pub response: Option<JsonSchemaRule>,
}

#[apply(schema_de!)]
pub struct JsonSchemaRule {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub show_assessment: bool,
	#[serde(default)]
	pub passthrough_on_error: bool,
	/// A draft-7 JSON schema.
	pub schema: Value,
}

impl JsonSchemaRule {
	fn into_guard(self) -> anyhow::Result<DirectionalGuard> {
		let validator = jsonschema::options()
			.with_draft(Draft::Draft7)
			.build(&self.schema)
			.map_err(|e| anyhow::anyhow!("invalid JSON schema: {e}"))?;
		Ok(DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(JsonSchemaCheck { validator }),
		))
	}
}

pub fn build(name: Strng, config: JsonSchemaSerde) -> anyhow::Result<Guardrail> {
	Ok(Guardrail::new(
		name,
		config.request.map(JsonSchemaRule::into_guard).transpose()?,
		config.response.map(JsonSchemaRule::into_guard).transpose()?,
	))
}

struct JsonSchemaCheck {
	validator: Validator,
}

#[async_trait::async_trait]
impl Check for JsonSchemaCheck {
	fn kind(&self) -> Strng {
		strng::literal!("JSON_SCHEMA_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let instance: Value = match serde_json::from_str(text) {
			Ok(v) => v,
			Err(e) => {
				return Ok(Verdict::fail(format!("payload is not valid JSON: {e}")));
			},
		};
		let errors = self
			.validator
			.iter_errors(&instance)
			.map(|e| {
				let path = e.instance_path.to_string();
				let field = if path.is_empty() { "/".to_string() } else { path };
				(field, e.to_string())
			})
			.collect::<Vec<_>>();
		if errors.is_empty() {
			return Ok(Verdict::pass());
		}
		let assessment = errors
			.iter()
			.map(|(field, msg)| (field.clone(), Value::String(msg.clone())))
			.collect::<serde_json::Map<_, _>>();
		Ok(
			Verdict::fail(format!("payload failed schema validation ({} errors)", errors.len()))
				.with_assessment(Value::Object(assessment)),
		)
	}
}

#[cfg(test)]
mod tests {
	use crate::guardrail::Direction;

	use super::*;

	fn rule(schema: Value) -> JsonSchemaRule {
		serde_json::from_value(serde_json::json!({
			"schema": schema,
			"showAssessment": true,
		}))
		.unwrap()
	}

	#[tokio::test]
	async fn valid_payload_passes() {
		let dg = rule(serde_json::json!({
			"type": "object",
			"required": ["name"],
			"properties": {"name": {"type": "string"}},
		}))
		.into_guard()
		.unwrap();
		assert!(
			dg.evaluate(Direction::Request, br#"{"name": "ok"}"#)
				.await
				.is_none()
		);
	}

	#[tokio::test]
	async fn invalid_payload_blocks_with_field_errors() {
		let dg = rule(serde_json::json!({
			"type": "object",
			"required": ["name"],
			"properties": {"name": {"type": "string"}},
		}))
		.into_guard()
		.unwrap();
		let i = dg
			.evaluate(Direction::Request, br#"{"name": 42}"#)
			.await
			.unwrap();
		let assessments = i.assessments.unwrap();
		assert!(assessments.as_object().unwrap().contains_key("/name"));
	}

	#[tokio::test]
	async fn non_json_payload_fails_check() {
		let dg = rule(serde_json::json!({"type": "object"})).into_guard().unwrap();
		assert!(
			dg.evaluate(Direction::Request, b"not json at all")
				.await
				.is_some()
		);
	}

	#[test]
	fn bad_schema_fails_construction() {
		let r: JsonSchemaRule = serde_json::from_value(serde_json::json!({
			"schema": {"type": "definitely-not-a-type"},
		}))
		.unwrap();
		assert!(r.into_guard().is_err());
	}
}
