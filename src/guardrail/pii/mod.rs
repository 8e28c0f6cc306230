pub mod recognizers;

use serde_json::Value;

use crate::guardrail::pii::recognizers::{Recognizer, RecognizerResult};
use crate::jsonpath::JsonPath;
use crate::policy::{
	Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction, RequestModifications,
	ResponseAction, ResponseModifications, meta,
};
use crate::*;

#[apply(schema_de!)]
pub struct PiiSerde {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	/// Built-in recognizers to run.
	#[serde(default)]
	pub entities: Vec<BuiltinEntity>,
	/// Additional custom patterns.
	#[serde(default)]
	pub patterns: Vec<CustomPattern>,
	/// Matches scoring below this are ignored.
	#[serde(default = "default_score_threshold")]
	pub score_threshold: f32,
}

#[apply(schema_de!)]
#[derive(Copy, PartialEq, Eq)]
pub enum BuiltinEntity {
	Email,
	Phone,
	#[serde(rename = "ssn")]
	Ssn,
	CreditCard,
}

#[apply(schema_de!)]
pub struct CustomPattern {
	pub name: String,
	#[serde(with = "serde_regex")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub regex: regex::Regex,
	#[serde(default = "default_pattern_score")]
	pub score: f32,
}

fn default_score_threshold() -> f32 {
	0.3
}

fn default_pattern_score() -> f32 {
	0.5
}

/// Masks recognized PII in the request with stable placeholders and restores
/// the originals in the response. The placeholder map lives in the request's
/// metadata, so numbering is per-request and never leaks across transactions.
pub struct PiiMasking {
	json_path: Option<JsonPath>,
	recognizers: Vec<Arc<dyn Recognizer>>,
	score_threshold: f32,
}

impl PiiMasking {
	pub fn new(config: PiiSerde) -> anyhow::Result<Self> {
		let mut recognizers: Vec<Arc<dyn Recognizer>> = Vec::new();
		for e in &config.entities {
			recognizers.push(match e {
				BuiltinEntity::Email => recognizers::EMAIL.clone(),
				BuiltinEntity::Phone => recognizers::PHONE.clone(),
				BuiltinEntity::Ssn => recognizers::SSN.clone(),
				BuiltinEntity::CreditCard => recognizers::CREDIT_CARD.clone(),
			});
		}
		for p in config.patterns {
			let mut r = recognizers::PatternRecognizer::new(&p.name);
			r.add_compiled(&p.name, p.regex, p.score);
			recognizers.push(Arc::new(r));
		}
		if recognizers.is_empty() {
			anyhow::bail!("PII masking requires at least one entity or pattern");
		}
		Ok(PiiMasking {
			json_path: config.json_path,
			recognizers,
			score_threshold: config.score_threshold,
		})
	}

	fn detect(&self, text: &str) -> Vec<RecognizerResult> {
		let mut all = Vec::new();
		for r in &self.recognizers {
			all.extend(
				r.recognize(text)
					.into_iter()
					.filter(|m| m.score >= self.score_threshold),
			);
		}
		// longest-first within a position so overlaps resolve to one entity
		all.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
		let mut kept: Vec<RecognizerResult> = Vec::new();
		for m in all {
			if kept.last().map(|k| m.start >= k.end).unwrap_or(true) {
				kept.push(m);
			}
		}
		kept
	}

	fn mask(&self, text: &str) -> Option<(String, serde_json::Map<String, Value>)> {
		let matches = self.detect(text);
		if matches.is_empty() {
			return None;
		}
		let mut masked = text.to_string();
		let mut mapping = serde_json::Map::new();
		for (i, m) in matches.iter().enumerate().rev() {
			let placeholder = format!("<{}_{}>", m.entity_type, i + 1);
			masked.replace_range(m.start..m.end, &placeholder);
			mapping.insert(placeholder, Value::String(m.matched.clone()));
		}
		Some((masked, mapping))
	}
}

#[async_trait::async_trait]
impl Policy for PiiMasking {
	fn name(&self) -> Strng {
		strng::literal!("pii-masking")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::buffered_bidirectional()
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let body = ctx.body_bytes();
		let text = match crate::jsonpath::extract_or_body(self.json_path.as_ref(), body) {
			Ok(t) => t,
			Err(err) => {
				debug!(%err, "PII extraction failed, forwarding unmodified");
				return Ok(RequestAction::pass());
			},
		};
		let Some((masked, mapping)) = self.mask(&text) else {
			return Ok(RequestAction::pass());
		};
		let new_body = match &self.json_path {
			Some(p) => p
				.update(body, &masked)
				.map_err(|e| PolicyError::Internal(e.into()))?,
			None => Bytes::from(masked),
		};
		ctx.metadata.set(meta::PII_ENTITIES, Value::Object(mapping));
		Ok(RequestAction::Modify(RequestModifications {
			body: Some(new_body),
			..Default::default()
		}))
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		let Some(Value::Object(mapping)) = ctx.metadata.get(meta::PII_ENTITIES).cloned() else {
			return Ok(ResponseAction::pass());
		};
		let Ok(mut text) = std::str::from_utf8(ctx.body_bytes()).map(str::to_string) else {
			return Ok(ResponseAction::pass());
		};
		let mut changed = false;
		for (placeholder, original) in &mapping {
			if let Value::String(original) = original
				&& text.contains(placeholder.as_str())
			{
				text = text.replace(placeholder.as_str(), original);
				changed = true;
			}
		}
		if !changed {
			return Ok(ResponseAction::pass());
		}
		Ok(ResponseAction::Modify(ResponseModifications {
			body: Some(Bytes::from(text)),
			..Default::default()
		}))
	}
}

#[cfg(test)]
mod tests {
	use crate::http::HeaderMap;
	use crate::policy::{BufferedBody, Metadata, RouteIdentity};

	use super::*;

	fn route() -> RouteIdentity {
		RouteIdentity {
			api_id: strng::literal!("api-1"),
			api_name: strng::literal!("chat"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/chat"),
			method: ::http::Method::POST,
		}
	}

	fn policy() -> PiiMasking {
		PiiMasking::new(
			serde_json::from_value(serde_json::json!({
				"jsonPath": "prompt",
				"entities": ["email", "ssn"],
			}))
			.unwrap(),
		)
		.unwrap()
	}

	#[tokio::test]
	async fn masks_request_and_restores_response() {
		let p = policy();
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let body =
			BufferedBody::complete(r#"{"prompt":"email jane@example.com ssn 078-05-1120 ok"}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r1"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: None,
		};
		let action = p.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!("expected masking");
		};
		let masked = m.body.unwrap();
		let masked_str = std::str::from_utf8(&masked).unwrap();
		assert!(!masked_str.contains("jane@example.com"));
		assert!(!masked_str.contains("078-05-1120"));
		assert!(masked_str.contains("<EMAIL_ADDRESS_1>"));
		assert!(masked_str.contains("<SSN_2>"));
		assert!(md.contains(meta::PII_ENTITIES));

		// upstream echoes the placeholders back
		let resp_body = BufferedBody::complete(
			r#"{"reply":"I will email <EMAIL_ADDRESS_1> about <SSN_2>"}"#,
		);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r1"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&resp_body),
			path: None,
			query: None,
			status: Some(crate::http::StatusCode::OK),
		};
		let action = p.on_response(&mut ctx).await.unwrap();
		let ResponseAction::Modify(m) = action else {
			panic!("expected restore");
		};
		let restored = m.body.unwrap();
		let restored_str = std::str::from_utf8(&restored).unwrap();
		assert!(restored_str.contains("jane@example.com"));
		assert!(restored_str.contains("078-05-1120"));
	}

	#[tokio::test]
	async fn clean_payload_is_untouched() {
		let p = policy();
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let body = BufferedBody::complete(r#"{"prompt":"nothing sensitive"}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r2"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: None,
		};
		let action = p.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!();
		};
		assert!(m.body.is_none());
		assert!(!md.contains(meta::PII_ENTITIES));
	}

	#[tokio::test]
	async fn response_without_placeholders_passes() {
		let p = policy();
		let route = route();
		let mut md = Metadata::default();
		md.set(meta::PII_ENTITIES, serde_json::json!({"<SSN_1>": "078-05-1120"}));
		let headers = HeaderMap::new();
		let body = BufferedBody::complete(r#"{"reply":"all good"}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r3"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: Some(crate::http::StatusCode::OK),
		};
		let action = p.on_response(&mut ctx).await.unwrap();
		assert!(matches!(
			action,
			ResponseAction::Modify(ResponseModifications { body: None, .. })
		));
	}
}
