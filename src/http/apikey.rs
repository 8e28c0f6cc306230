use crate::http::{Method, StatusCode};
use crate::policy::{
	ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction, meta,
};
use crate::*;

/// External key store. The gateway only ever sees plaintext keys in flight;
/// storage, hashing and quota bookkeeping live behind this seam.
#[async_trait::async_trait]
pub trait KeyValidator: Send + Sync {
	async fn validate(
		&self,
		api_id: &str,
		operation_path: &str,
		method: &Method,
		key: &str,
	) -> anyhow::Result<bool>;
}

#[apply(schema_de!)]
#[derive(Default, Copy, PartialEq, Eq)]
pub enum KeyLocation {
	#[default]
	Header,
	Query,
}

#[apply(schema_de!)]
pub struct ApiKeySerde {
	/// Header or query parameter carrying the key.
	pub key: String,
	#[serde(default, rename = "in")]
	pub location: KeyLocation,
	/// Optional prefix (e.g. `Bearer `) stripped case-insensitively.
	#[serde(default)]
	pub value_prefix: Option<String>,
}

pub struct ApiKeyAuth {
	key: String,
	location: KeyLocation,
	value_prefix: Option<String>,
	validator: Arc<dyn KeyValidator>,
}

impl ApiKeyAuth {
	pub fn new(config: ApiKeySerde, validator: Arc<dyn KeyValidator>) -> anyhow::Result<Self> {
		if config.key.is_empty() {
			anyhow::bail!("api key policy requires a key name");
		}
		Ok(ApiKeyAuth {
			key: config.key,
			location: config.location,
			value_prefix: config.value_prefix,
			validator,
		})
	}

	fn extract(&self, ctx: &PolicyContext<'_>) -> Option<String> {
		let raw = match self.location {
			KeyLocation::Header => ctx
				.headers
				.get(self.key.as_str())
				.and_then(|v| v.to_str().ok())
				.map(str::to_string),
			KeyLocation::Query => ctx.query.and_then(|q| {
				url::form_urlencoded::parse(q.as_bytes())
					.find(|(k, _)| k == self.key.as_str())
					.map(|(_, v)| v.into_owned())
			}),
		}?;
		let value = match &self.value_prefix {
			Some(prefix) => match (raw.get(..prefix.len()), raw.get(prefix.len()..)) {
				(Some(head), Some(tail)) if head.eq_ignore_ascii_case(prefix) => tail.to_string(),
				_ => raw,
			},
			_ => raw,
		};
		let value = value.trim().to_string();
		(!value.is_empty()).then_some(value)
	}

	fn unauthorized() -> RequestAction {
		RequestAction::Direct(ImmediateResponse::json(
			StatusCode::UNAUTHORIZED,
			&serde_json::json!({"error": "Unauthorized", "message": "Valid API key required"}),
		))
	}
}

#[async_trait::async_trait]
impl Policy for ApiKeyAuth {
	fn name(&self) -> Strng {
		strng::literal!("api-key-auth")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::request_only()
	}

	fn fail_closed(&self) -> bool {
		true
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let Some(key) = self.extract(ctx) else {
			debug!(key = %self.key, "request missing API key");
			return Ok(Self::unauthorized());
		};
		let valid = match self
			.validator
			.validate(
				&ctx.route.api_id,
				&ctx.route.operation_path,
				&ctx.route.method,
				&key,
			)
			.await
		{
			Ok(v) => v,
			Err(err) => {
				// key store failure rejects; auth never fails open
				warn!(%err, "key validation failed");
				return Ok(Self::unauthorized());
			},
		};
		if !valid {
			return Ok(Self::unauthorized());
		}
		ctx.metadata.set(meta::AUTH_SUCCESS, true);
		ctx.metadata.set(meta::AUTH_METHOD, "api-key");
		Ok(RequestAction::pass())
	}
}
