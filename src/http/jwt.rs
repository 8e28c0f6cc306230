use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};

use crate::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use crate::policy::{
	HeaderMutations, ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode,
	RequestAction, RequestModifications, meta,
};
use crate::*;

pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TokenError {
	#[error("the token is invalid or malformed: {0:?}")]
	Invalid(jsonwebtoken::errors::Error),
	#[error("the token header is malformed: {0:?}")]
	InvalidHeader(jsonwebtoken::errors::Error),
	#[error("no bearer token found")]
	Missing,
	#[error("the token header does not specify a `kid`")]
	MissingKeyId,
	#[error("token uses the unknown key {0:?}")]
	UnknownKeyId(String),
	#[error("token is missing required scopes")]
	MissingScopes,
}

#[derive(Debug, thiserror::Error)]
pub enum JwkError {
	#[error("failed to load JWKS: {0}")]
	JwkLoadError(anyhow::Error),
	#[error("failed to parse JWKS: {0}")]
	JwksParseError(#[from] serde_json::Error),
	#[error("the key is missing the `kid` attribute")]
	MissingKeyId,
	#[error("could not construct a decoding key for {key_id:?}: {error:?}")]
	DecodingError {
		key_id: String,
		error: jsonwebtoken::errors::Error,
	},
	#[error("the key {key_id:?} uses an unsupported algorithm")]
	UnexpectedAlgorithm { key_id: String },
}

#[derive(Debug, Clone, serde::Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(untagged)]
pub enum JwksSource {
	File { file: std::path::PathBuf },
	Remote { url: String },
	Inline(String),
}

impl JwksSource {
	async fn load(&self) -> anyhow::Result<JwkSet> {
		let raw = match self {
			JwksSource::File { file } => std::fs::read_to_string(file)
				.with_context(|| format!("read JWKS from {}", file.display()))?,
			JwksSource::Inline(s) => s.clone(),
			JwksSource::Remote { url } => reqwest::Client::new()
				.get(url)
				.timeout(Duration::from_secs(10))
				.send()
				.await
				.and_then(reqwest::Response::error_for_status)
				.with_context(|| format!("fetch JWKS from {url}"))?
				.text()
				.await
				.context("read JWKS body")?,
		};
		serde_json::from_str(&raw).context("parse JWKS")
	}
}

#[apply(schema_de!)]
pub struct JwtAuthSerde {
	pub issuer: String,
	pub audiences: Vec<String>,
	pub jwks: JwksSource,
	#[serde(default)]
	pub required_scopes: Vec<String>,
	/// Claims copied onto upstream request headers.
	#[serde(default)]
	pub claim_headers: Vec<ClaimHeader>,
	/// URL advertised via `resource_metadata` in the challenge.
	#[serde(default)]
	pub resource_metadata: Option<String>,
}

#[apply(schema_de!)]
pub struct ClaimHeader {
	pub claim: String,
	pub header: Strng,
}

#[derive(Clone)]
struct Jwk {
	decoding: DecodingKey,
	validation: Validation,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Claims {
	pub inner: Map<String, Value>,
}

/// Bearer-token auth for MCP-style routes: JWKS-validated JWTs, scope
/// enforcement, claim-to-header mapping, and synthesis of the OAuth
/// protected-resource metadata document.
pub struct JwtAuth {
	keys: HashMap<String, Jwk>,
	issuer: String,
	required_scopes: Vec<String>,
	claim_headers: Vec<ClaimHeader>,
	resource_metadata: Option<String>,
}

impl Debug for JwtAuth {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtAuth")
			.field("keys", &self.keys.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl JwtAuth {
	pub async fn build(config: JwtAuthSerde) -> Result<Self, JwkError> {
		let jwks = config.jwks.load().await.map_err(JwkError::JwkLoadError)?;
		let mut keys = HashMap::new();
		let to_supported_alg = |key_algorithm: Option<KeyAlgorithm>| match key_algorithm {
			Some(key_alg) => jsonwebtoken::Algorithm::from_str(key_alg.to_string().as_str()).ok(),
			_ => None,
		};
		for jwk in jwks.keys {
			let Some(key_alg) = to_supported_alg(jwk.common.key_algorithm) else {
				warn!(
					"JWK key algorithm {:?} is not supported. Tokens signed by that key will not be accepted.",
					jwk.common.key_algorithm
				);
				continue;
			};
			let kid = jwk.common.key_id.ok_or(JwkError::MissingKeyId)?;
			let decoding = match &jwk.algorithm {
				AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
					.map_err(|error| JwkError::DecodingError {
						key_id: kid.clone(),
						error,
					})?,
				AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
					.map_err(|error| JwkError::DecodingError {
						key_id: kid.clone(),
						error,
					})?,
				AlgorithmParameters::OctetKey(oct) => {
					let secret = URL_SAFE_NO_PAD.decode(&oct.value).map_err(|_| {
						JwkError::UnexpectedAlgorithm {
							key_id: kid.clone(),
						}
					})?;
					DecodingKey::from_secret(&secret)
				},
				_ => {
					return Err(JwkError::UnexpectedAlgorithm { key_id: kid });
				},
			};
			let mut validation = Validation::new(key_alg);
			validation.set_audience(config.audiences.as_slice());
			validation.set_issuer(&[config.issuer.as_str()]);
			keys.insert(
				kid,
				Jwk {
					decoding,
					validation,
				},
			);
		}
		Ok(JwtAuth {
			keys,
			issuer: config.issuer,
			required_scopes: config.required_scopes,
			claim_headers: config.claim_headers,
			resource_metadata: config.resource_metadata,
		})
	}

	pub fn validate_claims(&self, token: &str) -> Result<Claims, TokenError> {
		let header = decode_header(token).map_err(|error| {
			debug!(?error, "received token with invalid header");
			TokenError::InvalidHeader(error)
		})?;
		let kid = header.kid.as_ref().ok_or_else(|| {
			debug!(?header, "header is missing the `kid` attribute");
			TokenError::MissingKeyId
		})?;
		let key = self.keys.get(kid).ok_or_else(|| {
			debug!(%kid, "token refers to an unknown key");
			TokenError::UnknownKeyId(kid.to_owned())
		})?;
		let decoded = decode::<Map<String, Value>>(token, &key.decoding, &key.validation)
			.map_err(|error| {
				debug!(?error, "token is malformed or does not pass validation");
				TokenError::Invalid(error)
			})?;
		let claims = Claims {
			inner: decoded.claims,
		};
		self.check_scopes(&claims)?;
		Ok(claims)
	}

	fn check_scopes(&self, claims: &Claims) -> Result<(), TokenError> {
		if self.required_scopes.is_empty() {
			return Ok(());
		}
		let granted: Vec<String> = match claims.inner.get("scope") {
			Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
			_ => claims
				.inner
				.get("scp")
				.and_then(Value::as_array)
				.map(|a| {
					a.iter()
						.filter_map(Value::as_str)
						.map(str::to_string)
						.collect()
				})
				.unwrap_or_default(),
		};
		if self
			.required_scopes
			.iter()
			.all(|r| granted.iter().any(|g| g == r))
		{
			Ok(())
		} else {
			Err(TokenError::MissingScopes)
		}
	}

	fn bearer(ctx: &PolicyContext<'_>) -> Option<String> {
		let value = ctx.header_str(&header::AUTHORIZATION)?;
		value
			.strip_prefix("Bearer ")
			.or_else(|| value.strip_prefix("bearer "))
			.map(|t| t.trim().to_string())
	}

	fn challenge(&self) -> RequestAction {
		let mut www = "Bearer".to_string();
		if let Some(rm) = &self.resource_metadata {
			www.push_str(&format!(", resource_metadata=\"{rm}\""));
		}
		let mut resp = ImmediateResponse::json(
			StatusCode::UNAUTHORIZED,
			&serde_json::json!({"error": "Unauthorized", "message": "Valid bearer token required"}),
		);
		if let Ok(v) = HeaderValue::from_str(&www) {
			resp.headers.insert(header::WWW_AUTHENTICATE, v);
		}
		RequestAction::Direct(resp)
	}

	fn protected_resource_metadata(&self) -> ImmediateResponse {
		ImmediateResponse::json(
			StatusCode::OK,
			&serde_json::json!({
				"authorization_servers": [self.issuer],
				"scopes_supported": self.required_scopes,
				"bearer_methods_supported": ["header"],
			}),
		)
	}
}

#[async_trait::async_trait]
impl Policy for JwtAuth {
	fn name(&self) -> Strng {
		strng::literal!("jwt-auth")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::request_only()
	}

	fn fail_closed(&self) -> bool {
		true
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		if ctx.route.method == Method::GET && ctx.path == Some(PROTECTED_RESOURCE_PATH) {
			return Ok(RequestAction::Direct(self.protected_resource_metadata()));
		}
		let Some(token) = Self::bearer(ctx) else {
			return Ok(self.challenge());
		};
		let claims = match self.validate_claims(&token) {
			Ok(c) => c,
			Err(err) => {
				debug!(%err, "token rejected");
				return Ok(self.challenge());
			},
		};
		ctx.metadata.set(meta::AUTH_SUCCESS, true);
		ctx.metadata.set(meta::AUTH_METHOD, "jwt");
		if let Some(Value::String(sub)) = claims.inner.get("sub") {
			ctx.metadata.set(meta::AUTH_USERNAME, sub.clone());
		}
		let mut headers = HeaderMutations::default().with_remove(header::AUTHORIZATION);
		for ch in &self.claim_headers {
			let Some(value) = claims.inner.get(&ch.claim) else {
				continue;
			};
			let rendered = match value {
				Value::String(s) => s.clone(),
				other => other.to_string(),
			};
			if let (Ok(name), Ok(value)) = (
				HeaderName::from_bytes(ch.header.as_bytes()),
				HeaderValue::from_str(&rendered),
			) {
				headers.set.push((name, value));
			}
		}
		Ok(RequestAction::Modify(RequestModifications {
			headers,
			..Default::default()
		}))
	}
}
