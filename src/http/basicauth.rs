use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::http::{HeaderValue, StatusCode, header};
use crate::policy::{
	ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction, meta,
};
use crate::*;

#[apply(schema_de!)]
pub struct BasicAuthSerde {
	pub users: Vec<BasicUser>,
	#[serde(default = "default_realm")]
	pub realm: String,
	/// Forward unauthenticated requests with `auth.success=false` instead of
	/// rejecting them.
	#[serde(default)]
	pub allow_unauthenticated: bool,
}

#[apply(schema_de!)]
pub struct BasicUser {
	pub username: String,
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub password: SecretString,
}

fn default_realm() -> String {
	"Restricted".to_string()
}

pub struct BasicAuth {
	users: Vec<BasicUser>,
	realm: String,
	allow_unauthenticated: bool,
}

impl BasicAuth {
	pub fn new(config: BasicAuthSerde) -> anyhow::Result<Self> {
		if config.users.is_empty() {
			anyhow::bail!("basic auth requires at least one user");
		}
		if config.users.iter().any(|u| u.username.contains(':')) {
			anyhow::bail!("basic auth usernames cannot contain ':'");
		}
		Ok(BasicAuth {
			users: config.users,
			realm: config.realm,
			allow_unauthenticated: config.allow_unauthenticated,
		})
	}

	fn credentials(ctx: &PolicyContext<'_>) -> Option<(String, String)> {
		let value = ctx.header_str(&header::AUTHORIZATION)?;
		let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
		let decoded = STANDARD.decode(encoded.trim()).ok()?;
		let decoded = String::from_utf8(decoded).ok()?;
		let (user, pass) = decoded.split_once(':')?;
		Some((user.to_string(), pass.to_string()))
	}

	fn authenticate(&self, username: &str, password: &str) -> bool {
		// comparison is constant-time across all configured users
		let mut found = subtle::Choice::from(0u8);
		for u in &self.users {
			let name_eq = u.username.as_bytes().ct_eq(username.as_bytes());
			let pass_eq = u
				.password
				.expose_secret()
				.as_bytes()
				.ct_eq(password.as_bytes());
			found |= name_eq & pass_eq;
		}
		found.into()
	}

	fn challenge(&self) -> RequestAction {
		let mut resp = ImmediateResponse::json(
			StatusCode::UNAUTHORIZED,
			&serde_json::json!({"error": "Unauthorized", "message": "Valid credentials required"}),
		);
		if let Ok(v) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", self.realm)) {
			resp.headers.insert(header::WWW_AUTHENTICATE, v);
		}
		RequestAction::Direct(resp)
	}
}

#[async_trait::async_trait]
impl Policy for BasicAuth {
	fn name(&self) -> Strng {
		strng::literal!("basic-auth")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::request_only()
	}

	fn fail_closed(&self) -> bool {
		true
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		match Self::credentials(ctx) {
			Some((username, password)) if self.authenticate(&username, &password) => {
				ctx.metadata.set(meta::AUTH_SUCCESS, true);
				ctx.metadata.set(meta::AUTH_METHOD, "basic");
				ctx.metadata.set(meta::AUTH_USERNAME, username);
				Ok(RequestAction::pass())
			},
			_ if self.allow_unauthenticated => {
				ctx.metadata.set(meta::AUTH_SUCCESS, false);
				Ok(RequestAction::pass())
			},
			_ => Ok(self.challenge()),
		}
	}
}
