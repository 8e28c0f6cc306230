pub mod apikey;
pub mod basicauth;
pub mod cors;
pub mod headers;
pub mod jwt;
pub mod transformation;

pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};
use http_body_util::BodyExt;

use crate::*;

pub mod x_headers {
	use http::HeaderName;

	pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
	pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
	pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
	pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
	pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
	pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
	pub const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
	pub const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");
}

/// Bodies buffered by the policy chain are capped; anything larger is treated
/// as a client error by the caller.
pub const MAX_BUFFERED_BODY: usize = 2_097_152;

pub async fn to_bytes(body: Body) -> anyhow::Result<Bytes> {
	let limited = http_body_util::Limited::new(body, MAX_BUFFERED_BODY);
	let collected = limited
		.collect()
		.await
		.map_err(|e| anyhow::anyhow!("failed to buffer body: {e}"))?;
	Ok(collected.to_bytes())
}

pub async fn inspect_body(body: &mut Body) -> anyhow::Result<Bytes> {
	let orig = std::mem::replace(body, Body::empty());
	let bytes = to_bytes(orig).await?;
	*body = Body::from(bytes.clone());
	Ok(bytes)
}

pub fn merge_in_headers(additional_headers: Option<HeaderMap>, dest: &mut HeaderMap) {
	if let Some(rh) = additional_headers {
		for (k, v) in rh.into_iter() {
			let Some(k) = k else { continue };
			dest.insert(k, v);
		}
	}
}
