pub mod chain;

use serde_json::Value;

use crate::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use crate::*;

/// Well-known metadata keys. The metadata map is the only channel policies
/// have to communicate across phases and with each other.
pub mod meta {
	pub const AUTH_SUCCESS: &str = "auth.success";
	pub const AUTH_METHOD: &str = "auth.method";
	pub const AUTH_USERNAME: &str = "auth.username";
	pub const SEMANTIC_CACHE_EMBEDDING: &str = "semantic_cache.embedding";
	pub const PII_ENTITIES: &str = "pii.entities";
	pub const MODEL_SELECTED: &str = "model.selected";
	pub const MODEL_ORIGINAL: &str = "model.original";
	pub const CORS_HEADERS: &str = "cors_headers";
	pub const CORS_STRIP: &str = "cors_strip";
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderMode {
	Skip,
	#[default]
	Process,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BodyMode {
	#[default]
	Skip,
	Buffer,
}

/// Declares which parts of the transaction a policy needs. The chain fuses
/// these over all attached policies to decide what the host must buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcessingMode {
	#[serde(default)]
	pub request_header: HeaderMode,
	#[serde(default)]
	pub request_body: BodyMode,
	#[serde(default)]
	pub response_header: HeaderMode,
	#[serde(default)]
	pub response_body: BodyMode,
}

impl ProcessingMode {
	pub const fn passthrough() -> Self {
		ProcessingMode {
			request_header: HeaderMode::Skip,
			request_body: BodyMode::Skip,
			response_header: HeaderMode::Skip,
			response_body: BodyMode::Skip,
		}
	}

	pub const fn request_only() -> Self {
		ProcessingMode {
			request_header: HeaderMode::Process,
			request_body: BodyMode::Skip,
			response_header: HeaderMode::Skip,
			response_body: BodyMode::Skip,
		}
	}

	pub const fn buffered_request() -> Self {
		ProcessingMode {
			request_header: HeaderMode::Process,
			request_body: BodyMode::Buffer,
			response_header: HeaderMode::Skip,
			response_body: BodyMode::Skip,
		}
	}

	pub const fn buffered_response() -> Self {
		ProcessingMode {
			request_header: HeaderMode::Skip,
			request_body: BodyMode::Skip,
			response_header: HeaderMode::Process,
			response_body: BodyMode::Buffer,
		}
	}

	pub const fn buffered_bidirectional() -> Self {
		ProcessingMode {
			request_header: HeaderMode::Process,
			request_body: BodyMode::Buffer,
			response_header: HeaderMode::Process,
			response_body: BodyMode::Buffer,
		}
	}

	/// The strongest of two modes, per direction.
	pub fn union(self, other: Self) -> Self {
		fn hm(a: HeaderMode, b: HeaderMode) -> HeaderMode {
			if a == HeaderMode::Process || b == HeaderMode::Process {
				HeaderMode::Process
			} else {
				HeaderMode::Skip
			}
		}
		fn bm(a: BodyMode, b: BodyMode) -> BodyMode {
			if a == BodyMode::Buffer || b == BodyMode::Buffer {
				BodyMode::Buffer
			} else {
				BodyMode::Skip
			}
		}
		ProcessingMode {
			request_header: hm(self.request_header, other.request_header),
			request_body: bm(self.request_body, other.request_body),
			response_header: hm(self.response_header, other.response_header),
			response_body: bm(self.response_body, other.response_body),
		}
	}
}

/// Identity of the route a transaction matched. Created by the host, read by
/// policies for key derivation and namespacing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteIdentity {
	pub api_id: Strng,
	pub api_name: Strng,
	pub api_version: Strng,
	pub operation_path: Strng,
	#[serde(serialize_with = "ser_display")]
	pub method: Method,
}

impl RouteIdentity {
	/// The `name:version` namespace used for cache isolation.
	pub fn namespace(&self) -> Strng {
		strng::format!("{}:{}", self.api_name, self.api_version)
	}
}

/// The per-request key→value channel shared by every policy on the chain,
/// in both phases.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
	pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		self.0.insert(key.into(), value.into());
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn get_bool(&self, key: &str) -> Option<bool> {
		self.0.get(key).and_then(Value::as_bool)
	}

	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(Value::as_str)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.0.contains_key(key)
	}

	pub fn take(&mut self, key: &str) -> Option<Value> {
		self.0.remove(key)
	}
}

/// A fully buffered body. Policies that declared `BodyMode::Buffer` are always
/// handed a complete body, never a partial one.
#[derive(Debug, Clone)]
pub struct BufferedBody {
	pub bytes: Bytes,
	pub end_of_stream: bool,
}

impl BufferedBody {
	pub fn complete(bytes: impl Into<Bytes>) -> Self {
		BufferedBody {
			bytes: bytes.into(),
			end_of_stream: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Request,
	Response,
}

impl Display for Phase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Phase::Request => f.write_str("request"),
			Phase::Response => f.write_str("response"),
		}
	}
}

/// The view of the in-flight transaction a handler receives. Headers reflect
/// mutations accumulated from earlier policies on the chain; the body is only
/// present for policies that asked for it.
pub struct PolicyContext<'a> {
	pub request_id: Strng,
	pub route: &'a RouteIdentity,
	pub metadata: &'a mut Metadata,
	pub headers: &'a HeaderMap,
	pub body: Option<&'a BufferedBody>,
	/// Concrete request path (not the route template), as received or as
	/// rewritten by an earlier policy.
	pub path: Option<&'a str>,
	/// Raw query string of the request, without the leading `?`.
	pub query: Option<&'a str>,
	/// Upstream status; only present in the response phase.
	pub status: Option<StatusCode>,
}

impl PolicyContext<'_> {
	pub fn body_bytes(&self) -> &[u8] {
		self.body.map(|b| b.bytes.as_ref()).unwrap_or_default()
	}

	pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}
}

/// Header mutations a handler wants applied to the stream. Set replaces,
/// add appends, remove deletes (missing names are a no-op).
#[derive(Debug, Default, Clone)]
pub struct HeaderMutations {
	pub set: Vec<(HeaderName, HeaderValue)>,
	pub remove: Vec<HeaderName>,
	pub add: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderMutations {
	pub fn is_empty(&self) -> bool {
		self.set.is_empty() && self.remove.is_empty() && self.add.is_empty()
	}

	pub fn with_set(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.set.push((name, value));
		self
	}

	pub fn with_add(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.add.push((name, value));
		self
	}

	pub fn with_remove(mut self, name: HeaderName) -> Self {
		self.remove.push(name);
		self
	}

	pub fn apply(&self, headers: &mut HeaderMap) {
		for (k, v) in &self.set {
			headers.insert(k.clone(), v.clone());
		}
		for k in &self.remove {
			headers.remove(k);
		}
		for (k, v) in &self.add {
			headers.append(k.clone(), v.clone());
		}
	}

	pub fn merge(&mut self, other: HeaderMutations) {
		self.set.extend(other.set);
		self.remove.extend(other.remove);
		self.add.extend(other.add);
	}
}

/// Mutations forwarded to the upstream request.
#[derive(Debug, Default)]
pub struct RequestModifications {
	pub headers: HeaderMutations,
	pub body: Option<Bytes>,
	/// Replacement for the request `:path` (including any query).
	pub path: Option<String>,
}

/// Mutations applied to the downstream response.
#[derive(Debug, Default)]
pub struct ResponseModifications {
	pub headers: HeaderMutations,
	pub body: Option<Bytes>,
	pub status: Option<StatusCode>,
}

/// A synthesized response that ends the phase: no upstream call in the request
/// phase, replacement of the upstream body in the response phase.
#[derive(Debug)]
pub struct ImmediateResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl ImmediateResponse {
	pub fn new(status: StatusCode) -> Self {
		ImmediateResponse {
			status,
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();
		self
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);
		self
	}

	pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Self {
		let bytes = serde_json::to_vec(body).unwrap_or_default();
		ImmediateResponse::new(status)
			.with_header(
				header::CONTENT_TYPE,
				HeaderValue::from_static("application/json"),
			)
			.with_body(bytes)
	}

	pub fn into_response(self) -> crate::http::Response {
		let mut rb = ::http::Response::builder().status(self.status);
		if let Some(hm) = rb.headers_mut() {
			*hm = self.headers;
		}
		rb.body(crate::http::Body::from(self.body))
			.unwrap_or_else(|_| {
				::http::Response::builder()
					.status(StatusCode::INTERNAL_SERVER_ERROR)
					.body(crate::http::Body::empty())
					.expect("static response should build")
			})
	}
}

#[derive(Debug)]
#[must_use]
pub enum RequestAction {
	Modify(RequestModifications),
	Direct(ImmediateResponse),
}

impl RequestAction {
	/// No mutations, continue the chain.
	pub fn pass() -> Self {
		RequestAction::Modify(RequestModifications::default())
	}
}

#[derive(Debug)]
#[must_use]
pub enum ResponseAction {
	Modify(ResponseModifications),
	Direct(ImmediateResponse),
}

impl ResponseAction {
	pub fn pass() -> Self {
		ResponseAction::Modify(ResponseModifications::default())
	}
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
	/// An external collaborator (Redis, embedding provider, moderation API)
	/// failed. The chain applies the policy's fail-open/fail-closed setting.
	#[error("dependency failure: {0}")]
	Dependency(#[source] anyhow::Error),
	#[error("policy failure: {0}")]
	Internal(#[from] anyhow::Error),
}

/// A policy is a long-lived singleton per route+configuration, invoked
/// concurrently across requests. Handlers must not hold unsynchronized
/// mutable state.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
	fn name(&self) -> Strng;

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::default()
	}

	/// When true, a handler failure rejects the transaction instead of being
	/// treated as a no-op. Auth policies set this.
	fn fail_closed(&self) -> bool {
		false
	}

	async fn on_request(&self, _ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		Ok(RequestAction::pass())
	}

	async fn on_response(&self, _ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		Ok(ResponseAction::pass())
	}
}
