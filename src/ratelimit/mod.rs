pub mod cost;
pub mod fixed_window;
pub mod gcra;
pub mod memory;
pub mod redis;

use std::time::UNIX_EPOCH;

use crate::http::{HeaderValue, StatusCode, x_headers};
use crate::policy::{
	HeaderMutations, ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode,
	RequestAction, RequestModifications, ResponseAction,
};
use crate::ratelimit::fixed_window::{FixedWindow, WindowDecision};
use crate::ratelimit::gcra::{Gcra, GcraDecision};
use crate::*;

pub(crate) fn now_nanos() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos() as u64
}

fn nanos_to_system(n: u64) -> SystemTime {
	UNIX_EPOCH + Duration::from_nanos(n)
}

#[derive(Debug, thiserror::Error)]
pub enum LimitError {
	#[error("rate limit store unavailable: {0}")]
	Store(#[source] anyhow::Error),
}

/// The outcome of one rate limit decision, rich enough to drive both header
/// emission and clamp-mode accounting.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
	pub allowed: bool,
	pub requested: u64,
	pub consumed: u64,
	pub overflow: u64,
	pub limit: u64,
	pub remaining: u64,
	pub reset: SystemTime,
	pub retry_after: Duration,
	/// When the full burst is available again. GCRA only.
	pub full_quota_at: Option<SystemTime>,
	pub duration: Duration,
	pub policy: Strng,
}

/// Atomic quota operations. `allow_n` is all-or-nothing; `consume_or_clamp_n`
/// takes whatever capacity is left; `peek` never writes. Implementations must
/// be safe to share across requests and `close` must be idempotent.
#[async_trait::async_trait]
pub trait Limiter: Send + Sync {
	async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError>;
	async fn consume_or_clamp_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError>;
	async fn peek(&self, key: &str) -> Result<RateLimitResult, LimitError>;
	async fn close(&self);
}

#[apply(schema!)]
#[derive(Default, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
	#[serde(rename = "gcra")]
	Gcra,
	#[default]
	#[serde(rename = "fixed-window", alias = "fixedWindow")]
	FixedWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
	Gcra(Gcra),
	FixedWindow(FixedWindow),
}

impl Algorithm {
	pub fn limit(&self) -> u64 {
		match self {
			Algorithm::Gcra(g) => g.limit,
			Algorithm::FixedWindow(f) => f.limit,
		}
	}

	pub fn duration(&self) -> Duration {
		match self {
			Algorithm::Gcra(g) => g.duration,
			Algorithm::FixedWindow(f) => f.duration,
		}
	}
}

#[apply(schema!)]
#[derive(Copy, PartialEq, Eq)]
pub struct QuotaSettings {
	#[serde(alias = "requests")]
	pub limit: u64,
	#[serde(with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub duration: Duration,
	/// Extra headroom for short spikes; GCRA only. Defaults to the limit.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub burst: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidQuota {
	#[error("limit must be at least 1")]
	ZeroLimit,
	#[error("duration must be positive")]
	ZeroDuration,
	#[error("burst must be at least 1")]
	ZeroBurst,
	#[error("duration too short for limit: emission interval rounds to zero")]
	IntervalTooShort,
}

/// One validated quota: the algorithm with its parameters plus the
/// `RateLimit-Policy` description advertised to clients.
#[derive(Debug, Clone)]
pub struct Quota {
	pub algorithm: Algorithm,
	pub policy: Strng,
}

impl Quota {
	pub fn new(kind: AlgorithmKind, s: &QuotaSettings) -> Result<Self, InvalidQuota> {
		if s.limit == 0 {
			return Err(InvalidQuota::ZeroLimit);
		}
		if s.duration.is_zero() {
			return Err(InvalidQuota::ZeroDuration);
		}
		let policy = strng::format!("{};w={}", s.limit, s.duration.as_secs().max(1));
		let algorithm = match kind {
			AlgorithmKind::Gcra => {
				let burst = s.burst.unwrap_or(s.limit);
				if burst == 0 {
					return Err(InvalidQuota::ZeroBurst);
				}
				let g = Gcra {
					limit: s.limit,
					duration: s.duration,
					burst,
				};
				if g.emission_interval() == 0 {
					return Err(InvalidQuota::IntervalTooShort);
				}
				Algorithm::Gcra(g)
			},
			AlgorithmKind::FixedWindow => Algorithm::FixedWindow(FixedWindow {
				limit: s.limit,
				duration: s.duration,
			}),
		};
		Ok(Quota { algorithm, policy })
	}

	pub(crate) fn result_from_gcra(&self, requested: u64, now: u64, d: GcraDecision) -> RateLimitResult {
		RateLimitResult {
			allowed: d.allowed,
			requested,
			consumed: d.consumed,
			overflow: requested - d.consumed,
			limit: self.algorithm.limit(),
			remaining: d.remaining,
			reset: nanos_to_system(d.full_quota_at),
			retry_after: d.retry_after,
			full_quota_at: Some(nanos_to_system(d.full_quota_at)),
			duration: self.algorithm.duration(),
			policy: self.policy.clone(),
		}
	}

	pub(crate) fn result_from_window(
		&self,
		requested: u64,
		_now: u64,
		d: WindowDecision,
	) -> RateLimitResult {
		RateLimitResult {
			allowed: d.allowed,
			requested,
			consumed: d.consumed,
			overflow: requested - d.consumed,
			limit: self.algorithm.limit(),
			remaining: d.remaining,
			reset: nanos_to_system(d.reset),
			retry_after: d.retry_after,
			full_quota_at: None,
			duration: self.algorithm.duration(),
			policy: self.policy.clone(),
		}
	}
}

/// Appends a request attribute to the rate limit key.
#[apply(schema!)]
pub enum KeyExtractor {
	/// The API name from the route identity.
	ApiName {},
	/// The authenticated username, when an auth policy recorded one.
	User {},
	/// A request header value.
	Header { name: String },
	/// A query parameter value.
	QueryParam { name: String },
}

impl KeyExtractor {
	fn extract(&self, ctx: &PolicyContext<'_>) -> String {
		match self {
			KeyExtractor::ApiName {} => ctx.route.api_name.to_string(),
			KeyExtractor::User {} => ctx
				.metadata
				.get_str(crate::policy::meta::AUTH_USERNAME)
				.unwrap_or_default()
				.to_string(),
			KeyExtractor::Header { name } => ctx
				.headers
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default()
				.to_string(),
			KeyExtractor::QueryParam { name } => ctx
				.query
				.map(|q| {
					url::form_urlencoded::parse(q.as_bytes())
						.find(|(k, _)| k == name.as_str())
						.map(|(_, v)| v.into_owned())
						.unwrap_or_default()
				})
				.unwrap_or_default(),
		}
	}
}

/// Derive the logical key for a request: the route identity plus any
/// configured extractors. Quota index prefixes are added by the policy so
/// quotas never collide.
pub fn derive_key(ctx: &PolicyContext<'_>, extractors: &[KeyExtractor]) -> Strng {
	let mut key = format!(
		"{}:{}:{}",
		ctx.route.api_id, ctx.route.operation_path, ctx.route.method
	);
	for e in extractors {
		key.push(':');
		key.push_str(&e.extract(ctx));
	}
	strng::new(key)
}

#[apply(schema_de!)]
pub enum BackendSettings {
	Memory(memory::MemorySettings),
	Redis(redis::RedisSettings),
}

impl Default for BackendSettings {
	fn default() -> Self {
		BackendSettings::Memory(memory::MemorySettings::default())
	}
}

#[apply(schema_de!)]
pub struct RateLimitSerde {
	pub limits: Vec<QuotaSettings>,
	#[serde(default)]
	pub algorithm: AlgorithmKind,
	#[serde(default)]
	pub backend: BackendSettings,
	#[serde(default)]
	pub key: Vec<KeyExtractor>,
	#[serde(default)]
	pub cost: Option<cost::TokenCostSerde>,
}

/// The rate limit policy: one limiter per configured quota, a shared key
/// derivation, and standard header emission. Construction validates every
/// quota and establishes backend connections.
pub struct RateLimit {
	quotas: Vec<(Quota, Arc<dyn Limiter>)>,
	key: Vec<KeyExtractor>,
	cost: Option<cost::TokenCost>,
	fail_open: bool,
}

impl Debug for RateLimit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RateLimit")
			.field("quotas", &self.quotas.len())
			.finish()
	}
}

const META_KEY: &str = "ratelimit.key";

impl RateLimit {
	pub async fn build(config: RateLimitSerde) -> anyhow::Result<Self> {
		if config.limits.is_empty() {
			anyhow::bail!("rate limit requires at least one quota");
		}
		let mut quotas = Vec::with_capacity(config.limits.len());
		let fail_open = match &config.backend {
			BackendSettings::Memory(_) => true,
			BackendSettings::Redis(r) => r.failure_mode == redis::FailureMode::Open,
		};
		for (i, settings) in config.limits.iter().enumerate() {
			let quota = Quota::new(config.algorithm, settings)
				.with_context(|| format!("limits[{i}] is invalid"))?;
			let limiter: Arc<dyn Limiter> = match &config.backend {
				BackendSettings::Memory(m) => Arc::new(memory::MemoryLimiter::new(quota.clone(), *m)),
				BackendSettings::Redis(r) => {
					Arc::new(redis::RedisLimiter::connect(quota.clone(), r.clone()).await?)
				},
			};
			quotas.push((quota, limiter));
		}
		Ok(RateLimit {
			quotas,
			key: config.key,
			cost: config.cost.map(cost::TokenCost::from),
			fail_open,
		})
	}

	/// Close backend handles. Safe to call more than once.
	pub async fn shutdown(&self) {
		for (_, l) in &self.quotas {
			l.close().await;
		}
	}

	fn headers_for(result: &RateLimitResult) -> HeaderMutations {
		let now = SystemTime::now();
		let reset_unix = result
			.reset
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		let reset_in = result
			.reset
			.duration_since(now)
			.unwrap_or_default()
			.as_secs();
		let mut m = HeaderMutations::default()
			.with_set(x_headers::X_RATELIMIT_LIMIT, int_header(result.limit))
			.with_set(x_headers::X_RATELIMIT_REMAINING, int_header(result.remaining))
			.with_set(x_headers::X_RATELIMIT_RESET, int_header(reset_unix))
			.with_set(x_headers::RATELIMIT_LIMIT, int_header(result.limit))
			.with_set(x_headers::RATELIMIT_REMAINING, int_header(result.remaining))
			.with_set(x_headers::RATELIMIT_RESET, int_header(reset_in));
		if let Ok(v) = HeaderValue::from_str(&result.policy) {
			m = m.with_set(x_headers::RATELIMIT_POLICY, v);
		}
		if !result.allowed {
			m = m.with_set(
				crate::http::header::RETRY_AFTER,
				int_header(result.retry_after.as_secs().max(1)),
			);
		}
		m
	}

	fn denied_response(result: &RateLimitResult) -> ImmediateResponse {
		let mut resp = ImmediateResponse::json(
			StatusCode::TOO_MANY_REQUESTS,
			&serde_json::json!({
				"error": "rate_limit_exceeded",
				"message": "Rate limit exceeded",
			}),
		);
		Self::headers_for(result).apply(&mut resp.headers);
		resp
	}
}

fn int_header(v: u64) -> HeaderValue {
	HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[async_trait::async_trait]
impl Policy for RateLimit {
	fn name(&self) -> Strng {
		strng::literal!("ratelimit")
	}

	fn mode(&self) -> ProcessingMode {
		if self.cost.is_some() {
			// the token cost extractor reads the upstream response body
			ProcessingMode::request_only().union(ProcessingMode::buffered_response())
		} else {
			ProcessingMode::request_only()
		}
	}

	fn fail_closed(&self) -> bool {
		!self.fail_open
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let base = derive_key(ctx, &self.key);
		ctx.metadata.set(META_KEY, base.to_string());

		let mut most_restrictive: Option<RateLimitResult> = None;
		for (i, (_, limiter)) in self.quotas.iter().enumerate() {
			let key = format!("q{i}:{base}");
			let result = match limiter.allow_n(&key, 1).await {
				Ok(r) => r,
				Err(err) => {
					if self.fail_open {
						warn!(%err, key = %base, "rate limit store failed, allowing request");
						continue;
					}
					return Err(PolicyError::Dependency(err.into()));
				},
			};
			if !result.allowed {
				debug!(key = %base, quota = i, "rate limit exceeded");
				return Ok(RequestAction::Direct(Self::denied_response(&result)));
			}
			let tighter = most_restrictive
				.as_ref()
				.map(|b| result.remaining < b.remaining)
				.unwrap_or(true);
			if tighter {
				most_restrictive = Some(result);
			}
		}
		Ok(match most_restrictive {
			Some(result) => RequestAction::Modify(RequestModifications {
				headers: Self::headers_for(&result),
				..Default::default()
			}),
			None => RequestAction::pass(),
		})
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		let Some(cost) = &self.cost else {
			return Ok(ResponseAction::pass());
		};
		let Some(base) = ctx.metadata.get_str(META_KEY).map(str::to_string) else {
			return Ok(ResponseAction::pass());
		};
		let units = cost.extract(ctx.headers, ctx.body_bytes());
		// The request already paid 1 on the way in.
		let true_up = units.saturating_sub(1);
		if true_up == 0 {
			return Ok(ResponseAction::pass());
		}
		for (i, (_, limiter)) in self.quotas.iter().enumerate() {
			let key = format!("q{i}:{base}");
			if let Err(err) = limiter.consume_or_clamp_n(&key, true_up).await {
				warn!(%err, key = %base, "token cost true-up failed");
			}
		}
		Ok(ResponseAction::pass())
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
			api_name: strng::literal!("orders"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/orders"),
			method: ::http::Method::GET,
		}
	}

	fn config(json: serde_json::Value) -> RateLimitSerde {
		serde_json::from_value(json).unwrap()
	}

	#[tokio::test]
	async fn denies_with_429_and_headers() {
		let rl = RateLimit::build(config(serde_json::json!({
			"limits": [{"limit": 1, "duration": "1m"}],
		})))
		.await
		.unwrap();
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r1"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let first = rl.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = first else {
			panic!("first request should pass");
		};
		assert!(
			m.headers
				.set
				.iter()
				.any(|(k, v)| k == &x_headers::X_RATELIMIT_REMAINING && v == "0")
		);

		let second = rl.on_request(&mut ctx).await.unwrap();
		let RequestAction::Direct(resp) = second else {
			panic!("second request should be limited");
		};
		assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
		assert!(resp.headers.contains_key(crate::http::header::RETRY_AFTER));
		assert!(resp.headers.contains_key(x_headers::RATELIMIT_POLICY));
		rl.shutdown().await;
	}

	#[tokio::test]
	async fn quotas_use_distinct_keys() {
		// Two quotas with the same shape must not share counters.
		let rl = RateLimit::build(config(serde_json::json!({
			"limits": [
				{"limit": 2, "duration": "1m"},
				{"limit": 2, "duration": "1m"},
			],
		})))
		.await
		.unwrap();
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r2"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let a1 = rl.on_request(&mut ctx).await.unwrap();
		assert!(matches!(a1, RequestAction::Modify(_)));
		let a2 = rl.on_request(&mut ctx).await.unwrap();
		assert!(matches!(a2, RequestAction::Modify(_)));
		let a3 = rl.on_request(&mut ctx).await.unwrap();
		assert!(matches!(a3, RequestAction::Direct(_)));
		rl.shutdown().await;
	}

	#[tokio::test]
	async fn key_extractors_partition_clients() {
		let rl = RateLimit::build(config(serde_json::json!({
			"limits": [{"limit": 1, "duration": "1m"}],
			"key": [{"header": {"name": "x-user"}}],
		})))
		.await
		.unwrap();
		let route = route();

		for user in ["alice", "bob"] {
			let mut md = Metadata::default();
			let mut headers = HeaderMap::new();
			headers.insert("x-user", HeaderValue::from_str(user).unwrap());
			let mut ctx = PolicyContext {
				request_id: strng::literal!("r3"),
				route: &route,
				metadata: &mut md,
				headers: &headers,
				body: None,
				path: None,
				query: None,
				status: None,
			};
			let action = rl.on_request(&mut ctx).await.unwrap();
			assert!(matches!(action, RequestAction::Modify(_)), "{user} blocked");
		}
		rl.shutdown().await;
	}

	#[tokio::test]
	async fn token_cost_true_up_consumes_from_quota() {
		let rl = RateLimit::build(config(serde_json::json!({
			"limits": [{"limit": 10, "duration": "1m"}],
			"cost": {"jsonPath": "usage.total_tokens", "default": 1},
		})))
		.await
		.unwrap();
		assert_eq!(
			rl.mode().response_body,
			crate::policy::BodyMode::Buffer
		);
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r4"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let _ = rl.on_request(&mut ctx).await.unwrap();

		let body = BufferedBody::complete(r#"{"usage":{"total_tokens":6}}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r4"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: Some(StatusCode::OK),
		};
		let _ = rl.on_response(&mut ctx).await.unwrap();

		// 1 on request + 5 true-up leaves 4 of 10
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r5"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let action = rl.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!("should pass")
		};
		assert!(
			m.headers
				.set
				.iter()
				.any(|(k, v)| k == &x_headers::X_RATELIMIT_REMAINING && v == "3")
		);
		rl.shutdown().await;
	}
}
