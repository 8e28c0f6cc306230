use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use regex::Regex;

use crate::http::{HeaderName, HeaderValue, StatusCode};
use crate::jsonpath::JsonPath;
use crate::policy::{
	HeaderMutations, ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode,
	RequestAction, RequestModifications, ResponseAction, meta,
};
use crate::*;

#[apply(schema_de!)]
pub struct WeightedModel {
	pub name: Strng,
	#[serde(default = "default_weight")]
	pub weight: u32,
}

fn default_weight() -> u32 {
	1
}

#[apply(schema_de!)]
#[derive(Default, Copy, PartialEq, Eq)]
pub enum RouterStrategy {
	#[default]
	RoundRobin,
	Weighted,
}

/// Where the model name lives in the request, and therefore what gets
/// rewritten after selection.
#[apply(schema_de!)]
pub enum ModelLocation {
	/// A field inside the JSON body.
	Payload { path: JsonPath },
	/// A request header.
	Header { name: String },
	/// A query parameter; the rewrite replaces it within the path.
	QueryParam { name: String },
	/// A capturing-group regex over the request path; group 1 is the model.
	PathParam {
		#[serde(with = "serde_regex")]
		#[cfg_attr(feature = "schema", schemars(with = "String"))]
		pattern: Regex,
	},
}

impl Default for ModelLocation {
	fn default() -> Self {
		ModelLocation::Payload {
			path: JsonPath::parse("model").expect("static path parses"),
		}
	}
}

#[apply(schema_de!)]
pub struct ModelRouterSerde {
	#[serde(default)]
	pub strategy: RouterStrategy,
	pub models: Vec<WeightedModel>,
	#[serde(default)]
	pub location: ModelLocation,
	/// How long to bench a model after an upstream failure; 0 disables
	/// suspension.
	#[serde(default, with = "serde_dur_option")]
	#[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
	pub suspend_duration: Option<Duration>,
}

/// Marks models unavailable for a period after upstream failures. The
/// in-process implementation is instance-local; a distributed deployment can
/// supply a shared store.
pub trait SuspensionStore: Send + Sync {
	fn suspend(&self, model: &Strng, until: Instant);
	fn is_suspended(&self, model: &Strng) -> bool;
}

#[derive(Default)]
pub struct InProcessSuspension {
	until: Mutex<HashMap<Strng, Instant>>,
}

impl SuspensionStore for InProcessSuspension {
	fn suspend(&self, model: &Strng, until: Instant) {
		self.until.lock().insert(model.clone(), until);
	}

	fn is_suspended(&self, model: &Strng) -> bool {
		let mut map = self.until.lock();
		match map.get(model) {
			Some(until) if *until > Instant::now() => true,
			Some(_) => {
				map.remove(model);
				false
			},
			None => false,
		}
	}
}

/// Routes requests across upstream models. The selection sequence is fixed at
/// construction (round-robin order, or the weight-expanded sequence); the
/// cursor advances by one per request and suspended models are skipped.
pub struct ModelRouter {
	sequence: Vec<Strng>,
	cursor: AtomicUsize,
	location: ModelLocation,
	suspend_duration: Option<Duration>,
	suspension: Arc<dyn SuspensionStore>,
}

impl Debug for ModelRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ModelRouter")
			.field("sequence", &self.sequence)
			.finish()
	}
}

impl ModelRouter {
	pub fn new(config: ModelRouterSerde) -> anyhow::Result<Self> {
		Self::with_suspension(config, Arc::new(InProcessSuspension::default()))
	}

	pub fn with_suspension(
		config: ModelRouterSerde,
		suspension: Arc<dyn SuspensionStore>,
	) -> anyhow::Result<Self> {
		if config.models.is_empty() {
			anyhow::bail!("model router requires at least one model");
		}
		if config.models.iter().any(|m| m.weight == 0) {
			anyhow::bail!("model weights must be at least 1");
		}
		let sequence = match config.strategy {
			RouterStrategy::RoundRobin => config.models.iter().map(|m| m.name.clone()).collect(),
			RouterStrategy::Weighted => config
				.models
				.iter()
				.flat_map(|m| std::iter::repeat_n(m.name.clone(), m.weight as usize))
				.collect::<Vec<_>>(),
		};
		Ok(ModelRouter {
			sequence,
			cursor: AtomicUsize::new(0),
			location: config.location,
			suspend_duration: config.suspend_duration.filter(|d| !d.is_zero()),
			suspension,
		})
	}

	/// The next non-suspended model. The cursor advances exactly once per
	/// call; suspended entries are scanned over without consuming it again.
	fn select(&self) -> Option<Strng> {
		let base = self.cursor.fetch_add(1, Ordering::Relaxed);
		for offset in 0..self.sequence.len() {
			let candidate = &self.sequence[(base + offset) % self.sequence.len()];
			if !self.suspension.is_suspended(candidate) {
				return Some(candidate.clone());
			}
		}
		None
	}

	fn extract_original(&self, ctx: &PolicyContext<'_>) -> Option<String> {
		match &self.location {
			ModelLocation::Payload { path } => path.extract(ctx.body_bytes()).ok(),
			ModelLocation::Header { name } => ctx
				.headers
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.map(str::to_string),
			ModelLocation::QueryParam { name } => ctx.query.and_then(|q| {
				url::form_urlencoded::parse(q.as_bytes())
					.find(|(k, _)| k == name.as_str())
					.map(|(_, v)| v.into_owned())
			}),
			ModelLocation::PathParam { pattern } => ctx
				.path
				.and_then(|p| pattern.captures(p))
				.and_then(|c| c.get(1))
				.map(|m| m.as_str().to_string()),
		}
	}

	fn rewrite(
		&self,
		ctx: &PolicyContext<'_>,
		selected: &Strng,
	) -> Result<RequestModifications, PolicyError> {
		let mut m = RequestModifications::default();
		match &self.location {
			ModelLocation::Payload { path } => {
				let body = path
					.update(ctx.body_bytes(), selected)
					.map_err(|e| PolicyError::Internal(e.into()))?;
				m.body = Some(body);
			},
			ModelLocation::Header { name } => {
				let name = HeaderName::from_bytes(name.as_bytes())
					.map_err(|e| PolicyError::Internal(e.into()))?;
				let value = HeaderValue::from_str(selected)
					.map_err(|e| PolicyError::Internal(e.into()))?;
				m.headers = HeaderMutations::default().with_set(name, value);
			},
			ModelLocation::QueryParam { name } => {
				let base = ctx.path.unwrap_or("/");
				let path_only = base.split('?').next().unwrap_or(base);
				let rewritten = url::form_urlencoded::Serializer::new(String::new())
					.extend_pairs(
						ctx
							.query
							.map(|q| {
								url::form_urlencoded::parse(q.as_bytes())
									.map(|(k, v)| {
										if k == name.as_str() {
											(k.into_owned(), selected.to_string())
										} else {
											(k.into_owned(), v.into_owned())
										}
									})
									.collect::<Vec<_>>()
							})
							.unwrap_or_default(),
					)
					.finish();
				m.path = Some(format!("{path_only}?{rewritten}"));
			},
			ModelLocation::PathParam { pattern } => {
				let path = ctx.path.unwrap_or("/");
				let Some(c) = pattern.captures(path).filter(|c| c.get(1).is_some()) else {
					return Err(PolicyError::Internal(anyhow::anyhow!(
						"path {path:?} does not match the model pattern"
					)));
				};
				let g = c.get(1).expect("checked above");
				let mut new_path = path.to_string();
				new_path.replace_range(g.range(), selected);
				m.path = Some(new_path);
			},
		}
		Ok(m)
	}
}

#[async_trait::async_trait]
impl Policy for ModelRouter {
	fn name(&self) -> Strng {
		strng::literal!("model-router")
	}

	fn mode(&self) -> ProcessingMode {
		match self.location {
			ModelLocation::Payload { .. } => {
				ProcessingMode::buffered_request().union(ProcessingMode {
					response_header: crate::policy::HeaderMode::Process,
					..ProcessingMode::passthrough()
				})
			},
			_ => ProcessingMode {
				request_header: crate::policy::HeaderMode::Process,
				response_header: crate::policy::HeaderMode::Process,
				..ProcessingMode::passthrough()
			},
		}
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let Some(selected) = self.select() else {
			debug!("all models suspended");
			return Ok(RequestAction::Direct(
				ImmediateResponse::new(StatusCode::SERVICE_UNAVAILABLE)
					.with_body("All models are currently unavailable"),
			));
		};
		if let Some(original) = self.extract_original(ctx) {
			ctx.metadata.set(meta::MODEL_ORIGINAL, original);
		}
		ctx.metadata.set(meta::MODEL_SELECTED, selected.to_string());
		let m = self.rewrite(ctx, &selected)?;
		Ok(RequestAction::Modify(m))
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		let Some(duration) = self.suspend_duration else {
			return Ok(ResponseAction::pass());
		};
		let failed = ctx
			.status
			.map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
			.unwrap_or(false);
		if failed && let Some(selected) = ctx.metadata.get_str(meta::MODEL_SELECTED) {
			let model = strng::new(selected);
			warn!(%model, status = ?ctx.status, "suspending model after upstream failure");
			self.suspension.suspend(&model, Instant::now() + duration);
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
			api_name: strng::literal!("chat"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/chat"),
			method: ::http::Method::POST,
		}
	}

	fn weighted() -> ModelRouter {
		ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"strategy": "weighted",
				"models": [
					{"name": "gpt-4", "weight": 2},
					{"name": "gpt-35", "weight": 1},
				],
				"suspendDuration": "30s",
			}))
			.unwrap(),
		)
		.unwrap()
	}

	async fn request_model(r: &ModelRouter, md: &mut Metadata) -> String {
		let route = route();
		let headers = HeaderMap::new();
		let body = BufferedBody::complete(r#"{"model":"x"}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: None,
		};
		let action = r.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!("expected rewrite");
		};
		let body = m.body.expect("payload rewrite");
		let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
		v["model"].as_str().unwrap().to_string()
	}

	#[tokio::test]
	async fn weighted_sequence_is_deterministic() {
		let r = weighted();
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "gpt-4");
		assert_eq!(md.get_str(meta::MODEL_ORIGINAL), Some("x"));
		assert_eq!(md.get_str(meta::MODEL_SELECTED), Some("gpt-4"));
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "gpt-4");
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "gpt-35");
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "gpt-4");
	}

	#[tokio::test]
	async fn upstream_failure_suspends_selected_model() {
		let r = weighted();
		let route = route();
		let headers = HeaderMap::new();

		let mut md = Metadata::default();
		let first = request_model(&r, &mut md).await;
		assert_eq!(first, "gpt-4");

		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: Some(StatusCode::TOO_MANY_REQUESTS),
		};
		let _ = r.on_response(&mut ctx).await.unwrap();

		// gpt-4 is benched; every selection lands on gpt-35
		for _ in 0..3 {
			let mut md = Metadata::default();
			assert_eq!(request_model(&r, &mut md).await, "gpt-35");
		}
	}

	#[tokio::test]
	async fn all_suspended_yields_503() {
		let r = ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"models": [{"name": "only"}],
				"suspendDuration": "30s",
			}))
			.unwrap(),
		)
		.unwrap();
		r.suspension
			.suspend(&strng::literal!("only"), Instant::now() + Duration::from_secs(60));
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let body = BufferedBody::complete(r#"{"model":"x"}"#);
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: Some(&body),
			path: None,
			query: None,
			status: None,
		};
		let action = r.on_request(&mut ctx).await.unwrap();
		let RequestAction::Direct(resp) = action else {
			panic!("expected 503");
		};
		assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(resp.body, "All models are currently unavailable");
	}

	#[tokio::test]
	async fn header_location_sets_header() {
		let r = ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"models": [{"name": "claude-3"}],
				"location": {"header": {"name": "x-model"}},
			}))
			.unwrap(),
		)
		.unwrap();
		let route = route();
		let mut md = Metadata::default();
		let mut headers = HeaderMap::new();
		headers.insert("x-model", HeaderValue::from_static("original"));
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let action = r.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!();
		};
		assert_eq!(md.get_str(meta::MODEL_ORIGINAL), Some("original"));
		assert!(
			m.headers
				.set
				.iter()
				.any(|(k, v)| k == "x-model" && v == "claude-3")
		);
	}

	#[tokio::test]
	async fn path_param_location_rewrites_path() {
		let r = ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"models": [{"name": "gpt-4o"}],
				"location": {"pathParam": {"pattern": "^/models/([^/]+)/chat$"}},
			}))
			.unwrap(),
		)
		.unwrap();
		let route = route();
		let mut md = Metadata::default();
		let headers = HeaderMap::new();
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: Some("/models/gpt-3/chat"),
			query: None,
			status: None,
		};
		let action = r.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!();
		};
		assert_eq!(m.path.as_deref(), Some("/models/gpt-4o/chat"));
		assert_eq!(md.get_str(meta::MODEL_ORIGINAL), Some("gpt-3"));
	}

	#[tokio::test]
	async fn round_robin_cycles_in_declared_order() {
		let r = ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"models": [{"name": "a"}, {"name": "b"}],
			}))
			.unwrap(),
		)
		.unwrap();
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "a");
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "b");
		let mut md = Metadata::default();
		assert_eq!(request_model(&r, &mut md).await, "a");
	}
}
