use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::http::{HeaderMap, StatusCode};
use crate::policy::{
	BodyMode, BufferedBody, ImmediateResponse, Metadata, Phase, Policy, PolicyContext, PolicyError,
	ProcessingMode, RequestAction, ResponseAction, RouteIdentity,
};
use crate::*;

/// Drives an ordered chain of policies over one route. The executor is
/// long-lived; per-request state lives in the [`Transaction`] it hands out.
#[derive(Clone)]
pub struct ChainExecutor {
	route: Arc<RouteIdentity>,
	policies: Arc<[Arc<dyn Policy>]>,
	mode: ProcessingMode,
}

impl Debug for ChainExecutor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChainExecutor")
			.field("route", &self.route)
			.field("policies", &self.policies.len())
			.finish()
	}
}

impl ChainExecutor {
	pub fn new(route: RouteIdentity, policies: Vec<Arc<dyn Policy>>) -> Self {
		let mode = policies
			.iter()
			.map(|p| p.mode())
			.fold(ProcessingMode::passthrough(), ProcessingMode::union);
		ChainExecutor {
			route: Arc::new(route),
			policies: policies.into(),
			mode,
		}
	}

	/// The fused mode over the whole chain. The host must buffer a phase's
	/// body iff the fused mode says so.
	pub fn mode(&self) -> ProcessingMode {
		self.mode
	}

	pub fn route(&self) -> &RouteIdentity {
		&self.route
	}

	pub fn begin(&self, request_id: Strng) -> Transaction {
		Transaction {
			route: self.route.clone(),
			policies: self.policies.clone(),
			request_id,
			path: None,
			query: None,
			metadata: Metadata::default(),
			short_circuited: None,
		}
	}
}

/// The result of running one phase of the chain.
#[derive(Debug)]
#[must_use]
pub enum PhaseOutcome {
	/// Continue with the (possibly replaced) body; header mutations have
	/// already been applied to the caller's header map.
	Continue { body: Option<Bytes> },
	/// A policy synthesized a response; remaining handlers were skipped.
	Respond(ImmediateResponse),
}

enum HandlerOutcome<A> {
	Action(A),
	Skip,
	Reject,
}

/// Per-request state: the shared metadata map and the short-circuit marker.
/// Created by [`ChainExecutor::begin`], destroyed when the response leaves.
pub struct Transaction {
	route: Arc<RouteIdentity>,
	policies: Arc<[Arc<dyn Policy>]>,
	request_id: Strng,
	path: Option<Strng>,
	query: Option<Strng>,
	metadata: Metadata,
	short_circuited: Option<usize>,
}

impl Transaction {
	/// Attach the concrete request path, used by policies that read or rewrite
	/// it.
	pub fn with_path(mut self, path: Option<Strng>) -> Self {
		self.path = path;
		self
	}

	/// Attach the request's query string, used by policies that key off query
	/// parameters.
	pub fn with_query(mut self, query: Option<Strng>) -> Self {
		self.query = query;
		self
	}

	/// The request path after any policy rewrites.
	pub fn path(&self) -> Option<&str> {
		self.path.as_deref()
	}

	pub fn metadata(&self) -> &Metadata {
		&self.metadata
	}

	pub fn metadata_mut(&mut self) -> &mut Metadata {
		&mut self.metadata
	}

	/// Run the request phase. Handlers run in declared order; each sees the
	/// header mutations accumulated so far. A `Direct` action stops the chain
	/// and is returned without invoking the remaining handlers.
	pub async fn run_request(
		&mut self,
		headers: &mut HeaderMap,
		body: Option<BufferedBody>,
	) -> PhaseOutcome {
		let mut working = body;
		for i in 0..self.policies.len() {
			let policy = self.policies[i].clone();
			let deliver = match policy.mode().request_body {
				BodyMode::Buffer => working.as_ref(),
				BodyMode::Skip => None,
			};
			let mut ctx = PolicyContext {
				request_id: self.request_id.clone(),
				route: &self.route,
				metadata: &mut self.metadata,
				headers,
				body: deliver,
				path: self.path.as_deref(),
				query: self.query.as_deref(),
				status: None,
			};
			let caught = AssertUnwindSafe(policy.on_request(&mut ctx))
				.catch_unwind()
				.await;
			match unwrap_handler(&policy, Phase::Request, caught) {
				HandlerOutcome::Action(RequestAction::Modify(m)) => {
					m.headers.apply(headers);
					if let Some(b) = m.body {
						working = Some(BufferedBody::complete(b));
					}
					if let Some(p) = m.path {
						self.path = Some(strng::new(p));
					}
				},
				HandlerOutcome::Action(RequestAction::Direct(resp)) => {
					debug!(
						request = %self.request_id,
						policy = %policy.name(),
						status = %resp.status,
						"request short-circuited"
					);
					self.short_circuited = Some(i);
					return PhaseOutcome::Respond(resp);
				},
				HandlerOutcome::Skip => {},
				HandlerOutcome::Reject => {
					self.short_circuited = Some(i);
					return PhaseOutcome::Respond(internal_error());
				},
			}
		}
		PhaseOutcome::Continue {
			body: working.map(|b| b.bytes),
		}
	}

	/// Run the response phase in declared order. The policy that
	/// short-circuited the request phase (if any) is skipped; policies whose
	/// request handlers ran still see the response.
	pub async fn run_response(
		&mut self,
		status: &mut StatusCode,
		headers: &mut HeaderMap,
		body: Option<BufferedBody>,
	) -> PhaseOutcome {
		let mut working = body;
		for i in 0..self.policies.len() {
			if Some(i) == self.short_circuited {
				continue;
			}
			let policy = self.policies[i].clone();
			let deliver = match policy.mode().response_body {
				BodyMode::Buffer => working.as_ref(),
				BodyMode::Skip => None,
			};
			let mut ctx = PolicyContext {
				request_id: self.request_id.clone(),
				route: &self.route,
				metadata: &mut self.metadata,
				headers,
				body: deliver,
				path: self.path.as_deref(),
				query: self.query.as_deref(),
				status: Some(*status),
			};
			let caught = AssertUnwindSafe(policy.on_response(&mut ctx))
				.catch_unwind()
				.await;
			match unwrap_handler(&policy, Phase::Response, caught) {
				HandlerOutcome::Action(ResponseAction::Modify(m)) => {
					m.headers.apply(headers);
					if let Some(s) = m.status {
						*status = s;
					}
					if let Some(b) = m.body {
						working = Some(BufferedBody::complete(b));
					}
				},
				HandlerOutcome::Action(ResponseAction::Direct(resp)) => {
					debug!(
						request = %self.request_id,
						policy = %policy.name(),
						status = %resp.status,
						"response replaced"
					);
					return PhaseOutcome::Respond(resp);
				},
				HandlerOutcome::Skip => {},
				HandlerOutcome::Reject => {
					return PhaseOutcome::Respond(internal_error());
				},
			}
		}
		PhaseOutcome::Continue {
			body: working.map(|b| b.bytes),
		}
	}
}

/// A handler fault never crashes the executor: errors and panics become a
/// no-op for fail-open policies and a synthesized rejection for fail-closed
/// ones.
fn unwrap_handler<A>(
	policy: &Arc<dyn Policy>,
	phase: Phase,
	caught: Result<Result<A, PolicyError>, Box<dyn std::any::Any + Send>>,
) -> HandlerOutcome<A> {
	match caught {
		Ok(Ok(action)) => HandlerOutcome::Action(action),
		Ok(Err(err)) => {
			warn!(policy = %policy.name(), %phase, %err, "policy handler failed");
			if policy.fail_closed() {
				HandlerOutcome::Reject
			} else {
				HandlerOutcome::Skip
			}
		},
		Err(panic) => {
			let msg = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "unknown panic".to_string());
			error!(policy = %policy.name(), %phase, panic = %msg, "policy handler panicked");
			if policy.fail_closed() {
				HandlerOutcome::Reject
			} else {
				HandlerOutcome::Skip
			}
		},
	}
}

fn internal_error() -> ImmediateResponse {
	ImmediateResponse::json(
		StatusCode::INTERNAL_SERVER_ERROR,
		&serde_json::json!({"error": "internal_error", "message": "policy execution failed"}),
	)
}

#[cfg(test)]
mod tests {
	use crate::http::{HeaderName, HeaderValue};
	use crate::policy::{HeaderMode, HeaderMutations, RequestModifications};

	use super::*;

	fn route() -> RouteIdentity {
		RouteIdentity {
			api_id: strng::literal!("api-1"),
			api_name: strng::literal!("orders"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/orders"),
			method: http::Method::GET,
		}
	}

	struct Recorder {
		name: Strng,
		mode: ProcessingMode,
	}

	#[async_trait::async_trait]
	impl Policy for Recorder {
		fn name(&self) -> Strng {
			self.name.clone()
		}
		fn mode(&self) -> ProcessingMode {
			self.mode
		}
		async fn on_request(
			&self,
			ctx: &mut PolicyContext<'_>,
		) -> Result<RequestAction, PolicyError> {
			let seen = ctx
				.metadata
				.get_str("order")
				.map(|s| format!("{s},{}", self.name))
				.unwrap_or_else(|| self.name.to_string());
			ctx.metadata.set("order", seen);
			ctx
				.metadata
				.set(format!("{}.saw_body", self.name), ctx.body.is_some());
			Ok(RequestAction::Modify(RequestModifications {
				headers: HeaderMutations::default().with_set(
					HeaderName::from_bytes(format!("x-{}", self.name).as_bytes()).unwrap(),
					HeaderValue::from_static("1"),
				),
				..Default::default()
			}))
		}
	}

	struct ShortCircuit;

	#[async_trait::async_trait]
	impl Policy for ShortCircuit {
		fn name(&self) -> Strng {
			strng::literal!("short")
		}
		async fn on_request(
			&self,
			_ctx: &mut PolicyContext<'_>,
		) -> Result<RequestAction, PolicyError> {
			Ok(RequestAction::Direct(
				ImmediateResponse::new(StatusCode::FORBIDDEN).with_body("denied"),
			))
		}
		async fn on_response(
			&self,
			ctx: &mut PolicyContext<'_>,
		) -> Result<ResponseAction, PolicyError> {
			ctx.metadata.set("short.response_ran", true);
			Ok(ResponseAction::pass())
		}
	}

	struct Faulty {
		closed: bool,
	}

	#[async_trait::async_trait]
	impl Policy for Faulty {
		fn name(&self) -> Strng {
			strng::literal!("faulty")
		}
		fn fail_closed(&self) -> bool {
			self.closed
		}
		async fn on_request(
			&self,
			_ctx: &mut PolicyContext<'_>,
		) -> Result<RequestAction, PolicyError> {
			panic!("boom");
		}
	}

	fn recorder(name: &str, mode: ProcessingMode) -> Arc<dyn Policy> {
		Arc::new(Recorder {
			name: strng::new(name),
			mode,
		})
	}

	#[tokio::test]
	async fn declared_order_and_accumulated_headers() {
		let exec = ChainExecutor::new(
			route(),
			vec![
				recorder("a", ProcessingMode::request_only()),
				recorder("b", ProcessingMode::request_only()),
			],
		);
		let mut txn = exec.begin(strng::literal!("req-1"));
		let mut headers = HeaderMap::new();
		let out = txn.run_request(&mut headers, None).await;
		assert!(matches!(out, PhaseOutcome::Continue { .. }));
		assert_eq!(txn.metadata().get_str("order"), Some("a,b"));
		// mutations from `a` were visible when `b` ran and remain applied
		assert_eq!(headers.get("x-a").unwrap(), "1");
		assert_eq!(headers.get("x-b").unwrap(), "1");
	}

	#[tokio::test]
	async fn body_delivered_only_to_buffering_policies() {
		let exec = ChainExecutor::new(
			route(),
			vec![
				recorder("skip", ProcessingMode::request_only()),
				recorder("buf", ProcessingMode::buffered_request()),
			],
		);
		assert_eq!(exec.mode().request_body, BodyMode::Buffer);
		let mut txn = exec.begin(strng::literal!("req-2"));
		let mut headers = HeaderMap::new();
		let _ = txn
			.run_request(&mut headers, Some(BufferedBody::complete("payload")))
			.await;
		assert_eq!(txn.metadata().get_bool("skip.saw_body"), Some(false));
		assert_eq!(txn.metadata().get_bool("buf.saw_body"), Some(true));
	}

	#[tokio::test]
	async fn short_circuit_skips_rest_and_own_response_handler() {
		let exec = ChainExecutor::new(
			route(),
			vec![
				Arc::new(ShortCircuit) as Arc<dyn Policy>,
				recorder("after", ProcessingMode::request_only()),
			],
		);
		let mut txn = exec.begin(strng::literal!("req-3"));
		let mut headers = HeaderMap::new();
		let out = txn.run_request(&mut headers, None).await;
		let PhaseOutcome::Respond(resp) = out else {
			panic!("expected short-circuit");
		};
		assert_eq!(resp.status, StatusCode::FORBIDDEN);
		// the policy after the short-circuit never ran
		assert_eq!(txn.metadata().get_str("order"), None);

		let mut status = StatusCode::FORBIDDEN;
		let mut resp_headers = HeaderMap::new();
		let _ = txn
			.run_response(&mut status, &mut resp_headers, None)
			.await;
		assert_eq!(txn.metadata().get_bool("short.response_ran"), None);
	}

	#[tokio::test]
	async fn metadata_carries_over_to_response_phase() {
		let exec = ChainExecutor::new(route(), vec![recorder("a", ProcessingMode::request_only())]);
		let mut txn = exec.begin(strng::literal!("req-4"));
		let mut headers = HeaderMap::new();
		let _ = txn.run_request(&mut headers, None).await;
		let mut status = StatusCode::OK;
		let _ = txn.run_response(&mut status, &mut headers, None).await;
		assert_eq!(txn.metadata().get_str("order"), Some("a"));
	}

	#[tokio::test]
	async fn panic_is_fail_open_by_default() {
		let exec = ChainExecutor::new(
			route(),
			vec![
				Arc::new(Faulty { closed: false }) as Arc<dyn Policy>,
				recorder("after", ProcessingMode::request_only()),
			],
		);
		let mut txn = exec.begin(strng::literal!("req-5"));
		let mut headers = HeaderMap::new();
		let out = txn.run_request(&mut headers, None).await;
		assert!(matches!(out, PhaseOutcome::Continue { .. }));
		assert_eq!(txn.metadata().get_str("order"), Some("after"));
	}

	#[tokio::test]
	async fn panic_rejects_when_fail_closed() {
		let exec = ChainExecutor::new(
			route(),
			vec![Arc::new(Faulty { closed: true }) as Arc<dyn Policy>],
		);
		let mut txn = exec.begin(strng::literal!("req-6"));
		let mut headers = HeaderMap::new();
		let out = txn.run_request(&mut headers, None).await;
		let PhaseOutcome::Respond(resp) = out else {
			panic!("expected rejection");
		};
		assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn mode_fusion_over_chain() {
		let exec = ChainExecutor::new(
			route(),
			vec![
				recorder("a", ProcessingMode::passthrough()),
				recorder("b", ProcessingMode::buffered_response()),
			],
		);
		assert_eq!(exec.mode().response_body, BodyMode::Buffer);
		assert_eq!(exec.mode().response_header, HeaderMode::Process);
		assert_eq!(exec.mode().request_body, BodyMode::Skip);
	}
}
