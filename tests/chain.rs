use std::sync::Arc;

use gatekit::http::{HeaderMap, HeaderValue, Method, StatusCode, header, x_headers};
use gatekit::policy::chain::{ChainExecutor, PhaseOutcome};
use gatekit::policy::{BodyMode, BufferedBody, Policy, RouteIdentity, meta};
use gatekit::strng;

struct StaticKeys;

#[async_trait::async_trait]
impl gatekit::http::apikey::KeyValidator for StaticKeys {
	async fn validate(
		&self,
		api_id: &str,
		operation_path: &str,
		method: &Method,
		key: &str,
	) -> anyhow::Result<bool> {
		Ok(api_id == "api-1" && operation_path == "/chat" && method == Method::POST && key == "secret")
	}
}

fn route() -> RouteIdentity {
	RouteIdentity {
		api_id: strng::new("api-1"),
		api_name: strng::new("chat"),
		api_version: strng::new("v1"),
		operation_path: strng::new("/chat"),
		method: Method::POST,
	}
}

async fn executor() -> ChainExecutor {
	let cors: Arc<dyn Policy> = Arc::new(
		gatekit::http::cors::Cors::try_from(
			serde_json::from_value::<gatekit::http::cors::CorsSerde>(serde_json::json!({
				"allowOrigins": ["https://app.example"],
				"allowMethods": ["POST"],
			}))
			.unwrap(),
		)
		.unwrap(),
	);
	let auth: Arc<dyn Policy> = Arc::new(
		gatekit::http::apikey::ApiKeyAuth::new(
			serde_json::from_value(serde_json::json!({"key": "x-api-key"})).unwrap(),
			Arc::new(StaticKeys),
		)
		.unwrap(),
	);
	let limit: Arc<dyn Policy> = Arc::new(
		gatekit::ratelimit::RateLimit::build(
			serde_json::from_value(serde_json::json!({
				"limits": [{"limit": 2, "duration": "1m"}],
			}))
			.unwrap(),
		)
		.await
		.unwrap(),
	);
	let router: Arc<dyn Policy> = Arc::new(
		gatekit::llm::ModelRouter::new(
			serde_json::from_value(serde_json::json!({
				"strategy": "weighted",
				"models": [
					{"name": "gpt-4", "weight": 2},
					{"name": "gpt-35", "weight": 1},
				],
			}))
			.unwrap(),
		)
		.unwrap(),
	);
	let tag: Arc<dyn Policy> = Arc::new(
		gatekit::http::headers::HeaderPolicy::set(
			serde_json::from_value(serde_json::json!({"headers": {"x-gateway": "gatekit"}})).unwrap(),
		)
		.unwrap(),
	);
	ChainExecutor::new(route(), vec![cors, auth, limit, router, tag])
}

fn request_headers(key: Option<&str>) -> HeaderMap {
	let mut headers = HeaderMap::new();
	headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example"));
	if let Some(k) = key {
		headers.insert("x-api-key", HeaderValue::from_str(k).unwrap());
	}
	headers
}

#[tokio::test]
async fn fused_mode_buffers_request_for_the_router() {
	let exec = executor().await;
	assert_eq!(exec.mode().request_body, BodyMode::Buffer);
}

#[tokio::test]
async fn full_chain_forwards_and_rewrites() {
	let exec = executor().await;
	let mut txn = exec.begin(strng::new("it-1"));
	let mut headers = request_headers(Some("secret"));
	let outcome = txn
		.run_request(
			&mut headers,
			Some(BufferedBody::complete(r#"{"model":"anything"}"#)),
		)
		.await;
	let PhaseOutcome::Continue { body } = outcome else {
		panic!("expected forward");
	};
	// the router rewrote the model in the forwarded body
	let body: serde_json::Value = serde_json::from_slice(&body.unwrap()).unwrap();
	assert_eq!(body["model"], "gpt-4");
	// accumulated header mutations are visible on the final map
	assert_eq!(headers.get("x-gateway").unwrap(), "gatekit");
	assert!(headers.contains_key(x_headers::X_RATELIMIT_REMAINING));
	// metadata crossed policies
	assert_eq!(txn.metadata().get_bool(meta::AUTH_SUCCESS), Some(true));
	assert_eq!(txn.metadata().get_str(meta::MODEL_SELECTED), Some("gpt-4"));

	// response phase applies the primed CORS headers
	let mut status = StatusCode::OK;
	let mut resp_headers = HeaderMap::new();
	let outcome = txn.run_response(&mut status, &mut resp_headers, None).await;
	assert!(matches!(outcome, PhaseOutcome::Continue { .. }));
	assert_eq!(
		resp_headers
			.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
			.unwrap(),
		"https://app.example"
	);
}

#[tokio::test]
async fn missing_key_short_circuits_before_rate_limiting() {
	let exec = executor().await;

	// burn through requests without a key; the limiter must never see them
	for _ in 0..5 {
		let mut txn = exec.begin(strng::new("it-2"));
		let mut headers = request_headers(None);
		let outcome = txn
			.run_request(
				&mut headers,
				Some(BufferedBody::complete(r#"{"model":"x"}"#)),
			)
			.await;
		let PhaseOutcome::Respond(resp) = outcome else {
			panic!("expected 401");
		};
		assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
	}

	// authenticated requests still have their full quota
	let mut txn = exec.begin(strng::new("it-3"));
	let mut headers = request_headers(Some("secret"));
	let outcome = txn
		.run_request(
			&mut headers,
			Some(BufferedBody::complete(r#"{"model":"x"}"#)),
		)
		.await;
	assert!(matches!(outcome, PhaseOutcome::Continue { .. }));
}

#[tokio::test]
async fn quota_exhaustion_returns_429_with_headers() {
	let exec = executor().await;
	let mut last = None;
	for i in 0..3 {
		let mut txn = exec.begin(strng::new("it-4"));
		let mut headers = request_headers(Some("secret"));
		last = Some(
			txn.run_request(
				&mut headers,
				Some(BufferedBody::complete(r#"{"model":"x"}"#)),
			)
			.await,
		);
		if i < 2 {
			assert!(matches!(last, Some(PhaseOutcome::Continue { .. })));
		}
	}
	let Some(PhaseOutcome::Respond(resp)) = last else {
		panic!("third request should be limited");
	};
	assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
	assert!(resp.headers.contains_key(header::RETRY_AFTER));
	assert!(resp.headers.contains_key(x_headers::RATELIMIT_POLICY));
}

#[tokio::test]
async fn preflight_is_answered_by_the_first_policy() {
	let mut route = route();
	route.method = Method::OPTIONS;
	let cors: Arc<dyn Policy> = Arc::new(
		gatekit::http::cors::Cors::try_from(
			serde_json::from_value::<gatekit::http::cors::CorsSerde>(serde_json::json!({
				"allowOrigins": ["https://app.example"],
				"allowMethods": ["POST"],
			}))
			.unwrap(),
		)
		.unwrap(),
	);
	let auth: Arc<dyn Policy> = Arc::new(
		gatekit::http::apikey::ApiKeyAuth::new(
			serde_json::from_value(serde_json::json!({"key": "x-api-key"})).unwrap(),
			Arc::new(StaticKeys),
		)
		.unwrap(),
	);
	let exec = ChainExecutor::new(route, vec![cors, auth]);

	let mut txn = exec.begin(strng::new("it-5"));
	let mut headers = request_headers(None);
	headers.insert(
		header::ACCESS_CONTROL_REQUEST_METHOD,
		HeaderValue::from_static("POST"),
	);
	let outcome = txn.run_request(&mut headers, None).await;
	let PhaseOutcome::Respond(resp) = outcome else {
		panic!("expected preflight answer");
	};
	// CORS answered before the auth policy could reject
	assert_eq!(resp.status, StatusCode::OK);
	assert!(resp.headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
}
