use std::str::FromStr;

use serde_json::Value;

use crate::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use crate::policy::{
	HeaderMode, HeaderMutations, ImmediateResponse, Policy, PolicyContext, PolicyError,
	ProcessingMode, RequestAction, ResponseAction, ResponseModifications, meta,
};
use crate::*;

#[derive(Default, Debug, Clone)]
enum WildcardOrList<T> {
	#[default]
	None,
	Wildcard,
	List(Vec<T>),
}

impl<T> WildcardOrList<T> {
	fn is_none(&self) -> bool {
		matches!(self, WildcardOrList::None)
	}
}

impl<T: FromStr> TryFrom<Vec<String>> for WildcardOrList<T> {
	type Error = T::Err;

	fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
		if value.contains(&"*".to_string()) {
			Ok(WildcardOrList::Wildcard)
		} else if value.is_empty() {
			Ok(WildcardOrList::None)
		} else {
			let vec: Vec<T> = value
				.into_iter()
				.map(|v| T::from_str(&v))
				.collect::<Result<_, _>>()?;
			Ok(WildcardOrList::List(vec))
		}
	}
}

impl<T: Display> WildcardOrList<T> {
	fn to_header_value(&self) -> Option<HeaderValue> {
		match self {
			WildcardOrList::None => None,
			WildcardOrList::Wildcard => Some(HeaderValue::from_static("*")),
			WildcardOrList::List(list) => {
				let value = list
					.iter()
					.map(|item| item.to_string())
					.collect::<Vec<_>>()
					.join(",");
				HeaderValue::from_str(&value).ok()
			},
		}
	}
}

#[apply(schema_de!)]
pub struct CorsSerde {
	#[serde(default)]
	pub allow_credentials: bool,
	#[serde(default)]
	pub allow_headers: Vec<String>,
	#[serde(default)]
	pub allow_methods: Vec<String>,
	#[serde(default)]
	pub allow_origins: Vec<String>,
	#[serde(default)]
	pub expose_headers: Vec<String>,
	#[serde(default, with = "serde_dur_option")]
	#[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
	pub max_age: Option<Duration>,
}

/// CORS policy. Preflights are answered directly; for actual requests the
/// request phase primes the metadata map and the response phase applies or
/// strips the browser-facing headers.
#[derive(Debug)]
pub struct Cors {
	allow_credentials: bool,
	allow_headers: WildcardOrList<HeaderName>,
	allow_methods: WildcardOrList<Method>,
	allow_origins: WildcardOrList<Strng>,
	expose_headers: WildcardOrList<HeaderName>,
	max_age: Option<HeaderValue>,
}

impl TryFrom<CorsSerde> for Cors {
	type Error = anyhow::Error;

	fn try_from(value: CorsSerde) -> Result<Self, Self::Error> {
		let allow_origins: WildcardOrList<Strng> = WildcardOrList::try_from(value.allow_origins)
			.map_err(|e| anyhow::anyhow!("invalid origin: {e:?}"))?;
		if value.allow_credentials && matches!(allow_origins, WildcardOrList::Wildcard) {
			anyhow::bail!("allowCredentials cannot be combined with a wildcard origin");
		}
		Ok(Cors {
			allow_credentials: value.allow_credentials,
			allow_headers: WildcardOrList::try_from(value.allow_headers)?,
			allow_methods: WildcardOrList::try_from(value.allow_methods)
				.map_err(|e| anyhow::anyhow!("invalid method: {e}"))?,
			allow_origins,
			expose_headers: WildcardOrList::try_from(value.expose_headers)?,
			max_age: value
				.max_age
				.map(|v| HeaderValue::from_str(&v.as_secs().to_string()))
				.transpose()?,
		})
	}
}

const HEADER_VALUE_TRUE: HeaderValue = HeaderValue::from_static("true");

impl Cors {
	fn origin_allowed(&self, origin: &HeaderValue) -> bool {
		match &self.allow_origins {
			WildcardOrList::None => false,
			WildcardOrList::Wildcard => true,
			WildcardOrList::List(origins) => {
				let os = origin.as_bytes();
				origins.iter().any(|want| want.as_bytes() == os)
			},
		}
	}

	fn method_allowed(&self, requested: &str) -> bool {
		match &self.allow_methods {
			WildcardOrList::None => false,
			WildcardOrList::Wildcard => true,
			WildcardOrList::List(methods) => methods.iter().any(|m| m.as_str() == requested),
		}
	}

	fn headers_allowed(&self, requested: &str) -> bool {
		match &self.allow_headers {
			WildcardOrList::None => requested.trim().is_empty(),
			WildcardOrList::Wildcard => true,
			WildcardOrList::List(allowed) => requested
				.split(',')
				.map(str::trim)
				.filter(|h| !h.is_empty())
				.all(|h| allowed.iter().any(|a| a.as_str().eq_ignore_ascii_case(h))),
		}
	}

	fn preflight(&self, origin: &HeaderValue) -> ImmediateResponse {
		let mut resp = ImmediateResponse::new(StatusCode::OK);
		resp
			.headers
			.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
		if let Some(h) = self.allow_methods.to_header_value() {
			resp.headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, h);
		}
		if let Some(h) = self.allow_headers.to_header_value() {
			resp.headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, h);
		}
		if self.allow_credentials {
			resp
				.headers
				.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HEADER_VALUE_TRUE);
		}
		if let Some(h) = &self.max_age {
			resp.headers.insert(header::ACCESS_CONTROL_MAX_AGE, h.clone());
		}
		resp
	}

	fn response_headers(&self, origin: &HeaderValue) -> serde_json::Map<String, Value> {
		let mut out = serde_json::Map::new();
		if let Ok(o) = origin.to_str() {
			out.insert(
				header::ACCESS_CONTROL_ALLOW_ORIGIN.to_string(),
				Value::String(o.to_string()),
			);
		}
		if self.allow_credentials {
			out.insert(
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS.to_string(),
				Value::String("true".to_string()),
			);
		}
		if let Some(h) = self.expose_headers.to_header_value()
			&& let Ok(h) = h.to_str()
		{
			out.insert(
				header::ACCESS_CONTROL_EXPOSE_HEADERS.to_string(),
				Value::String(h.to_string()),
			);
		}
		out
	}
}

#[async_trait::async_trait]
impl Policy for Cors {
	fn name(&self) -> Strng {
		strng::literal!("cors")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode {
			request_header: HeaderMode::Process,
			response_header: HeaderMode::Process,
			..ProcessingMode::passthrough()
		}
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let Some(origin) = ctx.headers.get(header::ORIGIN).cloned() else {
			return Ok(RequestAction::pass());
		};
		if !self.origin_allowed(&origin) {
			// the response phase strips any CORS headers the upstream added
			ctx.metadata.set(meta::CORS_STRIP, true);
			return Ok(RequestAction::pass());
		}
		if ctx.route.method == Method::OPTIONS {
			let requested_method = ctx
				.header_str(&header::ACCESS_CONTROL_REQUEST_METHOD)
				.unwrap_or_default()
				.to_string();
			let requested_headers = ctx
				.header_str(&header::ACCESS_CONTROL_REQUEST_HEADERS)
				.unwrap_or_default()
				.to_string();
			if !requested_method.is_empty() {
				if self.method_allowed(&requested_method) && self.headers_allowed(&requested_headers) {
					return Ok(RequestAction::Direct(self.preflight(&origin)));
				}
				// non-matching preflights are forwarded upstream
				return Ok(RequestAction::pass());
			}
		}
		ctx.metadata.set(
			meta::CORS_HEADERS,
			Value::Object(self.response_headers(&origin)),
		);
		Ok(RequestAction::pass())
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		let mut mutations = HeaderMutations::default();
		if ctx.metadata.get_bool(meta::CORS_STRIP).unwrap_or(false) {
			mutations.remove = vec![
				header::ACCESS_CONTROL_ALLOW_ORIGIN,
				header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
				header::ACCESS_CONTROL_EXPOSE_HEADERS,
			];
		} else if let Some(Value::Object(map)) = ctx.metadata.get(meta::CORS_HEADERS) {
			for (k, v) in map {
				if let (Ok(name), Some(value)) = (
					HeaderName::from_bytes(k.as_bytes()),
					v.as_str().and_then(|s| HeaderValue::from_str(s).ok()),
				) {
					mutations.set.push((name, value));
				}
			}
		} else {
			return Ok(ResponseAction::pass());
		}
		Ok(ResponseAction::Modify(ResponseModifications {
			headers: mutations,
			..Default::default()
		}))
	}
}

#[cfg(test)]
mod tests {
	use crate::http::HeaderMap;
	use crate::policy::{Metadata, RouteIdentity};

	use super::*;

	fn cors(config: serde_json::Value) -> Cors {
		Cors::try_from(serde_json::from_value::<CorsSerde>(config).unwrap()).unwrap()
	}

	fn default_cors() -> Cors {
		cors(serde_json::json!({
			"allowOrigins": ["https://app.example"],
			"allowMethods": ["GET", "POST"],
			"allowHeaders": ["content-type", "x-api-key"],
			"exposeHeaders": ["x-request-id"],
			"allowCredentials": true,
			"maxAge": "10m",
		}))
	}

	fn route(method: Method) -> RouteIdentity {
		RouteIdentity {
			api_id: strng::literal!("api-1"),
			api_name: strng::literal!("orders"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/orders"),
			method,
		}
	}

	async fn run(
		c: &Cors,
		method: Method,
		headers: &[(&str, &str)],
	) -> (RequestAction, Metadata) {
		let route = route(method);
		let mut md = Metadata::default();
		let mut hm = HeaderMap::new();
		for (k, v) in headers {
			hm.insert(
				HeaderName::from_str(k).unwrap(),
				HeaderValue::from_str(v).unwrap(),
			);
		}
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &hm,
			body: None,
			path: None,
			query: None,
			status: None,
		};
		let action = c.on_request(&mut ctx).await.unwrap();
		(action, md)
	}

	#[test]
	fn wildcard_with_credentials_is_rejected() {
		let r = Cors::try_from(
			serde_json::from_value::<CorsSerde>(serde_json::json!({
				"allowOrigins": ["*"],
				"allowCredentials": true,
			}))
			.unwrap(),
		);
		assert!(r.is_err());
	}

	#[tokio::test]
	async fn preflight_is_answered_directly() {
		let c = default_cors();
		let (action, _) = run(
			&c,
			Method::OPTIONS,
			&[
				("origin", "https://app.example"),
				("access-control-request-method", "POST"),
				("access-control-request-headers", "content-type"),
			],
		)
		.await;
		let RequestAction::Direct(resp) = action else {
			panic!("expected preflight response");
		};
		assert_eq!(resp.status, StatusCode::OK);
		assert_eq!(
			resp
				.headers
				.get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
				.unwrap(),
			"https://app.example"
		);
		assert_eq!(
			resp
				.headers
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET,POST"
		);
		assert_eq!(
			resp.headers.get(header::ACCESS_CONTROL_MAX_AGE).unwrap(),
			"600"
		);
	}

	#[tokio::test]
	async fn disallowed_preflight_method_is_forwarded() {
		let c = default_cors();
		let (action, _) = run(
			&c,
			Method::OPTIONS,
			&[
				("origin", "https://app.example"),
				("access-control-request-method", "DELETE"),
			],
		)
		.await;
		assert!(matches!(action, RequestAction::Modify(_)));
	}

	#[tokio::test]
	async fn actual_request_primes_response_headers() {
		let c = default_cors();
		let (action, md) = run(&c, Method::GET, &[("origin", "https://app.example")]).await;
		assert!(matches!(action, RequestAction::Modify(_)));
		let Some(Value::Object(map)) = md.get(meta::CORS_HEADERS) else {
			panic!("expected primed headers");
		};
		assert_eq!(
			map.get("access-control-allow-origin"),
			Some(&Value::String("https://app.example".to_string()))
		);
		assert_eq!(
			map.get("access-control-allow-credentials"),
			Some(&Value::String("true".to_string()))
		);
	}

	#[tokio::test]
	async fn unknown_origin_strips_upstream_cors() {
		let c = default_cors();
		let (action, md) = run(&c, Method::GET, &[("origin", "https://evil.example")]).await;
		assert!(matches!(action, RequestAction::Modify(_)));
		assert_eq!(md.get_bool(meta::CORS_STRIP), Some(true));

		// response phase removes upstream CORS headers
		let route = route(Method::GET);
		let mut md = md;
		let headers = HeaderMap::new();
		let mut ctx = PolicyContext {
			request_id: strng::literal!("r"),
			route: &route,
			metadata: &mut md,
			headers: &headers,
			body: None,
			path: None,
			query: None,
			status: Some(StatusCode::OK),
		};
		let action = c.on_response(&mut ctx).await.unwrap();
		let ResponseAction::Modify(m) = action else {
			panic!();
		};
		assert!(
			m.headers
				.remove
				.contains(&header::ACCESS_CONTROL_ALLOW_ORIGIN)
		);
	}

	#[tokio::test]
	async fn no_origin_is_a_no_op() {
		let c = default_cors();
		let (action, md) = run(&c, Method::GET, &[]).await;
		assert!(matches!(action, RequestAction::Modify(_)));
		assert!(!md.contains(meta::CORS_HEADERS));
		assert!(!md.contains(meta::CORS_STRIP));
	}
}
