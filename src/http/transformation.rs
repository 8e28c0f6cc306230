use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};

use crate::http::{HeaderValue, StatusCode, header};
use crate::policy::{
	HeaderMutations, ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode,
	RequestAction, RequestModifications, ResponseAction, ResponseModifications,
};
use crate::*;

#[apply(schema_de!)]
#[derive(Copy, PartialEq, Eq)]
pub enum TransformKind {
	JsonToXml,
	XmlToJson,
}

#[apply(schema_de!)]
pub struct TransformationSerde {
	pub kind: TransformKind,
	#[serde(default)]
	pub on_request_flow: bool,
	#[serde(default)]
	pub on_response_flow: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
	#[error("payload is not valid JSON: {0}")]
	InvalidJson(#[from] serde_json::Error),
	#[error("payload is not valid XML: {0}")]
	InvalidXml(String),
	#[error("transformation failed: {0}")]
	Internal(String),
}

/// JSON rendered as XML. A single-key object whose value is an object keeps
/// that key as the document element; everything else is wrapped in `<root>`.
/// Keys starting with `@` become attributes, `#text` becomes the text node,
/// and arrays become repeated tags.
pub fn json_to_xml(value: &Value) -> Result<String, TransformError> {
	let mut writer = Writer::new(Vec::new());
	match value {
		Value::Object(map) if map.len() == 1 && map.values().next().is_some_and(Value::is_object) => {
			let (tag, inner) = map.iter().next().expect("len checked");
			write_element(&mut writer, tag, inner)?;
		},
		Value::Array(items) => {
			writer
				.write_event(Event::Start(BytesStart::new("root")))
				.map_err(|e| TransformError::Internal(e.to_string()))?;
			for item in items {
				write_element(&mut writer, "item", item)?;
			}
			writer
				.write_event(Event::End(BytesEnd::new("root")))
				.map_err(|e| TransformError::Internal(e.to_string()))?;
		},
		other => write_element(&mut writer, "root", other)?,
	}
	String::from_utf8(writer.into_inner()).map_err(|e| TransformError::Internal(e.to_string()))
}

fn write_element<W: std::io::Write>(
	writer: &mut Writer<W>,
	tag: &str,
	value: &Value,
) -> Result<(), TransformError> {
	match value {
		Value::Array(items) => {
			for item in items {
				write_element(writer, tag, item)?;
			}
			Ok(())
		},
		Value::Object(map) => {
			let mut start = BytesStart::new(tag);
			for (k, v) in map {
				if let Some(attr) = k.strip_prefix('@') {
					start.push_attribute((attr, scalar_text(v).as_str()));
				}
			}
			writer.write_event(Event::Start(start)).map_err(|e| TransformError::Internal(e.to_string()))?;
			for (k, v) in map {
				if k.starts_with('@') {
					continue;
				}
				if k == "#text" {
					writer
						.write_event(Event::Text(BytesText::new(&scalar_text(v))))
						.map_err(|e| TransformError::Internal(e.to_string()))?;
				} else {
					write_element(writer, k, v)?;
				}
			}
			writer
				.write_event(Event::End(BytesEnd::new(tag)))
				.map_err(|e| TransformError::Internal(e.to_string()))?;
			Ok(())
		},
		scalar => {
			writer
				.write_event(Event::Start(BytesStart::new(tag)))
				.map_err(|e| TransformError::Internal(e.to_string()))?;
			if !scalar.is_null() {
				writer
					.write_event(Event::Text(BytesText::new(&scalar_text(scalar))))
					.map_err(|e| TransformError::Internal(e.to_string()))?;
			}
			writer
				.write_event(Event::End(BytesEnd::new(tag)))
				.map_err(|e| TransformError::Internal(e.to_string()))?;
			Ok(())
		},
	}
}

fn scalar_text(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

struct XmlNode {
	tag: String,
	attrs: Map<String, Value>,
	children: Vec<(String, Value)>,
	text: String,
}

/// XML parsed into JSON. Attributes get an `@` prefix, repeated elements
/// collapse into arrays, and a document element named `root` is unwrapped so
/// [`json_to_xml`] output round-trips.
pub fn xml_to_json(input: &str) -> Result<Value, TransformError> {
	let mut reader = Reader::from_str(input);
	// whitespace-only text nodes are trimmed away in close_node
	let mut stack: Vec<XmlNode> = Vec::new();
	let mut root: Option<(String, Value)> = None;
	loop {
		let event = reader
			.read_event()
			.map_err(|e| TransformError::InvalidXml(e.to_string()))?;
		match event {
			Event::Start(start) => {
				stack.push(open_node(&start)?);
			},
			Event::Empty(start) => {
				let node = open_node(&start)?;
				finish_node(node, &mut stack, &mut root);
			},
			Event::Text(text) => {
				let t = text
					.unescape()
					.map_err(|e| TransformError::InvalidXml(e.to_string()))?;
				if let Some(top) = stack.last_mut() {
					top.text.push_str(&t);
				}
			},
			Event::End(_) => {
				let node = stack
					.pop()
					.ok_or_else(|| TransformError::InvalidXml("unbalanced element".to_string()))?;
				finish_node(node, &mut stack, &mut root);
			},
			Event::Eof => break,
			_ => {},
		}
	}
	if !stack.is_empty() {
		return Err(TransformError::InvalidXml("unclosed element".to_string()));
	}
	let (tag, value) = root.ok_or_else(|| TransformError::InvalidXml("empty document".to_string()))?;
	if tag == "root" {
		Ok(value)
	} else {
		let mut map = Map::new();
		map.insert(tag, value);
		Ok(Value::Object(map))
	}
}

fn open_node(start: &BytesStart) -> Result<XmlNode, TransformError> {
	let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
	let mut attrs = Map::new();
	for attr in start.attributes() {
		let attr = attr.map_err(|e| TransformError::InvalidXml(e.to_string()))?;
		let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
		let value = attr
			.unescape_value()
			.map_err(|e| TransformError::InvalidXml(e.to_string()))?;
		attrs.insert(key, Value::String(value.to_string()));
	}
	Ok(XmlNode {
		tag,
		attrs,
		children: Vec::new(),
		text: String::new(),
	})
}

fn finish_node(node: XmlNode, stack: &mut Vec<XmlNode>, root: &mut Option<(String, Value)>) {
	let value = close_node(node.attrs, node.children, node.text);
	match stack.last_mut() {
		Some(parent) => parent.children.push((node.tag, value)),
		None => *root = Some((node.tag, value)),
	}
}

fn close_node(attrs: Map<String, Value>, children: Vec<(String, Value)>, text: String) -> Value {
	let trimmed = text.trim();
	if attrs.is_empty() && children.is_empty() {
		return typed_scalar(trimmed);
	}
	let mut map = attrs;
	for (tag, value) in children {
		match map.get_mut(&tag) {
			Some(Value::Array(existing)) => existing.push(value),
			Some(_) => {
				let prev = map.remove(&tag).expect("present");
				map.insert(tag, Value::Array(vec![prev, value]));
			},
			None => {
				map.insert(tag, value);
			},
		}
	}
	if !trimmed.is_empty() {
		map.insert("#text".to_string(), typed_scalar(trimmed));
	}
	Value::Object(map)
}

fn typed_scalar(text: &str) -> Value {
	if text.is_empty() {
		return Value::String(String::new());
	}
	if let Ok(i) = text.parse::<i64>() {
		return Value::Number(i.into());
	}
	if let Ok(f) = text.parse::<f64>()
		&& let Some(n) = serde_json::Number::from_f64(f)
	{
		return Value::Number(n);
	}
	match text {
		"true" => Value::Bool(true),
		"false" => Value::Bool(false),
		_ => Value::String(text.to_string()),
	}
}

/// Converts request and/or response bodies between JSON and XML when the
/// `Content-Type` matches the source format.
pub struct Transformation {
	kind: TransformKind,
	on_request_flow: bool,
	on_response_flow: bool,
}

impl Transformation {
	pub fn new(config: TransformationSerde) -> Self {
		Transformation {
			kind: config.kind,
			on_request_flow: config.on_request_flow,
			on_response_flow: config.on_response_flow,
		}
	}

	fn content_type_matches(&self, ctx: &PolicyContext<'_>) -> bool {
		let Some(ct) = ctx.header_str(&header::CONTENT_TYPE) else {
			return false;
		};
		let ct = ct.to_ascii_lowercase();
		match self.kind {
			TransformKind::JsonToXml => ct.contains("json"),
			TransformKind::XmlToJson => ct.contains("xml"),
		}
	}

	fn transform(&self, body: &[u8]) -> Result<(Bytes, &'static str), TransformError> {
		match self.kind {
			TransformKind::JsonToXml => {
				let value: Value = serde_json::from_slice(body)?;
				let xml = json_to_xml(&value)?;
				Ok((Bytes::from(xml), "application/xml"))
			},
			TransformKind::XmlToJson => {
				let text = std::str::from_utf8(body)
					.map_err(|_| TransformError::InvalidXml("payload is not UTF-8".to_string()))?;
				let value = xml_to_json(text)?;
				let json = serde_json::to_vec(&value).map_err(TransformError::InvalidJson)?;
				Ok((Bytes::from(json), "application/json"))
			},
		}
	}

	fn success_mutations(body: &Bytes, content_type: &'static str) -> HeaderMutations {
		HeaderMutations::default()
			.with_set(header::CONTENT_TYPE, HeaderValue::from_static(content_type))
			.with_set(
				header::CONTENT_LENGTH,
				HeaderValue::from_str(&body.len().to_string())
					.unwrap_or_else(|_| HeaderValue::from_static("0")),
			)
	}
}

#[async_trait::async_trait]
impl Policy for Transformation {
	fn name(&self) -> Strng {
		match self.kind {
			TransformKind::JsonToXml => strng::literal!("json-to-xml"),
			TransformKind::XmlToJson => strng::literal!("xml-to-json"),
		}
	}

	fn mode(&self) -> ProcessingMode {
		let mut mode = ProcessingMode::passthrough();
		if self.on_request_flow {
			mode = mode.union(ProcessingMode::buffered_request());
		}
		if self.on_response_flow {
			mode = mode.union(ProcessingMode::buffered_response());
		}
		mode
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		if !self.on_request_flow || !self.content_type_matches(ctx) {
			return Ok(RequestAction::pass());
		}
		match self.transform(ctx.body_bytes()) {
			Ok((body, content_type)) => {
				let headers = Self::success_mutations(&body, content_type);
				Ok(RequestAction::Modify(RequestModifications {
					headers,
					body: Some(body),
					..Default::default()
				}))
			},
			Err(e @ (TransformError::InvalidJson(_) | TransformError::InvalidXml(_))) => {
				Ok(RequestAction::Direct(ImmediateResponse::json(
					StatusCode::BAD_REQUEST,
					&serde_json::json!({"error": "invalid_payload", "message": e.to_string()}),
				)))
			},
			Err(e) => Ok(RequestAction::Direct(ImmediateResponse::json(
				StatusCode::INTERNAL_SERVER_ERROR,
				&serde_json::json!({"error": "transformation_failed", "message": e.to_string()}),
			))),
		}
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		if !self.on_response_flow || !self.content_type_matches(ctx) {
			return Ok(ResponseAction::pass());
		}
		match self.transform(ctx.body_bytes()) {
			Ok((body, content_type)) => {
				let headers = Self::success_mutations(&body, content_type);
				Ok(ResponseAction::Modify(ResponseModifications {
					headers,
					body: Some(body),
					..Default::default()
				}))
			},
			Err(e) => match self.kind {
				// a response we cannot parse as XML is a hard failure
				TransformKind::XmlToJson => Ok(ResponseAction::Direct(ImmediateResponse::json(
					StatusCode::INTERNAL_SERVER_ERROR,
					&serde_json::json!({"error": "transformation_failed", "message": e.to_string()}),
				))),
				// an unconvertible JSON response passes through unchanged
				TransformKind::JsonToXml => {
					debug!(err = %e, "response transformation failed, passing through");
					Ok(ResponseAction::pass())
				},
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::http::HeaderMap;
	use crate::policy::{BufferedBody, Metadata, RouteIdentity};

	use super::*;

	#[test]
	fn json_to_xml_wraps_in_root() {
		let v = serde_json::json!({"a": 1, "b": "x"});
		let xml = json_to_xml(&v).unwrap();
		assert_eq!(xml, "<root><a>1</a><b>x</b></root>");
	}

	#[test]
	fn single_object_key_becomes_document_element() {
		let v = serde_json::json!({"order": {"id": 7}});
		let xml = json_to_xml(&v).unwrap();
		assert_eq!(xml, "<order><id>7</id></order>");
	}

	#[test]
	fn arrays_become_repeated_tags() {
		let v = serde_json::json!({"order": {"item": ["a", "b"]}});
		let xml = json_to_xml(&v).unwrap();
		assert_eq!(xml, "<order><item>a</item><item>b</item></order>");
	}

	#[test]
	fn attributes_get_at_prefix() {
		let json = xml_to_json(r#"<order id="7"><sku>a</sku></order>"#).unwrap();
		assert_eq!(
			json,
			serde_json::json!({"order": {"@id": "7", "sku": "a"}})
		);
	}

	#[test]
	fn repeated_elements_collapse_to_arrays() {
		let json = xml_to_json("<order><item>a</item><item>b</item><item>c</item></order>").unwrap();
		assert_eq!(
			json,
			serde_json::json!({"order": {"item": ["a", "b", "c"]}})
		);
	}

	#[test]
	fn json_round_trip_is_structurally_equal() {
		for v in [
			serde_json::json!({"a": 1, "b": "x", "c": true}),
			serde_json::json!({"order": {"id": 7, "item": ["a", "b"]}}),
			serde_json::json!({"nested": {"deep": {"leaf": 3.5}}}),
		] {
			let xml = json_to_xml(&v).unwrap();
			assert_eq!(xml_to_json(&xml).unwrap(), v, "via {xml}");
		}
	}

	#[test]
	fn xml_round_trip_is_structurally_equal() {
		for xml in [
			r#"<order id="7"><sku>a</sku><sku>b</sku></order>"#,
			"<doc><title>hi</title><count>2</count></doc>",
		] {
			let json = xml_to_json(xml).unwrap();
			let back = json_to_xml(&json).unwrap();
			assert_eq!(
				xml_to_json(&back).unwrap(),
				json,
				"{xml} -> {json} -> {back}"
			);
		}
	}

	#[test]
	fn invalid_xml_is_rejected() {
		assert!(matches!(
			xml_to_json("<a><b></a>"),
			Err(TransformError::InvalidXml(_))
		));
	}

	fn run_ctx<'a>(
		route: &'a RouteIdentity,
		md: &'a mut Metadata,
		headers: &'a HeaderMap,
		body: &'a BufferedBody,
		status: Option<StatusCode>,
	) -> PolicyContext<'a> {
		PolicyContext {
			request_id: strng::literal!("r"),
			route,
			metadata: md,
			headers,
			body: Some(body),
			path: None,
			query: None,
			status,
		}
	}

	fn route() -> RouteIdentity {
		RouteIdentity {
			api_id: strng::literal!("api-1"),
			api_name: strng::literal!("orders"),
			api_version: strng::literal!("v1"),
			operation_path: strng::literal!("/orders"),
			method: ::http::Method::POST,
		}
	}

	#[tokio::test]
	async fn request_transform_updates_body_and_headers() {
		let p = Transformation::new(
			serde_json::from_value(serde_json::json!({
				"kind": "jsonToXml",
				"onRequestFlow": true,
			}))
			.unwrap(),
		);
		let route = route();
		let mut md = Metadata::default();
		let mut headers = HeaderMap::new();
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		let body = BufferedBody::complete(r#"{"a":1}"#);
		let mut ctx = run_ctx(&route, &mut md, &headers, &body, None);
		let action = p.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!();
		};
		assert_eq!(m.body.as_deref(), Some(b"<root><a>1</a></root>".as_ref()));
		assert!(
			m.headers
				.set
				.iter()
				.any(|(k, v)| k == &header::CONTENT_TYPE && v == "application/xml")
		);
	}

	#[tokio::test]
	async fn mismatched_content_type_is_ignored() {
		let p = Transformation::new(
			serde_json::from_value(serde_json::json!({
				"kind": "jsonToXml",
				"onRequestFlow": true,
			}))
			.unwrap(),
		);
		let route = route();
		let mut md = Metadata::default();
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
		let body = BufferedBody::complete("not json");
		let mut ctx = run_ctx(&route, &mut md, &headers, &body, None);
		let action = p.on_request(&mut ctx).await.unwrap();
		let RequestAction::Modify(m) = action else {
			panic!();
		};
		assert!(m.body.is_none());
	}

	#[tokio::test]
	async fn invalid_request_json_is_a_400() {
		let p = Transformation::new(
			serde_json::from_value(serde_json::json!({
				"kind": "jsonToXml",
				"onRequestFlow": true,
			}))
			.unwrap(),
		);
		let route = route();
		let mut md = Metadata::default();
		let mut headers = HeaderMap::new();
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		let body = BufferedBody::complete("{broken");
		let mut ctx = run_ctx(&route, &mut md, &headers, &body, None);
		let action = p.on_request(&mut ctx).await.unwrap();
		let RequestAction::Direct(resp) = action else {
			panic!();
		};
		assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn response_xml_failure_is_a_500_but_json_passes_through() {
		let route = route();
		let mut headers = HeaderMap::new();
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/xml"),
		);
		let body = BufferedBody::complete("<broken");

		let x2j = Transformation::new(
			serde_json::from_value(serde_json::json!({
				"kind": "xmlToJson",
				"onResponseFlow": true,
			}))
			.unwrap(),
		);
		let mut md = Metadata::default();
		let mut ctx = run_ctx(&route, &mut md, &headers, &body, Some(StatusCode::OK));
		let action = x2j.on_response(&mut ctx).await.unwrap();
		assert!(matches!(action, ResponseAction::Direct(_)));

		let mut headers = HeaderMap::new();
		headers.insert(
			header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		let body = BufferedBody::complete("{broken");
		let j2x = Transformation::new(
			serde_json::from_value(serde_json::json!({
				"kind": "jsonToXml",
				"onResponseFlow": true,
			}))
			.unwrap(),
		);
		let mut md = Metadata::default();
		let mut ctx = run_ctx(&route, &mut md, &headers, &body, Some(StatusCode::OK));
		let action = j2x.on_response(&mut ctx).await.unwrap();
		assert!(matches!(action, ResponseAction::Modify(_)));
	}
}
