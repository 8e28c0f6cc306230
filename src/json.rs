use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::*;

pub fn traverse<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
	if path.is_empty() {
		return Some(value);
	}
	path.iter().try_fold(value, |target, token| match target {
		Value::Object(map) => map.get(*token),
		Value::Array(list) => parse_index(token).and_then(|x| list.get(x)),
		_ => None,
	})
}

pub fn traverse_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
	if path.is_empty() {
		return Some(value);
	}
	path.iter().try_fold(value, |target, token| match target {
		Value::Object(map) => map.get_mut(*token),
		Value::Array(list) => parse_index(token).and_then(|x| list.get_mut(x)),
		_ => None,
	})
}

fn parse_index(s: &str) -> Option<usize> {
	if s.starts_with('+') || (s.starts_with('0') && s.len() != 1) {
		return None;
	}
	s.parse().ok()
}

pub async fn from_body<T: DeserializeOwned>(body: http::Body) -> anyhow::Result<T> {
	let bytes = http::to_bytes(body).await?;
	let t = serde_json::from_slice::<T>(bytes.as_ref())?;
	Ok(t)
}

pub fn to_body<T: Serialize>(j: T) -> anyhow::Result<http::Body> {
	let bytes = serde_json::to_vec(&j)?;
	Ok(http::Body::from(bytes))
}
