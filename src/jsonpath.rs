use serde_json::Value;

use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
	#[error("invalid path segment {0:?}")]
	InvalidSegment(String),
	#[error("path {0:?} did not match the payload")]
	NotFound(String),
	#[error("payload is not valid JSON: {0}")]
	InvalidJson(#[from] serde_json::Error),
	#[error("payload is not valid UTF-8")]
	InvalidUtf8,
}

/// A dotted path into a JSON document, with optional `[idx]` array steps and an
/// optional leading `$.`. An empty path addresses the whole document, rendered
/// as a string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonPath {
	raw: Strng,
	segments: Vec<String>,
}

impl TryFrom<&str> for JsonPath {
	type Error = PathError;
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		JsonPath::parse(value)
	}
}

impl std::str::FromStr for JsonPath {
	type Err = PathError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		JsonPath::parse(s)
	}
}

impl Display for JsonPath {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.raw)
	}
}

impl<'de> serde::Deserialize<'de> for JsonPath {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		JsonPath::parse(&s).map_err(serde::de::Error::custom)
	}
}

impl Serialize for JsonPath {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.raw)
	}
}

impl JsonPath {
	pub fn parse(path: &str) -> Result<Self, PathError> {
		let trimmed = path.trim();
		let stripped = trimmed
			.strip_prefix("$.")
			.or_else(|| trimmed.strip_prefix('$'))
			.unwrap_or(trimmed);
		let mut segments = Vec::new();
		if stripped.is_empty() {
			return Ok(JsonPath {
				raw: strng::new(trimmed),
				segments,
			});
		}
		for part in stripped.split('.') {
			if part.is_empty() {
				return Err(PathError::InvalidSegment(part.to_string()));
			}
			// `key[0][1]` becomes `key`, `0`, `1`
			let (key, indexes) = match part.find('[') {
				Some(pos) => part.split_at(pos),
				None => (part, ""),
			};
			if !key.is_empty() {
				segments.push(key.to_string());
			}
			let mut rest = indexes;
			while !rest.is_empty() {
				let Some(end) = rest.find(']') else {
					return Err(PathError::InvalidSegment(part.to_string()));
				};
				let idx = &rest[1..end];
				if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
					return Err(PathError::InvalidSegment(part.to_string()));
				}
				segments.push(idx.to_string());
				rest = &rest[end + 1..];
				if !rest.is_empty() && !rest.starts_with('[') {
					return Err(PathError::InvalidSegment(part.to_string()));
				}
			}
		}
		Ok(JsonPath {
			raw: strng::new(trimmed),
			segments,
		})
	}

	/// Whether this path addresses the whole document.
	pub fn is_root(&self) -> bool {
		self.segments.is_empty()
	}

	pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
		let parts = self.segments.iter().map(String::as_str).collect::<Vec<_>>();
		json::traverse(value, &parts)
	}

	/// Extract the addressed field as text. Strings are returned unquoted;
	/// any other node is rendered as JSON. The root path returns the raw body
	/// as a UTF-8 string without requiring it to be JSON.
	pub fn extract(&self, body: &[u8]) -> Result<String, PathError> {
		if self.is_root() {
			return std::str::from_utf8(body)
				.map(|s| s.to_string())
				.map_err(|_| PathError::InvalidUtf8);
		}
		let value: Value = serde_json::from_slice(body)?;
		let target = self
			.resolve(&value)
			.ok_or_else(|| PathError::NotFound(self.raw.to_string()))?;
		Ok(render(target))
	}

	/// Replace the addressed field with `replacement`, returning the updated
	/// body. When the original node was a string the replacement stays a
	/// string; otherwise the replacement is parsed as JSON where possible.
	pub fn update(&self, body: &[u8], replacement: &str) -> Result<Bytes, PathError> {
		if self.is_root() {
			return Ok(Bytes::copy_from_slice(replacement.as_bytes()));
		}
		let mut value: Value = serde_json::from_slice(body)?;
		{
			let parts = self.segments.iter().map(String::as_str).collect::<Vec<_>>();
			let target = json::traverse_mut(&mut value, &parts)
				.ok_or_else(|| PathError::NotFound(self.raw.to_string()))?;
			*target = if target.is_string() {
				Value::String(replacement.to_string())
			} else {
				serde_json::from_str(replacement).unwrap_or_else(|_| Value::String(replacement.to_string()))
			};
		}
		Ok(Bytes::from(serde_json::to_vec(&value)?))
	}
}

fn render(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// Extract with the conventional default: no configured path means the whole
/// body is treated as one string.
pub fn extract_or_body(path: Option<&JsonPath>, body: &[u8]) -> Result<String, PathError> {
	match path {
		Some(p) => p.extract(body),
		None => std::str::from_utf8(body)
			.map(|s| s.to_string())
			.map_err(|_| PathError::InvalidUtf8),
	}
}
