use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::http::{HeaderMap, MAX_BUFFERED_BODY, header};
use crate::jsonpath::JsonPath;
use crate::*;

#[apply(schema!)]
pub struct TokenCostSerde {
	/// Selector into the upstream response body, e.g. `usage.total_tokens`.
	pub json_path: JsonPath,
	/// Cost applied when extraction fails.
	#[serde(default = "default_cost")]
	pub default: u64,
}

fn default_cost() -> u64 {
	1
}

/// Derives the true cost of a request from the upstream response, so token
/// based limits can be settled after the fact. Handles gzip-encoded bodies.
#[derive(Debug, Clone)]
pub struct TokenCost {
	path: JsonPath,
	default: u64,
}

impl From<TokenCostSerde> for TokenCost {
	fn from(value: TokenCostSerde) -> Self {
		TokenCost {
			path: value.json_path,
			default: value.default,
		}
	}
}

impl TokenCost {
	pub fn extract(&self, headers: &HeaderMap, body: &[u8]) -> u64 {
		let decoded = match decode_body(headers, body) {
			Ok(d) => d,
			Err(err) => {
				debug!(%err, "failed to decode response body for token cost");
				return self.default;
			},
		};
		self
			.path
			.extract(&decoded)
			.ok()
			.and_then(|s| parse_units(&s))
			.unwrap_or(self.default)
	}
}

fn decode_body<'a>(headers: &HeaderMap, body: &'a [u8]) -> anyhow::Result<Cow<'a, [u8]>> {
	let gzipped = headers
		.get(header::CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("gzip"))
		.unwrap_or(false);
	if !gzipped {
		return Ok(Cow::Borrowed(body));
	}
	let mut out = Vec::new();
	GzDecoder::new(body)
		.take(MAX_BUFFERED_BODY as u64)
		.read_to_end(&mut out)?;
	Ok(Cow::Owned(out))
}

fn parse_units(s: &str) -> Option<u64> {
	let t = s.trim();
	t.parse::<u64>()
		.ok()
		.or_else(|| t.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use flate2::Compression;
	use flate2::write::GzEncoder;

	use crate::http::HeaderValue;

	use super::*;

	fn cost(path: &str, default: u64) -> TokenCost {
		TokenCost {
			path: JsonPath::parse(path).unwrap(),
			default,
		}
	}

	#[test]
	fn extracts_from_plain_body() {
		let c = cost("usage.total_tokens", 7);
		let headers = HeaderMap::new();
		assert_eq!(
			c.extract(&headers, br#"{"usage":{"total_tokens":42}}"#),
			42
		);
	}

	#[test]
	fn extracts_from_gzip_body() {
		let c = cost("usage.total_tokens", 7);
		let mut enc = GzEncoder::new(Vec::new(), Compression::default());
		enc
			.write_all(br#"{"usage":{"total_tokens":1337}}"#)
			.unwrap();
		let body = enc.finish().unwrap();
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
		assert_eq!(c.extract(&headers, &body), 1337);
	}

	#[test]
	fn default_applied_on_failure() {
		let c = cost("usage.total_tokens", 7);
		let headers = HeaderMap::new();
		assert_eq!(c.extract(&headers, b"not json"), 7);
		assert_eq!(c.extract(&headers, br#"{"usage":{}}"#), 7);

		// declared gzip but not actually compressed
		let mut headers = HeaderMap::new();
		headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
		assert_eq!(c.extract(&headers, br#"{"usage":{"total_tokens":9}}"#), 7);
	}

	#[test]
	fn fractional_counts_truncate() {
		let c = cost("cost", 1);
		let headers = HeaderMap::new();
		assert_eq!(c.extract(&headers, br#"{"cost":12.9}"#), 12);
	}
}
