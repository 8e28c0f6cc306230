use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"(?i)\bhttps?://[^\s<>"'`\\{}|\^\[\]]+"#).expect("static pattern compiles")
});

/// All URLs found in a text slice.
pub fn find_urls(text: &str) -> Vec<&str> {
	URL_PATTERN
		.find_iter(text)
		.map(|m| m.as_str().trim_end_matches(['.', ',', ';', ')']))
		.collect()
}

#[apply(schema_de!)]
pub struct UrlSerde {
	#[serde(default)]
	pub request: Option<UrlRule>,
	#[serde(default)]
	pub response: Option<UrlRule>,
}

#[apply(schema_de!)]
pub struct UrlRule {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub show_assessment: bool,
	#[serde(default = "default_true")]
	pub passthrough_on_error: bool,
	/// Validate with DNS resolution only; otherwise an HTTP HEAD probe is
	/// performed after resolution.
	#[serde(default = "default_true", alias = "onlyDNS")]
	pub only_dns: bool,
	#[serde(default = "default_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub timeout: Duration,
}

fn default_true() -> bool {
	true
}

fn default_timeout() -> Duration {
	Duration::from_secs(5)
}

impl UrlRule {
	fn into_guard(self) -> anyhow::Result<DirectionalGuard> {
		let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
			TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
		});
		let client = reqwest::Client::builder()
			.timeout(self.timeout)
			.build()
			.context("build URL probe client")?;
		Ok(DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(UrlCheck {
				resolver,
				client,
				only_dns: self.only_dns,
				timeout: self.timeout,
			}),
		))
	}
}

pub fn build(name: Strng, config: UrlSerde) -> anyhow::Result<Guardrail> {
	Ok(Guardrail::new(
		name,
		config.request.map(UrlRule::into_guard).transpose()?,
		config.response.map(UrlRule::into_guard).transpose()?,
	))
}

/// Every URL in the payload must be live: its host must resolve, and unless
/// `only_dns` is set, answer an HTTP HEAD within the timeout.
struct UrlCheck {
	resolver: TokioAsyncResolver,
	client: reqwest::Client,
	only_dns: bool,
	timeout: Duration,
}

impl UrlCheck {
	async fn probe(&self, raw: &str) -> Result<(), String> {
		let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;
		let Some(host) = parsed.host() else {
			return Err("URL has no host".to_string());
		};
		match host {
			url::Host::Domain(domain) => {
				let lookup = tokio::time::timeout(self.timeout, self.resolver.lookup_ip(domain)).await;
				match lookup {
					Ok(Ok(ips)) if ips.iter().next().is_some() => {},
					Ok(Ok(_)) => return Err("DNS returned no addresses".to_string()),
					Ok(Err(e)) => return Err(format!("DNS resolution failed: {e}")),
					Err(_) => return Err("DNS resolution timed out".to_string()),
				}
			},
			// IP literals need no resolution
			url::Host::Ipv4(_) | url::Host::Ipv6(_) => {},
		}
		if self.only_dns {
			return Ok(());
		}
		match self.client.head(parsed).send().await {
			Ok(_) => Ok(()),
			Err(e) => Err(format!("HEAD probe failed: {e}")),
		}
	}
}

#[async_trait::async_trait]
impl Check for UrlCheck {
	fn kind(&self) -> Strng {
		strng::literal!("URL_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let urls = find_urls(text);
		let mut failures = Vec::new();
		for u in &urls {
			if let Err(reason) = self.probe(u).await {
				failures.push(serde_json::json!({"url": u, "reason": reason}));
			}
		}
		if failures.is_empty() {
			Ok(Verdict::pass().with_assessment(serde_json::json!({"urls": urls})))
		} else {
			Ok(
				Verdict::fail(format!("{} of {} URLs failed validation", failures.len(), urls.len()))
					.with_assessment(serde_json::json!({"failures": failures})),
			)
		}
	}
}
