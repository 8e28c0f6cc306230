use secrecy::{ExposeSecret, SecretString};

use crate::guardrail::{Check, CheckError, DirectionalGuard, Guardrail, GuardrailCommon, Verdict};
use crate::jsonpath::JsonPath;
use crate::*;

const API_VERSION: &str = "2024-09-01";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[apply(schema_de!)]
pub struct ContentSafetySerde {
	#[serde(default)]
	pub request: Option<ContentSafetyRule>,
	#[serde(default)]
	pub response: Option<ContentSafetyRule>,
}

#[apply(schema_de!)]
pub struct ContentSafetyRule {
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub invert: bool,
	#[serde(default)]
	pub show_assessment: bool,
	#[serde(default = "default_true")]
	pub passthrough_on_error: bool,
	/// Base endpoint, e.g. `https://<resource>.cognitiveservices.azure.com`.
	pub endpoint: String,
	#[serde(serialize_with = "ser_redact")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub subscription_key: SecretString,
	/// Per-category severity thresholds; `-1` disables a category.
	#[serde(default = "default_threshold")]
	pub hate: i8,
	#[serde(default = "default_threshold")]
	pub self_harm: i8,
	#[serde(default = "default_threshold")]
	pub sexual: i8,
	#[serde(default = "default_threshold")]
	pub violence: i8,
	#[serde(default = "default_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub timeout: Duration,
}

fn default_true() -> bool {
	true
}

fn default_threshold() -> i8 {
	-1
}

fn default_timeout() -> Duration {
	Duration::from_secs(5)
}

impl ContentSafetyRule {
	fn into_guard(self) -> anyhow::Result<DirectionalGuard> {
		let thresholds = [
			("Hate", self.hate),
			("SelfHarm", self.self_harm),
			("Sexual", self.sexual),
			("Violence", self.violence),
		]
		.into_iter()
		.filter(|(_, t)| *t >= 0)
		.map(|(c, t)| (c.to_string(), t as u8))
		.collect::<Vec<_>>();
		if thresholds.is_empty() {
			anyhow::bail!("content safety requires at least one category threshold");
		}
		let client = reqwest::Client::builder()
			.timeout(self.timeout)
			.build()
			.context("build content safety client")?;
		Ok(DirectionalGuard::new(
			GuardrailCommon {
				json_path: self.json_path,
				invert: self.invert,
				show_assessment: self.show_assessment,
				passthrough_on_error: self.passthrough_on_error,
			},
			Arc::new(ContentSafetyCheck {
				client,
				endpoint: self.endpoint.trim_end_matches('/').to_string(),
				subscription_key: self.subscription_key,
				thresholds,
			}),
		))
	}
}

pub fn build(name: Strng, config: ContentSafetySerde) -> anyhow::Result<Guardrail> {
	Ok(Guardrail::new(
		name,
		config.request.map(ContentSafetyRule::into_guard).transpose()?,
		config
			.response
			.map(ContentSafetyRule::into_guard)
			.transpose()?,
	))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
	text: &'a str,
	categories: Vec<&'a str>,
	output_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
	#[serde(default)]
	categories_analysis: Vec<CategorySeverity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategorySeverity {
	category: String,
	#[serde(default)]
	severity: u8,
}

/// Sends the extracted text to Azure Content Safety and blocks when any
/// enabled category reaches its severity threshold. Transient provider
/// failures are retried with bounded exponential backoff.
struct ContentSafetyCheck {
	client: reqwest::Client,
	endpoint: String,
	subscription_key: SecretString,
	thresholds: Vec<(String, u8)>,
}

impl ContentSafetyCheck {
	async fn analyze(&self, text: &str) -> anyhow::Result<AnalyzeResponse> {
		let url = format!(
			"{}/contentsafety/text:analyze?api-version={API_VERSION}",
			self.endpoint
		);
		let body = AnalyzeRequest {
			text,
			categories: self.thresholds.iter().map(|(c, _)| c.as_str()).collect(),
			output_type: "FourSeverityLevels",
		};
		let mut last_err = None;
		for attempt in 0..MAX_ATTEMPTS {
			if attempt > 0 {
				tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
			}
			let res = self
				.client
				.post(&url)
				.header("Ocp-Apim-Subscription-Key", self.subscription_key.expose_secret())
				.json(&body)
				.send()
				.await;
			match res {
				Ok(resp) => {
					let status = resp.status();
					if status.is_success() {
						return Ok(resp.json::<AnalyzeResponse>().await?);
					}
					if status.as_u16() == 429 || status.is_server_error() {
						last_err = Some(anyhow::anyhow!("content safety returned {status}"));
						continue;
					}
					anyhow::bail!("content safety returned {status}");
				},
				Err(e) => {
					last_err = Some(e.into());
				},
			}
		}
		Err(last_err.unwrap_or_else(|| anyhow::anyhow!("content safety unreachable")))
	}
}

#[async_trait::async_trait]
impl Check for ContentSafetyCheck {
	fn kind(&self) -> Strng {
		strng::literal!("AZURE_CONTENT_SAFETY_GUARDRAIL")
	}

	async fn validate(&self, text: &str) -> Result<Verdict, CheckError> {
		let analysis = self
			.analyze(text)
			.await
			.map_err(CheckError::Dependency)?;
		let mut violations = Vec::new();
		for (category, threshold) in &self.thresholds {
			let severity = analysis
				.categories_analysis
				.iter()
				.find(|c| c.category.eq_ignore_ascii_case(category))
				.map(|c| c.severity)
				.unwrap_or(0);
			if severity >= *threshold {
				violations.push(category.clone());
			}
		}
		let assessment = serde_json::to_value(&analysis.categories_analysis).unwrap_or_default();
		if violations.is_empty() {
			Ok(Verdict::pass().with_assessment(assessment))
		} else {
			Ok(
				Verdict::fail(format!("content flagged for: {}", violations.join(", ")))
					.with_assessment(assessment),
			)
		}
	}
}
