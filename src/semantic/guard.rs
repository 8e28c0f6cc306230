use secrecy::SecretString;

use crate::guardrail::{Direction, Intervention};
use crate::jsonpath::JsonPath;
use crate::policy::{Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction};
use crate::semantic::embeddings::{
	Embedder, EmbeddingProviderKind, EmbeddingSerde, cosine_similarity,
};
use crate::*;

#[apply(schema_de!)]
pub struct SemanticGuardSerde {
	pub embedding_provider: EmbeddingProviderKind,
	#[serde(default)]
	pub embedding_endpoint: Option<String>,
	#[serde(default)]
	pub embedding_model: Option<String>,
	#[serde(default = "default_dimension")]
	pub embedding_dimension: usize,
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub api_key: SecretString,
	/// Prompts must stay away from these.
	#[serde(default)]
	pub deny: Vec<String>,
	/// When non-empty, prompts must be close to at least one of these.
	#[serde(default)]
	pub allow: Vec<String>,
	#[serde(default = "default_threshold")]
	pub deny_similarity_threshold: f32,
	#[serde(default = "default_threshold")]
	pub allow_similarity_threshold: f32,
	#[serde(default)]
	pub json_path: Option<JsonPath>,
	#[serde(default)]
	pub show_assessment: bool,
}

fn default_dimension() -> usize {
	1536
}

fn default_threshold() -> f32 {
	0.8
}

/// Blocks prompts by semantic proximity to configured phrase lists. The
/// phrase embeddings are computed once at construction; a provider failure
/// there fails the policy.
pub struct SemanticGuard {
	embedder: Arc<dyn Embedder>,
	deny: Vec<(String, Vec<f32>)>,
	allow: Vec<(String, Vec<f32>)>,
	deny_threshold: f32,
	allow_threshold: f32,
	json_path: Option<JsonPath>,
	show_assessment: bool,
}

const KIND: Strng = strng::literal!("SEMANTIC_PROMPT_GUARD");

impl SemanticGuard {
	pub async fn build(config: SemanticGuardSerde) -> anyhow::Result<Self> {
		let embedding = EmbeddingSerde {
			embedding_provider: config.embedding_provider,
			embedding_endpoint: config.embedding_endpoint.clone(),
			embedding_model: config.embedding_model.clone(),
			embedding_dimension: config.embedding_dimension,
			api_key: config.api_key.clone(),
		};
		let embedder = crate::semantic::embeddings::cached_embedder(&embedding)?;
		Self::with_embedder(embedder, config).await
	}

	pub async fn with_embedder(
		embedder: Arc<dyn Embedder>,
		config: SemanticGuardSerde,
	) -> anyhow::Result<Self> {
		if config.deny.is_empty() && config.allow.is_empty() {
			anyhow::bail!("semantic prompt guard requires allow or deny phrases");
		}
		let deny_embeddings = embedder
			.embed_batch(&config.deny)
			.await
			.context("embed deny phrases")?;
		let allow_embeddings = embedder
			.embed_batch(&config.allow)
			.await
			.context("embed allow phrases")?;
		Ok(SemanticGuard {
			embedder,
			deny: config.deny.into_iter().zip(deny_embeddings).collect(),
			allow: config.allow.into_iter().zip(allow_embeddings).collect(),
			deny_threshold: config.deny_similarity_threshold,
			allow_threshold: config.allow_similarity_threshold,
			json_path: config.json_path,
			show_assessment: config.show_assessment,
		})
	}

	fn best_match<'a>(
		prompt: &[f32],
		phrases: &'a [(String, Vec<f32>)],
	) -> Option<(&'a str, f32)> {
		let mut best: Option<(&str, f32)> = None;
		for (phrase, embedding) in phrases {
			let Ok(similarity) = cosine_similarity(prompt, embedding) else {
				continue;
			};
			if best.map(|(_, s)| similarity > s).unwrap_or(true) {
				best = Some((phrase, similarity));
			}
		}
		best
	}

	fn block(&self, reason: String, phrase: Option<(&str, f32)>) -> RequestAction {
		let assessments = if self.show_assessment {
			phrase.map(|(p, s)| serde_json::json!({"phrase": p, "similarity": s}))
		} else {
			None
		};
		RequestAction::Direct(
			Intervention::new(KIND.clone(), Direction::Request, reason)
				.with_assessments(assessments)
				.response(),
		)
	}
}

#[async_trait::async_trait]
impl Policy for SemanticGuard {
	fn name(&self) -> Strng {
		strng::literal!("semantic-prompt-guard")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::buffered_request()
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let text = match crate::jsonpath::extract_or_body(self.json_path.as_ref(), ctx.body_bytes())
		{
			Ok(t) => t,
			Err(err) => {
				debug!(%err, "prompt extraction failed, guard skipped");
				return Ok(RequestAction::pass());
			},
		};
		let prompt = match self.embedder.embed(&text).await {
			Ok(e) => e,
			Err(err) => {
				warn!(%err, "embedding provider failed, guard skipped");
				return Ok(RequestAction::pass());
			},
		};
		if let Some((phrase, similarity)) = Self::best_match(&prompt, &self.deny)
			&& similarity >= self.deny_threshold
		{
			debug!(%phrase, similarity, "prompt matched a denied phrase");
			return Ok(self.block(
				"prompt is too similar to a denied phrase".to_string(),
				Some((phrase, similarity)),
			));
		}
		if !self.allow.is_empty() {
			let best = Self::best_match(&prompt, &self.allow);
			let matched = best.map(|(_, s)| s >= self.allow_threshold).unwrap_or(false);
			if !matched {
				return Ok(self.block(
					"prompt does not match any allowed phrase".to_string(),
					best,
				));
			}
		}
		Ok(RequestAction::pass())
	}
}
