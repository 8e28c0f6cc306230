use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
	#[error("embedding request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("embedding provider returned {0}: {1}")]
	Status(::http::StatusCode, String),
	#[error("embedding has dimension {got}, expected {want}")]
	Dimension { got: usize, want: usize },
	#[error("embedding response missing data")]
	MissingData,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SimilarityError {
	#[error("vector lengths differ: {a} vs {b}")]
	LengthMismatch { a: usize, b: usize },
	#[error("cannot compare a zero-norm vector")]
	ZeroNorm,
}

/// Cosine similarity over equal-length vectors. Zero-norm inputs are an
/// error; callers treat them as "skip caching", never as a zero score.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
	if a.len() != b.len() {
		return Err(SimilarityError::LengthMismatch {
			a: a.len(),
			b: b.len(),
		});
	}
	let mut dot = 0f64;
	let mut na = 0f64;
	let mut nb = 0f64;
	for (x, y) in a.iter().zip(b.iter()) {
		dot += (*x as f64) * (*y as f64);
		na += (*x as f64) * (*x as f64);
		nb += (*y as f64) * (*y as f64);
	}
	if na == 0.0 || nb == 0.0 {
		return Err(SimilarityError::ZeroNorm);
	}
	Ok((dot / (na.sqrt() * nb.sqrt())) as f32)
}

/// Converts text into fixed-dimension vectors. Implementations must be safe
/// to share across requests.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
	async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

	async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
		let mut out = Vec::with_capacity(texts.len());
		for t in texts {
			out.push(self.embed(t).await?);
		}
		Ok(out)
	}

	fn dimension(&self) -> usize;
}

#[apply(schema_de!)]
#[derive(Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingProviderKind {
	#[serde(rename = "OPENAI")]
	OpenAi,
	#[serde(rename = "MISTRAL")]
	Mistral,
	#[serde(rename = "AZURE_OPENAI")]
	AzureOpenAi,
}

#[apply(schema_de!)]
pub struct EmbeddingSerde {
	pub embedding_provider: EmbeddingProviderKind,
	#[serde(default)]
	pub embedding_endpoint: Option<String>,
	/// Required for every provider except Azure, where the deployment is part
	/// of the endpoint.
	#[serde(default)]
	pub embedding_model: Option<String>,
	#[serde(default = "default_dimension")]
	pub embedding_dimension: usize,
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub api_key: SecretString,
}

fn default_dimension() -> usize {
	1536
}

const OPENAI_EMBEDDINGS: &str = "https://api.openai.com/v1/embeddings";
const MISTRAL_EMBEDDINGS: &str = "https://api.mistral.ai/v1/embeddings";

enum AuthHeader {
	Bearer,
	ApiKey,
}

/// One HTTP embedding provider instance. All three providers speak the same
/// embeddings wire shape; they differ in endpoint and auth header.
pub struct HttpEmbedder {
	client: reqwest::Client,
	endpoint: String,
	model: Option<String>,
	dimension: usize,
	auth: AuthHeader,
	api_key: SecretString,
}

impl HttpEmbedder {
	pub fn new(config: &EmbeddingSerde) -> anyhow::Result<Self> {
		let (endpoint, auth) = match config.embedding_provider {
			EmbeddingProviderKind::OpenAi => (
				config
					.embedding_endpoint
					.clone()
					.unwrap_or_else(|| OPENAI_EMBEDDINGS.to_string()),
				AuthHeader::Bearer,
			),
			EmbeddingProviderKind::Mistral => (
				config
					.embedding_endpoint
					.clone()
					.unwrap_or_else(|| MISTRAL_EMBEDDINGS.to_string()),
				AuthHeader::Bearer,
			),
			EmbeddingProviderKind::AzureOpenAi => (
				config
					.embedding_endpoint
					.clone()
					.ok_or_else(|| anyhow::anyhow!("embeddingEndpoint is required for AZURE_OPENAI"))?,
				AuthHeader::ApiKey,
			),
		};
		if config.embedding_model.is_none()
			&& config.embedding_provider != EmbeddingProviderKind::AzureOpenAi
		{
			anyhow::bail!(
				"embeddingModel is required for {:?}",
				config.embedding_provider
			);
		}
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.context("build embedding client")?;
		Ok(HttpEmbedder {
			client,
			endpoint,
			model: config.embedding_model.clone(),
			dimension: config.embedding_dimension,
			auth,
			api_key: config.api_key.clone(),
		})
	}
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
	input: &'a [String],
	#[serde(skip_serializing_if = "Option::is_none")]
	model: Option<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
	data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
	#[serde(default)]
	index: usize,
	embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
	async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
		let mut v = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
		v.pop().ok_or(EmbedError::MissingData)
	}

	async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
		let body = EmbeddingsRequest {
			input: texts,
			model: self.model.as_deref(),
		};
		let mut req = self.client.post(&self.endpoint).json(&body);
		req = match self.auth {
			AuthHeader::Bearer => req.bearer_auth(self.api_key.expose_secret()),
			AuthHeader::ApiKey => req.header("api-key", self.api_key.expose_secret()),
		};
		let resp = req.send().await?;
		let status = resp.status();
		if !status.is_success() {
			let detail = resp.text().await.unwrap_or_default();
			return Err(EmbedError::Status(status, detail));
		}
		let mut parsed = resp.json::<EmbeddingsResponse>().await?;
		if parsed.data.len() != texts.len() {
			return Err(EmbedError::MissingData);
		}
		parsed.data.sort_by_key(|d| d.index);
		let mut out = Vec::with_capacity(parsed.data.len());
		for d in parsed.data {
			if d.embedding.len() != self.dimension {
				return Err(EmbedError::Dimension {
					got: d.embedding.len(),
					want: self.dimension,
				});
			}
			out.push(d.embedding);
		}
		Ok(out)
	}

	fn dimension(&self) -> usize {
		self.dimension
	}
}

static EMBEDDERS: Lazy<Mutex<HashMap<u64, Arc<HttpEmbedder>>>> =
	Lazy::new(|| Mutex::new(HashMap::new()));

/// Provider instances are cached per configuration; a changed configuration
/// hashes differently and triggers a rebuild.
pub fn cached_embedder(config: &EmbeddingSerde) -> anyhow::Result<Arc<HttpEmbedder>> {
	let mut h = std::hash::DefaultHasher::new();
	config.embedding_provider.hash(&mut h);
	config.embedding_endpoint.hash(&mut h);
	config.embedding_model.hash(&mut h);
	config.embedding_dimension.hash(&mut h);
	config.api_key.expose_secret().hash(&mut h);
	let key = h.finish();

	let mut cache = EMBEDDERS.lock();
	if let Some(existing) = cache.get(&key) {
		return Ok(existing.clone());
	}
	let built = Arc::new(HttpEmbedder::new(config)?);
	cache.insert(key, built.clone());
	Ok(built)
}
