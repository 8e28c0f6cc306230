use std::hash::{Hash, Hasher};
use std::time::UNIX_EPOCH;

use secrecy::SecretString;
use serde_json::Value;

use crate::http::{HeaderValue, StatusCode, header, x_headers};
use crate::jsonpath::JsonPath;
use crate::policy::{
	ImmediateResponse, Policy, PolicyContext, PolicyError, ProcessingMode, RequestAction,
	ResponseAction, meta,
};
use crate::semantic::embeddings::{Embedder, EmbeddingProviderKind, EmbeddingSerde};
use crate::semantic::vectorstore::{VectorStore, VectorStoreKind, VectorStoreSerde};
use crate::*;

const META_REQUEST_HASH: &str = "semantic_cache.request_hash";

#[apply(schema_de!)]
pub struct SemanticCacheSerde {
	pub embedding_provider: EmbeddingProviderKind,
	#[serde(default)]
	pub embedding_endpoint: Option<String>,
	#[serde(default)]
	pub embedding_model: Option<String>,
	#[serde(default = "default_dimension")]
	pub embedding_dimension: usize,
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub api_key: SecretString,
	pub vector_store_provider: VectorStoreKind,
	pub db_host: String,
	#[serde(default)]
	pub db_port: Option<u16>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	#[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
	pub password: Option<SecretString>,
	#[serde(default)]
	pub database: Option<String>,
	/// Entry lifetime in seconds; 0 keeps entries forever.
	#[serde(default)]
	pub ttl: u64,
	#[serde(default = "default_threshold")]
	pub similarity_threshold: f32,
	#[serde(default)]
	pub json_path: Option<JsonPath>,
}

fn default_dimension() -> usize {
	1536
}

fn default_threshold() -> f32 {
	0.8
}

impl SemanticCacheSerde {
	fn embedding(&self) -> EmbeddingSerde {
		EmbeddingSerde {
			embedding_provider: self.embedding_provider,
			embedding_endpoint: self.embedding_endpoint.clone(),
			embedding_model: self.embedding_model.clone(),
			embedding_dimension: self.embedding_dimension,
			api_key: self.api_key.clone(),
		}
	}

	fn store(&self) -> VectorStoreSerde {
		VectorStoreSerde {
			vector_store_provider: self.vector_store_provider,
			db_host: self.db_host.clone(),
			db_port: self.db_port,
			username: self.username.clone(),
			password: self.password.clone(),
			database: self.database.clone(),
		}
	}
}

/// Serves repeated prompts from the vector store. Lookups happen in the
/// request phase; inserts happen best-effort in the response phase. Every
/// infrastructure failure degrades to forwarding the request untouched.
pub struct SemanticCache {
	embedder: Arc<dyn Embedder>,
	store: Arc<dyn VectorStore>,
	threshold: f32,
	ttl: Option<Duration>,
	json_path: Option<JsonPath>,
}

impl SemanticCache {
	pub async fn build(config: SemanticCacheSerde) -> anyhow::Result<Self> {
		let embedder = crate::semantic::embeddings::cached_embedder(&config.embedding())?;
		let store = crate::semantic::vectorstore::build(&config.store()).await?;
		Ok(Self::new(
			embedder,
			store,
			config.similarity_threshold,
			config.ttl,
			config.json_path,
		))
	}

	pub fn new(
		embedder: Arc<dyn Embedder>,
		store: Arc<dyn VectorStore>,
		threshold: f32,
		ttl_secs: u64,
		json_path: Option<JsonPath>,
	) -> Self {
		SemanticCache {
			embedder,
			store,
			threshold,
			ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
			json_path,
		}
	}

	fn namespace(&self, ctx: &PolicyContext<'_>) -> Strng {
		if ctx.route.api_name.is_empty() {
			ctx.request_id.clone()
		} else {
			ctx.route.namespace()
		}
	}
}

#[async_trait::async_trait]
impl Policy for SemanticCache {
	fn name(&self) -> Strng {
		strng::literal!("semantic-cache")
	}

	fn mode(&self) -> ProcessingMode {
		ProcessingMode::buffered_bidirectional()
	}

	async fn on_request(&self, ctx: &mut PolicyContext<'_>) -> Result<RequestAction, PolicyError> {
		let body = ctx.body_bytes();
		let text = match crate::jsonpath::extract_or_body(self.json_path.as_ref(), body) {
			Ok(t) => t,
			Err(err) => {
				debug!(%err, "cache key extraction failed, skipping cache");
				return Ok(RequestAction::pass());
			},
		};
		let embedding = match self.embedder.embed(&text).await {
			Ok(e) => e,
			Err(err) => {
				warn!(%err, "embedding provider failed, skipping cache");
				return Ok(RequestAction::pass());
			},
		};
		let namespace = self.namespace(ctx);
		match self.store.lookup(&embedding, &namespace, self.threshold).await {
			Ok(Some(hit)) => {
				debug!(%namespace, similarity = hit.similarity, "semantic cache hit");
				let body = hit
					.payload
					.get("payload")
					.cloned()
					.unwrap_or(hit.payload);
				let bytes = serde_json::to_vec(&body).unwrap_or_default();
				return Ok(RequestAction::Direct(
					ImmediateResponse::new(StatusCode::OK)
						.with_header(
							header::CONTENT_TYPE,
							HeaderValue::from_static("application/json"),
						)
						.with_header(x_headers::X_CACHE_STATUS, HeaderValue::from_static("HIT"))
						.with_body(bytes),
				));
			},
			Ok(None) => {},
			Err(err) => {
				warn!(%err, "vector store lookup failed, skipping cache");
				return Ok(RequestAction::pass());
			},
		}
		let serialized = serde_json::to_string(&embedding)
			.map_err(|e| PolicyError::Internal(e.into()))?;
		ctx
			.metadata
			.set(meta::SEMANTIC_CACHE_EMBEDDING, serialized);
		let mut h = std::hash::DefaultHasher::new();
		text.hash(&mut h);
		ctx
			.metadata
			.set(META_REQUEST_HASH, format!("{:x}", h.finish()));
		Ok(RequestAction::pass())
	}

	async fn on_response(&self, ctx: &mut PolicyContext<'_>) -> Result<ResponseAction, PolicyError> {
		if ctx.status != Some(StatusCode::OK) {
			return Ok(ResponseAction::pass());
		}
		let Some(serialized) = ctx.metadata.get_str(meta::SEMANTIC_CACHE_EMBEDDING) else {
			return Ok(ResponseAction::pass());
		};
		let Ok(embedding) = serde_json::from_str::<Vec<f32>>(serialized) else {
			return Ok(ResponseAction::pass());
		};
		let Ok(response_json) = serde_json::from_slice::<Value>(ctx.body_bytes()) else {
			return Ok(ResponseAction::pass());
		};
		let payload = serde_json::json!({
			"payload": response_json,
			"requestHash": ctx.metadata.get_str(META_REQUEST_HASH).unwrap_or_default(),
			"timestamp": SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_secs(),
		});
		let namespace = self.namespace(ctx);
		if let Err(err) = self
			.store
			.store(embedding, payload, &namespace, self.ttl)
			.await
		{
			debug!(%err, %namespace, "semantic cache insert failed");
		}
		Ok(ResponseAction::pass())
	}
}
