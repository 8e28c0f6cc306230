use parking_lot::RwLock;
use rand::Rng;
use rand::distr::Alphanumeric;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::semantic::embeddings::cosine_similarity;
use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
	#[error("vector store unavailable: {0}")]
	Unavailable(#[source] anyhow::Error),
	#[error("vector store rejected the operation: {0}")]
	Rejected(String),
}

/// A lookup hit: the stored payload and how close it was.
#[derive(Debug, Clone)]
pub struct ScoredHit {
	pub payload: Value,
	pub similarity: f32,
}

/// Stores `(embedding, payload)` pairs per namespace and answers
/// nearest-within-threshold queries by cosine similarity. Namespaces are an
/// absolute isolation boundary.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
	async fn store(
		&self,
		embedding: Vec<f32>,
		payload: Value,
		namespace: &str,
		ttl: Option<Duration>,
	) -> Result<(), VectorStoreError>;

	async fn lookup(
		&self,
		embedding: &[f32],
		namespace: &str,
		threshold: f32,
	) -> Result<Option<ScoredHit>, VectorStoreError>;
}

#[apply(schema_de!)]
#[derive(Copy, PartialEq, Eq)]
pub enum VectorStoreKind {
	#[serde(rename = "REDIS")]
	Redis,
	#[serde(rename = "MILVUS")]
	Milvus,
}

#[apply(schema_de!)]
pub struct VectorStoreSerde {
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
}

pub async fn build(config: &VectorStoreSerde) -> anyhow::Result<Arc<dyn VectorStore>> {
	match config.vector_store_provider {
		VectorStoreKind::Redis => Ok(Arc::new(RedisVectorStore::connect(config).await?)),
		VectorStoreKind::Milvus => Ok(Arc::new(MilvusVectorStore::new(config)?)),
	}
}

struct MemoryEntry {
	embedding: Vec<f32>,
	payload: Value,
	expires_at: Option<Instant>,
}

/// Process-local store; the reference backend and the test double.
#[derive(Default)]
pub struct MemoryVectorStore {
	entries: RwLock<HashMap<Strng, Vec<MemoryEntry>>>,
}

impl MemoryVectorStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl VectorStore for MemoryVectorStore {
	async fn store(
		&self,
		embedding: Vec<f32>,
		payload: Value,
		namespace: &str,
		ttl: Option<Duration>,
	) -> Result<(), VectorStoreError> {
		let mut entries = self.entries.write();
		let bucket = entries.entry(strng::new(namespace)).or_default();
		bucket.retain(|e| e.expires_at.map(|t| t > Instant::now()).unwrap_or(true));
		bucket.push(MemoryEntry {
			embedding,
			payload,
			expires_at: ttl.map(|t| Instant::now() + t),
		});
		Ok(())
	}

	async fn lookup(
		&self,
		embedding: &[f32],
		namespace: &str,
		threshold: f32,
	) -> Result<Option<ScoredHit>, VectorStoreError> {
		let entries = self.entries.read();
		let Some(bucket) = entries.get(namespace) else {
			return Ok(None);
		};
		let now = Instant::now();
		let mut best: Option<ScoredHit> = None;
		for e in bucket {
			if e.expires_at.map(|t| t <= now).unwrap_or(false) {
				continue;
			}
			let Ok(similarity) = cosine_similarity(embedding, &e.embedding) else {
				continue;
			};
			if similarity >= threshold
				&& best
					.as_ref()
					.map(|b| similarity > b.similarity)
					.unwrap_or(true)
			{
				best = Some(ScoredHit {
					payload: e.payload.clone(),
					similarity,
				});
			}
		}
		Ok(best)
	}
}

/// Entries live in one hash per id plus a per-namespace index set; lookups
/// scan the namespace and score client-side. Writes are best-effort and may
/// race; last writer wins.
pub struct RedisVectorStore {
	conn: ConnectionManager,
	prefix: String,
}

impl RedisVectorStore {
	pub async fn connect(config: &VectorStoreSerde) -> anyhow::Result<Self> {
		let info = redis::ConnectionInfo {
			addr: redis::ConnectionAddr::Tcp(
				config.db_host.clone(),
				config.db_port.unwrap_or(6379),
			),
			redis: redis::RedisConnectionInfo {
				db: 0,
				username: config.username.clone(),
				password: config
					.password
					.as_ref()
					.map(|p| p.expose_secret().to_string()),
				..Default::default()
			},
		};
		let client = redis::Client::open(info).context("invalid vector store configuration")?;
		let conn = client
			.get_connection_manager()
			.await
			.with_context(|| format!("connect to redis at {}", config.db_host))?;
		Ok(RedisVectorStore {
			conn,
			prefix: format!(
				"semcache:{}:",
				config.database.clone().unwrap_or_else(|| "default".to_string())
			),
		})
	}

	fn index_key(&self, namespace: &str) -> String {
		format!("{}{}:index", self.prefix, namespace)
	}

	fn entry_key(&self, namespace: &str, id: &str) -> String {
		format!("{}{}:{}", self.prefix, namespace, id)
	}
}

#[async_trait::async_trait]
impl VectorStore for RedisVectorStore {
	async fn store(
		&self,
		embedding: Vec<f32>,
		payload: Value,
		namespace: &str,
		ttl: Option<Duration>,
	) -> Result<(), VectorStoreError> {
		let mut conn = self.conn.clone();
		let id: String = rand::rng()
			.sample_iter(&Alphanumeric)
			.take(16)
			.map(char::from)
			.collect();
		let entry_key = self.entry_key(namespace, &id);
		let embedding_json =
			serde_json::to_string(&embedding).map_err(|e| VectorStoreError::Rejected(e.to_string()))?;
		let payload_json =
			serde_json::to_string(&payload).map_err(|e| VectorStoreError::Rejected(e.to_string()))?;
		let _: () = conn
			.hset_multiple(
				&entry_key,
				&[("embedding", embedding_json), ("payload", payload_json)],
			)
			.await
			.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		if let Some(ttl) = ttl {
			let _: () = conn
				.expire(&entry_key, ttl.as_secs() as i64)
				.await
				.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		}
		let _: () = conn
			.sadd(self.index_key(namespace), &id)
			.await
			.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		Ok(())
	}

	async fn lookup(
		&self,
		embedding: &[f32],
		namespace: &str,
		threshold: f32,
	) -> Result<Option<ScoredHit>, VectorStoreError> {
		let mut conn = self.conn.clone();
		let ids: Vec<String> = conn
			.smembers(self.index_key(namespace))
			.await
			.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		let mut best: Option<ScoredHit> = None;
		let mut dead = Vec::new();
		for id in ids {
			let entry_key = self.entry_key(namespace, &id);
			let fields: HashMap<String, String> = conn
				.hgetall(&entry_key)
				.await
				.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
			let (Some(embedding_json), Some(payload_json)) =
				(fields.get("embedding"), fields.get("payload"))
			else {
				// expired entry still referenced by the index
				dead.push(id);
				continue;
			};
			let Ok(stored) = serde_json::from_str::<Vec<f32>>(embedding_json) else {
				dead.push(id);
				continue;
			};
			let Ok(similarity) = cosine_similarity(embedding, &stored) else {
				continue;
			};
			if similarity >= threshold
				&& best
					.as_ref()
					.map(|b| similarity > b.similarity)
					.unwrap_or(true)
			{
				let payload = serde_json::from_str(payload_json)
					.map_err(|e| VectorStoreError::Rejected(e.to_string()))?;
				best = Some(ScoredHit {
					payload,
					similarity,
				});
			}
		}
		if !dead.is_empty() {
			let _: Result<(), _> = conn.srem(self.index_key(namespace), dead).await;
		}
		Ok(best)
	}
}

/// Milvus over its REST API. Collections are expected to exist; the
/// namespace is stored as a scalar field and enforced with a filter.
pub struct MilvusVectorStore {
	client: reqwest::Client,
	base: String,
	collection: String,
	token: Option<String>,
}

impl MilvusVectorStore {
	pub fn new(config: &VectorStoreSerde) -> anyhow::Result<Self> {
		let port = config.db_port.unwrap_or(19530);
		let host = config.db_host.trim_end_matches('/');
		let base = if host.starts_with("http") {
			format!("{host}:{port}")
		} else {
			format!("http://{host}:{port}")
		};
		let token = match (&config.username, &config.password) {
			(Some(u), Some(p)) => Some(format!("{u}:{}", p.expose_secret())),
			_ => None,
		};
		Ok(MilvusVectorStore {
			client: reqwest::Client::builder()
				.timeout(Duration::from_secs(10))
				.build()
				.context("build milvus client")?,
			base,
			collection: config
				.database
				.clone()
				.unwrap_or_else(|| "semantic_cache".to_string()),
			token,
		})
	}

	async fn post(&self, path: &str, body: Value) -> Result<Value, VectorStoreError> {
		let mut req = self.client.post(format!("{}{path}", self.base)).json(&body);
		if let Some(token) = &self.token {
			req = req.bearer_auth(token);
		}
		let resp = req
			.send()
			.await
			.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		let status = resp.status();
		if !status.is_success() {
			return Err(VectorStoreError::Rejected(format!(
				"milvus returned {status}"
			)));
		}
		let v = resp
			.json::<Value>()
			.await
			.map_err(|e| VectorStoreError::Unavailable(e.into()))?;
		if v.get("code").and_then(Value::as_i64).unwrap_or(0) != 0 {
			return Err(VectorStoreError::Rejected(v.to_string()));
		}
		Ok(v)
	}
}

#[async_trait::async_trait]
impl VectorStore for MilvusVectorStore {
	async fn store(
		&self,
		embedding: Vec<f32>,
		payload: Value,
		namespace: &str,
		_ttl: Option<Duration>,
	) -> Result<(), VectorStoreError> {
		// Milvus expiry is collection-level; per-entry TTLs are not supported.
		let body = serde_json::json!({
			"collectionName": self.collection,
			"data": [{
				"vector": embedding,
				"namespace": namespace,
				"payload": payload.to_string(),
			}],
		});
		self.post("/v2/vectordb/entities/insert", body).await?;
		Ok(())
	}

	async fn lookup(
		&self,
		embedding: &[f32],
		namespace: &str,
		threshold: f32,
	) -> Result<Option<ScoredHit>, VectorStoreError> {
		let body = serde_json::json!({
			"collectionName": self.collection,
			"data": [embedding],
			"filter": format!("namespace == \"{namespace}\""),
			"limit": 1,
			"outputFields": ["payload"],
			"searchParams": {"metricType": "COSINE"},
		});
		let v = self.post("/v2/vectordb/entities/search", body).await?;
		let Some(hit) = v
			.get("data")
			.and_then(Value::as_array)
			.and_then(|a| a.first())
		else {
			return Ok(None);
		};
		let similarity = hit
			.get("distance")
			.and_then(Value::as_f64)
			.unwrap_or_default() as f32;
		if similarity < threshold {
			return Ok(None);
		}
		let payload = hit
			.get("payload")
			.and_then(Value::as_str)
			.and_then(|s| serde_json::from_str(s).ok())
			.unwrap_or(Value::Null);
		Ok(Some(ScoredHit {
			payload,
			similarity,
		}))
	}
}
