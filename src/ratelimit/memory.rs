use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::ratelimit::{Algorithm, LimitError, Limiter, Quota, RateLimitResult, now_nanos};
use crate::*;

const SHARDS: usize = 16;

#[apply(schema!)]
#[derive(Copy, PartialEq, Eq)]
pub struct MemorySettings {
	#[serde(default = "default_max_entries")]
	pub max_entries: usize,
	#[serde(default = "default_cleanup_interval", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub cleanup_interval: Duration,
}

impl Default for MemorySettings {
	fn default() -> Self {
		MemorySettings {
			max_entries: default_max_entries(),
			cleanup_interval: default_cleanup_interval(),
		}
	}
}

fn default_max_entries() -> usize {
	100_000
}

fn default_cleanup_interval() -> Duration {
	Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy)]
enum Slot {
	Tat(u64),
	Window { start: u64, count: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
	slot: Slot,
	expires_at: u64,
	last_access: u64,
}

/// Process-local rate limit store. Keys are spread over striped locks; a
/// background task prunes expired entries and the map is bounded with
/// oldest-first eviction.
pub struct MemoryLimiter {
	quota: Quota,
	shards: Arc<Vec<Mutex<HashMap<Strng, Entry>>>>,
	max_entries: usize,
	cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for MemoryLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryLimiter").finish()
	}
}

impl MemoryLimiter {
	pub fn new(quota: Quota, settings: MemorySettings) -> Self {
		let shards = Arc::new(
			(0..SHARDS)
				.map(|_| Mutex::new(HashMap::<Strng, Entry>::new()))
				.collect::<Vec<_>>(),
		);
		// Outside a runtime (config validation paths) we skip the sweeper;
		// expired entries are still dropped on access.
		let cleanup = tokio::runtime::Handle::try_current().ok().map(|h| {
			let shards = shards.clone();
			let interval = settings.cleanup_interval;
			h.spawn(async move {
				let mut tick = tokio::time::interval(interval);
				tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
				loop {
					tick.tick().await;
					let now = now_nanos();
					for shard in shards.iter() {
						shard.lock().retain(|_, e| e.expires_at > now);
					}
				}
			})
		});
		MemoryLimiter {
			quota,
			shards,
			max_entries: settings.max_entries.max(1),
			cleanup: Mutex::new(cleanup),
		}
	}

	fn shard(&self, key: &str) -> &Mutex<HashMap<Strng, Entry>> {
		let mut h = std::hash::DefaultHasher::new();
		std::hash::Hash::hash(key.as_bytes(), &mut h);
		let idx = (std::hash::Hasher::finish(&h) as usize) % SHARDS;
		&self.shards[idx]
	}

	fn check(&self, key: &str, n: u64, clamp: bool) -> RateLimitResult {
		let now = now_nanos();
		let mut shard = self.shard(key).lock();
		let live = shard
			.get(key)
			.filter(|e| e.expires_at > now)
			.map(|e| e.slot);
		match self.quota.algorithm {
			Algorithm::Gcra(g) => {
				let stored = match live {
					Some(Slot::Tat(t)) => Some(t),
					_ => None,
				};
				let d = g.decide(stored, now, n, clamp);
				if d.consumed > 0 {
					self.insert(
						&mut shard,
						key,
						Entry {
							slot: Slot::Tat(d.new_tat),
							expires_at: now + g.state_ttl().as_nanos() as u64,
							last_access: now,
						},
					);
				}
				self.quota.result_from_gcra(n, now, d)
			},
			Algorithm::FixedWindow(f) => {
				let start = f.window_start(now);
				let pre = match live {
					Some(Slot::Window { start: s, count }) if s == start => count,
					_ => 0,
				};
				let d = f.decide(pre, now, n, clamp);
				if n > 0 {
					self.insert(
						&mut shard,
						key,
						Entry {
							slot: Slot::Window {
								start,
								count: d.new_count,
							},
							expires_at: f.window_end(now),
							last_access: now,
						},
					);
				}
				self.quota.result_from_window(n, now, d)
			},
		}
	}

	fn insert(&self, shard: &mut HashMap<Strng, Entry>, key: &str, entry: Entry) {
		if !shard.contains_key(key) && shard.len() >= self.max_entries.div_ceil(SHARDS) {
			// Bounded store: drop the least recently touched entry.
			if let Some(oldest) = shard
				.iter()
				.min_by_key(|(_, e)| e.last_access)
				.map(|(k, _)| k.clone())
			{
				shard.remove(&oldest);
			}
		}
		shard.insert(strng::new(key), entry);
	}
}

#[async_trait::async_trait]
impl Limiter for MemoryLimiter {
	async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError> {
		Ok(self.check(key, n, false))
	}

	async fn consume_or_clamp_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError> {
		Ok(self.check(key, n, true))
	}

	async fn peek(&self, key: &str) -> Result<RateLimitResult, LimitError> {
		Ok(self.check(key, 0, false))
	}

	async fn close(&self) {
		if let Some(handle) = self.cleanup.lock().take() {
			handle.abort();
		}
	}
}

impl Drop for MemoryLimiter {
	fn drop(&mut self) {
		if let Some(handle) = self.cleanup.lock().take() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::ratelimit::{AlgorithmKind, QuotaSettings};

	use super::*;

	fn gcra_quota(limit: u64, duration: Duration, burst: u64) -> Quota {
		Quota::new(
			AlgorithmKind::Gcra,
			&QuotaSettings {
				limit,
				duration,
				burst: Some(burst),
			},
		)
		.unwrap()
	}

	fn window_quota(limit: u64, duration: Duration) -> Quota {
		Quota::new(
			AlgorithmKind::FixedWindow,
			&QuotaSettings {
				limit,
				duration,
				burst: None,
			},
		)
		.unwrap()
	}

	#[tokio::test]
	async fn gcra_burst_scenario() {
		// limit 2/s with burst 2: two immediate allows, then a ~0.5s wait
		let l = MemoryLimiter::new(
			gcra_quota(2, Duration::from_secs(1), 2),
			MemorySettings::default(),
		);
		let r1 = l.allow_n("k", 1).await.unwrap();
		assert!(r1.allowed);
		assert_eq!(r1.remaining, 1);
		let r2 = l.allow_n("k", 1).await.unwrap();
		assert!(r2.allowed);
		assert_eq!(r2.remaining, 0);
		let r3 = l.allow_n("k", 1).await.unwrap();
		assert!(!r3.allowed);
		assert!(r3.retry_after > Duration::from_millis(400));
		assert!(r3.retry_after <= Duration::from_millis(500));
		l.close().await;
	}

	#[tokio::test]
	async fn window_clamp_scenario() {
		let l = MemoryLimiter::new(
			window_quota(10, Duration::from_secs(60)),
			MemorySettings::default(),
		);
		let pre = l.allow_n("k", 7).await.unwrap();
		assert!(pre.allowed);
		let r = l.consume_or_clamp_n("k", 5).await.unwrap();
		assert!(!r.allowed);
		assert_eq!(r.consumed, 3);
		assert_eq!(r.overflow, 2);
		assert_eq!(r.remaining, 0);
		l.close().await;
	}

	#[tokio::test]
	async fn peek_reads_without_consuming() {
		let l = MemoryLimiter::new(
			window_quota(10, Duration::from_secs(60)),
			MemorySettings::default(),
		);
		let _ = l.allow_n("k", 3).await.unwrap();
		let p1 = l.peek("k").await.unwrap();
		let p2 = l.peek("k").await.unwrap();
		assert_eq!(p1.remaining, 7);
		assert_eq!(p2.remaining, 7);
		l.close().await;
	}

	#[tokio::test]
	async fn keys_are_isolated() {
		let l = MemoryLimiter::new(
			window_quota(1, Duration::from_secs(60)),
			MemorySettings::default(),
		);
		assert!(l.allow_n("a", 1).await.unwrap().allowed);
		assert!(l.allow_n("b", 1).await.unwrap().allowed);
		assert!(!l.allow_n("a", 1).await.unwrap().allowed);
		l.close().await;
	}

	#[tokio::test]
	async fn bounded_entries_evict_oldest() {
		let l = MemoryLimiter::new(
			window_quota(10, Duration::from_secs(60)),
			MemorySettings {
				max_entries: SHARDS, // one slot per shard
				cleanup_interval: Duration::from_secs(60),
			},
		);
		for i in 0..100 {
			let _ = l.allow_n(&format!("key-{i}"), 1).await.unwrap();
		}
		let total: usize = l.shards.iter().map(|s| s.lock().len()).sum();
		assert!(total <= 2 * SHARDS);
		l.close().await;
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let l = MemoryLimiter::new(
			window_quota(1, Duration::from_secs(1)),
			MemorySettings::default(),
		);
		l.close().await;
		l.close().await;
	}
}
