use once_cell::sync::Lazy;
use rand::Rng;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use secrecy::{ExposeSecret, SecretString};

use crate::ratelimit::fixed_window::WindowDecision;
use crate::ratelimit::{Algorithm, LimitError, Limiter, Quota, RateLimitResult, now_nanos};
use crate::*;

pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:v1:";

#[apply(schema_de!)]
pub struct RedisSettings {
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	#[cfg_attr(feature = "schema", schemars(with = "Option<String>"))]
	pub password: Option<SecretString>,
	#[serde(default)]
	pub db: i64,
	#[serde(default = "default_key_prefix")]
	pub key_prefix: String,
	#[serde(default)]
	pub failure_mode: FailureMode,
	#[serde(default = "default_connection_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub connection_timeout: Duration,
	#[serde(default = "default_io_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub read_timeout: Duration,
	#[serde(default = "default_io_timeout", with = "serde_dur")]
	#[cfg_attr(feature = "schema", schemars(with = "String"))]
	pub write_timeout: Duration,
}

#[apply(schema!)]
#[derive(Default, Copy, PartialEq, Eq)]
pub enum FailureMode {
	/// Allow traffic when Redis is unreachable.
	#[default]
	Open,
	/// Reject traffic when Redis is unreachable.
	Closed,
}

fn default_port() -> u16 {
	6379
}

fn default_key_prefix() -> String {
	DEFAULT_KEY_PREFIX.to_string()
}

fn default_connection_timeout() -> Duration {
	Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
	Duration::from_secs(1)
}

// The script works in microseconds so every value stays exactly representable
// in a Lua number. The key holds the theoretical arrival time.
static GCRA_SCRIPT: Lazy<Script> = Lazy::new(|| {
	Script::new(
		r#"
local tat = tonumber(redis.call('GET', KEYS[1]))
local now = tonumber(ARGV[1])
local ei = tonumber(ARGV[2])
local allowance = tonumber(ARGV[3])
local burst = tonumber(ARGV[4])
local n = tonumber(ARGV[5])
local clamp = tonumber(ARGV[6]) == 1
local ttl = tonumber(ARGV[7])
if tat == nil or tat < now then
  tat = now
end
local used = math.ceil((tat - now) / ei)
local remaining = burst - used
if remaining < 0 then
  remaining = 0
end
local consumed = 0
if tat - allowance <= now then
  consumed = math.min(n, remaining)
  if consumed < n and not clamp then
    consumed = 0
  end
end
local new_tat = tat + ei * consumed
if consumed > 0 then
  redis.call('SET', KEYS[1], string.format('%.0f', new_tat), 'PX', ttl)
end
return {consumed, string.format('%.0f', new_tat)}
"#,
	)
});

// The key embeds the window start, so each window is its own counter. The
// first write of a window sets the (jittered) expiry.
static WINDOW_SCRIPT: Lazy<Script> = Lazy::new(|| {
	Script::new(
		r#"
local pre = tonumber(redis.call('GET', KEYS[1]) or '0')
local n = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local clamp = tonumber(ARGV[3]) == 1
local ttl = tonumber(ARGV[4])
if n == 0 then
  return {0, pre}
end
local incr = n
if clamp then
  local available = limit - pre
  if available < 0 then
    available = 0
  end
  if available < n then
    incr = available
  end
end
local newc = pre
if incr > 0 then
  newc = redis.call('INCRBY', KEYS[1], incr)
  if newc == incr then
    redis.call('PEXPIRE', KEYS[1], ttl)
  end
end
return {incr, newc}
"#,
	)
});

/// Redis-backed limiter. All mutation goes through Lua scripts so concurrent
/// gateways agree on every decision; the scripts are loaded on first use and
/// reloaded transparently after a `NOSCRIPT` reply.
pub struct RedisLimiter {
	quota: Quota,
	conn: ConnectionManager,
	prefix: String,
}

impl Debug for RedisLimiter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisLimiter")
			.field("prefix", &self.prefix)
			.finish()
	}
}

impl RedisLimiter {
	pub async fn connect(quota: Quota, settings: RedisSettings) -> anyhow::Result<Self> {
		let info = ConnectionInfo {
			addr: ConnectionAddr::Tcp(settings.host.clone(), settings.port),
			redis: RedisConnectionInfo {
				db: settings.db,
				username: settings.username.clone(),
				password: settings
					.password
					.as_ref()
					.map(|p| p.expose_secret().to_string()),
				..Default::default()
			},
		};
		let client = redis::Client::open(info).context("invalid redis configuration")?;
		let config = ConnectionManagerConfig::new()
			.set_connection_timeout(settings.connection_timeout)
			.set_response_timeout(settings.read_timeout.max(settings.write_timeout));
		let conn = client
			.get_connection_manager_with_config(config)
			.await
			.with_context(|| format!("connect to redis at {}:{}", settings.host, settings.port))?;
		Ok(RedisLimiter {
			quota,
			conn,
			prefix: settings.key_prefix,
		})
	}

	async fn check(&self, key: &str, n: u64, clamp: bool) -> Result<RateLimitResult, LimitError> {
		let now = now_nanos();
		let mut conn = self.conn.clone();
		match self.quota.algorithm {
			Algorithm::Gcra(g) => {
				let full_key = format!("{}{}", self.prefix, key);
				let ei_us = (g.emission_interval() / 1_000).max(1);
				let allowance_us = ei_us * g.burst;
				let (consumed, new_tat): (u64, String) = GCRA_SCRIPT
					.key(full_key)
					.arg(now / 1_000)
					.arg(ei_us)
					.arg(allowance_us)
					.arg(g.burst)
					.arg(n)
					.arg(clamp as u8)
					.arg(g.state_ttl().as_millis() as u64)
					.invoke_async(&mut conn)
					.await
					.map_err(|e| LimitError::Store(e.into()))?;
				let new_tat = new_tat.parse::<u64>().unwrap_or(now / 1_000) * 1_000;
				let d = g.decision(consumed, new_tat, now, n);
				Ok(self.quota.result_from_gcra(n, now, d))
			},
			Algorithm::FixedWindow(f) => {
				let start = f.window_start(now);
				let full_key = format!("{}{}:{}", self.prefix, key, start);
				let ttl_ms = Duration::from_nanos(f.window_end(now) - now).as_millis() as u64
					+ rand::rng().random_range(0..5_000);
				let (incr, newc): (u64, u64) = WINDOW_SCRIPT
					.key(full_key)
					.arg(n)
					.arg(f.limit)
					.arg(clamp as u8)
					.arg(ttl_ms)
					.invoke_async(&mut conn)
					.await
					.map_err(|e| LimitError::Store(e.into()))?;
				let allowed = if clamp { incr == n } else { newc <= f.limit };
				let consumed = if clamp {
					incr
				} else if allowed {
					n
				} else {
					0
				};
				let d = WindowDecision {
					allowed,
					consumed,
					new_count: newc,
					remaining: f.limit.saturating_sub(newc),
					reset: f.window_end(now),
					retry_after: if allowed {
						Duration::ZERO
					} else {
						Duration::from_nanos(f.window_end(now).saturating_sub(now))
					},
				};
				Ok(self.quota.result_from_window(n, now, d))
			},
		}
	}
}

#[async_trait::async_trait]
impl Limiter for RedisLimiter {
	async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError> {
		self.check(key, n, false).await
	}

	async fn consume_or_clamp_n(&self, key: &str, n: u64) -> Result<RateLimitResult, LimitError> {
		self.check(key, n, true).await
	}

	async fn peek(&self, key: &str) -> Result<RateLimitResult, LimitError> {
		self.check(key, 0, false).await
	}

	async fn close(&self) {
		// The connection manager is shared and reconnects on demand; dropping
		// the last clone tears the connection down.
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn settings_defaults() {
		let s: RedisSettings = serde_json::from_value(serde_json::json!({
			"host": "cache.internal",
		}))
		.unwrap();
		assert_eq!(s.port, 6379);
		assert_eq!(s.key_prefix, DEFAULT_KEY_PREFIX);
		assert_eq!(s.failure_mode, FailureMode::Open);
		assert_eq!(s.connection_timeout, Duration::from_secs(5));
		assert_eq!(s.read_timeout, Duration::from_secs(1));
	}

	#[test]
	fn settings_full() {
		let s: RedisSettings = serde_json::from_value(serde_json::json!({
			"host": "cache.internal",
			"port": 6380,
			"username": "limiter",
			"password": "hunter2",
			"db": 3,
			"keyPrefix": "rl:",
			"failureMode": "closed",
			"connectionTimeout": "2s",
			"readTimeout": "500ms",
			"writeTimeout": "500ms",
		}))
		.unwrap();
		assert_eq!(s.db, 3);
		assert_eq!(s.key_prefix, "rl:");
		assert_eq!(s.failure_mode, FailureMode::Closed);
		assert_eq!(s.read_timeout, Duration::from_millis(500));
	}

	#[test]
	fn unknown_fields_rejected() {
		let r: Result<RedisSettings, _> = serde_json::from_value(serde_json::json!({
			"host": "cache.internal",
			"hosts": ["a", "b"],
		}));
		assert!(r.is_err());
	}
}
