use crate::*;

/// Generic Cell Rate Algorithm. All state is a single theoretical arrival
/// time (TAT) per key; the math here is pure so both backends share it and
/// the Redis Lua script mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gcra {
	pub limit: u64,
	pub duration: Duration,
	pub burst: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraDecision {
	pub allowed: bool,
	pub consumed: u64,
	pub remaining: u64,
	/// The TAT to persist; only persist when `consumed > 0`.
	pub new_tat: u64,
	pub retry_after: Duration,
	pub full_quota_at: u64,
}

impl Gcra {
	pub fn emission_interval(&self) -> u64 {
		(self.duration.as_nanos() as u64) / self.limit
	}

	pub fn burst_allowance(&self) -> u64 {
		self.emission_interval() * self.burst
	}

	/// TTL for persisted state; once a key has been idle this long its TAT can
	/// no longer influence a decision.
	pub fn state_ttl(&self) -> Duration {
		self.duration + Duration::from_nanos(self.burst_allowance())
	}

	/// Decide a request of cost `n` arriving at `now` (nanoseconds) against the
	/// stored TAT. With `clamp`, up to the available capacity is consumed even
	/// when `n` exceeds it; otherwise consumption is all-or-nothing.
	pub fn decide(&self, stored_tat: Option<u64>, now: u64, n: u64, clamp: bool) -> GcraDecision {
		let ei = self.emission_interval();
		let allowance = self.burst_allowance();
		let tat = stored_tat.unwrap_or(now).max(now);

		let used = (tat - now).div_ceil(ei);
		let remaining_before = self.burst.saturating_sub(used);

		let mut consumed = 0;
		if tat.saturating_sub(allowance) <= now {
			consumed = n.min(remaining_before);
			if consumed < n && !clamp {
				consumed = 0;
			}
		}

		self.decision(consumed, tat + ei * consumed, now, n)
	}

	/// Rebuild the full decision from the `(consumed, new_tat)` pair an atomic
	/// backend persisted.
	pub fn decision(&self, consumed: u64, new_tat: u64, now: u64, n: u64) -> GcraDecision {
		let ei = self.emission_interval();
		let allowance = self.burst_allowance();
		let allowed = consumed == n;
		let retry_after = if allowed {
			Duration::ZERO
		} else {
			Duration::from_nanos((new_tat + ei).saturating_sub(allowance).saturating_sub(now))
		};
		let used_after = new_tat.saturating_sub(now).div_ceil(ei);
		GcraDecision {
			allowed,
			consumed,
			remaining: self.burst.saturating_sub(used_after),
			new_tat,
			retry_after,
			full_quota_at: new_tat.max(now),
		}
	}
}
