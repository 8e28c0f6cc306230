use crate::*;

/// Fixed-window counting. State per key+window is a single counter; the
/// window start is derived from the clock so distinct windows never share a
/// counter (the Redis key embeds the window-start timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
	pub limit: u64,
	pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
	pub allowed: bool,
	pub consumed: u64,
	/// Counter value after the call; what the backend should store.
	pub new_count: u64,
	pub remaining: u64,
	/// Window end, nanoseconds.
	pub reset: u64,
	pub retry_after: Duration,
}

impl FixedWindow {
	pub fn window_start(&self, now: u64) -> u64 {
		let d = self.duration.as_nanos() as u64;
		(now / d) * d
	}

	pub fn window_end(&self, now: u64) -> u64 {
		self.window_start(now) + self.duration.as_nanos() as u64
	}

	/// Decide a request of cost `n` with the window's current counter `pre`.
	/// Without `clamp` the counter always advances by `n` and the request is
	/// allowed iff the new count stays within the limit. With `clamp`, only
	/// the available capacity is consumed. `n == 0` peeks without writing.
	pub fn decide(&self, pre: u64, now: u64, n: u64, clamp: bool) -> WindowDecision {
		let reset = self.window_end(now);
		if n == 0 {
			return WindowDecision {
				allowed: pre <= self.limit,
				consumed: 0,
				new_count: pre,
				remaining: self.limit.saturating_sub(pre),
				reset,
				retry_after: Duration::ZERO,
			};
		}
		let (consumed, new_count) = if clamp {
			let available = self.limit.saturating_sub(pre);
			let consumed = n.min(available);
			(consumed, pre + consumed)
		} else {
			(n, pre + n)
		};
		let allowed = if clamp {
			consumed == n
		} else {
			new_count <= self.limit
		};
		let consumed = if clamp || allowed { consumed } else { 0 };
		WindowDecision {
			allowed,
			consumed,
			new_count,
			remaining: self.limit.saturating_sub(new_count),
			reset,
			retry_after: if allowed {
				Duration::ZERO
			} else {
				Duration::from_nanos(reset.saturating_sub(now))
			},
		}
	}
}
