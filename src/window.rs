//! Per-client request windows and the admission decision itself.
//!
//! The store keeps one timestamp log per client key in a [`DashMap`]. An
//! admission check runs lookup-or-create, purge, count and append while
//! holding the map's shard write lock for that key, so concurrent checks for
//! the same key serialize and the `len <= max_requests` invariant cannot be
//! broken by a check-then-act race. Unrelated keys only contend when they
//! happen to share a shard.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Outcome of a single admission check. Transient; drives the response
/// headers and the 429 body, then is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch millis at which capacity is guaranteed to exist again.
    pub reset_at_ms: i64,
    /// Millis until the oldest recorded request ages out. `None` when admitted.
    pub retry_after_ms: Option<i64>,
}

#[derive(Debug)]
struct RequestLog {
    /// Admitted request times in arrival order, all within the window.
    timestamps: VecDeque<i64>,
    last_seen: i64,
}

/// Sliding-window store: one request log per client key.
///
/// Logs are created lazily on first sight of a key and reclaimed by
/// [`WindowStore::sweep`] once the key has gone quiet. A key under sustained
/// traffic holds at most `max_requests` timestamps.
pub struct WindowStore {
    logs: DashMap<String, RequestLog>,
    window_ms: i64,
    max_requests: u32,
}

impl WindowStore {
    pub fn new(window_ms: i64, max_requests: u32) -> Self {
        Self {
            logs: DashMap::new(),
            window_ms,
            max_requests,
        }
    }

    /// Decides whether a request from `key` at `now_ms` is admitted, and
    /// records its timestamp if so. Rejected requests leave the log untouched.
    pub fn try_admit(&self, key: &str, now_ms: i64) -> Decision {
        let mut entry = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| RequestLog {
                timestamps: VecDeque::new(),
                last_seen: now_ms,
            });

        entry.last_seen = now_ms;

        // Arrival order means expired entries form a prefix. A timestamp from
        // a backwards clock step compares as fresh and stays.
        while let Some(&oldest) = entry.timestamps.front() {
            if now_ms - oldest >= self.window_ms {
                entry.timestamps.pop_front();
            } else {
                break;
            }
        }

        if (entry.timestamps.len() as u32) < self.max_requests {
            entry.timestamps.push_back(now_ms);

            Decision {
                admitted: true,
                limit: self.max_requests,
                remaining: self.max_requests - entry.timestamps.len() as u32,
                reset_at_ms: now_ms + self.window_ms,
                retry_after_ms: None,
            }
        } else {
            let oldest = entry.timestamps.front().copied().unwrap_or(now_ms);
            let retry_after_ms = (self.window_ms - (now_ms - oldest)).max(0);

            Decision {
                admitted: false,
                limit: self.max_requests,
                remaining: 0,
                reset_at_ms: now_ms + retry_after_ms,
                retry_after_ms: Some(retry_after_ms),
            }
        }
    }

    /// Drops logs that have seen no traffic for at least two windows.
    /// Returns the number of evicted keys.
    ///
    /// `retain` takes the same shard locks as `try_admit`, so an eviction
    /// cannot race an in-flight admission for the same key. Skipping the
    /// sweep entirely only costs memory, never correctness.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let idle_ms = self.window_ms * 2;
        let before = self.logs.len();

        self.logs.retain(|_, log| now_ms - log.last_seen < idle_ms);

        before.saturating_sub(self.logs.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}
