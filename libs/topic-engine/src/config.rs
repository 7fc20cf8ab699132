use std::time::Duration;

use serde::Deserialize;

/// Engine tunables (`[search]`, `[poll]`, `[range]` of the server config).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub range: RangeConfig,
}

// ═══════════════════════════════════════════════════════════════
//  Search
// ═══════════════════════════════════════════════════════════════

/// What a read error on one partition does to the rest of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Only the failing partition stops; siblings run to their bound.
    #[default]
    Isolate,
    /// The first failure cancels every partition of the session.
    Abort,
}

fn default_max_concurrent_partitions() -> usize {
    64
}

fn default_match_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Ceiling on partitions read at the same time within one session.
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,
    /// Capacity of the match channel between partition tasks and the consumer.
    #[serde(default = "default_match_buffer")]
    pub match_buffer: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_partitions: default_max_concurrent_partitions(),
            match_buffer: default_match_buffer(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Poll
// ═══════════════════════════════════════════════════════════════

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_session_ms() -> u64 {
    10_000
}

fn default_poll_buffer() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Subscriptions end after this long. `0` disables the limit.
    #[serde(default = "default_max_session_ms")]
    pub max_session_ms: u64,
    /// Snapshots buffered per subscriber.
    #[serde(default = "default_poll_buffer")]
    pub buffer: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_session_ms: default_max_session_ms(),
            buffer: default_poll_buffer(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn max_session(&self) -> Option<Duration> {
        (self.max_session_ms > 0).then(|| Duration::from_millis(self.max_session_ms))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Range
// ═══════════════════════════════════════════════════════════════

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeConfig {
    /// Upper bound on a whole fetch-range read.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl RangeConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
