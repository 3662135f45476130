//! Capture tuning - seeds every new recording session.

use serde::{Deserialize, Serialize};

/// What the capture loop does when a read returns no entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyBatchPolicy {
    /// Treat the empty read as end of stream and finish the session.
    #[default]
    Stop,
    /// Keep polling; only the stop condition or a stop request ends the session.
    Retry,
}

impl EmptyBatchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            EmptyBatchPolicy::Stop => "stop",
            EmptyBatchPolicy::Retry => "retry",
        }
    }
}

impl std::str::FromStr for EmptyBatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" => Ok(EmptyBatchPolicy::Stop),
            "retry" => Ok(EmptyBatchPolicy::Retry),
            other => Err(format!("unknown empty batch policy: {}", other)),
        }
    }
}

/// Capture loop timing and batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sleep between polls, in milliseconds.
    /// Default: 100
    #[serde(default = "CaptureConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on one blocking read from the stream source.
    /// Bounds how long a stop request can go unnoticed.
    /// Default: 1000
    #[serde(default = "CaptureConfig::default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Most entries requested in a single read.
    /// Default: 1000
    #[serde(default = "CaptureConfig::default_max_batch")]
    pub max_batch: usize,

    /// Duration used when a start request names neither a count nor a duration.
    /// Default: 10
    #[serde(default = "CaptureConfig::default_duration_secs")]
    pub default_duration_secs: u64,

    /// Default: stop
    #[serde(default)]
    pub empty_batch: EmptyBatchPolicy,
}

impl CaptureConfig {
    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_block_timeout_ms() -> u64 {
        1000
    }

    fn default_max_batch() -> usize {
        1000
    }

    fn default_duration_secs() -> u64 {
        10
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            block_timeout_ms: Self::default_block_timeout_ms(),
            max_batch: Self::default_max_batch(),
            default_duration_secs: Self::default_duration_secs(),
            empty_batch: EmptyBatchPolicy::default(),
        }
    }
}
