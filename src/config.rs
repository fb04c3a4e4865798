//! Engine configuration and tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sample rate of the PCM audio the synthesis backend produces (24kHz)
pub const SAMPLE_RATE: u32 = 24_000;

/// Sample rate the output device stream runs at (48kHz - most devices support this)
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

/// Capacity of the chunk queue between the producer and the device callback
pub const CHUNK_QUEUE_CAPACITY: usize = 20;

/// Maximum number of concurrent synthesis workers per job
pub const DISPATCH_WORKERS: usize = 10;

/// How often waiting loops re-check the cancellation flag
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the device callback waits for the next chunk before
/// treating the pull as an underrun
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// How long `stop()` waits for the producer thread before detaching it
pub const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Synthesis attempts per fragment before giving up on it
pub const SYNTH_RETRIES: usize = 3;

/// Cooldown applied to a key after a quota error
pub const QUOTA_COOLDOWN_SECS: f64 = 60.0;

/// Safety factor on the minimum inter-request interval, to stay clear of
/// the provider's own pacing
pub const PACING_FACTOR: f64 = 1.3;

/// Per-key request and token ceilings over a sliding 60-second window.
///
/// Loaded once at startup and read-only afterwards. The defaults match the
/// free-tier limits of the flash models.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests per minute per key
    pub rpm: u32,
    /// Tokens per minute per key
    pub tpm: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            rpm: 10,
            tpm: 250_000,
        }
    }
}
