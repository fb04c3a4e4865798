//! Speech synthesis: the remote backend contract and the retrying client
//! that pairs it with the key pool.

mod gemini;

pub use gemini::GeminiSynthesizer;

use std::sync::Arc;

use tracing::{error, warn};

use crate::config::{QUOTA_COOLDOWN_SECS, SYNTH_RETRIES};
use crate::keypool::KeyScheduler;

/// Failure modes of a synthesis request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    /// The provider rejected the request for quota reasons (429 /
    /// resource exhausted). The key recovers after a cooldown.
    #[error("quota exceeded")]
    Quota,
    /// The key itself was rejected. It will never work again.
    #[error("API key rejected")]
    Auth,
    /// No key in the pool can take the request.
    #[error("no usable API key available")]
    NoCapacity,
    /// Anything else; worth retrying with another key.
    #[error("synthesis failed: {0}")]
    Transient(String),
}

/// A remote text-to-speech backend.
///
/// Implementations return raw mono 16-bit little-endian PCM at
/// [`crate::config::SAMPLE_RATE`]. The call blocks for the duration of the
/// request; it runs on dispatcher worker threads, never on the audio
/// callback.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, api_key: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Rough token estimate for a piece of text (1 token ~= 4 chars).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Ties a [`Synthesizer`] to the [`KeyScheduler`]: picks a key, reserves
/// capacity on it, issues the request, and rotates keys on failure.
pub struct SpeechClient {
    scheduler: Arc<KeyScheduler>,
    synthesizer: Arc<dyn Synthesizer>,
}

impl SpeechClient {
    pub fn new(scheduler: Arc<KeyScheduler>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            scheduler,
            synthesizer,
        }
    }

    pub fn scheduler(&self) -> &Arc<KeyScheduler> {
        &self.scheduler
    }

    /// Synthesize `text`, rotating to a different key on quota and auth
    /// errors, up to [`SYNTH_RETRIES`] attempts.
    pub fn generate(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let estimated_tokens = estimate_tokens(text);
        let mut last_error = SynthesisError::NoCapacity;

        for _ in 0..SYNTH_RETRIES {
            let Some(key) = self.scheduler.select_key(estimated_tokens) else {
                error!("no available API keys");
                return Err(SynthesisError::NoCapacity);
            };
            self.scheduler.acquire(&key, estimated_tokens);

            match self.synthesizer.synthesize(text, &key) {
                Ok(audio) => return Ok(audio),
                Err(err) => {
                    match err {
                        SynthesisError::Quota => {
                            self.scheduler.mark_cooldown(&key, QUOTA_COOLDOWN_SECS);
                        }
                        SynthesisError::Auth => {
                            self.scheduler.mark_exhausted(&key);
                        }
                        SynthesisError::Transient(ref msg) => {
                            warn!("synthesis attempt failed: {}", msg);
                        }
                        SynthesisError::NoCapacity => {}
                    }
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::RateLimitPolicy;
    use crate::keypool::UsageLedger;

    struct FnSynth<F>(F);

    impl<F> Synthesizer for FnSynth<F>
    where
        F: Fn(&str, &str) -> Result<Vec<u8>, SynthesisError> + Send + Sync,
    {
        fn synthesize(&self, text: &str, api_key: &str) -> Result<Vec<u8>, SynthesisError> {
            (self.0)(text, api_key)
        }
    }

    fn scheduler(keys: &[&str]) -> Arc<KeyScheduler> {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::open(dir.path().join("usage.json"));
        Arc::new(KeyScheduler::new(
            keys.iter().map(|k| k.to_string()).collect(),
            RateLimitPolicy {
                rpm: 100_000,
                tpm: u64::MAX / 2,
            },
            ledger,
        ))
    }

    #[test]
    fn estimate_follows_text_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn generate_returns_audio_on_first_success() {
        let client = SpeechClient::new(
            scheduler(&["k1"]),
            Arc::new(FnSynth(|_: &str, _: &str| Ok(vec![1, 2, 3, 4]))),
        );
        assert_eq!(client.generate("hello").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn quota_error_cools_the_key_and_retries_another() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let sched = scheduler(&["k1", "k2"]);
        let client = SpeechClient::new(
            sched.clone(),
            Arc::new(FnSynth(move |_: &str, _: &str| {
                if calls_in.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SynthesisError::Quota)
                } else {
                    Ok(vec![9, 9])
                }
            })),
        );
        assert_eq!(client.generate("hello").unwrap(), vec![9, 9]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One of the keys is now cooling down; the other still serves.
        assert!(sched.select_key(0).is_some());
    }

    #[test]
    fn auth_error_exhausts_keys_until_none_remain() {
        let sched = scheduler(&["k1", "k2"]);
        let client = SpeechClient::new(
            sched.clone(),
            Arc::new(FnSynth(|_: &str, _: &str| Err(SynthesisError::Auth))),
        );
        let err = client.generate("hello").unwrap_err();
        // Both keys rejected, third attempt finds an empty pool.
        assert!(matches!(err, SynthesisError::NoCapacity | SynthesisError::Auth));
        assert_eq!(sched.select_key(0), None);
    }

    #[test]
    fn transient_errors_exhaust_the_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let client = SpeechClient::new(
            scheduler(&["k1"]),
            Arc::new(FnSynth(move |_: &str, _: &str| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                Err(SynthesisError::Transient("boom".into()))
            })),
        );
        assert!(matches!(
            client.generate("hello").unwrap_err(),
            SynthesisError::Transient(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), SYNTH_RETRIES);
    }
}
