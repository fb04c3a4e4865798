//! Text-to-speech pipeline over a pool of rate-limited API keys.
//!
//! Jobs are split into paragraphs and synthesized concurrently, each
//! request routed through the key pool's sliding-window rate limiter. The
//! finished audio is reassembled in paragraph order and streamed to the
//! output device through a bounded buffer, so playback starts as soon as
//! the first paragraph is ready and can be cut off at any moment.

pub mod config;
pub mod dispatch;
pub mod keypool;
pub mod playback;
pub mod synth;

pub use config::RateLimitPolicy;
pub use dispatch::{Dispatcher, JobMonitor, JobOutcome, JobStream};
pub use keypool::{KeyScheduler, KeyUsage, UsageLedger};
pub use playback::{AudioChunk, AudioPlayer};
pub use synth::{GeminiSynthesizer, SpeechClient, SynthesisError, Synthesizer};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// The assembled pipeline: dispatcher plus the audio device.
///
/// `speak` preempts whatever is currently playing; there is never more
/// than one job in flight.
pub struct Speaker {
    dispatcher: Dispatcher,
    player: AudioPlayer,
}

impl Speaker {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            player: AudioPlayer::new(),
        }
    }

    /// Synthesize `text` and start playing it, cancelling and tearing
    /// down any previous job first. The returned monitor reports the
    /// job's outcome once its stream has closed.
    pub fn speak(&self, text: &str) -> JobMonitor {
        self.player.stop();
        let cancel = Arc::new(AtomicBool::new(false));
        let stream = self.dispatcher.start(text, cancel.clone());
        let monitor = stream.monitor();
        self.player.play_stream(stream, cancel);
        monitor
    }

    /// Stop playback and cancel the in-flight job, if any.
    pub fn stop(&self) {
        self.player.stop();
    }
}
