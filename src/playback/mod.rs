//! Buffered, cancellable audio playback.
//!
//! A producer thread feeds [`AudioChunk`]s into a bounded queue; the
//! device callback drains it in fixed-size batches, padding with silence
//! whenever the producer falls behind. A shared stop flag cuts both sides
//! off within one poll interval.

mod player;

pub use player::AudioPlayer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::DEQUEUE_TIMEOUT;

/// An immutable buffer of signed 16-bit mono samples at
/// [`crate::config::SAMPLE_RATE`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
}

impl AudioChunk {
    /// Decode raw little-endian 16-bit PCM bytes. A trailing odd byte is
    /// dropped.
    pub fn from_pcm_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Consumer-side state of one playback session: the chunk queue plus the
/// read cursor into the chunk currently being drained.
pub(crate) struct SessionState {
    rx: Receiver<Option<AudioChunk>>,
    current: Option<AudioChunk>,
    cursor: usize,
    cancel: Arc<AtomicBool>,
}

impl SessionState {
    pub(crate) fn new(rx: Receiver<Option<AudioChunk>>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            current: None,
            cursor: 0,
            cancel,
        }
    }
}

/// What the device should do after a batch was filled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    /// Keep pulling; the stream is still live (possibly underrunning).
    Continue,
    /// The stream ended (sentinel, producer gone, or stop request); the
    /// session can be discarded.
    Finished,
}

/// Fill `out` with exactly `out.len()` samples for one device pull.
///
/// Pulls from the partially-consumed current chunk first, then dequeues
/// with a short timeout. An underrun pads the rest of the batch with
/// silence without ending the stream; the `None` sentinel (or a dropped
/// sender) ends it; a pending stop request turns the whole batch into
/// silence immediately.
pub(crate) fn fill_frames(session: &mut SessionState, out: &mut [i16]) -> FillOutcome {
    if session.cancel.load(Ordering::SeqCst) {
        out.fill(0);
        return FillOutcome::Finished;
    }

    let mut filled = 0;
    while filled < out.len() {
        if session.current.is_none() {
            match session.rx.recv_timeout(DEQUEUE_TIMEOUT) {
                Ok(Some(chunk)) => {
                    session.current = Some(chunk);
                    session.cursor = 0;
                }
                Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                    out[filled..].fill(0);
                    return FillOutcome::Finished;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Underrun: pad this batch, keep the stream running.
                    out[filled..].fill(0);
                    return FillOutcome::Continue;
                }
            }
        }
        if let Some(chunk) = &session.current {
            let available = chunk.len() - session.cursor;
            let to_copy = available.min(out.len() - filled);
            out[filled..filled + to_copy]
                .copy_from_slice(&chunk.samples()[session.cursor..session.cursor + to_copy]);
            session.cursor += to_copy;
            filled += to_copy;
            if session.cursor >= chunk.len() {
                session.current = None;
            }
        }
    }
    FillOutcome::Continue
}

/// Spawn the single producer thread of a session: push every chunk into
/// the bounded queue, then append the end sentinel. Backpressure comes
/// from the queue itself; a torn-down session (dropped receiver) or the
/// stop flag ends the thread promptly.
pub(crate) fn spawn_producer<I>(
    chunks: I,
    tx: SyncSender<Option<AudioChunk>>,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    I: IntoIterator<Item = AudioChunk>,
    I::IntoIter: Send + 'static,
{
    let chunks = chunks.into_iter();
    std::thread::spawn(move || {
        for chunk in chunks {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(Some(chunk)).is_err() {
                // Receiver gone: the session was torn down under us.
                return;
            }
        }
        let _ = tx.send(None);
    })
}
