//! The audio device singleton and the playback control path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, warn};

use super::{fill_frames, spawn_producer, AudioChunk, FillOutcome, SessionState};
use crate::config::{CHUNK_QUEUE_CAPACITY, PLAYBACK_SAMPLE_RATE, PRODUCER_JOIN_TIMEOUT};

/// Device output channel count (stereo; many devices refuse mono)
const CHANNELS: usize = 2;

/// Each 24kHz source sample is written twice to reach the 48kHz device rate
const UPSAMPLE: usize = 2;

/// State the device callback shares with the control path. The callback
/// only ever `try_lock`s the slot, so a control-path swap can never stall
/// the device thread.
struct DeviceShared {
    session: Mutex<Option<SessionState>>,
}

/// Control-path view of the running session
struct ActiveSession {
    cancel: Arc<AtomicBool>,
    producer: JoinHandle<()>,
}

/// Owns the output device stream and at most one playback session.
///
/// The cpal stream is opened once and kept running for the lifetime of the
/// player; between sessions the callback emits silence. Starting a new
/// session always tears the previous one down first.
pub struct AudioPlayer {
    shared: Arc<DeviceShared>,
    active: Mutex<Option<ActiveSession>>,
    _stream: Option<cpal::Stream>,
}

impl AudioPlayer {
    pub fn new() -> Self {
        let shared = Arc::new(DeviceShared {
            session: Mutex::new(None),
        });
        let stream = build_stream(shared.clone());
        if stream.is_none() {
            warn!("audio output unavailable; playback is disabled");
        }
        Self {
            shared,
            active: Mutex::new(None),
            _stream: stream,
        }
    }

    /// Start playing `chunks`, replacing any session already running.
    ///
    /// `cancel` is the session's stop flag; it is shared with whatever is
    /// producing the chunks so that one `stop()` halts the whole pipeline.
    pub fn play_stream<I>(&self, chunks: I, cancel: Arc<AtomicBool>)
    where
        I: IntoIterator<Item = AudioChunk>,
        I::IntoIter: Send + 'static,
    {
        self.stop();

        let (tx, rx) = mpsc::sync_channel(CHUNK_QUEUE_CAPACITY);
        let producer = spawn_producer(chunks, tx, cancel.clone());
        {
            let mut slot = self.shared.session.lock().unwrap();
            *slot = Some(SessionState::new(rx, cancel.clone()));
        }
        *self.active.lock().unwrap() = Some(ActiveSession { cancel, producer });
    }

    /// Stop the current session, if any: raise its stop flag, detach it
    /// from the device, and wait (bounded) for the producer to exit.
    pub fn stop(&self) {
        let Some(active) = self.active.lock().unwrap().take() else {
            return;
        };
        active.cancel.store(true, Ordering::SeqCst);

        // Dropping the session drops the queue receiver, which unblocks a
        // producer stuck on a full queue.
        {
            let mut slot = self.shared.session.lock().unwrap();
            *slot = None;
        }

        let deadline = Instant::now() + PRODUCER_JOIN_TIMEOUT;
        while !active.producer.is_finished() {
            if Instant::now() >= deadline {
                warn!("producer thread did not stop in time; detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = active.producer.join();
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open the output stream at 48kHz stereo, f32 with an i16 fallback.
fn build_stream(shared: Arc<DeviceShared>) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            error!("no audio output device found");
            return None;
        }
    };

    let config = cpal::StreamConfig {
        channels: CHANNELS as u16,
        sample_rate: PLAYBACK_SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let shared_f32 = shared.clone();
    let mut scratch_f32: Vec<i16> = Vec::new();
    let f32_stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            pull_batch(&shared_f32, &mut scratch_f32, data.len());
            write_stereo_f32(&scratch_f32, data);
        },
        |err| error!("audio stream error: {}", err),
        None,
    );

    let stream = match f32_stream {
        Ok(stream) => stream,
        Err(err) => {
            warn!("f32 output stream failed ({}), falling back to i16", err);
            let mut scratch_i16: Vec<i16> = Vec::new();
            match device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    pull_batch(&shared, &mut scratch_i16, data.len());
                    write_stereo_i16(&scratch_i16, data);
                },
                |err| error!("audio stream error: {}", err),
                None,
            ) {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to open audio output stream: {}", err);
                    return None;
                }
            }
        }
    };

    if let Err(err) = stream.play() {
        error!("failed to start audio output stream: {}", err);
        return None;
    }
    Some(stream)
}

/// Fill `scratch` with the mono samples backing one device batch of
/// `out_len` interleaved device samples. Silence when no session is
/// installed or the control path holds the slot right now.
fn pull_batch(shared: &DeviceShared, scratch: &mut Vec<i16>, out_len: usize) {
    scratch.resize(mono_samples_needed(out_len), 0);
    match shared.session.try_lock() {
        Ok(mut slot) => {
            let finished = match slot.as_mut() {
                Some(session) => fill_frames(session, scratch) == FillOutcome::Finished,
                None => {
                    scratch.fill(0);
                    false
                }
            };
            if finished {
                *slot = None;
            }
        }
        Err(_) => scratch.fill(0),
    }
}

/// Mono source samples needed to cover `out_len` interleaved device
/// samples after channel spread and upsampling.
fn mono_samples_needed(out_len: usize) -> usize {
    let frames = out_len / CHANNELS;
    (frames + UPSAMPLE - 1) / UPSAMPLE
}

fn write_stereo_f32(mono: &[i16], out: &mut [f32]) {
    for (i, frame) in out.chunks_mut(CHANNELS).enumerate() {
        let sample = mono.get(i / UPSAMPLE).copied().unwrap_or(0) as f32 / 32768.0;
        for channel in frame {
            *channel = sample;
        }
    }
}

fn write_stereo_i16(mono: &[i16], out: &mut [i16]) {
    for (i, frame) in out.chunks_mut(CHANNELS).enumerate() {
        let sample = mono.get(i / UPSAMPLE).copied().unwrap_or(0);
        for channel in frame {
            *channel = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_math_covers_every_frame() {
        // 512 interleaved stereo samples = 256 frames = 128 mono samples.
        assert_eq!(mono_samples_needed(512), 128);
        // Odd frame counts round up so the last frame has a source sample.
        assert_eq!(mono_samples_needed(6), 2);
        assert_eq!(mono_samples_needed(0), 0);
    }

    #[test]
    fn stereo_f32_duplicates_each_sample_across_frames_and_channels() {
        let mono = [i16::MAX, 0];
        let mut out = [9.0f32; 8];
        write_stereo_f32(&mono, &mut out);
        let loud = i16::MAX as f32 / 32768.0;
        assert_eq!(out, [loud, loud, loud, loud, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn stereo_i16_spreads_without_conversion() {
        let mono = [-5];
        let mut out = [0i16; 4];
        write_stereo_i16(&mono, &mut out);
        assert_eq!(out, [-5, -5, -5, -5]);
    }
}
