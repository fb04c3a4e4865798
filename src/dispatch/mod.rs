//! Ordered fan-out/fan-in synthesis.
//!
//! A job is split into paragraphs and synthesized by a bounded pool of
//! workers, but the resulting audio is handed out strictly in paragraph
//! order: the stream's cursor sits on task *i* until it reaches a terminal
//! state, no matter how many later tasks have already finished. A shared
//! stop flag ends the stream at the next poll and abandons whatever is
//! still in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::config::{CANCEL_POLL_INTERVAL, DISPATCH_WORKERS};
use crate::playback::AudioChunk;
use crate::synth::SpeechClient;

/// Lifecycle of one paragraph
enum TaskState {
    Pending,
    Running,
    /// Synthesized PCM, taken out when the cursor reaches this task
    Done(Vec<u8>),
    Cancelled,
    Failed,
}

/// One ordered unit of work within a job
struct Task {
    index: usize,
    text: String,
    state: Mutex<TaskState>,
}

/// Counters shared between the stream, its monitor, and the workers
struct JobStats {
    emitted: AtomicUsize,
    failed: AtomicUsize,
    closed: AtomicBool,
}

/// Final disposition of a job, distinguishable by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The stream has not closed yet
    InProgress,
    /// The stream closed after every task resolved
    Completed,
    /// The stop flag ended the stream
    Cancelled,
    /// Every task failed; the job produced no audio at all
    Failed,
}

/// Read-only view of a job's progress, usable after the stream was handed
/// off to the playback producer.
#[derive(Clone)]
pub struct JobMonitor {
    stats: Arc<JobStats>,
    cancel: Arc<AtomicBool>,
}

impl JobMonitor {
    pub fn outcome(&self) -> JobOutcome {
        if !self.stats.closed.load(Ordering::SeqCst) {
            return JobOutcome::InProgress;
        }
        if self.cancel.load(Ordering::SeqCst) {
            return JobOutcome::Cancelled;
        }
        if self.stats.emitted.load(Ordering::SeqCst) == 0
            && self.stats.failed.load(Ordering::SeqCst) > 0
        {
            return JobOutcome::Failed;
        }
        JobOutcome::Completed
    }

    /// Chunks emitted so far
    pub fn chunks_emitted(&self) -> usize {
        self.stats.emitted.load(Ordering::SeqCst)
    }
}

/// Splits jobs into paragraph tasks and runs them on a bounded worker pool.
pub struct Dispatcher {
    client: Arc<SpeechClient>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(client: Arc<SpeechClient>) -> Self {
        Self {
            client,
            workers: DISPATCH_WORKERS,
        }
    }

    /// Override the worker bound (mainly for tests).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Start synthesizing `text` and return the in-order chunk stream.
    ///
    /// `cancel` is shared with the playback session: setting it stops the
    /// stream at its next poll and marks the remaining tasks cancelled.
    pub fn start(&self, text: &str, cancel: Arc<AtomicBool>) -> JobStream {
        let tasks: Vec<Arc<Task>> = split_paragraphs(text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                Arc::new(Task {
                    index,
                    text,
                    state: Mutex::new(TaskState::Pending),
                })
            })
            .collect();

        let stats = Arc::new(JobStats {
            emitted: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        debug!("dispatching job with {} paragraphs", tasks.len());

        let next_index = Arc::new(AtomicUsize::new(0));
        for _ in 0..self.workers.min(tasks.len()) {
            let tasks = tasks.clone();
            let next_index = next_index.clone();
            let cancel = cancel.clone();
            let stats = stats.clone();
            let client = self.client.clone();
            std::thread::spawn(move || {
                run_worker(&client, &tasks, &next_index, &cancel, &stats);
            });
        }

        JobStream {
            tasks,
            cursor: 0,
            cancel,
            stats,
        }
    }
}

/// Worker loop: claim the next pending task, synthesize it, store the
/// result. Exits when the stop flag rises or the tasks run out; it never
/// blocks job teardown.
fn run_worker(
    client: &SpeechClient,
    tasks: &[Arc<Task>],
    next_index: &AtomicUsize,
    cancel: &AtomicBool,
    stats: &JobStats,
) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let claimed = next_index.fetch_add(1, Ordering::SeqCst);
        let Some(task) = tasks.get(claimed) else {
            return;
        };

        {
            let mut state = task.state.lock().unwrap();
            match *state {
                TaskState::Pending => *state = TaskState::Running,
                _ => continue,
            }
        }

        debug!("synthesizing paragraph {}/{}", task.index + 1, tasks.len());
        let result = client.generate(&task.text);

        let mut state = task.state.lock().unwrap();
        if cancel.load(Ordering::SeqCst) {
            *state = TaskState::Cancelled;
            continue;
        }
        match result {
            Ok(audio) => *state = TaskState::Done(audio),
            Err(err) => {
                error!("paragraph {} failed: {}", task.index + 1, err);
                stats.failed.fetch_add(1, Ordering::SeqCst);
                *state = TaskState::Failed;
            }
        }
    }
}

/// The lazy, in-order, cancellable chunk sequence of one job.
///
/// Each `next()` waits (polling the stop flag) for the task at the cursor
/// to reach a terminal state, emits its audio if it produced any, and
/// advances. The sequence is finite; once it returns `None` it stays
/// closed.
pub struct JobStream {
    tasks: Vec<Arc<Task>>,
    cursor: usize,
    cancel: Arc<AtomicBool>,
    stats: Arc<JobStats>,
}

impl JobStream {
    pub fn monitor(&self) -> JobMonitor {
        JobMonitor {
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Close after a cancellation: everything not yet started is marked
    /// cancelled; running tasks are left to their workers (best effort).
    fn close_cancelled(&mut self) {
        for task in &self.tasks[self.cursor..] {
            let mut state = task.state.lock().unwrap();
            if matches!(*state, TaskState::Pending) {
                *state = TaskState::Cancelled;
            }
        }
        self.cursor = self.tasks.len();
        self.stats.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        // The playback producer drops the stream as soon as its session
        // is torn down; the job still has to reach a closed state for
        // monitors to report on it.
        if !self.stats.closed.load(Ordering::SeqCst) {
            if self.cancel.load(Ordering::SeqCst) {
                self.close_cancelled();
            } else {
                self.stats.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Iterator for JobStream {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<AudioChunk> {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.close_cancelled();
                return None;
            }
            let Some(task) = self.tasks.get(self.cursor) else {
                self.stats.closed.store(true, Ordering::SeqCst);
                return None;
            };

            {
                let mut state = task.state.lock().unwrap();
                match &mut *state {
                    TaskState::Done(audio) => {
                        let audio = std::mem::take(audio);
                        drop(state);
                        self.cursor += 1;
                        if audio.is_empty() {
                            continue;
                        }
                        self.stats.emitted.fetch_add(1, Ordering::SeqCst);
                        return Some(AudioChunk::from_pcm_bytes(&audio));
                    }
                    TaskState::Failed | TaskState::Cancelled => {
                        // Skip the slot; nothing plays for this paragraph.
                        drop(state);
                        self.cursor += 1;
                        continue;
                    }
                    TaskState::Pending | TaskState::Running => {}
                }
            }

            // Task at the cursor is still in flight; wait a beat and
            // re-check the stop flag.
            std::thread::sleep(CANCEL_POLL_INTERVAL);
        }
    }
}

/// Split a job into its ordered fragments: non-empty trimmed lines.
fn split_paragraphs(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
