//! Per-job output log: one writer, any number of readers.
//!
//! The buffer is an append-only list of [`Bytes`] segments. Readers hold a
//! cursor into the segment list and clone segments on the way out, so no
//! bytes are copied and a slow reader never blocks the writer or other
//! readers. A `watch` channel carries a revision counter; readers caught up
//! with the writer park on it until the next append or close.
//!
//! Readers always start at offset zero, so a reader opened after the writer
//! closed replays the complete output and then terminates.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;

#[derive(Debug)]
struct BufferState {
    segments: Vec<Bytes>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BufferState>,
    revision: watch::Sender<u64>,
}

/// Create a connected writer/handle pair for one job's output.
pub fn log_buffer() -> (LogWriter, LogHandle) {
    let (revision, subscribe) = watch::channel(0);
    let shared = Arc::new(Shared {
        state: Mutex::new(BufferState {
            segments: Vec::new(),
            closed: false,
        }),
        revision,
    });
    (
        LogWriter {
            shared: shared.clone(),
        },
        LogHandle { shared, subscribe },
    )
}

/// Appending side. Cloned across the stdout and stderr pumps; the reaper
/// closes it exactly once after both pumps finish.
#[derive(Clone)]
pub struct LogWriter {
    shared: Arc<Shared>,
}

impl LogWriter {
    pub fn append(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.segments.push(chunk);
        }
        self.shared.revision.send_modify(|rev| *rev += 1);
    }

    /// Mark end-of-stream and wake every parked reader. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.revision.send_modify(|rev| *rev += 1);
    }
}

/// Reading side; kept on the job record so late readers can still replay.
#[derive(Clone, Debug)]
pub struct LogHandle {
    shared: Arc<Shared>,
    subscribe: watch::Receiver<u64>,
}

impl LogHandle {
    /// Open a reader at offset zero.
    pub fn reader(&self) -> LogReader {
        LogReader {
            shared: self.shared.clone(),
            revision: self.subscribe.clone(),
            cursor: 0,
        }
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

/// Cursor over the log. `next_chunk` is cancel-safe: dropping the future at
/// the await point loses no data and releases nothing but the waiter.
pub struct LogReader {
    shared: Arc<Shared>,
    revision: watch::Receiver<u64>,
    cursor: usize,
}

impl LogReader {
    /// The next unseen segment, in append order. Suspends while caught up
    /// with a live writer; `None` once the log is closed and fully consumed.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.poll_buffer() {
                return Some(chunk);
            }
            {
                let state = self.shared.state.lock().unwrap();
                if state.closed && self.cursor >= state.segments.len() {
                    return None;
                }
            }
            if self.revision.changed().await.is_err() {
                // The sender lives as long as the shared buffer, so this is
                // unreachable; drain whatever is left and stop.
                return self.poll_buffer();
            }
        }
    }

    fn poll_buffer(&mut self) -> Option<Bytes> {
        let state = self.shared.state.lock().unwrap();
        if self.cursor < state.segments.len() {
            let chunk = state.segments[self.cursor].clone();
            self.cursor += 1;
            Some(chunk)
        } else {
            None
        }
    }
}
