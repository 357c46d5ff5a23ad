//! Live log-pattern watcher.
//!
//! A [`LogWatcher`] is bound to exactly one process run. Its single reader
//! task pumps the run's stdout line by line and offers each line to every
//! pending [`Subscription`]. Registration and per-line delivery serialise on
//! one mutex, so a subscription sees exactly the lines that were delivered
//! after [`LogWatcher::register`] returned and never any line before it.
//!
//! ```text
//! ProcessHandle ──stdout──> reader task ──deliver(line)──┐
//!                                                        v
//!                          Mutex<WatcherState> { slots: [pattern, tx] }
//!                                                        │ send_replace(Matched)
//!                                                        v
//!                               Subscription { rx } <── test code
//! ```

mod subscription;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use subscription::{LineMatch, Subscription, SubscriptionState, WaitError};

/// Default number of recent lines retained for diagnostics.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// State of the stream a watcher is reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// No stream attached yet (e.g. delayed start).
    Waiting,
    /// The reader task is consuming the stream.
    Live,
    /// The stream reached EOF; the process closed stdout or exited.
    Ended,
    /// Reading failed; no further lines will be delivered.
    Failed(String),
    /// The watcher was discarded by a stop or restart.
    Abandoned,
}

impl StreamStatus {
    /// Whether lines can still arrive.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Waiting | Self::Live)
    }
}

/// Errors from attaching a stream to a watcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    #[error("watcher {0:?} already has a stream attached")]
    AlreadyAttached(String),

    #[error("watcher {0:?} was abandoned")]
    Abandoned(String),
}

/// One pending registration.
struct Slot {
    id: u64,
    pattern: Regex,
    tx: watch::Sender<SubscriptionState>,
}

struct WatcherState {
    slots: Vec<Slot>,
    next_id: u64,
    lines_read: u64,
    status: StreamStatus,
    attached: bool,
    tail: VecDeque<String>,
    tail_capacity: usize,
}

struct WatcherCore {
    label: String,
    state: Mutex<WatcherState>,
    cancel: CancellationToken,
}

impl WatcherCore {
    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offer one line to every pending slot. The serialisation point.
    fn deliver(&self, line: &str) {
        let mut state = self.lock();
        if state.status == StreamStatus::Abandoned {
            return;
        }

        state.lines_read += 1;
        let line_number = state.lines_read;

        if state.tail_capacity > 0 {
            if state.tail.len() == state.tail_capacity {
                state.tail.pop_front();
            }
            state.tail.push_back(line.to_string());
        }

        let label = &self.label;
        state.slots.retain(|slot| {
            // Nobody can observe this slot anymore.
            if slot.tx.is_closed() {
                return false;
            }
            match slot.pattern.captures(line) {
                Some(caps) => {
                    let m = LineMatch::from_captures(&slot.pattern, &caps, line, line_number);
                    debug!(
                        node = %label,
                        subscription = slot.id,
                        pattern = slot.pattern.as_str(),
                        line_number,
                        "pattern matched"
                    );
                    slot.tx.send_replace(SubscriptionState::Matched(Arc::new(m)));
                    false
                }
                None => true,
            }
        });
    }

    fn finish(&self, status: StreamStatus) {
        let mut state = self.lock();
        if state.status.is_open() {
            state.status = status;
        }
    }

    fn abandon(&self) {
        self.cancel.cancel();
        let mut state = self.lock();
        state.status = StreamStatus::Abandoned;
        for slot in state.slots.drain(..) {
            slot.tx.send_replace(SubscriptionState::Abandoned);
        }
    }
}

impl Drop for WatcherCore {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in state.slots.drain(..) {
            slot.tx.send_replace(SubscriptionState::Abandoned);
        }
    }
}

/// Fan-out of one process run's stdout to any number of subscriptions.
///
/// Clones share the same watcher. A watcher is never reused across runs;
/// the node controller creates a fresh one per start.
#[derive(Clone)]
pub struct LogWatcher {
    core: Arc<WatcherCore>,
}

impl std::fmt::Debug for LogWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.lock();
        f.debug_struct("LogWatcher")
            .field("label", &self.core.label)
            .field("status", &state.status)
            .field("pending", &state.slots.len())
            .field("lines_read", &state.lines_read)
            .finish()
    }
}

impl LogWatcher {
    /// Create an unattached watcher with the default tail size.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_tail_capacity(label, DEFAULT_TAIL_LINES)
    }

    /// Create an unattached watcher retaining the last `tail_capacity` lines.
    pub fn with_tail_capacity(label: impl Into<String>, tail_capacity: usize) -> Self {
        Self {
            core: Arc::new(WatcherCore {
                label: label.into(),
                state: Mutex::new(WatcherState {
                    slots: Vec::new(),
                    next_id: 0,
                    lines_read: 0,
                    status: StreamStatus::Waiting,
                    attached: false,
                    tail: VecDeque::with_capacity(tail_capacity.min(DEFAULT_TAIL_LINES)),
                    tail_capacity,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The label used in log output (normally the node name).
    pub fn label(&self) -> &str {
        &self.core.label
    }

    /// Register interest in the next line matching `pattern`.
    ///
    /// Only lines delivered after this call returns are considered. On an
    /// abandoned watcher the subscription is returned already abandoned; on
    /// an ended stream it stays pending forever.
    pub fn register(&self, pattern: Regex) -> Subscription {
        let mut state = self.core.lock();
        let id = state.next_id;
        state.next_id += 1;

        if state.status == StreamStatus::Abandoned {
            let (_tx, rx) = watch::channel(SubscriptionState::Abandoned);
            return Subscription::new(id, &pattern, rx);
        }

        let (tx, rx) = watch::channel(SubscriptionState::Pending);
        let sub = Subscription::new(id, &pattern, rx);
        debug!(
            node = %self.core.label,
            subscription = id,
            pattern = pattern.as_str(),
            after_line = state.lines_read,
            "registered subscription"
        );
        state.slots.push(Slot { id, pattern, tx });
        sub
    }

    /// Attach the run's output stream and start the reader task.
    ///
    /// A watcher accepts exactly one stream in its lifetime.
    pub fn attach<R>(&self, reader: R) -> Result<JoinHandle<()>, WatcherError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        {
            let mut state = self.core.lock();
            if state.status == StreamStatus::Abandoned {
                return Err(WatcherError::Abandoned(self.core.label.clone()));
            }
            if state.attached {
                return Err(WatcherError::AlreadyAttached(self.core.label.clone()));
            }
            state.attached = true;
            state.status = StreamStatus::Live;
        }

        let core = Arc::clone(&self.core);
        Ok(tokio::spawn(pump(core, reader)))
    }

    /// Discard the watcher: stop reading and abandon every pending
    /// subscription. Matched subscriptions keep their match.
    pub fn abandon(&self) {
        self.core.abandon();
        debug!(node = %self.core.label, "watcher abandoned");
    }

    pub fn status(&self) -> StreamStatus {
        self.core.lock().status.clone()
    }

    /// Number of lines delivered so far.
    pub fn lines_read(&self) -> u64 {
        self.core.lock().lines_read
    }

    /// Number of subscriptions still waiting for a match.
    pub fn pending_count(&self) -> usize {
        self.core
            .lock()
            .slots
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Most recent lines, oldest first. Diagnostics only.
    pub fn tail(&self) -> Vec<String> {
        self.core.lock().tail.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn deliver(&self, line: &str) {
        self.core.deliver(line);
    }
}

/// Reader task body: one line at a time until EOF, error, or cancellation.
async fn pump<R>(core: Arc<WatcherCore>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let cancel = core.cancel.clone();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(node = %core.label, "agent stdout closed");
                core.finish(StreamStatus::Ended);
                break;
            }
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf);
                debug!(target: "fv::stdout", node = %core.label, "{line}");
                core.deliver(&line);
            }
            Err(e) => {
                warn!(node = %core.label, error = %e, "error reading agent stdout");
                core.finish(StreamStatus::Failed(e.to_string()));
                break;
            }
        }
    }
}
