//! Streaming Text Ingestion
//!
//! Assistant responses arrive as text fragments at arbitrary frequency — in
//! the worst case one fragment per character, faster than a rendering frame.
//! [`StreamingBuffer`] absorbs those fragments and exposes them to
//! subscribers at a bounded rate, one notification per flush tick.
//!
//! # Design Philosophy
//!
//! Fragments land in a `pending` queue and are concatenated into the
//! committed buffer once per tick, so appending stays O(1) amortized and the
//! committed string is built with a single concatenation per flush instead
//! of one per fragment. Consumers that need the authoritative text right now
//! (e.g. at finalize time) call [`StreamingBuffer::read`], which force-merges
//! the queue so no fragment is ever lost to timing.

pub mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use scheduler::{ManualScheduler, TickScheduler, TimerScheduler, FRAME_FALLBACK_PERIOD};

use scheduler::TickHandle;

/// Subscriber callback; receives the merged buffer, never raw fragments
pub type BufferListener = dyn Fn(&str) + Send + Sync;

/// Handle identifying a subscription for later removal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Frame-coalesced append-only text accumulator
///
/// Cheap to clone; clones share the same underlying buffer. Between two
/// consecutive notifications at most one flush occurs, and at most one flush
/// tick is ever outstanding.
#[derive(Clone)]
pub struct StreamingBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    state: Mutex<BufferState>,
    subscribers: Mutex<Vec<(SubscriberId, Arc<BufferListener>)>>,
    next_subscriber: AtomicU64,
    scheduler: Arc<dyn TickScheduler>,
}

#[derive(Default)]
struct BufferState {
    /// Committed text
    buffer: String,
    /// Fragments not yet merged into `buffer`
    pending: Vec<String>,
    /// The one outstanding flush tick, if any
    flush: Option<TickHandle>,
}

impl StreamingBuffer {
    /// Create a buffer flushing on the given scheduler's ticks
    #[must_use]
    pub fn new(scheduler: Arc<dyn TickScheduler>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState::default()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                scheduler,
            }),
        }
    }

    /// Create a buffer on the fixed-interval fallback scheduler
    ///
    /// Must be used inside a tokio runtime.
    #[must_use]
    pub fn with_frame_fallback() -> Self {
        Self::new(Arc::new(TimerScheduler::default()))
    }

    /// Queue a text fragment and arm a flush if none is outstanding
    pub fn append(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        let mut state = self.inner.state.lock();
        state.pending.push(chunk);

        if state.flush.is_none() {
            let weak = Arc::downgrade(&self.inner);
            state.flush = Some(self.inner.scheduler.schedule(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    BufferInner::flush(&inner);
                }
            })));
        }
    }

    /// The authoritative current text
    ///
    /// Force-merges any outstanding fragments first, so the result never
    /// races the next scheduled flush.
    #[must_use]
    pub fn read(&self) -> String {
        let mut state = self.inner.state.lock();
        merge_pending(&mut state);
        state.buffer.clone()
    }

    /// Replace the buffer wholesale and notify immediately
    ///
    /// Used for corrective full-content replacement rather than incremental
    /// append; any queued fragments and armed flush are discarded.
    pub fn set_content(&self, content: impl Into<String>) {
        let content = content.into();
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.pending.clear();
            if let Some(handle) = state.flush.take() {
                handle.cancel();
            }
            state.buffer = content;
            state.buffer.clone()
        };
        self.inner.notify(&snapshot);
    }

    /// Clear all text and cancel any armed flush
    ///
    /// Called at session start and session end. Does not notify.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.buffer.clear();
        state.pending.clear();
        if let Some(handle) = state.flush.take() {
            handle.cancel();
        }
    }

    /// Register a listener for merged-buffer notifications
    pub fn subscribe(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst));
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl std::fmt::Debug for StreamingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamingBuffer")
            .field("committed_len", &state.buffer.len())
            .field("pending_fragments", &state.pending.len())
            .field("flush_armed", &state.flush.is_some())
            .finish()
    }
}

impl BufferInner {
    /// Merge the pending queue and notify subscribers once
    ///
    /// A tick that finds nothing pending (e.g. `read` already merged it)
    /// notifies nobody, preserving the one-flush-per-notification bound.
    fn flush(inner: &Arc<Self>) {
        let snapshot = {
            let mut state = inner.state.lock();
            state.flush = None;
            if state.pending.is_empty() {
                return;
            }
            merge_pending(&mut state);
            state.buffer.clone()
        };
        inner.notify(&snapshot);
    }

    fn notify(&self, content: &str) {
        // Listeners are invoked without any lock held so they may freely
        // subscribe, unsubscribe, or read back.
        let listeners: Vec<Arc<BufferListener>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(content);
        }
    }
}

/// Join all pending fragments and commit them with one concatenation
fn merge_pending(state: &mut BufferState) {
    if state.pending.is_empty() {
        return;
    }
    let merged = state.pending.concat();
    state.pending.clear();
    state.buffer.push_str(&merged);
}

// ============================================================================
// Tests
// ============================================================================
