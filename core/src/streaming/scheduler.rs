//! Flush Tick Scheduling
//!
//! The streaming buffer coalesces appends into one notification per "frame".
//! What a frame means depends on the host: a UI event loop has a paint tick,
//! a headless test wants deterministic control, and everything else falls
//! back to a fixed ~16 ms timer. The buffer therefore takes the scheduling
//! capability as an injected [`TickScheduler`] rather than owning a clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Fallback tick period when no frame scheduler is available (~60 FPS)
pub const FRAME_FALLBACK_PERIOD: Duration = Duration::from_millis(16);

/// A scheduled tick callback
pub type Tick = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled tick; dropping it leaves the tick armed
pub struct TickHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TickHandle {
    /// Wrap a cancellation action
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the scheduled tick
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickHandle").finish_non_exhaustive()
    }
}

/// A "schedule next tick" capability
///
/// Implementations must invoke the tick asynchronously — never from inside
/// `schedule` itself, which may be called while the buffer's lock is held.
pub trait TickScheduler: Send + Sync {
    /// Arm a tick; the returned handle cancels it
    fn schedule(&self, tick: Tick) -> TickHandle;
}

// ============================================================================
// Timer fallback
// ============================================================================

/// Fixed-interval fallback scheduler
///
/// Arms a tokio sleep per tick; must run inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct TimerScheduler {
    period: Duration,
}

impl TimerScheduler {
    /// Create a scheduler with a custom tick period
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new(FRAME_FALLBACK_PERIOD)
    }
}

impl TickScheduler for TimerScheduler {
    fn schedule(&self, tick: Tick) -> TickHandle {
        let period = self.period;
        let task = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            tick();
        });
        TickHandle::new(move || task.abort())
    }
}

// ============================================================================
// Manual scheduler (deterministic tests)
// ============================================================================

/// Test scheduler whose ticks fire only when [`ManualScheduler::fire`] is
/// called, making coalescing behavior fully deterministic
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<PendingTick>>,
}

struct PendingTick {
    cancelled: Arc<AtomicBool>,
    tick: Tick,
}

impl ManualScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed, uncancelled ticks
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Run every armed tick; returns how many actually ran
    pub fn fire(&self) -> usize {
        let drained: Vec<PendingTick> = self.queue.lock().drain(..).collect();
        let mut ran = 0;
        for pending in drained {
            if !pending.cancelled.load(Ordering::SeqCst) {
                (pending.tick)();
                ran += 1;
            }
        }
        ran
    }
}

impl TickScheduler for ManualScheduler {
    fn schedule(&self, tick: Tick) -> TickHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.queue.lock().push(PendingTick {
            cancelled: cancelled.clone(),
            tick,
        });
        TickHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
