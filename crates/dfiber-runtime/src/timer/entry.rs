//! Timer handle

use super::{TimerCallback, TimerShared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use std::time::Duration;

/// A scheduled callback, shared between its manager and the caller
///
/// Returned by `TimerManager::add_timer`. Dropping the handle does not
/// cancel the timer.
pub struct Timer {
    /// Tie-breaker for timers with the same expiry
    pub(super) seq: u64,
    pub(super) inner: Mutex<TimerInner>,
    pub(super) manager: Weak<TimerShared>,
}

pub(super) struct TimerInner {
    /// Absolute expiry (manager clock, ms). Doubles as the ordered-set key
    /// together with `seq`; only changed under the manager lock.
    pub(super) next_ms: u64,
    pub(super) period_ms: u64,
    pub(super) recurring: bool,
    /// `None` once cancelled or fired (one-shot)
    pub(super) cb: Option<TimerCallback>,
}

impl Timer {
    /// Remove the timer; its callback will not run
    ///
    /// Returns false if it already fired (one-shot) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.lock();
        let mut inner = self.inner.lock();
        if inner.cb.take().is_none() {
            return false;
        }
        set.timers.remove(&(inner.next_ms, self.seq));
        true
    }

    /// Restart the countdown: expiry becomes now + period
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut set = mgr.set.lock();
        let mut inner = self.inner.lock();
        if inner.cb.is_none() {
            return false;
        }
        let Some(timer) = set.timers.remove(&(inner.next_ms, self.seq)) else {
            return false;
        };
        inner.next_ms = mgr.clock.now_ms().saturating_add(inner.period_ms);
        set.timers.insert((inner.next_ms, self.seq), timer);
        true
    }

    /// Change the period
    ///
    /// With `from_now` the new expiry is now + `period`; otherwise it is
    /// measured from the instant the current period started. Asking for the
    /// same period without `from_now` is a no-op.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let ms = super::duration_ms(period);
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let at_front = {
            let mut set = mgr.set.lock();
            let mut inner = self.inner.lock();
            if ms == inner.period_ms && !from_now {
                return true;
            }
            if inner.cb.is_none() {
                return false;
            }
            let Some(timer) = set.timers.remove(&(inner.next_ms, self.seq)) else {
                return false;
            };
            let start = if from_now {
                mgr.clock.now_ms()
            } else {
                inner.next_ms.saturating_sub(inner.period_ms)
            };
            inner.period_ms = ms;
            inner.next_ms = start.saturating_add(ms);
            set.insert(inner.next_ms, self.seq, timer)
        };
        if at_front {
            (mgr.on_front)();
        }
        true
    }

    /// Still scheduled (not cancelled, not a fired one-shot)
    pub fn is_active(&self) -> bool {
        self.inner.lock().cb.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.inner.lock().recurring
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.inner.lock().period_ms)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Timer")
            .field("seq", &self.seq)
            .field("next_ms", &inner.next_ms)
            .field("period_ms", &inner.period_ms)
            .field("recurring", &inner.recurring)
            .field("active", &inner.cb.is_some())
            .finish()
    }
}
