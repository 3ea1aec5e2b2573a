//! Timer manager
//!
//! Timers live in one ordered set keyed by `(expiry_ms, seq)`, so the
//! earliest one is always the first key. All mutation (add, cancel,
//! refresh, reset, expiry) happens under the set's lock; callbacks are
//! handed back to the caller and never run under it.
//!
//! ```text
//!   add_timer ──► BTreeMap<(next_ms, seq), Arc<Timer>> ──► collect_expired
//!                      │ new earliest?                         │
//!                      ▼                                       ▼
//!                 on_front() hook                      Vec<TimerCallback>
//!               (IOManager tickles)                 (scheduled by caller)
//! ```

mod entry;

pub use entry::Timer;

use crate::clock::{Clock, MonotonicClock};
use entry::TimerInner;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Callback stored in a timer; recurring timers call it repeatedly
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A backward clock jump larger than this expires every timer
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Whole milliseconds in `d`, saturating at `u64::MAX` ("never")
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) struct TimerShared {
    set: Mutex<TimerSet>,
    clock: Box<dyn Clock>,
    /// Called (outside the lock) when a new timer becomes the earliest
    on_front: Box<dyn Fn() + Send + Sync>,
    next_seq: AtomicU64,
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// A front insertion was reported and nobody has asked for the next
    /// timeout since; further front insertions stay quiet.
    tickled: bool,
    /// Clock reading at the previous expiry pass, for rollover detection
    previous_ms: u64,
}

impl TimerSet {
    /// Insert and report whether the caller should fire the front hook
    fn insert(&mut self, next_ms: u64, seq: u64, timer: Arc<Timer>) -> bool {
        self.timers.insert((next_ms, seq), timer);
        let at_front = !self.tickled
            && self.timers.keys().next() == Some(&(next_ms, seq));
        if at_front {
            self.tickled = true;
        }
        at_front
    }

    fn detect_rollover(&mut self, now_ms: u64) -> bool {
        let rollover = self.previous_ms.saturating_sub(now_ms) > ROLLOVER_MS;
        self.previous_ms = now_ms;
        rollover
    }
}

/// Ordered set of timers with expiry collection
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Manager on the monotonic clock with a front-insertion hook
    pub fn new<H>(on_front: H) -> Self
    where
        H: Fn() + Send + Sync + 'static,
    {
        Self::with_clock(MonotonicClock, on_front)
    }

    pub fn with_clock<C, H>(clock: C, on_front: H) -> Self
    where
        C: Clock + 'static,
        H: Fn() + Send + Sync + 'static,
    {
        let now = clock.now_ms();
        TimerManager {
            shared: Arc::new(TimerShared {
                set: Mutex::new(TimerSet {
                    timers: BTreeMap::new(),
                    tickled: false,
                    previous_ms: now,
                }),
                clock: Box::new(clock),
                on_front: Box::new(on_front),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `cb` to run after `delay`, and every `delay` after that if
    /// `recurring`
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(delay, Arc::new(cb), recurring)
    }

    /// Like `add_timer`, but `cb` only runs if `guard` is still alive when
    /// the timer fires. The timer does not keep the guarded object alive.
    pub fn add_condition_timer<F, W>(
        &self,
        delay: Duration,
        cb: F,
        guard: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        W: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            delay,
            move || {
                if guard.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_callback(&self, delay: Duration, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let period_ms = duration_ms(delay);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let next_ms = self.shared.clock.now_ms().saturating_add(period_ms);
        let timer = Arc::new(Timer {
            seq,
            inner: Mutex::new(TimerInner {
                next_ms,
                period_ms,
                recurring,
                cb: Some(cb),
            }),
            manager: Arc::downgrade(&self.shared),
        });

        let at_front = self.shared.set.lock().insert(next_ms, seq, timer.clone());
        if at_front {
            (self.shared.on_front)();
        }
        timer
    }

    /// Time until the earliest timer expires
    ///
    /// `Some(Duration::ZERO)` if it is already due, `None` if no timer is
    /// scheduled. Re-arms the front-insertion hook.
    pub fn next_timeout(&self) -> Option<Duration> {
        let mut set = self.shared.set.lock();
        set.tickled = false;
        let &(next_ms, _) = set.timers.keys().next()?;
        let now = self.shared.clock.now_ms();
        Some(Duration::from_millis(next_ms.saturating_sub(now)))
    }

    /// Move every due callback into `out`
    ///
    /// One-shot timers are removed; recurring ones are rescheduled at
    /// now + period. If the clock jumped backwards by more than an hour all
    /// timers are treated as due.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.shared.clock.now_ms();
        let mut set = self.shared.set.lock();
        if set.timers.is_empty() {
            return;
        }

        let rollover = set.detect_rollover(now);
        let expired = if rollover {
            tracing::warn!(now_ms = now, "clock rollover detected, expiring all timers");
            std::mem::take(&mut set.timers)
        } else {
            match set.timers.keys().next() {
                Some(&(first, _)) if first <= now => {}
                _ => return,
            }
            let pending = set.timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut set.timers, pending)
        };

        out.reserve(expired.len());
        for (_, timer) in expired {
            let mut inner = timer.inner.lock();
            if inner.recurring {
                if let Some(cb) = inner.cb.clone() {
                    out.push(cb);
                    inner.next_ms = now.saturating_add(inner.period_ms);
                    let key = (inner.next_ms, timer.seq);
                    drop(inner);
                    set.timers.insert(key, timer);
                }
            } else if let Some(cb) = inner.cb.take() {
                out.push(cb);
            }
        }
    }

    /// At least one timer is scheduled
    pub fn has_timer(&self) -> bool {
        !self.shared.set.lock().timers.is_empty()
    }

    /// Number of scheduled timers
    pub fn len(&self) -> usize {
        self.shared.set.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager").field("len", &self.len()).finish()
    }
}
