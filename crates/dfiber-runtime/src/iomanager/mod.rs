//! epoll-driven scheduler
//!
//! `IOManager` embeds a `Scheduler` and a `TimerManager` and replaces the
//! idle behaviour: idle workers block in `epoll_wait` until a registered fd
//! becomes ready, a timer is due, or another thread writes to the tickle
//! pipe. Registrations are edge-triggered and one-shot: a readiness
//! notification removes the direction from the interest set and schedules
//! the waiting task exactly once.
//!
//! ```text
//!   add_event(fd, READ, task) ──► epoll ADD/MOD (EPOLLIN|EPOLLET)
//!                                         │ ready
//!   idle: epoll_wait ─────────────────────┘
//!         └─► clear READ, MOD/DEL remaining, schedule(task)
//! ```

mod fd_context;

use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, FiberBody};
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerCallback, TimerManager};
use crate::tls;
use dfiber_core::{Event, FiberState, SchedError, SchedResult};
use fd_context::FdContext;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags};
use nix::unistd::pipe2;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;

/// epoll token of the tickle pipe; every other token is an fd
const TICKLE_TOKEN: u64 = u64::MAX;

pub struct IOManager {
    sched: Scheduler,
    timers: TimerManager,

    epoll: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,

    /// Registered, not yet triggered events
    pending: AtomicUsize,

    /// Indexed by fd; only grows
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,

    max_wait: Duration,
    event_batch: usize,
}

impl IOManager {
    /// Create and start an IOManager
    ///
    /// With `config.use_caller` the calling thread joins the pool when
    /// `stop()` is called on it.
    pub fn new(config: RuntimeConfig) -> SchedResult<Arc<IOManager>> {
        config.validate()?;

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| SchedError::os("epoll_create1", e))?
            .0;
        let (tickle_rx, tickle_tx) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|e| SchedError::os("pipe2", e))?;
        epoll_ctl(
            &epoll,
            libc::EPOLL_CTL_ADD,
            tickle_rx.as_raw_fd(),
            EPOLLIN | EPOLLET,
            TICKLE_TOKEN,
        )
        .map_err(|e| SchedError::os("epoll_ctl", e))?;

        let iom = Arc::new_cyclic(|weak: &Weak<IOManager>| {
            let driver: Weak<dyn Driver> = weak.clone();
            let front = weak.clone();
            let mut table = Vec::new();
            grow_table(&mut table, config.initial_fd_slots);

            IOManager {
                sched: Scheduler::with_driver(&config, driver),
                timers: TimerManager::new(move || {
                    if let Some(iom) = front.upgrade() {
                        iom.tickle();
                    }
                }),
                epoll,
                tickle_rx,
                tickle_tx,
                pending: AtomicUsize::new(0),
                fd_contexts: RwLock::new(table),
                max_wait: config.max_wait,
                event_batch: config.event_batch,
            }
        });

        iom.sched.attach_caller()?;
        if let Err(e) = iom.sched.start() {
            iom.sched.stop();
            return Err(e);
        }
        config.log();
        Ok(iom)
    }

    /// IOManager the calling thread works for
    pub fn current() -> Option<Arc<IOManager>> {
        Scheduler::current()?.as_any().downcast::<IOManager>().ok()
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Queue a fiber or callback
    pub fn schedule(&self, task: impl Into<Task>) {
        self.sched.schedule(task);
    }

    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule_fn(f);
    }

    /// Drain everything (tasks, timers, pending events) and join the workers
    pub fn stop(&self) {
        self.sched.stop();
    }

    /// Wait for `event` on `fd`
    ///
    /// When it fires, `cb` is scheduled, or, with `cb == None`, the calling
    /// fiber is. At most one registration per direction per fd.
    ///
    /// # Panics
    ///
    /// If `event` is not exactly READ or WRITE, if the direction is already
    /// registered, or if `cb` is `None` outside a running fiber.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberBody>) -> SchedResult<()> {
        assert!(event.is_single(), "add_event needs exactly one of READ, WRITE; got {event:?}");
        let ctx = self
            .fd_context(fd, true)
            .ok_or_else(|| SchedError::os("add_event", io::Error::from_raw_os_error(libc::EBADF)))?;

        let task = match cb {
            Some(cb) => Task::Call(cb),
            None => {
                let fiber = Fiber::current();
                assert!(fiber.has_stack(), "add_event without a callback outside a fiber");
                assert_eq!(fiber.state(), FiberState::Running);
                Task::Fiber(fiber)
            }
        };

        let mut state = ctx.state.lock();
        assert!(
            !state.events.intersects(event),
            "fd {fd} already waits for {event:?}"
        );

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let interest = EPOLLET | (state.events | event).bits();
        if let Err(e) = epoll_ctl(&self.epoll, op, fd, interest, fd as u64) {
            tracing::error!(fd, op, interest, error = %e, "epoll_ctl failed");
            return Err(SchedError::os("epoll_ctl", e));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events |= event;

        let slot = state.context_mut(event);
        debug_assert!(slot.is_empty());
        slot.scheduler = Some(tls::scheduler_weak().unwrap_or_else(|| self.sched.driver()));
        slot.task = Some(task);
        Ok(())
    }

    /// Drop a registration without running its task
    ///
    /// Returns false if `event` was not registered on `fd`. A fiber parked
    /// by `wait()` is never resumed and leaks; use `cancel_event` to wake it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> SchedResult<bool> {
        assert!(event.is_single(), "expected one of READ, WRITE; got {event:?}");
        let Some(ctx) = self.fd_context(fd, false) else {
            return Ok(false);
        };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return Ok(false);
        }

        let remaining = state.events - event;
        self.update_interest(fd, remaining)?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = remaining;
        state.context_mut(event).discard(fd);
        Ok(true)
    }

    /// Remove a registration and run its task now
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> SchedResult<bool> {
        assert!(event.is_single(), "expected one of READ, WRITE; got {event:?}");
        let Some(ctx) = self.fd_context(fd, false) else {
            return Ok(false);
        };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return Ok(false);
        }

        self.update_interest(fd, state.events - event)?;
        state.trigger(fd, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Remove every registration on `fd` and run their tasks
    pub fn cancel_all(&self, fd: RawFd) -> SchedResult<bool> {
        let Some(ctx) = self.fd_context(fd, false) else {
            return Ok(false);
        };
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return Ok(false);
        }

        self.update_interest(fd, Event::NONE)?;
        for event in [Event::READ, Event::WRITE] {
            if state.events.contains(event) {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        debug_assert!(state.events.is_empty());
        Ok(true)
    }

    /// Suspend the calling fiber until `event` fires on `fd` (or is cancelled)
    pub fn wait(&self, fd: RawFd, event: Event) -> SchedResult<()> {
        self.add_event(fd, event, None)?;
        Fiber::yield_current();
        Ok(())
    }

    /// Suspend the calling fiber for `duration`
    ///
    /// Outside a scheduled fiber this blocks the thread instead.
    pub fn sleep(&self, duration: Duration) {
        let fiber = Fiber::current();
        if !fiber.has_stack() || !fiber.is_dispatched() {
            thread::sleep(duration);
            return;
        }

        let driver = tls::scheduler_weak().unwrap_or_else(|| self.sched.driver());
        let parked = Mutex::new(Some(fiber.clone()));
        self.timers.add_timer(
            duration,
            move || {
                let fiber = parked.lock().take();
                if let (Some(fiber), Some(driver)) = (fiber, driver.upgrade()) {
                    driver.scheduler().schedule(fiber);
                }
            },
            false,
        );
        fiber.yield_now();
    }

    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(delay, cb, recurring)
    }

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
        self.timers.add_condition_timer(delay, cb, guard, recurring)
    }

    /// Directions currently registered on `fd`
    pub fn events_for(&self, fd: RawFd) -> Event {
        self.fd_context(fd, false)
            .map(|ctx| ctx.events())
            .unwrap_or(Event::NONE)
    }

    /// Registered events not yet triggered
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Slots in the fd table
    pub fn fd_capacity(&self) -> usize {
        self.fd_contexts.read().len()
    }

    fn fd_context(&self, fd: RawFd, grow: bool) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        if let Some(ctx) = self.fd_contexts.read().get(idx) {
            return Some(ctx.clone());
        }
        if !grow {
            return None;
        }

        let mut table = self.fd_contexts.write();
        if idx >= table.len() {
            grow_table(&mut table, (idx * 3 / 2).max(idx + 1));
        }
        Some(table[idx].clone())
    }

    /// Point epoll at the directions still wanted, or drop the fd
    fn update_interest(&self, fd: RawFd, remaining: Event) -> SchedResult<()> {
        let (op, interest) = if remaining.is_empty() {
            (libc::EPOLL_CTL_DEL, 0)
        } else {
            (libc::EPOLL_CTL_MOD, EPOLLET | remaining.bits())
        };
        epoll_ctl(&self.epoll, op, fd, interest, fd as u64).map_err(|e| {
            tracing::error!(fd, op, interest, error = %e, "epoll_ctl failed");
            SchedError::os("epoll_ctl", e)
        })
    }

    /// Block in epoll_wait for at most `timeout`; returns the number of events
    fn poll(&self, events: &mut [libc::epoll_event], timeout: Duration) -> usize {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            // SAFETY: `events` is a valid buffer of `events.len()` entries.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            match Errno::result(n) {
                Ok(n) => return n as usize,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "epoll_wait failed");
                    return 0;
                }
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: reading into a local buffer of the given length.
            let n = unsafe {
                libc::read(self.tickle_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Handle one readiness notification for `fd`
    fn dispatch_ready(&self, fd: RawFd, mut bits: u32) {
        let Some(ctx) = self.fd_context(fd, false) else {
            return;
        };
        let mut state = ctx.state.lock();

        // Errors and hangups wake whatever is registered
        if bits & (EPOLLERR | EPOLLHUP) != 0 {
            bits |= (EPOLLIN | EPOLLOUT) & state.events.bits();
        }
        let fired = Event::from_bits_truncate(bits) & state.events;
        if fired.is_empty() {
            return;
        }

        if self.update_interest(fd, state.events - fired).is_err() {
            return;
        }
        for event in [Event::READ, Event::WRITE] {
            if fired.contains(event) {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Driver for IOManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one worker blocked in epoll_wait
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        // SAFETY: writing one byte from a static buffer.
        let n = unsafe { libc::write(self.tickle_tx.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if n < 0 {
            // A full pipe already guarantees a wakeup
            let err = Errno::last();
            if err != Errno::EAGAIN {
                tracing::error!(error = %err, "tickle write failed");
            }
        }
    }

    fn idle(&self) {
        let empty = libc::epoll_event { events: 0, u64: 0 };
        let mut events = vec![empty; self.event_batch];
        let mut expired: Vec<TimerCallback> = Vec::new();

        loop {
            if self.is_stopping() {
                tracing::debug!(scheduler = %self.sched.name(), "idle exiting");
                // Let the next idle worker notice too
                self.tickle();
                break;
            }

            let timeout = self
                .timers
                .next_timeout()
                .map_or(self.max_wait, |t| t.min(self.max_wait));
            let n = self.poll(&mut events, timeout);

            self.timers.collect_expired(&mut expired);
            if !expired.is_empty() {
                self.sched
                    .schedule_batch(expired.drain(..).map(|cb| Task::call(move || cb())));
            }

            for ev in events[..n].iter().copied() {
                let token = ev.u64;
                let bits = ev.events;
                if token == TICKLE_TOKEN {
                    self.drain_tickle();
                } else {
                    self.dispatch_ready(token as RawFd, bits);
                }
            }

            Fiber::yield_current();
        }
    }

    fn is_stopping(&self) -> bool {
        self.sched.base_is_stopping()
            && !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for IOManager {
    fn drop(&mut self) {
        let pending = *self.pending.get_mut();
        if pending > 0 {
            tracing::warn!(scheduler = %self.sched.name(), pending, "IOManager dropped with registered events");
        }
    }
}

impl fmt::Debug for IOManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IOManager")
            .field("scheduler", &self.sched)
            .field("timers", &self.timers)
            .field("pending", &self.pending_event_count())
            .field("fd_capacity", &self.fd_capacity())
            .finish()
    }
}

fn grow_table(table: &mut Vec<Arc<FdContext>>, len: usize) {
    let start = table.len();
    table.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
}

fn epoll_ctl(epoll: &OwnedFd, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> nix::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    // SAFETY: `ev` outlives the call; DEL ignores it.
    let ret = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, fd, &mut ev) };
    Errno::result(ret).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn iomanager(name: &str) -> Arc<IOManager> {
        let config = RuntimeConfig::new()
            .threads(2)
            .use_caller(false)
            .name(name)
            .max_wait(Duration::from_millis(200));
        IOManager::new(config).unwrap()
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_read_event_fires_once() {
        let iom = iomanager("read_once");
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert_eq!(iom.events_for(fd), Event::READ);
        assert_eq!(iom.pending_event_count(), 1);

        b.write_all(b"x").unwrap();
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(iom.events_for(fd), Event::NONE);
        assert_eq!(iom.pending_event_count(), 0);

        // One-shot: more data does not run the callback again
        b.write_all(b"y").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        iom.stop();
    }

    #[test]
    fn test_cancel_event_runs_task() {
        let iom = iomanager("cancel");
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(iom.cancel_event(fd, Event::READ).unwrap());
        rx.recv_timeout(WAIT).unwrap();
        assert!(!iom.cancel_event(fd, Event::READ).unwrap());
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_del_event_drops_task() {
        let iom = iomanager("del");
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(iom.del_event(fd, Event::READ).unwrap());
        assert!(!iom.del_event(fd, Event::READ).unwrap());
        b.write_all(b"x").unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_cancel_all() {
        let iom = iomanager("cancel_all");
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.add_event(fd, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(iom.cancel_all(fd).unwrap());
        rx.recv_timeout(WAIT).unwrap();
        assert!(!iom.cancel_all(fd).unwrap());
        iom.stop();
    }

    #[test]
    fn test_double_registration_panics() {
        let iom = iomanager("double");
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        iom.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        let second = panic::catch_unwind(AssertUnwindSafe(|| {
            iom.add_event(fd, Event::READ, Some(Box::new(|| {})))
        }));
        assert!(second.is_err());
        assert_eq!(iom.pending_event_count(), 1);

        assert!(iom.del_event(fd, Event::READ).unwrap());
        iom.stop();
    }

    #[test]
    fn test_unknown_fd() {
        let iom = iomanager("badfd");
        assert!(iom.add_event(-1, Event::READ, Some(Box::new(|| {}))).is_err());
        assert!(!iom.del_event(-1, Event::READ).unwrap());
        assert!(!iom.cancel_all(100_000).unwrap());
        assert_eq!(iom.events_for(100_000), Event::NONE);
        iom.stop();
    }

    #[test]
    fn test_table_grows_for_large_fd() {
        let config = RuntimeConfig::new()
            .threads(1)
            .use_caller(false)
            .name("grow")
            .initial_fd_slots(4);
        let iom = IOManager::new(config).unwrap();
        assert_eq!(iom.fd_capacity(), 4);

        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        iom.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        assert!(iom.fd_capacity() > fd as usize);
        assert!(iom.del_event(fd, Event::READ).unwrap());
        iom.stop();
    }

    #[test]
    fn test_fiber_waits_for_readable() {
        let iom = iomanager("fiber_wait");
        let (mut a, mut b) = pair();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let iom = IOManager::current().unwrap();
            let mut buf = [0u8; 16];
            loop {
                match a.read(&mut buf) {
                    Ok(n) => {
                        tx.send(buf[..n].to_vec()).unwrap();
                        return;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        iom.wait(a.as_raw_fd(), Event::READ).unwrap();
                    }
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        });

        thread::sleep(Duration::from_millis(50));
        b.write_all(b"ping").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"ping");
        iom.stop();
    }

    #[test]
    fn test_timer_fires() {
        let iom = iomanager("timer");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let start = Instant::now();

        iom.add_timer(Duration::from_millis(30), move || tx.lock().send(()).unwrap(), false);
        rx.recv_timeout(WAIT).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        iom.stop();
    }

    #[test]
    fn test_sleep_in_fiber() {
        let iom = iomanager("sleep");
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let start = Instant::now();
            IOManager::current().unwrap().sleep(Duration::from_millis(50));
            tx.send(start.elapsed()).unwrap();
        });
        assert!(rx.recv_timeout(WAIT).unwrap() >= Duration::from_millis(50));
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = iomanager("stop_timers");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        iom.add_timer(Duration::from_millis(50), move || f.store(true, Ordering::SeqCst), false);
        iom.stop();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_waits_for_pending_events() {
        let iom = iomanager("stop_events");
        let (a, mut b) = pair();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        iom.add_event(
            a.as_raw_fd(),
            Event::READ,
            Some(Box::new(move || f.store(true, Ordering::SeqCst))),
        )
        .unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            b.write_all(b"x").unwrap();
            b
        });
        iom.stop();
        assert!(fired.load(Ordering::SeqCst));
        drop(writer.join().unwrap());
    }

    #[test]
    fn test_use_caller_runs_on_stop() {
        let config = RuntimeConfig::new().threads(1).use_caller(true).name("caller_io");
        let iom = IOManager::new(config).unwrap();
        assert!(IOManager::current().is_some());

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        iom.schedule_fn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        iom.stop();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(IOManager::current().is_none());
    }

    fn wait_registered(iom: &IOManager, fd: RawFd, event: Event) {
        let deadline = Instant::now() + WAIT;
        while !iom.events_for(fd).contains(event) {
            assert!(Instant::now() < deadline, "fd {fd} never registered {event:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_cancel_event_wakes_waiting_fiber() {
        let iom = iomanager("cancel_fiber");
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        iom.schedule_fn(move || {
            let res = IOManager::current().unwrap().wait(fd, Event::READ);
            tx.send(res.is_ok()).unwrap();
        });

        wait_registered(&iom, fd, Event::READ);
        assert!(iom.cancel_event(fd, Event::READ).unwrap());
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
        drop(a);
    }

    #[test]
    fn test_hangup_wakes_writer() {
        let iom = iomanager("hangup");
        let (mut a, b) = pair();
        let fd = a.as_raw_fd();
        let (tx, rx) = mpsc::channel();

        // Fill the send buffer so WRITE is not ready
        let chunk = [0u8; 4096];
        loop {
            match a.write(&chunk) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("write failed: {e}"),
            }
        }

        iom.add_event(fd, Event::WRITE, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(b);
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(iom.events_for(fd), Event::NONE);
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_earlier_timer_interrupts_long_wait() {
        let config = RuntimeConfig::new()
            .threads(2)
            .use_caller(false)
            .name("early_timer")
            .max_wait(Duration::from_secs(10));
        let iom = IOManager::new(config).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        // Let the workers settle into epoll_wait with the long timeout
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        iom.add_timer(Duration::from_millis(20), move || tx.lock().send(()).unwrap(), false);

        rx.recv_timeout(WAIT).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        iom.stop();
    }
}
