//! Fiber scheduler
//!
//! A `Scheduler` owns a pool of worker threads and one shared FIFO of
//! tasks. Every worker runs the same loop:
//!
//! ```text
//!   ┌──► take first task whose fiber is not busy elsewhere ──┐
//!   │         │ found                         │ none         │
//!   │         ▼                               ▼              │
//!   │   resume fiber / run callback     resume idle fiber    │
//!   │   on a reusable scratch fiber     (exit when TERM)     │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `tickle`, `idle` and `is_stopping` are the hooks a specialised
//! scheduler overrides through the `Driver` trait; `IOManager` is the one
//! in this crate.

use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, FiberBody};
use crate::tls;
use crate::worker::WorkerPool;
use dfiber_core::{FiberState, SchedError, SchedResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// Unit of work in the task queue
pub enum Task {
    /// Resume this fiber; it must have been created with `dispatched = true`
    /// so that it yields back to the worker's dispatch fiber
    Fiber(Arc<Fiber>),
    /// Run this closure on a scratch fiber
    Call(FiberBody),
}

impl Task {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }

    fn assert_dispatchable(&self) {
        if let Task::Fiber(fiber) = self {
            assert!(
                fiber.is_dispatched(),
                "fiber {} is not dispatched and cannot be scheduled",
                fiber.id()
            );
        }
    }

    /// Fiber currently running (or still switching out) on some thread
    fn is_busy(&self) -> bool {
        match self {
            Task::Fiber(fiber) => fiber.is_busy(),
            Task::Call(_) => false,
        }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Call(_) => f.write_str("Call"),
        }
    }
}

/// Overridable scheduler behaviour
///
/// The run loop always calls through the driver, so an implementation that
/// embeds a `Scheduler` can change how idle threads wait, how they are
/// woken and when they may exit.
pub trait Driver: Send + Sync + 'static {
    /// The embedded scheduler
    fn scheduler(&self) -> &Scheduler;

    /// Wake one idle worker
    fn tickle(&self) {
        tracing::trace!(scheduler = %self.scheduler().name(), "tickle");
    }

    /// Body of each worker's idle fiber; returning ends the worker
    fn idle(&self) {
        while !self.is_stopping() {
            thread::yield_now();
            Fiber::yield_current();
        }
    }

    /// Workers may exit
    fn is_stopping(&self) -> bool {
        self.scheduler().base_is_stopping()
    }

    /// For downcasting `Scheduler::current()`
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    workers: Mutex<Option<WorkerPool>>,

    /// Threads `start()` spawns (caller excluded)
    spawned_threads: usize,
    use_caller: bool,
    stack_size: usize,

    /// Workers currently running a task
    active: AtomicUsize,
    /// Workers currently inside their idle fiber
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,

    /// Run-loop fiber of the absorbed caller thread
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: Mutex<Option<ThreadId>>,

    /// Outermost object that embeds this scheduler
    driver: Weak<dyn Driver>,
}

impl Scheduler {
    /// Plain scheduler with `threads` workers
    ///
    /// With `use_caller` the calling thread counts as one of the workers:
    /// it runs the loop from inside `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<Arc<Scheduler>> {
        let config = RuntimeConfig::new()
            .threads(threads)
            .use_caller(use_caller)
            .name(name);
        Self::from_config(&config)
    }

    pub fn from_config(config: &RuntimeConfig) -> SchedResult<Arc<Scheduler>> {
        config.validate()?;
        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let driver: Weak<dyn Driver> = weak.clone();
            Scheduler::with_driver(config, driver)
        });
        sched.attach_caller()?;
        Ok(sched)
    }

    /// Scheduler to be embedded in `driver`
    ///
    /// The embedding constructor must call `attach_caller()` once the
    /// driver is reachable through its `Arc`.
    pub fn with_driver(config: &RuntimeConfig, driver: Weak<dyn Driver>) -> Scheduler {
        Scheduler {
            name: config.name.clone(),
            tasks: Mutex::new(VecDeque::new()),
            workers: Mutex::new(None),
            spawned_threads: config.spawned_threads(),
            use_caller: config.use_caller,
            stack_size: config.stack_size,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            root_fiber: Mutex::new(None),
            root_thread: Mutex::new(None),
            driver,
        }
    }

    /// Bind the calling thread and create its run-loop fiber (use_caller only)
    pub fn attach_caller(&self) -> SchedResult<()> {
        if !self.use_caller {
            return Ok(());
        }
        tls::ensure_initialized_for_this_thread();
        assert!(
            tls::scheduler().is_none(),
            "thread already belongs to a scheduler"
        );

        let driver = self.driver.clone();
        let root = Fiber::new(
            move || {
                if let Some(driver) = driver.upgrade() {
                    run(driver);
                }
            },
            self.stack_size,
            false,
        )?;

        tls::set_scheduler(Some(self.driver.clone()));
        tls::set_dispatch_fiber(Some(root.clone()));
        *self.root_fiber.lock() = Some(root);
        *self.root_thread.lock() = Some(thread::current().id());
        Ok(())
    }

    /// Scheduler bound to the calling thread
    pub fn current() -> Option<Arc<dyn Driver>> {
        tls::scheduler()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total workers, absorbed caller included
    pub fn thread_count(&self) -> usize {
        self.spawned_threads + usize::from(self.use_caller)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Default stopping rule: stop requested, queue drained, nothing running
    pub fn base_is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.tasks.lock().is_empty()
    }

    /// Spawn the worker threads
    pub fn start(&self) -> SchedResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        let driver = self.driver.upgrade().ok_or(SchedError::NoScheduler)?;

        let mut workers = self.workers.lock();
        let pool = workers.get_or_insert_with(|| WorkerPool::new(self.name.clone()));
        for _ in 0..self.spawned_threads {
            let driver = driver.clone();
            pool.spawn(move || run(driver))?;
        }
        tracing::debug!(
            scheduler = %self.name,
            workers = self.spawned_threads,
            use_caller = self.use_caller,
            "scheduler started"
        );
        Ok(())
    }

    /// Drain and shut down
    ///
    /// Sets the stop flag, wakes every worker, runs the caller's share of
    /// the loop (use_caller) and joins all workers. Returns once every
    /// queued task has finished and every worker has exited.
    ///
    /// # Panics
    ///
    /// If called from one of this scheduler's own workers, or, for a
    /// use_caller scheduler, from a thread other than the creating one.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        tracing::debug!(scheduler = %self.name, "scheduler stopping");

        if let Some(driver) = self.driver.upgrade() {
            for _ in 0..self.spawned_threads {
                driver.tickle();
            }
            if self.root_fiber.lock().is_some() {
                driver.tickle();
            }
        }

        let root = self.root_fiber.lock().take();
        if let Some(root) = root {
            assert_eq!(
                Some(thread::current().id()),
                *self.root_thread.lock(),
                "stop() on a use_caller scheduler must run on the creating thread"
            );
            if root.state() == FiberState::Ready {
                root.resume();
            }
            tls::set_dispatch_fiber(None);
            tls::set_scheduler(None);
        }

        let workers = self.workers.lock().take();
        if let Some(pool) = workers {
            assert!(
                !pool.thread_ids().contains(&thread::current().id()),
                "stop() called from a worker of the same scheduler"
            );
            pool.join();
        }
        tracing::debug!(scheduler = %self.name, "scheduler stopped");
    }

    /// Queue a fiber or callback, waking a worker if the queue was empty
    pub fn schedule(&self, task: impl Into<Task>) {
        let task = task.into();
        task.assert_dispatchable();
        let need_tickle = {
            let mut tasks = self.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a closure
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f));
    }

    /// Queue several tasks under one lock
    pub fn schedule_batch<I>(&self, batch: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let batch: Vec<Task> = batch.into_iter().collect();
        batch.iter().for_each(Task::assert_dispatchable);
        let need_tickle = {
            let mut tasks = self.tasks.lock();
            let was_empty = tasks.is_empty();
            tasks.extend(batch);
            was_empty && !tasks.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.tickle();
        }
    }

    /// Weak handle of the outermost driver
    pub(crate) fn driver(&self) -> Weak<dyn Driver> {
        self.driver.clone()
    }

    /// Remove the first task that no other thread is running
    ///
    /// Returns the task and whether more work remains for another worker.
    fn take_task(&self) -> (Option<Task>, bool) {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .iter()
            .position(|t| !t.is_busy())
            .and_then(|i| tasks.remove(i));
        if task.is_some() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        (task, !tasks.is_empty())
    }
}

impl Driver for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // A use_caller scheduler that was never stopped still has its
        // run-loop fiber parked in the creating thread's slots.
        if *self.root_thread.get_mut() == Some(thread::current().id())
            && self.root_fiber.get_mut().is_some()
        {
            tls::set_dispatch_fiber(None);
            tls::set_scheduler(None);
        }
        tracing::debug!(scheduler = %self.name, "scheduler dropped");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .field("use_caller", &self.use_caller)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

/// Worker loop; runs until the idle fiber terminates
fn run(driver: Arc<dyn Driver>) {
    let sched = driver.scheduler();
    tls::ensure_initialized_for_this_thread();
    tls::set_scheduler(Some(Arc::downgrade(&driver)));
    tls::set_dispatch_fiber(Some(Fiber::current()));
    tracing::debug!(scheduler = %sched.name, "run loop started");

    let idle_driver = driver.clone();
    let idle_fiber = match Fiber::new(move || idle_driver.idle(), sched.stack_size, true) {
        Ok(fiber) => fiber,
        Err(e) => {
            tracing::error!(scheduler = %sched.name, error = %e, "cannot create idle fiber");
            tls::set_dispatch_fiber(None);
            tls::set_scheduler(None);
            return;
        }
    };

    // Scratch fiber for callbacks, recycled while its last body terminated
    let mut call_fiber: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_me) = sched.take_task();
        if tickle_me {
            driver.tickle();
        }

        match task {
            Some(Task::Fiber(fiber)) => {
                if fiber.state() == FiberState::Ready {
                    resume_logged(&fiber);
                }
                sched.active.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Task::Call(cb)) => {
                let fiber = match call_fiber.take() {
                    Some(fiber) => {
                        fiber.reset_body(cb);
                        Ok(fiber)
                    }
                    None => Fiber::with_body(cb, sched.stack_size, true),
                };
                match fiber {
                    Ok(fiber) => {
                        resume_logged(&fiber);
                        // Parked elsewhere if it yielded without finishing
                        if fiber.state() == FiberState::Term {
                            call_fiber = Some(fiber);
                        }
                    }
                    Err(e) => {
                        tracing::error!(scheduler = %sched.name, error = %e, "dropping callback: no fiber");
                    }
                }
                sched.active.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    tracing::debug!(scheduler = %sched.name, "idle fiber terminated");
                    break;
                }
                sched.idle.fetch_add(1, Ordering::SeqCst);
                resume_logged(&idle_fiber);
                sched.idle.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    tls::set_dispatch_fiber(None);
    tls::set_scheduler(None);
    tracing::debug!(scheduler = %sched.name, "run loop exited");
}

fn resume_logged(fiber: &Arc<Fiber>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume())) {
        tracing::error!(fiber = %fiber.id(), panic = panic_message(&*payload), "fiber panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

/// Requeue the current fiber on its scheduler and yield
///
/// Outside a scheduled fiber this only yields the OS thread.
pub fn yield_now() {
    let fiber = Fiber::current();
    if fiber.has_stack() && fiber.is_dispatched() {
        if let Some(driver) = tls::scheduler() {
            driver.scheduler().schedule(fiber.clone());
            drop(driver);
            fiber.yield_now();
            return;
        }
    }
    thread::yield_now();
}
