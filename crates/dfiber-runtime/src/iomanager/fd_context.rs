//! Per-descriptor registration state

use crate::scheduler::{Driver, Task};
use dfiber_core::Event;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::Weak;

/// Who to wake for one direction of one fd
#[derive(Default)]
pub(crate) struct EventContext {
    /// Scheduler the task goes back to
    pub(crate) scheduler: Option<Weak<dyn Driver>>,
    pub(crate) task: Option<Task>,
}

impl EventContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.task.is_none()
    }

    /// Forget the registration without running it
    ///
    /// A parked fiber can never be resumed again, and a suspended fiber may
    /// not be freed, so its handle (stack included) is leaked.
    pub(crate) fn discard(&mut self, fd: RawFd) {
        self.scheduler = None;
        if let Some(Task::Fiber(fiber)) = self.task.take() {
            tracing::warn!(fd, fiber = %fiber.id(), "waiting fiber discarded, leaking it");
            std::mem::forget(fiber);
        }
    }
}

#[derive(Default)]
pub(crate) struct FdState {
    /// Directions currently registered with epoll
    pub(crate) events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    pub(crate) fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("no event context for {event:?}");
        }
    }

    /// Clear `event` and hand its task to the scheduler it was registered on
    ///
    /// # Panics
    ///
    /// If `event` is not registered.
    pub(crate) fn trigger(&mut self, fd: RawFd, event: Event) {
        assert!(
            self.events.contains(event),
            "fd {fd}: trigger {event:?} not in {:?}",
            self.events
        );
        self.events = self.events - event;

        let ctx = self.context_mut(event);
        let scheduler = ctx.scheduler.take().and_then(|s| s.upgrade());
        let task = ctx.task.take();
        match (scheduler, task) {
            (Some(scheduler), Some(task)) => scheduler.scheduler().schedule(task),
            (None, Some(task)) => {
                tracing::warn!(fd, ?event, "scheduler gone, dropping event task");
                if let Task::Fiber(fiber) = task {
                    std::mem::forget(fiber);
                }
            }
            _ => {}
        }
    }
}

/// Registration table slot for one fd
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub(crate) fn events(&self) -> Event {
        self.state.lock().events
    }
}
