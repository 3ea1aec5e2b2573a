//! Worker thread management
//!
//! Workers are named OS threads that each run one scheduler loop.
//! Threads are named `<scheduler>_<index>`.

use dfiber_core::error::{SchedError, SchedResult};
use std::thread::{self, JoinHandle, ThreadId};

/// Pool of worker threads belonging to one scheduler
#[derive(Debug)]
pub struct WorkerPool {
    /// Name prefix for spawned threads
    name: String,

    /// Join handles for worker threads
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create an empty pool
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: Vec::new(),
        }
    }

    /// Spawn the next worker thread running `worker_fn`
    pub fn spawn<F>(&mut self, worker_fn: F) -> SchedResult<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.handles.len();
        let handle = thread::Builder::new()
            .name(format!("{}_{}", self.name, index))
            .spawn(worker_fn)
            .map_err(SchedError::Spawn)?;
        let id = handle.thread().id();
        self.handles.push(handle);
        Ok(id)
    }

    /// Number of spawned workers
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Thread ids of all workers
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.handles.iter().map(|h| h.thread().id()).collect()
    }

    /// Wait for all workers to finish
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_workers_are_named_and_joined() {
        let names = Arc::new(Mutex::new(Vec::new()));
        let mut pool = WorkerPool::new("pool");
        for _ in 0..3 {
            let names = names.clone();
            pool.spawn(move || {
                let name = thread::current().name().unwrap().to_string();
                names.lock().unwrap().push(name);
            })
            .unwrap();
        }
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.thread_ids().len(), 3);
        pool.join();

        let mut names = names.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, vec!["pool_0", "pool_1", "pool_2"]);
    }
}
