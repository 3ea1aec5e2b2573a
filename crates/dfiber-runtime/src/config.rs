//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls in code
//! 2. Environment variables (`from_env()` only)
//! 3. User's config file named by `DFIBER_CONFIG_RS` at build time
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use dfiber_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .threads(4)
//!     .use_caller(false)
//!     .name("io");
//! ```

/// Compile-time defaults generated by build.rs
pub mod defaults {
    include!(concat!(env!("OUT_DIR"), "/dfiber_defaults.rs"));
}

use dfiber_core::constants::MIN_STACK_SIZE;
use dfiber_core::env::{env_get, env_get_bool, env_get_millis, env_get_str};
use dfiber_core::error::ConfigError;
use std::time::Duration;

/// Scheduler / IOManager configuration with builder pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker count, including the calling thread when `use_caller` is set
    pub threads: usize,
    /// Make the constructing thread one of the workers
    pub use_caller: bool,
    /// Scheduler name; worker threads are named `<name>_<index>`
    pub name: String,
    /// Stack size for fibers the scheduler creates
    pub stack_size: usize,
    /// Ceiling on a single reactor wait
    pub max_wait: Duration,
    /// epoll events fetched per wait
    pub event_batch: usize,
    /// Initial size of the fd-context table
    pub initial_fd_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `DFIBER_THREADS` - Worker thread count
    /// - `DFIBER_USE_CALLER` - Absorb the calling thread (0/1)
    /// - `DFIBER_NAME` - Scheduler name
    /// - `DFIBER_STACK_SIZE` - Fiber stack size in bytes
    /// - `DFIBER_MAX_WAIT_MS` - Reactor wait ceiling in milliseconds
    /// - `DFIBER_EVENT_BATCH` - epoll events per wait
    /// - `DFIBER_INITIAL_FD_SLOTS` - Initial fd-context table size
    pub fn from_env() -> Self {
        Self {
            threads: env_get("DFIBER_THREADS", defaults::THREADS),
            use_caller: env_get_bool("DFIBER_USE_CALLER", defaults::USE_CALLER),
            name: env_get_str("DFIBER_NAME", defaults::NAME),
            stack_size: env_get("DFIBER_STACK_SIZE", defaults::STACK_SIZE),
            max_wait: env_get_millis("DFIBER_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            event_batch: env_get("DFIBER_EVENT_BATCH", defaults::EVENT_BATCH),
            initial_fd_slots: env_get("DFIBER_INITIAL_FD_SLOTS", defaults::INITIAL_FD_SLOTS),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            threads: defaults::THREADS,
            use_caller: defaults::USE_CALLER,
            name: defaults::NAME.to_string(),
            stack_size: defaults::STACK_SIZE,
            max_wait: Duration::from_millis(defaults::MAX_WAIT_MS),
            event_batch: defaults::EVENT_BATCH,
            initial_fd_slots: defaults::INITIAL_FD_SLOTS,
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = d;
        self
    }

    pub fn event_batch(mut self, n: usize) -> Self {
        self.event_batch = n;
        self
    }

    pub fn initial_fd_slots(mut self, n: usize) -> Self {
        self.initial_fd_slots = n;
        self
    }

    /// Threads the scheduler spawns itself
    pub(crate) fn spawned_threads(&self) -> usize {
        if self.use_caller {
            self.threads.saturating_sub(1)
        } else {
            self.threads
        }
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.threads > 1024 {
            return Err(ConfigError::InvalidValue("threads must be <= 1024"));
        }
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("name must not be empty"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.max_wait.is_zero() {
            return Err(ConfigError::InvalidValue("max_wait must be > 0"));
        }
        if self.max_wait.as_millis() > i32::MAX as u128 {
            return Err(ConfigError::InvalidValue("max_wait does not fit an epoll timeout"));
        }
        if self.event_batch == 0 || self.event_batch > i32::MAX as usize {
            return Err(ConfigError::InvalidValue("event_batch must be in 1..=i32::MAX"));
        }
        if self.initial_fd_slots == 0 {
            return Err(ConfigError::InvalidValue("initial_fd_slots must be > 0"));
        }
        Ok(())
    }

    /// Log the configuration at debug level
    pub fn log(&self) {
        tracing::debug!(
            threads = self.threads,
            use_caller = self.use_caller,
            name = %self.name,
            stack_size = self.stack_size,
            max_wait_ms = self.max_wait.as_millis() as u64,
            event_batch = self.event_batch,
            initial_fd_slots = self.initial_fd_slots,
            "dfiber configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::new();
        assert_eq!(config.threads, defaults::THREADS);
        assert_eq!(config.stack_size, defaults::STACK_SIZE);
        assert_eq!(config.max_wait, Duration::from_millis(defaults::MAX_WAIT_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("DFIBER_EVENT_BATCH", "17");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("DFIBER_EVENT_BATCH");
        assert_eq!(config.event_batch, 17);
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .threads(8)
            .use_caller(false)
            .name("io")
            .max_wait(Duration::from_millis(5));

        assert_eq!(config.threads, 8);
        assert_eq!(config.spawned_threads(), 8);
        assert_eq!(config.name, "io");
        assert_eq!(config.max_wait, Duration::from_millis(5));
        assert_eq!(config.clone().use_caller(true).spawned_threads(), 7);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().threads(0).validate().is_err());
        assert!(RuntimeConfig::new().threads(5000).validate().is_err());
        assert!(RuntimeConfig::new().name("").validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().max_wait(Duration::ZERO).validate().is_err());
        assert!(RuntimeConfig::new().event_batch(0).validate().is_err());
        assert_eq!(
            RuntimeConfig::new().initial_fd_slots(0).validate(),
            Err(ConfigError::InvalidValue("initial_fd_slots must be > 0"))
        );
    }
}
