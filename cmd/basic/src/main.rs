//! Basic dfiber example
//!
//! Spawns a handful of fibers that yield and sleep, plus a recurring timer,
//! on a small thread pool.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - log filter (default `info`)
//! - `DFIBER_THREADS`, `DFIBER_USE_CALLER`, ... - runtime configuration

use dfiber::{spawn, sleep, yield_now, Runtime, RuntimeConfig, Timer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// RUST_LOG=debug DFIBER_THREADS=4 cargo run -p dfiber-basic
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RuntimeConfig::from_env().name("basic");
    let mut runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    let iom = runtime.io().clone();
    let completed = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    runtime.block_on(|| {
        info!("spawning fibers");

        for i in 1..=3 {
            let c = completed.clone();
            let spawned = spawn(move || {
                debug!(fiber = i, "started");
                for j in 0..3 {
                    debug!(fiber = i, iteration = j, "yield");
                    yield_now();
                }
                sleep(Duration::from_millis(20 * i));
                debug!(fiber = i, "finished");
                c.fetch_add(1, Ordering::SeqCst);
            });
            match spawned {
                Ok(id) => info!(fiber = i, %id, "spawned"),
                Err(e) => eprintln!("spawn failed: {e}"),
            }
        }

        // Recurring timer that cancels itself on the fourth tick
        let t = ticks.clone();
        let handle: Arc<OnceLock<Arc<Timer>>> = Arc::new(OnceLock::new());
        let h = handle.clone();
        let timer = iom.add_timer(
            Duration::from_millis(10),
            move || {
                let n = t.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(tick = n, "timer");
                if n >= 4 {
                    if let Some(timer) = h.get() {
                        timer.cancel();
                    }
                }
            },
            true,
        );
        info!(period = ?timer.period(), "timer armed");
        let _ = handle.set(timer);
    });

    info!(
        completed = completed.load(Ordering::SeqCst),
        ticks = ticks.load(Ordering::SeqCst),
        elapsed = ?start.elapsed(),
        "done"
    );
}
