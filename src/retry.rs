//! Named retry policies around the source-chain and cross-process calls.
//! Backoff is fixed, not exponential, and shared: every worker holds a
//! handle to the same atomically-updated duration, so it can be retuned at
//! runtime without restarting them.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A fixed backoff duration shared between workers.
#[derive(Debug, Clone)]
pub struct Backoff(Arc<AtomicU64>);

impl Backoff {
    pub fn from_secs(secs: u64) -> Self {
        Backoff(Arc::new(AtomicU64::new(secs * 1000)))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, duration: Duration) {
        self.0.store(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Run the operation until it succeeds, sleeping the backoff between
/// attempts. This can spin for the lifetime of the process on a persistent
/// fault; each attempt is logged so the condition is loud, never silent.
pub fn forever<T, E, O>(backoff: &Backoff, what: &str, mut op: O) -> T
where
    E: Display,
    O: FnMut() -> Result<T, E>,
{
    loop {
        match op() {
            Ok(value) => return value,
            Err(e) => {
                log::error!("{} failed, retrying in {:?}: {}", what, backoff.get(), e);
                thread::sleep(backoff.get());
            }
        }
    }
}

/// Like [`forever`], but only errors the predicate deems transient are
/// retried; any other error is handed back to the caller.
pub fn while_transient<T, E, P, O>(
    backoff: &Backoff,
    what: &str,
    is_transient: P,
    mut op: O,
) -> Result<T, E>
where
    E: Display,
    P: Fn(&E) -> bool,
    O: FnMut() -> Result<T, E>,
{
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                log::error!("{} failed, retrying in {:?}: {}", what, backoff.get(), e);
                thread::sleep(backoff.get());
            }
            Err(e) => return Err(e),
        }
    }
}
