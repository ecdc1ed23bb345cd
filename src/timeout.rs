//! Wall-clock deadlines for backend invocations.
//!
//! A call runs on its own named thread and hands its result back over a
//! bounded channel. The caller waits at most the deadline; past it the thread
//! is abandoned and whatever it eventually produces is dropped with the
//! channel.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum TimeoutError {
    #[error("timed out after {:.3}s", .budget.as_secs_f64())]
    TimedOut { budget: Duration },

    #[error("panicked: {message}")]
    Panicked { message: String },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

static CALL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Runs callables under a per-call deadline.
#[derive(Debug, Clone)]
pub struct TimeoutExecutor {
    thread_prefix: String,
}

impl Default for TimeoutExecutor {
    fn default() -> Self {
        Self::new("clauseret-call")
    }
}

impl TimeoutExecutor {
    pub fn new(thread_prefix: impl Into<String>) -> Self {
        Self {
            thread_prefix: thread_prefix.into(),
        }
    }

    /// Run `f` and wait at most `deadline` for it.
    ///
    /// Every call gets a fresh thread and its own deadline; an abandoned call
    /// has no effect on later ones.
    pub fn run<T, F>(&self, deadline: Duration, f: F) -> Result<T, TimeoutError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let name = format!(
            "{}-{}",
            self.thread_prefix,
            CALL_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        thread::Builder::new().name(name.clone()).spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
            // The receiver is gone once the caller gave up.
            let _ = tx.send(result);
        })?;

        match rx.recv_timeout(deadline) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TimeoutError::Panicked { message }),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    thread = %name,
                    budget_secs = deadline.as_secs_f64(),
                    "call exceeded its deadline; abandoning thread"
                );
                Err(TimeoutError::TimedOut { budget: deadline })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TimeoutError::Panicked {
                message: "worker thread exited without a result".to_string(),
            }),
        }
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn returns_value_within_deadline() {
        let exec = TimeoutExecutor::default();
        let value = exec.run(Duration::from_secs(5), || 21 * 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn slow_call_times_out_near_deadline() {
        let exec = TimeoutExecutor::default();
        let started = Instant::now();
        let err = exec
            .run(Duration::from_millis(100), || {
                thread::sleep(Duration::from_secs(5));
            })
            .unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(
            err,
            TimeoutError::TimedOut { budget } if budget == Duration::from_millis(100)
        ));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    }

    #[test]
    fn abandoned_call_does_not_affect_next() {
        let exec = TimeoutExecutor::default();
        let _ = exec.run(Duration::from_millis(20), || thread::sleep(Duration::from_secs(2)));
        let value = exec.run(Duration::from_secs(5), || "fresh").unwrap();
        assert_eq!(value, "fresh");
    }

    #[test]
    fn panic_is_reported() {
        let exec = TimeoutExecutor::default();
        let err = exec
            .run(Duration::from_secs(5), || -> u32 { panic!("backend exploded") })
            .unwrap_err();
        match err {
            TimeoutError::Panicked { message } => assert!(message.contains("backend exploded")),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn threads_are_named() {
        let exec = TimeoutExecutor::new("probe");
        let name = exec
            .run(Duration::from_secs(5), || {
                thread::current().name().map(str::to_string)
            })
            .unwrap()
            .unwrap();
        assert!(name.starts_with("probe-"), "{name}");
    }
}
