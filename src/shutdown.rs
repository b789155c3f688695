//! Cooperative cancellation
//!
//! A cloneable shutdown flag that every blocking wait in the crate checks.
//! Waits go through `wait_timeout` so a cancel wakes sleepers immediately
//! instead of at the end of their delay.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown and wake every waiter
    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Sleep for `timeout` unless cancelled first
    ///
    /// Returns `true` if the signal was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.inner.cancelled.load(Ordering::SeqCst) {
            if self.inner.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return self.inner.cancelled.load(Ordering::SeqCst);
            }
        }
        true
    }
}

/// Cancel `signal` when `input` yields a line reading `q` or reaches EOF
pub fn cancel_on_input<R>(input: R, signal: ShutdownSignal) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("stdin-watcher".to_string())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        info!("Quit requested");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Input closed: {}", e);
                        break;
                    }
                }
            }
            signal.cancel();
        })
}
