use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

/// Process-wide running flag plus a broadcast wake.
///
/// Nothing is ever sent on the shutdown channel. Requesting shutdown drops the
/// only sender, which disconnects the channel and wakes every thread blocked
/// on (or later selecting on) [`Lifecycle::signal`].
#[derive(Debug)]
pub struct Lifecycle {
    running: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            running: AtomicBool::new(true),
            trigger: Mutex::new(Some(tx)),
            signal: rx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn request_shutdown(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut trigger = self.trigger.lock().unwrap_or_else(|e| e.into_inner());
        drop(trigger.take());
        true
    }

    /// Disconnects once shutdown is requested; meant for `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleeps for `timeout` unless shutdown is requested first. Returns true on shutdown.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.signal.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => !self.is_running(),
        }
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        // the sender is never used, so this only returns on disconnect
        let _ = self.signal.recv();
    }

    /// Routes SIGINT/SIGTERM to [`Lifecycle::request_shutdown`]. Can only be installed once per process.
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<()> {
        let lifecycle = Arc::clone(self);
        ctrlc::set_handler(move || {
            if lifecycle.request_shutdown() {
                log::info!("received shutdown signal");
            }
        })
        .context("installing signal handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn shutdown_flips_once() {
        let lc = Lifecycle::new();
        assert!(lc.is_running());
        assert!(lc.request_shutdown());
        assert!(!lc.is_running());
        assert!(!lc.request_shutdown());
    }

    #[test]
    fn wait_timeout_elapses_while_running() {
        let lc = Lifecycle::new();
        let t0 = Instant::now();
        assert!(!lc.wait_timeout(Duration::from_millis(50)));
        assert!(t0.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn shutdown_wakes_every_waiter() {
        let lc = Arc::new(Lifecycle::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let lc = Arc::clone(&lc);
                thread::spawn(move || {
                    let t0 = Instant::now();
                    let woke = lc.wait_timeout(Duration::from_secs(10));
                    (woke, t0.elapsed())
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        lc.request_shutdown();

        for w in waiters {
            let (woke, elapsed) = w.join().unwrap();
            assert!(woke);
            assert!(elapsed < Duration::from_secs(5));
        }
    }

    #[test]
    fn wait_blocks_until_shutdown() {
        let lc = Arc::new(Lifecycle::new());
        let waiter = {
            let lc = Arc::clone(&lc);
            thread::spawn(move || {
                let t0 = Instant::now();
                lc.wait();
                t0.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        lc.request_shutdown();
        let elapsed = waiter.join().unwrap();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(5));
        // already shut down: returns at once
        lc.wait();
    }

    #[test]
    fn wait_after_shutdown_returns_immediately() {
        let lc = Lifecycle::new();
        lc.request_shutdown();
        assert!(lc.wait_timeout(Duration::from_secs(10)));
    }
}
