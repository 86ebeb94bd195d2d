//! Watchdog timer for runaway scripts
//!
//! A dedicated timer thread flips an atomic flag when an armed window
//! elapses. The interpreter's instruction hook - running on the scheduler
//! thread - reads the flag and raises the abort from inside script
//! execution. The timer thread never touches interpreter state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Error raised from the instruction hook when the watchdog fires.
pub const WATCHDOG_MESSAGE: &str = "script did not yield in time";

enum Ctl {
    Arm(Duration),
    Disarm,
    Stop,
}

/// One relative timer, armed immediately before each coroutine resume and
/// disarmed immediately after.
pub struct Watchdog {
    expired: Arc<AtomicBool>,
    ctl: Sender<Ctl>,
    worker: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn() -> Self {
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        let (ctl, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("perch-watchdog".into())
            .spawn(move || loop {
                // Idle until the next arm
                let mut window = match rx.recv() {
                    Ok(Ctl::Arm(duration)) => Some(duration),
                    Ok(Ctl::Disarm) => continue,
                    Ok(Ctl::Stop) | Err(_) => break,
                };
                while let Some(duration) = window.take() {
                    match rx.recv_timeout(duration) {
                        Ok(Ctl::Arm(next)) => window = Some(next),
                        Ok(Ctl::Disarm) => {}
                        Ok(Ctl::Stop) => return,
                        Err(RecvTimeoutError::Timeout) => {
                            flag.store(true, Ordering::SeqCst);
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .ok();
        if worker.is_none() {
            tracing::warn!("watchdog thread could not be spawned; timeouts disabled");
        }
        Self {
            expired,
            ctl,
            worker,
        }
    }

    /// Flag handle for the interpreter hook.
    #[must_use]
    pub fn expired_flag(&self) -> Arc<AtomicBool> {
        self.expired.clone()
    }

    /// Start a fresh window. Clears any stale expiry first.
    pub fn arm(&self, duration: Duration) {
        self.expired.store(false, Ordering::SeqCst);
        let _ = self.ctl.send(Ctl::Arm(duration));
    }

    /// Cancel the current window. A flag already raised stays raised until
    /// the next arm so an in-flight hook check still observes it.
    pub fn disarm(&self) {
        let _ = self.ctl.send(Ctl::Disarm);
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.ctl.send(Ctl::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
