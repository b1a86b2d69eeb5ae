//! # Startup Gate
//!
//! Driver matching must not start before the host platform has finished
//! starting. The platform side holds a [`PlatformStarter`] and flips it once;
//! the engine holds a [`PlatformStatus`] and its first worker task blocks on
//! it. While that task waits, nothing else on the worker runs.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;

/// Creates a linked starter/status pair in the "not started" state.
pub fn platform_status() -> (PlatformStarter, PlatformStatus) {
    let (tx, rx) = watch::channel(false);
    (PlatformStarter { tx }, PlatformStatus { rx })
}

/// The platform's side: signals that startup has completed.
#[derive(Debug)]
pub struct PlatformStarter {
    tx: watch::Sender<bool>,
}

impl PlatformStarter {
    pub fn started(&self) {
        debug!("platform has started");
        self.tx.send_replace(true);
    }
}

/// The engine's side: observes whether the platform is running.
#[derive(Debug, Clone)]
pub struct PlatformStatus {
    rx: watch::Receiver<bool>,
}

impl PlatformStatus {
    /// A status that reports the platform as already running.
    pub fn running() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_running(&self) -> bool {
        *self.rx.borrow()
    }

    /// Blocks until the platform has started.
    ///
    /// Returns `Ok(true)` if it was already running, `Ok(false)` if this call
    /// had to wait for it.
    pub async fn wait_started(&mut self, token: &CancellationToken) -> Result<bool, EngineError> {
        let mut waited = false;
        loop {
            let started = *self.rx.borrow_and_update();
            if started {
                if !waited {
                    debug!("starting device manager immediately");
                }
                return Ok(!waited);
            }
            if !waited {
                debug!("waiting for platform to start");
                waited = true;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(EngineError::Shutdown),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped; a final `true` may still be pending.
                        if *self.rx.borrow() {
                            return Ok(false);
                        }
                        return Err(EngineError::PlatformGone);
                    }
                }
            }
        }
    }
}
