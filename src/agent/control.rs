//! Stop and pause signals for a running loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Handle for controlling one loop from outside.
///
/// Stop cancels for good. Pause closes a gate the loop only looks at between
/// steps, so an in-flight step always runs to the end.
#[derive(Debug, Clone)]
pub struct LoopControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`LoopControl::stop`] has been called.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open. Returns `false` if stopped meanwhile.
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}
