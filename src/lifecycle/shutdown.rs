//! Shutdown coordination for the tunnel server.

use crate::sync::Signal;

/// Coordinates stopping a tunnel server.
///
/// Built on the same cancellation signals the tunnel core waits on:
/// `serve` links the listener's graceful shutdown to this, the listener
/// drains, and every client connection then observes the stop through
/// its closing transport. Nothing is force-killed here.
pub struct Shutdown {
    stop: Signal,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            stop: Signal::new(),
        }
    }

    /// A derived handle that fires once shutdown is triggered, linkable
    /// with any other wait in the core.
    pub fn signal(&self) -> Signal {
        self.stop.child_token()
    }

    /// Begin shutting down. Idempotent.
    pub fn trigger(&self) {
        self.stop.cancel();
    }

    /// Trigger on Ctrl-C. Spawns a waiter task.
    pub fn on_ctrl_c(&self) {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                stop.cancel();
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_fires_derived_signals() {
        let shutdown = Shutdown::new();
        let before = shutdown.signal();
        shutdown.trigger();
        shutdown.trigger();

        assert!(before.is_cancelled());
        // Handles derived after the trigger fire immediately too.
        assert!(shutdown.signal().is_cancelled());
    }
}
