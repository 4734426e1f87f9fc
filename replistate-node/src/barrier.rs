use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Gate that holds public registry operations until the node is wired.
///
/// Waiters park on a watch channel; opening the barrier wakes all of them
/// at once. Opening is permanent.
#[derive(Clone)]
pub struct InitBarrier {
    ready: Arc<watch::Sender<bool>>,
}

impl Default for InitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl InitBarrier {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready: Arc::new(ready),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.ready.borrow()
    }

    /// Release every current and future waiter
    pub fn open(&self) {
        if !self.ready.send_replace(true) {
            info!("✓ Initialization complete, registry open");
        }
    }

    /// Wait until the barrier is open
    pub async fn wait(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = ready.wait_for(|open| *open).await;
    }
}
