use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative, process-wide shutdown flag.
///
/// Clones share one flag. Accept loops poll it between bounded waits;
/// connections already accepted are left to finish.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger the flag when the process receives Ctrl+C
    pub fn trigger_on_ctrl_c(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    shutdown.trigger();
                }
                Err(e) => tracing::warn!("Failed to listen for shutdown signal: {}", e),
            }
        });
    }
}
