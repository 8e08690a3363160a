//! Supervisory backstop above the manager's own backoff.

use std::time::Duration;

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{manager::EndpointSessionManager, reconnect::ConnectionStatus};

/// Supervisor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Polling interval.
    pub interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Periodically reconnects a manager that is not connected.
///
/// This is the only caller of `connect` it drives; explicit callers must
/// stop the supervisor before connecting or disconnecting by hand.
pub struct Supervisor {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Start polling `manager`.
    #[must_use]
    pub fn spawn(manager: EndpointSessionManager, config: SupervisorConfig) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.status() == ConnectionStatus::Connected {
                            continue;
                        }
                        tracing::debug!(address = %manager.address(), "Supervisor reconnecting");
                        if let Err(e) = manager.connect().await {
                            tracing::warn!(
                                address = %manager.address(),
                                "Supervisor connect failed: {e}"
                            );
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
