use std::future::Future;
use std::time::Duration;

use corral_server::RetryStrategy;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{AmError, AmResult};

/// Tracks the control server task from launch to shutdown. A launch is
/// pending until the listener reports its bound port; from then on the
/// monitor holds the shutdown signal and the ephemeral port.
pub struct ServerMonitor {
    state: ServerState,
}

enum ServerState {
    Stopped,
    Pending {
        handle: JoinHandle<AmResult<()>>,
    },
    Running {
        /// Fires the graceful shutdown of the server.
        signal: oneshot::Sender<()>,
        handle: JoinHandle<AmResult<()>>,
        port: u16,
    },
}

impl Default for ServerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self {
            state: ServerState::Stopped,
        }
    }

    /// Spawns the server task, replacing whatever ran before.
    pub async fn launch(&mut self, f: impl Future<Output = AmResult<()>> + Send + 'static) {
        self.shutdown().await;
        self.state = ServerState::Pending {
            handle: tokio::spawn(f),
        };
    }

    /// Records the bound port and the shutdown signal once the
    /// listener is up.
    pub fn ready(&mut self, signal: oneshot::Sender<()>, port: u16) -> AmResult<()> {
        match std::mem::replace(&mut self.state, ServerState::Stopped) {
            ServerState::Pending { handle } => {
                self.state = ServerState::Running {
                    signal,
                    handle,
                    port,
                };
                Ok(())
            }
            other => {
                self.state = other;
                Err(AmError::InternalState(
                    "the control server reported ready without a pending launch".to_string(),
                ))
            }
        }
    }

    /// Signals the server and waits for its task to finish. A launch
    /// that never became ready is aborted instead. Idempotent.
    pub async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.state, ServerState::Stopped) {
            ServerState::Stopped => {}
            ServerState::Pending { handle } => {
                handle.abort();
            }
            ServerState::Running {
                signal,
                handle,
                port: _,
            } => {
                let _ = signal.send(());
                let _ = handle.await;
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.state {
            ServerState::Running { port, .. } => Some(*port),
            _ => None,
        }
    }
}

/// Where and how a control client connects.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Retries for establishing the connection; the endpoint may still
    /// be binding when the client is created.
    pub connect_retry: RetryStrategy,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_retry: RetryStrategy::Fixed {
                max_count: 3,
                delay: Duration::from_secs(1),
            },
        }
    }

    pub fn to_url_string(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_rejects_ready_without_launch() {
        let mut monitor = ServerMonitor::new();
        let (signal, _rx) = oneshot::channel();
        assert!(monitor.ready(signal, 4000).is_err());
        assert_eq!(monitor.port(), None);
    }

    #[tokio::test]
    async fn test_monitor_tracks_the_server_task() {
        let mut monitor = ServerMonitor::new();
        let (signal_tx, signal_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        monitor
            .launch(async move {
                let _ = signal_rx.await;
                let _ = finished_tx.send(());
                Ok(())
            })
            .await;
        assert_eq!(monitor.port(), None);

        monitor.ready(signal_tx, 4000).expect("pending launch");
        assert_eq!(monitor.port(), Some(4000));

        // Shutdown fires the signal and waits for the task to finish.
        monitor.shutdown().await;
        assert!(finished_rx.await.is_ok());
        assert_eq!(monitor.port(), None);
    }
}
