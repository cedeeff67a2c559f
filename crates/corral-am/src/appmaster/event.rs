use std::fmt;

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::cluster::{Container, ContainerState, ContainerStatus, NodeReport, Registration};
use crate::error::AmResult;
use crate::id::ContainerId;

/// Everything that can happen to the application master. The four event
/// sources (resource-manager callbacks, node-manager callbacks, the
/// supervised child, and control RPC clients) all funnel into this one
/// type and are consumed sequentially by the reconciliation engine.
pub enum AmEvent {
    /// The control RPC server is listening.
    ServerReady {
        port: u16,
        signal: oneshot::Sender<()>,
    },
    /// Registration with the resource manager succeeded.
    RmRegistered { registration: Registration },
    /// The resource manager granted containers.
    ContainersAllocated { containers: Vec<Container> },
    /// Containers reached a terminal state.
    ContainersCompleted { statuses: Vec<ContainerStatus> },
    /// Node health reports from the resource manager.
    NodesUpdated { reports: Vec<NodeReport> },
    /// A node manager started the process in a container.
    ContainerStarted { id: ContainerId },
    /// A node manager stopped a container on our request.
    ContainerStopped { id: ContainerId },
    ContainerStartFailed { id: ContainerId, reason: String },
    ContainerStopFailed { id: ContainerId, reason: String },
    ContainerStatusReceived {
        id: ContainerId,
        state: ContainerState,
    },
    /// The supervised master process is up.
    MasterStarted,
    /// The supervised master process terminated. Exactly once per spawn.
    MasterExited { code: i32 },
    /// Fixed-interval self-message driving the resource-manager
    /// heartbeat.
    Heartbeat,
    /// Control RPC: snapshot the cluster description as JSON.
    GetClusterStatus {
        result: oneshot::Sender<AmResult<String>>,
    },
    /// Control RPC: raise the desired worker count.
    AddWorkers {
        count: usize,
        result: oneshot::Sender<usize>,
    },
    /// Control RPC: lower the desired worker count.
    RemoveWorkers {
        count: usize,
        result: oneshot::Sender<usize>,
    },
    /// Begin the shutdown sequence. Idempotent: later signals find the
    /// mailbox already closed and collapse into the first one.
    Shutdown { reason: ShutdownReason },
}

#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// A control client called `stopCluster`.
    ClientRequest,
    /// The resource manager asked us to shut down.
    ResourceManager,
    /// A system-wide error surfaced from an adapter.
    Error { message: String },
    /// The supervised master process exited.
    MasterExited { code: i32 },
    /// The master process could not be launched.
    MasterLaunchFailed { message: String },
    /// All desired workers completed (masterless mode only).
    WorkersCompleted,
    /// Too many containers failed.
    FailureLimit { failed: usize },
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::ClientRequest => write!(f, "stop requested by a control client"),
            ShutdownReason::ResourceManager => {
                write!(f, "shutdown requested by the resource manager")
            }
            ShutdownReason::Error { message } => write!(f, "unrecoverable error: {message}"),
            ShutdownReason::MasterExited { code } => {
                write!(f, "master process exited with code {code}")
            }
            ShutdownReason::MasterLaunchFailed { message } => {
                write!(f, "master process could not be launched: {message}")
            }
            ShutdownReason::WorkersCompleted => write!(f, "all workers completed"),
            ShutdownReason::FailureLimit { failed } => {
                write!(f, "{failed} containers failed, giving up on the cluster")
            }
        }
    }
}

/// The channel adapters use to forward their callbacks into the engine's
/// event queue. Handing this out instead of a reference to the engine
/// keeps the ownership graph acyclic: the engine owns the adapters, the
/// adapters own only a sender.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::Sender<AmEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::Sender<AmEvent>) -> Self {
        Self { sender }
    }

    /// Posting to a stopped engine is not an error: shutdown always
    /// races with in-flight callbacks.
    pub async fn post(&self, event: AmEvent) {
        if self.sender.send(event).await.is_err() {
            debug!("the application master has stopped; dropping event");
        }
    }
}
