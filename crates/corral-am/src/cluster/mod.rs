mod standalone;

pub use standalone::{FinishedAm, RegisteredAm, StandaloneCluster};

use std::fmt;

use crate::appmaster::EventSink;
use crate::error::AmResult;
use crate::id::ContainerId;

/// Exit status the resource manager reports for a container that
/// terminated because of our own release request rather than a process
/// failure.
pub const ABORTED_EXIT_STATUS: i32 = -100;

/// Identity of the node-manager endpoint responsible for a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The resource capability of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub memory_mb: u32,
}

/// A resource reservation the resource manager granted to us.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: ContainerId,
    pub node: NodeId,
    pub resource: Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Complete,
}

/// Status of a container as reported by the resource manager.
/// Completion callbacks carry terminal states; a non-terminal state in
/// one is logged and treated as terminal anyway.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub state: ContainerState,
    pub exit_status: i32,
    pub diagnostics: String,
}

impl ContainerStatus {
    /// A clean completion caused by our own release request.
    pub fn is_aborted(&self) -> bool {
        self.exit_status == ABORTED_EXIT_STATUS
    }
}

/// Health report for a cluster node, forwarded by the resource manager.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node: NodeId,
    pub healthy: bool,
    pub diagnostics: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// The largest container the resource manager will grant;
    /// requests beyond it must be clamped.
    pub maximum_capability: Resource,
}

/// The final status reported to the resource manager at unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Succeeded => write!(f, "SUCCEEDED"),
            FinalStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Everything a node manager needs to start a process in a container.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
}

impl LaunchContext {
    /// The effective launch command, joined by spaces, as published in
    /// the cluster description.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Client adapter for the resource manager. The wire protocol is not
/// modeled here; implementations hold whatever transport they need and
/// forward asynchronous callbacks through the [EventSink] handed over
/// at registration.
#[tonic::async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// Register the application master. Callbacks (allocations,
    /// completions, node reports, shutdown requests, errors) are
    /// delivered through `sink` from this point on. Must be called
    /// before any container request.
    async fn register(
        &self,
        sink: EventSink,
        host: &str,
        port: u16,
        tracking_url: &str,
    ) -> AmResult<Registration>;

    /// Ask for `count` more containers. Non-blocking; grants arrive as
    /// callbacks, in arrival order.
    async fn request_containers(
        &self,
        resource: Resource,
        host_hints: &[String],
        rack_hints: &[String],
        priority: i32,
        count: usize,
    ) -> AmResult<()>;

    /// Hand an unwanted container back. The container later completes
    /// with the ABORTED exit status.
    async fn release_container(&self, id: &ContainerId) -> AmResult<()>;

    /// Liveness ping carrying the current progress (0 to 100).
    async fn heartbeat(&self, progress: f32) -> AmResult<()>;

    /// Final deregistration. Blocking; may fail with a transport error.
    async fn unregister(&self, status: FinalStatus, diagnostics: &str) -> AmResult<()>;
}

/// Client adapter for node managers. All operations are non-blocking;
/// outcomes arrive as callbacks through the [EventSink] given to
/// [NodeManager::bind].
#[tonic::async_trait]
pub trait NodeManager: Send + Sync + 'static {
    async fn bind(&self, sink: EventSink);

    /// Submit a process launch inside an allocated container.
    async fn start_container(&self, container: &Container, context: LaunchContext)
        -> AmResult<()>;

    async fn stop_container(&self, id: &ContainerId, node: &NodeId) -> AmResult<()>;

    /// Query the container status; the answer arrives as a callback.
    async fn container_status(&self, id: &ContainerId, node: &NodeId) -> AmResult<()>;
}
