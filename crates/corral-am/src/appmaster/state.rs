use std::collections::HashSet;

use indexmap::IndexMap;
use log::warn;

use crate::appmaster::options::AmOptions;
use crate::cluster::{Container, ContainerStatus, Registration, Resource};
use crate::description::{
    now_millis, ClusterDescription, ClusterNode, ClusterPhase, NodeState, ROLE_MASTER, ROLE_WORKER,
};
use crate::error::AmResult;
use crate::id::ContainerId;
use crate::supervisor::ChildSupervisor;

/// How a terminal container status was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// An ABORTED completion caused by our own release request.
    Released,
    /// The process exited cleanly.
    Clean,
    /// The process exited with a nonzero code.
    Failed,
}

/// The reconciliation engine's working state: the live request and
/// allocation quantities, the monotone completion counters, and the
/// cluster description document published to control clients. Only the
/// engine touches this, one event at a time, so the consistency of the
/// document is guaranteed by the mailbox order.
pub struct AmState {
    description: ClusterDescription,
    desired_workers: usize,
    /// Containers asked of the resource manager: outstanding plus
    /// allocated-and-live.
    requested: usize,
    /// Currently assigned containers, in grant order.
    allocated: IndexMap<ContainerId, Container>,
    /// Containers handed back, awaiting their ABORTED completion.
    releasing: HashSet<ContainerId>,
    /// Terminal containers since start, releases included.
    completed: usize,
    /// Nonzero-exit completions plus container start failures.
    failed: usize,
    /// ABORTED completions we caused.
    released: usize,
    registration: Option<Registration>,
    worker_resource: Resource,
}

impl AmState {
    pub fn new(options: &AmOptions) -> Self {
        let mut description = ClusterDescription::new(&options.cluster_name);
        description.masters = options.masters as u32;
        description.workers = options.workers as u32;
        description.master_heap = options.master_heap_mb;
        description.worker_heap = options.worker_heap_mb;
        description.root_path = options.site.root_path.clone();
        description.zk_hosts = options.site.zk_hosts.clone();
        description.zk_port = options.site.zk_port;
        description.zk_path = options.site.zk_path.clone();
        description.client_properties = options.site.properties.clone();
        Self {
            description,
            desired_workers: options.workers,
            requested: 0,
            allocated: IndexMap::new(),
            releasing: HashSet::new(),
            completed: 0,
            failed: 0,
            released: 0,
            registration: None,
            worker_resource: options.worker_resource(),
        }
    }

    pub fn desired_workers(&self) -> usize {
        self.desired_workers
    }

    pub fn set_desired_workers(&mut self, desired: usize) {
        self.desired_workers = desired;
        self.description.workers = desired as u32;
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn add_requested(&mut self, count: usize) {
        self.requested += count;
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Number of live worker nodes in the published description.
    pub fn worker_count(&self) -> usize {
        self.description.worker_nodes.len()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn released(&self) -> usize {
        self.released
    }

    /// Worker completions that were not caused by a release.
    pub fn finished_workers(&self) -> usize {
        self.completed - self.released
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn worker_resource(&self) -> Resource {
        self.worker_resource
    }

    /// Records the registration and clamps container requests to the
    /// maximum capability the resource manager is willing to grant.
    pub fn note_registered(&mut self, registration: Registration) {
        let maximum = registration.maximum_capability.memory_mb;
        if self.worker_resource.memory_mb > maximum {
            warn!(
                "worker heap {} MB exceeds the maximum container capability; clamping to {maximum} MB",
                self.worker_resource.memory_mb
            );
            self.worker_resource = Resource { memory_mb: maximum };
        }
        self.registration = Some(registration);
        self.description.state = ClusterPhase::Live;
        self.description.start_time = now_millis();
    }

    pub fn add_master_node(&mut self, name: &str, host: &str, command: String) {
        let mut node = ClusterNode::new(name, ROLE_MASTER, host);
        node.state = NodeState::Submitted;
        node.command = command;
        self.description.master_nodes.push(node);
    }

    pub fn master_started(&mut self) {
        if let Some(node) = self.description.master_nodes.last_mut() {
            node.state = NodeState::Live;
        }
    }

    pub fn master_exited(&mut self, code: i32) {
        if let Some(node) = self.description.master_nodes.last_mut() {
            node.state = NodeState::Stopped;
            node.exit_code = Some(code);
        }
    }

    pub fn insert_allocated(&mut self, container: Container) {
        self.allocated.insert(container.id.clone(), container);
    }

    pub fn newest_allocated(&self) -> Option<ContainerId> {
        self.allocated.last().map(|(id, _)| id.clone())
    }

    /// Registers the REQUESTED node for a container handed to the
    /// launcher.
    pub fn add_requested_node(&mut self, container: &Container, command: String) {
        let mut node = ClusterNode::new(
            container.id.as_str(),
            ROLE_WORKER,
            container.node.host.clone(),
        );
        node.command = command;
        self.description.requested_nodes.push(node);
    }

    /// Promotes a launched container to a live worker. Returns false if
    /// the container is not tracked (e.g. its completion arrived first).
    pub fn note_started(&mut self, id: &ContainerId) -> bool {
        let Some(index) = self
            .description
            .requested_nodes
            .iter()
            .position(|node| node.name == id.as_str())
        else {
            return false;
        };
        let mut node = self.description.requested_nodes.remove(index);
        node.state = NodeState::Live;
        self.description.worker_nodes.push(node);
        true
    }

    /// Marks a container stopped on our request; the terminal completion
    /// still arrives from the resource manager later.
    pub fn note_stopped(&mut self, id: &ContainerId) {
        if let Some(node) = self
            .description
            .worker_nodes
            .iter_mut()
            .find(|node| node.name == id.as_str())
        {
            node.state = NodeState::Stopped;
        }
    }

    /// Accounts for handing a container back to the resource manager,
    /// whether it was surplus (never launched) or a live worker being
    /// scaled away. A surplus grant was never counted in `requested`,
    /// so only an allocated container gives an ask back.
    pub fn note_release(&mut self, id: &ContainerId) {
        if self.allocated.shift_remove(id).is_some() {
            self.requested = self.requested.saturating_sub(1);
        }
        self.releasing.insert(id.clone());
    }

    /// Folds a terminal container status into the counters and retires
    /// its node. All completions land in `completedNodes`; `failedNodes`
    /// is reserved for containers that never came up.
    pub fn note_completion(&mut self, status: &ContainerStatus) -> CompletionKind {
        self.completed += 1;
        if self.releasing.remove(&status.id) || status.is_aborted() {
            self.released += 1;
            self.retire_node(&status.id, status);
            return CompletionKind::Released;
        }
        if self.allocated.shift_remove(&status.id).is_some() {
            // A real worker is gone; this re-opens capacity.
            self.requested = self.requested.saturating_sub(1);
        }
        if status.exit_status != 0 {
            self.failed += 1;
            self.retire_node(&status.id, status);
            CompletionKind::Failed
        } else {
            self.retire_node(&status.id, status);
            CompletionKind::Clean
        }
    }

    /// A container whose process could not be started never joins the
    /// live set; its node is moved to `failedNodes`.
    pub fn note_start_failure(&mut self, id: &ContainerId, reason: &str) {
        self.failed += 1;
        let index = self
            .description
            .requested_nodes
            .iter()
            .position(|node| node.name == id.as_str());
        if let Some(index) = index {
            let mut node = self.description.requested_nodes.remove(index);
            node.state = NodeState::Destroyed;
            node.diagnostics = reason.to_string();
            self.description.failed_nodes.push(node);
        } else {
            warn!("container {id} failed to start but is not tracked");
        }
    }

    pub fn append_node_diagnostics(&mut self, id: &ContainerId, message: &str) {
        for nodes in [
            &mut self.description.worker_nodes,
            &mut self.description.requested_nodes,
        ] {
            if let Some(node) = nodes.iter_mut().find(|node| node.name == id.as_str()) {
                if !node.diagnostics.is_empty() {
                    node.diagnostics.push('\n');
                }
                node.diagnostics.push_str(message);
                return;
            }
        }
    }

    fn retire_node(&mut self, id: &ContainerId, status: &ContainerStatus) {
        let index = self
            .description
            .worker_nodes
            .iter()
            .position(|node| node.name == id.as_str())
            .map(|index| (true, index))
            .or_else(|| {
                self.description
                    .requested_nodes
                    .iter()
                    .position(|node| node.name == id.as_str())
                    .map(|index| (false, index))
            });
        let Some((live, index)) = index else {
            // Surplus containers are released before any node exists.
            return;
        };
        let mut node = if live {
            self.description.worker_nodes.remove(index)
        } else {
            self.description.requested_nodes.remove(index)
        };
        node.state = NodeState::Destroyed;
        node.exit_code = Some(status.exit_status);
        node.diagnostics = status.diagnostics.clone();
        self.description.completed_nodes.push(node);
    }

    pub fn set_phase(&mut self, phase: ClusterPhase) {
        self.description.state = phase;
    }

    /// Serializes a consistent snapshot, with `statusTime` refreshed and
    /// the master node reconciled with the supervised child.
    pub fn snapshot_json(&mut self, supervisor: &ChildSupervisor) -> AmResult<String> {
        self.description.touch();
        if let Some(node) = self.description.master_nodes.last_mut() {
            node.output = supervisor.recent_output();
            node.exit_code = supervisor.exit_code();
            if let Some(command) = supervisor.command_line() {
                node.command = command;
            }
        }
        self.description.to_json()
    }

    #[cfg(test)]
    pub fn description(&self) -> &ClusterDescription {
        &self.description
    }
}
