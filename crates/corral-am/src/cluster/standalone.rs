use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info};
use parking_lot::Mutex;
use rand::distr::Uniform;
use rand::Rng;
use tokio::sync::watch;

use crate::appmaster::{AmEvent, EventSink, ShutdownReason};
use crate::cluster::{
    Container, ContainerState, ContainerStatus, FinalStatus, LaunchContext, NodeId, NodeManager,
    NodeReport, Registration, Resource, ResourceManager, ABORTED_EXIT_STATUS,
};
use crate::error::{AmError, AmResult};
use crate::id::{ContainerId, IdGenerator};

const NODE_COUNT: u64 = 4;
const NODE_PORT: u16 = 8041;

/// An in-process resource manager and node manager pair backed by one
/// simulated cluster. This is what `--xTest` runs the application
/// master against, and what the integration suite uses to drive
/// allocations, completions and failures deterministically.
///
/// The handle doubles as the test surface: it can over-grant requests,
/// complete any container with a chosen exit status, and expose what
/// the application master asked for.
#[derive(Clone)]
pub struct StandaloneCluster {
    inner: Arc<Inner>,
}

/// Where a registered application master can be reached.
#[derive(Debug, Clone)]
pub struct RegisteredAm {
    pub host: String,
    pub port: u16,
}

/// The final report of an unregistered application master.
#[derive(Debug, Clone)]
pub struct FinishedAm {
    pub status: FinalStatus,
    pub diagnostics: String,
}

struct Inner {
    /// Synthetic application id used in minted container identities.
    name: String,
    state: Mutex<State>,
    registered: watch::Sender<Option<RegisteredAm>>,
    finished: watch::Sender<Option<FinishedAm>>,
}

struct State {
    rm_sink: Option<EventSink>,
    nm_sink: Option<EventSink>,
    ids: IdGenerator,
    maximum_capability: Resource,
    /// One-shot surplus added to the next grant.
    extra_grants: usize,
    total_granted: usize,
    /// Granted containers that have not completed, in grant order.
    live: IndexMap<ContainerId, NodeId>,
    started: Vec<ContainerId>,
    released: Vec<ContainerId>,
    unregistered: bool,
    requests_after_unregister: usize,
    last_progress: f32,
}

impl StandaloneCluster {
    pub fn new(maximum_capability_mb: u32) -> Self {
        let (registered, _) = watch::channel(None);
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                name: generate_name(),
                state: Mutex::new(State {
                    rm_sink: None,
                    nm_sink: None,
                    ids: IdGenerator::new(),
                    maximum_capability: Resource {
                        memory_mb: maximum_capability_mb,
                    },
                    extra_grants: 0,
                    total_granted: 0,
                    live: IndexMap::new(),
                    started: vec![],
                    released: vec![],
                    unregistered: false,
                    requests_after_unregister: 0,
                    last_progress: 0.0,
                }),
                registered,
                finished,
            }),
        }
    }

    pub fn resource_manager(&self) -> Arc<dyn ResourceManager> {
        Arc::new(StandaloneResourceManager {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn node_manager(&self) -> Arc<dyn NodeManager> {
        Arc::new(StandaloneNodeManager {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Makes the next container request over-granted by `count`.
    pub fn grant_extra(&self, count: usize) {
        self.inner.state.lock().extra_grants = count;
    }

    /// Waits until the application master has registered and returns
    /// its control endpoint.
    pub async fn registered_address(&self) -> RegisteredAm {
        let mut receiver = self.inner.registered.subscribe();
        let value = receiver
            .wait_for(|x| x.is_some())
            .await
            .expect("the standalone cluster is never dropped while waited on");
        value
            .clone()
            .expect("the watch value is checked to be present")
    }

    /// Waits until the application master has unregistered.
    pub async fn finished(&self) -> FinishedAm {
        let mut receiver = self.inner.finished.subscribe();
        let value = receiver
            .wait_for(|x| x.is_some())
            .await
            .expect("the standalone cluster is never dropped while waited on");
        value
            .clone()
            .expect("the watch value is checked to be present")
    }

    /// Completes a container with the given exit status, as if its
    /// process terminated on the node.
    pub async fn complete_container(&self, id: &ContainerId, exit_status: i32, diagnostics: &str) {
        let sink = {
            let mut state = self.inner.state.lock();
            state.live.shift_remove(id);
            state.started.retain(|x| x != id);
            state.rm_sink.clone()
        };
        if let Some(sink) = sink {
            sink.post(AmEvent::ContainersCompleted {
                statuses: vec![ContainerStatus {
                    id: id.clone(),
                    state: ContainerState::Complete,
                    exit_status,
                    diagnostics: diagnostics.to_string(),
                }],
            })
            .await;
        }
    }

    /// Granted containers that have not completed, in grant order.
    pub fn live_containers(&self) -> Vec<ContainerId> {
        self.inner.state.lock().live.keys().cloned().collect()
    }

    /// The node a live container was granted on.
    pub fn container_node(&self, id: &ContainerId) -> Option<NodeId> {
        self.inner.state.lock().live.get(id).cloned()
    }

    /// Asks the application master to shut down, as the resource
    /// manager would when decommissioning the application.
    pub async fn request_shutdown(&self) {
        let sink = self.inner.state.lock().rm_sink.clone();
        if let Some(sink) = sink {
            sink.post(AmEvent::Shutdown {
                reason: ShutdownReason::ResourceManager,
            })
            .await;
        }
    }

    /// Delivers a node health report, as the resource manager would on
    /// a node state change.
    pub async fn report_node_health(&self, node: NodeId, healthy: bool, diagnostics: &str) {
        let sink = self.inner.state.lock().rm_sink.clone();
        if let Some(sink) = sink {
            sink.post(AmEvent::NodesUpdated {
                reports: vec![NodeReport {
                    node,
                    healthy,
                    diagnostics: diagnostics.to_string(),
                }],
            })
            .await;
        }
    }

    /// Containers whose process launch was submitted, in order.
    pub fn started_containers(&self) -> Vec<ContainerId> {
        self.inner.state.lock().started.clone()
    }

    /// Containers the application master released, in order.
    pub fn released_containers(&self) -> Vec<ContainerId> {
        self.inner.state.lock().released.clone()
    }

    pub fn total_granted(&self) -> usize {
        self.inner.state.lock().total_granted
    }

    /// Container requests observed after unregistration; anything
    /// nonzero is an application-master bug.
    pub fn requests_after_unregister(&self) -> usize {
        self.inner.state.lock().requests_after_unregister
    }

    pub fn last_progress(&self) -> f32 {
        self.inner.state.lock().last_progress
    }
}

struct StandaloneResourceManager {
    inner: Arc<Inner>,
}

#[tonic::async_trait]
impl ResourceManager for StandaloneResourceManager {
    async fn register(
        &self,
        sink: EventSink,
        host: &str,
        port: u16,
        _tracking_url: &str,
    ) -> AmResult<Registration> {
        let maximum_capability = {
            let mut state = self.inner.state.lock();
            state.rm_sink = Some(sink);
            state.maximum_capability
        };
        info!("application master registered at {host}:{port}");
        self.inner.registered.send_replace(Some(RegisteredAm {
            host: host.to_string(),
            port,
        }));
        Ok(Registration {
            maximum_capability,
        })
    }

    async fn request_containers(
        &self,
        resource: Resource,
        _host_hints: &[String],
        _rack_hints: &[String],
        _priority: i32,
        count: usize,
    ) -> AmResult<()> {
        let (sink, containers) = {
            let mut state = self.inner.state.lock();
            if state.unregistered {
                state.requests_after_unregister += 1;
            }
            let grant = count + std::mem::take(&mut state.extra_grants);
            let mut containers = Vec::with_capacity(grant);
            for _ in 0..grant {
                let sequence = state.ids.next()?;
                let id = ContainerId::new(format!(
                    "container_{}_{sequence:06}",
                    self.inner.name
                ));
                let node = NodeId {
                    host: format!("node{}.corral.local", sequence % NODE_COUNT + 1),
                    port: NODE_PORT,
                };
                state.live.insert(id.clone(), node.clone());
                containers.push(Container { id, node, resource });
            }
            state.total_granted += grant;
            (state.rm_sink.clone(), containers)
        };
        let sink = sink.ok_or_else(|| {
            AmError::InternalState("containers requested before registration".to_string())
        })?;
        debug!("granting {} containers", containers.len());
        sink.post(AmEvent::ContainersAllocated { containers }).await;
        Ok(())
    }

    async fn release_container(&self, id: &ContainerId) -> AmResult<()> {
        let sink = {
            let mut state = self.inner.state.lock();
            state.live.shift_remove(id);
            state.started.retain(|x| x != id);
            state.released.push(id.clone());
            state.rm_sink.clone()
        };
        let sink = sink.ok_or_else(|| {
            AmError::InternalState("container released before registration".to_string())
        })?;
        sink.post(AmEvent::ContainersCompleted {
            statuses: vec![ContainerStatus {
                id: id.clone(),
                state: ContainerState::Complete,
                exit_status: ABORTED_EXIT_STATUS,
                diagnostics: "Container released by the application master".to_string(),
            }],
        })
        .await;
        Ok(())
    }

    async fn heartbeat(&self, progress: f32) -> AmResult<()> {
        self.inner.state.lock().last_progress = progress;
        Ok(())
    }

    async fn unregister(&self, status: FinalStatus, diagnostics: &str) -> AmResult<()> {
        self.inner.state.lock().unregistered = true;
        info!("application master unregistered: {status} ({diagnostics})");
        self.inner.finished.send_replace(Some(FinishedAm {
            status,
            diagnostics: diagnostics.to_string(),
        }));
        Ok(())
    }
}

struct StandaloneNodeManager {
    inner: Arc<Inner>,
}

#[tonic::async_trait]
impl NodeManager for StandaloneNodeManager {
    async fn bind(&self, sink: EventSink) {
        self.inner.state.lock().nm_sink = Some(sink);
    }

    async fn start_container(
        &self,
        container: &Container,
        context: LaunchContext,
    ) -> AmResult<()> {
        let sink = {
            let mut state = self.inner.state.lock();
            if !state.live.contains_key(&container.id) {
                return Err(AmError::ContainerStart {
                    id: container.id.to_string(),
                    reason: "unknown container".to_string(),
                });
            }
            state.started.push(container.id.clone());
            state.nm_sink.clone()
        };
        let sink = sink.ok_or_else(|| AmError::ContainerStart {
            id: container.id.to_string(),
            reason: "node manager is not bound".to_string(),
        })?;
        debug!(
            "starting container {} with command {:?}",
            container.id,
            context.command_line()
        );
        sink.post(AmEvent::ContainerStarted {
            id: container.id.clone(),
        })
        .await;
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, _node: &NodeId) -> AmResult<()> {
        let (nm_sink, rm_sink) = {
            let mut state = self.inner.state.lock();
            state.live.shift_remove(id);
            state.started.retain(|x| x != id);
            (state.nm_sink.clone(), state.rm_sink.clone())
        };
        if let Some(sink) = nm_sink {
            sink.post(AmEvent::ContainerStopped { id: id.clone() }).await;
        }
        if let Some(sink) = rm_sink {
            sink.post(AmEvent::ContainersCompleted {
                statuses: vec![ContainerStatus {
                    id: id.clone(),
                    state: ContainerState::Complete,
                    exit_status: 0,
                    diagnostics: "Container stopped by the application master".to_string(),
                }],
            })
            .await;
        }
        Ok(())
    }

    async fn container_status(&self, id: &ContainerId, _node: &NodeId) -> AmResult<()> {
        let (sink, running) = {
            let state = self.inner.state.lock();
            (state.nm_sink.clone(), state.started.contains(id))
        };
        let sink = sink.ok_or_else(|| {
            AmError::InternalState("node manager is not bound".to_string())
        })?;
        sink.post(AmEvent::ContainerStatusReceived {
            id: id.clone(),
            state: if running {
                ContainerState::Running
            } else {
                ContainerState::Complete
            },
        })
        .await;
        Ok(())
    }
}

fn generate_name() -> String {
    rand::rng()
        .sample_iter(Uniform::new(0, 36).unwrap())
        .take(10)
        .map(|i| if i < 10 { b'0' + i } else { b'a' + i - 10 })
        .map(char::from)
        .collect()
}
