use std::sync::Arc;

use corral_server::actor::{ActorAction, ActorContext};
use corral_server::{RetryStrategy, Retryable};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::appmaster::actor::AppMasterActor;
use crate::appmaster::event::{AmEvent, ShutdownReason};
use crate::appmaster::launcher;
use crate::appmaster::state::CompletionKind;
use crate::cluster::{
    Container, ContainerState, ContainerStatus, NodeReport, Registration,
};
use crate::error::AmResult;
use crate::id::ContainerId;

impl AppMasterActor {
    pub(super) fn handle_server_ready(
        &mut self,
        ctx: &mut ActorContext<Self>,
        port: u16,
        signal: oneshot::Sender<()>,
    ) -> ActorAction {
        if let Err(e) = self.server.ready(signal, port) {
            error!("{e}");
            return self.initiate_shutdown(ShutdownReason::Error {
                message: e.to_string(),
            });
        }
        info!("control server is ready on port {port}");

        // Step two of the lifecycle: register with the resource manager,
        // announcing the hostname and the port just bound. Container
        // requests wait for the registration response.
        let rm = Arc::clone(&self.options.resource_manager);
        let sink = self.sink.clone();
        let host = self.options.environment.nm_host.clone();
        let strategy = RetryStrategy::from(&self.options.config.rpc.retry_strategy);
        ctx.spawn(async move {
            let register = || rm.register(sink.clone(), &host, port, "");
            match register
                .retry("resource manager registration", strategy)
                .await
            {
                Ok(registration) => {
                    sink.post(AmEvent::RmRegistered { registration }).await;
                }
                Err(e) => {
                    error!("failed to register with the resource manager: {e}");
                    sink.post(AmEvent::Shutdown {
                        reason: ShutdownReason::Error {
                            message: format!("registration failed: {e}"),
                        },
                    })
                    .await;
                }
            }
        });
        ActorAction::Continue
    }

    pub(super) fn handle_rm_registered(
        &mut self,
        ctx: &mut ActorContext<Self>,
        registration: Registration,
    ) -> ActorAction {
        info!(
            "registered with the resource manager; maximum container capability {} MB",
            registration.maximum_capability.memory_mb
        );
        self.state.note_registered(registration);

        if !self.options.no_master() {
            let context = launcher::master_launch_context(&self.options);
            self.state.add_master_node(
                &self.options.environment.container_id,
                &self.options.environment.nm_host,
                context.command_line(),
            );
            if let Err(e) =
                self.supervisor
                    .spawn(&context.command, &context.environment, self.sink.clone())
            {
                error!("failed to launch the master process: {e}");
                return self.initiate_shutdown(ShutdownReason::MasterLaunchFailed {
                    message: e.to_string(),
                });
            }
        } else if self.state.desired_workers() == 0 {
            // Nothing to supervise and nothing to run.
            return self.initiate_shutdown(ShutdownReason::WorkersCompleted);
        }

        let desired = self.state.desired_workers();
        self.request_workers(ctx, desired);
        ctx.send_with_delay(
            AmEvent::Heartbeat,
            self.options.config.am.heartbeat_interval(),
        );
        ActorAction::Continue
    }

    pub(super) fn handle_heartbeat(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        let progress = if self.supervisor.is_running() || self.options.no_master() {
            50.0
        } else {
            0.0
        };
        let rm = Arc::clone(&self.options.resource_manager);
        ctx.spawn(async move {
            if let Err(e) = rm.heartbeat(progress).await {
                warn!("resource manager heartbeat failed: {e}");
            }
        });
        ctx.send_with_delay(
            AmEvent::Heartbeat,
            self.options.config.am.heartbeat_interval(),
        );
        ActorAction::Continue
    }

    pub(super) fn handle_containers_allocated(
        &mut self,
        ctx: &mut ActorContext<Self>,
        containers: Vec<Container>,
    ) -> ActorAction {
        for container in containers {
            // The desired count is authoritative: anything past it goes
            // straight back, before a launch is attempted.
            if self.state.allocated_count() >= self.state.desired_workers() {
                info!("releasing surplus container {}", container.id);
                self.release_container(ctx, container.id);
                continue;
            }
            debug!("allocated container {} on {}", container.id, container.node);
            let context = launcher::worker_launch_context(&self.options);
            self.state.add_requested_node(&container, context.command_line());
            self.state.insert_allocated(container.clone());

            let nm = Arc::clone(&self.options.node_manager);
            let sink = self.sink.clone();
            ctx.spawn(async move {
                if let Err(e) = nm.start_container(&container, context).await {
                    sink.post(AmEvent::ContainerStartFailed {
                        id: container.id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                }
            });
        }
        ActorAction::Continue
    }

    pub(super) fn handle_containers_completed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        statuses: Vec<ContainerStatus>,
    ) -> ActorAction {
        for status in statuses {
            if status.state != ContainerState::Complete {
                warn!(
                    "container {} completion carries non-terminal state {:?}; treating it as terminal",
                    status.id, status.state
                );
            }
            match self.state.note_completion(&status) {
                CompletionKind::Released => {
                    debug!("container {} released", status.id);
                }
                CompletionKind::Clean => {
                    info!(
                        "container {} completed with exit code {}",
                        status.id, status.exit_status
                    );
                }
                CompletionKind::Failed => {
                    warn!(
                        "container {} failed with exit code {}: {}",
                        status.id, status.exit_status, status.diagnostics
                    );
                }
            }
        }
        self.reconcile(ctx)
    }

    pub(super) fn handle_container_started(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        id: ContainerId,
    ) -> ActorAction {
        if self.state.note_started(&id) {
            info!(
                "container {id} is live; {} workers running",
                self.state.worker_count()
            );
        } else {
            warn!("started container {id} is not tracked");
        }
        ActorAction::Continue
    }

    pub(super) fn handle_container_stopped(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        id: ContainerId,
    ) -> ActorAction {
        info!("container {id} stopped");
        self.state.note_stopped(&id);
        ActorAction::Continue
    }

    pub(super) fn handle_container_start_failed(
        &mut self,
        ctx: &mut ActorContext<Self>,
        id: ContainerId,
        reason: String,
    ) -> ActorAction {
        warn!("failed to start container {id}: {reason}");
        self.state.note_start_failure(&id, &reason);
        // Hand the container back; its ABORTED completion settles the
        // remaining bookkeeping.
        self.release_container(ctx, id);
        self.reconcile(ctx)
    }

    pub(super) fn handle_container_stop_failed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        id: ContainerId,
        reason: String,
    ) -> ActorAction {
        warn!("failed to stop container {id}: {reason}");
        self.state.append_node_diagnostics(&id, &reason);
        ActorAction::Continue
    }

    pub(super) fn handle_container_status_received(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        id: ContainerId,
        state: ContainerState,
    ) -> ActorAction {
        debug!("container {id} status: {state:?}");
        ActorAction::Continue
    }

    pub(super) fn handle_nodes_updated(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        reports: Vec<NodeReport>,
    ) -> ActorAction {
        for report in reports {
            if report.healthy {
                debug!("cluster node {} is healthy", report.node);
            } else {
                warn!(
                    "cluster node {} is unhealthy: {}",
                    report.node, report.diagnostics
                );
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_master_started(&mut self, _ctx: &mut ActorContext<Self>) -> ActorAction {
        info!("master process is running");
        self.state.master_started();
        ActorAction::Continue
    }

    pub(super) fn handle_master_exited(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        code: i32,
    ) -> ActorAction {
        self.state.master_exited(code);
        // The death of the child is a signal, not an error: the cluster
        // cannot serve without its master, whatever the exit code.
        self.initiate_shutdown(ShutdownReason::MasterExited { code })
    }

    pub(super) fn handle_get_cluster_status(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        result: oneshot::Sender<AmResult<String>>,
    ) -> ActorAction {
        let snapshot = self.state.snapshot_json(&self.supervisor);
        if result.send(snapshot).is_err() {
            debug!("cluster status requester went away");
        }
        ActorAction::Continue
    }

    pub(super) fn handle_add_workers(
        &mut self,
        ctx: &mut ActorContext<Self>,
        count: usize,
        result: oneshot::Sender<usize>,
    ) -> ActorAction {
        let desired = self.state.desired_workers() + count;
        self.state.set_desired_workers(desired);
        info!("scaling up: desired worker count is now {desired}");
        let _ = result.send(desired);
        if self.shutdown.is_none() {
            let ask = desired.saturating_sub(self.state.requested());
            self.request_workers(ctx, ask);
        }
        ActorAction::Continue
    }

    pub(super) fn handle_remove_workers(
        &mut self,
        ctx: &mut ActorContext<Self>,
        count: usize,
        result: oneshot::Sender<usize>,
    ) -> ActorAction {
        let desired = self.state.desired_workers().saturating_sub(count);
        self.state.set_desired_workers(desired);
        info!("scaling down: desired worker count is now {desired}");
        let _ = result.send(desired);
        // Newest grants go first; their ABORTED completions are counted
        // as releases, not failures.
        while self.state.allocated_count() > desired {
            let Some(id) = self.state.newest_allocated() else {
                break;
            };
            info!("releasing container {id} to scale down");
            self.release_container(ctx, id);
        }
        ActorAction::Continue
    }

    pub(super) fn initiate_shutdown(&mut self, reason: ShutdownReason) -> ActorAction {
        if self.shutdown.is_none() {
            info!("completion signal: {reason}");
            self.shutdown = Some(reason);
        }
        ActorAction::Stop
    }

    /// The refill rule, then the termination verdicts, in that order.
    fn reconcile(&mut self, ctx: &mut ActorContext<Self>) -> ActorAction {
        if self.shutdown.is_none() {
            let ask = self
                .state
                .desired_workers()
                .saturating_sub(self.state.requested());
            self.request_workers(ctx, ask);
        }
        let failed = self.state.failed();
        if failed >= self.options.config.am.max_container_failures {
            return self.initiate_shutdown(ShutdownReason::FailureLimit { failed });
        }
        if self.options.no_master()
            && self.state.finished_workers() >= self.state.desired_workers()
        {
            return self.initiate_shutdown(ShutdownReason::WorkersCompleted);
        }
        ActorAction::Continue
    }

    fn request_workers(&mut self, ctx: &mut ActorContext<Self>, count: usize) {
        if count == 0 {
            return;
        }
        self.state.add_requested(count);
        info!("requesting {count} worker containers");
        let rm = Arc::clone(&self.options.resource_manager);
        let resource = self.state.worker_resource();
        let priority = self.options.config.am.request_priority;
        let sink = self.sink.clone();
        ctx.spawn(async move {
            if let Err(e) = rm.request_containers(resource, &[], &[], priority, count).await {
                sink.post(AmEvent::Shutdown {
                    reason: ShutdownReason::Error {
                        message: format!("container request failed: {e}"),
                    },
                })
                .await;
            }
        });
    }

    fn release_container(&mut self, ctx: &mut ActorContext<Self>, id: ContainerId) {
        self.state.note_release(&id);
        let rm = Arc::clone(&self.options.resource_manager);
        ctx.spawn(async move {
            if let Err(e) = rm.release_container(&id).await {
                warn!("failed to release container {id}: {e}");
            }
        });
    }
}
