use std::sync::Arc;

use corral_server::actor::{Actor, ActorAction, ActorContext};
use corral_server::{RetryStrategy, Retryable};
use log::{error, info};
use tokio::sync::mpsc;

use crate::appmaster::actor::{AppMasterActor, AppMasterOptions};
use crate::appmaster::entrypoint::AmOutcome;
use crate::appmaster::event::{AmEvent, EventSink, ShutdownReason};
use crate::appmaster::state::AmState;
use crate::cluster::FinalStatus;
use crate::description::ClusterPhase;
use crate::rpc::ServerMonitor;
use crate::supervisor::ChildSupervisor;

const EVENT_SINK_BUFFER: usize = 64;

#[tonic::async_trait]
impl Actor for AppMasterActor {
    type Message = AmEvent;
    type Options = AppMasterOptions;

    fn name() -> &'static str {
        "AppMasterActor"
    }

    fn new(options: AppMasterOptions) -> Self {
        let AppMasterOptions { options, outcome } = options;
        let supervisor = ChildSupervisor::new(
            options.config.master.recent_output_lines,
            options.config.master.stop_grace(),
        );
        let state = AmState::new(&options);
        let (tx, rx) = mpsc::channel(EVENT_SINK_BUFFER);
        Self {
            options,
            outcome: Some(outcome),
            server: ServerMonitor::new(),
            state,
            supervisor,
            sink: EventSink::new(tx),
            sink_receiver: Some(rx),
            shutdown: None,
        }
    }

    async fn start(&mut self, ctx: &mut ActorContext<Self>) {
        // Forward adapter callbacks into the mailbox. The task is
        // detached: it ends once the mailbox closes and the next
        // callback arrives.
        if let Some(mut receiver) = self.sink_receiver.take() {
            let handle = ctx.handle().clone();
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    if handle.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
        self.options.node_manager.bind(self.sink.clone()).await;

        let addr = (self.options.config.rpc.listen_host.clone(), 0u16);
        let concurrency_limit = self.options.config.rpc.concurrency_limit;
        self.server
            .launch(Self::serve(ctx.handle().clone(), addr, concurrency_limit))
            .await;
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: AmEvent) -> ActorAction {
        match message {
            AmEvent::ServerReady { port, signal } => self.handle_server_ready(ctx, port, signal),
            AmEvent::RmRegistered { registration } => self.handle_rm_registered(ctx, registration),
            AmEvent::ContainersAllocated { containers } => {
                self.handle_containers_allocated(ctx, containers)
            }
            AmEvent::ContainersCompleted { statuses } => {
                self.handle_containers_completed(ctx, statuses)
            }
            AmEvent::NodesUpdated { reports } => self.handle_nodes_updated(ctx, reports),
            AmEvent::ContainerStarted { id } => self.handle_container_started(ctx, id),
            AmEvent::ContainerStopped { id } => self.handle_container_stopped(ctx, id),
            AmEvent::ContainerStartFailed { id, reason } => {
                self.handle_container_start_failed(ctx, id, reason)
            }
            AmEvent::ContainerStopFailed { id, reason } => {
                self.handle_container_stop_failed(ctx, id, reason)
            }
            AmEvent::ContainerStatusReceived { id, state } => {
                self.handle_container_status_received(ctx, id, state)
            }
            AmEvent::MasterStarted => self.handle_master_started(ctx),
            AmEvent::MasterExited { code } => self.handle_master_exited(ctx, code),
            AmEvent::Heartbeat => self.handle_heartbeat(ctx),
            AmEvent::GetClusterStatus { result } => self.handle_get_cluster_status(ctx, result),
            AmEvent::AddWorkers { count, result } => self.handle_add_workers(ctx, count, result),
            AmEvent::RemoveWorkers { count, result } => {
                self.handle_remove_workers(ctx, count, result)
            }
            AmEvent::Shutdown { reason } => self.initiate_shutdown(reason),
        }
    }

    async fn stop(mut self, ctx: &mut ActorContext<Self>) {
        let reason = self.shutdown.take().unwrap_or(ShutdownReason::Error {
            message: "the event queue closed unexpectedly".to_string(),
        });
        info!("application master is shutting down: {reason}");

        // Let in-flight control RPC replies drain before anything is
        // torn down.
        tokio::time::sleep(self.options.config.am.shutdown_drain()).await;

        self.supervisor.stop().await;
        ctx.join(self.options.config.am.launcher_join_timeout()).await;

        let failed = self.state.failed();
        let status = if failed == 0 {
            FinalStatus::Succeeded
        } else {
            FinalStatus::Failed
        };
        info!(
            "containers at shutdown: {} completed, {failed} failed, {} released",
            self.state.completed(),
            self.state.released()
        );
        self.state.set_phase(ClusterPhase::Stopped);
        if self.state.is_registered() {
            let diagnostics = format!("{reason}; {failed} failed containers");
            let rm = Arc::clone(&self.options.resource_manager);
            let strategy = RetryStrategy::from(&self.options.config.rpc.retry_strategy);
            let unregister = (|| rm.unregister(status, &diagnostics))
                .retry("resource manager unregistration", strategy);
            match unregister.await {
                Ok(()) => info!("unregistered from the resource manager ({status})"),
                Err(e) => error!("failed to unregister from the resource manager: {e}"),
            }
        }

        self.server.shutdown().await;

        if let Some(outcome) = self.outcome.take() {
            let _ = outcome.send(AmOutcome {
                final_status: status,
                reason,
                failed_containers: failed,
            });
        }
        info!("application master has stopped");
    }
}
