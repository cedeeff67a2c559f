use corral_server::actor::ActorHandle;
use log::{debug, info};
use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

use crate::appmaster::actor::AppMasterActor;
use crate::appmaster::event::{AmEvent, ShutdownReason};
use crate::appmaster::gen::control_service_server::ControlService;
use crate::appmaster::gen::{
    AddNodesRequest, AddNodesResponse, DeleteNodesRequest, DeleteNodesResponse,
    GetClusterStatusRequest, GetClusterStatusResponse, StopClusterRequest, StopClusterResponse,
};
use crate::error::AmError;

/// The control RPC surface. Every operation is a thin adapter that
/// forwards into the engine's mailbox; reads round-trip through a
/// oneshot so each snapshot is a consistent serialization.
pub struct ControlServer {
    handle: ActorHandle<AppMasterActor>,
}

impl ControlServer {
    pub fn new(handle: ActorHandle<AppMasterActor>) -> Self {
        Self { handle }
    }
}

#[tonic::async_trait]
impl ControlService for ControlServer {
    async fn get_cluster_status(
        &self,
        request: Request<GetClusterStatusRequest>,
    ) -> Result<Response<GetClusterStatusResponse>, Status> {
        let GetClusterStatusRequest {} = request.into_inner();
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(AmEvent::GetClusterStatus { result: tx })
            .await
            .map_err(AmError::from)?;
        let cluster_json = rx.await.map_err(AmError::from)??;
        Ok(Response::new(GetClusterStatusResponse { cluster_json }))
    }

    async fn stop_cluster(
        &self,
        request: Request<StopClusterRequest>,
    ) -> Result<Response<StopClusterResponse>, Status> {
        let StopClusterRequest { message } = request.into_inner();
        if message.is_empty() {
            info!("stop requested by a control client");
        } else {
            info!("stop requested by a control client: {message}");
        }
        self.handle
            .send(AmEvent::Shutdown {
                reason: ShutdownReason::ClientRequest,
            })
            .await
            .map_err(AmError::from)?;
        Ok(Response::new(StopClusterResponse {}))
    }

    async fn add_nodes(
        &self,
        request: Request<AddNodesRequest>,
    ) -> Result<Response<AddNodesResponse>, Status> {
        let AddNodesRequest { count } = request.into_inner();
        debug!("add_nodes({count})");
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(AmEvent::AddWorkers {
                count: count as usize,
                result: tx,
            })
            .await
            .map_err(AmError::from)?;
        let desired = rx.await.map_err(AmError::from)?;
        Ok(Response::new(AddNodesResponse {
            desired_workers: desired as u32,
        }))
    }

    async fn delete_nodes(
        &self,
        request: Request<DeleteNodesRequest>,
    ) -> Result<Response<DeleteNodesResponse>, Status> {
        let DeleteNodesRequest { count } = request.into_inner();
        debug!("delete_nodes({count})");
        let (tx, rx) = oneshot::channel();
        self.handle
            .send(AmEvent::RemoveWorkers {
                count: count as usize,
                result: tx,
            })
            .await
            .map_err(AmError::from)?;
        let desired = rx.await.map_err(AmError::from)?;
        Ok(Response::new(DeleteNodesResponse {
            desired_workers: desired as u32,
        }))
    }
}
