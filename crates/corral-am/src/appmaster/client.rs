use std::sync::Arc;

use corral_server::Retryable;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tonic::transport::Channel;

use crate::appmaster::gen::control_service_client::ControlServiceClient;
use crate::appmaster::gen::{
    AddNodesRequest, AddNodesResponse, DeleteNodesRequest, DeleteNodesResponse,
    GetClusterStatusRequest, GetClusterStatusResponse, StopClusterRequest, StopClusterResponse,
};
use crate::error::{AmError, AmResult};
use crate::rpc::ClientOptions;

type GrpcClient = ControlServiceClient<Channel>;

/// Client for the application master's control endpoint. Cheap to
/// clone; all clones share one lazily established connection.
#[derive(Debug, Clone)]
pub struct ControlClient {
    inner: Arc<ControlClientInner>,
}

#[derive(Debug)]
struct ControlClientInner {
    options: ClientOptions,
    /// The connection cell must live inside the shared allocation: if
    /// each clone carried its own empty cell, every clone would open a
    /// separate connection on first use and the endpoint would see a
    /// burst of duplicates instead of one shared channel.
    client: OnceCell<Mutex<GrpcClient>>,
}

impl ControlClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ControlClientInner {
                options,
                client: OnceCell::new(),
            }),
        }
    }

    /// The shared connection, established on first use. Attempts go
    /// through the connect retry strategy, so a client created while
    /// the application master is still binding its ephemeral port can
    /// get through.
    async fn client(&self) -> AmResult<MutexGuard<'_, GrpcClient>> {
        let inner = &self.inner;
        let client = inner
            .client
            .get_or_try_init(|| async {
                let connect = || GrpcClient::connect(inner.options.to_url_string());
                let client = connect
                    .retry(
                        "control endpoint connection",
                        inner.options.connect_retry.clone(),
                    )
                    .await?;
                Ok::<_, AmError>(Mutex::new(client))
            })
            .await?;
        Ok(client.lock().await)
    }

    /// The cluster description as a JSON document.
    pub async fn get_cluster_status(&self) -> AmResult<String> {
        let request = tonic::Request::new(GetClusterStatusRequest {});
        let response = self.client().await?.get_cluster_status(request).await?;
        let GetClusterStatusResponse { cluster_json } = response.into_inner();
        Ok(cluster_json)
    }

    pub async fn stop_cluster(&self, message: &str) -> AmResult<()> {
        let request = tonic::Request::new(StopClusterRequest {
            message: message.to_string(),
        });
        let response = self.client().await?.stop_cluster(request).await?;
        let StopClusterResponse {} = response.into_inner();
        Ok(())
    }

    /// Returns the new desired worker count.
    pub async fn add_nodes(&self, count: u32) -> AmResult<u32> {
        let request = tonic::Request::new(AddNodesRequest { count });
        let response = self.client().await?.add_nodes(request).await?;
        let AddNodesResponse { desired_workers } = response.into_inner();
        Ok(desired_workers)
    }

    /// Returns the new desired worker count.
    pub async fn delete_nodes(&self, count: u32) -> AmResult<u32> {
        let request = tonic::Request::new(DeleteNodesRequest { count });
        let response = self.client().await?.delete_nodes(request).await?;
        let DeleteNodesResponse { desired_workers } = response.into_inner();
        Ok(desired_workers)
    }
}
