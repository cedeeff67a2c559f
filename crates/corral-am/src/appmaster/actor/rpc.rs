use corral_server::actor::ActorHandle;
use corral_server::{ServerBuilder, ServerBuilderOptions};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::appmaster::actor::AppMasterActor;
use crate::appmaster::gen;
use crate::appmaster::gen::control_service_server::ControlServiceServer;
use crate::appmaster::server::ControlServer;
use crate::appmaster::AmEvent;
use crate::error::{AmError, AmResult};

impl AppMasterActor {
    /// Binds the control endpoint on an ephemeral port and serves it
    /// until the shutdown signal fires. The bound port travels back to
    /// the engine in a `ServerReady` event before the first request is
    /// accepted.
    pub(super) async fn serve(
        handle: ActorHandle<Self>,
        addr: impl ToSocketAddrs,
        concurrency_limit: usize,
    ) -> AmResult<()> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let service = ControlServiceServer::new(ControlServer::new(handle.clone()));

        handle.send(AmEvent::ServerReady { port, signal: tx }).await?;

        let options = ServerBuilderOptions {
            concurrency_limit: Some(concurrency_limit),
            ..Default::default()
        };
        ServerBuilder::new("corral_control", options)
            .add_service(service, Some(gen::FILE_DESCRIPTOR_SET))
            .await
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .map_err(|e| AmError::InternalState(e.to_string()))
    }
}
