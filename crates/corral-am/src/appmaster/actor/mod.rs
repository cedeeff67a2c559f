mod core;
mod handler;
mod rpc;

use tokio::sync::{mpsc, oneshot};

use crate::appmaster::entrypoint::AmOutcome;
use crate::appmaster::event::{AmEvent, EventSink, ShutdownReason};
use crate::appmaster::options::AmOptions;
use crate::appmaster::state::AmState;
use crate::rpc::ServerMonitor;
use crate::supervisor::ChildSupervisor;

pub(crate) struct AppMasterOptions {
    pub options: AmOptions,
    pub outcome: oneshot::Sender<AmOutcome>,
}

/// The reconciliation engine. Owns the cluster state, the adapters,
/// the supervised master child, and the control RPC server; consumes
/// every event through a single mailbox.
pub(crate) struct AppMasterActor {
    options: AmOptions,
    outcome: Option<oneshot::Sender<AmOutcome>>,
    server: ServerMonitor,
    state: AmState,
    supervisor: ChildSupervisor,
    /// The channel adapters and the supervisor post their callbacks to.
    sink: EventSink,
    sink_receiver: Option<mpsc::Receiver<AmEvent>>,
    shutdown: Option<ShutdownReason>,
}
