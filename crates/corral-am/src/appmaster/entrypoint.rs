use corral_server::actor::ActorSystem;
use log::info;
use tokio::sync::oneshot;

use crate::appmaster::actor::{AppMasterActor, AppMasterOptions};
use crate::appmaster::event::ShutdownReason;
use crate::appmaster::options::AmOptions;
use crate::cluster::FinalStatus;
use crate::error::{
    AmError, AmResult, EXIT_INTERNAL_ERROR, EXIT_LAUNCH_FAILURE, EXIT_SUCCESS,
};

/// How a completed application-master run ended.
#[derive(Debug)]
pub struct AmOutcome {
    /// The status reported to the resource manager at unregistration:
    /// SUCCEEDED exactly when no container failures were recorded.
    pub final_status: FinalStatus,
    pub reason: ShutdownReason,
    pub failed_containers: usize,
}

impl AmOutcome {
    pub fn exit_code(&self) -> i32 {
        match (&self.final_status, &self.reason) {
            (FinalStatus::Succeeded, _) => EXIT_SUCCESS,
            (_, ShutdownReason::MasterLaunchFailed { .. }) => EXIT_LAUNCH_FAILURE,
            (_, ShutdownReason::FailureLimit { .. }) => EXIT_LAUNCH_FAILURE,
            (_, ShutdownReason::Error { .. }) => EXIT_INTERNAL_ERROR,
            // Otherwise-clean shutdowns that had recorded failures.
            _ => EXIT_LAUNCH_FAILURE,
        }
    }
}

/// Runs the application master to completion: spawns the engine,
/// blocks until it reaches its terminal state, and reports the outcome.
/// All configuration validation has already happened while building
/// [AmOptions], before anything registered with the resource manager.
pub async fn run_app_master(options: AmOptions) -> AmResult<AmOutcome> {
    info!(
        "starting application master for cluster {:?} ({} masters, {} workers)",
        options.cluster_name, options.masters, options.workers
    );
    let (tx, rx) = oneshot::channel();
    let mut system = ActorSystem::new();
    let _handle = system.spawn::<AppMasterActor>(AppMasterOptions {
        options,
        outcome: tx,
    });
    system.join().await;
    rx.await.map_err(|_| {
        AmError::InternalState(
            "the application master stopped without reporting an outcome".to_string(),
        )
    })
}
