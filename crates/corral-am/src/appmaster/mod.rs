mod actor;
mod client;
mod entrypoint;
mod event;
mod launcher;
mod options;
mod server;
mod state;

#[allow(clippy::all)]
pub(crate) mod gen {
    tonic::include_proto!("corral.control");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("corral_control_descriptor");
}

pub use client::ControlClient;
pub use entrypoint::{run_app_master, AmOutcome};
pub use event::{AmEvent, EventSink, ShutdownReason};
pub use options::{AmArguments, AmOptions};
