use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub type AmResult<T> = Result<T, AmError>;

/// Process exit codes reported by the application master binary.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_BAD_ARGUMENTS: i32 = 64;
pub const EXIT_LAUNCH_FAILURE: i32 = 69;
pub const EXIT_INTERNAL_ERROR: i32 = 70;
pub const EXIT_BAD_CONFIG: i32 = 78;

#[derive(Debug, Error)]
pub enum AmError {
    /// Unrecoverable; the application master fails fast before registering.
    #[error("invalid command arguments: {0}")]
    BadArguments(String),
    /// Missing or malformed site configuration; same disposition.
    #[error("invalid configuration: {0}")]
    BadConfig(String),
    /// Communication with the resource manager or a node manager failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Invariant violation, e.g. spawning an already-running child.
    #[error("internal state error: {0}")]
    InternalState(String),
    /// The supervised child process could not be started.
    #[error("launch failure: {0}")]
    Launch(String),
    #[error("failed to start container {id}: {reason}")]
    ContainerStart { id: String, reason: String },
    #[error("failed to stop container {id}: {reason}")]
    ContainerStop { id: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AmError {
    /// Maps an error raised before or during the lifecycle to the
    /// process exit code reported to the launcher.
    pub fn exit_code(&self) -> i32 {
        match self {
            AmError::BadArguments(_) => EXIT_BAD_ARGUMENTS,
            AmError::BadConfig(_) => EXIT_BAD_CONFIG,
            AmError::Launch(_) => EXIT_LAUNCH_FAILURE,
            AmError::ContainerStart { .. } | AmError::ContainerStop { .. } => EXIT_LAUNCH_FAILURE,
            AmError::Transport(_)
            | AmError::InternalState(_)
            | AmError::Io(_)
            | AmError::Json(_) => EXIT_INTERNAL_ERROR,
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for AmError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        AmError::InternalState(format!("failed to send event: {e}"))
    }
}

impl From<oneshot::error::RecvError> for AmError {
    fn from(e: oneshot::error::RecvError) -> Self {
        AmError::InternalState(format!("failed to receive reply: {e}"))
    }
}

impl From<tonic::Status> for AmError {
    fn from(e: tonic::Status) -> Self {
        AmError::Transport(e.to_string())
    }
}

impl From<tonic::transport::Error> for AmError {
    fn from(e: tonic::transport::Error) -> Self {
        AmError::Transport(e.to_string())
    }
}

impl From<AmError> for tonic::Status {
    fn from(e: AmError) -> Self {
        match e {
            AmError::BadArguments(x) | AmError::BadConfig(x) => tonic::Status::invalid_argument(x),
            AmError::Transport(x) => tonic::Status::unavailable(x),
            x => tonic::Status::internal(x.to_string()),
        }
    }
}
