use std::env;
use std::path::PathBuf;

use crate::error::{AmError, AmResult};

pub const ENV_CONTAINER_ID: &str = "CONTAINER_ID";
pub const ENV_NM_HOST: &str = "NM_HOST";
pub const ENV_NM_PORT: &str = "NM_PORT";
pub const ENV_NM_HTTP_PORT: &str = "NM_HTTP_PORT";
pub const ENV_USER: &str = "USER";
pub const ENV_LOG_DIR: &str = "LOGDIR";

/// The environment the resource manager sets up for the application
/// master's own container. Everything except `LOGDIR` is required.
#[derive(Debug, Clone)]
pub struct AmEnvironment {
    /// Identity of the container the application master itself runs in.
    pub container_id: String,
    pub nm_host: String,
    pub nm_port: u16,
    pub nm_http_port: u16,
    pub user: String,
    pub log_dir: PathBuf,
}

impl AmEnvironment {
    pub fn from_env() -> AmResult<Self> {
        let container_id = required(ENV_CONTAINER_ID)?;
        let nm_host = required(ENV_NM_HOST)?;
        let nm_port = required_port(ENV_NM_PORT)?;
        let nm_http_port = required_port(ENV_NM_HTTP_PORT)?;
        let user = required(ENV_USER)?;
        let log_dir = match env::var(ENV_LOG_DIR) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Self::default_log_dir(&user),
        };
        Ok(Self {
            container_id,
            nm_host,
            nm_port,
            nm_http_port,
            user,
            log_dir,
        })
    }

    pub fn default_log_dir(user: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/corral-{user}"))
    }
}

fn required(name: &str) -> AmResult<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AmError::BadConfig(format!(
            "environment variable {name} is not set"
        ))),
    }
}

fn required_port(name: &str) -> AmResult<u16> {
    let value = required(name)?;
    value
        .parse::<u16>()
        .map_err(|_| AmError::BadConfig(format!("environment variable {name} is not a port: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir() {
        assert_eq!(
            AmEnvironment::default_log_dir("alice"),
            PathBuf::from("/tmp/corral-alice")
        );
    }
}
