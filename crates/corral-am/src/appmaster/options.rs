use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::{NodeManager, Resource, ResourceManager};
use crate::config::{AmEnvironment, AppConfig, SiteConfig};
use crate::error::{AmError, AmResult};

/// The launch arguments handed over by the submitting client.
#[derive(Debug, Clone)]
pub struct AmArguments {
    pub name: String,
    pub workers: usize,
    /// 0 or 1.
    pub masters: usize,
    pub worker_heap_mb: u32,
    pub master_heap_mb: u32,
    pub generated_conf_dir: PathBuf,
    pub backing_home: PathBuf,
    pub rm_address: String,
    /// Test hook: replaces the master launch command entirely.
    pub master_command: Option<String>,
}

/// Everything the application master needs, resolved once at boot and
/// immutable afterwards. Building this value performs all startup
/// validation, so configuration failures happen before anything has
/// registered with the resource manager.
pub struct AmOptions {
    pub cluster_name: String,
    pub workers: usize,
    pub masters: usize,
    pub worker_heap_mb: u32,
    pub master_heap_mb: u32,
    pub generated_conf_dir: PathBuf,
    pub backing_home: PathBuf,
    pub rm_address: String,
    pub master_command: Option<String>,
    pub config: AppConfig,
    pub environment: AmEnvironment,
    pub site: SiteConfig,
    pub resource_manager: Arc<dyn ResourceManager>,
    pub node_manager: Arc<dyn NodeManager>,
}

impl AmOptions {
    pub fn try_new(
        arguments: AmArguments,
        config: AppConfig,
        environment: AmEnvironment,
        resource_manager: Arc<dyn ResourceManager>,
        node_manager: Arc<dyn NodeManager>,
    ) -> AmResult<Self> {
        if arguments.masters > 1 {
            return Err(AmError::BadArguments(format!(
                "at most one master is supported, got {}",
                arguments.masters
            )));
        }
        let site = SiteConfig::load(&arguments.generated_conf_dir)?;
        Ok(Self {
            cluster_name: arguments.name,
            workers: arguments.workers,
            masters: arguments.masters,
            worker_heap_mb: arguments.worker_heap_mb,
            master_heap_mb: arguments.master_heap_mb,
            generated_conf_dir: arguments.generated_conf_dir,
            backing_home: arguments.backing_home,
            rm_address: arguments.rm_address,
            master_command: arguments.master_command,
            config,
            environment,
            site,
            resource_manager,
            node_manager,
        })
    }

    pub fn no_master(&self) -> bool {
        self.masters == 0
    }

    pub fn worker_resource(&self) -> Resource {
        Resource {
            memory_mb: self.worker_heap_mb,
        }
    }
}
