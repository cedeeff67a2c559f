use crate::appmaster::options::AmOptions;
use crate::cluster::LaunchContext;

/// Log directory passed down to the backing-service processes.
pub const ENV_BACKING_LOG_DIR: &str = "LOG_DIR";
/// JVM-style heap hint for the region-server processes, in MB.
pub const ENV_BACKING_HEAPSIZE: &str = "REGIONDB_HEAPSIZE";

const MASTER_SUBCOMMAND: &str = "master";
const WORKER_SUBCOMMAND: &str = "regionserver";

/// Launch context for the supervised master child. The master inherits
/// our environment with only the log directory added; its heap comes
/// from the staged configuration.
pub fn master_launch_context(options: &AmOptions) -> LaunchContext {
    let command = match &options.master_command {
        // The test hook replaces the command wholesale.
        Some(command) => command.split_whitespace().map(str::to_string).collect(),
        None => backing_command(options, MASTER_SUBCOMMAND),
    };
    LaunchContext {
        command,
        environment: vec![(ENV_BACKING_LOG_DIR.to_string(), log_dir(options))],
    }
}

/// Launch context for one worker container: the log directory plus the
/// heap sized to the container request.
pub fn worker_launch_context(options: &AmOptions) -> LaunchContext {
    LaunchContext {
        command: backing_command(options, WORKER_SUBCOMMAND),
        environment: vec![
            (ENV_BACKING_LOG_DIR.to_string(), log_dir(options)),
            (
                ENV_BACKING_HEAPSIZE.to_string(),
                options.worker_heap_mb.to_string(),
            ),
        ],
    }
}

fn backing_command(options: &AmOptions, subcommand: &str) -> Vec<String> {
    let binary = options
        .backing_home
        .join("bin")
        .join(&options.config.master.binary);
    vec![
        binary.to_string_lossy().into_owned(),
        "--config".to_string(),
        options.generated_conf_dir.to_string_lossy().into_owned(),
        subcommand.to_string(),
        "start".to_string(),
    ]
}

fn log_dir(options: &AmOptions) -> String {
    options.environment.log_dir.to_string_lossy().into_owned()
}
