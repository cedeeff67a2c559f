use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::info;

use corral_am::appmaster::{run_app_master, AmArguments, AmOptions, ControlClient};
use corral_am::cluster::StandaloneCluster;
use corral_am::config::{AmEnvironment, AppConfig};
use corral_am::error::{AmError, AmResult};
use corral_am::rpc::ClientOptions;

#[derive(Debug, Parser)]
#[command(name = "corral", about = "Deploy and supervise a regiondb cluster")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the application master. This is normally launched by the
    /// resource manager on behalf of a client, not by a human.
    Am(AmArgs),
    /// Print the cluster status document of a running cluster.
    Status(EndpointArgs),
    /// Stop a running cluster.
    Stop(StopArgs),
    /// Scale the worker count of a running cluster.
    Nodes(NodesArgs),
}

#[derive(Debug, Args)]
struct AmArgs {
    /// Cluster name.
    #[arg(long, default_value = "default")]
    name: String,
    /// Desired number of region-server workers.
    #[arg(long)]
    workers: usize,
    /// Desired number of masters (0 or 1).
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=1), default_value_t = 1)]
    masters: u32,
    /// Worker container heap, in MB.
    #[arg(long = "workerHeap", default_value_t = 512)]
    worker_heap: u32,
    /// Master process heap, in MB.
    #[arg(long = "masterHeap", default_value_t = 1024)]
    master_heap: u32,
    /// Directory holding the staged backing-service configuration.
    #[arg(long = "generatedConfDir")]
    generated_conf_dir: PathBuf,
    /// Installation prefix of the backing service.
    #[arg(long = "backingHome", default_value = "/opt/regiondb")]
    backing_home: PathBuf,
    /// Resource manager address, host:port.
    #[arg(long = "rmAddress")]
    rm_address: String,
    /// Test hook: replaces the master launch command entirely.
    #[arg(long = "xMasterCommand")]
    x_master_command: Option<String>,
    /// Test mode: run against an in-process standalone cluster instead
    /// of a real resource manager.
    #[arg(long = "xTest")]
    x_test: bool,
}

#[derive(Debug, Args)]
struct EndpointArgs {
    /// Control endpoint of the application master, host:port.
    #[arg(long)]
    address: String,
}

#[derive(Debug, Args)]
struct StopArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,
    /// Reason recorded in the application master logs.
    #[arg(long, default_value = "")]
    message: String,
}

#[derive(Debug, Args)]
struct NodesArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,
    /// Number of workers to add.
    #[arg(long, conflicts_with = "remove")]
    add: Option<u32>,
    /// Number of workers to remove.
    #[arg(long)]
    remove: Option<u32>,
}

pub async fn run(cli: Cli) -> AmResult<i32> {
    match cli.command {
        Command::Am(args) => run_am(args).await,
        Command::Status(args) => {
            let client = control_client(&args)?;
            let status = client.get_cluster_status().await?;
            println!("{status}");
            Ok(0)
        }
        Command::Stop(args) => {
            let client = control_client(&args.endpoint)?;
            client.stop_cluster(&args.message).await?;
            info!("stop signal delivered");
            Ok(0)
        }
        Command::Nodes(args) => {
            let client = control_client(&args.endpoint)?;
            let desired = match (args.add, args.remove) {
                (Some(count), None) => client.add_nodes(count).await?,
                (None, Some(count)) => client.delete_nodes(count).await?,
                _ => {
                    return Err(AmError::BadArguments(
                        "exactly one of --add and --remove is required".to_string(),
                    ))
                }
            };
            println!("{desired}");
            Ok(0)
        }
    }
}

async fn run_am(args: AmArgs) -> AmResult<i32> {
    let config = AppConfig::load()?;
    let environment = if args.x_test {
        test_environment()
    } else {
        AmEnvironment::from_env()?
    };
    let (resource_manager, node_manager) = if args.x_test {
        let cluster = StandaloneCluster::new(8192);
        (cluster.resource_manager(), cluster.node_manager())
    } else {
        // The wire binding for a real resource manager lives behind the
        // ResourceManager trait; this binary ships only the in-process
        // cluster.
        return Err(AmError::BadArguments(format!(
            "no resource manager binding for {:?}; launch with --xTest for the in-process cluster",
            args.rm_address
        )));
    };
    let arguments = AmArguments {
        name: args.name,
        workers: args.workers,
        masters: args.masters as usize,
        worker_heap_mb: args.worker_heap,
        master_heap_mb: args.master_heap,
        generated_conf_dir: args.generated_conf_dir,
        backing_home: args.backing_home,
        rm_address: args.rm_address,
        master_command: args.x_master_command,
    };
    let options = AmOptions::try_new(
        arguments,
        config,
        environment,
        resource_manager,
        node_manager,
    )?;
    let outcome = run_app_master(options).await?;
    info!(
        "application master finished: {} ({})",
        outcome.final_status, outcome.reason
    );
    Ok(outcome.exit_code())
}

fn test_environment() -> AmEnvironment {
    let user = std::env::var("USER").unwrap_or_else(|_| "corral".to_string());
    AmEnvironment {
        container_id: "container_corral_test_000001".to_string(),
        nm_host: "127.0.0.1".to_string(),
        nm_port: 0,
        nm_http_port: 0,
        log_dir: AmEnvironment::default_log_dir(&user),
        user,
    }
}

fn control_client(endpoint: &EndpointArgs) -> AmResult<ControlClient> {
    let (host, port) = endpoint.address.split_once(':').ok_or_else(|| {
        AmError::BadArguments(format!(
            "control address must be host:port, got {:?}",
            endpoint.address
        ))
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        AmError::BadArguments(format!("invalid control port in {:?}", endpoint.address))
    })?;
    Ok(ControlClient::new(ClientOptions::new(host, port)))
}
