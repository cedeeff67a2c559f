use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use corral_am::appmaster::{
    run_app_master, AmArguments, AmOptions, AmOutcome, ControlClient, ShutdownReason,
};
use corral_am::cluster::{FinalStatus, NodeManager, StandaloneCluster};
use corral_am::config::{AmEnvironment, AppConfig};
use corral_am::description::{ClusterDescription, ClusterPhase, NodeState};
use corral_am::error::AmResult;
use corral_am::id::ContainerId;
use corral_am::rpc::ClientOptions;

const WAIT: Duration = Duration::from_secs(15);

const SITE_XML: &str = r#"<?xml version="1.0"?>
<configuration>
  <property>
    <name>regiondb.rootdir</name>
    <value>file:///data/regiondb</value>
  </property>
  <property>
    <name>regiondb.zookeeper.quorum</name>
    <value>127.0.0.1</value>
  </property>
  <property>
    <name>regiondb.zookeeper.client.port</name>
    <value>2181</value>
  </property>
</configuration>
"#;

struct TestCluster {
    cluster: StandaloneCluster,
    client: ControlClient,
    am: JoinHandle<AmResult<AmOutcome>>,
    _conf_dir: TempDir,
}

async fn launch(name: &str, workers: usize, masters: usize) -> TestCluster {
    let command = (masters > 0).then(|| "/bin/sleep 30".to_string());
    launch_cluster(name, workers, masters, command, |_| {}).await
}

async fn launch_with(
    name: &str,
    workers: usize,
    masters: usize,
    tweak: impl FnOnce(&StandaloneCluster),
) -> TestCluster {
    let command = (masters > 0).then(|| "/bin/sleep 30".to_string());
    launch_cluster(name, workers, masters, command, tweak).await
}

async fn launch_cluster(
    name: &str,
    workers: usize,
    masters: usize,
    master_command: Option<String>,
    tweak: impl FnOnce(&StandaloneCluster),
) -> TestCluster {
    let conf_dir = tempfile::tempdir().expect("temp conf dir");
    std::fs::write(conf_dir.path().join("backing-site.xml"), SITE_XML).expect("site file");

    let cluster = StandaloneCluster::new(4096);
    tweak(&cluster);

    let mut config = AppConfig::load().expect("default config");
    config.am.heartbeat_interval_millis = 100;
    config.am.shutdown_drain_millis = 50;
    config.master.stop_grace_secs = 2;

    let environment = AmEnvironment {
        container_id: "container_am_000001".to_string(),
        nm_host: "127.0.0.1".to_string(),
        nm_port: 8041,
        nm_http_port: 8042,
        user: "test".to_string(),
        log_dir: conf_dir.path().to_path_buf(),
    };
    let arguments = AmArguments {
        name: name.to_string(),
        workers,
        masters,
        worker_heap_mb: 512,
        master_heap_mb: 512,
        generated_conf_dir: conf_dir.path().to_path_buf(),
        backing_home: PathBuf::from("/opt/regiondb"),
        rm_address: "standalone:0".to_string(),
        master_command,
    };
    let options = AmOptions::try_new(
        arguments,
        config,
        environment,
        cluster.resource_manager(),
        cluster.node_manager(),
    )
    .expect("valid options");

    let am = tokio::spawn(run_app_master(options));
    let address = timeout(WAIT, cluster.registered_address())
        .await
        .expect("registration");
    let client = ControlClient::new(ClientOptions::new(address.host, address.port));
    TestCluster {
        cluster,
        client,
        am,
        _conf_dir: conf_dir,
    }
}

/// Polls the control endpoint until the published description satisfies
/// the predicate. Every snapshot along the way must parse, so this also
/// exercises the JSON contract under concurrent mutation.
async fn wait_for_description(
    client: &ControlClient,
    predicate: impl Fn(&ClusterDescription) -> bool,
) -> ClusterDescription {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let json = client
            .get_cluster_status()
            .await
            .expect("status RPC should succeed");
        let description =
            ClusterDescription::from_json(&json).expect("every snapshot must be well-formed");
        if predicate(&description) {
            return description;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the cluster description, last snapshot:\n{json}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_cluster(cluster: &StandaloneCluster, predicate: impl Fn(&StandaloneCluster) -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !predicate(cluster) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the standalone cluster"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn first_started(cluster: &StandaloneCluster) -> ContainerId {
    wait_for_cluster(cluster, |c| !c.started_containers().is_empty()).await;
    cluster.started_containers()[0].clone()
}

async fn outcome_of(am: JoinHandle<AmResult<AmOutcome>>) -> AmOutcome {
    timeout(WAIT, am)
        .await
        .expect("the application master should terminate")
        .expect("the application master task should not panic")
        .expect("the application master should report an outcome")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_two_workers_one_master() {
    let t = launch("alpha", 2, 1).await;
    let description = wait_for_description(&t.client, |d| {
        d.worker_nodes.len() == 2 && d.master_nodes.first().map(|m| m.state) == Some(NodeState::Live)
    })
    .await;

    assert_eq!(description.state, ClusterPhase::Live);
    assert_eq!(description.name, "alpha");
    assert_eq!(description.workers, 2);
    assert_eq!(description.zk_port, 2181);
    assert_eq!(description.root_path, "file:///data/regiondb");
    assert!(description
        .client_properties
        .contains_key("regiondb.zookeeper.client.port"));
    for worker in &description.worker_nodes {
        assert_eq!(worker.role, "worker");
        assert_eq!(worker.state, NodeState::Live);
        assert!(worker.command.contains("regionserver start"));
    }
    assert_eq!(description.master_nodes[0].role, "master");
    assert_eq!(description.master_nodes[0].command, "/bin/sleep 30");

    // The raw document keeps the contractual field spellings.
    let json = t.client.get_cluster_status().await.expect("status");
    let value: serde_json::Value = serde_json::from_str(&json).expect("well-formed JSON");
    assert_eq!(value["state"], "LIVE");
    assert!(value["workerNodes"].is_array());
    assert!(value["clientProperties"].is_object());
    assert!(value["statusTime"].as_u64().is_some());

    // Shutdown through the control RPC.
    t.client.stop_cluster("scenario done").await.expect("stop");
    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert!(matches!(outcome.reason, ShutdownReason::ClientRequest));
    assert_eq!(outcome.failed_containers, 0);

    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Succeeded);
    assert_eq!(t.cluster.requests_after_unregister(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_over_allocation_releases_the_surplus() {
    let t = launch_with("beta", 2, 0, |cluster| cluster.grant_extra(1)).await;

    wait_for_description(&t.client, |d| d.worker_nodes.len() == 2).await;
    wait_for_cluster(&t.cluster, |c| c.released_containers().len() == 1).await;
    assert_eq!(t.cluster.total_granted(), 3);

    // The released grant is not a failure.
    t.client.stop_cluster("").await.expect("stop");
    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_churn_is_reconciled() {
    let t = launch("gamma", 2, 1).await;
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 2).await;

    let victim = first_started(&t.cluster).await;
    let node = t
        .cluster
        .container_node(&victim)
        .expect("the victim is live");
    t.cluster
        .report_node_health(node, false, "disk pressure")
        .await;
    t.cluster
        .complete_container(&victim, 137, "region server killed")
        .await;

    let description = wait_for_description(&t.client, |d| {
        d.worker_nodes.len() == 2 && d.completed_nodes.len() == 1
    })
    .await;
    assert_eq!(description.completed_nodes[0].exit_code, Some(137));
    assert_eq!(description.completed_nodes[0].state, NodeState::Destroyed);
    // A replacement was requested beyond the original two grants.
    assert_eq!(t.cluster.total_granted(), 3);

    t.client.stop_cluster("").await.expect("stop");
    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.failed_containers, 1);
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_masterless_cluster_finishes_with_its_workers() {
    let t = launch("delta", 1, 0).await;
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 1).await;

    let worker = first_started(&t.cluster).await;
    t.cluster.complete_container(&worker, 0, "").await;

    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert!(matches!(outcome.reason, ShutdownReason::WorkersCompleted));
    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Succeeded);
    assert_eq!(t.cluster.requests_after_unregister(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_catastrophic_failures_give_up_on_the_cluster() {
    let t = launch("epsilon", 5, 1).await;

    for round in 0..10 {
        let victim = first_started(&t.cluster).await;
        t.cluster
            .complete_container(&victim, 1, &format!("crash {round}"))
            .await;
    }

    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert!(matches!(outcome.reason, ShutdownReason::FailureLimit { .. }));
    assert_eq!(outcome.failed_containers, 10);
    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_master_exit_terminates_the_application_master() {
    // The master exits on its own after a second; its death is a
    // completion signal regardless of the exit code.
    let t = launch_cluster("eta", 1, 1, Some("/bin/sleep 1".to_string()), |_| {}).await;
    let outcome = outcome_of(t.am).await;
    assert!(matches!(
        outcome.reason,
        ShutdownReason::MasterExited { code: 0 }
    ));
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_scaling_through_the_control_rpc() {
    let t = launch("zeta", 1, 0).await;
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 1).await;

    let desired = t.client.add_nodes(2).await.expect("add nodes");
    assert_eq!(desired, 3);
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 3 && d.workers == 3).await;

    let desired = t.client.delete_nodes(2).await.expect("delete nodes");
    assert_eq!(desired, 1);
    let description =
        wait_for_description(&t.client, |d| d.worker_nodes.len() == 1 && d.workers == 1).await;
    // The scaled-away workers retired as releases, not failures.
    assert_eq!(description.failed_nodes.len(), 0);
    wait_for_cluster(&t.cluster, |c| c.released_containers().len() == 2).await;

    t.client.stop_cluster("").await.expect("stop");
    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert_eq!(t.cluster.requests_after_unregister(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resource_manager_shutdown_request_is_honored() {
    let t = launch("kappa", 1, 1).await;
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 1).await;

    t.cluster.request_shutdown().await;
    let outcome = outcome_of(t.am).await;
    assert!(matches!(outcome.reason, ShutdownReason::ResourceManager));
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    let finished = timeout(WAIT, t.cluster.finished()).await.expect("unregister");
    assert_eq!(finished.status, FinalStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_manager_stop_retires_the_worker() {
    let t = launch("iota", 1, 0).await;
    wait_for_description(&t.client, |d| d.worker_nodes.len() == 1).await;

    let worker = first_started(&t.cluster).await;
    let node = t
        .cluster
        .container_node(&worker)
        .expect("the worker is live");
    let node_manager = t.cluster.node_manager();
    node_manager
        .container_status(&worker, &node)
        .await
        .expect("status query");
    node_manager
        .stop_container(&worker, &node)
        .await
        .expect("stop container");

    // The zero-exit completion finishes the masterless cluster cleanly.
    let outcome = outcome_of(t.am).await;
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert!(matches!(outcome.reason, ShutdownReason::WorkersCompleted));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_site_config_fails_before_registering() {
    let conf_dir = tempfile::tempdir().expect("temp conf dir");
    // No backing-site.xml staged.
    let cluster = StandaloneCluster::new(4096);
    let arguments = AmArguments {
        name: "theta".to_string(),
        workers: 1,
        masters: 0,
        worker_heap_mb: 512,
        master_heap_mb: 512,
        generated_conf_dir: conf_dir.path().to_path_buf(),
        backing_home: PathBuf::from("/opt/regiondb"),
        rm_address: "standalone:0".to_string(),
        master_command: None,
    };
    let environment = AmEnvironment {
        container_id: "container_am_000001".to_string(),
        nm_host: "127.0.0.1".to_string(),
        nm_port: 8041,
        nm_http_port: 8042,
        user: "test".to_string(),
        log_dir: conf_dir.path().to_path_buf(),
    };
    let out = AmOptions::try_new(
        arguments,
        AppConfig::load().expect("default config"),
        environment,
        cluster.resource_manager(),
        cluster.node_manager(),
    );
    assert!(matches!(
        out,
        Err(corral_am::error::AmError::BadConfig(_))
    ));
}
