use gr_orchestrator::{
    config::Config,
    mysql::MySqlConnector,
    scenario,
    sim::{SimulatedConnector, SimulatedGroup},
    topology::DEFAULT_GROUP_NAME,
    ClusterOrchestrator, ClusterTopology, GroupError, GroupMode, MemberRole, MemberState,
    NodeHandle, OrchestratorSettings, Phase, PollSettings, PoolSettings,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(30);

fn topology(mode: GroupMode, nodes: usize) -> ClusterTopology {
    let members = (1..=nodes).map(|i| format!("node{}", i)).collect();
    ClusterTopology::new(mode, DEFAULT_GROUP_NAME, members).unwrap()
}

async fn orchestrator(
    topology: ClusterTopology,
    settings: OrchestratorSettings,
) -> (SimulatedGroup, ClusterOrchestrator<SimulatedConnector>) {
    let group = SimulatedGroup::new(&topology);
    let nodes = group.node_handles(PoolSettings::default()).await.unwrap();
    let orchestrator = ClusterOrchestrator::new(topology, nodes, settings).unwrap();
    (group, orchestrator)
}

#[tokio::test(start_paused = true)]
async fn single_primary_group_of_three() {
    let _ = set_up_logger();

    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();
    assert_eq!(orchestrator.phase(), Phase::Verified);

    let membership = orchestrator.membership().await.unwrap();
    assert_eq!(membership.len(), 3);
    assert_eq!(membership.count_role(MemberRole::Primary), 1);
    assert_eq!(membership.count_role(MemberRole::Secondary), 2);
    assert!(membership
        .members()
        .all(|member| member.state == MemberState::Online));

    scenario::single_primary(&orchestrator, "Testcontainers", PROPAGATION_TIMEOUT)
        .await
        .unwrap();

    for node in orchestrator.nodes().unwrap() {
        assert!(node.list_schemas().await.unwrap().contains("Testcontainers"));
    }
}

#[tokio::test(start_paused = true)]
async fn secondaries_reject_writes_with_the_engine_message() {
    let _ = set_up_logger();

    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();

    let message = orchestrator
        .assert_write_rejected(2, "Testcontainers")
        .await
        .unwrap();
    assert_eq!(message, gr_orchestrator::SUPER_READ_ONLY_MESSAGE);
    orchestrator
        .assert_schema_absent("Testcontainers")
        .await
        .unwrap();

    // the primary is not read-only, so the rejection check itself fails there
    assert!(matches!(
        orchestrator.assert_write_rejected(0, "Primary").await,
        Err(GroupError::Mismatch { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn multi_primary_group_of_three() {
    let _ = set_up_logger();

    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::MultiPrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();

    let membership = orchestrator.membership().await.unwrap();
    assert_eq!(membership.count_role(MemberRole::Primary), 3);

    scenario::multi_primary(&orchestrator, "Testcontainers", PROPAGATION_TIMEOUT)
        .await
        .unwrap();

    for node in orchestrator.nodes().unwrap() {
        let schemas = node.list_schemas().await.unwrap();
        for position in 1..=3 {
            assert!(schemas.contains(&format!("Testcontainers{}", position)));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_must_match_the_group_mode() {
    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::MultiPrimary, 2),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();

    assert!(matches!(
        scenario::single_primary(&orchestrator, "Testcontainers", PROPAGATION_TIMEOUT).await,
        Err(GroupError::Config(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn group_of_one() {
    let _ = set_up_logger();

    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 1),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();
    assert_eq!(orchestrator.phase(), Phase::Verified);

    let membership = orchestrator.membership().await.unwrap();
    assert_eq!(membership.len(), 1);
    assert!(membership.is_online("node1"));

    scenario::single_primary(&orchestrator, "Testcontainers", PROPAGATION_TIMEOUT)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn membership_is_stable_once_verified() {
    let (_group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();

    let first = orchestrator.membership().await.unwrap();
    let second = orchestrator.membership().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn parallel_joins_converge() {
    let settings = OrchestratorSettings {
        parallel_joins: true,
        ..Default::default()
    };
    let (group, mut orchestrator) =
        orchestrator(topology(GroupMode::SinglePrimary, 4), settings).await;
    group.set_recovery_reads(5);

    orchestrator.form_group().await.unwrap();
    assert_eq!(orchestrator.membership().await.unwrap().len(), 4);
    orchestrator.assert_role(3, MemberRole::Secondary).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_replication_times_out() {
    let (group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    orchestrator.form_group().await.unwrap();
    group.set_replication_lag(1_000);

    orchestrator
        .assert_write_accepted(0, "Testcontainers")
        .await
        .unwrap();
    let err = orchestrator
        .assert_propagated(0, "Testcontainers", Duration::from_secs(3))
        .await
        .unwrap_err();
    match err {
        GroupError::ConvergenceTimeout { condition, waited } => {
            assert!(condition.starts_with("schema `Testcontainers` to reach node"));
            assert_eq!(waited, Duration::from_secs(3));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // propagation checks do not change the phase
    assert_eq!(orchestrator.phase(), Phase::Verified);
}

#[tokio::test(start_paused = true)]
async fn propagation_polls_at_its_own_interval() {
    let settings = OrchestratorSettings {
        propagation: PollSettings::new(Duration::from_secs(2), Duration::from_secs(60)),
        ..Default::default()
    };
    let (_group, mut orchestrator) =
        orchestrator(topology(GroupMode::SinglePrimary, 3), settings).await;
    orchestrator.form_group().await.unwrap();
    orchestrator
        .assert_write_accepted(0, "Testcontainers")
        .await
        .unwrap();

    // replicas miss the schema on their first listing, so exactly one interval passes
    let started = tokio::time::Instant::now();
    orchestrator
        .assert_propagated(0, "Testcontainers", PROPAGATION_TIMEOUT)
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn unreachable_member_fails_the_bootstrap() {
    let (group, mut orchestrator) = orchestrator(
        topology(GroupMode::SinglePrimary, 3),
        OrchestratorSettings::default(),
    )
    .await;
    group.set_reachable("node3", false);

    let err = orchestrator.form_group().await.unwrap_err();
    assert!(matches!(err, GroupError::Connection(_)));
    assert_eq!(orchestrator.phase(), Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_are_reported_on_connect() {
    let topology = topology(GroupMode::SinglePrimary, 2);
    let group = SimulatedGroup::new(&topology);
    group.reject_credentials("node2");

    let err = match group.node_handles(PoolSettings::default()).await {
        Ok(_) => panic!("connecting with rejected credentials succeeded"),
        Err(err) => err,
    };
    assert!(matches!(
        err,
        GroupError::Connection(gr_orchestrator::ConnectionError::Rejected { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn group_from_config_file() {
    let config: Config = serde_yaml::from_str(
        r#"
mode: single-primary
nodes:
  - address: db-a
    server-id: 1
    url: mysql://root@db-a/mysql
  - address: db-b
    server-id: 2
    url: mysql://root@db-b/mysql
convergence:
  interval-ms: 100
  timeout-secs: 10
"#,
    )
    .unwrap();

    let topology = config.topology().unwrap();
    let group = SimulatedGroup::new(&topology);
    let nodes = group.node_handles(config.pool_settings()).await.unwrap();
    let mut orchestrator =
        ClusterOrchestrator::new(topology, nodes, config.orchestrator_settings().unwrap())
            .unwrap();

    orchestrator.form_group().await.unwrap();
    orchestrator.assert_role(0, MemberRole::Primary).await.unwrap();
    orchestrator.assert_role(1, MemberRole::Secondary).await.unwrap();
}

/// Runs against real instances listed in `GR_NODE_URLS`, separated by commas, whose
/// server ids are their positions starting at 1. Every instance must have been started with
/// the options from `ClusterTopology::server_options` and report its URL host as member host.
#[tokio::test]
#[ignore]
async fn live_single_primary_group() {
    let _ = set_up_logger();

    let urls = std::env::var("GR_NODE_URLS").expect("GR_NODE_URLS is not set");
    let mut connectors = Vec::new();
    for url in urls.split(',') {
        connectors.push(MySqlConnector::from_url(url.trim(), PoolSettings::default()).unwrap());
    }
    let members = connectors
        .iter()
        .map(|connector| gr_orchestrator::Connector::address(connector).to_owned())
        .collect();
    let topology = ClusterTopology::new(GroupMode::SinglePrimary, DEFAULT_GROUP_NAME, members)
        .unwrap();

    let mut nodes = Vec::new();
    for (connector, server_id) in connectors.into_iter().zip(1..) {
        nodes.push(
            NodeHandle::connect(server_id, connector, PoolSettings::default())
                .await
                .unwrap(),
        );
    }
    let settings = OrchestratorSettings {
        convergence: PollSettings::new(Duration::from_secs(1), Duration::from_secs(120)),
        ..Default::default()
    };
    let mut orchestrator = ClusterOrchestrator::new(topology, nodes, settings).unwrap();

    orchestrator.form_group().await.unwrap();
    scenario::single_primary(&orchestrator, "Testcontainers", Duration::from_secs(60))
        .await
        .unwrap();
}

fn set_up_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
