//! Forms a replication group from provisioned nodes and verifies that it converged.
//!
//! The [`ClusterOrchestrator`] moves through the [`Phase`]s
//! `Uninitialized → Bootstrapped → Joined → Verified`. Every failed step moves it to the
//! terminal `Failed` phase, in which the cause of the failure is returned for every further
//! request. The write-gating and propagation checks are only available once the group is
//! `Verified`.

use crate::{
    engine::Connector,
    error::GroupError,
    membership::{MemberRole, MemberState, MembershipSnapshot},
    node::NodeHandle,
    poll::{poll_until, PollSettings},
    topology::ClusterTopology,
    COMMUNICATION_STACK, GROUP_REPLICATION_PLUGIN, PLUGIN_ACTIVE, SUPER_READ_ONLY_MESSAGE,
};
use futures::future::try_join_all;
use std::time::Duration;

/// Lifecycle of a [`ClusterOrchestrator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No protocol step ran yet.
    Uninitialized,
    /// The founder runs a group of one.
    Bootstrapped,
    /// Every node joined and is `ONLINE`.
    Joined,
    /// The membership matches the topology.
    Verified,
    /// A step failed; terminal.
    Failed,
}

/// Tuning of the orchestration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Polling used while waiting for members to become `ONLINE`.
    pub convergence: PollSettings,
    /// Polling used while waiting for a schema to replicate. The timeout is given per check.
    pub propagation: PollSettings,
    /// Issue all joins at once instead of one node after the other.
    pub parallel_joins: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            convergence: PollSettings::default(),
            propagation: PollSettings::default(),
            parallel_joins: false,
        }
    }
}

/// Drives one cluster through bootstrap, joins and verification.
pub struct ClusterOrchestrator<C: Connector> {
    topology: ClusterTopology,
    nodes: Vec<NodeHandle<C>>,
    settings: OrchestratorSettings,
    phase: Phase,
    failure: Option<GroupError>,
}

impl<C: Connector> ClusterOrchestrator<C> {
    /// Creates an orchestrator for the given nodes, which must be listed in topology order.
    pub fn new(
        topology: ClusterTopology,
        nodes: Vec<NodeHandle<C>>,
        settings: OrchestratorSettings,
    ) -> Result<Self, GroupError> {
        if nodes.len() != topology.node_count() {
            return Err(GroupError::Config(format!(
                "topology has {} members but {} nodes were given",
                topology.node_count(),
                nodes.len()
            )));
        }
        for (node, address) in nodes.iter().zip(topology.members()) {
            if node.address() != address {
                return Err(GroupError::Config(format!(
                    "node `{}` is listed where the topology expects `{}`",
                    node.address(),
                    address
                )));
            }
        }

        Ok(Self {
            topology,
            nodes,
            settings,
            phase: Phase::Uninitialized,
            failure: None,
        })
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The error that moved the orchestrator to [`Phase::Failed`].
    pub fn failure(&self) -> Option<&GroupError> {
        self.failure.as_ref()
    }

    /// The intended topology.
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// The nodes of the verified group, in topology order.
    pub fn nodes(&self) -> Result<&[NodeHandle<C>], GroupError> {
        self.require(Phase::Verified, "nodes")?;
        Ok(&self.nodes)
    }

    /// Runs the whole protocol: bootstrap, joins and verification.
    pub async fn form_group(&mut self) -> Result<(), GroupError> {
        self.bootstrap().await?;
        self.join_members().await?;
        self.verify().await
    }

    /// Prepares every node and bootstraps the group on the founder.
    ///
    /// Every node must report its provisioned server id, accept a transaction log reset
    /// that leaves no executed transactions behind, and not have the group replication
    /// plugin loaded yet. After installing the plugin everywhere, the founder bootstraps
    /// the group and must be its only, `ONLINE` primary.
    pub async fn bootstrap(&mut self) -> Result<(), GroupError> {
        self.require(Phase::Uninitialized, "bootstrap")?;
        let result = self.run_bootstrap().await;
        self.advance(result, Phase::Bootstrapped)
    }

    /// Joins the remaining nodes and waits until each of them is `ONLINE`.
    pub async fn join_members(&mut self) -> Result<(), GroupError> {
        self.require(Phase::Bootstrapped, "join_members")?;
        let result = self.run_joins().await;
        self.advance(result, Phase::Joined)
    }

    /// Checks the membership against the topology.
    pub async fn verify(&mut self) -> Result<(), GroupError> {
        self.require(Phase::Joined, "verify")?;
        let result = self.run_verification().await;
        self.advance(result, Phase::Verified)
    }

    /// Checks role, state, port and communication stack of a node as seen by the founder.
    pub async fn assert_role(&self, index: usize, expected: MemberRole) -> Result<(), GroupError> {
        self.require(Phase::Verified, "assert_role")?;
        let node = self.node(index)?;
        let snapshot = self.founder().read_membership().await?;
        let member = snapshot.get(node.address()).ok_or_else(|| {
            GroupError::mismatch(node.address(), "not listed in the founder's membership")
        })?;

        let mut problems = Vec::new();
        if member.role != Some(expected) {
            problems.push(format!(
                "role is {}, expected {}",
                member.role.map(MemberRole::as_str).unwrap_or("<none>"),
                expected
            ));
        }
        if member.state != MemberState::Online {
            problems.push(format!("state is {}, expected ONLINE", member.state));
        }
        if member.port != Some(self.topology.client_port()) {
            problems.push(format!(
                "port is {:?}, expected {}",
                member.port,
                self.topology.client_port()
            ));
        }
        if member.communication_stack != COMMUNICATION_STACK {
            problems.push(format!(
                "communication stack is `{}`, expected `{}`",
                member.communication_stack, COMMUNICATION_STACK
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GroupError::mismatch(node.address(), problems.join("; ")))
        }
    }

    /// Creates a schema on a node and checks that the node lists it afterwards.
    pub async fn assert_write_accepted(&self, index: usize, schema: &str) -> Result<(), GroupError> {
        self.require(Phase::Verified, "assert_write_accepted")?;
        let node = self.node(index)?;
        node.create_schema(schema).await?;
        if node.list_schemas().await?.contains(schema) {
            log::info!("Schema {} created on {}.", schema, node.address());
            Ok(())
        } else {
            Err(GroupError::mismatch(
                node.address(),
                format!("schema `{}` missing after it was created", schema),
            ))
        }
    }

    /// Tries to create a schema on a node that must refuse writes.
    ///
    /// Returns the engine's rejection message, which must be the super-read-only message.
    pub async fn assert_write_rejected(
        &self,
        index: usize,
        schema: &str,
    ) -> Result<String, GroupError> {
        self.require(Phase::Verified, "assert_write_rejected")?;
        let node = self.node(index)?;
        match node.create_schema(schema).await {
            Ok(()) => Err(GroupError::mismatch(
                node.address(),
                format!("schema `{}` was created on a read-only member", schema),
            )),
            Err(GroupError::WriteRejected { message, .. })
                if message == SUPER_READ_ONLY_MESSAGE =>
            {
                log::info!("{} rejected the write as expected.", node.address());
                Ok(message)
            }
            Err(GroupError::WriteRejected { message, .. }) => Err(GroupError::mismatch(
                node.address(),
                format!("unexpected rejection message `{}`", message),
            )),
            Err(err) => Err(err),
        }
    }

    /// Waits until every node other than `origin` lists the schema, polling at the
    /// propagation interval for at most `timeout`.
    pub async fn assert_propagated(
        &self,
        origin: usize,
        schema: &str,
        timeout: Duration,
    ) -> Result<(), GroupError> {
        self.require(Phase::Verified, "assert_propagated")?;
        self.node(origin)?;
        let settings = self.settings.propagation.with_timeout(timeout);

        try_join_all(
            self.nodes
                .iter()
                .enumerate()
                .filter(|&(index, _)| index != origin)
                .map(|(_, node)| async move {
                    let condition = format!("schema `{}` to reach {}", schema, node.address());
                    poll_until(settings, &condition, move || async move {
                        Ok::<_, GroupError>(node.list_schemas().await?.contains(schema).then_some(()))
                    })
                    .await
                }),
        )
        .await?;
        log::info!("Schema {} replicated to all members.", schema);
        Ok(())
    }

    /// Checks that no node lists the schema.
    pub async fn assert_schema_absent(&self, schema: &str) -> Result<(), GroupError> {
        self.require(Phase::Verified, "assert_schema_absent")?;
        for node in &self.nodes {
            if node.list_schemas().await?.contains(schema) {
                return Err(GroupError::mismatch(
                    node.address(),
                    format!("schema `{}` exists already", schema),
                ));
            }
        }
        Ok(())
    }

    /// Reads the membership as seen by the founder.
    pub async fn membership(&self) -> Result<MembershipSnapshot, GroupError> {
        self.refuse_if_failed()?;
        self.founder().read_membership().await
    }

    async fn run_bootstrap(&self) -> Result<(), GroupError> {
        log::info!(
            "Preparing {} nodes for group {}.",
            self.nodes.len(),
            self.topology.group_name()
        );
        try_join_all(self.nodes.iter().map(reset_node)).await?;
        try_join_all(self.nodes.iter().map(install_module)).await?;

        let founder = self.founder();
        founder.bootstrap_group().await?;

        let condition = format!("founder {} to run the group alone", founder.address());
        let snapshot = poll_until(self.settings.convergence, &condition, move || async move {
            let snapshot = founder.read_membership().await?;
            Ok::<_, GroupError>(founder_is_alone(&snapshot, founder.address()).then_some(snapshot))
        })
        .await;
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(GroupError::ConvergenceTimeout { .. }) => {
                let snapshot = founder.read_membership().await?;
                return Err(GroupError::mismatch(
                    founder.address(),
                    format!(
                        "expected the founder as only ONLINE primary, found [{}]",
                        describe(&snapshot)
                    ),
                ));
            }
            Err(err) => return Err(err),
        };

        log::info!("Group bootstrapped: {}", describe(&snapshot));
        Ok(())
    }

    async fn run_joins(&self) -> Result<(), GroupError> {
        let joiners = &self.nodes[1..];
        if self.settings.parallel_joins {
            try_join_all(joiners.iter().map(|node| node.join_group())).await?;
            try_join_all(joiners.iter().map(|node| self.await_online(node))).await?;
        } else {
            for node in joiners {
                node.join_group().await?;
                self.await_online(node).await?;
            }
        }
        Ok(())
    }

    async fn await_online(&self, node: &NodeHandle<C>) -> Result<(), GroupError> {
        let founder = self.founder();
        let condition = format!("{} to be ONLINE", node.address());
        poll_until(self.settings.convergence, &condition, move || async move {
            let snapshot = founder.read_membership().await?;
            if let Some(member) = snapshot.get(node.address()) {
                if member.state == MemberState::Error {
                    return Err(GroupError::mismatch(
                        node.address(),
                        "member entered ERROR state while joining",
                    ));
                }
            }
            Ok::<_, GroupError>(snapshot.is_online(node.address()).then_some(()))
        })
        .await?;
        log::info!("Node {} is ONLINE.", node.address());
        Ok(())
    }

    async fn run_verification(&self) -> Result<(), GroupError> {
        let founder = self.founder();
        let snapshot = founder.read_membership().await?;
        snapshot
            .check_converged(self.topology.members(), self.topology.mode())
            .map_err(|detail| GroupError::mismatch(founder.address(), detail))?;

        for member in snapshot.members() {
            log::info!("{}", member);
        }
        Ok(())
    }

    fn founder(&self) -> &NodeHandle<C> {
        &self.nodes[0]
    }

    fn node(&self, index: usize) -> Result<&NodeHandle<C>, GroupError> {
        self.nodes.get(index).ok_or(GroupError::UnknownNode(index))
    }

    fn refuse_if_failed(&self) -> Result<(), GroupError> {
        match &self.failure {
            Some(cause) => Err(cause.clone()),
            None => Ok(()),
        }
    }

    fn require(&self, phase: Phase, operation: &'static str) -> Result<(), GroupError> {
        self.refuse_if_failed()?;
        if self.phase == phase {
            Ok(())
        } else {
            Err(GroupError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn advance(&mut self, result: Result<(), GroupError>, next: Phase) -> Result<(), GroupError> {
        match result {
            Ok(()) => {
                log::info!("Cluster reached phase {:?}.", next);
                self.phase = next;
                Ok(())
            }
            Err(err) => {
                log::error!("Cluster formation failed in phase {:?}: {}", self.phase, err);
                self.phase = Phase::Failed;
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }
}

async fn reset_node<C: Connector>(node: &NodeHandle<C>) -> Result<(), GroupError> {
    let identity = node.identity().await?;
    if identity != node.server_id() {
        return Err(GroupError::Precondition {
            node: node.address().to_owned(),
            violation: format!(
                "reports server id {}, provisioned as {}",
                identity,
                node.server_id()
            ),
        });
    }

    node.reset_transaction_log().await?;
    let executed = node.executed_transactions().await?;
    if !executed.is_empty() {
        return Err(GroupError::Precondition {
            node: node.address().to_owned(),
            violation: format!("transactions left after reset: {}", executed),
        });
    }
    Ok(())
}

async fn install_module<C: Connector>(node: &NodeHandle<C>) -> Result<(), GroupError> {
    if node.has_group_replication_module().await? {
        return Err(GroupError::AlreadyInstalled {
            node: node.address().to_owned(),
        });
    }
    node.install_group_replication_module().await?;

    let modules = node.list_installed_modules().await?;
    match modules.get(GROUP_REPLICATION_PLUGIN).map(String::as_str) {
        Some(PLUGIN_ACTIVE) => Ok(()),
        status => Err(GroupError::mismatch(
            node.address(),
            format!(
                "group replication plugin status is {}",
                status.unwrap_or("<not installed>")
            ),
        )),
    }
}

fn founder_is_alone(snapshot: &MembershipSnapshot, founder: &str) -> bool {
    snapshot.len() == 1
        && snapshot.get(founder).map_or(false, |member| {
            member.state == MemberState::Online && member.role == Some(MemberRole::Primary)
        })
}

fn describe(snapshot: &MembershipSnapshot) -> String {
    snapshot
        .members()
        .map(|member| {
            format!(
                "{} {} {}",
                member.address,
                member.state,
                member.role.map(MemberRole::as_str).unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::PoolSettings,
        sim::{SimulatedConnector, SimulatedGroup},
        topology::{GroupMode, DEFAULT_GROUP_NAME},
    };
    use pretty_assertions::assert_eq;

    fn topology(mode: GroupMode, nodes: usize) -> ClusterTopology {
        let members = (1..=nodes).map(|i| format!("node{}", i)).collect();
        ClusterTopology::new(mode, DEFAULT_GROUP_NAME, members).unwrap()
    }

    async fn orchestrator(
        topology: ClusterTopology,
    ) -> (SimulatedGroup, ClusterOrchestrator<SimulatedConnector>) {
        let group = SimulatedGroup::new(&topology);
        let nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        let orchestrator =
            ClusterOrchestrator::new(topology, nodes, OrchestratorSettings::default()).unwrap();
        (group, orchestrator)
    }

    #[tokio::test(start_paused = true)]
    async fn phases_advance_in_order() {
        let (_group, mut orchestrator) = orchestrator(topology(GroupMode::SinglePrimary, 3)).await;
        assert_eq!(orchestrator.phase(), Phase::Uninitialized);

        orchestrator.bootstrap().await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Bootstrapped);
        assert_eq!(orchestrator.membership().await.unwrap().len(), 1);

        orchestrator.join_members().await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Joined);

        orchestrator.verify().await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Verified);
        assert_eq!(orchestrator.nodes().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_before_verification_are_refused() {
        let (_group, mut orchestrator) = orchestrator(topology(GroupMode::SinglePrimary, 2)).await;

        assert_eq!(
            orchestrator.verify().await.unwrap_err(),
            GroupError::InvalidPhase {
                operation: "verify",
                phase: Phase::Uninitialized,
            }
        );
        assert!(matches!(
            orchestrator.assert_role(0, MemberRole::Primary).await,
            Err(GroupError::InvalidPhase { .. })
        ));
        assert!(orchestrator.nodes().is_err());
        // a refused call is not a failed step
        assert_eq!(orchestrator.phase(), Phase::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_orchestrator_keeps_the_cause() {
        let (group, mut orchestrator) = orchestrator(topology(GroupMode::SinglePrimary, 2)).await;
        group.inject_failure(
            "node1",
            crate::node::sql::START_GROUP_REPLICATION,
            3092,
            "The server is not configured properly to be an active member of the group.",
        );

        let err = orchestrator.form_group().await.unwrap_err();
        assert!(matches!(err, GroupError::ProtocolStep { .. }));
        assert_eq!(orchestrator.phase(), Phase::Failed);
        assert_eq!(orchestrator.failure(), Some(&err));

        assert_eq!(orchestrator.join_members().await.unwrap_err(), err);
        assert_eq!(orchestrator.membership().await.unwrap_err(), err);
    }

    #[tokio::test(start_paused = true)]
    async fn preinstalled_module_is_a_precondition_failure() {
        let (group, mut orchestrator) = orchestrator(topology(GroupMode::MultiPrimary, 2)).await;
        group.preinstall_module("node2");

        let err = orchestrator.bootstrap().await.unwrap_err();
        assert_eq!(
            err,
            GroupError::AlreadyInstalled {
                node: "node2".into()
            }
        );
        assert_eq!(orchestrator.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_server_id_is_a_precondition_failure() {
        let topology = topology(GroupMode::SinglePrimary, 2);
        let group = SimulatedGroup::new(&topology);
        let mut nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        nodes[1] = NodeHandle::connect(7, group.connector(1), PoolSettings::default())
            .await
            .unwrap();

        let mut orchestrator =
            ClusterOrchestrator::new(topology, nodes, OrchestratorSettings::default()).unwrap();
        let err = orchestrator.bootstrap().await.unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_join_times_out() {
        let topology = topology(GroupMode::SinglePrimary, 3);
        let group = SimulatedGroup::new(&topology);
        group.stall_recovery("node3");
        let nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        let settings = OrchestratorSettings {
            convergence: PollSettings::new(Duration::from_millis(250), Duration::from_secs(5)),
            ..Default::default()
        };
        let mut orchestrator = ClusterOrchestrator::new(topology, nodes, settings).unwrap();

        let err = orchestrator.form_group().await.unwrap_err();
        assert_eq!(
            err,
            GroupError::ConvergenceTimeout {
                condition: "node3 to be ONLINE".into(),
                waited: Duration::from_secs(5),
            }
        );
        assert_eq!(orchestrator.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_in_error_fails_without_waiting_for_the_timeout() {
        let topology = topology(GroupMode::SinglePrimary, 2);
        let group = SimulatedGroup::new(&topology);
        group.fail_recovery("node2");
        let nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        let settings = OrchestratorSettings {
            convergence: PollSettings::new(Duration::from_millis(250), Duration::from_secs(60)),
            ..Default::default()
        };
        let mut orchestrator = ClusterOrchestrator::new(topology, nodes, settings).unwrap();

        let started = tokio::time::Instant::now();
        let err = orchestrator.form_group().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            err,
            GroupError::Mismatch {
                node: "node2".into(),
                detail: "member entered ERROR state while joining".into(),
            }
        );
        assert_eq!(orchestrator.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn founder_that_never_comes_online_fails_the_bootstrap() {
        let topology = topology(GroupMode::SinglePrimary, 2);
        let group = SimulatedGroup::new(&topology);
        group.stall_recovery("node1");
        let nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        let settings = OrchestratorSettings {
            convergence: PollSettings::new(Duration::from_millis(250), Duration::from_secs(5)),
            ..Default::default()
        };
        let mut orchestrator = ClusterOrchestrator::new(topology, nodes, settings).unwrap();

        let err = orchestrator.bootstrap().await.unwrap_err();
        assert_eq!(
            err,
            GroupError::Mismatch {
                node: "node1".into(),
                detail: "expected the founder as only ONLINE primary, found [node1 RECOVERING PRIMARY]"
                    .into(),
            }
        );
        assert_eq!(orchestrator.phase(), Phase::Failed);
        assert_eq!(orchestrator.failure(), Some(&err));
    }

    #[tokio::test]
    async fn mismatched_nodes_are_rejected() {
        let topology = topology(GroupMode::SinglePrimary, 2);
        let group = SimulatedGroup::new(&topology);
        let mut nodes = group.node_handles(PoolSettings::default()).await.unwrap();
        nodes.reverse();

        assert!(matches!(
            ClusterOrchestrator::new(topology.clone(), nodes, OrchestratorSettings::default()),
            Err(GroupError::Config(_))
        ));
        assert!(matches!(
            ClusterOrchestrator::<SimulatedConnector>::new(
                topology,
                Vec::new(),
                OrchestratorSettings::default()
            ),
            Err(GroupError::Config(_))
        ));
    }
}
