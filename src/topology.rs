//! The intended shape of a replication group.

use crate::{
    error::GroupError, membership::MemberRole, DEFAULT_CLIENT_PORT, DEFAULT_COMMUNICATION_PORT,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Group name used when none is configured.
pub const DEFAULT_GROUP_NAME: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

/// Whether one or all members of the group accept writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupMode {
    /// The founder accepts writes, every other member is read-only.
    SinglePrimary,
    /// Every member accepts writes.
    MultiPrimary,
}

impl GroupMode {
    /// The role the member at the given topology position holds once the group is stable.
    pub fn expected_role(self, index: usize) -> MemberRole {
        match self {
            Self::SinglePrimary if index > 0 => MemberRole::Secondary,
            _ => MemberRole::Primary,
        }
    }
}

/// Members, mode and addressing of a group.
///
/// The first member is the founder that bootstraps the group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    mode: GroupMode,
    group_name: String,
    members: Vec<String>,
    seeds: Option<Vec<String>>,
    client_port: u16,
    communication_port: u16,
}

impl ClusterTopology {
    /// Creates a topology for the given member addresses, in bootstrap order.
    pub fn new(
        mode: GroupMode,
        group_name: impl Into<String>,
        members: Vec<String>,
    ) -> Result<Self, GroupError> {
        let group_name = group_name.into();
        uuid::Uuid::parse_str(&group_name).map_err(|e| {
            GroupError::Config(format!("group name `{}` is not a UUID: {}", group_name, e))
        })?;
        if members.is_empty() {
            return Err(GroupError::Config("a group needs at least one member".into()));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = members.iter().find(|m| !seen.insert(m.as_str())) {
            return Err(GroupError::Config(format!(
                "member `{}` is listed twice",
                duplicate
            )));
        }

        Ok(Self {
            mode,
            group_name,
            members,
            seeds: None,
            client_port: DEFAULT_CLIENT_PORT,
            communication_port: DEFAULT_COMMUNICATION_PORT,
        })
    }

    /// Replaces the seed list that is derived from the member addresses.
    pub fn with_seeds(mut self, seeds: Vec<String>) -> Result<Self, GroupError> {
        if seeds.is_empty() {
            return Err(GroupError::Config("the seed list must not be empty".into()));
        }
        self.seeds = Some(seeds);
        Ok(self)
    }

    /// Sets the client port and the group communication port of all members.
    pub fn with_ports(mut self, client_port: u16, communication_port: u16) -> Self {
        self.client_port = client_port;
        self.communication_port = communication_port;
        self
    }

    /// Number of members.
    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    /// The group mode.
    pub fn mode(&self) -> GroupMode {
        self.mode
    }

    /// Returns true in single-primary mode.
    pub fn is_single_primary(&self) -> bool {
        self.mode == GroupMode::SinglePrimary
    }

    /// The UUID shared by all members of the group.
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Member addresses in bootstrap order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Address of the member at the given position.
    pub fn address(&self, index: usize) -> Option<&str> {
        self.members.get(index).map(String::as_str)
    }

    /// Port on which members accept client sessions.
    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Port of the group communication endpoint of every member.
    pub fn communication_port(&self) -> u16 {
        self.communication_port
    }

    /// Group communication endpoints through which members find each other.
    pub fn group_seeds(&self) -> Vec<String> {
        match &self.seeds {
            Some(seeds) => seeds.clone(),
            None => self
                .members
                .iter()
                .map(|member| format!("{}:{}", member, self.communication_port))
                .collect(),
        }
    }

    /// Server options an instance has to be started with to take the given position.
    pub fn server_options(&self, index: usize, server_id: u32) -> Result<Vec<String>, GroupError> {
        let address = self.address(index).ok_or(GroupError::UnknownNode(index))?;
        let (single_primary, update_everywhere) = match self.mode {
            GroupMode::SinglePrimary => ("ON", "OFF"),
            GroupMode::MultiPrimary => ("OFF", "ON"),
        };

        Ok(vec![
            format!("--server-id={}", server_id),
            "--log-bin=mysql-bin-1.log".into(),
            "--relay-log=relay-bin.log".into(),
            "--enforce-gtid-consistency=ON".into(),
            "--log-slave-updates=ON".into(),
            "--gtid-mode=ON".into(),
            "--transaction-write-set-extraction=XXHASH64".into(),
            "--binlog-checksum=NONE".into(),
            "--master-info-repository=TABLE".into(),
            "--relay-log-info-repository=TABLE".into(),
            "--relay-log-recovery=ON".into(),
            "--loose-group-replication-start-on-boot=OFF".into(),
            format!("--loose-group-replication-group-name={}", self.group_name),
            format!(
                "--loose-group-replication-local-address={}:{}",
                address, self.communication_port
            ),
            format!(
                "--loose-group-replication-group-seeds={}",
                self.group_seeds().join(",")
            ),
            format!(
                "--loose-group-replication-single-primary-mode={}",
                single_primary
            ),
            format!(
                "--loose-group-replication-enforce-update-everywhere-checks={}",
                update_everywhere
            ),
        ])
    }
}
