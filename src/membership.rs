//! Point-in-time views of the group membership, as reported by one member.

use crate::{engine::Row, topology::GroupMode};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Lifecycle state of a group member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Not running the group protocol.
    Offline,
    /// Catching up with the group before serving.
    Recovering,
    /// Fully synchronized member.
    Online,
    /// The member failed and left the protocol.
    Error,
    /// Suspected by the local failure detector.
    Unreachable,
}

impl MemberState {
    /// The spelling used by the engine.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Recovering => "RECOVERING",
            Self::Online => "ONLINE",
            Self::Error => "ERROR",
            Self::Unreachable => "UNREACHABLE",
        }
    }
}

impl FromStr for MemberState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(Self::Offline),
            "RECOVERING" => Ok(Self::Recovering),
            "ONLINE" => Ok(Self::Online),
            "ERROR" => Ok(Self::Error),
            "UNREACHABLE" => Ok(Self::Unreachable),
            other => Err(format!("unknown member state `{}`", other)),
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a member within the group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberRole {
    /// Accepts writes.
    Primary,
    /// Read-only member of a single-primary group.
    Secondary,
}

impl MemberRole {
    /// The spelling used by the engine.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
        }
    }
}

impl FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            other => Err(format!("unknown member role `{}`", other)),
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `performance_schema.replication_group_members`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    /// Server UUID of the member.
    pub id: String,
    /// Replication channel the row belongs to.
    pub channel_name: String,
    /// Host name under which the member is known to the group.
    pub address: String,
    /// Client port, if the member reports one.
    pub port: Option<u16>,
    /// Member state.
    pub state: MemberState,
    /// Member role; `None` while the member is not part of a running group.
    pub role: Option<MemberRole>,
    /// Engine version of the member.
    pub version: String,
    /// Group communication stack, e.g. `XCom`.
    pub communication_stack: String,
}

impl MemberRecord {
    /// Parses a row returned by the membership query.
    pub fn from_row(row: &Row) -> Result<Self, String> {
        let text = |column: &str| row.get(column).unwrap_or_default().to_owned();

        let state = row
            .get("MEMBER_STATE")
            .ok_or("missing column MEMBER_STATE")?
            .parse::<MemberState>()?;
        let role = match row.get("MEMBER_ROLE") {
            None | Some("") => None,
            Some(role) => Some(role.parse::<MemberRole>()?),
        };
        let port = match row.get("MEMBER_PORT") {
            None | Some("") => None,
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|e| format!("invalid MEMBER_PORT `{}`: {}", port, e))?,
            ),
        };
        let address = text("MEMBER_HOST");
        if address.is_empty() {
            return Err("missing column MEMBER_HOST".into());
        }

        Ok(Self {
            id: text("MEMBER_ID"),
            channel_name: text("CHANNEL_NAME"),
            address,
            port,
            state,
            role,
            version: text("MEMBER_VERSION"),
            communication_stack: text("MEMBER_COMMUNICATION_STACK"),
        })
    }
}

impl fmt::Display for MemberRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] port={} state={} role={} version={} stack={}",
            self.address,
            self.id,
            self.port.map(|p| p.to_string()).unwrap_or_default(),
            self.state,
            self.role.map(MemberRole::as_str).unwrap_or(""),
            self.version,
            self.communication_stack,
        )
    }
}

/// The members of a group as seen by one node at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    members: BTreeMap<String, MemberRecord>,
}

impl MembershipSnapshot {
    /// Builds a snapshot from the rows of the membership query.
    ///
    /// The `OFFLINE` row without member id and host that an instance reports before it ever
    /// ran the group protocol describes no member and is skipped.
    pub fn from_rows(rows: &[Row]) -> Result<Self, String> {
        rows.iter()
            .filter(|row| !is_placeholder(row))
            .map(MemberRecord::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from_records)
    }

    /// Builds a snapshot from already parsed records, keyed by their address.
    pub fn from_records(records: impl IntoIterator<Item = MemberRecord>) -> Self {
        Self {
            members: records
                .into_iter()
                .map(|record| (record.address.clone(), record))
                .collect(),
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if no member is known.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Looks up a member by address.
    pub fn get(&self, address: &str) -> Option<&MemberRecord> {
        self.members.get(address)
    }

    /// Iterates over the members, ordered by address.
    pub fn members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    /// Returns true if the given address is listed as `ONLINE`.
    pub fn is_online(&self, address: &str) -> bool {
        self.get(address)
            .map_or(false, |member| member.state == MemberState::Online)
    }

    /// Number of members holding the given role.
    pub fn count_role(&self, role: MemberRole) -> usize {
        self.members()
            .filter(|member| member.role == Some(role))
            .count()
    }

    /// Checks that the snapshot shows exactly the given members, all `ONLINE`, with the role
    /// distribution that the mode prescribes.
    ///
    /// `expected` lists the addresses in topology order; in single-primary mode the first one
    /// must be the primary.
    pub fn check_converged(&self, expected: &[String], mode: GroupMode) -> Result<(), String> {
        if self.len() != expected.len() {
            return Err(format!(
                "expected {} members, found {}: [{}]",
                expected.len(),
                self.len(),
                self.members
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        for (index, address) in expected.iter().enumerate() {
            let member = self
                .get(address)
                .ok_or_else(|| format!("member `{}` is missing", address))?;
            if member.state != MemberState::Online {
                return Err(format!("member `{}` is {}", address, member.state));
            }
            let role = mode.expected_role(index);
            if member.role != Some(role) {
                return Err(format!(
                    "member `{}` has role {}, expected {}",
                    address,
                    member.role.map(MemberRole::as_str).unwrap_or("<none>"),
                    role
                ));
            }
        }
        if mode == GroupMode::SinglePrimary && self.count_role(MemberRole::Primary) != 1 {
            return Err(format!(
                "expected exactly one primary, found {}",
                self.count_role(MemberRole::Primary)
            ));
        }
        Ok(())
    }
}

fn is_placeholder(row: &Row) -> bool {
    row.get("MEMBER_ID").unwrap_or_default().is_empty()
        && row.get("MEMBER_HOST").unwrap_or_default().is_empty()
        && row.get("MEMBER_STATE") == Some(MemberState::Offline.as_str())
}
