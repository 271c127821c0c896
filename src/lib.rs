#![warn(missing_docs)]

//! Bootstraps a MySQL group replication cluster and verifies that it converged.
//!
//! The crate drives already-provisioned MySQL instances through the administrative protocol
//! that forms a replication group: one instance bootstraps the group as its founder, the
//! remaining instances join it, and the [`ClusterOrchestrator`] polls the group membership
//! until it matches the intended [`ClusterTopology`]. Once the group is verified, scenario
//! code can check write gating and schema propagation through the orchestrator.
//!
//! ## Usage Example
//!
//! 1. Start one MySQL 8.0 instance per member with the options returned by
//!    [`ClusterTopology::server_options`] (`cargo run --bin gr-verify -- cluster.yml
//!    --print-server-options` prints them).
//! 2. `cargo run --bin gr-verify -- cluster.yml` connects to every instance, forms the group
//!    and runs the scenario for the configured [`GroupMode`].
//!
//! The [`sim`] module provides an in-memory engine that speaks the same command set, which
//! is what the test suite runs against.

pub use engine::{CommandChannel, CommandError, Connector, Row};
pub use error::{ConnectionError, GroupError};
pub use membership::{MemberRecord, MemberRole, MemberState, MembershipSnapshot};
pub use node::{NodeHandle, ProtocolStep};
pub use orchestrator::{ClusterOrchestrator, OrchestratorSettings, Phase};
pub use poll::PollSettings;
pub use pool::{ConnectionPool, PoolSettings, PooledChannel};
pub use topology::{ClusterTopology, GroupMode};

pub mod config;
pub mod engine;
pub mod error;
pub mod membership;
pub mod mysql;
pub mod node;
pub mod orchestrator;
pub mod poll;
pub mod pool;
pub mod scenario;
pub mod sim;
pub mod topology;

/// Message the engine returns for any write issued against a super-read-only member.
pub const SUPER_READ_ONLY_MESSAGE: &str =
    "The MySQL server is running with the --super-read-only option so it cannot execute this statement";

/// Name of the group replication plugin.
pub const GROUP_REPLICATION_PLUGIN: &str = "group_replication";

/// Status reported by `SHOW PLUGINS` for a loaded plugin.
pub const PLUGIN_ACTIVE: &str = "ACTIVE";

/// Port on which members accept client connections.
pub const DEFAULT_CLIENT_PORT: u16 = 3306;

/// Port of the group communication endpoint used in seeds and local addresses.
pub const DEFAULT_COMMUNICATION_PORT: u16 = 33061;

/// Communication stack reported by members of a group using the default XCom protocol.
pub const COMMUNICATION_STACK: &str = "XCom";

/// Channel through which joining members recover missing transactions.
pub const RECOVERY_CHANNEL: &str = "group_replication_recovery";

/// User created on the founder for distributed recovery.
pub const REPLICATION_USER: &str = "repl";
