//! Administrative command surface of a single instance.

use crate::{
    engine::{CommandChannel, CommandError, Connector, Row},
    error::{ConnectionError, GroupError},
    membership::{MemberState, MembershipSnapshot},
    pool::{ConnectionPool, PoolSettings, PooledChannel},
    GROUP_REPLICATION_PLUGIN, SUPER_READ_ONLY_MESSAGE,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Statements sent by [`NodeHandle`].
pub mod sql {
    /// Reads the configured server id.
    pub const SERVER_ID: &str = "SELECT @@server_id AS SERVER_ID";
    /// Reads the set of executed transaction identifiers.
    pub const GTID_EXECUTED: &str = "SELECT @@GLOBAL.gtid_executed AS GTID_EXECUTED";
    /// Clears the binary log and the executed transaction identifiers.
    pub const RESET_MASTER: &str = "RESET MASTER";
    /// Loads the group replication plugin.
    pub const INSTALL_PLUGIN: &str =
        "INSTALL PLUGIN group_replication SONAME 'group_replication.so'";
    /// Lists the installed plugins.
    pub const SHOW_PLUGINS: &str = "SHOW PLUGINS";
    /// Lists the schemas.
    pub const SHOW_DATABASES: &str = "SHOW DATABASES";
    /// Reads the group membership as seen by the node.
    pub const GROUP_MEMBERS: &str = "SELECT * FROM performance_schema.replication_group_members";
    /// Prefix of the schema creation statement.
    pub const CREATE_DATABASE: &str = "CREATE DATABASE ";

    /// Lets the next `START GROUP_REPLICATION` create a new group.
    pub const ENABLE_BOOTSTRAP: &str = "SET @@GLOBAL.group_replication_bootstrap_group=1";
    /// Creates the user used for distributed recovery.
    pub const CREATE_REPLICATION_USER: &str = "CREATE USER 'repl'@'%'";
    /// Allows the recovery user to stream transactions.
    pub const GRANT_REPLICATION: &str = "GRANT REPLICATION SLAVE ON *.* TO 'repl'@'%'";
    /// Applies the privilege changes.
    pub const FLUSH_PRIVILEGES: &str = "FLUSH PRIVILEGES";
    /// Sets the credentials of the recovery channel.
    pub const CONFIGURE_RECOVERY: &str =
        "CHANGE MASTER TO MASTER_USER='repl' FOR CHANNEL 'group_replication_recovery'";
    /// Starts the group protocol on the node.
    pub const START_GROUP_REPLICATION: &str = "START GROUP_REPLICATION";
    /// Restores the bootstrap flag once the group exists.
    pub const DISABLE_BOOTSTRAP: &str = "SET @@GLOBAL.group_replication_bootstrap_group=0";
}

/// Engine error code for an already loaded plugin.
const ER_UDF_EXISTS: u16 = 1125;
/// Engine error code for statements forbidden by a server option such as super-read-only.
const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;

/// One sub-step of bootstrapping or joining a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolStep {
    /// Enable the bootstrap flag.
    EnableBootstrap,
    /// Create the replication user.
    CreateReplicationUser,
    /// Grant the replication privilege.
    GrantReplication,
    /// Apply the privilege changes.
    FlushPrivileges,
    /// Configure the recovery channel credentials.
    ConfigureRecoveryChannel,
    /// Start the group protocol.
    StartGroupReplication,
    /// Disable the bootstrap flag.
    DisableBootstrap,
}

impl ProtocolStep {
    /// Steps run by the founder, in order.
    pub const BOOTSTRAP: [ProtocolStep; 7] = [
        Self::EnableBootstrap,
        Self::CreateReplicationUser,
        Self::GrantReplication,
        Self::FlushPrivileges,
        Self::ConfigureRecoveryChannel,
        Self::StartGroupReplication,
        Self::DisableBootstrap,
    ];

    /// Steps run by every joining member, in order.
    pub const JOIN: [ProtocolStep; 2] =
        [Self::ConfigureRecoveryChannel, Self::StartGroupReplication];

    /// The statement that performs this step.
    pub fn statement(self) -> &'static str {
        match self {
            Self::EnableBootstrap => sql::ENABLE_BOOTSTRAP,
            Self::CreateReplicationUser => sql::CREATE_REPLICATION_USER,
            Self::GrantReplication => sql::GRANT_REPLICATION,
            Self::FlushPrivileges => sql::FLUSH_PRIVILEGES,
            Self::ConfigureRecoveryChannel => sql::CONFIGURE_RECOVERY,
            Self::StartGroupReplication => sql::START_GROUP_REPLICATION,
            Self::DisableBootstrap => sql::DISABLE_BOOTSTRAP,
        }
    }
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EnableBootstrap => "enabling the bootstrap flag",
            Self::CreateReplicationUser => "creating the replication user",
            Self::GrantReplication => "granting the replication privilege",
            Self::FlushPrivileges => "flushing privileges",
            Self::ConfigureRecoveryChannel => "configuring the recovery channel",
            Self::StartGroupReplication => "starting group replication",
            Self::DisableBootstrap => "disabling the bootstrap flag",
        };
        f.write_str(name)
    }
}

/// Handle to one provisioned instance.
///
/// Every operation leases a session from the node's own pool, sends one administrative
/// action and returns the session, whatever the outcome.
pub struct NodeHandle<C: Connector> {
    server_id: u32,
    address: String,
    pool: ConnectionPool<C>,
}

impl<C: Connector> NodeHandle<C> {
    /// Wraps an existing pool.
    pub fn new(server_id: u32, pool: ConnectionPool<C>) -> Self {
        Self {
            server_id,
            address: pool.address().to_owned(),
            pool,
        }
    }

    /// Creates the pool for the given connector and opens the first session.
    pub async fn connect(
        server_id: u32,
        connector: C,
        settings: PoolSettings,
    ) -> Result<Self, GroupError> {
        let pool = ConnectionPool::new(connector, settings)?;
        pool.warm_up().await?;
        Ok(Self::new(server_id, pool))
    }

    /// The server id assigned at provisioning.
    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    /// The address under which peers reach this node.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The pool of this node.
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Reads the server id the instance is configured with.
    pub async fn identity(&self) -> Result<u32, GroupError> {
        let rows = self.query(sql::SERVER_ID).await?;
        let value = self.single_value(&rows, sql::SERVER_ID, "SERVER_ID")?;
        value.parse::<u32>().map_err(|e| {
            GroupError::mismatch(&self.address, format!("invalid server id `{}`: {}", value, e))
        })
    }

    /// Reads the executed transaction identifiers; empty for a pristine log.
    pub async fn executed_transactions(&self) -> Result<String, GroupError> {
        let rows = self.query(sql::GTID_EXECUTED).await?;
        Ok(self
            .single_value(&rows, sql::GTID_EXECUTED, "GTID_EXECUTED")?
            .to_owned())
    }

    /// Clears the locally recorded transactions.
    ///
    /// Refused while the node takes part in a group.
    pub async fn reset_transaction_log(&self) -> Result<(), GroupError> {
        let snapshot = self.read_membership().await?;
        if let Some(member) = snapshot
            .get(&self.address)
            .filter(|member| member.state != MemberState::Offline)
        {
            return Err(GroupError::Precondition {
                node: self.address.clone(),
                violation: format!(
                    "transaction log cannot be reset while the node is {} in a group",
                    member.state
                ),
            });
        }
        self.execute(sql::RESET_MASTER).await
    }

    /// Loads the group replication plugin.
    ///
    /// Fails with [`GroupError::AlreadyInstalled`] if the plugin is loaded already.
    pub async fn install_group_replication_module(&self) -> Result<(), GroupError> {
        let mut channel = self.pool.acquire().await?;
        let result = channel.execute(sql::INSTALL_PLUGIN).await;
        match self.settle(channel, result) {
            Ok(()) => Ok(()),
            Err(CommandError::Server { code, .. }) if code == ER_UDF_EXISTS => {
                Err(GroupError::AlreadyInstalled {
                    node: self.address.clone(),
                })
            }
            Err(source) => Err(self.command_error(sql::INSTALL_PLUGIN, source)),
        }
    }

    /// Creates a new group with this node as its only member.
    pub async fn bootstrap_group(&self) -> Result<(), GroupError> {
        log::info!("Bootstrapping group on {}.", self.address);
        self.run_steps(&ProtocolStep::BOOTSTRAP).await
    }

    /// Joins the group reachable through the configured seeds.
    pub async fn join_group(&self) -> Result<(), GroupError> {
        log::info!("Node {} joining group.", self.address);
        self.run_steps(&ProtocolStep::JOIN).await
    }

    /// Creates a schema.
    ///
    /// A node that does not accept writes answers with [`GroupError::WriteRejected`].
    pub async fn create_schema(&self, name: &str) -> Result<(), GroupError> {
        let statement = format!("{}{}", sql::CREATE_DATABASE, quote_identifier(name));
        let mut channel = self.pool.acquire().await?;
        let result = channel.execute(&statement).await;
        match self.settle(channel, result) {
            Ok(()) => Ok(()),
            Err(CommandError::Server { code, message })
                if code == ER_OPTION_PREVENTS_STATEMENT || message == SUPER_READ_ONLY_MESSAGE =>
            {
                Err(GroupError::WriteRejected {
                    node: self.address.clone(),
                    message,
                })
            }
            Err(source) => Err(self.command_error(&statement, source)),
        }
    }

    /// Lists the schema names.
    pub async fn list_schemas(&self) -> Result<BTreeSet<String>, GroupError> {
        let rows = self.query(sql::SHOW_DATABASES).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("Database"))
            .map(str::to_owned)
            .collect())
    }

    /// Lists the installed plugins and their status.
    pub async fn list_installed_modules(&self) -> Result<BTreeMap<String, String>, GroupError> {
        let rows = self.query(sql::SHOW_PLUGINS).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get("Name")?;
                Some((name.to_owned(), row.get("Status").unwrap_or_default().to_owned()))
            })
            .collect())
    }

    /// Returns true if the group replication plugin is installed.
    pub async fn has_group_replication_module(&self) -> Result<bool, GroupError> {
        Ok(self
            .list_installed_modules()
            .await?
            .contains_key(GROUP_REPLICATION_PLUGIN))
    }

    /// Reads the group membership as currently seen by this node.
    pub async fn read_membership(&self) -> Result<MembershipSnapshot, GroupError> {
        let rows = self.query(sql::GROUP_MEMBERS).await?;
        MembershipSnapshot::from_rows(&rows).map_err(|detail| {
            GroupError::mismatch(&self.address, format!("unreadable membership: {}", detail))
        })
    }

    /// Ends all idle sessions of this node.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_steps(&self, steps: &[ProtocolStep]) -> Result<(), GroupError> {
        let mut channel = self.pool.acquire().await?;
        for &step in steps {
            log::trace!("{}: {}", self.address, step.statement());
            if let Err(source) = channel.execute(step.statement()).await {
                if matches!(source, CommandError::Transport(_)) {
                    channel.discard();
                } else {
                    channel.release();
                }
                log::error!("{} failed on {}: {}", step, self.address, source);
                return Err(GroupError::ProtocolStep {
                    node: self.address.clone(),
                    step,
                    source,
                });
            }
        }
        channel.release();
        Ok(())
    }

    async fn execute(&self, statement: &str) -> Result<(), GroupError> {
        let mut channel = self.pool.acquire().await?;
        log::trace!("{}: {}", self.address, statement);
        let result = channel.execute(statement).await;
        self.settle(channel, result)
            .map_err(|source| self.command_error(statement, source))
    }

    async fn query(&self, statement: &str) -> Result<Vec<Row>, GroupError> {
        let mut channel = self.pool.acquire().await?;
        log::trace!("{}: {}", self.address, statement);
        let result = channel.query(statement).await;
        self.settle(channel, result)
            .map_err(|source| self.command_error(statement, source))
    }

    /// Ends the lease, dropping the session if its transport failed.
    fn settle<T>(
        &self,
        channel: PooledChannel<'_, C>,
        result: Result<T, CommandError>,
    ) -> Result<T, CommandError> {
        match &result {
            Err(CommandError::Transport(_)) => channel.discard(),
            _ => channel.release(),
        }
        result
    }

    fn command_error(&self, statement: &str, source: CommandError) -> GroupError {
        match source {
            CommandError::Transport(reason) => ConnectionError::Unreachable {
                address: self.address.clone(),
                reason,
            }
            .into(),
            source => GroupError::Command {
                node: self.address.clone(),
                statement: statement.to_owned(),
                source,
            },
        }
    }

    fn single_value<'r>(
        &self,
        rows: &'r [Row],
        statement: &str,
        column: &str,
    ) -> Result<&'r str, GroupError> {
        match rows {
            [row] => Ok(row.get(column).unwrap_or_default()),
            _ => Err(GroupError::mismatch(
                &self.address,
                format!("`{}` returned {} rows, expected one", statement, rows.len()),
            )),
        }
    }
}

/// Quotes a schema name as an identifier.
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
