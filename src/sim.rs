//! In-memory engine that answers the administrative command set like a group of MySQL
//! instances would.
//!
//! A [`SimulatedGroup`] models one instance per topology member, including plugin state,
//! the bootstrap flag, the recovery user, super-read-only secondaries, distributed recovery
//! and asynchronous schema replication. Joining members stay `RECOVERING` for a configurable
//! number of membership reads and replicated schemas become visible after a configurable
//! number of schema listings, so code driving the group has to poll like it would against a
//! real cluster.

use crate::{
    engine::{CommandChannel, CommandError, Connector, Row},
    error::{ConnectionError, GroupError},
    node::{sql, NodeHandle},
    pool::PoolSettings,
    topology::{ClusterTopology, GroupMode},
    COMMUNICATION_STACK, GROUP_REPLICATION_PLUGIN, PLUGIN_ACTIVE, REPLICATION_USER,
    SUPER_READ_ONLY_MESSAGE,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};

/// Version reported by simulated members.
pub const SIMULATED_VERSION: &str = "8.0.36";

const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];
const BUILTIN_PLUGINS: [&str; 3] = ["binlog", "mysql_native_password", "InnoDB"];
const NOT_CONFIGURED: &str = "The server is not configured properly to be an active member of the group. Please see more details on error log.";

/// A simulated group of instances; cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct SimulatedGroup {
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    mode: GroupMode,
    client_port: u16,
    instances: Vec<Instance>,
    /// Indices of the instances running the group protocol, in join order.
    members: Vec<usize>,
    recovery_reads: u32,
    replication_lag: u32,
    faults: Vec<Fault>,
}

struct Fault {
    host: String,
    statement: String,
    code: u16,
    message: String,
}

enum Status {
    Recovering { reads_left: u32 },
    Online,
    Error,
}

struct Instance {
    host: String,
    server_id: u32,
    uuid: String,
    reachable: bool,
    credentials_valid: bool,
    transactions: u64,
    plugin_installed: bool,
    bootstrap_flag: bool,
    users: BTreeSet<String>,
    granted: BTreeSet<String>,
    privileges_flushed: bool,
    recovery_user: Option<String>,
    status: Option<Status>,
    recovery_stalled: bool,
    recovery_fails: bool,
    schemas: BTreeSet<String>,
    pending: Vec<(String, u32)>,
    log: Vec<String>,
}

impl Instance {
    fn new(host: String, server_id: u32) -> Self {
        Self {
            host,
            server_id,
            uuid: uuid::Uuid::new_v4().to_string(),
            reachable: true,
            credentials_valid: true,
            // a freshly initialized instance has executed its own setup transactions
            transactions: 5,
            plugin_installed: false,
            bootstrap_flag: false,
            users: BTreeSet::new(),
            granted: BTreeSet::new(),
            privileges_flushed: true,
            recovery_user: None,
            status: None,
            recovery_stalled: false,
            recovery_fails: false,
            schemas: BTreeSet::new(),
            pending: Vec::new(),
            log: Vec::new(),
        }
    }
}

impl SimulatedGroup {
    /// Creates one pristine instance per topology member; member `i` gets server id `i + 1`.
    pub fn new(topology: &ClusterTopology) -> Self {
        let instances = topology
            .members()
            .iter()
            .zip(1..)
            .map(|(host, server_id)| Instance::new(host.clone(), server_id))
            .collect();

        Self {
            state: Arc::new(Mutex::new(SimState {
                mode: topology.mode(),
                client_port: topology.client_port(),
                instances,
                members: Vec::new(),
                recovery_reads: 2,
                replication_lag: 1,
                faults: Vec::new(),
            })),
        }
    }

    /// Returns a connector for the instance at the given topology position.
    ///
    /// # Panics
    ///
    /// Panics if the index is not part of the topology.
    pub fn connector(&self, index: usize) -> SimulatedConnector {
        let address = self.state.lock().instances[index].host.clone();
        SimulatedConnector {
            state: self.state.clone(),
            index,
            address,
        }
    }

    /// Connects a [`NodeHandle`] to every instance, in topology order.
    pub async fn node_handles(
        &self,
        settings: PoolSettings,
    ) -> Result<Vec<NodeHandle<SimulatedConnector>>, GroupError> {
        let server_ids: Vec<u32> = self
            .state
            .lock()
            .instances
            .iter()
            .map(|instance| instance.server_id)
            .collect();

        let mut nodes = Vec::with_capacity(server_ids.len());
        for (index, server_id) in server_ids.into_iter().enumerate() {
            nodes.push(NodeHandle::connect(server_id, self.connector(index), settings).await?);
        }
        Ok(nodes)
    }

    /// Number of membership reads a joining member stays `RECOVERING` for.
    pub fn set_recovery_reads(&self, reads: u32) {
        self.state.lock().recovery_reads = reads;
    }

    /// Number of schema listings on a replica that still miss a replicated schema.
    pub fn set_replication_lag(&self, reads: u32) {
        self.state.lock().replication_lag = reads;
    }

    /// Keeps the given member `RECOVERING` forever once it joins or bootstraps.
    pub fn stall_recovery(&self, host: &str) {
        self.with_instance(host, |instance| instance.recovery_stalled = true);
    }

    /// Moves the given member to `ERROR` instead of `ONLINE` once its recovery ends.
    pub fn fail_recovery(&self, host: &str) {
        self.with_instance(host, |instance| instance.recovery_fails = true);
    }

    /// Takes an instance down or brings it back.
    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.with_instance(host, |instance| instance.reachable = reachable);
    }

    /// Makes the instance refuse new sessions as if the credentials were wrong.
    pub fn reject_credentials(&self, host: &str) {
        self.with_instance(host, |instance| instance.credentials_valid = false);
    }

    /// Loads the group replication plugin ahead of time, leaving residual state behind.
    pub fn preinstall_module(&self, host: &str) {
        self.with_instance(host, |instance| instance.plugin_installed = true);
    }

    /// Makes every future execution of `statement` on `host` fail with the given error.
    pub fn inject_failure(&self, host: &str, statement: &str, code: u16, message: &str) {
        self.state.lock().faults.push(Fault {
            host: host.to_owned(),
            statement: statement.to_owned(),
            code,
            message: message.to_owned(),
        });
    }

    /// Statements received by the given instance, in order.
    pub fn statement_log(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .instances
            .iter()
            .find(|instance| instance.host == host)
            .map(|instance| instance.log.clone())
            .unwrap_or_default()
    }

    /// Forgets all statements received so far.
    pub fn clear_statement_log(&self) {
        for instance in &mut self.state.lock().instances {
            instance.log.clear();
        }
    }

    fn with_instance(&self, host: &str, f: impl FnOnce(&mut Instance)) {
        if let Some(instance) = self
            .state
            .lock()
            .instances
            .iter_mut()
            .find(|instance| instance.host == host)
        {
            f(instance);
        }
    }
}

/// Opens sessions with one simulated instance.
pub struct SimulatedConnector {
    state: Arc<Mutex<SimState>>,
    index: usize,
    address: String,
}

#[async_trait]
impl Connector for SimulatedConnector {
    type Channel = SimulatedSession;

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<SimulatedSession, ConnectionError> {
        let state = self.state.lock();
        let instance = &state.instances[self.index];
        if !instance.reachable {
            return Err(ConnectionError::Unreachable {
                address: self.address.clone(),
                reason: "Connection refused (os error 111)".into(),
            });
        }
        if !instance.credentials_valid {
            return Err(ConnectionError::Rejected {
                address: self.address.clone(),
                reason: "Access denied for user 'root'@'%' (using password: YES)".into(),
            });
        }
        Ok(SimulatedSession {
            state: self.state.clone(),
            index: self.index,
        })
    }
}

/// A session with one simulated instance.
pub struct SimulatedSession {
    state: Arc<Mutex<SimState>>,
    index: usize,
}

#[async_trait]
impl CommandChannel for SimulatedSession {
    async fn execute(&mut self, statement: &str) -> Result<(), CommandError> {
        self.state.lock().run(self.index, statement).map(|_| ())
    }

    async fn query(&mut self, statement: &str) -> Result<Vec<Row>, CommandError> {
        self.state.lock().run(self.index, statement)
    }
}

fn server_error(code: u16, message: impl Into<String>) -> CommandError {
    CommandError::Server {
        code,
        message: message.into(),
    }
}

impl SimState {
    fn run(&mut self, index: usize, statement: &str) -> Result<Vec<Row>, CommandError> {
        if !self.instances[index].reachable {
            return Err(CommandError::Transport(
                "Lost connection to MySQL server during query".into(),
            ));
        }
        let statement = statement.trim().trim_end_matches(';').trim();
        self.instances[index].log.push(statement.to_owned());

        let host = &self.instances[index].host;
        if let Some(fault) = self
            .faults
            .iter()
            .find(|fault| &fault.host == host && fault.statement == statement)
        {
            return Err(server_error(fault.code, fault.message.clone()));
        }

        if let Some(name) = statement.strip_prefix(sql::CREATE_DATABASE) {
            return self.create_schema(index, &unquote(name)).map(|()| Vec::new());
        }

        match statement {
            sql::SERVER_ID => {
                let server_id = self.instances[index].server_id;
                Ok(vec![Row::new().with("SERVER_ID", server_id.to_string())])
            }
            sql::GTID_EXECUTED => {
                let instance = &self.instances[index];
                let executed = match instance.transactions {
                    0 => String::new(),
                    n => format!("{}:1-{}", instance.uuid, n),
                };
                Ok(vec![Row::new().with("GTID_EXECUTED", executed)])
            }
            sql::RESET_MASTER => {
                let instance = &mut self.instances[index];
                if instance.status.is_some() {
                    return Err(server_error(
                        3190,
                        "RESET MASTER is not allowed because Group Replication is running.",
                    ));
                }
                instance.transactions = 0;
                Ok(Vec::new())
            }
            sql::INSTALL_PLUGIN => {
                let instance = &mut self.instances[index];
                if instance.plugin_installed {
                    return Err(server_error(
                        1125,
                        format!("Function '{}' already exists", GROUP_REPLICATION_PLUGIN),
                    ));
                }
                instance.plugin_installed = true;
                Ok(Vec::new())
            }
            sql::SHOW_PLUGINS => {
                let mut names: Vec<&str> = BUILTIN_PLUGINS.to_vec();
                if self.instances[index].plugin_installed {
                    names.push(GROUP_REPLICATION_PLUGIN);
                }
                Ok(names
                    .into_iter()
                    .map(|name| Row::new().with("Name", name).with("Status", PLUGIN_ACTIVE))
                    .collect())
            }
            sql::SHOW_DATABASES => Ok(self.list_schemas(index)),
            sql::GROUP_MEMBERS => Ok(self.membership(index)),
            sql::ENABLE_BOOTSTRAP | sql::DISABLE_BOOTSTRAP => {
                let instance = &mut self.instances[index];
                if !instance.plugin_installed {
                    return Err(server_error(
                        1193,
                        "Unknown system variable 'group_replication_bootstrap_group'",
                    ));
                }
                instance.bootstrap_flag = statement == sql::ENABLE_BOOTSTRAP;
                Ok(Vec::new())
            }
            sql::CREATE_REPLICATION_USER => {
                let instance = &mut self.instances[index];
                if !instance.users.insert(REPLICATION_USER.to_owned()) {
                    return Err(server_error(
                        1396,
                        "Operation CREATE USER failed for 'repl'@'%'",
                    ));
                }
                instance.transactions += 1;
                Ok(Vec::new())
            }
            sql::GRANT_REPLICATION => {
                let instance = &mut self.instances[index];
                if !instance.users.contains(REPLICATION_USER) {
                    return Err(server_error(
                        1410,
                        "You are not allowed to create a user with GRANT",
                    ));
                }
                instance.granted.insert(REPLICATION_USER.to_owned());
                instance.privileges_flushed = false;
                instance.transactions += 1;
                Ok(Vec::new())
            }
            sql::FLUSH_PRIVILEGES => {
                self.instances[index].privileges_flushed = true;
                Ok(Vec::new())
            }
            sql::CONFIGURE_RECOVERY => {
                self.instances[index].recovery_user = Some(REPLICATION_USER.to_owned());
                Ok(Vec::new())
            }
            sql::START_GROUP_REPLICATION => self.start_group_replication(index).map(|()| Vec::new()),
            other => Err(server_error(
                1064,
                format!(
                    "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version for the right syntax to use near '{}'",
                    other
                ),
            )),
        }
    }

    fn start_group_replication(&mut self, index: usize) -> Result<(), CommandError> {
        let online_members = self
            .members
            .iter()
            .filter(|&&member| matches!(self.instances[member].status, Some(Status::Online)))
            .count();
        let recovery_reads = self.recovery_reads;

        let instance = &mut self.instances[index];
        if !instance.plugin_installed {
            return Err(server_error(
                1064,
                "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version for the right syntax to use near 'GROUP_REPLICATION'",
            ));
        }
        if instance.status.is_some() {
            return Err(server_error(
                3093,
                "The START GROUP_REPLICATION command failed since the group is already running.",
            ));
        }
        if instance.recovery_user.is_none() {
            return Err(server_error(3092, NOT_CONFIGURED));
        }

        if instance.bootstrap_flag {
            let privileges_ready =
                instance.granted.contains(REPLICATION_USER) && instance.privileges_flushed;
            if !privileges_ready || !self.members.is_empty() {
                return Err(server_error(3092, NOT_CONFIGURED));
            }
            instance.status = Some(if instance.recovery_stalled {
                Status::Recovering { reads_left: 1 }
            } else {
                Status::Online
            });
            instance.transactions += 1;
            self.members.push(index);
            return Ok(());
        }

        if online_members == 0 {
            return Err(server_error(
                3096,
                "The START GROUP_REPLICATION command failed as there was an error when initializing the group communication layer.",
            ));
        }
        instance.status = Some(Status::Recovering {
            reads_left: recovery_reads,
        });
        self.members.push(index);
        if recovery_reads == 0 {
            self.finish_recovery(index);
        }
        Ok(())
    }

    /// Brings a recovering member up to date with the group and marks it `ONLINE`, or
    /// `ERROR` if its recovery was set up to fail.
    fn finish_recovery(&mut self, index: usize) {
        if self.instances[index].recovery_fails {
            self.instances[index].status = Some(Status::Error);
            return;
        }
        let founder = self.members[0];
        let schemas = self.instances[founder].schemas.clone();
        let transactions = self.instances[founder].transactions;

        let instance = &mut self.instances[index];
        instance.schemas.extend(schemas);
        instance.pending.clear();
        instance.transactions = transactions;
        instance.status = Some(Status::Online);
    }

    /// Advances recovering members by one membership read.
    fn tick(&mut self) {
        let mut recovered = Vec::new();
        for &member in &self.members {
            let instance = &mut self.instances[member];
            if instance.recovery_stalled {
                continue;
            }
            if let Some(Status::Recovering { reads_left }) = &mut instance.status {
                if *reads_left <= 1 {
                    recovered.push(member);
                } else {
                    *reads_left -= 1;
                }
            }
        }
        for member in recovered {
            self.finish_recovery(member);
        }
    }

    fn membership(&mut self, index: usize) -> Vec<Row> {
        self.tick();

        // an instance that never ran the protocol reports a single anonymous OFFLINE row
        if !self.members.contains(&index) {
            return vec![Row::new()
                .with("CHANNEL_NAME", "group_replication_applier")
                .with("MEMBER_ID", "")
                .with("MEMBER_HOST", "")
                .with_null("MEMBER_PORT")
                .with("MEMBER_STATE", "OFFLINE")
                .with("MEMBER_ROLE", "")
                .with("MEMBER_VERSION", "")
                .with("MEMBER_COMMUNICATION_STACK", "")];
        }

        self.members
            .iter()
            .enumerate()
            .map(|(position, &member)| {
                let instance = &self.instances[member];
                let state = match instance.status {
                    Some(Status::Online) => "ONLINE",
                    Some(Status::Error) => "ERROR",
                    _ => "RECOVERING",
                };
                let role = self.mode.expected_role(position);
                Row::new()
                    .with("CHANNEL_NAME", "group_replication_applier")
                    .with("MEMBER_ID", instance.uuid.as_str())
                    .with("MEMBER_HOST", instance.host.as_str())
                    .with("MEMBER_PORT", self.client_port.to_string())
                    .with("MEMBER_STATE", state)
                    .with("MEMBER_ROLE", role.as_str())
                    .with("MEMBER_VERSION", SIMULATED_VERSION)
                    .with("MEMBER_COMMUNICATION_STACK", COMMUNICATION_STACK)
            })
            .collect()
    }

    fn read_only(&self, index: usize) -> bool {
        match &self.instances[index].status {
            None => false,
            Some(Status::Recovering { .. } | Status::Error) => true,
            Some(Status::Online) => {
                self.mode == GroupMode::SinglePrimary && self.members.first() != Some(&index)
            }
        }
    }

    fn create_schema(&mut self, index: usize, name: &str) -> Result<(), CommandError> {
        if self.read_only(index) {
            return Err(server_error(1290, SUPER_READ_ONLY_MESSAGE));
        }
        let instance = &mut self.instances[index];
        if instance.schemas.contains(name) {
            return Err(server_error(
                1007,
                format!("Can't create database '{}'; database exists", name),
            ));
        }
        instance.schemas.insert(name.to_owned());
        instance.transactions += 1;

        if !self.members.contains(&index) {
            return Ok(());
        }
        let lag = self.replication_lag;
        for &member in self.members.iter().filter(|&&member| member != index) {
            let replica = &mut self.instances[member];
            if lag == 0 {
                replica.schemas.insert(name.to_owned());
            } else {
                replica.pending.push((name.to_owned(), lag));
            }
        }
        Ok(())
    }

    fn list_schemas(&mut self, index: usize) -> Vec<Row> {
        let instance = &mut self.instances[index];
        let mut waiting = Vec::new();
        for (name, reads_left) in instance.pending.drain(..) {
            if reads_left == 0 {
                instance.schemas.insert(name);
            } else {
                waiting.push((name, reads_left - 1));
            }
        }
        instance.pending = waiting;

        SYSTEM_SCHEMAS
            .iter()
            .copied()
            .chain(instance.schemas.iter().map(String::as_str))
            .map(|name| Row::new().with("Database", name))
            .collect()
    }
}

fn unquote(name: &str) -> String {
    let name = name.trim();
    match name.strip_prefix('`').and_then(|n| n.strip_suffix('`')) {
        Some(inner) => inner.replace("``", "`"),
        None => name.to_owned(),
    }
}
