//! The command interface through which instances are driven.
//!
//! A [`Connector`] opens [`CommandChannel`]s to one instance. Every administrative operation
//! is a single statement sent over a channel, answered either by an acknowledgement or by a
//! result set.

use crate::error::ConnectionError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Failure of a single statement.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The engine executed the statement and rejected it.
    #[error("server error {code}: {message}")]
    Server {
        /// Engine error code.
        code: u16,
        /// Literal engine message.
        message: String,
    },
    /// The statement could not be delivered or the answer was lost.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl CommandError {
    /// Returns the engine error code, if the engine answered.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Server { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    /// Returns the engine message, if the engine answered.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Server { message, .. } => Some(message),
            Self::Transport(_) => None,
        }
    }
}

/// One row of a result set, keyed by column name.
///
/// SQL `NULL` is stored as `None`; every other value is kept in its textual form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row(BTreeMap<String, Option<String>>);

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a non-`NULL` column, builder style.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, Some(value.into()));
        self
    }

    /// Adds a `NULL` column, builder style.
    pub fn with_null(mut self, column: impl Into<String>) -> Self {
        self.insert(column, None);
        self
    }

    /// Sets the value of a column.
    pub fn insert(&mut self, column: impl Into<String>, value: Option<String>) {
        self.0.insert(column.into(), value);
    }

    /// Returns the value of a column, or `None` if it is missing or `NULL`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(|v| v.as_deref())
    }

    /// Returns true if the result set contained the given column.
    pub fn has_column(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }
}

/// An open session with one instance.
#[async_trait]
pub trait CommandChannel: Send + Sized + 'static {
    /// Executes a statement that produces no result set.
    async fn execute(&mut self, statement: &str) -> Result<(), CommandError>;

    /// Executes a statement and collects its full result set.
    async fn query(&mut self, statement: &str) -> Result<Vec<Row>, CommandError>;

    /// Ends the session.
    async fn close(self) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Opens sessions with one instance.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The session type produced by this connector.
    type Channel: CommandChannel;

    /// Address of the instance, as known to its peers.
    fn address(&self) -> &str;

    /// Opens a new session.
    async fn connect(&self) -> Result<Self::Channel, ConnectionError>;

    /// Releases what the connector shares between its sessions, once they are all closed.
    async fn shutdown(&self) {}
}
