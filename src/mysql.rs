//! Drives real MySQL instances through `mysql_async`.

use crate::{
    engine::{CommandChannel, CommandError, Connector, Row},
    error::{ConnectionError, GroupError},
    pool::PoolSettings,
};
use async_trait::async_trait;
use mysql_async::{
    prelude::Queryable, Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Value,
};

/// Server error codes meaning the instance refused the session itself.
const ACCESS_DENIED_CODES: [u16; 5] = [1044, 1045, 1049, 1130, 1251];

/// Opens sessions with one MySQL instance.
///
/// Sessions come from a `mysql_async` pool constrained to the node's
/// [`PoolSettings::max_connections`].
pub struct MySqlConnector {
    address: String,
    pool: Pool,
}

impl MySqlConnector {
    /// Creates a connector for the instance that peers know as `address` and that is
    /// reachable through the given `mysql://` URL.
    pub fn new(
        address: impl Into<String>,
        url: &str,
        settings: PoolSettings,
    ) -> Result<Self, GroupError> {
        let address = address.into();
        let opts = Opts::from_url(url).map_err(|e| {
            GroupError::Config(format!("invalid URL for `{}`: {}", address, e))
        })?;
        let pool = build_pool(opts, settings)?;
        Ok(Self { address, pool })
    }

    /// Creates a connector whose peer address is the host of the URL.
    pub fn from_url(url: &str, settings: PoolSettings) -> Result<Self, GroupError> {
        let opts = Opts::from_url(url)
            .map_err(|e| GroupError::Config(format!("invalid URL `{}`: {}", url, e)))?;
        let address = opts.ip_or_hostname().to_owned();
        let pool = build_pool(opts, settings)?;
        Ok(Self { address, pool })
    }
}

fn build_pool(opts: Opts, settings: PoolSettings) -> Result<Pool, GroupError> {
    let constraints = PoolConstraints::new(1, settings.max_connections).ok_or_else(|| {
        GroupError::Config(format!(
            "invalid pool size {}, at least one connection is needed",
            settings.max_connections
        ))
    })?;
    let opts = OptsBuilder::from_opts(opts)
        .pool_opts(PoolOpts::default().with_constraints(constraints));
    Ok(Pool::new(opts))
}

#[async_trait]
impl Connector for MySqlConnector {
    type Channel = Conn;

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Conn, ConnectionError> {
        self.pool
            .get_conn()
            .await
            .map_err(|err| connection_error(&self.address, err))
    }

    async fn shutdown(&self) {
        if let Err(err) = self.pool.clone().disconnect().await {
            log::warn!("failed to disconnect from {}: {}", self.address, err);
        }
    }
}

#[async_trait]
impl CommandChannel for Conn {
    async fn execute(&mut self, statement: &str) -> Result<(), CommandError> {
        self.query_drop(statement).await.map_err(command_error)
    }

    async fn query(&mut self, statement: &str) -> Result<Vec<Row>, CommandError> {
        let rows: Vec<mysql_async::Row> = Queryable::query(self, statement)
            .await
            .map_err(command_error)?;
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn close(self) -> Result<(), CommandError> {
        self.disconnect().await.map_err(command_error)
    }
}

fn connection_error(address: &str, err: mysql_async::Error) -> ConnectionError {
    let address = address.to_owned();
    match err {
        mysql_async::Error::Server(err) if ACCESS_DENIED_CODES.contains(&err.code) => {
            ConnectionError::Rejected {
                address,
                reason: err.message,
            }
        }
        mysql_async::Error::Url(err) => ConnectionError::Rejected {
            address,
            reason: err.to_string(),
        },
        err => ConnectionError::Unreachable {
            address,
            reason: err.to_string(),
        },
    }
}

fn command_error(err: mysql_async::Error) -> CommandError {
    match err {
        mysql_async::Error::Server(err) => CommandError::Server {
            code: err.code,
            message: err.message,
        },
        err => CommandError::Transport(err.to_string()),
    }
}

fn convert_row(row: &mysql_async::Row) -> Row {
    let mut converted = Row::new();
    for (index, column) in row.columns_ref().iter().enumerate() {
        let value = row.as_ref(index).and_then(value_to_string);
        converted.insert(column.name_str().into_owned(), value);
    }
    converted
}

/// Textual form of a column value, `None` for `NULL`.
fn value_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::NULL => return None,
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micros
        ),
        Value::Time(negative, days, hours, minutes, seconds, micros) => format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if *negative { "-" } else { "" },
            u32::from(*days) * 24 + u32::from(*hours),
            minutes,
            seconds,
            micros
        ),
    };
    Some(text)
}
