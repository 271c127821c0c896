//! Connection reuse for a single instance.

use crate::{
    engine::{CommandChannel, Connector},
    error::{ConnectionError, GroupError},
};
use parking_lot::Mutex;
use std::{
    mem,
    ops::{Deref, DerefMut},
    time::Duration,
};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Limits applied by a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of sessions that may be lent out at the same time.
    ///
    /// Further `acquire` calls wait until a session is released.
    pub max_connections: usize,
    /// How long opening a new session may take before the instance counts as unreachable.
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 1,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Lends sessions with one instance and takes them back for reuse.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    settings: PoolSettings,
    idle: Mutex<Vec<C::Channel>>,
    slots: Semaphore,
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates an empty pool. No session is opened until [`Self::warm_up`] or
    /// [`Self::acquire`] is called.
    pub fn new(connector: C, settings: PoolSettings) -> Result<Self, GroupError> {
        if settings.max_connections == 0 {
            return Err(GroupError::Config(
                "a connection pool needs at least one connection".into(),
            ));
        }
        Ok(Self {
            slots: Semaphore::new(settings.max_connections),
            connector,
            settings,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Address of the instance behind this pool.
    pub fn address(&self) -> &str {
        self.connector.address()
    }

    /// Makes sure at least one live session is kept for reuse.
    pub async fn warm_up(&self) -> Result<(), ConnectionError> {
        if self.idle_connections() == 0 {
            self.acquire().await?.release();
        }
        Ok(())
    }

    /// Lends a session, opening a new one if no idle session is available.
    ///
    /// Waits while all `max_connections` sessions are lent out.
    pub async fn acquire(&self) -> Result<PooledChannel<'_, C>, ConnectionError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ConnectionError::Unreachable {
                address: self.address().to_owned(),
                reason: "connection pool is closed".into(),
            })?;

        let idle = self.idle.lock().pop();
        let channel = match idle {
            Some(channel) => channel,
            None => self.open().await?,
        };

        Ok(PooledChannel {
            pool: self,
            channel: Some(channel),
            _permit: permit,
        })
    }

    /// Number of sessions currently waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Refuses further leases and ends all idle sessions.
    pub async fn close(&self) {
        self.slots.close();
        let channels = mem::take(&mut *self.idle.lock());
        for channel in channels {
            if let Err(err) = channel.close().await {
                log::warn!("failed to close session with {}: {}", self.address(), err);
            }
        }
        self.connector.shutdown().await;
    }

    async fn open(&self) -> Result<C::Channel, ConnectionError> {
        log::trace!("opening session with {}", self.address());
        match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect()).await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Unreachable {
                address: self.address().to_owned(),
                reason: format!(
                    "no session established within {:?}",
                    self.settings.connect_timeout
                ),
            }),
        }
    }
}

/// A session lent out by a [`ConnectionPool`].
///
/// Dropping the lease returns the session to the pool.
pub struct PooledChannel<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    channel: Option<C::Channel>,
    _permit: SemaphorePermit<'a>,
}

impl<'a, C: Connector> PooledChannel<'a, C> {
    /// Returns the session to the pool.
    pub fn release(self) {}

    /// Ends the lease without returning the session, e.g. after its transport failed.
    pub fn discard(mut self) {
        self.channel.take();
    }
}

impl<'a, C: Connector> Deref for PooledChannel<'a, C> {
    type Target = C::Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref().expect("session is present until the lease ends")
    }
}

impl<'a, C: Connector> DerefMut for PooledChannel<'a, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.channel.as_mut().expect("session is present until the lease ends")
    }
}

impl<'a, C: Connector> Drop for PooledChannel<'a, C> {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        // a closed pool lends nothing out again
        if self.pool.slots.is_closed() {
            log::trace!("dropping session with {} returned after close", self.pool.address());
            return;
        }
        self.pool.idle.lock().push(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommandError, Row};
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct NullChannel;

    #[async_trait]
    impl CommandChannel for NullChannel {
        async fn execute(&mut self, _statement: &str) -> Result<(), CommandError> {
            Ok(())
        }

        async fn query(&mut self, _statement: &str) -> Result<Vec<Row>, CommandError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        opened: Arc<AtomicUsize>,
        shut_down: Arc<AtomicUsize>,
        refuse: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Channel = NullChannel;

        fn address(&self) -> &str {
            "node1"
        }

        async fn connect(&self) -> Result<NullChannel, ConnectionError> {
            if self.refuse {
                return Err(ConnectionError::Rejected {
                    address: "node1".into(),
                    reason: "Access denied".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(NullChannel)
        }

        async fn shutdown(&self) {
            self.shut_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sessions_are_reused() {
        let connector = CountingConnector::default();
        let opened = connector.opened.clone();
        let pool = ConnectionPool::new(connector, PoolSettings::default()).unwrap();

        pool.warm_up().await.unwrap();
        assert_eq!(pool.idle_connections(), 1);

        for _ in 0..3 {
            let mut lease = pool.acquire().await.unwrap();
            lease.execute("SELECT 1").await.unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_queues_demand() {
        let pool = ConnectionPool::new(CountingConnector::default(), PoolSettings::default())
            .unwrap();

        let first = pool.acquire().await.unwrap();
        let mut second = Box::pin(pool.acquire());
        assert!(futures::poll!(&mut second).is_pending());

        first.release();
        let second = second.await.unwrap();
        second.release();
        assert_eq!(pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn discarded_sessions_are_not_reused() {
        let connector = CountingConnector::default();
        let opened = connector.opened.clone();
        let pool = ConnectionPool::new(connector, PoolSettings::default()).unwrap();

        pool.acquire().await.unwrap().discard();
        assert_eq!(pool.idle_connections(), 0);
        pool.acquire().await.unwrap().release();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_sessions_surface_as_rejected() {
        let connector = CountingConnector {
            refuse: true,
            ..Default::default()
        };
        let pool = ConnectionPool::new(connector, PoolSettings::default()).unwrap();

        let err = pool.warm_up().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Rejected { .. }));
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let connector = CountingConnector::default();
        let shut_down = connector.shut_down.clone();
        let pool = ConnectionPool::new(connector, PoolSettings::default()).unwrap();
        pool.warm_up().await.unwrap();
        pool.close().await;

        assert_eq!(pool.idle_connections(), 0);
        assert_eq!(shut_down.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.acquire().await.map(|_| ()),
            Err(ConnectionError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn lease_returned_after_close_is_dropped() {
        let pool = ConnectionPool::new(CountingConnector::default(), PoolSettings::default())
            .unwrap();
        let lease = pool.acquire().await.unwrap();
        pool.close().await;

        lease.release();
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn zero_connections_is_a_config_error() {
        let settings = PoolSettings {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(
            ConnectionPool::new(CountingConnector::default(), settings),
            Err(GroupError::Config(_))
        ));
    }
}
