//! Connection Pooling for Clients
//!
//! The pool keeps persistent connections per origin ([`OriginKey`]) so that
//! consecutive requests to the same origin can share a connection. Each origin
//! has a bucket of idle connections (most recently released first), a count of
//! connections currently checked out, and a FIFO queue of requests waiting for
//! a connection. The number of idle plus active connections per origin never
//! exceeds [`Config::max_connections_per_origin`].
//!
//! Accounting for checked out connections uses guards: every active connection
//! or connection attempt holds a slot, and the slot is given back to the pool
//! (or handed to the next waiter) when the guard is dropped. A cancelled request
//! can therefore never leak capacity.
//!
//! Pool configuration happens in the [`Config`] type.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod idle;
mod key;
#[cfg(test)]
pub(crate) mod mock;
mod weakopt;

use self::idle::IdleConnections;
pub use self::key::{OriginKey, Scheme, UrlError};
use self::weakopt::WeakOpt;

/// A connection which can be managed by a [`Pool`].
///
/// Connections must report whether they remain open, and must close
/// themselves when the pool discards them.
pub(crate) trait PoolableConnection: Send + 'static {
    /// Returns `true` if the connection is open.
    fn is_open(&self) -> bool;

    /// Close the connection. Further calls to `is_open` return `false`.
    fn close(&mut self);
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of idle plus active connections per origin.
    pub max_connections_per_origin: usize,

    /// The maximum idle duration of a connection.
    ///
    /// Connections which have been idle for longer are never handed out.
    pub idle_timeout: Option<Duration>,

    /// How long a request waits for a connection when the origin is at
    /// its connection limit. `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,

    /// Interval at which a background task evicts expired idle connections.
    ///
    /// Expired connections are always evicted when a connection is requested,
    /// the background task additionally releases resources for origins which
    /// are no longer used.
    pub reap_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 10,
            idle_timeout: Some(Duration::from_secs(90)),
            wait_timeout: Some(Duration::from_secs(30)),
            reap_interval: None,
        }
    }
}

/// A snapshot of the connections held for one origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the pool for reuse.
    pub idle: usize,

    /// Connections (or connection attempts) currently checked out.
    pub active: usize,

    /// Requests queued for a connection.
    pub waiting: usize,
}

/// Errors returned when acquiring a connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error<E> {
    /// Creating a new connection failed.
    #[error("creating connection")]
    Connecting(#[source] E),

    /// No connection became available within the wait timeout.
    #[error("no connection available")]
    Exhausted,

    /// The pool has been drained.
    #[error("pool closed")]
    Closed,
}

type Inner<C> = Mutex<PoolInner<C>>;

/// A pool of connections to remote origins.
pub(crate) struct Pool<C: PoolableConnection> {
    inner: Arc<Inner<C>>,
    shutdown: CancellationToken,
}

impl<C: PoolableConnection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("config", &inner.config)
            .field("closed", &inner.closed)
            .field("origins", &inner.buckets.len())
            .finish()
    }
}

impl<C: PoolableConnection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C: PoolableConnection> Pool<C> {
    /// Create a new pool.
    ///
    /// When the configuration asks for a reaper and a tokio runtime is
    /// available, a background task is spawned which evicts expired
    /// connections until the pool is drained or dropped.
    pub(crate) fn new(config: Config) -> Self {
        let reap_interval = config.reap_interval;
        let pool = Self {
            inner: Arc::new(Mutex::new(PoolInner::new(config))),
            shutdown: CancellationToken::new(),
        };

        if let Some(interval) = reap_interval {
            pool.spawn_reaper(interval);
        }

        pool
    }

    fn spawn_reaper(&self, period: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available, idle connections are only evicted on checkout");
            return;
        };

        let inner = WeakOpt::downgrade(&self.inner);
        let shutdown = self.shutdown.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        evict(&inner);
                    }
                }
            }
            trace!("pool reaper finished");
        });
    }

    /// Token cancelled when the pool is drained.
    ///
    /// Connection driver tasks stop when this token is cancelled.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }

    /// Has this pool been drained?
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Acquire a connection to `key`.
    ///
    /// An open idle connection is preferred (unless `fresh` is set). Otherwise,
    /// if the origin has capacity, `connect` is called to create a new
    /// connection. Without capacity, the request waits in line for a connection
    /// to be released or a slot to be freed, up to the pool's wait timeout.
    ///
    /// With `fresh`, an idle connection which occupies the last slot is closed
    /// to make room for the new connection.
    #[tracing::instrument(skip_all, fields(origin = %key, fresh = fresh), level = "trace")]
    pub(crate) async fn acquire<F, Fut, E>(
        &self,
        key: &OriginKey,
        fresh: bool,
        connect: F,
    ) -> Result<Pooled<C>, Error<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut discard = Vec::new();
        let checkout = self
            .inner
            .lock()
            .checkout(key, fresh, &self.as_ref(), &mut discard);
        close_all(discard);

        let slot = match checkout {
            Checkout::Idle(connection, slot) => {
                trace!("reusing idle connection");
                return Ok(Pooled::new(connection, slot, true));
            }
            Checkout::Reserved(slot) => slot,
            Checkout::Wait(rx) => {
                trace!("origin at capacity, waiting for a connection");
                let grant = self.wait(rx).await?;
                match grant.connection {
                    Some(mut connection) if fresh => {
                        trace!("discarding released connection for a fresh one");
                        connection.close();
                        grant.slot
                    }
                    Some(connection) => {
                        trace!("received released connection");
                        return Ok(Pooled::new(connection, grant.slot, true));
                    }
                    None => grant.slot,
                }
            }
            Checkout::Closed => return Err(Error::Closed),
        };

        trace!("creating new connection");
        let mut connection = connect().await.map_err(Error::Connecting)?;

        if self.is_closed() {
            connection.close();
            return Err(Error::Closed);
        }

        Ok(Pooled::new(connection, slot, false))
    }

    async fn wait<E>(&self, mut rx: oneshot::Receiver<Grant<C>>) -> Result<Grant<C>, Error<E>> {
        let wait_timeout = self.inner.lock().config.wait_timeout;
        let outcome = match wait_timeout {
            Some(limit) => tokio::time::timeout(limit, &mut rx).await,
            None => Ok((&mut rx).await),
        };

        match outcome {
            Ok(Ok(grant)) => Ok(grant),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                // A grant may have been sent just as the timer fired.
                rx.close();
                rx.try_recv().map_err(|_| Error::Exhausted)
            }
        }
    }

    /// Remove and close every idle connection which has expired.
    pub(crate) fn evict_expired(&self) {
        evict(&self.inner);
    }

    /// Close the pool.
    ///
    /// Idle connections are closed, waiting requests fail, and every
    /// connection driver is told to stop. Connections which are still
    /// checked out are closed instead of being returned.
    pub(crate) fn drain(&self) {
        let mut discard = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            for (_, mut bucket) in inner.buckets.drain() {
                discard.extend(bucket.idle.drain());
                bucket.waiting.clear();
            }
        }
        debug!(idle = discard.len(), "draining connection pool");
        close_all(discard);
        self.shutdown.cancel();
    }

    /// Connection counts for `key`.
    pub(crate) fn stats(&self, key: &OriginKey) -> PoolStats {
        let inner = self.inner.lock();
        inner
            .buckets
            .get(key)
            .map(|bucket| PoolStats {
                idle: bucket.idle.len(),
                active: bucket.active,
                waiting: bucket.waiting.iter().filter(|w| !w.is_closed()).count(),
            })
            .unwrap_or_default()
    }

    fn as_ref(&self) -> WeakOpt<Inner<C>> {
        WeakOpt::downgrade(&self.inner)
    }
}

fn evict<C: PoolableConnection>(inner: &Inner<C>) {
    let mut discard = Vec::new();
    {
        let mut inner = inner.lock();
        let idle_timeout = inner.config.idle_timeout;
        inner.buckets.retain(|_, bucket| {
            bucket.idle.evict(idle_timeout, &mut discard);
            !bucket.is_unused()
        });
    }

    if !discard.is_empty() {
        trace!(count = discard.len(), "closing expired connections");
    }
    close_all(discard);
}

fn close_all<C: PoolableConnection>(connections: Vec<C>) {
    for mut connection in connections {
        connection.close();
    }
}

enum Checkout<C: PoolableConnection> {
    Idle(C, Slot<C>),
    Reserved(Slot<C>),
    Wait(oneshot::Receiver<Grant<C>>),
    Closed,
}

/// What a waiting request receives: a released connection, or the
/// right to create a new one.
struct Grant<C: PoolableConnection> {
    connection: Option<C>,
    slot: Slot<C>,
}

struct Bucket<C: PoolableConnection> {
    idle: IdleConnections<C>,
    active: usize,
    waiting: VecDeque<oneshot::Sender<Grant<C>>>,
}

impl<C: PoolableConnection> Default for Bucket<C> {
    fn default() -> Self {
        Self {
            idle: IdleConnections::default(),
            active: 0,
            waiting: VecDeque::new(),
        }
    }
}

impl<C: PoolableConnection> Bucket<C> {
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && self.active == 0 && self.waiting.is_empty()
    }
}

struct PoolInner<C: PoolableConnection> {
    config: Config,
    closed: bool,
    buckets: HashMap<OriginKey, Bucket<C>>,
}

impl<C: PoolableConnection> PoolInner<C> {
    fn new(config: Config) -> Self {
        Self {
            config,
            closed: false,
            buckets: HashMap::new(),
        }
    }

    fn checkout(
        &mut self,
        key: &OriginKey,
        fresh: bool,
        pool: &WeakOpt<Inner<C>>,
        discard: &mut Vec<C>,
    ) -> Checkout<C> {
        if self.closed {
            return Checkout::Closed;
        }

        let idle_timeout = self.config.idle_timeout;
        let max = self.config.max_connections_per_origin.max(1);
        let bucket = self.buckets.entry(key.clone()).or_default();

        bucket.idle.evict(idle_timeout, discard);

        if !fresh {
            if let Some(connection) = bucket.idle.pop(discard) {
                bucket.active += 1;
                trace!(active = bucket.active, idle = bucket.idle.len(), "checkout idle");
                return Checkout::Idle(connection, Slot::new(key.clone(), pool.clone()));
            }
        } else if bucket.active + bucket.idle.len() >= max {
            if let Some(oldest) = bucket.idle.pop_oldest() {
                trace!("closing idle connection to make room for a fresh one");
                discard.push(oldest);
            }
        }

        if bucket.active + bucket.idle.len() < max {
            bucket.active += 1;
            trace!(active = bucket.active, idle = bucket.idle.len(), "checkout reserved");
            return Checkout::Reserved(Slot::new(key.clone(), pool.clone()));
        }

        let (tx, rx) = oneshot::channel();
        bucket.waiting.push_back(tx);
        trace!(waiting = bucket.waiting.len(), "checkout queued");
        Checkout::Wait(rx)
    }

    /// Return a connection to the pool, holding `slot`.
    ///
    /// The connection goes to the first live waiter, or onto the idle stack.
    /// Anything which could not be placed is handed back to be closed and
    /// dropped outside of the lock.
    fn push(&mut self, connection: C, slot: Slot<C>) -> Option<(C, Slot<C>)> {
        if self.closed {
            return Some((connection, slot));
        }

        let Some(bucket) = self.buckets.get_mut(&slot.key) else {
            return Some((connection, slot));
        };

        let mut grant = Grant {
            connection: Some(connection),
            slot,
        };

        while let Some(waiter) = bucket.waiting.pop_front() {
            if waiter.is_closed() {
                trace!("skipping closed waiter");
                continue;
            }

            match waiter.send(grant) {
                Ok(()) => {
                    trace!("released connection sent to waiter");
                    return None;
                }
                Err(returned) => grant = returned,
            }
        }

        let Grant {
            connection,
            mut slot,
        } = grant;
        slot.disarm();
        bucket.active = bucket.active.saturating_sub(1);
        if let Some(connection) = connection {
            bucket.idle.push(connection);
        }
        trace!(active = bucket.active, idle = bucket.idle.len(), "connection returned to pool");
        None
    }

    /// Give up a slot for `key`: hand it to the first live waiter, or
    /// reduce the active count.
    fn free_slot(&mut self, key: &OriginKey, pool: &WeakOpt<Inner<C>>) {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return;
        };

        while let Some(waiter) = bucket.waiting.pop_front() {
            if waiter.is_closed() {
                continue;
            }

            let grant = Grant {
                connection: None,
                slot: Slot::new(key.clone(), pool.clone()),
            };

            match waiter.send(grant) {
                Ok(()) => {
                    trace!("slot handed to waiter");
                    return;
                }
                Err(mut grant) => grant.slot.disarm(),
            }
        }

        bucket.active = bucket.active.saturating_sub(1);
        trace!(active = bucket.active, idle = bucket.idle.len(), "slot freed");
        if bucket.is_unused() {
            self.buckets.remove(key);
        }
    }
}

/// The right to hold one connection for an origin.
///
/// While armed, a slot counts towards the origin's active connections.
/// Dropping an armed slot frees it.
pub(crate) struct Slot<C: PoolableConnection> {
    key: OriginKey,
    pool: WeakOpt<Inner<C>>,
    armed: bool,
}

impl<C: PoolableConnection> Slot<C> {
    fn new(key: OriginKey, pool: WeakOpt<Inner<C>>) -> Self {
        Self {
            key,
            pool,
            armed: true,
        }
    }

    /// Forget this slot without touching the pool. Only call with the pool locked
    /// and the accounting done by hand.
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Move the slot out, leaving a disarmed copy behind.
    fn take(&mut self) -> Self {
        let armed = std::mem::replace(&mut self.armed, false);
        Self {
            key: self.key.clone(),
            pool: self.pool.clone(),
            armed,
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for Slot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl<C: PoolableConnection> Drop for Slot<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        if let Some(inner) = self.pool.upgrade() {
            inner.lock().free_slot(&self.key, &self.pool);
        }
    }
}

/// A connection checked out of a pool.
///
/// Call [`Pooled::release`] to give the connection back. Dropping a `Pooled`
/// without releasing it closes the connection: it may be in the middle of
/// an exchange, and can't be trusted for another request.
pub(crate) struct Pooled<C: PoolableConnection> {
    connection: Option<C>,
    slot: Slot<C>,
    reused: bool,
}

impl<C: PoolableConnection> Pooled<C> {
    fn new(connection: C, slot: Slot<C>, reused: bool) -> Self {
        Self {
            connection: Some(connection),
            slot,
            reused,
        }
    }

    /// Was this connection used for an earlier request?
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    /// Give the connection back.
    ///
    /// A connection released with `reusable` which is still open goes back to
    /// the pool, all others are closed.
    pub(crate) fn release(mut self, reusable: bool) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        let slot = self.slot.take();

        if !(reusable && connection.is_open()) {
            trace!("closing released connection");
            connection.close();
            drop(slot);
            return;
        }

        let leftover = match slot.pool.upgrade() {
            Some(inner) => inner.lock().push(connection, slot),
            None => Some((connection, slot)),
        };

        if let Some((mut connection, slot)) = leftover {
            trace!("pool gone or closed, closing connection");
            connection.close();
            drop(slot);
        }
    }
}

impl<C> fmt::Debug for Pooled<C>
where
    C: fmt::Debug + PoolableConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("connection", &self.connection)
            .field("reused", &self.reused)
            .finish()
    }
}

impl<C: PoolableConnection> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection only taken on release")
    }
}

impl<C: PoolableConnection> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection only taken on release")
    }
}

impl<C: PoolableConnection> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            trace!("pooled connection dropped without release, closing");
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::mock::MockConnection;
    use super::*;

    assert_impl_all!(Pool<MockConnection>: Clone, Send, Sync);
    assert_impl_all!(Pooled<MockConnection>: Send);

    fn key() -> OriginKey {
        OriginKey::new(Scheme::Http, "localhost", 8080)
    }

    fn pool(max: usize) -> Pool<MockConnection> {
        Pool::new(Config {
            max_connections_per_origin: max,
            idle_timeout: Some(Duration::from_secs(10)),
            wait_timeout: Some(Duration::from_secs(1)),
            reap_interval: None,
        })
    }

    #[derive(Debug, Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl Counter {
        fn connect(&self) -> impl Future<Output = Result<MockConnection, std::io::Error>> {
            let id = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(MockConnection::new(id)) }
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn sensible_config() {
        let config = Config::default();
        assert!(config.idle_timeout.unwrap() > Duration::from_secs(1));
        assert!(config.max_connections_per_origin > 0);
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = pool(4);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        assert!(!conn.is_reused());
        let id = conn.id;
        assert_eq!(pool.stats(&key()).active, 1);
        conn.release(true);
        assert_eq!(
            pool.stats(&key()),
            PoolStats {
                idle: 1,
                active: 0,
                waiting: 0
            }
        );

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.id, id);
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test]
    async fn non_reusable_connection_is_closed() {
        let pool = pool(4);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        conn.release(false);

        assert!(!handle.load(Ordering::SeqCst));
        assert_eq!(pool.stats(&key()), PoolStats::default());

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(counter.count(), 2);
    }

    #[tokio::test]
    async fn dropped_connection_is_closed_and_frees_slot() {
        let pool = pool(1);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        drop(conn);

        assert!(!handle.load(Ordering::SeqCst));
        assert_eq!(pool.stats(&key()).active, 0);

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        assert!(!conn.is_reused());
    }

    #[tokio::test]
    async fn waiter_receives_released_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let pool = pool(2);
        let counter = Counter::default();

        let first = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let second = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let first_id = first.id;

        let waiter = {
            let pool = pool.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                pool.acquire(&key(), false, || counter.connect())
                    .await
                    .map(|conn| (conn.id, conn.is_reused()))
            })
        };

        while pool.stats(&key()).waiting == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats(&key()).active, 2);

        first.release(true);
        let (id, reused) = waiter.await.unwrap().unwrap();
        assert_eq!(id, first_id);
        assert!(reused);
        assert_eq!(counter.count(), 2);
        drop(second);
    }

    #[tokio::test]
    async fn waiter_receives_freed_slot() {
        let pool = pool(1);
        let counter = Counter::default();

        let first = pool.acquire(&key(), false, || counter.connect()).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                pool.acquire(&key(), false, || counter.connect())
                    .await
                    .map(|conn| conn.id)
            })
        };

        while pool.stats(&key()).waiting == 0 {
            tokio::task::yield_now().await;
        }

        first.release(false);
        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, 2);
        assert_eq!(pool.stats(&key()).active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_wait_timeout() {
        let pool = pool(1);
        let counter = Counter::default();

        let _held = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let result = pool.acquire(&key(), false, || counter.connect()).await;

        assert!(matches!(result, Err(Error::Exhausted)));
        assert_eq!(pool.stats(&key()).active, 1);
        assert_eq!(counter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connection_is_not_reused() {
        let pool = pool(4);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        conn.release(true);

        tokio::time::advance(Duration::from_secs(11)).await;

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(counter.count(), 2);
        assert!(!handle.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_closes_idle() {
        let pool = pool(4);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        conn.release(true);

        pool.evict_expired();
        assert_eq!(pool.stats(&key()).idle, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        pool.evict_expired();
        assert_eq!(pool.stats(&key()), PoolStats::default());
        assert!(!handle.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_evicts_in_background() {
        let pool = Pool::new(Config {
            max_connections_per_origin: 1,
            idle_timeout: Some(Duration::from_secs(5)),
            wait_timeout: None,
            reap_interval: Some(Duration::from_secs(1)),
        });
        let counter = Counter::default();

        let conn: Pooled<MockConnection> =
            pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        conn.release(true);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!handle.load(Ordering::SeqCst));
        assert_eq!(pool.stats(&key()), PoolStats::default());
        pool.drain();
    }

    #[tokio::test]
    async fn cancelled_connect_frees_slot() {
        let pool = pool(1);
        let key = key();

        let pending = pool.acquire(&key, false, || {
            futures_util::future::pending::<Result<MockConnection, std::io::Error>>()
        });
        let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(outcome.is_err());

        assert_eq!(pool.stats(&key), PoolStats::default());
    }

    #[tokio::test]
    async fn failed_connect_frees_slot() {
        let pool = pool(1);

        let result = pool
            .acquire(&key(), false, || async {
                Err::<MockConnection, _>(std::io::Error::other("refused"))
            })
            .await;
        assert!(matches!(result, Err(Error::Connecting(_))));
        assert_eq!(pool.stats(&key()).active, 0);
    }

    #[tokio::test]
    async fn fresh_checkout_skips_idle() {
        let pool = pool(1);
        let counter = Counter::default();

        let conn = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let handle = conn.handle();
        conn.release(true);

        let conn = pool.acquire(&key(), true, || counter.connect()).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(conn.id, 2);
        assert!(!handle.load(Ordering::SeqCst), "idle connection closed to make room");
        assert_eq!(pool.stats(&key()).active, 1);
        assert_eq!(pool.stats(&key()).idle, 0);
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let pool = pool(1);
        let counter = Counter::default();
        let other = OriginKey::new(Scheme::Https, "example.com", 443);

        let idle = pool.acquire(&other, false, || counter.connect()).await.unwrap();
        let idle_handle = idle.handle();
        idle.release(true);

        let held = pool.acquire(&key(), false, || counter.connect()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                pool.acquire(&key(), false, || counter.connect())
                    .await
                    .map(|conn| conn.id)
            })
        };
        while pool.stats(&key()).waiting == 0 {
            tokio::task::yield_now().await;
        }

        let token = pool.shutdown_token();
        pool.drain();

        assert!(token.is_cancelled());
        assert!(pool.is_closed());
        assert!(!idle_handle.load(Ordering::SeqCst));
        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));

        let held_handle = held.handle();
        held.release(true);
        assert!(!held_handle.load(Ordering::SeqCst));

        let result = pool.acquire(&key(), false, || counter.connect()).await;
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[test]
    fn slot_without_pool_is_inert() {
        let slot: Slot<MockConnection> = Slot::new(key(), WeakOpt::none());
        drop(slot);
    }
}
