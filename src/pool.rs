//! Skyhash connection pool.
//!
//! The pool lends out one [`Connection`] at a time per borrower and never has
//! more than `capacity` connections open. Borrowing follows a fixed ladder:
//! take an idle connection if there is one, otherwise open a new one if the
//! pool is below capacity, otherwise wait until a connection is returned.
//!
//! Returned connections that closed while borrowed are discarded instead of
//! going back to the idle set. [`ConnectionPool::for_each`] applies an
//! operation to every connection that was open when it was called.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::action::Action;
use crate::config::{AuthProvider, ConnectionConfig, PoolConfig};
use crate::connection::Connection;
use crate::error::{Result, UsageError};
use crate::query::{QueryPacket, ResponsePacket};
use crate::skyhash::types::Value;

/// Future returned by the operation passed to [`ConnectionPool::for_each`].
pub type ConnFuture<'c> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'c>>;

/// A pool-owned connection with the id it was registered under.
struct Member {
    id: u64,
    conn: Connection,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection borrowed from the pool.
///
/// When dropped, the connection is returned to the pool, or discarded if it
/// closed while borrowed.
pub struct PooledConnection {
    /// The borrowed member (None once returned to the pool)
    member: Option<Member>,
    /// Reference back to the pool
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Pool-assigned id of this connection.
    pub fn id(&self) -> u64 {
        self.member.as_ref().map(|m| m.id).unwrap_or_default()
    }

    /// Return the connection to the pool now.
    pub fn release(self) {}
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.member {
            Some(member) => &member.conn,
            None => unreachable!("member is only taken on drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.member {
            Some(member) => &mut member.conn,
            None => unreachable!("member is only taken on drop"),
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("conn", &self.member.as_ref().map(|m| &m.conn))
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(member) = self.member.take() {
            self.pool.release(member);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Idle set and live registry, guarded together.
struct PoolState {
    /// Connections waiting to be borrowed
    idle: VecDeque<Member>,
    /// Ids of every open member, idle or borrowed
    live: HashSet<u64>,
    closed: bool,
}

/// Internal pool state.
struct PoolInner {
    capacity: usize,
    /// Settings for new connections; broadcasts update it
    template: Mutex<ConnectionConfig>,
    state: Mutex<PoolState>,
    /// Woken whenever a member is returned or a slot frees up
    available: Notify,
    /// Open connections, including ones still being dialed
    opened: AtomicUsize,
    next_id: AtomicU64,
}

impl PoolInner {
    /// Reserve a slot for a new connection if below capacity.
    fn try_reserve(&self) -> bool {
        self.opened
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn unreserve(&self) {
        self.opened.fetch_sub(1, Ordering::AcqRel);
        self.available.notify_waiters();
    }

    fn release(&self, member: Member) {
        let discarded = {
            let mut state = self.state.lock();
            if member.conn.is_closed() || state.closed {
                state.live.remove(&member.id);
                Some(member)
            } else {
                state.idle.push_back(member);
                None
            }
        };

        if let Some(member) = discarded {
            if member.conn.is_closed() {
                warn!(
                    id = member.id,
                    error = ?member.conn.last_error(),
                    "discarding closed pool connection"
                );
            }
            drop(member);
            self.opened.fetch_sub(1, Ordering::AcqRel);
        }
        self.available.notify_waiters();
    }
}

/// Returns a reserved slot unless the open succeeded.
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.unreserve();
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A Skyhash connection pool.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.inner.capacity)
            .field("opened", &self.opened_conns())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. Connections are opened lazily.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity: config.capacity,
                template: Mutex::new(config.connection),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: HashSet::new(),
                    closed: false,
                }),
                available: Notify::new(),
                opened: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create a pool and open its first connection, so bad settings fail early.
    pub async fn connect(config: PoolConfig) -> Result<Self> {
        let pool = Self::new(config)?;
        pool.acquire().await?.release();
        Ok(pool)
    }

    /// Borrow a connection, opening one if the pool is below capacity.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.borrow(false).await
    }

    /// Borrow a connection.
    ///
    /// With `block_if_empty` set no new connection is ever opened; the call
    /// waits for an existing one to be returned instead.
    pub async fn borrow(&self, block_if_empty: bool) -> Result<PooledConnection> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(UsageError::PoolClosed.into());
                }
                state.idle.pop_front()
            };
            if let Some(member) = idle {
                return Ok(self.lend(member));
            }

            if !block_if_empty && self.inner.try_reserve() {
                let member = self.open_member().await?;
                return Ok(self.lend(member));
            }

            notified.await;
        }
    }

    /// Open a connection for a slot that is already reserved.
    async fn open_member(&self) -> Result<Member> {
        let mut reservation = Reservation {
            inner: &self.inner,
            armed: true,
        };

        let config = self.inner.template.lock().clone();
        let conn = Connection::open(config).await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(UsageError::PoolClosed.into());
            }
            state.live.insert(id);
        }
        reservation.armed = false;

        debug!(id, opened = self.opened_conns(), "opened pool connection");
        Ok(Member { id, conn })
    }

    fn lend(&self, member: Member) -> PooledConnection {
        PooledConnection {
            member: Some(member),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Apply `f` to every connection that is open at call time, exactly once.
    ///
    /// Busy connections are waited for; connections opened after the call
    /// starts are left alone, and connections that close meanwhile drop out.
    /// Each visited connection is held until all are done. Stops at the first
    /// error.
    ///
    /// ```ignore
    /// pool.for_each(|conn| Box::pin(async move { conn.heya().await })).await?;
    /// ```
    pub async fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: for<'c> FnMut(&'c mut Connection) -> ConnFuture<'c>,
    {
        let mut targets: HashSet<u64> = self.inner.state.lock().live.clone();
        let mut held: Vec<PooledConnection> = Vec::with_capacity(targets.len());

        while !targets.is_empty() {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(UsageError::PoolClosed.into());
                }
                targets.retain(|id| state.live.contains(id));
                state
                    .idle
                    .iter()
                    .position(|m| targets.contains(&m.id))
                    .and_then(|i| state.idle.remove(i))
            };

            match next {
                Some(member) => {
                    targets.remove(&member.id);
                    let mut conn = self.lend(member);
                    let result = f(&mut *conn).await;
                    held.push(conn);
                    result?;
                }
                None if targets.is_empty() => break,
                None => notified.await,
            }
        }

        debug!(visited = held.len(), "broadcast finished");
        Ok(())
    }

    // ========================================================================
    // Broadcast operations
    // ========================================================================

    /// Select `path` on every open connection and make it the default for new
    /// ones.
    pub async fn use_namespace(&self, path: &str) -> Result<()> {
        self.inner.template.lock().namespace = Some(path.to_string());
        let path = path.to_string();
        self.for_each(|conn| {
            let path = path.clone();
            Box::pin(async move { conn.use_namespace(&path).await })
        })
        .await
    }

    /// Log in on every open connection and use these credentials for new ones.
    pub async fn login(&self, username: &str, token: &str) -> Result<()> {
        self.inner.template.lock().auth = Some(AuthProvider::fixed(username, token));
        let (username, token) = (username.to_string(), token.to_string());
        self.for_each(|conn| {
            let (username, token) = (username.clone(), token.clone());
            Box::pin(async move { conn.login(&username, &token).await })
        })
        .await
    }

    /// The namespace new connections select after opening.
    pub fn default_namespace(&self) -> Option<String> {
        self.inner.template.lock().namespace.clone()
    }

    // ========================================================================
    // Single-connection operations
    // ========================================================================

    pub async fn send_and_receive(&self, packet: QueryPacket) -> Result<ResponsePacket> {
        self.acquire().await?.send_and_receive(packet).await
    }

    pub async fn exec(&self, action: impl Action + 'static) -> Result<Value> {
        self.acquire().await?.exec(action).await
    }

    pub async fn exec_command(&self, line: &str) -> Result<Value> {
        self.acquire().await?.exec_command(line).await
    }

    pub async fn heya(&self) -> Result<()> {
        self.acquire().await?.heya().await
    }

    pub async fn get(&self, key: &str) -> Result<Value> {
        self.acquire().await?.get(key).await
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.acquire().await?.set(key, value).await
    }

    pub async fn del(&self, keys: &[&str]) -> Result<u64> {
        self.acquire().await?.del(keys).await
    }

    pub async fn exists(&self, keys: &[&str]) -> Result<u64> {
        self.acquire().await?.exists(keys).await
    }

    pub async fn sys_info_protocol(&self) -> Result<String> {
        self.acquire().await?.sys_info_protocol().await
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Number of open connections, borrowed or idle.
    pub fn opened_conns(&self) -> usize {
        self.inner.opened.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Close the pool and all idle connections.
    ///
    /// Borrowed connections are discarded when they are returned.
    pub async fn close(&self) {
        let members: Vec<Member> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let members: Vec<Member> = state.idle.drain(..).collect();
            for member in &members {
                state.live.remove(&member.id);
            }
            members
        };

        for mut member in members {
            member.conn.close().await;
            self.inner.opened.fetch_sub(1, Ordering::AcqRel);
        }
        self.inner.available.notify_waiters();
    }
}
