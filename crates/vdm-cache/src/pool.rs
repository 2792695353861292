use crate::error::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// One open RPC session with a VistA.
pub trait RpcSession: Send {
    /// Invoke `rpc` with literal parameters and return the raw reply.
    fn invoke(&mut self, rpc: &str, params: &[String]) -> Result<Vec<u8>>;
}

/// Opens new sessions for a [`ConnectionPool`].
pub trait RpcConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RpcSession>>;

    /// Human readable target, used in logs. Must not contain credentials.
    fn describe(&self) -> String;
}

/// A bounded set of reusable sessions.
///
/// Sessions are opened lazily, up to `size`. A checkout blocks while every session is in use; a
/// session whose call failed is closed instead of being handed to the next caller.
pub struct ConnectionPool {
    connector: Box<dyn RpcConnector>,
    size: usize,
    checkout_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Box<dyn RpcSession>>,
    open: usize,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("target", &self.connector.describe())
            .field("size", &self.size)
            .field("open", &state.open)
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        connector: impl RpcConnector + 'static,
        size: usize,
        checkout_timeout: Duration,
    ) -> Self {
        Self {
            connector: Box::new(connector),
            size: size.max(1),
            checkout_timeout,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of sessions currently open (idle or checked out).
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open
    }

    /// Check out a session, invoke `rpc`, and return the session to the pool.
    pub fn invoke(&self, rpc: &str, params: &[String]) -> Result<Vec<u8>> {
        let mut session = self.checkout()?;
        match session.invoke(rpc, params) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                session.discard();
                Err(err)
            }
        }
    }

    pub fn checkout(&self) -> Result<PooledSession<'_>> {
        // An unrepresentable deadline means waiting without one.
        let deadline = Instant::now().checked_add(self.checkout_timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(session) = state.idle.pop() {
                return Ok(PooledSession {
                    pool: self,
                    session: Some(session),
                });
            }
            if state.open < self.size {
                state.open += 1;
                drop(state);
                return match self.connector.connect() {
                    Ok(session) => {
                        tracing::debug!(
                            target = "vdm.cache",
                            broker = %self.connector.describe(),
                            "opened broker session"
                        );
                        Ok(PooledSession {
                            pool: self,
                            session: Some(session),
                        })
                    }
                    Err(err) => {
                        self.release_slot();
                        Err(err)
                    }
                };
            }
            let Some(deadline) = deadline else {
                self.available.wait(&mut state);
                continue;
            };
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return Err(CacheError::transport(format!(
                    "no broker session became free within {:?} (pool size {})",
                    self.checkout_timeout, self.size
                )));
            }
        }
    }

    fn give_back(&self, session: Box<dyn RpcSession>) {
        self.state.lock().idle.push(session);
        self.available.notify_one();
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

/// A checked-out session; returned to its pool on drop.
pub struct PooledSession<'a> {
    pool: &'a ConnectionPool,
    session: Option<Box<dyn RpcSession>>,
}

impl PooledSession<'_> {
    pub fn invoke(&mut self, rpc: &str, params: &[String]) -> Result<Vec<u8>> {
        match self.session.as_mut() {
            Some(session) => session.invoke(rpc, params),
            None => Err(CacheError::transport("broker session already discarded")),
        }
    }

    /// Close the session instead of returning it to the pool.
    pub fn discard(&mut self) {
        if self.session.take().is_some() {
            self.pool.release_slot();
        }
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session);
        }
    }
}
