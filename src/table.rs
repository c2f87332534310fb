//! Connection table.
//!
//! One [`Connection`] record per accepted socket, owned by the
//! [`ConnectionTable`] and shared with worker tasks as an
//! `Arc<Mutex<Connection>>`. The one-shot registration discipline keeps the
//! record's mutex uncontended: at most one worker holds it at any instant,
//! the lock exists to satisfy the borrow rules, not to schedule.
//!
//! The table itself is guarded by a single mutex whose critical sections
//! are map operations only. The idle sweep uses `try_lock` on the records:
//! a record whose lock is held is being worked on and is not idle.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;

use crate::net;
use crate::request::Request;
use crate::response::Response;

/// Life cycle state of a connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connected,
    Reading,
    Writing,
    Closing,
    Closed,
}

/// A single accepted connection.
///
/// Owns the socket fd; the fd is closed exactly once, either by an explicit
/// [`close`] or when the last handle to the record is dropped.
///
/// [`close`]: Connection::close
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    state: ConnectionState,
    created_at: Instant,
    last_activity: Instant,
    request_count: u64,
    /// Current request, reset between requests on keep-alive.
    pub request: Request,
    /// Current response, reset between requests on keep-alive.
    pub response: Response,
}

impl Connection {
    fn new(fd: RawFd, peer: SocketAddr) -> Connection {
        let now = Instant::now();
        Connection {
            fd,
            peer,
            state: ConnectionState::Connected,
            created_at: now,
            last_activity: now,
            request_count: 0,
            request: Request::new(),
            response: Response::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Change the state, also updating the activity timestamp.
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.touch();
    }

    /// Record activity on the connection.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn increment_request_count(&mut self) {
        self.request_count += 1;
    }

    /// Reset the request and response records for the next keep-alive
    /// cycle. Unparsed bytes already received are carried over so pipelined
    /// requests are not lost.
    pub fn reset_cycle(&mut self) {
        self.request.reset();
        self.response = Response::new();
    }

    /// Close the socket.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            net::close(self.fd);
            self.fd = -1;
        }
        self.state = ConnectionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.fd < 0 || self.state == ConnectionState::Closed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared handle to a connection record.
pub type ConnectionRef = Arc<Mutex<Connection>>;

/// Lock a connection record, recovering from poisoning.
///
/// A poisoned record means a worker task panicked mid-connection; the
/// record is still structurally sound and the connection is about to be
/// torn down anyway.
pub fn lock(conn: &ConnectionRef) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Table of all live connections, keyed by fd.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<RawFd, ConnectionRef>>,
    max_connections: usize,
    total: AtomicU64,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> ConnectionTable {
        ConnectionTable {
            connections: Mutex::new(HashMap::new()),
            max_connections,
            total: AtomicU64::new(0),
        }
    }

    /// Create a record for a newly accepted socket.
    ///
    /// Fails when the table already holds `max_connections` records; the
    /// caller closes the fd in that case.
    pub fn create(&self, fd: RawFd, peer: SocketAddr) -> Result<ConnectionRef, CapacityExceeded> {
        let mut connections = self.lock_map();
        if connections.len() >= self.max_connections {
            return Err(CapacityExceeded);
        }
        let conn = Arc::new(Mutex::new(Connection::new(fd, peer)));
        connections.insert(fd, Arc::clone(&conn));
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Look up the record for `fd`.
    pub fn get(&self, fd: RawFd) -> Option<ConnectionRef> {
        self.lock_map().get(&fd).map(Arc::clone)
    }

    /// Remove the record for `fd` from the table.
    ///
    /// The fd stays open until the returned handle (and any handle a worker
    /// still holds) is dropped or explicitly closed.
    pub fn remove(&self, fd: RawFd) -> Option<ConnectionRef> {
        self.lock_map().remove(&fd)
    }

    /// Remove and close every connection idle for longer than `timeout`.
    ///
    /// Returns the number of connections reaped.
    pub fn sweep_idle(&self, timeout: Duration) -> usize {
        let stale = {
            let mut connections = self.lock_map();
            let mut stale_fds = Vec::new();
            for (&fd, conn) in connections.iter() {
                // A held lock means a worker is on it right now.
                if let Ok(conn) = conn.try_lock() {
                    if conn.is_idle(timeout) {
                        stale_fds.push(fd);
                    }
                }
            }
            stale_fds
                .iter()
                .filter_map(|fd| connections.remove(fd))
                .collect::<Vec<_>>()
        };

        let count = stale.len();
        for conn in stale {
            let mut conn = lock(&conn);
            debug!(fd = conn.fd(), peer:% = conn.peer(); "reaping idle connection");
            conn.set_state(ConnectionState::Closing);
            conn.close();
        }
        count
    }

    /// Close every connection and empty the table.
    pub fn close_all(&self) {
        let all: Vec<_> = self.lock_map().drain().map(|(_, conn)| conn).collect();
        for conn in all {
            lock(&conn).close();
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of connections ever created.
    pub fn total_connections(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<RawFd, ConnectionRef>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The table already holds the maximum number of connections.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CapacityExceeded;

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection limit reached")
    }
}

impl std::error::Error for CapacityExceeded {}
