//! Connection table tests.

use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use depot::table::{ConnectionState, ConnectionTable};

fn peer() -> SocketAddr {
    "127.0.0.1:12345".parse().unwrap()
}

/// A real fd the table can own and close.
fn socket_fd() -> (RawFd, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    (ours.into_raw_fd(), theirs)
}

#[test]
fn create_get_remove() {
    let table = ConnectionTable::new(16);
    let (fd, _keep) = socket_fd();
    let conn = table.create(fd, peer()).unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.total_connections(), 1);

    {
        let conn = conn.lock().unwrap();
        assert_eq!(conn.fd(), fd);
        assert_eq!(conn.peer(), peer());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.request_count(), 0);
    }

    let found = table.get(fd).expect("connection not found");
    assert!(std::sync::Arc::ptr_eq(&conn, &found));
    assert!(table.get(fd + 1).is_none());

    assert!(table.remove(fd).is_some());
    assert!(table.get(fd).is_none());
    assert_eq!(table.len(), 0);
    // Total keeps counting created connections.
    assert_eq!(table.total_connections(), 1);
}

#[test]
fn capacity_is_enforced() {
    let table = ConnectionTable::new(2);
    let (fd_a, _keep_a) = socket_fd();
    let (fd_b, _keep_b) = socket_fd();
    let (fd_c, _keep_c) = socket_fd();
    table.create(fd_a, peer()).unwrap();
    table.create(fd_b, peer()).unwrap();
    assert!(table.create(fd_c, peer()).is_err());
    assert_eq!(table.len(), 2);

    // Freeing a slot makes room again.
    assert!(table.remove(fd_a).is_some());
    assert!(table.create(fd_c, peer()).is_ok());
}

#[test]
fn sweep_reaps_only_idle_connections() {
    let table = ConnectionTable::new(16);
    let (fd_idle, _keep_idle) = socket_fd();
    let (fd_busy, _keep_busy) = socket_fd();
    table.create(fd_idle, peer()).unwrap();
    let busy = table.create(fd_busy, peer()).unwrap();

    thread::sleep(Duration::from_millis(50));
    // Fresh activity protects the busy connection.
    busy.lock().unwrap().touch();

    let reaped = table.sweep_idle(Duration::from_millis(20));
    assert_eq!(reaped, 1);
    assert!(table.get(fd_idle).is_none());
    assert!(table.get(fd_busy).is_some());
    assert!(busy.lock().unwrap().state() != ConnectionState::Closed);
}

#[test]
fn sweep_skips_connections_a_worker_holds() {
    let table = ConnectionTable::new(16);
    let (fd, _keep) = socket_fd();
    let conn = table.create(fd, peer()).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Simulates a worker holding the record.
    let guard = conn.lock().unwrap();
    assert_eq!(table.sweep_idle(Duration::from_millis(20)), 0);
    drop(guard);
    assert_eq!(table.sweep_idle(Duration::from_millis(20)), 1);
}

#[test]
fn close_all_empties_the_table() {
    let table = ConnectionTable::new(16);
    let mut conns = Vec::new();
    let mut keeps = Vec::new();
    for _ in 0..4 {
        let (fd, keep) = socket_fd();
        conns.push(table.create(fd, peer()).unwrap());
        keeps.push(keep);
    }
    table.close_all();
    assert!(table.is_empty());
    for conn in conns {
        let conn = conn.lock().unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.fd(), -1);
    }
}

#[test]
fn keep_alive_reset_preserves_buffered_input() {
    let table = ConnectionTable::new(16);
    let (fd, _keep) = socket_fd();
    let conn = table.create(fd, peer()).unwrap();
    let mut conn = conn.lock().unwrap();

    let root = std::env::temp_dir();
    conn.request.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b", &root);
    conn.increment_request_count();
    conn.reset_cycle();
    // The tail of the pipelined request survived the reset.
    conn.request.feed(b" HTTP/1.1\r\n\r\n", &root);
    assert_eq!(conn.request.uri, "/b");
    assert_eq!(conn.request_count(), 1);
}
