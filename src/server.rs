//! The reactor.
//!
//! A single thread owns the listen socket, the [`Poller`] and the
//! [`ConnectionTable`] and waits for readiness. New connections are drained
//! off the listener (edge-triggered) and registered read-interest,
//! edge-triggered and one-shot. Client readiness is handed to the
//! [`WorkerPool`] as a read or write task; the task drives the connection's
//! parser or sender and re-arms the one-shot registration when it is done.
//! Because a one-shot fd is quiescent until re-armed, at most one task ever
//! operates on a connection.
//!
//! `SIGINT`/`SIGTERM` write a byte into a self-pipe whose read end is
//! polled alongside the sockets, waking the loop for a graceful shutdown:
//! stop accepting, wait up to `shutdown_timeout` for in-flight connections
//! to drain, then stop the pool and close everything.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use socket2::Socket;

use crate::config::Config;
use crate::net;
use crate::poll::{Event, Interest, Poller};
use crate::pool::WorkerPool;
use crate::request::Phase;
use crate::response::{Response, SendProgress};
use crate::table::{self, Connection, ConnectionState, ConnectionTable};

/// How long a single `wait` blocks; also the idle-sweep tick.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive multiplexer failures tolerated before giving up.
const MAX_POLL_FAILURES: u32 = 3;

/// Process-wide flag set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Write end of the self-pipe the signal handler writes into.
///
/// Set once by the first server created in the process; the matching
/// keep-alive below makes sure the fd stays valid for the lifetime of the
/// process, signal handlers have no way to synchronize with a close.
static SIGNAL_PIPE: OnceLock<RawFd> = OnceLock::new();
static SIGNAL_PIPE_KEEPALIVE: OnceLock<Arc<OwnedFd>> = OnceLock::new();

/// The HTTP file server.
#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    listener: Socket,
    local_addr: SocketAddr,
    poller: Arc<Poller>,
    pool: WorkerPool,
    table: Arc<ConnectionTable>,
    pipe_read: OwnedFd,
    pipe_write: Arc<OwnedFd>,
    /// Per-server stop flag; the process-wide [`SHUTDOWN`] also stops the
    /// loop.
    stop: Arc<AtomicBool>,
    total_requests: Arc<AtomicU64>,
    started_at: Instant,
}

impl Server {
    /// Set up the listen socket, multiplexer, signal handling, worker pool
    /// and connection table.
    ///
    /// Errors here are fatal; the reactor never started.
    pub fn new(config: Config) -> Result<Server, Error> {
        let config = Arc::new(config);
        let address = SocketAddr::new(config.bind_address, config.port);

        let listener = net::bind_socket(address).map_err(Error::Bind)?;
        net::listen(&listener, config.backlog).map_err(Error::Listen)?;
        let local_addr = net::local_addr(&listener).map_err(Error::Bind)?;

        let poller = Poller::new().map_err(Error::Multiplexer)?;
        poller
            .add(listener.as_raw_fd(), Interest::READABLE, true, false)
            .map_err(Error::Multiplexer)?;

        let (pipe_read, pipe_write) = new_pipe().map_err(Error::Signal)?;
        poller
            .add(pipe_read.as_raw_fd(), Interest::READABLE, false, false)
            .map_err(Error::Multiplexer)?;
        let pipe_write = Arc::new(pipe_write);
        setup_signal_handling(&pipe_write).map_err(Error::Signal)?;

        let pool = WorkerPool::new(config.thread_count, config.max_queue_size).map_err(Error::Pool)?;
        let table = Arc::new(ConnectionTable::new(config.max_connections));

        info!(
            address:% = local_addr,
            threads = config.thread_count,
            max_connections = config.max_connections;
            "server initialized",
        );

        Ok(Server {
            config,
            listener,
            local_addr,
            poller: Arc::new(poller),
            pool,
            table,
            pipe_read,
            pipe_write,
            stop: Arc::new(AtomicBool::new(false)),
            total_requests: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops this server from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            pipe_write: Arc::clone(&self.pipe_write),
        }
    }

    /// Counters for observability.
    pub fn stats(&self) -> Stats {
        Stats {
            uptime: self.started_at.elapsed(),
            total_connections: self.table.total_connections(),
            active_connections: self.table.len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            thread_count: self.pool.thread_count(),
        }
    }

    /// Run the event loop until a shutdown is requested.
    pub fn run(&mut self) -> Result<(), Error> {
        self.started_at = Instant::now();
        info!(address:% = self.local_addr; "listening");

        let listen_fd = self.listener.as_raw_fd();
        let pipe_fd = self.pipe_read.as_raw_fd();
        let mut events: Vec<Event> = Vec::new();
        let mut poll_failures = 0;

        while !self.should_stop() {
            if let Err(err) = self.poller.wait(&mut events, Some(POLL_TIMEOUT)) {
                poll_failures += 1;
                error!("waiting for readiness failed: {err}");
                if poll_failures >= MAX_POLL_FAILURES {
                    return Err(Error::Multiplexer(err));
                }
                continue;
            }
            poll_failures = 0;

            if events.is_empty() {
                // Timeout tick; use it to reap idle connections.
                let reaped = self.table.sweep_idle(self.config.connection_timeout);
                if reaped > 0 {
                    debug!(count = reaped, active = self.table.len(); "reaped idle connections");
                }
                continue;
            }

            for event in &events {
                let fd = event.fd();
                if fd == listen_fd {
                    self.accept_ready();
                } else if fd == pipe_fd {
                    self.wake_up();
                } else if event.is_hangup() || event.is_error() {
                    debug!(fd = fd; "connection hung up");
                    remove_connection(fd, &self.table, &self.poller);
                } else if event.is_readable() {
                    self.dispatch(fd, Interest::READABLE);
                } else if event.is_writable() {
                    self.dispatch(fd, Interest::WRITABLE);
                }
            }
        }

        self.shutdown_gracefully();
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || SHUTDOWN.load(Ordering::Relaxed)
    }

    /// Drain pending accepts off the listener.
    fn accept_ready(&self) {
        loop {
            match net::accept(&self.listener) {
                Ok(Some((socket, peer))) => {
                    let fd = socket.into_raw_fd();
                    match self.table.create(fd, peer) {
                        Ok(_) => {
                            if let Err(err) = self.poller.add(fd, Interest::READABLE, true, true) {
                                error!(fd = fd; "can't register connection: {err}");
                                if let Some(conn) = self.table.remove(fd) {
                                    table::lock(&conn).close();
                                }
                                continue;
                            }
                            debug!(fd = fd, peer:% = peer, active = self.table.len(); "accepted connection");
                        }
                        Err(err) => {
                            warn!(peer:% = peer; "{err}, closing new connection");
                            net::close(fd);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    /// The self-pipe became readable: a signal arrived or a shutdown handle
    /// was used.
    fn wake_up(&self) {
        let mut buf = [0u8; 64];
        let fd = self.pipe_read.as_raw_fd();
        while matches!(
            syscall!(read(fd, buf.as_mut_ptr().cast(), buf.len())),
            Ok(n) if n > 0
        ) {}
        if SHUTDOWN.load(Ordering::Relaxed) {
            info!("received shutdown signal");
        }
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Hand a client readiness event to the worker pool.
    fn dispatch(&self, fd: RawFd, interest: Interest) {
        let table = Arc::clone(&self.table);
        let poller = Arc::clone(&self.poller);
        let config = Arc::clone(&self.config);
        let total_requests = Arc::clone(&self.total_requests);
        let result = if interest.is_readable() {
            self.pool
                .submit(move || read_task(fd, &table, &poller, &config, &total_requests))
        } else {
            self.pool
                .submit(move || write_task(fd, &table, &poller, &config, &total_requests))
        };
        if let Err(err) = result {
            // The fd stays disarmed; the idle sweep will reap it.
            warn!(fd = fd; "can't submit task: {err}");
        }
    }

    /// Refuse new connections, drain in-flight ones bounded by
    /// `shutdown_timeout`, then tear the pool down.
    fn shutdown_gracefully(&mut self) {
        info!(active = self.table.len(); "shutting down");
        let _ = self.poller.remove(self.listener.as_raw_fd());

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.table.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        self.pool.shutdown(true);
        self.table.close_all();

        let stats = self.stats();
        info!(
            uptime_secs = stats.uptime.as_secs(),
            total_connections = stats.total_connections,
            total_requests = stats.total_requests,
            completed_tasks = self.pool.completed_tasks();
            "server stopped",
        );
    }
}

/// Stops a [`Server`] from another thread.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    pipe_write: Arc<OwnedFd>,
}

impl ShutdownHandle {
    /// Request a graceful shutdown and wake the reactor.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let byte = 1u8;
        let _ = syscall!(write(self.pipe_write.as_raw_fd(), (&byte as *const u8).cast(), 1));
    }
}

/// Server counters.
#[derive(Clone, Debug)]
pub struct Stats {
    pub uptime: Duration,
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_requests: u64,
    pub thread_count: usize,
}

/// Drive the connection's parser on newly readable input.
fn read_task(
    fd: RawFd,
    table: &ConnectionTable,
    poller: &Poller,
    config: &Config,
    total_requests: &AtomicU64,
) {
    let Some(conn) = table.get(fd) else {
        let _ = poller.remove(fd);
        return;
    };
    let mut conn = table::lock(&conn);
    if conn.is_closed() {
        return;
    }
    conn.set_state(ConnectionState::Reading);

    let mut buf = vec![0u8; config.buffer_size];
    loop {
        match syscall!(read(fd, buf.as_mut_ptr().cast(), buf.len())) {
            Ok(0) => {
                debug!(fd = fd; "peer closed the connection");
                close_connection(&mut conn, table, poller);
                return;
            }
            Ok(n) => {
                conn.touch();
                let phase = conn.request.feed(&buf[..n as usize], &config.document_root);
                if matches!(phase, Phase::Complete | Phase::Failed) {
                    break;
                }
                // Edge-triggered: keep reading until the socket runs dry.
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(fd = fd; "read failed: {err}");
                close_connection(&mut conn, table, poller);
                return;
            }
        }
    }

    continue_cycle(&mut conn, fd, table, poller, config, total_requests);
}

/// Drive the connection's sender on a writable socket.
fn write_task(
    fd: RawFd,
    table: &ConnectionTable,
    poller: &Poller,
    config: &Config,
    total_requests: &AtomicU64,
) {
    let Some(conn) = table.get(fd) else {
        let _ = poller.remove(fd);
        return;
    };
    let mut conn = table::lock(&conn);
    if conn.is_closed() {
        return;
    }
    conn.set_state(ConnectionState::Writing);

    match conn.response.send(fd) {
        Ok(SendProgress::Done) => {
            conn.touch();
            debug!(
                fd = fd,
                status = conn.response.status_code(),
                bytes = conn.response.bytes_sent();
                "response sent",
            );
            if conn.response.keep_alive() {
                conn.reset_cycle();
                // A pipelined request may be sitting in the buffer already.
                conn.request.advance(&config.document_root);
                continue_cycle(&mut conn, fd, table, poller, config, total_requests);
            } else {
                close_connection(&mut conn, table, poller);
            }
        }
        Ok(SendProgress::Blocked) => {
            conn.touch();
            arm(&mut conn, fd, Interest::WRITABLE, table, poller);
        }
        Err(err) => {
            warn!(fd = fd, peer:% = conn.peer(); "sending response failed: {err}");
            close_connection(&mut conn, table, poller);
        }
    }
}

/// Act on the parser's phase: build a response and arm for writing, or arm
/// for more input.
fn continue_cycle(
    conn: &mut Connection,
    fd: RawFd,
    table: &ConnectionTable,
    poller: &Poller,
    config: &Config,
    total_requests: &AtomicU64,
) {
    match conn.request.phase() {
        Phase::Complete => {
            conn.increment_request_count();
            total_requests.fetch_add(1, Ordering::Relaxed);
            debug!(
                fd = fd,
                method = conn.request.method.as_str(),
                uri = conn.request.uri.as_str(),
                requests = conn.request_count();
                "request complete",
            );
            let response = Response::build(&conn.request, config);
            conn.response = response;
            conn.set_state(ConnectionState::Writing);
            arm(conn, fd, Interest::WRITABLE, table, poller);
        }
        Phase::Failed => {
            if let Some(err) = conn.request.error() {
                warn!(fd = fd, peer:% = conn.peer(); "bad request: {err}");
            }
            let response = Response::build_error(&conn.request, config);
            conn.response = response;
            conn.set_state(ConnectionState::Writing);
            arm(conn, fd, Interest::WRITABLE, table, poller);
        }
        _ => {
            conn.set_state(ConnectionState::Connected);
            arm(conn, fd, Interest::READABLE, table, poller);
        }
    }
}

/// Re-arm the one-shot registration; failing that the connection is dead.
fn arm(conn: &mut Connection, fd: RawFd, interest: Interest, table: &ConnectionTable, poller: &Poller) {
    if let Err(err) = poller.modify(fd, interest, true, true) {
        warn!(fd = fd; "can't re-arm connection: {err}");
        close_connection(conn, table, poller);
    }
}

/// Tear down a connection a worker currently holds the lock for.
fn close_connection(conn: &mut Connection, table: &ConnectionTable, poller: &Poller) {
    let fd = conn.fd();
    if fd >= 0 {
        let _ = poller.remove(fd);
        let _ = table.remove(fd);
    }
    conn.set_state(ConnectionState::Closing);
    conn.close();
}

/// Tear down a connection from the reactor (hangup and error events).
fn remove_connection(fd: RawFd, table: &ConnectionTable, poller: &Poller) {
    let _ = poller.remove(fd);
    if let Some(conn) = table.remove(fd) {
        let mut conn = table::lock(&conn);
        conn.set_state(ConnectionState::Closing);
        conn.close();
    }
}

/// Create the non-blocking self-pipe.
fn new_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1, -1];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    // SAFETY: pipe2 initialized both fds and nothing else owns them.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

/// Install the `SIGINT`/`SIGTERM` handlers and ignore `SIGPIPE`.
///
/// The handler only writes a byte into the self-pipe and sets a flag, both
/// async-signal-safe. Only the first server's pipe receives signal bytes;
/// later servers still observe the process-wide flag on their next tick.
fn setup_signal_handling(pipe_write: &Arc<OwnedFd>) -> io::Result<()> {
    if SIGNAL_PIPE.set(pipe_write.as_raw_fd()).is_ok() {
        let _ = SIGNAL_PIPE_KEEPALIVE.set(Arc::clone(pipe_write));
    }

    // SAFETY: standard sigaction setup; the handler is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = handle_signal;
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGTERM, &action, ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
    if let Some(&fd) = SIGNAL_PIPE.get() {
        let byte = 1u8;
        // A full pipe is fine, the reactor is woken either way.
        unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    }
}

/// Error starting or running the server.
#[derive(Debug)]
pub enum Error {
    /// Can't create or bind the listen socket.
    Bind(io::Error),
    /// Can't start listening.
    Listen(io::Error),
    /// Can't create or drive the readiness multiplexer.
    Multiplexer(io::Error),
    /// Can't set up the self-pipe or signal handlers.
    Signal(io::Error),
    /// Can't start the worker pool.
    Pool(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Bind(err) => write!(f, "can't bind listen socket: {err}"),
            Error::Listen(err) => write!(f, "can't listen: {err}"),
            Error::Multiplexer(err) => write!(f, "multiplexer error: {err}"),
            Error::Signal(err) => write!(f, "can't set up signal handling: {err}"),
            Error::Pool(err) => write!(f, "can't start worker pool: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(err)
            | Error::Listen(err)
            | Error::Multiplexer(err)
            | Error::Signal(err)
            | Error::Pool(err) => Some(err),
        }
    }
}
