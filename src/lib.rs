//! Depot is a single-host HTTP/1.1 file server.
//!
//! The server is built around a reactor: a single thread waits on an
//! [`epoll(7)`] instance for I/O readiness and dispatches the resulting work
//! as closures onto a fixed pool of worker threads. Client sockets are
//! registered edge-triggered and one-shot, which guarantees that at most one
//! worker operates on a connection at any instant; a worker re-arms the
//! registration when it is done with its slice of work.
//!
//! The crate is split along those seams:
//!
//!  * [`poll`]: readiness multiplexer wrapping `epoll`.
//!  * [`pool`]: the worker pool executing read/write tasks.
//!  * [`table`]: the connection table with idle sweeping.
//!  * [`request`]: the incremental HTTP request parser.
//!  * [`upload`]: the streaming `multipart/form-data` handler.
//!  * [`response`]: response building and resumable sending.
//!  * [`server`]: the reactor tying the pieces together.
//!  * [`net`], [`config`], [`logger`]: socket setup, configuration and the
//!    logging backend.
//!
//! [`epoll(7)`]: https://man7.org/linux/man-pages/man7/epoll.7.html

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)? ) ) => {{
        let res = unsafe { libc::$fn($( $arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod config;
pub mod logger;
pub mod net;
pub mod poll;
pub mod pool;
pub mod request;
pub mod response;
pub mod server;
pub mod table;
pub mod upload;

#[doc(no_inline)]
pub use config::Config;
#[doc(no_inline)]
pub use server::Server;
