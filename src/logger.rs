//! Logging backend.
//!
//! The server logs through the [`log`] facade; this module provides the
//! backend. Formatting and writing happen on a dedicated writer thread fed
//! by an unbounded channel, so logging from the reactor or a worker never
//! blocks on the sink. Records are written in logfmt style:
//!
//! ```text
//! ts="Sun, 02 Aug 2026 10:04:11 GMT" lvl="INFO" msg="listening" port=8888
//! ```

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use crossbeam_channel::{unbounded, Sender};
use log::kv::{Key, Value, VisitSource};
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Initialize the global logger.
///
/// Records at `level` and above are formatted and handed to a writer thread
/// which appends them to `file`, or standard error when no file is given.
/// Must be called at most once.
pub fn init(level: LevelFilter, file: Option<&Path>) -> Result<(), Error> {
    let mut sink: Box<dyn Write + Send> = match file {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(Error::Open)?,
        ),
        None => Box::new(io::stderr()),
    };

    let (sender, receiver) = unbounded();
    std::thread::Builder::new()
        .name("depot-logger".to_owned())
        .spawn(move || {
            for message in receiver {
                match message {
                    Message::Entry(line) => {
                        // A failing sink can't be reported anywhere useful.
                        let _ = sink.write_all(line.as_bytes());
                    }
                    Message::Flush(done) => {
                        let _ = sink.flush();
                        let _ = done.send(());
                    }
                }
            }
        })
        .map_err(Error::Spawn)?;

    log::set_boxed_logger(Box::new(Logger { sender })).map_err(Error::SetLogger)?;
    log::set_max_level(level);
    Ok(())
}

/// Block until every record logged so far has reached the sink.
pub fn flush() {
    log::logger().flush();
}

enum Message {
    Entry(String),
    Flush(Sender<()>),
}

struct Logger {
    sender: Sender<Message>,
}

impl log::Log for Logger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        // Level filtering is done by `log::set_max_level`.
        true
    }

    fn log(&self, record: &Record<'_>) {
        let mut line = String::with_capacity(128);
        let ts = httpdate::fmt_http_date(SystemTime::now());
        let _ = write!(
            line,
            "ts=\"{ts}\" lvl=\"{}\" msg=\"{}\"",
            record.level(),
            record.args(),
        );
        let _ = record.key_values().visit(&mut KeyValueWriter { line: &mut line });
        line.push('\n');
        // The writer thread outlives all logging call sites; a send can only
        // fail while the process is tearing down.
        let _ = self.sender.send(Message::Entry(line));
    }

    fn flush(&self) {
        let (done, wait) = crossbeam_channel::bounded(1);
        if self.sender.send(Message::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

struct KeyValueWriter<'a> {
    line: &'a mut String,
}

impl<'a, 'kv> VisitSource<'kv> for KeyValueWriter<'a> {
    fn visit_pair(&mut self, key: Key<'kv>, value: Value<'kv>) -> Result<(), log::kv::Error> {
        let _ = write!(self.line, " {key}={value}");
        Ok(())
    }
}

/// Error initializing the logger.
#[derive(Debug)]
pub enum Error {
    /// Can't open the log file.
    Open(io::Error),
    /// Can't spawn the writer thread.
    Spawn(io::Error),
    /// A logger was already installed.
    SetLogger(SetLoggerError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Open(err) => write!(f, "can't open log file: {err}"),
            Error::Spawn(err) => write!(f, "can't spawn logger thread: {err}"),
            Error::SetLogger(err) => write!(f, "can't install logger: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Open(err) | Error::Spawn(err) => Some(err),
            Error::SetLogger(err) => Some(err),
        }
    }
}
