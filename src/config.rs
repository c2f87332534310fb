//! Server configuration.
//!
//! [`Config`] collects every tunable the server understands. Values come
//! from three layers, each overriding the previous one: built-in defaults,
//! an optional configuration file (`-c/--config`, `key = value` lines) and
//! the command line flags.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on. Port 0 binds an OS-assigned ephemeral port.
    pub port: u16,
    /// Address to bind to.
    pub bind_address: IpAddr,
    /// Length of the kernel accept queue.
    pub backlog: i32,
    /// Maximum number of connections held at once; accepts beyond this are
    /// closed immediately.
    pub max_connections: usize,

    /// Number of worker threads.
    pub thread_count: usize,
    /// Maximum number of queued tasks, 0 means unbounded.
    pub max_queue_size: usize,

    /// Idle connections older than this are reaped.
    pub connection_timeout: Duration,
    /// How long a kept-alive connection may sit between requests.
    pub keep_alive_timeout: Duration,
    /// How long shutdown waits for in-flight connections to drain.
    pub shutdown_timeout: Duration,

    /// Directory served and written to by uploads.
    pub document_root: PathBuf,
    /// Directory holding HTML templates.
    pub template_dir: PathBuf,
    /// Files larger than this are refused.
    pub max_file_size: u64,
    /// Size of the per-read socket buffer.
    pub buffer_size: usize,

    /// Minimum level to log at.
    pub log_level: LogLevel,
    /// Log file, `None` means standard error.
    pub log_file: Option<PathBuf>,

    /// Use `sendfile(2)` for file responses.
    pub enable_sendfile: bool,
    /// Allow HTTP keep-alive.
    pub enable_keepalive: bool,
    /// Accepted for compatibility, has no effect.
    pub enable_gzip: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8888,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            backlog: 1024,
            max_connections: 10_000,
            thread_count: hardware_threads(),
            max_queue_size: 10_000,
            connection_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
            document_root: PathBuf::from("./filedir"),
            template_dir: PathBuf::from("./html"),
            max_file_size: 100 * 1024 * 1024,
            buffer_size: 8192,
            log_level: LogLevel::Info,
            log_file: None,
            enable_sendfile: true,
            enable_keepalive: true,
            enable_gzip: false,
        }
    }
}

fn hardware_threads() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

impl Config {
    /// Build a configuration from the process arguments.
    ///
    /// The configuration file (if any) is applied first, the remaining
    /// command line flags override it.
    pub fn from_args() -> Result<Config, Error> {
        Config::from_arg_list(Args::parse())
    }

    fn from_arg_list(args: Args) -> Result<Config, Error> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(threads) = args.threads {
            config.thread_count = threads;
        }
        if let Some(root) = args.document_root {
            config.document_root = root;
        }
        if let Some(level) = args.log_level {
            config.log_level = level;
        }
        if let Some(file) = args.log_file {
            config.log_file = Some(file);
        }
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file: one `key = value` per line, `#` starts a
    /// comment. Unknown keys and unparsable values are errors.
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| Error::new(format!("can't read config file '{}': {err}", path.display())))?;
        let mut config = Config::default();
        for (n, line) in contents.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| Error::new(format!("line {}: expected 'key = value'", n + 1)))?;
            config
                .set(key, value)
                .map_err(|err| Error::new(format!("line {}: {}", n + 1, err.message)))?;
        }
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "port" => self.port = parse(key, value)?,
            "bind_address" => self.bind_address = parse(key, value)?,
            "backlog" => self.backlog = parse(key, value)?,
            "max_connections" => self.max_connections = parse(key, value)?,
            "thread_count" => self.thread_count = parse(key, value)?,
            "max_queue_size" => self.max_queue_size = parse(key, value)?,
            "connection_timeout" => self.connection_timeout = parse_secs(key, value)?,
            "keep_alive_timeout" => self.keep_alive_timeout = parse_secs(key, value)?,
            "shutdown_timeout" => self.shutdown_timeout = parse_secs(key, value)?,
            "document_root" => self.document_root = PathBuf::from(value),
            "template_dir" => self.template_dir = PathBuf::from(value),
            "max_file_size" => self.max_file_size = parse(key, value)?,
            "buffer_size" => self.buffer_size = parse(key, value)?,
            "log_level" => self.log_level = parse(key, value)?,
            "log_file" => self.log_file = Some(PathBuf::from(value)),
            "enable_sendfile" => self.enable_sendfile = parse_bool(key, value)?,
            "enable_keepalive" => self.enable_keepalive = parse_bool(key, value)?,
            "enable_gzip" => self.enable_gzip = parse_bool(key, value)?,
            _ => return Err(Error::new(format!("unknown option '{key}'"))),
        }
        Ok(())
    }

    /// Check the configuration for values the server can't run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.thread_count == 0 {
            return Err(Error::new("thread_count must be at least 1".to_owned()));
        }
        if self.backlog <= 0 {
            return Err(Error::new("backlog must be positive".to_owned()));
        }
        if self.max_connections == 0 {
            return Err(Error::new("max_connections must be at least 1".to_owned()));
        }
        if self.buffer_size == 0 {
            return Err(Error::new("buffer_size must be at least 1".to_owned()));
        }
        if self.document_root.as_os_str().is_empty() {
            return Err(Error::new("document_root must not be empty".to_owned()));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|err| Error::new(format!("invalid value '{value}' for '{key}': {err}")))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, Error> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::new(format!("invalid value '{value}' for '{key}': expected true or false"))),
    }
}

/// Minimum level to log at.
#[derive(Copy, Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<LogLevel, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level '{s}', expected debug|info|warn|error")),
        }
    }
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "depot", version, about = "Single-host HTTP/1.1 file server")]
struct Args {
    /// Listen port.
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// Worker thread count, defaults to the number of CPUs.
    #[arg(short = 't', long)]
    threads: Option<usize>,
    /// Directory served and written to by uploads.
    #[arg(short = 'd', long = "document-root")]
    document_root: Option<PathBuf>,
    /// Minimum level to log at.
    #[arg(short = 'l', long = "log-level", value_enum)]
    log_level: Option<LogLevel>,
    /// Log file, defaults to standard error.
    #[arg(short = 'f', long = "log-file")]
    log_file: Option<PathBuf>,
    /// Configuration file.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

/// Invalid configuration.
#[derive(Debug)]
pub struct Error {
    message: String,
}

impl Error {
    fn new(message: String) -> Error {
        Error { message }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Error {}
