//! Response building and sending.
//!
//! [`Response::build`] routes a completed request to a directory listing,
//! a static file, an upload redirect or an error page. Sending is
//! resumable: [`Response::send`] writes as much as the socket accepts and
//! returns [`SendProgress::Blocked`] on `EAGAIN`, leaving `bytes_sent` in
//! place for the next writable event. File bodies go through `sendfile(2)`
//! when available, falling back to a userspace copy loop.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;

use crate::config::Config;
use crate::request::Request;

/// What the response body is backed by.
#[derive(Debug)]
pub enum BodyKind {
    Empty,
    /// An in-memory HTML page.
    Html(Vec<u8>),
    /// A file served from the document root.
    File {
        path: PathBuf,
        file: File,
        size: u64,
        /// File offset already sent, advanced across partial sends.
        offset: u64,
    },
}

impl BodyKind {
    fn len(&self) -> u64 {
        match self {
            BodyKind::Empty => 0,
            BodyKind::Html(content) => content.len() as u64,
            BodyKind::File { size, .. } => *size,
        }
    }
}

/// Progress of a [`Response::send`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendProgress {
    /// The socket stopped accepting bytes; resume on the next writable
    /// event.
    Blocked,
    /// The full response was sent.
    Done,
}

/// An outgoing HTTP response.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: &'static str,
    /// Extra headers beyond the fixed set written by `finish`.
    headers: Vec<(&'static str, String)>,
    body: BodyKind,
    /// Serialized status line and headers.
    head: Vec<u8>,
    bytes_sent: u64,
    keep_alive: bool,
    use_sendfile: bool,
}

impl Response {
    /// An empty `HTTP/1.1 200 OK` record, replaced by [`Response::build`]
    /// once a request completes.
    pub fn new() -> Response {
        Response {
            status: 200,
            reason: "OK",
            headers: Vec::new(),
            body: BodyKind::Empty,
            head: Vec::new(),
            bytes_sent: 0,
            keep_alive: false,
            use_sendfile: true,
        }
    }

    /// Build the response for a completed request.
    pub fn build(request: &Request, config: &Config) -> Response {
        let keep_alive = config.enable_keepalive && request.is_keep_alive();
        let mut response = Response::route(request, config);
        response.use_sendfile = config.enable_sendfile;
        response.finish(keep_alive);
        response
    }

    /// Build the error response for a failed request.
    pub fn build_error(request: &Request, _config: &Config) -> Response {
        let status = request.error().map_or(400, |err| err.status_code());
        let mut response = Response::error_page(status);
        response.finish(false);
        response
    }

    fn route(request: &Request, config: &Config) -> Response {
        let path = request.uri.split('?').next().unwrap_or("");
        let path = path.split('#').next().unwrap_or("");
        let decoded = percent_decode(path);

        let target = match resolve_path(&config.document_root, &decoded) {
            Ok(target) => target,
            Err(Traversal) => {
                debug!(uri = request.uri.as_str(); "rejecting path escaping the document root");
                return Response::error_page(403);
            }
        };

        match request.method.as_str() {
            "GET" => match target {
                Target::Root => Response::index_page(config),
                Target::Entry(path) => Response::file(&path, config),
            },
            // The multipart body was already streamed to disk by the
            // parser; answer with a redirect back to the listing.
            "POST" if matches!(target, Target::Root) => Response::see_other("/"),
            _ => Response::error_page(404),
        }
    }

    /// The directory listing with the upload form.
    fn index_page(config: &Config) -> Response {
        match list_directory(&config.document_root) {
            Ok(entries) => Response::html(200, "OK", index_html(&entries)),
            Err(err) => {
                debug!(root:% = config.document_root.display(); "can't list document root: {err}");
                Response::error_page(404)
            }
        }
    }

    /// A static file under the document root.
    fn file(path: &Path, config: &Config) -> Response {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => return Response::io_error_page(&err),
        };
        if !metadata.is_file() {
            return Response::error_page(404);
        }
        if metadata.len() > config.max_file_size {
            return Response::error_page(403);
        }
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => return Response::io_error_page(&err),
        };
        let mut response = Response::status(200, "OK");
        response.headers.push(("Content-Type", content_type(path).to_owned()));
        response.body = BodyKind::File {
            path: path.to_path_buf(),
            file,
            size: metadata.len(),
            offset: 0,
        };
        response
    }

    fn see_other(location: &str) -> Response {
        let mut response = Response::status(303, "See Other");
        response.headers.push(("Location", location.to_owned()));
        response
    }

    fn html(status: u16, reason: &'static str, content: String) -> Response {
        let mut response = Response::status(status, reason);
        response.headers.push(("Content-Type", "text/html".to_owned()));
        response.body = BodyKind::Html(content.into_bytes());
        response
    }

    /// A minimal HTML page for an error status.
    pub fn error_page(status: u16) -> Response {
        let reason = reason_phrase(status);
        let content = format!(
            "<!DOCTYPE html>\n<html><head><title>{status} {reason}</title></head>\n\
             <body><h1>{status} {reason}</h1></body></html>\n",
        );
        Response::html(status, reason, content)
    }

    fn io_error_page(err: &io::Error) -> Response {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Response::error_page(403),
            _ => Response::error_page(404),
        }
    }

    fn status(status: u16, reason: &'static str) -> Response {
        let mut response = Response::new();
        response.status = status;
        response.reason = reason;
        response
    }

    /// Serialize the status line and headers.
    ///
    /// Keep-alive is always disabled on 4xx and 5xx responses.
    fn finish(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive && self.status < 400;

        let mut itoa_buf = itoa::Buffer::new();
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(b"HTTP/1.1 ");
        head.extend_from_slice(itoa_buf.format(self.status).as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.reason.as_bytes());
        head.extend_from_slice(b"\r\n");

        head.extend_from_slice(b"Server: depot/");
        head.extend_from_slice(env!("CARGO_PKG_VERSION").as_bytes());
        head.extend_from_slice(b"\r\n");

        let now = httpdate::fmt_http_date(SystemTime::now());
        head.extend_from_slice(b"Date: ");
        head.extend_from_slice(now.as_bytes());
        head.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        head.extend_from_slice(b"Content-Length: ");
        head.extend_from_slice(itoa_buf.format(self.body.len()).as_bytes());
        head.extend_from_slice(b"\r\n");

        head.extend_from_slice(b"Connection: ");
        head.extend_from_slice(if self.keep_alive { b"keep-alive".as_slice() } else { b"close".as_slice() });
        head.extend_from_slice(b"\r\n\r\n");

        self.head = head;
        self.bytes_sent = 0;
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes of head and body sent so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Total size of the serialized response.
    pub fn total_len(&self) -> u64 {
        self.head.len() as u64 + self.body.len()
    }

    /// Send as much of the response as the socket accepts.
    pub fn send(&mut self, fd: RawFd) -> io::Result<SendProgress> {
        loop {
            // Head first.
            let sent = self.bytes_sent as usize;
            if sent < self.head.len() {
                let rest = &self.head[sent..];
                match syscall!(write(fd, rest.as_ptr().cast(), rest.len())) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => self.bytes_sent += n as u64,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(SendProgress::Blocked)
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err),
                }
                continue;
            }

            let head_len = self.head.len() as u64;
            match &mut self.body {
                BodyKind::Empty => return Ok(SendProgress::Done),
                BodyKind::Html(content) => {
                    let offset = (self.bytes_sent - head_len) as usize;
                    if offset == content.len() {
                        return Ok(SendProgress::Done);
                    }
                    let rest = &content[offset..];
                    match syscall!(write(fd, rest.as_ptr().cast(), rest.len())) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => self.bytes_sent += n as u64,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(SendProgress::Blocked)
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err),
                    }
                }
                BodyKind::File { file, size, offset, .. } => {
                    if *offset == *size {
                        return Ok(SendProgress::Done);
                    }
                    if self.use_sendfile {
                        let mut file_offset = *offset as libc::off_t;
                        let count = (*size - *offset) as usize;
                        match syscall!(sendfile(fd, file.as_raw_fd(), &mut file_offset, count)) {
                            // A zero-length transfer this side of EOF means
                            // the file shrank under us.
                            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                            Ok(n) => {
                                *offset += n as u64;
                                self.bytes_sent += n as u64;
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(SendProgress::Blocked)
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(ref err)
                                if matches!(
                                    err.raw_os_error(),
                                    Some(libc::EINVAL | libc::ENOSYS)
                                ) =>
                            {
                                // Not every filesystem supports sendfile.
                                self.use_sendfile = false;
                            }
                            Err(err) => return Err(err),
                        }
                    } else {
                        let mut chunk = [0u8; 8192];
                        file.seek(SeekFrom::Start(*offset))?;
                        let n = file.read(&mut chunk)?;
                        if n == 0 {
                            return Err(io::ErrorKind::UnexpectedEof.into());
                        }
                        match syscall!(write(fd, chunk.as_ptr().cast(), n)) {
                            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                            Ok(written) => {
                                *offset += written as u64;
                                self.bytes_sent += written as u64;
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(SendProgress::Blocked)
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
        }
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

/// Outcome of resolving a request path against the document root.
enum Target {
    /// The document root itself.
    Root,
    /// An entry under the document root.
    Entry(PathBuf),
}

/// The path tried to escape the document root.
struct Traversal;

/// Lexically resolve `path` against `root`.
///
/// `.` and empty segments are dropped and `..` pops; popping past the root
/// is a traversal attempt and is refused rather than clamped.
fn resolve_path(root: &Path, path: &str) -> Result<Target, Traversal> {
    if path.contains('\0') {
        return Err(Traversal);
    }
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(Traversal);
                }
            }
            part => stack.push(part),
        }
    }
    if stack.is_empty() {
        Ok(Target::Root)
    } else {
        let mut target = root.to_path_buf();
        for part in stack {
            target.push(part);
        }
        Ok(Target::Entry(target))
    }
}

/// Decode percent-escapes in `path`.
///
/// Invalid escapes are kept literally; `+` is left alone (it only means
/// space in form encoding, not in paths).
pub fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// List the document root's immediate entries, sorted by name.
///
/// This is the listing primitive behind the index page; the page itself is
/// rendered by `index_html`.
pub fn list_directory(root: &Path) -> io::Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();
    Ok(entries)
}

/// Render the index page: one link per entry plus the upload form.
fn index_html(entries: &[String]) -> String {
    let mut page = String::with_capacity(512);
    page.push_str(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of /</title></head>\n<body>\n<h1>Index of /</h1>\n<ul>\n",
    );
    for entry in entries {
        let name = html_escape(entry);
        let _ = writeln!(page, "<li><a href=\"/{name}\">{name}</a></li>");
    }
    page.push_str(
        "</ul>\n<form action=\"/\" method=\"post\" enctype=\"multipart/form-data\">\n\
         <input type=\"file\" name=\"file\">\n<input type=\"submit\" value=\"Upload\">\n</form>\n\
         </body>\n</html>\n",
    );
    page
}

fn html_escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// The `Content-Type` for a file, from its extension.
pub fn content_type(path: &Path) -> &'static str {
    let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
        return "application/octet-stream";
    };
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "txt" | "log" | "md" => "text/plain",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// The standard reason phrase for `status`.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        303 => "See Other",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
