//! Incremental HTTP request parser.
//!
//! [`Request`] is a per-connection state machine driven by appending bytes
//! to its receive buffer and advancing as far as the buffered input allows.
//! A read task feeds it whatever the socket had; the parser suspends
//! mid-phase when the buffer runs dry and resumes on the next read, so a
//! request arriving one byte at a time parses the same as one arriving in a
//! single segment.
//!
//! Phases: request line ([`Phase::Init`]), header block
//! ([`Phase::Headers`]), body ([`Phase::Body`], either a fixed
//! `Content-Length` region or a `multipart/form-data` upload streamed by
//! [`Upload`]), then [`Phase::Complete`] or [`Phase::Failed`].
//!
//! Bytes consumed by one phase are drained from the buffer; leftover bytes
//! (a pipelined next request) stay buffered for the next cycle.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::path::Path;

use crate::upload::{Upload, UploadError, UploadPhase};

/// Maximum size of the request line plus headers.
///
/// RFC 7230 section 3.1.1 recommends supporting at least 8000 octets; twice
/// that is plenty for a file server.
pub const MAX_HEAD_SIZE: usize = 16384;

/// Parse phase of a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Waiting for the request line.
    Init,
    /// Request line parsed, reading header lines.
    Headers,
    /// Header block done, reading the message body.
    Body,
    /// The request is ready for response handling.
    Complete,
    /// Terminal parse failure, the connection gets an error response and is
    /// closed.
    Failed,
}

/// An incrementally parsed HTTP request.
#[derive(Debug)]
pub struct Request {
    phase: Phase,
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Headers in received wire casing; duplicates overwrite.
    headers: HashMap<String, String>,
    content_length: usize,
    body: Vec<u8>,
    upload: Option<Upload>,
    recv_buf: Vec<u8>,
    error: Option<RequestError>,
}

impl Request {
    pub fn new() -> Request {
        Request {
            phase: Phase::Init,
            method: String::new(),
            uri: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            content_length: 0,
            body: Vec::new(),
            upload: None,
            recv_buf: Vec::new(),
            error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The value of header `name`, matched on its wire form.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// The fixed-length body. Empty for multipart requests, whose content
    /// went to disk instead.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The completed upload, if this was a multipart request.
    pub fn upload(&self) -> Option<&Upload> {
        self.upload.as_ref()
    }

    /// The error that moved the request to [`Phase::Failed`].
    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    /// Append `bytes` to the receive buffer and advance as far as possible.
    pub fn feed(&mut self, bytes: &[u8], document_root: &Path) -> Phase {
        self.recv_buf.extend_from_slice(bytes);
        self.advance(document_root)
    }

    /// Advance the state machine on already-buffered input.
    pub fn advance(&mut self, document_root: &Path) -> Phase {
        loop {
            match self.phase {
                Phase::Init => match take_line(&mut self.recv_buf) {
                    // RFC 7230 section 3.5: ignore empty lines received
                    // before the request line.
                    Some(line) if line.is_empty() => {}
                    Some(line) => {
                        if let Err(err) = self.parse_request_line(&line) {
                            return self.fail(err);
                        }
                        self.phase = Phase::Headers;
                    }
                    None => return self.suspend_head(),
                },
                Phase::Headers => match take_line(&mut self.recv_buf) {
                    Some(line) if line.is_empty() => self.phase = self.body_phase(document_root),
                    Some(line) => {
                        if let Err(err) = self.parse_header_line(&line) {
                            return self.fail(err);
                        }
                    }
                    None => return self.suspend_head(),
                },
                Phase::Body => {
                    if let Some(upload) = self.upload.as_mut() {
                        match upload.feed(&mut self.recv_buf) {
                            Ok(UploadPhase::Complete) => self.phase = Phase::Complete,
                            Ok(_) => return self.phase,
                            Err(err) => return self.fail(RequestError::Upload(err)),
                        }
                    } else {
                        let wanted = self.content_length - self.body.len();
                        let take = wanted.min(self.recv_buf.len());
                        self.body.extend_from_slice(&self.recv_buf[..take]);
                        self.recv_buf.drain(..take);
                        if self.body.len() < self.content_length {
                            return self.phase;
                        }
                        self.phase = Phase::Complete;
                    }
                }
                Phase::Complete | Phase::Failed => return self.phase,
            }
        }
    }

    /// Reset for the next request on a kept-alive connection.
    ///
    /// Already-received unparsed bytes are carried over so a pipelined
    /// request is picked up by the next [`advance`] call.
    ///
    /// [`advance`]: Request::advance
    pub fn reset(&mut self) {
        let recv_buf = mem::take(&mut self.recv_buf);
        *self = Request::new();
        self.recv_buf = recv_buf;
    }

    /// Whether the connection should be kept open after responding.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// only keeps the connection with an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.header("Connection");
        if self.version == "HTTP/1.0" {
            matches!(connection, Some(value) if value.eq_ignore_ascii_case("keep-alive"))
        } else {
            !matches!(connection, Some(value) if value.eq_ignore_ascii_case("close"))
        }
    }

    /// Serialize the parsed request head back to wire form.
    ///
    /// Headers are written in sorted order; a split `Content-Type` gets its
    /// `boundary` parameter re-attached.
    pub fn to_canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");

        let mut names: Vec<&String> = self.headers.keys().filter(|name| *name != "boundary").collect();
        names.sort();
        for name in names {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(self.headers[name].as_bytes());
            if name == "Content-Type" {
                if let Some(boundary) = self.header("boundary") {
                    out.extend_from_slice(b"; boundary=");
                    out.extend_from_slice(boundary.as_bytes());
                }
            }
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), RequestError> {
        let mut tokens = line.split_ascii_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (tokens.next(), tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(RequestError::BadRequestLine);
        };
        if !version.starts_with("HTTP/") {
            return Err(RequestError::BadRequestLine);
        }
        self.method = method.to_owned();
        self.uri = uri.to_owned();
        self.version = version.to_owned();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<(), RequestError> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(RequestError::BadHeader);
        };
        let name = name.trim_end();
        let value = value.trim();

        match name {
            "Content-Length" => {
                self.content_length = value.parse().map_err(|_| RequestError::BadHeader)?;
                self.headers.insert(name.to_owned(), value.to_owned());
            }
            "Content-Type" => match value.split_once(';') {
                Some((mime, params)) => {
                    self.headers.insert(name.to_owned(), mime.trim_end().to_owned());
                    for param in params.split(';') {
                        if let Some(boundary) = param.trim().strip_prefix("boundary=") {
                            // Stored without the `--` prefix used on the wire.
                            self.headers.insert("boundary".to_owned(), boundary.trim().to_owned());
                        }
                    }
                }
                None => {
                    self.headers.insert(name.to_owned(), value.to_owned());
                }
            },
            _ => {
                self.headers.insert(name.to_owned(), value.to_owned());
            }
        }
        Ok(())
    }

    /// Decide the phase following the header block.
    fn body_phase(&mut self, document_root: &Path) -> Phase {
        let multipart = self.header("Content-Type") == Some("multipart/form-data");
        if multipart {
            if let Some(boundary) = self.header("boundary").map(str::to_owned) {
                self.upload = Some(Upload::new(&boundary, document_root));
                return Phase::Body;
            }
        }
        if self.content_length == 0 {
            Phase::Complete
        } else {
            Phase::Body
        }
    }

    /// Out of buffered input mid-head; stay in the current phase unless the
    /// head outgrew the limit.
    fn suspend_head(&mut self) -> Phase {
        if self.recv_buf.len() > MAX_HEAD_SIZE {
            return self.fail(RequestError::HeadTooLarge);
        }
        self.phase
    }

    fn fail(&mut self, err: RequestError) -> Phase {
        self.phase = Phase::Failed;
        self.error = Some(err);
        Phase::Failed
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}

/// Take the next CRLF-terminated line off the front of `buf`.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.windows(2).position(|window| window == b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.drain(..pos + 2);
    Some(line)
}

/// Error parsing an HTTP request.
#[derive(Debug)]
pub enum RequestError {
    /// The request line is not three tokens with an `HTTP/` version.
    BadRequestLine,
    /// A header line has no colon or an unparsable `Content-Length`.
    BadHeader,
    /// The request line and headers exceed [`MAX_HEAD_SIZE`].
    HeadTooLarge,
    /// The multipart body could not be streamed to disk.
    Upload(UploadError),
}

impl RequestError {
    /// The status code of the error response this failure warrants.
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::BadRequestLine | RequestError::BadHeader | RequestError::HeadTooLarge => 400,
            RequestError::Upload(err) => err.status_code(),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::BadRequestLine => f.write_str("invalid request line"),
            RequestError::BadHeader => f.write_str("invalid header line"),
            RequestError::HeadTooLarge => f.write_str("request head too large"),
            RequestError::Upload(err) => write!(f, "upload failed: {err}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Upload(err) => Some(err),
            _ => None,
        }
    }
}
