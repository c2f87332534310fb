//! Streaming `multipart/form-data` handler.
//!
//! [`Upload`] consumes body bytes out of the connection's receive buffer
//! and writes file content straight to disk; the body is never held in
//! memory as a whole. The part delimiter can arrive split across reads, so
//! while streaming content the last `boundary length + 4` bytes are kept
//! unwritten until following input either confirms the `\r\n--boundary`
//! marker or rules it out.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// Phase of the upload state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UploadPhase {
    /// Discarding the preamble up to the first `--boundary` line.
    SeekBoundary,
    /// Reading a part's header lines up to the empty line.
    PartHeaders,
    /// Streaming part content to the target file.
    Content,
    /// Marker seen; deciding between the next part and the closing
    /// delimiter.
    Finalize,
    /// The closing delimiter was consumed.
    Complete,
}

/// Streaming writer for one multipart request body.
#[derive(Debug)]
pub struct Upload {
    phase: UploadPhase,
    /// `--boundary`, the form used at the start of a part line.
    delimiter: Vec<u8>,
    /// `\r\n--boundary`, the form terminating part content.
    marker: Vec<u8>,
    root: PathBuf,
    file: Option<File>,
    filename: Option<String>,
    /// Name of the last file fully written.
    completed_filename: Option<String>,
    bytes_written: u64,
}

impl Upload {
    /// Create a handler for a body delimited by `boundary` (the bare token
    /// from the `Content-Type` header), writing files under `root`.
    pub fn new(boundary: &str, root: &Path) -> Upload {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        let mut marker = Vec::with_capacity(boundary.len() + 4);
        marker.extend_from_slice(b"\r\n");
        marker.extend_from_slice(&delimiter);
        Upload {
            phase: UploadPhase::SeekBoundary,
            delimiter,
            marker,
            root: root.to_path_buf(),
            file: None,
            filename: None,
            completed_filename: None,
            bytes_written: 0,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    /// Name of the last fully written file.
    pub fn filename(&self) -> Option<&str> {
        self.completed_filename.as_deref()
    }

    /// Total content bytes written to disk.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Consume as much of `buf` as possible, advancing the machine.
    ///
    /// Returns the phase reached; anything other than
    /// [`UploadPhase::Complete`] means more input is needed.
    pub fn feed(&mut self, buf: &mut Vec<u8>) -> Result<UploadPhase, UploadError> {
        loop {
            match self.phase {
                UploadPhase::SeekBoundary => {
                    // The first delimiter line: `--boundary\r\n`.
                    let mut needle = self.delimiter.clone();
                    needle.extend_from_slice(b"\r\n");
                    match find(buf, &needle) {
                        Some(pos) => {
                            buf.drain(..pos + needle.len());
                            self.phase = UploadPhase::PartHeaders;
                        }
                        None => {
                            // Drop everything that can't be a prefix of the
                            // delimiter line.
                            if buf.len() >= needle.len() {
                                buf.drain(..buf.len() - (needle.len() - 1));
                            }
                            return Ok(self.phase);
                        }
                    }
                }
                UploadPhase::PartHeaders => match take_line(buf) {
                    Some(line) if line.is_empty() => self.open_target()?,
                    Some(line) => self.parse_part_header(&line)?,
                    None => return Ok(self.phase),
                },
                UploadPhase::Content => {
                    match find(buf, &self.marker) {
                        Some(pos) => {
                            self.write(&buf[..pos])?;
                            buf.drain(..pos + self.marker.len());
                            self.close_target();
                            self.phase = UploadPhase::Finalize;
                        }
                        None => {
                            // Keep a marker-sized tail: it may be the start
                            // of a delimiter finished by the next read.
                            let keep = self.marker.len();
                            if buf.len() > keep {
                                let flush = buf.len() - keep;
                                self.write(&buf[..flush])?;
                                buf.drain(..flush);
                            }
                            return Ok(self.phase);
                        }
                    }
                }
                UploadPhase::Finalize => {
                    if buf.len() < 2 {
                        return Ok(self.phase);
                    }
                    if buf.starts_with(b"--") {
                        // Closing delimiter, optionally CRLF-terminated.
                        buf.drain(..2);
                        if buf.starts_with(b"\r\n") {
                            buf.drain(..2);
                        }
                        self.phase = UploadPhase::Complete;
                        debug!(
                            file = self.completed_filename.as_deref().unwrap_or(""),
                            bytes = self.bytes_written;
                            "upload complete"
                        );
                    } else if buf.starts_with(b"\r\n") {
                        buf.drain(..2);
                        self.phase = UploadPhase::PartHeaders;
                    } else {
                        return Err(UploadError::Malformed);
                    }
                }
                UploadPhase::Complete => return Ok(self.phase),
            }
        }
    }

    fn parse_part_header(&mut self, line: &str) -> Result<(), UploadError> {
        if !line.get(..20).is_some_and(|p| p.eq_ignore_ascii_case("content-disposition:")) {
            return Ok(());
        }
        let Some(start) = line.find("filename=\"") else {
            return Ok(());
        };
        let rest = &line[start + "filename=\"".len()..];
        let Some(end) = rest.find('"') else {
            return Err(UploadError::BadFilename);
        };
        let filename = &rest[..end];
        if filename.is_empty() {
            return Err(UploadError::MissingFilename);
        }
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            warn!(filename = filename; "rejecting upload filename");
            return Err(UploadError::BadFilename);
        }
        self.filename = Some(filename.to_owned());
        Ok(())
    }

    /// Create or truncate the target file at the end of the part headers.
    fn open_target(&mut self) -> Result<(), UploadError> {
        let Some(filename) = self.filename.take() else {
            return Err(UploadError::MissingFilename);
        };
        let path = self.root.join(&filename);
        let file = File::create(&path).map_err(UploadError::Io)?;
        debug!(path:% = path.display(); "receiving upload");
        self.file = Some(file);
        self.completed_filename = Some(filename);
        self.phase = UploadPhase::Content;
        Ok(())
    }

    fn close_target(&mut self) {
        // Dropping flushes; content was written unbuffered.
        self.file = None;
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), UploadError> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(bytes).map_err(UploadError::Io)?;
                self.bytes_written += bytes.len() as u64;
                Ok(())
            }
            None => Err(UploadError::Malformed),
        }
    }
}

/// Find the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Take the next CRLF-terminated line off the front of `buf`.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = find(buf, b"\r\n")?;
    let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.drain(..pos + 2);
    Some(line)
}

/// Error streaming a multipart body.
#[derive(Debug)]
pub enum UploadError {
    /// The part headers carry no `filename`.
    MissingFilename,
    /// The filename contains a path separator or `..`.
    BadFilename,
    /// The body does not follow the multipart framing.
    Malformed,
    /// Writing the target file failed.
    Io(io::Error),
}

impl UploadError {
    /// The status code of the error response this failure warrants.
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::MissingFilename | UploadError::BadFilename | UploadError::Malformed => 400,
            UploadError::Io(_) => 500,
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::MissingFilename => f.write_str("upload part has no filename"),
            UploadError::BadFilename => f.write_str("upload filename is not allowed"),
            UploadError::Malformed => f.write_str("malformed multipart body"),
            UploadError::Io(err) => write!(f, "can't write upload: {err}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Io(err) => Some(err),
            _ => None,
        }
    }
}
