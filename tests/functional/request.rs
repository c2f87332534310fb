//! Request parser tests exercising whole request flows.

use std::fs;
use std::path::Path;

use depot::request::{Phase, Request};

use super::util::scratch_dir;

fn feed_all(request: &mut Request, input: &[u8], root: &Path) -> Phase {
    request.feed(input, root)
}

#[test]
fn zero_content_length_completes_without_body() {
    let root = scratch_dir("req-zero");
    let mut request = Request::new();
    let phase = feed_all(
        &mut request,
        b"POST /submit HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        &root,
    );
    assert_eq!(phase, Phase::Complete);
    assert!(request.body().is_empty());
}

#[test]
fn multipart_request_streams_to_disk() {
    let root = scratch_dir("req-multipart");
    let body = "--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"data.bin\"\r\n\r\npayload-bytes\r\n--B--\r\n";
    let head = format!(
        "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
        body.len(),
    );

    let mut request = Request::new();
    assert_eq!(request.feed(head.as_bytes(), &root), Phase::Body);

    // Deliver the body in slices that split the closing marker.
    let bytes = body.as_bytes();
    let cut = bytes.len() - 7;
    assert_eq!(request.feed(&bytes[..cut], &root), Phase::Body);
    assert_eq!(request.feed(&bytes[cut..], &root), Phase::Complete);

    assert_eq!(fs::read(root.join("data.bin")).unwrap(), b"payload-bytes");
    let upload = request.upload().expect("no upload state");
    assert_eq!(upload.filename(), Some("data.bin"));
    assert_eq!(upload.bytes_written(), 13);
    // The streamed body never lands in the in-memory body buffer.
    assert!(request.body().is_empty());
}

#[test]
fn upload_with_bad_filename_fails_the_request() {
    let root = scratch_dir("req-bad-upload");
    let body = "--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"../escape\"\r\n\r\nx\r\n--B--\r\n";
    let head = format!(
        "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n",
        body.len(),
    );
    let mut request = Request::new();
    request.feed(head.as_bytes(), &root);
    assert_eq!(request.feed(body.as_bytes(), &root), Phase::Failed);
    let err = request.error().expect("no error recorded");
    assert_eq!(err.status_code(), 400);
    assert!(!root.join("escape").exists());
}

#[test]
fn header_lookup_is_case_sensitive_on_wire_form() {
    let root = scratch_dir("req-case");
    let mut request = Request::new();
    request.feed(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &root);
    assert_eq!(request.header("Host"), Some("x"));
    assert_eq!(request.header("host"), None);
}
