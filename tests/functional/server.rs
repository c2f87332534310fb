//! End-to-end tests against a real server on an ephemeral port.

use std::fs;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use depot::config::Config;
use depot::server::{Server, ShutdownHandle};

use super::util::scratch_dir;

struct TestServer {
    address: SocketAddr,
    root: PathBuf,
    shutdown: ShutdownHandle,
    handle: thread::JoinHandle<()>,
}

impl TestServer {
    fn spawn<F>(name: &str, configure: F) -> TestServer
    where
        F: FnOnce(&mut Config),
    {
        let root = scratch_dir(name);
        let mut config = Config::default();
        config.port = 0;
        config.bind_address = IpAddr::from([127, 0, 0, 1]);
        config.thread_count = 2;
        config.max_connections = 64;
        config.document_root = root.clone();
        // Keep test teardown fast.
        config.shutdown_timeout = Duration::from_millis(200);
        configure(&mut config);

        let mut server = Server::new(config).unwrap();
        let address = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || {
            let _ = server.run();
        });
        TestServer {
            address,
            root,
            shutdown,
            handle,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.address).unwrap();
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.set_write_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn write_file(&self, name: &str, contents: &[u8]) {
        fs::write(self.root.join(name), contents).unwrap();
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn join(self) {
        self.shutdown.shutdown();
        self.handle.join().unwrap();
    }
}

/// Read one response: the head up to the empty line plus a body of exactly
/// `Content-Length` bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut bytes = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        match bytes.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => break pos + 4,
            None => {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0, "connection closed before response head");
                bytes.extend_from_slice(&buf[..n]);
            }
        }
    };
    let head = String::from_utf8(bytes[..head_end].to_vec()).unwrap();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("response without Content-Length")
        .parse::<usize>()
        .unwrap();
    let mut body = bytes[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&buf[..n]);
    }
    assert_eq!(body.len(), content_length, "read past the response body");
    (head, body)
}

fn read_until_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    bytes
}

#[test]
fn get_file_with_connection_close() {
    let server = TestServer::spawn("get-close", |_| {});
    server.write_file("hello.txt", b"hello\n");

    let mut stream = server.connect();
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    // The server closes the connection, so read to end-of-file.
    let response = read_until_eof(&mut stream);
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("\r\nContent-Length: 6\r\n"), "{response}");
    assert!(response.contains("\r\nContent-Type: text/plain\r\n"), "{response}");
    assert!(response.contains("\r\nConnection: close\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\nhello\n"), "{response}");

    server.join();
}

#[test]
fn index_page_lists_files_and_keeps_alive() {
    let server = TestServer::spawn("index", |_| {});
    server.write_file("a.txt", b"a");
    server.write_file("b.txt", b"b");

    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("\r\nContent-Type: text/html\r\n"), "{head}");
    assert!(head.contains("\r\nConnection: keep-alive\r\n"), "{head}");
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains(">a.txt</a>"), "{body}");
    assert!(body.contains(">b.txt</a>"), "{body}");
    assert!(body.contains("multipart/form-data"), "{body}");

    // The connection must still be usable for a second request.
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    server.join();
}

#[test]
fn upload_then_download_round_trips() {
    let server = TestServer::spawn("upload", |_| {});

    let body = "--X\r\nContent-Disposition: form-data; name=\"file\"; filename=\"u.txt\"\r\n\r\nabc\r\n--X--\r\n";
    let request = format!(
        "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );

    let mut stream = server.connect();
    stream.write_all(request.as_bytes()).unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 303 See Other\r\n"), "{response}");
    assert!(response.contains("\r\nLocation: /\r\n"), "{response}");

    let uploaded = fs::read(server.root().join("u.txt")).unwrap();
    assert_eq!(uploaded, b"abc");

    // Uploaded bytes must come back identical.
    let mut stream = server.connect();
    stream
        .write_all(b"GET /u.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("\r\nContent-Length: 3\r\n"), "{head}");
    assert_eq!(body, b"abc");

    server.join();
}

#[test]
fn path_traversal_is_refused() {
    let server = TestServer::spawn("traversal", |_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET /../etc/passwd HTTP/1.1\r\n\r\n")
        .unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");
    server.join();
}

#[test]
fn bad_request_line_gets_400_and_close() {
    let server = TestServer::spawn("bad-request", |_| {});
    let mut stream = server.connect();
    stream.write_all(b"NOTAMETHOD\r\n\r\n").unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("\r\nConnection: close\r\n"), "{response}");
    server.join();
}

#[test]
fn slow_loris_connections_are_reaped() {
    let server = TestServer::spawn("slow-loris", |config| {
        config.connection_timeout = Duration::from_secs(1);
    });
    server.write_file("a.txt", b"a");

    let mut slow = Vec::new();
    for _ in 0..20 {
        let mut stream = server.connect();
        stream.write_all(b"GET / HTT").unwrap();
        slow.push(stream);
    }

    // Past the idle timeout plus a sweep tick.
    thread::sleep(Duration::from_secs(3));

    for stream in &mut slow {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            // Reaped: end-of-file or a reset.
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("reaped connection produced {n} bytes"),
        }
    }

    // A fresh client is still served.
    let mut stream = server.connect();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(String::from_utf8(body).unwrap().contains(">a.txt</a>"));

    server.join();
}

#[test]
fn connections_over_the_limit_are_closed() {
    let server = TestServer::spawn("limit", |config| {
        config.max_connections = 2;
    });
    server.write_file("a.txt", b"a");

    // Occupy both slots with kept-alive connections.
    let mut first = server.connect();
    first.write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let _ = read_response(&mut first);
    let mut second = server.connect();
    second.write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let _ = read_response(&mut second);

    // The third connection is accepted and closed immediately.
    let mut third = server.connect();
    let mut buf = Vec::new();
    match third.read_to_end(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("rejected connection produced {n} bytes"),
        // A reset also counts as closed.
        Err(_) => {}
    }

    // Existing connections keep working.
    first.write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    drop(first);
    drop(second);
    server.join();
}

#[test]
fn pipelined_requests_are_served_in_order() {
    let server = TestServer::spawn("pipeline", |_| {});
    server.write_file("one.txt", b"1111");
    server.write_file("two.txt", b"22");

    let mut stream = server.connect();
    stream
        .write_all(
            b"GET /one.txt HTTP/1.1\r\nHost: x\r\n\r\nGET /two.txt HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"1111");
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"22");

    server.join();
}

#[test]
fn request_split_into_tiny_segments_still_parses() {
    let server = TestServer::spawn("tiny-segments", |_| {});
    server.write_file("hello.txt", b"hello\n");

    let mut stream = server.connect();
    let request = b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n";
    for chunk in request.chunks(3) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"hello\n");

    server.join();
}

#[test]
fn missing_file_is_404() {
    let server = TestServer::spawn("missing", |_| {});
    let mut stream = server.connect();
    stream
        .write_all(b"GET /no-such-file.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = String::from_utf8(read_until_eof(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    server.join();
}
