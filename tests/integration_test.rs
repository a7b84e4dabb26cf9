use presto::conn::RECV_BUF_SIZE;
use presto::server::Server;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

fn start_server() -> Server {
    let mut server = Server::bind("127.0.0.1:0").workers(2);
    server.start().expect("server failed to start");
    server
}

fn connect(server: &Server) -> TcpStream {
    let addr = server.local_addr().expect("server not running");
    let stream = TcpStream::connect(addr).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read one full HTTP response (head plus Content-Length body) off the
/// stream, leaving the connection usable for a follow-up request.
fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).expect("read failed");
        assert!(n > 0, "connection closed before a full response arrived");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .expect("response missing Content-Length")
        .trim()
        .parse()
        .expect("unparseable Content-Length");

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).expect("read failed");
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf[..head_end + content_length]).to_string()
}

/// True once the peer has closed: read returns EOF (or a reset).
fn assert_closed(stream: &mut TcpStream) {
    let mut chunk = [0u8; 64];
    match stream.read(&mut chunk) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, got {} more bytes", n),
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut =>
        {
            panic!("connection still open after read timeout")
        }
        Err(_) => {} // reset also counts as closed
    }
}

#[test]
fn get_root_is_served_and_connection_survives() {
    let mut server = start_server();
    let mut stream = connect(&server);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("<h1>"));
    assert!(response.contains("Connection: keep-alive\r\n"));
    assert!(response.contains("Keep-Alive: timeout=5, max=1000\r\n"));

    // the connection was reset and re-armed; a second request goes through
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("<h1>"));

    server.stop();
}

#[test]
fn missing_route_is_404_and_closes_on_request() {
    let mut server = start_server();
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("404 Not Found"));
    assert_closed(&mut stream);

    server.stop();
}

#[test]
fn post_is_rejected_with_400_and_closed() {
    let mut server = start_server();
    let mut stream = connect(&server);

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert_closed(&mut stream);

    server.stop();
}

#[test]
fn malformed_request_is_400_and_closed() {
    let mut server = start_server();
    let mut stream = connect(&server);

    stream.write_all(b"BROKEN REQUEST\r\n\r\n").unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_closed(&mut stream);

    server.stop();
}

#[test]
fn head_at_buffer_limit_is_served() {
    let mut server = start_server();
    let mut stream = connect(&server);

    let prefix = "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ";
    let suffix = "\r\n\r\n";
    let padding = RECV_BUF_SIZE - 1 - prefix.len() - suffix.len();
    let request = format!("{prefix}{}{suffix}", "a".repeat(padding));
    assert_eq!(request.len(), RECV_BUF_SIZE - 1);

    stream.write_all(request.as_bytes()).unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    server.stop();
}

#[test]
fn oversized_head_closes_without_response() {
    let mut server = start_server();
    let mut stream = connect(&server);

    let prefix = "GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ";
    let suffix = "\r\n\r\n";
    let padding = RECV_BUF_SIZE - prefix.len() - suffix.len();
    let request = format!("{prefix}{}{suffix}", "a".repeat(padding));
    assert_eq!(request.len(), RECV_BUF_SIZE);

    stream.write_all(request.as_bytes()).unwrap();
    assert_closed(&mut stream);

    server.stop();
}

#[test]
fn registry_drains_after_clients_disconnect() {
    let mut server = start_server();

    let mut streams = Vec::new();
    for _ in 0..8 {
        let mut stream = connect(&server);
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let response = read_response(&mut stream);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        streams.push(stream);
    }
    assert_eq!(server.connection_count(), 8);

    drop(streams);

    // the server notices each FIN and erases the records
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.connection_count() > 0 {
        assert!(
            Instant::now() < deadline,
            "registry still holds {} connections",
            server.connection_count()
        );
        thread::sleep(Duration::from_millis(20));
    }

    server.stop();
}

#[test]
fn stop_is_idempotent_and_runs_on_drop() {
    let mut server = start_server();
    let _stream = connect(&server);
    server.stop();
    server.stop();
    assert_eq!(server.connection_count(), 0);
    drop(server);

    // a second server stopped only by drop
    let server = start_server();
    drop(server);
}
