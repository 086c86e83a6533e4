//! End-to-end wire tests: a real server task, raw TCP clients, byte-level
//! assertions on both protocols.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kestrel::config::Config;
use kestrel::dispatch::Service;
use kestrel::server;

fn start_server(port: u16, memcache_port: u16, requirepass: Option<&str>) -> Arc<Service> {
    let config = Config {
        port,
        memcache_port,
        requirepass: requirepass.map(|s| s.to_string()),
        ..Config::default()
    };
    let service = Service::new(config);
    let server_service = service.clone();
    tokio::spawn(async move {
        let _ = server::run_server(server_service).await;
    });
    service
}

async fn connect(port: u16) -> TcpStream {
    for _ in 0..50 {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => return stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("server did not come up on port {port}");
}

/// Sends raw bytes and reads until the reply ends with `until`.
async fn roundtrip(stream: &mut TcpStream, send: &[u8], until: &[u8]) -> String {
    stream.write_all(send).await.unwrap();
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("reply timed out")
            .unwrap();
        assert!(read > 0, "connection closed while waiting for reply");
        collected.extend_from_slice(&chunk[..read]);
        if collected.ends_with(until) {
            return String::from_utf8(collected).unwrap();
        }
    }
}

#[tokio::test]
async fn resp_ping_set_get() {
    start_server(16801, 0, None);
    let mut stream = connect(16801).await;

    assert_eq!(roundtrip(&mut stream, b"PING\r\n", b"\r\n").await, "+PONG\r\n");
    assert_eq!(
        roundtrip(
            &mut stream,
            b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
            b"\r\n"
        )
        .await,
        "+OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"bar\r\n").await,
        "$3\r\nbar\r\n"
    );
}

#[tokio::test]
async fn resp_multi_exec_over_the_wire() {
    start_server(16802, 0, None);
    let mut stream = connect(16802).await;

    assert_eq!(roundtrip(&mut stream, b"MULTI\r\n", b"\r\n").await, "+OK\r\n");
    assert_eq!(
        roundtrip(&mut stream, b"SET a 1\r\n", b"\r\n").await,
        "+QUEUED\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"INCR a\r\n", b"\r\n").await,
        "+QUEUED\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"EXEC\r\n", b":2\r\n").await,
        "*2\r\n+OK\r\n:2\r\n"
    );
}

#[tokio::test]
async fn resp_auth_gate() {
    start_server(16803, 0, Some("secret"));
    let mut stream = connect(16803).await;

    assert_eq!(
        roundtrip(&mut stream, b"PING\r\n", b"\r\n").await,
        "-NOAUTH Authentication required.\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"AUTH secret\r\n", b"\r\n").await,
        "+OK\r\n"
    );
    assert_eq!(roundtrip(&mut stream, b"PING\r\n", b"\r\n").await, "+PONG\r\n");
}

#[tokio::test]
async fn resp_eval_over_the_wire() {
    start_server(16804, 0, None);
    let mut stream = connect(16804).await;

    assert_eq!(
        roundtrip(&mut stream, b"EVAL \"return 1\" 0\r\n", b"\r\n").await,
        ":1\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"EVAL \"return KEYS[1]\" 1 x\r\n", b"x\r\n").await,
        "$1\r\nx\r\n"
    );
}

#[tokio::test]
async fn memcached_store_and_retrieve() {
    start_server(16805, 16806, None);
    let mut stream = connect(16806).await;

    assert_eq!(
        roundtrip(&mut stream, b"set foo 0 0 3\r\nbar\r\n", b"\r\n").await,
        "STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"get foo\r\n", b"END\r\n").await,
        "VALUE foo 0 3\r\nbar\r\nEND\r\n"
    );
    assert_eq!(
        roundtrip(&mut stream, b"get missing\r\n", b"END\r\n").await,
        "END\r\n"
    );
}

#[tokio::test]
async fn memcached_incr_and_version() {
    start_server(16807, 16808, None);
    let mut stream = connect(16808).await;

    assert_eq!(
        roundtrip(&mut stream, b"set n 0 0 2\r\n10\r\n", b"\r\n").await,
        "STORED\r\n"
    );
    assert_eq!(roundtrip(&mut stream, b"incr n 5\r\n", b"\r\n").await, "15\r\n");

    let version = roundtrip(&mut stream, b"version\r\n", b"\r\n").await;
    assert!(version.starts_with("VERSION "));
}

#[tokio::test]
async fn memcached_noreply_suppresses_the_response() {
    start_server(16809, 16810, None);
    let mut stream = connect(16810).await;

    stream
        .write_all(b"set quiet 0 0 2 noreply\r\nhi\r\n")
        .await
        .unwrap();
    // The next reply on the connection belongs to the get, not the set.
    assert_eq!(
        roundtrip(&mut stream, b"get quiet\r\n", b"END\r\n").await,
        "VALUE quiet 0 2\r\nhi\r\nEND\r\n"
    );
}

#[tokio::test]
async fn both_listeners_share_one_store() {
    let service = start_server(16811, 16812, None);
    let mut resp = connect(16811).await;
    let mut mc = connect(16812).await;

    assert_eq!(
        roundtrip(&mut mc, b"set shared 0 0 5\r\nhello\r\n", b"\r\n").await,
        "STORED\r\n"
    );
    assert_eq!(
        roundtrip(&mut resp, b"GET shared\r\n", b"hello\r\n").await,
        "$5\r\nhello\r\n"
    );
    assert_eq!(service.store.get(0, b"shared").unwrap().value, b"hello");
}
