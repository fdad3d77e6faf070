//! Drives the proxy over real loopback TCP sockets: a fake publisher on one
//! side, a fake upstream RTMP server on the other, with the proxy under test
//! wired in between exactly as `main` would run it.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rtmp_redirect_proxy::config::RewriteConfig;
use rtmp_redirect_proxy::connection::handle_connection;
use rtmp_redirect_proxy::rtmp::amf0::{self, Amf0Encoder, Amf0Value};
use rtmp_redirect_proxy::rtmp::chunk::{self, ChunkHeader};

const HANDSHAKE_BYTES: usize = 1 + 1536 + 1536;
const DEFAULT_CHUNK_SIZE: u32 = 128;

fn test_cfg(upstream_addr: String) -> Arc<RewriteConfig> {
    Arc::new(RewriteConfig {
        upstream_addr,
        app_name: "live".to_string(),
        play_url: "rtmp://backend/live".to_string(),
        stream_name: "?token=abc".to_string(),
    })
}

fn connect_command(app: &str) -> Vec<u8> {
    let mut enc = Amf0Encoder::new();
    enc.write_string("connect");
    enc.write_number(1.0);
    enc.write_value(&Amf0Value::Object(vec![
        ("app".to_string(), Amf0Value::String(app.to_string())),
        ("type".to_string(), Amf0Value::String("nonprivate".to_string())),
    ]));
    enc.into_bytes()
}

fn release_stream_command(transid: f64, key: &str) -> Vec<u8> {
    let mut enc = Amf0Encoder::new();
    enc.write_string("releaseStream");
    enc.write_number(transid);
    enc.write_value(&Amf0Value::Null);
    enc.write_string(key);
    enc.into_bytes()
}

fn publish_command(key: &str) -> Vec<u8> {
    let mut enc = Amf0Encoder::new();
    enc.write_string("publish");
    enc.write_number(5.0);
    enc.write_value(&Amf0Value::Null);
    enc.write_string(key);
    enc.write_string("live");
    enc.into_bytes()
}

fn frame(csid: u32, typeid: u8, payload: &[u8]) -> Vec<u8> {
    let header = ChunkHeader {
        format: 0,
        csid,
        timestamp: 0,
        length: 0,
        typeid,
        streamid: 0,
    };
    chunk::frame_message(&header, payload, DEFAULT_CHUNK_SIZE)
}

/// Read one complete message off `r`, reassembling across continuation
/// chunks under the default 128-byte chunk size, mirroring what the proxy's
/// own session driver does on its read side.
async fn read_one_message<R: AsyncReadExt + Unpin>(r: &mut R) -> (ChunkHeader, Vec<u8>) {
    let mut last: Option<ChunkHeader> = None;
    let mut payload = Vec::new();
    loop {
        let raw = chunk::read_raw_header(r).await.unwrap();
        let header = chunk::reconstruct_header(&raw, last.as_ref());
        let remaining = header.length as usize - payload.len();
        let to_read = remaining.min(DEFAULT_CHUNK_SIZE as usize);
        let mut buf = vec![0u8; to_read];
        r.read_exact(&mut buf).await.unwrap();
        payload.extend_from_slice(&buf);
        last = Some(header);
        if payload.len() >= header.length as usize {
            return (header, payload);
        }
    }
}

#[tokio::test]
async fn rewrites_connect_release_stream_and_publish_then_copies_raw_bytes() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();

    let cfg = test_cfg(upstream_addr.to_string());

    let proxy_task = tokio::spawn(async move {
        let (stream, peer) = proxy_listener.accept().await.unwrap();
        handle_connection(stream, peer, cfg).await;
    });

    let upstream_task = tokio::spawn(async move {
        let (mut sock, _) = upstream_listener.accept().await.unwrap();

        let mut c0c1c2 = vec![0u8; HANDSHAKE_BYTES];
        sock.read_exact(&mut c0c1c2).await.unwrap();
        assert!(c0c1c2.iter().all(|&b| b == 0x11));
        sock.write_all(&vec![0x22u8; HANDSHAKE_BYTES]).await.unwrap();

        let (header, payload) = read_one_message(&mut sock).await;
        assert_eq!(header.typeid, 20);
        let connect = amf0::decode_command(&payload).unwrap();
        assert_eq!(connect.name, "connect");
        let Amf0Value::Object(pairs) = &connect.args[0] else {
            panic!("connect argument was not an Object");
        };
        let app = pairs.iter().find(|(k, _)| k == "app").unwrap().1.as_str();
        assert_eq!(app, Some("live"));

        let (_, payload) = read_one_message(&mut sock).await;
        let release = amf0::decode_command(&payload).unwrap();
        assert_eq!(release.name, "releaseStream");
        assert_eq!(release.args[1].as_str(), Some("?token=abc"));

        let (_, payload) = read_one_message(&mut sock).await;
        let publish = amf0::decode_command(&payload).unwrap();
        assert_eq!(publish.name, "publish");
        assert_eq!(publish.args[1].as_str(), Some("?token=abc"));

        let mut tail = vec![0u8; 4096];
        sock.read_exact(&mut tail).await.unwrap();
        assert!(tail.iter().all(|&b| b == 0x33));
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&vec![0x11u8; HANDSHAKE_BYTES]).await.unwrap();
    let mut s0s1s2 = vec![0u8; HANDSHAKE_BYTES];
    client.read_exact(&mut s0s1s2).await.unwrap();
    assert!(s0s1s2.iter().all(|&b| b == 0x22));

    client
        .write_all(&frame(3, 20, &connect_command("whatever")))
        .await
        .unwrap();
    client
        .write_all(&frame(3, 20, &release_stream_command(2.0, "clientkey")))
        .await
        .unwrap();
    client
        .write_all(&frame(3, 20, &publish_command("clientkey")))
        .await
        .unwrap();

    // Once `publish` has gone out the connection degrades to a blind copy:
    // raw bytes with no chunk framing at all must still arrive verbatim.
    client.write_all(&vec![0x33u8; 4096]).await.unwrap();

    drop(client);
    upstream_task.await.unwrap();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), proxy_task).await;
}

#[tokio::test]
async fn dial_failure_closes_client_without_panicking() {
    // Bind and immediately drop so the port is very likely refused; even if
    // not, handle_connection must not panic either way.
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let cfg = test_cfg(dead_addr.to_string());

    let proxy_task = tokio::spawn(async move {
        let (stream, peer) = proxy_listener.accept().await.unwrap();
        handle_connection(stream, peer, cfg).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let _ = client.write_all(&[0u8; 10]).await;
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), proxy_task).await;
}
