// Integration tests for the harbor storage network
// These tests validate end-to-end store/get flows across real loopback nodes

use harbor::cryptography::{generate_encryption_key, hash_key};
use harbor::peer::{Peer, TcpPeer};
use harbor::server::{FileServer, ServerConfig, ServerError};
use harbor::transport::{OnPeer, TcpTransport, TransportConfig, INCOMING_MESSAGE, INCOMING_STREAM};
use harbor::{IV_SIZE, KEY_SIZE};

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

async fn make_server(
    tag: &str,
    key: [u8; KEY_SIZE],
    bootstrap: Vec<SocketAddr>,
) -> Arc<FileServer> {
    let mut config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    config.encrypt_key = key;
    config.storage_root =
        std::env::temp_dir().join(format!("harbor_test_{}_{}", tag, std::process::id()));
    config.bootstrap_nodes = bootstrap;

    let server = FileServer::new(config);
    tokio::spawn(server.clone().start());

    for _ in 0..100 {
        if server.addr().is_some() {
            return server;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server {} failed to start listening", tag);
}

async fn wait_for_peers(server: &FileServer, expected: usize) {
    for _ in 0..200 {
        if server.peer_count().await >= expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let have = server.peer_count().await;
    panic!("expected {} connected peers, have {}", expected, have);
}

async fn get_bytes(server: &FileServer, key: &str) -> Vec<u8> {
    let (size, mut file) = server.get(key).await.expect("get should succeed");
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .expect("reading the fetched file should succeed");
    assert_eq!(size, buf.len() as u64);
    buf
}

// ============================================================================
// Single-Node Flows
// ============================================================================

#[tokio::test]
async fn test_single_node_store_get() {
    let server = make_server("single", generate_encryption_key(), Vec::new()).await;

    server
        .store("foo.txt", &mut b"hello".as_slice())
        .await
        .expect("store should succeed");

    assert_eq!(get_bytes(&server, "foo.txt").await, b"hello");

    server.stop();
    let _ = server.storage().clear().await;
}

#[tokio::test]
async fn test_get_unknown_key_fails() {
    let server = make_server("unknown", generate_encryption_key(), Vec::new()).await;

    let result = server.get("never-stored.bin").await;
    assert!(matches!(result, Err(ServerError::Unavailable(_))));

    server.stop();
    let _ = server.storage().clear().await;
}

// ============================================================================
// Two-Node Replication
// ============================================================================

#[tokio::test]
async fn test_fetch_from_peer_after_local_delete() {
    let key = generate_encryption_key();
    let server_a = make_server("pair_a", key, Vec::new()).await;
    let addr_a = server_a.addr().expect("server a should be listening");

    let server_b = make_server("pair_b", key, vec![addr_a]).await;
    wait_for_peers(&server_b, 1).await;
    wait_for_peers(&server_a, 1).await;

    let payload = b"my big data file here!";
    server_b
        .store("p.png", &mut payload.as_slice())
        .await
        .expect("store should succeed");

    server_b
        .storage()
        .delete(server_b.id(), "p.png")
        .await
        .expect("local delete should succeed");

    assert_eq!(get_bytes(&server_b, "p.png").await, payload);

    server_a.stop();
    server_b.stop();
    let _ = server_a.storage().clear().await;
    let _ = server_b.storage().clear().await;
}

#[tokio::test]
async fn test_replica_persists_ciphertext() {
    let key = generate_encryption_key();
    let server_a = make_server("cipher_a", key, Vec::new()).await;
    let addr_a = server_a.addr().expect("server a should be listening");

    let server_b = make_server("cipher_b", key, vec![addr_a]).await;
    wait_for_peers(&server_b, 1).await;
    wait_for_peers(&server_a, 1).await;

    let payload = b"plaintext at the owner, ciphertext at the replica";
    server_b
        .store("secret.txt", &mut payload.as_slice())
        .await
        .expect("store should succeed");

    // the replica keys the copy by the owner id and the wire digest
    let wire_key = hash_key("secret.txt");
    for _ in 0..200 {
        if server_a.storage().has(server_b.id(), &wire_key).await {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let (size, mut file) = server_a
        .storage()
        .read(server_b.id(), &wire_key)
        .await
        .expect("replica should hold the file");
    assert_eq!(size, (payload.len() + IV_SIZE) as u64);

    let mut replicated = Vec::new();
    file.read_to_end(&mut replicated)
        .await
        .expect("reading the replica copy should succeed");
    assert_ne!(&replicated[IV_SIZE..], payload.as_slice());

    server_a.stop();
    server_b.stop();
    let _ = server_a.storage().clear().await;
    let _ = server_b.storage().clear().await;
}

// ============================================================================
// Three-Node Replication
// ============================================================================

#[tokio::test]
async fn test_three_nodes_twenty_rounds() {
    let key = generate_encryption_key();
    let server_a = make_server("trio_a", key, Vec::new()).await;
    let server_b = make_server("trio_b", key, Vec::new()).await;
    let addr_a = server_a.addr().expect("server a should be listening");
    let addr_b = server_b.addr().expect("server b should be listening");

    let server_c = make_server("trio_c", key, vec![addr_a, addr_b]).await;
    wait_for_peers(&server_c, 2).await;
    wait_for_peers(&server_a, 1).await;
    wait_for_peers(&server_b, 1).await;

    for i in 0..20 {
        let file_key = format!("picture_{}.png", i);
        let payload = format!("my big data file here! round {}", i);

        server_c
            .store(&file_key, &mut payload.as_bytes())
            .await
            .expect("store should succeed");

        server_c
            .storage()
            .delete(server_c.id(), &file_key)
            .await
            .expect("local delete should succeed");

        assert_eq!(get_bytes(&server_c, &file_key).await, payload.as_bytes());
    }

    server_a.stop();
    server_b.stop();
    server_c.stop();
    let _ = server_a.storage().clear().await;
    let _ = server_b.storage().clear().await;
    let _ = server_c.storage().clear().await;
}

// ============================================================================
// Transport Framing
// ============================================================================

fn control_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test]
async fn test_control_stream_control_ordering() {
    // control, stream(8 bytes), control: the two control frames arrive in
    // order and exactly the stream bytes are consumed between them
    let captured: Arc<Mutex<Option<TcpPeer>>> = Arc::new(Mutex::new(None));
    let on_peer: OnPeer = {
        let captured = captured.clone();
        Arc::new(move |peer: TcpPeer| {
            let captured = captured.clone();
            Box::pin(async move {
                captured.lock().unwrap().replace(peer);
                Ok(())
            }) as Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>
        })
    };

    let mut transport = TcpTransport::new(TransportConfig {
        on_peer: Some(on_peer),
        ..TransportConfig::default()
    });
    transport
        .listen_and_accept()
        .await
        .expect("listen should succeed");
    let addr = transport.addr().expect("bound address should be known");
    let mut rx = transport.consume().expect("first consume should succeed");

    let mut client = TcpStream::connect(addr)
        .await
        .expect("connect should succeed");
    client
        .write_all(&control_frame(b"first"))
        .await
        .expect("write should succeed");
    client
        .write_all(&[INCOMING_STREAM])
        .await
        .expect("write should succeed");
    client
        .write_all(b"12345678")
        .await
        .expect("write should succeed");
    client
        .write_all(&control_frame(b"second"))
        .await
        .expect("write should succeed");
    client.flush().await.expect("flush should succeed");

    let rpc = rx.recv().await.expect("first control frame should arrive");
    assert_eq!(rpc.payload, b"first");
    assert!(!rpc.stream);

    let peer = loop {
        if let Some(peer) = captured.lock().unwrap().clone() {
            break peer;
        }
        sleep(Duration::from_millis(5)).await;
    };

    peer.wait_stream().await;
    let mut reader = peer.stream_reader().await;
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .await
        .expect("stream bytes should be readable");
    assert_eq!(&buf, b"12345678");
    drop(reader);
    peer.close_stream();

    let rpc = rx.recv().await.expect("second control frame should arrive");
    assert_eq!(rpc.payload, b"second");
}

#[tokio::test]
async fn test_close_stops_accepting_and_drains() {
    let mut transport = TcpTransport::new(TransportConfig::default());
    transport
        .listen_and_accept()
        .await
        .expect("listen should succeed");
    let addr = transport.addr().expect("bound address should be known");
    let mut rx = transport.consume().expect("first consume should succeed");

    let mut client = TcpStream::connect(addr)
        .await
        .expect("connect should succeed");
    client
        .write_all(&control_frame(b"before close"))
        .await
        .expect("write should succeed");

    let rpc = rx.recv().await.expect("frame should arrive before close");
    assert_eq!(rpc.payload, b"before close");

    drop(client);
    transport.close();
    sleep(Duration::from_millis(50)).await;

    let refused = TcpStream::connect(addr).await;
    assert!(refused.is_err(), "no further accepts after close");

    drop(transport);
    assert!(rx.recv().await.is_none(), "channel closes once drained");
}
