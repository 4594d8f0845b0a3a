//! End-to-end tests driving the real connection handler over a loopback
//! socket with the sync `hkv-client`, rather than calling `dispatch_command`
//! directly.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tokio::net::TcpListener;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use hkv_client::{ClientConfig, ClientTtl, KVClient};
use hkv_engine::facade::{DataPaths, EngineConfig};
use hkv_engine::replication::PsyncRequest;
use hkv_engine::wal::FsyncPolicy;
use hkv_engine::{replication, Engine, EvictionPolicy};
use hkv_server::metrics::Metrics;
use hkv_server::server;

fn client_for(addr: std::net::SocketAddr) -> KVClient {
    let config = ClientConfig {
        addr: addr.to_string(),
        ..ClientConfig::default()
    };
    KVClient::with_config(config).expect("client")
}

async fn spawn_test_server() -> std::net::SocketAddr {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        shard_count: 4,
        max_memory_bytes: usize::MAX,
        eviction_policy: EvictionPolicy::Lru,
        fsync_policy: FsyncPolicy::Always,
        backlog_bytes: replication::DEFAULT_BACKLOG_BYTES,
        ttl_check_interval: Duration::from_millis(50),
        paths: DataPaths::new(dir.path()),
    };
    // Keep the temp dir alive for the lifetime of the process; each test
    // gets its own directory and the process exits at the end anyway.
    std::mem::forget(dir);

    let (engine, _report) = Engine::open(config).expect("open engine");
    let engine = Arc::new(engine);
    let metrics = Arc::new(Metrics::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let engine = Arc::clone(&engine);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                let _ = server::handle_connection(stream, engine, metrics).await;
            });
        }
    });

    addr
}

async fn spawn_test_server_with_replication() -> (std::net::SocketAddr, std::net::SocketAddr) {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        shard_count: 4,
        max_memory_bytes: usize::MAX,
        eviction_policy: EvictionPolicy::Lru,
        fsync_policy: FsyncPolicy::Always,
        backlog_bytes: replication::DEFAULT_BACKLOG_BYTES,
        ttl_check_interval: Duration::from_millis(50),
        paths: DataPaths::new(dir.path()),
    };
    std::mem::forget(dir);

    let (engine, _report) = Engine::open(config).expect("open engine");
    let engine = Arc::new(engine);
    let metrics = Arc::new(Metrics::new());

    let client_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let client_addr = client_listener.local_addr().expect("addr");
    let repl_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let repl_addr = repl_listener.local_addr().expect("addr");

    let client_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match client_listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let engine = Arc::clone(&client_engine);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                let _ = server::handle_connection(stream, engine, metrics).await;
            });
        }
    });

    tokio::spawn(async move {
        loop {
            let (stream, _) = match repl_listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let _ = server::handle_replication_connection(stream, engine).await;
            });
        }
    });

    (client_addr, repl_addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn set_get_delete_round_trip_over_the_wire() {
    let addr = spawn_test_server().await;

    thread::spawn(move || {
        let client = client_for(addr);
        client.set(b"greeting", b"hello").expect("set");
        let value = client.get(b"greeting").expect("get");
        assert_eq!(value, Some(b"hello".to_vec()));

        assert!(client.exists(b"greeting").expect("exists"));
        assert!(client.delete(b"greeting").expect("delete"));
        assert_eq!(client.get(b"greeting").expect("get after delete"), None);
    })
    .join()
    .expect("client thread panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_and_flushdb_behave_like_the_wire_protocol_expects() {
    let addr = spawn_test_server().await;

    thread::spawn(move || {
        let client = client_for(addr);
        client.set(b"k1", b"v1").expect("set k1");
        client
            .expire(b"k1", std::time::Duration::from_secs(60))
            .expect("expire");

        match client.ttl(b"k1").expect("ttl") {
            ClientTtl::ExpiresIn(remaining) => assert!(remaining.as_secs() <= 60),
            other => panic!("unexpected ttl state: {:?}", other),
        }

        assert_eq!(client.dbsize().expect("dbsize"), 1);
        client.flushdb().expect("flushdb");
        assert_eq!(client.dbsize().expect("dbsize after flush"), 0);
    })
    .join()
    .expect("client thread panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_and_echo_round_trip() {
    let addr = spawn_test_server().await;

    thread::spawn(move || {
        let client = client_for(addr);
        assert_eq!(client.ping(None).expect("ping"), b"PONG".to_vec());
        assert_eq!(client.echo(b"hi").expect("echo"), b"hi".to_vec());
    })
    .join()
    .expect("client thread panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_replica_psync_gets_a_fullsync_header() {
    let (client_addr, repl_addr) = spawn_test_server_with_replication().await;

    let write_result = thread::spawn(move || {
        let client = client_for(client_addr);
        client.set(b"a", b"1").expect("set a");
        client.set(b"b", b"2").expect("set b");
    })
    .join();
    write_result.expect("writer thread panicked");

    let mut stream = tokio::net::TcpStream::connect(repl_addr)
        .await
        .expect("connect to replication port");
    let request = PsyncRequest::fresh().encode();
    stream.write_all(request.as_bytes()).await.expect("write psync");

    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await.expect("read psync response");
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }

    let header = String::from_utf8_lossy(&response);
    assert!(header.starts_with("+FULLSYNC "), "unexpected header: {header}");
}
