//! End-to-end scenarios driven over real loopback sockets: the proxy
//! listens on `127.0.0.1:0`, a fake origin is a second loopback listener,
//! and a plain `std::net::TcpStream` plays the client. No mocked transport.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rproxy::cache::Cache;
use rproxy::dispatcher::Dispatcher;
use rproxy::worker::{serve_connection, Dialer, TcpDialer};

async fn spawn_origin(response: Vec<u8>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(&response).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    addr
}

struct LoopbackDialer {
    addr: std::net::SocketAddr,
}

#[async_trait::async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, _hostname: &str, _port: u16) -> std::io::Result<tokio::net::TcpStream> {
        tokio::net::TcpStream::connect(self.addr).await
    }
}

/// Spins up a proxy listener backed by `dispatcher`, returning its address
/// and its shared cache so the test can assert on cache state.
async fn spawn_proxy(dispatcher: Arc<Dispatcher>) -> (std::net::SocketAddr, Arc<Cache>) {
    let cache = dispatcher.cache();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut worker_id = 1u32;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let id = worker_id;
            worker_id = worker_id.wrapping_add(1);
            tokio::spawn(serve_connection(
                stream,
                id,
                dispatcher.cache(),
                dispatcher.dialer(),
            ));
        }
    });
    (addr, cache)
}

fn blocking_get(addr: std::net::SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = StdTcpStream::connect(addr).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

#[tokio::test]
async fn scenario_cold_miss_then_warm_hit() {
    let body = "a".repeat(50);
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let origin_addr = spawn_origin(response.clone().into_bytes()).await;
    let dialer: Arc<dyn Dialer> = Arc::new(LoopbackDialer { addr: origin_addr });
    let dispatcher = Arc::new(Dispatcher::with_dialer(dialer));
    let (proxy_addr, cache) = spawn_proxy(dispatcher).await;

    let request = "GET http://example.com/a HTTP/1.0\r\nHost: example.com\r\n\r\n".to_string();
    let first = {
        let request = request.clone();
        tokio::task::spawn_blocking(move || blocking_get(proxy_addr, &request))
            .await
            .unwrap()
    };
    assert_eq!(first, response.as_bytes());
    assert_eq!(cache.used_bytes(), response.len());

    let second = tokio::task::spawn_blocking(move || blocking_get(proxy_addr, &request))
        .await
        .unwrap();
    assert_eq!(second, response.as_bytes());
    // Still one resident entry, promoted, not duplicated by the hit path.
    assert_eq!(cache.used_bytes(), response.len());
}

#[tokio::test]
async fn scenario_too_large_response_is_not_cached() {
    let chunk_a = vec![b'x'; 102_400];
    let chunk_b = vec![b'y'; 97_600];
    let mut body = chunk_a;
    body.extend_from_slice(&chunk_b);
    let mut response =
        format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    response.extend_from_slice(&body);

    let origin_addr = spawn_origin(response.clone()).await;
    let dialer: Arc<dyn Dialer> = Arc::new(LoopbackDialer { addr: origin_addr });
    let dispatcher = Arc::new(Dispatcher::with_dialer(dialer));
    let (proxy_addr, cache) = spawn_proxy(dispatcher).await;

    let request = "GET http://x/big HTTP/1.0\r\nHost: x\r\n\r\n".to_string();
    let received = tokio::task::spawn_blocking(move || blocking_get(proxy_addr, &request))
        .await
        .unwrap();
    assert_eq!(received, response);
    assert_eq!(cache.used_bytes(), 0);
}

#[tokio::test]
async fn scenario_non_get_is_rejected_without_touching_origin() {
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer);
    let dispatcher = Arc::new(Dispatcher::with_dialer(dialer));
    let (proxy_addr, _cache) = spawn_proxy(dispatcher).await;

    let request = "POST /x HTTP/1.0\r\n\r\n".to_string();
    let received = tokio::task::spawn_blocking(move || blocking_get(proxy_addr, &request))
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.0 501 Not Implemented"));
}

#[tokio::test]
async fn scenario_eviction_keeps_bounded_lru_tail() {
    // Eleven 100_000-byte entries, distinct URIs, exceed MAX_CACHE_SIZE
    // (1_049_000): the first inserted is evicted once the eleventh lands.
    let cache = Cache::new();
    for i in 0..11 {
        let content: std::sync::Arc<[u8]> =
            std::sync::Arc::from(vec![b'z'; 100_000].into_boxed_slice());
        cache.add(format!("h{i}:80/"), content);
    }
    assert!(cache.search_and_get("h0:80/").is_none());
    for i in 1..11 {
        assert!(cache.search_and_get(&format!("h{i}:80/")).is_some());
    }
    assert_eq!(cache.used_bytes(), 1_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_concurrent_hits_promote_once_and_preserve_count() {
    let cache = Arc::new(Cache::new());
    let content: std::sync::Arc<[u8]> = std::sync::Arc::from(vec![b'q'; 10].into_boxed_slice());
    cache.add("shared:80/".into(), content);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.search_and_get("shared:80/") }));
    }
    for h in handles {
        assert!(h.await.unwrap().is_some());
    }
    assert_eq!(cache.order_from_head(), vec!["shared:80/".to_string()]);
}
