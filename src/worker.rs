//! Per-connection driver: parse -> cache-lookup -> (serve-from-cache OR
//! dial origin, forward, capture, maybe-cache, stream) -> close.

use std::sync::Arc;

use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::cache::{cache_key, Cache, MAX_OBJECT_SIZE};
use crate::error::{ProxyError, ProxyResult};
use crate::io::{Block, BufferedIo};
use crate::parser::{extract_host_and_path, parse_request_line, rewrite_request};

const MAX_REQUEST_LINE: usize = 8192;
const MAX_HEADER_LINE: usize = 8192;

fn error_page(code: u16, short: &str, long: &str, cause: &str) -> Vec<u8> {
    let body = format!(
        "<html><title>Proxy Error</title><body bgcolor=\"ffffff\">\r\n\
         {code}: {short}\r\n\
         <p>{long}: {cause}\r\n\
         <hr><em>The proxy server</em>\r\n"
    );
    format!(
        "HTTP/1.0 {code} {short}\r\n\
         Content-type: text/html\r\n\
         Content-length: {len}\r\n\
         \r\n\
         {body}",
        len = body.len()
    )
    .into_bytes()
}

/// Dials an origin host:port. Production uses real TCP + DNS via
/// `tokio::net::TcpStream::connect`; tests can substitute a fake dialer that
/// points at a loopback listener without touching DNS at all.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, hostname: &str, port: u16) -> std::io::Result<TcpStream>;
}

pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, hostname: &str, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((hostname, port)).await
    }
}

/// Runs one client connection end to end. `worker_id` is a log-correlation
/// number only; it carries no other meaning.
pub async fn serve_connection<S>(
    stream: S,
    worker_id: u32,
    cache: Arc<Cache>,
    dialer: Arc<dyn Dialer>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut io = BufferedIo::new(stream);
    match drive_request(&mut io, worker_id, &cache, dialer.as_ref()).await {
        Ok(()) => {}
        Err(ProxyError::ClientProtocol) => {
            let _ = io
                .write_all(&error_page(
                    501,
                    "Not Implemented",
                    "Unsupported method",
                    "proxy does not implement this method",
                ))
                .await;
        }
        Err(ProxyError::OriginDns { hostname }) => {
            let _ = io
                .write_all(&error_page(
                    400,
                    "Bad Request",
                    "DNS lookup failed",
                    &hostname,
                ))
                .await;
        }
        Err(ProxyError::MalformedHost) => {
            warn!("[{worker_id}] malformed request: no usable host");
        }
        Err(ProxyError::OriginConnect { hostname, port, .. }) => {
            warn!("[{worker_id}] failed to connect to origin {hostname}:{port}");
        }
        Err(ProxyError::Transport(e)) => {
            warn!("[{worker_id}] transport error: {e}");
        }
    }
}

async fn drive_request<S>(
    io: &mut BufferedIo<S>,
    worker_id: u32,
    cache: &Cache,
    dialer: &dyn Dialer,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = match io.read_line(MAX_REQUEST_LINE).await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let request_line_str = String::from_utf8_lossy(&request_line).into_owned();
    info!("[{worker_id}] {}", request_line_str.trim_end());

    let parsed = parse_request_line(&request_line_str).ok_or(ProxyError::MalformedHost)?;
    if parsed.method != "GET" {
        return Err(ProxyError::ClientProtocol);
    }

    let (uri_host, uri_path) = extract_host_and_path(&parsed.uri);

    let mut header_lines = Vec::new();
    loop {
        let line = match io.read_line(MAX_HEADER_LINE).await? {
            Some(line) => line,
            None => break,
        };
        if line.is_empty() || line == b"\r\n" {
            break;
        }
        header_lines.push(String::from_utf8_lossy(&line).into_owned());
    }

    let rewritten = rewrite_request(&uri_path, &uri_host, &header_lines)?;
    info!(
        "[{worker_id}] host extracted: {}:{}",
        rewritten.hostname, rewritten.port
    );

    let key = cache_key(&rewritten.hostname, rewritten.port, &rewritten.path);

    if let Some(cached) = cache.search_and_get(&key) {
        info!("[{worker_id}] cache hit: {key} ({} bytes)", cached.len());
        io.write_all(&cached).await?;
        return Ok(());
    }
    info!("[{worker_id}] cache miss: {key}");

    let mut origin = dialer
        .dial(&rewritten.hostname, rewritten.port)
        .await
        .map_err(|e| classify_dial_error(e, &rewritten.hostname, rewritten.port))?;

    tokio::io::AsyncWriteExt::write_all(&mut origin, rewritten.raw.as_bytes()).await?;

    let mut origin_io = BufferedIo::new(origin);
    let mut buf = vec![0u8; MAX_OBJECT_SIZE];
    let mut total = 0usize;
    let mut reads = 0u32;

    loop {
        match origin_io.read_block(MAX_OBJECT_SIZE, &mut buf).await? {
            Block::Eof => break,
            Block::Data(n) => {
                reads += 1;
                // read_block reads fully up to MAX_OBJECT_SIZE, so a first
                // read short of that length means the whole response fit.
                if reads == 1 && n < MAX_OBJECT_SIZE {
                    let content: Arc<[u8]> = Arc::from(buf[..n].to_vec().into_boxed_slice());
                    cache.add(key.clone(), content);
                }
                io.write_all(&buf[..n]).await?;
                total += n;
            }
        }
    }
    info!("[{worker_id}] {total} bytes transmitted as response");
    info!("[{worker_id}] {}", cache.status());
    Ok(())
}

fn classify_dial_error(err: std::io::Error, hostname: &str, port: u16) -> ProxyError {
    use std::io::ErrorKind;
    match err.kind() {
        // Name resolution fails before a socket even exists; on Unix hosts
        // that surfaces through `getaddrinfo` as `NotFound`.
        ErrorKind::NotFound => ProxyError::OriginDns {
            hostname: hostname.to_string(),
        },
        _ => ProxyError::OriginConnect {
            hostname: hostname.to_string(),
            port,
            source: err,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    struct LoopbackDialer {
        addr: std::net::SocketAddr,
    }

    #[async_trait::async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial(&self, _hostname: &str, _port: u16) -> std::io::Result<TcpStream> {
            TcpStream::connect(self.addr).await
        }
    }

    async fn spawn_origin(response: Vec<u8>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 1024];
            let _ = sock.read(&mut req).await;
            sock.write_all(&response).await.unwrap();
            sock.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn cold_miss_then_cache_populated() {
        let body = b"hello world".to_vec();
        let response = format!(
            "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            String::from_utf8(body.clone()).unwrap()
        )
        .into_bytes();
        let addr = spawn_origin(response.clone()).await;

        let cache = Arc::new(Cache::new());
        let dialer: Arc<dyn Dialer> = Arc::new(LoopbackDialer { addr });

        let request = b"GET http://example.com/a HTTP/1.0\r\nHost: example.com\r\n\r\n".to_vec();
        let (client, server) = tokio::io::duplex(8192);
        let mut client = client;

        let handle = tokio::spawn(serve_connection(server, 1, cache.clone(), dialer));
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        handle.await.unwrap();

        assert_eq!(out, response);
        assert!(cache.search_and_get("example.com:80/a").is_some());
    }

    #[tokio::test]
    async fn non_get_method_gets_501() {
        let cache = Arc::new(Cache::new());
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer);

        let request = b"POST /x HTTP/1.0\r\n\r\n".to_vec();
        let (client, server) = tokio::io::duplex(8192);
        let mut client = client;

        let handle = tokio::spawn(serve_connection(server, 1, cache, dialer));
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        handle.await.unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.0 501 Not Implemented"));
    }
}
