//! Accept loop: spawns a worker task per accepted connection and tracks the
//! live-worker count under a dedicated lock.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::cache::Cache;
use crate::worker::{serve_connection, Dialer, TcpDialer};

/// Arbitrary ceiling worker ids wrap at, purely for log correlation. Carries
/// no other meaning.
const MAX_WORKER_ID: u32 = 100;

struct WorkerCount {
    live: u32,
    next_id: u32,
}

pub struct Dispatcher {
    cache: Arc<Cache>,
    dialer: Arc<dyn Dialer>,
    counter: Arc<Mutex<WorkerCount>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_dialer(Arc::new(TcpDialer))
    }

    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            cache: Arc::new(Cache::new()),
            dialer,
            counter: Arc::new(Mutex::new(WorkerCount {
                live: 0,
                next_id: 1,
            })),
        }
    }

    pub fn cache(&self) -> Arc<Cache> {
        self.cache.clone()
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        self.dialer.clone()
    }

    /// Binds `port` and loops forever accepting connections. Returns only on
    /// a listen-bind failure, which the caller treats as a startup-time
    /// process-terminating condition.
    pub async fn run(&self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("rproxy listening on 0.0.0.0:{port}");
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    let worker_id = self.next_worker_id();
                    let live = self.increment_live();
                    info!("[{worker_id}] client connected. live workers: {live}");

                    let cache = self.cache.clone();
                    let dialer = self.dialer.clone();
                    let counter = self.counter.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, worker_id, cache, dialer).await;
                        let live = {
                            let mut guard = counter.lock();
                            guard.live -= 1;
                            guard.live
                        };
                        info!("[{worker_id}] connection closed. live workers: {live}");
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            }
        }
    }

    fn next_worker_id(&self) -> u32 {
        let mut guard = self.counter.lock();
        let id = guard.next_id;
        guard.next_id = if id >= MAX_WORKER_ID { 1 } else { id + 1 };
        id
    }

    fn increment_live(&self) -> u32 {
        let mut guard = self.counter.lock();
        guard.live += 1;
        guard.live
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
