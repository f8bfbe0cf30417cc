//! TCP Edge Server: one dynamically-allocated listener per registered TCP
//! keyID, with the accept-goroutine/handler-waitgroup release protocol
//! spec.md §4.8 calls out as "the subtle invariant" (join the accept task
//! before the handler tasks, so nothing can race a listener shutdown).
//!
//! The accept loop's `tokio::select!` over "next accept" vs "a tracked
//! handler task finished" follows `tor-dirserver::http::Dispatcher::serve`'s
//! `JoinSet`-based dispatch loop; `JoinSet` itself stands in for the
//! "disjoint waitgroups" spec.md §5 describes (accept-waitgroup joined
//! before handler-waitgroup).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mip_core::TunnelError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::portpool::PortPool;

/// What to do with each accepted end-user TCP connection. The TCP edge
/// itself knows nothing about the tunnel service; it just hands connections
/// off (tagged with the keyID whose listener accepted them) and tracks their
/// handler tasks.
pub type ConnectionHandler = Arc<
    dyn Fn(String, TcpStream, String) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

struct ActiveListener {
    port: u16,
    cancel: CancellationToken,
    accept_task: tokio::task::JoinHandle<()>,
}

pub struct TcpEdgeServer {
    listen_host: String,
    pool: Arc<PortPool>,
    listeners: RwLock<HashMap<String, ActiveListener>>,
    handler: ConnectionHandler,
}

impl TcpEdgeServer {
    pub fn new(listen_host: String, pool: Arc<PortPool>, handler: ConnectionHandler) -> Self {
        Self {
            listen_host,
            pool,
            listeners: RwLock::new(HashMap::new()),
            handler,
        }
    }

    /// Allocate a port, bind a listener, and spawn its accept task for
    /// `key_id`. `KeyIdAlreadyAllocated` if one already exists.
    pub async fn allocate(&self, key_id: &str) -> Result<u16, TunnelError> {
        {
            let listeners = self.listeners.read().await;
            if listeners.contains_key(key_id) {
                return Err(TunnelError::KeyIdAlreadyAllocated(key_id.to_string()));
            }
        }

        let port = self.pool.allocate().await?;
        let listener = match TcpListener::bind((self.listen_host.as_str(), port)).await {
            Ok(l) => l,
            Err(e) => {
                self.pool.release(port).await;
                return Err(TunnelError::Io(e));
            }
        };

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            key_id.to_string(),
            listener,
            cancel.clone(),
            self.handler.clone(),
        ));

        let mut listeners = self.listeners.write().await;
        // Re-check under the write lock: another caller may have won the
        // race to allocate this key_id while we were binding.
        if listeners.contains_key(key_id) {
            cancel.cancel();
            accept_task.abort();
            self.pool.release(port).await;
            return Err(TunnelError::KeyIdAlreadyAllocated(key_id.to_string()));
        }
        listeners.insert(
            key_id.to_string(),
            ActiveListener {
                port,
                cancel,
                accept_task,
            },
        );

        info!(key_id, port, "tcp edge listener allocated");
        Ok(port)
    }

    /// Release the listener for `key_id`, if any. Idempotent.
    ///
    /// Cancels the listener's context, then joins the accept task *before*
    /// the handler-waitgroup — per spec.md §4.8 this ordering guarantees no
    /// further handler task can be spawned after we start waiting for the
    /// existing ones.
    pub async fn release(&self, key_id: &str) {
        let active = self.listeners.write().await.remove(key_id);
        let Some(active) = active else { return };

        active.cancel.cancel();
        if let Err(e) = active.accept_task.await {
            if !e.is_cancelled() {
                warn!(key_id, error = %e, "accept task exited abnormally");
            }
        }

        self.pool.release(active.port).await;
        info!(key_id, port = active.port, "tcp edge listener released");
    }

    pub async fn port_of(&self, key_id: &str) -> Option<u16> {
        self.listeners.read().await.get(key_id).map(|a| a.port)
    }
}

async fn accept_loop(
    key_id: String,
    listener: TcpListener,
    cancel: CancellationToken,
    handler: ConnectionHandler,
) {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let handler = handler.clone();
                    let key_id2 = key_id.clone();
                    handlers.spawn(async move { handler(key_id2, stream, addr.to_string()).await; });
                }
                Err(e) => {
                    warn!(key_id = %key_id, error = %e, "tcp edge accept failed, backing off");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        warn!(key_id = %key_id, error = %e, "tcp edge handler task panicked");
                    }
                }
            }
        }
    }

    debug!(key_id = %key_id, pending = handlers.len(), "tcp edge accept loop exiting, draining handlers");
    while handlers.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    fn counting_handler(counter: Arc<AtomicUsize>) -> ConnectionHandler {
        Arc::new(move |_key_id, _stream, _addr| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn allocate_then_connect_then_release() {
        let pool = Arc::new(PortPool::new(21000, 21010));
        let hits = Arc::new(AtomicUsize::new(0));
        let edge = TcpEdgeServer::new("127.0.0.1".into(), pool.clone(), counting_handler(hits.clone()));

        let port = edge.allocate("alpha").await.unwrap();
        assert_eq!(edge.port_of("alpha").await, Some(port));

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        edge.release("alpha").await;
        assert_eq!(edge.port_of("alpha").await, None);
        assert_eq!(pool.available().await, 11);
    }

    #[tokio::test]
    async fn duplicate_allocate_is_rejected() {
        let pool = Arc::new(PortPool::new(22000, 22010));
        let hits = Arc::new(AtomicUsize::new(0));
        let edge = TcpEdgeServer::new("127.0.0.1".into(), pool, counting_handler(hits));

        edge.allocate("alpha").await.unwrap();
        let err = edge.allocate("alpha").await.unwrap_err();
        assert!(matches!(err, TunnelError::KeyIdAlreadyAllocated(_)));
        edge.release("alpha").await;
    }

    #[tokio::test]
    async fn release_of_unknown_key_id_is_a_no_op() {
        let pool = Arc::new(PortPool::new(23000, 23010));
        let hits = Arc::new(AtomicUsize::new(0));
        let edge = TcpEdgeServer::new("127.0.0.1".into(), pool, counting_handler(hits));
        edge.release("ghost").await;
    }

    #[tokio::test]
    async fn release_waits_for_in_flight_handler() {
        let pool = Arc::new(PortPool::new(24000, 24010));
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let started2 = started.clone();
        let finished2 = finished.clone();

        let handler: ConnectionHandler = Arc::new(move |_key_id, _s, _a| {
            let started = started2.clone();
            let finished = finished2.clone();
            Box::pin(async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(80)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            })
        });

        let edge = TcpEdgeServer::new("127.0.0.1".into(), pool, handler);
        let port = edge.allocate("alpha").await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        started.notified().await;
        let _ = stream.write_all(b"x").await;

        edge.release("alpha").await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_receives_the_owning_key_id() {
        let pool = Arc::new(PortPool::new(25000, 25010));
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        let handler: ConnectionHandler = Arc::new(move |key_id, _stream, _addr| {
            let seen = seen2.clone();
            Box::pin(async move {
                seen.lock().await.push(key_id);
            })
        });

        let edge = TcpEdgeServer::new("127.0.0.1".into(), pool, handler);
        let port_a = edge.allocate("alpha").await.unwrap();
        let port_b = edge.allocate("bravo").await.unwrap();

        let _ = TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
        let _ = TcpStream::connect(("127.0.0.1", port_b)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = seen.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["alpha".to_string(), "bravo".to_string()]);

        edge.release("alpha").await;
        edge.release("bravo").await;
    }
}
