//! `ControlConnection`: the live, server-side handle to one client that has
//! completed registration (spec.md §3's ControlConnection entity, §4.1-4.2).
//!
//! Adapted from the teacher's `PeerEntry`/`PeerRegistry` pair
//! (`wsh-server::relay::registry`) — there, a peer is a flat struct sitting
//! in a shared map; here, a ControlConnection is its own actor-ish object
//! because it additionally owns a pending-requests map and the ability to
//! push a `Connect` command down to the client it represents.

use crate::request::Request;
use mip_core::{BoxedReverseStream, TunnelError, TunnelResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Sends a `Connect` command to the client this `ControlConnection`
/// represents, asking it to dial back and Bind the given request-id.
/// Implemented by the control-channel writer in `control.rs`; kept as a
/// trait here so the registry does not need to know about frame formats or
/// whether the connection is V1 (JSON) or V2 (yamux).
pub trait ConnectSender: Send + Sync {
    fn send_connect<'a>(
        &'a self,
        request_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;

    /// Send a keep-alive `Ping` down the control channel (spec.md §4.3's
    /// 200ms ping loop). Kept on the same trait as `send_connect` so the
    /// ping loop in `service.rs` does not need to know whether it is
    /// talking to a plain V1 transport or a V2 yamux control stream.
    fn send_ping<'a>(&'a self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;
}

pub struct ControlConnection {
    id: Uuid,
    key_id: String,
    ctx: CancellationToken,
    sink: Arc<dyn ConnectSender>,
    pending: Mutex<HashMap<Uuid, Arc<Request>>>,
}

impl ControlConnection {
    pub fn new(key_id: String, ctx: CancellationToken, sink: Arc<dyn ConnectSender>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_id,
            ctx,
            sink,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// This connection's scoped context; cancelled when the connection
    /// closes. Every `Request` this connection issues is a child of it, so
    /// closing the connection cancels all of that connection's in-flight
    /// requests for free.
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Mint a fresh `Request`, register it in the pending map, and ask the
    /// client to dial back for it. On send failure, the request is removed
    /// before returning so it cannot leak in the map forever.
    pub async fn issue_request(&self) -> TunnelResult<Arc<Request>> {
        let request = Arc::new(Request::new(self.ctx.clone()));
        self.pending.lock().await.insert(request.id(), request.clone());

        if let Err(e) = self.sink.send_connect(request.id()).await {
            self.pending.lock().await.remove(&request.id());
            return Err(e);
        }

        Ok(request)
    }

    /// Deliver a reverse-stream to the Request named by `request_id`, if
    /// this connection owns it. On a miss, `stream` is handed back so the
    /// caller can try the next ControlConnection instead of losing it.
    pub async fn try_resolve(
        &self,
        request_id: Uuid,
        stream: BoxedReverseStream,
    ) -> Result<(), BoxedReverseStream> {
        let request = self.pending.lock().await.remove(&request_id);
        match request {
            Some(request) => {
                request.send_conn(&self.ctx, stream).await;
                Ok(())
            }
            None => Err(stream),
        }
    }

    /// Cancel the Request named by `request_id`, if owned here.
    pub async fn try_cancel(&self, request_id: Uuid) -> bool {
        let request = self.pending.lock().await.remove(&request_id);
        match request {
            Some(request) => {
                request.cancel();
                true
            }
            None => false,
        }
    }

    /// Close this connection: cancel its context (cascading to every
    /// pending Request) and drop the pending map.
    pub async fn close(&self) {
        self.ctx.cancel();
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            debug!(conn_id = %self.id, key_id = %self.key_id, count, "closed control connection with pending requests");
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(Arc<AtomicUsize>);
    impl ConnectSender for CountingSink {
        fn send_connect<'a>(
            &'a self,
            _request_id: Uuid,
        ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn send_ping<'a>(&'a self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FailingSink;
    impl ConnectSender for FailingSink {
        fn send_connect<'a>(
            &'a self,
            _request_id: Uuid,
        ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Err(TunnelError::FailedToConnect("dead transport".into())) })
        }

        fn send_ping<'a>(&'a self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Err(TunnelError::FailedToConnect("dead transport".into())) })
        }
    }

    struct NullStream;
    impl mip_core::ReverseStream for NullStream {
        fn read<'a>(
            &'a mut self,
            _buf: &'a mut [u8],
        ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
            Box::pin(async { Ok(0) })
        }
        fn write_all<'a>(
            &'a mut self,
            _data: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
        fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
        fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn issue_then_resolve() {
        let sent = Arc::new(AtomicUsize::new(0));
        let conn = ControlConnection::new(
            "alpha".into(),
            CancellationToken::new(),
            Arc::new(CountingSink(sent.clone())),
        );

        let request = conn.issue_request().await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_count().await, 1);

        assert!(conn.try_resolve(request.id(), Box::new(NullStream)).await.is_ok());
        assert_eq!(conn.pending_count().await, 0);

        let result = request.wait_conn(&CancellationToken::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn issue_fails_when_sink_fails() {
        let conn = ControlConnection::new("alpha".into(), CancellationToken::new(), Arc::new(FailingSink));
        assert!(conn.issue_request().await.is_err());
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn resolving_unknown_request_id_returns_false() {
        let sent = Arc::new(AtomicUsize::new(0));
        let conn = ControlConnection::new(
            "alpha".into(),
            CancellationToken::new(),
            Arc::new(CountingSink(sent)),
        );
        assert!(conn.try_resolve(Uuid::new_v4(), Box::new(NullStream)).await.is_err());
    }

    #[tokio::test]
    async fn close_cancels_pending_requests() {
        let sent = Arc::new(AtomicUsize::new(0));
        let conn = ControlConnection::new(
            "alpha".into(),
            CancellationToken::new(),
            Arc::new(CountingSink(sent)),
        );
        let request = conn.issue_request().await.unwrap();
        conn.close().await;

        let result = request.wait_conn(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TunnelError::ParentCancelled)));
    }
}
