//! Request: the rendezvous between a pending end-user connection and the
//! reverse-stream the client dials back with (spec.md §4.1).
//!
//! `tokio_util::sync::CancellationToken` stands in for the "Context" the
//! distilled spec describes throughout — a cancel-fn/done-channel pair, per
//! spec.md §9's note on context propagation. A `tokio::sync::oneshot` is the
//! single-slot delivery channel spec.md §9 calls for; it already buffers one
//! value without an active receiver, so `send_conn` does not need to block
//! waiting for a waiter the way a language without buffered channels would.

use mip_core::{BoxedReverseStream, TunnelError, TunnelResult};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct Request {
    id: Uuid,
    parent: CancellationToken,
    cancelled: CancellationToken,
    tx: Mutex<Option<oneshot::Sender<BoxedReverseStream>>>,
    rx: Mutex<Option<oneshot::Receiver<BoxedReverseStream>>>,
}

impl Request {
    /// Create a new request as a child of `parent`'s cancellation scope.
    pub fn new(parent: CancellationToken) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            id: Uuid::new_v4(),
            cancelled: parent.child_token(),
            parent,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent_context(&self) -> &CancellationToken {
        &self.parent
    }

    /// Block until a stream is delivered, `ctx` ends, the parent context
    /// ends, or the request is cancelled. Exactly one outcome.
    pub async fn wait_conn(&self, ctx: &CancellationToken) -> TunnelResult<BoxedReverseStream> {
        let rx = self.rx.lock().await.take().ok_or_else(|| {
            TunnelError::Other("wait_conn called more than once on the same request".into())
        })?;

        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Err(TunnelError::RequestCancelled),
            _ = self.parent.cancelled() => Err(TunnelError::ParentCancelled),
            _ = ctx.cancelled() => Err(TunnelError::Timeout),
            res = rx => res.map_err(|_| TunnelError::RequestCancelled),
        }
    }

    /// Deliver `stream` to the single waiter, unless either context has
    /// already ended — in which case the stream is closed instead of
    /// leaking. A stray caller of `send_conn` after the slot is already
    /// filled (or after `wait_conn` already gave up) also gets its stream
    /// closed rather than silently dropped.
    pub async fn send_conn(&self, ctx: &CancellationToken, mut stream: BoxedReverseStream) {
        if self.cancelled.is_cancelled() || self.parent.is_cancelled() || ctx.is_cancelled() {
            let _ = stream.close().await;
            return;
        }

        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => {
                if let Err(stream) = tx.send(stream) {
                    let mut stream = stream;
                    let _ = stream.close().await;
                }
            }
            None => {
                let _ = stream.close().await;
            }
        }
    }

    /// Cancel the request. Must only be called by the request's owner (the
    /// `ControlConnection` that created it, or the service when it gives up
    /// waiting) — calling it twice is safe (the token is already cancelled),
    /// but calling it from anywhere else risks racing a legitimate delivery.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }
}
