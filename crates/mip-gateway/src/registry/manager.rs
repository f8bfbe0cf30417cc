//! `ConnectionManager`: the keyID → ControlConnection registry (spec.md
//! §3's ConnectionRegistry, §4.2). Two instances exist side by side — one
//! per credential kind — because HTTP and TCP clients are routed through
//! disjoint surfaces (spec.md §3).
//!
//! The round-robin cursor and `RwLock<HashMap<...>>` shape follow the
//! teacher's `wsh-server::relay::broker::RelayBroker`; the per-keyID
//! bucket-with-atomic-cursor is new here (the teacher picks a single relay
//! target, not a set with round-robin selection).

use crate::registry::connection::ControlConnection;
use crate::request::Request;
use mip_core::{BoxedReverseStream, TunnelError, TunnelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct KeyBucket {
    conns: Vec<Arc<ControlConnection>>,
    cursor: AtomicUsize,
}

impl KeyBucket {
    fn new() -> Self {
        Self {
            conns: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Round-robin pick: monotonic index mod length (spec.md §4.2).
    fn pick(&self) -> Option<Arc<ControlConnection>> {
        if self.conns.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        Some(self.conns[idx].clone())
    }
}

#[derive(Default)]
pub struct ConnectionManager {
    by_key: RwLock<HashMap<String, KeyBucket>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            by_key: RwLock::new(HashMap::new()),
        }
    }

    /// Pick a ControlConnection for `key_id` round-robin and ask it to
    /// issue a fresh Request (which sends the `Connect` command to the
    /// client). `KeyIdNotFound` if no ControlConnection is registered.
    pub async fn request_connection(
        &self,
        key_id: &str,
        _ctx: &CancellationToken,
    ) -> TunnelResult<Arc<Request>> {
        let conn = {
            let by_key = self.by_key.read().await;
            by_key
                .get(key_id)
                .and_then(KeyBucket::pick)
                .ok_or_else(|| TunnelError::KeyIdNotFound(key_id.to_string()))?
        };
        conn.issue_request().await
    }

    /// Register a newly-authenticated ControlConnection under `key_id`.
    pub async fn add_connection(&self, key_id: &str, conn: Arc<ControlConnection>) {
        let mut by_key = self.by_key.write().await;
        by_key
            .entry(key_id.to_string())
            .or_insert_with(KeyBucket::new)
            .conns
            .push(conn);
    }

    /// Remove a ControlConnection by (keyID, connection-id). Prunes the
    /// bucket entirely once it is empty.
    pub async fn remove_connection(&self, key_id: &str, conn_id: Uuid) {
        let mut by_key = self.by_key.write().await;
        if let Some(bucket) = by_key.get_mut(key_id) {
            bucket.conns.retain(|c| c.id() != conn_id);
            if bucket.conns.is_empty() {
                by_key.remove(key_id);
            }
        }
    }

    /// Find the Request named by `request_id` across every registered
    /// ControlConnection and deliver `stream` to it. If no Request
    /// matches, the stream is closed instead of leaked (spec.md §4.2).
    pub async fn resolve_request(&self, request_id: Uuid, stream: BoxedReverseStream) {
        if let Err(mut stream) = self.try_resolve_request(request_id, stream).await {
            let _ = stream.close().await;
        }
    }

    /// Like `resolve_request`, but hands `stream` back instead of closing it
    /// when no Request matches — so a caller holding more than one registry
    /// (the Service, searching HTTP and TCP side by side) can try the next
    /// one before giving up on the stream.
    pub async fn try_resolve_request(
        &self,
        request_id: Uuid,
        stream: BoxedReverseStream,
    ) -> Result<(), BoxedReverseStream> {
        let conns: Vec<Arc<ControlConnection>> = {
            let by_key = self.by_key.read().await;
            by_key.values().flat_map(|b| b.conns.iter().cloned()).collect()
        };

        let mut stream = stream;
        for conn in conns {
            match conn.try_resolve(request_id, stream).await {
                Ok(()) => return Ok(()),
                Err(returned) => stream = returned,
            }
        }
        Err(stream)
    }

    /// Find and cancel the Request named by `request_id` across every
    /// registered ControlConnection.
    pub async fn cancel_request(&self, request_id: Uuid) {
        let conns: Vec<Arc<ControlConnection>> = {
            let by_key = self.by_key.read().await;
            by_key.values().flat_map(|b| b.conns.iter().cloned()).collect()
        };
        for conn in conns {
            if conn.try_cancel(request_id).await {
                return;
            }
        }
    }

    /// Number of live ControlConnections registered under `key_id`.
    pub async fn count(&self, key_id: &str) -> usize {
        self.by_key
            .read()
            .await
            .get(key_id)
            .map(|b| b.conns.len())
            .unwrap_or(0)
    }
}
