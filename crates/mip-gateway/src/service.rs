//! `TunnelService`: the glue between authentication, the two connection
//! registries, the TCP edge, and the byte-pipe — `HandleReverseConn`,
//! `HandleHTTPConnection`, `HandleTCPConnection`, and token mint/revoke
//! (spec.md §4.3, §4.4; the Tunnel Service row of spec.md §2's component
//! table, ~30% of the core).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mip_core::{frame_encode, BoxedReverseStream, IoReverseStream, ReverseStream, TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{self, ControlFrame, HandshakeOutcome, KEEPALIVE_INTERVAL};
use crate::credentials::{generate_secret, validate_key_id, CredentialKind, CredentialStore, Token};
use crate::pipe;
use crate::read_ctx::CtxBoundStream;
use crate::registry::{ConnectSender, ConnectionManager, ControlConnection};
use crate::tcp_edge::TcpEdgeServer;

/// The HTTP client-meta frame written to the reverse-stream ahead of the
/// buffered request bytes (spec.md §6). Unversioned per the decision
/// recorded in SPEC_FULL.md/DESIGN.md: a bare `{"ip": "..."}` object behind
/// the same 4-byte length prefix the control channel uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConnMeta {
    pub ip: String,
}

/// Sends frames on a split-owned `TcpStream`'s write half, serialized behind
/// a mutex so the keep-alive ping loop and an in-flight `Connect` never
/// interleave their writes (spec.md §5: "no operation holds a lock across a
/// blocking I/O or channel op" — the lock here guards only which write goes
/// first, not the write itself).
struct StreamConnectSender<W> {
    writer: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> ConnectSender for StreamConnectSender<W> {
    fn send_connect<'a>(
        &'a self,
        request_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut w = self.writer.lock().await;
            mip_core::write_frame(&mut *w, &ControlFrame::Connect { request_id }).await
        })
    }

    fn send_ping<'a>(&'a self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut w = self.writer.lock().await;
            mip_core::write_frame(&mut *w, &ControlFrame::Ping).await
        })
    }
}

/// Tell a freshly-authenticated client it has reached the `Registered`
/// state, then deliver its public endpoint via the "URL-to-connect-updated"
/// event (spec.md §4.3, §6) — two frames, since `Registered` carries no
/// payload of its own.
async fn send_registration<W: AsyncWrite + Unpin>(writer: &mut W, endpoint: &str) -> TunnelResult<()> {
    mip_core::write_frame(writer, &ControlFrame::Registered).await?;
    mip_core::write_frame(
        writer,
        &ControlFrame::UrlUpdate {
            endpoint: endpoint.to_string(),
        },
    )
    .await
}

pub struct TunnelService {
    credentials: Arc<dyn CredentialStore>,
    http_registry: Arc<ConnectionManager>,
    tcp_registry: Arc<ConnectionManager>,
    tcp_edge: Arc<TcpEdgeServer>,
    public_host: String,
    root: CancellationToken,
}

impl TunnelService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        http_registry: Arc<ConnectionManager>,
        tcp_registry: Arc<ConnectionManager>,
        tcp_edge: Arc<TcpEdgeServer>,
        public_host: String,
        root: CancellationToken,
    ) -> Self {
        Self {
            credentials,
            http_registry,
            tcp_registry,
            tcp_edge,
            public_host,
            root,
        }
    }

    pub fn public_host(&self) -> &str {
        &self.public_host
    }

    pub fn root_context(&self) -> CancellationToken {
        self.root.clone()
    }

    // -- token mint/revoke -------------------------------------------------

    /// Mint a fresh credential for `key_id` and persist it through the
    /// `CredentialStore` seam. `DuplicateTokenId` if one already exists;
    /// `InvalidToken` if `key_id` fails the alphabet/length check.
    pub async fn issue_token(
        &self,
        key_id: &str,
        kind: CredentialKind,
        ttl: Duration,
    ) -> TunnelResult<String> {
        validate_key_id(key_id)?;
        let secret = generate_secret();
        let token = Token {
            key_id: key_id.to_string(),
            secret: secret.clone(),
            kind,
            expires_at: Instant::now() + ttl,
        };
        self.credentials.save(token).await?;
        Ok(secret)
    }

    /// Revoke a credential. Idempotent — revoking an unknown keyID is not
    /// an error (spec.md §7).
    pub async fn revoke_token(&self, key_id: &str) -> TunnelResult<()> {
        self.credentials.delete(key_id).await
    }

    // -- HandleReverseConn --------------------------------------------------

    /// Run the revdial-style handshake on a freshly-accepted transport
    /// connection and dispatch to the control-plane or data-plane path
    /// (spec.md §4.3). Runs until the connection ends; never returns an
    /// error the caller needs to act on — failures are logged and the
    /// connection is dropped.
    pub async fn handle_reverse_conn(self: Arc<Self>, mut stream: TcpStream, peer: std::net::SocketAddr) {
        let outcome = control::perform_handshake(&mut stream, self.credentials.as_ref()).await;
        match outcome {
            Ok(HandshakeOutcome::Registered {
                key_id,
                kind,
                connection_id,
                multiplex,
            }) => {
                if multiplex {
                    self.run_control_connection_v2(stream, key_id, kind, connection_id)
                        .await;
                } else {
                    self.run_control_connection(stream, key_id, kind, connection_id)
                        .await;
                }
            }
            Ok(HandshakeOutcome::Bound { request_id }) => {
                let stream: BoxedReverseStream = Box::new(stream);
                self.handle_bound(stream, request_id).await;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "reverse connection handshake failed");
            }
        }
    }

    async fn run_control_connection(
        self: Arc<Self>,
        stream: TcpStream,
        key_id: String,
        kind: CredentialKind,
        connection_id: Uuid,
    ) {
        let (mut read_half, write_half) = stream.into_split();
        let sink = Arc::new(StreamConnectSender {
            writer: tokio::sync::Mutex::new(write_half),
        });

        let ctx = self.root.child_token();
        let conn = Arc::new(ControlConnection::new(key_id.clone(), ctx.clone(), sink.clone()));

        let registry = self.registry_for(kind);

        let endpoint = match kind {
            CredentialKind::Http => format!("https://{}.{}", key_id, self.public_host),
            CredentialKind::Tcp => match self.tcp_edge.allocate(&key_id).await {
                Ok(port) => format!("{}:{}", self.public_host, port),
                Err(e) => {
                    warn!(key_id = %key_id, error = %e, "failed to allocate tcp endpoint");
                    let _ = mip_core::write_frame(
                        &mut *sink.writer.lock().await,
                        &ControlFrame::AuthFail {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            },
        };

        if send_registration(&mut *sink.writer.lock().await, &endpoint).await.is_err() {
            if kind == CredentialKind::Tcp {
                self.tcp_edge.release(&key_id).await;
            }
            return;
        }

        registry.add_connection(&key_id, conn.clone()).await;
        info!(key_id = %key_id, connection_id = %connection_id, endpoint = %endpoint, "client registered");

        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    let ping = async {
                        sink.send_ping().await?;
                        match mip_core::read_frame::<_, ControlFrame>(&mut read_half).await? {
                            Some(ControlFrame::Pong) => Ok(()),
                            Some(other) => Err(TunnelError::ProtocolViolation(format!("expected pong, got {other:?}"))),
                            None => Err(TunnelError::ProtocolViolation("control connection closed".into())),
                        }
                    }.await;

                    if let Err(e) = ping {
                        debug!(key_id = %key_id, connection_id = %connection_id, error = %e, "control connection ping failed");
                        break;
                    }
                }
            }
        }

        conn.close().await;
        registry.remove_connection(&key_id, conn.id()).await;
        if kind == CredentialKind::Tcp {
            self.tcp_edge.release(&key_id).await;
        }
        info!(key_id = %key_id, connection_id = %connection_id, "client disconnected");
    }

    /// The V2 (multiplexed) counterpart of `run_control_connection`
    /// (spec.md §4.3's "newer V2 variant", §6). The registered transport is
    /// driven as a `yamux::Connection` instead of a raw duplex byte stream:
    /// by gateway convention (there being nothing in spec.md pinning this
    /// down — recorded in DESIGN.md) the first substream the client opens is
    /// the control stream, carrying the same `ControlFrame` Ping/Connect
    /// traffic V1 sends directly on the socket; every substream opened after
    /// that must open with the fixed 18-byte Bind frame.
    async fn run_control_connection_v2(
        self: Arc<Self>,
        stream: TcpStream,
        key_id: String,
        kind: CredentialKind,
        connection_id: Uuid,
    ) {
        let mut conn = yamux::Connection::new(stream.compat(), yamux::Config::default(), yamux::Mode::Server);

        let control_stream = match conn.next_stream().await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(key_id = %key_id, connection_id = %connection_id, "v2 client vanished before opening a control stream");
                return;
            }
            Err(e) => {
                debug!(key_id = %key_id, connection_id = %connection_id, error = %e, "v2 control stream negotiation failed");
                return;
            }
        };
        let (mut control_read, control_write) = tokio::io::split(control_stream.compat());
        let sink = Arc::new(StreamConnectSender {
            writer: tokio::sync::Mutex::new(control_write),
        });

        let ctx = self.root.child_token();
        let conn_handle = Arc::new(ControlConnection::new(key_id.clone(), ctx.clone(), sink.clone()));
        let registry = self.registry_for(kind);

        let endpoint = match kind {
            CredentialKind::Http => format!("https://{}.{}", key_id, self.public_host),
            CredentialKind::Tcp => match self.tcp_edge.allocate(&key_id).await {
                Ok(port) => format!("{}:{}", self.public_host, port),
                Err(e) => {
                    warn!(key_id = %key_id, error = %e, "failed to allocate tcp endpoint");
                    let _ = mip_core::write_frame(
                        &mut *sink.writer.lock().await,
                        &ControlFrame::AuthFail {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            },
        };

        if send_registration(&mut *sink.writer.lock().await, &endpoint).await.is_err() {
            if kind == CredentialKind::Tcp {
                self.tcp_edge.release(&key_id).await;
            }
            return;
        }

        registry.add_connection(&key_id, conn_handle.clone()).await;
        info!(key_id = %key_id, connection_id = %connection_id, endpoint = %endpoint, multiplex = true, "client registered");

        // The only task allowed to poll `conn`: it both accepts fresh Bind
        // substreams and pumps the underlying mux, so the control stream's
        // read/write halves above can make progress.
        let accept_ctx = ctx.clone();
        let service_for_accept = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match conn.next_stream().await {
                    Ok(Some(data_stream)) => {
                        let service = service_for_accept.clone();
                        tokio::spawn(service.handle_v2_bind_stream(data_stream));
                    }
                    Ok(None) | Err(_) => {
                        accept_ctx.cancel();
                        break;
                    }
                }
            }
        });

        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    let ping = async {
                        sink.send_ping().await?;
                        match mip_core::read_frame::<_, ControlFrame>(&mut control_read).await? {
                            Some(ControlFrame::Pong) => Ok(()),
                            Some(other) => Err(TunnelError::ProtocolViolation(format!("expected pong, got {other:?}"))),
                            None => Err(TunnelError::ProtocolViolation("control stream closed".into())),
                        }
                    }.await;

                    if let Err(e) = ping {
                        debug!(key_id = %key_id, connection_id = %connection_id, error = %e, "v2 control stream ping failed");
                        break;
                    }
                }
            }
        }

        accept_task.abort();
        conn_handle.close().await;
        registry.remove_connection(&key_id, conn_handle.id()).await;
        if kind == CredentialKind::Tcp {
            self.tcp_edge.release(&key_id).await;
        }
        info!(key_id = %key_id, connection_id = %connection_id, "client disconnected");
    }

    /// One accepted V2 substream: read its 18-byte Bind frame, ack it, and
    /// resolve it against the pending request the same way a V1 Bind
    /// connection would be.
    async fn handle_v2_bind_stream(self: Arc<Self>, data_stream: yamux::Stream) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut io = data_stream.compat();
        let mut frame = [0u8; control::V2_BIND_FRAME_LEN];
        if io.read_exact(&mut frame).await.is_err() {
            return;
        }
        let request_id = match control::decode_v2_bind(&frame) {
            Some(id) => id,
            None => {
                debug!("v2 substream opened with an unrecognized bind frame, closing");
                return;
            }
        };
        if io.write_all(&control::encode_v2_bind_ack()).await.is_err() {
            return;
        }

        let stream: BoxedReverseStream = Box::new(IoReverseStream(io));
        self.handle_bound(stream, request_id).await;
    }

    /// Resolve a freshly-Bound data-plane stream against the request named
    /// by `request_id`, trying the HTTP registry before the TCP one (a
    /// request-id is only ever pending in one of them, so this is a safe
    /// search rather than an ambiguous race). Shared by both the V1 (raw
    /// `TcpStream`) and V2 (yamux substream, via `IoReverseStream`) Bind
    /// paths — each wraps its own transport into a `BoxedReverseStream`
    /// before calling in here.
    async fn handle_bound(&self, stream: BoxedReverseStream, request_id: Uuid) {
        let notifier = crate::close_notify::CloseNotifier::new(stream);
        let closed = notifier.closed();
        let stream: BoxedReverseStream = Box::new(notifier);

        let stream = match self.http_registry.try_resolve_request(request_id, stream).await {
            Ok(()) => {
                closed.cancelled().await;
                return;
            }
            Err(stream) => stream,
        };

        match self.tcp_registry.try_resolve_request(request_id, stream).await {
            Ok(()) => {
                closed.cancelled().await;
            }
            Err(mut stream) => {
                let _ = stream.close().await;
                debug!(request_id = %request_id, "bind frame for unknown request, stream closed");
            }
        }
    }

    fn registry_for(&self, kind: CredentialKind) -> &Arc<ConnectionManager> {
        match kind {
            CredentialKind::Http => &self.http_registry,
            CredentialKind::Tcp => &self.tcp_registry,
        }
    }

    // -- HandleHTTPConnection / HandleTCPConnection -------------------------

    /// Service one end-user HTTP connection (spec.md §4.4). `local` is the
    /// already-accepted TCP connection; `initial_request` is the bytes the
    /// HTTP edge already read off it (the request line and headers) so they
    /// can be replayed onto the reverse-stream.
    pub async fn handle_http_connection(
        &self,
        ctx: &CancellationToken,
        key_id: &str,
        local: &mut TcpStream,
        client_ip: String,
        initial_request: &[u8],
    ) -> TunnelResult<()> {
        let req = self.request_connection(&self.http_registry, ctx, key_id).await?;

        let mut stream = match req.wait_conn(ctx).await {
            Ok(s) => s,
            Err(_) => {
                self.http_registry.cancel_request(req.id()).await;
                return Err(TunnelError::FailedToConnect(
                    "timed out waiting for client".into(),
                ));
            }
        };

        let meta = ClientConnMeta { ip: client_ip };
        let meta_frame = frame_encode(&meta)?;
        if let Err(e) = stream.write_all(&meta_frame).await {
            return Err(TunnelError::FailedToConnect(e.to_string()));
        }
        if let Err(e) = stream.write_all(initial_request).await {
            return Err(TunnelError::FailedToConnect(e.to_string()));
        }

        let mut guarded = CtxBoundStream::new(&mut *local, ctx.clone());
        pipe::run(&mut guarded, stream, req.parent_context().clone()).await;
        Ok(())
    }

    /// Service one end-user TCP connection (spec.md §4.4). No initial
    /// buffer and no client-meta header — TCP mode forwards raw bytes.
    pub async fn handle_tcp_connection(
        &self,
        ctx: &CancellationToken,
        key_id: &str,
        mut local: TcpStream,
    ) -> TunnelResult<()> {
        let req = self.request_connection(&self.tcp_registry, ctx, key_id).await?;

        let stream = match req.wait_conn(ctx).await {
            Ok(s) => s,
            Err(_) => {
                self.tcp_registry.cancel_request(req.id()).await;
                return Err(TunnelError::FailedToConnect(
                    "timed out waiting for client".into(),
                ));
            }
        };

        let mut guarded = CtxBoundStream::new(&mut local, ctx.clone());
        pipe::run(&mut guarded, stream, req.parent_context().clone()).await;
        Ok(())
    }

    async fn request_connection(
        &self,
        registry: &ConnectionManager,
        ctx: &CancellationToken,
        key_id: &str,
    ) -> TunnelResult<Arc<crate::request::Request>> {
        match registry.request_connection(key_id, ctx).await {
            Ok(req) => Ok(req),
            Err(TunnelError::KeyIdNotFound(_)) => {
                if self.credentials.key_exists(key_id).await {
                    Err(TunnelError::FailedToConnect("no client online for keyID".into()))
                } else {
                    Err(TunnelError::KeyIdNotFound(key_id.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use mip_core::{frame_encode, read_frame};
    use std::time::Duration as StdDuration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn new_service() -> Arc<TunnelService> {
        let credentials: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
        let http_registry = Arc::new(ConnectionManager::new());
        let tcp_registry = Arc::new(ConnectionManager::new());
        let pool = Arc::new(crate::portpool::PortPool::new(31000, 31010));
        let tcp_registry_for_handler = tcp_registry.clone();
        let root = CancellationToken::new();
        let root_for_handler = root.clone();
        let tcp_edge = Arc::new(TcpEdgeServer::new(
            "127.0.0.1".into(),
            pool,
            Arc::new(move |key_id: String, stream: TcpStream, _addr: String| {
                let tcp_registry = tcp_registry_for_handler.clone();
                let root = root_for_handler.clone();
                Box::pin(async move {
                    let ctx = root.child_token();
                    if let Ok(req) = tcp_registry.request_connection(&key_id, &ctx).await {
                        if let Ok(remote) = req.wait_conn(&ctx).await {
                            let mut local = stream;
                            let mut guarded = CtxBoundStream::new(&mut local, ctx.clone());
                            pipe::run(&mut guarded, remote, req.parent_context().clone()).await;
                        }
                    }
                })
            }),
        ));

        Arc::new(TunnelService::new(
            credentials,
            http_registry,
            tcp_registry,
            tcp_edge,
            "tunnel.example.com".into(),
            root,
        ))
    }

    #[tokio::test]
    async fn issue_token_then_duplicate_is_rejected() {
        let service = new_service();
        service
            .issue_token("alpha", CredentialKind::Http, StdDuration::from_secs(60))
            .await
            .unwrap();
        let err = service
            .issue_token("alpha", CredentialKind::Http, StdDuration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateTokenId(_)));
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let service = new_service();
        service.revoke_token("ghost").await.unwrap();
        service
            .issue_token("alpha", CredentialKind::Http, StdDuration::from_secs(60))
            .await
            .unwrap();
        service.revoke_token("alpha").await.unwrap();
        service.revoke_token("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn issue_token_rejects_bad_key_id() {
        let service = new_service();
        let err = service
            .issue_token("UPPER", CredentialKind::Http, StdDuration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidToken(_)));
    }

    /// Full round trip over real sockets: a simulated client registers over
    /// the reverse listener, the service asks it to dial back for an HTTP
    /// request, the client Binds a second connection, and bytes flow both
    /// ways through the pipe.
    #[tokio::test]
    async fn http_connection_round_trips_through_a_bound_stream() {
        let service = new_service();
        let secret = service
            .issue_token("alpha", CredentialKind::Http, StdDuration::from_secs(60))
            .await
            .unwrap();

        let reverse_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reverse_addr = reverse_listener.local_addr().unwrap();
        let accept_service = service.clone();
        tokio::spawn(async move {
            loop {
                let (stream, addr) = reverse_listener.accept().await.unwrap();
                let svc = accept_service.clone();
                tokio::spawn(svc.handle_reverse_conn(stream, addr));
            }
        });

        // Simulated client: register, then service any Connect by dialing
        // back and Binding the request-id.
        tokio::spawn(async move {
            let mut control = TcpStream::connect(reverse_addr).await.unwrap();
            let hello = frame_encode(&ControlFrame::Hello {
                key_id: "alpha".into(),
                secret,
                multiplex: false,
            })
            .unwrap();
            control.write_all(&hello).await.unwrap();
            let _auth_ok: ControlFrame = read_frame(&mut control).await.unwrap().unwrap();
            let registered: ControlFrame = read_frame(&mut control).await.unwrap().unwrap();
            assert!(matches!(registered, ControlFrame::Registered));
            let url_update: ControlFrame = read_frame(&mut control).await.unwrap().unwrap();
            assert!(matches!(url_update, ControlFrame::UrlUpdate { .. }));

            loop {
                match read_frame::<_, ControlFrame>(&mut control).await {
                    Ok(Some(ControlFrame::Ping)) => {
                        mip_core::write_frame(&mut control, &ControlFrame::Pong)
                            .await
                            .unwrap();
                    }
                    Ok(Some(ControlFrame::Connect { request_id })) => {
                        let mut bound = TcpStream::connect(reverse_addr).await.unwrap();
                        let bind = frame_encode(&ControlFrame::Bind { request_id }).unwrap();
                        bound.write_all(&bind).await.unwrap();

                        let mut received = vec![0u8; 4096];
                        let n = bound.read(&mut received).await.unwrap();
                        assert!(n > 0, "expected forwarded request bytes");
                        bound.write_all(b"HTTP/1.1 200 OK\r\n\r\nhi").await.unwrap();
                        bound.shutdown().await.unwrap();
                    }
                    _ => break,
                }
            }
        });

        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();
        let mut end_user = TcpStream::connect(local_addr).await.unwrap();
        let (mut local, _) = local_listener.accept().await.unwrap();

        let ctx = CancellationToken::new();
        let handle = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .handle_http_connection(
                        &ctx,
                        "alpha",
                        &mut local,
                        "198.51.100.7".into(),
                        b"GET / HTTP/1.1\r\nHost: alpha.tunnel.example.com\r\n\r\n",
                    )
                    .await
            })
        };

        let mut response = Vec::new();
        end_user.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\nhi");

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http_connection_against_unknown_key_id_is_not_found() {
        let service = new_service();
        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();
        let _end_user = TcpStream::connect(local_addr).await.unwrap();
        let (mut local, _) = local_listener.accept().await.unwrap();

        let ctx = CancellationToken::new();
        let err = service
            .handle_http_connection(&ctx, "ghost", &mut local, "127.0.0.1".into(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::KeyIdNotFound(_)));
    }
}
