//! HTTP Edge: the public HTTP listener (spec.md §4 component table's
//! "HTTP Edge (collaborator boundary)"). Resolves a keyID from the
//! request's `Host` header, buffers the request line and headers, and
//! hands the connection to `TunnelService::handle_http_connection`.
//!
//! The accept-loop/`JoinSet` shape follows `tcp_edge.rs`'s accept loop,
//! which is itself grounded on `tor-dirserver`'s dispatch loop; header
//! parsing uses `httparse`, the same crate `tor-dirclient` in the example
//! pack uses to parse HTTP responses off the wire.

use std::sync::Arc;
use std::time::Duration;

use mip_core::TunnelError;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::TunnelService;

/// Requests larger than this (headers only — the body is streamed
/// through the pipe untouched) are rejected rather than grown without
/// bound.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// How long an end-user connection is given to finish sending its
/// request line and headers before the edge gives up on it.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind `listen_addr` and serve public HTTP traffic until `root` is
/// cancelled. Each accepted connection is parsed for its `Host` header,
/// routed to the keyID it names, and handed to `service`.
pub async fn run(listen_addr: &str, service: Arc<TunnelService>, root: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "http edge listening");

    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = service.clone();
                    let ctx = root.child_token();
                    handlers.spawn(async move {
                        if let Err(e) = serve_one(stream, peer.ip().to_string(), &service, &ctx).await {
                            debug!(peer = %peer, error = %e, "http edge connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "http edge accept failed, backing off");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        warn!(error = %e, "http edge handler task panicked");
                    }
                }
            }
        }
    }

    debug!(pending = handlers.len(), "http edge accept loop exiting, draining handlers");
    while handlers.join_next().await.is_some() {}
    Ok(())
}

async fn serve_one(
    mut stream: TcpStream,
    client_ip: String,
    service: &Arc<TunnelService>,
    ctx: &CancellationToken,
) -> Result<(), TunnelError> {
    let header_bytes = match read_headers(&mut stream).await {
        Ok(bytes) => bytes,
        Err(e) => {
            write_status(&mut stream, 400, "Bad Request").await;
            return Err(e);
        }
    };

    let key_id = match extract_key_id(&header_bytes, service.public_host()) {
        Some(id) => id,
        None => {
            write_status(&mut stream, 400, "Bad Request").await;
            return Err(TunnelError::ProtocolViolation("missing or malformed Host header".into()));
        }
    };

    let result = service
        .handle_http_connection(ctx, &key_id, &mut stream, client_ip, &header_bytes)
        .await;

    if let Err(e) = &result {
        let (code, reason) = match e {
            TunnelError::KeyIdNotFound(_) => (404, "Not Found"),
            TunnelError::FailedToConnect(_) => (502, "Bad Gateway"),
            _ => (502, "Bad Gateway"),
        };
        write_status(&mut stream, code, reason).await;
    }

    result
}

/// Read off the wire until a full HTTP request line + headers have
/// arrived (a blank line terminates them), returning exactly those
/// bytes. The body, if any, is left unread on the socket for the pipe
/// to forward untouched.
async fn read_headers(stream: &mut TcpStream) -> Result<Vec<u8>, TunnelError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let result = tokio::time::timeout(HEADER_READ_TIMEOUT, async {
        loop {
            if buf.len() > MAX_HEADER_BYTES {
                return Err(TunnelError::ProtocolViolation("request headers too large".into()));
            }

            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(&buf) {
                Ok(httparse::Status::Complete(len)) => return Ok(len),
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(TunnelError::ProtocolViolation(format!("malformed http request: {e}"))),
            }

            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TunnelError::ProtocolViolation("connection closed before headers completed".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .map_err(|_| TunnelError::Timeout)??;

    buf.truncate(result);
    Ok(buf)
}

/// Pull the keyID out of the `Host` header: the leading label of
/// `{keyID}.{public_host}` (spec.md §6: `{scheme}://{keyID}.{publicHost}`).
fn extract_key_id(header_bytes: &[u8], public_host: &str) -> Option<String> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(header_bytes).ok()?;

    let host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())?;

    // Strip a port suffix, if any, before matching the public host.
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{public_host}");
    let key_id = host.strip_suffix(&suffix)?;

    if key_id.is_empty() || !key_id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return None;
    }
    Some(key_id.to_string())
}

async fn write_status(stream: &mut TcpStream, code: u16, reason: &str) {
    use tokio::io::AsyncWriteExt;
    let body = format!("{code} {reason}\n");
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_key_id_from_subdomain() {
        let req = b"GET / HTTP/1.1\r\nHost: alpha.tunnel.example.com\r\n\r\n";
        assert_eq!(
            extract_key_id(req, "tunnel.example.com"),
            Some("alpha".to_string())
        );
    }

    #[test]
    fn strips_port_from_host_header() {
        let req = b"GET / HTTP/1.1\r\nHost: alpha.tunnel.example.com:8080\r\n\r\n";
        assert_eq!(
            extract_key_id(req, "tunnel.example.com"),
            Some("alpha".to_string())
        );
    }

    #[test]
    fn rejects_host_not_matching_public_host() {
        let req = b"GET / HTTP/1.1\r\nHost: evil.example.org\r\n\r\n";
        assert_eq!(extract_key_id(req, "tunnel.example.com"), None);
    }

    #[test]
    fn rejects_missing_host_header() {
        let req = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(extract_key_id(req, "tunnel.example.com"), None);
    }

    #[test]
    fn rejects_key_id_with_bad_alphabet() {
        let req = b"GET / HTTP/1.1\r\nHost: UPPER.tunnel.example.com\r\n\r\n";
        assert_eq!(extract_key_id(req, "tunnel.example.com"), None);
    }

    #[tokio::test]
    async fn read_headers_stops_at_blank_line_and_leaves_body_on_the_wire() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        tokio::spawn(async move {
            client
                .write_all(b"POST /hook HTTP/1.1\r\nHost: a.b.c\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        // read_headers expects a TcpStream; exercise the httparse parsing
        // logic directly instead, the way extract_key_id's tests do.
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let n = server.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        let mut req = httparse::Request::new(&mut headers);
        let status = req.parse(&buf).unwrap();
        let len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => panic!("expected complete headers in one read"),
        };
        assert_eq!(&buf[len..], b"hello");
    }
}
