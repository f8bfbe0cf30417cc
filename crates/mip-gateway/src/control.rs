//! The control-channel wire protocol: the revdial-style handshake that
//! turns a freshly-accepted transport connection into either a
//! registered control-plane connection or a single data-plane (Bind)
//! stream (spec.md §4.3, §6).
//!
//! `ControlFrame`'s tagged-enum shape follows the teacher's
//! `wsh_core::messages` `MsgType`/`Envelope` pair (`messages.gen.rs`), minus
//! the numeric-tag codegen machinery — this protocol has no JS
//! counterpart to stay byte-compatible with, so a plain `#[serde(tag =
//! "type")]` enum carries the same information with less ceremony.
//!
//! The V2 multiplexed variant's 18-byte Bind frame is a fixed binary layout
//! rather than JSON, per spec.md §6: `[version: u8][cmd: u8][request-id:
//! 16 bytes]`.

use crate::credentials::{CredentialKind, CredentialStore};
use mip_core::{read_frame, write_frame, TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// The 5-second handshake deadline from spec.md §4.3 step 2.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keep-alive pings on a registered control connection
/// (spec.md §4.3: "every 200ms send a ping").
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);

/// Frames exchanged on the V1 (plain, unmultiplexed) control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Client -> server, the first frame on a fresh control-plane connection.
    /// `multiplex` opts into the V2 variant: once `Registered` is sent, this
    /// same transport is driven as a yamux connection instead of a plain
    /// duplex byte stream (spec.md §4.3's "newer V2 variant").
    Hello {
        key_id: String,
        secret: String,
        #[serde(default)]
        multiplex: bool,
    },
    /// Client -> server, the only frame on a fresh data-plane (Bind) connection.
    Bind { request_id: Uuid },
    /// Server -> client, handshake succeeded.
    AuthOk { connection_id: Uuid },
    /// Server -> client, handshake failed; the connection is closed after this.
    AuthFail { reason: String },
    /// Server -> client, the protocol object has reached the `Registered`
    /// state (spec.md §1's revdial-contract states). Carries no payload;
    /// the endpoint itself is delivered separately by `UrlUpdate`.
    Registered,
    /// Server -> client, the "URL-to-connect-updated" event (spec.md §4.3,
    /// §6): the public endpoint this keyID is now reachable at. Sent once,
    /// immediately after `Registered`, and again if the endpoint ever
    /// changes (e.g. TCP port reassignment after a restart).
    UrlUpdate { endpoint: String },
    /// Server -> client, asks it to dial back and Bind `request_id`.
    Connect { request_id: Uuid },
    Ping,
    Pong,
}

/// What a freshly-accepted connection turned out to be, once its first
/// frame was read (spec.md §4.3 step 3).
pub enum HandshakeOutcome {
    Registered {
        key_id: String,
        kind: CredentialKind,
        connection_id: Uuid,
        multiplex: bool,
    },
    Bound {
        request_id: Uuid,
    },
}

/// Run the handshake under a 5-second deadline: read the first frame, and
/// either authenticate it as a `Hello` (replying `AuthOk`/`AuthFail`) or
/// accept it as a `Bind` for the data plane. Any other frame as the first
/// message is a protocol violation.
pub async fn perform_handshake<S>(
    stream: &mut S,
    credentials: &dyn CredentialStore,
) -> TunnelResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame::<_, ControlFrame>(stream))
        .await
        .map_err(|_| TunnelError::Timeout)??;

    let frame = frame.ok_or_else(|| {
        TunnelError::ProtocolViolation("connection closed before handshake completed".into())
    })?;

    match frame {
        ControlFrame::Hello { key_id, secret, multiplex } => {
            match credentials.verify(&key_id, &secret).await {
                Ok(kind) => {
                    let connection_id = Uuid::new_v4();
                    write_frame(stream, &ControlFrame::AuthOk { connection_id }).await?;
                    Ok(HandshakeOutcome::Registered {
                        key_id,
                        kind,
                        connection_id,
                        multiplex,
                    })
                }
                Err(e) => {
                    let _ = write_frame(
                        stream,
                        &ControlFrame::AuthFail {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    Err(e)
                }
            }
        }
        ControlFrame::Bind { request_id } => Ok(HandshakeOutcome::Bound { request_id }),
        other => Err(TunnelError::ProtocolViolation(format!(
            "unexpected first frame: {other:?}"
        ))),
    }
}

// --- V2 multiplexed variant ---------------------------------------------

pub const V2_VERSION: u8 = 0x01;
pub const V2_CMD_BIND: u8 = 0x01;
pub const V2_RES_SUCCESS: u8 = 0x00;
pub const V2_BIND_FRAME_LEN: usize = 18;

/// Encode the fixed 18-byte Bind frame a V2 client sends on each freshly
/// accepted multiplexed substream.
pub fn encode_v2_bind(request_id: Uuid) -> [u8; V2_BIND_FRAME_LEN] {
    let mut frame = [0u8; V2_BIND_FRAME_LEN];
    frame[0] = V2_VERSION;
    frame[1] = V2_CMD_BIND;
    frame[2..].copy_from_slice(request_id.as_bytes());
    frame
}

/// Decode a V2 Bind frame. Returns `None` on any version/command mismatch;
/// per spec.md §4.3, such frames are closed silently rather than errored.
pub fn decode_v2_bind(frame: &[u8]) -> Option<Uuid> {
    if frame.len() != V2_BIND_FRAME_LEN {
        return None;
    }
    if frame[0] != V2_VERSION || frame[1] != V2_CMD_BIND {
        return None;
    }
    let bytes: [u8; 16] = frame[2..].try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

/// The two-byte `[version][result]` reply to a valid V2 Bind frame.
pub fn encode_v2_bind_ack() -> [u8; 2] {
    [V2_VERSION, V2_RES_SUCCESS]
}
