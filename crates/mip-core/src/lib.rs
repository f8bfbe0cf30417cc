//! mip-core: shared protocol types for the make-it-public tunnel gateway.
//!
//! Transport-agnostic pieces used by both halves of the control protocol:
//! the error type, the length-prefixed JSON frame codec, and the
//! `ReverseStream` capability trait that lets the registries and the pipe
//! pair move a stream around without caring whether it came from a plain
//! TCP dial-back or a multiplexed yamux substream.

pub mod codec;
pub mod error;
pub mod transport;

pub use codec::{frame_encode, json_decode, read_frame, write_frame, FrameDecoder};
pub use error::{TunnelError, TunnelResult};
pub use transport::{BoxedReverseStream, IoReverseStream, ReverseStream};
