//! The reverse-stream capability trait.
//!
//! A reverse-stream is whatever byte-stream a client hands back to the
//! gateway in response to a `Connect` command: an ordinary `TcpStream` in
//! the non-multiplexed ("V1") control protocol, or a yamux substream in the
//! multiplexed ("V2") variant. Both need to be usable behind one `dyn`
//! object, and the substream case needs an explicit half-close that a plain
//! `AsyncWrite::shutdown` doesn't give us cleanly enough to reason about, so
//! the capability set is spelled out as its own trait rather than reused
//! from `tokio::io` directly.
//!
//! Modeled on the boxed-future `ByteStream` trait in the teacher crate this
//! was grounded on: object-safety is kept by returning boxed futures
//! instead of using `async fn` in the trait.

use crate::error::TunnelResult;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read / Write / Close / CloseWrite, the capability set spec.md §4.4 and §9
/// require of a reverse-stream.
pub trait ReverseStream: Send {
    /// Read up to `buf.len()` bytes. Returns the number of bytes read; 0 = EOF.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>>;

    /// Write the entire buffer.
    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;

    /// Half-close the write side: tell the peer no more data is coming,
    /// without tearing down the read side.
    fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;

    /// Close the stream entirely.
    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>>;
}

/// A boxed reverse-stream, the form the registries and pipe pair move around.
pub type BoxedReverseStream = Box<dyn ReverseStream>;

impl ReverseStream for TcpStream {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
        Box::pin(async move { Ok(AsyncReadExt::read(self, buf).await?) })
    }

    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move { Ok(AsyncWriteExt::write_all(self, data).await?) })
    }

    fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.shutdown().await?;
            Ok(())
        })
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.shutdown().await;
            Ok(())
        })
    }
}

/// Generic `ReverseStream` over any plain tokio `AsyncRead + AsyncWrite`
/// type. `TcpStream` gets its own direct `impl` above (the common case);
/// this wrapper covers everything else that satisfies the same capability
/// set without native half-close support of its own — a multiplexed yamux
/// substream, most notably (spec.md §9's "structural subtyping via
/// capabilities" note).
pub struct IoReverseStream<S>(pub S);

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ReverseStream for IoReverseStream<S> {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
        Box::pin(async move { Ok(AsyncReadExt::read(&mut self.0, buf).await?) })
    }

    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move { Ok(AsyncWriteExt::write_all(&mut self.0, data).await?) })
    }

    fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.0.shutdown().await?;
            Ok(())
        })
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.0.shutdown().await;
            Ok(())
        })
    }
}
