//! `CloseNotifier`: wraps a bound reverse-stream with a one-shot "closed"
//! signal so a pipe half can tell the other half (and the registry) that the
//! underlying stream went away, without either side polling `read` just to
//! detect EOF (spec.md §4 component table).

use mip_core::{BoxedReverseStream, ReverseStream, TunnelResult};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub struct CloseNotifier {
    inner: BoxedReverseStream,
    closed: CancellationToken,
}

impl CloseNotifier {
    pub fn new(inner: BoxedReverseStream) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
        }
    }

    /// Fires once the stream has been closed through this wrapper.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl ReverseStream for CloseNotifier {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.inner.read(buf).await?;
            if n == 0 {
                self.closed.cancel();
            }
            Ok(n)
        })
    }

    fn write_all<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.inner.write_all(data).await;
            if result.is_err() {
                self.closed.cancel();
            }
            result
        })
    }

    fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        self.inner.close_write()
    }

    fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.inner.close().await;
            self.closed.cancel();
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoOnceThenEof {
        yielded: bool,
    }

    impl ReverseStream for EchoOnceThenEof {
        fn read<'a>(
            &'a mut self,
            buf: &'a mut [u8],
        ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
            Box::pin(async move {
                if self.yielded {
                    Ok(0)
                } else {
                    self.yielded = true;
                    buf[0] = b'x';
                    Ok(1)
                }
            })
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
    async fn fires_on_eof_read() {
        let mut notifier = CloseNotifier::new(Box::new(EchoOnceThenEof { yielded: false }));
        let closed = notifier.closed();
        let mut buf = [0u8; 8];

        assert_eq!(notifier.read(&mut buf).await.unwrap(), 1);
        assert!(!closed.is_cancelled());

        assert_eq!(notifier.read(&mut buf).await.unwrap(), 0);
        assert!(closed.is_cancelled());
        assert!(notifier.is_closed());
    }

    #[tokio::test]
    async fn fires_on_explicit_close() {
        let mut notifier = CloseNotifier::new(Box::new(EchoOnceThenEof { yielded: false }));
        let closed = notifier.closed();
        notifier.close().await.unwrap();
        assert!(closed.is_cancelled());
    }
}
