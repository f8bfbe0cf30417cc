//! The byte-pipe pair: two half-duplex copiers moving bytes between an
//! end-user connection and a reverse-stream, with half-close ordering and a
//! third task that closes the reverse-stream to unblock a pending read once
//! either side gives up (spec.md §4.7).

use crate::close_notify::CloseNotifier;
use mip_core::{ReverseStream, TunnelResult};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run the pipe pair between `local` (the end-user connection, a plain
/// tokio I/O type) and `remote` (the reverse-stream). Returns once both
/// directions have finished.
///
/// `remote`'s methods take `&mut self`, so the two directions share it
/// behind a mutex rather than splitting it the way `tokio::io::split` splits
/// a `TcpStream` — `ReverseStream` makes no promise that a yamux substream
/// or similar is safe to read and write from two tasks without
/// synchronization.
///
/// `parent` is the request's parent context (spec.md §4.7's "request's
/// parent context"); when it ends, the reverse-stream is closed to unblock
/// whichever direction is still reading.
///
/// `local` is taken by mutable reference rather than by value: callers in
/// the HTTP/TCP edges still hold the end-user connection after a failed
/// handshake and need it back to write an error response, so ownership
/// never has to pass through the pipe just to run one.
pub async fn run<L>(local: &mut L, remote: Box<dyn ReverseStream>, parent: CancellationToken)
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    let notifier = CloseNotifier::new(remote);
    let remote_closed = notifier.closed();
    let remote = Arc::new(Mutex::new(notifier));

    let (mut local_read, mut local_write) = tokio::io::split(local);

    // src -> dst: end-user bytes into the reverse-stream. CloseWrite on the
    // reverse side is always attempted before this direction reports
    // success, so the client sees EOF and can start responding. Unlike
    // dst->src, this leg finishing must NOT end the pipe (spec.md §4.7: only
    // dst->src "terminates the whole group when it finishes") — the upstream
    // still needs to send its response back down the still-open read side.
    // So after logging, it parks forever rather than resolving, which keeps
    // it running (driven by the `select!` below) without ever winning the
    // race.
    let to_remote = {
        let remote = remote.clone();
        async move {
            let result = copy_to_remote(&mut local_read, &remote).await;
            let _ = remote.lock().await.close_write().await;
            if let Err(e) = &result {
                warn!(error = %e, "end-user -> reverse-stream copy failed");
            } else {
                debug!("end-user -> reverse-stream copy finished");
            }
            std::future::pending::<()>().await;
        }
    };

    // dst -> src: reverse-stream bytes back to the end-user. Finishing here
    // ends the whole pipe (spec.md §4.7: this is the leg whose completion
    // "terminates the whole group").
    let from_remote = {
        let remote = remote.clone();
        async move {
            let result = copy_from_remote(&remote, &mut local_write).await;
            if let Err(e) = &result {
                warn!(error = %e, "reverse-stream -> end-user copy failed");
            } else {
                debug!("reverse-stream -> end-user copy finished");
            }
            let _ = local_write.shutdown().await;
        }
    };

    let closer = async {
        tokio::select! {
            _ = parent.cancelled() => {}
            _ = remote_closed.cancelled() => {}
        }
    };

    // `to_remote` is polled here so it keeps making progress, but it never
    // parks-forever's way out of this `select!` — only `closer` and
    // `from_remote` can end the pipe.
    tokio::select! {
        _ = closer => {}
        _ = to_remote => {}
        _ = from_remote => {}
    }

    // Whichever leg finished first, make sure the other leg's blocking read
    // is released promptly rather than waiting on the parent context.
    let _ = remote.lock().await.close().await;
}

async fn copy_to_remote<R>(local_read: &mut R, remote: &Arc<Mutex<CloseNotifier>>) -> TunnelResult<()>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match local_read.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if is_reset(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        remote.lock().await.write_all(&buf[..n]).await?;
    }
}

async fn copy_from_remote<W>(remote: &Arc<Mutex<CloseNotifier>>, local_write: &mut W) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = remote.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        local_write.write_all(&buf[..n]).await?;
    }
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use tokio::io::duplex;

    struct EchoStream {
        data: Vec<u8>,
        pos: usize,
        written: Vec<u8>,
    }

    impl ReverseStream for EchoStream {
        fn read<'a>(
            &'a mut self,
            buf: &'a mut [u8],
        ) -> Pin<Box<dyn Future<Output = TunnelResult<usize>> + Send + 'a>> {
            Box::pin(async move {
                let remaining = &self.data[self.pos..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.pos += n;
                Ok(n)
            })
        }
        fn write_all<'a>(
            &'a mut self,
            data: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async move {
                self.written.extend_from_slice(data);
                Ok(())
            })
        }
        fn close_write<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
        fn close<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = TunnelResult<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn pipes_bytes_both_directions() {
        let (mut client, mut server) = duplex(64);
        let remote = Box::new(EchoStream {
            data: b"from-remote".to_vec(),
            pos: 0,
            written: Vec::new(),
        });
        let parent = CancellationToken::new();

        let handle = tokio::spawn(async move {
            run(&mut server, remote, parent).await;
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"from-client").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"from-remote");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn parent_cancellation_tears_down_pipe() {
        let (_client, mut server) = duplex(64);
        let remote = Box::new(EchoStream {
            data: Vec::new(),
            pos: 0,
            written: Vec::new(),
        });
        let parent = CancellationToken::new();
        let parent2 = parent.clone();

        let handle = tokio::spawn(async move {
            run(&mut server, remote, parent2).await;
        });

        parent.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pipe should tear down promptly on parent cancellation")
            .unwrap();
    }
}
