//! Transparent byte pump between two established connections.
//!
//! Unlike `tokio::io::copy_bidirectional`, which waits for both directions
//! to finish, a tunnel pair must die together: as soon as either direction
//! reports end-of-stream or an I/O error, both connections are shut down so
//! the peer's blocked read unblocks promptly.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Copy bytes between `a` and `b` in both directions until either direction
/// terminates, then close both. Returns `(a_to_b, b_to_a)` byte counts at
/// the moment the pipe closed.
///
/// `idle_timeout` of zero means unbounded; otherwise it caps the lifetime of
/// the whole session, matching how the proxy side bounds upstream copies.
pub async fn run<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
    buffer_size: usize,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let buffer_size = if buffer_size == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        buffer_size
    };

    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let session = async {
        let forward = copy_half(&mut ar, &mut bw, buffer_size, &a_to_b);
        let backward = copy_half(&mut br, &mut aw, buffer_size, &b_to_a);
        tokio::pin!(forward);
        tokio::pin!(backward);
        tokio::select! {
            r = &mut forward => r,
            r = &mut backward => r,
        }
    };

    let res = if idle_timeout > Duration::ZERO {
        match tokio::time::timeout(idle_timeout, session).await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "pipe idle timeout")),
        }
    } else {
        session.await
    };

    // Joint close: the surviving direction's peer must unblock too.
    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;

    res.map(|_| (a_to_b.into_inner(), b_to_a.into_inner()))
}

async fn copy_half<R, W>(
    r: &mut R,
    w: &mut W,
    buffer_size: usize,
    copied: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}
