use crate::handler::Connection;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relays bytes between `a` and `b` in both directions.
///
/// Each direction runs in its own task until its source reaches end of
/// stream, then shuts down the write side of its destination so the peer
/// sees EOF while the opposite direction keeps draining. Copy errors end
/// that direction only and are not reported.
pub fn splice<A, B>(a: A, b: B)
where
    A: Connection,
    B: Connection,
{
    let (a_read, a_write) = io::split(a);
    let (b_read, b_write) = io::split(b);
    tokio::spawn(forward(a_read, b_write, "a->b"));
    tokio::spawn(forward(b_read, a_write, "b->a"));
}

async fn forward<R, W>(mut src: R, mut dst: W, direction: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match io::copy(&mut src, &mut dst).await {
        Ok(n) => debug!(direction, bytes = n, "Splice direction finished"),
        Err(e) => debug!(direction, error = %e, "Splice direction failed"),
    }
    let _ = dst.shutdown().await;
}
