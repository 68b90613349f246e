//! Copier - bidirectional byte pump with paired cancellation
//!
//! Two independent halves relay `client -> upstream` and
//! `upstream -> client`. Each half reports into a two-slot completion
//! channel; the first completion wins and cancels a scoped token shared by
//! both halves, so the peer half unblocks promptly. EOF, connection reset
//! and i/o timeout are normal termination, not faults.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::Stream;
use crate::error::{is_benign_disconnect, Error, Result};

/// Buffer size for each relay direction (32KB)
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "src-to-dest"),
            Direction::Down => write!(f, "dest-to-src"),
        }
    }
}

struct Completion {
    direction: Direction,
    total: u64,
    error: Option<std::io::Error>,
}

/// Relay bytes between the client and upstream streams until either side
/// finishes. Returns `(uploaded, downloaded)` byte counts; only transport
/// faults that are not part of normal teardown surface as errors.
pub async fn pump(client: Stream, upstream: Stream, cancel: CancellationToken) -> Result<(u64, u64)> {
    let token = cancel.child_token();
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (tx, mut rx) = mpsc::channel::<Completion>(2);

    let up = tokio::spawn(copy_half(
        Direction::Up,
        client_read,
        upstream_write,
        token.clone(),
        tx.clone(),
    ));
    let down = tokio::spawn(copy_half(
        Direction::Down,
        upstream_read,
        client_write,
        token.clone(),
        tx,
    ));

    // First completion wins; cancelling the scoped token makes the peer
    // half return promptly.
    let first = match rx.recv().await {
        Some(completion) => completion,
        None => return Ok((0, 0)),
    };
    token.cancel();
    let second = rx.recv().await;

    let _ = up.await;
    let _ = down.await;

    let mut uploaded = 0;
    let mut downloaded = 0;
    let mut fault: Option<std::io::Error> = None;
    for completion in std::iter::once(first).chain(second) {
        match completion.direction {
            Direction::Up => uploaded = completion.total,
            Direction::Down => downloaded = completion.total,
        }
        if let Some(e) = completion.error {
            if is_benign_disconnect(&e) {
                debug!("copier: {} closed: {}", completion.direction, e);
            } else if fault.is_none() {
                fault = Some(e);
            }
        }
    }

    match fault {
        Some(e) => Err(Error::Copier(e)),
        None => Ok((uploaded, downloaded)),
    }
}

async fn copy_half<R, W>(
    direction: Direction,
    mut from: R,
    mut to: W,
    token: CancellationToken,
    tx: mpsc::Sender<Completion>,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;
    let mut error = None;

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            r = from.read(&mut buf) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            },
        };

        let write = tokio::select! {
            _ = token.cancelled() => break,
            r = async {
                to.write_all(&buf[..n]).await?;
                to.flush().await
            } => r,
        };
        if let Err(e) = write {
            error = Some(e);
            break;
        }

        total += n as u64;
    }

    let _ = to.shutdown().await;
    let _ = tx
        .send(Completion {
            direction,
            total,
            error,
        })
        .await;
}
