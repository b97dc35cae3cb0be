//! Stream socket listeners (`tcp://` and `unix://`).
//!
//! Each accepted connection is read by its own task until the peer closes
//! it. A stop request closes the listener; open connections keep being read
//! until their peers hang up. One-shot mode accepts a single connection.

use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{LineDecoder, StreamContext, StreamError, Wake, READ_BUFFER_SIZE};

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

pub async fn bind_tcp(address: &str) -> Result<Listener, StreamError> {
    TcpListener::bind(address)
        .await
        .map(Listener::Tcp)
        .map_err(|source| StreamError::Bind {
            address: address.to_string(),
            source,
        })
}

pub fn bind_unix(path: &str) -> Result<Listener, StreamError> {
    UnixListener::bind(path)
        .map(|l| Listener::Unix(l, PathBuf::from(path)))
        .map_err(|source| StreamError::Bind {
            address: path.to_string(),
            source,
        })
}

impl Listener {
    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> Option<String> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.to_string()),
            Listener::Unix(_, path) => Some(path.display().to_string()),
        }
    }
}

async fn read_conn<S>(ctx: StreamContext, mut conn: S, peer: String)
where
    S: AsyncRead + Unpin,
{
    debug!("{}: connection from {}", ctx.source(), peer);
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match tokio::time::timeout(ctx.read_timeout, conn.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if !ctx.send_buffer(&mut decoder, &buf[..n]).await {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                ctx.read_error(&e);
                break;
            }
            Err(_) => {}
        }
        if ctx.one_shot || ctx.state.stop_requested() {
            // Keep reading until the peer closes.
            if ctx.cancel.is_cancelled() {
                break;
            }
            continue;
        }
        match ctx.wait().await {
            Wake::Read | Wake::Stop => {}
            Wake::Cancel => break,
        }
    }
    ctx.flush(&mut decoder).await;
    debug!("{}: connection from {} closed", ctx.source(), peer);
}

pub fn spawn(ctx: StreamContext, listener: Listener) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Listening for log lines on {}", ctx.source());
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ctx.state.stop.cancelled() => break,
                accepted = accept(&listener) => match accepted {
                    Ok(Accepted::Tcp(stream, peer)) => {
                        conns.spawn(read_conn(ctx.clone(), stream, peer));
                    }
                    Ok(Accepted::Unix(stream)) => {
                        conns.spawn(read_conn(ctx.clone(), stream, "unix peer".to_string()));
                    }
                    Err(e) => {
                        ctx.read_error(&e);
                        break;
                    }
                },
            }
            if ctx.one_shot {
                debug!("{}: one-shot mode, not accepting more connections", ctx.source());
                break;
            }
        }

        if let Listener::Unix(_, path) = &listener {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
        drop(listener);

        while let Some(res) = conns.join_next().await {
            if let Err(e) = res {
                warn!("{}: connection task failed: {}", ctx.source(), e);
            }
        }
        ctx.complete().await;
    })
}

enum Accepted {
    Tcp(tokio::net::TcpStream, String),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> std::io::Result<Accepted> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, peer) = l.accept().await?;
            Ok(Accepted::Tcp(stream, peer.to_string()))
        }
        Listener::Unix(l, _) => {
            let (stream, _) = l.accept().await?;
            Ok(Accepted::Unix(stream))
        }
    }
}
