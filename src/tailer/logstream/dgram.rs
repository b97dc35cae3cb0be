//! Datagram sockets (`udp://` and `unixgram://`).
//!
//! Every datagram ends whatever line it carries; nothing is buffered across
//! datagrams.

use std::path::PathBuf;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LineDecoder, StreamContext, StreamError, READ_BUFFER_SIZE};

#[derive(Debug)]
pub enum DgramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram, PathBuf),
}

pub async fn bind_udp(address: &str) -> Result<DgramSocket, StreamError> {
    UdpSocket::bind(address)
        .await
        .map(DgramSocket::Udp)
        .map_err(|source| StreamError::Bind {
            address: address.to_string(),
            source,
        })
}

pub fn bind_unix(path: &str) -> Result<DgramSocket, StreamError> {
    UnixDatagram::bind(path)
        .map(|s| DgramSocket::Unix(s, PathBuf::from(path)))
        .map_err(|source| StreamError::Bind {
            address: path.to_string(),
            source,
        })
}

impl DgramSocket {
    pub fn local_addr(&self) -> Option<String> {
        match self {
            DgramSocket::Udp(s) => s.local_addr().ok().map(|a| a.to_string()),
            DgramSocket::Unix(_, path) => Some(path.display().to_string()),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DgramSocket::Udp(s) => s.recv(buf).await,
            DgramSocket::Unix(s, _) => s.recv(buf).await,
        }
    }
}

pub fn spawn(ctx: StreamContext, socket: DgramSocket) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Receiving log datagrams on {}", ctx.source());
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ctx.state.stop.cancelled() => break,
                received = socket.recv(&mut buf) => match received {
                    Ok(n) => {
                        if !ctx.send_buffer(&mut decoder, &buf[..n]).await {
                            break;
                        }
                        ctx.flush(&mut decoder).await;
                        if ctx.one_shot {
                            debug!("{}: one-shot mode, finishing after first datagram", ctx.source());
                            break;
                        }
                    }
                    Err(e) => {
                        ctx.read_error(&e);
                        break;
                    }
                },
            }
        }

        if let DgramSocket::Unix(_, path) = &socket {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
        ctx.complete().await;
    })
}
