//! Named pipe streams.
//!
//! The FIFO is opened read-write so the open never blocks waiting for a
//! writer and the stream does not see EOF each time a writer goes away.
//! Reads use the read deadline so a silent pipe still notices stop and
//! shutdown.

use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{LineDecoder, StreamContext, StreamError, Wake, READ_BUFFER_SIZE};

pub fn open(path: &Path) -> Result<pipe::Receiver, StreamError> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .map_err(|source| StreamError::Open {
            path: path.to_path_buf(),
            source,
        })
}

pub fn spawn(ctx: StreamContext, mut rx: pipe::Receiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reading named pipe {}", ctx.source());
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        'cycle: loop {
            // Drain whatever arrives before the deadline.
            loop {
                match tokio::time::timeout(ctx.read_timeout, rx.read(&mut buf)).await {
                    Ok(Ok(0)) => break 'cycle,
                    Ok(Ok(n)) => {
                        if !ctx.send_buffer(&mut decoder, &buf[..n]).await {
                            break 'cycle;
                        }
                    }
                    Ok(Err(e)) => {
                        ctx.read_error(&e);
                        break 'cycle;
                    }
                    Err(_) => break,
                }
            }
            if ctx.one_shot {
                debug!("{}: one-shot read timed out, finishing", ctx.source());
                break;
            }
            match ctx.wait().await {
                Wake::Read => {}
                Wake::Stop => break,
                Wake::Cancel => {
                    ctx.complete().await;
                    return;
                }
            }
        }

        ctx.flush(&mut decoder).await;
        ctx.complete().await;
    })
}
