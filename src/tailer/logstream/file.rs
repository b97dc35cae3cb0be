//! Regular file streams.
//!
//! A file stream follows one open descriptor. At EOF it compares the
//! descriptor with whatever is now at its path:
//!
//! * same inode, smaller than our offset: truncated, read again from 0;
//! * different inode or missing: rotated or deleted, so finish and complete,
//!   leaving the new file to the next discovery pass;
//! * otherwise wait for the next read cycle.
//!
//! A stream stopped while its file is still in place records how far it
//! read, so a later stream on the same inode resumes instead of rereading.

use std::io::{Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    FilePosition, LineDecoder, StartPosition, StreamContext, StreamError, Wake, READ_BUFFER_SIZE,
};

/// A file opened by the discovery pass, positioned for its first read.
#[derive(Debug)]
pub struct OpenFile {
    pub path: PathBuf,
    file: std::fs::File,
    dev: u64,
    ino: u64,
    offset: u64,
}

/// Opens `path` synchronously so that a start at EOF is fixed before any
/// later write.
pub fn open(path: &Path, start: StartPosition) -> Result<OpenFile, StreamError> {
    let err = |source| StreamError::Open {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(err)?;
    let meta = file.metadata().map_err(err)?;
    let offset = match start {
        StartPosition::Beginning => 0,
        StartPosition::End => file.seek(SeekFrom::End(0)).map_err(err)?,
        StartPosition::At(offset) => file.seek(SeekFrom::Start(offset)).map_err(err)?,
    };
    Ok(OpenFile {
        path: path.to_path_buf(),
        file,
        dev: meta.dev(),
        ino: meta.ino(),
        offset,
    })
}

enum PathState {
    Same,
    Replaced,
    Gone,
}

async fn path_state(path: &Path, dev: u64, ino: u64) -> PathState {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.dev() == dev && meta.ino() == ino => PathState::Same,
        Ok(_) => PathState::Replaced,
        Err(_) => PathState::Gone,
    }
}

pub fn spawn(ctx: StreamContext, open: OpenFile) -> JoinHandle<()> {
    tokio::spawn(async move {
        let OpenFile {
            path,
            file,
            dev,
            ino,
            mut offset,
        } = open;
        info!("Tailing {} from offset {}", path.display(), offset);
        let mut file = tokio::fs::File::from_std(file);
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    ctx.read_error(&e);
                    break;
                }
            };
            if n > 0 {
                offset += n as u64;
                if !ctx.send_buffer(&mut decoder, &buf[..n]).await {
                    break;
                }
                continue;
            }

            // EOF on our descriptor.
            let size = match file.metadata().await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    ctx.read_error(&e);
                    break;
                }
            };
            if size < offset {
                info!("{} truncated from {} to {} bytes, rereading", path.display(), offset, size);
                if let Err(e) = file.seek(std::io::SeekFrom::Start(0)).await {
                    ctx.read_error(&e);
                    break;
                }
                offset = 0;
                decoder.clear();
                continue;
            }
            match path_state(&path, dev, ino).await {
                PathState::Same => {}
                PathState::Replaced => {
                    info!("{} was rotated, closing drained descriptor", path.display());
                    break;
                }
                PathState::Gone => {
                    info!("{} was removed, closing", path.display());
                    break;
                }
            }
            if ctx.one_shot {
                debug!("{}: one-shot read reached EOF", path.display());
                break;
            }

            match ctx.wait().await {
                Wake::Read => {}
                Wake::Stop => {
                    // Pick up anything written since the last read, then stop.
                    while let Ok(n) = file.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        offset += n as u64;
                        if !ctx.send_buffer(&mut decoder, &buf[..n]).await {
                            break;
                        }
                    }
                    if let PathState::Same = path_state(&path, dev, ino).await {
                        ctx.state.set_resume_position(FilePosition { dev, ino, offset });
                    }
                    break;
                }
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
