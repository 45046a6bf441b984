//! Positional file I/O helpers
//!
//! The downloader writes segments at computed offsets in any completion
//! order; the uploader reads exact segment ranges back out. Both go
//! through `spawn_blocking` so the positional syscalls never stall the
//! runtime.

use std::fs::File;
use std::io;
use std::sync::Arc;

/// Write the whole buffer at `offset`, without moving any cursor
pub fn write_all_at_sync(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0usize;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            written += n;
        }
        Ok(())
    }
}

/// Read exactly `len` bytes at `offset`
pub fn read_exact_at_sync(file: &File, len: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(&mut buf, offset)?;
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            read += n;
        }
    }
    Ok(buf)
}

/// Async positional write via the blocking pool
pub async fn write_all_at(file: &Arc<File>, buf: Vec<u8>, offset: u64) -> io::Result<()> {
    let file = Arc::clone(file);
    tokio::task::spawn_blocking(move || write_all_at_sync(&file, &buf, offset))
        .await
        .map_err(io::Error::other)?
}

/// Async positional read via the blocking pool
pub async fn read_exact_at(file: &Arc<File>, len: usize, offset: u64) -> io::Result<Vec<u8>> {
    let file = Arc::clone(file);
    tokio::task::spawn_blocking(move || read_exact_at_sync(&file, len, offset))
        .await
        .map_err(io::Error::other)?
}
