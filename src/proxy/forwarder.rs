//! Data forwarding module
//!
//! This module copies bytes from one half of a stream to another.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::BufferPool;

/// Copy from `reader` to `writer` until EOF using a pooled buffer
///
/// # Returns
///
/// Returns the number of bytes copied. The writer is not shut down.
pub async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W, pool: &BufferPool) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    copy_counted(reader, writer, pool, &AtomicU64::new(0)).await
}

/// Like [`copy_buffered`], adding every flushed chunk to `progress` so
/// another task can tell whether the copy is still moving
pub async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    pool: &BufferPool,
    progress: &AtomicU64,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = pool.get();
    let mut total_bytes = 0u64;

    loop {
        let n = reader.read(&mut buffer[..]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        total_bytes += n as u64;
        progress.fetch_add(n as u64, Ordering::Relaxed);
    }

    debug!("Copied {} bytes total", total_bytes);
    Ok(total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_until_eof() {
        let pool = BufferPool::new(1, 4);
        let mut reader: &[u8] = b"hello, relay";
        let mut writer = Vec::new();

        let copied = copy_buffered(&mut reader, &mut writer, &pool).await.unwrap();
        assert_eq!(copied, 12);
        assert_eq!(writer, b"hello, relay");
        // Buffer went back to the pool
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_copy_counted_reports_progress() {
        let pool = BufferPool::new(1, 4);
        let progress = AtomicU64::new(3);
        let mut reader: &[u8] = b"0123456789";
        let mut writer = Vec::new();

        let copied = copy_counted(&mut reader, &mut writer, &pool, &progress).await.unwrap();
        assert_eq!(copied, 10);
        assert_eq!(progress.load(Ordering::Relaxed), 13);
    }
}
