//! Transparent `.tar.zst` transport handling.
//!
//! Large artifacts may be stored remotely as a zstd-compressed tarball
//! sitting next to the canonical key. The probe adopts the sidecar when it
//! exists; extraction streams the transport bytes through the zstd decoder
//! and tar unpacker into a staging directory, so the uncompressed data
//! touches disk exactly once, then moves the single extracted file into
//! place atomically.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{bail, Context as _};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::Stream;
use pin_project_lite::pin_project;
use remote_storage::{DownloadError, GenericRemoteStorage, RemotePath};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use utils::crashsafe::path_with_suffix_extension;

pub const COMPRESSED_SUFFIX: &str = ".tar.zst";

/// Metadata key on the transport object recording the size of the file
/// inside the tarball; used to drive accurate progress totals.
pub const UNCOMPRESSED_SIZE_KEY: &str = "uncompressed-size";

/// A compressed transport object discovered next to the canonical key.
#[derive(Debug, Clone)]
pub struct CompressedVariant {
    pub remote_path: RemotePath,
    pub transport_size: u64,
    pub uncompressed_size: Option<u64>,
}

/// HEAD the `.tar.zst` sibling of `path`. `None` means the remote holds the
/// artifact uncompressed.
pub async fn probe(
    storage: &GenericRemoteStorage,
    path: &RemotePath,
    cancel: &CancellationToken,
) -> Result<Option<CompressedVariant>, DownloadError> {
    let sidecar = path.with_suffix(COMPRESSED_SUFFIX);
    match storage.head(&sidecar, cancel).await {
        Ok(summary) => {
            let uncompressed_size = summary
                .metadata
                .as_ref()
                .and_then(|m| m.get(UNCOMPRESSED_SIZE_KEY))
                .and_then(|v| v.parse().ok());
            debug!(
                "adopting compressed transport {sidecar} ({} bytes, uncompressed {:?})",
                summary.size, uncompressed_size
            );
            Ok(Some(CompressedVariant {
                remote_path: sidecar,
                transport_size: summary.size,
                uncompressed_size,
            }))
        }
        Err(DownloadError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

pin_project! {
    /// AsyncRead adapter counting the bytes handed to its consumer; the
    /// download progress sampler reads the counter from another task.
    pub struct CountingReader<R> {
        #[pin]
        inner: R,
        counter: Arc<AtomicU64>,
    }
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<R: AsyncRead> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = self.project();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            this.counter.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

/// Unpack a `.tar.zst` byte stream directly to `destination`.
///
/// The archive must contain exactly one regular file; anything else is a
/// transport bug. A size mismatch against `expected_size` is logged, not
/// fatal. `counter` observes decoded bytes as they pass into the unpacker.
/// Returns the extracted file's size.
pub async fn extract_streaming(
    transport: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
    destination: &Utf8Path,
    expected_size: Option<u64>,
    counter: Arc<AtomicU64>,
) -> anyhow::Result<u64> {
    let staging_dir = path_with_suffix_extension(destination, "extract");
    if staging_dir.exists() {
        tokio::fs::remove_dir_all(&staging_dir)
            .await
            .context("failed to clear stale staging directory")?;
    }
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .with_context(|| format!("failed to create staging directory {staging_dir}"))?;

    let unpack_result = unpack_into(transport, &staging_dir, counter).await;

    let result = match unpack_result {
        Ok(()) => match find_single_file(&staging_dir) {
            Ok(extracted) => {
                let size = std::fs::metadata(&extracted)
                    .with_context(|| format!("failed to stat extracted file {extracted}"))?
                    .len();
                if let Some(expected) = expected_size {
                    if expected != size {
                        warn!(
                            "extracted {destination}: size {size} does not match expected {expected}"
                        );
                    }
                }
                tokio::fs::rename(&extracted, destination)
                    .await
                    .with_context(|| format!("failed to move extracted file to {destination}"))?;
                Ok(size)
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    let _ = tokio::fs::remove_dir_all(&staging_dir).await;
    result
}

async fn unpack_into(
    transport: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
    staging_dir: &Utf8Path,
    counter: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let compressed = StreamReader::new(Box::pin(transport));
    let decoder = async_compression::tokio::bufread::ZstdDecoder::new(compressed);
    let counted = CountingReader::new(decoder, counter);
    let mut archive = tokio_tar::Archive::new(counted);
    archive
        .unpack(staging_dir)
        .await
        .context("failed to decompress transport archive")?;
    Ok(())
}

/// The single regular file inside the staging directory, however deep the
/// archive nested it.
fn find_single_file(staging_dir: &Utf8Path) -> anyhow::Result<Utf8PathBuf> {
    let mut files = Vec::new();
    let mut directories = vec![staging_dir.to_path_buf()];
    while let Some(dir) = directories.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path: Utf8PathBuf = entry
                .path()
                .try_into()
                .context("non-utf8 path in staging directory")?;
            if entry.file_type()?.is_dir() {
                directories.push(path);
            } else {
                files.push(path);
            }
        }
    }
    match files.as_slice() {
        [single] => Ok(single.clone()),
        [] => bail!("transport archive contained no files"),
        many => bail!("transport archive contained {} files, expected one", many.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio_util::io::ReaderStream;

    async fn tar_zst_of(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tokio_tar::Builder::new(Vec::new());
        let mut header = tokio_tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents)
            .await
            .unwrap();
        let tar = builder.into_inner().await.unwrap();

        let mut encoder =
            async_compression::tokio::bufread::ZstdEncoder::new(std::io::Cursor::new(tar));
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        compressed
    }

    #[tokio::test]
    async fn extracts_single_file_archive() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("sd.safetensors");
        let payload = vec![7u8; 1000];
        let compressed = tar_zst_of("sd.safetensors", &payload).await;

        let counter = Arc::new(AtomicU64::new(0));
        let size = extract_streaming(
            ReaderStream::new(std::io::Cursor::new(compressed)),
            &destination,
            Some(1000),
            counter.clone(),
        )
        .await
        .unwrap();

        assert_eq!(size, 1000);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        // tar framing means the counter moves at least the payload size
        assert!(counter.load(Ordering::Relaxed) >= 1000);
        // staging directory is gone
        assert!(!path_with_suffix_extension(&destination, "extract").exists());
    }

    #[tokio::test]
    async fn size_mismatch_is_not_fatal() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("x.bin");
        let compressed = tar_zst_of("x.bin", b"abcdef").await;

        let size = extract_streaming(
            ReaderStream::new(std::io::Cursor::new(compressed)),
            &destination,
            Some(999),
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();
        assert_eq!(size, 6);
        assert!(destination.exists());
    }

    #[tokio::test]
    async fn multi_file_archive_is_rejected() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("y.bin");

        let mut builder = tokio_tar::Builder::new(Vec::new());
        for name in ["a.bin", "b.bin"] {
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(1);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &b"z"[..]).await.unwrap();
        }
        let tar = builder.into_inner().await.unwrap();
        let mut encoder =
            async_compression::tokio::bufread::ZstdEncoder::new(std::io::Cursor::new(tar));
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();

        let err = extract_streaming(
            ReaderStream::new(std::io::Cursor::new(compressed)),
            &destination,
            None,
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("expected one"));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn corrupt_transport_cleans_up_staging() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("z.bin");

        let garbage = vec![0x13u8; 512];
        let err = extract_streaming(
            ReaderStream::new(std::io::Cursor::new(garbage)),
            &destination,
            None,
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("decompress"));
        assert!(!destination.exists());
        assert!(!path_with_suffix_extension(&destination, "extract").exists());
    }
}
