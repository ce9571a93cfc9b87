//! Local filesystem acting as a remote storage.
//! Multiple API users can use the same "storage" of this kind by using different storage roots.
//!
//! This storage used in tests, but can also be used in cases when a certain persistent
//! volume is mounted to the local FS.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::Stream;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use utils::crashsafe::path_with_suffix_extension;

use crate::{
    Download, DownloadError, Listing, ListingMode, ObjectSummary, RemotePath, RemoteStorage,
    StorageMetadata,
};

const LOCAL_FS_TEMP_FILE_SUFFIX: &str = "___temp";
const METADATA_SUFFIX: &str = "metadata";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
    timeout: Duration,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    /// Storage root will be created (if does not exist) and transformed into an absolute path (if passed as relative).
    pub fn new(mut storage_root: Utf8PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given path '{storage_root}'")
            })?;
        }
        if !storage_root.is_absolute() {
            storage_root = storage_root.canonicalize_utf8().with_context(|| {
                format!("Failed to represent path '{storage_root}' as an absolute path")
            })?;
        }

        Ok(Self {
            storage_root,
            timeout,
        })
    }

    fn resolve_in_storage(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.storage_root)
    }

    fn storage_metadata_path(file_path: &Utf8Path) -> Utf8PathBuf {
        path_with_suffix_extension(file_path, METADATA_SUFFIX)
    }

    async fn read_storage_metadata(
        &self,
        file_path: &Utf8Path,
    ) -> anyhow::Result<Option<StorageMetadata>> {
        let metadata_path = Self::storage_metadata_path(file_path);
        if metadata_path.exists() {
            let metadata_string = tokio::fs::read_to_string(&metadata_path)
                .await
                .with_context(|| format!("Failed to read metadata from the local storage at '{metadata_path}'"))?;

            serde_json::from_str(&metadata_string)
                .map(|metadata: HashMap<String, String>| Some(StorageMetadata(metadata)))
                .with_context(|| {
                    format!(
                        "Failed to deserialize metadata from the local storage at '{metadata_path}'",
                    )
                })
        } else {
            Ok(None)
        }
    }

    fn relative_key(&self, entry: &Utf8Path) -> Option<RemotePath> {
        let relative = entry.strip_prefix(&self.storage_root).ok()?;
        RemotePath::new(relative).ok()
    }

    fn is_hidden_entry(path: &Utf8Path) -> bool {
        let Some(name) = path.file_name() else {
            return true;
        };
        name.ends_with(LOCAL_FS_TEMP_FILE_SUFFIX) || name.ends_with(&format!(".{METADATA_SUFFIX}"))
    }

    /// Every regular file under the root, as relative keys, temp and metadata
    /// sidecar files excluded.
    async fn list_recursive(&self, folder: &Utf8Path) -> anyhow::Result<Vec<RemotePath>> {
        let mut keys = Vec::new();
        let mut directories = vec![folder.to_path_buf()];
        while let Some(dir) = directories.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("Failed to list directory {dir}")),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path: Utf8PathBuf = entry
                    .path()
                    .try_into()
                    .context("non-utf8 path in storage root")?;
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    directories.push(path);
                } else if !Self::is_hidden_entry(&path) {
                    if let Some(key) = self.relative_key(&path) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }
}

impl RemoteStorage for LocalFs {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        mode: ListingMode,
        max_keys: Option<NonZeroU32>,
        cancel: &CancellationToken,
    ) -> Result<Listing, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut result = Listing::default();

        let prefix_str = prefix.map(|p| p.get_path().as_str().to_string());
        let all_keys = self
            .list_recursive(&self.storage_root)
            .await
            .map_err(DownloadError::Other)?;

        let mut seen_prefixes = std::collections::BTreeSet::new();
        for key in all_keys {
            let key_str = key.get_path().as_str();
            let remainder = match &prefix_str {
                Some(prefix) => match key_str.strip_prefix(prefix.trim_end_matches('/')) {
                    // guard against "models" matching "modelsfoo/x"
                    Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                        rest.trim_start_matches('/')
                    }
                    _ => continue,
                },
                None => key_str,
            };

            match mode {
                ListingMode::NoDelimiter => result.keys.push(key),
                ListingMode::WithDelimiter => match remainder.split_once('/') {
                    Some((first_component, _)) => {
                        if seen_prefixes.insert(first_component.to_string()) {
                            let full = match &prefix_str {
                                Some(prefix) => format!(
                                    "{}/{first_component}",
                                    prefix.trim_end_matches('/')
                                ),
                                None => first_component.to_string(),
                            };
                            result.prefixes.push(
                                RemotePath::from_string(&full)
                                    .expect("constructed from relative keys"),
                            );
                        }
                    }
                    None => result.keys.push(key),
                },
            }

            if let Some(max) = max_keys {
                if result.keys.len() >= max.get() as usize {
                    break;
                }
            }
        }

        Ok(result)
    }

    async fn head(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<ObjectSummary, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let file_path = self.resolve_in_storage(path);
        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::NotFound)
            }
            Err(e) => return Err(DownloadError::Other(e.into())),
        };
        if !metadata.is_file() {
            return Err(DownloadError::NotFound);
        }
        let storage_metadata = self
            .read_storage_metadata(&file_path)
            .await
            .map_err(DownloadError::Other)?;
        Ok(ObjectSummary {
            size: metadata.len(),
            last_modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            metadata: storage_metadata,
        })
    }

    async fn upload(
        &self,
        data: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        data_size_bytes: usize,
        to: &RemotePath,
        metadata: Option<StorageMetadata>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let target_file_path = self.resolve_in_storage(to);
        if let Some(target_dir) = target_file_path.parent() {
            tokio::fs::create_dir_all(target_dir).await.with_context(|| {
                format!("Failed to create directories for target file '{target_file_path}'")
            })?;
        }

        // We need this dance with sort of durable rename (without fsyncs)
        // to prevent partial uploads. This chain crashes only when the
        // machine dies, and the pod volume survives the process.
        let temp_file_path =
            path_with_suffix_extension(&target_file_path, LOCAL_FS_TEMP_FILE_SUFFIX);
        let mut destination = tokio::io::BufWriter::new(
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_file_path)
                .await
                .with_context(|| {
                    format!("Failed to open target fs destination at '{target_file_path}'")
                })?,
        );

        let upload = async {
            let mut bytes_written: usize = 0;
            let mut data = std::pin::pin!(data);
            while let Some(chunk) = data.next().await {
                let chunk = chunk.context("failed to read upload source")?;
                bytes_written += chunk.len();
                destination
                    .write_all(&chunk)
                    .await
                    .context("failed to write to the local storage")?;
            }
            destination.flush().await.context("upload flush")?;
            anyhow::Ok(bytes_written)
        };

        let bytes_written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tokio::fs::remove_file(&temp_file_path).await;
                bail!("upload cancelled");
            }
            res = tokio::time::timeout(self.timeout, upload) => {
                match res {
                    Ok(res) => res?,
                    Err(_elapsed) => {
                        let _ = tokio::fs::remove_file(&temp_file_path).await;
                        bail!("upload timed out");
                    }
                }
            }
        };

        if bytes_written != data_size_bytes {
            let _ = tokio::fs::remove_file(&temp_file_path).await;
            bail!(
                "Provided stream has actual size {bytes_written} that is smaller than the given stream size {data_size_bytes}"
            );
        }

        tokio::fs::rename(&temp_file_path, &target_file_path)
            .await
            .with_context(|| {
                format!("Failed to rename temp file to the final location '{target_file_path}'")
            })?;

        if let Some(storage_metadata) = metadata {
            let storage_metadata_path = Self::storage_metadata_path(&target_file_path);
            tokio::fs::write(
                &storage_metadata_path,
                serde_json::to_string(&storage_metadata.0)
                    .context("Failed to serialize storage metadata as json")?,
            )
            .await
            .with_context(|| {
                format!("Failed to write metadata to the local storage at '{storage_metadata_path}'")
            })?;
        }

        Ok(())
    }

    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let target_path = self.resolve_in_storage(from);
        let file = match tokio::fs::File::open(&target_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::NotFound)
            }
            Err(e) => return Err(DownloadError::Other(e.into())),
        };
        let fs_metadata = file.metadata().await.map_err(|e| DownloadError::Other(e.into()))?;
        if fs_metadata.is_dir() {
            return Err(DownloadError::NotFound);
        }

        let metadata = self
            .read_storage_metadata(&target_path)
            .await
            .map_err(DownloadError::Other)?;

        Ok(Download {
            download_stream: Box::pin(ReaderStream::new(file)),
            last_modified: fs_metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            metadata,
        })
    }

    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            bail!("delete cancelled");
        }
        let file_path = self.resolve_in_storage(path);
        match tokio::fs::remove_file(&file_path).await {
            Ok(()) => {}
            // The file doesn't exist. This shouldn't yield an error to mirror S3's behaviour.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("delete of missing object {path}");
            }
            Err(e) => return Err(e).context(format!("Failed to delete file at '{file_path}'")),
        }
        let metadata_path = Self::storage_metadata_path(&file_path);
        match tokio::fs::remove_file(&metadata_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to delete metadata sidecar"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod fs_tests {
    use super::*;

    use camino_tempfile::tempdir;
    use std::io::Cursor;

    fn upload_stream(bytes: Vec<u8>) -> (impl Stream<Item = std::io::Result<Bytes>>, usize) {
        let len = bytes.len();
        (ReaderStream::new(Cursor::new(bytes)), len)
    }

    async fn read_and_check_metadata(
        storage: &LocalFs,
        remote_storage_path: &RemotePath,
        expected_metadata: Option<&StorageMetadata>,
    ) -> anyhow::Result<String> {
        let cancel = CancellationToken::new();
        let download = storage
            .download(remote_storage_path, &cancel)
            .await
            .map_err(|e| anyhow::anyhow!("Download failed: {e}"))?;
        anyhow::ensure!(
            download.metadata.as_ref() == expected_metadata,
            "Unexpected metadata returned for the downloaded file"
        );

        let mut contents = Vec::new();
        let mut stream = download.download_stream;
        while let Some(chunk) = stream.next().await {
            contents.extend_from_slice(&chunk?);
        }
        String::from_utf8(contents).map_err(anyhow::Error::new)
    }

    #[tokio::test]
    async fn upload_file_and_read_back() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        let target = RemotePath::from_string("models/checkpoints/sd.safetensors")?;
        let (stream, len) = upload_stream(b"remote blob".to_vec());
        storage.upload(stream, len, &target, None, &cancel).await?;

        let contents = read_and_check_metadata(&storage, &target, None).await?;
        assert_eq!(contents, "remote blob");

        let summary = storage.head(&target, &cancel).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(summary.size, len as u64);
        Ok(())
    }

    #[tokio::test]
    async fn upload_with_metadata_round_trips() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        let metadata = StorageMetadata::from([
            ("downloadUrl", "https://example.com/sd_v1"),
            ("uncompressed-size", "100"),
        ]);
        let target = RemotePath::from_string("models/checkpoints/sd.safetensors")?;
        let (stream, len) = upload_stream(b"compressed?".to_vec());
        storage
            .upload(stream, len, &target, Some(metadata.clone()), &cancel)
            .await?;

        let contents = read_and_check_metadata(&storage, &target, Some(&metadata)).await?;
        assert_eq!(contents, "compressed?");

        let summary = storage.head(&target, &cancel).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(
            summary.metadata.as_ref().and_then(|m| m.get("uncompressed-size")),
            Some("100")
        );
        Ok(())
    }

    #[tokio::test]
    async fn upload_with_wrong_size_fails() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        let target = RemotePath::from_string("models/loras/short.bin")?;
        let (stream, _real) = upload_stream(b"12345".to_vec());
        let err = storage
            .upload(stream, 42, &target, None, &cancel)
            .await
            .expect_err("upload with wrong size should fail");
        assert!(err.to_string().contains("smaller than the given stream size"));

        // the failed upload must not leave the target behind
        assert!(matches!(
            storage.head(&target, &cancel).await,
            Err(DownloadError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn head_of_missing_object_is_not_found() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        let missing = RemotePath::from_string("models/checkpoints/absent.safetensors")?;
        assert!(matches!(
            storage.head(&missing, &cancel).await,
            Err(DownloadError::NotFound)
        ));
        assert!(!storage.exists_for_tests(&missing, &cancel).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_modes() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        for key in [
            "models/checkpoints/a.safetensors",
            "models/checkpoints/b.safetensors",
            "models/loras/c.safetensors",
        ] {
            let (stream, len) = upload_stream(b"x".to_vec());
            storage
                .upload(stream, len, &RemotePath::from_string(key)?, None, &cancel)
                .await?;
        }

        let all = storage
            .list(None, ListingMode::NoDelimiter, None, &cancel)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(all.keys.len(), 3);

        let top = storage
            .list(
                Some(&RemotePath::from_string("models")?),
                ListingMode::WithDelimiter,
                None,
                &cancel,
            )
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut prefixes: Vec<_> = top.prefixes.iter().map(|p| p.to_string()).collect();
        prefixes.sort();
        assert_eq!(prefixes, vec!["models/checkpoints", "models/loras"]);
        assert!(top.keys.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let storage_root = tempdir()?;
        let storage = LocalFs::new(storage_root.path().to_path_buf(), Duration::from_secs(10))?;
        let cancel = CancellationToken::new();

        let target = RemotePath::from_string("models/checkpoints/tmp.bin")?;
        let (stream, len) = upload_stream(b"abc".to_vec());
        storage.upload(stream, len, &target, None, &cancel).await?;

        storage.delete(&target, &cancel).await?;
        storage.delete(&target, &cancel).await?;
        assert!(matches!(
            storage.head(&target, &cancel).await,
            Err(DownloadError::NotFound)
        ));
        Ok(())
    }

    impl LocalFs {
        /// `exists` lives on [`crate::GenericRemoteStorage`]; mirror it here for tests.
        async fn exists_for_tests(
            &self,
            path: &RemotePath,
            cancel: &CancellationToken,
        ) -> anyhow::Result<bool> {
            match self.head(path, cancel).await {
                Ok(_) => Ok(true),
                Err(DownloadError::NotFound) => Ok(false),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }
}
