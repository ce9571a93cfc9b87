//! Shared fixture for the end-to-end suites: a pod volume in a tempdir, a
//! LocalFs "remote", and a recording policy stub.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use remote_storage::{GenericRemoteStorage, LocalFs, RemotePath, StorageMetadata};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use modelsync::catalog::{CatalogStore, ModelEntry};
use modelsync::config::SyncConf;
use modelsync::policy::{
    PolicyApi, PolicyError, ProgressNotification, SyncDecision, SyncPermissionRequest,
};
use modelsync::progress::ProgressStore;
use modelsync::queue::{DownloadJob, DownloadQueue, EnqueueOutcome};
use modelsync::registry::DestinationRegistry;
use modelsync::resolver::resolve_destination;

pub struct MockPolicy {
    pub decisions: Mutex<VecDeque<SyncDecision>>,
    pub permission_requests: Mutex<Vec<SyncPermissionRequest>>,
    pub notifications: Mutex<Vec<ProgressNotification>>,
}

impl MockPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            permission_requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn push_decision(&self, decision: SyncDecision) {
        self.decisions.lock().unwrap().push_back(decision);
    }

    pub fn notifications(&self) -> Vec<ProgressNotification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PolicyApi for MockPolicy {
    async fn sync_permission(
        &self,
        request: SyncPermissionRequest,
    ) -> Result<SyncDecision, PolicyError> {
        self.permission_requests.lock().unwrap().push(request);
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SyncDecision {
                can_sync: false,
                action: None,
                reason: Some("no decision configured".to_string()),
                existing_model: None,
            }))
    }

    async fn notify_progress(
        &self,
        notification: ProgressNotification,
    ) -> Result<(), PolicyError> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }
}

pub struct TestPod {
    pub dir: Utf8TempDir,
    pub conf: Arc<SyncConf>,
    pub storage: GenericRemoteStorage,
    pub policy: Arc<MockPolicy>,
}

impl TestPod {
    pub fn models_root(&self) -> Utf8PathBuf {
        self.conf.models_root.clone()
    }

    pub fn catalog(&self) -> CatalogStore {
        CatalogStore::new(&self.conf)
    }

    pub fn queue(&self) -> DownloadQueue {
        DownloadQueue::new(&self.conf)
    }

    pub fn progress(&self) -> ProgressStore {
        ProgressStore::new(&self.conf)
    }

    pub fn registry(&self) -> DestinationRegistry {
        DestinationRegistry::new(&self.conf)
    }

    /// Seed a catalog entry whose local path lives under the models root.
    pub fn seed_entry(&self, group: &str, model_name: &str, size: u64) -> ModelEntry {
        let entry = ModelEntry {
            group: group.to_string(),
            model_name: model_name.to_string(),
            original_remote_path: format!("models/{group}/{model_name}"),
            local_path: self.models_root().join(group).join(model_name),
            model_size: size,
            download_url: Some(format!("https://example.com/{group}/{model_name}")),
            uploaded_at: None,
            last_updated: None,
        };
        self.catalog().upsert(entry.clone()).unwrap();
        entry
    }

    pub fn enqueue_entry(&self, entry: &ModelEntry) -> EnqueueOutcome {
        let resolved = resolve_destination(&entry.local_path, &entry.original_remote_path);
        let job = DownloadJob {
            group: entry.group.clone(),
            model_name: entry.model_name.clone(),
            source_remote_path: entry.original_remote_path.clone(),
            local_path: entry.local_path.clone(),
            download_destination: resolved.destination,
            total_size: entry.model_size,
            queued_at: None,
        };
        self.queue()
            .enqueue(job, &self.registry(), &self.progress())
            .unwrap()
    }

    /// Place an object into the fake remote.
    pub async fn put_remote_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: Option<StorageMetadata>,
    ) {
        let cancel = CancellationToken::new();
        let len = bytes.len();
        self.storage
            .upload(
                ReaderStream::new(std::io::Cursor::new(bytes)),
                len,
                &RemotePath::from_string(key).unwrap(),
                metadata,
                &cancel,
            )
            .await
            .unwrap();
    }

    pub async fn remote_object(&self, key: &str) -> Option<Vec<u8>> {
        use futures::StreamExt;
        let cancel = CancellationToken::new();
        let mut download = self
            .storage
            .download(&RemotePath::from_string(key).unwrap(), &cancel)
            .await
            .ok()?;
        let mut bytes = Vec::new();
        while let Some(chunk) = download.download_stream.next().await {
            bytes.extend_from_slice(&chunk.ok()?);
        }
        Some(bytes)
    }
}

pub fn test_pod() -> TestPod {
    let dir = camino_tempfile::tempdir().unwrap();
    let mut conf = SyncConf::from_toml_str(&format!(
        r#"
volume_root = "{root}"
models_root = "{root}/ComfyUI/models"
bucket_name = "model-artifacts"
pod_id = "pod-test"
user_id = "user-test"
policy_base_url = "https://api.example.invalid"
"#,
        root = dir.path()
    ))
    .unwrap();
    // keep worker runs short in tests
    conf.max_empty_queue_checks = 1;

    conf.ensure_state_dirs().unwrap();
    std::fs::create_dir_all(conf.models_root.as_std_path()).unwrap();

    let storage = GenericRemoteStorage::LocalFs(
        LocalFs::new(dir.path().join("remote"), Duration::from_secs(10)).unwrap(),
    );

    TestPod {
        conf: Arc::new(conf),
        storage,
        policy: MockPolicy::new(),
        dir,
    }
}

/// A `.tar.zst` transport rendition of one file.
pub async fn tar_zst_of(name: &str, contents: &[u8]) -> Vec<u8> {
    use tokio::io::AsyncReadExt;

    let mut builder = tokio_tar::Builder::new(Vec::new());
    let mut header = tokio_tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).await.unwrap();
    let tar = builder.into_inner().await.unwrap();

    let mut encoder =
        async_compression::tokio::bufread::ZstdEncoder::new(std::io::Cursor::new(tar));
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await.unwrap();
    compressed
}
