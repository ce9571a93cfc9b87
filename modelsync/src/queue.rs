//! The persistent download queue.
//!
//! A JSON array of jobs in FIFO order, serialized by the `queue` lock.
//! Deduplication happens by `downloadDestination`, not by model identity:
//! that is what lets N catalog entries share one physical download, with
//! symlinks fanned out at completion.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utils::crashsafe;
use utils::lock_file;

use crate::config::{SyncConf, QUEUE_LOCK_TTL};
use crate::progress::{DownloadStatus, ProgressRecord, ProgressStore};
use crate::registry::{DestinationRegistry, RegisteredConsumer};
use crate::ModelKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub group: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    /// Remote path to fetch; may carry an `s3://bucket/` prefix.
    #[serde(rename = "sourceRemotePath")]
    pub source_remote_path: String,
    /// The path the consumer expects the model at.
    #[serde(rename = "localPath")]
    pub local_path: Utf8PathBuf,
    /// The deduplicated physical path bytes are written to. May differ from
    /// `localPath`.
    #[serde(rename = "downloadDestination")]
    pub download_destination: Utf8PathBuf,
    #[serde(rename = "totalSize", default)]
    pub total_size: u64,
    #[serde(rename = "queuedAt", default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<String>,
}

impl DownloadJob {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.group.clone(), self.model_name.clone())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A queued job already targets this destination; the new consumer was
    /// registered against it instead.
    DuplicateDestination,
    /// A worker is actively downloading to this destination.
    AlreadyInProgress,
}

pub struct DownloadQueue {
    path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lock_timeout: Duration,
}

impl DownloadQueue {
    pub fn new(conf: &SyncConf) -> Self {
        Self {
            path: conf.queue_path(),
            lock_path: conf.lock_path("queue"),
            lock_timeout: QUEUE_LOCK_TTL,
        }
    }

    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut Vec<DownloadJob>) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let _guard = lock_file::acquire(&self.lock_path, self.lock_timeout, QUEUE_LOCK_TTL)
            .context("queue lock")?;
        let mut jobs: Vec<DownloadJob> = crashsafe::load_json_or_default(&self.path, Vec::new());
        let result = f(&mut jobs)?;
        crashsafe::overwrite_json(&self.path, &jobs).context("queue rewrite")?;
        Ok(result)
    }

    pub fn snapshot(&self) -> Vec<DownloadJob> {
        crashsafe::load_json_or_default(&self.path, Vec::new())
    }

    /// Append a job unless its destination is already covered.
    ///
    /// On success the job's consumer is registered with the destination
    /// registry and an initial `queued` progress record is written. On
    /// destination duplication, only the registration happens: the existing
    /// download will fan a symlink out to this consumer too.
    pub fn enqueue(
        &self,
        mut job: DownloadJob,
        registry: &DestinationRegistry,
        progress: &ProgressStore,
    ) -> anyhow::Result<EnqueueOutcome> {
        let key = job.key();
        let consumer = RegisteredConsumer {
            group: job.group.clone(),
            model_name: job.model_name.clone(),
            local_path: job.local_path.clone(),
        };

        if progress.destination_in_progress(&job.download_destination) {
            info!(
                "not enqueueing {key}: {} is being downloaded right now",
                job.download_destination
            );
            registry.register(&job.download_destination, consumer)?;
            return Ok(EnqueueOutcome::AlreadyInProgress);
        }

        let outcome = self.with_lock(|jobs| {
            if jobs
                .iter()
                .any(|j| j.download_destination == job.download_destination)
            {
                debug!(
                    "duplicate destination {} already queued",
                    job.download_destination
                );
                return Ok(EnqueueOutcome::DuplicateDestination);
            }
            job.queued_at = Some(crate::utc_now_string());
            jobs.push(job.clone());
            Ok(EnqueueOutcome::Enqueued)
        })?;

        // Register in all cases: either this job will complete the
        // destination, or the already-queued one will, and both must know
        // about every consumer.
        registry.register(&job.download_destination, consumer)?;

        if outcome == EnqueueOutcome::Enqueued {
            progress.update(
                &key,
                ProgressRecord {
                    total_size: job.total_size,
                    downloaded: 0,
                    status: DownloadStatus::Queued,
                    local_path: job.local_path.clone(),
                    download_destination: job.download_destination.clone(),
                    last_updated: None,
                },
            )?;
            info!("enqueued {key} -> {}", job.download_destination);
        }
        Ok(outcome)
    }

    /// Remove and return the head of the queue.
    pub fn pop_next(&self) -> anyhow::Result<Option<DownloadJob>> {
        self.with_lock(|jobs| {
            if jobs.is_empty() {
                Ok(None)
            } else {
                Ok(Some(jobs.remove(0)))
            }
        })
    }

    /// Excise any job with the given identity; returns how many were
    /// removed.
    pub fn remove(&self, group: &str, model_name: &str) -> anyhow::Result<usize> {
        self.with_lock(|jobs| {
            let before = jobs.len();
            jobs.retain(|j| !(j.group == group && j.model_name == model_name));
            Ok(before - jobs.len())
        })
    }

    pub fn find_by_local_path(&self, local_path: &Utf8Path) -> Option<DownloadJob> {
        self.snapshot()
            .into_iter()
            .find(|j| j.local_path == local_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conf(root: &Utf8Path) -> SyncConf {
        SyncConf::from_toml_str(&format!(
            r#"
volume_root = "{root}"
models_root = "{root}/models"
bucket_name = "b"
pod_id = "p"
user_id = "u"
policy_base_url = "https://api.example.com"
"#
        ))
        .unwrap()
    }

    fn job(group: &str, name: &str, local: &str, dest: &str) -> DownloadJob {
        DownloadJob {
            group: group.to_string(),
            model_name: name.to_string(),
            source_remote_path: format!("models/{group}/{name}"),
            local_path: Utf8PathBuf::from(local),
            download_destination: Utf8PathBuf::from(dest),
            total_size: 100,
            queued_at: None,
        }
    }

    struct Fixture {
        _dir: camino_tempfile::Utf8TempDir,
        queue: DownloadQueue,
        registry: DestinationRegistry,
        progress: ProgressStore,
    }

    fn fixture() -> Fixture {
        let dir = camino_tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        conf.ensure_state_dirs().unwrap();
        Fixture {
            queue: DownloadQueue::new(&conf),
            registry: DestinationRegistry::new(&conf),
            progress: ProgressStore::new(&conf),
            _dir: dir,
        }
    }

    #[test]
    fn enqueue_writes_progress_and_registration() {
        let f = fixture();
        let j = job(
            "checkpoints",
            "sd.safetensors",
            "/vol/models/checkpoints/sd.safetensors",
            "/vol/models/checkpoints/sd.safetensors",
        );

        let outcome = f.queue.enqueue(j.clone(), &f.registry, &f.progress).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        // exactly one progress record, status queued
        let record = f.progress.get(&j.key()).unwrap();
        assert_eq!(record.status, DownloadStatus::Queued);
        assert_eq!(record.total_size, 100);

        let consumers = f.registry.snapshot();
        assert_eq!(consumers.len(), 1);
        assert_eq!(
            consumers
                .get("/vol/models/checkpoints/sd.safetensors")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn duplicate_destination_is_rejected_but_registered() {
        let f = fixture();
        let first = job(
            "checkpoints",
            "sd.safetensors",
            "/vol/models/checkpoints/sd.safetensors",
            "/vol/models/checkpoints/sd.safetensors",
        );
        let second = job(
            "loras",
            "sd.safetensors",
            "/vol/models/loras/sd.safetensors",
            "/vol/models/checkpoints/sd.safetensors",
        );

        assert_eq!(
            f.queue.enqueue(first, &f.registry, &f.progress).unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            f.queue.enqueue(second, &f.registry, &f.progress).unwrap(),
            EnqueueOutcome::DuplicateDestination
        );

        // one queued job, two registered consumers
        assert_eq!(f.queue.snapshot().len(), 1);
        assert_eq!(
            f.registry
                .snapshot()
                .get("/vol/models/checkpoints/sd.safetensors")
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn in_progress_destination_refuses_enqueue() {
        let f = fixture();
        let j = job(
            "checkpoints",
            "big.safetensors",
            "/vol/models/checkpoints/big.safetensors",
            "/vol/models/checkpoints/big.safetensors",
        );
        f.progress
            .update(
                &j.key(),
                ProgressRecord {
                    total_size: 100,
                    downloaded: 10,
                    status: DownloadStatus::Progress,
                    local_path: j.local_path.clone(),
                    download_destination: j.download_destination.clone(),
                    last_updated: None,
                },
            )
            .unwrap();

        assert_eq!(
            f.queue.enqueue(j, &f.registry, &f.progress).unwrap(),
            EnqueueOutcome::AlreadyInProgress
        );
        assert!(f.queue.snapshot().is_empty());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let f = fixture();
        for name in ["a.bin", "b.bin", "c.bin"] {
            let j = job(
                "checkpoints",
                name,
                &format!("/vol/models/checkpoints/{name}"),
                &format!("/vol/models/checkpoints/{name}"),
            );
            f.queue.enqueue(j, &f.registry, &f.progress).unwrap();
        }

        assert_eq!(f.queue.pop_next().unwrap().unwrap().model_name, "a.bin");
        assert_eq!(f.queue.pop_next().unwrap().unwrap().model_name, "b.bin");
        assert_eq!(f.queue.pop_next().unwrap().unwrap().model_name, "c.bin");
        assert!(f.queue.pop_next().unwrap().is_none());
    }

    #[test]
    fn remove_excises_by_identity() {
        let f = fixture();
        for name in ["a.bin", "b.bin"] {
            let j = job(
                "checkpoints",
                name,
                &format!("/vol/models/checkpoints/{name}"),
                &format!("/vol/models/checkpoints/{name}"),
            );
            f.queue.enqueue(j, &f.registry, &f.progress).unwrap();
        }

        assert_eq!(f.queue.remove("checkpoints", "a.bin").unwrap(), 1);
        assert_eq!(f.queue.remove("checkpoints", "a.bin").unwrap(), 0);
        assert_eq!(f.queue.snapshot().len(), 1);
    }
}
