//! Per-model download progress records and their aggregation.
//!
//! Records persist after terminal states for observability and are
//! overwritten in place by later runs. All writes are serialized by the
//! `progress` lock; the aggregate computation is a pure function over a
//! snapshot so peers (and tests) can evaluate it without any I/O.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utils::crashsafe;
use utils::lock_file;

use crate::config::{SyncConf, QUEUE_LOCK_TTL};
use crate::policy::{notify_best_effort, NotifyStatus, PolicyApi, ProgressNotification};
use crate::ModelKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Progress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "totalSize", default)]
    pub total_size: u64,
    #[serde(default)]
    pub downloaded: u64,
    pub status: DownloadStatus,
    #[serde(rename = "localPath")]
    pub local_path: Utf8PathBuf,
    #[serde(rename = "downloadDestination")]
    pub download_destination: Utf8PathBuf,
    #[serde(rename = "lastUpdated", default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

pub type ProgressData = BTreeMap<String, BTreeMap<String, ProgressRecord>>;

/// The flattened view the policy service is notified with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateProgress {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Records still in `queued` or `progress`.
    pub active_count: usize,
    pub percentage: u8,
}

/// Pure aggregation over a snapshot: only records with a known total size
/// participate in the byte sums.
pub fn aggregate(data: &ProgressData) -> AggregateProgress {
    let mut total_bytes = 0u64;
    let mut downloaded_bytes = 0u64;
    let mut active_count = 0usize;
    for record in data.values().flat_map(BTreeMap::values) {
        if record.status.is_active() {
            active_count += 1;
        }
        if record.total_size > 0 {
            total_bytes += record.total_size;
            downloaded_bytes += record.downloaded.min(record.total_size);
        }
    }
    let percentage = if total_bytes == 0 {
        0
    } else {
        ((downloaded_bytes as f64 / total_bytes as f64) * 100.0).round() as u8
    };
    AggregateProgress {
        total_bytes,
        downloaded_bytes,
        active_count,
        percentage,
    }
}

/// Derive the outward-facing notification status from the aggregate plus the
/// status of the record that just changed.
pub fn promote_status(aggregate: &AggregateProgress, last: DownloadStatus) -> NotifyStatus {
    if aggregate.active_count == 0 {
        if aggregate.percentage == 100 {
            return NotifyStatus::Done;
        }
        if matches!(last, DownloadStatus::Failed | DownloadStatus::Cancelled) {
            return NotifyStatus::Failed;
        }
    }
    NotifyStatus::Progress
}

pub struct ProgressStore {
    path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lock_timeout: Duration,
}

impl ProgressStore {
    pub fn new(conf: &SyncConf) -> Self {
        Self {
            path: conf.progress_path(),
            lock_path: conf.lock_path("progress"),
            lock_timeout: QUEUE_LOCK_TTL,
        }
    }

    pub fn snapshot(&self) -> ProgressData {
        crashsafe::load_json_or_default(&self.path, ProgressData::new())
    }

    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut ProgressData) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let _guard = lock_file::acquire(&self.lock_path, self.lock_timeout, QUEUE_LOCK_TTL)
            .context("progress lock")?;
        let mut data = crashsafe::load_json_or_default(&self.path, ProgressData::new());
        let result = f(&mut data)?;
        crashsafe::overwrite_json(&self.path, &data).context("progress rewrite")?;
        Ok(result)
    }

    /// Replace the record for `key` wholesale and return the new aggregate.
    pub fn update(&self, key: &ModelKey, record: ProgressRecord) -> anyhow::Result<AggregateProgress> {
        self.with_lock(|data| {
            let mut record = record;
            record.last_updated = Some(crate::utc_now_string());
            debug!(
                "progress {} -> {:?} ({}/{})",
                key, record.status, record.downloaded, record.total_size
            );
            data.entry(key.group.clone())
                .or_default()
                .insert(key.model_name.clone(), record);
            Ok(aggregate(data))
        })
    }

    /// [`ProgressStore::update`] followed by the aggregate notification the
    /// contract demands after every progress write. Notification failures
    /// are logged and swallowed.
    pub async fn update_and_notify<P: PolicyApi>(
        &self,
        policy: &P,
        download_type: &str,
        key: &ModelKey,
        record: ProgressRecord,
    ) -> anyhow::Result<AggregateProgress> {
        let status = record.status;
        let aggregate = self.update(key, record)?;
        notify_best_effort(
            policy,
            ProgressNotification {
                user_id: String::new(),
                download_type: download_type.to_string(),
                status: promote_status(&aggregate, status),
                percentage: aggregate.percentage,
                model_name: Some(key.to_string()),
                details: None,
            },
        )
        .await;
        Ok(aggregate)
    }

    pub fn get(&self, key: &ModelKey) -> Option<ProgressRecord> {
        self.snapshot().get(&key.group)?.get(&key.model_name).cloned()
    }

    pub fn get_by_local_path(&self, local_path: &Utf8Path) -> Option<(ModelKey, ProgressRecord)> {
        for (group, models) in self.snapshot() {
            for (model_name, record) in models {
                if record.local_path == local_path {
                    return Some((ModelKey::new(group, model_name), record));
                }
            }
        }
        None
    }

    /// Whether any record currently claims this destination with an
    /// in-flight transfer; used by enqueue to refuse double downloads.
    pub fn destination_in_progress(&self, destination: &Utf8Path) -> bool {
        self.snapshot().values().flat_map(BTreeMap::values).any(|r| {
            r.download_destination == destination && r.status == DownloadStatus::Progress
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: u64, downloaded: u64, status: DownloadStatus) -> ProgressRecord {
        ProgressRecord {
            total_size: total,
            downloaded,
            status,
            local_path: Utf8PathBuf::from("/vol/models/checkpoints/x.bin"),
            download_destination: Utf8PathBuf::from("/vol/models/checkpoints/x.bin"),
            last_updated: None,
        }
    }

    fn data_of(records: Vec<(&str, &str, ProgressRecord)>) -> ProgressData {
        let mut data = ProgressData::new();
        for (group, name, record) in records {
            data.entry(group.to_string())
                .or_default()
                .insert(name.to_string(), record);
        }
        data
    }

    #[test]
    fn aggregate_ignores_unsized_records() {
        let data = data_of(vec![
            ("checkpoints", "a", record(100, 50, DownloadStatus::Progress)),
            ("checkpoints", "b", record(0, 0, DownloadStatus::Queued)),
        ]);
        let agg = aggregate(&data);
        assert_eq!(agg.total_bytes, 100);
        assert_eq!(agg.downloaded_bytes, 50);
        assert_eq!(agg.active_count, 2);
        assert_eq!(agg.percentage, 50);
    }

    #[test]
    fn aggregate_caps_downloaded_at_total() {
        let data = data_of(vec![(
            "checkpoints",
            "a",
            record(100, 150, DownloadStatus::Completed),
        )]);
        let agg = aggregate(&data);
        assert_eq!(agg.downloaded_bytes, 100);
        assert_eq!(agg.percentage, 100);
    }

    #[test]
    fn status_promotion() {
        let done = AggregateProgress {
            total_bytes: 100,
            downloaded_bytes: 100,
            active_count: 0,
            percentage: 100,
        };
        assert_eq!(
            promote_status(&done, DownloadStatus::Completed),
            NotifyStatus::Done
        );

        let failed = AggregateProgress {
            total_bytes: 100,
            downloaded_bytes: 10,
            active_count: 0,
            percentage: 10,
        };
        assert_eq!(
            promote_status(&failed, DownloadStatus::Failed),
            NotifyStatus::Failed
        );
        assert_eq!(
            promote_status(&failed, DownloadStatus::Cancelled),
            NotifyStatus::Failed
        );

        let running = AggregateProgress {
            total_bytes: 100,
            downloaded_bytes: 10,
            active_count: 1,
            percentage: 10,
        };
        assert_eq!(
            promote_status(&running, DownloadStatus::Progress),
            NotifyStatus::Progress
        );
    }

    #[test]
    fn store_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let conf = SyncConf::from_toml_str(&format!(
            r#"
volume_root = "{}"
models_root = "{}/models"
bucket_name = "b"
pod_id = "p"
user_id = "u"
policy_base_url = "https://api.example.com"
"#,
            dir.path(),
            dir.path()
        ))
        .unwrap();
        conf.ensure_state_dirs().unwrap();
        let store = ProgressStore::new(&conf);
        let key = ModelKey::new("checkpoints", "x.bin");

        let agg = store.update(&key, record(100, 0, DownloadStatus::Queued)).unwrap();
        assert_eq!(agg.active_count, 1);

        let stored = store.get(&key).unwrap();
        assert_eq!(stored.status, DownloadStatus::Queued);
        assert!(stored.last_updated.is_some());

        let (found_key, _) = store
            .get_by_local_path(Utf8Path::new("/vol/models/checkpoints/x.bin"))
            .unwrap();
        assert_eq!(found_key, key);

        store.update(&key, record(100, 100, DownloadStatus::Progress)).unwrap();
        assert!(store.destination_in_progress(Utf8Path::new("/vol/models/checkpoints/x.bin")));
    }
}
