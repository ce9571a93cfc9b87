//! The upload reconciler: a batch walk of the local model tree that pushes
//! eligible files to the object store, guided per file by the policy
//! service.
//!
//! Before any traffic, the catalog is sanitized: entries sharing a
//! `downloadUrl` are consolidated onto the largest existing local file as
//! primary, so the catalog reflects dedup intent before new uploads land.
//! Sanitization itself never touches the filesystem; the next download run
//! materializes the symlinks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{GenericRemoteStorage, RemotePath, StorageMetadata};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::{strip_bucket_prefix, CatalogData, CatalogStore, MatchMode, ModelEntry};
use crate::compression::CountingReader;
use crate::config::SyncConf;
use crate::policy::{
    notify_best_effort, CatalogEffect, NotifyStatus, PolicyApi, ProgressNotification,
    SyncPermissionRequest,
};
use crate::ModelKey;

/// Files at or above this size get intermediate upload-progress
/// notifications.
const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

const UPLOAD_SAMPLER_INTERVAL: Duration = Duration::from_secs(2);

/// Metadata key carrying provenance on every uploaded artifact.
pub const DOWNLOAD_URL_METADATA_KEY: &str = "downloadUrl";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Files that passed the eligibility filter.
    pub eligible: usize,
    pub uploaded: usize,
    pub relinked: usize,
    /// Catalog entries dropped because the policy service flagged the local
    /// file as invalid.
    pub removed: usize,
    /// Policy said no with nothing for us to do.
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    pub fn fully_successful(&self) -> bool {
        self.failed == 0
    }
}

enum FileOutcome {
    Uploaded,
    Relinked,
    Removed,
    Skipped,
    Failed,
}

pub struct UploadReconciler<P: PolicyApi> {
    conf: Arc<SyncConf>,
    storage: GenericRemoteStorage,
    policy: Arc<P>,
    catalog: CatalogStore,
    cancel: CancellationToken,
}

impl<P: PolicyApi> UploadReconciler<P> {
    pub fn new(conf: Arc<SyncConf>, storage: GenericRemoteStorage, policy: Arc<P>) -> Self {
        Self {
            catalog: CatalogStore::new(&conf),
            conf,
            storage,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Walk every regular file under `root`, consult policy per eligible
    /// file and apply the decided action. `sync_type` tags the progress
    /// notifications for this batch.
    pub async fn sync_local_models(
        &self,
        root: &Utf8Path,
        remote_base: &str,
        sync_type: &str,
    ) -> anyhow::Result<ReconcileSummary> {
        self.conf.ensure_state_dirs()?;

        let conversions = self.sanitize_catalog()?;
        if conversions > 0 {
            info!("sanitization rewrote {conversions} catalog entries");
        }

        self.notify(sync_type, NotifyStatus::Progress, 0, None).await;

        let candidates = self.collect_eligible(root);
        let mut summary = ReconcileSummary {
            eligible: candidates.len(),
            ..Default::default()
        };
        info!(
            "syncing {} eligible files under {root} to {remote_base}",
            candidates.len()
        );

        for (index, candidate) in candidates.iter().enumerate() {
            let outcome = self
                .process_one(candidate, remote_base, sync_type)
                .await;
            match outcome {
                FileOutcome::Uploaded => summary.uploaded += 1,
                FileOutcome::Relinked => summary.relinked += 1,
                FileOutcome::Removed => summary.removed += 1,
                FileOutcome::Skipped => summary.skipped += 1,
                FileOutcome::Failed => summary.failed += 1,
            }
            let percentage = (((index + 1) * 100) / candidates.len().max(1)) as u8;
            self.notify(sync_type, NotifyStatus::Progress, percentage, None)
                .await;
        }

        let final_status = if summary.fully_successful() {
            NotifyStatus::Done
        } else {
            NotifyStatus::Failed
        };
        self.notify(sync_type, final_status, 100, None).await;
        info!(
            "sync finished: {} uploaded, {} relinked, {} removed, {} skipped, {} failed",
            summary.uploaded, summary.relinked, summary.removed, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Regular files under `root` that survive the eligibility filter,
    /// paired with their catalog entries.
    fn collect_eligible(&self, root: &Utf8Path) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("walk error under {root}: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()) else {
                warn!("skipping non-utf8 path {:?}", entry.path());
                continue;
            };
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative.to_path_buf();
            if !eligible_file_name(&relative) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                debug!("skipping zero-byte file {path}");
                continue;
            }

            let Some(catalog_entry) = self
                .catalog
                .find_by_local_path(path.as_str(), MatchMode::Exact)
                .pop()
            else {
                debug!("no catalog entry for {path}, skipping");
                continue;
            };
            if !catalog_entry.has_valid_download_url() {
                debug!("{path} has no valid download url, skipping");
                continue;
            }

            let group = relative
                .components()
                .next()
                .map(|c| c.as_str().to_string())
                .filter(|_| relative.components().count() > 1)
                .unwrap_or_else(|| "misc".to_string());

            candidates.push(Candidate {
                local_path: path,
                relative_path: relative,
                group,
                size,
                entry: catalog_entry,
            });
        }
        candidates
    }

    async fn process_one(
        &self,
        candidate: &Candidate,
        remote_base: &str,
        sync_type: &str,
    ) -> FileOutcome {
        let destination = format!(
            "{}/{}",
            remote_base.trim_end_matches('/'),
            candidate.relative_path
        );
        // eligibility guaranteed the url exists
        let download_url = candidate.entry.download_url.clone().unwrap_or_default();

        let decision = match self
            .policy
            .sync_permission(SyncPermissionRequest {
                remote_path: destination.clone(),
                download_url: download_url.clone(),
                group: candidate.group.clone(),
                size: candidate.size,
            })
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!("policy request for {} failed: {e}", candidate.local_path);
                return FileOutcome::Failed;
            }
        };

        match decision.catalog_effect() {
            CatalogEffect::Upload => {
                match self
                    .upload_one(candidate, &destination, &download_url, sync_type)
                    .await
                {
                    Ok(()) => FileOutcome::Uploaded,
                    Err(e) => {
                        warn!("upload of {} failed: {e:#}", candidate.local_path);
                        FileOutcome::Failed
                    }
                }
            }
            CatalogEffect::RemoveEntry => {
                info!(
                    "policy rejected {} as invalid ({:?}), dropping catalog entry",
                    candidate.local_path, decision.reason
                );
                match self
                    .catalog
                    .remove_by_local_path(candidate.local_path.as_str(), MatchMode::Exact)
                {
                    Ok(_) => FileOutcome::Removed,
                    Err(e) => {
                        warn!("failed to drop catalog entry: {e:#}");
                        FileOutcome::Failed
                    }
                }
            }
            CatalogEffect::Relink {
                canonical_remote_path,
            } => {
                match self.catalog.relink(
                    &candidate.entry.group,
                    &candidate.entry.model_name,
                    canonical_remote_path,
                ) {
                    Ok(_) => FileOutcome::Relinked,
                    Err(e) => {
                        warn!("failed to relink catalog entry: {e:#}");
                        FileOutcome::Failed
                    }
                }
            }
            CatalogEffect::None => {
                debug!(
                    "no action for {} ({:?})",
                    candidate.local_path, decision.reason
                );
                FileOutcome::Skipped
            }
        }
    }

    /// Catalog first, then bytes: the entry records the destination before
    /// the upload starts, so a crash mid-upload is re-reconciled (and caught
    /// as a partial) on the next run.
    async fn upload_one(
        &self,
        candidate: &Candidate,
        destination: &str,
        download_url: &str,
        sync_type: &str,
    ) -> anyhow::Result<()> {
        let mut entry = candidate.entry.clone();
        entry.original_remote_path = strip_bucket_prefix(destination).to_string();
        entry.model_size = candidate.size;
        self.catalog.upsert(entry)?;

        let remote = RemotePath::from_string(strip_bucket_prefix(destination))
            .with_context(|| format!("invalid upload destination {destination:?}"))?;

        let file = tokio::fs::File::open(&candidate.local_path)
            .await
            .with_context(|| format!("failed to open {}", candidate.local_path))?;
        let counter = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(CountingReader::new(file, counter.clone()));

        let sampler = (candidate.size >= LARGE_FILE_THRESHOLD).then(|| {
            tokio::spawn(upload_sampler(
                Arc::clone(&self.policy),
                sync_type.to_string(),
                candidate.entry.key(),
                candidate.size,
                counter,
            ))
        });

        let metadata = StorageMetadata::from([(DOWNLOAD_URL_METADATA_KEY, download_url)]);
        let result = self
            .storage
            .upload(
                stream,
                candidate.size as usize,
                &remote,
                Some(metadata),
                &self.cancel,
            )
            .await;

        if let Some(sampler) = sampler {
            sampler.abort();
            let _ = sampler.await;
        }

        result.with_context(|| format!("failed to upload {}", candidate.local_path))?;
        info!("uploaded {} -> {destination}", candidate.local_path);
        Ok(())
    }

    async fn notify(
        &self,
        sync_type: &str,
        status: NotifyStatus,
        percentage: u8,
        details: Option<String>,
    ) {
        notify_best_effort(
            &*self.policy,
            ProgressNotification {
                user_id: String::new(),
                download_type: sync_type.to_string(),
                status,
                percentage,
                model_name: None,
                details,
            },
        )
        .await;
    }

    /// Consolidate catalog entries sharing a `downloadUrl` onto the largest
    /// existing local file. Returns the number of rewritten entries.
    pub fn sanitize_catalog(&self) -> anyhow::Result<usize> {
        self.catalog.with_exclusive(|data| {
            let plan = plan_sanitization(data, &|path| std::fs::metadata(path).ok().map(|m| m.len()));
            let changed = plan.relinks.len();
            apply_sanitization(data, &plan);
            Ok(changed)
        })
    }
}

struct Candidate {
    local_path: Utf8PathBuf,
    relative_path: Utf8PathBuf,
    group: String,
    size: u64,
    entry: ModelEntry,
}

async fn upload_sampler<P: PolicyApi>(
    policy: Arc<P>,
    sync_type: String,
    key: ModelKey,
    total: u64,
    counter: Arc<AtomicU64>,
) {
    loop {
        tokio::time::sleep(UPLOAD_SAMPLER_INTERVAL).await;
        let sent = counter.load(Ordering::Relaxed);
        let percentage = ((sent.min(total) * 100) / total.max(1)) as u8;
        notify_best_effort(
            &*policy,
            ProgressNotification {
                user_id: String::new(),
                download_type: sync_type.clone(),
                status: NotifyStatus::Progress,
                percentage,
                model_name: Some(key.to_string()),
                details: Some(format!("uploading {key}: {sent}/{total} bytes")),
            },
        )
        .await;
    }
}

/// What sanitization intends to change. Computed over a snapshot with an
/// injected `stat` so the planning logic stays pure and testable.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanitizePlan {
    /// Primaries whose recorded size undershoots the file on disk.
    pub size_corrections: Vec<(ModelKey, u64)>,
    /// Non-primary local entries to repoint at the primary's remote path.
    pub relinks: Vec<(ModelKey, String)>,
}

impl SanitizePlan {
    pub fn is_empty(&self) -> bool {
        self.size_corrections.is_empty() && self.relinks.is_empty()
    }
}

pub fn plan_sanitization(
    data: &CatalogData,
    stat: &dyn Fn(&Utf8Path) -> Option<u64>,
) -> SanitizePlan {
    // cluster by non-empty download url
    let mut clusters: BTreeMap<&str, Vec<&ModelEntry>> = BTreeMap::new();
    for entry in data.values().flat_map(BTreeMap::values) {
        if let Some(url) = entry.download_url.as_deref() {
            if !url.is_empty() {
                clusters.entry(url).or_default().push(entry);
            }
        }
    }

    let mut plan = SanitizePlan::default();
    for (url, members) in clusters {
        if members.len() < 2 {
            continue;
        }
        // primary: the largest file that actually exists on disk
        let Some((primary, primary_size)) = members
            .iter()
            .filter_map(|e| stat(&e.local_path).map(|size| (*e, size)))
            .max_by_key(|(_, size)| *size)
        else {
            debug!("duplicate cluster for {url} has no local files, leaving as is");
            continue;
        };

        if primary.model_size < primary_size {
            plan.size_corrections
                .push((primary.key(), primary_size));
        }

        for member in members {
            if member.key() == primary.key() {
                continue;
            }
            // remote-only members are untouched
            if stat(&member.local_path).is_none() {
                continue;
            }
            if member.original_remote_path != primary.original_remote_path {
                plan.relinks
                    .push((member.key(), primary.original_remote_path.clone()));
            }
        }
    }
    plan
}

pub fn apply_sanitization(data: &mut CatalogData, plan: &SanitizePlan) {
    let now = crate::utc_now_string();
    for (key, size) in &plan.size_corrections {
        if let Some(entry) = data.get_mut(&key.group).and_then(|m| m.get_mut(&key.model_name)) {
            entry.model_size = *size;
        }
    }
    for (key, remote_path) in &plan.relinks {
        if let Some(entry) = data.get_mut(&key.group).and_then(|m| m.get_mut(&key.model_name)) {
            info!(
                "sanitize: {} now points at {remote_path} (was {})",
                key, entry.original_remote_path
            );
            entry.original_remote_path = remote_path.clone();
            entry.last_updated = Some(now.clone());
        }
    }
}

/// Hidden files, scratch suffixes and metadata companions never sync.
fn eligible_file_name(relative: &Utf8Path) -> bool {
    let Some(name) = relative.file_name() else {
        return false;
    };
    if relative
        .components()
        .any(|c| c.as_str().starts_with('.'))
    {
        return false;
    }
    let lowered = name.to_ascii_lowercase();
    for suffix in [".log", ".tmp", ".temp", "_info", "_metadata"] {
        if lowered.ends_with(suffix) {
            return false;
        }
    }
    true
}
