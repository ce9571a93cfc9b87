//! The persistent model registry.
//!
//! On disk this is a JSON object `{group: {modelName: entry}}`, shared with
//! peer processes. All mutations happen under the `catalog` lock and land
//! through an atomic rewrite; readers that do not mutate may read without
//! the lock and tolerate observing the previous version.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utils::crashsafe;
use utils::lock_file;

use crate::config::{SyncConf, CATALOG_LOCK_TTL};
use crate::ModelKey;

/// One logical model known to this pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub group: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    /// Canonical remote location, bucket prefix stripped, `/`-separated.
    #[serde(rename = "originalRemotePath")]
    pub original_remote_path: String,
    /// Absolute local path as consumed by downstream applications.
    #[serde(rename = "localPath")]
    pub local_path: Utf8PathBuf,
    /// Advisory size in bytes; corrected from filesystem stat when found
    /// smaller than reality.
    #[serde(rename = "modelSize", default)]
    pub model_size: u64,
    /// External origin URL; required for any upload.
    #[serde(rename = "downloadUrl", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(rename = "uploadedAt", default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<String>,
    #[serde(rename = "lastUpdated", default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

impl ModelEntry {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.group.clone(), self.model_name.clone())
    }

    pub fn has_valid_download_url(&self) -> bool {
        self.download_url
            .as_deref()
            .is_some_and(valid_download_url)
    }
}

/// `^(https?|s3)://[^\s]+$`
pub fn valid_download_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("s3://"));
    match rest {
        Some(rest) => !rest.is_empty() && !rest.chars().any(char::is_whitespace),
        None => false,
    }
}

/// Strip an `s3://<bucket>/` scheme prefix, or a leading `/`, leaving the
/// bucket-relative key. The prefix is reattached only at the transport edge.
pub fn strip_bucket_prefix(remote_path: &str) -> &str {
    if let Some(rest) = remote_path.strip_prefix("s3://") {
        match rest.split_once('/') {
            Some((_bucket, key)) => key,
            None => "",
        }
    } else {
        remote_path.trim_start_matches('/')
    }
}

/// Derive the model name from a path: the tail after the first segment
/// following a `models/` marker. `/a/models/checkpoints/v1/sd.safetensors`
/// names the model `v1/sd.safetensors` inside group `checkpoints`.
pub fn model_name_from_path(path: &str) -> Option<String> {
    let (_, after_marker) = split_at_models_marker(path)?;
    let mut segments = after_marker.splitn(2, '/');
    let _group = segments.next()?;
    match segments.next() {
        Some(tail) if !tail.is_empty() => Some(tail.to_string()),
        _ => None,
    }
}

/// Split `path` around its last `models/` component: returns the part up to
/// and including `models` and the remainder.
pub(crate) fn split_at_models_marker(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let mut result = None;
    let mut search_from = 0;
    while let Some(idx) = trimmed[search_from..].find("models") {
        let start = search_from + idx;
        let end = start + "models".len();
        let at_boundary_before = start == 0 || trimmed.as_bytes()[start - 1] == b'/';
        let at_boundary_after = trimmed.as_bytes().get(end) == Some(&b'/');
        if at_boundary_before && at_boundary_after {
            result = Some((&trimmed[..end], &trimmed[end + 1..]));
        }
        search_from = end;
    }
    result
}

pub type CatalogData = BTreeMap<String, BTreeMap<String, ModelEntry>>;

/// How [`CatalogStore::find_by_local_path`] matches paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Contains,
    /// Exact match if any; otherwise every entry whose path contains the
    /// needle.
    Auto,
}

pub struct CatalogStore {
    path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lock_timeout: Duration,
}

impl CatalogStore {
    pub fn new(conf: &SyncConf) -> Self {
        Self {
            path: conf.catalog_path(),
            lock_path: conf.lock_path("catalog"),
            lock_timeout: CATALOG_LOCK_TTL,
        }
    }

    /// Lockless snapshot; mutating peers replace the file atomically, so
    /// this is the previous or the current version, never a torn one.
    pub fn load(&self) -> CatalogData {
        crashsafe::load_json_or_default(&self.path, CatalogData::new())
    }

    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut CatalogData) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let _guard = lock_file::acquire(&self.lock_path, self.lock_timeout, CATALOG_LOCK_TTL)
            .context("catalog lock")?;
        let mut data = crashsafe::load_json_or_default(&self.path, CatalogData::new());
        let result = f(&mut data)?;
        crashsafe::overwrite_json(&self.path, &data).context("catalog rewrite")?;
        Ok(result)
    }

    /// Insert or overwrite by `(group, modelName)`. Stamps `lastUpdated`
    /// (and `uploadedAt` if unset) and strips any bucket prefix from the
    /// remote path.
    pub fn upsert(&self, mut entry: ModelEntry) -> anyhow::Result<()> {
        entry.original_remote_path = strip_bucket_prefix(&entry.original_remote_path).to_string();
        let now = crate::utc_now_string();
        entry.last_updated = Some(now.clone());
        if entry.uploaded_at.is_none() {
            entry.uploaded_at = Some(now);
        }
        self.with_lock(|data| {
            debug!("catalog upsert {}", entry.key());
            data.entry(entry.group.clone())
                .or_default()
                .insert(entry.model_name.clone(), entry);
            Ok(())
        })
    }

    pub fn delete(&self, group: &str, model_name: &str) -> anyhow::Result<bool> {
        self.with_lock(|data| {
            let removed = data
                .get_mut(group)
                .and_then(|models| models.remove(model_name))
                .is_some();
            if let Some(models) = data.get(group) {
                if models.is_empty() {
                    data.remove(group);
                }
            }
            Ok(removed)
        })
    }

    pub fn get(&self, group: &str, model_name: &str) -> Option<ModelEntry> {
        self.load().get(group)?.get(model_name).cloned()
    }

    pub fn list_by_group(&self, group: &str) -> Vec<ModelEntry> {
        self.load()
            .get(group)
            .map(|models| models.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<ModelEntry> {
        self.load()
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect()
    }

    fn matches(entry: &ModelEntry, needle: &str, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Exact => entry.local_path.as_str() == needle,
            MatchMode::Contains => entry.local_path.as_str().contains(needle),
            MatchMode::Auto => unreachable!("auto is resolved by the caller"),
        }
    }

    pub fn find_by_local_path(&self, local_path: &str, mode: MatchMode) -> Vec<ModelEntry> {
        let all = self.list_all();
        match mode {
            MatchMode::Exact | MatchMode::Contains => all
                .into_iter()
                .filter(|e| Self::matches(e, local_path, mode))
                .collect(),
            MatchMode::Auto => {
                let exact: Vec<_> = all
                    .iter()
                    .filter(|e| Self::matches(e, local_path, MatchMode::Exact))
                    .cloned()
                    .collect();
                if !exact.is_empty() {
                    exact
                } else {
                    all.into_iter()
                        .filter(|e| Self::matches(e, local_path, MatchMode::Contains))
                        .collect()
                }
            }
        }
    }

    /// Delete all entries matching the local path; each removal is logged.
    pub fn remove_by_local_path(
        &self,
        local_path: &str,
        mode: MatchMode,
    ) -> anyhow::Result<Vec<ModelEntry>> {
        self.with_lock(|data| {
            let mut removed = Vec::new();
            for (group, models) in data.iter_mut() {
                let to_remove: Vec<String> = models
                    .iter()
                    .filter(|(_, entry)| match mode {
                        MatchMode::Auto => {
                            entry.local_path.as_str() == local_path
                                || entry.local_path.as_str().contains(local_path)
                        }
                        m => Self::matches(entry, local_path, m),
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in to_remove {
                    if let Some(entry) = models.remove(&name) {
                        info!("removing catalog entry {}/{name} ({})", group, entry.local_path);
                        removed.push(entry);
                    }
                }
            }
            data.retain(|_, models| !models.is_empty());
            Ok(removed)
        })
    }

    /// Entries with a valid `downloadUrl` whose local path does not yet
    /// exist on disk: the ones a download run would fetch.
    pub fn downloadable_entries(&self) -> Vec<ModelEntry> {
        self.list_all()
            .into_iter()
            .filter(|e| e.has_valid_download_url() && !e.local_path.exists())
            .collect()
    }

    pub fn get_download_url(&self, local_path: &Utf8Path) -> Option<String> {
        self.find_by_local_path(local_path.as_str(), MatchMode::Exact)
            .into_iter()
            .find_map(|e| e.download_url)
    }

    /// Rewrite the remote path of one entry, used when the policy service
    /// points us at an existing canonical artifact.
    pub fn relink(
        &self,
        group: &str,
        model_name: &str,
        new_remote_path: &str,
    ) -> anyhow::Result<bool> {
        let stripped = strip_bucket_prefix(new_remote_path).to_string();
        self.with_lock(|data| {
            match data.get_mut(group).and_then(|m| m.get_mut(model_name)) {
                Some(entry) => {
                    info!(
                        "relinking {}/{model_name}: {} -> {stripped}",
                        group, entry.original_remote_path
                    );
                    entry.original_remote_path = stripped.clone();
                    entry.last_updated = Some(crate::utc_now_string());
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Run an arbitrary mutation over the whole catalog under the lock.
    /// The sanitizer uses this so its read-plan-apply cycle cannot race a
    /// concurrent peer.
    pub fn with_exclusive<R>(
        &self,
        f: impl FnOnce(&mut CatalogData) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        self.with_lock(f)
    }
}
