//! Configuration for the pod-side sync processes.
//!
//! A toml file provides the durable settings; pod identity and bucket
//! coordinates usually arrive through the environment and override the file.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::RemoteStorageConfig;
use serde::{Deserialize, Serialize};

/// How many downloads may run at once inside one worker process.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// How often the worker re-stamps its running lock so peers can detect a
/// dead one.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// The worker exits after this many consecutive empty queue observations
/// with nothing in flight.
pub const DEFAULT_MAX_EMPTY_QUEUE_CHECKS: u32 = 10;

/// Locks over the catalog and the destination registry guard long batch
/// mutations; their staleness TTL is generous.
pub const CATALOG_LOCK_TTL: Duration = Duration::from_secs(600);

/// Queue and progress critical sections are tiny; a holder older than this
/// is gone.
pub const QUEUE_LOCK_TTL: Duration = Duration::from_secs(30);

/// The worker-singleton running lock is refreshed by the heartbeat; without
/// refreshes it goes stale this fast.
pub const WORKER_LOCK_TTL: Duration = Duration::from_secs(30);

/// Worker startup waits this long for the transient "starting" lock:
/// 10 checks, 0.5 s apart.
pub const WORKER_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancel sentinels older than this are garbage.
pub const SENTINEL_MAX_AGE: Duration = Duration::from_secs(60);

fn default_max_concurrent_downloads() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

fn default_heartbeat_period() -> Duration {
    DEFAULT_HEARTBEAT_PERIOD
}

fn default_max_empty_queue_checks() -> u32 {
    DEFAULT_MAX_EMPTY_QUEUE_CHECKS
}

fn default_remote_models_prefix() -> String {
    "models".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConf {
    /// The network volume the pod and its peers share.
    pub volume_root: Utf8PathBuf,

    /// Where the consuming application expects model files,
    /// e.g. `/workspace/ComfyUI/models`.
    pub models_root: Utf8PathBuf,

    /// Directory holding every shared coordination file: catalog, queue,
    /// progress, registry, locks, sentinels. Defaults to
    /// `<volume_root>/.modelsync`.
    pub state_dir: Option<Utf8PathBuf>,

    /// Ambient bucket name, used when a job's remote path does not carry one.
    pub bucket_name: String,

    /// Prefix inside the bucket under which all model artifacts live.
    #[serde(default = "default_remote_models_prefix")]
    pub remote_models_prefix: String,

    /// Pod identity, sent as `X-Pod-Id` to the policy service.
    pub pod_id: String,

    /// User identity, sent as `X-User-Id` to the policy service.
    pub user_id: String,

    /// Base URL of the policy service.
    pub policy_base_url: String,

    /// Opaque bearer token for the policy service, when the environment
    /// provides one.
    #[serde(default)]
    pub policy_auth_token: Option<String>,

    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    #[serde(with = "humantime_serde", default = "default_heartbeat_period")]
    pub heartbeat_period: Duration,

    #[serde(default = "default_max_empty_queue_checks")]
    pub max_empty_queue_checks: u32,

    /// Object store to reconcile against.
    pub remote_storage: Option<RemoteStorageConfig>,
}

impl SyncConf {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let document: toml_edit::DocumentMut =
            input.parse().context("invalid config toml")?;
        let conf: SyncConf = toml_edit::de::from_document(document)?;
        Ok(conf)
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let mut conf = Self::from_toml_str(&input)?;
        conf.apply_env_overrides();
        Ok(conf)
    }

    /// Pod identity and bucket coordinates are injected by the pod
    /// environment and win over the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bucket) = std::env::var("MODELSYNC_BUCKET") {
            self.bucket_name = bucket;
        }
        if let Ok(pod_id) = std::env::var("POD_ID") {
            self.pod_id = pod_id;
        }
        if let Ok(user_id) = std::env::var("USER_ID") {
            self.user_id = user_id;
        }
        if let Ok(url) = std::env::var("POLICY_BASE_URL") {
            self.policy_base_url = url;
        }
        if let Ok(token) = std::env::var("POLICY_AUTH_TOKEN") {
            self.policy_auth_token = Some(token);
        }
    }

    pub fn state_dir(&self) -> Utf8PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.volume_root.join(".modelsync"))
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.state_dir().join("models_catalog.json")
    }

    pub fn queue_path(&self) -> Utf8PathBuf {
        self.state_dir().join("download_queue.json")
    }

    pub fn progress_path(&self) -> Utf8PathBuf {
        self.state_dir().join("download_progress.json")
    }

    pub fn registry_path(&self) -> Utf8PathBuf {
        self.state_dir().join("destination_registry.json")
    }

    pub fn lock_dir(&self) -> Utf8PathBuf {
        self.state_dir().join("locks")
    }

    pub fn lock_path(&self, name: &str) -> Utf8PathBuf {
        self.lock_dir().join(format!("{name}.lock"))
    }

    pub fn sentinel_dir(&self) -> Utf8PathBuf {
        self.state_dir().join("sentinels")
    }

    /// Per-model cancellation sentinel. Model names may contain path
    /// separators; flatten them so the sentinel stays a single file.
    pub fn cancel_sentinel_path(&self, group: &str, model_name: &str) -> Utf8PathBuf {
        let flat = format!("{group}_{model_name}").replace('/', "_");
        self.sentinel_dir().join(format!("cancel_{flat}"))
    }

    pub fn stop_sentinel_path(&self) -> Utf8PathBuf {
        self.sentinel_dir().join("stop_all_downloads")
    }

    /// Create the state directory tree; every process entrypoint calls this
    /// before touching shared files.
    pub fn ensure_state_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.state_dir(), self.lock_dir(), self.sentinel_dir()] {
            utils::crashsafe::create_dir_all(&dir)
                .with_context(|| format!("failed to create state dir {dir}"))?;
        }
        Ok(())
    }
}
