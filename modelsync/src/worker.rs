//! The download worker: a per-pod singleton that drains the download queue
//! with bounded in-process parallelism.
//!
//! Startup goes through the two-phase singleton lock; a heartbeat task keeps
//! re-stamping the running lock so peers can spot a SIGKILL'd worker.
//! Cancellation is cooperative: an in-process token tree, plus on-disk
//! sentinel files so other processes on the volume can signal us.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{DownloadError, GenericRemoteStorage, RemotePath};
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use utils::lock_file::{self, SingletonStart};

use crate::catalog::strip_bucket_prefix;
use crate::compression::{self, CountingReader};
use crate::config::{SyncConf, SENTINEL_MAX_AGE, WORKER_LOCK_TTL, WORKER_START_TIMEOUT};
use crate::policy::PolicyApi;
use crate::progress::{DownloadStatus, ProgressRecord, ProgressStore};
use crate::queue::DownloadQueue;
use crate::registry::DestinationRegistry;
use crate::resolver::resolve_destination;
use crate::ModelKey;

/// Tag carried by every aggregate notification this worker emits.
pub const DOWNLOAD_TYPE: &str = "model_download";

/// How long between pop attempts while the queue is empty.
const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(500);

/// How long between pop attempts while at download capacity.
const AT_CAPACITY_SLEEP: Duration = Duration::from_secs(1);

/// How often the in-flight sampler flushes byte counts into the progress
/// store (and polls the cancel sentinel).
const SAMPLER_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative shutdown grace before in-flight transfers are aborted:
/// 5 checks, 1 s apart.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue stayed empty long enough; the worker is ephemeral.
    Drained,
    /// The global stop sentinel appeared.
    Stopped,
    /// Another live process already holds the worker role.
    AlreadyRunning,
}

pub struct DownloadWorker<P: PolicyApi> {
    conf: Arc<SyncConf>,
    storage: GenericRemoteStorage,
    policy: Arc<P>,
    queue: DownloadQueue,
    progress: ProgressStore,
    registry: DestinationRegistry,
    cancel: CancellationToken,
}

impl<P: PolicyApi> DownloadWorker<P> {
    pub fn new(conf: Arc<SyncConf>, storage: GenericRemoteStorage, policy: Arc<P>) -> Arc<Self> {
        Arc::new(Self {
            queue: DownloadQueue::new(&conf),
            progress: ProgressStore::new(&conf),
            registry: DestinationRegistry::new(&conf),
            conf,
            storage,
            policy,
            cancel: CancellationToken::new(),
        })
    }

    /// Run until the queue drains or the stop sentinel appears.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<WorkerExit> {
        self.conf.ensure_state_dirs()?;

        let starting_path = self.conf.lock_path("worker.starting");
        let running_path = self.conf.lock_path("worker.running");
        let start = tokio::task::spawn_blocking(move || {
            lock_file::acquire_singleton(
                &starting_path,
                &running_path,
                WORKER_START_TIMEOUT,
                WORKER_LOCK_TTL,
            )
        })
        .await
        .context("singleton acquisition task panicked")??;

        let running_guard = match start {
            SingletonStart::Acquired(guard) => guard,
            SingletonStart::AlreadyRunning { owner_pid } => {
                info!("download worker already running as pid {owner_pid}");
                return Ok(WorkerExit::AlreadyRunning);
            }
        };

        // Heartbeat: re-stamp the running lock so peers never reclaim it
        // while we live. The guard moves into the heartbeat task and is
        // dropped (= released) when the task is aborted at the end of run.
        let heartbeat_period = self.conf.heartbeat_period;
        let heartbeat = tokio::spawn(async move {
            let mut guard = running_guard;
            loop {
                tokio::time::sleep(heartbeat_period).await;
                if let Err(e) = guard.refresh() {
                    warn!("worker heartbeat failed: {e}");
                }
            }
        });

        let exit = self.main_loop().await;

        heartbeat.abort();
        let _ = heartbeat.await;
        info!("download worker exiting: {:?}", exit);
        exit
    }

    async fn main_loop(self: &Arc<Self>) -> anyhow::Result<WorkerExit> {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut empty_checks = 0u32;

        loop {
            self.sweep_stale_sentinels();

            if self.conf.stop_sentinel_path().exists() {
                info!(
                    "global stop sentinel present, draining {} in-flight downloads",
                    in_flight.len()
                );
                self.cancel.cancel();
                Self::drain(&mut in_flight).await;
                return Ok(WorkerExit::Stopped);
            }

            // reap finished children
            while in_flight.try_join_next().is_some() {}

            if in_flight.len() >= self.conf.max_concurrent_downloads {
                tokio::time::sleep(AT_CAPACITY_SLEEP).await;
                continue;
            }

            match self.queue.pop_next()? {
                Some(job) => {
                    empty_checks = 0;
                    let key = job.key();
                    if self.cancel_sentinel(&key).exists() {
                        info!("{key} was cancelled while queued");
                        self.mark_cancelled(&job.key(), &job.local_path, &job.download_destination)
                            .await;
                        continue;
                    }
                    let this = Arc::clone(self);
                    let span = info_span!("download", model = %key);
                    in_flight.spawn(
                        async move {
                            this.download_one_logged(job).await;
                        }
                        .instrument(span),
                    );
                }
                None => {
                    if in_flight.is_empty() {
                        empty_checks += 1;
                        if empty_checks >= self.conf.max_empty_queue_checks {
                            return Ok(WorkerExit::Drained);
                        }
                    }
                    tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                }
            }
        }
    }

    async fn drain(in_flight: &mut JoinSet<()>) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !in_flight.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("aborting {} transfers that ignored cancellation", in_flight.len());
                    in_flight.abort_all();
                    break;
                }
                res = in_flight.join_next() => {
                    if res.is_none() {
                        break;
                    }
                }
            }
        }
        while in_flight.join_next().await.is_some() {}
    }

    fn cancel_sentinel(&self, key: &ModelKey) -> Utf8PathBuf {
        self.conf.cancel_sentinel_path(&key.group, &key.model_name)
    }

    /// Remove sentinels old enough that no consumer can still be waiting on
    /// them. Replaces the detached cleanup sleeps of older revisions.
    fn sweep_stale_sentinels(&self) {
        let Ok(entries) = std::fs::read_dir(self.conf.sentinel_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok());
            if age.is_some_and(|age| age > SENTINEL_MAX_AGE) {
                if std::fs::remove_file(entry.path()).is_ok() {
                    info!("swept stale sentinel {:?}", entry.file_name());
                }
            }
        }
    }

    async fn download_one_logged(self: &Arc<Self>, job: crate::queue::DownloadJob) {
        let key = job.key();
        match self.download_one(&job).await {
            Ok(status) => info!("{key}: {:?}", status),
            Err(e) => {
                warn!("{key}: download failed: {e:#}");
                let resolved = resolve_destination(&job.local_path, &job.source_remote_path);
                self.cleanup_partials(&resolved.destination).await;
                self.set_status(
                    &key,
                    &job.local_path,
                    &resolved.destination,
                    job.total_size,
                    0,
                    DownloadStatus::Failed,
                )
                .await;
            }
        }
    }

    async fn download_one(
        self: &Arc<Self>,
        job: &crate::queue::DownloadJob,
    ) -> anyhow::Result<DownloadStatus> {
        let key = job.key();

        // a cancel may have landed between pop and spawn
        if self.cancel_sentinel(&key).exists() {
            self.mark_cancelled(&key, &job.local_path, &job.download_destination)
                .await;
            return Ok(DownloadStatus::Cancelled);
        }

        let resolved = resolve_destination(&job.local_path, &job.source_remote_path);

        // Somebody already materialized the destination: complete without a
        // transfer, fanning out whatever consumers are registered.
        if resolved.destination.exists() {
            let size = std::fs::metadata(&resolved.destination)
                .map(|m| m.len())
                .unwrap_or(job.total_size);
            self.set_status(
                &key,
                &job.local_path,
                &resolved.destination,
                size,
                size,
                DownloadStatus::Completed,
            )
            .await;
            self.complete_for_destination(&resolved.destination).await?;
            return Ok(DownloadStatus::Completed);
        }

        let remote_key = strip_bucket_prefix(&job.source_remote_path);
        if let Some(rest) = job.source_remote_path.strip_prefix("s3://") {
            let bucket = rest.split('/').next().unwrap_or_default();
            if bucket != self.conf.bucket_name {
                warn!(
                    "{key}: job names bucket {bucket}, using ambient bucket {}",
                    self.conf.bucket_name
                );
            }
        }
        let remote = RemotePath::from_string(remote_key)
            .with_context(|| format!("invalid remote path {remote_key:?}"))?;

        // prefer the compressed transport sibling when the remote has one
        let variant = match compression::probe(&self.storage, &remote, &self.cancel).await {
            Ok(variant) => variant,
            Err(DownloadError::Cancelled) => {
                self.mark_cancelled(&key, &job.local_path, &resolved.destination)
                    .await;
                return Ok(DownloadStatus::Cancelled);
            }
            Err(e) => {
                warn!("{key}: compression probe failed ({e}), assuming uncompressed");
                None
            }
        };

        let total_size = match &variant {
            Some(v) => v.uncompressed_size.unwrap_or(v.transport_size),
            None => match self.storage.head(&remote, &self.cancel).await {
                Ok(summary) => summary.size,
                Err(DownloadError::NotFound) => {
                    anyhow::bail!("remote object {remote} does not exist")
                }
                Err(_) => job.total_size,
            },
        };

        self.set_status(
            &key,
            &job.local_path,
            &resolved.destination,
            total_size,
            0,
            DownloadStatus::Progress,
        )
        .await;

        if let Some(parent) = resolved.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent}"))?;
        }

        let job_cancel = self.cancel.child_token();
        let counter = Arc::new(AtomicU64::new(0));
        let sampler = tokio::spawn(self.clone().progress_sampler(
            key.clone(),
            job.local_path.clone(),
            resolved.destination.clone(),
            total_size,
            counter.clone(),
            job_cancel.clone(),
        ));

        let transfer = self.transfer(&remote, variant.as_ref(), &resolved.destination, &counter, &job_cancel);
        let result = tokio::select! {
            biased;
            _ = job_cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
            res = transfer => res,
        };
        sampler.abort();
        let _ = sampler.await;

        match result {
            Ok(size) => {
                self.set_status(
                    &key,
                    &job.local_path,
                    &resolved.destination,
                    total_size.max(size),
                    total_size.max(size),
                    DownloadStatus::Completed,
                )
                .await;
                self.complete_for_destination(&resolved.destination).await?;
                Ok(DownloadStatus::Completed)
            }
            Err(e) => {
                self.cleanup_partials(&resolved.destination).await;
                if job_cancel.is_cancelled() && !self.cancel.is_cancelled() {
                    // a per-model sentinel interrupted us
                    self.mark_cancelled(&key, &job.local_path, &resolved.destination)
                        .await;
                    Ok(DownloadStatus::Cancelled)
                } else if self.cancel.is_cancelled() {
                    self.set_status(
                        &key,
                        &job.local_path,
                        &resolved.destination,
                        total_size,
                        counter.load(Ordering::Relaxed),
                        DownloadStatus::Cancelled,
                    )
                    .await;
                    Ok(DownloadStatus::Cancelled)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Fetch the transport object into place: either a plain object renamed
    /// from a `.download.tmp` sibling, or a `.tar.zst` stream extracted
    /// through the staging directory.
    async fn transfer(
        &self,
        remote: &RemotePath,
        variant: Option<&compression::CompressedVariant>,
        destination: &Utf8Path,
        counter: &Arc<AtomicU64>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        match variant {
            Some(v) => {
                let download = self
                    .storage
                    .download(&v.remote_path, cancel)
                    .await
                    .map_err(|e| anyhow::anyhow!("transport download: {e}"))?;
                compression::extract_streaming(
                    download.download_stream,
                    destination,
                    v.uncompressed_size,
                    counter.clone(),
                )
                .await
            }
            None => {
                let download = self
                    .storage
                    .download(remote, cancel)
                    .await
                    .map_err(|e| anyhow::anyhow!("download: {e}"))?;

                let tmp_path = download_tmp_path(destination);
                let mut reader =
                    CountingReader::new(StreamReader::new(download.download_stream), counter.clone());
                let mut file = tokio::fs::File::create(&tmp_path)
                    .await
                    .with_context(|| format!("failed to create {tmp_path}"))?;
                let copied = tokio::io::copy(&mut reader, &mut file)
                    .await
                    .context("transfer failed")?;
                file.sync_all().await.context("fsync of downloaded file")?;
                drop(file);
                tokio::fs::rename(&tmp_path, destination)
                    .await
                    .with_context(|| format!("failed to move download into {destination}"))?;
                Ok(copied)
            }
        }
    }

    /// Flush transferred byte counts into the progress store and watch for
    /// the per-model cancel sentinel while the transfer runs.
    async fn progress_sampler(
        self: Arc<Self>,
        key: ModelKey,
        local_path: Utf8PathBuf,
        destination: Utf8PathBuf,
        total_size: u64,
        counter: Arc<AtomicU64>,
        job_cancel: CancellationToken,
    ) {
        let sentinel = self.cancel_sentinel(&key);
        let mut last = 0u64;
        loop {
            tokio::time::sleep(SAMPLER_INTERVAL).await;
            if sentinel.exists() {
                info!("{key}: cancel sentinel observed mid-transfer");
                job_cancel.cancel();
                return;
            }
            let downloaded = counter.load(Ordering::Relaxed);
            if downloaded != last {
                last = downloaded;
                self.set_status(
                    &key,
                    &local_path,
                    &destination,
                    total_size,
                    downloaded,
                    DownloadStatus::Progress,
                )
                .await;
            }
        }
    }

    /// Symlink fan-out: materialize every registered consumer of the
    /// destination and mark them completed. The registration list is
    /// consumed in the process.
    async fn complete_for_destination(&self, destination: &Utf8Path) -> anyhow::Result<()> {
        let consumers = self.registry.take(destination)?;
        for consumer in consumers {
            if consumer.local_path != destination {
                if let Some(parent) = consumer.local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("failed to create {parent}"))?;
                }
                // whatever sits there now loses to the symlink
                match tokio::fs::symlink_metadata(&consumer.local_path).await {
                    Ok(_) => {
                        tokio::fs::remove_file(&consumer.local_path)
                            .await
                            .with_context(|| format!("failed to displace {}", consumer.local_path))?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).context("stat of symlink target"),
                }
                tokio::fs::symlink(destination, &consumer.local_path)
                    .await
                    .with_context(|| {
                        format!("failed to link {} -> {destination}", consumer.local_path)
                    })?;
                info!("linked {} -> {destination}", consumer.local_path);
            }
            let size = std::fs::metadata(destination).map(|m| m.len()).unwrap_or(0);
            self.set_status(
                &consumer.key(),
                &consumer.local_path,
                destination,
                size,
                size,
                DownloadStatus::Completed,
            )
            .await;
        }
        Ok(())
    }

    async fn cleanup_partials(&self, destination: &Utf8Path) {
        let tmp = download_tmp_path(destination);
        if tmp.exists() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        let staging = utils::crashsafe::path_with_suffix_extension(destination, "extract");
        if staging.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
    }

    async fn mark_cancelled(&self, key: &ModelKey, local_path: &Utf8Path, destination: &Utf8Path) {
        self.set_status(key, local_path, destination, 0, 0, DownloadStatus::Cancelled)
            .await;
        if let Err(e) = self.registry.unregister(&key.group, &key.model_name) {
            warn!("failed to unregister cancelled {key}: {e}");
        }
    }

    async fn set_status(
        &self,
        key: &ModelKey,
        local_path: &Utf8Path,
        destination: &Utf8Path,
        total_size: u64,
        downloaded: u64,
        status: DownloadStatus,
    ) {
        // keep the previously known total when the new caller has none
        let total_size = if total_size == 0 {
            self.progress.get(key).map(|r| r.total_size).unwrap_or(0)
        } else {
            total_size
        };
        let result = self
            .progress
            .update_and_notify(
                &*self.policy,
                DOWNLOAD_TYPE,
                key,
                ProgressRecord {
                    total_size,
                    downloaded,
                    status,
                    local_path: local_path.to_path_buf(),
                    download_destination: destination.to_path_buf(),
                    last_updated: None,
                },
            )
            .await;
        if let Err(e) = result {
            warn!("failed to persist progress for {key}: {e}");
        }
    }
}

fn download_tmp_path(destination: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{destination}.download.tmp"))
}

/// Touch the per-model cancel sentinel, excise the queue entry, flip the
/// progress record and drop the registry entry. Active workers observe the
/// sentinel at their next sampling tick.
pub async fn cancel_model<P: PolicyApi>(
    conf: &SyncConf,
    policy: &P,
    key: &ModelKey,
) -> anyhow::Result<()> {
    conf.ensure_state_dirs()?;
    std::fs::write(conf.cancel_sentinel_path(&key.group, &key.model_name), b"")
        .context("failed to write cancel sentinel")?;

    let queue = DownloadQueue::new(conf);
    let removed = queue.remove(&key.group, &key.model_name)?;
    if removed > 0 {
        info!("removed {removed} queued job(s) for {key}");
    }

    let progress = ProgressStore::new(conf);
    if let Some(record) = progress.get(key) {
        if !record.status.is_terminal() {
            progress
                .update_and_notify(
                    policy,
                    DOWNLOAD_TYPE,
                    key,
                    ProgressRecord {
                        status: DownloadStatus::Cancelled,
                        ..record
                    },
                )
                .await?;
        }
    }

    DestinationRegistry::new(conf).unregister(&key.group, &key.model_name)?;
    info!("cancelled {key}");
    Ok(())
}

/// Cancel whatever model claims `local_path`, looking through the queue
/// first and the progress records second.
pub async fn cancel_by_local_path<P: PolicyApi>(
    conf: &SyncConf,
    policy: &P,
    local_path: &Utf8Path,
) -> anyhow::Result<bool> {
    let queue = DownloadQueue::new(conf);
    if let Some(job) = queue.find_by_local_path(local_path) {
        cancel_model(conf, policy, &job.key()).await?;
        return Ok(true);
    }
    let progress = ProgressStore::new(conf);
    if let Some((key, _)) = progress.get_by_local_path(local_path) {
        cancel_model(conf, policy, &key).await?;
        return Ok(true);
    }
    warn!("nothing to cancel for {local_path}");
    Ok(false)
}

/// Cancel every queued and in-flight download and stop the worker: per-model
/// sentinels for everything known, plus the global stop sentinel the worker
/// drains on.
pub async fn cancel_all<P: PolicyApi>(conf: &SyncConf, policy: &P) -> anyhow::Result<()> {
    conf.ensure_state_dirs()?;
    std::fs::write(conf.stop_sentinel_path(), b"").context("failed to write stop sentinel")?;

    let queue = DownloadQueue::new(conf);
    for job in queue.snapshot() {
        cancel_model(conf, policy, &job.key()).await?;
    }

    let progress = ProgressStore::new(conf);
    for (group, models) in progress.snapshot() {
        for (model_name, record) in models {
            if record.status.is_active() {
                cancel_model(conf, policy, &ModelKey::new(group.clone(), model_name)).await?;
            }
        }
    }
    info!("cancelled all downloads, stop sentinel written");
    Ok(())
}
