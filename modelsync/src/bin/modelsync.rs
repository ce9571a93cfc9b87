//! One-shot batch entrypoint for the pod: run the upload reconciler, run the
//! download worker, enqueue or cancel downloads, or print progress.
//!
//! Exit code 0 on full success, 1 on any per-item failure. Cancellation is
//! not a failure.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use remote_storage::GenericRemoteStorage;
use tracing::info;

use modelsync::catalog::CatalogStore;
use modelsync::config::SyncConf;
use modelsync::policy::HttpPolicyClient;
use modelsync::progress::{aggregate, ProgressStore};
use modelsync::queue::{DownloadJob, DownloadQueue};
use modelsync::reconciler::UploadReconciler;
use modelsync::registry::DestinationRegistry;
use modelsync::resolver::resolve_destination;
use modelsync::worker::{self, DownloadWorker, WorkerExit};
use modelsync::ModelKey;

#[derive(Parser)]
#[command(version, about = "Model artifact distribution for pod volumes")]
struct Cli {
    /// Path to the modelsync config file.
    #[arg(long, default_value = "/etc/modelsync/config.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the local model tree against the object store.
    Sync {
        /// Directory root to walk; defaults to the configured models root.
        #[arg(long)]
        root: Option<Utf8PathBuf>,
        /// Remote base path uploads land under; defaults to the configured
        /// models prefix.
        #[arg(long)]
        remote_base: Option<String>,
        /// Tag for progress notifications.
        #[arg(long, default_value = "model_sync")]
        sync_type: String,
    },
    /// Run the download worker until the queue drains.
    Worker,
    /// Enqueue one catalog entry for download.
    Enqueue {
        #[arg(long)]
        group: String,
        #[arg(long)]
        model: String,
    },
    /// Enqueue every catalog entry whose local file is missing.
    EnqueueMissing,
    /// Cancel downloads: one model, one local path, or everything.
    Cancel {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        local_path: Option<Utf8PathBuf>,
        #[arg(long)]
        all: bool,
    },
    /// Print the aggregate download progress.
    Status,
}

fn job_for_entry(entry: &modelsync::catalog::ModelEntry) -> DownloadJob {
    let resolved = resolve_destination(&entry.local_path, &entry.original_remote_path);
    DownloadJob {
        group: entry.group.clone(),
        model_name: entry.model_name.clone(),
        source_remote_path: entry.original_remote_path.clone(),
        local_path: entry.local_path.clone(),
        download_destination: resolved.destination,
        total_size: entry.model_size,
        queued_at: None,
    }
}

fn enqueue_entry(conf: &SyncConf, entry: &modelsync::catalog::ModelEntry) -> anyhow::Result<()> {
    let queue = DownloadQueue::new(conf);
    let registry = DestinationRegistry::new(conf);
    let progress = ProgressStore::new(conf);
    let outcome = queue.enqueue(job_for_entry(entry), &registry, &progress)?;
    info!("{}/{}: {:?}", entry.group, entry.model_name, outcome);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let conf = Arc::new(SyncConf::load(&cli.config)?);
    conf.ensure_state_dirs()?;
    let policy = Arc::new(HttpPolicyClient::new(&conf));

    let storage = || -> anyhow::Result<GenericRemoteStorage> {
        let config = conf
            .remote_storage
            .as_ref()
            .context("no [remote_storage] section in config")?;
        GenericRemoteStorage::from_config(config)
    };

    match cli.command {
        Command::Sync {
            root,
            remote_base,
            sync_type,
        } => {
            let root = root.unwrap_or_else(|| conf.models_root.clone());
            let remote_base =
                remote_base.unwrap_or_else(|| conf.remote_models_prefix.clone());
            let reconciler = UploadReconciler::new(Arc::clone(&conf), storage()?, policy);
            let summary = reconciler
                .sync_local_models(&root, &remote_base, &sync_type)
                .await?;
            Ok(if summary.fully_successful() { 0 } else { 1 })
        }
        Command::Worker => {
            let worker = DownloadWorker::new(Arc::clone(&conf), storage()?, policy);
            match worker.run().await? {
                WorkerExit::Drained | WorkerExit::Stopped | WorkerExit::AlreadyRunning => Ok(0),
            }
        }
        Command::Enqueue { group, model } => {
            let catalog = CatalogStore::new(&conf);
            let entry = catalog
                .get(&group, &model)
                .with_context(|| format!("no catalog entry for {group}/{model}"))?;
            enqueue_entry(&conf, &entry)?;
            Ok(0)
        }
        Command::EnqueueMissing => {
            let catalog = CatalogStore::new(&conf);
            let entries = catalog.downloadable_entries();
            info!("enqueueing {} missing models", entries.len());
            for entry in &entries {
                enqueue_entry(&conf, entry)?;
            }
            Ok(0)
        }
        Command::Cancel {
            group,
            model,
            local_path,
            all,
        } => {
            if all {
                worker::cancel_all(conf.as_ref(), policy.as_ref()).await?;
            } else if let Some(local_path) = local_path {
                worker::cancel_by_local_path(conf.as_ref(), policy.as_ref(), &local_path).await?;
            } else {
                let (group, model) = group
                    .zip(model)
                    .context("--group and --model are required without --local-path/--all")?;
                worker::cancel_model(conf.as_ref(), policy.as_ref(), &ModelKey::new(group, model))
                    .await?;
            }
            Ok(0)
        }
        Command::Status => {
            let snapshot = ProgressStore::new(&conf).snapshot();
            let agg = aggregate(&snapshot);
            println!(
                "{} active, {}/{} bytes ({}%)",
                agg.active_count, agg.downloaded_bytes, agg.total_bytes, agg.percentage
            );
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::logging::init(utils::logging::Output::Stderr)?;
    let cli = Cli::parse();
    let code = run(cli).await?;
    std::process::exit(code);
}
