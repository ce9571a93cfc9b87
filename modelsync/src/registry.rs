//! The destination registry: which catalog entries are waiting on which
//! physical download.
//!
//! Populated at enqueue time, consumed at download completion to decide
//! which symlinks to materialize. On disk it is a JSON map
//! `{destination: [{group, modelName, localPath}]}` under the
//! `registration` lock.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utils::crashsafe;
use utils::lock_file;

use crate::config::{SyncConf, CATALOG_LOCK_TTL};
use crate::ModelKey;

/// One consumer of a physical download destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredConsumer {
    pub group: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "localPath")]
    pub local_path: Utf8PathBuf,
}

impl RegisteredConsumer {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.group.clone(), self.model_name.clone())
    }
}

pub type RegistryData = BTreeMap<String, Vec<RegisteredConsumer>>;

pub struct DestinationRegistry {
    path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lock_timeout: Duration,
}

impl DestinationRegistry {
    pub fn new(conf: &SyncConf) -> Self {
        Self {
            path: conf.registry_path(),
            lock_path: conf.lock_path("registration"),
            lock_timeout: CATALOG_LOCK_TTL,
        }
    }

    fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut RegistryData) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let _guard = lock_file::acquire(&self.lock_path, self.lock_timeout, CATALOG_LOCK_TTL)
            .context("registration lock")?;
        let mut data = crashsafe::load_json_or_default(&self.path, RegistryData::new());
        let result = f(&mut data)?;
        crashsafe::overwrite_json(&self.path, &data).context("registry rewrite")?;
        Ok(result)
    }

    pub fn snapshot(&self) -> RegistryData {
        crashsafe::load_json_or_default(&self.path, RegistryData::new())
    }

    /// Add a consumer for `destination`; duplicates by `(group, modelName)`
    /// are collapsed.
    pub fn register(
        &self,
        destination: &Utf8Path,
        consumer: RegisteredConsumer,
    ) -> anyhow::Result<()> {
        self.with_lock(|data| {
            let consumers = data.entry(destination.to_string()).or_default();
            if !consumers
                .iter()
                .any(|c| c.group == consumer.group && c.model_name == consumer.model_name)
            {
                debug!("registering {} for destination {destination}", consumer.key());
                consumers.push(consumer);
            }
            Ok(())
        })
    }

    /// Remove and return all consumers registered for `destination`.
    pub fn take(&self, destination: &Utf8Path) -> anyhow::Result<Vec<RegisteredConsumer>> {
        self.with_lock(|data| Ok(data.remove(destination.as_str()).unwrap_or_default()))
    }

    /// Drop one model from whatever destinations it is registered against,
    /// pruning destinations that end up with no consumers.
    pub fn unregister(&self, group: &str, model_name: &str) -> anyhow::Result<()> {
        self.with_lock(|data| {
            for consumers in data.values_mut() {
                consumers.retain(|c| !(c.group == group && c.model_name == model_name));
            }
            data.retain(|_, consumers| !consumers.is_empty());
            Ok(())
        })
    }
}
