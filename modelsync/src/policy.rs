//! Client for the remote policy service.
//!
//! Two endpoints: sync-permission (consulted before any upload decision) and
//! download-progress (fire-and-forget notifications). Both carry pod and
//! user identity headers. Notification failures are logged and swallowed;
//! observability must never break work.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SyncConf;

/// Reason strings the policy service uses for decisions that require a
/// corrective catalog action. These are exact matches, part of the wire
/// contract.
pub mod reasons {
    pub const PARTIAL_UPLOAD: &str = "Partial upload detected";
    pub const INVALID_EXTENSION: &str = "Invalid file extension";
    pub const ALREADY_EXISTS: &str = "Model already exists at this exact path";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Replace,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingModel {
    #[serde(rename = "originalRemotePath")]
    pub original_remote_path: String,
    #[serde(rename = "modelName", default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDecision {
    #[serde(rename = "canSync")]
    pub can_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SyncAction>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(rename = "existingModel", default, skip_serializing_if = "Option::is_none")]
    pub existing_model: Option<ExistingModel>,
}

impl SyncDecision {
    /// The corrective action this decision demands from the caller's
    /// catalog, per the sync-permission contract.
    pub fn catalog_effect(&self) -> CatalogEffect<'_> {
        if self.can_sync {
            return CatalogEffect::Upload;
        }
        let reason = self.reason.as_deref().unwrap_or_default();
        if reason.contains(reasons::PARTIAL_UPLOAD) || reason.contains(reasons::INVALID_EXTENSION) {
            return CatalogEffect::RemoveEntry;
        }
        if reason == reasons::ALREADY_EXISTS {
            return CatalogEffect::None;
        }
        if let Some(existing) = &self.existing_model {
            return CatalogEffect::Relink {
                canonical_remote_path: &existing.original_remote_path,
            };
        }
        CatalogEffect::None
    }
}

/// What the catalog must do in response to a [`SyncDecision`].
#[derive(Debug, PartialEq, Eq)]
pub enum CatalogEffect<'a> {
    /// Proceed with the upload (new artifact or replacement).
    Upload,
    /// The local file is invalid (partial or wrong extension); drop the
    /// catalog entry.
    RemoveEntry,
    /// Point the entry at the server-chosen canonical artifact.
    Relink { canonical_remote_path: &'a str },
    /// Catalog already correct, or rejection with no prescribed action.
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncPermissionRequest {
    #[serde(rename = "remotePath")]
    pub remote_path: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
    pub group: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyStatus {
    Progress,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressNotification {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub download_type: String,
    pub status: NotifyStatus,
    pub percentage: u8,
    #[serde(rename = "modelName", skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("policy service transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("policy service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// The policy service surface the core depends on. The download worker and
/// the upload reconciler are generic over this, which is also what lets the
/// test suite run against a recording stub.
#[async_trait::async_trait]
pub trait PolicyApi: Send + Sync + 'static {
    async fn sync_permission(
        &self,
        request: SyncPermissionRequest,
    ) -> Result<SyncDecision, PolicyError>;

    /// Fire-and-forget: implementations report transport failures, callers
    /// are expected to ignore them.
    async fn notify_progress(&self, notification: ProgressNotification)
        -> Result<(), PolicyError>;
}

/// Production client over HTTPS.
pub struct HttpPolicyClient {
    http: reqwest::Client,
    base_url: String,
    pod_id: String,
    user_id: String,
    auth_token: Option<String>,
}

impl HttpPolicyClient {
    pub fn new(conf: &SyncConf) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: conf.policy_base_url.trim_end_matches('/').to_string(),
            pod_id: conf.pod_id.clone(),
            user_id: conf.user_id.clone(),
            auth_token: conf.policy_auth_token.clone(),
        }
    }

    fn request(&self, path: &str, body: &impl Serialize) -> reqwest::RequestBuilder {
        let url = format!("{}/pods/{}/{path}", self.base_url, self.pod_id);
        let mut builder = self
            .http
            .post(url)
            .header("X-Pod-Id", &self.pod_id)
            .header("X-User-Id", &self.user_id)
            .json(body);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send_checked(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, PolicyError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl PolicyApi for HttpPolicyClient {
    async fn sync_permission(
        &self,
        request: SyncPermissionRequest,
    ) -> Result<SyncDecision, PolicyError> {
        debug!(
            "sync-permission for {} (group {}, {} bytes)",
            request.remote_path, request.group, request.size
        );
        let response = Self::send_checked(self.request("sync-permission", &request)).await?;
        Ok(response.json().await?)
    }

    async fn notify_progress(
        &self,
        mut notification: ProgressNotification,
    ) -> Result<(), PolicyError> {
        notification.user_id = self.user_id.clone();
        Self::send_checked(self.request("download-progress", &notification)).await?;
        Ok(())
    }
}

/// Send a notification and swallow the outcome; every call site wants the
/// same "log and move on" treatment.
pub async fn notify_best_effort<P: PolicyApi>(policy: &P, notification: ProgressNotification) {
    let context = format!(
        "{} {:?} {}%",
        notification.download_type, notification.status, notification.percentage
    );
    if let Err(e) = policy.notify_progress(notification).await {
        warn!("progress notification failed ({context}): {e}");
    }
}
