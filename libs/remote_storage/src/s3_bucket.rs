//! AWS S3 storage wrapper around `aws-sdk-s3` library.
//!
//! Respects `prefix_in_bucket` property from the passed config, allowing
//! multiple pods to independently work with the same S3 bucket, if
//! their bucket prefixes are both specified and different.

use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_config::imds::credentials::ImdsCredentialsProvider;
use aws_config::meta::credentials::CredentialsProviderChain;
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_config::provider_config::ProviderConfig;
use aws_config::web_identity_token::WebIdentityTokenCredentialsProvider;
use aws_sdk_s3::config::{
    BehaviorVersion, Builder, IdentityCache, Region, SharedAsyncSleep, SharedCredentialsProvider,
};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_smithy_async::rt::sleep::TokioSleep;
use aws_smithy_types::body::SdkBody;
use bytes::Bytes;
use futures::stream::Stream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::{
    ConcurrencyLimiter, Download, DownloadError, Listing, ListingMode, ObjectSummary, RemotePath,
    RemoteStorage, S3Config, StorageMetadata, REMOTE_STORAGE_PREFIX_SEPARATOR,
};

#[derive(Debug, Clone, Copy)]
pub(super) enum RequestKind {
    Get,
    Put,
    Delete,
    List,
    Head,
}

/// AWS S3 storage.
pub struct S3Bucket {
    client: Client,
    bucket_name: String,
    prefix_in_bucket: Option<String>,
    max_keys_per_list_response: Option<i32>,
    concurrency_limiter: ConcurrencyLimiter,
    timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 storage, errors if incorrect AWS S3 configuration provided.
    pub fn new(remote_storage_config: &S3Config, timeout: Duration) -> anyhow::Result<Self> {
        let region = Some(Region::new(remote_storage_config.bucket_region.clone()));

        let provider_conf = ProviderConfig::without_region().with_region(region.clone());

        let credentials_provider = {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
            CredentialsProviderChain::first_try(
                "env",
                EnvironmentVariableCredentialsProvider::new(),
            )
            // uses "AWS_PROFILE" / `aws sso login --profile <profile>`
            .or_else(
                "profile-sso",
                ProfileFileCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses "AWS_WEB_IDENTITY_TOKEN_FILE", "AWS_ROLE_ARN", "AWS_ROLE_SESSION_NAME"
            // needed to access remote storage if pods run in EKS
            .or_else(
                "token",
                WebIdentityTokenCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses imds v2
            .or_else("imds", ImdsCredentialsProvider::builder().build())
        };

        let sleep_impl: Arc<dyn aws_smithy_async::rt::sleep::AsyncSleep> =
            Arc::new(TokioSleep::new());

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(region)
            .identity_cache(IdentityCache::lazy().build())
            .credentials_provider(SharedCredentialsProvider::new(credentials_provider))
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(custom_endpoint) = remote_storage_config.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        let prefix_in_bucket = remote_storage_config.prefix_in_bucket.as_deref().map(|prefix| {
            let mut prefix = prefix;
            while prefix.starts_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                prefix = &prefix[1..]
            }

            let mut prefix = prefix.to_string();
            while prefix.ends_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                prefix.pop();
            }
            prefix
        });

        Ok(Self {
            client,
            bucket_name: remote_storage_config.bucket_name.clone(),
            max_keys_per_list_response: remote_storage_config.max_keys_per_list_response,
            prefix_in_bucket,
            concurrency_limiter: ConcurrencyLimiter::new(
                remote_storage_config.concurrency_limit.get(),
            ),
            timeout,
        })
    }

    fn s3_object_to_relative_path(&self, key: &str) -> RemotePath {
        let relative_path =
            match key.strip_prefix(self.prefix_in_bucket.as_deref().unwrap_or_default()) {
                Some(stripped) => stripped,
                // we rely on AWS to return properly prefixed paths
                // for requests with a certain prefix
                None => panic!(
                    "Key {key} does not start with bucket prefix {:?}",
                    self.prefix_in_bucket
                ),
            };
        RemotePath(
            relative_path
                .split(REMOTE_STORAGE_PREFIX_SEPARATOR)
                .collect(),
        )
    }

    pub fn relative_path_to_s3_object(&self, path: &RemotePath) -> String {
        assert_eq!(std::path::MAIN_SEPARATOR, REMOTE_STORAGE_PREFIX_SEPARATOR);
        let path_string = path.get_path().as_str();
        match &self.prefix_in_bucket {
            Some(prefix) => prefix.clone() + "/" + path_string,
            None => path_string.to_string(),
        }
    }

    async fn permit(&self, kind: RequestKind) -> tokio::sync::SemaphorePermit<'_> {
        self.concurrency_limiter
            .acquire(kind)
            .await
            .expect("semaphore is never closed")
    }
}

impl RemoteStorage for S3Bucket {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        mode: ListingMode,
        max_keys: Option<NonZeroU32>,
        cancel: &CancellationToken,
    ) -> Result<Listing, DownloadError> {
        let kind = RequestKind::List;
        let _permit = self.permit(kind).await;

        let mut result = Listing::default();

        // get the passed prefix or if it is not set use prefix_in_bucket value
        let list_prefix = prefix
            .map(|p| self.relative_path_to_s3_object(p))
            .or_else(|| self.prefix_in_bucket.clone())
            .map(|mut p| {
                // required to end with a separator
                // otherwise request will return only the entry of a prefix
                if !p.ends_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                    p.push(REMOTE_STORAGE_PREFIX_SEPARATOR);
                }
                p
            });

        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket_name.clone())
                .set_prefix(list_prefix.clone())
                .set_continuation_token(continuation_token.take())
                .set_max_keys(self.max_keys_per_list_response);

            if let ListingMode::WithDelimiter = mode {
                request = request.delimiter(REMOTE_STORAGE_PREFIX_SEPARATOR.to_string());
            }

            let response = tokio::select! {
                res = request.send() => res,
                _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
            .context("Failed to list S3 prefixes")
            .map_err(DownloadError::Other)?;

            result.prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|o| Some(self.s3_object_to_relative_path(o.prefix()?))),
            );

            result.keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| Some(self.s3_object_to_relative_path(o.key()?))),
            );

            if let Some(max) = max_keys {
                if result.keys.len() >= max.get() as usize {
                    result.keys.truncate(max.get() as usize);
                    break;
                }
            }

            match response.next_continuation_token {
                Some(new_token) => continuation_token = Some(new_token),
                None => break,
            }
        }

        Ok(result)
    }

    async fn head(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<ObjectSummary, DownloadError> {
        let kind = RequestKind::Head;
        let _permit = self.permit(kind).await;

        let request = self
            .client
            .head_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        match response {
            Ok(output) => Ok(ObjectSummary {
                size: output.content_length.unwrap_or_default() as u64,
                last_modified: output
                    .last_modified
                    .and_then(|t| SystemTime::try_from(t).ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
                metadata: output.metadata.map(StorageMetadata),
            }),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Err(DownloadError::NotFound)
            }
            Err(e) => Err(DownloadError::Other(
                anyhow::Error::new(e).context("Failed to HEAD S3 object"),
            )),
        }
    }

    async fn upload(
        &self,
        from: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        from_size_bytes: usize,
        to: &RemotePath,
        metadata: Option<StorageMetadata>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let kind = RequestKind::Put;
        let _permit = self.permit(kind).await;

        let body = hyper0::Body::wrap_stream(from);
        let bytes_stream = ByteStream::new(SdkBody::from_body_0_4(body));

        let request = self
            .client
            .put_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(to))
            .set_metadata(metadata.map(|m| m.0))
            .content_length(from_size_bytes.try_into()?)
            .body(bytes_stream)
            .send();

        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("upload timed out"),
            _ = cancel.cancelled() => anyhow::bail!("upload cancelled"),
        };

        response.context("Failed to upload S3 object")?;
        Ok(())
    }

    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        let kind = RequestKind::Get;
        let _permit = self.permit(kind).await;

        let request = self
            .client
            .get_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(from))
            .send();

        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => return Err(DownloadError::Timeout),
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        match response {
            Ok(output) => {
                let metadata = output.metadata.map(StorageMetadata);
                let last_modified = output
                    .last_modified
                    .and_then(|t| SystemTime::try_from(t).ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);

                let body = output.body;
                let download_stream: Pin<
                    Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>,
                > = Box::pin(ReaderStream::new(body.into_async_read()));

                Ok(Download {
                    download_stream,
                    last_modified,
                    metadata,
                })
            }
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                Err(DownloadError::NotFound)
            }
            Err(e) => Err(DownloadError::Other(
                anyhow::Error::new(e).context("Failed to download S3 object"),
            )),
        }
    }

    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken) -> anyhow::Result<()> {
        let kind = RequestKind::Delete;
        let _permit = self.permit(kind).await;

        let request = self
            .client
            .delete_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let response = tokio::select! {
            res = request => res,
            _ = tokio::time::sleep(self.timeout) => anyhow::bail!("delete timed out"),
            _ = cancel.cancelled() => anyhow::bail!("delete cancelled"),
        };

        response.context("Failed to delete S3 object")?;
        Ok(())
    }
}
