//! S3 buckets for `BlobStorage` requests
//!
//! Besides the bucket itself the provider issues a second, narrower grant:
//! bucket-owner credentials limited to object access on that one bucket.
//! Those are what end up in the request's secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials as SdkCredentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use cro_common::crd::{ResourceKind, ResourceRequest};
use cro_common::identity::bucket_name;
use cro_common::retry::{cancellable, poll_until_ok, PollConfig};
use cro_common::{Error, Result};

use super::{observed, AWS_STRATEGY, CREDENTIALS_PROVIDER_NAME};
use crate::credentials::{CredentialBroker, CredentialScope, Credentials};
use crate::provider::{
    DeploymentDetails, ProvisionedInstance, Provider, ProviderOutcome, SECRET_KEY_BUCKET_NAME,
    SECRET_KEY_BUCKET_REGION, SECRET_KEY_CREDENTIAL_KEY_ID, SECRET_KEY_CREDENTIAL_SECRET_KEY,
};
use crate::strategy::StrategyConfig;

/// Provider name reported on status
pub const PROVIDER_NAME: &str = "aws-s3";

const PROVIDER_CREDENTIALS_OWNER: &str = "cloud-resources-aws-s3";

/// Actions the provider credentials need
pub const PROVIDER_ACTIONS: [&str; 5] = [
    "s3:CreateBucket",
    "s3:ListAllMyBuckets",
    "s3:DeleteBucket",
    "s3:ListBucket",
    "s3:DeleteObject",
];

/// Actions granted to the bucket owner, on the bucket only
pub const BUCKET_OWNER_ACTIONS: [&str; 4] = [
    "s3:PutObject",
    "s3:GetObject",
    "s3:DeleteObject",
    "s3:ListBucket",
];

// Buckets in this region must not carry a location constraint
const US_EAST_1: &str = "us-east-1";

/// Bucket parameters as written in a tier's `createStrategy`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobStorageConfig {
    /// Pin an explicit bucket name
    #[serde(default)]
    pub bucket_name: Option<String>,
    /// Empty the bucket before deleting it
    #[serde(default)]
    pub force_bucket_deletion: Option<bool>,
}

/// Fully-defaulted bucket parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBlobStorageConfig {
    /// Bucket name
    pub bucket_name: String,
    /// Empty the bucket before deleting it
    pub force_bucket_deletion: bool,
}

impl BlobStorageConfig {
    /// Parse a tier payload
    pub fn from_strategy(tier: &str, strategy: &StrategyConfig) -> Result<Self> {
        serde_json::from_value(strategy.create_strategy.clone()).map_err(|e| {
            Error::malformed_strategy(ResourceKind::BlobStorage.as_str(), tier, e.to_string())
        })
    }

    /// Fill every absent field from defaults
    pub fn with_defaults(self, request: &ResourceRequest) -> ResolvedBlobStorageConfig {
        ResolvedBlobStorageConfig {
            bucket_name: self
                .bucket_name
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| bucket_name(request.namespace(), request.name())),
            force_bucket_deletion: self.force_bucket_deletion.unwrap_or(false),
        }
    }
}

/// The slice of the S3 API the provider uses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait S3Api: Send + Sync {
    /// Names of all buckets owned by the caller
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Create a bucket in `region`; a bucket we already own is not an error
    async fn create_bucket(&self, name: &str, region: &str) -> Result<()>;

    /// Remove every object from a bucket
    async fn delete_all_objects(&self, name: &str) -> Result<()>;

    /// Delete an empty bucket; an absent bucket is not an error
    async fn delete_bucket(&self, name: &str) -> Result<()>;
}

/// Builds an API client for a region and credential set
#[cfg_attr(test, automock)]
pub trait S3Connector: Send + Sync {
    /// Connect to S3 in `region`
    fn connect(&self, region: &str, credentials: &Credentials) -> Arc<dyn S3Api>;
}

/// S3 API backed by the AWS SDK
pub struct SdkS3 {
    client: aws_sdk_s3::Client,
}

fn sdk_error<E>(operation: &str, err: &E) -> Error
where
    E: std::error::Error,
{
    Error::external(PROVIDER_NAME, operation, DisplayErrorContext(err).to_string())
}

fn is_no_such_bucket<E: ProvideErrorMetadata>(err: &E) -> bool {
    err.code() == Some("NoSuchBucket")
}

#[async_trait]
impl S3Api for SdkS3 {
    async fn list_buckets(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_buckets()
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| sdk_error("list_buckets", &e))?;
            names.extend(
                out.buckets()
                    .iter()
                    .filter_map(|b| b.name())
                    .map(str::to_string),
            );
            match out.continuation_token() {
                Some(t) if !t.is_empty() => token = Some(t.to_string()),
                _ => break,
            }
        }
        Ok(names)
    }

    async fn create_bucket(&self, name: &str, region: &str) -> Result<()> {
        let mut req = self.client.create_bucket().bucket(name);
        if region != US_EAST_1 {
            req = req.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match req.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error("create_bucket", &e)),
        }
    }

    async fn delete_all_objects(&self, name: &str) -> Result<()> {
        let mut token: Option<String> = None;
        loop {
            let out = match self
                .client
                .list_objects_v2()
                .bucket(name)
                .set_continuation_token(token.take())
                .send()
                .await
            {
                Ok(out) => out,
                Err(e) if is_no_such_bucket(&e) => return Ok(()),
                Err(e) => return Err(sdk_error("list_objects_v2", &e)),
            };

            let objects = out
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::internal_with_context("delete_all_objects", e.to_string()))?;

            if !objects.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|e| {
                        Error::internal_with_context("delete_all_objects", e.to_string())
                    })?;
                self.client
                    .delete_objects()
                    .bucket(name)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| sdk_error("delete_objects", &e))?;
            }

            match out.next_continuation_token() {
                Some(t) if out.is_truncated() == Some(true) => token = Some(t.to_string()),
                _ => break,
            }
        }
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        match self.client.delete_bucket().bucket(name).send().await {
            Ok(_) => Ok(()),
            Err(e) if is_no_such_bucket(&e) => Ok(()),
            Err(e) => Err(sdk_error("delete_bucket", &e)),
        }
    }
}

/// Connector producing [`SdkS3`] clients from static credentials
#[derive(Clone, Copy, Debug, Default)]
pub struct SdkS3Connector;

impl S3Connector for SdkS3Connector {
    fn connect(&self, region: &str, credentials: &Credentials) -> Arc<dyn S3Api> {
        let creds = SdkCredentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.to_string(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .build();
        Arc::new(SdkS3 {
            client: aws_sdk_s3::Client::from_conf(config),
        })
    }
}

/// Blob storage provider for the `aws` strategy
pub struct AwsBlobStorageProvider {
    broker: Arc<dyn CredentialBroker>,
    connector: Arc<dyn S3Connector>,
    list_poll: PollConfig,
}

impl AwsBlobStorageProvider {
    /// Create a provider
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        connector: Arc<dyn S3Connector>,
        list_poll: PollConfig,
    ) -> Self {
        Self {
            broker,
            connector,
            list_poll,
        }
    }

    async fn connect(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn S3Api>> {
        let scope =
            CredentialScope::new(request.namespace(), PROVIDER_CREDENTIALS_OWNER, &PROVIDER_ACTIONS);
        let credentials =
            cancellable(cancel, "reconcile_provider_credentials", self.broker.reconcile(&scope))
                .await?;
        Ok(self.connector.connect(&strategy.region, &credentials))
    }

    async fn bucket_exists(
        &self,
        api: &Arc<dyn S3Api>,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let names = poll_until_ok(&self.list_poll, "list_buckets", cancel, || {
            let api = api.clone();
            async move { observed(PROVIDER_NAME, "list_buckets", api.list_buckets().await) }
        })
        .await?;
        Ok(names.iter().any(|n| n == bucket))
    }

    /// Grant object access on `bucket` to the request's owner
    ///
    /// The grant is owned by the request, so it is revoked together with the
    /// request once the bucket has been deleted and the finalizer released.
    async fn bucket_owner_credentials(
        &self,
        request: &ResourceRequest,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        let scope = CredentialScope::new(
            request.namespace(),
            format!("{}-bucket-owner", request.name()),
            &BUCKET_OWNER_ACTIONS,
        )
        .on_resources([
            format!("arn:aws:s3:::{bucket}"),
            format!("arn:aws:s3:::{bucket}/*"),
        ])
        .owned_by(request.owner_reference());
        cancellable(cancel, "reconcile_bucket_owner_credentials", self.broker.reconcile(&scope))
            .await
    }
}

#[async_trait]
impl Provider for AwsBlobStorageProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::BlobStorage
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == AWS_STRATEGY
    }

    #[instrument(skip_all, fields(request = %request.id, region = %strategy.region))]
    async fn create_or_discover(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutcome> {
        let config =
            BlobStorageConfig::from_strategy(&request.tier, strategy)?.with_defaults(request);
        let api = self.connect(request, strategy, cancel).await?;

        if !self.bucket_exists(&api, &config.bucket_name, cancel).await? {
            cancellable(cancel, "create_bucket", async {
                observed(
                    PROVIDER_NAME,
                    "create_bucket",
                    api.create_bucket(&config.bucket_name, &strategy.region).await,
                )
            })
            .await?;
            info!(bucket = %config.bucket_name, "Bucket creation started");
            return Ok(ProviderOutcome::pending(format!(
                "bucket {} creation started",
                config.bucket_name
            )));
        }

        let owner = self
            .bucket_owner_credentials(request, &config.bucket_name, cancel)
            .await?;
        debug!(bucket = %config.bucket_name, "Bucket available");

        let data = BTreeMap::from([
            (
                SECRET_KEY_BUCKET_NAME.to_string(),
                config.bucket_name.as_bytes().to_vec(),
            ),
            (
                SECRET_KEY_BUCKET_REGION.to_string(),
                strategy.region.as_bytes().to_vec(),
            ),
            (
                SECRET_KEY_CREDENTIAL_KEY_ID.to_string(),
                owner.access_key_id.as_bytes().to_vec(),
            ),
            (
                SECRET_KEY_CREDENTIAL_SECRET_KEY.to_string(),
                owner.secret_access_key.as_bytes().to_vec(),
            ),
        ]);

        Ok(ProviderOutcome::Ready(ProvisionedInstance {
            provider: PROVIDER_NAME.to_string(),
            details: DeploymentDetails::BlobStorage { data },
        }))
    }

    #[instrument(skip_all, fields(request = %request.id, region = %strategy.region))]
    async fn delete(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let config =
            BlobStorageConfig::from_strategy(&request.tier, strategy)?.with_defaults(request);
        let api = self.connect(request, strategy, cancel).await?;

        if !self.bucket_exists(&api, &config.bucket_name, cancel).await? {
            debug!(bucket = %config.bucket_name, "Bucket already absent");
            return Ok(());
        }

        if config.force_bucket_deletion {
            cancellable(cancel, "delete_all_objects", async {
                observed(
                    PROVIDER_NAME,
                    "delete_all_objects",
                    api.delete_all_objects(&config.bucket_name).await,
                )
            })
            .await?;
        }

        cancellable(cancel, "delete_bucket", async {
            observed(
                PROVIDER_NAME,
                "delete_bucket",
                api.delete_bucket(&config.bucket_name).await,
            )
        })
        .await?;
        info!(bucket = %config.bucket_name, "Bucket deleted");
        Ok(())
    }
}
