//! ElastiCache replication groups for `Redis` requests

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_elasticache::config::{BehaviorVersion, Credentials as SdkCredentials, Region};
use aws_sdk_elasticache::error::DisplayErrorContext;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use cro_common::crd::{ResourceKind, ResourceRequest};
use cro_common::identity::replication_group_id;
use cro_common::retry::{cancellable, poll_until_ok, PollConfig};
use cro_common::{Error, Result};

use super::{observed, AWS_STRATEGY, CREDENTIALS_PROVIDER_NAME};
use crate::credentials::{CredentialBroker, CredentialScope, Credentials};
use crate::provider::{
    CacheEndpoint, DeploymentDetails, ProvisionedInstance, Provider, ProviderOutcome,
};
use crate::strategy::StrategyConfig;

/// Provider name reported on status
pub const PROVIDER_NAME: &str = "aws-elasticache";

/// Owner of the per-namespace provider credentials
const PROVIDER_CREDENTIALS_OWNER: &str = "cloud-resources-aws-redis";

/// Actions the provider credentials need
pub const PROVIDER_ACTIONS: [&str; 3] = [
    "elasticache:CreateReplicationGroup",
    "elasticache:DescribeReplicationGroups",
    "elasticache:DeleteReplicationGroup",
];

const STATUS_AVAILABLE: &str = "available";
const STATUS_DELETING: &str = "deleting";

const DEFAULT_DESCRIPTION: &str = "A Redis replication group managed by the cloud resource operator";
const DEFAULT_CACHE_NODE_TYPE: &str = "cache.t3.micro";
const DEFAULT_ENGINE: &str = "redis";
const DEFAULT_ENGINE_VERSION: &str = "6.2";
const DEFAULT_NUM_CACHE_CLUSTERS: i32 = 3;
const DEFAULT_SNAPSHOT_RETENTION_LIMIT: i32 = 30;
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Replication group parameters as written in a tier's `createStrategy`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterConfig {
    /// Pin an explicit replication group id
    #[serde(default)]
    pub replication_group_id: Option<String>,
    /// Human-readable description
    #[serde(default)]
    pub replication_group_description: Option<String>,
    /// Node instance type
    #[serde(default)]
    pub cache_node_type: Option<String>,
    /// Cache engine
    #[serde(default)]
    pub engine: Option<String>,
    /// Engine version
    #[serde(default)]
    pub engine_version: Option<String>,
    /// Number of nodes in the group
    #[serde(default)]
    pub num_cache_clusters: Option<i32>,
    /// Multi-AZ automatic failover
    #[serde(default)]
    pub automatic_failover_enabled: Option<bool>,
    /// Days of snapshots kept
    #[serde(default)]
    pub snapshot_retention_limit: Option<i32>,
}

/// Fully-defaulted replication group parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRedisConfig {
    /// Replication group id
    pub replication_group_id: String,
    /// Description
    pub description: String,
    /// Node instance type
    pub cache_node_type: String,
    /// Cache engine
    pub engine: String,
    /// Engine version
    pub engine_version: String,
    /// Number of nodes
    pub num_cache_clusters: i32,
    /// Multi-AZ automatic failover
    pub automatic_failover_enabled: bool,
    /// Days of snapshots kept
    pub snapshot_retention_limit: i32,
}

impl RedisClusterConfig {
    /// Parse a tier payload
    pub fn from_strategy(tier: &str, strategy: &StrategyConfig) -> Result<Self> {
        serde_json::from_value(strategy.create_strategy.clone()).map_err(|e| {
            Error::malformed_strategy(ResourceKind::Redis.as_str(), tier, e.to_string())
        })
    }

    /// Fill every absent field from defaults
    pub fn with_defaults(self, request: &ResourceRequest) -> ResolvedRedisConfig {
        fn or(v: Option<String>, default: &str) -> String {
            v.filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.to_string())
        }

        ResolvedRedisConfig {
            replication_group_id: self
                .replication_group_id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| replication_group_id(request.namespace(), request.name())),
            description: or(self.replication_group_description, DEFAULT_DESCRIPTION),
            cache_node_type: or(self.cache_node_type, DEFAULT_CACHE_NODE_TYPE),
            engine: or(self.engine, DEFAULT_ENGINE),
            engine_version: or(self.engine_version, DEFAULT_ENGINE_VERSION),
            num_cache_clusters: self.num_cache_clusters.unwrap_or(DEFAULT_NUM_CACHE_CLUSTERS),
            automatic_failover_enabled: self.automatic_failover_enabled.unwrap_or(true),
            snapshot_retention_limit: self
                .snapshot_retention_limit
                .unwrap_or(DEFAULT_SNAPSHOT_RETENTION_LIMIT),
        }
    }
}

/// What the provider needs to know about an existing replication group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationGroup {
    /// Replication group id
    pub id: String,
    /// ElastiCache status string (creating, available, deleting, ...)
    pub status: String,
    /// Configuration endpoint, else the first node group's primary
    pub endpoint: Option<CacheEndpoint>,
}

/// The slice of the ElastiCache API the provider uses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ElastiCacheApi: Send + Sync {
    /// List all replication groups in the region
    async fn describe_replication_groups(&self) -> Result<Vec<ReplicationGroup>>;

    /// Start creating a replication group
    async fn create_replication_group(&self, config: &ResolvedRedisConfig) -> Result<()>;

    /// Start deleting a replication group; absent groups are not an error
    async fn delete_replication_group(&self, id: &str) -> Result<()>;
}

/// Builds an API client for a region and credential set
#[cfg_attr(test, automock)]
pub trait ElastiCacheConnector: Send + Sync {
    /// Connect to ElastiCache in `region`
    fn connect(&self, region: &str, credentials: &Credentials) -> Arc<dyn ElastiCacheApi>;
}

/// ElastiCache API backed by the AWS SDK
pub struct SdkElastiCache {
    client: aws_sdk_elasticache::Client,
}

fn sdk_error<E>(operation: &str, err: &E) -> Error
where
    E: std::error::Error,
{
    Error::external(PROVIDER_NAME, operation, DisplayErrorContext(err).to_string())
}

fn endpoint_from(ep: &aws_sdk_elasticache::types::Endpoint) -> Option<CacheEndpoint> {
    let address = ep.address().filter(|a| !a.is_empty())?;
    let port = ep
        .port()
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_REDIS_PORT);
    Some(CacheEndpoint {
        address: address.to_string(),
        port,
    })
}

impl From<&aws_sdk_elasticache::types::ReplicationGroup> for ReplicationGroup {
    fn from(rg: &aws_sdk_elasticache::types::ReplicationGroup) -> Self {
        let endpoint = rg.configuration_endpoint().and_then(endpoint_from).or_else(|| {
            rg.node_groups()
                .first()
                .and_then(|ng| ng.primary_endpoint())
                .and_then(endpoint_from)
        });
        Self {
            id: rg.replication_group_id().unwrap_or_default().to_string(),
            status: rg.status().unwrap_or_default().to_string(),
            endpoint,
        }
    }
}

#[async_trait]
impl ElastiCacheApi for SdkElastiCache {
    async fn describe_replication_groups(&self) -> Result<Vec<ReplicationGroup>> {
        let mut groups = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .client
                .describe_replication_groups()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| sdk_error("describe_replication_groups", &e))?;
            groups.extend(out.replication_groups().iter().map(ReplicationGroup::from));
            match out.marker() {
                Some(m) if !m.is_empty() => marker = Some(m.to_string()),
                _ => break,
            }
        }
        Ok(groups)
    }

    async fn create_replication_group(&self, config: &ResolvedRedisConfig) -> Result<()> {
        let result = self
            .client
            .create_replication_group()
            .replication_group_id(&config.replication_group_id)
            .replication_group_description(&config.description)
            .cache_node_type(&config.cache_node_type)
            .engine(&config.engine)
            .engine_version(&config.engine_version)
            .num_cache_clusters(config.num_cache_clusters)
            .automatic_failover_enabled(config.automatic_failover_enabled)
            .snapshot_retention_limit(config.snapshot_retention_limit)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_replication_group_already_exists_fault()) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error("create_replication_group", &e)),
        }
    }

    async fn delete_replication_group(&self, id: &str) -> Result<()> {
        let result = self
            .client
            .delete_replication_group()
            .replication_group_id(id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error().is_some_and(|se| {
                    se.is_replication_group_not_found_fault()
                        || se.is_invalid_replication_group_state_fault()
                }) =>
            {
                Ok(())
            }
            Err(e) => Err(sdk_error("delete_replication_group", &e)),
        }
    }
}

/// Connector producing [`SdkElastiCache`] clients from static credentials
#[derive(Clone, Copy, Debug, Default)]
pub struct SdkElastiCacheConnector;

impl ElastiCacheConnector for SdkElastiCacheConnector {
    fn connect(&self, region: &str, credentials: &Credentials) -> Arc<dyn ElastiCacheApi> {
        let creds = SdkCredentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.to_string(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        );
        let config = aws_sdk_elasticache::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .build();
        Arc::new(SdkElastiCache {
            client: aws_sdk_elasticache::Client::from_conf(config),
        })
    }
}

/// Redis provider for the `aws` strategy
pub struct AwsRedisProvider {
    broker: Arc<dyn CredentialBroker>,
    connector: Arc<dyn ElastiCacheConnector>,
    list_poll: PollConfig,
}

impl AwsRedisProvider {
    /// Create a provider
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        connector: Arc<dyn ElastiCacheConnector>,
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
    ) -> Result<Arc<dyn ElastiCacheApi>> {
        let scope =
            CredentialScope::new(request.namespace(), PROVIDER_CREDENTIALS_OWNER, &PROVIDER_ACTIONS);
        let credentials =
            cancellable(cancel, "reconcile_provider_credentials", self.broker.reconcile(&scope))
                .await?;
        Ok(self.connector.connect(&strategy.region, &credentials))
    }

    async fn find_group(
        &self,
        api: &Arc<dyn ElastiCacheApi>,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ReplicationGroup>> {
        let groups = poll_until_ok(&self.list_poll, "describe_replication_groups", cancel, || {
            let api = api.clone();
            async move {
                observed(
                    PROVIDER_NAME,
                    "describe_replication_groups",
                    api.describe_replication_groups().await,
                )
            }
        })
        .await?;
        Ok(groups.into_iter().find(|g| g.id == id))
    }
}

#[async_trait]
impl Provider for AwsRedisProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Redis
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
            RedisClusterConfig::from_strategy(&request.tier, strategy)?.with_defaults(request);
        let api = self.connect(request, strategy, cancel).await?;

        if let Some(group) = self
            .find_group(&api, &config.replication_group_id, cancel)
            .await?
        {
            return Ok(match (group.status.as_str(), group.endpoint) {
                (STATUS_AVAILABLE, Some(endpoint)) => {
                    debug!(id = %group.id, endpoint = %endpoint, "Replication group available");
                    ProviderOutcome::Ready(ProvisionedInstance {
                        provider: PROVIDER_NAME.to_string(),
                        details: DeploymentDetails::Cache { endpoint },
                    })
                }
                (status, _) => ProviderOutcome::pending(format!(
                    "replication group {} is {}",
                    group.id, status
                )),
            });
        }

        cancellable(
            cancel,
            "create_replication_group",
            async {
                observed(
                    PROVIDER_NAME,
                    "create_replication_group",
                    api.create_replication_group(&config).await,
                )
            },
        )
        .await?;
        info!(
            id = %config.replication_group_id,
            node_type = %config.cache_node_type,
            clusters = config.num_cache_clusters,
            "Replication group creation started"
        );
        Ok(ProviderOutcome::pending(format!(
            "replication group {} creation started",
            config.replication_group_id
        )))
    }

    #[instrument(skip_all, fields(request = %request.id, region = %strategy.region))]
    async fn delete(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let config =
            RedisClusterConfig::from_strategy(&request.tier, strategy)?.with_defaults(request);
        let api = self.connect(request, strategy, cancel).await?;

        match self
            .find_group(&api, &config.replication_group_id, cancel)
            .await?
        {
            None => {
                debug!(id = %config.replication_group_id, "Replication group already absent");
                Ok(())
            }
            Some(group) if group.status == STATUS_DELETING => {
                debug!(id = %group.id, "Replication group already deleting");
                Ok(())
            }
            Some(group) => {
                cancellable(cancel, "delete_replication_group", async {
                    observed(
                        PROVIDER_NAME,
                        "delete_replication_group",
                        api.delete_replication_group(&group.id).await,
                    )
                })
                .await?;
                info!(id = %group.id, "Replication group deletion started");
                Ok(())
            }
        }
    }
}
