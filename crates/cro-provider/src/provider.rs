//! Provider contract and the startup-time provider registry
//!
//! A provider owns one external API for one resource kind. Both operations
//! are idempotent and re-derive everything from remote state: a provider
//! keeps nothing in memory between passes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use cro_common::crd::{ResourceKind, ResourceRequest};
use cro_common::{Error, Result};

use crate::strategy::StrategyConfig;

/// Secret key for a cache host
pub const SECRET_KEY_URI: &str = "uri";
/// Secret key for a cache port
pub const SECRET_KEY_PORT: &str = "port";
/// Secret key for a bucket name
pub const SECRET_KEY_BUCKET_NAME: &str = "bucketName";
/// Secret key for a bucket region
pub const SECRET_KEY_BUCKET_REGION: &str = "bucketRegion";
/// Secret key for the bucket-owner access key id
pub const SECRET_KEY_CREDENTIAL_KEY_ID: &str = "credentialKeyID";
/// Secret key for the bucket-owner secret key
pub const SECRET_KEY_CREDENTIAL_SECRET_KEY: &str = "credentialSecretKey";

const BLOB_STORAGE_KEYS: [&str; 4] = [
    SECRET_KEY_BUCKET_NAME,
    SECRET_KEY_BUCKET_REGION,
    SECRET_KEY_CREDENTIAL_KEY_ID,
    SECRET_KEY_CREDENTIAL_SECRET_KEY,
];

/// Host and port of a cache endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEndpoint {
    /// Hostname or IP
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl fmt::Display for CacheEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Connection details of a provisioned resource
#[derive(Clone, PartialEq, Eq)]
pub enum DeploymentDetails {
    /// A cache cluster endpoint
    Cache {
        /// Primary or configuration endpoint
        endpoint: CacheEndpoint,
    },
    /// Bucket name, region and bucket-owner credentials
    BlobStorage {
        /// Secret data keyed by the `SECRET_KEY_*` constants
        data: BTreeMap<String, Vec<u8>>,
    },
}

impl fmt::Debug for DeploymentDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache { endpoint } => f
                .debug_struct("Cache")
                .field("endpoint", &endpoint.to_string())
                .finish(),
            Self::BlobStorage { data } => f
                .debug_struct("BlobStorage")
                .field("keys", &data.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

impl DeploymentDetails {
    /// Whether any field the secret needs is missing
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Cache { endpoint } => endpoint.address.is_empty() || endpoint.port == 0,
            Self::BlobStorage { data } => BLOB_STORAGE_KEYS
                .iter()
                .any(|k| data.get(*k).map_or(true, |v| v.is_empty())),
        }
    }

    /// Data written to the connection secret
    pub fn secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        match self {
            Self::Cache { endpoint } => BTreeMap::from([
                (SECRET_KEY_URI.to_string(), endpoint.address.as_bytes().to_vec()),
                (
                    SECRET_KEY_PORT.to_string(),
                    endpoint.port.to_string().into_bytes(),
                ),
            ]),
            Self::BlobStorage { data } => data.clone(),
        }
    }
}

/// A resource a provider found ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedInstance {
    /// Name of the provider that produced it
    pub provider: String,
    /// Connection details
    pub details: DeploymentDetails,
}

/// Result of a create-or-discover call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// Resource exists and is usable
    Ready(ProvisionedInstance),
    /// Resource is being created or is not ready yet
    Pending {
        /// Why the resource is not ready
        reason: String,
    },
}

impl ProviderOutcome {
    /// Pending outcome with a reason
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
        }
    }
}

/// Creates and deletes one kind of external resource
///
/// Implementations must race every external call against `cancel` and must
/// treat already-existing (create) and already-absent (delete) resources as
/// success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name reported on request status
    fn name(&self) -> &'static str;

    /// Resource kind this provider serves
    fn kind(&self) -> ResourceKind;

    /// Whether this provider implements the named deployment strategy
    fn supports_strategy(&self, strategy: &str) -> bool;

    /// Find the resource for `request`, creating it if absent
    async fn create_or_discover(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<ProviderOutcome>;

    /// Delete the resource for `request` if it exists
    async fn delete(
        &self,
        request: &ResourceRequest,
        strategy: &StrategyConfig,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Static map from (kind, strategy) to exactly one provider
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<(ResourceKind, String), Arc<dyn Provider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .providers
            .iter()
            .map(|((kind, strategy), p)| format!("{kind}/{strategy}={}", p.name()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &entries)
            .finish()
    }
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for its kind under `strategy`
    ///
    /// Fails if the provider does not support `strategy` or if another
    /// provider already holds the (kind, strategy) slot.
    pub fn register(&mut self, strategy: &str, provider: Arc<dyn Provider>) -> Result<()> {
        let kind = provider.kind();
        if !provider.supports_strategy(strategy) {
            return Err(Error::validation_for(
                "provider registry",
                format!(
                    "provider {} does not support strategy '{strategy}'",
                    provider.name()
                ),
            ));
        }

        let key = (kind, strategy.to_string());
        if let Some(existing) = self.providers.get(&key) {
            return Err(Error::validation_for(
                "provider registry",
                format!(
                    "duplicate provider for {kind}/{strategy}: {} already registered, rejecting {}",
                    existing.name(),
                    provider.name()
                ),
            ));
        }

        self.providers.insert(key, provider);
        Ok(())
    }

    /// Provider for `(kind, strategy)`
    pub fn select(&self, kind: ResourceKind, strategy: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&(kind, strategy.to_string()))
            .filter(|p| p.supports_strategy(strategy))
            .cloned()
            .ok_or_else(|| Error::unsupported_strategy(kind.as_str(), strategy))
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_provider(name: &'static str, kind: ResourceKind, strategy: &'static str) -> MockProvider {
        let mut p = MockProvider::new();
        p.expect_name().return_const(name);
        p.expect_kind().return_const(kind);
        p.expect_supports_strategy()
            .returning(move |s| s == strategy);
        p
    }

    #[test]
    fn select_returns_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("aws", Arc::new(mock_provider("aws-elasticache", ResourceKind::Redis, "aws")))
            .unwrap();
        registry
            .register("aws", Arc::new(mock_provider("aws-s3", ResourceKind::BlobStorage, "aws")))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.select(ResourceKind::Redis, "aws").unwrap().name(), "aws-elasticache");
        assert_eq!(registry.select(ResourceKind::BlobStorage, "aws").unwrap().name(), "aws-s3");
    }

    #[test]
    fn unknown_strategy_is_unsupported() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("aws", Arc::new(mock_provider("aws-elasticache", ResourceKind::Redis, "aws")))
            .unwrap();

        let err = registry.select(ResourceKind::Redis, "gcp").err().unwrap();
        assert!(matches!(err, Error::UnsupportedStrategy { .. }));
        assert!(err.is_configuration());
        let err = registry.select(ResourceKind::BlobStorage, "aws").err().unwrap();
        assert!(matches!(err, Error::UnsupportedStrategy { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("aws", Arc::new(mock_provider("first", ResourceKind::Redis, "aws")))
            .unwrap();
        let err = registry
            .register("aws", Arc::new(mock_provider("second", ResourceKind::Redis, "aws")))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(registry.select(ResourceKind::Redis, "aws").unwrap().name(), "first");
    }

    #[test]
    fn registering_unsupported_strategy_fails() {
        let mut registry = ProviderRegistry::new();
        let err = registry
            .register("openshift", Arc::new(mock_provider("aws-s3", ResourceKind::BlobStorage, "aws")))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn cache_details_map_to_uri_and_port() {
        let details = DeploymentDetails::Cache {
            endpoint: CacheEndpoint {
                address: "cache.abc.euw1.cache.amazonaws.com".to_string(),
                port: 6379,
            },
        };
        assert!(!details.is_empty());
        let data = details.secret_data();
        assert_eq!(data[SECRET_KEY_URI], b"cache.abc.euw1.cache.amazonaws.com".to_vec());
        assert_eq!(data[SECRET_KEY_PORT], b"6379".to_vec());
    }

    #[test]
    fn empty_details_are_detected() {
        let cache = DeploymentDetails::Cache {
            endpoint: CacheEndpoint {
                address: String::new(),
                port: 6379,
            },
        };
        assert!(cache.is_empty());

        let mut data: BTreeMap<String, Vec<u8>> = BLOB_STORAGE_KEYS
            .iter()
            .map(|k| (k.to_string(), b"x".to_vec()))
            .collect();
        assert!(!DeploymentDetails::BlobStorage { data: data.clone() }.is_empty());
        data.insert(SECRET_KEY_CREDENTIAL_SECRET_KEY.to_string(), Vec::new());
        assert!(DeploymentDetails::BlobStorage { data }.is_empty());
    }

    #[test]
    fn blob_debug_hides_values() {
        let details = DeploymentDetails::BlobStorage {
            data: BTreeMap::from([(
                SECRET_KEY_CREDENTIAL_SECRET_KEY.to_string(),
                b"hunter2".to_vec(),
            )]),
        };
        let out = format!("{details:?}");
        assert!(!out.contains("hunter2"));
        assert!(out.contains(SECRET_KEY_CREDENTIAL_SECRET_KEY));
    }
}
