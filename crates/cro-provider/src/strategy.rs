//! Strategy resolution: (resource kind, tier) -> deployment strategy
//!
//! Strategies live in a ConfigMap keyed by resource kind. Each value is a JSON
//! object keyed by tier:
//!
//! ```json
//! {
//!   "development": { "region": "eu-west-1", "createStrategy": {} },
//!   "production":  { "strategy": "aws", "createStrategy": { "numCacheClusters": 3 } }
//! }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use cro_common::crd::ResourceKind;
use cro_common::kube_utils::get_config_map_value;
use cro_common::{Error, Result, DEFAULT_CONFIG_NAMESPACE, DEFAULT_STRATEGY_CONFIG_MAP};

/// Strategy used when a tier does not name one
pub const DEFAULT_STRATEGY: &str = "aws";

/// Region used when a tier does not name one
pub const DEFAULT_REGION: &str = "eu-west-1";

/// Resolved configuration for one (kind, tier)
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyConfig {
    /// Deployment backend name
    pub strategy: String,
    /// Cloud region
    pub region: String,
    /// Provider-specific create parameters, always a JSON object
    pub create_strategy: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTier {
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    create_strategy: Option<Value>,
}

/// Parse the tier map stored for one kind and pick out `tier`.
///
/// An absent tier is [`Error::StrategyNotFound`]; anything that fails to
/// parse is [`Error::MalformedStrategy`].
pub fn parse_tier(kind: ResourceKind, tier: &str, document: &str) -> Result<StrategyConfig> {
    let tiers: BTreeMap<String, Value> = serde_json::from_str(document)
        .map_err(|e| Error::malformed_strategy(kind.as_str(), tier, e.to_string()))?;

    let entry = tiers
        .get(tier)
        .ok_or_else(|| Error::strategy_not_found(kind.as_str(), tier, "tier not present"))?;

    let raw: RawTier = serde_json::from_value(entry.clone())
        .map_err(|e| Error::malformed_strategy(kind.as_str(), tier, e.to_string()))?;

    let create_strategy = match raw.create_strategy {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v @ Value::Object(_)) => v,
        // Some tiers carry the payload as an embedded JSON string
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Default::default()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                return Err(Error::malformed_strategy(
                    kind.as_str(),
                    tier,
                    "createStrategy must be a JSON object",
                ))
            }
            Err(e) => return Err(Error::malformed_strategy(kind.as_str(), tier, e.to_string())),
        },
        Some(_) => {
            return Err(Error::malformed_strategy(
                kind.as_str(),
                tier,
                "createStrategy must be a JSON object",
            ))
        }
    };

    Ok(StrategyConfig {
        strategy: non_empty_or(raw.strategy, DEFAULT_STRATEGY),
        region: non_empty_or(raw.region, DEFAULT_REGION),
        create_strategy,
    })
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Resolves the strategy for a request's kind and tier
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StrategyResolver: Send + Sync {
    /// Return the strategy configured for `(kind, tier)`
    async fn resolve(&self, kind: ResourceKind, tier: &str) -> Result<StrategyConfig>;
}

/// Reads strategies from a ConfigMap on every call
pub struct ConfigMapStrategyResolver {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapStrategyResolver {
    /// Create a resolver reading `namespace/name`
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resolver for the default ConfigMap in the default namespace
    pub fn with_defaults(client: Client) -> Self {
        Self::new(client, DEFAULT_CONFIG_NAMESPACE, DEFAULT_STRATEGY_CONFIG_MAP)
    }
}

#[async_trait]
impl StrategyResolver for ConfigMapStrategyResolver {
    async fn resolve(&self, kind: ResourceKind, tier: &str) -> Result<StrategyConfig> {
        let document =
            get_config_map_value(&self.client, &self.name, &self.namespace, kind.as_str())
                .await?
                .ok_or_else(|| {
                    Error::strategy_not_found(
                        kind.as_str(),
                        tier,
                        format!(
                            "config map {}/{} has no '{}' entry",
                            self.namespace,
                            self.name,
                            kind.as_str()
                        ),
                    )
                })?;

        let config = parse_tier(kind, tier, &document)?;
        debug!(
            kind = %kind,
            tier = %tier,
            strategy = %config.strategy,
            region = %config.region,
            "Resolved strategy"
        );
        Ok(config)
    }
}

/// In-memory resolver, used with `--strategy-file` and in tests
#[derive(Clone, Debug, Default)]
pub struct StaticStrategyResolver {
    documents: BTreeMap<ResourceKind, String>,
}

impl StaticStrategyResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tier map for one kind
    pub fn with_kind(mut self, kind: ResourceKind, document: impl Into<String>) -> Self {
        self.documents.insert(kind, document.into());
        self
    }

    /// Load a document shaped like the ConfigMap data:
    /// `{ "redis": { "<tier>": {...} }, "blobstorage": { ... } }`
    pub fn from_json(document: &str) -> Result<Self> {
        let kinds: BTreeMap<String, Value> = serde_json::from_str(document)
            .map_err(|e| Error::validation_for("strategy file", e.to_string()))?;
        let mut resolver = Self::new();
        for (kind, tiers) in kinds {
            let kind: ResourceKind = kind.parse()?;
            // ConfigMap values are strings; accept both forms here
            let doc = match tiers {
                Value::String(s) => s,
                other => other.to_string(),
            };
            resolver.documents.insert(kind, doc);
        }
        Ok(resolver)
    }
}

#[async_trait]
impl StrategyResolver for StaticStrategyResolver {
    async fn resolve(&self, kind: ResourceKind, tier: &str) -> Result<StrategyConfig> {
        let document = self.documents.get(&kind).ok_or_else(|| {
            Error::strategy_not_found(kind.as_str(), tier, "no strategies for kind")
        })?;
        parse_tier(kind, tier, document)
    }
}
