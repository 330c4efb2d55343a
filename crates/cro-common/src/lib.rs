//! Common types for the cloud resource operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer placed on every request before any external resource is created
pub const CLOUD_RESOURCE_FINALIZER: &str = "cloud-resources-operator.integreatly.org/finalizers";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "cloud-resource-operator";

/// Namespace holding the strategy ConfigMap when none is configured
pub const DEFAULT_CONFIG_NAMESPACE: &str = "kube-system";

/// Name of the ConfigMap mapping resource kind -> tier -> strategy payload
pub const DEFAULT_STRATEGY_CONFIG_MAP: &str = "cloud-resources-strategies";

/// Requeue interval for pending provisioning and health re-confirmation
pub const REQUEUE_PROVISIONING_SECS: u64 = 30;

/// Resync interval for requests stuck on a configuration error
pub const REQUEUE_CONFIG_ERROR_SECS: u64 = 300;

/// Label key identifying resources owned by the operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_OPERATOR: &str = "cloud-resource-operator";
