//! Error types for the cloud resource operator
//!
//! Errors carry the request, kind, or provider they relate to so that the
//! message surfaced on a resource status is actionable on its own. Variants
//! fall into three classes that drive how the caller reschedules a pass:
//!
//! - configuration errors need an operator to fix a tier or the request spec
//! - external-call errors are transient and are retried with backoff
//! - invariant violations are bugs in a provider and are surfaced loudly
//!
//! "Still provisioning" is deliberately not an error; providers signal it with
//! a dedicated outcome.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cloud resource operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// No strategy is configured for the requested kind and tier
    #[error("no strategy configured for {kind} tier '{tier}': {reason}")]
    StrategyNotFound {
        /// Resource kind the lookup was keyed by
        kind: String,
        /// Tier name that was requested
        tier: String,
        /// Which part of the lookup was missing
        reason: String,
    },

    /// The strategy payload for a tier exists but cannot be parsed
    #[error("malformed strategy for {kind} tier '{tier}': {message}")]
    MalformedStrategy {
        /// Resource kind the lookup was keyed by
        kind: String,
        /// Tier name that was requested
        tier: String,
        /// Parser error
        message: String,
    },

    /// No registered provider serves the resolved strategy
    #[error("unsupported deployment strategy '{strategy}' for {kind}")]
    UnsupportedStrategy {
        /// Resource kind being reconciled
        kind: String,
        /// Strategy name from the resolved config
        strategy: String,
    },

    /// Invalid request spec or operator configuration
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Request or component with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// A call to the external provider API failed
    #[error("provider error [{provider}] during {operation}: {message}")]
    ExternalCall {
        /// Provider name (e.g. "aws")
        provider: String,
        /// Operation that failed (e.g. "create_replication_group")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Issuing or reading provider credentials failed
    #[error("credential error for namespace {namespace}: {message}")]
    Credentials {
        /// Namespace the credentials are scoped to
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// A bounded poll exceeded its ceiling
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout {
        /// Operation that was being polled
        operation: String,
        /// How long the poll ran
        waited: Duration,
    },

    /// The pass was cancelled at an external-call boundary
    #[error("cancelled before {operation} completed")]
    Cancelled {
        /// Operation that was interrupted
        operation: String,
    },

    /// A provider returned a result that breaks its contract
    #[error("invariant violated for {resource}: {message}")]
    InvariantViolation {
        /// Request being reconciled
        resource: String,
        /// Description of the broken invariant
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "runner")
        context: String,
    },
}

impl Error {
    /// Create a strategy-not-found error
    pub fn strategy_not_found(
        kind: impl Into<String>,
        tier: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StrategyNotFound {
            kind: kind.into(),
            tier: tier.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-strategy error
    pub fn malformed_strategy(
        kind: impl Into<String>,
        tier: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::MalformedStrategy {
            kind: kind.into(),
            tier: tier.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported-strategy error
    pub fn unsupported_strategy(kind: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self::UnsupportedStrategy {
            kind: kind.into(),
            strategy: strategy.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an external-call error
    pub fn external(
        provider: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ExternalCall {
            provider: provider.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a credential issuance error
    pub fn credentials(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvariantViolation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error needs a configuration or spec change to resolve
    ///
    /// Configuration errors are surfaced on the request status and resynced
    /// on a fixed interval instead of being retried with growing backoff.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::StrategyNotFound { .. }
                | Error::MalformedStrategy { .. }
                | Error::UnsupportedStrategy { .. }
                | Error::Validation { .. }
        )
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses other than conflicts are treated as permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Serialization { .. } => false,
            e if e.is_configuration() => false,
            _ => true,
        }
    }

    /// Short label for metrics and logs
    pub fn class(&self) -> &'static str {
        match self {
            e if e.is_configuration() => "configuration",
            Error::InvariantViolation { .. } => "invariant",
            Error::Cancelled { .. } => "cancelled",
            Error::Serialization { .. } | Error::Internal { .. } => "internal",
            _ => "external",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_errors_are_distinct_configuration_errors() {
        let missing = Error::strategy_not_found("redis", "gold", "tier not present");
        let malformed = Error::malformed_strategy("redis", "gold", "expected value at line 1");

        assert!(matches!(missing, Error::StrategyNotFound { .. }));
        assert!(matches!(malformed, Error::MalformedStrategy { .. }));
        assert!(missing.is_configuration());
        assert!(malformed.is_configuration());
        assert!(!missing.is_retryable());
        assert!(!malformed.is_retryable());
        assert!(missing.to_string().contains("gold"));
        assert!(malformed.to_string().contains("malformed"));
    }

    #[test]
    fn unsupported_strategy_is_configuration() {
        let err = Error::unsupported_strategy("blobstorage", "gcp");
        assert!(err.is_configuration());
        assert_eq!(err.class(), "configuration");
        assert!(err.to_string().contains("gcp"));
    }

    #[test]
    fn external_errors_are_retryable() {
        let err = Error::external("aws", "describe_replication_groups", "throttled");
        assert!(err.is_retryable());
        assert!(!err.is_configuration());
        assert_eq!(err.class(), "external");
        assert!(err.to_string().contains("[aws]"));

        assert!(Error::credentials("team-a", "secret not provisioned").is_retryable());
        assert!(Error::timeout("list", Duration::from_secs(300)).is_retryable());
    }

    #[test]
    fn invariant_violation_has_its_own_class() {
        let err = Error::invariant("redis/ns/cache", "empty deployment details");
        assert_eq!(err.class(), "invariant");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("redis/ns/cache"));
    }

    #[test]
    fn serialization_is_permanent() {
        let err = Error::serialization_for_kind("Secret", "invalid type: map");
        assert!(!err.is_retryable());
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("Secret")),
            _ => panic!("Expected Serialization variant"),
        }
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn write_conflicts_are_retried() {
        assert!(api_error(409).is_retryable());
        assert!(!api_error(422).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("runner", "watch stream ended");
        assert!(err.to_string().contains("[runner]"));
    }

    #[test]
    fn cancelled_class() {
        let err = Error::cancelled("create_bucket");
        assert_eq!(err.class(), "cancelled");
        assert!(err.to_string().contains("create_bucket"));
    }
}
