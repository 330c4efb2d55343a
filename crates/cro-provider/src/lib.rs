//! Providers that turn resource requests into cloud resources
//!
//! - [`strategy`] maps a (kind, tier) pair to a deployment strategy
//! - [`credentials`] issues narrowly-scoped cloud credentials
//! - [`provider`] defines the provider contract and the registry
//! - [`aws`] holds the ElastiCache and S3 implementations

#![deny(missing_docs)]

pub mod aws;
pub mod credentials;
pub mod provider;
pub mod strategy;

pub use credentials::{CredentialBroker, CredentialScope, Credentials};
pub use provider::{
    CacheEndpoint, DeploymentDetails, ProvisionedInstance, Provider, ProviderOutcome,
    ProviderRegistry,
};
pub use strategy::{StrategyConfig, StrategyResolver};
