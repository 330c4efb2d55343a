//! Wiring of the request controllers into the kube runtime
//!
//! `build_*` functions return boxed futures so `main` decides how to drive
//! them; nothing here starts a task on its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, CustomResourceExt};
use tracing::info;

use cro_common::crd::{BlobStorage, CloudResource, Redis};
use cro_common::retry::PollConfig;
use cro_common::{Result, FIELD_MANAGER};
use cro_provider::aws::{
    AwsBlobStorageProvider, AwsRedisProvider, SdkElastiCacheConnector, SdkS3Connector,
    AWS_STRATEGY,
};
use cro_provider::{CredentialBroker, ProviderRegistry};

use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so the API server closes idle watches first
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be driven
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Register every provider this build ships with
pub fn build_registry(
    broker: Arc<dyn CredentialBroker>,
    list_poll: PollConfig,
) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(
        AWS_STRATEGY,
        Arc::new(AwsRedisProvider::new(
            broker.clone(),
            Arc::new(SdkElastiCacheConnector),
            list_poll.clone(),
        )),
    )?;
    registry.register(
        AWS_STRATEGY,
        Arc::new(AwsBlobStorageProvider::new(
            broker,
            Arc::new(SdkS3Connector),
            list_poll,
        )),
    )?;
    Ok(registry)
}

/// Build one controller per request kind
///
/// With `namespace` set only that namespace is watched. Owned secrets are
/// watched too, so deleting a connection secret triggers a pass that
/// recreates it.
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> Vec<ControllerFuture> {
    match namespace {
        Some(ns) => info!(namespace = %ns, "watching a single namespace"),
        None => info!("watching all namespaces"),
    }

    vec![
        build_controller::<Redis>(client.clone(), ctx.clone(), namespace, "Redis"),
        build_controller::<BlobStorage>(client, ctx, namespace, "BlobStorage"),
    ]
}

fn build_controller<K: CloudResource>(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
    controller_name: &'static str,
) -> ControllerFuture {
    let (requests, secrets): (Api<K>, Api<Secret>) = match namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    info!("- {} controller", controller_name);

    Box::pin(
        Controller::new(requests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(secrets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile::<K>, error_policy::<K>, ctx)
            .for_each(log_reconcile_result(controller_name)),
    )
}

/// Install or update both request CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        (Redis::crd_name(), Redis::crd()),
        (BlobStorage::crd_name(), BlobStorage::crd()),
    ] {
        info!("Installing {} CRD...", name);
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    info!("CRDs installed/updated");
    Ok(())
}

/// Render both CRDs as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let redis = serde_yaml::to_string(&Redis::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize Redis CRD: {}", e))?;
    let blob = serde_yaml::to_string(&BlobStorage::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize BlobStorage CRD: {}", e))?;
    Ok(format!("{redis}---\n{blob}"))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cro_common::crd::ResourceKind;
    use cro_provider::{CredentialScope, Credentials};
    use mockall::mock;

    mock! {
        pub Broker {}

        #[async_trait::async_trait]
        impl CredentialBroker for Broker {
            async fn reconcile(&self, scope: &CredentialScope) -> Result<Credentials>;
        }
    }

    #[test]
    fn registry_serves_both_kinds_under_aws() {
        let broker: Arc<dyn CredentialBroker> = Arc::new(MockBroker::new());
        let registry = build_registry(broker, PollConfig::default()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.select(ResourceKind::Redis, "aws").unwrap().name(),
            "aws-elasticache"
        );
        assert_eq!(
            registry.select(ResourceKind::BlobStorage, "aws").unwrap().name(),
            "aws-s3"
        );
        assert!(registry.select(ResourceKind::Redis, "openshift").is_err());
    }

    #[test]
    fn crd_yaml_contains_both_kinds() {
        let yaml = crds_yaml().unwrap();
        assert!(yaml.contains("kind: Redis"));
        assert!(yaml.contains("kind: BlobStorage"));
        assert!(yaml.contains("---"));
        assert!(yaml.contains("integreatly.org"));
    }
}
