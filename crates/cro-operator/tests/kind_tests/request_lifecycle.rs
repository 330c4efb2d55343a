//! A request driven by the controller against a real API server

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use cro_common::crd::{Redis, RequestId, ResourceKind, ResourcePhase, ResourceRequest};
use cro_common::{Error, CLOUD_RESOURCE_FINALIZER};
use cro_operator::{reconcile_request, Context, ReconcileOutcome};
use cro_provider::strategy::StaticStrategyResolver;
use cro_provider::{
    CacheEndpoint, DeploymentDetails, ProvisionedInstance, Provider, ProviderOutcome,
    ProviderRegistry, StrategyConfig,
};

use super::helpers::{cleanup, ensure_test_cluster, sample_redis, TEST_NAMESPACE};

/// Cache provider that is pending on its first call and ready afterwards
#[derive(Default)]
struct TwoStepCache {
    creates: AtomicU32,
    deletes: AtomicU32,
}

#[async_trait]
impl Provider for TwoStepCache {
    fn name(&self) -> &'static str {
        "in-process-cache"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Redis
    }

    fn supports_strategy(&self, strategy: &str) -> bool {
        strategy == "aws"
    }

    async fn create_or_discover(
        &self,
        _request: &ResourceRequest,
        _strategy: &StrategyConfig,
        _cancel: &CancellationToken,
    ) -> Result<ProviderOutcome, Error> {
        if self.creates.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(ProviderOutcome::pending("cache creation started"));
        }
        Ok(ProviderOutcome::Ready(ProvisionedInstance {
            provider: self.name().to_string(),
            details: DeploymentDetails::Cache {
                endpoint: CacheEndpoint {
                    address: "cache.internal.example".to_string(),
                    port: 6379,
                },
            },
        }))
    }

    async fn delete(
        &self,
        _request: &ResourceRequest,
        _strategy: &StrategyConfig,
        _cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn live_context(client: Client, provider: Arc<TwoStepCache>) -> Context {
    let mut registry = ProviderRegistry::new();
    registry
        .register("aws", provider)
        .expect("registration should succeed");
    let resolver = StaticStrategyResolver::new()
        .with_kind(ResourceKind::Redis, r#"{"default": {"createStrategy": {}}}"#);
    Context::builder(client, Arc::new(registry), Arc::new(resolver)).build()
}

/// Story: a cache request goes from pending to complete and is deleted again
///
/// Expected behavior:
/// - the first pass adds the finalizer and reports `in progress`
/// - the second pass writes the connection secret, owned by the request
/// - deleting the request triggers one provider delete and releases the finalizer
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_cache_request_full_lifecycle() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "lifecycle-cache";
    cleanup::<Redis>(&client, name).await;

    let api: Api<Redis> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    api.create(&PostParams::default(), &sample_redis(name, "default"))
        .await
        .expect("failed to create redis");

    let provider = Arc::new(TwoStepCache::default());
    let ctx = live_context(client.clone(), provider.clone());
    let id = RequestId::new(ResourceKind::Redis, TEST_NAMESPACE, name);
    let cancel = CancellationToken::new();

    // First pass: pending
    let outcome = reconcile_request(&id, &ctx, &cancel)
        .await
        .expect("first pass should succeed");
    assert!(matches!(outcome, ReconcileOutcome::RequeueAfter(_)));
    let redis = api.get(name).await.expect("failed to get redis");
    assert!(redis.finalizers().contains(&CLOUD_RESOURCE_FINALIZER.to_string()));
    let status = redis.status.expect("status should be written");
    assert_eq!(status.phase, ResourcePhase::InProgress);
    assert!(status.provider.is_none());

    // Second pass: ready, secret materialized
    reconcile_request(&id, &ctx, &cancel)
        .await
        .expect("second pass should succeed");
    let status = api
        .get(name)
        .await
        .expect("failed to get redis")
        .status
        .expect("status should be written");
    assert_eq!(status.phase, ResourcePhase::Complete);
    assert_eq!(status.provider.as_deref(), Some("in-process-cache"));
    assert_eq!(status.strategy.as_deref(), Some("default"));

    let secrets: Api<Secret> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let secret = secrets
        .get("lifecycle-cache-redis")
        .await
        .expect("connection secret should exist");
    let data = secret.data.expect("secret should carry data");
    assert_eq!(data["uri"].0, b"cache.internal.example".to_vec());
    assert_eq!(data["port"].0, b"6379".to_vec());
    let owners = secret.metadata.owner_references.unwrap_or_default();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "Redis");
    assert_eq!(owners[0].name, name);

    // Deletion: provider delete once, finalizer released, request gone
    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete redis");
    let outcome = reconcile_request(&id, &ctx, &cancel)
        .await
        .expect("deletion pass should succeed");
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);

    cleanup::<Redis>(&client, name).await;
    assert!(api.get_opt(name).await.expect("get_opt").is_none());

    // A pass for a request that no longer exists is a no-op
    let outcome = reconcile_request(&id, &ctx, &cancel)
        .await
        .expect("pass on absent request should succeed");
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
}

/// Story: a request on a tier nobody configured is reported, not retried blindly
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_unknown_tier_is_reported_on_status() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "lifecycle-unknown-tier";
    cleanup::<Redis>(&client, name).await;

    let api: Api<Redis> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    api.create(&PostParams::default(), &sample_redis(name, "platinum"))
        .await
        .expect("failed to create redis");

    let provider = Arc::new(TwoStepCache::default());
    let ctx = live_context(client.clone(), provider.clone());
    let id = RequestId::new(ResourceKind::Redis, TEST_NAMESPACE, name);

    let err = reconcile_request(&id, &ctx, &CancellationToken::new())
        .await
        .expect_err("unknown tier should fail");
    assert!(err.is_configuration());
    assert_eq!(provider.creates.load(Ordering::SeqCst), 0);

    let status = api
        .get(name)
        .await
        .expect("failed to get redis")
        .status
        .expect("failure should be written to status");
    assert_eq!(status.phase, ResourcePhase::Failed);
    assert!(status.message.unwrap_or_default().contains("platinum"));

    cleanup::<Redis>(&client, name).await;
}
