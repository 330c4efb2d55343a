//! Shared fixtures for the live-cluster tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::OnceCell;
use tokio::time::sleep;

use cro_common::crd::{CloudResource, Redis, RedisSpec};
use cro_operator::runner::ensure_crds_installed;

/// Namespace every test request lives in
pub const TEST_NAMESPACE: &str = "cro-integration-test";

static SETUP: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Connect to the current cluster and make sure CRDs and the test namespace exist
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("failed to create client: {e}"))?;

    let setup_client = client.clone();
    SETUP
        .get_or_init(|| async move {
            ensure_crds_installed(&setup_client)
                .await
                .map_err(|e| e.to_string())?;
            // Give the API server a moment to serve the new kinds
            sleep(Duration::from_secs(2)).await;
            ensure_namespace(&setup_client, TEST_NAMESPACE).await
        })
        .await
        .clone()?;

    Ok(client)
}

async fn ensure_namespace(client: &Client, name: &str) -> Result<(), String> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(format!("failed to create namespace {name}: {e}")),
    }
}

/// A `Redis` request on the given tier in the test namespace
pub fn sample_redis(name: &str, tier: &str) -> Redis {
    let mut redis = Redis::new(
        name,
        RedisSpec {
            type_: "managed".to_string(),
            tier: tier.to_string(),
            secret_ref: None,
        },
    );
    redis.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    redis
}

/// Delete a request, ignoring errors, and wait briefly for it to go away
pub async fn cleanup<K: CloudResource>(client: &Client, name: &str) {
    let api: Api<K> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;
    for _ in 0..10 {
        if matches!(api.get_opt(name).await, Ok(None)) {
            return;
        }
        sleep(Duration::from_millis(500)).await;
    }
}
