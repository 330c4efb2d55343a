//! Requests as users see them through the Kubernetes API

use kube::api::{Api, PostParams};

use cro_common::crd::{BlobStorage, BlobStorageSpec, Redis, SecretRef};

use super::helpers::{cleanup, ensure_test_cluster, sample_redis, TEST_NAMESPACE};

/// Story: a team asks for a cache on the default tier
///
/// The request is stored as written and has no status until the operator
/// has looked at it.
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_team_requests_default_cache() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Redis> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-redis-default";
    cleanup::<Redis>(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_redis(name, "default"))
        .await
        .expect("failed to create redis");
    assert_eq!(created.spec.tier, "default");
    assert!(created.status.is_none());

    let fetched = api.get(name).await.expect("failed to get redis");
    assert_eq!(fetched.spec.type_, "managed");
    assert!(fetched.spec.secret_ref.is_none());

    cleanup::<Redis>(&client, name).await;
}

/// Story: a team names the secret that should receive bucket details
#[tokio::test]
#[ignore = "requires a Kubernetes cluster - run with: cargo test --test kind -- --ignored"]
async fn story_team_requests_bucket_with_named_secret() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<BlobStorage> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-bucket-named-secret";
    cleanup::<BlobStorage>(&client, name).await;

    let mut bucket = BlobStorage::new(
        name,
        BlobStorageSpec {
            type_: "managed".to_string(),
            tier: "production".to_string(),
            secret_ref: Some(SecretRef {
                name: "uploads-credentials".to_string(),
            }),
        },
    );
    bucket.metadata.namespace = Some(TEST_NAMESPACE.to_string());

    api.create(&PostParams::default(), &bucket)
        .await
        .expect("failed to create bucket request");

    let fetched = api.get(name).await.expect("failed to get bucket request");
    assert_eq!(
        fetched.spec.secret_ref.map(|s| s.name).as_deref(),
        Some("uploads-credentials")
    );

    cleanup::<BlobStorage>(&client, name).await;
}
