//! Shared Kubernetes helpers for request CRDs, secrets and config maps

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::crd::CloudResource;
use crate::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_OPERATOR};

/// Whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Finalizer list with `finalizer` appended, or `None` if already present
pub fn with_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut next = current.to_vec();
    next.push(finalizer.to_string());
    Some(next)
}

/// Finalizer list with `finalizer` removed, or `None` if it was absent
pub fn without_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        current
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect(),
    )
}

/// Merge patch replacing the finalizer list, guarded by `resource_version`
///
/// With a version set the API server rejects the patch with a 409 when the
/// object changed since it was read, so a concurrent finalizer edit is never
/// overwritten.
pub fn finalizer_patch(
    finalizers: &[String],
    resource_version: Option<&str>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(version) = resource_version {
        metadata["resourceVersion"] = serde_json::json!(version);
    }
    serde_json::json!({ "metadata": metadata })
}

/// Add a finalizer to a request, re-reading it first
///
/// A no-op when the finalizer is already present.
pub async fn add_finalizer<K: CloudResource>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error> {
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let obj = api.get(name).await?;
    let current = obj.meta().finalizers.clone().unwrap_or_default();

    let Some(finalizers) = with_finalizer(&current, finalizer) else {
        return Ok(());
    };

    let patch = finalizer_patch(&finalizers, obj.meta().resource_version.as_deref());
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    debug!(namespace = %namespace, name = %name, "Added finalizer");
    Ok(())
}

/// Remove a finalizer from a request, re-reading it first
///
/// A no-op when the request is gone or the finalizer is absent.
pub async fn remove_finalizer<K: CloudResource>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error> {
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let current = obj.meta().finalizers.clone().unwrap_or_default();

    let Some(finalizers) = without_finalizer(&current, finalizer) else {
        return Ok(());
    };

    let patch = finalizer_patch(&finalizers, obj.meta().resource_version.as_deref());
    match api
        .patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }
    debug!(namespace = %namespace, name = %name, "Removed finalizer");
    Ok(())
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<K: CloudResource>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error> {
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Labels put on every object the operator writes
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_OPERATOR.to_string(),
    )])
}

/// Build an `Opaque` secret owned by `owner`
pub fn build_owned_secret(
    name: &str,
    namespace: &str,
    owner: OwnerReference,
    data: &BTreeMap<String, Vec<u8>>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Server-side apply a secret
pub async fn apply_secret(
    client: &Client,
    secret: &Secret,
    field_manager: &str,
) -> Result<(), Error> {
    let name = secret
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("apply_secret", "secret has no name"))?;
    let namespace = secret
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("apply_secret", "secret has no namespace"))?;

    let mut body = serde_json::to_value(secret)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
    body["apiVersion"] = serde_json::json!("v1");
    body["kind"] = serde_json::json!("Secret");

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::apply(field_manager).force(), &Patch::Apply(&body))
        .await?;
    Ok(())
}

/// Read all data from a secret, or `None` if it does not exist
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(name).await? else {
        return Ok(None);
    };
    Ok(Some(
        secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect(),
    ))
}

/// Read one key of a config map, or `None` if the map or key is absent
pub async fn get_config_map_value(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<String>, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let Some(cm) = api.get_opt(name).await? else {
        return Ok(None);
    };
    Ok(cm.data.and_then(|mut d| d.remove(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CLOUD_RESOURCE_FINALIZER;

    #[test]
    fn finalizer_is_added_once() {
        let added = with_finalizer(&[], CLOUD_RESOURCE_FINALIZER).expect("added");
        assert_eq!(added, vec![CLOUD_RESOURCE_FINALIZER.to_string()]);
        assert!(with_finalizer(&added, CLOUD_RESOURCE_FINALIZER).is_none());
    }

    #[test]
    fn removing_keeps_other_finalizers() {
        let current = vec![
            "other.io/finalizer".to_string(),
            CLOUD_RESOURCE_FINALIZER.to_string(),
        ];
        let remaining = without_finalizer(&current, CLOUD_RESOURCE_FINALIZER).expect("removed");
        assert_eq!(remaining, vec!["other.io/finalizer".to_string()]);
        assert!(without_finalizer(&remaining, CLOUD_RESOURCE_FINALIZER).is_none());
    }

    #[test]
    fn finalizer_patch_carries_resource_version() {
        let finalizers = vec![
            "other.io/finalizer".to_string(),
            CLOUD_RESOURCE_FINALIZER.to_string(),
        ];
        let patch = finalizer_patch(&finalizers, Some("4711"));
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["metadata"]["finalizers"][0], "other.io/finalizer");
        assert_eq!(patch["metadata"]["finalizers"][1], CLOUD_RESOURCE_FINALIZER);

        let unguarded = finalizer_patch(&finalizers, None);
        assert!(unguarded["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn owned_secret_is_opaque_with_controller_ref() {
        let owner = OwnerReference {
            api_version: "integreatly.org/v1alpha1".to_string(),
            kind: "Redis".to_string(),
            name: "cache".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let data = BTreeMap::from([("uri".to_string(), b"redis.example".to_vec())]);
        let secret = build_owned_secret("cache-redis", "team-a", owner, &data);

        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("team-a"));
        let refs = secret.metadata.owner_references.expect("owner refs");
        assert_eq!(refs[0].controller, Some(true));
        assert_eq!(
            secret.data.expect("data")["uri"].0,
            b"redis.example".to_vec()
        );
        assert_eq!(
            secret.metadata.labels.expect("labels")[LABEL_MANAGED_BY],
            LABEL_MANAGED_BY_OPERATOR
        );
    }
}
