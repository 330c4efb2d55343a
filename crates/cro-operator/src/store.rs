//! Kubernetes-facing collaborators of the reconcile loop
//!
//! The controller talks to the cluster only through [`RequestStore`] and
//! [`SecretSink`], which dispatch on [`ResourceKind`] to the typed APIs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::Api;
use kube::Client;

#[cfg(test)]
use mockall::automock;

use cro_common::crd::{
    BlobStorage, CloudResource, CloudResourceStatus, Redis, RequestId, ResourceKind,
    ResourceRequest,
};
use cro_common::kube_utils::{
    add_finalizer, apply_secret, build_owned_secret, patch_resource_status, remove_finalizer,
};
use cro_common::{Error, CLOUD_RESOURCE_FINALIZER, FIELD_MANAGER};

/// Reads and updates resource requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Fresh read of a request; `None` if it no longer exists
    async fn get(&self, id: &RequestId) -> Result<Option<ResourceRequest>, Error>;

    /// Add the operator finalizer if absent
    async fn add_finalizer(&self, id: &RequestId) -> Result<(), Error>;

    /// Remove the operator finalizer if present
    async fn remove_finalizer(&self, id: &RequestId) -> Result<(), Error>;

    /// Replace the status of a request
    async fn patch_status(&self, id: &RequestId, status: &CloudResourceStatus)
        -> Result<(), Error>;
}

/// Writes connection details where the request asked for them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretSink: Send + Sync {
    /// Create or update the request's secret with `data`
    async fn materialize(
        &self,
        request: &ResourceRequest,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error>;
}

/// [`RequestStore`] backed by the `Redis` and `BlobStorage` APIs
pub struct KubeRequestStore {
    client: Client,
}

impl KubeRequestStore {
    /// Create a store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_typed<K: CloudResource>(
        &self,
        id: &RequestId,
    ) -> Result<Option<ResourceRequest>, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        match api.get_opt(&id.name).await? {
            Some(obj) => Ok(Some(ResourceRequest::from_resource(&obj)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RequestStore for KubeRequestStore {
    async fn get(&self, id: &RequestId) -> Result<Option<ResourceRequest>, Error> {
        match id.kind {
            ResourceKind::Redis => self.get_typed::<Redis>(id).await,
            ResourceKind::BlobStorage => self.get_typed::<BlobStorage>(id).await,
        }
    }

    async fn add_finalizer(&self, id: &RequestId) -> Result<(), Error> {
        let (c, ns, name) = (&self.client, &id.namespace, &id.name);
        match id.kind {
            ResourceKind::Redis => {
                add_finalizer::<Redis>(c, ns, name, CLOUD_RESOURCE_FINALIZER, FIELD_MANAGER).await
            }
            ResourceKind::BlobStorage => {
                add_finalizer::<BlobStorage>(c, ns, name, CLOUD_RESOURCE_FINALIZER, FIELD_MANAGER)
                    .await
            }
        }
    }

    async fn remove_finalizer(&self, id: &RequestId) -> Result<(), Error> {
        let (c, ns, name) = (&self.client, &id.namespace, &id.name);
        match id.kind {
            ResourceKind::Redis => {
                remove_finalizer::<Redis>(c, ns, name, CLOUD_RESOURCE_FINALIZER, FIELD_MANAGER)
                    .await
            }
            ResourceKind::BlobStorage => {
                remove_finalizer::<BlobStorage>(
                    c,
                    ns,
                    name,
                    CLOUD_RESOURCE_FINALIZER,
                    FIELD_MANAGER,
                )
                .await
            }
        }
    }

    async fn patch_status(
        &self,
        id: &RequestId,
        status: &CloudResourceStatus,
    ) -> Result<(), Error> {
        let (c, ns, name) = (&self.client, &id.namespace, &id.name);
        match id.kind {
            ResourceKind::Redis => {
                patch_resource_status::<Redis>(c, name, ns, status, FIELD_MANAGER).await?
            }
            ResourceKind::BlobStorage => {
                patch_resource_status::<BlobStorage>(c, name, ns, status, FIELD_MANAGER).await?
            }
        }
        Ok(())
    }
}

/// [`SecretSink`] writing owner-referenced `Opaque` secrets
pub struct KubeSecretSink {
    client: Client,
}

impl KubeSecretSink {
    /// Create a sink
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSink for KubeSecretSink {
    async fn materialize(
        &self,
        request: &ResourceRequest,
        data: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        let secret = build_owned_secret(
            &request.secret_name,
            request.namespace(),
            request.owner_reference(),
            data,
        );
        apply_secret(&self.client, &secret, FIELD_MANAGER).await
    }
}
