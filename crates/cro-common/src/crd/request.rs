//! Kind-neutral view over the request CRDs
//!
//! The controller never matches on `Redis` vs `BlobStorage` directly. It works
//! on a [`ResourceRequest`] snapshot built from whichever CRD triggered the
//! pass, and dispatches on [`ResourceKind`].

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::blob_storage::BlobStorage;
use super::redis::Redis;
use super::types::{CloudResourceStatus, SecretRef};
use crate::{Error, Result, CLOUD_RESOURCE_FINALIZER};

/// API group/version shared by all request CRDs
pub const API_VERSION: &str = "integreatly.org/v1alpha1";

/// Kind of external resource a request asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Redis-compatible cache cluster
    Redis,
    /// Object-storage bucket
    BlobStorage,
}

impl ResourceKind {
    /// All kinds the operator serves
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Redis, ResourceKind::BlobStorage];

    /// Key used in the strategy ConfigMap and in default secret names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::BlobStorage => "blobstorage",
        }
    }

    /// Kubernetes `kind` of the backing CRD
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Redis => "Redis",
            Self::BlobStorage => "BlobStorage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "blobstorage" => Ok(Self::BlobStorage),
            other => Err(Error::validation(format!("unknown resource kind: {other}"))),
        }
    }
}

/// Stable identifier of one request: kind plus namespace/name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace of the request
    pub namespace: String,
    /// Name of the request
    pub name: String,
}

impl RequestId {
    /// Create an identifier
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A request CRD the controller can reconcile
pub trait CloudResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind served by this CRD
    const KIND: ResourceKind;

    /// Informational deployment type
    fn deployment_type(&self) -> &str;

    /// Tier used for strategy lookup
    fn tier(&self) -> &str;

    /// Explicit secret reference, if set
    fn secret_ref(&self) -> Option<&SecretRef>;

    /// Current status, if any
    fn cloud_status(&self) -> Option<&CloudResourceStatus>;
}

impl CloudResource for Redis {
    const KIND: ResourceKind = ResourceKind::Redis;

    fn deployment_type(&self) -> &str {
        &self.spec.type_
    }

    fn tier(&self) -> &str {
        &self.spec.tier
    }

    fn secret_ref(&self) -> Option<&SecretRef> {
        self.spec.secret_ref.as_ref()
    }

    fn cloud_status(&self) -> Option<&CloudResourceStatus> {
        self.status.as_ref()
    }
}

impl CloudResource for BlobStorage {
    const KIND: ResourceKind = ResourceKind::BlobStorage;

    fn deployment_type(&self) -> &str {
        &self.spec.type_
    }

    fn tier(&self) -> &str {
        &self.spec.tier
    }

    fn secret_ref(&self) -> Option<&SecretRef> {
        self.spec.secret_ref.as_ref()
    }

    fn cloud_status(&self) -> Option<&CloudResourceStatus> {
        self.status.as_ref()
    }
}

/// Snapshot of a request taken at the start of a pass
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRequest {
    /// Kind, namespace and name
    pub id: RequestId,
    /// Kubernetes uid, used for owner references
    pub uid: String,
    /// Informational deployment type
    pub deployment_type: String,
    /// Tier selecting the strategy
    pub tier: String,
    /// Secret that receives connection details
    pub secret_name: String,
    /// Whether a deletion timestamp is set
    pub deletion_requested: bool,
    /// Finalizers currently on the object
    pub finalizers: Vec<String>,
    /// Status as last written
    pub status: CloudResourceStatus,
}

impl ResourceRequest {
    /// Build a snapshot from a request CRD
    pub fn from_resource<K: CloudResource>(obj: &K) -> Result<Self> {
        let name = obj.name_any();
        let namespace = obj.namespace().ok_or_else(|| {
            Error::validation_for(
                format!("{}/{}", K::KIND, name),
                "request has no namespace",
            )
        })?;
        let uid = obj.uid().ok_or_else(|| {
            Error::validation_for(format!("{}/{}/{}", K::KIND, namespace, name), "request has no uid")
        })?;
        let secret_name = obj
            .secret_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}-{}", name, K::KIND.as_str()));

        Ok(Self {
            id: RequestId::new(K::KIND, namespace, name),
            uid,
            deployment_type: obj.deployment_type().to_string(),
            tier: obj.tier().to_string(),
            secret_name,
            deletion_requested: obj.meta().deletion_timestamp.is_some(),
            finalizers: obj.finalizers().to_vec(),
            status: obj.cloud_status().cloned().unwrap_or_default(),
        })
    }

    /// Resource kind
    pub fn kind(&self) -> ResourceKind {
        self.id.kind
    }

    /// Namespace of the request
    pub fn namespace(&self) -> &str {
        &self.id.namespace
    }

    /// Name of the request
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Whether our finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == CLOUD_RESOURCE_FINALIZER)
    }

    /// Controller owner reference pointing at this request
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: self.id.kind.kind_name().to_string(),
            name: self.id.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}
