//! Credential brokering through the cluster's cloud credential operator
//!
//! Each grant is a `CredentialsRequest` named after its owner, so repeated
//! calls update a single grant. The credential operator writes the issued
//! key pair into `<owner>-aws-credentials` in the same namespace; the broker
//! only ever reads it back and never loops waiting for it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tracing::debug;
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use cro_common::kube_utils::{get_secret_data, managed_labels};
use cro_common::{Error, Result, FIELD_MANAGER};

/// Secret key holding the access key id
pub const ACCESS_KEY_ID_KEY: &str = "aws_access_key_id";

/// Secret key holding the secret access key
pub const SECRET_ACCESS_KEY_KEY: &str = "aws_secret_access_key";

const CREDENTIALS_REQUEST_GROUP: &str = "cloudcredential.openshift.io";
const CREDENTIALS_REQUEST_VERSION: &str = "v1";
const CREDENTIALS_REQUEST_KIND: &str = "CredentialsRequest";

/// An access key pair scoped to one owner
#[derive(Clone)]
pub struct Credentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key, wiped on drop
    pub secret_access_key: Zeroizing<String>,
}

impl Credentials {
    /// Create a key pair
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// What a grant is for: who holds it and what it allows
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialScope {
    /// Namespace the grant and its secret live in
    pub namespace: String,
    /// Owner name the grant is keyed by
    pub owner: String,
    /// Allowed API actions
    pub actions: Vec<String>,
    /// Resources the actions apply to (`*` for all)
    pub resources: Vec<String>,
    /// Object whose deletion garbage-collects the grant; shared grants have none
    pub owner_reference: Option<OwnerReference>,
}

impl CredentialScope {
    /// Scope over all resources
    pub fn new(
        namespace: impl Into<String>,
        owner: impl Into<String>,
        actions: &[&str],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            owner: owner.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources: vec!["*".to_string()],
            owner_reference: None,
        }
    }

    /// Tie the grant's lifetime to `owner`
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner_reference = Some(owner);
        self
    }

    /// Restrict the scope to the given resources
    pub fn on_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Name of the grant and of the secret it produces
    pub fn grant_name(&self) -> String {
        format!("{}-aws-credentials", self.owner)
    }
}

/// Issues or reuses credentials for a scope
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Ensure the grant for `scope` exists and return its current credentials
    async fn reconcile(&self, scope: &CredentialScope) -> Result<Credentials>;
}

/// Body of the `CredentialsRequest` applied for a scope
pub fn build_credentials_request(scope: &CredentialScope) -> serde_json::Value {
    let name = scope.grant_name();
    let statements: Vec<serde_json::Value> = scope
        .resources
        .iter()
        .map(|resource| {
            json!({
                "effect": "Allow",
                "action": scope.actions,
                "resource": resource,
            })
        })
        .collect();
    let mut metadata = json!({
        "name": name,
        "namespace": scope.namespace,
        "labels": managed_labels(),
    });
    if let Some(owner) = &scope.owner_reference {
        metadata["ownerReferences"] = json!([owner]);
    }
    json!({
        "apiVersion": format!("{CREDENTIALS_REQUEST_GROUP}/{CREDENTIALS_REQUEST_VERSION}"),
        "kind": CREDENTIALS_REQUEST_KIND,
        "metadata": metadata,
        "spec": {
            "secretRef": {
                "name": name,
                "namespace": scope.namespace,
            },
            "providerSpec": {
                "apiVersion": format!("{CREDENTIALS_REQUEST_GROUP}/{CREDENTIALS_REQUEST_VERSION}"),
                "kind": "AWSProviderSpec",
                "statementEntries": statements,
            },
        },
    })
}

/// Extract a key pair from the data of an issued secret
pub fn credentials_from_secret(
    namespace: &str,
    secret_name: &str,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<Credentials> {
    let read = |key: &str| -> Result<String> {
        let raw = data
            .get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::credentials(
                    namespace,
                    format!("secret {secret_name} is missing {key}"),
                )
            })?;
        String::from_utf8(raw.clone()).map_err(|_| {
            Error::credentials(namespace, format!("secret {secret_name} has non-utf8 {key}"))
        })
    };

    Ok(Credentials {
        access_key_id: read(ACCESS_KEY_ID_KEY)?,
        secret_access_key: Zeroizing::new(read(SECRET_ACCESS_KEY_KEY)?),
    })
}

/// Broker backed by OpenShift `CredentialsRequest` objects
pub struct CredentialsRequestBroker {
    client: Client,
}

impl CredentialsRequestBroker {
    /// Create a broker
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            CREDENTIALS_REQUEST_GROUP,
            CREDENTIALS_REQUEST_VERSION,
            CREDENTIALS_REQUEST_KIND,
        ))
    }
}

#[async_trait]
impl CredentialBroker for CredentialsRequestBroker {
    async fn reconcile(&self, scope: &CredentialScope) -> Result<Credentials> {
        let name = scope.grant_name();
        let body = build_credentials_request(scope);

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &scope.namespace, &Self::api_resource());
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .map_err(|e| {
                Error::credentials(
                    &scope.namespace,
                    format!("failed to apply credentials request {name}: {e}"),
                )
            })?;
        debug!(namespace = %scope.namespace, grant = %name, "Applied credentials request");

        let data = get_secret_data(&self.client, &name, &scope.namespace)
            .await?
            .ok_or_else(|| {
                Error::credentials(
                    &scope.namespace,
                    format!("secret {name} has not been provisioned yet"),
                )
            })?;

        credentials_from_secret(&scope.namespace, &name, &data)
    }
}
