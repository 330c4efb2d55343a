//! BlobStorage CRD: a request for an object-storage bucket

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CloudResourceStatus, SecretRef};

/// BlobStorage requests a bucket plus credentials scoped to it.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integreatly.org",
    version = "v1alpha1",
    kind = "BlobStorage",
    namespaced,
    status = "CloudResourceStatus",
    printcolumn = r#"{"name":"Tier","type":"string","jsonPath":".spec.tier"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.provider"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BlobStorageSpec {
    /// Deployment type (informational)
    #[serde(rename = "type", default)]
    pub type_: String,

    /// Tier name used to look up the deployment strategy
    pub tier: String,

    /// Where bucket details are written; defaults to `<name>-blobstorage`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}
