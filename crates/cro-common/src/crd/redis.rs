//! Redis CRD: a request for a managed Redis-compatible cache

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CloudResourceStatus, SecretRef};

/// Redis requests a cache cluster provisioned by the strategy for its tier.
///
/// Example:
/// ```yaml
/// apiVersion: integreatly.org/v1alpha1
/// kind: Redis
/// metadata:
///   name: sessions
///   namespace: team-a
/// spec:
///   type: managed
///   tier: production
///   secretRef:
///     name: sessions-redis
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "integreatly.org",
    version = "v1alpha1",
    kind = "Redis",
    plural = "redis",
    namespaced,
    status = "CloudResourceStatus",
    printcolumn = r#"{"name":"Tier","type":"string","jsonPath":".spec.tier"}"#,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".status.provider"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisSpec {
    /// Deployment type (informational, e.g. "managed" or "workshop")
    #[serde(rename = "type", default)]
    pub type_: String,

    /// Tier name used to look up the deployment strategy
    pub tier: String,

    /// Where connection details are written; defaults to `<name>-redis`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn parses_request_yaml() {
        let yaml = r#"
apiVersion: integreatly.org/v1alpha1
kind: Redis
metadata:
  name: sessions
  namespace: team-a
spec:
  type: managed
  tier: production
  secretRef:
    name: sessions-conn
"#;
        let redis: Redis = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(redis.spec.tier, "production");
        assert_eq!(redis.spec.type_, "managed");
        assert_eq!(
            redis.spec.secret_ref.as_ref().map(|s| s.name.as_str()),
            Some("sessions-conn")
        );
        assert!(redis.status.is_none());
    }

    #[test]
    fn crd_is_namespaced_under_integreatly() {
        let crd = Redis::crd();
        assert_eq!(crd.spec.group, "integreatly.org");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.plural, "redis");
    }
}
