use kube::{core::ObjectMeta, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the `CAProviderClass` created in every namespace
pub const CA_PROVIDER_NAME: &str = "ca-provider";

/// Secret holding the CA bundle distributed to workloads
pub const CA_SECRET_NAME: &str = "ca";
/// Namespace of the CA bundle Secret
pub const CA_SECRET_NAMESPACE: &str = "spire";

/// Reference to an object the CSI driver reads CA certificates from.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    /// API group of the referenced object. Empty string means the core group.
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, PartialEq)]
#[kube(
    group = "cacerts.csi.cert-manager.io",
    version = "v1alpha1",
    kind = "CAProviderClass",
    plural = "caproviderclasses",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CAProviderClassSpec {
    /// Objects containing the CA material, in priority order.
    pub refs: Vec<ProviderRef>,
}

impl CAProviderClass {
    /// Build the fixed-shape provider pointing at the SPIRE CA Secret.
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(CA_PROVIDER_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: CAProviderClassSpec {
                refs: vec![ProviderRef {
                    api_group: String::new(),
                    kind: "Secret".to_string(),
                    name: CA_SECRET_NAME.to_string(),
                    namespace: CA_SECRET_NAMESPACE.to_string(),
                }],
            },
        }
    }
}
