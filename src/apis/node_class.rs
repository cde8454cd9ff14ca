use std::collections::BTreeMap;

use kube::api::{Api, GroupVersionKind};
use kube::{Client, CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::apis::node_claim::NodeClassReference;

fn default_instance_type_field() -> String {
    "spec.template.spec.instanceType".to_string()
}

/// Spec for a CapiNodeClass — how to turn a chosen instance type into
/// Cluster API objects.
///
/// The infrastructure template is cloned once per NodeClaim with the
/// instance type written at `instanceTypeField`, then referenced from a
/// single-replica MachineDeployment.
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "capi.karpenter.sh", version = "v1alpha1", kind = "CapiNodeClass")]
#[serde(rename_all = "camelCase")]
pub struct CapiNodeClassSpec {
    pub cluster_name: String,
    /// Namespace holding the cluster's CAPI objects.
    pub namespace: String,
    pub infrastructure_template_ref: TemplateReference,
    pub bootstrap_config_ref: TemplateReference,
    /// Kubernetes version for new machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Restrict the catalog to these instance types. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_types: Vec<String>,
    /// Dot-separated path of the instance type field in the template.
    #[serde(default = "default_instance_type_field")]
    pub instance_type_field: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl CapiNodeClass {
    pub fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(
            &CapiNodeClass::group(&()),
            &CapiNodeClass::version(&()),
            &CapiNodeClass::kind(&()),
        )
    }

    /// Stable content hash of the spec. Launched NodeClaims carry it so a
    /// later edit of the class shows up as drift.
    pub fn hash(&self) -> String {
        let encoded = serde_json::to_vec(&self.spec).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    /// Whether the allow-list (if any) admits `instance_type`.
    pub fn allows(&self, instance_type: &str) -> bool {
        self.spec.instance_types.is_empty()
            || self.spec.instance_types.iter().any(|name| name == instance_type)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeClassError {
    #[error("nodeclaim has no nodeClassRef")]
    MissingReference,
    #[error("node class kind {kind:?} is not supported")]
    UnsupportedKind { kind: String },
    #[error("node class {name:?} not found")]
    NotFound { name: String },
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Where node classes are looked up.
pub enum NodeClassStore {
    Kube(Client),
    /// Fixed set, keyed by name.
    Static(BTreeMap<String, CapiNodeClass>),
}

impl NodeClassStore {
    pub fn from_classes(classes: impl IntoIterator<Item = CapiNodeClass>) -> Self {
        Self::Static(
            classes
                .into_iter()
                .map(|class| (class.name_any(), class))
                .collect(),
        )
    }

    pub async fn get(&self, reference: &NodeClassReference) -> Result<CapiNodeClass, NodeClassError> {
        if reference.kind != CapiNodeClass::kind(&()) {
            return Err(NodeClassError::UnsupportedKind {
                kind: reference.kind.clone(),
            });
        }
        let not_found = || NodeClassError::NotFound {
            name: reference.name.clone(),
        };
        match self {
            Self::Kube(client) => {
                let api: Api<CapiNodeClass> = Api::all(client.clone());
                api.get_opt(&reference.name).await?.ok_or_else(not_found)
            }
            Self::Static(classes) => classes.get(&reference.name).cloned().ok_or_else(not_found),
        }
    }
}
