//! Label and annotation keys shared between the catalog, the resolver and the
//! infrastructure delegates.

pub const ZONE: &str = "topology.kubernetes.io/zone";
pub const REGION: &str = "topology.kubernetes.io/region";
pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const ARCH: &str = "kubernetes.io/arch";
pub const OS: &str = "kubernetes.io/os";
pub const CAPACITY_TYPE: &str = "karpenter.sh/capacity-type";
pub const NODE_POOL: &str = "karpenter.sh/nodepool";

pub const INSTANCE_FAMILY: &str = "capi.karpenter.sh/instance-family";
pub const INSTANCE_CPU: &str = "capi.karpenter.sh/instance-cpu";
pub const INSTANCE_MEMORY: &str = "capi.karpenter.sh/instance-memory";

/// Set on every object a delegate creates, pointing back at its NodeClaim.
pub const NODE_CLAIM: &str = "capi.karpenter.sh/nodeclaim";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "capi-provider";

pub const NODE_CLASS_HASH_ANNOTATION: &str = "capi.karpenter.sh/nodeclass-hash";

/// Recorded on a MachineDeployment so its cloned template can be found again
/// on delete.
pub const TEMPLATE_API_VERSION_ANNOTATION: &str = "capi.karpenter.sh/template-api-version";
pub const TEMPLATE_KIND_ANNOTATION: &str = "capi.karpenter.sh/template-kind";
pub const TEMPLATE_NAME_ANNOTATION: &str = "capi.karpenter.sh/template-name";

/// Keys the catalog is expected to describe. When a candidate constrains one
/// of these and the claim says nothing about it, the permissive policy lets
/// it through.
pub const WELL_KNOWN: &[&str] = &[
    ZONE,
    REGION,
    INSTANCE_TYPE,
    ARCH,
    OS,
    CAPACITY_TYPE,
    NODE_POOL,
    INSTANCE_FAMILY,
    INSTANCE_CPU,
    INSTANCE_MEMORY,
];

pub fn is_well_known(key: &str) -> bool {
    WELL_KNOWN.contains(&key)
}

pub fn managed_by_selector() -> String {
    format!("{MANAGED_BY}={MANAGED_BY_VALUE}")
}
