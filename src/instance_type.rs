use crate::apis::node_claim::KubeletConfiguration;
use crate::offering::Offerings;
use crate::requirements::Requirements;
use crate::resources::{
    CPU, EPHEMERAL_STORAGE, MEMORY, PODS, QuantityParseError, ResourceQuantity, Resources,
};

/// A catalog entry as the resolver sees it.
///
/// Immutable for the duration of one resolution; the catalog builds fresh
/// values per call.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    /// Static facts: name, architecture, zones, capacity types and so on.
    pub requirements: Requirements,
    pub offerings: Offerings,
    pub capacity: Resources,
    pub overhead: Overhead,
}

impl InstanceType {
    /// Capacity left for pods once the node's own reservations are taken out.
    pub fn allocatable(&self) -> Resources {
        self.capacity.saturating_sub(&self.overhead.total())
    }
}

/// Resources the node keeps for itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overhead {
    pub kube_reserved: Resources,
    pub system_reserved: Resources,
    pub eviction_threshold: Resources,
}

impl Overhead {
    pub fn total(&self) -> Resources {
        self.kube_reserved
            .merge(&self.system_reserved)
            .merge(&self.eviction_threshold)
    }

    /// Derive overhead from kubelet settings for a node with `capacity`.
    pub fn from_kubelet(
        kubelet: Option<&KubeletConfiguration>,
        capacity: &Resources,
    ) -> Result<Overhead, QuantityParseError> {
        let Some(kubelet) = kubelet else {
            return Ok(Overhead::default());
        };
        Ok(Overhead {
            kube_reserved: parse_reserved(&kubelet.kube_reserved)?,
            system_reserved: parse_reserved(&kubelet.system_reserved)?,
            eviction_threshold: eviction_threshold(&kubelet.eviction_hard, capacity)?,
        })
    }
}

fn parse_reserved(
    reserved: &std::collections::BTreeMap<String, String>,
) -> Result<Resources, QuantityParseError> {
    reserved
        .iter()
        .map(|(name, raw)| -> Result<_, QuantityParseError> {
            Ok((name.clone(), raw.parse::<ResourceQuantity>()?))
        })
        .collect()
}

/// Map eviction signals onto the resource they protect. Percentages are
/// taken of that resource's capacity.
fn eviction_threshold(
    eviction_hard: &std::collections::BTreeMap<String, String>,
    capacity: &Resources,
) -> Result<Resources, QuantityParseError> {
    let mut threshold = Resources::new();
    for (signal, raw) in eviction_hard {
        let resource = match signal.as_str() {
            "memory.available" => MEMORY,
            "nodefs.available" => EPHEMERAL_STORAGE,
            _ => continue,
        };
        let quantity = match raw.strip_suffix('%') {
            Some(percent) => {
                let percent: ResourceQuantity = percent.parse()?;
                capacity
                    .get(resource)
                    .percent(percent)
            }
            None => raw.parse()?,
        };
        threshold.insert(resource, quantity);
    }
    Ok(threshold)
}

/// Apply `maxPods` / `podsPerCore` to a capacity vector. The lower of the two
/// wins when both are set.
pub fn pods_capacity(kubelet: Option<&KubeletConfiguration>, capacity: &Resources) -> Resources {
    let Some(kubelet) = kubelet else {
        return capacity.clone();
    };
    let per_core = kubelet
        .pods_per_core
        .filter(|ppc| *ppc > 0)
        .map(|ppc| capacity.get(CPU).ceil_units() as i64 * i64::from(ppc));
    let max_pods = kubelet.max_pods.map(i64::from);
    let pods = match (max_pods, per_core) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    match pods {
        Some(pods) => capacity.clone().with(PODS, ResourceQuantity::from_units(pods)),
        None => capacity.clone(),
    }
}
