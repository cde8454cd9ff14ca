use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogEntry, CatalogError};
use crate::labels;
use crate::offering::{CapacityType, Offering, Offerings, Zone};
use crate::requirements::{Requirement, Requirements};
use crate::resources::{CPU, MEMORY, Resources};

const MEBIBYTE: i128 = 1024 * 1024 * 1_000_000_000;

fn default_architecture() -> String {
    "amd64".to_string()
}

fn default_operating_systems() -> Vec<String> {
    vec!["linux".to_string()]
}

fn default_available() -> bool {
    true
}

/// On-disk catalog layout.
///
/// ```yaml
/// instanceTypes:
///   - name: m5.large
///     capacity: {cpu: "2", memory: 8Gi, pods: "29"}
///     offerings:
///       - {zone: us-east-1a, capacityType: on-demand, price: 0.096}
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFile {
    #[serde(default)]
    pub instance_types: Vec<InstanceTypeSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeSpec {
    pub name: String,
    pub capacity: BTreeMap<String, Quantity>,
    /// Extra facts about the type, e.g. `capi.karpenter.sh/instance-family: m5`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_operating_systems")]
    pub operating_systems: Vec<String>,
    #[serde(default)]
    pub offerings: Vec<OfferingSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferingSpec {
    pub zone: String,
    pub capacity_type: CapacityType,
    pub price: f64,
    #[serde(default = "default_available")]
    pub available: bool,
}

impl OfferingSpec {
    pub fn new(zone: impl Into<String>, capacity_type: CapacityType, price: f64) -> Self {
        Self {
            zone: zone.into(),
            capacity_type,
            price,
            available: true,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

impl InstanceTypeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: BTreeMap::new(),
            labels: BTreeMap::new(),
            architecture: default_architecture(),
            operating_systems: default_operating_systems(),
            offerings: Vec::new(),
        }
    }

    pub fn with_capacity(mut self, resource: &str, quantity: &str) -> Self {
        self.capacity
            .insert(resource.to_string(), Quantity(quantity.to_string()));
        self
    }

    pub fn with_offering(mut self, offering: OfferingSpec) -> Self {
        self.offerings.push(offering);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = architecture.to_string();
        self
    }

    /// Turn the declaration into a catalog entry, deriving the static
    /// requirements every instance type carries.
    pub fn into_entry(self) -> Result<CatalogEntry, CatalogError> {
        let capacity =
            Resources::from_quantities(&self.capacity).map_err(|source| {
                CatalogError::InvalidQuantity {
                    name: self.name.clone(),
                    source,
                }
            })?;

        let mut requirements = Requirements::new()
            .with(Requirement::in_values(labels::INSTANCE_TYPE, [self.name.as_str()]))
            .with(Requirement::in_values(labels::ARCH, [self.architecture.as_str()]))
            .with(Requirement::in_values(
                labels::OS,
                self.operating_systems.iter().map(String::as_str),
            ))
            .with(Requirement::in_values(
                labels::ZONE,
                self.offerings.iter().map(|o| o.zone.as_str()),
            ))
            .with(Requirement::in_values(
                labels::CAPACITY_TYPE,
                self.offerings.iter().map(|o| o.capacity_type.as_str()),
            ));
        if capacity.contains(CPU) {
            let cpu = capacity.get(CPU).ceil_units().to_string();
            requirements.add(Requirement::in_values(labels::INSTANCE_CPU, [cpu]));
        }
        if capacity.contains(MEMORY) {
            let nanos = capacity.get(MEMORY).nanos();
            let mib = (nanos / MEBIBYTE + i128::from(nanos % MEBIBYTE != 0)).to_string();
            requirements.add(Requirement::in_values(labels::INSTANCE_MEMORY, [mib]));
        }
        for (key, value) in &self.labels {
            requirements.add(Requirement::in_values(key.as_str(), [value.as_str()]));
        }

        let offerings = self
            .offerings
            .into_iter()
            .map(|o| Offering {
                zone: Zone(o.zone),
                capacity_type: o.capacity_type,
                price: o.price,
                available: o.available,
            })
            .collect::<Offerings>();

        Ok(CatalogEntry {
            name: self.name,
            requirements,
            offerings,
            capacity,
        })
    }
}

/// Parse a YAML catalog, keeping declaration order.
pub fn parse(yaml: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let file: CatalogFile = serde_yaml::from_str(yaml)?;
    file.instance_types
        .into_iter()
        .map(InstanceTypeSpec::into_entry)
        .collect()
}

/// Catalog backed by a YAML file, re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn fetch(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CatalogError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        parse(&raw)
    }
}
