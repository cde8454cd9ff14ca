#![allow(dead_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use capi_provider::apis::node_claim::{
    NodeClaim, NodeClaimSpec, NodeClassReference, NodeSelectorRequirementWithMinValues,
    ResourceRequirements,
};
use capi_provider::apis::node_class::{CapiNodeClass, CapiNodeClassSpec, NodeClassStore, TemplateReference};
use capi_provider::catalog::fake::FakeCatalog;
use capi_provider::catalog::file::{InstanceTypeSpec, OfferingSpec};
use capi_provider::catalog::{Catalog, CatalogSource};
use capi_provider::cloudprovider::CloudProvider;
use capi_provider::infrastructure::Infrastructure;
use capi_provider::infrastructure::fake::FakeInfrastructure;
use capi_provider::offering::CapacityType;
use capi_provider::requirements::Operator;

pub fn requirement(key: &str, operator: Operator, values: &[&str]) -> NodeSelectorRequirementWithMinValues {
    NodeSelectorRequirementWithMinValues {
        key: key.into(),
        operator,
        values: values.iter().map(|v| v.to_string()).collect(),
        min_values: None,
    }
}

pub fn node_claim(
    name: &str,
    requirements: Vec<NodeSelectorRequirementWithMinValues>,
    requests: &[(&str, &str)],
) -> NodeClaim {
    NodeClaim::new(
        name,
        NodeClaimSpec {
            requirements,
            resources: ResourceRequirements {
                requests: requests
                    .iter()
                    .map(|(resource, quantity)| (resource.to_string(), Quantity(quantity.to_string())))
                    .collect(),
            },
            node_class_ref: Some(NodeClassReference {
                kind: "CapiNodeClass".into(),
                name: "default".into(),
                api_version: Some("capi.karpenter.sh/v1alpha1".into()),
            }),
            ..Default::default()
        },
    )
}

pub fn node_class(instance_types: &[&str]) -> CapiNodeClass {
    CapiNodeClass::new(
        "default",
        CapiNodeClassSpec {
            cluster_name: "prod".into(),
            namespace: "capi".into(),
            infrastructure_template_ref: TemplateReference {
                api_version: "infrastructure.cluster.x-k8s.io/v1beta1".into(),
                kind: "HCloudMachineTemplate".into(),
                name: "workers".into(),
            },
            bootstrap_config_ref: TemplateReference {
                api_version: "bootstrap.cluster.x-k8s.io/v1beta1".into(),
                kind: "KubeadmConfigTemplate".into(),
                name: "workers".into(),
            },
            version: Some("v1.31.0".into()),
            instance_types: instance_types.iter().map(|s| s.to_string()).collect(),
            instance_type_field: "spec.template.spec.type".into(),
        },
    )
}

/// An on-demand instance type with the given allocatable cpu / memory.
pub fn instance_type(name: &str, cpu: &str, memory: &str, offerings: Vec<OfferingSpec>) -> InstanceTypeSpec {
    offerings.into_iter().fold(
        InstanceTypeSpec::new(name)
            .with_capacity("cpu", cpu)
            .with_capacity("memory", memory),
        InstanceTypeSpec::with_offering,
    )
}

pub fn on_demand(zone: &str, price: f64) -> OfferingSpec {
    OfferingSpec::new(zone, CapacityType::OnDemand, price)
}

pub fn catalog(specs: Vec<InstanceTypeSpec>) -> (Arc<Catalog>, FakeCatalog) {
    let fake = FakeCatalog::new().with_instance_types(specs);
    (Arc::new(Catalog::new(CatalogSource::Fake(fake.clone()))), fake)
}

pub fn provider(catalog: Arc<Catalog>, infra: FakeInfrastructure) -> CloudProvider {
    CloudProvider::new(
        catalog,
        NodeClassStore::from_classes([node_class(&[])]),
        Infrastructure::Fake(infra),
    )
}
