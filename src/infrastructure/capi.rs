//! Cluster API delegate.
//!
//! A launch clones the node class's infrastructure machine template with
//! the chosen instance type written into it, then creates a one-replica
//! `MachineDeployment` pinned to the offering's zone. Both objects carry the
//! NodeClaim label so they can be found again for get, list and delete.

use std::collections::BTreeMap;

use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::{Client, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::infrastructure::{InfrastructureError, LaunchRequest, Machine, MachinePhase, ProviderId};
use crate::labels;

const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Split `group/version`; core types have an empty group.
fn parse_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

fn machine_deployments() -> ApiResource {
    api_resource(CLUSTER_API_VERSION, "MachineDeployment")
}

fn machines() -> ApiResource {
    api_resource(CLUSTER_API_VERSION, "Machine")
}

fn node_claim_selector(node_claim: &str) -> String {
    format!("{}={node_claim}", labels::NODE_CLAIM)
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == code)
}

/// Write `value` at the dot-separated `path`, creating intermediate maps.
fn set_path(object: &mut Value, path: &str, value: Value) -> Result<(), InfrastructureError> {
    let invalid = |reason: &str| InfrastructureError::CreationFailed {
        message: format!("cannot set template field {path:?}: {reason}"),
    };
    let mut segments = path.split('.').peekable();
    let mut current = object;
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        let map = current
            .as_object_mut()
            .ok_or_else(|| invalid("parent is not an object"))?;
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }
        current = map
            .entry(segment)
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Err(invalid("empty path"))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn machine_from_capi_machine(machine: &DynamicObject) -> Option<Machine> {
    let node_claim = machine.labels().get(labels::NODE_CLAIM)?.clone();
    let phase = if machine.metadata.deletion_timestamp.is_some() {
        MachinePhase::Deleting
    } else {
        MachinePhase::from_capi(str_at(&machine.data, "/status/phase").unwrap_or_default())
    };
    Some(Machine {
        name: machine.name_any(),
        node_claim,
        provider_id: str_at(&machine.data, "/spec/providerID").map(|id| ProviderId(id.to_string())),
        node_name: str_at(&machine.data, "/status/nodeRef/name").map(str::to_string),
        labels: machine.labels().clone(),
        phase,
    })
}

/// A deployment whose Machine doesn't exist yet.
fn machine_from_deployment(deployment: &DynamicObject) -> Option<Machine> {
    let node_claim = deployment.labels().get(labels::NODE_CLAIM)?.clone();
    let template_labels = deployment
        .data
        .pointer("/spec/template/metadata/labels")
        .and_then(|l| serde_json::from_value::<BTreeMap<String, String>>(l.clone()).ok())
        .unwrap_or_else(|| deployment.labels().clone());
    Some(Machine {
        name: deployment.name_any(),
        node_claim,
        provider_id: None,
        node_name: None,
        labels: template_labels,
        phase: if deployment.metadata.deletion_timestamp.is_some() {
            MachinePhase::Deleting
        } else {
            MachinePhase::Pending
        },
    })
}

async fn create_or_adopt(
    api: &Api<DynamicObject>,
    object: &DynamicObject,
) -> Result<DynamicObject, InfrastructureError> {
    match api.create(&PostParams::default(), object).await {
        Ok(created) => Ok(created),
        Err(e) if is_status(&e, 409) => {
            debug!(name = %object.name_any(), "object already exists, adopting");
            Ok(api.get(&object.name_any()).await?)
        }
        Err(e) => Err(InfrastructureError::CreationFailed {
            message: e.to_string(),
        }),
    }
}

pub struct CapiInfrastructure {
    client: Client,
}

impl CapiInfrastructure {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn owned_labels(&self, node_claim: &str, cluster_name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::NODE_CLAIM.to_string(), node_claim.to_string()),
            (labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string()),
            (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        ])
    }

    pub async fn create(&self, request: &LaunchRequest<'_>) -> Result<Machine, InfrastructureError> {
        fail::fail_point!("capi-create", |message: Option<String>| {
            Err(InfrastructureError::CreationFailed {
                message: message.unwrap_or_else(|| "injected failure".to_string()),
            })
        });

        let spec = &request.node_class.spec;
        let namespace = spec.namespace.as_str();
        let name = request.node_claim;
        let owned = self.owned_labels(name, &spec.cluster_name);

        // Clone the infrastructure template with the instance type set.
        let template_ref = &spec.infrastructure_template_ref;
        let template_resource = api_resource(&template_ref.api_version, &template_ref.kind);
        let templates: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &template_resource);
        let template = templates
            .get_opt(&template_ref.name)
            .await?
            .ok_or(InfrastructureError::MissingConfig {
                field: "infrastructureTemplateRef",
            })?;

        let mut data = template.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.remove("status");
        }
        set_path(
            &mut data,
            &spec.instance_type_field,
            Value::String(request.instance_type.name.clone()),
        )?;
        let mut clone = DynamicObject::new(name, &template_resource)
            .within(namespace)
            .data(data);
        clone.metadata.labels = Some(owned.clone());
        create_or_adopt(&templates, &clone).await?;

        // One-replica MachineDeployment referencing the clone.
        let mut template_labels = request.labels.clone();
        template_labels.extend(owned.clone());
        let mut deployment_spec = json!({
            "clusterName": spec.cluster_name,
            "replicas": 1,
            "selector": { "matchLabels": { (labels::NODE_CLAIM): name } },
            "template": {
                "metadata": { "labels": template_labels },
                "spec": {
                    "clusterName": spec.cluster_name,
                    "failureDomain": request.offering.zone.0,
                    "bootstrap": {
                        "configRef": {
                            "apiVersion": spec.bootstrap_config_ref.api_version,
                            "kind": spec.bootstrap_config_ref.kind,
                            "name": spec.bootstrap_config_ref.name,
                        }
                    },
                    "infrastructureRef": {
                        "apiVersion": template_ref.api_version,
                        "kind": template_ref.kind,
                        "name": name,
                    }
                }
            }
        });
        if let Some(version) = &spec.version {
            set_path(
                &mut deployment_spec,
                "template.spec.version",
                Value::String(version.clone()),
            )?;
        }

        let deployment_resource = machine_deployments();
        let mut deployment = DynamicObject::new(name, &deployment_resource)
            .within(namespace)
            .data(json!({ "spec": deployment_spec }));
        deployment.metadata.labels = Some(owned);
        deployment.metadata.annotations = Some(BTreeMap::from([
            (
                labels::TEMPLATE_API_VERSION_ANNOTATION.to_string(),
                template_ref.api_version.clone(),
            ),
            (labels::TEMPLATE_KIND_ANNOTATION.to_string(), template_ref.kind.clone()),
            (labels::TEMPLATE_NAME_ANNOTATION.to_string(), name.to_string()),
        ]));

        let deployments: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &deployment_resource);
        let created = create_or_adopt(&deployments, &deployment).await?;
        info!(
            node_claim = %name,
            instance_type = %request.instance_type.name,
            zone = %request.offering.zone,
            "created machine deployment"
        );
        machine_from_deployment(&created).ok_or(InfrastructureError::MissingConfig {
            field: "metadata.labels",
        })
    }

    async fn list_objects(
        &self,
        resource: &ApiResource,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, InfrastructureError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<Machine, InfrastructureError> {
        self.list_objects(&machines(), &labels::managed_by_selector())
            .await?
            .iter()
            .filter_map(machine_from_capi_machine)
            .find(|m| m.provider_id.as_ref() == Some(provider_id))
            .ok_or_else(|| InfrastructureError::NotFound(provider_id.to_string()))
    }

    pub async fn find(&self, node_claim: &str) -> Result<Option<Machine>, InfrastructureError> {
        let selector = node_claim_selector(node_claim);
        let found = self
            .list_objects(&machines(), &selector)
            .await?
            .iter()
            .find_map(machine_from_capi_machine);
        if found.is_some() {
            return Ok(found);
        }
        Ok(self
            .list_objects(&machine_deployments(), &selector)
            .await?
            .iter()
            .find_map(machine_from_deployment))
    }

    pub async fn delete(&self, node_claim: &str) -> Result<(), InfrastructureError> {
        let deployments = self
            .list_objects(&machine_deployments(), &node_claim_selector(node_claim))
            .await?;
        if deployments.is_empty() {
            return Err(InfrastructureError::NotFound(node_claim.to_string()));
        }

        for deployment in deployments {
            let namespace = deployment.namespace().unwrap_or_default();
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &machine_deployments());
            match api.delete(&deployment.name_any(), &DeleteParams::background()).await {
                Ok(_) => {}
                Err(e) if is_status(&e, 404) => {}
                Err(e) => {
                    return Err(InfrastructureError::DeletionFailed {
                        message: e.to_string(),
                    });
                }
            }

            let annotations = deployment.annotations();
            let template = (
                annotations.get(labels::TEMPLATE_API_VERSION_ANNOTATION),
                annotations.get(labels::TEMPLATE_KIND_ANNOTATION),
                annotations.get(labels::TEMPLATE_NAME_ANNOTATION),
            );
            if let (Some(api_version), Some(kind), Some(name)) = template {
                let templates: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    &namespace,
                    &api_resource(api_version, kind),
                );
                match templates.delete(name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(e) if is_status(&e, 404) => {}
                    Err(e) => {
                        return Err(InfrastructureError::DeletionFailed {
                            message: e.to_string(),
                        });
                    }
                }
            }
            info!(node_claim, deployment = %deployment.name_any(), "deleted machine deployment");
        }
        Ok(())
    }

    /// Every machine this provider owns. Deployments whose Machine hasn't
    /// appeared yet are reported as Pending.
    pub async fn list(&self) -> Result<Vec<Machine>, InfrastructureError> {
        let selector = labels::managed_by_selector();
        let mut by_claim: BTreeMap<String, Machine> = self
            .list_objects(&machines(), &selector)
            .await?
            .iter()
            .filter_map(machine_from_capi_machine)
            .map(|m| (m.node_claim.clone(), m))
            .collect();
        for deployment in self.list_objects(&machine_deployments(), &selector).await? {
            if let Some(machine) = machine_from_deployment(&deployment) {
                by_claim.entry(machine.node_claim.clone()).or_insert(machine);
            }
        }
        Ok(by_claim.into_values().collect())
    }
}
