use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::info;

use crate::infrastructure::{InfrastructureError, LaunchRequest, Machine, MachinePhase, ProviderId};
use crate::labels;

const KWOK_ANNOTATION: &str = "kwok.x-k8s.io/node";

fn machine_from_node(node: &Node) -> Option<Machine> {
    let node_labels = node.labels();
    let node_claim = node_labels.get(labels::NODE_CLAIM)?.clone();
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    Some(Machine {
        name: node.name_any(),
        node_claim,
        provider_id: node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.clone())
            .map(ProviderId),
        node_name: Some(node.name_any()),
        labels: node_labels.clone(),
        phase: if node.metadata.deletion_timestamp.is_some() {
            MachinePhase::Deleting
        } else if ready {
            MachinePhase::Running
        } else {
            MachinePhase::Provisioning
        },
    })
}

/// Kubernetes WithOut Kubelet delegate: every machine is a fake `Node`
/// object that kwok keeps alive.
pub struct KwokInfrastructure {
    client: Client,
}

impl KwokInfrastructure {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Create the node for `request.node_claim`, or adopt the one an earlier
    /// attempt already created.
    pub async fn create(&self, request: &LaunchRequest<'_>) -> Result<Machine, InfrastructureError> {
        if let Some(existing) = self.find(request.node_claim).await? {
            info!(node = %existing.name, node_claim = request.node_claim, "adopting existing kwok node");
            return Ok(existing);
        }

        let name = format!("kwok-{}", uuid::Uuid::new_v4());
        let provider_id = format!("kwok://{name}");

        let mut node_labels = request.labels.clone();
        node_labels.insert("type".into(), "kwok".into());
        node_labels.insert(labels::NODE_CLAIM.into(), request.node_claim.into());
        node_labels.insert(labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into());
        node_labels.insert("kubernetes.io/hostname".into(), name.clone());

        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(node_labels),
                annotations: Some(BTreeMap::from([(KWOK_ANNOTATION.into(), "fake".into())])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(request.instance_type.capacity.to_quantities()),
                allocatable: Some(request.instance_type.allocatable().to_quantities()),
                ..Default::default()
            }),
        };
        let created = self
            .nodes()
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| InfrastructureError::CreationFailed {
                message: e.to_string(),
            })?;
        info!(node = %name, instance_type = %request.instance_type.name, "created kwok node");
        machine_from_node(&created).ok_or(InfrastructureError::MissingConfig {
            field: "metadata.labels",
        })
    }

    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>, InfrastructureError> {
        let lp = ListParams::default().labels(selector);
        Ok(self.nodes().list(&lp).await?.items)
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<Machine, InfrastructureError> {
        self.list()
            .await?
            .into_iter()
            .find(|m| m.provider_id.as_ref() == Some(provider_id))
            .ok_or_else(|| InfrastructureError::NotFound(provider_id.to_string()))
    }

    pub async fn find(&self, node_claim: &str) -> Result<Option<Machine>, InfrastructureError> {
        let selector = format!("{}={node_claim}", labels::NODE_CLAIM);
        Ok(self
            .list_nodes(&selector)
            .await?
            .iter()
            .find_map(machine_from_node))
    }

    /// Delete every node owned by `node_claim`.
    pub async fn delete(&self, node_claim: &str) -> Result<(), InfrastructureError> {
        let selector = format!("{}={node_claim}", labels::NODE_CLAIM);
        let mut deleted = 0;
        for node in self.list_nodes(&selector).await? {
            let name = node.name_any();
            match self.nodes().delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(node = %name, node_claim, "deleted kwok node");
                    deleted += 1;
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(InfrastructureError::DeletionFailed {
                        message: e.to_string(),
                    });
                }
            }
        }
        if deleted == 0 {
            return Err(InfrastructureError::NotFound(node_claim.to_string()));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Machine>, InfrastructureError> {
        Ok(self
            .list_nodes(&labels::managed_by_selector())
            .await?
            .iter()
            .filter_map(machine_from_node)
            .collect())
    }
}
