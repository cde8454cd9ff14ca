//! The cloud provider contract the autoscaler drives per NodeClaim:
//! create, get, delete, list, drift detection and instance type listing.
//!
//! Holds no mutable state of its own. Every operation reads one catalog
//! snapshot and awaits its collaborators; a shutdown signal aborts the
//! in-flight collaborator call and surfaces as [`CloudProviderError::Cancelled`].

pub mod drift;
pub mod lifecycle;

use std::future::Future;
use std::sync::Arc;

use kube::ResourceExt;
use kube::api::GroupVersionKind;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::apis::node_claim::{
    CONDITION_LAUNCHED, CONDITION_READY, NodeClaim, NodeClaimSpec, NodeClaimStatus,
    STATUS_FALSE, STATUS_TRUE, STATUS_UNKNOWN,
};
use crate::apis::node_class::{CapiNodeClass, NodeClassError, NodeClassStore};
use crate::apis::node_pool::NodePool;
use crate::catalog::{Catalog, CatalogError};
use crate::cloudprovider::drift::DriftReason;
use crate::cloudprovider::lifecycle::{ClaimState, InvalidTransition, Observation};
use crate::infrastructure::{
    Infrastructure, InfrastructureError, LaunchRequest, Machine, MachinePhase, ProviderId,
};
use crate::instance_type::InstanceType;
use crate::labels;
use crate::offering::Offering;
use crate::requirements::{Compatibility, Requirement, Requirements};
use crate::resolver::{Query, ResolveError, resolve};

#[derive(Debug, Error)]
pub enum CloudProviderError {
    /// Nothing in the catalog can host the claim right now. Retry with a
    /// different pool or relaxed constraints.
    #[error("insufficient capacity for nodeclaim {node_claim}: {reason}")]
    InsufficientCapacity { node_claim: String, reason: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("infrastructure {operation} failed{}: {source}", context(.node_claim, .instance_type))]
    Infrastructure {
        operation: &'static str,
        node_claim: Option<String>,
        instance_type: Option<String>,
        #[source]
        source: InfrastructureError,
    },

    #[error("no machine found for provider id {provider_id}")]
    NotFound { provider_id: String },

    #[error(transparent)]
    NodeClass(#[from] NodeClassError),

    #[error("invalid nodeclaim: {0}")]
    InvalidNodeClaim(#[source] ResolveError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("operation cancelled")]
    Cancelled,
}

fn context(node_claim: &Option<String>, instance_type: &Option<String>) -> String {
    match (node_claim, instance_type) {
        (Some(claim), Some(it)) => format!(" for nodeclaim {claim} ({it})"),
        (Some(claim), None) => format!(" for nodeclaim {claim}"),
        (None, Some(it)) => format!(" for {it}"),
        (None, None) => String::new(),
    }
}

impl From<ResolveError> for CloudProviderError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Catalog(e) => Self::Catalog(e),
            other => Self::InvalidNodeClaim(other),
        }
    }
}

impl CloudProviderError {
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Cluster API backed cloud provider.
pub struct CloudProvider {
    catalog: Arc<Catalog>,
    node_classes: NodeClassStore,
    infrastructure: Infrastructure,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CloudProvider {
    pub fn new(
        catalog: Arc<Catalog>,
        node_classes: NodeClassStore,
        infrastructure: Infrastructure,
    ) -> Self {
        Self {
            catalog,
            node_classes,
            infrastructure,
            shutdown: None,
        }
    }

    /// Abort in-flight collaborator calls once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn name(&self) -> &'static str {
        self.infrastructure.name()
    }

    pub fn supported_node_classes(&self) -> Vec<GroupVersionKind> {
        vec![CapiNodeClass::gvk()]
    }

    pub async fn liveness_probe(&self) -> Result<(), CloudProviderError> {
        Ok(self.catalog.liveness_probe().await?)
    }

    async fn cancellable<F: Future>(&self, future: F) -> Result<F::Output, CloudProviderError> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return Ok(future.await);
        };
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => Err(CloudProviderError::Cancelled),
            output = future => Ok(output),
        }
    }

    async fn node_class(&self, node_claim: &NodeClaim) -> Result<CapiNodeClass, CloudProviderError> {
        let reference = node_claim
            .spec
            .node_class_ref
            .as_ref()
            .ok_or(NodeClassError::MissingReference)?;
        Ok(self.cancellable(self.node_classes.get(reference)).await??)
    }

    /// Launch a machine for `node_claim` and return the claim as launched.
    pub async fn create(&self, node_claim: &NodeClaim) -> Result<NodeClaim, CloudProviderError> {
        let name = node_claim.name_any();
        let mut state = ClaimState::of(node_claim).transition(ClaimState::Resolving)?;

        let node_class = self.node_class(node_claim).await?;
        let instance_types = self
            .cancellable(resolve(&self.catalog, node_claim, &node_class))
            .await??;
        let query = Query::from_node_claim(node_claim)?;

        if instance_types.is_empty() {
            state.transition(ClaimState::Infeasible)?;
            return Err(CloudProviderError::InsufficientCapacity {
                node_claim: name,
                reason: "no instance type satisfies the requirements and requests".into(),
            });
        }
        if let Err(shortfall) = query
            .requirements
            .satisfies_min_values(instance_types.iter().map(|it| &it.requirements))
        {
            state.transition(ClaimState::Infeasible)?;
            return Err(CloudProviderError::InsufficientCapacity {
                node_claim: name,
                reason: shortfall.to_string(),
            });
        }

        let Some((instance_type, offering)) = cheapest_offering(&query, &instance_types) else {
            state.transition(ClaimState::Infeasible)?;
            return Err(CloudProviderError::InsufficientCapacity {
                node_claim: name,
                reason: "no available offering".into(),
            });
        };
        state = state.transition(ClaimState::Feasible)?;

        let mut node_labels = query.requirements.labels();
        node_labels.extend(instance_type.requirements.labels());
        node_labels.insert(labels::INSTANCE_TYPE.into(), instance_type.name.clone());
        node_labels.insert(labels::ZONE.into(), offering.zone.0.clone());
        node_labels.insert(
            labels::CAPACITY_TYPE.into(),
            offering.capacity_type.as_str().into(),
        );

        let request = LaunchRequest {
            node_claim: &name,
            instance_type,
            offering: &offering,
            node_class: &node_class,
            labels: node_labels.clone(),
        };
        let machine = match self.cancellable(self.infrastructure.create(&request)).await? {
            Ok(machine) => machine,
            Err(InfrastructureError::OfferingUnavailable(reason)) => {
                state.transition(ClaimState::Infeasible)?;
                return Err(CloudProviderError::InsufficientCapacity {
                    node_claim: name,
                    reason,
                });
            }
            Err(source) => {
                return Err(CloudProviderError::Infrastructure {
                    operation: "create",
                    node_claim: Some(name),
                    instance_type: Some(instance_type.name.clone()),
                    source,
                });
            }
        };
        state = state.transition(ClaimState::Delegated)?;

        info!(
            node_claim = %name,
            instance_type = %instance_type.name,
            zone = %offering.zone,
            capacity_type = %offering.capacity_type.as_str(),
            price = offering.price,
            machine = %machine.name,
            "launched machine"
        );

        let mut launched = node_claim.clone();
        launched.labels_mut().extend(node_labels);
        launched
            .annotations_mut()
            .insert(labels::NODE_CLASS_HASH_ANNOTATION.into(), node_class.hash());
        let status = launched.status.get_or_insert_with(NodeClaimStatus::default);
        status.provider_id = machine.provider_id.as_ref().map(ToString::to_string);
        status.node_name = machine.node_name.clone();
        status.capacity = instance_type.capacity.to_quantities();
        status.allocatable = instance_type.allocatable().to_quantities();
        status.set_condition(CONDITION_LAUNCHED, STATUS_TRUE, Some("Launched"), None);
        if let Some(observation) = set_readiness(status, machine.phase) {
            state.transition(ClaimState::Observed(observation))?;
        }
        Ok(launched)
    }

    /// The machine behind `provider_id`, as a NodeClaim.
    pub async fn get(&self, provider_id: &ProviderId) -> Result<NodeClaim, CloudProviderError> {
        let machine = match self.cancellable(self.infrastructure.get(provider_id)).await? {
            Ok(machine) => machine,
            Err(InfrastructureError::NotFound(_)) => {
                return Err(CloudProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                });
            }
            Err(source) => {
                return Err(CloudProviderError::Infrastructure {
                    operation: "get",
                    node_claim: None,
                    instance_type: None,
                    source,
                });
            }
        };
        self.node_claim_from_machine(machine).await
    }

    /// The machine launched for `node_claim`, looked up by claim name rather
    /// than provider ID. `None` when there is no such machine.
    pub async fn find(&self, node_claim: &NodeClaim) -> Result<Option<NodeClaim>, CloudProviderError> {
        let name = node_claim.name_any();
        let machine = self
            .cancellable(self.infrastructure.find(&name))
            .await?
            .map_err(|source| CloudProviderError::Infrastructure {
                operation: "find",
                node_claim: Some(name),
                instance_type: node_claim.labels().get(labels::INSTANCE_TYPE).cloned(),
                source,
            })?;
        match machine {
            Some(machine) => Ok(Some(self.node_claim_from_machine(machine).await?)),
            None => Ok(None),
        }
    }

    /// Tear down the machine behind `node_claim`. A machine that is already
    /// gone, or never existed, is not an error.
    pub async fn delete(&self, node_claim: &NodeClaim) -> Result<(), CloudProviderError> {
        let name = node_claim.name_any();
        let state = ClaimState::of(node_claim);
        debug!(node_claim = %name, ?state, "tearing down nodeclaim");
        match self.cancellable(self.infrastructure.delete(&name)).await? {
            Ok(()) => {
                info!(node_claim = %name, "deleted machine");
                Ok(())
            }
            Err(InfrastructureError::NotFound(_)) => {
                debug!(node_claim = %name, "no machine to delete");
                Ok(())
            }
            Err(source) => Err(CloudProviderError::Infrastructure {
                operation: "delete",
                node_claim: Some(name),
                instance_type: node_claim.labels().get(labels::INSTANCE_TYPE).cloned(),
                source,
            }),
        }
    }

    /// Every NodeClaim this provider has a machine for.
    pub async fn list(&self) -> Result<Vec<NodeClaim>, CloudProviderError> {
        let machines = self
            .cancellable(self.infrastructure.list())
            .await?
            .map_err(|source| CloudProviderError::Infrastructure {
                operation: "list",
                node_claim: None,
                instance_type: None,
                source,
            })?;
        let mut node_claims = Vec::with_capacity(machines.len());
        for machine in machines {
            node_claims.push(self.node_claim_from_machine(machine).await?);
        }
        Ok(node_claims)
    }

    /// The catalog as `node_pool`'s node class and kubelet settings see it.
    /// Not filtered for feasibility.
    pub async fn get_instance_types(
        &self,
        node_pool: &NodePool,
    ) -> Result<Vec<InstanceType>, CloudProviderError> {
        let spec = &node_pool.spec.template.spec;
        let Some(reference) = spec.node_class_ref.as_ref() else {
            return Ok(Vec::new());
        };
        let node_class = match self.cancellable(self.node_classes.get(reference)).await? {
            Ok(node_class) => node_class,
            Err(NodeClassError::NotFound { name }) => {
                debug!(node_pool = %node_pool.name_any(), node_class = %name, "node class not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self
            .cancellable(self.catalog.list(spec.kubelet.as_ref(), &node_class))
            .await??)
    }

    /// Whether a launched claim's machine would still be chosen today.
    /// Unlaunched claims are never drifted.
    pub async fn is_drifted(
        &self,
        node_claim: &NodeClaim,
    ) -> Result<Option<DriftReason>, CloudProviderError> {
        let node_labels = node_claim.labels();
        let Some(instance_type_name) = node_labels.get(labels::INSTANCE_TYPE) else {
            return Ok(None);
        };

        let node_class = self.node_class(node_claim).await?;
        if let Some(hash) = node_claim.annotations().get(labels::NODE_CLASS_HASH_ANNOTATION) {
            if *hash != node_class.hash() {
                return Ok(Some(DriftReason::NodeClassDrift));
            }
        }

        let instance_types = self
            .cancellable(self.catalog.list(node_claim.spec.kubelet.as_ref(), &node_class))
            .await??;
        let Some(instance_type) = instance_types
            .iter()
            .find(|it| &it.name == instance_type_name)
        else {
            return Ok(Some(DriftReason::InstanceTypeDrift));
        };

        let query = Query::from_node_claim(node_claim)?;
        if query.admits(instance_type).is_err() || !query.fits(instance_type) {
            return Ok(Some(DriftReason::RequirementsDrift));
        }

        let mut launched_offering = Requirements::new();
        for key in [labels::ZONE, labels::CAPACITY_TYPE] {
            if let Some(value) = node_labels.get(key) {
                launched_offering.add(Requirement::in_values(key, [value.as_str()]));
            }
        }
        if query
            .requirements
            .compatible(&launched_offering, Compatibility::AllowUndefinedWellKnownLabels)
            .is_err()
        {
            return Ok(Some(DriftReason::RequirementsDrift));
        }
        Ok(None)
    }

    async fn node_claim_from_machine(&self, machine: Machine) -> Result<NodeClaim, CloudProviderError> {
        let mut node_claim = NodeClaim::new(&machine.node_claim, NodeClaimSpec::default());
        let mut status = NodeClaimStatus {
            provider_id: machine.provider_id.as_ref().map(ToString::to_string),
            node_name: machine.node_name.clone(),
            ..Default::default()
        };
        if let Some(name) = machine.instance_type() {
            if let Some(entry) = self.cancellable(self.catalog.entry(name)).await?? {
                status.capacity = entry.capacity.to_quantities();
            }
        }
        status.set_condition(CONDITION_LAUNCHED, STATUS_TRUE, Some("Launched"), None);
        set_readiness(&mut status, machine.phase);
        node_claim.metadata.labels = Some(machine.labels);
        node_claim.status = Some(status);
        Ok(node_claim)
    }
}

/// Resolves once shutdown is signalled. A dropped sender never cancels.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.map(|_| ()).is_err() {
        std::future::pending::<()>().await;
    }
}

/// The cheapest compatible, available offering across all feasible types.
/// Ties go to the instance type listed first.
fn cheapest_offering<'a>(
    query: &Query,
    instance_types: &'a [InstanceType],
) -> Option<(&'a InstanceType, Offering)> {
    instance_types
        .iter()
        .filter_map(|it| {
            let offering = it
                .offerings
                .compatible(&query.requirements)
                .available()
                .cheapest()
                .cloned()?;
            Some((it, offering))
        })
        .fold(None, |best: Option<(&InstanceType, Offering)>, candidate| match best {
            Some(b) if b.1.price <= candidate.1.price => Some(b),
            _ => Some(candidate),
        })
}

/// Mirror the machine phase onto the `Ready` condition.
fn set_readiness(status: &mut NodeClaimStatus, phase: MachinePhase) -> Option<Observation> {
    let (value, observation) = match phase {
        MachinePhase::Running => (STATUS_TRUE, Some(Observation::Ready)),
        MachinePhase::Failed => (STATUS_FALSE, Some(Observation::Failed)),
        MachinePhase::Pending | MachinePhase::Provisioning | MachinePhase::Deleting => {
            (STATUS_UNKNOWN, None)
        }
    };
    status.set_condition(CONDITION_READY, value, Some(&phase.to_string()), None);
    observation
}
