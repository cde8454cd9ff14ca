//! Turns a NodeClaim into the list of catalog instance types that could
//! satisfy it.
//!
//! A type survives when its static requirements are compatible with the
//! claim, at least one of its offerings is both available and compatible,
//! and the claim's resource requests fit its allocatable capacity. Order is
//! the catalog's; nothing here ranks or picks.

use kube::ResourceExt;
use thiserror::Error;
use tracing::debug;

use crate::apis::node_claim::NodeClaim;
use crate::apis::node_class::CapiNodeClass;
use crate::catalog::{Catalog, CatalogError};
use crate::instance_type::InstanceType;
use crate::offering::Offering;
use crate::requirements::{Compatibility, Incompatibility, RequirementError, Requirements};
use crate::resources::{QuantityParseError, Resources, fits};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("invalid requirements: {0}")]
    Requirements(#[from] RequirementError),
    #[error("invalid resource request: {0}")]
    Quantity(#[from] QuantityParseError),
}

/// Why an instance type was dropped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Infeasible {
    #[error("incompatible requirements: {0}")]
    Requirements(#[from] Incompatibility),
    #[error("no available offering matches the requirements")]
    NoOffering,
    #[error("requested resources do not fit allocatable capacity")]
    ResourcesDoNotFit,
}

/// The parts of a NodeClaim the resolver looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub requirements: Requirements,
    pub requests: Resources,
}

impl Query {
    pub fn from_node_claim(node_claim: &NodeClaim) -> Result<Query, ResolveError> {
        Ok(Query {
            requirements: Requirements::from_node_selector(&node_claim.spec.requirements)?,
            requests: Resources::from_quantities(&node_claim.spec.resources.requests)?,
        })
    }

    pub fn admits(&self, instance_type: &InstanceType) -> Result<(), Incompatibility> {
        self.requirements.compatible(
            &instance_type.requirements,
            Compatibility::AllowUndefinedWellKnownLabels,
        )
    }

    pub fn admits_offering(&self, offering: &Offering) -> bool {
        offering.compatible_with(&self.requirements)
    }

    pub fn fits(&self, instance_type: &InstanceType) -> bool {
        fits(&self.requests, &instance_type.allocatable())
    }

    /// All three feasibility checks, in order.
    pub fn check(&self, instance_type: &InstanceType) -> Result<(), Infeasible> {
        self.admits(instance_type)?;
        if instance_type
            .offerings
            .compatible(&self.requirements)
            .available()
            .is_empty()
        {
            return Err(Infeasible::NoOffering);
        }
        if !self.fits(instance_type) {
            return Err(Infeasible::ResourcesDoNotFit);
        }
        Ok(())
    }

    /// Keep the feasible instance types, in their original order.
    pub fn filter_feasible(&self, instance_types: Vec<InstanceType>) -> Vec<InstanceType> {
        instance_types
            .into_iter()
            .filter(|it| match self.check(it) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(instance_type = %it.name, %reason, "instance type excluded");
                    false
                }
            })
            .collect()
    }
}

/// Resolve the instance types that can host `node_claim` under `node_class`.
///
/// An empty catalog, or one where nothing survives, resolves to an empty
/// list rather than an error.
pub async fn resolve(
    catalog: &Catalog,
    node_claim: &NodeClaim,
    node_class: &CapiNodeClass,
) -> Result<Vec<InstanceType>, ResolveError> {
    let query = Query::from_node_claim(node_claim)?;
    let candidates = catalog
        .list(node_claim.spec.kubelet.as_ref(), node_class)
        .await?;
    let total = candidates.len();
    let feasible = query.filter_feasible(candidates);
    debug!(
        node_claim = %node_claim.name_any(),
        candidates = total,
        feasible = feasible.len(),
        "resolved instance types"
    );
    Ok(feasible)
}
