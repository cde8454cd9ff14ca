//! Infrastructure delegates: the things that actually make machines.

pub mod capi;
pub mod fake;
pub mod kwok;

use std::collections::BTreeMap;
use std::fmt;

use crate::apis::node_class::CapiNodeClass;
use crate::infrastructure::capi::CapiInfrastructure;
use crate::infrastructure::fake::FakeInfrastructure;
use crate::infrastructure::kwok::KwokInfrastructure;
use crate::instance_type::InstanceType;
use crate::labels;
use crate::offering::Offering;

/// Node provider ID, e.g. `aws:///us-east-1a/i-0abc` or `kwok://kwok-1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(pub String);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    Pending,
    Provisioning,
    Running,
    Failed,
    Deleting,
}

impl MachinePhase {
    /// Map a Cluster API `Machine.status.phase`.
    pub fn from_capi(phase: &str) -> Self {
        match phase {
            "Running" => Self::Running,
            "Provisioning" | "Provisioned" => Self::Provisioning,
            "Deleting" | "Deleted" => Self::Deleting,
            "Failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// A machine as a delegate reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    /// Name of the delegate's backing object.
    pub name: String,
    pub node_claim: String,
    /// Set once the infrastructure has assigned one.
    pub provider_id: Option<ProviderId>,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub phase: MachinePhase,
}

impl Machine {
    pub fn instance_type(&self) -> Option<&str> {
        self.labels.get(labels::INSTANCE_TYPE).map(String::as_str)
    }
}

/// Everything a delegate needs to launch one machine.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub node_claim: &'a str,
    pub instance_type: &'a InstanceType,
    pub offering: &'a Offering,
    pub node_class: &'a CapiNodeClass,
    /// Labels the resulting node should carry.
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    /// The delegate couldn't create the machine at all.
    /// Bad permissions, quota exceeded, invalid template, etc.
    #[error("creation failed: {message}")]
    CreationFailed { message: String },

    #[error("deletion failed: {message}")]
    DeletionFailed { message: String },

    /// The chosen offering can't be fulfilled right now.
    #[error("offering unavailable: {0}")]
    OfferingUnavailable(String),

    #[error("machine not found: {0}")]
    NotFound(String),

    /// Required config field missing for this delegate.
    #[error("missing required config: {field}")]
    MissingConfig { field: &'static str },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Underlying API/network error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Provide machines from a given backend.
pub enum Infrastructure {
    Capi(CapiInfrastructure),
    Kwok(KwokInfrastructure),
    Fake(FakeInfrastructure),
}

impl Infrastructure {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Capi(_) => "capi",
            Self::Kwok(_) => "kwok",
            Self::Fake(_) => "fake",
        }
    }

    pub async fn create(&self, request: &LaunchRequest<'_>) -> Result<Machine, InfrastructureError> {
        match self {
            Self::Capi(p) => p.create(request).await,
            Self::Kwok(p) => p.create(request).await,
            Self::Fake(p) => p.create(request).await,
        }
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<Machine, InfrastructureError> {
        match self {
            Self::Capi(p) => p.get(provider_id).await,
            Self::Kwok(p) => p.get(provider_id).await,
            Self::Fake(p) => p.get(provider_id).await,
        }
    }

    /// The machine backing `node_claim`, if one exists.
    pub async fn find(&self, node_claim: &str) -> Result<Option<Machine>, InfrastructureError> {
        match self {
            Self::Capi(p) => p.find(node_claim).await,
            Self::Kwok(p) => p.find(node_claim).await,
            Self::Fake(p) => p.find(node_claim).await,
        }
    }

    /// Remove the machine backing `node_claim`. Returns `NotFound` when there
    /// is nothing to remove.
    pub async fn delete(&self, node_claim: &str) -> Result<(), InfrastructureError> {
        match self {
            Self::Capi(p) => p.delete(node_claim).await,
            Self::Kwok(p) => p.delete(node_claim).await,
            Self::Fake(p) => p.delete(node_claim).await,
        }
    }

    pub async fn list(&self) -> Result<Vec<Machine>, InfrastructureError> {
        match self {
            Self::Capi(p) => p.list().await,
            Self::Kwok(p) => p.list().await,
            Self::Fake(p) => p.list().await,
        }
    }
}
