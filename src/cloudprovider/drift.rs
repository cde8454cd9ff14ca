use std::fmt;

/// Why a launched NodeClaim no longer matches what would be launched today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftReason {
    /// The node class spec changed since launch.
    NodeClassDrift,
    /// The instance type is no longer offered for this node class.
    InstanceTypeDrift,
    /// The instance type or its launched offering no longer satisfy the
    /// claim's requirements or requests.
    RequirementsDrift,
}

impl DriftReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeClassDrift => "NodeClassDrift",
            Self::InstanceTypeDrift => "InstanceTypeDrift",
            Self::RequirementsDrift => "RequirementsDrift",
        }
    }
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
