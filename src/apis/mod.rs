pub mod node_claim;
pub mod node_class;
pub mod node_pool;

pub use node_claim::{NodeClaim, NodeClaimSpec, NodeClaimStatus};
pub use node_class::{CapiNodeClass, CapiNodeClassSpec, NodeClassStore};
pub use node_pool::{NodePool, NodePoolSpec};
