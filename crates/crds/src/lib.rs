//! ENI IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the ENI and IPAM controllers.

pub mod eni;
pub mod labels;
pub mod net_resource_set;

pub use eni::*;
pub use labels::*;
pub use net_resource_set::*;
