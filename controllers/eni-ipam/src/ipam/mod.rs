//! Node IPAM.
//!
//! [`node_manager::NodeManager`] keeps one [`net_resource::NetResource`] per
//! NetResourceSet. Each engine keeps its node's pool between the watermarks
//! through the node's [`ops::NetResourceOperations`] adapter.

pub mod action;
pub mod net_resource;
pub mod node_manager;
pub mod ops;
pub mod stats;
pub mod subnet;
pub mod trigger;

#[cfg(test)]
mod net_resource_test;
