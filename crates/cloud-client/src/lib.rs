//! Cloud VPC/ENI API Client
//!
//! A Rust client library for the cloud network interface, private IP,
//! instance and subnet APIs, with a per-operation rate limiting gateway.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use cloud_client::{CloudClient, CloudClientTrait, FlowControlClient, FlowControlConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CloudClient::new(
//!     "https://bcc.bj.baidubce.com".to_string(),
//!     "your-api-token".to_string(),
//!     Duration::from_secs(30),
//! )?;
//!
//! // Every call goes through the limiter of its operation
//! let gateway = FlowControlClient::new(client, &FlowControlConfig::default(), None)?;
//! let eni = gateway.stat_eni("eni-abc123").await?;
//! println!("{} is {}", eni.eni_id, eni.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **ENI Operations**: list, stat, create, delete, attach, detach
//! - **Private IPs**: batch add/delete, cross-subnet borrowing, primary NIC secondary IPs
//! - **VPC**: subnets, route tables, security groups, EIP binding and direct mode
//! - **HPC**: RDMA interface lookup and batch private IPs
//! - **Flow Control**: per-operation rate, burst, concurrency and wait limits
//! - **Mocking**: in-memory `MockCloudClient` behind the `test-util` feature

pub mod client;
pub mod error;
pub mod flow_control;
pub mod models;
#[path = "trait.rs"]
pub mod cloud_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::CloudClient;
pub use cloud_trait::CloudClientTrait;
pub use error::CloudError;
pub use flow_control::{FlowControlClient, FlowControlConfig, LimiterMetrics};
pub use flow_control::operations;
pub use models::*;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{InjectedFailure, MockCall, MockCloudClient};
