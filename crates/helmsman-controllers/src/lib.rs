// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Helmsman Controllers - the reconcilers and the manager that runs them

pub mod cloud;
pub mod config;
pub mod context;
pub mod endpoints;
pub mod error;
pub mod manager;
pub mod mock;
pub mod node_lifecycle;
pub mod service;
pub mod statefulset;
pub mod ttl_after_finished;

#[cfg(test)]
mod testutil;

pub use cloud::{CloudClient, CloudError, CloudProvider};
pub use config::{ControllerManagerConfig, ALL_CONTROLLERS};
pub use context::{ControllerContext, SharedInformers};
pub use endpoints::EndpointsController;
pub use error::{ControllerError, Result};
pub use manager::ControllerManager;
pub use mock::MockCloud;
pub use node_lifecycle::NodeLifecycleController;
pub use service::ServiceController;
pub use statefulset::StatefulSetController;
pub use ttl_after_finished::TtlAfterFinishedController;
