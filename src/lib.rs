//! CSI Driver Operator
//!
//! A Kubernetes operator that converges declarative `CsiDeployment`
//! descriptors into running CSI driver installations and keeps them
//! converged as the descriptor or the live cluster state changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      CsiDeployment Controller                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌───────────────────┐  ┌───────────────────┐  │
//! │  │  Validation   │  │ Enhancer Registry │  │ Status/Conditions │  │
//! │  │               │  │ ceph-rbd/cephfs   │  │ phase + children  │  │
//! │  │               │  │ cloud-cbs/cfs     │  │                   │  │
//! │  └──────┬───────┘  └────────┬──────────┘  └─────────┬─────────┘  │
//! │         └───────────────────┼───────────────────────┘            │
//! │                   ┌─────────┴──────────┐                         │
//! │                   │   Reconcile Loop   │                         │
//! │                   └─────────┬──────────┘                         │
//! ├─────────────────────────────┼────────────────────────────────────┤
//! │                     Child Synchronizers                           │
//! │  DaemonSet │ Deployment │ RBAC │ Secrets │ StorageClasses │ CMs   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: reconcile loop, validators and per-kind synchronizers
//! - [`enhancer`]: well-known driver expansion strategies
//! - [`crd`]: the CsiDeployment custom resource
//! - [`config`]: process-level configuration
//! - [`error`]: error types and retry classification

pub mod config;
pub mod controller;
pub mod crd;
pub mod enhancer;
pub mod error;

// Re-export commonly used types
pub use config::{CephConfig, CloudConfig, OperatorConfig};
pub use controller::{run_controller, Reconciler};
pub use crd::{
    CsiDeployment, CsiDeploymentSpec, CsiDeploymentStatus, CsiPhase, CsiVersion,
};
pub use enhancer::{Enhance, EnhancerRegistry};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
