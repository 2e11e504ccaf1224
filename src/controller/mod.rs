//! CsiDeployment controller
//!
//! The reconcile loop and its collaborators:
//! - [`reconciler`]: the per-deployment state machine and status engine
//! - [`validation`]: structural spec checks
//! - [`finalizer`] / [`ownership`]: deletion ordering and child ownership
//! - per-kind synchronizers for workloads, RBAC, Secrets, StorageClasses and
//!   ConfigMaps

pub mod conditions;
mod config_maps;
mod drivers;
pub mod finalizer;
mod ops;
pub mod ownership;
mod rbac;
pub mod reconciler;
mod secrets;
mod storage_class;
pub mod validation;

pub use reconciler::{run_controller, Reconciler};
