//! Cloud resource operator: turns `Redis` and `BlobStorage` requests into
//! managed cloud resources and writes their connection details to secrets.
//!
//! - [`controller`] runs one reconcile pass per request
//! - [`store`] reads and writes requests and secrets in the cluster
//! - [`runner`] wires providers and controllers into the kube runtime

#![deny(missing_docs)]

pub mod controller;
pub mod runner;
pub mod store;

pub use controller::{
    error_policy, reconcile, reconcile_request, Context, ControllerSettings, ReconcileOutcome,
};
