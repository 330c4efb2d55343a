//! Live-cluster integration tests for the cloud resource operator
//!
//! These tests need a reachable Kubernetes cluster (the current kubeconfig
//! context) and are ignored by default:
//!
//! ```bash
//! cargo test -p cro-operator --test kind -- --ignored
//! ```
//!
//! No cloud account is touched; provider calls are served by an in-process
//! provider so only the Kubernetes side of a pass is exercised.

mod kind_tests;
