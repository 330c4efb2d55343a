//! Integration tests grouped by the story they tell
//!
//! - `crd_operations`: creating and reading requests through the API server
//! - `request_lifecycle`: a request driven from creation to deletion by the
//!   controller, with connection secrets and finalizers on a real cluster

mod crd_operations;
mod helpers;
mod request_lifecycle;
