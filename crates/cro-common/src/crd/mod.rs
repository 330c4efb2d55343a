//! Custom Resource Definitions served by the cloud resource operator

mod blob_storage;
mod redis;
mod request;
mod types;

pub use blob_storage::{BlobStorage, BlobStorageSpec};
pub use redis::{Redis, RedisSpec};
pub use request::{CloudResource, RequestId, ResourceKind, ResourceRequest, API_VERSION};
pub use types::{
    CloudResourceStatus, Condition, ConditionStatus, ResourcePhase, SecretRef, CONDITION_READY,
};
