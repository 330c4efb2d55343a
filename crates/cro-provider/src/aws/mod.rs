//! AWS implementations of the `aws` deployment strategy

pub mod blob_storage;
pub mod redis;

pub use blob_storage::{
    AwsBlobStorageProvider, BlobStorageConfig, S3Api, S3Connector, SdkS3Connector,
};
pub use redis::{
    AwsRedisProvider, ElastiCacheApi, ElastiCacheConnector, RedisClusterConfig,
    SdkElastiCacheConnector,
};

use cro_common::metrics::record_provider_call;
use cro_common::Result;

/// Strategy name served by the AWS providers
pub const AWS_STRATEGY: &str = "aws";

/// Name the SDK credentials provider reports in its debug output
const CREDENTIALS_PROVIDER_NAME: &str = "cloud-resource-operator";

/// Record one SDK call's outcome and pass it through
fn observed<T>(provider: &str, operation: &'static str, result: Result<T>) -> Result<T> {
    record_provider_call(provider, operation, result.is_ok());
    result
}
