use anyhow::Result;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, error, info};

use crate::error::SinkError;

/// Seam over blob storage so routing logic is testable without S3.
#[async_trait]
pub trait BlobWriter: Send + Sync {
    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), SinkError>;
}

pub struct ObjectStoreSink {
    client: Client,
    bucket: String,
}

impl ObjectStoreSink {
    pub async fn new(
        bucket: String,
        region: String,
        endpoint: Option<String>,
    ) -> Result<ObjectStoreSink> {
        info!(bucket, "connecting to object storage");
        let mut config =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint);
        }
        let config = config.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();

        Ok(ObjectStoreSink {
            client: Client::from_conf(s3_config),
            bucket,
        })
    }
}

#[async_trait]
impl BlobWriter for ObjectStoreSink {
    async fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), SinkError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| {
                error!(key, error = ?e, "blob upload failed");
                // Same key and bytes on every attempt, so a retried upload
                // overwrites its own earlier partial write.
                SinkError::Retryable(format!("blob upload failed: {e}"))
            })?;

        debug!(key, bucket = %self.bucket, "blob stored");
        Ok(())
    }
}
