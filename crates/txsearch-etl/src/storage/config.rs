use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{EtlError, Result};

/// Location of the deletion manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; the default AWS provider chain is used when unset
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    /// Region and bucket are required; everything else is optional
    pub fn from_env() -> Result<Self> {
        let region = env::var("USASPENDING_AWS_REGION")
            .map_err(|_| EtlError::config("USASPENDING_AWS_REGION must be set to reconcile deletes"))?;
        let bucket = env::var("DELETED_TRANSACTIONS_S3_BUCKET_NAME").map_err(|_| {
            EtlError::config("DELETED_TRANSACTIONS_S3_BUCKET_NAME must be set to reconcile deletes")
        })?;

        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region,
            bucket,
            access_key: env::var("S3_ACCESS_KEY").ok(),
            secret_key: env::var("S3_SECRET_KEY").ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}
