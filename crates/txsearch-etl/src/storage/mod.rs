//! Blob storage holding the deletion manifests

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{EtlError, Result};

pub mod config;

pub use config::StorageConfig;

/// A listed manifest file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Read access to the manifest bucket
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Every object in the store with its modification time
    async fn list(&self) -> Result<Vec<ManifestObject>>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

/// S3-compatible manifest store
#[derive(Clone)]
pub struct S3ManifestStore {
    client: Client,
    bucket: String,
}

impl S3ManifestStore {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        debug!("Initializing manifest storage with config: {:?}", config);

        let mut s3_config_builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "txsearch-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        s3_config_builder = s3_config_builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Manifest storage initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl ManifestStore for S3ManifestStore {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<ManifestObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| EtlError::Storage(format!("Failed to list s3://{}: {}", self.bucket, e)))?;

            for object in response.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let Some(last_modified) =
                    DateTime::<Utc>::from_timestamp(modified.secs(), modified.subsec_nanos())
                else {
                    continue;
                };
                objects.push(ManifestObject {
                    key: key.to_string(),
                    last_modified,
                });
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!("Listed {} object(s) in s3://{}", objects.len(), self.bucket);
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        debug!("Downloading from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EtlError::Storage(format!("Failed to download {}: {}", key, e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| EtlError::Storage(format!("Failed to read {}: {}", key, e)))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }
}

/// Manifest store held in memory
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    objects: Mutex<BTreeMap<String, (DateTime<Utc>, Vec<u8>)>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, last_modified: DateTime<Utc>, contents: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (last_modified, contents.into()));
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn list(&self) -> Result<Vec<ManifestObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, (last_modified, _))| ManifestObject {
                key: key.clone(),
                last_modified: *last_modified,
            })
            .collect())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| EtlError::Storage(format!("No such object: {}", key)))
    }
}
