use serde::Deserialize;
use std::env;
use std::fmt;

use crate::{StorageError, StorageResult};

/// Smallest part the S3 multipart API accepts (all parts but the last)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Tuning for one direction of the transfer pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Fixed part size (bytes); the final part of an object may be smaller
    pub part_size: u64,

    /// Number of parts in flight at once. Peak buffer memory is
    /// roughly `part_size * concurrency` regardless of object size.
    pub concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            concurrency: 1,
        }
    }
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub(crate) fn validate(&self, min_part_size: u64) -> StorageResult<()> {
        if self.part_size == 0 {
            return Err(StorageError::invalid_config("part size must be at least 1 byte"));
        }
        if self.part_size < min_part_size.max(1) {
            return Err(StorageError::invalid_config(format!(
                "part size {} is below the backend minimum of {}",
                self.part_size, min_part_size
            )));
        }
        if usize::try_from(self.part_size).is_err() {
            return Err(StorageError::invalid_config(format!(
                "part size {} does not fit in memory on this platform",
                self.part_size
            )));
        }
        if self.concurrency == 0 {
            return Err(StorageError::invalid_config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration held by an [`ObjectStorage`](crate::ObjectStorage) instance
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// Container (bucket) every key of this instance lives in
    pub container: String,
    #[serde(default)]
    pub upload: TransferConfig,
    #[serde(default)]
    pub download: TransferConfig,
}

impl StorageConfig {
    pub fn new<S: Into<String>>(container: S) -> Self {
        Self {
            container: container.into(),
            upload: TransferConfig::default(),
            download: TransferConfig::default(),
        }
    }

    pub fn with_upload(mut self, upload: TransferConfig) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_download(mut self, download: TransferConfig) -> Self {
        self.download = download;
        self
    }

    pub(crate) fn validate(&self, min_part_size: u64) -> StorageResult<()> {
        if self.container.is_empty() {
            return Err(StorageError::invalid_config("container name is required"));
        }
        self.upload.validate(min_part_size)?;
        self.download.validate(min_part_size)
    }
}

/// Connection settings for an S3-compatible backend
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, R2, RustFS, ...); AWS when unset
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub upload: TransferConfig,
    #[serde(default)]
    pub download: TransferConfig,
}

impl S3Config {
    pub fn new<B: Into<String>, R: Into<String>>(bucket: B, region: R) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            upload: TransferConfig::default(),
            download: TransferConfig::default(),
        }
    }

    /// Load from `S3_*` environment variables.
    ///
    /// `S3_BUCKET` and `S3_REGION` are required; everything else is optional.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> StorageResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| StorageError::invalid_config(format!("{} environment variable required", key)))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let parsed = |key: &str| -> StorageResult<Option<u64>> {
            optional(key)
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        StorageError::invalid_config(format!("{} must be an unsigned integer, got {:?}", key, v))
                    })
                })
                .transpose()
        };

        let mut config = Self::new(required("S3_BUCKET")?, required("S3_REGION")?);
        config.endpoint_url = optional("S3_ENDPOINT_URL");
        config.access_key_id = optional("S3_ACCESS_KEY_ID");
        config.secret_access_key = optional("S3_SECRET_ACCESS_KEY");
        config.force_path_style = optional("S3_FORCE_PATH_STYLE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        if let Some(part_size) = parsed("S3_PART_SIZE")? {
            config.upload.part_size = part_size;
            config.download.part_size = part_size;
        }
        let concurrency = |key: &str| -> StorageResult<Option<usize>> {
            parsed(key)?
                .map(|v| {
                    usize::try_from(v).map_err(|_| {
                        StorageError::invalid_config(format!("{} value {} does not fit on this platform", key, v))
                    })
                })
                .transpose()
        };
        if let Some(workers) = concurrency("S3_UPLOAD_CONCURRENCY")? {
            config.upload.concurrency = workers;
        }
        if let Some(workers) = concurrency("S3_DOWNLOAD_CONCURRENCY")? {
            config.download.concurrency = workers;
        }

        Ok(config)
    }

    /// Static credentials, only when both halves are present
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(mut self, access_key_id: A, secret_access_key: S) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    pub fn with_path_style(mut self) -> Self {
        self.force_path_style = true;
        self
    }

    /// The façade-level part of this configuration
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(self.bucket.clone())
            .with_upload(self.upload)
            .with_download(self.download)
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("force_path_style", &self.force_path_style)
            .field("upload", &self.upload)
            .field("download", &self.download)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_one_worker_of_five_mib() {
        let config = TransferConfig::default();
        assert_eq!(config.part_size, 5 * 1024 * 1024);
        assert_eq!(config.concurrency, 1);
        assert!(config.validate(MIN_PART_SIZE).is_ok());
    }

    #[test]
    fn rejects_parts_below_backend_minimum() {
        let config = TransferConfig::new().with_part_size(1024);
        assert!(matches!(
            config.validate(MIN_PART_SIZE),
            Err(StorageError::InvalidConfig { .. })
        ));
        assert!(config.validate(1024).is_ok());
        assert!(config.with_concurrency(0).validate(1024).is_err());
    }

    #[test]
    fn rejects_zero_part_size_even_without_backend_minimum() {
        let config = TransferConfig::new().with_part_size(0);
        assert!(matches!(config.validate(0), Err(StorageError::InvalidConfig { .. })));
        assert!(config.validate(MIN_PART_SIZE).is_err());
        assert!(TransferConfig::new().with_part_size(1).validate(0).is_ok());
    }

    #[test]
    fn debug_output_hides_secret_key() {
        let config = S3Config::new("media", "us-east-1").with_credentials("AKIDEXAMPLE", "wJalrXUtnFEMI");
        let printed = format!("{:?}", config);
        assert!(printed.contains("AKIDEXAMPLE"));
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("wJalrXUtnFEMI"));
    }

    #[test]
    fn oversized_concurrency_is_rejected_not_truncated() {
        let max = u64::MAX.to_string();
        let result = S3Config::from_lookup(lookup(&[
            ("S3_BUCKET", "media"),
            ("S3_REGION", "us-east-1"),
            ("S3_UPLOAD_CONCURRENCY", max.as_str()),
        ]));
        match usize::try_from(u64::MAX) {
            Ok(workers) => assert_eq!(result.unwrap().upload.concurrency, workers),
            Err(_) => assert!(matches!(result, Err(StorageError::InvalidConfig { .. }))),
        }
    }

    #[test]
    fn storage_config_requires_container() {
        assert!(StorageConfig::new("").validate(MIN_PART_SIZE).is_err());
        assert!(StorageConfig::new("media").validate(MIN_PART_SIZE).is_ok());
    }

    #[test]
    fn env_lookup_reads_all_settings() {
        let config = S3Config::from_lookup(lookup(&[
            ("S3_BUCKET", "media"),
            ("S3_REGION", "eu-west-1"),
            ("S3_ENDPOINT_URL", "http://localhost:9000"),
            ("S3_ACCESS_KEY_ID", "id"),
            ("S3_SECRET_ACCESS_KEY", "secret"),
            ("S3_FORCE_PATH_STYLE", "true"),
            ("S3_PART_SIZE", "8388608"),
            ("S3_UPLOAD_CONCURRENCY", "4"),
        ]))
        .unwrap();

        assert_eq!(config.bucket, "media");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.static_credentials(), Some(("id", "secret")));
        assert!(config.force_path_style);
        assert_eq!(config.upload.part_size, 8 * 1024 * 1024);
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.download.concurrency, 1);
    }

    #[test]
    fn env_lookup_requires_bucket_and_region() {
        let err = S3Config::from_lookup(lookup(&[("S3_REGION", "us-east-1")])).unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET"));

        let err = S3Config::from_lookup(lookup(&[
            ("S3_BUCKET", "media"),
            ("S3_REGION", "us-east-1"),
            ("S3_PART_SIZE", "big"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("S3_PART_SIZE"));
    }

    #[test]
    fn half_credentials_fall_back_to_provider_chain() {
        let mut config = S3Config::new("media", "us-east-1");
        config.access_key_id = Some("id".to_string());
        assert_eq!(config.static_credentials(), None);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: S3Config = serde_json::from_str(
            r#"{"bucket":"media","region":"us-east-1","download":{"concurrency":3}}"#,
        )
        .unwrap();

        assert_eq!(config.upload, TransferConfig::default());
        assert_eq!(config.download.concurrency, 3);
        assert_eq!(config.download.part_size, MIN_PART_SIZE);
        assert_eq!(config.storage_config().container, "media");
    }
}
