use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;

use crate::translate::GatewayResult;
use crate::{ByteStream, ObjectInfo};

/// Network-facing object store client consumed by the transfer pipeline.
///
/// Implementations own connection pooling, signing, and retries. Every
/// failure is reported as a [`GatewayError`](crate::GatewayError) carrying a
/// not-found signal when the backend gave one.
#[async_trait]
pub trait ObjectGateway: Send + Sync {
    /// Store a whole object in one request
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> GatewayResult<PutOutput>;

    /// Start a multipart upload; nothing is visible until it completes
    async fn create_multipart_upload(
        &self,
        container: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> GatewayResult<String>;

    /// Upload one part; part numbers start at 1
    async fn upload_part(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> GatewayResult<CompletedPart>;

    /// Commit the parts, ordered by part number, as a single object
    async fn complete_multipart_upload(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> GatewayResult<PutOutput>;

    /// Discard an unfinished upload and its parts
    async fn abort_multipart_upload(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<()>;

    /// Open the object as one sequential stream
    async fn get_object(&self, container: &str, key: &str) -> GatewayResult<ObjectBody>;

    /// Read the half-open byte range `range` of the object
    async fn get_object_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
    ) -> GatewayResult<Bytes>;

    /// Object metadata; a missing object fails with a `NotFound` signal
    async fn head_object(&self, container: &str, key: &str) -> GatewayResult<ObjectInfo>;

    async fn delete_object(&self, container: &str, key: &str) -> GatewayResult<()>;

    /// Limits the pipeline has to respect
    fn capabilities(&self) -> GatewayCapabilities;
}

/// Result of a successful put or multipart commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOutput {
    pub etag: Option<String>,
}

/// A part accepted by the backend, as needed to commit the upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: Option<String>,
    pub size_bytes: u64,
}

/// An opened object: metadata plus its content stream
pub struct ObjectBody {
    pub info: ObjectInfo,
    pub stream: ByteStream,
}

/// Backend limits for multipart transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayCapabilities {
    /// Smallest accepted size for every part except the last
    pub min_part_size: u64,
    pub max_parts: u32,
}

impl GatewayCapabilities {
    /// Limits of the S3 multipart API
    pub fn s3() -> Self {
        Self {
            min_part_size: crate::config::MIN_PART_SIZE,
            max_parts: 10_000,
        }
    }

    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.min_part_size = bytes;
        self
    }

    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }
}

impl Default for GatewayCapabilities {
    fn default() -> Self {
        Self::s3()
    }
}
