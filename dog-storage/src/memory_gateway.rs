//! In-process [`ObjectGateway`] with S3 multipart semantics.
//!
//! Staged parts stay invisible until the upload completes and are dropped on
//! abort, so partial writes can be observed (or rather, not observed) the same
//! way as against a real bucket. Useful for tests and local development.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::{CompletedPart, GatewayCapabilities, ObjectBody, ObjectGateway, PutOutput};
use crate::translate::{ErrorSignal, GatewayError, GatewayResult};
use crate::ObjectInfo;

/// Chunk size of streams returned by `get_object`
const READ_CHUNK: usize = 64 * 1024;

/// Failures produced by [`MemoryGateway`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryGatewayError {
    #[error("The specified key does not exist: {0}")]
    NoSuchKey(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("The specified upload does not exist: {0}")]
    NoSuchUpload(String),

    #[error("Part {0} was never uploaded or its etag does not match")]
    InvalidPart(u32),

    #[error("Part {part_number} is {size} bytes, below the minimum of {min}")]
    EntityTooSmall { part_number: u32, size: u64, min: u64 },

    #[error("The requested range {start}-{end} is not satisfiable for {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("Injected failure: {0:?}")]
    Injected(Fault),
}

impl MemoryGatewayError {
    fn into_gateway(self) -> GatewayError {
        let (signal, code) = match &self {
            Self::NoSuchKey(_) => (ErrorSignal::NoSuchKey, "NoSuchKey"),
            Self::NotFound(_) => (ErrorSignal::NotFound, "NotFound"),
            Self::NoSuchUpload(_) => (ErrorSignal::Other, "NoSuchUpload"),
            Self::InvalidPart(_) => (ErrorSignal::Other, "InvalidPart"),
            Self::EntityTooSmall { .. } => (ErrorSignal::Other, "EntityTooSmall"),
            Self::InvalidRange { .. } => (ErrorSignal::Other, "InvalidRange"),
            Self::Injected(_) => (ErrorSignal::Other, "InternalError"),
        };
        let message = self.to_string();
        GatewayError::new(signal, self)
            .with_code(code)
            .with_message(message)
    }
}

/// A failure to inject into the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Put,
    UploadPart(u32),
    Complete,
    /// Range read starting at this offset
    RangeGet(u64),
    Head,
    Delete,
}

/// Call counters, for asserting on how the pipeline drove the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub puts: u64,
    pub multipart_created: u64,
    pub parts_uploaded: u64,
    pub multipart_completed: u64,
    pub multipart_aborted: u64,
    pub gets: u64,
    pub range_gets: u64,
    pub heads: u64,
    pub deletes: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            size_bytes: self.data.len() as u64,
            content_type: self.content_type.clone(),
            etag: Some(self.etag.clone()),
            last_modified: Some(self.last_modified),
        }
    }
}

#[derive(Debug)]
struct PendingUpload {
    container: String,
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    multipart_created: AtomicU64,
    parts_uploaded: AtomicU64,
    multipart_completed: AtomicU64,
    multipart_aborted: AtomicU64,
    gets: AtomicU64,
    range_gets: AtomicU64,
    heads: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Default)]
struct Inner {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<HashSet<Fault>>,
    counters: Counters,
}

/// Thread-safe in-memory object store; clones share the same contents
#[derive(Clone)]
pub struct MemoryGateway {
    inner: Arc<Inner>,
    capabilities: GatewayCapabilities,
}

impl MemoryGateway {
    /// Gateway with the same limits as S3
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            capabilities: GatewayCapabilities::s3(),
        }
    }

    /// Lower the minimum part size so small objects exercise multipart paths
    pub fn with_min_part_size(mut self, bytes: u64) -> Self {
        self.capabilities = self.capabilities.with_min_part_size(bytes);
        self
    }

    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.capabilities = self.capabilities.with_max_parts(max);
        self
    }

    /// Make the next call matching `fault` fail
    pub fn inject(&self, fault: Fault) {
        self.inner.faults.lock().insert(fault);
    }

    /// Uploads created but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.inner.uploads.lock().len()
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().len()
    }

    /// Raw stored bytes, bypassing the gateway interface
    pub fn object_bytes(&self, container: &str, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .get(&(container.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.inner.counters;
        GatewayStats {
            puts: c.puts.load(Ordering::Relaxed),
            multipart_created: c.multipart_created.load(Ordering::Relaxed),
            parts_uploaded: c.parts_uploaded.load(Ordering::Relaxed),
            multipart_completed: c.multipart_completed.load(Ordering::Relaxed),
            multipart_aborted: c.multipart_aborted.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            range_gets: c.range_gets.load(Ordering::Relaxed),
            heads: c.heads.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
        }
    }

    fn trip(&self, fault: Fault) -> GatewayResult<()> {
        if self.inner.faults.lock().remove(&fault) {
            return Err(MemoryGatewayError::Injected(fault).into_gateway());
        }
        Ok(())
    }

    fn store(&self, container: &str, key: &str, data: Bytes, content_type: Option<String>) -> PutOutput {
        let etag = format!("\"{}\"", Uuid::new_v4().simple());
        let object = StoredObject {
            data,
            content_type,
            etag: etag.clone(),
            last_modified: Utc::now(),
        };
        self.inner
            .objects
            .lock()
            .insert((container.to_string(), key.to_string()), object);
        PutOutput { etag: Some(etag) }
    }

    fn lookup(&self, container: &str, key: &str) -> Option<StoredObject> {
        self.inner
            .objects
            .lock()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[async_trait]
impl ObjectGateway for MemoryGateway {
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> GatewayResult<PutOutput> {
        bump(&self.inner.counters.puts);
        self.trip(Fault::Put)?;
        Ok(self.store(container, key, body, content_type.map(str::to_owned)))
    }

    async fn create_multipart_upload(
        &self,
        container: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> GatewayResult<String> {
        bump(&self.inner.counters.multipart_created);
        let upload_id = format!("upl_{}", Uuid::new_v4().simple());
        self.inner.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                container: container.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_owned),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _container: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> GatewayResult<CompletedPart> {
        bump(&self.inner.counters.parts_uploaded);
        self.trip(Fault::UploadPart(part_number))?;

        let mut uploads = self.inner.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| MemoryGatewayError::NoSuchUpload(upload_id.to_string()).into_gateway())?;

        let etag = format!("\"{}\"", Uuid::new_v4().simple());
        let size_bytes = body.len() as u64;
        upload.parts.insert(part_number, (etag.clone(), body));

        Ok(CompletedPart {
            part_number,
            etag: Some(etag),
            size_bytes,
        })
    }

    async fn complete_multipart_upload(
        &self,
        _container: &str,
        _key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> GatewayResult<PutOutput> {
        self.trip(Fault::Complete)?;

        let upload = {
            let mut uploads = self.inner.uploads.lock();
            let upload = uploads
                .get(upload_id)
                .ok_or_else(|| MemoryGatewayError::NoSuchUpload(upload_id.to_string()).into_gateway())?;

            let mut previous = 0;
            for (index, part) in parts.iter().enumerate() {
                let staged = upload.parts.get(&part.part_number);
                let etag_matches = staged.is_some_and(|(etag, _)| part.etag.as_ref() == Some(etag));
                if part.part_number <= previous || !etag_matches {
                    return Err(MemoryGatewayError::InvalidPart(part.part_number).into_gateway());
                }
                let size = staged.map(|(_, data)| data.len() as u64).unwrap_or(0);
                if index + 1 < parts.len() && size < self.capabilities.min_part_size {
                    return Err(MemoryGatewayError::EntityTooSmall {
                        part_number: part.part_number,
                        size,
                        min: self.capabilities.min_part_size,
                    }
                    .into_gateway());
                }
                previous = part.part_number;
            }
            if parts.is_empty() {
                return Err(MemoryGatewayError::InvalidPart(0).into_gateway());
            }

            uploads
                .remove(upload_id)
                .ok_or_else(|| MemoryGatewayError::NoSuchUpload(upload_id.to_string()).into_gateway())?
        };

        let total: usize = parts
            .iter()
            .filter_map(|p| upload.parts.get(&p.part_number))
            .map(|(_, data)| data.len())
            .sum();
        let mut data = BytesMut::with_capacity(total);
        for part in &parts {
            if let Some((_, chunk)) = upload.parts.get(&part.part_number) {
                data.extend_from_slice(chunk);
            }
        }

        bump(&self.inner.counters.multipart_completed);
        Ok(self.store(&upload.container, &upload.key, data.freeze(), upload.content_type))
    }

    async fn abort_multipart_upload(
        &self,
        _container: &str,
        _key: &str,
        upload_id: &str,
    ) -> GatewayResult<()> {
        bump(&self.inner.counters.multipart_aborted);
        self.inner
            .uploads
            .lock()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| MemoryGatewayError::NoSuchUpload(upload_id.to_string()).into_gateway())
    }

    async fn get_object(&self, container: &str, key: &str) -> GatewayResult<ObjectBody> {
        bump(&self.inner.counters.gets);
        let object = self
            .lookup(container, key)
            .ok_or_else(|| MemoryGatewayError::NoSuchKey(key.to_string()).into_gateway())?;

        let info = object.info();
        let data = object.data;
        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..data.len())
            .step_by(READ_CHUNK)
            .map(|start| Ok(data.slice(start..(start + READ_CHUNK).min(data.len()))))
            .collect();

        Ok(ObjectBody {
            info,
            stream: Box::pin(futures::stream::iter(chunks)),
        })
    }

    async fn get_object_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
    ) -> GatewayResult<Bytes> {
        bump(&self.inner.counters.range_gets);
        self.trip(Fault::RangeGet(range.start))?;

        let object = self
            .lookup(container, key)
            .ok_or_else(|| MemoryGatewayError::NoSuchKey(key.to_string()).into_gateway())?;
        let size = object.data.len() as u64;
        if range.start >= size || range.end <= range.start {
            return Err(MemoryGatewayError::InvalidRange {
                start: range.start,
                end: range.end,
                size,
            }
            .into_gateway());
        }

        // like S3, an end past the object is clipped
        let end = range.end.min(size);
        Ok(object.data.slice(range.start as usize..end as usize))
    }

    async fn head_object(&self, container: &str, key: &str) -> GatewayResult<ObjectInfo> {
        bump(&self.inner.counters.heads);
        self.trip(Fault::Head)?;
        self.lookup(container, key)
            .map(|o| o.info())
            .ok_or_else(|| MemoryGatewayError::NotFound(key.to_string()).into_gateway())
    }

    async fn delete_object(&self, container: &str, key: &str) -> GatewayResult<()> {
        bump(&self.inner.counters.deletes);
        self.trip(Fault::Delete)?;
        self.inner
            .objects
            .lock()
            .remove(&(container.to_string(), key.to_string()));
        Ok(())
    }

    fn capabilities(&self) -> GatewayCapabilities {
        self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{classify, ErrorClass};

    #[tokio::test]
    async fn multipart_is_invisible_until_complete() {
        let gateway = MemoryGateway::new().with_min_part_size(4);
        let id = gateway
            .create_multipart_upload("c", "k", Some("text/plain"))
            .await
            .unwrap();

        let p1 = gateway.upload_part("c", "k", &id, 1, Bytes::from_static(b"abcd")).await.unwrap();
        let p2 = gateway.upload_part("c", "k", &id, 2, Bytes::from_static(b"ef")).await.unwrap();
        assert!(gateway.head_object("c", "k").await.is_err());

        gateway.complete_multipart_upload("c", "k", &id, vec![p1, p2]).await.unwrap();

        let info = gateway.head_object("c", "k").await.unwrap();
        assert_eq!(info.size_bytes, 6);
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));
        assert_eq!(gateway.object_bytes("c", "k").unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(gateway.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn abort_discards_staged_parts() {
        let gateway = MemoryGateway::new().with_min_part_size(1);
        let id = gateway.create_multipart_upload("c", "k", None).await.unwrap();
        gateway.upload_part("c", "k", &id, 1, Bytes::from_static(b"x")).await.unwrap();

        gateway.abort_multipart_upload("c", "k", &id).await.unwrap();

        assert_eq!(gateway.pending_uploads(), 0);
        assert_eq!(gateway.object_count(), 0);
        let err = gateway.upload_part("c", "k", &id, 2, Bytes::new()).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("NoSuchUpload"));
    }

    #[tokio::test]
    async fn small_inner_parts_are_rejected() {
        let gateway = MemoryGateway::new().with_min_part_size(4);
        let id = gateway.create_multipart_upload("c", "k", None).await.unwrap();
        let p1 = gateway.upload_part("c", "k", &id, 1, Bytes::from_static(b"ab")).await.unwrap();
        let p2 = gateway.upload_part("c", "k", &id, 2, Bytes::from_static(b"cd")).await.unwrap();

        let err = gateway.complete_multipart_upload("c", "k", &id, vec![p1, p2]).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("EntityTooSmall"));
        assert_eq!(gateway.object_count(), 0);
    }

    #[tokio::test]
    async fn missing_objects_carry_not_found_signals() {
        let gateway = MemoryGateway::new();

        let get = gateway.get_object("c", "missing").await.err().unwrap();
        assert_eq!(get.signal, ErrorSignal::NoSuchKey);
        let head = gateway.head_object("c", "missing").await.unwrap_err();
        assert_eq!(head.signal, ErrorSignal::NotFound);
        assert_eq!(classify(&head), ErrorClass::Missing);

        // deleting a missing key is not an error, as on S3
        gateway.delete_object("c", "missing").await.unwrap();
    }

    #[tokio::test]
    async fn range_reads_clip_to_object_end() {
        let gateway = MemoryGateway::new();
        gateway.put_object("c", "k", Bytes::from_static(b"0123456789"), None).await.unwrap();

        assert_eq!(gateway.get_object_range("c", "k", 2..5).await.unwrap(), Bytes::from_static(b"234"));
        assert_eq!(gateway.get_object_range("c", "k", 8..20).await.unwrap(), Bytes::from_static(b"89"));
        assert!(gateway.get_object_range("c", "k", 10..12).await.is_err());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let gateway = MemoryGateway::new();
        gateway.inject(Fault::Put);

        let err = gateway.put_object("c", "k", Bytes::new(), None).await.unwrap_err();
        assert_eq!(classify(&err), ErrorClass::Failure);
        gateway.put_object("c", "k", Bytes::new(), None).await.unwrap();
        assert_eq!(gateway.stats().puts, 2);
    }
}
