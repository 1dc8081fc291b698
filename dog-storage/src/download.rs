use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{Operation, PipelineError};
use crate::gateway::ObjectGateway;
use crate::translate::translate;
use crate::{StorageCtx, StorageError, StorageResult, TransferConfig};

/// Positional write target for parallel downloads.
///
/// Parts arrive in any order, each at its own offset. Implementations must
/// accept concurrent calls for disjoint ranges.
#[async_trait]
pub trait WriteAt: Send + Sync {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()>;
}

/// Growable in-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner()
    }
}

#[async_trait]
impl WriteAt for MemorySink {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::Error::other("offset exceeds memory"))?;
        let end = start + data.len();

        let mut buf = self.buf.lock();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }
}

/// Sink writing into a file at part offsets
#[derive(Debug)]
pub struct FileSink {
    file: tokio::sync::Mutex<File>,
}

impl FileSink {
    /// Create (or truncate) the file at `path`
    pub async fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(File::create(path).await?))
    }

    pub fn new(file: File) -> Self {
        Self {
            file: tokio::sync::Mutex::new(file),
        }
    }

    /// Flush file contents to disk
    pub async fn sync_all(&self) -> io::Result<()> {
        self.file.lock().await.sync_all().await
    }
}

#[async_trait]
impl WriteAt for FileSink {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await
    }
}

/// Download half of the transfer pipeline
#[derive(Debug, Clone)]
pub(crate) struct Downloader {
    config: TransferConfig,
}

impl Downloader {
    pub(crate) fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Split `0..size` into part-sized ranges
    pub(crate) fn ranges(&self, size: u64) -> impl Iterator<Item = Range<u64>> {
        let part_size = self.config.part_size;
        (0..size.div_ceil(part_size)).map(move |index| {
            let start = index * part_size;
            start..(start + part_size).min(size)
        })
    }

    /// Copy the whole object into `sink` with at most `concurrency` range
    /// reads in flight. Returns the object size.
    ///
    /// The object is looked up first so a missing key fails before any part
    /// is requested. On failure the sink may hold a partial, unordered subset
    /// of the parts.
    #[instrument(skip(self, gateway, ctx, sink), fields(request_id = %ctx.request_id))]
    pub(crate) async fn download(
        &self,
        gateway: &dyn ObjectGateway,
        ctx: &StorageCtx,
        container: &str,
        key: &str,
        sink: &dyn WriteAt,
    ) -> StorageResult<u64> {
        let cancelled = || StorageError::cancelled(Operation::Download, container, key);

        let info = ctx
            .run(gateway.head_object(container, key))
            .await
            .map_err(|_| cancelled())?
            .map_err(|e| translate(Operation::Download, container, key, e))?;
        let size = info.size_bytes;
        debug!(size, "downloading object");

        let parts = stream::iter(self.ranges(size))
            .map(Ok::<_, StorageError>)
            .try_for_each_concurrent(self.config.concurrency, |range| async move {
                let data = gateway
                    .get_object_range(container, key, range.clone())
                    .await
                    .map_err(|e| translate(Operation::Download, container, key, e))?;

                let expected = range.end - range.start;
                if data.len() as u64 != expected {
                    return Err(StorageError::transfer(
                        Operation::Download,
                        container,
                        key,
                        PipelineError::ShortRead {
                            start: range.start,
                            end: range.end,
                            received: data.len() as u64,
                        },
                    ));
                }

                sink.write_at(range.start, data)
                    .await
                    .map_err(|e| StorageError::transfer(Operation::Download, container, key, e))?;
                debug!(offset = range.start, len = expected, "part written");
                Ok(())
            });

        ctx.run(parts).await.map_err(|_| cancelled())??;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fault, MemoryGateway};

    #[test]
    fn ranges_cover_object_exactly() {
        let downloader = Downloader::new(TransferConfig::new().with_part_size(10));

        let ranges: Vec<_> = downloader.ranges(25).collect();
        assert_eq!(ranges, vec![0..10, 10..20, 20..25]);

        assert_eq!(downloader.ranges(20).count(), 2);
        assert_eq!(downloader.ranges(0).count(), 0);
    }

    #[tokio::test]
    async fn memory_sink_accepts_out_of_order_writes() {
        let sink = MemorySink::new();
        sink.write_at(4, Bytes::from_static(b"5678")).await.unwrap();
        sink.write_at(0, Bytes::from_static(b"1234")).await.unwrap();

        assert_eq!(sink.len(), 8);
        assert_eq!(sink.into_inner(), b"12345678");
    }

    #[tokio::test]
    async fn file_sink_writes_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let sink = FileSink::create(&path).await.unwrap();
        sink.write_at(3, Bytes::from_static(b"def")).await.unwrap();
        sink.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        sink.sync_all().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn downloads_in_parallel_parts() {
        let gateway = MemoryGateway::new();
        let data: Vec<u8> = (0..100u8).collect();
        gateway
            .put_object("c", "k", Bytes::from(data.clone()), None)
            .await
            .unwrap();

        let downloader = Downloader::new(TransferConfig::new().with_part_size(16).with_concurrency(4));
        let sink = MemorySink::new();
        let size = downloader
            .download(&gateway, &StorageCtx::new(), "c", "k", &sink)
            .await
            .unwrap();

        assert_eq!(size, 100);
        assert_eq!(sink.into_inner(), data);
        assert_eq!(gateway.stats().range_gets, 7);
    }

    #[tokio::test]
    async fn missing_object_fails_before_any_part() {
        let gateway = MemoryGateway::new();
        let downloader = Downloader::new(TransferConfig::new());

        let err = downloader
            .download(&gateway, &StorageCtx::new(), "c", "missing", &MemorySink::new())
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(gateway.stats().range_gets, 0);
    }

    #[tokio::test]
    async fn failed_range_fails_download() {
        let gateway = MemoryGateway::new();
        gateway.put_object("c", "k", Bytes::from(vec![1u8; 40]), None).await.unwrap();
        gateway.inject(Fault::RangeGet(20));

        let downloader = Downloader::new(TransferConfig::new().with_part_size(10).with_concurrency(2));
        let err = downloader
            .download(&gateway, &StorageCtx::new(), "c", "k", &MemorySink::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Transfer { operation: Operation::Download, .. }));
        assert_eq!(err.code(), Some("InternalError"));
    }

    #[tokio::test]
    async fn cancelled_context_stops_download() {
        let gateway = MemoryGateway::new();
        gateway.put_object("c", "k", Bytes::from(vec![1u8; 40]), None).await.unwrap();
        let ctx = StorageCtx::new();
        ctx.cancel.cancel();

        let err = Downloader::new(TransferConfig::new())
            .download(&gateway, &ctx, "c", "k", &MemorySink::new())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }
}
