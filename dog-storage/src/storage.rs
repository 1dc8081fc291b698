use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::io::StreamReader;
use tracing::{info, instrument};

use crate::download::{Downloader, WriteAt};
use crate::error::{Cancelled, Operation};
use crate::gateway::ObjectGateway;
use crate::sniff::sniff_stream;
use crate::translate::{translate, translate_exists};
use crate::upload::Uploader;
use crate::{
    ByteStream, ObjectInfo, S3Config, S3Gateway, SaveOptions, SaveReceipt, StorageConfig, StorageCtx,
    StorageError, StorageResult,
};

/// Object storage bound to one container.
///
/// Every call takes a [`StorageCtx`] for cancellation and correlation, and
/// every failure comes back as a [`StorageError`]. No state is kept between
/// calls, so one instance can be shared freely across tasks.
#[derive(Clone)]
pub struct ObjectStorage {
    gateway: Arc<dyn ObjectGateway>,
    container: String,
    uploader: Uploader,
    downloader: Downloader,
}

impl ObjectStorage {
    /// Create storage over a gateway, validating the transfer settings
    /// against the gateway's limits
    pub fn new<G: ObjectGateway + 'static>(gateway: G, config: StorageConfig) -> StorageResult<Self> {
        Self::from_shared(Arc::new(gateway), config)
    }

    /// Create storage over a gateway shared with other instances
    pub fn from_shared(gateway: Arc<dyn ObjectGateway>, config: StorageConfig) -> StorageResult<Self> {
        let capabilities = gateway.capabilities();
        config.validate(capabilities.min_part_size)?;

        Ok(Self {
            gateway,
            container: config.container,
            uploader: Uploader::new(config.upload, capabilities.max_parts),
            downloader: Downloader::new(config.download),
        })
    }

    /// Connect to an S3-compatible service
    pub async fn connect(config: S3Config) -> StorageResult<Self> {
        let gateway = S3Gateway::connect(&config).await;
        Self::new(gateway, config.storage_config())
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Store `body` under `key`.
    ///
    /// With `auto_content_type` and no explicit type, the first bytes are
    /// sniffed and the full stream is uploaded unchanged. Either the whole
    /// object becomes visible or nothing does.
    #[instrument(skip(self, ctx, body, options), fields(container = %self.container, request_id = %ctx.request_id))]
    pub async fn save(
        &self,
        ctx: &StorageCtx,
        key: &str,
        body: ByteStream,
        options: SaveOptions,
    ) -> StorageResult<SaveReceipt> {
        let (body, content_type) = if options.needs_sniffing() {
            let sniffed = ctx
                .run(sniff_stream(body))
                .await
                .map_err(|_| StorageError::cancelled(Operation::Save, &self.container, key))??;
            (sniffed.stream, sniffed.content_type.map(str::to_owned))
        } else {
            (body, options.content_type)
        };

        let receipt = self
            .uploader
            .upload(self.gateway.as_ref(), ctx, &self.container, key, body, content_type.as_deref())
            .await?;

        info!(
            size = receipt.size_bytes,
            parts = receipt.parts,
            content_type = receipt.content_type.as_deref().unwrap_or(""),
            "object saved"
        );
        Ok(receipt)
    }

    /// Store an in-memory buffer under `key`
    pub async fn save_bytes<B: Into<Bytes>>(
        &self,
        ctx: &StorageCtx,
        key: &str,
        data: B,
        options: SaveOptions,
    ) -> StorageResult<SaveReceipt> {
        let data = data.into();
        let body: ByteStream = Box::pin(futures_util::stream::once(async move { Ok(data) }));
        self.save(ctx, key, body, options).await
    }

    /// Open `key` as a sequential stream.
    ///
    /// The stream stops with an [`io::ErrorKind::Interrupted`] error once `ctx`
    /// is cancelled. Dropping the reader releases the underlying connection.
    #[instrument(skip(self, ctx), fields(container = %self.container, request_id = %ctx.request_id))]
    pub async fn open(&self, ctx: &StorageCtx, key: &str) -> StorageResult<ObjectReader> {
        let body = ctx
            .run(self.gateway.get_object(&self.container, key))
            .await
            .map_err(|_| StorageError::cancelled(Operation::Open, &self.container, key))?
            .map_err(|e| translate(Operation::Open, &self.container, key, e))?;

        let ctx = ctx.clone();
        let mut inner = body.stream;
        let stream = async_stream::stream! {
            loop {
                match ctx.run(inner.next()).await {
                    Ok(Some(chunk)) => yield chunk,
                    Ok(None) => break,
                    Err(cancelled) => {
                        yield Err(io::Error::new(io::ErrorKind::Interrupted, cancelled));
                        break;
                    }
                }
            }
        };

        Ok(ObjectReader {
            info: body.info,
            stream: Box::pin(stream),
        })
    }

    /// Copy `key` into `sink` using parallel range reads. Returns the number of
    /// bytes written.
    ///
    /// A failed download may leave some parts in the sink; the error is still
    /// returned.
    #[instrument(skip(self, ctx, sink), fields(container = %self.container, request_id = %ctx.request_id))]
    pub async fn download<W: WriteAt + ?Sized>(
        &self,
        ctx: &StorageCtx,
        key: &str,
        sink: &W,
    ) -> StorageResult<u64> {
        let sink = DynSink(sink);
        let size = self
            .downloader
            .download(self.gateway.as_ref(), ctx, &self.container, key, &sink)
            .await?;
        info!(size, "object downloaded");
        Ok(size)
    }

    /// Whether `key` exists. A missing object is `Ok(false)`, not an error.
    #[instrument(skip(self, ctx), fields(container = %self.container, request_id = %ctx.request_id))]
    pub async fn exists(&self, ctx: &StorageCtx, key: &str) -> StorageResult<bool> {
        let result = ctx
            .run(self.gateway.head_object(&self.container, key))
            .await
            .map_err(|_| StorageError::cancelled(Operation::Exists, &self.container, key))?;
        translate_exists(&self.container, key, result.map(|_| ()))
    }

    /// Remove `key`
    #[instrument(skip(self, ctx), fields(container = %self.container, request_id = %ctx.request_id))]
    pub async fn delete(&self, ctx: &StorageCtx, key: &str) -> StorageResult<()> {
        ctx.run(self.gateway.delete_object(&self.container, key))
            .await
            .map_err(|_| StorageError::cancelled(Operation::Delete, &self.container, key))?
            .map_err(|e| translate(Operation::Delete, &self.container, key, e))?;
        info!("object deleted");
        Ok(())
    }
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("container", &self.container)
            .field("uploader", &self.uploader)
            .field("downloader", &self.downloader)
            .finish_non_exhaustive()
    }
}

/// Lets unsized sinks go through the `&dyn WriteAt` pipeline
struct DynSink<'a, W: ?Sized>(&'a W);

#[async_trait::async_trait]
impl<'a, W: WriteAt + ?Sized> WriteAt for DynSink<'a, W> {
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        self.0.write_at(offset, data).await
    }
}

/// An opened object: metadata plus its content as a stream of chunks
pub struct ObjectReader {
    info: ObjectInfo,
    stream: ByteStream,
}

impl ObjectReader {
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    pub fn content_length(&self) -> u64 {
        self.info.size_bytes
    }

    pub fn content_type(&self) -> Option<&str> {
        self.info.content_type.as_deref()
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }

    /// Adapt to [`tokio::io::AsyncRead`]
    pub fn into_async_read(self) -> StreamReader<ByteStream, Bytes> {
        StreamReader::new(self.stream)
    }

    /// Buffer the remaining content
    pub async fn read_to_end(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(usize::try_from(self.info.size_bytes).unwrap_or(0));
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ObjectReader {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Cancellation cause carried by an interrupted [`ObjectReader`]
pub fn is_cancelled_read(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::Interrupted
        && error.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fault, MemoryGateway, MemorySink, TransferConfig};
    use tokio::io::AsyncReadExt;

    fn small_config() -> StorageConfig {
        StorageConfig::new("media")
            .with_upload(TransferConfig::new().with_part_size(8).with_concurrency(2))
            .with_download(TransferConfig::new().with_part_size(8).with_concurrency(2))
    }

    fn storage() -> (MemoryGateway, ObjectStorage) {
        let gateway = MemoryGateway::new().with_min_part_size(8);
        let storage = ObjectStorage::new(gateway.clone(), small_config()).unwrap();
        (gateway, storage)
    }

    #[test]
    fn rejects_part_size_below_backend_minimum() {
        let err = ObjectStorage::new(MemoryGateway::new(), small_config()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));

        let err = ObjectStorage::new(MemoryGateway::new(), StorageConfig::new("")).unwrap_err();
        assert!(err.to_string().contains("container"));
    }

    #[test]
    fn rejects_zero_part_size_on_gateway_without_minimum() {
        let gateway = MemoryGateway::new().with_min_part_size(0);

        let upload = StorageConfig::new("media").with_upload(TransferConfig::new().with_part_size(0));
        let err = ObjectStorage::new(gateway.clone(), upload).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));

        let download = StorageConfig::new("media")
            .with_upload(TransferConfig::new().with_part_size(1))
            .with_download(TransferConfig::new().with_part_size(0));
        let err = ObjectStorage::new(gateway.clone(), download).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig { .. }));

        let one_byte = TransferConfig::new().with_part_size(1);
        let config = StorageConfig::new("media").with_upload(one_byte).with_download(one_byte);
        assert!(ObjectStorage::new(gateway, config).is_ok());
    }

    #[tokio::test]
    async fn sniffs_when_asked_and_keeps_bytes() {
        let (gateway, storage) = storage();
        let ctx = StorageCtx::new();

        let receipt = storage
            .save_bytes(&ctx, "notes.txt", "plain words, nothing else", SaveOptions::new().with_auto_content_type())
            .await
            .unwrap();

        assert_eq!(receipt.content_type.as_deref(), Some("text/plain; charset=utf-8"));
        assert_eq!(
            gateway.object_bytes("media", "notes.txt").unwrap(),
            Bytes::from_static(b"plain words, nothing else")
        );
    }

    #[tokio::test]
    async fn explicit_content_type_is_stored_as_given() {
        let (_, storage) = storage();
        let ctx = StorageCtx::new();

        storage
            .save_bytes(&ctx, "a.bin", "<html>", SaveOptions::new().with_content_type("application/x-custom"))
            .await
            .unwrap();

        let reader = storage.open(&ctx, "a.bin").await.unwrap();
        assert_eq!(reader.content_type(), Some("application/x-custom"));
        assert_eq!(reader.content_length(), 6);
    }

    #[tokio::test]
    async fn open_reads_through_async_read() {
        let (_, storage) = storage();
        let ctx = StorageCtx::new();
        storage
            .save_bytes(&ctx, "k", vec![9u8; 30], SaveOptions::new())
            .await
            .unwrap();

        let mut out = Vec::new();
        storage
            .open(&ctx, "k")
            .await
            .unwrap()
            .into_async_read()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![9u8; 30]);
    }

    #[tokio::test]
    async fn cancelled_open_stream_is_interrupted() {
        let (_, storage) = storage();
        let ctx = StorageCtx::new();
        storage.save_bytes(&ctx, "k", "data", SaveOptions::new()).await.unwrap();

        let mut reader = storage.open(&ctx, "k").await.unwrap();
        ctx.cancel.cancel();

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(is_cancelled_read(&err));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn exists_reports_missing_as_false() {
        let (gateway, storage) = storage();
        let ctx = StorageCtx::new();

        assert!(!storage.exists(&ctx, "k").await.unwrap());
        storage.save_bytes(&ctx, "k", "x", SaveOptions::new()).await.unwrap();
        assert!(storage.exists(&ctx, "k").await.unwrap());

        gateway.inject(Fault::Head);
        let err = storage.exists(&ctx, "k").await.unwrap_err();
        assert!(matches!(err, StorageError::Transfer { operation: Operation::Exists, .. }));
    }

    #[tokio::test]
    async fn download_accepts_trait_object_sinks() {
        let (_, storage) = storage();
        let ctx = StorageCtx::new();
        storage
            .save_bytes(&ctx, "k", (0..20u8).collect::<Vec<_>>(), SaveOptions::new())
            .await
            .unwrap();

        let sink = MemorySink::new();
        let dyn_sink: &dyn WriteAt = &sink;
        assert_eq!(storage.download(&ctx, "k", dyn_sink).await.unwrap(), 20);
        assert_eq!(sink.to_vec(), (0..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn delete_failure_is_a_transfer_error() {
        let (gateway, storage) = storage();
        gateway.inject(Fault::Delete);

        let err = storage.delete(&StorageCtx::new(), "k").await.unwrap_err();
        assert!(matches!(err, StorageError::Transfer { operation: Operation::Delete, .. }));
        assert_eq!(err.code(), Some("InternalError"));
    }
}
