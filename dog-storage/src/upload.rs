use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::error::{Operation, PipelineError};
use crate::gateway::{CompletedPart, ObjectGateway};
use crate::translate::translate;
use crate::{ByteStream, SaveReceipt, StorageCtx, StorageError, StorageResult, TransferConfig};

/// Splits a byte stream into fixed-size parts without buffering more than one
/// part at a time.
pub(crate) struct PartReader {
    stream: ByteStream,
    /// Tail of a chunk that crossed the previous part boundary
    carry: Option<Bytes>,
    part_size: usize,
    finished: bool,
}

impl PartReader {
    pub(crate) fn new(stream: ByteStream, part_size: usize) -> Self {
        Self {
            stream,
            carry: None,
            part_size,
            finished: false,
        }
    }

    /// Next part of exactly `part_size` bytes, or shorter when the stream
    /// ends. `None` once nothing is left.
    pub(crate) async fn next_part(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut part = BytesMut::new();

        while part.len() < self.part_size {
            let chunk = match self.carry.take() {
                Some(chunk) => chunk,
                None if self.finished => break,
                None => match self.stream.next().await {
                    Some(chunk) => chunk?,
                    None => {
                        self.finished = true;
                        break;
                    }
                },
            };

            let room = self.part_size - part.len();
            if chunk.len() > room {
                if part.is_empty() {
                    // a chunk that alone fills the part needs no copy
                    self.carry = Some(chunk.slice(room..));
                    return Ok(Some(chunk.slice(..room)));
                }
                part.extend_from_slice(&chunk[..room]);
                self.carry = Some(chunk.slice(room..));
            } else if part.is_empty() && chunk.len() == room {
                return Ok(Some(chunk));
            } else {
                if part.capacity() == 0 {
                    part.reserve(self.part_size);
                }
                part.extend_from_slice(&chunk);
            }
        }

        if part.is_empty() {
            return Ok(None);
        }
        Ok(Some(part.freeze()))
    }
}

/// Upload half of the transfer pipeline
#[derive(Debug, Clone)]
pub(crate) struct Uploader {
    config: TransferConfig,
    max_parts: u32,
}

/// Context shared by every part of one upload
struct Target<'a> {
    gateway: &'a dyn ObjectGateway,
    container: &'a str,
    key: &'a str,
}

impl Target<'_> {
    fn fail(&self, error: crate::GatewayError) -> StorageError {
        translate(Operation::Save, self.container, self.key, error)
    }

    fn broken<E>(&self, error: E) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StorageError::transfer(Operation::Save, self.container, self.key, error)
    }

    fn cancelled(&self) -> StorageError {
        StorageError::cancelled(Operation::Save, self.container, self.key)
    }
}

impl Uploader {
    pub(crate) fn new(config: TransferConfig, max_parts: u32) -> Self {
        Self { config, max_parts }
    }

    /// Deliver `body` as one object.
    ///
    /// Objects that fit in one part go out as a single put. Anything larger is
    /// a multipart upload that is committed only after every part succeeded and
    /// aborted otherwise, so a failed or cancelled save never leaves a visible
    /// object behind.
    #[instrument(skip(self, gateway, ctx, body), fields(request_id = %ctx.request_id))]
    pub(crate) async fn upload(
        &self,
        gateway: &dyn ObjectGateway,
        ctx: &StorageCtx,
        container: &str,
        key: &str,
        body: ByteStream,
        content_type: Option<&str>,
    ) -> StorageResult<SaveReceipt> {
        let target = Target { gateway, container, key };
        // validated at construction to fit in usize
        let part_size = self.config.part_size as usize;
        let mut reader = PartReader::new(body, part_size);

        let first = self.read_part(ctx, &target, &mut reader).await?.unwrap_or_default();
        let second = if first.len() < part_size {
            None
        } else {
            self.read_part(ctx, &target, &mut reader).await?
        };

        let Some(second) = second else {
            return self.put_single(ctx, &target, first, content_type).await;
        };

        let upload_id = ctx
            .run(gateway.create_multipart_upload(container, key, content_type))
            .await
            .map_err(|_| target.cancelled())?
            .map_err(|e| target.fail(e))?;
        debug!(%upload_id, "multipart upload started");

        let parts = match self.upload_parts(ctx, &target, &upload_id, first, second, reader).await {
            Ok(parts) => parts,
            Err(error) => {
                self.abort(&target, &upload_id).await;
                return Err(error);
            }
        };

        if ctx.is_done() {
            self.abort(&target, &upload_id).await;
            return Err(target.cancelled());
        }

        // the commit is not raced against cancellation: once issued, its
        // outcome is the outcome of the save
        let size_bytes = parts.iter().map(|p| p.size_bytes).sum();
        let part_count = parts.len() as u32;
        let output = match gateway.complete_multipart_upload(container, key, &upload_id, parts).await {
            Ok(output) => output,
            Err(error) => {
                self.abort(&target, &upload_id).await;
                return Err(target.fail(error));
            }
        };

        Ok(SaveReceipt {
            key: key.to_string(),
            size_bytes,
            content_type: content_type.map(str::to_owned),
            etag: output.etag,
            parts: part_count,
        })
    }

    async fn read_part(
        &self,
        ctx: &StorageCtx,
        target: &Target<'_>,
        reader: &mut PartReader,
    ) -> StorageResult<Option<Bytes>> {
        ctx.run(reader.next_part())
            .await
            .map_err(|_| target.cancelled())?
            .map_err(|e| target.broken(e))
    }

    async fn put_single(
        &self,
        ctx: &StorageCtx,
        target: &Target<'_>,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<SaveReceipt> {
        let size_bytes = body.len() as u64;
        let output = ctx
            .run(target.gateway.put_object(target.container, target.key, body, content_type))
            .await
            .map_err(|_| target.cancelled())?
            .map_err(|e| target.fail(e))?;

        Ok(SaveReceipt {
            key: target.key.to_string(),
            size_bytes,
            content_type: content_type.map(str::to_owned),
            etag: output.etag,
            parts: 1,
        })
    }

    /// Fan parts out to at most `concurrency` in-flight uploads. Parts are
    /// numbered as they are cut from the stream; completion order is free.
    /// The first failure drops every outstanding part upload.
    async fn upload_parts(
        &self,
        ctx: &StorageCtx,
        target: &Target<'_>,
        upload_id: &str,
        first: Bytes,
        second: Bytes,
        mut reader: PartReader,
    ) -> StorageResult<Vec<CompletedPart>> {
        let max_parts = self.max_parts;
        let numbered = async_stream::stream! {
            yield Ok::<_, StorageError>(first);
            yield Ok(second);
            loop {
                match reader.next_part().await {
                    Ok(Some(part)) => yield Ok(part),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(target.broken(e));
                        break;
                    }
                }
            }
        }
        .enumerate()
        .map(|(index, part)| {
            let part_number = index as u32 + 1;
            if part_number > max_parts {
                return Err(target.broken(PipelineError::TooManyParts { max_parts }));
            }
            part.map(|body| (part_number, body))
        });

        let uploads = numbered
            .map_ok(|(part_number, body)| async move {
                let size = body.len();
                debug!(part_number, size, "uploading part");
                let part = target
                    .gateway
                    .upload_part(target.container, target.key, upload_id, part_number, body)
                    .await
                    .map_err(|e| target.fail(e))?;
                debug!(part_number, "part uploaded");
                Ok::<_, StorageError>(part)
            })
            .try_buffer_unordered(self.config.concurrency)
            .try_collect::<Vec<_>>();

        let mut parts = ctx.run(uploads).await.map_err(|_| target.cancelled())??;
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn abort(&self, target: &Target<'_>, upload_id: &str) {
        if let Err(error) = target
            .gateway
            .abort_multipart_upload(target.container, target.key, upload_id)
            .await
        {
            warn!(%upload_id, %error, "failed to abort multipart upload");
        }
    }
}
