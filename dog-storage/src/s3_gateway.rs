use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::ops::Range;
use thiserror::Error;

use crate::gateway::{CompletedPart, GatewayCapabilities, ObjectBody, ObjectGateway, PutOutput};
use crate::translate::{ErrorSignal, GatewayError, GatewayResult};
use crate::{ByteStream, ObjectInfo, S3Config};

/// [`ObjectGateway`] backed by the AWS SDK; works with any S3-compatible service
#[derive(Clone)]
pub struct S3Gateway {
    client: Client,
}

#[derive(Error, Debug)]
#[error("S3 returned no upload id for {0}")]
struct MissingUploadId(String);

impl S3Gateway {
    /// Build a client from connection settings.
    ///
    /// Static credentials are used when both halves are configured; otherwise
    /// the default provider chain (environment, profile, IMDS, ...) applies.
    pub async fn connect(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((access_key_id, secret_access_key)) = config.static_credentials() {
            let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "dog-storage");
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;
        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .force_path_style(config.force_path_style)
                .build(),
        );

        Self { client }
    }

    /// Wrap an already configured client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Carry the SDK error through as the cause, tagging it when the service said
/// the object is missing (typed check first, then the service error code).
fn sdk_error<E, R>(error: SdkError<E, R>, is_missing: fn(&E) -> bool, signal: ErrorSignal) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = error.code().map(str::to_owned);
    let message = error.message().map(str::to_owned);
    let missing = error.as_service_error().is_some_and(is_missing)
        || matches!(code.as_deref(), Some("NoSuchKey" | "NotFound"));

    let mut gateway_error = GatewayError::new(if missing { signal } else { ErrorSignal::Other }, error);
    gateway_error.code = code;
    gateway_error.message = message;
    gateway_error
}

fn never<E>(_: &E) -> bool {
    false
}

fn no_such_key(error: &GetObjectError) -> bool {
    error.is_no_such_key()
}

fn not_found(error: &HeadObjectError) -> bool {
    error.is_not_found()
}

fn timestamp(value: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

/// Forward the response body chunk by chunk; the connection is released when
/// the returned stream is dropped.
fn body_stream(mut body: AwsByteStream) -> ByteStream {
    Box::pin(async_stream::stream! {
        while let Some(chunk) = body.next().await {
            yield chunk.map_err(std::io::Error::other);
        }
    })
}

#[async_trait]
impl ObjectGateway for S3Gateway {
    async fn put_object(
        &self,
        container: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> GatewayResult<PutOutput> {
        let output = self
            .client
            .put_object()
            .bucket(container)
            .key(key)
            .content_length(body.len() as i64)
            .body(AwsByteStream::from(body))
            .set_content_type(content_type.map(str::to_owned))
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::Other))?;

        Ok(PutOutput {
            etag: output.e_tag().map(str::to_owned),
        })
    }

    async fn create_multipart_upload(
        &self,
        container: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> GatewayResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(container)
            .key(key)
            .set_content_type(content_type.map(str::to_owned))
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::Other))?;

        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::other(MissingUploadId(key.to_string())))
    }

    async fn upload_part(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> GatewayResult<CompletedPart> {
        let size_bytes = body.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .content_length(size_bytes as i64)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::Other))?;

        Ok(CompletedPart {
            part_number,
            etag: output.e_tag().map(str::to_owned),
            size_bytes,
        })
    }

    async fn complete_multipart_upload(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> GatewayResult<PutOutput> {
        let parts = parts
            .into_iter()
            .map(|part| {
                AwsCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .set_e_tag(part.etag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::Other))?;

        Ok(PutOutput {
            etag: output.e_tag().map(str::to_owned),
        })
    }

    async fn abort_multipart_upload(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::Other))?;
        Ok(())
    }

    async fn get_object(&self, container: &str, key: &str) -> GatewayResult<ObjectBody> {
        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, no_such_key, ErrorSignal::NoSuchKey))?;

        let info = ObjectInfo {
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_owned),
            etag: output.e_tag().map(str::to_owned),
            last_modified: timestamp(output.last_modified()),
        };

        Ok(ObjectBody {
            info,
            stream: body_stream(output.body),
        })
    }

    async fn get_object_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
    ) -> GatewayResult<Bytes> {
        // HTTP ranges are inclusive on both ends
        let header = format!("bytes={}-{}", range.start, range.end.saturating_sub(1));

        let output = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .range(header)
            .send()
            .await
            .map_err(|e| sdk_error(e, no_such_key, ErrorSignal::NoSuchKey))?;

        let data = output.body.collect().await.map_err(GatewayError::other)?;
        Ok(data.into_bytes())
    }

    async fn head_object(&self, container: &str, key: &str) -> GatewayResult<ObjectInfo> {
        let output = self
            .client
            .head_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, not_found, ErrorSignal::NotFound))?;

        Ok(ObjectInfo {
            size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_owned),
            etag: output.e_tag().map(str::to_owned),
            last_modified: timestamp(output.last_modified()),
        })
    }

    async fn delete_object(&self, container: &str, key: &str) -> GatewayResult<()> {
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(e, never, ErrorSignal::NoSuchKey))?;
        Ok(())
    }

    fn capabilities(&self) -> GatewayCapabilities {
        GatewayCapabilities::s3()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_sdk_timestamps() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        let converted = timestamp(Some(&dt)).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(timestamp(None), None);
    }

    #[tokio::test]
    async fn connect_builds_client_from_config() {
        let config = S3Config::new("media", "us-east-1")
            .with_endpoint("http://127.0.0.1:9000")
            .with_credentials("minio", "minio123")
            .with_path_style();

        let gateway = S3Gateway::connect(&config).await;
        let client_config = gateway.client().config();
        assert_eq!(client_config.region().map(|r| r.as_ref()), Some("us-east-1"));
        assert_eq!(gateway.capabilities(), GatewayCapabilities::s3());
    }
}
