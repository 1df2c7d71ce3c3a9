//! S3 store implementation on the AWS SDK

use super::config::{ClientConfig, SignerKind};
use super::types::{
    ByteRange, ByteStream, CompletedPart, ListPage, MultipartHandle, MultipartUploadSummary,
    ObjectMetadata, ObjectSummary, PresignedUrlSpec, PutPayload, ServerSideEncryption,
    WriteOptions,
};
use super::ObjectStore;
use crate::error::{is_retryable_code, DeleteFailure, Result, TransferError};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as AwsCompletedPart, Delete, ObjectIdentifier,
    ServerSideEncryption as AwsServerSideEncryption,
};
use aws_sdk_s3::Client as AwsS3Client;
use aws_smithy_http_client::proxy::ProxyConfig;
use aws_smithy_http_client::{tls, Builder as HttpClientBuilder, Connector};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::debug;

/// S3 allows up to 1000 deletes per request
const DELETE_BATCH_SIZE: usize = 1000;

/// [`ObjectStore`] backed by AWS S3 or an S3-compatible service
///
/// SDK-level retries are disabled; callers retry under their own policy.
#[derive(Clone)]
pub struct S3Store {
    client: AwsS3Client,
}

impl S3Store {
    /// Create a store for the given client configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// use stowage::store::{ClientConfig, S3Store};
    ///
    /// #[tokio::main]
    /// async fn main() -> stowage::Result<()> {
    ///     let store = S3Store::new(&ClientConfig::new()).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = Self::build_aws_client(config).await?;
        Ok(Self { client })
    }

    /// Build the AWS SDK S3 client from configuration
    async fn build_aws_client(config: &ClientConfig) -> Result<AwsS3Client> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        let region_provider = if let Some(region) = &config.region {
            RegionProviderChain::first_try(Region::new(region.clone()))
        } else {
            RegionProviderChain::default_provider().or_else("us-east-1")
        };
        loader = loader.region(region_provider);

        match config.signer()? {
            SignerKind::Anonymous => {
                loader = loader.no_credentials();
            }
            SignerKind::SigV4 => {
                if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
                    let credentials = Credentials::new(
                        access_key,
                        secret_key,
                        config.session_token.clone(),
                        None,
                        "stowage-explicit",
                    );
                    loader = loader.credentials_provider(credentials);
                }
            }
        }

        if let Some(proxy) = &config.proxy {
            let proxy_config = ProxyConfig::all(proxy.url()).map_err(|e| {
                TransferError::Configuration(format!("Invalid proxy {}: {}", proxy.url(), e))
            })?;
            let http_client =
                HttpClientBuilder::new().build_with_connector_fn(move |settings, components| {
                    let mut connector = Connector::builder();
                    connector.set_connector_settings(settings.cloned());
                    if let Some(components) = components {
                        connector.set_sleep_impl(components.sleep_impl());
                    }
                    connector
                        .proxy_config(proxy_config.clone())
                        .tls_provider(tls::Provider::Rustls(tls::rustls_provider::CryptoMode::Ring))
                        .build()
                });
            loader = loader.http_client(http_client);
            debug!("Routing S3 requests through proxy {}", proxy.url());
        }

        loader = loader
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(config.connect_timeout())
                    .read_timeout(config.socket_timeout())
                    .build(),
            );

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        // Required for MinIO, LocalStack
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(AwsS3Client::from_conf(builder.build()))
    }
}

/// Map an SDK error onto the transfer error taxonomy
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ConstructionFailure(_) => {
            return TransferError::Configuration(DisplayErrorContext(&err).to_string())
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return TransferError::TransientNetwork(DisplayErrorContext(&err).to_string())
        }
        _ => {}
    }

    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    match code.as_str() {
        "NoSuchKey" | "NotFound" | "NoSuchBucket" | "NoSuchUpload" => TransferError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "Forbidden" => {
            TransferError::AccessDenied(format!("{}/{}: {}", bucket, key, message))
        }
        _ if status == Some(404) => TransferError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        _ if status == Some(403) => {
            TransferError::AccessDenied(format!("{}/{}: {}", bucket, key, message))
        }
        _ if is_retryable_code(&code) || status == Some(429) || status.is_some_and(|s| s >= 500) => {
            TransferError::TransientNetwork(format!("{}: {}", code, message))
        }
        _ => TransferError::Service { code, message },
    }
}

fn sse_parts(sse: &ServerSideEncryption) -> (Option<AwsServerSideEncryption>, Option<String>) {
    match sse {
        ServerSideEncryption::None => (None, None),
        ServerSideEncryption::Aes256 => (Some(AwsServerSideEncryption::Aes256), None),
        ServerSideEncryption::AwsKms { key_id } => {
            (Some(AwsServerSideEncryption::AwsKms), key_id.clone())
        }
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// Percent-encode a key for `x-amz-copy-source`, keeping `/` separators
fn encode_copy_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMetadata {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(str::to_string),
                last_modified: output.last_modified().and_then(to_chrono),
                content_type: output.content_type().map(str::to_string),
            })),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(None),
            Err(e) => match classify(e, bucket, key) {
                TransferError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify(e, bucket, prefix))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    etag: obj.e_tag().map(str::to_string),
                    last_modified: obj.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: PutPayload,
        options: &WriteOptions,
    ) -> Result<()> {
        let length = payload.len();
        let body = match payload {
            PutPayload::Bytes(bytes) => AwsByteStream::from(bytes),
            PutPayload::File { path, .. } => AwsByteStream::from_path(&path)
                .await
                .map_err(|e| TransferError::Io(format!("{}: {}", path.display(), e)))?,
        };
        let (sse, kms_key_id) = sse_parts(&options.server_side_encryption);

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(length as i64)
            .set_content_type(options.content_type.clone())
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key_id)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|r| r.header_value()))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let body = stream::unfold(Some(output.body), |state| async move {
            let mut body = state?;
            match body.try_next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(TransferError::TransientNetwork(format!(
                        "Failed to read response body: {}",
                        e
                    ))),
                    None,
                )),
            }
        });
        Ok(body.boxed())
    }

    async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        options: &WriteOptions,
    ) -> Result<()> {
        let copy_source = format!("{}/{}", source_bucket, encode_copy_key(source_key));
        let (sse, kms_key_id) = sse_parts(&options.server_side_encryption);

        self.client
            .copy_object()
            .copy_source(copy_source)
            .bucket(target_bucket)
            .key(target_key)
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key_id)
            .send()
            .await
            .map_err(|e| classify(e, source_bucket, source_key))?;
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        options: &WriteOptions,
    ) -> Result<String> {
        let (sse, kms_key_id) = sse_parts(&options.server_side_encryption);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(options.content_type.clone())
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key_id)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| TransferError::Service {
                code: "MissingUploadId".to_string(),
                message: format!("No upload ID returned for {}/{}", bucket, key),
            })
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let length = data.len() as i64;
        let output = self
            .client
            .upload_part()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .part_number(part_number as i32)
            .content_length(length)
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(e, &handle.bucket, &handle.key))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| TransferError::Service {
                code: "MissingETag".to_string(),
                message: format!("No ETag returned for part {}", part_number),
            })
    }

    async fn upload_part_copy(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<String> {
        let copy_source = format!("{}/{}", source_bucket, encode_copy_key(source_key));
        let output = self
            .client
            .upload_part_copy()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .part_number(part_number as i32)
            .copy_source(copy_source)
            .copy_source_range(range.header_value())
            .send()
            .await
            .map_err(|e| classify(e, source_bucket, source_key))?;

        output
            .copy_part_result()
            .and_then(|result| result.e_tag())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Service {
                code: "MissingETag".to_string(),
                message: format!("No ETag returned for copied part {}", part_number),
            })
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let completed: Vec<AwsCompletedPart> = parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(e, &handle.bucket, &handle.key))?;
        Ok(())
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .send()
            .await
            .map_err(|e| classify(e, &handle.bucket, &handle.key))?;
        Ok(())
    }

    async fn list_multipart_uploads(&self, bucket: &str) -> Result<Vec<MultipartUploadSummary>> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_multipart_uploads()
                .bucket(bucket)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(|e| classify(e, bucket, ""))?;

            for upload in output.uploads() {
                let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
                    continue;
                };
                let Some(initiated_at) = upload.initiated().and_then(to_chrono) else {
                    debug!("Skipping upload {} for {} without initiation time", upload_id, key);
                    continue;
                };
                uploads.push(MultipartUploadSummary {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    initiated_at,
                });
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            upload_id_marker = output.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }

        Ok(uploads)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut failures = Vec::new();

        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            let identifiers = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TransferError::InvalidRequest(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| TransferError::InvalidRequest(e.to_string()))?;

            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(e, bucket, ""))?;

            for error in output.errors() {
                if let Some(key) = error.key() {
                    failures.push(DeleteFailure::new(
                        key,
                        error.code().map(str::to_string),
                        error.message().unwrap_or("Unknown error"),
                    ));
                }
            }
        }

        Ok(failures)
    }

    async fn presign(&self, spec: &PresignedUrlSpec) -> Result<String> {
        let expires_in = (spec.expires_at - Utc::now())
            .to_std()
            .map_err(|_| TransferError::InvalidRequest("Expiration must be in the future".to_string()))?;
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| TransferError::InvalidRequest(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&spec.bucket)
            .key(&spec.key)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, &spec.bucket, &spec.key))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::ClientConfigBuilder;

    #[test]
    fn test_encode_copy_key() {
        assert_eq!(encode_copy_key("a/b/c.txt"), "a/b/c.txt");
        assert_eq!(encode_copy_key("dir/my file+1.csv"), "dir/my%20file%2B1.csv");
        assert_eq!(encode_copy_key("é"), "%C3%A9");
    }

    #[test]
    fn test_sse_parts() {
        assert_eq!(sse_parts(&ServerSideEncryption::None), (None, None));
        assert_eq!(
            sse_parts(&ServerSideEncryption::Aes256),
            (Some(AwsServerSideEncryption::Aes256), None)
        );
        assert_eq!(
            sse_parts(&ServerSideEncryption::AwsKms {
                key_id: Some("alias/k".to_string())
            }),
            (
                Some(AwsServerSideEncryption::AwsKms),
                Some("alias/k".to_string())
            )
        );
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_chrono(&dt).unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_proxy_client_builds() {
        let config = ClientConfigBuilder::new()
            .region("us-east-1")
            .credentials("AKIAEXAMPLE", "secret")
            .proxy("proxy.local", 3128)
            .build()
            .unwrap();
        assert!(S3Store::new(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = ClientConfig::new();
        config.access_key = Some("AKIA".to_string());
        let err = S3Store::new(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
