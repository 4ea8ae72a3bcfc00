// dbbackup/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::http::HttpResponse;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use s3::types::{
    BucketLocationConstraint, ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ObjectMeta, ObjectStore, Precondition, StoreError};
use crate::config::S3Config;
use crate::credentials::StorageCredentials;
use crate::utils::checksum::{hex_to_base64, sha256_hex};

/// User metadata key carrying the hex SHA-256 of an uploaded payload.
const SHA256_METADATA_KEY: &str = "sha256";

/// Largest object S3 accepts in one PutObject or CopyObject call.
const SINGLE_REQUEST_LIMIT: u64 = 5 * 1024 * 1024 * 1024;
/// Files above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 512 * 1024 * 1024;
const MIN_PART_SIZE: u64 = 64 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// `(part_number, offset, length)` for each part of a `total`-byte object.
fn part_plan(total: u64) -> Vec<(i32, u64, u64)> {
    let part_size = MIN_PART_SIZE.max(total.div_ceil(MAX_PARTS));
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < total {
        let length = part_size.min(total - offset);
        parts.push((parts.len() as i32 + 1, offset, length));
        offset += length;
    }
    parts
}

/// Any S3-compatible service (AWS, DigitalOcean Spaces, MinIO, R2).
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    region: String,
}

impl S3Store {
    pub async fn connect(config: &S3Config, credentials: Option<StorageCredentials>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        // Without mounted credentials the default provider chain applies.
        if let Some(credentials) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                None, // session_token
                None, // expiry
                "MountedSecret",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
            region: config.region.clone(),
        }
    }

    fn copy_source(&self, key: &str) -> String {
        // Keys are built from [A-Za-z0-9_./-] only, so no percent-encoding is needed.
        format!("{}/{}", self.bucket, key)
    }

    async fn start_upload(&self, key: &str, sha256_hex: Option<&str>, checksummed: bool) -> Result<String, StoreError> {
        let mut request = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        if checksummed {
            request = request.checksum_algorithm(ChecksumAlgorithm::Sha256);
        }
        if let Some(digest) = sha256_hex {
            request = request.metadata(SHA256_METADATA_KEY, digest);
        }
        let output = request.send().await.map_err(|e| classify(key, e))?;
        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::permanent(key, "storage returned no upload id"))
    }

    /// Completes the upload, or aborts it if `parts` failed or completion does.
    async fn finish_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Result<Vec<CompletedPart>, StoreError>,
    ) -> Result<Option<String>, StoreError> {
        let completed = match parts {
            Ok(parts) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                .send()
                .await
                .map(|output| output.e_tag().map(str::to_owned))
                .map_err(|e| classify(key, e)),
            Err(e) => Err(e),
        };

        if completed.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(key, upload_id, error = %DisplayErrorContext(&e), "could not abort multipart upload");
            }
        }
        completed
    }

    /// Streams `source` in parts, each validated server-side by its own SHA-256.
    async fn upload_parts(
        &self,
        key: &str,
        source: &Path,
        size: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let unreadable = |e: std::io::Error| StoreError::permanent(key, format!("cannot read {}: {}", source.display(), e));
        let mut file = tokio::fs::File::open(source).await.map_err(unreadable)?;
        let mut parts = Vec::new();

        for (number, _, length) in part_plan(size) {
            let mut chunk = vec![0u8; length as usize];
            file.read_exact(&mut chunk).await.map_err(unreadable)?;
            let checksum = hex_to_base64(&sha256_hex(&chunk)).map_err(|e| StoreError::permanent(key, e))?;

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .content_length(length as i64)
                .checksum_algorithm(ChecksumAlgorithm::Sha256)
                .checksum_sha256(checksum.clone())
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| classify(key, e))?;
            debug!(key, part = number, length, "uploaded part");

            parts.push(
                CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(output.e_tag().map(str::to_owned))
                    .checksum_sha256(checksum)
                    .build(),
            );
        }
        Ok(parts)
    }

    async fn copy_parts(&self, from: &str, to: &str, size: u64, upload_id: &str) -> Result<Vec<CompletedPart>, StoreError> {
        let mut parts = Vec::new();
        for (number, offset, length) in part_plan(size) {
            let output = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(to)
                .upload_id(upload_id)
                .part_number(number)
                .copy_source(self.copy_source(from))
                .copy_source_range(format!("bytes={}-{}", offset, offset + length - 1))
                .send()
                .await
                .map_err(|e| classify(to, e))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(output.copy_part_result().and_then(|r| r.e_tag()).map(str::to_owned))
                    .build(),
            );
        }
        Ok(parts)
    }
}

/// Sorts SDK failures into what the retry loop and the lease care about.
fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::transient(key, message)
        }
        SdkError::ConstructionFailure(_) => StoreError::permanent(key, message),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16()).unwrap_or(0);
            match (status, err.code()) {
                (404, _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => {
                    StoreError::NotFound(key.to_string())
                }
                (409, _) | (412, _) | (_, Some("PreconditionFailed")) => {
                    StoreError::PreconditionFailed(key.to_string())
                }
                (408, _) | (429, _) | (500..=599, _) => StoreError::transient(key, message),
                (_, Some("RequestTimeout")) | (_, Some("SlowDown")) | (_, Some("InternalError")) => {
                    StoreError::transient(key, message)
                }
                _ => StoreError::permanent(key, message),
            }
        }
    }
}

fn to_chrono(value: Option<&s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        sha256_hex: Option<&str>,
    ) -> Result<ObjectMeta, StoreError> {
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|e| StoreError::permanent(key, format!("cannot stat {}: {}", source.display(), e)))?
            .len();
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StoreError::permanent(key, format!("cannot read {}: {}", source.display(), e)))?;

        if size > MULTIPART_THRESHOLD {
            debug!(bucket = %self.bucket, key, size, "putting object in parts");
            let upload_id = self.start_upload(key, sha256_hex, true).await?;
            let parts = self.upload_parts(key, source, size, &upload_id).await;
            let version = self.finish_upload(key, &upload_id, parts).await?;
            return Ok(ObjectMeta {
                key: key.to_string(),
                size,
                last_modified: Some(Utc::now()),
                sha256: sha256_hex.map(str::to_owned),
                version,
            });
        }

        debug!(bucket = %self.bucket, key, size, "putting object");

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size as i64)
            .body(body);
        if let Some(digest) = sha256_hex {
            // The service recomputes the digest and rejects the write on mismatch.
            let token = hex_to_base64(digest).map_err(|e| StoreError::permanent(key, e))?;
            request = request
                .checksum_algorithm(ChecksumAlgorithm::Sha256)
                .checksum_sha256(token)
                .metadata(SHA256_METADATA_KEY, digest);
        }

        let output = request.send().await.map_err(|e| classify(key, e))?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified: Some(Utc::now()),
            sha256: sha256_hex.map(str::to_owned),
            version: output.e_tag().map(str::to_owned),
        })
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Vec<u8>,
        precondition: Precondition,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body));
        request = match precondition {
            Precondition::None => request,
            Precondition::IfAbsent => request.if_none_match("*"),
            Precondition::IfMatch(etag) => request.if_match(etag),
        };

        let output = request.send().await.map_err(|e| classify(key, e))?;
        output
            .e_tag()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::permanent(key, "storage returned no ETag"))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<u64, StoreError> {
        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        let mut output_file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StoreError::permanent(key, format!("cannot create {}: {}", dest.display(), e)))?;

        let mut total_bytes_downloaded = 0u64;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| StoreError::transient(key, e.to_string()))?
        {
            output_file
                .write_all(&bytes_chunk)
                .await
                .map_err(|e| StoreError::transient(key, e.to_string()))?;
            total_bytes_downloaded += bytes_chunk.len() as u64;
        }
        output_file
            .flush()
            .await
            .map_err(|e| StoreError::transient(key, e.to_string()))?;

        Ok(total_bytes_downloaded)
    }

    async fn get_bytes(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        let etag = object.e_tag().map(str::to_owned).unwrap_or_default();
        let body = object
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient(key, e.to_string()))?
            .into_bytes()
            .to_vec();
        Ok((body, etag))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let output = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                return match classify(key, err) {
                    StoreError::NotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };

        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: to_chrono(output.last_modified()),
            sha256: output
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA_KEY))
                .cloned(),
            version: output.e_tag().map(str::to_owned),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.clone())
                .send()
                .await
                .map_err(|e| classify(prefix, e))?;

            for object in output.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_chrono(object.last_modified()),
                    sha256: None,
                    version: object.e_tag().map(str::to_owned),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let source = self
            .head(from)
            .await?
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;

        if source.size <= SINGLE_REQUEST_LIMIT {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .key(to)
                .copy_source(self.copy_source(from))
                .checksum_algorithm(ChecksumAlgorithm::Sha256)
                .send()
                .await
                .map_err(|e| classify(to, e))?;
            return Ok(());
        }

        debug!(bucket = %self.bucket, from, to, size = source.size, "copying object in parts");
        // Part copies do not carry user metadata over, so the digest is set again.
        let upload_id = self.start_upload(to, source.sha256.as_deref(), false).await?;
        let parts = self.copy_parts(from, to, source.size, &upload_id).await;
        self.finish_upload(to, &upload_id, parts).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match classify(key, err) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn ensure_container(&self) -> Result<(), StoreError> {
        let missing = match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => false,
            Err(err) => match classify(&self.bucket, err) {
                StoreError::NotFound(_) => true,
                other => return Err(other),
            },
        };
        if !missing {
            info!(bucket = %self.bucket, "bucket already exists");
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, region = %self.region, "bucket created");
                Ok(())
            }
            Err(err) if err.code() == Some("BucketAlreadyOwnedByYou") => Ok(()),
            Err(err) => Err(classify(&self.bucket, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_plan_covers_the_object_exactly() {
        let total = 5 * MIN_PART_SIZE / 2;
        let plan = part_plan(total);
        assert_eq!(
            plan,
            vec![
                (1, 0, MIN_PART_SIZE),
                (2, MIN_PART_SIZE, MIN_PART_SIZE),
                (3, 2 * MIN_PART_SIZE, MIN_PART_SIZE / 2),
            ]
        );
    }

    #[test]
    fn part_plan_stays_within_the_part_limit() {
        let total = 6 * 1024 * 1024 * 1024 * 1024;
        let plan = part_plan(total);
        assert!(plan.len() as u64 <= MAX_PARTS);
        assert_eq!(plan.iter().map(|(_, _, length)| length).sum::<u64>(), total);
        assert!(plan.windows(2).all(|w| w[0].1 + w[0].2 == w[1].1));
    }

    #[test]
    fn objects_over_the_single_request_limit_go_up_in_parts() {
        assert!(MULTIPART_THRESHOLD < SINGLE_REQUEST_LIMIT);
        assert!(part_plan(SINGLE_REQUEST_LIMIT + 1).len() > 1);
        assert!(part_plan(0).is_empty());
    }
}
