use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use super::{BodyStream, ObjectStore, ObjectUrls};
use crate::config::S3StorageConfig;

/// S3 bucket holding LFS objects keyed by OID.
pub struct S3Storage {
    pub client: Client,
    pub bucket: String,
    pub region: String,
    pub use_accelerate: bool,
    pub presign_enabled: bool,
    pub presign_expiry: Duration,
    pub part_size: usize,
}

impl S3Storage {
    /// Create a new `S3Storage` from an already-configured `Client` and the
    /// application-level S3 config section.  `region` is the region the
    /// client resolved and is only used to build non-presigned URLs.
    pub fn new(client: Client, config: &S3StorageConfig, region: String) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            region,
            use_accelerate: config.use_accelerate,
            presign_enabled: config.presign_enabled,
            presign_expiry: config.presign_expiry(),
            part_size: config.multipart_part_size,
        }
    }

    fn presigning_config(&self) -> Result<PresigningConfig> {
        PresigningConfig::builder()
            .expires_in(self.presign_expiry)
            .build()
            .context("build PresigningConfig")
    }

    /// Upload a single in-memory body with PutObject.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let len = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .context("S3 PutObject")?;

        debug!(bytes = len, "object uploaded");
        Ok(())
    }

    /// Upload `first` followed by the rest of `body` as parts of an already
    /// created multipart upload, then complete it.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        body: &mut BodyStream,
    ) -> Result<()> {
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut total: usize = 0;
        let mut next = Some(first);

        while let Some(chunk) = next {
            total += chunk.len();
            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("S3 UploadPart {part_number}"))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(resp.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
            next = read_part(body, self.part_size).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .context("S3 CompleteMultipartUpload")?;

        debug!(bytes = total, parts = part_number - 1, "multipart upload completed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Storage {
    /// Check whether an object exists in S3 (HEAD request).
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, oid: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(oid)
            .send()
            .await
        {
            Ok(_) => {
                debug!("object exists");
                Ok(true)
            }
            Err(err) => {
                // The SDK returns a service error with code "NotFound" (or an
                // HTTP 404) when the object does not exist.
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found())
                {
                    debug!("object does not exist");
                    Ok(false)
                } else {
                    Err(err).context("S3 HeadObject")
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn object_urls(&self, oid: &str) -> Result<ObjectUrls> {
        if !self.presign_enabled {
            let href = direct_object_url(&self.bucket, &self.region, self.use_accelerate, oid);
            return Ok(ObjectUrls {
                head_href: href.clone(),
                href,
            });
        }

        let get = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(oid)
            .presigned(self.presigning_config()?)
            .await
            .context("presign GetObject")?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(oid)
            .presigned(self.presigning_config()?)
            .await
            .context("presign HeadObject")?;

        debug!("presigned URLs generated");
        Ok(ObjectUrls {
            href: get.uri().to_string(),
            head_href: head.uri().to_string(),
        })
    }

    /// Stream `body` into S3.  Bodies smaller than one part go up with a
    /// single PutObject; larger ones use a multipart upload that is aborted
    /// if any part fails.
    #[instrument(skip(self, body), fields(bucket = %self.bucket))]
    async fn upload(&self, oid: &str, mut body: BodyStream) -> Result<()> {
        let first = read_part(&mut body, self.part_size)
            .await?
            .unwrap_or_default();
        if first.len() < self.part_size {
            return self.put_object(oid, first).await;
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(oid)
            .send()
            .await
            .context("S3 CreateMultipartUpload")?;
        let upload_id = created
            .upload_id()
            .context("S3 CreateMultipartUpload returned no upload id")?
            .to_string();

        if let Err(err) = self.upload_parts(oid, &upload_id, first, &mut body).await {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(oid)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(error = %abort_err, %upload_id, "failed to abort multipart upload");
            }
            return Err(err);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accumulate chunks from `body` until at least `part_size` bytes are
/// buffered or the stream ends.  Returns `None` once the stream is exhausted.
async fn read_part(body: &mut BodyStream, part_size: usize) -> Result<Option<Bytes>> {
    let mut buf = BytesMut::new();
    while buf.len() < part_size {
        match body.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk.context("read object body")?),
            None => break,
        }
    }
    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(buf.freeze()))
    }
}

/// Public, non-presigned URL of an object.
pub fn direct_object_url(bucket: &str, region: &str, use_accelerate: bool, oid: &str) -> String {
    if use_accelerate {
        format!("https://{bucket}.s3-accelerate.amazonaws.com/{oid}")
    } else {
        format!("https://{bucket}.s3.{region}.amazonaws.com/{oid}")
    }
}
