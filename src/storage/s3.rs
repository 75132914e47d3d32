use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;

use crate::config::S3StorageConfig;
use crate::errors::StorageError;
use crate::storage::StorageDriver;

/// S3-compatible storage driver (AWS, DigitalOcean Spaces, MinIO).
///
/// The client is built once with an explicit endpoint, region and static
/// credentials from config.json; all keys are namespaced under the location
/// URI's path prefix.
pub struct S3Driver {
    client: s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Driver {
    pub async fn connect(config: &S3StorageConfig, bucket: String, prefix: String) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket,
            prefix,
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            full
        } else {
            full.strip_prefix(&self.prefix)
                .map(|s| s.trim_start_matches('/'))
                .unwrap_or(full)
        }
    }
}

/// Classify an SDK error into the retry taxonomy: connection/timeout and
/// throttling-style service responses are transient, a missing key maps to
/// NotFound, everything else is permanent.
fn classify_sdk_error<E, R>(err: &SdkError<E, R>, op: &str, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Transient(format!("s3 {op} {key}: {}", DisplayErrorContext(err)))
        }
        SdkError::ServiceError(ctx) => match ctx.err().code().unwrap_or("") {
            "NoSuchKey" | "NotFound" => StorageError::NotFound(key.to_string()),
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout"
            | "InternalError" | "ServiceUnavailable" => {
                StorageError::Transient(format!("s3 {op} {key}: {}", DisplayErrorContext(err)))
            }
            _ => StorageError::Permanent(format!("s3 {op} {key}: {}", DisplayErrorContext(err))),
        },
        _ => StorageError::Permanent(format!("s3 {op} {key}: {}", DisplayErrorContext(err))),
    }
}

#[async_trait]
impl StorageDriver for S3Driver {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let full = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, "put", key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.full_key(key);
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, "get", key))?;

        let mut body = object.body;
        let mut data = Vec::new();
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    return Err(StorageError::Transient(format!(
                        "s3 get {key}: body read failed: {e}"
                    )))
                }
            }
        }
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, "delete", key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify_sdk_error(&e, "list", prefix))?;
            for object in page.contents() {
                if let Some(full_key) = object.key() {
                    keys.push(self.strip_prefix(full_key).to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            // HeadObject 404s carry no error body, so check the variant
            // directly instead of relying on the error code.
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => {
                Ok(false)
            }
            Err(e) => match classify_sdk_error(&e, "head", key) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
