//! Object store gateway.
//!
//! Artifacts are written through [`ObjectStoreGateway`], which enforces the
//! integrity contract (caller-supplied MD5 + SHA-256 recomputed over the
//! uploaded content), the upload policy (single-part up to 100 MiB, 5 MiB
//! multipart above, abort on part failure) and mandatory AES-256
//! server-side-encryption metadata. The backend is a configuration switch:
//! local filesystem or an in-memory store with an identical contract.

mod local;
mod memory;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;

use crate::errors::{CoreError, CoreResult};
use crate::models::ObjectRef;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Single-part uploads are allowed up to this size.
pub const SINGLE_PART_LIMIT: usize = 100 * 1024 * 1024;
/// Part size used above the single-part limit.
pub const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

pub type ObjectMetadata = BTreeMap<String, String>;

/// Storage backend seam. Implementations must be safe for concurrent use.
pub trait ObjectStoreBackend: Send + Sync {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
    ) -> CoreResult<String>;

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CoreResult<String>;

    fn upload_part(&self, upload_id: &str, part_number: usize, bytes: &[u8]) -> CoreResult<()>;

    /// Returns the stored object's version id.
    fn complete_multipart(&self, upload_id: &str) -> CoreResult<String>;

    fn abort_multipart(&self, upload_id: &str) -> CoreResult<()>;

    fn get(&self, bucket: &str, key: &str) -> CoreResult<Vec<u8>>;

    fn metadata(&self, bucket: &str, key: &str) -> CoreResult<ObjectMetadata>;

    fn delete(&self, bucket: &str, key: &str) -> CoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ObjectStoreGateway {
    backend: Arc<dyn ObjectStoreBackend>,
    bucket: String,
    prefix: String,
    presign_secret: String,
}

impl ObjectStoreGateway {
    pub fn new(
        backend: Arc<dyn ObjectStoreBackend>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        presign_secret: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            prefix: prefix.into(),
            presign_secret: presign_secret.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key for an inbound raw artifact.
    pub fn raw_key(&self, batch_id: &str, file_name: &str) -> String {
        self.prefixed(format!("raw/{batch_id}/{file_name}"))
    }

    /// Key for a derived result artifact.
    pub fn derived_key(&self, batch_id: &str, artifact: &str) -> String {
        self.prefixed(format!("derived/{batch_id}/{artifact}"))
    }

    fn prefixed(&self, key: String) -> String {
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        }
    }

    /// Uploads `bytes` under `key`, verifying both digests against the
    /// caller's expectations before any write reaches the backend.
    pub fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        expected_md5: &str,
        expected_sha256: &str,
    ) -> CoreResult<ObjectRef> {
        let actual_md5 = md5_hex(bytes);
        if !actual_md5.eq_ignore_ascii_case(expected_md5) {
            return Err(CoreError::checksum_mismatch("md5", expected_md5, &actual_md5));
        }
        let actual_sha256 = sha256_hex(bytes);
        if !actual_sha256.eq_ignore_ascii_case(expected_sha256) {
            return Err(CoreError::checksum_mismatch(
                "sha256",
                expected_sha256,
                &actual_sha256,
            ));
        }

        let mut metadata = ObjectMetadata::new();
        metadata.insert("content-type".to_string(), content_type.to_string());
        metadata.insert("content-md5".to_string(), actual_md5);
        metadata.insert("content-sha256".to_string(), actual_sha256);
        // Server-side encryption is mandatory for every object.
        metadata.insert("sse".to_string(), "AES256".to_string());

        let version_id = if bytes.len() <= SINGLE_PART_LIMIT {
            self.backend.put(&self.bucket, key, bytes, &metadata)?
        } else {
            self.put_multipart(key, bytes, &metadata)?
        };

        Ok(ObjectRef {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            version_id,
        })
    }

    /// Convenience for derived artifacts where the digests are computed here.
    pub fn put_derived(&self, key: &str, bytes: &[u8], content_type: &str) -> CoreResult<ObjectRef> {
        let md5 = md5_hex(bytes);
        let sha256 = sha256_hex(bytes);
        self.put_object(key, bytes, content_type, &md5, &sha256)
    }

    fn put_multipart(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        let upload_id = self.backend.create_multipart(&self.bucket, key, metadata)?;
        for (part_number, chunk) in bytes.chunks(MULTIPART_PART_SIZE).enumerate() {
            if let Err(e) = self.backend.upload_part(&upload_id, part_number + 1, chunk) {
                self.backend.abort_multipart(&upload_id).ok();
                return Err(e);
            }
        }
        self.backend.complete_multipart(&upload_id)
    }

    pub fn get_object(&self, object_ref: &ObjectRef) -> CoreResult<Vec<u8>> {
        self.backend.get(&object_ref.bucket, &object_ref.key)
    }

    pub fn object_metadata(&self, object_ref: &ObjectRef) -> CoreResult<ObjectMetadata> {
        self.backend.metadata(&object_ref.bucket, &object_ref.key)
    }

    /// Builds a URL with an absolute expiry and an HMAC-SHA256 signature over
    /// bucket, key and expiry.
    pub fn presign_get(&self, object_ref: &ObjectRef, ttl: std::time::Duration) -> PresignedUrl {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300));
        let expires = expires_at.timestamp();
        let sig = self.sign(&object_ref.bucket, &object_ref.key, expires);
        PresignedUrl {
            url: format!(
                "regflow://{}/{}?expires={}&sig={}",
                object_ref.bucket, object_ref.key, expires, sig
            ),
            expires_at,
        }
    }

    /// Checks signature and expiry of a presigned URL produced by this
    /// gateway.
    pub fn verify_presigned(&self, url: &str, now: DateTime<Utc>) -> bool {
        let Some(rest) = url.strip_prefix("regflow://") else {
            return false;
        };
        let Some((path, query)) = rest.split_once('?') else {
            return false;
        };
        let Some((bucket, key)) = path.split_once('/') else {
            return false;
        };
        let mut expires: Option<i64> = None;
        let mut sig: Option<&str> = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse().ok(),
                Some(("sig", v)) => sig = Some(v),
                _ => {}
            }
        }
        let (Some(expires), Some(sig)) = (expires, sig) else {
            return false;
        };
        if now.timestamp() > expires {
            return false;
        }
        self.sign(bucket, key, expires) == sig
    }

    fn sign(&self, bucket: &str, key: &str, expires: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.presign_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{bucket}/{key}?expires={expires}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
