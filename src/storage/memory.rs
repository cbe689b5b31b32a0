//! In-memory storage backend for tests and ephemeral runs.

use super::{sha256_hex, ObjectMetadata, ObjectStoreBackend};
use crate::errors::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;

struct StoredObject {
    bytes: Vec<u8>,
    metadata: ObjectMetadata,
}

struct PendingUpload {
    bucket: String,
    key: String,
    metadata: ObjectMetadata,
    buffer: Vec<u8>,
    next_part: usize,
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> String {
        let version = sha256_hex(&bytes)[..16].to_string();
        let mut metadata = metadata;
        metadata.insert("version-id".to_string(), version.clone());
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { bytes, metadata },
        );
        version
    }
}

impl ObjectStoreBackend for MemoryBackend {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        Ok(self.store(bucket, key, bytes.to_vec(), metadata.clone()))
    }

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                metadata: metadata.clone(),
                buffer: Vec::new(),
                next_part: 1,
            },
        );
        Ok(upload_id)
    }

    fn upload_part(&self, upload_id: &str, part_number: usize, bytes: &[u8]) -> CoreResult<()> {
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| CoreError::system(format!("unknown upload {upload_id}")))?;
        if part_number != upload.next_part {
            return Err(CoreError::system(format!(
                "out-of-order part {part_number}, expected {}",
                upload.next_part
            )));
        }
        upload.buffer.extend_from_slice(bytes);
        upload.next_part += 1;
        Ok(())
    }

    fn complete_multipart(&self, upload_id: &str) -> CoreResult<String> {
        let upload = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| CoreError::system(format!("unknown upload {upload_id}")))?;
        Ok(self.store(&upload.bucket, &upload.key, upload.buffer, upload.metadata))
    }

    fn abort_multipart(&self, upload_id: &str) -> CoreResult<()> {
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> CoreResult<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| CoreError::system(format!("object {bucket}/{key} not found")))
    }

    fn metadata(&self, bucket: &str, key: &str) -> CoreResult<ObjectMetadata> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
            .ok_or_else(|| CoreError::system(format!("object {bucket}/{key} not found")))
    }

    fn delete(&self, bucket: &str, key: &str) -> CoreResult<()> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
