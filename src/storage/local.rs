//! Local-filesystem storage backend.
//!
//! Objects live at `{root}/{bucket}/{key}` with a JSON metadata sidecar.
//! Version ids are the first 16 hex chars of the content SHA-256. Multipart
//! uploads stage parts in `{root}/.uploads/{upload_id}` and rename into
//! place on completion.

use super::{sha256_hex, ObjectMetadata, ObjectStoreBackend};
use crate::errors::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

struct MultipartState {
    bucket: String,
    key: String,
    metadata: ObjectMetadata,
    staging_path: PathBuf,
    next_part: usize,
}

pub struct LocalFsBackend {
    root: PathBuf,
    uploads: Mutex<HashMap<String, MultipartState>>,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(".uploads"))?;
        Ok(Self {
            root,
            uploads: Mutex::new(HashMap::new()),
        })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        let path = self.object_path(bucket, key);
        path.with_file_name(format!(
            "{}.meta.json",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("object")
        ))
    }

    fn write_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        let version = version_of(bytes);
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        let mut meta = metadata.clone();
        meta.insert("version-id".to_string(), version.clone());
        fs::write(self.meta_path(bucket, key), serde_json::to_vec(&meta)?)?;
        Ok(version)
    }
}

fn version_of(bytes: &[u8]) -> String {
    sha256_hex(bytes)[..16].to_string()
}

impl ObjectStoreBackend for LocalFsBackend {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        self.write_object(bucket, key, bytes, metadata)
    }

    fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> CoreResult<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let staging_path = self.root.join(".uploads").join(&upload_id);
        fs::File::create(&staging_path)?;
        self.uploads.lock().insert(
            upload_id.clone(),
            MultipartState {
                bucket: bucket.to_string(),
                key: key.to_string(),
                metadata: metadata.clone(),
                staging_path,
                next_part: 1,
            },
        );
        Ok(upload_id)
    }

    fn upload_part(&self, upload_id: &str, part_number: usize, bytes: &[u8]) -> CoreResult<()> {
        let mut uploads = self.uploads.lock();
        let state = uploads
            .get_mut(upload_id)
            .ok_or_else(|| CoreError::system(format!("unknown upload {upload_id}")))?;
        if part_number != state.next_part {
            return Err(CoreError::system(format!(
                "out-of-order part {part_number}, expected {}",
                state.next_part
            )));
        }
        let mut file = fs::OpenOptions::new().append(true).open(&state.staging_path)?;
        file.write_all(bytes)?;
        state.next_part += 1;
        Ok(())
    }

    fn complete_multipart(&self, upload_id: &str) -> CoreResult<String> {
        let state = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| CoreError::system(format!("unknown upload {upload_id}")))?;
        let bytes = fs::read(&state.staging_path)?;
        let version = self.write_object(&state.bucket, &state.key, &bytes, &state.metadata)?;
        fs::remove_file(&state.staging_path).ok();
        Ok(version)
    }

    fn abort_multipart(&self, upload_id: &str) -> CoreResult<()> {
        if let Some(state) = self.uploads.lock().remove(upload_id) {
            fs::remove_file(&state.staging_path).ok();
        }
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> CoreResult<Vec<u8>> {
        let path = self.object_path(bucket, key);
        fs::read(&path)
            .map_err(|e| CoreError::system(format!("read {}: {e}", path.display())))
    }

    fn metadata(&self, bucket: &str, key: &str) -> CoreResult<ObjectMetadata> {
        let raw = fs::read(self.meta_path(bucket, key))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn delete(&self, bucket: &str, key: &str) -> CoreResult<()> {
        fs::remove_file(self.object_path(bucket, key)).ok();
        fs::remove_file(self.meta_path(bucket, key)).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        let mut metadata = ObjectMetadata::new();
        metadata.insert("content-type".to_string(), "text/plain".to_string());

        let version = backend.put("bkt", "raw/b1/a.txt", b"abc", &metadata).unwrap();
        assert_eq!(version.len(), 16);
        assert_eq!(backend.get("bkt", "raw/b1/a.txt").unwrap(), b"abc".to_vec());
        let meta = backend.metadata("bkt", "raw/b1/a.txt").unwrap();
        assert_eq!(meta.get("version-id"), Some(&version));

        backend.delete("bkt", "raw/b1/a.txt").unwrap();
        assert!(backend.get("bkt", "raw/b1/a.txt").is_err());
    }

    #[test]
    fn test_multipart_out_of_order_part_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        let upload_id = backend
            .create_multipart("bkt", "k", &ObjectMetadata::new())
            .unwrap();
        backend.upload_part(&upload_id, 1, b"a").unwrap();
        assert!(backend.upload_part(&upload_id, 3, b"c").is_err());
        backend.abort_multipart(&upload_id).unwrap();
    }

    #[test]
    fn test_multipart_completion_assembles_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path()).unwrap();
        let upload_id = backend
            .create_multipart("bkt", "big/file.bin", &ObjectMetadata::new())
            .unwrap();
        backend.upload_part(&upload_id, 1, &[1u8; 32]).unwrap();
        backend.upload_part(&upload_id, 2, &[2u8; 32]).unwrap();
        backend.complete_multipart(&upload_id).unwrap();
        let stored = backend.get("bkt", "big/file.bin").unwrap();
        assert_eq!(stored.len(), 64);
        assert_eq!(&stored[..32], &[1u8; 32]);
    }
}
