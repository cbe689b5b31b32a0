//! Batch submission and status queries (the §-facing inbound contract).
//!
//! A submitted file is checksummed, stored under `raw/{batch_id}/{name}`,
//! recorded as an UPLOADED batch and announced with a `BatchIngested` event
//! committed in the same transaction as the batch row.

use crate::db::Database;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::events::{BatchIngested, DomainEvent};
use crate::models::{new_batch_id, Batch, BatchStatus, FileMetadata};
use crate::parser::detect_format;
use crate::storage::{md5_hex, sha256_hex, ObjectStoreGateway};
use chrono::Utc;
use tracing::info;

/// Hard cap on inbound file size.
pub const MAX_FILE_SIZE: usize = 500 * 1024 * 1024;

#[derive(Clone)]
pub struct IngestionService {
    db: Database,
    gateway: ObjectStoreGateway,
}

impl IngestionService {
    pub fn new(db: Database, gateway: ObjectStoreGateway) -> Self {
        Self { db, gateway }
    }

    pub fn submit_batch(
        &self,
        bank_id: &str,
        bytes: &[u8],
        file_name: &str,
        content_type: &str,
    ) -> CoreResult<Batch> {
        if bank_id.trim().is_empty() {
            return Err(CoreError::new(
                ErrorKind::ValidationError,
                "MISSING_REQUIRED_PARAMETER",
                "error.batch.missing_bank_id",
            ));
        }
        if bytes.len() > MAX_FILE_SIZE {
            return Err(CoreError::new(
                ErrorKind::ValidationError,
                "FILE_TOO_LARGE",
                "error.batch.file_too_large",
            )
            .with_detail(format!("{} bytes", bytes.len())));
        }
        if detect_format(file_name, content_type).is_none() {
            return Err(CoreError::new(
                ErrorKind::ValidationError,
                "INVALID_FILE_FORMAT",
                "error.batch.invalid_file_format",
            )
            .with_detail(format!("{file_name} ({content_type})")));
        }

        let now = Utc::now();
        let batch_id = new_batch_id(now);
        let md5 = md5_hex(bytes);
        let sha256 = sha256_hex(bytes);

        let key = self.gateway.raw_key(&batch_id, file_name);
        let object_ref = self.gateway.put_object(&key, bytes, content_type, &md5, &sha256)?;

        let batch = Batch {
            batch_id: batch_id.clone(),
            bank_id: bank_id.to_string(),
            status: BatchStatus::Uploaded,
            file_metadata: FileMetadata {
                file_name: file_name.to_string(),
                content_type: content_type.to_string(),
                size_bytes: bytes.len() as u64,
                md5,
                sha256,
            },
            object_ref: Some(object_ref.clone()),
            exposure_count: 0,
            uploaded_at: now,
            completed_at: None,
            failed_at: None,
            error_message: None,
            processing_duration_ms: None,
        };

        let event = DomainEvent::BatchIngested(BatchIngested {
            batch_id: batch_id.clone(),
            bank_id: bank_id.to_string(),
            object_ref,
            exposure_count: 0,
            uploaded_at: now,
        });
        self.db
            .insert_batch_with_event(&batch, &event.to_outbox_insert()?)?;

        info!(batch_id, bank_id, file_name, size = bytes.len(), "batch submitted");
        Ok(batch)
    }

    pub fn get_batch_status(&self, batch_id: &str) -> CoreResult<Option<Batch>> {
        self.db.get_batch(batch_id)
    }

    pub fn list_batches(&self, bank_id: &str, limit: usize) -> CoreResult<Vec<Batch>> {
        self.db.list_batches(bank_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::sync::Arc;

    fn service() -> (IngestionService, Database) {
        let db = Database::in_memory().unwrap();
        let gateway =
            ObjectStoreGateway::new(Arc::new(MemoryBackend::new()), "bucket", "", "secret");
        (IngestionService::new(db.clone(), gateway), db)
    }

    #[test]
    fn test_submit_records_batch_and_event() {
        let (service, db) = service();
        let batch = service
            .submit_batch("08081", br#"[]"#, "exposures.json", "application/json")
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Uploaded);
        assert!(batch.object_ref.as_ref().unwrap().key.contains("raw/"));
        assert_eq!(batch.file_metadata.size_bytes, 2);

        let stored = db.get_batch(&batch.batch_id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Uploaded);

        let pending = db.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "BatchIngested");
    }

    #[test]
    fn test_missing_bank_id_rejected() {
        let (service, _db) = service();
        let err = service
            .submit_batch("  ", br#"[]"#, "f.json", "application/json")
            .unwrap_err();
        assert_eq!(err.code, "MISSING_REQUIRED_PARAMETER");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let (service, _db) = service();
        let err = service
            .submit_batch("08081", b"...", "f.parquet", "application/octet-stream")
            .unwrap_err();
        assert_eq!(err.code, "INVALID_FILE_FORMAT");
    }

    #[test]
    fn test_status_lookup() {
        let (service, _db) = service();
        assert!(service.get_batch_status("nope").unwrap().is_none());
        let batch = service
            .submit_batch("08081", br#"[]"#, "f.json", "application/json")
            .unwrap();
        assert!(service.get_batch_status(&batch.batch_id).unwrap().is_some());
        assert_eq!(service.list_batches("08081", 10).unwrap().len(), 1);
        assert!(service.list_batches("99999", 10).unwrap().is_empty());
    }
}
