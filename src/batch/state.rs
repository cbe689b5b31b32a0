//! Batch lifecycle state machine.
//!
//! Transitions are the only legal state-changing operation on a batch.
//! Legal edges:
//!
//! ```text
//! UPLOADED  -> PARSING
//! PARSING   -> VALIDATED | FAILED
//! VALIDATED -> STORING   | FAILED
//! STORING   -> COMPLETED | FAILED
//! COMPLETED -> (terminal)
//! FAILED    -> (terminal)
//! ```
//!
//! Re-entering the current state is an idempotent no-op, so a retry that
//! re-executes from the last durable state never trips the machine.

use crate::errors::{CoreError, CoreResult};
use crate::models::{Batch, BatchStatus};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use std::time::Instant;
use tracing::{error, info};

fn edge_allowed(current: BatchStatus, target: BatchStatus) -> bool {
    use BatchStatus::*;
    matches!(
        (current, target),
        (Uploaded, Parsing)
            | (Parsing, Validated)
            | (Parsing, Failed)
            | (Validated, Storing)
            | (Validated, Failed)
            | (Storing, Completed)
            | (Storing, Failed)
    )
}

/// Checks an edge without applying it. Idempotent re-entry is accepted.
pub fn validate_transition(current: BatchStatus, target: BatchStatus) -> CoreResult<()> {
    if current == target {
        return Ok(());
    }
    if current.is_terminal() || !edge_allowed(current, target) {
        return Err(CoreError::invalid_transition(
            current.as_str(),
            target.as_str(),
        ));
    }
    Ok(())
}

/// Applies a transition, stamping timestamps and enforcing the payload
/// invariants of success edges. Every attempt emits a transition metric.
pub fn apply_transition(
    batch: &mut Batch,
    target: BatchStatus,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let started = Instant::now();
    let from = batch.status;

    let result = apply_inner(batch, target, now);
    let outcome = if result.is_ok() { "ok" } else { "invalid" };
    counter!(
        "batch_transitions_total", 1,
        "from" => from.as_str(),
        "to" => target.as_str(),
        "outcome" => outcome
    );
    histogram!(
        "batch_transition_latency_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );

    match &result {
        Ok(()) => {
            if from != target {
                info!(batch_id = %batch.batch_id, from = from.as_str(), to = target.as_str(),
                      "batch transition");
            }
        }
        Err(e) => {
            // Illegal transitions are programmer errors; make them loud.
            error!(batch_id = %batch.batch_id, from = from.as_str(), to = target.as_str(),
                   error = %e, "illegal batch transition attempt");
        }
    }
    result
}

fn apply_inner(batch: &mut Batch, target: BatchStatus, now: DateTime<Utc>) -> CoreResult<()> {
    validate_transition(batch.status, target)?;
    if batch.status == target {
        return Ok(());
    }

    // Success edges past PARSING carry a stored artifact and a counted
    // exposure set.
    let leaving_parsing_onward = matches!(
        target,
        BatchStatus::Validated | BatchStatus::Storing | BatchStatus::Completed
    );
    if leaving_parsing_onward {
        if batch.object_ref.is_none() {
            return Err(CoreError::invalid_transition(
                batch.status.as_str(),
                target.as_str(),
            )
            .with_detail("object_ref must be set past PARSING"));
        }
        if batch.exposure_count < 0 {
            return Err(CoreError::invalid_transition(
                batch.status.as_str(),
                target.as_str(),
            )
            .with_detail("exposure_count must be non-negative"));
        }
    }

    batch.status = target;
    match target {
        BatchStatus::Completed => {
            batch.completed_at = Some(now);
            batch.processing_duration_ms =
                Some((now - batch.uploaded_at).num_milliseconds().max(0));
        }
        BatchStatus::Failed => {
            batch.failed_at = Some(now);
            batch.processing_duration_ms =
                Some((now - batch.uploaded_at).num_milliseconds().max(0));
        }
        _ => {}
    }
    Ok(())
}

/// Marks a batch FAILED from any non-terminal state, preserving the error.
pub fn fail_batch(batch: &mut Batch, error: &CoreError, now: DateTime<Utc>) {
    batch.error_message = Some(error.to_string());
    if batch.status.is_terminal() {
        return;
    }
    // PARSING/VALIDATED/STORING all have a FAILED edge; UPLOADED walks
    // through PARSING first so the path stays legal.
    if batch.status == BatchStatus::Uploaded {
        let _ = apply_transition(batch, BatchStatus::Parsing, now);
    }
    let _ = apply_transition(batch, BatchStatus::Failed, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileMetadata, ObjectRef};

    fn batch(status: BatchStatus) -> Batch {
        Batch {
            batch_id: "b1".to_string(),
            bank_id: "08081".to_string(),
            status,
            file_metadata: FileMetadata {
                file_name: "f.json".to_string(),
                content_type: "application/json".to_string(),
                size_bytes: 10,
                md5: "md5".to_string(),
                sha256: "sha".to_string(),
            },
            object_ref: Some(ObjectRef {
                bucket: "b".to_string(),
                key: "raw/b1/f.json".to_string(),
                version_id: "v".to_string(),
            }),
            exposure_count: 3,
            uploaded_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error_message: None,
            processing_duration_ms: None,
        }
    }

    #[test]
    fn test_legal_path_to_completed() {
        let mut b = batch(BatchStatus::Uploaded);
        let now = Utc::now();
        for target in [
            BatchStatus::Parsing,
            BatchStatus::Validated,
            BatchStatus::Storing,
            BatchStatus::Completed,
        ] {
            apply_transition(&mut b, target, now).unwrap();
        }
        assert_eq!(b.status, BatchStatus::Completed);
        assert!(b.completed_at.is_some());
        assert!(b.processing_duration_ms.is_some());
    }

    #[test]
    fn test_every_illegal_edge_rejected() {
        use BatchStatus::*;
        let all = [Uploaded, Parsing, Validated, Storing, Completed, Failed];
        for current in all {
            for target in all {
                let legal = current == target
                    || edge_allowed(current, target);
                let result = validate_transition(current, target);
                assert_eq!(
                    result.is_ok(),
                    legal,
                    "validate_transition({current:?}, {target:?})"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [BatchStatus::Completed, BatchStatus::Failed] {
            let mut b = batch(terminal);
            let err = apply_transition(&mut b, BatchStatus::Parsing, Utc::now()).unwrap_err();
            assert_eq!(err.code, "INVALID_TRANSITION");
        }
    }

    #[test]
    fn test_idempotent_reentry_is_noop() {
        let mut b = batch(BatchStatus::Parsing);
        apply_transition(&mut b, BatchStatus::Parsing, Utc::now()).unwrap();
        assert_eq!(b.status, BatchStatus::Parsing);
        assert!(b.completed_at.is_none());
    }

    #[test]
    fn test_success_edge_requires_object_ref() {
        let mut b = batch(BatchStatus::Parsing);
        b.object_ref = None;
        let err = apply_transition(&mut b, BatchStatus::Validated, Utc::now()).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidTransition);
        // The failure edge stays open.
        apply_transition(&mut b, BatchStatus::Failed, Utc::now()).unwrap();
        assert_eq!(b.status, BatchStatus::Failed);
    }

    #[test]
    fn test_fail_batch_from_uploaded_walks_legal_path() {
        let mut b = batch(BatchStatus::Uploaded);
        fail_batch(&mut b, &CoreError::parse("broken"), Utc::now());
        assert_eq!(b.status, BatchStatus::Failed);
        assert!(b.error_message.as_deref().unwrap().contains("PARSE_ERROR"));
        assert!(b.failed_at.is_some());
    }
}
