//! Observer interface for run progress.
//!
//! Components report what they do as [`BackfillEvent`]s; callers subscribe by
//! handing an [`EventSink`] to the orchestrator. The state machine itself never
//! logs directly.

use std::sync::Mutex;

use serde::Serialize;

use crate::models::{BatchUpdateResult, RunPhase, RunTotals, SkipReason};
use crate::scanner::EligibilityStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    ProductNotFound,
    Orphaned,
    AlreadyMigrated,
    OwnerExcluded,
    OwnerNotFound,
    OwnerMissingValue,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackfillEvent {
    ScanCompleted {
        run_id: String,
        stats: EligibilityStats,
    },
    CandidateRejected {
        run_id: String,
        attempt: u32,
        product_id: String,
        owner_id: Option<String>,
        reason: RejectReason,
    },
    CandidateSelected {
        run_id: String,
        attempt: u32,
        product_id: String,
        owner_id: String,
        company_id: String,
        priority: bool,
    },
    NoEligibleWork {
        run_id: String,
        selection_attempts: u32,
    },
    BatchLoaded {
        run_id: String,
        owner_id: String,
        batch_index: usize,
        range_label: String,
        records: usize,
        has_more: bool,
    },
    RecordSkipped {
        run_id: String,
        product_id: String,
        owner_id: String,
        reason: SkipReason,
    },
    BatchApplied {
        run_id: String,
        batch: BatchUpdateResult,
        totals: RunTotals,
    },
    WriteFailed {
        run_id: String,
        owner_id: String,
        batch_index: usize,
        attempted: usize,
        error: String,
    },
    OwnerCompleted {
        run_id: String,
        owner_id: String,
        batches: usize,
    },
    RunCompleted {
        run_id: String,
        phase: RunPhase,
        totals: RunTotals,
    },
}

impl BackfillEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BackfillEvent::ScanCompleted { .. } => "scan_completed",
            BackfillEvent::CandidateRejected { .. } => "candidate_rejected",
            BackfillEvent::CandidateSelected { .. } => "candidate_selected",
            BackfillEvent::NoEligibleWork { .. } => "no_eligible_work",
            BackfillEvent::BatchLoaded { .. } => "batch_loaded",
            BackfillEvent::RecordSkipped { .. } => "record_skipped",
            BackfillEvent::BatchApplied { .. } => "batch_applied",
            BackfillEvent::WriteFailed { .. } => "write_failed",
            BackfillEvent::OwnerCompleted { .. } => "owner_completed",
            BackfillEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &BackfillEvent);
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &BackfillEvent) {
        match event {
            BackfillEvent::ScanCompleted { run_id, stats } => tracing::info!(
                run_id = %run_id,
                total_checked = stats.total_checked,
                migrated = stats.migrated,
                orphaned = stats.orphaned,
                owner_missing_value = stats.owner_missing_value,
                eligible = stats.eligible,
                malformed = stats.malformed,
                "Eligibility scan completed"
            ),
            BackfillEvent::CandidateRejected { run_id, attempt, product_id, owner_id, reason } => tracing::debug!(
                run_id = %run_id,
                attempt,
                product_id = %product_id,
                owner_id = ?owner_id,
                reason = ?reason,
                "Candidate rejected"
            ),
            BackfillEvent::CandidateSelected { run_id, attempt, product_id, owner_id, company_id, priority } => tracing::info!(
                run_id = %run_id,
                attempt,
                product_id = %product_id,
                owner_id = %owner_id,
                company_id = %company_id,
                priority,
                "Candidate selected"
            ),
            BackfillEvent::NoEligibleWork { run_id, selection_attempts } => tracing::info!(
                run_id = %run_id,
                selection_attempts,
                "No eligible products to backfill"
            ),
            BackfillEvent::BatchLoaded { run_id, owner_id, batch_index, range_label, records, has_more } => tracing::debug!(
                run_id = %run_id,
                owner_id = %owner_id,
                batch_index,
                range = %range_label,
                records,
                has_more,
                "Batch loaded"
            ),
            BackfillEvent::RecordSkipped { run_id, product_id, owner_id, reason } => match reason {
                SkipReason::OwnerMismatch => tracing::warn!(
                    run_id = %run_id,
                    product_id = %product_id,
                    owner_id = %owner_id,
                    "Product seller does not match bound seller; skipped"
                ),
                _ => tracing::debug!(
                    run_id = %run_id,
                    product_id = %product_id,
                    owner_id = %owner_id,
                    reason = ?reason,
                    "Product skipped"
                ),
            },
            BackfillEvent::BatchApplied { run_id, batch, totals } => tracing::info!(
                run_id = %run_id,
                owner_id = %batch.owner_id,
                batch_index = batch.batch_index,
                range = %batch.range_label,
                updated = batch.updated_count,
                skipped = batch.skipped_count,
                errors = batch.error_count,
                total_updated = totals.updated,
                "Batch applied"
            ),
            BackfillEvent::WriteFailed { run_id, owner_id, batch_index, attempted, error } => tracing::error!(
                run_id = %run_id,
                owner_id = %owner_id,
                batch_index,
                attempted,
                error = %error,
                "Atomic batch write failed"
            ),
            BackfillEvent::OwnerCompleted { run_id, owner_id, batches } => tracing::info!(
                run_id = %run_id,
                owner_id = %owner_id,
                batches,
                "Seller exhausted"
            ),
            BackfillEvent::RunCompleted { run_id, phase, totals } => tracing::info!(
                run_id = %run_id,
                phase = ?phase,
                scanned = totals.scanned,
                updated = totals.updated,
                skipped = totals.skipped,
                errors = totals.errors,
                "Backfill run finished"
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_event(&self, _event: &BackfillEvent) {}
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<BackfillEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BackfillEvent> {
        self.events.lock().expect("Event sink mutex poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("Event sink mutex poisoned")
            .iter()
            .map(BackfillEvent::kind)
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl EventSink for MemoryEventSink {
    fn on_event(&self, event: &BackfillEvent) {
        self.events.lock().expect("Event sink mutex poisoned").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = BackfillEvent::OwnerCompleted {
            run_id: "backfill_1".to_string(),
            owner_id: "U1".to_string(),
            batches: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "owner_completed");
        assert_eq!(value["kind"], event.kind());
        assert_eq!(value["batches"], 3);
    }

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemoryEventSink::new();
        let event = BackfillEvent::NoEligibleWork { run_id: "r".to_string(), selection_attempts: 0 };
        sink.on_event(&event);
        sink.on_event(&event);
        assert_eq!(sink.count("no_eligible_work"), 2);
        assert_eq!(sink.events().len(), 2);
    }
}
