use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{OwnerRecord, ProductRecord};
use crate::scanner::EligibilityStats;
use crate::selector::SelectionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Uninitialized,
    Selecting,
    /// A seller is bound and its pages are being walked.
    Bound,
    Complete,
    NoEligibleWork,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Complete | RunPhase::NoEligibleWork)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyMigrated,
    OwnerMismatch,
    /// Deleted, or given a company id by someone else, since the page was read.
    NotFound,
    OwnerMissing,
    OwnerValueChanged,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub id: String,
    pub reason: SkipReason,
}

/// Outcome of applying one page through a single atomic write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchUpdateResult {
    pub batch_index: usize,
    pub total_batches: Option<usize>,
    pub owner_id: String,
    pub range_label: String,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub skipped: Vec<SkippedRecord>,
}

impl BatchUpdateResult {
    pub fn new(batch_index: usize, owner_id: &str) -> Self {
        Self {
            batch_index,
            owner_id: owner_id.to_string(),
            ..Default::default()
        }
    }

    pub fn skip(&mut self, id: &str, reason: SkipReason) {
        self.skipped_count += 1;
        self.skipped.push(SkippedRecord { id: id.to_string(), reason });
    }

    pub fn processed(&self) -> usize {
        self.updated_count + self.skipped_count + self.error_count
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub scanned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RunTotals {
    pub fn absorb(&mut self, batch: &BatchUpdateResult) {
        self.scanned += batch.processed();
        self.updated += batch.updated_count;
        self.skipped += batch.skipped_count;
        self.errors += batch.error_count;
    }
}

/// Mutable state of one end-to-end backfill session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phase: RunPhase,
    pub policy: SelectionPolicy,
    pub selected_product: Option<ProductRecord>,
    pub selected_owner: Option<OwnerRecord>,
    pub resolved_value: Option<String>,
    /// 1-based index of the loaded page for the bound seller.
    pub current_batch_index: usize,
    pub batch_size: usize,
    pub has_more_batches: bool,
    pub pagination_cursor: Option<String>,
    pub current_batch: Vec<ProductRecord>,
    pub current_range_label: Option<String>,
    pub current_batch_processed: bool,
    /// Undecodable documents seen on the loaded page.
    pub current_batch_malformed: usize,
    pub totals: RunTotals,
    pub batches_processed: usize,
    pub selection_attempts: u32,
    pub is_priority_candidate: bool,
    pub owners_completed: Vec<String>,
    pub eligibility: Option<EligibilityStats>,
    pub no_eligible_work: bool,
    pub is_complete: bool,
}

impl MigrationRun {
    pub fn new(batch_size: usize, policy: SelectionPolicy) -> Self {
        Self {
            run_id: format!("backfill_{}", Uuid::new_v4().simple()),
            started_at: Utc::now(),
            completed_at: None,
            phase: RunPhase::Uninitialized,
            policy,
            selected_product: None,
            selected_owner: None,
            resolved_value: None,
            current_batch_index: 0,
            batch_size,
            has_more_batches: false,
            pagination_cursor: None,
            current_batch: Vec::new(),
            current_range_label: None,
            current_batch_processed: false,
            current_batch_malformed: 0,
            totals: RunTotals::default(),
            batches_processed: 0,
            selection_attempts: 0,
            is_priority_candidate: false,
            owners_completed: Vec::new(),
            eligibility: None,
            no_eligible_work: false,
            is_complete: false,
        }
    }

    pub fn bound_owner_id(&self) -> Option<&str> {
        self.selected_owner.as_ref().map(|o| o.id.as_str())
    }

    pub fn mark_no_eligible_work(&mut self) {
        self.phase = RunPhase::NoEligibleWork;
        self.no_eligible_work = true;
        self.has_more_batches = false;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_complete(&mut self) {
        self.phase = RunPhase::Complete;
        self.is_complete = true;
        self.has_more_batches = false;
        self.completed_at = Some(Utc::now());
    }

    /// Drop the bound seller and its page state ahead of the next selection.
    pub fn unbind(&mut self) {
        self.selected_product = None;
        self.selected_owner = None;
        self.resolved_value = None;
        self.current_batch_index = 0;
        self.has_more_batches = false;
        self.pagination_cursor = None;
        self.current_batch.clear();
        self.current_range_label = None;
        self.current_batch_processed = false;
        self.current_batch_malformed = 0;
        self.is_priority_candidate = false;
    }
}

/// Passed to the per-batch callback of `process_all_batches`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch: BatchUpdateResult,
    pub totals: RunTotals,
    pub owner_id: String,
    pub has_more_batches: bool,
    pub owners_completed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub phase: RunPhase,
    pub totals: RunTotals,
    pub batches_processed: usize,
    pub owners_completed: Vec<String>,
    pub selection_attempts: u32,
    pub duration_ms: i64,
}

impl RunSummary {
    pub fn from_run(run: &MigrationRun) -> Self {
        let finished = run.completed_at.unwrap_or_else(Utc::now);
        Self {
            run_id: run.run_id.clone(),
            phase: run.phase,
            totals: run.totals,
            batches_processed: run.batches_processed,
            owners_completed: run.owners_completed.clone(),
            selection_attempts: run.selection_attempts,
            duration_ms: (finished - run.started_at).num_milliseconds(),
        }
    }
}
