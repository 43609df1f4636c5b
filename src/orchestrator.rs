use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::OwnerCache;
use crate::events::{BackfillEvent, EventSink, TracingEventSink};
use crate::models::{
    BackfillError, BackfillOptions, BatchProgress, BatchUpdateResult, MigrationRun, Result, RunPhase,
    RunSummary,
};
use crate::paginator::{BatchPaginator, Page};
use crate::scanner::{Candidate, EligibilityScanner};
use crate::selector::{CandidateSelector, SelectorSettings};
use crate::store::DocumentStore;
use crate::writer::{BatchContext, BatchWriter};

/// Drives one backfill run: scan, select a seller, then page through and
/// write that seller's products until exhausted.
///
/// Calls on one orchestrator must be serialized; every operation takes
/// `&mut self`. Independent orchestrators may run side by side against the
/// same store, but nothing stops two of them from binding the same seller.
pub struct BackfillOrchestrator {
    options: BackfillOptions,
    cache: Arc<OwnerCache>,
    events: Arc<dyn EventSink>,
    scanner: EligibilityScanner,
    selector: CandidateSelector,
    paginator: BatchPaginator,
    writer: BatchWriter,
    run: MigrationRun,
    known_candidates: Vec<Candidate>,
}

impl BackfillOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<OwnerCache>,
        options: BackfillOptions,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        options.validate()?;
        let products = options.collections.products.clone();

        let scanner = EligibilityScanner::new(store.clone(), cache.clone(), products.clone());
        let selector = CandidateSelector::new(
            store.clone(),
            cache.clone(),
            events.clone(),
            SelectorSettings {
                policy: options.policy,
                max_attempts: options.max_selection_attempts,
                sample_limit: options.sample_limit,
                products_collection: products.clone(),
            },
            options.seed,
        );
        let paginator = BatchPaginator::new(store.clone(), products.clone(), options.batch_size);
        let writer = BatchWriter::new(
            store,
            cache.clone(),
            events.clone(),
            products,
            options.migration_source.clone(),
        );
        let run = MigrationRun::new(options.batch_size, options.policy);

        Ok(Self {
            options,
            cache,
            events,
            scanner,
            selector,
            paginator,
            writer,
            run,
            known_candidates: Vec::new(),
        })
    }

    pub fn builder() -> BackfillOrchestratorBuilder {
        BackfillOrchestratorBuilder::new()
    }

    pub fn run_state(&self) -> &MigrationRun {
        &self.run
    }

    pub fn options(&self) -> &BackfillOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<OwnerCache> {
        &self.cache
    }

    /// Discard all run state and cached sellers. The next call must be `initialize`.
    pub fn reset(&mut self) {
        self.run = MigrationRun::new(self.options.batch_size, self.options.policy);
        self.known_candidates.clear();
        self.cache.clear();
    }

    /// Start a fresh run: scan for eligible work, select a seller and load its
    /// first page. Ends in `Bound` or `NoEligibleWork`.
    pub async fn initialize(&mut self) -> Result<&MigrationRun> {
        if self.run.phase != RunPhase::Uninitialized {
            self.reset();
        }
        self.run.phase = RunPhase::Selecting;

        let report = self.scanner.scan(self.options.sample_limit).await?;
        self.run.eligibility = Some(report.stats);
        self.emit(BackfillEvent::ScanCompleted {
            run_id: self.run.run_id.clone(),
            stats: report.stats,
        });

        if !report.has_eligible_work {
            self.finish_without_work();
            return Ok(&self.run);
        }
        self.known_candidates = report.candidates;

        if !self.bind_next_owner().await? {
            self.finish_without_work();
        }
        Ok(&self.run)
    }

    /// Write the loaded page. Valid once per page while a seller is bound.
    pub async fn process_current_batch(&mut self) -> Result<BatchUpdateResult> {
        self.ensure_bound()?;
        if self.run.current_batch_processed {
            return Err(BackfillError::BatchAlreadyProcessed {
                batch_index: self.run.current_batch_index,
            });
        }
        let (Some(owner_id), Some(company_id)) = (
            self.run.bound_owner_id().map(str::to_string),
            self.run.resolved_value.clone(),
        ) else {
            return Err(BackfillError::NoBoundOwner);
        };
        let range_label = self.run.current_range_label.clone().unwrap_or_default();

        let ctx = BatchContext {
            run_id: &self.run.run_id,
            owner_id: &owner_id,
            company_id: &company_id,
            batch_index: self.run.current_batch_index,
            range_label: &range_label,
        };
        let mut result = self.writer.apply_batch(&self.run.current_batch, ctx).await;
        result.skipped_count += self.run.current_batch_malformed;
        if !self.run.has_more_batches {
            result.total_batches = Some(self.run.current_batch_index);
        }

        self.run.totals.absorb(&result);
        self.run.batches_processed += 1;
        self.run.current_batch_processed = true;
        self.emit(BackfillEvent::BatchApplied {
            run_id: self.run.run_id.clone(),
            batch: result.clone(),
            totals: self.run.totals,
        });
        Ok(result)
    }

    /// Advance to the bound seller's next page. Returns false when the fetch
    /// came back empty, which only settles `has_more_batches` and does not
    /// count as a batch. Read failures propagate and leave the run as it was.
    pub async fn load_next_batch(&mut self) -> Result<bool> {
        self.ensure_bound()?;
        if !self.run.has_more_batches {
            return Err(BackfillError::NoMoreBatches);
        }
        let owner_id = self
            .run
            .bound_owner_id()
            .map(str::to_string)
            .ok_or(BackfillError::NoBoundOwner)?;

        let next_index = self.run.current_batch_index + 1;
        let page = self
            .paginator
            .next_page(&owner_id, next_index, self.run.pagination_cursor.as_deref())
            .await?;

        if page.records.is_empty() && page.malformed == 0 {
            self.run.has_more_batches = false;
            self.run.current_batch.clear();
            self.run.current_batch_processed = true;
            return Ok(false);
        }
        self.run.current_batch_index = next_index;
        self.apply_page(&owner_id, page);
        Ok(true)
    }

    /// Process every remaining page of the bound seller, then bind further
    /// sellers until `owner_limit` sellers are exhausted or none is left.
    /// The callback sees cumulative totals after each processed batch.
    pub async fn process_all_batches(
        &mut self,
        mut on_batch_complete: Option<&mut dyn FnMut(&BatchProgress)>,
    ) -> Result<RunSummary> {
        match self.run.phase {
            RunPhase::Uninitialized => return Err(BackfillError::NotInitialized),
            phase if phase.is_terminal() => return Ok(RunSummary::from_run(&self.run)),
            _ => {}
        }
        self.ensure_bound()?;

        loop {
            if !self.run.current_batch_processed {
                let batch = self.process_current_batch().await?;
                if let Some(callback) = on_batch_complete.as_mut() {
                    callback(&BatchProgress {
                        owner_id: batch.owner_id.clone(),
                        batch,
                        totals: self.run.totals,
                        has_more_batches: self.run.has_more_batches,
                        owners_completed: self.run.owners_completed.len(),
                    });
                }
            }

            if self.run.has_more_batches {
                self.load_next_batch().await?;
                continue;
            }

            self.finish_owner();
            if self.run.owners_completed.len() < self.options.owner_limit && self.bind_next_owner().await? {
                continue;
            }
            break;
        }

        self.run.mark_complete();
        self.emit(BackfillEvent::RunCompleted {
            run_id: self.run.run_id.clone(),
            phase: self.run.phase,
            totals: self.run.totals,
        });
        Ok(RunSummary::from_run(&self.run))
    }

    fn ensure_bound(&self) -> Result<()> {
        match self.run.phase {
            RunPhase::Bound => Ok(()),
            RunPhase::Uninitialized => Err(BackfillError::NotInitialized),
            RunPhase::Selecting => Err(BackfillError::NoBoundOwner),
            phase => Err(BackfillError::RunTerminated { phase }),
        }
    }

    /// Select the next seller (excluding exhausted ones) and load its first page.
    async fn bind_next_owner(&mut self) -> Result<bool> {
        self.run.unbind();
        self.run.phase = RunPhase::Selecting;

        let excluded: HashSet<String> = self.run.owners_completed.iter().cloned().collect();
        let selection = self
            .selector
            .select_candidate(&self.run.run_id, &self.known_candidates, &excluded)
            .await?;
        self.run.selection_attempts += selection.attempts;

        let Some(selected) = selection.candidate else {
            return Ok(false);
        };
        let owner_id = selected.owner.id.clone();
        self.known_candidates.retain(|c| c.owner_id != owner_id);
        self.run.selected_product = Some(selected.product);
        self.run.selected_owner = Some(selected.owner);
        self.run.resolved_value = Some(selected.company_id);
        self.run.is_priority_candidate = selected.priority;

        let page = self.paginator.next_page(&owner_id, 1, None).await?;
        self.run.current_batch_index = 1;
        self.apply_page(&owner_id, page);
        self.run.phase = RunPhase::Bound;
        Ok(true)
    }

    fn apply_page(&mut self, owner_id: &str, page: Page) {
        self.emit(BackfillEvent::BatchLoaded {
            run_id: self.run.run_id.clone(),
            owner_id: owner_id.to_string(),
            batch_index: self.run.current_batch_index,
            range_label: page.range_label.clone(),
            records: page.records.len(),
            has_more: page.has_more,
        });
        self.run.current_batch_processed = page.records.is_empty() && page.malformed == 0;
        self.run.current_batch = page.records;
        self.run.has_more_batches = page.has_more;
        self.run.pagination_cursor = page.next_cursor;
        self.run.current_range_label = Some(page.range_label);
        self.run.current_batch_malformed = page.malformed;
    }

    fn finish_owner(&mut self) {
        let Some(owner_id) = self.run.bound_owner_id().map(str::to_string) else {
            return;
        };
        if !self.run.owners_completed.contains(&owner_id) {
            self.run.owners_completed.push(owner_id.clone());
        }
        self.emit(BackfillEvent::OwnerCompleted {
            run_id: self.run.run_id.clone(),
            owner_id,
            batches: self.run.current_batch_index,
        });
    }

    fn finish_without_work(&mut self) {
        self.run.unbind();
        self.run.mark_no_eligible_work();
        self.emit(BackfillEvent::NoEligibleWork {
            run_id: self.run.run_id.clone(),
            selection_attempts: self.run.selection_attempts,
        });
        self.emit(BackfillEvent::RunCompleted {
            run_id: self.run.run_id.clone(),
            phase: self.run.phase,
            totals: self.run.totals,
        });
    }

    fn emit(&self, event: BackfillEvent) {
        self.events.on_event(&event);
    }
}

/// Builder for an orchestrator; only the store is required.
pub struct BackfillOrchestratorBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    cache: Option<Arc<OwnerCache>>,
    events: Option<Arc<dyn EventSink>>,
    options: BackfillOptions,
}

impl BackfillOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            cache: None,
            events: None,
            options: BackfillOptions::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a cache across orchestrators. Defaults to a fresh one over the store.
    pub fn cache(mut self, cache: Arc<OwnerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(mut self, options: BackfillOptions) -> Self {
        self.options = options;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.options.batch_size = batch_size;
        self
    }

    pub fn policy(mut self, policy: crate::selector::SelectionPolicy) -> Self {
        self.options.policy = policy;
        self
    }

    pub fn owner_limit(mut self, owner_limit: usize) -> Self {
        self.options.owner_limit = owner_limit;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.options.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<BackfillOrchestrator> {
        let store = self
            .store
            .ok_or_else(|| BackfillError::Configuration("Document store is required".to_string()))?;
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(OwnerCache::new(
                store.clone(),
                self.options.collections.owners.clone(),
                self.options.cache_ttl,
            ))
        });
        let events = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));
        BackfillOrchestrator::new(store, cache, self.options, events)
    }
}

impl Default for BackfillOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::selector::SelectionPolicy;

    #[test]
    fn test_builder_requires_store() {
        let err = BackfillOrchestrator::builder().build().err().unwrap();
        assert!(matches!(err, BackfillError::Configuration(_)));
    }

    #[test]
    fn test_builder_applies_overrides() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let orchestrator = BackfillOrchestrator::builder()
            .store(store)
            .batch_size(10)
            .policy(SelectionPolicy::SortedByPartition)
            .owner_limit(3)
            .seed(1)
            .events(Arc::new(NullEventSink))
            .build()
            .unwrap();
        assert_eq!(orchestrator.options().batch_size, 10);
        assert_eq!(orchestrator.options().owner_limit, 3);
        assert_eq!(orchestrator.run_state().policy, SelectionPolicy::SortedByPartition);
        assert_eq!(orchestrator.run_state().phase, RunPhase::Uninitialized);
    }

    #[test]
    fn test_builder_rejects_invalid_options() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let result = BackfillOrchestrator::builder().store(store).batch_size(0).build();
        assert!(matches!(result, Err(BackfillError::Validation(_))));
    }
}
