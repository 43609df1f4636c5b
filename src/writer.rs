use std::sync::Arc;

use bson::{doc, DateTime as BsonDateTime, Document};

use crate::cache::OwnerCache;
use crate::events::{BackfillEvent, EventSink};
use crate::models::product::fields;
use crate::models::{BackfillError, BatchUpdateResult, ProductRecord, SkipReason};
use crate::store::{DocumentStore, Filter, WriteOp};

/// Identifies the page being written, for provenance stamps and reporting.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    pub run_id: &'a str,
    pub owner_id: &'a str,
    pub company_id: &'a str,
    pub batch_index: usize,
    pub range_label: &'a str,
}

/// Applies a seller's company id to one page of products in a single atomic write.
pub struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    cache: Arc<OwnerCache>,
    events: Arc<dyn EventSink>,
    products_collection: String,
    migration_source: String,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<OwnerCache>,
        events: Arc<dyn EventSink>,
        products_collection: impl Into<String>,
        migration_source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            products_collection: products_collection.into(),
            migration_source: migration_source.into(),
        }
    }

    /// Never fails: record-level faults and write rejections are folded into
    /// the returned counts.
    pub async fn apply_batch(&self, records: &[ProductRecord], ctx: BatchContext<'_>) -> BatchUpdateResult {
        let mut result = BatchUpdateResult::new(ctx.batch_index, ctx.owner_id);
        result.range_label = ctx.range_label.to_string();
        if records.is_empty() {
            return result;
        }

        // The seller must still exist and still carry the value bound at selection.
        match self.cache.get_owner(ctx.owner_id).await {
            Ok(Some(owner)) if owner.company() == Some(ctx.company_id) => {}
            Ok(owner) => {
                let reason = if owner.is_some() {
                    SkipReason::OwnerValueChanged
                } else {
                    SkipReason::OwnerMissing
                };
                for record in records {
                    self.skip(&mut result, ctx, &record.id, reason);
                }
                return result;
            }
            Err(e) => {
                self.fail(&mut result, ctx, records.len(), e.to_string());
                return result;
            }
        }

        let now = BsonDateTime::now();
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            if record.is_migrated() {
                self.skip(&mut result, ctx, &record.id, SkipReason::AlreadyMigrated);
            } else if record.owner() != Some(ctx.owner_id) {
                self.skip(&mut result, ctx, &record.id, SkipReason::OwnerMismatch);
            } else {
                ops.push(WriteOp {
                    collection: self.products_collection.clone(),
                    id: record.id.clone(),
                    guard: vec![
                        Filter::eq(fields::OWNER_ID, ctx.owner_id),
                        Filter::empty(fields::COMPANY_ID),
                    ],
                    set: self.patch(ctx, now),
                });
            }
        }
        if ops.is_empty() {
            return result;
        }

        let attempted = ops.len();
        match self.store.atomic_write(ops).await {
            Ok(outcome) => {
                result.updated_count += outcome.applied.len();
                for id in &outcome.unmatched {
                    self.skip(&mut result, ctx, id, SkipReason::NotFound);
                }
                self.cache.invalidate(ctx.owner_id);
            }
            Err(BackfillError::PartialWrite { applied, unmatched, message }) => {
                result.updated_count += applied.len();
                for id in &unmatched {
                    self.skip(&mut result, ctx, id, SkipReason::NotFound);
                }
                self.cache.invalidate(ctx.owner_id);
                let failed = attempted.saturating_sub(applied.len() + unmatched.len());
                self.fail(&mut result, ctx, failed, message);
            }
            Err(e) => self.fail(&mut result, ctx, attempted, e.to_string()),
        }
        result
    }

    fn patch(&self, ctx: BatchContext<'_>, now: BsonDateTime) -> Document {
        doc! {
            fields::COMPANY_ID: ctx.company_id,
            fields::UPDATED_AT: now,
            fields::MIGRATION_SOURCE: self.migration_source.as_str(),
            fields::MIGRATION_RUN_ID: ctx.run_id,
            fields::MIGRATION_BATCH_INDEX: ctx.batch_index as i64,
            fields::MIGRATION_TIMESTAMP: now,
            fields::MIGRATION_OWNER_ID: ctx.owner_id,
        }
    }

    fn skip(&self, result: &mut BatchUpdateResult, ctx: BatchContext<'_>, id: &str, reason: SkipReason) {
        result.skip(id, reason);
        self.events.on_event(&BackfillEvent::RecordSkipped {
            run_id: ctx.run_id.to_string(),
            product_id: id.to_string(),
            owner_id: ctx.owner_id.to_string(),
            reason,
        });
    }

    fn fail(&self, result: &mut BatchUpdateResult, ctx: BatchContext<'_>, attempted: usize, error: String) {
        result.error_count += attempted;
        self.events.on_event(&BackfillEvent::WriteFailed {
            run_id: ctx.run_id.to_string(),
            owner_id: ctx.owner_id.to_string(),
            batch_index: ctx.batch_index,
            attempted,
            error,
        });
    }
}
