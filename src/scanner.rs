use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::OwnerCache;
use crate::models::product::fields;
use crate::models::{ProductRecord, Result};
use crate::store::{DocumentStore, OrderBy, Query};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityStats {
    pub total_checked: usize,
    pub migrated: usize,
    /// Sampled products without a company id: `orphaned + owner_missing_value + eligible`.
    pub missing_foreign_key: usize,
    pub orphaned: usize,
    pub owner_missing_value: usize,
    pub eligible: usize,
    pub malformed: usize,
}

/// An eligible product together with the seller that can supply its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub product: ProductRecord,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub has_eligible_work: bool,
    pub stats: EligibilityStats,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Migrated,
    Orphaned,
    OwnerMissingValue,
    Eligible,
}

/// Classifies a bounded, deterministic sample of products. Read-only.
pub struct EligibilityScanner {
    store: Arc<dyn DocumentStore>,
    cache: Arc<OwnerCache>,
    products_collection: String,
}

impl EligibilityScanner {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<OwnerCache>, products_collection: impl Into<String>) -> Self {
        Self {
            store,
            cache,
            products_collection: products_collection.into(),
        }
    }

    pub async fn scan(&self, sample_limit: usize) -> Result<ScanReport> {
        let query = Query::new()
            .order_by(OrderBy::asc(fields::OWNER_ID))
            .limit(sample_limit);
        let docs = self.store.query(&self.products_collection, &query).await?;

        let mut stats = EligibilityStats::default();
        let mut candidates = Vec::new();
        for doc in docs {
            stats.total_checked += 1;
            let product = match ProductRecord::from_document(doc) {
                Ok(product) => product,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable product during scan");
                    stats.malformed += 1;
                    continue;
                }
            };

            match self.classify(&product).await? {
                Classification::Migrated => stats.migrated += 1,
                Classification::Orphaned => stats.orphaned += 1,
                Classification::OwnerMissingValue => stats.owner_missing_value += 1,
                Classification::Eligible => {
                    stats.eligible += 1;
                    let owner_id = product.owner().unwrap_or_default().to_string();
                    candidates.push(Candidate { product, owner_id });
                }
            }
        }
        stats.missing_foreign_key = stats.orphaned + stats.owner_missing_value + stats.eligible;

        Ok(ScanReport {
            has_eligible_work: stats.eligible > 0,
            stats,
            candidates,
        })
    }

    async fn classify(&self, product: &ProductRecord) -> Result<Classification> {
        if product.is_migrated() {
            return Ok(Classification::Migrated);
        }
        let Some(owner_id) = product.owner() else {
            return Ok(Classification::Orphaned);
        };
        // A seller that no longer exists cannot supply a value either.
        let has_company = self
            .cache
            .get_owner(owner_id)
            .await?
            .map(|o| o.has_company())
            .unwrap_or(false);
        Ok(if has_company {
            Classification::Eligible
        } else {
            Classification::OwnerMissingValue
        })
    }
}
