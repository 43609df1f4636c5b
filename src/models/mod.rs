pub mod product;
pub mod owner;
pub mod run;

pub use product::*;
pub use owner::*;
pub use run::*;

use crate::store::MAX_ATOMIC_WRITE_OPS;

/// Returns true when an optional string field carries a usable value.
///
/// Absent, `null` and empty strings are all treated as "no value", matching the
/// `company_id in [null, ""]` filter the store adapters use.
pub fn has_value(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("Store error: {0}")]
    Store(String),

    /// A non-transactional write stopped partway; `applied` ids are committed.
    #[error("Write failed after {} ops applied: {message}", .applied.len())]
    PartialWrite {
        applied: Vec<String>,
        unmatched: Vec<String>,
        message: String,
    },

    #[error("Migration run has not been initialized")]
    NotInitialized,

    #[error("No seller is bound to the migration run")]
    NoBoundOwner,

    #[error("Migration run already terminated in phase {phase:?}")]
    RunTerminated { phase: RunPhase },

    #[error("No more batches to load for the bound seller")]
    NoMoreBatches,

    #[error("Batch {batch_index} has already been processed")]
    BatchAlreadyProcessed { batch_index: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BackfillError {
    /// Caller bugs: the operation was invoked in a state that does not allow it.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BackfillError::NotInitialized
                | BackfillError::NoBoundOwner
                | BackfillError::RunTerminated { .. }
                | BackfillError::NoMoreBatches
                | BackfillError::BatchAlreadyProcessed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackfillError>;

/// Run-level tuning shared by every component of one orchestrator.
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub sample_limit: usize,
    pub max_selection_attempts: u32,
    pub policy: crate::selector::SelectionPolicy,
    /// Number of sellers one run may exhaust before completing.
    pub owner_limit: usize,
    pub seed: Option<u64>,
    /// Written to `migration_source` on every updated product.
    pub migration_source: String,
    pub cache_ttl: std::time::Duration,
    pub collections: CollectionNames,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 20,
            sample_limit: 200,
            max_selection_attempts: 25,
            policy: crate::selector::SelectionPolicy::PriorityFirst,
            owner_limit: 1,
            seed: None,
            migration_source: "seller-company-backfill".to_string(),
            cache_ttl: std::time::Duration::from_secs(300), // 5 minutes
            collections: CollectionNames::default(),
        }
    }
}

impl BackfillOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_ATOMIC_WRITE_OPS {
            return Err(BackfillError::Validation(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_ATOMIC_WRITE_OPS, self.batch_size
            )));
        }
        if self.sample_limit == 0 {
            return Err(BackfillError::Validation("sample_limit must be at least 1".to_string()));
        }
        if self.max_selection_attempts == 0 {
            return Err(BackfillError::Validation("max_selection_attempts must be at least 1".to_string()));
        }
        if self.owner_limit == 0 {
            return Err(BackfillError::Validation("owner_limit must be at least 1".to_string()));
        }
        if self.collections.products.is_empty() || self.collections.owners.is_empty() {
            return Err(BackfillError::Validation("collection names must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub products: String,
    pub owners: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            products: "products".to_string(),
            owners: "users".to_string(),
        }
    }
}
