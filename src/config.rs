use serde::{Deserialize, Serialize};

use crate::models::{BackfillError, BackfillOptions, CollectionNames, Result};
use crate::selector::SelectionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mongodb_uri: String,
    pub mongodb_retry_writes: bool,
    pub mongodb_transactions: bool,
    pub database_name: String,
    pub products_collection: String,
    pub owners_collection: String,
    pub batch_size: usize,
    pub sample_limit: usize,
    pub max_selection_attempts: u32,
    pub policy: String,
    pub owner_limit: usize,
    pub cache_ttl_secs: u64,
    pub migration_source: String,
    pub seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mongodb_uri = get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
        let mongodb_retry_writes: bool = get("MONGODB_RETRY_WRITES").and_then(|s| s.parse().ok()).unwrap_or(false);
        let mongodb_transactions: bool = get("MONGODB_TRANSACTIONS").and_then(|s| s.parse().ok()).unwrap_or(true);
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| "marketplace".to_string());
        let products_collection = get("PRODUCTS_COLLECTION").unwrap_or_else(|| "products".to_string());
        let owners_collection = get("OWNERS_COLLECTION").unwrap_or_else(|| "users".to_string());
        let batch_size: usize = get("BACKFILL_BATCH_SIZE").and_then(|s| s.parse().ok()).unwrap_or(20);
        let sample_limit: usize = get("BACKFILL_SAMPLE_LIMIT").and_then(|s| s.parse().ok()).unwrap_or(200);
        let max_selection_attempts: u32 = get("BACKFILL_MAX_SELECTION_ATTEMPTS").and_then(|s| s.parse().ok()).unwrap_or(25);
        let policy = get("BACKFILL_POLICY").unwrap_or_else(|| "priority-first".to_string());
        let owner_limit: usize = get("BACKFILL_OWNER_LIMIT").and_then(|s| s.parse().ok()).unwrap_or(1);
        let cache_ttl_secs: u64 = get("BACKFILL_CACHE_TTL_SECS").and_then(|s| s.parse().ok()).unwrap_or(300);
        let migration_source = get("BACKFILL_SOURCE").unwrap_or_else(|| "seller-company-backfill".to_string());
        let seed: Option<u64> = get("BACKFILL_SEED").and_then(|s| s.parse().ok());

        Self {
            mongodb_uri,
            mongodb_retry_writes,
            mongodb_transactions,
            database_name,
            products_collection,
            owners_collection,
            batch_size,
            sample_limit,
            max_selection_attempts,
            policy,
            owner_limit,
            cache_ttl_secs,
            migration_source,
            seed,
        }
    }

    pub fn backfill_options(&self) -> Result<BackfillOptions> {
        let policy: SelectionPolicy = self
            .policy
            .parse()
            .map_err(BackfillError::Configuration)?;
        let options = BackfillOptions {
            batch_size: self.batch_size,
            sample_limit: self.sample_limit,
            max_selection_attempts: self.max_selection_attempts,
            policy,
            owner_limit: self.owner_limit,
            seed: self.seed,
            migration_source: self.migration_source.clone(),
            cache_ttl: std::time::Duration::from_secs(self.cache_ttl_secs),
            collections: CollectionNames {
                products: self.products_collection.clone(),
                owners: self.owners_collection.clone(),
            },
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.database_name, "marketplace");
        assert_eq!(cfg.products_collection, "products");
        assert_eq!(cfg.owners_collection, "users");
        assert!(cfg.mongodb_transactions);
        assert!(!cfg.mongodb_retry_writes);
        assert_eq!(cfg.seed, None);

        let options = cfg.backfill_options().unwrap();
        assert_eq!(options.batch_size, 20);
        assert_eq!(options.policy, SelectionPolicy::PriorityFirst);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = [
            ("BACKFILL_BATCH_SIZE", "10"),
            ("BACKFILL_POLICY", "sorted-by-partition"),
            ("BACKFILL_SEED", "42"),
            ("BACKFILL_OWNER_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        let options = cfg.backfill_options().unwrap();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.policy, SelectionPolicy::SortedByPartition);
        assert_eq!(options.seed, Some(42));
        assert_eq!(options.owner_limit, 1);
    }

    #[test]
    fn test_unknown_policy_is_configuration_error() {
        let cfg = Config::from_lookup(|k| (k == "BACKFILL_POLICY").then(|| "fastest".to_string()));
        let err = cfg.backfill_options().unwrap_err();
        assert!(matches!(err, BackfillError::Configuration(_)));
    }
}
