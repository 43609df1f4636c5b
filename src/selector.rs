use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bson::Bson;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cache::OwnerCache;
use crate::events::{BackfillEvent, EventSink, RejectReason};
use crate::models::product::fields;
use crate::models::{OwnerRecord, ProductRecord, Result};
use crate::scanner::Candidate;
use crate::store::{DocumentStore, Filter, OrderBy, Query};

/// How a seed product is chosen for the next seller to backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Uniform draws from a wide sample of products missing a company id.
    Random,
    /// Uniform draws from the scan's eligible candidates, falling back to `Random`'s pool.
    PriorityFirst,
    /// Known candidates ordered by (seller, product), then the fallback pool in the same order.
    SortedByPartition,
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionPolicy::Random => "random",
            SelectionPolicy::PriorityFirst => "priority-first",
            SelectionPolicy::SortedByPartition => "sorted-by-partition",
        };
        f.write_str(name)
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(SelectionPolicy::Random),
            "priority-first" | "priority" => Ok(SelectionPolicy::PriorityFirst),
            "sorted-by-partition" | "sorted" => Ok(SelectionPolicy::SortedByPartition),
            other => Err(format!(
                "unknown selection policy '{}' (expected random, priority-first or sorted-by-partition)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedCandidate {
    pub product: ProductRecord,
    pub owner: OwnerRecord,
    pub company_id: String,
    /// Drawn from the scan's eligible set rather than the fallback sample.
    pub priority: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidate: Option<SelectedCandidate>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub policy: SelectionPolicy,
    pub max_attempts: u32,
    pub sample_limit: usize,
    pub products_collection: String,
}

pub struct CandidateSelector {
    store: Arc<dyn DocumentStore>,
    cache: Arc<OwnerCache>,
    events: Arc<dyn EventSink>,
    settings: SelectorSettings,
    rng: StdRng,
}

impl CandidateSelector {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<OwnerCache>,
        events: Arc<dyn EventSink>,
        settings: SelectorSettings,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { store, cache, events, settings, rng }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.settings.policy
    }

    /// Draw until a product whose seller can supply a company id is found, or
    /// the attempt cap is hit. Running out of attempts or candidates is not an
    /// error; it yields `candidate: None`.
    pub async fn select_candidate(
        &mut self,
        run_id: &str,
        known: &[Candidate],
        excluded_owners: &HashSet<String>,
    ) -> Result<Selection> {
        let policy = self.settings.policy;
        let mut priority_pool: Vec<ProductRecord> = match policy {
            SelectionPolicy::Random => Vec::new(),
            SelectionPolicy::PriorityFirst | SelectionPolicy::SortedByPartition => known
                .iter()
                .filter(|c| !excluded_owners.contains(&c.owner_id))
                .map(|c| c.product.clone())
                .collect(),
        };
        if policy == SelectionPolicy::SortedByPartition {
            priority_pool.sort_by(|a, b| (a.owner(), &a.id).cmp(&(b.owner(), &b.id)));
            // Consumed from the front via pop().
            priority_pool.reverse();
        }
        let mut fallback_pool: Option<Vec<ProductRecord>> = None;

        let mut attempts = 0;
        while attempts < self.settings.max_attempts {
            let (drawn, priority) = match self.draw(&mut priority_pool) {
                Some(product) => (product, true),
                None => {
                    if fallback_pool.is_none() {
                        fallback_pool = Some(self.load_fallback_pool(known, excluded_owners).await?);
                    }
                    let Some(pool) = fallback_pool.as_mut() else { break };
                    match self.draw(pool) {
                        Some(product) => (product, false),
                        None => break,
                    }
                }
            };
            attempts += 1;

            match self.validate(&drawn, excluded_owners).await? {
                Ok(selected) => {
                    let selected = SelectedCandidate { priority, ..selected };
                    self.events.on_event(&BackfillEvent::CandidateSelected {
                        run_id: run_id.to_string(),
                        attempt: attempts,
                        product_id: selected.product.id.clone(),
                        owner_id: selected.owner.id.clone(),
                        company_id: selected.company_id.clone(),
                        priority,
                    });
                    return Ok(Selection { candidate: Some(selected), attempts });
                }
                Err(reason) => {
                    self.events.on_event(&BackfillEvent::CandidateRejected {
                        run_id: run_id.to_string(),
                        attempt: attempts,
                        product_id: drawn.id.clone(),
                        owner_id: drawn.owner().map(str::to_string),
                        reason,
                    });
                }
            }
        }

        Ok(Selection { candidate: None, attempts })
    }

    /// Remove one product from the pool according to the policy. Dead ends are
    /// not put back, so repeated draws shrink the pool.
    fn draw(&mut self, pool: &mut Vec<ProductRecord>) -> Option<ProductRecord> {
        if pool.is_empty() {
            return None;
        }
        match self.settings.policy {
            SelectionPolicy::SortedByPartition => pool.pop(),
            SelectionPolicy::Random | SelectionPolicy::PriorityFirst => {
                let idx = self.rng.gen_range(0..pool.len());
                Some(pool.swap_remove(idx))
            }
        }
    }

    /// Products missing a company id whose seller id is set. `Random` also
    /// draws from the scan's eligible candidates that the sample missed.
    async fn load_fallback_pool(
        &self,
        known: &[Candidate],
        excluded_owners: &HashSet<String>,
    ) -> Result<Vec<ProductRecord>> {
        let query = Query::new()
            .filter(Filter::empty(fields::COMPANY_ID))
            .filter(Filter::ne(fields::OWNER_ID, Bson::Null))
            .filter(Filter::ne(fields::OWNER_ID, ""))
            .order_by(OrderBy::asc(fields::OWNER_ID))
            .limit(self.settings.sample_limit);
        let docs = self.store.query(&self.settings.products_collection, &query).await?;

        let mut pool: Vec<ProductRecord> = docs
            .into_iter()
            .filter_map(|doc| match ProductRecord::from_document(doc) {
                Ok(product) => Some(product),
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping undecodable product from fallback sample");
                    None
                }
            })
            .filter(|p| p.owner().map(|o| !excluded_owners.contains(o)).unwrap_or(true))
            .collect();
        if self.settings.policy == SelectionPolicy::Random {
            let sampled: HashSet<String> = pool.iter().map(|p| p.id.clone()).collect();
            pool.extend(
                known
                    .iter()
                    .filter(|c| !excluded_owners.contains(&c.owner_id) && !sampled.contains(&c.product.id))
                    .map(|c| c.product.clone()),
            );
        }
        if self.settings.policy == SelectionPolicy::SortedByPartition {
            pool.reverse();
        }
        Ok(pool)
    }

    /// Re-read the product and resolve its seller. The inner `Err` is a
    /// rejected draw, the outer one a store failure.
    async fn validate(
        &self,
        drawn: &ProductRecord,
        excluded_owners: &HashSet<String>,
    ) -> Result<std::result::Result<SelectedCandidate, RejectReason>> {
        let doc = self.store.get_by_id(&self.settings.products_collection, &drawn.id).await?;
        let Some(doc) = doc else {
            return Ok(Err(RejectReason::ProductNotFound));
        };
        let Ok(product) = ProductRecord::from_document(doc) else {
            return Ok(Err(RejectReason::Malformed));
        };
        if product.is_migrated() {
            return Ok(Err(RejectReason::AlreadyMigrated));
        }
        let Some(owner_id) = product.owner() else {
            return Ok(Err(RejectReason::Orphaned));
        };
        if excluded_owners.contains(owner_id) {
            return Ok(Err(RejectReason::OwnerExcluded));
        }
        let Some(owner) = self.cache.get_owner(owner_id).await? else {
            return Ok(Err(RejectReason::OwnerNotFound));
        };
        let Some(company_id) = owner.company().map(str::to_string) else {
            return Ok(Err(RejectReason::OwnerMissingValue));
        };

        Ok(Ok(SelectedCandidate {
            product,
            owner,
            company_id,
            priority: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::store::MemoryStore;
    use bson::doc;
    use std::time::Duration;

    fn selector(store: Arc<MemoryStore>, policy: SelectionPolicy, max_attempts: u32) -> (CandidateSelector, Arc<MemoryEventSink>) {
        let cache = Arc::new(OwnerCache::new(store.clone(), "users", Duration::from_secs(300)));
        let events = Arc::new(MemoryEventSink::new());
        let settings = SelectorSettings {
            policy,
            max_attempts,
            sample_limit: 100,
            products_collection: "products".to_string(),
        };
        (CandidateSelector::new(store, cache, events.clone(), settings, Some(7)), events)
    }

    fn candidate(id: &str, owner: &str) -> Candidate {
        Candidate {
            product: ProductRecord::from_document(doc! { "_id": id, "seller_id": owner }).unwrap(),
            owner_id: owner.to_string(),
        }
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [SelectionPolicy::Random, SelectionPolicy::PriorityFirst, SelectionPolicy::SortedByPartition] {
            assert_eq!(policy.to_string().parse::<SelectionPolicy>().unwrap(), policy);
        }
        assert_eq!("Priority".parse::<SelectionPolicy>().unwrap(), SelectionPolicy::PriorityFirst);
        assert!("greedy".parse::<SelectionPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_owner_without_value_is_never_selected() {
        let store = Arc::new(MemoryStore::new());
        store.insert("users", doc! { "_id": "U2", "company_id": "" }).unwrap();
        store.insert("products", doc! { "_id": "P3", "seller_id": "U2" }).unwrap();

        for policy in [SelectionPolicy::Random, SelectionPolicy::PriorityFirst, SelectionPolicy::SortedByPartition] {
            let (mut selector, events) = selector(store.clone(), policy, 20);
            let selection = selector
                .select_candidate("run", &[candidate("P3", "U2")], &HashSet::new())
                .await
                .unwrap();
            assert!(selection.candidate.is_none());
            assert!(selection.attempts <= 20);
            assert_eq!(events.count("candidate_selected"), 0);
            assert!(events.count("candidate_rejected") >= 1);
        }
    }

    #[tokio::test]
    async fn test_priority_first_prefers_known_candidates() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_many(
                "users",
                vec![
                    doc! { "_id": "U1", "company_id": "C1" },
                    doc! { "_id": "U2", "company_id": "C2" },
                ],
            )
            .unwrap();
        store
            .insert_many(
                "products",
                vec![
                    doc! { "_id": "P1", "seller_id": "U1" },
                    doc! { "_id": "P2", "seller_id": "U2" },
                ],
            )
            .unwrap();

        let (mut selector, _) = selector(store, SelectionPolicy::PriorityFirst, 5);
        let selection = selector
            .select_candidate("run", &[candidate("P2", "U2")], &HashSet::new())
            .await
            .unwrap();
        let selected = selection.candidate.unwrap();
        assert_eq!(selected.product.id, "P2");
        assert_eq!(selected.company_id, "C2");
        assert!(selected.priority);
        assert_eq!(selection.attempts, 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_sample_when_known_set_is_dead() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_many(
                "users",
                vec![
                    doc! { "_id": "U1", "company_id": "C1" },
                    doc! { "_id": "U2" },
                ],
            )
            .unwrap();
        store
            .insert_many(
                "products",
                vec![
                    doc! { "_id": "P1", "seller_id": "U1" },
                    doc! { "_id": "P2", "seller_id": "U2" },
                ],
            )
            .unwrap();

        let (mut selector, events) = selector(store, SelectionPolicy::SortedByPartition, 10);
        let selection = selector
            .select_candidate("run", &[candidate("P2", "U2")], &HashSet::new())
            .await
            .unwrap();
        let selected = selection.candidate.unwrap();
        assert_eq!(selected.owner.id, "U1");
        assert!(!selected.priority);
        // P2 from the known set, then the fallback sample ordered by seller: P1.
        assert_eq!(selection.attempts, 2);
        assert_eq!(events.kinds(), vec!["candidate_rejected", "candidate_selected"]);
    }

    #[tokio::test]
    async fn test_excluded_owners_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.insert("users", doc! { "_id": "U1", "company_id": "C1" }).unwrap();
        store.insert("products", doc! { "_id": "P1", "seller_id": "U1" }).unwrap();

        let excluded: HashSet<String> = ["U1".to_string()].into_iter().collect();
        let (mut selector, _) = selector(store, SelectionPolicy::Random, 10);
        let selection = selector
            .select_candidate("run", &[candidate("P1", "U1")], &excluded)
            .await
            .unwrap();
        assert!(selection.candidate.is_none());
        assert_eq!(selection.attempts, 0);
    }

    #[tokio::test]
    async fn test_orphans_do_not_crowd_out_eligible_product() {
        let store = Arc::new(MemoryStore::new());
        store.insert("users", doc! { "_id": "U1", "company_id": "C1" }).unwrap();
        store.insert("products", doc! { "_id": "P-eligible", "seller_id": "U1" }).unwrap();
        for i in 0..60 {
            store
                .insert("products", doc! { "_id": format!("P{:02}", i), "seller_id": "" })
                .unwrap();
        }
        store.insert("products", doc! { "_id": "P-null", "seller_id": Bson::Null }).unwrap();

        for seed in 0..20 {
            let cache = Arc::new(OwnerCache::new(store.clone(), "users", Duration::from_secs(300)));
            let settings = SelectorSettings {
                policy: SelectionPolicy::Random,
                max_attempts: 25,
                sample_limit: 200,
                products_collection: "products".to_string(),
            };
            let mut selector =
                CandidateSelector::new(store.clone(), cache, Arc::new(MemoryEventSink::new()), settings, Some(seed));
            let selection = selector.select_candidate("run", &[], &HashSet::new()).await.unwrap();
            let selected = selection.candidate.expect("eligible product should be selected");
            assert_eq!(selected.owner.id, "U1", "seed {}", seed);
            assert_eq!(selection.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_random_draws_known_candidates_outside_the_sample() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_many(
                "users",
                vec![doc! { "_id": "U1", "company_id": "" }, doc! { "_id": "U9", "company_id": "C9" }],
            )
            .unwrap();
        for i in 0..5 {
            store
                .insert("products", doc! { "_id": format!("P{}", i), "seller_id": "U1" })
                .unwrap();
        }
        store.insert("products", doc! { "_id": "P9", "seller_id": "U9" }).unwrap();

        let cache = Arc::new(OwnerCache::new(store.clone(), "users", Duration::from_secs(300)));
        let settings = SelectorSettings {
            policy: SelectionPolicy::Random,
            max_attempts: 10,
            sample_limit: 3,
            products_collection: "products".to_string(),
        };
        let mut selector = CandidateSelector::new(store, cache, Arc::new(MemoryEventSink::new()), settings, Some(1));
        let selection = selector
            .select_candidate("run", &[candidate("P9", "U9")], &HashSet::new())
            .await
            .unwrap();
        assert_eq!(selection.candidate.unwrap().product.id, "P9");
    }

    #[tokio::test]
    async fn test_attempt_cap_bounds_selection() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store
                .insert("products", doc! { "_id": format!("P{:02}", i), "seller_id": format!("U{:02}", i) })
                .unwrap();
        }

        let (mut selector, events) = selector(store, SelectionPolicy::Random, 3);
        let selection = selector.select_candidate("run", &[], &HashSet::new()).await.unwrap();
        assert!(selection.candidate.is_none());
        assert_eq!(selection.attempts, 3);
        assert_eq!(events.count("candidate_rejected"), 3);
    }
}
