use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{Bson, Document};

use super::{check_write_size, DocumentStore, Filter, Query, SortDirection, WriteOp, WriteOutcome};
use crate::models::{BackfillError, Result};

/// In-process document store keyed by string `_id`.
///
/// Writes hold the state lock for the whole op list, so an `atomic_write`
/// is observed either fully or not at all unless a partial fault is injected.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    failing_writes: AtomicUsize,
    partial_write_after: Mutex<Option<usize>>,
    failing_queries: AtomicBool,
    write_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document. The document must carry a string `_id`.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<()> {
        let id = doc
            .get_str("_id")
            .map_err(|_| BackfillError::Validation("document requires a string _id".to_string()))?
            .to_string();
        let mut state = self.collections.lock().expect("Memory store mutex poisoned");
        state.entry(collection.to_string()).or_default().insert(id, doc);
        Ok(())
    }

    pub fn insert_many(&self, collection: &str, docs: impl IntoIterator<Item = Document>) -> Result<()> {
        for doc in docs {
            self.insert(collection, doc)?;
        }
        Ok(())
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        let state = self.collections.lock().expect("Memory store mutex poisoned");
        state.get(collection).and_then(|c| c.get(id)).cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        let state = self.collections.lock().expect("Memory store mutex poisoned");
        state.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Make the next `count` calls to `atomic_write` fail without applying anything.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, AtomicOrdering::SeqCst);
    }

    /// Make the next `atomic_write` apply only its first `applied` ops and then
    /// fail, the way a store without transactions can.
    pub fn fail_next_write_after(&self, applied: usize) {
        *self.partial_write_after.lock().expect("Memory store mutex poisoned") = Some(applied);
    }

    /// Make every query fail until switched off again.
    pub fn fail_queries(&self, enabled: bool) {
        self.failing_queries.store(enabled, AtomicOrdering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(AtomicOrdering::SeqCst)
    }

    fn take_write_fault(&self) -> bool {
        self.failing_writes
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        self.query_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.failing_queries.load(AtomicOrdering::SeqCst) {
            return Err(BackfillError::Store(format!("injected query failure on '{}'", collection)));
        }
        if query.start_after.is_some() && query.order_by.is_none() {
            return Err(BackfillError::Validation("start_after requires order_by".to_string()));
        }

        let state = self.collections.lock().expect("Memory store mutex poisoned");
        let Some(docs) = state.get(collection) else {
            return Ok(Vec::new());
        };

        // BTreeMap iteration already yields `_id` ascending, so a stable sort
        // on the order field keeps the `_id` tie-break.
        let mut matched: Vec<&Document> = docs
            .values()
            .filter(|doc| query.filters.iter().all(|f| matches_filter(doc, f)))
            .collect();

        if let Some(order) = &query.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_bson(&field_value(a, &order.field), &field_value(b, &order.field));
                match order.direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                }
            });
            if let Some(cursor) = &query.start_after {
                matched.retain(|doc| {
                    let ord = compare_bson(&field_value(doc, &order.field), cursor);
                    match order.direction {
                        SortDirection::Ascending => ord == Ordering::Greater,
                        SortDirection::Descending => ord == Ordering::Less,
                    }
                });
            }
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().take(limit).cloned().collect())
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.get(collection, id))
    }

    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<WriteOutcome> {
        self.write_calls.fetch_add(1, AtomicOrdering::SeqCst);
        check_write_size(&ops)?;
        if self.take_write_fault() {
            return Err(BackfillError::Store("injected atomic write failure".to_string()));
        }

        let stop_after = self.partial_write_after.lock().expect("Memory store mutex poisoned").take();

        let mut state = self.collections.lock().expect("Memory store mutex poisoned");
        let mut outcome = WriteOutcome::default();
        for (idx, op) in ops.into_iter().enumerate() {
            if stop_after == Some(idx) {
                return Err(BackfillError::PartialWrite {
                    applied: outcome.applied,
                    unmatched: outcome.unmatched,
                    message: "injected failure partway through write".to_string(),
                });
            }
            let target = state
                .get_mut(&op.collection)
                .and_then(|c| c.get_mut(&op.id))
                .filter(|doc| op.guard.iter().all(|f| matches_filter(doc, f)));
            match target {
                Some(doc) => {
                    for (key, value) in op.set {
                        doc.insert(key, value);
                    }
                    outcome.applied.push(op.id);
                }
                None => outcome.unmatched.push(op.id),
            }
        }
        Ok(outcome)
    }
}

fn field_value(doc: &Document, field: &str) -> Bson {
    doc.get(field).cloned().unwrap_or(Bson::Null)
}

fn matches_filter(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(field, value) => compare_bson(&field_value(doc, field), value) == Ordering::Equal,
        Filter::Ne(field, value) => compare_bson(&field_value(doc, field), value) != Ordering::Equal,
        Filter::In(field, values) => {
            let actual = field_value(doc, field);
            values.iter().any(|v| compare_bson(&actual, v) == Ordering::Equal)
        }
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::ObjectId(_) => 5,
        Bson::Boolean(_) => 6,
        Bson::DateTime(_) => 7,
        _ => 8,
    }
}

fn as_f64(value: &Bson) -> f64 {
    match value {
        Bson::Int32(v) => *v as f64,
        Bson::Int64(v) => *v as f64,
        Bson::Double(v) => *v,
        _ => 0.0,
    }
}

/// Cross-type ordering loosely following MongoDB's comparison order.
fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.timestamp_millis().cmp(&y.timestamp_millis()),
        _ if type_rank(a) == 1 => as_f64(a).partial_cmp(&as_f64(b)).unwrap_or(Ordering::Equal),
        _ if type_rank(a) == 0 => Ordering::Equal,
        _ if a == b => Ordering::Equal,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OrderBy;
    use bson::doc;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_many(
                "products",
                vec![
                    doc! { "_id": "P3", "seller_id": "U1", "company_id": "" },
                    doc! { "_id": "P1", "seller_id": "U2" },
                    doc! { "_id": "P2", "seller_id": "U1", "company_id": "C1" },
                    doc! { "_id": "P4", "seller_id": "U1", "company_id": Bson::Null },
                ],
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_empty_filter_matches_missing_null_and_blank() {
        let store = seeded();
        let query = Query::new().filter(Filter::empty("company_id"));
        let docs = store.query("products", &query).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.get_str("_id").unwrap()).collect();
        assert_eq!(ids, vec!["P1", "P3", "P4"]);
    }

    #[tokio::test]
    async fn test_order_with_id_tiebreak_and_cursor() {
        let store = seeded();
        let query = Query::new().order_by(OrderBy::asc("seller_id"));
        let docs = store.query("products", &query).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.get_str("_id").unwrap()).collect();
        assert_eq!(ids, vec!["P2", "P3", "P4", "P1"]);

        let query = Query::new()
            .filter(Filter::eq("seller_id", "U1"))
            .order_by(OrderBy::asc("_id"))
            .limit(1)
            .start_after(Some(Bson::String("P2".to_string())));
        let docs = store.query("products", &query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_str("_id").unwrap(), "P3");
    }

    #[tokio::test]
    async fn test_cursor_without_order_is_rejected() {
        let store = seeded();
        let query = Query::new().start_after(Some(Bson::String("P1".to_string())));
        assert!(store.query("products", &query).await.is_err());
    }

    #[tokio::test]
    async fn test_guarded_write_reports_unmatched() {
        let store = seeded();
        let ops = ["P2", "P3", "missing"]
            .iter()
            .map(|id| WriteOp {
                collection: "products".to_string(),
                id: id.to_string(),
                guard: vec![Filter::empty("company_id")],
                set: doc! { "company_id": "C9" },
            })
            .collect();

        let outcome = store.atomic_write(ops).await.unwrap();
        assert_eq!(outcome.applied, vec!["P3".to_string()]);
        assert_eq!(outcome.unmatched, vec!["P2".to_string(), "missing".to_string()]);
        assert_eq!(store.get("products", "P2").unwrap().get_str("company_id").unwrap(), "C1");
        assert_eq!(store.get("products", "P3").unwrap().get_str("company_id").unwrap(), "C9");
    }

    #[tokio::test]
    async fn test_injected_write_failure_applies_nothing() {
        let store = seeded();
        store.fail_next_writes(1);
        let op = WriteOp {
            collection: "products".to_string(),
            id: "P4".to_string(),
            guard: Vec::new(),
            set: doc! { "company_id": "C9" },
        };

        assert!(store.atomic_write(vec![op.clone()]).await.is_err());
        assert_eq!(store.get("products", "P4").unwrap().get("company_id"), Some(&Bson::Null));

        // Fault is consumed; the retry goes through.
        assert!(store.atomic_write(vec![op]).await.is_ok());
        assert_eq!(store.write_calls(), 2);
    }

    #[test]
    fn test_insert_requires_string_id() {
        let store = MemoryStore::new();
        assert!(store.insert("products", doc! { "_id": 5 }).is_err());
        assert!(store.is_empty("products"));
    }

    #[test]
    fn test_compare_numbers_across_types() {
        assert_eq!(compare_bson(&Bson::Int32(3), &Bson::Int64(3)), Ordering::Equal);
        assert_eq!(compare_bson(&Bson::Null, &Bson::String(String::new())), Ordering::Less);
    }
}
