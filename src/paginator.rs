use std::sync::Arc;

use bson::Bson;

use crate::models::product::fields;
use crate::models::{ProductRecord, Result};
use crate::store::{DocumentStore, Filter, OrderBy, Query};

/// One forward page of a seller's products, migrated or not.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<ProductRecord>,
    /// True when the page came back full; a later empty page settles it.
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub range_label: String,
    pub malformed: usize,
}

/// Human-readable span for progress output, e.g. `"21-40"` for page 1 of 20.
pub fn range_label(page: usize, size: usize) -> String {
    format!("{}-{}", page * size + 1, (page + 1) * size)
}

pub struct BatchPaginator {
    store: Arc<dyn DocumentStore>,
    products_collection: String,
    batch_size: usize,
}

impl BatchPaginator {
    pub fn new(store: Arc<dyn DocumentStore>, products_collection: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            products_collection: products_collection.into(),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch page `batch_index` (1-based) for `owner_id`, starting after `cursor`.
    pub async fn next_page(&self, owner_id: &str, batch_index: usize, cursor: Option<&str>) -> Result<Page> {
        let query = Query::new()
            .filter(Filter::eq(fields::OWNER_ID, owner_id))
            .order_by(OrderBy::asc(fields::ID))
            .limit(self.batch_size)
            .start_after(cursor.map(|c| Bson::String(c.to_string())));
        let docs = self.store.query(&self.products_collection, &query).await?;

        let has_more = docs.len() == self.batch_size;
        // Undecodable documents still move the cursor so they are not re-read forever.
        let next_cursor = docs
            .last()
            .and_then(|d| d.get_str(fields::ID).ok())
            .map(str::to_string)
            .or_else(|| cursor.map(str::to_string));

        let mut records = Vec::with_capacity(docs.len());
        let mut malformed = 0;
        for doc in docs {
            match ProductRecord::from_document(doc) {
                Ok(product) => records.push(product),
                Err(e) => {
                    tracing::warn!(owner_id, batch_index, error = %e, "Undecodable product in batch");
                    malformed += 1;
                }
            }
        }

        Ok(Page {
            records,
            has_more,
            next_cursor,
            range_label: range_label(batch_index.saturating_sub(1), self.batch_size),
            malformed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bson::doc;

    fn seeded(count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..count {
            store
                .insert("products", doc! { "_id": format!("P{:02}", i), "seller_id": "U1" })
                .unwrap();
        }
        store
            .insert("products", doc! { "_id": "P99", "seller_id": "U2" })
            .unwrap();
        store
            .insert("products", doc! { "_id": "P00a", "seller_id": "U1", "company_id": "C1" })
            .unwrap();
        store
    }

    #[test]
    fn test_range_label() {
        assert_eq!(range_label(0, 10), "1-10");
        assert_eq!(range_label(2, 20), "41-60");
    }

    #[tokio::test]
    async fn test_walks_owner_pages_forward() {
        let paginator = BatchPaginator::new(seeded(4), "products", 2);

        let first = paginator.next_page("U1", 1, None).await.unwrap();
        let ids: Vec<_> = first.records.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["P00", "P00a"]);
        assert!(first.has_more);
        assert_eq!(first.range_label, "1-2");

        let second = paginator.next_page("U1", 2, first.next_cursor.as_deref()).await.unwrap();
        let ids: Vec<_> = second.records.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["P01", "P02"]);
        assert_eq!(second.range_label, "3-4");

        let third = paginator.next_page("U1", 3, second.next_cursor.as_deref()).await.unwrap();
        assert_eq!(third.records.len(), 1);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_empty_page() {
        let paginator = BatchPaginator::new(seeded(3), "products", 2);
        let first = paginator.next_page("U1", 1, None).await.unwrap();
        let second = paginator.next_page("U1", 2, first.next_cursor.as_deref()).await.unwrap();
        assert!(second.has_more);

        let third = paginator.next_page("U1", 3, second.next_cursor.as_deref()).await.unwrap();
        assert!(third.records.is_empty());
        assert!(!third.has_more);
        assert_eq!(third.next_cursor, second.next_cursor);
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let store = seeded(3);
        store.fail_queries(true);
        let paginator = BatchPaginator::new(store, "products", 2);
        assert!(paginator.next_page("U1", 1, None).await.is_err());
    }
}
