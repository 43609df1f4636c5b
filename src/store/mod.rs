//! Document-store seam consumed by the backfill engine.
//!
//! The engine needs exactly three primitives from the underlying database:
//! filtered/ordered/cursor-paged reads, lookup by id, and an all-or-nothing
//! multi-record patch. [`MongoStore`] implements them on MongoDB and
//! [`MemoryStore`] in process.

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::models::Result;

/// Largest op list a single `atomic_write` accepts.
pub const MAX_ATOMIC_WRITE_OPS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Bson),
    Ne(String, Bson),
    In(String, Vec<Bson>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Bson>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Bson>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    /// Matches documents where `field` is absent, null or the empty string.
    pub fn empty(field: &str) -> Self {
        Filter::In(field.to_string(), vec![Bson::Null, Bson::String(String::new())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), direction: SortDirection::Ascending }
    }
}

/// A read against one collection. Ties in `order_by` are broken by `_id`
/// ascending; `start_after` is compared against the ordering field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Bson>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Bson>) -> Self {
        self.start_after = cursor;
        self
    }
}

/// One patch inside an atomic write. Applied only when the record exists and
/// every guard filter matches it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub collection: String,
    pub id: String,
    pub guard: Vec<Filter>,
    pub set: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub applied: Vec<String>,
    /// Ids that did not exist or failed their guard. Not a failure.
    pub unmatched: Vec<String>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>>;

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Apply every op or none of them. A store that cannot do so returns
    /// `BackfillError::PartialWrite` naming what did land.
    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<WriteOutcome>;
}

/// Reject op lists the store cannot commit in one unit.
pub(crate) fn check_write_size(ops: &[WriteOp]) -> Result<()> {
    if ops.len() > MAX_ATOMIC_WRITE_OPS {
        return Err(crate::models::BackfillError::Validation(format!(
            "atomic write of {} ops exceeds the limit of {}",
            ops.len(),
            MAX_ATOMIC_WRITE_OPS
        )));
    }
    Ok(())
}
