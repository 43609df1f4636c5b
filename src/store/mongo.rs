use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, FindOneOptions, FindOptions};
use mongodb::{Client, Database, IndexModel};

use super::{check_write_size, DocumentStore, Filter, OrderBy, Query, SortDirection, WriteOp, WriteOutcome};
use crate::config::Config;
use crate::models::product::fields;
use crate::models::{BackfillError, Result};

/// MongoDB-backed store. Atomic writes run inside a client-session
/// transaction, which needs a replica set or sharded cluster.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
    use_transactions: bool,
}

impl MongoStore {
    pub fn new(client: Client, db: Database, use_transactions: bool) -> Self {
        Self { client, db, use_transactions }
    }

    pub async fn connect(cfg: &Config) -> Result<Self> {
        let uri = effective_uri(&cfg.mongodb_uri, cfg.mongodb_retry_writes);
        let mut client_options = ClientOptions::parse(&uri).await?;
        client_options.retry_writes = Some(cfg.mongodb_retry_writes);
        client_options.app_name = Some("product-backfill".to_string());
        let client = Client::with_options(client_options)?;
        let db = client.database(&cfg.database_name);
        if !cfg.mongodb_transactions {
            tracing::warn!("Transactions disabled; batch writes will not be all-or-nothing");
        }
        Ok(Self::new(client, db, cfg.mongodb_transactions))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Indexes backing the seller-scoped pagination and the eligibility filter.
    pub async fn ensure_indexes(&self, products_collection: &str) -> Result<()> {
        let products = self.db.collection::<Document>(products_collection);

        products
            .create_index(
                IndexModel::builder()
                    .keys(doc! { fields::OWNER_ID: 1, fields::ID: 1 })
                    .build(),
                None,
            )
            .await?;

        products
            .create_index(IndexModel::builder().keys(doc! { fields::COMPANY_ID: 1 }).build(), None)
            .await?;

        tracing::info!(collection = products_collection, "Backfill indexes ensured");
        Ok(())
    }

    async fn write_in_transaction(&self, ops: &[WriteOp]) -> Result<WriteOutcome> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        let mut outcome = WriteOutcome::default();
        for op in ops {
            let coll = self.db.collection::<Document>(&op.collection);
            let update = doc! { "$set": op.set.clone() };
            match coll
                .update_one_with_session(op_filter(op), update, None, &mut session)
                .await
            {
                Ok(res) if res.matched_count == 0 => outcome.unmatched.push(op.id.clone()),
                Ok(_) => outcome.applied.push(op.id.clone()),
                Err(e) => {
                    if let Err(abort_err) = session.abort_transaction().await {
                        tracing::warn!(error = %abort_err, "Failed to abort batch transaction");
                    }
                    return Err(e.into());
                }
            }
        }

        session.commit_transaction().await?;
        Ok(outcome)
    }

    async fn write_without_session(&self, ops: &[WriteOp]) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        for op in ops {
            let coll = self.db.collection::<Document>(&op.collection);
            let res = match coll
                .update_one(op_filter(op), doc! { "$set": op.set.clone() }, None)
                .await
            {
                Ok(res) => res,
                Err(e) => return Err(interrupted_write(outcome, e)),
            };
            if res.matched_count == 0 {
                outcome.unmatched.push(op.id.clone());
            } else {
                outcome.applied.push(op.id.clone());
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        let coll = self.db.collection::<Document>(collection);

        let mut clauses: Vec<Document> = query.filters.iter().map(filter_document).collect();
        let mut options = FindOptions::default();
        if let Some(order) = &query.order_by {
            let dir = match order.direction {
                SortDirection::Ascending => 1,
                SortDirection::Descending => -1,
            };
            let mut sort = doc! { order.field.as_str(): dir };
            if order.field != fields::ID {
                sort.insert(fields::ID, 1);
            }
            options.sort = Some(sort);

            if let Some(cursor) = &query.start_after {
                clauses.push(cursor_clause(order, cursor));
            }
        }
        if let Some(limit) = query.limit {
            options.limit = Some(limit as i64);
        }

        let cursor = coll.find(combine(clauses), options).await?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(normalize_id).collect())
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let coll = self.db.collection::<Document>(collection);
        let found = coll
            .find_one(id_filter(id), FindOneOptions::default())
            .await?;
        Ok(found.map(normalize_id))
    }

    async fn atomic_write(&self, ops: Vec<WriteOp>) -> Result<WriteOutcome> {
        check_write_size(&ops)?;
        if ops.is_empty() {
            return Ok(WriteOutcome::default());
        }
        if self.use_transactions {
            self.write_in_transaction(&ops).await
        } else {
            self.write_without_session(&ops).await
        }
    }
}

/// Force `retryWrites` in the connection string to match configuration.
/// Some deployments reject retryable writes unless the URI says so explicitly.
pub fn effective_uri(uri: &str, retry_writes: bool) -> String {
    if retry_writes {
        return uri.to_string();
    }
    let mut effective = uri.to_string();
    if effective.contains("retryWrites=") {
        effective = effective
            .replace("retryWrites=true", "retryWrites=false")
            .replace("retryWrites=1", "retryWrites=false");
    } else if effective.contains('?') {
        effective.push_str("&retryWrites=false");
    } else {
        effective.push_str("?retryWrites=false");
    }
    effective
}

/// Products migrated from the hosted store keep string ids; anything created
/// natively may carry an ObjectId. Match either form.
fn id_filter(id: &str) -> Document {
    match ObjectId::parse_str(id) {
        Ok(oid) => doc! { fields::ID: { "$in": [id, oid] } },
        Err(_) => doc! { fields::ID: id },
    }
}

/// Error for an unsessioned write that failed after `outcome` had already landed.
fn interrupted_write(outcome: WriteOutcome, err: mongodb::error::Error) -> BackfillError {
    if outcome.applied.is_empty() && outcome.unmatched.is_empty() {
        return err.into();
    }
    BackfillError::PartialWrite {
        applied: outcome.applied,
        unmatched: outcome.unmatched,
        message: err.to_string(),
    }
}

/// Forward-only cursor condition. Ids leave this store as hex strings, so an
/// `_id` cursor that parses as an ObjectId is compared as one. MongoDB orders
/// strings before ObjectIds, which the clauses follow for mixed collections.
fn cursor_clause(order: &OrderBy, cursor: &Bson) -> Document {
    let field = order.field.as_str();
    let ascending = order.direction == SortDirection::Ascending;
    let op = if ascending { "$gt" } else { "$lt" };
    let id = match cursor {
        Bson::String(id) if field == fields::ID => id,
        _ => return doc! { field: { op: cursor.clone() } },
    };
    match (ObjectId::parse_str(id), ascending) {
        (Ok(oid), true) => doc! { field: { "$gt": oid } },
        (Ok(oid), false) => doc! {
            "$or": [ { field: { "$lt": oid } }, { field: { "$type": "string" } } ]
        },
        (Err(_), true) => doc! {
            "$or": [ { field: { "$gt": id.as_str() } }, { field: { "$type": "objectId" } } ]
        },
        (Err(_), false) => doc! { field: { "$lt": id.as_str() } },
    }
}

fn normalize_id(mut doc: Document) -> Document {
    if let Some(Bson::ObjectId(oid)) = doc.get(fields::ID) {
        let hex = oid.to_hex();
        doc.insert(fields::ID, hex);
    }
    doc
}

fn filter_document(filter: &Filter) -> Document {
    match filter {
        Filter::Eq(field, value) => doc! { field.as_str(): value.clone() },
        Filter::Ne(field, value) => doc! { field.as_str(): { "$ne": value.clone() } },
        Filter::In(field, values) => doc! { field.as_str(): { "$in": values.clone() } },
    }
}

fn combine(mut clauses: Vec<Document>) -> Document {
    match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    }
}

fn op_filter(op: &WriteOp) -> Document {
    let mut clauses = vec![id_filter(&op.id)];
    clauses.extend(op.guard.iter().map(filter_document));
    combine(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_error() -> mongodb::error::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset").into()
    }

    #[test]
    fn test_failure_before_any_write_keeps_database_error() {
        let err = interrupted_write(WriteOutcome::default(), network_error());
        assert!(matches!(err, BackfillError::Database(_)));
    }

    #[test]
    fn test_failure_after_landed_writes_reports_them() {
        let outcome = WriteOutcome {
            applied: vec!["P1".to_string()],
            unmatched: vec!["P2".to_string()],
        };
        match interrupted_write(outcome, network_error()) {
            BackfillError::PartialWrite { applied, unmatched, message } => {
                assert_eq!(applied, vec!["P1"]);
                assert_eq!(unmatched, vec!["P2"]);
                assert!(message.contains("connection reset"));
            }
            other => panic!("expected partial write, got {other:?}"),
        }
    }

    #[test]
    fn test_effective_uri_forces_retry_writes_off() {
        assert_eq!(
            effective_uri("mongodb://localhost:27017", false),
            "mongodb://localhost:27017?retryWrites=false"
        );
        assert_eq!(
            effective_uri("mongodb://h/db?authSource=admin", false),
            "mongodb://h/db?authSource=admin&retryWrites=false"
        );
        assert_eq!(
            effective_uri("mongodb://h/?retryWrites=true", false),
            "mongodb://h/?retryWrites=false"
        );
        assert_eq!(effective_uri("mongodb://h/", true), "mongodb://h/");
    }

    #[test]
    fn test_id_filter_accepts_object_id_form() {
        let oid = ObjectId::new();
        let filter = id_filter(&oid.to_hex());
        assert!(filter.get_document(fields::ID).unwrap().contains_key("$in"));
        assert_eq!(id_filter("P1"), doc! { "_id": "P1" });
    }

    #[test]
    fn test_object_id_cursor_compares_as_object_id() {
        let oid = ObjectId::new();
        let cursor = Bson::String(oid.to_hex());
        assert_eq!(
            cursor_clause(&OrderBy::asc(fields::ID), &cursor),
            doc! { "_id": { "$gt": oid } }
        );
    }

    #[test]
    fn test_string_cursor_still_reaches_object_ids() {
        let clause = cursor_clause(&OrderBy::asc(fields::ID), &Bson::String("P2".to_string()));
        assert_eq!(
            clause,
            doc! { "$or": [ { "_id": { "$gt": "P2" } }, { "_id": { "$type": "objectId" } } ] }
        );
    }

    #[test]
    fn test_cursor_on_other_field_is_plain_comparison() {
        let clause = cursor_clause(&OrderBy::asc(fields::OWNER_ID), &Bson::String("U1".to_string()));
        assert_eq!(clause, doc! { "seller_id": { "$gt": "U1" } });
    }

    #[test]
    fn test_normalize_object_id() {
        let oid = ObjectId::new();
        let doc = normalize_id(doc! { "_id": oid, "name": "x" });
        assert_eq!(doc.get_str("_id").unwrap(), oid.to_hex());
    }

    #[test]
    fn test_op_filter_combines_guards() {
        let op = WriteOp {
            collection: "products".to_string(),
            id: "P1".to_string(),
            guard: vec![Filter::eq("seller_id", "U1"), Filter::empty("company_id")],
            set: doc! { "company_id": "C1" },
        };
        let filter = op_filter(&op);
        assert_eq!(filter.get_array("$and").unwrap().len(), 3);
    }
}
