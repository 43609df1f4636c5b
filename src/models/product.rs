use bson::{DateTime as BsonDateTime, Document};
use serde::{Deserialize, Serialize};

use super::{has_value, Result};

/// Document field names on the products collection.
pub mod fields {
    pub const ID: &str = "_id";
    pub const OWNER_ID: &str = "seller_id";
    pub const COMPANY_ID: &str = "company_id";
    pub const UPDATED_AT: &str = "updated_at";
    pub const MIGRATION_SOURCE: &str = "migration_source";
    pub const MIGRATION_RUN_ID: &str = "migration_run_id";
    pub const MIGRATION_BATCH_INDEX: &str = "migration_batch_index";
    pub const MIGRATION_TIMESTAMP: &str = "migration_timestamp";
    pub const MIGRATION_OWNER_ID: &str = "migration_owner_id";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "seller_id", default)]
    pub owner_id: Option<String>,
    #[serde(rename = "company_id", default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<BsonDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<BsonDateTime>,
}

impl ProductRecord {
    pub fn from_document(doc: Document) -> Result<Self> {
        Ok(bson::from_document(doc)?)
    }

    pub fn is_migrated(&self) -> bool {
        has_value(&self.company_id)
    }

    pub fn is_orphaned(&self) -> bool {
        !has_value(&self.owner_id)
    }

    /// Seller id when present and non-empty.
    pub fn owner(&self) -> Option<&str> {
        self.owner_id.as_deref().filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_decode_minimal_document() {
        let product = ProductRecord::from_document(doc! { "_id": "P1", "seller_id": "U1" }).unwrap();
        assert_eq!(product.id, "P1");
        assert_eq!(product.owner(), Some("U1"));
        assert!(!product.is_migrated());
        assert!(!product.is_orphaned());
    }

    #[test]
    fn test_empty_and_null_fields() {
        let product = ProductRecord::from_document(doc! {
            "_id": "P2",
            "seller_id": "",
            "company_id": bson::Bson::Null,
            "name": "Lamp",
        })
        .unwrap();
        assert!(product.is_orphaned());
        assert_eq!(product.owner(), None);
        assert!(!product.is_migrated());
        assert_eq!(product.name.as_deref(), Some("Lamp"));
    }

    #[test]
    fn test_missing_id_is_malformed() {
        assert!(ProductRecord::from_document(doc! { "seller_id": "U1" }).is_err());
    }
}
