use bson::Document;
use serde::{Deserialize, Serialize};

use super::{has_value, Result};

/// A seller account. The backfill only ever reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "company_id", default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl OwnerRecord {
    pub fn from_document(doc: Document) -> Result<Self> {
        Ok(bson::from_document(doc)?)
    }

    pub fn has_company(&self) -> bool {
        has_value(&self.company_id)
    }

    /// The value to propagate onto products, if this seller can supply one.
    pub fn company(&self) -> Option<&str> {
        self.company_id.as_deref().filter(|s| !s.is_empty())
    }
}
