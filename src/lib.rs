//! Backfills the owning seller's `company_id` onto marketplace products.
//!
//! A run scans a sample of products for eligible work, binds one seller that
//! has a company id, then walks that seller's unmigrated products in
//! cursor-paginated batches, writing each batch atomically. Writes are
//! guarded so a product that already has a company id is never overwritten.

pub mod cache;
pub mod config;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod paginator;
pub mod scanner;
pub mod selector;
pub mod store;
pub mod writer;

pub use cache::{CacheStats, OwnerCache};
pub use config::Config;
pub use events::{BackfillEvent, EventSink, MemoryEventSink, NullEventSink, TracingEventSink};
pub use models::*;
pub use orchestrator::{BackfillOrchestrator, BackfillOrchestratorBuilder};
pub use scanner::{EligibilityScanner, EligibilityStats, ScanReport};
pub use selector::SelectionPolicy;
pub use store::{DocumentStore, MemoryStore, MongoStore};
