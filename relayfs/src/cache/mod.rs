//! Metadata and data caches
//!
//! - `metadata`: path-keyed metadata snapshots owned by the filesystem-facing
//!   side; stale entries are refreshed with a conditional fetch.
//! - `data`: path-keyed byte buffers owned exclusively by the download worker;
//!   each entry grows as its fetch source is pumped by the reactor.
pub mod data;
pub mod metadata;

pub use data::{Claim, DataCache, DataCacheEntry, EntryId};
pub use metadata::{Cache, FetchOutcome, MetadataCacheEntry, UploadLease};
