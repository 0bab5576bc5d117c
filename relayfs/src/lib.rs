//! Remote object storage exposed through blocking, sequential file reads.
//!
//! Reads are served by a download worker: a single-threaded reactor that
//! fetches each remote object once into an in-memory buffer and relays it to
//! every reader over its own loopback connection.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod manager;
pub mod path;
pub mod protocol;
pub mod worker;

pub use backend::{Metadata, MetadataReply, RemoteBackend, build_backend};
pub use cache::Cache;
pub use config::{Config, load_config};
pub use error::{Error, Result};
pub use fs::RemoteFs;
pub use manager::Manager;
