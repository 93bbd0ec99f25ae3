//! modelvault - model artifact download, validation, and caching engine
//!
//! Retrieves large binary model files from remote stores with fallback,
//! verifies their integrity, tracks what is validly cached in a durable
//! manifest, enforces resource budgets before committing to transfers, and
//! evicts stale cache entries.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod janitor;
pub mod manifest;
pub mod resources;
pub mod validate;

pub use backend::{ArtifactBackend, CancelFlag, DownloadTask, ModelListing, RemoteObject};
pub use catalog::{Catalog, ModelDescriptor};
pub use config::VaultConfig;
pub use downloader::{DownloadPhase, DownloadPolicy, Downloader, SyncReport};
pub use error::{VaultError, VaultResult};
pub use janitor::{CleanupReport, Janitor};
pub use manifest::{CacheEntry, ManifestStore};
pub use resources::SystemResources;
