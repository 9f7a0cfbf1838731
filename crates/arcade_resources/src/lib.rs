//! Tag-indexed resource store.
//!
//! Arbitrary resource types are kept in one key-value table and queried by
//! any conjunction of key/value tags. The layers, leaves first:
//!
//! - [`keys`]: composite key encoding
//! - [`tags`]: tag items, tag diffs and reassembly
//! - [`transaction`]: atomic multi-item writes with conflict retry
//! - [`lister`]: full-type scans and multi-id hydration
//! - [`intersection`]: ids carrying every one of N tags
//! - [`latest`]: parent to latest-child pointers
//! - [`service`]: create/get/update/delete/list per catalogued type
//!
//! # Usage
//!
//! ```rust,ignore
//! use arcade_resources::{ListOptions, NewResource, ResourceService, StoreConfig};
//!
//! let service = ResourceService::new(store, StoreConfig::default())?;
//! let group = service
//!     .create("g", NewResource::new().with_field("name", "north").with_tag("crop", "corn"), "alice")
//!     .await?;
//! let page = service.list("g", ListOptions::new().with_tag("crop", "corn")).await?;
//! ```

pub mod catalog;
pub mod config;
pub mod defaults;
mod error;
pub mod intersection;
pub mod keys;
pub mod latest;
pub mod lister;
pub mod paginator;
pub mod service;
pub mod tags;
pub mod transaction;

pub use catalog::{Catalog, LatestSpec, ParentSpec, ResourceType};
pub use config::StoreConfig;
pub use error::{ResourceError, Result};
pub use intersection::TagIntersection;
pub use latest::{LatestPointer, LatestPointerMaintainer};
pub use lister::ResourceLister;
pub use paginator::{PageRequest, Paginator};
pub use service::{ListOptions, NewResource, Resource, ResourcePage, ResourceService, ResourceUpdate};
pub use tags::{TagDiff, TagUpdates, Tags};
pub use transaction::{TransactionBuilder, TransactionExecutor};
