//! Single-table key-value storage for Arcade.
//!
//! Every resource, tag and pointer item lives in one table keyed by
//! `(pk, sk)` with three secondary indexes (see [`schema`]). Backends
//! implement [`KvStore`]:
//!
//! - [`MemoryStore`]: ordered in-process map with fault injection, for tests
//! - [`SqliteStore`]: one SQLite table via sqlx
//!
//! # Usage
//!
//! ```rust,ignore
//! use arcade_db::{open_store, StoreUrl};
//!
//! let store = open_store(&StoreUrl::parse("sqlite:arcade.sqlite")?, "arcade").await?;
//! let item = store.get_item(&ItemKey::new("g:1", "g:1")).await?;
//! ```

mod error;
mod memory;
pub mod schema;
mod store;
mod types;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use error::{Result, StoreError};
pub use memory::{InjectedFault, MemoryStore};
pub use schema::Index;
pub use store::KvStore;
pub use types::*;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Parsed store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    /// `sqlite:<path>`
    Sqlite(PathBuf),
    /// `sqlite::memory:`
    SqliteMemory,
    /// `memory:`
    Memory,
}

impl StoreUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw == "memory:" {
            return Ok(Self::Memory);
        }
        if raw == "sqlite::memory:" {
            return Ok(Self::SqliteMemory);
        }
        if let Some(rest) = raw.strip_prefix("sqlite:") {
            let path = rest.trim_start_matches("//").trim();
            if path.is_empty() {
                return Err(StoreError::InvalidUrl(format!(
                    "sqlite URL missing path: {raw}"
                )));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        Err(StoreError::InvalidUrl(format!(
            "Unsupported store URL: {raw}"
        )))
    }
}

impl std::fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreUrl::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
            StoreUrl::SqliteMemory => f.write_str("sqlite::memory:"),
            StoreUrl::Memory => f.write_str("memory:"),
        }
    }
}

/// Open the backend a URL names.
pub async fn open_store(url: &StoreUrl, table: &str) -> Result<Arc<dyn KvStore>> {
    schema::validate_table_name(table).map_err(StoreError::InvalidTable)?;
    let store: Arc<dyn KvStore> = match url {
        StoreUrl::Memory => Arc::new(MemoryStore::new()),
        #[cfg(feature = "sqlite")]
        StoreUrl::SqliteMemory => Arc::new(SqliteStore::open_memory(table).await?),
        #[cfg(feature = "sqlite")]
        StoreUrl::Sqlite(path) => Arc::new(SqliteStore::open(path, table).await?),
        #[cfg(not(feature = "sqlite"))]
        other => {
            return Err(StoreError::InvalidUrl(format!(
                "{other} requires the 'sqlite' feature"
            )))
        }
    };
    info!(url = %url, backend = store.backend_name(), "Store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_url_parse() {
        assert_eq!(StoreUrl::parse("memory:").unwrap(), StoreUrl::Memory);
        assert_eq!(
            StoreUrl::parse("sqlite::memory:").unwrap(),
            StoreUrl::SqliteMemory
        );
        assert_eq!(
            StoreUrl::parse("sqlite:data/arcade.sqlite").unwrap(),
            StoreUrl::Sqlite(PathBuf::from("data/arcade.sqlite"))
        );
        assert_eq!(
            StoreUrl::parse("sqlite:///tmp/a.sqlite").unwrap(),
            StoreUrl::Sqlite(PathBuf::from("/tmp/a.sqlite"))
        );
    }

    #[test]
    fn test_store_url_rejects_unknown() {
        assert!(matches!(
            StoreUrl::parse("postgres://localhost/arcade"),
            Err(StoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            StoreUrl::parse("sqlite:"),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_open_store_rejects_bad_table() {
        let err = open_store(&StoreUrl::Memory, "bad table").await.err();
        assert!(matches!(err, Some(StoreError::InvalidTable(_))));
    }
}
