//! Store configuration.

use crate::defaults::{
    DEFAULT_BATCH_SELECT_CHUNK, DEFAULT_PAGE_SIZE, DEFAULT_TABLE_NAME,
    DEFAULT_TRANSACTION_RETRIES,
};
use crate::error::{ResourceError, Result};

/// Tunables for the resource store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Name of the single table every item lives in
    pub table_name: String,
    /// Attempts per transactional write before giving up on conflicts
    pub transaction_retries: u32,
    /// Page size when a list call does not ask for one
    pub default_page_size: usize,
    /// Partitions per batch select when hydrating a list of ids
    pub batch_select_chunk: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            transaction_retries: DEFAULT_TRANSACTION_RETRIES,
            default_page_size: DEFAULT_PAGE_SIZE,
            batch_select_chunk: DEFAULT_BATCH_SELECT_CHUNK,
        }
    }
}

impl StoreConfig {
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_transaction_retries(mut self, retries: u32) -> Self {
        self.transaction_retries = retries;
        self
    }

    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.default_page_size = page_size;
        self
    }

    pub fn with_batch_select_chunk(mut self, chunk: usize) -> Self {
        self.batch_select_chunk = chunk;
        self
    }

    /// Reject values no operation can work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 {
            return Err(ResourceError::invalid_request(
                "default page size must be positive",
            ));
        }
        if self.batch_select_chunk == 0 {
            return Err(ResourceError::invalid_request(
                "batch select chunk must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.table_name, "arcade");
        assert_eq!(config.transaction_retries, 2);
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.batch_select_chunk, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = StoreConfig::default()
            .with_table_name("regions")
            .with_transaction_retries(5)
            .with_default_page_size(0);
        assert_eq!(config.table_name, "regions");
        assert_eq!(config.transaction_retries, 5);
        assert!(config.validate().is_err());
    }
}
