//! Canonical default values shared by the library and the CLI.

pub const DEFAULT_STORE_URL: &str = "sqlite:arcade.sqlite";
pub const DEFAULT_TABLE_NAME: &str = "arcade";
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 2;
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_BATCH_SELECT_CHUNK: usize = 50;

/// Prefix marking tags derived from a resource's own fields.
pub const RESERVED_PREFIX: &str = "___";

/// Separator between the parts of a composite key.
pub const KEY_DELIMITER: char = ':';
