//! Table schema constants
//!
//! Every resource, tag and pointer lives in one table. The attribute names
//! below are the only ones the storage layer interprets; everything else in
//! an item is opaque.
//!
//! ## Table Schema
//!
//! ```text
//! Primary Key:
//!   - pk (String, Partition Key): owning resource, e.g. "s:01h..."
//!   - sk (String, Sort Key): item within the partition, e.g. "s:01h..." or "tk:crop"
//!
//! Index attributes (all optional, all String):
//!   - type:   item kind, hash key of type-sk-index
//!   - siKey1: tag reverse-lookup key, hash key of siKey1-pk-index
//!   - siKey2: parent key, hash key of siKey2-siKey3-index
//!   - siKey3: ordering value, range key of siKey2-siKey3-index
//! ```

use std::fmt;

/// Partition key attribute
pub const ATTR_PK: &str = "pk";

/// Sort key attribute
pub const ATTR_SK: &str = "sk";

/// Item kind attribute (hash key of `type-sk-index`)
pub const ATTR_TYPE: &str = "type";

/// Tag reverse-lookup attribute (hash key of `siKey1-pk-index`)
pub const ATTR_SI_KEY1: &str = "siKey1";

/// Parent attribute (hash key of `siKey2-siKey3-index`)
pub const ATTR_SI_KEY2: &str = "siKey2";

/// Ordering attribute (range key of `siKey2-siKey3-index`)
pub const ATTR_SI_KEY3: &str = "siKey3";

/// Upper bound on operations in one transactional write
pub const MAX_TRANSACTION_ITEMS: usize = 100;

/// All attributes with a storage meaning, in column order.
pub const KEY_ATTRIBUTES: [&str; 6] = [
    ATTR_PK,
    ATTR_SK,
    ATTR_TYPE,
    ATTR_SI_KEY1,
    ATTR_SI_KEY2,
    ATTR_SI_KEY3,
];

/// Named secondary indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    /// `siKey1-pk-index`: which partitions carry a given tag value
    TagValue,
    /// `type-sk-index`: every item of a kind, ordered by sort key
    TypeSort,
    /// `siKey2-siKey3-index`: children of a parent ordered by ordering value
    ParentOrder,
}

impl Index {
    pub fn name(&self) -> &'static str {
        match self {
            Index::TagValue => "siKey1-pk-index",
            Index::TypeSort => "type-sk-index",
            Index::ParentOrder => "siKey2-siKey3-index",
        }
    }

    /// Attribute holding the index hash key.
    pub fn hash_attr(&self) -> &'static str {
        match self {
            Index::TagValue => ATTR_SI_KEY1,
            Index::TypeSort => ATTR_TYPE,
            Index::ParentOrder => ATTR_SI_KEY2,
        }
    }

    /// Attribute holding the index range key.
    pub fn range_attr(&self) -> &'static str {
        match self {
            Index::TagValue => ATTR_PK,
            Index::TypeSort => ATTR_SK,
            Index::ParentOrder => ATTR_SI_KEY3,
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validate a table name before it is spliced into SQL.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, at most 64 characters.
pub fn validate_table_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Table name is empty".to_string());
    }
    if name.len() > 64 {
        return Err(format!("Table name longer than 64 characters: {}", name));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("Table name contains invalid characters: {}", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_attributes() {
        assert_eq!(Index::TagValue.hash_attr(), "siKey1");
        assert_eq!(Index::TagValue.range_attr(), "pk");
        assert_eq!(Index::ParentOrder.name(), "siKey2-siKey3-index");
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("arcade").is_ok());
        assert!(validate_table_name("_arcade_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2arcade").is_err());
        assert!(validate_table_name("arcade; DROP TABLE x").is_err());
        assert!(validate_table_name("arc\"ade").is_err());
        assert!(validate_table_name(&"a".repeat(65)).is_err());
    }
}
