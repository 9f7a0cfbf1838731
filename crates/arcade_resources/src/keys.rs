//! Composite key encoding.
//!
//! Keys are a type prefix followed by parts, joined with [`KEY_DELIMITER`]:
//!
//! ```text
//! resource      s:<id>
//! tag sort key  tk:<key>
//! tag index     tk:<key>:tv:<value>
//! pointer       s:___latest
//! ```
//!
//! Parts must not contain the delimiter. [`decode`] splits on every
//! delimiter, so such a key does not round-trip; [`decode_id`] only splits
//! once and is safe for `type:id` keys whatever the id holds.

use crate::defaults::{KEY_DELIMITER, RESERVED_PREFIX};

/// Item kind of tag items, and the prefix of their sort keys.
pub const TAG_KEY: &str = "tk";

/// Marker between tag key and value inside the tag index key.
pub const TAG_VALUE: &str = "tv";

/// Item kind of latest-version pointer items.
pub const LATEST_POINTER: &str = "ps";

/// Sort key suffix of a pointer item.
pub const LATEST_MARKER: &str = "___latest";

/// Reserved tag carried by the current latest child.
pub const IS_LATEST_TAG: &str = "___isLatest";

/// Value of [`IS_LATEST_TAG`].
pub const IS_LATEST_VALUE: &str = "true";

/// Join a prefix and parts into one key.
pub fn encode(prefix: &str, parts: &[&str]) -> String {
    let capacity = prefix.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>();
    let mut key = String::with_capacity(capacity);
    key.push_str(prefix);
    for part in parts {
        key.push(KEY_DELIMITER);
        key.push_str(part);
    }
    key
}

/// Prefix matching every key built from `prefix`.
pub fn encode_prefix(prefix: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + 1);
    key.push_str(prefix);
    key.push(KEY_DELIMITER);
    key
}

/// Split a key back into its prefix and parts.
pub fn decode(key: &str) -> Vec<&str> {
    key.split(KEY_DELIMITER).collect()
}

/// Id part of a `type:id` key.
pub fn decode_id(key: &str) -> Option<&str> {
    key.split_once(KEY_DELIMITER).map(|(_, id)| id)
}

/// Partition key of a resource.
pub fn resource_key(type_prefix: &str, id: &str) -> String {
    encode(type_prefix, &[id])
}

/// Sort key of a tag item.
pub fn tag_sort_key(tag_key: &str) -> String {
    encode(TAG_KEY, &[tag_key])
}

/// Reverse-lookup key of a tag value.
pub fn tag_index_key(tag_key: &str, tag_value: &str) -> String {
    encode(TAG_KEY, &[tag_key, TAG_VALUE, tag_value])
}

/// Tag key under which a searchable field is stored.
pub fn reserved_tag_key(field: &str) -> String {
    format!("{RESERVED_PREFIX}{field}")
}

pub fn is_reserved(tag_key: &str) -> bool {
    tag_key.starts_with(RESERVED_PREFIX)
}

/// Sort key of the latest-version pointer for children of `child_type`.
pub fn latest_pointer_sort_key(child_type: &str) -> String {
    encode(child_type, &[LATEST_MARKER])
}
