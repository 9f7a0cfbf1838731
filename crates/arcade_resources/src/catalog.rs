//! Resource types the store knows how to persist.

use std::collections::BTreeMap;

use crate::defaults::KEY_DELIMITER;
use crate::error::{ResourceError, Result};
use crate::keys::{LATEST_POINTER, TAG_KEY, TAG_VALUE};

/// Item kinds used internally; no resource type may claim them.
pub const INTERNAL_PREFIXES: [&str; 3] = [LATEST_POINTER, TAG_KEY, TAG_VALUE];

/// Parent of a resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentSpec {
    /// Type prefix of the parent
    pub type_prefix: String,
    /// Field of the child holding the parent id
    pub field: String,
}

/// How to pick the latest child per parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestSpec {
    pub parent_type: String,
    /// Field of the child holding the parent id
    pub parent_field: String,
    /// RFC 3339 timestamp field ordering children
    pub ordering_field: String,
}

/// One resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    /// Key prefix, e.g. `s`
    pub prefix: String,
    /// Display name, e.g. `State`
    pub name: String,
    /// Fields also stored as reserved tags so they can be filtered on
    pub reserved_fields: Vec<String>,
    pub parent: Option<ParentSpec>,
    pub latest: Option<LatestSpec>,
}

impl ResourceType {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            reserved_fields: Vec::new(),
            parent: None,
            latest: None,
        }
    }

    pub fn with_reserved_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, type_prefix: impl Into<String>, field: impl Into<String>) -> Self {
        self.parent = Some(ParentSpec {
            type_prefix: type_prefix.into(),
            field: field.into(),
        });
        self
    }

    /// Track the latest child per parent, ordered by `ordering_field`.
    pub fn with_latest(
        mut self,
        parent_type: impl Into<String>,
        parent_field: impl Into<String>,
        ordering_field: impl Into<String>,
    ) -> Self {
        self.latest = Some(LatestSpec {
            parent_type: parent_type.into(),
            parent_field: parent_field.into(),
            ordering_field: ordering_field.into(),
        });
        self
    }

    pub fn is_reserved_field(&self, field: &str) -> bool {
        self.reserved_fields.iter().any(|f| f == field)
    }

    fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || !self.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ResourceError::invalid_request(format!(
                "resource type prefix '{}' must be non-empty and alphanumeric",
                self.prefix
            )));
        }
        if INTERNAL_PREFIXES.contains(&self.prefix.as_str()) {
            return Err(ResourceError::invalid_request(format!(
                "resource type prefix '{}' is reserved",
                self.prefix
            )));
        }
        if let Some(field) = self.reserved_fields.iter().find(|f| f.contains(KEY_DELIMITER)) {
            return Err(ResourceError::invalid_request(format!(
                "searchable field '{field}' of '{}' contains '{KEY_DELIMITER}'",
                self.name
            )));
        }
        // Children are found through the reserved tag of their parent field.
        let parent_fields = self
            .parent
            .iter()
            .map(|p| &p.field)
            .chain(self.latest.iter().map(|l| &l.parent_field));
        for field in parent_fields {
            if !self.is_reserved_field(field) {
                return Err(ResourceError::invalid_request(format!(
                    "parent field '{field}' of '{}' must be searchable",
                    self.name
                )));
            }
        }
        if let Some(latest) = &self.latest {
            if latest.parent_field == latest.ordering_field {
                return Err(ResourceError::invalid_request(format!(
                    "resource type '{}' orders latest children by its parent field",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Registry of resource types by prefix.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    types: BTreeMap<String, ResourceType>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups, regions, polygons and their states.
    ///
    /// States are versioned per polygon: the most recent `timestamp` is the
    /// polygon's latest state.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        let types = [
            ResourceType::new("g", "Group").with_reserved_fields(["name"]),
            ResourceType::new("r", "Region")
                .with_reserved_fields(["name", "groupId"])
                .with_parent("g", "groupId"),
            ResourceType::new("p", "Polygon")
                .with_reserved_fields(["name", "groupId", "regionId"])
                .with_parent("r", "regionId"),
            ResourceType::new("s", "State")
                .with_reserved_fields(["groupId", "regionId", "polygonId"])
                .with_parent("p", "polygonId")
                .with_latest("p", "polygonId", "timestamp"),
        ];
        for resource_type in types {
            catalog.types.insert(resource_type.prefix.clone(), resource_type);
        }
        catalog
    }

    /// Add or replace a type.
    pub fn register(&mut self, resource_type: ResourceType) -> Result<()> {
        resource_type.validate()?;
        self.types
            .insert(resource_type.prefix.clone(), resource_type);
        Ok(())
    }

    /// Look up a type by prefix.
    pub fn get(&self, prefix: &str) -> Result<&ResourceType> {
        self.types.get(prefix).ok_or_else(|| {
            ResourceError::invalid_request(format!("unknown resource type '{prefix}'"))
        })
    }

    /// Look up a type by prefix or by case-insensitive display name.
    pub fn resolve(&self, name_or_prefix: &str) -> Result<&ResourceType> {
        if let Some(resource_type) = self.types.get(name_or_prefix) {
            return Ok(resource_type);
        }
        self.types
            .values()
            .find(|t| t.name.eq_ignore_ascii_case(name_or_prefix))
            .ok_or_else(|| {
                ResourceError::invalid_request(format!("unknown resource type '{name_or_prefix}'"))
            })
    }

    pub fn types(&self) -> impl Iterator<Item = &ResourceType> {
        self.types.values()
    }

    /// Types that can hang off a `prefix` resource, each with the field
    /// holding the parent id.
    pub fn children_of(&self, prefix: &str) -> Vec<(&ResourceType, &str)> {
        let mut children: Vec<(&ResourceType, &str)> = Vec::new();
        for child in self.types.values() {
            let links = child
                .parent
                .iter()
                .filter(|p| p.type_prefix == prefix)
                .map(|p| p.field.as_str())
                .chain(
                    child
                        .latest
                        .iter()
                        .filter(|l| l.parent_type == prefix)
                        .map(|l| l.parent_field.as_str()),
                );
            for field in links {
                if !children.iter().any(|(t, f)| t.prefix == child.prefix && *f == field) {
                    children.push((child, field));
                }
            }
        }
        children
    }

    /// Types versioned per `prefix` parent.
    pub fn latest_children_of<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a ResourceType> + 'a {
        self.types
            .values()
            .filter(move |t| t.latest.as_ref().is_some_and(|l| l.parent_type == prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = Catalog::builtin();
        let state = catalog.get("s").unwrap();
        assert_eq!(state.name, "State");
        assert!(state.is_reserved_field("polygonId"));
        let latest = state.latest.as_ref().unwrap();
        assert_eq!(latest.parent_type, "p");
        assert_eq!(latest.ordering_field, "timestamp");
        assert_eq!(catalog.resolve("polygon").unwrap().prefix, "p");
        assert!(catalog.get("x").is_err());
    }

    #[test]
    fn test_register_rejects_internal_prefixes() {
        let mut catalog = Catalog::new();
        assert!(catalog.register(ResourceType::new("tk", "Tag")).is_err());
        assert!(catalog.register(ResourceType::new("a:b", "Bad")).is_err());
        assert!(catalog.register(ResourceType::new("t", "Task")).is_ok());
        assert_eq!(catalog.types().count(), 1);
    }

    #[test]
    fn test_register_requires_searchable_parent_field() {
        let mut catalog = Catalog::new();
        let hidden_parent = ResourceType::new("n", "Note").with_parent("g", "groupId");
        assert!(catalog.register(hidden_parent).is_err());
        let bad_field = ResourceType::new("n", "Note").with_reserved_fields(["a:b"]);
        assert!(catalog.register(bad_field).is_err());
        let note = ResourceType::new("n", "Note")
            .with_reserved_fields(["groupId"])
            .with_parent("g", "groupId");
        assert!(catalog.register(note).is_ok());
    }

    #[test]
    fn test_children_of() {
        let catalog = Catalog::builtin();
        let children: Vec<(&str, &str)> = catalog
            .children_of("p")
            .into_iter()
            .map(|(t, f)| (t.prefix.as_str(), f))
            .collect();
        assert_eq!(children, vec![("s", "polygonId")]);
        let groups: Vec<&str> = catalog.children_of("g").iter().map(|(t, _)| t.prefix.as_str()).collect();
        assert_eq!(groups, vec!["r"]);
        assert!(catalog.children_of("s").is_empty());

        let versioned: Vec<&str> = catalog.latest_children_of("p").map(|t| t.prefix.as_str()).collect();
        assert_eq!(versioned, vec!["s"]);
        assert_eq!(catalog.latest_children_of("r").count(), 0);
    }
}
