//! Generic create/read/update/delete/list over any catalogued resource type.

use std::collections::BTreeMap;
use std::sync::Arc;

use arcade_db::schema::{ATTR_PK, ATTR_SK, ATTR_TYPE, KEY_ATTRIBUTES};
use arcade_db::{string_attr, Attributes, Condition, ItemKey, KvStore, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{Catalog, ResourceType};
use crate::config::StoreConfig;
use crate::defaults::KEY_DELIMITER;
use crate::error::{ResourceError, Result};
use crate::intersection::TagIntersection;
use crate::keys::{self, IS_LATEST_TAG, IS_LATEST_VALUE};
use crate::latest::{ordering_attributes, ordering_key, LatestPointerMaintainer};
use crate::lister::{group_by_id, ResourceLister};
use crate::tags::{self, TagUpdates, Tags};
use crate::transaction::{TransactionBuilder, TransactionExecutor};

const ATTR_ID: &str = "id";
const ATTR_CREATED_AT: &str = "createdAt";
const ATTR_CREATED_BY: &str = "createdBy";
const ATTR_UPDATED_AT: &str = "updatedAt";
const ATTR_UPDATED_BY: &str = "updatedBy";

const METADATA_ATTRIBUTES: [&str; 5] = [
    ATTR_ID,
    ATTR_CREATED_AT,
    ATTR_CREATED_BY,
    ATTR_UPDATED_AT,
    ATTR_UPDATED_BY,
];

/// A resource as callers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub fields: Attributes,
    pub tags: Tags,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    /// Latest child per versioned child type, keyed by type prefix
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub latest: BTreeMap<String, Resource>,
}

impl Resource {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        string_attr(&self.fields, name)
    }
}

/// Input to [`ResourceService::create`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewResource {
    #[serde(default)]
    pub fields: Attributes,
    #[serde(default)]
    pub tags: Tags,
}

impl NewResource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Input to [`ResourceService::update`].
///
/// A `null` field value removes the field; a `None` tag value removes the tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    #[serde(default)]
    pub fields: Attributes,
    #[serde(default)]
    pub tags: TagUpdates,
}

impl ResourceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn remove_field(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Value::Null);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), Some(value.into()));
        self
    }

    pub fn remove_tag(mut self, key: impl Into<String>) -> Self {
        self.tags.insert(key.into(), None);
        self
    }
}

/// Filters and pagination for [`ResourceService::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Every tag must match
    pub tags: Tags,
    /// Reserved (searchable) field values that must match
    pub fields: BTreeMap<String, String>,
    /// Only the latest child per parent
    pub latest_only: bool,
    /// Attach each resource's latest versioned children
    pub include_latest: bool,
    pub count: Option<usize>,
    pub token: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }

    pub fn include_latest(mut self) -> Self {
        self.include_latest = true;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePage {
    pub items: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Audit values stored on the canonical item.
struct Audit {
    created_at: String,
    created_by: String,
    updated_at: Option<String>,
    updated_by: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Tag value of a searchable field, when it has a scalar value.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn reserved_tags(resource_type: &ResourceType, fields: &Attributes) -> Tags {
    resource_type
        .reserved_fields
        .iter()
        .filter_map(|field| {
            fields
                .get(field)
                .and_then(scalar_string)
                .map(|value| (keys::reserved_tag_key(field), value))
        })
        .collect()
}

fn validate_field_names<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for name in names {
        if name.is_empty() {
            return Err(ResourceError::invalid_request("field names must not be empty"));
        }
        if KEY_ATTRIBUTES.contains(&name.as_str()) || METADATA_ATTRIBUTES.contains(&name.as_str())
        {
            return Err(ResourceError::invalid_request(format!(
                "field '{name}' is managed by the store"
            )));
        }
    }
    Ok(())
}

/// Tag keys sit between delimiters in index keys, so they cannot hold one.
fn validate_tag_key_delimiter(key: &str) -> Result<()> {
    if key.contains(KEY_DELIMITER) {
        return Err(ResourceError::invalid_request(format!(
            "tag key '{key}' must not contain '{KEY_DELIMITER}'"
        )));
    }
    Ok(())
}

fn validate_tag_keys<'a>(tag_keys: impl IntoIterator<Item = &'a String>) -> Result<()> {
    for key in tag_keys {
        if key.is_empty() {
            return Err(ResourceError::invalid_request("tag keys must not be empty"));
        }
        validate_tag_key_delimiter(key)?;
        if keys::is_reserved(key) {
            return Err(ResourceError::invalid_request(format!(
                "tag key '{key}' uses the reserved prefix"
            )));
        }
    }
    Ok(())
}

fn required_string(fields: &Attributes, name: &str) -> Result<String> {
    string_attr(fields, name)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ResourceError::invalid_request(format!("field '{name}' is required")))
}

fn parse_timestamp(item: &Attributes, name: &str) -> Result<Option<DateTime<Utc>>> {
    match string_attr(item, name) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                StoreError::validation(format!("attribute '{name}' is not a timestamp: {e}")).into()
            }),
    }
}

/// Rebuild a resource from the items of its partition.
///
/// `Ok(None)` when the canonical item is missing.
fn assemble(resource_type: &ResourceType, items: &[Attributes]) -> Result<Option<Resource>> {
    let canonical = items.iter().find(|item| {
        string_attr(item, ATTR_TYPE) == Some(resource_type.prefix.as_str())
            && string_attr(item, ATTR_PK).is_some()
            && string_attr(item, ATTR_PK) == string_attr(item, ATTR_SK)
    });
    let Some(canonical) = canonical else {
        return Ok(None);
    };

    let id = string_attr(canonical, ATTR_ID)
        .ok_or_else(|| StoreError::validation("canonical item has no 'id'"))?
        .to_string();
    let fields: Attributes = canonical
        .iter()
        .filter(|(name, _)| {
            !KEY_ATTRIBUTES.contains(&name.as_str()) && !METADATA_ATTRIBUTES.contains(&name.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut visible_tags = Tags::new();
    tags::assemble_tags(items, &mut visible_tags);

    let created_at = parse_timestamp(canonical, ATTR_CREATED_AT)?
        .ok_or_else(|| StoreError::validation(format!("resource '{id}' has no createdAt")))?;

    Ok(Some(Resource {
        created_by: string_attr(canonical, ATTR_CREATED_BY)
            .unwrap_or_default()
            .to_string(),
        updated_at: parse_timestamp(canonical, ATTR_UPDATED_AT)?,
        updated_by: string_attr(canonical, ATTR_UPDATED_BY).map(str::to_string),
        resource_type: resource_type.prefix.clone(),
        id,
        fields,
        tags: visible_tags,
        created_at,
        latest: BTreeMap::new(),
    }))
}

/// Resource store for every type in a [`Catalog`].
#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn KvStore>,
    catalog: Catalog,
    config: StoreConfig,
    executor: TransactionExecutor,
    lister: ResourceLister,
    intersection: TagIntersection,
    latest: LatestPointerMaintainer,
}

impl std::fmt::Debug for ResourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceService")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResourceService {
    /// Service over the built-in catalog.
    pub fn new(store: Arc<dyn KvStore>, config: StoreConfig) -> Result<Self> {
        Self::with_catalog(store, config, Catalog::builtin())
    }

    pub fn with_catalog(store: Arc<dyn KvStore>, config: StoreConfig, catalog: Catalog) -> Result<Self> {
        config.validate()?;
        info!(
            backend = store.backend_name(),
            types = catalog.types().count(),
            "Resource service ready"
        );
        Ok(Self {
            executor: TransactionExecutor::new(store.clone(), config.transaction_retries),
            lister: ResourceLister::new(store.clone(), config.batch_select_chunk),
            intersection: TagIntersection::new(store.clone()),
            latest: LatestPointerMaintainer::new(store.clone()),
            store,
            catalog,
            config,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn lister(&self) -> &ResourceLister {
        &self.lister
    }

    pub fn intersection(&self) -> &TagIntersection {
        &self.intersection
    }

    /// Canonical item for a resource.
    fn canonical_item(
        &self,
        resource_type: &ResourceType,
        id: &str,
        fields: &Attributes,
        audit: &Audit,
    ) -> Result<Attributes> {
        let key = keys::resource_key(&resource_type.prefix, id);
        let mut item = fields.clone();
        item.insert(ATTR_PK.to_string(), Value::from(key.as_str()));
        item.insert(ATTR_SK.to_string(), Value::from(key));
        item.insert(ATTR_TYPE.to_string(), Value::from(resource_type.prefix.as_str()));
        item.insert(ATTR_ID.to_string(), Value::from(id));
        item.insert(ATTR_CREATED_AT.to_string(), Value::from(audit.created_at.as_str()));
        item.insert(ATTR_CREATED_BY.to_string(), Value::from(audit.created_by.as_str()));
        if let Some(updated_at) = &audit.updated_at {
            item.insert(ATTR_UPDATED_AT.to_string(), Value::from(updated_at.as_str()));
        }
        if let Some(updated_by) = &audit.updated_by {
            item.insert(ATTR_UPDATED_BY.to_string(), Value::from(updated_by.as_str()));
        }
        if let Some(spec) = &resource_type.latest {
            let parent_id = required_string(fields, &spec.parent_field)?;
            let ordering = ordering_key(fields.get(&spec.ordering_field).ok_or_else(|| {
                ResourceError::invalid_request(format!("field '{}' is required", spec.ordering_field))
            })?)?;
            for (name, value) in ordering_attributes(&resource_type.prefix, spec, &parent_id, &ordering) {
                item.insert(name.to_string(), Value::from(value));
            }
        }
        Ok(item)
    }

    /// Create a resource with its tags, and return it as stored.
    pub async fn create(
        &self,
        type_prefix: &str,
        new: NewResource,
        created_by: &str,
    ) -> Result<Resource> {
        let resource_type = self.catalog.get(type_prefix)?;
        debug!(resource = %resource_type.name, created_by, "Creating resource");
        validate_field_names(new.fields.keys())?;
        validate_tag_keys(new.tags.keys())?;

        let mut fields = new.fields;
        if let Some(parent) = &resource_type.parent {
            let parent_id = required_string(&fields, &parent.field)?;
            let parent_resource = self.get(&parent.type_prefix, &parent_id).await?;
            for field in &resource_type.reserved_fields {
                if fields.contains_key(field) {
                    continue;
                }
                if let Some(value) = parent_resource.fields.get(field) {
                    fields.insert(field.clone(), value.clone());
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let owner_key = keys::resource_key(type_prefix, &id);
        let audit = Audit {
            created_at: timestamp(Utc::now()),
            created_by: created_by.to_string(),
            updated_at: None,
            updated_by: None,
        };
        let item = self.canonical_item(resource_type, &id, &fields, &audit)?;

        let mut all_tags = new.tags;
        all_tags.extend(reserved_tags(resource_type, &fields));

        let mut txn = TransactionBuilder::new();
        txn.put_if(item, Condition::NotExists)?;
        tags::add_tags(&all_tags, &owner_key, &mut txn)?;

        if let Some(spec) = &resource_type.latest {
            let parent_id = required_string(&fields, &spec.parent_field)?;
            let ordering = ordering_key(fields.get(&spec.ordering_field).unwrap_or(&Value::Null))?;
            self.latest
                .prepare_create(&mut txn, type_prefix, spec, &parent_id, &id, &ordering)
                .await?;
        }

        self.executor.execute(txn).await?;
        let saved = self.get(type_prefix, &id).await?;
        info!(resource = %resource_type.name, id = %saved.id, "Resource created");
        Ok(saved)
    }

    /// Fetch one resource.
    pub async fn get(&self, type_prefix: &str, id: &str) -> Result<Resource> {
        let resource_type = self.catalog.get(type_prefix)?;
        let items = self.lister.get_items(type_prefix, id).await?;
        assemble(resource_type, &items)?
            .ok_or_else(|| ResourceError::not_found(&resource_type.name, id))
    }

    /// Apply field and tag changes, and return the resource as stored.
    ///
    /// Fields that place the resource in its hierarchy cannot change.
    pub async fn update(
        &self,
        type_prefix: &str,
        id: &str,
        update: ResourceUpdate,
        updated_by: &str,
    ) -> Result<Resource> {
        let resource_type = self.catalog.get(type_prefix)?;
        debug!(resource = %resource_type.name, id, updated_by, "Updating resource");
        validate_field_names(update.fields.keys())?;
        validate_tag_keys(update.tags.keys())?;

        let items = self.lister.get_items(type_prefix, id).await?;
        let existing = assemble(resource_type, &items)?
            .ok_or_else(|| ResourceError::not_found(&resource_type.name, id))?;

        let mut fixed: Vec<&str> = Vec::new();
        if let Some(parent) = &resource_type.parent {
            fixed.push(&parent.field);
        }
        if let Some(spec) = &resource_type.latest {
            fixed.push(&spec.parent_field);
            fixed.push(&spec.ordering_field);
        }
        for name in fixed {
            if let Some(value) = update.fields.get(name) {
                if existing.fields.get(name) != Some(value) {
                    return Err(ResourceError::invalid_request(format!(
                        "field '{name}' cannot be changed"
                    )));
                }
            }
        }

        let mut fields = existing.fields.clone();
        for (name, value) in update.fields {
            if value.is_null() {
                fields.remove(&name);
            } else {
                fields.insert(name, value);
            }
        }

        let mut delta = tags::diff(&existing.tags, &update.tags);
        for field in &resource_type.reserved_fields {
            let before = existing.fields.get(field).and_then(scalar_string);
            let after = fields.get(field).and_then(scalar_string);
            if before == after {
                continue;
            }
            let tag_key = keys::reserved_tag_key(field);
            match after {
                Some(value) => {
                    delta.to_put.insert(tag_key, value);
                }
                None => delta.to_delete.push(tag_key),
            }
        }

        let audit = Audit {
            created_at: timestamp(existing.created_at),
            created_by: existing.created_by.clone(),
            updated_at: Some(timestamp(Utc::now())),
            updated_by: Some(updated_by.to_string()),
        };
        let mut txn = TransactionBuilder::new();
        txn.put_if(
            self.canonical_item(resource_type, id, &fields, &audit)?,
            Condition::Exists,
        )?;
        txn.extend(tags::diff_and_write(
            id,
            type_prefix,
            &delta.to_put,
            &delta.to_delete,
        ))?;

        self.executor.execute(txn).await?;
        let saved = self.get(type_prefix, id).await?;
        info!(resource = %resource_type.name, id, "Resource updated");
        Ok(saved)
    }

    /// Delete a resource, its tags, and repoint the latest child if needed.
    ///
    /// A resource that still has children cannot be deleted.
    pub async fn delete(&self, type_prefix: &str, id: &str) -> Result<()> {
        let resource_type = self.catalog.get(type_prefix)?;
        debug!(resource = %resource_type.name, id, "Deleting resource");

        let items = self.lister.get_items(type_prefix, id).await?;
        let existing = assemble(resource_type, &items)?
            .ok_or_else(|| ResourceError::not_found(&resource_type.name, id))?;
        self.ensure_no_children(resource_type, id).await?;

        let mut txn = TransactionBuilder::new();
        for item in &items {
            txn.delete(ItemKey::of(item)?);
        }
        if let Some(spec) = &resource_type.latest {
            let parent_id = required_string(&existing.fields, &spec.parent_field)?;
            self.latest
                .prepare_delete(&mut txn, type_prefix, spec, &parent_id, id)
                .await?;
        }

        self.executor.execute(txn).await?;
        info!(resource = %resource_type.name, id, "Resource deleted");
        Ok(())
    }

    async fn ensure_no_children(&self, resource_type: &ResourceType, id: &str) -> Result<()> {
        for (child, field) in self.catalog.children_of(&resource_type.prefix) {
            let (found, _) = self
                .intersection
                .by_tag(&keys::reserved_tag_key(field), id, &child.prefix, 1, None)
                .await?;
            if !found.is_empty() {
                debug!(resource = %resource_type.name, id, child = %child.name, "Delete blocked by children");
                return Err(ResourceError::invalid_state(format!(
                    "{} '{id}' still has {} children",
                    resource_type.name, child.name
                )));
            }
        }
        Ok(())
    }

    /// One page of resources, optionally filtered by tags and searchable fields.
    pub async fn list(&self, type_prefix: &str, options: ListOptions) -> Result<ResourcePage> {
        let resource_type = self.catalog.get(type_prefix)?;
        let count = options.count.unwrap_or(self.config.default_page_size);
        if count == 0 {
            return Err(ResourceError::invalid_request("count must be positive"));
        }

        for key in options.tags.keys() {
            validate_tag_key_delimiter(key)?;
        }
        let versioned: Vec<&ResourceType> = if options.include_latest {
            let versioned: Vec<_> = self.catalog.latest_children_of(type_prefix).collect();
            if versioned.is_empty() {
                return Err(ResourceError::invalid_request(format!(
                    "{} has no versioned children",
                    resource_type.name
                )));
            }
            versioned
        } else {
            Vec::new()
        };

        let mut filters = options.tags;
        for (field, value) in options.fields {
            if !resource_type.is_reserved_field(&field) {
                return Err(ResourceError::invalid_request(format!(
                    "{} cannot be filtered by '{field}'",
                    resource_type.name
                )));
            }
            filters.insert(keys::reserved_tag_key(&field), value);
        }
        if options.latest_only {
            if resource_type.latest.is_none() {
                return Err(ResourceError::invalid_request(format!(
                    "{} has no latest version",
                    resource_type.name
                )));
            }
            filters.insert(IS_LATEST_TAG.to_string(), IS_LATEST_VALUE.to_string());
        }
        debug!(
            resource = %resource_type.name,
            filters = filters.len(),
            count,
            token = ?options.token,
            "Listing resources"
        );

        let token = options.token.as_deref();
        let (ids, next_token) = if filters.is_empty() {
            self.lister
                .list_resource_ids(type_prefix, count, token)
                .await?
        } else {
            self.intersection
                .by_tags(&filters, type_prefix, count, token)
                .await?
        };

        let items = self.lister.list_items_by_ids(type_prefix, &ids).await?;
        let mut resources = Vec::with_capacity(ids.len());
        for (_, items) in group_by_id(type_prefix, &ids, items) {
            if let Some(mut resource) = assemble(resource_type, &items)? {
                for child in &versioned {
                    if let Some(newest) = self.latest(&child.prefix, &resource.id).await? {
                        resource.latest.insert(child.prefix.clone(), newest);
                    }
                }
                resources.push(resource);
            }
        }

        Ok(ResourcePage {
            items: resources,
            next_token,
        })
    }

    /// Latest child of `type_prefix` under a parent, if any.
    pub async fn latest(&self, type_prefix: &str, parent_id: &str) -> Result<Option<Resource>> {
        let resource_type = self.catalog.get(type_prefix)?;
        let spec = resource_type.latest.as_ref().ok_or_else(|| {
            ResourceError::invalid_request(format!("{} has no latest version", resource_type.name))
        })?;
        match self.latest.current(type_prefix, spec, parent_id).await? {
            Some(pointer) => self.get(type_prefix, &pointer.child_id).await.map(Some),
            None => Ok(None),
        }
    }
}
