//! Subcommand implementations.

mod args;

use std::sync::Arc;

use anyhow::{Context, Result};
use arcade_db::{open_store, KvStore, StoreUrl};
use arcade_resources::{ListOptions, NewResource, ResourceService, ResourceUpdate, StoreConfig};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{Cli, Commands};

pub async fn run(cli: Cli) -> Result<()> {
    let url = StoreUrl::parse(&cli.store).with_context(|| format!("Invalid store '{}'", cli.store))?;
    let store: Arc<dyn KvStore> = open_store(&url, &cli.table)
        .await
        .with_context(|| format!("Failed to open store {url}"))?;
    info!(store = %url, table = %cli.table, "Store opened");

    let config = StoreConfig::default()
        .with_table_name(cli.table.as_str())
        .with_transaction_retries(cli.retries);
    let service = ResourceService::new(store, config).context("Failed to start resource service")?;

    match cli.command {
        Commands::Types => {
            let types: Vec<_> = service
                .catalog()
                .types()
                .map(|t| {
                    json!({
                        "prefix": t.prefix,
                        "name": t.name,
                        "searchableFields": t.reserved_fields,
                        "parent": t.parent.as_ref().map(|p| json!({ "type": p.type_prefix, "field": p.field })),
                        "latestBy": t.latest.as_ref().map(|l| l.ordering_field.clone()),
                    })
                })
                .collect();
            print_json(&types)
        }
        Commands::Create {
            resource_type,
            fields,
            tags,
            user,
        } => {
            let prefix = resolve(&service, &resource_type)?;
            let mut new = NewResource::new();
            for (name, value) in args::parse_fields(&fields)? {
                new = new.with_field(name, value);
            }
            for (key, value) in arcade_resources::tags::expand_tag_pairs(&tags)? {
                new = new.with_tag(key, value);
            }
            let created = service
                .create(&prefix, new, &user)
                .await
                .with_context(|| format!("Failed to create {resource_type}"))?;
            print_json(&created)
        }
        Commands::Get { resource_type, id } => {
            let prefix = resolve(&service, &resource_type)?;
            let resource = service.get(&prefix, &id).await?;
            print_json(&resource)
        }
        Commands::Update {
            resource_type,
            id,
            fields,
            remove_fields,
            tags,
            remove_tags,
            user,
        } => {
            let prefix = resolve(&service, &resource_type)?;
            let mut update = ResourceUpdate::new();
            for (name, value) in args::parse_fields(&fields)? {
                update = update.with_field(name, value);
            }
            for name in remove_fields {
                update = update.remove_field(name);
            }
            for (key, value) in arcade_resources::tags::expand_tag_pairs(&tags)? {
                update = update.with_tag(key, value);
            }
            for key in remove_tags {
                update = update.remove_tag(key);
            }
            let updated = service
                .update(&prefix, &id, update, &user)
                .await
                .with_context(|| format!("Failed to update {resource_type} {id}"))?;
            print_json(&updated)
        }
        Commands::Delete { resource_type, id } => {
            let prefix = resolve(&service, &resource_type)?;
            service
                .delete(&prefix, &id)
                .await
                .with_context(|| format!("Failed to delete {resource_type} {id}"))?;
            print_json(&json!({ "deleted": id }))
        }
        Commands::List {
            resource_type,
            tags,
            fields,
            latest,
            include_latest,
            count,
            token,
        } => {
            let prefix = resolve(&service, &resource_type)?;
            let mut options = ListOptions::new().with_count(count).with_token(token);
            for (key, value) in arcade_resources::tags::expand_tag_pairs(&tags)? {
                options = options.with_tag(key, value);
            }
            for raw in &fields {
                let (name, value) = args::split_assignment(raw)?;
                options = options.with_field(name, value);
            }
            if latest {
                options = options.latest_only();
            }
            if include_latest {
                options = options.include_latest();
            }
            let page = service.list(&prefix, options).await?;
            print_json(&page)
        }
        Commands::Latest {
            resource_type,
            parent_id,
        } => {
            let prefix = resolve(&service, &resource_type)?;
            let latest = service.latest(&prefix, &parent_id).await?;
            print_json(&latest)
        }
    }
}

fn resolve(service: &ResourceService, name_or_prefix: &str) -> Result<String> {
    Ok(service.catalog().resolve(name_or_prefix)?.prefix.clone())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}
