//! Derived collections: named, filtered and sorted views over documents.
//!
//! ```toml
//! [[collections]]
//! name = "posts"
//! filter = "draft != true and 'post' in tags"
//! sort = "date desc, title"
//! limit = 10
//! ```
//!
//! Expressions are parsed during `configure`, so a typo fails the build
//! before any file is read. The collections are evaluated once in
//! `post_render` over every loaded document (skipped ones included, failed
//! ones excluded) and published as the context attribute `collections`:
//!
//! ```json
//! { "posts": [ { "slug": "hello", "url": "/hello/", "title": "Hello", ... } ] }
//! ```

use crate::config::{ConfigField, ConfigSnapshot};
use crate::context::BuildContext;
use crate::document::{Document, ValueKind};
use crate::expr::{Expr, SortSpec};
use crate::hooks::{Hook, HookError, Plugin, Stage};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A collection with its expressions parsed.
#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub filter: Option<Expr>,
    pub sort: SortSpec,
    pub limit: Option<usize>,
}

impl Collection {
    pub fn compile(spec: &CollectionSpec) -> Result<Self, HookError> {
        let filter = spec.filter.as_deref().map(Expr::parse).transpose()?;
        let sort = match spec.sort.as_deref() {
            Some(text) => SortSpec::parse(text)?,
            None => SortSpec::default(),
        };
        Ok(Self {
            name: spec.name.clone(),
            filter,
            sort,
            limit: spec.limit,
        })
    }
}

/// Parse every `[[collections]]` entry.
pub fn compile_all(config: &ConfigSnapshot) -> Result<Vec<Collection>, HookError> {
    let specs = config
        .get_as::<Vec<CollectionSpec>>("collections")?
        .unwrap_or_default();
    let mut seen = std::collections::BTreeSet::new();
    specs
        .iter()
        .map(|spec| {
            if !seen.insert(spec.name.as_str()) {
                return Err(HookError::msg(format!(
                    "collection `{}` is defined twice",
                    spec.name
                )));
            }
            Collection::compile(spec)
        })
        .collect()
}

pub struct Collections;

impl Plugin for Collections {
    fn id(&self) -> &str {
        "collections"
    }

    fn hooks(&self) -> Vec<Hook> {
        vec![
            Hook::context(Stage::Configure, |ctx| {
                let collections = compile_all(ctx.config())?;
                tracing::debug!(count = collections.len(), "collections configured");
                Ok(())
            }),
            Hook::context(Stage::PostRender, publish).produces(["collections"]),
        ]
    }

    fn config_model(&self) -> Vec<ConfigField> {
        vec![ConfigField::optional("collections", ValueKind::List)]
    }
}

fn publish(ctx: &mut BuildContext) -> Result<(), HookError> {
    let collections = compile_all(ctx.config())?;
    let base_url = ctx.config().core().site.base_url.trim_end_matches('/').to_string();
    let mut published = Map::new();
    for collection in &collections {
        let entries: Vec<Value> = ctx
            .select(collection.filter.as_ref(), &collection.sort, collection.limit)
            .into_iter()
            .map(|doc| entry(doc, &base_url))
            .collect();
        tracing::debug!(name = %collection.name, entries = entries.len(), "collection built");
        published.insert(collection.name.clone(), Value::Array(entries));
    }
    ctx.set_attr("collections", Value::Object(published));
    Ok(())
}

/// A document's listing entry: its front matter plus identity fields.
fn entry(doc: &Document, base_url: &str) -> Value {
    let mut map = doc.front_matter().clone();
    let url = if doc.slug().is_empty() {
        format!("{base_url}/")
    } else {
        format!("{base_url}/{}/", doc.slug())
    };
    map.insert("slug".into(), doc.slug().into());
    map.insert(
        "path".into(),
        doc.path().to_string_lossy().replace('\\', "/").into(),
    );
    map.insert("title".into(), doc.title().into());
    map.insert("url".into(), url.into());
    Value::Object(map)
}
