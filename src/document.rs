//! The in-memory record of one source file.
//!
//! A [`Document`] is created by the load stage and accretes attributes as it
//! moves through the pipeline:
//!
//! ```text
//! load         path, slug, front matter, raw content, body, content hash, skip
//! render       html
//! post_render  description, page
//! ```
//!
//! Identity (`path`), `raw_content` and the content hash are fixed at load
//! time and have no setters. Derived attributes go through
//! [`Document::set`], which records the stage that first wrote each one; a
//! stage may not overwrite an attribute owned by a later stage.
//!
//! ## Schema composition
//!
//! Plugins describe the front-matter fields they rely on with [`FieldSpec`]
//! fragments. The runner composes them into one [`AttributeSchema`] during
//! `configure` and validates every document against it at load.

use crate::hooks::Stage;
use gray_matter::Matter;
use gray_matter::engine::YAML;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not valid UTF-8")]
    Encoding(PathBuf),
    #[error("invalid front matter in {path}: {reason}")]
    FrontMatter { path: PathBuf, reason: String },
    #[error("{path}: missing required field `{field}`")]
    MissingField { path: PathBuf, field: String },
    #[error("{path}: field `{field}` should be {expected}")]
    FieldType {
        path: PathBuf,
        field: String,
        expected: ValueKind,
    },
    #[error("{path}: slug `{slug}` must be relative `/`-separated names without `.` or `..`")]
    InvalidSlug { path: PathBuf, slug: String },
    #[error("{path}: no render backend named `{renderer}`")]
    UnknownRenderer { path: PathBuf, renderer: String },
    #[error("attribute `{0}` is owned by the core and cannot be set")]
    Reserved(String),
    #[error("attribute `{field}` is owned by stage {owner} and cannot be written from {stage}")]
    Ownership {
        field: String,
        owner: Stage,
        stage: Stage,
    },
    #[error("field `{field}` declared as {first} by {first_plugin} and as {second} by {second_plugin}")]
    SchemaConflict {
        field: String,
        first: ValueKind,
        first_plugin: String,
        second: ValueKind,
        second_plugin: String,
    },
}

/// Attribute names the core provides on every document.
pub const CORE_ATTRIBUTES: &[&str] = &[
    "path",
    "slug",
    "raw_content",
    "body",
    "content_hash",
    "front_matter",
    "skip",
];

// =============================================================================
// Value kinds
// =============================================================================

/// The shape a config key or front-matter field is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Any,
    String,
    Integer,
    Number,
    Bool,
    /// A string that parses as `YYYY-MM-DD` or RFC 3339.
    Date,
    List,
    Map,
}

impl ValueKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::String => value.is_string(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Number => value.is_number(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Date => value
                .as_str()
                .is_some_and(|s| crate::expr::parse_date(s).is_some()),
            ValueKind::List => value.is_array(),
            ValueKind::Map => value.is_object(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Any => "any value",
            ValueKind::String => "a string",
            ValueKind::Integer => "an integer",
            ValueKind::Number => "a number",
            ValueKind::Bool => "a boolean",
            ValueKind::Date => "a date",
            ValueKind::List => "a list",
            ValueKind::Map => "a table",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// A front-matter field a plugin expects documents to carry.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }

    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }
}

/// Composed front-matter schema: field name → spec and declaring plugin.
#[derive(Debug, Clone, Default)]
pub struct AttributeSchema {
    fields: BTreeMap<String, (FieldSpec, String)>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin's field. Two plugins may declare the same field only with
    /// the same kind; `required` is sticky.
    pub fn register(&mut self, plugin: &str, spec: FieldSpec) -> Result<(), DocumentError> {
        match self.fields.get_mut(&spec.name) {
            Some((existing, owner)) => {
                if existing.kind != spec.kind && existing.kind != ValueKind::Any {
                    return Err(DocumentError::SchemaConflict {
                        field: spec.name,
                        first: existing.kind,
                        first_plugin: owner.clone(),
                        second: spec.kind,
                        second_plugin: plugin.to_string(),
                    });
                }
                existing.kind = spec.kind;
                existing.required |= spec.required;
            }
            None => {
                self.fields
                    .insert(spec.name.clone(), (spec, plugin.to_string()));
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check a document's front matter against every declared field.
    pub fn validate(&self, doc: &Document) -> Result<(), DocumentError> {
        for (spec, _) in self.fields.values() {
            match doc.front_matter.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(DocumentError::MissingField {
                        path: doc.path.clone(),
                        field: spec.name.clone(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(DocumentError::FieldType {
                        path: doc.path.clone(),
                        field: spec.name.clone(),
                        expected: spec.kind,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Field {
    value: Value,
    owner: Stage,
}

/// One source file's evolving record.
#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    slug: String,
    front_matter: Map<String, Value>,
    raw_content: Arc<str>,
    body: Arc<str>,
    content_hash: String,
    fields: BTreeMap<String, Field>,
    stage: Stage,
    failure: Option<String>,
    /// Hooks of the current stage that finished with this document.
    hooks_done: usize,
    /// Set by the skip engine when a previous build already produced this
    /// document's output. Expensive per-document hooks return early.
    pub skip: bool,
}

impl Document {
    /// Read `root/rel` and split off its YAML front matter.
    pub fn load(root: &Path, rel: &Path) -> Result<Self, DocumentError> {
        let full = root.join(rel);
        let bytes = std::fs::read(&full).map_err(|source| DocumentError::Io {
            path: rel.to_path_buf(),
            source,
        })?;
        let content_hash = crate::skip::content_hash(&bytes);
        let text = String::from_utf8(bytes).map_err(|_| DocumentError::Encoding(rel.to_path_buf()))?;
        Self::from_source(rel, text, content_hash)
    }

    /// Build a document from in-memory source text.
    pub fn parse(rel: impl Into<PathBuf>, text: impl Into<String>) -> Result<Self, DocumentError> {
        let text = text.into();
        let hash = crate::skip::content_hash(text.as_bytes());
        Self::from_source(&rel.into(), text, hash)
    }

    fn from_source(rel: &Path, text: String, content_hash: String) -> Result<Self, DocumentError> {
        let (front_matter, body) = split_front_matter(rel, &text)?;
        let slug = match front_matter.get("slug").and_then(Value::as_str) {
            Some(explicit) => explicit_slug(rel, explicit)?,
            None => slug_for(rel),
        };
        Ok(Self {
            path: rel.to_path_buf(),
            slug,
            front_matter,
            raw_content: text.into(),
            body: body.into(),
            content_hash,
            fields: BTreeMap::new(),
            stage: Stage::Load,
            failure: None,
            hooks_done: 0,
            skip: false,
        })
    }

    /// Path relative to the source root. Unique within a build.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn front_matter(&self) -> &Map<String, Value> {
        &self.front_matter
    }

    /// The whole file as read from disk, front matter included.
    pub fn raw_content(&self) -> &str {
        &self.raw_content
    }

    /// Content after the front matter block.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// SHA-256 of the raw bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Output file relative to the output root: `<slug>/index.html`.
    pub fn output_path(&self) -> PathBuf {
        if self.slug.is_empty() {
            PathBuf::from("index.html")
        } else {
            Path::new(&self.slug).join("index.html")
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|f| &f.value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn html(&self) -> Option<&str> {
        self.get_str("html")
    }

    pub fn description(&self) -> Option<&str> {
        self.get_str("description")
    }

    /// Title from front matter, falling back to the slug.
    pub fn title(&self) -> &str {
        self.front_matter
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(&self.slug)
    }

    /// Write a derived attribute on behalf of the current stage.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), DocumentError> {
        if CORE_ATTRIBUTES.contains(&name) {
            return Err(DocumentError::Reserved(name.to_string()));
        }
        match self.fields.get_mut(name) {
            Some(field) if field.owner > self.stage => Err(DocumentError::Ownership {
                field: name.to_string(),
                owner: field.owner,
                stage: self.stage,
            }),
            Some(field) => {
                field.value = value.into();
                Ok(())
            }
            None => {
                self.fields.insert(
                    name.to_string(),
                    Field {
                        value: value.into(),
                        owner: self.stage,
                    },
                );
                Ok(())
            }
        }
    }

    /// Names of all derived attributes set so far.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub(crate) fn enter_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.hooks_done = 0;
    }

    pub(crate) fn hook_completed(&mut self) {
        self.hooks_done += 1;
    }

    /// Hooks of the current stage that returned `Ok` for this document, or
    /// did not apply to it.
    pub(crate) fn hooks_completed(&self) -> usize {
        self.hooks_done
    }

    /// Derived attributes and their owning stages as JSON.
    pub(crate) fn derived_snapshot(&self) -> Value {
        serde_json::to_value(&self.fields).unwrap_or(Value::Null)
    }

    /// Replace the derived attributes with a [`Document::derived_snapshot`].
    /// Returns false and leaves the document untouched if it does not parse.
    pub(crate) fn restore_derived(&mut self, snapshot: Value) -> bool {
        match serde_json::from_value::<BTreeMap<String, Field>>(snapshot) {
            Ok(fields) => {
                self.fields = fields;
                true
            }
            Err(_) => false,
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failure.get_or_insert_with(|| reason.into());
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Resolve a dotted field for expressions: core attributes, then derived
    /// attributes, then front matter.
    pub fn lookup(&self, path: &[&str]) -> Option<Value> {
        let (head, rest) = path.split_first()?;
        let root = match *head {
            "path" => Value::String(self.path.to_string_lossy().replace('\\', "/")),
            "slug" => Value::String(self.slug.clone()),
            "skip" => Value::Bool(self.skip),
            "body" => Value::String(self.body.to_string()),
            name => self
                .fields
                .get(name)
                .map(|f| f.value.clone())
                .or_else(|| self.front_matter.get(name).cloned())?,
        };
        rest.iter()
            .try_fold(root, |value, key| value.get(key).cloned())
    }
}

/// Parse the YAML front matter block, if any.
fn split_front_matter(rel: &Path, text: &str) -> Result<(Map<String, Value>, String), DocumentError> {
    let matter = Matter::<YAML>::new();
    let parsed = matter
        .parse::<Value>(text)
        .map_err(|e| DocumentError::FrontMatter {
            path: rel.to_path_buf(),
            reason: e.to_string(),
        })?;
    let front_matter = match parsed.data {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(DocumentError::FrontMatter {
                path: rel.to_path_buf(),
                reason: "front matter must be a mapping".into(),
            });
        }
    };
    Ok((front_matter, parsed.content))
}

/// Derive a URL slug from a relative source path.
///
/// - `about.md` → `about`
/// - `blog/Hello World.md` → `blog/hello-world`
/// - `blog/index.md` → `blog`
/// - `index.md` → `` (site root)
/// A front-matter slug is used verbatim as a path under the output root, so
/// every segment must be an ordinary name.
fn explicit_slug(rel: &Path, raw: &str) -> Result<String, DocumentError> {
    let slug = raw.trim().trim_matches('/');
    if slug.is_empty() {
        return Ok(String::new());
    }
    let plain_segments = slug
        .split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.contains(['\\', ':']));
    let normal = Path::new(slug)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if plain_segments && normal {
        Ok(slug.to_string())
    } else {
        Err(DocumentError::InvalidSlug {
            path: rel.to_path_buf(),
            slug: raw.to_string(),
        })
    }
}

pub fn slug_for(rel: &Path) -> String {
    let mut parts: Vec<String> = rel
        .parent()
        .map(|p| {
            p.components()
                .map(|c| slugify(&c.as_os_str().to_string_lossy()))
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let stem = rel
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if !stem.eq_ignore_ascii_case("index") {
        parts.push(slugify(&stem));
    }
    parts.join("/")
}

/// Lower-case, ASCII alphanumerics kept, runs of anything else become `-`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
