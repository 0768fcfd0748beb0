//! Layered configuration resolution.
//!
//! Configuration is merged from five layers, each overriding the previous one
//! on key collision:
//!
//! ```text
//! stock defaults                     (CoreConfig::default())
//!   < global file                    (<config_dir>/plinth/config.toml)
//!   < local or explicit file         (./plinth.toml, or -c FILE)
//!   < environment                    (PLINTH_KEY, PLINTH_KEY__SUBKEY)
//!   < CLI overrides                  (-s key.path=value)
//! ```
//!
//! Tables are merged key-by-key; arrays and scalars are replaced wholesale.
//! The result is frozen into a [`ConfigSnapshot`], which is never mutated.
//! A new build constructs a new snapshot.
//!
//! ## Open schema
//!
//! Only the core keys below are typed here. Everything else belongs to
//! plugins, which declare [`ConfigField`] fragments. After the `configure`
//! stage the snapshot is checked against all fragments with
//! [`ConfigSnapshot::validate_fields`]; keys nobody claims are reported as
//! unknown but accepted.
//!
//! ```toml
//! [build]
//! source = "content"
//! output = "out"
//! ignore = []
//!
//! [cache]
//! enabled = true
//! dir = ".plinth.cache"
//! ttl = 2592000
//!
//! [skip]
//! enabled = true
//!
//! [validation]
//! mode = "document"
//!
//! [render]
//! backend = "markdown"
//! ```

use crate::document::ValueKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Prefix for environment variable overrides (`PLINTH_STYLE__THEME`).
pub const ENV_PREFIX: &str = "PLINTH";

/// File name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "plinth.toml";

/// Environment variables under [`ENV_PREFIX`] that control the tool itself
/// and are never treated as config keys.
const RESERVED_ENV: &[&str] = &["LOG", "NO_SKIP"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}:{column}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("invalid override `-s {flag}`: {reason}")]
    Override { flag: String, reason: String },
    #[error("config key `{key}`: {reason}")]
    Schema { key: String, reason: String },
    #[error("Config validation error: {0}")]
    Validation(String),
}

// =============================================================================
// Typed core settings
// =============================================================================

/// The part of the configuration the core itself reads.
///
/// Unknown keys are allowed: plugins own the rest of the namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub build: BuildSettings,
    pub cache: CacheSettings,
    pub skip: SkipSettings,
    pub validation: ValidationSettings,
    pub render: RenderSettings,
    pub site: SiteSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Source directory, relative to the working directory.
    pub source: PathBuf,
    /// Output directory, relative to the working directory.
    pub output: PathBuf,
    /// Extra ignore globs, applied on top of `.plinthignore`.
    pub ignore: Vec<String>,
    /// Load pool size. `None` means one worker per core.
    pub workers: Option<usize>,
    /// Render pool size. `None` means `min(cores, 4)`.
    pub render_workers: Option<usize>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            source: PathBuf::from("content"),
            output: PathBuf::from("out"),
            ignore: Vec::new(),
            workers: None,
            render_workers: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Default entry lifetime in seconds. `None` keeps entries forever.
    pub ttl: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(crate::cache::DEFAULT_CACHE_DIR),
            ttl: Some(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipSettings {
    pub enabled: bool,
}

impl Default for SkipSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// What happens when a single document fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Mark the document as failed and keep building the others.
    #[default]
    Document,
    /// Abort the build.
    Strict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub mode: ValidationMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Backend used when a document does not name one in its front matter.
    pub backend: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            backend: "markdown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub title: String,
    pub base_url: String,
}

impl CoreConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.workers == Some(0) {
            return Err(ConfigError::Validation(
                "build.workers must be greater than 0".into(),
            ));
        }
        if self.build.render_workers == Some(0) {
            return Err(ConfigError::Validation(
                "build.render_workers must be greater than 0".into(),
            ));
        }
        if self.cache.ttl == Some(0) {
            return Err(ConfigError::Validation(
                "cache.ttl must be greater than 0 (omit it to disable expiry)".into(),
            ));
        }
        if self.render.backend.trim().is_empty() {
            return Err(ConfigError::Validation(
                "render.backend must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Dotted paths of every key [`CoreConfig`] understands.
const CORE_KEYS: &[&str] = &[
    "build.source",
    "build.output",
    "build.ignore",
    "build.workers",
    "build.render_workers",
    "cache.enabled",
    "cache.dir",
    "cache.ttl",
    "skip.enabled",
    "validation.mode",
    "render.backend",
    "site.title",
    "site.base_url",
];

/// Resolve the load pool size.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(requested: Option<usize>) -> usize {
    let cores = available_cores();
    requested.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Resolve the render pool size. Rendering is dominated by cache reads and
/// template lookups, so the default stays small.
pub fn effective_render_threads(requested: Option<usize>) -> usize {
    let cores = available_cores();
    requested.map(|n| n.min(cores)).unwrap_or(cores.min(4))
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// =============================================================================
// Plugin-contributed schema
// =============================================================================

/// One config key a plugin claims, with the type it expects.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField {
    pub key: String,
    pub kind: ValueKind,
    pub required: bool,
}

impl ConfigField {
    pub fn optional(key: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: false,
        }
    }

    pub fn required(key: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: true,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable, fully merged configuration for one build.
///
/// Cloning is cheap; all clones share the same table.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    root: Arc<toml::Table>,
    core: Arc<CoreConfig>,
    fingerprint: Arc<str>,
}

impl ConfigSnapshot {
    /// Freeze a merged table. Deserializes and validates the core settings.
    pub fn new(root: toml::Table) -> Result<Self, ConfigError> {
        let core: CoreConfig = toml::Value::Table(root.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Validation(e.message().to_string()))?;
        core.validate()?;
        let canonical = serde_json::to_vec(&root).unwrap_or_default();
        let fingerprint = format!("{:x}", Sha256::digest(&canonical));
        Ok(Self {
            root: Arc::new(root),
            core: Arc::new(core),
            fingerprint: fingerprint.into(),
        })
    }

    /// Snapshot of the stock defaults only.
    pub fn defaults() -> Result<Self, ConfigError> {
        match stock_defaults_value() {
            toml::Value::Table(t) => Self::new(t),
            _ => Err(ConfigError::Validation("defaults must be a table".into())),
        }
    }

    pub fn core(&self) -> &CoreConfig {
        &self.core
    }

    pub fn table(&self) -> &toml::Table {
        &self.root
    }

    /// Stable hash of the whole merged configuration.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Look up a value by dotted path (`style.theme`).
    pub fn get(&self, dotted: &str) -> Option<&toml::Value> {
        let mut segments = dotted.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_table()?.get(segment)?;
        }
        Some(current)
    }

    /// Look up and deserialize a value. Missing keys are `Ok(None)`.
    pub fn get_as<T: DeserializeOwned>(&self, dotted: &str) -> Result<Option<T>, ConfigError> {
        match self.get(dotted) {
            None => Ok(None),
            Some(value) => value
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e: toml::de::Error| ConfigError::Schema {
                    key: dotted.to_string(),
                    reason: e.message().to_string(),
                }),
        }
    }

    /// Deserialize a section, falling back to `T::default()` when absent.
    pub fn section<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, ConfigError> {
        Ok(self.get_as(name)?.unwrap_or_default())
    }

    /// Check plugin-declared fields against the snapshot.
    ///
    /// Type mismatches and missing required keys are errors. Returns the
    /// dotted paths of leaf keys that neither the core nor any field claims.
    pub fn validate_fields(&self, fields: &[ConfigField]) -> Result<Vec<String>, ConfigError> {
        for field in fields {
            match self.get(&field.key) {
                None if field.required => {
                    return Err(ConfigError::Schema {
                        key: field.key.clone(),
                        reason: "required key is missing".into(),
                    });
                }
                None => {}
                Some(value) => {
                    let json = serde_json::to_value(value).map_err(|e| ConfigError::Schema {
                        key: field.key.clone(),
                        reason: e.to_string(),
                    })?;
                    if !field.kind.matches(&json) {
                        return Err(ConfigError::Schema {
                            key: field.key.clone(),
                            reason: format!("expected {}, found {}", field.kind, describe(value)),
                        });
                    }
                }
            }
        }

        let mut leaves = Vec::new();
        collect_leaves(&self.root, "", &mut leaves);
        let claimed: Vec<&str> = CORE_KEYS
            .iter()
            .copied()
            .chain(fields.iter().map(|f| f.key.as_str()))
            .collect();
        Ok(leaves
            .into_iter()
            .filter(|leaf| {
                !claimed.iter().any(|key| {
                    leaf == key
                        || leaf
                            .strip_prefix(key)
                            .is_some_and(|rest| rest.starts_with('.'))
                })
            })
            .collect())
    }
}

fn describe(value: &toml::Value) -> &'static str {
    match value {
        toml::Value::String(_) => "string",
        toml::Value::Integer(_) => "integer",
        toml::Value::Float(_) => "float",
        toml::Value::Boolean(_) => "boolean",
        toml::Value::Datetime(_) => "datetime",
        toml::Value::Array(_) => "array",
        toml::Value::Table(_) => "table",
    }
}

fn collect_leaves(table: &toml::Table, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) if !inner.is_empty() => collect_leaves(inner, &path, out),
            _ => out.push(path),
        }
    }
}

// =============================================================================
// Layer loading and merging
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer every other source is merged on top of.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(CoreConfig::default())
        .unwrap_or_else(|_| toml::Value::Table(toml::Table::new()))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read and parse a config file. Parse errors carry the line and column.
pub fn load_file(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_toml(&content, path)
}

fn parse_toml(content: &str, path: &Path) -> Result<toml::Value, ConfigError> {
    content
        .parse::<toml::Table>()
        .map(toml::Value::Table)
        .map_err(|e| {
            let offset = e.span().map(|s| s.start).unwrap_or(0);
            let (line, column) = line_column(content, offset);
            ConfigError::Parse {
                path: path.to_path_buf(),
                line,
                column,
                message: e.message().to_string(),
            }
        })
}

/// 1-based line and column for a byte offset.
fn line_column(content: &str, offset: usize) -> (usize, usize) {
    let before = &content[..offset.min(content.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map(|l| l.chars().count()).unwrap_or(0) + 1;
    (line, column)
}

/// Build the environment layer from `(name, value)` pairs.
///
/// `PLINTH_SITE_TITLE=x` sets `site_title`; `PLINTH_STYLE__THEME=nord` sets
/// `style.theme`. Names are lower-cased. Values are read as JSON literals,
/// falling back to plain strings.
pub fn env_layer<I>(vars: I) -> toml::Value
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{ENV_PREFIX}_");
    let mut table = toml::Table::new();
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() || RESERVED_ENV.contains(&rest) {
            continue;
        }
        let lowered = rest.to_lowercase();
        let segments: Vec<&str> = lowered.split("__").collect();
        if segments.iter().any(|s| s.is_empty()) {
            tracing::warn!(variable = %name, "ignoring malformed config variable");
            continue;
        }
        insert_path(&mut table, &segments, parse_literal(&raw));
    }
    toml::Value::Table(table)
}

/// Build the CLI override layer from `key.path=value` flags.
pub fn override_layer(flags: &[String]) -> Result<toml::Value, ConfigError> {
    let mut table = toml::Table::new();
    for flag in flags {
        let Some((key, raw)) = flag.split_once('=') else {
            return Err(ConfigError::Override {
                flag: flag.clone(),
                reason: "expected KEY=VALUE".into(),
            });
        };
        let key = key.trim();
        let segments: Vec<&str> = key.split('.').collect();
        if key.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::Override {
                flag: flag.clone(),
                reason: format!("`{key}` is not a valid dotted key"),
            });
        }
        insert_path(&mut table, &segments, parse_literal(raw));
    }
    Ok(toml::Value::Table(table))
}

/// Interpret a raw value as a JSON literal, or as a string if it is not one.
fn parse_literal(raw: &str) -> toml::Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(json_to_toml)
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// TOML has no null; any null makes the whole literal unrepresentable.
fn json_to_toml(value: serde_json::Value) -> Option<toml::Value> {
    Some(match value {
        serde_json::Value::Null => return None,
        serde_json::Value::Bool(b) => toml::Value::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => toml::Value::Integer(i),
            None => toml::Value::Float(n.as_f64()?),
        },
        serde_json::Value::String(s) => toml::Value::String(s),
        serde_json::Value::Array(items) => toml::Value::Array(
            items
                .into_iter()
                .map(json_to_toml)
                .collect::<Option<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut table = toml::Table::new();
            for (k, v) in map {
                table.insert(k, json_to_toml(v)?);
            }
            toml::Value::Table(table)
        }
    })
}

fn insert_path(table: &mut toml::Table, segments: &[&str], value: toml::Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = table;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        current = match entry {
            toml::Value::Table(t) => t,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

/// Merge all layers into a snapshot.
///
/// `global_file` and `local_file` must exist when given; discovery of the
/// default locations is done by [`ConfigSources::discover`].
pub fn resolve<I>(
    defaults: toml::Value,
    global_file: Option<&Path>,
    local_file: Option<&Path>,
    env_vars: I,
    overrides: &[String],
) -> Result<ConfigSnapshot, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged = defaults;
    for path in [global_file, local_file].into_iter().flatten() {
        tracing::debug!(path = %path.display(), "merging config file");
        merged = merge_toml(merged, load_file(path)?);
    }
    merged = merge_toml(merged, env_layer(env_vars));
    merged = merge_toml(merged, override_layer(overrides)?);
    match merged {
        toml::Value::Table(table) => ConfigSnapshot::new(table),
        _ => Err(ConfigError::Validation("configuration root must be a table".into())),
    }
}

/// Where the layers come from for a normal CLI invocation.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub global_file: Option<PathBuf>,
    pub local_file: Option<PathBuf>,
    pub overrides: Vec<String>,
}

impl ConfigSources {
    /// Find the global and local files.
    ///
    /// An explicit path is always used (and fails later if missing); the
    /// default locations are used only when they exist.
    pub fn discover(explicit: Option<&Path>, working_dir: &Path, overrides: Vec<String>) -> Self {
        let global_file = dirs::config_dir()
            .map(|d| d.join(crate::TOOL_NAME).join("config.toml"))
            .filter(|p| p.is_file());
        let local_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Some(working_dir.join(LOCAL_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        Self {
            global_file,
            local_file,
            overrides,
        }
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<ConfigSnapshot, ConfigError> {
        resolve(
            stock_defaults_value(),
            self.global_file.as_deref(),
            self.local_file.as_deref(),
            std::env::vars(),
            &self.overrides,
        )
    }
}

/// Returns a fully-commented stock `plinth.toml` with all core keys.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Plinth Configuration
# =====================
# All settings are optional. Values shown below are the defaults.
#
# Layers, later ones win:
#   defaults < ~/.config/plinth/config.toml < ./plinth.toml (or -c FILE)
#            < PLINTH_* environment variables < -s key=value flags
#
# Keys not listed here belong to plugins and are passed through.

# ---------------------------------------------------------------------------
# Build
# ---------------------------------------------------------------------------
[build]
source = "content"
output = "out"
# Extra ignore globs on top of .plinthignore
ignore = []
# Load workers (omit for one per core) and render workers (omit for min(cores, 4))
# workers = 8
# render_workers = 4

# ---------------------------------------------------------------------------
# Content cache. Deleting the directory is always safe.
# ---------------------------------------------------------------------------
[cache]
enabled = true
dir = ".plinth.cache"
# Entry lifetime in seconds. Omit to keep entries forever.
ttl = 2592000

# ---------------------------------------------------------------------------
# Incremental skip. PLINTH_NO_SKIP=1 disables it for one run.
# ---------------------------------------------------------------------------
[skip]
enabled = true

# ---------------------------------------------------------------------------
# Document validation: "document" marks the document failed and continues,
# "strict" aborts the build.
# ---------------------------------------------------------------------------
[validation]
mode = "document"

[render]
backend = "markdown"

[site]
title = ""
base_url = ""

# Repeated head tags, injected verbatim into every page.
# [[head]]
# html = '<meta name="generator" content="plinth">'

# Derived collections.
# [[collections]]
# name = "posts"
# filter = "draft != true and 'post' in tags"
# sort = "date desc, title"
# limit = 10
"##
}
