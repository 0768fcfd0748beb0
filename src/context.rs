//! Per-build state threaded through every hook.
//!
//! A [`BuildContext`] is created once per build by the runner and passed by
//! `&mut` to context hooks. There is no global state: everything a plugin may
//! read or write lives here.
//!
//! Document hooks run in parallel and therefore cannot hold the whole
//! context mutably. They receive a read-only [`DocView`] of the shared parts
//! (config, cache, output writer, context attributes) plus exclusive access
//! to the one document they are processing.

use crate::cache::ContentCache;
use crate::config::{ConfigField, ConfigSnapshot};
use crate::document::{AttributeSchema, Document, FieldSpec};
use crate::expr::{Expr, SortSpec};
use crate::hooks::Stage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Cancellation
// =============================================================================

/// Shared flag set by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Output writer
// =============================================================================

/// Result of one [`OutputWriter::write_if_changed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Writes files under the output root, skipping writes whose content is
/// already on disk.
///
/// Files are written to a temporary sibling and renamed into place, so a
/// crash never leaves a half-written page at its final path.
#[derive(Debug)]
pub struct OutputWriter {
    root: PathBuf,
    written: AtomicU64,
    unchanged: AtomicU64,
    changed: Mutex<Vec<PathBuf>>,
}

impl OutputWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            changed: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to `root/rel` unless the file already holds exactly
    /// those bytes. `rel` must be a plain relative path that stays inside the
    /// root.
    pub fn write_if_changed(&self, rel: &Path, contents: &[u8]) -> std::io::Result<WriteOutcome> {
        let inside_root = rel.components().next().is_some()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !inside_root {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is outside the output directory", rel.display()),
            ));
        }
        let path = self.root.join(rel);
        if std::fs::read(&path).is_ok_and(|existing| existing == contents) {
            self.unchanged.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(path = %rel.display(), "unchanged");
            return Ok(WriteOutcome::Unchanged);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &path)?;
        self.written.fetch_add(1, Ordering::Relaxed);
        self.changed.lock().push(rel.to_path_buf());
        tracing::debug!(path = %rel.display(), bytes = contents.len(), "wrote");
        Ok(WriteOutcome::Written)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn unchanged(&self) -> u64 {
        self.unchanged.load(Ordering::Relaxed)
    }

    /// Relative paths written during this build, sorted.
    pub fn changed_files(&self) -> Vec<PathBuf> {
        let mut files = self.changed.lock().clone();
        files.sort();
        files
    }
}

// =============================================================================
// Document view
// =============================================================================

/// What a document hook can see besides its own document.
#[derive(Debug, Clone, Copy)]
pub struct DocView<'a> {
    pub config: &'a ConfigSnapshot,
    pub cache: &'a ContentCache,
    pub writer: &'a OutputWriter,
    pub attrs: &'a BTreeMap<String, Value>,
    pub stage: Stage,
    pub source_dir: &'a Path,
}

impl DocView<'_> {
    /// Render backend for a document: front matter `renderer`, else
    /// `render.backend`.
    pub fn backend_for<'d>(&'d self, doc: &'d Document) -> &'d str {
        backend_for(self.config, doc)
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }
}

pub(crate) fn backend_for<'d>(config: &'d ConfigSnapshot, doc: &'d Document) -> &'d str {
    doc.front_matter()
        .get("renderer")
        .and_then(Value::as_str)
        .unwrap_or(&config.core().render.backend)
}

// =============================================================================
// Build context
// =============================================================================

/// Everything one build owns.
#[derive(Debug)]
pub struct BuildContext {
    config: ConfigSnapshot,
    cache: Arc<ContentCache>,
    writer: Arc<OutputWriter>,
    cancel: CancelToken,
    source_dir: PathBuf,
    output_dir: PathBuf,
    stage: Stage,
    patterns: Vec<String>,
    ignore: Vec<String>,
    candidates: Vec<PathBuf>,
    documents: Vec<Document>,
    attrs: BTreeMap<String, Value>,
    extra_config_fields: Vec<ConfigField>,
    extra_post_fields: Vec<(String, FieldSpec)>,
    schema: AttributeSchema,
}

impl BuildContext {
    pub fn new(
        config: ConfigSnapshot,
        cache: Arc<ContentCache>,
        source_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        let output_dir = output_dir.into();
        let ignore = config.core().build.ignore.clone();
        Self {
            writer: Arc::new(OutputWriter::new(&output_dir)),
            config,
            cache,
            cancel,
            source_dir: source_dir.into(),
            output_dir,
            stage: Stage::Configure,
            patterns: Vec::new(),
            ignore,
            candidates: Vec::new(),
            documents: Vec::new(),
            attrs: BTreeMap::new(),
            extra_config_fields: Vec::new(),
            extra_post_fields: Vec::new(),
            schema: AttributeSchema::new(),
        }
    }

    pub fn config(&self) -> &ConfigSnapshot {
        &self.config
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn enter_stage(&mut self, stage: Stage) {
        self.stage = stage;
        for doc in &mut self.documents {
            doc.enter_stage(stage);
        }
    }

    // -------------------------------------------------------------------------
    // configure
    // -------------------------------------------------------------------------

    /// Declare an extra config key at configure time.
    pub fn register_config_field(&mut self, field: ConfigField) {
        self.extra_config_fields.push(field);
    }

    /// Declare an extra front-matter field at configure time.
    pub fn register_post_field(&mut self, plugin: &str, spec: FieldSpec) {
        self.extra_post_fields.push((plugin.to_string(), spec));
    }

    pub(crate) fn extra_config_fields(&self) -> &[ConfigField] {
        &self.extra_config_fields
    }

    pub(crate) fn take_extra_post_fields(&mut self) -> Vec<(String, FieldSpec)> {
        std::mem::take(&mut self.extra_post_fields)
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub(crate) fn set_schema(&mut self, schema: AttributeSchema) {
        self.schema = schema;
    }

    // -------------------------------------------------------------------------
    // glob
    // -------------------------------------------------------------------------

    /// Contribute a discovery pattern, relative to the source directory.
    pub fn add_pattern(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    /// Contribute an ignore glob.
    pub fn add_ignore(&mut self, pattern: impl Into<String>) {
        self.ignore.push(pattern.into());
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore
    }

    /// Files found by the glob stage, relative to the source directory.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub(crate) fn set_candidates(&mut self, candidates: Vec<PathBuf>) {
        self.candidates = candidates;
    }

    // -------------------------------------------------------------------------
    // documents
    // -------------------------------------------------------------------------

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut [Document] {
        &mut self.documents
    }

    pub fn document(&self, path: &Path) -> Option<&Document> {
        self.documents.iter().find(|d| d.path() == path)
    }

    pub(crate) fn set_documents(&mut self, documents: Vec<Document>) {
        self.documents = documents;
    }

    /// Documents matching `filter`, ordered by `sort`, truncated to `limit`.
    /// Failed documents are never selected; skipped ones are.
    pub fn select(
        &self,
        filter: Option<&Expr>,
        sort: &SortSpec,
        limit: Option<usize>,
    ) -> Vec<&Document> {
        let mut selected: Vec<&Document> = self
            .documents
            .iter()
            .filter(|d| !d.is_failed())
            .filter(|d| filter.is_none_or(|f| f.matches(*d)))
            .collect();
        selected.sort_by(|a, b| a.path().cmp(b.path()));
        sort.sort(&mut selected);
        if let Some(limit) = limit {
            selected.truncate(limit);
        }
        selected
    }

    /// Split into the shared view and the document slice, for parallel
    /// document hooks.
    pub(crate) fn split_documents(&mut self) -> (DocView<'_>, &mut [Document]) {
        let view = DocView {
            config: &self.config,
            cache: &self.cache,
            writer: &self.writer,
            attrs: &self.attrs,
            stage: self.stage,
            source_dir: &self.source_dir,
        };
        (view, &mut self.documents)
    }

    // -------------------------------------------------------------------------
    // context attributes
    // -------------------------------------------------------------------------

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }
}
