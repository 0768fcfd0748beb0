//! The lifecycle runner: drives one build through every stage.
//!
//! ```text
//! configure → glob → load → pre_render → render → post_render → save → teardown
//! ```
//!
//! Stages run strictly one after another on the calling thread. Inside a
//! stage, hooks run in registry order; a document hook fans out over every
//! document on a worker pool and the stage only moves on once the pool has
//! drained. Two pools are used: a load pool sized to the machine for file
//! reads and front-matter parsing, and a smaller render pool for the
//! document stages after load.
//!
//! ## Failure handling
//!
//! - Before any stage runs, the registry's declared dependency graph is
//!   validated.
//! - A context hook error aborts the build.
//! - A document hook error is collected per document; once the pool has
//!   drained, any failure aborts the build with every failure listed.
//!   In `save` the other documents still finish, and those that made it
//!   through every save hook are marked done. An interrupted `save` marks
//!   nothing.
//! - A document that cannot be loaded or fails schema validation either
//!   aborts the build (`validation.mode = "strict"`) or is marked failed and
//!   excluded from later hooks (`"document"`, the default).
//! - `teardown` always runs exactly once, even after an error, a panic or
//!   an interrupt, and the cache is persisted after it.

use crate::cache::{CacheStats, ContentCache};
use crate::config::{ConfigError, ConfigSnapshot, ValidationMode};
use crate::context::{self, BuildContext, CancelToken};
use crate::discover::{self, DiscoverError, IgnoreRules};
use crate::document::{Document, DocumentError};
use crate::hooks::{DocumentFn, Handler, HookError, Plugin, Registration, Registry, RegistryError, Stage};
use crate::skip::{self, SkipEngine};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One document that failed inside a document hook.
#[derive(Debug)]
pub struct HookFailure {
    pub plugin: String,
    pub document: PathBuf,
    pub error: HookError,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.document.display(), self.plugin, self.error)
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Discover(#[from] DiscoverError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("{first} and {second} both write {output}")]
    DuplicateOutput {
        output: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("{stage} hook of plugin `{plugin}` failed: {source}")]
    Hook {
        stage: Stage,
        plugin: String,
        #[source]
        source: HookError,
    },
    #[error("{} document(s) failed in {stage}", .failures.len())]
    Stage {
        stage: Stage,
        failures: Vec<HookFailure>,
    },
    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("build interrupted")]
    Interrupted,
}

/// A document excluded from the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

/// What a finished build did.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    /// Documents loaded, failed ones included.
    pub documents: usize,
    pub skipped: usize,
    pub failed: Vec<DocFailure>,
    pub written: u64,
    pub unchanged: u64,
    /// Output files written by this build, relative to the output root.
    pub changed_files: Vec<PathBuf>,
    pub cache: CacheStats,
    /// Hits per cache key during this build.
    pub cache_key_hits: BTreeMap<String, u64>,
    pub timings: Vec<StageTiming>,
    pub output_dir: PathBuf,
    /// Context attributes at the end of the build.
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl BuildReport {
    /// Documents that went through every hook.
    pub fn processed(&self) -> usize {
        self.documents
            .saturating_sub(self.skipped + self.failed.len())
    }
}

/// Knobs that are not part of the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory that relative config paths resolve against.
    pub base_dir: PathBuf,
    /// Disable the skip engine regardless of config and environment.
    pub no_skip: bool,
    /// Stop after this stage (teardown still runs).
    pub stop_after: Option<Stage>,
    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct RunState {
    load_failures: Vec<DocFailure>,
    timings: Vec<StageTiming>,
}

/// Drives a registry of plugins through one build.
pub struct Runner {
    registry: Registry,
    config: ConfigSnapshot,
    options: RunOptions,
}

impl Runner {
    pub fn new(registry: Registry, config: ConfigSnapshot, options: RunOptions) -> Self {
        Self {
            registry,
            config,
            options,
        }
    }

    pub fn from_plugins<I>(
        plugins: I,
        config: ConfigSnapshot,
        options: RunOptions,
    ) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        Ok(Self::new(Registry::with_plugins(plugins)?, config, options))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.options.base_dir.join(path)
    }

    /// Run the build.
    pub fn run(&self) -> Result<BuildReport, BuildError> {
        self.registry.validate()?;
        let schema = self.registry.attribute_schema()?;
        let core = self.config.core();

        let source_dir = self.resolve(&core.build.source);
        let output_dir = self.resolve(&core.build.output);
        let cache_dir = self.resolve(&core.cache.dir);
        let cache = Arc::new(if core.cache.enabled {
            ContentCache::open(&cache_dir, core.cache.ttl.map(Duration::from_secs))
        } else {
            ContentCache::disabled()
        });
        let skip_enabled = core.skip.enabled && !self.options.no_skip && !skip::no_skip_requested();
        if !skip_enabled {
            tracing::info!("skip engine disabled, every document will be processed");
        }
        let skip = SkipEngine::new(
            Arc::clone(&cache),
            &output_dir,
            self.config.fingerprint(),
            &self.registry.fingerprint(),
            skip_enabled,
        );

        let load_pool = build_pool("load", crate::config::effective_threads(core.build.workers))?;
        let render_pool = build_pool(
            "render",
            crate::config::effective_render_threads(core.build.render_workers),
        )?;

        let mut ctx = BuildContext::new(
            self.config.clone(),
            Arc::clone(&cache),
            &source_dir,
            &output_dir,
            self.options.cancel.clone(),
        );
        ctx.set_schema(schema);
        let mut state = RunState::default();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_stages(&mut ctx, &mut state, &skip, &cache_dir, &load_pool, &render_pool)
        }));

        let teardown = self.teardown(&mut ctx, &mut state);
        if let Err(e) = cache.persist() {
            tracing::warn!(error = %e, "could not persist cache");
        }

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        };
        result?;
        teardown?;

        let documents = ctx.documents().len() + state.load_failures.len();
        let mut failed = state.load_failures;
        failed.extend(ctx.documents().iter().filter_map(|d| {
            d.failure().map(|reason| DocFailure {
                path: d.path().to_path_buf(),
                reason: reason.to_string(),
            })
        }));
        Ok(BuildReport {
            documents,
            skipped: ctx.documents().iter().filter(|d| d.skip).count(),
            failed,
            written: ctx.writer().written(),
            unchanged: ctx.writer().unchanged(),
            changed_files: ctx.writer().changed_files(),
            cache: cache.stats(),
            cache_key_hits: cache.key_hits(),
            timings: state.timings,
            output_dir,
            attrs: ctx.attrs().clone(),
        })
    }

    fn run_stages(
        &self,
        ctx: &mut BuildContext,
        state: &mut RunState,
        skip: &SkipEngine,
        cache_dir: &Path,
        load_pool: &ThreadPool,
        render_pool: &ThreadPool,
    ) -> Result<(), BuildError> {
        for stage in Stage::ALL {
            if stage == Stage::Teardown {
                break;
            }
            if self.options.stop_after.is_some_and(|last| stage > last) {
                tracing::debug!(%stage, "stopping early");
                break;
            }
            if ctx.cancel_token().is_cancelled() {
                return Err(BuildError::Interrupted);
            }
            let started = Instant::now();
            ctx.enter_stage(stage);
            tracing::debug!(%stage, "stage start");

            match stage {
                Stage::Configure => {
                    self.run_hooks(stage, ctx, render_pool)?;
                    self.finish_configure(ctx)?;
                }
                Stage::Glob => {
                    self.run_hooks(stage, ctx, render_pool)?;
                    self.discover(ctx, cache_dir)?;
                }
                Stage::Load => {
                    self.load_documents(ctx, state, skip, load_pool)?;
                    self.run_hooks(stage, ctx, load_pool)?;
                }
                Stage::Save => {
                    let saved = self.run_hooks(stage, ctx, render_pool);
                    if matches!(saved, Err(BuildError::Interrupted)) {
                        tracing::info!("save interrupted, no documents marked done");
                    } else {
                        let save_hooks = self
                            .registry
                            .hooks_for(Stage::Save)
                            .iter()
                            .filter(|r| matches!(r.hook.handler, Handler::Document(_)))
                            .count();
                        let marked = ctx
                            .documents()
                            .iter()
                            .filter(|d| {
                                !d.skip && d.hooks_completed() == save_hooks && skip.mark_done(d)
                            })
                            .count();
                        tracing::debug!(marked, "documents marked done");
                    }
                    saved?;
                }
                _ => self.run_hooks(stage, ctx, render_pool)?,
            }

            let elapsed = started.elapsed();
            tracing::info!(%stage, ms = elapsed.as_millis() as u64, "stage complete");
            state.timings.push(StageTiming { stage, elapsed });
        }
        Ok(())
    }

    /// Compose late schema fragments and check the config against every
    /// declared field.
    fn finish_configure(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
        let mut schema = ctx.schema().clone();
        for (plugin, spec) in ctx.take_extra_post_fields() {
            schema
                .register(&plugin, spec)
                .map_err(RegistryError::from)?;
        }
        ctx.set_schema(schema);

        let mut fields = self.registry.config_fields();
        fields.extend(ctx.extra_config_fields().iter().cloned());
        for key in self.config.validate_fields(&fields)? {
            tracing::warn!(%key, "unknown config key");
        }
        Ok(())
    }

    fn discover(&self, ctx: &mut BuildContext, cache_dir: &Path) -> Result<(), BuildError> {
        let ignore = IgnoreRules::load(ctx.source_dir(), ctx.ignore_patterns())?;
        let prune = [ctx.output_dir().to_path_buf(), cache_dir.to_path_buf()];
        let candidates = discover::discover(ctx.source_dir(), ctx.patterns(), &ignore, &prune)?;
        tracing::info!(files = candidates.len(), "discovered source files");
        ctx.set_candidates(candidates);
        Ok(())
    }

    /// Read every candidate, validate it, and decide whether it can be
    /// skipped.
    fn load_documents(
        &self,
        ctx: &mut BuildContext,
        state: &mut RunState,
        skip: &SkipEngine,
        pool: &ThreadPool,
    ) -> Result<(), BuildError> {
        let strict = self.config.core().validation.mode == ValidationMode::Strict;
        let source_dir = ctx.source_dir().to_path_buf();
        let candidates = ctx.candidates().to_vec();
        let loaded: Vec<Result<Document, DocumentError>> = pool.install(|| {
            candidates
                .par_iter()
                .map(|rel| Document::load(&source_dir, rel))
                .collect()
        });

        let mut documents = Vec::with_capacity(loaded.len());
        for (rel, result) in candidates.iter().zip(loaded) {
            match result {
                Ok(doc) => documents.push(doc),
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(path = %rel.display(), error = %e, "document not loaded");
                    state.load_failures.push(DocFailure {
                        path: rel.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let backends = self.registry.backends();
        for doc in &mut documents {
            let problem = match ctx.schema().validate(doc) {
                Err(e) => Some(BuildError::Document(e)),
                Ok(()) => {
                    let backend = context::backend_for(ctx.config(), doc);
                    (!backends.is_empty() && !backends.contains(backend)).then(|| {
                        BuildError::Document(DocumentError::UnknownRenderer {
                            path: doc.path().to_path_buf(),
                            renderer: backend.to_string(),
                        })
                    })
                }
            };
            if let Some(problem) = problem {
                if strict {
                    return Err(problem);
                }
                tracing::warn!(path = %doc.path().display(), error = %problem, "document failed validation");
                doc.mark_failed(problem.to_string());
            }
        }

        let mut owners: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
        for doc in documents.iter_mut().filter(|d| !d.is_failed()) {
            let output = doc.output_path();
            match owners.get(&output) {
                Some(first) => {
                    let error = BuildError::DuplicateOutput {
                        output,
                        first: first.clone(),
                        second: doc.path().to_path_buf(),
                    };
                    if strict {
                        return Err(error);
                    }
                    tracing::warn!(error = %error, "duplicate output path");
                    doc.mark_failed(error.to_string());
                }
                None => {
                    owners.insert(output, doc.path().to_path_buf());
                }
            }
        }

        for doc in documents.iter_mut().filter(|d| !d.is_failed()) {
            if skip.resume(doc) {
                tracing::debug!(path = %doc.path().display(), "unchanged, skipping");
            }
        }
        let skipped = documents.iter().filter(|d| d.skip).count();
        tracing::info!(documents = documents.len(), skipped, "loaded documents");
        ctx.set_documents(documents);
        Ok(())
    }

    /// Run every hook of `stage` in order.
    fn run_hooks(
        &self,
        stage: Stage,
        ctx: &mut BuildContext,
        pool: &ThreadPool,
    ) -> Result<(), BuildError> {
        let mut deferred: Vec<HookFailure> = Vec::new();
        for reg in self.registry.hooks_for(stage) {
            if ctx.cancel_token().is_cancelled() {
                return Err(BuildError::Interrupted);
            }
            match &reg.hook.handler {
                Handler::Context(f) => {
                    tracing::trace!(%stage, plugin = %reg.plugin_id, "context hook");
                    f(ctx).map_err(|source| BuildError::Hook {
                        stage,
                        plugin: reg.plugin_id.clone(),
                        source,
                    })?;
                }
                Handler::Document(f) => {
                    let failures = run_document_hook(reg, f.as_ref(), ctx, pool);
                    if ctx.cancel_token().is_cancelled() {
                        return Err(BuildError::Interrupted);
                    }
                    if failures.is_empty() {
                        continue;
                    }
                    for failure in &failures {
                        tracing::error!(%stage, plugin = %failure.plugin, path = %failure.document.display(), error = %failure.error, "hook failed");
                        if let Some(doc) = ctx
                            .documents_mut()
                            .iter_mut()
                            .find(|d| d.path() == failure.document)
                        {
                            doc.mark_failed(failure.error.to_string());
                        }
                    }
                    if stage == Stage::Save {
                        deferred.extend(failures);
                    } else {
                        return Err(BuildError::Stage { stage, failures });
                    }
                }
            }
        }
        if deferred.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Stage {
                stage,
                failures: deferred,
            })
        }
    }

    /// Run teardown hooks. Every hook runs even if an earlier one fails;
    /// the first error is returned.
    fn teardown(&self, ctx: &mut BuildContext, state: &mut RunState) -> Result<(), BuildError> {
        let started = Instant::now();
        ctx.enter_stage(Stage::Teardown);
        let mut first_error = None;
        for reg in self.registry.hooks_for(Stage::Teardown) {
            let Handler::Context(f) = &reg.hook.handler else {
                continue;
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => BuildError::Hook {
                    stage: Stage::Teardown,
                    plugin: reg.plugin_id.clone(),
                    source,
                },
                Err(_) => BuildError::Hook {
                    stage: Stage::Teardown,
                    plugin: reg.plugin_id.clone(),
                    source: HookError::msg("teardown hook panicked"),
                },
            };
            tracing::warn!(plugin = %reg.plugin_id, error = %error, "teardown hook failed");
            first_error.get_or_insert(error);
        }
        state.timings.push(StageTiming {
            stage: Stage::Teardown,
            elapsed: started.elapsed(),
        });
        first_error.map_or(Ok(()), Err)
    }
}

/// Apply one document hook to every eligible document and collect the
/// failures once the pool has drained.
fn run_document_hook(
    reg: &Registration,
    f: &DocumentFn,
    ctx: &mut BuildContext,
    pool: &ThreadPool,
) -> Vec<HookFailure> {
    let cancel = ctx.cancel_token().clone();
    let (view, docs) = ctx.split_documents();
    let backend = reg.hook.backend.as_deref();
    let apply = |doc: &mut Document| -> Option<HookFailure> {
        if doc.is_failed() || cancel.is_cancelled() {
            return None;
        }
        if backend.is_some_and(|b| context::backend_for(view.config, doc) != b) {
            doc.hook_completed();
            return None;
        }
        match f(&view, doc) {
            Ok(()) => {
                doc.hook_completed();
                None
            }
            Err(error) => Some(HookFailure {
                plugin: reg.plugin_id.clone(),
                document: doc.path().to_path_buf(),
                error,
            }),
        }
    };
    if reg.hook.parallel {
        pool.install(|| docs.par_iter_mut().filter_map(apply).collect())
    } else {
        docs.iter_mut().filter_map(apply).collect()
    }
}

fn build_pool(name: &'static str, threads: usize) -> Result<ThreadPool, BuildError> {
    tracing::debug!(pool = name, threads, "starting worker pool");
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("plinth-{name}-{i}"))
        .build()?)
}

/// Build with the default plugin set.
pub fn build(config: ConfigSnapshot, options: RunOptions) -> Result<BuildReport, BuildError> {
    Runner::from_plugins(crate::plugins::defaults(), config, options)?.run()
}
