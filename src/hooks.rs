//! Plugin contract and hook registry.
//!
//! A plugin is a value implementing [`Plugin`]. Instead of being discovered
//! by introspection, it declares its hooks explicitly: each [`Hook`] names a
//! [`Stage`], a [`Priority`], a handler, and the attributes it `requires` and
//! `produces`.
//!
//! ## Ordering
//!
//! Within a stage, hooks run sorted by `(priority, registration order)`:
//! every `first` hook before every `normal` hook before every `last` hook,
//! and registration order inside a tier. The sort is stable, so the order is
//! fully deterministic.
//!
//! ## Dependency contract
//!
//! [`Registry::validate`] walks all hooks in execution order and checks that
//! every required attribute is provided by the core, by a front-matter field
//! some plugin declared, or by a hook that runs earlier. Missing
//! dependencies are reported before any stage runs.

use crate::config::{ConfigError, ConfigField};
use crate::context::{BuildContext, DocView};
use crate::document::{AttributeSchema, CORE_ATTRIBUTES, Document, DocumentError, FieldSpec};
use crate::expr::ExprError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// One step of the fixed build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configure,
    Glob,
    Load,
    PreRender,
    Render,
    PostRender,
    Save,
    Teardown,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 8] = [
        Stage::Configure,
        Stage::Glob,
        Stage::Load,
        Stage::PreRender,
        Stage::Render,
        Stage::PostRender,
        Stage::Save,
        Stage::Teardown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Configure => "configure",
            Stage::Glob => "glob",
            Stage::Load => "load",
            Stage::PreRender => "pre_render",
            Stage::Render => "render",
            Stage::PostRender => "post_render",
            Stage::Save => "save",
            Stage::Teardown => "teardown",
        }
    }

    /// Stages in which per-document hooks are allowed.
    pub fn has_documents(&self) -> bool {
        matches!(
            self,
            Stage::Load | Stage::PreRender | Stage::Render | Stage::PostRender | Stage::Save
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

/// Priority tier inside a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    First,
    #[default]
    Normal,
    Last,
}

/// Error raised by a hook handler.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("{0}")]
    Message(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl HookError {
    pub fn msg(message: impl Into<String>) -> Self {
        HookError::Message(message.into())
    }
}

pub type ContextFn = dyn Fn(&mut BuildContext) -> Result<(), HookError> + Send + Sync;
pub type DocumentFn = dyn Fn(&DocView<'_>, &mut Document) -> Result<(), HookError> + Send + Sync;

/// What a hook does when it runs.
#[derive(Clone)]
pub enum Handler {
    /// Runs once per stage with exclusive access to the build context.
    Context(Arc<ContextFn>),
    /// Runs once per document, possibly in parallel across the pool.
    Document(Arc<DocumentFn>),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Context(_) => f.write_str("Handler::Context"),
            Handler::Document(_) => f.write_str("Handler::Document"),
        }
    }
}

/// A handler bound to one stage, with its declared contract.
#[derive(Debug, Clone)]
pub struct Hook {
    pub stage: Stage,
    pub priority: Priority,
    pub handler: Handler,
    pub produces: Vec<String>,
    pub requires: Vec<String>,
    /// For render hooks: the backend this hook implements. Only hooks of the
    /// document's backend run for it.
    pub backend: Option<String>,
    /// Document hooks fan out across the pool unless marked sequential.
    pub parallel: bool,
}

impl Hook {
    pub fn context<F>(stage: Stage, f: F) -> Self
    where
        F: Fn(&mut BuildContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::with_handler(stage, Handler::Context(Arc::new(f)))
    }

    pub fn document<F>(stage: Stage, f: F) -> Self
    where
        F: Fn(&DocView<'_>, &mut Document) -> Result<(), HookError> + Send + Sync + 'static,
    {
        Self::with_handler(stage, Handler::Document(Arc::new(f)))
    }

    fn with_handler(stage: Stage, handler: Handler) -> Self {
        Self {
            stage,
            priority: Priority::Normal,
            handler,
            produces: Vec::new(),
            requires: Vec::new(),
            backend: None,
            parallel: true,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn first(self) -> Self {
        self.priority(Priority::First)
    }

    pub fn last(self) -> Self {
        self.priority(Priority::Last)
    }

    pub fn produces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    fn signature(&self) -> String {
        let kind = match self.handler {
            Handler::Context(_) => "ctx",
            Handler::Document(_) => "doc",
        };
        format!(
            "{}:{:?}:{}:{}:{}:{}",
            self.stage,
            self.priority,
            kind,
            self.backend.as_deref().unwrap_or(""),
            self.produces.join(","),
            self.requires.join(","),
        )
    }
}

/// A unit of functionality composed into the pipeline.
pub trait Plugin: Send + Sync {
    /// Stable identifier, unique within a build.
    fn id(&self) -> &str;

    /// The hooks this plugin contributes.
    fn hooks(&self) -> Vec<Hook>;

    /// Config keys this plugin reads.
    fn config_model(&self) -> Vec<ConfigField> {
        Vec::new()
    }

    /// Front-matter fields this plugin reads.
    fn post_model(&self) -> Vec<FieldSpec> {
        Vec::new()
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("plugin `{0}` is registered twice")]
    DuplicatePlugin(String),
    #[error("plugin `{plugin}` registers a document hook for stage {stage}, which has no documents")]
    DocumentHookOutsideDocuments { plugin: String, stage: Stage },
    #[error("plugin `{plugin}` declares a render backend on a {stage} hook")]
    BackendOutsideRender { plugin: String, stage: Stage },
    #[error("plugin `{plugin}` {stage} hook requires `{attribute}`, which nothing produces before it")]
    MissingDependency {
        plugin: String,
        stage: Stage,
        attribute: String,
    },
    #[error(transparent)]
    Schema(#[from] DocumentError),
}

/// A hook together with its owner and registration order.
#[derive(Debug, Clone)]
pub struct Registration {
    pub plugin_id: String,
    pub order: usize,
    pub hook: Hook,
}

/// Ordered dispatch table for one build.
#[derive(Default)]
pub struct Registry {
    plugins: Vec<Arc<dyn Plugin>>,
    registrations: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins<I>(plugins: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Arc<dyn Plugin>>,
    {
        let mut registry = Self::new();
        for plugin in plugins {
            registry.add(plugin)?;
        }
        Ok(registry)
    }

    /// Register a plugin and all of its hooks.
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let id = plugin.id().to_string();
        if self.plugins.iter().any(|p| p.id() == id) {
            return Err(RegistryError::DuplicatePlugin(id));
        }
        for hook in plugin.hooks() {
            if matches!(hook.handler, Handler::Document(_)) && !hook.stage.has_documents() {
                return Err(RegistryError::DocumentHookOutsideDocuments {
                    plugin: id,
                    stage: hook.stage,
                });
            }
            if hook.backend.is_some() && hook.stage != Stage::Render {
                return Err(RegistryError::BackendOutsideRender {
                    plugin: id,
                    stage: hook.stage,
                });
            }
            let order = self.registrations.len();
            self.registrations.push(Registration {
                plugin_id: id.clone(),
                order,
                hook,
            });
        }
        tracing::debug!(plugin = %id, "registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn plugin_ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.id())
    }

    /// Hooks of one stage in execution order.
    pub fn hooks_for(&self, stage: Stage) -> Vec<&Registration> {
        let mut hooks: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| r.hook.stage == stage)
            .collect();
        hooks.sort_by_key(|r| (r.hook.priority, r.order));
        hooks
    }

    /// Config fields declared by all plugins.
    pub fn config_fields(&self) -> Vec<ConfigField> {
        self.plugins.iter().flat_map(|p| p.config_model()).collect()
    }

    /// Compose every plugin's front-matter fragment into one schema.
    pub fn attribute_schema(&self) -> Result<AttributeSchema, RegistryError> {
        let mut schema = AttributeSchema::new();
        for plugin in &self.plugins {
            for spec in plugin.post_model() {
                schema.register(plugin.id(), spec)?;
            }
        }
        Ok(schema)
    }

    /// Check the declared dependency graph.
    ///
    /// Context attributes and document attributes share one namespace.
    /// Within a stage an attribute is available to hooks that run after its
    /// producer.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let schema = self.attribute_schema()?;
        let mut available: BTreeSet<&str> = CORE_ATTRIBUTES.iter().copied().collect();
        for stage in Stage::ALL {
            for reg in self.hooks_for(stage) {
                if let Some(missing) = reg
                    .hook
                    .requires
                    .iter()
                    .find(|attr| !available.contains(attr.as_str()) && !schema.contains(attr))
                {
                    return Err(RegistryError::MissingDependency {
                        plugin: reg.plugin_id.clone(),
                        stage,
                        attribute: missing.clone(),
                    });
                }
                available.extend(reg.hook.produces.iter().map(String::as_str));
            }
        }
        Ok(())
    }

    /// Plugins and stages that produce an attribute, in execution order.
    pub fn producers_of(&self, attribute: &str) -> Vec<(&str, Stage)> {
        Stage::ALL
            .into_iter()
            .flat_map(|stage| self.hooks_for(stage))
            .filter(|r| r.hook.produces.iter().any(|p| p == attribute))
            .map(|r| (r.plugin_id.as_str(), r.hook.stage))
            .collect()
    }

    /// The stages that must run for `attribute` to exist: every stage up to
    /// and including its first producer. `None` if nothing produces it.
    pub fn stages_for(&self, attribute: &str) -> Option<Vec<Stage>> {
        if CORE_ATTRIBUTES.contains(&attribute) {
            return Some(Stage::ALL.into_iter().take_while(|s| *s <= Stage::Load).collect());
        }
        let (_, stage) = self.producers_of(attribute).into_iter().next()?;
        Some(Stage::ALL.into_iter().take_while(|s| *s <= stage).collect())
    }

    /// Render backends some hook implements.
    pub fn backends(&self) -> BTreeSet<&str> {
        self.registrations
            .iter()
            .filter_map(|r| r.hook.backend.as_deref())
            .collect()
    }

    /// Stable hash of the plugin set and every hook's declaration.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for reg in &self.registrations {
            hasher.update(reg.plugin_id.as_bytes());
            hasher.update(b"\0");
            hasher.update(reg.hook.signature().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugin_ids().collect::<Vec<_>>())
            .field("hooks", &self.registrations.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::document::ValueKind;

    /// A plugin assembled from a list of hooks, for tests.
    pub struct TestPlugin {
        pub id: String,
        pub hooks: Vec<Hook>,
        pub fields: Vec<FieldSpec>,
    }

    impl TestPlugin {
        pub fn new(id: &str, hooks: Vec<Hook>) -> Arc<dyn Plugin> {
            Arc::new(Self {
                id: id.to_string(),
                hooks,
                fields: Vec::new(),
            })
        }
    }

    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            &self.id
        }

        fn hooks(&self) -> Vec<Hook> {
            self.hooks.clone()
        }

        fn post_model(&self) -> Vec<FieldSpec> {
            self.fields.clone()
        }
    }

    fn noop(stage: Stage) -> Hook {
        Hook::context(stage, |_| Ok(()))
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn priority_tiers_order_hooks() {
        let registry = Registry::with_plugins([
            TestPlugin::new("late", vec![noop(Stage::Render).last()]),
            TestPlugin::new("early", vec![noop(Stage::Render).first()]),
            TestPlugin::new("middle", vec![noop(Stage::Render)]),
        ])
        .unwrap();

        let order: Vec<&str> = registry
            .hooks_for(Stage::Render)
            .iter()
            .map(|r| r.plugin_id.as_str())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn registration_order_kept_within_tier() {
        let registry = Registry::with_plugins([
            TestPlugin::new("a", vec![noop(Stage::Load)]),
            TestPlugin::new("b", vec![noop(Stage::Load)]),
            TestPlugin::new("c", vec![noop(Stage::Load)]),
        ])
        .unwrap();
        let order: Vec<&str> = registry
            .hooks_for(Stage::Load)
            .iter()
            .map(|r| r.plugin_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn hooks_for_filters_by_stage() {
        let registry = Registry::with_plugins([TestPlugin::new(
            "p",
            vec![noop(Stage::Glob), noop(Stage::Save)],
        )])
        .unwrap();
        assert_eq!(registry.hooks_for(Stage::Glob).len(), 1);
        assert!(registry.hooks_for(Stage::Render).is_empty());
    }

    // =========================================================================
    // Registration errors
    // =========================================================================

    #[test]
    fn duplicate_plugin_rejected() {
        let err = Registry::with_plugins([
            TestPlugin::new("same", vec![]),
            TestPlugin::new("same", vec![]),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePlugin(id) if id == "same"));
    }

    #[test]
    fn document_hook_in_glob_rejected() {
        let err = Registry::with_plugins([TestPlugin::new(
            "p",
            vec![Hook::document(Stage::Glob, |_, _| Ok(()))],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DocumentHookOutsideDocuments { .. }
        ));
    }

    #[test]
    fn backend_outside_render_rejected() {
        let err = Registry::with_plugins([TestPlugin::new(
            "p",
            vec![Hook::document(Stage::PostRender, |_, _| Ok(())).backend("md")],
        )])
        .unwrap_err();
        assert!(matches!(err, RegistryError::BackendOutsideRender { .. }));
    }

    // =========================================================================
    // Dependency contract
    // =========================================================================

    #[test]
    fn missing_dependency_detected_before_running() {
        let registry = Registry::with_plugins([TestPlugin::new(
            "feeds",
            vec![noop(Stage::PostRender).requires(["articles"])],
        )])
        .unwrap();
        let err = registry.validate().unwrap_err();
        match err {
            RegistryError::MissingDependency {
                plugin, attribute, ..
            } => {
                assert_eq!(plugin, "feeds");
                assert_eq!(attribute, "articles");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dependency_satisfied_by_earlier_stage() {
        let registry = Registry::with_plugins([
            TestPlugin::new("feeds", vec![noop(Stage::PostRender).requires(["articles"])]),
            TestPlugin::new("collect", vec![noop(Stage::Load).produces(["articles"])]),
        ])
        .unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn dependency_in_same_stage_must_run_first() {
        let registry = Registry::with_plugins([
            TestPlugin::new("use", vec![noop(Stage::Render).requires(["html"])]),
            TestPlugin::new("make", vec![noop(Stage::Render).produces(["html"])]),
        ])
        .unwrap();
        assert!(registry.validate().is_err());

        let registry = Registry::with_plugins([
            TestPlugin::new("use", vec![noop(Stage::Render).requires(["html"])]),
            TestPlugin::new("make", vec![noop(Stage::Render).first().produces(["html"])]),
        ])
        .unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn declared_front_matter_satisfies_requirement() {
        let plugin: Arc<dyn Plugin> = Arc::new(TestPlugin {
            id: "dates".into(),
            hooks: vec![noop(Stage::Render).requires(["date"])],
            fields: vec![FieldSpec::optional("date", ValueKind::Date)],
        });
        let registry = Registry::with_plugins([plugin]).unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn core_attributes_always_available() {
        let registry = Registry::with_plugins([TestPlugin::new(
            "p",
            vec![noop(Stage::Load).requires(["body", "slug"])],
        )])
        .unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn stages_for_attribute() {
        let registry = Registry::with_plugins([TestPlugin::new(
            "md",
            vec![noop(Stage::Render).produces(["html"])],
        )])
        .unwrap();
        assert_eq!(
            registry.stages_for("html"),
            Some(vec![
                Stage::Configure,
                Stage::Glob,
                Stage::Load,
                Stage::PreRender,
                Stage::Render
            ])
        );
        assert_eq!(registry.stages_for("nothing"), None);
        assert_eq!(registry.producers_of("html"), vec![("md", Stage::Render)]);
    }

    #[test]
    fn fingerprint_changes_with_hooks() {
        let a = Registry::with_plugins([TestPlugin::new("p", vec![noop(Stage::Render)])]).unwrap();
        let b = Registry::with_plugins([TestPlugin::new("p", vec![noop(Stage::Render)])]).unwrap();
        let c = Registry::with_plugins([TestPlugin::new("p", vec![noop(Stage::Render).last()])])
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn stage_names_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("render_all".parse::<Stage>().is_err());
    }
}
