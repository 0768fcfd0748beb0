//! # Plinth
//!
//! A content build pipeline driven by plugins. The core knows nothing about
//! Markdown or HTML: it resolves configuration, finds source files, loads
//! them as documents and walks every plugin hook through a fixed sequence of
//! stages. Everything that makes a site, from rendering to writing pages,
//! is a plugin.
//!
//! # Architecture: Staged Hooks
//!
//! ```text
//! configure → glob → load → pre_render → render → post_render → save → teardown
//! ```
//!
//! - **Context hooks** run once per stage and see the whole [`context::BuildContext`].
//! - **Document hooks** run once per document on a worker pool and see only
//!   that document plus a read-only [`context::DocView`].
//!
//! Within a stage, hooks run by priority tier (`first`, `normal`, `last`) and
//! then by registration order. Hooks declare the document fields they
//! `produce` and `require`; the [`hooks::Registry`] checks that graph before
//! the first stage starts, so a missing producer fails the build up front
//! rather than halfway through a render.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | Layered TOML configuration: defaults, user file, project file, `PLINTH_*` env, `-s` flags |
//! | [`hooks`] | Stages, priorities, the `Plugin` trait and the hook registry |
//! | [`runner`] | Drives one build through every stage; teardown always runs |
//! | [`context`] | Shared build state, the per-document view, the change-aware output writer |
//! | [`document`] | Source files with front matter, attributes and stage-scoped mutation |
//! | [`discover`] | Glob matching over the source tree with `.plinthignore` support |
//! | [`cache`] | Persistent content-addressed cache with TTL and hit statistics |
//! | [`skip`] | Skips documents whose inputs match a previous successful build |
//! | [`expr`] | Filter and sort expressions used by collections |
//! | [`plugins`] | The default plugin set: markdown, description, collections, layout, writer |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Incremental by Default
//!
//! A document is skipped when its content, the resolved configuration and the
//! set of registered hooks all match a previous build whose output still
//! exists. Skipped documents keep flowing through the stages so that
//! aggregate views such as collections still see them, with the derived
//! attributes recorded by the build that produced their output. Plugins
//! that do per-document work check `doc.skip` and return early.
//!
//! ## Unchanged Outputs Are Not Rewritten
//!
//! Writes go through [`context::OutputWriter`], which compares bytes before
//! touching the disk. A rebuild with no source changes leaves every output
//! file's mtime alone, which keeps rsync-style deploys cheap.
//!
//! ## One Bad Document Does Not Sink the Build
//!
//! With `validation.mode = "document"` (the default), a document that fails
//! to load or validate is reported and excluded; the others still build. Set
//! `validation.mode = "strict"` to fail fast instead.

pub mod cache;
pub mod config;
pub mod context;
pub mod discover;
pub mod document;
pub mod expr;
pub mod hooks;
pub mod output;
pub mod plugins;
pub mod runner;
pub mod skip;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Name used for the config directory, the env prefix and log targets.
pub const TOOL_NAME: &str = "plinth";
