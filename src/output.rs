//! CLI output formatting.
//!
//! Human-facing summaries of builds, checks and failures. Diagnostics go
//! through `tracing`; this module only produces what the user asked for.
//!
//! # Output Format
//!
//! ## Build
//!
//! ```text
//! Documents
//!     3 loaded: 1 processed, 2 skipped, 0 failed
//! Output → out/
//!     1 written, 2 unchanged
//!     a/index.html
//! Cache
//!     2 hits, 1 misses (66.7% hit rate)
//! Stages
//!     configure      0.1ms
//!     ...
//! ```
//!
//! ## Failure
//!
//! ```text
//! Build failed in render
//!     a.md [markdown]: boom
//! ```
//!
//! # Architecture
//!
//! Each report has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout or stderr.
//! Format functions are pure: no I/O, no side effects.

use crate::hooks::{Handler, Priority, Registry, Stage};
use crate::runner::{BuildError, BuildReport};
use std::error::Error;
use std::time::Duration;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.1}ms", ms)
    }
}

// ============================================================================
// Build
// ============================================================================

pub fn format_build_report(report: &BuildReport) -> Vec<String> {
    let mut lines = Vec::new();

    lines.push("Documents".to_string());
    lines.push(format!(
        "{}{} loaded: {} processed, {} skipped, {} failed",
        indent(1),
        report.documents,
        report.processed(),
        report.skipped,
        report.failed.len()
    ));

    if !report.failed.is_empty() {
        lines.push("Failed".to_string());
        for failure in &report.failed {
            lines.push(format!("{}{}", indent(1), failure.path.display()));
            lines.push(format!("{}{}", indent(2), failure.reason));
        }
    }

    lines.push(format!("Output → {}/", report.output_dir.display()));
    lines.push(format!(
        "{}{} written, {} unchanged",
        indent(1),
        report.written,
        report.unchanged
    ));
    for path in &report.changed_files {
        lines.push(format!(
            "{}{}",
            indent(1),
            path.to_string_lossy().replace('\\', "/")
        ));
    }

    lines.push("Cache".to_string());
    lines.push(format!("{}{}", indent(1), report.cache));

    if !report.timings.is_empty() {
        lines.push("Stages".to_string());
        for timing in &report.timings {
            lines.push(format!(
                "{}{:<14} {}",
                indent(1),
                timing.stage.name(),
                format_duration(timing.elapsed)
            ));
        }
    }
    lines
}

pub fn print_build_report(report: &BuildReport) {
    for line in format_build_report(report) {
        println!("{}", line);
    }
}

/// Describe a failed build: the stage, plugin and document involved, then
/// the chain of underlying causes.
pub fn format_build_error(error: &BuildError) -> Vec<String> {
    let mut lines = Vec::new();
    match error {
        BuildError::Stage { stage, failures } => {
            lines.push(format!("Build failed in {}", stage));
            for failure in failures {
                lines.push(format!("{}{}", indent(1), failure));
            }
        }
        BuildError::Hook {
            stage,
            plugin,
            source,
        } => {
            lines.push(format!("Build failed in {}", stage));
            lines.push(format!("{}[{}]: {}", indent(1), plugin, source));
            let mut cause = source.source();
            while let Some(inner) = cause {
                lines.push(format!("{}caused by: {}", indent(2), inner));
                cause = inner.source();
            }
        }
        BuildError::Interrupted => lines.push("Build interrupted".to_string()),
        other => {
            lines.push(format!("Build failed: {}", other));
            let mut cause = other.source();
            while let Some(inner) = cause {
                lines.push(format!("{}caused by: {}", indent(1), inner));
                cause = inner.source();
            }
        }
    }
    lines
}

pub fn print_build_error(error: &BuildError) {
    for line in format_build_error(error) {
        eprintln!("{}", line);
    }
}

// ============================================================================
// Check
// ============================================================================

fn priority_name(priority: Priority) -> &'static str {
    match priority {
        Priority::First => "first",
        Priority::Normal => "normal",
        Priority::Last => "last",
    }
}

/// Plugins and the hook table, stage by stage.
pub fn format_registry(registry: &Registry) -> Vec<String> {
    let mut lines = vec!["Plugins".to_string()];
    for (i, id) in registry.plugin_ids().enumerate() {
        lines.push(format!("{}{} {}", indent(1), format_index(i + 1), id));
    }

    lines.push("Hooks".to_string());
    for stage in Stage::ALL {
        let hooks = registry.hooks_for(stage);
        if hooks.is_empty() {
            continue;
        }
        lines.push(format!("{}{}", indent(1), stage));
        for reg in hooks {
            let hook = &reg.hook;
            let kind = match hook.handler {
                Handler::Context(_) => "context",
                Handler::Document(_) => "document",
            };
            let mut line = format!(
                "{}{} ({}, {})",
                indent(2),
                reg.plugin_id,
                kind,
                priority_name(hook.priority)
            );
            if let Some(backend) = &hook.backend {
                line.push_str(&format!(" backend={}", backend));
            }
            if !hook.produces.is_empty() {
                line.push_str(&format!(" → {}", hook.produces.join(", ")));
            }
            lines.push(line);
        }
    }
    lines
}

pub fn format_check_report(registry: &Registry, report: &BuildReport) -> Vec<String> {
    let mut lines = format_registry(registry);
    lines.push("Documents".to_string());
    lines.push(format!(
        "{}{} found, {} failed",
        indent(1),
        report.documents,
        report.failed.len()
    ));
    for failure in &report.failed {
        lines.push(format!("{}{}", indent(1), failure.path.display()));
        lines.push(format!("{}{}", indent(2), failure.reason));
    }
    lines
}

pub fn print_check_report(registry: &Registry, report: &BuildReport) {
    for line in format_check_report(registry, report) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::hooks::{Hook, HookError};
    use crate::hooks::tests::TestPlugin;
    use crate::runner::{DocFailure, HookFailure, StageTiming};
    use std::path::PathBuf;

    fn report() -> BuildReport {
        BuildReport {
            documents: 3,
            skipped: 2,
            failed: Vec::new(),
            written: 1,
            unchanged: 2,
            changed_files: vec![PathBuf::from("a/index.html")],
            cache: CacheStats { hits: 2, misses: 1 },
            timings: vec![StageTiming {
                stage: Stage::Render,
                elapsed: Duration::from_micros(1500),
            }],
            output_dir: PathBuf::from("out"),
            ..BuildReport::default()
        }
    }

    #[test]
    fn build_report_lines() {
        let lines = format_build_report(&report());
        assert_eq!(
            lines,
            vec![
                "Documents",
                "    3 loaded: 1 processed, 2 skipped, 0 failed",
                "Output → out/",
                "    1 written, 2 unchanged",
                "    a/index.html",
                "Cache",
                "    2 hits, 1 misses (66.7% hit rate)",
                "Stages",
                "    render         1.5ms",
            ]
        );
    }

    #[test]
    fn build_report_lists_failures() {
        let mut r = report();
        r.failed.push(DocFailure {
            path: PathBuf::from("b.md"),
            reason: "missing title".into(),
        });
        let lines = format_build_report(&r);
        let at = lines.iter().position(|l| l == "Failed").unwrap();
        assert_eq!(lines[at + 1], "    b.md");
        assert_eq!(lines[at + 2], "        missing title");
    }

    #[test]
    fn stage_error_names_stage_plugin_and_document() {
        let err = BuildError::Stage {
            stage: Stage::Render,
            failures: vec![HookFailure {
                plugin: "markdown".into(),
                document: PathBuf::from("a.md"),
                error: HookError::msg("boom"),
            }],
        };
        assert_eq!(
            format_build_error(&err),
            vec!["Build failed in render", "    a.md [markdown]: boom"]
        );
    }

    #[test]
    fn hook_error_names_plugin() {
        let err = BuildError::Hook {
            stage: Stage::Configure,
            plugin: "collections".into(),
            source: HookError::msg("bad filter"),
        };
        let lines = format_build_error(&err);
        assert_eq!(lines[0], "Build failed in configure");
        assert_eq!(lines[1], "    [collections]: bad filter");
    }

    #[test]
    fn registry_listing() {
        let registry = Registry::with_plugins([TestPlugin::new(
            "md",
            vec![
                Hook::document(Stage::Render, |_, _| Ok(()))
                    .backend("markdown")
                    .produces(["html"]),
            ],
        )])
        .unwrap();
        let lines = format_registry(&registry);
        assert_eq!(
            lines,
            vec![
                "Plugins",
                "    001 md",
                "Hooks",
                "    render",
                "        md (document, normal) backend=markdown → html",
            ]
        );
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_micros(300)), "0.3ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
    }
}
