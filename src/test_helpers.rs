//! Shared test utilities for the plinth test suite.
//!
//! Builds throwaway source trees and looks things up in build reports,
//! panicking with a readable message when something is missing.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = site(&[("a.md", "# A"), ("blog/b.md", "# B")]);
//! let report = build(config, RunOptions::new(tmp.path())).unwrap();
//!
//! assert_eq!(output_files(tmp.path().join("out")), vec!["a/index.html", "blog/b/index.html"]);
//! let failure = find_failure(&report, "b.md");
//! ```

use std::path::Path;
use std::sync::Once;
use tempfile::TempDir;

use crate::runner::{BuildReport, DocFailure};

// =========================================================================
// Logging
// =========================================================================

/// Route `tracing` output through the test harness. Safe to call repeatedly.
///
/// Honors `PLINTH_LOG` so a failing test can be rerun with more detail.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("PLINTH_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// =========================================================================
// Fixture setup
// =========================================================================

/// Write `files` (path, contents) under a fresh temp directory.
pub fn write_tree(files: &[(&str, &str)]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    for (path, content) in files {
        let full = tmp.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .unwrap_or_else(|e| panic!("cannot create {}: {e}", parent.display()));
        }
        std::fs::write(&full, content)
            .unwrap_or_else(|e| panic!("cannot write {}: {e}", full.display()));
    }
    tmp
}

/// Like [`write_tree`], with every file placed under `content/` (the default
/// source directory). `content/` exists even when `files` is empty.
pub fn site(files: &[(&str, &str)]) -> TempDir {
    init_test_logging();
    let tmp = TempDir::new().unwrap();
    let content = tmp.path().join("content");
    std::fs::create_dir_all(&content).unwrap();
    for (path, text) in files {
        let full = content.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full, text)
            .unwrap_or_else(|e| panic!("cannot write {}: {e}", full.display()));
    }
    tmp
}

// =========================================================================
// Lookups: panic with a clear message on miss
// =========================================================================

/// Every regular file under `dir`, relative and `/`-separated, sorted.
pub fn output_files(dir: impl AsRef<Path>) -> Vec<String> {
    let dir = dir.as_ref();
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

/// Read an output file. Panics listing what does exist if it is missing.
pub fn read_output(dir: impl AsRef<Path>, rel: &str) -> String {
    let dir = dir.as_ref();
    std::fs::read_to_string(dir.join(rel)).unwrap_or_else(|_| {
        let existing = output_files(dir);
        panic!("output '{rel}' not found. Available: {existing:?}")
    })
}

/// Find the failure recorded for `path`. Panics if the document did not fail.
pub fn find_failure<'a>(report: &'a BuildReport, path: &str) -> &'a DocFailure {
    report
        .failed
        .iter()
        .find(|f| f.path == Path::new(path))
        .unwrap_or_else(|| {
            let failed: Vec<_> = report.failed.iter().map(|f| f.path.display().to_string()).collect();
            panic!("no failure recorded for '{path}'. Failed: {failed:?}")
        })
}
