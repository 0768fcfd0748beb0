//! File discovery for the glob stage.
//!
//! Plugins contribute glob patterns (`**/*.md`) during `glob`. The runner
//! walks the source directory once, keeps every file matching *any*
//! pattern, and drops files matched by an ignore rule. The result is
//! sorted and contains each path once, however many patterns matched it.
//!
//! ## Ignore rules
//!
//! Ignore rules come from `.plinthignore` in the source directory and the
//! `build.ignore` config key. The syntax is a subset of `.gitignore`:
//!
//! - blank lines and lines starting with `#` are skipped
//! - a pattern without `/` matches a file or directory name at any depth
//! - a pattern containing `/` matches the path from the source root
//! - a trailing `/` matches directories only
//! - a leading `!` re-includes files an earlier rule excluded
//!
//! Hidden entries (names starting with `.`) are never discovered, and the
//! output and cache directories are pruned when they live inside the
//! source tree. Symlinks to files are followed; symlinked directories are
//! not descended into.

use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Ignore file read from the source root.
pub const IGNORE_FILE: &str = ".plinthignore";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("source directory not found: {0}")]
    MissingSource(PathBuf),
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

fn compile(pattern: &str) -> Result<Pattern, DiscoverError> {
    Pattern::new(pattern).map_err(|e| DiscoverError::Pattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

// =============================================================================
// Ignore rules
// =============================================================================

#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: Pattern,
    /// Match the whole relative path rather than a single name.
    anchored: bool,
    dir_only: bool,
    negated: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Result<Option<Self>, DiscoverError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (negated, line) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, line) = match line.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let anchored = line.contains('/');
        let line = line.trim_start_matches('/');
        Ok(Some(Self {
            pattern: compile(line)?,
            anchored,
            dir_only,
            negated,
        }))
    }

    fn matches(&self, rel: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.anchored {
            self.pattern.matches_with(rel, MATCH_OPTIONS)
        } else {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            self.pattern.matches_with(name, MATCH_OPTIONS)
        }
    }
}

/// Ordered ignore rules; the last matching rule decides.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    pub fn parse<'a, I>(lines: I) -> Result<Self, DiscoverError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut rules = Vec::new();
        for line in lines {
            if let Some(rule) = IgnoreRule::parse(line)? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    /// Rules from `<source>/.plinthignore` (if present) followed by `extra`.
    pub fn load(source_dir: &Path, extra: &[String]) -> Result<Self, DiscoverError> {
        let path = source_dir.join(IGNORE_FILE);
        let file_text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(DiscoverError::Io { path, source }),
        };
        Self::parse(file_text.lines().chain(extra.iter().map(String::as_str)))
    }

    pub fn is_ignored(&self, rel: &str, is_dir: bool) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|r| r.matches(rel, is_dir))
            .is_some_and(|r| !r.negated)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Walk `source_dir` and return files matching any of `patterns`, relative
/// to the source directory.
///
/// `prune` lists absolute directories never to descend into (the output and
/// cache directories).
pub fn discover(
    source_dir: &Path,
    patterns: &[String],
    ignore: &IgnoreRules,
    prune: &[PathBuf],
) -> Result<Vec<PathBuf>, DiscoverError> {
    if !source_dir.is_dir() {
        return Err(DiscoverError::MissingSource(source_dir.to_path_buf()));
    }
    let root = source_dir
        .canonicalize()
        .map_err(|source| DiscoverError::Io {
            path: source_dir.to_path_buf(),
            source,
        })?;
    // Directories that do not exist yet have nothing to prune.
    let prune: Vec<PathBuf> = prune.iter().filter_map(|p| p.canonicalize().ok()).collect();
    let compiled = patterns
        .iter()
        .map(|p| compile(p.trim_start_matches("./")))
        .collect::<Result<Vec<_>, _>>()?;
    if compiled.is_empty() {
        tracing::warn!("no discovery patterns registered, nothing to build");
        return Ok(Vec::new());
    }

    let mut found = BTreeSet::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                return false;
            }
            if prune.iter().any(|p| entry.path() == p) {
                return false;
            }
            let rel = relative_slash(&root, entry.path());
            !(entry.file_type().is_dir() && ignore.is_ignored(&rel, true))
        });

    for entry in walker {
        let entry = entry?;
        let rel = relative_slash(&root, entry.path());
        if !is_source_file(&entry, &rel) {
            continue;
        }
        if ignore.is_ignored(&rel, false) {
            tracing::trace!(path = %rel, "ignored");
            continue;
        }
        if compiled.iter().any(|p| p.matches_with(&rel, MATCH_OPTIONS)) {
            found.insert(PathBuf::from(rel));
        }
    }
    tracing::debug!(files = found.len(), patterns = patterns.len(), "discovered");
    Ok(found.into_iter().collect())
}

fn is_source_file(entry: &walkdir::DirEntry, rel: &str) -> bool {
    if !entry.path_is_symlink() {
        return entry.file_type().is_file();
    }
    match std::fs::metadata(entry.path()) {
        Ok(meta) if meta.is_file() => true,
        Ok(_) => {
            tracing::debug!(path = %rel, "not following symlinked directory");
            false
        }
        Err(e) => {
            tracing::debug!(path = %rel, error = %e, "dropping broken symlink");
            false
        }
    }
}

fn relative_slash(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(files: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for file in files {
            let path = tmp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        tmp
    }

    fn names(found: Vec<PathBuf>) -> Vec<String> {
        found
            .into_iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // =========================================================================
    // Pattern union
    // =========================================================================

    #[test]
    fn recursive_pattern_matches_root_and_nested() {
        let tmp = tree(&["a.md", "blog/b.md", "blog/deep/c.md", "d.txt"]);
        let found = discover(
            tmp.path(),
            &patterns(&["**/*.md"]),
            &IgnoreRules::default(),
            &[],
        )
        .unwrap();
        assert_eq!(names(found), vec!["a.md", "blog/b.md", "blog/deep/c.md"]);
    }

    #[test]
    fn overlapping_patterns_are_deduplicated() {
        let tmp = tree(&["a.md", "b.txt"]);
        let found = discover(
            tmp.path(),
            &patterns(&["**/*.md", "*.md", "**/*.txt"]),
            &IgnoreRules::default(),
            &[],
        )
        .unwrap();
        assert_eq!(names(found), vec!["a.md", "b.txt"]);
    }

    #[test]
    fn single_star_stays_in_one_directory() {
        let tmp = tree(&["a.md", "blog/b.md"]);
        let found = discover(tmp.path(), &patterns(&["*.md"]), &IgnoreRules::default(), &[])
            .unwrap();
        assert_eq!(names(found), vec!["a.md"]);
    }

    #[test]
    fn no_patterns_finds_nothing() {
        let tmp = tree(&["a.md"]);
        let found = discover(tmp.path(), &[], &IgnoreRules::default(), &[]).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn missing_source_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = discover(
            &tmp.path().join("nope"),
            &patterns(&["**/*.md"]),
            &IgnoreRules::default(),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DiscoverError::MissingSource(_)));
    }

    #[test]
    fn invalid_pattern_is_error() {
        let tmp = tree(&["a.md"]);
        let err = discover(tmp.path(), &patterns(&["[*.md"]), &IgnoreRules::default(), &[])
            .unwrap_err();
        assert!(matches!(err, DiscoverError::Pattern { .. }));
    }

    // =========================================================================
    // Ignoring and pruning
    // =========================================================================

    #[test]
    fn hidden_entries_skipped() {
        let tmp = tree(&["a.md", ".draft.md", ".git/x.md"]);
        let found = discover(
            tmp.path(),
            &patterns(&["**/*.md"]),
            &IgnoreRules::default(),
            &[],
        )
        .unwrap();
        assert_eq!(names(found), vec!["a.md"]);
    }

    #[test]
    fn ignore_file_rules_apply() {
        let tmp = tree(&["a.md", "drafts/b.md", "notes/c.md", "notes/keep.md", "x/wip.md"]);
        fs::write(
            tmp.path().join(IGNORE_FILE),
            "# comment\n\ndrafts/\nnotes/*.md\n!notes/keep.md\nwip.md\n",
        )
        .unwrap();
        let rules = IgnoreRules::load(tmp.path(), &[]).unwrap();
        let found = discover(tmp.path(), &patterns(&["**/*.md"]), &rules, &[]).unwrap();
        assert_eq!(names(found), vec!["a.md", "notes/keep.md"]);
    }

    #[test]
    fn config_ignores_append_to_file_rules() {
        let tmp = tree(&["a.md", "b.md"]);
        let rules = IgnoreRules::load(tmp.path(), &["b.md".to_string()]).unwrap();
        let found = discover(tmp.path(), &patterns(&["**/*.md"]), &rules, &[]).unwrap();
        assert_eq!(names(found), vec!["a.md"]);
    }

    #[test]
    fn pruned_directories_not_walked() {
        let tmp = tree(&["a.md", "out/a/index.md"]);
        let found = discover(
            tmp.path(),
            &patterns(&["**/*.md"]),
            &IgnoreRules::default(),
            &[tmp.path().join("out")],
        )
        .unwrap();
        assert_eq!(names(found), vec!["a.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_discovered() {
        use std::os::unix::fs::symlink;

        let tmp = tree(&["a.md"]);
        let elsewhere = TempDir::new().unwrap();
        fs::write(elsewhere.path().join("shared.md"), "x").unwrap();
        symlink(elsewhere.path().join("shared.md"), tmp.path().join("linked.md")).unwrap();
        symlink(tmp.path().join("gone.md"), tmp.path().join("broken.md")).unwrap();

        let found = discover(
            tmp.path(),
            &patterns(&["**/*.md"]),
            &IgnoreRules::default(),
            &[],
        )
        .unwrap();
        assert_eq!(names(found), vec!["a.md", "linked.md"]);
    }

    #[test]
    fn dir_only_rule_does_not_match_files() {
        let rules = IgnoreRules::parse(["build/"]).unwrap();
        assert!(rules.is_ignored("build", true));
        assert!(!rules.is_ignored("build", false));
    }
}
