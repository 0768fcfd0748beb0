//! Incremental builds: deciding which documents need no reprocessing.
//!
//! A document is *done* when a previous build rendered and saved it from
//! exactly the same inputs. The done record lives in the
//! [content cache](crate::cache) under a key derived from:
//!
//! - the document's source path and the SHA-256 of its raw bytes
//! - the config fingerprint (a changed theme re-renders everything)
//! - the registry fingerprint (adding or reordering hooks does too)
//!
//! The stored value is the output path the document was saved to, plus the
//! derived attributes it carried at the end of that build. At load time the
//! document is skipped only if the record exists *and* that file is still on
//! disk, so deleting an output file forces it to be rebuilt. A skipped
//! document gets its recorded attributes back, so filters and sorts over
//! `description` or `html` see the same values as in a full build.
//!
//! Skipping is purely an optimization. With `PLINTH_NO_SKIP=1` (or
//! `skip.enabled = false`) every document is processed, and the output must
//! be byte-identical.

use crate::cache::{ContentCache, KeyBuilder, Ttl};
use crate::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable that disables skipping when set to a truthy value.
pub const NO_SKIP_ENV: &str = "PLINTH_NO_SKIP";

/// Bump when the meaning of a done record changes.
const SKIP_VERSION: &str = "2";

/// SHA-256 of a document's raw bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Whether the environment asks for skipping to be disabled.
pub fn no_skip_requested() -> bool {
    std::env::var(NO_SKIP_ENV).is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// What a completed build left behind for one document.
#[derive(Debug, Serialize, Deserialize)]
struct DoneRecord {
    output: String,
    #[serde(default)]
    fields: Value,
}

/// Reads and writes done records for one build.
#[derive(Debug, Clone)]
pub struct SkipEngine {
    cache: Arc<ContentCache>,
    output_dir: PathBuf,
    config_fingerprint: String,
    registry_fingerprint: String,
    enabled: bool,
}

impl SkipEngine {
    pub fn new(
        cache: Arc<ContentCache>,
        output_dir: impl Into<PathBuf>,
        config_fingerprint: &str,
        registry_fingerprint: &str,
        enabled: bool,
    ) -> Self {
        Self {
            cache,
            output_dir: output_dir.into(),
            config_fingerprint: config_fingerprint.to_string(),
            registry_fingerprint: registry_fingerprint.to_string(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cache key of a document's done record.
    pub fn key_for(&self, doc: &Document) -> String {
        KeyBuilder::new("skip", SKIP_VERSION)
            .str(&self.config_fingerprint)
            .str(&self.registry_fingerprint)
            .str(&doc.path().to_string_lossy())
            .str(doc.content_hash())
            .finish()
    }

    /// The document's done record, if there is one and its output is still
    /// on disk.
    fn done_record(&self, doc: &Document) -> Option<DoneRecord> {
        if !self.enabled {
            return None;
        }
        let raw = self.cache.get(&self.key_for(doc))?;
        let record: DoneRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %doc.path().display(), error = %e, "unreadable done record");
                return None;
            }
        };
        if !self.output_dir.join(&record.output).is_file() {
            tracing::debug!(path = %doc.path().display(), output = %record.output, "done record without output");
            return None;
        }
        Some(record)
    }

    /// True if a previous build completed this exact document and its
    /// output is still present.
    pub fn should_skip(&self, doc: &Document) -> bool {
        self.done_record(doc).is_some()
    }

    /// Like [`SkipEngine::should_skip`], and on a hit also restores the
    /// derived attributes recorded with the output and sets `doc.skip`.
    pub fn resume(&self, doc: &mut Document) -> bool {
        let Some(record) = self.done_record(doc) else {
            return false;
        };
        if !doc.restore_derived(record.fields) {
            tracing::debug!(path = %doc.path().display(), "done record attributes unreadable, rebuilding");
            return false;
        }
        doc.skip = true;
        true
    }

    /// Record a document as done. Only call this after every save hook
    /// finished with it; a record for a missing file is refused.
    pub fn mark_done(&self, doc: &Document) -> bool {
        if doc.is_failed() {
            return false;
        }
        let output = doc.output_path();
        if !self.output_dir.join(&output).is_file() {
            tracing::debug!(path = %doc.path().display(), "not marking done, output missing");
            return false;
        }
        let record = DoneRecord {
            output: path_to_slash(&output),
            fields: doc.derived_snapshot(),
        };
        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                self.cache.set(&self.key_for(doc), bytes, Ttl::Default);
                true
            }
            Err(e) => {
                tracing::warn!(path = %doc.path().display(), error = %e, "cannot encode done record");
                false
            }
        }
    }
}

fn path_to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir, cache: &Arc<ContentCache>, enabled: bool) -> SkipEngine {
        SkipEngine::new(Arc::clone(cache), tmp.path(), "cfg", "reg", enabled)
    }

    fn write_output(tmp: &TempDir, doc: &Document) {
        let path = tmp.path().join(doc.output_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "<html></html>").unwrap();
    }

    // =========================================================================
    // content_hash
    // =========================================================================

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"X"), content_hash(b"Y"));
    }

    // =========================================================================
    // should_skip / mark_done
    // =========================================================================

    #[test]
    fn unseen_document_is_not_skipped() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let doc = Document::parse("a.md", "X").unwrap();
        assert!(!engine(&tmp, &cache, true).should_skip(&doc));
    }

    #[test]
    fn done_document_with_output_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let skip = engine(&tmp, &cache, true);
        let doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);

        assert!(skip.mark_done(&doc));
        assert!(skip.should_skip(&doc));
    }

    #[test]
    fn mark_done_refuses_missing_output() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let doc = Document::parse("a.md", "X").unwrap();
        assert!(!engine(&tmp, &cache, true).mark_done(&doc));
        assert!(cache.is_empty());
    }

    #[test]
    fn mark_done_refuses_failed_document() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let mut doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        doc.mark_failed("boom");
        assert!(!engine(&tmp, &cache, true).mark_done(&doc));
    }

    #[test]
    fn resume_restores_derived_attributes() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let skip = engine(&tmp, &cache, true);
        let mut doc = Document::parse("a.md", "X").unwrap();
        doc.enter_stage(crate::hooks::Stage::PostRender);
        doc.set("description", "First paragraph").unwrap();
        write_output(&tmp, &doc);
        assert!(skip.mark_done(&doc));

        let mut next = Document::parse("a.md", "X").unwrap();
        assert!(skip.resume(&mut next));
        assert!(next.skip);
        assert_eq!(next.description(), Some("First paragraph"));
    }

    #[test]
    fn plain_path_record_is_not_trusted() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let skip = engine(&tmp, &cache, true);
        let mut doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        cache.set(&skip.key_for(&doc), "a/index.html", Ttl::Default);

        assert!(!skip.resume(&mut doc));
        assert!(!doc.skip);
    }

    #[test]
    fn deleted_output_is_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let skip = engine(&tmp, &cache, true);
        let doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        skip.mark_done(&doc);

        fs::remove_file(tmp.path().join(doc.output_path())).unwrap();
        assert!(!skip.should_skip(&doc));
    }

    #[test]
    fn edited_content_is_not_skipped() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let skip = engine(&tmp, &cache, true);
        let doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        skip.mark_done(&doc);

        let edited = Document::parse("a.md", "X2").unwrap();
        assert!(!skip.should_skip(&edited));
    }

    #[test]
    fn fingerprint_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        engine(&tmp, &cache, true).mark_done(&doc);

        let other = SkipEngine::new(Arc::clone(&cache), tmp.path(), "cfg2", "reg", true);
        assert!(!other.should_skip(&doc));
    }

    #[test]
    fn disabled_engine_never_skips() {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::in_memory(None));
        let doc = Document::parse("a.md", "X").unwrap();
        write_output(&tmp, &doc);
        engine(&tmp, &cache, true).mark_done(&doc);

        assert!(!engine(&tmp, &cache, false).should_skip(&doc));
    }

    #[test]
    fn truthy_env_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("YES"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }
}
