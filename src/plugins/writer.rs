//! Writes each document's `page` to `<output>/<slug>/index.html`.
//!
//! Goes through the [`OutputWriter`](crate::context::OutputWriter), so a
//! page whose bytes are already on disk is not rewritten.

use crate::context::DocView;
use crate::document::Document;
use crate::hooks::{Hook, HookError, Plugin, Stage};

pub struct Writer;

impl Plugin for Writer {
    fn id(&self) -> &str {
        "writer"
    }

    fn hooks(&self) -> Vec<Hook> {
        vec![Hook::document(Stage::Save, save).requires(["page"])]
    }
}

fn save(view: &DocView<'_>, doc: &mut Document) -> Result<(), HookError> {
    if doc.skip {
        return Ok(());
    }
    let Some(page) = doc.get_str("page") else {
        tracing::debug!(path = %doc.path().display(), "no page to write");
        return Ok(());
    };
    let output = doc.output_path();
    view.writer
        .write_if_changed(&output, page.as_bytes())
        .map_err(|source| HookError::Io {
            path: view.writer.root().join(&output),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::config::ConfigSnapshot;
    use crate::context::{OutputWriter, WriteOutcome};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn run_save(writer: &OutputWriter, doc: &mut Document) -> Result<(), HookError> {
        let config = ConfigSnapshot::defaults().unwrap();
        let cache = ContentCache::in_memory(None);
        let attrs = BTreeMap::new();
        let view = DocView {
            config: &config,
            cache: &cache,
            writer,
            attrs: &attrs,
            stage: Stage::Save,
            source_dir: Path::new("content"),
        };
        save(&view, doc)
    }

    fn with_page(path: &str, page: &str) -> Document {
        let mut doc = Document::parse(path, "x").unwrap();
        doc.enter_stage(Stage::PostRender);
        doc.set("page", page).unwrap();
        doc.enter_stage(Stage::Save);
        doc
    }

    #[test]
    fn writes_page_under_slug() {
        let tmp = TempDir::new().unwrap();
        let writer = OutputWriter::new(tmp.path());
        let mut doc = with_page("blog/Hello World.md", "<html>hi</html>");
        run_save(&writer, &mut doc).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("blog/hello-world/index.html")).unwrap(),
            "<html>hi</html>"
        );
    }

    #[test]
    fn index_document_writes_root_page() {
        let tmp = TempDir::new().unwrap();
        let writer = OutputWriter::new(tmp.path());
        let mut doc = with_page("index.md", "home");
        run_save(&writer, &mut doc).unwrap();
        assert!(tmp.path().join("index.html").is_file());
    }

    #[test]
    fn unchanged_page_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let writer = OutputWriter::new(tmp.path());
        let mut doc = with_page("a.md", "same");
        run_save(&writer, &mut doc).unwrap();
        run_save(&writer, &mut doc).unwrap();
        assert_eq!(writer.written(), 1);
        assert_eq!(writer.unchanged(), 1);
        assert_eq!(
            writer.write_if_changed(Path::new("a/index.html"), b"same").unwrap(),
            WriteOutcome::Unchanged
        );
    }

    #[test]
    fn skipped_document_not_written() {
        let tmp = TempDir::new().unwrap();
        let writer = OutputWriter::new(tmp.path());
        let mut doc = with_page("a.md", "page");
        doc.skip = true;
        run_save(&writer, &mut doc).unwrap();
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn write_error_names_the_path() {
        let tmp = TempDir::new().unwrap();
        // A file where the slug directory should be.
        fs::write(tmp.path().join("a"), "blocker").unwrap();
        let writer = OutputWriter::new(tmp.path());
        let mut doc = with_page("a.md", "page");
        let err = run_save(&writer, &mut doc).unwrap_err();
        match err {
            HookError::Io { path, .. } => assert!(path.ends_with("a/index.html")),
            other => panic!("unexpected: {other}"),
        }
    }
}
