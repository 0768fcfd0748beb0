//! Short page descriptions for meta tags and listings.
//!
//! Uses the front-matter `description` when present; otherwise the text of
//! the first paragraph of the rendered HTML, truncated to
//! `description.max_length` characters (default 160).

use crate::config::ConfigField;
use crate::context::DocView;
use crate::document::{Document, FieldSpec, ValueKind};
use crate::hooks::{Hook, HookError, Plugin, Stage};

const DEFAULT_MAX_LENGTH: usize = 160;

pub struct Description;

impl Plugin for Description {
    fn id(&self) -> &str {
        "description"
    }

    fn hooks(&self) -> Vec<Hook> {
        vec![
            Hook::document(Stage::PostRender, describe)
                .requires(["html"])
                .produces(["description"]),
        ]
    }

    fn config_model(&self) -> Vec<ConfigField> {
        vec![ConfigField::optional("description.max_length", ValueKind::Integer)]
    }

    fn post_model(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::optional("description", ValueKind::String)]
    }
}

fn describe(view: &DocView<'_>, doc: &mut Document) -> Result<(), HookError> {
    if doc.skip {
        return Ok(());
    }
    let max = view
        .config
        .get_as::<usize>("description.max_length")?
        .unwrap_or(DEFAULT_MAX_LENGTH);
    let explicit = doc
        .front_matter()
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let derived = match explicit {
        Some(text) => Some(text),
        None => doc.html().and_then(first_paragraph),
    };
    if let Some(text) = derived {
        doc.set("description", truncate_chars(&text, max))?;
    }
    Ok(())
}

/// Plain text of the first `<p>` element, whitespace collapsed.
fn first_paragraph(html: &str) -> Option<String> {
    let start = html.find("<p>")? + 3;
    let end = html[start..].find("</p>").map_or(html.len(), |i| start + i);
    let text = collapse_whitespace(&strip_html_tags(&html[start..end]));
    (!text.is_empty()).then_some(text)
}

fn strip_html_tags(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }
    result
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to `max` characters, appending `...` if truncated.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::config::ConfigSnapshot;
    use crate::context::OutputWriter;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn run_describe(doc: &mut Document, config: &ConfigSnapshot) {
        let cache = ContentCache::in_memory(None);
        let writer = OutputWriter::new("out");
        let attrs = BTreeMap::new();
        let view = DocView {
            config,
            cache: &cache,
            writer: &writer,
            attrs: &attrs,
            stage: Stage::PostRender,
            source_dir: Path::new("content"),
        };
        describe(&view, doc).unwrap();
    }

    fn rendered(text: &str, html: &str) -> Document {
        let mut doc = Document::parse("a.md", text).unwrap();
        doc.enter_stage(Stage::Render);
        doc.set("html", html).unwrap();
        doc.enter_stage(Stage::PostRender);
        doc
    }

    #[test]
    fn front_matter_description_wins() {
        let mut doc = rendered("---\ndescription: Given\n---\nBody", "<p>Body</p>");
        run_describe(&mut doc, &ConfigSnapshot::defaults().unwrap());
        assert_eq!(doc.description(), Some("Given"));
    }

    #[test]
    fn first_paragraph_used_otherwise() {
        let mut doc = rendered(
            "x",
            "<h1>T</h1>\n<p>First <em>para</em>\ngraph.</p><p>Second</p>",
        );
        run_describe(&mut doc, &ConfigSnapshot::defaults().unwrap());
        assert_eq!(doc.description(), Some("First para graph."));
    }

    #[test]
    fn max_length_from_config() {
        let table: toml::Table = toml::from_str("[description]\nmax_length = 5").unwrap();
        let config = ConfigSnapshot::new(table).unwrap();
        let mut doc = rendered("x", "<p>Hello world</p>");
        run_describe(&mut doc, &config);
        assert_eq!(doc.description(), Some("Hello..."));
    }

    #[test]
    fn skipped_document_untouched() {
        let mut doc = rendered("x", "<p>Hello</p>");
        doc.skip = true;
        run_describe(&mut doc, &ConfigSnapshot::defaults().unwrap());
        assert_eq!(doc.description(), None);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn strip_html_tags_nested() {
        assert_eq!(
            strip_html_tags("<div><p>Some <em>text</em></p></div>"),
            "Some text"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("Short", 40), "Short");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn no_paragraph_means_no_description() {
        assert_eq!(first_paragraph("<h1>Only</h1>"), None);
        assert_eq!(first_paragraph("<p>  </p>"), None);
    }
}
