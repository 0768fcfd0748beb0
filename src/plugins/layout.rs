//! Full-page HTML layout.
//!
//! Wraps each document's `html` in a complete page using Maud. The page
//! title combines the document title with `site.title`, the description (if
//! one was derived) becomes a meta tag, and every `[[head]]` entry of the
//! config is injected verbatim into `<head>`:
//!
//! ```toml
//! [[head]]
//! html = '<link rel="stylesheet" href="/style.css">'
//! ```

use crate::config::{ConfigField, ConfigSnapshot};
use crate::context::DocView;
use crate::document::{Document, FieldSpec, ValueKind};
use crate::hooks::{Hook, HookError, Plugin, Stage};
use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HeadEntry {
    pub html: String,
}

pub struct Layout;

impl Plugin for Layout {
    fn id(&self) -> &str {
        "layout"
    }

    fn hooks(&self) -> Vec<Hook> {
        vec![
            Hook::document(Stage::PostRender, apply)
                .last()
                .requires(["html"])
                .produces(["page"]),
        ]
    }

    fn config_model(&self) -> Vec<ConfigField> {
        vec![ConfigField::optional("head", ValueKind::List)]
    }

    fn post_model(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::optional("title", ValueKind::String)]
    }
}

fn apply(view: &DocView<'_>, doc: &mut Document) -> Result<(), HookError> {
    if doc.skip {
        return Ok(());
    }
    let Some(body) = doc.html() else {
        return Ok(());
    };
    let head = head_entries(view.config)?;
    let page = render_page(view.config, doc, body, &head).into_string();
    doc.set("page", page)?;
    Ok(())
}

pub fn head_entries(config: &ConfigSnapshot) -> Result<Vec<HeadEntry>, HookError> {
    Ok(config.get_as::<Vec<HeadEntry>>("head")?.unwrap_or_default())
}

fn page_title(site_title: &str, doc_title: &str) -> String {
    match (site_title.is_empty(), doc_title.is_empty()) {
        (true, _) => doc_title.to_string(),
        (false, true) => site_title.to_string(),
        (false, false) if site_title == doc_title => doc_title.to_string(),
        (false, false) => format!("{doc_title} | {site_title}"),
    }
}

fn render_page(config: &ConfigSnapshot, doc: &Document, body: &str, head: &[HeadEntry]) -> Markup {
    let site = &config.core().site;
    let title = page_title(&site.title, doc.title());
    base_document(
        &title,
        doc.description(),
        head,
        html! {
            @if !site.title.is_empty() {
                header.site-header {
                    a href={ (site.base_url) "/" } { (site.title) }
                }
            }
            main {
                article {
                    (PreEscaped(body))
                }
            }
        },
    )
}

fn base_document(
    title: &str,
    description: Option<&str>,
    head: &[HeadEntry],
    content: Markup,
) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) }
                @if let Some(description) = description {
                    meta name="description" content=(description);
                }
                @for entry in head {
                    (PreEscaped(&entry.html))
                }
            }
            body {
                (content)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_text: &str) -> ConfigSnapshot {
        ConfigSnapshot::new(toml::from_str(toml_text).unwrap()).unwrap()
    }

    fn doc(text: &str) -> Document {
        Document::parse("post.md", text).unwrap()
    }

    #[test]
    fn base_document_includes_doctype() {
        let page = base_document("T", None, &[], html! { p { "x" } }).into_string();
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<title>T</title>"));
    }

    #[test]
    fn head_entries_injected_verbatim() {
        let config = config(
            r#"
[[head]]
html = '<meta name="generator" content="plinth">'

[[head]]
html = '<link rel="stylesheet" href="/s.css">'
"#,
        );
        let head = head_entries(&config).unwrap();
        assert_eq!(head.len(), 2);
        let page = render_page(&config, &doc("x"), "<p>x</p>", &head).into_string();
        assert!(page.contains(r#"<meta name="generator" content="plinth">"#));
        assert!(page.contains(r#"<link rel="stylesheet" href="/s.css">"#));
    }

    #[test]
    fn title_combines_document_and_site() {
        let config = config("[site]\ntitle = \"My Site\"");
        let page = render_page(&config, &doc("---\ntitle: Post\n---\nx"), "", &[]).into_string();
        assert!(page.contains("<title>Post | My Site</title>"));
    }

    #[test]
    fn title_is_escaped_body_is_not() {
        let config = config("");
        let page = render_page(
            &config,
            &doc("---\ntitle: \"<b>x</b>\"\n---\n"),
            "<p>raw</p>",
            &[],
        )
        .into_string();
        assert!(page.contains("<title>&lt;b&gt;x&lt;/b&gt;</title>"));
        assert!(page.contains("<article><p>raw</p></article>"));
    }

    #[test]
    fn page_title_cases() {
        assert_eq!(page_title("", "Post"), "Post");
        assert_eq!(page_title("Site", ""), "Site");
        assert_eq!(page_title("Site", "Site"), "Site");
        assert_eq!(page_title("Site", "Post"), "Post | Site");
    }

    #[test]
    fn malformed_head_is_an_error() {
        let config = config("head = \"not a list\"");
        assert!(head_entries(&config).is_err());
    }
}
