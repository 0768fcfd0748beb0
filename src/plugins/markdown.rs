//! Markdown discovery and rendering.
//!
//! Registers `**/*.md` for discovery and implements the `markdown` render
//! backend with pulldown-cmark. Rendered HTML is memoised in the content
//! cache by content hash, so a document that changed back to an earlier
//! version does not need to be re-rendered either.

use crate::cache::{KeyBuilder, Ttl};
use crate::context::DocView;
use crate::document::Document;
use crate::hooks::{Hook, HookError, Plugin, Stage};
use pulldown_cmark::{Options, Parser, html as md_html};

/// Bump when the rendering options change.
const RENDER_VERSION: &str = "1";

pub const BACKEND: &str = "markdown";

pub struct Markdown;

impl Plugin for Markdown {
    fn id(&self) -> &str {
        "markdown"
    }

    fn hooks(&self) -> Vec<Hook> {
        vec![
            Hook::context(Stage::Glob, |ctx| {
                ctx.add_pattern("**/*.md");
                Ok(())
            }),
            Hook::document(Stage::Render, render)
                .backend(BACKEND)
                .requires(["body"])
                .produces(["html"]),
        ]
    }
}

fn render(view: &DocView<'_>, doc: &mut Document) -> Result<(), HookError> {
    if doc.skip {
        return Ok(());
    }
    let key = KeyBuilder::new("render", RENDER_VERSION)
        .str(doc.content_hash())
        .finish();
    let html = match view.cache.get_str(&key) {
        Some(html) => html,
        None => {
            let html = markdown_to_html(doc.body());
            view.cache.set(&key, html.as_bytes(), Ttl::Default);
            html
        }
    };
    doc.set("html", html)?;
    Ok(())
}

/// Render CommonMark with tables, footnotes, strikethrough and task lists.
pub fn markdown_to_html(text: &str) -> String {
    let options = Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(text, options);
    let mut out = String::with_capacity(text.len() * 3 / 2);
    md_html::push_html(&mut out, parser);
    out
}
