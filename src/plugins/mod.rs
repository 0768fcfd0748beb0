//! Built-in plugins.
//!
//! Each one is an ordinary consumer of the [hook contract](crate::hooks):
//! none of them gets special treatment from the runner. Together they turn
//! a directory of Markdown files into a site:
//!
//! | Plugin | Stage | Produces |
//! |--------|-------|----------|
//! | [`markdown`] | glob, render | `html` |
//! | [`description`] | post_render | `description` |
//! | [`collections`] | configure, post_render | `collections` (context) |
//! | [`layout`] | post_render (last) | `page` |
//! | [`writer`] | save | `<output>/<slug>/index.html` |

pub mod collections;
pub mod description;
pub mod layout;
pub mod markdown;
pub mod writer;

use crate::hooks::Plugin;
use std::sync::Arc;

/// The default plugin set, in registration order.
pub fn defaults() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(markdown::Markdown),
        Arc::new(description::Description),
        Arc::new(collections::Collections),
        Arc::new(layout::Layout),
        Arc::new(writer::Writer),
    ]
}
