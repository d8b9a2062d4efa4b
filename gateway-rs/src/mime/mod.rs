//! Email transform
//!
//! - [`parser`]: raw MIME into the canonical [`Email`]
//! - [`composer`]: canonical [`Email`] back into MIME
//! - [`dkim`]: DKIM signing of composed messages
//! - [`content`]: rendering an [`Email`] as a room message

pub mod composer;
pub mod content;
pub mod dkim;
pub mod parser;
pub mod types;

pub use composer::{compose, compose_unsigned};
pub use content::ContentOptions;
pub use dkim::{DkimKey, DKIM_SELECTOR};
pub use parser::parse;
pub use types::{email_date, message_id, Email, File, DATE_FORMAT};

use regex::Regex;
use std::sync::OnceLock;

fn style_blocks() -> &'static Regex {
    static STYLE: OnceLock<Regex> = OnceLock::new();
    STYLE.get_or_init(|| {
        Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("style pattern is valid")
    })
}

/// Remove `<style>...</style>` blocks from an HTML body
pub fn strip_styles(html: &str) -> String {
    style_blocks().replace_all(html, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_styles() {
        let html = "<html><STYLE type=\"text/css\">\np { color: red }\n</style><p>Hi</p><style>a{}</style></html>";
        assert_eq!(strip_styles(html), "<html><p>Hi</p></html>");
    }

    #[test]
    fn test_strip_styles_keeps_plain_html() {
        assert_eq!(strip_styles("<b>bold</b>"), "<b>bold</b>");
    }
}
