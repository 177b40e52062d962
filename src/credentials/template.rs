//! Template pattern scanning
//!
//! The template language is exactly `{{id}}` and `{{id.key}}` with no
//! whitespace inside the braces. Anything else, including braced text
//! with spaces, is literal and passes through untouched.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// One credential reference found in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TemplateRef {
    pub id: String,
    pub key: Option<String>,
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z0-9_][A-Za-z0-9_-]*)(?:\.([A-Za-z0-9_][A-Za-z0-9_-]*))?\}\}")
            .expect("template pattern is valid")
    })
}

/// All credential references in a template, left to right
pub(crate) fn find_refs(template: &str) -> Vec<(Range<usize>, TemplateRef)> {
    pattern()
        .captures_iter(template)
        .map(|captures| {
            let whole = captures.get(0).expect("group 0 always present");
            let id = captures[1].to_string();
            let key = captures.get(2).map(|m| m.as_str().to_string());
            (whole.range(), TemplateRef { id, key })
        })
        .collect()
}
