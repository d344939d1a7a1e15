use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex, Replacer};

// DASH-IF IOP only permits %0[width]d as a format specifier, so a full
// printf implementation is unnecessary. `$$` is an escaped dollar sign.
static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

/// Substitution context for SegmentTemplate URL patterns.
pub struct Template<'a> {
    args: HashMap<&'a str, String>,
}

impl Template<'_> {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(4),
        }
    }

    pub fn insert(&mut self, key: &'static str, value: String) -> &mut Self {
        self.args.insert(key, value);
        self
    }

    /// Expands every recognized `$Identifier$` (with optional `%0Nd` width)
    /// in `pattern`. Unknown identifiers are left untouched.
    pub fn resolve(&self, pattern: &str) -> String {
        IDENTIFIER_REGEX
            .replace_all(pattern, IdentifierReplacer(&self.args))
            .to_string()
    }
}

impl Default for Template<'_> {
    fn default() -> Self {
        Self::new()
    }
}

struct IdentifierReplacer<'a>(&'a HashMap<&'a str, String>);

impl Replacer for IdentifierReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let Some(key) = caps.get(1) else {
            // the `$$` alternative
            dst.push('$');
            return;
        };
        let Some(value) = self.0.get(key.as_str()) else {
            dst.push_str(caps.get(0).unwrap().as_str());
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}
