use url::Url;

use crate::error::Result;

pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

/// Resolves a BaseURL (or media path) against the current base. Absolute
/// URLs reset the chain; relative ones compose per RFC 3986. The query
/// string of the current base is carried over unless the new URL brings its
/// own, so tokenized manifest URLs keep working for segment requests.
pub(crate) fn merge_baseurls(current: &Url, new: &str) -> Result<Url> {
    if is_absolute_url(new) {
        Ok(Url::parse(new)?)
    } else {
        let mut merged = current.join(new)?;
        if merged.query().is_none() {
            merged.set_query(current.query());
        }
        Ok(merged)
    }
}
