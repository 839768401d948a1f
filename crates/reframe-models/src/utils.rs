//! Filename helpers shared by the media pipeline and the API.

/// Fallback name when a source gives us nothing usable.
pub const DEFAULT_FILENAME: &str = "video.mp4";

/// Longest stem kept after sanitizing.
const MAX_STEM_LEN: usize = 80;

/// Sanitize a user- or server-supplied filename for headers and object keys.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else collapses to a
/// single `_`. Directory components are dropped and the result always ends in
/// `.mp4`, since that is the only container we emit.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let mut out = String::with_capacity(stem.len());
    let mut last_was_sep = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }

    let cleaned = out.trim_matches(|c| c == '_' || c == '.');
    if cleaned.is_empty() {
        return DEFAULT_FILENAME.to_string();
    }

    let truncated: String = cleaned.chars().take(MAX_STEM_LEN).collect();
    format!("{}.mp4", truncated)
}

/// Collapse whitespace runs and trim, the way form fields are normalized.
pub fn clean_field(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
