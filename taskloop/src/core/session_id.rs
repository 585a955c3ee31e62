//! Session id generation: `slug(name) + "-" + creation timestamp`.

use chrono::NaiveDateTime;

const MAX_SLUG_LEN: usize = 40;
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Lowercase ASCII slug: runs of other characters collapse to a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Build a session id. Returns `None` when the name has no usable characters.
pub fn session_id(name: &str, created: NaiveDateTime) -> Option<String> {
    let slug = slugify(name);
    if slug.is_empty() {
        return None;
    }
    Some(format!("{slug}-{}", created.format(TIMESTAMP_FORMAT)))
}

/// Session ids double as directory and file names.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
