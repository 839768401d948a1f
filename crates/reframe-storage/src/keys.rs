//! Object key layout.
//!
//! `<prefix>/<YYYYMMDDTHHMMSSZ>-<8 hex>-<name>`

use chrono::{DateTime, Utc};

/// Default key prefix for converted videos.
pub const DEFAULT_KEY_PREFIX: &str = "reframe";

/// Build an object key. `name` is expected to be sanitized already; any
/// remaining slashes are replaced so the key stays one level deep.
pub fn object_key(prefix: &str, timestamp: DateTime<Utc>, random: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.replace(['/', '\\'], "_");
    let stamp = timestamp.format("%Y%m%dT%H%M%SZ");

    if prefix.is_empty() {
        format!("{}-{}-{}", stamp, random, name)
    } else {
        format!("{}/{}-{}-{}", prefix, stamp, random, name)
    }
}

/// Eight lowercase hex characters.
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Key for `name` stamped with the current time.
pub fn new_object_key(prefix: &str, name: &str) -> String {
    object_key(prefix, Utc::now(), &random_suffix(), name)
}
