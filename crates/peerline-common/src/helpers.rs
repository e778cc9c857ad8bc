//! Common helper functions for Peerline.

use crate::error::{Error, Result};

/// Display name used until the user picks one.
pub const DEFAULT_DISPLAY_NAME: &str = "Guest User";

pub const MIN_DISPLAY_NAME_CHARS: usize = 4;
pub const MAX_DISPLAY_NAME_CHARS: usize = 16;

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Trims `raw` and checks it against the display-name rules.
///
/// Length is counted in characters, not bytes, so non-ASCII names get the
/// same budget as ASCII ones.
pub fn validate_display_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::validation("display name is required"));
    }

    let len = name.chars().count();
    if !(MIN_DISPLAY_NAME_CHARS..=MAX_DISPLAY_NAME_CHARS).contains(&len) {
        return Err(Error::validation(format!(
            "display name must be {}-{} characters (got {})",
            MIN_DISPLAY_NAME_CHARS, MAX_DISPLAY_NAME_CHARS, len
        )));
    }

    Ok(name.to_string())
}
