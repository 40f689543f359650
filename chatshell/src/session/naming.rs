use chrono::Utc;

use super::SessionStore;
use crate::error::SessionError;

pub const MAX_NAME_LEN: usize = 64;

/// Names that would clash with command words. Compared case-insensitively.
pub const RESERVED_NAMES: [&str; 7] = ["new", "list", "active", "current", "default", "temp", "temporary"];

const DEFAULT_BASES: [&str; 4] = ["Session", "Chat", "Work", "Project"];

/// Bounds for the two name searches. Both fall back to a timestamp suffix
/// once exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamingLimits {
    pub max_version_attempts: u32,
    pub max_default_index: u32,
}

impl Default for NamingLimits {
    fn default() -> Self {
        Self {
            max_version_attempts: 1000,
            max_default_index: 999,
        }
    }
}

/// Normalizes user input into a session name.
///
/// Trims, strips one pair of matching surrounding quotes, trims again, then
/// rejects empty names, names over [`MAX_NAME_LEN`] characters and names
/// with ASCII control characters. Reserved words pass; they are handled by
/// auto-versioning at creation.
pub fn validate_name(raw: &str) -> Result<String, SessionError> {
    let trimmed = raw.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|s| s.strip_suffix(*q))
        })
        .unwrap_or(trimmed)
        .trim();

    if unquoted.is_empty() {
        return Err(SessionError::InvalidName("name is empty".to_string()));
    }

    let len = unquoted.chars().count();
    if len > MAX_NAME_LEN {
        return Err(SessionError::InvalidName(format!(
            "name is {len} characters, limit is {MAX_NAME_LEN}"
        )));
    }

    if unquoted.chars().any(|c| (c as u32) < 32 || c as u32 == 127) {
        return Err(SessionError::InvalidName("name contains control characters".to_string()));
    }

    Ok(unquoted.to_string())
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn is_available(store: &SessionStore, name: &str) -> bool {
    !store.contains_name(name) && !is_reserved(name)
}

/// Returns `name` if it is free, otherwise the first free `name:vN`.
pub fn resolve_versioned(store: &SessionStore, name: &str, limits: &NamingLimits) -> String {
    if is_available(store, name) {
        return name.to_string();
    }

    (1..=limits.max_version_attempts)
        .map(|n| format!("{name}:v{n}"))
        .find(|candidate| is_available(store, candidate))
        .unwrap_or_else(|| fallback(store, &format!("{name}:v{}", Utc::now().timestamp())))
}

/// First free `"<Base> <N>"`, bases in order, then `"Session <unix-ts>"`.
pub fn generate_default(store: &SessionStore, limits: &NamingLimits) -> String {
    DEFAULT_BASES
        .iter()
        .flat_map(|base| (1..=limits.max_default_index).map(move |n| format!("{base} {n}")))
        .find(|candidate| !store.contains_name(candidate))
        .unwrap_or_else(|| fallback(store, &format!("Session {}", Utc::now().timestamp())))
}

/// `stem`, or `stem-1`, `stem-2`, ... when sessions created in the same
/// second already took it.
fn fallback(store: &SessionStore, stem: &str) -> String {
    if is_available(store, stem) {
        return stem.to_string();
    }
    (1..)
        .map(|n| format!("{stem}-{n}"))
        .find(|candidate| is_available(store, candidate))
        .unwrap_or_else(|| stem.to_string())
}
