//! User settings and the gate that decides whether a poll cycle may run.
//!
//! Settings live in an external key/value store as a flat JSON object:
//!
//! ```json
//! { "apiKey": "…", "fetchLimit": "10", "users": "alice; bob" }
//! ```
//!
//! The record is read fresh on every cycle attempt; nothing here caches it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Raw record as stored: flat, string-keyed, any field may be missing.
pub type SettingsRecord = Map<String, Value>;

pub const KEY_API_KEY: &str = "apiKey";
pub const KEY_FETCH_LIMIT: &str = "fetchLimit";
pub const KEY_USERS: &str = "users";

pub const DEFAULT_FETCH_LIMIT: u32 = 10;

/// Separator between tracked users in the stored `users` string.
pub const USER_SEPARATOR: char = ';';

/// Why polling is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigError {
    #[error("the API key has not been set")]
    MissingCredential,
    #[error("no users have been set")]
    MissingUsers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub credential: String,
    pub fetch_limit: u32,
    pub tracked_users: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credential: String::new(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
            tracked_users: Vec::new(),
        }
    }
}

impl Settings {
    /// Derive settings from a stored record, using defaults for anything
    /// missing or malformed.
    pub fn from_record(record: &SettingsRecord) -> Self {
        let credential = record
            .get(KEY_API_KEY)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let fetch_limit = record
            .get(KEY_FETCH_LIMIT)
            .and_then(parse_fetch_limit)
            .unwrap_or(DEFAULT_FETCH_LIMIT);

        let tracked_users = record
            .get(KEY_USERS)
            .and_then(Value::as_str)
            .map(split_users)
            .unwrap_or_default();

        Self {
            credential,
            fetch_limit,
            tracked_users,
        }
    }

    /// Settings gate.  The credential is checked before the user list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credential.trim().is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        if self.tracked_users.is_empty() {
            return Err(ConfigError::MissingUsers);
        }
        Ok(())
    }
}

/// Insert default values for any missing keys.  Returns true if the record
/// changed and should be written back to the store.
pub fn fill_defaults(record: &mut SettingsRecord) -> bool {
    let mut changed = false;
    let defaults = [
        (KEY_API_KEY, Value::String(String::new())),
        (KEY_FETCH_LIMIT, Value::from(DEFAULT_FETCH_LIMIT)),
        (KEY_USERS, Value::String(String::new())),
    ];
    for (key, value) in defaults {
        if !record.contains_key(key) {
            record.insert(key.to_string(), value);
            changed = true;
        }
    }
    changed
}

pub fn split_users(raw: &str) -> Vec<String> {
    raw.split(USER_SEPARATOR)
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_fetch_limit(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n > 0)
}
