use std::path::PathBuf;

use scrobble_proto::settings::SettingsRecord;
use serde_json::Value;
use tracing::debug;

/// Flat key/value settings storage.  `set` merges keys into what is stored.
pub trait SettingsStore: Send + Sync {
    fn get(&self) -> anyhow::Result<SettingsRecord>;
    fn set(&self, record: &SettingsRecord) -> anyhow::Result<()>;
}

/// Settings kept as a JSON object in a file.  A missing file reads as an
/// empty record.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self) -> anyhow::Result<SettingsRecord> {
        if !self.path.exists() {
            return Ok(SettingsRecord::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SettingsRecord::new());
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!(
                "settings file {:?} holds {} instead of an object",
                self.path,
                json_kind(&other)
            ),
        }
    }

    fn set(&self, record: &SettingsRecord) -> anyhow::Result<()> {
        let mut stored = self.get()?;
        for (key, value) in record {
            stored.insert(key.clone(), value.clone());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, json)?;
        debug!("store: wrote {} keys to {:?}", stored.len(), self.path);
        Ok(())
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
