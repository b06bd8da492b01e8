use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::{ConfigError, SettingsRecord};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Display surfaces check this on connect.
pub const PROTOCOL_VERSION: u32 = 1;

pub type CycleId = u64;

/// Frames larger than this are refused; the peer is not speaking our protocol.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    /// A complete frame whose body did not parse.  `frame_len` covers the
    /// header too, so the caller can skip past it.
    #[error("malformed frame: {source}")]
    Malformed {
        frame_len: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Messages sent from a display surface to the daemon
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Ask for the current cache entry (answered with `Broadcast::Latest`).
    GetLatest,
    /// Re-arm the poll timer and run a cycle now.
    ResetPolling,
    /// Tear down and initialize again, e.g. after settings were edited elsewhere.
    Reinitialize,
    /// Merge `settings` into the settings store, then reinitialize.
    SaveSettings { settings: SettingsRecord },
}

// Settings carry the API key, so only their keys are printed.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetLatest => f.write_str("GetLatest"),
            Command::ResetPolling => f.write_str("ResetPolling"),
            Command::Reinitialize => f.write_str("Reinitialize"),
            Command::SaveSettings { settings } => f
                .debug_struct("SaveSettings")
                .field("keys", &settings.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// Messages sent from the daemon to display surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + current entry.
    Hello {
        protocol_version: u32,
        entry: CacheEntry,
    },
    Latest {
        entry: CacheEntry,
    },
    Log {
        message: String,
    },
}

/// Outcome of one user's request within one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFetchResult {
    pub user: String,
    pub succeeded: bool,
    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    /// Parsed response body.  Kept for failed responses too when the body
    /// was valid JSON, since the service reports its errors there.
    pub payload: Option<serde_json::Value>,
    pub error_detail: Option<String>,
}

impl UserFetchResult {
    /// A result for a request that never produced an HTTP response.
    pub fn failed(user: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            succeeded: false,
            status_code: None,
            status_text: None,
            payload: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// All users' outcomes for one cycle, in tracked-user order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: CycleId,
    pub results: Vec<UserFetchResult>,
    pub completed_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded).count()
    }
}

/// The single value display surfaces are shown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheEntry {
    #[default]
    Uninitialized,
    SettingsError {
        name: ConfigError,
    },
    Ready(CycleResult),
}

impl CacheEntry {
    pub fn cycle_id(&self) -> Option<CycleId> {
        match self {
            CacheEntry::Ready(result) => Some(result.cycle_id),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CacheEntry::Ready(_))
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  Returns `Ok(None)` until
    /// the whole frame has arrived, otherwise the message and the number of
    /// bytes it used.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Ok(Some((msg, 4 + len))),
            Err(source) => Err(FrameError::Malformed {
                frame_len: 4 + len,
                source,
            }),
        }
    }
}
