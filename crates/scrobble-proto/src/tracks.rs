//! Read-only view over a `user.getrecenttracks` payload.
//!
//! The service is loose with shapes: `track` is an array normally but a bare
//! object when only one track comes back, and `extended=1` moves the artist
//! name from `artist["#text"]` to `artist.name`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTrack {
    pub artist: Option<String>,
    pub name: Option<String>,
    pub album: Option<String>,
    pub url: Option<String>,
    pub now_playing: bool,
}

pub fn recent_tracks(payload: &Value) -> Vec<RecentTrack> {
    match &payload["recenttracks"]["track"] {
        Value::Array(items) => items.iter().map(parse_track).collect(),
        obj @ Value::Object(_) => vec![parse_track(obj)],
        _ => Vec::new(),
    }
}

/// The track the user is scrobbling right now, if any.
pub fn now_playing(payload: &Value) -> Option<RecentTrack> {
    recent_tracks(payload).into_iter().find(|t| t.now_playing)
}

fn parse_track(track: &Value) -> RecentTrack {
    let artist = text(&track["artist"]["name"]).or_else(|| text(&track["artist"]["#text"]));
    RecentTrack {
        artist,
        name: text(&track["name"]),
        album: text(&track["album"]["#text"]),
        url: text(&track["url"]),
        now_playing: track["@attr"]["nowplaying"].as_str() == Some("true"),
    }
}

fn text(v: &Value) -> Option<String> {
    v.as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
