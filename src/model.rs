//! Payloads exchanged with Lavalink nodes and with the Discord gateway.
//!
//! Node traffic is JSON keyed by an `op` discriminator; every session-scoped
//! message carries the guild as a string snowflake in `guildId`.

use serde::{Deserialize, Serialize};
use serde_json::{self, json, Value};
use crate::Result;

/// Serializes a snowflake as a string and accepts either a string or a
/// number when deserializing.
pub(crate) mod snowflake {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Str(s) => s.parse().map_err(E::custom),
            Raw::Num(n) => Ok(n),
        }
    }

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S)
            -> Result<S::Ok, S::Error> {
            match id {
                Some(id) => serializer.collect_str(id),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D)
            -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                Some(raw) => parse(raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

/// Converts a payload into the text frame sent over a WebSocket.
pub trait IntoWebSocketMessage {
    fn into_ws_message(&self) -> Result<String>;
}

/// A single equalizer override. Lavalink exposes bands 0 through 14.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

impl EqualizerBand {
    pub const COUNT: u8 = 15;

    pub fn new(band: u8, gain: f32) -> Self {
        Self { band, gain }
    }
}

/// Messages sent to a node.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// The voice-transport handshake.
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        #[serde(with = "snowflake")]
        guild_id: u64,
        session_id: String,
        event: VoiceServerUpdate,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        #[serde(with = "snowflake")]
        guild_id: u64,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        #[serde(with = "snowflake")]
        guild_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(with = "snowflake")]
        guild_id: u64,
        pause: bool,
    },
    #[serde(rename_all = "camelCase")]
    Seek {
        #[serde(with = "snowflake")]
        guild_id: u64,
        position: u64,
    },
    #[serde(rename_all = "camelCase")]
    Volume {
        #[serde(with = "snowflake")]
        guild_id: u64,
        volume: i32,
    },
    #[serde(rename_all = "camelCase")]
    Equalizer {
        #[serde(with = "snowflake")]
        guild_id: u64,
        bands: Vec<EqualizerBand>,
    },
    #[serde(rename_all = "camelCase")]
    Destroy {
        #[serde(with = "snowflake")]
        guild_id: u64,
    },
    /// Asks the node to keep sessions alive for `timeout` seconds after a
    /// disconnect.
    ConfigureResuming {
        key: String,
        timeout: u64,
    },
}

impl OutgoingMessage {
    /// The guild this message targets, if it is session scoped.
    pub fn guild_id(&self) -> Option<u64> {
        use self::OutgoingMessage::*;

        match *self {
            VoiceUpdate { guild_id, .. }
            | Play { guild_id, .. }
            | Stop { guild_id }
            | Pause { guild_id, .. }
            | Seek { guild_id, .. }
            | Volume { guild_id, .. }
            | Equalizer { guild_id, .. }
            | Destroy { guild_id } => Some(guild_id),
            ConfigureResuming { .. } => None,
        }
    }
}

impl IntoWebSocketMessage for OutgoingMessage {
    fn into_ws_message(&self) -> Result<String> {
        serde_json::to_string(self).map_err(From::from)
    }
}

/// Discord's `VOICE_SERVER_UPDATE` payload.
///
/// Forwarded verbatim as the `event` of the handshake. A `None` endpoint
/// means Discord is still allocating a voice server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    pub endpoint: Option<String>,
}

/// Discord's `VOICE_STATE_UPDATE` payload, reduced to the fields a link needs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VoiceStateUpdate {
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    #[serde(default, with = "snowflake::option")]
    pub channel_id: Option<u64>,
    #[serde(with = "snowflake")]
    pub user_id: u64,
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// Gateway opcode 4, asking Discord to move the bot into (or out of) a voice
/// channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VoiceStateRequest {
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    #[serde(with = "snowflake::option")]
    pub channel_id: Option<u64>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl IntoWebSocketMessage for VoiceStateRequest {
    fn into_ws_message(&self) -> Result<String> {
        serde_json::to_string(&json!({ "op": 4, "d": self })).map_err(From::from)
    }
}

/// Position snapshot pushed periodically by a node.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct PlayerUpdateState {
    pub time: i64,
    #[serde(default)]
    pub position: i64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(with = "snowflake")]
    pub guild_id: u64,
    pub state: PlayerUpdateState,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct FrameStats {
    pub sent: i32,
    pub nulled: i32,
    pub deficit: i32,
}

/// Health telemetry pushed by a node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

impl Stats {
    /// Load score used to rank nodes; lower is better.
    pub fn penalty(&self) -> i32 {
        let cpu = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round() as i32;
        let mut total = self.players as i32 + cpu;

        if let Some(frames) = self.frame_stats {
            total += frames.deficit;
            total += frames.nulled * 2;
        }

        total
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Player events pushed by a node under the `event` op.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart {
        #[serde(with = "snowflake")]
        guild_id: u64,
        #[serde(default)]
        track: Option<String>,
    },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        #[serde(with = "snowflake")]
        guild_id: u64,
        #[serde(default)]
        track: Option<String>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        #[serde(with = "snowflake")]
        guild_id: u64,
        #[serde(default)]
        track: Option<String>,
        /// Older nodes only send a bare message.
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        exception: Option<TrackException>,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        #[serde(with = "snowflake")]
        guild_id: u64,
        #[serde(default)]
        track: Option<String>,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        #[serde(with = "snowflake")]
        guild_id: u64,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> u64 {
        use self::NodeEvent::*;

        match *self {
            TrackStart { guild_id, .. }
            | TrackEnd { guild_id, .. }
            | TrackException { guild_id, .. }
            | TrackStuck { guild_id, .. }
            | WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Messages received from a node.
#[derive(Clone, Debug, PartialEq)]
pub enum IncomingMessage {
    PlayerUpdate(PlayerUpdate),
    Stats(Stats),
    Event(NodeEvent),
    Ready { resumed: bool },
    /// An op this client does not handle.
    Unknown(String),
}

impl IncomingMessage {
    /// Parses a text frame, dispatching on its `op` first.
    pub fn parse(text: &str) -> Result<Self> {
        let json = serde_json::from_str::<Value>(text)?;

        let op = match json.get("op").and_then(Value::as_str) {
            Some(op) => op.to_owned(),
            None => return Ok(IncomingMessage::Unknown(String::new())),
        };

        Ok(match &op[..] {
            "playerUpdate" => IncomingMessage::PlayerUpdate(serde_json::from_value(json)?),
            "stats" => IncomingMessage::Stats(serde_json::from_value(json)?),
            "event" => IncomingMessage::Event(serde_json::from_value(json)?),
            "ready" => IncomingMessage::Ready {
                resumed: json.get("resumed").and_then(Value::as_bool).unwrap_or(false),
            },
            _ => IncomingMessage::Unknown(op),
        })
    }
}

/// Descriptive metadata of a resolved track.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
}

/// A resolved track: the opaque token the node plays plus its metadata.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Track {
    pub track: String,
    pub info: TrackInfo,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selected_track: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoadException {
    pub message: String,
    pub severity: String,
}

/// Result of a `loadtracks` lookup.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadTrackResponse {
    pub load_type: LoadType,
    #[serde(default)]
    pub playlist_info: PlaylistInfo,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub exception: Option<LoadException>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_update_layout() {
        let msg = OutgoingMessage::VoiceUpdate {
            guild_id: 81384788765712384,
            session_id: "abc".to_owned(),
            event: VoiceServerUpdate {
                token: "tok".to_owned(),
                guild_id: 81384788765712384,
                endpoint: Some("eu-west1.discord.media:443".to_owned()),
            },
        };
        let json: Value = serde_json::from_str(&msg.into_ws_message().unwrap()).unwrap();

        assert_eq!(json, json!({
            "op": "voiceUpdate",
            "guildId": "81384788765712384",
            "sessionId": "abc",
            "event": {
                "token": "tok",
                "guild_id": "81384788765712384",
                "endpoint": "eu-west1.discord.media:443",
            },
        }));
    }

    #[test]
    fn test_play_skips_unset_fields() {
        let msg = OutgoingMessage::Play {
            guild_id: 1,
            track: "QAAA".to_owned(),
            start_time: Some(500),
            end_time: None,
            volume: None,
            pause: None,
            no_replace: None,
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json, json!({
            "op": "play",
            "guildId": "1",
            "track": "QAAA",
            "startTime": 500,
        }));
    }

    #[test]
    fn test_configure_resuming_layout() {
        let msg = OutgoingMessage::ConfigureResuming { key: "k".to_owned(), timeout: 60 };

        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "op": "configureResuming", "key": "k", "timeout": 60 }),
        );
        assert_eq!(msg.guild_id(), None);
    }

    #[test]
    fn test_gateway_voice_state_leave() {
        let request = VoiceStateRequest {
            guild_id: 7,
            channel_id: None,
            self_mute: false,
            self_deaf: true,
        };
        let json: Value = serde_json::from_str(&request.into_ws_message().unwrap()).unwrap();

        assert_eq!(json, json!({
            "op": 4,
            "d": { "guild_id": "7", "channel_id": null, "self_mute": false, "self_deaf": true },
        }));
    }

    #[test]
    fn test_parse_player_update() {
        let msg = IncomingMessage::parse(
            r#"{"op":"playerUpdate","guildId":"5","state":{"time":1500,"position":3000}}"#,
        ).unwrap();

        assert_eq!(msg, IncomingMessage::PlayerUpdate(PlayerUpdate {
            guild_id: 5,
            state: PlayerUpdateState { time: 1500, position: 3000 },
        }));
    }

    #[test]
    fn test_parse_track_end_event() {
        let msg = IncomingMessage::parse(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"5","track":"QAAA","reason":"FINISHED"}"#,
        ).unwrap();

        match msg {
            IncomingMessage::Event(NodeEvent::TrackEnd { guild_id, reason, .. }) => {
                assert_eq!(guild_id, 5);
                assert_eq!(reason, TrackEndReason::Finished);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_exception_with_legacy_error() {
        let msg = IncomingMessage::parse(
            r#"{"op":"event","type":"TrackExceptionEvent","guildId":"5","error":"boom"}"#,
        ).unwrap();

        match msg {
            IncomingMessage::Event(NodeEvent::TrackException { error, exception, .. }) => {
                assert_eq!(error.as_deref(), Some("boom"));
                assert!(exception.is_none());
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_op() {
        let msg = IncomingMessage::parse(r#"{"op":"somethingNew"}"#).unwrap();

        assert_eq!(msg, IncomingMessage::Unknown("somethingNew".to_owned()));
        assert!(IncomingMessage::parse("not json").is_err());
    }

    #[test]
    fn test_stats_penalty() {
        let mut stats: Stats = serde_json::from_value(json!({
            "op": "stats",
            "players": 4,
            "playingPlayers": 2,
            "uptime": 1000,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.0, "lavalinkLoad": 0.1 },
            "frameStats": null,
        })).unwrap();

        assert_eq!(stats.penalty(), 4);

        stats.frame_stats = Some(FrameStats { sent: 3000, nulled: 5, deficit: 7 });
        assert_eq!(stats.penalty(), 4 + 7 + 10);

        stats.cpu.system_load = 0.1;
        // 1.05^10 * 10 - 10 = 6.29
        assert_eq!(stats.penalty(), 4 + 6 + 7 + 10);
    }

    #[test]
    fn test_load_response() {
        let response: LoadTrackResponse = serde_json::from_value(json!({
            "loadType": "SEARCH_RESULT",
            "playlistInfo": {},
            "tracks": [{
                "track": "QAAA",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "isSeekable": true,
                    "author": "Rick Astley",
                    "length": 212000,
                    "isStream": false,
                    "position": 0,
                    "title": "Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                },
            }],
        })).unwrap();

        assert_eq!(response.load_type, LoadType::SearchResult);
        assert_eq!(response.tracks.len(), 1);
        assert_eq!(response.tracks[0].info.length, 212000);
        assert!(response.exception.is_none());
    }

    #[test]
    fn test_voice_state_update_without_channel() {
        let update: VoiceStateUpdate = serde_json::from_value(json!({
            "guild_id": "5",
            "channel_id": null,
            "user_id": "9",
            "session_id": "s",
            "self_mute": false,
            "self_deaf": false,
        })).unwrap();

        assert_eq!(update.channel_id, None);
        assert_eq!(update.user_id, 9);
    }
}
