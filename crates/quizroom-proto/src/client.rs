//! Client → server messages.
//!
//! Frames are `{type, payload}` JSON objects. Decoding is two-stage: the
//! outer frame is parsed first so an unknown `type` can be reported as
//! [`Inbound::Unknown`] (logged and ignored by the session) instead of
//! failing the whole connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ProtocolError, Result};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a room and become its host
    CreateRoom(CreateRoom),
    /// Take a seat in an existing lobby
    JoinRoom(JoinRoom),
    /// Set the ready flag
    PlayerReady(PlayerReady),
    /// Host override to begin the countdown
    StartGame,
    /// Answer the current question
    SubmitAnswer(SubmitAnswer),
    /// Leave the room (lobby) or step away (in-game)
    LeaveRoom,
    /// Forfeit an in-progress game
    PlayerQuit,
    /// Resume a game after a dropped connection
    Reconnect(Reconnect),
    /// Application-level keepalive
    Ping,
}

/// Result of decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A recognized message
    Message(ClientMessage),
    /// Well-formed frame with a `type` this server does not handle
    Unknown(String),
}

/// Payload of `create_room`.
///
/// Numeric fields are signed so out-of-range values reach config validation
/// (and produce `INVALID_CONFIG`) instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoom {
    /// Seats in the room
    #[serde(default = "default_max_players")]
    pub max_players: i64,
    /// Questions in the game
    #[serde(default = "default_question_count")]
    pub question_count: i64,
    /// Seconds per question
    #[serde(default = "default_time_limit")]
    pub time_limit: i64,
    /// Theme filter; empty means all themes
    #[serde(default, alias = "selected_themes")]
    pub theme_ids: Vec<u32>,
    /// Optional difficulty filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

fn default_max_players() -> i64 {
    10
}

fn default_question_count() -> i64 {
    10
}

fn default_time_limit() -> i64 {
    10
}

/// Payload of `join_room`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Human-readable room code
    pub room_code: String,
}

/// Payload of `player_ready`. An empty payload means ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerReady {
    /// Desired ready state
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl Default for PlayerReady {
    fn default() -> Self {
        Self { ready: true }
    }
}

/// Payload of `submit_answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAnswer {
    /// Index of the question being answered
    #[serde(alias = "questionIndex")]
    pub question_index: u32,
    /// Chosen option
    pub chosen: Choice,
    /// Client-measured time since the question appeared
    #[serde(default, alias = "clientElapsedMs")]
    pub client_elapsed_ms: u64,
}

/// An answer choice, either an option index or the option text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Choice {
    /// Zero-based index into the option list
    Index(usize),
    /// Option text
    Text(String),
}

/// Payload of `reconnect`. The player id comes from the session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconnect {
    /// Game to resume
    pub game_id: String,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ClientMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Malformed` if the frame is not a JSON object with a
    ///   string `type`
    /// - `ProtocolError::InvalidPayload` if a known type carries a payload
    ///   that does not match its schema
    pub fn decode(text: &str) -> Result<Inbound> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let payload = match raw.payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let message = match raw.kind.as_str() {
            "create_room" => Self::CreateRoom(parse(&raw.kind, payload)?),
            "join_room" => Self::JoinRoom(parse(&raw.kind, payload)?),
            "player_ready" => Self::PlayerReady(parse(&raw.kind, payload)?),
            "start_game" => Self::StartGame,
            "submit_answer" => Self::SubmitAnswer(parse(&raw.kind, payload)?),
            "leave_room" => Self::LeaveRoom,
            "player_quit" => Self::PlayerQuit,
            "reconnect" => Self::Reconnect(parse(&raw.kind, payload)?),
            "ping" => Self::Ping,
            _ => return Ok(Inbound::Unknown(raw.kind)),
        };

        Ok(Inbound::Message(message))
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "create_room",
            Self::JoinRoom(_) => "join_room",
            Self::PlayerReady(_) => "player_ready",
            Self::StartGame => "start_game",
            Self::SubmitAnswer(_) => "submit_answer",
            Self::LeaveRoom => "leave_room",
            Self::PlayerQuit => "player_quit",
            Self::Reconnect(_) => "reconnect",
            Self::Ping => "ping",
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::InvalidPayload { kind: kind.to_string(), reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_create_room() {
        let text = r#"{"type":"create_room","payload":{"max_players":2,"question_count":3,"time_limit":10,"theme_ids":[1]}}"#;
        let Inbound::Message(ClientMessage::CreateRoom(create)) = ClientMessage::decode(text).unwrap()
        else {
            panic!("expected create_room");
        };
        assert_eq!(create.max_players, 2);
        assert_eq!(create.question_count, 3);
        assert_eq!(create.time_limit, 10);
        assert_eq!(create.theme_ids, vec![1]);
        assert_eq!(create.difficulty, None);
    }

    #[test]
    fn missing_payload_is_empty_object() {
        let decoded = ClientMessage::decode(r#"{"type":"player_ready"}"#).unwrap();
        assert_eq!(decoded, Inbound::Message(ClientMessage::PlayerReady(PlayerReady { ready: true })));

        let decoded = ClientMessage::decode(r#"{"type":"ping","payload":null}"#).unwrap();
        assert_eq!(decoded, Inbound::Message(ClientMessage::Ping));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let decoded = ClientMessage::decode(r#"{"type":"find_match","payload":{}}"#).unwrap();
        assert_eq!(decoded, Inbound::Unknown("find_match".to_string()));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(ClientMessage::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ClientMessage::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn bad_payload_names_the_type() {
        let err = ClientMessage::decode(r#"{"type":"join_room","payload":{"code":"X"}}"#)
            .unwrap_err();
        match err {
            ProtocolError::InvalidPayload { kind, .. } => assert_eq!(kind, "join_room"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn choice_accepts_index_or_text() {
        let by_index = r#"{"type":"submit_answer","payload":{"question_index":0,"chosen":2,"client_elapsed_ms":1500}}"#;
        let by_text = r#"{"type":"submit_answer","payload":{"questionIndex":0,"chosen":"Moses"}}"#;

        let Inbound::Message(ClientMessage::SubmitAnswer(a)) = ClientMessage::decode(by_index).unwrap()
        else {
            panic!("expected submit_answer");
        };
        assert_eq!(a.chosen, Choice::Index(2));
        assert_eq!(a.client_elapsed_ms, 1500);

        let Inbound::Message(ClientMessage::SubmitAnswer(b)) = ClientMessage::decode(by_text).unwrap()
        else {
            panic!("expected submit_answer");
        };
        assert_eq!(b.chosen, Choice::Text("Moses".to_string()));
        assert_eq!(b.client_elapsed_ms, 0);
    }

    #[test]
    fn encode_then_decode_preserves_message() {
        let msg = ClientMessage::Reconnect(Reconnect { game_id: "abc".to_string() });
        let text = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&text).unwrap(), Inbound::Message(msg));

        let text = ClientMessage::StartGame.encode().unwrap();
        assert_eq!(ClientMessage::decode(&text).unwrap(), Inbound::Message(ClientMessage::StartGame));
    }
}
