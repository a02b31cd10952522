//! JSON command and event vocabulary spoken over the text side of the socket.
//!
//! Outbound commands are internally tagged by their `"command"` name and are
//! always sent with an integer `"seq"`. Inbound text is either a typed server
//! event (it carries a `"command"` discriminant) or a generic reply to one of
//! our commands (it does not).

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audio::{FRAME_DURATION_MS, SAMPLE_RATE};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object, got: {0}")]
    NotAnObject(String),
    #[error("malformed `{command}` event: {source}")]
    MalformedEvent {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Builds the base64 codec header announced in `start_stream`: sample rate as
/// little-endian u16, frames per packet, frame duration in milliseconds.
pub fn opus_codec_header() -> String {
    let rate = (SAMPLE_RATE as u16).to_le_bytes();
    let header = [rate[0], rate[1], 1, FRAME_DURATION_MS as u8];
    base64::engine::general_purpose::STANDARD.encode(header)
}

/// Commands sent from the client to the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Authenticates and joins a channel. A token takes precedence over
    /// username/password.
    Logon {
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        channel: String,
    },
    StartStream {
        #[serde(rename = "type")]
        stream_type: String,
        codec: String,
        codec_header: String,
        packet_duration: u32,
    },
    StopStream {
        stream_id: u32,
        channel: String,
    },
    SendTextMessage {
        channel: String,
        text: String,
    },
    /// Announces an image upload. The bytes follow as binary frames once the
    /// server replies with an `image_id`.
    SendImage {
        channel: String,
        #[serde(rename = "type")]
        image_type: String,
        source: String,
        width: u32,
        height: u32,
        thumbnail_content_length: usize,
        content_length: usize,
    },
}

impl Command {
    /// A `start_stream` for 20 ms Opus packets at 16 kHz.
    pub fn start_stream() -> Self {
        Command::StartStream {
            stream_type: "audio".to_string(),
            codec: "opus".to_string(),
            codec_header: opus_codec_header(),
            packet_duration: FRAME_DURATION_MS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Logon { .. } => "logon",
            Command::StartStream { .. } => "start_stream",
            Command::StopStream { .. } => "stop_stream",
            Command::SendTextMessage { .. } => "send_text_message",
            Command::SendImage { .. } => "send_image",
        }
    }

    /// Serializes the command with its sequence number attached.
    pub fn to_json(&self, seq: u32) -> Result<String, ProtocolError> {
        let mut value = serde_json::to_value(self)?;
        match value.as_object_mut() {
            Some(object) => {
                object.insert("seq".to_string(), Value::from(seq));
            }
            None => return Err(ProtocolError::NotAnObject(value.to_string())),
        }
        Ok(serde_json::to_string(&value)?)
    }
}

/// One entry of a channel roster.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelUser {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    #[serde(default)]
    pub channel: Option<String>,
    pub status: String,
    #[serde(default)]
    pub users_online: Option<u32>,
    #[serde(default)]
    pub users: Vec<ChannelUser>,
    #[serde(default)]
    pub images_supported: Option<bool>,
    #[serde(default)]
    pub texting_supported: Option<bool>,
}

impl ChannelStatus {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamStart {
    pub stream_id: u32,
    pub from: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub packet_duration: Option<u32>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StreamStop {
    pub stream_id: u32,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TextMessage {
    pub from: String,
    pub message: String,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ServerError {
    pub error: String,
}

/// An image posted to the channel by another user.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageEvent {
    pub from: String,
    pub image_id: u32,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(rename = "type", default)]
    pub image_type: Option<String>,
}

/// Typed events pushed by the server, keyed by their `"command"` field.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ChannelStatus(ChannelStatus),
    StreamStart(StreamStart),
    StreamStop(StreamStop),
    TextMessage(TextMessage),
    Error(ServerError),
    Image(ImageEvent),
    /// A command name this client does not model. All fields are kept.
    Unrecognized {
        command: String,
        fields: Map<String, Value>,
    },
}

impl ServerEvent {
    fn from_object(command: String, object: Map<String, Value>) -> Result<Self, ProtocolError> {
        fn typed<T: for<'de> Deserialize<'de>>(
            command: &str,
            object: Map<String, Value>,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(Value::Object(object)).map_err(|source| {
                ProtocolError::MalformedEvent {
                    command: command.to_string(),
                    source,
                }
            })
        }

        let event = match command.as_str() {
            "on_channel_status" => ServerEvent::ChannelStatus(typed(&command, object)?),
            "on_stream_start" => ServerEvent::StreamStart(typed(&command, object)?),
            "on_stream_stop" => ServerEvent::StreamStop(typed(&command, object)?),
            "on_text_message" => ServerEvent::TextMessage(typed(&command, object)?),
            "on_error" => ServerEvent::Error(typed(&command, object)?),
            "on_image" => ServerEvent::Image(typed(&command, object)?),
            _ => ServerEvent::Unrecognized {
                command,
                fields: object,
            },
        };
        Ok(event)
    }
}

/// A generic response to a command we sent, correlated by `seq`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Reply {
    #[serde(default)]
    pub seq: Option<u32>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stream_id: Option<u32>,
    #[serde(default)]
    pub image_id: Option<u32>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    /// A reply fails if it names an error or reports `success: false`.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.success == Some(false)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("An unknown error occurred.")
    }
}

/// Everything that can arrive on the text side of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ServerEvent),
    Reply(Reply),
}

/// Classifies and parses one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject(text.to_string()));
    };

    match object.get("command").and_then(Value::as_str).map(str::to_string) {
        Some(command) => {
            object.remove("command");
            Ok(Inbound::Event(ServerEvent::from_object(command, object)?))
        }
        None => Ok(Inbound::Reply(serde_json::from_value(Value::Object(object))?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codec_header_constant() {
        assert_eq!(opus_codec_header(), "gD4BFA==");
    }

    #[test]
    fn test_start_stream_serialization() {
        let json: Value = serde_json::from_str(&Command::start_stream().to_json(4).unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "command": "start_stream",
                "seq": 4,
                "type": "audio",
                "codec": "opus",
                "codec_header": "gD4BFA==",
                "packet_duration": 20
            })
        );
    }

    #[test]
    fn test_logon_omits_absent_credentials() {
        let command = Command::Logon {
            auth_token: Some("tok".to_string()),
            username: None,
            password: None,
            channel: "ops".to_string(),
        };
        let json: Value = serde_json::from_str(&command.to_json(1).unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"command": "logon", "seq": 1, "auth_token": "tok", "channel": "ops"})
        );
        assert_eq!(command.name(), "logon");
    }

    #[test]
    fn test_send_image_serialization() {
        let command = Command::SendImage {
            channel: "ops".to_string(),
            image_type: "jpeg".to_string(),
            source: "library".to_string(),
            width: 640,
            height: 480,
            thumbnail_content_length: 100,
            content_length: 5000,
        };
        let json: Value = serde_json::from_str(&command.to_json(9).unwrap()).unwrap();
        assert_eq!(json["command"], "send_image");
        assert_eq!(json["type"], "jpeg");
        assert_eq!(json["thumbnail_content_length"], 100);
        assert_eq!(json["content_length"], 5000);
        assert_eq!(json["seq"], 9);
    }

    #[test]
    fn test_parse_channel_status_event() {
        let inbound = parse_inbound(
            r#"{"command":"on_channel_status","channel":"ops","status":"online","users_online":2,
                "users":[{"name":"alice","status":"online"}]}"#,
        )
        .unwrap();
        match inbound {
            Inbound::Event(ServerEvent::ChannelStatus(status)) => {
                assert!(status.is_online());
                assert_eq!(status.users_online, Some(2));
                assert_eq!(status.users[0].name, "alice");
            }
            other => panic!("unexpected inbound: {:?}", other),
        }
    }

    #[test]
    fn test_parse_stream_events() {
        let start = parse_inbound(
            r#"{"command":"on_stream_start","stream_id":12,"from":"bob","codec":"opus"}"#,
        )
        .unwrap();
        assert!(matches!(
            start,
            Inbound::Event(ServerEvent::StreamStart(StreamStart { stream_id: 12, ref from, .. })) if from == "bob"
        ));

        let stop = parse_inbound(r#"{"command":"on_stream_stop","stream_id":12}"#).unwrap();
        assert_eq!(
            stop,
            Inbound::Event(ServerEvent::StreamStop(StreamStop {
                stream_id: 12,
                from: None
            }))
        );
    }

    #[test]
    fn test_unknown_event_keeps_fields() {
        let inbound = parse_inbound(r#"{"command":"on_location","latitude":1.5}"#).unwrap();
        match inbound {
            Inbound::Event(ServerEvent::Unrecognized { command, fields }) => {
                assert_eq!(command, "on_location");
                assert_eq!(fields["latitude"], 1.5);
            }
            other => panic!("unexpected inbound: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_known_event_is_an_error() {
        let err = parse_inbound(r#"{"command":"on_stream_start","from":"bob"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEvent { ref command, .. } if command == "on_stream_start"));
    }

    #[test]
    fn test_parse_replies() {
        let ok = parse_inbound(r#"{"seq":3,"success":true,"stream_id":77}"#).unwrap();
        let Inbound::Reply(reply) = ok else {
            panic!("expected a reply");
        };
        assert_eq!(reply.seq, Some(3));
        assert_eq!(reply.stream_id, Some(77));
        assert!(!reply.is_error());

        let failed = parse_inbound(r#"{"seq":1,"error":"not authorized"}"#).unwrap();
        let Inbound::Reply(reply) = failed else {
            panic!("expected a reply");
        };
        assert!(reply.is_error());
        assert_eq!(reply.error_message(), "not authorized");

        let rejected = parse_inbound(r#"{"seq":2,"success":false}"#).unwrap();
        let Inbound::Reply(reply) = rejected else {
            panic!("expected a reply");
        };
        assert!(reply.is_error());
        assert_eq!(reply.error_message(), "An unknown error occurred.");
    }

    #[test]
    fn test_reply_keeps_extra_fields() {
        let Inbound::Reply(reply) =
            parse_inbound(r#"{"seq":5,"success":true,"refresh_token":"r","x":1}"#).unwrap()
        else {
            panic!("expected a reply");
        };
        assert_eq!(reply.refresh_token.as_deref(), Some("r"));
        assert_eq!(reply.extra["x"], 1);
    }

    #[test]
    fn test_non_object_text_is_rejected() {
        assert!(matches!(
            parse_inbound("[1,2,3]"),
            Err(ProtocolError::NotAnObject(_))
        ));
        assert!(matches!(parse_inbound("not json"), Err(ProtocolError::Json(_))));
    }
}
