//! Wire protocol: a tagged sum over the NIP-01 JSON-array frames, with a
//! single parse entry point instead of a stringly-typed switch on `array[0]`.

use nostr_sdk::prelude::{Event, EventId, Filter};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Everything a client may send us.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Auth(Box<Event>),
    Count { sub_id: String, filters: Vec<Filter> },
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let mut iter = values.into_iter();
        let label = iter
            .next()
            .ok_or_else(|| de::Error::custom("empty frame"))?;
        let label = label
            .as_str()
            .ok_or_else(|| de::Error::custom("frame label must be a string"))?
            .to_string();

        match label.as_str() {
            "EVENT" => {
                let value = iter
                    .next()
                    .ok_or_else(|| de::Error::custom("EVENT frame missing payload"))?;
                let event: Event = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(ClientMessage::Event(Box::new(event)))
            }
            "REQ" => {
                let sub_id: String = iter
                    .next()
                    .ok_or_else(|| de::Error::custom("REQ frame missing sub id"))
                    .and_then(|v| serde_json::from_value(v).map_err(de::Error::custom))?;
                let filters = iter
                    .map(|v| serde_json::from_value(v).map_err(de::Error::custom))
                    .collect::<Result<Vec<Filter>, D::Error>>()?;
                Ok(ClientMessage::Req { sub_id, filters })
            }
            "CLOSE" => {
                let sub_id: String = iter
                    .next()
                    .ok_or_else(|| de::Error::custom("CLOSE frame missing sub id"))
                    .and_then(|v| serde_json::from_value(v).map_err(de::Error::custom))?;
                Ok(ClientMessage::Close { sub_id })
            }
            "AUTH" => {
                let value = iter
                    .next()
                    .ok_or_else(|| de::Error::custom("AUTH frame missing payload"))?;
                let event: Event = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(ClientMessage::Auth(Box::new(event)))
            }
            "COUNT" => {
                let sub_id: String = iter
                    .next()
                    .ok_or_else(|| de::Error::custom("COUNT frame missing sub id"))
                    .and_then(|v| serde_json::from_value(v).map_err(de::Error::custom))?;
                let filters = iter
                    .map(|v| serde_json::from_value(v).map_err(de::Error::custom))
                    .collect::<Result<Vec<Filter>, D::Error>>()?;
                Ok(ClientMessage::Count { sub_id, filters })
            }
            other => Err(de::Error::custom(format!("unrecognized message type {other}"))),
        }
    }
}

/// Everything we may send a client. Frames other than than these are never
/// written; responses are newline-terminated JSON arrays (`to_frame`).
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Event { sub_id: String, event: Box<Event> },
    Eose { sub_id: String },
    Ok { event_id: EventId, accepted: bool, message: String },
    Notice { message: String },
    Closed { sub_id: String, message: String },
    Auth { challenge: String },
}

impl ServerMessage {
    pub fn ok(event_id: EventId, accepted: bool, message: impl Into<String>) -> Self {
        ServerMessage::Ok { event_id, accepted, message: message.into() }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ServerMessage::Notice { message: message.into() }
    }

    /// Render as a newline-terminated JSON array, the framing every
    /// response on the wire uses.
    pub fn to_frame(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string());
        s.push('\n');
        s
    }
}

impl Serialize for ServerMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ServerMessage::Event { sub_id, event } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(sub_id)?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
            ServerMessage::Eose { sub_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(sub_id)?;
                seq.end()
            }
            ServerMessage::Ok { event_id, accepted, message } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            ServerMessage::Notice { message } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
            ServerMessage::Closed { sub_id, message } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(sub_id)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            ServerMessage::Auth { challenge } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(challenge)?;
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_close_frame() {
        let msg: ClientMessage = serde_json::from_str(r#"["CLOSE","sub1"]"#).unwrap();
        match msg {
            ClientMessage::Close { sub_id } => assert_eq!(sub_id, "sub1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_req_with_multiple_filters() {
        let msg: ClientMessage =
            serde_json::from_str(r#"["REQ","sub1",{"kinds":[1]},{"kinds":[0]}]"#).unwrap();
        match msg {
            ClientMessage::Req { sub_id, filters } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(filters.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_label() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"["BOGUS"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn notice_frame_is_newline_terminated_array() {
        let frame = ServerMessage::notice("hello").to_frame();
        assert!(frame.starts_with("[\"NOTICE\""));
        assert!(frame.ends_with('\n'));
    }

    #[test]
    fn auth_frame_shape() {
        let frame = ServerMessage::Auth { challenge: "abc".into() }.to_frame();
        assert_eq!(frame.trim_end(), r#"["AUTH","abc"]"#);
    }
}
