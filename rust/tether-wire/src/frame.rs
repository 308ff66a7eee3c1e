//! Frame-level types: call/reply envelopes, stream control frames, and the
//! liveness sentinels.
//!
//! Everything on the wire is a text frame unless a `chunk{type}` announcement
//! says otherwise: the sentinels `ping`/`pong`, a JSON array (a flattened
//! message), or a JSON object carrying a `stream` field (a stream control
//! frame).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::codec::{self, CodecError, StreamBinder, Transforms};
use crate::value::Value;

/// Liveness probe sentinel.
pub const PING: &str = "ping";
/// Liveness reply sentinel.
pub const PONG: &str = "pong";

/// The error half of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorValue {
    /// A message the remote handler deemed safe to surface.
    Message(String),
    /// The opaque "request failed" marker (JSON `true` on the wire).
    Failed,
}

impl ErrorValue {
    fn to_value(&self) -> Value {
        match self {
            ErrorValue::Message(msg) => Value::Text(msg.clone()),
            ErrorValue::Failed => Value::Bool(true),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Text(msg) => Ok(ErrorValue::Message(msg.clone())),
            Value::Bool(true) => Ok(ErrorValue::Failed),
            other => Err(CodecError::InvalidFrame(format!(
                "error value must be a string or true, got {other:?}"
            ))),
        }
    }
}

/// A correlated message: a call, or one of the two reply shapes.
///
/// The pre-flatten shape carries a leading discriminant (`"call"`, `"ok"`,
/// `"err"`) so a single parser serves both directions of the link.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call {
        id: u64,
        method: String,
        params: Vec<Value>,
    },
    Reply {
        id: u64,
        result: Value,
    },
    Error {
        id: u64,
        error: ErrorValue,
    },
}

impl Message {
    pub fn id(&self) -> u64 {
        match self {
            Message::Call { id, .. } | Message::Reply { id, .. } | Message::Error { id, .. } => *id,
        }
    }

    /// Flatten into a text frame.
    pub fn encode(
        &self,
        transforms: &Transforms,
        binder: &mut dyn StreamBinder,
    ) -> Result<String, CodecError> {
        let value = self.to_value();
        let frame = codec::flatten(&value, transforms, binder)?;
        serde_json::to_string(&frame).map_err(|e| CodecError::InvalidFrame(e.to_string()))
    }

    /// Decode from the slot array of a classified frame.
    pub fn decode(
        slots: &[Json],
        transforms: &Transforms,
        binder: &mut dyn StreamBinder,
    ) -> Result<Self, CodecError> {
        let value = codec::unflatten(slots, transforms, binder)?;
        Self::from_value(&value)
    }

    fn to_value(&self) -> Value {
        match self {
            Message::Call { id, method, params } => Value::list(vec![
                Value::Text("call".into()),
                Value::Int(*id as i64),
                Value::Text(method.clone()),
                Value::list(params.clone()),
            ]),
            Message::Reply { id, result } => Value::list(vec![
                Value::Text("ok".into()),
                Value::Int(*id as i64),
                result.clone(),
            ]),
            Message::Error { id, error } => Value::list(vec![
                Value::Text("err".into()),
                Value::Int(*id as i64),
                error.to_value(),
            ]),
        }
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let items = value
            .as_list()
            .ok_or_else(|| CodecError::InvalidFrame("message must be a list".into()))?;
        let kind = items
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| CodecError::InvalidFrame("message missing discriminant".into()))?
            .to_string();
        let id = items
            .get(1)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CodecError::InvalidFrame("message missing id".into()))?;
        match (kind.as_str(), items.len()) {
            ("call", 4) => {
                let method = items[2]
                    .as_str()
                    .ok_or_else(|| CodecError::InvalidFrame("call method must be text".into()))?
                    .to_string();
                let params = items[3]
                    .as_list()
                    .ok_or_else(|| CodecError::InvalidFrame("call params must be a list".into()))?;
                Ok(Message::Call { id, method, params })
            }
            ("ok", 3) => Ok(Message::Reply {
                id,
                result: items[2].clone(),
            }),
            ("err", 3) => Ok(Message::Error {
                id,
                error: ErrorValue::from_value(&items[2])?,
            }),
            _ => Err(CodecError::InvalidFrame(format!(
                "bad message shape: {kind}/{}",
                items.len()
            ))),
        }
    }
}

/// Physical type announced by a `chunk{type}` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawKind {
    /// The next frame is text, delivered as `Value::Text`.
    #[serde(rename = "string")]
    Text,
    /// The next frame is binary, delivered as `Value::Binary`.
    #[serde(rename = "bytes")]
    Binary,
}

/// A stream control frame: a JSON object tagged by its `stream` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Consumer side is discarding the stream.
    Cancel { id: u64, reason: String },
    /// One framed item: either an inline flattened value (`data`) or an
    /// announcement that the next physical frame is the raw payload
    /// (`type`). Exactly one of the two.
    Chunk {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<Json>>,
        #[serde(
            rename = "type",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        raw: Option<RawKind>,
    },
    /// Producer finished normally.
    Done { id: u64 },
    /// Producer aborted.
    Error { id: u64, error: String },
}

impl StreamFrame {
    pub fn chunk_data(id: u64, data: Vec<Json>) -> Self {
        StreamFrame::Chunk {
            id,
            data: Some(data),
            raw: None,
        }
    }

    pub fn chunk_raw(id: u64, raw: RawKind) -> Self {
        StreamFrame::Chunk {
            id,
            data: None,
            raw: Some(raw),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            StreamFrame::Cancel { id, .. }
            | StreamFrame::Chunk { id, .. }
            | StreamFrame::Done { id }
            | StreamFrame::Error { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::InvalidFrame(e.to_string()))
    }
}

/// A classified inbound text frame.
#[derive(Debug)]
pub enum ParsedFrame {
    Ping,
    Pong,
    /// The raw slot array of a flattened message; decoding is deferred so
    /// the caller can bind streams against its registry.
    Message(Vec<Json>),
    Stream(StreamFrame),
}

/// Classify an inbound text frame.
pub fn classify(text: &str) -> Result<ParsedFrame, CodecError> {
    match text {
        PING => return Ok(ParsedFrame::Ping),
        PONG => return Ok(ParsedFrame::Pong),
        _ => {}
    }
    let json: Json = serde_json::from_str(text)
        .map_err(|e| CodecError::InvalidFrame(format!("malformed JSON: {e}")))?;
    match json {
        Json::Array(slots) => Ok(ParsedFrame::Message(slots)),
        Json::Object(ref fields) if fields.contains_key("stream") => {
            let frame: StreamFrame = serde_json::from_value(json)
                .map_err(|e| CodecError::InvalidFrame(format!("bad stream frame: {e}")))?;
            if let StreamFrame::Chunk { data, raw, .. } = &frame {
                if data.is_some() == raw.is_some() {
                    return Err(CodecError::InvalidFrame(
                        "chunk must carry exactly one of data/type".into(),
                    ));
                }
            }
            Ok(ParsedFrame::Stream(frame))
        }
        _ => Err(CodecError::InvalidFrame(
            "frame is neither a message nor a stream frame".into(),
        )),
    }
}
