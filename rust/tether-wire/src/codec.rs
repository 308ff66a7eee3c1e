//! The flatten codec: value graphs to slot-indexed JSON arrays and back.
//!
//! A frame is `[root_index, slot_0, slot_1, …]`. Scalars sit inline in their
//! slot; a list is an array of slot indices; a tagged value is a two-element
//! `[tag, payload_index]` pair. Every composite gets exactly one slot, so a
//! shared reference encodes as a repeated index and a cycle as an index that
//! points back up the graph. Decoding creates the cells for composite slots
//! before filling them, which is what repairs cycles.
//!
//! User types plug in through [`Transforms`]: a tag-keyed table of
//! reduce/revive pairs. Lazy sequences are bound through [`StreamBinder`], a
//! hook the transport implements; the codec itself carries no stream state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value as Json;

use crate::stream::ValueStream;
use crate::value::{Value, ValueCell};

/// Reserved tag: maps, encoded as a list of `[key, value]` index pairs.
pub const TAG_MAP: &str = "$map";
/// Reserved tag: binary data embedded in a text frame, base64 payload.
pub const TAG_BYTES: &str = "$bytes";
/// Reserved tag: the distinguished void result.
pub const TAG_ABSENT: &str = "$absent";
/// Reserved tag: a lazy sequence, payload is its stream id.
pub const TAG_STREAM: &str = "$stream";

/// Codec failure.
#[derive(Debug)]
pub enum CodecError {
    /// Malformed frame: bad JSON, bad slot shape, dangling index.
    InvalidFrame(String),
    /// A tagged slot names a transform nobody registered.
    UnknownTag(String),
    /// Attempted to register a transform under a reserved tag.
    ReservedTag(String),
    /// The value cannot be carried on the wire in this context.
    UnsupportedValue(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidFrame(msg) => write!(f, "invalid frame: {msg}"),
            CodecError::UnknownTag(tag) => write!(f, "unknown tag: {tag}"),
            CodecError::ReservedTag(tag) => write!(f, "reserved tag: {tag}"),
            CodecError::UnsupportedValue(msg) => write!(f, "unsupported value: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A reduce/revive pair for one user type, keyed by tag.
///
/// `reduce` turns a [`Value::Opaque`] into a portable replacement value;
/// `revive` rebuilds the value from that replacement on the way in.
pub trait Transform: Send + Sync {
    fn reduce(&self, value: &Value) -> Result<Value, CodecError>;
    fn revive(&self, value: Value) -> Result<Value, CodecError>;
}

/// Tag-keyed transform table.
#[derive(Clone, Default)]
pub struct Transforms {
    entries: HashMap<String, Arc<dyn Transform>>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform. Tags starting with `$` are reserved for the
    /// codec itself.
    pub fn insert(
        &mut self,
        tag: impl Into<String>,
        transform: Arc<dyn Transform>,
    ) -> Result<(), CodecError> {
        let tag = tag.into();
        if tag.starts_with('$') {
            return Err(CodecError::ReservedTag(tag));
        }
        self.entries.insert(tag, transform);
        Ok(())
    }

    fn get(&self, tag: &str) -> Option<Arc<dyn Transform>> {
        self.entries.get(tag).cloned()
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transforms")
            .field("tags", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Hook binding lazy sequences to transport stream ids.
pub trait StreamBinder {
    /// Reserve an id for an outgoing sequence and register its producer.
    fn bind_outbound(&mut self, stream: &ValueStream) -> Result<u64, CodecError>;
    /// Register a sink for an incoming sequence id and hand back its
    /// consumer end.
    fn bind_inbound(&mut self, id: u64) -> Result<ValueStream, CodecError>;
}

/// Binder for contexts where lazy sequences cannot appear (round-trip tests,
/// detached encoding).
pub struct NoStreams;

impl StreamBinder for NoStreams {
    fn bind_outbound(&mut self, _stream: &ValueStream) -> Result<u64, CodecError> {
        Err(CodecError::UnsupportedValue(
            "lazy sequence outside a transport context".into(),
        ))
    }

    fn bind_inbound(&mut self, _id: u64) -> Result<ValueStream, CodecError> {
        Err(CodecError::UnsupportedValue(
            "lazy sequence outside a transport context".into(),
        ))
    }
}

/// Encode a value graph into a slot frame.
pub fn flatten(
    value: &Value,
    transforms: &Transforms,
    binder: &mut dyn StreamBinder,
) -> Result<Vec<Json>, CodecError> {
    let mut enc = Encoder {
        slots: Vec::new(),
        memo: HashMap::new(),
        transforms,
        binder,
    };
    let root = enc.encode(value)?;
    let mut frame = Vec::with_capacity(enc.slots.len() + 1);
    frame.push(Json::from(root as u64));
    frame.extend(enc.slots);
    Ok(frame)
}

/// Decode a slot frame back into a value graph.
pub fn unflatten(
    frame: &[Json],
    transforms: &Transforms,
    binder: &mut dyn StreamBinder,
) -> Result<Value, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::InvalidFrame("empty frame".into()));
    }
    let root = as_index(&frame[0])?;
    let mut dec = Decoder {
        slots: &frame[1..],
        transforms,
        binder,
        done: HashMap::new(),
        reviving: HashSet::new(),
    };
    dec.value_at(root)
}

struct Encoder<'a> {
    slots: Vec<Json>,
    /// Composite identity (cell or Arc address) → slot index.
    memo: HashMap<usize, usize>,
    transforms: &'a Transforms,
    binder: &'a mut dyn StreamBinder,
}

impl Encoder<'_> {
    fn push(&mut self, slot: Json) -> usize {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    fn encode(&mut self, value: &Value) -> Result<usize, CodecError> {
        Ok(match value {
            Value::Null => self.push(Json::Null),
            Value::Bool(b) => self.push(Json::from(*b)),
            Value::Int(i) => self.push(Json::from(*i)),
            Value::Float(x) => {
                if !x.is_finite() {
                    return Err(CodecError::UnsupportedValue(format!(
                        "non-finite float {x}"
                    )));
                }
                self.push(Json::from(*x))
            }
            Value::Text(s) => self.push(Json::from(s.as_str())),
            Value::Absent => {
                let payload = self.push(Json::Null);
                self.push(tagged(TAG_ABSENT, payload))
            }
            Value::Binary(bytes) => {
                let payload = self.push(Json::from(BASE64.encode(bytes)));
                self.push(tagged(TAG_BYTES, payload))
            }
            Value::Stream(stream) => {
                let id = self.binder.bind_outbound(stream)?;
                let payload = self.push(Json::from(id));
                self.push(tagged(TAG_STREAM, payload))
            }
            Value::List(cell) => {
                if let Some(&idx) = self.memo.get(&cell.ptr_id()) {
                    return Ok(idx);
                }
                // Reserve the slot before the children so self-references
                // resolve to it.
                let idx = self.push(Json::Null);
                self.memo.insert(cell.ptr_id(), idx);
                let items = cell.read().clone();
                let mut indices = Vec::with_capacity(items.len());
                for item in &items {
                    indices.push(Json::from(self.encode(item)? as u64));
                }
                self.slots[idx] = Json::Array(indices);
                idx
            }
            Value::Map(cell) => {
                if let Some(&idx) = self.memo.get(&cell.ptr_id()) {
                    return Ok(idx);
                }
                let idx = self.push(Json::Null);
                self.memo.insert(cell.ptr_id(), idx);
                let pairs = cell.read().clone();
                let mut pair_indices = Vec::with_capacity(pairs.len());
                for (k, v) in &pairs {
                    let ki = self.encode(k)?;
                    let vi = self.encode(v)?;
                    let pair = self.push(Json::Array(vec![
                        Json::from(ki as u64),
                        Json::from(vi as u64),
                    ]));
                    pair_indices.push(Json::from(pair as u64));
                }
                let payload = self.push(Json::Array(pair_indices));
                self.slots[idx] = tagged(TAG_MAP, payload);
                idx
            }
            Value::Opaque(opaque) => {
                let key = Arc::as_ptr(opaque) as *const u8 as usize;
                if let Some(&idx) = self.memo.get(&key) {
                    return Ok(idx);
                }
                let tag = opaque.tag().to_string();
                let Some(transform) = self.transforms.get(&tag) else {
                    return Err(CodecError::UnknownTag(tag));
                };
                let idx = self.push(Json::Null);
                self.memo.insert(key, idx);
                let reduced = transform.reduce(value)?;
                let payload = self.encode(&reduced)?;
                self.slots[idx] = tagged(&tag, payload);
                idx
            }
        })
    }
}

fn tagged(tag: &str, payload: usize) -> Json {
    Json::Array(vec![Json::from(tag), Json::from(payload as u64)])
}

struct Decoder<'a> {
    slots: &'a [Json],
    transforms: &'a Transforms,
    binder: &'a mut dyn StreamBinder,
    done: HashMap<usize, Value>,
    /// Tagged slots currently being revived; re-entry means a cycle runs
    /// through a tagged value, which revivers cannot repair.
    reviving: HashSet<usize>,
}

impl Decoder<'_> {
    fn value_at(&mut self, idx: usize) -> Result<Value, CodecError> {
        if let Some(v) = self.done.get(&idx) {
            return Ok(v.clone());
        }
        let slot = self
            .slots
            .get(idx)
            .ok_or_else(|| CodecError::InvalidFrame(format!("slot index {idx} out of range")))?;
        match slot {
            Json::Null => {
                self.done.insert(idx, Value::Null);
                Ok(Value::Null)
            }
            Json::Bool(b) => {
                let v = Value::Bool(*b);
                self.done.insert(idx, v.clone());
                Ok(v)
            }
            Json::Number(n) => {
                let v = if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(x) = n.as_f64() {
                    Value::Float(x)
                } else {
                    return Err(CodecError::InvalidFrame(format!("bad number slot {n}")));
                };
                self.done.insert(idx, v.clone());
                Ok(v)
            }
            Json::String(s) => {
                let v = Value::Text(s.clone());
                self.done.insert(idx, v.clone());
                Ok(v)
            }
            Json::Array(items) => {
                if let [Json::String(tag), payload] = items.as_slice() {
                    let tag = tag.clone();
                    let payload = as_index(payload)?;
                    self.tagged_at(idx, &tag, payload)
                } else {
                    let indices = items.iter().map(as_index).collect::<Result<Vec<_>, _>>()?;
                    let cell = ValueCell::new(Vec::with_capacity(indices.len()));
                    let v = Value::List(cell.clone());
                    // Register before filling so back-references land on the
                    // same cell.
                    self.done.insert(idx, v.clone());
                    for i in indices {
                        let child = self.value_at(i)?;
                        cell.write().push(child);
                    }
                    Ok(v)
                }
            }
            Json::Object(_) => Err(CodecError::InvalidFrame("object slot".into())),
        }
    }

    fn tagged_at(&mut self, idx: usize, tag: &str, payload: usize) -> Result<Value, CodecError> {
        match tag {
            TAG_ABSENT => {
                self.done.insert(idx, Value::Absent);
                Ok(Value::Absent)
            }
            TAG_BYTES => {
                let p = self.value_at(payload)?;
                let Value::Text(text) = &p else {
                    return Err(CodecError::InvalidFrame(
                        "bytes payload must be a string".into(),
                    ));
                };
                let bytes = BASE64
                    .decode(text.as_bytes())
                    .map_err(|e| CodecError::InvalidFrame(format!("bad base64: {e}")))?;
                let v = Value::Binary(bytes);
                self.done.insert(idx, v.clone());
                Ok(v)
            }
            TAG_STREAM => {
                let p = self.value_at(payload)?;
                let Some(id) = p.as_u64() else {
                    return Err(CodecError::InvalidFrame(
                        "stream payload must be a non-negative integer".into(),
                    ));
                };
                let stream = self.binder.bind_inbound(id)?;
                let v = Value::Stream(stream);
                self.done.insert(idx, v.clone());
                Ok(v)
            }
            TAG_MAP => {
                let cell = ValueCell::new(Vec::new());
                let v = Value::Map(cell.clone());
                self.done.insert(idx, v.clone());
                for pair_idx in self.index_list_at(payload)? {
                    let pair = self.index_list_at(pair_idx)?;
                    let [k, val] = pair.as_slice() else {
                        return Err(CodecError::InvalidFrame(
                            "map pair must have exactly two entries".into(),
                        ));
                    };
                    let key = self.value_at(*k)?;
                    let value = self.value_at(*val)?;
                    cell.write().push((key, value));
                }
                Ok(v)
            }
            _ => {
                if !self.reviving.insert(idx) {
                    return Err(CodecError::InvalidFrame(format!(
                        "cycle through tagged value {tag}"
                    )));
                }
                let Some(transform) = self.transforms.get(tag) else {
                    return Err(CodecError::UnknownTag(tag.to_string()));
                };
                let payload_value = self.value_at(payload)?;
                let revived = transform.revive(payload_value)?;
                self.reviving.remove(&idx);
                self.done.insert(idx, revived.clone());
                Ok(revived)
            }
        }
    }

    /// Read a slot that must be a plain list of indices (map plumbing).
    fn index_list_at(&self, idx: usize) -> Result<Vec<usize>, CodecError> {
        let slot = self
            .slots
            .get(idx)
            .ok_or_else(|| CodecError::InvalidFrame(format!("slot index {idx} out of range")))?;
        let Json::Array(items) = slot else {
            return Err(CodecError::InvalidFrame(
                "expected an index list slot".into(),
            ));
        };
        items.iter().map(as_index).collect()
    }
}

fn as_index(json: &Json) -> Result<usize, CodecError> {
    json.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| CodecError::InvalidFrame(format!("expected a slot index, got {json}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        let transforms = Transforms::new();
        let frame = flatten(value, &transforms, &mut NoStreams).unwrap();
        unflatten(&frame, &transforms, &mut NoStreams).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for v in [
            Value::Null,
            Value::Absent,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(1.5),
            Value::Text("hello".into()),
            Value::Binary(vec![0, 1, 2, 255]),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn nested_composites_round_trip() {
        let v = Value::map(vec![
            (Value::Text("items".into()), Value::list(vec![1i64.into(), 2i64.into()])),
            (Value::Text("name".into()), "deep".into()),
        ]);
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn shared_reference_is_one_slot() {
        let shared = Value::list(vec![Value::Int(9)]);
        let outer = Value::list(vec![shared.clone(), shared.clone()]);
        let frame = flatten(&outer, &Transforms::new(), &mut NoStreams).unwrap();

        let decoded = unflatten(&frame, &Transforms::new(), &mut NoStreams).unwrap();
        let items = decoded.as_list().unwrap();
        match (&items[0], &items[1]) {
            (Value::List(a), Value::List(b)) => assert!(a.same(b)),
            _ => panic!("expected lists"),
        }
    }

    #[test]
    fn cycle_round_trips() {
        let root = Value::list(vec![Value::Int(1)]);
        if let Value::List(cell) = &root {
            let clone = root.clone();
            cell.write().push(clone);
        }
        let frame = flatten(&root, &Transforms::new(), &mut NoStreams).unwrap();
        let decoded = unflatten(&frame, &Transforms::new(), &mut NoStreams).unwrap();

        let Value::List(cell) = &decoded else {
            panic!("expected a list");
        };
        let items = cell.read().clone();
        assert_eq!(items[0], Value::Int(1));
        match &items[1] {
            Value::List(inner) => assert!(inner.same(cell)),
            other => panic!("expected self-reference, got {other:?}"),
        }
    }

    #[derive(Debug)]
    struct Point {
        x: i64,
        y: i64,
    }

    impl crate::value::OpaqueValue for Point {
        fn tag(&self) -> &str {
            "point"
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct PointTransform;

    impl Transform for PointTransform {
        fn reduce(&self, value: &Value) -> Result<Value, CodecError> {
            let point = value
                .downcast_opaque::<Point>()
                .ok_or_else(|| CodecError::UnsupportedValue("not a point".into()))?;
            Ok(Value::list(vec![point.x.into(), point.y.into()]))
        }

        fn revive(&self, value: Value) -> Result<Value, CodecError> {
            let items = value
                .as_list()
                .ok_or_else(|| CodecError::InvalidFrame("point payload".into()))?;
            let x = items[0].as_i64().unwrap_or_default();
            let y = items[1].as_i64().unwrap_or_default();
            Ok(Value::opaque(Point { x, y }))
        }
    }

    #[test]
    fn user_transform_round_trips() {
        let mut transforms = Transforms::new();
        transforms
            .insert("point", Arc::new(PointTransform))
            .unwrap();

        let v = Value::opaque(Point { x: 3, y: -7 });
        let frame = flatten(&v, &transforms, &mut NoStreams).unwrap();
        let decoded = unflatten(&frame, &transforms, &mut NoStreams).unwrap();
        let point = decoded.downcast_opaque::<Point>().unwrap();
        assert_eq!((point.x, point.y), (3, -7));
    }

    /// An identity transform on an unused tag must not disturb round-trips.
    #[test]
    fn identity_transform_is_inert() {
        struct Identity;
        impl Transform for Identity {
            fn reduce(&self, value: &Value) -> Result<Value, CodecError> {
                Ok(value.clone())
            }
            fn revive(&self, value: Value) -> Result<Value, CodecError> {
                Ok(value)
            }
        }

        let mut transforms = Transforms::new();
        transforms.insert("unused", Arc::new(Identity)).unwrap();

        let v = Value::list(vec![Value::Text("a".into()), Value::Int(1)]);
        let frame = flatten(&v, &transforms, &mut NoStreams).unwrap();
        assert_eq!(unflatten(&frame, &transforms, &mut NoStreams).unwrap(), v);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let v = Value::opaque(Point { x: 0, y: 0 });
        let err = flatten(&v, &Transforms::new(), &mut NoStreams).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(tag) if tag == "point"));
    }

    #[test]
    fn reserved_tags_cannot_be_registered() {
        let mut transforms = Transforms::new();
        let err = transforms
            .insert("$stream", Arc::new(PointTransform))
            .unwrap_err();
        assert!(matches!(err, CodecError::ReservedTag(_)));
    }

    #[test]
    fn streams_need_a_transport() {
        let v = Value::Stream(ValueStream::from_values(vec![]));
        let err = flatten(&v, &Transforms::new(), &mut NoStreams).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedValue(_)));
    }

    #[test]
    fn dangling_index_is_invalid() {
        let frame = vec![Json::from(5u64), Json::Null];
        let err = unflatten(&frame, &Transforms::new(), &mut NoStreams).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
    }
}
