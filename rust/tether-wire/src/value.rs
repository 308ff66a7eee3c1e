//! The dynamic value model carried over the wire.
//!
//! Composites (`List`, `Map`) are reference-counted cells, so two `Value`
//! handles can point at the same underlying collection. That shared identity
//! is what the codec preserves on the wire: a repeated reference encodes as a
//! back-pointer, and a cycle (a cell reachable from itself) round-trips.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::stream::ValueStream;

/// A shared, mutable slot holding part of a value graph.
///
/// Cloning a `ValueCell` clones the handle, not the contents; all clones
/// observe the same data. Cycles are built by pushing a clone of a cell into
/// the cell's own contents.
pub struct ValueCell<T>(Arc<RwLock<T>>);

impl<T> ValueCell<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }

    /// Stable identity of the underlying allocation.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// True if both handles point at the same allocation.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// A user-defined value revived from a tagged wire representation.
///
/// The `tag` names the [`Transform`](crate::codec::Transform) responsible for
/// reducing this value to a portable representation and back.
pub trait OpaqueValue: Send + Sync + fmt::Debug {
    /// Tag identifying this type in the transform table.
    fn tag(&self) -> &str;

    /// Downcast support for typed access.
    fn as_any(&self) -> &dyn Any;
}

/// Anything the codec can round-trip.
#[derive(Clone)]
pub enum Value {
    Null,
    /// The distinguished "no result" value. A handler that returns nothing
    /// resolves to `Absent`, which is not the same as returning `Null`.
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    List(ValueCell<Vec<Value>>),
    Map(ValueCell<Vec<(Value, Value)>>),
    /// A user type, reduced/revived through the transform registered under
    /// its tag.
    Opaque(Arc<dyn OpaqueValue>),
    /// A lazy sequence, replaced by an integer stream id on the wire.
    Stream(ValueStream),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(ValueCell::new(items))
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Self {
        Value::Map(ValueCell::new(pairs))
    }

    pub fn opaque<T: OpaqueValue + 'static>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Clone out the elements of a list value.
    pub fn as_list(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(cell) => Some(cell.read().clone()),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&ValueStream> {
        match self {
            Value::Stream(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a map entry by string key.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(cell) => cell
                .read()
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Typed access to an opaque value.
    pub fn downcast_opaque<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Opaque(o) => o.as_any().downcast_ref(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(b)
    }
}

impl From<ValueStream> for Value {
    fn from(s: ValueStream) -> Self {
        Value::Stream(s)
    }
}

impl PartialEq for Value {
    /// Structural equality over the value graph. Pairs of cells already under
    /// comparison are assumed equal, so the walk terminates on cycles.
    fn eq(&self, other: &Self) -> bool {
        let mut seen = HashSet::new();
        graph_eq(self, other, &mut seen)
    }
}

fn graph_eq(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) | (Value::Absent, Value::Absent) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Binary(x), Value::Binary(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if x.same(y) {
                return true;
            }
            if !seen.insert((x.ptr_id(), y.ptr_id())) {
                return true;
            }
            let xs = x.read().clone();
            let ys = y.read().clone();
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(va, vb)| graph_eq(va, vb, seen))
        }
        (Value::Map(x), Value::Map(y)) => {
            if x.same(y) {
                return true;
            }
            if !seen.insert((x.ptr_id(), y.ptr_id())) {
                return true;
            }
            let xs = x.read().clone();
            let ys = y.read().clone();
            xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|((ka, va), (kb, vb))| {
                    graph_eq(ka, kb, seen) && graph_eq(va, vb, seen)
                })
        }
        (Value::Opaque(x), Value::Opaque(y)) => Arc::ptr_eq(x, y),
        (Value::Stream(x), Value::Stream(y)) => x.same(y),
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = HashSet::new();
        debug_value(self, f, &mut seen)
    }
}

fn debug_value(
    value: &Value,
    f: &mut fmt::Formatter<'_>,
    seen: &mut HashSet<usize>,
) -> fmt::Result {
    match value {
        Value::Null => write!(f, "Null"),
        Value::Absent => write!(f, "Absent"),
        Value::Bool(b) => write!(f, "Bool({b})"),
        Value::Int(i) => write!(f, "Int({i})"),
        Value::Float(x) => write!(f, "Float({x})"),
        Value::Text(s) => write!(f, "Text({s:?})"),
        Value::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
        Value::List(cell) => {
            if !seen.insert(cell.ptr_id()) {
                return write!(f, "List(<cycle>)");
            }
            let items = cell.read().clone();
            write!(f, "List[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                debug_value(item, f, seen)?;
            }
            write!(f, "]")
        }
        Value::Map(cell) => {
            if !seen.insert(cell.ptr_id()) {
                return write!(f, "Map(<cycle>)");
            }
            let pairs = cell.read().clone();
            write!(f, "Map{{")?;
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                debug_value(k, f, seen)?;
                write!(f, ": ")?;
                debug_value(v, f, seen)?;
            }
            write!(f, "}}")
        }
        Value::Opaque(o) => write!(f, "Opaque({})", o.tag()),
        Value::Stream(_) => write!(f, "Stream"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_cells_have_one_identity() {
        let inner = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![inner.clone(), inner.clone()]);
        let Value::List(cell) = &outer else {
            unreachable!()
        };
        let items = cell.read();
        match (&items[0], &items[1]) {
            (Value::List(a), Value::List(b)) => assert!(a.same(b)),
            _ => panic!("expected lists"),
        }
    }

    #[test]
    fn equality_terminates_on_cycles() {
        let a = Value::list(vec![]);
        if let Value::List(cell) = &a {
            cell.write().push(a.clone());
        }
        let b = Value::list(vec![]);
        if let Value::List(cell) = &b {
            cell.write().push(b.clone());
        }
        assert_eq!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn debug_marks_cycles() {
        let a = Value::list(vec![Value::Int(7)]);
        if let Value::List(cell) = &a {
            let clone = a.clone();
            cell.write().push(clone);
        }
        let rendered = format!("{a:?}");
        assert!(rendered.contains("<cycle>"));
    }

    #[test]
    fn null_and_absent_are_distinct() {
        assert_ne!(Value::Null, Value::Absent);
    }
}
