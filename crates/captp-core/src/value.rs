//! The value graph carried by the protocol.
//!
//! A [`CapValue`] is plain JSON-like data with capability leaves mixed
//! in. Data travels by copy; capabilities ([`CapRef`]) travel by
//! reference — the marshaller replaces them with slots and the far side
//! gets a live proxy back. Capability equality is allocation identity,
//! never structure.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::promise::LocalPromise;
use crate::remote::Remote;

/// How a call or promise settled. Rejection reasons are arbitrary
/// values, as in the reference protocol.
pub type Resolution = Result<CapValue, Rejection>;

/// A host object invocable over the connection.
///
/// The engine calls into the host through this trait when the peer
/// invokes one of this side's exported objects. Both operations settle
/// the peer's question: `Ok` becomes a fulfilled answer, `Err` a
/// rejected one. A rejection never escalates beyond the one call.
#[async_trait]
pub trait CapObject: Send + Sync + 'static {
    /// Apply a method with arguments.
    async fn apply(&self, method: &str, args: Vec<CapValue>) -> Resolution;

    /// Read a property.
    async fn get(&self, prop: &str) -> Resolution {
        Err(Rejection::message(format!("no such property: {prop}")))
    }
}

/// A capability leaf in a value graph.
#[derive(Clone)]
pub enum CapRef {
    /// A local invocable object.
    Object(Arc<dyn CapObject>),
    /// A local promise for a value, exportable before it settles.
    Promise(LocalPromise),
    /// A peer-owned reference: a presence, or a pending remote promise.
    Remote(Remote),
}

impl CapRef {
    /// Allocation identity, the key of the value→slot index.
    pub(crate) fn identity(&self) -> usize {
        match self {
            CapRef::Object(o) => Arc::as_ptr(o) as *const () as usize,
            CapRef::Promise(p) => p.identity(),
            CapRef::Remote(r) => r.identity(),
        }
    }
}

impl PartialEq for CapRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for CapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapRef::Object(o) => write!(f, "Object({:p})", Arc::as_ptr(o)),
            CapRef::Promise(p) => f.debug_tuple("Promise").field(p).finish(),
            CapRef::Remote(r) => f.debug_tuple("Remote").field(r).finish(),
        }
    }
}

/// A value that can cross the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum CapValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<CapValue>),
    Record(BTreeMap<String, CapValue>),
    Cap(CapRef),
}

impl CapValue {
    /// Wrap a host object as a capability value.
    pub fn object(o: impl CapObject) -> Self {
        CapValue::Cap(CapRef::Object(Arc::new(o)))
    }

    /// Build a record from key/value pairs.
    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, CapValue)>) -> Self {
        CapValue::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// The integer payload, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CapValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string payload, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CapValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert plain JSON data (no capability escapes) into a value.
    /// Used for `CTP_ABORT` reasons, which are never marshalled.
    pub(crate) fn from_plain_json(v: &serde_json::Value) -> CapValue {
        match v {
            serde_json::Value::Null => CapValue::Null,
            serde_json::Value::Bool(b) => CapValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => CapValue::Int(i),
                None => CapValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => CapValue::String(s.clone()),
            serde_json::Value::Array(xs) => {
                CapValue::List(xs.iter().map(Self::from_plain_json).collect())
            }
            serde_json::Value::Object(m) => CapValue::Record(
                m.iter()
                    .map(|(k, v)| (k.clone(), Self::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as plain JSON. Capabilities flatten to a placeholder and
    /// non-finite floats to null; only data survives.
    pub(crate) fn to_plain_json(&self) -> serde_json::Value {
        match self {
            CapValue::Null => serde_json::Value::Null,
            CapValue::Bool(b) => (*b).into(),
            CapValue::Int(i) => (*i).into(),
            CapValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            CapValue::String(s) => s.clone().into(),
            CapValue::List(xs) => {
                serde_json::Value::Array(xs.iter().map(Self::to_plain_json).collect())
            }
            CapValue::Record(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
            CapValue::Cap(_) => serde_json::Value::String("[capability]".to_string()),
        }
    }
}

impl fmt::Display for CapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bare strings read naturally inside error messages; everything
        // else renders as JSON.
        match self {
            CapValue::String(s) => f.write_str(s),
            CapValue::Cap(_) => f.write_str("[capability]"),
            other => write!(f, "{}", other.to_plain_json()),
        }
    }
}

impl From<bool> for CapValue {
    fn from(b: bool) -> Self {
        CapValue::Bool(b)
    }
}

impl From<i64> for CapValue {
    fn from(i: i64) -> Self {
        CapValue::Int(i)
    }
}

impl From<f64> for CapValue {
    fn from(f: f64) -> Self {
        CapValue::Float(f)
    }
}

impl From<&str> for CapValue {
    fn from(s: &str) -> Self {
        CapValue::String(s.to_string())
    }
}

impl From<String> for CapValue {
    fn from(s: String) -> Self {
        CapValue::String(s)
    }
}

impl From<Vec<CapValue>> for CapValue {
    fn from(xs: Vec<CapValue>) -> Self {
        CapValue::List(xs)
    }
}

/// Why a promise or call failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection(CapValue);

impl Rejection {
    /// A rejection carrying an arbitrary value.
    pub fn new(value: CapValue) -> Self {
        Self(value)
    }

    /// The common case: a rejection carrying a message string.
    pub fn message(msg: impl Into<String>) -> Self {
        Self(CapValue::String(msg.into()))
    }

    /// The carried reason.
    pub fn value(&self) -> &CapValue {
        &self.0
    }

    /// Unwrap the carried reason.
    pub fn into_value(self) -> CapValue {
        self.0
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Rejection {
    fn from(s: &str) -> Self {
        Rejection::message(s)
    }
}

impl From<String> for Rejection {
    fn from(s: String) -> Self {
        Rejection::message(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl CapObject for Nothing {
        async fn apply(&self, _method: &str, _args: Vec<CapValue>) -> Resolution {
            Err(Rejection::message("nothing to do"))
        }
    }

    #[test]
    fn test_cap_equality_is_identity() {
        let a: Arc<dyn CapObject> = Arc::new(Nothing);
        let b: Arc<dyn CapObject> = Arc::new(Nothing);
        assert_eq!(CapRef::Object(a.clone()), CapRef::Object(a.clone()));
        assert_ne!(CapRef::Object(a), CapRef::Object(b));
    }

    #[test]
    fn test_data_equality_is_structural() {
        let a = CapValue::record([("n", CapValue::Int(1))]);
        let b = CapValue::record([("n", CapValue::Int(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_plain_json_roundtrip() {
        let v = CapValue::record([
            ("ok", CapValue::Bool(true)),
            ("xs", CapValue::List(vec![CapValue::Int(1), CapValue::Null])),
        ]);
        let json = v.to_plain_json();
        assert_eq!(CapValue::from_plain_json(&json), v);
    }

    #[test]
    fn test_display_for_rejections() {
        assert_eq!(Rejection::message("boom").to_string(), "boom");
        assert_eq!(
            Rejection::new(CapValue::List(vec![CapValue::Int(1)])).to_string(),
            "[1]"
        );
    }
}
