//! Values bound to global names.

use crate::trigger::HolderHandle;

/// A value bound in the namespace.
///
/// Plain data is stored as JSON. Names bound to a UI element or State holder
/// store the holder itself, so readers always see its current value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Plain data.
    Data(serde_json::Value),
    /// A reactive value holder.
    Holder(HolderHandle),
}

impl Value {
    /// The current JSON value, reading through holders.
    pub fn resolve(&self) -> serde_json::Value {
        match self {
            Value::Data(v) => v.clone(),
            Value::Holder(h) => h.value(),
        }
    }

    /// Get the holder if this value is one.
    pub fn as_holder(&self) -> Option<&HolderHandle> {
        match self {
            Value::Holder(h) => Some(h),
            Value::Data(_) => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Holder(a), Value::Holder(b)) => a.object_id() == b.object_id(),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Data(v)
    }
}

impl From<HolderHandle> for Value {
    fn from(h: HolderHandle) -> Self {
        Value::Holder(h)
    }
}
