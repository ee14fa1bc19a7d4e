//! Values and attribute schemas

use serde::{Deserialize, Serialize};

use crate::{EntityId, RippleError, RippleResult};

/// Value kind - reference or scalar
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Ref,
    Scalar,
}

/// Attribute cardinality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

/// Attribute value
///
/// Totally ordered so fact sets iterate deterministically. Floats are not
/// representable on purpose: read-set hashes must agree bit for bit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Ref(EntityId),
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Ref(_) => ValueKind::Ref,
            _ => ValueKind::Scalar,
        }
    }

    pub fn as_ref(&self) -> Option<EntityId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// JSON form of a scalar; references have none
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Ref(_) => None,
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(v) => Some(serde_json::Value::from(*v)),
            Value::Str(s) => Some(serde_json::Value::String(s.clone())),
        }
    }

    /// Scalar from JSON
    pub fn from_json(json: &serde_json::Value) -> RippleResult<Self> {
        match json {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| RippleError::UnsupportedValue(n.to_string())),
            other => Err(RippleError::UnsupportedValue(other.to_string())),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::Ref(id)
    }
}

/// Attribute schema - travels with the attribute ident on the wire so
/// receivers can materialise unknown attributes on read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub value_kind: ValueKind,
    pub cardinality: Cardinality,
    /// At most one entity may hold a given value
    pub unique: bool,
    /// Referencer cannot outlive the referenced entity
    pub required: bool,
    /// Referenced entity is retracted together with the referencer
    pub cascade_delete: bool,
}

impl AttributeSchema {
    pub fn scalar() -> Self {
        AttributeSchema {
            value_kind: ValueKind::Scalar,
            cardinality: Cardinality::One,
            unique: false,
            required: false,
            cascade_delete: false,
        }
    }

    pub fn reference() -> Self {
        AttributeSchema {
            value_kind: ValueKind::Ref,
            ..AttributeSchema::scalar()
        }
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        self.value_kind == ValueKind::Ref
    }

    #[inline]
    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}
