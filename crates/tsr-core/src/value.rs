use crate::{ArrayValue, Element, TypedArray, ValueError};

/// Index of a primitive node inside its graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Int64,
    Float64,
    String,
    Array,
    List,
    Dict,
    PrimitiveHandle,
}

/// The unit passed between primitives.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Array(ArrayValue),
    List(Vec<Value>),
    Dict(ValueDict),
    PrimitiveHandle(NodeId),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Nil => ValueKind::Nil,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int64(_) => ValueKind::Int64,
            Self::Float64(_) => ValueKind::Float64,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::List(_) => ValueKind::List,
            Self::Dict(_) => ValueKind::Dict,
            Self::PrimitiveHandle(_) => ValueKind::PrimitiveHandle,
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Bool(_) | Self::Int64(_) | Self::Float64(_) | Self::Array(_)
        )
    }

    /// Array form of a numeric value; scalars become 0-d arrays.
    pub fn into_array(self) -> Result<ArrayValue, ValueError> {
        match self {
            Self::Bool(value) => Ok(TypedArray::scalar(value).into()),
            Self::Int64(value) => Ok(TypedArray::scalar(value).into()),
            Self::Float64(value) => Ok(TypedArray::scalar(value).into()),
            Self::Array(array) => Ok(array),
            Self::Nil => Err(ValueError::Nil {
                expected: "numeric array",
            }),
            other => Err(ValueError::KindMismatch {
                expected: "numeric array",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_array(&self) -> Result<ArrayValue, ValueError> {
        self.clone().into_array()
    }

    /// Integer view: accepts ints, bools, and 0-d integer/bool arrays.
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Self::Int64(value) => Ok(*value),
            Self::Bool(value) => Ok(i64::from(*value)),
            Self::Array(ArrayValue::Int64(array)) => {
                array.scalar_value().ok_or(ValueError::KindMismatch {
                    expected: "integer scalar",
                    actual: ValueKind::Array,
                })
            }
            Self::Array(ArrayValue::Bool(array)) => array
                .scalar_value()
                .map(Element::to_i64)
                .ok_or(ValueError::KindMismatch {
                    expected: "integer scalar",
                    actual: ValueKind::Array,
                }),
            Self::Nil => Err(ValueError::Nil {
                expected: "integer scalar",
            }),
            other => Err(ValueError::KindMismatch {
                expected: "integer scalar",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Self::Float64(value) => Ok(*value),
            Self::Int64(value) => Ok(*value as f64),
            Self::Bool(value) => Ok(f64::from(u8::from(*value))),
            Self::Array(array) => array.scalar_f64().ok_or(ValueError::KindMismatch {
                expected: "numeric scalar",
                actual: ValueKind::Array,
            }),
            Self::Nil => Err(ValueError::Nil {
                expected: "numeric scalar",
            }),
            other => Err(ValueError::KindMismatch {
                expected: "numeric scalar",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Self::String(value) => Ok(value.as_str()),
            Self::Nil => Err(ValueError::Nil { expected: "string" }),
            other => Err(ValueError::KindMismatch {
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ValueError> {
        match self {
            Self::List(values) => Ok(values.as_slice()),
            Self::Nil => Err(ValueError::Nil { expected: "list" }),
            other => Err(ValueError::KindMismatch {
                expected: "list",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_handle(&self) -> Result<NodeId, ValueError> {
        match self {
            Self::PrimitiveHandle(node) => Ok(*node),
            Self::Nil => Err(ValueError::Nil {
                expected: "primitive handle",
            }),
            other => Err(ValueError::KindMismatch {
                expected: "primitive handle",
                actual: other.kind(),
            }),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<ArrayValue> for Value {
    fn from(value: ArrayValue) -> Self {
        Self::Array(value)
    }
}

impl<T: Element> From<TypedArray<T>> for Value {
    fn from(value: TypedArray<T>) -> Self {
        Self::Array(value.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<ValueDict> for Value {
    fn from(value: ValueDict) -> Self {
        Self::Dict(value)
    }
}

impl From<NodeId> for Value {
    fn from(value: NodeId) -> Self {
        Self::PrimitiveHandle(value)
    }
}

/// Insertion-ordered dictionary keyed by structural value equality.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueDict {
    entries: Vec<(Value, Value)>,
}

impl ValueDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; returns the previous value for an equal key.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| keys_match(existing, &key))
        {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| keys_match(existing, key))
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }
}

// keys of incomparable kinds are simply distinct
fn keys_match(lhs: &Value, rhs: &Value) -> bool {
    values_equal(lhs, rhs).unwrap_or(false)
}

/// Structural equality, total over the variant set.
///
/// Numeric kinds (bools, ints, floats, arrays) compare by value regardless of
/// dtype. Pairs that have no meaningful comparison fail with
/// [`ValueError::Unsupported`] instead of coercing.
pub fn values_equal(lhs: &Value, rhs: &Value) -> Result<bool, ValueError> {
    match (lhs, rhs) {
        (Value::Nil, Value::Nil) => Ok(true),
        (l, r) if l.is_numeric() && r.is_numeric() => {
            let l = l.as_array()?;
            let r = r.as_array()?;
            Ok(l.values_equal(&r))
        }
        (Value::String(l), Value::String(r)) => Ok(l == r),
        (Value::List(l), Value::List(r)) => {
            if l.len() != r.len() {
                return Ok(false);
            }
            for (l, r) in l.iter().zip(r) {
                if !values_equal(l, r)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Dict(l), Value::Dict(r)) => {
            if l.len() != r.len() {
                return Ok(false);
            }
            for (key, value) in l.iter() {
                match r.get(key) {
                    Some(other) if values_equal(value, other)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (Value::PrimitiveHandle(l), Value::PrimitiveHandle(r)) => Ok(l == r),
        (l, r) => Err(ValueError::Unsupported {
            lhs: l.kind(),
            rhs: r.kind(),
        }),
    }
}
