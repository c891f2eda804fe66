use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{Array1, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::{DType, Element, MAX_DIMS, ShapeError};

enum Storage<T> {
    Owned(ArrayD<T>),
    Shared(Arc<RwLock<ArrayD<T>>>),
}

/// Array of one scalar type that either owns its buffer or references a
/// buffer shared with other aliases.
///
/// Writes through a reference are visible to every alias. Only slice
/// assignment and `store` are expected to take that path; everything else
/// treats references as read-only and allocates.
pub struct TypedArray<T> {
    storage: Storage<T>,
}

impl<T: Element> TypedArray<T> {
    pub fn new(array: ArrayD<T>) -> Result<Self, ShapeError> {
        check_rank(array.ndim())?;
        Ok(Self {
            storage: Storage::Owned(array),
        })
    }

    #[must_use]
    pub fn scalar(value: T) -> Self {
        Self {
            storage: Storage::Owned(ArrayD::from_elem(IxDyn(&[]), value)),
        }
    }

    #[must_use]
    pub fn vector(values: Vec<T>) -> Self {
        Self {
            storage: Storage::Owned(Array1::from(values).into_dyn()),
        }
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<T>) -> Result<Self, ShapeError> {
        check_rank(shape.len())?;
        let len = values.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            ShapeError::ElementCount {
                shape: shape.to_vec(),
                len,
            }
        })?;
        Ok(Self {
            storage: Storage::Owned(array),
        })
    }

    pub fn from_elem(shape: &[usize], value: T) -> Result<Self, ShapeError> {
        check_rank(shape.len())?;
        Ok(Self {
            storage: Storage::Owned(ArrayD::from_elem(IxDyn(shape), value)),
        })
    }

    /// Moves the buffer behind a shared handle. Clones of the result alias it.
    #[must_use]
    pub fn into_shared(self) -> Self {
        match self.storage {
            Storage::Owned(array) => Self {
                storage: Storage::Shared(Arc::new(RwLock::new(array))),
            },
            shared @ Storage::Shared(_) => Self { storage: shared },
        }
    }

    /// Converts `self` to shared storage if needed and returns a new alias.
    pub fn share(&mut self) -> Self {
        let lock = match &mut self.storage {
            Storage::Shared(lock) => Arc::clone(lock),
            Storage::Owned(array) => {
                let array = std::mem::replace(array, ArrayD::default(IxDyn(&[0])));
                let lock = Arc::new(RwLock::new(array));
                self.storage = Storage::Shared(Arc::clone(&lock));
                lock
            }
        };
        Self {
            storage: Storage::Shared(lock),
        }
    }

    #[must_use]
    pub fn alias(&self) -> Option<Self> {
        match &self.storage {
            Storage::Shared(lock) => Some(Self {
                storage: Storage::Shared(Arc::clone(lock)),
            }),
            Storage::Owned(_) => None,
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::Shared(lhs), Storage::Shared(rhs)) => Arc::ptr_eq(lhs, rhs),
            _ => false,
        }
    }

    pub fn with_view<R>(&self, f: impl FnOnce(ArrayViewD<'_, T>) -> R) -> R {
        match &self.storage {
            Storage::Owned(array) => f(array.view()),
            Storage::Shared(lock) => {
                let guard = lock.read().unwrap_or_else(PoisonError::into_inner);
                f(guard.view())
            }
        }
    }

    /// Mutable view of the buffer. For references the write is visible to
    /// every alias.
    pub fn with_view_mut<R>(&mut self, f: impl FnOnce(ArrayViewMutD<'_, T>) -> R) -> R {
        match &mut self.storage {
            Storage::Owned(array) => f(array.view_mut()),
            Storage::Shared(lock) => {
                let mut guard = lock.write().unwrap_or_else(PoisonError::into_inner);
                f(guard.view_mut())
            }
        }
    }

    /// The exclusively owned buffer, if this array is not a reference.
    pub fn owned_mut(&mut self) -> Option<&mut ArrayD<T>> {
        match &mut self.storage {
            Storage::Owned(array) => Some(array),
            Storage::Shared(_) => None,
        }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.with_view(|view| view.ndim())
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.with_view(|view| view.shape().to_vec())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_view(|view| view.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn to_array(&self) -> ArrayD<T> {
        self.with_view(|view| view.to_owned())
    }

    /// Takes the buffer out. A shared buffer is reclaimed without copying
    /// when this is its last alias.
    #[must_use]
    pub fn into_array(self) -> ArrayD<T> {
        match self.storage {
            Storage::Owned(array) => array,
            Storage::Shared(lock) => match Arc::try_unwrap(lock) {
                Ok(lock) => lock.into_inner().unwrap_or_else(PoisonError::into_inner),
                Err(lock) => lock.read().unwrap_or_else(PoisonError::into_inner).clone(),
            },
        }
    }

    /// Exclusively owned deep copy.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            storage: Storage::Owned(self.to_array()),
        }
    }

    #[must_use]
    pub fn scalar_value(&self) -> Option<T> {
        self.with_view(|view| {
            if view.ndim() == 0 {
                view.iter().next().copied()
            } else {
                None
            }
        })
    }

    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.with_view(|view| view.get(index).copied())
    }

    /// Elements in row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.with_view(|view| view.iter().copied().collect())
    }

    #[must_use]
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> TypedArray<U> {
        TypedArray {
            storage: Storage::Owned(self.with_view(|view| view.mapv(f))),
        }
    }
}

fn check_rank(dims: usize) -> Result<(), ShapeError> {
    if dims > MAX_DIMS {
        return Err(ShapeError::RankTooHigh {
            dims,
            max: MAX_DIMS,
        });
    }
    Ok(())
}

impl<T: Element> Clone for TypedArray<T> {
    fn clone(&self) -> Self {
        match &self.storage {
            Storage::Owned(array) => Self {
                storage: Storage::Owned(array.clone()),
            },
            Storage::Shared(lock) => Self {
                storage: Storage::Shared(Arc::clone(lock)),
            },
        }
    }
}

impl<T: Element> PartialEq for TypedArray<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.shares_storage_with(other) {
            return true;
        }
        self.with_view(|lhs| other.with_view(|rhs| lhs == rhs))
    }
}

impl<T: Element> fmt::Debug for TypedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedArray")
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape())
            .field("is_reference", &self.is_reference())
            .field("data", &self.to_vec())
            .finish()
    }
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;

    fn from_bool(value: bool) -> Self {
        value
    }

    fn from_i64(value: i64) -> Self {
        value != 0
    }

    fn from_f64(value: f64) -> Self {
        value != 0.0
    }

    fn to_bool(self) -> bool {
        self
    }

    fn to_i64(self) -> i64 {
        i64::from(self)
    }

    fn to_f64(self) -> f64 {
        if self { 1.0 } else { 0.0 }
    }

    fn into_value(array: TypedArray<Self>) -> ArrayValue {
        ArrayValue::Bool(array)
    }

    fn from_value(value: ArrayValue) -> TypedArray<Self> {
        match value {
            ArrayValue::Bool(array) => array,
            ArrayValue::Int64(array) => array.map(Self::from_i64),
            ArrayValue::Float64(array) => array.map(Self::from_f64),
        }
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::Int64;

    fn from_bool(value: bool) -> Self {
        i64::from(value)
    }

    fn from_i64(value: i64) -> Self {
        value
    }

    fn from_f64(value: f64) -> Self {
        // saturating truncation toward zero
        value as i64
    }

    fn to_bool(self) -> bool {
        self != 0
    }

    fn to_i64(self) -> i64 {
        self
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn into_value(array: TypedArray<Self>) -> ArrayValue {
        ArrayValue::Int64(array)
    }

    fn from_value(value: ArrayValue) -> TypedArray<Self> {
        match value {
            ArrayValue::Bool(array) => array.map(Self::from_bool),
            ArrayValue::Int64(array) => array,
            ArrayValue::Float64(array) => array.map(Self::from_f64),
        }
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::Float64;

    fn from_bool(value: bool) -> Self {
        if value { 1.0 } else { 0.0 }
    }

    fn from_i64(value: i64) -> Self {
        value as f64
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_bool(self) -> bool {
        self != 0.0
    }

    fn to_i64(self) -> i64 {
        self as i64
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn into_value(array: TypedArray<Self>) -> ArrayValue {
        ArrayValue::Float64(array)
    }

    fn from_value(value: ArrayValue) -> TypedArray<Self> {
        match value {
            ArrayValue::Bool(array) => array.map(Self::from_bool),
            ArrayValue::Int64(array) => array.map(Self::from_i64),
            ArrayValue::Float64(array) => array,
        }
    }
}

/// Multidimensional array of one of the supported scalar types.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Bool(TypedArray<bool>),
    Int64(TypedArray<i64>),
    Float64(TypedArray<f64>),
}

macro_rules! each_array {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            ArrayValue::Bool($array) => $body,
            ArrayValue::Int64($array) => $body,
            ArrayValue::Float64($array) => $body,
        }
    };
}

impl ArrayValue {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
        }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        each_array!(self, array => array.dims())
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        each_array!(self, array => array.shape())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        each_array!(self, array => array.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        each_array!(self, array => array.is_reference())
    }

    #[must_use]
    pub fn into_shared(self) -> Self {
        match self {
            Self::Bool(array) => Self::Bool(array.into_shared()),
            Self::Int64(array) => Self::Int64(array.into_shared()),
            Self::Float64(array) => Self::Float64(array.into_shared()),
        }
    }

    pub fn share(&mut self) -> Self {
        match self {
            Self::Bool(array) => Self::Bool(array.share()),
            Self::Int64(array) => Self::Int64(array.share()),
            Self::Float64(array) => Self::Float64(array.share()),
        }
    }

    #[must_use]
    pub fn copy(&self) -> Self {
        match self {
            Self::Bool(array) => Self::Bool(array.copy()),
            Self::Int64(array) => Self::Int64(array.copy()),
            Self::Float64(array) => Self::Float64(array.copy()),
        }
    }

    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(lhs), Self::Bool(rhs)) => lhs.shares_storage_with(rhs),
            (Self::Int64(lhs), Self::Int64(rhs)) => lhs.shares_storage_with(rhs),
            (Self::Float64(lhs), Self::Float64(rhs)) => lhs.shares_storage_with(rhs),
            _ => false,
        }
    }

    #[must_use]
    pub fn into_typed<T: Element>(self) -> TypedArray<T> {
        T::from_value(self)
    }

    #[must_use]
    pub fn to_typed<T: Element>(&self) -> TypedArray<T> {
        T::from_value(self.clone())
    }

    #[must_use]
    pub fn astype(self, dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(self.into_typed()),
            DType::Int64 => Self::Int64(self.into_typed()),
            DType::Float64 => Self::Float64(self.into_typed()),
        }
    }

    /// Elements as `f64` in row-major order.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_array!(self, array => array.with_view(|view| view.iter().map(|v| v.to_f64()).collect()))
    }

    #[must_use]
    pub fn scalar_f64(&self) -> Option<f64> {
        each_array!(self, array => array.scalar_value().map(Element::to_f64))
    }

    /// Dtype-agnostic comparison of shape and element values.
    #[must_use]
    pub fn values_equal(&self, other: &Self) -> bool {
        if self.shares_storage_with(other) {
            return true;
        }
        self.shape() == other.shape() && self.to_f64_vec() == other.to_f64_vec()
    }
}

impl<T: Element> From<TypedArray<T>> for ArrayValue {
    fn from(array: TypedArray<T>) -> Self {
        T::into_value(array)
    }
}
