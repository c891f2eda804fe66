use tsr_core::{ArrayValue, DType, Element, TypedArray};

use crate::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Neg => "neg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    All,
    Any,
}

impl ReduceOp {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::All => "all",
            Self::Any => "any",
        }
    }
}

/// Applies `f` to every element, reusing the buffer when it is exclusively
/// owned. Returns whether the buffer was reused.
pub fn map_in_place<T: Element>(
    mut array: TypedArray<T>,
    f: impl Fn(T) -> T,
) -> (TypedArray<T>, bool) {
    if let Some(buffer) = array.owned_mut() {
        buffer.mapv_inplace(&f);
        return (array, true);
    }
    (array.map(f), false)
}

/// `not` yields bool for any dtype; `neg` keeps the numeric dtype and
/// rejects bool operands.
pub fn unary(op: UnaryOp, operand: ArrayValue) -> Result<(ArrayValue, bool), KernelError> {
    match (op, operand) {
        (UnaryOp::Not, ArrayValue::Bool(array)) => {
            let (array, reused) = map_in_place(array, |value| !value);
            Ok((array.into(), reused))
        }
        (UnaryOp::Not, other) => {
            let negated = other.into_typed::<bool>().map(|value| !value);
            Ok((negated.into(), false))
        }
        (UnaryOp::Neg, ArrayValue::Int64(array)) => {
            let (array, reused) = map_in_place(array, i64::wrapping_neg);
            Ok((array.into(), reused))
        }
        (UnaryOp::Neg, ArrayValue::Float64(array)) => {
            let (array, reused) = map_in_place(array, |value| -value);
            Ok((array.into(), reused))
        }
        (UnaryOp::Neg, ArrayValue::Bool(_)) => Err(KernelError::Unsupported {
            op: op.name(),
            dtype: DType::Bool,
        }),
    }
}

/// Total reduction over every element, producing a 0-d array.
///
/// `sum` widens bool to int64; `all`/`any` always yield bool; `min`/`max`
/// keep the operand dtype and fail on empty input.
pub fn reduce(op: ReduceOp, operand: &ArrayValue) -> Result<ArrayValue, KernelError> {
    Ok(match op {
        ReduceOp::All => {
            let all = operand.to_typed::<bool>().with_view(|view| view.iter().all(|v| *v));
            TypedArray::scalar(all).into()
        }
        ReduceOp::Any => {
            let any = operand.to_typed::<bool>().with_view(|view| view.iter().any(|v| *v));
            TypedArray::scalar(any).into()
        }
        ReduceOp::Sum => match operand {
            ArrayValue::Float64(array) => {
                TypedArray::scalar(array.with_view(|view| view.iter().sum::<f64>())).into()
            }
            other => {
                let total = other
                    .to_typed::<i64>()
                    .with_view(|view| view.iter().fold(0i64, |acc, v| acc.wrapping_add(*v)));
                TypedArray::scalar(total).into()
            }
        },
        ReduceOp::Min | ReduceOp::Max => match operand {
            ArrayValue::Bool(array) => TypedArray::scalar(extremum(op, array)?).into(),
            ArrayValue::Int64(array) => TypedArray::scalar(extremum(op, array)?).into(),
            ArrayValue::Float64(array) => TypedArray::scalar(extremum(op, array)?).into(),
        },
    })
}

fn extremum<T: Element>(op: ReduceOp, array: &TypedArray<T>) -> Result<T, KernelError> {
    let pick_max = op == ReduceOp::Max;
    array
        .with_view(|view| {
            view.iter().copied().reduce(|best, value| {
                let better = if pick_max { value > best } else { value < best };
                if better { value } else { best }
            })
        })
        .ok_or(KernelError::EmptyReduction { op: op.name() })
}
