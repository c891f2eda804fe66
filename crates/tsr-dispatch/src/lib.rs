#![forbid(unsafe_code)]

use std::fmt;

use tracing::debug;
use tsr_core::{ArrayValue, DType, Element, ShapeError, TypedArray};
use tsr_kernel_cpu::{KernelError, Reuse, zip_in_place, zip_map};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Logical,
    Comparison,
    Arithmetic,
}

impl BinaryOp {
    #[must_use]
    pub const fn all() -> &'static [BinaryOp] {
        &[
            BinaryOp::And,
            BinaryOp::Or,
            BinaryOp::Equal,
            BinaryOp::NotEqual,
            BinaryOp::Less,
            BinaryOp::LessEqual,
            BinaryOp::Greater,
            BinaryOp::GreaterEqual,
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::Div,
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Equal => "equal",
            Self::NotEqual => "not_equal",
            Self::Less => "less",
            Self::LessEqual => "less_equal",
            Self::Greater => "greater",
            Self::GreaterEqual => "greater_equal",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|op| op.name() == name)
    }

    #[must_use]
    pub const fn class(self) -> OpClass {
        match self {
            Self::And | Self::Or => OpClass::Logical,
            Self::Equal
            | Self::NotEqual
            | Self::Less
            | Self::LessEqual
            | Self::Greater
            | Self::GreaterEqual => OpClass::Comparison,
            Self::Add | Self::Sub | Self::Mul | Self::Div => OpClass::Arithmetic,
        }
    }

    /// Dtype of the result for operands of the given dtypes.
    #[must_use]
    pub fn result_dtype(self, lhs: DType, rhs: DType) -> DType {
        match self.class() {
            OpClass::Logical | OpClass::Comparison => DType::Bool,
            OpClass::Arithmetic => match lhs.promote(rhs) {
                DType::Bool => DType::Int64,
                other => other,
            },
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One cell of the `(lhs.dims, rhs.dims)` table.
///
/// Every cell runs the same broadcasting kernel; the cell only labels the
/// decision (`add_1d0d` and friends) in dispatch evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimCombination {
    D0D0,
    D0D1,
    D0D2,
    D1D0,
    D1D1,
    D1D2,
    D2D0,
    D2D1,
    D2D2,
}

impl DimCombination {
    #[must_use]
    pub const fn all() -> &'static [DimCombination] {
        &[
            DimCombination::D0D0,
            DimCombination::D0D1,
            DimCombination::D0D2,
            DimCombination::D1D0,
            DimCombination::D1D1,
            DimCombination::D1D2,
            DimCombination::D2D0,
            DimCombination::D2D1,
            DimCombination::D2D2,
        ]
    }

    pub fn from_dims(
        op: BinaryOp,
        lhs_dims: usize,
        rhs_dims: usize,
    ) -> Result<Self, DispatchError> {
        Ok(match (lhs_dims, rhs_dims) {
            (0, 0) => Self::D0D0,
            (0, 1) => Self::D0D1,
            (0, 2) => Self::D0D2,
            (1, 0) => Self::D1D0,
            (1, 1) => Self::D1D1,
            (1, 2) => Self::D1D2,
            (2, 0) => Self::D2D0,
            (2, 1) => Self::D2D1,
            (2, 2) => Self::D2D2,
            _ => {
                return Err(DispatchError::UnsupportedRank {
                    op,
                    lhs_dims,
                    rhs_dims,
                });
            }
        })
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::D0D0 => "0d0d",
            Self::D0D1 => "0d1d",
            Self::D0D2 => "0d2d",
            Self::D1D0 => "1d0d",
            Self::D1D1 => "1d1d",
            Self::D1D2 => "1d2d",
            Self::D2D0 => "2d0d",
            Self::D2D1 => "2d1d",
            Self::D2D2 => "2d2d",
        }
    }

    /// Result shape for this combination. Operands of equal rank must agree
    /// exactly; a vector meets a matrix only through its columns or as a
    /// single element.
    pub fn result_shape(self, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
        let mismatch = || ShapeError::Mismatch {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        };
        match self {
            Self::D0D0 => Ok(Vec::new()),
            Self::D0D1 | Self::D0D2 => Ok(rhs.to_vec()),
            Self::D1D0 | Self::D2D0 => Ok(lhs.to_vec()),
            Self::D1D1 | Self::D2D2 => {
                if lhs == rhs {
                    Ok(lhs.to_vec())
                } else {
                    Err(mismatch())
                }
            }
            Self::D1D2 => vector_into_matrix(lhs, rhs).ok_or_else(mismatch),
            Self::D2D1 => vector_into_matrix(rhs, lhs).ok_or_else(mismatch),
        }
    }
}

fn vector_into_matrix(vector: &[usize], matrix: &[usize]) -> Option<Vec<usize>> {
    match (vector, matrix) {
        ([len], [_, cols]) if *len == 1 || len == cols => Some(matrix.to_vec()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchDecision {
    pub op: BinaryOp,
    pub combination: DimCombination,
    pub result_dtype: DType,
    pub reused: Reuse,
}

impl DispatchDecision {
    /// Kernel identifier such as `add_1d2d`.
    #[must_use]
    pub fn kernel_name(&self) -> String {
        format!("{}_{}", self.op.name(), self.combination.suffix())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub value: ArrayValue,
    pub decision: DispatchDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Kernel(KernelError),
    UnsupportedRank {
        op: BinaryOp,
        lhs_dims: usize,
        rhs_dims: usize,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::UnsupportedRank {
                op,
                lhs_dims,
                rhs_dims,
            } => write!(
                f,
                "{op} is not implemented for operands of rank {lhs_dims} and {rhs_dims}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<ShapeError> for DispatchError {
    fn from(value: ShapeError) -> Self {
        Self::Kernel(KernelError::Shape(value))
    }
}

/// Evaluates `lhs op rhs` through the dimension-pair table.
pub fn dispatch_binary(
    op: BinaryOp,
    lhs: ArrayValue,
    rhs: ArrayValue,
) -> Result<DispatchOutcome, DispatchError> {
    let combination = DimCombination::from_dims(op, lhs.dims(), rhs.dims())?;
    let shape = combination.result_shape(&lhs.shape(), &rhs.shape())?;
    let result_dtype = op.result_dtype(lhs.dtype(), rhs.dtype());

    let (value, reused) = match op.class() {
        OpClass::Logical => logical(op, lhs, rhs, &shape)?,
        OpClass::Comparison => match lhs.dtype().promote(rhs.dtype()) {
            DType::Bool => compare::<bool>(op, lhs, rhs, &shape)?,
            DType::Int64 => compare::<i64>(op, lhs, rhs, &shape)?,
            DType::Float64 => compare::<f64>(op, lhs, rhs, &shape)?,
        },
        OpClass::Arithmetic => match result_dtype {
            DType::Float64 => arithmetic_f64(op, lhs, rhs, &shape)?,
            DType::Bool | DType::Int64 => arithmetic_i64(op, lhs, rhs, &shape)?,
        },
    };

    let decision = DispatchDecision {
        op,
        combination,
        result_dtype,
        reused,
    };
    debug!(
        kernel = %decision.kernel_name(),
        dtype = %result_dtype,
        reused = ?reused,
        "binary dispatch"
    );
    Ok(DispatchOutcome { value, decision })
}

type Combine<T, R> = fn(T, T) -> Result<R, KernelError>;

fn logical(
    op: BinaryOp,
    lhs: ArrayValue,
    rhs: ArrayValue,
    shape: &[usize],
) -> Result<(ArrayValue, Reuse), KernelError> {
    let f: Combine<bool, bool> = match op {
        BinaryOp::Or => |a, b| Ok(a || b),
        _ => |a, b| Ok(a && b),
    };
    let result = zip_in_place(lhs.into_typed(), rhs.into_typed(), shape, f)?;
    Ok((result.array.into(), result.reused))
}

fn compare<T: Element>(
    op: BinaryOp,
    lhs: ArrayValue,
    rhs: ArrayValue,
    shape: &[usize],
) -> Result<(ArrayValue, Reuse), KernelError> {
    let f: Combine<T, bool> = match op {
        BinaryOp::NotEqual => |a, b| Ok(a != b),
        BinaryOp::Less => |a, b| Ok(a < b),
        BinaryOp::LessEqual => |a, b| Ok(a <= b),
        BinaryOp::Greater => |a, b| Ok(a > b),
        BinaryOp::GreaterEqual => |a, b| Ok(a >= b),
        _ => |a, b| Ok(a == b),
    };
    let lhs: TypedArray<T> = lhs.into_typed();
    let rhs: TypedArray<T> = rhs.into_typed();
    let result = zip_map(&lhs, &rhs, shape, f)?;
    Ok((result.into(), Reuse::Fresh))
}

fn arithmetic_i64(
    op: BinaryOp,
    lhs: ArrayValue,
    rhs: ArrayValue,
    shape: &[usize],
) -> Result<(ArrayValue, Reuse), KernelError> {
    let f: Combine<i64, i64> = match op {
        BinaryOp::Sub => |a, b| Ok(a.wrapping_sub(b)),
        BinaryOp::Mul => |a, b| Ok(a.wrapping_mul(b)),
        BinaryOp::Div => |a, b| {
            if b == 0 {
                Err(KernelError::DivisionByZero)
            } else {
                Ok(a.wrapping_div(b))
            }
        },
        _ => |a, b| Ok(a.wrapping_add(b)),
    };
    let result = zip_in_place(lhs.into_typed(), rhs.into_typed(), shape, f)?;
    Ok((result.array.into(), result.reused))
}

fn arithmetic_f64(
    op: BinaryOp,
    lhs: ArrayValue,
    rhs: ArrayValue,
    shape: &[usize],
) -> Result<(ArrayValue, Reuse), KernelError> {
    let f: Combine<f64, f64> = match op {
        BinaryOp::Sub => |a, b| Ok(a - b),
        BinaryOp::Mul => |a, b| Ok(a * b),
        BinaryOp::Div => |a, b| Ok(a / b),
        _ => |a, b| Ok(a + b),
    };
    let result = zip_in_place(lhs.into_typed(), rhs.into_typed(), shape, f)?;
    Ok((result.array.into(), result.reused))
}
