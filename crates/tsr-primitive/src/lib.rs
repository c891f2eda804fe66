#![forbid(unsafe_code)]

mod context;
mod graph;
mod primitives;

use std::fmt;

use async_trait::async_trait;
use tsr_core::{ShapeError, Value, ValueError};
use tsr_dispatch::DispatchError;
use tsr_fabric::FabricError;
use tsr_kernel_cpu::KernelError;
use tsr_runtime::ConfigError;
use tsr_tiling::TilingError;

pub use context::{DistributedContext, EvalContext};
pub use graph::{GraphBuilder, PrimitiveGraph, PrimitiveNode};
pub use primitives::{
    AccessArgument, Binary, Block, Constant, Reduce, Slice, Store, Unary, Variable, slice_specs,
    store_into_value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Shape,
    Unsupported,
    NotImplemented,
    DistributedConsistency,
    Registry,
}

impl ErrorKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::Shape => "shape",
            Self::Unsupported => "unsupported",
            Self::NotImplemented => "not_implemented",
            Self::DistributedConsistency => "distributed_consistency",
            Self::Registry => "registry",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of one primitive, stamped with the node that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveError {
    pub kind: ErrorKind,
    pub name: String,
    pub codename: String,
    pub message: String,
}

impl fmt::Display for PrimitiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {}: {}",
            self.name, self.codename, self.kind, self.message
        )
    }
}

impl std::error::Error for PrimitiveError {}

/// Maps a lower-layer error onto the [`ErrorKind`] taxonomy.
pub trait Classify: fmt::Display {
    fn kind(&self) -> ErrorKind;
}

impl Classify for ShapeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Shape
    }
}

impl Classify for ValueError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::KindMismatch { .. } | Self::Nil { .. } => ErrorKind::InvalidArgument,
        }
    }
}

impl Classify for KernelError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Shape(_) => ErrorKind::Shape,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::DivisionByZero
            | Self::ZeroSliceStep { .. }
            | Self::TooManyIndices { .. }
            | Self::EmptyReduction { .. } => ErrorKind::InvalidArgument,
        }
    }
}

impl Classify for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Kernel(error) => error.kind(),
            Self::UnsupportedRank { .. } => ErrorKind::Unsupported,
        }
    }
}

impl Classify for FabricError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::CollectiveAborted { .. }
            | Self::ParticipantMismatch { .. }
            | Self::DuplicateContribution { .. } => ErrorKind::DistributedConsistency,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            _ => ErrorKind::Registry,
        }
    }
}

impl Classify for TilingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidLocality { .. }
            | Self::ZeroTiles
            | Self::TileIndexOutOfRange { .. }
            | Self::UnknownScheme { .. } => ErrorKind::InvalidArgument,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::RankMismatch { .. }
            | Self::TileShape { .. }
            | Self::StaleGeneration { .. }
            | Self::Inconsistent { .. } => ErrorKind::DistributedConsistency,
            Self::NotRegistered { .. } => ErrorKind::Registry,
            Self::Fabric(error) => error.kind(),
        }
    }
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgument
    }
}

/// Diagnostic identity of a graph node: the primitive `name` (e.g. `add`)
/// and a `codename` unique within its graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimitiveInfo {
    pub name: String,
    pub codename: String,
}

impl PrimitiveInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, codename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codename: codename.into(),
        }
    }

    #[must_use]
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> PrimitiveError {
        PrimitiveError {
            kind,
            name: self.name.clone(),
            codename: self.codename.clone(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn fail(&self, error: impl Classify) -> PrimitiveError {
        self.error(error.kind(), error.to_string())
    }

    /// Fails unless `operands.len()` lies in `min..=max`.
    pub fn expect_operands(
        &self,
        operands: &[Value],
        min: usize,
        max: usize,
    ) -> Result<(), PrimitiveError> {
        let count = operands.len();
        if count < min || count > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(self.error(
                ErrorKind::InvalidArgument,
                format!("expects {expected} operands, got {count}"),
            ));
        }
        Ok(())
    }
}

/// A node operation. Operands arrive unevaluated so that sequencing and
/// store targets stay under the primitive's control; most implementations
/// start with [`EvalContext::eval_operands`].
#[async_trait]
pub trait Primitive: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError>;

    /// Writes `value` through this node, optionally restricted by `slices`.
    async fn store(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        value: Value,
        slices: Vec<Value>,
        ctx: &EvalContext,
    ) -> Result<(), PrimitiveError> {
        let _ = (operands, value, slices, ctx);
        Err(info.error(
            ErrorKind::NotImplemented,
            format!("{} does not support store", self.name()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use tsr_core::{DType, ShapeError, ValueError, ValueKind};
    use tsr_dispatch::{BinaryOp, DispatchError};
    use tsr_fabric::FabricError;
    use tsr_kernel_cpu::KernelError;
    use tsr_tiling::TilingError;

    use super::{Classify, ErrorKind, PrimitiveInfo};

    #[test]
    fn errors_carry_name_codename_and_kind() {
        let info = PrimitiveInfo::new("div", "div_4");
        let err = info.fail(KernelError::DivisionByZero);
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(err.codename, "div_4");
        assert_eq!(
            err.to_string(),
            "div[div_4] invalid_argument: integer division by zero"
        );
    }

    #[test]
    fn lower_layer_errors_classify() {
        let shape = ShapeError::Mismatch {
            lhs: vec![3],
            rhs: vec![2],
        };
        assert_eq!(shape.kind(), ErrorKind::Shape);
        assert_eq!(
            DispatchError::UnsupportedRank {
                op: BinaryOp::Add,
                lhs_dims: 3,
                rhs_dims: 0
            }
            .kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            ValueError::KindMismatch {
                expected: "array",
                actual: ValueKind::String
            }
            .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            KernelError::Unsupported {
                op: "neg",
                dtype: DType::Bool
            }
            .kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            TilingError::Fabric(FabricError::CollectiveAborted {
                tag: "t".to_string(),
                locality: 1,
                message: "boom".to_string()
            })
            .kind(),
            ErrorKind::DistributedConsistency
        );
        assert_eq!(
            TilingError::NotRegistered {
                name: "x".to_string()
            }
            .kind(),
            ErrorKind::Registry
        );
    }

    #[test]
    fn operand_count_is_checked() {
        let info = PrimitiveInfo::new("slice", "slice_0");
        let operands = vec![tsr_core::Value::Nil; 6];
        let err = info.expect_operands(&operands, 1, 5).expect_err("too many");
        assert_eq!(err.message, "expects 1 to 5 operands, got 6");
        assert!(info.expect_operands(&operands[..2], 2, 2).is_ok());
    }
}
