#![forbid(unsafe_code)]

mod gather;
mod primitives;
mod random;
mod tiles;

use std::fmt;

use tsr_core::{ShapeError, ValueError};
use tsr_fabric::FabricError;
use tsr_kernel_cpu::KernelError;
use tsr_primitive::{Classify, ErrorKind};
use tsr_tiling::TilingError;

pub use gather::{GatherReport, all_gather};
pub use primitives::{AllGather, AnnotateD, DistRandom, FetchTile};
pub use random::{RandomRequest, dist_random};
pub use tiles::{annotate_d, fetch_tile};

#[derive(Debug, Clone, PartialEq)]
pub enum DistributedError {
    Tiling(TilingError),
    Fabric(FabricError),
    Value(ValueError),
    Kernel(KernelError),
    InvalidArgument { message: String },
}

impl fmt::Display for DistributedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tiling(error) => write!(f, "{error}"),
            Self::Fabric(error) => write!(f, "{error}"),
            Self::Value(error) => write!(f, "{error}"),
            Self::Kernel(error) => write!(f, "{error}"),
            Self::InvalidArgument { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DistributedError {}

impl From<TilingError> for DistributedError {
    fn from(value: TilingError) -> Self {
        Self::Tiling(value)
    }
}

impl From<FabricError> for DistributedError {
    fn from(value: FabricError) -> Self {
        Self::Fabric(value)
    }
}

impl From<ValueError> for DistributedError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

impl From<KernelError> for DistributedError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<ShapeError> for DistributedError {
    fn from(value: ShapeError) -> Self {
        Self::Kernel(KernelError::Shape(value))
    }
}

impl Classify for DistributedError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Tiling(error) => error.kind(),
            Self::Fabric(error) => error.kind(),
            Self::Value(error) => error.kind(),
            Self::Kernel(error) => error.kind(),
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }
}
