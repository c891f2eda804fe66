#![forbid(unsafe_code)]

mod annotation;
mod registry;
mod span;

use std::fmt;

use tsr_fabric::FabricError;

pub use annotation::{AnnotationInfo, DistributedArrayHandle, LocalityInfo};
pub use registry::{
    AnnotationState, ArrayTable, RegisteredArray, RemoteHandleCache, TileServer, describe,
    parse_description,
};
pub use span::{
    TileInfo, TilingScheme, TilingSpan, check_partition, prefix_spans, sym_factors,
    tile_calculation, tile_spans_for,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TilingError {
    InvalidLocality {
        locality_id: usize,
        num_localities: usize,
    },
    ZeroTiles,
    TileIndexOutOfRange {
        index: usize,
        numtiles: usize,
    },
    UnknownScheme {
        name: String,
    },
    Unsupported {
        what: String,
    },
    RankMismatch {
        expected: usize,
        found: usize,
    },
    TileShape {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    StaleGeneration {
        name: String,
        current: u64,
        found: u64,
    },
    Inconsistent {
        message: String,
    },
    NotRegistered {
        name: String,
    },
    Fabric(FabricError),
}

impl fmt::Display for TilingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLocality {
                locality_id,
                num_localities,
            } => write!(
                f,
                "locality {locality_id} out of range for {num_localities} localities"
            ),
            Self::ZeroTiles => write!(f, "number of tiles must be at least 1"),
            Self::TileIndexOutOfRange { index, numtiles } => {
                write!(f, "tile index {index} out of range for {numtiles} tiles")
            }
            Self::UnknownScheme { name } => {
                write!(f, "unknown tiling type '{name}', expected row/column/sym")
            }
            Self::Unsupported { what } => write!(f, "{what} is not supported"),
            Self::RankMismatch { expected, found } => write!(
                f,
                "tile dimensionality mismatch: expected {expected}, found {found}"
            ),
            Self::TileShape { expected, found } => write!(
                f,
                "local tile has shape {found:?} but its span requires {expected:?}"
            ),
            Self::StaleGeneration {
                name,
                current,
                found,
            } => write!(
                f,
                "'{name}' is at generation {current}, cannot register generation {found}"
            ),
            Self::Inconsistent { message } => write!(f, "inconsistent tiling: {message}"),
            Self::NotRegistered { name } => write!(f, "'{name}' is not a registered array"),
            Self::Fabric(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TilingError {}

impl From<FabricError> for TilingError {
    fn from(value: FabricError) -> Self {
        Self::Fabric(value)
    }
}
