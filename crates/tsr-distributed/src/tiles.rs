use tsr_core::ArrayValue;
use tsr_fabric::Request;
use tsr_primitive::DistributedContext;
use tsr_runtime::{EvidenceKind, RuntimeContext};
use tsr_tiling::{DistributedArrayHandle, RegisteredArray, TilingError, TilingScheme};

use crate::DistributedError;

/// Registers an existing local tile as this locality's part of `name`,
/// after checking it against the span `scheme` assigns for `global_shape`.
pub fn annotate_d(
    dist: &DistributedContext,
    runtime: &RuntimeContext,
    tile: ArrayValue,
    name: &str,
    scheme: TilingScheme,
    global_shape: &[usize],
) -> Result<RegisteredArray, DistributedError> {
    let locality = dist.locality()?;
    let annotation = dist.arrays().next_annotation(name);
    let handle = DistributedArrayHandle::tiled(locality, annotation, global_shape, scheme)?;
    let registered = dist.arrays().register(dist.fabric(), handle, tile)?;
    runtime.record(
        EvidenceKind::Distributed,
        format!(
            "annotate_d name={} tile={} scheme={scheme}",
            registered.handle.annotation(),
            registered.handle.local_tile()
        ),
    );
    Ok(registered)
}

/// Copy of `locality`'s tile of the registered array `name`.
pub async fn fetch_tile(
    dist: &DistributedContext,
    name: &str,
    locality: usize,
) -> Result<ArrayValue, DistributedError> {
    let entry = dist
        .arrays()
        .get(name)
        .ok_or_else(|| TilingError::NotRegistered {
            name: name.to_string(),
        })?;
    if locality == entry.handle.locality().locality_id() {
        return Ok(entry.tile.copy());
    }
    if entry.handle.tile(locality).is_none() {
        return Err(TilingError::InvalidLocality {
            locality_id: locality,
            num_localities: entry.handle.locality().num_localities(),
        }
        .into());
    }
    let handle = entry.remotes.resolve(dist.fabric(), locality).await?;
    tracing::trace!(name, locality, %handle, "fetching remote tile");
    let value = dist.fabric().send_rpc(handle, Request::FetchTile).await?;
    Ok(value.into_array()?)
}
