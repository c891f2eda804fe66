use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tsr_core::{ArrayValue, Value, ValueDict};
use tsr_fabric::{Fabric, FabricError, Handle, RemoteObject, Request};

use crate::{AnnotationInfo, DistributedArrayHandle, TileInfo, TilingError, TilingSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationState {
    Unregistered,
    Registered,
    Derived,
}

/// Serves one locality's tile to the rest of the world.
#[derive(Debug)]
pub struct TileServer {
    annotation: AnnotationInfo,
    tile_info: TileInfo,
    tile: ArrayValue,
}

impl TileServer {
    #[must_use]
    pub fn new(annotation: AnnotationInfo, tile_info: TileInfo, tile: ArrayValue) -> Self {
        Self {
            annotation,
            tile_info,
            tile,
        }
    }
}

impl RemoteObject for TileServer {
    fn serve(&self, request: Request) -> Result<Value, FabricError> {
        match request {
            Request::FetchTile => Ok(Value::Array(self.tile.clone())),
            Request::Describe => Ok(describe(&self.annotation, &self.tile_info)),
        }
    }
}

/// Dict form of an annotation and tile: `name`, `generation`, `spans`.
#[must_use]
pub fn describe(annotation: &AnnotationInfo, tile: &TileInfo) -> Value {
    let spans = tile
        .spans
        .iter()
        .map(|span| {
            Value::List(vec![
                Value::Int64(span.start as i64),
                Value::Int64(span.stop as i64),
            ])
        })
        .collect::<Vec<_>>();
    let mut dict = ValueDict::new();
    dict.insert(Value::from("name"), Value::from(annotation.base_name()));
    dict.insert(
        Value::from("generation"),
        Value::Int64(annotation.generation() as i64),
    );
    dict.insert(Value::from("spans"), Value::List(spans));
    Value::Dict(dict)
}

/// Inverse of [`describe`].
pub fn parse_description(value: &Value) -> Result<(AnnotationInfo, TileInfo), TilingError> {
    let malformed = |what: &str| TilingError::Inconsistent {
        message: format!("malformed tile description: {what}"),
    };
    let Value::Dict(dict) = value else {
        return Err(malformed("not a dict"));
    };
    let field = |key: &str| {
        dict.get(&Value::from(key))
            .ok_or_else(|| malformed(&format!("missing '{key}'")))
    };
    let name = field("name")?
        .as_str()
        .map_err(|_| malformed("name"))?
        .to_string();
    let generation = field("generation")?
        .as_i64()
        .ok()
        .and_then(|g| u64::try_from(g).ok())
        .ok_or_else(|| malformed("generation"))?;
    let spans = field("spans")?
        .as_list()
        .map_err(|_| malformed("spans"))?
        .iter()
        .map(|pair| {
            let bounds = pair.as_list().map_err(|_| malformed("span"))?;
            let bound = |index: usize| {
                bounds
                    .get(index)
                    .and_then(|v| v.as_i64().ok())
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or_else(|| malformed("span bound"))
            };
            Ok(TilingSpan::new(bound(0)?, bound(1)?))
        })
        .collect::<Result<Vec<_>, TilingError>>()?;
    Ok((
        AnnotationInfo::with_generation(name, generation),
        TileInfo::new(spans),
    ))
}

/// Remote handles of one distributed array, keyed by locality.
///
/// The lock is never held while a resolution is in flight; a result that
/// raced with another resolver is discarded in favour of the cached one.
#[derive(Debug)]
pub struct RemoteHandleCache {
    name: String,
    handles: Mutex<HashMap<usize, Handle>>,
}

impl RemoteHandleCache {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn resolve(&self, fabric: &dyn Fabric, locality: usize) -> Result<Handle, TilingError> {
        if let Some(handle) = lock(&self.handles).get(&locality).copied() {
            return Ok(handle);
        }
        let resolved = fabric.resolve(&self.name, locality).await?;
        let mut handles = lock(&self.handles);
        Ok(*handles.entry(locality).or_insert(resolved))
    }

    #[must_use]
    pub fn cached(&self, locality: usize) -> Option<Handle> {
        lock(&self.handles).get(&locality).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredArray {
    pub handle: DistributedArrayHandle,
    /// Alias of the hosted tile.
    pub tile: ArrayValue,
    pub fabric_handle: Handle,
    pub remotes: Arc<RemoteHandleCache>,
}

/// Distributed arrays registered by one locality, keyed by base name. Only
/// the latest generation of each name is kept.
#[derive(Debug, Default)]
pub struct ArrayTable {
    arrays: Mutex<HashMap<String, RegisteredArray>>,
}

impl ArrayTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts `tile` and publishes it under the handle's annotation name. The
    /// generation it supersedes is unpublished once the new one is visible.
    pub fn register(
        &self,
        fabric: &dyn Fabric,
        handle: DistributedArrayHandle,
        tile: ArrayValue,
    ) -> Result<RegisteredArray, TilingError> {
        let expected = handle.local_tile().shape();
        if tile.shape() != expected {
            return Err(TilingError::TileShape {
                expected,
                found: tile.shape(),
            });
        }
        let annotation = handle.annotation().clone();
        let mut arrays = lock(&self.arrays);
        let superseded = arrays.get(annotation.base_name()).map(|existing| {
            (
                existing.handle.annotation().clone(),
                existing.handle.locality().locality_id(),
            )
        });
        if let Some((current, _)) = &superseded {
            if annotation.generation() <= current.generation() {
                return Err(TilingError::StaleGeneration {
                    name: annotation.base_name().to_string(),
                    current: current.generation(),
                    found: annotation.generation(),
                });
            }
        }

        let tile = tile.into_shared();
        let server = TileServer::new(annotation.clone(), handle.local_tile().clone(), tile.clone());
        let fabric_handle = fabric.host(Arc::new(server));
        let locality = handle.locality().locality_id();
        fabric.register(&annotation.name(), locality, fabric_handle)?;
        if let Some((previous, previous_locality)) = superseded {
            match fabric.unregister(&previous.name(), previous_locality) {
                Ok(_) => {
                    tracing::trace!(name = %previous, locality, "retired superseded generation");
                }
                Err(error) => {
                    tracing::warn!(name = %previous, %error, "superseded generation was not published");
                }
            }
        }
        tracing::debug!(
            name = %annotation,
            locality,
            tile = %handle.local_tile(),
            "registered distributed array"
        );

        let registered = RegisteredArray {
            remotes: Arc::new(RemoteHandleCache::new(annotation.name())),
            handle,
            tile,
            fabric_handle,
        };
        arrays.insert(annotation.base_name().to_string(), registered.clone());
        Ok(registered)
    }

    #[must_use]
    pub fn get(&self, base_name: &str) -> Option<RegisteredArray> {
        lock(&self.arrays).get(base_name).cloned()
    }

    #[must_use]
    pub fn state(&self, base_name: &str) -> AnnotationState {
        match lock(&self.arrays).get(base_name) {
            None => AnnotationState::Unregistered,
            Some(entry) if entry.handle.annotation().generation() == 0 => {
                AnnotationState::Registered
            }
            Some(_) => AnnotationState::Derived,
        }
    }

    /// Next generation of `base_name`, or generation zero if it is unknown.
    #[must_use]
    pub fn next_annotation(&self, base_name: &str) -> AnnotationInfo {
        match lock(&self.arrays).get(base_name) {
            Some(entry) => entry.handle.annotation().derive(),
            None => AnnotationInfo::new(base_name),
        }
    }

    pub fn remove(&self, fabric: &dyn Fabric, base_name: &str) -> Result<(), TilingError> {
        let entry = lock(&self.arrays)
            .remove(base_name)
            .ok_or_else(|| TilingError::NotRegistered {
                name: base_name.to_string(),
            })?;
        fabric.unregister(
            &entry.handle.annotation().name(),
            entry.handle.locality().locality_id(),
        )?;
        Ok(())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.arrays).keys().cloned().collect();
        names.sort();
        names
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tsr_core::{ArrayValue, TypedArray, Value};
    use tsr_fabric::{Fabric, FabricError, InProcessWorld, LocalFabric, Request};

    use super::{AnnotationState, ArrayTable, RemoteHandleCache, describe, parse_description};
    use crate::{
        AnnotationInfo, DistributedArrayHandle, LocalityInfo, TileInfo, TilingError,
        TilingScheme, TilingSpan,
    };

    fn handle(locality: usize, num: usize, name: AnnotationInfo, shape: &[usize]) -> DistributedArrayHandle {
        let locality = LocalityInfo::new(locality, num).expect("locality");
        DistributedArrayHandle::tiled(locality, name, shape, TilingScheme::Row).expect("handle")
    }

    #[test]
    fn description_round_trips() {
        let annotation = AnnotationInfo::with_generation("x", 3);
        let tile = TileInfo::new(vec![TilingSpan::new(2, 5), TilingSpan::new(0, 4)]);
        let parsed = parse_description(&describe(&annotation, &tile)).expect("parse");
        assert_eq!(parsed, (annotation, tile));
        assert!(parse_description(&Value::Nil).is_err());
    }

    #[tokio::test]
    async fn register_then_derive_moves_through_states() {
        let fabric = LocalFabric::single();
        let table = ArrayTable::new();
        assert_eq!(table.state("a"), AnnotationState::Unregistered);

        let first = handle(0, 1, table.next_annotation("a"), &[3]);
        let tile = ArrayValue::from(TypedArray::vector(vec![1i64, 2, 3]));
        table.register(fabric.as_ref(), first.clone(), tile.clone()).expect("register");
        assert_eq!(table.state("a"), AnnotationState::Registered);

        let err = table
            .register(fabric.as_ref(), first.clone(), tile.clone())
            .expect_err("same generation");
        assert!(matches!(err, TilingError::StaleGeneration { .. }));

        let derived = first.derive();
        assert_eq!(table.next_annotation("a"), *derived.annotation());
        table.register(fabric.as_ref(), derived, tile).expect("derive");
        assert_eq!(table.state("a"), AnnotationState::Derived);

        let resolved = fabric.resolve("a@1", 0).await.expect("resolve");
        let served = fabric.send_rpc(resolved, Request::Describe).await.expect("describe");
        let (annotation, _) = parse_description(&served).expect("parse");
        assert_eq!(annotation.generation(), 1);
    }

    #[tokio::test]
    async fn derived_generation_replaces_the_published_one() {
        let fabric = LocalFabric::single();
        let table = ArrayTable::new();
        let tile = ArrayValue::from(TypedArray::vector(vec![1i64, 2]));
        let first = handle(0, 1, table.next_annotation("w"), &[2]);
        table
            .register(fabric.as_ref(), first.clone(), tile.clone())
            .expect("register");
        table
            .register(fabric.as_ref(), first.derive(), tile)
            .expect("derive");

        assert!(matches!(
            fabric.unregister("w@0", 0),
            Err(FabricError::NotRegistered { .. })
        ));
        let current = table.get("w").expect("entry");
        let served = fabric
            .send_rpc(current.fabric_handle, Request::FetchTile)
            .await
            .expect("fetch");
        assert_eq!(served.as_array().expect("array").to_f64_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn racing_registrations_of_one_generation_admit_a_single_winner() {
        let fabric = LocalFabric::single();
        let table = Arc::new(ArrayTable::new());
        let outcomes: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let fabric = Arc::clone(&fabric);
                    scope.spawn(move || {
                        let tile = ArrayValue::from(TypedArray::vector(vec![0.5f64]));
                        let entry = handle(0, 1, AnnotationInfo::new("r"), &[1]);
                        table.register(fabric.as_ref(), entry, tile).is_ok()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().expect("worker"))
                .collect()
        });
        assert_eq!(outcomes.iter().filter(|won| **won).count(), 1);
        assert_eq!(table.state("r"), AnnotationState::Registered);
    }

    #[test]
    fn tile_shape_must_match_local_span() {
        let fabric = LocalFabric::single();
        let table = ArrayTable::new();
        let handle = handle(0, 1, AnnotationInfo::new("b"), &[4]);
        let tile = ArrayValue::from(TypedArray::vector(vec![1.0f64, 2.0]));
        let err = table.register(fabric.as_ref(), handle, tile).expect_err("shape");
        assert_eq!(
            err,
            TilingError::TileShape {
                expected: vec![4],
                found: vec![2]
            }
        );
    }

    #[tokio::test]
    async fn remote_handles_are_cached_after_first_resolution() {
        let world = InProcessWorld::new(2);
        let table = ArrayTable::new();
        let remote = handle(1, 2, AnnotationInfo::new("c"), &[4]);
        table
            .register(
                world[1].as_ref(),
                remote,
                ArrayValue::from(TypedArray::vector(vec![3.0f64, 4.0])),
            )
            .expect("register");

        let cache = Arc::new(RemoteHandleCache::new("c@0"));
        assert!(cache.is_empty());
        let first = cache.resolve(world[0].as_ref(), 1).await.expect("resolve");
        assert_eq!(cache.cached(1), Some(first));

        world[1].unregister("c@0", 1).expect("unregister");
        let second = cache.resolve(world[0].as_ref(), 1).await.expect("cached");
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }
}
