use async_trait::async_trait;
use tsr_core::{ArrayValue, Value};
use tsr_primitive::{ErrorKind, EvalContext, Primitive, PrimitiveError, PrimitiveInfo};
use tsr_tiling::TilingScheme;

use crate::{RandomRequest, all_gather, annotate_d, dist_random, fetch_tile};

/// `all_gather_d(tile, tiling_type[, name])`: every locality ends up with
/// the assembled array.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllGather;

#[async_trait]
impl Primitive for AllGather {
    fn name(&self) -> &str {
        "all_gather_d"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 2, 3)?;
        let dist = ctx.distributed(info)?;
        let mut values = ctx.eval_operands(operands).await?.into_iter();
        let tile = next_array(info, values.next())?;
        let scheme = scheme_operand(info, values.next().as_ref(), ctx)?;
        let name = optional_name(info, values.next().as_ref())?;
        let report = all_gather(dist, ctx.runtime(), tile, scheme, name.as_deref())
            .await
            .map_err(|error| info.fail(error))?;
        tracing::debug!(
            codename = %info.codename,
            annotation = %report.annotation,
            round = ?report.round,
            "gathered"
        );
        Ok(Value::Array(report.value))
    }
}

/// `dist_random(dims, tile_index, numtiles[, name[, tiling_type[, mean, std]]])`.
/// Yields the generated local tile.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistRandom;

#[async_trait]
impl Primitive for DistRandom {
    fn name(&self) -> &str {
        "dist_random"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 3, 7)?;
        if operands.len() == 6 {
            return Err(info.error(
                ErrorKind::InvalidArgument,
                "mean and std must be given together",
            ));
        }
        let dist = ctx.distributed(info)?;
        let values = ctx.eval_operands(operands).await?;
        let dims = dims_operand(info, &values[0])?;
        let tile_index = index_operand(info, &values[1], "tile_index")?;
        let numtiles = index_operand(info, &values[2], "numtiles")?;
        let mut request = RandomRequest::new(dims, tile_index, numtiles);
        request.name = optional_name(info, values.get(3))?;
        request.scheme = scheme_operand(info, values.get(4), ctx)?;
        if let [mean, std] = &values[values.len().min(5)..] {
            request.mean = mean.as_f64().map_err(|error| info.fail(error))?;
            request.std = std.as_f64().map_err(|error| info.fail(error))?;
        }
        let registered =
            dist_random(dist, ctx.runtime(), &request).map_err(|error| info.fail(error))?;
        Ok(Value::Array(registered.tile))
    }
}

/// `annotate_d(tile, name, tiling_type, global_shape)`: yields the tile,
/// now registered as this locality's part of `name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotateD;

#[async_trait]
impl Primitive for AnnotateD {
    fn name(&self) -> &str {
        "annotate_d"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 4, 4)?;
        let dist = ctx.distributed(info)?;
        let values = ctx.eval_operands(operands).await?;
        let tile = values[0].as_array().map_err(|error| info.fail(error))?;
        let name = values[1].as_str().map_err(|error| info.fail(error))?;
        let scheme = scheme_operand(info, Some(&values[2]), ctx)?;
        let global_shape = dims_operand(info, &values[3])?;
        let registered = annotate_d(dist, ctx.runtime(), tile, name, scheme, &global_shape)
            .map_err(|error| info.fail(error))?;
        Ok(Value::Array(registered.tile))
    }
}

/// `fetch_tile(name, locality)`: a copy of another locality's tile.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchTile;

#[async_trait]
impl Primitive for FetchTile {
    fn name(&self) -> &str {
        "fetch_tile"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 2, 2)?;
        let dist = ctx.distributed(info)?;
        let values = ctx.eval_operands(operands).await?;
        let name = values[0].as_str().map_err(|error| info.fail(error))?;
        let locality = index_operand(info, &values[1], "locality")?;
        let tile = fetch_tile(dist, name, locality)
            .await
            .map_err(|error| info.fail(error))?;
        Ok(Value::Array(tile))
    }
}

fn next_array(info: &PrimitiveInfo, value: Option<Value>) -> Result<ArrayValue, PrimitiveError> {
    value
        .ok_or_else(|| info.error(ErrorKind::InvalidArgument, "missing tile operand"))?
        .into_array()
        .map_err(|error| info.fail(error))
}

/// `nil` or absent selects the configured default tiling.
fn scheme_operand(
    info: &PrimitiveInfo,
    value: Option<&Value>,
    ctx: &EvalContext,
) -> Result<TilingScheme, PrimitiveError> {
    let name = match value {
        None | Some(Value::Nil) => ctx.runtime().config().default_tiling.as_str(),
        Some(value) => value.as_str().map_err(|error| info.fail(error))?,
    };
    TilingScheme::parse(name).map_err(|error| info.fail(error))
}

fn optional_name(
    info: &PrimitiveInfo,
    value: Option<&Value>,
) -> Result<Option<String>, PrimitiveError> {
    match value {
        None | Some(Value::Nil) => Ok(None),
        Some(Value::String(name)) if name.is_empty() => Ok(None),
        Some(value) => value
            .as_str()
            .map(|name| Some(name.to_string()))
            .map_err(|error| info.fail(error)),
    }
}

fn index_operand(info: &PrimitiveInfo, value: &Value, what: &str) -> Result<usize, PrimitiveError> {
    let raw = value.as_i64().map_err(|error| info.fail(error))?;
    usize::try_from(raw).map_err(|_| {
        info.error(
            ErrorKind::InvalidArgument,
            format!("{what} must be non-negative, got {raw}"),
        )
    })
}

/// Dimensions as a list of integers, a 1-d integer array or a single
/// integer for a vector.
fn dims_operand(info: &PrimitiveInfo, value: &Value) -> Result<Vec<usize>, PrimitiveError> {
    let raw: Vec<i64> = match value {
        Value::Int64(extent) => vec![*extent],
        Value::List(items) => items
            .iter()
            .map(Value::as_i64)
            .collect::<Result<_, _>>()
            .map_err(|error| info.fail(error))?,
        Value::Array(ArrayValue::Int64(array)) if array.dims() == 1 => array.to_vec(),
        other => {
            return Err(info.error(
                ErrorKind::InvalidArgument,
                format!("dimensions must be a list of integers, got {:?}", other.kind()),
            ));
        }
    };
    raw.into_iter()
        .map(|extent| {
            usize::try_from(extent).map_err(|_| {
                info.error(
                    ErrorKind::InvalidArgument,
                    format!("negative extent {extent} in dimensions"),
                )
            })
        })
        .collect()
}
