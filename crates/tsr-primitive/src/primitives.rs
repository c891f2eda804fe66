use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tsr_core::{ArrayValue, MAX_DIMS, Value};
use tsr_dispatch::{BinaryOp, dispatch_binary};
use tsr_kernel_cpu::{ReduceOp, SliceSpec, UnaryOp, reduce, slice_assign, slice_read, unary};
use tsr_runtime::EvidenceKind;

use crate::{ErrorKind, EvalContext, Primitive, PrimitiveError, PrimitiveInfo};

/// Literal value; every evaluation hands out a fresh copy.
#[derive(Debug, Clone)]
pub struct Constant {
    value: Value,
}

impl Constant {
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl Primitive for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        _ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 0, 0)?;
        Ok(self.value.clone())
    }
}

/// Mutable named binding. Arrays are held in shared storage, so every
/// evaluation returns an alias and slice stores are visible through all of
/// them.
#[derive(Debug)]
pub struct Variable {
    name: String,
    binding: Mutex<Option<Value>>,
}

impl Variable {
    /// Unbound variable; the first evaluation binds its single operand.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn bound(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            binding: Mutex::new(Some(into_reference(value.into()))),
        }
    }

    #[must_use]
    pub fn variable_name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Option<Value> {
        lock(&self.binding).clone()
    }
}

#[async_trait]
impl Primitive for Variable {
    fn name(&self) -> &str {
        "variable"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 0, 1)?;
        if let Some(value) = self.current() {
            return Ok(value);
        }
        let Some(initializer) = operands.first() else {
            return Err(info.error(
                ErrorKind::InvalidArgument,
                format!("variable '{}' is unbound", self.name),
            ));
        };
        let value = into_reference(ctx.eval_operand(initializer).await?);
        let mut binding = lock(&self.binding);
        Ok(binding.get_or_insert(value).clone())
    }

    async fn store(
        &self,
        info: &PrimitiveInfo,
        _operands: &[Value],
        value: Value,
        slices: Vec<Value>,
        ctx: &EvalContext,
    ) -> Result<(), PrimitiveError> {
        if slices.is_empty() {
            *lock(&self.binding) = Some(into_reference(value));
            ctx.runtime().record(
                EvidenceKind::Store,
                format!("variable={} rebound codename={}", self.name, info.codename),
            );
            return Ok(());
        }
        let target = self.current().ok_or_else(|| {
            info.error(
                ErrorKind::InvalidArgument,
                format!("variable '{}' is unbound", self.name),
            )
        })?;
        store_into_value(info, &target, value, &slices)?;
        ctx.runtime().record(
            EvidenceKind::Store,
            format!(
                "variable={} slice_assign slices={} codename={}",
                self.name,
                slices.len(),
                info.codename
            ),
        );
        Ok(())
    }
}

/// Positional call-time argument.
#[derive(Debug, Clone, Copy)]
pub struct AccessArgument {
    index: usize,
}

impl AccessArgument {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    fn argument<'a>(
        &self,
        info: &PrimitiveInfo,
        ctx: &'a EvalContext,
    ) -> Result<&'a Value, PrimitiveError> {
        ctx.args().get(self.index).ok_or_else(|| {
            info.error(
                ErrorKind::InvalidArgument,
                format!(
                    "argument {} requested, {} supplied",
                    self.index,
                    ctx.args().len()
                ),
            )
        })
    }
}

#[async_trait]
impl Primitive for AccessArgument {
    fn name(&self) -> &str {
        "access_argument"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 0, 0)?;
        match self.argument(info, ctx)? {
            Value::PrimitiveHandle(id) => ctx.eval_node(*id).await,
            value => Ok(value.clone()),
        }
    }

    async fn store(
        &self,
        info: &PrimitiveInfo,
        _operands: &[Value],
        value: Value,
        slices: Vec<Value>,
        ctx: &EvalContext,
    ) -> Result<(), PrimitiveError> {
        match self.argument(info, ctx)? {
            Value::PrimitiveHandle(id) => ctx.store_node(*id, value, slices).await,
            target => {
                store_into_value(info, target, value, &slices)?;
                ctx.runtime().record(
                    EvidenceKind::Store,
                    format!(
                        "argument={} slice_assign slices={} codename={}",
                        self.index,
                        slices.len(),
                        info.codename
                    ),
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Binary {
    op: BinaryOp,
}

impl Binary {
    #[must_use]
    pub fn new(op: BinaryOp) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Primitive for Binary {
    fn name(&self) -> &str {
        self.op.name()
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 2, 2)?;
        let mut values = ctx.eval_operands(operands).await?.into_iter();
        let (Some(lhs), Some(rhs)) = (values.next(), values.next()) else {
            return Err(info.error(ErrorKind::InvalidArgument, "missing operand"));
        };
        let lhs = lhs.into_array().map_err(|error| info.fail(error))?;
        let rhs = rhs.into_array().map_err(|error| info.fail(error))?;
        let outcome = dispatch_binary(self.op, lhs, rhs).map_err(|error| info.fail(error))?;
        ctx.runtime().record(
            EvidenceKind::Dispatch,
            format!(
                "kernel={} dtype={} reused={:?} codename={}",
                outcome.decision.kernel_name(),
                outcome.decision.result_dtype,
                outcome.decision.reused,
                info.codename
            ),
        );
        Ok(Value::Array(outcome.value))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Unary {
    op: UnaryOp,
}

impl Unary {
    #[must_use]
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Primitive for Unary {
    fn name(&self) -> &str {
        self.op.name()
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 1, 1)?;
        let operand = ctx.eval_operand(&operands[0]).await?;
        let array = operand.into_array().map_err(|error| info.fail(error))?;
        let (result, reused) = unary(self.op, array).map_err(|error| info.fail(error))?;
        tracing::trace!(op = self.op.name(), reused, codename = %info.codename, "unary");
        Ok(Value::Array(result))
    }
}

/// Reduction over every element to a 0-d array.
#[derive(Debug, Clone, Copy)]
pub struct Reduce {
    op: ReduceOp,
}

impl Reduce {
    #[must_use]
    pub fn new(op: ReduceOp) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Primitive for Reduce {
    fn name(&self) -> &str {
        self.op.name()
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 1, 1)?;
        let operand = ctx.eval_operand(&operands[0]).await?;
        let array = operand.into_array().map_err(|error| info.fail(error))?;
        let result = reduce(self.op, &array).map_err(|error| info.fail(error))?;
        Ok(Value::Array(result))
    }
}

/// `slice(target, spec...)`: NumPy-style basic indexing. Each spec is `nil`
/// (whole axis), an integer index, or a list `[start, stop, step]` whose
/// entries may be `nil`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slice;

#[async_trait]
impl Primitive for Slice {
    fn name(&self) -> &str {
        "slice"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 1, 1 + MAX_DIMS)?;
        let mut values = ctx.eval_operands(operands).await?;
        let specs = slice_specs(info, &values[1..])?;
        let target = values
            .swap_remove(0)
            .into_array()
            .map_err(|error| info.fail(error))?;
        let result = match &target {
            ArrayValue::Bool(array) => slice_read(array, &specs).map(ArrayValue::from),
            ArrayValue::Int64(array) => slice_read(array, &specs).map(ArrayValue::from),
            ArrayValue::Float64(array) => slice_read(array, &specs).map(ArrayValue::from),
        }
        .map_err(|error| info.fail(error))?;
        Ok(Value::Array(result))
    }

    async fn store(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        value: Value,
        slices: Vec<Value>,
        ctx: &EvalContext,
    ) -> Result<(), PrimitiveError> {
        info.expect_operands(operands, 1, 1 + MAX_DIMS)?;
        let mut combined = ctx.eval_operands(&operands[1..]).await?;
        combined.extend(slices);
        match &operands[0] {
            Value::PrimitiveHandle(id) => ctx.store_node(*id, value, combined).await,
            target => store_into_value(info, target, value, &combined),
        }
    }
}

/// `store(target, value, spec...)`: writes `value` into `target`, which is
/// either another node or a referenced array.
#[derive(Debug, Clone, Copy, Default)]
pub struct Store;

#[async_trait]
impl Primitive for Store {
    fn name(&self) -> &str {
        "store"
    }

    async fn eval(
        &self,
        info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        info.expect_operands(operands, 2, 2 + MAX_DIMS)?;
        let mut rest = ctx.eval_operands(&operands[1..]).await?;
        let value = rest.remove(0);
        let slices = rest;
        match &operands[0] {
            Value::PrimitiveHandle(id) => ctx.store_node(*id, value, slices).await?,
            target => {
                store_into_value(info, target, value, &slices)?;
                ctx.runtime().record(
                    EvidenceKind::Store,
                    format!("slice_assign into literal codename={}", info.codename),
                );
            }
        }
        Ok(Value::Nil)
    }
}

/// Evaluates operands one after another and yields the last value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Block;

#[async_trait]
impl Primitive for Block {
    fn name(&self) -> &str {
        "block"
    }

    async fn eval(
        &self,
        _info: &PrimitiveInfo,
        operands: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, PrimitiveError> {
        let mut last = Value::Nil;
        for operand in operands {
            last = ctx.eval_operand(operand).await?;
        }
        Ok(last)
    }
}

/// Parses evaluated slicing operands.
pub fn slice_specs(info: &PrimitiveInfo, values: &[Value]) -> Result<Vec<SliceSpec>, PrimitiveError> {
    values.iter().map(|value| slice_spec(info, value)).collect()
}

fn slice_spec(info: &PrimitiveInfo, value: &Value) -> Result<SliceSpec, PrimitiveError> {
    let invalid = || {
        info.error(
            ErrorKind::InvalidArgument,
            format!("invalid slicing operand of kind {:?}", value.kind()),
        )
    };
    let bound = |value: &Value| match value {
        Value::Nil => Ok(None),
        other => other.as_i64().map(Some).map_err(|_| invalid()),
    };
    match value {
        Value::Nil => Ok(SliceSpec::All),
        Value::List(items) => match items.as_slice() {
            [start] => Ok(SliceSpec::Range {
                start: bound(start)?,
                stop: None,
                step: 1,
            }),
            [start, stop] => Ok(SliceSpec::Range {
                start: bound(start)?,
                stop: bound(stop)?,
                step: 1,
            }),
            [start, stop, step] => Ok(SliceSpec::Range {
                start: bound(start)?,
                stop: bound(stop)?,
                step: bound(step)?.unwrap_or(1),
            }),
            _ => Err(invalid()),
        },
        other => other.as_i64().map(SliceSpec::Index).map_err(|_| invalid()),
    }
}

/// Slice-assigns `value` into the referenced array `target`, writing
/// through to every alias.
pub fn store_into_value(
    info: &PrimitiveInfo,
    target: &Value,
    value: Value,
    slices: &[Value],
) -> Result<(), PrimitiveError> {
    if slices.is_empty() {
        return Err(info.error(
            ErrorKind::NotImplemented,
            "store into a plain value requires slicing operands",
        ));
    }
    let Value::Array(target) = target else {
        return Err(info.error(
            ErrorKind::InvalidArgument,
            format!("store target of kind {:?} is not an array", target.kind()),
        ));
    };
    if !target.is_reference() {
        return Err(info.error(
            ErrorKind::InvalidArgument,
            "store target is not a reference",
        ));
    }
    let specs = slice_specs(info, slices)?;
    let value = value.into_array().map_err(|error| info.fail(error))?;
    let assigned = match target.clone() {
        ArrayValue::Bool(mut alias) => slice_assign(&mut alias, &specs, value.into_typed()),
        ArrayValue::Int64(mut alias) => slice_assign(&mut alias, &specs, value.into_typed()),
        ArrayValue::Float64(mut alias) => slice_assign(&mut alias, &specs, value.into_typed()),
    };
    assigned.map_err(|error| info.fail(error))?;
    tracing::debug!(codename = %info.codename, slices = specs.len(), "slice assigned in place");
    Ok(())
}

fn into_reference(value: Value) -> Value {
    match value {
        Value::Array(array) => Value::Array(array.into_shared()),
        other => other,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
