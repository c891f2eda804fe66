use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, try_join_all};
use tsr_core::{NodeId, Value};
use tsr_fabric::Fabric;
use tsr_runtime::RuntimeContext;
use tsr_tiling::{ArrayTable, LocalityInfo, TilingError};

use crate::{ErrorKind, PrimitiveError, PrimitiveGraph, PrimitiveInfo};

/// Per-locality state used by distributed primitives.
#[derive(Debug)]
pub struct DistributedContext {
    fabric: Arc<dyn Fabric>,
    arrays: ArrayTable,
    rounds: Mutex<HashMap<String, u64>>,
}

impl DistributedContext {
    #[must_use]
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self {
            fabric,
            arrays: ArrayTable::new(),
            rounds: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn fabric(&self) -> &dyn Fabric {
        self.fabric.as_ref()
    }

    #[must_use]
    pub fn arrays(&self) -> &ArrayTable {
        &self.arrays
    }

    pub fn locality(&self) -> Result<LocalityInfo, TilingError> {
        LocalityInfo::new(self.fabric.locality_id(), self.fabric.num_localities())
    }

    /// Per-tag collective generation. Localities issuing collectives in the
    /// same order draw matching generations.
    pub fn next_round(&self, tag: &str) -> u64 {
        let mut rounds = self.rounds.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = rounds.entry(tag.to_string()).or_insert(0);
        let round = *counter;
        *counter += 1;
        round
    }
}

/// Everything one evaluation of a graph can see: the graph itself, the
/// call-time positional arguments and the locality's runtime state.
#[derive(Debug, Clone)]
pub struct EvalContext {
    graph: Arc<PrimitiveGraph>,
    args: Arc<Vec<Value>>,
    runtime: Arc<RuntimeContext>,
    distributed: Option<Arc<DistributedContext>>,
}

impl EvalContext {
    #[must_use]
    pub fn new(graph: Arc<PrimitiveGraph>, runtime: Arc<RuntimeContext>) -> Self {
        Self {
            graph,
            args: Arc::new(Vec::new()),
            runtime,
            distributed: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = Arc::new(args);
        self
    }

    #[must_use]
    pub fn with_distributed(mut self, distributed: Arc<DistributedContext>) -> Self {
        self.distributed = Some(distributed);
        self
    }

    #[must_use]
    pub fn graph(&self) -> &PrimitiveGraph {
        &self.graph
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    /// Distributed state, or an error naming `info` when the graph runs
    /// without one.
    pub fn distributed(&self, info: &PrimitiveInfo) -> Result<&DistributedContext, PrimitiveError> {
        self.distributed.as_deref().ok_or_else(|| {
            info.error(
                ErrorKind::Unsupported,
                "distributed primitive evaluated without a fabric",
            )
        })
    }

    pub async fn eval_root(&self) -> Result<Value, PrimitiveError> {
        self.eval_node(self.graph.root()).await
    }

    pub fn eval_node(&self, id: NodeId) -> BoxFuture<'_, Result<Value, PrimitiveError>> {
        Box::pin(async move {
            let node = self.graph.node(id).ok_or_else(|| missing_node(id))?;
            node.primitive.eval(&node.info, &node.operands, self).await
        })
    }

    pub fn store_node(
        &self,
        id: NodeId,
        value: Value,
        slices: Vec<Value>,
    ) -> BoxFuture<'_, Result<(), PrimitiveError>> {
        Box::pin(async move {
            let node = self.graph.node(id).ok_or_else(|| missing_node(id))?;
            tracing::debug!(
                target = %node.info.codename,
                slices = slices.len(),
                "store forwarded"
            );
            node.primitive
                .store(&node.info, &node.operands, value, slices, self)
                .await
        })
    }

    /// Literal operands evaluate to themselves; handles evaluate their node;
    /// lists evaluate element-wise.
    pub fn eval_operand<'a>(&'a self, operand: &'a Value) -> BoxFuture<'a, Result<Value, PrimitiveError>> {
        Box::pin(async move {
            match operand {
                Value::PrimitiveHandle(id) => self.eval_node(*id).await,
                Value::List(items) if items.iter().any(contains_handle) => {
                    Ok(Value::List(self.eval_operands(items).await?))
                }
                literal => Ok(literal.clone()),
            }
        })
    }

    /// Evaluates every operand concurrently; results keep operand order.
    pub async fn eval_operands(&self, operands: &[Value]) -> Result<Vec<Value>, PrimitiveError> {
        try_join_all(operands.iter().map(|operand| self.eval_operand(operand))).await
    }
}

fn contains_handle(value: &Value) -> bool {
    match value {
        Value::PrimitiveHandle(_) => true,
        Value::List(items) => items.iter().any(contains_handle),
        _ => false,
    }
}

fn missing_node(id: NodeId) -> PrimitiveError {
    PrimitiveInfo::new("graph", format!("node_{}", id.0)).error(
        ErrorKind::InvalidArgument,
        format!("node {} is not part of the graph", id.0),
    )
}
