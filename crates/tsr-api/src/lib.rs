#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tsr_fabric::{Fabric, LocalFabric};
use tsr_primitive::{DistributedContext, EvalContext, PrimitiveError, PrimitiveGraph};
use tsr_runtime::{ConfigError, EngineConfig, EvidenceEntry, EvidenceKind, RuntimeContext};

pub use tsr_core::{ArrayValue, DType, NodeId, TypedArray, Value, ValueDict};
pub use tsr_dispatch::BinaryOp;
pub use tsr_distributed::{AllGather, AnnotateD, DistRandom, FetchTile};
pub use tsr_primitive::{
    AccessArgument, Binary, Block, Constant, ErrorKind, Reduce, Slice, Store, Unary, Variable,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Config(ConfigError),
    LocalityMismatch {
        configured: (usize, usize),
        fabric: (usize, usize),
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "{error}"),
            Self::LocalityMismatch {
                configured,
                fabric,
            } => write!(
                f,
                "configured as locality {}/{} but the fabric is locality {}/{}",
                configured.0, configured.1, fabric.0, fabric.1
            ),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// One locality's entry point: configuration, evidence, name counters and
/// the distributed array table, shared by every graph it evaluates.
#[derive(Debug, Clone)]
pub struct Session {
    runtime: Arc<RuntimeContext>,
    distributed: Arc<DistributedContext>,
}

impl Session {
    /// Single-locality session with default configuration.
    #[must_use]
    pub fn local() -> Self {
        Self {
            runtime: Arc::new(RuntimeContext::local()),
            distributed: Arc::new(DistributedContext::new(LocalFabric::single())),
        }
    }

    /// Single-locality session; `config` must describe a one-locality world.
    pub fn new(config: EngineConfig) -> Result<Self, SessionError> {
        Self::with_fabric(config, LocalFabric::single())
    }

    /// Session over an existing fabric. The configured locality must be the
    /// fabric's.
    pub fn with_fabric(config: EngineConfig, fabric: Arc<dyn Fabric>) -> Result<Self, SessionError> {
        let configured = (config.locality_id, config.num_localities);
        let actual = (fabric.locality_id(), fabric.num_localities());
        if configured != actual {
            return Err(SessionError::LocalityMismatch {
                configured,
                fabric: actual,
            });
        }
        let runtime = RuntimeContext::new(config)?;
        Ok(Self {
            runtime: Arc::new(runtime),
            distributed: Arc::new(DistributedContext::new(fabric)),
        })
    }

    pub fn from_env() -> Result<Self, SessionError> {
        Self::new(EngineConfig::from_env()?)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.runtime.config()
    }

    #[must_use]
    pub fn locality_id(&self) -> usize {
        self.runtime.config().locality_id
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    #[must_use]
    pub fn distributed(&self) -> &DistributedContext {
        &self.distributed
    }

    /// Installs the tracing subscriber with the configured filter.
    pub fn init_tracing(&self) -> bool {
        tsr_runtime::init_tracing(&self.runtime.config().log_filter)
    }

    /// Evaluation context for `graph` bound to this session.
    #[must_use]
    pub fn context(&self, graph: Arc<PrimitiveGraph>, args: Vec<Value>) -> EvalContext {
        EvalContext::new(graph, Arc::clone(&self.runtime))
            .with_args(args)
            .with_distributed(Arc::clone(&self.distributed))
    }

    pub async fn eval(
        &self,
        graph: Arc<PrimitiveGraph>,
        args: Vec<Value>,
    ) -> Result<Value, PrimitiveError> {
        tracing::debug!(
            locality = self.locality_id(),
            nodes = graph.len(),
            args = args.len(),
            "evaluating graph"
        );
        self.context(graph, args).eval_root().await
    }

    /// Restarts generated names (`random_array_<n>` and friends) from zero.
    pub fn reset_names(&self) {
        self.runtime.names().reset();
        self.runtime.record(EvidenceKind::Policy, "name counters reset");
    }

    #[must_use]
    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.runtime.ledger().entries().to_vec()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.evidence_len()
    }
}

/// Sessions for every locality of one in-process world, for SPMD-style
/// programs and tests.
#[derive(Debug, Clone)]
pub struct InProcessWorld {
    sessions: Vec<Session>,
}

impl InProcessWorld {
    pub fn new(num_localities: usize) -> Result<Self, SessionError> {
        Self::with_config(EngineConfig {
            num_localities,
            ..EngineConfig::default()
        })
    }

    /// World of `base.num_localities` localities sharing every other
    /// setting of `base`.
    pub fn with_config(base: EngineConfig) -> Result<Self, SessionError> {
        let num_localities = base.num_localities;
        if num_localities == 0 {
            return Err(ConfigError::NoLocalities.into());
        }
        let sessions = tsr_fabric::InProcessWorld::new(num_localities)
            .into_iter()
            .enumerate()
            .map(|(locality_id, fabric)| {
                Session::with_fabric(base.for_locality(locality_id, num_localities), fabric)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sessions })
    }

    #[must_use]
    pub fn num_localities(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session(&self, locality_id: usize) -> Option<&Session> {
        self.sessions.get(locality_id)
    }

    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Runs `task` once per locality, concurrently; results are in locality
    /// order.
    pub async fn run_spmd<F, Fut, T>(&self, task: F) -> Vec<T>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = T>,
    {
        join_all(self.sessions.iter().cloned().map(task)).await
    }

    /// Evaluates the graph `build` returns for each locality.
    pub async fn eval_each<B>(&self, build: B) -> Vec<Result<Value, PrimitiveError>>
    where
        B: Fn(usize) -> Result<PrimitiveGraph, PrimitiveError>,
    {
        self.run_spmd(|session| {
            let graph = build(session.locality_id());
            async move { session.eval(Arc::new(graph?), Vec::new()).await }
        })
        .await
    }
}
