#![forbid(unsafe_code)]

mod config;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{ConfigError, EngineConfig, KNOWN_TILINGS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Dispatch,
    Store,
    Distributed,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only record of runtime decisions. With a capacity set, the oldest
/// entries are dropped first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
    capacity: Option<usize>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: Some(capacity),
        }
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
        if let Some(capacity) = self.capacity {
            let excess = self.entries.len().saturating_sub(capacity);
            self.entries.drain(..excess);
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }
}

/// Per-prefix counters for generated names such as `random_array_0`.
///
/// Counters start at zero and only move forward until [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct NameGenerator {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl NameGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, prefix: &str) -> String {
        let mut counters = lock(&self.counters);
        let counter = counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{prefix}_{counter}");
        *counter += 1;
        name
    }

    pub fn reset(&self) {
        lock(&self.counters).clear();
    }
}

/// Process-wide state shared by every primitive evaluated on one locality.
#[derive(Debug)]
pub struct RuntimeContext {
    config: EngineConfig,
    ledger: Mutex<EvidenceLedger>,
    names: NameGenerator,
}

impl RuntimeContext {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut ledger = match config.evidence_capacity {
            Some(capacity) => EvidenceLedger::with_capacity_limit(capacity),
            None => EvidenceLedger::new(),
        };
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "runtime initialized locality={}/{} tiling={}",
                config.locality_id, config.num_localities, config.default_tiling
            ),
        );
        Ok(Self {
            config,
            ledger: Mutex::new(ledger),
            names: NameGenerator::new(),
        })
    }

    /// Single-locality context with default settings.
    #[must_use]
    pub fn local() -> Self {
        let config = EngineConfig::default();
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Policy, "runtime initialized locality=0/1");
        Self {
            config,
            ledger: Mutex::new(ledger),
            names: NameGenerator::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn names(&self) -> &NameGenerator {
        &self.names
    }

    pub fn record(&self, kind: EvidenceKind, summary: impl Into<String>) {
        lock(&self.ledger).record(kind, summary);
    }

    /// Copy of the ledger as it stands now.
    #[must_use]
    pub fn ledger(&self) -> EvidenceLedger {
        lock(&self.ledger).clone()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        lock(&self.ledger).len()
    }
}

/// Installs a global fmt subscriber filtered by `filter`. Returns `false`
/// when a subscriber is already installed.
pub fn init_tracing(filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(true)
        .try_init()
        .is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
