#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tsr_core::Value;
use tsr_serialize::{SerializeError, decode_value, encode_value};

/// Address of an object hosted by one locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub locality: usize,
    pub object: u64,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}#{}", self.locality, self.object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// The full local tile.
    FetchTile,
    /// Name, generation and spans of the hosted tile.
    Describe,
}

/// Server side of [`Fabric::send_rpc`].
pub trait RemoteObject: fmt::Debug + Send + Sync {
    fn serve(&self, request: Request) -> Result<Value, FabricError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FabricError {
    Serialize(SerializeError),
    UnknownObject {
        handle: Handle,
    },
    AlreadyRegistered {
        name: String,
        locality: usize,
    },
    NotRegistered {
        name: String,
        locality: usize,
    },
    LocalityOutOfRange {
        locality: usize,
        num_localities: usize,
    },
    ParticipantMismatch {
        tag: String,
        expected: usize,
        found: usize,
    },
    DuplicateContribution {
        tag: String,
        generation: u64,
        locality: usize,
    },
    CollectiveAborted {
        tag: String,
        locality: usize,
        message: String,
    },
    Unsupported {
        request: Request,
    },
    Closed,
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(error) => write!(f, "wire codec failure: {error}"),
            Self::UnknownObject { handle } => write!(f, "no object hosted at {handle}"),
            Self::AlreadyRegistered { name, locality } => {
                write!(f, "'{name}' is already registered for locality {locality}")
            }
            Self::NotRegistered { name, locality } => {
                write!(f, "'{name}' is not registered for locality {locality}")
            }
            Self::LocalityOutOfRange {
                locality,
                num_localities,
            } => write!(
                f,
                "locality {locality} out of range for {num_localities} localities"
            ),
            Self::ParticipantMismatch {
                tag,
                expected,
                found,
            } => write!(
                f,
                "collective '{tag}' expects {expected} participants, caller passed {found}"
            ),
            Self::DuplicateContribution {
                tag,
                generation,
                locality,
            } => write!(
                f,
                "locality {locality} contributed twice to '{tag}' generation {generation}"
            ),
            Self::CollectiveAborted {
                tag,
                locality,
                message,
            } => write!(
                f,
                "collective '{tag}' aborted by locality {locality}: {message}"
            ),
            Self::Unsupported { request } => write!(f, "request {request:?} is not served"),
            Self::Closed => write!(f, "fabric closed before the exchange completed"),
        }
    }
}

impl std::error::Error for FabricError {}

impl From<SerializeError> for FabricError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

/// Symbol directory plus message substrate shared by cooperating localities.
#[async_trait]
pub trait Fabric: fmt::Debug + Send + Sync {
    fn locality_id(&self) -> usize;

    fn num_localities(&self) -> usize;

    fn register(&self, name: &str, locality: usize, handle: Handle) -> Result<(), FabricError>;

    /// Suspends until `name` is registered for `locality`.
    async fn resolve(&self, name: &str, locality: usize) -> Result<Handle, FabricError>;

    fn unregister(&self, name: &str, locality: usize) -> Result<Handle, FabricError>;

    fn host(&self, object: Arc<dyn RemoteObject>) -> Handle;

    async fn send_rpc(&self, handle: Handle, request: Request) -> Result<Value, FabricError>;

    /// Contributes `local` to the round `(tag, generation)` and returns every
    /// participant's value ordered by locality. An `Err` from any participant
    /// fails the round for all of them.
    async fn collective_exchange(
        &self,
        tag: &str,
        generation: u64,
        local: Result<Value, String>,
        participants: usize,
    ) -> Result<Vec<Value>, FabricError>;
}

type RoundOutcome = Result<Vec<String>, (usize, String)>;

#[derive(Debug)]
struct Round {
    slots: Vec<Option<Result<String, String>>>,
    filled: usize,
    outcome: watch::Sender<Option<Arc<RoundOutcome>>>,
}

impl Round {
    fn new(participants: usize) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            slots: vec![None; participants],
            filled: 0,
            outcome,
        }
    }

    fn finish(&mut self) -> RoundOutcome {
        let mut payloads = Vec::with_capacity(self.slots.len());
        for (locality, slot) in self.slots.iter_mut().enumerate() {
            match slot.take() {
                Some(Ok(payload)) => payloads.push(payload),
                Some(Err(message)) => return Err((locality, message)),
                None => return Err((locality, "missing contribution".to_string())),
            }
        }
        Ok(payloads)
    }
}

#[derive(Debug)]
struct Hub {
    num_localities: usize,
    names: Mutex<HashMap<(String, usize), Handle>>,
    names_changed: watch::Sender<u64>,
    objects: Mutex<HashMap<Handle, Arc<dyn RemoteObject>>>,
    next_object: AtomicU64,
    rounds: Mutex<HashMap<(String, u64), Round>>,
}

/// Builds connected in-process fabrics, one per locality.
#[derive(Debug)]
pub struct InProcessWorld;

impl InProcessWorld {
    #[must_use]
    pub fn new(num_localities: usize) -> Vec<Arc<LocalFabric>> {
        let hub = Arc::new(Hub::new(num_localities));
        (0..num_localities)
            .map(|locality| {
                Arc::new(LocalFabric {
                    locality,
                    hub: Arc::clone(&hub),
                })
            })
            .collect()
    }
}

impl Hub {
    fn new(num_localities: usize) -> Self {
        let (names_changed, _) = watch::channel(0);
        Self {
            num_localities,
            names: Mutex::new(HashMap::new()),
            names_changed,
            objects: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(0),
            rounds: Mutex::new(HashMap::new()),
        }
    }
}

/// One locality's view of an [`InProcessWorld`]. Every payload is encoded and
/// decoded on the way through, so no storage is shared across localities.
#[derive(Debug)]
pub struct LocalFabric {
    locality: usize,
    hub: Arc<Hub>,
}

impl LocalFabric {
    /// Fabric for a single-locality world.
    #[must_use]
    pub fn single() -> Arc<Self> {
        Arc::new(Self {
            locality: 0,
            hub: Arc::new(Hub::new(1)),
        })
    }

    fn check_locality(&self, locality: usize) -> Result<(), FabricError> {
        if locality >= self.hub.num_localities {
            return Err(FabricError::LocalityOutOfRange {
                locality,
                num_localities: self.hub.num_localities,
            });
        }
        Ok(())
    }
}

fn round_trip(value: &Value) -> Result<Value, FabricError> {
    let encoded = encode_value(value)?;
    Ok(decode_value(&encoded)?)
}

#[async_trait]
impl Fabric for LocalFabric {
    fn locality_id(&self) -> usize {
        self.locality
    }

    fn num_localities(&self) -> usize {
        self.hub.num_localities
    }

    fn register(&self, name: &str, locality: usize, handle: Handle) -> Result<(), FabricError> {
        self.check_locality(locality)?;
        {
            let mut names = lock(&self.hub.names);
            let key = (name.to_string(), locality);
            if names.contains_key(&key) {
                return Err(FabricError::AlreadyRegistered {
                    name: name.to_string(),
                    locality,
                });
            }
            names.insert(key, handle);
        }
        self.hub.names_changed.send_modify(|version| *version += 1);
        tracing::debug!(name, locality, %handle, "registered name");
        Ok(())
    }

    async fn resolve(&self, name: &str, locality: usize) -> Result<Handle, FabricError> {
        self.check_locality(locality)?;
        let mut changes = self.hub.names_changed.subscribe();
        let key = (name.to_string(), locality);
        loop {
            if let Some(handle) = lock(&self.hub.names).get(&key).copied() {
                tracing::trace!(name, locality, %handle, "resolved name");
                return Ok(handle);
            }
            changes.changed().await.map_err(|_| FabricError::Closed)?;
        }
    }

    fn unregister(&self, name: &str, locality: usize) -> Result<Handle, FabricError> {
        let handle = lock(&self.hub.names)
            .remove(&(name.to_string(), locality))
            .ok_or_else(|| FabricError::NotRegistered {
                name: name.to_string(),
                locality,
            })?;
        lock(&self.hub.objects).remove(&handle);
        tracing::debug!(name, locality, %handle, "unregistered name");
        Ok(handle)
    }

    fn host(&self, object: Arc<dyn RemoteObject>) -> Handle {
        let handle = Handle {
            locality: self.locality,
            object: self.hub.next_object.fetch_add(1, Ordering::Relaxed),
        };
        lock(&self.hub.objects).insert(handle, object);
        handle
    }

    async fn send_rpc(&self, handle: Handle, request: Request) -> Result<Value, FabricError> {
        let object = lock(&self.hub.objects)
            .get(&handle)
            .cloned()
            .ok_or(FabricError::UnknownObject { handle })?;
        tracing::trace!(from = self.locality, to = %handle, ?request, "rpc");
        let response = object.serve(request)?;
        round_trip(&response)
    }

    async fn collective_exchange(
        &self,
        tag: &str,
        generation: u64,
        local: Result<Value, String>,
        participants: usize,
    ) -> Result<Vec<Value>, FabricError> {
        if participants != self.hub.num_localities || self.locality >= participants {
            return Err(FabricError::ParticipantMismatch {
                tag: tag.to_string(),
                expected: self.hub.num_localities,
                found: participants,
            });
        }
        let contribution = match local {
            Ok(value) => match encode_value(&value) {
                Ok(encoded) => Ok(encoded),
                Err(error) => Err(error.to_string()),
            },
            Err(message) => Err(message),
        };

        let mut receiver = {
            let mut rounds = lock(&self.hub.rounds);
            let key = (tag.to_string(), generation);
            let round = rounds
                .entry(key.clone())
                .or_insert_with(|| Round::new(participants));
            let slot = &mut round.slots[self.locality];
            if slot.is_some() {
                return Err(FabricError::DuplicateContribution {
                    tag: tag.to_string(),
                    generation,
                    locality: self.locality,
                });
            }
            *slot = Some(contribution);
            round.filled += 1;
            let receiver = round.outcome.subscribe();
            if round.filled == participants {
                if let Some(mut round) = rounds.remove(&key) {
                    let outcome = round.finish();
                    round.outcome.send_replace(Some(Arc::new(outcome)));
                }
            }
            receiver
        };
        tracing::trace!(tag, generation, locality = self.locality, "collective contribution");

        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FabricError::Closed)?
            .clone();
        let Some(outcome) = outcome else {
            return Err(FabricError::Closed);
        };
        match outcome.as_ref() {
            Ok(payloads) => payloads
                .iter()
                .map(|payload| decode_value(payload).map_err(FabricError::from))
                .collect(),
            Err((locality, message)) => {
                tracing::warn!(tag, generation, failed = locality, %message, "collective aborted");
                Err(FabricError::CollectiveAborted {
                    tag: tag.to_string(),
                    locality: *locality,
                    message: message.clone(),
                })
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
