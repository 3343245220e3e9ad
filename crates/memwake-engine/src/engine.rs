//! Contracts for the isolated execution environment and its single-slot cache.

use std::{fmt, sync::Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{error::Result, messenger::Messenger};

/// Library + function name of the one function an engine runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entrypoint {
    pub library: String,
    pub name: String,
}

impl Entrypoint {
    pub fn new(library: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.library, self.name)
    }
}

/// Process-wide preparation that must finish before any engine is created.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    fn is_initialized(&self) -> bool;

    /// Kick off initialization. Idempotent.
    fn start_initialization(&self);

    /// Resolve once initialization has finished, or with its failure.
    async fn ensure_initialization_complete(&self) -> Result<()>;
}

/// One provisioned execution environment.
#[async_trait]
pub trait Engine: Send + Sync {
    /// The channel table host bridges are registered on.
    fn messenger(&self) -> &Messenger;

    /// Start `entrypoint` with this engine's messenger. Returns once the entry
    /// point has been launched, not when it finishes.
    fn execute_entrypoint(&mut self, entrypoint: &Entrypoint) -> Result<()>;

    /// Stop whatever is still running and release the engine.
    async fn destroy(&mut self) -> Result<()>;
}

pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Engine>>;
}

/// The single cache slot a lifecycle manager provisions engines into.
///
/// Each occupant is tagged with the id of the session that put it there, so a
/// stale session can never evict its successor's engine.
pub struct EngineSlot {
    key: String,
    occupant: Mutex<Option<(Uuid, Box<dyn Engine>)>>,
}

impl EngineSlot {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            occupant: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant.lock().unwrap().is_some()
    }

    /// Id of the session currently holding the slot.
    pub fn owner(&self) -> Option<Uuid> {
        self.occupant.lock().unwrap().as_ref().map(|(id, _)| *id)
    }

    /// Store `engine` for `owner`. Returns whatever was displaced.
    pub fn put(&self, owner: Uuid, engine: Box<dyn Engine>) -> Option<Box<dyn Engine>> {
        self.occupant
            .lock()
            .unwrap()
            .replace((owner, engine))
            .map(|(_, old)| old)
    }

    /// Run `f` against the engine if `owner` holds the slot.
    pub fn with_engine<T>(&self, owner: Uuid, f: impl FnOnce(&mut dyn Engine) -> T) -> Option<T> {
        let mut guard = self.occupant.lock().unwrap();
        match guard.as_mut() {
            Some((id, engine)) if *id == owner => Some(f(engine.as_mut())),
            _ => None,
        }
    }

    /// Remove and return the engine if `owner` holds the slot.
    pub fn take(&self, owner: Uuid) -> Option<Box<dyn Engine>> {
        let mut guard = self.occupant.lock().unwrap();
        match guard.as_ref() {
            Some((id, _)) if *id == owner => guard.take().map(|(_, engine)| engine),
            _ => None,
        }
    }
}

impl fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSlot")
            .field("key", &self.key)
            .field("owner", &self.owner())
            .finish()
    }
}
