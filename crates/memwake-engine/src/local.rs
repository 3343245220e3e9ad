//! In-process engine: entry points are async functions looked up by name and
//! run on their own tokio task.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    engine::{Engine, EngineFactory, EngineLoader, Entrypoint},
    error::{LifecycleError, Result},
    messenger::Messenger,
};

/// An entry point body. Receives the engine's messenger as its only context.
pub type EntrypointFn = Arc<dyn Fn(Messenger) -> BoxFuture<'static, ()> + Send + Sync>;

/// Optional one-time setup run by [`LocalLoader`].
pub type InitFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Name → entry point lookup shared by every engine a factory creates.
#[derive(Clone, Default)]
pub struct EntrypointRegistry {
    entries: Arc<DashMap<Entrypoint, EntrypointFn>>,
}

impl EntrypointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, entrypoint: Entrypoint, f: F)
    where
        F: Fn(Messenger) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        debug!(%entrypoint, "entry point registered");
        self.entries.insert(entrypoint, Arc::new(f));
    }

    pub fn get(&self, entrypoint: &Entrypoint) -> Option<EntrypointFn> {
        self.entries.get(entrypoint).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, entrypoint: &Entrypoint) -> bool {
        self.entries.contains_key(entrypoint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoaderState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

/// Loader whose initialization is an optional async hook.
pub struct LocalLoader {
    state: Arc<watch::Sender<LoaderState>>,
    init: Option<InitFn>,
}

impl Default for LocalLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLoader {
    /// Loader with nothing to prepare: becomes ready as soon as it is started.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LoaderState::Uninitialized);
        Self {
            state: Arc::new(tx),
            init: None,
        }
    }

    pub fn with_init<F>(f: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync + 'static,
    {
        Self {
            init: Some(Arc::new(f)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl EngineLoader for LocalLoader {
    fn is_initialized(&self) -> bool {
        *self.state.borrow() == LoaderState::Ready
    }

    fn start_initialization(&self) {
        let started = self.state.send_if_modified(|s| {
            if matches!(s, LoaderState::Uninitialized | LoaderState::Failed(_)) {
                *s = LoaderState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let Some(init) = self.init.clone() else {
            self.state.send_replace(LoaderState::Ready);
            return;
        };
        info!("engine loader initializing");
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let next = match init().await {
                Ok(()) => {
                    info!("engine loader ready");
                    LoaderState::Ready
                }
                Err(reason) => {
                    warn!("engine loader failed: {reason}");
                    LoaderState::Failed(reason)
                }
            };
            state.send_replace(next);
        });
    }

    async fn ensure_initialization_complete(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| *s != LoaderState::Initializing)
            .await
            .map(|s| s.clone())
            .map_err(|_| LifecycleError::InitFailed("loader state closed".to_string()))?;

        match settled {
            LoaderState::Ready => Ok(()),
            LoaderState::Failed(reason) => Err(LifecycleError::InitFailed(reason)),
            LoaderState::Uninitialized | LoaderState::Initializing => {
                Err(LifecycleError::LoaderNotStarted)
            }
        }
    }
}

/// Engine that runs its entry point as a tokio task.
pub struct LocalEngine {
    messenger: Messenger,
    registry: EntrypointRegistry,
    task: Option<JoinHandle<()>>,
}

impl LocalEngine {
    pub fn new(registry: EntrypointRegistry) -> Self {
        Self {
            messenger: Messenger::new(),
            registry,
            task: None,
        }
    }
}

#[async_trait]
impl Engine for LocalEngine {
    fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    fn execute_entrypoint(&mut self, entrypoint: &Entrypoint) -> Result<()> {
        if self.task.is_some() {
            return Err(LifecycleError::EntrypointAlreadyRunning);
        }
        let f = self
            .registry
            .get(entrypoint)
            .ok_or_else(|| LifecycleError::EntrypointNotFound {
                library: entrypoint.library.clone(),
                name: entrypoint.name.clone(),
            })?;
        debug!(%entrypoint, "launching entry point");
        self.task = Some(tokio::spawn(f(self.messenger.clone())));
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let joined = match self.task.take() {
            Some(task) => {
                task.abort();
                task.await
            }
            None => Ok(()),
        };
        self.messenger.clear();

        match joined {
            Err(e) if e.is_panic() => Err(LifecycleError::Teardown(format!(
                "entry point panicked: {e}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Creates a fresh [`LocalEngine`] per provisioning.
#[derive(Clone)]
pub struct LocalEngineFactory {
    registry: EntrypointRegistry,
}

impl LocalEngineFactory {
    pub fn new(registry: EntrypointRegistry) -> Self {
        Self { registry }
    }
}

impl EngineFactory for LocalEngineFactory {
    fn create(&self) -> Result<Box<dyn Engine>> {
        Ok(Box::new(LocalEngine::new(self.registry.clone())))
    }
}
