//! Engine Lifecycle Manager.
//!
//! Each queue firing gets an [`EngineSession`] that walks
//! `Idle → Provisioning → Running → Completing → Terminated`:
//!
//! 1. make sure the engine loader is initialized (bounded wait),
//! 2. create an engine, park it in the manager's [`EngineSlot`], attach the
//!    [`BridgeSet`] and the completion bridge, invoke the entry point,
//! 3. wait for the first of `close` (from inside the engine) or an external
//!    stop,
//! 4. detach bridges, destroy the engine, clear the slot, re-arm the schedule
//!    and resolve the handle with `Success`.
//!
//! Loader and provisioning failures end in `Failed` instead and resolve with
//! `Retry`, leaving the queue row in place for its backoff.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use memwake_core::config::ENGINE_CACHE_KEY;
use memwake_scheduler::{
    completion_pair, Rescheduler, WorkCompleter, WorkHandle, WorkOutcome, Worker, WorkerFactory,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    bridge::BridgeSet,
    completion::{CompletionBridge, CompletionSignal, Trigger, BG_HOST_CHANNEL},
    engine::{EngineFactory, EngineLoader, EngineSlot, Entrypoint},
    error::{LifecycleError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Provisioning,
    Running,
    Completing,
    Terminated,
    /// Provisioning did not complete; the handle resolved with `Retry`.
    Failed,
}

impl LifecycleState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

struct Shared {
    loader: Arc<dyn EngineLoader>,
    factory: Arc<dyn EngineFactory>,
    bridges: BridgeSet,
    rescheduler: Arc<dyn Rescheduler>,
    entrypoint: Entrypoint,
    init_timeout: Duration,
    slot: EngineSlot,
}

/// Owns the engine slot and everything a session needs to provision into it.
#[derive(Clone)]
pub struct LifecycleManager {
    shared: Arc<Shared>,
}

impl LifecycleManager {
    pub fn new(
        loader: Arc<dyn EngineLoader>,
        factory: Arc<dyn EngineFactory>,
        bridges: BridgeSet,
        rescheduler: Arc<dyn Rescheduler>,
        entrypoint: Entrypoint,
        init_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader,
                factory,
                bridges,
                rescheduler,
                entrypoint,
                init_timeout,
                slot: EngineSlot::new(ENGINE_CACHE_KEY),
            }),
        }
    }

    pub fn slot(&self) -> &EngineSlot {
        &self.shared.slot
    }

    /// A new, not yet started session for the job `name`.
    pub fn session(&self, name: &str) -> Arc<EngineSession> {
        Arc::new(EngineSession::new(name, Arc::clone(&self.shared)))
    }
}

impl WorkerFactory for LifecycleManager {
    fn create(&self, name: &str) -> Arc<dyn Worker> {
        self.session(name)
    }
}

/// How the loader wait ended when it did not fail.
enum LoaderWait {
    Ready,
    Stopped(Trigger),
}

/// One execution: at most one engine, one completion, one teardown.
pub struct EngineSession {
    id: Uuid,
    name: String,
    shared: Arc<Shared>,
    state: watch::Sender<LifecycleState>,
    completer: WorkCompleter,
    signal: CompletionSignal,
    pending: Mutex<Option<(WorkHandle, mpsc::UnboundedReceiver<Trigger>)>>,
}

impl EngineSession {
    fn new(name: &str, shared: Arc<Shared>) -> Self {
        let (completer, handle) = completion_pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            shared,
            state,
            signal: CompletionSignal::new(completer.clone(), tx),
            completer,
            pending: Mutex::new(Some((handle, rx))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        debug!(name = %self.name, session = %self.id, %prev, %next, "lifecycle transition");
    }

    async fn run(self: Arc<Self>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        info!(name = %self.name, session = %self.id, "engine session starting");
        self.set_state(LifecycleState::Provisioning);

        match self.ensure_loader(&mut triggers).await {
            Ok(LoaderWait::Ready) => {}
            Ok(LoaderWait::Stopped(trigger)) => {
                info!(name = %self.name, ?trigger, "stopped before the engine was provisioned");
                self.set_state(LifecycleState::Completing);
                self.terminate();
                return;
            }
            Err(e) => return self.fail(e),
        }

        if let Err(e) = self.provision().await {
            self.teardown().await;
            return self.fail(e);
        }
        self.set_state(LifecycleState::Running);

        // The signal holds a sender for as long as the session lives.
        let trigger = triggers.recv().await.unwrap_or(Trigger::Stop);
        info!(name = %self.name, ?trigger, "engine session completing");
        self.set_state(LifecycleState::Completing);

        self.teardown().await;
        self.terminate();
    }

    async fn ensure_loader(
        &self,
        triggers: &mut mpsc::UnboundedReceiver<Trigger>,
    ) -> Result<LoaderWait> {
        let loader = &self.shared.loader;
        if loader.is_initialized() {
            return Ok(LoaderWait::Ready);
        }

        info!(name = %self.name, "engine loader not initialized; waiting");
        loader.start_initialization();
        let limit = self.shared.init_timeout;
        tokio::select! {
            res = tokio::time::timeout(limit, loader.ensure_initialization_complete()) => match res {
                Ok(r) => r.map(|()| LoaderWait::Ready),
                Err(_) => Err(LifecycleError::InitTimeout {
                    ms: limit.as_millis() as u64,
                }),
            },
            Some(trigger) = triggers.recv() => Ok(LoaderWait::Stopped(trigger)),
        }
    }

    /// Create the engine, wire it up and launch the entry point.
    ///
    /// The completion bridge is attached before the entry point runs so an
    /// immediate `close` always has a receiver. An engine still parked in the
    /// slot is destroyed first; its session then finds the slot taken and has
    /// nothing left to tear down.
    async fn provision(&self) -> Result<()> {
        let engine = self.shared.factory.create()?;
        let messenger = engine.messenger().clone();

        if let Some(mut displaced) = self.shared.slot.put(self.id, engine) {
            warn!(
                key = %self.shared.slot.key(),
                "engine slot was still occupied; destroying previous engine"
            );
            displaced.messenger().remove_handler(BG_HOST_CHANNEL);
            if let Err(e) = displaced.destroy().await {
                warn!(name = %self.name, "displaced engine teardown failed: {e}");
            }
        }

        self.shared.bridges.register_all(&messenger);
        messenger.set_handler(
            BG_HOST_CHANNEL,
            Arc::new(CompletionBridge::new(self.signal.clone())),
        );

        let entrypoint = &self.shared.entrypoint;
        self.shared
            .slot
            .with_engine(self.id, |engine| engine.execute_entrypoint(entrypoint))
            .unwrap_or_else(|| {
                Err(LifecycleError::Provision(format!(
                    "engine slot {} lost before entry point launch",
                    self.shared.slot.key()
                )))
            })?;

        info!(name = %self.name, %entrypoint, "entry point invoked");
        Ok(())
    }

    /// Best-effort release of everything this session attached.
    async fn teardown(&self) {
        self.shared.bridges.detach_all();

        let Some(mut engine) = self.shared.slot.take(self.id) else {
            debug!(name = %self.name, "no engine to destroy");
            return;
        };
        engine.messenger().remove_handler(BG_HOST_CHANNEL);
        if let Err(e) = engine.destroy().await {
            warn!(name = %self.name, "engine teardown failed: {e}");
        }
    }

    /// Re-arm the schedule and resolve the handle with `Success`.
    fn terminate(&self) {
        if let Err(e) = self.shared.rescheduler.reschedule_next() {
            error!(name = %self.name, "failed to re-arm schedule: {e}");
        }
        self.set_state(LifecycleState::Terminated);
        self.completer.claim();
        self.completer.resolve(WorkOutcome::Success);
        info!(name = %self.name, session = %self.id, "engine session terminated");
    }

    fn fail(&self, err: LifecycleError) {
        error!(name = %self.name, session = %self.id, "engine session failed: {err}");
        self.completer.claim();
        self.set_state(LifecycleState::Failed);
        self.completer.resolve(WorkOutcome::Retry {
            reason: err.to_string(),
        });
    }
}

impl Worker for EngineSession {
    fn start_work(self: Arc<Self>) -> WorkHandle {
        let pending = self.pending.lock().unwrap().take();
        let Some((handle, triggers)) = pending else {
            warn!(name = %self.name, session = %self.id, "session already started");
            // Completer dropped: resolves as Retry without touching this run.
            let (_, handle) = completion_pair();
            return handle;
        };
        tokio::spawn(Arc::clone(&self).run(triggers));
        handle
    }

    fn on_stopped(&self) {
        self.signal.fire(Trigger::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        completion::BgHostClient,
        error::BridgeError,
        local::{EntrypointRegistry, LocalEngineFactory, LocalLoader},
        messenger::{MessageHandler, Messenger},
    };
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use memwake_scheduler::SchedulerError;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingRescheduler {
        calls: AtomicU32,
        fail: bool,
    }

    impl Rescheduler for CountingRescheduler {
        fn reschedule_next(&self) -> memwake_scheduler::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SchedulerError::Rejected {
                    name: "slot".into(),
                    reason: "queue unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullBridge {
        detached: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for NullBridge {
        async fn handle(&self, _method: &str, _args: Value) -> std::result::Result<Value, BridgeError> {
            Ok(Value::Null)
        }

        fn detach(&self) -> std::result::Result<(), BridgeError> {
            self.detached.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bridges(shared: &Arc<NullBridge>) -> BridgeSet {
        BridgeSet {
            sync: shared.clone(),
            thumbnail: shared.clone(),
            connectivity: shared.clone(),
            lock: shared.clone(),
            foreground_host: shared.clone(),
        }
    }

    fn ep() -> Entrypoint {
        Entrypoint::new("test", "worker")
    }

    struct Harness {
        manager: LifecycleManager,
        rescheduler: Arc<CountingRescheduler>,
        bridge: Arc<NullBridge>,
        messengers: mpsc::UnboundedReceiver<Messenger>,
    }

    /// The registered entry point hands its messenger to the test and idles.
    fn harness(loader: LocalLoader, rescheduler: CountingRescheduler) -> Harness {
        let registry = EntrypointRegistry::new();
        let (tx, messengers) = mpsc::unbounded_channel();
        registry.register(ep(), move |m: Messenger| {
            let _ = tx.send(m);
            futures_util::future::pending::<()>().boxed()
        });
        let rescheduler = Arc::new(rescheduler);
        let bridge = Arc::new(NullBridge::default());
        let manager = LifecycleManager::new(
            Arc::new(loader),
            Arc::new(LocalEngineFactory::new(registry)),
            bridges(&bridge),
            rescheduler.clone(),
            ep(),
            Duration::from_millis(200),
        );
        Harness {
            manager,
            rescheduler,
            bridge,
            messengers,
        }
    }

    fn ready_loader() -> LocalLoader {
        let loader = LocalLoader::new();
        loader.start_initialization();
        loader
    }

    async fn wait_state(session: &EngineSession, want: LifecycleState) {
        let mut rx = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn close_terminates_and_rearms_once() {
        let mut h = harness(ready_loader(), CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();

        let messenger = h.messengers.recv().await.unwrap();
        wait_state(&session, LifecycleState::Running).await;
        assert!(h.manager.slot().is_occupied());
        for channel in BridgeSet::CHANNELS {
            assert!(messenger.has_handler(channel));
        }

        let client = BgHostClient::new(messenger.clone());
        client.on_initialized().await.unwrap();
        client.close().await.unwrap();
        // Either ignored by the latch or rejected once teardown has run.
        let _ = client.close().await;

        assert_eq!(handle.await, WorkOutcome::Success);
        assert_eq!(session.state(), LifecycleState::Terminated);
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.bridge.detached.load(Ordering::SeqCst), 5);
        assert!(!h.manager.slot().is_occupied());
        assert!(messenger.channels().is_empty());
    }

    #[tokio::test]
    async fn stop_before_close_then_late_close_is_ignored() {
        let mut h = harness(ready_loader(), CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();
        let messenger = h.messengers.recv().await.unwrap();
        let client = BgHostClient::new(messenger);

        session.on_stopped();
        session.on_stopped();
        assert_eq!(handle.await, WorkOutcome::Success);

        // Teardown cleared the channel table, so the late close goes nowhere.
        assert!(client.close().await.is_err());
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.bridge.detached.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn uninitialized_loader_defers_entrypoint() {
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let go_rx = Arc::new(tokio::sync::Mutex::new(Some(go_rx)));
        let loader = LocalLoader::with_init(move || {
            let go_rx = Arc::clone(&go_rx);
            async move {
                if let Some(rx) = go_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(())
            }
            .boxed()
        });
        let mut h = harness(loader, CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();

        wait_state(&session, LifecycleState::Provisioning).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.messengers.try_recv().is_err());
        assert!(!h.manager.slot().is_occupied());

        go_tx.send(()).unwrap();
        let messenger = h.messengers.recv().await.unwrap();
        BgHostClient::new(messenger).close().await.unwrap();
        assert_eq!(handle.await, WorkOutcome::Success);
    }

    #[tokio::test]
    async fn stop_during_loader_wait_skips_provisioning() {
        let loader =
            LocalLoader::with_init(|| futures_util::future::pending::<std::result::Result<(), String>>().boxed());
        let mut h = harness(loader, CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();

        wait_state(&session, LifecycleState::Provisioning).await;
        session.on_stopped();
        assert_eq!(handle.await, WorkOutcome::Success);
        assert_eq!(session.state(), LifecycleState::Terminated);
        assert!(h.messengers.try_recv().is_err());
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_timeout_resolves_retry_without_rearm() {
        let loader =
            LocalLoader::with_init(|| futures_util::future::pending::<std::result::Result<(), String>>().boxed());
        let h = harness(loader, CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();

        match handle.await {
            WorkOutcome::Retry { reason } => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(session.state(), LifecycleState::Failed);
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 0);

        // A stop after failure is a no-op.
        session.on_stopped();
        assert_eq!(session.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn missing_entrypoint_tears_down_and_retries() {
        let rescheduler = Arc::new(CountingRescheduler::default());
        let bridge = Arc::new(NullBridge::default());
        let manager = LifecycleManager::new(
            Arc::new(ready_loader()),
            Arc::new(LocalEngineFactory::new(EntrypointRegistry::new())),
            bridges(&bridge),
            rescheduler.clone(),
            ep(),
            Duration::from_millis(200),
        );
        let session = manager.session("memwake/test");
        let outcome = Arc::clone(&session).start_work().await;

        assert!(matches!(outcome, WorkOutcome::Retry { .. }));
        assert_eq!(session.state(), LifecycleState::Failed);
        assert!(!manager.slot().is_occupied());
        assert_eq!(bridge.detached.load(Ordering::SeqCst), 5);
        assert_eq!(rescheduler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rearm_failure_still_resolves_success() {
        let mut h = harness(
            ready_loader(),
            CountingRescheduler {
                fail: true,
                ..Default::default()
            },
        );
        let session = h.manager.session("memwake/test");
        let handle = Arc::clone(&session).start_work();
        let messenger = h.messengers.recv().await.unwrap();
        BgHostClient::new(messenger).close().await.unwrap();

        assert_eq!(handle.await, WorkOutcome::Success);
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_start_resolves_retry() {
        let mut h = harness(ready_loader(), CountingRescheduler::default());
        let session = h.manager.session("memwake/test");
        let first = Arc::clone(&session).start_work();
        let second = Arc::clone(&session).start_work();
        assert!(matches!(second.await, WorkOutcome::Retry { .. }));

        h.messengers.recv().await.unwrap();
        session.on_stopped();
        assert_eq!(first.await, WorkOutcome::Success);
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 1);
    }

    struct DropCount(Arc<AtomicU32>);

    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn displaced_engine_is_destroyed() {
        let dropped = Arc::new(AtomicU32::new(0));
        let registry = EntrypointRegistry::new();
        let (tx, mut messengers) = mpsc::unbounded_channel();
        let counter = Arc::clone(&dropped);
        registry.register(ep(), move |m: Messenger| {
            let _ = tx.send(m);
            let guard = DropCount(Arc::clone(&counter));
            async move {
                let _guard = guard;
                futures_util::future::pending::<()>().await
            }
            .boxed()
        });
        let manager = LifecycleManager::new(
            Arc::new(ready_loader()),
            Arc::new(LocalEngineFactory::new(registry)),
            bridges(&Arc::new(NullBridge::default())),
            Arc::new(CountingRescheduler::default()),
            ep(),
            Duration::from_millis(200),
        );

        let first = manager.session("memwake/slot_1");
        let first_handle = Arc::clone(&first).start_work();
        let first_messenger = messengers.recv().await.unwrap();
        wait_state(&first, LifecycleState::Running).await;

        // Provisioned over a still-running session.
        let second = manager.session("memwake/slot_2");
        let second_handle = Arc::clone(&second).start_work();
        messengers.recv().await.unwrap();
        wait_state(&second, LifecycleState::Running).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(manager.slot().owner(), Some(second.id()));
        assert!(first_messenger.channels().is_empty());

        // The displaced session settles without touching its successor's engine.
        first.on_stopped();
        assert_eq!(first_handle.await, WorkOutcome::Success);
        assert_eq!(manager.slot().owner(), Some(second.id()));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        second.on_stopped();
        assert_eq!(second_handle.await, WorkOutcome::Success);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert!(!manager.slot().is_occupied());
    }

    #[tokio::test]
    async fn sessions_share_one_slot() {
        let mut h = harness(ready_loader(), CountingRescheduler::default());
        for _ in 0..3 {
            let session = h.manager.session("memwake/test");
            let handle = Arc::clone(&session).start_work();
            h.messengers.recv().await.unwrap();
            assert_eq!(h.manager.slot().owner(), Some(session.id()));
            session.on_stopped();
            assert_eq!(handle.await, WorkOutcome::Success);
            assert!(!h.manager.slot().is_occupied());
        }
        assert_eq!(h.rescheduler.calls.load(Ordering::SeqCst), 3);
    }
}
