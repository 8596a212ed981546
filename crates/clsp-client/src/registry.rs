//! C8 — IOV Registry: the process-wide session map, grounded directly on
//! `devolutions-gateway/src/session.rs`'s `SessionManagerTask` actor pattern
//! — a single task owns `sessions`/`pendingRemoval`, driven by an mpsc
//! message channel with oneshot reply channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use clsp_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};
use tokio::sync::{mpsc, oneshot};

use crate::conduit::{ConduitConnector, MqttConduitConnector};
use crate::config::{GlobalConfig, StreamConfiguration};
use crate::error::ClspError;
use crate::event_bus::{EventBus, EventKind, SessionEvent};
use crate::id::{SessionId, SessionIdAllocator};
use crate::session::{ChangeSrcTarget, IovSession};
use crate::surface::{DomCollaborator, SurfaceConfig};

/// Events that trigger retry supervision (spec.md §4.8, §7 "Fatal for a session").
const FATAL_KINDS: &[EventKind] = &[
    EventKind::IframeDestroyedExternally,
    EventKind::ReinitializeError,
    EventKind::NoStreamConfiguration,
    EventKind::RetryError,
];

/// Bounded retry policy (REDESIGN FLAG, spec.md §9 "Retry supervision"):
/// at most `MAX_ATTEMPTS` replacement sessions per logical stream name within
/// a rolling `WINDOW`.
const MAX_ATTEMPTS: u32 = 5;
const WINDOW: Duration = Duration::from_secs(60);

const REGISTRY_ALLOWED_EVENTS: &[EventKind] = &[EventKind::RetryBudgetExhausted];

struct RetryBudget {
    backoff: backoff::ExponentialBackoff,
    attempts: u32,
    window_start: Instant,
}

impl RetryBudget {
    fn fresh() -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(None)
            .build();
        Self {
            backoff,
            attempts: 0,
            window_start: Instant::now(),
        }
    }
}

enum RegistryMessage {
    Create {
        config: SurfaceConfig,
        reply: oneshot::Sender<Result<SessionId, ClspError>>,
    },
    Has {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        id: SessionId,
        reply: oneshot::Sender<Option<Arc<IovSession>>>,
    },
    Remove {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    /// Internal: a session emitted a fatal event (spec.md §4.8 retry supervision).
    SessionFaulted {
        id: SessionId,
    },
    /// Internal: the detached backoff timer for a faulted session has
    /// elapsed; create the replacement and resume its target.
    ResumeFaultRecovery {
        surface_config: SurfaceConfig,
        target: StreamConfiguration,
    },
}

/// A cheap, cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryMessage>,
    bus: Arc<parking_lot::Mutex<EventBus>>,
}

impl RegistryHandle {
    pub async fn create(&self, config: SurfaceConfig) -> Result<SessionId, ClspError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMessage::Create { config, reply })
            .await
            .map_err(|_| ClspError::UnsupportedEnvironment("registry task is gone".to_owned()))?;
        rx.await.map_err(|_| ClspError::UnsupportedEnvironment("registry task is gone".to_owned()))?
    }

    pub async fn has(&self, id: SessionId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMessage::Has { id, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<IovSession>> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMessage::Get { id, reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, id: SessionId) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMessage::Remove { id, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryMessage::Destroy { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bus.lock().subscribe(kind, handler)
    }
}

struct RegistryTask {
    rx: mpsc::Receiver<RegistryMessage>,
    self_tx: mpsc::Sender<RegistryMessage>,
    bus: Arc<parking_lot::Mutex<EventBus>>,
    collaborator: Arc<dyn DomCollaborator>,
    global_config: GlobalConfig,
    connector: Arc<dyn ConduitConnector>,
    ids: SessionIdAllocator,
    sessions: HashMap<SessionId, Arc<IovSession>>,
    pending_removal: HashSet<SessionId>,
    surface_configs: HashMap<SessionId, SurfaceConfig>,
    retry_budgets: HashMap<String, RetryBudget>,
    destroyed: bool,
}

impl RegistryTask {
    async fn dispatch(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Create { config, reply } => {
                let _ = reply.send(self.handle_create(config));
            }
            RegistryMessage::Has { id, reply } => {
                let _ = reply.send(self.handle_has(id));
            }
            RegistryMessage::Get { id, reply } => {
                let _ = reply.send(self.handle_get(id));
            }
            RegistryMessage::Remove { id, reply } => {
                self.handle_remove(id).await;
                let _ = reply.send(());
            }
            RegistryMessage::Destroy { reply } => {
                self.handle_destroy().await;
                let _ = reply.send(());
            }
            RegistryMessage::SessionFaulted { id } => {
                self.handle_session_faulted(id).await;
            }
            RegistryMessage::ResumeFaultRecovery { surface_config, target } => {
                self.handle_resume_fault_recovery(surface_config, target).await;
            }
        }
    }

    fn handle_create(&mut self, config: SurfaceConfig) -> Result<SessionId, ClspError> {
        if self.destroyed {
            return Err(ClspError::AlreadyDestroyed);
        }

        let id = self.ids.allocate();
        let session = IovSession::new_with_connector(
            id,
            Arc::clone(&self.collaborator),
            self.global_config.show_next_video_delay,
            self.global_config.connection_change_play_delay,
            Arc::clone(&self.connector),
        );
        session.initialize_elements(config.clone())?;

        for &kind in FATAL_KINDS {
            let self_tx = self.self_tx.clone();
            session
                .on(kind, move |_| {
                    if let Err(error) = self_tx.try_send(RegistryMessage::SessionFaulted { id }) {
                        tracing::warn!(session = %id, %error, "failed to notify registry of fatal session event");
                    }
                    Ok(())
                })
                .expect("kind is drawn from the session's own whitelist");
        }

        self.sessions.insert(id, session);
        self.surface_configs.insert(id, config);
        tracing::debug!(session = %id, "session created");
        Ok(id)
    }

    fn handle_has(&self, id: SessionId) -> bool {
        !self.pending_removal.contains(&id) && self.sessions.contains_key(&id)
    }

    fn handle_get(&self, id: SessionId) -> Option<Arc<IovSession>> {
        if self.pending_removal.contains(&id) {
            return None;
        }
        self.sessions.get(&id).cloned()
    }

    /// Idempotent: removing an already-pending or unknown id is a no-op (L3).
    async fn handle_remove(&mut self, id: SessionId) {
        if self.pending_removal.contains(&id) {
            return;
        }
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        self.pending_removal.insert(id);
        if let Err(error) = session.destroy().await {
            tracing::warn!(session = %id, %error, "error destroying session during removal");
        }
        self.surface_configs.remove(&id);
        self.pending_removal.remove(&id);
        tracing::debug!(session = %id, "session removed");
    }

    async fn handle_destroy(&mut self) {
        self.destroyed = true;
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.handle_remove(id).await;
        }
        self.bus.lock().remove_all_listeners();
    }

    /// Retry supervision (spec.md §4.8): remove the faulted session, then
    /// create a replacement bound to the same surface config and resume the
    /// captured target — bounded by a rolling attempt budget per logical
    /// stream name (spec.md §9 REDESIGN FLAG).
    async fn handle_session_faulted(&mut self, id: SessionId) {
        if !self.handle_has(id) {
            return;
        }
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let Some(target) = session.last_target() else {
            tracing::warn!(session = %id, "fatal event with no recoverable target, removing without retry");
            self.handle_remove(id).await;
            return;
        };
        let surface_config = self.surface_configs.get(&id).cloned().unwrap_or_default();

        self.handle_remove(id).await;

        let stream_key = target.stream_name().to_owned();
        let budget = self.retry_budgets.entry(stream_key.clone()).or_insert_with(RetryBudget::fresh);
        if budget.window_start.elapsed() > WINDOW {
            *budget = RetryBudget::fresh();
        }
        budget.attempts += 1;

        if budget.attempts > MAX_ATTEMPTS {
            tracing::error!(stream = %stream_key, "retry budget exhausted, giving up on this stream");
            self.bus.lock().emit(SessionEvent::RetryBudgetExhausted);
            return;
        }

        let delay = budget.backoff.next_backoff();
        let self_tx = self.self_tx.clone();

        // The backoff wait runs off the actor loop, on a detached task that
        // re-enters through `self_tx`, so a fault on one stream never blocks
        // unrelated sessions' create/has/get/remove calls for the backoff
        // window (spec.md §5: sessions are independent).
        ChildTask::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let _ = self_tx.send(RegistryMessage::ResumeFaultRecovery { surface_config, target }).await;
        })
        .detach();
    }

    /// Continuation of [`Self::handle_session_faulted`] once its backoff
    /// timer has elapsed: create the replacement session and resume its
    /// captured target.
    async fn handle_resume_fault_recovery(&mut self, surface_config: SurfaceConfig, target: StreamConfiguration) {
        match self.handle_create(surface_config) {
            Ok(new_id) => {
                if let Some(new_session) = self.sessions.get(&new_id).cloned() {
                    if let Err(error) = new_session.change_src(ChangeSrcTarget::Config(target)).await {
                        tracing::warn!(session = %new_id, %error, "replacement session changeSrc failed");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to create replacement session");
            }
        }
    }
}

#[async_trait::async_trait]
impl Task for RegistryTask {
    type Output = ();

    const NAME: &'static str = "clsp-registry";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => break,
                message = self.rx.recv() => {
                    match message {
                        Some(message) => self.dispatch(message).await,
                        None => break,
                    }
                }
            }
        }
    }
}

/// Owns the registry actor task. Dropping this stops the task; business-level
/// teardown (after which `create` starts failing) is `RegistryHandle::destroy`,
/// kept distinct from process shutdown per spec.md §9 "Global singleton".
pub struct Registry {
    handle: RegistryHandle,
    _task: ChildTask<()>,
    _shutdown: ShutdownHandle,
}

impl Registry {
    pub fn spawn(collaborator: Arc<dyn DomCollaborator>, global_config: GlobalConfig) -> Self {
        Self::spawn_with_connector(collaborator, global_config, Arc::new(MqttConduitConnector))
    }

    /// Same as [`Registry::spawn`] but with an injectable [`ConduitConnector`],
    /// threaded down to every session (and in turn every player) it creates.
    pub fn spawn_with_connector(
        collaborator: Arc<dyn DomCollaborator>,
        global_config: GlobalConfig,
        connector: Arc<dyn ConduitConnector>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let bus = Arc::new(parking_lot::Mutex::new(EventBus::new(REGISTRY_ALLOWED_EVENTS)));

        let task = RegistryTask {
            rx,
            self_tx: tx.clone(),
            bus: Arc::clone(&bus),
            collaborator,
            global_config,
            connector,
            ids: SessionIdAllocator::new(),
            sessions: HashMap::new(),
            pending_removal: HashSet::new(),
            surface_configs: HashMap::new(),
            retry_budgets: HashMap::new(),
            destroyed: false,
        };

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let child = clsp_task::spawn_task(task, shutdown_signal);

        Self {
            handle: RegistryHandle { tx, bus },
            _task: child,
            _shutdown: shutdown_handle,
        }
    }

    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }
}

static GLOBAL: OnceLock<RegistryHandle> = OnceLock::new();

/// Installs `registry`'s handle as the process-wide singleton. Fails if a
/// singleton is already installed — callers construct the registry
/// explicitly rather than relying on an implicit module-level global
/// (spec.md §9 "Global singleton").
pub fn install(registry: &Registry) -> Result<(), ClspError> {
    GLOBAL
        .set(registry.handle())
        .map_err(|_| ClspError::UnsupportedEnvironment("registry singleton already installed".to_owned()))
}

pub fn global_if_installed() -> Option<RegistryHandle> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::AppendOutcome;
    use crate::surface::SurfaceHandle;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeSurface {
        hidden: AtomicBool,
    }

    impl DomCollaborator for FakeSurface {
        fn resolve_by_id(&self, id: &str) -> Option<SurfaceHandle> {
            Some(SurfaceHandle::new(id))
        }
        fn create_child_video_surface(&self, _container: &SurfaceHandle) -> SurfaceHandle {
            SurfaceHandle::new("video")
        }
        fn apply_class(&self, _handle: &SurfaceHandle, _class: &str) {}
        fn remove_class(&self, _handle: &SurfaceHandle, _class: &str) {}
        fn set_muted_and_playsinline(&self, _handle: &SurfaceHandle) {}
        fn clear_source(&self, _handle: &SurfaceHandle) {}
        fn detach(&self, _handle: &SurfaceHandle) {}
        fn is_document_hidden(&self) -> bool {
            self.hidden.load(Ordering::SeqCst)
        }
        fn is_online(&self) -> bool {
            true
        }
        fn request_fullscreen(&self, _container: &SurfaceHandle) {}
        fn exit_fullscreen(&self) {}
        fn append_segment(&self, _handle: &SurfaceHandle, _data: &[u8]) -> AppendOutcome {
            AppendOutcome::Ok
        }
        fn evict_oldest_buffered_range(&self, _handle: &SurfaceHandle, _threshold: Duration) {}
        fn has_rendered_frame(&self, _handle: &SurfaceHandle) -> bool {
            false
        }
        fn video_info(&self, _handle: &SurfaceHandle) -> Option<crate::surface::VideoInfo> {
            None
        }
    }

    fn spawn_registry() -> Registry {
        Registry::spawn(Arc::new(FakeSurface::default()), GlobalConfig::default())
    }

    #[tokio::test]
    async fn create_has_get_remove_round_trip() {
        let registry = spawn_registry();
        let handle = registry.handle();

        let id = handle
            .create(SurfaceConfig {
                container_element_id: Some("c".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(handle.has(id).await);
        assert!(handle.get(id).await.is_some());

        handle.remove(id).await;
        assert!(!handle.has(id).await);
        assert!(handle.get(id).await.is_none());
    }

    #[tokio::test]
    async fn remove_of_unknown_id_is_a_noop() {
        let registry = spawn_registry();
        let handle = registry.handle();
        static IDS: crate::id::SessionIdAllocator = crate::id::SessionIdAllocator::new();
        handle.remove(IDS.allocate()).await;
    }

    #[tokio::test]
    async fn destroy_empties_sessions_and_rejects_further_creates() {
        let registry = spawn_registry();
        let handle = registry.handle();

        for _ in 0..3 {
            handle
                .create(SurfaceConfig {
                    container_element_id: Some("c".to_owned()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        handle.destroy().await;

        let err = handle
            .create(SurfaceConfig {
                container_element_id: Some("c".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClspError::AlreadyDestroyed));
    }

    #[tokio::test]
    async fn install_then_global_if_installed_returns_a_handle() {
        // OnceLock is process-global; this test only asserts the first
        // successful install is observable, not exclusivity across the full
        // test binary (other tests in this module do not call `install`).
        let registry = Box::leak(Box::new(spawn_registry()));
        if install(registry).is_ok() {
            assert!(global_if_installed().is_some());
        }
    }
}
