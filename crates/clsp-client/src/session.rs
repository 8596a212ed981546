//! C7 — IOV Session: the user-facing handle for one rendering surface. Owns
//! one player collection, reacts to visibility/online events, and exposes
//! play/stop/restart/changeSrc/fullscreen (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clsp_task::{ChildTask, DestroyGuard};
use tokio::sync::oneshot;

use crate::conduit::{ConduitConnector, MqttConduitConnector};
use crate::config::StreamConfiguration;
use crate::destroyable::Destroyable;
use crate::error::ClspError;
use crate::event_bus::{EventBus, EventKind, SessionEvent};
use crate::id::{PlayerId, SessionId};
use crate::player_collection::PlayerCollection;
use crate::surface::{CONTAINER_CLASS, DomCollaborator, ResolvedSurfaces, SurfaceConfig, SurfaceHandle, VIDEO_CLASS};

const ALLOWED_EVENTS: &[EventKind] = &[
    EventKind::Metric,
    EventKind::FirstFrameShown,
    EventKind::VideoReceived,
    EventKind::VideoInfoReceived,
    EventKind::IframeDestroyedExternally,
    EventKind::ReinitializeError,
    EventKind::NoStreamConfiguration,
    EventKind::RetryError,
];

/// Events forwarded verbatim from the collection's own whitelist
/// (spec.md §4.7 "forwarded from the player").
const FORWARDED_FROM_COLLECTION: &[EventKind] = &[
    EventKind::FirstFrameShown,
    EventKind::VideoReceived,
    EventKind::VideoInfoReceived,
    EventKind::IframeDestroyedExternally,
    EventKind::ReinitializeError,
    EventKind::RetryError,
];

/// `changeSrc` accepts either a raw URL or an already-built configuration
/// (spec.md §4.1 `isStreamConfiguration`).
#[derive(Debug, Clone)]
pub enum ChangeSrcTarget {
    Url(String),
    Config(StreamConfiguration),
}

impl ChangeSrcTarget {
    fn is_empty(&self) -> bool {
        matches!(self, Self::Url(s) if s.is_empty())
    }
}

pub struct IovSession {
    id: SessionId,
    surface: Arc<dyn DomCollaborator>,
    collection: Arc<PlayerCollection>,
    stream_configuration: parking_lot::Mutex<Option<StreamConfiguration>>,
    pending_change_src: parking_lot::Mutex<Option<StreamConfiguration>>,
    is_stopping: AtomicBool,
    guard: DestroyGuard,
    should_retain_surface: AtomicBool,
    fullscreen_engaged: AtomicBool,
    container_surface: parking_lot::Mutex<Option<SurfaceHandle>>,
    video_surface: parking_lot::Mutex<Option<SurfaceHandle>>,
    bus: parking_lot::Mutex<EventBus>,
    first_frame_waiters: parking_lot::Mutex<HashMap<PlayerId, oneshot::Sender<()>>>,
    connection_change_play_delay: Duration,
    pending_delay_tasks: parking_lot::Mutex<Vec<ChildTask<()>>>,
}

impl IovSession {
    pub fn new(
        id: SessionId,
        surface: Arc<dyn DomCollaborator>,
        show_next_video_delay: Duration,
        connection_change_play_delay: Duration,
    ) -> Arc<Self> {
        Self::new_with_connector(
            id,
            surface,
            show_next_video_delay,
            connection_change_play_delay,
            Arc::new(MqttConduitConnector),
        )
    }

    /// Same as [`IovSession::new`] but with an injectable [`ConduitConnector`],
    /// threaded down through the player collection to every player it creates.
    pub fn new_with_connector(
        id: SessionId,
        surface: Arc<dyn DomCollaborator>,
        show_next_video_delay: Duration,
        connection_change_play_delay: Duration,
        connector: Arc<dyn ConduitConnector>,
    ) -> Arc<Self> {
        let collection = PlayerCollection::new_with_connector(show_next_video_delay, connector);

        let session = Arc::new(Self {
            id,
            surface,
            collection: Arc::clone(&collection),
            stream_configuration: parking_lot::Mutex::new(None),
            pending_change_src: parking_lot::Mutex::new(None),
            is_stopping: AtomicBool::new(false),
            guard: DestroyGuard::new(),
            should_retain_surface: AtomicBool::new(false),
            fullscreen_engaged: AtomicBool::new(false),
            container_surface: parking_lot::Mutex::new(None),
            video_surface: parking_lot::Mutex::new(None),
            bus: parking_lot::Mutex::new(EventBus::new(ALLOWED_EVENTS)),
            first_frame_waiters: parking_lot::Mutex::new(HashMap::new()),
            connection_change_play_delay,
            pending_delay_tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let waiter_session = Arc::clone(&session);
        collection
            .subscribe_event(EventKind::FirstFrameShown, move |event| {
                if let SessionEvent::FirstFrameShown { player_id } = event {
                    if let Some(tx) = waiter_session.first_frame_waiters.lock().remove(player_id) {
                        let _ = tx.send(());
                    }
                }
                Ok(())
            })
            .expect("FirstFrameShown is always in the collection's own whitelist");

        for &kind in FORWARDED_FROM_COLLECTION {
            let forward_session = Arc::clone(&session);
            collection
                .subscribe_event(kind, move |event| {
                    forward_session.emit(event.clone());
                    Ok(())
                })
                .expect("kind is drawn from the collection's own whitelist");
        }

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn stream_configuration(&self) -> Option<StreamConfiguration> {
        self.stream_configuration.lock().clone()
    }

    pub fn pending_change_src_stream_configuration(&self) -> Option<StreamConfiguration> {
        self.pending_change_src.lock().clone()
    }

    /// The target a retry should resume with: the in-flight target if a
    /// changeSrc is pending, else the last committed one (spec.md §4.8 step 2).
    pub fn last_target(&self) -> Option<StreamConfiguration> {
        self.pending_change_src.lock().clone().or_else(|| self.stream_configuration.lock().clone())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bus.lock().subscribe(kind, handler)
    }

    fn emit(&self, event: SessionEvent) {
        self.bus.lock().emit(event);
    }

    /// Resolves surfaces per spec.md §4.7 `initializeElements`.
    pub fn initialize_elements(&self, config: SurfaceConfig) -> Result<(), ClspError> {
        if self.guard.is_started() {
            return Err(ClspError::AlreadyDestroyed);
        }

        let container = config
            .container_element
            .clone()
            .or_else(|| config.container_element_id.as_deref().and_then(|id| self.surface.resolve_by_id(id)));

        let explicit_video = config
            .video_element
            .clone()
            .or_else(|| config.video_element_id.as_deref().and_then(|id| self.surface.resolve_by_id(id)));

        let resolved = if let Some(handle) = explicit_video {
            ResolvedSurfaces {
                container,
                video: handle,
                should_retain_surface: true,
            }
        } else if let Some(container) = container {
            let video = self.surface.create_child_video_surface(&container);
            ResolvedSurfaces {
                container: Some(container),
                video,
                should_retain_surface: false,
            }
        } else {
            return Err(ClspError::NoSurface);
        };

        if let Some(container) = &resolved.container {
            self.surface.apply_class(container, CONTAINER_CLASS);
        }
        self.surface.apply_class(&resolved.video, VIDEO_CLASS);
        self.surface.set_muted_and_playsinline(&resolved.video);

        *self.container_surface.lock() = resolved.container;
        *self.video_surface.lock() = Some(resolved.video);
        self.should_retain_surface.store(resolved.should_retain_surface, Ordering::SeqCst);

        Ok(())
    }

    /// The seven-step algorithm from spec.md §4.7.
    pub async fn change_src(self: &Arc<Self>, target: ChangeSrcTarget) -> Result<(), ClspError> {
        if self.guard.is_started() {
            return Err(ClspError::AlreadyDestroyed);
        }
        if target.is_empty() {
            return Err(ClspError::MissingUrl);
        }

        let config = match target {
            ChangeSrcTarget::Config(config) => config,
            ChangeSrcTarget::Url(url) => StreamConfiguration::from_url(&url)?,
        };

        // Step 4: document-hidden short-circuit (B1) — the target still
        // updates, but no player is created until visible again.
        if self.surface.is_document_hidden() {
            *self.stream_configuration.lock() = Some(config);
            *self.pending_change_src.lock() = None;
            return Ok(());
        }

        *self.pending_change_src.lock() = Some(config.clone());

        let video_handle = self.video_surface.lock().clone().ok_or(ClspError::NoSurface)?;

        let (tx, rx) = oneshot::channel();
        let player_id = self
            .collection
            .create(Arc::clone(&self.surface), video_handle, config.clone())
            .map_err(|e| ClspError::ChangeSrcFailed(e.to_string()))?;
        self.first_frame_waiters.lock().insert(player_id, tx);

        // Step 6: await FIRST_FRAME_SHOWN for *this* player id only (I5); a
        // dropped sender (e.g. destroy mid-wait) surfaces as ChangeSrcFailed.
        rx.await.map_err(|_| ClspError::ChangeSrcFailed("changeSrc cancelled before first frame".to_owned()))?;

        *self.stream_configuration.lock() = Some(config.clone());
        let mut pending = self.pending_change_src.lock();
        if pending.as_ref() == Some(&config) {
            *pending = None;
        }

        Ok(())
    }

    /// Idempotent: a stop already in flight makes the second call a no-op
    /// (L2).
    pub async fn stop(&self) -> Result<(), ClspError> {
        if self.is_stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.collection.remove_all().await;
        self.is_stopping.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// `stop()` followed by `changeSrc(streamConfiguration)`; stop errors are
    /// swallowed, changeSrc errors propagate (spec.md §4.7).
    pub async fn restart(self: &Arc<Self>) -> Result<(), ClspError> {
        if let Err(error) = self.stop().await {
            tracing::warn!(session = %self.id, %error, "restart: stop failed, continuing");
        }

        match self.stream_configuration.lock().clone() {
            Some(config) => self.change_src(ChangeSrcTarget::Config(config)).await,
            None => {
                self.emit(SessionEvent::NoStreamConfiguration);
                tracing::warn!(session = %self.id, "restart called with no committed stream configuration");
                Ok(())
            }
        }
    }

    /// Errors are logged, never thrown to the caller (spec.md §4.7).
    pub fn on_visibility_change(self: &Arc<Self>, hidden: bool) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if hidden {
                if let Err(error) = session.stop().await {
                    tracing::warn!(session = %session.id, %error, "onVisibilityChange: stop failed");
                }
            } else if let Err(error) = session.restart().await {
                tracing::warn!(session = %session.id, %error, "onVisibilityChange: restart failed");
            }
        });
    }

    /// On `online`, the restart is delayed by `CONNECTION_CHANGE_PLAY_DELAY`
    /// because browser-reported online events precede actual network
    /// readiness; the delay is a cancellable `ChildTask` so destroying the
    /// session first clears it (spec.md §5).
    pub fn on_connection_change(self: &Arc<Self>, online: bool) {
        if online {
            let session = Arc::clone(self);
            let delay = self.connection_change_play_delay;
            let task = ChildTask::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(error) = session.restart().await {
                    tracing::warn!(session = %session.id, %error, "onConnectionChange: restart failed");
                }
            });
            self.pending_delay_tasks.lock().push(task);
        } else {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = session.stop().await {
                    tracing::warn!(session = %session.id, %error, "onConnectionChange: stop failed");
                }
            });
        }
    }

    /// Fullscreen is requested on the *container*, not the video surface,
    /// because the video surface is destroyed on every player handoff
    /// (spec.md §4.7).
    pub fn enter_fullscreen(&self) -> Result<(), ClspError> {
        let container = self.container_surface.lock().clone().ok_or(ClspError::NoSurface)?;
        self.surface.request_fullscreen(&container);
        self.fullscreen_engaged.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn exit_fullscreen(&self) {
        self.surface.exit_fullscreen();
        self.fullscreen_engaged.store(false, Ordering::SeqCst);
    }

    pub fn toggle_fullscreen(&self) -> Result<(), ClspError> {
        if self.fullscreen_engaged.load(Ordering::SeqCst) {
            self.exit_fullscreen();
            Ok(())
        } else {
            self.enter_fullscreen()
        }
    }
}

#[async_trait::async_trait]
impl Destroyable for IovSession {
    async fn destroy(&self) -> Result<(), ClspError> {
        if !self.guard.trigger() {
            self.guard.wait().await;
            return Ok(());
        }

        self.pending_delay_tasks.lock().clear();
        if let Err(error) = self.collection.destroy().await {
            tracing::warn!(session = %self.id, %error, "error destroying player collection");
        }

        // Clearing the source before detaching is load-bearing: reversing
        // the order leaks buffer references (spec.md §9).
        if let Some(video) = self.video_surface.lock().take() {
            self.surface.clear_source(&video);
            if self.should_retain_surface.load(Ordering::SeqCst) {
                self.surface.remove_class(&video, VIDEO_CLASS);
            } else {
                self.surface.detach(&video);
            }
        }
        if let Some(container) = self.container_surface.lock().take() {
            self.surface.remove_class(&container, CONTAINER_CLASS);
        }

        self.bus.lock().remove_all_listeners();
        self.guard.complete();
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.guard.is_complete()
    }
}
