//! C6 — Player Collection: serializes player handoff on `changeSrc` (spec.md
//! §4.6). Creates a new player without awaiting its first frame, and retires
//! prior players after `SHOW_NEXT_VIDEO_DELAY` once the new one streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clsp_task::{ChildTask, DestroyGuard};

use crate::conduit::{ConduitConnector, MqttConduitConnector};
use crate::config::StreamConfiguration;
use crate::destroyable::Destroyable;
use crate::error::ClspError;
use crate::event_bus::{EventBus, EventKind, SessionEvent};
use crate::id::{PlayerId, PlayerIdAllocator};
use crate::player::Player;
use crate::surface::{DomCollaborator, SurfaceHandle};

const ALLOWED_EVENTS: &[EventKind] = &[
    EventKind::FirstFrameShown,
    EventKind::VideoReceived,
    EventKind::VideoInfoReceived,
    EventKind::IframeDestroyedExternally,
    EventKind::ReinitializeError,
    EventKind::RetryError,
];

pub struct PlayerCollection {
    ids: PlayerIdAllocator,
    players: parking_lot::Mutex<HashMap<PlayerId, Arc<Player>>>,
    bus: parking_lot::Mutex<EventBus>,
    guard: DestroyGuard,
    show_next_video_delay: Duration,
    pending_handoffs: parking_lot::Mutex<Vec<ChildTask<()>>>,
    connector: Arc<dyn ConduitConnector>,
}

impl PlayerCollection {
    pub fn new(show_next_video_delay: Duration) -> Arc<Self> {
        Self::new_with_connector(show_next_video_delay, Arc::new(MqttConduitConnector))
    }

    /// Same as [`PlayerCollection::new`] but with an injectable
    /// [`ConduitConnector`], threaded down to every player it creates.
    pub fn new_with_connector(show_next_video_delay: Duration, connector: Arc<dyn ConduitConnector>) -> Arc<Self> {
        Arc::new(Self {
            ids: PlayerIdAllocator::new(),
            players: parking_lot::Mutex::new(HashMap::new()),
            bus: parking_lot::Mutex::new(EventBus::new(ALLOWED_EVENTS)),
            guard: DestroyGuard::new(),
            show_next_video_delay,
            pending_handoffs: parking_lot::Mutex::new(Vec::new()),
            connector,
        })
    }

    pub fn subscribe_event<F>(&self, kind: EventKind, handler: F) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bus.lock().subscribe(kind, handler)
    }

    /// Constructs a player, starts its play flow, and returns its id
    /// immediately — the caller awaits `FIRST_FRAME_SHOWN{id}` separately.
    pub fn create(
        self: &Arc<Self>,
        surface: Arc<dyn DomCollaborator>,
        video_handle: SurfaceHandle,
        stream_config: StreamConfiguration,
    ) -> Result<PlayerId, ClspError> {
        if self.guard.is_started() {
            return Err(ClspError::AlreadyDestroyed);
        }

        let id = self.ids.allocate();
        let player = Player::new_with_connector(id, surface, video_handle, Arc::clone(&self.connector));

        let collection = Arc::clone(self);
        let player_for_bubble = Arc::clone(&player);
        for &kind in ALLOWED_EVENTS {
            let collection = Arc::clone(&collection);
            player_for_bubble
                .subscribe_event(kind, move |event| {
                    collection.bus.lock().emit(event.clone());
                    Ok(())
                })
                .map_err(|e| ClspError::ChangeSrcFailed(e.to_string()))?;
        }

        let collection_for_handoff = Arc::clone(self);
        player
            .subscribe_event(EventKind::FirstFrameShown, move |event| {
                if let SessionEvent::FirstFrameShown { player_id } = event {
                    collection_for_handoff.schedule_handoff(*player_id);
                }
                Ok(())
            })
            .map_err(|e| ClspError::ChangeSrcFailed(e.to_string()))?;

        self.players.lock().insert(id, Arc::clone(&player));

        let play_config = stream_config;
        tokio::spawn(async move {
            if let Err(error) = player.play(&play_config).await {
                tracing::warn!(player = %player.id(), %error, "player failed to start");
            }
        });

        Ok(id)
    }

    /// Schedules every player other than `surviving_id` for destruction
    /// after `show_next_video_delay`, run on a `ChildTask` so destroying the
    /// collection first cancels the pending teardown (spec.md §5).
    fn schedule_handoff(self: &Arc<Self>, surviving_id: PlayerId) {
        let others: Vec<Arc<Player>> = {
            let players = self.players.lock();
            players.iter().filter(|(id, _)| **id != surviving_id).map(|(_, p)| Arc::clone(p)).collect()
        };
        if others.is_empty() {
            return;
        }

        let collection = Arc::clone(self);
        let delay = self.show_next_video_delay;
        let task = ChildTask::spawn(async move {
            tokio::time::sleep(delay).await;
            for player in others {
                let player_id = player.id();
                if let Err(error) = player.destroy().await {
                    tracing::warn!(player = %player_id, %error, "error destroying retired player");
                }
                collection.players.lock().remove(&player_id);
            }
        });
        self.pending_handoffs.lock().push(task);
    }

    pub fn player_count(&self) -> usize {
        self.players.lock().len()
    }

    /// Stops and destroys every player, swallowing individual errors
    /// (spec.md §4.6).
    pub async fn remove_all(&self) {
        let players: Vec<Arc<Player>> = self.players.lock().drain().map(|(_, p)| p).collect();
        for player in players {
            let player_id = player.id();
            if let Err(error) = player.destroy().await {
                tracing::warn!(player = %player_id, %error, "error while removing player");
            }
        }
    }
}

#[async_trait::async_trait]
impl Destroyable for PlayerCollection {
    async fn destroy(&self) -> Result<(), ClspError> {
        if !self.guard.trigger() {
            self.guard.wait().await;
            return Ok(());
        }
        self.pending_handoffs.lock().clear();
        self.remove_all().await;
        self.bus.lock().remove_all_listeners();
        self.guard.complete();
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.guard.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::AppendOutcome;

    struct FakeSurface;
    impl DomCollaborator for FakeSurface {
        fn resolve_by_id(&self, _id: &str) -> Option<SurfaceHandle> {
            None
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
            false
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

    #[tokio::test]
    async fn destroy_is_idempotent_and_rejects_further_creates() {
        let collection = PlayerCollection::new(Duration::from_millis(1));
        collection.destroy().await.unwrap();
        collection.destroy().await.unwrap();

        let surface: Arc<dyn DomCollaborator> = Arc::new(FakeSurface);
        let stream_config = StreamConfiguration::from_url("clsp://host/stream").unwrap();
        let err = collection.create(surface, SurfaceHandle::new("video"), stream_config).unwrap_err();
        assert!(matches!(err, ClspError::AlreadyDestroyed));
    }

    #[tokio::test]
    async fn schedule_handoff_is_a_noop_with_a_single_surviving_player() {
        let collection = PlayerCollection::new(Duration::from_millis(5));
        let surface: Arc<dyn DomCollaborator> = Arc::new(FakeSurface);
        let player = Player::new(PlayerIdAllocator::new().allocate(), surface, SurfaceHandle::new("video"));
        collection.players.lock().insert(player.id(), player);

        let only_id = *collection.players.lock().keys().next().unwrap();
        collection.schedule_handoff(only_id);
        assert!(collection.pending_handoffs.lock().is_empty());
    }
}
