//! C5 — Player: owns one conduit plus one media-surface attachment, consumes
//! conduit payloads, produces buffer appends, and drives the per-player state
//! machine (spec.md §4.5).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use bytes::Bytes;
use clsp_task::DestroyGuard;
use tokio::sync::{mpsc, watch};

use crate::conduit::{Conduit, ConduitConnector, ConduitEvent, MqttConduitConnector, ResyncPublisher};
use crate::config::StreamConfiguration;
use crate::destroyable::Destroyable;
use crate::error::ClspError;
use crate::event_bus::{EventBus, EventKind, SessionEvent};
use crate::id::PlayerId;
use crate::surface::{AppendOutcome, DomCollaborator, SurfaceHandle};

/// Threshold above which a buffered range becomes eligible for eviction on
/// `AppendOutcome::QuotaExceeded` (spec.md §4.5).
pub const BUFFER_EVICTION_THRESHOLD_SECS: u64 = 30;

/// Retries allowed on a streaming append failure before emitting
/// `RETRY_ERROR` and moving to `Dead` (spec.md §4.5).
const MAX_APPEND_RETRY_COUNT: u32 = 3;

/// Bound on the feeder's append queue (spec.md §4.5): once inbound segments
/// outrun appends by this many, the oldest queued segment is dropped and a
/// resync is requested from the conduit.
const MAX_PENDING_APPENDS: usize = 32;

/// Reconnect attempts allowed on `RECONNECT_NEEDED` before giving up
/// (spec.md §4.4 "the player decides retry/backoff").
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const ALLOWED_EVENTS: &[EventKind] = &[
    EventKind::FirstFrameShown,
    EventKind::VideoReceived,
    EventKind::VideoInfoReceived,
    EventKind::IframeDestroyedExternally,
    EventKind::ReinitializeError,
    EventKind::RetryError,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Created,
    Connecting,
    Subscribed,
    ReceivingInit,
    Streaming,
    Stalled,
    Stopping,
    Dead,
}

/// A segment waiting in the feeder's append queue, tagged by the transition
/// it carries once it's actually appended.
enum QueuedSegment {
    Init(Bytes),
    Media(Bytes),
}

/// Distinguishes a genuine append from one that failed but is still within
/// [`MAX_APPEND_RETRY_COUNT`] — only the former should flip `seen_init`,
/// move the state machine to `Streaming`, or emit `VIDEO_RECEIVED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendResult {
    Appended,
    RetryPending,
}

pub struct Player {
    id: PlayerId,
    surface: Arc<dyn DomCollaborator>,
    video_handle: SurfaceHandle,
    connector: Arc<dyn ConduitConnector>,
    state: watch::Sender<PlayerState>,
    first_frame_shown: AtomicBool,
    video_info_known: AtomicBool,
    guard: DestroyGuard,
    bus: parking_lot::Mutex<EventBus>,
    conduit: parking_lot::Mutex<Option<Box<dyn Conduit>>>,
    pending_appends: parking_lot::Mutex<VecDeque<QueuedSegment>>,
    run_task: parking_lot::Mutex<Option<clsp_task::ChildTask<()>>>,
}

impl Player {
    pub fn new(id: PlayerId, surface: Arc<dyn DomCollaborator>, video_handle: SurfaceHandle) -> Arc<Self> {
        Self::new_with_connector(id, surface, video_handle, Arc::new(MqttConduitConnector))
    }

    /// Same as [`Player::new`] but with an injectable [`ConduitConnector`],
    /// so tests can substitute a fake transport the way they already
    /// substitute a fake `DomCollaborator`.
    pub fn new_with_connector(
        id: PlayerId,
        surface: Arc<dyn DomCollaborator>,
        video_handle: SurfaceHandle,
        connector: Arc<dyn ConduitConnector>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PlayerState::Created);
        Arc::new(Self {
            id,
            surface,
            video_handle,
            connector,
            state: state_tx,
            first_frame_shown: AtomicBool::new(false),
            video_info_known: AtomicBool::new(false),
            guard: DestroyGuard::new(),
            bus: parking_lot::Mutex::new(EventBus::new(ALLOWED_EVENTS)),
            conduit: parking_lot::Mutex::new(None),
            pending_appends: parking_lot::Mutex::new(VecDeque::new()),
            run_task: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    pub fn subscribe_event<F>(&self, kind: EventKind, handler: F) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bus.lock().subscribe(kind, handler)
    }

    fn set_state(&self, next: PlayerState) {
        tracing::debug!(player = %self.id, ?next, "player state transition");
        let _ = self.state.send(next);
    }

    fn emit(&self, event: SessionEvent) {
        self.bus.lock().emit(event);
    }

    /// Connects the conduit, subscribes, and begins consuming inbound
    /// segments. Returns once the conduit is connected; streaming continues
    /// on a background task.
    pub async fn play(self: &Arc<Self>, stream_config: &StreamConfiguration) -> Result<(), ClspError> {
        if self.guard.is_started() {
            return Err(ClspError::AlreadyDestroyed);
        }

        self.set_state(PlayerState::Connecting);
        let (conduit, events) = self.connector.connect(stream_config).await?;
        conduit.publish_play().await?;
        self.set_state(PlayerState::Subscribed);
        let resync_handle = conduit.resync_handle();
        *self.conduit.lock() = Some(conduit);

        let player = Arc::clone(self);
        let stream_config = stream_config.clone();
        let task = clsp_task::ChildTask::spawn(async move {
            let mut retry_count = 0u32;
            let mut seen_init = false;
            let mut events = events;
            let mut resync_handle = resync_handle;

            'outer: while let Some(event) = events.recv().await {
                if player.state() == PlayerState::Stopping || player.state() == PlayerState::Dead {
                    break;
                }

                match event {
                    ConduitEvent::Connected => {
                        tracing::debug!(player = %player.id, "conduit (re)connected");
                    }
                    ConduitEvent::Disconnected => {
                        tracing::debug!(player = %player.id, "conduit disconnected");
                    }
                    ConduitEvent::ReconnectNeeded => {
                        tracing::warn!(player = %player.id, "conduit signalled reconnect, attempting to recover");
                        match player.reconnect(&stream_config).await {
                            Ok((new_conduit, new_events)) => {
                                resync_handle = new_conduit.resync_handle();
                                events = new_events;
                                *player.conduit.lock() = Some(new_conduit);
                            }
                            Err(error) => {
                                tracing::error!(player = %player.id, %error, "reconnect attempts exhausted");
                                break 'outer;
                            }
                        }
                        continue;
                    }
                    ConduitEvent::IframeDestroyedExternally => {
                        player.emit(SessionEvent::IframeDestroyedExternally);
                        player.set_state(PlayerState::Dead);
                        break 'outer;
                    }
                    ConduitEvent::InitSegment(data) => {
                        player.enqueue_segment(QueuedSegment::Init(data), resync_handle.as_ref()).await;
                    }
                    ConduitEvent::MediaSegment { data, .. } => {
                        player.enqueue_segment(QueuedSegment::Media(data), resync_handle.as_ref()).await;
                    }
                }

                if player.drain_pending_appends(&mut retry_count, &mut seen_init).await.is_err() {
                    break 'outer;
                }
            }
        });
        *self.run_task.lock() = Some(task);

        Ok(())
    }

    /// Pushes one inbound segment onto the bounded append queue. If the queue
    /// overruns, the oldest queued segment is dropped and a resync is
    /// requested from the conduit (spec.md §4.5).
    async fn enqueue_segment(&self, segment: QueuedSegment, resync: &dyn ResyncPublisher) {
        let overran = {
            let mut pending = self.pending_appends.lock();
            pending.push_back(segment);
            if pending.len() > MAX_PENDING_APPENDS {
                pending.pop_front();
                true
            } else {
                false
            }
        };

        if overran {
            tracing::warn!(player = %self.id, "append queue overran, dropped oldest segment and requesting resync");
            if let Err(error) = resync.publish_resync().await {
                tracing::warn!(player = %self.id, %error, "failed to publish resync request");
            }
        }
    }

    /// Drains the append queue in FIFO order, applying
    /// [`Self::append_with_retry`] to each segment. Only a genuinely applied
    /// segment flips `seen_init`, transitions to `Streaming`, or emits
    /// `VIDEO_RECEIVED` (the fix for treating a retry-pending failure as
    /// success). Stops at the first terminal failure.
    async fn drain_pending_appends(&self, retry_count: &mut u32, seen_init: &mut bool) -> Result<(), Terminal> {
        loop {
            let segment = self.pending_appends.lock().pop_front();
            let Some(segment) = segment else { return Ok(()) };

            let (data, is_init) = match segment {
                QueuedSegment::Init(data) => (data, true),
                QueuedSegment::Media(data) => (data, false),
            };

            if !*seen_init {
                if is_init {
                    self.set_state(PlayerState::ReceivingInit);
                } else {
                    // A media segment before init is out of order; drop it
                    // (spec.md §4.4 malformed-payload handling).
                    tracing::warn!(player = %self.id, "dropping media segment received before init");
                    continue;
                }
            }

            match self.append_with_retry(&data, retry_count).await {
                Ok(AppendResult::Appended) => {
                    if is_init {
                        *seen_init = true;
                        self.set_state(PlayerState::Streaming);
                    }
                    self.emit(SessionEvent::VideoReceived);
                    self.check_first_frame();
                    self.check_video_info();
                }
                Ok(AppendResult::RetryPending) => {}
                Err(Terminal) => return Err(Terminal),
            }
        }
    }

    /// Bounded exponential backoff reconnect, matching the registry's own
    /// retry-budget shape (spec.md §4.4: "the player decides retry/backoff").
    /// Exhausting `MAX_RECONNECT_ATTEMPTS` emits `RETRY_ERROR` and marks the
    /// player `Dead` — deliberately not surfaced through the registry's
    /// `ReconnectNeeded` fatal-kind list, since a successful reconnect should
    /// never trigger session-level replacement, only an exhausted one (which
    /// already shows up as `RetryError`).
    async fn reconnect(
        &self,
        stream_config: &StreamConfiguration,
    ) -> Result<(Box<dyn Conduit>, mpsc::Receiver<ConduitEvent>), ClspError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connector.connect(stream_config).await {
                Ok((conduit, events)) => {
                    if let Err(error) = conduit.publish_play().await {
                        tracing::warn!(player = %self.id, %error, "reconnect: publish_play failed");
                    }
                    return Ok((conduit, events));
                }
                Err(error) => {
                    tracing::warn!(player = %self.id, %error, attempt, "reconnect attempt failed");
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        self.emit(SessionEvent::RetryError);
                        self.set_state(PlayerState::Dead);
                        return Err(error);
                    }
                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn check_first_frame(&self) {
        if self.state() != PlayerState::Streaming {
            return;
        }
        if !self.surface.has_rendered_frame(&self.video_handle) {
            return;
        }
        if self.first_frame_shown.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.emit(SessionEvent::FirstFrameShown { player_id: self.id });
        }
    }

    /// Polled after a successful append, alongside [`Self::check_first_frame`];
    /// emits `VIDEO_INFO_RECEIVED` exactly once, the first time the surface
    /// reports a decoded codec/dimensions (spec.md §4.5).
    fn check_video_info(&self) {
        if self.video_info_known.load(Ordering::SeqCst) {
            return;
        }
        let Some(info) = self.surface.video_info(&self.video_handle) else {
            return;
        };
        if self.video_info_known.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.emit(SessionEvent::VideoInfoReceived {
                codec: info.codec,
                width: info.width,
                height: info.height,
            });
        }
    }

    /// Bounded-retry append, grounded on the teacher's reset-on-success EOF
    /// retry loop: a failure increments `retry_count`; a success resets it to
    /// zero. A `QuotaExceeded` outcome evicts the oldest eligible range and
    /// retries exactly once before falling back to the ordinary retry count.
    async fn append_with_retry(&self, data: &[u8], retry_count: &mut u32) -> Result<AppendResult, Terminal> {
        match self.surface.append_segment(&self.video_handle, data) {
            AppendOutcome::Ok => {
                *retry_count = 0;
                Ok(AppendResult::Appended)
            }
            AppendOutcome::QuotaExceeded => {
                self.surface
                    .evict_oldest_buffered_range(&self.video_handle, Duration::from_secs(BUFFER_EVICTION_THRESHOLD_SECS));
                match self.surface.append_segment(&self.video_handle, data) {
                    AppendOutcome::Ok => {
                        *retry_count = 0;
                        Ok(AppendResult::Appended)
                    }
                    _ => {
                        self.set_state(PlayerState::Stalled);
                        self.emit(SessionEvent::ReinitializeError);
                        Err(Terminal)
                    }
                }
            }
            AppendOutcome::Failed(reason) => {
                *retry_count += 1;
                tracing::warn!(player = %self.id, %reason, retry_count, "append failed");
                if *retry_count >= MAX_APPEND_RETRY_COUNT {
                    self.emit(SessionEvent::RetryError);
                    self.set_state(PlayerState::Dead);
                    Err(Terminal)
                } else {
                    self.set_state(PlayerState::Stalled);
                    Ok(AppendResult::RetryPending)
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<(), ClspError> {
        self.set_state(PlayerState::Stopping);
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
        if let Some(conduit) = self.conduit.lock().take() {
            conduit.stop().await?;
        }
        self.set_state(PlayerState::Dead);
        Ok(())
    }
}

/// Sentinel marking "no further retry is possible, the caller already
/// transitioned to a terminal state and emitted the matching event."
struct Terminal;

#[async_trait::async_trait]
impl Destroyable for Player {
    async fn destroy(&self) -> Result<(), ClspError> {
        if !self.guard.trigger() {
            self.guard.wait().await;
            return Ok(());
        }
        let result = self.stop().await;
        self.bus.lock().remove_all_listeners();
        self.guard.complete();
        result
    }

    fn is_destroyed(&self) -> bool {
        self.guard.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeSurface {
        outcomes: StdMutex<Vec<AppendOutcome>>,
        rendered: AtomicBool,
        video_info: StdMutex<Option<crate::surface::VideoInfo>>,
    }

    impl FakeSurface {
        fn new(outcomes: Vec<AppendOutcome>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes),
                rendered: AtomicBool::new(false),
                video_info: StdMutex::new(None),
            }
        }
    }

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
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                AppendOutcome::Ok
            } else {
                outcomes.remove(0)
            }
        }
        fn evict_oldest_buffered_range(&self, _handle: &SurfaceHandle, _threshold: Duration) {}
        fn has_rendered_frame(&self, _handle: &SurfaceHandle) -> bool {
            self.rendered.load(Ordering::SeqCst)
        }
        fn video_info(&self, _handle: &SurfaceHandle) -> Option<crate::surface::VideoInfo> {
            self.video_info.lock().unwrap().clone()
        }
    }

    fn new_player(surface: Arc<dyn DomCollaborator>) -> Arc<Player> {
        static IDS: crate::id::PlayerIdAllocator = crate::id::PlayerIdAllocator::new();
        Player::new(IDS.allocate(), surface, SurfaceHandle::new("video"))
    }

    #[tokio::test]
    async fn successful_append_resets_retry_count_and_emits_video_received() {
        let surface = Arc::new(FakeSurface::new(vec![]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);
        let mut retry_count = 3;
        let result = player.append_with_retry(b"segment", &mut retry_count).await;
        assert_eq!(result.unwrap(), AppendResult::Appended);
        assert_eq!(retry_count, 0);
    }

    #[tokio::test]
    async fn failure_under_retry_budget_reports_retry_pending_not_appended() {
        let surface = Arc::new(FakeSurface::new(vec![AppendOutcome::Failed("one".into())]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);
        let mut retry_count = 0;
        let result = player.append_with_retry(b"a", &mut retry_count).await;
        assert_eq!(result.unwrap(), AppendResult::RetryPending);
        assert_eq!(retry_count, 1);
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_retry_budget_and_go_terminal() {
        let surface = Arc::new(FakeSurface::new(vec![
            AppendOutcome::Failed("one".into()),
            AppendOutcome::Failed("two".into()),
            AppendOutcome::Failed("three".into()),
        ]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);

        let mut retry_count = 0;
        assert_eq!(player.append_with_retry(b"a", &mut retry_count).await.unwrap(), AppendResult::RetryPending);
        assert_eq!(player.append_with_retry(b"a", &mut retry_count).await.unwrap(), AppendResult::RetryPending);
        let result = player.append_with_retry(b"a", &mut retry_count).await;
        assert!(result.is_err());
        assert_eq!(player.state(), PlayerState::Dead);
    }

    #[tokio::test]
    async fn quota_exceeded_evicts_and_retries_once_then_succeeds() {
        let surface = Arc::new(FakeSurface::new(vec![AppendOutcome::QuotaExceeded, AppendOutcome::Ok]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);
        let mut retry_count = 0;
        let result = player.append_with_retry(b"a", &mut retry_count).await;
        assert_eq!(result.unwrap(), AppendResult::Appended);
        assert_eq!(retry_count, 0);
    }

    #[tokio::test]
    async fn quota_exceeded_twice_emits_reinitialize_error_and_stalls() {
        let surface = Arc::new(FakeSurface::new(vec![AppendOutcome::QuotaExceeded, AppendOutcome::QuotaExceeded]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);

        let received = Arc::new(AtomicBool::new(false));
        let received2 = Arc::clone(&received);
        player
            .subscribe_event(EventKind::ReinitializeError, move |_| {
                received2.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let mut retry_count = 0;
        let result = player.append_with_retry(b"a", &mut retry_count).await;
        assert!(result.is_err());
        assert_eq!(player.state(), PlayerState::Stalled);
        assert!(received.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn first_frame_shown_fires_exactly_once() {
        let surface = Arc::new(FakeSurface::new(vec![]));
        surface.rendered.store(true, Ordering::SeqCst);
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);
        player.set_state(PlayerState::Streaming);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        player
            .subscribe_event(EventKind::FirstFrameShown, move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        player.check_first_frame();
        player.check_first_frame();
        player.check_first_frame();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn video_info_received_fires_exactly_once_once_known() {
        let surface = Arc::new(FakeSurface::new(vec![]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        player
            .subscribe_event(EventKind::VideoInfoReceived, move |event| {
                if let SessionEvent::VideoInfoReceived { codec, width, height } = event {
                    assert_eq!(codec, "avc1");
                    assert_eq!(*width, 1920);
                    assert_eq!(*height, 1080);
                }
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        player.check_video_info();
        *surface.video_info.lock().unwrap() = Some(crate::surface::VideoInfo {
            codec: "avc1".to_owned(),
            width: 1920,
            height: 1080,
        });
        player.check_video_info();
        player.check_video_info();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn append_queue_drops_oldest_and_requests_resync_on_overrun() {
        struct CountingResync(Arc<std::sync::atomic::AtomicUsize>);

        #[async_trait::async_trait]
        impl ResyncPublisher for CountingResync {
            async fn publish_resync(&self) -> Result<(), ClspError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let surface = Arc::new(FakeSurface::new(vec![]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);
        let resync_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let resync = CountingResync(Arc::clone(&resync_calls));

        for i in 0..(MAX_PENDING_APPENDS + 5) {
            player.enqueue_segment(QueuedSegment::Media(Bytes::from(format!("segment-{i}"))), &resync).await;
        }

        assert_eq!(resync_calls.load(Ordering::SeqCst), 5);
        assert_eq!(player.pending_appends.lock().len(), MAX_PENDING_APPENDS);
    }

    #[tokio::test]
    async fn drain_only_transitions_to_streaming_on_a_genuine_init_append() {
        let surface = Arc::new(FakeSurface::new(vec![AppendOutcome::Failed("not yet".into())]));
        let player = new_player(Arc::clone(&surface) as Arc<dyn DomCollaborator>);

        let video_received = Arc::new(AtomicBool::new(false));
        let video_received2 = Arc::clone(&video_received);
        player
            .subscribe_event(EventKind::VideoReceived, move |_| {
                video_received2.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        player.pending_appends.lock().push_back(QueuedSegment::Init(Bytes::from_static(b"init")));
        let mut retry_count = 0;
        let mut seen_init = false;
        player.drain_pending_appends(&mut retry_count, &mut seen_init).await.unwrap();

        // The append failed (but stayed within budget): no transition, no event.
        assert!(!seen_init);
        assert_ne!(player.state(), PlayerState::Streaming);
        assert!(!video_received.load(Ordering::SeqCst));

        player.pending_appends.lock().push_back(QueuedSegment::Init(Bytes::from_static(b"init")));
        player.drain_pending_appends(&mut retry_count, &mut seen_init).await.unwrap();

        assert!(seen_init);
        assert_eq!(player.state(), PlayerState::Streaming);
        assert!(video_received.load(Ordering::SeqCst));
    }
}
