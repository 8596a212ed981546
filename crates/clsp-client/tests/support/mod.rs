#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use clsp_client::{AppendOutcome, ClspError, Conduit, ConduitConnector, DomCollaborator, ResyncPublisher, StreamConfiguration, SurfaceHandle, VideoInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A `DomCollaborator` fake standing in for the browser DOM across the
/// integration suite (spec.md §1 explicitly keeps the real DOM out of
/// scope). Streaming/buffer calls always report success since no test here
/// drives a real MQTT connection.
#[derive(Default)]
pub(crate) struct FakeSurface {
    pub(crate) hidden: AtomicBool,
    online: AtomicBool,
    pub(crate) detach_calls: Mutex<Vec<String>>,
    pub(crate) fullscreen_calls: Mutex<Vec<String>>,
    next_child_id: AtomicUsize,
    pub(crate) rendered: AtomicBool,
}

impl FakeSurface {
    pub(crate) fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            ..Default::default()
        }
    }
}

/// Installs a `tracing` subscriber for the duration of the test binary, same
/// as `crates/video-streamer/tests/support/mod.rs`'s `init_tracing`.
pub(crate) fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

impl DomCollaborator for FakeSurface {
    fn resolve_by_id(&self, id: &str) -> Option<SurfaceHandle> {
        Some(SurfaceHandle::new(id))
    }

    fn create_child_video_surface(&self, container: &SurfaceHandle) -> SurfaceHandle {
        let n = self.next_child_id.fetch_add(1, Ordering::SeqCst);
        SurfaceHandle::new(format!("{}-video-{n}", container.0))
    }

    fn apply_class(&self, _handle: &SurfaceHandle, _class: &str) {}
    fn remove_class(&self, _handle: &SurfaceHandle, _class: &str) {}
    fn set_muted_and_playsinline(&self, _handle: &SurfaceHandle) {}

    fn clear_source(&self, handle: &SurfaceHandle) {
        self.detach_calls.lock().push(format!("clear:{}", handle.0));
    }

    fn detach(&self, handle: &SurfaceHandle) {
        self.detach_calls.lock().push(format!("detach:{}", handle.0));
    }

    fn is_document_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn request_fullscreen(&self, container: &SurfaceHandle) {
        self.fullscreen_calls.lock().push(format!("enter:{}", container.0));
    }

    fn exit_fullscreen(&self) {
        self.fullscreen_calls.lock().push("exit".to_owned());
    }

    fn append_segment(&self, _handle: &SurfaceHandle, _data: &[u8]) -> AppendOutcome {
        AppendOutcome::Ok
    }

    fn evict_oldest_buffered_range(&self, _handle: &SurfaceHandle, _threshold: Duration) {}

    fn has_rendered_frame(&self, _handle: &SurfaceHandle) -> bool {
        self.rendered.load(Ordering::SeqCst)
    }

    fn video_info(&self, _handle: &SurfaceHandle) -> Option<VideoInfo> {
        None
    }
}

/// A `ResyncPublisher` fake that just counts how many times a resync was
/// requested.
pub(crate) struct FakeResync(pub(crate) Arc<AtomicUsize>);

#[async_trait::async_trait]
impl ResyncPublisher for FakeResync {
    async fn publish_resync(&self) -> Result<(), ClspError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `Conduit` fake: publishes are no-ops, `resync_handle` hands out a
/// [`FakeResync`] sharing the connector's own call counter.
pub(crate) struct FakeConduit {
    resync_calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Conduit for FakeConduit {
    async fn publish_play(&self) -> Result<(), ClspError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClspError> {
        Ok(())
    }

    fn resync_handle(&self) -> Arc<dyn ResyncPublisher> {
        Arc::new(FakeResync(Arc::clone(&self.resync_calls)))
    }
}

/// A `ConduitConnector` fake standing in for a live MQTT-over-WS connection
/// (spec.md §1 keeps the real transport out of scope for this suite). Each
/// `connect()` call hands out the next queued event channel; a test pushes
/// `ConduitEvent`s through the matching sender to drive a player through its
/// state machine without a live broker. Connecting past the last queued
/// channel fails, so a test can also exercise exhausted-reconnect behavior.
pub(crate) struct FakeConduitConnector {
    channels: Mutex<VecDeque<mpsc::Receiver<clsp_client::ConduitEvent>>>,
    pub(crate) resync_calls: Arc<AtomicUsize>,
    pub(crate) connect_attempts: Arc<AtomicUsize>,
}

impl FakeConduitConnector {
    /// Builds a connector with `n` pre-wired connections, returning the
    /// connector (wrap in `Arc` to hand to `Registry`/`IovSession`/`Player`)
    /// alongside the event senders, in connect order.
    pub(crate) fn with_connections(n: usize) -> (Self, Vec<mpsc::Sender<clsp_client::ConduitEvent>>) {
        let mut channels = VecDeque::new();
        let mut senders = Vec::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(64);
            channels.push_back(rx);
            senders.push(tx);
        }
        (
            Self {
                channels: Mutex::new(channels),
                resync_calls: Arc::new(AtomicUsize::new(0)),
                connect_attempts: Arc::new(AtomicUsize::new(0)),
            },
            senders,
        )
    }
}

#[async_trait::async_trait]
impl ConduitConnector for FakeConduitConnector {
    async fn connect(
        &self,
        _stream_config: &StreamConfiguration,
    ) -> Result<(Box<dyn Conduit>, mpsc::Receiver<clsp_client::ConduitEvent>), ClspError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let events = self
            .channels
            .lock()
            .pop_front()
            .ok_or_else(|| ClspError::TransportError("no more fake connections queued".to_owned()))?;
        Ok((
            Box::new(FakeConduit {
                resync_calls: Arc::clone(&self.resync_calls),
            }),
            events,
        ))
    }
}
