//! C2 — Event Bus: a bounded-name pub/sub used by every stateful component.
//!
//! Rust gives each payload shape for free via a closed enum, so "subscribing
//! to an unlisted name" can't slip past the type checker the way it could in
//! the source's stringly-typed emitter. What the bus still enforces at
//! runtime, matching spec.md §4.2: a component declares the closed set of
//! [`EventKind`]s it is willing to emit; subscribing to a kind outside that
//! set fails with [`ClspError::UnknownEvent`], and subscribing with no
//! handler fails with [`ClspError::MissingHandler`]. Delivery is synchronous
//! and in registration order; a handler returning `Err` is logged and does
//! not stop delivery to the remaining handlers.

use std::collections::HashMap;

use crate::error::ClspError;
use crate::id::PlayerId;

/// The full event vocabulary flowing through the session core (spec.md
/// §4.4, §4.5, §4.7, §4.8). Individual components only ever whitelist a
/// subset of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Metric,
    FirstFrameShown,
    VideoReceived,
    VideoInfoReceived,
    IframeDestroyedExternally,
    /// Wire name is `REINITIALZE_ERROR` verbatim (spec.md §4.5) to preserve
    /// compatibility with the wire-level name the source protocol uses.
    ReinitializeError,
    NoStreamConfiguration,
    RetryError,
    Connected,
    Disconnected,
    InitSegment,
    MediaSegment,
    ReconnectNeeded,
    RetryBudgetExhausted,
}

impl EventKind {
    /// The exact wire-level name, preserved verbatim including the source's
    /// misspelling where applicable (spec.md §4.5).
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Metric => "METRIC",
            Self::FirstFrameShown => "FIRST_FRAME_SHOWN",
            Self::VideoReceived => "VIDEO_RECEIVED",
            Self::VideoInfoReceived => "VIDEO_INFO_RECEIVED",
            Self::IframeDestroyedExternally => "IFRAME_DESTROYED_EXTERNALLY",
            Self::ReinitializeError => "REINITIALZE_ERROR",
            Self::NoStreamConfiguration => "NO_STREAM_CONFIGURATION",
            Self::RetryError => "RETRY_ERROR",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::InitSegment => "INIT_SEGMENT",
            Self::MediaSegment => "MEDIA_SEGMENT",
            Self::ReconnectNeeded => "RECONNECT_NEEDED",
            Self::RetryBudgetExhausted => "RETRY_BUDGET_EXHAUSTED",
        }
    }
}

/// The payload carried for each [`EventKind`]. A sum type, as recommended by
/// spec.md §9 ("sum-type variants for event payloads").
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Metric { name: String },
    FirstFrameShown { player_id: PlayerId },
    VideoReceived,
    VideoInfoReceived { codec: String, width: u32, height: u32 },
    IframeDestroyedExternally,
    ReinitializeError,
    NoStreamConfiguration,
    RetryError,
    Connected,
    Disconnected,
    InitSegment { len: usize },
    MediaSegment { len: usize, duration_ms: u64 },
    ReconnectNeeded,
    RetryBudgetExhausted,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Metric { .. } => EventKind::Metric,
            Self::FirstFrameShown { .. } => EventKind::FirstFrameShown,
            Self::VideoReceived => EventKind::VideoReceived,
            Self::VideoInfoReceived { .. } => EventKind::VideoInfoReceived,
            Self::IframeDestroyedExternally => EventKind::IframeDestroyedExternally,
            Self::ReinitializeError => EventKind::ReinitializeError,
            Self::NoStreamConfiguration => EventKind::NoStreamConfiguration,
            Self::RetryError => EventKind::RetryError,
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::InitSegment { .. } => EventKind::InitSegment,
            Self::MediaSegment { .. } => EventKind::MediaSegment,
            Self::ReconnectNeeded => EventKind::ReconnectNeeded,
            Self::RetryBudgetExhausted => EventKind::RetryBudgetExhausted,
        }
    }
}

type Handler = Box<dyn Fn(&SessionEvent) -> Result<(), String> + Send + Sync>;

/// A pub/sub bus scoped to a single whitelist of event kinds, matching one
/// component's declared vocabulary.
pub struct EventBus {
    allowed: &'static [EventKind],
    listeners: HashMap<EventKind, Vec<Handler>>,
}

impl EventBus {
    pub fn new(allowed: &'static [EventKind]) -> Self {
        Self {
            allowed,
            listeners: HashMap::new(),
        }
    }

    fn is_allowed(&self, kind: EventKind) -> bool {
        self.allowed.contains(&kind)
    }

    /// Registers `handler` for `kind`. Fails with `UnknownEvent` if `kind`
    /// isn't in this bus's whitelist.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        if !self.is_allowed(kind) {
            return Err(ClspError::UnknownEvent(kind.wire_name().to_owned()));
        }
        self.listeners.entry(kind).or_default().push(Box::new(handler));
        Ok(())
    }

    /// Same as [`EventBus::subscribe`] but used where the source models
    /// "subscribing with no handler" as a distinct failure mode — exposed so
    /// callers constructing a handler list dynamically (e.g. from a
    /// deserialized config) can reject an empty list with `MissingHandler`
    /// before ever calling `subscribe`.
    pub fn subscribe_many<F>(&mut self, kind: EventKind, handlers: Vec<F>) -> Result<(), ClspError>
    where
        F: Fn(&SessionEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        if handlers.is_empty() {
            return Err(ClspError::MissingHandler);
        }
        for handler in handlers {
            self.subscribe(kind, handler)?;
        }
        Ok(())
    }

    /// Delivers `event` to every listener registered for its kind, in
    /// registration order. A handler error is logged and does not abort
    /// delivery to the remaining handlers (spec.md §4.2).
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        let Some(handlers) = self.listeners.get(&kind) else {
            return;
        };
        for handler in handlers {
            if let Err(error) = handler(&event) {
                tracing::error!(event = kind.wire_name(), %error, "event handler failed");
            }
        }
    }

    /// Called exactly once during destruction (spec.md §4.2).
    pub fn remove_all_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }
}
