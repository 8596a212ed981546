//! C4 — MQTT Conduit: one MQTT-over-WebSocket connection to an SFS.
//!
//! Grounded on `jmux-proxy`'s scheduler-task-owns-state shape
//! (`jmux-proxy/src/lib.rs`): one task drives the transport's event loop and
//! forwards everything of interest through an mpsc channel, while publishes
//! go out through the client handle directly (rumqttc's `AsyncClient` is
//! already a cheap, cloneable handle, playing the same role as jmux's
//! `msg_to_send_tx`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use clsp_task::ChildTask;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::StreamConfiguration;
use crate::destroyable::Destroyable;
use crate::error::ClspError;

/// Events the conduit forwards upward to the player (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum ConduitEvent {
    Connected,
    Disconnected,
    InitSegment(Bytes),
    MediaSegment { data: Bytes, duration: Duration },
    ReconnectNeeded,
    IframeDestroyedExternally,
}

#[derive(Debug, Clone)]
struct ConduitTopics {
    play: String,
    resync: String,
    stop: String,
    init: String,
    media: String,
}

impl ConduitTopics {
    fn derive(stream_name: &str, session_guid: Uuid) -> Self {
        let base = format!("clsp/{stream_name}/{session_guid}");
        Self {
            play: format!("{base}/play"),
            resync: format!("{base}/resync"),
            stop: format!("{base}/stop"),
            init: format!("{base}/init"),
            media: format!("{base}/media"),
        }
    }
}

pub struct MqttConduit {
    client: AsyncClient,
    topics: ConduitTopics,
    guard: clsp_task::DestroyGuard,
    _event_loop_task: ChildTask<()>,
}

/// A cheap, cloneable handle that can publish a resync request on its own,
/// without holding onto the conduit's event-loop task. Handed to the player
/// so the buffer feeder can ask for a resync from inside its own background
/// task (spec.md §4.5: "drops from the head and emits a resync request to
/// the conduit" on append-queue overrun).
#[derive(Clone)]
pub struct ResyncHandle {
    client: AsyncClient,
    topic: String,
}

impl ResyncHandle {
    pub async fn publish_resync(&self) -> Result<(), ClspError> {
        publish_empty(&self.client, &self.topic).await
    }
}

#[async_trait::async_trait]
impl ResyncPublisher for ResyncHandle {
    async fn publish_resync(&self) -> Result<(), ClspError> {
        ResyncHandle::publish_resync(self).await
    }
}

async fn publish_empty(client: &AsyncClient, topic: &str) -> Result<(), ClspError> {
    client
        .publish(topic, QoS::AtLeastOnce, false, Vec::new())
        .await
        .map_err(|e| ClspError::TransportError(e.to_string()))
}

/// Object-safe counterpart to [`ResyncHandle`], so the player's event loop can
/// hold a resync publisher without caring whether it is talking to a real
/// `MqttConduit` or a test fake.
#[async_trait::async_trait]
pub trait ResyncPublisher: Send + Sync {
    async fn publish_resync(&self) -> Result<(), ClspError>;
}

/// Object-safe counterpart to `MqttConduit`, letting [`crate::player::Player`]
/// be constructed against a fake transport in tests the same way
/// `DomCollaborator` stands in for the DOM.
#[async_trait::async_trait]
pub trait Conduit: Send + Sync {
    async fn publish_play(&self) -> Result<(), ClspError>;
    async fn stop(&self) -> Result<(), ClspError>;
    fn resync_handle(&self) -> Arc<dyn ResyncPublisher>;
}

#[async_trait::async_trait]
impl Conduit for MqttConduit {
    async fn publish_play(&self) -> Result<(), ClspError> {
        MqttConduit::publish_play(self).await
    }

    async fn stop(&self) -> Result<(), ClspError> {
        MqttConduit::stop(self).await
    }

    fn resync_handle(&self) -> Arc<dyn ResyncPublisher> {
        Arc::new(MqttConduit::resync_handle(self))
    }
}

/// Connects a fresh [`Conduit`] for a given stream target. The production
/// implementation is [`MqttConduitConnector`]; tests substitute a fake the
/// same way they substitute a fake `DomCollaborator`.
#[async_trait::async_trait]
pub trait ConduitConnector: Send + Sync {
    async fn connect(&self, stream_config: &StreamConfiguration) -> Result<(Box<dyn Conduit>, mpsc::Receiver<ConduitEvent>), ClspError>;
}

#[derive(Default)]
pub struct MqttConduitConnector;

#[async_trait::async_trait]
impl ConduitConnector for MqttConduitConnector {
    async fn connect(&self, stream_config: &StreamConfiguration) -> Result<(Box<dyn Conduit>, mpsc::Receiver<ConduitEvent>), ClspError> {
        let (conduit, events) = MqttConduit::connect(stream_config).await?;
        Ok((Box::new(conduit), events))
    }
}

impl MqttConduit {
    /// Connects to the SFS derived from `stream_config`, subscribes to the
    /// init/media topics for a fresh per-session GUID, and returns a channel
    /// of forwarded events alongside the conduit handle.
    pub async fn connect(stream_config: &StreamConfiguration) -> Result<(Self, mpsc::Receiver<ConduitEvent>), ClspError> {
        let session_guid = Uuid::new_v4();
        let client_id = format!("clsp-{session_guid}");
        let topics = ConduitTopics::derive(stream_config.stream_name(), session_guid);

        let mut mqtt_options = MqttOptions::new(client_id, stream_config.websocket_url(), 0);
        mqtt_options.set_transport(Transport::Ws);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 64);

        client
            .subscribe(&topics.init, QoS::AtLeastOnce)
            .await
            .map_err(|e| ClspError::TransportError(e.to_string()))?;
        client
            .subscribe(&topics.media, QoS::AtLeastOnce)
            .await
            .map_err(|e| ClspError::TransportError(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let forward_topics = topics.clone();
        let reconnect_emitted = Arc::new(AtomicBool::new(false));

        let event_loop_task = ChildTask::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        reconnect_emitted.store(false, Ordering::SeqCst);
                        if event_tx.send(ConduitEvent::Connected).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.payload.is_empty() {
                            tracing::warn!(topic = %publish.topic, "dropping malformed (empty) payload");
                            continue;
                        }

                        let forwarded = if publish.topic == forward_topics.init {
                            Some(ConduitEvent::InitSegment(Bytes::from(publish.payload)))
                        } else if publish.topic == forward_topics.media {
                            Some(ConduitEvent::MediaSegment {
                                data: Bytes::from(publish.payload),
                                duration: Duration::from_millis(0),
                            })
                        } else {
                            tracing::warn!(topic = %publish.topic, "dropping payload on unrecognized topic");
                            None
                        };

                        if let Some(event) = forwarded {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        if event_tx.send(ConduitEvent::Disconnected).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "mqtt event loop error");
                        // Emitted exactly once per dropped connection (spec.md §4.4);
                        // the latch resets on the next successful ConnAck.
                        if !reconnect_emitted.swap(true, Ordering::SeqCst) {
                            if event_tx.send(ConduitEvent::ReconnectNeeded).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                topics,
                guard: clsp_task::DestroyGuard::new(),
                _event_loop_task: event_loop_task,
            },
            event_rx,
        ))
    }

    pub async fn publish_play(&self) -> Result<(), ClspError> {
        publish_empty(&self.client, &self.topics.play).await
    }

    /// A handle capable of publishing a resync independently of this
    /// conduit's lifetime in a caller-held lock (see [`ResyncHandle`]).
    pub fn resync_handle(&self) -> ResyncHandle {
        ResyncHandle {
            client: self.client.clone(),
            topic: self.topics.resync.clone(),
        }
    }

    async fn publish_stop(&self) -> Result<(), ClspError> {
        publish_empty(&self.client, &self.topics.stop).await
    }

    async fn unsubscribe_all(&self) -> Result<(), ClspError> {
        self.client
            .unsubscribe(&self.topics.init)
            .await
            .map_err(|e| ClspError::TransportError(e.to_string()))?;
        self.client
            .unsubscribe(&self.topics.media)
            .await
            .map_err(|e| ClspError::TransportError(e.to_string()))
    }

    /// `stop()` contract from spec.md §4.5: publish stop, unsubscribe, disconnect.
    pub async fn stop(&self) -> Result<(), ClspError> {
        if let Err(error) = self.publish_stop().await {
            tracing::warn!(%error, "failed to publish stop, continuing teardown");
        }
        if let Err(error) = self.unsubscribe_all().await {
            tracing::warn!(%error, "failed to unsubscribe, continuing teardown");
        }
        self.client
            .disconnect()
            .await
            .map_err(|e| ClspError::TransportError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Destroyable for MqttConduit {
    async fn destroy(&self) -> Result<(), ClspError> {
        if !self.guard.trigger() {
            self.guard.wait().await;
            return Ok(());
        }
        let result = self.stop().await;
        self.guard.complete();
        result
    }

    fn is_destroyed(&self) -> bool {
        self.guard.is_complete()
    }
}
