//! Session lifecycle and transport core for a browser-embedded CLSP
//! streaming video client. Everything that is actually "the DOM" is kept
//! behind the [`surface::DomCollaborator`] trait; this crate owns the wire
//! protocol, player state machine, and session orchestration around it.

mod config;
mod conduit;
mod destroyable;
mod error;
mod event_bus;
mod id;
mod player;
mod player_collection;
mod registry;
mod session;
mod surface;

pub use conduit::{Conduit, ConduitConnector, ConduitEvent, MqttConduitConnector, ResyncPublisher};
pub use config::{GlobalConfig, GlobalConfigDto, Scheme, StreamConfiguration};
pub use destroyable::Destroyable;
pub use error::{ClspError, ClspResult};
pub use event_bus::{EventKind, SessionEvent};
pub use id::{PlayerId, SessionId};
pub use player::PlayerState;
pub use registry::{Registry, RegistryHandle, global_if_installed, install};
pub use session::{ChangeSrcTarget, IovSession};
pub use surface::{AppendOutcome, CONTAINER_CLASS, DomCollaborator, ResolvedSurfaces, SurfaceConfig, SurfaceHandle, VIDEO_CLASS, VideoInfo};
