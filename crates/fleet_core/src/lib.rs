//! Concurrent client fleet for load testing a voice chat server.
//!
//! [`Fleet`] wires the pieces together: the [`FleetSupervisor`] fills the
//! [`FleetRegistry`], the [`CommandDispatcher`] fans operator commands out
//! over a registry snapshot, and the [`AudioBroadcaster`] starts independent
//! playbacks and reports how they ended.

use std::{sync::Arc, time::Duration};

use shared::protocol::PlaybackEvent;
use tokio::sync::broadcast;
use voice_integration::{AudioSourceOpener, VoiceConnector};

pub mod audio_broadcast;
pub mod backoff;
pub mod dispatcher;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use audio_broadcast::{AudioBroadcast, AudioBroadcaster};
pub use backoff::{BackoffPolicy, RetryPolicy};
pub use dispatcher::{CommandDispatcher, ResolvedTargets};
pub use registry::FleetRegistry;
pub use session::{AudioHandle, DisconnectStatus, Session, SessionContext};
pub use supervisor::{FleetSupervisor, SpawnRequest, DEFAULT_USERNAME_PREFIX};

pub const PLAYBACK_EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct Fleet {
    registry: FleetRegistry,
    supervisor: FleetSupervisor,
    dispatcher: CommandDispatcher,
    broadcaster: AudioBroadcaster,
}

impl Fleet {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        audio: Arc<dyn AudioSourceOpener>,
        connect_timeout: Duration,
    ) -> Self {
        let (playback_events, _) = broadcast::channel::<PlaybackEvent>(PLAYBACK_EVENT_BUFFER);
        let registry = FleetRegistry::new();
        let context = SessionContext {
            connector,
            audio,
            playback_events: playback_events.clone(),
            connect_timeout,
        };
        let dispatcher = CommandDispatcher::new(registry.clone());
        Self {
            supervisor: FleetSupervisor::new(registry.clone(), context),
            broadcaster: AudioBroadcaster::new(dispatcher.clone(), playback_events),
            dispatcher,
            registry,
        }
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &FleetSupervisor {
        &self.supervisor
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn broadcaster(&self) -> &AudioBroadcaster {
        &self.broadcaster
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
