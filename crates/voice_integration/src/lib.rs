//! Boundary between the fleet and whatever speaks the voice protocol on the wire.
//!
//! A [`VoiceConnector`] opens one connection per client and hands back the
//! transport together with the ordered event channel for that connection.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, Credentials, ServerAddress, TlsPolicy},
    error::{ConnectError, SendError},
};
use tokio::sync::mpsc;

pub mod audio;
pub mod loopback;

pub use audio::{
    AudioSourceOpener, DecodedFrameStream, PcmFrame, WavSourceOpener, DEFAULT_FRAME_DURATION,
};
pub use loopback::{LoopbackConnector, LoopbackOptions, LoopbackServer, LoopbackStats};

/// Capacity of the per-connection event channel.
pub const TRANSPORT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: ServerAddress,
    pub credentials: Credentials,
    pub tls: TlsPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerWelcome {
    pub welcome_text: String,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ChannelChanged {
        channel_id: ChannelId,
    },
    TextReceived {
        sender: Option<String>,
        channel_id: ChannelId,
        body: String,
    },
    Closed {
        reason: String,
    },
}

/// A freshly established connection. `events` yields in the order the server
/// produced them and is closed when the connection goes away.
pub struct TransportConnection {
    pub transport: Arc<dyn VoiceTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
    pub welcome: ServerWelcome,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn send_text(&self, channel_id: ChannelId, body: &str) -> Result<(), SendError>;
    async fn send_audio_frame(&self, frame: &PcmFrame) -> Result<(), SendError>;
    async fn disconnect(&self) -> Result<(), SendError>;
}

#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<TransportConnection, ConnectError>;
}
