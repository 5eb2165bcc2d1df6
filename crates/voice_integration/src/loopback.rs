//! In-process stand-in for a voice server.
//!
//! Implements the server-side rules a load test trips over (password check,
//! username uniqueness, user cap, certificate trust) and relays text between
//! users sharing a channel. Used for dry runs of the binary and by tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, TlsPolicy},
    error::{ConnectError, SendError},
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

use crate::{
    ConnectOptions, PcmFrame, ServerWelcome, TransportConnection, TransportEvent, VoiceConnector,
    VoiceTransport, TRANSPORT_EVENT_BUFFER,
};

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub welcome_text: String,
    /// Added to connect, text and disconnect round trips.
    pub latency: Duration,
    pub password: Option<String>,
    pub max_users: Option<usize>,
    /// Strict TLS clients are only accepted when this is set.
    pub trusted_certificate: bool,
    pub channels: Vec<(ChannelId, String)>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            welcome_text: "Welcome to the mumchmark loopback server.".to_string(),
            latency: Duration::ZERO,
            password: None,
            max_users: None,
            trusted_certificate: false,
            channels: vec![
                (ChannelId::ROOT, "Root".to_string()),
                (ChannelId(1), "Lobby".to_string()),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connects: u64,
    pub rejected: u64,
    pub text_messages: u64,
    pub audio_frames: u64,
}

struct LoopbackUser {
    session: u64,
    channel_id: ChannelId,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct ServerState {
    users: HashMap<String, LoopbackUser>,
    next_session: u64,
}

pub struct LoopbackServer {
    options: LoopbackOptions,
    state: Mutex<ServerState>,
    connects: AtomicU64,
    rejected: AtomicU64,
    text_messages: AtomicU64,
    audio_frames: AtomicU64,
}

impl LoopbackServer {
    pub fn new(options: LoopbackOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Mutex::new(ServerState::default()),
            connects: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            text_messages: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
        })
    }

    pub fn connector(self: &Arc<Self>) -> LoopbackConnector {
        LoopbackConnector {
            server: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            connects: self.connects.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            text_messages: self.text_messages.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
        }
    }

    pub async fn connected_users(&self) -> Vec<String> {
        let mut users = self
            .state
            .lock()
            .await
            .users
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        users.sort();
        users
    }

    /// Moves a user the way an admin drag in a client would.
    pub async fn move_user(&self, username: &str, channel_id: ChannelId) -> bool {
        if !self.has_channel(channel_id) {
            return false;
        }
        let mut state = self.state.lock().await;
        let Some(user) = state.users.get_mut(username) else {
            return false;
        };
        user.channel_id = channel_id;
        let _ = user
            .events
            .try_send(TransportEvent::ChannelChanged { channel_id });
        true
    }

    pub async fn kick(&self, username: &str, reason: &str) -> bool {
        let Some(user) = self.state.lock().await.users.remove(username) else {
            return false;
        };
        info!(username, reason, "loopback: kicked user");
        let _ = user.events.try_send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
        true
    }

    fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.options
            .channels
            .iter()
            .any(|(candidate, _)| *candidate == channel_id)
    }

    fn reject(&self, err: ConnectError) -> ConnectError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(error = %err, "loopback: rejected connection");
        err
    }

    async fn accept(
        self: &Arc<Self>,
        options: ConnectOptions,
    ) -> Result<TransportConnection, ConnectError> {
        if !self.options.latency.is_zero() {
            tokio::time::sleep(self.options.latency).await;
        }

        if options.tls == TlsPolicy::Strict && !self.options.trusted_certificate {
            return Err(self.reject(ConnectError::Tls(
                "server certificate is not trusted".to_string(),
            )));
        }

        let username = options.credentials.username.trim().to_string();
        if username.is_empty() {
            return Err(self.reject(ConnectError::AuthRejected("invalid username".to_string())));
        }
        if let Some(expected) = &self.options.password {
            if options.credentials.password.as_ref() != Some(expected) {
                return Err(self.reject(ConnectError::AuthRejected(
                    "wrong server password".to_string(),
                )));
            }
        }

        let mut state = self.state.lock().await;
        if state.users.contains_key(&username) {
            return Err(self.reject(ConnectError::AuthRejected(
                "username already in use".to_string(),
            )));
        }
        if let Some(max_users) = self.options.max_users {
            if state.users.len() >= max_users {
                return Err(self.reject(ConnectError::Refused("server is full".to_string())));
            }
        }

        let session = state.next_session;
        state.next_session += 1;
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        state.users.insert(
            username.clone(),
            LoopbackUser {
                session,
                channel_id: ChannelId::ROOT,
                events: events_tx,
            },
        );
        drop(state);

        self.connects.fetch_add(1, Ordering::Relaxed);
        debug!(username = %username, session, "loopback: accepted connection");

        Ok(TransportConnection {
            transport: Arc::new(LoopbackTransport {
                server: Arc::clone(self),
                username,
                session,
            }),
            events: events_rx,
            welcome: ServerWelcome {
                welcome_text: self.options.welcome_text.clone(),
                channel_id: ChannelId::ROOT,
            },
        })
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    server: Arc<LoopbackServer>,
}

impl LoopbackConnector {
    pub fn server(&self) -> &Arc<LoopbackServer> {
        &self.server
    }
}

#[async_trait]
impl VoiceConnector for LoopbackConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<TransportConnection, ConnectError> {
        self.server.accept(options).await
    }
}

struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    username: String,
    session: u64,
}

impl LoopbackTransport {
    fn closed() -> SendError {
        SendError::TransportClosed("session closed by server".to_string())
    }
}

#[async_trait]
impl VoiceTransport for LoopbackTransport {
    async fn send_text(&self, channel_id: ChannelId, body: &str) -> Result<(), SendError> {
        if !self.server.options.latency.is_zero() {
            tokio::time::sleep(self.server.options.latency).await;
        }

        let state = self.server.state.lock().await;
        match state.users.get(&self.username) {
            Some(user) if user.session == self.session => {}
            _ => return Err(Self::closed()),
        }

        for (username, user) in &state.users {
            if *username == self.username || user.channel_id != channel_id {
                continue;
            }
            let delivered = user
                .events
                .try_send(TransportEvent::TextReceived {
                    sender: Some(self.username.clone()),
                    channel_id,
                    body: body.to_string(),
                })
                .is_ok();
            if !delivered {
                trace!(username = %username, "loopback: receiver lagging; dropped text");
            }
        }
        self.server.text_messages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_audio_frame(&self, _frame: &PcmFrame) -> Result<(), SendError> {
        let state = self.server.state.lock().await;
        match state.users.get(&self.username) {
            Some(user) if user.session == self.session => {
                self.server.audio_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Self::closed()),
        }
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        if !self.server.options.latency.is_zero() {
            tokio::time::sleep(self.server.options.latency).await;
        }

        let mut state = self.server.state.lock().await;
        if matches!(state.users.get(&self.username), Some(user) if user.session == self.session) {
            state.users.remove(&self.username);
            debug!(username = %self.username, "loopback: user left");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
