//! One simulated client and everything it owns: transport, status, playback.

use std::{
    path::Path,
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{ChannelId, ClientId, SessionState, SessionStatus},
    error::{AudioError, ConnectError, SendError},
    protocol::{PlaybackEvent, PlaybackId, SessionEvent},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use voice_integration::{
    AudioSourceOpener, ConnectOptions, DecodedFrameStream, TransportConnection, TransportEvent,
    VoiceConnector, VoiceTransport,
};

const SESSION_EVENT_BUFFER: usize = 64;
const PLAYBACK_BUFFER_FRAMES: usize = 32;

/// Dependencies shared by every session of a fleet.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn VoiceConnector>,
    pub audio: Arc<dyn AudioSourceOpener>,
    pub playback_events: broadcast::Sender<PlaybackEvent>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioHandle {
    pub client_id: ClientId,
    pub playback_id: PlaybackId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStatus {
    Closed,
    AlreadyClosed,
    /// The peer did not confirm before the deadline; the close keeps running detached.
    Abandoned,
}

struct ActivePlayback {
    handle: AudioHandle,
    stop: oneshot::Sender<()>,
}

pub struct Session {
    id: ClientId,
    name: String,
    options: ConnectOptions,
    context: SessionContext,
    status: watch::Sender<SessionStatus>,
    transport: Mutex<Option<Arc<dyn VoiceTransport>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    playback: Mutex<Option<ActivePlayback>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(id: ClientId, options: ConnectOptions, context: SessionContext) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::connecting());
        let (events, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        Arc::new(Self {
            id,
            name: options.credentials.username.clone(),
            options,
            context,
            status,
            transport: Mutex::new(None),
            event_task: Mutex::new(None),
            playback: Mutex::new(None),
            events,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.status.borrow().channel_id
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_playing(&self) -> bool {
        self.playback.lock().await.is_some()
    }

    /// Connects, or reconnects after a failed attempt. A connected session is left as is.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        self.status.send_modify(|status| status.state = SessionState::Connecting);

        let attempt = tokio::time::timeout(
            self.context.connect_timeout,
            self.context.connector.connect(self.options.clone()),
        )
        .await
        .unwrap_or(Err(ConnectError::Timeout));

        let TransportConnection {
            transport,
            events,
            welcome,
        } = match attempt {
            Ok(connection) => connection,
            Err(err) => {
                debug!(client_id = self.id.0, error = %err, "session: connect attempt failed");
                self.status.send_modify(|status| {
                    status.state = SessionState::Failed;
                    status.last_error = Some(err.to_string());
                });
                return Err(err);
            }
        };

        *self.transport.lock().await = Some(transport);
        self.status.send_modify(|status| {
            status.state = SessionState::Connected;
            status.channel_id = Some(welcome.channel_id);
            status.last_error = None;
            status.welcome_text = Some(welcome.welcome_text.clone());
        });
        info!(
            client_id = self.id.0,
            name = %self.name,
            welcome = %welcome.welcome_text,
            "session: connected"
        );
        let _ = self.events.send(SessionEvent::Connected {
            welcome_text: welcome.welcome_text,
            channel_id: welcome.channel_id,
        });

        let task = self.spawn_event_pump(events);
        if let Some(previous) = self.event_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::ChannelChanged { channel_id } => {
                        session
                            .status
                            .send_modify(|status| status.channel_id = Some(channel_id));
                        debug!(
                            client_id = session.id.0,
                            channel_id = channel_id.0,
                            "session: channel changed"
                        );
                        let _ = session
                            .events
                            .send(SessionEvent::ChannelChanged { channel_id });
                    }
                    TransportEvent::TextReceived {
                        sender,
                        channel_id,
                        body,
                    } => {
                        let _ = session.events.send(SessionEvent::TextReceived {
                            sender,
                            channel_id,
                            body,
                        });
                    }
                    TransportEvent::Closed { reason } => {
                        session.mark_disconnected(reason).await;
                        return;
                    }
                }
            }
            session
                .mark_disconnected("transport event stream ended".to_string())
                .await;
        })
    }

    async fn mark_disconnected(&self, reason: String) {
        let was_connected = self.status.send_if_modified(|status| {
            if status.state != SessionState::Connected {
                return false;
            }
            status.state = SessionState::Disconnected;
            status.last_error = Some(reason.clone());
            true
        });
        if !was_connected {
            return;
        }

        self.transport.lock().await.take();
        self.stop_audio(None).await;
        warn!(client_id = self.id.0, %reason, "session: disconnected by server");
        let _ = self.events.send(SessionEvent::Disconnected { reason });
    }

    async fn live_transport(&self) -> Option<Arc<dyn VoiceTransport>> {
        if !self.is_connected() {
            return None;
        }
        self.transport.lock().await.clone()
    }

    /// Sends to the channel the session currently sits in.
    pub async fn send_text(&self, body: &str) -> Result<(), SendError> {
        let transport = self.live_transport().await.ok_or(SendError::NotConnected)?;
        let channel_id = self.channel_id().unwrap_or(ChannelId::ROOT);
        transport.send_text(channel_id, body).await?;
        debug!(client_id = self.id.0, channel_id = channel_id.0, "session: text sent");
        Ok(())
    }

    /// Starts streaming `source` from a fresh decoder. Any playback already running
    /// on this session is stopped first. Completion arrives on the fleet's playback
    /// event channel.
    pub async fn start_audio(self: &Arc<Self>, source: &Path) -> Result<AudioHandle, AudioError> {
        self.start_audio_reporting(source, None).await
    }

    /// Like [`Session::start_audio`], and additionally delivers the completion
    /// event to `report`, which never drops events.
    pub(crate) async fn start_audio_reporting(
        self: &Arc<Self>,
        source: &Path,
        report: Option<mpsc::UnboundedSender<PlaybackEvent>>,
    ) -> Result<AudioHandle, AudioError> {
        let transport = self.live_transport().await.ok_or(AudioError::NotConnected)?;

        let opener = Arc::clone(&self.context.audio);
        let path = source.to_path_buf();
        let stream = tokio::task::spawn_blocking(move || opener.open_source(&path))
            .await
            .map_err(|err| AudioError::DecodeFailed(format!("decoder task failed: {err}")))??;

        let handle = AudioHandle {
            client_id: self.id,
            playback_id: PlaybackId::new(),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut playback = self.playback.lock().await;
            let previous = playback.replace(ActivePlayback {
                handle,
                stop: stop_tx,
            });
            if let Some(previous) = previous {
                let _ = previous.stop.send(());
            }
        }

        tokio::spawn(run_playback(
            Arc::downgrade(self),
            handle,
            transport,
            stream,
            stop_rx,
            self.context.playback_events.clone(),
            report,
        ));
        info!(
            client_id = self.id.0,
            source = %source.display(),
            "session: playback started"
        );
        Ok(handle)
    }

    /// Stops the given playback, or whatever is playing when `handle` is `None`.
    /// Nothing playing is not an error.
    pub async fn stop_audio(&self, handle: Option<AudioHandle>) {
        let mut playback = self.playback.lock().await;
        let matches = match (playback.as_ref(), handle) {
            (Some(active), Some(handle)) => active.handle == handle,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return;
        }
        if let Some(active) = playback.take() {
            let _ = active.stop.send(());
        }
    }

    async fn finish_playback(&self, playback_id: PlaybackId) {
        let mut playback = self.playback.lock().await;
        if matches!(playback.as_ref(), Some(active) if active.handle.playback_id == playback_id) {
            playback.take();
        }
    }

    /// Marks the session closed right away and gives the peer `deadline` to
    /// acknowledge the disconnect.
    pub async fn disconnect(&self, deadline: Duration) -> DisconnectStatus {
        let was_connected = self.status.send_if_modified(|status| {
            if status.state != SessionState::Connected {
                return false;
            }
            status.state = SessionState::Disconnected;
            true
        });

        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.stop_audio(None).await;
        let transport = self.transport.lock().await.take();

        let Some(transport) = transport.filter(|_| was_connected) else {
            return DisconnectStatus::AlreadyClosed;
        };
        let _ = self.events.send(SessionEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });

        let pending = tokio::spawn(async move { transport.disconnect().await });
        match tokio::time::timeout(deadline, pending).await {
            Ok(Ok(Ok(()))) => {
                debug!(client_id = self.id.0, "session: disconnected");
                DisconnectStatus::Closed
            }
            Ok(Ok(Err(err))) => {
                debug!(client_id = self.id.0, error = %err, "session: transport already gone");
                DisconnectStatus::Closed
            }
            Ok(Err(err)) => {
                warn!(client_id = self.id.0, error = %err, "session: disconnect task failed");
                DisconnectStatus::Closed
            }
            Err(_) => {
                warn!(
                    client_id = self.id.0,
                    deadline_ms = deadline.as_millis() as u64,
                    "session: disconnect abandoned after deadline"
                );
                DisconnectStatus::Abandoned
            }
        }
    }
}

async fn run_playback(
    session: Weak<Session>,
    handle: AudioHandle,
    transport: Arc<dyn VoiceTransport>,
    stream: DecodedFrameStream,
    mut stop: oneshot::Receiver<()>,
    completions: broadcast::Sender<PlaybackEvent>,
    report: Option<mpsc::UnboundedSender<PlaybackEvent>>,
) {
    let AudioHandle {
        client_id,
        playback_id,
    } = handle;
    let (frames_tx, mut frames_rx) = mpsc::channel(PLAYBACK_BUFFER_FRAMES);
    tokio::task::spawn_blocking(move || {
        for frame in stream {
            if frames_tx.blocking_send(frame).is_err() {
                break;
            }
        }
    });

    let mut frames_sent = 0u64;
    let mut next_frame_at = Instant::now();
    let event = loop {
        let frame = tokio::select! {
            _ = &mut stop => break PlaybackEvent::Stopped { client_id, playback_id, frames_sent },
            frame = frames_rx.recv() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                break PlaybackEvent::Error {
                    client_id,
                    playback_id,
                    reason: err.to_string(),
                }
            }
            None => {
                break PlaybackEvent::Finished {
                    client_id,
                    playback_id,
                    frames_sent,
                }
            }
        };

        let sent = tokio::select! {
            _ = &mut stop => break PlaybackEvent::Stopped { client_id, playback_id, frames_sent },
            sent = transport.send_audio_frame(&frame) => sent,
        };
        if let Err(err) = sent {
            break PlaybackEvent::Error {
                client_id,
                playback_id,
                reason: err.to_string(),
            };
        }
        frames_sent += 1;

        next_frame_at += frame.duration();
        tokio::select! {
            _ = &mut stop => break PlaybackEvent::Stopped { client_id, playback_id, frames_sent },
            _ = tokio::time::sleep_until(next_frame_at) => {}
        }
    };
    drop(frames_rx);

    if let Some(session) = session.upgrade() {
        session.finish_playback(playback_id).await;
    }
    match &event {
        PlaybackEvent::Error { reason, .. } => {
            warn!(client_id = client_id.0, %reason, "session: playback failed")
        }
        _ => debug!(client_id = client_id.0, frames_sent, "session: playback ended"),
    }
    if let Some(report) = report {
        let _ = report.send(event.clone());
    }
    let _ = completions.send(event);
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
