use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ClientId, Credentials, ServerAddress, TlsPolicy},
    error::{AudioError, ConnectError, SendError},
    protocol::{PlaybackEvent, SpawnReport},
};
use tokio::sync::{broadcast, mpsc};
use voice_integration::{
    AudioSourceOpener, ConnectOptions, DecodedFrameStream, PcmFrame, ServerWelcome,
    TransportConnection, TransportEvent, VoiceConnector, VoiceTransport, TRANSPORT_EVENT_BUFFER,
};

use crate::{
    backoff::{BackoffPolicy, RetryPolicy},
    session::{Session, SessionContext},
    supervisor::SpawnRequest,
    Fleet,
};

pub(crate) const WELCOME: &str = "welcome to the test server";

#[derive(Debug, Clone, Default)]
pub(crate) struct TransportBehavior {
    pub send_latency: Duration,
    pub hang_on_disconnect: bool,
    pub hang_on_audio: bool,
}

impl TransportBehavior {
    pub fn slow_sends(latency: Duration) -> Self {
        Self {
            send_latency: latency,
            ..Self::default()
        }
    }

    pub fn stuck_disconnect() -> Self {
        Self {
            hang_on_disconnect: true,
            ..Self::default()
        }
    }

    pub fn stuck_audio() -> Self {
        Self {
            hang_on_audio: true,
            ..Self::default()
        }
    }
}

pub(crate) struct MockTransport {
    pub username: String,
    behavior: TransportBehavior,
    texts: Mutex<Vec<(ChannelId, String)>>,
    frames: AtomicU64,
    disconnects: AtomicU32,
    events: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn texts(&self) -> Vec<(ChannelId, String)> {
        self.texts.lock().expect("texts lock").clone()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.events
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await
            .expect("session event pump alive");
    }

    pub async fn move_to(&self, channel_id: ChannelId) {
        self.events
            .send(TransportEvent::ChannelChanged { channel_id })
            .await
            .expect("session event pump alive");
    }

    pub async fn deliver_text(&self, sender: &str, body: &str) {
        self.events
            .send(TransportEvent::TextReceived {
                sender: Some(sender.to_string()),
                channel_id: ChannelId::ROOT,
                body: body.to_string(),
            })
            .await
            .expect("session event pump alive");
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn send_text(&self, channel_id: ChannelId, body: &str) -> Result<(), SendError> {
        if !self.behavior.send_latency.is_zero() {
            tokio::time::sleep(self.behavior.send_latency).await;
        }
        self.texts
            .lock()
            .expect("texts lock")
            .push((channel_id, body.to_string()));
        Ok(())
    }

    async fn send_audio_frame(&self, _frame: &PcmFrame) -> Result<(), SendError> {
        if self.behavior.hang_on_audio {
            std::future::pending::<()>().await;
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.behavior.hang_on_disconnect {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Connector whose attempts follow a script; once the script runs out every
/// attempt succeeds.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectError>>,
    behaviors: Mutex<VecDeque<TransportBehavior>>,
    connect_latency: Duration,
    attempts: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl ScriptedConnector {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn failing_first(errors: impl IntoIterator<Item = ConnectError>) -> Self {
        Self {
            script: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Behaviors handed to successful connections in connect order.
    pub fn with_behaviors(self, behaviors: impl IntoIterator<Item = TransportBehavior>) -> Self {
        *self.behaviors.lock().expect("behaviors lock") = behaviors.into_iter().collect();
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().expect("transports lock").clone()
    }

    pub fn transport(&self, username: &str) -> Arc<MockTransport> {
        self.transports()
            .into_iter()
            .find(|transport| transport.username == username)
            .expect("transport for username")
    }
}

#[async_trait]
impl VoiceConnector for ScriptedConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<TransportConnection, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !self.connect_latency.is_zero() {
            tokio::time::sleep(self.connect_latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.script.lock().expect("script lock").pop_front() {
            return Err(err);
        }

        let behavior = self
            .behaviors
            .lock()
            .expect("behaviors lock")
            .pop_front()
            .unwrap_or_default();
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let transport = Arc::new(MockTransport {
            username: options.credentials.username,
            behavior,
            texts: Mutex::new(Vec::new()),
            frames: AtomicU64::new(0),
            disconnects: AtomicU32::new(0),
            events: events_tx,
        });
        self.transports
            .lock()
            .expect("transports lock")
            .push(Arc::clone(&transport));

        Ok(TransportConnection {
            transport,
            events: events_rx,
            welcome: ServerWelcome {
                welcome_text: WELCOME.to_string(),
                channel_id: ChannelId::ROOT,
            },
        })
    }
}

/// Produces `frames` silent 10ms frames per open. `missing.wav` does not exist
/// and `broken.wav` fails after its first frame.
pub(crate) struct MemoryAudio {
    frames: usize,
    opens: AtomicU32,
}

impl MemoryAudio {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            opens: AtomicU32::new(0),
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl AudioSourceOpener for MemoryAudio {
    fn open_source(&self, source: &Path) -> Result<DecodedFrameStream, AudioError> {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        if name == "missing.wav" {
            return Err(AudioError::SourceNotFound(source.display().to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let frame = PcmFrame {
            samples: vec![0; 480],
            sample_rate: 48_000,
            channels: 1,
        };
        if name == "broken.wav" {
            return Ok(Box::new(
                [
                    Ok(frame),
                    Err(AudioError::DecodeFailed("truncated data chunk".to_string())),
                ]
                .into_iter(),
            ));
        }
        Ok(Box::new(std::iter::repeat(frame).take(self.frames).map(Ok::<_, AudioError>)))
    }
}

pub(crate) fn connect_options(username: &str) -> ConnectOptions {
    ConnectOptions {
        address: ServerAddress::parse("localhost:64738").expect("address"),
        credentials: Credentials::new(username),
        tls: TlsPolicy::Skip,
    }
}

pub(crate) fn session_context(
    connector: Arc<ScriptedConnector>,
    audio: Arc<MemoryAudio>,
) -> (SessionContext, broadcast::Receiver<PlaybackEvent>) {
    let (playback_events, completions) = broadcast::channel(64);
    let context = SessionContext {
        connector,
        audio,
        playback_events,
        connect_timeout: Duration::from_secs(5),
    };
    (context, completions)
}

pub(crate) async fn connected_session(
    id: u64,
    connector: Arc<ScriptedConnector>,
    audio: Arc<MemoryAudio>,
) -> (Arc<Session>, broadcast::Receiver<PlaybackEvent>) {
    let (context, completions) = session_context(connector, audio);
    let session = Session::new(ClientId(id), connect_options(&format!("bot {id}")), context);
    session.connect().await.expect("connect");
    (session, completions)
}

pub(crate) fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

pub(crate) fn spawn_request(count: usize) -> SpawnRequest {
    let mut request = SpawnRequest::new(
        count,
        ServerAddress::parse("localhost:64738").expect("address"),
    );
    request.username_prefix = "bot".to_string();
    request.retry = fast_retry(0);
    request
}

pub(crate) struct Fixture {
    pub connector: Arc<ScriptedConnector>,
    pub audio: Arc<MemoryAudio>,
    pub fleet: Fleet,
}

impl Fixture {
    pub fn new(connector: ScriptedConnector) -> Self {
        Self::with_audio(connector, MemoryAudio::new(5))
    }

    pub fn with_audio(connector: ScriptedConnector, audio: MemoryAudio) -> Self {
        let connector = Arc::new(connector);
        let audio = Arc::new(audio);
        let fleet = Fleet::new(
            Arc::clone(&connector) as Arc<dyn VoiceConnector>,
            Arc::clone(&audio) as Arc<dyn AudioSourceOpener>,
            Duration::from_secs(5),
        );
        Self {
            connector,
            audio,
            fleet,
        }
    }

    pub async fn spawn(&self, count: usize) -> SpawnReport {
        self.fleet
            .supervisor()
            .spawn_fleet(spawn_request(count))
            .await
    }

    /// The mock transport behind the client with id `id`, named `"bot <id>"`.
    pub fn transport(&self, id: u64) -> Arc<MockTransport> {
        self.connector.transport(&format!("bot {id}"))
    }
}
