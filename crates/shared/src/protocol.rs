use std::{collections::BTreeSet, fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ChannelId, ClientId},
    error::{CommandError, ConnectError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    SendText { body: String },
    PlayAudio { source: PathBuf },
    StopAudio,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SendText { .. } => CommandKind::SendText,
            Self::PlayAudio { .. } => CommandKind::PlayAudio,
            Self::StopAudio => CommandKind::StopAudio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SendText,
    PlayAudio,
    StopAudio,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendText => f.write_str("send_text"),
            Self::PlayAudio => f.write_str("play_audio"),
            Self::StopAudio => f.write_str("stop_audio"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TargetSelection {
    All,
    /// The first `n` live sessions in spawn order.
    FirstN(usize),
    Ids(BTreeSet<ClientId>),
    InChannel(ChannelId),
}

impl fmt::Display for TargetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::FirstN(n) => write!(f, "first:{n}"),
            Self::Ids(ids) => {
                let ids = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "ids:{}", ids.join(","))
            }
            Self::InChannel(channel_id) => write!(f, "channel:{channel_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionOutcome {
    Ok,
    TimedOut,
    Failed { reason: CommandError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub client_id: ClientId,
    pub reason: CommandError,
}

/// Result of one fan-out. Ids appear in selection order within each list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub dispatch_id: Uuid,
    pub command: CommandKind,
    pub selection: TargetSelection,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub ok: Vec<ClientId>,
    pub timed_out: Vec<ClientId>,
    pub failed: Vec<FailedTarget>,
    /// Explicitly requested ids that were not live when the selection was resolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched: Vec<ClientId>,
}

impl AggregateOutcome {
    pub fn new(command: CommandKind, selection: TargetSelection) -> Self {
        Self {
            dispatch_id: Uuid::new_v4(),
            command,
            selection,
            started_at: Utc::now(),
            elapsed_ms: 0,
            ok: Vec::new(),
            timed_out: Vec::new(),
            failed: Vec::new(),
            unmatched: Vec::new(),
        }
    }

    pub fn record(&mut self, client_id: ClientId, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Ok => self.ok.push(client_id),
            SessionOutcome::TimedOut => self.timed_out.push(client_id),
            SessionOutcome::Failed { reason } => {
                self.failed.push(FailedTarget { client_id, reason })
            }
        }
    }

    pub fn total(&self) -> usize {
        self.ok.len() + self.timed_out.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn all_ok(&self) -> bool {
        self.timed_out.is_empty() && self.failed.is_empty()
    }

    pub fn outcome_for(&self, client_id: ClientId) -> Option<SessionOutcome> {
        if self.ok.contains(&client_id) {
            return Some(SessionOutcome::Ok);
        }
        if self.timed_out.contains(&client_id) {
            return Some(SessionOutcome::TimedOut);
        }
        self.failed
            .iter()
            .find(|failed| failed.client_id == client_id)
            .map(|failed| SessionOutcome::Failed {
                reason: failed.reason.clone(),
            })
    }
}

impl fmt::Display for AggregateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}: {} ok, {} timed out, {} failed in {}ms",
            self.command,
            self.selection,
            self.ok.len(),
            self.timed_out.len(),
            self.failed.len(),
            self.elapsed_ms
        )?;
        if !self.unmatched.is_empty() {
            write!(f, " ({} requested ids not live)", self.unmatched.len())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        welcome_text: String,
        channel_id: ChannelId,
    },
    Disconnected {
        reason: String,
    },
    ChannelChanged {
        channel_id: ChannelId,
    },
    TextReceived {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        channel_id: ChannelId,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybackId(pub Uuid);

impl PlaybackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlaybackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlaybackEvent {
    Finished {
        client_id: ClientId,
        playback_id: PlaybackId,
        frames_sent: u64,
    },
    Stopped {
        client_id: ClientId,
        playback_id: PlaybackId,
        frames_sent: u64,
    },
    Error {
        client_id: ClientId,
        playback_id: PlaybackId,
        reason: String,
    },
}

impl PlaybackEvent {
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Finished { client_id, .. }
            | Self::Stopped { client_id, .. }
            | Self::Error { client_id, .. } => *client_id,
        }
    }

    pub fn playback_id(&self) -> PlaybackId {
        match self {
            Self::Finished { playback_id, .. }
            | Self::Stopped { playback_id, .. }
            | Self::Error { playback_id, .. } => *playback_id,
        }
    }
}

/// What a broadcast's playbacks had come to when the caller stopped waiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSummary {
    pub finished: Vec<ClientId>,
    pub stopped: Vec<ClientId>,
    pub errors: Vec<(ClientId, String)>,
    pub still_playing: Vec<ClientId>,
}

impl PlaybackSummary {
    pub fn record(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished { client_id, .. } => self.finished.push(client_id),
            PlaybackEvent::Stopped { client_id, .. } => self.stopped.push(client_id),
            PlaybackEvent::Error {
                client_id, reason, ..
            } => self.errors.push((client_id, reason)),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.still_playing.is_empty()
    }
}

impl fmt::Display for PlaybackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "playback: {} finished, {} stopped, {} failed, {} still playing",
            self.finished.len(),
            self.stopped.len(),
            self.errors.len(),
            self.still_playing.len()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Pending,
    Connecting,
    Connected,
    RetryScheduled,
    GaveUp,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaveUpSlot {
    pub client_id: ClientId,
    pub name: String,
    pub attempts: u32,
    pub error: ConnectError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnReport {
    pub requested: usize,
    pub connected: Vec<ClientId>,
    pub gave_up: Vec<GaveUpSlot>,
    /// Slots abandoned because the fleet started draining mid-spawn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled: Vec<ClientId>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl fmt::Display for SpawnReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawn: {}/{} connected, {} gave up, {} connect attempts in {}ms",
            self.connected.len(),
            self.requested,
            self.gave_up.len(),
            self.attempts,
            self.elapsed_ms
        )?;
        if !self.cancelled.is_empty() {
            write!(f, " ({} cancelled by drain)", self.cancelled.len())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    pub disconnected: Vec<ClientId>,
    pub abandoned: Vec<ClientId>,
    pub elapsed_ms: u64,
}

impl fmt::Display for DrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "drain: {} disconnected, {} abandoned in {}ms",
            self.disconnected.len(),
            self.abandoned.len(),
            self.elapsed_ms
        )
    }
}
