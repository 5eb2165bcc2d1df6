use std::{collections::BTreeMap, fmt, time::Duration};

use anyhow::Result;
use fleet_core::Fleet;
use serde::Serialize;
use shared::{
    domain::{ChannelId, ClientId, ServerAddress, SessionState},
    protocol::{Command, SlotState, TargetSelection},
};
use tracing::{info, warn};

use crate::{
    config::Settings,
    repl::{OperatorCommand, SelectionSpec, HELP},
};

/// How long a detached audio broadcast is followed before its summary is logged.
const PLAYBACK_WATCH: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Serialize)]
pub struct SessionRow {
    pub client_id: ClientId,
    pub name: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub live: usize,
    pub slots: BTreeMap<String, usize>,
    pub sessions: Vec<SessionRow>,
}

impl fmt::Display for FleetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self
            .slots
            .iter()
            .map(|(state, count)| format!("{state}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(f, "fleet: {} live ({slots})", self.live)?;
        for row in &self.sessions {
            let channel = row
                .channel_id
                .map(|channel_id| channel_id.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(f, "  #{:<4} {:<24} channel {channel}", row.client_id, row.name)?;
        }
        Ok(())
    }
}

pub struct Operator {
    fleet: Fleet,
    settings: Settings,
    address: ServerAddress,
    json: bool,
}

impl Operator {
    pub fn new(fleet: Fleet, settings: Settings, address: ServerAddress, json: bool) -> Self {
        Self {
            fleet,
            settings,
            address,
            json,
        }
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub async fn execute(&self, command: OperatorCommand) -> Result<Flow> {
        match command {
            OperatorCommand::Empty => {}
            OperatorCommand::Quit => return Ok(Flow::Quit),
            OperatorCommand::Help => println!("{HELP}"),
            OperatorCommand::Status => self.emit(&self.status().await)?,
            OperatorCommand::Spawn(count) => self.spawn(count).await?,
            OperatorCommand::Text { selection, body } => {
                let Some(selection) = self.selection(selection).await else {
                    return Ok(Flow::Continue);
                };
                let body = body.unwrap_or_else(|| self.settings.text_body.clone());
                let outcome = self
                    .fleet
                    .dispatcher()
                    .dispatch(
                        Command::SendText { body },
                        selection,
                        self.settings.command_timeout(),
                    )
                    .await;
                self.emit(&outcome)?;
            }
            OperatorCommand::Audio { selection, source } => {
                let Some(selection) = self.selection(selection).await else {
                    return Ok(Flow::Continue);
                };
                let source = source.unwrap_or_else(|| self.settings.audio_source.clone());
                let broadcast = self
                    .fleet
                    .broadcaster()
                    .broadcast_audio(source, selection, self.settings.command_timeout())
                    .await;
                self.emit(&broadcast.outcome)?;
                if !broadcast.playing().is_empty() {
                    tokio::spawn(async move {
                        let summary = broadcast.wait(PLAYBACK_WATCH).await;
                        info!(summary = %summary, "audio: broadcast settled");
                    });
                }
            }
            OperatorCommand::Stop { selection } => {
                let Some(selection) = self.selection(selection).await else {
                    return Ok(Flow::Continue);
                };
                let outcome = self
                    .fleet
                    .dispatcher()
                    .dispatch(Command::StopAudio, selection, self.settings.command_timeout())
                    .await;
                self.emit(&outcome)?;
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn spawn(&self, count: usize) -> Result<()> {
        let request = self.settings.spawn_request(count, self.address.clone());
        let report = self.fleet.supervisor().spawn_fleet(request).await;
        for slot in &report.gave_up {
            warn!(
                client_id = slot.client_id.0,
                name = %slot.name,
                attempts = slot.attempts,
                error = %slot.error,
                "operator: client gave up"
            );
        }
        self.emit(&report)
    }

    async fn selection(&self, spec: SelectionSpec) -> Option<TargetSelection> {
        let live = self.fleet.registry().count_live().await;
        match spec.resolve(live) {
            Ok(selection) => Some(selection),
            Err(err) => {
                println!("{err}");
                None
            }
        }
    }

    pub async fn status(&self) -> FleetStatus {
        let sessions = self
            .fleet
            .registry()
            .snapshot()
            .await
            .iter()
            .map(|session| {
                let status = session.status();
                SessionRow {
                    client_id: session.id(),
                    name: session.name().to_string(),
                    state: status.state,
                    channel_id: status.channel_id,
                }
            })
            .collect::<Vec<_>>();

        let mut slots = BTreeMap::new();
        for state in self.fleet.supervisor().slot_states().await.values() {
            *slots.entry(slot_label(*state).to_string()).or_insert(0) += 1;
        }
        FleetStatus {
            live: sessions.len(),
            slots,
            sessions,
        }
    }

    pub fn emit<T>(&self, report: &T) -> Result<()>
    where
        T: Serialize + fmt::Display,
    {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{report}");
        }
        Ok(())
    }
}

fn slot_label(state: SlotState) -> &'static str {
    match state {
        SlotState::Pending => "pending",
        SlotState::Connecting => "connecting",
        SlotState::Connected => "connected",
        SlotState::RetryScheduled => "retry_scheduled",
        SlotState::GaveUp => "gave_up",
        SlotState::Disconnected => "disconnected",
    }
}

#[cfg(test)]
#[path = "tests/operator_tests.rs"]
mod tests;
