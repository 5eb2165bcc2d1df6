//! Starts one playback per selected session and follows their completions.
//!
//! Every session opens its own decoder, so a slow consumer only ever delays
//! itself. Starting is part of the dispatch; finishing is reported later on a
//! channel owned by the broadcast, and also on the fleet's playback event
//! channel for other observers.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use shared::{
    domain::ClientId,
    error::CommandError,
    protocol::{
        AggregateOutcome, CommandKind, PlaybackEvent, PlaybackId, PlaybackSummary,
        TargetSelection,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};
use tracing::debug;

use crate::{
    dispatcher::{fan_out, log_outcome, CommandDispatcher},
    session::AudioHandle,
};

#[derive(Clone)]
pub struct AudioBroadcaster {
    dispatcher: CommandDispatcher,
    completions: broadcast::Sender<PlaybackEvent>,
}

impl AudioBroadcaster {
    pub fn new(
        dispatcher: CommandDispatcher,
        completions: broadcast::Sender<PlaybackEvent>,
    ) -> Self {
        Self {
            dispatcher,
            completions,
        }
    }

    /// Every playback completion of the fleet, including ones started outside a broadcast.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.completions.subscribe()
    }

    /// Starts `source` on every selected session. `timeout` bounds only the
    /// start of each playback.
    pub async fn broadcast_audio(
        &self,
        source: PathBuf,
        selection: TargetSelection,
        timeout: Duration,
    ) -> AudioBroadcast {
        // Unbounded: each playback reports exactly once and none may be lost,
        // even when clips end before fan-out returns.
        let (report, completions) = mpsc::unbounded_channel();
        let started = Instant::now();
        let resolved = self.dispatcher.resolve(&selection).await;

        let mut outcome = AggregateOutcome::new(CommandKind::PlayAudio, selection);
        outcome.unmatched = resolved.unmatched;
        let source = Arc::new(source);
        let results = fan_out(resolved.targets, timeout, |session| {
            let source = Arc::clone(&source);
            let report = report.clone();
            async move {
                if !session.is_connected() {
                    return Err(CommandError::NotConnected);
                }
                session
                    .start_audio_reporting(&source, Some(report))
                    .await
                    .map_err(CommandError::from)
            }
        })
        .await;
        drop(report);

        let mut pending = HashMap::new();
        for (client_id, result) in results {
            let (session_outcome, handle) = result.into_outcome();
            if let Some(AudioHandle { playback_id, .. }) = handle {
                pending.insert(playback_id, client_id);
            }
            outcome.record(client_id, session_outcome);
        }
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        if !outcome.is_empty() {
            log_outcome(&outcome);
        }

        AudioBroadcast {
            outcome,
            pending,
            completions,
        }
    }
}

/// A broadcast whose playbacks may still be running.
pub struct AudioBroadcast {
    pub outcome: AggregateOutcome,
    pending: HashMap<PlaybackId, ClientId>,
    completions: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl AudioBroadcast {
    /// Sessions whose playback has started and not yet been reported as ended.
    pub fn playing(&self) -> Vec<ClientId> {
        let mut playing = self.pending.values().copied().collect::<Vec<_>>();
        playing.sort();
        playing
    }

    /// Collects completions until every started playback has ended or
    /// `deadline` passes. Whatever is left is reported as still playing.
    pub async fn wait(mut self, deadline: Duration) -> PlaybackSummary {
        let until = Instant::now() + deadline;
        let mut summary = PlaybackSummary::default();

        while !self.pending.is_empty() {
            let event = match tokio::time::timeout_at(until, self.completions.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };
            if self.pending.remove(&event.playback_id()).is_some() {
                debug!(
                    client_id = event.client_id().0,
                    playback_id = %event.playback_id(),
                    "audio: playback completion observed"
                );
                summary.record(event);
            }
        }

        summary.still_playing = self.playing();
        summary
    }
}

#[cfg(test)]
#[path = "tests/audio_broadcast_tests.rs"]
mod tests;
