//! Resolves a target selection against the registry and runs one command on
//! every selected session concurrently, each under its own timeout.

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::join_all;
use shared::{
    domain::ClientId,
    error::CommandError,
    protocol::{AggregateOutcome, Command, SessionOutcome, TargetSelection},
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{registry::FleetRegistry, session::Session};

/// Sessions a selection resolved to, in spawn order.
pub struct ResolvedTargets {
    pub targets: Vec<Arc<Session>>,
    /// Explicit ids with no live session behind them.
    pub unmatched: Vec<ClientId>,
}

impl ResolvedTargets {
    pub fn ids(&self) -> Vec<ClientId> {
        self.targets.iter().map(|session| session.id()).collect()
    }
}

pub(crate) enum TargetResult<T> {
    Completed(Result<T, CommandError>),
    TimedOut,
}

impl<T> TargetResult<T> {
    /// Splits into the outcome to report and the value of a successful call.
    pub(crate) fn into_outcome(self) -> (SessionOutcome, Option<T>) {
        match self {
            Self::Completed(Ok(value)) => (SessionOutcome::Ok, Some(value)),
            Self::Completed(Err(reason)) => (SessionOutcome::Failed { reason }, None),
            Self::TimedOut => (SessionOutcome::TimedOut, None),
        }
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    registry: FleetRegistry,
}

impl CommandDispatcher {
    pub fn new(registry: FleetRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub async fn resolve(&self, selection: &TargetSelection) -> ResolvedTargets {
        let live = self.registry.snapshot().await;
        match selection {
            TargetSelection::All => ResolvedTargets {
                targets: live,
                unmatched: Vec::new(),
            },
            TargetSelection::FirstN(n) => ResolvedTargets {
                targets: live.into_iter().take(*n).collect(),
                unmatched: Vec::new(),
            },
            TargetSelection::Ids(ids) => {
                let targets = live
                    .into_iter()
                    .filter(|session| ids.contains(&session.id()))
                    .collect::<Vec<_>>();
                let unmatched = ids
                    .iter()
                    .copied()
                    .filter(|id| !targets.iter().any(|session| session.id() == *id))
                    .collect();
                ResolvedTargets { targets, unmatched }
            }
            TargetSelection::InChannel(channel_id) => ResolvedTargets {
                targets: live
                    .into_iter()
                    .filter(|session| session.channel_id() == Some(*channel_id))
                    .collect(),
                unmatched: Vec::new(),
            },
        }
    }

    /// Runs `command` on every session `selection` resolves to and waits for all
    /// of them. An empty selection is a successful no-op.
    pub async fn dispatch(
        &self,
        command: Command,
        selection: TargetSelection,
        timeout: Duration,
    ) -> AggregateOutcome {
        let resolved = self.resolve(&selection).await;
        self.dispatch_to(resolved, command, selection, timeout).await
    }

    pub async fn dispatch_to(
        &self,
        resolved: ResolvedTargets,
        command: Command,
        selection: TargetSelection,
        timeout: Duration,
    ) -> AggregateOutcome {
        let started = Instant::now();
        let mut outcome = AggregateOutcome::new(command.kind(), selection);
        outcome.unmatched = resolved.unmatched;
        if resolved.targets.is_empty() {
            debug!(selection = %outcome.selection, "dispatch: selection matched no live sessions");
            return outcome;
        }

        let command = Arc::new(command);
        let results = fan_out(resolved.targets, timeout, |session| {
            let command = Arc::clone(&command);
            async move { execute(&session, &command).await }
        })
        .await;

        for (client_id, result) in results {
            outcome.record(client_id, result.into_outcome().0);
        }
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        log_outcome(&outcome);
        outcome
    }
}

pub(crate) fn log_outcome(outcome: &AggregateOutcome) {
    if outcome.all_ok() {
        info!(dispatch_id = %outcome.dispatch_id, summary = %outcome, "dispatch: completed");
    } else {
        warn!(
            dispatch_id = %outcome.dispatch_id,
            summary = %outcome,
            "dispatch: completed with failures"
        );
    }
}

async fn execute(session: &Arc<Session>, command: &Command) -> Result<(), CommandError> {
    // The registry snapshot may be stale by the time this runs.
    if !session.is_connected() {
        return Err(CommandError::NotConnected);
    }
    match command {
        Command::SendText { body } => session.send_text(body).await.map_err(Into::into),
        Command::PlayAudio { source } => session
            .start_audio(source)
            .await
            .map(|_| ())
            .map_err(Into::into),
        Command::StopAudio => {
            session.stop_audio(None).await;
            Ok(())
        }
    }
}

/// Calls `call` for every target on its own task and collects the results in
/// target order. A target that overruns `timeout` is reported as timed out and
/// its task is left to finish in the background.
pub(crate) async fn fan_out<T, F, Fut>(
    targets: Vec<Arc<Session>>,
    timeout: Duration,
    call: F,
) -> Vec<(ClientId, TargetResult<T>)>
where
    T: Send + 'static,
    F: Fn(Arc<Session>) -> Fut,
    Fut: Future<Output = Result<T, CommandError>> + Send + 'static,
{
    let pending = targets.into_iter().map(|session| {
        let client_id = session.id();
        let task = tokio::spawn(call(session));
        async move {
            let result = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => TargetResult::Completed(result),
                Ok(Err(err)) => {
                    warn!(client_id = client_id.0, error = %err, "dispatch: command task failed");
                    TargetResult::Completed(Err(CommandError::Aborted(err.to_string())))
                }
                Err(_) => {
                    debug!(client_id = client_id.0, "dispatch: stopped waiting for slow target");
                    TargetResult::TimedOut
                }
            };
            (client_id, result)
        }
    });
    join_all(pending).await
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
