//! Spawning and draining the fleet.
//!
//! Every spawn slot runs on its own task: it waits for a connect permit,
//! attempts to connect, and on a retryable failure sleeps off a backoff
//! delay with the permit released. Connected sessions are handed to the
//! registry and followed by a small watcher that keeps the slot state
//! current.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use shared::{
    domain::{ClientId, Credentials, ServerAddress, TlsPolicy},
    error::ConnectError,
    protocol::{DrainReport, GaveUpSlot, SessionEvent, SlotState, SpawnReport},
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex, Notify, Semaphore},
    time::Instant,
};
use tracing::{debug, info, warn};
use voice_integration::ConnectOptions;

use crate::{
    backoff::RetryPolicy,
    registry::FleetRegistry,
    session::{DisconnectStatus, Session, SessionContext},
};

pub const DEFAULT_USERNAME_PREFIX: &str = "Mumchmark bot";

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub count: usize,
    pub address: ServerAddress,
    pub tls: TlsPolicy,
    /// Each client is named `"<prefix> <client id>"`.
    pub username_prefix: String,
    pub password: Option<String>,
    pub max_concurrent_connects: usize,
    pub retry: RetryPolicy,
}

impl SpawnRequest {
    pub fn new(count: usize, address: ServerAddress) -> Self {
        Self {
            count,
            address,
            tls: TlsPolicy::default(),
            username_prefix: DEFAULT_USERNAME_PREFIX.to_string(),
            password: None,
            max_concurrent_connects: 8,
            retry: RetryPolicy::default(),
        }
    }
}

enum SlotResult {
    Connected(ClientId),
    GaveUp(GaveUpSlot),
    Cancelled(ClientId),
}

type SlotTable = Arc<Mutex<BTreeMap<ClientId, SlotState>>>;

#[derive(Clone)]
pub struct FleetSupervisor {
    registry: FleetRegistry,
    context: SessionContext,
    next_id: Arc<AtomicU64>,
    slots: SlotTable,
    draining: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl FleetSupervisor {
    pub fn new(registry: FleetRegistry, context: SessionContext) -> Self {
        Self {
            registry,
            context,
            next_id: Arc::new(AtomicU64::new(0)),
            slots: Arc::new(Mutex::new(BTreeMap::new())),
            draining: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn slot_states(&self) -> BTreeMap<ClientId, SlotState> {
        self.slots.lock().await.clone()
    }

    /// Spawns `request.count` clients and returns once every slot has either
    /// connected, given up, or been cancelled by a drain.
    pub async fn spawn_fleet(&self, request: SpawnRequest) -> SpawnReport {
        let started = Instant::now();
        let permits = Arc::new(Semaphore::new(connect_permits(request.max_concurrent_connects)));
        let attempts = Arc::new(AtomicU32::new(0));
        info!(
            count = request.count,
            address = %request.address,
            max_concurrent_connects = request.max_concurrent_connects,
            "supervisor: spawning fleet"
        );

        let mut tasks = Vec::with_capacity(request.count);
        for _ in 0..request.count {
            let client_id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let options = ConnectOptions {
                address: request.address.clone(),
                credentials: Credentials::new(format!("{} {}", request.username_prefix, client_id))
                    .with_password(request.password.clone()),
                tls: request.tls,
            };
            let session = Session::new(client_id, options, self.context.clone());
            self.set_slot(client_id, SlotState::Pending).await;

            let supervisor = self.clone();
            let permits = Arc::clone(&permits);
            let attempts = Arc::clone(&attempts);
            let retry = request.retry;
            tasks.push(tokio::spawn(async move {
                supervisor.run_slot(session, permits, attempts, retry).await
            }));
        }

        let mut report = SpawnReport {
            requested: request.count,
            connected: Vec::new(),
            gave_up: Vec::new(),
            cancelled: Vec::new(),
            attempts: 0,
            elapsed_ms: 0,
        };
        for result in join_all(tasks).await {
            match result {
                Ok(SlotResult::Connected(client_id)) => report.connected.push(client_id),
                Ok(SlotResult::GaveUp(slot)) => report.gave_up.push(slot),
                Ok(SlotResult::Cancelled(client_id)) => report.cancelled.push(client_id),
                Err(err) => warn!(error = %err, "supervisor: spawn slot task failed"),
            }
        }
        report.attempts = attempts.load(Ordering::Relaxed);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(summary = %report, "supervisor: spawn finished");
        report
    }

    async fn run_slot(
        &self,
        session: Arc<Session>,
        permits: Arc<Semaphore>,
        attempts: Arc<AtomicU32>,
        retry: RetryPolicy,
    ) -> SlotResult {
        let client_id = session.id();
        let mut retries = 0u32;

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancelled() => return self.cancel_slot(client_id).await,
                permit = Arc::clone(&permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                return self.cancel_slot(client_id).await;
            };

            self.set_slot(client_id, SlotState::Connecting).await;
            attempts.fetch_add(1, Ordering::Relaxed);
            let result = session.connect().await;
            drop(permit);

            let err = match result {
                Ok(()) => return self.adopt(session, retries + 1).await,
                Err(err) => err,
            };

            if !err.is_retryable() || retries >= retry.max_retries {
                self.set_slot(client_id, SlotState::GaveUp).await;
                warn!(
                    client_id = client_id.0,
                    attempts = retries + 1,
                    error = %err,
                    "supervisor: giving up on client"
                );
                return SlotResult::GaveUp(GaveUpSlot {
                    client_id,
                    name: session.name().to_string(),
                    attempts: retries + 1,
                    error: err,
                });
            }

            let delay = retry.backoff.delay_for(retries);
            retries += 1;
            self.set_slot(client_id, SlotState::RetryScheduled).await;
            debug!(
                client_id = client_id.0,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "supervisor: connect failed; retry scheduled"
            );
            tokio::select! {
                biased;
                _ = self.cancelled() => return self.cancel_slot(client_id).await,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Registers a freshly connected session and starts following its events.
    async fn adopt(&self, session: Arc<Session>, attempts: u32) -> SlotResult {
        let client_id = session.id();
        let events = session.subscribe_events();

        if let Err(err) = self.registry.add(Arc::clone(&session)).await {
            self.set_slot(client_id, SlotState::Disconnected).await;
            warn!(client_id = client_id.0, error = %err, "supervisor: could not register client");
            return SlotResult::GaveUp(GaveUpSlot {
                client_id,
                name: session.name().to_string(),
                attempts,
                error: ConnectError::Refused(err.to_string()),
            });
        }
        self.set_slot(client_id, SlotState::Connected).await;
        tokio::spawn(follow_session(
            client_id,
            session.name().to_string(),
            events,
            Arc::clone(&self.slots),
        ));

        // A drain that already emptied the registry would never see this session.
        if self.is_draining() {
            self.registry.remove(client_id).await;
            session.disconnect(Duration::ZERO).await;
            return SlotResult::Cancelled(client_id);
        }
        SlotResult::Connected(client_id)
    }

    async fn cancel_slot(&self, client_id: ClientId) -> SlotResult {
        self.set_slot(client_id, SlotState::Disconnected).await;
        debug!(client_id = client_id.0, "supervisor: spawn slot cancelled by drain");
        SlotResult::Cancelled(client_id)
    }

    async fn cancelled(&self) {
        let notified = self.shutdown.notified();
        if self.is_draining() {
            return;
        }
        notified.await;
    }

    async fn set_slot(&self, client_id: ClientId, state: SlotState) {
        self.slots.lock().await.insert(client_id, state);
    }

    /// Disconnects every registered session concurrently and waits at most
    /// `deadline`. Pending spawns are cancelled and later spawns do nothing.
    pub async fn drain_all(&self, deadline: Duration) -> DrainReport {
        let started = Instant::now();
        self.draining.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let sessions = self.registry.take_all().await;
        info!(
            sessions = sessions.len(),
            deadline_ms = deadline.as_millis() as u64,
            "supervisor: draining fleet"
        );
        let closing = sessions.into_iter().map(|session| async move {
            let status = session.disconnect(deadline).await;
            (session.id(), status)
        });

        let mut report = DrainReport {
            disconnected: Vec::new(),
            abandoned: Vec::new(),
            elapsed_ms: 0,
        };
        for (client_id, status) in join_all(closing).await {
            self.set_slot(client_id, SlotState::Disconnected).await;
            match status {
                DisconnectStatus::Closed | DisconnectStatus::AlreadyClosed => {
                    report.disconnected.push(client_id)
                }
                DisconnectStatus::Abandoned => report.abandoned.push(client_id),
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(summary = %report, "supervisor: drain finished");
        report
    }
}

/// At least one connect in flight, and never more than a semaphore can hold.
fn connect_permits(requested: usize) -> usize {
    requested.clamp(1, Semaphore::MAX_PERMITS)
}

async fn follow_session(
    client_id: ClientId,
    name: String,
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    slots: SlotTable,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Disconnected { reason }) => {
                slots.lock().await.insert(client_id, SlotState::Disconnected);
                info!(
                    client_id = client_id.0,
                    name = %name,
                    %reason,
                    "supervisor: client disconnected"
                );
                return;
            }
            Ok(SessionEvent::TextReceived {
                sender,
                channel_id,
                body,
            }) => {
                debug!(
                    client_id = client_id.0,
                    sender = sender.as_deref().unwrap_or("server"),
                    channel_id = channel_id.0,
                    %body,
                    "supervisor: text received"
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(client_id = client_id.0, skipped, "supervisor: event follower lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
