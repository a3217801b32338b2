// Sync session: owns the store, the push channel and the fallback poller,
// and serializes every mutation onto one loop task.
//
// Commands from the handle take priority over transport and poller events.
// Each command is acknowledged only after the loop has applied it, so once
// `disconnect()` or `stop_polling()` returns, no event from the torn-down
// generation can reach the store.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::ClockService;
use crate::config::Config;
use crate::directory::ChallengeDirectory;
use crate::poller::FallbackPoller;
use crate::protocol::{
    Challenge, ChallengeEnd, ChallengePatch, ChannelEvent, Envelope, JoinParams, Origin, PushEvent,
};
use crate::store::{ChallengeStore, Outcome, SyncSnapshot};
use crate::transport::{TransportChannel, TransportSettings};

/// How long `dispose()` waits for the loop to wind down.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub transport: TransportSettings,
    pub poll_interval: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        SyncSettings {
            transport: TransportSettings::from_config(config),
            poll_interval: config.poll_interval(),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sync session is closed")]
pub struct SessionClosed;

#[derive(Debug)]
pub enum SessionCommand {
    Connect(JoinParams),
    Disconnect,
    StartPolling,
    StopPolling,
    /// Direct store transition, bypassing both sources.
    Apply(PushEvent),
    Shutdown,
}

/// A command plus the channel used to acknowledge it.
#[derive(Debug)]
pub struct Request {
    pub command: SessionCommand,
    pub ack: oneshot::Sender<()>,
}

// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

pub struct SyncSession {
    store: ChallengeStore,
    transport: TransportChannel,
    poller: FallbackPoller,
}

impl SyncSession {
    pub fn new(
        settings: SyncSettings,
        directory: Arc<dyn ChallengeDirectory>,
        clock: Arc<ClockService>,
        event_tx: mpsc::Sender<Envelope>,
    ) -> Self {
        SyncSession {
            store: ChallengeStore::new(clock.clone()),
            transport: TransportChannel::new(settings.transport, clock.clone(), event_tx.clone()),
            poller: FallbackPoller::new(directory, clock, event_tx, settings.poll_interval),
        }
    }

    pub fn store(&self) -> &ChallengeStore {
        &self.store
    }

    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect(params) => {
                self.store.set_push_connected(false);
                self.transport.connect(params);
            }
            SessionCommand::Disconnect => {
                self.transport.disconnect();
                self.store.set_push_connected(false);
            }
            SessionCommand::StartPolling => {
                self.poller.start();
            }
            SessionCommand::StopPolling => self.poller.stop(),
            SessionCommand::Apply(event) => {
                let outcome = match event {
                    PushEvent::Drop(challenge) => self.store.on_drop(challenge),
                    PushEvent::Update(patch) => self.store.on_update(&patch),
                    PushEvent::End(end) => self.store.on_end(&end),
                };
                debug!(?outcome, "direct transition");
            }
            SessionCommand::Shutdown => self.shutdown(),
        }
    }

    pub fn handle_envelope(&mut self, envelope: Envelope) {
        let current = match envelope.origin {
            Origin::Push => self.transport.generation(),
            Origin::Poll => self.poller.generation(),
        };
        if envelope.generation != current {
            debug!(
                origin = ?envelope.origin,
                generation = envelope.generation,
                current,
                "dropping event from torn-down source"
            );
            return;
        }

        match envelope.event {
            ChannelEvent::Connected => {
                info!("push channel connected");
                self.store.set_push_connected(true);
            }
            ChannelEvent::Disconnected => {
                info!("push channel lost, reconnecting");
                self.store.set_push_connected(false);
            }
            ChannelEvent::Proposal { event, event_id } => {
                let name = event_name(&event);
                let outcome = self.store.apply(envelope.origin, event, event_id);
                match outcome {
                    Outcome::Applied => {
                        info!(origin = ?envelope.origin, event = name, phase = ?self.store.phase(), "transition applied")
                    }
                    _ => debug!(origin = ?envelope.origin, event = name, ?outcome, "event ignored"),
                }
            }
        }
    }

    /// Stop both sources. The store keeps its last state.
    pub fn shutdown(&mut self) {
        self.poller.stop();
        self.transport.disconnect();
        self.store.set_push_connected(false);
    }
}

fn event_name(event: &PushEvent) -> &'static str {
    match event {
        PushEvent::Drop(_) => "drop",
        PushEvent::Update(_) => "update",
        PushEvent::End(_) => "end",
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run the session loop until `Shutdown` or until every handle is gone.
pub async fn run(
    mut session: SyncSession,
    mut cmd_rx: mpsc::Receiver<Request>,
    mut event_rx: mpsc::Receiver<Envelope>,
) {
    info!("sync session loop started");

    let mut pending_ack = None;
    loop {
        tokio::select! {
            biased;

            request = cmd_rx.recv() => {
                match request {
                    Some(Request { command: SessionCommand::Shutdown, ack }) => {
                        info!("shutdown requested");
                        pending_ack = Some(ack);
                        break;
                    }
                    Some(Request { command, ack }) => {
                        session.handle_command(command);
                        let _ = ack.send(());
                    }
                    None => {
                        info!("all session handles dropped, shutting down");
                        break;
                    }
                }
            }

            Some(envelope) = event_rx.recv() => {
                session.handle_envelope(envelope);
            }
        }
    }

    session.shutdown();
    info!("sync session loop exiting");
    if let Some(ack) = pending_ack {
        let _ = ack.send(());
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Application-facing handle on a running sync session.
///
/// Created by [`ChallengeSync::init`] and torn down by
/// [`ChallengeSync::dispose`]. All operations are serialized through the
/// session loop.
pub struct ChallengeSync {
    cmd_tx: mpsc::Sender<Request>,
    snapshot_rx: watch::Receiver<SyncSnapshot>,
    clock: Arc<ClockService>,
    task: Option<JoinHandle<()>>,
}

impl ChallengeSync {
    /// Build the session and spawn its loop. Must be called inside a tokio
    /// runtime.
    pub fn init(
        settings: SyncSettings,
        directory: Arc<dyn ChallengeDirectory>,
        clock: Arc<ClockService>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let session = SyncSession::new(settings, directory, clock.clone(), event_tx);
        let snapshot_rx = session.store().subscribe();

        let task = tokio::spawn(run(session, cmd_rx, event_rx));

        ChallengeSync {
            cmd_tx,
            snapshot_rx,
            clock,
            task: Some(task),
        }
    }

    async fn request(&self, command: SessionCommand) -> Result<(), SessionClosed> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Request { command, ack })
            .await
            .map_err(|_| SessionClosed)?;
        done.await.map_err(|_| SessionClosed)
    }

    /// Join the campus push feed, replacing any existing connection.
    pub async fn connect(&self, params: JoinParams) -> Result<(), SessionClosed> {
        self.request(SessionCommand::Connect(params)).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionClosed> {
        self.request(SessionCommand::Disconnect).await
    }

    pub async fn start_polling(&self) -> Result<(), SessionClosed> {
        self.request(SessionCommand::StartPolling).await
    }

    pub async fn stop_polling(&self) -> Result<(), SessionClosed> {
        self.request(SessionCommand::StopPolling).await
    }

    pub async fn drop_challenge(&self, challenge: Challenge) -> Result<(), SessionClosed> {
        self.request(SessionCommand::Apply(PushEvent::Drop(challenge)))
            .await
    }

    pub async fn update_challenge(&self, patch: ChallengePatch) -> Result<(), SessionClosed> {
        self.request(SessionCommand::Apply(PushEvent::Update(patch)))
            .await
    }

    pub async fn end_challenge(&self, end: ChallengeEnd) -> Result<(), SessionClosed> {
        self.request(SessionCommand::Apply(PushEvent::End(end))).await
    }

    /// A receiver notified on every applied transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Latest published state with the current clock offset.
    pub fn snapshot(&self) -> SyncSnapshot {
        let mut snapshot = self.snapshot_rx.borrow().clone();
        snapshot.server_time_offset_ms = self.clock.offset_ms();
        snapshot
    }

    pub fn clock(&self) -> Arc<ClockService> {
        self.clock.clone()
    }

    /// Stop polling, disconnect, end the loop and wait for it.
    pub async fn dispose(mut self) {
        if self.request(SessionCommand::Shutdown).await.is_err() {
            debug!("sync session already closed");
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(DISPOSE_TIMEOUT, task).await.is_err() {
                warn!("sync session loop did not exit within {DISPOSE_TIMEOUT:?}");
            }
        }
        info!("sync session disposed");
    }
}

impl Drop for ChallengeSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
