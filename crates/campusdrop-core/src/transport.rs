// Push channel: a persistent, self-healing subscription to the campus
// challenge feed over WebSocket or Server-Sent Events.
//
// Each `connect()` spawns one background task tagged with a fresh generation.
// The task joins the campus feed, decodes pushes into typed events and sends
// them to the session loop as `Envelope`s. Connection loss never surfaces to
// the caller; the task retries with exponential backoff until `disconnect()`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::clock::ClockService;
use crate::config::Config;
use crate::protocol::{
    decode_frame, decode_push, join_frame, ChannelEvent, Envelope, JoinParams, Origin,
    PayloadError, PushEvent, PushMessage,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a disconnected task gets to send its close frame before it is
/// aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Wire transport used for the push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    WebSocket,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Sse => f.write_str("sse"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub push_url: String,
    pub auth_token: Option<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl TransportSettings {
    pub fn from_config(config: &Config) -> Self {
        TransportSettings {
            kind: config.server.transport,
            push_url: config.server.push_url.clone(),
            auth_token: config.credentials.token().map(str::to_string),
            initial_backoff: Duration::from_millis(config.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.reconnect.max_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum ChannelError {
    /// Never got as far as joining.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Joined, then lost the connection.
    #[error("connection lost: {0}")]
    Lost(String),

    #[error("event receiver closed")]
    ReceiverClosed,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect delay: initial, 2x, 4x ... capped at `max`.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            next: initial,
        }
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

// ---------------------------------------------------------------------------
// TransportChannel
// ---------------------------------------------------------------------------

/// Handle on the push subscription. Owned by the sync session.
pub struct TransportChannel {
    settings: TransportSettings,
    clock: Arc<ClockService>,
    tx: mpsc::Sender<Envelope>,
    /// Bumped on every connect and disconnect. Envelopes tagged with an
    /// older value belong to a torn-down connection.
    generation: u64,
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportChannel {
    pub fn new(
        settings: TransportSettings,
        clock: Arc<ClockService>,
        tx: mpsc::Sender<Envelope>,
    ) -> Self {
        TransportChannel {
            settings,
            clock,
            tx,
            generation: 0,
            task: None,
            shutdown: None,
        }
    }

    /// Subscribe to the campus feed, replacing any existing connection.
    ///
    /// Returns immediately with the generation of the new connection; the
    /// handshake and join happen on a background task.
    pub fn connect(&mut self, params: JoinParams) -> u64 {
        self.disconnect();
        self.generation += 1;
        let generation = self.generation;

        info!(
            campus = %params.campus_id,
            user = %params.user_id,
            transport = %self.settings.kind,
            generation,
            "connecting push channel"
        );

        let forwarder = Forwarder {
            clock: self.clock.clone(),
            tx: self.tx.clone(),
            generation,
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_channel(
            self.settings.clone(),
            params,
            forwarder,
            shutdown_rx,
        )));
        generation
    }

    /// Close the connection and stop retrying. Safe to call when idle.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            tokio::spawn(async move {
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    abort.abort();
                }
            });
            info!("push channel disconnected");
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a connection task is running (connected or retrying).
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

/// Tags decoded pushes with the connection generation and hands them to the
/// session loop.
#[derive(Clone)]
struct Forwarder {
    clock: Arc<ClockService>,
    tx: mpsc::Sender<Envelope>,
    generation: u64,
}

impl Forwarder {
    async fn send(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        self.tx
            .send(Envelope {
                origin: Origin::Push,
                generation: self.generation,
                event,
            })
            .await
            .map_err(|_| ChannelError::ReceiverClosed)
    }

    /// Forward a decoded push. Invalid payloads are logged and dropped.
    async fn deliver(&self, decoded: Result<PushMessage, PayloadError>) -> Result<(), ChannelError> {
        let msg = match decoded {
            Ok(msg) => msg,
            Err(PayloadError::UnknownEvent(name)) => {
                debug!(event = %name, "ignoring unknown push event");
                return Ok(());
            }
            Err(e) => {
                warn!("dropping push payload: {e}");
                return Ok(());
            }
        };

        if let Some(server_time) = msg.server_time {
            self.clock.set_server_time(server_time);
        }
        if let PushEvent::Drop(challenge) = &msg.event {
            info!(id = %challenge.id, title = %challenge.title, "challenge drop received");
        }
        self.send(ChannelEvent::Proposal {
            event: msg.event,
            event_id: msg.event_id,
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

async fn run_channel(
    settings: TransportSettings,
    params: JoinParams,
    forwarder: Forwarder,
    mut shutdown: oneshot::Receiver<()>,
) {
    let http = reqwest::Client::new();
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);

    loop {
        let result = match settings.kind {
            TransportKind::WebSocket => {
                run_websocket(&settings, &params, &forwarder, &mut shutdown).await
            }
            TransportKind::Sse => run_sse(&settings, &params, &forwarder, &http, &mut shutdown).await,
        };

        let delay = match result {
            Ok(()) => {
                debug!(generation = forwarder.generation, "push channel closed on request");
                return;
            }
            Err(ChannelError::ReceiverClosed) => return,
            Err(e @ ChannelError::Lost(_)) => {
                warn!("push channel: {e}");
                if forwarder.send(ChannelEvent::Disconnected).await.is_err() {
                    return;
                }
                backoff.reset();
                backoff.next_delay()
            }
            Err(e) => {
                warn!("push channel: {e}");
                backoff.next_delay()
            }
        };

        debug!(delay_ms = delay.as_millis() as u64, "push channel reconnecting");
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One WebSocket connection attempt. `Ok(())` means shutdown was requested.
async fn run_websocket(
    settings: &TransportSettings,
    params: &JoinParams,
    forwarder: &Forwarder,
    shutdown: &mut oneshot::Receiver<()>,
) -> Result<(), ChannelError> {
    let mut request = settings
        .push_url
        .as_str()
        .into_client_request()
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;
    if let Some(token) = &settings.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, _response) = tokio::select! {
        _ = &mut *shutdown => return Ok(()),
        result = tokio_tungstenite::connect_async(request) => {
            result.map_err(|e| ChannelError::Handshake(e.to_string()))?
        }
    };
    let (mut write, mut read) = ws.split();

    let join = join_frame(params).map_err(|e| ChannelError::Handshake(e.to_string()))?;
    write
        .send(Message::Text(join.into()))
        .await
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;
    info!(campus = %params.campus_id, "push channel joined (websocket)");
    forwarder.send(ChannelEvent::Connected).await?;

    loop {
        let next = tokio::select! {
            _ = &mut *shutdown => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            next = read.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => forwarder.deliver(decode_frame(text.as_str())).await?,
            Some(Ok(Message::Close(_))) => {
                return Err(ChannelError::Lost("server sent close frame".into()))
            }
            // Ping/pong are answered by tungstenite; binary frames are not part of the feed.
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ChannelError::Lost(e.to_string())),
            None => return Err(ChannelError::Lost("stream ended".into())),
        }
    }
}

/// One SSE connection attempt. The join parameters are the POST body.
async fn run_sse(
    settings: &TransportSettings,
    params: &JoinParams,
    forwarder: &Forwarder,
    http: &reqwest::Client,
    shutdown: &mut oneshot::Receiver<()>,
) -> Result<(), ChannelError> {
    let mut request = http
        .post(&settings.push_url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(params);
    if let Some(token) = &settings.auth_token {
        request = request.bearer_auth(token);
    }

    let mut es = request
        .eventsource()
        .map_err(|e| ChannelError::Handshake(e.to_string()))?;
    let mut opened = false;
    let mut ids = SseIds::default();

    loop {
        let event = tokio::select! {
            _ = &mut *shutdown => {
                es.close();
                return Ok(());
            }
            event = es.next() => event,
        };
        let Some(event) = event else {
            return Err(ChannelError::Lost("event stream ended".into()));
        };

        let forwarded = match event {
            Ok(Event::Open) => {
                opened = true;
                info!(campus = %params.campus_id, "push channel joined (sse)");
                forwarder.send(ChannelEvent::Connected).await
            }
            Ok(Event::Message(msg)) => {
                let event_id = ids.fresh(msg.id);
                let decoded = serde_json::from_str::<Value>(&msg.data)
                    .map_err(|e| PayloadError::Malformed {
                        event: msg.event.clone(),
                        message: e.to_string(),
                    })
                    .and_then(|payload| decode_push(&msg.event, payload, event_id));
                forwarder.deliver(decoded).await
            }
            Err(err) => {
                es.close();
                let reason = describe_sse_error(&err);
                return Err(if opened {
                    ChannelError::Lost(reason)
                } else {
                    ChannelError::Handshake(reason)
                });
            }
        };

        if let Err(e) = forwarded {
            es.close();
            return Err(e);
        }
    }
}

/// Separates ids an SSE event actually carried from inherited ones.
///
/// The SSE parser stamps every message with the last id seen on the stream,
/// so an event sent without an `id:` line arrives with its predecessor's id.
#[derive(Debug, Default)]
struct SseIds {
    last: String,
}

impl SseIds {
    /// The event's own id, or `None` when it is empty or repeats the last one.
    fn fresh(&mut self, id: String) -> Option<String> {
        if id.is_empty() || id == self.last {
            return None;
        }
        self.last.clone_from(&id);
        Some(id)
    }
}

fn describe_sse_error(err: &reqwest_eventsource::Error) -> String {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _response) => {
            format!("server returned status {status}")
        }
        reqwest_eventsource::Error::Transport(e) => format!("network error: {e}"),
        reqwest_eventsource::Error::StreamEnded => "event stream ended".to_string(),
        other => format!("stream error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
