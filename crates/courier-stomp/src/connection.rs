use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use courier_core::{
    ChatError, ChatErrorCategory, ChatEvent, ConnectionState, ConnectionStateMachine,
    InboundFrame, Publisher, RetryPolicy, normalize_fatal_error,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    frame::StompFrame,
    transport::{FrameLink, FrameTransport},
};

/// Per-user queue carrying private messages.
pub const PRIVATE_QUEUE: &str = "/user/queue/private-messages";
/// Subscription id registered for [`PRIVATE_QUEUE`].
pub const PRIVATE_SUBSCRIPTION_ID: &str = "private-sub";

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(4_000);

/// Session loop settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Value of the STOMP `host` header.
    pub broker_host: String,
    pub retry: RetryPolicy,
    /// Heart-beat period we offer to send; zero disables it.
    pub heartbeat_interval: Duration,
    /// Heart-beat period we ask the broker for; zero disables the silence
    /// watchdog.
    pub incoming_heartbeat: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_owned(),
            retry: RetryPolicy::fixed(DEFAULT_RECONNECT_DELAY),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            incoming_heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of the latest session attempt.
#[derive(Debug, Clone, Default)]
struct LinkStatus {
    principal: Option<String>,
    last_error: Option<ChatError>,
}

struct Shared {
    machine: Mutex<ConnectionStateMachine>,
    status_tx: watch::Sender<LinkStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    fn begin_connect(&self) {
        match lock(&self.machine).begin_connect() {
            Ok(event) => self.emit(event),
            Err(err) => debug!(error = %err, "connect requested outside disconnected state"),
        }
    }

    fn mark_connected(&self, principal: String, outbound: mpsc::UnboundedSender<String>) {
        *lock(&self.outbound) = Some(outbound);
        match lock(&self.machine).on_handshake_complete() {
            Ok(event) => self.emit(event),
            Err(err) => warn!(error = %err, "handshake completed in unexpected state"),
        }
        self.status_tx.send_modify(|status| {
            status.principal = Some(principal.clone());
            status.last_error = None;
        });
        self.emit(ChatEvent::SessionReady { principal });
    }

    fn mark_disconnected(&self, error: Option<ChatError>, retry_in: Option<Duration>) {
        *lock(&self.outbound) = None;
        let retry_in_ms = retry_in.map(|delay| delay.as_millis() as u64);
        if let Some(event) = lock(&self.machine).on_closed(retry_in_ms) {
            self.emit(event);
        }
        self.status_tx.send_modify(|status| {
            status.principal = None;
            status.last_error = error;
        });
    }

    fn publish(&self, text: String) -> Result<(), ChatError> {
        lock(&self.machine).ensure_connected("publish")?;
        let outbound = lock(&self.outbound);
        let Some(sender) = outbound.as_ref() else {
            return Err(ChatError::not_connected("publish"));
        };
        sender
            .send(text)
            .map_err(|_| ChatError::not_connected("publish"))
    }
}

struct RunningConnection {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the broker session: handshake, subscription, heart-beats, publish
/// and automatic reconnection.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    running: tokio::sync::Mutex<Option<RunningConnection>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        config: ConnectionConfig,
        inbound_tx: mpsc::Sender<InboundFrame>,
        event_tx: broadcast::Sender<ChatEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(ConnectionStateMachine::default()),
                status_tx,
                outbound: Mutex::new(None),
                inbound_tx,
                event_tx,
            }),
            transport,
            config,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.machine).state()
    }

    /// Principal reported by the broker for the live session.
    pub fn principal(&self) -> Option<String> {
        if !lock(&self.shared.machine).is_connected() {
            return None;
        }
        self.shared.status_tx.borrow().principal.clone()
    }

    /// Open the session, or join the one already open or opening.
    ///
    /// Resolves with the outcome of the next handshake attempt. On a
    /// retryable failure the background loop keeps reconnecting after this
    /// returns; call [`ConnectionManager::disconnect`] to stop it.
    pub async fn connect(&self, credential: &str) -> Result<String, ChatError> {
        let mut status_rx = self.shared.status_tx.subscribe();
        {
            let mut running = self.running.lock().await;
            if let Some(principal) = self.principal() {
                debug!(%principal, "session already established");
                return Ok(principal);
            }
            let alive = running.as_ref().is_some_and(|run| !run.task.is_finished());
            if alive {
                debug!("joining in-flight session attempt");
            } else {
                *running = Some(self.spawn_session_loop(credential.to_owned()));
            }
        }

        let status = status_rx
            .changed()
            .await
            .map(|_| status_rx.borrow_and_update().clone())
            .map_err(|_| {
                ChatError::new(
                    ChatErrorCategory::Internal,
                    "connection_dropped",
                    "connection manager was dropped",
                )
            })?;

        match (status.principal, status.last_error) {
            (Some(principal), _) => Ok(principal),
            (None, Some(err)) => Err(err),
            (None, None) => Err(session_closed_error()),
        }
    }

    /// Close the session and cancel any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            if let Err(err) = running.task.await {
                warn!(error = %err, "session task ended abnormally");
            }
        }
        if self.state() != ConnectionState::Disconnected {
            self.shared.mark_disconnected(None, None);
        }
    }

    /// Queue one `SEND` frame on the live session.
    pub fn publish(&self, destination: &str, payload: &str) -> Result<(), ChatError> {
        self.shared
            .publish(StompFrame::send(destination, payload).encode())
    }

    fn spawn_session_loop(&self, credential: String) -> RunningConnection {
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_session_loop(
            self.shared.clone(),
            self.transport.clone(),
            self.config.clone(),
            credential,
            stop.child_token(),
        ));
        RunningConnection { stop, task }
    }
}

impl Publisher for ConnectionManager {
    fn publish(&self, destination: &str, payload: &str) -> Result<(), ChatError> {
        ConnectionManager::publish(self, destination, payload)
    }
}

enum SessionEnd {
    Stopped,
    Lost(ChatError),
}

/// Heart-beat periods agreed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeats {
    /// How often we must send something.
    outgoing: Duration,
    /// How often the broker promised to send something.
    incoming: Duration,
}

impl Heartbeats {
    /// STOMP 1.2 negotiation: a direction is active only when both sides
    /// want it, at the slower of the two periods.
    fn negotiate(config: &ConnectionConfig, connected: &StompFrame) -> Self {
        let (server_send, server_receive) = connected.heart_beat();
        let agree = |ours: Duration, theirs: u64| {
            if ours.is_zero() || theirs == 0 {
                Duration::ZERO
            } else {
                ours.max(Duration::from_millis(theirs))
            }
        };
        Self {
            outgoing: agree(config.heartbeat_interval, server_receive),
            incoming: agree(config.incoming_heartbeat, server_send),
        }
    }

    /// Silence after which the link is presumed dead.
    fn silence_limit(&self) -> Option<Duration> {
        (!self.incoming.is_zero()).then(|| self.incoming * 2)
    }
}

async fn run_session_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    credential: String,
    stop: CancellationToken,
) {
    loop {
        shared.begin_connect();

        let handshake = tokio::select! {
            _ = stop.cancelled() => break,
            result = tokio::time::timeout(
                config.handshake_timeout,
                open_session(transport.as_ref(), &config, &credential),
            ) => result.unwrap_or_else(|_| Err(ChatError::new(
                ChatErrorCategory::Connection,
                "handshake_timeout",
                format!("no CONNECTED frame within {:?}", config.handshake_timeout),
            ))),
        };

        let err = match handshake {
            Ok((link, principal, heartbeats)) => {
                info!(
                    %principal,
                    outgoing_ms = heartbeats.outgoing.as_millis() as u64,
                    incoming_ms = heartbeats.incoming.as_millis() as u64,
                    "broker session established"
                );
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                shared.mark_connected(principal, outbound_tx);
                match pump_session(link, outbound_rx, &shared, heartbeats, &stop).await {
                    SessionEnd::Stopped => break,
                    SessionEnd::Lost(err) => err,
                }
            }
            Err(err) => err,
        };

        let recoverable = err.is_recoverable();
        shared.emit(normalize_fatal_error(err.clone(), recoverable));

        if !recoverable {
            error!(error = %err, "broker session failed permanently");
            shared.mark_disconnected(Some(err), None);
            return;
        }

        let delay = config.retry.next_delay(err.retry_after_ms);
        warn!(
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "broker session lost; reconnect scheduled"
        );
        shared.mark_disconnected(Some(err), Some(delay));

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.mark_disconnected(Some(session_closed_error()), None);
    debug!("broker session loop stopped");
}

async fn open_session(
    transport: &dyn FrameTransport,
    config: &ConnectionConfig,
    credential: &str,
) -> Result<(Box<dyn FrameLink>, String, Heartbeats), ChatError> {
    let mut link = transport.open().await?;
    link.send_text(
        StompFrame::connect(
            &config.broker_host,
            credential,
            config.heartbeat_interval,
            config.incoming_heartbeat,
        )
        .encode(),
    )
    .await?;

    let (principal, heartbeats) = loop {
        let text = match link.recv_text().await {
            Some(Ok(text)) => text,
            Some(Err(err)) if err.category == ChatErrorCategory::Malformed => {
                warn!(error = %err, "dropping unreadable payload during handshake");
                continue;
            }
            Some(Err(err)) => return Err(err),
            None => {
                return Err(ChatError::new(
                    ChatErrorCategory::Connection,
                    "handshake_failed",
                    "broker closed the link during the handshake",
                ));
            }
        };
        let frame = match StompFrame::decode(&text) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                return Err(ChatError::new(
                    ChatErrorCategory::Connection,
                    "handshake_failed",
                    format!("undecodable handshake frame: {err}"),
                ));
            }
        };
        match frame.command.as_str() {
            "CONNECTED" => {
                let principal = frame
                    .get_header("user-name")
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        ChatError::new(
                            ChatErrorCategory::Auth,
                            "missing_principal",
                            "CONNECTED frame carried no user-name",
                        )
                    })?;
                break (principal, Heartbeats::negotiate(config, &frame));
            }
            "ERROR" => {
                return Err(ChatError::new(
                    ChatErrorCategory::Auth,
                    "auth_rejected",
                    frame
                        .get_header("message")
                        .unwrap_or("broker rejected CONNECT"),
                ));
            }
            other => trace!(command = other, "ignoring frame before CONNECTED"),
        }
    };

    link.send_text(StompFrame::subscribe(PRIVATE_SUBSCRIPTION_ID, PRIVATE_QUEUE).encode())
        .await?;
    Ok((link, principal, heartbeats))
}

async fn pump_session(
    mut link: Box<dyn FrameLink>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shared: &Shared,
    heartbeats: Heartbeats,
    stop: &CancellationToken,
) -> SessionEnd {
    let mut heartbeat = heartbeat_ticker(heartbeats.outgoing);
    let silence_limit = heartbeats.silence_limit();
    let mut silence_deadline = silence_limit.map(|limit| Instant::now() + limit);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                for frame in [
                    StompFrame::unsubscribe(PRIVATE_SUBSCRIPTION_ID),
                    StompFrame::disconnect(),
                ] {
                    if let Err(err) = link.send_text(frame.encode()).await {
                        debug!(error = %err, command = %frame.command, "teardown frame not delivered");
                        break;
                    }
                }
                link.close().await;
                return SessionEnd::Stopped;
            }
            incoming = link.recv_text() => {
                silence_deadline = silence_limit.map(|limit| Instant::now() + limit);
                let text = match incoming {
                    Some(Ok(text)) => text,
                    Some(Err(err)) if err.category == ChatErrorCategory::Malformed => {
                        warn!(error = %err, "dropping unreadable broker payload");
                        continue;
                    }
                    Some(Err(err)) => return SessionEnd::Lost(err),
                    None => {
                        return SessionEnd::Lost(ChatError::new(
                            ChatErrorCategory::Connection,
                            "connection_closed",
                            "broker closed the link",
                        ));
                    }
                };
                match StompFrame::decode(&text) {
                    Ok(Some(frame)) => {
                        if let Err(err) = route_frame(frame, shared).await {
                            return SessionEnd::Lost(err);
                        }
                    }
                    Ok(None) => trace!("broker heart-beat"),
                    Err(err) => warn!(error = %err, "dropping undecodable broker frame"),
                }
            }
            Some(text) = outbound_rx.recv() => {
                if let Err(err) = link.send_text(text).await {
                    return SessionEnd::Lost(err);
                }
            }
            _ = next_heartbeat(&mut heartbeat) => {
                if let Err(err) = link.send_text("\n".to_owned()).await {
                    return SessionEnd::Lost(err);
                }
            }
            _ = silence_elapsed(silence_deadline) => {
                link.close().await;
                return SessionEnd::Lost(ChatError::new(
                    ChatErrorCategory::Connection,
                    "heartbeat_timeout",
                    format!(
                        "broker silent for more than {:?}",
                        silence_limit.unwrap_or_default()
                    ),
                ));
            }
        }
    }
}

async fn route_frame(frame: StompFrame, shared: &Shared) -> Result<(), ChatError> {
    match frame.command.as_str() {
        "MESSAGE" => {
            let destination = frame.get_header("destination").map(str::to_owned);
            shared
                .inbound_tx
                .send(InboundFrame::new(destination, frame.body))
                .await
                .map_err(|_| {
                    ChatError::new(
                        ChatErrorCategory::Internal,
                        "inbound_queue_closed",
                        "no consumer is draining inbound frames",
                    )
                })
        }
        "ERROR" => Err(ChatError::new(
            ChatErrorCategory::Connection,
            "broker_error",
            frame.get_header("message").unwrap_or("broker sent ERROR"),
        )),
        "RECEIPT" => {
            trace!(receipt = ?frame.get_header("receipt-id"), "broker receipt");
            Ok(())
        }
        other => {
            debug!(command = other, "ignoring unexpected broker frame");
            Ok(())
        }
    }
}

fn heartbeat_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn silence_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn session_closed_error() -> ChatError {
    ChatError::new(
        ChatErrorCategory::Connection,
        "connection_closed",
        "session closed before the handshake completed",
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
