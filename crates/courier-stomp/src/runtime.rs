use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use courier_core::{
    ChatChannelError, ChatChannels, ChatCommand, ChatError, ChatErrorCategory, ChatEvent,
    DEFAULT_ECHO_WINDOW_MS, Dispatched, Dispatcher, EventStream, HistoryTicket, InboundFrame,
    InboundFrames, LiveOutcome, MessageRecord, OutboundSender, ReconciliationEngine,
    RetryPolicy, TimelineChange, inbound_queue, normalize_fatal_error, normalize_send_failure,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    connection::{
        ConnectionConfig, ConnectionManager, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY,
    },
    history::{DEFAULT_HISTORY_PAGE_SIZE, HistoryLoader, HistoryRequest, HttpHistoryLoader},
    transport::{FrameTransport, WebSocketTransport},
};

pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 256;

/// Everything the runtime needs to reach the broker and the history API.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub broker_url: Url,
    pub rest_base_url: Url,
    pub credential: String,
    /// Local user id; the sender of every optimistic record.
    pub local_user: String,
    pub reconnect_delay: Duration,
    /// Heart-beat period requested in both directions.
    pub heartbeat_interval: Duration,
    pub history_page_size: u16,
    pub echo_window_ms: u64,
    pub inbound_queue_capacity: usize,
}

impl RuntimeConfig {
    pub fn new(
        broker_url: Url,
        rest_base_url: Url,
        credential: impl Into<String>,
        local_user: impl Into<String>,
    ) -> Self {
        Self {
            broker_url,
            rest_base_url,
            credential: credential.into(),
            local_user: local_user.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            echo_window_ms: DEFAULT_ECHO_WINDOW_MS,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            broker_host: self
                .broker_url
                .host_str()
                .unwrap_or("localhost")
                .to_owned(),
            retry: RetryPolicy::fixed(self.reconnect_delay),
            heartbeat_interval: self.heartbeat_interval,
            incoming_heartbeat: self.heartbeat_interval,
            ..ConnectionConfig::default()
        }
    }
}

/// Frontend handle: send commands, subscribe to events.
#[derive(Clone)]
pub struct ChatRuntimeHandle {
    channels: ChatChannels,
    connection: Arc<ConnectionManager>,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.send_command(command).await
    }

    pub fn try_send(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.channels.try_send_command(command)
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

/// Spawn the runtime against the configured WebSocket broker and REST API.
pub fn spawn_runtime(config: RuntimeConfig) -> Result<ChatRuntimeHandle, ChatError> {
    let transport = Arc::new(WebSocketTransport::new(config.broker_url.clone()));
    let history = Arc::new(HttpHistoryLoader::new(
        config.rest_base_url.clone(),
        config.credential.clone(),
    )?);
    Ok(spawn_runtime_with(config, transport, history))
}

/// Spawn the runtime with caller-provided transport and history source.
pub fn spawn_runtime_with(
    config: RuntimeConfig,
    transport: Arc<dyn FrameTransport>,
    history: Arc<dyn HistoryLoader>,
) -> ChatRuntimeHandle {
    let (channels, command_rx) = ChatChannels::new(128, 512);
    let (inbound_tx, inbound_rx) = inbound_queue(config.inbound_queue_capacity);
    let connection = Arc::new(ConnectionManager::new(
        transport,
        config.connection_config(),
        inbound_tx,
        channels.event_sender(),
    ));

    let runtime = ChatRuntime::new(
        config,
        channels.event_sender(),
        command_rx,
        inbound_rx,
        connection.clone(),
        history,
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle {
        channels,
        connection,
    }
}

struct HistoryResult {
    ticket: HistoryTicket,
    result: Result<Vec<MessageRecord>, ChatError>,
}

struct ChatRuntime {
    config: RuntimeConfig,
    events: broadcast::Sender<ChatEvent>,
    command_rx: mpsc::Receiver<ChatCommand>,
    inbound_rx: InboundFrames,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: mpsc::UnboundedReceiver<HistoryResult>,
    connection: Arc<ConnectionManager>,
    history: Arc<dyn HistoryLoader>,
    engine: ReconciliationEngine,
    dispatcher: Dispatcher,
    sender: OutboundSender,
}

impl ChatRuntime {
    fn new(
        config: RuntimeConfig,
        events: broadcast::Sender<ChatEvent>,
        command_rx: mpsc::Receiver<ChatCommand>,
        inbound_rx: InboundFrames,
        connection: Arc<ConnectionManager>,
        history: Arc<dyn HistoryLoader>,
    ) -> Self {
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let engine = ReconciliationEngine::new(config.local_user.clone())
            .with_echo_window_ms(config.echo_window_ms);
        let sender = OutboundSender::new(config.local_user.clone());
        Self {
            config,
            events,
            command_rx,
            inbound_rx,
            history_tx,
            history_rx,
            connection,
            history,
            engine,
            dispatcher: Dispatcher::default(),
            sender,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command).await {
                        let recoverable = !matches!(
                            err.category,
                            ChatErrorCategory::Auth | ChatErrorCategory::Internal
                        );
                        self.emit(normalize_fatal_error(err, recoverable));
                    }
                }
                Some(frame) = self.inbound_rx.recv() => self.handle_inbound(frame),
                Some(result) = self.history_rx.recv() => self.handle_history_result(result),
            }
        }

        self.connection.disconnect().await;
        info!(stats = ?self.dispatcher.stats(), "chat runtime stopped");
    }

    async fn handle_command(&mut self, command: ChatCommand) -> Result<(), ChatError> {
        match command {
            ChatCommand::Connect => {
                self.handle_connect();
                Ok(())
            }
            ChatCommand::Disconnect => {
                self.connection.disconnect().await;
                Ok(())
            }
            ChatCommand::SelectConversation { counterpart } => {
                self.handle_select_conversation(counterpart)
            }
            ChatCommand::CloseConversation => {
                if let Some(key) = self.engine.deactivate() {
                    debug!(%key, "conversation closed");
                }
                Ok(())
            }
            ChatCommand::SendText { recipient, content } => {
                self.handle_send_text(recipient, content)
            }
            ChatCommand::SendRoomText { room_id, content } => {
                match self
                    .sender
                    .send_room(self.connection.as_ref(), &room_id, &content)
                {
                    Err(err) if err.category == ChatErrorCategory::Send => {
                        warn!(%room_id, error = %err, "room publish failed");
                        self.emit(ChatEvent::SendFailed {
                            correlation_id: None,
                            code: err.code,
                        });
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    /// The handshake runs off the command loop so frames keep draining.
    fn handle_connect(&self) {
        let connection = self.connection.clone();
        let credential = self.config.credential.clone();
        let local_user = self.config.local_user.clone();
        tokio::spawn(async move {
            match connection.connect(&credential).await {
                Ok(principal) if principal != local_user => warn!(
                    %principal,
                    %local_user,
                    "broker principal differs from configured local user"
                ),
                Ok(principal) => debug!(%principal, "connect resolved"),
                Err(err) => warn!(error = %err, "connect attempt failed"),
            }
        });
    }

    fn handle_select_conversation(&mut self, counterpart: String) -> Result<(), ChatError> {
        let counterpart = counterpart.trim().to_owned();
        if counterpart.is_empty() || counterpart == self.config.local_user {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_counterpart",
                format!("cannot open a conversation with '{counterpart}'"),
            ));
        }

        let ticket = self.engine.activate(counterpart.clone());
        self.emit(ChatEvent::TimelineReset {
            counterpart: counterpart.clone(),
            items: Vec::new(),
            loading: true,
            history_error: None,
        });

        let request = HistoryRequest::first_page(
            &self.config.local_user,
            &counterpart,
            self.config.history_page_size,
        );
        let loader = self.history.clone();
        let results = self.history_tx.clone();
        tokio::spawn(async move {
            let result = loader.fetch(request).await;
            let _ = results.send(HistoryResult { ticket, result });
        });
        Ok(())
    }

    fn handle_send_text(&mut self, recipient: String, content: String) -> Result<(), ChatError> {
        let receipt = self.sender.send(
            &mut self.engine,
            self.connection.as_ref(),
            &recipient,
            &content,
            now_millis(),
        )?;

        if let Some(record) = self.engine.items().get(receipt.index).cloned() {
            self.emit_change(TimelineChange::Appended {
                index: receipt.index,
                record,
            });
        }

        if let Some(error) = receipt.failure {
            self.emit(normalize_send_failure(Some(receipt.correlation_id), error));
        }
        Ok(())
    }

    fn handle_inbound(&mut self, frame: InboundFrame) {
        match self
            .dispatcher
            .dispatch(&mut self.engine, &frame, now_millis())
        {
            Dispatched::Live { outcome, .. } => self.emit_live_outcome(outcome),
            Dispatched::Notification(record) => {
                let from = record
                    .conversation_key
                    .counterpart_of(&self.config.local_user)
                    .unwrap_or(record.sender.as_str())
                    .to_owned();
                self.emit(ChatEvent::Notification { from, record });
            }
            Dispatched::Dropped(_) => {}
        }
    }

    fn handle_history_result(&mut self, HistoryResult { ticket, result }: HistoryResult) {
        let applied = match result {
            Ok(records) => self.engine.ingest_history(&ticket, records),
            Err(err) => self.engine.fail_history(&ticket, err.message),
        };

        if let Err(err) = applied {
            debug!(key = %ticket.key(), code = %err.code, "history result discarded");
            return;
        }

        let Some(counterpart) = self.engine.active_counterpart() else {
            return;
        };
        self.emit(ChatEvent::TimelineReset {
            counterpart: counterpart.to_owned(),
            items: self.engine.items().to_vec(),
            loading: false,
            history_error: self.engine.history_error().map(str::to_owned),
        });
    }

    fn emit_live_outcome(&self, outcome: LiveOutcome) {
        let Some(index) = outcome.index() else {
            return;
        };
        let Some(record) = self.engine.items().get(index).cloned() else {
            return;
        };
        match outcome {
            LiveOutcome::Appended { .. } => {
                self.emit_change(TimelineChange::Appended { index, record })
            }
            LiveOutcome::Confirmed { .. } => {
                self.emit_change(TimelineChange::Replaced { index, record })
            }
            _ => {}
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn emit_change(&self, change: TimelineChange) {
        let Some(counterpart) = self.engine.active_counterpart() else {
            return;
        };
        self.emit(ChatEvent::TimelineChanged {
            counterpart: counterpart.to_owned(),
            change,
        });
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
