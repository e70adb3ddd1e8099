use thiserror::Error;
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
};

use crate::types::{ChatCommand, ChatEvent, InboundFrame};

/// Broadcast event stream type used by frontend subscribers.
pub type EventStream = broadcast::Receiver<ChatEvent>;

/// Receiving half of the inbound frame queue drained by the dispatcher.
pub type InboundFrames = mpsc::Receiver<InboundFrame>;

/// Errors returned by chat channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatChannelError {
    /// The runtime stopped and dropped its command receiver.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The command queue is at capacity.
    #[error("command channel is full")]
    CommandChannelFull,
}

/// Command/event channel pair shared by the runtime and frontend handles.
#[derive(Clone, Debug)]
pub struct ChatChannels {
    command_tx: mpsc::Sender<ChatCommand>,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<ChatCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Clone the event sender, for producers outside the runtime task.
    pub fn event_sender(&self) -> broadcast::Sender<ChatEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted chat events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Send one command to the runtime, waiting for queue capacity.
    pub async fn send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChatChannelError::CommandChannelClosed)
    }

    /// Enqueue a command from synchronous UI code without waiting.
    pub fn try_send_command(&self, command: ChatCommand) -> Result<(), ChatChannelError> {
        self.command_tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ChatChannelError::CommandChannelFull,
            TrySendError::Closed(_) => ChatChannelError::CommandChannelClosed,
        })
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Bounded queue carrying subscription frames from the broker session to
/// the dispatcher. A full queue makes the session reader wait.
pub fn inbound_queue(capacity: usize) -> (mpsc::Sender<InboundFrame>, InboundFrames) {
    mpsc::channel(capacity.max(1))
}
