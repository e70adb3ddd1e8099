//! In-memory broker and history fakes shared by the crate's tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{ChatError, ChatErrorCategory, ChatEvent, MessageRecord};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    connection::{PRIVATE_QUEUE, PRIVATE_SUBSCRIPTION_ID},
    frame::StompFrame,
    history::{HistoryLoader, HistoryRequest},
    transport::{FrameLink, FrameTransport},
};

const WAIT: Duration = Duration::from_secs(2);

/// Transport whose every `open` hands the broker side of a fresh link to the test.
pub(crate) struct MemoryTransport {
    brokers: mpsc::UnboundedSender<BrokerEnd>,
    refusals: Mutex<VecDeque<ChatError>>,
    pub(crate) opens: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEnd>) {
        let (brokers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            brokers,
            refusals: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
        });
        (transport, rx)
    }

    /// Fail the next `open` with `err`.
    pub(crate) fn refuse_next(&self, err: ChatError) {
        self.refusals
            .lock()
            .expect("refusal queue lock should not be poisoned")
            .push_back(err);
    }
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn open(&self) -> Result<Box<dyn FrameLink>, ChatError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refusal = self
            .refusals
            .lock()
            .expect("refusal queue lock should not be poisoned")
            .pop_front();
        if let Some(err) = refusal {
            return Err(err);
        }

        let (to_broker, from_client) = mpsc::unbounded_channel();
        let (to_client, from_broker) = mpsc::unbounded_channel();
        let _ = self.brokers.send(BrokerEnd {
            to_client,
            from_client,
            next_message_id: 0,
        });
        Ok(Box::new(MemoryLink {
            to_broker,
            from_broker,
        }))
    }
}

struct MemoryLink {
    to_broker: mpsc::UnboundedSender<String>,
    from_broker: mpsc::UnboundedReceiver<Result<String, ChatError>>,
}

#[async_trait]
impl FrameLink for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.to_broker.send(text).map_err(|_| {
            ChatError::new(
                ChatErrorCategory::Connection,
                "link_closed",
                "memory broker hung up",
            )
        })
    }

    async fn recv_text(&mut self) -> Option<Result<String, ChatError>> {
        self.from_broker.recv().await
    }

    async fn close(&mut self) {
        self.from_broker.close();
    }
}

/// Broker side of one memory link. Dropping it closes the link.
pub(crate) struct BrokerEnd {
    to_client: mpsc::UnboundedSender<Result<String, ChatError>>,
    from_client: mpsc::UnboundedReceiver<String>,
    next_message_id: u64,
}

impl BrokerEnd {
    /// Next non-heartbeat frame sent by the client.
    pub(crate) async fn next_frame(&mut self) -> StompFrame {
        loop {
            let text = tokio::time::timeout(WAIT, self.from_client.recv())
                .await
                .expect("client frame should arrive in time")
                .expect("client link should stay open");
            if let Some(frame) = StompFrame::decode(&text).expect("client frame should decode") {
                return frame;
            }
        }
    }

    pub(crate) fn reply(&self, frame: StompFrame) {
        self.send_raw(&frame.encode());
    }

    /// Push text exactly as given, valid frame or not.
    pub(crate) fn send_raw(&self, text: &str) {
        self.to_client
            .send(Ok(text.to_owned()))
            .expect("client should be listening");
    }

    /// Push a payload the link cannot read as text.
    pub(crate) fn send_unreadable(&self) {
        self.to_client
            .send(Err(ChatError::malformed("binary frame is not UTF-8")))
            .expect("client should be listening");
    }

    pub(crate) fn heartbeat(&self) {
        self.send_raw("\n");
    }

    /// Complete the handshake for `principal` and consume the SUBSCRIBE.
    pub(crate) async fn accept(&mut self, principal: &str) {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, "CONNECT");
        self.reply(
            StompFrame::new("CONNECTED")
                .header("version", "1.2")
                .header("user-name", principal),
        );
        let subscribe = self.next_frame().await;
        assert_eq!(subscribe.command, "SUBSCRIBE");
    }

    /// Push one MESSAGE on the private queue.
    pub(crate) fn deliver(&mut self, body: &str) {
        self.next_message_id += 1;
        self.reply(
            StompFrame::new("MESSAGE")
                .header("destination", PRIVATE_QUEUE)
                .header("subscription", PRIVATE_SUBSCRIPTION_ID)
                .header("message-id", self.next_message_id.to_string())
                .header("content-length", body.len().to_string())
                .with_body(body),
        );
    }
}

pub(crate) async fn next_broker(brokers: &mut mpsc::UnboundedReceiver<BrokerEnd>) -> BrokerEnd {
    tokio::time::timeout(WAIT, brokers.recv())
        .await
        .expect("client should open a link in time")
        .expect("transport should stay alive")
}

/// Skip events until one matches `predicate`.
pub(crate) async fn expect_event<F>(events: &mut broadcast::Receiver<ChatEvent>, predicate: F) -> ChatEvent
where
    F: Fn(&ChatEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream should stay open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event should arrive in time")
}

pub(crate) type PendingFetch = (
    HistoryRequest,
    oneshot::Sender<Result<Vec<MessageRecord>, ChatError>>,
);

/// History loader that parks every request until the test answers it.
pub(crate) struct GatedHistory {
    requests: mpsc::UnboundedSender<PendingFetch>,
}

impl GatedHistory {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PendingFetch>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { requests }), rx)
    }
}

#[async_trait]
impl HistoryLoader for GatedHistory {
    async fn fetch(&self, request: HistoryRequest) -> Result<Vec<MessageRecord>, ChatError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((request, reply_tx))
            .map_err(|_| ChatError::new(ChatErrorCategory::HistoryFetch, "gate_closed", "test gate dropped"))?;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ChatError::new(ChatErrorCategory::HistoryFetch, "gate_closed", "test gate dropped")))
    }
}

pub(crate) async fn next_fetch(requests: &mut mpsc::UnboundedReceiver<PendingFetch>) -> PendingFetch {
    tokio::time::timeout(WAIT, requests.recv())
        .await
        .expect("history request should arrive in time")
        .expect("history gate should stay open")
}
