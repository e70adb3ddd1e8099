use async_trait::async_trait;
use courier_core::{ChatError, ChatErrorCategory, classify_http_status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, trace};
use url::Url;

/// Opens text links to the broker. One link per session attempt.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn FrameLink>, ChatError>;
}

/// Bidirectional text channel carrying STOMP frames.
#[async_trait]
pub trait FrameLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError>;

    /// Next text payload; `None` once the peer closed the link.
    async fn recv_text(&mut self) -> Option<Result<String, ChatError>>;

    async fn close(&mut self);
}

/// WebSocket transport for `ws://` and, with the `tls` feature, `wss://`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn open(&self) -> Result<Box<dyn FrameLink>, ChatError> {
        debug!(url = %self.url, "opening broker websocket");
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(map_ws_error)?;
        trace!(status = %response.status(), "websocket upgrade accepted");
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameLink for WebSocketLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_text(&mut self) -> Option<Result<String, ChatError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|err| {
                        ChatError::malformed(format!("binary frame is not UTF-8: {err}"))
                    }));
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "broker closed websocket");
                    return None;
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(map_ws_error(err))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            trace!(error = %err, "websocket close did not complete cleanly");
        }
    }
}

fn map_ws_error(err: WsError) -> ChatError {
    match err {
        WsError::Http(response) => map_upgrade_status(response.status().as_u16()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => ChatError::new(
            ChatErrorCategory::Connection,
            "link_closed",
            "websocket is closed",
        ),
        other => ChatError::new(
            ChatErrorCategory::Connection,
            "socket_error",
            other.to_string(),
        ),
    }
}

/// Only auth rejections are permanent; any other refused upgrade is retried.
fn map_upgrade_status(status: u16) -> ChatError {
    let category = match classify_http_status(status) {
        ChatErrorCategory::Auth => ChatErrorCategory::Auth,
        _ => ChatErrorCategory::Connection,
    };
    ChatError::new(
        category,
        "handshake_http_error",
        format!("websocket upgrade rejected with HTTP {status}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_upgrade_with_auth_status_is_auth_error() {
        let err = map_upgrade_status(401);
        assert_eq!(err.category, ChatErrorCategory::Auth);
        assert_eq!(err.code, "handshake_http_error");
        assert!(!err.is_recoverable());
        assert!(!map_upgrade_status(403).is_recoverable());
    }

    #[test]
    fn other_upgrade_failures_are_retryable() {
        assert!(map_upgrade_status(503).is_recoverable());
        assert!(map_upgrade_status(404).is_recoverable());
        assert!(map_ws_error(WsError::ConnectionClosed).is_recoverable());
    }
}
