//! STOMP 1.2 text frame codec.

use std::time::Duration;

use courier_core::ChatError;
use thiserror::Error;

/// Errors produced while decoding a broker frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has no command line")]
    MissingCommand,
    #[error("frame ended before the header block was terminated")]
    UnterminatedHeaders,
    #[error("malformed header line '{0}'")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header '{0}'")]
    InvalidEscape(String),
    #[error("content-length '{0}' does not match the frame body")]
    BadContentLength(String),
}

impl From<FrameError> for ChatError {
    fn from(err: FrameError) -> Self {
        ChatError::malformed(err.to_string())
    }
}

/// One STOMP frame. Header order is preserved; lookups return the first match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `CONNECT` carrying the bearer credential and the heart-beat periods we
    /// can send and want to receive.
    pub fn connect(host: &str, credential: &str, outgoing: Duration, incoming: Duration) -> Self {
        Self::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", host)
            .header("Authorization", format!("Bearer {credential}"))
            .header(
                "heart-beat",
                format!("{},{}", outgoing.as_millis(), incoming.as_millis()),
            )
    }

    /// Both `heart-beat` values in milliseconds. Missing or unparsable
    /// headers read as `0,0`.
    pub fn heart_beat(&self) -> (u64, u64) {
        self.get_header("heart-beat")
            .and_then(|value| value.split_once(','))
            .and_then(|(send, receive)| {
                Some((send.trim().parse().ok()?, receive.trim().parse().ok()?))
            })
            .unwrap_or((0, 0))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new("UNSUBSCRIBE").header("id", id)
    }

    /// `SEND` with a JSON body.
    pub fn send(destination: &str, payload: &str) -> Self {
        Self::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json;charset=UTF-8")
            .header("content-length", payload.len().to_string())
            .with_body(payload)
    }

    pub fn disconnect() -> Self {
        Self::new("DISCONNECT")
    }

    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame. Returns `Ok(None)` for a heart-beat (EOL only).
    pub fn decode(text: &str) -> Result<Option<Self>, FrameError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let mut cursor = 0;
        let command = next_line(text, &mut cursor).ok_or(FrameError::MissingCommand)?;
        if command.is_empty() {
            return Err(FrameError::MissingCommand);
        }
        let unescape = escapes_headers(command);

        let mut headers = Vec::new();
        loop {
            let line = next_line(text, &mut cursor).ok_or(FrameError::UnterminatedHeaders)?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_owned()))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_owned(), value.to_owned()));
            }
        }

        let rest = &text[cursor..];
        let frame = Self {
            command: command.to_owned(),
            headers,
            body: String::new(),
        };
        let body = match frame.get_header("content-length") {
            Some(raw) => {
                let length = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::BadContentLength(raw.to_owned()))?;
                rest.get(..length)
                    .ok_or_else(|| FrameError::BadContentLength(raw.to_owned()))?
            }
            None => rest.split('\0').next().unwrap_or_default(),
        };

        Ok(Some(frame.with_body(body)))
    }
}

fn escapes_headers(command: &str) -> bool {
    !matches!(command, "CONNECT" | "CONNECTED")
}

fn next_line<'a>(text: &'a str, cursor: &mut usize) -> Option<&'a str> {
    let rest = &text[*cursor..];
    let end = rest.find('\n')?;
    *cursor += end + 1;
    let line = &rest[..end];
    Some(line.strip_suffix('\r').unwrap_or(line))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_carries_bearer_and_heartbeat() {
        let text = StompFrame::connect(
            "broker.local",
            "tok-1",
            Duration::from_secs(4),
            Duration::from_secs(4),
        )
        .encode();
        assert_eq!(
            text,
            "CONNECT\naccept-version:1.2\nhost:broker.local\nAuthorization:Bearer tok-1\nheart-beat:4000,4000\n\n\0"
        );
    }

    #[test]
    fn reads_heart_beat_header() {
        let connected = StompFrame::new("CONNECTED").header("heart-beat", "10000, 250");
        assert_eq!(connected.heart_beat(), (10_000, 250));
        assert_eq!(StompFrame::new("CONNECTED").heart_beat(), (0, 0));
        assert_eq!(
            StompFrame::new("CONNECTED")
                .header("heart-beat", "soon")
                .heart_beat(),
            (0, 0)
        );
    }

    #[test]
    fn decodes_message_frame_with_content_length() {
        let body = r#"{"id":"m1","content":"a\u0000b"}"#;
        let text = format!(
            "MESSAGE\ndestination:/user/queue/private-messages\nsubscription:private-sub\ncontent-length:{}\n\n{}\0\n",
            body.len(),
            body
        );

        let frame = StompFrame::decode(&text)
            .expect("frame should decode")
            .expect("frame should not be a heartbeat");

        assert_eq!(frame.command, "MESSAGE");
        assert_eq!(
            frame.get_header("destination"),
            Some("/user/queue/private-messages")
        );
        assert_eq!(frame.body, body);
    }

    #[test]
    fn decodes_body_up_to_nul_without_content_length() {
        let frame = StompFrame::decode("ERROR\r\nmessage:bad token\r\n\r\nauth failed\0")
            .expect("frame should decode")
            .expect("frame should not be a heartbeat");
        assert_eq!(frame.command, "ERROR");
        assert_eq!(frame.get_header("message"), Some("bad token"));
        assert_eq!(frame.body, "auth failed");
    }

    #[test]
    fn eol_only_frames_are_heartbeats() {
        assert_eq!(StompFrame::decode("\n"), Ok(None));
        assert_eq!(StompFrame::decode("\r\n\r\n"), Ok(None));
    }

    #[test]
    fn escapes_and_unescapes_headers_outside_connect() {
        let frame = StompFrame::new("SEND")
            .header("note", "a:b\nc\\d")
            .with_body("x");
        let encoded = frame.encode();
        assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));

        let decoded = StompFrame::decode(&encoded)
            .expect("frame should decode")
            .expect("frame should not be a heartbeat");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn connected_headers_are_taken_verbatim() {
        let frame = StompFrame::decode("CONNECTED\nversion:1.2\nuser-name:+100\nserver:a:b\n\n\0")
            .expect("frame should decode")
            .expect("frame should not be a heartbeat");
        assert_eq!(frame.get_header("user-name"), Some("+100"));
        assert_eq!(frame.get_header("server"), Some("a:b"));
    }

    #[test]
    fn rejects_broken_frames() {
        assert_eq!(
            StompFrame::decode("MESSAGE\nno-colon\n\n\0"),
            Err(FrameError::MalformedHeader("no-colon".into()))
        );
        assert_eq!(
            StompFrame::decode("MESSAGE\ndestination:/q"),
            Err(FrameError::UnterminatedHeaders)
        );
        assert_eq!(
            StompFrame::decode("MESSAGE\ncontent-length:99\n\nshort\0"),
            Err(FrameError::BadContentLength("99".into()))
        );
        assert_eq!(
            StompFrame::decode("MESSAGE\nbad:\\x\n\n\0"),
            Err(FrameError::InvalidEscape("\\x".into()))
        );
    }

    #[test]
    fn send_frame_declares_json_body_length() {
        let frame = StompFrame::send("/app/private.sendMessage", r#"{"content":"hé"}"#);
        assert_eq!(frame.get_header("content-length"), Some("17"));
        assert_eq!(
            frame.get_header("content-type"),
            Some("application/json;charset=UTF-8")
        );
    }
}
