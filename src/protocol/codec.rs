//! Text protocol codec for the push channel
//!
//! Encodes the client control lines (`CONNECT`, `SUB`, `UNSUB`, `PING`,
//! `PONG`) and decodes the frames the broker delivers over the socket.
//! Every function here is pure; the client owns all I/O.

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;

pub const CRLF: &str = "\r\n";

const STALE_CONNECTION_MARKER: &str = "stale connection";

/// Options sent in the `CONNECT` handshake line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
}

/// A `MSG` frame delivered for one of our subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFrame {
    pub subject: String,
    pub subscription_id: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

impl MessageFrame {
    /// Payload as text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Server frames understood by the client
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `INFO {json}` server greeting, kept verbatim
    Info(String),
    Message(MessageFrame),
    Ping,
    Pong,
    /// `+OK`, only sent by servers when verbose mode is on
    Ack,
    /// `-ERR '<text>'`
    Error(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Frame header is not valid UTF-8")]
    InvalidEncoding,
    #[error("Malformed MSG header: {0:?}")]
    MalformedHeader(String),
    #[error("Invalid payload byte count: {0:?}")]
    InvalidByteCount(String),
    #[error("MSG frame declares {declared} payload bytes but carries no payload section")]
    MissingPayload { declared: usize },
    #[error("Client-only command received from server: {0}")]
    ClientCommand(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

pub struct ProtocolCodec;

impl ProtocolCodec {
    pub fn encode_connect(options: &ConnectOptions) -> String {
        format!(
            "CONNECT {{\"verbose\":{},\"pedantic\":{},\"tls_required\":{}}}{CRLF}",
            options.verbose, options.pedantic, options.tls_required
        )
    }

    pub fn encode_subscribe(subject: &str, subscription_id: &str) -> String {
        format!("SUB {subject} {subscription_id}{CRLF}")
    }

    pub fn encode_unsubscribe(subscription_id: &str) -> String {
        format!("UNSUB {subscription_id}{CRLF}")
    }

    /// Liveness probe. Sent bare, without a trailing CRLF.
    pub fn encode_ping() -> String {
        "PING".to_string()
    }

    pub fn encode_pong() -> String {
        "PONG".to_string()
    }

    /// Random five digit subscription id
    pub fn generate_subscription_id() -> String {
        rand::rng().random_range(10_000..=99_999).to_string()
    }

    /// Cheap shape check before handing a payload to the JSON decoder
    pub fn is_likely_json(text: &str) -> bool {
        let trimmed = text.trim();
        (trimmed.starts_with('{') && trimmed.ends_with('}'))
            || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    }

    /// Whether an `-ERR` text tells us the server has dropped our session
    pub fn is_stale_connection(error_text: &str) -> bool {
        error_text
            .to_ascii_lowercase()
            .contains(STALE_CONNECTION_MARKER)
    }

    /// Decode one socket frame.
    ///
    /// The header runs up to the first CRLF. For `MSG` frames the header
    /// carries `subject sid [reply-to] bytes` and the payload follows the
    /// CRLF. The declared byte count is not trusted: the payload is cut to
    /// the declared length only when enough bytes are present, otherwise
    /// everything after the header (minus one trailing CRLF) is used.
    pub fn decode_frame(raw: &[u8]) -> Result<InboundFrame, ProtocolError> {
        let (header_bytes, body) = split_header(raw);
        let header = std::str::from_utf8(header_bytes)
            .map_err(|_| ProtocolError::InvalidEncoding)?
            .trim();

        if header.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        let (verb, rest) = match header.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (header, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "MSG" => Self::decode_message(rest, body).map(InboundFrame::Message),
            "INFO" => Ok(InboundFrame::Info(rest.to_string())),
            "PING" => Ok(InboundFrame::Ping),
            "PONG" => Ok(InboundFrame::Pong),
            "+OK" => Ok(InboundFrame::Ack),
            "-ERR" => Ok(InboundFrame::Error(rest.trim_matches('\'').to_string())),
            "CONNECT" | "SUB" | "UNSUB" | "PUB" | "HPUB" => {
                Err(ProtocolError::ClientCommand(verb.to_string()))
            }
            _ => Err(ProtocolError::UnknownCommand(verb.to_string())),
        }
    }

    fn decode_message(fields: &str, body: Option<&[u8]>) -> Result<MessageFrame, ProtocolError> {
        let parts: Vec<&str> = fields.split_ascii_whitespace().collect();
        let (subject, subscription_id, reply_to, count) = match parts.as_slice() {
            [subject, sid, count] => (*subject, *sid, None, *count),
            [subject, sid, reply_to, count] => (*subject, *sid, Some(reply_to.to_string()), *count),
            _ => return Err(ProtocolError::MalformedHeader(fields.to_string())),
        };

        let declared: usize = count
            .parse()
            .map_err(|_| ProtocolError::InvalidByteCount(count.to_string()))?;

        let payload = match body {
            Some(body) => {
                let body = body.strip_suffix(CRLF.as_bytes()).unwrap_or(body);
                if declared <= body.len() {
                    &body[..declared]
                } else {
                    body
                }
            }
            None if declared == 0 => &[][..],
            None => return Err(ProtocolError::MissingPayload { declared }),
        };

        Ok(MessageFrame {
            subject: subject.to_string(),
            subscription_id: subscription_id.to_string(),
            reply_to,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn split_header(raw: &[u8]) -> (&[u8], Option<&[u8]>) {
    match raw.windows(2).position(|window| window == CRLF.as_bytes()) {
        Some(index) => (&raw[..index], Some(&raw[index + 2..])),
        None => (raw, None),
    }
}
