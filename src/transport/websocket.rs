//! WebSocket transport built on tokio-tungstenite

use super::{
    Connector, FrameSink, FrameSource, SocketEvent, TransportError, TransportErrorKind,
    ABNORMAL_CLOSURE,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when the peer sent a close frame without a status
const NO_STATUS_RECEIVED: u16 = 1005;

/// Opens `ws://` and `wss://` connections
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let (stream, response) = connect_async(url).await.map_err(TransportError::from)?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.write
            .send(Message::Close(Some(frame)))
            .await
            .map_err(TransportError::from)?;
        self.write.close().await.map_err(TransportError::from)
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait::async_trait]
impl FrameSource for WsSource {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        loop {
            let event = match self.read.next().await? {
                Ok(Message::Text(text)) => SocketEvent::Text(text.as_str().to_owned()),
                Ok(Message::Binary(bytes)) => SocketEvent::Binary(bytes.to_vec()),
                Ok(Message::Close(frame)) => match frame {
                    Some(frame) => SocketEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => SocketEvent::Closed {
                        code: NO_STATUS_RECEIVED,
                        reason: String::new(),
                    },
                },
                // tungstenite answers control frames itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => SocketEvent::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "connection closed".to_string(),
                },
                Err(err) => SocketEvent::Failed(TransportError::from(err)),
            };
            return Some(event);
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => TransportError::from_io(&io_err),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::connection_reset(err.to_string())
            }
            tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                TransportError::connection_reset(err.to_string())
            }
            tungstenite::Error::Protocol(_) => {
                TransportError::fatal(TransportErrorKind::Protocol, err.to_string())
            }
            tungstenite::Error::Tls(_) => {
                TransportError::fatal(TransportErrorKind::Tls, err.to_string())
            }
            tungstenite::Error::Url(_) => {
                TransportError::fatal(TransportErrorKind::InvalidUrl, err.to_string())
            }
            tungstenite::Error::Http(ref response) => TransportError::fatal(
                TransportErrorKind::Handshake,
                format!("server rejected upgrade with HTTP {}", response.status()),
            ),
            other => TransportError::fatal(TransportErrorKind::Protocol, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_tungstenite_error_classification() {
        let reset = tungstenite::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(TransportError::from(reset).is_recoverable());

        let closed = TransportError::from(tungstenite::Error::ConnectionClosed);
        assert_eq!(closed.kind, TransportErrorKind::ConnectionReset);

        let abrupt = TransportError::from(tungstenite::Error::Protocol(
            WsProtocolError::ResetWithoutClosingHandshake,
        ));
        assert!(abrupt.is_recoverable());

        let violation = TransportError::from(tungstenite::Error::Protocol(
            WsProtocolError::NonZeroReservedBits,
        ));
        assert!(!violation.is_recoverable());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_recoverable() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = WebSocketConnector::new()
            .connect(&format!("ws://127.0.0.1:{port}"))
            .await;

        let err = result.err().expect("connection should be refused");
        assert!(err.is_recoverable(), "unexpected classification: {err}");
    }

    #[tokio::test]
    async fn test_invalid_scheme_is_fatal() {
        let result = WebSocketConnector::new().connect("ftp://example.invalid").await;

        let err = result.err().expect("scheme should be rejected");
        assert!(!err.is_recoverable());
    }
}
