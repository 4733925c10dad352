//! Byte transport under the MQTT session.
//!
//! [`Connector`] opens a transport and [`Connection`] moves whole MQTT
//! packets over it. The production implementation is a TLS WebSocket;
//! tests swap in an in-memory broker.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use jobpilot_core::AppError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::mqtt::Packet;

/// Everything needed to open one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub client_id: String,
    /// Extra handshake headers, in send order.
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        request: &ConnectRequest,
    ) -> impl Future<Output = Result<Self::Conn, AppError>> + Send;
}

pub trait Connection: Send + 'static {
    fn send(&mut self, packet: &Packet) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Next packet from the peer, `Ok(None)` once the peer closed.
    ///
    /// Must be cancel-safe: the client polls it inside `select!`.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Packet>, AppError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// MQTT over a TLS WebSocket, one binary frame per outgoing packet.
#[derive(Debug, Clone)]
pub struct WsConnector {
    handshake_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, request: &ConnectRequest) -> Result<WsConnection, AppError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::ConfigError(format!("Invalid chat URL {}: {e}", request.url)))?;

        let headers = ws_request.headers_mut();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AppError::ConfigError(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::ConfigError(format!("Invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let (stream, response) = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(ws_request),
        )
        .await
        .map_err(|_| AppError::Timeout(self.handshake_timeout.as_secs()))?
        .map_err(handshake_error)?;

        tracing::debug!(
            client_id = %request.client_id,
            status = %response.status(),
            "WebSocket handshake complete"
        );

        Ok(WsConnection {
            stream,
            buffer: BytesMut::new(),
        })
    }
}

fn handshake_error(error: tungstenite::Error) -> AppError {
    match error {
        tungstenite::Error::Http(response) => {
            AppError::from_status(response.status().as_u16(), "WebSocket upgrade refused")
        }
        tungstenite::Error::Url(e) => AppError::ConfigError(format!("Invalid chat URL: {e}")),
        other => AppError::NetworkError(format!("WebSocket connect failed: {other}")),
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Bytes received but not yet decoded; packets may span frames.
    buffer: BytesMut,
}

impl Connection for WsConnection {
    async fn send(&mut self, packet: &Packet) -> Result<(), AppError> {
        let mut out = BytesMut::new();
        packet.encode(&mut out)?;
        self.stream
            .send(Message::binary(out.freeze()))
            .await
            .map_err(|e| AppError::NetworkError(format!("WebSocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<Packet>, AppError> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buffer)? {
                return Ok(Some(packet));
            }
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    return Ok(None);
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::warn!(len = text.len(), "Ignoring text frame on MQTT socket");
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(AppError::NetworkError(format!("WebSocket read failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let request = ConnectRequest {
            url: "wss://ws.example.com:443/chatws".into(),
            client_id: "ws-0".into(),
            headers: vec![("Sec-WebSocket-Protocol".into(), "wt2".into())],
        };
        assert_eq!(request.header("sec-websocket-protocol"), Some("wt2"));
        assert_eq!(request.header("Cookie"), None);
    }

    #[tokio::test]
    async fn invalid_url_is_config_error() {
        let request = ConnectRequest {
            url: "not a url".into(),
            client_id: "ws-0".into(),
            headers: vec![],
        };
        let err = WsConnector::new().connect(&request).await.err().unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn invalid_header_value_is_config_error() {
        let request = ConnectRequest {
            url: "wss://ws.example.com/chatws".into(),
            client_id: "ws-0".into(),
            headers: vec![("Cookie".into(), "a=\n1".into())],
        };
        let err = WsConnector::new().connect(&request).await.err().unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
