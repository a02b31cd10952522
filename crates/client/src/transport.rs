//! WebSocket transport driving one connection per `connect()`.
//!
//! The session hands the connector an outbound frame queue and a
//! [`TransportEvents`] handle. The connector reports open, inbound frames and
//! closure through that handle; dropping the sending side of the queue asks
//! the connection to close.

use std::sync::Weak;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderName, HeaderValue},
        protocol::Message,
    },
};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::session::SessionInner;

pub const USER_AGENT: &str = concat!("talkgroup-client/", env!("CARGO_PKG_VERSION"));
pub const PROTOCOL_PRAGMA: &str = "zello-api-v1";

/// One frame queued for the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::Text(text.into()),
            OutboundFrame::Binary(data) => Message::Binary(data),
        }
    }
}

/// Endpoint and handshake headers for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: vec![
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                ("Pragma".to_string(), PROTOCOL_PRAGMA.to_string()),
            ],
        }
    }

    fn into_client_request(self) -> Result<Request, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let invalid = |reason: String| TransportError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            request.headers_mut().insert(header_name, header_value);
        }
        Ok(request)
    }
}

/// Report channel from a transport back into the session that opened it.
///
/// Events from a connection the session has since abandoned are dropped.
pub struct TransportEvents {
    session: Weak<SessionInner>,
    epoch: u64,
}

impl TransportEvents {
    pub(crate) fn new(session: Weak<SessionInner>, epoch: u64) -> Self {
        Self { session, epoch }
    }

    pub fn opened(&self) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_open(self.epoch);
        }
    }

    pub fn text(&self, text: &str) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_text(self.epoch, text);
        }
    }

    pub fn binary(&self, data: &[u8]) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_binary(self.epoch, data);
        }
    }

    pub fn closed(&self, reason: &str) {
        if let Some(inner) = self.session.upgrade() {
            inner.handle_closed(self.epoch, reason);
        }
    }
}

/// Opens the underlying connection. Must not block: the connection is driven
/// elsewhere and reports back through `events`.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn open(
        &self,
        request: ConnectRequest,
        outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        events: TransportEvents,
    ) -> Result<(), TransportError>;
}

/// Connects with `tokio-tungstenite` on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(
        &self,
        request: ConnectRequest,
        outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let url = request.url.clone();
        let request = request.into_client_request()?;
        runtime.spawn(run_connection(url, request, outbound, events));
        Ok(())
    }
}

async fn run_connection(
    url: String,
    request: Request,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: TransportEvents,
) {
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(%url, error = %e, "Failed to connect to channel server");
            events.closed(&format!("connection failed: {}", e));
            return;
        }
    };
    info!(%url, "WebSocket connection established.");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    events.opened();

    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_tx.send(frame.into_message()).await {
                        break format!("send failed: {}", e);
                    }
                }
                None => {
                    debug!("Outbound queue closed, closing WebSocket.");
                    if let Err(e) = ws_tx.close().await {
                        debug!(error = %e, "Error while closing WebSocket");
                    }
                    break "closed by client".to_string();
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => events.text(text.as_str()),
                Some(Ok(Message::Binary(data))) => events.binary(&data),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("transport error: {}", e),
                None => break "connection closed".to_string(),
            },
        }
    };

    info!(%reason, "WebSocket connection finished.");
    events.closed(&reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_carries_protocol_headers() {
        let request = ConnectRequest::new("wss://zello.io/ws");
        assert_eq!(request.url, "wss://zello.io/ws");
        assert!(
            request
                .headers
                .contains(&("Pragma".to_string(), "zello-api-v1".to_string()))
        );
        assert!(
            request
                .headers
                .iter()
                .any(|(name, value)| name == "User-Agent" && value.starts_with("talkgroup-client/"))
        );
    }

    #[test]
    fn test_client_request_includes_headers() {
        let request = ConnectRequest::new("ws://127.0.0.1:9000/ws")
            .into_client_request()
            .unwrap();
        assert_eq!(request.headers()["Pragma"], "zello-api-v1");
        assert!(request.headers().contains_key("User-Agent"));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut request = ConnectRequest::new("ws://127.0.0.1:9000/ws");
        request.headers.push(("Bad Header".to_string(), "x".to_string()));
        assert!(matches!(
            request.into_client_request(),
            Err(TransportError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_open_without_runtime_fails() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(Weak::new(), 0);
        let result = WebSocketConnector.open(ConnectRequest::new("ws://127.0.0.1:1"), rx, events);
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }
}
