//! # Ledger Transport
//!
//! The remote node is an opaque request/response service reached over a persistent
//! bidirectional connection. [`Connector`] opens connections, [`LedgerTransport`] is one live
//! connection. The WebSocket implementation correlates replies to requests through the `id`
//! field and reports unsolicited closes through [`LedgerTransport::closed`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    Closed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("malformed frame: {0}")]
    Decode(String),
}

/// One live connection to a remote node.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    /// Sends one request and waits for its reply envelope.
    async fn send(&self, request: Value) -> Result<Value, TransportError>;

    fn is_connected(&self) -> bool;

    /// Resolves once the connection is gone, whoever closed it.
    async fn closed(&self);

    async fn close(&self);
}

/// Opens connections to an endpoint URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn LedgerTransport>, TransportError>;
}

/// Normalizes an endpoint into a `ws://` or `wss://` URL.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let endpoint = endpoint.trim();
    let ws_url = if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("wss://{}", endpoint)
    };

    let url = Url::parse(&ws_url)
        .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    if url.host_str().is_none() {
        return Err(TransportError::InvalidEndpoint(format!(
            "{}: missing host",
            endpoint
        )));
    }
    Ok(url)
}

/// Opens WebSocket connections with `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    request_timeout: Duration,
}

impl WsConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn LedgerTransport>, TransportError> {
        let url = normalize_endpoint(url)?;
        let endpoint = url.to_string();

        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        // Writer: drains outbound frames until the socket or the channel goes away.
        let writer_closed = closed_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_close = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!("[WsTransport] write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
            writer_closed.send_replace(true);
        });

        // Reader: routes replies to their waiting requests.
        let reader_pending = pending.clone();
        let reader_closed = closed_tx.clone();
        let reader_outbound = outbound_tx.clone();
        let reader_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_reply(&reader_pending, &text),
                    Ok(Message::Ping(payload)) => {
                        let _ = reader_outbound.send(Message::Pong(payload));
                    }
                    Ok(Message::Close(frame)) => {
                        info!(
                            "🔌 [WsTransport] {} closed by remote: {:?}",
                            reader_endpoint, frame
                        );
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️ [WsTransport] {} read error: {}", reader_endpoint, e);
                        break;
                    }
                }
            }
            reader_closed.send_replace(true);
            // Dropping the senders fails every outstanding request with `Closed`.
            reader_pending.clear();
        });

        info!("✅ [WsTransport] Connected to {}", endpoint);

        Ok(Arc::new(WsTransport {
            endpoint,
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed_tx,
            closed_rx,
            request_timeout: self.request_timeout,
        }))
    }
}

fn route_reply(pending: &DashMap<u64, oneshot::Sender<Value>>, text: &str) {
    let reply: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("⚠️ [WsTransport] Dropping undecodable frame: {}", e);
            return;
        }
    };
    match reply.get("id").and_then(Value::as_u64) {
        Some(id) => {
            if let Some((_, waiter)) = pending.remove(&id) {
                let _ = waiter.send(reply);
            } else {
                debug!("[WsTransport] Reply for unknown or abandoned request id {}", id);
            }
        }
        None => {
            debug!(
                "[WsTransport] Unsolicited message type={:?}",
                reply.get("type").and_then(Value::as_str)
            );
        }
    }
}

/// A live WebSocket connection.
pub struct WsTransport {
    endpoint: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl WsTransport {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LedgerTransport for WsTransport {
    async fn send(&self, mut request: Value) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match request.as_object_mut() {
            Some(obj) => {
                obj.insert("id".to_string(), Value::from(id));
            }
            None => return Err(TransportError::Decode("request must be a JSON object".into())),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        // The reader may have cleared `pending` between the check above and the insert.
        if !self.is_connected() {
            self.pending.remove(&id);
            return Err(TransportError::Closed);
        }

        if self.outbound.send(Message::Text(request.to_string())).is_err() {
            self.pending.remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let _ = self.outbound.send(Message::Close(None));
        self.pending.clear();
        debug!("[WsTransport] Closed {}", self.endpoint);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(
            normalize_endpoint("https://xrplcluster.com").unwrap().as_str(),
            "wss://xrplcluster.com/"
        );
        assert_eq!(
            normalize_endpoint("http://127.0.0.1:6006").unwrap().as_str(),
            "ws://127.0.0.1:6006/"
        );
        assert_eq!(
            normalize_endpoint("s1.ripple.com").unwrap().as_str(),
            "wss://s1.ripple.com/"
        );
        assert!(normalize_endpoint("wss://").is_err());
    }

    #[test]
    fn test_route_reply_by_id() {
        let pending = DashMap::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(7u64, tx);

        route_reply(&pending, r#"{"id":7,"status":"success","result":{}}"#);

        assert!(pending.is_empty());
        assert_eq!(rx.try_recv().unwrap()["id"], json!(7));
    }

    #[tokio::test]
    async fn test_ws_round_trip_and_remote_close() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Answers the first request, then closes from the node side.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(frame) = ws.next().await {
                if let Message::Text(text) = frame.unwrap() {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(request["command"], json!("ping"));
                    let reply = json!({"id": request["id"], "status": "success", "result": {}});
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                    break;
                }
            }
            ws.send(Message::Close(None)).await.unwrap();
            // Drain until the client acknowledges the close.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = WsConnector::new(Duration::from_secs(5))
            .connect(&format!("ws://{}", addr))
            .await
            .unwrap();
        assert!(transport.is_connected());

        let reply = transport.send(json!({"command": "ping"})).await.unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["status"], json!("success"));

        tokio::time::timeout(Duration::from_secs(5), transport.closed())
            .await
            .unwrap();
        assert!(!transport.is_connected());

        let err = transport.send(json!({"command": "ping"})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        drop(transport);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_failure_is_reported() {
        use tokio::net::TcpListener;

        // A port with no listener behind it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsConnector::default()
            .connect(&format!("ws://{}", addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[test]
    fn test_route_reply_ignores_stream_messages() {
        let pending: DashMap<u64, oneshot::Sender<Value>> = DashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(1, tx);

        route_reply(&pending, r#"{"type":"ledgerClosed","ledger_index":5}"#);
        route_reply(&pending, "not json");

        assert_eq!(pending.len(), 1);
    }
}
