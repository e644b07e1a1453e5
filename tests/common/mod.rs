//! Scripted in-process transport shared by the integration tests.
//!
//! [`ScriptedConnector`] hands out [`MockTransport`]s whose replies come from a handler
//! closure, and records when each connect attempt happened so backoff can be checked against
//! tokio's paused clock.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use xrpl_ledger_gateway::connection::{ConnectionConfig, ReconnectPolicy};
use xrpl_ledger_gateway::transport::{Connector, LedgerTransport, TransportError};
use xrpl_ledger_gateway::Network;

pub const MOCK_ENDPOINT: &str = "wss://mock.ledger.local";

/// Builds a reply envelope for a request.
pub type Handler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

pub fn success(result: Value) -> Value {
    json!({ "status": "success", "type": "response", "result": result })
}

pub fn remote_error(code: &str) -> Value {
    json!({
        "status": "error",
        "type": "response",
        "error": code,
        "error_message": format!("{} (mock)", code),
    })
}

pub fn command_of(request: &Value) -> &str {
    request["command"].as_str().unwrap_or_default()
}

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn config(network: Network, endpoints: &[&str], policy: ReconnectPolicy) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(network).with_policy(policy);
    config.endpoints.insert(
        network,
        endpoints.iter().map(|e| e.to_string()).collect(),
    );
    config
}

pub fn mock_config(network: Network) -> ConnectionConfig {
    config(network, &[MOCK_ENDPOINT], ReconnectPolicy::default())
}

pub struct MockTransport {
    handler: Handler,
    requests: Mutex<Vec<Value>>,
    connected: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new(handler: Handler) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            handler,
            requests: Mutex::new(Vec::new()),
            connected,
        }
    }

    /// Simulates the remote side going away.
    pub fn drop_connection(&self) {
        self.connected.send_replace(false);
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerTransport for MockTransport {
    async fn send(&self, request: Value) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok((self.handler)(&request))
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.connected.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) {
        self.connected.send_replace(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
}

/// Connector whose outcomes are scripted; once the script runs out every attempt succeeds.
pub struct ScriptedConnector {
    handler: Handler,
    script: Mutex<VecDeque<ConnectOutcome>>,
    connect_delay: Duration,
    attempts: Mutex<Vec<(String, Instant)>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl ScriptedConnector {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            script: Mutex::new(VecDeque::new()),
            connect_delay: Duration::ZERO,
            attempts: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Replies `{}` to everything.
    pub fn accepting() -> Self {
        Self::new(handler(|_| success(json!({}))))
    }

    pub fn with_script(self, outcomes: &[ConnectOutcome]) -> Self {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn attempts(&self) -> Vec<(String, Instant)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }

    /// Every request sent over any transport this connector opened, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.requests())
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn LedgerTransport>, TransportError> {
        self.attempts
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectOutcome::Accept);
        match outcome {
            ConnectOutcome::Refuse => Err(TransportError::Handshake(format!("{} refused", url))),
            ConnectOutcome::Accept => {
                let transport = Arc::new(MockTransport::new(self.handler.clone()));
                self.transports.lock().unwrap().push(transport.clone());
                Ok(transport)
            }
        }
    }
}
