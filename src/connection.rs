//! # Connection Manager
//!
//! Owns the single logical connection to a ledger node and recovers from unsolicited drops.
//!
//! ## State machine
//!
//! `Disconnected --connect ok--> Connected --transport closed--> Disconnected (reconnect scheduled)`
//!
//! - Reconnects back off exponentially: `min(initial_delay * multiplier^attempts, max_delay)`.
//! - After `max_attempts` consecutive failures no further timer is scheduled; the next
//!   [`ConnectionManager::get_connection`] starts a fresh connect cycle.
//! - Concurrent connects are coalesced: callers queue on the connect lock and the late ones
//!   find the connection already up.
//!
//! State is published through a `watch` channel. Listeners observe it but cannot change it.

use crate::error::{LedgerError, LedgerErrorKind};
use crate::metrics;
use crate::networks::Network;
use crate::settings::Settings;
use crate::transport::{Connector, LedgerTransport};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Hard limit on a single transport handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Backoff configuration for automatic reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `attempts` earlier ones.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempts as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub network: Network,
    pub endpoints: HashMap<Network, Vec<String>>,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            endpoints: HashMap::new(),
            policy: ReconnectPolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let endpoints = Network::ALL
            .iter()
            .map(|n| (*n, settings.endpoints_for(*n)))
            .collect();
        Self {
            network: settings.network.default,
            endpoints,
            policy: settings.reconnect.policy(),
            connect_timeout: settings.network.connect_timeout(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn endpoints_for(&self, network: Network) -> Vec<String> {
        match self.endpoints.get(&network) {
            Some(urls) if !urls.is_empty() => urls.clone(),
            _ => network.default_endpoints(),
        }
    }
}

struct Inner {
    network: Network,
    live: Option<Arc<dyn LedgerTransport>>,
    attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the live handle is replaced or torn down on purpose, so a stale close
    /// notification is not mistaken for an unsolicited drop.
    generation: u64,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Manager of the connection to one ledger network at a time.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                inner: Mutex::new(Inner {
                    network: config.network,
                    live: None,
                    attempts: 0,
                    reconnect_timer: None,
                    generation: 0,
                }),
                config,
                connect_lock: tokio::sync::Mutex::new(()),
                state_tx,
            }),
        }
    }

    /// Connects to `network`. No-op when already connected to it.
    pub async fn connect(&self, network: Network) -> Result<(), LedgerError> {
        Shared::connect(&self.shared, network).await
    }

    /// Returns the live handle, connecting or reconnecting first when needed.
    pub async fn get_connection(&self) -> Result<Arc<dyn LedgerTransport>, LedgerError> {
        let (live, network) = {
            let inner = self.shared.lock();
            (inner.live.clone(), inner.network)
        };

        match live {
            Some(conn) if conn.is_connected() => return Ok(conn),
            Some(_) => {
                debug!("[ConnectionManager] Live handle reports closed, reconnecting");
                // Swapped under the connect lock; callers that saw the same dead handle share
                // the replacement.
                self.connect(network).await?
            }
            None => self.connect(network).await?,
        }

        self.shared.lock().live.clone().ok_or_else(|| {
            LedgerError::new(
                LedgerErrorKind::Disconnected,
                "connection dropped right after connect",
            )
        })
    }

    /// Drops whatever handle exists and connects again immediately.
    pub async fn reconnect(&self) -> Result<(), LedgerError> {
        let _guard = self.shared.connect_lock.lock().await;
        let (stale, network) = {
            let mut inner = self.shared.lock();
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            (inner.live.take(), inner.network)
        };
        if let Some(conn) = stale {
            conn.close().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.open(network).await
    }

    /// Tears the connection down and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.shared.connect_lock.lock().await;
        let live = {
            let mut inner = self.shared.lock();
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.attempts = 0;
            inner.generation += 1;
            inner.live.take()
        };
        if let Some(conn) = live {
            info!("🔌 [ConnectionManager] Disconnecting");
            conn.close().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Read-only view of state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn network(&self) -> Network {
        self.shared.lock().network
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared
            .lock()
            .reconnect_timer
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.config.policy
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another task panicked mid-update; the fields stay coherent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                "[ConnectionManager] {} -> {}",
                previous.as_str(),
                state.as_str()
            );
            metrics::set_connection_state(state);
        }
    }

    async fn connect(this: &Arc<Self>, network: Network) -> Result<(), LedgerError> {
        let _guard = this.connect_lock.lock().await;

        let (stale, dropped) = {
            let mut inner = this.lock();
            let up = inner.live.as_ref().map(|c| c.is_connected()).unwrap_or(false);
            if up && inner.network == network {
                return Ok(());
            }
            // A dead handle on the same network is an unsolicited drop this caller saw before
            // the close watcher did. The generation bump below silences that watcher.
            let dropped = inner.live.is_some() && inner.network == network;
            if inner.live.is_some() {
                inner.generation += 1;
            }
            (inner.live.take(), dropped)
        };
        if let Some(conn) = stale {
            conn.close().await;
        }

        let outcome = this.open(network).await;
        if outcome.is_err() && dropped {
            warn!(
                "⚠️ [ConnectionManager] Connection to {} dropped and immediate reconnect failed",
                network
            );
            this.schedule_reconnect();
        }
        outcome
    }

    /// Tries each endpoint of `network` in order. Caller holds the connect lock.
    async fn open(self: &Arc<Self>, network: Network) -> Result<(), LedgerError> {
        self.set_state(ConnectionState::Connecting);
        let endpoints = self.config.endpoints_for(network);
        let mut failures = Vec::with_capacity(endpoints.len());

        for url in &endpoints {
            info!("🔌 [ConnectionManager] Connecting to {} ({})", url, network);
            let outcome = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(url),
            )
            .await;

            let transport = match outcome {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!("⚠️ [ConnectionManager] {} failed: {}", url, e);
                    failures.push(format!("{}: {}", url, e));
                    continue;
                }
                Err(_) => {
                    warn!(
                        "⚠️ [ConnectionManager] {} timed out after {:?}",
                        url, self.config.connect_timeout
                    );
                    failures.push(format!("{}: timed out", url));
                    continue;
                }
            };

            let generation = {
                let mut inner = self.lock();
                if let Some(timer) = inner.reconnect_timer.take() {
                    timer.abort();
                }
                inner.network = network;
                inner.live = Some(transport.clone());
                inner.attempts = 0;
                inner.generation += 1;
                inner.generation
            };
            self.set_state(ConnectionState::Connected);
            self.watch_transport(transport, generation);
            info!("✅ [ConnectionManager] Connected to {} ({})", url, network);
            return Ok(());
        }

        {
            let mut inner = self.lock();
            inner.network = network;
        }
        self.set_state(ConnectionState::Disconnected);
        Err(LedgerError::connection_failed(format!(
            "could not connect to {}: {}",
            network,
            failures.join("; ")
        )))
    }

    fn watch_transport(self: &Arc<Self>, transport: Arc<dyn LedgerTransport>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            transport.closed().await;
            drop(transport);
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_closed(generation);
            }
        });
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.live = None;
            warn!(
                "⚠️ [ConnectionManager] Connection to {} dropped unexpectedly",
                inner.network
            );
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner
            .reconnect_timer
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        if inner.attempts >= self.config.policy.max_attempts {
            error!(
                "❌ [ConnectionManager] Giving up after {} reconnect attempts to {}",
                inner.attempts, inner.network
            );
            inner.reconnect_timer = None;
            return;
        }

        let delay = self.config.policy.delay_for(inner.attempts);
        inner.attempts += 1;
        let attempt = inner.attempts;
        let generation = inner.generation;
        warn!(
            "🔄 [ConnectionManager] Reconnect attempt {}/{} in {:?}",
            attempt, self.config.policy.max_attempts, delay
        );
        metrics::increment_reconnect_attempt();

        let weak = Arc::downgrade(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.run_reconnect(attempt, generation).await;
            }
        }));
    }

    async fn run_reconnect(self: Arc<Self>, attempt: u32, generation: u64) {
        let _guard = self.connect_lock.lock().await;
        let network = {
            let mut inner = self.lock();
            // Detach the handle of the running timer so a successful open doesn't abort us.
            inner.reconnect_timer = None;
            if inner.generation != generation || inner.live.is_some() {
                return;
            }
            inner.network
        };

        match self.open(network).await {
            Ok(()) => info!(
                "✅ [ConnectionManager] Reconnected on attempt {}",
                attempt
            ),
            Err(e) => {
                warn!(
                    "⚠️ [ConnectionManager] Reconnect attempt {} failed: {}",
                    attempt, e
                );
                self.schedule_reconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(1000));
    }

    #[test]
    fn test_endpoint_overrides_fall_back_to_defaults() {
        let mut config = ConnectionConfig::new(Network::Testnet);
        config
            .endpoints
            .insert(Network::Testnet, vec!["wss://localhost:6006".into()]);
        config.endpoints.insert(Network::Xahau, vec![]);

        assert_eq!(
            config.endpoints_for(Network::Testnet),
            vec!["wss://localhost:6006".to_string()]
        );
        assert_eq!(
            config.endpoints_for(Network::Xahau),
            Network::Xahau.default_endpoints()
        );
    }
}
