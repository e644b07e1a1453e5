//! # XRPL Ledger Gateway
//!
//! Client and cache core for XRPL and Xahau nodes: one managed WebSocket connection per
//! process, a rate-limited request queue in front of it, a typed client facade, and a
//! stale-while-revalidate cache for the read paths that are requested most.
//!
//! ## Architecture
//!
//! ### Connection Layer
//! [`connection::ConnectionManager`] owns the live transport, fails over between endpoints, and
//! reconnects with exponential backoff after unsolicited drops.
//!
//! ### Request Layer
//! [`queue::RequestQueue`] dispatches calls in FIFO order with a minimum spacing.
//! [`client::LedgerClient`] builds typed operations on top and classifies every failure into
//! [`error::LedgerError`].
//!
//! ### Cache Layer
//! [`cache::CacheStore`] keeps JSON values with a fresh / stale / expired lifetime.
//! [`fetch::CachedFetcher`] serves from it and schedules background refreshes.
//! [`ledger_cache::LedgerCache`] wires the two together for account and NFT views.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xrpl_ledger_gateway::{LedgerClient, Settings, WsConnector};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::new()?;
//! let connector = Arc::new(WsConnector::new(settings.network.request_timeout()));
//! let client = LedgerClient::from_settings(connector, &settings);
//! let info = client.account_info("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh").await?;
//! println!("balance: {:?} XRP", info.balance_xrp());
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

// Configuration
/// Known networks and their endpoints
pub mod networks;
/// Configuration loading (`Config.toml` + environment)
pub mod settings;

// Protocol
/// Error taxonomy and classification
pub mod error;
/// Typed commands, replies and amounts
pub mod protocol;
/// Transport traits and the WebSocket implementation
pub mod transport;

// Request path
/// Connection lifecycle and reconnects
pub mod connection;
/// Rate-limited FIFO request queue
pub mod queue;
/// Typed client facade
pub mod client;

// Caching
/// Persistent cache store
pub mod cache;
/// Stale-while-revalidate orchestration
pub mod fetch;
/// Cached account and NFT views
pub mod ledger_cache;

// Observability
/// Metrics helpers (no-ops unless `observability` is enabled)
pub mod metrics;

pub use cache::{CacheKey, CacheStore};
pub use client::{LedgerClient, TransactionSigner};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{LedgerError, LedgerErrorKind};
pub use fetch::{CachedFetcher, DetachedScheduler, Fetched, InlineScheduler};
pub use ledger_cache::LedgerCache;
pub use networks::Network;
pub use queue::RequestQueue;
pub use settings::Settings;
pub use transport::WsConnector;
