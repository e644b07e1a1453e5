//! # Ledger Client
//!
//! Typed operations against the remote ledger. Every call goes through the [`RequestQueue`] and
//! obtains its handle from the [`ConnectionManager`] at dispatch time, so a request queued
//! before a reconnect runs on the new connection.
//!
//! Remote error payloads are classified into [`LedgerError`] here and nowhere else. Apart from
//! the connection layer's reconnects and the explicit validation poll, nothing is retried.

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{LedgerError, LedgerErrorKind};
use crate::metrics;
use crate::networks::Network;
use crate::protocol::{
    AccountInfo, AccountNfts, Command, FeeResult, LedgerResponse, NfToken, NftOffer, RemoteReply,
    ServerInfo, SubmitResult, TxResult,
};
use crate::queue::RequestQueue;
use crate::settings::Settings;
use crate::transport::Connector;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Page size used when walking every NFT of an account.
const NFT_PAGE_LIMIT: u32 = 400;

/// Produces a signed `tx_blob` from an autofilled transaction.
///
/// The client never holds keys; wallets, HSMs or remote signing services plug in here.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, tx: &Value) -> Result<String, LedgerError>;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub validation_max_wait: Duration,
    pub validation_poll_interval: Duration,
    pub max_fee_drops: u64,
    pub last_ledger_offset: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            validation_max_wait: Duration::from_secs(20),
            validation_poll_interval: Duration::from_secs(1),
            max_fee_drops: 2_000_000,
            last_ledger_offset: 20,
        }
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            validation_max_wait: Duration::from_millis(settings.validation.max_wait_ms),
            validation_poll_interval: Duration::from_millis(settings.validation.poll_interval_ms),
            max_fee_drops: settings.transaction.max_fee_drops,
            last_ledger_offset: settings.transaction.last_ledger_offset,
        }
    }
}

/// Sell and buy offers for one NFT.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NftOfferBook {
    pub nft_id: String,
    pub sell_offers: Vec<NftOffer>,
    pub buy_offers: Vec<NftOffer>,
}

/// Queued, connection-aware facade over one ledger network.
#[derive(Clone)]
pub struct LedgerClient {
    connections: ConnectionManager,
    queue: RequestQueue,
    options: ClientOptions,
}

impl LedgerClient {
    pub fn new(connections: ConnectionManager, queue: RequestQueue, options: ClientOptions) -> Self {
        Self {
            connections,
            queue,
            options,
        }
    }

    pub fn from_settings(connector: Arc<dyn Connector>, settings: &Settings) -> Self {
        Self::new(
            ConnectionManager::new(connector, ConnectionConfig::from_settings(settings)),
            RequestQueue::new(settings.queue.requests_per_second),
            ClientOptions::from_settings(settings),
        )
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn network(&self) -> Network {
        self.connections.network()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Sends `command` through the queue and decodes its typed response.
    pub async fn request(&self, command: Command) -> Result<LedgerResponse, LedgerError> {
        let started = Instant::now();
        let name = command.name().to_string();
        let connections = self.connections.clone();

        let outcome = self
            .queue
            .enqueue(move || async move {
                let conn = connections.get_connection().await?;
                let reply = conn.send(command.to_payload()).await?;
                match RemoteReply::from_value(reply) {
                    RemoteReply::Success(result) => LedgerResponse::decode(&command, result),
                    RemoteReply::Error(err) => Err(LedgerError::from_remote(err)),
                }
            })
            .await;

        metrics::record_ledger_request_latency(&name, started.elapsed());
        match &outcome {
            Ok(_) => metrics::increment_ledger_request(&name, "ok"),
            Err(e) => {
                debug!("[LedgerClient] {} failed: {}", name, e);
                metrics::increment_ledger_request(&name, e.kind.as_str());
            }
        }
        outcome
    }

    /// Arbitrary command with an untyped result.
    pub async fn request_raw(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<Value, LedgerError> {
        match self.request(Command::raw(command, params)).await? {
            LedgerResponse::Unknown(value) => Ok(value),
            other => Err(unexpected(command, &other)),
        }
    }

    pub async fn account_info(&self, account: &str) -> Result<AccountInfo, LedgerError> {
        let command = Command::AccountInfo {
            account: account.to_string(),
        };
        match self.request(command).await? {
            LedgerResponse::AccountInfo(info) => Ok(info),
            other => Err(unexpected("account_info", &other)),
        }
    }

    /// First page of NFTs owned by `account`.
    pub async fn get_nfts(
        &self,
        account: &str,
        limit: Option<u32>,
    ) -> Result<AccountNfts, LedgerError> {
        self.get_nfts_page(account, limit, None).await
    }

    pub async fn get_nfts_page(
        &self,
        account: &str,
        limit: Option<u32>,
        marker: Option<Value>,
    ) -> Result<AccountNfts, LedgerError> {
        let command = Command::AccountNfts {
            account: account.to_string(),
            limit,
            marker,
        };
        match self.request(command).await? {
            LedgerResponse::AccountNfts(page) => Ok(page),
            other => Err(unexpected("account_nfts", &other)),
        }
    }

    /// Every NFT owned by `account`, following the pagination marker.
    pub async fn get_all_nfts(&self, account: &str) -> Result<Vec<NfToken>, LedgerError> {
        let mut nfts = Vec::new();
        let mut marker = None;
        loop {
            let page = self
                .get_nfts_page(account, Some(NFT_PAGE_LIMIT), marker)
                .await?;
            nfts.extend(page.account_nfts);
            match page.marker {
                Some(next) if !next.is_null() => marker = Some(next),
                _ => break,
            }
        }
        debug!(
            "[LedgerClient] {} owns {} NFTs",
            account,
            nfts.len()
        );
        Ok(nfts)
    }

    /// Sell offers for `nft_id`. An NFT without offers yields an empty list.
    pub async fn nft_sell_offers(&self, nft_id: &str) -> Result<Vec<NftOffer>, LedgerError> {
        self.nft_offers_of(Command::NftSellOffers {
            nft_id: nft_id.to_string(),
        })
        .await
    }

    /// Buy offers for `nft_id`. An NFT without offers yields an empty list.
    pub async fn nft_buy_offers(&self, nft_id: &str) -> Result<Vec<NftOffer>, LedgerError> {
        self.nft_offers_of(Command::NftBuyOffers {
            nft_id: nft_id.to_string(),
        })
        .await
    }

    pub async fn nft_offers(&self, nft_id: &str) -> Result<NftOfferBook, LedgerError> {
        let sell_offers = self.nft_sell_offers(nft_id).await?;
        let buy_offers = self.nft_buy_offers(nft_id).await?;
        Ok(NftOfferBook {
            nft_id: nft_id.to_string(),
            sell_offers,
            buy_offers,
        })
    }

    async fn nft_offers_of(&self, command: Command) -> Result<Vec<NftOffer>, LedgerError> {
        let name = command.name().to_string();
        match self.request(command).await {
            Ok(LedgerResponse::NftOffers(book)) => Ok(book.offers),
            Ok(other) => Err(unexpected(&name, &other)),
            // The node reports "no offers yet" as a missing object.
            Err(e) if e.is(LedgerErrorKind::ObjectNotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn transaction(&self, hash: &str) -> Result<TxResult, LedgerError> {
        validate_tx_hash(hash)?;
        let command = Command::Tx {
            hash: hash.to_ascii_uppercase(),
        };
        match self.request(command).await? {
            LedgerResponse::Tx(tx) => Ok(tx),
            other => Err(unexpected("tx", &other)),
        }
    }

    pub async fn fee(&self) -> Result<FeeResult, LedgerError> {
        match self.request(Command::Fee).await? {
            LedgerResponse::Fee(fee) => Ok(fee),
            other => Err(unexpected("fee", &other)),
        }
    }

    pub async fn ledger_current_index(&self) -> Result<u32, LedgerError> {
        match self.request(Command::LedgerCurrent).await? {
            LedgerResponse::LedgerCurrent(current) => Ok(current.ledger_current_index),
            other => Err(unexpected("ledger_current", &other)),
        }
    }

    pub async fn server_info(&self) -> Result<ServerInfo, LedgerError> {
        match self.request(Command::ServerInfo).await? {
            LedgerResponse::ServerInfo(info) => Ok(info),
            other => Err(unexpected("server_info", &other)),
        }
    }

    /// Fills `Fee`, `Sequence`, `LastLedgerSequence` and (where required) `NetworkID`.
    ///
    /// Fields already present are left untouched. Each lookup is its own queued request.
    pub async fn autofill(&self, tx: Value) -> Result<Value, LedgerError> {
        let mut tx = match tx {
            Value::Object(obj) => obj,
            _ => {
                return Err(LedgerError::invalid_transaction(
                    "transaction must be a JSON object",
                ))
            }
        };
        let account = required_str(&tx, "Account")?.to_string();
        required_str(&tx, "TransactionType")?;

        let mut current_ledger = None;
        if !tx.contains_key("Fee") {
            let fee = self.fee().await?;
            let drops = fee_drops(&fee, self.options.max_fee_drops)?;
            current_ledger = Some(fee.ledger_current_index);
            tx.insert("Fee".to_string(), Value::String(drops.to_string()));
        }

        if !tx.contains_key("Sequence") {
            let info = self.account_info(&account).await?;
            tx.insert(
                "Sequence".to_string(),
                Value::from(info.account_data.sequence),
            );
        }

        if !tx.contains_key("LastLedgerSequence") {
            let current = match current_ledger {
                Some(index) => index,
                None => self.ledger_current_index().await?,
            };
            tx.insert(
                "LastLedgerSequence".to_string(),
                Value::from(last_ledger_sequence(current, self.options.last_ledger_offset)),
            );
        }

        let network = self.network();
        if network.requires_network_id() && !tx.contains_key("NetworkID") {
            tx.insert("NetworkID".to_string(), Value::from(network.network_id()));
        }

        Ok(Value::Object(tx))
    }

    /// Submits an already signed blob and classifies the engine result.
    pub async fn submit_signed(&self, tx_blob: &str) -> Result<SubmitResult, LedgerError> {
        let command = Command::Submit {
            tx_blob: tx_blob.to_string(),
        };
        let result = match self.request(command).await? {
            LedgerResponse::Submit(result) => result,
            other => return Err(unexpected("submit", &other)),
        };

        if let Some(err) = LedgerError::from_engine_result(
            &result.engine_result,
            &result.engine_result_message,
            serde_json::to_value(&result).unwrap_or(Value::Null),
        ) {
            warn!(
                "⚠️ [LedgerClient] Submission rejected: {} ({})",
                result.engine_result, result.engine_result_message
            );
            return Err(err);
        }

        info!(
            "📤 [LedgerClient] Submitted {} -> {}",
            result.hash().unwrap_or("<no hash>"),
            result.engine_result
        );
        Ok(result)
    }

    /// Autofills `tx`, has `signer` sign it, and submits the blob.
    pub async fn submit_transaction(
        &self,
        tx: Value,
        signer: &dyn TransactionSigner,
    ) -> Result<SubmitResult, LedgerError> {
        let prepared = self.autofill(tx).await?;
        let tx_blob = signer.sign(&prepared).await?;
        self.submit_signed(&tx_blob).await
    }

    /// Polls `tx` until the transaction is validated, using the configured deadline.
    pub async fn wait_for_validation(&self, hash: &str) -> Result<TxResult, LedgerError> {
        self.wait_for_validation_with(
            hash,
            self.options.validation_max_wait,
            self.options.validation_poll_interval,
        )
        .await
    }

    /// Polls `tx` every `poll_interval` until it reports `validated: true` or `max_wait` elapses.
    ///
    /// A transaction the node has not seen yet (`ObjectNotFound`) counts as pending. Any other
    /// failure ends the wait.
    pub async fn wait_for_validation_with(
        &self,
        hash: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<TxResult, LedgerError> {
        validate_tx_hash(hash)?;
        let deadline = Instant::now() + max_wait;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.transaction(hash).await {
                Ok(tx) if tx.validated => {
                    info!(
                        "✅ [LedgerClient] {} validated in ledger {:?} after {} polls",
                        hash, tx.ledger_index, polls
                    );
                    return Ok(tx);
                }
                Ok(_) => debug!("[LedgerClient] {} seen, not yet validated", hash),
                Err(e) if e.is(LedgerErrorKind::ObjectNotFound) => {
                    debug!("[LedgerClient] {} not found yet", hash)
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LedgerError::new(
                    LedgerErrorKind::ValidationTimeout,
                    format!(
                        "{} not validated within {:?} ({} polls)",
                        hash, max_wait, polls
                    ),
                ));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Submits `tx` and waits until it is validated. A validated failure surfaces as an error.
    pub async fn submit_and_wait(
        &self,
        tx: Value,
        signer: &dyn TransactionSigner,
    ) -> Result<TxResult, LedgerError> {
        let submitted = self.submit_transaction(tx, signer).await?;
        let hash = submitted
            .hash()
            .ok_or_else(|| LedgerError::internal("submit response carried no transaction hash"))?
            .to_string();

        let validated = self.wait_for_validation(&hash).await?;
        if let Some(result) = validated.transaction_result() {
            if let Some(err) = LedgerError::from_engine_result(
                result,
                "validated with a failure result",
                validated.meta.clone().unwrap_or(Value::Null),
            ) {
                return Err(err);
            }
        }
        Ok(validated)
    }

    pub async fn disconnect(&self) {
        self.connections.disconnect().await;
    }
}

fn unexpected(command: &str, response: &LedgerResponse) -> LedgerError {
    LedgerError::internal(format!(
        "unexpected {} response to {}",
        response.variant_name(),
        command
    ))
}

fn required_str<'a>(tx: &'a Map<String, Value>, field: &str) -> Result<&'a str, LedgerError> {
    tx.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LedgerError::invalid_transaction(format!("missing {}", field)))
}

/// Transaction hashes are 32 bytes, hex encoded.
pub fn validate_tx_hash(hash: &str) -> Result<(), LedgerError> {
    match hex::decode(hash) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(LedgerError::invalid_transaction(format!(
            "invalid transaction hash: {}",
            hash
        ))),
    }
}

/// Expiry ledger for an autofilled transaction, pinned at `u32::MAX` near the top of the range.
fn last_ledger_sequence(current: u32, offset: u32) -> u32 {
    current.saturating_add(offset)
}

/// Open-ledger fee, never below the base fee, capped at `max_fee_drops`.
fn fee_drops(fee: &FeeResult, max_fee_drops: u64) -> Result<u64, LedgerError> {
    let parse = |field: &str, raw: &str| {
        raw.parse::<u64>().map_err(|_| {
            LedgerError::internal(format!("fee response has non-numeric {}: {}", field, raw))
        })
    };
    let base = parse("base_fee", &fee.drops.base_fee)?;
    let open = parse("open_ledger_fee", &fee.drops.open_ledger_fee)?;
    Ok(open.max(base).min(max_fee_drops))
}
