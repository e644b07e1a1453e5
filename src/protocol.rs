//! # Ledger Wire Protocol
//!
//! Typed view of the remote node's request/response contract:
//! `{command, ...params} -> {result} | {error, error_code, error_message}`.
//!
//! Each known command has a typed response. Commands sent through [`Command::Raw`] come back as
//! [`LedgerResponse::Unknown`] so arbitrary calls still work without ad hoc field probing on the
//! typed paths.

use crate::error::{LedgerError, LedgerErrorKind};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Decimal places between drops and whole XRP (or XAH).
pub const DROPS_SCALE: u32 = 6;

/// Converts a drops string into whole units of the native currency.
pub fn drops_to_xrp(drops: &str) -> Option<Decimal> {
    let drops: i64 = drops.trim().parse().ok()?;
    Some(Decimal::new(drops, DROPS_SCALE).normalize())
}

/// A request to the remote node.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AccountInfo {
        account: String,
    },
    AccountNfts {
        account: String,
        limit: Option<u32>,
        marker: Option<Value>,
    },
    NftSellOffers {
        nft_id: String,
    },
    NftBuyOffers {
        nft_id: String,
    },
    Tx {
        hash: String,
    },
    Submit {
        tx_blob: String,
    },
    Fee,
    LedgerCurrent,
    ServerInfo,
    Raw {
        command: String,
        params: Map<String, Value>,
    },
}

impl Command {
    pub fn raw(command: impl Into<String>, params: Map<String, Value>) -> Self {
        Command::Raw {
            command: command.into(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::AccountInfo { .. } => "account_info",
            Command::AccountNfts { .. } => "account_nfts",
            Command::NftSellOffers { .. } => "nft_sell_offers",
            Command::NftBuyOffers { .. } => "nft_buy_offers",
            Command::Tx { .. } => "tx",
            Command::Submit { .. } => "submit",
            Command::Fee => "fee",
            Command::LedgerCurrent => "ledger_current",
            Command::ServerInfo => "server_info",
            Command::Raw { command, .. } => command,
        }
    }

    /// JSON body sent over the wire (without the correlation `id`).
    pub fn to_payload(&self) -> Value {
        match self {
            Command::AccountInfo { account } => json!({
                "command": "account_info",
                "account": account,
                "ledger_index": "current",
            }),
            Command::AccountNfts {
                account,
                limit,
                marker,
            } => {
                let mut payload = json!({
                    "command": "account_nfts",
                    "account": account,
                    "ledger_index": "validated",
                });
                if let Some(limit) = limit {
                    payload["limit"] = json!(limit);
                }
                if let Some(marker) = marker {
                    payload["marker"] = marker.clone();
                }
                payload
            }
            Command::NftSellOffers { nft_id } => json!({
                "command": "nft_sell_offers",
                "nft_id": nft_id,
                "ledger_index": "validated",
            }),
            Command::NftBuyOffers { nft_id } => json!({
                "command": "nft_buy_offers",
                "nft_id": nft_id,
                "ledger_index": "validated",
            }),
            Command::Tx { hash } => json!({
                "command": "tx",
                "transaction": hash,
                "binary": false,
            }),
            Command::Submit { tx_blob } => json!({
                "command": "submit",
                "tx_blob": tx_blob,
            }),
            Command::Fee => json!({ "command": "fee" }),
            Command::LedgerCurrent => json!({ "command": "ledger_current" }),
            Command::ServerInfo => json!({ "command": "server_info" }),
            Command::Raw { command, params } => {
                let mut body = params.clone();
                body.insert("command".to_string(), Value::String(command.clone()));
                Value::Object(body)
            }
        }
    }
}

/// Error codes the facade knows how to classify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorCode {
    ActNotFound,
    ObjectNotFound,
    EntryNotFound,
    TxnNotFound,
    LgrNotFound,
    SlowDown,
    TooBusy,
    InvalidTransaction,
    Internal,
    Other(String),
}

impl From<&str> for RemoteErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "actNotFound" => RemoteErrorCode::ActNotFound,
            "objectNotFound" => RemoteErrorCode::ObjectNotFound,
            "entryNotFound" => RemoteErrorCode::EntryNotFound,
            "txnNotFound" => RemoteErrorCode::TxnNotFound,
            "lgrNotFound" => RemoteErrorCode::LgrNotFound,
            "slowDown" => RemoteErrorCode::SlowDown,
            "tooBusy" => RemoteErrorCode::TooBusy,
            "invalidTransaction" => RemoteErrorCode::InvalidTransaction,
            "internal" => RemoteErrorCode::Internal,
            other => RemoteErrorCode::Other(other.to_string()),
        }
    }
}

impl RemoteErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            RemoteErrorCode::ActNotFound => "actNotFound",
            RemoteErrorCode::ObjectNotFound => "objectNotFound",
            RemoteErrorCode::EntryNotFound => "entryNotFound",
            RemoteErrorCode::TxnNotFound => "txnNotFound",
            RemoteErrorCode::LgrNotFound => "lgrNotFound",
            RemoteErrorCode::SlowDown => "slowDown",
            RemoteErrorCode::TooBusy => "tooBusy",
            RemoteErrorCode::InvalidTransaction => "invalidTransaction",
            RemoteErrorCode::Internal => "internal",
            RemoteErrorCode::Other(code) => code,
        }
    }

    pub fn classify(&self) -> LedgerErrorKind {
        match self {
            RemoteErrorCode::ActNotFound => LedgerErrorKind::AccountNotFound,
            RemoteErrorCode::ObjectNotFound
            | RemoteErrorCode::EntryNotFound
            | RemoteErrorCode::TxnNotFound
            | RemoteErrorCode::LgrNotFound => LedgerErrorKind::ObjectNotFound,
            RemoteErrorCode::SlowDown | RemoteErrorCode::TooBusy => {
                LedgerErrorKind::RateLimitExceeded
            }
            RemoteErrorCode::InvalidTransaction => LedgerErrorKind::InvalidTransaction,
            RemoteErrorCode::Internal => LedgerErrorKind::InternalError,
            RemoteErrorCode::Other(_) => LedgerErrorKind::NetworkError,
        }
    }
}

/// Error reply from the remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub error_code: Option<i64>,
    pub message: Option<String>,
    pub raw: Value,
}

impl RemoteError {
    fn from_object(obj: &Value, raw: Value) -> Option<Self> {
        let code = obj.get("error")?.as_str()?;
        Some(Self {
            code: RemoteErrorCode::from(code),
            error_code: obj.get("error_code").and_then(Value::as_i64),
            message: obj
                .get("error_message")
                .or_else(|| obj.get("error_exception"))
                .and_then(Value::as_str)
                .map(str::to_string),
            raw,
        })
    }
}

/// A decoded reply envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply {
    Success(Value),
    Error(RemoteError),
}

impl RemoteReply {
    /// Splits a raw reply into its result or its error.
    ///
    /// Nodes report errors either at the top level (`status: "error"`) or nested in `result`;
    /// both shapes are accepted.
    pub fn from_value(reply: Value) -> Self {
        if let Some(err) = RemoteError::from_object(&reply, reply.clone()) {
            return RemoteReply::Error(err);
        }
        if let Some(result) = reply.get("result") {
            if let Some(err) = RemoteError::from_object(result, reply.clone()) {
                return RemoteReply::Error(err);
            }
        }
        if reply.get("status").and_then(Value::as_str) == Some("error") {
            return RemoteReply::Error(RemoteError {
                code: RemoteErrorCode::Other("unknown".to_string()),
                error_code: None,
                message: None,
                raw: reply,
            });
        }
        match reply {
            Value::Object(mut obj) => match obj.remove("result") {
                Some(result) => RemoteReply::Success(result),
                None => RemoteReply::Success(Value::Object(obj)),
            },
            other => RemoteReply::Success(other),
        }
    }
}

/// Native drops or an issued-currency amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Drops(String),
    Issued {
        currency: String,
        issuer: String,
        value: String,
    },
}

impl Amount {
    /// Value in whole native units, `None` for issued currencies.
    pub fn as_xrp(&self) -> Option<Decimal> {
        match self {
            Amount::Drops(drops) => drops_to_xrp(drops),
            Amount::Issued { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRoot {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Balance")]
    pub balance: String,
    #[serde(rename = "Sequence")]
    pub sequence: u32,
    #[serde(rename = "OwnerCount", default)]
    pub owner_count: u32,
    #[serde(rename = "Flags", default)]
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_data: AccountRoot,
    #[serde(default)]
    pub ledger_current_index: Option<u32>,
    #[serde(default)]
    pub ledger_index: Option<u32>,
    #[serde(default)]
    pub validated: bool,
}

impl AccountInfo {
    pub fn balance_xrp(&self) -> Option<Decimal> {
        drops_to_xrp(&self.account_data.balance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfToken {
    #[serde(rename = "NFTokenID")]
    pub id: String,
    #[serde(rename = "Issuer")]
    pub issuer: String,
    #[serde(rename = "NFTokenTaxon")]
    pub taxon: u32,
    #[serde(rename = "Flags", default)]
    pub flags: u32,
    #[serde(rename = "URI", default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "TransferFee", default, skip_serializing_if = "Option::is_none")]
    pub transfer_fee: Option<u16>,
    #[serde(default)]
    pub nft_serial: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountNfts {
    pub account: String,
    #[serde(default)]
    pub account_nfts: Vec<NfToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<Value>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftOffer {
    pub amount: Amount,
    #[serde(default)]
    pub flags: u32,
    pub nft_offer_index: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftOffers {
    pub nft_id: String,
    #[serde(default)]
    pub offers: Vec<NftOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<Value>,
}

/// A transaction as returned by the `tx` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub hash: String,
    #[serde(default)]
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TxResult {
    pub fn transaction_result(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|m| m.get("TransactionResult"))
            .and_then(Value::as_str)
    }

    pub fn succeeded(&self) -> bool {
        self.validated && self.transaction_result() == Some("tesSUCCESS")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub engine_result: String,
    #[serde(default)]
    pub engine_result_code: i64,
    #[serde(default)]
    pub engine_result_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_blob: Option<String>,
    #[serde(default)]
    pub tx_json: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
}

impl SubmitResult {
    pub fn hash(&self) -> Option<&str> {
        self.tx_json.get("hash").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeDrops {
    pub base_fee: String,
    #[serde(default)]
    pub median_fee: String,
    #[serde(default)]
    pub minimum_fee: String,
    pub open_ledger_fee: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeResult {
    pub drops: FeeDrops,
    pub ledger_current_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCurrent {
    pub ledger_current_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfoDetails {
    #[serde(default)]
    pub build_version: Option<String>,
    #[serde(default)]
    pub complete_ledgers: Option<String>,
    #[serde(default)]
    pub server_state: Option<String>,
    #[serde(default)]
    pub network_id: Option<u32>,
    #[serde(default)]
    pub validated_ledger: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub info: ServerInfoDetails,
}

/// Typed result of a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerResponse {
    AccountInfo(AccountInfo),
    AccountNfts(AccountNfts),
    NftOffers(NftOffers),
    Tx(TxResult),
    Submit(SubmitResult),
    Fee(FeeResult),
    LedgerCurrent(LedgerCurrent),
    ServerInfo(ServerInfo),
    Unknown(Value),
}

impl LedgerResponse {
    pub fn decode(command: &Command, result: Value) -> Result<Self, LedgerError> {
        Ok(match command {
            Command::AccountInfo { .. } => LedgerResponse::AccountInfo(typed(command, result)?),
            Command::AccountNfts { .. } => LedgerResponse::AccountNfts(typed(command, result)?),
            Command::NftSellOffers { .. } | Command::NftBuyOffers { .. } => {
                LedgerResponse::NftOffers(typed(command, result)?)
            }
            Command::Tx { .. } => LedgerResponse::Tx(typed(command, result)?),
            Command::Submit { .. } => LedgerResponse::Submit(typed(command, result)?),
            Command::Fee => LedgerResponse::Fee(typed(command, result)?),
            Command::LedgerCurrent => LedgerResponse::LedgerCurrent(typed(command, result)?),
            Command::ServerInfo => LedgerResponse::ServerInfo(typed(command, result)?),
            Command::Raw { .. } => LedgerResponse::Unknown(result),
        })
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            LedgerResponse::AccountInfo(_) => "account_info",
            LedgerResponse::AccountNfts(_) => "account_nfts",
            LedgerResponse::NftOffers(_) => "nft_offers",
            LedgerResponse::Tx(_) => "tx",
            LedgerResponse::Submit(_) => "submit",
            LedgerResponse::Fee(_) => "fee",
            LedgerResponse::LedgerCurrent(_) => "ledger_current",
            LedgerResponse::ServerInfo(_) => "server_info",
            LedgerResponse::Unknown(_) => "unknown",
        }
    }
}

fn typed<T: DeserializeOwned>(command: &Command, result: Value) -> Result<T, LedgerError> {
    T::deserialize(&result).map_err(|e| {
        LedgerError::internal(format!("malformed {} response: {}", command.name(), e))
            .with_cause(result.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_top_level_error_envelope() {
        let reply = json!({
            "id": 3,
            "status": "error",
            "type": "response",
            "error": "actNotFound",
            "error_code": 19,
            "error_message": "Account not found.",
        });
        match RemoteReply::from_value(reply) {
            RemoteReply::Error(err) => {
                assert_eq!(err.code, RemoteErrorCode::ActNotFound);
                assert_eq!(err.error_code, Some(19));
                assert_eq!(err.message.as_deref(), Some("Account not found."));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_error_envelope() {
        let reply = json!({
            "id": 4,
            "result": { "error": "txnNotFound", "status": "error" },
        });
        match RemoteReply::from_value(reply) {
            RemoteReply::Error(err) => {
                assert_eq!(err.code.classify(), LedgerErrorKind::ObjectNotFound)
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_success_envelope_unwraps_result() {
        let reply = json!({
            "id": 1,
            "status": "success",
            "result": { "ledger_current_index": 90 },
        });
        assert_eq!(
            RemoteReply::from_value(reply),
            RemoteReply::Success(json!({ "ledger_current_index": 90 }))
        );
    }

    #[test]
    fn test_unknown_code_is_network_error() {
        assert_eq!(
            RemoteErrorCode::from("noNetwork").classify(),
            LedgerErrorKind::NetworkError
        );
        assert_eq!(RemoteErrorCode::from("noNetwork").as_str(), "noNetwork");
    }

    #[test]
    fn test_decode_account_info() {
        let result = json!({
            "account_data": {
                "Account": "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
                "Balance": "25000000",
                "Flags": 0,
                "OwnerCount": 2,
                "Sequence": 41,
            },
            "ledger_current_index": 1000,
            "validated": false,
        });
        let command = Command::AccountInfo {
            account: "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe".into(),
        };
        match LedgerResponse::decode(&command, result).unwrap() {
            LedgerResponse::AccountInfo(info) => {
                assert_eq!(info.account_data.sequence, 41);
                assert_eq!(info.balance_xrp(), Some(Decimal::from_str("25").unwrap()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_typed_response_is_internal_error() {
        let command = Command::Fee;
        let err = LedgerResponse::decode(&command, json!({ "nope": true })).unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::InternalError);
        assert!(err.cause.is_some());
    }

    #[test]
    fn test_raw_command_payload_and_unknown_response() {
        let mut params = Map::new();
        params.insert("account".into(), json!("rAccount"));
        let command = Command::raw("account_lines", params);
        assert_eq!(
            command.to_payload(),
            json!({ "command": "account_lines", "account": "rAccount" })
        );
        let decoded = LedgerResponse::decode(&command, json!({ "lines": [] })).unwrap();
        assert_eq!(decoded, LedgerResponse::Unknown(json!({ "lines": [] })));
    }

    #[test]
    fn test_amount_variants() {
        let drops: Amount = serde_json::from_value(json!("1500000")).unwrap();
        assert_eq!(drops.as_xrp(), Some(Decimal::from_str("1.5").unwrap()));

        let issued: Amount = serde_json::from_value(json!({
            "currency": "USD",
            "issuer": "rIssuer",
            "value": "10",
        }))
        .unwrap();
        assert_eq!(issued.as_xrp(), None);
    }
}
