//! # Ledger Error Taxonomy
//!
//! Every operation on the ledger facade ends in either a typed success value or exactly one
//! [`LedgerError`]. Raw remote error codes and submission engine results are classified here,
//! through closed enums, so the mapping is checked by the compiler instead of by string probing.

use crate::protocol::RemoteError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tag of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerErrorKind {
    ConnectionFailed,
    Disconnected,
    AccountNotFound,
    ObjectNotFound,
    InsufficientFunds,
    RateLimitExceeded,
    TransactionFailed,
    ValidationTimeout,
    InvalidTransaction,
    NetworkError,
    InternalError,
}

impl LedgerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerErrorKind::ConnectionFailed => "connection_failed",
            LedgerErrorKind::Disconnected => "disconnected",
            LedgerErrorKind::AccountNotFound => "account_not_found",
            LedgerErrorKind::ObjectNotFound => "object_not_found",
            LedgerErrorKind::InsufficientFunds => "insufficient_funds",
            LedgerErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            LedgerErrorKind::TransactionFailed => "transaction_failed",
            LedgerErrorKind::ValidationTimeout => "validation_timeout",
            LedgerErrorKind::InvalidTransaction => "invalid_transaction",
            LedgerErrorKind::NetworkError => "network_error",
            LedgerErrorKind::InternalError => "internal_error",
        }
    }

    /// Connection-level failures, as opposed to request- or orchestration-level ones.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            LedgerErrorKind::ConnectionFailed | LedgerErrorKind::Disconnected
        )
    }
}

impl fmt::Display for LedgerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by the ledger facade.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
    /// Raw remote payload that caused the failure, when there is one.
    pub cause: Option<Value>,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Value) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn is(&self, kind: LedgerErrorKind) -> bool {
        self.kind == kind
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::ConnectionFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::InternalError, message)
    }

    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::InvalidTransaction, message)
    }

    /// Classifies an error reply from the remote node.
    pub fn from_remote(err: RemoteError) -> Self {
        let kind = err.code.classify();
        let message = err
            .message
            .clone()
            .unwrap_or_else(|| err.code.as_str().to_string());
        Self::new(kind, message).with_cause(err.raw)
    }

    /// Classifies a submission engine result. `None` means the transaction was accepted.
    pub fn from_engine_result(engine_result: &str, message: &str, raw: Value) -> Option<Self> {
        classify_engine_result(engine_result)
            .map(|kind| Self::new(kind, format!("{}: {}", engine_result, message)).with_cause(raw))
    }
}

impl From<TransportError> for LedgerError {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Handshake(_) | TransportError::InvalidEndpoint(_) => {
                LedgerErrorKind::ConnectionFailed
            }
            TransportError::Closed => LedgerErrorKind::Disconnected,
            TransportError::Timeout(_) | TransportError::Io(_) | TransportError::Decode(_) => {
                LedgerErrorKind::NetworkError
            }
        };
        Self::new(kind, err.to_string())
    }
}

/// Engine result prefixes: `tes` success, `tec` claimed fee but failed, `tef`/`tel`/`tem`/`ter`
/// rejected before or during application.
pub fn classify_engine_result(engine_result: &str) -> Option<LedgerErrorKind> {
    match engine_result {
        "tesSUCCESS" | "terQUEUED" => None,
        "terINSUF_FEE_B" | "telINSUF_FEE_P" => Some(LedgerErrorKind::InsufficientFunds),
        r if r.starts_with("tecUNFUNDED")
            || r.starts_with("tecINSUFFICIENT_")
            || r.starts_with("tecINSUF_RESERVE") =>
        {
            Some(LedgerErrorKind::InsufficientFunds)
        }
        r if r.starts_with("tem") => Some(LedgerErrorKind::InvalidTransaction),
        _ => Some(LedgerErrorKind::TransactionFailed),
    }
}
