use alloy::{
    primitives::Address,
    transports::{RpcError as AlloyRpcError, TransportErrorKind},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

/// Serializable mirror of alloy's RPC failure surface.
///
/// Alloy's `RpcError` carries boxed sources and cannot be persisted or
/// cloned; everything worth keeping about a failed call is captured here.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// A proper JSON-RPC error response. The only kind with a server
    /// verdict, and the only kind submission classification applies to.
    #[error("rpc error response: {0}")]
    ErrorResp(RpcErrorResponse),

    #[error("null response where a value was required")]
    NullResp,

    #[error("method not supported by this node: {message}")]
    UnsupportedFeature { message: String },

    /// Request preparation failed before anything reached the wire.
    #[error("request preparation failed: {message}")]
    InternalError { message: String },

    // Ser and deser stay separate variants; collapsing them would hide
    // whether the request or the response was the malformed side.
    #[error("request serialization failed: {message}")]
    SerError { message: String },

    #[error("response deserialization failed: {message}")]
    DeserError {
        message: String,
        /// The response text that failed to parse.
        text: String,
    },

    #[error("http status {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("transport failure: {message}")]
    OtherTransportError { message: String },
}

/// Code, message and data of a JSON-RPC error object, stringified.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum TxmError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Signing failed for {account}: {message}")]
    #[serde(rename_all = "camelCase")]
    SigningError { account: Address, message: String },

    #[error("No signer available for account {account}")]
    #[serde(rename_all = "camelCase")]
    SignerUnavailable { account: Address },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl TxmError {
    /// The JSON-RPC error response carried by this error, when there is one.
    ///
    /// Submission outcome classification only applies to proper error
    /// responses; transport failures have no server verdict to classify.
    pub fn rpc_error_response(&self) -> Option<&RpcErrorResponse> {
        match self {
            TxmError::RpcError {
                kind: RpcErrorKind::ErrorResp(resp),
                ..
            } => Some(resp),
            _ => None,
        }
    }

    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TxmError::RpcError { kind, .. } => match kind {
                RpcErrorKind::TransportHttpError { status, .. }
                    if *status >= 400 && *status < 500 =>
                {
                    false
                }
                RpcErrorKind::UnsupportedFeature { .. } => false,
                RpcErrorKind::ErrorResp(resp) => {
                    let message = resp.message.to_lowercase();
                    !(message.contains("invalid chain") || message.contains("invalid opcode"))
                }
                _ => true,
            },
            TxmError::SigningError { .. } => true,
            TxmError::SignerUnavailable { .. } => false,
            TxmError::RpcConfigError { .. } => false,
            TxmError::ValidationError { .. } => false,
            TxmError::InternalError { .. } => false,
        }
    }
}

impl RpcErrorKind {
    fn from_alloy(error: &AlloyRpcError<TransportErrorKind>) -> Self {
        match error {
            AlloyRpcError::ErrorResp(resp) => RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: resp.code,
                message: resp.message.to_string(),
                data: resp.data.as_ref().map(ToString::to_string),
            }),
            AlloyRpcError::NullResp => RpcErrorKind::NullResp,
            AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
                message: feature.to_string(),
            },
            AlloyRpcError::LocalUsageError(cause) => RpcErrorKind::InternalError {
                message: cause.to_string(),
            },
            AlloyRpcError::SerError(cause) => RpcErrorKind::SerError {
                message: cause.to_string(),
            },
            AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
                message: err.to_string(),
                text: text.to_string(),
            },
            AlloyRpcError::Transport(TransportErrorKind::HttpError(http)) => {
                RpcErrorKind::TransportHttpError {
                    status: http.status,
                    body: http.body.to_string(),
                }
            }
            AlloyRpcError::Transport(transport) => RpcErrorKind::OtherTransportError {
                message: transport.to_string(),
            },
        }
    }
}

pub trait AlloyRpcErrorToTxmError {
    fn to_txm_error(&self, chain: &impl Chain) -> TxmError;
}

impl AlloyRpcErrorToTxmError for AlloyRpcError<TransportErrorKind> {
    fn to_txm_error(&self, chain: &impl Chain) -> TxmError {
        TxmError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: self.to_string(),
            kind: RpcErrorKind::from_alloy(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(kind: RpcErrorKind) -> TxmError {
        TxmError::RpcError {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            message: "rpc call failed".to_string(),
            kind,
        }
    }

    #[test]
    fn error_response_is_exposed_for_classification() {
        let error = rpc_error(RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: -32000,
            message: "nonce too low".to_string(),
            data: None,
        }));
        assert_eq!(error.rpc_error_response().unwrap().code, -32000);

        let transport = rpc_error(RpcErrorKind::OtherTransportError {
            message: "connection reset".to_string(),
        });
        assert!(transport.rpc_error_response().is_none());
    }

    #[test]
    fn transport_failures_are_retryable_client_errors_are_not() {
        assert!(rpc_error(RpcErrorKind::OtherTransportError {
            message: "connection reset".to_string(),
        })
        .is_retryable());
        assert!(rpc_error(RpcErrorKind::TransportHttpError {
            status: 503,
            body: String::new(),
        })
        .is_retryable());
        assert!(!rpc_error(RpcErrorKind::TransportHttpError {
            status: 401,
            body: String::new(),
        })
        .is_retryable());
        assert!(!rpc_error(RpcErrorKind::UnsupportedFeature {
            message: "eth_feeHistory".to_string(),
        })
        .is_retryable());
    }

    #[test]
    fn server_verdicts_are_retryable_unless_deterministic() {
        let verdict = |message: &str| {
            rpc_error(RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: message.to_string(),
                data: None,
            }))
        };
        assert!(verdict("known transaction").is_retryable());
        assert!(!verdict("invalid chain id for signer").is_retryable());
        assert!(!verdict("invalid opcode: INVALID").is_retryable());
    }

    #[test]
    fn local_errors_are_not_retryable() {
        let error = TxmError::ValidationError {
            message: "fee limit must be nonzero".to_string(),
        };
        assert!(!error.is_retryable());
        assert!(
            TxmError::SigningError {
                account: Address::ZERO,
                message: "transient backend failure".to_string(),
            }
            .is_retryable()
        );
    }
}
