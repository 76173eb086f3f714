use serde::{Deserialize, Serialize};
use txm_core::{error::TxmError, fee::FeeError};

use crate::store::TxStoreError;

/// Errors surfaced by the delivery workers. Worker loops log these and move
/// on to the next cycle rather than exiting.
#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum WorkerError {
    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner_error: TxStoreError,
    },

    #[error("Chain error: {message}")]
    ChainError {
        message: String,
        inner_error: TxmError,
    },

    #[error("Fee error: {message}")]
    FeeError {
        message: String,
        inner_error: FeeError,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<TxStoreError> for WorkerError {
    fn from(error: TxStoreError) -> Self {
        WorkerError::StoreError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<TxmError> for WorkerError {
    fn from(error: TxmError) -> Self {
        WorkerError::ChainError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}

impl From<FeeError> for WorkerError {
    fn from(error: FeeError) -> Self {
        WorkerError::FeeError {
            message: error.to_string(),
            inner_error: error,
        }
    }
}
