use std::sync::Arc;

use alloy::{
    consensus::TxEnvelope,
    eips::eip2718::Encodable2718,
    network::TransactionBuilder,
    primitives::{Address, B256, Bytes, TxKind, U256},
    rpc::types::TransactionRequest,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use txm_core::{
    error::TxmError,
    fee::{Fee, FeeError, FeeEstimator},
    signer::TxSigner,
};

use crate::{
    config::FeeConfig,
    types::{AttemptId, Tx, TxAttempt, TxAttemptState},
};

#[derive(Serialize, Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum BuildError {
    /// Caller configuration error. Non-retryable, no attempt is created.
    #[error("Fee validation failed: {message}")]
    FeeValidation { message: String },

    /// A bump cannot strictly improve on the previous fee within the
    /// configured ceiling. Callers fall back to the previous attempt.
    #[error("Fee bump rejected: {message}")]
    BumpCeiling {
        message: String,
        inner_error: FeeError,
    },

    /// Signing failed. Always retryable on the next cycle.
    #[error("Signing failed: {message}")]
    SigningError {
        message: String,
        inner_error: TxmError,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Turns a stored transaction plus an assigned nonce and fee into a signed,
/// broadcastable attempt. Fee validation happens before the signing call so
/// a rejected fee never leaves a half-built attempt behind.
pub struct AttemptBuilder<S: TxSigner, E: FeeEstimator> {
    signer: Arc<S>,
    estimator: Arc<E>,
    chain_id: u64,
    fees: FeeConfig,
}

impl<S: TxSigner, E: FeeEstimator> AttemptBuilder<S, E> {
    pub fn new(signer: Arc<S>, estimator: Arc<E>, chain_id: u64, fees: FeeConfig) -> Self {
        Self {
            signer,
            estimator,
            chain_id,
            fees,
        }
    }

    /// Effective fee ceiling for the account, for alerting.
    pub fn fee_ceiling(&self, from: Address) -> u128 {
        self.fees.price_max_for(&from)
    }

    /// Quotes a fresh fee for the first attempt of a transaction.
    pub async fn quote_fee(&self, from: Address) -> Result<Fee, BuildError> {
        self.estimator
            .quote(self.fees.price_max_for(&from))
            .await
            .map_err(|e| BuildError::FeeValidation {
                message: format!("fee quote failed: {e}"),
            })
    }

    /// Builds and signs an attempt for the transaction's own payload at the
    /// given fee. Exactly one signing call.
    pub async fn build(&self, tx: &Tx, nonce: u64, fee: Fee) -> Result<TxAttempt, BuildError> {
        self.validate_fee(tx.from, &fee)?;
        let request = self.payload_request(tx, nonce);
        self.sign(tx, request, nonce, fee, false).await
    }

    /// Fee-escalation entry point. Bumps from the transaction's newest
    /// attempt (the highest fee by the monotonicity invariant), re-validates
    /// and signs the replacement.
    pub async fn build_bumped(&self, tx: &Tx, nonce: u64) -> Result<TxAttempt, BuildError> {
        let previous = tx
            .current_attempt()
            .ok_or_else(|| BuildError::InternalError {
                message: format!("transaction {} has no attempt to bump from", tx.id),
            })?;
        let fee = self.bump_fee(tx.from, &previous.fee).await?;
        self.build(tx, nonce, fee).await
    }

    /// Builds a zero-value self-send that consumes a stuck transaction's
    /// nonce, priced to outbid the newest existing attempt.
    pub async fn build_purge(&self, tx: &Tx, nonce: u64) -> Result<TxAttempt, BuildError> {
        let fee = match tx.current_attempt() {
            Some(previous) => self.bump_fee(tx.from, &previous.fee).await?,
            None => self.quote_fee(tx.from).await?,
        };
        self.validate_fee(tx.from, &fee)?;

        let request = self.self_send_request(tx.from, nonce, 21_000);
        self.sign(tx, request, nonce, fee, true).await
    }

    /// Operator-forced replacement at an exact fee. Skips ceiling checks on
    /// purpose and never persists: the caller broadcasts the raw payload
    /// directly. A `None` payload produces a zero-value self-send for nonce
    /// holes.
    pub async fn build_forced(
        &self,
        from: Address,
        nonce: u64,
        fee: Fee,
        gas_limit: u64,
        payload: Option<&Tx>,
    ) -> Result<(B256, Bytes), BuildError> {
        let request = match payload {
            Some(tx) => self.payload_request(tx, nonce).with_gas_limit(gas_limit),
            None => self.self_send_request(from, nonce, gas_limit),
        };
        let request = apply_fee(request, fee);
        let (hash, raw) = self.sign_raw(from, request, nonce).await?;
        Ok((hash, raw))
    }

    async fn bump_fee(&self, from: Address, previous: &Fee) -> Result<Fee, BuildError> {
        self.estimator
            .bump(previous, self.fees.price_max_for(&from))
            .await
            .map_err(|inner| BuildError::BumpCeiling {
                message: inner.to_string(),
                inner_error: inner,
            })
    }

    fn payload_request(&self, tx: &Tx, nonce: u64) -> TransactionRequest {
        let request = TransactionRequest::default()
            .with_from(tx.from)
            .with_value(tx.value)
            .with_input(tx.encoded_payload.clone())
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_gas_limit(tx.fee_limit);
        match tx.to {
            Some(to) => request.with_to(to),
            None => request.with_kind(TxKind::Create),
        }
    }

    fn self_send_request(&self, from: Address, nonce: u64, gas_limit: u64) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(from)
            .with_to(from)
            .with_value(U256::ZERO)
            .with_input(Bytes::new())
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_gas_limit(gas_limit)
    }

    async fn sign(
        &self,
        tx: &Tx,
        request: TransactionRequest,
        nonce: u64,
        fee: Fee,
        is_purge_attempt: bool,
    ) -> Result<TxAttempt, BuildError> {
        let request = apply_fee(request, fee);
        let (hash, raw) = self.sign_raw(tx.from, request, nonce).await?;

        Ok(TxAttempt {
            id: AttemptId::new(),
            tx_id: tx.id,
            fee,
            signed_payload: raw,
            hash,
            state: TxAttemptState::InProgress,
            broadcast_before_block_num: None,
            is_purge_attempt,
            created_at: Utc::now(),
        })
    }

    async fn sign_raw(
        &self,
        from: Address,
        request: TransactionRequest,
        nonce: u64,
    ) -> Result<(B256, Bytes), BuildError> {
        let typed_tx = request
            .build_typed_tx()
            .map_err(|e| BuildError::InternalError {
                message: format!("failed to build typed transaction for nonce {nonce}: {e:?}"),
            })?;

        let signed = self
            .signer
            .sign_transaction(from, typed_tx)
            .await
            .map_err(|inner| BuildError::SigningError {
                message: inner.to_string(),
                inner_error: inner,
            })?;
        let hash = *signed.hash();
        let envelope: TxEnvelope = signed.into();
        Ok((hash, Bytes::from(envelope.encoded_2718())))
    }

    fn validate_fee(&self, from: Address, fee: &Fee) -> Result<(), BuildError> {
        let ceiling = self.fees.price_max_for(&from);
        match fee {
            Fee::Legacy { gas_price } => {
                if *gas_price < self.fees.price_min {
                    return Err(BuildError::FeeValidation {
                        message: format!(
                            "gas price {gas_price} wei is below the configured minimum {} wei",
                            self.fees.price_min
                        ),
                    });
                }
                if *gas_price > ceiling {
                    return Err(BuildError::FeeValidation {
                        message: format!(
                            "gas price {gas_price} wei exceeds the maximum {ceiling} wei for {from}"
                        ),
                    });
                }
            }
            Fee::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                if *max_priority_fee_per_gas < self.fees.tip_min {
                    return Err(BuildError::FeeValidation {
                        message: format!(
                            "priority fee {max_priority_fee_per_gas} wei is below the configured minimum {} wei",
                            self.fees.tip_min
                        ),
                    });
                }
                if max_fee_per_gas < max_priority_fee_per_gas {
                    return Err(BuildError::FeeValidation {
                        message: format!(
                            "fee cap {max_fee_per_gas} wei is below the priority fee {max_priority_fee_per_gas} wei"
                        ),
                    });
                }
                if *max_fee_per_gas > ceiling {
                    return Err(BuildError::FeeValidation {
                        message: format!(
                            "fee cap {max_fee_per_gas} wei exceeds the maximum {ceiling} wei for {from}"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn apply_fee(request: TransactionRequest, fee: Fee) -> TransactionRequest {
    match fee {
        Fee::Legacy { gas_price } => request.with_gas_price(gas_price),
        Fee::Dynamic {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => request
            .with_max_fee_per_gas(max_fee_per_gas)
            .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
    }
}
