use std::sync::Arc;

use txm_core::{error::TxmError, fee::FeeEstimator};

use crate::{
    config::{FeeConfig, PurgeConfig},
    error::WorkerError,
    types::Tx,
};

/// Recorded as the fatal error of a transaction whose nonce was purged.
pub const TERMINALLY_STUCK_ERROR: &str =
    "transaction terminally stuck, nonce consumed by a zero-value replacement";

/// Authoritative "was this transaction discarded" query for networks that
/// expose one. When registered it replaces the heuristic entirely.
pub trait DiscardedTxCheck: Send + Sync {
    fn is_discarded(&self, tx: &Tx) -> impl Future<Output = Result<bool, TxmError>> + Send;
}

/// Placeholder check for networks without a discard endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDiscarded;

impl DiscardedTxCheck for NeverDiscarded {
    async fn is_discarded(&self, _tx: &Tx) -> Result<bool, TxmError> {
        Ok(false)
    }
}

/// Decides when the transaction blocking an account's queue is beyond
/// saving and should have its nonce purged.
///
/// Only the lowest-nonce unconfirmed transaction is ever examined: higher
/// nonces cannot confirm before it regardless of their own fees, so their
/// age says nothing about whether they are stuck.
pub struct StuckDetector<E: FeeEstimator, D: DiscardedTxCheck = NeverDiscarded> {
    purge: PurgeConfig,
    fees: FeeConfig,
    estimator: Arc<E>,
    chain_check: Option<Arc<D>>,
}

impl<E: FeeEstimator> StuckDetector<E> {
    pub fn heuristic(purge: PurgeConfig, fees: FeeConfig, estimator: Arc<E>) -> Self {
        Self {
            purge,
            fees,
            estimator,
            chain_check: None,
        }
    }
}

impl<E: FeeEstimator, D: DiscardedTxCheck> StuckDetector<E, D> {
    pub fn with_chain_check(
        purge: PurgeConfig,
        fees: FeeConfig,
        estimator: Arc<E>,
        check: Arc<D>,
    ) -> Self {
        Self {
            purge,
            fees,
            estimator,
            chain_check: Some(check),
        }
    }

    pub fn enabled(&self) -> bool {
        self.purge.enabled
    }

    /// Examines the account's queue blocker, given its unconfirmed
    /// transactions nonce-ascending and the height of its last purge.
    /// Returns the transaction to purge, if any.
    pub async fn detect(
        &self,
        head_number: u64,
        unconfirmed: &[Tx],
        last_purge_block: Option<u64>,
    ) -> Result<Option<Tx>, WorkerError> {
        if !self.purge.enabled {
            return Ok(None);
        }
        let Some(blocker) = unconfirmed.first() else {
            return Ok(None);
        };
        if blocker.has_purge_attempt() {
            return Ok(None);
        }
        // A legitimately-slow transaction queued behind a purged one becomes
        // the blocker the moment the purge lands; the rate limit gives it a
        // full threshold window of its own before it can be purged too.
        if let Some(purged_at) = last_purge_block
            && head_number < purged_at.saturating_add(self.purge.threshold_blocks)
        {
            return Ok(None);
        }

        let stuck = match &self.chain_check {
            Some(check) => check.is_discarded(blocker).await?,
            None => self.stuck_by_heuristic(head_number, blocker).await?,
        };
        Ok(stuck.then(|| blocker.clone()))
    }

    /// All three must hold: old enough, bumped enough times, and already
    /// priced at or above the market so further bumping cannot help.
    async fn stuck_by_heuristic(&self, head_number: u64, tx: &Tx) -> Result<bool, WorkerError> {
        let Some(earliest_broadcast) = tx
            .attempts
            .iter()
            .filter_map(|a| a.broadcast_before_block_num)
            .min()
        else {
            return Ok(false);
        };
        if head_number < earliest_broadcast.saturating_add(self.purge.threshold_blocks) {
            return Ok(false);
        }
        if (tx.attempts.len() as u32) < self.purge.min_attempts {
            return Ok(false);
        }
        let Some(latest) = tx.current_attempt() else {
            return Ok(false);
        };

        let market = self.estimator.quote(self.fees.price_max_for(&tx.from)).await?;
        match market.strictly_above(&latest.fee) {
            Ok(market_above) => Ok(!market_above),
            // Quote and attempt disagree on fee variant; undecidable, keep
            // waiting.
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, Bytes, U256};
    use chrono::Utc;
    use txm_core::fee::{Fee, FixedFeeEstimator};

    use super::*;
    use crate::types::{AttemptId, TxAttempt, TxAttemptState, TxId, TxState};

    fn account() -> Address {
        Address::with_last_byte(1)
    }

    fn unconfirmed_tx(nonce: u64, attempt_count: usize, gas_price: u128) -> Tx {
        let id = TxId::new();
        let attempts = (0..attempt_count)
            .map(|i| TxAttempt {
                id: AttemptId::new(),
                tx_id: id,
                fee: Fee::Legacy {
                    gas_price: gas_price - i as u128,
                },
                signed_payload: Bytes::from(vec![1]),
                hash: B256::random(),
                state: TxAttemptState::Broadcast,
                broadcast_before_block_num: Some(100 + i as u64),
                is_purge_attempt: false,
                created_at: Utc::now(),
            })
            .collect();
        Tx {
            id,
            idempotency_key: None,
            from: account(),
            to: Some(Address::with_last_byte(9)),
            encoded_payload: Bytes::new(),
            value: U256::ZERO,
            fee_limit: 21_000,
            nonce: Some(nonce),
            state: TxState::Unconfirmed,
            attempts,
            receipt: None,
            meta: None,
            error: None,
            created_at: Utc::now(),
            broadcast_at: Some(Utc::now()),
            initial_broadcast_at: Some(Utc::now()),
            min_confirmations: 1,
            signal_callback: false,
            callback_completed: false,
        }
    }

    fn detector(gas_price: u128) -> StuckDetector<FixedFeeEstimator> {
        let purge = PurgeConfig {
            enabled: true,
            threshold_blocks: 50,
            min_attempts: 3,
        };
        let estimator = FixedFeeEstimator {
            gas_price,
            tip: 0,
            dynamic: false,
            bump_percent: 20,
            min_bump_wei: 1,
        };
        StuckDetector::heuristic(purge, FeeConfig::default(), Arc::new(estimator))
    }

    #[tokio::test]
    async fn detects_when_all_conditions_hold() {
        let detector = detector(20);
        let txs = vec![unconfirmed_tx(0, 5, 25), unconfirmed_tx(1, 5, 25)];

        let stuck = detector.detect(200, &txs, None).await.unwrap();
        assert_eq!(stuck.map(|tx| tx.nonce), Some(Some(0)));
    }

    #[tokio::test]
    async fn young_transaction_is_not_stuck() {
        let detector = detector(20);
        let txs = vec![unconfirmed_tx(0, 5, 25)];

        assert!(detector.detect(120, &txs, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn below_market_fee_is_not_stuck() {
        // Fee still below the quote: bumping can still help.
        let detector = detector(40);
        let txs = vec![unconfirmed_tx(0, 5, 25)];

        assert!(detector.detect(200, &txs, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn too_few_attempts_is_not_stuck() {
        let detector = detector(20);
        let txs = vec![unconfirmed_tx(0, 2, 25)];

        assert!(detector.detect(200, &txs, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purges_are_rate_limited() {
        let detector = detector(20);
        let txs = vec![unconfirmed_tx(0, 5, 25)];

        assert!(detector.detect(200, &txs, Some(170)).await.unwrap().is_none());
        assert!(detector.detect(220, &txs, Some(170)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn chain_check_overrides_heuristic() {
        struct AlwaysDiscarded;
        impl DiscardedTxCheck for AlwaysDiscarded {
            async fn is_discarded(&self, _tx: &Tx) -> Result<bool, TxmError> {
                Ok(true)
            }
        }

        let purge = PurgeConfig {
            enabled: true,
            threshold_blocks: 50,
            min_attempts: 3,
        };
        let estimator = FixedFeeEstimator {
            gas_price: 1_000,
            tip: 0,
            dynamic: false,
            bump_percent: 20,
            min_bump_wei: 1,
        };
        let detector = StuckDetector::with_chain_check(
            purge,
            FeeConfig::default(),
            Arc::new(estimator),
            Arc::new(AlwaysDiscarded),
        );

        // Fresh transaction the heuristic would never flag.
        let txs = vec![unconfirmed_tx(0, 1, 1)];
        assert!(detector.detect(101, &txs, None).await.unwrap().is_some());
    }
}
