use alloy::primitives::Address;

use crate::types::TxId;

/// Operator-facing signals emitted by the delivery workers. Injected rather
/// than global so tests can assert on what fired.
pub trait AlertSink: Send + Sync {
    /// The account cannot fund its own queue. Broadcasting continues at the
    /// current price until the balance recovers.
    fn out_of_funds(&self, account: Address, tx_id: TxId);

    /// A bump would exceed the configured per-account fee ceiling. The
    /// previous attempt keeps being resubmitted instead.
    fn fee_ceiling_reached(&self, account: Address, tx_id: TxId, ceiling: u128);

    /// Broadcasting halted because too many transactions are awaiting
    /// confirmation.
    fn broadcast_throttled(&self, account: Address, unconfirmed: u64, max_in_flight: u32);

    /// A new transaction was rejected because the unstarted queue is full.
    fn queue_capacity(&self, account: Address, queued: u64, max_queued: u64);

    /// The oldest unconfirmed transaction has been waiting well past the
    /// resend threshold.
    fn stuck_unconfirmed(&self, account: Address, tx_id: TxId, unconfirmed_for: chrono::Duration);

    /// A state the delivery pipeline should never produce was observed.
    fn invariant_violation(&self, account: Address, message: &str);

    /// A stuck transaction was replaced with a zero-value self-send.
    fn tx_purged(&self, account: Address, tx_id: TxId, nonce: u64);
}

/// Default sink that forwards every signal to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn out_of_funds(&self, account: Address, tx_id: TxId) {
        tracing::error!(
            account = %account,
            tx_id = %tx_id,
            "Account has insufficient funds, retrying at current price until topped up"
        );
    }

    fn fee_ceiling_reached(&self, account: Address, tx_id: TxId, ceiling: u128) {
        tracing::warn!(
            account = %account,
            tx_id = %tx_id,
            ceiling_wei = ceiling,
            "Fee bump hit the configured price ceiling, resubmitting previous attempt. \
             Raise the account's maximum gas price to bump further"
        );
    }

    fn broadcast_throttled(&self, account: Address, unconfirmed: u64, max_in_flight: u32) {
        tracing::warn!(
            account = %account,
            unconfirmed = unconfirmed,
            max_in_flight = max_in_flight,
            "Transaction throttling: too many unconfirmed transactions, waiting for confirmations"
        );
    }

    fn queue_capacity(&self, account: Address, queued: u64, max_queued: u64) {
        tracing::warn!(
            account = %account,
            queued = queued,
            max_queued = max_queued,
            "Transaction queue is full, rejecting new transaction"
        );
    }

    fn stuck_unconfirmed(&self, account: Address, tx_id: TxId, unconfirmed_for: chrono::Duration) {
        tracing::warn!(
            account = %account,
            tx_id = %tx_id,
            unconfirmed_for_secs = unconfirmed_for.num_seconds(),
            "Transaction has been unconfirmed for a long time, the node may be dropping it"
        );
    }

    fn invariant_violation(&self, account: Address, message: &str) {
        tracing::error!(account = %account, "Invariant violation: {message}");
    }

    fn tx_purged(&self, account: Address, tx_id: TxId, nonce: u64) {
        tracing::warn!(
            account = %account,
            tx_id = %tx_id,
            nonce = nonce,
            "Purged stuck transaction with a zero-value replacement"
        );
    }
}
