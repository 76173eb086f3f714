use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AttemptId, Receipt, Tx, TxAttempt, TxId, TxState};

mod memory;

pub use memory::InMemoryTxStore;

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TxStoreError {
    #[error("Storage backend error: {message}")]
    BackendError { message: String },

    #[error("Transaction not found: {tx_id}")]
    TxNotFound { tx_id: TxId },

    #[error("Attempt not found: {attempt_id}")]
    AttemptNotFound { attempt_id: AttemptId },

    #[error("Transaction {tx_id} is {actual}, expected {expected}")]
    InvalidTxState {
        tx_id: TxId,
        expected: TxState,
        actual: TxState,
    },

    #[error("Account {from} already has an in-progress transaction {tx_id}")]
    InProgressTxExists { from: Address, tx_id: TxId },

    #[error("Serialization error: {message}")]
    SerError { message: String },
}

impl From<serde_json::Error> for TxStoreError {
    fn from(error: serde_json::Error) -> Self {
        TxStoreError::SerError {
            message: error.to_string(),
        }
    }
}

/// Persistent source of truth for transactions, attempts, receipts and
/// per-account nonce counters. The store is the only synchronization point
/// between workers: every multi-record transition here is one atomic unit,
/// so a worker killed between calls never leaves half-written state.
pub trait TxStore: Send + Sync {
    // ----- creation and lookups -----

    /// Insert a new unstarted transaction. When `idempotency_key` matches an
    /// existing transaction, that transaction is returned unchanged and
    /// nothing is inserted.
    fn insert_tx(&self, tx: Tx) -> impl Future<Output = Result<Tx, TxStoreError>> + Send;

    fn get_tx(&self, id: TxId) -> impl Future<Output = Result<Option<Tx>, TxStoreError>> + Send;

    fn count_unstarted(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<u64, TxStoreError>> + Send;

    fn count_unconfirmed(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<u64, TxStoreError>> + Send;

    // ----- broadcaster -----

    /// Oldest unstarted transaction for the account, by creation order.
    fn find_next_unstarted(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<Tx>, TxStoreError>> + Send;

    /// The at-most-one in-progress transaction for the account.
    fn find_in_progress_tx(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<Tx>, TxStoreError>> + Send;

    /// Move a transaction from unstarted to in-progress with its nonce and
    /// first attempt, atomically. Fails if the account already has an
    /// in-progress transaction.
    fn save_tx_in_progress(
        &self,
        tx: &Tx,
        attempt: &TxAttempt,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Promote in-progress to unconfirmed/broadcast and advance the
    /// account's nonce counter past this transaction's nonce, as one unit.
    /// The counter and the recorded nonce can never diverge across a crash.
    fn save_broadcast(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Terminal rejection at broadcast time. Attempts are deleted and the
    /// nonce is released for the next transaction (the counter was never
    /// advanced).
    fn save_fatally_errored(
        &self,
        tx_id: TxId,
        error: String,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- nonce counter -----

    /// `None` until the first sync against the network.
    fn next_nonce(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<u64>, TxStoreError>> + Send;

    fn set_next_nonce(
        &self,
        from: Address,
        nonce: u64,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- confirmer: receipt fetch -----

    /// Stamp every broadcast attempt that has no height baseline yet with
    /// `block_num`. Existing stamps are kept so the earliest height wins.
    fn stamp_broadcast_before_block_num(
        &self,
        block_num: u64,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    fn find_confirmed_missing_receipt_txs(
        &self,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Demote back to unconfirmed so the transactions re-enter the bump
    /// cycle.
    fn update_txs_unconfirmed(
        &self,
        tx_ids: &[TxId],
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Unconfirmed and confirmed-missing-receipt transactions with their
    /// attempts, nonce-ascending per account.
    fn find_txs_requiring_receipt_fetch(
        &self,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Store receipts (matched to attempts by transaction hash) and mark
    /// their transactions confirmed.
    fn save_fetched_receipts(
        &self,
        receipts: &[Receipt],
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Unconfirmed transactions whose nonce is below the account's highest
    /// confirmed nonce but which have no receipt: mark them
    /// confirmed-missing-receipt. Returns the affected ids.
    fn mark_confirmed_missing_receipt(
        &self,
    ) -> impl Future<Output = Result<Vec<TxId>, TxStoreError>> + Send;

    /// Confirmed-missing-receipt transactions whose every attempt was
    /// broadcast before `cutoff_block` are moved to fatal error. Returns
    /// them for alerting and callback resumption.
    fn mark_old_txs_missing_receipt_errored(
        &self,
        cutoff_block: u64,
        error: String,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    // ----- confirmer: rebroadcast -----

    /// Unconfirmed transactions holding an in-progress attempt (crash or
    /// interrupted bump), nonce-ascending.
    fn find_txs_with_in_progress_attempts(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Transactions needing a new attempt: latest attempt hit insufficient
    /// funds, no attempt exists at all, or (when `bump_threshold` > 0)
    /// every attempt is broadcast and the newest went out more than
    /// `bump_threshold` blocks before `current_block`. Nonce-ascending;
    /// bump candidates capped at `bump_depth` when nonzero.
    fn find_txs_requiring_rebroadcast(
        &self,
        from: Address,
        current_block: u64,
        bump_threshold: u64,
        bump_depth: u32,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Append a freshly signed in-progress attempt (bump or purge). Saving
    /// the same attempt id again is a no-op.
    fn save_in_progress_attempt(
        &self,
        attempt: &TxAttempt,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Replace an abandoned in-progress attempt with a re-signed one, as
    /// one unit.
    fn save_replacement_in_progress_attempt(
        &self,
        old_attempt_id: AttemptId,
        new_attempt: &TxAttempt,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    fn delete_in_progress_attempt(
        &self,
        attempt_id: AttemptId,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Attempt accepted (or already known): mark it broadcast and refresh
    /// the transaction's broadcast time.
    fn save_sent_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Attempt rejected for lack of funds: keep it for resubmission.
    fn save_insufficient_funds_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    /// Node says the nonce is already mined: mark the attempt broadcast and
    /// the transaction confirmed-missing-receipt until a receipt shows up.
    fn save_confirmed_missing_receipt_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- confirmer: reorg repair -----

    /// Confirmed transactions whose receipt block number lies in
    /// `[low, high]`.
    fn find_confirmed_txs_in_block_range(
        &self,
        low: u64,
        high: u64,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Re-org repair: discard the receipt, demote the transaction to
    /// unconfirmed and reset the chosen attempt to in-progress with a
    /// cleared height baseline, as one unit.
    fn update_tx_for_rebroadcast(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- finalizer -----

    /// Confirmed (not yet finalized) transactions whose receipt is at or
    /// below `block_height`.
    fn find_confirmed_txs_up_to(
        &self,
        block_height: u64,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    fn mark_finalized(
        &self,
        tx_ids: &[TxId],
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- completion callbacks -----

    /// Transactions whose caller is owed a completion signal: confirmed
    /// with `min_confirmations` accumulated as of `latest_block`, or
    /// fatally errored.
    fn find_txs_pending_callback(
        &self,
        latest_block: u64,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    fn mark_callback_completed(
        &self,
        tx_id: TxId,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- resender -----

    /// Unconfirmed and confirmed-missing-receipt transactions whose last
    /// broadcast is older than `older_than`, nonce-ascending, at most
    /// `limit` (0 = unlimited).
    fn find_txs_requiring_resend(
        &self,
        from: Address,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Refresh broadcast times after a resend sweep. Applied to every
    /// swept transaction, including ones whose batch item errored, so one
    /// bad item cannot pin the sweep onto the same transaction forever.
    fn update_broadcast_ats(
        &self,
        tx_ids: &[TxId],
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- stuck transactions -----

    /// All unconfirmed transactions for the account, nonce-ascending.
    fn find_unconfirmed_txs(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Vec<Tx>, TxStoreError>> + Send;

    /// Block at which the account's last purge attempt was included.
    fn purge_block_num(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<u64>, TxStoreError>> + Send;

    /// A purge attempt was mined: store its receipt, mark the transaction
    /// fatally errored (attempts kept for audit) and record the purge
    /// height for rate limiting, as one unit.
    fn save_stuck_tx_purged(
        &self,
        tx_id: TxId,
        receipt: Receipt,
        error: String,
    ) -> impl Future<Output = Result<(), TxStoreError>> + Send;

    // ----- forced rebroadcast -----

    /// The transaction holding `nonce` for the account, if any.
    fn find_tx_by_nonce(
        &self,
        from: Address,
        nonce: u64,
    ) -> impl Future<Output = Result<Option<Tx>, TxStoreError>> + Send;
}
