use alloy::primitives::{Address, B256, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use txm_core::{chain::MinedReceipt, error::TxmError, fee::Fee};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery lifecycle of a managed transaction.
///
/// `FatalError` and `Finalized` are terminal. `Confirmed` can move back to
/// `Unconfirmed` when a re-org orphans its receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    /// Queued, no nonce assigned yet.
    Unstarted,
    /// Nonce assigned, broadcast not yet acknowledged. At most one per
    /// account at any time.
    InProgress,
    /// Broadcast accepted (or possibly accepted), awaiting a receipt.
    Unconfirmed,
    /// A receipt was seen in a past cycle but the node no longer returns
    /// one, and the chain's mined nonce is past this transaction.
    ConfirmedMissingReceipt,
    /// Receipt in hand on the canonical chain.
    Confirmed,
    /// Rejected with no possibility of inclusion, or purged as stuck.
    FatalError,
    /// Confirmed below the finalized height. Never revisited.
    Finalized,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::FatalError | TxState::Finalized)
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Unconfirmed => "unconfirmed",
            TxState::ConfirmedMissingReceipt => "confirmed_missing_receipt",
            TxState::Confirmed => "confirmed",
            TxState::FatalError => "fatal_error",
            TxState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxAttemptState {
    /// Signed but the broadcast outcome is not yet settled.
    InProgress,
    /// Accepted by the node (or indistinguishable from accepted).
    Broadcast,
    /// Rejected for lack of funds; kept for resubmission once the account
    /// is topped up.
    InsufficientFunds,
}

impl std::fmt::Display for TxAttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxAttemptState::InProgress => "in_progress",
            TxAttemptState::Broadcast => "broadcast",
            TxAttemptState::InsufficientFunds => "insufficient_funds",
        };
        f.write_str(s)
    }
}

/// One signed candidate for a transaction. Attempts for the same transaction
/// share a nonce and differ only in fee (and, for purge attempts, payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAttempt {
    pub id: AttemptId,
    pub tx_id: TxId,
    pub fee: Fee,
    /// RLP-encoded signed transaction, resent verbatim.
    pub signed_payload: Bytes,
    pub hash: B256,
    pub state: TxAttemptState,
    /// Highest block number at which this attempt was known to already be
    /// broadcast. Baseline for bump-age checks.
    pub broadcast_before_block_num: Option<u64>,
    /// Purge attempts replace the original payload with a self-send to burn
    /// the nonce of a terminally stuck transaction.
    pub is_purge_attempt: bool,
    pub created_at: DateTime<Utc>,
}

/// Mined receipt retained for a confirmed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub status: bool,
    /// Filled best-effort for reverted receipts via a diagnostic call.
    pub revert_reason: Option<String>,
}

impl Receipt {
    /// `None` when the node returned a receipt without inclusion data, which
    /// some nodes do for transactions still in their mempool.
    pub fn from_mined(mined: &MinedReceipt) -> Option<Self> {
        match (mined.block_hash, mined.block_number, mined.transaction_index) {
            (Some(block_hash), Some(block_number), Some(transaction_index)) => Some(Receipt {
                tx_hash: mined.tx_hash,
                block_hash,
                block_number,
                transaction_index,
                status: mined.status,
                revert_reason: None,
            }),
            _ => None,
        }
    }
}

/// A managed transaction with its attempts, newest attempt first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tx {
    pub id: TxId,
    pub idempotency_key: Option<String>,
    pub from: Address,
    pub to: Option<Address>,
    pub encoded_payload: Bytes,
    pub value: U256,
    /// Gas limit. The payload is taken as pre-validated; no estimation.
    pub fee_limit: u64,
    pub nonce: Option<u64>,
    pub state: TxState,
    pub attempts: Vec<TxAttempt>,
    /// Mined receipt of the newest confirmed attempt, if any.
    pub receipt: Option<Receipt>,
    pub meta: Option<serde_json::Value>,
    /// Terminal failure reason when `state` is `FatalError`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Refreshed on every broadcast and resend.
    pub broadcast_at: Option<DateTime<Utc>>,
    /// Set once, on the first broadcast. Basis for age alerts.
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub min_confirmations: u64,
    pub signal_callback: bool,
    pub callback_completed: bool,
}

impl Tx {
    /// Newest attempt regardless of state.
    pub fn current_attempt(&self) -> Option<&TxAttempt> {
        self.attempts.first()
    }

    pub fn attempt_hashes(&self) -> Vec<B256> {
        self.attempts.iter().map(|a| a.hash).collect()
    }

    pub fn has_purge_attempt(&self) -> bool {
        self.attempts.iter().any(|a| a.is_purge_attempt)
    }
}

/// Receives exactly-once completion signals for transactions created with
/// `signal_callback`. A failed resume is retried on the next head, so
/// implementations must report an unknown or already-resumed id as success
/// rather than an error.
pub trait CompletionHandler: Send + Sync {
    fn resume(
        &self,
        id: TxId,
        receipt: Option<Receipt>,
        error: Option<String>,
    ) -> impl std::future::Future<Output = Result<(), TxmError>> + Send;
}

/// Discards completion signals. For deployments that poll the store instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompletionHandler;

impl CompletionHandler for NoopCompletionHandler {
    async fn resume(
        &self,
        _id: TxId,
        _receipt: Option<Receipt>,
        _error: Option<String>,
    ) -> Result<(), TxmError> {
        Ok(())
    }
}
