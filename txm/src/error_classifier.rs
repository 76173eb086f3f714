use txm_core::error::{RpcErrorKind, TxmError};

/// Closed set of broadcast outcomes. Every arm has exactly one recovery
/// action at the call sites; nothing falls through to a generic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the node.
    Successful,
    /// The node already has this transaction (or it is already mined).
    /// Treated as success.
    AlreadyKnown,
    /// Priced below what the node will accept or replace. Bump and retry.
    Underpriced,
    /// Account cannot cover value + fee. Stop bumping, keep resubmitting at
    /// the same price, alert.
    InsufficientFunds,
    /// Above the node's transaction-fee cap. Fall back to the previous
    /// attempt.
    ExceedsMaxFee,
    /// Permanently rejected; retrying the same payload can never succeed.
    /// Attempts are validated before signing, so seeing this for one of our
    /// own attempts is an invariant violation.
    Fatal,
    /// The node does not support this transaction type.
    Unsupported,
    /// Unclassifiable. Resolved on the next cycle by comparing the
    /// network's pending nonce: advancement past this nonce means the send
    /// worked despite the error.
    Unknown,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Successful | SendOutcome::AlreadyKnown)
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SendContext {
    Rebroadcast,
    InitialBroadcast,
}

/// Maps nonce-too-low and duplicate-import messages. These mean the node has
/// (or had) the transaction, so the nonce must be treated as consumed.
fn is_already_known(message: &str) -> bool {
    message.contains("nonce too low")
        || message.contains("already known")
        || message.contains("transaction already imported")
        || message.contains("known transaction")
        || message.contains("already mined")
}

fn is_underpriced(message: &str) -> bool {
    message.contains("underpriced")
        || message.contains("gas price too low")
        || message.contains("fee cap less than block base fee")
        || message.contains("transaction gas price below minimum")
}

fn is_insufficient_funds(message: &str) -> bool {
    message.contains("insufficient funds")
        || message.contains("insufficient balance")
        || message.contains("not enough funds")
}

fn is_fee_cap_exceeded(message: &str) -> bool {
    message.contains("exceeds the configured cap")
}

fn is_unsupported(message: &str) -> bool {
    message.contains("transaction type not supported") || message.contains("method not found")
}

fn is_fatal(message: &str) -> bool {
    message.contains("invalid signature")
        || message.contains("invalid sender")
        || message.contains("invalid chain id")
        || message.contains("invalid transaction format")
        || message.contains("malformed")
        || message.contains("intrinsic gas too low")
        || message.contains("exceeds block gas limit")
        || message.contains("oversized")
        || message.contains("negative value")
        || message.contains("gas uint64 overflow")
        || message.contains("max priority fee per gas higher than max fee per gas")
}

#[tracing::instrument(skip_all, fields(error = %error, context = ?context))]
pub fn classify_send_error(error: &TxmError, context: SendContext) -> SendOutcome {
    if let TxmError::RpcError {
        kind: RpcErrorKind::UnsupportedFeature { .. },
        ..
    } = error
    {
        return SendOutcome::Unsupported;
    }

    let Some(resp) = error.rpc_error_response() else {
        // Transport failure or empty response. The payload may or may not
        // have reached the node; the pending-nonce check settles it next
        // cycle.
        return SendOutcome::Unknown;
    };

    let message = resp.message.to_lowercase();

    if is_already_known(&message) {
        return SendOutcome::AlreadyKnown;
    }
    if is_underpriced(&message) {
        return SendOutcome::Underpriced;
    }
    if is_insufficient_funds(&message) {
        return SendOutcome::InsufficientFunds;
    }
    if is_fee_cap_exceeded(&message) {
        return SendOutcome::ExceedsMaxFee;
    }
    if is_unsupported(&message) {
        return SendOutcome::Unsupported;
    }
    if is_fatal(&message) {
        return SendOutcome::Fatal;
    }

    if message.contains("nonce too high") {
        // The node sees a sequence gap. Our own assignment is gap-free, so
        // this settles once earlier sends land; meanwhile treat as unsettled.
        tracing::debug!("node reported a sequence gap, leaving outcome unsettled");
        return SendOutcome::Unknown;
    }

    tracing::warn!(
        "Unknown send error: {}. PLEASE REPORT FOR ADDING CORRECT CLASSIFICATION [NOTIFY]",
        message
    );

    SendOutcome::Unknown
}
