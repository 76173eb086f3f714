use std::sync::Arc;

use alloy::primitives::Address;
use chrono::Utc;
use tokio::sync::{Notify, oneshot};
use txm_core::{chain::Chain, fee::FeeEstimator, signer::TxSigner};

use crate::{
    alerts::AlertSink,
    attempt_builder::{AttemptBuilder, BuildError},
    config::TxConfig,
    error::WorkerError,
    error_classifier::{SendContext, SendOutcome, classify_send_error},
    nonce::NonceTracker,
    store::TxStore,
    types::{CompletionHandler, Tx, TxState},
};

/// Per-account broadcast worker.
///
/// Sole owner of nonce assignment for its account: at most one transaction
/// is in progress at a time, and the nonce counter only advances once the
/// broadcast outcome for that transaction is recorded. Everything else
/// (receipts, bumps, re-orgs) belongs to the confirmer.
pub struct Broadcaster<C, St, S, E, A, H>
where
    C: Chain,
    St: TxStore,
    S: TxSigner,
    E: FeeEstimator,
    A: AlertSink,
    H: CompletionHandler,
{
    account: Address,
    chain: Arc<C>,
    store: Arc<St>,
    builder: Arc<AttemptBuilder<S, E>>,
    nonces: NonceTracker<C, St>,
    alerts: Arc<A>,
    callbacks: Arc<H>,
    config: TxConfig,
    trigger: Notify,
}

impl<C, St, S, E, A, H> Broadcaster<C, St, S, E, A, H>
where
    C: Chain,
    St: TxStore,
    S: TxSigner,
    E: FeeEstimator,
    A: AlertSink,
    H: CompletionHandler,
{
    pub fn new(
        account: Address,
        chain: Arc<C>,
        store: Arc<St>,
        builder: Arc<AttemptBuilder<S, E>>,
        alerts: Arc<A>,
        callbacks: Arc<H>,
        config: TxConfig,
    ) -> Self {
        let nonces = NonceTracker::new(chain.clone(), store.clone());
        Self {
            account,
            chain,
            store,
            builder,
            nonces,
            alerts,
            callbacks,
            config,
            trigger: Notify::new(),
        }
    }

    /// Wakes the worker outside the polling cadence. A wake that lands
    /// mid-cycle is kept and starts the next cycle immediately.
    pub fn wake(&self) {
        self.trigger.notify_one();
    }

    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) -> Result<(), WorkerError> {
        if self.config.nonce_auto_sync {
            self.nonces.sync_on_startup(self.account).await?;
        }
        tracing::info!(account = %self.account, "Broadcaster started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(account = %self.account, "Broadcaster shutting down");
                    return Ok(());
                }
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.config.fallback_poll_interval) => {}
            }

            match tokio::time::timeout(self.config.cycle_timeout, self.process_queue()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(account = %self.account, error = %error, "Broadcast cycle failed");
                }
                Err(_) => {
                    tracing::error!(
                        account = %self.account,
                        timeout_secs = self.config.cycle_timeout.as_secs(),
                        "Broadcast cycle timed out"
                    );
                }
            }
        }
    }

    /// One full pass over the account's queue: finish whatever a previous
    /// run left in progress, then broadcast unstarted transactions in
    /// creation order until the queue drains, the in-flight cap is hit, or
    /// a transaction cannot be moved past.
    #[tracing::instrument(skip_all, fields(account = %self.account))]
    pub async fn process_queue(&self) -> Result<(), WorkerError> {
        if !self.resolve_in_progress().await? {
            return Ok(());
        }
        loop {
            if !self.ready_for_next().await? {
                return Ok(());
            }
            let Some(tx) = self.store.find_next_unstarted(self.account).await? else {
                return Ok(());
            };
            if !self.start_tx(tx).await? {
                return Ok(());
            }
        }
    }

    /// Settles the at-most-one in-progress transaction. Returns whether the
    /// account is clear to start the next one.
    ///
    /// A transaction can be left in progress by a crash between signing and
    /// recording the outcome, or by an unclassifiable send error. The
    /// network's pending nonce decides: if it moved past this nonce the
    /// earlier send actually worked and only the record is missing,
    /// otherwise the signed payload is broadcast again.
    async fn resolve_in_progress(&self) -> Result<bool, WorkerError> {
        let Some(tx) = self.store.find_in_progress_tx(self.account).await? else {
            return Ok(true);
        };

        let (Some(nonce), Some(attempt)) = (tx.nonce, tx.current_attempt()) else {
            self.alerts.invariant_violation(
                self.account,
                &format!("in-progress transaction {} has no nonce or attempt", tx.id),
            );
            self.fatalize(&tx, "in-progress transaction missing nonce or attempt".to_string())
                .await?;
            return Ok(true);
        };

        let pending = self.chain.pending_nonce(self.account).await?;
        if pending > nonce {
            tracing::info!(
                tx_id = %tx.id,
                nonce = nonce,
                pending_nonce = pending,
                "Previous broadcast assumed successful, recording it"
            );
            self.store.save_broadcast(tx.id, attempt.id, Utc::now()).await?;
            return Ok(true);
        }

        self.broadcast_attempt(&tx).await
    }

    /// Applies the in-flight cap. The throttle alert only fires when work
    /// is actually waiting behind it.
    async fn ready_for_next(&self) -> Result<bool, WorkerError> {
        if self.config.max_in_flight == 0 {
            return Ok(true);
        }
        let unconfirmed = self.store.count_unconfirmed(self.account).await?;
        if unconfirmed < u64::from(self.config.max_in_flight) {
            return Ok(true);
        }
        if self.store.count_unstarted(self.account).await? > 0 {
            self.alerts
                .broadcast_throttled(self.account, unconfirmed, self.config.max_in_flight);
        }
        Ok(false)
    }

    /// Assigns the next nonce, builds and signs the first attempt, and
    /// broadcasts it. Returns whether the queue can advance past this
    /// transaction.
    async fn start_tx(&self, mut tx: Tx) -> Result<bool, WorkerError> {
        let nonce = self.nonces.next(self.account).await?;

        let fee = match self.builder.quote_fee(self.account).await {
            Ok(fee) => fee,
            Err(error) => {
                tracing::warn!(account = %self.account, error = %error, "Fee quote failed, will retry");
                return Ok(false);
            }
        };

        let attempt = match self.builder.build(&tx, nonce, fee).await {
            Ok(attempt) => attempt,
            Err(error @ BuildError::FeeValidation { .. }) => {
                // Nothing was signed and the nonce stays free for the next
                // transaction.
                tracing::error!(tx_id = %tx.id, error = %error, "Rejecting transaction before broadcast");
                self.fatalize(&tx, error.to_string()).await?;
                return Ok(true);
            }
            Err(error) => {
                tracing::warn!(tx_id = %tx.id, error = %error, "Failed to build first attempt, will retry");
                return Ok(false);
            }
        };

        tx.nonce = Some(nonce);
        self.store.save_tx_in_progress(&tx, &attempt).await?;
        tx.state = TxState::InProgress;
        tx.attempts = vec![attempt];

        self.broadcast_attempt(&tx).await
    }

    /// Sends the transaction's newest attempt and applies the classified
    /// outcome, bumping in place while the node reports it underpriced.
    /// Returns whether the account is clear for the next transaction.
    async fn broadcast_attempt(&self, tx: &Tx) -> Result<bool, WorkerError> {
        let mut tx = tx.clone();
        let Some(nonce) = tx.nonce else {
            return Err(WorkerError::InternalError {
                message: format!("transaction {} in progress without a nonce", tx.id),
            });
        };

        loop {
            let Some(attempt) = tx.current_attempt().cloned() else {
                return Err(WorkerError::InternalError {
                    message: format!("transaction {} in progress without an attempt", tx.id),
                });
            };

            let (outcome, reject_reason) = match self
                .chain
                .send_raw_transaction(&attempt.signed_payload)
                .await
            {
                Ok(_) => (SendOutcome::Successful, None),
                Err(error) => {
                    let outcome = classify_send_error(&error, SendContext::InitialBroadcast);
                    if !outcome.is_success() {
                        tracing::warn!(
                            tx_id = %tx.id,
                            nonce = nonce,
                            outcome = ?outcome,
                            error = %error,
                            "Broadcast rejected"
                        );
                    }
                    (outcome, Some(error.to_string()))
                }
            };

            match outcome {
                SendOutcome::Successful | SendOutcome::AlreadyKnown => {
                    if tx.initial_broadcast_at.is_none() {
                        let queued = Utc::now().signed_duration_since(tx.created_at);
                        tracing::info!(
                            tx_id = %tx.id,
                            nonce = nonce,
                            fee = %attempt.fee,
                            queued_ms = queued.num_milliseconds(),
                            "Transaction broadcast"
                        );
                    }
                    self.store.save_broadcast(tx.id, attempt.id, Utc::now()).await?;
                    return Ok(true);
                }
                SendOutcome::Underpriced => {
                    let replacement = match self.builder.build_bumped(&tx, nonce).await {
                        Ok(replacement) => replacement,
                        Err(error @ BuildError::BumpCeiling { .. }) => {
                            tracing::error!(tx_id = %tx.id, error = %error, "Cannot outbid the network");
                            self.alerts.fee_ceiling_reached(
                                self.account,
                                tx.id,
                                self.builder.fee_ceiling(self.account),
                            );
                            return Ok(false);
                        }
                        Err(error) => {
                            tracing::warn!(tx_id = %tx.id, error = %error, "Failed to build replacement, will retry");
                            return Ok(false);
                        }
                    };
                    self.store
                        .save_replacement_in_progress_attempt(attempt.id, &replacement)
                        .await?;
                    tx.attempts[0] = replacement;
                }
                SendOutcome::InsufficientFunds => {
                    // Stays in progress and blocks the queue until the
                    // balance recovers.
                    self.alerts.out_of_funds(self.account, tx.id);
                    return Ok(false);
                }
                SendOutcome::ExceedsMaxFee => {
                    // Fees are validated before signing, so this means the
                    // node's cap is below our configured floor.
                    self.alerts.invariant_violation(
                        self.account,
                        &format!("validated attempt for {} exceeds the node's fee cap", tx.id),
                    );
                    self.fatalize(
                        &tx,
                        reject_reason
                            .unwrap_or_else(|| "transaction fee exceeds the node's cap".to_string()),
                    )
                    .await?;
                    return Ok(true);
                }
                SendOutcome::Fatal => {
                    self.alerts.invariant_violation(
                        self.account,
                        &format!("node permanently rejected signed attempt for {}", tx.id),
                    );
                    self.fatalize(
                        &tx,
                        reject_reason.unwrap_or_else(|| "permanently rejected by the node".to_string()),
                    )
                    .await?;
                    return Ok(true);
                }
                SendOutcome::Unsupported => {
                    self.fatalize(
                        &tx,
                        reject_reason
                            .unwrap_or_else(|| "transaction type not supported by the network".to_string()),
                    )
                    .await?;
                    return Ok(true);
                }
                SendOutcome::Unknown => {
                    // Cannot tell whether the node took it. Left in
                    // progress; the pending-nonce check settles it next
                    // cycle.
                    return Ok(false);
                }
            }
        }
    }

    /// Terminal failure before the nonce was consumed: record it, release
    /// the nonce and resume any waiting caller.
    async fn fatalize(&self, tx: &Tx, error: String) -> Result<(), WorkerError> {
        self.store.save_fatally_errored(tx.id, error.clone()).await?;
        self.resume_fatal(tx, error).await
    }

    /// Resumes a caller waiting on a transaction that died before
    /// confirmation. The completed flag in the store keeps the signal
    /// exactly-once even when the confirmer also scans for it.
    async fn resume_fatal(&self, tx: &Tx, error: String) -> Result<(), WorkerError> {
        if !tx.signal_callback {
            return Ok(());
        }
        if let Err(error) = self.callbacks.resume(tx.id, None, Some(error)).await {
            tracing::warn!(tx_id = %tx.id, error = %error, "Completion callback failed, confirmer will retry");
            return Ok(());
        }
        self.store.mark_callback_completed(tx.id).await?;
        Ok(())
    }
}
