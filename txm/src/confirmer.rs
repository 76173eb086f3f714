use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Instant,
};

use alloy::primitives::{Address, B256};
use chrono::Utc;
use txm_core::{
    chain::{Chain, RevertCheck},
    fee::FeeEstimator,
    signer::TxSigner,
};

use crate::{
    alerts::AlertSink,
    attempt_builder::{AttemptBuilder, BuildError},
    config::TxmConfig,
    error::WorkerError,
    error_classifier::{SendContext, SendOutcome, classify_send_error},
    head::{Head, SingleSlot},
    store::TxStore,
    stuck_detector::{DiscardedTxCheck, NeverDiscarded, StuckDetector, TERMINALLY_STUCK_ERROR},
    types::{CompletionHandler, Receipt, Tx, TxAttempt, TxAttemptState, TxState},
};

/// Recorded as the fatal error of a transaction confirmed by nonce whose
/// receipt never surfaced inside the finality window.
pub const RECEIPT_MISSING_ERROR: &str =
    "no receipt observed for any attempt within the finality window";

/// Consecutive short head deliveries tolerated before warning that re-org
/// protection is degraded.
const SHORT_CHAIN_WARN_AFTER: u32 = 10;

/// Head-driven worker that settles everything after broadcast: receipt
/// fetching, fee escalation, re-org repair, stuck-nonce purges and caller
/// resumption.
///
/// Heads are processed serially; a second concurrent pass would corrupt the
/// bump bookkeeping. Within a pass, the per-account steps fan out and join.
pub struct Confirmer<C, St, S, E, A, H, D = NeverDiscarded>
where
    C: Chain,
    St: TxStore,
    S: TxSigner,
    E: FeeEstimator,
    A: AlertSink,
    H: CompletionHandler,
    D: DiscardedTxCheck,
{
    accounts: Vec<Address>,
    chain: Arc<C>,
    store: Arc<St>,
    builder: Arc<AttemptBuilder<S, E>>,
    detector: StuckDetector<E, D>,
    alerts: Arc<A>,
    callbacks: Arc<H>,
    config: TxmConfig,
    heads: Arc<SingleSlot<Head>>,
    short_chain_streak: AtomicU32,
}

impl<C, St, S, E, A, H, D> Confirmer<C, St, S, E, A, H, D>
where
    C: Chain,
    St: TxStore,
    S: TxSigner,
    E: FeeEstimator,
    A: AlertSink,
    H: CompletionHandler,
    D: DiscardedTxCheck,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Vec<Address>,
        chain: Arc<C>,
        store: Arc<St>,
        builder: Arc<AttemptBuilder<S, E>>,
        detector: StuckDetector<E, D>,
        alerts: Arc<A>,
        callbacks: Arc<H>,
        config: TxmConfig,
        heads: Arc<SingleSlot<Head>>,
    ) -> Self {
        Self {
            accounts,
            chain,
            store,
            builder,
            detector,
            alerts,
            callbacks,
            config,
            heads,
            short_chain_streak: AtomicU32::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<(), WorkerError> {
        tracing::info!("Confirmer started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Confirmer shutting down");
                    return Ok(());
                }
                _ = self.heads.notified() => {}
            }
            let Some(head) = self.heads.take() else {
                continue;
            };

            let deadline = self.config.confirmer.process_head_timeout;
            match tokio::time::timeout(deadline, self.process_head(&head)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(head = head.number, error = %error, "Head processing failed");
                }
                Err(_) => {
                    tracing::error!(
                        head = head.number,
                        timeout_secs = deadline.as_secs(),
                        "Head processing timed out, next head will retry"
                    );
                }
            }
        }
    }

    /// One full confirmation pass. Step order matters: receipts must be
    /// fetched before bump decisions, and re-org repair must see the
    /// receipts saved by this very pass.
    #[tracing::instrument(skip_all, fields(head = head.number))]
    pub async fn process_head(&self, head: &Head) -> Result<(), WorkerError> {
        let started = Instant::now();

        self.store.stamp_broadcast_before_block_num(head.number).await?;
        self.resubmit_missing_receipt_txs().await?;
        self.fetch_receipts(head).await?;
        self.rebroadcast_where_necessary(head).await?;
        self.repair_reorgs(head).await?;
        self.resume_waiters(head).await?;

        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Head processed"
        );
        Ok(())
    }

    /// Keeps confirmed-missing-receipt payloads alive on the network until
    /// their receipts surface. A node that answers anything other than
    /// already-known no longer has the transaction mined, so the belief was
    /// stale and the transaction re-enters the bump cycle.
    async fn resubmit_missing_receipt_txs(&self) -> Result<(), WorkerError> {
        let txs = self.store.find_confirmed_missing_receipt_txs().await?;
        if txs.is_empty() {
            return Ok(());
        }

        let mut demote = Vec::new();
        for batch in txs.chunks(self.config.confirmer.rpc_batch_size.max(1)) {
            let sends = batch.iter().filter_map(|tx| {
                tx.current_attempt().map(|attempt| async move {
                    (tx, self.chain.send_raw_transaction(&attempt.signed_payload).await)
                })
            });
            for (tx, result) in futures::future::join_all(sends).await {
                let outcome = match result {
                    Ok(_) => SendOutcome::Successful,
                    Err(error) => classify_send_error(&error, SendContext::Rebroadcast),
                };
                if outcome != SendOutcome::AlreadyKnown {
                    tracing::warn!(
                        tx_id = %tx.id,
                        nonce = ?tx.nonce,
                        outcome = ?outcome,
                        "Node no longer has this transaction mined, demoting to unconfirmed"
                    );
                    demote.push(tx.id);
                }
            }
        }
        if !demote.is_empty() {
            self.store.update_txs_unconfirmed(&demote).await?;
        }
        Ok(())
    }

    /// Fetches receipts for attempts that can plausibly have one, saves
    /// them, then settles the by-nonce bookkeeping: transactions below the
    /// account's highest confirmed nonce without a receipt become
    /// confirmed-missing-receipt, and ones stuck there past the finality
    /// window become fatal.
    async fn fetch_receipts(&self, head: &Head) -> Result<(), WorkerError> {
        let txs = self.store.find_txs_requiring_receipt_fetch().await?;

        let mut by_account: HashMap<Address, Vec<&Tx>> = HashMap::new();
        for tx in &txs {
            by_account.entry(tx.from).or_default().push(tx);
        }

        for (account, txs) in by_account {
            // The mined count trims the candidate set to nonces that can
            // already have receipts. Purely an optimization: on lookup
            // failure every attempt is checked instead.
            let mined_count = match self.chain.mined_nonce(account).await {
                Ok(count) => count,
                Err(error) => {
                    tracing::warn!(
                        account = %account,
                        error = %error,
                        "Mined nonce lookup failed, checking every attempt"
                    );
                    u64::MAX
                }
            };

            let mut tx_by_hash: HashMap<B256, &Tx> = HashMap::new();
            let mut hashes = Vec::new();
            for tx in txs {
                if !tx.nonce.is_some_and(|nonce| nonce < mined_count) {
                    continue;
                }
                for hash in tx.attempt_hashes() {
                    tx_by_hash.insert(hash, tx);
                    hashes.push(hash);
                }
            }

            let mut receipts = Vec::new();
            let mut purged = Vec::new();
            for chunk in hashes.chunks(self.config.confirmer.rpc_batch_size.max(1)) {
                let results = self.chain.fetch_receipts(chunk).await?;
                for (hash, result) in chunk.iter().zip(results) {
                    let mined = match result {
                        Ok(Some(mined)) => mined,
                        Ok(None) => continue,
                        Err(error) => {
                            tracing::warn!(tx_hash = %hash, error = %error, "Receipt fetch failed for attempt");
                            continue;
                        }
                    };
                    if mined.tx_hash != *hash {
                        tracing::error!(
                            requested = %hash,
                            returned = %mined.tx_hash,
                            "Node returned a receipt for a different transaction hash"
                        );
                        continue;
                    }
                    let Some(mut receipt) = Receipt::from_mined(&mined) else {
                        tracing::debug!(tx_hash = %hash, "Receipt has no block yet, treating as pending");
                        continue;
                    };
                    let Some(tx) = tx_by_hash.get(hash) else {
                        continue;
                    };

                    if !receipt.status {
                        receipt.revert_reason = self.lookup_revert_reason(tx, &receipt).await;
                        tracing::warn!(
                            tx_id = %tx.id,
                            tx_hash = %hash,
                            block = receipt.block_number,
                            reason = ?receipt.revert_reason,
                            "Transaction reverted on-chain"
                        );
                    }

                    let matched_purge = tx
                        .attempts
                        .iter()
                        .any(|a| a.hash == receipt.tx_hash && a.is_purge_attempt);
                    if matched_purge {
                        purged.push(((*tx).clone(), receipt));
                    } else {
                        receipts.push(receipt);
                    }
                }
            }

            if !receipts.is_empty() {
                tracing::info!(account = %account, count = receipts.len(), "Saving fetched receipts");
                self.store.save_fetched_receipts(&receipts).await?;
            }
            for (tx, receipt) in purged {
                let nonce = tx.nonce.unwrap_or_default();
                tracing::warn!(
                    tx_id = %tx.id,
                    nonce = nonce,
                    block = receipt.block_number,
                    "Purge replacement mined, abandoning original transaction"
                );
                self.store
                    .save_stuck_tx_purged(tx.id, receipt, TERMINALLY_STUCK_ERROR.to_string())
                    .await?;
                self.alerts.tx_purged(account, tx.id, nonce);
            }
        }

        let newly_missing = self.store.mark_confirmed_missing_receipt().await?;
        if !newly_missing.is_empty() {
            tracing::warn!(
                count = newly_missing.len(),
                "Transactions confirmed by nonce but their receipts were not found"
            );
        }

        let cutoff = head.number.saturating_sub(self.config.confirmer.finality_depth);
        let abandoned = self
            .store
            .mark_old_txs_missing_receipt_errored(cutoff, RECEIPT_MISSING_ERROR.to_string())
            .await?;
        for tx in abandoned {
            tracing::error!(
                tx_id = %tx.id,
                account = %tx.from,
                nonce = ?tx.nonce,
                attempts = tx.attempts.len(),
                "Transaction confirmed by nonce but no receipt was ever fetched. An external \
                 wallet may have sent a transaction from this account. The nonce is treated \
                 as spent and the transaction abandoned"
            );
        }
        Ok(())
    }

    /// Best-effort replay of a reverted call at its inclusion block.
    async fn lookup_revert_reason(&self, tx: &Tx, receipt: &Receipt) -> Option<String> {
        let check = RevertCheck {
            from: tx.from,
            to: tx.to,
            data: tx.encoded_payload.clone(),
            value: tx.value,
            gas_limit: tx.fee_limit,
            block_number: receipt.block_number,
        };
        self.chain.revert_reason(&check).await
    }

    /// Per-account concurrently: finish interrupted attempts, purge the
    /// stuck queue blocker when warranted, then build and submit bump
    /// replacements for attempts that sat unincluded too long.
    async fn rebroadcast_where_necessary(&self, head: &Head) -> Result<(), WorkerError> {
        let passes = self
            .accounts
            .iter()
            .map(|account| self.rebroadcast_for_account(*account, head));
        let mut first_error = None;
        for (account, result) in self.accounts.iter().zip(futures::future::join_all(passes).await) {
            if let Err(error) = result {
                tracing::error!(account = %account, error = %error, "Rebroadcast pass failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn rebroadcast_for_account(&self, account: Address, head: &Head) -> Result<(), WorkerError> {
        for tx in self.store.find_txs_with_in_progress_attempts(account).await? {
            let Some(attempt) = tx
                .attempts
                .iter()
                .find(|a| a.state == TxAttemptState::InProgress)
                .cloned()
            else {
                continue;
            };
            self.submit_attempt(&tx, attempt).await?;
        }

        if self.detector.enabled() {
            self.purge_stuck_blocker(account, head).await?;
        }

        let fees = &self.config.fee;
        let mut candidates = self
            .store
            .find_txs_requiring_rebroadcast(account, head.number, fees.bump_threshold, fees.bump_tx_depth)
            .await?;
        let max_in_flight = self.config.transactions.max_in_flight as usize;
        if max_in_flight > 0 && candidates.len() > max_in_flight {
            tracing::warn!(
                account = %account,
                candidates = candidates.len(),
                max_in_flight = max_in_flight,
                "More transactions require rebroadcast than the in-flight cap, deferring the rest"
            );
            candidates.truncate(max_in_flight);
        }
        for tx in candidates {
            self.rebroadcast_tx(tx, head).await?;
        }
        Ok(())
    }

    /// Replaces the account's terminally stuck queue blocker with a
    /// zero-value self-send at the same nonce.
    async fn purge_stuck_blocker(&self, account: Address, head: &Head) -> Result<(), WorkerError> {
        let unconfirmed = self.store.find_unconfirmed_txs(account).await?;
        let last_purge = self.store.purge_block_num(account).await?;
        let Some(stuck) = self.detector.detect(head.number, &unconfirmed, last_purge).await? else {
            return Ok(());
        };
        let Some(nonce) = stuck.nonce else {
            self.alerts.invariant_violation(
                account,
                &format!("unconfirmed transaction {} has no nonce", stuck.id),
            );
            return Ok(());
        };

        let attempt = match self.builder.build_purge(&stuck, nonce).await {
            Ok(attempt) => attempt,
            Err(error @ BuildError::BumpCeiling { .. }) => {
                tracing::warn!(tx_id = %stuck.id, error = %error, "Cannot price a purge above the stuck attempt");
                self.alerts
                    .fee_ceiling_reached(account, stuck.id, self.builder.fee_ceiling(account));
                return Ok(());
            }
            Err(error) => {
                tracing::warn!(tx_id = %stuck.id, error = %error, "Failed to build purge attempt, will retry");
                return Ok(());
            }
        };

        tracing::warn!(
            tx_id = %stuck.id,
            nonce = nonce,
            fee = %attempt.fee,
            "Transaction looks terminally stuck, submitting a nonce purge"
        );
        self.store.save_in_progress_attempt(&attempt).await?;
        self.submit_attempt(&stuck, attempt).await
    }

    /// One bump-or-retry decision for a rebroadcast candidate.
    async fn rebroadcast_tx(&self, tx: Tx, _head: &Head) -> Result<(), WorkerError> {
        let Some(nonce) = tx.nonce else {
            self.alerts.invariant_violation(
                tx.from,
                &format!("unconfirmed transaction {} has no nonce", tx.id),
            );
            return Ok(());
        };

        match tx.current_attempt().cloned() {
            // Insufficient-funds retry: same payload, same price. Bumping
            // would only dig the hole deeper.
            Some(attempt) if attempt.state == TxAttemptState::InsufficientFunds => {
                self.submit_attempt(&tx, attempt).await
            }
            Some(_) => {
                let replacement = match self.builder.build_bumped(&tx, nonce).await {
                    Ok(replacement) => replacement,
                    Err(error @ BuildError::BumpCeiling { .. }) => {
                        tracing::warn!(
                            tx_id = %tx.id,
                            nonce = nonce,
                            error = %error,
                            "Cannot bump past the configured ceiling, resubmitting the previous attempt"
                        );
                        self.alerts
                            .fee_ceiling_reached(tx.from, tx.id, self.builder.fee_ceiling(tx.from));
                        return self.keep_alive_previous(&tx).await;
                    }
                    Err(error) => {
                        tracing::warn!(tx_id = %tx.id, error = %error, "Failed to build bump replacement, will retry");
                        return Ok(());
                    }
                };
                tracing::info!(
                    tx_id = %tx.id,
                    nonce = nonce,
                    fee = %replacement.fee,
                    "Bumping fee for transaction stuck past the bump threshold"
                );
                self.store.save_in_progress_attempt(&replacement).await?;
                self.submit_attempt(&tx, replacement).await
            }
            // Unconfirmed with no attempts cannot happen through the normal
            // pipeline; repaired with a freshly built first attempt.
            None => {
                self.alerts.invariant_violation(
                    tx.from,
                    &format!("unconfirmed transaction {} has no attempts", tx.id),
                );
                let fee = match self.builder.quote_fee(tx.from).await {
                    Ok(fee) => fee,
                    Err(error) => {
                        tracing::warn!(tx_id = %tx.id, error = %error, "Fee quote failed, will retry");
                        return Ok(());
                    }
                };
                let attempt = match self.builder.build(&tx, nonce, fee).await {
                    Ok(attempt) => attempt,
                    Err(error) => {
                        tracing::error!(tx_id = %tx.id, error = %error, "Failed to repair attempt-less transaction");
                        return Ok(());
                    }
                };
                self.store.save_in_progress_attempt(&attempt).await?;
                self.submit_attempt(&tx, attempt).await
            }
        }
    }

    /// Resubmits the newest broadcast attempt verbatim so the transaction
    /// stays in mempools while bumping is stalled.
    async fn keep_alive_previous(&self, tx: &Tx) -> Result<(), WorkerError> {
        let Some(previous) = tx
            .attempts
            .iter()
            .find(|a| a.state == TxAttemptState::Broadcast)
        else {
            return Ok(());
        };
        match self.chain.send_raw_transaction(&previous.signed_payload).await {
            Ok(_) => {
                self.store.save_sent_attempt(previous.id, Utc::now()).await?;
            }
            Err(error) => {
                let outcome = classify_send_error(&error, SendContext::Rebroadcast);
                if outcome.is_success() {
                    self.store.save_sent_attempt(previous.id, Utc::now()).await?;
                } else {
                    tracing::warn!(tx_id = %tx.id, outcome = ?outcome, error = %error, "Keep-alive resubmission rejected");
                }
            }
        }
        Ok(())
    }

    /// Shared submission path for every attempt the confirmer puts on the
    /// wire: crash leftovers, bump replacements, purges, re-org repairs and
    /// insufficient-funds retries. Applies the classified outcome, bumping
    /// again in place while the node keeps reporting underpriced.
    async fn submit_attempt(&self, tx: &Tx, attempt: TxAttempt) -> Result<(), WorkerError> {
        let mut tx = tx.clone();
        let mut attempt = attempt;
        let Some(nonce) = tx.nonce else {
            return Err(WorkerError::InternalError {
                message: format!("transaction {} has an attempt but no nonce", tx.id),
            });
        };
        // Bumping reads the newest attempt off the transaction, so the local
        // view must lead with the one being submitted.
        tx.attempts.retain(|a| a.id != attempt.id);
        tx.attempts.insert(0, attempt.clone());

        loop {
            let (outcome, reject_reason) = match self
                .chain
                .send_raw_transaction(&attempt.signed_payload)
                .await
            {
                Ok(_) => (SendOutcome::Successful, None),
                Err(error) => {
                    let outcome = classify_send_error(&error, SendContext::Rebroadcast);
                    (outcome, Some(error.to_string()))
                }
            };

            match outcome {
                SendOutcome::Successful => {
                    self.store.save_sent_attempt(attempt.id, Utc::now()).await?;
                    return Ok(());
                }
                // The nonce is already mined; some attempt for it succeeded
                // earlier. Receipt fetching on the next head decides which.
                SendOutcome::AlreadyKnown => {
                    self.store
                        .save_confirmed_missing_receipt_attempt(attempt.id, Utc::now())
                        .await?;
                    return Ok(());
                }
                SendOutcome::Underpriced => {
                    let next = match self.builder.build_bumped(&tx, nonce).await {
                        Ok(next) => next,
                        Err(error @ BuildError::BumpCeiling { .. }) => {
                            tracing::warn!(
                                tx_id = %tx.id,
                                nonce = nonce,
                                error = %error,
                                "Node wants more than the configured ceiling allows, leaving attempt pending"
                            );
                            self.alerts.fee_ceiling_reached(
                                tx.from,
                                tx.id,
                                self.builder.fee_ceiling(tx.from),
                            );
                            return Ok(());
                        }
                        Err(error) => {
                            tracing::warn!(tx_id = %tx.id, error = %error, "Failed to bump underpriced attempt, will retry");
                            return Ok(());
                        }
                    };
                    self.store
                        .save_replacement_in_progress_attempt(attempt.id, &next)
                        .await?;
                    tx.attempts[0] = next.clone();
                    attempt = next;
                }
                SendOutcome::InsufficientFunds => {
                    self.store
                        .save_insufficient_funds_attempt(attempt.id, Utc::now())
                        .await?;
                    self.alerts.out_of_funds(tx.from, tx.id);
                    return Ok(());
                }
                SendOutcome::ExceedsMaxFee => {
                    tracing::warn!(
                        tx_id = %tx.id,
                        fee = %attempt.fee,
                        "Node rejected replacement above its own fee cap, falling back to the previous attempt"
                    );
                    self.drop_replacement(&attempt).await?;
                    return self.keep_alive_previous(&tx).await;
                }
                SendOutcome::Fatal => {
                    self.alerts.invariant_violation(
                        tx.from,
                        &format!(
                            "node permanently rejected re-signed attempt for {}: {}",
                            tx.id,
                            reject_reason.unwrap_or_else(|| "unknown reason".to_string())
                        ),
                    );
                    self.drop_replacement(&attempt).await?;
                    return Ok(());
                }
                SendOutcome::Unsupported => {
                    tracing::error!(
                        tx_id = %tx.id,
                        "Node no longer supports this transaction type, dropping the replacement"
                    );
                    self.drop_replacement(&attempt).await?;
                    return Ok(());
                }
                // Cannot tell whether the node took it; the attempt stays
                // in progress and the next head retries it.
                SendOutcome::Unknown => {
                    tracing::warn!(
                        tx_id = %tx.id,
                        error = ?reject_reason,
                        "Unclassifiable rebroadcast error, retrying next head"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Deletes a rejected in-progress replacement. Attempts in other states
    /// are already part of history and stay.
    async fn drop_replacement(&self, attempt: &TxAttempt) -> Result<(), WorkerError> {
        if attempt.state == TxAttemptState::InProgress {
            self.store.delete_in_progress_attempt(attempt.id).await?;
        }
        Ok(())
    }

    /// Walks the delivered ancestor chain and rebroadcasts confirmed
    /// transactions whose receipt block is no longer canonical.
    async fn repair_reorgs(&self, head: &Head) -> Result<(), WorkerError> {
        let window = head.chain_len();
        if window < self.config.confirmer.finality_depth {
            let streak = self.short_chain_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= SHORT_CHAIN_WARN_AFTER {
                tracing::warn!(
                    window = window,
                    finality_depth = self.config.confirmer.finality_depth,
                    streak = streak,
                    "Delivered head chains keep coming in shorter than the finality depth, re-org protection is degraded"
                );
            }
        } else {
            self.short_chain_streak.store(0, Ordering::Relaxed);
        }

        let earliest = head.earliest_in_chain().number;
        let confirmed = self
            .store
            .find_confirmed_txs_in_block_range(earliest, head.number)
            .await?;

        let mut repaired: HashMap<Address, Vec<(Tx, TxAttempt)>> = HashMap::new();
        for tx in confirmed {
            let Some(receipt) = tx.receipt.clone() else {
                continue;
            };
            let canonical = match head.hash_at_height(receipt.block_number) {
                Some(hash) => hash,
                None => continue,
            };
            if canonical == receipt.block_hash {
                continue;
            }

            tracing::error!(
                tx_id = %tx.id,
                nonce = ?tx.nonce,
                block = receipt.block_number,
                receipt_block_hash = %receipt.block_hash,
                canonical_hash = %canonical,
                "Re-org detected, receipt block is no longer canonical, rebroadcasting transaction"
            );
            // Newest attempt carries the highest fee; that is the one worth
            // racing the new chain with.
            let Some(attempt) = tx.current_attempt().cloned() else {
                self.alerts.invariant_violation(
                    tx.from,
                    &format!("confirmed transaction {} has no attempts", tx.id),
                );
                continue;
            };
            self.store.update_tx_for_rebroadcast(tx.id, attempt.id).await?;

            let mut tx = tx;
            tx.state = TxState::Unconfirmed;
            tx.receipt = None;
            let mut attempt = attempt;
            attempt.state = TxAttemptState::InProgress;
            attempt.broadcast_before_block_num = None;
            repaired.entry(tx.from).or_default().push((tx, attempt));
        }

        let resubmits = repaired.into_values().map(|txs| async move {
            for (tx, attempt) in txs {
                if let Err(error) = self.submit_attempt(&tx, attempt).await {
                    tracing::error!(tx_id = %tx.id, error = %error, "Failed to rebroadcast re-orged transaction");
                }
            }
        });
        futures::future::join_all(resubmits).await;
        Ok(())
    }

    /// Resumes callers whose transactions reached enough confirmations or
    /// died. The completed flag keeps the signal exactly-once; a failed
    /// callback is simply retried on the next head.
    async fn resume_waiters(&self, head: &Head) -> Result<(), WorkerError> {
        for tx in self.store.find_txs_pending_callback(head.number).await? {
            let (receipt, error) = completion_signal(&tx);
            match self.callbacks.resume(tx.id, receipt, error).await {
                Ok(()) => self.store.mark_callback_completed(tx.id).await?,
                Err(error) => {
                    tracing::warn!(tx_id = %tx.id, error = %error, "Completion callback failed, will retry next head");
                }
            }
        }
        Ok(())
    }
}

/// What a waiting caller should be handed for a finished transaction.
fn completion_signal(tx: &Tx) -> (Option<Receipt>, Option<String>) {
    if tx.state == TxState::FatalError {
        let error = tx
            .error
            .clone()
            .unwrap_or_else(|| "transaction fatally errored".to_string());
        return (tx.receipt.clone(), Some(error));
    }
    let error = tx
        .receipt
        .as_ref()
        .filter(|receipt| !receipt.status)
        .and_then(|receipt| receipt.revert_reason.clone());
    (tx.receipt.clone(), error)
}
