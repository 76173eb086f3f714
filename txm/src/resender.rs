use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use alloy::primitives::Address;
use chrono::{Duration, Utc};
use txm_core::chain::Chain;

use crate::{
    alerts::AlertSink,
    config::TxmConfig,
    error::WorkerError,
    error_classifier::{SendContext, classify_send_error},
    store::TxStore,
    types::{Tx, TxAttemptState},
};

/// Timer-driven safety net that re-submits stalled payloads verbatim.
///
/// Nodes drop pending transactions (restarts, mempool eviction, peering
/// trouble), and a dropped payload can never confirm however long we wait.
/// The resender keeps at-least-once delivery going independently of head
/// arrival; it never touches fees, which belong to the confirmer alone.
pub struct Resender<C, St, A>
where
    C: Chain,
    St: TxStore,
    A: AlertSink,
{
    accounts: Vec<Address>,
    chain: Arc<C>,
    store: Arc<St>,
    alerts: Arc<A>,
    config: TxmConfig,
    last_alert: Mutex<HashMap<Address, Instant>>,
}

impl<C, St, A> Resender<C, St, A>
where
    C: Chain,
    St: TxStore,
    A: AlertSink,
{
    pub fn new(
        accounts: Vec<Address>,
        chain: Arc<C>,
        store: Arc<St>,
        alerts: Arc<A>,
        config: TxmConfig,
    ) -> Self {
        Self {
            accounts,
            chain,
            store,
            alerts,
            config,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<(), WorkerError> {
        let period = self.config.transactions.resend_after;
        if period.is_zero() {
            tracing::info!("Resender disabled by configuration");
            return Ok(());
        }

        tracing::info!(period_secs = period.as_secs(), "Resender started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Resender shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }
            if let Err(error) = self.resend_stalled().await {
                tracing::error!(error = %error, "Resend sweep failed");
            }
        }
    }

    /// One sweep over every account.
    #[tracing::instrument(skip_all)]
    pub async fn resend_stalled(&self) -> Result<(), WorkerError> {
        let threshold = Duration::seconds(self.config.transactions.resend_after.as_secs() as i64);
        let older_than = Utc::now() - threshold;

        for account in &self.accounts {
            self.resend_for_account(*account, older_than, threshold).await?;
        }
        Ok(())
    }

    async fn resend_for_account(
        &self,
        account: Address,
        older_than: chrono::DateTime<Utc>,
        threshold: Duration,
    ) -> Result<(), WorkerError> {
        let txs = self
            .store
            .find_txs_requiring_resend(account, older_than, self.config.transactions.max_in_flight)
            .await?;
        if txs.is_empty() {
            return Ok(());
        }

        self.alert_oldest_stalled(account, &txs, threshold);

        let mut rejected = 0usize;
        for batch in txs.chunks(self.config.confirmer.rpc_batch_size.max(1)) {
            let sends = batch.iter().filter_map(|tx| {
                // Highest-fee attempt that actually made it onto the wire.
                let attempt = tx.attempts.iter().find(|a| a.state == TxAttemptState::Broadcast)?;
                Some(async move {
                    (tx, self.chain.send_raw_transaction(&attempt.signed_payload).await)
                })
            });
            for (tx, result) in futures::future::join_all(sends).await {
                if let Err(error) = result {
                    let outcome = classify_send_error(&error, SendContext::Rebroadcast);
                    if !outcome.is_success() {
                        // Individual rejections do not block the sweep; the
                        // confirmer owns every corrective action.
                        tracing::warn!(
                            tx_id = %tx.id,
                            nonce = ?tx.nonce,
                            outcome = ?outcome,
                            error = %error,
                            "Resend rejected"
                        );
                        rejected += 1;
                    }
                }
            }
        }

        // Refreshed for every swept transaction, including rejected ones,
        // so one bad payload cannot pin every sweep onto itself.
        let ids: Vec<_> = txs.iter().map(|tx| tx.id).collect();
        self.store.update_broadcast_ats(&ids, Utc::now()).await?;

        tracing::info!(
            account = %account,
            resent = txs.len(),
            rejected = rejected,
            "Re-sent stalled transactions"
        );
        Ok(())
    }

    /// Warns about the single oldest stalled transaction once it has been
    /// waiting more than twice the resend threshold, at most once per alert
    /// interval per account. Age is measured from the first broadcast;
    /// resends deliberately do not reset it.
    fn alert_oldest_stalled(&self, account: Address, txs: &[Tx], threshold: Duration) {
        let Some(oldest) = txs
            .iter()
            .filter(|tx| tx.initial_broadcast_at.is_some())
            .min_by_key(|tx| tx.initial_broadcast_at)
        else {
            return;
        };
        let Some(first_broadcast) = oldest.initial_broadcast_at else {
            return;
        };
        let age = Utc::now().signed_duration_since(first_broadcast);
        if age <= threshold * 2 {
            return;
        }

        let interval = self.config.confirmer.unconfirmed_alert_after;
        let mut last_alert = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
        let due = last_alert
            .get(&account)
            .is_none_or(|at| at.elapsed() >= interval);
        if !due {
            return;
        }
        last_alert.insert(account, Instant::now());
        drop(last_alert);

        self.alerts.stuck_unconfirmed(account, oldest.id, age);
    }
}
