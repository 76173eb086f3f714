use std::{collections::HashMap, ops::RangeInclusive, sync::Arc};

use alloy::primitives::{Address, B256, Bytes, U256};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use txm_core::{
    chain::Chain,
    error::TxmError,
    fee::{Fee, FeeEstimator},
    signer::TxSigner,
};

use crate::{
    alerts::AlertSink,
    attempt_builder::AttemptBuilder,
    broadcaster::Broadcaster,
    config::TxmConfig,
    confirmer::Confirmer,
    error::WorkerError,
    error_classifier::{SendContext, classify_send_error},
    finalizer::Finalizer,
    head::{Head, SingleSlot},
    resender::Resender,
    store::{TxStore, TxStoreError},
    stuck_detector::{DiscardedTxCheck, NeverDiscarded, StuckDetector},
    types::{CompletionHandler, Tx, TxId, TxState},
};

/// Handle for a single spawned worker that can be shut down gracefully.
pub struct WorkerHandle {
    pub name: String,
    pub join_handle: tokio::task::JoinHandle<Result<(), WorkerError>>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: impl Into<String>, run: impl FnOnce(oneshot::Receiver<()>) -> F) -> Self
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            name: name.into(),
            join_handle: tokio::spawn(run(shutdown_rx)),
            shutdown_tx,
        }
    }

    pub async fn shutdown(self) -> Result<(), WorkerError> {
        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = %self.name, "Worker was already shutting down");
        }
        match self.join_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                tracing::error!(worker = %self.name, error = %error, "Worker shut down with error");
                Err(error)
            }
            Err(join_error) => {
                tracing::error!(worker = %self.name, error = %join_error, "Worker task panicked during shutdown");
                Err(WorkerError::InternalError {
                    message: format!("worker {} panicked: {join_error}", self.name),
                })
            }
        }
    }
}

/// Coordinates shutdown of every worker in one delivery manager.
#[derive(Default)]
pub struct ShutdownHandle {
    workers: Vec<WorkerHandle>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker first, then joins them all, logging per-worker
    /// results. The first failure is returned after all workers finished.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        tracing::info!(workers = self.workers.len(), "Initiating graceful shutdown");

        let mut names = Vec::with_capacity(self.workers.len());
        let mut joins = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            if worker.shutdown_tx.send(()).is_err() {
                tracing::warn!(worker = %worker.name, "Worker was already shutting down");
            }
            names.push(worker.name);
            joins.push(worker.join_handle);
        }

        let mut first_error = None;
        for (name, result) in names.iter().zip(futures::future::join_all(joins).await) {
            match result {
                Ok(Ok(())) => {
                    tracing::debug!(worker = %name, "Worker shut down gracefully");
                }
                Ok(Err(error)) => {
                    tracing::error!(worker = %name, error = %error, "Worker shut down with error");
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    tracing::error!(worker = %name, error = %join_error, "Worker task panicked during shutdown");
                    first_error.get_or_insert(WorkerError::InternalError {
                        message: format!("worker {name} panicked: {join_error}"),
                    });
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => {
                tracing::info!("All workers shut down gracefully");
                Ok(())
            }
        }
    }
}

/// Caller-facing request for a new transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from: Address,
    /// `None` deploys a contract.
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    /// Gas limit applied to every attempt.
    pub fee_limit: u64,
    /// Duplicate-submission guard: a second request with the same key
    /// returns the first transaction instead of creating a new one.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Opaque caller context stored with the transaction.
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    /// Receipt depth before the completion callback fires. Defaults from
    /// configuration.
    #[serde(default)]
    pub min_confirmations: Option<u64>,
    #[serde(default)]
    pub signal_callback: bool,
}

/// The assembled delivery manager: one broadcaster per account plus the
/// confirmer, resender and finalizer, all sharing one store and chain
/// client. Construct it, call [`Txm::start`], feed it heads.
pub struct Txm<C, St, S, E, A, H, D = NeverDiscarded>
where
    C: Chain,
    St: TxStore,
    S: TxSigner,
    E: FeeEstimator,
    A: AlertSink,
    H: CompletionHandler,
    D: DiscardedTxCheck,
{
    chain: Arc<C>,
    store: Arc<St>,
    builder: Arc<AttemptBuilder<S, E>>,
    alerts: Arc<A>,
    config: TxmConfig,
    broadcasters: HashMap<Address, Arc<Broadcaster<C, St, S, E, A, H>>>,
    confirmer: Arc<Confirmer<C, St, S, E, A, H, D>>,
    resender: Arc<Resender<C, St, A>>,
    finalizer: Arc<Finalizer<C, St>>,
    heads: Arc<SingleSlot<Head>>,
    finalized_heads: Arc<SingleSlot<Head>>,
}

impl<C, St, S, E, A, H, D> Txm<C, St, S, E, A, H, D>
where
    C: Chain + 'static,
    St: TxStore + 'static,
    S: TxSigner + 'static,
    E: FeeEstimator + 'static,
    A: AlertSink + 'static,
    H: CompletionHandler + 'static,
    D: DiscardedTxCheck + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Vec<Address>,
        chain: Arc<C>,
        store: Arc<St>,
        signer: Arc<S>,
        estimator: Arc<E>,
        detector: StuckDetector<E, D>,
        alerts: Arc<A>,
        callbacks: Arc<H>,
        config: TxmConfig,
    ) -> Self {
        let builder = Arc::new(AttemptBuilder::new(
            signer,
            estimator,
            chain.chain_id(),
            config.fee.clone(),
        ));
        let heads = Arc::new(SingleSlot::new());
        let finalized_heads = Arc::new(SingleSlot::new());

        let broadcasters = accounts
            .iter()
            .map(|account| {
                let broadcaster = Broadcaster::new(
                    *account,
                    chain.clone(),
                    store.clone(),
                    builder.clone(),
                    alerts.clone(),
                    callbacks.clone(),
                    config.transactions.clone(),
                );
                (*account, Arc::new(broadcaster))
            })
            .collect();

        let confirmer = Arc::new(Confirmer::new(
            accounts.clone(),
            chain.clone(),
            store.clone(),
            builder.clone(),
            detector,
            alerts.clone(),
            callbacks.clone(),
            config.clone(),
            heads.clone(),
        ));
        let resender = Arc::new(Resender::new(
            accounts,
            chain.clone(),
            store.clone(),
            alerts.clone(),
            config.clone(),
        ));
        let finalizer = Arc::new(Finalizer::new(
            chain.clone(),
            store.clone(),
            config.clone(),
            finalized_heads.clone(),
        ));

        Self {
            chain,
            store,
            builder,
            alerts,
            config,
            broadcasters,
            confirmer,
            resender,
            finalizer,
            heads,
            finalized_heads,
        }
    }

    /// Validates the configuration and spawns every worker. The returned
    /// handle owns their lifetimes.
    pub fn start(&self) -> Result<ShutdownHandle, TxmError> {
        self.config.validate()?;

        let mut handle = ShutdownHandle::new();
        for (account, broadcaster) in &self.broadcasters {
            let broadcaster = broadcaster.clone();
            handle.add_worker(WorkerHandle::spawn(format!("broadcaster-{account}"), |rx| {
                broadcaster.run(rx)
            }));
        }
        let confirmer = self.confirmer.clone();
        handle.add_worker(WorkerHandle::spawn("confirmer", |rx| confirmer.run(rx)));
        let resender = self.resender.clone();
        handle.add_worker(WorkerHandle::spawn("resender", |rx| resender.run(rx)));
        let finalizer = self.finalizer.clone();
        handle.add_worker(WorkerHandle::spawn("finalizer", |rx| finalizer.run(rx)));

        tracing::info!(workers = handle.worker_count(), "Transaction delivery manager started");
        Ok(handle)
    }

    /// Queues a transaction for delivery and wakes its account's
    /// broadcaster. Returns the stored transaction, which is the existing
    /// one when the idempotency key was seen before.
    pub async fn create_transaction(&self, request: TxRequest) -> Result<Tx, TxmError> {
        if request.fee_limit == 0 {
            return Err(TxmError::ValidationError {
                message: "fee limit must be nonzero".to_string(),
            });
        }
        if !self.broadcasters.contains_key(&request.from) {
            return Err(TxmError::ValidationError {
                message: format!("account {} is not managed by this delivery manager", request.from),
            });
        }

        let max_queued = self.config.transactions.max_queued;
        if max_queued > 0 {
            let queued = self
                .store
                .count_unstarted(request.from)
                .await
                .map_err(store_error)?;
            if queued >= max_queued {
                self.alerts.queue_capacity(request.from, queued, max_queued);
                return Err(TxmError::ValidationError {
                    message: format!(
                        "cannot queue transaction for {}: {queued} already waiting (limit {max_queued})",
                        request.from
                    ),
                });
            }
        }

        let tx = Tx {
            id: TxId::new(),
            idempotency_key: request.idempotency_key,
            from: request.from,
            to: request.to,
            encoded_payload: request.data,
            value: request.value,
            fee_limit: request.fee_limit,
            nonce: None,
            state: TxState::Unstarted,
            attempts: Vec::new(),
            receipt: None,
            meta: request.meta,
            error: None,
            created_at: Utc::now(),
            broadcast_at: None,
            initial_broadcast_at: None,
            min_confirmations: request
                .min_confirmations
                .unwrap_or(self.config.confirmer.min_confirmations_default),
            signal_callback: request.signal_callback,
            callback_completed: false,
        };
        let stored = self.store.insert_tx(tx).await.map_err(store_error)?;

        tracing::debug!(tx_id = %stored.id, account = %stored.from, "Transaction queued");
        self.trigger(stored.from);
        Ok(stored)
    }

    /// Hands a new chain head to the confirmer. A head that arrives while
    /// the previous one is still unprocessed replaces it.
    pub fn on_head(&self, head: Head) {
        let number = head.number;
        if self.heads.deliver(head) {
            tracing::debug!(head = number, "Superseded an unprocessed head");
        }
    }

    /// Hands a finalized-height notification to the finalizer.
    pub fn on_finalized_head(&self, head: Head) {
        let number = head.number;
        if self.finalized_heads.deliver(head) {
            tracing::debug!(finalized = number, "Superseded an unprocessed finalized head");
        }
    }

    /// Wakes an account's broadcaster outside the polling cadence.
    pub fn trigger(&self, account: Address) {
        match self.broadcasters.get(&account) {
            Some(broadcaster) => broadcaster.wake(),
            None => {
                tracing::warn!(account = %account, "No broadcaster for account, trigger ignored");
            }
        }
    }

    /// Operator override: re-sends every nonce in the range at exactly the
    /// given fee, bypassing ceiling checks, with a zero-value self-send for
    /// any nonce hole. Nothing is persisted; the regular pipeline keeps
    /// tracking the original transactions. Returns the hashes that reached
    /// the node.
    pub async fn force_rebroadcast(
        &self,
        account: Address,
        nonces: RangeInclusive<u64>,
        fee: Fee,
        gas_limit: Option<u64>,
    ) -> Result<Vec<B256>, TxmError> {
        tracing::warn!(
            account = %account,
            start = *nonces.start(),
            end = *nonces.end(),
            fee = %fee,
            "Force-rebroadcast requested, overriding fees for the whole nonce range"
        );

        let mut sent = Vec::new();
        for nonce in nonces {
            let existing = self
                .store
                .find_tx_by_nonce(account, nonce)
                .await
                .map_err(store_error)?;
            if existing.is_none() {
                tracing::warn!(account = %account, nonce = nonce, "No transaction at nonce, sending a zero-value self-send");
            }

            let (hash, raw) = self
                .builder
                .build_forced(
                    account,
                    nonce,
                    fee,
                    gas_limit.unwrap_or_else(|| existing.as_ref().map_or(21_000, |tx| tx.fee_limit)),
                    existing.as_ref(),
                )
                .await
                .map_err(|error| TxmError::InternalError {
                    message: format!("failed to build forced attempt at nonce {nonce}: {error}"),
                })?;

            match self.chain.send_raw_transaction(&raw).await {
                Ok(_) => {
                    tracing::warn!(account = %account, nonce = nonce, tx_hash = %hash, "Force-rebroadcast attempt sent");
                    sent.push(hash);
                }
                Err(error) => {
                    let outcome = classify_send_error(&error, SendContext::Rebroadcast);
                    if outcome.is_success() {
                        sent.push(hash);
                    } else {
                        tracing::error!(
                            account = %account,
                            nonce = nonce,
                            outcome = ?outcome,
                            error = %error,
                            "Force-rebroadcast attempt rejected"
                        );
                    }
                }
            }
        }
        Ok(sent)
    }
}

fn store_error(error: TxStoreError) -> TxmError {
    TxmError::InternalError {
        message: format!("store error: {error}"),
    }
}
