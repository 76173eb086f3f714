use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use alloy::primitives::B256;
use txm_core::chain::Chain;

use crate::{
    config::TxmConfig,
    error::WorkerError,
    head::{Head, SingleSlot},
    store::TxStore,
    types::Tx,
};

/// Marks confirmed transactions finalized once their receipt block sinks
/// below the network's finalized height.
///
/// Finality is terminal, so each receipt's block hash is re-validated
/// against the canonical chain first. Mismatches are only reported here;
/// repairing them is the confirmer's job.
pub struct Finalizer<C, St>
where
    C: Chain,
    St: TxStore,
{
    chain: Arc<C>,
    store: Arc<St>,
    config: TxmConfig,
    heads: Arc<SingleSlot<Head>>,
    last_finalized: Mutex<Option<u64>>,
}

impl<C, St> Finalizer<C, St>
where
    C: Chain,
    St: TxStore,
{
    pub fn new(
        chain: Arc<C>,
        store: Arc<St>,
        config: TxmConfig,
        heads: Arc<SingleSlot<Head>>,
    ) -> Self {
        Self {
            chain,
            store,
            config,
            heads,
            last_finalized: Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<(), WorkerError> {
        tracing::info!("Finalizer started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Finalizer shutting down");
                    return Ok(());
                }
                _ = self.heads.notified() => {}
            }
            let Some(head) = self.heads.take() else {
                continue;
            };
            if let Err(error) = self.process_finalized(&head).await {
                tracing::error!(finalized = head.number, error = %error, "Finalization pass failed");
            }
        }
    }

    #[tracing::instrument(skip_all, fields(finalized = head.number))]
    pub async fn process_finalized(&self, head: &Head) -> Result<(), WorkerError> {
        {
            let last = self.last_finalized.lock().unwrap_or_else(|e| e.into_inner());
            match *last {
                Some(last) if head.number == last => {
                    tracing::debug!("Finalized height unchanged, skipping");
                    return Ok(());
                }
                Some(last) if head.number < last => {
                    tracing::warn!(
                        previous = last,
                        delivered = head.number,
                        "Finalized height regressed, ignoring this delivery"
                    );
                    return Ok(());
                }
                _ => {}
            }
        }

        let txs = self.store.find_confirmed_txs_up_to(head.number).await?;
        if !txs.is_empty() {
            let canonical = self.canonical_hashes(head, &txs).await?;

            let mut finalized_ids = Vec::new();
            for tx in &txs {
                let Some(receipt) = &tx.receipt else {
                    continue;
                };
                match canonical.get(&receipt.block_number) {
                    Some(hash) if *hash == receipt.block_hash => finalized_ids.push(tx.id),
                    Some(hash) => {
                        tracing::warn!(
                            tx_id = %tx.id,
                            block = receipt.block_number,
                            receipt_block_hash = %receipt.block_hash,
                            canonical_hash = %hash,
                            "Receipt block hash does not match the finalized chain, possible missed re-org"
                        );
                    }
                    // Block unavailable this pass; the next delivery retries.
                    None => {}
                }
            }

            if !finalized_ids.is_empty() {
                self.store.mark_finalized(&finalized_ids).await?;
                tracing::info!(
                    count = finalized_ids.len(),
                    "Marked transactions finalized"
                );
            }
        }

        *self.last_finalized.lock().unwrap_or_else(|e| e.into_inner()) = Some(head.number);
        Ok(())
    }

    /// Canonical hash per receipt height, taken from the delivered chain
    /// where it reaches and fetched in batches where it does not.
    async fn canonical_hashes(
        &self,
        head: &Head,
        txs: &[Tx],
    ) -> Result<HashMap<u64, B256>, WorkerError> {
        let mut canonical: HashMap<u64, B256> = HashMap::new();
        let mut missing: Vec<u64> = Vec::new();

        for tx in txs {
            let Some(receipt) = &tx.receipt else {
                continue;
            };
            let number = receipt.block_number;
            if canonical.contains_key(&number) || missing.contains(&number) {
                continue;
            }
            match head.hash_at_height(number) {
                Some(hash) => {
                    canonical.insert(number, hash);
                }
                None => missing.push(number),
            }
        }

        missing.sort_unstable();
        for chunk in missing.chunks(self.config.confirmer.rpc_batch_size.max(1)) {
            let results = self.chain.fetch_blocks(chunk).await?;
            for (number, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(block)) => {
                        canonical.insert(block.number, block.hash);
                    }
                    Ok(None) => {
                        tracing::warn!(block = number, "Finalized block not found on the node");
                    }
                    Err(error) => {
                        tracing::warn!(block = number, error = %error, "Block header fetch failed");
                    }
                }
            }
        }
        Ok(canonical)
    }
}
