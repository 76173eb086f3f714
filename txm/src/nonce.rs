use std::{sync::Arc, time::Duration};

use alloy::primitives::Address;
use rand::Rng;
use txm_core::chain::Chain;

use crate::{error::WorkerError, store::TxStore};

const STARTUP_RETRY_BASE_MS: u64 = 250;
const ESCALATE_AFTER_FAILURES: u32 = 5;

/// Store-backed nonce assignment. The store counter is the source of truth
/// once seeded; the node is only consulted to seed it or to fast-forward it,
/// never to walk it backwards.
pub struct NonceTracker<C: Chain, S: TxStore> {
    chain: Arc<C>,
    store: Arc<S>,
}

impl<C: Chain, S: TxStore> NonceTracker<C, S> {
    pub fn new(chain: Arc<C>, store: Arc<S>) -> Self {
        Self { chain, store }
    }

    /// Seeds the counter from the node's pending nonce, retrying until the
    /// node answers. Broadcasting cannot start without a nonce baseline, so
    /// this never gives up on its own.
    pub async fn sync_on_startup(&self, from: Address) -> Result<u64, WorkerError> {
        let mut failures: u32 = 0;
        let pending = loop {
            match self.chain.pending_nonce(from).await {
                Ok(nonce) => break nonce,
                Err(error) => {
                    failures += 1;
                    if failures >= ESCALATE_AFTER_FAILURES {
                        tracing::error!(
                            account = %from,
                            failures = failures,
                            error = %error,
                            "Nonce sync still failing, will keep retrying"
                        );
                    } else {
                        tracing::warn!(
                            account = %from,
                            failures = failures,
                            error = %error,
                            "Nonce sync failed, retrying"
                        );
                    }
                    tokio::time::sleep(retry_delay(failures)).await;
                }
            }
        };
        self.fast_forward(from, pending).await
    }

    /// The nonce the next broadcast should use. The counter itself only
    /// advances when a broadcast outcome is recorded, so calling this twice
    /// without an intervening broadcast returns the same value.
    pub async fn next(&self, from: Address) -> Result<u64, WorkerError> {
        if let Some(nonce) = self.store.next_nonce(from).await? {
            return Ok(nonce);
        }
        let pending = self.chain.pending_nonce(from).await?;
        self.fast_forward(from, pending).await
    }

    /// Moves the counter up to at least `candidate`. A candidate below the
    /// stored value is ignored: mined history can only grow.
    pub async fn fast_forward(&self, from: Address, candidate: u64) -> Result<u64, WorkerError> {
        let stored = self.store.next_nonce(from).await?;
        let merged = stored.map_or(candidate, |s| s.max(candidate));
        self.store.set_next_nonce(from, merged).await?;
        Ok(merged)
    }
}

fn retry_delay(failures: u32) -> Duration {
    let base = STARTUP_RETRY_BASE_MS * (1 << (failures - 1).min(6));
    let mut rng = rand::rng();
    Duration::from_millis(base + rng.random_range(0..=base / 4))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy::{
        primitives::{B256, Bytes, U256},
        transports::http::reqwest::Url,
    };
    use txm_core::{
        chain::{BlockInfo, MinedReceipt, RevertCheck},
        error::TxmError,
    };

    use super::*;
    use crate::store::InMemoryTxStore;

    struct StubChain {
        pending: Mutex<Vec<Result<u64, TxmError>>>,
    }

    impl StubChain {
        fn scripted(results: Vec<Result<u64, TxmError>>) -> Self {
            Self {
                pending: Mutex::new(results),
            }
        }
    }

    impl Chain for StubChain {
        fn chain_id(&self) -> u64 {
            1
        }

        fn rpc_url(&self) -> Url {
            Url::parse("http://localhost:8545").unwrap()
        }

        async fn send_raw_transaction(&self, _raw: &Bytes) -> Result<B256, TxmError> {
            unimplemented!()
        }

        async fn pending_nonce(&self, _account: Address) -> Result<u64, TxmError> {
            let mut scripted = self.pending.lock().unwrap();
            assert!(!scripted.is_empty(), "unexpected pending nonce lookup");
            scripted.remove(0)
        }

        async fn mined_nonce(&self, _account: Address) -> Result<u64, TxmError> {
            unimplemented!()
        }

        async fn balance(&self, _account: Address) -> Result<U256, TxmError> {
            unimplemented!()
        }

        async fn fetch_receipts(
            &self,
            _hashes: &[B256],
        ) -> Result<Vec<Result<Option<MinedReceipt>, TxmError>>, TxmError> {
            unimplemented!()
        }

        async fn fetch_blocks(
            &self,
            _numbers: &[u64],
        ) -> Result<Vec<Result<Option<BlockInfo>, TxmError>>, TxmError> {
            unimplemented!()
        }

        async fn revert_reason(&self, _check: &RevertCheck) -> Option<String> {
            None
        }
    }

    fn rpc_failure() -> TxmError {
        TxmError::InternalError {
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn next_prefers_stored_counter() {
        let store = Arc::new(InMemoryTxStore::new());
        let from = Address::with_last_byte(1);
        store.set_next_nonce(from, 42).await.unwrap();

        // An empty script panics on any chain lookup.
        let tracker = NonceTracker::new(Arc::new(StubChain::scripted(vec![])), store);
        assert_eq!(tracker.next(from).await.unwrap(), 42);
        assert_eq!(tracker.next(from).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn next_seeds_from_chain_when_unseeded() {
        let store = Arc::new(InMemoryTxStore::new());
        let from = Address::with_last_byte(1);
        let tracker = NonceTracker::new(Arc::new(StubChain::scripted(vec![Ok(7)])), store.clone());

        assert_eq!(tracker.next(from).await.unwrap(), 7);
        assert_eq!(store.next_nonce(from).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn fast_forward_never_lowers() {
        let store = Arc::new(InMemoryTxStore::new());
        let from = Address::with_last_byte(1);
        store.set_next_nonce(from, 10).await.unwrap();
        let tracker = NonceTracker::new(Arc::new(StubChain::scripted(vec![])), store);

        assert_eq!(tracker.fast_forward(from, 7).await.unwrap(), 10);
        assert_eq!(tracker.fast_forward(from, 12).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn startup_sync_retries_until_node_answers() {
        let store = Arc::new(InMemoryTxStore::new());
        let from = Address::with_last_byte(1);
        let chain = StubChain::scripted(vec![Err(rpc_failure()), Err(rpc_failure()), Ok(5)]);
        let tracker = NonceTracker::new(Arc::new(chain), store.clone());

        assert_eq!(tracker.sync_on_startup(from).await.unwrap(), 5);
        assert_eq!(store.next_nonce(from).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn startup_sync_keeps_higher_stored_counter() {
        let store = Arc::new(InMemoryTxStore::new());
        let from = Address::with_last_byte(1);
        store.set_next_nonce(from, 8).await.unwrap();
        let tracker = NonceTracker::new(Arc::new(StubChain::scripted(vec![Ok(5)])), store);

        assert_eq!(tracker.sync_on_startup(from).await.unwrap(), 8);
    }
}
