use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use alloy::primitives::Address;
use chrono::{DateTime, Utc};

use crate::{
    store::{TxStore, TxStoreError},
    types::{AttemptId, Receipt, Tx, TxAttempt, TxAttemptState, TxId, TxState},
};

/// Reference store over a process-local mutex. Every trait operation takes
/// the lock exactly once, so each one is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct InMemoryTxStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Insertion order doubles as creation order.
    txs: Vec<Tx>,
    next_nonce: HashMap<Address, u64>,
    purge_blocks: HashMap<Address, u64>,
}

impl Inner {
    fn tx(&self, id: TxId) -> Result<&Tx, TxStoreError> {
        self.txs
            .iter()
            .find(|tx| tx.id == id)
            .ok_or(TxStoreError::TxNotFound { tx_id: id })
    }

    fn tx_mut(&mut self, id: TxId) -> Result<&mut Tx, TxStoreError> {
        self.txs
            .iter_mut()
            .find(|tx| tx.id == id)
            .ok_or(TxStoreError::TxNotFound { tx_id: id })
    }

    fn tx_with_attempt_mut(
        &mut self,
        attempt_id: AttemptId,
    ) -> Result<&mut Tx, TxStoreError> {
        self.txs
            .iter_mut()
            .find(|tx| tx.attempts.iter().any(|a| a.id == attempt_id))
            .ok_or(TxStoreError::AttemptNotFound { attempt_id })
    }

    fn attempt_mut(&mut self, attempt_id: AttemptId) -> Result<&mut TxAttempt, TxStoreError> {
        self.txs
            .iter_mut()
            .flat_map(|tx| tx.attempts.iter_mut())
            .find(|a| a.id == attempt_id)
            .ok_or(TxStoreError::AttemptNotFound { attempt_id })
    }

    fn touch_broadcast_at(tx: &mut Tx, at: DateTime<Utc>) {
        tx.broadcast_at = Some(tx.broadcast_at.map_or(at, |prev| prev.max(at)));
        tx.initial_broadcast_at.get_or_insert(at);
    }
}

fn sort_by_nonce(txs: &mut [Tx]) {
    txs.sort_by_key(|tx| (tx.from, tx.nonce));
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TxStore for InMemoryTxStore {
    async fn insert_tx(&self, tx: Tx) -> Result<Tx, TxStoreError> {
        let mut inner = self.lock();
        if let Some(key) = &tx.idempotency_key
            && let Some(existing) = inner
                .txs
                .iter()
                .find(|t| t.idempotency_key.as_ref() == Some(key))
        {
            return Ok(existing.clone());
        }
        inner.txs.push(tx.clone());
        Ok(tx)
    }

    async fn get_tx(&self, id: TxId) -> Result<Option<Tx>, TxStoreError> {
        Ok(self.lock().txs.iter().find(|tx| tx.id == id).cloned())
    }

    async fn count_unstarted(&self, from: Address) -> Result<u64, TxStoreError> {
        Ok(self
            .lock()
            .txs
            .iter()
            .filter(|tx| tx.from == from && tx.state == TxState::Unstarted)
            .count() as u64)
    }

    async fn count_unconfirmed(&self, from: Address) -> Result<u64, TxStoreError> {
        Ok(self
            .lock()
            .txs
            .iter()
            .filter(|tx| tx.from == from && tx.state == TxState::Unconfirmed)
            .count() as u64)
    }

    async fn find_next_unstarted(&self, from: Address) -> Result<Option<Tx>, TxStoreError> {
        Ok(self
            .lock()
            .txs
            .iter()
            .find(|tx| tx.from == from && tx.state == TxState::Unstarted)
            .cloned())
    }

    async fn find_in_progress_tx(&self, from: Address) -> Result<Option<Tx>, TxStoreError> {
        Ok(self
            .lock()
            .txs
            .iter()
            .find(|tx| tx.from == from && tx.state == TxState::InProgress)
            .cloned())
    }

    async fn save_tx_in_progress(
        &self,
        tx: &Tx,
        attempt: &TxAttempt,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .txs
            .iter()
            .find(|t| t.from == tx.from && t.state == TxState::InProgress && t.id != tx.id)
        {
            return Err(TxStoreError::InProgressTxExists {
                from: tx.from,
                tx_id: existing.id,
            });
        }
        let stored = inner.tx_mut(tx.id)?;
        if stored.state != TxState::Unstarted {
            return Err(TxStoreError::InvalidTxState {
                tx_id: tx.id,
                expected: TxState::Unstarted,
                actual: stored.state,
            });
        }
        stored.state = TxState::InProgress;
        stored.nonce = tx.nonce;
        stored.attempts = vec![attempt.clone()];
        Ok(())
    }

    async fn save_broadcast(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_mut(tx_id)?;
        if tx.state != TxState::InProgress {
            return Err(TxStoreError::InvalidTxState {
                tx_id,
                expected: TxState::InProgress,
                actual: tx.state,
            });
        }
        let from = tx.from;
        let next = tx.nonce.map(|n| n + 1);
        let attempt = tx
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or(TxStoreError::AttemptNotFound { attempt_id })?;
        attempt.state = TxAttemptState::Broadcast;
        tx.state = TxState::Unconfirmed;
        Inner::touch_broadcast_at(tx, broadcast_at);

        // Counter and recorded nonce advance in the same locked section.
        if let Some(next) = next {
            let counter = inner.next_nonce.entry(from).or_insert(0);
            *counter = (*counter).max(next);
        }
        Ok(())
    }

    async fn save_fatally_errored(&self, tx_id: TxId, error: String) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_mut(tx_id)?;
        tx.state = TxState::FatalError;
        tx.error = Some(error);
        tx.nonce = None;
        tx.attempts.clear();
        Ok(())
    }

    async fn next_nonce(&self, from: Address) -> Result<Option<u64>, TxStoreError> {
        Ok(self.lock().next_nonce.get(&from).copied())
    }

    async fn set_next_nonce(&self, from: Address, nonce: u64) -> Result<(), TxStoreError> {
        self.lock().next_nonce.insert(from, nonce);
        Ok(())
    }

    async fn stamp_broadcast_before_block_num(&self, block_num: u64) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        for attempt in inner.txs.iter_mut().flat_map(|tx| tx.attempts.iter_mut()) {
            if attempt.state == TxAttemptState::Broadcast
                && attempt.broadcast_before_block_num.is_none()
            {
                attempt.broadcast_before_block_num = Some(block_num);
            }
        }
        Ok(())
    }

    async fn find_confirmed_missing_receipt_txs(&self) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| tx.state == TxState::ConfirmedMissingReceipt)
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn update_txs_unconfirmed(&self, tx_ids: &[TxId]) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        for tx in inner.txs.iter_mut() {
            if tx.state == TxState::ConfirmedMissingReceipt && tx_ids.contains(&tx.id) {
                tx.state = TxState::Unconfirmed;
            }
        }
        Ok(())
    }

    async fn find_txs_requiring_receipt_fetch(&self) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                matches!(
                    tx.state,
                    TxState::Unconfirmed | TxState::ConfirmedMissingReceipt
                ) && tx
                    .attempts
                    .iter()
                    .any(|a| a.state != TxAttemptState::InProgress)
            })
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn save_fetched_receipts(&self, receipts: &[Receipt]) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        for receipt in receipts {
            let Some(tx) = inner.txs.iter_mut().find(|tx| {
                tx.attempts.iter().any(|a| a.hash == receipt.tx_hash)
            }) else {
                continue;
            };
            if !matches!(
                tx.state,
                TxState::Unconfirmed | TxState::ConfirmedMissingReceipt | TxState::Confirmed
            ) {
                continue;
            }
            tx.receipt = Some(receipt.clone());
            tx.state = TxState::Confirmed;
        }
        Ok(())
    }

    async fn mark_confirmed_missing_receipt(&self) -> Result<Vec<TxId>, TxStoreError> {
        let mut inner = self.lock();
        let mut max_confirmed: HashMap<Address, u64> = HashMap::new();
        for tx in inner.txs.iter() {
            if tx.state == TxState::Confirmed
                && let Some(nonce) = tx.nonce
            {
                let entry = max_confirmed.entry(tx.from).or_insert(nonce);
                *entry = (*entry).max(nonce);
            }
        }

        let mut marked = Vec::new();
        for tx in inner.txs.iter_mut() {
            if tx.state != TxState::Unconfirmed || tx.receipt.is_some() {
                continue;
            }
            let (Some(nonce), Some(max)) = (tx.nonce, max_confirmed.get(&tx.from)) else {
                continue;
            };
            if nonce < *max {
                tx.state = TxState::ConfirmedMissingReceipt;
                marked.push(tx.id);
            }
        }
        Ok(marked)
    }

    async fn mark_old_txs_missing_receipt_errored(
        &self,
        cutoff_block: u64,
        error: String,
    ) -> Result<Vec<Tx>, TxStoreError> {
        let mut inner = self.lock();
        let mut errored = Vec::new();
        for tx in inner.txs.iter_mut() {
            if tx.state != TxState::ConfirmedMissingReceipt {
                continue;
            }
            let newest_broadcast = tx
                .attempts
                .iter()
                .filter_map(|a| a.broadcast_before_block_num)
                .max();
            if let Some(newest) = newest_broadcast
                && newest < cutoff_block
            {
                tx.state = TxState::FatalError;
                tx.error = Some(error.clone());
                errored.push(tx.clone());
            }
        }
        Ok(errored)
    }

    async fn find_txs_with_in_progress_attempts(
        &self,
        from: Address,
    ) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                tx.from == from
                    && tx.state == TxState::Unconfirmed
                    && tx
                        .attempts
                        .iter()
                        .any(|a| a.state == TxAttemptState::InProgress)
            })
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn find_txs_requiring_rebroadcast(
        &self,
        from: Address,
        current_block: u64,
        bump_threshold: u64,
        bump_depth: u32,
    ) -> Result<Vec<Tx>, TxStoreError> {
        let inner = self.lock();
        let unconfirmed = inner
            .txs
            .iter()
            .filter(|tx| tx.from == from && tx.state == TxState::Unconfirmed);

        let mut insufficient = Vec::new();
        let mut bumps = Vec::new();
        for tx in unconfirmed {
            match tx.current_attempt() {
                Some(newest) if newest.state == TxAttemptState::InsufficientFunds => {
                    insufficient.push(tx.clone());
                }
                Some(newest)
                    if bump_threshold > 0
                        && tx
                            .attempts
                            .iter()
                            .all(|a| a.state == TxAttemptState::Broadcast)
                        && newest
                            .broadcast_before_block_num
                            .is_some_and(|b| b + bump_threshold < current_block) =>
                {
                    bumps.push(tx.clone());
                }
                // Unconfirmed with no attempt at all cannot happen through
                // the normal pipeline; returned so the caller can repair it
                // with a fresh attempt.
                None => insufficient.push(tx.clone()),
                _ => {}
            }
        }
        drop(inner);

        sort_by_nonce(&mut bumps);
        if bump_depth > 0 {
            bumps.truncate(bump_depth as usize);
        }
        let mut combined = insufficient;
        combined.extend(bumps);
        sort_by_nonce(&mut combined);
        Ok(combined)
    }

    async fn save_in_progress_attempt(&self, attempt: &TxAttempt) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_mut(attempt.tx_id)?;
        if tx.attempts.iter().any(|a| a.id == attempt.id) {
            return Ok(());
        }
        tx.attempts.insert(0, attempt.clone());
        Ok(())
    }

    async fn save_replacement_in_progress_attempt(
        &self,
        old_attempt_id: AttemptId,
        new_attempt: &TxAttempt,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_with_attempt_mut(old_attempt_id)?;
        tx.attempts.retain(|a| a.id != old_attempt_id);
        tx.attempts.insert(0, new_attempt.clone());
        Ok(())
    }

    async fn delete_in_progress_attempt(&self, attempt_id: AttemptId) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_with_attempt_mut(attempt_id)?;
        tx.attempts
            .retain(|a| !(a.id == attempt_id && a.state == TxAttemptState::InProgress));
        Ok(())
    }

    async fn save_sent_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_with_attempt_mut(attempt_id)?;
        if let Some(attempt) = tx.attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.state = TxAttemptState::Broadcast;
        }
        Inner::touch_broadcast_at(tx, broadcast_at);
        Ok(())
    }

    async fn save_insufficient_funds_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_with_attempt_mut(attempt_id)?;
        if let Some(attempt) = tx.attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.state = TxAttemptState::InsufficientFunds;
        }
        Inner::touch_broadcast_at(tx, broadcast_at);
        Ok(())
    }

    async fn save_confirmed_missing_receipt_attempt(
        &self,
        attempt_id: AttemptId,
        broadcast_at: DateTime<Utc>,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_with_attempt_mut(attempt_id)?;
        if let Some(attempt) = tx.attempts.iter_mut().find(|a| a.id == attempt_id) {
            attempt.state = TxAttemptState::Broadcast;
        }
        tx.state = TxState::ConfirmedMissingReceipt;
        Inner::touch_broadcast_at(tx, broadcast_at);
        Ok(())
    }

    async fn find_confirmed_txs_in_block_range(
        &self,
        low: u64,
        high: u64,
    ) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                tx.state == TxState::Confirmed
                    && tx
                        .receipt
                        .as_ref()
                        .is_some_and(|r| r.block_number >= low && r.block_number <= high)
            })
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn update_tx_for_rebroadcast(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_mut(tx_id)?;
        let attempt = tx
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or(TxStoreError::AttemptNotFound { attempt_id })?;
        attempt.state = TxAttemptState::InProgress;
        attempt.broadcast_before_block_num = None;
        tx.receipt = None;
        tx.state = TxState::Unconfirmed;
        Ok(())
    }

    async fn find_confirmed_txs_up_to(&self, block_height: u64) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                tx.state == TxState::Confirmed
                    && tx
                        .receipt
                        .as_ref()
                        .is_some_and(|r| r.block_number <= block_height)
            })
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn mark_finalized(&self, tx_ids: &[TxId]) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        for tx in inner.txs.iter_mut() {
            if tx.state == TxState::Confirmed && tx_ids.contains(&tx.id) {
                tx.state = TxState::Finalized;
            }
        }
        Ok(())
    }

    async fn find_txs_pending_callback(&self, latest_block: u64) -> Result<Vec<Tx>, TxStoreError> {
        let txs = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                if !tx.signal_callback || tx.callback_completed {
                    return false;
                }
                match tx.state {
                    TxState::FatalError => true,
                    TxState::Confirmed | TxState::Finalized => {
                        tx.receipt.as_ref().is_some_and(|r| {
                            latest_block + 1 >= r.block_number
                                && latest_block + 1 - r.block_number >= tx.min_confirmations
                        })
                    }
                    _ => false,
                }
            })
            .cloned()
            .collect();
        Ok(txs)
    }

    async fn mark_callback_completed(&self, tx_id: TxId) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let tx = inner.tx_mut(tx_id)?;
        tx.callback_completed = true;
        Ok(())
    }

    async fn find_txs_requiring_resend(
        &self,
        from: Address,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| {
                matches!(
                    tx.state,
                    TxState::Unconfirmed | TxState::ConfirmedMissingReceipt
                ) && tx.from == from
                    && tx.broadcast_at.is_some_and(|at| at < older_than)
                    && tx
                        .attempts
                        .iter()
                        .any(|a| a.state == TxAttemptState::Broadcast)
            })
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        if limit > 0 {
            txs.truncate(limit as usize);
        }
        Ok(txs)
    }

    async fn update_broadcast_ats(
        &self,
        tx_ids: &[TxId],
        at: DateTime<Utc>,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        for tx in inner.txs.iter_mut() {
            if tx_ids.contains(&tx.id)
                && tx.broadcast_at.is_none_or(|prev| prev < at)
            {
                tx.broadcast_at = Some(at);
            }
        }
        Ok(())
    }

    async fn find_unconfirmed_txs(&self, from: Address) -> Result<Vec<Tx>, TxStoreError> {
        let mut txs: Vec<Tx> = self
            .lock()
            .txs
            .iter()
            .filter(|tx| tx.from == from && tx.state == TxState::Unconfirmed)
            .cloned()
            .collect();
        sort_by_nonce(&mut txs);
        Ok(txs)
    }

    async fn purge_block_num(&self, from: Address) -> Result<Option<u64>, TxStoreError> {
        Ok(self.lock().purge_blocks.get(&from).copied())
    }

    async fn save_stuck_tx_purged(
        &self,
        tx_id: TxId,
        receipt: Receipt,
        error: String,
    ) -> Result<(), TxStoreError> {
        let mut inner = self.lock();
        let from = inner.tx(tx_id)?.from;
        inner.purge_blocks.insert(from, receipt.block_number);
        let tx = inner.tx_mut(tx_id)?;
        tx.receipt = Some(receipt);
        tx.state = TxState::FatalError;
        tx.error = Some(error);
        Ok(())
    }

    async fn find_tx_by_nonce(
        &self,
        from: Address,
        nonce: u64,
    ) -> Result<Option<Tx>, TxStoreError> {
        Ok(self
            .lock()
            .txs
            .iter()
            .find(|tx| tx.from == from && tx.nonce == Some(nonce))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, Bytes, U256};
    use txm_core::fee::Fee;

    use super::*;

    fn account() -> Address {
        Address::with_last_byte(1)
    }

    fn make_tx(from: Address, state: TxState) -> Tx {
        Tx {
            id: TxId::new(),
            idempotency_key: None,
            from,
            to: Some(Address::with_last_byte(9)),
            encoded_payload: Bytes::new(),
            value: U256::ZERO,
            fee_limit: 21_000,
            nonce: None,
            state,
            attempts: Vec::new(),
            receipt: None,
            meta: None,
            error: None,
            created_at: Utc::now(),
            broadcast_at: None,
            initial_broadcast_at: None,
            min_confirmations: 1,
            signal_callback: false,
            callback_completed: false,
        }
    }

    fn make_attempt(tx_id: TxId, gas_price: u128) -> TxAttempt {
        TxAttempt {
            id: AttemptId::new(),
            tx_id,
            fee: Fee::Legacy { gas_price },
            signed_payload: Bytes::from(vec![1, 2, 3]),
            hash: B256::random(),
            state: TxAttemptState::InProgress,
            broadcast_before_block_num: None,
            is_purge_attempt: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing() {
        let store = InMemoryTxStore::new();
        let mut tx = make_tx(account(), TxState::Unstarted);
        tx.idempotency_key = Some("key-1".to_string());
        let first = store.insert_tx(tx.clone()).await.unwrap();

        let mut duplicate = make_tx(account(), TxState::Unstarted);
        duplicate.idempotency_key = Some("key-1".to_string());
        let second = store.insert_tx(duplicate).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.count_unstarted(account()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn only_one_in_progress_per_account() {
        let store = InMemoryTxStore::new();
        let mut first = make_tx(account(), TxState::Unstarted);
        let mut second = make_tx(account(), TxState::Unstarted);
        store.insert_tx(first.clone()).await.unwrap();
        store.insert_tx(second.clone()).await.unwrap();

        first.nonce = Some(0);
        first.state = TxState::InProgress;
        store
            .save_tx_in_progress(&first, &make_attempt(first.id, 10))
            .await
            .unwrap();

        second.nonce = Some(1);
        second.state = TxState::InProgress;
        let err = store
            .save_tx_in_progress(&second, &make_attempt(second.id, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, TxStoreError::InProgressTxExists { .. }));
    }

    #[tokio::test]
    async fn broadcast_advances_nonce_counter_atomically() {
        let store = InMemoryTxStore::new();
        store.set_next_nonce(account(), 5).await.unwrap();

        let mut tx = make_tx(account(), TxState::Unstarted);
        store.insert_tx(tx.clone()).await.unwrap();
        tx.nonce = Some(5);
        let attempt = make_attempt(tx.id, 10);
        store.save_tx_in_progress(&tx, &attempt).await.unwrap();

        store
            .save_broadcast(tx.id, attempt.id, Utc::now())
            .await
            .unwrap();

        assert_eq!(store.next_nonce(account()).await.unwrap(), Some(6));
        let stored = store.get_tx(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TxState::Unconfirmed);
        assert_eq!(stored.attempts[0].state, TxAttemptState::Broadcast);
        assert!(stored.initial_broadcast_at.is_some());
    }

    #[tokio::test]
    async fn fatal_error_releases_nonce() {
        let store = InMemoryTxStore::new();
        store.set_next_nonce(account(), 3).await.unwrap();

        let mut tx = make_tx(account(), TxState::Unstarted);
        store.insert_tx(tx.clone()).await.unwrap();
        tx.nonce = Some(3);
        store
            .save_tx_in_progress(&tx, &make_attempt(tx.id, 10))
            .await
            .unwrap();
        store
            .save_fatally_errored(tx.id, "invalid signature".to_string())
            .await
            .unwrap();

        // Counter untouched, so nonce 3 goes to the next transaction.
        assert_eq!(store.next_nonce(account()).await.unwrap(), Some(3));
        let stored = store.get_tx(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TxState::FatalError);
        assert!(stored.attempts.is_empty());
        assert_eq!(stored.nonce, None);
    }

    #[tokio::test]
    async fn bump_window_is_strict() {
        let store = InMemoryTxStore::new();
        let mut tx = make_tx(account(), TxState::Unstarted);
        store.insert_tx(tx.clone()).await.unwrap();
        tx.nonce = Some(0);
        let attempt = make_attempt(tx.id, 10);
        store.save_tx_in_progress(&tx, &attempt).await.unwrap();
        store
            .save_broadcast(tx.id, attempt.id, Utc::now())
            .await
            .unwrap();
        store.stamp_broadcast_before_block_num(10).await.unwrap();

        // Threshold 5: no bump while the age is exactly at the threshold.
        let at_threshold = store
            .find_txs_requiring_rebroadcast(account(), 15, 5, 0)
            .await
            .unwrap();
        assert!(at_threshold.is_empty());

        let past_threshold = store
            .find_txs_requiring_rebroadcast(account(), 16, 5, 0)
            .await
            .unwrap();
        assert_eq!(past_threshold.len(), 1);
        assert_eq!(past_threshold[0].id, tx.id);
    }

    #[tokio::test]
    async fn missing_receipt_marking_requires_higher_confirmed_nonce() {
        let store = InMemoryTxStore::new();
        let from = account();

        let mut low = make_tx(from, TxState::Unstarted);
        store.insert_tx(low.clone()).await.unwrap();
        low.nonce = Some(0);
        let low_attempt = make_attempt(low.id, 10);
        store.save_tx_in_progress(&low, &low_attempt).await.unwrap();
        store
            .save_broadcast(low.id, low_attempt.id, Utc::now())
            .await
            .unwrap();

        let mut high = make_tx(from, TxState::Unstarted);
        store.insert_tx(high.clone()).await.unwrap();
        high.nonce = Some(1);
        let high_attempt = make_attempt(high.id, 10);
        store
            .save_tx_in_progress(&high, &high_attempt)
            .await
            .unwrap();
        store
            .save_broadcast(high.id, high_attempt.id, Utc::now())
            .await
            .unwrap();

        // Nothing confirmed yet: nothing marked.
        assert!(store.mark_confirmed_missing_receipt().await.unwrap().is_empty());

        // Confirm the higher nonce; the lower one without a receipt must be
        // flagged.
        store
            .save_fetched_receipts(&[Receipt {
                tx_hash: high_attempt.hash,
                block_hash: B256::random(),
                block_number: 100,
                transaction_index: 0,
                status: true,
                revert_reason: None,
            }])
            .await
            .unwrap();
        let marked = store.mark_confirmed_missing_receipt().await.unwrap();
        assert_eq!(marked, vec![low.id]);
    }

    #[tokio::test]
    async fn reorg_rebroadcast_resets_receipt_and_attempt() {
        let store = InMemoryTxStore::new();
        let mut tx = make_tx(account(), TxState::Unstarted);
        store.insert_tx(tx.clone()).await.unwrap();
        tx.nonce = Some(0);
        let attempt = make_attempt(tx.id, 10);
        store.save_tx_in_progress(&tx, &attempt).await.unwrap();
        store
            .save_broadcast(tx.id, attempt.id, Utc::now())
            .await
            .unwrap();
        store
            .save_fetched_receipts(&[Receipt {
                tx_hash: attempt.hash,
                block_hash: B256::random(),
                block_number: 8,
                transaction_index: 0,
                status: true,
                revert_reason: None,
            }])
            .await
            .unwrap();

        store
            .update_tx_for_rebroadcast(tx.id, attempt.id)
            .await
            .unwrap();

        let stored = store.get_tx(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TxState::Unconfirmed);
        assert!(stored.receipt.is_none());
        assert_eq!(stored.attempts[0].state, TxAttemptState::InProgress);
        assert_eq!(stored.attempts[0].broadcast_before_block_num, None);
        // Nonce stays: the replacement goes out at the same position.
        assert_eq!(stored.nonce, Some(0));
    }

    #[tokio::test]
    async fn finalization_is_monotonic() {
        let store = InMemoryTxStore::new();
        let mut tx = make_tx(account(), TxState::Unstarted);
        store.insert_tx(tx.clone()).await.unwrap();
        tx.nonce = Some(0);
        let attempt = make_attempt(tx.id, 10);
        store.save_tx_in_progress(&tx, &attempt).await.unwrap();
        store
            .save_broadcast(tx.id, attempt.id, Utc::now())
            .await
            .unwrap();
        store
            .save_fetched_receipts(&[Receipt {
                tx_hash: attempt.hash,
                block_hash: B256::random(),
                block_number: 5,
                transaction_index: 0,
                status: true,
                revert_reason: None,
            }])
            .await
            .unwrap();

        store.mark_finalized(&[tx.id]).await.unwrap();
        assert_eq!(
            store.get_tx(tx.id).await.unwrap().unwrap().state,
            TxState::Finalized
        );

        // Finalized transactions never reappear in finalizer queries.
        assert!(store.find_confirmed_txs_up_to(100).await.unwrap().is_empty());
    }
}
