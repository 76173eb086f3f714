use std::sync::{Arc, Mutex};

use alloy::primitives::B256;
use tokio::sync::Notify;
use txm_core::chain::BlockInfo;

/// One chain head, optionally linked to in-memory ancestors delivered with
/// it. The ancestor chain is what re-org detection walks; it does not need
/// to reach genesis.
#[derive(Debug, Clone)]
pub struct Head {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub parent: Option<Arc<Head>>,
}

impl Head {
    pub fn new(number: u64, hash: B256, parent_hash: B256) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Head) -> Self {
        self.parent = Some(Arc::new(parent));
        self
    }

    /// Number of heads in the in-memory chain, this one included.
    pub fn chain_len(&self) -> u64 {
        let mut len = 1;
        let mut cursor = self.parent.as_deref();
        while let Some(head) = cursor {
            len += 1;
            cursor = head.parent.as_deref();
        }
        len
    }

    /// Oldest ancestor delivered with this head.
    pub fn earliest_in_chain(&self) -> &Head {
        let mut cursor = self;
        while let Some(parent) = cursor.parent.as_deref() {
            cursor = parent;
        }
        cursor
    }

    /// Canonical hash at `number`, if that height is within the delivered
    /// ancestor chain.
    pub fn hash_at_height(&self, number: u64) -> Option<B256> {
        let mut cursor = self;
        loop {
            if cursor.number == number {
                return Some(cursor.hash);
            }
            cursor = cursor.parent.as_deref()?;
        }
    }

    pub fn is_in_chain(&self, hash: B256) -> bool {
        let mut cursor = self;
        loop {
            if cursor.hash == hash {
                return true;
            }
            match cursor.parent.as_deref() {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

impl From<BlockInfo> for Head {
    fn from(block: BlockInfo) -> Self {
        Head::new(block.number, block.hash, block.parent_hash)
    }
}

/// Single-slot overwrite mailbox.
///
/// Consumers that fall behind skip straight to the newest value instead of
/// working through a backlog; there is never more than one value queued.
#[derive(Debug, Default)]
pub struct SingleSlot<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> SingleSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Put `value` in the slot, replacing any undelivered one. Returns true
    /// when a previous value was overwritten before anyone took it.
    pub fn deliver(&self, value: T) -> bool {
        let overwrote = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(value).is_some()
        };
        self.notify.notify_one();
        overwrote
    }

    pub fn take(&self) -> Option<T> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Wait until a deliver lands. A deliver that happened since the last
    /// wait completes the next call immediately.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
