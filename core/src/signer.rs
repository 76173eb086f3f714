use std::collections::HashMap;

use alloy::{
    consensus::{SignableTransaction, Signed, TypedTransaction},
    primitives::Address,
    signers::{Signer, local::PrivateKeySigner},
};

use crate::error::TxmError;

/// Account signer trait using the impl Future pattern so implementations
/// stay object-free and cheaply composable.
///
/// Signing failures are treated as transient: the caller leaves the
/// transaction in place and retries on its next cycle.
pub trait TxSigner: Send + Sync {
    /// Sign a fully built transaction on behalf of `from`.
    fn sign_transaction(
        &self,
        from: Address,
        tx: TypedTransaction,
    ) -> impl std::future::Future<Output = Result<Signed<TypedTransaction>, TxmError>> + Send;
}

/// In-memory signer backed by raw private keys, keyed by account address.
#[derive(Debug, Clone, Default)]
pub struct LocalSigner {
    keys: HashMap<Address, PrivateKeySigner>,
}

impl LocalSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key; the account address is derived from the key itself.
    pub fn register(&mut self, key: PrivateKeySigner) -> Address {
        let address = key.address();
        self.keys.insert(address, key);
        address
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Address> {
        self.keys.keys()
    }
}

impl TxSigner for LocalSigner {
    async fn sign_transaction(
        &self,
        from: Address,
        tx: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, TxmError> {
        let key = self
            .keys
            .get(&from)
            .ok_or(TxmError::SignerUnavailable { account: from })?;

        let signature = key
            .sign_hash(&tx.signature_hash())
            .await
            .map_err(|e| {
                tracing::error!(account = %from, error = %e, "Transaction signing failed");
                TxmError::SigningError {
                    account: from,
                    message: e.to_string(),
                }
            })?;

        Ok(tx.into_signed(signature))
    }
}

#[cfg(test)]
mod tests {
    use alloy::{
        consensus::{Transaction, TxLegacy},
        primitives::{Bytes, TxKind, U256},
    };

    use super::*;

    fn legacy_tx(nonce: u64) -> TypedTransaction {
        TypedTransaction::Legacy(TxLegacy {
            chain_id: Some(1),
            nonce,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(Address::ZERO),
            value: U256::ZERO,
            input: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn signs_for_registered_account() {
        let mut signer = LocalSigner::new();
        let account = signer.register(PrivateKeySigner::random());

        let signed = signer
            .sign_transaction(account, legacy_tx(0))
            .await
            .unwrap();
        assert_eq!(signed.tx().nonce(), 0);
    }

    #[tokio::test]
    async fn unknown_account_is_reported() {
        let signer = LocalSigner::new();
        let err = signer
            .sign_transaction(Address::ZERO, legacy_tx(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::SignerUnavailable { .. }));
    }
}
