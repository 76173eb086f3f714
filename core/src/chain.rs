use alloy::{
    eips::BlockNumberOrTag,
    network::TransactionBuilder,
    primitives::{Address, B256, Bytes, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Block, TransactionReceipt, TransactionRequest},
    transports::http::reqwest::Url,
};
use serde::{Deserialize, Serialize};

use crate::error::{AlloyRpcErrorToTxmError, TxmError};

/// Receipt fields as reported by the network. Block placement is optional
/// because nodes answer for transactions they have only seen in the mempool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedReceipt {
    pub tx_hash: B256,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub transaction_index: Option<u64>,
    pub status: bool,
}

impl MinedReceipt {
    /// A receipt with no block placement has not actually been mined.
    pub fn is_unmined(&self) -> bool {
        self.block_hash.is_none() || self.block_number.is_none()
    }
}

impl From<TransactionReceipt> for MinedReceipt {
    fn from(receipt: TransactionReceipt) -> Self {
        MinedReceipt {
            tx_hash: receipt.transaction_hash,
            block_hash: receipt.block_hash,
            block_number: receipt.block_number,
            transaction_index: receipt.transaction_index,
            status: receipt.status(),
        }
    }
}

/// Header identity for one canonical block, used for reorg validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
}

/// Parameters for a best-effort revert-reason simulation of an already
/// broadcast transaction at the block it was included in.
#[derive(Debug, Clone)]
pub struct RevertCheck {
    pub from: Address,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub block_number: u64,
}

pub trait Chain: Send + Sync {
    fn chain_id(&self) -> u64;
    fn rpc_url(&self) -> Url;

    /// Submit a signed raw transaction. The raw RPC error surface is
    /// preserved so callers can classify the server's verdict.
    fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> impl Future<Output = Result<B256, TxmError>> + Send;

    /// The account's next nonce including mempool contents.
    fn pending_nonce(&self, account: Address)
    -> impl Future<Output = Result<u64, TxmError>> + Send;

    /// The account's next nonce counting only mined transactions. Everything
    /// below this value has been included on-chain.
    fn mined_nonce(&self, account: Address) -> impl Future<Output = Result<u64, TxmError>> + Send;

    fn balance(&self, account: Address) -> impl Future<Output = Result<U256, TxmError>> + Send;

    /// One batched receipt lookup. The outer error covers batch dispatch;
    /// items fail individually without blocking their siblings.
    fn fetch_receipts(
        &self,
        hashes: &[B256],
    ) -> impl Future<Output = Result<Vec<Result<Option<MinedReceipt>, TxmError>>, TxmError>> + Send;

    /// One batched header lookup by block number, for receipts older than the
    /// retained in-memory head chain.
    fn fetch_blocks(
        &self,
        numbers: &[u64],
    ) -> impl Future<Output = Result<Vec<Result<Option<BlockInfo>, TxmError>>, TxmError>> + Send;

    /// Re-execute a reverted transaction at its inclusion block and decode the
    /// revert reason, if the node exposes one. Diagnostics only.
    fn revert_reason(&self, check: &RevertCheck) -> impl Future<Output = Option<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
}

/// Production [`Chain`] over a plain JSON-RPC HTTP endpoint.
#[derive(Clone)]
pub struct HttpChain {
    chain_id: u64,
    rpc_url: Url,
    pub provider: RootProvider,
}

impl HttpChainConfig {
    pub fn to_chain(&self) -> Result<HttpChain, TxmError> {
        let rpc_url = Url::parse(&self.rpc_url).map_err(|e| TxmError::RpcConfigError {
            message: format!("Failed to parse RPC URL: {e}"),
        })?;

        Ok(HttpChain {
            chain_id: self.chain_id,
            rpc_url: rpc_url.clone(),
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url),
        })
    }
}

impl Chain for HttpChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn rpc_url(&self) -> Url {
        self.rpc_url.clone()
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, TxmError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| e.to_txm_error(self))?;
        Ok(*pending.tx_hash())
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64, TxmError> {
        self.provider
            .get_transaction_count(account)
            .pending()
            .await
            .map_err(|e| e.to_txm_error(self))
    }

    async fn mined_nonce(&self, account: Address) -> Result<u64, TxmError> {
        self.provider
            .get_transaction_count(account)
            .await
            .map_err(|e| e.to_txm_error(self))
    }

    async fn balance(&self, account: Address) -> Result<U256, TxmError> {
        self.provider
            .get_balance(account)
            .await
            .map_err(|e| e.to_txm_error(self))
    }

    async fn fetch_receipts(
        &self,
        hashes: &[B256],
    ) -> Result<Vec<Result<Option<MinedReceipt>, TxmError>>, TxmError> {
        let mut batch = self.provider.client().new_batch();

        let mut waiters = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let waiter = batch
                .add_call::<_, Option<TransactionReceipt>>("eth_getTransactionReceipt", &(hash,))
                .map_err(|e| e.to_txm_error(self))?;
            waiters.push(waiter);
        }

        batch.send().await.map_err(|e| e.to_txm_error(self))?;

        let mut results = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            results.push(
                waiter
                    .await
                    .map(|receipt| receipt.map(MinedReceipt::from))
                    .map_err(|e| e.to_txm_error(self)),
            );
        }
        Ok(results)
    }

    async fn fetch_blocks(
        &self,
        numbers: &[u64],
    ) -> Result<Vec<Result<Option<BlockInfo>, TxmError>>, TxmError> {
        let mut batch = self.provider.client().new_batch();

        let mut waiters = Vec::with_capacity(numbers.len());
        for number in numbers {
            // Headers only; transaction bodies are irrelevant for hash checks.
            let waiter = batch
                .add_call::<_, Option<Block>>(
                    "eth_getBlockByNumber",
                    &(BlockNumberOrTag::Number(*number), false),
                )
                .map_err(|e| e.to_txm_error(self))?;
            waiters.push(waiter);
        }

        batch.send().await.map_err(|e| e.to_txm_error(self))?;

        let mut results = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            results.push(
                waiter
                    .await
                    .map(|block| {
                        block.map(|block| BlockInfo {
                            number: block.header.number,
                            hash: block.header.hash,
                            parent_hash: block.header.parent_hash,
                        })
                    })
                    .map_err(|e| e.to_txm_error(self)),
            );
        }
        Ok(results)
    }

    async fn revert_reason(&self, check: &RevertCheck) -> Option<String> {
        let mut request = TransactionRequest::default()
            .with_from(check.from)
            .with_value(check.value)
            .with_gas_limit(check.gas_limit)
            .with_input(check.data.clone());
        if let Some(to) = check.to {
            request = request.with_to(to);
        }

        match self
            .provider
            .call(request)
            .block(BlockNumberOrTag::Number(check.block_number).into())
            .await
        {
            Ok(_) => None,
            Err(e) => e
                .as_error_resp()
                .and_then(|resp| resp.as_revert_data())
                .and_then(|data| alloy::sol_types::decode_revert_reason(&data)),
        }
    }
}
