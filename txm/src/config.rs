use std::{collections::HashMap, time::Duration};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use txm_core::error::TxmError;

/// Full delivery-pipeline configuration for one chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxmConfig {
    pub transactions: TxConfig,
    pub fee: FeeConfig,
    pub confirmer: ConfirmerConfig,
    pub purge: PurgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    /// Cap on broadcast-but-unconfirmed transactions per account. 0 removes
    /// the limit.
    pub max_in_flight: u32,
    /// Cap on queued (unstarted) transactions per account. 0 removes the
    /// limit.
    pub max_queued: u64,
    /// Resend unconfirmed attempts that have not been rebroadcast for this
    /// long. Zero disables the resender.
    pub resend_after: Duration,
    /// Broadcaster wake-up cadence when no enqueue trigger arrives.
    pub fallback_poll_interval: Duration,
    /// Deadline for one broadcaster cycle. A timed-out cycle aborts and is
    /// retried whole on the next trigger.
    pub cycle_timeout: Duration,
    /// Seed each account's nonce counter from the node when its broadcaster
    /// starts. Disable for nodes whose pending-nonce view cannot be trusted.
    pub nonce_auto_sync: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            max_queued: 250,
            resend_after: Duration::from_secs(60),
            fallback_poll_interval: Duration::from_secs(30),
            cycle_timeout: Duration::from_secs(5 * 60),
            nonce_auto_sync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Price with tip-cap / fee-cap pairs instead of a single gas price.
    pub dynamic: bool,
    /// Starting gas price (legacy) or fee cap (dynamic), in wei.
    pub price_default: u128,
    /// Starting tip for dynamic pricing, in wei.
    pub tip_default: u128,
    pub price_min: u128,
    pub tip_min: u128,
    /// Hard ceiling. No attempt is ever signed above this, bumps included.
    pub price_max: u128,
    /// Ceiling overrides for individual accounts; the lower of this and
    /// `price_max` applies.
    pub per_account_price_max: HashMap<Address, u128>,
    /// Blocks an attempt may sit unincluded before a fee bump. 0 disables
    /// bumping entirely.
    pub bump_threshold: u64,
    /// Per account, only the oldest N unconfirmed transactions are eligible
    /// for bumping each cycle.
    pub bump_tx_depth: u32,
    pub bump_percent: u32,
    /// Absolute bump floor in wei, applied when the percentage is smaller.
    pub bump_min: u128,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            dynamic: true,
            price_default: 20_000_000_000,
            tip_default: 1_000_000_000,
            price_min: 1_000_000_000,
            tip_min: 1,
            price_max: 500_000_000_000,
            per_account_price_max: HashMap::new(),
            bump_threshold: 3,
            bump_tx_depth: 16,
            bump_percent: 20,
            bump_min: 5_000_000_000,
        }
    }
}

impl FeeConfig {
    /// Effective ceiling for one account.
    pub fn price_max_for(&self, account: &Address) -> u128 {
        self.per_account_price_max
            .get(account)
            .copied()
            .map_or(self.price_max, |per_key| per_key.min(self.price_max))
    }

    pub fn bump_enabled(&self) -> bool {
        self.bump_threshold > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmerConfig {
    /// Depth below the latest head at which re-orgs are considered
    /// impossible for protection purposes.
    pub finality_depth: u64,
    /// Max calls per JSON-RPC batch.
    pub rpc_batch_size: usize,
    /// Confirmation depth used when a request does not specify one.
    pub min_confirmations_default: u64,
    /// Escalate (once per resend sweep) when the oldest unconfirmed
    /// transaction exceeds this age.
    pub unconfirmed_alert_after: Duration,
    /// Deadline for processing one head. A pass that blows the deadline is
    /// abandoned; the next head repeats the work.
    pub process_head_timeout: Duration,
}

impl Default for ConfirmerConfig {
    fn default() -> Self {
        Self {
            finality_depth: 50,
            rpc_batch_size: 250,
            min_confirmations_default: 1,
            unconfirmed_alert_after: Duration::from_secs(10 * 60),
            process_head_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    /// Detect terminally stuck transactions and burn their nonces.
    pub enabled: bool,
    /// Blocks without inclusion (since broadcast or last purge) before a
    /// transaction is considered stuck. Also rate-limits purges per account.
    pub threshold_blocks: u64,
    /// Minimum broadcast attempts before the heuristic may fire.
    pub min_attempts: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_blocks: 300,
            min_attempts: 10,
        }
    }
}

impl TxmConfig {
    pub fn validate(&self) -> Result<(), TxmError> {
        if self.fee.price_min > self.fee.price_default {
            return Err(TxmError::ValidationError {
                message: format!(
                    "fee.price_min ({}) must not exceed fee.price_default ({})",
                    self.fee.price_min, self.fee.price_default
                ),
            });
        }
        if self.fee.price_default > self.fee.price_max {
            return Err(TxmError::ValidationError {
                message: format!(
                    "fee.price_default ({}) must not exceed fee.price_max ({})",
                    self.fee.price_default, self.fee.price_max
                ),
            });
        }
        if self.fee.dynamic && self.fee.tip_min > self.fee.tip_default {
            return Err(TxmError::ValidationError {
                message: format!(
                    "fee.tip_min ({}) must not exceed fee.tip_default ({})",
                    self.fee.tip_min, self.fee.tip_default
                ),
            });
        }
        if self.fee.bump_enabled() && self.fee.bump_percent == 0 && self.fee.bump_min == 0 {
            return Err(TxmError::ValidationError {
                message: "fee bumping is enabled but both fee.bump_percent and fee.bump_min are 0"
                    .to_string(),
            });
        }
        if self.confirmer.rpc_batch_size == 0 {
            return Err(TxmError::ValidationError {
                message: "confirmer.rpc_batch_size must be at least 1".to_string(),
            });
        }
        if self.confirmer.finality_depth == 0 {
            return Err(TxmError::ValidationError {
                message: "confirmer.finality_depth must be at least 1".to_string(),
            });
        }
        if self.purge.enabled && self.purge.threshold_blocks == 0 {
            return Err(TxmError::ValidationError {
                message: "purge.threshold_blocks must be nonzero when purging is enabled"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TxmConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_price_bounds() {
        let mut config = TxmConfig::default();
        config.fee.price_default = config.fee.price_max + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_bump_when_bumping_enabled() {
        let mut config = TxmConfig::default();
        config.fee.bump_percent = 0;
        config.fee.bump_min = 0;
        assert!(config.validate().is_err());

        // Disabling bumping makes the same settings acceptable.
        config.fee.bump_threshold = 0;
        config.validate().unwrap();
    }

    #[test]
    fn per_account_ceiling_never_exceeds_global() {
        let account = Address::with_last_byte(7);
        let mut config = FeeConfig::default();
        config.per_account_price_max.insert(account, config.price_max * 2);
        assert_eq!(config.price_max_for(&account), config.price_max);

        config.per_account_price_max.insert(account, 10);
        assert_eq!(config.price_max_for(&account), 10);
    }
}
