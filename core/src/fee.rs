use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fee for one transaction attempt, resolved to exactly one pricing model at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Fee {
    /// Single gas price (pre-EIP-1559 chains).
    Legacy { gas_price: u128 },
    /// Tip-cap / fee-cap pair.
    #[serde(rename_all = "camelCase")]
    Dynamic {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl Fee {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Fee::Dynamic { .. })
    }

    /// The most this attempt can pay per unit of gas.
    pub fn cap(&self) -> u128 {
        match self {
            Fee::Legacy { gas_price } => *gas_price,
            Fee::Dynamic {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    pub fn tip(&self) -> Option<u128> {
        match self {
            Fee::Legacy { .. } => None,
            Fee::Dynamic {
                max_priority_fee_per_gas,
                ..
            } => Some(*max_priority_fee_per_gas),
        }
    }

    /// Strict fee ordering within one pricing model. Attempts for one
    /// transaction never mix models, so a cross-variant comparison is a
    /// caller bug surfaced as an error rather than an arbitrary ordering.
    pub fn strictly_above(&self, other: &Fee) -> Result<bool, FeeError> {
        match (self, other) {
            (Fee::Legacy { gas_price: a }, Fee::Legacy { gas_price: b }) => Ok(a > b),
            (
                Fee::Dynamic {
                    max_fee_per_gas: cap_a,
                    max_priority_fee_per_gas: tip_a,
                },
                Fee::Dynamic {
                    max_fee_per_gas: cap_b,
                    max_priority_fee_per_gas: tip_b,
                },
            ) => Ok(cap_a > cap_b || (cap_a == cap_b && tip_a > tip_b)),
            _ => Err(FeeError::VariantMismatch),
        }
    }
}

impl std::fmt::Display for Fee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fee::Legacy { gas_price } => write!(f, "{gas_price} wei"),
            Fee::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(f, "cap {max_fee_per_gas} wei, tip {max_priority_fee_per_gas} wei"),
        }
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeError {
    #[error("cannot compare or bump fees with different pricing models")]
    VariantMismatch,

    #[error(
        "bumped fee of {bumped} wei is equal to original fee of {previous} wei. ACTION REQUIRED: increase the configured bump percent or minimum bump"
    )]
    BumpTooLow { bumped: u128, previous: u128 },

    #[error(
        "bumped fee of {bumped} wei would exceed the configured maximum of {ceiling} wei"
    )]
    Ceiling { bumped: u128, ceiling: u128 },
}

/// Proposes a fee for a fresh attempt and escalates fees for replacements.
///
/// A `bump` result must strictly improve on `previous` or report a structured
/// failure; silently returning an equal fee would stall the bump cycle.
pub trait FeeEstimator: Send + Sync {
    fn quote(&self, ceiling: u128) -> impl Future<Output = Result<Fee, FeeError>> + Send;

    fn bump(
        &self,
        previous: &Fee,
        ceiling: u128,
    ) -> impl Future<Output = Result<Fee, FeeError>> + Send;
}

/// Fixed-price estimator: quotes configured values and bumps by a percentage
/// with an absolute minimum increment. Suitable for tests and chains with
/// stable fee markets.
#[derive(Debug, Clone)]
pub struct FixedFeeEstimator {
    pub gas_price: u128,
    pub tip: u128,
    pub dynamic: bool,
    pub bump_percent: u32,
    pub min_bump_wei: u128,
}

impl FixedFeeEstimator {
    fn bumped_component(&self, previous: u128) -> u128 {
        let by_percent = previous.saturating_mul(100 + self.bump_percent as u128) / 100;
        let by_floor = previous.saturating_add(self.min_bump_wei);
        by_percent.max(by_floor)
    }
}

impl FeeEstimator for FixedFeeEstimator {
    async fn quote(&self, ceiling: u128) -> Result<Fee, FeeError> {
        let fee = if self.dynamic {
            Fee::Dynamic {
                max_fee_per_gas: self.gas_price.min(ceiling),
                max_priority_fee_per_gas: self.tip.min(ceiling),
            }
        } else {
            Fee::Legacy {
                gas_price: self.gas_price.min(ceiling),
            }
        };
        Ok(fee)
    }

    async fn bump(&self, previous: &Fee, ceiling: u128) -> Result<Fee, FeeError> {
        let bumped = match previous {
            Fee::Legacy { gas_price } => Fee::Legacy {
                gas_price: self.bumped_component(*gas_price),
            },
            Fee::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let cap = self.bumped_component(*max_fee_per_gas);
                Fee::Dynamic {
                    max_fee_per_gas: cap,
                    // The tip may never exceed the cap.
                    max_priority_fee_per_gas: self
                        .bumped_component(*max_priority_fee_per_gas)
                        .min(cap),
                }
            }
        };

        if bumped.cap() > ceiling {
            return Err(FeeError::Ceiling {
                bumped: bumped.cap(),
                ceiling,
            });
        }
        if !bumped.strictly_above(previous)? {
            return Err(FeeError::BumpTooLow {
                bumped: bumped.cap(),
                previous: previous.cap(),
            });
        }
        Ok(bumped)
    }
}
