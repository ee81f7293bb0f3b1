use serde::Deserialize;

use crate::common::{Addr, Gas, Wei, GWEI};
use crate::error::ConfigError;

/// Node configuration. Every field has a default, so a partial JSON object
/// (or `{}`) is a valid config.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct DevChainConfig {
    pub chain_id: u64,
    pub coinbase: Addr,
    pub block_gas_limit: Gas,
    pub base_fee: Wei,
    pub auto_mine: bool,
    /// Transactions per auto-mined block.
    pub auto_mine_batch_size: usize,
    pub max_transactions_per_block: usize,
    /// Seconds between timed blocks. Only zero is accepted for now.
    pub block_time: u64,
    pub initial_balance: Wei,
    /// Compute post-state roots at finalization.
    pub state_root: bool,
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            coinbase: Addr::zero().clone(),
            block_gas_limit: 30_000_000,
            base_fee: GWEI.into(),
            auto_mine: true,
            auto_mine_batch_size: 1,
            max_transactions_per_block: 100,
            block_time: 0,
            initial_balance: Wei::from_ether(10_000),
            state_root: true,
        }
    }
}

/// When pending blocks get sealed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MiningMode {
    /// Seal after every accepted transaction.
    Instant,
    /// Seal once this many transactions are pending.
    Batch(usize),
    /// Seal only on an explicit `mine_block`.
    Manual,
}

impl DevChainConfig {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_auto_mine(mut self, auto_mine: bool) -> Self {
        self.auto_mine = auto_mine;
        self
    }

    /// Checks the config and derives the mining policy from it.
    pub fn validate(&self) -> Result<MiningMode, ConfigError> {
        if self.block_gas_limit == 0 {
            return Err(ConfigError::Zero("blockGasLimit"))
        }
        if self.max_transactions_per_block == 0 {
            return Err(ConfigError::Zero("maxTransactionsPerBlock"))
        }
        if self.block_time > 0 {
            return Err(ConfigError::UnsupportedMiningMode {
                auto_mine: self.auto_mine,
                block_time: self.block_time,
            })
        }
        Ok(match (self.auto_mine, self.auto_mine_batch_size) {
            (false, _) => MiningMode::Manual,
            (true, 0) => return Err(ConfigError::Zero("autoMineBatchSize")),
            (true, 1) => MiningMode::Instant,
            (true, n) => {
                MiningMode::Batch(n.min(self.max_transactions_per_block))
            }
        })
    }
}
