use rlp_derive::RlpEncodable;

use crate::common::{Addr, Bloom, Bytes, Gas, Hash, Wei};

/// A log entry as emitted by execution.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Log {
    pub address: Addr,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

impl Log {
    pub fn new(address: Addr, topics: Vec<Hash>, data: Bytes) -> Self {
        Self {
            address,
            topics,
            data,
        }
    }

    pub fn accrue_bloom(&self, bloom: &mut Bloom) {
        bloom.accrue(self.address.as_bytes());
        for t in self.topics.iter() {
            bloom.accrue(t.as_bytes());
        }
    }
}

/// A log together with where it was mined.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FilteredLog {
    pub log: Log,
    pub block_hash: Hash,
    pub block_number: u64,
    pub transaction_hash: Hash,
    pub transaction_index: u32,
    /// Position within the block, counted across all of its transactions.
    pub log_index: u32,
    pub removed: bool,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Receipt {
    pub status: bool,
    pub cumulative_gas_used: Gas,
    pub logs_bloom: Bloom,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn new(
        status: bool, cumulative_gas_used: Gas, logs: Vec<Log>,
    ) -> Self {
        let mut logs_bloom = Bloom::default();
        for log in logs.iter() {
            log.accrue_bloom(&mut logs_bloom);
        }
        Self {
            status,
            cumulative_gas_used,
            logs_bloom,
            logs,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReceiptInfo {
    pub receipt: Receipt,
    pub tx_hash: Hash,
    pub block_hash: Hash,
    pub block_number: u64,
    pub transaction_index: u32,
    pub gas_used: Gas,
    pub contract_address: Option<Addr>,
    pub effective_gas_price: Wei,
}

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable)]
pub struct TransactionLocation {
    pub block_hash: Hash,
    pub block_number: u64,
    pub transaction_index: u32,
}
