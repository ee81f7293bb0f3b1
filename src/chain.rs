use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::block::SealedBlock;
use crate::common::{Addr, Bloom, Gas, Hash, Wei, U256};
use crate::receipt::{FilteredLog, ReceiptInfo, TransactionLocation};
use crate::state::StateView;
use crate::tx::Tx;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    pub parent_hash: Hash,
    pub coinbase: Addr,
    pub state_root: Hash,
    pub transactions_root: Hash,
    pub receipts_root: Hash,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: Gas,
    pub gas_used: Gas,
    pub timestamp: u64,
    pub prev_randao: Hash,
    pub base_fee: Wei,
}

impl BlockHeader {
    /// `keccak(rlp(header))`.
    pub fn hash(&self) -> Hash {
        Hash::hash(&rlp::encode(self))
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash,
    pub transactions: Vec<Hash>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent(&self) -> &Hash {
        &self.header.parent_hash
    }
}

pub struct BlockRef(Arc<Block>);

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::ops::Deref for BlockRef {
    type Target = Block;
    fn deref(&self) -> &Block {
        &*self.0
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.number(), self.hash)
    }
}

type LogKey = (u64, u32, u32);

/// The canonical chain and its secondary indices: transactions, receipts,
/// locations, logs and the state after each block.
pub struct Chain {
    blocks: Vec<BlockRef>,
    by_hash: HashMap<Hash, BlockRef>,
    states: Vec<StateView>,
    txs: HashMap<Hash, Arc<Tx>>,
    locations: HashMap<Hash, TransactionLocation>,
    receipts: HashMap<Hash, ReceiptInfo>,
    logs: BTreeMap<LogKey, FilteredLog>,
}

impl Chain {
    pub fn new(genesis: SealedBlock, state: StateView) -> Self {
        let mut chain = Chain {
            blocks: Vec::new(),
            by_hash: HashMap::new(),
            states: Vec::new(),
            txs: HashMap::new(),
            locations: HashMap::new(),
            receipts: HashMap::new(),
            logs: BTreeMap::new(),
        };
        chain.add_block(genesis, state);
        chain
    }

    /// Appends a sealed block on top of the head together with the state it
    /// produced, and indexes its transactions, receipts and logs.
    pub fn add_block(
        &mut self, sealed: SealedBlock, state: StateView,
    ) -> BlockRef {
        debug_assert!(self
            .blocks
            .last()
            .map(|h| h.hash == *sealed.block.parent() &&
                h.number() + 1 == sealed.block.number())
            .unwrap_or(sealed.block.number() == 0));
        let SealedBlock {
            block,
            txs,
            receipts,
            logs,
            ..
        } = sealed;
        let block = BlockRef(Arc::new(block));
        for (tx, receipt) in txs.into_iter().zip(receipts.into_iter()) {
            let hash = tx.hash().clone();
            self.locations.insert(
                hash.clone(),
                TransactionLocation {
                    block_hash: block.hash.clone(),
                    block_number: block.number(),
                    transaction_index: receipt.transaction_index,
                },
            );
            self.receipts.insert(hash.clone(), receipt);
            self.txs.insert(hash, tx);
        }
        for log in logs.into_iter() {
            let key = (log.block_number, log.transaction_index, log.log_index);
            self.logs.insert(key, log);
        }
        self.by_hash.insert(block.hash.clone(), block.clone());
        self.blocks.push(block.clone());
        self.states.push(state);
        block
    }

    /// Drops every block above `number` and everything indexed from them.
    /// Returns the dropped blocks, highest first.
    pub fn truncate(&mut self, number: u64) -> Vec<BlockRef> {
        let keep = (number as usize + 1).max(1);
        let mut dropped = Vec::new();
        while self.blocks.len() > keep {
            let block = match self.blocks.pop() {
                Some(b) => b,
                None => break,
            };
            self.states.pop();
            self.by_hash.remove(&block.hash);
            for h in block.transactions.iter() {
                self.locations.remove(h);
                self.receipts.remove(h);
                self.txs.remove(h);
            }
            dropped.push(block);
        }
        let first_dropped = (number + 1, 0, 0);
        let _ = self.logs.split_off(&first_dropped);
        dropped
    }

    pub fn head(&self) -> &BlockRef {
        // never empty: `new` always installs a genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn head_number(&self) -> u64 {
        self.head().number()
    }

    /// State after the head block.
    pub fn head_state(&self) -> &StateView {
        &self.states[self.states.len() - 1]
    }

    /// Replaces the state published for the head (fixture writes between
    /// blocks land here).
    pub fn set_head_state(&mut self, state: StateView) {
        if let Some(s) = self.states.last_mut() {
            *s = state
        }
    }

    pub fn state_at(&self, number: u64) -> Option<&StateView> {
        self.states.get(number as usize)
    }

    pub fn block_by_number(&self, number: u64) -> Option<BlockRef> {
        self.blocks.get(number as usize).cloned()
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<BlockRef> {
        self.by_hash.get(hash).cloned()
    }

    pub fn transaction(&self, hash: &Hash) -> Option<Arc<Tx>> {
        self.txs.get(hash).cloned()
    }

    pub fn location(&self, hash: &Hash) -> Option<&TransactionLocation> {
        self.locations.get(hash)
    }

    pub fn receipt(&self, hash: &Hash) -> Option<&ReceiptInfo> {
        self.receipts.get(hash)
    }

    /// Logs of blocks `from..=to` in (block, tx, log) order.
    pub fn logs_in_range(
        &self, from: u64, to: u64,
    ) -> impl Iterator<Item = &FilteredLog> {
        let range = if from <= to {
            Some((from, 0, 0)..=(to, u32::MAX, u32::MAX))
        } else {
            None
        };
        range.into_iter().flat_map(move |r| self.logs.range(r).map(|(_, l)| l))
    }

    /// Hashes of blocks `from..=to`.
    pub fn block_hashes(&self, from: u64, to: u64) -> Vec<Hash> {
        (from..=to)
            .filter_map(|n| self.blocks.get(n as usize))
            .map(|b| b.hash.clone())
            .collect()
    }
}
