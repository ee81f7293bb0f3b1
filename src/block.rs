use std::collections::BTreeSet;
use std::sync::Arc;

use rlp::{Encodable, RlpStream};

use crate::chain::{Block, BlockHeader};
use crate::common::{Addr, Bloom, Gas, Hash, Wei, U256};
use crate::error::ChainError;
use crate::processor::ExecutionResult;
use crate::receipt::{FilteredLog, Receipt, ReceiptInfo};
use crate::state::{state_root, MemState};
use crate::tx::Tx;

/// Everything execution may observe about the block being built.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockContext {
    pub number: u64,
    pub parent_hash: Hash,
    pub timestamp: u64,
    pub coinbase: Addr,
    pub gas_limit: Gas,
    pub base_fee: Wei,
    pub chain_id: u64,
    pub difficulty: U256,
    pub prev_randao: Hash,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 0,
            parent_hash: Hash::zero().clone(),
            timestamp: 0,
            coinbase: Addr::zero().clone(),
            gas_limit: 30_000_000,
            base_fee: Wei::default(),
            chain_id: 1337,
            difficulty: U256::one(),
            prev_randao: Hash::zero().clone(),
        }
    }
}

impl BlockContext {
    /// Context of the block after `parent`; the remaining fields are copied
    /// from `self`.
    pub fn child_of(&self, parent: &Block) -> Self {
        let number = parent.number() + 1;
        let mut seed = parent.hash.as_bytes().to_vec();
        seed.extend_from_slice(&number.to_be_bytes());
        Self {
            number,
            parent_hash: parent.hash.clone(),
            timestamp: self.timestamp.max(parent.header.timestamp),
            prev_randao: Hash::hash(&seed),
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockPhase {
    Empty,
    Accumulating,
    Finalizing,
    Finalized,
}

/// A finalized block together with everything it produced.
#[derive(Clone, Debug)]
pub struct SealedBlock {
    pub block: Block,
    pub txs: Vec<Arc<Tx>>,
    /// One per transaction, in block order.
    pub receipts: Vec<ReceiptInfo>,
    pub logs: Vec<FilteredLog>,
    /// Accounts written since the previous commit.
    pub touched: BTreeSet<Addr>,
}

/// The block under construction.
#[derive(Clone)]
pub struct PendingBlock {
    ctx: BlockContext,
    phase: BlockPhase,
    txs: Vec<Arc<Tx>>,
    results: Vec<ExecutionResult>,
    gas_used: Gas,
    max_txs: usize,
    /// The timestamp was set explicitly and must not be refreshed.
    pinned_timestamp: bool,
    /// Timestamps never go below the parent's.
    min_timestamp: u64,
}

impl PendingBlock {
    pub fn new(ctx: BlockContext, max_txs: usize) -> Self {
        let min_timestamp = ctx.timestamp;
        Self {
            ctx,
            phase: BlockPhase::Empty,
            txs: Vec::new(),
            results: Vec::new(),
            gas_used: 0,
            max_txs,
            pinned_timestamp: false,
            min_timestamp,
        }
    }

    /// Fixes the timestamp for this block regardless of the clock.
    pub fn pin_timestamp(&mut self, timestamp: u64) {
        self.ctx.timestamp = timestamp.max(self.min_timestamp);
        self.pinned_timestamp = true;
    }

    pub fn set_base_fee(&mut self, base_fee: Wei) {
        self.ctx.base_fee = base_fee;
    }

    pub fn set_coinbase(&mut self, coinbase: Addr) {
        self.ctx.coinbase = coinbase;
    }

    /// Refreshes the timestamp while no transaction has been accepted.
    pub fn touch(&mut self, now: u64) {
        if self.phase == BlockPhase::Empty && !self.pinned_timestamp {
            self.ctx.timestamp = now.max(self.min_timestamp);
        }
    }

    pub fn context(&self) -> &BlockContext {
        &self.ctx
    }

    pub fn phase(&self) -> BlockPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn gas_used(&self) -> Gas {
        self.gas_used
    }

    pub fn transactions(&self) -> &[Arc<Tx>] {
        &self.txs
    }

    /// Whether a transaction using `gas` can still be included.
    pub fn check_fits(&self, gas: Gas) -> Result<(), ChainError> {
        if self.txs.len() >= self.max_txs {
            return Err(ChainError::BlockFull {
                reason: "transaction count limit",
            })
        }
        match self.gas_used.checked_add(gas) {
            Some(total) if total <= self.ctx.gas_limit => Ok(()),
            _ => Err(ChainError::BlockFull {
                reason: "block gas limit",
            }),
        }
    }

    /// Includes an executed transaction.
    pub fn append(
        &mut self, tx: Arc<Tx>, result: ExecutionResult,
    ) -> Result<(), ChainError> {
        self.check_fits(result.gas_used)?;
        self.gas_used += result.gas_used;
        self.txs.push(tx);
        self.results.push(result);
        self.phase = BlockPhase::Accumulating;
        Ok(())
    }

    /// Seals the block: commits `state`, computes the roots and the header
    /// hash, and locates receipts and logs.
    pub fn finalize(
        mut self, state: &mut MemState, with_state_root: bool,
    ) -> SealedBlock {
        self.phase = BlockPhase::Finalizing;
        let mut cumulative = 0;
        let mut logs_bloom = Bloom::default();
        let receipts: Vec<Receipt> = self
            .results
            .iter()
            .map(|r| {
                cumulative += r.gas_used;
                let receipt =
                    Receipt::new(r.success(), cumulative, r.logs.clone());
                logs_bloom.accrue_bloom(&receipt.logs_bloom);
                receipt
            })
            .collect();

        let touched = state.commit();
        let state_root = if with_state_root {
            state_root(&state.committed_view())
        } else {
            Hash::empty_root().clone()
        };

        let header = BlockHeader {
            parent_hash: self.ctx.parent_hash.clone(),
            coinbase: self.ctx.coinbase.clone(),
            state_root,
            transactions_root: list_root(self.txs.iter().map(|t| &**t)),
            receipts_root: list_root(receipts.iter()),
            logs_bloom,
            difficulty: self.ctx.difficulty,
            number: self.ctx.number,
            gas_limit: self.ctx.gas_limit,
            gas_used: self.gas_used,
            timestamp: self.ctx.timestamp,
            prev_randao: self.ctx.prev_randao.clone(),
            base_fee: self.ctx.base_fee.clone(),
        };
        let hash = header.hash();

        let mut infos = Vec::with_capacity(receipts.len());
        let mut located = Vec::new();
        for (i, (receipt, r)) in
            receipts.into_iter().zip(self.results.into_iter()).enumerate()
        {
            let i = i as u32;
            for log in receipt.logs.iter() {
                located.push(FilteredLog {
                    log: log.clone(),
                    block_hash: hash.clone(),
                    block_number: header.number,
                    transaction_hash: r.tx_hash.clone(),
                    transaction_index: i,
                    log_index: located.len() as u32,
                    removed: false,
                });
            }
            infos.push(ReceiptInfo {
                receipt,
                tx_hash: r.tx_hash,
                block_hash: hash.clone(),
                block_number: header.number,
                transaction_index: i,
                gas_used: r.gas_used,
                contract_address: r.contract_address,
                effective_gas_price: r.effective_gas_price,
            });
        }

        self.phase = BlockPhase::Finalized;
        log::debug!(
            "sealed block #{} {} ({} txs, gas {})",
            header.number,
            hash,
            self.txs.len(),
            header.gas_used
        );
        SealedBlock {
            block: Block {
                transactions: self.txs.iter().map(|t| t.hash().clone()).collect(),
                header,
                hash,
            },
            txs: self.txs,
            receipts: infos,
            logs: located,
            touched,
        }
    }
}

/// `keccak(rlp([items...]))`, or the empty-trie constant for no items.
pub fn list_root<'a, T: Encodable + 'a>(
    items: impl ExactSizeIterator<Item = &'a T>,
) -> Hash {
    if items.len() == 0 {
        return Hash::empty_root().clone()
    }
    let mut s = RlpStream::new_list(items.len());
    for item in items {
        s.append(item);
    }
    Hash::hash(&s.out())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::TxStatus;
    use crate::receipt::Log;
    use crate::state::StateW;
    use crate::tx::{TxFee, TxRequest};
    use crate::common::Bytes;

    fn signed(nonce: u64) -> Arc<Tx> {
        let key = libsecp256k1::SecretKey::parse(&[9; 32]).unwrap();
        let tx = TxRequest {
            chain_id: Some(1337),
            nonce,
            gas_limit: 21_000,
            fee: TxFee::Legacy {
                gas_price: 1u64.into(),
            },
            to: Some(Addr::from([1; 20])),
            ..Default::default()
        }
        .sign(&key)
        .unwrap();
        Arc::new(tx)
    }

    fn result(tx: &Tx, gas_used: Gas, logs: usize) -> ExecutionResult {
        ExecutionResult {
            tx_hash: tx.hash().clone(),
            status: TxStatus::Success,
            gas_used,
            return_data: Bytes::empty(),
            logs: (0..logs)
                .map(|i| {
                    Log::new(
                        Addr::from([2; 20]),
                        vec![Hash::from(i as u64)],
                        Bytes::empty(),
                    )
                })
                .collect(),
            contract_address: None,
            effective_gas_price: 1u64.into(),
        }
    }

    #[test]
    fn test_empty_block() {
        let mut state = MemState::new();
        let pending = PendingBlock::new(BlockContext::default(), 10);
        assert_eq!(pending.phase(), BlockPhase::Empty);
        let sealed = pending.finalize(&mut state, true);
        let h = &sealed.block.header;
        assert_eq!(&h.transactions_root, Hash::empty_root());
        assert_eq!(&h.receipts_root, Hash::empty_root());
        assert_eq!(&h.state_root, Hash::empty_root());
        assert_eq!(h.gas_used, 0);
        assert_eq!(h.difficulty, U256::one());
        assert_eq!(sealed.block.hash, h.hash());
        assert!(sealed.receipts.is_empty());
    }

    #[test]
    fn test_block_full() {
        let ctx = BlockContext {
            gas_limit: 50_000,
            ..Default::default()
        };
        let mut pending = PendingBlock::new(ctx.clone(), 10);
        let (a, b, c) = (signed(0), signed(1), signed(2));
        pending.append(a.clone(), result(&a, 21_000, 0)).unwrap();
        pending.append(b.clone(), result(&b, 21_000, 0)).unwrap();
        assert!(matches!(
            pending.append(c.clone(), result(&c, 21_000, 0)),
            Err(ChainError::BlockFull { .. })
        ));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.gas_used(), 42_000);

        let mut small = PendingBlock::new(ctx, 1);
        small.append(a.clone(), result(&a, 21_000, 0)).unwrap();
        assert!(small.check_fits(0).is_err());
    }

    #[test]
    fn test_timestamp_refresh() {
        let ctx = BlockContext {
            timestamp: 100,
            ..Default::default()
        };
        let mut pending = PendingBlock::new(ctx.clone(), 10);
        pending.touch(50);
        assert_eq!(pending.context().timestamp, 100);
        pending.touch(120);
        assert_eq!(pending.context().timestamp, 120);
        let a = signed(0);
        pending.append(a.clone(), result(&a, 21_000, 0)).unwrap();
        assert_eq!(pending.phase(), BlockPhase::Accumulating);
        // no refresh once accumulating
        pending.touch(200);
        assert_eq!(pending.context().timestamp, 120);

        let mut pinned = PendingBlock::new(ctx, 10);
        pinned.pin_timestamp(5_000);
        pinned.touch(6_000);
        assert_eq!(pinned.context().timestamp, 5_000);
    }

    #[test]
    fn test_receipts_and_logs() {
        let mut state = MemState::new();
        state.set_balance(&Addr::from([3; 20]), 7u64.into());
        let mut pending = PendingBlock::new(
            BlockContext {
                number: 4,
                ..Default::default()
            },
            10,
        );
        let (a, b) = (signed(0), signed(1));
        pending.append(a.clone(), result(&a, 21_000, 2)).unwrap();
        pending.append(b.clone(), result(&b, 25_000, 1)).unwrap();
        let sealed = pending.finalize(&mut state, true);

        assert_eq!(sealed.block.header.gas_used, 46_000);
        assert_eq!(sealed.block.transactions, vec![
            a.hash().clone(),
            b.hash().clone()
        ]);
        assert_eq!(sealed.receipts[1].receipt.cumulative_gas_used, 46_000);
        assert_eq!(sealed.receipts[1].transaction_index, 1);
        assert_ne!(&sealed.block.header.state_root, Hash::empty_root());
        let idx: Vec<_> = sealed
            .logs
            .iter()
            .map(|l| (l.transaction_index, l.log_index))
            .collect();
        assert_eq!(idx, vec![(0, 0), (0, 1), (1, 2)]);
        assert!(sealed.logs.iter().all(|l| l.block_number == 4 &&
            l.block_hash == sealed.block.hash));
        assert!(sealed
            .block
            .header
            .logs_bloom
            .contains_input(Addr::from([2; 20]).as_bytes()));
        assert!(state.dirty_accounts().is_empty());
    }

    #[test]
    fn test_child_context() {
        let mut state = MemState::new();
        let parent = PendingBlock::new(
            BlockContext {
                timestamp: 77,
                ..Default::default()
            },
            1,
        )
        .finalize(&mut state, false);
        let child = BlockContext::default().child_of(&parent.block);
        assert_eq!(child.number, 1);
        assert_eq!(child.parent_hash, parent.block.hash);
        assert_eq!(child.timestamp, 77);
        assert_ne!(&child.prev_randao, Hash::zero());
    }
}
