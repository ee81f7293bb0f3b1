//! The dev chain node: one working state, one pending block, the chain of
//! sealed blocks and the filters polling it.
//!
//! Mutations (transactions, mining, snapshots, fixture writes) are serialized
//! by a single async lock over the working state. Readers never take that
//! lock: they go through the chain, which only changes in one short critical
//! section when a block is sealed, a snapshot is reverted or a fixture write
//! is published.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::lock::Mutex;
use log::{debug, error, info, warn};
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::block::{BlockContext, PendingBlock};
use crate::chain::{Block, BlockRef, Chain};
use crate::common::{unix_now, Addr, Bytes, Gas, Hash, Wei, U256};
use crate::config::{DevChainConfig, MiningMode};
use crate::error::{ChainError, ChainResult, TxRejection};
use crate::filter::{query_logs, FilterChanges, FilterRegistry, LogFilter};
use crate::processor::{
    self, CallRequest, ExecutionResult, Executor, TransferExecutor,
};
use crate::receipt::{FilteredLog, ReceiptInfo, TransactionLocation};
use crate::state::{MemState, SnapshotId, StateR, StateView, StateW};
use crate::storage::{ChainStorage, KvStore};
use crate::tx::Tx;

struct NodeSnapshot {
    id: SnapshotId,
    pending: PendingBlock,
    head: u64,
    head_state: StateView,
}

/// Everything a mutation may touch.
struct Working {
    started: bool,
    state: MemState,
    pending: PendingBlock,
    snapshots: Vec<NodeSnapshot>,
    /// Seconds added to the wall clock by `increase_time`.
    time_offset: u64,
    coinbase: Addr,
}

impl Working {
    fn now(&self) -> u64 {
        unix_now().saturating_add(self.time_offset)
    }

    fn ensure_started(&self) -> ChainResult<()> {
        if !self.started {
            return Err(ChainError::NotInitialized)
        }
        Ok(())
    }
}

pub struct DevChainNode {
    config: DevChainConfig,
    mode: MiningMode,
    executor: Arc<dyn Executor>,
    storage: Option<ChainStorage>,
    working: Mutex<Working>,
    chain: RwLock<Option<Chain>>,
    /// Context of the pending block as calls see it. Written under the chain
    /// lock whenever a new head is published.
    pending_ctx: RwLock<BlockContext>,
    filters: SyncMutex<FilterRegistry>,
}

fn cancelled(op: &str) -> ChainError {
    warn!("{} cancelled", op);
    ChainError::Cancelled
}

impl DevChainNode {
    /// A node with the value-transfer executor and no persistence. Fails if
    /// the config does not validate.
    pub fn new(config: DevChainConfig) -> ChainResult<Self> {
        let mode = config.validate()?;
        let placeholder = PendingBlock::new(
            BlockContext::default(),
            config.max_transactions_per_block,
        );
        Ok(Self {
            mode,
            executor: Arc::new(TransferExecutor),
            storage: None,
            working: Mutex::new(Working {
                started: false,
                state: MemState::new(),
                pending: placeholder,
                snapshots: Vec::new(),
                time_offset: 0,
                coinbase: config.coinbase.clone(),
            }),
            chain: RwLock::new(None),
            pending_ctx: RwLock::new(BlockContext::default()),
            filters: SyncMutex::new(FilterRegistry::new()),
            config,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Writes every sealed block, fixture write and filter through to `kv`.
    pub fn with_storage(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.storage = Some(ChainStorage::new(kv));
        self
    }

    pub fn config(&self) -> &DevChainConfig {
        &self.config
    }

    pub fn mining_mode(&self) -> MiningMode {
        self.mode
    }

    pub fn storage(&self) -> Option<&ChainStorage> {
        self.storage.as_ref()
    }

    /// Funds `prefunded` (with `initial_balance`, or the configured default)
    /// and seals the genesis block.
    pub async fn start(
        &self, prefunded: &[Addr], initial_balance: Option<Wei>,
    ) -> ChainResult<BlockRef> {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        if w.started {
            return Err(ChainError::AlreadyStarted)
        }
        let balance = initial_balance
            .unwrap_or_else(|| self.config.initial_balance.clone());
        for addr in prefunded {
            w.state.set_balance(addr, balance.clone());
        }

        let ctx = BlockContext {
            timestamp: w.now(),
            coinbase: w.coinbase.clone(),
            gas_limit: self.config.block_gas_limit,
            base_fee: self.config.base_fee.clone(),
            chain_id: self.config.chain_id,
            ..Default::default()
        };
        let sealed =
            PendingBlock::new(ctx, self.config.max_transactions_per_block)
                .finalize(&mut w.state, self.config.state_root);
        let view = w.state.committed_view();
        if let Some(storage) = &self.storage {
            storage.put_sealed_block(&sealed, &view)?;
        }
        let chain = Chain::new(sealed, view);
        let genesis = chain.head().clone();
        let next = self.next_pending(w, &genesis);
        {
            let mut published = self.chain.write();
            *published = Some(chain);
            *self.pending_ctx.write() = next.context().clone();
        }
        w.pending = next;
        w.started = true;
        info!(
            "devchain started: chain id {}, {:?} mining, {} prefunded accounts, genesis {}",
            self.config.chain_id,
            self.mode,
            prefunded.len(),
            genesis.hash
        );
        Ok(genesis)
    }

    fn next_pending(&self, w: &Working, parent: &Block) -> PendingBlock {
        // timestamp 0 makes the child inherit the parent's as its floor
        let base = BlockContext {
            coinbase: w.coinbase.clone(),
            gas_limit: self.config.block_gas_limit,
            base_fee: self.config.base_fee.clone(),
            chain_id: self.config.chain_id,
            ..Default::default()
        };
        let mut pending = PendingBlock::new(
            base.child_of(parent),
            self.config.max_transactions_per_block,
        );
        pending.touch(w.now());
        pending
    }

    fn publish_pending(&self, w: &Working) {
        *self.pending_ctx.write() = w.pending.context().clone();
    }

    /// Finalizes the pending block, publishes it with its post-state and
    /// opens the next one.
    fn seal(&self, w: &mut Working) -> ChainResult<BlockRef> {
        let placeholder = PendingBlock::new(
            BlockContext::default(),
            self.config.max_transactions_per_block,
        );
        let mut pending = std::mem::replace(&mut w.pending, placeholder);
        pending.touch(w.now());
        let sealed = pending.finalize(&mut w.state, self.config.state_root);
        let view = w.state.committed_view();
        let stored = match &self.storage {
            Some(storage) => storage.put_sealed_block(&sealed, &view),
            None => Ok(()),
        };
        let (block, next) = {
            let mut chain = self.chain.write();
            let chain = chain.as_mut().ok_or(ChainError::NotInitialized)?;
            let block = chain.add_block(sealed, view);
            let next = self.next_pending(w, &block);
            *self.pending_ctx.write() = next.context().clone();
            (block, next)
        };
        w.pending = next;
        debug!(
            "mined block #{} {} ({} txs)",
            block.number(),
            block.hash,
            block.transactions.len()
        );
        if let Err(e) = stored {
            error!("write-through of block #{} failed: {}", block.number(), e);
            return Err(e)
        }
        Ok(block)
    }

    fn seals_on_overflow(&self, w: &Working) -> bool {
        self.mode != MiningMode::Manual && !w.pending.is_empty()
    }

    pub async fn send_transaction(
        &self, tx: Tx,
    ) -> ChainResult<ExecutionResult> {
        self.send_transaction_with_cancel(tx, &CancellationToken::new())
            .await
    }

    /// Executes `tx` into the pending block and seals according to the
    /// mining mode. Rejections and reverts are `Ok` results.
    pub async fn send_transaction_with_cancel(
        &self, tx: Tx, cancel: &CancellationToken,
    ) -> ChainResult<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(cancelled("send_transaction"))
        }
        let mut guard = self.working.lock().await;
        if cancel.is_cancelled() {
            return Err(cancelled("send_transaction"))
        }
        let w = &mut *guard;
        w.ensure_started()?;

        if let Some(got) = tx.chain_id {
            if got != self.config.chain_id {
                let reason = TxRejection::InvalidChainId {
                    expected: self.config.chain_id,
                    got,
                };
                warn!("tx {} rejected: {}", tx.hash(), reason);
                return Ok(ExecutionResult::rejected(tx.hash().clone(), reason))
            }
        }

        let tx = Arc::new(tx);
        let result = loop {
            let now = w.now();
            w.pending.touch(now);
            self.publish_pending(w);
            if let Err(e) = w.pending.check_fits(0) {
                if self.seals_on_overflow(w) {
                    self.seal(w)?;
                    continue
                }
                return Err(e)
            }

            let checkpoint = w.state.take_snapshot();
            let ctx = w.pending.context().clone();
            let result =
                processor::execute(&tx, &mut w.state, &ctx, &*self.executor)
                    .await;
            if let Some(reason) = result.rejection() {
                warn!("tx {} rejected: {}", tx.hash(), reason);
                w.state.release_snapshot(checkpoint)?;
                return Ok(result)
            }
            match w.pending.append(tx.clone(), result.clone()) {
                Ok(()) => {
                    w.state.release_snapshot(checkpoint)?;
                    break result
                }
                Err(e) => {
                    w.state.revert_to_snapshot(checkpoint)?;
                    w.state.release_snapshot(checkpoint)?;
                    if self.seals_on_overflow(w) {
                        debug!("block full, sealing before {}", tx.hash());
                        self.seal(w)?;
                        continue
                    }
                    return Err(e)
                }
            }
        };

        let seal = match self.mode {
            MiningMode::Instant => true,
            MiningMode::Batch(n) => w.pending.len() >= n,
            MiningMode::Manual => false,
        };
        if seal {
            self.seal(w)?;
        }
        Ok(result)
    }

    /// Decodes a signed envelope and submits it.
    pub async fn send_raw_transaction(
        &self, raw: &[u8],
    ) -> ChainResult<ExecutionResult> {
        let tx = Tx::decode(raw)?;
        self.send_transaction(tx).await
    }

    pub async fn call(&self, req: &CallRequest) -> ChainResult<ExecutionResult> {
        self.call_with_cancel(req, &CancellationToken::new()).await
    }

    /// Runs `req` on a throwaway overlay of the requested block's post-state.
    /// Blocks above the head read the head.
    pub async fn call_with_cancel(
        &self, req: &CallRequest, cancel: &CancellationToken,
    ) -> ChainResult<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(cancelled("call"))
        }
        let (view, ctx) = self.call_context(req.block)?;
        if cancel.is_cancelled() {
            return Err(cancelled("call"))
        }
        let mut scratch = MemState::from_view(&view);
        Ok(processor::simulate(req, &mut scratch, &ctx, &*self.executor).await)
    }

    /// Reads only published data, so calls never wait on a mutation.
    fn call_context(
        &self, block: Option<u64>,
    ) -> ChainResult<(StateView, BlockContext)> {
        let guard = self.chain.read();
        let chain = guard.as_ref().ok_or(ChainError::NotInitialized)?;
        if let Some(n) = block.filter(|n| *n < chain.head_number()) {
            if let (Some(view), Some(b)) =
                (chain.state_at(n), chain.block_by_number(n))
            {
                return Ok((view.clone(), context_of(&b, self.config.chain_id)))
            }
        }
        Ok((chain.head_state().clone(), self.pending_ctx.read().clone()))
    }

    /// Intrinsic gas plus whatever the executor reports for `req`.
    pub async fn estimate_gas(&self, req: &CallRequest) -> ChainResult<Gas> {
        Ok(self.call(req).await?.gas_used)
    }

    /// Seals the pending block, empty or not.
    pub async fn mine_block(&self) -> ChainResult<Hash> {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        w.ensure_started()?;
        Ok(self.seal(w)?.hash.clone())
    }

    /// Captures the working state, the pending block and the head.
    pub async fn take_snapshot(&self) -> ChainResult<SnapshotId> {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        w.ensure_started()?;
        let (head, head_state) = self
            .with_chain(|c| (c.head_number(), c.head_state().clone()))
            .ok_or(ChainError::NotInitialized)?;
        let id = w.state.take_snapshot();
        w.snapshots.push(NodeSnapshot {
            id,
            pending: w.pending.clone(),
            head,
            head_state,
        });
        info!(
            "snapshot {} at block #{} with {} pending txs",
            id,
            head,
            w.pending.len()
        );
        Ok(id)
    }

    /// Goes back to snapshot `id`: pending transactions are undone and blocks
    /// mined since are dropped. Newer snapshots become invalid; `id` stays
    /// usable.
    pub async fn revert_to_snapshot(&self, id: SnapshotId) -> ChainResult<()> {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        w.ensure_started()?;
        let pos = w
            .snapshots
            .iter()
            .rposition(|s| s.id == id)
            .ok_or(ChainError::SnapshotNotFound(id))?;
        w.state.revert_to_snapshot(id)?;
        w.snapshots.truncate(pos + 1);
        let snap = &w.snapshots[pos];
        let head = snap.head;
        let head_state = snap.head_state.clone();
        w.pending = snap.pending.clone();

        let (old_head, dropped) = {
            let mut chain = self.chain.write();
            let chain = chain.as_mut().ok_or(ChainError::NotInitialized)?;
            let old_head = chain.head_number();
            let dropped = chain.truncate(head);
            chain.set_head_state(head_state.clone());
            *self.pending_ctx.write() = w.pending.context().clone();
            (old_head, dropped.len())
        };
        self.filters.lock().rewind(head);
        if let Some(storage) = &self.storage {
            if old_head > head {
                storage.delete_blocks(head + 1, old_head)?;
            }
            storage.put_state(&head_state)?;
        }
        info!(
            "reverted to snapshot {}: head #{}, {} blocks dropped",
            id, head, dropped
        );
        Ok(())
    }

    /// Applies a write outside of any transaction and publishes it to
    /// readers right away.
    async fn write_fixture<F>(&self, addr: &Addr, write: F) -> ChainResult<()>
    where
        F: Fn(&mut MemState),
    {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        w.ensure_started()?;
        write(&mut w.state);
        let view = if w.pending.is_empty() {
            w.state.commit();
            w.state.committed_view()
        } else {
            // the pending block's writes must stay unpublished
            let mut scratch = MemState::from_view(&self.head_state());
            write(&mut scratch);
            scratch.commit();
            scratch.committed_view()
        };
        if let Some(chain) = self.chain.write().as_mut() {
            chain.set_head_state(view.clone());
        }
        if let Some(storage) = &self.storage {
            let addrs: BTreeSet<Addr> = std::iter::once(addr.clone()).collect();
            storage.put_accounts(&addrs, &view)?;
        }
        debug!("fixture write to {}", addr);
        Ok(())
    }

    pub async fn set_balance(
        &self, addr: &Addr, balance: Wei,
    ) -> ChainResult<()> {
        self.write_fixture(addr, |s| s.set_balance(addr, balance.clone()))
            .await
    }

    pub async fn set_nonce(&self, addr: &Addr, nonce: u64) -> ChainResult<()> {
        self.write_fixture(addr, |s| s.set_nonce(addr, nonce)).await
    }

    /// Installs runtime code. An account created this way starts at nonce 1,
    /// like a deployed contract.
    pub async fn set_code(&self, addr: &Addr, code: &[u8]) -> ChainResult<()> {
        self.write_fixture(addr, |s| {
            if !s.exists(addr) {
                s.set_nonce(addr, 1);
            }
            s.set_code(addr, code);
        })
        .await
    }

    pub async fn set_storage_at(
        &self, addr: &Addr, slot: &Hash, val: U256,
    ) -> ChainResult<()> {
        self.write_fixture(addr, |s| s.set_storage(addr, slot, val))
            .await
    }

    /// Moves the clock forward. Returns the total offset.
    pub async fn increase_time(&self, secs: u64) -> u64 {
        let mut guard = self.working.lock().await;
        let w = &mut *guard;
        w.time_offset = w.time_offset.saturating_add(secs);
        let now = w.now();
        w.pending.touch(now);
        self.publish_pending(w);
        w.time_offset
    }

    /// Fixes the timestamp of the next sealed block. Clamped to the parent's.
    pub async fn set_next_block_timestamp(
        &self, timestamp: u64,
    ) -> ChainResult<()> {
        let mut guard = self.working.lock().await;
        guard.ensure_started()?;
        guard.pending.pin_timestamp(timestamp);
        self.publish_pending(&guard);
        Ok(())
    }

    /// Base fee of the next sealed block only.
    pub async fn set_next_block_base_fee(&self, fee: Wei) -> ChainResult<()> {
        let mut guard = self.working.lock().await;
        guard.ensure_started()?;
        guard.pending.set_base_fee(fee);
        self.publish_pending(&guard);
        Ok(())
    }

    /// Fee recipient from the next empty block on.
    pub async fn set_coinbase(&self, coinbase: Addr) {
        let mut guard = self.working.lock().await;
        if guard.pending.is_empty() {
            guard.pending.set_coinbase(coinbase.clone());
            self.publish_pending(&guard);
        }
        guard.coinbase = coinbase;
    }

    /// Context the next transaction would execute in.
    pub async fn pending_context(&self) -> BlockContext {
        self.working.lock().await.pending.context().clone()
    }

    /// Hashes of the transactions in the pending block.
    pub async fn pending_transactions(&self) -> Vec<Hash> {
        let guard = self.working.lock().await;
        guard
            .pending
            .transactions()
            .iter()
            .map(|t| t.hash().clone())
            .collect()
    }

    fn with_chain<R>(&self, f: impl FnOnce(&Chain) -> R) -> Option<R> {
        self.chain.read().as_ref().map(f)
    }

    /// Post-state of the head, fixture writes included.
    pub fn head_state(&self) -> StateView {
        self.with_chain(|c| c.head_state().clone())
            .unwrap_or_else(StateView::empty)
    }

    /// Post-state of block `number`, if it exists.
    pub fn state_at(&self, number: u64) -> Option<StateView> {
        self.with_chain(|c| c.state_at(number).cloned()).flatten()
    }

    pub fn get_block_number(&self) -> u64 {
        self.with_chain(|c| c.head_number()).unwrap_or(0)
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<BlockRef> {
        self.with_chain(|c| c.block_by_number(number)).flatten()
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Option<BlockRef> {
        self.with_chain(|c| c.block_by_hash(hash)).flatten()
    }

    pub fn get_balance(&self, addr: &Addr) -> Wei {
        self.head_state().get_balance(addr)
    }

    pub fn get_nonce(&self, addr: &Addr) -> u64 {
        self.head_state().get_nonce(addr)
    }

    pub fn get_code(&self, addr: &Addr) -> Bytes {
        Bytes::from(&self.head_state().get_code(addr)[..])
    }

    pub fn get_storage_at(&self, addr: &Addr, slot: &Hash) -> U256 {
        self.head_state().storage(addr, slot)
    }

    pub fn get_balance_at(&self, addr: &Addr, number: u64) -> Wei {
        self.state_at(number)
            .map(|s| s.get_balance(addr))
            .unwrap_or_default()
    }

    pub fn get_nonce_at(&self, addr: &Addr, number: u64) -> u64 {
        self.state_at(number).map_or(0, |s| s.get_nonce(addr))
    }

    pub fn get_storage_at_block(
        &self, addr: &Addr, slot: &Hash, number: u64,
    ) -> U256 {
        self.state_at(number)
            .map(|s| s.storage(addr, slot))
            .unwrap_or_default()
    }

    pub fn get_transaction_receipt(&self, hash: &Hash) -> Option<ReceiptInfo> {
        self.with_chain(|c| c.receipt(hash).cloned()).flatten()
    }

    pub fn get_transaction_by_hash(
        &self, hash: &Hash,
    ) -> Option<(Arc<Tx>, Option<TransactionLocation>)> {
        self.with_chain(|c| {
            c.transaction(hash).map(|tx| (tx, c.location(hash).cloned()))
        })
        .flatten()
    }

    pub fn get_transaction_location(
        &self, hash: &Hash,
    ) -> Option<TransactionLocation> {
        self.with_chain(|c| c.location(hash).cloned()).flatten()
    }

    /// Matching logs of sealed blocks. Missing bounds mean genesis and head.
    pub fn get_logs(&self, filter: &LogFilter) -> Vec<FilteredLog> {
        self.with_chain(|c| query_logs(filter, c)).unwrap_or_default()
    }

    fn install_filter(
        &self, install: impl FnOnce(&mut FilterRegistry, u64) -> String,
    ) -> ChainResult<String> {
        let guard = self.chain.read();
        let head = guard.as_ref().map_or(0, |c| c.head_number());
        let mut filters = self.filters.lock();
        let id = install(&mut *filters, head);
        self.persist_filter(&filters, &id)?;
        Ok(id)
    }

    fn persist_filter(
        &self, filters: &FilterRegistry, id: &str,
    ) -> ChainResult<()> {
        match (&self.storage, filters.get(id)) {
            (Some(storage), Some(state)) => storage.put_filter(state),
            _ => Ok(()),
        }
    }

    /// Installs a log filter that reports matches from blocks sealed after
    /// the current head.
    pub fn create_filter(&self, filter: LogFilter) -> ChainResult<String> {
        self.install_filter(|f, head| f.create_filter(filter, head, unix_now()))
    }

    pub fn create_block_filter(&self) -> ChainResult<String> {
        self.install_filter(|f, head| f.create_block_filter(head, unix_now()))
    }

    pub fn create_pending_transaction_filter(&self) -> ChainResult<String> {
        self.install_filter(|f, head| {
            f.create_pending_transaction_filter(head, unix_now())
        })
    }

    pub fn get_filter_changes(&self, id: &str) -> ChainResult<FilterChanges> {
        let guard = self.chain.read();
        let chain = guard.as_ref().ok_or(ChainError::NotInitialized)?;
        let mut filters = self.filters.lock();
        let changes = filters.changes(id, chain, unix_now())?;
        self.persist_filter(&filters, id)?;
        Ok(changes)
    }

    pub fn get_filter_logs(&self, id: &str) -> ChainResult<Vec<FilteredLog>> {
        let guard = self.chain.read();
        let chain = guard.as_ref().ok_or(ChainError::NotInitialized)?;
        let filters = self.filters.lock();
        filters.filter_logs(id, chain)
    }

    pub fn uninstall_filter(&self, id: &str) -> bool {
        let removed = self.filters.lock().uninstall(id);
        if removed {
            self.forget_filter(id);
        }
        removed
    }

    /// Drops filters not polled within `ttl` seconds.
    pub fn prune_filters(&self, ttl: u64) -> Vec<String> {
        let pruned = self.filters.lock().prune(unix_now(), ttl);
        for id in pruned.iter() {
            self.forget_filter(id);
        }
        pruned
    }

    fn forget_filter(&self, id: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete_filter(id) {
                warn!("failed to delete filter {}: {}", id, e);
            }
        }
    }
}

/// Execution context reconstructed from a sealed block.
fn context_of(block: &Block, chain_id: u64) -> BlockContext {
    let h = &block.header;
    BlockContext {
        number: h.number,
        parent_hash: h.parent_hash.clone(),
        timestamp: h.timestamp,
        coinbase: h.coinbase.clone(),
        gas_limit: h.gas_limit,
        base_fee: h.base_fee.clone(),
        chain_id,
        difficulty: h.difficulty,
        prev_randao: h.prev_randao.clone(),
    }
}
