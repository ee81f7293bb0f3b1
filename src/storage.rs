//! Write-through persistence of chain records into an ordered key/value
//! store.
//!
//! Every key is a one-byte record prefix followed by fixed-width big-endian
//! fields, so the lexicographic key order the backend sorts by is the numeric
//! order of blocks, transactions and logs:
//!
//! | prefix | key                                   | value               |
//! |--------|---------------------------------------|---------------------|
//! | `h`    | number (32)                           | header              |
//! | `n`    | block hash                            | number (32)         |
//! | `b`    | number (32)                           | `[tx hashes]`       |
//! | `r`    | tx hash                               | receipt info        |
//! | `t`    | tx hash                               | tx location         |
//! | `l`    | number (32) ‖ tx index (4) ‖ log (4)  | filtered log        |
//! | `a`    | address                               | account             |
//! | `s`    | address ‖ slot                        | value (32)          |
//! | `c`    | code hash                             | code                |
//! | `f`    | filter id                             | filter state        |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::SealedBlock;
use crate::chain::BlockHeader;
use crate::codec::{decode, encode};
use crate::common::{checked_as_u64, Addr, Bytes32, Hash, U256};
use crate::error::{ChainError, ChainResult, CodecError};
use crate::filter::FilterState;
use crate::receipt::{FilteredLog, ReceiptInfo, TransactionLocation};
use crate::state::{Account, StateR, StateView};

pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied atomically by [KvStore::write_batch].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value))
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// An ordered byte-keyed store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>>;
    fn write_batch(&self, batch: WriteBatch) -> ChainResult<()>;
    /// Entries with `start <= key < end`, in key order.
    fn scan(
        &self, start: &[u8], end: &[u8],
    ) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory [KvStore].
#[derive(Default)]
pub struct MemKv(RwLock<BTreeMap<Vec<u8>, Vec<u8>>>);

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.0.read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> ChainResult<()> {
        let mut map = self.0.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn scan(
        &self, start: &[u8], end: &[u8],
    ) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new())
        }
        Ok(self
            .0
            .read()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

pub mod keys {
    use super::*;

    pub const HEADER: u8 = b'h';
    pub const NUMBER: u8 = b'n';
    pub const BODY: u8 = b'b';
    pub const RECEIPT: u8 = b'r';
    pub const LOCATION: u8 = b't';
    pub const LOG: u8 = b'l';
    pub const ACCOUNT: u8 = b'a';
    pub const STORAGE: u8 = b's';
    pub const CODE: u8 = b'c';
    pub const FILTER: u8 = b'f';

    /// 32-byte big-endian block number.
    pub fn number_bytes(n: u64) -> Bytes32 {
        (&U256::from(n)).into()
    }

    fn key(prefix: u8, parts: &[&[u8]]) -> Vec<u8> {
        let mut k =
            Vec::with_capacity(1 + parts.iter().map(|p| p.len()).sum::<usize>());
        k.push(prefix);
        for p in parts {
            k.extend_from_slice(p);
        }
        k
    }

    pub fn header(n: u64) -> Vec<u8> {
        key(HEADER, &[&number_bytes(n)[..]])
    }

    pub fn number(hash: &Hash) -> Vec<u8> {
        key(NUMBER, &[hash.as_bytes()])
    }

    pub fn body(n: u64) -> Vec<u8> {
        key(BODY, &[&number_bytes(n)[..]])
    }

    pub fn receipt(tx: &Hash) -> Vec<u8> {
        key(RECEIPT, &[tx.as_bytes()])
    }

    pub fn location(tx: &Hash) -> Vec<u8> {
        key(LOCATION, &[tx.as_bytes()])
    }

    pub fn log(n: u64, tx_index: u32, log_index: u32) -> Vec<u8> {
        key(LOG, &[
            &number_bytes(n)[..],
            &tx_index.to_be_bytes(),
            &log_index.to_be_bytes(),
        ])
    }

    pub fn account(addr: &Addr) -> Vec<u8> {
        key(ACCOUNT, &[addr.as_bytes()])
    }

    pub fn storage(addr: &Addr, slot: &Hash) -> Vec<u8> {
        key(STORAGE, &[addr.as_bytes(), slot.as_bytes()])
    }

    pub fn code(hash: &Hash) -> Vec<u8> {
        key(CODE, &[hash.as_bytes()])
    }

    pub fn filter(id: &str) -> Vec<u8> {
        key(FILTER, &[id.as_bytes()])
    }

    fn exact<const N: usize>(
        bytes: &[u8], field: &'static str,
    ) -> Result<[u8; N], CodecError> {
        bytes.try_into().map_err(|_| CodecError::Length {
            field,
            expected: N,
            found: bytes.len(),
        })
    }

    /// Address of an `a` key.
    pub fn parse_account(key: &[u8]) -> Result<Addr, CodecError> {
        let addr: [u8; 20] =
            exact(key.get(1..).unwrap_or(&[]), "account key")?;
        Ok(addr.into())
    }

    /// Address and slot of an `s` key.
    pub fn parse_storage(key: &[u8]) -> Result<(Addr, Hash), CodecError> {
        let body: [u8; 52] =
            exact(key.get(1..).unwrap_or(&[]), "storage key")?;
        let mut addr = [0u8; 20];
        let mut slot = [0u8; 32];
        addr.copy_from_slice(&body[..20]);
        slot.copy_from_slice(&body[20..]);
        Ok((addr.into(), slot.into()))
    }

    /// A stored big-endian word of at most 32 bytes.
    pub fn parse_word(
        bytes: &[u8], field: &'static str,
    ) -> Result<U256, CodecError> {
        if bytes.len() > 32 {
            return Err(CodecError::Length {
                field,
                expected: 32,
                found: bytes.len(),
            })
        }
        Ok(U256::from_big_endian(bytes))
    }

    /// Smallest key strictly above every key starting with `prefix`.
    pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
        let mut end = prefix.to_vec();
        while let Some(last) = end.pop() {
            if last < 0xff {
                end.push(last + 1);
                return end
            }
        }
        // all 0xff: unbounded
        vec![0xff; prefix.len() + 1]
    }
}

/// Typed records over a [KvStore].
#[derive(Clone)]
pub struct ChainStorage {
    kv: Arc<dyn KvStore>,
}

impl ChainStorage {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    fn get_record<T: crate::codec::Decode>(
        &self, key: &[u8],
    ) -> ChainResult<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes a sealed block with its receipts, locations and logs, plus the
    /// accounts it touched as seen in `state`.
    pub fn put_sealed_block(
        &self, sealed: &SealedBlock, state: &StateView,
    ) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        let number = sealed.block.number();
        batch.put(keys::header(number), encode(&sealed.block.header));
        batch.put(
            keys::number(&sealed.block.hash),
            keys::number_bytes(number).to_vec(),
        );
        let mut s = rlp::RlpStream::new_list(sealed.block.transactions.len());
        for h in sealed.block.transactions.iter() {
            s.append(h);
        }
        batch.put(keys::body(number), s.out().to_vec());
        for info in sealed.receipts.iter() {
            batch.put(keys::receipt(&info.tx_hash), encode(info));
            batch.put(
                keys::location(&info.tx_hash),
                encode(&TransactionLocation {
                    block_hash: info.block_hash.clone(),
                    block_number: info.block_number,
                    transaction_index: info.transaction_index,
                }),
            );
        }
        for log in sealed.logs.iter() {
            batch.put(
                keys::log(number, log.transaction_index, log.log_index),
                encode(log),
            );
        }
        self.stage_accounts(&mut batch, sealed.touched.iter(), state)?;
        self.kv.write_batch(batch)
    }

    /// Stages the current records of `addrs`: account, code and the full
    /// storage (stale slots are deleted).
    fn stage_accounts<'a>(
        &self, batch: &mut WriteBatch, addrs: impl Iterator<Item = &'a Addr>,
        state: &StateView,
    ) -> ChainResult<()> {
        for addr in addrs {
            let acc = match state.account(addr) {
                Some(acc) => acc,
                None => continue,
            };
            if acc.has_code() {
                if let Some(code) = state.code_by_hash(&acc.code_hash) {
                    batch.put(keys::code(&acc.code_hash), code.to_vec());
                }
            }
            batch.put(keys::account(addr), encode(&acc));

            let prefix = [&[keys::STORAGE][..], addr.as_bytes()].concat();
            let live = state.storage_entries(addr);
            for (k, _) in self.kv.scan(&prefix, &keys::prefix_end(&prefix))? {
                let (_, slot) = keys::parse_storage(&k)?;
                if !live.contains_key(&slot) {
                    batch.delete(k)
                }
            }
            for (slot, val) in live.iter() {
                let val: Bytes32 = val.into();
                batch.put(keys::storage(addr, slot), val.to_vec());
            }
        }
        Ok(())
    }

    /// Persists the given accounts outside of block sealing (fixture writes).
    pub fn put_accounts(
        &self, addrs: &BTreeSet<Addr>, state: &StateView,
    ) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        self.stage_accounts(&mut batch, addrs.iter(), state)?;
        self.kv.write_batch(batch)
    }

    /// Replaces every persisted account with the contents of `state`.
    pub fn put_state(&self, state: &StateView) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        let accounts = state.accounts();
        for (k, _) in self.kv.scan(&[keys::ACCOUNT], &[keys::ACCOUNT + 1])? {
            let addr = keys::parse_account(&k)?;
            if !accounts.contains_key(&addr) {
                batch.delete(k);
            }
        }
        for (k, _) in self.kv.scan(&[keys::STORAGE], &[keys::STORAGE + 1])? {
            let (addr, _) = keys::parse_storage(&k)?;
            if !accounts.contains_key(&addr) {
                batch.delete(k);
            }
        }
        self.stage_accounts(&mut batch, accounts.keys(), state)?;
        self.kv.write_batch(batch)
    }

    pub fn header(&self, number: u64) -> ChainResult<Option<BlockHeader>> {
        self.get_record(&keys::header(number))
    }

    pub fn block_number(&self, hash: &Hash) -> ChainResult<Option<u64>> {
        match self.kv.get(&keys::number(hash))? {
            Some(b) => {
                Ok(checked_as_u64(&keys::parse_word(&b, "block number")?))
            }
            None => Ok(None),
        }
    }

    pub fn header_by_hash(
        &self, hash: &Hash,
    ) -> ChainResult<Option<BlockHeader>> {
        match self.block_number(hash)? {
            Some(n) => self.header(n),
            None => Ok(None),
        }
    }

    pub fn block_transactions(&self, number: u64) -> ChainResult<Vec<Hash>> {
        Ok(self.get_record(&keys::body(number))?.unwrap_or_default())
    }

    pub fn receipt(&self, tx: &Hash) -> ChainResult<Option<ReceiptInfo>> {
        self.get_record(&keys::receipt(tx))
    }

    pub fn location(
        &self, tx: &Hash,
    ) -> ChainResult<Option<TransactionLocation>> {
        self.get_record(&keys::location(tx))
    }

    /// Logs of blocks `from..=to` with a single range scan.
    pub fn logs_in_range(
        &self, from: u64, to: u64,
    ) -> ChainResult<Vec<FilteredLog>> {
        if from > to {
            return Ok(Vec::new())
        }
        let end = match to.checked_add(1) {
            Some(n) => keys::log(n, 0, 0),
            None => vec![keys::LOG + 1],
        };
        self.kv
            .scan(&keys::log(from, 0, 0), &end)?
            .into_iter()
            .map(|(_, v)| decode(&v).map_err(ChainError::from))
            .collect()
    }

    pub fn account(&self, addr: &Addr) -> ChainResult<Option<Account>> {
        self.get_record(&keys::account(addr))
    }

    pub fn storage(&self, addr: &Addr, slot: &Hash) -> ChainResult<U256> {
        match self.kv.get(&keys::storage(addr, slot))? {
            Some(b) => Ok(keys::parse_word(&b, "storage value")?),
            None => Ok(U256::zero()),
        }
    }

    pub fn code(&self, hash: &Hash) -> ChainResult<Option<Vec<u8>>> {
        self.kv.get(&keys::code(hash))
    }

    pub fn put_filter(&self, state: &FilterState) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(keys::filter(&state.id), encode(state));
        self.kv.write_batch(batch)
    }

    pub fn filter(&self, id: &str) -> ChainResult<Option<FilterState>> {
        self.get_record(&keys::filter(id))
    }

    pub fn delete_filter(&self, id: &str) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete(keys::filter(id));
        self.kv.write_batch(batch)
    }

    /// Deletes blocks `from..=to` and everything indexed under them.
    pub fn delete_blocks(&self, from: u64, to: u64) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        for n in from..=to {
            if let Some(header) = self.header(n)? {
                batch.delete(keys::number(&header.hash()));
            }
            for tx in self.block_transactions(n)? {
                batch.delete(keys::receipt(&tx));
                batch.delete(keys::location(&tx));
            }
            batch.delete(keys::header(n));
            batch.delete(keys::body(n));
        }
        let end = match to.checked_add(1) {
            Some(n) => keys::log(n, 0, 0),
            None => vec![keys::LOG + 1],
        };
        for (k, _) in self.kv.scan(&keys::log(from, 0, 0), &end)? {
            batch.delete(k);
        }
        log::debug!("storage: dropping blocks {}..={}", from, to);
        self.kv.write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockContext, PendingBlock};
    use crate::common::Bytes;
    use crate::processor::{ExecutionResult, TxStatus};
    use crate::receipt::Log;
    use crate::state::{MemState, StateW};
    use crate::tx::{TxFee, TxRequest};

    #[test]
    fn test_key_order_is_numeric() {
        assert!(keys::header(255) < keys::header(256));
        assert!(keys::header(1) < keys::header(u64::MAX));
        assert!(keys::log(7, u32::MAX, u32::MAX) < keys::log(8, 0, 0));
        assert!(keys::log(7, 1, 300) < keys::log(7, 2, 0));
        assert!(keys::log(7, 1, 255) < keys::log(7, 1, 256));
        assert_eq!(keys::header(1).len(), 33);
        assert_eq!(keys::log(1, 2, 3).len(), 41);
        assert_eq!(keys::prefix_end(b"ab"), b"ac".to_vec());
        assert_eq!(keys::prefix_end(&[1, 0xff]), vec![2]);
    }

    #[test]
    fn test_memkv_scan() {
        let kv = MemKv::new();
        let mut batch = WriteBatch::default();
        for n in [3u64, 1, 256, 2] {
            batch.put(keys::header(n), vec![n as u8]);
        }
        batch.put(keys::body(1), vec![]);
        kv.write_batch(batch).unwrap();
        let got: Vec<u8> = kv
            .scan(&keys::header(1), &keys::header(257))
            .unwrap()
            .into_iter()
            .map(|(_, v)| v[0])
            .collect();
        assert_eq!(got, vec![1, 2, 3, 0]);
        assert!(kv.scan(&keys::header(5), &keys::header(5)).unwrap().is_empty());

        let mut batch = WriteBatch::default();
        batch.delete(keys::header(3));
        kv.write_batch(batch).unwrap();
        assert_eq!(kv.get(&keys::header(3)).unwrap(), None);
        assert_eq!(kv.len(), 4);
    }

    fn seal(
        state: &mut MemState, ctx: BlockContext, logs_per_tx: &[usize],
    ) -> SealedBlock {
        let key = libsecp256k1::SecretKey::parse(&[5; 32]).unwrap();
        let mut pending = PendingBlock::new(ctx, 100);
        for (nonce, n) in logs_per_tx.iter().enumerate() {
            let tx = TxRequest {
                chain_id: Some(1),
                nonce: nonce as u64,
                gas_limit: 21_000,
                fee: TxFee::Legacy {
                    gas_price: 1u64.into(),
                },
                to: Some(Addr::from([8; 20])),
                ..Default::default()
            }
            .sign(&key)
            .unwrap();
            let result = ExecutionResult {
                tx_hash: tx.hash().clone(),
                status: TxStatus::Success,
                gas_used: 21_000,
                return_data: Bytes::empty(),
                logs: (0..*n)
                    .map(|i| {
                        Log::new(
                            Addr::from([8; 20]),
                            vec![Hash::from(i as u64)],
                            Bytes::empty(),
                        )
                    })
                    .collect(),
                contract_address: None,
                effective_gas_price: 1u64.into(),
            };
            pending.append(Arc::new(tx), result).unwrap();
        }
        pending.finalize(state, true)
    }

    #[test]
    fn test_sealed_block_roundtrip() {
        let storage = ChainStorage::new(Arc::new(MemKv::new()));
        let mut state = MemState::new();
        let a = Addr::from([1; 20]);
        state.set_balance(&a, 10u64.into());
        state.set_storage(&a, &Hash::from(1u64), 5u64.into());
        state.set_code(&a, &[0x60, 0x00]);

        let b1 = seal(
            &mut state,
            BlockContext {
                number: 1,
                ..Default::default()
            },
            &[2, 1],
        );
        storage.put_sealed_block(&b1, &state.committed_view()).unwrap();

        assert_eq!(storage.header(1).unwrap(), Some(b1.block.header.clone()));
        assert_eq!(storage.block_number(&b1.block.hash).unwrap(), Some(1));
        assert_eq!(
            storage.block_transactions(1).unwrap(),
            b1.block.transactions
        );
        let tx0 = &b1.block.transactions[0];
        assert_eq!(storage.receipt(tx0).unwrap().as_ref(), Some(&b1.receipts[0]));
        assert_eq!(
            storage.location(tx0).unwrap().map(|l| l.block_number),
            Some(1)
        );
        assert_eq!(storage.logs_in_range(0, 5).unwrap(), b1.logs);
        let acc = storage.account(&a).unwrap().unwrap();
        assert_eq!(acc.balance, 10u64.into());
        assert_eq!(
            storage.storage(&a, &Hash::from(1u64)).unwrap(),
            U256::from(5u64)
        );
        assert_eq!(
            storage.code(&acc.code_hash).unwrap(),
            Some(vec![0x60, 0x00])
        );

        // clearing a slot removes the persisted key
        state.set_storage(&a, &Hash::from(1u64), U256::zero());
        let b2 = seal(
            &mut state,
            BlockContext {
                number: 2,
                ..Default::default()
            },
            &[],
        );
        storage.put_sealed_block(&b2, &state.committed_view()).unwrap();
        assert!(storage.storage(&a, &Hash::from(1u64)).unwrap().is_zero());

        storage.delete_blocks(1, 2).unwrap();
        assert_eq!(storage.header(1).unwrap(), None);
        assert_eq!(storage.receipt(tx0).unwrap(), None);
        assert!(storage.logs_in_range(0, 5).unwrap().is_empty());
    }

    #[test]
    fn test_filter_records() {
        let storage = ChainStorage::new(Arc::new(MemKv::new()));
        let f = FilterState {
            id: "0x2".into(),
            kind: crate::filter::FilterKind::Block,
            log_filter: None,
            last_checked_block: 3,
            created_at: 9,
        };
        storage.put_filter(&f).unwrap();
        assert_eq!(storage.filter("0x2").unwrap(), Some(f));
        storage.delete_filter("0x2").unwrap();
        assert_eq!(storage.filter("0x2").unwrap(), None);
    }

    #[test]
    fn test_put_state_replaces_accounts() {
        let kv = Arc::new(MemKv::new());
        let storage = ChainStorage::new(kv.clone());
        let mut state = MemState::new();
        let (a, b) = (Addr::from([1; 20]), Addr::from([2; 20]));
        state.set_balance(&a, 1u64.into());
        state.commit();
        let snap = state.take_snapshot();
        state.set_balance(&b, 2u64.into());
        state.set_storage(&b, &Hash::from(4u64), 4u64.into());
        state.commit();
        storage.put_state(&state.committed_view()).unwrap();
        assert!(storage.account(&b).unwrap().is_some());

        state.revert_to_snapshot(snap).unwrap();
        storage.put_state(&state.committed_view()).unwrap();
        assert!(storage.account(&b).unwrap().is_none());
        assert!(storage.storage(&b, &Hash::from(4u64)).unwrap().is_zero());
        assert!(storage.account(&a).unwrap().is_some());
    }

    #[test]
    fn test_malformed_records_are_errors() {
        let kv = Arc::new(MemKv::new());
        let storage = ChainStorage::new(kv.clone());
        let addr = Addr::from([3; 20]);
        let slot = Hash::from(1u64);
        let block = Hash::from(2u64);
        let mut batch = WriteBatch::default();
        batch.put(keys::storage(&addr, &slot), vec![1; 33]);
        batch.put(keys::number(&block), vec![0; 40]);
        kv.write_batch(batch).unwrap();
        assert!(matches!(
            storage.storage(&addr, &slot),
            Err(ChainError::Codec(CodecError::Length {
                expected: 32,
                found: 33,
                ..
            }))
        ));
        assert!(matches!(
            storage.block_number(&block),
            Err(ChainError::Codec(CodecError::Length { found: 40, .. }))
        ));

        // keys of the wrong width under the account and storage prefixes
        let mut batch = WriteBatch::default();
        batch.delete(keys::storage(&addr, &slot));
        batch.put(vec![keys::ACCOUNT, 7, 7], vec![]);
        kv.write_batch(batch).unwrap();
        assert!(matches!(
            storage.put_state(&MemState::new().committed_view()),
            Err(ChainError::Codec(CodecError::Length {
                field: "account key",
                found: 2,
                ..
            }))
        ));
        let mut batch = WriteBatch::default();
        batch.delete(vec![keys::ACCOUNT, 7, 7]);
        batch.put(vec![keys::STORAGE, 7], vec![]);
        kv.write_batch(batch).unwrap();
        assert!(matches!(
            storage.put_state(&MemState::new().committed_view()),
            Err(ChainError::Codec(CodecError::Length {
                field: "storage key",
                found: 1,
                ..
            }))
        ));

        assert_eq!(
            keys::parse_storage(&keys::storage(&addr, &slot)).unwrap(),
            (addr.clone(), slot)
        );
        assert_eq!(keys::parse_account(&keys::account(&addr)).unwrap(), addr);
    }
}
