//! Versioned in-memory account store.
//!
//! Writes go to a mutable delta (the "tip"). Taking a snapshot freezes the tip into an immutable
//! revision that points at the revision below it, so a snapshot costs one `Arc` allocation and a
//! revert is a pointer reset: the overlays above the snapshot are simply dropped. Lookups walk from
//! the tip down the chain until the first recorded value.
//!
//! [MemState::commit] squashes every overlay written since the previous commit into a single
//! revision (and, once the chain gets deep, flattens the whole history), so lookups stay short.
//! The committed revision is handed out as a [StateView]: an immutable, cheaply clonable handle
//! that readers can hold while the working state keeps moving.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rlp_derive::RlpEncodable;

use crate::common::{Addr, Hash, Wei, U256};
use crate::error::ChainError;

/// Chains deeper than this get flattened on commit.
const COMPACT_DEPTH: usize = 64;

pub type SnapshotId = u64;

#[derive(Clone, PartialEq, Eq, Debug, RlpEncodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: Wei,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: Wei::zero().clone(),
            storage_root: Hash::empty_root().clone(),
            code_hash: Hash::empty_bytes_hash().clone(),
        }
    }
}

impl Account {
    pub fn has_code(&self) -> bool {
        &self.code_hash != Hash::empty_bytes_hash()
    }
}

/// Read half of the account store.
pub trait StateR {
    fn account(&self, addr: &Addr) -> Option<Account>;
    fn code_by_hash(&self, hash: &Hash) -> Option<Arc<[u8]>>;
    /// Zero when unset.
    fn storage(&self, addr: &Addr, slot: &Hash) -> U256;

    fn get_balance(&self, addr: &Addr) -> Wei {
        self.account(addr).map(|a| a.balance).unwrap_or_default()
    }

    fn get_nonce(&self, addr: &Addr) -> u64 {
        self.account(addr).map(|a| a.nonce).unwrap_or(0)
    }

    fn get_code(&self, addr: &Addr) -> Arc<[u8]> {
        self.account(addr)
            .filter(|a| a.has_code())
            .and_then(|a| self.code_by_hash(&a.code_hash))
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    fn exists(&self, addr: &Addr) -> bool {
        self.account(addr).is_some()
    }
}

/// Write half of the account store. Every mutator creates the account
/// lazily and marks it dirty.
pub trait StateW {
    fn set_balance(&mut self, addr: &Addr, balance: Wei);
    fn set_nonce(&mut self, addr: &Addr, nonce: u64);
    fn set_code(&mut self, addr: &Addr, code: &[u8]);
    /// Writing zero clears the slot.
    fn set_storage(&mut self, addr: &Addr, slot: &Hash, val: U256);
}

/// Balance arithmetic on top of a writable state.
pub trait Transferable: StateR + StateW {
    fn add_balance(&mut self, addr: &Addr, amount: &Wei) -> Option<()> {
        let balance = self.get_balance(addr).checked_add(amount)?;
        self.set_balance(addr, balance);
        Some(())
    }

    fn sub_balance(&mut self, addr: &Addr, amount: &Wei) -> Option<()> {
        let balance = self.get_balance(addr).checked_sub(amount)?;
        self.set_balance(addr, balance);
        Some(())
    }

    fn transfer_balance(
        &mut self, from: &Addr, to: &Addr, amount: &Wei,
    ) -> Option<()> {
        if amount.is_zero() {
            return Some(())
        }
        self.sub_balance(from, amount)?;
        self.add_balance(to, amount)
    }
}

impl<T: StateR + StateW> Transferable for T {}

#[derive(Default, Clone)]
struct Delta {
    accounts: HashMap<Addr, Account>,
    /// Zero values are kept as tombstones so they shadow older revisions.
    storage: HashMap<Addr, HashMap<Hash, U256>>,
    code: HashMap<Hash, Arc<[u8]>>,
    dirty: HashSet<Addr>,
}

impl Delta {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty() &&
            self.storage.is_empty() &&
            self.code.is_empty() &&
            self.dirty.is_empty()
    }

    /// Applies a newer delta on top of this one.
    fn absorb(&mut self, newer: &Delta) {
        for (addr, acc) in newer.accounts.iter() {
            self.accounts.insert(addr.clone(), acc.clone());
        }
        for (addr, slots) in newer.storage.iter() {
            let own = self.storage.entry(addr.clone()).or_default();
            for (slot, val) in slots.iter() {
                own.insert(slot.clone(), *val);
            }
        }
        for (hash, code) in newer.code.iter() {
            self.code.insert(hash.clone(), code.clone());
        }
        self.dirty.extend(newer.dirty.iter().cloned());
    }

    /// Drops tombstones; only valid for a delta with nothing beneath it.
    fn prune(&mut self) {
        for slots in self.storage.values_mut() {
            slots.retain(|_, v| !v.is_zero());
        }
        self.storage.retain(|_, slots| !slots.is_empty());
        self.dirty.clear();
    }
}

struct Revision {
    delta: Delta,
    parent: Option<Arc<Revision>>,
    depth: usize,
}

impl Revision {
    fn root() -> Self {
        Self {
            delta: Delta::default(),
            parent: None,
            depth: 0,
        }
    }

    fn on_top(delta: Delta, parent: &Arc<Revision>) -> Self {
        Self {
            delta,
            parent: Some(parent.clone()),
            depth: parent.depth + 1,
        }
    }

    fn iter(&self) -> RevIter<'_> {
        RevIter(Some(self))
    }

    fn find<T>(&self, f: impl Fn(&Delta) -> Option<T>) -> Option<T> {
        self.iter().find_map(|rev| f(&rev.delta))
    }

    /// Newest-wins merge of this revision and everything beneath it.
    fn flatten(&self) -> Delta {
        let revs: Vec<&Revision> = self.iter().collect();
        let mut out = Delta::default();
        for rev in revs.into_iter().rev() {
            out.absorb(&rev.delta);
        }
        out.prune();
        out
    }
}

impl Drop for Revision {
    // unlink the chain iteratively so deep histories don't blow the stack
    fn drop(&mut self) {
        let mut next = self.parent.take();
        while let Some(rev) = next {
            match Arc::try_unwrap(rev) {
                Ok(mut rev) => next = rev.parent.take(),
                Err(_) => break,
            }
        }
    }
}

struct RevIter<'a>(Option<&'a Revision>);

impl<'a> Iterator for RevIter<'a> {
    type Item = &'a Revision;
    fn next(&mut self) -> Option<&'a Revision> {
        let cur = self.0?;
        self.0 = cur.parent.as_deref();
        Some(cur)
    }
}

fn account_in(delta: &Delta, addr: &Addr) -> Option<Account> {
    delta.accounts.get(addr).cloned()
}

fn storage_in(delta: &Delta, addr: &Addr, slot: &Hash) -> Option<U256> {
    delta.storage.get(addr).and_then(|s| s.get(slot)).copied()
}

/// Immutable view of a committed state.
#[derive(Clone)]
pub struct StateView(Arc<Revision>);

impl StateView {
    pub fn empty() -> Self {
        Self(Arc::new(Revision::root()))
    }

    /// Every account of this view, ordered by address.
    pub fn accounts(&self) -> BTreeMap<Addr, Account> {
        let mut out = BTreeMap::new();
        for rev in self.0.iter() {
            for (addr, acc) in rev.delta.accounts.iter() {
                out.entry(addr.clone()).or_insert_with(|| acc.clone());
            }
        }
        out
    }

    /// Non-zero storage slots of `addr`, ordered by slot.
    pub fn storage_entries(&self, addr: &Addr) -> BTreeMap<Hash, U256> {
        collect_storage(self.0.iter().map(|r| &r.delta), addr)
    }

    pub fn depth(&self) -> usize {
        self.0.depth
    }
}

fn collect_storage<'a>(
    deltas: impl Iterator<Item = &'a Delta>, addr: &Addr,
) -> BTreeMap<Hash, U256> {
    let mut seen = BTreeMap::new();
    for delta in deltas {
        if let Some(slots) = delta.storage.get(addr) {
            for (slot, val) in slots.iter() {
                seen.entry(slot.clone()).or_insert(*val);
            }
        }
    }
    seen.retain(|_, v| !v.is_zero());
    seen
}

impl StateR for StateView {
    fn account(&self, addr: &Addr) -> Option<Account> {
        self.0.find(|d| account_in(d, addr))
    }

    fn code_by_hash(&self, hash: &Hash) -> Option<Arc<[u8]>> {
        self.0.find(|d| d.code.get(hash).cloned())
    }

    fn storage(&self, addr: &Addr, slot: &Hash) -> U256 {
        self.0.find(|d| storage_in(d, addr, slot)).unwrap_or_default()
    }
}

struct SnapshotEntry {
    id: SnapshotId,
    rev: Arc<Revision>,
    committed: Arc<Revision>,
}

/// The working (mutable) state.
pub struct MemState {
    committed: Arc<Revision>,
    frozen: Arc<Revision>,
    tip: Delta,
    snapshots: Vec<SnapshotEntry>,
    next_snapshot: SnapshotId,
}

impl Default for MemState {
    fn default() -> Self {
        Self::from_view(&StateView::empty())
    }
}

impl MemState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scratch state on top of a committed view; writes never reach the
    /// view itself.
    pub fn from_view(view: &StateView) -> Self {
        Self {
            committed: view.0.clone(),
            frozen: view.0.clone(),
            tip: Delta::default(),
            snapshots: Vec::new(),
            next_snapshot: 0,
        }
    }

    fn find<T>(&self, f: impl Fn(&Delta) -> Option<T>) -> Option<T> {
        f(&self.tip).or_else(|| self.frozen.find(f))
    }

    fn account_mut(&mut self, addr: &Addr) -> &mut Account {
        if !self.tip.accounts.contains_key(addr) {
            let acc = self
                .frozen
                .find(|d| account_in(d, addr))
                .unwrap_or_default();
            self.tip.accounts.insert(addr.clone(), acc);
        }
        self.tip.dirty.insert(addr.clone());
        self.tip.accounts.entry(addr.clone()).or_default()
    }

    /// Captures the current state. O(1): the pending writes are frozen into
    /// a new revision and later writes go to a fresh overlay.
    pub fn take_snapshot(&mut self) -> SnapshotId {
        if !self.tip.is_empty() {
            let delta = std::mem::take(&mut self.tip);
            self.frozen = Arc::new(Revision::on_top(delta, &self.frozen));
        }
        let id = self.next_snapshot;
        self.next_snapshot += 1;
        self.snapshots.push(SnapshotEntry {
            id,
            rev: self.frozen.clone(),
            committed: self.committed.clone(),
        });
        id
    }

    /// Restores the exact state at `id` and invalidates every newer
    /// snapshot. `id` itself stays valid.
    pub fn revert_to_snapshot(
        &mut self, id: SnapshotId,
    ) -> Result<(), ChainError> {
        let pos = self
            .snapshots
            .iter()
            .rposition(|s| s.id == id)
            .ok_or(ChainError::SnapshotNotFound(id))?;
        self.snapshots.truncate(pos + 1);
        let entry = &self.snapshots[pos];
        self.frozen = entry.rev.clone();
        self.committed = entry.committed.clone();
        self.tip = Delta::default();
        Ok(())
    }

    /// Forgets `id` (and anything newer) while keeping all writes.
    pub fn release_snapshot(
        &mut self, id: SnapshotId,
    ) -> Result<(), ChainError> {
        let pos = self
            .snapshots
            .iter()
            .rposition(|s| s.id == id)
            .ok_or(ChainError::SnapshotNotFound(id))?;
        self.snapshots.truncate(pos);
        Ok(())
    }

    pub fn has_snapshot(&self, id: SnapshotId) -> bool {
        self.snapshots.iter().any(|s| s.id == id)
    }

    /// Addresses written since the last commit.
    pub fn dirty_accounts(&self) -> BTreeSet<Addr> {
        let mut dirty: BTreeSet<Addr> =
            self.tip.dirty.iter().cloned().collect();
        for rev in self.frozen.iter() {
            if std::ptr::eq(rev, &*self.committed) {
                break
            }
            dirty.extend(rev.delta.dirty.iter().cloned());
        }
        dirty
    }

    /// Non-zero storage of `addr` as seen by the working state.
    pub fn storage_entries(&self, addr: &Addr) -> BTreeMap<Hash, U256> {
        collect_storage(
            std::iter::once(&self.tip)
                .chain(self.frozen.iter().map(|r| &r.delta)),
            addr,
        )
    }

    /// Makes every write so far permanent and returns the accounts they
    /// touched. Storage roots of those accounts are refreshed first.
    pub fn commit(&mut self) -> BTreeSet<Addr> {
        let dirty = self.dirty_accounts();
        for addr in dirty.iter() {
            let root = storage_root(&self.storage_entries(addr));
            if let Some(acc) = self.find(|d| account_in(d, addr)) {
                if acc.storage_root != root {
                    self.account_mut(addr).storage_root = root;
                }
            }
        }

        let mut pending: Vec<&Revision> = Vec::new();
        for rev in self.frozen.iter() {
            if std::ptr::eq(rev, &*self.committed) {
                break
            }
            pending.push(rev);
        }
        let mut delta = Delta::default();
        for rev in pending.into_iter().rev() {
            delta.absorb(&rev.delta);
        }
        delta.absorb(&std::mem::take(&mut self.tip));

        if !delta.is_empty() {
            let rev = Revision::on_top(delta, &self.committed);
            let rev = if rev.depth > COMPACT_DEPTH {
                Revision {
                    delta: rev.flatten(),
                    parent: None,
                    depth: 0,
                }
            } else {
                rev
            };
            self.committed = Arc::new(rev);
        }
        self.frozen = self.committed.clone();
        log::debug!(
            "state commit: {} dirty accounts, depth {}",
            dirty.len(),
            self.committed.depth
        );
        dirty
    }

    /// The last committed state.
    pub fn committed_view(&self) -> StateView {
        StateView(self.committed.clone())
    }

    /// Length of the overlay chain a lookup may walk.
    pub fn depth(&self) -> usize {
        self.frozen.depth
    }
}

impl StateR for MemState {
    fn account(&self, addr: &Addr) -> Option<Account> {
        self.find(|d| account_in(d, addr))
    }

    fn code_by_hash(&self, hash: &Hash) -> Option<Arc<[u8]>> {
        self.find(|d| d.code.get(hash).cloned())
    }

    fn storage(&self, addr: &Addr, slot: &Hash) -> U256 {
        self.find(|d| storage_in(d, addr, slot)).unwrap_or_default()
    }
}

impl StateW for MemState {
    fn set_balance(&mut self, addr: &Addr, balance: Wei) {
        self.account_mut(addr).balance = balance
    }

    fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        self.account_mut(addr).nonce = nonce
    }

    fn set_code(&mut self, addr: &Addr, code: &[u8]) {
        let hash = Hash::hash(code);
        self.tip.code.insert(hash.clone(), Arc::from(code));
        self.account_mut(addr).code_hash = hash
    }

    fn set_storage(&mut self, addr: &Addr, slot: &Hash, val: U256) {
        self.account_mut(addr);
        self.tip
            .storage
            .entry(addr.clone())
            .or_default()
            .insert(slot.clone(), val);
    }
}

/// Ordered-list commitment over `[slot, value]` pairs.
pub fn storage_root(entries: &BTreeMap<Hash, U256>) -> Hash {
    if entries.is_empty() {
        return Hash::empty_root().clone()
    }
    let mut s = rlp::RlpStream::new_list(entries.len());
    for (slot, val) in entries.iter() {
        s.begin_list(2)
            .append(slot)
            .append(&crate::common::U256RLP(*val));
    }
    Hash::hash(&s.out())
}

/// Ordered-list commitment over `[address, account]` pairs.
pub fn state_root(view: &StateView) -> Hash {
    let accounts = view.accounts();
    if accounts.is_empty() {
        return Hash::empty_root().clone()
    }
    let mut s = rlp::RlpStream::new_list(accounts.len());
    for (addr, acc) in accounts.iter() {
        s.begin_list(2).append(addr).append(acc);
    }
    Hash::hash(&s.out())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Addr {
        U256::from(n).into()
    }

    #[test]
    fn test_defaults_for_unknown() {
        let s = MemState::new();
        assert!(s.get_balance(&addr(1)).is_zero());
        assert_eq!(s.get_nonce(&addr(1)), 0);
        assert!(s.get_code(&addr(1)).is_empty());
        assert!(s.storage(&addr(1), &Hash::from(7u64)).is_zero());
        assert!(!s.exists(&addr(1)));
    }

    #[test]
    fn test_nested_snapshots() {
        let mut s = MemState::new();
        s.set_balance(&addr(1), 100u64.into());
        let s0 = s.take_snapshot();
        s.set_balance(&addr(1), 500u64.into());
        let s1 = s.take_snapshot();
        s.set_nonce(&addr(1), 3);
        s.set_storage(&addr(2), &Hash::from(1u64), 9.into());

        s.revert_to_snapshot(s1).unwrap();
        assert_eq!(s.get_balance(&addr(1)), 500u64.into());
        assert_eq!(s.get_nonce(&addr(1)), 0);
        assert!(!s.exists(&addr(2)));

        s.revert_to_snapshot(s0).unwrap();
        assert_eq!(s.get_balance(&addr(1)), 100u64.into());
        // s1 was taken after s0 and is gone now
        assert!(matches!(
            s.revert_to_snapshot(s1),
            Err(ChainError::SnapshotNotFound(_))
        ));
        // s0 can be reused
        s.set_balance(&addr(1), 1u64.into());
        s.revert_to_snapshot(s0).unwrap();
        assert_eq!(s.get_balance(&addr(1)), 100u64.into());
    }

    #[test]
    fn test_release_keeps_writes() {
        let mut s = MemState::new();
        let id = s.take_snapshot();
        s.set_balance(&addr(1), 5u64.into());
        s.release_snapshot(id).unwrap();
        assert!(!s.has_snapshot(id));
        assert_eq!(s.get_balance(&addr(1)), 5u64.into());
    }

    #[test]
    fn test_commit_and_dirty_set() {
        let mut s = MemState::new();
        s.set_balance(&addr(1), 1u64.into());
        let _ = s.take_snapshot();
        s.set_storage(&addr(2), &Hash::from(1u64), 2.into());
        assert_eq!(
            s.dirty_accounts().into_iter().collect::<Vec<_>>(),
            vec![addr(1), addr(2)]
        );
        let dirty = s.commit();
        assert_eq!(dirty.len(), 2);
        assert!(s.dirty_accounts().is_empty());
        assert_eq!(s.depth(), 1);

        let view = s.committed_view();
        assert_eq!(view.get_balance(&addr(1)), 1u64.into());
        assert_eq!(view.storage(&addr(2), &Hash::from(1u64)), 2.into());
        let acc2 = view.account(&addr(2)).unwrap();
        assert_ne!(&acc2.storage_root, Hash::empty_root());

        // writes after the commit don't leak into the view
        s.set_balance(&addr(1), 9u64.into());
        assert_eq!(view.get_balance(&addr(1)), 1u64.into());
    }

    #[test]
    fn test_zero_storage_clears_slot() {
        let mut s = MemState::new();
        let slot = Hash::from(4u64);
        s.set_storage(&addr(1), &slot, 8.into());
        s.commit();
        s.set_storage(&addr(1), &slot, U256::zero());
        assert!(s.storage(&addr(1), &slot).is_zero());
        assert!(s.storage_entries(&addr(1)).is_empty());
        s.commit();
        let acc = s.committed_view().account(&addr(1)).unwrap();
        assert_eq!(&acc.storage_root, Hash::empty_root());
    }

    #[test]
    fn test_compaction_preserves_state() {
        let mut s = MemState::new();
        for i in 0..(COMPACT_DEPTH as u64 * 2) {
            s.set_balance(&addr(i % 5), i.into());
            s.set_storage(&addr(7), &Hash::from(i), (i + 1).into());
            s.commit();
            assert!(s.depth() <= COMPACT_DEPTH);
        }
        let view = s.committed_view();
        let last = COMPACT_DEPTH as u64 * 2 - 1;
        assert_eq!(view.get_balance(&addr(last % 5)), last.into());
        assert_eq!(view.storage_entries(&addr(7)).len(), last as usize + 1);
    }

    #[test]
    fn test_scratch_state_isolated() {
        let mut s = MemState::new();
        s.set_code(&addr(1), &[0x60, 0x00]);
        s.commit();
        let view = s.committed_view();
        let mut scratch = MemState::from_view(&view);
        scratch.set_code(&addr(1), &[0xfe]);
        assert_eq!(&*scratch.get_code(&addr(1)), &[0xfe]);
        assert_eq!(&*view.get_code(&addr(1)), &[0x60, 0x00]);
    }

    #[test]
    fn test_transfer() {
        let mut s = MemState::new();
        s.set_balance(&addr(1), 10u64.into());
        assert!(s
            .transfer_balance(&addr(1), &addr(2), &4u64.into())
            .is_some());
        assert!(s
            .transfer_balance(&addr(1), &addr(2), &7u64.into())
            .is_none());
        assert_eq!(s.get_balance(&addr(1)), 6u64.into());
        assert_eq!(s.get_balance(&addr(2)), 4u64.into());
    }
}
