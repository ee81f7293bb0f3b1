use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::trace;

use devchain::common::{Addr, Hash, Wei, U256};
use devchain::state::{storage_root, Account, StateR, StateW};

#[derive(Clone)]
struct DummyAccountState {
    state: BTreeMap<Hash, U256>,
    balance: Wei,
    nonce: u64,
    code: Arc<[u8]>,
}

impl Default for DummyAccountState {
    fn default() -> Self {
        Self {
            state: BTreeMap::new(),
            balance: Wei::zero().clone(),
            nonce: 0,
            code: Arc::from(Vec::new()),
        }
    }
}

/// Flat account store without any versioning: a snapshot is a full clone.
/// Slow, but obviously correct, which makes it the reference the versioned
/// store is checked against.
#[derive(Clone, Default)]
pub struct DummyStateStore {
    accounts: HashMap<Addr, DummyAccountState>,
    code: HashMap<Hash, Arc<[u8]>>,
}

impl DummyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_account(&mut self, addr: &Addr) -> &mut DummyAccountState {
        self.accounts
            .entry(addr.clone())
            .or_insert_with(DummyAccountState::default)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Addr> {
        self.accounts.keys()
    }

    pub fn account_keys(
        &self, addr: &Addr,
    ) -> Option<impl Iterator<Item = &Hash>> {
        self.accounts.get(addr).map(|acc| acc.state.keys())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn snapshot(&self) -> Self {
        trace!("snapshot()");
        self.clone()
    }

    pub fn rollback(&mut self, mut state: Self) {
        trace!("rollback()");
        std::mem::swap(self, &mut state);
    }
}

impl StateR for DummyStateStore {
    fn account(&self, addr: &Addr) -> Option<Account> {
        self.accounts.get(addr).map(|acc| {
            let nonzero: BTreeMap<Hash, U256> = acc
                .state
                .iter()
                .filter(|(_, v)| !v.is_zero())
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            Account {
                nonce: acc.nonce,
                balance: acc.balance.clone(),
                storage_root: storage_root(&nonzero),
                code_hash: Hash::hash(&acc.code),
            }
        })
    }

    fn code_by_hash(&self, hash: &Hash) -> Option<Arc<[u8]>> {
        self.code.get(hash).cloned()
    }

    fn storage(&self, addr: &Addr, slot: &Hash) -> U256 {
        self.accounts
            .get(addr)
            .and_then(|acc| acc.state.get(slot))
            .cloned()
            .unwrap_or_else(U256::zero)
    }

    fn get_code(&self, addr: &Addr) -> Arc<[u8]> {
        self.accounts
            .get(addr)
            .map(|acc| acc.code.clone())
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }
}

impl StateW for DummyStateStore {
    fn set_balance(&mut self, addr: &Addr, balance: Wei) {
        trace!("set_balance({}, {})", addr, balance);
        self.get_account(addr).balance = balance
    }

    fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        trace!("set_nonce({}, {})", addr, nonce);
        self.get_account(addr).nonce = nonce
    }

    fn set_code(&mut self, addr: &Addr, code: &[u8]) {
        trace!("set_code({}, {})", addr, hex::encode(code));
        let code: Arc<[u8]> = Arc::from(code);
        self.code.insert(Hash::hash(&code), code.clone());
        self.get_account(addr).code = code
    }

    fn set_storage(&mut self, addr: &Addr, slot: &Hash, val: U256) {
        trace!("set_storage({}, {}, {})", addr, slot, val);
        let acc = self.get_account(addr);
        if val.is_zero() {
            acc.state.remove(slot);
        } else {
            acc.state.insert(slot.clone(), val);
        }
    }
}
