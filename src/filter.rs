//! Installed filters, polled by high-water mark.

use std::collections::{BTreeSet, HashMap};

use crate::chain::Chain;
use crate::common::{Addr, Hash};
use crate::error::ChainError;
use crate::receipt::{FilteredLog, Log};

/// Criteria of a log query. An empty address set matches any emitter; an
/// empty set at a topic position matches any topic there.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct LogFilter {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: BTreeSet<Addr>,
    pub topics: Vec<BTreeSet<Hash>>,
}

impl LogFilter {
    pub fn address(mut self, addr: Addr) -> Self {
        self.addresses.insert(addr);
        self
    }

    /// Adds `topic` as an alternative at `position`.
    pub fn topic(mut self, position: usize, topic: Hash) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, BTreeSet::new());
        }
        self.topics[position].insert(topic);
        self
    }

    pub fn from_block(mut self, n: u64) -> Self {
        self.from_block = Some(n);
        self
    }

    pub fn to_block(mut self, n: u64) -> Self {
        self.to_block = Some(n);
        self
    }

    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address)
        {
            return false
        }
        self.topics.iter().enumerate().all(|(i, alternatives)| {
            alternatives.is_empty() ||
                log.topics
                    .get(i)
                    .map_or(false, |t| alternatives.contains(t))
        })
    }

    /// The inclusive block range this filter asks for, clipped to
    /// `after+1..=head`. `None` when empty.
    pub fn window(&self, after: Option<u64>, head: u64) -> Option<(u64, u64)> {
        let mut from = self.from_block.unwrap_or(0);
        if let Some(after) = after {
            from = from.max(after.checked_add(1)?)
        }
        let to = self.to_block.map_or(head, |t| t.min(head));
        if from > to {
            return None
        }
        Some((from, to))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterKind {
    Log = 0,
    Block = 1,
    PendingTransaction = 2,
}

/// The persisted part of an installed filter.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FilterState {
    pub id: String,
    pub kind: FilterKind,
    pub log_filter: Option<LogFilter>,
    pub last_checked_block: u64,
    /// Unix seconds.
    pub created_at: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FilterChanges {
    Logs(Vec<FilteredLog>),
    /// Block hashes, or transaction hashes for pending-transaction filters.
    Hashes(Vec<Hash>),
}

impl FilterChanges {
    pub fn len(&self) -> usize {
        match self {
            FilterChanges::Logs(l) => l.len(),
            FilterChanges::Hashes(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Installed {
    state: FilterState,
    last_used: u64,
}

#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Installed>,
    next_id: u64,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn install(
        &mut self, kind: FilterKind, log_filter: Option<LogFilter>, head: u64,
        now: u64,
    ) -> String {
        self.next_id += 1;
        let id = format!("0x{:x}", self.next_id);
        let state = FilterState {
            id: id.clone(),
            kind,
            log_filter,
            last_checked_block: head,
            created_at: now,
        };
        log::debug!("installed {:?} filter {} at block {}", kind, id, head);
        self.filters.insert(
            id.clone(),
            Installed {
                state,
                last_used: now,
            },
        );
        id
    }

    pub fn create_filter(
        &mut self, filter: LogFilter, head: u64, now: u64,
    ) -> String {
        self.install(FilterKind::Log, Some(filter), head, now)
    }

    pub fn create_block_filter(&mut self, head: u64, now: u64) -> String {
        self.install(FilterKind::Block, None, head, now)
    }

    pub fn create_pending_transaction_filter(
        &mut self, head: u64, now: u64,
    ) -> String {
        self.install(FilterKind::PendingTransaction, None, head, now)
    }

    pub fn get(&self, id: &str) -> Option<&FilterState> {
        self.filters.get(id).map(|f| &f.state)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Everything since the last poll, then advances the mark to the head.
    pub fn changes(
        &mut self, id: &str, chain: &Chain, now: u64,
    ) -> Result<FilterChanges, ChainError> {
        let f = self
            .filters
            .get_mut(id)
            .ok_or_else(|| ChainError::FilterNotFound(id.to_string()))?;
        let head = chain.head_number();
        let after = f.state.last_checked_block;
        let changes = match f.state.kind {
            FilterKind::Log => {
                let filter = f.state.log_filter.clone().unwrap_or_default();
                FilterChanges::Logs(
                    match filter.window(Some(after), head) {
                        Some((from, to)) => chain
                            .logs_in_range(from, to)
                            .filter(|l| filter.matches(&l.log))
                            .cloned()
                            .collect(),
                        None => Vec::new(),
                    },
                )
            }
            FilterKind::Block => FilterChanges::Hashes(if after < head {
                chain.block_hashes(after + 1, head)
            } else {
                Vec::new()
            }),
            FilterKind::PendingTransaction => {
                let mut hashes = Vec::new();
                for n in after.saturating_add(1)..=head {
                    if let Some(b) = chain.block_by_number(n) {
                        hashes.extend(b.transactions.iter().cloned())
                    }
                }
                FilterChanges::Hashes(hashes)
            }
        };
        f.state.last_checked_block = head;
        f.last_used = now;
        Ok(changes)
    }

    /// All matching logs of a log filter's full range, without moving its
    /// mark.
    pub fn filter_logs(
        &self, id: &str, chain: &Chain,
    ) -> Result<Vec<FilteredLog>, ChainError> {
        let f = self
            .filters
            .get(id)
            .ok_or_else(|| ChainError::FilterNotFound(id.to_string()))?;
        let filter = match &f.state.log_filter {
            Some(filter) => filter,
            None => return Ok(Vec::new()),
        };
        Ok(query_logs(filter, chain))
    }

    pub fn uninstall(&mut self, id: &str) -> bool {
        self.filters.remove(id).is_some()
    }

    /// Removes filters not polled for more than `ttl` seconds and returns
    /// their ids.
    pub fn prune(&mut self, now: u64, ttl: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .filters
            .iter()
            .filter(|(_, f)| now.saturating_sub(f.last_used) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired.iter() {
            self.filters.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("pruned {} idle filters", expired.len());
        }
        expired
    }

    /// Pulls marks back after the chain was truncated to `head`.
    pub fn rewind(&mut self, head: u64) {
        for f in self.filters.values_mut() {
            f.state.last_checked_block = f.state.last_checked_block.min(head);
        }
    }
}

/// One-shot range query. Missing bounds default to genesis and the head.
pub fn query_logs(filter: &LogFilter, chain: &Chain) -> Vec<FilteredLog> {
    match filter.window(None, chain.head_number()) {
        Some((from, to)) => chain
            .logs_in_range(from, to)
            .filter(|l| filter.matches(&l.log))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Bytes;

    fn log(addr: u8, topics: &[u64]) -> Log {
        Log::new(
            Addr::from([addr; 20]),
            topics.iter().map(|t| Hash::from(*t)).collect(),
            Bytes::empty(),
        )
    }

    #[test]
    fn test_address_match() {
        let any = LogFilter::default();
        assert!(any.matches(&log(1, &[])));
        let f = LogFilter::default()
            .address(Addr::from([1; 20]))
            .address(Addr::from([2; 20]));
        assert!(f.matches(&log(1, &[])));
        assert!(f.matches(&log(2, &[5])));
        assert!(!f.matches(&log(3, &[])));
    }

    #[test]
    fn test_topic_match() {
        // [1 | 2, *, 9]
        let f = LogFilter::default()
            .topic(0, Hash::from(1u64))
            .topic(0, Hash::from(2u64))
            .topic(2, Hash::from(9u64));
        assert_eq!(f.topics.len(), 3);
        assert!(f.topics[1].is_empty());
        assert!(f.matches(&log(1, &[1, 7, 9])));
        assert!(f.matches(&log(1, &[2, 8, 9, 4])));
        assert!(!f.matches(&log(1, &[3, 7, 9])));
        assert!(!f.matches(&log(1, &[1, 7, 8])));
        // too few topics for a constrained position
        assert!(!f.matches(&log(1, &[1, 7])));
        // wildcard position may be missing only if nothing after is
        // constrained
        let g = LogFilter::default().topic(0, Hash::from(1u64));
        assert!(g.matches(&log(1, &[1])));
        assert!(!g.matches(&log(1, &[])));
    }

    #[test]
    fn test_window() {
        let f = LogFilter::default();
        assert_eq!(f.window(Some(0), 3), Some((1, 3)));
        assert_eq!(f.window(Some(3), 3), None);
        assert_eq!(f.window(None, 3), Some((0, 3)));
        let f = LogFilter::default().from_block(2).to_block(5);
        assert_eq!(f.window(Some(0), 10), Some((2, 5)));
        assert_eq!(f.window(Some(4), 10), Some((5, 5)));
        assert_eq!(f.window(Some(5), 10), None);
        assert_eq!(f.window(None, 3), Some((2, 3)));
        assert_eq!(f.window(Some(u64::MAX), u64::MAX), None);
    }

    #[test]
    fn test_ids_and_prune() {
        let mut reg = FilterRegistry::new();
        let a = reg.create_filter(LogFilter::default(), 0, 100);
        let b = reg.create_block_filter(0, 150);
        let c = reg.create_pending_transaction_filter(0, 200);
        assert_eq!(a, "0x1");
        assert_eq!(c, "0x3");
        assert_ne!(a, b);
        assert_eq!(reg.get(&b).unwrap().kind, FilterKind::Block);
        assert_eq!(reg.get(&a).unwrap().created_at, 100);

        let pruned = reg.prune(260, 100);
        assert_eq!(pruned, vec![a.clone()]);
        assert!(reg.get(&a).is_none());
        assert_eq!(reg.len(), 2);
        assert!(reg.uninstall(&b));
        assert!(!reg.uninstall(&b));
        // ids are never reused
        assert_eq!(reg.create_block_filter(0, 300), "0x4");
    }
}
