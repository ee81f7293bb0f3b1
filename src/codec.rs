//! Canonical byte encoding of every record the node hashes or stores.
//!
//! Encoding goes through `rlp::Encodable` (the same stream the header hash is computed over).
//! Decoding first parses the input into an [RlpNode] tree and then walks it with explicit arity
//! and width checks per record, so malformed input surfaces as a [CodecError] instead of a panic.
//!
//! Integers are minimal big-endian (zero is the empty string); leading zero bytes are rejected.
//! Absent addresses encode as the empty string. Optional block numbers are wrapped in a list of
//! zero or one items, since the empty string already means `0`.

use std::collections::BTreeSet;

use rlp::RlpStream;

use crate::chain::BlockHeader;
use crate::common::{Addr, Bloom, Bytes, Hash, NullableAddr, Wei, U256, U256RLP};
use crate::error::CodecError;
use crate::filter::{FilterKind, FilterState, LogFilter};
use crate::receipt::{FilteredLog, Log, Receipt, ReceiptInfo, TransactionLocation};
use crate::state::Account;

const MAX_NESTING: usize = 16;

/// A parsed RLP item.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RlpNode {
    Scalar(Vec<u8>),
    List(Vec<RlpNode>),
}

impl RlpNode {
    /// Parses exactly one item; trailing bytes are an error.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(rlp::DecoderError::RlpIsTooShort.into())
        }
        let rlp = rlp::Rlp::new(bytes);
        let info = rlp.payload_info()?;
        let total = info.header_len + info.value_len;
        if total < bytes.len() {
            return Err(CodecError::TrailingBytes(bytes.len() - total))
        }
        Self::from_rlp(&rlp, 0)
    }

    fn from_rlp(rlp: &rlp::Rlp, depth: usize) -> Result<Self, CodecError> {
        if depth > MAX_NESTING {
            return Err(rlp::DecoderError::Custom("nesting too deep").into())
        }
        if rlp.is_list() {
            let n = rlp.item_count()?;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(Self::from_rlp(&rlp.at(i)?, depth + 1)?);
            }
            Ok(RlpNode::List(items))
        } else {
            let raw = rlp.as_raw();
            // a single byte below 0x80 is its own encoding
            if raw.len() == 2 && raw[0] == 0x81 && raw[1] < 0x80 {
                return Err(CodecError::NonCanonical("rlp"))
            }
            Ok(RlpNode::Scalar(rlp.data()?.to_vec()))
        }
    }

    pub fn as_scalar(&self, field: &'static str) -> Result<&[u8], CodecError> {
        match self {
            RlpNode::Scalar(b) => Ok(b),
            RlpNode::List(_) => Err(CodecError::UnexpectedList(field)),
        }
    }

    pub fn as_list(
        &self, record: &'static str,
    ) -> Result<&[RlpNode], CodecError> {
        match self {
            RlpNode::List(items) => Ok(items),
            RlpNode::Scalar(_) => Err(CodecError::UnexpectedScalar(record)),
        }
    }

    /// A list with exactly `arity` items.
    pub fn as_record(
        &self, record: &'static str, arity: usize,
    ) -> Result<&[RlpNode], CodecError> {
        let items = self.as_list(record)?;
        if items.len() != arity {
            return Err(CodecError::Arity {
                record,
                expected: arity,
                found: items.len(),
            })
        }
        Ok(items)
    }
}

/// Types that can be rebuilt from a parsed node.
pub trait Decode: Sized {
    fn from_node(node: &RlpNode, field: &'static str)
        -> Result<Self, CodecError>;
}

pub fn encode<T: rlp::Encodable>(x: &T) -> Vec<u8> {
    rlp::encode(x).to_vec()
}

pub fn decode<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    T::from_node(&RlpNode::parse(bytes)?, "record")
}

fn uint_bytes<'a>(
    node: &'a RlpNode, field: &'static str, max: usize,
) -> Result<&'a [u8], CodecError> {
    let b = node.as_scalar(field)?;
    if b.first() == Some(&0) {
        return Err(CodecError::NonCanonical(field))
    }
    if b.len() > max {
        return Err(CodecError::Overflow(field))
    }
    Ok(b)
}

fn fixed_bytes<'a>(
    node: &'a RlpNode, field: &'static str, len: usize,
) -> Result<&'a [u8], CodecError> {
    let b = node.as_scalar(field)?;
    if b.len() != len {
        return Err(CodecError::Length {
            field,
            expected: len,
            found: b.len(),
        })
    }
    Ok(b)
}

impl Decode for u64 {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        Ok(uint_bytes(node, field, 8)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }
}

impl Decode for u32 {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        Ok(uint_bytes(node, field, 4)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }
}

impl Decode for U256 {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        Ok(U256::from_big_endian(uint_bytes(node, field, 32)?))
    }
}

impl Decode for Wei {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        U256::from_node(node, field).map(Wei::from)
    }
}

impl Decode for bool {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        match u64::from_node(node, field)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::UnknownVariant { field, tag }),
        }
    }
}

impl Decode for Hash {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        fixed_bytes(node, field, 32).map(Hash::from_slice)
    }
}

impl Decode for Addr {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        fixed_bytes(node, field, 20).map(Addr::from_slice)
    }
}

impl Decode for Option<Addr> {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        if node.as_scalar(field)?.is_empty() {
            return Ok(None)
        }
        Addr::from_node(node, field).map(Some)
    }
}

impl Decode for Bytes {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        node.as_scalar(field).map(Bytes::from)
    }
}

impl Decode for Bloom {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        let b = node.as_scalar(field)?;
        Bloom::from_slice(b).ok_or(CodecError::Length {
            field,
            expected: 256,
            found: b.len(),
        })
    }
}

impl Decode for String {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        String::from_utf8(node.as_scalar(field)?.to_vec())
            .map_err(|_| CodecError::Utf8(field))
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        node.as_list(field)?
            .iter()
            .map(|n| T::from_node(n, field))
            .collect()
    }
}

/// `[]` for absent, `[n]` for present.
struct OptionalNumber(Option<u64>);

impl rlp::Encodable for OptionalNumber {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self.0 {
            Some(n) => s.begin_list(1).append(&n),
            None => s.begin_list(0),
        };
    }
}

impl Decode for OptionalNumber {
    fn from_node(node: &RlpNode, field: &'static str) -> Result<Self, CodecError> {
        match node.as_list(field)? {
            [] => Ok(Self(None)),
            [n] => u64::from_node(n, field).map(|n| Self(Some(n))),
            items => Err(CodecError::Arity {
                record: field,
                expected: 1,
                found: items.len(),
            }),
        }
    }
}

fn append_hashes<'a>(s: &mut RlpStream, hashes: impl ExactSizeIterator<Item = &'a Hash>) {
    s.begin_list(hashes.len());
    for h in hashes {
        s.append(h);
    }
}

// Account

impl Decode for Account {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("account", 4)?;
        Ok(Account {
            nonce: Decode::from_node(&f[0], "nonce")?,
            balance: Decode::from_node(&f[1], "balance")?,
            storage_root: Decode::from_node(&f[2], "storage_root")?,
            code_hash: Decode::from_node(&f[3], "code_hash")?,
        })
    }
}

// BlockHeader

impl rlp::Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(13)
            .append(&self.parent_hash)
            .append(&self.coinbase)
            .append(&self.state_root)
            .append(&self.transactions_root)
            .append(&self.receipts_root)
            .append(&self.logs_bloom)
            .append(&U256RLP(self.difficulty))
            .append(&self.number)
            .append(&self.gas_limit)
            .append(&self.gas_used)
            .append(&self.timestamp)
            .append(&self.prev_randao)
            .append(&self.base_fee);
    }
}

impl Decode for BlockHeader {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("header", 13)?;
        Ok(BlockHeader {
            parent_hash: Decode::from_node(&f[0], "parent_hash")?,
            coinbase: Decode::from_node(&f[1], "coinbase")?,
            state_root: Decode::from_node(&f[2], "state_root")?,
            transactions_root: Decode::from_node(&f[3], "transactions_root")?,
            receipts_root: Decode::from_node(&f[4], "receipts_root")?,
            logs_bloom: Decode::from_node(&f[5], "logs_bloom")?,
            difficulty: Decode::from_node(&f[6], "difficulty")?,
            number: Decode::from_node(&f[7], "number")?,
            gas_limit: Decode::from_node(&f[8], "gas_limit")?,
            gas_used: Decode::from_node(&f[9], "gas_used")?,
            timestamp: Decode::from_node(&f[10], "timestamp")?,
            prev_randao: Decode::from_node(&f[11], "prev_randao")?,
            base_fee: Decode::from_node(&f[12], "base_fee")?,
        })
    }
}

// Log

/// A log carries at most this many topics.
pub const MAX_TOPICS: usize = 4;

fn decode_topics(node: &RlpNode) -> Result<Vec<Hash>, CodecError> {
    let items = node.as_list("topics")?;
    if items.len() > MAX_TOPICS {
        return Err(CodecError::Arity {
            record: "topics",
            expected: MAX_TOPICS,
            found: items.len(),
        })
    }
    items.iter().map(|t| Decode::from_node(t, "topic")).collect()
}

impl rlp::Encodable for Log {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        append_hashes(s, self.topics.iter());
        s.append(&self.data);
    }
}

impl Decode for Log {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("log", 3)?;
        Ok(Log {
            address: Decode::from_node(&f[0], "address")?,
            topics: decode_topics(&f[1])?,
            data: Decode::from_node(&f[2], "data")?,
        })
    }
}

// Receipt

impl rlp::Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(&(self.status as u8))
            .append(&self.cumulative_gas_used)
            .append(&self.logs_bloom);
        s.begin_list(self.logs.len());
        for log in self.logs.iter() {
            s.append(log);
        }
    }
}

impl Decode for Receipt {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("receipt", 4)?;
        Ok(Receipt {
            status: Decode::from_node(&f[0], "status")?,
            cumulative_gas_used: Decode::from_node(&f[1], "cumulative_gas_used")?,
            logs_bloom: Decode::from_node(&f[2], "logs_bloom")?,
            logs: Decode::from_node(&f[3], "logs")?,
        })
    }
}

impl rlp::Encodable for ReceiptInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8)
            .append(&self.receipt)
            .append(&self.tx_hash)
            .append(&self.block_hash)
            .append(&self.block_number)
            .append(&self.transaction_index)
            .append(&self.gas_used)
            .append(&NullableAddr(self.contract_address.clone()))
            .append(&self.effective_gas_price);
    }
}

impl Decode for ReceiptInfo {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("receipt_info", 8)?;
        Ok(ReceiptInfo {
            receipt: Decode::from_node(&f[0], "receipt")?,
            tx_hash: Decode::from_node(&f[1], "tx_hash")?,
            block_hash: Decode::from_node(&f[2], "block_hash")?,
            block_number: Decode::from_node(&f[3], "block_number")?,
            transaction_index: Decode::from_node(&f[4], "transaction_index")?,
            gas_used: Decode::from_node(&f[5], "gas_used")?,
            contract_address: Decode::from_node(&f[6], "contract_address")?,
            effective_gas_price: Decode::from_node(
                &f[7],
                "effective_gas_price",
            )?,
        })
    }
}

// TransactionLocation

impl Decode for TransactionLocation {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("tx_location", 3)?;
        Ok(TransactionLocation {
            block_hash: Decode::from_node(&f[0], "block_hash")?,
            block_number: Decode::from_node(&f[1], "block_number")?,
            transaction_index: Decode::from_node(&f[2], "transaction_index")?,
        })
    }
}

// FilteredLog

impl rlp::Encodable for FilteredLog {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(9);
        s.append(&self.log.address).append(&self.log.data);
        append_hashes(s, self.log.topics.iter());
        s.append(&self.block_hash)
            .append(&self.block_number)
            .append(&self.transaction_hash)
            .append(&self.transaction_index)
            .append(&self.log_index)
            .append(&(self.removed as u8));
    }
}

impl Decode for FilteredLog {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("filtered_log", 9)?;
        Ok(FilteredLog {
            log: Log {
                address: Decode::from_node(&f[0], "address")?,
                data: Decode::from_node(&f[1], "data")?,
                topics: decode_topics(&f[2])?,
            },
            block_hash: Decode::from_node(&f[3], "block_hash")?,
            block_number: Decode::from_node(&f[4], "block_number")?,
            transaction_hash: Decode::from_node(&f[5], "transaction_hash")?,
            transaction_index: Decode::from_node(&f[6], "transaction_index")?,
            log_index: Decode::from_node(&f[7], "log_index")?,
            removed: Decode::from_node(&f[8], "removed")?,
        })
    }
}

// LogFilter

impl rlp::Encodable for LogFilter {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(&OptionalNumber(self.from_block))
            .append(&OptionalNumber(self.to_block));
        s.begin_list(self.addresses.len());
        for a in self.addresses.iter() {
            s.append(a);
        }
        s.begin_list(self.topics.len());
        for alternatives in self.topics.iter() {
            append_hashes(s, alternatives.iter());
        }
    }
}

impl Decode for LogFilter {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("log_filter", 4)?;
        let addresses: Vec<Addr> = Decode::from_node(&f[2], "addresses")?;
        let topics: Vec<Vec<Hash>> = Decode::from_node(&f[3], "topics")?;
        Ok(LogFilter {
            from_block: OptionalNumber::from_node(&f[0], "from_block")?.0,
            to_block: OptionalNumber::from_node(&f[1], "to_block")?.0,
            addresses: addresses.into_iter().collect(),
            topics: topics
                .into_iter()
                .map(|t| t.into_iter().collect::<BTreeSet<_>>())
                .collect(),
        })
    }
}

// FilterState

impl rlp::Encodable for FilterState {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5)
            .append(&self.id.as_bytes())
            .append(&(self.kind as u8));
        match &self.log_filter {
            Some(f) => s.append(f),
            None => s.append_empty_data(),
        };
        s.append(&self.last_checked_block).append(&self.created_at);
    }
}

impl Decode for FilterState {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("filter_state", 5)?;
        let kind = match u64::from_node(&f[1], "kind")? {
            0 => FilterKind::Log,
            1 => FilterKind::Block,
            2 => FilterKind::PendingTransaction,
            tag => {
                return Err(CodecError::UnknownVariant { field: "kind", tag })
            }
        };
        let log_filter = match &f[2] {
            RlpNode::Scalar(b) if b.is_empty() => None,
            n => Some(LogFilter::from_node(n, "log_filter")?),
        };
        Ok(FilterState {
            id: Decode::from_node(&f[0], "id")?,
            kind,
            log_filter,
            last_checked_block: Decode::from_node(&f[3], "last_checked_block")?,
            created_at: Decode::from_node(&f[4], "created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64) -> Hash {
        Hash::from(n)
    }

    fn a(n: u64) -> Addr {
        U256::from(n).into()
    }

    fn roundtrip<T: rlp::Encodable + Decode + PartialEq + std::fmt::Debug>(
        x: &T,
    ) {
        let bytes = encode(x);
        let y: T = decode(&bytes).unwrap();
        assert_eq!(&y, x);
    }

    fn sample_log(topics: usize) -> Log {
        Log::new(
            a(0xaa),
            (0..topics as u64).map(h).collect(),
            Bytes::from(vec![1u8, 0, 2]),
        )
    }

    #[test]
    fn test_zero_is_empty_string() {
        assert_eq!(encode(&0u64), vec![0x80]);
        assert_eq!(encode(Wei::zero()), vec![0x80]);
        assert_eq!(decode::<u64>(&[0x80]).unwrap(), 0);
        assert!(decode::<Wei>(&[0x80]).unwrap().is_zero());
    }

    #[test]
    fn test_account_edges() {
        roundtrip(&Account::default());
        roundtrip(&Account {
            nonce: u64::MAX,
            balance: U256::MAX.into(),
            storage_root: h(1),
            code_hash: h(2),
        });
    }

    #[test]
    fn test_header() {
        let header = BlockHeader {
            parent_hash: Hash::zero().clone(),
            coinbase: a(7),
            state_root: Hash::empty_root().clone(),
            transactions_root: Hash::empty_root().clone(),
            receipts_root: Hash::empty_root().clone(),
            logs_bloom: Bloom::default(),
            difficulty: U256::one(),
            number: 0,
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: 1_700_000_000,
            prev_randao: h(9),
            base_fee: U256::MAX.into(),
        };
        roundtrip(&header);
        assert_eq!(header.hash(), Hash::hash(&encode(&header)));
    }

    #[test]
    fn test_receipt_info_optional_contract() {
        let receipt = Receipt::new(true, 21_000, vec![sample_log(0)]);
        let mut info = ReceiptInfo {
            receipt,
            tx_hash: h(1),
            block_hash: h(2),
            block_number: 3,
            transaction_index: 0,
            gas_used: 21_000,
            contract_address: None,
            effective_gas_price: 1_000_000_000u64.into(),
        };
        roundtrip(&info);
        info.contract_address = Some(a(5));
        info.receipt = Receipt::new(false, 0, Vec::new());
        roundtrip(&info);
    }

    #[test]
    fn test_logs_and_locations() {
        roundtrip(&sample_log(0));
        roundtrip(&sample_log(4));
        roundtrip(&TransactionLocation {
            block_hash: h(3),
            block_number: u64::MAX,
            transaction_index: u32::MAX,
        });
        roundtrip(&FilteredLog {
            log: sample_log(2),
            block_hash: h(4),
            block_number: 12,
            transaction_hash: h(5),
            transaction_index: 1,
            log_index: 0,
            removed: true,
        });
    }

    #[test]
    fn test_too_many_topics() {
        let five = encode(&sample_log(5));
        assert!(matches!(
            decode::<Log>(&five),
            Err(CodecError::Arity { record: "topics", expected: 4, found: 5 })
        ));
        let filtered = encode(&FilteredLog {
            log: sample_log(5),
            block_hash: h(4),
            block_number: 1,
            transaction_hash: h(5),
            transaction_index: 0,
            log_index: 0,
            removed: false,
        });
        assert!(matches!(
            decode::<FilteredLog>(&filtered),
            Err(CodecError::Arity { record: "topics", .. })
        ));
    }

    #[test]
    fn test_filter_state() {
        let filter = LogFilter {
            from_block: Some(0),
            to_block: None,
            addresses: [a(1), a(2)].into_iter().collect(),
            topics: vec![BTreeSet::new(), [h(1), h(2)].into_iter().collect()],
        };
        roundtrip(&filter);
        roundtrip(&LogFilter::default());
        roundtrip(&FilterState {
            id: "0x1f".into(),
            kind: FilterKind::Log,
            log_filter: Some(filter),
            last_checked_block: 7,
            created_at: 1_700_000_000,
        });
        roundtrip(&FilterState {
            id: String::new(),
            kind: FilterKind::PendingTransaction,
            log_filter: None,
            last_checked_block: 0,
            created_at: 0,
        });
    }

    #[test]
    fn test_rejects_malformed() {
        let good = encode(&TransactionLocation {
            block_hash: h(3),
            block_number: 1,
            transaction_index: 2,
        });
        // trailing garbage
        let mut long = good.clone();
        long.push(0x00);
        assert!(matches!(
            decode::<TransactionLocation>(&long),
            Err(CodecError::TrailingBytes(1))
        ));
        // truncated
        assert!(decode::<TransactionLocation>(&good[..good.len() - 1]).is_err());
        assert!(decode::<TransactionLocation>(&[]).is_err());
        // wrong arity
        let mut s = RlpStream::new_list(2);
        s.append(&h(3)).append(&1u64);
        assert!(matches!(
            decode::<TransactionLocation>(&s.out()),
            Err(CodecError::Arity { expected: 3, found: 2, .. })
        ));
        // scalar where a record is expected
        assert!(matches!(
            decode::<TransactionLocation>(&encode(&5u64)),
            Err(CodecError::UnexpectedScalar(_))
        ));
        // short hash
        let mut s = RlpStream::new_list(3);
        s.append(&vec![1u8; 31]).append(&1u64).append(&2u64);
        assert!(matches!(
            decode::<TransactionLocation>(&s.out()),
            Err(CodecError::Length { expected: 32, found: 31, .. })
        ));
        // leading zero in an integer
        assert!(matches!(
            decode::<u64>(&[0x82, 0x00, 0x01]),
            Err(CodecError::NonCanonical(_))
        ));
        // nine bytes do not fit a u64
        assert!(matches!(
            decode::<u64>(&[0x89, 1, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::Overflow(_))
        ));
    }

    #[test]
    fn test_unknown_filter_kind() {
        let mut s = RlpStream::new_list(5);
        s.append(&"x".as_bytes())
            .append(&9u8)
            .append_empty_data()
            .append(&0u64)
            .append(&0u64);
        assert!(matches!(
            decode::<FilterState>(&s.out()),
            Err(CodecError::UnknownVariant { tag: 9, .. })
        ));
    }
}
