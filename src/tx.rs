//! Signed transaction envelopes: legacy (EIP-155 and unprotected), EIP-2930
//! and EIP-1559.

use once_cell::sync::OnceCell;
use rlp::RlpStream;
use thiserror::Error;

use crate::codec::{Decode, RlpNode};
use crate::common::{
    checked_as_u64, u256_1, Addr, Bytes, Gas, Hash, Wei, U256, U256RLP,
};
use crate::error::CodecError;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("empty envelope")]
    Empty,

    /// Typed envelopes other than EIP-2930 and EIP-1559.
    #[error("unsupported transaction type {0:#x}")]
    UnsupportedType(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    /// Typed transactions always carry a chain id.
    #[error("missing chain id")]
    MissingChainId,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxType {
    Legacy = 0x0,
    AccessList = 0x1,
    DynamicFee = 0x2,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TxFee {
    Legacy { gas_price: Wei },
    AccessList { gas_price: Wei },
    DynamicFee { max_fee: Wei, max_priority_fee: Wei },
}

impl Default for TxFee {
    fn default() -> Self {
        TxFee::Legacy {
            gas_price: Wei::default(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AccessTuple {
    pub address: Addr,
    pub storage_keys: Vec<Hash>,
}

impl rlp::Encodable for AccessTuple {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2).append(&self.address);
        s.begin_list(self.storage_keys.len());
        for k in self.storage_keys.iter() {
            s.append(k);
        }
    }
}

impl Decode for AccessTuple {
    fn from_node(node: &RlpNode, _: &'static str) -> Result<Self, CodecError> {
        let f = node.as_record("access_tuple", 2)?;
        Ok(AccessTuple {
            address: Decode::from_node(&f[0], "address")?,
            storage_keys: Decode::from_node(&f[1], "storage_keys")?,
        })
    }
}

/// The unsigned part of a transaction.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct TxRequest {
    /// `None` only for unprotected legacy transactions.
    pub chain_id: Option<u64>,
    pub nonce: u64,
    pub gas_limit: Gas,
    pub fee: TxFee,
    /// `None` creates a contract.
    pub to: Option<Addr>,
    pub value: Wei,
    pub data: Bytes,
    pub access_list: Vec<AccessTuple>,
}

impl TxRequest {
    pub fn type_(&self) -> TxType {
        match self.fee {
            TxFee::Legacy { .. } => TxType::Legacy,
            TxFee::AccessList { .. } => TxType::AccessList,
            TxFee::DynamicFee { .. } => TxType::DynamicFee,
        }
    }

    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// The most the sender may pay per unit of gas.
    pub fn fee_cap(&self) -> &Wei {
        match &self.fee {
            TxFee::Legacy { gas_price } |
            TxFee::AccessList { gas_price } => gas_price,
            TxFee::DynamicFee { max_fee, .. } => max_fee,
        }
    }

    pub fn tip_cap(&self) -> &Wei {
        match &self.fee {
            TxFee::Legacy { gas_price } |
            TxFee::AccessList { gas_price } => gas_price,
            TxFee::DynamicFee {
                max_priority_fee, ..
            } => max_priority_fee,
        }
    }

    /// `gas_price` for legacy and EIP-2930,
    /// `min(max_fee, base_fee + max_priority_fee)` for EIP-1559.
    pub fn effective_gas_price(&self, base_fee: &Wei) -> Wei {
        match &self.fee {
            TxFee::Legacy { gas_price } |
            TxFee::AccessList { gas_price } => gas_price.clone(),
            TxFee::DynamicFee {
                max_fee,
                max_priority_fee,
            } => match base_fee.checked_add(max_priority_fee) {
                Some(p) if &p < max_fee => p,
                _ => max_fee.clone(),
            },
        }
    }

    fn append_to(&self, s: &mut RlpStream) {
        match &self.to {
            Some(addr) => s.append(addr),
            None => s.append_empty_data(),
        };
    }

    fn append_access_list(&self, s: &mut RlpStream) {
        s.begin_list(self.access_list.len());
        for a in self.access_list.iter() {
            s.append(a);
        }
    }

    /// The digest the sender signs.
    pub fn sig_hash(&self) -> Result<Hash, TxError> {
        match &self.fee {
            TxFee::Legacy { gas_price } => {
                let mut s = RlpStream::new_list(match self.chain_id {
                    Some(_) => 9,
                    None => 6,
                });
                s.append(&self.nonce).append(gas_price).append(&self.gas_limit);
                self.append_to(&mut s);
                s.append(&self.value).append(&self.data);
                if let Some(chain_id) = self.chain_id {
                    // EIP-155
                    s.append(&chain_id).append(&0u8).append(&0u8);
                }
                Ok(Hash::hash(&s.out()))
            }
            TxFee::AccessList { gas_price } => {
                let chain_id = self.chain_id.ok_or(TxError::MissingChainId)?;
                let mut s = RlpStream::new_list(8);
                s.append(&chain_id)
                    .append(&self.nonce)
                    .append(gas_price)
                    .append(&self.gas_limit);
                self.append_to(&mut s);
                s.append(&self.value).append(&self.data);
                self.append_access_list(&mut s);
                let mut buff = vec![TxType::AccessList as u8];
                buff.extend_from_slice(&s.out());
                Ok(Hash::hash(&buff))
            }
            TxFee::DynamicFee {
                max_fee,
                max_priority_fee,
            } => {
                let chain_id = self.chain_id.ok_or(TxError::MissingChainId)?;
                let mut s = RlpStream::new_list(9);
                s.append(&chain_id)
                    .append(&self.nonce)
                    .append(max_priority_fee)
                    .append(max_fee)
                    .append(&self.gas_limit);
                self.append_to(&mut s);
                s.append(&self.value).append(&self.data);
                self.append_access_list(&mut s);
                let mut buff = vec![TxType::DynamicFee as u8];
                buff.extend_from_slice(&s.out());
                Ok(Hash::hash(&buff))
            }
        }
    }

    /// Signs the request. The produced signature is low-s.
    pub fn sign(self, secret: &libsecp256k1::SecretKey) -> Result<Tx, TxError> {
        let sig_hash = self.sig_hash()?;
        let msg = libsecp256k1::Message::parse_slice(sig_hash.as_bytes())
            .map_err(|_| TxError::InvalidSignature("digest"))?;
        let (sig, recid) = libsecp256k1::sign(&msg, secret);
        let recid = recid.serialize() as u64;
        let v = match (self.type_(), self.chain_id) {
            (TxType::AccessList, _) | (TxType::DynamicFee, _) => recid,
            (TxType::Legacy, Some(chain_id)) => chain_id
                .checked_mul(2)
                .and_then(|v| v.checked_add(35 + recid))
                .ok_or(TxError::InvalidSignature("chain id too large"))?,
            (TxType::Legacy, None) => 27 + recid,
        };
        let from = secret_to_addr(secret);
        let rs = sig.serialize();
        let sig = Signature {
            v,
            r: U256::from_big_endian(&rs[..32]),
            s: U256::from_big_endian(&rs[32..]),
        };
        Ok(Tx::assemble(self, sig, from))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    /// Raw `v` as it appears in the envelope (y-parity for EIP-1559).
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// A signed transaction with its recovered sender.
#[derive(Debug)]
pub struct Tx {
    req: TxRequest,
    sig: Signature,
    raw: Bytes,
    tx_hash: Hash,
    from: Addr,
}

impl std::ops::Deref for Tx {
    type Target = TxRequest;
    fn deref(&self) -> &TxRequest {
        &self.req
    }
}

impl Tx {
    fn assemble(req: TxRequest, sig: Signature, from: Addr) -> Self {
        let raw: Bytes = encode_envelope(&req, &sig).into();
        let tx_hash = Hash::hash(&raw);
        Self {
            req,
            sig,
            raw,
            tx_hash,
            from,
        }
    }

    pub fn from(&self) -> &Addr {
        &self.from
    }

    /// `keccak(envelope)`.
    pub fn hash(&self) -> &Hash {
        &self.tx_hash
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    pub fn request(&self) -> &TxRequest {
        &self.req
    }

    /// The raw signed envelope.
    pub fn encode(&self) -> Vec<u8> {
        self.raw.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Tx, TxError> {
        let first = *bytes.first().ok_or(TxError::Empty)?;
        let (req, sig, recid) = match first {
            0xc0..=0xff => decode_legacy(&RlpNode::parse(bytes)?)?,
            t if t == TxType::AccessList as u8 => {
                decode_access_list(&RlpNode::parse(&bytes[1..])?)?
            }
            t if t == TxType::DynamicFee as u8 => {
                decode_dynamic_fee(&RlpNode::parse(&bytes[1..])?)?
            }
            t if t < 0x80 => return Err(TxError::UnsupportedType(t)),
            _ => return Err(CodecError::UnexpectedScalar("transaction").into()),
        };
        let from = recover_plain(&req.sig_hash()?, &sig.r, &sig.s, recid)?;
        Ok(Self {
            req,
            sig,
            raw: bytes.into(),
            tx_hash: Hash::hash(bytes),
            from,
        })
    }
}

fn encode_envelope(req: &TxRequest, sig: &Signature) -> Vec<u8> {
    match &req.fee {
        TxFee::Legacy { gas_price } => {
            let mut s = RlpStream::new_list(9);
            s.append(&req.nonce).append(gas_price).append(&req.gas_limit);
            req.append_to(&mut s);
            s.append(&req.value)
                .append(&req.data)
                .append(&sig.v)
                .append(&U256RLP(sig.r))
                .append(&U256RLP(sig.s));
            s.out().to_vec()
        }
        TxFee::AccessList { gas_price } => {
            let mut s = RlpStream::new_list(11);
            s.append(&req.chain_id.unwrap_or_default())
                .append(&req.nonce)
                .append(gas_price)
                .append(&req.gas_limit);
            req.append_to(&mut s);
            s.append(&req.value).append(&req.data);
            req.append_access_list(&mut s);
            s.append(&sig.v)
                .append(&U256RLP(sig.r))
                .append(&U256RLP(sig.s));
            let mut buff = vec![TxType::AccessList as u8];
            buff.extend_from_slice(&s.out());
            buff
        }
        TxFee::DynamicFee {
            max_fee,
            max_priority_fee,
        } => {
            let mut s = RlpStream::new_list(12);
            s.append(&req.chain_id.unwrap_or_default())
                .append(&req.nonce)
                .append(max_priority_fee)
                .append(max_fee)
                .append(&req.gas_limit);
            req.append_to(&mut s);
            s.append(&req.value).append(&req.data);
            req.append_access_list(&mut s);
            s.append(&sig.v)
                .append(&U256RLP(sig.r))
                .append(&U256RLP(sig.s));
            let mut buff = vec![TxType::DynamicFee as u8];
            buff.extend_from_slice(&s.out());
            buff
        }
    }
}

fn decode_legacy(
    node: &RlpNode,
) -> Result<(TxRequest, Signature, u8), TxError> {
    let f = node.as_record("legacy_tx", 9)?;
    let v: U256 = Decode::from_node(&f[6], "v")?;
    let v = checked_as_u64(&v).ok_or(CodecError::Overflow("v"))?;
    let (chain_id, recid) = match v {
        27 | 28 => (None, (v - 27) as u8),
        v if v >= 35 => (Some((v - 35) / 2), ((v - 35) % 2) as u8),
        _ => return Err(TxError::InvalidSignature("v")),
    };
    let to: Option<Addr> = Decode::from_node(&f[3], "to")?;
    let req = TxRequest {
        chain_id,
        nonce: Decode::from_node(&f[0], "nonce")?,
        fee: TxFee::Legacy {
            gas_price: Decode::from_node(&f[1], "gas_price")?,
        },
        gas_limit: Decode::from_node(&f[2], "gas")?,
        to,
        value: Decode::from_node(&f[4], "value")?,
        data: Decode::from_node(&f[5], "data")?,
        access_list: Vec::new(),
    };
    let sig = Signature {
        v,
        r: Decode::from_node(&f[7], "r")?,
        s: Decode::from_node(&f[8], "s")?,
    };
    Ok((req, sig, recid))
}

fn y_parity(node: &RlpNode) -> Result<u64, TxError> {
    let v: u64 = Decode::from_node(node, "y_parity")?;
    if v > 1 {
        return Err(TxError::InvalidSignature("y parity"))
    }
    Ok(v)
}

fn decode_access_list(
    node: &RlpNode,
) -> Result<(TxRequest, Signature, u8), TxError> {
    let f = node.as_record("access_list_tx", 11)?;
    let v = y_parity(&f[8])?;
    let req = TxRequest {
        chain_id: Some(Decode::from_node(&f[0], "chain_id")?),
        nonce: Decode::from_node(&f[1], "nonce")?,
        fee: TxFee::AccessList {
            gas_price: Decode::from_node(&f[2], "gas_price")?,
        },
        gas_limit: Decode::from_node(&f[3], "gas")?,
        to: Decode::from_node(&f[4], "to")?,
        value: Decode::from_node(&f[5], "value")?,
        data: Decode::from_node(&f[6], "data")?,
        access_list: Decode::from_node(&f[7], "access_list")?,
    };
    let sig = Signature {
        v,
        r: Decode::from_node(&f[9], "r")?,
        s: Decode::from_node(&f[10], "s")?,
    };
    Ok((req, sig, v as u8))
}

fn decode_dynamic_fee(
    node: &RlpNode,
) -> Result<(TxRequest, Signature, u8), TxError> {
    let f = node.as_record("dynamic_fee_tx", 12)?;
    let v = y_parity(&f[9])?;
    let req = TxRequest {
        chain_id: Some(Decode::from_node(&f[0], "chain_id")?),
        nonce: Decode::from_node(&f[1], "nonce")?,
        fee: TxFee::DynamicFee {
            max_priority_fee: Decode::from_node(&f[2], "max_priority_fee")?,
            max_fee: Decode::from_node(&f[3], "max_fee")?,
        },
        gas_limit: Decode::from_node(&f[4], "gas")?,
        to: Decode::from_node(&f[5], "to")?,
        value: Decode::from_node(&f[6], "value")?,
        data: Decode::from_node(&f[7], "data")?,
        access_list: Decode::from_node(&f[8], "access_list")?,
    };
    let sig = Signature {
        v,
        r: Decode::from_node(&f[10], "r")?,
        s: Decode::from_node(&f[11], "s")?,
    };
    Ok((req, sig, v as u8))
}

const SECP256K1_N: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b,
    0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

#[inline]
fn secp256k1_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| U256::from_big_endian(&SECP256K1_N))
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| *secp256k1_n() / 2)
}

fn recover_plain(
    sig_hash: &Hash, r: &U256, s: &U256, recid: u8,
) -> Result<Addr, TxError> {
    // `ValidateSignatureValues` in geth, homestead rules
    if r < u256_1() || s < u256_1() {
        return Err(TxError::InvalidSignature("zero r or s"))
    }
    if r >= secp256k1_n() || s >= secp256k1_n() {
        return Err(TxError::InvalidSignature("r or s out of range"))
    }
    if s > secp256k1_half_n() {
        return Err(TxError::InvalidSignature("high s"))
    }
    let mut rs = [0u8; 64];
    r.to_big_endian(&mut rs[..32]);
    s.to_big_endian(&mut rs[32..]);
    let sig = libsecp256k1::Signature::parse_standard(&rs)
        .map_err(|_| TxError::InvalidSignature("encoding"))?;
    let msg = libsecp256k1::Message::parse_slice(sig_hash.as_bytes())
        .map_err(|_| TxError::InvalidSignature("digest"))?;
    let recid = libsecp256k1::RecoveryId::parse(recid)
        .map_err(|_| TxError::InvalidSignature("recovery id"))?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recid)
        .map_err(|_| TxError::InvalidSignature("recovery failed"))?;
    Ok(Addr::from_public_key(&pubkey.serialize()))
}

pub fn secret_to_addr(secret: &libsecp256k1::SecretKey) -> Addr {
    Addr::from_public_key(
        &libsecp256k1::PublicKey::from_secret_key(secret).serialize(),
    )
}

impl rlp::Encodable for Tx {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self.type_() {
            TxType::Legacy => s.append_raw(&self.raw, 1),
            // typed envelopes are opaque byte strings inside lists
            TxType::AccessList | TxType::DynamicFee => s.append(&self.raw),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn key(b: u8) -> libsecp256k1::SecretKey {
        libsecp256k1::SecretKey::parse(&[b; 32]).unwrap()
    }

    fn transfer(chain_id: Option<u64>) -> TxRequest {
        TxRequest {
            chain_id,
            nonce: 9,
            gas_limit: 21_000,
            fee: TxFee::Legacy {
                gas_price: 20_000_000_000u64.into(),
            },
            to: Some(Addr::from([0x35; 20])),
            value: Wei::from_ether(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_eip155_vector() {
        // EIP-155 example transaction, signed by key 0x4646..46
        let raw = hex::decode(
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83",
        )
        .unwrap();
        let tx = Tx::decode(&raw).unwrap();
        assert_eq!(tx.chain_id, Some(1));
        assert_eq!(tx.nonce, 9);
        assert_eq!(tx.request(), &transfer(Some(1)));
        assert_eq!(tx.from(), &secret_to_addr(&key(0x46)));
        assert_eq!(
            tx.sig_hash().unwrap(),
            Hash::from_str(
                "0xdaf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
            )
            .unwrap()
        );
        assert_eq!(tx.encode(), raw);
        assert_eq!(tx.hash(), &Hash::hash(&raw));
    }

    #[test]
    fn test_sign_legacy() {
        for chain_id in [None, Some(31337)] {
            let tx = transfer(chain_id).sign(&key(1)).unwrap();
            assert_eq!(tx.from(), &secret_to_addr(&key(1)));
            let decoded = Tx::decode(&tx.encode()).unwrap();
            assert_eq!(decoded.from(), tx.from());
            assert_eq!(decoded.hash(), tx.hash());
            assert_eq!(decoded.chain_id, chain_id);
        }
    }

    #[test]
    fn test_sign_dynamic_fee() {
        let req = TxRequest {
            chain_id: Some(1337),
            nonce: 0,
            gas_limit: 53_000,
            fee: TxFee::DynamicFee {
                max_fee: 3_000_000_000u64.into(),
                max_priority_fee: 1_000_000_000u64.into(),
            },
            to: None,
            data: Bytes::from(vec![0x60, 0x00]),
            access_list: vec![AccessTuple {
                address: Addr::from([7; 20]),
                storage_keys: vec![Hash::from(1u64)],
            }],
            ..Default::default()
        };
        let tx = req.clone().sign(&key(2)).unwrap();
        let raw = tx.encode();
        assert_eq!(raw[0], 0x02);
        let decoded = Tx::decode(&raw).unwrap();
        assert_eq!(decoded.request(), &req);
        assert_eq!(decoded.from(), &secret_to_addr(&key(2)));
        assert!(decoded.signature().v <= 1);

        let mut unsigned = req;
        unsigned.chain_id = None;
        assert!(matches!(
            unsigned.sign(&key(2)),
            Err(TxError::MissingChainId)
        ));
    }

    #[test]
    fn test_sign_access_list() {
        let req = TxRequest {
            chain_id: Some(31337),
            nonce: 4,
            gas_limit: 30_000,
            fee: TxFee::AccessList {
                gas_price: 2_000_000_000u64.into(),
            },
            to: Some(Addr::from([0x35; 20])),
            value: 5u64.into(),
            access_list: vec![AccessTuple {
                address: Addr::from([9; 20]),
                storage_keys: vec![Hash::from(3u64), Hash::from(4u64)],
            }],
            ..Default::default()
        };
        let tx = req.clone().sign(&key(5)).unwrap();
        let raw = tx.encode();
        assert_eq!(raw[0], 0x01);
        let decoded = Tx::decode(&raw).unwrap();
        assert_eq!(decoded.request(), &req);
        assert_eq!(decoded.type_(), TxType::AccessList);
        assert_eq!(decoded.from(), &secret_to_addr(&key(5)));
        assert_eq!(decoded.hash(), tx.hash());
        assert!(decoded.signature().v <= 1);
        assert_eq!(
            decoded.effective_gas_price(&7_000_000_000u64.into()),
            2_000_000_000u64.into()
        );

        // the digest commits to the type byte
        let mut legacy = req.clone();
        legacy.fee = TxFee::Legacy {
            gas_price: 2_000_000_000u64.into(),
        };
        assert_ne!(legacy.sig_hash().unwrap(), req.sig_hash().unwrap());

        let mut unsigned = req;
        unsigned.chain_id = None;
        assert!(matches!(
            unsigned.sign(&key(5)),
            Err(TxError::MissingChainId)
        ));
    }

    #[test]
    fn test_effective_gas_price() {
        let req = TxRequest {
            fee: TxFee::DynamicFee {
                max_fee: 30u64.into(),
                max_priority_fee: 2u64.into(),
            },
            ..Default::default()
        };
        assert_eq!(req.effective_gas_price(&10u64.into()), 12u64.into());
        assert_eq!(req.effective_gas_price(&29u64.into()), 30u64.into());
        assert_eq!(req.fee_cap(), &30u64.into());
        let legacy = transfer(Some(1));
        assert_eq!(
            legacy.effective_gas_price(&1u64.into()),
            20_000_000_000u64.into()
        );
    }

    #[test]
    fn test_rejects_bad_envelopes() {
        assert!(matches!(Tx::decode(&[]), Err(TxError::Empty)));
        assert!(matches!(
            Tx::decode(&[0x03, 0xc0]),
            Err(TxError::UnsupportedType(3))
        ));
        assert!(matches!(
            Tx::decode(&[0x01, 0xc0]),
            Err(TxError::Codec(_))
        ));
        let tx = transfer(Some(1)).sign(&key(3)).unwrap();
        // flip s to its high twin
        let mut sig = tx.signature().clone();
        sig.s = *secp256k1_n() - sig.s;
        let raw = encode_envelope(tx.request(), &sig);
        assert!(matches!(
            Tx::decode(&raw),
            Err(TxError::InvalidSignature("high s"))
        ));
        let mut truncated = tx.encode();
        truncated.pop();
        assert!(matches!(Tx::decode(&truncated), Err(TxError::Codec(_))));
    }
}
