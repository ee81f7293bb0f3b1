//! Validation and execution of a single transaction against the working
//! state.
//!
//! The processor owns the gas accounting and the value transfer. Contract
//! code is run by an [Executor]; the default [TransferExecutor] treats every
//! call as an immediate successful stop, so the node behaves like a
//! value-transfer chain unless a real interpreter is plugged in.

use async_trait::async_trait;
use log::debug;

use crate::block::BlockContext;
use crate::common::{create_addr, Addr, Bytes, Gas, Hash, Wei, U256};
use crate::error::TxRejection;
use crate::receipt::Log;
use crate::state::{MemState, StateR, StateW, Transferable};
use crate::tx::Tx;

pub const GAS_TX: Gas = 21000;
pub const GAS_TX_CREATE: Gas = 32000;
pub const GAS_TX_DATA_ZERO: Gas = 4;
pub const GAS_TX_DATA_NON_ZERO: Gas = 16;

/// `Error(string)` selector of Solidity revert payloads.
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Gas charged before any code runs.
pub fn intrinsic_gas(data: Option<&[u8]>, is_create: bool) -> Gas {
    let mut gas = GAS_TX;
    if is_create {
        gas += GAS_TX_CREATE
    }
    for b in data.unwrap_or_default() {
        gas += if *b == 0 {
            GAS_TX_DATA_ZERO
        } else {
            GAS_TX_DATA_NON_ZERO
        }
    }
    gas
}

/// A message handed to the executor once the processor has charged gas and
/// moved the value.
#[derive(Clone, Debug)]
pub struct Message {
    pub caller: Addr,
    /// The callee, or the new contract for a create.
    pub target: Addr,
    pub value: Wei,
    pub data: Bytes,
    /// Gas left after the intrinsic charge.
    pub gas: Gas,
    pub is_create: bool,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ExecStatus {
    Success,
    /// Raw revert payload.
    Revert(Bytes),
}

#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub gas_used: Gas,
    /// Return data; the runtime code for a successful create.
    pub output: Bytes,
    pub logs: Vec<Log>,
}

impl ExecOutcome {
    pub fn stop() -> Self {
        Self {
            status: ExecStatus::Success,
            gas_used: 0,
            output: Bytes::empty(),
            logs: Vec::new(),
        }
    }

    pub fn revert(payload: Bytes, gas_used: Gas) -> Self {
        Self {
            status: ExecStatus::Revert(payload),
            gas_used,
            output: Bytes::empty(),
            logs: Vec::new(),
        }
    }
}

/// Runs contract code. Writes go straight to `state`; the processor rolls
/// them back when the outcome is a revert.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self, msg: &Message, state: &mut MemState, block: &BlockContext,
    ) -> ExecOutcome;
}

/// Moves value only. Code, if any, is not interpreted.
#[derive(Default, Clone, Copy, Debug)]
pub struct TransferExecutor;

#[async_trait]
impl Executor for TransferExecutor {
    async fn execute(
        &self, _msg: &Message, _state: &mut MemState, _block: &BlockContext,
    ) -> ExecOutcome {
        ExecOutcome::stop()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TxStatus {
    Success,
    Reverted { reason: String },
    /// Turned away by validation; nothing was written.
    Rejected(TxRejection),
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub tx_hash: Hash,
    pub status: TxStatus,
    pub gas_used: Gas,
    pub return_data: Bytes,
    pub logs: Vec<Log>,
    pub contract_address: Option<Addr>,
    pub effective_gas_price: Wei,
}

impl ExecutionResult {
    pub fn rejected(tx_hash: Hash, reason: TxRejection) -> Self {
        Self {
            tx_hash,
            status: TxStatus::Rejected(reason),
            gas_used: 0,
            return_data: Bytes::empty(),
            logs: Vec::new(),
            contract_address: None,
            effective_gas_price: Wei::default(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == TxStatus::Success
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.status, TxStatus::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&TxRejection> {
        match &self.status {
            TxStatus::Rejected(r) => Some(r),
            _ => None,
        }
    }

    pub fn revert_reason(&self) -> Option<&str> {
        match &self.status {
            TxStatus::Reverted { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Checks nonce, funds and intrinsic gas, in that order. Returns the
/// intrinsic gas on success.
pub fn validate<S: StateR>(tx: &Tx, state: &S) -> Result<Gas, TxRejection> {
    let expected = state.get_nonce(tx.from());
    if tx.nonce < expected {
        return Err(TxRejection::NonceTooLow {
            expected,
            got: tx.nonce,
        })
    }
    if tx.nonce > expected {
        return Err(TxRejection::NonceTooHigh {
            expected,
            got: tx.nonce,
        })
    }

    let have = state.get_balance(tx.from());
    // U256 products of a u64 and a U256 may exceed U256; saturate so the
    // comparison still rejects
    let want = U256::from(tx.gas_limit)
        .checked_mul(*tx.fee_cap().as_ref())
        .and_then(|g| g.checked_add(*tx.value.as_ref()))
        .unwrap_or(U256::MAX);
    if have.as_ref() < &want {
        return Err(TxRejection::InsufficientFunds { have, want })
    }

    let need = intrinsic_gas(Some(&tx.data[..]), tx.is_create());
    if need > tx.gas_limit {
        return Err(TxRejection::IntrinsicGasTooLow {
            need,
            limit: tx.gas_limit,
        })
    }
    Ok(need)
}

/// Validates and applies `tx`. A rejection leaves `state` untouched; a
/// revert keeps only the nonce bump and the gas charge.
pub async fn execute(
    tx: &Tx, state: &mut MemState, block: &BlockContext,
    executor: &dyn Executor,
) -> ExecutionResult {
    let intrinsic = match validate(tx, &*state) {
        Ok(g) => g,
        Err(e) => return ExecutionResult::rejected(tx.hash().clone(), e),
    };
    let from = tx.from().clone();
    let price = tx.effective_gas_price(&block.base_fee);
    // price <= fee_cap, so validation already bounded this product
    let upfront = match Wei::for_gas(tx.gas_limit, &price) {
        Some(w) => w,
        None => {
            return ExecutionResult::rejected(
                tx.hash().clone(),
                TxRejection::InsufficientFunds {
                    have: state.get_balance(&from),
                    want: U256::MAX,
                },
            )
        }
    };

    state.set_nonce(&from, tx.nonce.saturating_add(1));
    let _ = state.sub_balance(&from, &upfront);

    let checkpoint = state.take_snapshot();
    let contract_address = if tx.is_create() {
        Some(create_addr(&from, tx.nonce))
    } else {
        None
    };
    let target = match (&contract_address, &tx.to) {
        (Some(a), _) | (None, Some(a)) => a.clone(),
        (None, None) => Addr::zero().clone(),
    };
    if contract_address.is_some() {
        state.set_nonce(&target, 1);
    }
    let msg = Message {
        caller: from.clone(),
        target: target.clone(),
        value: tx.value.clone(),
        data: tx.data.clone(),
        gas: tx.gas_limit - intrinsic,
        is_create: tx.is_create(),
    };
    let outcome = match state.transfer_balance(&from, &target, &tx.value) {
        Some(()) => executor.execute(&msg, state, block).await,
        None => ExecOutcome::revert(Bytes::empty(), 0),
    };

    let (status, logs, return_data) = match outcome.status {
        ExecStatus::Success => {
            if msg.is_create && !outcome.output.is_empty() {
                state.set_code(&target, &outcome.output);
            }
            (TxStatus::Success, outcome.logs, outcome.output)
        }
        ExecStatus::Revert(payload) => {
            if let Err(e) = state.revert_to_snapshot(checkpoint) {
                log::error!("lost transaction checkpoint: {}", e);
            }
            let reason = decode_revert_reason(&payload);
            (TxStatus::Reverted { reason }, Vec::new(), payload)
        }
    };
    let _ = state.release_snapshot(checkpoint);

    let gas_used = intrinsic
        .saturating_add(outcome.gas_used)
        .min(tx.gas_limit);
    if let Some(refund) = Wei::for_gas(tx.gas_limit - gas_used, &price) {
        let _ = state.add_balance(&from, &refund);
    }
    if let Some(fee) = Wei::for_gas(gas_used, &price) {
        if state.add_balance(&block.coinbase, &fee).is_none() {
            log::warn!("coinbase {} balance overflow", block.coinbase);
        }
    }

    debug!(
        "tx {} from {} nonce {}: {:?}, gas {}",
        tx.hash(),
        from,
        tx.nonce,
        status,
        gas_used
    );
    ExecutionResult {
        tx_hash: tx.hash().clone(),
        status,
        gas_used,
        return_data,
        logs,
        contract_address,
        effective_gas_price: price,
    }
}

/// Human-readable reason of a revert payload: the message of an
/// `Error(string)` payload, otherwise the payload in hex.
pub fn decode_revert_reason(payload: &[u8]) -> String {
    if payload.is_empty() {
        return "execution reverted".into()
    }
    if payload.len() >= 4 + 64 && payload[..4] == REVERT_SELECTOR {
        let body = &payload[4..];
        let offset = U256::from_big_endian(&body[..32]);
        let msg = crate::common::checked_as_u64(&offset)
            .map(|o| o as usize)
            .filter(|o| o.checked_add(32).map_or(false, |e| e <= body.len()))
            .and_then(|o| {
                let len = U256::from_big_endian(&body[o..o + 32]);
                let len = crate::common::checked_as_u64(&len)? as usize;
                body.get(o + 32..(o + 32).checked_add(len)?)
            })
            .and_then(|s| std::str::from_utf8(s).ok());
        if let Some(msg) = msg {
            return msg.to_string()
        }
    }
    format!("0x{}", hex::encode(payload))
}

/// A read-only call. Missing fields default to the zero address, the block
/// gas limit and no value.
#[derive(Clone, Default, Debug)]
pub struct CallRequest {
    pub from: Option<Addr>,
    pub to: Option<Addr>,
    pub gas: Option<Gas>,
    pub value: Wei,
    pub data: Bytes,
    /// Block whose post-state the call runs against; the head when `None`.
    pub block: Option<u64>,
}

/// Runs `req` against `state` without validation, nonce or fees. The caller
/// is expected to throw `state` away.
pub async fn simulate(
    req: &CallRequest, state: &mut MemState, block: &BlockContext,
    executor: &dyn Executor,
) -> ExecutionResult {
    let caller = req.from.clone().unwrap_or_else(|| Addr::zero().clone());
    let is_create = req.to.is_none();
    let intrinsic = intrinsic_gas(Some(&req.data[..]), is_create);
    let contract_address = if is_create {
        Some(create_addr(&caller, state.get_nonce(&caller)))
    } else {
        None
    };
    let target = match (&req.to, &contract_address) {
        (Some(a), _) | (None, Some(a)) => a.clone(),
        (None, None) => Addr::zero().clone(),
    };
    let msg = Message {
        caller,
        target,
        value: req.value.clone(),
        data: req.data.clone(),
        gas: req.gas.unwrap_or(block.gas_limit).saturating_sub(intrinsic),
        is_create,
    };
    let outcome =
        match state.transfer_balance(&msg.caller, &msg.target, &msg.value) {
            Some(()) => executor.execute(&msg, state, block).await,
            None => ExecOutcome::revert(Bytes::empty(), 0),
        };
    let gas_used = intrinsic.saturating_add(outcome.gas_used);
    let (status, logs, return_data) = match outcome.status {
        ExecStatus::Success => (TxStatus::Success, outcome.logs, outcome.output),
        ExecStatus::Revert(payload) => {
            let reason = decode_revert_reason(&payload);
            (TxStatus::Reverted { reason }, Vec::new(), payload)
        }
    };
    ExecutionResult {
        tx_hash: Hash::zero().clone(),
        status,
        gas_used,
        return_data,
        logs,
        contract_address,
        effective_gas_price: Wei::default(),
    }
}
