//! In-memory synthetic-asset protocol.
//!
//! [`MemoryChain`] implements [`SystemUnderTest`] with a small but faithful
//! model of the asset manager and its token: collateral reservations,
//! minting, FIFO redemption tickets, redemption payment and default, and
//! self-close. Calls are atomic: a reverted call leaves no trace.
//!
//! Logs of the token contract raised while calling the asset manager are
//! only reachable through the receipt's nested `raw_logs`, the way a tracing
//! node reports internal calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use vaultline_types::{
    Address, B256, CallRequest, ChainError, Query, RawLog, SimTime, TxReceipt, Value, keccak256,
};

use super::contracts::{
    AGENT_CAPACITY_LOTS, ASSET_MANAGER, FASSET, PAYMENT_WINDOW, asset_manager_abi, fasset_abi,
    lot_size, lots,
};
use crate::abi::ContractAbi;
use crate::error::Result;
use crate::sut::SystemUnderTest;

/// Underlying blocks a payer gets on top of the payment window.
const UNDERLYING_BLOCK_WINDOW: u64 = 150;

type CallResult<T> = std::result::Result<T, ChainError>;

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
struct Agent {
    owner: Address,
    minted: BigInt,
    reserved: BigInt,
    redeeming: BigInt,
    capacity: BigInt,
}

impl Agent {
    fn free(&self) -> BigInt {
        &self.capacity - &self.minted - &self.reserved - &self.redeeming
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    agent: Address,
    minter: Address,
    value: BigInt,
    deadline: SimTime,
}

#[derive(Debug, Clone)]
struct Redemption {
    agent: Address,
    redeemer: Address,
    value: BigInt,
    deadline: SimTime,
}

#[derive(Debug, Clone)]
struct Ticket {
    agent: Address,
    value: BigInt,
}

#[derive(Debug, Clone, Default)]
struct Ledger {
    agents: BTreeMap<Address, Agent>,
    reservations: BTreeMap<u64, Reservation>,
    redemptions: BTreeMap<u64, Redemption>,
    /// Redemption queue; ids grow, so iteration order is FIFO.
    tickets: BTreeMap<u64, Ticket>,
    balances: BTreeMap<Address, BigInt>,
    total_supply: BigInt,
    next_id: u64,
}

impl Ledger {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn balance(&self, holder: &Address) -> BigInt {
        self.balances.get(holder).cloned().unwrap_or_default()
    }

    fn agent_mut(&mut self, agent: &Address) -> CallResult<&mut Agent> {
        self.agents
            .get_mut(agent)
            .ok_or_else(|| ChainError::reverted("invalid agent vault"))
    }
}

/// A log waiting to be assigned its position in the block.
struct PendingLog {
    contract: Address,
    event: &'static str,
    values: Vec<Value>,
}

/// Execution context of one call, working on a copy of the ledger.
struct Execution {
    ledger: Ledger,
    from: Address,
    now: SimTime,
    underlying_height: u64,
    logs: Vec<PendingLog>,
}

impl Execution {
    fn emit(&mut self, contract: Address, event: &'static str, values: Vec<Value>) {
        self.logs.push(PendingLog {
            contract,
            event,
            values,
        });
    }

    fn mint_tokens(&mut self, to: Address, amount: &BigInt) {
        *self.ledger.balances.entry(to).or_default() += amount;
        self.ledger.total_supply += amount;
        self.emit(
            FASSET,
            "Transfer",
            vec![Address::ZERO.into(), to.into(), amount.into()],
        );
    }

    fn burn_tokens(&mut self, from: Address, amount: &BigInt) -> CallResult<()> {
        if self.ledger.balance(&from) < *amount {
            return Err(ChainError::reverted("f-asset balance too low"));
        }
        *self.ledger.balances.entry(from).or_default() -= amount;
        self.ledger.total_supply -= amount;
        self.emit(
            FASSET,
            "Transfer",
            vec![from.into(), Address::ZERO.into(), amount.into()],
        );
        Ok(())
    }

    /// Consumes tickets in queue order until `amount` is covered.
    ///
    /// With `only` set, just that agent's tickets are consumed. Returns the
    /// redeemed value per agent in order of first appearance.
    fn consume_tickets(
        &mut self,
        amount: &BigInt,
        only: Option<Address>,
    ) -> Vec<(Address, BigInt)> {
        let mut remaining = amount.clone();
        let mut per_agent: Vec<(Address, BigInt)> = Vec::new();
        let ids: Vec<u64> = self
            .ledger
            .tickets
            .iter()
            .filter(|(_, t)| only.is_none_or(|a| a == t.agent))
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if !remaining.is_positive() {
                break;
            }
            let Some(ticket) = self.ledger.tickets.get_mut(&id) else {
                continue;
            };
            let agent = ticket.agent;
            let taken = if ticket.value <= remaining {
                let taken = ticket.value.clone();
                self.ledger.tickets.remove(&id);
                self.emit(
                    ASSET_MANAGER,
                    "RedemptionTicketDeleted",
                    vec![agent.into(), id.into()],
                );
                taken
            } else {
                ticket.value -= &remaining;
                let left = ticket.value.clone();
                self.emit(
                    ASSET_MANAGER,
                    "RedemptionTicketUpdated",
                    vec![agent.into(), id.into(), left.into()],
                );
                remaining.clone()
            };
            remaining -= &taken;
            match per_agent.iter_mut().find(|(a, _)| *a == agent) {
                Some((_, total)) => *total += taken,
                None => per_agent.push((agent, taken)),
            }
        }
        per_agent
    }
}

// ============================================================================
// Memory Chain
// ============================================================================

/// Deterministic in-memory implementation of the protocol.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    asset_manager_abi: Arc<ContractAbi>,
    fasset_abi: Arc<ContractAbi>,
    ledger: Ledger,
    timestamp: SimTime,
    block_number: u64,
    underlying_height: u64,
    nested_logs: bool,
    /// Amount added to the first agent's reported `minted` once the given
    /// block height is reached.
    minted_drift: Option<(BigInt, u64)>,
}

impl MemoryChain {
    pub fn new(start: SimTime) -> Result<Self> {
        Ok(Self {
            asset_manager_abi: Arc::new(asset_manager_abi()?),
            fasset_abi: Arc::new(fasset_abi()?),
            ledger: Ledger::default(),
            timestamp: start,
            block_number: 0,
            underlying_height: 0,
            nested_logs: true,
            minted_drift: None,
        })
    }

    /// Reports every log in the flat `logs` list instead of `raw_logs`.
    pub fn with_flat_logs(mut self) -> Self {
        self.nested_logs = false;
        self
    }

    /// Makes `getAgentInfo` misreport the first agent's minted amount by
    /// `delta` once `from_block` has been mined.
    pub fn with_minted_drift(mut self, delta: impl Into<BigInt>, from_block: u64) -> Self {
        self.minted_drift = Some((delta.into(), from_block));
        self
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn underlying_height(&self) -> u64 {
        self.underlying_height
    }

    pub fn agent_count(&self) -> usize {
        self.ledger.agents.len()
    }

    fn execute(&self, call: &CallRequest) -> CallResult<(Ledger, Vec<PendingLog>)> {
        let mut exec = Execution {
            ledger: self.ledger.clone(),
            from: call.from,
            now: self.timestamp,
            underlying_height: self.underlying_height,
            logs: Vec::new(),
        };

        let method = call.method.as_str();
        let args = &call.args;
        if call.to == ASSET_MANAGER {
            match method {
                "createAgentVault" => create_agent_vault(&mut exec, args)?,
                "reserveCollateral" => reserve_collateral(&mut exec, args)?,
                "executeMinting" => execute_minting(&mut exec, args)?,
                "mintingPaymentDefault" => minting_payment_default(&mut exec, args)?,
                "redeem" => redeem(&mut exec, args)?,
                "confirmRedemptionPayment" => confirm_redemption_payment(&mut exec, args)?,
                "redemptionPaymentDefault" => redemption_payment_default(&mut exec, args)?,
                "selfClose" => self_close(&mut exec, args)?,
                _ => return Err(unknown_method(call.to, method)),
            }
        } else if call.to == FASSET {
            match method {
                "transfer" => transfer(&mut exec, args)?,
                _ => return Err(unknown_method(call.to, method)),
            }
        } else {
            return Err(ChainError::UnknownContract(call.to));
        }

        Ok((exec.ledger, exec.logs))
    }

    fn encode_logs(
        &self,
        pending: Vec<PendingLog>,
        tx_hash: B256,
        block_hash: B256,
        tx_index: u64,
        log_index: &mut u64,
    ) -> CallResult<Vec<RawLog>> {
        let mut logs = Vec::with_capacity(pending.len());
        for log in pending {
            let abi = if log.contract == FASSET {
                &self.fasset_abi
            } else {
                &self.asset_manager_abi
            };
            let schema = abi
                .event(log.event)
                .ok_or_else(|| ChainError::InvalidArguments(format!("no schema for {}", log.event)))?;
            let (topics, data) = schema
                .encode(&log.values)
                .map_err(|err| ChainError::InvalidArguments(err.to_string()))?;
            logs.push(RawLog {
                address: log.contract,
                topics,
                data,
                block_number: self.block_number,
                block_hash,
                tx_hash,
                tx_index,
                log_index: *log_index,
            });
            *log_index += 1;
        }
        Ok(logs)
    }

    fn agent_info(&self, args: &[Value]) -> CallResult<Vec<Value>> {
        let agent_address = address_arg(args, 0)?;
        let agent = self
            .ledger
            .agents
            .get(&agent_address)
            .ok_or_else(|| ChainError::reverted("invalid agent vault"))?;

        let mut minted = agent.minted.clone();
        if let Some((delta, from_block)) = &self.minted_drift {
            let first = self.ledger.agents.keys().next();
            if self.block_number >= *from_block && first == Some(&agent_address) {
                minted += delta;
            }
        }
        Ok(vec![
            minted.into(),
            agent.reserved.clone().into(),
            agent.redeeming.clone().into(),
            agent.free().into(),
            agent.owner.into(),
        ])
    }
}

impl SystemUnderTest for MemoryChain {
    fn name(&self) -> &str {
        "memory-chain"
    }

    fn mine_block(&mut self, calls: &[CallRequest]) -> Vec<Result<TxReceipt, ChainError>> {
        self.block_number += 1;
        let block_hash = keccak256(format!("block:{}", self.block_number));
        let mut log_index = 0;
        let mut results = Vec::with_capacity(calls.len());

        for (tx_index, call) in (0u64..).zip(calls) {
            let tx_hash = keccak256(format!("tx:{}:{tx_index}", self.block_number));
            let outcome = self.execute(call).and_then(|(ledger, pending)| {
                let logs =
                    self.encode_logs(pending, tx_hash, block_hash, tx_index, &mut log_index)?;
                Ok((ledger, logs))
            });
            let (ledger, logs) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    results.push(Err(err));
                    continue;
                }
            };
            self.ledger = ledger;

            let (flat, raw_logs) = if self.nested_logs {
                let flat = logs.iter().filter(|l| l.address == call.to).cloned().collect();
                (flat, Some(logs))
            } else {
                (logs, None)
            };
            results.push(Ok(TxReceipt {
                tx_hash,
                block_number: self.block_number,
                block_hash,
                tx_index,
                from: call.from,
                to: call.to,
                logs: flat,
                raw_logs,
            }));
        }
        results
    }

    fn query(&self, query: &Query) -> Result<Vec<Value>, ChainError> {
        let method = query.method.as_str();
        if query.contract == ASSET_MANAGER {
            match method {
                "getAgentInfo" => self.agent_info(&query.args),
                "lotSize" => Ok(vec![lot_size().into()]),
                _ => Err(unknown_method(query.contract, method)),
            }
        } else if query.contract == FASSET {
            match method {
                "balanceOf" => {
                    let holder = address_arg(&query.args, 0)?;
                    Ok(vec![self.ledger.balance(&holder).into()])
                }
                "totalSupply" => Ok(vec![self.ledger.total_supply.clone().into()]),
                _ => Err(unknown_method(query.contract, method)),
            }
        } else {
            Err(ChainError::UnknownContract(query.contract))
        }
    }

    fn timestamp(&self) -> SimTime {
        self.timestamp
    }

    fn increase_time(&mut self, seconds: u64) {
        self.timestamp += seconds;
    }

    fn mine_underlying_blocks(&mut self, count: u64) {
        self.underlying_height += count;
    }
}

// ============================================================================
// Asset Manager Methods
// ============================================================================

fn create_agent_vault(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let vault = address_arg(args, 0)?;
    if vault == Address::ZERO || exec.ledger.agents.contains_key(&vault) {
        return Err(ChainError::reverted("agent vault already exists"));
    }
    exec.ledger.agents.insert(
        vault,
        Agent {
            owner: exec.from,
            minted: BigInt::zero(),
            reserved: BigInt::zero(),
            redeeming: BigInt::zero(),
            capacity: lots(AGENT_CAPACITY_LOTS),
        },
    );
    let owner = exec.from;
    exec.emit(
        ASSET_MANAGER,
        "AgentVaultCreated",
        vec![owner.into(), vault.into()],
    );
    Ok(())
}

fn reserve_collateral(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let vault = address_arg(args, 0)?;
    let lot_count = int_arg(args, 1)?;
    if !lot_count.is_positive() {
        return Err(ChainError::reverted("cannot mint 0 lots"));
    }
    let value = lot_size() * &lot_count;
    let agent = exec.ledger.agent_mut(&vault)?;
    if value > agent.free() {
        return Err(ChainError::reverted("not enough free collateral"));
    }
    agent.reserved += &value;

    let id = exec.ledger.next_id();
    let deadline = exec.now + PAYMENT_WINDOW;
    let minter = exec.from;
    exec.ledger.reservations.insert(
        id,
        Reservation {
            agent: vault,
            minter,
            value: value.clone(),
            deadline,
        },
    );
    let last_block = exec.underlying_height + UNDERLYING_BLOCK_WINDOW;
    exec.emit(
        ASSET_MANAGER,
        "CollateralReserved",
        vec![
            vault.into(),
            minter.into(),
            id.into(),
            value.into(),
            0u64.into(),
            last_block.into(),
            deadline.into(),
            format!("underlying:{vault}").into(),
        ],
    );
    Ok(())
}

fn execute_minting(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let id = id_arg(args, 0)?;
    let reservation = exec
        .ledger
        .reservations
        .remove(&id)
        .ok_or_else(|| ChainError::reverted("invalid crt id"))?;
    if exec.from != reservation.minter {
        return Err(ChainError::reverted("only minter"));
    }
    let agent = exec.ledger.agent_mut(&reservation.agent)?;
    agent.reserved -= &reservation.value;
    agent.minted += &reservation.value;

    let ticket = exec.ledger.next_id();
    exec.ledger.tickets.insert(
        ticket,
        Ticket {
            agent: reservation.agent,
            value: reservation.value.clone(),
        },
    );

    exec.emit(
        ASSET_MANAGER,
        "MintingExecuted",
        vec![
            reservation.agent.into(),
            id.into(),
            (&reservation.value).into(),
            0u64.into(),
            0u64.into(),
        ],
    );
    exec.emit(
        ASSET_MANAGER,
        "RedemptionTicketCreated",
        vec![
            reservation.agent.into(),
            ticket.into(),
            (&reservation.value).into(),
        ],
    );
    exec.mint_tokens(reservation.minter, &reservation.value);
    Ok(())
}

fn minting_payment_default(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let id = id_arg(args, 0)?;
    let reservation = exec
        .ledger
        .reservations
        .remove(&id)
        .ok_or_else(|| ChainError::reverted("invalid crt id"))?;
    if exec.now <= reservation.deadline {
        return Err(ChainError::reverted(
            "minting non-payment proof window too short",
        ));
    }
    exec.ledger.agent_mut(&reservation.agent)?.reserved -= &reservation.value;
    exec.emit(
        ASSET_MANAGER,
        "MintingPaymentDefault",
        vec![
            reservation.agent.into(),
            reservation.minter.into(),
            id.into(),
            reservation.value.into(),
        ],
    );
    Ok(())
}

fn redeem(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let lot_count = int_arg(args, 0)?;
    if !lot_count.is_positive() {
        return Err(ChainError::reverted("cannot redeem 0 lots"));
    }
    let requested = lot_size() * &lot_count;
    let redeemer = exec.from;
    if exec.ledger.balance(&redeemer) < requested {
        return Err(ChainError::reverted("f-asset balance too low"));
    }
    if exec.ledger.tickets.is_empty() {
        return Err(ChainError::reverted("redemption queue empty"));
    }

    let per_agent = exec.consume_tickets(&requested, None);
    let mut redeemed = BigInt::zero();
    for (vault, value) in per_agent {
        let agent = exec.ledger.agent_mut(&vault)?;
        agent.minted -= &value;
        agent.redeeming += &value;

        let id = exec.ledger.next_id();
        let deadline = exec.now + PAYMENT_WINDOW;
        exec.ledger.redemptions.insert(
            id,
            Redemption {
                agent: vault,
                redeemer,
                value: value.clone(),
                deadline,
            },
        );
        let last_block = exec.underlying_height + UNDERLYING_BLOCK_WINDOW;
        exec.emit(
            ASSET_MANAGER,
            "RedemptionRequested",
            vec![
                vault.into(),
                redeemer.into(),
                id.into(),
                format!("underlying:{redeemer}").into(),
                (&value).into(),
                0u64.into(),
                last_block.into(),
                deadline.into(),
            ],
        );
        redeemed += value;
    }
    exec.burn_tokens(redeemer, &redeemed)
}

fn confirm_redemption_payment(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let id = id_arg(args, 0)?;
    let redemption = exec
        .ledger
        .redemptions
        .remove(&id)
        .ok_or_else(|| ChainError::reverted("invalid request id"))?;
    let agent = exec.ledger.agent_mut(&redemption.agent)?;
    if agent.owner != exec.from {
        return Err(ChainError::reverted("only agent vault owner"));
    }
    agent.redeeming -= &redemption.value;

    let payment = keccak256(format!("payment:{id}"));
    exec.emit(
        ASSET_MANAGER,
        "RedemptionPerformed",
        vec![
            redemption.agent.into(),
            redemption.redeemer.into(),
            id.into(),
            Value::FixedBytes(payment.to_vec()),
            (&redemption.value).into(),
            redemption.value.into(),
        ],
    );
    Ok(())
}

fn redemption_payment_default(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let id = id_arg(args, 0)?;
    let redemption = exec
        .ledger
        .redemptions
        .remove(&id)
        .ok_or_else(|| ChainError::reverted("invalid request id"))?;
    if exec.now <= redemption.deadline {
        return Err(ChainError::reverted(
            "redemption non-payment proof window too short",
        ));
    }
    exec.ledger.agent_mut(&redemption.agent)?.redeeming -= &redemption.value;

    let vault_collateral = &redemption.value * 2u32;
    exec.emit(
        ASSET_MANAGER,
        "RedemptionDefault",
        vec![
            redemption.agent.into(),
            redemption.redeemer.into(),
            id.into(),
            redemption.value.into(),
            vault_collateral.into(),
            0u64.into(),
        ],
    );
    Ok(())
}

fn self_close(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let vault = address_arg(args, 0)?;
    let amount = int_arg(args, 1)?;
    let owner = exec.ledger.agent_mut(&vault)?.owner;
    if owner != exec.from {
        return Err(ChainError::reverted("only agent vault owner"));
    }
    if exec.ledger.balance(&owner) < amount {
        return Err(ChainError::reverted("f-asset balance too low"));
    }

    let closed: BigInt = exec
        .consume_tickets(&amount, Some(vault))
        .into_iter()
        .map(|(_, value)| value)
        .sum();
    if closed.is_zero() {
        return Err(ChainError::reverted("nothing to self-close"));
    }
    exec.ledger.agent_mut(&vault)?.minted -= &closed;
    exec.emit(
        ASSET_MANAGER,
        "SelfClose",
        vec![vault.into(), (&closed).into()],
    );
    exec.burn_tokens(owner, &closed)
}

// ============================================================================
// Token Methods
// ============================================================================

fn transfer(exec: &mut Execution, args: &[Value]) -> CallResult<()> {
    let to = address_arg(args, 0)?;
    let amount = int_arg(args, 1)?;
    if amount.is_negative() {
        return Err(ChainError::InvalidArguments("negative amount".to_string()));
    }
    if to == Address::ZERO {
        return Err(ChainError::reverted("transfer to the zero address"));
    }
    let from = exec.from;
    if exec.ledger.balance(&from) < amount {
        return Err(ChainError::reverted("f-asset balance too low"));
    }
    *exec.ledger.balances.entry(from).or_default() -= &amount;
    *exec.ledger.balances.entry(to).or_default() += &amount;
    exec.emit(FASSET, "Transfer", vec![from.into(), to.into(), amount.into()]);
    Ok(())
}

// ============================================================================
// Argument Helpers
// ============================================================================

fn address_arg(args: &[Value], index: usize) -> CallResult<Address> {
    args.get(index)
        .and_then(Value::as_address)
        .ok_or_else(|| ChainError::InvalidArguments(format!("argument {index} must be an address")))
}

fn int_arg(args: &[Value], index: usize) -> CallResult<BigInt> {
    args.get(index)
        .and_then(Value::as_int)
        .cloned()
        .ok_or_else(|| ChainError::InvalidArguments(format!("argument {index} must be an integer")))
}

fn id_arg(args: &[Value], index: usize) -> CallResult<u64> {
    let id = int_arg(args, index)?;
    u64::try_from(&id)
        .map_err(|_| ChainError::InvalidArguments(format!("argument {index} is not a valid id")))
}

fn unknown_method(contract: Address, method: &str) -> ChainError {
    ChainError::UnknownMethod {
        contract,
        method: method.to_string(),
    }
}
