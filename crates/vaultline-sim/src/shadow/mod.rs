//! Shadow state: the protocol as reconstructed from decoded events.
//!
//! The shadow state is the only component allowed to interpret protocol
//! events. It is updated by [`ShadowState::apply`], one idempotent handler per
//! event type, and compared against live queries by
//! [`ShadowState::check_invariants`]. Both take `&mut self`, so application
//! and reconciliation can never interleave.
//!
//! Idempotence is enforced at two levels:
//! - an event identity `(tx hash, log index)` is applied at most once;
//! - each request identity (reservation, redemption, core-vault return or
//!   redemption ticket id) is opened and settled at most once, whichever
//!   event settles it first.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use num_bigint::BigInt;
use num_traits::Zero;
use serde::Serialize;
use vaultline_types::{Address, B256};

use crate::decoder::DecodedEvent;
use crate::error::Result;

mod agent;
mod invariants;

pub use agent::{AgentRecord, AgentSummary};
pub use invariants::{AgentSnapshot, InvariantReport, InvariantViolation, QueryOracle, StateOracle};

/// Asset manager events the shadow state interprets.
pub const ASSET_MANAGER_EVENTS: &[&str] = &[
    "AgentVaultCreated",
    "AgentDestroyed",
    "CollateralReserved",
    "MintingExecuted",
    "MintingPaymentDefault",
    "CollateralReservationDeleted",
    "RedemptionTicketCreated",
    "RedemptionTicketUpdated",
    "RedemptionTicketDeleted",
    "DustChanged",
    "RedemptionRequested",
    "RedemptionPerformed",
    "RedemptionDefault",
    "RedemptionPaymentFailed",
    "RedemptionPaymentBlocked",
    "SelfClose",
    "LiquidationPerformed",
    "TransferToCoreVaultStarted",
    "TransferToCoreVaultSuccessful",
    "ReturnFromCoreVaultRequested",
    "ReturnFromCoreVaultConfirmed",
    "ReturnFromCoreVaultCancelled",
];

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event identity was applied before.
    Duplicate,
    /// Not an event of the modeled contracts.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RequestKind {
    Reservation,
    Redemption,
    Return,
    Ticket,
}

enum Settlement {
    /// Settled now; carries the value the request was opened with.
    Opened(BigInt),
    /// Settled now, but the opening event was never seen.
    Unknown,
    /// Settled earlier by another event.
    Repeat,
}

/// Event application counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShadowStats {
    pub applied: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub checks_run: u64,
}

// ============================================================================
// Shadow State
// ============================================================================

/// Locally reconstructed protocol state.
#[derive(Debug, Clone)]
pub struct ShadowState {
    asset_manager: Address,
    fasset: Address,
    agents: BTreeMap<Address, AgentRecord>,
    balances: BTreeMap<Address, BigInt>,
    total_supply: BigInt,
    applied: HashSet<(B256, u64)>,
    settled: BTreeSet<(RequestKind, BigInt)>,
    stats: ShadowStats,
}

impl ShadowState {
    /// Creates an empty shadow of the given asset manager and synthetic token.
    pub fn new(asset_manager: Address, fasset: Address) -> Self {
        Self {
            asset_manager,
            fasset,
            agents: BTreeMap::new(),
            balances: BTreeMap::new(),
            total_supply: BigInt::zero(),
            applied: HashSet::new(),
            settled: BTreeSet::new(),
            stats: ShadowStats::default(),
        }
    }

    pub fn asset_manager(&self) -> Address {
        self.asset_manager
    }

    pub fn fasset(&self) -> Address {
        self.fasset
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentRecord> {
        self.agents.values()
    }

    pub fn agent(&self, address: Address) -> Option<&AgentRecord> {
        self.agents.get(&address)
    }

    /// Shadow balance of a holder; zero for holders never seen.
    pub fn balance_of(&self, holder: Address) -> BigInt {
        self.balances.get(&holder).cloned().unwrap_or_default()
    }

    pub fn holders(&self) -> impl Iterator<Item = (&Address, &BigInt)> {
        self.balances.iter()
    }

    pub fn total_supply(&self) -> &BigInt {
        &self.total_supply
    }

    pub fn stats(&self) -> &ShadowStats {
        &self.stats
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.values().map(AgentRecord::summary).collect()
    }

    /// Applies one decoded event.
    pub fn apply(&mut self, event: &DecodedEvent) -> Result<ApplyOutcome> {
        let modeled = if event.address == self.asset_manager {
            ASSET_MANAGER_EVENTS.contains(&event.event.as_str())
        } else {
            event.address == self.fasset && event.event == "Transfer"
        };
        if !modeled {
            self.stats.ignored += 1;
            return Ok(ApplyOutcome::Ignored);
        }
        if self.applied.contains(&event.id()) {
            self.stats.duplicates += 1;
            tracing::trace!(event = %event, tx = %event.tx_hash, log = event.log_index, "skipped replayed event");
            return Ok(ApplyOutcome::Duplicate);
        }

        self.handle(event)?;
        self.applied.insert(event.id());
        self.stats.applied += 1;
        Ok(ApplyOutcome::Applied)
    }

    /// Every handler reads all of its fields before touching state, so a
    /// malformed event leaves the shadow unchanged.
    fn handle(&mut self, event: &DecodedEvent) -> Result<()> {
        match event.event.as_str() {
            "Transfer" => self.on_transfer(event)?,
            "AgentVaultCreated" => {
                let agent = event.address_arg("agentVault")?;
                let owner = event.address_arg("owner")?;
                self.agent_mut(agent).owner = Some(owner);
            }
            "AgentDestroyed" => {
                let agent = event.address_arg("agentVault")?;
                self.agent_mut(agent).destroyed = true;
            }
            "CollateralReserved" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("collateralReservationId")?.clone();
                let value = event.int("valueUBA")?.clone();
                if self.open(RequestKind::Reservation, agent, id, value.clone()) {
                    self.agent_mut(agent).reserved += value;
                }
            }
            "MintingExecuted" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("collateralReservationId")?.clone();
                let minted = event.int("mintedAmountUBA")? + event.int("poolFeeUBA")?;
                match self.settle(RequestKind::Reservation, agent, id) {
                    Settlement::Repeat => {}
                    settlement => {
                        let record = self.agent_mut(agent);
                        if let Settlement::Opened(reserved) = settlement {
                            record.reserved -= reserved;
                        }
                        record.minted += minted;
                    }
                }
            }
            "MintingPaymentDefault" | "CollateralReservationDeleted" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("collateralReservationId")?.clone();
                if let Settlement::Opened(reserved) =
                    self.settle(RequestKind::Reservation, agent, id)
                {
                    self.agent_mut(agent).reserved -= reserved;
                }
            }
            "RedemptionTicketCreated" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("redemptionTicketId")?.clone();
                let value = event.int("ticketValueUBA")?.clone();
                self.open(RequestKind::Ticket, agent, id, value);
            }
            "RedemptionTicketUpdated" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("redemptionTicketId")?.clone();
                let value = event.int("ticketValueUBA")?.clone();
                if !self.settled.contains(&(RequestKind::Ticket, id.clone())) {
                    self.agent_mut(agent).tickets.insert(id, value);
                }
            }
            "RedemptionTicketDeleted" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("redemptionTicketId")?.clone();
                self.settle(RequestKind::Ticket, agent, id);
            }
            "DustChanged" => {
                let agent = event.address_arg("agentVault")?;
                let dust = event.int("dustUBA")?.clone();
                self.agent_mut(agent).dust = dust;
            }
            "RedemptionRequested" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("requestId")?.clone();
                let value = event.int("valueUBA")?.clone();
                self.open_redemption(agent, id, value);
            }
            "TransferToCoreVaultStarted" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("transferRedemptionRequestId")?.clone();
                let value = event.int("valueUBA")?.clone();
                self.open_redemption(agent, id, value);
            }
            "RedemptionPerformed"
            | "RedemptionDefault"
            | "RedemptionPaymentFailed"
            | "RedemptionPaymentBlocked" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("requestId")?.clone();
                if let Settlement::Opened(value) = self.settle(RequestKind::Redemption, agent, id) {
                    self.agent_mut(agent).redeeming -= value;
                }
            }
            "TransferToCoreVaultSuccessful" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("transferRedemptionRequestId")?.clone();
                let transferred = event.int("valueUBA")?.clone();
                match self.settle(RequestKind::Redemption, agent, id) {
                    Settlement::Repeat => {}
                    settlement => {
                        let record = self.agent_mut(agent);
                        if let Settlement::Opened(value) = settlement {
                            record.redeeming -= value;
                        }
                        record.core_vault += transferred;
                    }
                }
            }
            "SelfClose" | "LiquidationPerformed" => {
                let agent = event.address_arg("agentVault")?;
                let value = event.int("valueUBA")?.clone();
                self.agent_mut(agent).minted -= value;
            }
            "ReturnFromCoreVaultRequested" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("requestId")?.clone();
                let value = event.int("valueUBA")?.clone();
                if self.open(RequestKind::Return, agent, id, value.clone()) {
                    self.agent_mut(agent).reserved += value;
                }
            }
            "ReturnFromCoreVaultConfirmed" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("requestId")?.clone();
                let received = event.int("receivedUnderlyingUBA")?.clone();
                let reminted = event.int("remintedUBA")?.clone();
                match self.settle(RequestKind::Return, agent, id) {
                    Settlement::Repeat => {}
                    settlement => {
                        let record = self.agent_mut(agent);
                        if let Settlement::Opened(value) = settlement {
                            record.reserved -= value;
                        }
                        record.minted += reminted;
                        record.core_vault -= received;
                    }
                }
            }
            "ReturnFromCoreVaultCancelled" => {
                let agent = event.address_arg("agentVault")?;
                let id = event.int("requestId")?.clone();
                if let Settlement::Opened(value) = self.settle(RequestKind::Return, agent, id) {
                    self.agent_mut(agent).reserved -= value;
                }
            }
            other => {
                tracing::warn!(event = other, "modeled event without a handler");
            }
        }
        Ok(())
    }

    fn on_transfer(&mut self, event: &DecodedEvent) -> Result<()> {
        let from = event.address_arg("from")?;
        let to = event.address_arg("to")?;
        let value = event.int("value")?;

        if from == Address::ZERO {
            self.total_supply += value;
        } else {
            *self.balances.entry(from).or_default() -= value;
        }
        if to == Address::ZERO {
            self.total_supply -= value;
        } else {
            *self.balances.entry(to).or_default() += value;
        }
        Ok(())
    }

    fn open_redemption(&mut self, agent: Address, id: BigInt, value: BigInt) {
        if self.open(RequestKind::Redemption, agent, id, value.clone()) {
            let record = self.agent_mut(agent);
            record.minted -= &value;
            record.redeeming += value;
        }
    }

    fn agent_mut(&mut self, agent: Address) -> &mut AgentRecord {
        self.agents
            .entry(agent)
            .or_insert_with(|| AgentRecord::new(agent))
    }

    /// Opens a request. Returns false if it is already open or settled.
    fn open(&mut self, kind: RequestKind, agent: Address, id: BigInt, value: BigInt) -> bool {
        if self.settled.contains(&(kind, id.clone())) {
            return false;
        }
        let requests = requests_mut(self.agent_mut(agent), kind);
        if requests.contains_key(&id) {
            return false;
        }
        requests.insert(id, value);
        true
    }

    fn settle(&mut self, kind: RequestKind, agent: Address, id: BigInt) -> Settlement {
        if !self.settled.insert((kind, id.clone())) {
            return Settlement::Repeat;
        }
        match requests_mut(self.agent_mut(agent), kind).remove(&id) {
            Some(value) => Settlement::Opened(value),
            None => {
                tracing::warn!(%agent, ?kind, %id, "settled a request that was never opened");
                Settlement::Unknown
            }
        }
    }

    // ========================================================================
    // Fingerprint
    // ========================================================================

    /// Canonical JSON rendering of the modeled state.
    pub fn canonical_json(&self) -> String {
        fn amounts(map: &BTreeMap<BigInt, BigInt>) -> BTreeMap<String, String> {
            map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        }

        let agents: Vec<serde_json::Value> = self
            .agents
            .values()
            .map(|a| {
                serde_json::json!({
                    "agent": a.address.to_string(),
                    "owner": a.owner.map(|o| o.to_string()),
                    "minted": a.minted.to_string(),
                    "reserved": a.reserved.to_string(),
                    "redeeming": a.redeeming.to_string(),
                    "dust": a.dust.to_string(),
                    "core_vault": a.core_vault.to_string(),
                    "reservations": amounts(&a.reservations),
                    "tickets": amounts(&a.tickets),
                    "redemptions": amounts(&a.redemptions),
                    "returns": amounts(&a.returns),
                    "destroyed": a.destroyed,
                })
            })
            .collect();
        let balances: BTreeMap<String, String> = self
            .balances
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        serde_json::json!({
            "agents": agents,
            "balances": balances,
            "total_supply": self.total_supply.to_string(),
        })
        .to_string()
    }

    /// Blake3 hash of [`canonical_json`](Self::canonical_json), hex encoded.
    pub fn state_hash(&self) -> String {
        blake3::hash(self.canonical_json().as_bytes())
            .to_hex()
            .to_string()
    }
}

fn requests_mut(record: &mut AgentRecord, kind: RequestKind) -> &mut BTreeMap<BigInt, BigInt> {
    match kind {
        RequestKind::Reservation => &mut record.reservations,
        RequestKind::Redemption => &mut record.redemptions,
        RequestKind::Return => &mut record.returns,
        RequestKind::Ticket => &mut record.tickets,
    }
}

#[cfg(test)]
mod tests;
