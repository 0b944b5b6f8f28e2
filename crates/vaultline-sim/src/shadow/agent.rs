//! Shadow record of one agent vault.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_traits::Zero;
use serde::Serialize;
use vaultline_types::Address;

/// Everything the shadow state knows about an agent, rebuilt from events.
///
/// Aggregates (`minted`, `reserved`, `redeeming`, `dust`) are maintained
/// alongside the open obligations they are made of, so the two views can be
/// checked against each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub address: Address,
    pub owner: Option<Address>,
    pub minted: BigInt,
    pub reserved: BigInt,
    pub redeeming: BigInt,
    pub dust: BigInt,
    /// Open collateral reservations by reservation id.
    pub reservations: BTreeMap<BigInt, BigInt>,
    /// Redemption tickets by ticket id.
    pub tickets: BTreeMap<BigInt, BigInt>,
    /// Open redemption requests (including core-vault transfers) by request id.
    pub redemptions: BTreeMap<BigInt, BigInt>,
    /// Open core-vault return requests by request id.
    pub returns: BTreeMap<BigInt, BigInt>,
    /// Value moved to the core vault and not yet returned.
    pub core_vault: BigInt,
    pub destroyed: bool,
}

impl AgentRecord {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            owner: None,
            minted: BigInt::zero(),
            reserved: BigInt::zero(),
            redeeming: BigInt::zero(),
            dust: BigInt::zero(),
            reservations: BTreeMap::new(),
            tickets: BTreeMap::new(),
            redemptions: BTreeMap::new(),
            returns: BTreeMap::new(),
            core_vault: BigInt::zero(),
            destroyed: false,
        }
    }

    /// `minted` as implied by tickets and dust.
    pub fn ticket_total(&self) -> BigInt {
        self.tickets.values().sum::<BigInt>() + &self.dust
    }

    /// `reserved` as implied by open reservations and returns.
    pub fn reservation_total(&self) -> BigInt {
        self.reservations.values().chain(self.returns.values()).sum()
    }

    /// `redeeming` as implied by open redemption requests.
    pub fn redemption_total(&self) -> BigInt {
        self.redemptions.values().sum()
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent: self.address,
            owner: self.owner,
            minted: self.minted.to_string(),
            reserved: self.reserved.to_string(),
            redeeming: self.redeeming.to_string(),
            dust: self.dust.to_string(),
            core_vault: self.core_vault.to_string(),
            open_reservations: self.reservations.len(),
            open_redemptions: self.redemptions.len(),
            open_returns: self.returns.len(),
            tickets: self.tickets.len(),
            destroyed: self.destroyed,
        }
    }
}

/// Report view of an agent. Amounts are decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub agent: Address,
    pub owner: Option<Address>,
    pub minted: String,
    pub reserved: String,
    pub redeeming: String,
    pub dust: String,
    pub core_vault: String,
    pub open_reservations: usize,
    pub open_redemptions: usize,
    pub open_returns: usize,
    pub tickets: usize,
    pub destroyed: bool,
}
