//! Demo workload over the in-memory protocol.

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use vaultline_types::{Address, CallRequest};

use super::contracts::{ASSET_MANAGER, ASSET_MANAGER_NAME, FASSET_NAME, contracts, lot_size};
use super::units::{MintUnit, MintingDefaultUnit, RedeemUnit, SelfCloseUnit, TransferUnit};
use crate::engine::Unit;
use crate::error::{Result, SimError};
use crate::intermediary::TxOutcome;
use crate::runner::{ActionContext, Workload};
use crate::simulation::Simulation;

/// Most lots a single mint or redemption asks for.
const MAX_LOTS: u64 = 3;

/// An agent vault and the account that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoAgent {
    pub vault: Address,
    pub owner: Address,
}

/// Agents backing the token and customers minting, moving and redeeming it.
#[derive(Debug, Clone)]
pub struct DemoWorkload {
    agents: Vec<DemoAgent>,
    customers: Vec<Address>,
}

impl DemoWorkload {
    pub fn new(agent_count: u8, customer_count: u8) -> Self {
        let agents = (1..=agent_count)
            .map(|i| DemoAgent {
                vault: Address::with_last_byte(0x10 + i),
                owner: Address::with_last_byte(0x40 + i),
            })
            .collect();
        let customers = (1..=customer_count)
            .map(|i| Address::with_last_byte(0x80 + i))
            .collect();
        Self { agents, customers }
    }

    pub fn agents(&self) -> &[DemoAgent] {
        &self.agents
    }

    pub fn customers(&self) -> &[Address] {
        &self.customers
    }

    fn pick_agent(&self, cx: &mut ActionContext<'_>) -> Option<DemoAgent> {
        cx.rng.choose(&self.agents).copied()
    }

    /// Customers whose shadow balance is at least `minimum`.
    fn holders(&self, cx: &ActionContext<'_>, minimum: &BigInt) -> Vec<(Address, BigInt)> {
        self.customers
            .iter()
            .map(|c| (*c, cx.shadow.balance_of(*c)))
            .filter(|(_, balance)| balance >= minimum && !balance.is_zero())
            .collect()
    }
}

impl Default for DemoWorkload {
    fn default() -> Self {
        Self::new(3, 6)
    }
}

impl Workload for DemoWorkload {
    fn name(&self) -> &str {
        "demo"
    }

    fn setup(&mut self, sim: &mut Simulation) -> Result<()> {
        sim.register_contracts(&contracts()?, None);
        tracing::debug!(
            asset_manager = ?sim.decoder().address_of(ASSET_MANAGER_NAME).ok(),
            fasset = ?sim.decoder().address_of(FASSET_NAME).ok(),
            agents = self.agents.len(),
            customers = self.customers.len(),
            "setting up demo workload"
        );

        for agent in &self.agents {
            let call =
                CallRequest::new(agent.owner, ASSET_MANAGER, "createAgentVault").arg(agent.vault);
            if let TxOutcome::Failed(err) = sim.execute(call)? {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn actions(&self) -> Vec<(String, u32)> {
        [
            ("mint", 10),
            ("redeem", 4),
            ("transfer", 3),
            ("self_close", 1),
            ("default_minting", 1),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect()
    }

    fn spawn_action(
        &mut self,
        action: &str,
        cx: &mut ActionContext<'_>,
    ) -> Result<Option<Box<dyn Unit>>> {
        let unit: Box<dyn Unit> = match action {
            "mint" => {
                let (Some(agent), Some(minter)) =
                    (self.pick_agent(cx), cx.rng.choose(&self.customers).copied())
                else {
                    return Ok(None);
                };
                let lots = cx.rng.between(1, MAX_LOTS);
                Box::new(MintUnit::new(minter, agent.vault, lots))
            }
            "default_minting" => {
                let (Some(agent), Some(minter)) =
                    (self.pick_agent(cx), cx.rng.choose(&self.customers).copied())
                else {
                    return Ok(None);
                };
                Box::new(MintingDefaultUnit::new(minter, agent.vault, 1))
            }
            "redeem" => {
                let holders = self.holders(cx, &lot_size());
                let Some((redeemer, balance)) = cx.rng.choose(&holders).cloned() else {
                    return Ok(None);
                };
                let affordable = (balance / lot_size()).to_u64().unwrap_or(MAX_LOTS);
                let lots = cx.rng.between(1, affordable.min(MAX_LOTS));
                Box::new(RedeemUnit::new(redeemer, lots))
            }
            "transfer" => {
                let holders = self.holders(cx, &BigInt::zero());
                let Some((from, balance)) = cx.rng.choose(&holders).cloned() else {
                    return Ok(None);
                };
                let recipients: Vec<Address> =
                    self.customers.iter().copied().filter(|c| *c != from).collect();
                let Some(to) = cx.rng.choose(&recipients).copied() else {
                    return Ok(None);
                };
                let amount = match balance.to_u64() {
                    Some(small) => BigInt::from(cx.rng.between(1, small)),
                    None => {
                        let lots = (&balance / lot_size()).to_u64().unwrap_or(1).max(1);
                        lot_size() * cx.rng.between(1, lots)
                    }
                };
                Box::new(TransferUnit::new(from, to, amount))
            }
            "self_close" => {
                let Some(agent) = self.pick_agent(cx) else {
                    return Ok(None);
                };
                Box::new(SelfCloseUnit::new(agent.owner, agent.vault, 1))
            }
            other => return Err(SimError::UnknownAction(other.to_string())),
        };
        Ok(Some(unit))
    }
}
