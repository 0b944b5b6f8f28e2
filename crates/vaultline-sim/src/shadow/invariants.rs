//! Reconciliation of the shadow state against live queries.

use std::fmt::{self, Display};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use vaultline_types::{Address, Query, Value};

use super::ShadowState;
use crate::error::{Result, SimError};
use crate::sut::SystemUnderTest;

// ============================================================================
// Violations
// ============================================================================

/// A divergence between what the shadow state expects and what was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// The agent or holder the check is about.
    pub entity: String,
    pub invariant: String,
    pub expected: String,
    pub observed: String,
    pub note: String,
}

impl Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: expected {}, observed {}",
            self.invariant, self.entity, self.expected, self.observed
        )?;
        if !self.note.is_empty() {
            write!(f, " ({})", self.note)?;
        }
        Ok(())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvariantReport {
    pub agents_checked: usize,
    pub holders_checked: usize,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn compare(
        &mut self,
        entity: impl Display,
        invariant: &str,
        expected: &BigInt,
        observed: &BigInt,
        note: &str,
    ) {
        if expected != observed {
            let violation = InvariantViolation {
                entity: entity.to_string(),
                invariant: invariant.to_string(),
                expected: expected.to_string(),
                observed: observed.to_string(),
                note: note.to_string(),
            };
            tracing::warn!(%violation, "invariant violated");
            self.violations.push(violation);
        }
    }
}

// ============================================================================
// Oracle
// ============================================================================

/// Live agent aggregates as reported by the system under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub minted: BigInt,
    pub reserved: BigInt,
    pub redeeming: BigInt,
}

/// Source of truth the shadow state is reconciled against.
pub trait StateOracle {
    fn agent_info(&self, agent: Address) -> Result<AgentSnapshot>;
    fn balance_of(&self, holder: Address) -> Result<BigInt>;
    fn total_supply(&self) -> Result<BigInt>;
}

/// [`StateOracle`] backed by [`SystemUnderTest::query`].
///
/// Expects `getAgentInfo(agent)` on the asset manager to return
/// `[minted, reserved, redeeming, ...]`, and `balanceOf(holder)` /
/// `totalSupply()` on the synthetic token to return one integer.
pub struct QueryOracle<'a> {
    sut: &'a dyn SystemUnderTest,
    asset_manager: Address,
    fasset: Address,
}

impl<'a> QueryOracle<'a> {
    pub fn new(sut: &'a dyn SystemUnderTest, asset_manager: Address, fasset: Address) -> Self {
        Self {
            sut,
            asset_manager,
            fasset,
        }
    }

    /// The first `count` results of `query`, each required to be an integer.
    fn ints(&self, query: &Query, count: usize) -> Result<Vec<BigInt>> {
        let values = self.sut.query(query)?;
        if values.len() < count {
            return Err(SimError::Assertion(format!(
                "{} returned {} value(s), expected at least {count}",
                query.method,
                values.len()
            )));
        }
        values
            .into_iter()
            .take(count)
            .enumerate()
            .map(|(position, value)| match value {
                Value::Int(int) => Ok(int),
                other => Err(SimError::FieldType {
                    event: query.method.clone(),
                    field: position.to_string(),
                    expected: "int",
                    actual: other.kind(),
                }),
            })
            .collect()
    }
}

impl StateOracle for QueryOracle<'_> {
    fn agent_info(&self, agent: Address) -> Result<AgentSnapshot> {
        let query = Query::new(self.asset_manager, "getAgentInfo").arg(agent);
        let [minted, reserved, redeeming]: [BigInt; 3] = self
            .ints(&query, 3)?
            .try_into()
            .map_err(|_| SimError::Assertion("getAgentInfo: expected 3 integers".to_string()))?;
        Ok(AgentSnapshot {
            minted,
            reserved,
            redeeming,
        })
    }

    fn balance_of(&self, holder: Address) -> Result<BigInt> {
        let query = Query::new(self.fasset, "balanceOf").arg(holder);
        Ok(self.ints(&query, 1)?.swap_remove(0))
    }

    fn total_supply(&self) -> Result<BigInt> {
        let query = Query::new(self.fasset, "totalSupply");
        Ok(self.ints(&query, 1)?.swap_remove(0))
    }
}

// ============================================================================
// Checks
// ============================================================================

impl ShadowState {
    /// Runs every self-consistency and reconciliation check.
    ///
    /// All checks run even after the first mismatch. In strict mode a
    /// non-empty violation list is returned as
    /// [`SimError::InvariantViolations`]. Oracle failures are errors, not
    /// violations.
    pub fn check_invariants(
        &mut self,
        oracle: &dyn StateOracle,
        strict: bool,
    ) -> Result<InvariantReport> {
        self.stats.checks_run += 1;
        let mut report = InvariantReport::default();

        for agent in self.agents.values() {
            report.agents_checked += 1;
            let entity = agent.address;

            report.compare(
                entity,
                "minted_matches_tickets",
                &agent.ticket_total(),
                &agent.minted,
                "sum of redemption tickets plus dust",
            );
            report.compare(
                entity,
                "reserved_matches_open_requests",
                &agent.reservation_total(),
                &agent.reserved,
                "sum of open reservations and core-vault returns",
            );
            report.compare(
                entity,
                "redeeming_matches_open_requests",
                &agent.redemption_total(),
                &agent.redeeming,
                "sum of open redemption requests",
            );

            if agent.destroyed {
                let held = &agent.minted + &agent.reserved + &agent.redeeming;
                report.compare(
                    entity,
                    "destroyed_agent_is_empty",
                    &BigInt::default(),
                    &held,
                    "minted + reserved + redeeming",
                );
                continue;
            }

            let live = oracle.agent_info(entity)?;
            report.compare(entity, "agent_minted", &agent.minted, &live.minted, "getAgentInfo");
            report.compare(
                entity,
                "agent_reserved",
                &agent.reserved,
                &live.reserved,
                "getAgentInfo",
            );
            report.compare(
                entity,
                "agent_redeeming",
                &agent.redeeming,
                &live.redeeming,
                "getAgentInfo",
            );
        }

        for (holder, balance) in &self.balances {
            report.holders_checked += 1;
            let live = oracle.balance_of(*holder)?;
            report.compare(holder, "holder_balance", balance, &live, "balanceOf");
        }

        let shadow_sum: BigInt = self.balances.values().sum();
        report.compare(
            "fasset",
            "balances_sum_to_supply",
            &self.total_supply,
            &shadow_sum,
            "shadow self-consistency",
        );
        let live_supply = oracle.total_supply()?;
        report.compare(
            "fasset",
            "total_supply",
            &self.total_supply,
            &live_supply,
            "totalSupply",
        );

        tracing::debug!(
            agents = report.agents_checked,
            holders = report.holders_checked,
            violations = report.violations.len(),
            strict,
            "reconciliation pass"
        );

        if strict && !report.is_clean() {
            return Err(SimError::InvariantViolations(report.violations));
        }
        Ok(report)
    }
}
