//! Actors of the demo workload.
//!
//! Each unit is a small state machine over one protocol flow. Stages are
//! advanced in `step`, which returns `Result<Step>` so decoding and lookup
//! failures propagate with `?`; `resume` turns an error into
//! [`Step::Fail`], where the unit's tolerated errors are applied.

use std::collections::BTreeSet;

use num_bigint::BigInt;
use vaultline_types::{Address, CallRequest};

use super::contracts::{ASSET_MANAGER, FASSET, PAYMENT_WINDOW};
use crate::engine::{EventFilter, Step, Unit, UnitContext, UnitId, UnitOutcome, Wake};
use crate::error::{Result, SimError};

/// Longest a minter waits before paying on the underlying chain.
const MAX_PAYMENT_DELAY: u64 = PAYMENT_WINDOW / 2;

/// Share of redemptions the agent never pays.
const REDEMPTION_DEFAULT_CHANCE: f64 = 0.1;

fn unexpected(unit: &str, stage: &str, wake: &Wake) -> SimError {
    SimError::Assertion(format!("{unit}: unexpected {wake:?} while {stage}"))
}

fn finish(result: Result<Step>) -> Step {
    result.unwrap_or_else(Step::Fail)
}

// ============================================================================
// Minting
// ============================================================================

#[derive(Debug, Clone)]
enum MintStage {
    Start,
    Reserving,
    Paying { reservation: BigInt },
    Executing,
}

/// Reserves collateral with an agent, pays after a random delay and executes
/// the minting.
#[derive(Debug)]
pub struct MintUnit {
    minter: Address,
    agent: Address,
    lots: u64,
    stage: MintStage,
}

impl MintUnit {
    pub fn new(minter: Address, agent: Address, lots: u64) -> Self {
        Self {
            minter,
            agent,
            lots,
            stage: MintStage::Start,
        }
    }

    fn step(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Result<Step> {
        match (self.stage.clone(), wake) {
            (MintStage::Start, Wake::Start) => {
                let call = CallRequest::new(self.minter, ASSET_MANAGER, "reserveCollateral")
                    .arg(self.agent)
                    .arg(self.lots);
                self.stage = MintStage::Reserving;
                Ok(Step::tx(cx.submit(call)))
            }
            (MintStage::Reserving, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                let reserved =
                    cx.decoder()
                        .require_event(&events, "CollateralReserved", Some(ASSET_MANAGER))?;
                let reservation = reserved.int("collateralReservationId")?.clone();
                let delay = cx.rng().between(1, MAX_PAYMENT_DELAY);
                self.stage = MintStage::Paying { reservation };
                Ok(Step::sleep(delay))
            }
            (MintStage::Paying { reservation }, Wake::Timer) => {
                let call = CallRequest::new(self.minter, ASSET_MANAGER, "executeMinting")
                    .arg(reservation);
                self.stage = MintStage::Executing;
                Ok(Step::tx(cx.submit(call)))
            }
            (MintStage::Executing, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                cx.decoder()
                    .require_event(&events, "MintingExecuted", Some(ASSET_MANAGER))?;
                cx.decoder().require_event(&events, "Transfer", Some(FASSET))?;
                Ok(Step::Done)
            }
            (stage, wake) => Err(unexpected("mint", &format!("{stage:?}"), &wake)),
        }
    }
}

impl Unit for MintUnit {
    fn name(&self) -> &str {
        "mint"
    }

    fn tolerated_errors(&self) -> &[&str] {
        &["not enough free collateral", "invalid agent vault"]
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        finish(self.step(cx, wake))
    }
}

// ============================================================================
// Minting Default
// ============================================================================

#[derive(Debug, Clone)]
enum DefaultStage {
    Start,
    Reserving,
    Waiting { reservation: BigInt },
    Defaulting,
}

/// Reserves collateral, never pays, and reports the non-payment once the
/// payment window has passed.
#[derive(Debug)]
pub struct MintingDefaultUnit {
    minter: Address,
    agent: Address,
    lots: u64,
    stage: DefaultStage,
}

impl MintingDefaultUnit {
    pub fn new(minter: Address, agent: Address, lots: u64) -> Self {
        Self {
            minter,
            agent,
            lots,
            stage: DefaultStage::Start,
        }
    }

    fn step(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Result<Step> {
        match (self.stage.clone(), wake) {
            (DefaultStage::Start, Wake::Start) => {
                let call = CallRequest::new(self.minter, ASSET_MANAGER, "reserveCollateral")
                    .arg(self.agent)
                    .arg(self.lots);
                self.stage = DefaultStage::Reserving;
                Ok(Step::tx(cx.submit(call)))
            }
            (DefaultStage::Reserving, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                let reserved =
                    cx.decoder()
                        .require_event(&events, "CollateralReserved", Some(ASSET_MANAGER))?;
                let reservation = reserved.int("collateralReservationId")?.clone();
                self.stage = DefaultStage::Waiting { reservation };
                Ok(Step::sleep(PAYMENT_WINDOW + 1))
            }
            (DefaultStage::Waiting { reservation }, Wake::Timer) => {
                let call = CallRequest::new(self.minter, ASSET_MANAGER, "mintingPaymentDefault")
                    .arg(reservation);
                self.stage = DefaultStage::Defaulting;
                Ok(Step::tx(cx.submit(call)))
            }
            (DefaultStage::Defaulting, Wake::Tx(outcome)) => match outcome.into_events() {
                Ok(events) => {
                    cx.decoder()
                        .require_event(&events, "MintingPaymentDefault", Some(ASSET_MANAGER))?;
                    Ok(Step::Done)
                }
                Err(err) => Ok(cx.exit_on_expected_error(err, &["invalid crt id"])),
            },
            (stage, wake) => Err(unexpected("minting default", &format!("{stage:?}"), &wake)),
        }
    }
}

impl Unit for MintingDefaultUnit {
    fn name(&self) -> &str {
        "default_minting"
    }

    fn tolerated_errors(&self) -> &[&str] {
        &["not enough free collateral", "invalid agent vault"]
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        finish(self.step(cx, wake))
    }
}

// ============================================================================
// Redemption
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum RedeemStage {
    Start,
    Redeeming,
    AwaitingClosure,
    JoiningPayers,
}

/// Redeems tokens, starts one payment actor per redemption request, and waits
/// until every request is closed one way or the other.
#[derive(Debug)]
pub struct RedeemUnit {
    redeemer: Address,
    lots: u64,
    stage: RedeemStage,
    open: BTreeSet<BigInt>,
    payers: Vec<UnitId>,
}

impl RedeemUnit {
    pub fn new(redeemer: Address, lots: u64) -> Self {
        Self {
            redeemer,
            lots,
            stage: RedeemStage::Start,
            open: BTreeSet::new(),
            payers: Vec::new(),
        }
    }

    fn closure_filter(&self) -> EventFilter {
        EventFilter::any_of(&["RedemptionPerformed", "RedemptionDefault"])
            .from(ASSET_MANAGER)
            .with_arg("redeemer", self.redeemer)
    }

    fn next_payer(&mut self) -> Step {
        match self.payers.pop() {
            Some(payer) => Step::join(payer),
            None => Step::Done,
        }
    }

    fn step(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Result<Step> {
        match (self.stage.clone(), wake) {
            (RedeemStage::Start, Wake::Start) => {
                let call =
                    CallRequest::new(self.redeemer, ASSET_MANAGER, "redeem").arg(self.lots);
                self.stage = RedeemStage::Redeeming;
                Ok(Step::tx(cx.submit(call)))
            }
            (RedeemStage::Redeeming, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                let requests =
                    cx.decoder()
                        .require_events(&events, "RedemptionRequested", Some(ASSET_MANAGER))?;
                for request in requests {
                    let id = request.int("requestId")?.clone();
                    let agent = request.address_arg("agentVault")?;
                    let owner = cx
                        .shadow()
                        .agent(agent)
                        .and_then(|record| record.owner)
                        .ok_or_else(|| {
                            SimError::Assertion(format!("redemption from unknown agent {agent}"))
                        })?;
                    let defaults = cx.rng().chance(REDEMPTION_DEFAULT_CHANCE);
                    let payer = PayRedemptionUnit::new(owner, self.redeemer, id.clone(), defaults);
                    self.payers.push(cx.spawn(Box::new(payer))?);
                    self.open.insert(id);
                }
                self.stage = RedeemStage::AwaitingClosure;
                Ok(Step::event(self.closure_filter()))
            }
            (RedeemStage::AwaitingClosure, Wake::Event(event)) => {
                self.open.remove(event.int("requestId")?);
                if !self.open.is_empty() {
                    return Ok(Step::event(self.closure_filter()));
                }
                self.stage = RedeemStage::JoiningPayers;
                Ok(self.next_payer())
            }
            (RedeemStage::JoiningPayers, Wake::Joined(payer, outcome)) => {
                if outcome == UnitOutcome::Failed {
                    return Err(SimError::Assertion(format!("payment actor {payer} failed")));
                }
                Ok(self.next_payer())
            }
            (stage, wake) => Err(unexpected("redeem", &format!("{stage:?}"), &wake)),
        }
    }
}

impl Unit for RedeemUnit {
    fn name(&self) -> &str {
        "redeem"
    }

    fn tolerated_errors(&self) -> &[&str] {
        &["f-asset balance too low", "redemption queue empty", "WindingDown"]
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        finish(self.step(cx, wake))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayStage {
    Start,
    Waiting,
    Settling,
}

/// Waits, then either confirms the redemption payment as the agent owner or,
/// when the agent defaults, claims the default as the redeemer.
#[derive(Debug)]
pub struct PayRedemptionUnit {
    owner: Address,
    redeemer: Address,
    request: BigInt,
    defaults: bool,
    stage: PayStage,
}

impl PayRedemptionUnit {
    pub fn new(owner: Address, redeemer: Address, request: BigInt, defaults: bool) -> Self {
        Self {
            owner,
            redeemer,
            request,
            defaults,
            stage: PayStage::Start,
        }
    }

    fn step(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Result<Step> {
        match (self.stage, wake) {
            (PayStage::Start, Wake::Start) => {
                let delay = if self.defaults {
                    PAYMENT_WINDOW + cx.rng().between(1, 120)
                } else {
                    cx.rng().between(1, MAX_PAYMENT_DELAY)
                };
                self.stage = PayStage::Waiting;
                Ok(Step::sleep(delay))
            }
            (PayStage::Waiting, Wake::Timer) => {
                let call = if self.defaults {
                    CallRequest::new(self.redeemer, ASSET_MANAGER, "redemptionPaymentDefault")
                        .arg(&self.request)
                } else {
                    CallRequest::new(self.owner, ASSET_MANAGER, "confirmRedemptionPayment")
                        .arg(&self.request)
                };
                self.stage = PayStage::Settling;
                Ok(Step::tx(cx.submit(call)))
            }
            (PayStage::Settling, Wake::Tx(outcome)) => {
                let closing = if self.defaults {
                    "RedemptionDefault"
                } else {
                    "RedemptionPerformed"
                };
                let events = outcome.into_events()?;
                cx.decoder()
                    .require_event(&events, closing, Some(ASSET_MANAGER))?;
                Ok(Step::Done)
            }
            (stage, wake) => Err(unexpected("wait_for_payment", &format!("{stage:?}"), &wake)),
        }
    }
}

impl Unit for PayRedemptionUnit {
    fn name(&self) -> &str {
        "wait_for_payment"
    }

    fn tolerated_errors(&self) -> &[&str] {
        &["invalid request id"]
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        finish(self.step(cx, wake))
    }
}

// ============================================================================
// Transfers and Self-Close
// ============================================================================

/// Moves tokens between two holders.
#[derive(Debug)]
pub struct TransferUnit {
    from: Address,
    to: Address,
    amount: BigInt,
    submitted: bool,
}

impl TransferUnit {
    pub fn new(from: Address, to: Address, amount: BigInt) -> Self {
        Self {
            from,
            to,
            amount,
            submitted: false,
        }
    }
}

impl Unit for TransferUnit {
    fn name(&self) -> &str {
        "transfer"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match wake {
            Wake::Start if !self.submitted => {
                self.submitted = true;
                let call = CallRequest::new(self.from, FASSET, "transfer")
                    .arg(self.to)
                    .arg(&self.amount);
                Step::tx(cx.submit(call))
            }
            Wake::Tx(outcome) => match outcome.into_events() {
                Ok(events) => match cx.decoder().require_event(&events, "Transfer", Some(FASSET)) {
                    Ok(_) => Step::Done,
                    Err(err) => Step::Fail(err),
                },
                Err(err) => cx.exit_on_expected_error(err, &["f-asset balance too low"]),
            },
            other => Step::Fail(unexpected("transfer", "transferring", &other)),
        }
    }
}

#[derive(Debug, Clone)]
enum SelfCloseStage {
    Start,
    Reserving,
    Executing,
    Closing,
}

/// An agent owner mints against their own vault and immediately self-closes
/// the position.
#[derive(Debug)]
pub struct SelfCloseUnit {
    owner: Address,
    agent: Address,
    lots: u64,
    stage: SelfCloseStage,
}

impl SelfCloseUnit {
    pub fn new(owner: Address, agent: Address, lots: u64) -> Self {
        Self {
            owner,
            agent,
            lots,
            stage: SelfCloseStage::Start,
        }
    }

    fn step(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Result<Step> {
        match (self.stage.clone(), wake) {
            (SelfCloseStage::Start, Wake::Start) => {
                let call = CallRequest::new(self.owner, ASSET_MANAGER, "reserveCollateral")
                    .arg(self.agent)
                    .arg(self.lots);
                self.stage = SelfCloseStage::Reserving;
                Ok(Step::tx(cx.submit(call)))
            }
            (SelfCloseStage::Reserving, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                let reserved =
                    cx.decoder()
                        .require_event(&events, "CollateralReserved", Some(ASSET_MANAGER))?;
                let reservation = reserved.int("collateralReservationId")?.clone();
                let call =
                    CallRequest::new(self.owner, ASSET_MANAGER, "executeMinting").arg(reservation);
                self.stage = SelfCloseStage::Executing;
                Ok(Step::tx(cx.submit(call)))
            }
            (SelfCloseStage::Executing, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                let executed =
                    cx.decoder()
                        .require_event(&events, "MintingExecuted", Some(ASSET_MANAGER))?;
                let amount = executed.int("mintedAmountUBA")?.clone();
                let call = CallRequest::new(self.owner, ASSET_MANAGER, "selfClose")
                    .arg(self.agent)
                    .arg(amount);
                self.stage = SelfCloseStage::Closing;
                Ok(Step::tx(cx.submit(call)))
            }
            (SelfCloseStage::Closing, Wake::Tx(outcome)) => {
                let events = outcome.into_events()?;
                cx.decoder()
                    .require_event(&events, "SelfClose", Some(ASSET_MANAGER))?;
                Ok(Step::Done)
            }
            (stage, wake) => Err(unexpected("self_close", &format!("{stage:?}"), &wake)),
        }
    }
}

impl Unit for SelfCloseUnit {
    fn name(&self) -> &str {
        "self_close"
    }

    fn tolerated_errors(&self) -> &[&str] {
        &[
            "not enough free collateral",
            "invalid agent vault",
            "nothing to self-close",
        ]
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        finish(self.step(cx, wake))
    }
}
