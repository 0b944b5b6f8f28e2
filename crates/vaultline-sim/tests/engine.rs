//! Unit scheduling: joins, event filters, acknowledgements and wind-down.

use std::cell::RefCell;
use std::rc::Rc;

use vaultline_sim::testkit::contracts::{ASSET_MANAGER, FASSET, contracts, synthetic_event};
use vaultline_sim::testkit::demo_simulation;
use vaultline_sim::{
    Address, B256, BigInt, CallRequest, ChainError, DecodedEvent, EventFilter, MiningMode,
    SimConfig, SimError, Simulation, Step, TxOutcome, TxTicket, Unit, UnitContext, UnitId,
    UnitOutcome, Wake,
};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn simulation() -> Simulation {
    let (mut sim, _) = demo_simulation(&SimConfig::default()).unwrap();
    sim.register_contracts(&contracts().unwrap(), None);
    sim
}

fn transfer(to: Address, value: u64, tx: u8) -> DecodedEvent {
    let instances = contracts().unwrap();
    synthetic_event(
        &instances[1],
        "Transfer",
        vec![Address::ZERO.into(), to.into(), value.into()],
        B256::repeat_byte(tx),
        0,
    )
    .unwrap()
}

fn create_vault(byte: u8) -> CallRequest {
    CallRequest::new(Address::with_last_byte(0x40 + byte), ASSET_MANAGER, "createAgentVault")
        .arg(Address::with_last_byte(0x10 + byte))
}

fn unexpected(wake: &Wake) -> Step {
    Step::Fail(SimError::Assertion(format!("unexpected {wake:?}")))
}

// ============================================================================
// Test Units
// ============================================================================

struct Nap(u64);

impl Unit for Nap {
    fn name(&self) -> &str {
        "nap"
    }

    fn resume(&mut self, _cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match wake {
            Wake::Start => Step::sleep(self.0),
            _ => Step::Done,
        }
    }
}

/// Spawns a napping child and waits for it.
struct Parent {
    joined: Log<(UnitId, UnitOutcome)>,
}

impl Unit for Parent {
    fn name(&self) -> &str {
        "parent"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match wake {
            Wake::Start => match cx.spawn(Box::new(Nap(10))) {
                Ok(child) => Step::join(child),
                Err(err) => Step::Fail(err),
            },
            Wake::Joined(child, outcome) => {
                self.joined.borrow_mut().push((child, outcome));
                Step::Done
            }
            other => unexpected(&other),
        }
    }
}

/// Joins a unit spawned by someone else.
struct Joiner {
    target: UnitId,
    joined: Log<(UnitId, UnitOutcome)>,
}

impl Unit for Joiner {
    fn name(&self) -> &str {
        "joiner"
    }

    fn resume(&mut self, _cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match wake {
            Wake::Start => Step::join(self.target),
            Wake::Joined(unit, outcome) => {
                self.joined.borrow_mut().push((unit, outcome));
                Step::Done
            }
            other => unexpected(&other),
        }
    }
}

struct SelfJoin;

impl Unit for SelfJoin {
    fn name(&self) -> &str {
        "self_join"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, _wake: Wake) -> Step {
        Step::join(cx.unit())
    }
}

/// Waits for one transfer matching a filter.
struct Watcher {
    label: &'static str,
    filter: Option<EventFilter>,
    woke: Log<&'static str>,
}

impl Unit for Watcher {
    fn name(&self) -> &str {
        self.label
    }

    fn resume(&mut self, _cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match (wake, self.filter.take()) {
            (Wake::Start, Some(filter)) => Step::event(filter),
            (Wake::Event(_), _) => {
                self.woke.borrow_mut().push(self.label);
                Step::Done
            }
            (other, _) => unexpected(&other),
        }
    }
}

/// Submits a call, naps, and only then waits for the acknowledgement.
struct LateClaimer {
    call: Option<CallRequest>,
    ticket: Option<TxTicket>,
    outcome: Log<TxOutcome>,
}

impl Unit for LateClaimer {
    fn name(&self) -> &str {
        "late_claimer"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match wake {
            Wake::Start => {
                let Some(call) = self.call.take() else {
                    return unexpected(&Wake::Start);
                };
                self.ticket = Some(cx.submit(call));
                Step::sleep(5)
            }
            Wake::Timer => match self.ticket {
                Some(ticket) => Step::tx(ticket),
                None => unexpected(&Wake::Timer),
            },
            Wake::Tx(outcome) => {
                self.outcome.borrow_mut().push(outcome);
                Step::Done
            }
            other => unexpected(&other),
        }
    }
}

/// Waits on a ticket it was handed.
struct Borrower(TxTicket);

impl Unit for Borrower {
    fn name(&self) -> &str {
        "borrower"
    }

    fn resume(&mut self, _cx: &mut UnitContext<'_>, _wake: Wake) -> Step {
        Step::tx(self.0)
    }
}

/// Submits a call and, once it lands, tries to keep going.
struct Persistent {
    call: Option<CallRequest>,
    seen_cancelled: Log<bool>,
}

impl Unit for Persistent {
    fn name(&self) -> &str {
        "persistent"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match (wake, self.call.take()) {
            (Wake::Start, Some(call)) => Step::tx(cx.submit(call)),
            (Wake::Tx(_), _) => {
                self.seen_cancelled.borrow_mut().push(cx.is_cancelled());
                Step::sleep(60)
            }
            (other, _) => unexpected(&other),
        }
    }
}

/// Calls the chain and exits quietly on the listed revert reasons.
struct Tolerant {
    call: Option<CallRequest>,
    allow: &'static [&'static str],
}

impl Unit for Tolerant {
    fn name(&self) -> &str {
        "tolerant"
    }

    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step {
        match (wake, self.call.take()) {
            (Wake::Start, Some(call)) => Step::tx(cx.submit(call)),
            (Wake::Tx(outcome), _) => match outcome.into_events() {
                Ok(_) => Step::Done,
                Err(err) => cx.exit_on_expected_error(err, self.allow),
            },
            (other, _) => unexpected(&other),
        }
    }
}

// ============================================================================
// Joins
// ============================================================================

#[test]
fn parent_resumes_when_child_finishes() {
    let mut sim = simulation();
    let joined = Log::default();
    let parent = sim
        .start_unit(Box::new(Parent {
            joined: joined.clone(),
        }))
        .unwrap();
    sim.run_until_idle().unwrap();
    assert!(joined.borrow().is_empty());

    sim.skip_time(10, false).unwrap();

    let joined = joined.borrow();
    assert_eq!(joined.len(), 1);
    assert_ne!(joined[0].0, parent);
    assert_eq!(joined[0].1, UnitOutcome::Finished);
    assert_eq!(sim.engine().outcome(parent), Some(UnitOutcome::Finished));
    assert_eq!(sim.engine().stats().spawned, 2);
}

#[test]
fn long_finished_unit_can_still_be_joined() {
    let mut sim = simulation();
    let early = sim.start_unit(Box::new(Nap(1))).unwrap();
    sim.skip_time(1, false).unwrap();
    for _ in 0..50 {
        sim.start_unit(Box::new(Nap(1))).unwrap();
        sim.skip_time(1, false).unwrap();
    }
    assert_eq!(sim.engine().active_count(), 0);

    let joined = Log::default();
    sim.start_unit(Box::new(Joiner {
        target: early,
        joined: joined.clone(),
    }))
    .unwrap();
    sim.run_until_idle().unwrap();

    assert_eq!(*joined.borrow(), [(early, UnitOutcome::Finished)]);
    assert!(sim.check_uncaught().is_ok());
}

#[test]
fn joining_self_is_a_failure() {
    let mut sim = simulation();
    let unit = sim.start_unit(Box::new(SelfJoin)).unwrap();
    sim.run_until_idle().unwrap();

    assert_eq!(sim.engine().outcome(unit), Some(UnitOutcome::Failed));
    assert!(matches!(
        sim.check_uncaught(),
        Err(SimError::UnitFailed { ref name, .. }) if name == "self_join"
    ));
}

// ============================================================================
// Event Filters
// ============================================================================

#[test]
fn filters_select_waiters_in_subscription_order() {
    let mut sim = simulation();
    let alice = Address::with_last_byte(0x81);
    let bob = Address::with_last_byte(0x82);
    let woke = Log::default();

    let watchers = [
        ("to_bob", EventFilter::named("Transfer").with_arg("to", bob)),
        ("any_transfer", EventFilter::named("Transfer").from(FASSET)),
        ("to_alice", EventFilter::named("Transfer").with_arg("to", alice)),
        (
            "large",
            EventFilter::named("Transfer")
                .matching(|e| e.int("value").is_ok_and(|v| *v >= BigInt::from(1_000))),
        ),
        (
            "wrong_contract",
            EventFilter::named("Transfer").from(ASSET_MANAGER),
        ),
    ];
    for (label, filter) in watchers {
        sim.start_unit(Box::new(Watcher {
            label,
            filter: Some(filter),
            woke: woke.clone(),
        }))
        .unwrap();
    }
    sim.run_until_idle().unwrap();

    sim.inject_event(transfer(alice, 50, 1)).unwrap();
    sim.run_until_idle().unwrap();
    assert_eq!(*woke.borrow(), ["any_transfer", "to_alice"]);

    sim.inject_event(transfer(bob, 5_000, 2)).unwrap();
    sim.run_until_idle().unwrap();
    assert_eq!(
        *woke.borrow(),
        ["any_transfer", "to_alice", "to_bob", "large"]
    );
    assert_eq!(sim.engine().active_count(), 1);
}

// ============================================================================
// Acknowledgements
// ============================================================================

#[test]
fn acknowledgement_is_kept_until_claimed() {
    let mut sim = simulation();
    let outcome = Log::default();
    let unit = sim
        .start_unit(Box::new(LateClaimer {
            call: Some(create_vault(1)),
            ticket: None,
            outcome: outcome.clone(),
        }))
        .unwrap();
    sim.run_until_idle().unwrap();

    assert!(outcome.borrow().is_empty());
    assert_eq!(sim.transactions().stats().acknowledged, 1);

    sim.skip_time(5, false).unwrap();
    assert_eq!(outcome.borrow().len(), 1);
    assert!(outcome.borrow()[0].is_acknowledged());
    assert_eq!(sim.engine().outcome(unit), Some(UnitOutcome::Finished));
}

#[test]
fn waiting_on_a_foreign_ticket_fails() {
    let mut sim = simulation();
    sim.set_mining(MiningMode::Manual);
    let ticket = sim.submit(create_vault(1));
    let unit = sim.start_unit(Box::new(Borrower(ticket))).unwrap();
    sim.run_until_idle().unwrap();

    assert_eq!(sim.engine().outcome(unit), Some(UnitOutcome::Failed));
    let failure = &sim.engine().uncaught_errors()[0];
    assert_eq!(failure.error.kind(), "Assertion");
}

#[test]
fn expected_revert_ends_unit_quietly() {
    let mut sim = simulation();
    sim.execute(create_vault(1)).unwrap();

    let unit = sim
        .start_unit(Box::new(Tolerant {
            call: Some(create_vault(1)),
            allow: &["agent vault already exists"],
        }))
        .unwrap();
    sim.run_until_idle().unwrap();

    assert_eq!(sim.engine().outcome(unit), Some(UnitOutcome::ExitedExpected));
    assert!(sim.check_uncaught().is_ok());
    assert_eq!(sim.transactions().stats().reverted, 1);
}

#[test]
fn unexpected_revert_fails_unit() {
    let mut sim = simulation();
    let call = CallRequest::new(Address::with_last_byte(0x81), ASSET_MANAGER, "redeem").arg(1u64);
    sim.start_unit(Box::new(Tolerant {
        call: Some(call),
        allow: &["redemption queue empty"],
    }))
    .unwrap();
    sim.run_until_idle().unwrap();

    match sim.check_uncaught() {
        Err(SimError::UnitFailed { error, .. }) => {
            assert!(matches!(
                *error,
                SimError::Chain(ChainError::Reverted { ref reason }) if reason == "f-asset balance too low"
            ));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

// ============================================================================
// Wind-Down
// ============================================================================

#[test]
fn unit_awaiting_receipt_gets_it_then_unwinds() {
    let mut sim = simulation();
    sim.set_mining(MiningMode::Manual);
    let seen_cancelled = Log::default();
    let unit = sim
        .start_unit(Box::new(Persistent {
            call: Some(create_vault(2)),
            seen_cancelled: seen_cancelled.clone(),
        }))
        .unwrap();
    let napper = sim.start_unit(Box::new(Nap(1_000))).unwrap();
    sim.run_until_idle().unwrap();

    sim.wind_down();
    assert_eq!(sim.engine().outcome(napper), Some(UnitOutcome::Cancelled));
    assert_eq!(sim.engine().active_count(), 1);

    sim.mine_block().unwrap();
    assert_eq!(*seen_cancelled.borrow(), [true]);
    assert_eq!(sim.engine().outcome(unit), Some(UnitOutcome::Cancelled));
    assert_eq!(sim.engine().active_count(), 0);
    assert_eq!(sim.engine().stats().cancelled, 2);
    assert_eq!(sim.shadow().agents().count(), 1);
}

#[test]
fn children_cannot_be_spawned_while_winding_down() {
    let mut sim = simulation();
    sim.wind_down();
    assert!(sim.engine().is_winding_down());

    let err = sim
        .start_unit(Box::new(Parent {
            joined: Log::default(),
        }))
        .unwrap_err();
    assert!(matches!(err, SimError::WindingDown(ref name) if name == "parent"));
    assert_eq!(sim.engine().stats().spawned, 0);
}
