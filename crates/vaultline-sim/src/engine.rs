//! Cooperative concurrency engine.
//!
//! A [`Unit`] is one logical actor written as an explicit state machine. The
//! engine resumes it with a [`Wake`] describing why it runs; the unit answers
//! with a [`Step`]: suspend on a [`Wait`], finish, exit quietly, or fail.
//! Units never run concurrently. Interleaving happens only at suspension
//! points, and the order in which suspended units are resumed is fully
//! determined by the order of events, timers and acknowledgements.
//!
//! ## Cancellation
//!
//! [`Engine::wind_down`] marks every unit's [`Scope`] cancelled. Units
//! suspended on an event, a timer or a join are unwound on the spot. Units
//! waiting for a transaction acknowledgement keep waiting: they receive their
//! receipt and unwind at their next suspension point. Unwinding is a normal
//! exit ([`UnitOutcome::Cancelled`]), never a failure.
//!
//! ## Errors
//!
//! A unit that fails with an error outside its allow-list is recorded in the
//! engine's uncaught-error list; [`Engine::check_uncaught`] turns the first
//! entry into a [`SimError::UnitFailed`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use vaultline_types::{Address, CallRequest, Query, SimTime, Value};

use crate::decoder::{DecodedEvent, EventDecoder};
use crate::error::{Result, SimError};
use crate::intermediary::{Acknowledgement, TransactionIntermediary, TxOutcome, TxTicket};
use crate::rng::SimRng;
use crate::shadow::ShadowState;
use crate::sut::SystemUnderTest;
use crate::timeline::{Timeline, TimerId};

// ============================================================================
// Unit Interface
// ============================================================================

/// Identity of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(u64);

impl UnitId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// A logical actor driven by the engine.
pub trait Unit {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Error kinds (see [`SimError::kind`]) that end this unit quietly
    /// instead of failing the run.
    fn tolerated_errors(&self) -> &[&str] {
        &[]
    }

    /// Runs the unit until its next suspension point.
    fn resume(&mut self, cx: &mut UnitContext<'_>, wake: Wake) -> Step;
}

/// Why a unit is being resumed.
#[derive(Debug, Clone)]
pub enum Wake {
    /// First resume after spawning.
    Start,
    /// A decoded event matched the unit's filter.
    Event(DecodedEvent),
    /// The unit's timer came due.
    Timer,
    /// The joined unit terminated.
    Joined(UnitId, UnitOutcome),
    /// The awaited transaction was mined.
    Tx(TxOutcome),
}

/// What a unit does after running.
#[derive(Debug)]
pub enum Step {
    Wait(Wait),
    /// Finished normally.
    Done,
    /// Ended on an expected error.
    Exit,
    Fail(SimError),
}

impl Step {
    pub fn event(filter: EventFilter) -> Self {
        Self::Wait(Wait::Event(filter))
    }

    pub fn sleep(seconds: u64) -> Self {
        Self::Wait(Wait::Timer(seconds))
    }

    pub fn join(unit: UnitId) -> Self {
        Self::Wait(Wait::Join(unit))
    }

    pub fn tx(ticket: TxTicket) -> Self {
        Self::Wait(Wait::Tx(ticket))
    }
}

impl From<SimError> for Step {
    fn from(err: SimError) -> Self {
        Self::Fail(err)
    }
}

/// A suspension condition.
#[derive(Debug)]
pub enum Wait {
    Event(EventFilter),
    /// Simulated seconds from now.
    Timer(u64),
    Join(UnitId),
    Tx(TxTicket),
}

/// How a unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    Finished,
    ExitedExpected,
    Cancelled,
    Failed,
}

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Runnable,
    Suspended,
    Finished,
    Cancelled,
    Failed,
}

impl From<UnitOutcome> for UnitState {
    fn from(outcome: UnitOutcome) -> Self {
        match outcome {
            UnitOutcome::Finished | UnitOutcome::ExitedExpected => Self::Finished,
            UnitOutcome::Cancelled => Self::Cancelled,
            UnitOutcome::Failed => Self::Failed,
        }
    }
}

// ============================================================================
// Event Filters
// ============================================================================

type Predicate = Box<dyn Fn(&DecodedEvent) -> bool>;

/// Wake condition for event waits.
pub struct EventFilter {
    names: Vec<String>,
    contract: Option<Address>,
    args: Vec<(String, Value)>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    /// Matches events with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            contract: None,
            args: Vec::new(),
            predicate: None,
        }
    }

    /// Matches events with any of the given names.
    pub fn any_of(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| (*n).to_string()).collect(),
            contract: None,
            args: Vec::new(),
            predicate: None,
        }
    }

    /// Restricts to events emitted by `contract`.
    pub fn from(mut self, contract: Address) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Requires a field to equal `value`.
    pub fn with_arg(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((field.into(), value.into()));
        self
    }

    /// Adds an arbitrary predicate.
    pub fn matching(mut self, predicate: impl Fn(&DecodedEvent) -> bool + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn matches(&self, event: &DecodedEvent) -> bool {
        self.names.iter().any(|n| *n == event.event)
            && self.contract.is_none_or(|c| c == event.address)
            && self
                .args
                .iter()
                .all(|(field, value)| event.args.get(field) == Some(value))
            && self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("names", &self.names)
            .field("contract", &self.contract)
            .field("args", &self.args)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Timer payload: which unit to wake, under which wait token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTarget {
    pub unit: UnitId,
    pub token: u64,
}

#[derive(Debug)]
enum Waiting {
    Event(EventFilter),
    Timer(TimerId),
    Join(UnitId),
    Tx(TxTicket),
}

/// Per-unit registration of the current wait and the cancellation flag.
#[derive(Debug, Default)]
pub struct Scope {
    cancelled: bool,
    /// Token of the current wait; wake-ups carrying an older token are stale.
    token: u64,
    waiting: Option<Waiting>,
}

impl Scope {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    fn waiting_on_tx(&self, ticket: TxTicket) -> bool {
        matches!(self.waiting, Some(Waiting::Tx(t)) if t == ticket)
    }
}

struct Slot {
    name: String,
    body: Option<Box<dyn Unit>>,
    state: UnitState,
    scope: Scope,
    /// Tickets submitted by the unit and not yet acknowledged.
    inflight: BTreeSet<TxTicket>,
}

/// A unit taken out of the registry to be resumed.
pub struct Resumption {
    pub unit: UnitId,
    pub body: Box<dyn Unit>,
    pub wake: Wake,
    pub cancelled: bool,
}

/// An error that escaped a unit's allow-list.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub name: String,
    pub error: SimError,
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub spawned: u64,
    pub resumes: u64,
    pub finished: u64,
    pub exited_expected: u64,
    pub cancelled: u64,
    pub failed: u64,
}

// ============================================================================
// Engine
// ============================================================================

/// Registry and scheduler of units.
#[derive(Default)]
pub struct Engine {
    units: BTreeMap<UnitId, Slot>,
    ready: VecDeque<(UnitId, Wake)>,
    /// Event subscriptions in registration order, with their wait token.
    event_waiters: Vec<(UnitId, u64)>,
    joiners: BTreeMap<UnitId, Vec<UnitId>>,
    /// Acknowledgements that arrived before their unit waited for them.
    unclaimed: BTreeMap<TxTicket, (UnitId, TxOutcome)>,
    outcomes: BTreeMap<UnitId, UnitOutcome>,
    next_unit: u64,
    next_token: u64,
    winding_down: bool,
    uncaught: Vec<UnitFailure>,
    stats: EngineStats,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit and queues its first resume.
    pub fn spawn(&mut self, body: Box<dyn Unit>) -> Result<UnitId> {
        if self.winding_down {
            return Err(SimError::WindingDown(body.name().to_string()));
        }

        let unit = UnitId(self.next_unit);
        self.next_unit += 1;
        let name = body.name().to_string();
        tracing::debug!(%unit, %name, "spawned unit");

        self.units.insert(
            unit,
            Slot {
                name,
                body: Some(body),
                state: UnitState::Runnable,
                scope: Scope::default(),
                inflight: BTreeSet::new(),
            },
        );
        self.ready.push_back((unit, Wake::Start));
        self.stats.spawned += 1;
        Ok(unit)
    }

    /// Units that have not terminated.
    pub fn active_count(&self) -> usize {
        self.units.len()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_winding_down(&self) -> bool {
        self.winding_down
    }

    /// State of a unit; terminated units report their final state.
    pub fn state(&self, unit: UnitId) -> Option<UnitState> {
        self.units
            .get(&unit)
            .map(|slot| slot.state)
            .or_else(|| self.outcomes.get(&unit).map(|o| UnitState::from(*o)))
    }

    pub fn outcome(&self, unit: UnitId) -> Option<UnitOutcome> {
        self.outcomes.get(&unit).copied()
    }

    pub fn scope(&self, unit: UnitId) -> Option<&Scope> {
        self.units.get(&unit).map(|slot| &slot.scope)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Every error that escaped a unit, in the order they happened.
    pub fn uncaught_errors(&self) -> &[UnitFailure] {
        &self.uncaught
    }

    /// Re-raises the first uncaught error.
    pub fn check_uncaught(&self) -> Result<()> {
        match self.uncaught.first() {
            Some(failure) => Err(SimError::UnitFailed {
                unit: failure.unit,
                name: failure.name.clone(),
                error: Box::new(failure.error.clone()),
            }),
            None => Ok(()),
        }
    }

    /// Takes the next runnable unit out of the registry.
    pub fn take_ready(&mut self) -> Option<Resumption> {
        while let Some((unit, wake)) = self.ready.pop_front() {
            let Some(slot) = self.units.get_mut(&unit) else {
                continue;
            };
            let Some(body) = slot.body.take() else {
                continue;
            };
            self.stats.resumes += 1;
            return Some(Resumption {
                unit,
                body,
                wake,
                cancelled: slot.scope.cancelled,
            });
        }
        None
    }

    /// Returns a resumed unit to the registry and applies its step.
    pub fn settle(
        &mut self,
        unit: UnitId,
        body: Box<dyn Unit>,
        step: Step,
        timeline: &mut Timeline<TimerTarget>,
    ) {
        let Some(slot) = self.units.get_mut(&unit) else {
            return;
        };
        let cancelled = slot.scope.cancelled;

        match step {
            Step::Done => self.terminate(unit, UnitOutcome::Finished, timeline),
            Step::Exit => self.terminate(unit, UnitOutcome::ExitedExpected, timeline),
            Step::Fail(error) => {
                if error.is_expected(body.tolerated_errors()) {
                    tracing::debug!(%unit, kind = error.kind(), "unit exited on tolerated error");
                    self.terminate(unit, UnitOutcome::ExitedExpected, timeline);
                } else {
                    self.fail(unit, error, timeline);
                }
            }
            Step::Wait(_) if cancelled => {
                tracing::debug!(%unit, "unit unwound at suspension point");
                self.terminate(unit, UnitOutcome::Cancelled, timeline);
            }
            Step::Wait(wait) => {
                slot.body = Some(body);
                self.suspend(unit, wait, timeline);
            }
        }
    }

    /// Records a submission made by `unit`.
    pub fn note_submission(&mut self, unit: UnitId, ticket: TxTicket) {
        if let Some(slot) = self.units.get_mut(&unit) {
            slot.inflight.insert(ticket);
        }
    }

    /// Wakes units whose event filter matches, in subscription order.
    ///
    /// Returns the number of units woken.
    pub fn dispatch_event(&mut self, event: &DecodedEvent) -> usize {
        let waiters = std::mem::take(&mut self.event_waiters);
        let mut remaining = Vec::with_capacity(waiters.len());
        let mut woken = 0;

        for (unit, token) in waiters {
            let Some(slot) = self.units.get_mut(&unit) else {
                continue;
            };
            if slot.scope.token != token {
                continue;
            }
            let matched = match &slot.scope.waiting {
                Some(Waiting::Event(filter)) => filter.matches(event),
                _ => continue,
            };
            if matched {
                slot.scope.waiting = None;
                slot.state = UnitState::Runnable;
                self.ready.push_back((unit, Wake::Event(event.clone())));
                woken += 1;
            } else {
                remaining.push((unit, token));
            }
        }

        self.event_waiters = remaining;
        woken
    }

    /// Wakes the unit a fired timer belongs to, unless the wait is stale.
    pub fn fire_timer(&mut self, target: TimerTarget) {
        let Some(slot) = self.units.get_mut(&target.unit) else {
            return;
        };
        if slot.scope.token != target.token || !matches!(slot.scope.waiting, Some(Waiting::Timer(_)))
        {
            tracing::trace!(unit = %target.unit, token = target.token, "ignored stale timer");
            return;
        }
        slot.scope.waiting = None;
        slot.state = UnitState::Runnable;
        self.ready.push_back((target.unit, Wake::Timer));
    }

    /// Hands a mined call's outcome to the unit that submitted it.
    pub fn deliver(&mut self, ack: Acknowledgement) {
        let Some(unit) = ack.unit else {
            return;
        };
        let Some(slot) = self.units.get_mut(&unit) else {
            tracing::trace!(%unit, ticket = %ack.ticket, "dropped acknowledgement of terminated unit");
            return;
        };

        slot.inflight.remove(&ack.ticket);
        if slot.scope.waiting_on_tx(ack.ticket) {
            slot.scope.waiting = None;
            slot.state = UnitState::Runnable;
            self.ready.push_back((unit, Wake::Tx(ack.outcome)));
        } else {
            self.unclaimed.insert(ack.ticket, (unit, ack.outcome));
        }
    }

    /// Stops spawning and cancels every unit.
    pub fn wind_down(&mut self, timeline: &mut Timeline<TimerTarget>) {
        self.winding_down = true;

        let mut unwind = Vec::new();
        for (unit, slot) in &mut self.units {
            slot.scope.cancelled = true;
            let at_suspension_point = slot.state == UnitState::Suspended
                && !matches!(slot.scope.waiting, Some(Waiting::Tx(_)));
            if at_suspension_point {
                unwind.push(*unit);
            }
        }

        tracing::info!(
            active = self.units.len(),
            unwinding = unwind.len(),
            "winding down"
        );
        for unit in unwind {
            self.terminate(unit, UnitOutcome::Cancelled, timeline);
        }
    }

    fn suspend(&mut self, unit: UnitId, wait: Wait, timeline: &mut Timeline<TimerTarget>) {
        self.next_token += 1;
        let token = self.next_token;

        // Conditions already satisfied resume on the next turn.
        let immediate = match &wait {
            Wait::Join(target) => self.outcomes.get(target).map(|o| Wake::Joined(*target, *o)),
            Wait::Tx(ticket) if self.unclaimed.get(ticket).is_some_and(|(o, _)| *o == unit) => {
                self.unclaimed.remove(ticket).map(|(_, o)| Wake::Tx(o))
            }
            _ => None,
        };
        if let Some(wake) = immediate {
            if let Some(slot) = self.units.get_mut(&unit) {
                slot.state = UnitState::Runnable;
                slot.scope.token = token;
                slot.scope.waiting = None;
            }
            self.ready.push_back((unit, wake));
            return;
        }

        let invalid = match &wait {
            Wait::Join(target) if *target == unit => Some(SimError::Assertion(format!(
                "{unit} cannot join itself"
            ))),
            Wait::Join(target) if !self.units.contains_key(target) => {
                Some(SimError::UnknownUnit(*target))
            }
            Wait::Tx(ticket)
                if !self
                    .units
                    .get(&unit)
                    .is_some_and(|slot| slot.inflight.contains(ticket)) =>
            {
                Some(SimError::Assertion(format!(
                    "{unit} waits on {ticket}, which it did not submit or already consumed"
                )))
            }
            _ => None,
        };
        if let Some(error) = invalid {
            self.fail(unit, error, timeline);
            return;
        }

        let waiting = match wait {
            Wait::Event(filter) => {
                self.event_waiters.push((unit, token));
                Waiting::Event(filter)
            }
            Wait::Timer(seconds) => {
                Waiting::Timer(timeline.schedule_after(seconds, TimerTarget { unit, token }))
            }
            Wait::Join(target) => {
                self.joiners.entry(target).or_default().push(unit);
                Waiting::Join(target)
            }
            Wait::Tx(ticket) => Waiting::Tx(ticket),
        };

        if let Some(slot) = self.units.get_mut(&unit) {
            slot.state = UnitState::Suspended;
            slot.scope.token = token;
            slot.scope.waiting = Some(waiting);
        }
    }

    fn fail(&mut self, unit: UnitId, error: SimError, timeline: &mut Timeline<TimerTarget>) {
        let name = self
            .units
            .get(&unit)
            .map(|slot| slot.name.clone())
            .unwrap_or_default();
        tracing::warn!(%unit, %name, %error, "unit failed");
        self.uncaught.push(UnitFailure { unit, name, error });
        self.terminate(unit, UnitOutcome::Failed, timeline);
    }

    fn terminate(
        &mut self,
        unit: UnitId,
        outcome: UnitOutcome,
        timeline: &mut Timeline<TimerTarget>,
    ) {
        let Some(slot) = self.units.remove(&unit) else {
            return;
        };
        if let Some(Waiting::Timer(timer)) = slot.scope.waiting {
            timeline.cancel(timer);
        }
        self.unclaimed.retain(|_, (owner, _)| *owner != unit);
        self.outcomes.insert(unit, outcome);

        match outcome {
            UnitOutcome::Finished => self.stats.finished += 1,
            UnitOutcome::ExitedExpected => self.stats.exited_expected += 1,
            UnitOutcome::Cancelled => self.stats.cancelled += 1,
            UnitOutcome::Failed => self.stats.failed += 1,
        }
        tracing::debug!(%unit, name = %slot.name, ?outcome, "unit terminated");

        for joiner in self.joiners.remove(&unit).unwrap_or_default() {
            let Some(js) = self.units.get_mut(&joiner) else {
                continue;
            };
            if matches!(js.scope.waiting, Some(Waiting::Join(target)) if target == unit) {
                js.scope.waiting = None;
                js.state = UnitState::Runnable;
                self.ready.push_back((joiner, Wake::Joined(unit, outcome)));
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("active", &self.units.len())
            .field("ready", &self.ready.len())
            .field("winding_down", &self.winding_down)
            .field("uncaught", &self.uncaught.len())
            .field("stats", &self.stats)
            .finish()
    }
}

// ============================================================================
// Unit Context
// ============================================================================

/// Everything a unit may touch while it runs.
pub struct UnitContext<'a> {
    pub(crate) unit: UnitId,
    pub(crate) cancelled: bool,
    pub(crate) now: SimTime,
    pub(crate) engine: &'a mut Engine,
    pub(crate) txs: &'a mut TransactionIntermediary,
    pub(crate) decoder: &'a EventDecoder,
    pub(crate) shadow: &'a ShadowState,
    pub(crate) sut: &'a dyn SystemUnderTest,
    pub(crate) rng: &'a mut SimRng,
}

impl UnitContext<'_> {
    /// The running unit.
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Simulated time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// True once the engine is winding down; the next wait unwinds the unit.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Submits a call on behalf of the running unit.
    pub fn submit(&mut self, call: CallRequest) -> TxTicket {
        let ticket = self.txs.submit(Some(self.unit), call);
        self.engine.note_submission(self.unit, ticket);
        ticket
    }

    /// Spawns a child unit.
    pub fn spawn(&mut self, body: Box<dyn Unit>) -> Result<UnitId> {
        self.engine.spawn(body)
    }

    pub fn decoder(&self) -> &EventDecoder {
        self.decoder
    }

    /// Read-only view of the shadow state.
    pub fn shadow(&self) -> &ShadowState {
        self.shadow
    }

    /// Queries the system under test.
    pub fn query(&self, query: &Query) -> Result<Vec<Value>> {
        Ok(self.sut.query(query)?)
    }

    pub fn rng(&mut self) -> &mut SimRng {
        self.rng
    }

    /// Ends the unit quietly if `error` is expected, otherwise fails it.
    pub fn exit_on_expected_error(&self, error: SimError, allow: &[&str]) -> Step {
        if error.is_expected(allow) {
            tracing::debug!(unit = %self.unit, kind = error.kind(), "exiting on expected error");
            Step::Exit
        } else {
            Step::Fail(error)
        }
    }
}
