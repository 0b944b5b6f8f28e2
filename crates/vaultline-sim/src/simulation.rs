//! The simulation: one system under test, one shadow, one clock.
//!
//! [`Simulation`] owns every component of a run and drives them in a fixed
//! order. Its pump, [`run_until_idle`](Simulation::run_until_idle), repeats
//! until nothing is left to do:
//!
//! 1. resume the next runnable unit;
//! 2. in automatic mining mode, mine pending submissions;
//! 3. wake the units whose filters match the next queued event;
//! 4. fire timers that are already due.
//!
//! A mined block's events are applied to the shadow state as soon as its
//! receipts are accepted, before any unit sees the receipt or the events.
//! A resumed unit therefore reads a shadow that includes whatever woke it.
//!
//! ## Example
//!
//! ```ignore
//! let chain = MemoryChain::new(config.timeline.start_timestamp)?;
//! let shadow = ShadowState::new(ASSET_MANAGER, FASSET);
//! let mut sim = Simulation::new(SimConfig::default().with_seed(7), Box::new(chain), shadow);
//! sim.register_contracts(&contracts()?, None);
//! sim.start_unit(Box::new(MintUnit::new(customer, agent, 2)))?;
//! sim.run_until_idle()?;
//! sim.skip_time(60, true)?;
//! let report = sim.check_invariants(false)?;
//! ```

use std::collections::VecDeque;

use vaultline_config::{MiningMode, TimelineConfig, VaultlineConfig};
use vaultline_types::{CallRequest, SimTime};

use crate::decoder::{ContractInstance, DecodedEvent, EventDecoder};
use crate::engine::{Engine, TimerTarget, Unit, UnitContext, UnitId};
use crate::error::{Result, SimError};
use crate::intermediary::{Acknowledgement, TransactionIntermediary, TxOutcome, TxTicket};
use crate::rng::SimRng;
use crate::runner::ActionContext;
use crate::shadow::{InvariantReport, QueryOracle, ShadowState, StateOracle};
use crate::sut::SystemUnderTest;
use crate::timeline::{FiredTimer, Timeline};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of one simulation.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub seed: u64,
    pub mining: MiningMode,
    pub timeline: TimelineConfig,
    /// Pump steps allowed without reaching idle before the run is declared
    /// livelocked.
    pub max_pump_steps: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            mining: MiningMode::Auto,
            timeline: TimelineConfig::default(),
            max_pump_steps: 1_000_000,
        }
    }
}

impl SimConfig {
    /// Derives a simulation configuration from a loaded run configuration.
    pub fn from_config(config: &VaultlineConfig) -> Self {
        Self {
            seed: config.run.seed,
            mining: config.run.mining,
            timeline: config.timeline.clone(),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mining(mut self, mining: MiningMode) -> Self {
        self.mining = mining;
        self
    }

    pub fn with_timeline(mut self, timeline: TimelineConfig) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_max_pump_steps(mut self, steps: u64) -> Self {
        self.max_pump_steps = steps;
        self
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// A running simulation.
pub struct Simulation {
    config: SimConfig,
    engine: Engine,
    timeline: Timeline<TimerTarget>,
    txs: TransactionIntermediary,
    decoder: EventDecoder,
    shadow: ShadowState,
    sut: Box<dyn SystemUnderTest>,
    rng: SimRng,
    /// Events already applied to the shadow state, not yet dispatched.
    events: VecDeque<DecodedEvent>,
    events_processed: u64,
}

impl Simulation {
    /// Creates a simulation whose clock starts at the system's current time.
    pub fn new(config: SimConfig, sut: Box<dyn SystemUnderTest>, shadow: ShadowState) -> Self {
        let timeline = Timeline::new(
            sut.timestamp(),
            config.timeline.underlying_block_interval_secs,
            config.timeline.firing_log_capacity,
        );
        tracing::debug!(
            seed = config.seed,
            mining = ?config.mining,
            sut = sut.name(),
            start = timeline.now(),
            "simulation created"
        );
        Self {
            engine: Engine::new(),
            timeline,
            txs: TransactionIntermediary::new(config.mining),
            decoder: EventDecoder::new(),
            shadow,
            sut,
            rng: SimRng::new(config.seed),
            events: VecDeque::new(),
            events_processed: 0,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.config.seed
    }

    pub fn now(&self) -> SimTime {
        self.timeline.now()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn timeline(&self) -> &Timeline<TimerTarget> {
        &self.timeline
    }

    pub fn transactions(&self) -> &TransactionIntermediary {
        &self.txs
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    pub fn shadow(&self) -> &ShadowState {
        &self.shadow
    }

    pub fn sut(&self) -> &dyn SystemUnderTest {
        self.sut.as_ref()
    }

    pub fn rng_mut(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Registers contracts with the decoder.
    pub fn register_contracts(&mut self, contracts: &[ContractInstance], only: Option<&[&str]>) {
        self.decoder.register(contracts, only);
    }

    /// Switches the mining mode; pending submissions are kept.
    pub fn set_mining(&mut self, mode: MiningMode) {
        self.config.mining = mode;
        self.txs.set_mode(mode);
    }

    /// Context handed to a workload when it spawns an action.
    pub fn action_context(&mut self, iteration: u64) -> ActionContext<'_> {
        ActionContext {
            iteration,
            now: self.timeline.now(),
            rng: &mut self.rng,
            shadow: &self.shadow,
        }
    }

    // ------------------------------------------------------------------------
    // Units and Transactions
    // ------------------------------------------------------------------------

    /// Registers a unit; it first runs at the next pump.
    pub fn start_unit(&mut self, body: Box<dyn Unit>) -> Result<UnitId> {
        self.engine.spawn(body)
    }

    /// Submits a call owned by the harness rather than by a unit.
    pub fn submit(&mut self, call: CallRequest) -> TxTicket {
        self.txs.submit(None, call)
    }

    /// Submits a harness call, mines everything pending, and returns the
    /// call's outcome once its events have been processed.
    pub fn execute(&mut self, call: CallRequest) -> Result<TxOutcome> {
        let ticket = self.submit(call);
        let acks = self.txs.settle(self.sut.as_mut(), &self.decoder)?;
        let outcome = acks
            .iter()
            .find(|ack| ack.ticket == ticket)
            .map(|ack| ack.outcome.clone());
        self.accept(acks)?;
        self.run_until_idle()?;
        outcome.ok_or_else(|| SimError::Assertion(format!("{ticket} was not mined")))
    }

    /// Mines every pending submission in one block, then pumps.
    pub fn mine_block(&mut self) -> Result<()> {
        let acks = self.txs.mine_block(self.sut.as_mut(), &self.decoder)?;
        self.accept(acks)?;
        self.run_until_idle()
    }

    /// Mines and pumps until no submission is pending, in either mining mode.
    pub fn settle_transactions(&mut self) -> Result<()> {
        let mut rounds = 0;
        while self.txs.has_pending() {
            rounds += 1;
            if rounds > self.config.max_pump_steps {
                return Err(SimError::Livelock { steps: rounds });
            }
            let acks = self.txs.settle(self.sut.as_mut(), &self.decoder)?;
            self.accept(acks)?;
            self.run_until_idle()?;
        }
        Ok(())
    }

    /// Applies an externally produced event as if a transaction had emitted
    /// it; waiting units see it at the next pump.
    pub fn inject_event(&mut self, event: DecodedEvent) -> Result<()> {
        self.shadow.apply(&event)?;
        self.events.push_back(event);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pump
    // ------------------------------------------------------------------------

    /// Runs until no unit is runnable, no event is queued, no timer is due
    /// and, in automatic mode, nothing is waiting to be mined.
    pub fn run_until_idle(&mut self) -> Result<()> {
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.config.max_pump_steps {
                return Err(SimError::Livelock { steps });
            }

            if let Some(resumption) = self.engine.take_ready() {
                let unit = resumption.unit;
                let mut body = resumption.body;
                let mut cx = UnitContext {
                    unit,
                    cancelled: resumption.cancelled,
                    now: self.timeline.now(),
                    engine: &mut self.engine,
                    txs: &mut self.txs,
                    decoder: &self.decoder,
                    shadow: &self.shadow,
                    sut: self.sut.as_ref(),
                    rng: &mut self.rng,
                };
                let step = body.resume(&mut cx, resumption.wake);
                self.engine.settle(unit, body, step, &mut self.timeline);
                continue;
            }

            if self.txs.mode() == MiningMode::Auto && self.txs.has_pending() {
                let acks = self.txs.flush(self.sut.as_mut(), &self.decoder)?;
                self.accept(acks)?;
                continue;
            }

            if let Some(event) = self.events.pop_front() {
                let woken = self.engine.dispatch_event(&event);
                self.events_processed += 1;
                tracing::trace!(event = %self.decoder.format_event(&event), woken, "dispatched event");
                continue;
            }

            if self
                .timeline
                .next_due()
                .is_some_and(|due| due <= self.timeline.now())
            {
                let fired = self.timeline.execute_triggers();
                self.fire(fired);
                continue;
            }

            return Ok(());
        }
    }

    /// Applies every acknowledged event to the shadow state before the
    /// submitting units can observe their receipts.
    fn accept(&mut self, acks: Vec<Acknowledgement>) -> Result<()> {
        for ack in acks {
            if let TxOutcome::Acknowledged { events, .. } = &ack.outcome {
                for event in events {
                    self.shadow.apply(event)?;
                    self.events.push_back(event.clone());
                }
            }
            self.engine.deliver(ack);
        }
        Ok(())
    }

    fn fire(&mut self, fired: Vec<FiredTimer<TimerTarget>>) {
        for timer in fired {
            self.engine.fire_timer(timer.payload);
        }
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    /// Moves simulated time forward by `seconds`.
    ///
    /// Time advances in steps that stop at every timer due inside the
    /// window, so each woken unit observes the time it asked for and its
    /// follow-up work happens before later timers fire. Block time on the
    /// system under test moves with the timeline.
    pub fn skip_time(&mut self, seconds: u64, advance_underlying: bool) -> Result<()> {
        self.run_until_idle()?;
        let target = self.timeline.now().saturating_add(seconds);

        loop {
            let now = self.timeline.now();
            let step_to = match self.timeline.next_due() {
                Some(due) if due <= target => due.max(now),
                _ => target,
            };
            let delta = step_to - now;
            self.sut.increase_time(delta);
            let advance = self.timeline.skip_time(delta, advance_underlying);
            if advance.underlying_blocks > 0 {
                self.sut.mine_underlying_blocks(advance.underlying_blocks);
            }
            self.fire(advance.fired);
            self.run_until_idle()?;

            if self.timeline.now() >= target {
                return Ok(());
            }
        }
    }

    /// Fires timers due at the current time without moving the clock.
    pub fn execute_triggers(&mut self) -> Result<()> {
        let fired = self.timeline.execute_triggers();
        self.fire(fired);
        self.run_until_idle()
    }

    // ------------------------------------------------------------------------
    // Checks and Lifecycle
    // ------------------------------------------------------------------------

    /// Reconciles the shadow state against live queries.
    ///
    /// The pump runs to idle first, so in automatic mode every pending
    /// submission has been mined and applied.
    pub fn check_invariants(&mut self, strict: bool) -> Result<InvariantReport> {
        self.run_until_idle()?;
        let oracle = QueryOracle::new(
            self.sut.as_ref(),
            self.shadow.asset_manager(),
            self.shadow.fasset(),
        );
        self.shadow.check_invariants(&oracle, strict)
    }

    /// Like [`check_invariants`](Self::check_invariants) with a caller
    /// supplied oracle.
    pub fn check_invariants_with(
        &mut self,
        oracle: &dyn StateOracle,
        strict: bool,
    ) -> Result<InvariantReport> {
        self.run_until_idle()?;
        self.shadow.check_invariants(oracle, strict)
    }

    /// Cancels every unit and refuses further spawns.
    pub fn wind_down(&mut self) {
        self.engine.wind_down(&mut self.timeline);
    }

    /// Re-raises the first error that escaped a unit.
    pub fn check_uncaught(&self) -> Result<()> {
        self.engine.check_uncaught()
    }

    /// Fingerprint of the shadow state.
    pub fn state_hash(&self) -> String {
        self.shadow.state_hash()
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.config.seed)
            .field("now", &self.timeline.now())
            .field("engine", &self.engine)
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}
