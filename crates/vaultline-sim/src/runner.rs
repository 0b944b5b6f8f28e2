//! Randomized action scheduling and whole-run orchestration.
//!
//! A [`Workload`] knows the protocol's actors: it deploys or registers the
//! contracts, names the actions it can perform, and turns an action name
//! into a [`Unit`]. The [`FuzzRunner`] drives a workload through a seeded
//! sequence of iterations:
//!
//! ```text
//! for each iteration:
//!     spawn actions pinned to this iteration
//!     spawn one weighted-random action
//!     mine a block (manual mining only)
//!     pump until idle, re-raise uncaught unit errors
//!     every `check_interval` iterations:
//!         reconcile, skip `time_step_secs`, settle, re-raise
//! wind down, poll until no unit is active
//! final strict reconciliation
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use vaultline_config::{ActionConfig, MiningMode, VaultlineConfig};
use vaultline_types::SimTime;

use crate::engine::{EngineStats, Unit};
use crate::error::{Result, SimError};
use crate::intermediary::IntermediaryStats;
use crate::rng::SimRng;
use crate::shadow::{AgentSummary, InvariantViolation, ShadowState, ShadowStats};
use crate::simulation::{SimConfig, Simulation};
use crate::timeline::FiringRecord;

// ============================================================================
// Workloads
// ============================================================================

/// What a workload sees when asked to spawn an action.
pub struct ActionContext<'a> {
    pub iteration: u64,
    pub now: SimTime,
    pub rng: &'a mut SimRng,
    pub shadow: &'a ShadowState,
}

/// A family of protocol actors and the actions that create them.
pub trait Workload {
    fn name(&self) -> &str;

    /// Registers contracts and creates the initial actors.
    fn setup(&mut self, sim: &mut Simulation) -> Result<()>;

    /// Action names with their default weights.
    fn actions(&self) -> Vec<(String, u32)>;

    /// Creates the unit for `action`.
    ///
    /// `Ok(None)` means the action is not possible in the current state
    /// (nobody holds tokens to redeem, say) and is skipped.
    fn spawn_action(
        &mut self,
        action: &str,
        cx: &mut ActionContext<'_>,
    ) -> Result<Option<Box<dyn Unit>>>;
}

// ============================================================================
// Action Table
// ============================================================================

/// One schedulable action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    pub name: String,
    pub weight: u32,
    pub at_iterations: BTreeSet<u64>,
}

/// Weighted actions, with optional pinned iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTable {
    entries: Vec<ActionEntry>,
}

impl ActionTable {
    pub fn new(defaults: Vec<(String, u32)>) -> Self {
        let entries = defaults
            .into_iter()
            .map(|(name, weight)| ActionEntry {
                name,
                weight,
                at_iterations: BTreeSet::new(),
            })
            .collect();
        Self { entries }
    }

    /// Applies configured weights and pinned iterations.
    ///
    /// Overrides may only name actions the workload defines.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ActionConfig>) -> Result<Self> {
        for (name, action) in overrides {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.name == *name)
                .ok_or_else(|| SimError::UnknownAction(name.clone()))?;
            entry.weight = action.weight;
            entry.at_iterations = action.at_iterations.iter().copied().collect();
        }
        Ok(self)
    }

    pub fn entries(&self) -> &[ActionEntry] {
        &self.entries
    }

    /// Draws one action by weight. `None` if every weight is zero.
    pub fn pick(&self, rng: &mut SimRng) -> Option<&str> {
        let choices: Vec<(&str, u32)> = self
            .entries
            .iter()
            .map(|e| (e.name.as_str(), e.weight))
            .collect();
        weighted_random_choice(rng, &choices).copied()
    }

    /// Actions pinned to `iteration`, in table order.
    pub fn pinned_at(&self, iteration: u64) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |e| e.at_iterations.contains(&iteration))
            .map(|e| e.name.as_str())
    }
}

/// Picks an item with probability proportional to its weight.
///
/// Zero-weight items are never picked; an empty or all-zero list yields
/// `None`.
pub fn weighted_random_choice<'a, T>(rng: &mut SimRng, choices: &'a [(T, u32)]) -> Option<&'a T> {
    let total: u64 = choices.iter().map(|(_, w)| u64::from(*w)).sum();
    if total == 0 {
        return None;
    }
    let mut pick = rng.below(total);
    for (item, weight) in choices {
        let weight = u64::from(*weight);
        if pick < weight {
            return Some(item);
        }
        pick -= weight;
    }
    None
}

// ============================================================================
// Reports
// ============================================================================

/// Summary of one run, written out when the run fails.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FuzzReport {
    pub seed: u64,
    pub workload: String,
    pub mining: String,
    pub iterations: u64,
    pub final_time: SimTime,
    pub underlying_height: u64,
    pub actions_spawned: BTreeMap<String, u64>,
    pub actions_skipped: BTreeMap<String, u64>,
    pub units: EngineStats,
    pub transactions: IntermediaryStats,
    pub events_processed: u64,
    pub shadow: ShadowStats,
    pub periodic_violations: Vec<InvariantViolation>,
    pub final_violations: Vec<InvariantViolation>,
    pub uncaught: Vec<String>,
    /// Active unit count after wind-down started, one entry per poll.
    pub wind_down_trace: Vec<usize>,
    pub agents: Vec<AgentSummary>,
    pub timers_fired: u64,
    pub shadow_hash: String,
    #[serde(skip)]
    pub firing_log: Vec<FiringRecord>,
}

impl FuzzReport {
    fn collect(sim: &Simulation, progress: Progress, workload: &str, error: Option<&SimError>) -> Self {
        let final_violations = match error {
            Some(SimError::InvariantViolations(violations)) => violations.clone(),
            _ => Vec::new(),
        };
        Self {
            seed: sim.seed(),
            workload: workload.to_string(),
            mining: format!("{:?}", sim.config().mining).to_lowercase(),
            iterations: progress.iterations,
            final_time: sim.now(),
            underlying_height: sim.timeline().underlying_height(),
            actions_spawned: progress.spawned,
            actions_skipped: progress.skipped,
            units: sim.engine().stats().clone(),
            transactions: sim.transactions().stats().clone(),
            events_processed: sim.events_processed(),
            shadow: sim.shadow().stats().clone(),
            periodic_violations: progress.periodic_violations,
            final_violations,
            uncaught: sim
                .engine()
                .uncaught_errors()
                .iter()
                .map(|f| format!("{} ({}): {}", f.unit, f.name, f.error))
                .collect(),
            wind_down_trace: progress.wind_down_trace,
            agents: sim.shadow().summaries(),
            timers_fired: sim.timeline().fired_total(),
            shadow_hash: sim.state_hash(),
            firing_log: sim.timeline().firing_log().to_vec(),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub enum FuzzResult {
    Passed(FuzzReport),
    Failed { report: FuzzReport, error: SimError },
}

impl FuzzResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    pub fn report(&self) -> &FuzzReport {
        match self {
            Self::Passed(report) | Self::Failed { report, .. } => report,
        }
    }

    pub fn error(&self) -> Option<&SimError> {
        match self {
            Self::Passed(_) => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn seed(&self) -> u64 {
        self.report().seed
    }

    /// Compares two runs of the same seed.
    ///
    /// Returns every difference found in the shadow hash, the timer firing
    /// sequence, and the run counters.
    pub fn check_determinism(&self, other: &FuzzResult) -> Result<(), Vec<String>> {
        let (a, b) = (self.report(), other.report());
        let mut differences = Vec::new();

        if a.shadow_hash != b.shadow_hash {
            differences.push(format!("shadow_hash: {} != {}", a.shadow_hash, b.shadow_hash));
        }
        if a.firing_log != b.firing_log {
            let at = a
                .firing_log
                .iter()
                .zip(&b.firing_log)
                .position(|(x, y)| x != y)
                .unwrap_or(a.firing_log.len().min(b.firing_log.len()));
            differences.push(format!("firing_log diverges at entry {at}"));
        }
        if a.timers_fired != b.timers_fired {
            differences.push(format!("timers_fired: {} != {}", a.timers_fired, b.timers_fired));
        }
        if a.events_processed != b.events_processed {
            differences.push(format!(
                "events_processed: {} != {}",
                a.events_processed, b.events_processed
            ));
        }
        if a.units != b.units {
            differences.push(format!("units: {:?} != {:?}", a.units, b.units));
        }
        if a.final_time != b.final_time {
            differences.push(format!("final_time: {} != {}", a.final_time, b.final_time));
        }
        if self.is_ok() != other.is_ok() {
            differences.push("different outcomes".to_string());
        }

        if differences.is_empty() {
            Ok(())
        } else {
            Err(differences)
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    iterations: u64,
    spawned: BTreeMap<String, u64>,
    skipped: BTreeMap<String, u64>,
    periodic_violations: Vec<InvariantViolation>,
    wind_down_trace: Vec<usize>,
}

// ============================================================================
// Fuzz Runner
// ============================================================================

/// Runs workloads under a [`VaultlineConfig`].
#[derive(Debug, Clone)]
pub struct FuzzRunner {
    config: VaultlineConfig,
}

impl FuzzRunner {
    pub fn new(config: VaultlineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VaultlineConfig {
        &self.config
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig::from_config(&self.config)
    }

    /// Runs one seed, and a second time when determinism checking is on.
    ///
    /// `build` creates a fresh simulation and workload for every run.
    pub fn run<W, F>(&self, build: F) -> FuzzResult
    where
        W: Workload,
        F: Fn(&SimConfig) -> Result<(Simulation, W)>,
    {
        let first = self.run_once(&build);
        if !self.config.run.check_determinism || !first.is_ok() {
            return first;
        }

        tracing::info!(seed = first.seed(), "replaying seed for determinism check");
        let second = self.run_once(&build);
        match first.check_determinism(&second) {
            Ok(()) => first,
            Err(differences) => {
                let error = SimError::Nondeterminism {
                    seed: first.seed(),
                    detail: differences.join("; "),
                };
                FuzzResult::Failed {
                    report: first.report().clone(),
                    error,
                }
            }
        }
    }

    fn run_once<W, F>(&self, build: &F) -> FuzzResult
    where
        W: Workload,
        F: Fn(&SimConfig) -> Result<(Simulation, W)>,
    {
        let sim_config = self.sim_config();
        let seed = sim_config.seed;
        let (mut sim, mut workload) = match build(&sim_config) {
            Ok(built) => built,
            Err(error) => {
                let report = FuzzReport {
                    seed,
                    ..FuzzReport::default()
                };
                return FuzzResult::Failed { report, error };
            }
        };

        tracing::info!(
            seed,
            workload = workload.name(),
            iterations = self.config.run.iterations,
            mining = ?sim_config.mining,
            "starting run"
        );
        let mut progress = Progress::default();
        let outcome = self.drive(&mut sim, &mut workload, &mut progress);
        let report = FuzzReport::collect(&sim, progress, workload.name(), outcome.as_ref().err());

        match outcome {
            Ok(()) => {
                tracing::info!(
                    seed,
                    units = report.units.spawned,
                    events = report.events_processed,
                    shadow_hash = %report.shadow_hash,
                    "run passed"
                );
                FuzzResult::Passed(report)
            }
            Err(error) => {
                tracing::error!(seed, %error, "run failed");
                FuzzResult::Failed { report, error }
            }
        }
    }

    fn drive<W: Workload>(
        &self,
        sim: &mut Simulation,
        workload: &mut W,
        progress: &mut Progress,
    ) -> Result<()> {
        let run = &self.config.run;

        workload.setup(sim)?;
        sim.settle_transactions()?;
        sim.check_uncaught()?;

        let table = ActionTable::new(workload.actions()).with_overrides(&self.config.actions)?;
        let check_interval = run.check_interval.max(1);

        for iteration in 0..run.iterations {
            for name in table.pinned_at(iteration) {
                spawn_action(sim, workload, name, iteration, progress)?;
            }
            if let Some(name) = table.pick(sim.rng_mut()) {
                spawn_action(sim, workload, name, iteration, progress)?;
            }

            if run.mining == MiningMode::Manual {
                sim.mine_block()?;
            }
            sim.run_until_idle()?;
            sim.check_uncaught()?;

            if (iteration + 1) % check_interval == 0 {
                let report = sim.check_invariants(false)?;
                progress.periodic_violations.extend(report.violations);
                sim.skip_time(run.time_step_secs, true)?;
                sim.settle_transactions()?;
                sim.check_uncaught()?;
            }
            progress.iterations = iteration + 1;
        }

        self.wind_down(sim, progress)?;
        sim.check_invariants(true)?;
        Ok(())
    }

    fn wind_down(&self, sim: &mut Simulation, progress: &mut Progress) -> Result<()> {
        let run = &self.config.run;
        sim.wind_down();
        progress.wind_down_trace.push(sim.engine().active_count());

        let mut polls = 0;
        while sim.engine().active_count() > 0 {
            if polls >= run.wind_down_polls {
                return Err(SimError::WindDownTimeout {
                    active: sim.engine().active_count(),
                    polls,
                });
            }
            polls += 1;
            sim.settle_transactions()?;
            sim.skip_time(run.time_step_secs, true)?;
            sim.check_uncaught()?;
            progress.wind_down_trace.push(sim.engine().active_count());
        }

        sim.settle_transactions()?;
        sim.check_uncaught()?;
        tracing::info!(polls, "wind-down complete");
        Ok(())
    }
}

fn spawn_action<W: Workload>(
    sim: &mut Simulation,
    workload: &mut W,
    action: &str,
    iteration: u64,
    progress: &mut Progress,
) -> Result<()> {
    let unit = {
        let mut cx = sim.action_context(iteration);
        workload.spawn_action(action, &mut cx)?
    };
    match unit {
        Some(body) => {
            let id = sim.start_unit(body)?;
            tracing::debug!(iteration, action, unit = %id, "spawned action");
            *progress.spawned.entry(action.to_string()).or_default() += 1;
        }
        None => {
            tracing::trace!(iteration, action, "action skipped");
            *progress.skipped.entry(action.to_string()).or_default() += 1;
        }
    }
    Ok(())
}
