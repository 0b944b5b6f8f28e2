//! Whole runs of the demo workload through the fuzz runner.

use test_case::test_case;
use vaultline_sim::testkit::{self, MemoryChain};
use vaultline_sim::{FuzzResult, FuzzRunner, MiningMode, SimError};

fn run(seed: u64, mining: MiningMode) -> FuzzResult {
    let mut config = testkit::quick_config(seed);
    config.run.mining = mining;
    FuzzRunner::new(config).run(testkit::demo_simulation)
}

fn assert_passed(result: &FuzzResult) {
    if let Some(error) = result.error() {
        panic!("seed {} failed: {error}\n{:#?}", result.seed(), result.report());
    }
}

// ============================================================================
// End to End
// ============================================================================

#[test_case(MiningMode::Auto; "auto mining")]
#[test_case(MiningMode::Manual; "manual mining")]
fn demo_workload_runs_clean(mining: MiningMode) {
    for seed in [1, 42, 9_001] {
        let result = run(seed, mining);
        assert_passed(&result);

        let report = result.report();
        assert_eq!(report.iterations, 100);
        assert!(report.periodic_violations.is_empty());
        assert!(report.uncaught.is_empty());
        assert!(report.actions_spawned.values().sum::<u64>() > 0);
        assert!(report.events_processed > 0);
        assert_eq!(report.units.failed, 0);
    }
}

#[test]
fn wind_down_trace_drains_monotonically() {
    for seed in 0..5 {
        let result = run(seed, MiningMode::Auto);
        assert_passed(&result);

        let trace = &result.report().wind_down_trace;
        assert!(!trace.is_empty());
        assert!(
            trace.windows(2).all(|w| w[1] <= w[0]),
            "active units grew during wind-down: {trace:?}"
        );
        assert_eq!(trace.last(), Some(&0));
    }
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn same_seed_same_fingerprint() {
    let first = run(1234, MiningMode::Auto);
    let second = run(1234, MiningMode::Auto);
    assert_passed(&first);

    assert_eq!(first.report().shadow_hash, second.report().shadow_hash);
    assert_eq!(first.report().firing_log, second.report().firing_log);
    assert_eq!(first.check_determinism(&second), Ok(()));
}

#[test]
fn different_seeds_diverge() {
    let a = run(1, MiningMode::Auto);
    let b = run(2, MiningMode::Auto);
    assert_passed(&a);
    assert_passed(&b);

    let differences = a.check_determinism(&b).unwrap_err();
    assert!(!differences.is_empty());
}

#[test]
fn determinism_replay_passes() {
    let mut config = testkit::quick_config(77);
    config.run.check_determinism = true;
    let result = FuzzRunner::new(config).run(testkit::demo_simulation);

    assert!(matches!(result, FuzzResult::Passed(_)));
}

// ============================================================================
// Failure Detection
// ============================================================================

#[test]
fn drifting_agent_info_is_caught() {
    let config = testkit::quick_config(5);
    let result = FuzzRunner::new(config).run(|cfg| {
        let chain = MemoryChain::new(cfg.timeline.start_timestamp)?.with_minted_drift(1, 1);
        Ok(testkit::demo_simulation_with(cfg, chain))
    });

    assert!(!result.is_ok());
    let Some(SimError::InvariantViolations(violations)) = result.error() else {
        panic!("expected invariant violations, got {:?}", result.error());
    };
    assert!(violations.iter().any(|v| v.invariant == "agent_minted"));

    let report = result.report();
    assert!(
        report
            .periodic_violations
            .iter()
            .any(|v| v.invariant == "agent_minted")
    );
    assert_eq!(&report.final_violations, violations);
}

#[test]
fn unknown_action_override_fails_the_run() {
    let mut config = testkit::quick_config(3);
    config
        .actions
        .insert("liquidate".to_string(), vaultline_config::ActionConfig::default());
    let result = FuzzRunner::new(config).run(testkit::demo_simulation);

    assert!(matches!(
        result.error(),
        Some(SimError::UnknownAction(name)) if name == "liquidate"
    ));
}
