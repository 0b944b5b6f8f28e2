//! In-memory protocol, actors and workload for tests and the fuzz binary.
//!
//! - [`contracts`]: event ABIs and addresses of the asset manager and token.
//! - [`MemoryChain`]: a [`SystemUnderTest`](crate::SystemUnderTest) that
//!   executes the protocol in memory.
//! - [`units`]: minting, redemption, payment, transfer and self-close actors.
//! - [`DemoWorkload`]: the action table tying them together.

pub mod contracts;
pub mod units;

mod chain;
mod workload;

pub use chain::MemoryChain;
pub use workload::{DemoAgent, DemoWorkload};

use vaultline_config::VaultlineConfig;

use crate::error::Result;
use crate::shadow::ShadowState;
use crate::simulation::{SimConfig, Simulation};

/// Builds a fresh simulation over a [`MemoryChain`] plus the demo workload.
///
/// Suitable as the `build` argument of [`FuzzRunner::run`](crate::FuzzRunner::run).
pub fn demo_simulation(config: &SimConfig) -> Result<(Simulation, DemoWorkload)> {
    let chain = MemoryChain::new(config.timeline.start_timestamp)?;
    Ok(demo_simulation_with(config, chain))
}

/// Like [`demo_simulation`] over a caller-configured chain.
pub fn demo_simulation_with(config: &SimConfig, chain: MemoryChain) -> (Simulation, DemoWorkload) {
    let shadow = ShadowState::new(contracts::ASSET_MANAGER, contracts::FASSET);
    let sim = Simulation::new(config.clone(), Box::new(chain), shadow);
    (sim, DemoWorkload::default())
}

/// A short run configuration for tests.
pub fn quick_config(seed: u64) -> VaultlineConfig {
    let mut config = VaultlineConfig::quick();
    config.run.seed = seed;
    config
}
