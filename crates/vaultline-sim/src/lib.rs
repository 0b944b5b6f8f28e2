//! # vaultline-sim: Deterministic Stress Testing for Synthetic-Asset Protocols
//!
//! This crate drives a collateralized synthetic-asset protocol, hosted by an
//! external [`SystemUnderTest`], with many concurrent randomized actors, and
//! continuously reconciles the protocol's observable state against a shadow
//! model rebuilt purely from decoded events.

#![allow(clippy::doc_markdown)] // Protocol names in docs
#![allow(clippy::module_name_repetitions)] // ShadowState in shadow, etc.
#![allow(clippy::missing_errors_doc)] // Every fallible API returns SimError
#![allow(clippy::too_many_lines)] // Event handler and unit state machines
#![allow(clippy::match_same_arms)] // Explicit arms per event type
#![allow(clippy::unreadable_literal)] // Seeds and amounts
//!
//! ## Philosophy
//!
//! - **Reproducibility**: same seed, same actions, same final shadow hash
//! - **Time compression**: payment windows of minutes pass in microseconds
//! - **Observed, not trusted**: the shadow model only learns from events
//! - **Divergence is data**: mismatches are reported, not thrown, until the
//!   final strict pass
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           FuzzRunner                             │
//! │   ActionTable ──► Workload::spawn_action ──► Unit                │
//! │                                                                  │
//! │  ┌────────────────────────── Simulation ──────────────────────┐  │
//! │  │  Engine (units, scopes)   Timeline (clock, timers)  SimRng │  │
//! │  │                                                            │  │
//! │  │  TransactionIntermediary ──► SystemUnderTest::mine_block   │  │
//! │  │          │ receipts                                        │  │
//! │  │          ▼                                                 │  │
//! │  │  EventDecoder ──► ShadowState::apply ──► Engine wake-ups   │  │
//! │  │                                                            │  │
//! │  │  ShadowState::check_invariants ◄── SystemUnderTest::query  │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use vaultline_sim::{FuzzRunner, testkit};
//!
//! let runner = FuzzRunner::new(testkit::quick_config(12345));
//! let result = runner.run(testkit::demo_simulation);
//! assert!(result.is_ok(), "{:?}", result.error());
//! ```

pub mod abi;
pub mod decoder;
pub mod engine;
mod error;
pub mod intermediary;
mod rng;
pub mod runner;
pub mod shadow;
pub mod simulation;
mod sut;
pub mod testkit;
pub mod timeline;

pub use abi::{ContractAbi, EventParam, EventSchema, ParamKind};
pub use decoder::{ContractInstance, DecodedEvent, EventArgs, EventDecoder};
pub use engine::{
    Engine, EngineStats, EventFilter, Step, Unit, UnitContext, UnitId, UnitOutcome, UnitState,
    Wait, Wake,
};
pub use error::{Result, SimError};
pub use intermediary::{
    Acknowledgement, IntermediaryStats, TransactionIntermediary, TxOutcome, TxTicket,
};
pub use rng::SimRng;
pub use runner::{
    ActionContext, ActionTable, FuzzReport, FuzzResult, FuzzRunner, Workload,
    weighted_random_choice,
};
pub use shadow::{
    AgentSnapshot, ApplyOutcome, InvariantReport, InvariantViolation, QueryOracle, ShadowState,
    StateOracle,
};
pub use simulation::{SimConfig, Simulation};
pub use sut::SystemUnderTest;
pub use timeline::{FiredTimer, FiringRecord, Timeline, TimerId};

pub use vaultline_config::{MiningMode, VaultlineConfig};
pub use vaultline_types::{
    Address, B256, BigInt, CallRequest, ChainError, Query, RawLog, SimTime, TxReceipt, Value,
};
