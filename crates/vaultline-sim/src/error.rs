//! Error types for the harness.

use vaultline_types::{Address, ChainError};

use crate::engine::UnitId;
use crate::shadow::InvariantViolation;

/// Result alias used throughout the crate.
pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// Errors that can occur while driving a simulation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    /// An address was used to scope an event lookup but was never registered.
    #[error("contract {address} is not registered with the event decoder")]
    UnregisteredContract { address: Address },

    /// No contract was registered under the given name.
    #[error("no contract registered under the name {0:?}")]
    UnknownContractName(String),

    /// A required event is absent from a decoded event list.
    #[error("missing event {event}{}, found [{}]", scope_suffix(.contract.as_deref()), .found.join(", "))]
    MissingEvent {
        event: String,
        contract: Option<String>,
        found: Vec<String>,
    },

    /// A log with a known signature could not be decoded.
    #[error("failed to decode {event}: {reason}")]
    Decode { event: String, reason: String },

    /// Values did not match the schema they were encoded against.
    #[error("failed to encode {event}: {reason}")]
    Encode { event: String, reason: String },

    /// An ABI description could not be understood.
    #[error("invalid ABI: {0}")]
    InvalidAbi(String),

    /// A decoded event lacks the named field.
    #[error("event {event} has no field {field:?}")]
    MissingField { event: String, field: String },

    /// A decoded field holds a different kind of value than requested.
    #[error("field {field:?} of {event} is {actual}, expected {expected}")]
    FieldType {
        event: String,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The system under test rejected a call or a query.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// A unit ended with an error outside its allow-list.
    #[error("unit {unit} ({name}) failed: {error}")]
    UnitFailed {
        unit: UnitId,
        name: String,
        error: Box<SimError>,
    },

    /// A join was requested on a unit the engine never spawned.
    #[error("unit {0} does not exist")]
    UnknownUnit(UnitId),

    /// The engine no longer accepts new units.
    #[error("cannot spawn {0}: the engine is winding down")]
    WindingDown(String),

    /// A strict reconciliation pass found divergences.
    #[error("{} invariant violation(s), first: {}", .0.len(), first_violation(.0))]
    InvariantViolations(Vec<InvariantViolation>),

    /// Units were still active after the wind-down polling budget.
    #[error("wind-down did not finish: {active} unit(s) still active after {polls} polls")]
    WindDownTimeout { active: usize, polls: u32 },

    /// The configured action table names an action the workload lacks.
    #[error("unknown action {0:?}")]
    UnknownAction(String),

    /// Two runs of the same seed disagreed.
    #[error("nondeterminism detected for seed {seed}: {detail}")]
    Nondeterminism { seed: u64, detail: String },

    /// The pump did not reach a quiescent state.
    #[error("simulation did not quiesce after {steps} steps")]
    Livelock { steps: u64 },

    /// Internal consistency check failed.
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl SimError {
    /// Short kind used to match errors against allow-lists.
    ///
    /// Reverted calls are identified by their revert reason; every other
    /// error by its variant name.
    pub fn kind(&self) -> &str {
        match self {
            Self::Chain(ChainError::Reverted { reason }) => reason,
            Self::Chain(_) => "Chain",
            Self::UnregisteredContract { .. } => "UnregisteredContract",
            Self::UnknownContractName(_) => "UnknownContractName",
            Self::MissingEvent { .. } => "MissingEvent",
            Self::Decode { .. } => "Decode",
            Self::Encode { .. } => "Encode",
            Self::InvalidAbi(_) => "InvalidAbi",
            Self::MissingField { .. } => "MissingField",
            Self::FieldType { .. } => "FieldType",
            Self::UnitFailed { .. } => "UnitFailed",
            Self::UnknownUnit(_) => "UnknownUnit",
            Self::WindingDown(_) => "WindingDown",
            Self::InvariantViolations(_) => "InvariantViolations",
            Self::WindDownTimeout { .. } => "WindDownTimeout",
            Self::UnknownAction(_) => "UnknownAction",
            Self::Nondeterminism { .. } => "Nondeterminism",
            Self::Livelock { .. } => "Livelock",
            Self::Assertion(_) => "Assertion",
        }
    }

    /// Returns true if the error kind appears in `allow`.
    pub fn is_expected(&self, allow: &[&str]) -> bool {
        let kind = self.kind();
        allow.iter().any(|allowed| *allowed == kind)
    }
}

fn scope_suffix(contract: Option<&str>) -> String {
    contract.map(|c| format!(" on {c}")).unwrap_or_default()
}

fn first_violation(violations: &[InvariantViolation]) -> String {
    violations
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_reason_is_the_kind() {
        let err = SimError::from(ChainError::reverted("f-asset balance too low"));
        assert_eq!(err.kind(), "f-asset balance too low");
        assert!(err.is_expected(&["invalid crt id", "f-asset balance too low"]));
        assert!(!err.is_expected(&["invalid crt id"]));
    }

    #[test]
    fn other_errors_match_by_variant() {
        let err = SimError::UnknownAction("liquidate".into());
        assert_eq!(err.kind(), "UnknownAction");
        assert!(err.is_expected(&["UnknownAction"]));
    }

    #[test]
    fn missing_event_lists_what_was_found() {
        let err = SimError::MissingEvent {
            event: "MintingExecuted".into(),
            contract: Some("AssetManager".into()),
            found: vec!["CollateralReserved".into(), "Transfer".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing event MintingExecuted on AssetManager, found [CollateralReserved, Transfer]"
        );
    }
}
