//! # vaultline-types: Chain-facing types for `Vaultline`
//!
//! This crate contains the types shared between the harness and the system
//! under test:
//! - Primitives re-exported from `alloy-primitives` ([`Address`], [`B256`])
//! - Dynamically typed event/call values ([`Value`])
//! - Log and receipt shapes ([`RawLog`], [`TxReceipt`], [`LogId`])
//! - Requests against the system under test ([`CallRequest`], [`Query`])
//! - SUT-facing failures ([`ChainError`])
//! - Simulated time ([`SimTime`])
//!
//! All on-chain integers are carried as [`BigInt`]. A value like `10^30`
//! must survive every hop through the harness without rounding.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub use alloy_primitives::{Address, B256, keccak256};
pub use num_bigint::BigInt;

mod value;

pub use value::Value;

/// Simulated time in seconds since the Unix epoch.
pub type SimTime = u64;

// ============================================================================
// Log Identity
// ============================================================================

/// Identity of a log within a block: the emitting contract and its log index.
///
/// Used to deduplicate logs that are reachable through both the flat and the
/// nested view of a transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub address: Address,
    pub log_index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.log_index)
    }
}

// ============================================================================
// Raw Logs and Receipts
// ============================================================================

/// An undecoded log record as emitted by the system under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Emitting contract.
    pub address: Address,
    /// Indexed topics; for non-anonymous events the first one is the signature.
    pub topics: Vec<B256>,
    /// ABI-encoded non-indexed fields.
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
}

impl RawLog {
    /// Returns the identity used for deduplication.
    pub fn id(&self) -> LogId {
        LogId {
            address: self.address,
            log_index: self.log_index,
        }
    }

    /// Returns the first topic, if any.
    pub fn signature_topic(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Result of an executed transaction.
///
/// `logs` is the flat list of logs emitted by the called contract. Systems
/// that trace internal calls additionally fill `raw_logs` with every log raised
/// during execution, including those of indirectly invoked contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_index: u64,
    pub from: Address,
    pub to: Address,
    pub logs: Vec<RawLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_logs: Option<Vec<RawLog>>,
}

// ============================================================================
// Requests
// ============================================================================

/// A state-changing call submitted to the system under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub method: String,
    pub args: Vec<Value>,
}

impl CallRequest {
    pub fn new(from: Address, to: Address, method: impl Into<String>) -> Self {
        Self {
            from,
            to,
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

impl Display for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.to, self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") from {}", self.from)
    }
}

/// A read-only query against the system under test.
///
/// Queries must be idempotent: they are the oracle side of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub contract: Address,
    pub method: String,
    pub args: Vec<Value>,
}

impl Query {
    pub fn new(contract: Address, method: impl Into<String>) -> Self {
        Self {
            contract,
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

// ============================================================================
// Chain Errors
// ============================================================================

/// Failures reported by the system under test.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The call executed and reverted with a named reason.
    #[error("reverted: {reason}")]
    Reverted { reason: String },

    /// No contract is deployed at the address.
    #[error("no contract at {0}")]
    UnknownContract(Address),

    /// The contract has no such method.
    #[error("unknown method {method} on {contract}")]
    UnknownMethod { contract: Address, method: String },

    /// The arguments do not match the method.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The system under test could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    pub fn reverted(reason: impl Into<String>) -> Self {
        Self::Reverted {
            reason: reason.into(),
        }
    }

    /// Returns the revert reason for reverted calls.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::Reverted { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests;
