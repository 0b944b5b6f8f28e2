//! The boundary between the harness and the system under test.

use vaultline_types::{CallRequest, ChainError, Query, SimTime, TxReceipt, Value};

/// An execution environment hosting the protocol contracts.
///
/// Implementations execute state-changing calls in blocks, answer read-only
/// queries, and expose the knobs the timeline needs to move time forward.
pub trait SystemUnderTest {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Executes `calls` in submission order inside one block.
    ///
    /// Returns one entry per call. A reverted call leaves no state change and
    /// does not stop the remaining calls.
    fn mine_block(&mut self, calls: &[CallRequest]) -> Vec<Result<TxReceipt, ChainError>>;

    /// Idempotent read used as the reconciliation oracle.
    fn query(&self, query: &Query) -> Result<Vec<Value>, ChainError>;

    /// Current block timestamp.
    fn timestamp(&self) -> SimTime;

    /// Moves block time forward.
    fn increase_time(&mut self, seconds: u64);

    /// Produces blocks on the underlying chain.
    fn mine_underlying_blocks(&mut self, _count: u64) {}
}
