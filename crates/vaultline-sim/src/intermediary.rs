//! Submission and sequencing of state-changing calls.
//!
//! Every call goes through the [`TransactionIntermediary`], which hands back
//! a [`TxTicket`] immediately. In automatic mining mode each submission is
//! mined in its own block at the next flush; in manual mode submissions
//! accumulate until [`mine_block`](TransactionIntermediary::mine_block) executes
//! them, in submission order, inside a single block.

use std::collections::VecDeque;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use vaultline_config::MiningMode;
use vaultline_types::{CallRequest, ChainError, TxReceipt};

use crate::decoder::{DecodedEvent, EventDecoder};
use crate::engine::UnitId;
use crate::error::{Result, SimError};
use crate::sut::SystemUnderTest;

// ============================================================================
// Tickets and Outcomes
// ============================================================================

/// Handle of a submitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxTicket(u64);

impl Display for TxTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Result of a mined call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// The call executed; its recognized events are decoded.
    Acknowledged {
        receipt: TxReceipt,
        events: Vec<DecodedEvent>,
    },
    /// The call was rejected by the system under test.
    Failed(ChainError),
}

impl TxOutcome {
    /// Converts into the decoded events, or the call's error.
    pub fn into_events(self) -> Result<Vec<DecodedEvent>> {
        match self {
            Self::Acknowledged { events, .. } => Ok(events),
            Self::Failed(err) => Err(err.into()),
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }
}

/// A mined call paired with the unit that submitted it.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub ticket: TxTicket,
    pub unit: Option<UnitId>,
    pub call: CallRequest,
    pub outcome: TxOutcome,
}

#[derive(Debug)]
struct PendingTx {
    ticket: TxTicket,
    unit: Option<UnitId>,
    call: CallRequest,
}

/// Submission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediaryStats {
    pub submitted: u64,
    pub acknowledged: u64,
    pub reverted: u64,
    pub blocks_mined: u64,
}

// ============================================================================
// Transaction Intermediary
// ============================================================================

/// Queues calls and turns them into mined blocks.
#[derive(Debug)]
pub struct TransactionIntermediary {
    mode: MiningMode,
    pending: VecDeque<PendingTx>,
    next_ticket: u64,
    stats: IntermediaryStats,
}

impl TransactionIntermediary {
    pub fn new(mode: MiningMode) -> Self {
        Self {
            mode,
            pending: VecDeque::new(),
            next_ticket: 0,
            stats: IntermediaryStats::default(),
        }
    }

    pub fn mode(&self) -> MiningMode {
        self.mode
    }

    /// Switches mining mode. Pending calls are kept.
    pub fn set_mode(&mut self, mode: MiningMode) {
        if mode != self.mode {
            tracing::debug!(?mode, pending = self.pending.len(), "mining mode changed");
        }
        self.mode = mode;
    }

    /// Queues a call on behalf of `unit` (or of the harness itself).
    pub fn submit(&mut self, unit: Option<UnitId>, call: CallRequest) -> TxTicket {
        let ticket = TxTicket(self.next_ticket);
        self.next_ticket += 1;
        self.stats.submitted += 1;
        tracing::trace!(%ticket, ?unit, %call, "submitted");
        self.pending.push_back(PendingTx { ticket, unit, call });
        ticket
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn stats(&self) -> &IntermediaryStats {
        &self.stats
    }

    /// Mines what automatic mode owes: every pending call in its own block.
    /// Does nothing in manual mode.
    pub fn flush(
        &mut self,
        chain: &mut dyn SystemUnderTest,
        decoder: &EventDecoder,
    ) -> Result<Vec<Acknowledgement>> {
        match self.mode {
            MiningMode::Auto => self.mine_each(chain, decoder),
            MiningMode::Manual => Ok(Vec::new()),
        }
    }

    /// Mines until nothing is pending, regardless of the mining mode.
    pub fn settle(
        &mut self,
        chain: &mut dyn SystemUnderTest,
        decoder: &EventDecoder,
    ) -> Result<Vec<Acknowledgement>> {
        match self.mode {
            MiningMode::Auto => self.mine_each(chain, decoder),
            MiningMode::Manual => self.mine_block(chain, decoder),
        }
    }

    /// Executes every pending call, in submission order, in one block.
    pub fn mine_block(
        &mut self,
        chain: &mut dyn SystemUnderTest,
        decoder: &EventDecoder,
    ) -> Result<Vec<Acknowledgement>> {
        let batch: Vec<PendingTx> = self.pending.drain(..).collect();
        self.execute(batch, chain, decoder)
    }

    fn mine_each(
        &mut self,
        chain: &mut dyn SystemUnderTest,
        decoder: &EventDecoder,
    ) -> Result<Vec<Acknowledgement>> {
        let mut acks = Vec::with_capacity(self.pending.len());
        while let Some(tx) = self.pending.pop_front() {
            acks.extend(self.execute(vec![tx], chain, decoder)?);
        }
        Ok(acks)
    }

    fn execute(
        &mut self,
        batch: Vec<PendingTx>,
        chain: &mut dyn SystemUnderTest,
        decoder: &EventDecoder,
    ) -> Result<Vec<Acknowledgement>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let calls: Vec<CallRequest> = batch.iter().map(|tx| tx.call.clone()).collect();
        let results = chain.mine_block(&calls);
        if results.len() != batch.len() {
            return Err(SimError::Assertion(format!(
                "{} returned {} result(s) for {} call(s)",
                chain.name(),
                results.len(),
                batch.len()
            )));
        }
        self.stats.blocks_mined += 1;

        let mut acks = Vec::with_capacity(batch.len());
        for (tx, result) in batch.into_iter().zip(results) {
            let outcome = match result {
                Ok(receipt) => {
                    let events = decoder.decode_events(&receipt)?;
                    self.stats.acknowledged += 1;
                    TxOutcome::Acknowledged { receipt, events }
                }
                Err(err) => {
                    self.stats.reverted += 1;
                    tracing::debug!(ticket = %tx.ticket, call = %tx.call, error = %err, "call failed");
                    TxOutcome::Failed(err)
                }
            };
            acks.push(Acknowledgement {
                ticket: tx.ticket,
                unit: tx.unit,
                call: tx.call,
                outcome,
            });
        }
        Ok(acks)
    }
}
