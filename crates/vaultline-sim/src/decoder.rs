//! Turns raw logs into typed events.
//!
//! The decoder keeps a registry of contract instances (address <-> name) and
//! of every event schema they expose, keyed by signature hash. Logs whose
//! first topic matches no registered schema are not errors: receipts routinely
//! carry logs of contracts the harness does not model.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use num_bigint::BigInt;
use vaultline_types::{Address, B256, LogId, RawLog, TxReceipt, Value};

use crate::abi::{ContractAbi, EventSchema};
use crate::error::{Result, SimError};

// ============================================================================
// Contract Instances
// ============================================================================

/// A deployed contract: its name, address and event ABI.
#[derive(Debug, Clone)]
pub struct ContractInstance {
    pub name: String,
    pub address: Address,
    pub abi: Arc<ContractAbi>,
}

impl ContractInstance {
    pub fn new(name: impl Into<String>, address: Address, abi: Arc<ContractAbi>) -> Self {
        Self {
            name: name.into(),
            address,
            abi,
        }
    }
}

// ============================================================================
// Decoded Events
// ============================================================================

/// Decoded field values, addressable by name or by position.
#[derive(Clone)]
pub struct EventArgs {
    schema: Arc<EventSchema>,
    values: Vec<Value>,
}

impl EventArgs {
    pub fn new(schema: Arc<EventSchema>, values: Vec<Value>) -> Self {
        Self { schema, values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.position(name).and_then(|i| self.values.get(i))
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn schema(&self) -> &Arc<EventSchema> {
        &self.schema
    }

    /// Iterates `(field name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .params()
            .iter()
            .map(|p| p.name.as_str())
            .zip(&self.values)
    }
}

impl PartialEq for EventArgs {
    fn eq(&self, other: &Self) -> bool {
        self.schema.signature() == other.schema.signature() && self.values == other.values
    }
}

impl Eq for EventArgs {}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// A log decoded against a registered schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub address: Address,
    pub event: String,
    pub signature: B256,
    pub args: EventArgs,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
}

impl DecodedEvent {
    /// Identity used for replay protection: `(tx hash, log index)`.
    pub fn id(&self) -> (B256, u64) {
        (self.tx_hash, self.log_index)
    }

    pub fn log_id(&self) -> LogId {
        LogId {
            address: self.address,
            log_index: self.log_index,
        }
    }

    /// Field by name.
    pub fn arg(&self, field: &str) -> Result<&Value> {
        self.args.get(field).ok_or_else(|| SimError::MissingField {
            event: self.event.clone(),
            field: field.to_string(),
        })
    }

    /// Integer field by name.
    pub fn int(&self, field: &str) -> Result<&BigInt> {
        let value = self.arg(field)?;
        value.as_int().ok_or_else(|| self.type_error(field, "integer", value))
    }

    /// Address field by name.
    pub fn address_arg(&self, field: &str) -> Result<Address> {
        let value = self.arg(field)?;
        value
            .as_address()
            .ok_or_else(|| self.type_error(field, "address", value))
    }

    fn type_error(&self, field: &str, expected: &'static str, value: &Value) -> SimError {
        SimError::FieldType {
            event: self.event.clone(),
            field: field.to_string(),
            expected,
            actual: value.kind(),
        }
    }
}

impl Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.event)?;
        for (i, (name, value)) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Event Decoder
// ============================================================================

/// Registry-backed log decoder.
#[derive(Debug, Default)]
pub struct EventDecoder {
    names: BTreeMap<Address, String>,
    addresses: BTreeMap<String, Address>,
    schemas: HashMap<B256, Arc<EventSchema>>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers contract instances and indexes their event schemas.
    ///
    /// When `only` is given, just the listed event names are indexed; the
    /// contracts themselves are registered regardless.
    pub fn register(&mut self, contracts: &[ContractInstance], only: Option<&[&str]>) {
        for contract in contracts {
            self.names.insert(contract.address, contract.name.clone());
            self.addresses.insert(contract.name.clone(), contract.address);

            for schema in contract.abi.events() {
                if only.is_some_and(|names| !names.contains(&schema.name())) {
                    continue;
                }
                let previous = self.schemas.insert(schema.signature(), Arc::clone(schema));
                if previous.is_some_and(|p| *p != **schema) {
                    tracing::warn!(
                        contract = %contract.name,
                        event = schema.name(),
                        "event signature re-registered with a different layout"
                    );
                }
            }
            tracing::debug!(contract = %contract.name, address = %contract.address, "registered contract");
        }
    }

    pub fn contract_name(&self, address: Address) -> Option<&str> {
        self.names.get(&address).map(String::as_str)
    }

    pub fn address_of(&self, name: &str) -> Result<Address> {
        self.addresses
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownContractName(name.to_string()))
    }

    pub fn is_registered(&self, address: Address) -> bool {
        self.names.contains_key(&address)
    }

    /// Number of indexed event schemas.
    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }

    /// Decodes one log.
    ///
    /// Returns `Ok(None)` for logs without topics or with an unknown first
    /// topic. A known signature with a malformed payload is an error.
    pub fn decode_event(&self, log: &RawLog) -> Result<Option<DecodedEvent>> {
        let Some(topic) = log.signature_topic() else {
            return Ok(None);
        };
        let Some(schema) = self.schemas.get(topic) else {
            return Ok(None);
        };

        let values = schema.decode(&log.topics, &log.data)?;
        Ok(Some(DecodedEvent {
            address: log.address,
            event: schema.name().to_string(),
            signature: schema.signature(),
            args: EventArgs::new(Arc::clone(schema), values),
            block_number: log.block_number,
            block_hash: log.block_hash,
            tx_hash: log.tx_hash,
            tx_index: log.tx_index,
            log_index: log.log_index,
        }))
    }

    /// Decodes every recognized log of a receipt.
    ///
    /// The nested `raw_logs` view is preferred when present; flat logs it
    /// does not contain are appended after it. Logs repeating an
    /// `(address, log index)` pair already seen are dropped.
    pub fn decode_events(&self, receipt: &TxReceipt) -> Result<Vec<DecodedEvent>> {
        let mut seen = HashSet::new();
        let ordered: Vec<&RawLog> = match &receipt.raw_logs {
            Some(raw) => raw.iter().chain(&receipt.logs).collect(),
            None => receipt.logs.iter().collect(),
        };

        let mut events = Vec::new();
        for log in ordered {
            if !seen.insert(log.id()) {
                continue;
            }
            if let Some(event) = self.decode_event(log)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// First event named `name`, optionally emitted by `contract`.
    pub fn find_event<'a>(
        &self,
        events: &'a [DecodedEvent],
        name: &str,
        contract: Option<Address>,
    ) -> Result<Option<&'a DecodedEvent>> {
        self.check_scope(contract)?;
        Ok(events.iter().find(|e| matches(e, name, contract)))
    }

    /// Every event named `name`, optionally emitted by `contract`.
    pub fn filter_events<'a>(
        &self,
        events: &'a [DecodedEvent],
        name: &str,
        contract: Option<Address>,
    ) -> Result<Vec<&'a DecodedEvent>> {
        self.check_scope(contract)?;
        Ok(events.iter().filter(|e| matches(e, name, contract)).collect())
    }

    /// Like [`find_event`](Self::find_event) but absence is an error.
    pub fn require_event<'a>(
        &self,
        events: &'a [DecodedEvent],
        name: &str,
        contract: Option<Address>,
    ) -> Result<&'a DecodedEvent> {
        self.find_event(events, name, contract)?
            .ok_or_else(|| self.missing(events, name, contract))
    }

    /// Like [`filter_events`](Self::filter_events) but an empty match is an error.
    pub fn require_events<'a>(
        &self,
        events: &'a [DecodedEvent],
        name: &str,
        contract: Option<Address>,
    ) -> Result<Vec<&'a DecodedEvent>> {
        let found = self.filter_events(events, name, contract)?;
        if found.is_empty() {
            return Err(self.missing(events, name, contract));
        }
        Ok(found)
    }

    /// Renders an event as `Contract.Event(field=value, ...)`.
    pub fn format_event(&self, event: &DecodedEvent) -> String {
        match self.contract_name(event.address) {
            Some(contract) => format!("{contract}.{event}"),
            None => format!("{}.{event}", event.address),
        }
    }

    fn check_scope(&self, contract: Option<Address>) -> Result<()> {
        match contract {
            Some(address) if !self.is_registered(address) => {
                Err(SimError::UnregisteredContract { address })
            }
            _ => Ok(()),
        }
    }

    fn missing(&self, events: &[DecodedEvent], name: &str, contract: Option<Address>) -> SimError {
        SimError::MissingEvent {
            event: name.to_string(),
            contract: contract
                .and_then(|a| self.contract_name(a))
                .map(str::to_string),
            found: events.iter().map(|e| e.event.clone()).collect(),
        }
    }
}

fn matches(event: &DecodedEvent, name: &str, contract: Option<Address>) -> bool {
    event.event == name && contract.is_none_or(|a| a == event.address)
}
