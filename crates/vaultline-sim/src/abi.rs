//! Event schemas and the subset of the Solidity ABI used by event logs.
//!
//! Supported field types are `address`, `uintN`, `intN`, `bool`, `bytesN`,
//! `bytes`, `string` and dynamic arrays of those. Indexed fields live in the
//! log topics; indexed dynamic values only survive as their keccak hash and
//! decode to a 32-byte [`Value::FixedBytes`]. Non-indexed fields are packed
//! into the log data with the standard head/tail layout.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use num_bigint::{BigInt, Sign};
use num_traits::{One, Signed};
use serde::Deserialize;
use vaultline_types::{Address, B256, Value, keccak256};

use crate::error::{Result, SimError};

const WORD: usize = 32;

// ============================================================================
// Parameter Types
// ============================================================================

/// Declared type of an event field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Address,
    /// Unsigned integer with the given bit width.
    Uint(u16),
    /// Two's complement signed integer with the given bit width.
    Int(u16),
    Bool,
    /// `bytesN` with `N` in `1..=32`.
    FixedBytes(u8),
    Bytes,
    String,
    /// Dynamic array `T[]`.
    Array(Box<ParamKind>),
}

impl ParamKind {
    /// Parses a Solidity type name such as `uint256` or `address[]`.
    pub fn parse(ty: &str) -> Result<Self> {
        let ty = ty.trim();
        if let Some(inner) = ty.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(Self::parse(inner)?)));
        }
        match ty {
            "address" => return Ok(Self::Address),
            "bool" => return Ok(Self::Bool),
            "bytes" => return Ok(Self::Bytes),
            "string" => return Ok(Self::String),
            "uint" => return Ok(Self::Uint(256)),
            "int" => return Ok(Self::Int(256)),
            _ => {}
        }
        if let Some(bits) = ty.strip_prefix("uint") {
            return parse_bits(ty, bits).map(Self::Uint);
        }
        if let Some(bits) = ty.strip_prefix("int") {
            return parse_bits(ty, bits).map(Self::Int);
        }
        if let Some(len) = ty.strip_prefix("bytes") {
            return match len.parse::<u8>() {
                Ok(n) if (1..=32).contains(&n) => Ok(Self::FixedBytes(n)),
                _ => Err(SimError::InvalidAbi(format!("invalid fixed bytes type {ty:?}"))),
            };
        }
        Err(SimError::InvalidAbi(format!("unsupported type {ty:?}")))
    }

    /// Dynamic types are stored out of line in the data tail.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Bytes | Self::String | Self::Array(_))
    }
}

impl Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address => write!(f, "address"),
            Self::Uint(bits) => write!(f, "uint{bits}"),
            Self::Int(bits) => write!(f, "int{bits}"),
            Self::Bool => write!(f, "bool"),
            Self::FixedBytes(n) => write!(f, "bytes{n}"),
            Self::Bytes => write!(f, "bytes"),
            Self::String => write!(f, "string"),
            Self::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

fn parse_bits(ty: &str, bits: &str) -> Result<u16> {
    match bits.parse::<u16>() {
        Ok(n) if n % 8 == 0 && (8..=256).contains(&n) => Ok(n),
        _ => Err(SimError::InvalidAbi(format!("invalid integer type {ty:?}"))),
    }
}

// ============================================================================
// Event Schema
// ============================================================================

/// One field of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParam {
    pub name: String,
    pub kind: ParamKind,
    pub indexed: bool,
}

impl EventParam {
    pub fn new(name: impl Into<String>, kind: ParamKind, indexed: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            indexed,
        }
    }
}

/// Immutable description of one event type.
///
/// The signature hash and the name-to-position index are computed once at
/// construction. Schemas are shared through [`Arc`] between the contract ABI,
/// the decoder registry and every decoded event.
#[derive(Debug, Clone)]
pub struct EventSchema {
    name: String,
    params: Vec<EventParam>,
    anonymous: bool,
    signature: B256,
    positions: HashMap<String, usize>,
}

impl EventSchema {
    pub fn new(name: impl Into<String>, params: Vec<EventParam>, anonymous: bool) -> Self {
        let name = name.into();
        let signature = keccak256(canonical_signature(&name, &params).as_bytes());
        let positions = params
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.name.is_empty())
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self {
            name,
            params,
            anonymous,
            signature,
            positions,
        }
    }

    /// Parses a human-readable declaration.
    ///
    /// Accepts `Name(type [indexed] [name], ...)` with an optional leading
    /// `event` keyword and an optional trailing `anonymous` marker.
    pub fn parse(declaration: &str) -> Result<Self> {
        let invalid = |reason: &str| SimError::InvalidAbi(format!("{declaration:?}: {reason}"));

        let mut decl = declaration.trim();
        decl = decl.strip_prefix("event ").unwrap_or(decl).trim();
        let mut anonymous = false;
        if let Some(rest) = decl.strip_suffix("anonymous") {
            if rest.trim_end().ends_with(')') {
                anonymous = true;
                decl = rest.trim_end();
            }
        }

        let open = decl.find('(').ok_or_else(|| invalid("missing '('"))?;
        if !decl.ends_with(')') {
            return Err(invalid("missing ')'"));
        }
        let name = decl[..open].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("invalid event name"));
        }

        let inner = decl[open + 1..decl.len() - 1].trim();
        let mut params = Vec::new();
        if !inner.is_empty() {
            for part in inner.split(',') {
                let tokens: Vec<&str> = part.split_whitespace().collect();
                let (ty, indexed, field) = match tokens.as_slice() {
                    [ty] => (*ty, false, ""),
                    [ty, "indexed"] => (*ty, true, ""),
                    [ty, field] => (*ty, false, *field),
                    [ty, "indexed", field] => (*ty, true, *field),
                    _ => return Err(invalid(&format!("cannot parse parameter {part:?}"))),
                };
                params.push(EventParam::new(field, ParamKind::parse(ty)?, indexed));
            }
        }

        Ok(Self::new(name, params, anonymous))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[EventParam] {
        &self.params
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Keccak-256 of the canonical signature.
    pub fn signature(&self) -> B256 {
        self.signature
    }

    /// `Name(type1,type2,...)`.
    pub fn canonical_signature(&self) -> String {
        canonical_signature(&self.name, &self.params)
    }

    /// Position of the named field.
    pub fn position(&self, field: &str) -> Option<usize> {
        self.positions.get(field).copied()
    }

    /// Decodes topics and data into one value per field, in declaration order.
    ///
    /// For non-anonymous events `topics` must still start with the signature
    /// topic; it is skipped here.
    pub fn decode(&self, topics: &[B256], data: &[u8]) -> Result<Vec<Value>> {
        self.decode_inner(topics, data).map_err(|reason| SimError::Decode {
            event: self.name.clone(),
            reason,
        })
    }

    /// Encodes one value per field into log topics and data.
    pub fn encode(&self, values: &[Value]) -> Result<(Vec<B256>, Vec<u8>)> {
        self.encode_inner(values).map_err(|reason| SimError::Encode {
            event: self.name.clone(),
            reason,
        })
    }

    fn decode_inner(&self, topics: &[B256], data: &[u8]) -> Result<Vec<Value>, String> {
        let indexed_topics = if self.anonymous {
            topics
        } else {
            topics.get(1..).unwrap_or_default()
        };
        let indexed_count = self.params.iter().filter(|p| p.indexed).count();
        if indexed_topics.len() != indexed_count {
            return Err(format!(
                "expected {indexed_count} indexed topic(s), found {}",
                indexed_topics.len()
            ));
        }

        let body_kinds: Vec<&ParamKind> = self
            .params
            .iter()
            .filter(|p| !p.indexed)
            .map(|p| &p.kind)
            .collect();
        let mut body = decode_tuple(&body_kinds, data)?.into_iter();
        let mut topics = indexed_topics.iter();

        let mut values = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let value = if param.indexed {
                let topic = topics.next().ok_or("topic count changed while decoding")?;
                decode_topic(&param.kind, topic)?
            } else {
                body.next().ok_or("field count changed while decoding")?
            };
            values.push(value);
        }
        Ok(values)
    }

    fn encode_inner(&self, values: &[Value]) -> Result<(Vec<B256>, Vec<u8>), String> {
        if values.len() != self.params.len() {
            return Err(format!(
                "expected {} value(s), got {}",
                self.params.len(),
                values.len()
            ));
        }

        let mut topics = Vec::new();
        if !self.anonymous {
            topics.push(self.signature);
        }
        let mut body_kinds = Vec::new();
        let mut body_values = Vec::new();
        for (param, value) in self.params.iter().zip(values) {
            if param.indexed {
                topics.push(encode_topic(&param.kind, value)?);
            } else {
                body_kinds.push(&param.kind);
                body_values.push(value);
            }
        }
        if topics.len() > 4 {
            return Err(format!("{} topics exceed the limit of 4", topics.len()));
        }

        Ok((topics, encode_tuple(&body_kinds, &body_values)?))
    }
}

impl PartialEq for EventSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params && self.anonymous == other.anonymous
    }
}

impl Eq for EventSchema {}

fn canonical_signature(name: &str, params: &[EventParam]) -> String {
    let types: Vec<String> = params.iter().map(|p| p.kind.to_string()).collect();
    format!("{name}({})", types.join(","))
}

// ============================================================================
// Contract ABI
// ============================================================================

/// The event side of a contract's ABI.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    name: String,
    events: Vec<Arc<EventSchema>>,
}

#[derive(Deserialize)]
struct JsonAbiEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<JsonAbiInput>,
    #[serde(default)]
    anonymous: bool,
}

#[derive(Deserialize)]
struct JsonAbiInput {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    indexed: bool,
}

impl ContractAbi {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    /// Adds an event schema.
    pub fn with_event(mut self, schema: EventSchema) -> Self {
        self.events.push(Arc::new(schema));
        self
    }

    /// Builds an ABI from human-readable event declarations.
    pub fn from_declarations(name: impl Into<String>, declarations: &[&str]) -> Result<Self> {
        declarations
            .iter()
            .try_fold(Self::new(name), |abi, decl| -> Result<Self> {
                Ok(abi.with_event(EventSchema::parse(decl)?))
            })
    }

    /// Reads the event entries of a standard JSON ABI.
    ///
    /// Functions, errors and constructors are ignored. Events using types
    /// outside the supported subset (tuples, fixed-size arrays) are skipped
    /// with a warning.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self> {
        let entries: Vec<JsonAbiEntry> =
            serde_json::from_str(json).map_err(|e| SimError::InvalidAbi(e.to_string()))?;
        let mut abi = Self::new(name);

        for entry in entries.into_iter().filter(|e| e.kind == "event") {
            let params: Result<Vec<EventParam>> = entry
                .inputs
                .iter()
                .map(|input| {
                    Ok(EventParam::new(
                        input.name.clone(),
                        ParamKind::parse(&input.kind)?,
                        input.indexed,
                    ))
                })
                .collect();
            match params {
                Ok(params) => {
                    abi = abi.with_event(EventSchema::new(entry.name, params, entry.anonymous));
                }
                Err(e) => {
                    tracing::warn!(contract = %abi.name, event = %entry.name, error = %e, "skipping event");
                }
            }
        }

        Ok(abi)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &[Arc<EventSchema>] {
        &self.events
    }

    /// First event declared under `name`.
    pub fn event(&self, name: &str) -> Option<&Arc<EventSchema>> {
        self.events.iter().find(|e| e.name() == name)
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn decode_topic(kind: &ParamKind, topic: &B256) -> Result<Value, String> {
    if kind.is_dynamic() {
        return Ok(Value::FixedBytes(topic.to_vec()));
    }
    decode_word(kind, topic.as_slice())
}

fn decode_tuple(kinds: &[&ParamKind], data: &[u8]) -> Result<Vec<Value>, String> {
    let mut values = Vec::with_capacity(kinds.len());
    for (i, kind) in kinds.iter().enumerate() {
        let head = read_word(data, i * WORD)?;
        let value = if kind.is_dynamic() {
            decode_dynamic(kind, data, word_to_usize(head)?)?
        } else {
            decode_word(kind, head)?
        };
        values.push(value);
    }
    Ok(values)
}

fn decode_dynamic(kind: &ParamKind, data: &[u8], offset: usize) -> Result<Value, String> {
    let len = word_to_usize(read_word(data, offset)?)?;
    let body = offset + WORD;

    match kind {
        ParamKind::Bytes | ParamKind::String => {
            let end = body
                .checked_add(len)
                .ok_or_else(|| format!("length {len} overflows"))?;
            let bytes = data.get(body..end).ok_or_else(|| {
                format!("{len} byte(s) at offset {body} overrun {} byte(s) of data", data.len())
            })?;
            if *kind == ParamKind::Bytes {
                Ok(Value::Bytes(bytes.to_vec()))
            } else {
                String::from_utf8(bytes.to_vec())
                    .map(Value::String)
                    .map_err(|e| format!("invalid utf-8 string: {e}"))
            }
        }
        ParamKind::Array(inner) => {
            let tail = data.get(body..).unwrap_or_default();
            if len > tail.len() / WORD {
                return Err(format!("array of {len} element(s) overruns the data"));
            }
            let kinds = vec![inner.as_ref(); len];
            decode_tuple(&kinds, tail).map(Value::Array)
        }
        _ => Err(format!("{kind} is not a dynamic type")),
    }
}

fn decode_word(kind: &ParamKind, word: &[u8]) -> Result<Value, String> {
    match kind {
        ParamKind::Address => {
            if word[..12].iter().any(|b| *b != 0) {
                return Err("address word has dirty high bytes".to_string());
            }
            Ok(Value::Address(Address::from_slice(&word[12..])))
        }
        ParamKind::Uint(bits) => {
            let value = BigInt::from_bytes_be(Sign::Plus, word);
            if value.bits() > u64::from(*bits) {
                return Err(format!("value {value} does not fit uint{bits}"));
            }
            Ok(Value::Int(value))
        }
        ParamKind::Int(bits) => {
            let value = BigInt::from_signed_bytes_be(word);
            check_signed_range(&value, *bits)?;
            Ok(Value::Int(value))
        }
        ParamKind::Bool => match (word[..31].iter().all(|b| *b == 0), word[31]) {
            (true, 0) => Ok(Value::Bool(false)),
            (true, 1) => Ok(Value::Bool(true)),
            _ => Err("invalid bool word".to_string()),
        },
        ParamKind::FixedBytes(n) => Ok(Value::FixedBytes(word[..usize::from(*n)].to_vec())),
        _ => Err(format!("{kind} is not a static type")),
    }
}

fn read_word(data: &[u8], at: usize) -> Result<&[u8], String> {
    at.checked_add(WORD)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| format!("word at offset {at} overruns {} byte(s) of data", data.len()))
}

fn word_to_usize(word: &[u8]) -> Result<usize, String> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err("offset or length does not fit 64 bits".to_string());
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(low)).map_err(|e| e.to_string())
}

fn check_signed_range(value: &BigInt, bits: u16) -> Result<(), String> {
    let max = BigInt::one() << (usize::from(bits) - 1);
    let min = -max.clone();
    if *value >= max || *value < min {
        return Err(format!("value {value} does not fit int{bits}"));
    }
    Ok(())
}

// ============================================================================
// Encoding
// ============================================================================

fn encode_topic(kind: &ParamKind, value: &Value) -> Result<B256, String> {
    if !kind.is_dynamic() {
        return encode_word(kind, value).map(B256::from);
    }
    match (kind, value) {
        // Already hashed, e.g. a value taken from a decoded log.
        (_, Value::FixedBytes(hash)) if hash.len() == WORD => Ok(B256::from_slice(hash)),
        (ParamKind::Bytes, Value::Bytes(bytes)) => Ok(keccak256(bytes)),
        (ParamKind::String, Value::String(s)) => Ok(keccak256(s.as_bytes())),
        (ParamKind::Array(inner), Value::Array(items)) if !inner.is_dynamic() => {
            let mut packed = Vec::with_capacity(items.len() * WORD);
            for item in items {
                packed.extend_from_slice(&encode_word(inner, item)?);
            }
            Ok(keccak256(&packed))
        }
        _ => Err(format!("cannot index {} as {kind}", value.kind())),
    }
}

fn encode_tuple(kinds: &[&ParamKind], values: &[&Value]) -> Result<Vec<u8>, String> {
    let head_len = kinds.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for (kind, value) in kinds.iter().zip(values) {
        if kind.is_dynamic() {
            head.extend_from_slice(&usize_word(head_len + tail.len()));
            tail.extend(encode_dynamic(kind, value)?);
        } else {
            head.extend_from_slice(&encode_word(kind, value)?);
        }
    }

    head.extend(tail);
    Ok(head)
}

fn encode_dynamic(kind: &ParamKind, value: &Value) -> Result<Vec<u8>, String> {
    match (kind, value) {
        (ParamKind::Bytes, Value::Bytes(bytes)) => Ok(encode_length_prefixed(bytes)),
        (ParamKind::String, Value::String(s)) => Ok(encode_length_prefixed(s.as_bytes())),
        (ParamKind::Array(inner), Value::Array(items)) => {
            let mut out = usize_word(items.len()).to_vec();
            let kinds = vec![inner.as_ref(); items.len()];
            let values: Vec<&Value> = items.iter().collect();
            out.extend(encode_tuple(&kinds, &values)?);
            Ok(out)
        }
        _ => Err(format!("expected {kind}, got {}", value.kind())),
    }
}

fn encode_length_prefixed(bytes: &[u8]) -> Vec<u8> {
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut out = Vec::with_capacity(WORD + padded);
    out.extend_from_slice(&usize_word(bytes.len()));
    out.extend_from_slice(bytes);
    out.resize(WORD + padded, 0);
    out
}

fn encode_word(kind: &ParamKind, value: &Value) -> Result<[u8; WORD], String> {
    let mut word = [0u8; WORD];
    match (kind, value) {
        (ParamKind::Address, Value::Address(address)) => {
            word[12..].copy_from_slice(address.as_slice());
        }
        (ParamKind::Uint(bits), Value::Int(v)) => {
            if v.is_negative() || v.bits() > u64::from(*bits) {
                return Err(format!("value {v} does not fit uint{bits}"));
            }
            let (_, bytes) = v.to_bytes_be();
            word[WORD - bytes.len()..].copy_from_slice(&bytes);
        }
        (ParamKind::Int(bits), Value::Int(v)) => {
            check_signed_range(v, *bits)?;
            if v.is_negative() {
                word = [0xff; WORD];
            }
            let bytes = v.to_signed_bytes_be();
            word[WORD - bytes.len()..].copy_from_slice(&bytes);
        }
        (ParamKind::Bool, Value::Bool(b)) => word[WORD - 1] = u8::from(*b),
        (ParamKind::FixedBytes(n), Value::FixedBytes(bytes)) if bytes.len() == usize::from(*n) => {
            word[..bytes.len()].copy_from_slice(bytes);
        }
        _ => return Err(format!("expected {kind}, got {}", value.kind())),
    }
    Ok(word)
}

fn usize_word(n: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[24..].copy_from_slice(&(n as u64).to_be_bytes());
    word
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn transfer_signature_matches_erc20() {
        let schema = EventSchema::parse(
            "event Transfer(address indexed from, address indexed to, uint256 value)",
        )
        .expect("valid declaration");

        assert_eq!(schema.canonical_signature(), "Transfer(address,address,uint256)");
        assert_eq!(
            hex::encode(schema.signature()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(schema.position("to"), Some(1));
        assert_eq!(schema.position("missing"), None);
        assert!(!schema.is_anonymous());
    }

    #[test_case("uint", ParamKind::Uint(256))]
    #[test_case("int64", ParamKind::Int(64))]
    #[test_case("bytes32", ParamKind::FixedBytes(32))]
    #[test_case("string[]", ParamKind::Array(Box::new(ParamKind::String)))]
    fn parses_types(ty: &str, expected: ParamKind) {
        assert_eq!(ParamKind::parse(ty).expect("supported"), expected);
    }

    #[test_case("uint7")]
    #[test_case("bytes33")]
    #[test_case("uint256[2]")]
    #[test_case("tuple")]
    fn rejects_unsupported_types(ty: &str) {
        assert!(matches!(ParamKind::parse(ty), Err(SimError::InvalidAbi(_))));
    }

    #[test]
    fn signed_and_dynamic_fields_survive_encoding() {
        let schema = EventSchema::parse(
            "Paid(address indexed agent, int256 spent, string memo, uint256[] ids, bytes proof)",
        )
        .expect("valid declaration");
        let values = vec![
            Value::Address(Address::repeat_byte(0x42)),
            Value::Int(BigInt::from(-12_345)),
            Value::from("underlying payment"),
            Value::Array(vec![Value::from(1u64), Value::from(u128::MAX)]),
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
        ];

        let (topics, data) = schema.encode(&values).expect("encodes");
        assert_eq!(topics.len(), 2);
        assert_eq!(data.len() % WORD, 0);

        let decoded = schema.decode(&topics, &data).expect("decodes");
        assert_eq!(decoded, values);
    }

    #[test]
    fn indexed_string_decodes_to_its_hash() {
        let schema = EventSchema::parse("Tagged(string indexed tag)").expect("valid");
        let (topics, data) = schema.encode(&[Value::from("core")]).expect("encodes");
        let decoded = schema.decode(&topics, &data).expect("decodes");
        assert_eq!(decoded, vec![Value::FixedBytes(keccak256(b"core").to_vec())]);
    }

    #[test]
    fn anonymous_events_keep_every_topic() {
        let schema =
            EventSchema::parse("Ping(uint256 indexed nonce) anonymous").expect("valid declaration");
        assert!(schema.is_anonymous());

        let (topics, data) = schema.encode(&[Value::from(9u64)]).expect("encodes");
        assert_eq!(topics.len(), 1);
        assert_eq!(schema.decode(&topics, &data).expect("decodes"), vec![Value::from(9u64)]);
    }

    #[test]
    fn truncated_data_is_a_decode_error() {
        let schema = EventSchema::parse("Burn(uint256 amount, string memo)").expect("valid");
        let (topics, data) = schema
            .encode(&[Value::from(5u64), Value::from("x")])
            .expect("encodes");

        let err = schema.decode(&topics, &data[..40]).unwrap_err();
        assert!(matches!(err, SimError::Decode { ref event, .. } if event == "Burn"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let schema = EventSchema::parse("Small(uint8 a, int8 b)").expect("valid");
        assert!(schema.encode(&[Value::from(256u64), Value::from(0i64)]).is_err());
        assert!(schema.encode(&[Value::from(1u64), Value::from(-129i64)]).is_err());
        assert!(schema.encode(&[Value::from(255u64), Value::from(-128i64)]).is_ok());
    }

    #[test]
    fn json_abi_keeps_supported_events_only() {
        let json = r#"[
            {"type": "function", "name": "transfer", "inputs": []},
            {"type": "event", "name": "Transfer", "anonymous": false, "inputs": [
                {"name": "from", "type": "address", "indexed": true},
                {"name": "to", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256", "indexed": false}
            ]},
            {"type": "event", "name": "Settled", "inputs": [
                {"name": "info", "type": "tuple", "indexed": false}
            ]}
        ]"#;

        let abi = ContractAbi::from_json("FAsset", json).expect("valid json");
        assert_eq!(abi.name(), "FAsset");
        assert_eq!(abi.events().len(), 1);
        let transfer = abi.event("Transfer").expect("transfer present");
        assert_eq!(transfer.params()[0].name, "from");
        assert!(transfer.params()[1].indexed);
        assert!(abi.event("Settled").is_none());
    }
}
