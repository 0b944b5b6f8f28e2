use num_bigint::BigInt;
use test_case::test_case;

use super::*;

fn sample_log(address: Address, log_index: u64) -> RawLog {
    RawLog {
        address,
        topics: vec![B256::repeat_byte(0xAA)],
        data: vec![],
        block_number: 7,
        block_hash: B256::repeat_byte(0x01),
        tx_hash: B256::repeat_byte(0x02),
        tx_index: 0,
        log_index,
    }
}

#[test]
fn log_id_combines_address_and_index() {
    let address = Address::repeat_byte(0x11);
    let log = sample_log(address, 3);

    assert_eq!(
        log.id(),
        LogId {
            address,
            log_index: 3
        }
    );
    assert_eq!(log.signature_topic(), Some(&B256::repeat_byte(0xAA)));
}

#[test]
fn call_request_builder_appends_args_in_order() {
    let from = Address::repeat_byte(0x01);
    let to = Address::repeat_byte(0x02);
    let call = CallRequest::new(from, to, "redeem").arg(5u64).arg(true);

    assert_eq!(call.method, "redeem");
    assert_eq!(call.args, vec![Value::from(5u64), Value::Bool(true)]);
    assert!(call.to_string().starts_with(&format!("{to}.redeem(5, true)")));
}

#[test]
fn revert_reason_only_for_reverts() {
    assert_eq!(
        ChainError::reverted("not enough free collateral").revert_reason(),
        Some("not enough free collateral")
    );
    assert_eq!(ChainError::Unavailable("down".into()).revert_reason(), None);
}

#[test]
fn big_values_render_exactly() {
    let big = BigInt::from(10u8).pow(30);
    assert_eq!(
        Value::Int(big).to_string(),
        "1000000000000000000000000000000"
    );
}

#[test_case(Value::from(1u64), "integer"; "integer")]
#[test_case(Value::Bool(false), "bool"; "bool")]
#[test_case(Value::Bytes(vec![1, 2]), "bytes"; "bytes")]
#[test_case(Value::from("x"), "string"; "string")]
#[test_case(Value::Array(vec![]), "array"; "array")]
fn value_kind_names(value: Value, expected: &str) {
    assert_eq!(value.kind(), expected);
}

#[test]
fn receipt_serializes_without_raw_logs_when_absent() {
    let receipt = TxReceipt {
        tx_hash: B256::ZERO,
        block_number: 1,
        block_hash: B256::ZERO,
        tx_index: 0,
        from: Address::ZERO,
        to: Address::ZERO,
        logs: vec![],
        raw_logs: None,
    };

    let json = serde_json::to_string(&receipt).expect("serialize");
    assert!(!json.contains("raw_logs"));

    let back: TxReceipt = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, receipt);
}
