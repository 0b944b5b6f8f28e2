//! Contract ABIs and addresses of the in-memory protocol.

use std::sync::Arc;

use num_bigint::BigInt;
use vaultline_types::{Address, B256, Value};

use crate::abi::ContractAbi;
use crate::decoder::{ContractInstance, DecodedEvent, EventArgs};
use crate::error::{Result, SimError};

pub const ASSET_MANAGER: Address = Address::new([0xa5; 20]);
pub const FASSET: Address = Address::new([0xf5; 20]);

pub const ASSET_MANAGER_NAME: &str = "AssetManager";
pub const FASSET_NAME: &str = "FAsset";

/// Value of one lot in the smallest underlying unit.
pub const LOT_SIZE: u128 = 100_000_000_000_000_000_000;

/// Lots an agent can back when it starts out.
pub const AGENT_CAPACITY_LOTS: u64 = 200;

/// Seconds a minter or agent has to pay on the underlying chain.
pub const PAYMENT_WINDOW: u64 = 600;

pub fn lot_size() -> BigInt {
    BigInt::from(LOT_SIZE)
}

pub fn lots(count: u64) -> BigInt {
    lot_size() * count
}

pub const ASSET_MANAGER_EVENTS: &[&str] = &[
    "AgentVaultCreated(address indexed owner, address indexed agentVault)",
    "AgentDestroyed(address indexed agentVault)",
    "CollateralReserved(address indexed agentVault, address indexed minter, \
     uint256 collateralReservationId, uint256 valueUBA, uint256 feeUBA, \
     uint256 lastUnderlyingBlock, uint256 lastUnderlyingTimestamp, string paymentAddress)",
    "MintingExecuted(address indexed agentVault, uint256 collateralReservationId, \
     uint256 mintedAmountUBA, uint256 agentFeeUBA, uint256 poolFeeUBA)",
    "MintingPaymentDefault(address indexed agentVault, address indexed minter, \
     uint256 collateralReservationId, uint256 reservedAmountUBA)",
    "CollateralReservationDeleted(address indexed agentVault, address indexed minter, \
     uint256 collateralReservationId, uint256 reservedAmountUBA)",
    "RedemptionTicketCreated(address indexed agentVault, uint256 indexed redemptionTicketId, \
     uint256 ticketValueUBA)",
    "RedemptionTicketUpdated(address indexed agentVault, uint256 indexed redemptionTicketId, \
     uint256 ticketValueUBA)",
    "RedemptionTicketDeleted(address indexed agentVault, uint256 indexed redemptionTicketId)",
    "DustChanged(address indexed agentVault, uint256 dustUBA)",
    "RedemptionRequested(address indexed agentVault, address indexed redeemer, \
     uint256 requestId, string paymentAddress, uint256 valueUBA, uint256 feeUBA, \
     uint256 lastUnderlyingBlock, uint256 lastUnderlyingTimestamp)",
    "RedemptionPerformed(address indexed agentVault, address indexed redeemer, \
     uint256 indexed requestId, bytes32 transactionHash, uint256 redemptionAmountUBA, \
     int256 spentUnderlyingUBA)",
    "RedemptionDefault(address indexed agentVault, address indexed redeemer, \
     uint256 indexed requestId, uint256 redemptionAmountUBA, \
     uint256 redeemedVaultCollateralWei, uint256 redeemedPoolCollateralWei)",
    "RedemptionPaymentFailed(address indexed agentVault, address indexed redeemer, \
     uint256 indexed requestId, bytes32 transactionHash, int256 spentUnderlyingUBA, \
     string failureReason)",
    "RedemptionPaymentBlocked(address indexed agentVault, address indexed redeemer, \
     uint256 indexed requestId, bytes32 transactionHash, uint256 redemptionAmountUBA, \
     int256 spentUnderlyingUBA)",
    "SelfClose(address indexed agentVault, uint256 valueUBA)",
    "LiquidationPerformed(address indexed agentVault, address indexed liquidator, uint256 valueUBA)",
    "TransferToCoreVaultStarted(address indexed agentVault, \
     uint256 indexed transferRedemptionRequestId, uint256 valueUBA)",
    "TransferToCoreVaultSuccessful(address indexed agentVault, \
     uint256 indexed transferRedemptionRequestId, uint256 valueUBA)",
    "ReturnFromCoreVaultRequested(address indexed agentVault, uint256 indexed requestId, \
     bytes32 paymentReference, uint256 valueUBA)",
    "ReturnFromCoreVaultConfirmed(address indexed agentVault, uint256 indexed requestId, \
     uint256 receivedUnderlyingUBA, uint256 remintedUBA)",
    "ReturnFromCoreVaultCancelled(address indexed agentVault, uint256 indexed requestId)",
];

pub const FASSET_EVENTS: &[&str] = &[
    "Transfer(address indexed from, address indexed to, uint256 value)",
    "Approval(address indexed owner, address indexed spender, uint256 value)",
];

pub fn asset_manager_abi() -> Result<ContractAbi> {
    ContractAbi::from_declarations(ASSET_MANAGER_NAME, ASSET_MANAGER_EVENTS)
}

pub fn fasset_abi() -> Result<ContractAbi> {
    ContractAbi::from_declarations(FASSET_NAME, FASSET_EVENTS)
}

/// The asset manager and its synthetic token, ready for registration.
pub fn contracts() -> Result<Vec<ContractInstance>> {
    Ok(vec![
        ContractInstance::new(ASSET_MANAGER_NAME, ASSET_MANAGER, Arc::new(asset_manager_abi()?)),
        ContractInstance::new(FASSET_NAME, FASSET, Arc::new(fasset_abi()?)),
    ])
}

/// Builds a decoded event directly, bypassing the log codec.
///
/// `values` are given in declaration order.
pub fn synthetic_event(
    contract: &ContractInstance,
    name: &str,
    values: Vec<Value>,
    tx_hash: B256,
    log_index: u64,
) -> Result<DecodedEvent> {
    let schema = contract
        .abi
        .event(name)
        .cloned()
        .ok_or_else(|| SimError::MissingEvent {
            event: name.to_string(),
            contract: Some(contract.name.clone()),
            found: Vec::new(),
        })?;
    if schema.params().len() != values.len() {
        return Err(SimError::Encode {
            event: name.to_string(),
            reason: format!(
                "expected {} value(s), got {}",
                schema.params().len(),
                values.len()
            ),
        });
    }
    Ok(DecodedEvent {
        address: contract.address,
        event: name.to_string(),
        signature: schema.signature(),
        args: EventArgs::new(schema, values),
        block_number: 0,
        block_hash: B256::ZERO,
        tx_hash,
        tx_index: 0,
        log_index,
    })
}
