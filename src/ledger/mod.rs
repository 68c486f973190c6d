//! The ledger a client pays through.
//!
//! The engine never talks to a chain directly. It drives a [`PaymentLedger`]:
//! open a stream with a deposit, close it for a refund, ask whether it is
//! still live, make a one-shot transfer, read a balance. Implementations
//! decide how those map onto contracts and signers. [`SimulatedLedger`] keeps
//! everything in memory for dry runs and tests.

mod simulated;

pub use simulated::SimulatedLedger;

use alloy_primitives::{Address, U256};
use flowpay_types::proof::{StreamId, TxHash};
use flowpay_types::requirement::TokenKind;
use flowpay_types::timestamp::UnixTimestamp;
use serde::Serialize;

/// Context recorded alongside a stream, for the recipient and for audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub agent_id: String,
    pub timestamp: UnixTimestamp,
    pub service_url: String,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub recipient: Address,
    pub contract: Address,
    pub token: TokenKind,
    pub duration_secs: u64,
    pub deposit: U256,
    pub metadata: StreamMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedStream {
    pub stream_id: StreamId,
    pub start_time: UnixTimestamp,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub recipient: Address,
    pub contract: Address,
    pub token: TokenKind,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledStream {
    pub refund_amount: U256,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The ledger could not be reached or did not answer.
    #[error("Ledger unavailable: {0}")]
    Transport(String),
    /// The ledger answered and refused.
    #[error("Ledger rejected the call: {0}")]
    Rejected(String),
    #[error("Stream {0} not found")]
    StreamNotFound(StreamId),
    #[error("Stream {0} is no longer active")]
    StreamInactive(StreamId),
}

#[async_trait::async_trait]
pub trait PaymentLedger: Send + Sync {
    /// The paying account.
    fn address(&self) -> Address;

    async fn create_stream(&self, request: StreamRequest) -> Result<OpenedStream, LedgerError>;

    async fn cancel_stream(&self, stream_id: &StreamId) -> Result<CancelledStream, LedgerError>;

    async fn is_stream_active(&self, stream_id: &StreamId) -> Result<bool, LedgerError>;

    async fn transfer(&self, request: TransferRequest) -> Result<TxHash, LedgerError>;

    async fn get_balance(&self, address: Address) -> Result<U256, LedgerError>;
}
