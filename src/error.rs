//! Failure taxonomy for payments and fetches.

use alloy_primitives::U256;
use flowpay_types::amount::MoneyAmountParseError;
use flowpay_types::proof::StreamId;
use flowpay_types::requirement::ChallengeDefect;
use http::StatusCode;

use crate::ledger::LedgerError;
use crate::spending::SpendError;
use crate::transport::TransportError;

/// Why a payment did not go through. Amounts are smallest token units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    /// Daily or total budget would be exceeded.
    #[error(transparent)]
    Budget(#[from] SpendError),
    #[error("Insufficient balance: need {required}, have {available}, short by {shortfall}")]
    InsufficientBalance {
        required: U256,
        available: U256,
        shortfall: U256,
    },
    #[error("Invalid {field} amount {value:?}: {source}")]
    InvalidAmount {
        field: &'static str,
        value: String,
        #[source]
        source: MoneyAmountParseError,
    },
    #[error("Ledger call failed: {context}: {source}")]
    LedgerCallFailed {
        context: &'static str,
        #[source]
        source: LedgerError,
    },
    /// The session was paused before this payment went out.
    #[error("Agent session is paused by emergency stop")]
    Paused,
    /// Too many stream openings in a short window. The session is now paused.
    #[error("Suspicious renewal rate detected, emergency stop engaged")]
    SuspiciousActivity,
    #[error("Stream {0} not found on the ledger")]
    StreamNotFound(StreamId),
    #[error("Stream {0} is already closed")]
    StreamInactive(StreamId),
}

impl PaymentError {
    /// Cancelling an already-closed stream fails, but nothing is wrong.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PaymentError::StreamNotFound(_) | PaymentError::StreamInactive(_)
        )
    }
}

/// Why a fetch ended without the resource.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Agent session is paused by emergency stop")]
    Paused,
    #[error("Payment challenge is not payable: {}", join_defects(.defects))]
    NotPayable { defects: Vec<ChallengeDefect> },
    #[error("Unsupported payment mode: {mode}")]
    UnsupportedMode { mode: String },
    #[error("Payment failed: {0}")]
    Payment(PaymentError),
    /// The server answered 402 again after being paid.
    #[error("Server did not accept the payment proof")]
    ProofRejected,
    #[error("Server responded with HTTP {status}")]
    HttpStatus { status: StatusCode },
    #[error("Transport failed after {retry_count} retries: {source}")]
    Transport {
        retry_count: u32,
        #[source]
        source: TransportError,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Fetch cancelled by caller")]
    Cancelled,
}

impl From<PaymentError> for FetchError {
    fn from(error: PaymentError) -> Self {
        match error {
            PaymentError::Paused => FetchError::Paused,
            other => FetchError::Payment(other),
        }
    }
}

impl FetchError {
    /// Outcomes that reflect a refusal or a budget decision rather than a fault.
    pub fn is_expected_outcome(&self) -> bool {
        matches!(
            self,
            FetchError::Paused
                | FetchError::Cancelled
                | FetchError::Payment(PaymentError::Budget(_))
        )
    }
}

fn join_defects(defects: &[ChallengeDefect]) -> String {
    defects
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_payment_surfaces_as_paused_fetch() {
        assert!(matches!(
            FetchError::from(PaymentError::Paused),
            FetchError::Paused
        ));
        assert!(matches!(
            FetchError::from(PaymentError::SuspiciousActivity),
            FetchError::Payment(PaymentError::SuspiciousActivity)
        ));
    }
}
