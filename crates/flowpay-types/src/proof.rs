//! Proof of payment attached to a retried request.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::headers::{HeaderNames, HeaderTable};

/// Ledger-assigned stream identifier. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction hash of a ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    const LEN: usize = 66;

    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x` followed by 64 characters, the shape resource servers accept as direct proof.
    pub fn is_well_formed(&self) -> bool {
        self.0.starts_with("0x") && self.0.len() == Self::LEN
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either an open stream or a settled one-shot transfer. Never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentProof {
    Stream(StreamId),
    Direct(TxHash),
}

impl PaymentProof {
    /// Writes the proof header, clearing whichever proof header was there before.
    pub fn apply(&self, headers: &mut HeaderTable, names: &HeaderNames) {
        headers.remove(&names.stream_id);
        headers.remove(&names.tx_hash);
        match self {
            PaymentProof::Stream(id) => headers.insert(&names.stream_id, id.as_str()),
            PaymentProof::Direct(hash) => headers.insert(&names.tx_hash, hash.as_str()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sets_exactly_one_proof_header() {
        let names = HeaderNames::default();
        let mut headers = HeaderTable::new();
        PaymentProof::Direct(TxHash::new(format!("0x{}", "ab".repeat(32))))
            .apply(&mut headers, &names);
        PaymentProof::Stream(StreamId::new("7")).apply(&mut headers, &names);
        assert_eq!(headers.get("X-FlowPay-Stream-Id"), Some("7"));
        assert!(!headers.contains("x-flowpay-tx-hash"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_tx_hash_shape() {
        assert!(TxHash::new(format!("0x{}", "0".repeat(64))).is_well_formed());
        assert!(!TxHash::new("0x1234").is_well_formed());
        assert!(!TxHash::new("1".repeat(66)).is_well_formed());
    }
}
