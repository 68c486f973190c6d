//! Payment requirements carried by a 402 challenge.
//!
//! A resource server that wants payment answers `402 Payment Required` and
//! describes its terms in headers:
//!
//! ```text
//! x-payment-required: true
//! x-flowpay-mode: streaming
//! x-flowpay-rate: 0.0001
//! x-flowpay-recipient: 0x…
//! x-flowpay-contract: 0x…
//! ```
//!
//! [`Challenge::classify`] inspects a response and says what kind of answer it
//! is; [`PaymentRequirement::parse`] is the total shortcut that yields either a
//! fully populated requirement or nothing.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::headers::{HeaderNames, HeaderTable};

const PAYMENT_REQUIRED_STATUS: u16 = 402;

/// How a payment is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMode {
    /// Continuous per-second payment from a single deposit.
    Streaming,
    /// A one-shot transfer per call.
    PerRequest,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Streaming => "streaming",
            PaymentMode::PerRequest => "per-request",
        }
    }
}

impl fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mode a server advertises in its challenge.
///
/// `hybrid` leaves the choice to the client: it may stream at the advertised
/// rate or pay one rate unit directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OfferedMode {
    Streaming,
    PerRequest,
    Hybrid,
}

impl OfferedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferedMode::Streaming => "streaming",
            OfferedMode::PerRequest => "per-request",
            OfferedMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for OfferedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported payment mode: {0}")]
pub struct UnknownPaymentMode(pub String);

impl FromStr for OfferedMode {
    type Err = UnknownPaymentMode;

    /// Exact match only: `streaming`, `per-request` or `hybrid`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(OfferedMode::Streaming),
            "per-request" => Ok(OfferedMode::PerRequest),
            "hybrid" => Ok(OfferedMode::Hybrid),
            other => Err(UnknownPaymentMode(other.to_string())),
        }
    }
}

/// Price terms. Amounts are the server's decimal strings, unconverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PaymentTerms {
    Streaming {
        rate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_deposit: Option<String>,
    },
    PerRequest {
        amount: String,
    },
    /// Streaming terms the client may also settle per call.
    Hybrid {
        rate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_deposit: Option<String>,
    },
}

/// The asset a payment is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Native,
    Erc20(Address),
}

impl TokenKind {
    pub fn address(&self) -> Option<Address> {
        match self {
            TokenKind::Native => None,
            TokenKind::Erc20(address) => Some(*address),
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Native => f.write_str("native"),
            TokenKind::Erc20(address) => write!(f, "{address}"),
        }
    }
}

/// What a server asked for, derived from one 402 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequirement {
    recipient: Address,
    contract: Address,
    token: TokenKind,
    terms: PaymentTerms,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl PaymentRequirement {
    /// Builds a streaming requirement directly, mostly for servers and tests.
    pub fn streaming(recipient: Address, contract: Address, rate: impl Into<String>) -> Self {
        Self {
            recipient,
            contract,
            token: TokenKind::Native,
            terms: PaymentTerms::Streaming {
                rate: rate.into(),
                min_deposit: None,
            },
            description: None,
        }
    }

    pub fn per_request(recipient: Address, contract: Address, amount: impl Into<String>) -> Self {
        Self {
            recipient,
            contract,
            token: TokenKind::Native,
            terms: PaymentTerms::PerRequest {
                amount: amount.into(),
            },
            description: None,
        }
    }

    pub fn hybrid(recipient: Address, contract: Address, rate: impl Into<String>) -> Self {
        Self {
            recipient,
            contract,
            token: TokenKind::Native,
            terms: PaymentTerms::Hybrid {
                rate: rate.into(),
                min_deposit: None,
            },
            description: None,
        }
    }

    pub fn with_min_deposit(mut self, min_deposit: impl Into<String>) -> Self {
        if let PaymentTerms::Streaming { min_deposit: slot, .. }
        | PaymentTerms::Hybrid { min_deposit: slot, .. } = &mut self.terms
        {
            *slot = Some(min_deposit.into());
        }
        self
    }

    pub fn with_token(mut self, token: TokenKind) -> Self {
        self.token = token;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parses a response into a requirement, or `None` when it is not a payable challenge.
    pub fn parse(status: u16, headers: &HeaderTable, names: &HeaderNames) -> Option<Self> {
        match Challenge::classify(status, headers, names) {
            Challenge::Payable(requirement) => Some(requirement),
            _ => None,
        }
    }

    pub fn mode(&self) -> OfferedMode {
        match self.terms {
            PaymentTerms::Streaming { .. } => OfferedMode::Streaming,
            PaymentTerms::PerRequest { .. } => OfferedMode::PerRequest,
            PaymentTerms::Hybrid { .. } => OfferedMode::Hybrid,
        }
    }

    pub fn terms(&self) -> &PaymentTerms {
        &self.terms
    }

    pub fn rate(&self) -> Option<&str> {
        match &self.terms {
            PaymentTerms::Streaming { rate, .. } | PaymentTerms::Hybrid { rate, .. } => Some(rate),
            PaymentTerms::PerRequest { .. } => None,
        }
    }

    pub fn amount(&self) -> Option<&str> {
        match &self.terms {
            PaymentTerms::PerRequest { amount } => Some(amount),
            PaymentTerms::Streaming { .. } | PaymentTerms::Hybrid { .. } => None,
        }
    }

    pub fn min_deposit(&self) -> Option<&str> {
        match &self.terms {
            PaymentTerms::Streaming { min_deposit, .. }
            | PaymentTerms::Hybrid { min_deposit, .. } => min_deposit.as_deref(),
            PaymentTerms::PerRequest { .. } => None,
        }
    }

    pub fn recipient(&self) -> Address {
        self.recipient
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn token(&self) -> TokenKind {
        self.token
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Display for PaymentRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.terms {
            PaymentTerms::Streaming { rate, min_deposit }
            | PaymentTerms::Hybrid { rate, min_deposit } => {
                write!(f, "{} {rate}/s", self.mode())?;
                if let Some(min_deposit) = min_deposit {
                    write!(f, " (min deposit {min_deposit})")?;
                }
            }
            PaymentTerms::PerRequest { amount } => write!(f, "per-request {amount}")?,
        }
        write!(
            f,
            " to {} via {} in {}",
            self.recipient, self.contract, self.token
        )?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        Ok(())
    }
}

/// Why a 402 challenge could not be turned into a requirement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeDefect {
    #[error("missing header {0}")]
    Missing(String),
    #[error("header {header} is not a valid address: {value}")]
    InvalidAddress { header: String, value: String },
    #[error("recipient {0} must differ from the contract and token addresses")]
    RecipientConflict(Address),
}

/// Classification of an HTTP response against the payment protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Not a 402, or the payment marker is absent or not `true`.
    NotAChallenge,
    Payable(PaymentRequirement),
    /// The server asks for a mode other than `streaming`, `per-request` or `hybrid`.
    UnsupportedMode { mode: String },
    Malformed { defects: Vec<ChallengeDefect> },
}

impl Challenge {
    pub fn classify(status: u16, headers: &HeaderTable, names: &HeaderNames) -> Self {
        if status != PAYMENT_REQUIRED_STATUS {
            return Challenge::NotAChallenge;
        }
        let marked = headers
            .get(&names.payment_required)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        if !marked {
            return Challenge::NotAChallenge;
        }

        let field = |name: &str| {
            headers
                .get(name)
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let mut defects = Vec::new();

        let mode = match field(&names.mode) {
            Some(raw) => match raw.parse::<OfferedMode>() {
                Ok(mode) => Some(mode),
                Err(UnknownPaymentMode(mode)) => return Challenge::UnsupportedMode { mode },
            },
            None => {
                defects.push(ChallengeDefect::Missing(names.mode.clone()));
                None
            }
        };

        let address = |name: &str, defects: &mut Vec<ChallengeDefect>| match field(name) {
            Some(raw) => match raw.parse::<Address>() {
                Ok(address) => Some(address),
                Err(_) => {
                    defects.push(ChallengeDefect::InvalidAddress {
                        header: name.to_string(),
                        value: raw.to_string(),
                    });
                    None
                }
            },
            None => {
                defects.push(ChallengeDefect::Missing(name.to_string()));
                None
            }
        };
        let recipient = address(&names.recipient, &mut defects);
        let contract = address(&names.contract, &mut defects);

        let token = match field(&names.token) {
            None => Some(TokenKind::Native),
            Some(raw) if raw.eq_ignore_ascii_case("native") => Some(TokenKind::Native),
            Some(raw) => match raw.parse::<Address>() {
                Ok(address) if address == Address::ZERO => Some(TokenKind::Native),
                Ok(address) => Some(TokenKind::Erc20(address)),
                Err(_) => {
                    defects.push(ChallengeDefect::InvalidAddress {
                        header: names.token.clone(),
                        value: raw.to_string(),
                    });
                    None
                }
            },
        };

        let terms = mode.and_then(|mode| match mode {
            OfferedMode::Streaming | OfferedMode::Hybrid => match field(&names.rate) {
                Some(rate) => {
                    let rate = rate.to_string();
                    let min_deposit = field(&names.min_deposit).map(str::to_string);
                    Some(match mode {
                        OfferedMode::Hybrid => PaymentTerms::Hybrid { rate, min_deposit },
                        _ => PaymentTerms::Streaming { rate, min_deposit },
                    })
                }
                None => {
                    defects.push(ChallengeDefect::Missing(names.rate.clone()));
                    None
                }
            },
            OfferedMode::PerRequest => match field(&names.amount) {
                Some(amount) => Some(PaymentTerms::PerRequest {
                    amount: amount.to_string(),
                }),
                None => {
                    defects.push(ChallengeDefect::Missing(names.amount.clone()));
                    None
                }
            },
        });

        if let (Some(recipient), Some(contract), Some(token)) = (recipient, contract, token) {
            if recipient == contract || token.address() == Some(recipient) {
                defects.push(ChallengeDefect::RecipientConflict(recipient));
            }
        }

        match (recipient, contract, token, terms) {
            (Some(recipient), Some(contract), Some(token), Some(terms)) if defects.is_empty() => {
                Challenge::Payable(PaymentRequirement {
                    recipient,
                    contract,
                    token,
                    terms,
                    description: field(&names.description).map(str::to_string),
                })
            }
            _ => Challenge::Malformed { defects },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const RECIPIENT: Address = address!("0x1111111111111111111111111111111111111111");
    const CONTRACT: Address = address!("0x2222222222222222222222222222222222222222");
    const TOKEN: Address = address!("0x3333333333333333333333333333333333333333");

    fn streaming_headers() -> HeaderTable {
        [
            ("X-Payment-Required", "true".to_string()),
            ("X-FlowPay-Mode", "streaming".to_string()),
            ("X-FlowPay-Rate", "0.0001".to_string()),
            ("X-FlowPay-Recipient", RECIPIENT.to_string()),
            ("X-FlowPay-Contract", CONTRACT.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_parse_streaming_challenge() {
        let names = HeaderNames::default();
        let req = PaymentRequirement::parse(402, &streaming_headers(), &names).unwrap();
        assert_eq!(req.mode(), OfferedMode::Streaming);
        assert_eq!(req.rate(), Some("0.0001"));
        assert_eq!(req.amount(), None);
        assert_eq!(req.recipient(), RECIPIENT);
        assert_eq!(req.contract(), CONTRACT);
        assert_eq!(req.token(), TokenKind::Native);
    }

    #[test]
    fn test_parse_per_request_with_token_and_description() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.insert("x-flowpay-mode", "per-request");
        headers.remove("x-flowpay-rate");
        headers.insert("x-flowpay-amount", "0.01");
        headers.insert("x-flowpay-token", TOKEN.to_string());
        headers.insert("x-flowpay-description", "Weather lookup");
        let req = PaymentRequirement::parse(402, &headers, &names).unwrap();
        assert_eq!(req.mode(), OfferedMode::PerRequest);
        assert_eq!(req.amount(), Some("0.01"));
        assert_eq!(req.rate(), None);
        assert_eq!(req.token(), TokenKind::Erc20(TOKEN));
        assert_eq!(req.description(), Some("Weather lookup"));
    }

    #[test]
    fn test_not_a_challenge_without_marker_or_402() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        assert_eq!(
            Challenge::classify(200, &headers, &names),
            Challenge::NotAChallenge
        );
        headers.insert("x-payment-required", "false");
        assert_eq!(
            Challenge::classify(402, &headers, &names),
            Challenge::NotAChallenge
        );
        headers.insert("x-payment-required", "TRUE");
        assert!(matches!(
            Challenge::classify(402, &headers, &names),
            Challenge::Payable(_)
        ));
    }

    #[test]
    fn test_streaming_without_rate_is_malformed() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.remove("x-flowpay-rate");
        headers.insert("x-flowpay-amount", "0.01");
        assert_eq!(PaymentRequirement::parse(402, &headers, &names), None);
        assert_eq!(
            Challenge::classify(402, &headers, &names),
            Challenge::Malformed {
                defects: vec![ChallengeDefect::Missing("x-flowpay-rate".into())]
            }
        );
    }

    #[test]
    fn test_unknown_mode_is_reported() {
        let names = HeaderNames::default();
        for mode in ["one-time", "Hybrid", "Streaming"] {
            let mut headers = streaming_headers();
            headers.insert("x-flowpay-mode", mode);
            assert_eq!(PaymentRequirement::parse(402, &headers, &names), None);
            assert_eq!(
                Challenge::classify(402, &headers, &names),
                Challenge::UnsupportedMode { mode: mode.into() }
            );
        }
    }

    #[test]
    fn test_parse_hybrid_challenge() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.insert("x-flowpay-mode", "hybrid");
        headers.insert("x-flowpay-mindeposit", "0.5");
        let req = PaymentRequirement::parse(402, &headers, &names).unwrap();
        assert_eq!(req.mode(), OfferedMode::Hybrid);
        assert_eq!(req.rate(), Some("0.0001"));
        assert_eq!(req.min_deposit(), Some("0.5"));
        assert!(req.to_string().starts_with("hybrid 0.0001/s (min deposit 0.5)"));

        headers.remove("x-flowpay-rate");
        assert_eq!(
            Challenge::classify(402, &headers, &names),
            Challenge::Malformed {
                defects: vec![ChallengeDefect::Missing("x-flowpay-rate".into())]
            }
        );
    }

    #[test]
    fn test_every_missing_field_is_listed() {
        let names = HeaderNames::default();
        let headers: HeaderTable = [("x-payment-required", "true")].into_iter().collect();
        let Challenge::Malformed { defects } = Challenge::classify(402, &headers, &names) else {
            panic!("expected malformed challenge");
        };
        assert_eq!(
            defects,
            vec![
                ChallengeDefect::Missing("x-flowpay-mode".into()),
                ChallengeDefect::Missing("x-flowpay-recipient".into()),
                ChallengeDefect::Missing("x-flowpay-contract".into()),
            ]
        );
    }

    #[test]
    fn test_recipient_must_be_distinct_from_contract_and_token() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.insert("x-flowpay-contract", RECIPIENT.to_string());
        assert!(matches!(
            Challenge::classify(402, &headers, &names),
            Challenge::Malformed { defects } if defects == vec![ChallengeDefect::RecipientConflict(RECIPIENT)]
        ));

        let mut headers = streaming_headers();
        headers.insert("x-flowpay-token", RECIPIENT.to_string());
        assert_eq!(PaymentRequirement::parse(402, &headers, &names), None);
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.insert("x-flowpay-recipient", "alice");
        assert!(matches!(
            Challenge::classify(402, &headers, &names),
            Challenge::Malformed { defects } if matches!(defects[0], ChallengeDefect::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_zero_token_means_native() {
        let names = HeaderNames::default();
        let mut headers = streaming_headers();
        headers.insert("x-flowpay-token", Address::ZERO.to_string());
        let req = PaymentRequirement::parse(402, &headers, &names).unwrap();
        assert_eq!(req.token(), TokenKind::Native);
    }

    #[test]
    fn test_display_summary() {
        let req = PaymentRequirement::streaming(RECIPIENT, CONTRACT, "0.0001")
            .with_min_deposit("0.5")
            .with_description("Weather");
        let text = req.to_string();
        assert!(text.starts_with("streaming 0.0001/s (min deposit 0.5) to 0x1111"));
        assert!(text.ends_with("in native: Weather"));
    }
}
