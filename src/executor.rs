//! Turning a payment decision into ledger calls.
//!
//! [`PaymentExecutor`] is the only component that writes to the ledger. For
//! every write it checks the on-hand balance, reserves budget with the
//! session's [`crate::spending::SpendingMonitor`], calls the ledger, and then
//! either commits the result into the session (cache, counters, balance) or
//! releases the reservation.

use alloy_primitives::U256;
use flowpay_types::amount::{DEFAULT_TOKEN_DECIMALS, MoneyAmount};
use flowpay_types::proof::{StreamId, TxHash};
use flowpay_types::requirement::{PaymentRequirement, PaymentTerms};
use std::sync::Arc;

use crate::cache::StreamRecord;
use crate::error::PaymentError;
use crate::ledger::{LedgerError, PaymentLedger, StreamMetadata, StreamRequest, TransferRequest};
use crate::session::AgentSession;

#[cfg(feature = "telemetry")]
use tracing::instrument;

pub const DEFAULT_STREAM_DURATION_SECS: u64 = 3600;
pub const DEFAULT_PER_REQUEST_STREAM_SECS: u64 = 60;

/// Deposit, rate and lifetime of a stream about to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTerms {
    pub deposit: U256,
    pub rate_per_second: U256,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPayment {
    pub record: StreamRecord,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectPayment {
    pub amount: U256,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub stream_id: StreamId,
    pub refund_amount: U256,
    pub tx_hash: TxHash,
}

#[derive(Clone)]
pub struct PaymentExecutor {
    ledger: Arc<dyn PaymentLedger>,
    token_decimals: u32,
    stream_duration_secs: u64,
    per_request_stream_secs: u64,
}

impl PaymentExecutor {
    pub fn new(ledger: Arc<dyn PaymentLedger>) -> Self {
        Self {
            ledger,
            token_decimals: DEFAULT_TOKEN_DECIMALS,
            stream_duration_secs: DEFAULT_STREAM_DURATION_SECS,
            per_request_stream_secs: DEFAULT_PER_REQUEST_STREAM_SECS,
        }
    }

    pub fn with_token_decimals(mut self, decimals: u32) -> Self {
        self.token_decimals = decimals;
        self
    }

    pub fn with_stream_duration(mut self, secs: u64) -> Self {
        self.stream_duration_secs = secs;
        self
    }

    pub fn with_per_request_stream_duration(mut self, secs: u64) -> Self {
        self.per_request_stream_secs = secs;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn PaymentLedger> {
        &self.ledger
    }

    pub fn token_decimals(&self) -> u32 {
        self.token_decimals
    }

    pub fn stream_duration_secs(&self) -> u64 {
        self.stream_duration_secs
    }

    fn to_units(&self, field: &'static str, value: &str) -> Result<U256, PaymentError> {
        MoneyAmount::parse(value)
            .and_then(|amount| amount.as_token_amount(self.token_decimals))
            .map_err(|source| PaymentError::InvalidAmount {
                field,
                value: value.to_string(),
                source,
            })
    }

    /// What a stream for `requirement` would cost.
    ///
    /// Streaming or hybrid: the advertised minimum deposit, else `rate * duration_secs`.
    /// Per-request: a single-use stream holding exactly `amount`, with no per-second rate.
    pub fn stream_terms(
        &self,
        requirement: &PaymentRequirement,
        duration_secs: u64,
    ) -> Result<StreamTerms, PaymentError> {
        match requirement.terms() {
            PaymentTerms::Streaming { rate, min_deposit }
            | PaymentTerms::Hybrid { rate, min_deposit } => {
                let rate_per_second = self.to_units("rate", rate)?;
                let deposit = match min_deposit {
                    Some(min_deposit) => self.to_units("minDeposit", min_deposit)?,
                    None => rate_per_second.saturating_mul(U256::from(duration_secs)),
                };
                Ok(StreamTerms {
                    deposit,
                    rate_per_second,
                    duration_secs,
                })
            }
            PaymentTerms::PerRequest { amount } => Ok(StreamTerms {
                deposit: self.to_units("amount", amount)?,
                rate_per_second: U256::ZERO,
                duration_secs: self.per_request_stream_secs,
            }),
        }
    }

    /// Price of one direct transfer: the per-request amount, or one second at the streaming rate.
    pub fn direct_price(&self, requirement: &PaymentRequirement) -> Result<U256, PaymentError> {
        match requirement.terms() {
            PaymentTerms::PerRequest { amount } => self.to_units("amount", amount),
            PaymentTerms::Streaming { rate, .. } | PaymentTerms::Hybrid { rate, .. } => {
                self.to_units("rate", rate)
            }
        }
    }

    async fn ensure_balance(
        &self,
        session: &AgentSession,
        required: U256,
    ) -> Result<(), PaymentError> {
        let available = match session.known_balance() {
            Some(balance) => balance,
            None => {
                let balance = self
                    .ledger
                    .get_balance(self.ledger.address())
                    .await
                    .map_err(|source| PaymentError::LedgerCallFailed {
                        context: "get_balance",
                        source,
                    })?;
                session.set_known_balance(balance);
                balance
            }
        };
        if required > available {
            return Err(PaymentError::InsufficientBalance {
                required,
                available,
                shortfall: required - available,
            });
        }
        Ok(())
    }

    /// Opens a stream for `host` and caches it.
    ///
    /// `duration_secs` defaults to the configured stream duration. The session is
    /// paused and [`PaymentError::SuspiciousActivity`] returned if streams are
    /// being opened too quickly. A paused session fails with [`PaymentError::Paused`]
    /// before anything is reserved.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "flowpay.executor.open_stream", skip_all, fields(host = %host), err)
    )]
    pub async fn open_stream(
        &self,
        session: &AgentSession,
        host: &str,
        service_url: &str,
        requirement: &PaymentRequirement,
        duration_secs: Option<u64>,
    ) -> Result<StreamPayment, PaymentError> {
        if session.is_paused() {
            return Err(PaymentError::Paused);
        }
        let terms = self.stream_terms(
            requirement,
            duration_secs.unwrap_or(self.stream_duration_secs),
        )?;
        self.ensure_balance(session, terms.deposit).await?;

        if session.monitor().check_suspicious_activity() {
            session.emergency_stop();
            return Err(PaymentError::SuspiciousActivity);
        }
        let reservation = session.monitor().check_and_record_spend(terms.deposit)?;

        let request = StreamRequest {
            recipient: requirement.recipient(),
            contract: requirement.contract(),
            token: requirement.token(),
            duration_secs: terms.duration_secs,
            deposit: terms.deposit,
            metadata: StreamMetadata {
                agent_id: session.agent_id().to_string(),
                timestamp: session.clock().now(),
                service_url: service_url.to_string(),
                purpose: requirement
                    .description()
                    .unwrap_or("API access")
                    .to_string(),
            },
        };
        let opened = match self.ledger.create_stream(request).await {
            Ok(opened) => opened,
            Err(source) => {
                session.monitor().release(reservation);
                return Err(PaymentError::LedgerCallFailed {
                    context: "create_stream",
                    source,
                });
            }
        };
        reservation.commit();

        let record = StreamRecord {
            stream_id: opened.stream_id,
            recipient: requirement.recipient(),
            rate_per_second: terms.rate_per_second,
            total_deposited: terms.deposit,
            start_time: opened.start_time,
            expires_at: opened.start_time + terms.duration_secs,
        };
        session.cache().put(host, record.clone());
        session.counters().record_signature();
        session.counters().record_payment();
        session.debit_balance(terms.deposit);
        tracing::info!(
            host,
            stream_id = %record.stream_id,
            deposit = %terms.deposit,
            duration_secs = terms.duration_secs,
            tx_hash = %opened.tx_hash,
            "Payment stream opened"
        );
        Ok(StreamPayment {
            record,
            tx_hash: opened.tx_hash,
        })
    }

    /// Pays for a single request with a one-shot transfer. Nothing is cached.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "flowpay.executor.pay_direct", skip_all, err)
    )]
    pub async fn pay_direct(
        &self,
        session: &AgentSession,
        requirement: &PaymentRequirement,
    ) -> Result<DirectPayment, PaymentError> {
        if session.is_paused() {
            return Err(PaymentError::Paused);
        }
        let amount = self.direct_price(requirement)?;
        self.ensure_balance(session, amount).await?;
        let reservation = session.monitor().check_and_record_spend(amount)?;

        let request = TransferRequest {
            recipient: requirement.recipient(),
            contract: requirement.contract(),
            token: requirement.token(),
            amount,
        };
        let tx_hash = match self.ledger.transfer(request).await {
            Ok(tx_hash) => tx_hash,
            Err(source) => {
                session.monitor().release(reservation);
                return Err(PaymentError::LedgerCallFailed {
                    context: "transfer",
                    source,
                });
            }
        };
        reservation.commit();

        session.counters().record_signature();
        session.counters().record_payment();
        session.debit_balance(amount);
        tracing::info!(amount = %amount, tx_hash = %tx_hash, "Direct payment sent");
        Ok(DirectPayment { amount, tx_hash })
    }

    /// Closes a stream and credits the refund back to the budget.
    ///
    /// A stream the ledger no longer knows or has already closed is dropped from
    /// the cache and reported as [`PaymentError::StreamNotFound`] or
    /// [`PaymentError::StreamInactive`]; see [`PaymentError::is_expected`].
    pub async fn cancel_stream(
        &self,
        session: &AgentSession,
        stream_id: &StreamId,
    ) -> Result<CancelOutcome, PaymentError> {
        let cached = session.cache().find_by_stream_id(stream_id);
        let forget = || {
            if let Some((host, _)) = &cached {
                session.cache().remove_stream(host, stream_id);
            }
        };
        let cancelled = match self.ledger.cancel_stream(stream_id).await {
            Ok(cancelled) => cancelled,
            Err(LedgerError::StreamNotFound(id)) => {
                forget();
                return Err(PaymentError::StreamNotFound(id));
            }
            Err(LedgerError::StreamInactive(id)) => {
                forget();
                return Err(PaymentError::StreamInactive(id));
            }
            Err(source) => {
                return Err(PaymentError::LedgerCallFailed {
                    context: "cancel_stream",
                    source,
                });
            }
        };
        forget();

        if let Some((_, record)) = &cached {
            let expected = record.remaining(session.clock().now());
            if expected != cancelled.refund_amount {
                tracing::debug!(
                    %stream_id,
                    expected = %expected,
                    confirmed = %cancelled.refund_amount,
                    "Ledger refund differs from local estimate"
                );
            }
        }
        session.monitor().record_refund(cancelled.refund_amount);
        session.counters().record_signature();
        session.counters().record_refund();
        session.credit_balance(cancelled.refund_amount);
        tracing::info!(
            %stream_id,
            refund = %cancelled.refund_amount,
            tx_hash = %cancelled.tx_hash,
            "Payment stream cancelled"
        );
        Ok(CancelOutcome {
            stream_id: stream_id.clone(),
            refund_amount: cancelled.refund_amount,
            tx_hash: cancelled.tx_hash,
        })
    }

    /// Cancels every live cached stream, one at a time.
    pub async fn close_all(
        &self,
        session: &AgentSession,
    ) -> Vec<(StreamId, Result<CancelOutcome, PaymentError>)> {
        let mut outcomes = Vec::new();
        for (_, record) in session.active_streams() {
            let outcome = self.cancel_stream(session, &record.stream_id).await;
            outcomes.push((record.stream_id, outcome));
        }
        outcomes
    }

    /// Whether the ledger still considers `stream_id` open.
    pub async fn is_stream_active(&self, stream_id: &StreamId) -> Result<bool, PaymentError> {
        self.ledger
            .is_stream_active(stream_id)
            .await
            .map_err(|source| PaymentError::LedgerCallFailed {
                context: "is_stream_active",
                source,
            })
    }
}
