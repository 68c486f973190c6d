//! The 402 negotiation loop.
//!
//! [`NegotiationEngine::fetch`] sends a request, presenting a cached stream
//! when one is usable. On a payable 402 it picks a payment mode, pays
//! through [`PaymentExecutor`], and resends with the proof header. Transport
//! failures are retried with exponential backoff. Whatever happens, the caller
//! gets a [`FetchOutcome`] back, never an `Err`, so a batch can log the
//! failure and move on.

use bytes::Bytes;
use flowpay_types::amount::format_token_amount;
use flowpay_types::headers::{HeaderNames, HeaderTable};
use flowpay_types::proof::{PaymentProof, StreamId, TxHash};
use flowpay_types::requirement::{Challenge, OfferedMode, PaymentMode, PaymentRequirement};
use http::{Method, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::StreamRecord;
use crate::error::{FetchError, PaymentError};
use crate::executor::{CancelOutcome, PaymentExecutor};
use crate::ledger::PaymentLedger;
use crate::selector::ModeSelector;
use crate::session::AgentSession;
use crate::transport::{OutgoingRequest, ResourceTransport, TransportResponse};

#[cfg(feature = "telemetry")]
use tracing::instrument;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
/// Expected number of calls to a host when the request does not say.
pub const DEFAULT_ESTIMATED_VOLUME: u32 = 10;
pub const API_KEY_HEADER: &str = "x-api-key";

/// Transport retry budget. Attempt `n` waits `base_delay * 2^(n-1)` after failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderTable,
    pub body: Option<Bytes>,
    /// Calls the caller expects to make to this host. Feeds mode selection.
    pub estimated_volume: Option<u32>,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderTable::new(),
            body: None,
            estimated_volume: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::get(Url::parse(url)?))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_estimated_volume(mut self, volume: u32) -> Self {
        self.estimated_volume = Some(volume);
        self
    }
}

impl From<Url> for FetchRequest {
    fn from(url: Url) -> Self {
        Self::get(url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
}

impl ResponseBody {
    /// JSON when the content type says so and the body parses, text otherwise.
    fn decode(response: &TransportResponse) -> Option<Self> {
        if response.body.is_empty() {
            return None;
        }
        let is_json = response
            .content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
        if is_json {
            if let Ok(value) = serde_json::from_slice(&response.body) {
                return Some(ResponseBody::Json(value));
            }
        }
        Some(ResponseBody::Text(
            String::from_utf8_lossy(&response.body).into_owned(),
        ))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }
}

/// How the fetch was paid for, if at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMetadata {
    /// A new payment went out during this fetch.
    pub payment_made: bool,
    pub mode: Option<PaymentMode>,
    pub stream_id: Option<StreamId>,
    pub tx_hash: Option<TxHash>,
    /// Whole-token decimal string.
    pub amount: Option<String>,
    /// A cached stream was presented instead of paying.
    pub reused_stream: bool,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub success: bool,
    /// HTTP status of the last response, 0 if none arrived.
    pub status: u16,
    pub headers: HeaderTable,
    pub body: Option<ResponseBody>,
    pub payment: PaymentMetadata,
    pub error: Option<FetchError>,
    pub retry_count: u32,
}

impl FetchOutcome {
    fn new(progress: Progress, error: Option<FetchError>) -> Self {
        let mut outcome = Self {
            success: error.is_none(),
            status: 0,
            headers: HeaderTable::new(),
            body: None,
            payment: progress.payment,
            error,
            retry_count: progress.retry_count,
        };
        if let Some(response) = progress.last_response {
            outcome.status = response.status.as_u16();
            outcome.body = ResponseBody::decode(&response);
            outcome.headers = response.headers;
        }
        outcome
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    pub fn into_result(self) -> Result<Self, FetchError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// State carried across the attempt loops of one fetch.
#[derive(Debug, Default)]
struct Progress {
    last_response: Option<TransportResponse>,
    payment: PaymentMetadata,
    retry_count: u32,
}

/// Lookup key for the stream cache: host, plus the port when the URL names one.
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[derive(Clone)]
pub struct NegotiationEngine {
    transport: Arc<dyn ResourceTransport>,
    executor: PaymentExecutor,
    selector: ModeSelector,
    names: HeaderNames,
    retry: RetryPolicy,
    default_volume: u32,
    verify_stream_on_reuse: bool,
    api_key: Option<String>,
}

impl NegotiationEngine {
    pub fn new(transport: Arc<dyn ResourceTransport>, ledger: Arc<dyn PaymentLedger>) -> Self {
        Self {
            transport,
            executor: PaymentExecutor::new(ledger),
            selector: ModeSelector::default(),
            names: HeaderNames::default(),
            retry: RetryPolicy::default(),
            default_volume: DEFAULT_ESTIMATED_VOLUME,
            verify_stream_on_reuse: true,
            api_key: None,
        }
    }

    pub fn with_executor(mut self, executor: PaymentExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_selector(mut self, selector: ModeSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_header_names(mut self, names: HeaderNames) -> Self {
        self.names = names;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_volume(mut self, volume: u32) -> Self {
        self.default_volume = volume;
        self
    }

    /// Ask the ledger whether a cached stream is still open before presenting it.
    pub fn with_stream_verification(mut self, verify: bool) -> Self {
        self.verify_stream_on_reuse = verify;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn executor(&self) -> &PaymentExecutor {
        &self.executor
    }

    pub fn header_names(&self) -> &HeaderNames {
        &self.names
    }

    pub async fn fetch(
        &self,
        session: &AgentSession,
        request: impl Into<FetchRequest>,
    ) -> FetchOutcome {
        self.fetch_with_cancel(session, request, &CancellationToken::new())
            .await
    }

    /// Like [`Self::fetch`], but stops between attempts once `cancel` fires.
    ///
    /// A ledger call that has started always runs to completion.
    pub async fn fetch_with_cancel(
        &self,
        session: &AgentSession,
        request: impl Into<FetchRequest>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let request = request.into();
        let mut progress = Progress::default();
        match self.run(session, &request, cancel, &mut progress).await {
            Ok(response) => {
                progress.last_response = Some(response);
                FetchOutcome::new(progress, None)
            }
            Err(error) => {
                if error.is_expected_outcome() {
                    tracing::info!(url = %request.url, %error, "Fetch ended without the resource");
                } else {
                    tracing::warn!(url = %request.url, %error, "Fetch failed");
                }
                FetchOutcome::new(progress, Some(error))
            }
        }
    }

    pub async fn cancel_stream(
        &self,
        session: &AgentSession,
        stream_id: &StreamId,
    ) -> Result<CancelOutcome, PaymentError> {
        self.executor.cancel_stream(session, stream_id).await
    }

    pub async fn close_all(
        &self,
        session: &AgentSession,
    ) -> Vec<(StreamId, Result<CancelOutcome, PaymentError>)> {
        self.executor.close_all(session).await
    }

    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "flowpay.fetch", skip_all, fields(url = %request.url), err)
    )]
    async fn run(
        &self,
        session: &AgentSession,
        request: &FetchRequest,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<TransportResponse, FetchError> {
        if session.is_paused() {
            return Err(FetchError::Paused);
        }
        session.counters().record_request();
        let host = host_key(&request.url)
            .ok_or_else(|| FetchError::InvalidRequest(format!("{} has no host", request.url)))?;

        let mut headers = request.headers.clone();
        if let Some(api_key) = &self.api_key {
            headers.insert(API_KEY_HEADER, api_key.as_str());
        }
        let mut presented = self.reusable_stream(session, &host).await;
        if let Some(record) = &presented {
            PaymentProof::Stream(record.stream_id.clone()).apply(&mut headers, &self.names);
            progress.payment = PaymentMetadata {
                mode: Some(PaymentMode::Streaming),
                stream_id: Some(record.stream_id.clone()),
                reused_stream: true,
                ..PaymentMetadata::default()
            };
        }

        let mut negotiated = false;
        loop {
            let response = self.send(request, &headers, cancel, progress).await?;
            if response.status.is_success() {
                return Ok(response);
            }
            let status = response.status;
            let challenge = Challenge::classify(status.as_u16(), &response.headers, &self.names);
            tracing::debug!(%status, headers = ?response.headers, "Non-success response");
            progress.last_response = Some(response);

            match challenge {
                Challenge::NotAChallenge => {
                    // A server that no longer honours a stream answers a bare 402.
                    let stale = (status == StatusCode::PAYMENT_REQUIRED && !negotiated)
                        .then(|| presented.take())
                        .flatten();
                    let Some(stale) = stale else {
                        return Err(FetchError::HttpStatus { status });
                    };
                    tracing::warn!(
                        host = %host,
                        stream_id = %stale.stream_id,
                        "Cached stream refused, dropping it"
                    );
                    session.cache().remove_stream(&host, &stale.stream_id);
                    headers.remove(&self.names.stream_id);
                    progress.payment = PaymentMetadata::default();
                }
                Challenge::Malformed { defects } => {
                    return Err(FetchError::NotPayable { defects });
                }
                Challenge::UnsupportedMode { mode } => {
                    return Err(FetchError::UnsupportedMode { mode });
                }
                Challenge::Payable(_) if negotiated => {
                    return Err(FetchError::ProofRejected);
                }
                Challenge::Payable(requirement) => {
                    negotiated = true;
                    if let Some(stale) = presented.take() {
                        tracing::warn!(
                            host = %host,
                            stream_id = %stale.stream_id,
                            "Cached stream challenged, renegotiating"
                        );
                        session.cache().remove_stream(&host, &stale.stream_id);
                    }
                    let proof = self
                        .negotiate(session, &host, request, &requirement, progress)
                        .await?;
                    proof.apply(&mut headers, &self.names);
                }
            }
        }
    }

    /// The cached stream for `host`, if it is healthy enough to present.
    async fn reusable_stream(&self, session: &AgentSession, host: &str) -> Option<StreamRecord> {
        let record = session.cache().get(host)?;
        if session.cache().is_low_balance(&record) {
            tracing::warn!(host, stream_id = %record.stream_id, "Cached stream low on balance, renewing");
            session.cache().remove_stream(host, &record.stream_id);
            return None;
        }
        if self.verify_stream_on_reuse {
            match self.executor.is_stream_active(&record.stream_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(host, stream_id = %record.stream_id, "Cached stream closed on ledger, evicting");
                    session.cache().remove_stream(host, &record.stream_id);
                    return None;
                }
                Err(error) => {
                    tracing::warn!(host, %error, "Could not verify cached stream, presenting it anyway");
                }
            }
        }
        session.counters().record_reuse();
        tracing::info!(host, stream_id = %record.stream_id, "Reusing payment stream");
        Some(record)
    }

    async fn negotiate(
        &self,
        session: &AgentSession,
        host: &str,
        request: &FetchRequest,
        requirement: &PaymentRequirement,
        progress: &mut Progress,
    ) -> Result<PaymentProof, FetchError> {
        tracing::info!(host, %requirement, "Payment required");
        let lock = session.cache().negotiation_lock(host);
        let _guard = lock.lock().await;

        // Another fetch may have paid while this one waited for the lock.
        let shared = session
            .cache()
            .get(host)
            .filter(|record| record.recipient == requirement.recipient())
            .filter(|record| !session.cache().is_low_balance(record));
        if let Some(record) = shared {
            session.counters().record_reuse();
            tracing::info!(host, stream_id = %record.stream_id, "Joining stream opened concurrently");
            progress.payment = PaymentMetadata {
                mode: Some(PaymentMode::Streaming),
                stream_id: Some(record.stream_id.clone()),
                reused_stream: true,
                ..PaymentMetadata::default()
            };
            return Ok(PaymentProof::Stream(record.stream_id));
        }

        let mode = match requirement.mode() {
            OfferedMode::PerRequest => PaymentMode::PerRequest,
            OfferedMode::Streaming | OfferedMode::Hybrid => {
                let volume = request.estimated_volume.unwrap_or(self.default_volume);
                let decision = self.selector.select(volume).await;
                tracing::info!(
                    mode = %decision.mode,
                    source = ?decision.source,
                    reasoning = %decision.reasoning,
                    "Payment mode selected"
                );
                decision.mode
            }
        };

        let decimals = self.executor.token_decimals();
        match mode {
            PaymentMode::Streaming => {
                let payment = self
                    .executor
                    .open_stream(session, host, request.url.as_str(), requirement, None)
                    .await?;
                progress.payment = PaymentMetadata {
                    payment_made: true,
                    mode: Some(PaymentMode::Streaming),
                    stream_id: Some(payment.record.stream_id.clone()),
                    tx_hash: Some(payment.tx_hash),
                    amount: Some(format_token_amount(payment.record.total_deposited, decimals)),
                    reused_stream: false,
                };
                Ok(PaymentProof::Stream(payment.record.stream_id))
            }
            PaymentMode::PerRequest => {
                let payment = self.executor.pay_direct(session, requirement).await?;
                progress.payment = PaymentMetadata {
                    payment_made: true,
                    mode: Some(PaymentMode::PerRequest),
                    stream_id: None,
                    tx_hash: Some(payment.tx_hash.clone()),
                    amount: Some(format_token_amount(payment.amount, decimals)),
                    reused_stream: false,
                };
                Ok(PaymentProof::Direct(payment.tx_hash))
            }
        }
    }

    /// One attempt loop: retries transport failures with backoff, returns the first HTTP response.
    async fn send(
        &self,
        request: &FetchRequest,
        headers: &HeaderTable,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<TransportResponse, FetchError> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let outgoing = OutgoingRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: headers.clone(),
                body: request.body.clone(),
            };
            let error = match self.transport.send(outgoing).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(FetchError::Transport {
                    retry_count: progress.retry_count,
                    source: error,
                });
            }
            let delay = self.retry.delay_for(attempt);
            tracing::warn!(%error, attempt, ?delay, "Transport error, backing off");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            progress.retry_count += 1;
        }
    }
}
