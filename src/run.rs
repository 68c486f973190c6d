//! Batch runner behind the `flowpay` binary.
//!
//! Builds an agent from [`AgentConfig`], fetches each URL in order, logs and
//! keeps going when one fails, then closes every stream it opened so unused
//! deposits come back before the process exits.

use alloy_primitives::{Address, keccak256};
use flowpay_types::amount::format_token_amount;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::{AgentConfig, ConfigError};
use crate::engine::{NegotiationEngine, PaymentMetadata};
use crate::executor::PaymentExecutor;
use crate::ledger::SimulatedLedger;
use crate::oracle::{GeminiOracle, OracleError};
use crate::selector::ModeSelector;
use crate::session::{AgentSession, MetricsSnapshot};
use crate::spending::SpendingStatus;
use crate::transport::ReqwestTransport;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Decision oracle failed: {0}")]
    Oracle(#[from] OracleError),
    #[error("No oracle configured")]
    OracleUnavailable,
    #[error("Invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Everything one configured agent needs to fetch.
pub struct Agent {
    pub engine: NegotiationEngine,
    pub session: AgentSession,
    pub ledger: Arc<SimulatedLedger>,
    oracle: Option<GeminiOracle>,
    token_decimals: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReport {
    pub url: String,
    pub success: bool,
    pub status: u16,
    pub payment: PaymentMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReport {
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub requests: Vec<RequestReport>,
    pub refunds: Vec<RefundReport>,
    pub metrics: MetricsSnapshot,
    pub spending: SpendingStatus,
    pub cancelled: bool,
}

/// Stable simulated wallet address for an agent id.
pub fn simulated_address(agent_id: &str) -> Address {
    Address::from_word(keccak256(agent_id.as_bytes()))
}

pub fn parse_urls(urls: &[String]) -> Result<Vec<Url>, RunError> {
    urls.iter()
        .map(|url| {
            Url::parse(url).map_err(|source| RunError::InvalidUrl {
                url: url.clone(),
                source,
            })
        })
        .collect()
}

impl Agent {
    pub fn from_config(config: &AgentConfig) -> Result<Self, RunError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &AgentConfig, clock: Arc<dyn Clock>) -> Result<Self, RunError> {
        let decimals = config.token_decimals();
        let limits = config.spending_limits()?;
        let initial_balance = config
            .ledger()
            .initial_balance
            .as_token_amount(decimals)
            .map_err(|source| ConfigError::InvalidAmount {
                field: "ledger.initial_balance",
                source,
            })?;
        let ledger = Arc::new(SimulatedLedger::new(
            simulated_address(config.agent_id()),
            initial_balance,
            clock.clone(),
        ));

        let negotiation = config.negotiation();
        let transport = match negotiation.request_timeout() {
            Some(timeout) => ReqwestTransport::new().with_timeout(timeout),
            None => ReqwestTransport::new(),
        };
        let executor = PaymentExecutor::new(ledger.clone())
            .with_token_decimals(decimals)
            .with_stream_duration(negotiation.stream_duration_secs)
            .with_per_request_stream_duration(negotiation.per_request_stream_secs);

        let mut selector =
            ModeSelector::new().with_streaming_threshold(negotiation.streaming_threshold);
        let mut agent_oracle = None;
        if let Some(oracle_config) = config.oracle() {
            let mut oracle = GeminiOracle::try_new(oracle_config.api_key.inner().as_str())?
                .with_timeout(oracle_config.timeout());
            if let Some(model) = &oracle_config.model {
                oracle = oracle.with_model(model.as_str());
            }
            if let Some(endpoint) = &oracle_config.endpoint {
                oracle = oracle.with_endpoint(endpoint.clone());
            }
            agent_oracle = Some(oracle.clone());
            selector = selector
                .with_oracle(Arc::new(oracle))
                .with_oracle_timeout(oracle_config.timeout());
        }

        let mut engine = NegotiationEngine::new(Arc::new(transport), ledger.clone())
            .with_executor(executor)
            .with_selector(selector)
            .with_header_names(config.header_names())
            .with_retry_policy(negotiation.retry_policy())
            .with_default_volume(negotiation.estimated_request_volume)
            .with_stream_verification(negotiation.verify_stream_on_reuse);
        if let Some(api_key) = config.api_key() {
            engine = engine.with_api_key(api_key);
        }

        let session = AgentSession::with_clock(config.agent_id(), limits, clock)
            .with_activity_policy(config.activity_policy())
            .with_low_balance_percent(negotiation.low_balance_percent);

        Ok(Self {
            engine,
            session,
            ledger,
            oracle: agent_oracle,
            token_decimals: decimals,
        })
    }

    /// Asks the configured oracle a question about this agent's current state.
    pub async fn ask(&self, query: &str) -> Result<String, RunError> {
        let oracle = self.oracle.as_ref().ok_or(RunError::OracleUnavailable)?;
        let context = serde_json::json!({
            "activeStreams": self.session.active_streams().len(),
            "metrics": self.session.metrics(),
        });
        Ok(oracle.ask(query, &context).await?)
    }

    /// The oracle's take on how efficiently this agent has paid so far.
    pub async fn analyze_spending(&self) -> Result<String, RunError> {
        let oracle = self.oracle.as_ref().ok_or(RunError::OracleUnavailable)?;
        Ok(oracle.analyze_spending(&self.session.metrics()).await?)
    }

    /// Fetches `urls` in order, then closes every open stream.
    ///
    /// Stops early once `cancel` fires; streams are closed either way.
    pub async fn run_batch(&self, urls: &[Url], cancel: &CancellationToken) -> BatchReport {
        let mut requests = Vec::with_capacity(urls.len());
        for url in urls {
            if cancel.is_cancelled() {
                tracing::info!(remaining = urls.len() - requests.len(), "Run cancelled");
                break;
            }
            let outcome = self
                .engine
                .fetch_with_cancel(&self.session, url.clone(), cancel)
                .await;
            if outcome.success {
                tracing::info!(
                    %url,
                    status = outcome.status,
                    payment_made = outcome.payment.payment_made,
                    reused_stream = outcome.payment.reused_stream,
                    "Request completed"
                );
            }
            requests.push(RequestReport {
                url: url.to_string(),
                success: outcome.success,
                status: outcome.status,
                error: outcome.error_message(),
                payment: outcome.payment,
                retry_count: outcome.retry_count,
            });
        }

        let mut refunds = Vec::new();
        for (stream_id, result) in self.engine.close_all(&self.session).await {
            let report = match result {
                Ok(cancelled) => RefundReport {
                    stream_id: stream_id.to_string(),
                    refund: Some(format_token_amount(
                        cancelled.refund_amount,
                        self.token_decimals,
                    )),
                    error: None,
                },
                Err(error) => {
                    if error.is_expected() {
                        tracing::debug!(%stream_id, %error, "Stream already closed");
                    } else {
                        tracing::warn!(%stream_id, %error, "Failed to close stream");
                    }
                    RefundReport {
                        stream_id: stream_id.to_string(),
                        refund: None,
                        error: Some(error.to_string()),
                    }
                }
            };
            refunds.push(report);
        }

        BatchReport {
            requests,
            refunds,
            metrics: self.session.metrics(),
            spending: self.session.spending(),
            cancelled: cancel.is_cancelled(),
        }
    }
}

/// Logs what a run would do without sending anything.
pub fn describe(config: &AgentConfig, urls: &[Url]) {
    let negotiation = config.negotiation();
    tracing::info!(
        agent_id = config.agent_id(),
        namespace = config.namespace(),
        daily_limit = %config.spending().daily_limit,
        total_limit = %config.spending().total_limit,
        initial_balance = %config.ledger().initial_balance,
        streaming_threshold = negotiation.streaming_threshold,
        estimated_request_volume = negotiation.estimated_request_volume,
        oracle = config.oracle().is_some(),
        "Dry run"
    );
    for url in urls {
        tracing::info!(%url, "Would fetch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use flowpay_types::timestamp::UnixTimestamp;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_simulated_address_is_stable() {
        assert_eq!(simulated_address("a"), simulated_address("a"));
        assert_ne!(simulated_address("a"), simulated_address("b"));
    }

    #[test]
    fn test_bad_url_is_reported() {
        let error = parse_urls(&["http://ok.example/".into(), "::nope".into()]).unwrap_err();
        assert!(matches!(error, RunError::InvalidUrl { url, .. } if url == "::nope"));
    }

    #[tokio::test]
    async fn test_batch_pays_once_and_refunds_on_close() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/weather"))
            .and(header_exists("x-flowpay-stream-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"temp": 21})))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/weather"))
            .and(header("x-api-key", "k"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header("x-payment-required", "true")
                    .insert_header("x-flowpay-mode", "streaming")
                    .insert_header("x-flowpay-rate", "0.0001")
                    .insert_header("x-flowpay-recipient", "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
                    .insert_header("x-flowpay-contract", "0xcccccccccccccccccccccccccccccccccccccccc"),
            )
            .mount(&server)
            .await;

        let config = AgentConfig::from_json(r#"{ "agent_id": "batch", "api_key": "k" }"#).unwrap();
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(1_700_000_000)));
        let agent = Agent::with_clock(&config, clock).unwrap();
        let url = Url::parse(&format!("{}/api/weather", server.uri())).unwrap();
        let report = agent
            .run_batch(&[url.clone(), url.clone(), url], &CancellationToken::new())
            .await;

        assert!(report.requests.iter().all(|r| r.success));
        assert!(report.requests[0].payment.payment_made);
        assert!(report.requests[2].payment.reused_stream);
        assert_eq!(report.metrics.ledger_signatures_triggered, 2);
        assert_eq!(report.refunds.len(), 1);
        assert_eq!(report.refunds[0].refund.as_deref(), Some("0.36"));
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_ask_needs_an_oracle_and_passes_state() {
        let config = AgentConfig::from_json("{}").unwrap();
        let agent = Agent::from_config(&config).unwrap();
        assert!(matches!(
            agent.ask("status?").await,
            Err(RunError::OracleUnavailable)
        ));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("requests_sent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "Idle, nothing spent." }] } }]
            })))
            .mount(&server)
            .await;
        let config = AgentConfig::from_json(&format!(
            r#"{{ "oracle": {{ "api_key": "k", "endpoint": "{}" }} }}"#,
            server.uri()
        ))
        .unwrap();
        let agent = Agent::from_config(&config).unwrap();
        assert_eq!(agent.ask("status?").await.unwrap(), "Idle, nothing spent.");
    }

    #[tokio::test]
    async fn test_cancelled_batch_sends_nothing() {
        let config = AgentConfig::from_json("{}").unwrap();
        let agent = Agent::from_config(&config).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let report = agent.run_batch(&[url], &cancel).await;
        assert!(report.requests.is_empty());
        assert!(report.cancelled);
        assert_eq!(report.metrics.requests_sent, 0);
    }
}
