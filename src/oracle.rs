//! Decision oracles: something smarter than a threshold deciding stream vs direct.
//!
//! The engine only needs an answer to "given about N requests, should I open a
//! stream or pay each call?". [`DecisionOracle`] is that question. The
//! [`GeminiOracle`] asks a hosted language model through the Generative
//! Language REST API and expects a small JSON verdict back.
//!
//! The same client also answers free-form questions about the agent
//! ([`GeminiOracle::ask`]) and comments on spending efficiency
//! ([`GeminiOracle::analyze_spending`]).
//!
//! Oracles are advisory. The [`crate::selector::ModeSelector`] falls back to its
//! heuristic on any [`OracleError`].

use flowpay_types::requirement::PaymentMode;
use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

use crate::session::MetricsSnapshot;

#[cfg(feature = "telemetry")]
use tracing::instrument;

/// The oracle's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleEstimate {
    pub mode: PaymentMode,
    pub reasoning: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("Oracle answer is not a usable verdict: {0}")]
    InvalidAnswer(String),
}

#[async_trait::async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn estimate(&self, estimated_requests: u32) -> Result<OracleEstimate, OracleError>;
}

/// A [`DecisionOracle`] backed by a Gemini model.
#[derive(Clone, Debug)]
pub struct GeminiOracle {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
    gas_price_gwei: u32,
    timeout: Option<Duration>,
}

impl GeminiOracle {
    pub const DEFAULT_ENDPOINT: &'static str = "https://generativelanguage.googleapis.com/";
    pub const DEFAULT_MODEL: &'static str = "gemini-2.5-flash";
    pub const DEFAULT_GAS_PRICE_GWEI: u32 = 20;

    pub fn try_new(api_key: impl Into<String>) -> Result<Self, OracleError> {
        let endpoint = Url::parse(Self::DEFAULT_ENDPOINT).map_err(|source| OracleError::UrlParse {
            context: "Failed to parse default endpoint",
            source,
        })?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            model: Self::DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            gas_price_gwei: Self::DEFAULT_GAS_PRICE_GWEI,
            timeout: None,
        })
    }

    pub fn with_endpoint(&self, endpoint: Url) -> Self {
        let mut this = self.clone();
        this.endpoint = endpoint;
        this
    }

    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut this = self.clone();
        this.model = model.into();
        this
    }

    pub fn with_gas_price_gwei(&self, gas_price_gwei: u32) -> Self {
        let mut this = self.clone();
        this.gas_price_gwei = gas_price_gwei;
        this
    }

    /// Per-call HTTP timeout. Without one, only the selector's own deadline applies.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    fn generate_url(&self) -> Result<Url, OracleError> {
        let mut url = self
            .endpoint
            .join(&format!("v1beta/models/{}:generateContent", self.model))
            .map_err(|source| OracleError::UrlParse {
                context: "Failed to construct generateContent URL",
                source,
            })?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    fn prompt(&self, estimated_requests: u32) -> String {
        format!(
            "You are an autonomous payment agent.\n\
             Context:\n\
             - Estimated Requests: {estimated_requests}\n\
             - Current Gas Price: {} gwei\n\
             - Direct Cost per Request: ~21,000 gas\n\
             - Stream Overhead: ~150,000 gas (open) + ~50,000 gas (close)\n\
             Task: Decide the most cost-effective payment mode ('stream' or 'direct').\n\
             Return ONLY valid JSON: {{ \"mode\": \"stream\" | \"direct\", \"reasoning\": \"short explanation\" }}",
            self.gas_price_gwei
        )
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    mode: String,
    #[serde(default)]
    reasoning: String,
}

/// Parses a model answer, tolerating Markdown code fences around the JSON.
pub fn parse_verdict(text: &str) -> Result<OracleEstimate, OracleError> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let verdict: Verdict = serde_json::from_str(cleaned.trim())
        .map_err(|e| OracleError::InvalidAnswer(format!("{e}: {}", cleaned.trim())))?;
    let mode = match verdict.mode.trim().to_ascii_lowercase().as_str() {
        "stream" | "streaming" => PaymentMode::Streaming,
        "direct" | "per-request" => PaymentMode::PerRequest,
        other => return Err(OracleError::InvalidAnswer(format!("unknown mode {other:?}"))),
    };
    Ok(OracleEstimate {
        mode,
        reasoning: verdict.reasoning,
    })
}

impl GeminiOracle {
    /// Sends one prompt and returns the first text candidate.
    async fn generate(&self, prompt: String, json_answer: bool) -> Result<String, OracleError> {
        let url = self.generate_url()?;
        let mut body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        if json_answer {
            body["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }
        let mut request = self.client.post(url).json(&body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|source| OracleError::Http {
            context: "POST generateContent",
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::HttpStatus { status, body });
        }
        let answer: GenerateContentResponse =
            response.json().await.map_err(|source| OracleError::Http {
                context: "Failed to read generateContent response",
                source,
            })?;
        answer
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| OracleError::InvalidAnswer("response has no text candidate".into()))
    }

    /// Free-form question to the agent, answered with `context` serialized into the prompt.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "flowpay.oracle.ask", skip_all, err)
    )]
    pub async fn ask(&self, query: &str, context: &Value) -> Result<String, OracleError> {
        let prompt = format!(
            "System: You are FlowPay Agent, an AI payment assistant.\n\
             Context: {context}\n\
             User Query: {query}\n\
             Answer concisely as the agent."
        );
        self.generate(prompt, false).await
    }

    /// One or two sentences on whether the session's payments were efficient.
    pub async fn analyze_spending(&self, metrics: &MetricsSnapshot) -> Result<String, OracleError> {
        let prompt = format!(
            "As a financial optimization agent, analyze these payment metrics:\n\
             Total Requests: {}\n\
             Transactions Signed: {}\n\
             Provide 1-2 sentences on efficiency and whether streaming would save costs compared to individual transactions.\n\
             Assume 1 transaction = 21000 gas, 1 stream = 2 transactions (open/close).",
            metrics.requests_sent, metrics.ledger_signatures_triggered
        );
        self.generate(prompt, false).await
    }
}

#[async_trait::async_trait]
impl DecisionOracle for GeminiOracle {
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "flowpay.oracle.estimate", skip(self), err)
    )]
    async fn estimate(&self, estimated_requests: u32) -> Result<OracleEstimate, OracleError> {
        let text = self.generate(self.prompt(estimated_requests), true).await?;
        parse_verdict(&text)
    }
}
