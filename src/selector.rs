//! Streaming versus direct payment.
//!
//! Opening a stream costs a deposit transaction and, later, a cancellation.
//! Paying directly costs one transfer per call. The break-even sits around
//! three calls, which is the default [`ModeSelector`] threshold: at or above
//! it, stream; below it, pay per call. A configured [`DecisionOracle`] gets the
//! first say, bounded by a timeout, and any oracle failure lands back on the
//! threshold.

use flowpay_types::requirement::PaymentMode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::oracle::DecisionOracle;

pub const DEFAULT_STREAMING_THRESHOLD: u32 = 3;
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Oracle,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeDecision {
    pub mode: PaymentMode,
    pub reasoning: String,
    pub source: DecisionSource,
}

#[derive(Clone)]
pub struct ModeSelector {
    oracle: Option<Arc<dyn DecisionOracle>>,
    streaming_threshold: u32,
    oracle_timeout: Duration,
}

impl Default for ModeSelector {
    fn default() -> Self {
        Self {
            oracle: None,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }
}

impl ModeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn DecisionOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_streaming_threshold(mut self, threshold: u32) -> Self {
        self.streaming_threshold = threshold;
        self
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    pub fn streaming_threshold(&self) -> u32 {
        self.streaming_threshold
    }

    /// The threshold rule on its own, without consulting the oracle.
    pub fn heuristic(&self, estimated_requests: u32) -> ModeDecision {
        let threshold = self.streaming_threshold;
        let (mode, reasoning) = if estimated_requests >= threshold {
            (
                PaymentMode::Streaming,
                format!("Heuristic: volume {estimated_requests} >= {threshold}, streaming amortizes setup"),
            )
        } else {
            (
                PaymentMode::PerRequest,
                format!("Heuristic: volume {estimated_requests} < {threshold}, direct payment is cheaper"),
            )
        };
        ModeDecision {
            mode,
            reasoning,
            source: DecisionSource::Heuristic,
        }
    }

    pub async fn select(&self, estimated_requests: u32) -> ModeDecision {
        let Some(oracle) = &self.oracle else {
            return self.heuristic(estimated_requests);
        };
        let failure = match tokio::time::timeout(
            self.oracle_timeout,
            oracle.estimate(estimated_requests),
        )
        .await
        {
            Ok(Ok(estimate)) => {
                return ModeDecision {
                    mode: estimate.mode,
                    reasoning: estimate.reasoning,
                    source: DecisionSource::Oracle,
                };
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("no answer within {:?}", self.oracle_timeout),
        };
        tracing::warn!(%failure, "Decision oracle unavailable, using heuristic");
        let mut decision = self.heuristic(estimated_requests);
        decision.reasoning = format!("Fallback after oracle failure ({failure}). {}", decision.reasoning);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, OracleEstimate};

    struct FixedOracle(PaymentMode);

    #[async_trait::async_trait]
    impl DecisionOracle for FixedOracle {
        async fn estimate(&self, _: u32) -> Result<OracleEstimate, OracleError> {
            Ok(OracleEstimate {
                mode: self.0,
                reasoning: "oracle says so".into(),
            })
        }
    }

    struct BrokenOracle;

    #[async_trait::async_trait]
    impl DecisionOracle for BrokenOracle {
        async fn estimate(&self, _: u32) -> Result<OracleEstimate, OracleError> {
            Err(OracleError::InvalidAnswer("gibberish".into()))
        }
    }

    struct SlowOracle;

    #[async_trait::async_trait]
    impl DecisionOracle for SlowOracle {
        async fn estimate(&self, _: u32) -> Result<OracleEstimate, OracleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(OracleError::InvalidAnswer("too late".into()))
        }
    }

    #[tokio::test]
    async fn test_heuristic_threshold() {
        let selector = ModeSelector::new();
        assert_eq!(selector.select(3).await.mode, PaymentMode::Streaming);
        assert_eq!(selector.select(2).await.mode, PaymentMode::PerRequest);
        assert_eq!(selector.select(2).await.source, DecisionSource::Heuristic);
    }

    #[tokio::test]
    async fn test_threshold_is_configurable() {
        let selector = ModeSelector::new().with_streaming_threshold(10);
        assert_eq!(selector.select(9).await.mode, PaymentMode::PerRequest);
        assert_eq!(selector.select(10).await.mode, PaymentMode::Streaming);
    }

    #[tokio::test]
    async fn test_oracle_answer_wins() {
        let selector =
            ModeSelector::new().with_oracle(Arc::new(FixedOracle(PaymentMode::PerRequest)));
        let decision = selector.select(100).await;
        assert_eq!(decision.mode, PaymentMode::PerRequest);
        assert_eq!(decision.source, DecisionSource::Oracle);
        assert_eq!(decision.reasoning, "oracle says so");
    }

    #[tokio::test]
    async fn test_oracle_failure_falls_back() {
        let selector = ModeSelector::new().with_oracle(Arc::new(BrokenOracle));
        let decision = selector.select(10).await;
        assert_eq!(decision.mode, PaymentMode::Streaming);
        assert_eq!(decision.source, DecisionSource::Heuristic);
        assert!(decision.reasoning.starts_with("Fallback after oracle failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_oracle_times_out() {
        let selector = ModeSelector::new()
            .with_oracle(Arc::new(SlowOracle))
            .with_oracle_timeout(Duration::from_secs(5));
        let decision = selector.select(1).await;
        assert_eq!(decision.mode, PaymentMode::PerRequest);
        assert_eq!(decision.source, DecisionSource::Heuristic);
        assert!(decision.reasoning.contains("no answer within 5s"));
    }
}
