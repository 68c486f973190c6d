//! Everything one agent identity owns: its stream cache, its budget, its counters.
//!
//! An [`AgentSession`] is created by the caller and handed by reference to
//! every [`crate::engine::NegotiationEngine`] call. Nothing is process-global,
//! so several agents with separate budgets can share one engine.

use alloy_primitives::U256;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::{StreamCache, StreamRecord};
use crate::clock::{Clock, SystemClock};
use crate::spending::{ActivityPolicy, SpendingLimits, SpendingMonitor, SpendingStatus};

#[derive(Debug, Default)]
pub struct Metrics {
    requests_sent: AtomicU64,
    ledger_signatures_triggered: AtomicU64,
    payments_made: AtomicU64,
    streams_reused: AtomicU64,
    refunds_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub ledger_signatures_triggered: u64,
    pub payments_made: u64,
    pub streams_reused: u64,
    pub refunds_received: u64,
}

impl Metrics {
    pub(crate) fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_signature(&self) {
        self.ledger_signatures_triggered
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_payment(&self) {
        self.payments_made.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reuse(&self) {
        self.streams_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refund(&self) {
        self.refunds_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            ledger_signatures_triggered: self.ledger_signatures_triggered.load(Ordering::Relaxed),
            payments_made: self.payments_made.load(Ordering::Relaxed),
            streams_reused: self.streams_reused.load(Ordering::Relaxed),
            refunds_received: self.refunds_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct AgentSession {
    agent_id: String,
    clock: Arc<dyn Clock>,
    cache: StreamCache,
    monitor: SpendingMonitor,
    metrics: Metrics,
    known_balance: Mutex<Option<U256>>,
}

impl AgentSession {
    pub fn new(agent_id: impl Into<String>, limits: SpendingLimits) -> Self {
        Self::with_clock(agent_id, limits, Arc::new(SystemClock))
    }

    pub fn with_clock(
        agent_id: impl Into<String>,
        limits: SpendingLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            cache: StreamCache::new(clock.clone()),
            monitor: SpendingMonitor::new(limits, clock.clone()),
            clock,
            metrics: Metrics::default(),
            known_balance: Mutex::new(None),
        }
    }

    pub fn with_activity_policy(mut self, policy: ActivityPolicy) -> Self {
        self.monitor = self.monitor.with_activity_policy(policy);
        self
    }

    pub fn with_low_balance_percent(mut self, percent: u8) -> Self {
        self.cache = self.cache.with_low_balance_percent(percent);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    pub fn monitor(&self) -> &SpendingMonitor {
        &self.monitor
    }

    pub(crate) fn counters(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn spending(&self) -> SpendingStatus {
        self.monitor.status()
    }

    pub fn active_streams(&self) -> Vec<(String, StreamRecord)> {
        self.cache.all_active()
    }

    pub fn emergency_stop(&self) {
        self.monitor.emergency_stop();
    }

    /// Lifts an emergency stop. Never called automatically.
    pub fn resume(&self) {
        self.monitor.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.monitor.is_paused()
    }

    /// On-hand balance as last read from the ledger and adjusted by this session's payments.
    pub fn known_balance(&self) -> Option<U256> {
        *self.known_balance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_known_balance(&self, balance: U256) {
        *self.known_balance.lock().unwrap_or_else(PoisonError::into_inner) = Some(balance);
    }

    pub(crate) fn debit_balance(&self, amount: U256) {
        let mut balance = self.known_balance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(balance) = balance.as_mut() {
            *balance = balance.saturating_sub(amount);
        }
    }

    pub(crate) fn credit_balance(&self, amount: U256) {
        let mut balance = self.known_balance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(balance) = balance.as_mut() {
            *balance = balance.saturating_add(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use flowpay_types::timestamp::UnixTimestamp;

    #[test]
    fn test_sessions_are_independent() {
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(0)));
        let a = AgentSession::with_clock("a", SpendingLimits::default(), clock.clone());
        let b = AgentSession::with_clock("b", SpendingLimits::default(), clock);
        a.emergency_stop();
        a.counters().record_request();
        assert!(a.is_paused());
        assert!(!b.is_paused());
        assert_eq!(a.metrics().requests_sent, 1);
        assert_eq!(b.metrics().requests_sent, 0);
    }

    #[test]
    fn test_balance_tracking_starts_unknown() {
        let session = AgentSession::new("agent", SpendingLimits::default());
        session.debit_balance(U256::from(5u8));
        assert_eq!(session.known_balance(), None);
        session.set_known_balance(U256::from(10u8));
        session.debit_balance(U256::from(15u8));
        assert_eq!(session.known_balance(), Some(U256::ZERO));
        session.credit_balance(U256::from(3u8));
        assert_eq!(session.known_balance(), Some(U256::from(3u8)));
    }
}
