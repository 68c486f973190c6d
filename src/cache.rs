//! Per-host cache of open payment streams.
//!
//! One stream per host is reused across requests until it expires, the ledger
//! reports it closed, or its remaining balance falls under the renewal
//! threshold. An evicted record is gone for good; the next request to that
//! host negotiates from scratch.

use alloy_primitives::{Address, U256};
use dashmap::DashMap;
use flowpay_types::proof::StreamId;
use flowpay_types::timestamp::UnixTimestamp;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;

/// Remaining-balance percentage under which a stream is renewed instead of reused.
pub const DEFAULT_LOW_BALANCE_PERCENT: u8 = 10;

/// An open stream as the client understands it. Amounts are smallest units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    pub stream_id: StreamId,
    pub recipient: Address,
    pub rate_per_second: U256,
    pub total_deposited: U256,
    pub start_time: UnixTimestamp,
    pub expires_at: UnixTimestamp,
}

impl StreamRecord {
    /// Amount streamed to the recipient by `now`, capped at the deposit.
    pub fn accrued(&self, now: UnixTimestamp) -> U256 {
        let elapsed = U256::from(now.seconds_since(self.start_time));
        self.rate_per_second
            .saturating_mul(elapsed)
            .min(self.total_deposited)
    }

    /// Deposit not yet streamed, floored at zero.
    pub fn remaining(&self, now: UnixTimestamp) -> U256 {
        self.total_deposited.saturating_sub(self.accrued(now))
    }

    pub fn is_expired(&self, now: UnixTimestamp) -> bool {
        now >= self.expires_at
    }

    pub fn is_low_balance(&self, now: UnixTimestamp, threshold_percent: u8) -> bool {
        let remaining = self.remaining(now).saturating_mul(U256::from(100u8));
        let threshold = self
            .total_deposited
            .saturating_mul(U256::from(threshold_percent));
        remaining < threshold
    }
}

#[derive(Debug)]
pub struct StreamCache {
    entries: DashMap<String, StreamRecord>,
    negotiations: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    low_balance_percent: u8,
}

impl StreamCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            negotiations: DashMap::new(),
            clock,
            low_balance_percent: DEFAULT_LOW_BALANCE_PERCENT,
        }
    }

    pub fn with_low_balance_percent(mut self, percent: u8) -> Self {
        self.low_balance_percent = percent.min(100);
        self
    }

    /// The record for `host`, evicting it first if it has expired.
    pub fn get(&self, host: &str) -> Option<StreamRecord> {
        let now = self.clock.now();
        if let Some((_, expired)) = self
            .entries
            .remove_if(host, |_, record| record.is_expired(now))
        {
            tracing::debug!(host, stream_id = %expired.stream_id, "Evicted expired stream");
            return None;
        }
        self.entries.get(host).map(|entry| entry.value().clone())
    }

    pub fn put(&self, host: impl Into<String>, record: StreamRecord) {
        self.entries.insert(host.into(), record);
    }

    pub fn remove(&self, host: &str) -> Option<StreamRecord> {
        self.entries.remove(host).map(|(_, record)| record)
    }

    /// Removes the entry for `host` only if it still holds `stream_id`.
    pub fn remove_stream(&self, host: &str, stream_id: &StreamId) -> Option<StreamRecord> {
        self.entries
            .remove_if(host, |_, record| record.stream_id == *stream_id)
            .map(|(_, record)| record)
    }

    /// Snapshot of unexpired records. Expired ones are evicted on the way.
    pub fn all_active(&self) -> Vec<(String, StreamRecord)> {
        let now = self.clock.now();
        self.entries.retain(|_, record| !record.is_expired(now));
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn find_by_stream_id(&self, stream_id: &StreamId) -> Option<(String, StreamRecord)> {
        self.entries
            .iter()
            .find(|entry| entry.value().stream_id == *stream_id)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn is_low_balance(&self, record: &StreamRecord) -> bool {
        record.is_low_balance(self.clock.now(), self.low_balance_percent)
    }

    /// Lock serializing negotiation for one host, so concurrent fetches open one stream.
    pub fn negotiation_lock(&self, host: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.negotiations.entry(host.to_string()).or_default())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
