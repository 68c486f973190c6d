//! Spend limits and the emergency stop for one agent.
//!
//! Every payment reserves budget through [`SpendingMonitor::check_and_record_spend`]
//! before the ledger is touched. The check and the commit happen under one
//! lock, so concurrent payments can never jointly overshoot a limit. If the
//! ledger then refuses, the executor hands the [`SpendReservation`] back via
//! [`SpendingMonitor::release`].

use alloy_primitives::U256;
use flowpay_types::amount::{DEFAULT_TOKEN_DECIMALS, MoneyAmount, MoneyAmountParseError};
use flowpay_types::timestamp::UnixTimestamp;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;

pub const DAILY_WINDOW_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_RENEWALS: usize = 5;
pub const DEFAULT_RENEWAL_WINDOW_SECS: u64 = 60;

/// Budget ceilings in smallest token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendingLimits {
    pub daily_limit: U256,
    pub total_limit: U256,
}

impl SpendingLimits {
    pub fn from_amounts(
        daily: MoneyAmount,
        total: MoneyAmount,
        decimals: u32,
    ) -> Result<Self, MoneyAmountParseError> {
        Ok(Self {
            daily_limit: daily.as_token_amount(decimals)?,
            total_limit: total.as_token_amount(decimals)?,
        })
    }
}

impl Default for SpendingLimits {
    /// 100 tokens a day, 1000 overall, at 18 decimals.
    fn default() -> Self {
        let unit = U256::from(10u8).pow(U256::from(DEFAULT_TOKEN_DECIMALS));
        Self {
            daily_limit: unit * U256::from(100u16),
            total_limit: unit * U256::from(1000u16),
        }
    }
}

/// How many stream openings in a rolling window count as a runaway agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityPolicy {
    pub max_renewals: usize,
    pub window_secs: u64,
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self {
            max_renewals: DEFAULT_MAX_RENEWALS,
            window_secs: DEFAULT_RENEWAL_WINDOW_SECS,
        }
    }
}

/// Budget refusal. Amounts are smallest units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpendError {
    #[error("Daily spending limit exceeded: requested {requested}, remaining {remaining} of {limit}")]
    DailyLimitExceeded {
        requested: U256,
        remaining: U256,
        limit: U256,
    },
    #[error("Total spending limit exceeded: requested {requested}, remaining {remaining} of {limit}")]
    TotalLimitExceeded {
        requested: U256,
        remaining: U256,
        limit: U256,
    },
}

/// Budget already counted against both limits, pending the ledger's answer.
#[must_use = "a reservation for a payment that did not happen should be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct SpendReservation {
    amount: U256,
    daily_window: u64,
}

impl SpendReservation {
    pub fn amount(&self) -> U256 {
        self.amount
    }

    /// Keeps the reserved amount spent. The payment went through.
    pub fn commit(self) {
        tracing::trace!(amount = %self.amount, "Spend reservation committed");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpendingStatus {
    pub daily_spent: U256,
    pub daily_limit: U256,
    pub daily_remaining: U256,
    pub total_spent: U256,
    pub total_limit: U256,
    pub total_remaining: U256,
    pub last_reset_at: UnixTimestamp,
    pub renewals_in_window: usize,
    pub paused: bool,
}

#[derive(Debug)]
struct SpendingState {
    daily_spent: U256,
    total_spent: U256,
    last_reset_at: UnixTimestamp,
    daily_window: u64,
    renewals: VecDeque<UnixTimestamp>,
}

#[derive(Debug)]
pub struct SpendingMonitor {
    limits: SpendingLimits,
    activity: ActivityPolicy,
    state: Mutex<SpendingState>,
    paused: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl SpendingMonitor {
    pub fn new(limits: SpendingLimits, clock: Arc<dyn Clock>) -> Self {
        let state = SpendingState {
            daily_spent: U256::ZERO,
            total_spent: U256::ZERO,
            last_reset_at: clock.now(),
            daily_window: 0,
            renewals: VecDeque::new(),
        };
        Self {
            limits,
            activity: ActivityPolicy::default(),
            state: Mutex::new(state),
            paused: AtomicBool::new(false),
            clock,
        }
    }

    pub fn with_activity_policy(mut self, activity: ActivityPolicy) -> Self {
        self.activity = activity;
        self
    }

    pub fn limits(&self) -> SpendingLimits {
        self.limits
    }

    fn state(&self) -> MutexGuard<'_, SpendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn roll_daily_window(state: &mut SpendingState, now: UnixTimestamp) {
        if now.seconds_since(state.last_reset_at) >= DAILY_WINDOW_SECS {
            tracing::info!(
                previous_daily_spent = %state.daily_spent,
                "Daily spending window reset"
            );
            state.daily_spent = U256::ZERO;
            state.last_reset_at = now;
            state.daily_window += 1;
        }
    }

    /// Checks `amount` against both limits and, if it fits, counts it immediately.
    pub fn check_and_record_spend(&self, amount: U256) -> Result<SpendReservation, SpendError> {
        let now = self.clock.now();
        let mut state = self.state();
        Self::roll_daily_window(&mut state, now);

        let daily_remaining = self.limits.daily_limit.saturating_sub(state.daily_spent);
        if amount > daily_remaining {
            return Err(SpendError::DailyLimitExceeded {
                requested: amount,
                remaining: daily_remaining,
                limit: self.limits.daily_limit,
            });
        }
        let total_remaining = self.limits.total_limit.saturating_sub(state.total_spent);
        if amount > total_remaining {
            return Err(SpendError::TotalLimitExceeded {
                requested: amount,
                remaining: total_remaining,
                limit: self.limits.total_limit,
            });
        }

        state.daily_spent += amount;
        state.total_spent += amount;
        Ok(SpendReservation {
            amount,
            daily_window: state.daily_window,
        })
    }

    /// Rolls back a reservation whose payment failed.
    ///
    /// The daily counter is only touched if it has not been reset since the reservation.
    pub fn release(&self, reservation: SpendReservation) {
        let mut state = self.state();
        state.total_spent = state.total_spent.saturating_sub(reservation.amount);
        if reservation.daily_window == state.daily_window {
            state.daily_spent = state.daily_spent.saturating_sub(reservation.amount);
        }
        tracing::debug!(amount = %reservation.amount, "Released spend reservation");
    }

    /// Credits a confirmed refund against both counters, floored at zero.
    pub fn record_refund(&self, amount: U256) {
        let mut state = self.state();
        state.daily_spent = state.daily_spent.saturating_sub(amount);
        state.total_spent = state.total_spent.saturating_sub(amount);
    }

    /// Records a stream opening and reports whether the rolling window is over the limit.
    pub fn check_suspicious_activity(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state();
        state.renewals.push_back(now);
        while state
            .renewals
            .front()
            .is_some_and(|t| now.seconds_since(*t) >= self.activity.window_secs)
        {
            state.renewals.pop_front();
        }
        state.renewals.len() > self.activity.max_renewals
    }

    pub fn emergency_stop(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::warn!("Emergency stop engaged, all payments halted until resumed");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Emergency stop lifted");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SpendingStatus {
        let now = self.clock.now();
        let mut state = self.state();
        Self::roll_daily_window(&mut state, now);
        let renewals_in_window = state
            .renewals
            .iter()
            .filter(|t| now.seconds_since(**t) < self.activity.window_secs)
            .count();
        SpendingStatus {
            daily_spent: state.daily_spent,
            daily_limit: self.limits.daily_limit,
            daily_remaining: self.limits.daily_limit.saturating_sub(state.daily_spent),
            total_spent: state.total_spent,
            total_limit: self.limits.total_limit,
            total_remaining: self.limits.total_limit.saturating_sub(state.total_spent),
            last_reset_at: state.last_reset_at,
            renewals_in_window,
            paused: self.is_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor(daily: u64, total: u64) -> (Arc<ManualClock>, SpendingMonitor) {
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(1_700_000_000)));
        let limits = SpendingLimits {
            daily_limit: U256::from(daily),
            total_limit: U256::from(total),
        };
        (clock.clone(), SpendingMonitor::new(limits, clock))
    }

    #[test]
    fn test_spend_within_limits_accumulates() {
        let (_clock, monitor) = monitor(100, 1000);
        for amount in [30u64, 30, 40] {
            let reservation = monitor.check_and_record_spend(U256::from(amount)).unwrap();
            assert_eq!(reservation.amount(), U256::from(amount));
        }
        let status = monitor.status();
        assert_eq!(status.daily_spent, U256::from(100u64));
        assert_eq!(status.daily_remaining, U256::ZERO);
    }

    #[test]
    fn test_over_daily_limit_fails_without_recording() {
        let (_clock, monitor) = monitor(100, 1000);
        let _ = monitor.check_and_record_spend(U256::from(70u64)).unwrap();
        let err = monitor.check_and_record_spend(U256::from(31u64)).unwrap_err();
        assert_eq!(
            err,
            SpendError::DailyLimitExceeded {
                requested: U256::from(31u64),
                remaining: U256::from(30u64),
                limit: U256::from(100u64),
            }
        );
        assert_eq!(monitor.status().daily_spent, U256::from(70u64));
    }

    #[test]
    fn test_total_limit_is_checked() {
        let (clock, monitor) = monitor(100, 150);
        let _ = monitor.check_and_record_spend(U256::from(100u64)).unwrap();
        clock.advance(DAILY_WINDOW_SECS);
        let err = monitor.check_and_record_spend(U256::from(60u64)).unwrap_err();
        assert!(matches!(
            err,
            SpendError::TotalLimitExceeded { remaining, .. } if remaining == U256::from(50u64)
        ));
    }

    #[test]
    fn test_daily_reset_after_24_hours() {
        let (clock, monitor) = monitor(100, 1000);
        let _ = monitor.check_and_record_spend(U256::from(100u64)).unwrap();
        clock.advance(DAILY_WINDOW_SECS - 1);
        assert!(monitor.check_and_record_spend(U256::from(1u64)).is_err());
        clock.advance(1);
        let _ = monitor.check_and_record_spend(U256::from(1u64)).unwrap();
        let status = monitor.status();
        assert_eq!(status.daily_spent, U256::from(1u64));
        assert_eq!(status.total_spent, U256::from(101u64));
    }

    #[test]
    fn test_release_rolls_back_reservation() {
        let (_clock, monitor) = monitor(100, 1000);
        let reservation = monitor.check_and_record_spend(U256::from(40u64)).unwrap();
        monitor.release(reservation);
        let status = monitor.status();
        assert_eq!(status.daily_spent, U256::ZERO);
        assert_eq!(status.total_spent, U256::ZERO);
    }

    #[test]
    fn test_release_after_daily_reset_only_touches_total() {
        let (clock, monitor) = monitor(100, 1000);
        let reservation = monitor.check_and_record_spend(U256::from(40u64)).unwrap();
        clock.advance(DAILY_WINDOW_SECS);
        let _ = monitor.check_and_record_spend(U256::from(10u64)).unwrap();
        monitor.release(reservation);
        let status = monitor.status();
        assert_eq!(status.daily_spent, U256::from(10u64));
        assert_eq!(status.total_spent, U256::from(10u64));
    }

    #[test]
    fn test_refund_floors_at_zero() {
        let (_clock, monitor) = monitor(100, 1000);
        let _ = monitor.check_and_record_spend(U256::from(20u64)).unwrap();
        monitor.record_refund(U256::from(50u64));
        let status = monitor.status();
        assert_eq!(status.daily_spent, U256::ZERO);
        assert_eq!(status.total_spent, U256::ZERO);
    }

    #[test]
    fn test_sixth_renewal_in_a_minute_is_suspicious() {
        let (clock, monitor) = monitor(100, 1000);
        for _ in 0..5 {
            assert!(!monitor.check_suspicious_activity());
            clock.advance(10);
        }
        assert!(monitor.check_suspicious_activity());
    }

    #[test]
    fn test_old_renewals_leave_the_window() {
        let (clock, monitor) = monitor(100, 1000);
        for _ in 0..5 {
            assert!(!monitor.check_suspicious_activity());
        }
        clock.advance(DEFAULT_RENEWAL_WINDOW_SECS);
        assert!(!monitor.check_suspicious_activity());
        assert_eq!(monitor.status().renewals_in_window, 1);
    }

    #[test]
    fn test_emergency_stop_requires_resume() {
        let (clock, monitor) = monitor(100, 1000);
        monitor.emergency_stop();
        clock.advance(DAILY_WINDOW_SECS * 2);
        assert!(monitor.is_paused());
        assert!(monitor.status().paused);
        monitor.resume();
        assert!(!monitor.is_paused());
    }

    #[test]
    fn test_default_limits() {
        let limits = SpendingLimits::default();
        let hundred = MoneyAmount::parse("100").unwrap().as_token_amount(18).unwrap();
        assert_eq!(limits.daily_limit, hundred);
        assert_eq!(limits.total_limit, hundred * U256::from(10u8));
    }
}
