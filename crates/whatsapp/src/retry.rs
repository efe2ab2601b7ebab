//! Reconnect backoff and per-account retry bookkeeping.

use std::{collections::HashMap, time::Duration};

use {tokio::time::Instant, tokio_util::sync::CancellationToken};

use {wazper_common::AccountId, wazper_config::SupervisorConfig};

/// Exponential backoff with a cap and a failure budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub cap: Duration,
    /// Transient failures tolerated before giving up.
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for BackoffPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            base: Duration::from_secs(cfg.backoff_base_secs),
            multiplier: cfg.backoff_multiplier.max(1),
            cap: Duration::from_secs(cfg.backoff_cap_secs),
            max_failures: cfg.max_consecutive_failures,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the reconnect that follows `failures` prior consecutive
    /// failures: `min(base * multiplier^failures, cap)`.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(failures);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }
}

#[derive(Debug, Default)]
pub struct RetryRecord {
    pub failures: u32,
    pub last_attempt: Option<Instant>,
    pub scheduled_delay: Option<Duration>,
    pub next_eligible: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl RetryRecord {
    fn cancel_pending(&mut self) -> bool {
        self.scheduled_delay = None;
        self.next_eligible = None;
        match self.cancel.take() {
            Some(token) => {
                token.cancel();
                true
            },
            None => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.failures == 0 && self.last_attempt.is_none() && self.cancel.is_none()
    }
}

/// Retry state of every account. Callers serialize access per account.
#[derive(Debug, Default)]
pub struct RetryBook {
    records: HashMap<AccountId, RetryRecord>,
}

impl RetryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, account_id: AccountId, at: Instant) {
        self.records.entry(account_id).or_default().last_attempt = Some(at);
    }

    /// Time left before another caller-initiated connect is allowed.
    pub fn cooldown_remaining(
        &self,
        account_id: AccountId,
        cooldown: Duration,
        now: Instant,
    ) -> Option<Duration> {
        let last = self.records.get(&account_id)?.last_attempt?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }

    /// Register a pending reconnect. Any previously pending one is cancelled.
    /// Returns the new failure count and the token guarding the timer.
    pub fn schedule(
        &mut self,
        account_id: AccountId,
        delay: Duration,
        now: Instant,
    ) -> (u32, CancellationToken) {
        let record = self.records.entry(account_id).or_default();
        record.cancel_pending();
        record.failures = record.failures.saturating_add(1);
        record.scheduled_delay = Some(delay);
        record.next_eligible = Some(now + delay);
        let token = CancellationToken::new();
        record.cancel = Some(token.clone());
        (record.failures, token)
    }

    /// Cancel a pending reconnect, keeping the failure count and cooldown.
    pub fn cancel(&mut self, account_id: AccountId) -> bool {
        self.records
            .get_mut(&account_id)
            .is_some_and(RetryRecord::cancel_pending)
    }

    /// Forget the pending timer once it fired, keeping the failure count.
    pub fn fired(&mut self, account_id: AccountId) {
        if let Some(record) = self.records.get_mut(&account_id) {
            record.cancel = None;
            record.scheduled_delay = None;
            record.next_eligible = None;
        }
    }

    /// Drop all retry state, including the cooldown.
    pub fn clear(&mut self, account_id: AccountId) {
        if let Some(mut record) = self.records.remove(&account_id) {
            record.cancel_pending();
        }
    }

    pub fn reset_failures(&mut self, account_id: AccountId) {
        if let Some(record) = self.records.get_mut(&account_id) {
            record.failures = 0;
        }
    }

    pub fn failures(&self, account_id: AccountId) -> u32 {
        self.records.get(&account_id).map_or(0, |r| r.failures)
    }

    pub fn get(&self, account_id: AccountId) -> Option<&RetryRecord> {
        self.records.get(&account_id)
    }

    pub fn is_pending(&self, account_id: AccountId) -> bool {
        self.records
            .get(&account_id)
            .is_some_and(|r| r.cancel.is_some())
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for record in self.records.values_mut() {
            record.cancel_pending();
        }
        self.records.retain(|_, r| !r.is_idle());
    }
}
