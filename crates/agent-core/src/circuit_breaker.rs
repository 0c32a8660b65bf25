//! Circuit breaker guarding calls to an external collaborator
//!
//! The breaker is plain state: owners wrap it in a mutex and consult it around
//! each guarded call. State is explicit (`failure_count`, `opened_at`) so it
//! can be inspected and reported.
//!
//! Once the cooldown elapses exactly one caller may claim the trial call
//! through [`CircuitBreaker::try_acquire`]; everyone else keeps failing fast
//! until that trial is recorded. A claim that is never recorded lapses after
//! another recovery timeout.

use crate::{Error, Result};
use agent_utils::CircuitBreakerSettings;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_seconds),
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// Cooldown elapsed; the next call is a trial
    HalfOpen,
}

/// Consecutive-failure circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            failure_count: 0,
            opened_at: None,
            trial_started: None,
        }
    }

    /// Breaker name used in errors and logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consecutive failures recorded since the last success
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// When the circuit last opened, if it is not closed
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// State as observed at `now`
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) if now.duration_since(opened) >= self.config.recovery_timeout => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    /// Fail fast with `CircuitOpen` if calls are not allowed
    ///
    /// Does not claim the half-open trial; use [`try_acquire`](Self::try_acquire)
    /// right before the guarded call.
    pub fn check(&self) -> Result<()> {
        self.check_at(Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub fn check_at(&self, now: Instant) -> Result<()> {
        let blocked_since = match self.state_at(now) {
            CircuitState::Closed => return Ok(()),
            CircuitState::Open => self.opened_at,
            CircuitState::HalfOpen => self
                .trial_started
                .filter(|&started| now.duration_since(started) < self.config.recovery_timeout),
        };
        match blocked_since {
            Some(since) => Err(Error::CircuitOpen {
                name: self.name.clone(),
                retry_after: self
                    .config
                    .recovery_timeout
                    .saturating_sub(now.duration_since(since)),
            }),
            None => Ok(()),
        }
    }

    /// Admit one guarded call, claiming the trial when half-open
    ///
    /// The caller must report the outcome with `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&mut self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    /// Same as [`try_acquire`](Self::try_acquire) with an explicit clock reading
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<()> {
        self.check_at(now)?;
        if self.state_at(now) == CircuitState::HalfOpen {
            info!("Circuit '{}' admitting trial call", self.name);
            self.trial_started = Some(now);
        }
        Ok(())
    }

    /// Record a successful guarded call; closes the circuit
    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            info!("Circuit '{}' closed after successful trial", self.name);
        }
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_started = None;
    }

    /// Record a failed guarded call
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    /// Same as [`record_failure`](Self::record_failure) with an explicit clock reading
    ///
    /// A failure while half-open re-opens the circuit for another full
    /// recovery timeout.
    pub fn record_failure_at(&mut self, now: Instant) {
        self.trial_started = None;
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= self.config.failure_threshold {
            if self.opened_at.is_none() {
                warn!(
                    "Circuit '{}' opened after {} consecutive failures",
                    self.name, self.failure_count
                );
            }
            self.opened_at = Some(now);
        }
    }

    /// Serializable view of the breaker
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count,
            failure_threshold: self.config.failure_threshold,
        }
    }
}

/// Point-in-time breaker summary for health reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
}
