//! Per-address dial circuit breakers
//!
//! Closed breakers let every dial through. Reaching the consecutive-failure
//! threshold opens the breaker for a cool-down; once it elapses a single trial
//! dial is let through (half-open). A successful trial closes the breaker, a
//! failed one reopens it with the cool-down doubled up to a ceiling.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Breaker rejections
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker open for {name}, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },
    #[error("circuit breaker for {name} is half-open with a trial in flight")]
    TrialInFlight { name: String },
}

/// Current state of a circuit breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls allowed
    Closed,
    /// One trial call allowed
    HalfOpen,
    /// Calls rejected until the cool-down elapses
    Open,
}

/// Configuration for circuit breaker behavior
#[derive(Clone, Debug)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// First cool-down after opening
    pub cooldown: Duration,
    /// Cool-down ceiling for repeated trial failures
    pub max_cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            cooldown: Duration::from_secs(1),
            max_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    cooldown: Duration,
    trial_in_flight: bool,
}

/// Circuit breaker for one dial target
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let cooldown = settings.cooldown;
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
                cooldown,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of now; an open breaker whose cool-down elapsed reads as
    /// half-open.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Open if inner.opened_at.elapsed() >= inner.cooldown => {
                BreakerState::HalfOpen
            }
            state => state,
        }
    }

    /// Failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to make a call. On `Ok` the caller must report the outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.elapsed();
                if elapsed < inner.cooldown {
                    return Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in: inner.cooldown - elapsed,
                    });
                }
                debug!("Circuit breaker for {} half-open", self.name);
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(BreakerError::TrialInFlight {
                        name: self.name.clone(),
                    });
                }
                inner.trial_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker for {} closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.cooldown = self.settings.cooldown;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.cooldown = (inner.cooldown * 2).min(self.settings.max_cooldown);
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                debug!(
                    "Circuit breaker for {} reopened for {:?}",
                    self.name, inner.cooldown
                );
            }
            BreakerState::Closed if inner.consecutive_failures >= self.settings.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                debug!(
                    "Circuit breaker for {} opened after {} failures",
                    self.name, inner.consecutive_failures
                );
            }
            _ => {}
        }
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BreakerError>,
    {
        self.allow()?;
        let mut pending = PendingCall {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        pending.settled = true;
        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// A call dropped before finishing. Only a half-open trial needs
    /// settling, as a failure, so the next trial is let through later.
    fn abandon(&self) {
        let trial = self.inner.lock().trial_in_flight;
        if trial {
            debug!("Circuit breaker for {}: trial abandoned", self.name);
            self.record_failure();
        }
    }
}

/// Settles a [`CircuitBreaker::call`] whose future is dropped mid-flight.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon();
        }
    }
}

/// Breakers keyed by dial address
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `address`, created closed on first use.
    pub fn get(&self, address: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(address, self.settings.clone())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(threshold: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(50),
            max_cooldown: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("n1", fast(2));
        breaker.allow().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.allow().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.consecutive_failures(), 2);
        assert!(matches!(breaker.allow(), Err(BreakerError::Open { .. })));
    }

    #[test]
    fn test_half_open_single_trial() {
        let breaker = CircuitBreaker::new("n1", fast(1));
        breaker.allow().unwrap();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.allow().unwrap();
        assert!(matches!(breaker.allow(), Err(BreakerError::TrialInFlight { .. })));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.allow().unwrap();
    }

    #[test]
    fn test_failed_trial_backs_off() {
        let breaker = CircuitBreaker::new("n1", fast(1));
        breaker.allow().unwrap();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        breaker.allow().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // Doubled cool-down: still open after the first 50ms
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow().is_err());
        std::thread::sleep(Duration::from_millis(50));
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test]
    async fn test_call_records_outcome() {
        #[derive(Debug)]
        enum DialError {
            Breaker,
            Refused,
        }
        impl From<BreakerError> for DialError {
            fn from(_: BreakerError) -> Self {
                DialError::Breaker
            }
        }

        let breaker = CircuitBreaker::new("n1", fast(1));
        let ok: Result<u32, DialError> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let failed: Result<u32, DialError> = breaker.call(|| async { Err(DialError::Refused) }).await;
        assert!(matches!(failed, Err(DialError::Refused)));

        let rejected: Result<u32, DialError> = breaker.call(|| async { Ok(1) }).await;
        assert!(matches!(rejected, Err(DialError::Breaker)));
    }

    #[tokio::test]
    async fn test_dropped_trial_is_released() {
        let breaker = CircuitBreaker::new("n1", fast(1));
        breaker.allow().unwrap();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        // Trial dial that never finishes, cancelled by the caller
        let stuck = breaker.call(|| std::future::pending::<Result<(), BreakerError>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), stuck).await;
        assert!(timed_out.is_err());

        // Counted as a failed trial: reopened, and usable once the cool-down passes
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.consecutive_failures(), 2);
        std::thread::sleep(Duration::from_millis(110));
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_call_while_closed_is_not_a_failure() {
        let breaker = CircuitBreaker::new("n1", fast(1));
        let stuck = breaker.call(|| std::future::pending::<Result<(), BreakerError>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), stuck).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_registry_per_address() {
        let registry = BreakerRegistry::new(fast(1));
        let a = registry.get("a:1");
        let again = registry.get("a:1");
        let b = registry.get("b:1");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(registry.len(), 2);

        a.allow().unwrap();
        a.record_failure();
        assert_eq!(a.state(), BreakerState::Open);
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
