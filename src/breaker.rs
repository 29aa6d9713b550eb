//! # Circuit Breaker
//!
//! A three-state failure isolator wrapping every external dependency:
//! CLOSED passes calls through and counts consecutive failures, OPEN fails
//! fast until a recovery period elapses, HALF_OPEN admits exactly one probe
//! whose outcome decides the next state. Breakers are obtained from a
//! per-name registry; requesting an already-registered name returns the
//! existing instance with its original settings.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::observability::{self, EventKind};

/// Breaker lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the recovery period elapses.
    Open,
    /// One probe call is in flight; its outcome decides the next state.
    HalfOpen,
}

impl CircuitState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Per-breaker settings.
#[derive(Clone, Copy, Debug)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// How long the breaker stays open before admitting a probe.
    pub recovery: Duration,

    /// Per-operation deadline; exceeding it counts as a failure.
    pub operation_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery: Duration::from_millis(60_000),
            operation_timeout: Duration::from_millis(15_000),
        }
    }
}

/// Selects which errors count as dependency failures. The default counts
/// everything except caller cancellation.
pub type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A named three-state circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    is_failure: FailurePredicate,
    inner: Mutex<Inner>,
}

/// Point-in-time breaker state for the observability surface.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed while closed.
    pub failure_count: u32,
    /// Successful calls since creation.
    pub success_count: u64,
    /// Milliseconds since the breaker last opened, if it is not closed.
    pub open_for_ms: Option<u64>,
}

impl CircuitBreaker {
    fn new(name: impl Into<String>, settings: BreakerSettings, is_failure: FailurePredicate) -> Self {
        Self {
            name: name.into(),
            settings,
            is_failure,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker: fail fast when open, enforce the
    /// operation timeout, and account the outcome.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` when the breaker fails fast, `OperationTimeout` when
    /// `op` exceeds the configured deadline, otherwise whatever `op`
    /// returns.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probing = self.admit()?;

        let result = match tokio::time::timeout(self.settings.operation_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(self.name.clone())),
        };

        match &result {
            Ok(_) => self.on_success(probing),
            Err(err) if (self.is_failure)(err) => self.on_failure(probing),
            Err(_) => self.on_neutral(probing),
        }
        result
    }

    /// Point-in-time state.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            open_for_ms: inner
                .opened_at
                .filter(|_| inner.state != CircuitState::Closed)
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Admission decision. Returns whether this call is the half-open
    /// probe.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() < self.settings.recovery {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                drop(inner);
                self.transition(CircuitState::HalfOpen);
                Ok(true)
            }
            CircuitState::HalfOpen => {
                // Only one concurrent probe is admitted.
                if inner.probe_in_flight {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                inner.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, probing: bool) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        if probing {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            drop(inner);
            self.transition(CircuitState::Closed);
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn on_failure(&self, probing: bool) {
        let mut inner = self.inner.lock();
        if probing {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            drop(inner);
            self.transition(CircuitState::Open);
        } else if inner.state == CircuitState::Closed {
            inner.failure_count += 1;
            if inner.failure_count >= self.settings.failure_threshold {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                drop(inner);
                self.transition(CircuitState::Open);
            }
        }
    }

    /// A completed call whose error does not count as a failure (caller
    /// cancellation). A probe slot is released without deciding state.
    fn on_neutral(&self, probing: bool) {
        if probing {
            let mut inner = self.inner.lock();
            inner.probe_in_flight = false;
        }
    }

    fn transition(&self, state: CircuitState) {
        observability::metrics().record_breaker_transition(&self.name, state.as_str());
        let kind = match state {
            CircuitState::Open => EventKind::BreakerOpened,
            CircuitState::Closed => EventKind::BreakerClosed,
            CircuitState::HalfOpen => EventKind::BreakerHalfopenProbe,
        };
        observability::emit(kind, observability::object(json!({ "breaker": self.name })));
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// A per-name breaker registry. Settings bind on first creation; later
/// callers with the same name get the existing breaker.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// An empty registry, for hosts that scope breakers to a component.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<BreakerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::default)
    }

    /// The breaker registered under `name`, created with `settings` and the
    /// default failure predicate if absent.
    pub fn get_or_create(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, settings, Arc::new(Error::counts_as_breaker_failure))
    }

    /// As [`Self::get_or_create`], with an explicit failure predicate.
    pub fn get_or_create_with(
        &self, name: &str, settings: BreakerSettings, is_failure: FailurePredicate,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, settings, is_failure)))
            .clone()
    }

    /// Stats for every registered breaker.
    #[must_use]
    pub fn stats(&self) -> Vec<BreakerStats> {
        self.breakers.iter().map(|entry| entry.value().stats()).collect()
    }
}
