//! # Observability
//!
//! Three process-wide capabilities: a structured event stream, counters and
//! histograms, and a task-local request-correlation slot. The surface is
//! push-only; nothing here ever blocks the pipeline, and emission failures
//! are swallowed and counted.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Closed set of event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A request authenticated successfully.
    AuthSuccess,
    /// A request failed authentication; attributes carry the failure kind.
    AuthFailure,
    /// The rate limiter denied an admission.
    RateLimitDenied,
    /// The shared-store backend failed and the call fell back to memory.
    RateLimitBackendDegraded,
    /// A circuit breaker transitioned to OPEN.
    BreakerOpened,
    /// A circuit breaker transitioned to CLOSED.
    BreakerClosed,
    /// A circuit breaker admitted a half-open probe.
    BreakerHalfopenProbe,
    /// A role credential verified and was cached.
    RoleVerified,
    /// A DID was resolved; attributes carry cache hit/miss.
    DidResolve,
}

impl EventKind {
    /// The stable kind string carried on the wire and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::RateLimitDenied => "rate_limit_denied",
            Self::RateLimitBackendDegraded => "rate_limit_backend_degraded",
            Self::BreakerOpened => "breaker_opened",
            Self::BreakerClosed => "breaker_closed",
            Self::BreakerHalfopenProbe => "breaker_halfopen_probe",
            Self::RoleVerified => "role_verified",
            Self::DidResolve => "did_resolve",
        }
    }
}

/// A structured event pushed to subscribers.
#[derive(Clone, Debug)]
pub struct Event {
    /// The ambient request id, when emitted inside a request scope.
    pub request_id: Option<String>,

    /// Event kind.
    pub kind: EventKind,

    /// JSON attribute bag.
    pub attributes: Map<String, Value>,

    /// Emission time.
    pub recorded_at: DateTime<Utc>,
}

/// The per-request correlation slot: propagated across suspension points,
/// never shared across tasks.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// The request's UUIDv4 id.
    pub request_id: String,

    /// The peer agent id presented with the request.
    pub agent_id: String,
}

tokio::task_local! {
    static CONTEXT: RequestContext;
}

/// Run `fut` with `context` as the ambient request context.
pub async fn with_context<F: std::future::Future>(context: RequestContext, fut: F) -> F::Output {
    CONTEXT.scope(context, fut).await
}

/// The ambient request context, if the current task has one.
#[must_use]
pub fn current_context() -> Option<RequestContext> {
    CONTEXT.try_with(Clone::clone).ok()
}

fn channel() -> &'static broadcast::Sender<Event> {
    static CHANNEL: OnceLock<broadcast::Sender<Event>> = OnceLock::new();
    CHANNEL.get_or_init(|| broadcast::channel(256).0)
}

/// Subscribe to the event stream. Slow subscribers lag and lose the oldest
/// events rather than back-pressuring emitters.
#[must_use]
pub fn subscribe() -> broadcast::Receiver<Event> {
    channel().subscribe()
}

/// Emit an event: a `tracing` record under the `phlow::event` target plus a
/// push to stream subscribers. Never fails; undeliverable events are
/// counted on [`Metrics`].
pub fn emit(kind: EventKind, attributes: Map<String, Value>) {
    let request_id = current_context().map(|ctx| ctx.request_id);

    tracing::info!(
        target: "phlow::event",
        kind = kind.as_str(),
        request_id = request_id.as_deref().unwrap_or(""),
        attributes = %serde_json::Value::Object(attributes.clone()),
    );

    let event = Event { request_id, kind, attributes, recorded_at: Utc::now() };
    if channel().send(event).is_err() {
        metrics().events_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Coerce a `json!({..})` literal into an attribute bag.
#[must_use]
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("detail".to_string(), other);
            map
        }
    }
}

/// Upper bounds (milliseconds) of the auth duration histogram buckets.
const DURATION_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Process-wide counters and histograms. All increments are atomic.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Auth attempts keyed by outcome (`success` or a failure kind).
    auth_attempts: DashMap<String, u64>,

    /// Auth duration histogram bucket counts; last slot is overflow.
    duration_buckets: [AtomicU64; 11],
    duration_sum_ms: AtomicU64,
    duration_count: AtomicU64,

    /// Rate-limit checks by outcome.
    rate_admitted: AtomicU64,
    rate_denied: AtomicU64,
    rate_degraded: AtomicU64,

    /// Breaker state transitions keyed by `name:state`.
    breaker_transitions: DashMap<String, u64>,

    /// DID resolutions by cache outcome.
    did_cache_hits: AtomicU64,
    did_cache_misses: AtomicU64,

    /// Peer role-exchange calls by outcome.
    peer_calls_ok: AtomicU64,
    peer_calls_failed: AtomicU64,

    /// Events that could not be delivered to any subscriber.
    events_dropped: AtomicU64,
}

impl Metrics {
    /// Record an auth attempt and its duration.
    pub fn record_auth(&self, outcome: &str, duration: Duration) {
        *self.auth_attempts.entry(outcome.to_string()).or_insert(0) += 1;

        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let slot = DURATION_BUCKETS_MS
            .iter()
            .position(|le| millis <= *le)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.duration_buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.duration_sum_ms.fetch_add(millis, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rate-limit admission decision.
    pub fn record_rate_limit(&self, admitted: bool) {
        if admitted {
            self.rate_admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rate_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a shared-store fallback to the in-memory backend.
    pub fn record_rate_limit_degraded(&self) {
        self.rate_degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a breaker state transition.
    pub fn record_breaker_transition(&self, name: &str, state: &str) {
        *self.breaker_transitions.entry(format!("{name}:{state}")).or_insert(0) += 1;
    }

    /// Record a DID resolution and whether the cache served it.
    pub fn record_did_resolution(&self, cache_hit: bool) {
        if cache_hit {
            self.did_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.did_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a peer role-exchange call outcome.
    pub fn record_peer_call(&self, ok: bool) {
        if ok {
            self.peer_calls_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.peer_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A point-in-time copy suitable for a host metrics endpoint.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut buckets = Vec::with_capacity(self.duration_buckets.len());
        for (idx, count) in self.duration_buckets.iter().enumerate() {
            let le = DURATION_BUCKETS_MS
                .get(idx)
                .map_or_else(|| "+inf".to_string(), ToString::to_string);
            buckets.push(HistogramBucket { le, count: count.load(Ordering::Relaxed) });
        }

        MetricsSnapshot {
            auth_attempts: self
                .auth_attempts
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            auth_duration: HistogramSnapshot {
                buckets,
                sum_ms: self.duration_sum_ms.load(Ordering::Relaxed),
                count: self.duration_count.load(Ordering::Relaxed),
            },
            rate_limit_admitted: self.rate_admitted.load(Ordering::Relaxed),
            rate_limit_denied: self.rate_denied.load(Ordering::Relaxed),
            rate_limit_degraded: self.rate_degraded.load(Ordering::Relaxed),
            breaker_transitions: self
                .breaker_transitions
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            did_cache_hits: self.did_cache_hits.load(Ordering::Relaxed),
            did_cache_misses: self.did_cache_misses.load(Ordering::Relaxed),
            peer_calls_ok: self.peer_calls_ok.load(Ordering::Relaxed),
            peer_calls_failed: self.peer_calls_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// One histogram bucket: count of observations at or below `le` ms.
#[derive(Clone, Debug, Serialize)]
pub struct HistogramBucket {
    /// Inclusive upper bound in milliseconds, or `+inf`.
    pub le: String,
    /// Observations in this bucket.
    pub count: u64,
}

/// Point-in-time histogram state.
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Buckets in ascending bound order.
    pub buckets: Vec<HistogramBucket>,
    /// Sum of all observations, milliseconds.
    pub sum_ms: u64,
    /// Total observation count.
    pub count: u64,
}

/// Point-in-time copy of every counter.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub auth_attempts: std::collections::HashMap<String, u64>,
    pub auth_duration: HistogramSnapshot,
    pub rate_limit_admitted: u64,
    pub rate_limit_denied: u64,
    pub rate_limit_degraded: u64,
    pub breaker_transitions: std::collections::HashMap<String, u64>,
    pub did_cache_hits: u64,
    pub did_cache_misses: u64,
    pub peer_calls_ok: u64,
    pub peer_calls_failed: u64,
    pub events_dropped: u64,
}

/// The process-wide metrics registry.
#[must_use]
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::default)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn context_scoping() {
        assert!(current_context().is_none());

        let ctx = RequestContext { request_id: "req-1".to_string(), agent_id: "bob".to_string() };
        let seen = with_context(ctx, async { current_context().map(|c| c.request_id) }).await;
        assert_eq!(seen.as_deref(), Some("req-1"));

        assert!(current_context().is_none(), "context should not leak out of scope");
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let mut rx = subscribe();
        emit(EventKind::RoleVerified, object(json!({"role": "admin"})));

        // The channel is process-wide; skip events from concurrent tests.
        let event = loop {
            let event = rx.recv().await.expect("should receive event");
            if event.kind == EventKind::RoleVerified {
                break event;
            }
        };
        assert_eq!(event.attributes["role"], "admin");
        assert!(event.request_id.is_none());
    }

    #[test]
    fn histogram_buckets() {
        let metrics = Metrics::default();
        metrics.record_auth("success", Duration::from_millis(3));
        metrics.record_auth("success", Duration::from_millis(80));
        metrics.record_auth("token_expired", Duration::from_secs(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.auth_attempts["success"], 2);
        assert_eq!(snapshot.auth_attempts["token_expired"], 1);
        assert_eq!(snapshot.auth_duration.count, 3);
        assert_eq!(snapshot.auth_duration.buckets[0].count, 1, "3ms lands in le=5");
        assert_eq!(snapshot.auth_duration.buckets.last().expect("buckets").count, 1, "30s overflows");
    }
}
