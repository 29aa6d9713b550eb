//! In-memory sliding-window backend: a map from key to a bounded queue of
//! admission timestamps, each bucket mutated under its own critical section.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::Admission;

/// Admissions between opportunistic sweeps of long-idle buckets.
const SWEEP_INTERVAL: u64 = 256;

/// The process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: DashMap<String, VecDeque<i64>>,
    admissions: AtomicU64,
}

impl MemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide admission for `key` at `now` (Unix milliseconds).
    ///
    /// The bucket's shard lock is the per-key critical section: concurrent
    /// admissions against one key serialize here, so the count can never
    /// exceed `max`.
    pub fn admit(&self, key: &str, now: i64, max: u32, window_ms: i64) -> Admission {
        // Sweep before taking the bucket entry, never while holding it.
        if self.admissions.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now, window_ms);
        }

        let mut bucket = self.buckets.entry(key.to_string()).or_default();
        while let Some(&oldest) = bucket.front() {
            if oldest < now - window_ms {
                bucket.pop_front();
            } else {
                break;
            }
        }

        let count = u32::try_from(bucket.len()).unwrap_or(u32::MAX);
        if count < max {
            bucket.push_back(now);
            Admission::Admitted { remaining: max - count - 1 }
        } else {
            let reset_at = bucket.front().map_or(now, |&oldest| oldest + window_ms);
            Admission::Denied { remaining: 0, reset_at }
        }
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the backend holds no buckets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evict buckets whose newest admission is older than two windows.
    fn sweep(&self, now: i64, window_ms: i64) {
        self.buckets
            .retain(|_, bucket| bucket.back().is_some_and(|&newest| newest >= now - 2 * window_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 60_000;

    #[test]
    fn sliding_window() {
        let backend = MemoryBackend::new();
        let t = 1_000_000;

        // N admissions inside [t, t+W) succeed; the (N+1)th is denied.
        for i in 0..3 {
            let admission = backend.admit("k", t + i * 1000, 3, WINDOW);
            assert!(matches!(admission, Admission::Admitted { .. }), "admission {i}");
        }
        let denied = backend.admit("k", t + 3000, 3, WINDOW);
        assert_eq!(denied, Admission::Denied { remaining: 0, reset_at: t + WINDOW });

        // Once the oldest timestamp ages out, a slot frees up.
        let admission = backend.admit("k", t + WINDOW + 1, 3, WINDOW);
        assert!(matches!(admission, Admission::Admitted { .. }));
    }

    #[test]
    fn remaining_counts_down() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.admit("k", 0, 2, WINDOW), Admission::Admitted { remaining: 1 });
        assert_eq!(backend.admit("k", 1, 2, WINDOW), Admission::Admitted { remaining: 0 });
        assert!(matches!(backend.admit("k", 2, 2, WINDOW), Admission::Denied { .. }));
    }

    #[test]
    fn concurrent_admissions_never_exceed_max() {
        let backend = MemoryBackend::new();
        let max = 10u32;
        let admitted = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for i in 0..50 {
                        if matches!(
                            backend.admit("shared", 1_000 + i, max, WINDOW),
                            Admission::Admitted { .. }
                        ) {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), u64::from(max));
        let bucket = backend.buckets.get("shared").expect("bucket exists");
        assert_eq!(bucket.len(), max as usize, "counter never exceeds max");
    }

    #[test]
    fn sweep_evicts_idle_buckets() {
        let backend = MemoryBackend::new();
        backend.admit("stale", 0, 3, WINDOW);
        backend.admit("fresh", 3 * WINDOW, 3, WINDOW);

        backend.sweep(3 * WINDOW, WINDOW);
        assert_eq!(backend.len(), 1);
        assert!(backend.buckets.get("stale").is_none(), "idle bucket should be evicted");
    }
}
