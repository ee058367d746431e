// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Per-caller rate gate.
//
// Fixed-window counting keyed by caller identity. The window map is a
// DashMap so the check-then-increment runs under the per-key entry lock;
// two concurrent requests from the same caller can never both observe a
// stale count and both be admitted past the ceiling.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Decision type
// ---------------------------------------------------------------------------

/// Outcome of consulting the rate gate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// When rejected: remaining window time, rounded up to whole seconds.
    /// Always >= 1 for a rejection; 0 when allowed.
    pub retry_after_secs: u64,
    /// Requests left in the current window after this decision.
    pub remaining: u32,
}

// ---------------------------------------------------------------------------
// RateLimiter trait
// ---------------------------------------------------------------------------

/// Admits or rejects requests per caller identity.
///
/// Implementations must be thread-safe (Send + Sync). The relay holds
/// `Arc<dyn RateLimiter>` and calls from multiple request handlers.
/// Single-instance deployments use `FixedWindowLimiter`; distributed
/// setups would implement this against an external counter service.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, caller_id: &str) -> RateDecision;
}

// ---------------------------------------------------------------------------
// FixedWindowLimiter
// ---------------------------------------------------------------------------

/// One caller's current window.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// In-memory fixed-window limiter backed by `DashMap` for concurrent access.
pub struct FixedWindowLimiter {
    windows: DashMap<String, RateWindow>,
    window: Duration,
    ceiling: u32,
}

impl FixedWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_window(Duration::from_millis(config.window_ms), config.max_requests)
    }

    /// Create a limiter with an explicit window duration (used in tests).
    pub fn with_window(window: Duration, ceiling: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            ceiling,
        }
    }

    /// Remove windows that have rolled over. Callers that stopped
    /// requesting would otherwise pin their entries forever.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started_at) < self.window);
    }

    /// Number of tracked callers (for metrics/testing).
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no callers are tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn allow(&self, caller_id: &str) -> RateDecision {
        let now = Instant::now();

        // The entry guard holds the shard lock for this key, making the
        // whole check-then-increment atomic per caller.
        let mut entry = self
            .windows
            .entry(caller_id.to_string())
            .or_insert(RateWindow {
                started_at: now,
                count: 0,
            });

        let elapsed = now.duration_since(entry.started_at);
        if elapsed >= self.window {
            // Window rolled over: start fresh with this request counted.
            entry.started_at = now;
            entry.count = 1;
            return RateDecision {
                allowed: true,
                retry_after_secs: 0,
                remaining: self.ceiling.saturating_sub(1),
            };
        }

        if entry.count >= self.ceiling {
            let remaining_window = self.window - elapsed;
            return RateDecision {
                allowed: false,
                retry_after_secs: remaining_window.as_secs_f64().ceil().max(1.0) as u64,
                remaining: 0,
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            retry_after_secs: 0,
            remaining: self.ceiling - entry.count,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(window: Duration, ceiling: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::with_window(window, ceiling)
    }

    #[test]
    fn admits_up_to_ceiling_then_rejects() {
        let gate = limiter(Duration::from_secs(60), 5);

        for i in 0..5 {
            let decision = gate.allow("caller-a");
            assert!(decision.allowed, "request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 4 - i);
        }

        let sixth = gate.allow("caller-a");
        assert!(!sixth.allowed);
        assert!(sixth.retry_after_secs >= 1, "retry hint must be positive");
        assert!(sixth.retry_after_secs <= 60);
        assert_eq!(sixth.remaining, 0);
    }

    #[test]
    fn callers_are_independent() {
        let gate = limiter(Duration::from_secs(60), 1);

        assert!(gate.allow("caller-a").allowed);
        assert!(!gate.allow("caller-a").allowed);
        assert!(gate.allow("caller-b").allowed);
    }

    #[test]
    fn window_rollover_resets_count() {
        let gate = limiter(Duration::from_millis(30), 2);

        assert!(gate.allow("caller-a").allowed);
        assert!(gate.allow("caller-a").allowed);
        assert!(!gate.allow("caller-a").allowed);

        std::thread::sleep(Duration::from_millis(40));

        let after = gate.allow("caller-a");
        assert!(after.allowed, "request after window elapse must be admitted");
        assert_eq!(after.remaining, 1, "count must reset to 1, not accumulate");
    }

    #[test]
    fn rejection_does_not_extend_window() {
        let gate = limiter(Duration::from_millis(50), 1);

        assert!(gate.allow("caller-a").allowed);
        // Hammering while rejected must not push the window start forward.
        for _ in 0..3 {
            assert!(!gate.allow("caller-a").allowed);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(gate.allow("caller-a").allowed);
    }

    #[test]
    fn purge_removes_rolled_over_windows() {
        let gate = limiter(Duration::from_millis(10), 5);
        gate.allow("caller-a");
        gate.allow("caller-b");
        assert_eq!(gate.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        gate.purge_expired();
        assert!(gate.is_empty());
    }

    #[test]
    fn purge_keeps_live_windows() {
        let gate = limiter(Duration::from_secs(60), 5);
        gate.allow("caller-a");
        gate.purge_expired();
        assert_eq!(gate.len(), 1);
    }

    #[test]
    fn concurrent_requests_never_exceed_ceiling() {
        let gate = Arc::new(limiter(Duration::from_secs(60), 5));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.allow("caller-a").allowed)
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&allowed| allowed)
            .count();
        assert_eq!(admitted, 5);
    }
}
