//! Relay counters.
//!
//! Failures on the translation and refresh paths are absorbed so the user
//! path never blocks; these counters keep them visible. One instance is
//! shared by the relay components and reported over `/metrics` and at
//! shutdown.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Remote translation requests issued
    translation_calls: AtomicUsize,

    /// Translations that failed and forwarded the original text
    translation_fallbacks: AtomicUsize,

    /// Scheduled IAM refreshes that failed (stale token kept)
    iam_refresh_failures: AtomicUsize,

    /// Conversation sessions opened
    sessions_created: AtomicUsize,

    /// Conversation sessions evicted after a backend error
    sessions_evicted: AtomicUsize,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_translation_call(&self) {
        self.translation_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_translation_fallback(&self) {
        self.translation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_iam_refresh_failure(&self) {
        self.iam_refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> MetricsReport {
        let calls = self.translation_calls.load(Ordering::Relaxed);
        let fallbacks = self.translation_fallbacks.load(Ordering::Relaxed);
        let translation_success_rate = if calls > 0 {
            (calls.saturating_sub(fallbacks) as f64 / calls as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            translation_calls: calls,
            translation_fallbacks: fallbacks,
            translation_success_rate,
            iam_refresh_failures: self.iam_refresh_failures.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`RelayMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub translation_calls: usize,
    pub translation_fallbacks: usize,
    /// Percentage (0-100) of translation calls that returned a translation
    pub translation_success_rate: f64,
    pub iam_refresh_failures: usize,
    pub sessions_created: usize,
    pub sessions_evicted: usize,
}

impl MetricsReport {
    pub fn format(&self) -> String {
        format!(
            "translations: {} calls, {} fallbacks ({:.1}% ok) | iam refresh failures: {} | sessions: {} created, {} evicted",
            self.translation_calls,
            self.translation_fallbacks,
            self.translation_success_rate,
            self.iam_refresh_failures,
            self.sessions_created,
            self.sessions_evicted
        )
    }
}
