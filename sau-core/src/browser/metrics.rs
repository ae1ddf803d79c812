use serde::{Deserialize, Serialize};

/// Counters collected over one publishing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishMetrics {
    pub pages_opened: u64,
    pub resolver_polls: u64,
    pub elements_resolved: u64,
    pub resolve_timeouts: u64,
    pub action_failures: u64,
    pub fallback_matches: u64,
    pub phase_retries: u64,
    pub publish_attempts: u64,
    pub overlays_dismissed: u64,
}

impl PublishMetrics {
    pub fn record_page_open(&mut self) {
        self.pages_opened = self.pages_opened.saturating_add(1);
    }

    pub fn record_poll(&mut self) {
        self.resolver_polls = self.resolver_polls.saturating_add(1);
    }

    pub fn record_resolved(&mut self, preferred: bool) {
        self.elements_resolved = self.elements_resolved.saturating_add(1);
        if !preferred {
            self.fallback_matches = self.fallback_matches.saturating_add(1);
        }
    }

    pub fn record_timeout(&mut self) {
        self.resolve_timeouts = self.resolve_timeouts.saturating_add(1);
    }

    pub fn record_action_failure(&mut self) {
        self.action_failures = self.action_failures.saturating_add(1);
    }

    pub fn record_phase_retry(&mut self) {
        self.phase_retries = self.phase_retries.saturating_add(1);
    }

    pub fn record_publish_attempt(&mut self) {
        self.publish_attempts = self.publish_attempts.saturating_add(1);
    }

    pub fn record_overlay_dismissed(&mut self) {
        self.overlays_dismissed = self.overlays_dismissed.saturating_add(1);
    }

    /// Share of resolved controls that came from a non-preferred match, in percent.
    pub fn fallback_rate(&self) -> f64 {
        if self.elements_resolved == 0 {
            0.0
        } else {
            (self.fallback_matches as f64 / self.elements_resolved as f64) * 100.0
        }
    }
}
