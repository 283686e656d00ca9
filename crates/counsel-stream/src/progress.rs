use std::time::Instant;

/// Percent ceiling until the transport reports completion.
const MAX_PERCENT_BEFORE_COMPLETE: f64 = 95.0;

/// Render-ready progress estimate for the current session.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    /// Completion estimate in `0..=100`; stays at or below 95 until completion.
    pub percent: f64,
    /// Fragments received so far (one per delta, regardless of splitting).
    pub tokens_streamed: u64,
    /// Time left at the observed rate, in milliseconds.
    pub estimated_remaining_ms: u64,
}

/// Derives `Progress` from fragment counts and wall-clock time.
///
/// The total is a fixed guess, so percent and ETA are approximations.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    started: Instant,
    estimated_total: u64,
    tokens: u64,
    current: Progress,
}

impl ProgressTracker {
    pub fn new(estimated_total: u64) -> Self {
        Self::started_at(Instant::now(), estimated_total)
    }

    pub fn started_at(started: Instant, estimated_total: u64) -> Self {
        Self {
            started,
            estimated_total: estimated_total.max(1),
            tokens: 0,
            current: Progress::default(),
        }
    }

    pub fn record_fragment(&mut self) {
        self.tokens = self.tokens.saturating_add(1);
    }

    /// Recomputes the estimate as of `now`.
    pub fn recompute(&mut self, now: Instant) -> Progress {
        let tokens = self.tokens;
        let ratio = tokens as f64 / self.estimated_total as f64;
        let percent = (ratio * 100.0).min(MAX_PERCENT_BEFORE_COMPLETE);

        let elapsed_ms = now.saturating_duration_since(self.started).as_secs_f64() * 1000.0;
        let remaining_tokens = self.estimated_total.saturating_sub(tokens);
        let estimated_remaining_ms = if tokens == 0 || elapsed_ms <= 0.0 {
            0
        } else {
            let tokens_per_ms = tokens as f64 / elapsed_ms;
            (remaining_tokens as f64 / tokens_per_ms).round() as u64
        };

        self.current = Progress {
            // Never report less than before, even if the clock misbehaves.
            percent: percent.max(self.current.percent),
            tokens_streamed: tokens,
            estimated_remaining_ms,
        };
        self.current
    }

    /// Forces 100% once the stream has finished normally.
    pub fn complete(&mut self) -> Progress {
        self.current = Progress {
            percent: 100.0,
            tokens_streamed: self.tokens,
            estimated_remaining_ms: 0,
        };
        self.current
    }

    pub fn current(&self) -> Progress {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percent_tracks_ratio_and_caps_at_95() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::started_at(start, 10);
        for _ in 0..5 {
            tracker.record_fragment();
        }
        let half = tracker.recompute(start + Duration::from_millis(100));
        assert_eq!(half.tokens_streamed, 5);
        assert!((half.percent - 50.0).abs() < f64::EPSILON);

        for _ in 0..20 {
            tracker.record_fragment();
        }
        let over = tracker.recompute(start + Duration::from_millis(200));
        assert!((over.percent - 95.0).abs() < f64::EPSILON);
        assert_eq!(over.estimated_remaining_ms, 0);
    }

    #[test]
    fn remaining_time_uses_observed_rate() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::started_at(start, 500);
        for _ in 0..100 {
            tracker.record_fragment();
        }
        // 100 tokens in 1000 ms is 0.1 tokens/ms, so 400 left take 4000 ms.
        let progress = tracker.recompute(start + Duration::from_millis(1000));
        assert_eq!(progress.estimated_remaining_ms, 4000);
    }

    #[test]
    fn no_tokens_means_no_estimate() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::started_at(start, 500);
        let progress = tracker.recompute(start + Duration::from_millis(50));
        assert_eq!(progress, Progress::default());
    }

    #[test]
    fn complete_forces_full_percent() {
        let mut tracker = ProgressTracker::new(500);
        tracker.record_fragment();
        let done = tracker.complete();
        assert!((done.percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(done.tokens_streamed, 1);
        assert_eq!(tracker.current(), done);
    }
}
