use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window crawl rate tracker.
///
/// Records page completion instants and derives pages-per-minute and a
/// remaining-time estimate from the recent window. Feeds the progress
/// snapshot's `pages_per_minute` and `estimated_time_remaining` fields.
#[derive(Debug)]
pub struct RateTracker {
    /// Completion instants within the window, oldest first.
    completions: VecDeque<Instant>,
    window: Duration,
    started_at: Instant,
    total: usize,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(60))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            completions: VecDeque::new(),
            window,
            started_at: Instant::now(),
            total: 0,
        }
    }

    /// Record one completed page.
    pub fn record(&mut self) {
        self.total += 1;
        self.completions.push_back(Instant::now());
        self.prune();
    }

    fn prune(&mut self) {
        let cutoff = Instant::now().checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while self.completions.front().map_or(false, |t| *t < cutoff) {
                self.completions.pop_front();
            }
        }
    }

    /// Pages completed per minute over the recent window. Falls back to the
    /// whole-run average while less than a full window has elapsed.
    pub fn pages_per_minute(&mut self) -> f64 {
        self.prune();

        let elapsed = self.started_at.elapsed();
        let span = if elapsed < self.window { elapsed } else { self.window };
        let secs = span.as_secs_f64();
        if secs < 1.0 {
            return self.completions.len() as f64 * 60.0;
        }
        self.completions.len() as f64 * 60.0 / secs
    }

    /// Estimated seconds until `remaining` more pages complete at the
    /// current rate. `None` while the rate is still zero.
    pub fn estimated_remaining(&mut self, remaining: usize) -> Option<u64> {
        if remaining == 0 {
            return Some(0);
        }
        let ppm = self.pages_per_minute();
        if ppm <= f64::EPSILON {
            return None;
        }
        Some((remaining as f64 * 60.0 / ppm).ceil().max(0.0) as u64)
    }

    /// Total pages recorded since the tracker was created.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new()
    }
}
