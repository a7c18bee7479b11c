//! Exponential back-off with a blackout window.
//!
//! Unlike a per-attempt delay calculator, this tracker is shared by
//! concurrent attempts against the same resource (here: dialing the
//! gateway). Updates landing inside the current blackout window are
//! ignored on the assumption that they belong to an attempt that was
//! already accounted for.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct BackoffTracker {
    initial: Duration,
    /// Jitter as a fraction of the scheduled delay, `0.0..=1.0`.
    jitter: f64,
    max: Option<Duration>,
    current: Duration,
    end: Option<Instant>,
}

impl BackoffTracker {
    pub fn new(initial: Duration, jitter: f64, max: Option<Duration>) -> Self {
        Self {
            initial,
            jitter,
            max,
            current: Duration::ZERO,
            end: None,
        }
    }

    /// End of the current blackout window, if one has been scheduled.
    pub fn blackout_end(&self) -> Option<Instant> {
        self.end
    }

    /// Time remaining until the blackout window ends.
    pub fn remaining(&self) -> Duration {
        match self.end {
            Some(end) => end.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Record a failure. Past the blackout end this schedules a new
    /// window of the current delay (optionally jittered) and doubles the
    /// delay, capped at `max`. Inside the window it is a no-op.
    pub fn note_failure(&mut self) {
        let now = Instant::now();
        if self.within_blackout(now) {
            return;
        }
        if self.current.is_zero() {
            self.current = self.initial;
        }
        let mut d = self.current;
        if self.jitter > 0.0 && !d.is_zero() {
            let span = d.as_secs_f64() * self.jitter;
            d += Duration::from_secs_f64(rand::random::<f64>() * span);
        }
        self.end = Some(now + d);
        let mut next = self.current.saturating_mul(2);
        if let Some(max) = self.max {
            next = next.min(max);
        }
        self.current = next;
        trace!(delay_ms = d.as_millis() as u64, "backing off");
    }

    /// Record a success. Past the blackout end this resets the delay to
    /// its initial value; inside the window it is a no-op.
    pub fn note_success(&mut self) {
        let now = Instant::now();
        if self.within_blackout(now) {
            return;
        }
        self.current = self.initial;
    }

    fn within_blackout(&self, now: Instant) -> bool {
        matches!(self.end, Some(end) if now <= end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance_past(t: &BackoffTracker) -> Duration {
        t.remaining() + Duration::from_micros(1)
    }

    #[tokio::test(start_paused = true)]
    async fn zero_tracker_schedules_empty_windows() {
        let mut t = BackoffTracker::new(Duration::ZERO, 0.0, None);
        assert!(t.blackout_end().is_none());
        t.note_failure();
        assert_eq!(t.blackout_end(), Some(Instant::now()));
        assert_eq!(t.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn doubles_past_end_and_ignores_within() {
        let initial = Duration::from_millis(1);
        let mut t = BackoffTracker::new(initial, 0.0, None);

        t.note_failure();
        assert_eq!(t.remaining(), initial);

        // Second failure lands inside the window and changes nothing.
        let end = t.blackout_end();
        t.note_failure();
        assert_eq!(t.blackout_end(), end);

        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        assert_eq!(t.remaining(), Duration::from_millis(2));

        // Success past the end resets the delay but not the window.
        tokio::time::advance(advance_past(&t)).await;
        let end = t.blackout_end();
        t.note_success();
        assert_eq!(t.blackout_end(), end);
        t.note_failure();
        assert_eq!(t.remaining(), initial);
    }

    #[tokio::test(start_paused = true)]
    async fn success_within_window_is_ignored() {
        let mut t = BackoffTracker::new(Duration::from_millis(1), 0.0, None);
        t.note_failure();
        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        // current is now 4ms pending; a success inside the 2ms window
        // must not reset it.
        t.note_success();
        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        assert_eq!(t.remaining(), Duration::from_millis(4));
    }

    #[tokio::test(start_paused = true)]
    async fn cap_saturates_delay() {
        let initial = Duration::from_millis(1);
        let max = Duration::from_millis(3);
        let mut t = BackoffTracker::new(initial, 0.0, Some(max));

        t.note_failure();
        assert_eq!(t.remaining(), Duration::from_millis(1));
        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        assert_eq!(t.remaining(), Duration::from_millis(2));
        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        assert_eq!(t.remaining(), max);
        tokio::time::advance(advance_past(&t)).await;
        t.note_failure();
        assert_eq!(t.remaining(), max);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_stays_within_fraction() {
        let initial = Duration::from_millis(100);
        for _ in 0..20 {
            let mut t = BackoffTracker::new(initial, 0.1, None);
            t.note_failure();
            let d = t.remaining();
            assert!(d >= initial);
            assert!(d <= initial + Duration::from_millis(10));
        }
    }
}
