//! Connection-count scaling: the policy arithmetic and the planner that
//! clamps it against configured bounds and the settle window.

use std::time::Duration;

use tokio::time::Instant;

/// How the governor grows and shrinks the streamer pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalePolicy {
    /// No scaling; the pool stays at its initial size.
    Constant,
    /// Add or remove a fixed number of streamers per attempt. Must be
    /// at least 1.
    Incremental(u32),
    /// Multiply or divide the pool size per attempt. The factor must be
    /// greater than 1.0; growth is guaranteed to add at least one and
    /// shrinking to remove at least one from a non-zero pool.
    Exponential(f32),
}

impl ScalePolicy {
    pub fn is_valid(&self) -> bool {
        match self {
            ScalePolicy::Constant => true,
            ScalePolicy::Incremental(n) => *n >= 1,
            ScalePolicy::Exponential(f) => *f > 1.0,
        }
    }

    /// Target pool size when scaling up from `n`.
    pub fn apply(&self, n: u32) -> u32 {
        match self {
            ScalePolicy::Constant => n,
            ScalePolicy::Incremental(step) => n.saturating_add(*step),
            ScalePolicy::Exponential(f) => {
                let res = (*f * n as f32) as u32;
                if res <= n {
                    n + 1
                } else {
                    res
                }
            }
        }
    }

    /// Target pool size when winding down from `n`.
    pub fn apply_inverse(&self, n: u32) -> u32 {
        match self {
            ScalePolicy::Constant => n,
            ScalePolicy::Incremental(step) => n.saturating_sub(*step),
            ScalePolicy::Exponential(f) => {
                let res = (n as f32 / *f) as u32;
                if res >= n && n > 0 {
                    n - 1
                } else {
                    res
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScaleDirection {
    Up,
    Down,
}

/// Computes how many streamers the governor may add or retire right now.
///
/// The planner owns the settle-window bookkeeping: after a scaling event
/// completes, further attempts are suppressed until `settle_period` has
/// elapsed. Pending launchers also pin the delta to zero, as does a
/// closing pipeline.
#[derive(Debug)]
pub(crate) struct ScalePlanner {
    scale: ScalePolicy,
    min_conns: u32,
    max_conns: u32,
    settle_period: Duration,
    last_scale: Option<Instant>,
}

impl ScalePlanner {
    pub(crate) fn new(
        scale: ScalePolicy,
        min_conns: u32,
        max_conns: u32,
        settle_period: Duration,
    ) -> Self {
        Self {
            scale,
            min_conns,
            max_conns,
            settle_period,
            last_scale: None,
        }
    }

    /// Record completion of a scaling event, opening a settle window.
    pub(crate) fn record_scaled(&mut self) {
        self.last_scale = Some(Instant::now());
    }

    /// Allowed change in pool size, positive for scale-up and negative
    /// for wind-down. Zero whenever scaling is currently inadmissible.
    pub(crate) fn allowed_delta(
        &self,
        direction: ScaleDirection,
        streamers: u32,
        launchers: u32,
        closing: bool,
    ) -> i64 {
        if closing || launchers > 0 {
            return 0;
        }
        if let Some(last) = self.last_scale {
            if last + self.settle_period > Instant::now() {
                return 0;
            }
        }
        let provisioned = streamers + launchers;
        let requested = match direction {
            ScaleDirection::Up => {
                if provisioned >= self.max_conns {
                    return 0;
                }
                self.scale.apply(provisioned)
            }
            ScaleDirection::Down => {
                if provisioned <= self.min_conns {
                    return 0;
                }
                self.scale.apply_inverse(provisioned)
            }
        };
        let clamped = requested.clamp(self.min_conns, self.max_conns);
        clamped as i64 - provisioned as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_is_inert() {
        assert!(ScalePolicy::Constant.is_valid());
        assert_eq!(ScalePolicy::Constant.apply(3), 3);
        assert_eq!(ScalePolicy::Constant.apply_inverse(3), 3);
    }

    #[test]
    fn incremental_steps() {
        let s = ScalePolicy::Incremental(2);
        assert!(s.is_valid());
        assert_eq!(s.apply(3), 5);
        assert_eq!(s.apply_inverse(5), 3);
        assert_eq!(s.apply_inverse(1), 0);
    }

    #[test]
    fn incremental_zero_is_invalid() {
        assert!(!ScalePolicy::Incremental(0).is_valid());
    }

    #[test]
    fn exponential_grows_by_at_least_one() {
        let s = ScalePolicy::Exponential(1.1);
        assert!(s.is_valid());
        assert_eq!(s.apply(1), 2);
        assert_eq!(s.apply(100), 110);
    }

    #[test]
    fn exponential_shrinks_by_at_least_one() {
        let s = ScalePolicy::Exponential(1.1);
        assert_eq!(s.apply_inverse(2), 1);
        assert_eq!(s.apply_inverse(1), 0);
        assert_eq!(s.apply_inverse(0), 0);
        assert_eq!(s.apply_inverse(110), 100);
    }

    #[test]
    fn exponential_doubling() {
        let s = ScalePolicy::Exponential(2.0);
        assert_eq!(s.apply(1), 2);
        assert_eq!(s.apply(2), 4);
        assert_eq!(s.apply_inverse(4), 2);
    }

    #[test]
    fn exponential_at_or_below_one_is_invalid() {
        assert!(!ScalePolicy::Exponential(1.0).is_valid());
        assert!(!ScalePolicy::Exponential(0.5).is_valid());
    }

    #[test]
    fn planner_clamps_to_max() {
        let p = ScalePlanner::new(ScalePolicy::Exponential(2.0), 1, 5, Duration::ZERO);
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 4, 0, false), 1);
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 5, 0, false), 0);
    }

    #[test]
    fn planner_clamps_to_min() {
        let p = ScalePlanner::new(ScalePolicy::Incremental(3), 2, 8, Duration::ZERO);
        assert_eq!(p.allowed_delta(ScaleDirection::Down, 4, 0, false), -2);
        assert_eq!(p.allowed_delta(ScaleDirection::Down, 2, 0, false), 0);
    }

    #[test]
    fn planner_blocks_while_launchers_pending() {
        let p = ScalePlanner::new(ScalePolicy::Exponential(2.0), 1, 8, Duration::ZERO);
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 2, 1, false), 0);
    }

    #[test]
    fn planner_blocks_while_closing() {
        let p = ScalePlanner::new(ScalePolicy::Exponential(2.0), 1, 8, Duration::ZERO);
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 2, 0, true), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn planner_honors_settle_window() {
        let settle = Duration::from_millis(500);
        let mut p = ScalePlanner::new(ScalePolicy::Exponential(2.0), 1, 64, settle);
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 2, 0, false), 2);
        p.record_scaled();
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 4, 0, false), 0);
        tokio::time::advance(Duration::from_millis(499)).await;
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 4, 0, false), 0);
        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(p.allowed_delta(ScaleDirection::Up, 4, 0, false), 4);
    }
}
