//! Communication and processing configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PushError;
use crate::response::Response;
use crate::scaling::ScalePolicy;

/// Predicate deciding whether a failed push attempt may be retried.
/// Receives the decoded response (if a round-trip completed) and the
/// error (if one occurred).
pub type RetryPolicy = Arc<dyn Fn(Option<&Response>, Option<&PushError>) -> bool + Send + Sync>;

/// Parameters governing communications with the gateway.
///
/// Two baseline sets are predefined as [`CommsConfig::FAST`] and
/// [`CommsConfig::SLOW`]; define your own if your network calls for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommsConfig {
    /// Maximum time a dial may take to connect.
    pub dial_timeout: Duration,
    /// Time limit for a full request, connection and body included.
    pub request_timeout: Duration,
    /// TCP keep-alive period. Apple recommends holding connections to
    /// the gateway open as long as possible.
    pub keep_alive: Duration,
    /// Upper bound on concurrent streams per HTTP/2 connection. The
    /// peer's advertised limit is honored when lower.
    pub max_concurrent_streams: u32,
    /// Initial back-off after a failed dial.
    pub min_dial_backoff: Duration,
    /// Cap on the dial back-off delay.
    pub max_dial_backoff: Duration,
    /// Jitter applied to dial back-off delays, as a fraction.
    pub dial_backoff_jitter: f64,
}

impl CommsConfig {
    /// Baseline for situations where long delays cannot be tolerated.
    pub const FAST: CommsConfig = CommsConfig {
        dial_timeout: Duration::from_secs(20),
        request_timeout: Duration::from_secs(30),
        keep_alive: Duration::from_secs(10 * 60 * 60),
        max_concurrent_streams: 500,
        min_dial_backoff: Duration::from_millis(100),
        max_dial_backoff: Duration::from_secs(10),
        dial_backoff_jitter: 0.1,
    };

    /// Baseline accommodating a wider range of network and gateway
    /// responsiveness scenarios.
    pub const SLOW: CommsConfig = CommsConfig {
        dial_timeout: Duration::from_secs(40),
        request_timeout: Duration::from_secs(60),
        keep_alive: Duration::from_secs(10 * 60 * 60),
        max_concurrent_streams: 500,
        min_dial_backoff: Duration::from_millis(100),
        max_dial_backoff: Duration::from_secs(10),
        dial_backoff_jitter: 0.1,
    };
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self::SLOW
    }
}

/// Parameters governing request processing flow, including automatic
/// scaling of the pipeline.
#[derive(Clone)]
pub struct ProcConfig {
    /// Maximum number of times a failed push is reattempted. Applies
    /// only to failures [`ProcConfig::retry_eval`] deems retriable.
    pub max_retries: u32,
    /// Retry eligibility predicate. `None` means never retry.
    pub retry_eval: Option<RetryPolicy>,
    /// Minimum number of concurrent gateway connections to keep open.
    pub min_conns: u32,
    /// Maximum allowed number of concurrent gateway connections.
    pub max_conns: u32,
    /// Throughput cap in notifications per second, `0` to disable. Not
    /// a strict limiter: it only prevents further scale-up once the
    /// observed rate reaches it.
    pub max_rate: u64,
    /// Throughput cap in bits per second, `0` to disable. Like
    /// `max_rate`, only gates additional scaling.
    pub max_bandwidth: u64,
    /// The manner of scaling up and winding down.
    pub scale: ScalePolicy,
    /// Minimum duration of sustained blocking before a scale-up attempt,
    /// and of sustained non-blocking before a wind-down attempt.
    pub min_sustain: Duration,
    /// Time between performance metric sampling passes.
    pub poll_interval: Duration,
    /// Time given to the pipeline to settle at the new rate after a
    /// scaling event. No new attempt is made during this window.
    pub settle_period: Duration,
    /// Whether probing the HTTP/2 layer for stream metrics is allowed
    /// at all.
    pub allow_http2_incursion: bool,
    /// Re-evaluate HTTP/2 stream metrics at every reservation instead
    /// of on a refresh timer.
    pub use_precise_http2_metrics: bool,
    /// Refresh period for the timer-driven metrics mode. Ignored when
    /// precise metrics are enabled; zero disables refresh entirely.
    pub http2_metrics_refresh_period: Duration,
}

impl ProcConfig {
    /// Absolute minimal processing: one connection, no scaling, with a
    /// metrics refresh frequent enough for proper stream accounting.
    pub const MIN_BLOCKING: ProcConfig = ProcConfig {
        max_retries: 0,
        retry_eval: None,
        min_conns: 1,
        max_conns: 1,
        max_rate: 1_000,
        max_bandwidth: 10_000_000_000,
        scale: ScalePolicy::Constant,
        min_sustain: Duration::ZERO,
        poll_interval: Duration::ZERO,
        settle_period: Duration::ZERO,
        allow_http2_incursion: true,
        use_precise_http2_metrics: false,
        http2_metrics_refresh_period: Duration::from_millis(500),
    };

    /// Virtually no limit on processing speed, with unbounded base-2
    /// exponential scaling.
    pub const UNLIMITED: ProcConfig = ProcConfig {
        max_retries: 0,
        retry_eval: None,
        min_conns: 1,
        max_conns: u32::MAX,
        max_rate: 10_000_000,
        max_bandwidth: 1_000_000_000_000,
        scale: ScalePolicy::Exponential(2.0),
        min_sustain: Duration::from_secs(2),
        poll_interval: Duration::from_millis(500),
        settle_period: Duration::from_secs(2),
        allow_http2_incursion: true,
        use_precise_http2_metrics: false,
        http2_metrics_refresh_period: Duration::from_millis(500),
    };

    /// Number of poll intervals per sustain period, rounded up. When
    /// either interval is unset the sustain threshold is unreachable and
    /// accumulator-driven scaling is effectively disabled.
    pub(crate) fn min_sustain_polls(&self) -> u32 {
        if self.min_sustain.is_zero() || self.poll_interval.is_zero() {
            return u32::MAX;
        }
        let polls = self.min_sustain.as_nanos().div_ceil(self.poll_interval.as_nanos());
        u32::try_from(polls).unwrap_or(u32::MAX)
    }

    /// `max_rate` expressed as a notification count per adjusted sustain
    /// period. A rate of 1000/s with an 11s sustain and 2s polls allows
    /// 12000 notifications: six polls are needed to cover 11s, giving a
    /// 12s adjusted period.
    pub(crate) fn rate_as_count(&self) -> u64 {
        if self.min_sustain.is_zero() || self.poll_interval.is_zero() || self.max_rate == 0 {
            return 0;
        }
        let polls = self.min_sustain_polls() as f64;
        (self.max_rate as f64 * polls * self.poll_interval.as_secs_f64()) as u64
    }

    /// `max_bandwidth` expressed in bytes per adjusted sustain period.
    pub(crate) fn bandwidth_as_size(&self) -> u64 {
        if self.min_sustain.is_zero() || self.poll_interval.is_zero() || self.max_bandwidth == 0 {
            return 0;
        }
        let polls = self.min_sustain_polls() as f64;
        ((self.max_bandwidth / 8) as f64 * polls * self.poll_interval.as_secs_f64()) as u64
    }
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self::MIN_BLOCKING
    }
}

impl fmt::Debug for ProcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcConfig")
            .field("max_retries", &self.max_retries)
            .field("retry_eval", &self.retry_eval.as_ref().map(|_| "<fn>"))
            .field("min_conns", &self.min_conns)
            .field("max_conns", &self.max_conns)
            .field("max_rate", &self.max_rate)
            .field("max_bandwidth", &self.max_bandwidth)
            .field("scale", &self.scale)
            .field("min_sustain", &self.min_sustain)
            .field("poll_interval", &self.poll_interval)
            .field("settle_period", &self.settle_period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_preset() {
        let cfg = CommsConfig::FAST;
        assert_eq!(cfg.dial_timeout, Duration::from_secs(20));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.keep_alive, Duration::from_secs(36_000));
        assert_eq!(cfg.max_concurrent_streams, 500);
    }

    #[test]
    fn slow_preset_is_default() {
        let cfg = CommsConfig::default();
        assert_eq!(cfg.dial_timeout, Duration::from_secs(40));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn comms_serde_roundtrip() {
        let cfg = CommsConfig::FAST;
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CommsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dial_timeout, cfg.dial_timeout);
        assert_eq!(back.max_concurrent_streams, cfg.max_concurrent_streams);
    }

    #[test]
    fn sustain_polls_round_up() {
        let cfg = ProcConfig {
            min_sustain: Duration::from_secs(11),
            poll_interval: Duration::from_secs(2),
            ..ProcConfig::MIN_BLOCKING
        };
        assert_eq!(cfg.min_sustain_polls(), 6);

        let exact = ProcConfig {
            min_sustain: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            ..ProcConfig::MIN_BLOCKING
        };
        assert_eq!(exact.min_sustain_polls(), 5);
    }

    #[test]
    fn sustain_polls_unreachable_when_unset() {
        assert_eq!(ProcConfig::MIN_BLOCKING.min_sustain_polls(), u32::MAX);
        let cfg = ProcConfig {
            min_sustain: Duration::from_secs(1),
            poll_interval: Duration::ZERO,
            ..ProcConfig::MIN_BLOCKING
        };
        assert_eq!(cfg.min_sustain_polls(), u32::MAX);
    }

    #[test]
    fn rate_as_count_uses_adjusted_period() {
        let cfg = ProcConfig {
            max_rate: 1_000,
            min_sustain: Duration::from_secs(11),
            poll_interval: Duration::from_secs(2),
            ..ProcConfig::MIN_BLOCKING
        };
        assert_eq!(cfg.rate_as_count(), 12_000);
    }

    #[test]
    fn bandwidth_as_size_converts_bits() {
        let cfg = ProcConfig {
            max_bandwidth: 8_000,
            min_sustain: Duration::from_secs(4),
            poll_interval: Duration::from_secs(2),
            ..ProcConfig::MIN_BLOCKING
        };
        // 1000 bytes/s over an adjusted 4s period.
        assert_eq!(cfg.bandwidth_as_size(), 4_000);
    }

    #[test]
    fn caps_disabled_when_zero() {
        let cfg = ProcConfig {
            max_rate: 0,
            max_bandwidth: 0,
            min_sustain: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            ..ProcConfig::MIN_BLOCKING
        };
        assert_eq!(cfg.rate_as_count(), 0);
        assert_eq!(cfg.bandwidth_as_size(), 0);
    }
}
