//! HTTP/2 stream-slot reservation for a single connection.
//!
//! Every outbound request holds one reservation for the duration of its
//! round-trip. The gate bounds reservations by the effective cap: the
//! lower of the locally configured limit and the cap learned from the
//! peer. The peer's MAX_CONCURRENT_STREAMS setting is not directly
//! observable through the HTTP stack, so the learned cap starts at 1
//! (nothing is known before the first connection), rises to the
//! configured limit once the connection is verified, and shrinks when
//! the peer refuses a stream.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::PushError;

#[derive(Debug)]
struct GateState {
    /// Cap learned from peer behavior; 1 until the connection is
    /// verified.
    learned_cap: u32,
    in_use: u32,
    verified: bool,
    closed: bool,
}

impl GateState {
    fn effective_cap(&self, configured: u32) -> u32 {
        self.learned_cap.min(configured)
    }
}

/// Counted stream slots against one HTTP/2 connection.
#[derive(Debug)]
pub(crate) struct StreamGate {
    configured_cap: u32,
    state: Mutex<GateState>,
    notify: Notify,
    /// Back-reference handed to reservations so their drop can release.
    me: Weak<StreamGate>,
}

impl StreamGate {
    pub(crate) fn new(configured_cap: u32) -> Arc<Self> {
        Arc::new_cyclic(|me| StreamGate {
            configured_cap,
            state: Mutex::new(GateState {
                learned_cap: 1,
                in_use: 0,
                verified: false,
                closed: false,
            }),
            notify: Notify::new(),
            me: me.clone(),
        })
    }

    /// Reserve one stream slot, waiting for capacity if necessary.
    ///
    /// This is the primary source of back-pressure in the pipeline. A
    /// zero effective cap (connection lost, not yet verified after a
    /// teardown) keeps callers waiting until a cap increase releases
    /// them. Cancellation always wins: when `cancel` fires the caller
    /// gets [`PushError::Canceled`] no matter the capacity.
    pub(crate) async fn reserve(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<StreamReservation, PushError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                let eff = state.effective_cap(self.configured_cap);
                if eff > 0 && state.in_use < eff {
                    state.in_use += 1;
                    return Ok(StreamReservation {
                        gate: self.me.clone(),
                    });
                }
                // Arm the wakeup while still holding the lock so a
                // release between unlock and await cannot be missed.
                notified.as_mut().enable();
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = token.cancelled() => return Err(PushError::Canceled),
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Slots currently reserved.
    pub(crate) fn in_use(&self) -> u32 {
        self.state.lock().in_use
    }

    /// The connection has answered traffic; trust it up to the
    /// configured limit.
    pub(crate) fn connection_verified(&self) {
        let mut state = self.state.lock();
        let before = state.effective_cap(self.configured_cap);
        if !state.verified {
            state.verified = true;
            state.learned_cap = self.configured_cap.max(1);
        }
        let after = state.effective_cap(self.configured_cap);
        if after > before {
            trace!(cap = after, "stream cap raised");
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// The peer refused a stream: it enforces a lower concurrency limit
    /// than assumed. Shrink the learned cap to just below the load that
    /// provoked the refusal.
    pub(crate) fn note_stream_refused(&self) {
        let mut state = self.state.lock();
        let cap = state.in_use.saturating_sub(1).max(1);
        if cap < state.learned_cap {
            trace!(cap, "stream cap lowered");
            state.learned_cap = cap;
        }
    }

    /// Nudge the learned cap back toward the configured limit. Driven by
    /// the periodic metrics refresh so a cap shrunk by stream resets can
    /// recover once the peer accepts traffic again.
    pub(crate) fn refresh(&self) {
        let should_notify = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let before = state.effective_cap(self.configured_cap);
            if state.verified && state.learned_cap < self.configured_cap {
                state.learned_cap += 1;
            }
            state.effective_cap(self.configured_cap) > before
                || state.in_use < state.effective_cap(self.configured_cap)
        };
        if should_notify {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn close(&self) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::ConnectionClosed);
        }
        state.closed = true;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.in_use > 0 {
            state.in_use -= 1;
            if state.in_use < state.effective_cap(self.configured_cap) {
                drop(state);
                self.notify.notify_waiters();
            }
        }
    }
}

/// A held stream slot. Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct StreamReservation {
    gate: Weak<StreamGate>,
}

impl Drop for StreamReservation {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.upgrade() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_and_release_count() {
        let gate = StreamGate::new(2);
        gate.connection_verified();
        let a = gate.reserve(None).await.unwrap();
        let _b = gate.reserve(None).await.unwrap();
        assert_eq!(gate.in_use(), 2);
        drop(a);
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn in_use_never_exceeds_effective_cap() {
        let gate = StreamGate::new(3);
        gate.connection_verified();
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(gate.reserve(None).await.unwrap());
        }
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.reserve(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.in_use(), 3);
        held.pop();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
        assert_eq!(gate.in_use(), 3);
    }

    #[tokio::test]
    async fn unverified_connection_allows_one_stream() {
        let gate = StreamGate::new(500);
        let _first = gate.reserve(None).await.unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.reserve(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        // Verification lifts the cap and releases the waiter.
        gate.connection_verified();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn cancellation_wins_over_capacity_wait() {
        let gate = StreamGate::new(1);
        gate.connection_verified();
        let _held = gate.reserve(None).await.unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            tokio::spawn(async move { gate.reserve(Some(&token)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(PushError::Canceled)));
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test]
    async fn refused_stream_shrinks_cap() {
        let gate = StreamGate::new(10);
        gate.connection_verified();
        let _a = gate.reserve(None).await.unwrap();
        let _b = gate.reserve(None).await.unwrap();
        let _c = gate.reserve(None).await.unwrap();
        gate.note_stream_refused();
        // Cap is now 2; a fourth reservation must block.
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.reserve(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }

    #[tokio::test]
    async fn refresh_recovers_cap() {
        let gate = StreamGate::new(4);
        gate.connection_verified();
        {
            let mut st = gate.state.lock();
            st.in_use = 2;
        }
        gate.note_stream_refused();
        assert_eq!(gate.state.lock().learned_cap, 1);
        gate.refresh();
        gate.refresh();
        gate.refresh();
        assert_eq!(gate.state.lock().learned_cap, 4);
        gate.refresh();
        assert_eq!(gate.state.lock().learned_cap, 4);
    }

    #[tokio::test]
    async fn double_close_is_an_error() {
        let gate = StreamGate::new(1);
        assert!(gate.close().is_ok());
        assert!(matches!(gate.close(), Err(PushError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn release_beyond_zero_is_a_noop() {
        let gate = StreamGate::new(1);
        gate.release();
        assert_eq!(gate.in_use(), 0);
    }
}
