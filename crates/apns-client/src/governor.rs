//! The governor: sole authority over how many streamers run.
//!
//! It samples the pipeline's blocking counters every poll interval,
//! scales the streamer pool up when submissions block while deliveries
//! do not, winds it down when submissions stop blocking, respawns
//! streamers whose connections went bad, and orchestrates both shutdown
//! flavors.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::backoff::BackoffTracker;
use crate::client::PipelineShared;
use crate::counters::{DrainCounter, MovingAccumulator, TickTockCounter, WaitCounter};
use crate::request::Request;
use crate::scaling::{ScaleDirection, ScalePlanner};
use crate::streamer::{SharedQueue, Streamer, StreamerExit, StreamerHandle, StreamerSignal};

/// Inbound buffering on the retry channel, and the size of each
/// forwarding sub-buffer. Buffered forwarding bounds task count: a burst
/// of N retries costs N/500 helper tasks instead of N sender tasks.
const RETRY_INBOUND_BUFFER: usize = 100;
const FORWARD_BUFFER: usize = 500;

struct LauncherExit {
    id: u32,
    /// `None` when the launcher was aborted before attempting a start.
    result: Option<Result<StreamerHandle, crate::errors::PushError>>,
}

pub(crate) struct Governor {
    label: String,
    shared: Arc<PipelineShared>,
    /// Hard-stop signal from the client.
    ctl: CancellationToken,
    /// Cancelled when the pipeline has fully unwound.
    done: CancellationToken,
    input: SharedQueue,

    min_sust: u32,
    in_ctr: WaitCounter,
    out_ctr: WaitCounter,
    count_acc: Option<MovingAccumulator>,
    size_acc: Option<MovingAccumulator>,
    max_count: u64,
    max_size: u64,

    /// Client-side counters: waits on the outbound channel and the
    /// count of submitted requests.
    client_wait_ctr: Arc<TickTockCounter>,
    client_rate_ctr: Arc<DrainCounter>,

    /// Streamers push retries here; the forwarder moves them onward.
    retry_in_tx: Option<mpsc::Sender<Request>>,
    retry_in_rx: Option<mpsc::Receiver<Request>>,
    /// The client's retry channel, read by the submitter.
    retry_out: mpsc::Sender<Request>,

    streamers: HashMap<u32, StreamerHandle>,
    launchers: HashMap<u32, ()>,
    next_wid: u32,

    w_exit_tx: mpsc::UnboundedSender<StreamerExit>,
    w_exit_rx: mpsc::UnboundedReceiver<StreamerExit>,
    l_exit_tx: mpsc::UnboundedSender<LauncherExit>,
    l_exit_rx: mpsc::UnboundedReceiver<LauncherExit>,

    planner: ScalePlanner,
    dial_backoff: BackoffTracker,
    is_closing: bool,
}

impl Governor {
    pub(crate) fn new(
        shared: Arc<PipelineShared>,
        input: SharedQueue,
        retry_out: mpsc::Sender<Request>,
        client_wait_ctr: Arc<TickTockCounter>,
        client_rate_ctr: Arc<DrainCounter>,
        ctl: CancellationToken,
        done: CancellationToken,
    ) -> Self {
        let label = format!("{}-Governor", shared.id);
        let proc = &shared.proc;
        let min_sust = proc.min_sustain_polls();
        let planner = ScalePlanner::new(
            proc.scale,
            proc.min_conns,
            proc.max_conns,
            proc.settle_period,
        );
        let comms = &shared.comms;
        let dial_backoff = BackoffTracker::new(
            comms.min_dial_backoff,
            comms.dial_backoff_jitter,
            Some(comms.max_dial_backoff),
        );
        let (retry_in_tx, retry_in_rx) = mpsc::channel(RETRY_INBOUND_BUFFER);
        let (w_exit_tx, w_exit_rx) = mpsc::unbounded_channel();
        let (l_exit_tx, l_exit_rx) = mpsc::unbounded_channel();
        Governor {
            label,
            shared,
            ctl,
            done,
            input,
            min_sust,
            in_ctr: WaitCounter::default(),
            out_ctr: WaitCounter::default(),
            count_acc: None,
            size_acc: None,
            max_count: 0,
            max_size: 0,
            client_wait_ctr,
            client_rate_ctr,
            retry_in_tx: Some(retry_in_tx),
            retry_in_rx: Some(retry_in_rx),
            retry_out,
            streamers: HashMap::new(),
            launchers: HashMap::new(),
            next_wid: 0,
            w_exit_tx,
            w_exit_rx,
            l_exit_tx,
            l_exit_rx,
            planner,
            dial_backoff,
            is_closing: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(id = %self.label, "starting");
        let shared = Arc::clone(&self.shared);
        let proc = &shared.proc;
        let windowed = self.min_sust > 0 && self.min_sust != u32::MAX;
        if proc.max_rate > 0 && windowed {
            self.count_acc = MovingAccumulator::new(self.min_sust as usize);
            self.max_count = proc.rate_as_count();
        }
        if proc.max_bandwidth > 0 && windowed {
            self.size_acc = MovingAccumulator::new(self.min_sust as usize);
            self.max_size = proc.bandwidth_as_size();
        }
        if proc.max_retries > 0 {
            if let Some(rx) = self.retry_in_rx.take() {
                tokio::spawn(run_retry_forwarder(
                    rx,
                    self.retry_out.clone(),
                    self.ctl.clone(),
                    format!("{}-RetryForwarder", self.label),
                ));
            }
        }
        // Bring up the first MinConns streamers.
        self.try_scale_up();
        let mut ticker = if !proc.poll_interval.is_zero() {
            let period = proc.poll_interval;
            Some(tokio::time::interval_at(
                tokio::time::Instant::now() + period,
                period,
            ))
        } else {
            None
        };
        info!(id = %self.label, "running");
        let mut hard_stop = false;
        loop {
            tokio::select! {
                Some(exit) = self.l_exit_rx.recv() => self.on_launcher_exit(exit),
                Some(exit) = self.w_exit_rx.recv() => self.on_streamer_exit(exit),
                _ = next_tick(&mut ticker) => {
                    if !self.is_closing {
                        match self.update_counters_and_eval() {
                            s if s > 0 => self.try_scale_up(),
                            s if s < 0 => self.try_wind_down(),
                            _ => {}
                        }
                    }
                }
                _ = self.ctl.cancelled() => {
                    info!(id = %self.label, "terminating");
                    hard_stop = true;
                }
            }
            if hard_stop {
                break;
            }
            if self.is_closing && self.streamers.is_empty() && self.launchers.is_empty() {
                break;
            }
        }
        // Launchers and streamers watch the hard-stop token themselves;
        // dropping the handles and the retry inlet lets the soft path
        // unwind the forwarder once the last retry is through.
        self.streamers.clear();
        self.retry_in_tx = None;
        info!(id = %self.label, "stopped");
        self.done.cancel();
    }

    /// Fold the pipeline's counters into the sustained-wait trackers and
    /// decide the scaling direction: `1` up, `-1` down, `0` stay.
    fn update_counters_and_eval(&mut self) -> i32 {
        // Fold and draw are not synchronized with each other; the
        // disparity is a rough estimate by design.
        let (in_waits, _) = self.client_wait_ctr.fold();
        let mut count = self.client_rate_ctr.draw();
        let mut out_waits: u32 = 0;
        let mut size: u64 = 0;
        for handle in self.streamers.values_mut() {
            let (waits, _) = handle.wait_ctr.fold();
            out_waits += waits;
            let drawn = handle.size_ctr.draw();
            handle.last_drawn = drawn;
            size += drawn;
        }
        self.in_ctr.acc(in_waits);
        self.out_ctr.acc(out_waits);
        if let Some(acc) = &mut self.count_acc {
            count = acc.accumulate(count);
        }
        if let Some(acc) = &mut self.size_acc {
            size = acc.accumulate(size);
        }
        if self.in_ctr.waits >= self.min_sust && self.out_ctr.no_waits >= self.min_sust {
            // Sustained blocking on input with free-flowing output wants
            // more connections, unless a throughput cap says otherwise.
            if self.count_acc.is_some() && count > self.max_count {
                return 0;
            }
            if self.size_acc.is_some() && size > self.max_size {
                return 0;
            }
            1
        } else if self.in_ctr.no_waits >= self.min_sust {
            -1
        } else {
            0
        }
    }

    fn try_scale_up(&mut self) {
        let delta = self.allowed_delta(ScaleDirection::Up);
        trace!(id = %self.label, delta, "scale-up check");
        for _ in 0..delta {
            self.launch_streamer();
        }
    }

    fn try_wind_down(&mut self) {
        let delta = self.allowed_delta(ScaleDirection::Down);
        trace!(id = %self.label, delta, "wind-down check");
        if delta >= 0 {
            return;
        }
        // Retire the streamers that moved the fewest bytes in the last
        // poll period; they have the least outstanding work to drain.
        let mut candidates: Vec<(u64, u32)> = self
            .streamers
            .iter()
            .map(|(id, h)| (h.last_drawn, *id))
            .collect();
        candidates.sort_unstable();
        let mut retired = 0;
        for (_, id) in candidates.into_iter().take((-delta) as usize) {
            if let Some(handle) = self.streamers.get(&id) {
                if handle.ctl.try_send(StreamerSignal::Retire).is_ok() {
                    info!(id = %self.label, streamer = id, "retiring streamer");
                    retired += 1;
                }
            }
        }
        if retired > 0 {
            self.planner.record_scaled();
        }
    }

    fn allowed_delta(&self, direction: ScaleDirection) -> i64 {
        self.planner.allowed_delta(
            direction,
            self.streamers.len() as u32,
            self.launchers.len() as u32,
            self.is_closing,
        )
    }

    fn launch_streamer(&mut self) {
        let Some(retry_tx) = self.retry_in_tx.clone() else {
            return;
        };
        let wid = self.next_wid;
        self.next_wid += 1;
        self.launchers.insert(wid, ());
        // A dial inside the back-off blackout waits the window out first.
        let delay = self.dial_backoff.remaining();
        let shared = Arc::clone(&self.shared);
        let input = Arc::clone(&self.input);
        let exit_tx = self.w_exit_tx.clone();
        let l_exit = self.l_exit_tx.clone();
        let hard = self.ctl.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = hard.cancelled() => {
                        let _ = l_exit.send(LauncherExit { id: wid, result: None });
                        return;
                    }
                }
            }
            let result =
                Streamer::launch(wid, shared, input, retry_tx, exit_tx, hard.clone(), true).await;
            let _ = l_exit.send(LauncherExit {
                id: wid,
                result: Some(result),
            });
        });
    }

    fn on_launcher_exit(&mut self, exit: LauncherExit) {
        self.launchers.remove(&exit.id);
        match exit.result {
            Some(Ok(handle)) => {
                self.dial_backoff.note_success();
                self.streamers.insert(exit.id, handle);
            }
            Some(Err(e)) => {
                warn!(id = %self.label, error = %e, "error starting streamer");
                self.dial_backoff.note_failure();
                // Keep the pool at its floor; the back-off window spaces
                // out the relaunch.
                let provisioned = (self.streamers.len() + self.launchers.len()) as u32;
                if !self.is_closing && provisioned < self.shared.proc.min_conns {
                    self.launch_streamer();
                }
            }
            None => {}
        }
        if self.launchers.is_empty() {
            self.planner.record_scaled();
        }
    }

    fn on_streamer_exit(&mut self, exit: StreamerExit) {
        if exit.in_closed && !self.is_closing {
            // Soft stop: the client closed the main queue, so we are
            // closing too.
            info!(id = %self.label, "stopping");
            self.is_closing = true;
        }
        self.streamers.remove(&exit.id);
        if exit.did_quit && !self.is_closing {
            self.dial_backoff.note_failure();
            self.launch_streamer();
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Moves retries from the streamers back into the client's submission
/// path without letting a congested submitter block the streamers.
/// Requests are batched into bounded sub-buffers, one helper task per
/// batch, preserving FIFO within each batch.
async fn run_retry_forwarder(
    mut rx: mpsc::Receiver<Request>,
    out: mpsc::Sender<Request>,
    ctl: CancellationToken,
    label: String,
) {
    info!(id = %label, "running");
    let mut buf_tx: Option<mpsc::Sender<Request>> = None;
    let mut buffered = 0usize;
    loop {
        tokio::select! {
            req = rx.recv() => match req {
                Some(req) => {
                    if buffered >= FORWARD_BUFFER {
                        buf_tx = None;
                    }
                    if buf_tx.is_none() {
                        let (tx, buf_rx) = mpsc::channel(FORWARD_BUFFER);
                        tokio::spawn(buffered_forwarder(buf_rx, out.clone(), ctl.clone()));
                        buffered = 0;
                        buf_tx = Some(tx);
                    }
                    if let Some(tx) = &buf_tx {
                        // Buffer capacity equals the rotation threshold,
                        // so the send cannot be rejected for being full.
                        let _ = tx.try_send(req);
                        buffered += 1;
                    }
                }
                // All streamers are gone; helpers drain what is buffered.
                None => break,
            },
            _ = ctl.cancelled() => break,
        }
    }
    info!(id = %label, "stopped");
}

async fn buffered_forwarder(
    mut rx: mpsc::Receiver<Request>,
    out: mpsc::Sender<Request>,
    ctl: CancellationToken,
) {
    loop {
        tokio::select! {
            req = rx.recv() => match req {
                Some(req) => {
                    tokio::select! {
                        sent = out.send(req) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = ctl.cancelled() => return,
                    }
                }
                None => return,
            },
            _ = ctl.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SignerChoice;
    use crate::config::{CommsConfig, ProcConfig};
    use crate::notification::{Header, Notification};
    use crate::payload::{Aps, Payload};
    use std::time::Duration;

    fn shared(proc: ProcConfig) -> Arc<PipelineShared> {
        Arc::new(PipelineShared::new(
            "Test".into(),
            "http://127.0.0.1:1".into(),
            CommsConfig::FAST,
            proc,
            None,
            None,
            SignerChoice::Default,
            None,
        ))
    }

    fn governor(proc: ProcConfig) -> Governor {
        let (_out_tx, out_rx) = mpsc::channel::<Request>(1);
        let input: SharedQueue = Arc::new(tokio::sync::Mutex::new(out_rx));
        let (retry_out, _retry_rx) = mpsc::channel(1);
        Governor::new(
            shared(proc),
            input,
            retry_out,
            Arc::new(TickTockCounter::new()),
            Arc::new(DrainCounter::new()),
            CancellationToken::new(),
            CancellationToken::new(),
        )
    }

    fn request() -> Request {
        Request::new(Arc::new(Notification::new(
            "00aa",
            Arc::new(Header::new("com.example.Alert")),
            Arc::new(Payload::aps(Aps::alert("hi"))),
        )))
    }

    #[tokio::test]
    async fn eval_scales_up_on_sustained_input_blocking() {
        let proc = ProcConfig {
            min_sustain: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_rate: 0,
            max_bandwidth: 0,
            ..ProcConfig::UNLIMITED
        };
        let mut g = governor(proc);
        assert_eq!(g.min_sust, 1);
        // One blocked submit this period, streamers idle on output.
        g.client_wait_ctr.tick();
        assert_eq!(g.update_counters_and_eval(), 1);
    }

    #[tokio::test]
    async fn eval_winds_down_on_sustained_idle_input() {
        let proc = ProcConfig {
            min_sustain: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_rate: 0,
            max_bandwidth: 0,
            ..ProcConfig::UNLIMITED
        };
        let mut g = governor(proc);
        assert_eq!(g.update_counters_and_eval(), -1);
    }

    #[tokio::test]
    async fn eval_stay_when_rate_cap_exceeded() {
        let proc = ProcConfig {
            min_sustain: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_rate: 2, // 2/s over a 1s adjusted period
            max_bandwidth: 0,
            ..ProcConfig::UNLIMITED
        };
        let mut g = governor(proc);
        g.count_acc = MovingAccumulator::new(g.min_sust as usize);
        g.max_count = g.shared.proc.rate_as_count();
        assert_eq!(g.max_count, 2);
        g.client_wait_ctr.tick();
        g.client_rate_ctr.add(50);
        assert_eq!(g.update_counters_and_eval(), 0);
    }

    #[tokio::test]
    async fn eval_disabled_without_poll_interval() {
        let mut g = governor(ProcConfig::MIN_BLOCKING);
        assert_eq!(g.min_sust, u32::MAX);
        g.client_wait_ctr.tick();
        assert_eq!(g.update_counters_and_eval(), 0);
    }

    #[tokio::test]
    async fn forwarder_preserves_requests_and_stops_on_close() {
        let (in_tx, in_rx) = mpsc::channel(10);
        let (out_tx, mut out_rx) = mpsc::channel(10);
        let ctl = CancellationToken::new();
        let task = tokio::spawn(run_retry_forwarder(
            in_rx,
            out_tx,
            ctl,
            "Test-RetryForwarder".into(),
        ));
        for _ in 0..5 {
            in_tx.send(request()).await.unwrap();
        }
        for _ in 0..5 {
            let forwarded = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
                .await
                .unwrap();
            assert!(forwarded.is_some());
        }
        drop(in_tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn forwarder_aborts_on_hard_stop() {
        let (_in_tx, in_rx) = mpsc::channel::<Request>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let ctl = CancellationToken::new();
        let task = tokio::spawn(run_retry_forwarder(
            in_rx,
            out_tx,
            ctl.clone(),
            "Test-RetryForwarder".into(),
        ));
        ctl.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
