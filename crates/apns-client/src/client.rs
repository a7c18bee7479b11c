//! The client façade: lifecycle, submission, and shutdown coordination.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::{Certificate, Identity};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::auth::SignerChoice;
use crate::config::{CommsConfig, ProcConfig};
use crate::counters::{DrainCounter, TickTockCounter};
use crate::errors::PushError;
use crate::governor::Governor;
use crate::http::gateway;
use crate::notification::Notification;
use crate::request::{CallbackChoice, PushOutcome, Request};
use crate::streamer::SharedQueue;

/// Everything the pipeline actors share read-only (plus the client-wide
/// callback, which closes on shutdown).
pub(crate) struct PipelineShared {
    /// Identifies the client in log entries.
    pub(crate) id: String,
    pub(crate) gateway: String,
    pub(crate) comms: CommsConfig,
    pub(crate) proc: ProcConfig,
    pub(crate) identity: Option<Identity>,
    pub(crate) root_ca: Option<Certificate>,
    pub(crate) signer: SignerChoice,
    callback: Mutex<Option<mpsc::Sender<PushOutcome>>>,
}

impl PipelineShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        gateway: String,
        comms: CommsConfig,
        proc: ProcConfig,
        identity: Option<Identity>,
        root_ca: Option<Certificate>,
        signer: SignerChoice,
        callback: Option<mpsc::Sender<PushOutcome>>,
    ) -> Self {
        PipelineShared {
            id,
            gateway,
            comms,
            proc,
            identity,
            root_ca,
            signer,
            callback: Mutex::new(callback),
        }
    }

    pub(crate) fn callback(&self) -> Option<mpsc::Sender<PushOutcome>> {
        self.callback.lock().clone()
    }

    fn close_callback(&self) {
        *self.callback.lock() = None;
    }
}

/// Client configuration, consumed by [`Client::new`].
pub struct ClientConfig {
    /// Identifies the client in log entries.
    pub id: String,
    /// The gateway endpoint. Apple publishes two, preconfigured as
    /// [`gateway::PRODUCTION`] and [`gateway::DEVELOPMENT`].
    pub gateway: String,
    /// Communication settings; see [`CommsConfig`].
    pub comms: CommsConfig,
    /// Processing and autoscaling settings; see [`ProcConfig`].
    pub proc: ProcConfig,
    /// Client TLS certificate, one of the two authentication methods
    /// the gateway supports.
    pub identity: Option<Identity>,
    /// Alternative root certificate authority. Only needed in testing
    /// or when the system roots are not set up.
    pub root_ca: Option<Certificate>,
    /// Client-wide request signer, the other authentication method.
    pub signer: SignerChoice,
    /// Client-wide channel for push outcomes. Requests without their own
    /// callback deliver here; with neither, outcomes are dropped.
    pub callback: Option<mpsc::Sender<PushOutcome>>,
    /// Externally owned submission queue. Supplying one enables
    /// select-style coordination and lets the producer close the queue
    /// to trigger soft shutdown; writing to it is equivalent to
    /// [`Client::push`].
    pub queue: Option<mpsc::Receiver<Request>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            id: "Client".into(),
            gateway: gateway::PRODUCTION.into(),
            comms: CommsConfig::default(),
            proc: ProcConfig::default(),
            identity: None,
            root_ca: None,
            signer: SignerChoice::Default,
            callback: None,
            queue: None,
        }
    }
}

/// Lifecycle states, strictly increasing. Backwards transitions are
/// rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ClientState {
    Initial,
    Starting,
    Running,
    Stopping,
    Terminating,
    Closed,
}

/// Channels and signals that exist while the pipeline runs.
struct PipelineRuntime {
    /// Sender side of the outbound channel; dropped to close it.
    out_tx: Option<mpsc::Sender<Request>>,
    queue_tx: Option<mpsc::Sender<Request>>,
    /// Client control: unblocks a pending `stop` on hard shutdown.
    ctl: CancellationToken,
    /// Submitter control.
    cctl: CancellationToken,
    /// Governor control: hard-stop for the whole pipeline.
    gctl: CancellationToken,
    /// Cancelled by the governor once processing has fully unwound.
    cdone: CancellationToken,
    submitter: Option<JoinHandle<()>>,
}

struct ClientInner {
    shared: Arc<PipelineShared>,
    state: RwLock<ClientState>,
    runtime: Mutex<Option<PipelineRuntime>>,
    /// Waits on the outbound channel.
    wait_ctr: Arc<TickTockCounter>,
    /// Count of submitted requests.
    rate_ctr: Arc<DrainCounter>,
    queue: Mutex<Option<mpsc::Receiver<Request>>>,
}

/// Asynchronous client for the APN service. Cheap to clone; all clones
/// drive the same pipeline, and it is safe to push from concurrent
/// tasks.
///
/// Per gateway guidelines, keep one client alive for the lifetime of
/// your workload: repeatedly opening and closing connections in rapid
/// succession is treated by Apple as a denial-of-service attack.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let shared = Arc::new(PipelineShared::new(
            config.id,
            config.gateway,
            config.comms,
            config.proc,
            config.identity,
            config.root_ca,
            config.signer,
            config.callback,
        ));
        Client {
            inner: Arc::new(ClientInner {
                shared,
                state: RwLock::new(ClientState::Initial),
                runtime: Mutex::new(None),
                wait_ctr: Arc::new(TickTockCounter::new()),
                rate_ctr: Arc::new(DrainCounter::new()),
                queue: Mutex::new(config.queue),
            }),
        }
    }

    /// Start the processing pipeline. Must be called exactly once;
    /// repeated calls fail with [`PushError::ClientAlreadyStarted`].
    pub async fn start(&self) -> Result<(), PushError> {
        self.start_with(None).await
    }

    /// Start the pipeline with the submitter tracked by an external
    /// [`TaskTracker`], for callers coordinating shutdown across several
    /// components.
    pub async fn start_tracked(&self, tracker: &TaskTracker) -> Result<(), PushError> {
        self.start_with(Some(tracker)).await
    }

    async fn start_with(&self, tracker: Option<&TaskTracker>) -> Result<(), PushError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            if *state >= ClientState::Starting {
                return Err(PushError::ClientAlreadyStarted);
            }
            *state = ClientState::Starting;
        }
        info!(id = %inner.shared.id, "starting");

        let ctl = CancellationToken::new();
        let cctl = CancellationToken::new();
        let gctl = CancellationToken::new();
        let cdone = CancellationToken::new();

        let (out_tx, out_rx) = mpsc::channel(1);
        let input: SharedQueue = Arc::new(tokio::sync::Mutex::new(out_rx));
        let (queue_tx, queue_rx) = match inner.queue.lock().take() {
            Some(rx) => (None, rx),
            None => {
                let (tx, rx) = mpsc::channel(1);
                (Some(tx), rx)
            }
        };
        let (retry_tx, retry_rx) = mpsc::channel(1);

        let governor = Governor::new(
            Arc::clone(&inner.shared),
            input,
            retry_tx,
            Arc::clone(&inner.wait_ctr),
            Arc::clone(&inner.rate_ctr),
            gctl.clone(),
            cdone.clone(),
        );
        tokio::spawn(governor.run());

        let submitter_fut = run_submitter(
            Arc::clone(inner),
            queue_rx,
            retry_rx,
            cctl.clone(),
        );
        let submitter = match tracker {
            Some(tracker) => tracker.spawn(submitter_fut),
            None => tokio::spawn(submitter_fut),
        };

        *inner.runtime.lock() = Some(PipelineRuntime {
            out_tx: Some(out_tx),
            queue_tx,
            ctl,
            cctl,
            gctl,
            cdone,
            submitter: Some(submitter),
        });
        Ok(())
    }

    /// Soft shutdown: every request accepted so far is given the chance
    /// to execute before this returns.
    pub async fn stop(&self) -> Result<(), PushError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            if *state < ClientState::Starting {
                return Err(PushError::ClientNotRunning);
            }
            if *state >= ClientState::Stopping {
                return Err(PushError::ClientAlreadyClosed);
            }
            *state = ClientState::Stopping;
        }
        info!(id = %inner.shared.id, "stopping");
        let (cctl, ctl, cdone, submitter) = {
            let mut rt = inner.runtime.lock();
            let Some(rt) = rt.as_mut() else {
                return Err(PushError::ClientNotRunning);
            };
            (
                rt.cctl.clone(),
                rt.ctl.clone(),
                rt.cdone.clone(),
                rt.submitter.take(),
            )
        };
        // Stop the submitter and wait for it to drain.
        cctl.cancel();
        if let Some(handle) = submitter {
            let _ = handle.await;
        }
        // Close the outbound channel so streamers drain and exit.
        if let Some(rt) = inner.runtime.lock().as_mut() {
            rt.out_tx = None;
        }
        // Block until processing completes or a hard stop intervenes.
        tokio::select! {
            _ = cdone.cancelled() => {}
            _ = ctl.cancelled() => {}
        }
        inner.shared.close_callback();
        info!(id = %inner.shared.id, "stopped");
        Ok(())
    }

    /// Hard shutdown: returns without waiting for the pipeline to
    /// unwind. Inflight requests are discarded.
    pub async fn kill(&self) -> Result<(), PushError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write();
            if *state < ClientState::Starting {
                return Err(PushError::ClientNotRunning);
            }
            if *state >= ClientState::Terminating {
                return Err(PushError::ClientAlreadyClosed);
            }
            *state = ClientState::Terminating;
        }
        info!(id = %inner.shared.id, "terminating");
        if let Some(rt) = inner.runtime.lock().as_ref() {
            rt.cctl.cancel();
            rt.gctl.cancel();
            // Unblocks a concurrently pending stop().
            rt.ctl.cancel();
        }
        info!(id = %inner.shared.id, "terminated");
        Ok(())
    }

    /// Asynchronously push a notification.
    ///
    /// The signer choice resolves against the client's signer; the
    /// cancellation token, when given, aborts both the wait for
    /// dispatch and the in-flight request. The outcome goes to
    /// `callback`, or to the client-wide channel for
    /// [`CallbackChoice::Default`].
    ///
    /// Blocks while downstream capacity is exhausted. For non-blocking
    /// submission or channel-level coordination, supply your own queue
    /// in [`ClientConfig`] and write [`Request`]s to it directly.
    pub async fn push(
        &self,
        notification: impl Into<Arc<Notification>>,
        signer: SignerChoice,
        cancel: Option<CancellationToken>,
        callback: CallbackChoice,
    ) -> Result<(), PushError> {
        let inner = &self.inner;
        {
            let state = *inner.state.read();
            if state < ClientState::Starting || state > ClientState::Running {
                return Err(PushError::ClientNotRunning);
            }
        }
        // Reject now if no authentication path could serve the request.
        if inner.shared.identity.is_none() {
            let reachable = match &signer {
                SignerChoice::Jwt(_) => true,
                SignerChoice::None => false,
                SignerChoice::Default => !inner.shared.signer.is_default(),
            };
            if !reachable {
                return Err(PushError::MissingAuth);
            }
        }
        let request = Request {
            notification: notification.into(),
            signer,
            cancel,
            callback,
            attempts: 0,
        };
        inner.submit(request).await
    }

    /// Push and wait for the outcome over a dedicated channel. A
    /// convenience over [`Client::push`] for callers that do not keep a
    /// result loop of their own.
    pub async fn push_awaited(
        &self,
        notification: impl Into<Arc<Notification>>,
        signer: SignerChoice,
        cancel: Option<CancellationToken>,
    ) -> Result<PushOutcome, PushError> {
        let (tx, mut rx) = mpsc::channel(1);
        self.push(notification, signer, cancel, CallbackChoice::Channel(tx))
            .await?;
        rx.recv().await.ok_or(PushError::PushInterrupted)
    }

    /// A sender for the client's internal queue, for callers that want
    /// select-compatible submission without owning the queue. Writing to
    /// it has the same downstream semantics as [`Client::push`], minus
    /// the upfront state and authentication checks.
    pub fn queue(&self) -> Result<mpsc::Sender<Request>, PushError> {
        let rt = self.inner.runtime.lock();
        rt.as_ref()
            .and_then(|rt| rt.queue_tx.clone())
            .ok_or(PushError::ClientNotRunning)
    }

    /// Whether a non-default signer is configured for signing push
    /// requests.
    pub fn has_signer(&self) -> bool {
        !self.inner.shared.signer.is_default()
    }
}

impl ClientInner {
    /// Hand a request to the outbound channel, counting the submission
    /// and any blocking it incurs.
    async fn submit(&self, request: Request) -> Result<(), PushError> {
        {
            let state = *self.state.read();
            if state < ClientState::Starting || state > ClientState::Running {
                return Ok(());
            }
        }
        self.rate_ctr.add(1);
        let (out_tx, cctl) = {
            let rt = self.runtime.lock();
            let Some(rt) = rt.as_ref() else {
                return Ok(());
            };
            let Some(out_tx) = rt.out_tx.clone() else {
                return Ok(());
            };
            (out_tx, rt.cctl.clone())
        };
        match out_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(PushError::PushInterrupted),
            Err(TrySendError::Full(request)) => {
                self.wait_ctr.tick();
                let res = tokio::select! {
                    sent = out_tx.send(request) => {
                        sent.map_err(|_| PushError::PushInterrupted)
                    }
                    _ = cctl.cancelled() => Err(PushError::PushInterrupted),
                };
                self.wait_ctr.tock();
                res
            }
        }
    }
}

async fn run_submitter(
    inner: Arc<ClientInner>,
    mut queue_rx: mpsc::Receiver<Request>,
    mut retry_rx: mpsc::Receiver<Request>,
    cctl: CancellationToken,
) {
    let mut done = {
        let mut state = inner.state.write();
        if *state != ClientState::Starting {
            true
        } else {
            *state = ClientState::Running;
            false
        }
    };
    if !done {
        info!(id = %inner.shared.id, "submitter running");
    }
    let mut retry_open = true;
    let mut queue_closed = false;
    while !done {
        tokio::select! {
            retry = retry_rx.recv(), if retry_open => match retry {
                Some(request) => {
                    let _ = inner.submit(request).await;
                }
                // Retries may still be buffered upstream; a closed retry
                // channel must not shut the submitter down.
                None => retry_open = false,
            },
            queued = queue_rx.recv() => match queued {
                Some(request) => {
                    let _ = inner.submit(request).await;
                }
                // Producer closed the queue: soft shutdown.
                None => {
                    queue_closed = true;
                    done = true;
                }
            },
            _ = cctl.cancelled() => done = true,
        }
    }
    *inner.state.write() = ClientState::Closed;
    if queue_closed {
        // A queue-driven shutdown has no stop() call to close the
        // outbound channel, so the streamers are drained from here.
        if let Some(rt) = inner.runtime.lock().as_mut() {
            rt.out_tx = None;
        }
    }
    info!(id = %inner.shared.id, "submitter stopped");
}
