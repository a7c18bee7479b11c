//! Streamers: workers that each own one HTTP/2 connection and stream
//! requests over it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, trace};

use crate::client::PipelineShared;
use crate::counters::{DrainCounter, TickTockCounter};
use crate::errors::{PushError, RequestError};
use crate::h2metrics::{self, TransportFault};
use crate::http::{estimated_wire_size, HttpConnection};
use crate::request::{CallbackChoice, PushOutcome, Request};
use crate::response::{RejectionReason, Response, ResponseBody};

/// Queue of inbound requests, drained competitively by all streamers.
/// Receiving `None` means the client closed the queue: soft shutdown.
pub(crate) type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>;

/// Control messages a running streamer accepts.
#[derive(Debug)]
pub(crate) enum StreamerSignal {
    /// The connection is unusable; quit so the governor can respawn.
    Unusable,
    /// Wind-down: drain outstanding round-trips and exit for good.
    Retire,
}

/// Announcement a streamer sends the governor on exit.
#[derive(Debug)]
pub(crate) struct StreamerExit {
    pub(crate) id: u32,
    /// Exit was triggered by the inbound queue closing.
    pub(crate) in_closed: bool,
    /// Exit was triggered by an unusable connection; the governor
    /// should respawn.
    pub(crate) did_quit: bool,
}

/// The governor's grip on a running streamer.
#[derive(Debug)]
pub(crate) struct StreamerHandle {
    pub(crate) ctl: mpsc::Sender<StreamerSignal>,
    pub(crate) wait_ctr: Arc<TickTockCounter>,
    pub(crate) size_ctr: Arc<DrainCounter>,
    /// Bytes drawn in the most recent poll period; used to pick
    /// wind-down victims.
    pub(crate) last_drawn: u64,
}

/// Shared pieces each detached round-trip task needs.
#[derive(Clone)]
struct RoundTripCtx {
    shared: Arc<PipelineShared>,
    conn: Arc<HttpConnection>,
    retry_tx: mpsc::Sender<Request>,
    ctl_tx: mpsc::Sender<StreamerSignal>,
    wait_ctr: Arc<TickTockCounter>,
    size_ctr: Arc<DrainCounter>,
    /// Hard-stop signal; unblocks callback delivery on termination.
    hard: CancellationToken,
}

pub(crate) struct Streamer {
    id: u32,
    label: String,
    conn: Arc<HttpConnection>,
    shared: Arc<PipelineShared>,
    input: SharedQueue,
    ctl_rx: mpsc::Receiver<StreamerSignal>,
    exit_tx: mpsc::UnboundedSender<StreamerExit>,
    ctx: RoundTripCtx,
    tracker: TaskTracker,
}

impl Streamer {
    /// Construct the connection (optionally warm-started) and spawn the
    /// streamer's run loop. Returns the governor's handle.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn launch(
        id: u32,
        shared: Arc<PipelineShared>,
        input: SharedQueue,
        retry_tx: mpsc::Sender<Request>,
        exit_tx: mpsc::UnboundedSender<StreamerExit>,
        hard: CancellationToken,
        warm_start: bool,
    ) -> Result<StreamerHandle, PushError> {
        let label = format!("{}-Streamer-{}", shared.id, id);
        info!(id = %label, "starting");
        let conn = Arc::new(HttpConnection::new(
            &shared.gateway,
            &shared.comms,
            &shared.proc,
            shared.identity.clone(),
            shared.root_ca.clone(),
        )?);
        if warm_start {
            // Forces connection establishment so the first real request
            // does not race connection setup.
            conn.warm_up().await?;
        }
        let (ctl_tx, ctl_rx) = mpsc::channel(1);
        let wait_ctr = Arc::new(TickTockCounter::new());
        let size_ctr = Arc::new(DrainCounter::new());
        let ctx = RoundTripCtx {
            shared: Arc::clone(&shared),
            conn: Arc::clone(&conn),
            retry_tx,
            ctl_tx: ctl_tx.clone(),
            wait_ctr: Arc::clone(&wait_ctr),
            size_ctr: Arc::clone(&size_ctr),
            hard,
        };
        let streamer = Streamer {
            id,
            label,
            conn,
            shared,
            input,
            ctl_rx,
            exit_tx,
            ctx,
            tracker: TaskTracker::new(),
        };
        tokio::spawn(streamer.run());
        Ok(StreamerHandle {
            ctl: ctl_tx,
            wait_ctr,
            size_ctr,
            last_drawn: 0,
        })
    }

    async fn run(mut self) {
        info!(id = %self.label, "running");
        let mut in_closed = false;
        let mut did_quit = false;
        loop {
            tokio::select! {
                req = next_request(&self.input) => match req {
                    Some(req) => self.exec(req).await,
                    None => {
                        // Soft shutdown: the queue is closed. Wait for
                        // outstanding round-trips before leaving.
                        info!(id = %self.label, "stopping");
                        self.tracker.close();
                        self.tracker.wait().await;
                        in_closed = true;
                        break;
                    }
                },
                sig = self.ctl_rx.recv() => match sig {
                    Some(StreamerSignal::Unusable) => {
                        info!(id = %self.label, "quitting");
                        did_quit = true;
                        break;
                    }
                    Some(StreamerSignal::Retire) => {
                        info!(id = %self.label, "retiring");
                        self.tracker.close();
                        self.tracker.wait().await;
                        break;
                    }
                    None => break,
                },
                _ = self.ctx.hard.cancelled() => {
                    // Hard stop: outstanding round-trips are orphaned.
                    info!(id = %self.label, "terminating");
                    break;
                }
            }
        }
        let _ = self.conn.close();
        let _ = self.exit_tx.send(StreamerExit {
            id: self.id,
            in_closed,
            did_quit,
        });
        info!(id = %self.label, "stopped");
    }

    async fn exec(&self, req: Request) {
        trace!(id = %self.label, recipient = %req.notification.recipient, "serving");
        if !can_authenticate(&self.shared, &req) {
            deliver(&self.ctx, req, None, Some(PushError::MissingAuth)).await;
            return;
        }
        if let Some(token) = &req.cancel {
            if token.is_cancelled() {
                deliver(&self.ctx, req, None, Some(PushError::Canceled)).await;
                return;
            }
        }
        if self.conn.precise_metrics() {
            self.conn.gate().refresh();
        }
        // Acquiring a stream slot can block; this is the primary source
        // of back-pressure on the pipeline.
        let reservation = match self.conn.gate().reserve(req.cancel.as_ref()).await {
            Ok(r) => r,
            Err(e) => {
                deliver(&self.ctx, req, None, Some(e)).await;
                return;
            }
        };
        let ctx = self.ctx.clone();
        self.tracker.spawn(async move {
            let _reservation = reservation;
            round_trip(ctx, req).await;
        });
    }
}

async fn next_request(input: &SharedQueue) -> Option<Request> {
    input.lock().await.recv().await
}

/// Whether a request could be authenticated at all: a client certificate
/// works for any request, otherwise a reachable signer is required. A
/// request-level explicit no-signer with no certificate cannot be
/// authenticated; a client-level explicit no-signer is a deliberate
/// choice and is let through.
fn can_authenticate(shared: &PipelineShared, req: &Request) -> bool {
    if shared.identity.is_some() {
        return true;
    }
    match &req.signer {
        crate::auth::SignerChoice::Jwt(_) => true,
        crate::auth::SignerChoice::None => false,
        crate::auth::SignerChoice::Default => !shared.signer.is_default(),
    }
}

async fn round_trip(ctx: RoundTripCtx, mut req: Request) {
    let (response, error) = match submit(&ctx, &req).await {
        Ok(r) => (Some(r), None),
        Err(f) => (f.response, Some(f.error)),
    };
    if let Some(err) = &error {
        if req.attempts < ctx.shared.proc.max_retries
            && is_retriable(
                ctx.shared.proc.retry_eval.as_ref(),
                response.as_ref(),
                Some(err),
            )
        {
            req.attempts += 1;
            let _ = ctx.retry_tx.send(req).await;
            return;
        }
        if let PushError::Transport(te) = err {
            if h2metrics::is_stream_refused(te) {
                ctx.conn.gate().note_stream_refused();
            }
        }
    }
    let usable = is_conn_usable(response.as_ref(), error.as_ref());
    deliver(&ctx, req, response, error).await;
    if !usable {
        // The run loop owns the control channel; a non-blocking nudge is
        // enough, extra signals are redundant anyway.
        let _ = ctx.ctl_tx.try_send(StreamerSignal::Unusable);
    }
}

/// A failed submission. The response is populated when a round-trip
/// completed before the failure (a decode fault), which is the only
/// case the retry machinery may act on.
struct SubmitError {
    response: Option<Response>,
    error: PushError,
}

impl From<PushError> for SubmitError {
    fn from(error: PushError) -> Self {
        SubmitError {
            response: None,
            error,
        }
    }
}

impl From<RequestError> for SubmitError {
    fn from(error: RequestError) -> Self {
        PushError::from(error).into()
    }
}

/// One POST to the gateway, decoded into a [`Response`].
async fn submit(ctx: &RoundTripCtx, req: &Request) -> Result<Response, SubmitError> {
    let notification = &req.notification;
    let payload = notification
        .payload
        .encoded()
        .map_err(RequestError::Payload)?
        .to_vec();
    let body_len = payload.len();
    let url = ctx.conn.device_url(&notification.recipient)?;

    let mut builder = ctx
        .conn
        .client()
        .post(url)
        .header("content-type", "application/json; charset=utf-8");
    if let Some(id) = &notification.apns_id {
        builder = builder.header("apns-id", id);
    }
    for (name, value) in notification.header.wire_headers() {
        builder = builder.header(*name, value);
    }
    if let Some(signer) = req.signer.effective(&ctx.shared.signer) {
        let token = signer.token().map_err(RequestError::Signing)?;
        builder = builder.header("authorization", token.header_value.as_str());
    }
    let http_req = builder
        .body(payload)
        .build()
        .map_err(RequestError::Build)?;
    let wire_size = estimated_wire_size(&http_req, body_len);

    let send = ctx.conn.client().execute(http_req);
    let resp = match &req.cancel {
        Some(token) => tokio::select! {
            r = send => r,
            _ = token.cancelled() => return Err(PushError::Canceled.into()),
        },
        None => send.await,
    }
    .map_err(PushError::Transport)?;

    ctx.size_ctr.add(wire_size);
    ctx.conn.gate().connection_verified();

    let status = resp.status().as_u16();
    let apns_id = resp
        .headers()
        .get("apns-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = resp.bytes().await.map_err(PushError::Transport)?;
    // Accepted notifications come back with an empty body.
    let parsed = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<ResponseBody>(&body) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                // The round-trip did complete; keep what was decoded so
                // the failure stays eligible for retry policy.
                return Err(SubmitError {
                    response: Some(Response {
                        apns_id,
                        status,
                        rejection_reason: None,
                        unsubscribed_at: None,
                    }),
                    error: PushError::Request(RequestError::Decode(e)),
                });
            }
        }
    };
    Ok(Response {
        apns_id,
        status,
        rejection_reason: parsed.as_ref().and_then(|b| b.reason),
        unsubscribed_at: parsed.as_ref().and_then(|b| b.unsubscribed_at()),
    })
}

fn is_retriable(
    policy: Option<&crate::config::RetryPolicy>,
    resp: Option<&Response>,
    err: Option<&PushError>,
) -> bool {
    // A failure with no decoded response is a transport or construction
    // fault; those are never retriable, regardless of policy.
    if resp.is_none() && err.is_some() {
        return false;
    }
    match policy {
        Some(eval) => eval(resp, err),
        None => false,
    }
}

/// Whether the connection that produced this outcome is still worth
/// keeping. Request-scoped faults and per-request cancellations are;
/// transport failures are not, except a stream reset, which only lowers
/// the stream cap.
pub(crate) fn is_conn_usable(resp: Option<&Response>, err: Option<&PushError>) -> bool {
    if let Some(resp) = resp {
        return match resp.status {
            503 | 405 => true,
            400 => resp.rejection_reason != Some(RejectionReason::IdleTimeout),
            403 => !matches!(
                resp.rejection_reason,
                Some(RejectionReason::BadCertificate)
                    | Some(RejectionReason::BadCertificateEnvironment)
            ),
            _ => true,
        };
    }
    match err {
        Some(PushError::Request(_)) => true,
        Some(PushError::Canceled) => true,
        Some(PushError::Transport(e)) => {
            if e.is_builder() || e.is_request() {
                // A malformed request is our bug, not the connection's,
                // but the transport cannot be trusted to recover from it.
                return false;
            }
            matches!(h2metrics::classify(e), TransportFault::StreamReset(_))
        }
        Some(_) => false,
        None => true,
    }
}

/// Deliver the outcome to the per-request channel or the client-wide
/// one. Non-blocking first; when the channel is full the wait is counted
/// so the governor can see downstream back-pressure.
async fn deliver(
    ctx: &RoundTripCtx,
    req: Request,
    response: Option<Response>,
    error: Option<PushError>,
) {
    let target = match &req.callback {
        CallbackChoice::None => None,
        CallbackChoice::Channel(tx) => Some(tx.clone()),
        CallbackChoice::Default => ctx.shared.callback(),
    };
    let Some(tx) = target else { return };
    let outcome = PushOutcome {
        notification: Arc::clone(&req.notification),
        signer: req.signer,
        cancel: req.cancel,
        response,
        error,
    };
    match tx.try_send(outcome) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(outcome)) => {
            ctx.wait_ctr.tick();
            tokio::select! {
                _ = tx.send(outcome) => {}
                _ = ctx.hard.cancelled() => {}
            }
            ctx.wait_ctr.tock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, reason: Option<RejectionReason>) -> Response {
        Response {
            apns_id: None,
            status,
            rejection_reason: reason,
            unsubscribed_at: None,
        }
    }

    #[test]
    fn accepted_and_rejected_responses_keep_conn() {
        assert!(is_conn_usable(Some(&response(200, None)), None));
        assert!(is_conn_usable(
            Some(&response(410, Some(RejectionReason::Unregistered))),
            None
        ));
        assert!(is_conn_usable(Some(&response(503, None)), None));
        assert!(is_conn_usable(Some(&response(405, None)), None));
    }

    #[test]
    fn idle_timeout_kills_conn() {
        assert!(is_conn_usable(
            Some(&response(400, Some(RejectionReason::BadDeviceToken))),
            None
        ));
        assert!(!is_conn_usable(
            Some(&response(400, Some(RejectionReason::IdleTimeout))),
            None
        ));
    }

    #[test]
    fn certificate_rejections_kill_conn() {
        assert!(!is_conn_usable(
            Some(&response(403, Some(RejectionReason::BadCertificate))),
            None
        ));
        assert!(!is_conn_usable(
            Some(&response(403, Some(RejectionReason::BadCertificateEnvironment))),
            None
        ));
        assert!(is_conn_usable(
            Some(&response(403, Some(RejectionReason::ExpiredProviderToken))),
            None
        ));
    }

    #[test]
    fn errors_without_a_response_are_never_retriable() {
        let always: crate::config::RetryPolicy = Arc::new(|_, _| true);
        let transport_side = PushError::Request(RequestError::Payload(
            serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        ));
        assert!(!is_retriable(Some(&always), None, Some(&transport_side)));
        assert!(!is_retriable(Some(&always), None, Some(&PushError::Canceled)));
    }

    #[test]
    fn decode_failures_defer_to_retry_policy() {
        let always: crate::config::RetryPolicy = Arc::new(|_, _| true);
        let never: crate::config::RetryPolicy = Arc::new(|_, _| false);
        let err = PushError::Request(RequestError::Decode(
            serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        ));
        let resp = response(400, None);
        assert!(is_retriable(Some(&always), Some(&resp), Some(&err)));
        assert!(!is_retriable(Some(&never), Some(&resp), Some(&err)));
        // No policy configured means never retry.
        assert!(!is_retriable(None, Some(&resp), Some(&err)));
    }

    #[test]
    fn request_scoped_errors_keep_conn() {
        let err = PushError::Request(RequestError::Decode(
            serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        ));
        assert!(is_conn_usable(None, Some(&err)));
        assert!(is_conn_usable(None, Some(&PushError::Canceled)));
    }

    #[tokio::test]
    async fn connect_errors_kill_conn() {
        // Nothing listens on this port; the dial fails immediately.
        let err = reqwest::Client::builder()
            .build()
            .unwrap()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        assert!(!is_conn_usable(None, Some(&PushError::Transport(err))));
    }
}
