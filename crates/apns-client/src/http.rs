//! The HTTP layer owned by a single streamer: one `reqwest` client over
//! one HTTP/2 connection, plus its stream gate.

use std::sync::Arc;

use reqwest::{Certificate, Identity, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{CommsConfig, ProcConfig};
use crate::errors::PushError;
use crate::gate::StreamGate;

/// Production and development gateway endpoints. These use the default
/// HTTPS port 443; per Apple, port 2197 is also available if needed.
pub mod gateway {
    pub const PRODUCTION: &str = "https://api.push.apple.com";
    pub const DEVELOPMENT: &str = "https://api.development.push.apple.com";
}

/// Default URL path root for push requests.
pub const REQUEST_ROOT: &str = "/3/device/";

/// One streamer's connection to the gateway.
///
/// The wrapped client is pinned to a single idle connection per host and
/// forced onto HTTP/2, so all requests sent through it multiplex over
/// one connection — the unit the stream gate accounts against.
#[derive(Debug)]
pub(crate) struct HttpConnection {
    client: reqwest::Client,
    base: Url,
    gate: Arc<StreamGate>,
    precise_metrics: bool,
    refresh_ctl: CancellationToken,
}

impl HttpConnection {
    pub(crate) fn new(
        gateway: &str,
        comms: &CommsConfig,
        proc: &ProcConfig,
        identity: Option<Identity>,
        root_ca: Option<Certificate>,
    ) -> Result<Self, PushError> {
        let base = Url::parse(gateway).map_err(|e| PushError::Gateway(e.to_string()))?;
        // The gateway requires HTTP/2. Prior knowledge forces it for
        // both TLS and cleartext endpoints (the latter matters for test
        // servers); ALPN alone would leave reqwest on HTTP/1.1.
        let mut builder = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(comms.request_timeout)
            .connect_timeout(comms.dial_timeout)
            .tcp_keepalive(Some(comms.keep_alive))
            .pool_max_idle_per_host(1);
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        if let Some(root_ca) = root_ca {
            builder = builder.add_root_certificate(root_ca);
        }
        let client = builder.build().map_err(PushError::Transport)?;
        let gate = StreamGate::new(comms.max_concurrent_streams.max(1));

        let conn = HttpConnection {
            client,
            base,
            gate,
            precise_metrics: proc.allow_http2_incursion && proc.use_precise_http2_metrics,
            refresh_ctl: CancellationToken::new(),
        };
        if proc.allow_http2_incursion
            && !proc.use_precise_http2_metrics
            && !proc.http2_metrics_refresh_period.is_zero()
        {
            conn.spawn_cap_refresh(proc.http2_metrics_refresh_period);
        }
        Ok(conn)
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn gate(&self) -> &Arc<StreamGate> {
        &self.gate
    }

    /// Whether the gate should be re-evaluated at every reservation
    /// rather than on the refresh timer.
    pub(crate) fn precise_metrics(&self) -> bool {
        self.precise_metrics
    }

    /// Target URL for a device token.
    pub(crate) fn device_url(&self, recipient: &str) -> Result<Url, PushError> {
        self.base
            .join(&format!("{}{}", REQUEST_ROOT, recipient))
            .map_err(|e| PushError::Gateway(e.to_string()))
    }

    /// Force connection establishment with a benign probe so the first
    /// real request does not race connection setup. Any HTTP response,
    /// including the 404 the gateway answers with on the bare root,
    /// proves the connection.
    pub(crate) async fn warm_up(&self) -> Result<(), PushError> {
        match self.client.get(self.base.clone()).send().await {
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "warm-up probe answered");
                self.gate.connection_verified();
                Ok(())
            }
            Err(e) => Err(PushError::Transport(e)),
        }
    }

    fn spawn_cap_refresh(&self, period: std::time::Duration) {
        let gate = Arc::clone(&self.gate);
        let ctl = self.refresh_ctl.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => gate.refresh(),
                    _ = ctl.cancelled() => return,
                }
            }
        });
    }

    pub(crate) fn close(&self) -> Result<(), PushError> {
        self.refresh_ctl.cancel();
        self.gate.close()
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.refresh_ctl.cancel();
    }
}

/// Rough wire footprint of a request, used for bandwidth accounting.
/// Counts the method line, host, path, headers and body; cookies and
/// HPACK compression are deliberately ignored.
pub(crate) fn estimated_wire_size(req: &reqwest::Request, body_len: usize) -> u64 {
    let url = req.url();
    let mut size = url.host_str().map(str::len).unwrap_or(0)
        + url.path().len()
        + body_len
        + req.method().as_str().len()
        + 10; // " HTTP/2.0" and the separating space
    for (name, value) in req.headers() {
        size += name.as_str().len() + value.len() + 4; // ": " and "\r\n"
    }
    size as u64
}
