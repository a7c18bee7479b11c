//! The in-flight request envelope and the outcome delivered back.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::SignerChoice;
use crate::errors::PushError;
use crate::notification::Notification;
use crate::response::{Response, STATUS_ACCEPTED};

/// Where the outcome of a push goes.
///
/// `Default` defers to the client-wide callback channel and `None`
/// silently discards the outcome.
#[derive(Clone, Debug, Default)]
pub enum CallbackChoice {
    #[default]
    Default,
    None,
    Channel(mpsc::Sender<PushOutcome>),
}

/// Everything needed to submit one notification to the gateway.
/// Requests can be handed to [`Client::push`] or written to the client's
/// queue directly.
///
/// The attempt counter is the only mutable part and is advanced by the
/// streamer between attempts.
///
/// [`Client::push`]: crate::Client::push
#[derive(Debug)]
pub struct Request {
    /// The notification to push.
    pub notification: Arc<Notification>,
    /// Per-request signer; `Default` uses the client's signer.
    pub signer: SignerChoice,
    /// Cancellation for this request. Fires before dispatch: the push is
    /// abandoned with a cancellation error. Fires mid-flight: the HTTP
    /// request is aborted.
    pub cancel: Option<CancellationToken>,
    /// Per-request result channel; `Default` uses the client's.
    pub callback: CallbackChoice,

    pub(crate) attempts: u32,
}

impl Request {
    pub fn new(notification: Arc<Notification>) -> Self {
        Request {
            notification,
            signer: SignerChoice::Default,
            cancel: None,
            callback: CallbackChoice::Default,
            attempts: 0,
        }
    }

    pub fn signer(mut self, signer: SignerChoice) -> Self {
        self.signer = signer;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn callback(mut self, callback: CallbackChoice) -> Self {
        self.callback = callback;
        self
    }

    /// Whether this request carries its own signing decision rather than
    /// deferring to the client.
    pub fn has_signer(&self) -> bool {
        !self.signer.is_default()
    }
}

/// The outcome of an asynchronous push: the original notification along
/// with either a gateway response, an error, or (rarely) both.
///
/// A present response means a round-trip completed; its status still
/// needs examining. A nil response with an error means the push failed
/// before or during transport.
#[derive(Debug)]
pub struct PushOutcome {
    /// The notification this outcome is for.
    pub notification: Arc<Notification>,
    /// The one-off signer supplied with the push request, if any.
    pub signer: SignerChoice,
    /// The cancellation token supplied with the push request, if any.
    pub cancel: Option<CancellationToken>,
    /// The gateway's response, when a round-trip completed.
    pub response: Option<Response>,
    /// The error encountered, when one was.
    pub error: Option<PushError>,
}

impl PushOutcome {
    /// Whether the notification was accepted by the gateway.
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
            && matches!(&self.response, Some(r) if r.status == STATUS_ACCEPTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Header;
    use crate::payload::{Aps, Payload};

    fn notification() -> Arc<Notification> {
        Arc::new(Notification::new(
            "00fc13adff785122b4ad28809a3420982341241421348097878e577c991de8f0",
            Arc::new(Header::new("com.example.Alert")),
            Arc::new(Payload::aps(Aps::alert("Ping!"))),
        ))
    }

    #[test]
    fn new_request_defaults() {
        let req = Request::new(notification());
        assert!(req.signer.is_default());
        assert!(req.cancel.is_none());
        assert!(matches!(req.callback, CallbackChoice::Default));
        assert_eq!(req.attempts, 0);
        assert!(!req.has_signer());
    }

    #[test]
    fn explicit_no_signer_counts_as_a_choice() {
        let req = Request::new(notification()).signer(SignerChoice::None);
        assert!(req.has_signer());
    }

    #[test]
    fn outcome_accepted() {
        let ok = PushOutcome {
            notification: notification(),
            signer: SignerChoice::Default,
            cancel: None,
            response: Some(Response {
                apns_id: None,
                status: 200,
                rejection_reason: None,
                unsubscribed_at: None,
            }),
            error: None,
        };
        assert!(ok.is_accepted());
    }

    #[test]
    fn outcome_with_error_is_not_accepted() {
        let failed = PushOutcome {
            notification: notification(),
            signer: SignerChoice::Default,
            cancel: None,
            response: Some(Response {
                apns_id: None,
                status: 200,
                rejection_reason: None,
                unsubscribed_at: None,
            }),
            error: Some(PushError::Canceled),
        };
        assert!(!failed.is_accepted());
    }
}
