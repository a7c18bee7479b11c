//! Gateway responses and the rejection reasons they can carry.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Status code for an accepted notification.
pub const STATUS_ACCEPTED: u16 = 200;

/// Rejection reasons returned by the gateway, from the Apple Local and
/// Remote Notification Programming Guide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// 400 The collapse identifier exceeds the maximum allowed size.
    BadCollapseId,
    /// 400 The specified device token was bad. Verify that the request
    /// contains a valid token and that the token matches the environment.
    BadDeviceToken,
    /// 400 The apns-expiration value is bad.
    BadExpirationDate,
    /// 400 The apns-id value is bad.
    BadMessageId,
    /// 400 The apns-priority value is bad.
    BadPriority,
    /// 400 The apns-topic was invalid.
    BadTopic,
    /// 400 The device token does not match the specified topic.
    DeviceTokenNotForTopic,
    /// 400 One or more headers were repeated.
    DuplicateHeaders,
    /// 400 Idle time out.
    IdleTimeout,
    /// 400 The device token is not specified in the request path.
    MissingDeviceToken,
    /// 400 The apns-topic header was required but not specified.
    MissingTopic,
    /// 400 The message payload was empty.
    PayloadEmpty,
    /// 400 Pushing to this topic is not allowed.
    TopicDisallowed,
    /// 403 The certificate was bad.
    BadCertificate,
    /// 403 The client certificate was for the wrong environment.
    BadCertificateEnvironment,
    /// 403 The provider token is stale and a new token should be
    /// generated.
    ExpiredProviderToken,
    /// 403 The specified action is not allowed.
    Forbidden,
    /// 403 The provider token is not valid or its signature could not be
    /// verified.
    InvalidProviderToken,
    /// 403 No provider certificate was used to connect and the
    /// authorization header was missing or carried no provider token.
    MissingProviderToken,
    /// 404 The request contained a bad path.
    BadPath,
    /// 405 The specified method was not POST.
    MethodNotAllowed,
    /// 410 The device token is inactive for the specified topic.
    Unregistered,
    /// 413 The message payload was too large.
    PayloadTooLarge,
    /// 429 The provider token is being updated too often.
    TooManyProviderTokenUpdates,
    /// 429 Too many requests were made consecutively to the same device
    /// token.
    TooManyRequests,
    /// 500 An internal server error occurred.
    InternalServerError,
    /// 503 The service is unavailable.
    ServiceUnavailable,
    /// 503 The server is shutting down.
    Shutdown,
}

/// Outcome of one round-trip to the gateway: whether the notification was
/// accepted and any accompanying data. Immutable.
#[derive(Clone, Debug)]
pub struct Response {
    /// The apns-id from the notification, or the gateway-assigned UUID
    /// if none was set.
    pub apns_id: Option<String>,
    /// HTTP status returned by the gateway; 200 means the notification
    /// was accepted.
    pub status: u16,
    /// Why the push was rejected, when it was.
    pub rejection_reason: Option<RejectionReason>,
    /// For status 410, the last time the gateway confirmed the device
    /// token was no longer valid for the topic.
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl Response {
    /// Whether the notification was accepted; the same as checking for
    /// status 200.
    pub fn is_accepted(&self) -> bool {
        self.status == STATUS_ACCEPTED
    }
}

/// JSON body attached to rejection responses.
#[derive(Debug, Deserialize)]
pub(crate) struct ResponseBody {
    pub(crate) reason: Option<RejectionReason>,
    /// Epoch milliseconds; present only on 410 responses.
    pub(crate) timestamp: Option<i64>,
}

impl ResponseBody {
    pub(crate) fn unsubscribed_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}
