//! Notifications and their routing headers.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};

use crate::payload::Payload;

/// Delivery priority, as defined by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// Deliver at a time that takes power considerations into account.
    /// Such notifications may be grouped and delivered in bursts, and in
    /// some cases not delivered at all.
    Low,
    /// Deliver immediately. Must trigger an alert, sound or badge on the
    /// target device; it is an error to use this priority for a push
    /// carrying only the content-available key.
    High,
}

impl Priority {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Priority::Low => "5",
            Priority::High => "10",
        }
    }
}

/// Routing information shared across notifications.
///
/// Headers are meant to stay immutable once created; the same header can
/// route any number of notifications, which is useful when one message
/// goes out to many recipients.
#[derive(Debug, Default)]
pub struct Header {
    /// The notification topic, typically the app's bundle ID. Required
    /// for token authentication and for certificates with multiple
    /// topics.
    pub topic: String,
    /// Groups multiple notifications into a single one for display.
    /// Must not exceed 64 bytes.
    pub collapse_id: Option<String>,
    /// Delivery priority. Unset lets the gateway default to high.
    pub priority: Option<Priority>,
    /// When the notification is no longer worth delivering. Unset means
    /// the gateway makes a single immediate attempt and discards.
    pub expiration: Option<DateTime<Utc>>,

    wire: OnceLock<Vec<(&'static str, String)>>,
}

impl Header {
    pub fn new(topic: impl Into<String>) -> Self {
        Header {
            topic: topic.into(),
            ..Header::default()
        }
    }

    pub fn collapse_id(mut self, id: impl Into<String>) -> Self {
        self.collapse_id = Some(id.into());
        self
    }

    pub fn priority(mut self, p: Priority) -> Self {
        self.priority = Some(p);
        self
    }

    pub fn expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration = Some(at);
        self
    }

    /// The header list in wire form, computed once per header.
    pub(crate) fn wire_headers(&self) -> &[(&'static str, String)] {
        self.wire.get_or_init(|| {
            let mut hdrs = Vec::with_capacity(4);
            if !self.topic.is_empty() {
                hdrs.push(("apns-topic", self.topic.clone()));
            }
            if let Some(id) = &self.collapse_id {
                hdrs.push(("apns-collapse-id", id.clone()));
            }
            if let Some(p) = self.priority {
                hdrs.push(("apns-priority", p.header_value().to_string()));
            }
            if let Some(exp) = self.expiration {
                hdrs.push(("apns-expiration", exp.timestamp().to_string()));
            }
            hdrs
        })
    }
}

/// The data to push to a recipient plus the routing needed to get it
/// there. Immutable after creation.
#[derive(Debug)]
pub struct Notification {
    /// Canonical UUID identifying the notification. If omitted, the
    /// gateway assigns one and returns it in the response.
    pub apns_id: Option<String>,
    /// Device token of the target, in hexadecimal.
    pub recipient: String,
    /// Shared routing information.
    pub header: Arc<Header>,
    /// The payload delivered to the recipient.
    pub payload: Arc<Payload>,
}

impl Notification {
    pub fn new(
        recipient: impl Into<String>,
        header: Arc<Header>,
        payload: Arc<Payload>,
    ) -> Self {
        Notification {
            apns_id: None,
            recipient: recipient.into(),
            header,
            payload,
        }
    }

    pub fn apns_id(mut self, id: impl Into<String>) -> Self {
        self.apns_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_header_values() {
        assert_eq!(Priority::Low.header_value(), "5");
        assert_eq!(Priority::High.header_value(), "10");
    }

    #[test]
    fn wire_headers_topic_only() {
        let h = Header::new("com.example.Alert");
        assert_eq!(
            h.wire_headers(),
            &[("apns-topic", "com.example.Alert".to_string())]
        );
    }

    #[test]
    fn wire_headers_full_set() {
        let exp = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let h = Header::new("com.example.Alert")
            .collapse_id("game-score")
            .priority(Priority::High)
            .expiration(exp);
        let hdrs = h.wire_headers();
        assert_eq!(hdrs.len(), 4);
        assert!(hdrs.contains(&("apns-collapse-id", "game-score".to_string())));
        assert!(hdrs.contains(&("apns-priority", "10".to_string())));
        assert!(hdrs.contains(&("apns-expiration", exp.timestamp().to_string())));
    }

    #[test]
    fn empty_topic_is_omitted() {
        let h = Header::new("");
        assert!(h.wire_headers().is_empty());
    }

    #[test]
    fn wire_headers_are_cached() {
        let h = Header::new("com.example.Alert");
        let a = h.wire_headers().as_ptr();
        let b = h.wire_headers().as_ptr();
        assert_eq!(a, b);
    }
}
