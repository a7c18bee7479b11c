//! # apns-client
//!
//! Asynchronous client for the Apple Push Notification service: a
//! concurrent HTTP/2 dispatch pipeline that streams notification
//! requests to the gateway at whatever rate the server and local
//! resources sustain, with token or certificate authentication,
//! back-pressure, per-connection stream accounting, retries and a
//! two-stage shutdown.
//!
//! # Architecture
//!
//! Producers hand requests to the [`Client`], which forwards them over
//! an outbound channel to a pool of **streamers**, each owning one
//! HTTP/2 connection and reserving a stream slot per in-flight request.
//! A **governor** samples blocking counters every poll interval and
//! grows or shrinks the pool; a **retry forwarder** loops failed
//! requests back into the submission path without blocking the
//! streamers. Outcomes are delivered to per-request or client-wide
//! channels.
//!
//! ```no_run
//! use std::sync::Arc;
//! use apns_client::{
//!     Aps, CallbackChoice, Client, ClientConfig, Header, JwtSigner, Notification, Payload,
//!     SignerChoice,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = apns_keys::signing_key_from_p8_file("AuthKey_ABC123DEFG.p8")?;
//! let client = Client::new(ClientConfig {
//!     signer: SignerChoice::Jwt(Arc::new(JwtSigner::new("ABC123DEFG", "DEF123GHIJ", key))),
//!     ..ClientConfig::default()
//! });
//! client.start().await?;
//! let notification = Notification::new(
//!     "00fc13adff785122b4ad28809a3420982341241421348097878e577c991de8f0",
//!     Arc::new(Header::new("com.example.Alert")),
//!     Arc::new(Payload::aps(Aps::alert("Ping!"))),
//! );
//! let outcome = client
//!     .push_awaited(notification, SignerChoice::Default, None)
//!     .await?;
//! assert!(outcome.is_accepted());
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
mod client;
pub mod config;
pub mod counters;
mod errors;
mod gate;
mod governor;
mod h2metrics;
mod http;
pub mod notification;
pub mod payload;
pub mod request;
pub mod response;
pub mod scaling;
mod streamer;

pub use auth::{JwtSigner, JwtToken, SignerChoice, DEFAULT_TOKEN_LIFESPAN};
pub use backoff::BackoffTracker;
pub use client::{Client, ClientConfig};
pub use config::{CommsConfig, ProcConfig, RetryPolicy};
pub use errors::{PushError, RequestError};
pub use http::{gateway, REQUEST_ROOT};
pub use notification::{Header, Notification, Priority};
pub use payload::{Alert, AlertValue, Aps, Payload};
pub use request::{CallbackChoice, PushOutcome, Request};
pub use response::{RejectionReason, Response, STATUS_ACCEPTED};
pub use scaling::ScalePolicy;
