//! Classification of transport faults at the HTTP/2 layer.
//!
//! The stream gate needs to know when the peer refuses a stream (its
//! MAX_CONCURRENT_STREAMS is lower than assumed) or tears the connection
//! down. Those signals are not part of `reqwest`'s surface, but the
//! underlying `h2` error is reachable through the standard error source
//! chain and carries the reset reason.

use std::error::Error as StdError;

use h2::Reason;

/// What a transport error says about the HTTP/2 connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransportFault {
    /// The peer reset an individual stream; the connection survives.
    StreamReset(Reason),
    /// The peer is closing the connection.
    GoAway,
    /// The connection itself failed (dial, timeout, broken transport).
    Connection,
    /// Nothing HTTP/2-specific could be recovered.
    Other,
}

pub(crate) fn classify(err: &reqwest::Error) -> TransportFault {
    if let Some(h2err) = find_h2(err) {
        return classify_h2(h2err);
    }
    if err.is_connect() || err.is_timeout() {
        TransportFault::Connection
    } else {
        TransportFault::Other
    }
}

/// Whether the error is the peer refusing a stream over its concurrency
/// limit.
pub(crate) fn is_stream_refused(err: &reqwest::Error) -> bool {
    match classify(err) {
        TransportFault::StreamReset(reason) => reason == Reason::REFUSED_STREAM,
        _ => false,
    }
}

fn classify_h2(err: &h2::Error) -> TransportFault {
    classify_parts(err.is_go_away(), err.is_reset(), err.reason())
}

/// Classification from an error's observable parts. `h2` has no public
/// constructor for go-away or reset errors, so the extraction above
/// stays a thin shim over this.
fn classify_parts(go_away: bool, reset: bool, reason: Option<Reason>) -> TransportFault {
    if go_away {
        return TransportFault::GoAway;
    }
    if reset {
        return TransportFault::StreamReset(reason.unwrap_or(Reason::CANCEL));
    }
    // A REFUSED_STREAM reason is stream-scoped even when the library
    // reports it without reset-frame context.
    if reason == Some(Reason::REFUSED_STREAM) {
        return TransportFault::StreamReset(Reason::REFUSED_STREAM);
    }
    TransportFault::Connection
}

fn find_h2(err: &reqwest::Error) -> Option<&h2::Error> {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(h2err) = e.downcast_ref::<h2::Error>() {
            return Some(h2err);
        }
        source = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goaway_wins_over_everything() {
        assert_eq!(
            classify_parts(true, true, Some(Reason::REFUSED_STREAM)),
            TransportFault::GoAway
        );
        assert_eq!(classify_parts(true, false, None), TransportFault::GoAway);
    }

    #[test]
    fn resets_keep_their_reason() {
        assert_eq!(
            classify_parts(false, true, Some(Reason::REFUSED_STREAM)),
            TransportFault::StreamReset(Reason::REFUSED_STREAM)
        );
        assert_eq!(
            classify_parts(false, true, Some(Reason::STREAM_CLOSED)),
            TransportFault::StreamReset(Reason::STREAM_CLOSED)
        );
        assert_eq!(
            classify_parts(false, true, None),
            TransportFault::StreamReset(Reason::CANCEL)
        );
    }

    #[test]
    fn bare_reasons_are_connection_faults_except_refusal() {
        assert_eq!(
            classify_parts(false, false, Some(Reason::REFUSED_STREAM)),
            TransportFault::StreamReset(Reason::REFUSED_STREAM)
        );
        assert_eq!(
            classify_parts(false, false, Some(Reason::PROTOCOL_ERROR)),
            TransportFault::Connection
        );
        assert_eq!(classify_parts(false, false, None), TransportFault::Connection);
    }

    #[test]
    fn synthetic_h2_errors() {
        let refused = h2::Error::from(Reason::REFUSED_STREAM);
        assert_eq!(
            classify_h2(&refused),
            TransportFault::StreamReset(Reason::REFUSED_STREAM)
        );

        let protocol = h2::Error::from(Reason::PROTOCOL_ERROR);
        assert_eq!(classify_h2(&protocol), TransportFault::Connection);

        let io = h2::Error::from(h2::proto::Error::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe gone",
        )));
        assert_eq!(classify_h2(&io), TransportFault::Connection);
    }

    #[test]
    fn non_h2_errors_are_opaque() {
        // A request-construction error carries no h2 source and is
        // neither a connect nor a timeout failure.
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert_eq!(classify(&err), TransportFault::Other);
        assert!(!is_stream_refused(&err));
    }

    #[tokio::test]
    async fn refused_stream_classified_through_the_full_chain() {
        // A gateway that refuses every stream; the refusal must survive
        // the reqwest -> hyper -> h2 error chain.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(mut conn) = h2::server::handshake(stream).await {
                        while let Some(Ok((_request, mut respond))) = conn.accept().await {
                            respond.send_reset(Reason::REFUSED_STREAM);
                        }
                    }
                });
            }
        });

        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap();
        let err = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap_err();
        assert!(is_stream_refused(&err), "unexpected error: {err:?}");
        assert_eq!(
            classify(&err),
            TransportFault::StreamReset(Reason::REFUSED_STREAM)
        );
    }
}
