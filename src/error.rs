//! Error taxonomy for the response page core.
//!
//! Every boundary converts its failures into one of these types; nothing
//! crosses into the presentation layer as a panic. The split matters for
//! user-visible behavior: a rejected token replaces the whole page, a
//! network error keeps the page and lets the user retry the one control,
//! and a channel fault only marks the data as possibly stale.

use thiserror::Error;

/// Failures of the request/response gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The capability token was rejected. Terminal for this token; the
    /// user needs a fresh link.
    #[error("invalid or expired token: {0}")]
    TokenInvalidOrExpired(String),

    /// Transport-level failure, including timeouts and undecodable
    /// responses. The outcome of the request is unknown; callers may retry
    /// the specific action manually but must not blind-resubmit.
    #[error("network error: {0}")]
    Network(String),

    /// The server understood the request and refused it.
    #[error("request rejected: {0}")]
    ValidationRejected(String),
}

impl GatewayError {
    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        GatewayError::Network(err.to_string())
    }
}

/// Failures of a real-time feed channel.
///
/// Channel faults are surfaced as stale-data risk on the reconciled state,
/// never as a page-fatal error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel connect failed: {0}")]
    Connect(String),

    #[error("channel protocol error: {0}")]
    Protocol(String),

    /// The backend revoked or cancelled the subscription.
    #[error("channel closed by server: {0}")]
    Closed(String),
}

/// Local fast-fail validation for user actions.
///
/// None of these variants involve a gateway round trip; the binding layer
/// converts them to a `false` action result.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The session is not in the `Ready` phase.
    #[error("alert state not loaded")]
    NotReady,

    /// The alert left `active`; submissions are refused client-side even
    /// if a stale view still shows the controls.
    #[error("alert is no longer active")]
    AlertClosed,

    /// Another submission on the same activity channel is in flight.
    #[error("previous submission still in flight")]
    Busy,

    /// Chat content was empty after trimming.
    #[error("message content is empty")]
    EmptyContent,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::TokenInvalidOrExpired("token not found".to_string());
        assert_eq!(err.to_string(), "invalid or expired token: token not found");
    }

    #[test]
    fn test_action_error_wraps_gateway() {
        let err: ActionError = GatewayError::network("connection refused").into();
        assert!(matches!(
            err,
            ActionError::Gateway(GatewayError::Network(_))
        ));
        assert_eq!(err.to_string(), "network error: connection refused");
    }
}
