//! Classification of remote failures into transient and terminal.

use crate::api::ApiError;

/// Transport symptoms matched case-insensitively.
const NETWORK_MARKERS: [&str; 10] = [
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no route to host",
    "timeout",
    "deadline exceeded",
    "context deadline exceeded",
    "connection lost",
    "broken pipe",
    "connection reset by peer",
];

/// Malformed-response symptoms matched case-insensitively. An expired
/// session often yields an HTML login page where a fault body was expected.
const MALFORMED_RESPONSE_MARKERS: [&str; 10] = [
    "tag not matched",
    "expect <fault> but got <html>",
    "expect <fault> but got",
    "unexpected token",
    "xml parsing error",
    "invalid xml",
    "parse error",
    "malformed xml",
    "unexpected element",
    "unexpected end element",
];

/// Authentication and session symptoms matched case-insensitively.
const SESSION_MARKERS: [&str; 8] = [
    "unauthorized",
    "forbidden",
    "authentication failed",
    "session expired",
    "login required",
    "token expired",
    "invalid token",
    "access denied",
];

/// Server-side markers matched case-sensitively.
const SERVER_MARKERS: [&str; 4] = ["HTTP 5", "temporary", "temporarily", "HTTP 429"];

/// Returns `true` when the error is worth a reconnect and retry.
///
/// Authentication errors are always retryable because the usual cause is an
/// expired session. Other errors are classified by [`is_retryable_message`].
#[must_use]
pub fn is_retryable(error: &ApiError) -> bool {
    if matches!(error, ApiError::Auth(_)) {
        return true;
    }
    is_retryable_message(error.message())
}

/// Classifies a raw error message.
///
/// The network, malformed-response and session lists match regardless of
/// case. The server markers (`HTTP 5`, `HTTP 429`, `temporary`,
/// `temporarily`) match only with the exact casing shown.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    let case_insensitive = NETWORK_MARKERS
        .iter()
        .chain(MALFORMED_RESPONSE_MARKERS.iter())
        .chain(SESSION_MARKERS.iter())
        .any(|marker| lowered.contains(marker));

    case_insensitive || SERVER_MARKERS.iter().any(|marker| message.contains(marker))
}
