//! Error types surfaced to the application.

/// Errors delivered to a request callback.
///
/// Network failures are never surfaced: the client retries forever until a
/// valid reply arrives. The only application-visible error is local
/// backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The request queue is full; the request was not enqueued.
    #[error("too many outstanding requests")]
    TooManyOutstandingRequests,
}
