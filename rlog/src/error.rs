//! Error types for rlog.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Errors produced by clients, collectors and the backoff policy.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote set holds no addresses.
    #[error("no addresses provided")]
    NoAddresses,

    /// Every dial attempt failed.
    #[error("no live connections")]
    NoLiveConnections,

    /// Another retry cycle is already in flight.
    #[error("backoff is locked")]
    BackoffLocked,

    /// The backoff ceiling was exceeded.
    #[error("failed after numerous retries")]
    FailedRetry,

    /// Address could not be turned into an endpoint.
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Status(#[from] tonic::Status),

    /// The collector answered but did not accept the event.
    #[error("collector rejected event {req_id}: {message}")]
    NotOk { req_id: String, message: String },

    /// The write path dropped the reply channel.
    #[error("no response")]
    NoResponse,

    /// The client or server has been closed.
    #[error("closed")]
    Closed,

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid level code {0}")]
    InvalidLevel(i32),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serve failed: {0}")]
    Serve(String),

    /// A remote's delivery queue is full; the event was dropped for it.
    #[error("queue for {0} is full")]
    QueueFull(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(String),

    /// Several members of a fan-out failed.
    #[error("{}", join_messages(.0))]
    Multi(Vec<Error>),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Combine several errors into one. `None` when the list is empty, the
    /// error itself when there is exactly one.
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multi(errors)),
        }
    }
}

/// Result type for rlog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Sending half of an error channel exposed to the embedding application.
///
/// The channel is bounded; when the application does not drain it, further
/// errors are logged and dropped instead of blocking the transport.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    tx: mpsc::Sender<Error>,
}

impl ErrorSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Error>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn report(&self, error: Error) {
        if let Err(e) = self.tx.try_send(error) {
            match e {
                mpsc::error::TrySendError::Full(error) => {
                    warn!(error = %error, "Error channel full, dropping error")
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_empty_is_none() {
        assert!(Error::combine(vec![]).is_none());
    }

    #[test]
    fn combine_single_returns_it_directly() {
        let err = Error::combine(vec![Error::Closed]).unwrap();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn combine_many_joins_messages() {
        let err = Error::combine(vec![Error::Closed, Error::NoLiveConnections]).unwrap();
        assert!(matches!(err, Error::Multi(ref v) if v.len() == 2));
        assert_eq!(err.to_string(), "closed; no live connections");
    }

    #[tokio::test]
    async fn full_error_channel_drops() {
        let (tx, mut rx) = ErrorSender::channel(1);
        tx.report(Error::Closed);
        tx.report(Error::NoResponse);

        assert!(matches!(rx.recv().await, Some(Error::Closed)));
        assert!(rx.try_recv().is_err());
    }
}
