use async_trait::async_trait;
use thiserror::Error;

use super::document::RawSnapshot;

/// Failure talking to the remote document store. Aborts the whole operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),
    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed remote document: {0}")]
    Malformed(String),
}

/// Full read/write of the remote snapshot document.
///
/// Implementations own their timeouts and cancellation; callers treat any
/// error as a whole-operation abort and never retry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot, TransportError>;

    /// Overwrite the whole remote document.
    async fn put_snapshot(&self, snapshot: RawSnapshot) -> Result<(), TransportError>;

    async fn check_connection(&self) -> Result<(), TransportError> {
        self.fetch_snapshot().await.map(|_| ())
    }
}
