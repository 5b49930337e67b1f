use protocol::ProtocolError;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("permit request failed: {0}")]
    Permit(#[source] ProtocolError),
    #[error("payload read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("permit lease budget spent before the payload was stored")]
    LeaseExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("permit request failed: {0}")]
    Permit(#[source] ProtocolError),
    #[error("downstream transfer failed: {0}")]
    Transfer(#[from] ProtocolError),
    #[error("permit lease budget spent")]
    LeaseExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}
