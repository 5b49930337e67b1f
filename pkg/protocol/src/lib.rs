//! Wire protocol shared by the aggregator, the permit coordinator and the
//! downstream collector.
//!
//! Control messages are newline-delimited ASCII lines. File payloads switch to
//! exact-length binary framing, with the byte count carried by the preceding
//! `FILE:<name>|SIZE:<n>` header line.

pub mod framing;
pub mod permit;
pub mod transfer;

use thiserror::Error;

pub use framing::{MAX_CONTROL_LINE_BYTES, read_line, write_line};
pub use permit::{
    DEFAULT_LEASE_BUDGET, PermitClient, PermitGuard, PermitOutcome, PermitReply, PermitRequest,
    connect_with_timeout,
};
pub use transfer::{
    Delivery, FileHeader, FileSink, MAX_TRANSFER_FILE_BYTES, SessionSummary, TransferSession,
    serve_transfer_session,
};

pub const READY_LINE: &str = "AGREGADOR_READY";
pub const ACK_LINE: &str = "ACK";
pub const RECEIVED_LINE: &str = "RECEBIDO";
pub const ERROR_LINE: &str = "ERRO";
pub const END_TRANSFER_LINE: &str = "FIM_TRANSFERENCIA";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection while {0}")]
    ConnectionClosed(&'static str),
    #[error("unexpected reply '{got}' (expected {expected})")]
    UnexpectedLine { expected: &'static str, got: String },
    #[error("control line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed file header '{0}'")]
    MalformedHeader(String),
    #[error("file payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },
}
