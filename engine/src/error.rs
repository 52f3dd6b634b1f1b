//! Error taxonomy for the engine.
//!
//! Mirrors the propagation policy in the design: per-request errors stay
//! local to the stage that issued the request, `Transport` demotes the
//! connection supervisor, `StoreFailure` on an open-position write also
//! demotes the supervisor and raises an operator alert, and `Invariant`
//! violations are fatal.

use thiserror::Error;

use crate::RequestId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("broker rejected request {req_id}: code={code} msg={msg}")]
    BrokerRejected {
        req_id: RequestId,
        code: i32,
        msg: String,
    },

    #[error("request {req_id:?} timed out")]
    Timeout { req_id: Option<RequestId> },

    #[error("data quality issue: {0}")]
    DataQuality(String),

    #[error("ticker extractor failure: {0}")]
    ExtractorFailure(String),

    #[error("trade store failure: {0}")]
    StoreFailure(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("request {req_id:?} was cancelled")]
    Cancelled { req_id: Option<RequestId> },
}

impl EngineError {
    /// Exit code this error should cause the process to terminate with, if
    /// it is fatal at the top level. `None` means the error is handled
    /// locally and must not terminate the process.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Config(_) => Some(1),
            Self::Invariant(_) => Some(2),
            Self::StoreFailure(_) => Some(3),
            _ => None,
        }
    }
}
