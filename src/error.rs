//! Error types for the AI-CPU scheduler.
//!
//! Two layers: [`DrvError`] is what the opaque driver boundary reports, and
//! [`SchedError`] is what every scheduler operation returns. Every
//! `SchedError` maps to a 16-bit result code via [`SchedError::code`], which
//! is the only form an error takes once it crosses the TS boundary.

use std::io;
use thiserror::Error;

use crate::constants::codes;

/// Status reported by the driver capability interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DrvError {
    /// Transient condition; the caller may retry.
    #[error("driver busy, retry later")]
    Retryable,

    /// Bounded wait elapsed without an event.
    #[error("wait timed out")]
    Timeout,

    /// Poll found nothing pending.
    #[error("no event pending")]
    NoEvent,

    /// The process is being torn down by the driver.
    #[error("process exiting")]
    ProcessExit,

    /// The driver rejected a parameter.
    #[error("invalid parameter")]
    ParaError,

    /// An event was delivered to a CPU outside the scheduler's set.
    #[error("event delivered on illegal cpu")]
    IllegalCpu,

    /// The resource was already set up (attach, subscribe).
    #[error("already done")]
    Repeated,

    /// Any other driver failure, carrying the raw driver code.
    #[error("driver failure (code {0})")]
    Fatal(i32),
}

impl DrvError {
    /// Whether a polling caller should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DrvError::Retryable | DrvError::Timeout | DrvError::NoEvent)
    }
}

/// Convenience alias for driver results.
pub type DrvResult<T> = std::result::Result<T, DrvError>;

/// Primary error type for the scheduler.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Fatal startup failure (topology query, thread or affinity setup).
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// A driver call failed.
    #[error("driver error: {0}")]
    Drv(#[from] DrvError),

    /// Event kind has no handler.
    #[error("event kind {0} not found")]
    NotFoundEvent(u32),

    /// Control command has no handler.
    #[error("command type {0} not found")]
    NotFoundCmdType(u32),

    /// Negotiated protocol version has no decoder.
    #[error("message version {0} not supported")]
    NotFoundVersion(u16),

    /// Stale or unknown model id.
    #[error("model {0} not found")]
    ModelNotFound(u32),

    /// Stream id is not registered to any model.
    #[error("stream {0} not found")]
    StreamNotFound(u32),

    /// Argument out of range or malformed payload.
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    /// Version negotiation carried a bad magic number.
    #[error("invalid magic number {0:#06x}")]
    InvalidMagic(u16),

    /// A second waiter tried to register on an occupied wait id.
    #[error("wait id {id} already has waiter stream {existing}, rejected stream {requested}")]
    WaitConflict {
        id: usize,
        existing: u32,
        requested: u32,
    },

    /// Fixed-capacity resource is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The kernel boundary returned a non-zero result.
    #[error("kernel execution failed with code {0}")]
    KernelFailed(i32),

    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Inner(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedError {
    /// Result code reported to TS for this error.
    pub fn code(&self) -> u16 {
        match self {
            SchedError::InitFailed(_) => codes::INIT_FAILED,
            SchedError::Drv(_) => codes::DRV_ERR,
            SchedError::NotFoundEvent(_) => codes::NOT_FOUND_EVENT,
            SchedError::NotFoundCmdType(_) => codes::NOT_FOUND_CMD_TYPE,
            SchedError::NotFoundVersion(_) => codes::NOT_FOUND_VERSION,
            SchedError::ModelNotFound(_) => codes::MODEL_NOT_FOUND,
            SchedError::StreamNotFound(_) => codes::STREAM_NOT_FOUND,
            SchedError::ParameterInvalid(_) => codes::PARAMETER_INVALID,
            SchedError::InvalidMagic(_) => codes::INVALID_MAGIC_NUM,
            SchedError::WaitConflict { .. } => codes::PARAMETER_INVALID,
            SchedError::ResourceExhausted(_) => codes::RESOURCE_EXHAUSTED,
            SchedError::KernelFailed(_) => codes::KERNEL_FAILED,
            SchedError::Inner(_)
            | SchedError::Config(_)
            | SchedError::Io(_)
            | SchedError::Json(_) => codes::INNER_ERROR,
        }
    }
}

/// Convenience type alias for Results with SchedError.
pub type Result<T> = std::result::Result<T, SchedError>;

/// Maps a handler outcome to the result code sent to TS.
pub fn result_code<T>(result: &Result<T>) -> u16 {
    match result {
        Ok(_) => codes::OK,
        Err(e) => e.code(),
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to the error.
    fn with_static_context(self, context: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| SchedError::Inner(format!("{}: {}", f(), e)))
    }

    fn with_static_context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| SchedError::Inner(format!("{}: {}", context, e)))
    }
}
