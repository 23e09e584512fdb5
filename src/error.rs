//! Protocol conditions a caller may want to branch on.
//!
//! These travel inside `anyhow::Error`; recover them with `downcast_ref`.

/// Typed ICSP failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IcspError {
    #[error("write cycle still busy after {polls} status polls")]
    WriteTimeout { polls: usize },
    #[error("bulk erase still busy after {polls} status polls")]
    EraseTimeout { polls: usize },
    #[error("write block must be exactly {expected} bytes, got {len}")]
    BlockSize { len: usize, expected: usize },
    #[error("requested {wanted} response bytes, only {available} captured")]
    ResponseUnderflow { wanted: usize, available: usize },
    #[error("response bytes requested before the transport was flushed")]
    NotFlushed,
}
