//! Error types for BOF argument packing, COFF loading and execution.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BofError>;

/// Errors surfaced by the BOF engine.
///
/// Variants fall into three groups: caller-input problems (`InvalidFormat`,
/// `IncompatibleOptions`, `FormatMismatch`) reported before any native
/// interaction; load failures (`MalformedObject` through `EntryNotFound`)
/// where no BOF code has run and all partial allocations have been released;
/// and `UnsupportedPlatform` for hosts without a native loader.
#[derive(Debug, Error)]
pub enum BofError {
    /// The format string contained a character outside `{Z, z, i, s, b}`.
    #[error("invalid format character '{0}', only 'Z', 'z', 'i', 's' and 'b' are permitted")]
    InvalidFormat(char),

    /// `raw` and `format` were both requested.
    #[error("raw cannot be combined with a format string")]
    IncompatibleOptions,

    /// The format string does not describe the supplied argument list.
    #[error("format - args mismatch: {0}")]
    FormatMismatch(String),

    /// The object file is structurally invalid or truncated.
    #[error("malformed COFF object: {0}")]
    MalformedObject(String),

    /// An external symbol could not be resolved against the Beacon API or
    /// any host library.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// The object requires a relocation type this loader does not handle.
    /// Never skipped: a missing relocation means silently-wrong execution.
    #[error("unsupported relocation type: 0x{0:x}")]
    UnsupportedRelocation(u16),

    /// Native memory allocation or protection failed (OS error code).
    #[error("memory allocation failed (os error {0})")]
    AllocationFailed(u32),

    /// The requested entry function is not exported by the object.
    #[error("entry function not found: {0}")]
    EntryNotFound(String),

    /// BOF execution requires a Windows host.
    #[error("BOF execution is only supported on Windows")]
    UnsupportedPlatform,
}

impl BofError {
    /// True for errors the caller can fix by correcting its arguments.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            BofError::InvalidFormat(_) | BofError::IncompatibleOptions | BofError::FormatMismatch(_)
        )
    }

    /// True when the object could not be prepared for execution. No BOF
    /// code has run when one of these surfaces.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            BofError::MalformedObject(_)
                | BofError::UnresolvedSymbol(_)
                | BofError::UnsupportedRelocation(_)
                | BofError::AllocationFailed(_)
                | BofError::EntryNotFound(_)
        )
    }
}
