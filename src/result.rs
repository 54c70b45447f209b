//! Result and error types representing the outcome of compiling a function.

use std::fmt;

/// A compilation error.
///
/// The core has no user-facing errors: anything a user could get wrong is
/// assumed to have been caught by the front end, and internal invariant
/// violations are reported through assertions. What remains are the few
/// ways the public API can reject its input outright.
#[derive(Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// The requested target is not supported.
    Unsupported(String),

    /// An implementation limit was exceeded.
    ///
    /// Basalt reserves the right to refuse programs that stress the
    /// back end beyond what it models, e.g. calls passing more arguments
    /// than fit in registers.
    ImplLimitExceeded(String),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl std::error::Error for CodegenError {}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::ImplLimitExceeded(what) => write!(f, "implementation limit exceeded: {}", what),
        }
    }
}
