//! Lowering errors
//!
//! Failures are fatal for the compilation unit being lowered; the driver
//! reports them and moves on to the next unit. Each carries the owning
//! declaration and an approximate source span where one exists.

use thiserror::Error;
use vesta_frontend::Span;

pub type CodegenResult<T> = Result<T, CodegenError>;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unresolved reference `{name}` in {owner} at {span}")]
    UnresolvedReference {
        name: String,
        owner: String,
        span: Span,
    },

    #[error("unsupported construct ({construct}) in {owner} at {span}")]
    UnsupportedConstruct {
        construct: String,
        owner: String,
        span: Span,
    },

    #[error("type mapping failure: {message}")]
    TypeMapping { message: String },

    #[error("malformed program: {message} at {span}")]
    MalformedProgram { message: String, span: Span },

    #[error("internal consistency error: {message}")]
    Internal { message: String },
}

impl CodegenError {
    /// Shorthand for internal-consistency failures.
    pub fn internal(message: impl Into<String>) -> Self {
        CodegenError::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for type mapping failures.
    pub fn type_mapping(message: impl Into<String>) -> Self {
        CodegenError::TypeMapping {
            message: message.into(),
        }
    }
}
