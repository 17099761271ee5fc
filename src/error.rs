//! Errors raised by the reduction and parameter-binding engines.
use std::fmt;

/// Result type used throughout the evaluator.
pub type EvalResult<T> = Result<T, EvalError>;

#[derive(Debug)]
pub enum EvalError {
    /// Unresolved symbol at leaf lookup.
    BadIdentifier(String),
    /// Malformed literal, or the wrapping kind for nested parameter-tree
    /// failures (the nested error is exposed through `source()`).
    InvalidSyntax {
        message: String,
        nested: Option<Box<EvalError>>,
    },
    /// Attempt to take a persistent reference to a temporary.
    InvalidReference(String),
    /// Operand shape does not fit the formal tree.
    ParameterMismatch(String),
    /// List formal and list operand differ in required count.
    ArityMismatch { expected: usize, actual: usize },
    /// Rest-tail formal, but the operand is shorter than the required
    /// prefix.
    InsufficientTerms(String),
    /// Head of a combined branch is not a combiner.
    ListReductionFailure(String),
    /// A list operand was required.
    ListTypeError(String),
    /// Formal element is neither a symbol nor `#ignore` nor a list.
    FormalParameterType(String),
}

impl EvalError {
    pub fn invalid_syntax(message: impl Into<String>) -> Self {
        EvalError::InvalidSyntax { message: message.into(), nested: None }
    }

    /// Wrap `inner` the way `std::throw_with_nested` would.
    pub fn nested_invalid_syntax(message: impl Into<String>, inner: EvalError) -> Self {
        EvalError::InvalidSyntax { message: message.into(), nested: Some(Box::new(inner)) }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadIdentifier(id) => write!(f, "Unknown identifier '{id}' found."),
            Self::InvalidSyntax { message, .. } => f.write_str(message),
            Self::InvalidReference(msg) => f.write_str(msg),
            Self::ParameterMismatch(msg) => f.write_str(msg),
            Self::ArityMismatch { expected, actual } => write!(
                f,
                "Arity mismatch: expected {expected} operand(s), got {actual}."
            ),
            Self::InsufficientTerms(found) => write!(
                f,
                "Insufficient terms in '{found}' found for the list parameter."
            ),
            Self::ListReductionFailure(msg) => f.write_str(msg),
            Self::ListTypeError(found) => {
                write!(f, "Expected a list, got '{found}'.")
            },
            Self::FormalParameterType(found) => write!(
                f,
                "Expected a symbol or a list for the formal parameter, got '{found}'."
            ),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSyntax { nested: Some(inner), .. } => Some(inner.as_ref()),
            _ => None,
        }
    }
}
