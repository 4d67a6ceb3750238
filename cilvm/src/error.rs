use thiserror::Error;

use crate::{ManagedException, StackItemKind};

/// Errors surfaced by the execution engine.
///
/// Only [`VmError::Exception`] takes part in exception-region searches. Every
/// other variant is a fatal defect (malformed bytecode, exhausted resources,
/// missing natives) that unwinds straight to the host.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("managed exception in flight: {0}")]
    Exception(ManagedException),

    #[error("unhandled exception {type_name}: {}", message.as_deref().unwrap_or("<no message>"))]
    Unhandled {
        type_name: String,
        message: Option<String>,
        trace: Vec<String>,
    },

    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("expected {expected} on the operand stack, found {found:?}")]
    StackTypeMismatch {
        expected: &'static str,
        found: StackItemKind,
    },

    #[error("unimplemented instruction `{0}`")]
    Unimplemented(&'static str),

    #[error("no internal implementation registered for `{0}`")]
    MissingInternalCall(String),

    #[error("bad metadata token {0:#010x}")]
    BadToken(u32),

    #[error(
        "stack allocator exhausted ({requested} bytes requested, {available} available)"
    )]
    StackOverflow { requested: usize, available: usize },

    #[error("call depth limit of {0} frames exceeded")]
    CallDepthExceeded(usize),

    #[error("heap exhausted ({requested} bytes requested)")]
    OutOfMemory { requested: usize },
}

impl VmError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidProgram(reason.into())
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Exception(_))
    }
}

/// Failures of the pure numeric helpers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArithmeticError {
    Overflow,
    DivideByZero,
    NotFinite,
    InvalidOperands,
}

/// Exception kinds the engine raises on its own behalf.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeFailure {
    NullReference,
    InvalidCast,
    IndexOutOfRange,
    DivideByZero,
    Overflow,
    Arithmetic,
    NotFiniteNumber,
    ArrayTypeMismatch,
}

impl RuntimeFailure {
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NullReference => "Object reference not set to an instance of an object.",
            Self::InvalidCast => "Specified cast is not valid.",
            Self::IndexOutOfRange => "Index was outside the bounds of the array.",
            Self::DivideByZero => "Attempted to divide by zero.",
            Self::Overflow => "Arithmetic operation resulted in an overflow.",
            Self::Arithmetic => "Overflow or underflow in the arithmetic operation.",
            Self::NotFiniteNumber => "Number encountered was not a finite quantity.",
            Self::ArrayTypeMismatch => {
                "Attempted to access an element as a type incompatible with the array."
            }
        }
    }
}

impl From<ArithmeticError> for RuntimeFailure {
    fn from(value: ArithmeticError) -> Self {
        match value {
            ArithmeticError::Overflow => Self::Overflow,
            ArithmeticError::DivideByZero => Self::DivideByZero,
            ArithmeticError::NotFinite => Self::NotFiniteNumber,
            // operand kinds are checked before any arithmetic helper runs
            ArithmeticError::InvalidOperands => Self::InvalidCast,
        }
    }
}
