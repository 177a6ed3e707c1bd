//! Module containing error definitions for the evaluation process.

use crate::{Machine, Symbol, Value};
use std::error::Error;
use std::fmt;

/// An error raised while evaluating bytecode or running a native function.
///
/// Runtime exceptions in Smile are ordinary values (user objects carrying
/// `kind`, `message`, and `stack-trace`); [`EvalError`] is the Rust-side
/// carrier that moves them through `Result` plumbing until the evaluator
/// either finds a handler or surfaces them as
/// [`EvalResult::Exception`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EvalError {
    /// An exception about to be thrown, as a kind symbol plus message.
    /// The evaluator turns this into a full exception object with a stack
    /// trace at the throw site.
    Raise(Symbol, String),
    /// A fully-constructed exception value in flight.
    Exception(Value),
}

impl Error for EvalError {}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise(kind, message) => {
                write!(f, "exception (kind #{}): {}", kind.id(), message)
            }
            Self::Exception(value) => write!(f, "exception: {}", value),
        }
    }
}

impl EvalError {
    /// Shorthand for building a boxed [`EvalError::Raise`].
    #[inline(always)]
    #[must_use]
    pub fn raise(kind: Symbol, message: impl Into<String>) -> Box<Self> {
        Box::new(Self::Raise(kind, message.into()))
    }
}

/// The outcome of running a program.
pub enum EvalResult {
    /// Normal completion.
    Value(Value),
    /// An exception unwound past the last handler.  The value carries
    /// `kind`, `message`, and `stack-trace` properties.
    Exception(Value),
    /// Execution stopped at a breakpoint.  The suspended [`Machine`] holds
    /// everything needed to resume; call [`Machine::run`] again.
    Break(Box<Machine>),
}

impl EvalResult {
    /// The result value, if this is a normal completion.
    #[inline]
    #[must_use]
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Is this a normal completion?
    #[inline]
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

impl fmt::Debug for EvalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Exception(value) => f.debug_tuple("Exception").field(value).finish(),
            Self::Break(_) => f.write_str("Break(..)"),
        }
    }
}
