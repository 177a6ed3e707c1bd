//! Module defining interfaces to native-Rust (external) functions.

use crate::error::EvalError;
use crate::{Symbol, SymbolTable, Value, ValueKind};
use ahash::AHashMap;
use std::fmt;

/// Immutable reference-counted container.  The interpreter is
/// single-threaded; everything shared is shared within one thread.
pub use std::rc::Rc as Shared;

/// Guard for the mutable interior of shared values.
pub use std::cell::RefCell as Locked;

/// Context passed to external functions: the symbol table for name lookups
/// and the global variables of the running program.
pub struct NativeContext<'a> {
    /// The symbol table of the owning engine.
    pub symbols: &'a mut SymbolTable,
    /// The global variables of the owning engine.
    pub globals: &'a mut AHashMap<Symbol, Value>,
}

impl NativeContext<'_> {
    /// Raise a runtime exception from inside an external function.
    #[inline]
    pub fn throw<T>(&self, kind: Symbol, message: impl Into<String>) -> Result<T, Box<EvalError>> {
        Err(EvalError::Raise(kind, message.into()).into())
    }
}

/// A bit-set of [`ValueKind`]s, used for positional argument checks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KindMask(pub u32);

impl KindMask {
    /// Matches any value at all.
    pub const ANY: Self = Self(u32::MAX);

    /// A mask matching exactly one kind.
    #[inline(always)]
    #[must_use]
    pub const fn of(kind: ValueKind) -> Self {
        Self(1 << kind as u32)
    }

    /// Combine two masks.
    #[inline(always)]
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// A mask matching every numeric kind.
    #[must_use]
    pub const fn numeric() -> Self {
        Self::of(ValueKind::Byte)
            .or(Self::of(ValueKind::Int16))
            .or(Self::of(ValueKind::Int32))
            .or(Self::of(ValueKind::Int64))
            .or(Self::of(ValueKind::Int128))
            .or(Self::of(ValueKind::Float32))
            .or(Self::of(ValueKind::Float64))
    }

    /// Does this mask match the given kind?
    #[inline(always)]
    #[must_use]
    pub const fn matches(self, kind: ValueKind) -> bool {
        self.0 & (1 << kind as u32) != 0
    }
}

/// A positional argument check for an external function.
#[derive(Debug, Clone, Copy)]
pub struct ArgCheck {
    /// The kinds acceptable at this position.
    pub mask: KindMask,
    /// The kind named in the error message when the check fails.
    pub expected: ValueKind,
}

/// What a [`StateMachine`] wants the evaluator to do next.
pub enum MachineStep {
    /// Call the given target with the given arguments, then feed the result
    /// back to the state machine.
    Call {
        /// The function (or callable object) to invoke.
        target: Value,
        /// The arguments to pass.
        args: Vec<Value>,
    },
    /// The state machine is finished; this is its result.
    Done(Value),
}

/// An external function that calls back into the evaluator without growing
/// the host stack.
///
/// `map`-like externals take a user-supplied Smile function and invoke it
/// once per element.  Driving those calls by host-level recursion would
/// nest one host frame per element; instead the evaluator parks the state
/// machine on its own frame stack and re-enters [`step`][StateMachine::step]
/// with each sub-call's result.
pub trait StateMachine {
    /// Produce the first step.
    fn start(&mut self, ctx: &mut NativeContext) -> Result<MachineStep, Box<EvalError>>;

    /// Consume one sub-call result and produce the next step.
    fn step(
        &mut self,
        result: Value,
        ctx: &mut NativeContext,
    ) -> Result<MachineStep, Box<EvalError>>;
}

/// The callable part of an [`ExternalFunction`].
pub enum NativeBody {
    /// A plain native call: arguments in, value out.
    Plain(Box<dyn Fn(&mut NativeContext, &[Value]) -> Result<Value, Box<EvalError>>>),
    /// A factory producing a fresh [`StateMachine`] per invocation.
    Stateful(Box<dyn Fn(&[Value]) -> Result<Box<dyn StateMachine>, Box<EvalError>>>),
}

/// A native function exposed to Smile code.
pub struct ExternalFunction {
    /// The name the function reports in errors and stack traces.
    pub name: crate::ImmutableString,
    /// Minimum number of arguments.
    pub min_args: usize,
    /// Maximum number of arguments; 0 means unbounded.
    pub max_args: usize,
    /// Positional type checks, applied when non-empty.
    pub arg_checks: Vec<ArgCheck>,
    /// The native body.
    pub body: NativeBody,
}

impl ExternalFunction {
    /// Construct a plain external function with no argument checks.
    #[must_use]
    pub fn plain(
        name: impl Into<crate::ImmutableString>,
        min_args: usize,
        max_args: usize,
        body: impl Fn(&mut NativeContext, &[Value]) -> Result<Value, Box<EvalError>> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            min_args,
            max_args,
            arg_checks: Vec::new(),
            body: NativeBody::Plain(Box::new(body)),
        }
    }

    /// Construct a state-machine external function.
    #[must_use]
    pub fn stateful(
        name: impl Into<crate::ImmutableString>,
        min_args: usize,
        max_args: usize,
        factory: impl Fn(&[Value]) -> Result<Box<dyn StateMachine>, Box<EvalError>> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            min_args,
            max_args,
            arg_checks: Vec::new(),
            body: NativeBody::Stateful(Box::new(factory)),
        }
    }

    /// Attach positional argument checks.
    #[must_use]
    pub fn with_arg_checks(mut self, checks: Vec<ArgCheck>) -> Self {
        self.arg_checks = checks;
        self
    }

    /// Verify the argument count and positional kinds, producing the
    /// exception message on failure.
    pub fn check_args(&self, args: &[Value]) -> Result<(), String> {
        if args.len() < self.min_args {
            return Err(format!(
                "'{}' requires at least {} argument(s)",
                self.name, self.min_args
            ));
        }
        if self.max_args != 0 && args.len() > self.max_args {
            return Err(format!(
                "'{}' accepts at most {} argument(s)",
                self.name, self.max_args
            ));
        }
        for (index, (arg, check)) in args.iter().zip(self.arg_checks.iter()).enumerate() {
            if !check.mask.matches(arg.kind()) {
                return Err(format!(
                    "argument #{} to '{}' must be {}, not {}",
                    index + 1,
                    self.name,
                    check.expected.name(),
                    arg.kind().name()
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ExternalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalFunction")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish()
    }
}
