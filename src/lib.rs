//! # Smile - an embeddable interpreter for the Smile programming language
//!
//! Smile is a dynamically-typed, S-expression-based language with a Lisp-like
//! homoiconic core and a surface syntax that programs can extend with their
//! own grammar rules, declared with `#syntax` right in the source text.
//!
//! This crate contains the language core: the lexer, the extensible
//! recursive-descent parser, the bytecode compiler, and the stack-machine
//! evaluator with its closure model.
//!
//! # A Quick Example
//!
//! ```
//! use smile::{Engine, EvalResult, Value};
//!
//! let mut engine = Engine::new();
//!
//! match engine.eval("if 1 < 2 then 10 else 20", "example.sm").unwrap() {
//!     EvalResult::Value(Value::Int64(n)) => assert_eq!(n, 10),
//!     other => panic!("unexpected result: {:?}", other),
//! }
//! ```
//!
//! Everything an evaluation needs lives in an [`Engine`]: the symbol table,
//! the global variables, and the registered external functions.  Parsing
//! produces a *raw form* (an ordinary [`Value`] tree of lists, pairs,
//! symbols, and literals), the compiler lowers that tree to bytecode, and
//! the evaluator runs the bytecode.

// Internal modules

mod builtin;
mod bytecode;
mod closure;
mod compile;
mod engine;
mod error;
mod error_parsing;
mod eval;
mod immutable_string;
mod module;
mod native;
mod parse;
mod parsescope;
mod symbol;
mod syntax;
mod token;
mod value;

pub use bytecode::{ByteCodeSegment, CompiledFunction, Op, Program, SourceLocation};
pub use closure::{Closure, ClosureInfo, VarInfo, VarKind};
pub use compile::Compiler;
pub use engine::{Engine, ParseOutcome};
pub use error::{EvalError, EvalResult};
pub use error_parsing::{LexError, ParseMessage, Severity};
pub use eval::Machine;
pub use immutable_string::ImmutableString;
pub use module::ModuleInfo;
pub use native::{
    ArgCheck, ExternalFunction, KindMask, MachineStep, NativeBody, NativeContext, StateMachine,
};
pub use parse::Parser;
pub use parsescope::{DeclKind, ParseDecl, ParseScope, ScopeKind};
pub use symbol::{known, Symbol, SymbolTable};
pub use syntax::{Nonterminal, RepeatKind, SyntaxClass, SyntaxNode, SyntaxRule, SyntaxTable};
pub use token::{Lexer, LexerState, Position, StringPart, Token, TokenData};
pub use value::{Cons, Function, Handle, ListIter, Pair, UserObject, Value, ValueKind};

/// Alias to [`Rc`][std::rc::Rc], the reference-counted container used for
/// all shared values in the interpreter.  The evaluator is single-threaded
/// by design; see the concurrency notes on [`Engine`].
pub use native::Shared;

/// Alias to [`RefCell`][std::cell::RefCell], guarding the mutable interior
/// of shared values (user objects, closures).
pub use native::Locked;

/// An identifier in Smile source text.
/// [`SmartString`](https://crates.io/crates/smartstring) is used because most
/// identifiers are ASCII and short, so they can be stored inline.
pub(crate) type Identifier = SmartString;

/// Variable-sized array of items, backed by inline storage when there are
/// four or fewer of them.  Argument lists, pattern captures, and scope
/// chains are almost always that small.
pub(crate) type StaticVec<T> = smallvec::SmallVec<[T; 4]>;

pub(crate) type SmartString = smartstring::SmartString<smartstring::Compact>;
