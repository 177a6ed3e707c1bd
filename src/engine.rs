//! Module defining the [`Engine`]: the one handle that owns the symbol
//! table, the global variables, and the registered external functions,
//! threaded through parsing, compiling, and evaluation.

use crate::error::EvalResult;
use crate::error_parsing::ParseMessage;
use crate::native::{ExternalFunction, NativeBody, NativeContext, StateMachine};
use crate::parsescope::{DeclKind, ParseScope};
use crate::token::Lexer;
use crate::value::Function;
use crate::{
    known, Compiler, EvalError, Machine, Parser, Position, Program, Shared, Symbol, SymbolTable,
    Value,
};
use ahash::AHashMap;

/// What a parse produced: the raw-form expression plus any diagnostics.
#[derive(Debug)]
pub struct ParseOutcome {
    /// The raw form (null when the input was empty or unusable).
    pub expr: Value,
    /// Diagnostics, in source order.
    pub messages: Vec<ParseMessage>,
}

impl ParseOutcome {
    /// Did the parse produce no errors?  (Warnings are fine.)
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.messages.iter().any(ParseMessage::is_error)
    }

    /// The expression, or the error messages.
    pub fn into_result(self) -> Result<Value, Vec<ParseMessage>> {
        if self.is_ok() {
            Ok(self.expr)
        } else {
            Err(self.messages)
        }
    }
}

/// The Smile interpreter engine.
///
/// An [`Engine`] holds all the state an evaluation needs: the symbol
/// table, the global closure's variables, and the scope (with its syntax
/// table) that persists between inputs the way a REPL expects.
///
/// # Thread Safety
///
/// The engine is single-threaded by design: evaluation is a synchronous
/// interpreter with no preemption, and nothing in it is `Send` or `Sync`.
///
/// # Example
///
/// ```
/// use smile::{Engine, EvalResult, Value};
///
/// let mut engine = Engine::new();
/// let result = engine.eval("6 * 7", "example.sm").unwrap();
/// assert!(matches!(result, EvalResult::Value(Value::Int64(42))));
/// ```
pub struct Engine {
    pub(crate) symbols: SymbolTable,
    pub(crate) globals: AHashMap<Symbol, Value>,
    scope: ParseScope,
}

impl Engine {
    /// Create an engine with the core globals (`Object`, `List`, `true`,
    /// `false`, `null`) installed.
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Self {
            symbols: SymbolTable::new(),
            globals: AHashMap::new(),
            scope: ParseScope::new_root(),
        };
        engine.install_core_globals();
        engine
    }

    fn install_core_globals(&mut self) {
        let object = Value::object(Value::Null);
        self.set_global_variable(known::OBJECT, object.clone());

        // The List object carries the constructors the parser's quote
        // templates expand into.
        let list = Value::object(object);
        if let Value::Object(cell) = &list {
            let of = ExternalFunction::plain("List.of", 1, 0, |_ctx, args| {
                Ok(Value::list(args[1..].to_vec()))
            });
            let combine = ExternalFunction::plain("List.combine", 1, 0, |ctx, args| {
                let mut items = Vec::new();
                for arg in &args[1..] {
                    match arg {
                        Value::Null => (),
                        Value::List(_) => items.extend(arg.iter_list().cloned()),
                        other => {
                            return ctx.throw(
                                known::NATIVE_METHOD_ERROR,
                                format!(
                                    "'List.combine' requires lists, not a {}",
                                    other.kind().name()
                                ),
                            )
                        }
                    }
                }
                Ok(Value::list(items))
            });
            let mut list_object = cell.borrow_mut();
            list_object.props.insert(
                known::OF,
                Value::Function(Shared::new(Function::External(Shared::new(of)))),
            );
            list_object.props.insert(
                known::COMBINE,
                Value::Function(Shared::new(Function::External(Shared::new(combine)))),
            );
        }
        self.set_global_variable(known::LIST, list);

        self.set_global_variable(known::TRUE_WORD, Value::Bool(true));
        self.set_global_variable(known::FALSE_WORD, Value::Bool(false));
        self.set_global_variable(known::NULL_WORD, Value::Null);
    }

    /// The engine's symbol table.
    #[inline(always)]
    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Intern a name.
    #[inline(always)]
    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    /// Render a raw form in the stable textual notation.
    #[inline(always)]
    #[must_use]
    pub fn stringify(&self, value: &Value) -> String {
        value.stringify(&self.symbols)
    }

    //------------------------------------------------------------------
    // The global-variable protocol.

    /// Set a global variable, declaring it for subsequent parses.  This is
    /// how a REPL maintains `$a`, `$p`, `$e`, and `$_`.
    pub fn set_global_variable(&mut self, symbol: Symbol, value: Value) {
        self.globals.insert(symbol, value);
        self.scope.declare_globals([symbol]);
    }

    /// Read a global variable.
    #[must_use]
    pub fn get_global_variable(&self, symbol: Symbol) -> Option<Value> {
        self.globals.get(&symbol).cloned()
    }

    /// Declare a compile-time constant: references substitute the value
    /// during parsing (the CLI's `-D name=value`).
    pub fn declare_constant(&mut self, name: &str, value: Value) {
        let symbol = self.symbols.intern(name);
        let _ = self
            .scope
            .declare(symbol, DeclKind::Const(value), Position::NONE);
    }

    /// Register an external (native) function as a global.
    pub fn register_external_function(&mut self, external: ExternalFunction) -> Symbol {
        let symbol = self.symbols.intern(external.name.as_str());
        let value = Value::Function(Shared::new(Function::External(Shared::new(external))));
        self.set_global_variable(symbol, value);
        symbol
    }

    /// Register a plain native function under a name.
    pub fn register_fn(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: usize,
        body: impl Fn(&mut NativeContext, &[Value]) -> Result<Value, Box<EvalError>> + 'static,
    ) -> Symbol {
        self.register_external_function(ExternalFunction {
            name: name.into(),
            min_args,
            max_args,
            arg_checks: Vec::new(),
            body: NativeBody::Plain(Box::new(body)),
        })
    }

    /// Register a state-machine native function under a name.
    pub fn register_stateful_fn(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: usize,
        factory: impl Fn(&[Value]) -> Result<Box<dyn StateMachine>, Box<EvalError>> + 'static,
    ) -> Symbol {
        self.register_external_function(ExternalFunction {
            name: name.into(),
            min_args,
            max_args,
            arg_checks: Vec::new(),
            body: NativeBody::Stateful(Box::new(factory)),
        })
    }

    //------------------------------------------------------------------
    // Parse, compile, evaluate.

    /// Parse source text into a raw form.  Declarations and `#syntax`
    /// rules made at the top level persist in the engine for subsequent
    /// parses.
    pub fn parse(&mut self, source: &str, filename: &str) -> ParseOutcome {
        let source = source.strip_prefix('\u{FEFF}').unwrap_or(source);
        let lexer = Lexer::new(source, filename, Position::START);
        let scope = std::mem::take(&mut self.scope);
        let mut parser = Parser::new(lexer, &mut self.symbols, scope);
        let expr = parser.parse_program();
        let messages = parser.messages().to_vec();
        self.scope = parser.into_scope();
        ParseOutcome { expr, messages }
    }

    /// Parse in a detached scope, leaving the engine's own declarations
    /// untouched (used for modules).
    pub(crate) fn parse_detached(
        &mut self,
        source: &str,
        filename: &str,
        scope: ParseScope,
    ) -> ParseOutcome {
        let source = source.strip_prefix('\u{FEFF}').unwrap_or(source);
        let lexer = Lexer::new(source, filename, Position::START);
        let mut parser = Parser::new(lexer, &mut self.symbols, scope);
        let expr = parser.parse_program();
        let messages = parser.into_messages();
        ParseOutcome { expr, messages }
    }

    /// A scope seeded with every global the engine knows, for detached
    /// parses.
    pub(crate) fn fresh_scope(&self) -> ParseScope {
        let mut scope = ParseScope::new_root();
        scope.declare_globals(self.globals.keys().copied());
        scope
    }

    /// Compile a raw form into a program.
    pub fn compile(
        &mut self,
        expr: &Value,
        filename: &str,
    ) -> Result<Shared<Program>, Vec<ParseMessage>> {
        let compiler = Compiler::new(&self.symbols, filename);
        let (program, messages) = compiler.compile_global(expr);
        if messages.iter().any(ParseMessage::is_error) {
            return Err(messages);
        }
        Ok(Shared::new(program))
    }

    /// Parse, compile, and run source text.
    ///
    /// Parse or compile errors come back as `Err`; runtime exceptions and
    /// breakpoint stops are normal [`EvalResult`] outcomes.
    pub fn eval(&mut self, source: &str, filename: &str) -> Result<EvalResult, Vec<ParseMessage>> {
        let outcome = self.parse(source, filename);
        let expr = outcome.into_result()?;
        let program = self.compile(&expr, filename)?;
        Ok(self.run_program(program))
    }

    /// Evaluate source and expect a plain value back.  Exceptions and
    /// breakpoints are reported as error messages; meant for hosts that
    /// have no use for the richer outcomes.
    pub fn eval_value(&mut self, source: &str, filename: &str) -> Result<Value, String> {
        match self.eval(source, filename) {
            Ok(EvalResult::Value(value)) => Ok(value),
            Ok(EvalResult::Exception(exception)) => {
                let message = exception
                    .get_property(known::MESSAGE)
                    .unwrap_or(Value::Null)
                    .to_display(&self.symbols);
                Err(format!("uncaught exception: {}", message))
            }
            Ok(EvalResult::Break(_)) => Err("stopped at breakpoint".to_string()),
            Err(messages) => Err(messages
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }

    /// Run an already-compiled program.
    pub fn run_program(&mut self, program: Shared<Program>) -> EvalResult {
        tracing::debug!(functions = program.functions.len(), "running program");
        Machine::new(program).run(self)
    }
}

impl Default for Engine {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}
