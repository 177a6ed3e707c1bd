//! Module loading: parsing a self-contained source string in a fresh
//! scope, for hosts that install libraries written in Smile.

use crate::error_parsing::ParseMessage;
use crate::parsescope::DeclKind;
use crate::{Engine, ImmutableString, Position, Value};

/// The result of loading a module.
///
/// The host evaluates `expression` in the global closure to install the
/// module's exports.
#[derive(Debug)]
pub struct ModuleInfo {
    /// The module's name.
    pub name: ImmutableString,
    /// Did the module parse without errors?
    pub ok: bool,
    /// The module's body as a raw form (null when parsing failed badly).
    pub expression: Value,
    /// Diagnostics from the parse.
    pub messages: Vec<ParseMessage>,
}

impl Engine {
    /// Parse a module: a self-contained source string in a fresh root
    /// scope seeded with the engine's globals plus the supplied
    /// externally-declared names.
    ///
    /// Nothing the module declares (including `#syntax` rules) leaks into
    /// the engine's own scope.
    pub fn load_module(&mut self, name: &str, source: &str, externs: &[&str]) -> ModuleInfo {
        let mut scope = self.fresh_scope();
        for &external in externs {
            let symbol = self.symbols.intern(external);
            let _ = scope.declare(symbol, DeclKind::Global, Position::NONE);
        }

        let filename = format!("<module {}>", name);
        let outcome = self.parse_detached(source, &filename, scope);
        let ok = outcome.is_ok();

        ModuleInfo {
            name: name.into(),
            ok,
            expression: outcome.expr,
            messages: outcome.messages,
        }
    }
}
