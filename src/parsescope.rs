//! Module defining lexical name resolution during parsing.

use crate::syntax::SyntaxTable;
use crate::{Position, Shared, Symbol, Value};
use ahash::AHashMap;

/// What kind of lexical region a scope frame covers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScopeKind {
    /// The outermost scope of a parse.
    Root,
    /// A function body (`|args| ...`).
    Function,
    /// A `{ ... }` statement block.
    Block,
    /// A `till ... do` body, where flags are in scope.
    Till,
    /// The replacement side of a `#syntax` declaration, where the
    /// pattern's captured variables are in scope.
    Syntax,
}

/// What a name is declared as.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclKind {
    /// A global variable.
    Global,
    /// A function argument.
    Argument,
    /// A local variable.
    Variable,
    /// A till-loop exit flag; only valid inside a `$till` body.
    TillFlag,
    /// A compile-time constant; references substitute the value directly.
    Const(Value),
    /// A captured nonterminal variable inside a syntax-rule replacement.
    SyntaxNonterminal,
}

/// One declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseDecl {
    /// What the name is.
    pub kind: DeclKind,
    /// Where it was declared.
    pub pos: Position,
}

#[derive(Debug, Clone)]
struct ScopeFrame {
    kind: ScopeKind,
    decls: AHashMap<Symbol, ParseDecl>,
    syntax: Shared<SyntaxTable>,
}

/// The scope chain active at a point in the parse.
///
/// A [`ParseScope`] owns the whole chain as a stack of frames; pushing a
/// child frame and popping it later brackets a lexical region.  Each frame
/// captures the syntax table in effect when it was created; `#syntax`
/// declarations mutate the innermost frame's table, copy-on-write, so
/// outer regions never observe rules declared in inner ones.
///
/// The whole chain is cheaply cloneable, which is what the parser's
/// speculative rule matching uses to roll back declarations.
#[derive(Debug, Clone)]
pub struct ParseScope {
    frames: Vec<ScopeFrame>,
}

impl ParseScope {
    /// Create a root scope with the default syntax table.
    #[must_use]
    pub fn new_root() -> Self {
        Self::with_syntax(Shared::new(SyntaxTable::new()))
    }

    /// Create a root scope over an existing syntax table.
    #[must_use]
    pub fn with_syntax(syntax: Shared<SyntaxTable>) -> Self {
        Self {
            frames: vec![ScopeFrame {
                kind: ScopeKind::Root,
                decls: AHashMap::new(),
                syntax,
            }],
        }
    }

    /// Open a child scope.  The child inherits (shares) the current syntax
    /// table.
    pub fn push(&mut self, kind: ScopeKind) {
        let syntax = self.frames.last().expect("scope chain is never empty").syntax.clone();
        self.frames.push(ScopeFrame {
            kind,
            decls: AHashMap::new(),
            syntax,
        });
    }

    /// Close the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics if only the root remains.
    pub fn pop(&mut self) {
        assert!(self.frames.len() > 1, "cannot pop the root scope");
        self.frames.pop();
    }

    /// How deep the chain currently is.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The kind of the innermost scope.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        self.frames.last().expect("scope chain is never empty").kind
    }

    /// Declare a name in the innermost scope.  Fails if the name is
    /// already declared there, except that a `Global` may be re-asserted
    /// as a `Global`.
    pub fn declare_here(
        &mut self,
        symbol: Symbol,
        kind: DeclKind,
        pos: Position,
    ) -> Result<(), ParseDecl> {
        let frame = self.frames.last_mut().expect("scope chain is never empty");
        if let Some(existing) = frame.decls.get(&symbol) {
            if existing.kind == DeclKind::Global && kind == DeclKind::Global {
                return Ok(());
            }
            return Err(existing.clone());
        }
        frame.decls.insert(symbol, ParseDecl { kind, pos });
        Ok(())
    }

    /// Declare a name in the nearest function (or root) scope, the way
    /// `var` does from inside nested blocks.
    pub fn declare(
        &mut self,
        symbol: Symbol,
        kind: DeclKind,
        pos: Position,
    ) -> Result<(), ParseDecl> {
        let index = self
            .frames
            .iter()
            .rposition(|frame| matches!(frame.kind, ScopeKind::Function | ScopeKind::Root))
            .expect("scope chain always has a root");
        let frame = &mut self.frames[index];
        if let Some(existing) = frame.decls.get(&symbol) {
            if existing.kind == DeclKind::Global && kind == DeclKind::Global {
                return Ok(());
            }
            return Err(existing.clone());
        }
        frame.decls.insert(symbol, ParseDecl { kind, pos });
        Ok(())
    }

    /// Find a declaration, walking outward through the chain.
    #[must_use]
    pub fn find(&self, symbol: Symbol) -> Option<&ParseDecl> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.decls.get(&symbol))
    }

    /// Find a declaration in the innermost scope only.
    #[must_use]
    pub fn find_here(&self, symbol: Symbol) -> Option<&ParseDecl> {
        self.frames
            .last()
            .expect("scope chain is never empty")
            .decls
            .get(&symbol)
    }

    /// Bulk-import names as globals (REPL startup: every variable of the
    /// global closure becomes visible to the parse).
    pub fn declare_globals(&mut self, symbols: impl IntoIterator<Item = Symbol>) {
        let frame = self.frames.first_mut().expect("scope chain is never empty");
        for symbol in symbols {
            frame.decls.entry(symbol).or_insert(ParseDecl {
                kind: DeclKind::Global,
                pos: Position::NONE,
            });
        }
    }

    /// The syntax table in effect in the innermost scope.
    #[inline]
    #[must_use]
    pub fn syntax_table(&self) -> &Shared<SyntaxTable> {
        &self.frames.last().expect("scope chain is never empty").syntax
    }

    /// Mutate the innermost scope's syntax table, cloning it first if it
    /// is shared with an outer scope (copy-on-write).
    pub fn syntax_table_mut(&mut self) -> &mut SyntaxTable {
        let frame = self.frames.last_mut().expect("scope chain is never empty");
        if Shared::strong_count(&frame.syntax) > 1 {
            frame.syntax = Shared::new((*frame.syntax).clone());
        }
        Shared::get_mut(&mut frame.syntax).expect("syntax table was just unshared")
    }
}

impl Default for ParseScope {
    #[inline(always)]
    fn default() -> Self {
        Self::new_root()
    }
}
