//! Module defining the recursive-descent parser.
//!
//! The parser turns a token stream into a *raw form*: a [`Value`] tree of
//! lists, pairs, symbols, and literals rooted at the special forms (`$if`,
//! `$fn`, `$progn`, ...).  Its nonterminals are organized by precedence:
//!
//! ```text
//! STMT > EXPR > OREXPR > ANDEXPR > NOTEXPR > CMPEXPR > ADDEXPR > MULEXPR
//!      > BINARYEXPR > COLONEXPR > RANGEEXPR > PREFIXEXPR > CONSEXPR
//!      > DOTEXPR > TERM
//! ```
//!
//! Before entering the built-in logic for a well-known precedence class,
//! the parser consults the syntax table for user rules and speculatively
//! matches them with unlimited lookahead, snapshotting the lexer and scope
//! and rolling back on failure.

use crate::error_parsing::ParseMessage;
use crate::parsescope::{DeclKind, ParseScope, ScopeKind};
use crate::syntax::{
    expand_template, Nonterminal, RepeatKind, SyntaxNode, SyntaxRule, SyntaxTable,
};
use crate::token::{Lexer, LexerState, StringPart, Token, TokenData};
use crate::{known, Position, Shared, Symbol, SymbolTable, Value};
use ahash::AHashMap;

/// Statement keywords, which never act as operands or operators.
const KEYWORDS: &[&str] = &[
    "if", "unless", "then", "else", "while", "until", "do", "till", "when", "try", "catch",
    "return", "var", "new", "typeof", "and", "or", "not", "is",
];

/// The built-in comparison operators (CMPEXPR level).
const CMP_OPS: &[&str] = &["<", ">", "<=", ">=", "==", "!="];

/// Punctuation with reserved meaning, never an arbitrary operator.
const RESERVED_PUNCT: &[&str] = &["=", "=>", "===", "!=="];

#[inline]
fn is_keyword(text: &str) -> bool {
    KEYWORDS.contains(&text)
}

/// Context flags threaded through the precedence cascade.
#[derive(Debug, Clone, Copy)]
struct Flags {
    /// May a binary operator appear as the first token on a line?
    /// True inside balanced `()`/`[]`/`{}` pairs.
    line_breaks: bool,
    /// May alphabetic names act as binary/prefix operators?  False inside
    /// explicit `[...]` forms and object-member values.
    alpha_ops: bool,
    /// Is `:` (the index operator) available?  False in object-member
    /// values, where `:` separates members.
    colon: bool,
    /// Inside a quoted form: names stay symbols instead of resolving
    /// against the scope.  (Declarations still steer the prefix-operator
    /// heuristic, so the containing scope influences quoted trees.)
    quoted: bool,
    /// Must names in operand position be declared?  True in ordinary
    /// expression code; false inside explicit `[...]` forms, which are
    /// data as much as they are calls.
    resolve: bool,
}

impl Flags {
    const TOP: Self = Self {
        line_breaks: false,
        alpha_ops: true,
        colon: true,
        quoted: false,
        resolve: true,
    };

    fn grouped(self) -> Self {
        Self {
            line_breaks: true,
            alpha_ops: true,
            colon: true,
            quoted: self.quoted,
            resolve: self.resolve,
        }
    }

    fn listed(self) -> Self {
        Self {
            line_breaks: true,
            alpha_ops: false,
            colon: true,
            quoted: self.quoted,
            resolve: false,
        }
    }

    fn member_value(self) -> Self {
        Self {
            line_breaks: true,
            alpha_ops: false,
            colon: false,
            quoted: self.quoted,
            resolve: self.resolve,
        }
    }

    fn in_quote(self) -> Self {
        Self {
            quoted: true,
            ..self
        }
    }
}

/// The result of a template-mode (quoted) subparse: either fully constant,
/// or a constructor expression with substitution holes.
enum Tmpl {
    Const(Value),
    Dyn(Value),
    /// An unquote-splice; only legal directly inside a template list.
    Splice(Value),
}

impl Tmpl {
    /// Encode for use as a `List.of` argument: constants get quoted,
    /// dynamic parts pass through.
    fn encode(self) -> Value {
        match self {
            Self::Const(value) => {
                Value::list(vec![Value::Symbol(known::QUOTE), value])
            }
            Self::Dyn(value) | Self::Splice(value) => value,
        }
    }
}

type PResult = Result<Value, ()>;

/// A saved parser state for speculative matching.
struct Speculation {
    lexer: LexerState,
    scope: ParseScope,
    messages: usize,
}

/// The recursive-descent parser.
pub struct Parser<'a, 's> {
    lexer: Lexer<'a>,
    symbols: &'s mut SymbolTable,
    scope: ParseScope,
    messages: Vec<ParseMessage>,
}

impl<'a, 's> Parser<'a, 's> {
    /// Create a parser over a lexer, resolving names against the given
    /// scope.
    #[must_use]
    pub fn new(lexer: Lexer<'a>, symbols: &'s mut SymbolTable, scope: ParseScope) -> Self {
        Self {
            lexer,
            symbols,
            scope,
            messages: Vec::new(),
        }
    }

    /// The diagnostics produced so far.
    #[must_use]
    pub fn messages(&self) -> &[ParseMessage] {
        &self.messages
    }

    /// Consume the parser, returning its diagnostics.
    #[must_use]
    pub fn into_messages(self) -> Vec<ParseMessage> {
        self.messages
    }

    /// Were any errors recorded?
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(ParseMessage::is_error)
    }

    /// The scope as the parse left it (useful for REPLs that keep
    /// declarations across inputs).
    #[must_use]
    pub fn into_scope(self) -> ParseScope {
        self.scope
    }

    //------------------------------------------------------------------
    // Token plumbing.

    fn next(&mut self) -> TokenData {
        loop {
            let token = self.lexer.next_token();
            if let Token::LexError(err) = token.token {
                let message = err.into_message(self.lexer.filename(), token.pos);
                self.messages.push(message);
                continue;
            }
            return token;
        }
    }

    fn look(&mut self) -> TokenData {
        let token = self.next();
        self.lexer.unget(token.clone());
        token
    }

    fn error(&mut self, pos: Position, text: impl Into<String>) {
        let message = ParseMessage::error(self.lexer.filename(), pos, text);
        self.messages.push(message);
    }

    fn expect_name(&mut self, what: &str) -> Result<(Symbol, Position), ()> {
        let token = self.next();
        match token.token.name_text() {
            Some(text) => {
                let text = text.to_string();
                Ok((self.symbols.intern(&text), token.pos))
            }
            None => {
                self.error(
                    token.pos,
                    format!("Expected {}, not {}", what, token.token.describe()),
                );
                Err(())
            }
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<Position, ()> {
        let token = self.next();
        if token.token == *expected {
            Ok(token.pos)
        } else {
            self.error(
                token.pos,
                format!("Expected {}, not {}", what, token.token.describe()),
            );
            Err(())
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<Position, ()> {
        let token = self.next();
        if token.token.is_name(keyword) {
            Ok(token.pos)
        } else {
            self.error(
                token.pos,
                format!("Expected '{}', not {}", keyword, token.token.describe()),
            );
            Err(())
        }
    }

    fn speculate(&self) -> Speculation {
        Speculation {
            lexer: self.lexer.snapshot(),
            scope: self.scope.clone(),
            messages: self.messages.len(),
        }
    }

    fn rollback(&mut self, speculation: Speculation) {
        self.lexer.restore(speculation.lexer);
        self.scope = speculation.scope;
        self.messages.truncate(speculation.messages);
    }

    //------------------------------------------------------------------
    // Statement sequences.

    /// Parse a whole program: a sequence of statements, becoming `[$progn
    /// ...]` (or `[$scope [vars...] ...]` when `var` declarations occur),
    /// a bare expression for a single statement, or null for none.
    pub fn parse_program(&mut self) -> Value {
        self.parse_stmt_sequence(None)
    }

    /// Parse statements until the given closing token (or end of input),
    /// producing the progn/scope wrapping.  Does not consume the closer.
    fn parse_stmt_sequence(&mut self, closer: Option<&Token>) -> Value {
        let mut stmts = Vec::new();
        let mut vars: Vec<Symbol> = Vec::new();

        loop {
            let token = self.look();
            match &token.token {
                Token::Eoi => break,
                Token::Semicolon => {
                    self.next();
                    continue;
                }
                other if Some(other) == closer => break,
                _ => (),
            }

            match self.parse_stmt(Flags::TOP, &mut vars) {
                Ok(stmt) => stmts.push(stmt),
                Err(()) => self.synchronize(closer),
            }
        }

        if !vars.is_empty() {
            let mut items = vec![
                Value::Symbol(known::SCOPE),
                Value::list(vars.into_iter().map(Value::Symbol).collect()),
            ];
            items.extend(stmts);
            Value::list(items)
        } else {
            match stmts.len() {
                0 => Value::Null,
                1 => stmts.pop().expect("just checked length"),
                _ => {
                    let mut items = vec![Value::Symbol(known::PROGN)];
                    items.extend(stmts);
                    Value::list(items)
                }
            }
        }
    }

    /// Skip tokens until a statement boundary: the start of a new line,
    /// a semicolon, the closer, or end of input.
    fn synchronize(&mut self, closer: Option<&Token>) {
        loop {
            let token = self.look();
            match &token.token {
                Token::Eoi => return,
                Token::Semicolon => {
                    self.next();
                    return;
                }
                other if Some(other) == closer => return,
                _ if token.first_on_line => return,
                _ => {
                    self.next();
                }
            }
        }
    }

    //------------------------------------------------------------------
    // Statements.

    fn parse_stmt(&mut self, flags: Flags, vars: &mut Vec<Symbol>) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::STMT, flags) {
            return result;
        }

        let token = self.look();
        if let Token::LoanWord(word) = &token.token {
            if word == "syntax" {
                self.next();
                return self.parse_syntax_decl(token.pos);
            }
            self.next();
            self.error(token.pos, format!("Unknown loanword '#{}'", word));
            return Err(());
        }

        if token.token == Token::LeftBrace {
            return self.parse_term(flags);
        }

        if let Some(text) = token.token.name_text() {
            match text {
                "var" => {
                    self.next();
                    return self.parse_var_decl(flags, vars);
                }
                "if" | "unless" => {
                    let negate = text == "unless";
                    self.next();
                    return self.parse_if(flags, vars, negate);
                }
                "while" | "until" => {
                    let negate = text == "until";
                    self.next();
                    return self.parse_while(flags, vars, negate);
                }
                "do" => {
                    self.next();
                    return self.parse_do(flags, vars);
                }
                "till" => {
                    self.next();
                    return self.parse_till(flags, vars);
                }
                "try" => {
                    self.next();
                    return self.parse_try(flags, vars);
                }
                "return" => {
                    self.next();
                    return self.parse_return(flags);
                }
                _ => (),
            }
        }

        self.parse_expr(flags)
    }

    /// `var name [= expr] [, name [= expr]]*`
    fn parse_var_decl(&mut self, flags: Flags, vars: &mut Vec<Symbol>) -> PResult {
        let mut sets = Vec::new();

        loop {
            let (symbol, pos) = self.expect_name("a variable name")?;
            if let Err(existing) = self.scope.declare_here(symbol, DeclKind::Variable, pos) {
                self.error(
                    pos,
                    format!(
                        "'{}' is already declared in this scope (at {})",
                        self.symbols.name(symbol),
                        existing.pos
                    ),
                );
                return Err(());
            }
            vars.push(symbol);

            let token = self.look();
            if token.token.is_name("=") {
                self.next();
                let value = self.parse_expr(flags)?;
                sets.push(Value::list(vec![
                    Value::Symbol(known::SET),
                    Value::Symbol(symbol),
                    value,
                ]));
            }

            let token = self.look();
            if token.token == Token::Comma {
                self.next();
                continue;
            }
            break;
        }

        match sets.len() {
            0 => Ok(Value::Null),
            1 => Ok(sets.pop().expect("just checked length")),
            _ => {
                let mut items = vec![Value::Symbol(known::PROGN)];
                items.extend(sets);
                Ok(Value::list(items))
            }
        }
    }

    /// `if cond then stmt [else stmt]` (and `unless`, negated).
    fn parse_if(&mut self, flags: Flags, vars: &mut Vec<Symbol>, negate: bool) -> PResult {
        let mut cond = self.parse_expr(flags)?;
        if negate {
            cond = Value::list(vec![Value::Symbol(known::NOT), cond]);
        }
        self.expect_keyword("then")?;
        let then_clause = self.parse_stmt(flags, vars)?;

        let token = self.look();
        if token.token.is_name("else") {
            self.next();
            let else_clause = self.parse_stmt(flags, vars)?;
            Ok(Value::list(vec![
                Value::Symbol(known::IF),
                cond,
                then_clause,
                else_clause,
            ]))
        } else {
            Ok(Value::list(vec![Value::Symbol(known::IF), cond, then_clause]))
        }
    }

    /// `while cond do stmt` (and `until`, negated).
    fn parse_while(&mut self, flags: Flags, vars: &mut Vec<Symbol>, negate: bool) -> PResult {
        let mut cond = self.parse_expr(flags)?;
        if negate {
            cond = Value::list(vec![Value::Symbol(known::NOT), cond]);
        }
        self.expect_keyword("do")?;
        let body = self.parse_stmt(flags, vars)?;
        Ok(Value::list(vec![Value::Symbol(known::WHILE), cond, body]))
    }

    /// `do stmt while cond [then stmt]` (and `until`, negated).
    fn parse_do(&mut self, flags: Flags, vars: &mut Vec<Symbol>) -> PResult {
        let body = self.parse_stmt(flags, vars)?;

        let token = self.next();
        let negate = match token.token.name_text() {
            Some("while") => false,
            Some("until") => true,
            _ => {
                self.error(
                    token.pos,
                    format!("Expected 'while' or 'until', not {}", token.token.describe()),
                );
                return Err(());
            }
        };

        let mut cond = self.parse_expr(flags)?;
        if negate {
            cond = Value::list(vec![Value::Symbol(known::NOT), cond]);
        }

        let token = self.look();
        let post = if token.token.is_name("then") {
            self.next();
            self.parse_stmt(flags, vars)?
        } else {
            Value::Null
        };

        Ok(Value::list(vec![
            Value::Symbol(known::WHILE),
            body,
            cond,
            post,
        ]))
    }

    /// `till flag [, flag]* do stmt [when flag stmt]*`
    fn parse_till(&mut self, flags: Flags, vars: &mut Vec<Symbol>) -> PResult {
        let mut till_flags = Vec::new();
        loop {
            let (symbol, pos) = self.expect_name("a till-flag name")?;
            till_flags.push((symbol, pos));
            let token = self.look();
            if token.token == Token::Comma {
                self.next();
                continue;
            }
            break;
        }
        self.expect_keyword("do")?;

        self.scope.push(ScopeKind::Till);
        for &(symbol, pos) in &till_flags {
            if let Err(_existing) = self.scope.declare_here(symbol, DeclKind::TillFlag, pos) {
                self.error(
                    pos,
                    format!("Flag '{}' is declared twice", self.symbols.name(symbol)),
                );
            }
        }
        let body = self.parse_stmt(flags, vars);
        self.scope.pop();
        let body = body?;

        // Optional when clauses, one per flag.
        let mut clauses = Vec::new();
        loop {
            let token = self.look();
            if !token.token.is_name("when") {
                break;
            }
            self.next();
            let (symbol, pos) = self.expect_name("a till-flag name")?;
            if !till_flags.iter().any(|&(flag, _)| flag == symbol) {
                self.error(
                    pos,
                    format!(
                        "'{}' is not a flag of this till loop",
                        self.symbols.name(symbol)
                    ),
                );
            }
            let clause = self.parse_stmt(flags, vars)?;
            clauses.push(Value::list(vec![Value::Symbol(symbol), clause]));
        }

        let mut items = vec![
            Value::Symbol(known::TILL),
            Value::list(
                till_flags
                    .into_iter()
                    .map(|(symbol, _)| Value::Symbol(symbol))
                    .collect(),
            ),
            body,
        ];
        if !clauses.is_empty() {
            items.push(Value::list(clauses));
        }
        Ok(Value::list(items))
    }

    /// `try stmt catch handler`
    fn parse_try(&mut self, flags: Flags, vars: &mut Vec<Symbol>) -> PResult {
        let body = self.parse_stmt(flags, vars)?;
        self.expect_keyword("catch")?;
        let handler = self.parse_expr(flags)?;
        Ok(Value::list(vec![Value::Symbol(known::CATCH), body, handler]))
    }

    /// `return [expr]`
    fn parse_return(&mut self, flags: Flags) -> PResult {
        let token = self.look();
        let bare = token.first_on_line
            || matches!(
                token.token,
                Token::Eoi | Token::Semicolon | Token::RightBrace | Token::RightBracket
            );
        if bare {
            Ok(Value::list(vec![Value::Symbol(known::RETURN)]))
        } else {
            let value = self.parse_expr(flags)?;
            Ok(Value::list(vec![Value::Symbol(known::RETURN), value]))
        }
    }

    //------------------------------------------------------------------
    // Expressions.

    /// EXPR: assignment (`=`, `op=`) over OREXPR, right-associative.
    fn parse_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::EXPR, flags) {
            return result;
        }

        let target = self.parse_or_expr(flags)?;

        let token = self.look();
        let text = match token.token.name_text() {
            Some(text) if token.token.is_punct_name() => text.to_string(),
            _ => return Ok(target),
        };

        if text == "=" {
            self.next();
            self.check_assignment_target(&target, token.pos);
            let value = self.parse_expr(flags)?;
            return Ok(Value::list(vec![
                Value::Symbol(known::SET),
                target,
                value,
            ]));
        }

        // Compound assignment: any operator followed by '=' (but not the
        // comparison family).
        if text.len() > 1 && text.ends_with('=') && !RESERVED_PUNCT.contains(&text.as_str()) {
            let op_text = &text[..text.len() - 1];
            if !op_text.ends_with('=') && !op_text.ends_with('<') && !op_text.ends_with('>')
                && !op_text.ends_with('!')
            {
                self.next();
                self.check_assignment_target(&target, token.pos);
                let op = self.symbols.intern(op_text);
                let value = self.parse_expr(flags)?;
                return Ok(Value::list(vec![
                    Value::Symbol(known::OPSET),
                    Value::Symbol(op),
                    target,
                    value,
                ]));
            }
        }

        Ok(target)
    }

    /// Check that an expression can be assigned to, and implicitly declare
    /// plain names at the root so first assignments create globals.
    fn check_assignment_target(&mut self, target: &Value, pos: Position) {
        match target {
            Value::Symbol(symbol) => {
                if self.scope.find(*symbol).is_none() {
                    let _ = self.scope.declare(*symbol, DeclKind::Global, pos);
                }
            }
            Value::Pair(_) => (),
            Value::List(cell)
                if cell.head.as_symbol() == Some(known::INDEX)
                    || matches!(&cell.head, Value::Pair(pair)
                        if pair.right.as_symbol() == Some(known::GET_MEMBER)) => (),
            _ => {
                self.error(pos, "Expression cannot be assigned to");
            }
        }
    }

    /// OREXPR: `a or b or c` folds into one `[$or ...]`.
    fn parse_or_expr(&mut self, flags: Flags) -> PResult {
        let first = self.parse_and_expr(flags)?;
        let mut items = vec![first];

        loop {
            let token = self.look();
            if !token.token.is_name("or") || (token.first_on_line && !flags.line_breaks) {
                break;
            }
            self.next();
            items.push(self.parse_and_expr(flags)?);
        }

        if items.len() == 1 {
            Ok(items.pop().expect("just checked length"))
        } else {
            let mut list = vec![Value::Symbol(known::OR)];
            list.extend(items);
            Ok(Value::list(list))
        }
    }

    /// ANDEXPR: `a and b and c` folds into one `[$and ...]`.
    fn parse_and_expr(&mut self, flags: Flags) -> PResult {
        let first = self.parse_not_expr(flags)?;
        let mut items = vec![first];

        loop {
            let token = self.look();
            if !token.token.is_name("and") || (token.first_on_line && !flags.line_breaks) {
                break;
            }
            self.next();
            items.push(self.parse_not_expr(flags)?);
        }

        if items.len() == 1 {
            Ok(items.pop().expect("just checked length"))
        } else {
            let mut list = vec![Value::Symbol(known::AND)];
            list.extend(items);
            Ok(Value::list(list))
        }
    }

    /// NOTEXPR: right-associated `not`.
    fn parse_not_expr(&mut self, flags: Flags) -> PResult {
        let token = self.look();
        if token.token.is_name("not") {
            self.next();
            let operand = self.parse_not_expr(flags)?;
            return Ok(Value::list(vec![Value::Symbol(known::NOT), operand]));
        }
        self.parse_cmp_expr(flags)
    }

    /// CMPEXPR: comparisons, left-associative.  `===`, `!==`, and `is`
    /// produce structural forms; the rest are method calls.
    fn parse_cmp_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::CMPEXPR, flags) {
            return result;
        }

        let mut lhs = self.parse_add_expr(flags)?;

        loop {
            let token = self.look();
            if token.first_on_line && !flags.line_breaks {
                break;
            }
            if token.token.is_name("is") {
                self.next();
                let rhs = self.parse_add_expr(flags)?;
                lhs = Value::list(vec![Value::Symbol(known::IS), lhs, rhs]);
                continue;
            }
            let text = match token.token.name_text() {
                Some(text) if token.token.is_punct_name() => text,
                _ => break,
            };
            match text {
                "===" => {
                    self.next();
                    let rhs = self.parse_add_expr(flags)?;
                    lhs = Value::list(vec![Value::Symbol(known::EQ), lhs, rhs]);
                }
                "!==" => {
                    self.next();
                    let rhs = self.parse_add_expr(flags)?;
                    lhs = Value::list(vec![Value::Symbol(known::NE), lhs, rhs]);
                }
                _ if CMP_OPS.contains(&text) => {
                    let op = self.symbols.intern(text);
                    self.next();
                    let rhs = self.parse_add_expr(flags)?;
                    lhs = Value::list(vec![Value::pair(lhs, Value::Symbol(op)), rhs]);
                }
                _ => break,
            }
        }

        Ok(lhs)
    }

    /// ADDEXPR: `+` and `-`, left-associative method calls.
    fn parse_add_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::ADDEXPR, flags) {
            return result;
        }

        let mut lhs = self.parse_mul_expr(flags)?;

        loop {
            let token = self.look();
            if token.first_on_line && !flags.line_breaks {
                break;
            }
            let op = match token.token.name_text() {
                Some("+") => known::PLUS,
                Some("-") => known::MINUS,
                _ => break,
            };
            self.next();
            let rhs = self.parse_mul_expr(flags)?;
            lhs = Value::list(vec![Value::pair(lhs, Value::Symbol(op)), rhs]);
        }

        Ok(lhs)
    }

    /// MULEXPR: `*` and `/`, left-associative method calls.
    fn parse_mul_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::MULEXPR, flags) {
            return result;
        }

        let mut lhs = self.parse_binary_expr(flags)?;

        loop {
            let token = self.look();
            if token.first_on_line && !flags.line_breaks {
                break;
            }
            let op = match token.token.name_text() {
                Some("*") => known::STAR,
                Some("/") => known::SLASH,
                _ => break,
            };
            self.next();
            let rhs = self.parse_binary_expr(flags)?;
            lhs = Value::list(vec![Value::pair(lhs, Value::Symbol(op)), rhs]);
        }

        Ok(lhs)
    }

    /// BINARYEXPR: arbitrary names as binary operators, left-associative.
    fn parse_binary_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::BINARYEXPR, flags) {
            return result;
        }

        let mut lhs = self.parse_colon_expr(flags)?;

        loop {
            let token = self.look();
            if token.first_on_line && !flags.line_breaks {
                break;
            }
            let text = match token.token.name_text() {
                Some(text) => text,
                None => break,
            };
            let usable = if token.token.is_alpha_name() {
                flags.alpha_ops && !is_keyword(text)
            } else {
                // Punctuation: everything with reserved meaning is handled
                // at its own level or not an operator at all.
                !RESERVED_PUNCT.contains(&text)
                    && !CMP_OPS.contains(&text)
                    && !matches!(text, "+" | "-" | "*" | "/" | "##" | "..")
                    && !text.ends_with('=')
            };
            if !usable {
                break;
            }
            let text = text.to_string();
            self.next();
            let op = self.symbols.intern(&text);
            let rhs = self.parse_colon_expr(flags)?;
            lhs = Value::list(vec![Value::pair(lhs, Value::Symbol(op)), rhs]);
        }

        Ok(lhs)
    }

    /// COLONEXPR: `a:b` is the index form, left-associative.
    fn parse_colon_expr(&mut self, flags: Flags) -> PResult {
        let mut lhs = self.parse_range_expr(flags)?;

        while flags.colon {
            let token = self.look();
            if token.token != Token::Colon || (token.first_on_line && !flags.line_breaks) {
                break;
            }
            self.next();
            let rhs = self.parse_range_expr(flags)?;
            lhs = Value::list(vec![Value::Symbol(known::INDEX), lhs, rhs]);
        }

        Ok(lhs)
    }

    /// RANGEEXPR: `a..b` is a `range` method call.
    fn parse_range_expr(&mut self, flags: Flags) -> PResult {
        let mut lhs = self.parse_prefix_expr(flags)?;

        loop {
            let token = self.look();
            if !token.token.is_name("..") || (token.first_on_line && !flags.line_breaks) {
                break;
            }
            self.next();
            let rhs = self.parse_prefix_expr(flags)?;
            lhs = Value::list(vec![Value::pair(lhs, Value::Symbol(known::RANGE)), rhs]);
        }

        Ok(lhs)
    }

    /// PREFIXEXPR: unary operators, right-associative method calls.
    /// `typeof` lowers to its structural form here.
    fn parse_prefix_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::PREFIXEXPR, flags) {
            return result;
        }

        let token = self.look();

        if token.token.is_name("typeof") {
            self.next();
            let operand = self.parse_prefix_expr(flags)?;
            return Ok(Value::list(vec![Value::Symbol(known::TYPEOF), operand]));
        }

        let is_prefix_op = match token.token.name_text() {
            Some(text) => {
                if token.token.is_punct_name() {
                    !RESERVED_PUNCT.contains(&text) && text != ".." && !text.ends_with('=')
                } else {
                    flags.alpha_ops
                        && !is_keyword(text)
                        && !self.name_is_declared(text)
                        && self.next_starts_term()
                }
            }
            None => false,
        };

        if is_prefix_op {
            let text = token
                .token
                .name_text()
                .expect("just matched a name")
                .to_string();
            self.next();
            let after = self.look();
            if after.first_on_line && !flags.line_breaks {
                self.error(after.pos, "Unary operator at end of line has no operand");
                return Err(());
            }
            let op = self.symbols.intern(&text);
            let operand = self.parse_prefix_expr(flags)?;
            return Ok(Value::list(vec![Value::pair(operand, Value::Symbol(op))]));
        }

        self.parse_postfix_expr(flags)
    }

    /// Does a name resolve to anything in scope?
    fn name_is_declared(&mut self, text: &str) -> bool {
        match self.symbols.get(text) {
            Some(symbol) => self.scope.find(symbol).is_some(),
            None => false,
        }
    }

    /// Can the token after the current one begin a term?  (Used to decide
    /// whether an undeclared alpha name is a prefix operator.)
    fn next_starts_term(&mut self) -> bool {
        let current = self.next();
        let next = self.look();
        let starts = match &next.token {
            Token::Byte(_)
            | Token::Int16(_)
            | Token::Int32(_)
            | Token::Int64(_)
            | Token::Float32(_)
            | Token::Float64(_)
            | Token::Char(_)
            | Token::Uni(_)
            | Token::RawString(_)
            | Token::DynString(_)
            | Token::LeftParen
            | Token::LeftBracket
            | Token::LeftBrace
            | Token::Backtick
            | Token::Bar => true,
            Token::AlphaName(text) | Token::UnknownAlphaName(text) => !is_keyword(text),
            // Punctuation starts a term only when it could be a prefix
            // operator itself; `=`, `=>`, and the compound assignments
            // never do.
            Token::PunctName(text) | Token::UnknownPunctName(text) => {
                !RESERVED_PUNCT.contains(&text.as_str())
                    && !text.ends_with('=')
                    && text.as_str() != ".."
            }
            _ => false,
        };
        self.lexer.unget(current);
        starts
    }

    /// POSTFIXEXPR: only user rules extend this level.
    fn parse_postfix_expr(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::POSTFIXEXPR, flags) {
            return result;
        }
        self.parse_cons_expr(flags)
    }

    /// CONSEXPR: `##`, right-associative.
    fn parse_cons_expr(&mut self, flags: Flags) -> PResult {
        let lhs = self.parse_dot_expr(flags)?;

        let token = self.look();
        if token.token == Token::DoubleHash && !(token.first_on_line && !flags.line_breaks) {
            self.next();
            let rhs = self.parse_cons_expr(flags)?;
            return Ok(Value::list(vec![
                Value::pair(lhs, Value::Symbol(known::CONS_OP)),
                rhs,
            ]));
        }

        Ok(lhs)
    }

    /// DOTEXPR: `a.b`, left-associative, building pairs.
    fn parse_dot_expr(&mut self, flags: Flags) -> PResult {
        let mut lhs = self.parse_term(flags)?;

        loop {
            let token = self.look();
            if token.token != Token::Dot {
                break;
            }
            self.next();
            let (symbol, _) = self.expect_name("a property name after '.'")?;
            lhs = Value::pair(lhs, Value::Symbol(symbol));
        }

        Ok(lhs)
    }

    //------------------------------------------------------------------
    // Terms.

    fn parse_term(&mut self, flags: Flags) -> PResult {
        if let Some(result) = self.try_syntax_rules(known::TERM, flags) {
            return result;
        }

        let token = self.next();
        match token.token {
            Token::Byte(n) => Ok(Value::Byte(n)),
            Token::Int16(n) => Ok(Value::Int16(n)),
            Token::Int32(n) => Ok(Value::Int32(n)),
            Token::Int64(n) => Ok(Value::Int64(n)),
            Token::Float32(n) => Ok(Value::Float32(n)),
            Token::Float64(n) => Ok(Value::Float64(n)),
            Token::Char(c) => Ok(Value::Char(c)),
            Token::Uni(c) => Ok(Value::Uni(c)),
            Token::RawString(s) => Ok(Value::Str(s)),
            Token::DynString(parts) => self.build_dyn_string(&parts),
            Token::Backtick => {
                let tmpl = self.parse_template_term(flags)?;
                Ok(match tmpl {
                    Tmpl::Const(value) => {
                        Value::list(vec![Value::Symbol(known::QUOTE), value])
                    }
                    Tmpl::Dyn(value) => value,
                    Tmpl::Splice(_) => {
                        self.error(token.pos, "A splice cannot appear outside a list template");
                        return Err(());
                    }
                })
            }
            Token::LeftParen => {
                let inner = self.parse_expr(flags.grouped())?;
                let closer = self.next();
                if closer.token != Token::RightParen {
                    self.error(
                        closer.pos,
                        format!(
                            "Parentheses may only contain one expression; found {}",
                            closer.token.describe()
                        ),
                    );
                    return Err(());
                }
                Ok(inner)
            }
            Token::LeftBracket => self.parse_call_form(flags),
            Token::LeftBrace => self.parse_brace_term(),
            Token::Bar => self.parse_fn_literal(flags),
            Token::AlphaName(_) | Token::UnknownAlphaName(_) => {
                let text = token
                    .token
                    .name_text()
                    .expect("just matched a name")
                    .to_string();
                self.parse_name_term(&text, token.pos, flags)
            }
            Token::PunctName(_) | Token::UnknownPunctName(_) => {
                let text = token.token.name_text().expect("just matched a name");
                self.error(
                    token.pos,
                    format!("Expected an expression, not operator '{}'", text),
                );
                Err(())
            }
            other => {
                self.error(
                    token.pos,
                    format!("Expected an expression, not {}", other.describe()),
                );
                Err(())
            }
        }
    }

    fn parse_name_term(&mut self, text: &str, pos: Position, flags: Flags) -> PResult {
        if text == "new" {
            return self.parse_new();
        }

        // The statement constructs are expressions too (`a = try ... catch
        // ...`); any `var` inside them stays declared but gets no scope
        // slot list of its own.
        let mut vars = Vec::new();
        match text {
            "if" => return self.parse_if(flags, &mut vars, false),
            "unless" => return self.parse_if(flags, &mut vars, true),
            "while" => return self.parse_while(flags, &mut vars, false),
            "until" => return self.parse_while(flags, &mut vars, true),
            "do" => return self.parse_do(flags, &mut vars),
            "till" => return self.parse_till(flags, &mut vars),
            "try" => return self.parse_try(flags, &mut vars),
            _ => (),
        }

        if is_keyword(text) {
            self.error(pos, format!("Expected an expression, not '{}'", text));
            return Err(());
        }
        if text == "null" {
            return Ok(Value::Null);
        }

        let symbol = self.symbols.intern(text);

        // $-names are the special forms; they are always meaningful.
        // Inside quoted forms, every name stays a symbol.
        if text.starts_with('$') || flags.quoted {
            return Ok(Value::Symbol(symbol));
        }

        match self.scope.find(symbol) {
            Some(decl) => match &decl.kind {
                DeclKind::Const(value) => Ok(value.clone()),
                _ => Ok(Value::Symbol(symbol)),
            },
            None if flags.resolve => {
                self.error(pos, format!("Undeclared variable '{}'", text));
                Err(())
            }
            None => Ok(Value::Symbol(symbol)),
        }
    }

    /// `[ expr expr ... ]` - the explicit call/list form.  Alpha names do
    /// not act as operators inside.  The classic quoting and binding
    /// forms (`[$quote ...]`, `[$fn [args] ...]`, `[$scope [vars] ...]`)
    /// keep their scoping behavior when written this way.
    fn parse_call_form(&mut self, flags: Flags) -> PResult {
        let inner_flags = flags.listed();

        let first = self.look();
        if let Some(text) = first.token.name_text() {
            match text {
                "$quote" => {
                    self.next();
                    let mut items = vec![Value::Symbol(known::QUOTE)];
                    self.parse_call_elements(inner_flags.in_quote(), &mut items)?;
                    return Ok(Value::list(items));
                }
                "$fn" => {
                    self.next();
                    return self.parse_raw_fn(inner_flags);
                }
                "$scope" => {
                    self.next();
                    return self.parse_raw_scope(inner_flags);
                }
                _ => (),
            }
        }

        let mut items = Vec::new();
        self.parse_call_elements(inner_flags, &mut items)?;
        Ok(Value::list(items))
    }

    /// The elements of a `[...]` form, up to and including the closer.
    fn parse_call_elements(&mut self, flags: Flags, items: &mut Vec<Value>) -> Result<(), ()> {
        loop {
            let token = self.look();
            match token.token {
                Token::RightBracket => {
                    self.next();
                    return Ok(());
                }
                Token::Eoi => {
                    self.error(token.pos, "Expected ']' before end of input");
                    return Err(());
                }
                _ => items.push(self.parse_expr(flags)?),
            }
        }
    }

    /// A bracketed list of bare names (for raw `$fn`/`$scope` forms).
    fn parse_name_list(&mut self, what: &str) -> Result<Vec<(Symbol, Position)>, ()> {
        self.expect(&Token::LeftBracket, "'['")?;
        let mut names = Vec::new();
        loop {
            let token = self.next();
            match token.token {
                Token::RightBracket => return Ok(names),
                Token::AlphaName(_) | Token::UnknownAlphaName(_) => {
                    let text = token
                        .token
                        .name_text()
                        .expect("just matched a name")
                        .to_string();
                    names.push((self.symbols.intern(&text), token.pos));
                }
                other => {
                    self.error(
                        token.pos,
                        format!("Expected {} or ']', not {}", what, other.describe()),
                    );
                    return Err(());
                }
            }
        }
    }

    /// `[$fn [args...] body...]` - past the `$fn`.
    fn parse_raw_fn(&mut self, flags: Flags) -> PResult {
        let params = self.parse_name_list("an argument name")?;

        self.scope.push(ScopeKind::Function);
        for &(symbol, pos) in &params {
            let _ = self.scope.declare_here(symbol, DeclKind::Argument, pos);
        }
        let mut body = Vec::new();
        let result = self.parse_call_elements(flags, &mut body);
        self.scope.pop();
        result?;

        let mut items = vec![
            Value::Symbol(known::FN),
            Value::list(params.into_iter().map(|(s, _)| Value::Symbol(s)).collect()),
        ];
        items.extend(body);
        Ok(Value::list(items))
    }

    /// `[$scope [vars...] body...]` - past the `$scope`.
    fn parse_raw_scope(&mut self, flags: Flags) -> PResult {
        let vars = self.parse_name_list("a variable name")?;

        self.scope.push(ScopeKind::Block);
        for &(symbol, pos) in &vars {
            let _ = self.scope.declare_here(symbol, DeclKind::Variable, pos);
        }
        let mut body = Vec::new();
        let result = self.parse_call_elements(flags, &mut body);
        self.scope.pop();
        result?;

        let mut items = vec![
            Value::Symbol(known::SCOPE),
            Value::list(vars.into_iter().map(|(s, _)| Value::Symbol(s)).collect()),
        ];
        items.extend(body);
        Ok(Value::list(items))
    }

    /// A `{` in term position: an object literal when it starts with
    /// `name:`, otherwise a statement block.
    fn parse_brace_term(&mut self) -> PResult {
        let speculation = self.speculate();
        let first = self.next();
        let second = self.look();
        let is_object = matches!(
            (&first.token, &second.token),
            (Token::AlphaName(_) | Token::UnknownAlphaName(_), Token::Colon)
        ) || first.token == Token::RightBrace;
        self.rollback(speculation);

        if is_object {
            self.parse_object_body(Value::Symbol(known::OBJECT))
        } else {
            self.parse_block()
        }
    }

    /// `{ stmt stmt ... }` - already past the opening brace.
    fn parse_block(&mut self) -> PResult {
        self.scope.push(ScopeKind::Block);
        let body = self.parse_stmt_sequence(Some(&Token::RightBrace));
        self.scope.pop();
        self.expect(&Token::RightBrace, "'}'")?;
        Ok(body)
    }

    /// `new { ... }` or `new base { ... }` - already past `new`.
    fn parse_new(&mut self) -> PResult {
        let token = self.look();
        let base = if token.token == Token::LeftBrace {
            Value::Symbol(known::OBJECT)
        } else {
            let base = self.parse_dot_expr(Flags::TOP)?;
            base
        };
        self.expect(&Token::LeftBrace, "'{'")?;
        self.parse_object_body(base)
    }

    /// `name:value ...` pairs up to the closing brace, which is consumed.
    /// The opening brace is already behind us.
    fn parse_object_body(&mut self, base: Value) -> PResult {
        let mut members = Vec::new();

        loop {
            let token = self.next();
            match token.token {
                Token::RightBrace => break,
                Token::AlphaName(_) | Token::UnknownAlphaName(_) => {
                    let text = token
                        .token
                        .name_text()
                        .expect("just matched a name")
                        .to_string();
                    let symbol = self.symbols.intern(&text);
                    self.expect(&Token::Colon, "':' after a member name")?;
                    let value = self.parse_expr(Flags::TOP.member_value())?;
                    members.push(Value::list(vec![Value::Symbol(symbol), value]));
                }
                other => {
                    self.error(
                        token.pos,
                        format!("Expected a member name or '}}', not {}", other.describe()),
                    );
                    return Err(());
                }
            }
        }

        Ok(Value::list(vec![
            Value::Symbol(known::NEW),
            base,
            Value::list(members),
        ]))
    }

    /// `|params| body` - already past the first bar.
    fn parse_fn_literal(&mut self, flags: Flags) -> PResult {
        let mut params = Vec::new();
        loop {
            let token = self.next();
            match token.token {
                Token::Bar => break,
                Token::Comma => continue,
                Token::AlphaName(_) | Token::UnknownAlphaName(_) => {
                    let text = token
                        .token
                        .name_text()
                        .expect("just matched a name")
                        .to_string();
                    params.push((self.symbols.intern(&text), token.pos));
                }
                other => {
                    self.error(
                        token.pos,
                        format!("Expected a parameter name or '|', not {}", other.describe()),
                    );
                    return Err(());
                }
            }
        }

        self.scope.push(ScopeKind::Function);
        for &(symbol, pos) in &params {
            if let Err(_existing) = self.scope.declare_here(symbol, DeclKind::Argument, pos) {
                self.error(
                    pos,
                    format!(
                        "Parameter '{}' is declared twice",
                        self.symbols.name(symbol)
                    ),
                );
            }
        }
        let body = self.parse_expr(flags);
        self.scope.pop();
        let body = body?;

        Ok(Value::list(vec![
            Value::Symbol(known::FN),
            Value::list(
                params
                    .into_iter()
                    .map(|(symbol, _)| Value::Symbol(symbol))
                    .collect(),
            ),
            body,
        ]))
    }

    /// Assemble a dynamic string: a plain string when there are no
    /// embedded expressions, otherwise the `join` call form over the
    /// pieces.
    fn build_dyn_string(&mut self, parts: &[StringPart]) -> PResult {
        let only_text = parts
            .iter()
            .all(|part| matches!(part, StringPart::Text(_)));

        if only_text {
            let mut text = String::new();
            for part in parts {
                if let StringPart::Text(piece) = part {
                    text.push_str(piece);
                }
            }
            return Ok(Value::Str(text.into()));
        }

        let mut items = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StringPart::Text(piece) => {
                    if !piece.is_empty() {
                        items.push(Value::Str(piece.as_str().into()));
                    }
                }
                StringPart::Expr { source, pos } => {
                    items.push(self.parse_embedded_expr(source, *pos)?);
                }
            }
        }

        let list_of = Value::cons(
            Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
            Value::list(items),
        );
        Ok(Value::list(vec![Value::pair(
            list_of,
            Value::Symbol(known::JOIN),
        )]))
    }

    /// Re-lex and parse an expression embedded in a dynamic string.  The
    /// sub-source gets its own parser sharing our symbol table and a copy
    /// of our scope; its diagnostics are folded back into ours.
    fn parse_embedded_expr(&mut self, source: &str, pos: Position) -> PResult {
        let filename = self.lexer.filename().clone();
        let (result, trailing, messages) = {
            let lexer = Lexer::new(source, filename, pos);
            let mut sub = Parser::new(lexer, &mut *self.symbols, self.scope.clone());
            let result = sub.parse_expr(Flags::TOP.grouped());
            let trailing = sub.next();
            (result, trailing, sub.into_messages())
        };
        self.messages.extend(messages);

        if result.is_ok() && trailing.token != Token::Eoi {
            self.error(
                trailing.pos,
                format!(
                    "Unexpected {} after an embedded expression",
                    trailing.token.describe()
                ),
            );
            return Err(());
        }
        result
    }

    //------------------------------------------------------------------
    // Quote templates.

    /// Parse the term after a backquote (or a syntax-rule replacement).
    fn parse_template_term(&mut self, flags: Flags) -> Result<Tmpl, ()> {
        let token = self.next();
        match token.token {
            Token::Byte(n) => Ok(Tmpl::Const(Value::Byte(n))),
            Token::Int16(n) => Ok(Tmpl::Const(Value::Int16(n))),
            Token::Int32(n) => Ok(Tmpl::Const(Value::Int32(n))),
            Token::Int64(n) => Ok(Tmpl::Const(Value::Int64(n))),
            Token::Float32(n) => Ok(Tmpl::Const(Value::Float32(n))),
            Token::Float64(n) => Ok(Tmpl::Const(Value::Float64(n))),
            Token::Char(c) => Ok(Tmpl::Const(Value::Char(c))),
            Token::Uni(c) => Ok(Tmpl::Const(Value::Uni(c))),
            Token::RawString(s) => Ok(Tmpl::Const(Value::Str(s))),
            Token::DynString(parts) => {
                let only_text = parts
                    .iter()
                    .all(|part| matches!(part, StringPart::Text(_)));
                let value = self.build_dyn_string(&parts)?;
                if only_text {
                    Ok(Tmpl::Const(value))
                } else {
                    Ok(Tmpl::Dyn(value))
                }
            }
            Token::AlphaName(_)
            | Token::UnknownAlphaName(_)
            | Token::PunctName(_)
            | Token::UnknownPunctName(_) => {
                let text = token
                    .token
                    .name_text()
                    .expect("just matched a name")
                    .to_string();
                let symbol = self.symbols.intern(&text);
                if self.is_captured_variable(symbol) {
                    Ok(Tmpl::Dyn(Value::Symbol(symbol)))
                } else {
                    Ok(Tmpl::Const(Value::Symbol(symbol)))
                }
            }
            Token::LeftParen => {
                // A backquoted parenthesized expression quotes the parsed
                // expression tree; captured variables become holes, and
                // free names stay symbols.
                let expr = self.parse_expr(flags.grouped().in_quote())?;
                self.expect(&Token::RightParen, "')'")?;
                Ok(self.tree_to_template(&expr))
            }
            Token::LeftBracket => self.parse_template_list(flags),
            Token::LeftBrace => {
                // An embedded statement block is an unquoted expression.
                let body = self.parse_block()?;
                Ok(Tmpl::Dyn(body))
            }
            Token::Backtick => {
                // A nested backquote inside a template stays quoted.
                self.parse_template_term(flags)
            }
            other => {
                self.error(
                    token.pos,
                    format!("Expected a template, not {}", other.describe()),
                );
                Err(())
            }
        }
    }

    /// Is a symbol a captured nonterminal variable of the rule being
    /// declared?
    fn is_captured_variable(&self, symbol: Symbol) -> bool {
        matches!(
            self.scope.find(symbol),
            Some(decl) if decl.kind == DeclKind::SyntaxNonterminal
        )
    }

    /// One element of a `[...]` template: a primary, possibly extended by
    /// `.` into pairs.
    fn parse_template_element(&mut self, flags: Flags) -> Result<Tmpl, ()> {
        let token = self.look();

        // Splices.
        match token.token {
            Token::At => {
                self.next();
                self.expect(&Token::LeftParen, "'(' after '@'")?;
                let expr = self.parse_expr(flags.grouped())?;
                self.expect(&Token::RightParen, "')'")?;
                return Ok(Tmpl::Splice(expr));
            }
            Token::DoubleAt => {
                self.next();
                let (symbol, pos) = self.expect_name("a captured list name after '@@'")?;
                if !self.is_captured_variable(symbol) {
                    self.error(
                        pos,
                        format!(
                            "'{}' is not a captured variable",
                            self.symbols.name(symbol)
                        ),
                    );
                }
                return Ok(Tmpl::Splice(Value::Symbol(symbol)));
            }
            Token::LeftParen => {
                // An unquote: insert the expression's value.
                self.next();
                let expr = self.parse_expr(flags.grouped())?;
                self.expect(&Token::RightParen, "')'")?;
                return self.extend_template_dots(Tmpl::Dyn(expr), flags);
            }
            _ => (),
        }

        let primary = self.parse_template_term(flags)?;
        self.extend_template_dots(primary, flags)
    }

    /// Extend a template primary with `.name` pairs.
    fn extend_template_dots(&mut self, mut lhs: Tmpl, flags: Flags) -> Result<Tmpl, ()> {
        loop {
            let token = self.look();
            if token.token != Token::Dot {
                return Ok(lhs);
            }
            self.next();
            let rhs = self.parse_template_term(flags)?;
            lhs = match (lhs, rhs) {
                (Tmpl::Const(left), Tmpl::Const(right)) => {
                    Tmpl::Const(Value::pair(left, right))
                }
                (left, right) => Tmpl::Dyn(Value::cons(
                    Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
                    Value::list(vec![
                        Value::list(vec![
                            Value::Symbol(known::QUOTE),
                            Value::Symbol(known::DOT),
                        ]),
                        left.encode(),
                        right.encode(),
                    ]),
                )),
            };
        }
    }

    /// `[ elem elem ... ]` in template mode; the opening bracket is
    /// consumed.
    fn parse_template_list(&mut self, flags: Flags) -> Result<Tmpl, ()> {
        let mut elements = Vec::new();

        loop {
            let token = self.look();
            match token.token {
                Token::RightBracket => {
                    self.next();
                    break;
                }
                Token::Eoi => {
                    self.error(token.pos, "Expected ']' before end of input");
                    return Err(());
                }
                _ => elements.push(self.parse_template_element(flags)?),
            }
        }

        let any_splice = elements.iter().any(|e| matches!(e, Tmpl::Splice(_)));
        let all_const = elements.iter().all(|e| matches!(e, Tmpl::Const(_)));

        if all_const {
            let values = elements
                .into_iter()
                .map(|element| match element {
                    Tmpl::Const(value) => value,
                    _ => unreachable!("all elements are constant"),
                })
                .collect();
            return Ok(Tmpl::Const(Value::list(values)));
        }

        if any_splice {
            // [(List . combine) seg seg ...]: runs of non-splice elements
            // become quoted (or constructed) sublists; splices pass through.
            let mut segments = Vec::new();
            let mut run: Vec<Tmpl> = Vec::new();

            let flush = |run: &mut Vec<Tmpl>, segments: &mut Vec<Value>| {
                if run.is_empty() {
                    return;
                }
                let all_const = run.iter().all(|e| matches!(e, Tmpl::Const(_)));
                if all_const {
                    let values: Vec<Value> = run
                        .drain(..)
                        .map(|element| match element {
                            Tmpl::Const(value) => value,
                            _ => unreachable!("all elements are constant"),
                        })
                        .collect();
                    segments.push(Value::list(vec![
                        Value::Symbol(known::QUOTE),
                        Value::list(values),
                    ]));
                } else {
                    let encoded: Vec<Value> =
                        run.drain(..).map(Tmpl::encode).collect();
                    segments.push(Value::cons(
                        Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
                        Value::list(encoded),
                    ));
                }
            };

            for element in elements {
                match element {
                    Tmpl::Splice(value) => {
                        flush(&mut run, &mut segments);
                        segments.push(value);
                    }
                    other => run.push(other),
                }
            }
            flush(&mut run, &mut segments);

            return Ok(Tmpl::Dyn(Value::cons(
                Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::COMBINE)),
                Value::list(segments),
            )));
        }

        // [(List . of) elem elem ...]
        let encoded: Vec<Value> = elements.into_iter().map(Tmpl::encode).collect();
        Ok(Tmpl::Dyn(Value::cons(
            Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
            Value::list(encoded),
        )))
    }

    /// Convert a parsed raw-form tree into a template: captured variables
    /// become holes, everything else is constant.
    fn tree_to_template(&self, tree: &Value) -> Tmpl {
        match tree {
            Value::Symbol(symbol) if self.is_captured_variable(*symbol) => {
                Tmpl::Dyn(Value::Symbol(*symbol))
            }
            Value::List(cell) => {
                let head = self.tree_to_template(&cell.head);
                let tail_elements: Vec<Tmpl> = cell
                    .tail
                    .iter_list()
                    .map(|element| self.tree_to_template(element))
                    .collect();
                let all_const = matches!(head, Tmpl::Const(_))
                    && tail_elements.iter().all(|e| matches!(e, Tmpl::Const(_)));
                if all_const {
                    Tmpl::Const(tree.clone())
                } else {
                    let mut encoded = vec![head.encode()];
                    encoded.extend(tail_elements.into_iter().map(Tmpl::encode));
                    Tmpl::Dyn(Value::cons(
                        Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
                        Value::list(encoded),
                    ))
                }
            }
            Value::Pair(pair) => {
                let left = self.tree_to_template(&pair.left);
                let right = self.tree_to_template(&pair.right);
                if matches!(left, Tmpl::Const(_)) && matches!(right, Tmpl::Const(_)) {
                    Tmpl::Const(tree.clone())
                } else {
                    Tmpl::Dyn(Value::cons(
                        Value::pair(Value::Symbol(known::LIST), Value::Symbol(known::OF)),
                        Value::list(vec![
                            Value::list(vec![
                                Value::Symbol(known::QUOTE),
                                Value::Symbol(known::DOT),
                            ]),
                            left.encode(),
                            right.encode(),
                        ]),
                    ))
                }
            }
            other => Tmpl::Const(other.clone()),
        }
    }

    //------------------------------------------------------------------
    // #syntax declarations.

    /// `#syntax CLASS: [pattern...] => replacement` - the loanword is
    /// already consumed.  Adds the rule to the innermost scope's table
    /// (copy-on-write) and yields the rule object as the statement value.
    fn parse_syntax_decl(&mut self, pos: Position) -> PResult {
        let (class, _) = self.expect_name("a syntax class name")?;
        self.expect(&Token::Colon, "':'")?;
        self.expect(&Token::LeftBracket, "'['")?;

        let mut pattern = Vec::new();
        let mut captures: Vec<(Symbol, RepeatKind)> = Vec::new();

        loop {
            let token = self.next();
            match token.token {
                Token::RightBracket => break,
                Token::Eoi => {
                    self.error(token.pos, "Expected ']' before end of input");
                    return Err(());
                }
                Token::LeftBracket => {
                    let nt = self.parse_nonterminal_element()?;
                    captures.push((nt.variable, nt.repeat));
                    pattern.push(Value::Nonterminal(Shared::new(nt)));
                }
                Token::Comma => pattern.push(Value::Symbol(self.symbols.intern(","))),
                Token::Semicolon => pattern.push(Value::Symbol(self.symbols.intern(";"))),
                Token::Colon => pattern.push(Value::Symbol(self.symbols.intern(":"))),
                Token::Dot => pattern.push(Value::Symbol(self.symbols.intern("."))),
                Token::LeftParen => pattern.push(Value::Symbol(self.symbols.intern("("))),
                Token::RightParen => pattern.push(Value::Symbol(self.symbols.intern(")"))),
                Token::LeftBrace => pattern.push(Value::Symbol(self.symbols.intern("{"))),
                Token::RightBrace => pattern.push(Value::Symbol(self.symbols.intern("}"))),
                Token::Bar => pattern.push(Value::Symbol(self.symbols.intern("|"))),
                _ if token.token.name_text().is_some() => {
                    let text = token
                        .token
                        .name_text()
                        .expect("just matched a name")
                        .to_string();
                    pattern.push(Value::Symbol(self.symbols.intern(&text)));
                }
                other => {
                    self.error(
                        token.pos,
                        format!("Unexpected {} in a syntax pattern", other.describe()),
                    );
                    return Err(());
                }
            }
        }

        let arrow = self.next();
        if !arrow.token.is_name("=>") {
            self.error(
                arrow.pos,
                format!("Expected '=>', not {}", arrow.token.describe()),
            );
            return Err(());
        }

        // The replacement parses with the captured variables in scope;
        // they must not leak into the surrounding code.
        self.scope.push(ScopeKind::Syntax);
        for &(variable, _) in &captures {
            let _ = self
                .scope
                .declare_here(variable, DeclKind::SyntaxNonterminal, pos);
        }
        let replacement = self.parse_replacement();
        self.scope.pop();
        let replacement = replacement?;

        let rule = SyntaxRule {
            nonterminal: class,
            pattern: Value::list(pattern),
            replacement,
            pos,
        };

        if let Err(problem) = self.scope.syntax_table_mut().add_rule(&rule) {
            self.error(pos, format!("Cannot add syntax rule: {}", problem));
            return Err(());
        }

        Ok(Value::Syntax(Shared::new(rule)))
    }

    /// The replacement side of a `#syntax` declaration.  With or without
    /// an explicit backquote, it parses in template mode; a fully-constant
    /// template is stored as `[$quote tree]`, anything with substitution
    /// holes as the constructor expression.
    fn parse_replacement(&mut self) -> PResult {
        let token = self.look();
        if token.token == Token::Backtick {
            self.next();
        }
        let tmpl = self.parse_template_term(Flags::TOP.grouped())?;
        match tmpl {
            Tmpl::Const(value) => Ok(Value::list(vec![Value::Symbol(known::QUOTE), value])),
            Tmpl::Dyn(value) => Ok(value),
            Tmpl::Splice(_) => {
                self.error(token.pos, "A splice cannot be a whole replacement");
                Err(())
            }
        }
    }

    /// `[CLASS var]`, `[CLASS? var]`, `[CLASS* var sep?]`, `[CLASS+ var sep?]`
    /// - the opening bracket is already consumed.
    fn parse_nonterminal_element(&mut self) -> Result<Nonterminal, ()> {
        let (class, _) = self.expect_name("a nonterminal class name")?;

        let mut repeat = RepeatKind::None;
        let token = self.look();
        if let Some(text) = token.token.name_text() {
            if token.token.is_punct_name() {
                repeat = match text {
                    "?" => RepeatKind::ZeroOrOne,
                    "*" => RepeatKind::ZeroOrMore,
                    "+" => RepeatKind::OneOrMore,
                    _ => RepeatKind::None,
                };
                if repeat != RepeatKind::None {
                    self.next();
                }
            }
        }

        let (variable, _) = self.expect_name("a capture variable name")?;

        let mut separator = Symbol::NONE;
        let token = self.look();
        match token.token {
            Token::Comma => {
                self.next();
                separator = self.symbols.intern(",");
            }
            Token::Semicolon => {
                self.next();
                separator = self.symbols.intern(";");
            }
            _ => (),
        }

        self.expect(&Token::RightBracket, "']'")?;

        Ok(Nonterminal {
            nonterminal: class,
            variable,
            repeat,
            separator,
        })
    }

    //------------------------------------------------------------------
    // Speculative rule matching.

    /// Try the user rules for a precedence class.  Returns [`None`] when
    /// no rule applies (the caller proceeds with the built-in grammar).
    fn try_syntax_rules(&mut self, class: Symbol, flags: Flags) -> Option<PResult> {
        let table: Shared<SyntaxTable> = self.scope.syntax_table().clone();
        let root = &table.class(class)?.root;

        // Cheap rejection before any snapshotting: the current token must
        // start some edge of the trie.
        let token = self.look();
        let starts_terminal = match self.terminal_symbol_of(&token.token) {
            Some(symbol) => root.next_terminals.contains_key(&symbol),
            None => false,
        };
        if !starts_terminal && root.next_nonterminals.is_empty() {
            return None;
        }

        let speculation = self.speculate();
        let mut bindings = AHashMap::new();
        match self.walk_rule_trie(root, flags, &mut bindings) {
            Some(replacement) => Some(Ok(expand_template(&replacement, &bindings))),
            None => {
                self.rollback(speculation);
                None
            }
        }
    }

    /// Walk the trie greedily, preferring deeper matches; terminal edges
    /// win over nonterminal edges, and earlier-declared nonterminal edges
    /// win over later ones.
    fn walk_rule_trie(
        &mut self,
        node: &SyntaxNode,
        flags: Flags,
        bindings: &mut AHashMap<Symbol, Value>,
    ) -> Option<Value> {
        // Terminal edge for the current token?
        let token = self.look();
        if let Some(symbol) = self.terminal_symbol_of(&token.token) {
            if let Some(child) = node.next_terminals.get(&symbol) {
                let speculation = self.speculate();
                self.next();
                if let Some(found) = self.walk_rule_trie(child, flags, bindings) {
                    return Some(found);
                }
                self.rollback(speculation);
            }
        }

        // Nonterminal edges, in declaration order.
        for edge in &node.next_nonterminals {
            let speculation = self.speculate();
            let saved = bindings.get(&edge.element.variable).cloned();
            if self.match_nonterminal(&edge.element, flags, bindings).is_some() {
                if let Some(found) = self.walk_rule_trie(&edge.node, flags, bindings) {
                    return Some(found);
                }
            }
            match saved {
                Some(value) => {
                    bindings.insert(edge.element.variable, value);
                }
                None => {
                    bindings.remove(&edge.element.variable);
                }
            }
            self.rollback(speculation);
        }

        node.replacement.clone()
    }

    /// Match one nonterminal pattern element, honoring its repeat kind,
    /// and record the capture.
    fn match_nonterminal(
        &mut self,
        element: &Nonterminal,
        flags: Flags,
        bindings: &mut AHashMap<Symbol, Value>,
    ) -> Option<()> {
        match element.repeat {
            RepeatKind::None => {
                let value = self.match_nonterminal_once(element.nonterminal, flags)?;
                bindings.insert(element.variable, value);
                Some(())
            }
            RepeatKind::ZeroOrOne => {
                let speculation = self.speculate();
                match self.match_nonterminal_once(element.nonterminal, flags) {
                    Some(value) => {
                        bindings.insert(element.variable, value);
                    }
                    None => {
                        self.rollback(speculation);
                        bindings.insert(element.variable, Value::Null);
                    }
                }
                Some(())
            }
            RepeatKind::ZeroOrMore | RepeatKind::OneOrMore => {
                let mut items = Vec::new();
                loop {
                    let speculation = self.speculate();

                    if !items.is_empty() && !element.separator.is_none() {
                        let token = self.look();
                        let matches_sep = match self.terminal_symbol_of(&token.token) {
                            Some(symbol) => symbol == element.separator,
                            None => false,
                        };
                        if !matches_sep {
                            break;
                        }
                        self.next();
                    }

                    match self.match_nonterminal_once(element.nonterminal, flags) {
                        Some(value) => items.push(value),
                        None => {
                            self.rollback(speculation);
                            break;
                        }
                    }
                }

                if element.repeat == RepeatKind::OneOrMore && items.is_empty() {
                    return None;
                }
                bindings.insert(element.variable, Value::list(items));
                Some(())
            }
        }
    }

    /// Match a single occurrence of a nonterminal class.
    ///
    /// Arbitrary alpha names do not act as operators here; otherwise an
    /// expression nonterminal would swallow the pattern's own terminals
    /// (`[foo [EXPR x] baz]` could never reach `baz`).
    fn match_nonterminal_once(&mut self, class: Symbol, flags: Flags) -> Option<Value> {
        let flags = Flags {
            alpha_ops: false,
            ..flags
        };
        let messages = self.messages.len();
        let result = match class {
            known::STMT => {
                let mut vars = Vec::new();
                self.parse_stmt(flags, &mut vars).ok()
            }
            known::EXPR => self.parse_expr(flags).ok(),
            known::OREXPR => self.parse_or_expr(flags).ok(),
            known::ANDEXPR => self.parse_and_expr(flags).ok(),
            known::NOTEXPR => self.parse_not_expr(flags).ok(),
            known::CMPEXPR => self.parse_cmp_expr(flags).ok(),
            known::ADDEXPR => self.parse_add_expr(flags).ok(),
            known::MULEXPR => self.parse_mul_expr(flags).ok(),
            known::BINARYEXPR => self.parse_binary_expr(flags).ok(),
            known::COLONEXPR => self.parse_colon_expr(flags).ok(),
            known::RANGEEXPR => self.parse_range_expr(flags).ok(),
            known::PREFIXEXPR => self.parse_prefix_expr(flags).ok(),
            known::POSTFIXEXPR => self.parse_postfix_expr(flags).ok(),
            known::CONSEXPR => self.parse_cons_expr(flags).ok(),
            known::DOTEXPR => self.parse_dot_expr(flags).ok(),
            known::TERM => self.parse_term(flags).ok(),
            known::NAME => {
                let token = self.next();
                match token.token.name_text() {
                    Some(text) if token.token.is_alpha_name() => {
                        let text = text.to_string();
                        Some(Value::Symbol(self.symbols.intern(&text)))
                    }
                    _ => None,
                }
            }
            // A user-defined class matches only through its own rules.
            _ => match self.try_syntax_rules(class, flags) {
                Some(Ok(value)) => Some(value),
                _ => None,
            },
        };
        if result.is_none() {
            // Failed speculation must not leak error messages.
            self.messages.truncate(messages);
        }
        result
    }

    /// The terminal symbol a token matches in a syntax pattern, if any.
    fn terminal_symbol_of(&mut self, token: &Token) -> Option<Symbol> {
        match token {
            Token::AlphaName(_)
            | Token::UnknownAlphaName(_)
            | Token::PunctName(_)
            | Token::UnknownPunctName(_) => {
                let text = token.name_text().expect("just matched a name").to_string();
                Some(self.symbols.intern(&text))
            }
            Token::Comma => Some(self.symbols.intern(",")),
            Token::Semicolon => Some(self.symbols.intern(";")),
            Token::Colon => Some(self.symbols.intern(":")),
            Token::Dot => Some(self.symbols.intern(".")),
            Token::LeftParen => Some(self.symbols.intern("(")),
            Token::RightParen => Some(self.symbols.intern(")")),
            Token::LeftBrace => Some(self.symbols.intern("{")),
            Token::RightBrace => Some(self.symbols.intern("}")),
            Token::Bar => Some(self.symbols.intern("|")),
            _ => None,
        }
    }
}
