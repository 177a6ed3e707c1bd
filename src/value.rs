//! Module defining the tagged [`Value`] type and the object shapes built
//! on it: cons lists, pairs, user objects, and native handles.

use crate::bytecode::Program;
use crate::native::ExternalFunction;
use crate::syntax::{Nonterminal, SyntaxRule};
use crate::{known, Closure, ImmutableString, Locked, Position, Shared, Symbol, SymbolTable};
use ahash::AHashMap;
use std::fmt;
use std::fmt::Write as _;

/// A cons cell.  The tail may be any value; a chain of cells whose final
/// tail is null is a proper list.  Cells are immutable once built and may
/// be shared structurally.
#[derive(Debug, Clone)]
pub struct Cons {
    /// The first element.
    pub head: Value,
    /// The rest of the list (or any value, for a dotted tail).
    pub tail: Value,
    /// Advisory source position; never affects equality.
    pub pos: Position,
}

/// The object/property pair `left.right`, used as an expression form.
#[derive(Debug, Clone)]
pub struct Pair {
    /// The object side.
    pub left: Value,
    /// The property side.
    pub right: Value,
    /// Advisory source position; never affects equality.
    pub pos: Position,
}

/// A property bag with a base link forming an inheritance chain.
#[derive(Debug, Default)]
pub struct UserObject {
    /// The object this one inherits from ([`Value::Null`] terminates the
    /// chain).  Construction keeps chains acyclic.
    pub base: Value,
    /// The object's own properties.
    pub props: AHashMap<Symbol, Value>,
}

impl UserObject {
    /// Look up a property on this object or any of its bases.
    #[must_use]
    pub fn get_property(&self, symbol: Symbol) -> Option<Value> {
        if let Some(value) = self.props.get(&symbol) {
            return Some(value.clone());
        }
        let mut base = self.base.clone();
        while let Value::Object(parent) = base {
            if let Some(value) = parent.borrow().props.get(&symbol) {
                return Some(value.clone());
            }
            let next = parent.borrow().base.clone();
            base = next;
        }
        None
    }
}

/// An opaque native resource (a file, a compiled regex, and so on).
///
/// The evaluator talks to handles only through this vtable.
pub trait Handle {
    /// The handle's type name, for diagnostics.
    fn type_name(&self) -> &str;

    /// Release the underlying resource.  Must be idempotent.
    fn end(&self);

    /// The handle's truthiness.
    fn to_bool(&self) -> bool {
        true
    }

    /// A printable rendering.
    fn to_display(&self) -> String {
        format!("<handle:{}>", self.type_name())
    }

    /// Read a named property, if the handle has one.
    fn get_property(&self, _symbol: Symbol) -> Option<Value> {
        None
    }

    /// Does the handle have the named property?
    fn has_property(&self, symbol: Symbol) -> bool {
        self.get_property(symbol).is_some()
    }

    /// The names of all readable properties.
    fn property_names(&self) -> Vec<Symbol> {
        Vec::new()
    }
}

/// A callable value: either a compiled closure or an external function.
pub enum Function {
    /// A compiled Smile function plus its captured environment.
    Compiled {
        /// The program containing the function's bytecode and tables.
        program: Shared<Program>,
        /// Index into [`Program::functions`].
        index: u32,
        /// The activation captured as the function's lexical environment.
        parent: Option<Shared<Locked<Closure>>>,
    },
    /// A native function.
    External(Shared<ExternalFunction>),
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compiled { index, .. } => write!(f, "Function::Compiled({})", index),
            Self::External(ext) => write!(f, "Function::External({})", ext.name),
        }
    }
}

/// The discriminant of a [`Value`], used in argument-check masks and
/// diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ValueKind {
    Null = 0,
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    Int128,
    Float32,
    Float64,
    Char,
    Uni,
    Symbol,
    String,
    List,
    Pair,
    Object,
    Function,
    Handle,
    Syntax,
    Nonterminal,
}

impl ValueKind {
    /// A human-readable name for this kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Int16 => "integer16",
            Self::Int32 => "integer32",
            Self::Int64 => "integer64",
            Self::Int128 => "integer128",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Char => "char",
            Self::Uni => "uni",
            Self::Symbol => "symbol",
            Self::String => "string",
            Self::List => "list",
            Self::Pair => "pair",
            Self::Object => "object",
            Self::Function => "function",
            Self::Handle => "handle",
            Self::Syntax => "syntax",
            Self::Nonterminal => "nonterminal",
        }
    }

    /// The symbol `[$typeof ...]` evaluates to for values of this kind.
    #[must_use]
    pub const fn type_symbol(self) -> Symbol {
        match self {
            Self::Null => known::NULL_WORD,
            Self::Bool => known::TYPE_BOOL,
            Self::Byte => known::TYPE_BYTE,
            Self::Int16 => known::TYPE_INTEGER16,
            Self::Int32 => known::TYPE_INTEGER32,
            Self::Int64 => known::TYPE_INTEGER64,
            Self::Int128 => known::TYPE_INTEGER128,
            Self::Float32 => known::TYPE_FLOAT32,
            Self::Float64 => known::TYPE_FLOAT64,
            Self::Char => known::TYPE_CHAR,
            Self::Uni => known::TYPE_UNI,
            Self::Symbol => known::TYPE_SYMBOL,
            Self::String => known::TYPE_STRING,
            Self::List => known::TYPE_LIST,
            Self::Pair => known::TYPE_PAIR,
            Self::Object => known::TYPE_OBJECT,
            Self::Function => known::TYPE_FUNCTION,
            Self::Handle => known::TYPE_HANDLE,
            Self::Syntax => known::TYPE_SYNTAX,
            Self::Nonterminal => known::TYPE_NONTERMINAL,
        }
    }
}

/// A Smile value.
///
/// The empty list is the [`Value::Null`] singleton, not a distinct object.
/// Lists and pairs are immutable; user objects have mutable interiors
/// behind shared references, so cloning a [`Value`] never deep-copies.
#[derive(Clone, Default)]
pub enum Value {
    /// The null singleton (also the empty list).
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Float32(f32),
    Float64(f64),
    /// A single byte of text.
    Char(u8),
    /// A Unicode scalar.
    Uni(char),
    Symbol(Symbol),
    Str(ImmutableString),
    List(Shared<Cons>),
    Pair(Shared<Pair>),
    Object(Shared<Locked<UserObject>>),
    Function(Shared<Function>),
    Handle(Shared<dyn Handle>),
    Syntax(Shared<SyntaxRule>),
    Nonterminal(Shared<Nonterminal>),
}

impl Value {
    /// Build a cons cell.
    #[inline]
    #[must_use]
    pub fn cons(head: Value, tail: Value) -> Self {
        Self::List(Shared::new(Cons {
            head,
            tail,
            pos: Position::NONE,
        }))
    }

    /// Build a cons cell with a source position.
    #[inline]
    #[must_use]
    pub fn cons_at(head: Value, tail: Value, pos: Position) -> Self {
        Self::List(Shared::new(Cons { head, tail, pos }))
    }

    /// Build a proper list from elements.
    #[must_use]
    pub fn list(elements: Vec<Value>) -> Self {
        let mut tail = Value::Null;
        for element in elements.into_iter().rev() {
            tail = Value::cons(element, tail);
        }
        tail
    }

    /// Build a pair.
    #[inline]
    #[must_use]
    pub fn pair(left: Value, right: Value) -> Self {
        Self::Pair(Shared::new(Pair {
            left,
            right,
            pos: Position::NONE,
        }))
    }

    /// Build an empty user object inheriting from `base`.
    #[must_use]
    pub fn object(base: Value) -> Self {
        Self::Object(Shared::new(Locked::new(UserObject {
            base,
            props: AHashMap::new(),
        })))
    }

    /// The discriminant of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Byte(_) => ValueKind::Byte,
            Self::Int16(_) => ValueKind::Int16,
            Self::Int32(_) => ValueKind::Int32,
            Self::Int64(_) => ValueKind::Int64,
            Self::Int128(_) => ValueKind::Int128,
            Self::Float32(_) => ValueKind::Float32,
            Self::Float64(_) => ValueKind::Float64,
            Self::Char(_) => ValueKind::Char,
            Self::Uni(_) => ValueKind::Uni,
            Self::Symbol(_) => ValueKind::Symbol,
            Self::Str(_) => ValueKind::String,
            Self::List(_) => ValueKind::List,
            Self::Pair(_) => ValueKind::Pair,
            Self::Object(_) => ValueKind::Object,
            Self::Function(_) => ValueKind::Function,
            Self::Handle(_) => ValueKind::Handle,
            Self::Syntax(_) => ValueKind::Syntax,
            Self::Nonterminal(_) => ValueKind::Nonterminal,
        }
    }

    /// Is this the null singleton?
    #[inline(always)]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The value's truthiness: null, false, numeric zero, the zero
    /// character, and the empty string are falsy; everything else is
    /// truthy.
    #[must_use]
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Byte(n) => *n != 0,
            Self::Int16(n) => *n != 0,
            Self::Int32(n) => *n != 0,
            Self::Int64(n) => *n != 0,
            Self::Int128(n) => *n != 0,
            Self::Float32(n) => *n != 0.0,
            Self::Float64(n) => *n != 0.0,
            Self::Char(c) => *c != 0,
            Self::Uni(c) => *c != '\0',
            Self::Str(s) => !s.is_empty(),
            Self::Handle(h) => h.to_bool(),
            _ => true,
        }
    }

    /// The symbol inside, if this is a symbol.
    #[inline]
    #[must_use]
    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    /// The cons cell inside, if this is a list cell.
    #[inline]
    #[must_use]
    pub fn as_cons(&self) -> Option<&Shared<Cons>> {
        match self {
            Self::List(cell) => Some(cell),
            _ => None,
        }
    }

    /// Iterate over the elements of a proper list (stopping at a dotted
    /// tail).
    #[inline]
    pub fn iter_list(&self) -> ListIter<'_> {
        ListIter { current: self }
    }

    /// The length of a proper list, or [`None`] if the tail is dotted.
    #[must_use]
    pub fn list_len(&self) -> Option<usize> {
        let mut count = 0;
        let mut current = self;
        loop {
            match current {
                Self::Null => return Some(count),
                Self::List(cell) => {
                    count += 1;
                    current = &cell.tail;
                }
                _ => return None,
            }
        }
    }

    /// Reference identity / primitive equality, the `$eq` comparison:
    /// primitives compare by kind and value, everything else by identity.
    #[must_use]
    pub fn super_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Byte(a), Self::Byte(b)) => a == b,
            (Self::Int16(a), Self::Int16(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Int128(a), Self::Int128(b)) => a == b,
            (Self::Float32(a), Self::Float32(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Uni(a), Self::Uni(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Shared::ptr_eq(a, b),
            (Self::Pair(a), Self::Pair(b)) => Shared::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Shared::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Shared::ptr_eq(a, b),
            (Self::Handle(a), Self::Handle(b)) => Shared::ptr_eq(a, b),
            (Self::Syntax(a), Self::Syntax(b)) => Shared::ptr_eq(a, b),
            (Self::Nonterminal(a), Self::Nonterminal(b)) => Shared::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Walk this value's base chain looking for `target`, the `$is` test.
    /// When `target` is a symbol, it instead matches the value's type
    /// symbol.
    #[must_use]
    pub fn is_a(&self, target: &Value) -> bool {
        if let Value::Symbol(symbol) = target {
            return self.kind().type_symbol() == *symbol;
        }
        if self.super_eq(target) {
            return true;
        }
        if let Value::Object(object) = self {
            let mut base = object.borrow().base.clone();
            loop {
                if base.super_eq(target) {
                    return true;
                }
                match base {
                    Value::Object(parent) => {
                        let next = parent.borrow().base.clone();
                        base = next;
                    }
                    _ => return false,
                }
            }
        }
        false
    }

    /// Read a named property of this value.  User objects consult their
    /// property chain; the core shapes expose their well-known properties
    /// (`a`/`d` on lists, `left`/`right` on pairs, `length`/`count` on
    /// strings and lists).
    #[must_use]
    pub fn get_property(&self, symbol: Symbol) -> Option<Value> {
        match self {
            Self::Object(object) => object.borrow().get_property(symbol),
            Self::List(cell) => match symbol {
                known::A | known::LEFT | known::START => Some(cell.head.clone()),
                known::D | known::RIGHT | known::END => Some(cell.tail.clone()),
                known::COUNT | known::LENGTH => {
                    self.list_len().map(|n| Value::Int64(n as i64))
                }
                _ => None,
            },
            Self::Pair(pair) => match symbol {
                known::LEFT | known::A => Some(pair.left.clone()),
                known::RIGHT | known::D => Some(pair.right.clone()),
                _ => None,
            },
            Self::Str(s) => match symbol {
                known::LENGTH | known::COUNT => Some(Value::Int64(s.len() as i64)),
                _ => None,
            },
            Self::Handle(handle) => handle.get_property(symbol),
            _ => None,
        }
    }

    /// Render this value the way `join` and string interpolation do:
    /// strings bare, characters bare, everything else in raw form.
    #[must_use]
    pub fn to_display(&self, symbols: &SymbolTable) -> String {
        match self {
            Self::Str(s) => s.as_str().to_string(),
            Self::Char(c) => (*c as char).to_string(),
            Self::Uni(c) => c.to_string(),
            Self::Null => String::new(),
            _ => self.stringify(symbols),
        }
    }

    /// Render this value in the stable raw-form notation: lists as
    /// `[elem elem ...]`, dotted pairs as `(left . right)`, symbols as
    /// their names, strings quoted with C-style escapes, numeric literals
    /// with their suffixes.
    #[must_use]
    pub fn stringify(&self, symbols: &SymbolTable) -> String {
        let mut out = String::new();
        self.stringify_into(&mut out, symbols);
        out
    }

    fn stringify_into(&self, out: &mut String, symbols: &SymbolTable) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Byte(n) => {
                let _ = write!(out, "{}x", n);
            }
            Self::Int16(n) => {
                let _ = write!(out, "{}h", n);
            }
            Self::Int32(n) => {
                let _ = write!(out, "{}L", n);
            }
            Self::Int64(n) => {
                let _ = write!(out, "{}", n);
            }
            Self::Int128(n) => {
                let _ = write!(out, "{}", n);
            }
            Self::Float32(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    let _ = write!(out, "{:.1}f", n);
                } else {
                    let _ = write!(out, "{}f", n);
                }
            }
            Self::Float64(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    let _ = write!(out, "{:.1}", n);
                } else {
                    let _ = write!(out, "{}", n);
                }
            }
            Self::Char(c) => {
                let _ = write!(out, "'{}'", escape_char(*c as char));
            }
            Self::Uni(c) => {
                if c.is_ascii() {
                    let _ = write!(out, "'{}'", escape_char(*c));
                } else {
                    let _ = write!(out, "'\\u{:04X}'", *c as u32);
                }
            }
            Self::Symbol(s) => out.push_str(symbols.name(*s)),
            Self::Str(s) => {
                out.push('"');
                for ch in s.chars() {
                    out.push_str(&escape_char(ch));
                }
                out.push('"');
            }
            Self::List(_) => {
                out.push('[');
                let mut current = self;
                let mut first = true;
                loop {
                    match current {
                        Self::List(cell) => {
                            if !first {
                                out.push(' ');
                            }
                            first = false;
                            cell.head.stringify_into(out, symbols);
                            current = &cell.tail;
                        }
                        Self::Null => break,
                        tail => {
                            out.push_str(" . ");
                            tail.stringify_into(out, symbols);
                            break;
                        }
                    }
                }
                out.push(']');
            }
            Self::Pair(pair) => {
                out.push('(');
                pair.left.stringify_into(out, symbols);
                out.push_str(" . ");
                pair.right.stringify_into(out, symbols);
                out.push(')');
            }
            Self::Object(_) => out.push_str("{object}"),
            Self::Function(_) => out.push_str("<fn>"),
            Self::Handle(handle) => out.push_str(&handle.to_display()),
            Self::Syntax(rule) => {
                let _ = write!(out, "#syntax {}", symbols.name(rule.nonterminal));
            }
            Self::Nonterminal(nt) => {
                out.push('[');
                out.push_str(symbols.name(nt.nonterminal));
                out.push_str(nt.repeat.marker());
                out.push(' ');
                out.push_str(symbols.name(nt.variable));
                if !nt.separator.is_none() {
                    out.push(' ');
                    out.push_str(symbols.name(nt.separator));
                }
                out.push(']');
            }
        }
    }
}

fn escape_char(ch: char) -> String {
    match ch {
        '\\' => "\\\\".to_string(),
        '"' => "\\\"".to_string(),
        '\n' => "\\n".to_string(),
        '\r' => "\\r".to_string(),
        '\t' => "\\t".to_string(),
        '\0' => "\\0".to_string(),
        '\x07' => "\\a".to_string(),
        '\x08' => "\\b".to_string(),
        '\x0B' => "\\v".to_string(),
        '\x0C' => "\\f".to_string(),
        '\x1B' => "\\e".to_string(),
        ch if (ch as u32) < 0x20 => format!("\\x{:02X}", ch as u32),
        ch => ch.to_string(),
    }
}

/// Structural equality, ignoring source positions.  Lists and pairs
/// compare element-wise; user objects, functions, and handles compare by
/// identity (their interiors are mutable).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::List(a), Self::List(b)) => {
                Shared::ptr_eq(a, b) || (a.head == b.head && a.tail == b.tail)
            }
            (Self::Pair(a), Self::Pair(b)) => {
                Shared::ptr_eq(a, b) || (a.left == b.left && a.right == b.right)
            }
            _ => self.super_eq(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Byte(n) => write!(f, "Byte({})", n),
            Self::Int16(n) => write!(f, "Int16({})", n),
            Self::Int32(n) => write!(f, "Int32({})", n),
            Self::Int64(n) => write!(f, "Int64({})", n),
            Self::Int128(n) => write!(f, "Int128({})", n),
            Self::Float32(n) => write!(f, "Float32({})", n),
            Self::Float64(n) => write!(f, "Float64({})", n),
            Self::Char(c) => write!(f, "Char({:?})", *c as char),
            Self::Uni(c) => write!(f, "Uni({:?})", c),
            Self::Symbol(s) => write!(f, "Symbol(#{})", s.id()),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::List(cell) => write!(f, "List({:?} . {:?})", cell.head, cell.tail),
            Self::Pair(pair) => write!(f, "Pair({:?} . {:?})", pair.left, pair.right),
            Self::Object(_) => f.write_str("Object(..)"),
            Self::Function(func) => write!(f, "{:?}", func),
            Self::Handle(handle) => write!(f, "Handle({})", handle.type_name()),
            Self::Syntax(_) => f.write_str("Syntax(..)"),
            Self::Nonterminal(_) => f.write_str("Nonterminal(..)"),
        }
    }
}

/// Fallback display used in diagnostics when no symbol table is at hand;
/// symbol names print as `#id`.  Prefer [`Value::stringify`].
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Iterator over the elements of a proper list.
pub struct ListIter<'a> {
    current: &'a Value,
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        match self.current {
            Value::List(cell) => {
                self.current = &cell.tail;
                Some(&cell.head)
            }
            _ => None,
        }
    }
}
