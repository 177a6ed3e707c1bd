//! Module defining interned symbols and the process-wide symbol table.

use crate::ImmutableString;
use ahash::AHashMap;
use std::fmt;

/// An interned name.
///
/// A [`Symbol`] is a small integer handle assigned by a [`SymbolTable`];
/// two symbols are the same name exactly when their ids are equal.  Id 0 is
/// reserved and never names anything.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Symbol(pub(crate) u32);

impl Symbol {
    /// The reserved "no symbol" sentinel.
    pub const NONE: Self = Self(0);

    /// Get the raw id of this symbol.
    #[inline(always)]
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }

    /// Is this the reserved sentinel?
    #[inline(always)]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

macro_rules! known_symbols {
    ($($id:literal => $konst:ident => $text:literal),* $(,)?) => {
        /// Pre-interned symbols with fixed ids.
        ///
        /// [`SymbolTable::new`] interns these names first, in declaration
        /// order, so the parser and compiler can compare against constants
        /// instead of looking names up.
        pub mod known {
            use super::Symbol;

            $(
                #[doc = concat!("The symbol `", $text, "`.")]
                pub const $konst: Symbol = Symbol($id);
            )*

            pub(crate) static NAMES: &[(&str, Symbol)] = &[$(($text, $konst),)*];
        }
    };
}

known_symbols! {
    // The special forms.
    1 => SET => "$set",
    2 => OPSET => "$opset",
    3 => IF => "$if",
    4 => WHILE => "$while",
    5 => TILL => "$till",
    6 => CATCH => "$catch",
    7 => RETURN => "$return",
    8 => FN => "$fn",
    9 => QUOTE => "$quote",
    10 => PROG1 => "$prog1",
    11 => PROGN => "$progn",
    12 => SCOPE => "$scope",
    13 => NEW => "$new",
    14 => IS => "$is",
    15 => TYPEOF => "$typeof",
    16 => EQ => "$eq",
    17 => NE => "$ne",
    18 => AND => "$and",
    19 => OR => "$or",
    20 => NOT => "$not",
    21 => DOT => "$dot",
    22 => INDEX => "$index",

    // The core operators.
    23 => PLUS => "+",
    24 => MINUS => "-",
    25 => STAR => "*",
    26 => SLASH => "/",
    27 => LT => "<",
    28 => GT => ">",
    29 => LE => "<=",
    30 => GE => ">=",
    31 => EQUALS => "==",
    32 => NOT_EQUALS => "!=",
    33 => CONS_OP => "##",

    // Object and list vocabulary.
    34 => OBJECT => "Object",
    35 => LIST => "List",
    36 => OF => "of",
    37 => COMBINE => "combine",
    38 => JOIN => "join",
    39 => CONS => "cons",
    40 => RANGE => "range",
    41 => A => "a",
    42 => D => "d",
    43 => LEFT => "left",
    44 => RIGHT => "right",
    45 => START => "start",
    46 => END => "end",
    47 => COUNT => "count",
    48 => LENGTH => "length",
    49 => GET_MEMBER => "get-member",
    50 => SET_MEMBER => "set-member",
    51 => FN_WORD => "fn",
    52 => DOES_NOT_UNDERSTAND => "does-not-understand",
    53 => KIND => "kind",
    54 => MESSAGE => "message",
    55 => STACK_TRACE => "stack-trace",

    // The predeclared grammar classes.
    56 => STMT => "STMT",
    57 => EXPR => "EXPR",
    58 => OREXPR => "OREXPR",
    59 => ANDEXPR => "ANDEXPR",
    60 => NOTEXPR => "NOTEXPR",
    61 => CMPEXPR => "CMPEXPR",
    62 => ADDEXPR => "ADDEXPR",
    63 => MULEXPR => "MULEXPR",
    64 => BINARYEXPR => "BINARYEXPR",
    65 => COLONEXPR => "COLONEXPR",
    66 => RANGEEXPR => "RANGEEXPR",
    67 => PREFIXEXPR => "PREFIXEXPR",
    68 => POSTFIXEXPR => "POSTFIXEXPR",
    69 => CONSEXPR => "CONSEXPR",
    70 => DOTEXPR => "DOTEXPR",
    71 => TERM => "TERM",
    72 => NAME => "NAME",

    // Well-known globals maintained by a REPL host.
    73 => REPL_A => "$a",
    74 => REPL_P => "$p",
    75 => REPL_E => "$e",
    76 => REPL_LAST => "$_",

    // Literal words.
    77 => NULL_WORD => "null",
    78 => TRUE_WORD => "true",
    79 => FALSE_WORD => "false",

    // Type names, as produced by [$typeof ...].
    80 => TYPE_BOOL => "bool",
    81 => TYPE_BYTE => "byte",
    82 => TYPE_INTEGER16 => "integer16",
    83 => TYPE_INTEGER32 => "integer32",
    84 => TYPE_INTEGER64 => "integer64",
    85 => TYPE_INTEGER128 => "integer128",
    86 => TYPE_FLOAT32 => "float32",
    87 => TYPE_FLOAT64 => "float64",
    88 => TYPE_CHAR => "char",
    89 => TYPE_UNI => "uni",
    90 => TYPE_SYMBOL => "symbol",
    91 => TYPE_STRING => "string",
    92 => TYPE_LIST => "list",
    93 => TYPE_PAIR => "pair",
    94 => TYPE_OBJECT => "object",
    95 => TYPE_FUNCTION => "function",
    96 => TYPE_HANDLE => "handle",
    97 => TYPE_SYNTAX => "syntax",
    98 => TYPE_NONTERMINAL => "nonterminal",

    // Well-known exception kinds.
    99 => NATIVE_METHOD_ERROR => "native-method-error",
    100 => EVAL_ERROR => "eval-error",
    101 => COMPILE_ERROR => "compile-error",
    102 => STOPPED_AT_BREAKPOINT => "stopped-at-breakpoint",
    103 => UNKNOWN_ERROR => "unknown-error",

    // The comparison word, reserved at the CMPEXPR level.
    104 => IS_WORD => "is",
}

/// The table that assigns ids to names.
///
/// Lookups by string return the existing id or assign the next one; the
/// table grows monotonically and ids are never recycled.  A single writer
/// with any number of readers is the supported discipline; the table is
/// not internally synchronized.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    map: AHashMap<ImmutableString, Symbol>,
    names: Vec<ImmutableString>,
}

impl SymbolTable {
    /// Create a new [`SymbolTable`] with all [`known`] symbols pre-interned
    /// at their fixed ids.
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self {
            map: AHashMap::with_capacity(known::NAMES.len() * 2),
            names: Vec::with_capacity(known::NAMES.len() + 1),
        };

        // Index 0 is the reserved sentinel.
        table.names.push(ImmutableString::from(""));

        for &(name, expected) in known::NAMES {
            let symbol = table.intern(name);
            debug_assert_eq!(symbol, expected, "known symbol {:?} out of order", name);
        }

        table
    }

    /// Intern a name, returning its existing id or assigning a new one.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&symbol) = self.map.get(name) {
            return symbol;
        }

        let symbol = Symbol(self.names.len() as u32);
        let name = ImmutableString::from(name);
        self.names.push(name.clone());
        self.map.insert(name, symbol);
        symbol
    }

    /// Look up a name without interning it.
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.map.get(name).copied()
    }

    /// Get the name of an interned symbol.
    ///
    /// The sentinel and any symbol from another table yield the empty string.
    #[inline]
    #[must_use]
    pub fn name(&self, symbol: Symbol) -> &str {
        self.names
            .get(symbol.0 as usize)
            .map_or("", ImmutableString::as_str)
    }

    /// The number of interned symbols (the sentinel excluded).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len() - 1
    }

    /// Is the table empty?  (It never is; the known symbols are always present.)
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for SymbolTable {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}
