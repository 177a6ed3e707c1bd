//! Module defining user-declarable grammar rules and the syntax table
//! that drives speculative matching in the parser.

use crate::{known, Position, Symbol, Value};
use ahash::AHashMap;

/// How often a nonterminal in a pattern may repeat.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RepeatKind {
    /// Exactly once.
    None,
    /// Zero or one (`?`).
    ZeroOrOne,
    /// Zero or more (`*`).
    ZeroOrMore,
    /// One or more (`+`).
    OneOrMore,
}

impl RepeatKind {
    /// The marker the declaration syntax uses for this repeat kind.
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::None => "",
            Self::ZeroOrOne => "?",
            Self::ZeroOrMore => "*",
            Self::OneOrMore => "+",
        }
    }
}

/// A pattern element that matches a nonterminal and captures the result:
/// `[EXPR x]`, `[NAME+ flags,]`, and so on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Nonterminal {
    /// The class to match (`EXPR`, `STMT`, a user class...).
    pub nonterminal: Symbol,
    /// The variable that captures the match.
    pub variable: Symbol,
    /// How often the nonterminal repeats.
    pub repeat: RepeatKind,
    /// Separator between repetitions ([`Symbol::NONE`] for none).
    pub separator: Symbol,
}

/// A parsed grammar rule: nonterminal class, pattern, and replacement
/// template.
#[derive(Debug, Clone)]
pub struct SyntaxRule {
    /// The class this rule extends.
    pub nonterminal: Symbol,
    /// The pattern: a proper list of terminal symbols and
    /// [`Value::Nonterminal`] elements.
    pub pattern: Value,
    /// The replacement template, in the quote-constructor encoding the
    /// parser produces for backquoted forms.
    pub replacement: Value,
    /// Where the rule was declared.
    pub pos: Position,
}

/// An edge from a trie node through a nonterminal.
#[derive(Debug, Clone)]
pub struct NonterminalEdge {
    /// The nonterminal to match along this edge.
    pub element: Nonterminal,
    /// The node this edge leads to.
    pub node: SyntaxNode,
}

/// One node of a syntax-class trie.
#[derive(Debug, Clone, Default)]
pub struct SyntaxNode {
    /// Edges keyed by terminal symbol.
    pub next_terminals: AHashMap<Symbol, SyntaxNode>,
    /// Edges through nonterminals, in declaration order (the matcher
    /// breaks ties in favor of the earliest-declared rule).
    pub next_nonterminals: Vec<NonterminalEdge>,
    /// Present only on accepting nodes: the replacement template.
    pub replacement: Option<Value>,
    /// Declaration order of the accepted rule, for diagnostics and
    /// tie-breaking.
    pub rule_id: u32,
}

/// All rules for one nonterminal class, as a trie.
#[derive(Debug, Clone, Default)]
pub struct SyntaxClass {
    /// The trie root.
    pub root: SyntaxNode,
}

/// The set of grammar rules in effect at a point in the parse.
///
/// Tables are shared by reference from parse scopes; a mutation through a
/// scope whose table is shared first clones it (copy-on-write), so a child
/// scope's rules vanish when the scope ends and the parent's table is
/// untouched, byte for byte.
#[derive(Debug, Clone, Default)]
pub struct SyntaxTable {
    classes: AHashMap<Symbol, SyntaxClass>,
    next_rule_id: u32,
}

/// The classes whose rules must begin with a keyword unless they extend
/// the class in its expected left-recursive shape.  For each, the one
/// nonterminal an initial pattern element may name.
fn left_recursive_class(class: Symbol) -> Option<Symbol> {
    match class {
        known::CMPEXPR => Some(known::ADDEXPR),
        known::ADDEXPR => Some(known::MULEXPR),
        known::MULEXPR => Some(known::BINARYEXPR),
        known::BINARYEXPR => Some(known::COLONEXPR),
        known::POSTFIXEXPR => Some(known::CONSEXPR),
        _ => None,
    }
}

fn is_keyword_only_class(class: Symbol) -> bool {
    matches!(
        class,
        known::STMT | known::EXPR | known::PREFIXEXPR | known::TERM
    )
}

/// Is this terminal one of the class's own built-in operators?  A
/// left-recursive rule must not begin `[[ADDEXPR x] < ...]` and the like;
/// firing it would shadow the built-in operator for the rest of the
/// program.
fn is_reserved_operator(class: Symbol, terminal: Symbol) -> bool {
    match class {
        known::CMPEXPR => matches!(
            terminal,
            known::LT
                | known::GT
                | known::LE
                | known::GE
                | known::EQUALS
                | known::NOT_EQUALS
                | known::IS_WORD
        ),
        known::ADDEXPR => matches!(terminal, known::PLUS | known::MINUS),
        known::MULEXPR => matches!(terminal, known::STAR | known::SLASH),
        _ => false,
    }
}

impl SyntaxTable {
    /// Create an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the trie for a class.
    #[inline]
    #[must_use]
    pub fn class(&self, nonterminal: Symbol) -> Option<&SyntaxClass> {
        self.classes.get(&nonterminal)
    }

    /// Are there any rules at all?
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Add a rule, validating it first.  Returns a description of the
    /// problem when the rule is rejected.
    pub fn add_rule(&mut self, rule: &SyntaxRule) -> Result<(), String> {
        if rule.replacement.is_null() {
            return Err("a syntax rule must have a replacement".to_string());
        }

        let elements: Vec<Value> = rule.pattern.iter_list().cloned().collect();
        if elements.is_empty() {
            return Err("a syntax rule must have a nonempty pattern".to_string());
        }

        // Validate the shape of the initial element.
        match &elements[0] {
            Value::Symbol(_) => (),
            Value::Nonterminal(nt) => {
                if matches!(nt.repeat, RepeatKind::ZeroOrOne | RepeatKind::ZeroOrMore) {
                    return Err(
                        "a syntax rule cannot start with an optional nonterminal".to_string()
                    );
                }
                if nt.nonterminal == rule.nonterminal {
                    return Err(
                        "a syntax rule cannot start with its own class".to_string()
                    );
                }
                if is_keyword_only_class(rule.nonterminal) {
                    return Err(
                        "rules for this class must start with a keyword, not a nonterminal"
                            .to_string(),
                    );
                }
                if let Some(expected) = left_recursive_class(rule.nonterminal) {
                    if nt.nonterminal != expected {
                        return Err(
                            "this class can only be extended with its own left-recursive shape"
                                .to_string(),
                        );
                    }
                    // The element after the initial nonterminal must be a
                    // terminal, or the rule would be indistinguishable from
                    // the built-in grammar - and it must not be one of the
                    // operators the class already owns.
                    match elements.get(1) {
                        Some(Value::Symbol(terminal)) => {
                            if is_reserved_operator(rule.nonterminal, *terminal) {
                                return Err(
                                    "a left-recursive rule cannot redefine one of the \
                                     class's built-in operators"
                                        .to_string(),
                                );
                            }
                        }
                        _ => {
                            return Err(
                                "a left-recursive rule needs a terminal after its initial \
                                 nonterminal"
                                    .to_string(),
                            )
                        }
                    }
                }
            }
            _ => return Err("pattern elements must be terminals or nonterminals".to_string()),
        }

        // Walk the trie, creating edges as needed.
        let class = self.classes.entry(rule.nonterminal).or_default();
        let mut node = &mut class.root;

        for element in &elements {
            match element {
                Value::Symbol(symbol) => {
                    node = node.next_terminals.entry(*symbol).or_default();
                }
                Value::Nonterminal(nt) => {
                    let position = node
                        .next_nonterminals
                        .iter()
                        .position(|edge| edge.element == **nt);
                    let index = match position {
                        Some(index) => index,
                        None => {
                            node.next_nonterminals.push(NonterminalEdge {
                                element: (**nt).clone(),
                                node: SyntaxNode::default(),
                            });
                            node.next_nonterminals.len() - 1
                        }
                    };
                    node = &mut node.next_nonterminals[index].node;
                }
                _ => return Err("pattern elements must be terminals or nonterminals".to_string()),
            }
        }

        if node.replacement.is_some() {
            return Err("a rule with this pattern already exists".to_string());
        }

        node.replacement = Some(rule.replacement.clone());
        node.rule_id = self.next_rule_id;
        self.next_rule_id += 1;

        Ok(())
    }
}

/// Expand a replacement template with the given captured bindings.
///
/// Templates are stored in the constructor encoding the quote parser
/// produces: `[$quote tree]` for constant parts, `[(List . of) ...]` and
/// `[(List . combine) ...]` where substitution happens, bare symbols for
/// captured variables, and `[$dot left right]` where a pair must be
/// rebuilt around a substituted value.  Anything else (a method call such
/// as `join`, a free variable) is copied through with its children
/// expanded, becoming ordinary runtime code in the output.
pub(crate) fn expand_template(template: &Value, bindings: &AHashMap<Symbol, Value>) -> Value {
    match template {
        Value::Symbol(symbol) => bindings
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| template.clone()),
        Value::List(cell) => {
            // [$quote tree] yields the tree verbatim.
            if cell.head.as_symbol() == Some(known::QUOTE) {
                if let Value::List(arg) = &cell.tail {
                    return arg.head.clone();
                }
            }

            // [(List . of) ...] and [(List . combine) ...] construct.
            if let Value::Pair(pair) = &cell.head {
                if pair.left.as_symbol() == Some(known::LIST) {
                    match pair.right.as_symbol() {
                        Some(known::OF) => {
                            let items: Vec<Value> = cell
                                .tail
                                .iter_list()
                                .map(|item| expand_template(item, bindings))
                                .collect();
                            return finish_constructed_list(items);
                        }
                        Some(known::COMBINE) => {
                            let mut items = Vec::new();
                            for segment in cell.tail.iter_list() {
                                let segment = expand_template(segment, bindings);
                                items.extend(segment.iter_list().cloned());
                            }
                            return finish_constructed_list(items);
                        }
                        _ => (),
                    }
                }
            }

            // Anything else: expand children in place.
            let items: Vec<Value> = cell
                .tail
                .iter_list()
                .map(|item| expand_template(item, bindings))
                .collect();
            let head = expand_template(&cell.head, bindings);
            Value::cons(head, Value::list(items))
        }
        Value::Pair(pair) => Value::pair(
            expand_template(&pair.left, bindings),
            expand_template(&pair.right, bindings),
        ),
        _ => template.clone(),
    }
}

/// A constructed list of the shape `[$dot left right]` denotes a pair to
/// rebuild; anything else stays a list.
fn finish_constructed_list(items: Vec<Value>) -> Value {
    if items.len() == 3 && items[0].as_symbol() == Some(known::DOT) {
        let mut items = items;
        let right = items.pop().expect("just checked length");
        let left = items.pop().expect("just checked length");
        return Value::pair(left, right);
    }
    Value::list(items)
}
