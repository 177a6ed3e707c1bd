//! Module defining the closure model: static [`ClosureInfo`] shared by all
//! activations of a function, and dynamic [`Closure`] created per call.

use crate::{Locked, Shared, Symbol, Value};
use ahash::AHashMap;

/// What kind of variable a closure slot holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VarKind {
    /// A function argument.
    Argument,
    /// A local variable.
    Local,
}

/// Where a variable lives inside a closure.
#[derive(Debug, Clone, Copy)]
pub struct VarInfo {
    /// Argument or local.
    pub kind: VarKind,
    /// Slot index (arguments first, then locals).
    pub offset: usize,
    /// The variable's name.
    pub symbol: Symbol,
}

/// Static metadata shared by all activations of one compiled function:
/// the ordered variable names, the argument count, the working-stack size,
/// and the lexical parent link.
#[derive(Debug)]
pub struct ClosureInfo {
    /// The enclosing function's info, if any.
    pub parent: Option<Shared<ClosureInfo>>,
    /// How many leading slots are arguments.
    pub num_args: usize,
    /// The computed working-stack size for this function's segment.
    pub temp_size: usize,
    /// Slot names, arguments first, then locals.  Compiler-synthesized
    /// hidden slots carry [`Symbol::NONE`].
    pub variable_names: Vec<Symbol>,
    /// Name to slot lookup.
    pub variables: AHashMap<Symbol, VarInfo>,
}

impl ClosureInfo {
    /// Build a [`ClosureInfo`] from ordered argument and local names.
    #[must_use]
    pub fn new(
        parent: Option<Shared<ClosureInfo>>,
        args: &[Symbol],
        locals: &[Symbol],
        temp_size: usize,
    ) -> Self {
        let mut variable_names = Vec::with_capacity(args.len() + locals.len());
        let mut variables = AHashMap::with_capacity(args.len() + locals.len());

        for (offset, &symbol) in args.iter().enumerate() {
            variable_names.push(symbol);
            variables.insert(
                symbol,
                VarInfo {
                    kind: VarKind::Argument,
                    offset,
                    symbol,
                },
            );
        }
        for (index, &symbol) in locals.iter().enumerate() {
            let offset = args.len() + index;
            variable_names.push(symbol);
            if !symbol.is_none() {
                variables.insert(
                    symbol,
                    VarInfo {
                        kind: VarKind::Local,
                        offset,
                        symbol,
                    },
                );
            }
        }

        Self {
            parent,
            num_args: args.len(),
            temp_size,
            variable_names,
            variables,
        }
    }

    /// The total number of variable slots.
    #[inline(always)]
    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.variable_names.len()
    }
}

/// One activation of a function: its variable slots plus the link to the
/// activation of the lexically enclosing function.
///
/// Slots hold arguments first (padded with null when a caller supplies too
/// few), then locals.  Local slots are carved out and released by the
/// `LAlloc`/`LFree` instructions as block scopes come and go.
#[derive(Debug)]
pub struct Closure {
    /// The static metadata for this activation.
    pub info: Shared<ClosureInfo>,
    /// The activation of the enclosing function, if any.
    pub parent: Option<Shared<Locked<Closure>>>,
    /// Variable slots: arguments, then locals.
    pub variables: Vec<Value>,
    /// How many arguments the caller actually supplied.
    pub provided_args: usize,
    /// High-water mark of allocated local slots (relative to `num_args`).
    pub local_top: usize,
}

impl Closure {
    /// Create an activation, binding the supplied arguments.  Extra
    /// arguments are dropped; missing ones become null.
    #[must_use]
    pub fn new(
        info: Shared<ClosureInfo>,
        parent: Option<Shared<Locked<Closure>>>,
        args: Vec<Value>,
    ) -> Self {
        let provided_args = args.len();
        let total = info.num_variables();
        let num_args = info.num_args;

        let mut variables = Vec::with_capacity(total);
        let mut args = args;
        args.truncate(num_args);
        variables.append(&mut args);
        variables.resize(total.max(num_args), Value::Null);

        Self {
            info,
            parent,
            variables,
            provided_args,
            local_top: 0,
        }
    }

    /// Walk `depth` parent links up the lexical chain and read a slot.
    #[must_use]
    pub fn get_at_depth(this: &Shared<Locked<Closure>>, depth: usize, index: usize) -> Value {
        if depth == 0 {
            return this.borrow().variables[index].clone();
        }
        let mut current = this.clone();
        for _ in 0..depth {
            let parent = current
                .borrow()
                .parent
                .clone()
                .expect("lexical depth exceeds closure chain");
            current = parent;
        }
        let value = current.borrow().variables[index].clone();
        value
    }

    /// Walk `depth` parent links up the lexical chain and write a slot.
    pub fn set_at_depth(
        this: &Shared<Locked<Closure>>,
        depth: usize,
        index: usize,
        value: Value,
    ) {
        if depth == 0 {
            this.borrow_mut().variables[index] = value;
            return;
        }
        let mut current = this.clone();
        for _ in 0..depth {
            let parent = current
                .borrow()
                .parent
                .clone()
                .expect("lexical depth exceeds closure chain");
            current = parent;
        }
        current.borrow_mut().variables[index] = value;
    }
}
