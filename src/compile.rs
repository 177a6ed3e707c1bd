//! Module defining the bytecode compiler: raw forms in, [`Program`] out.
//!
//! The compiler walks a raw-form tree, resolving names against its own
//! scope stack, and appends instructions to the current function's
//! segment.  Every emission carries a stack delta; a running depth and its
//! high-water mark size each function's working stack.  Branches are
//! emitted as placeholders and back-patched once both endpoints are known,
//! each paired with a `Label` pseudo-op carrying the inverse displacement.

use crate::bytecode::{ByteCodeSegment, CompiledFunction, Op, Program, SourceLocation};
use crate::error_parsing::ParseMessage;
use crate::{
    known, ClosureInfo, ImmutableString, Position, Shared, StaticVec, Symbol, SymbolTable, Value,
};
use ahash::AHashMap;

/// What kind of region a compile scope covers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CScopeKind {
    Function,
    ScopeDecl,
    Till,
}

/// What a compile-scope symbol resolves to.
#[derive(Debug, Clone, Copy)]
enum CSymKind {
    Argument,
    Local,
    /// Index into the owning till context's flag list.
    TillFlag { till: usize, flag: usize },
}

#[derive(Debug, Clone, Copy)]
struct CSym {
    kind: CSymKind,
    /// Slot index (absolute, arguments first) for arguments and locals.
    index: usize,
    /// Nesting depth of the function that owns the slot.
    func_depth: u32,
}

#[derive(Debug)]
struct CScope {
    kind: CScopeKind,
    symbols: AHashMap<Symbol, CSym>,
}

/// A function being compiled.
#[derive(Debug)]
struct FuncInProgress {
    args: Vec<Symbol>,
    local_names: Vec<Symbol>,
    segment: ByteCodeSegment,
    current_depth: i32,
    stack_size: i32,
    index: u32,
    fn_depth: u32,
    parent: Option<u32>,
}

/// A finished function awaiting [`ClosureInfo`] construction.
#[derive(Debug)]
struct Draft {
    args: Vec<Symbol>,
    local_names: Vec<Symbol>,
    segment: ByteCodeSegment,
    stack_size: usize,
    index: u32,
    fn_depth: u32,
    parent: Option<u32>,
}

/// An active `$till` lowering: where each flag's escapes were emitted and
/// the working-stack depth to restore when one fires.
#[derive(Debug)]
struct TillContext {
    flags: Vec<Symbol>,
    escapes: Vec<Vec<usize>>,
    entry_depth: i32,
}

/// The bytecode compiler.
///
/// One compiler builds one [`Program`]: a global function plus every
/// nested function, sharing the string/object/location tables.
pub struct Compiler<'s> {
    symbols: &'s SymbolTable,
    filename: ImmutableString,

    strings: Vec<ImmutableString>,
    string_lookup: AHashMap<ImmutableString, u32>,
    objects: Vec<Value>,
    locations: Vec<SourceLocation>,

    in_progress: Vec<FuncInProgress>,
    drafts: Vec<Option<Draft>>,
    scopes: Vec<CScope>,
    tills: Vec<TillContext>,

    current_loc: u32,
    messages: Vec<ParseMessage>,
}

impl<'s> Compiler<'s> {
    /// Create a compiler.  The symbol table is only read, for names in
    /// diagnostics.
    #[must_use]
    pub fn new(symbols: &'s SymbolTable, filename: impl Into<ImmutableString>) -> Self {
        let filename = filename.into();
        Self {
            symbols,
            filename: filename.clone(),
            strings: Vec::new(),
            string_lookup: AHashMap::new(),
            objects: Vec::new(),
            locations: vec![SourceLocation {
                filename,
                pos: Position::NONE,
            }],
            in_progress: Vec::new(),
            drafts: Vec::new(),
            scopes: Vec::new(),
            tills: Vec::new(),
            current_loc: 0,
            messages: Vec::new(),
        }
    }

    /// Compile a whole program: the expression becomes the body of the
    /// global function.  Returns the program together with any compile
    /// messages; the caller decides whether errors are fatal.
    pub fn compile_global(mut self, expr: &Value) -> (Program, Vec<ParseMessage>) {
        let main = self.begin_function(&[]);
        self.compile_expr(expr);
        self.emit(Op::Ret, -1);
        self.end_function();

        tracing::debug!(
            functions = self.drafts.len(),
            strings = self.strings.len(),
            objects = self.objects.len(),
            "compiled global function"
        );

        let mut functions: Vec<CompiledFunction> = Vec::with_capacity(self.drafts.len());
        for draft in self.drafts.iter_mut() {
            let draft = draft.take().expect("every draft is finished exactly once");
            let parent_info = draft
                .parent
                .map(|parent| functions[parent as usize].info.clone());
            let info = Shared::new(ClosureInfo::new(
                parent_info,
                &draft.args,
                &draft.local_names,
                draft.stack_size,
            ));
            functions.push(CompiledFunction {
                args: draft.args,
                local_names: draft.local_names,
                segment: draft.segment,
                stack_size: draft.stack_size,
                index: draft.index,
                depth: draft.fn_depth,
                info,
            });
        }

        let program = Program {
            strings: self.strings,
            objects: self.objects,
            functions,
            locations: self.locations,
            main,
        };
        (program, self.messages)
    }

    //------------------------------------------------------------------
    // Function and scope bookkeeping.

    fn begin_function(&mut self, args: &[Symbol]) -> u32 {
        let index = self.drafts.len() as u32;
        let fn_depth = self.in_progress.len() as u32;
        let parent = self.in_progress.last().map(|f| f.index);
        self.drafts.push(None);
        self.in_progress.push(FuncInProgress {
            args: args.to_vec(),
            local_names: Vec::new(),
            segment: ByteCodeSegment::new(),
            current_depth: 0,
            stack_size: 0,
            index,
            fn_depth,
            parent,
        });
        index
    }

    fn end_function(&mut self) {
        let func = self
            .in_progress
            .pop()
            .expect("end_function without begin_function");
        self.drafts[func.index as usize] = Some(Draft {
            args: func.args,
            local_names: func.local_names,
            segment: func.segment,
            stack_size: func.stack_size.max(0) as usize,
            index: func.index,
            fn_depth: func.fn_depth,
            parent: func.parent,
        });
    }

    fn cur(&mut self) -> &mut FuncInProgress {
        self.in_progress
            .last_mut()
            .expect("no function is being compiled")
    }

    fn begin_scope(&mut self, kind: CScopeKind) {
        self.scopes.push(CScope {
            kind,
            symbols: AHashMap::new(),
        });
    }

    fn end_scope(&mut self) {
        self.scopes.pop().expect("end_scope without begin_scope");
    }

    fn define_symbol(&mut self, symbol: Symbol, kind: CSymKind, index: usize) {
        let func_depth = self.cur().fn_depth;
        self.scopes
            .last_mut()
            .expect("no scope is open")
            .symbols
            .insert(
                symbol,
                CSym {
                    kind,
                    index,
                    func_depth,
                },
            );
    }

    fn find_symbol(&self, symbol: Symbol) -> Option<CSym> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.symbols.get(&symbol).copied())
    }

    fn add_local(&mut self, symbol: Symbol) -> usize {
        let func = self.cur();
        let index = func.args.len() + func.local_names.len();
        func.local_names.push(symbol);
        index
    }

    //------------------------------------------------------------------
    // Emission.

    fn emit(&mut self, op: Op, delta: i32) -> usize {
        let loc = self.current_loc;
        let func = self.cur();
        let offset = func.segment.emit(op, loc);
        func.current_depth += delta;
        if func.current_depth > func.stack_size {
            func.stack_size = func.current_depth;
        }
        offset
    }

    fn apply_delta(&mut self, delta: i32) {
        let func = self.cur();
        func.current_depth += delta;
        if func.current_depth > func.stack_size {
            func.stack_size = func.current_depth;
        }
    }

    fn set_depth(&mut self, depth: i32) {
        let func = self.cur();
        func.current_depth = depth;
        if func.current_depth > func.stack_size {
            func.stack_size = func.current_depth;
        }
    }

    fn here(&mut self) -> usize {
        self.cur().segment.len()
    }

    fn fix_branch(&mut self, at: usize, delta: i32) {
        let code = &mut self.cur().segment.code;
        code[at] = match code[at] {
            Op::Jmp(_) => Op::Jmp(delta),
            Op::Bf(_) => Op::Bf(delta),
            Op::Bt(_) => Op::Bt(delta),
            Op::Label(_) => Op::Label(delta),
            Op::Try(_) => Op::Try(delta),
            Op::Esc { depth, .. } => Op::Esc {
                offset: delta,
                depth,
            },
            other => other,
        };
    }

    /// Link a branch at `from` to a label at `to`, patching both ends.
    fn link(&mut self, from: usize, to: usize) {
        let delta = to as i32 - from as i32;
        self.fix_branch(from, delta);
        self.fix_branch(to, -delta);
    }

    fn add_string(&mut self, string: &ImmutableString) -> u32 {
        if let Some(&index) = self.string_lookup.get(string) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.strings.push(string.clone());
        self.string_lookup.insert(string.clone(), index);
        index
    }

    fn add_object(&mut self, object: Value) -> u32 {
        let index = self.objects.len() as u32;
        self.objects.push(object);
        index
    }

    fn set_location(&mut self, pos: Position) {
        if pos.is_none() {
            return;
        }
        let last = &self.locations[self.current_loc as usize];
        if last.pos == pos {
            return;
        }
        self.locations.push(SourceLocation {
            filename: self.filename.clone(),
            pos,
        });
        self.current_loc = (self.locations.len() - 1) as u32;
    }

    fn error(&mut self, text: impl Into<String>) {
        let pos = self.locations[self.current_loc as usize].pos;
        self.messages
            .push(ParseMessage::error(&self.filename, pos, text));
    }

    /// The messages produced so far.
    #[must_use]
    pub fn messages(&self) -> &[ParseMessage] {
        &self.messages
    }

    //------------------------------------------------------------------
    // Peephole fusion on pop.

    /// Discard the top of the stack as cheaply as possible: delete pure
    /// loads outright, unwind property loads onto their objects, merge
    /// consecutive pops, and fuse stores into their store-and-pop forms.
    fn emit_pop1(&mut self) {
        let last = self.cur().segment.code.last().copied();
        let last = match last {
            None => {
                self.emit(Op::Pop1, -1);
                return;
            }
            Some(op) => op,
        };

        if last.is_pure_load() {
            self.cur().segment.pop_last();
            self.apply_delta(-1);
            return;
        }

        match last {
            // A property load pops its object; deleting it leaves the
            // object to be popped instead.
            Op::LdProp(_)
            | Op::LdA
            | Op::LdD
            | Op::LdLeft
            | Op::LdRight
            | Op::LdStart
            | Op::LdEnd
            | Op::LdCount
            | Op::LdLength => {
                self.cur().segment.pop_last();
                self.emit_pop1();
            }
            // A member load consumed two values.
            Op::LdMember => {
                self.cur().segment.pop_last();
                self.apply_delta(1);
                self.emit_pop1();
                self.emit_pop1();
            }
            Op::Pop1 => {
                self.rewrite_last(Op::Pop2);
            }
            Op::Pop2 => {
                self.rewrite_last(Op::Pop(3));
            }
            Op::Pop(n) => {
                self.rewrite_last(Op::Pop(n + 1));
            }
            Op::Rep1 => {
                self.rewrite_last(Op::Pop2);
            }
            Op::Rep2 => {
                self.rewrite_last(Op::Pop(3));
            }
            Op::Rep(n) => {
                self.rewrite_last(Op::Pop(n + 1));
            }
            Op::StArg { depth, index } => {
                self.rewrite_last(Op::StpArg { depth, index });
            }
            Op::StLoc { depth, index } => {
                self.rewrite_last(Op::StpLoc { depth, index });
            }
            Op::StX(symbol) => {
                self.rewrite_last(Op::StpX(symbol));
            }
            Op::StProp(symbol) => {
                self.rewrite_last(Op::StpProp(symbol));
            }
            Op::StMember => {
                self.rewrite_last(Op::StpMember);
            }
            _ => {
                self.emit(Op::Pop1, -1);
            }
        }
    }

    fn rewrite_last(&mut self, op: Op) {
        let func = self.cur();
        let at = func.segment.code.len() - 1;
        func.segment.code[at] = op;
        func.current_depth -= 1;
    }

    //------------------------------------------------------------------
    // Expression compilation.

    /// Compile one expression, leaving exactly one value on the stack.
    pub(crate) fn compile_expr(&mut self, expr: &Value) {
        match expr {
            Value::Null => {
                self.emit(Op::LdNull, 1);
            }
            Value::Bool(b) => {
                self.emit(Op::LdBool(*b), 1);
            }
            Value::Byte(n) => {
                self.emit(Op::Ld8(*n), 1);
            }
            Value::Int16(n) => {
                self.emit(Op::Ld16(*n), 1);
            }
            Value::Int32(n) => {
                self.emit(Op::Ld32(*n), 1);
            }
            Value::Int64(n) => {
                self.emit(Op::Ld64(*n), 1);
            }
            Value::Int128(n) => {
                self.emit(Op::Ld128(*n), 1);
            }
            Value::Float32(n) => {
                self.emit(Op::LdF32(*n), 1);
            }
            Value::Float64(n) => {
                self.emit(Op::LdF64(*n), 1);
            }
            Value::Char(c) => {
                self.emit(Op::LdCh(*c), 1);
            }
            Value::Uni(c) => {
                self.emit(Op::LdUCh(*c), 1);
            }
            Value::Str(s) => {
                let index = self.add_string(s);
                self.emit(Op::LdStr(index), 1);
            }
            Value::Symbol(symbol) => self.compile_variable(*symbol, false),
            Value::Pair(pair) => {
                let pair = pair.clone();
                self.set_location(pair.pos);
                self.compile_property(&pair.left, &pair.right, false);
            }
            Value::Syntax(_) | Value::Object(_) | Value::Function(_) | Value::Handle(_)
            | Value::Nonterminal(_) => {
                let index = self.add_object(expr.clone());
                self.emit(Op::LdObj(index), 1);
            }
            Value::List(cell) => {
                let cell = cell.clone();
                self.set_location(cell.pos);
                self.compile_list(&cell.head, &cell.tail);
            }
        }
    }

    /// Compile a list form: a standard form, a method call, or a plain
    /// function call.
    fn compile_list(&mut self, head: &Value, args: &Value) {
        match head {
            // [obj.method args...]
            Value::Pair(pair) => {
                let pair = pair.clone();
                self.compile_method_call(&pair.left, &pair.right, args);
            }
            Value::Symbol(symbol) => {
                if args.list_len().is_none() {
                    self.error("Cannot compile list: list is not well-formed.");
                }
                if self.compile_standard_form(*symbol, args) {
                    return;
                }
                self.compile_plain_call(head, args);
            }
            _ => self.compile_plain_call(head, args),
        }
    }

    /// Resolve each element, then `Call`: the first element becomes the
    /// function, the rest its arguments.  `Call` leaves the callee under
    /// the result; `Rep1` folds them together.
    fn compile_plain_call(&mut self, head: &Value, args: &Value) {
        self.compile_expr(head);
        let mut argc = 0;
        for arg in args.iter_list() {
            self.compile_expr(arg);
            argc += 1;
        }
        self.emit(Op::Call(argc), 1 - argc as i32);
        self.emit(Op::Rep1, -1);
    }

    /// `[obj.method args...]` - method dispatch fused into one op.
    fn compile_method_call(&mut self, left: &Value, right: &Value, args: &Value) {
        let symbol = match right.as_symbol() {
            Some(symbol) => symbol,
            None => {
                self.error("Cannot compile method call: method name must be a symbol.");
                return;
            }
        };
        let argc = match args.list_len() {
            Some(argc) => argc,
            None => {
                self.error("Cannot compile method call: argument list is not well-formed.");
                return;
            }
        };

        self.compile_expr(left);
        for arg in args.iter_list() {
            self.compile_expr(arg);
        }

        if argc == 1 && symbol == known::GET_MEMBER {
            self.emit(Op::LdMember, -1);
        } else {
            self.emit(
                Op::Met {
                    argc: argc as u32,
                    symbol,
                },
                -(argc as i32),
            );
        }
    }

    /// `expr.symbol` - property load/store, with fast paths for the
    /// well-known properties of the core shapes.
    fn compile_property(&mut self, left: &Value, right: &Value, store: bool) {
        let symbol = match right.as_symbol() {
            Some(symbol) => symbol,
            None => {
                self.error("Cannot compile pair: right side must be a symbol.");
                return;
            }
        };

        self.compile_expr(left);

        if store {
            self.emit(Op::StProp(symbol), -1);
            return;
        }

        let op = match symbol {
            known::A => Op::LdA,
            known::D => Op::LdD,
            known::LEFT => Op::LdLeft,
            known::RIGHT => Op::LdRight,
            known::START => Op::LdStart,
            known::END => Op::LdEnd,
            known::COUNT => Op::LdCount,
            known::LENGTH => Op::LdLength,
            _ => Op::LdProp(symbol),
        };
        self.emit(op, 0);
    }

    /// A bare symbol: a local, an argument, a till flag, or a free
    /// variable resolved against the global closure at run time.
    fn compile_variable(&mut self, symbol: Symbol, store: bool) {
        let found = self.find_symbol(symbol);
        let local = match found {
            Some(local) => local,
            None => {
                if store {
                    self.emit(Op::StX(symbol), 0);
                } else {
                    self.emit(Op::LdX(symbol), 1);
                }
                return;
            }
        };

        match local.kind {
            CSymKind::Argument => {
                let depth = (self.cur().fn_depth - local.func_depth) as u16;
                let index = local.index as u16;
                if store {
                    self.emit(Op::StArg { depth, index }, 0);
                } else {
                    self.emit(Op::LdArg { depth, index }, 1);
                }
            }
            CSymKind::Local => {
                let depth = (self.cur().fn_depth - local.func_depth) as u16;
                let index = local.index as u16;
                if store {
                    self.emit(Op::StLoc { depth, index }, 0);
                } else {
                    self.emit(Op::LdLoc { depth, index }, 1);
                }
            }
            CSymKind::TillFlag { till, flag } => {
                if store {
                    self.error("A till flag cannot be assigned to.");
                    return;
                }
                let entry_depth = self.tills[till].entry_depth;
                let at = self.emit(
                    Op::Esc {
                        offset: 0,
                        depth: entry_depth.max(0) as u32,
                    },
                    1,
                );
                self.tills[till].escapes[flag].push(at);
            }
        }
    }

    /// Dispatch the well-known structural forms.  Returns false when the
    /// symbol is not one of them (so the list is an ordinary call).
    fn compile_standard_form(&mut self, symbol: Symbol, args: &Value) -> bool {
        match symbol {
            known::SET => self.compile_set(args),
            known::OPSET => self.compile_opset(args),
            known::IF => self.compile_if(args),
            known::WHILE => self.compile_while(args),
            known::TILL => self.compile_till(args),
            known::CATCH => self.compile_catch(args),
            known::RETURN => self.compile_return(args),
            known::FN => self.compile_fn(args),
            known::QUOTE => self.compile_quote(args),
            known::PROG1 => self.compile_prog1(args),
            known::PROGN => self.compile_progn_form(args),
            known::SCOPE => self.compile_scope(args),
            known::NEW => self.compile_new(args),
            known::IS => self.compile_binary_op(args, Op::Is, "[$is]"),
            known::TYPEOF => self.compile_unary_op(args, Op::TypeOf, "[$typeof]"),
            known::EQ => self.compile_binary_op(args, Op::SuperEq, "[$eq]"),
            known::NE => self.compile_binary_op(args, Op::SuperNe, "[$ne]"),
            known::AND => self.compile_and(args),
            known::OR => self.compile_or(args),
            known::NOT => self.compile_unary_op(args, Op::Not, "[$not]"),
            known::INDEX => self.compile_index(args),
            known::DOT => self.compile_dot(args),
            _ => return false,
        }
        true
    }

    //------------------------------------------------------------------
    // Assignment.

    /// `[$set lvalue value]` - three lvalue shapes: a symbol, a property
    /// pair, and an index form.  The stored value stays on the stack.
    fn compile_set(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$set]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let dest = iter.next().expect("length checked").clone();
        let value = iter.next().expect("length checked").clone();

        match &dest {
            Value::Symbol(symbol) => {
                self.compile_expr(&value);
                self.compile_variable(*symbol, true);
            }
            Value::Pair(pair) => {
                let symbol = match pair.right.as_symbol() {
                    Some(symbol) => symbol,
                    None => {
                        self.error("Cannot compile [$set]: expression is not well-formed.");
                        return;
                    }
                };
                self.compile_expr(&pair.left);
                self.compile_expr(&value);
                self.emit(Op::StProp(symbol), -1);
            }
            Value::List(_) => {
                let (coll, index) = match self.index_form_parts(&dest) {
                    Some(parts) => parts,
                    None => {
                        self.error("Cannot compile [$set]: expression is not well-formed.");
                        return;
                    }
                };
                self.compile_expr(&coll);
                self.compile_expr(&index);
                self.compile_expr(&value);
                self.emit(Op::StMember, -2);
            }
            _ => {
                self.error("Cannot compile [$set]: expression is not well-formed.");
            }
        }
    }

    /// An indexed lvalue: `[$index coll key]` or the classic
    /// `[(coll.get-member) key]` form.
    fn index_form_parts(&self, dest: &Value) -> Option<(Value, Value)> {
        let cell = dest.as_cons()?;
        if cell.head.as_symbol() == Some(known::INDEX) {
            let mut iter = cell.tail.iter_list();
            let coll = iter.next()?.clone();
            let key = iter.next()?.clone();
            if iter.next().is_some() {
                return None;
            }
            return Some((coll, key));
        }
        if let Value::Pair(pair) = &cell.head {
            if pair.right.as_symbol() == Some(known::GET_MEMBER) {
                let mut iter = cell.tail.iter_list();
                let key = iter.next()?.clone();
                if iter.next().is_some() {
                    return None;
                }
                return Some((pair.left.clone(), key));
            }
        }
        None
    }

    /// `[$opset op lvalue value]` - read, apply the operator as a method,
    /// write back.  The result stays on the stack.
    fn compile_opset(&mut self, args: &Value) {
        if args.list_len() != Some(3) {
            self.error("Cannot compile [$opset]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let op = iter.next().expect("length checked").clone();
        let dest = iter.next().expect("length checked").clone();
        let value = iter.next().expect("length checked").clone();

        let op = match op.as_symbol() {
            Some(op) => op,
            None => {
                self.error(
                    "Cannot compile [$opset]: first argument must be an operator (method) name.",
                );
                return;
            }
        };

        match &dest {
            Value::Symbol(symbol) => {
                self.compile_variable(*symbol, false);
                self.compile_expr(&value);
                self.emit(Op::Met { argc: 1, symbol: op }, -1);
                self.compile_variable(*symbol, true);
            }
            Value::Pair(pair) => {
                let symbol = match pair.right.as_symbol() {
                    Some(symbol) => symbol,
                    None => {
                        self.error("Cannot compile [$opset]: expression is not well-formed.");
                        return;
                    }
                };
                self.compile_expr(&pair.left);
                self.emit(Op::Dup1, 1);
                self.emit(Op::LdProp(symbol), 0);
                self.compile_expr(&value);
                self.emit(Op::Met { argc: 1, symbol: op }, -1);
                self.emit(Op::StProp(symbol), -1);
            }
            Value::List(_) => {
                let (coll, index) = match self.index_form_parts(&dest) {
                    Some(parts) => parts,
                    None => {
                        self.error("Cannot compile [$opset]: expression is not well-formed.");
                        return;
                    }
                };
                self.compile_expr(&coll);
                self.compile_expr(&index);
                self.emit(Op::Dup2, 1);
                self.emit(Op::Dup2, 1);
                self.emit(Op::LdMember, -1);
                self.compile_expr(&value);
                self.emit(Op::Met { argc: 1, symbol: op }, -1);
                self.emit(Op::StMember, -2);
            }
            _ => {
                self.error("Cannot compile [$opset]: expression is not well-formed.");
            }
        }
    }

    //------------------------------------------------------------------
    // Control flow.

    /// `[$if cond then-clause else-clause?]`.  Any number of `[$not ...]`
    /// wrappers around the condition are stripped; an odd number swaps the
    /// branches.
    fn compile_if(&mut self, args: &Value) {
        let length = args.list_len().unwrap_or(0);
        if length != 2 && length != 3 {
            self.error("Cannot compile [$if]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let mut condition = iter.next().expect("length checked").clone();
        let mut then_clause = iter.next().expect("length checked").clone();
        let mut else_clause = iter.next().cloned().unwrap_or(Value::Null);

        if strip_nots(&mut condition) {
            std::mem::swap(&mut then_clause, &mut else_clause);
        }

        self.compile_expr(&condition);
        let bf = self.emit(Op::Bf(0), -1);
        self.compile_expr(&then_clause);
        let jmp = self.emit(Op::Jmp(0), 0);
        let bf_label = self.emit(Op::Label(0), 0);
        self.compile_expr(&else_clause);
        let jmp_label = self.emit(Op::Label(0), 0);

        // Only one of the two branches' results survives.
        self.apply_delta(-1);

        self.link(bf, bf_label);
        self.link(jmp, jmp_label);
    }

    /// `[$while cond body]` or `[$while pre-body cond post-body]`.  Each
    /// of the four shapes leaves exactly one value on the stack.
    fn compile_while(&mut self, args: &Value) {
        let length = args.list_len().unwrap_or(0);
        if length != 2 && length != 3 {
            self.error("Cannot compile [$while]: expression is not well-formed.");
            return;
        }

        let mut iter = args.iter_list();
        let (pre_clause, condition, post_clause) = if length == 3 {
            let pre = iter.next().expect("length checked").clone();
            let cond = iter.next().expect("length checked").clone();
            let post = iter.next().expect("length checked").clone();
            (pre, cond, post)
        } else {
            let cond = iter.next().expect("length checked").clone();
            let post = iter.next().expect("length checked").clone();
            (Value::Null, cond, post)
        };

        let mut condition = condition;
        let not = strip_nots(&mut condition);
        let has_pre = !pre_clause.is_null();
        let has_post = !post_clause.is_null();

        if has_pre && has_post {
            // do {...} while cond then {...}
            //
            //   l1: eval pre
            //       eval cond
            //       branch l2
            //       pop1
            //       eval post
            //       pop1
            //       jmp l1
            //   l2:
            let jmp_label = self.emit(Op::Label(0), 0);
            self.compile_expr(&pre_clause);
            self.compile_expr(&condition);
            let b = self.emit(if not { Op::Bt(0) } else { Op::Bf(0) }, -1);
            self.emit_pop1();
            self.compile_expr(&post_clause);
            self.emit_pop1();
            let jmp = self.emit(Op::Jmp(0), 0);
            let b_label = self.emit(Op::Label(0), 0);

            self.link(b, b_label);
            self.link(jmp, jmp_label);

            // One iteration's pre value is left when the branch exits.
            self.apply_delta(1);
        } else if has_pre {
            // do {...} while cond
            //
            //       jmp l1
            //   l2: pop1
            //   l1: eval pre
            //       eval cond
            //       branch l2
            let jmp = self.emit(Op::Jmp(0), 0);
            let b_label = self.emit(Op::Label(0), 0);
            self.emit_pop1();
            let jmp_label = self.emit(Op::Label(0), 0);
            self.compile_expr(&pre_clause);
            self.compile_expr(&condition);
            let b = self.emit(if not { Op::Bf(0) } else { Op::Bt(0) }, -1);

            self.link(b, b_label);
            self.link(jmp, jmp_label);

            self.apply_delta(1);
        } else if has_post {
            // while cond do {...}
            //
            //       ldnull
            //       jmp l1
            //   l2: pop1
            //       eval post
            //   l1: eval cond
            //       branch l2
            self.emit(Op::LdNull, 1);
            let jmp = self.emit(Op::Jmp(0), 0);
            let b_label = self.emit(Op::Label(0), 0);
            self.emit_pop1();
            self.compile_expr(&post_clause);
            let jmp_label = self.emit(Op::Label(0), 0);
            self.compile_expr(&condition);
            let b = self.emit(if not { Op::Bt(0) } else { Op::Bf(0) }, -1);

            self.link(b, b_label);
            self.link(jmp, jmp_label);
        } else {
            // while cond {} - spin until the condition goes false.
            let b_label = self.emit(Op::Label(0), 0);
            self.compile_expr(&condition);
            let b = self.emit(if not { Op::Bf(0) } else { Op::Bt(0) }, -1);
            self.emit(Op::LdNull, 1);

            self.link(b, b_label);
        }
    }

    /// `[$till [flags...] body when-clauses?]`.
    ///
    /// A hidden local holds the last fully-computed body value.  Each flag
    /// reference in the body escapes to its exit label, where either the
    /// flag's `when` clause runs or the hidden local is reloaded.
    fn compile_till(&mut self, args: &Value) {
        let length = args.list_len().unwrap_or(0);
        if length != 2 && length != 3 {
            self.error("Cannot compile [$till]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let flags_list = iter.next().expect("length checked").clone();
        let body = iter.next().expect("length checked").clone();
        let whens = iter.next().cloned().unwrap_or(Value::Null);

        let mut flags = Vec::new();
        for flag in flags_list.iter_list() {
            match flag.as_symbol() {
                Some(symbol) => flags.push(symbol),
                None => {
                    self.error("Cannot compile [$till]: flags must be symbols.");
                    return;
                }
            }
        }
        if flags.is_empty() {
            self.error("Cannot compile [$till]: at least one flag is required.");
            return;
        }

        // Collect the optional when clauses up front.
        let mut when_map: AHashMap<Symbol, Value> = AHashMap::new();
        for clause in whens.iter_list() {
            let mut parts = clause.iter_list();
            let flag = parts.next().and_then(Value::as_symbol);
            let clause_body = parts.next().cloned();
            match (flag, clause_body) {
                (Some(flag), Some(clause_body)) if flags.contains(&flag) => {
                    when_map.insert(flag, clause_body);
                }
                _ => {
                    self.error("Cannot compile [$till]: when clause is not well-formed.");
                    return;
                }
            }
        }

        let hidden = self.add_local(Symbol::NONE) as u16;
        let entry_depth = self.cur().current_depth;

        let till = self.tills.len();
        self.tills.push(TillContext {
            flags: flags.clone(),
            escapes: vec![Vec::new(); flags.len()],
            entry_depth,
        });
        self.begin_scope(CScopeKind::Till);
        for (index, &flag) in flags.iter().enumerate() {
            self.define_symbol(flag, CSymKind::TillFlag { till, flag: index }, 0);
        }

        self.emit(Op::LAlloc(1), 0);
        let top = self.emit(Op::Label(0), 0);
        self.compile_expr(&body);
        self.emit(
            Op::StLoc {
                depth: 0,
                index: hidden,
            },
            0,
        );
        self.emit_pop1();
        let jmp = self.emit(Op::Jmp(0), 0);
        self.link(jmp, top);

        self.end_scope();
        let context = self.tills.pop().expect("till context was just pushed");

        // Flag exits.
        let mut end_jumps = Vec::new();
        for (index, &flag) in context.flags.iter().enumerate() {
            let label = self.emit(Op::Label(0), 0);
            for &escape in &context.escapes[index] {
                self.link(escape, label);
            }

            self.set_depth(entry_depth);
            match when_map.get(&flag) {
                Some(clause) => {
                    let clause = clause.clone();
                    self.compile_expr(&clause);
                }
                None => {
                    self.emit(
                        Op::LdLoc {
                            depth: 0,
                            index: hidden,
                        },
                        1,
                    );
                }
            }
            end_jumps.push(self.emit(Op::Jmp(0), 0));
        }

        let end = self.emit(Op::Label(0), 0);
        for jmp in end_jumps {
            self.link(jmp, end);
        }
        self.emit(Op::LFree(1), 0);

        self.set_depth(entry_depth + 1);
    }

    /// `[$catch body handler]`.
    ///
    /// The handler function is evaluated first and sits under the body's
    /// workspace.  `Try` records the catch target and the stack depth to
    /// restore; on an exception the unwinder truncates to that depth,
    /// pushes the exception, and resumes at the target, where the handler
    /// is called with the exception as its argument.
    fn compile_catch(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$catch]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let body = iter.next().expect("length checked").clone();
        let handler = iter.next().expect("length checked").clone();

        self.compile_expr(&handler);
        let depth_with_handler = self.cur().current_depth;

        let try_at = self.emit(Op::Try(0), 0);
        self.compile_expr(&body);
        self.emit(Op::EndTry, 0);
        self.emit(Op::Rep1, -1);
        let jmp = self.emit(Op::Jmp(0), 0);

        // The catch path enters with the handler plus the exception.
        let catch_label = self.emit(Op::Label(0), 0);
        self.set_depth(depth_with_handler + 1);
        self.emit(Op::Call(1), 0);
        self.emit(Op::Rep1, -1);

        let end = self.emit(Op::Label(0), 0);
        self.link(try_at, catch_label);
        self.link(jmp, end);

        self.set_depth(depth_with_handler);
    }

    /// `[$return]` or `[$return value]`.
    fn compile_return(&mut self, args: &Value) {
        match args.list_len() {
            Some(0) => {
                self.emit(Op::LdNull, 1);
                self.emit(Op::Ret, -1);
            }
            Some(1) => {
                let value = args.iter_list().next().expect("length checked").clone();
                self.compile_expr(&value);
                self.emit(Op::Ret, -1);
            }
            _ => {
                self.error("Cannot compile [$return]: expression is not well-formed.");
            }
        }
    }

    //------------------------------------------------------------------
    // Functions, quoting, sequencing.

    /// `[$fn [args...] body]` - compile the nested function, then emit
    /// `NewFn` to instantiate it over the current environment.
    fn compile_fn(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$fn]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let fn_args = iter.next().expect("length checked").clone();
        let body = iter.next().expect("length checked").clone();

        let mut arg_symbols = Vec::new();
        for (position, arg) in fn_args.iter_list().enumerate() {
            match arg.as_symbol() {
                Some(symbol) => arg_symbols.push(symbol),
                None => {
                    self.error(format!(
                        "Cannot compile [$fn]: argument #{} is not a valid argument name.",
                        position + 1
                    ));
                    return;
                }
            }
        }

        let index = self.begin_function(&arg_symbols);
        self.begin_scope(CScopeKind::Function);
        for (position, &symbol) in arg_symbols.iter().enumerate() {
            self.define_symbol(symbol, CSymKind::Argument, position);
        }

        if !arg_symbols.is_empty() {
            self.emit(Op::Args(arg_symbols.len() as u32), 0);
        }
        self.compile_expr(&body);
        self.emit(Op::Ret, -1);

        self.end_scope();
        self.end_function();

        self.emit(Op::NewFn(index), 1);
    }

    /// `[$quote expr]` - a symbol loads directly; lists and pairs become
    /// constant objects; everything else evaluates to itself anyway.
    fn compile_quote(&mut self, args: &Value) {
        if args.list_len() != Some(1) {
            self.error("Cannot compile [$quote]: expression is not well-formed.");
            return;
        }
        let quoted = args.iter_list().next().expect("length checked").clone();

        match &quoted {
            Value::Symbol(symbol) => {
                self.emit(Op::LdSym(*symbol), 1);
            }
            Value::List(_) | Value::Pair(_) => {
                let index = self.add_object(quoted.clone());
                self.emit(Op::LdObj(index), 1);
            }
            other => self.compile_expr(other),
        }
    }

    /// `[$prog1 a b c ...]` - evaluate all, keep the first value.
    fn compile_prog1(&mut self, args: &Value) {
        let mut iter = args.iter_list();
        let first = match iter.next() {
            Some(first) => first.clone(),
            None => {
                self.emit(Op::LdNull, 1);
                return;
            }
        };
        self.compile_expr(&first);
        let rest: Vec<Value> = iter.cloned().collect();
        for expr in rest {
            self.compile_expr(&expr);
            self.emit_pop1();
        }
    }

    /// `[$progn a b c ...]` - evaluate all, keep the last value.
    fn compile_progn_form(&mut self, args: &Value) {
        if args.is_null() {
            self.emit(Op::LdNull, 1);
            return;
        }
        let exprs: Vec<Value> = args.iter_list().cloned().collect();
        let last = exprs.len() - 1;
        for (position, expr) in exprs.iter().enumerate() {
            self.compile_expr(expr);
            if position != last {
                self.emit_pop1();
            }
        }
    }

    /// `[$scope [locals...] a b c ...]` - declare the locals, reserve
    /// their slots, and compile the body like a progn.
    fn compile_scope(&mut self, args: &Value) {
        let cell = match args.as_cons() {
            Some(cell) => cell.clone(),
            None => {
                self.error("Cannot compile [$scope]: expression is not well-formed.");
                return;
            }
        };
        let locals = cell.head.clone();
        let body = cell.tail.clone();
        if locals.list_len().is_none() {
            self.error("Cannot compile [$scope]: local-variable list is not well-formed.");
            return;
        }

        self.begin_scope(CScopeKind::ScopeDecl);
        let mut count = 0;
        for (position, local) in locals.iter_list().enumerate() {
            match local.as_symbol() {
                Some(symbol) => {
                    let index = self.add_local(symbol);
                    self.define_symbol(symbol, CSymKind::Local, index);
                    count += 1;
                }
                None => {
                    self.error(format!(
                        "Cannot compile [$scope]: variable #{} is not a valid local variable name.",
                        position + 1
                    ));
                }
            }
        }

        if count > 0 {
            self.emit(Op::LAlloc(count), 0);
        }
        self.compile_progn_form(&body);
        if count > 0 {
            self.emit(Op::LFree(count), 0);
        }

        self.end_scope();
    }

    /// `[$new base [[sym1 val1] [sym2 val2] ...]]`.
    fn compile_new(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$new]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let base = iter.next().expect("length checked").clone();
        let members = iter.next().expect("length checked").clone();

        self.compile_expr(&base);

        let mut count = 0u32;
        for member in members.iter_list() {
            let mut parts = member.iter_list();
            let symbol = parts.next().and_then(Value::as_symbol);
            let value = parts.next().cloned();
            match (symbol, value, parts.next()) {
                (Some(symbol), Some(value), None) => {
                    self.emit(Op::LdSym(symbol), 1);
                    self.compile_expr(&value);
                    count += 1;
                }
                _ => {
                    self.error("Cannot compile [$new]: expression is not well-formed.");
                    return;
                }
            }
        }

        self.emit(Op::NewObj(count), 1 - (count as i32 * 2 + 1));
    }

    /// `[$index coll key]` - the member-read form.
    fn compile_index(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$index]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let coll = iter.next().expect("length checked").clone();
        let key = iter.next().expect("length checked").clone();
        self.compile_expr(&coll);
        self.compile_expr(&key);
        self.emit(Op::LdMember, -1);
    }

    /// `[$dot obj member]` - the property form templates produce.
    fn compile_dot(&mut self, args: &Value) {
        if args.list_len() != Some(2) {
            self.error("Cannot compile [$dot]: expression is not well-formed.");
            return;
        }
        let mut iter = args.iter_list();
        let object = iter.next().expect("length checked").clone();
        let member = iter.next().expect("length checked").clone();
        self.compile_property(&object, &member, false);
    }

    /// Shared shape of `[$is x y]`, `[$eq x y]`, `[$ne x y]`.
    fn compile_binary_op(&mut self, args: &Value, op: Op, name: &str) {
        if args.list_len() != Some(2) {
            self.error(format!("Cannot compile {}: expression is not well-formed.", name));
            return;
        }
        let mut iter = args.iter_list();
        let lhs = iter.next().expect("length checked").clone();
        let rhs = iter.next().expect("length checked").clone();
        self.compile_expr(&lhs);
        self.compile_expr(&rhs);
        self.emit(op, -1);
    }

    /// Shared shape of `[$typeof x]` and `[$not x]`.
    fn compile_unary_op(&mut self, args: &Value, op: Op, name: &str) {
        if args.list_len() != Some(1) {
            self.error(format!("Cannot compile {}: expression is not well-formed.", name));
            return;
        }
        let operand = args.iter_list().next().expect("length checked").clone();
        self.compile_expr(&operand);
        self.emit(op, 0);
    }

    /// `[$and x y z ...]` - short-circuit: any falsy operand branches to
    /// the false result.
    fn compile_and(&mut self, args: &Value) {
        let length = args.list_len().unwrap_or(0);
        if length == 0 {
            self.error("Cannot compile [$and]: expression is not well-formed.");
            return;
        }

        let operands: Vec<Value> = args.iter_list().cloned().collect();
        let mut branches: StaticVec<usize> = StaticVec::new();

        for operand in operands {
            let mut condition = operand;
            let not = strip_nots(&mut condition);
            self.compile_expr(&condition);
            branches.push(self.emit(if not { Op::Bt(0) } else { Op::Bf(0) }, -1));
        }

        self.emit(Op::LdBool(true), 1);
        let jmp = self.emit(Op::Jmp(0), 0);
        let false_offset = self.here();
        self.emit(Op::LdBool(false), 1);
        let jmp_label = self.emit(Op::Label(0), 0);

        for branch in branches {
            let delta = false_offset as i32 - branch as i32;
            self.fix_branch(branch, delta);
        }
        self.link(jmp, jmp_label);

        // Only one of the two results materializes.
        self.apply_delta(-1);
    }

    /// `[$or x y z ...]` - short-circuit: any truthy operand branches to
    /// the true result.
    fn compile_or(&mut self, args: &Value) {
        let length = args.list_len().unwrap_or(0);
        if length == 0 {
            self.error("Cannot compile [$or]: expression is not well-formed.");
            return;
        }

        let operands: Vec<Value> = args.iter_list().cloned().collect();
        let mut branches: StaticVec<usize> = StaticVec::new();

        for operand in operands {
            let mut condition = operand;
            let not = strip_nots(&mut condition);
            self.compile_expr(&condition);
            branches.push(self.emit(if not { Op::Bf(0) } else { Op::Bt(0) }, -1));
        }

        self.emit(Op::LdBool(false), 1);
        let jmp = self.emit(Op::Jmp(0), 0);
        let true_offset = self.here();
        self.emit(Op::LdBool(true), 1);
        let jmp_label = self.emit(Op::Label(0), 0);

        for branch in branches {
            let delta = true_offset as i32 - branch as i32;
            self.fix_branch(branch, delta);
        }
        self.link(jmp, jmp_label);

        self.apply_delta(-1);
    }
}

/// Strip any number of `[$not ...]` wrappers from an expression, returning
/// whether an odd number was removed.
fn strip_nots(expr: &mut Value) -> bool {
    let mut negated = false;
    loop {
        let inner = match expr.as_cons() {
            Some(cell)
                if cell.head.as_symbol() == Some(known::NOT)
                    && cell.tail.list_len() == Some(1) =>
            {
                cell.tail
                    .iter_list()
                    .next()
                    .expect("length checked")
                    .clone()
            }
            _ => return negated,
        };
        *expr = inner;
        negated = !negated;
    }
}
