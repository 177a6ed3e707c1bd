//! Module defining the bytecode evaluator: a stack machine over [`Value`].
//!
//! Call frames are explicit, so compiled-function calls never grow the
//! host stack.  A frame is either compiled code or a parked native state
//! machine; when a frame returns, its value is fed to the frame below -
//! pushed onto the working stack for code, or stepped into the state
//! machine for natives.

use crate::builtin;
use crate::bytecode::{Op, Program};
use crate::error::{EvalError, EvalResult};
use crate::native::{MachineStep, NativeBody, NativeContext};
use crate::value::Function;
use crate::{known, Closure, Engine, ImmutableString, Locked, Shared, Symbol, Value};

/// An activation of compiled code.
struct CodeFrame {
    closure: Shared<Locked<Closure>>,
    program: Shared<Program>,
    func: u32,
    ip: usize,
    /// Working-stack length at frame entry; `Ret` truncates back to here.
    base: usize,
}

/// A parked native state machine awaiting a sub-call's result.
struct NativeFrame {
    machine: Box<dyn crate::StateMachine>,
    name: ImmutableString,
}

enum Frame {
    Code(CodeFrame),
    Native(NativeFrame),
}

/// An installed `$catch` handler.
struct Handler {
    /// Frame index the handler lives in.
    frame: usize,
    /// Where to resume when an exception arrives.
    catch_ip: usize,
    /// Working-stack depth to truncate to before pushing the exception.
    stack_depth: usize,
}

enum Flow {
    Continue,
    Finished(Value),
    Break,
}

/// The evaluator: a resumable stack machine.
///
/// A breakpoint suspends the machine and hands it back to the caller
/// inside [`EvalResult::Break`]; calling [`Machine::run`] again resumes
/// right after the breakpoint.
pub struct Machine {
    frames: Vec<Frame>,
    stack: Vec<Value>,
    handlers: Vec<Handler>,
}

impl Machine {
    /// Create a machine poised at the start of a program's global
    /// function.
    #[must_use]
    pub fn new(program: Shared<Program>) -> Self {
        let main = program.main;
        let info = program.functions[main as usize].info.clone();
        let closure = Shared::new(Locked::new(Closure::new(info, None, Vec::new())));
        Self {
            frames: vec![Frame::Code(CodeFrame {
                closure,
                program,
                func: main,
                ip: 0,
                base: 0,
            })],
            stack: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Run (or resume) the machine to its next stopping point.
    pub fn run(mut self, engine: &mut Engine) -> EvalResult {
        loop {
            let op = {
                let frame = match self.frames.last_mut() {
                    Some(Frame::Code(frame)) => frame,
                    Some(Frame::Native(_)) => {
                        // A native frame is never left on top between
                        // instructions.
                        let err = EvalError::raise(
                            known::UNKNOWN_ERROR,
                            "internal error: native frame left on top of the call stack",
                        );
                        match self.unwind(engine, *err) {
                            None => continue,
                            Some(exception) => return EvalResult::Exception(exception),
                        }
                    }
                    None => {
                        return EvalResult::Value(self.stack.pop().unwrap_or(Value::Null))
                    }
                };
                let segment = &frame.program.functions[frame.func as usize].segment;
                if frame.ip >= segment.code.len() {
                    // Fell off the end of a segment: treat as a return of
                    // the top of stack.
                    let value = self.stack.pop().unwrap_or(Value::Null);
                    match self.do_return(engine, value) {
                        Ok(Flow::Finished(value)) => return EvalResult::Value(value),
                        Ok(_) => continue,
                        Err(err) => match self.unwind(engine, *err) {
                            None => continue,
                            Some(exception) => return EvalResult::Exception(exception),
                        },
                    }
                }
                let op = segment.code[frame.ip];
                frame.ip += 1;
                op
            };

            match self.exec(engine, op) {
                Ok(Flow::Continue) => (),
                Ok(Flow::Finished(value)) => return EvalResult::Value(value),
                Ok(Flow::Break) => return EvalResult::Break(Box::new(self)),
                Err(err) => match self.unwind(engine, *err) {
                    None => (),
                    Some(exception) => return EvalResult::Exception(exception),
                },
            }
        }
    }

    //------------------------------------------------------------------
    // Frame helpers.

    fn code_frame(&self) -> &CodeFrame {
        match self.frames.last() {
            Some(Frame::Code(frame)) => frame,
            _ => unreachable!("the executing frame is always code"),
        }
    }

    fn code_frame_mut(&mut self) -> &mut CodeFrame {
        match self.frames.last_mut() {
            Some(Frame::Code(frame)) => frame,
            _ => unreachable!("the executing frame is always code"),
        }
    }

    fn jump(&mut self, delta: i32) {
        let frame = self.code_frame_mut();
        // The ip has already advanced past the branch instruction.
        frame.ip = (frame.ip as i64 - 1 + delta as i64) as usize;
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("working stack underflow")
    }

    fn raise<T>(&self, kind: Symbol, message: impl Into<String>) -> Result<T, Box<EvalError>> {
        Err(EvalError::raise(kind, message))
    }

    //------------------------------------------------------------------
    // The interpreter proper.

    #[allow(clippy::too_many_lines)]
    fn exec(&mut self, engine: &mut Engine, op: Op) -> Result<Flow, Box<EvalError>> {
        match op {
            // Immediates.
            Op::Ld8(n) => self.stack.push(Value::Byte(n)),
            Op::Ld16(n) => self.stack.push(Value::Int16(n)),
            Op::Ld32(n) => self.stack.push(Value::Int32(n)),
            Op::Ld64(n) => self.stack.push(Value::Int64(n)),
            Op::Ld128(n) => self.stack.push(Value::Int128(n)),
            Op::LdF32(n) => self.stack.push(Value::Float32(n)),
            Op::LdF64(n) => self.stack.push(Value::Float64(n)),
            Op::LdBool(b) => self.stack.push(Value::Bool(b)),
            Op::LdNull => self.stack.push(Value::Null),
            Op::LdCh(c) => self.stack.push(Value::Char(c)),
            Op::LdUCh(c) => self.stack.push(Value::Uni(c)),
            Op::LdStr(index) => {
                let value = self.code_frame().program.strings[index as usize].clone();
                self.stack.push(Value::Str(value));
            }
            Op::LdObj(index) => {
                let value = self.code_frame().program.objects[index as usize].clone();
                self.stack.push(value);
            }
            Op::LdSym(symbol) => self.stack.push(Value::Symbol(symbol)),

            // Stack manipulation.
            Op::Dup1 => {
                let top = self.stack.last().expect("working stack underflow").clone();
                self.stack.push(top);
            }
            Op::Dup2 => {
                let value = self.stack[self.stack.len() - 2].clone();
                self.stack.push(value);
            }
            Op::Dup(n) => {
                let value = self.stack[self.stack.len() - n as usize].clone();
                self.stack.push(value);
            }
            Op::Pop1 => {
                self.pop();
            }
            Op::Pop2 => {
                let len = self.stack.len();
                self.stack.truncate(len - 2);
            }
            Op::Pop(n) => {
                let len = self.stack.len();
                self.stack.truncate(len - n as usize);
            }
            Op::Rep1 => {
                let top = self.pop();
                self.pop();
                self.stack.push(top);
            }
            Op::Rep2 => {
                let top = self.pop();
                self.pop();
                self.pop();
                self.stack.push(top);
            }
            Op::Rep(n) => {
                let top = self.pop();
                let len = self.stack.len();
                self.stack.truncate(len - n as usize);
                self.stack.push(top);
            }

            // Arguments and locals share the closure's slot array.
            Op::LdArg { depth, index } | Op::LdLoc { depth, index } => {
                let closure = self.code_frame().closure.clone();
                let value = Closure::get_at_depth(&closure, depth as usize, index as usize);
                self.stack.push(value);
            }
            Op::StArg { depth, index } | Op::StLoc { depth, index } => {
                let value = self.stack.last().expect("working stack underflow").clone();
                let closure = self.code_frame().closure.clone();
                Closure::set_at_depth(&closure, depth as usize, index as usize, value);
            }
            Op::StpArg { depth, index } | Op::StpLoc { depth, index } => {
                let value = self.pop();
                let closure = self.code_frame().closure.clone();
                Closure::set_at_depth(&closure, depth as usize, index as usize, value);
            }

            // Free variables resolve against the global closure.
            Op::LdX(symbol) => match engine.globals.get(&symbol) {
                Some(value) => self.stack.push(value.clone()),
                None => {
                    return self.raise(
                        known::EVAL_ERROR,
                        format!("Undefined variable '{}'", engine.symbols.name(symbol)),
                    )
                }
            },
            Op::StX(symbol) => {
                let value = self.stack.last().expect("working stack underflow").clone();
                engine.globals.insert(symbol, value);
            }
            Op::StpX(symbol) => {
                let value = self.pop();
                engine.globals.insert(symbol, value);
            }

            // Local-slot allocation.
            Op::LAlloc(n) => {
                let closure = self.code_frame().closure.clone();
                let mut closure = closure.borrow_mut();
                let start = closure.info.num_args + closure.local_top;
                for slot in 0..n as usize {
                    if let Some(cell) = closure.variables.get_mut(start + slot) {
                        *cell = Value::Null;
                    }
                }
                closure.local_top += n as usize;
            }
            Op::LFree(n) => {
                let closure = self.code_frame().closure.clone();
                let mut closure = closure.borrow_mut();
                closure.local_top = closure.local_top.saturating_sub(n as usize);
            }

            // Properties.
            Op::LdProp(symbol) => {
                let object = self.pop();
                let value = object.get_property(symbol).unwrap_or(Value::Null);
                self.stack.push(value);
            }
            Op::StProp(symbol) | Op::StpProp(symbol) => {
                let value = self.pop();
                let object = self.pop();
                match &object {
                    Value::Object(cell) => {
                        cell.borrow_mut().props.insert(symbol, value.clone());
                    }
                    other => {
                        return self.raise(
                            known::EVAL_ERROR,
                            format!("Cannot set a property on a {}", other.kind().name()),
                        )
                    }
                }
                if matches!(op, Op::StProp(_)) {
                    self.stack.push(value);
                }
            }
            Op::LdMember => {
                let key = self.pop();
                let object = self.pop();
                let value = self.get_member(&object, &key)?;
                self.stack.push(value);
            }
            Op::StMember | Op::StpMember => {
                let value = self.pop();
                let key = self.pop();
                let object = self.pop();
                match (&object, &key) {
                    (Value::Object(cell), Value::Symbol(symbol)) => {
                        cell.borrow_mut().props.insert(*symbol, value.clone());
                    }
                    (Value::Object(_), other) => {
                        return self.raise(
                            known::EVAL_ERROR,
                            format!("A member key must be a symbol, not a {}", other.kind().name()),
                        )
                    }
                    (other, _) => {
                        return self.raise(
                            known::EVAL_ERROR,
                            format!("Cannot set a member of a {}", other.kind().name()),
                        )
                    }
                }
                if matches!(op, Op::StMember) {
                    self.stack.push(value);
                }
            }

            // Property fast paths.
            Op::LdA => self.fast_property(known::A),
            Op::LdD => self.fast_property(known::D),
            Op::LdLeft => self.fast_property(known::LEFT),
            Op::LdRight => self.fast_property(known::RIGHT),
            Op::LdStart => self.fast_property(known::START),
            Op::LdEnd => self.fast_property(known::END),
            Op::LdCount => self.fast_property(known::COUNT),
            Op::LdLength => self.fast_property(known::LENGTH),

            // Calls.
            Op::Call(argc) => {
                let split = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack.split_off(split);
                let callee = self.stack.last().expect("working stack underflow").clone();
                self.invoke(engine, &callee, args)?;
            }
            Op::Met { argc, symbol } => {
                let split = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack.split_off(split);
                let receiver = self.pop();
                self.dispatch_method(engine, receiver, symbol, args)?;
            }
            Op::NewFn(index) => {
                let frame = self.code_frame();
                let value = Value::Function(Shared::new(Function::Compiled {
                    program: frame.program.clone(),
                    index,
                    parent: Some(frame.closure.clone()),
                }));
                self.stack.push(value);
            }
            Op::NewObj(count) => {
                let mut props = ahash::AHashMap::with_capacity(count as usize);
                for _ in 0..count {
                    let value = self.pop();
                    let key = self.pop();
                    match key.as_symbol() {
                        Some(symbol) => {
                            props.insert(symbol, value);
                        }
                        None => {
                            return self.raise(
                                known::EVAL_ERROR,
                                "Object member names must be symbols",
                            )
                        }
                    }
                }
                let base = self.pop();
                let object = Value::object(base);
                if let Value::Object(cell) = &object {
                    cell.borrow_mut().props = props;
                }
                self.stack.push(object);
            }
            Op::Args(n) => {
                let provided = self.code_frame().closure.borrow().provided_args;
                if provided < n as usize {
                    return self.raise(
                        known::NATIVE_METHOD_ERROR,
                        format!(
                            "Function requires at least {} argument(s), but was given {}",
                            n, provided
                        ),
                    );
                }
            }
            Op::Ret => {
                let value = self.pop();
                return self.do_return(engine, value);
            }

            // Control flow.
            Op::Jmp(delta) => self.jump(delta),
            Op::Bf(delta) => {
                let condition = self.pop();
                if !condition.to_bool() {
                    self.jump(delta);
                }
            }
            Op::Bt(delta) => {
                let condition = self.pop();
                if condition.to_bool() {
                    self.jump(delta);
                }
            }
            Op::Label(_) => (),
            Op::Try(delta) => {
                let frame = self.frames.len() - 1;
                let catch_ip = {
                    let code = self.code_frame();
                    (code.ip as i64 - 1 + delta as i64) as usize
                };
                self.handlers.push(Handler {
                    frame,
                    catch_ip,
                    stack_depth: self.stack.len(),
                });
            }
            Op::EndTry => {
                self.handlers.pop();
            }
            Op::Esc { offset, depth } => {
                let base = self.code_frame().base;
                self.stack.truncate(base + depth as usize);
                self.jump(offset);
            }

            // Type and identity tests.
            Op::Is => {
                let target = self.pop();
                let value = self.pop();
                self.stack.push(Value::Bool(value.is_a(&target)));
            }
            Op::TypeOf => {
                let value = self.pop();
                self.stack
                    .push(Value::Symbol(value.kind().type_symbol()));
            }
            Op::SuperEq => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(Value::Bool(lhs.super_eq(&rhs)));
            }
            Op::SuperNe => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.stack.push(Value::Bool(!lhs.super_eq(&rhs)));
            }
            Op::Not => {
                let value = self.pop();
                self.stack.push(Value::Bool(!value.to_bool()));
            }

            Op::Brk => return Ok(Flow::Break),
        }

        Ok(Flow::Continue)
    }

    fn fast_property(&mut self, symbol: Symbol) {
        let object = self.pop();
        let value = object.get_property(symbol).unwrap_or(Value::Null);
        self.stack.push(value);
    }

    /// `get-member` over the core shapes.
    fn get_member(&self, object: &Value, key: &Value) -> Result<Value, Box<EvalError>> {
        match object {
            Value::List(_) => {
                let index = match key {
                    Value::Int64(n) => *n,
                    Value::Int32(n) => *n as i64,
                    Value::Int16(n) => *n as i64,
                    Value::Byte(n) => *n as i64,
                    other => {
                        return self.raise(
                            known::EVAL_ERROR,
                            format!("A list index must be an integer, not a {}", other.kind().name()),
                        )
                    }
                };
                if index < 0 {
                    return self.raise(known::EVAL_ERROR, "List index is out of range");
                }
                match object.iter_list().nth(index as usize) {
                    Some(value) => Ok(value.clone()),
                    None => self.raise(known::EVAL_ERROR, "List index is out of range"),
                }
            }
            Value::Str(s) => {
                let index = match key {
                    Value::Int64(n) => *n,
                    Value::Int32(n) => *n as i64,
                    Value::Int16(n) => *n as i64,
                    Value::Byte(n) => *n as i64,
                    _ => {
                        return self.raise(known::EVAL_ERROR, "A string index must be an integer")
                    }
                };
                match usize::try_from(index).ok().and_then(|i| s.as_bytes().get(i)) {
                    Some(&byte) => Ok(Value::Char(byte)),
                    None => self.raise(known::EVAL_ERROR, "String index is out of range"),
                }
            }
            Value::Object(_) => match key.as_symbol() {
                Some(symbol) => Ok(object.get_property(symbol).unwrap_or(Value::Null)),
                None => self.raise(
                    known::EVAL_ERROR,
                    format!(
                        "An object member key must be a symbol, not a {}",
                        key.kind().name()
                    ),
                ),
            },
            Value::Handle(handle) => match key.as_symbol() {
                Some(symbol) => Ok(handle.get_property(symbol).unwrap_or(Value::Null)),
                None => self.raise(known::EVAL_ERROR, "A handle member key must be a symbol"),
            },
            other => self.raise(
                known::EVAL_ERROR,
                format!("Cannot index a {}", other.kind().name()),
            ),
        }
    }

    //------------------------------------------------------------------
    // Calls.

    /// Invoke a callable with arguments.  Compiled functions push a frame;
    /// externals run (or park a state machine); non-function objects
    /// dispatch through `fn`, then `does-not-understand`.
    fn invoke(
        &mut self,
        engine: &mut Engine,
        callee: &Value,
        args: Vec<Value>,
    ) -> Result<(), Box<EvalError>> {
        match callee {
            Value::Function(function) => match &**function {
                Function::Compiled {
                    program,
                    index,
                    parent,
                } => {
                    let info = program.functions[*index as usize].info.clone();
                    let closure = Closure::new(info, parent.clone(), args);
                    self.frames.push(Frame::Code(CodeFrame {
                        closure: Shared::new(Locked::new(closure)),
                        program: program.clone(),
                        func: *index,
                        ip: 0,
                        base: self.stack.len(),
                    }));
                    Ok(())
                }
                Function::External(external) => {
                    if let Err(message) = external.check_args(&args) {
                        return Err(EvalError::raise(known::NATIVE_METHOD_ERROR, message));
                    }
                    match &external.body {
                        NativeBody::Plain(body) => {
                            let value = {
                                let mut ctx = NativeContext {
                                    symbols: &mut engine.symbols,
                                    globals: &mut engine.globals,
                                };
                                body(&mut ctx, &args)?
                            };
                            self.resume_with(engine, value)
                        }
                        NativeBody::Stateful(factory) => {
                            let mut machine = factory(&args)?;
                            let step = {
                                let mut ctx = NativeContext {
                                    symbols: &mut engine.symbols,
                                    globals: &mut engine.globals,
                                };
                                machine.start(&mut ctx)?
                            };
                            self.frames.push(Frame::Native(NativeFrame {
                                machine,
                                name: external.name.clone(),
                            }));
                            self.apply_step(engine, step)
                        }
                    }
                }
            },
            Value::Object(_) => {
                if let Some(function) = callee.get_property(known::FN_WORD) {
                    return self.invoke(engine, &function, args);
                }
                if let Some(dnu) = callee.get_property(known::DOES_NOT_UNDERSTAND) {
                    let mut all = Vec::with_capacity(args.len() + 2);
                    all.push(callee.clone());
                    all.push(Value::Symbol(known::FN_WORD));
                    all.extend(args);
                    return self.invoke(engine, &dnu, all);
                }
                self.raise(known::EVAL_ERROR, "Object is not callable")
            }
            other => self.raise(
                known::EVAL_ERROR,
                format!("A {} is not callable", other.kind().name()),
            ),
        }
    }

    /// Feed a value to whatever is waiting for it: a native state machine
    /// on top of the frame stack, or the working stack.
    fn resume_with(&mut self, engine: &mut Engine, value: Value) -> Result<(), Box<EvalError>> {
        let mut value = value;
        loop {
            match self.frames.last_mut() {
                Some(Frame::Native(native)) => {
                    let step = {
                        let mut ctx = NativeContext {
                            symbols: &mut engine.symbols,
                            globals: &mut engine.globals,
                        };
                        native.machine.step(value, &mut ctx)?
                    };
                    match step {
                        MachineStep::Done(result) => {
                            self.frames.pop();
                            value = result;
                        }
                        MachineStep::Call { target, args } => {
                            return self.invoke(engine, &target, args)
                        }
                    }
                }
                _ => {
                    self.stack.push(value);
                    return Ok(());
                }
            }
        }
    }

    /// Act on a state machine's first step.
    fn apply_step(&mut self, engine: &mut Engine, step: MachineStep) -> Result<(), Box<EvalError>> {
        match step {
            MachineStep::Done(value) => {
                self.frames.pop();
                self.resume_with(engine, value)
            }
            MachineStep::Call { target, args } => self.invoke(engine, &target, args),
        }
    }

    /// Method dispatch: the receiver's property chain first, then the
    /// built-in operator table, then `does-not-understand`.
    fn dispatch_method(
        &mut self,
        engine: &mut Engine,
        receiver: Value,
        symbol: Symbol,
        args: Vec<Value>,
    ) -> Result<(), Box<EvalError>> {
        if let Value::Object(_) = &receiver {
            if let Some(member) = receiver.get_property(symbol) {
                return match &member {
                    Value::Function(_) => {
                        let mut all = Vec::with_capacity(args.len() + 1);
                        all.push(receiver);
                        all.extend(args);
                        self.invoke(engine, &member, all)
                    }
                    _ if args.is_empty() => {
                        self.stack.push(member);
                        Ok(())
                    }
                    other => self.raise(
                        known::EVAL_ERROR,
                        format!(
                            "Property '{}' is a {}, not a method",
                            engine.symbols.name(symbol),
                            other.kind().name()
                        ),
                    ),
                };
            }
            if let Some(dnu) = receiver.get_property(known::DOES_NOT_UNDERSTAND) {
                let mut all = Vec::with_capacity(args.len() + 2);
                all.push(receiver);
                all.push(Value::Symbol(symbol));
                all.extend(args);
                return self.invoke(engine, &dnu, all);
            }
            return self.raise(
                known::EVAL_ERROR,
                format!(
                    "Object does not understand '{}'",
                    engine.symbols.name(symbol)
                ),
            );
        }

        // Built-in operators over the primitive shapes.
        let builtin_result = match args.len() {
            0 => builtin::unary_op(symbol, &receiver, &engine.symbols),
            1 => builtin::binary_op(symbol, &receiver, &args[0], &engine.symbols),
            _ => None,
        };
        if let Some(result) = builtin_result {
            let value = result?;
            self.stack.push(value);
            return Ok(());
        }

        // A zero-argument method call can read a plain property.
        if args.is_empty() {
            if let Some(value) = receiver.get_property(symbol) {
                self.stack.push(value);
                return Ok(());
            }
        }

        self.raise(
            known::EVAL_ERROR,
            format!(
                "A {} does not understand '{}'",
                receiver.kind().name(),
                engine.symbols.name(symbol)
            ),
        )
    }

    /// Return a value from the current frame.
    fn do_return(&mut self, engine: &mut Engine, value: Value) -> Result<Flow, Box<EvalError>> {
        let frame = self.frames.pop().expect("return without a frame");
        if let Frame::Code(code) = &frame {
            self.stack.truncate(code.base);
        }

        // Handlers installed by the departing frame die with it.
        let remaining = self.frames.len();
        self.handlers.retain(|handler| handler.frame < remaining);

        if self.frames.is_empty() {
            return Ok(Flow::Finished(value));
        }
        self.resume_with(engine, value)?;
        Ok(Flow::Continue)
    }

    //------------------------------------------------------------------
    // Exceptions.

    /// Build the exception object for an error and unwind to the nearest
    /// handler.  Returns the exception value if nothing catches it.
    fn unwind(&mut self, engine: &mut Engine, err: EvalError) -> Option<Value> {
        let exception = match err {
            EvalError::Exception(value) => value,
            EvalError::Raise(kind, message) => self.make_exception(engine, kind, &message),
        };

        match self.handlers.pop() {
            Some(handler) => {
                tracing::trace!(frame = handler.frame, "unwinding to handler");
                self.frames.truncate(handler.frame + 1);
                self.stack.truncate(handler.stack_depth);
                self.stack.push(exception);
                match self.frames.last_mut() {
                    Some(Frame::Code(frame)) => frame.ip = handler.catch_ip,
                    _ => unreachable!("handlers are only installed by code frames"),
                }
                None
            }
            None => Some(exception),
        }
    }

    /// An exception is an ordinary object carrying `kind`, `message`, and
    /// `stack-trace`.
    fn make_exception(&self, engine: &Engine, kind: Symbol, message: &str) -> Value {
        let trace = Value::list(self.stack_trace(engine));
        let object = Value::object(Value::Null);
        if let Value::Object(cell) = &object {
            let mut object = cell.borrow_mut();
            object.props.insert(known::KIND, Value::Symbol(kind));
            object
                .props
                .insert(known::MESSAGE, Value::Str(message.into()));
            object.props.insert(known::STACK_TRACE, trace);
        }
        object
    }

    /// One entry per live frame, innermost first.
    fn stack_trace(&self, _engine: &Engine) -> Vec<Value> {
        self.frames
            .iter()
            .rev()
            .map(|frame| match frame {
                Frame::Code(code) => {
                    let function = &code.program.functions[code.func as usize];
                    let at = code.ip.saturating_sub(1).min(
                        function.segment.locations.len().saturating_sub(1),
                    );
                    let text = match function
                        .segment
                        .locations
                        .get(at)
                        .and_then(|&id| code.program.location(id))
                    {
                        Some(location) if !location.pos.is_none() => format!(
                            "{}:{}",
                            location.filename,
                            location.pos.line().unwrap_or(0)
                        ),
                        Some(location) => location.filename.as_str().to_string(),
                        None => "<unknown>".to_string(),
                    };
                    Value::Str(text.into())
                }
                Frame::Native(native) => {
                    Value::Str(format!("<native:{}>", native.name).into())
                }
            })
            .collect()
    }
}
