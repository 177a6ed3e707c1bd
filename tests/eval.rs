use smile::{
    known, ByteCodeSegment, ClosureInfo, CompiledFunction, Engine, EvalError, EvalResult,
    ExternalFunction, Machine, MachineStep, NativeContext, Op, Position, Program, Shared,
    SourceLocation, StateMachine, Value,
};

fn eval(engine: &mut Engine, src: &str) -> Value {
    match engine.eval(src, "test.sm") {
        Ok(EvalResult::Value(value)) => value,
        Ok(other) => panic!("eval of {:?} produced {:?}", src, other),
        Err(messages) => panic!("eval of {:?} failed: {:?}", src, messages),
    }
}

fn eval_i64(engine: &mut Engine, src: &str) -> i64 {
    match eval(engine, src) {
        Value::Int64(n) => n,
        other => panic!("expected an integer from {:?}, got {:?}", src, other),
    }
}

fn eval_exception(engine: &mut Engine, src: &str) -> Value {
    match engine.eval(src, "test.sm") {
        Ok(EvalResult::Exception(exception)) => exception,
        Ok(other) => panic!("eval of {:?} produced {:?}", src, other),
        Err(messages) => panic!("eval of {:?} failed: {:?}", src, messages),
    }
}

#[test]
fn test_eval_arithmetic() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "6 * 7"), 42);
    assert_eq!(eval_i64(&mut engine, "1 + 2 * 3"), 7);
    assert_eq!(eval_i64(&mut engine, "10 - 2 - 3"), 5);
    assert_eq!(eval_i64(&mut engine, "7 / 2"), 3);
    assert_eq!(eval_i64(&mut engine, "-5 + 8"), 3);
}

#[test]
fn test_eval_mixed_width_arithmetic_promotes() {
    let mut engine = Engine::new();
    match eval(&mut engine, "100x + 1") {
        Value::Int64(n) => assert_eq!(n, 101),
        other => panic!("expected a promoted integer, got {:?}", other),
    }
}

#[test]
fn test_eval_floats() {
    let mut engine = Engine::new();
    match eval(&mut engine, "1.5 + 2.25") {
        Value::Float64(n) => assert!((n - 3.75).abs() < 1e-9),
        other => panic!("expected a float, got {:?}", other),
    }
}

#[test]
fn test_eval_comparisons_and_logic() {
    let mut engine = Engine::new();
    assert_eq!(eval(&mut engine, "1 < 2"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "1 < 10 and 0 == 0 and 15 >= 8"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "1 > 2 or 3 > 2"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "not 0"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "0 === 0"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "0 !== 1"), Value::Bool(true));
}

#[test]
fn test_eval_if() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "if 1 < 2 then 10 else 20"), 10);
    assert_eq!(eval_i64(&mut engine, "if 1 > 2 then 10 else 20"), 20);
    assert_eq!(eval(&mut engine, "if 1 > 2 then 10"), Value::Null);
}

#[test]
fn test_eval_typeof_and_is() {
    let mut engine = Engine::new();
    assert_eq!(
        eval(&mut engine, "typeof 15"),
        Value::Symbol(known::TYPE_INTEGER64)
    );
    assert_eq!(
        eval(&mut engine, "typeof \"s\""),
        Value::Symbol(known::TYPE_STRING)
    );
    assert_eq!(eval(&mut engine, "15 is typeof 10"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "15 is typeof 1.5"), Value::Bool(false));
}

#[test]
fn test_eval_strings() {
    let mut engine = Engine::new();
    match eval(&mut engine, "\"foo\" + \"bar\"") {
        Value::Str(s) => assert_eq!(s.as_str(), "foobar"),
        other => panic!("expected a string, got {:?}", other),
    }
    match eval(&mut engine, "x = 7\n\"x is {x}!\"") {
        Value::Str(s) => assert_eq!(s.as_str(), "x is 7!"),
        other => panic!("expected a string, got {:?}", other),
    }
}

#[test]
fn test_eval_functions() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "[[$fn [x] x] 42]"), 42);
    assert_eq!(eval_i64(&mut engine, "f = |x y| x * y + 1\n[f 3 4]"), 13);
}

#[test]
fn test_eval_closures_capture_their_environment() {
    let mut engine = Engine::new();
    assert_eq!(
        eval_i64(&mut engine, "make = |n| |m| n + m\nadd3 = [make 3]\n[add3 4]"),
        7
    );
}

#[test]
fn test_eval_missing_arguments_raise() {
    let mut engine = Engine::new();
    let exception = eval_exception(&mut engine, "f = |x y| x\n[f 1]");
    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::NATIVE_METHOD_ERROR))
    );
}

#[test]
fn test_eval_while_loops() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "x = 0\nwhile x < 5 do x += 1\nx"), 5);
    assert_eq!(eval_i64(&mut engine, "y = 0\ndo y += 1 while y < 3\ny"), 3);
    // The do..then form runs its tail clause between iterations.
    assert_eq!(
        eval_i64(&mut engine, "z = 0\nc = 0\ndo z += 1 while z < 3 then c += 1\nc"),
        2
    );
}

#[test]
fn test_eval_till_terminates_and_yields_body_value() {
    let mut engine = Engine::new();
    assert_eq!(
        eval_i64(
            &mut engine,
            "x = 10\ntill done do { x -= 1; if not x then done }\nx"
        ),
        0
    );

    let result = eval(
        &mut engine,
        "y = 10\ntill done do { y -= 1; if not y then done }"
    );
    assert_eq!(result, Value::Null);
}

#[test]
fn test_eval_till_when_clauses() {
    let mut engine = Engine::new();
    assert_eq!(
        eval_i64(
            &mut engine,
            "x = 0\ntill done do { x += 1; if x == 3 then done }\nwhen done { 42 }"
        ),
        42
    );

    // The first flag to fire picks its own clause.
    assert_eq!(
        eval_i64(
            &mut engine,
            "n = 0\ntill even, odd do {\n  n += 7\n  if n == 7 then odd\n  if n == 8 then even\n}\nwhen even { 2 }\nwhen odd { 1 }"
        ),
        1
    );
}

#[test]
fn test_eval_objects_and_properties() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "o = new { a:1 b:2 }\no.a + o.b"), 3);
    assert_eq!(eval_i64(&mut engine, "p = new { n:5 }\np.n = 9\np.n"), 9);
    assert_eq!(eval_i64(&mut engine, "q = new { n:5 }\nq.n += 2\nq.n"), 7);

    // Property chains walk the base link.
    assert_eq!(
        eval_i64(
            &mut engine,
            "base = new { shared:10 }\nchild = new base { own:1 }\nchild.shared + child.own"
        ),
        11
    );
}

#[test]
fn test_eval_lists_and_indexing() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "lst = `[10 20 30]\nlst:1"), 20);
    assert_eq!(eval_i64(&mut engine, "lst = `[10 20 30]\nlst.a"), 10);
    assert_eq!(eval_i64(&mut engine, "lst = `[10 20 30]\nlst.length"), 3);
    assert_eq!(eval_i64(&mut engine, "(1..5):2"), 3);
    assert_eq!(eval_i64(&mut engine, "(1 ## 2).a"), 1);
}

#[test]
fn test_eval_catch_handles_exceptions() {
    let mut engine = Engine::new();
    assert_eq!(eval_i64(&mut engine, "try { 42 } catch |e| 0"), 42);
    assert_eq!(
        eval(&mut engine, "try { 1 / 0 } catch |e| e.kind"),
        Value::Symbol(known::NATIVE_METHOD_ERROR)
    );

    // The handler catches throws from nested calls too.
    assert_eq!(
        eval_i64(&mut engine, "f = |x| x / 0\ntry { [f 1] } catch |e| 99"),
        99
    );

    // Evaluation continues normally after a handled exception.
    assert_eq!(
        eval_i64(&mut engine, "a = try { 1 / 0 } catch |e| 5\na + 1"),
        6
    );
}

#[test]
fn test_eval_uncaught_exceptions_carry_their_shape() {
    let mut engine = Engine::new();
    let exception = eval_exception(&mut engine, "1 / 0");

    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::NATIVE_METHOD_ERROR))
    );
    match exception.get_property(known::MESSAGE) {
        Some(Value::Str(message)) => assert!(message.contains("Division by zero")),
        other => panic!("expected a message string, got {:?}", other),
    }
    match exception.get_property(known::STACK_TRACE) {
        Some(trace) => assert!(trace.list_len().unwrap_or(0) >= 1),
        None => panic!("expected a stack trace"),
    }
}

#[test]
fn test_eval_non_function_call_dispatches_through_fn() {
    let mut engine = Engine::new();
    assert_eq!(
        eval_i64(&mut engine, "o = new { fn:|self| 42 }\n[o]"),
        42
    );

    let exception = eval_exception(&mut engine, "[15]");
    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::EVAL_ERROR))
    );
}

#[test]
fn test_eval_method_dispatch_on_objects() {
    let mut engine = Engine::new();
    assert_eq!(
        eval_i64(
            &mut engine,
            "o = new { n:10 double:|self| self.n * 2 }\n[o.double]"
        ),
        20
    );
}

#[test]
fn test_eval_does_not_understand() {
    let mut engine = Engine::new();
    let exception = eval_exception(&mut engine, "o = new { }\n[o.zap 1]");
    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::EVAL_ERROR))
    );
}

#[test]
fn test_eval_global_variable_protocol() {
    let mut engine = Engine::new();
    engine.set_global_variable(known::REPL_LAST, Value::Int64(41));
    assert_eq!(eval_i64(&mut engine, "$_ + 1"), 42);

    let answer = engine.intern("answer");
    eval(&mut engine, "answer = 42");
    assert_eq!(engine.get_global_variable(answer), Some(Value::Int64(42)));
}

#[test]
fn test_eval_external_functions() {
    let mut engine = Engine::new();
    engine.register_fn("double", 1, 1, |_ctx, args| match &args[0] {
        Value::Int64(n) => Ok(Value::Int64(n * 2)),
        _ => Ok(Value::Null),
    });
    assert_eq!(eval_i64(&mut engine, "[double 21]"), 42);

    // Argument-count checks raise before the native body runs.
    let exception = eval_exception(&mut engine, "[double]");
    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::NATIVE_METHOD_ERROR))
    );
}

/// A state machine that invokes its function argument twice, feeding the
/// first result back in, without any host-stack recursion.
struct Twice {
    target: Value,
    stage: u8,
}

impl StateMachine for Twice {
    fn start(&mut self, _ctx: &mut NativeContext) -> Result<MachineStep, Box<EvalError>> {
        Ok(MachineStep::Call {
            target: self.target.clone(),
            args: vec![Value::Int64(1)],
        })
    }

    fn step(
        &mut self,
        result: Value,
        _ctx: &mut NativeContext,
    ) -> Result<MachineStep, Box<EvalError>> {
        if self.stage == 0 {
            self.stage = 1;
            Ok(MachineStep::Call {
                target: self.target.clone(),
                args: vec![result],
            })
        } else {
            Ok(MachineStep::Done(result))
        }
    }
}

#[test]
fn test_eval_state_machine_externals() {
    let mut engine = Engine::new();
    engine.register_stateful_fn("twice", 1, 1, |args| {
        Ok(Box::new(Twice {
            target: args[0].clone(),
            stage: 0,
        }))
    });

    assert_eq!(eval_i64(&mut engine, "[twice |x| x + 10]"), 21);
}

#[test]
fn test_eval_breakpoint_suspends_and_resumes() {
    let mut engine = Engine::new();

    let mut segment = ByteCodeSegment::new();
    segment.emit(Op::Ld64(41), 0);
    segment.emit(Op::Brk, 0);
    segment.emit(Op::Ld64(1), 0);
    segment.emit(
        Op::Met {
            argc: 1,
            symbol: known::PLUS,
        },
        0,
    );
    segment.emit(Op::Ret, 0);

    let info = Shared::new(ClosureInfo::new(None, &[], &[], 4));
    let program = Shared::new(Program {
        strings: Vec::new(),
        objects: Vec::new(),
        functions: vec![CompiledFunction {
            args: Vec::new(),
            local_names: Vec::new(),
            segment,
            stack_size: 4,
            index: 0,
            depth: 0,
            info,
        }],
        locations: vec![SourceLocation {
            filename: "breakpoint.sm".into(),
            pos: Position::NONE,
        }],
        main: 0,
    });

    let suspended = match Machine::new(program).run(&mut engine) {
        EvalResult::Break(machine) => machine,
        other => panic!("expected a breakpoint stop, got {:?}", other),
    };

    match suspended.run(&mut engine) {
        EvalResult::Value(Value::Int64(n)) => assert_eq!(n, 42),
        other => panic!("expected 42 after resuming, got {:?}", other),
    }
}

#[test]
fn test_eval_arg_checked_externals() {
    let mut engine = Engine::new();
    engine.register_external_function(
        ExternalFunction::plain("only-ints", 1, 1, |_ctx, args| Ok(args[0].clone()))
            .with_arg_checks(vec![smile::ArgCheck {
                mask: smile::KindMask::numeric(),
                expected: smile::ValueKind::Int64,
            }]),
    );

    assert_eq!(eval_i64(&mut engine, "[only-ints 5]"), 5);

    let exception = eval_exception(&mut engine, "[only-ints \"nope\"]");
    assert_eq!(
        exception.get_property(known::KIND),
        Some(Value::Symbol(known::NATIVE_METHOD_ERROR))
    );
}
