use smile::{Engine, Op, Program, Shared};

fn compile(engine: &mut Engine, src: &str) -> Shared<Program> {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    engine
        .compile(&outcome.expr, "test.sm")
        .unwrap_or_else(|messages| panic!("compile of {:?} failed: {:?}", src, messages))
}

fn main_code(engine: &mut Engine, src: &str) -> Vec<Op> {
    let program = compile(engine, src);
    program.functions[program.main as usize].segment.code.clone()
}

#[test]
fn test_compiler_discarded_loads_are_deleted() {
    let mut engine = Engine::new();
    // The first two statements are pure loads whose results are unused;
    // the pop fusion deletes them outright.
    assert_eq!(
        main_code(&mut engine, "1\n2\n3"),
        vec![Op::Ld64(3), Op::Ret]
    );
}

#[test]
fn test_compiler_discarded_member_load_unwinds_its_operands() {
    let mut engine = Engine::new();
    let a = engine.intern("a");
    // Popping a member load deletes it and then pops (deletes) the
    // collection and key loads beneath it, so the whole middle statement
    // vanishes.
    assert_eq!(
        main_code(&mut engine, "a = `[1 2]\na:0\n7"),
        vec![Op::LdObj(0), Op::StpX(a), Op::Ld64(7), Op::Ret]
    );
}

#[test]
fn test_compiler_store_fuses_with_pop() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "x = 1\n2");
    assert!(
        code.iter().any(|op| matches!(op, Op::StpX(_))),
        "expected a fused store-and-pop, got {:?}",
        code
    );
    assert!(
        !code.iter().any(|op| matches!(op, Op::Pop1)),
        "the plain pop should have fused away: {:?}",
        code
    );
}

#[test]
fn test_compiler_rep_fuses_into_pop2() {
    let mut engine = Engine::new();
    // A discarded call result: Call leaves the callee under the result,
    // so the Rep1 that would fold them becomes a Pop2.
    let code = main_code(&mut engine, "f = |x| 1\n[f 0]\n7");
    assert!(
        code.iter().any(|op| matches!(op, Op::Pop2)),
        "expected Rep1 to fuse into Pop2: {:?}",
        code
    );
}

#[test]
fn test_compiler_if_lowering_pairs_branches_with_labels() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "if 1 < 2 then 10 else 20");

    // Every branch target is a Label carrying the inverse displacement.
    for (offset, op) in code.iter().enumerate() {
        let delta = match op {
            Op::Jmp(delta) | Op::Bf(delta) | Op::Bt(delta) | Op::Try(delta) => *delta,
            _ => continue,
        };
        let target = (offset as i64 + delta as i64) as usize;
        match code[target] {
            Op::Label(back) => assert_eq!(back, -delta, "label back-offset mismatch"),
            other => panic!("branch at {} lands on {:?}, not a label", offset, other),
        }
    }
}

#[test]
fn test_compiler_if_strips_not_wrappers() {
    let mut engine = Engine::new();
    // One [$not] swaps the branches instead of emitting a Not.
    let code = main_code(&mut engine, "if not 1 then 10 else 20");
    assert!(
        !code.iter().any(|op| matches!(op, Op::Not)),
        "the not should be folded into the branch: {:?}",
        code
    );

    // Two [$not]s cancel entirely.
    let code = main_code(&mut engine, "if not not 1 then 10 else 20");
    assert!(!code.iter().any(|op| matches!(op, Op::Not)));
}

#[test]
fn test_compiler_stack_size_accounting() {
    let mut engine = Engine::new();
    let program = compile(&mut engine, "1 + 2 * 3");
    assert_eq!(program.functions[program.main as usize].stack_size, 3);

    let program = compile(&mut engine, "1");
    assert_eq!(program.functions[program.main as usize].stack_size, 1);
}

#[test]
fn test_compiler_fn_compiles_nested_function() {
    let mut engine = Engine::new();
    let program = compile(&mut engine, "|x y| x * y + 1");
    assert_eq!(program.functions.len(), 2);

    let main = &program.functions[program.main as usize];
    assert!(main
        .segment
        .code
        .iter()
        .any(|op| matches!(op, Op::NewFn(_))));

    let inner = &program.functions[1];
    assert_eq!(inner.args.len(), 2);
    assert!(inner.segment.code.iter().any(|op| matches!(op, Op::Args(2))));
    assert!(inner
        .segment
        .code
        .iter()
        .any(|op| matches!(op, Op::LdArg { depth: 0, index: 0 })));
}

#[test]
fn test_compiler_free_variables_use_symbolic_ops() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "x = 5\nx + 1");
    assert!(code.iter().any(|op| matches!(op, Op::StpX(_))));
    assert!(code.iter().any(|op| matches!(op, Op::LdX(_))));
}

#[test]
fn test_compiler_scope_allocates_and_frees_locals() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "var x = 10\nx");
    assert!(code.iter().any(|op| matches!(op, Op::LAlloc(1))));
    assert!(code.iter().any(|op| matches!(op, Op::LFree(1))));
    assert!(code
        .iter()
        .any(|op| matches!(op, Op::StpLoc { depth: 0, .. })));
    assert!(code
        .iter()
        .any(|op| matches!(op, Op::LdLoc { depth: 0, .. })));
}

#[test]
fn test_compiler_catch_installs_a_handler() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "try { 1 } catch |e| 2");
    assert!(code.iter().any(|op| matches!(op, Op::Try(_))));
    assert!(code.iter().any(|op| matches!(op, Op::EndTry)));
}

#[test]
fn test_compiler_till_escapes_and_hidden_slot() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "till done do { if 1 then done }");
    assert!(code.iter().any(|op| matches!(op, Op::Esc { .. })));
    assert!(code
        .iter()
        .any(|op| matches!(op, Op::StpLoc { depth: 0, .. })));
}

#[test]
fn test_compiler_new_object_shape() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "new { a:1 b:2 }");
    assert!(code.iter().any(|op| matches!(op, Op::NewObj(2))));
    assert_eq!(
        code.iter()
            .filter(|op| matches!(op, Op::LdSym(_)))
            .count(),
        2
    );
}

#[test]
fn test_compiler_method_calls_fuse_dispatch() {
    let mut engine = Engine::new();
    let code = main_code(&mut engine, "1 + 2");
    assert!(code
        .iter()
        .any(|op| matches!(op, Op::Met { argc: 1, .. })));
}

#[test]
fn test_compiler_malformed_forms_are_reported() {
    let mut engine = Engine::new();
    let outcome = engine.parse("[$set]", "test.sm");
    assert!(outcome.is_ok(), "{:?}", outcome.messages);
    assert!(engine.compile(&outcome.expr, "test.sm").is_err());
}

#[test]
fn test_compiler_disassembly_is_readable() {
    let mut engine = Engine::new();
    let program = compile(&mut engine, "1 + 2");
    let listing = program.functions[program.main as usize]
        .segment
        .disassemble(engine.symbols());
    assert!(listing.contains("Met1 +"), "listing was:\n{}", listing);
}
