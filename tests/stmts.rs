use smile::Engine;

fn parsed(engine: &mut Engine, src: &str) -> String {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    engine.stringify(&outcome.expr)
}

#[test]
fn test_stmts_if_then() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "4 + 5\nif 1 < 2 then 10\n6 + 7"),
        "[$progn [(4 . +) 5] [$if [(1 . <) 2] 10] [(6 . +) 7]]"
    );
}

#[test]
fn test_stmts_if_then_else() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "if 1 < 2 then 10 else 20"),
        "[$if [(1 . <) 2] 10 20]"
    );
}

#[test]
fn test_stmts_nested_conditionals() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "if 1 < 2 then\n  if 5 < 6 then 50\n  else 60\nelse if 3 < 4 then\n  if 7 < 8 then 70\n  else 80\nelse 40"
        ),
        "[$if [(1 . <) 2] [$if [(5 . <) 6] 50 60] [$if [(3 . <) 4] [$if [(7 . <) 8] 70 80] 40]]"
    );
}

#[test]
fn test_stmts_unless() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "unless 1 < 2 then 10"),
        "[$if [$not [(1 . <) 2]] 10]"
    );
    assert_eq!(
        parsed(&mut engine, "unless 1 < 2 then 10 else 20"),
        "[$if [$not [(1 . <) 2]] 10 20]"
    );
}

#[test]
fn test_stmts_while_do() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "while 1 < 2 do 10"),
        "[$while [(1 . <) 2] 10]"
    );
    assert_eq!(
        parsed(&mut engine, "until 1 < 2 do 10"),
        "[$while [$not [(1 . <) 2]] 10]"
    );
}

#[test]
fn test_stmts_do_while() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "do 10 while 1 < 2"),
        "[$while 10 [(1 . <) 2] null]"
    );
    assert_eq!(
        parsed(&mut engine, "do 10 until 1 < 2"),
        "[$while 10 [$not [(1 . <) 2]] null]"
    );
    assert_eq!(
        parsed(&mut engine, "do 10 while 1 < 2 then 30"),
        "[$while 10 [(1 . <) 2] 30]"
    );
}

#[test]
fn test_stmts_try_catch() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "try {\n  4 + 5\n  6 + 7\n}\ncatch |e| 10 + 20"),
        "[$catch [$progn [(4 . +) 5] [(6 . +) 7]] [$fn [e] [(10 . +) 20]]]"
    );
    assert_eq!(
        parsed(&mut engine, "try {\n  4 + 5\n  6 + 7\n}\ncatch [$fn [e] 10 + 20]"),
        "[$catch [$progn [(4 . +) 5] [(6 . +) 7]] [$fn [e] [(10 . +) 20]]]"
    );
}

#[test]
fn test_stmts_return() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "return 10 + 20"),
        "[$return [(10 . +) 20]]"
    );
    assert_eq!(parsed(&mut engine, "return"), "[$return]");
}

#[test]
fn test_stmts_till() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "till done do 10 + 20"),
        "[$till [done] [(10 . +) 20]]"
    );
}

#[test]
fn test_stmts_till_flags_inside_body() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "till done do {\n    10 + 20\n    if 1 then done\n    30 + 40\n}"
        ),
        "[$till [done] [$progn [(10 . +) 20] [$if 1 done] [(30 . +) 40]]]"
    );
}

#[test]
fn test_stmts_till_multiple_flags() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "till found, not-found, abort do {\n    if 1 then found\n    if 2 then not-found\n    if 3 then abort\n}"
        ),
        "[$till [found not-found abort] [$progn [$if 1 found] [$if 2 not-found] [$if 3 abort]]]"
    );
}

#[test]
fn test_stmts_till_when_clauses() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "till done do {\n    if 1 then done\n}\nwhen done {\n    50 + 60\n}"
        ),
        "[$till [done] [$if 1 done] [[done [(50 . +) 60]]]]"
    );
}

#[test]
fn test_stmts_till_multiple_when_clauses() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "till found, abort do {\n    if 1 then found\n    if 2 then abort\n}\nwhen found {\n    50 + 60\n}\nwhen abort {\n    90 + 100\n}"
        ),
        "[$till [found abort] [$progn [$if 1 found] [$if 2 abort]] [[found [(50 . +) 60]] [abort [(90 . +) 100]]]]"
    );
}

#[test]
fn test_stmts_till_flags_do_not_leak() {
    let mut engine = Engine::new();
    let outcome = engine.parse("till done do 10\ndone", "test.sm");
    assert!(!outcome.is_ok(), "the flag should be out of scope after the loop");
}

#[test]
fn test_stmts_var_declarations() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "var x = 10"),
        "[$scope [x] [$set x 10]]"
    );

    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "var a = 1, b = 2\na + b"),
        "[$scope [a b] [$progn [$set a 1] [$set b 2]] [(a . +) b]]"
    );
}

#[test]
fn test_stmts_var_requires_new_name() {
    let mut engine = Engine::new();
    let outcome = engine.parse("var x = 1\nvar x = 2", "test.sm");
    assert!(!outcome.is_ok());
}

#[test]
fn test_stmts_undeclared_rhs_is_an_error() {
    let mut engine = Engine::new();
    let outcome = engine.parse("var y = zorp", "test.sm");
    assert!(!outcome.is_ok());
}

#[test]
fn test_stmts_block_scopes_keep_vars_local() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "till stop do {\n  var t = 1\n  if t then stop\n}"),
        "[$till [stop] [$scope [t] [$set t 1] [$if t stop]]]"
    );

    // The block-local name is gone afterwards.
    let outcome = engine.parse("t", "test.sm");
    assert!(!outcome.is_ok());
}
