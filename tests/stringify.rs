use smile::{Engine, Value};

/// Parse, print, and parse again; the two trees must be structurally
/// equal (source positions aside, which never affect equality).
fn round_trip(engine: &mut Engine, src: &str) {
    let first = engine.parse(src, "test.sm");
    assert!(first.is_ok(), "parse of {:?} failed: {:?}", src, first.messages);

    let printed = engine.stringify(&first.expr);
    let second = engine.parse(&printed, "test.sm");
    assert!(
        second.is_ok(),
        "reparse of {:?} failed: {:?}",
        printed,
        second.messages
    );

    assert_eq!(first.expr, second.expr, "round trip changed {:?}", printed);
}

#[test]
fn test_stringify_literals() {
    let engine = Engine::new();
    assert_eq!(engine.stringify(&Value::Null), "null");
    assert_eq!(engine.stringify(&Value::Bool(true)), "true");
    assert_eq!(engine.stringify(&Value::Byte(7)), "7x");
    assert_eq!(engine.stringify(&Value::Int16(7)), "7h");
    assert_eq!(engine.stringify(&Value::Int32(7)), "7L");
    assert_eq!(engine.stringify(&Value::Int64(7)), "7");
    assert_eq!(engine.stringify(&Value::Float64(1.5)), "1.5");
    assert_eq!(engine.stringify(&Value::Float64(2.0)), "2.0");
    assert_eq!(engine.stringify(&Value::Str("a\"b\n".into())), "\"a\\\"b\\n\"");
    assert_eq!(engine.stringify(&Value::Char(b'x')), "'x'");
}

#[test]
fn test_stringify_lists_and_pairs() {
    let engine = Engine::new();
    let list = Value::list(vec![Value::Int64(1), Value::Int64(2), Value::Int64(3)]);
    assert_eq!(engine.stringify(&list), "[1 2 3]");

    let pair = Value::pair(Value::Int64(1), Value::Int64(2));
    assert_eq!(engine.stringify(&pair), "(1 . 2)");

    let dotted = Value::cons(Value::Int64(1), Value::Int64(2));
    assert_eq!(engine.stringify(&dotted), "[1 . 2]");
}

#[test]
fn test_stringify_round_trips_quoted_forms() {
    let mut engine = Engine::new();
    round_trip(&mut engine, "`[foo bar.baz 12 \"str\"]");
    round_trip(&mut engine, "`[a [b c] [d [e f]]]");
    round_trip(&mut engine, "`(1 + 2 * 3)");
}

#[test]
fn test_stringify_round_trips_literal_programs() {
    let mut engine = Engine::new();
    round_trip(&mut engine, "12 12345 45 0x10 0x2B \"or not\" 0x2B");
    round_trip(&mut engine, "1 < 10 and 0 == 0 and 15 >= 8");
    round_trip(&mut engine, "if 1 < 2 then 10 else 20");
    round_trip(&mut engine, "7x 7h 7L 7 1.5 1.5f 'q'");
}

#[test]
fn test_stringify_round_trips_statement_forms() {
    let mut engine = Engine::new();
    round_trip(&mut engine, "do 10 while 1 < 2");
    round_trip(&mut engine, "till flag do { if 1 then flag }");
    round_trip(&mut engine, "try { 1 } catch |e| 2");
}
