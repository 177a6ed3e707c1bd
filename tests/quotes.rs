use smile::{Engine, EvalResult, Value};

fn parsed(engine: &mut Engine, src: &str) -> String {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    engine.stringify(&outcome.expr)
}

#[test]
fn test_quotes_symbol() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "`x"), "[$quote x]");
}

#[test]
fn test_quotes_list() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "`[x y z]"), "[$quote [x y z]]");
}

#[test]
fn test_quotes_list_of_pairs() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x.y a.b c.d]"),
        "[$quote [(x . y) (a . b) (c . d)]]"
    );
}

#[test]
fn test_quotes_nested_lists() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x y [a b c] [p q [r s]] z]"),
        "[$quote [x y [a b c] [p q [r s]] z]]"
    );
}

#[test]
fn test_quotes_parenthesized_expression() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`(1 + 2 * 3)"),
        "[$quote [(1 . +) [(2 . *) 3]]]"
    );
}

#[test]
fn test_quotes_template_with_expression() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x y z (1 + 2 * 3)]"),
        "[(List . of) [$quote x] [$quote y] [$quote z] [(1 . +) [(2 . *) 3]]]"
    );
}

#[test]
fn test_quotes_nested_backquote_stays_quoted() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x y z `(1 + 2 * 3)]"),
        "[$quote [x y z [(1 . +) [(2 . *) 3]]]]"
    );
}

#[test]
fn test_quotes_template_with_unquote_variable() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "a = 1\n`[x (a) z `(1 + 2 * 3)]"),
        "[$progn [$set a 1] [(List . of) [$quote x] a [$quote z] [$quote [(1 . +) [(2 . *) 3]]]]]"
    );
}

#[test]
fn test_quotes_splices() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "a = 1\nb = 2\n`[x @(a) z @(b)]"),
        "[$progn [$set a 1] [$set b 2] [(List . combine) [$quote [x]] a [$quote [z]] b]]"
    );
}

#[test]
fn test_quotes_embedded_block_is_unquoted() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x y z { 1 + 2 * 3 }]"),
        "[(List . of) [$quote x] [$quote y] [$quote z] [(1 . +) [(2 . *) 3]]]"
    );
}

#[test]
fn test_quotes_constant_dynamic_string() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "`[x y z \"x is awesome.\"]"),
        "[$quote [x y z \"x is awesome.\"]]"
    );
}

#[test]
fn test_quotes_interpolated_dynamic_string() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "x = 1\n`[y \"{x} is awesome.\"]"),
        "[$progn [$set x 1] [(List . of) [$quote y] [([(List . of) x \" is awesome.\"] . join)]]]"
    );
}

#[test]
fn test_quotes_raw_quote_form() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "x = 1\n[$quote (x + 10)]"),
        "[$progn [$set x 1] [$quote [(x . +) 10]]]"
    );
}

#[test]
fn test_quotes_raw_quote_form_without_declarations() {
    // Names inside a quoted form need no declarations at all.
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "[$quote [frobnicate zoosh]]"),
        "[$quote [frobnicate zoosh]]"
    );
}

#[test]
fn test_quotes_evaluate_to_their_payload() {
    // [$quote x] evaluates to a value structurally equal to x.
    let mut engine = Engine::new();

    let outcome = engine.parse("`[a b [c 12] \"s\"]", "test.sm");
    assert!(outcome.is_ok());
    let payload = outcome
        .expr
        .iter_list()
        .nth(1)
        .expect("a quote form has a payload")
        .clone();

    match engine.eval("`[a b [c 12] \"s\"]", "test.sm").unwrap() {
        EvalResult::Value(value) => assert_eq!(value, payload),
        other => panic!("expected a value, got {:?}", other),
    }
}

#[test]
fn test_quotes_template_evaluates_to_built_list() {
    let mut engine = Engine::new();

    // The substituted template builds its list at run time.
    match engine.eval("a = 42\n`[x (a) z]", "test.sm").unwrap() {
        EvalResult::Value(value) => {
            let items: Vec<Value> = value.iter_list().cloned().collect();
            assert_eq!(items.len(), 3);
            assert!(matches!(items[1], Value::Int64(42)));
        }
        other => panic!("expected a value, got {:?}", other),
    }
}

#[test]
fn test_quotes_splice_evaluates_flattened() {
    let mut engine = Engine::new();

    match engine
        .eval("mid = `[1 2 3]\n`[a @(mid) b]", "test.sm")
        .unwrap()
    {
        EvalResult::Value(value) => {
            let items: Vec<Value> = value.iter_list().cloned().collect();
            assert_eq!(items.len(), 5);
            assert!(matches!(items[1], Value::Int64(1)));
            assert!(matches!(items[3], Value::Int64(3)));
        }
        other => panic!("expected a value, got {:?}", other),
    }
}
