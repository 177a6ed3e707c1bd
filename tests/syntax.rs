use smile::{known, Engine, EvalResult, RepeatKind, Value};

fn parsed(engine: &mut Engine, src: &str) -> String {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    engine.stringify(&outcome.expr)
}

fn parse_fails(engine: &mut Engine, src: &str) {
    let outcome = engine.parse(src, "test.sm");
    assert!(!outcome.is_ok(), "parse of {:?} should have failed", src);
}

/// Statements of a parsed progn, stringified one by one (the head symbol
/// is element zero).
fn parsed_items(engine: &mut Engine, src: &str) -> Vec<String> {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    outcome
        .expr
        .iter_list()
        .map(|item| engine.stringify(item))
        .collect()
}

#[test]
fn test_syntax_decl_produces_a_rule_object() {
    let mut engine = Engine::new();
    let outcome = engine.parse("#syntax STMT: [a b c] => 123", "test.sm");
    assert!(outcome.is_ok(), "{:?}", outcome.messages);

    match &outcome.expr {
        Value::Syntax(rule) => {
            assert_eq!(rule.nonterminal, known::STMT);
            assert_eq!(engine.stringify(&rule.pattern), "[a b c]");
            assert_eq!(engine.stringify(&rule.replacement), "[$quote 123]");
        }
        other => panic!("expected a syntax object, got {:?}", other),
    }
}

#[test]
fn test_syntax_decl_with_nonterminal() {
    let mut engine = Engine::new();
    let outcome = engine.parse("#syntax STMT: [magic [EXPR x]] => [(x).* (x)]", "test.sm");
    assert!(outcome.is_ok(), "{:?}", outcome.messages);

    match &outcome.expr {
        Value::Syntax(rule) => {
            let elements: Vec<Value> = rule.pattern.iter_list().cloned().collect();
            assert_eq!(elements.len(), 2);
            match &elements[1] {
                Value::Nonterminal(nt) => {
                    assert_eq!(nt.nonterminal, known::EXPR);
                    assert_eq!(nt.repeat, RepeatKind::None);
                }
                other => panic!("expected a nonterminal element, got {:?}", other),
            }
            assert_eq!(
                engine.stringify(&rule.replacement),
                "[(List . of) [(List . of) [$quote $dot] x [$quote *]] x]"
            );
        }
        other => panic!("expected a syntax object, got {:?}", other),
    }
}

#[test]
fn test_syntax_simple_terminal_replacement() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [foo] => 123\n4 + 5\nfoo\n6 + 7",
    );
    assert_eq!(items[0], "$progn");
    assert_eq!(items[2], "[(4 . +) 5]");
    assert_eq!(items[3], "123");
    assert_eq!(items[4], "[(6 . +) 7]");
}

#[test]
fn test_syntax_multi_terminal_replacement() {
    let mut engine = Engine::new();
    let items = parsed_items(&mut engine, "#syntax STMT: [foo bar baz] => 123\nfoo bar baz");
    assert_eq!(items[2], "123");
}

#[test]
fn test_syntax_nonterminal_capture() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [foo [EXPR x] baz] => `[123 . + (x)]\nfoo 999 baz",
    );
    assert_eq!(items[2], "[(123 . +) 999]");
}

#[test]
fn test_syntax_nonterminal_captures_complex_expressions() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [foo [EXPR x] baz] => `[123 . + (x)]\nfoo 8 * 9 / 10 baz",
    );
    assert_eq!(items[2], "[(123 . +) [([(8 . *) 9] . /) 10]]");
}

#[test]
fn test_syntax_my_if_rule() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [my-if [EXPR x] then [STMT y]] => [$if (x) (y)]\nmy-if 1 < 2 then 10",
    );
    assert_eq!(items[2], "[$if [(1 . <) 2] 10]");
}

#[test]
fn test_syntax_my_if_evaluates() {
    let mut engine = Engine::new();
    match engine
        .eval(
            "#syntax STMT: [my-if [EXPR x] then [STMT y]] => `[$if (x) (y)]\nmy-if 1 < 2 then 10",
            "test.sm",
        )
        .unwrap()
    {
        EvalResult::Value(Value::Int64(n)) => assert_eq!(n, 10),
        other => panic!("expected 10, got {:?}", other),
    }
}

#[test]
fn test_syntax_without_rule_is_a_parse_error() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "my-if 1 < 2 then 10");
}

#[test]
fn test_syntax_repeated_nonterminal_with_separator() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [my-till [NAME+ x,] do [STMT y]] => `[got @@x]\nmy-till a, b, c do 5",
    );
    assert_eq!(items[2], "[got a b c]");
}

#[test]
fn test_syntax_optional_nonterminal() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [perhaps [EXPR? x] end] => `[wrapped (x)]\nperhaps end\nperhaps 9 end",
    );
    assert_eq!(items[2], "[wrapped null]");
    assert_eq!(items[3], "[wrapped 9]");
}

#[test]
fn test_syntax_longest_match_wins() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax STMT: [go] => 1\n#syntax STMT: [go faster] => 2\ngo faster\ngo",
    );
    assert_eq!(items[3], "2");
    assert_eq!(items[4], "1");
}

#[test]
fn test_syntax_left_recursive_extension() {
    let mut engine = Engine::new();
    let items = parsed_items(
        &mut engine,
        "#syntax CMPEXPR: [[ADDEXPR x] <=> [ADDEXPR y]] => `[compared (x) (y)]\n1 + 1 <=> 2",
    );
    assert_eq!(items[2], "[compared [(1 . +) 1] 2]");
}

#[test]
fn test_syntax_keyword_only_classes_reject_initial_nonterminals() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "#syntax STMT: [[EXPR x] bang] => 1");

    let mut engine = Engine::new();
    parse_fails(&mut engine, "#syntax EXPR: [[EXPR x] bang] => 1");
}

#[test]
fn test_syntax_left_recursion_must_match_the_class_shape() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "#syntax CMPEXPR: [[MULEXPR x] bang [ADDEXPR y]] => 1");
}

#[test]
fn test_syntax_left_recursion_cannot_shadow_builtin_operators() {
    // The terminal after the left-recursive nonterminal must not be one
    // of the operators the class already owns; such a rule would shadow
    // the built-in operator for the rest of the program.
    for source in [
        "#syntax CMPEXPR: [[ADDEXPR x] < [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] > [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] <= [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] >= [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] == [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] != [ADDEXPR y]] => 1",
        "#syntax CMPEXPR: [[ADDEXPR x] is [ADDEXPR y]] => 1",
        "#syntax ADDEXPR: [[MULEXPR x] + [MULEXPR y]] => 1",
        "#syntax ADDEXPR: [[MULEXPR x] - [MULEXPR y]] => 1",
        "#syntax MULEXPR: [[BINARYEXPR x] * [BINARYEXPR y]] => 1",
        "#syntax MULEXPR: [[BINARYEXPR x] / [BINARYEXPR y]] => 1",
    ] {
        let mut engine = Engine::new();
        parse_fails(&mut engine, source);
    }

    // The built-in operator still works afterwards.
    let mut engine = Engine::new();
    let outcome = engine.parse(
        "#syntax CMPEXPR: [[ADDEXPR x] < [ADDEXPR y]] => 1\n1 < 2",
        "test.sm",
    );
    assert!(!outcome.is_ok());
    assert_eq!(parsed(&mut engine, "1 < 2"), "[(1 . <) 2]");
}

#[test]
fn test_syntax_initial_nonterminal_must_be_mandatory() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "#syntax MY-CLASS: [[NAME? x] foo] => 1");

    let mut engine = Engine::new();
    parse_fails(&mut engine, "#syntax MY-CLASS: [[NAME* x] foo] => 1");
}

#[test]
fn test_syntax_duplicate_rules_are_rejected() {
    let mut engine = Engine::new();
    let outcome = engine.parse(
        "#syntax STMT: [dup rule] => 1\n#syntax STMT: [dup rule] => 2",
        "test.sm",
    );
    assert!(!outcome.is_ok());
}

#[test]
fn test_syntax_rules_are_scoped_copy_on_write() {
    let mut engine = Engine::new();

    // A rule declared inside a block works inside that block...
    let outcome = engine.parse("{\n#syntax STMT: [zoinks] => 99\nzoinks\n}", "test.sm");
    assert!(outcome.is_ok(), "{:?}", outcome.messages);

    // ...and is gone once the block's scope ends.
    parse_fails(&mut engine, "zoinks");
}

#[test]
fn test_syntax_rules_persist_at_top_level() {
    let mut engine = Engine::new();
    let outcome = engine.parse("#syntax STMT: [hello-rule] => 7", "test.sm");
    assert!(outcome.is_ok());

    assert_eq!(parsed(&mut engine, "hello-rule"), "7");
}

#[test]
fn test_syntax_captured_variables_do_not_leak() {
    let mut engine = Engine::new();
    let outcome = engine.parse(
        "#syntax STMT: [magic [EXPR x]] => `[m (x)]\nvar y = x",
        "test.sm",
    );
    assert!(!outcome.is_ok(), "the capture variable must not leak");
}
