use smile::{Engine, Value};

fn parsed(engine: &mut Engine, src: &str) -> String {
    let outcome = engine.parse(src, "test.sm");
    assert!(outcome.is_ok(), "parse of {:?} failed: {:?}", src, outcome.messages);
    engine.stringify(&outcome.expr)
}

fn parse_fails(engine: &mut Engine, src: &str) {
    let outcome = engine.parse(src, "test.sm");
    assert!(!outcome.is_ok(), "parse of {:?} should have failed", src);
}

fn declare(engine: &mut Engine, name: &str) {
    let symbol = engine.intern(name);
    engine.set_global_variable(symbol, Value::Null);
}

#[test]
fn test_parser_sequence_of_terms() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "12 12345 45 0x10 0x2B \"or not\" 0x2B"),
        "[$progn 12 12345 45 16 43 \"or not\" 43]"
    );
}

#[test]
fn test_parser_parens_have_no_meaning_in_a_sequence() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "12 ((12345)) (45) 0x10"),
        "[$progn 12 12345 45 16]"
    );
}

#[test]
fn test_parser_parens_allow_only_one_element() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "12 (12345 45 0x10) 43");
}

#[test]
fn test_parser_and_or_not() {
    let mut engine = Engine::new();
    declare(&mut engine, "gronk");
    declare(&mut engine, "foo");

    assert_eq!(
        parsed(&mut engine, "true and false and true and gronk"),
        "[$and true false true gronk]"
    );
    assert_eq!(
        parsed(&mut engine, "true or false or true or gronk"),
        "[$or true false true gronk]"
    );
    assert_eq!(
        parsed(&mut engine, "true or not false and true and foo or not not gronk"),
        "[$or true [$and [$not false] true foo] [$not [$not gronk]]]"
    );
    assert_eq!(
        parsed(&mut engine, "(true or not false) and true and (foo or not not gronk)"),
        "[$and [$or true [$not false]] true [$or foo [$not [$not gronk]]]]"
    );
}

#[test]
fn test_parser_comparisons() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(
            &mut engine,
            "1 < 10 and 0 == 0 and 15 >= 8 and 23 > 7 and 99 < 100 and 1 != 2"
        ),
        "[$and [(1 . <) 10] [(0 . ==) 0] [(15 . >=) 8] [(23 . >) 7] [(99 . <) 100] [(1 . !=) 2]]"
    );
}

#[test]
fn test_parser_special_comparisons() {
    let mut engine = Engine::new();
    declare(&mut engine, "Number");
    assert_eq!(
        parsed(&mut engine, "1 !== 10 and 0 === 0 and 15 is Number"),
        "[$and [$ne 1 10] [$eq 0 0] [$is 15 Number]]"
    );
}

#[test]
fn test_parser_plus_and_minus() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "12 + 34 \n 56 - 78 + 90"),
        "[$progn [(12 . +) 34] [([(56 . -) 78] . +) 90]]"
    );
}

#[test]
fn test_parser_star_and_slash() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "12 * 34 \n 56 / 78 * 90"),
        "[$progn [(12 . *) 34] [([(56 . /) 78] . *) 90]]"
    );
}

#[test]
fn test_parser_multiplication_binds_tighter_than_addition() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "56 + 78 * 90 \n 56 * 78 + 90"),
        "[$progn [(56 . +) [(78 . *) 90]] [([(56 . *) 78] . +) 90]]"
    );
}

#[test]
fn test_parser_addition_binds_tighter_than_comparison() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "1 + 2 * 3 > 3 + 2 * 1"),
        "[([(1 . +) [(2 . *) 3]] . >) [(3 . +) [(2 . *) 1]]]"
    );
}

#[test]
fn test_parser_arbitrary_binary_operators() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "12 plus 34"), "[(12 . plus) 34]");
    assert_eq!(
        parsed(&mut engine, "''foo'' with ''bar''"),
        "[(\"foo\" . with) \"bar\"]"
    );
    assert_eq!(
        parsed(&mut engine, "56 minus 78 minus 90"),
        "[([(56 . minus) 78] . minus) 90]"
    );
}

#[test]
fn test_parser_arbitrary_prefix_operators() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "minus 34"), "[(34 . minus)]");
    assert_eq!(
        parsed(&mut engine, "count html-encode reverse ''foo''"),
        "[([([(\"foo\" . reverse)] . html-encode)] . count)]"
    );
}

#[test]
fn test_parser_special_binary_operators_as_prefix() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "-34"), "[(34 . -)]");
    assert_eq!(
        parsed(&mut engine, "+ * / ''foo''"),
        "[([([(\"foo\" . /)] . *)] . +)]"
    );
}

#[test]
fn test_parser_mixed_binary_and_prefix() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "negative 34 times negative 97 plus 14"),
        "[([([(34 . negative)] . times) [(97 . negative)]] . plus) 14]"
    );
    assert_eq!(
        parsed(&mut engine, "sin -314 * cos +314"),
        "[([([(314 . -)] . sin)] . *) [([(314 . +)] . cos)]]"
    );
}

#[test]
fn test_parser_unary_operators_do_not_wrap_lines() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "sin -314 * cos +\n314 * tan 123");
}

#[test]
fn test_parser_unary_operators_wrap_inside_parens() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "(sin -314 * cos +\n314 * tan 123)"),
        "[([([([(314 . -)] . sin)] . *) [([(314 . +)] . cos)]] . *) [(123 . tan)]]"
    );
}

#[test]
fn test_parser_binary_operators_do_not_wrap_lines() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "sin -314 * cos +314 \n * tan 123"),
        "[$progn [([([(314 . -)] . sin)] . *) [([(314 . +)] . cos)]] [([(123 . tan)] . *)]]"
    );
}

#[test]
fn test_parser_binary_operators_wrap_inside_parens() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "(sin -314 * cos +314 \n * tan 123)"),
        "[([([([(314 . -)] . sin)] . *) [([(314 . +)] . cos)]] . *) [(123 . tan)]]"
    );
}

#[test]
fn test_parser_wrapping_propagates_into_functions() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "|x| sin -x * cos +x \n * tan 123"),
        "[$progn [$fn [x] [([([(x . -)] . sin)] . *) [([(x . +)] . cos)]]] [([(123 . tan)] . *)]]"
    );
}

#[test]
fn test_parser_fn_literals() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "|x| x"), "[$fn [x] x]");
    assert_eq!(parsed(&mut engine, "|| 123"), "[$fn null 123]");
    assert_eq!(
        parsed(&mut engine, "|w x y z| [w x y z]"),
        "[$fn [w x y z] [w x y z]]"
    );
    assert_eq!(
        parsed(&mut engine, "|w, x, y, z| [w x y z]"),
        "[$fn [w x y z] [w x y z]]"
    );
}

#[test]
fn test_parser_raw_fn_form() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "[$fn [e] 10 + 20]"),
        "[$fn [e] [(10 . +) 20]]"
    );
}

#[test]
fn test_parser_dot_chains() {
    let mut engine = Engine::new();
    declare(&mut engine, "a");
    assert_eq!(parsed(&mut engine, "a.b.c"), "((a . b) . c)");
}

#[test]
fn test_parser_index_and_range_and_cons() {
    let mut engine = Engine::new();
    declare(&mut engine, "a");
    assert_eq!(parsed(&mut engine, "a:1"), "[$index a 1]");
    assert_eq!(parsed(&mut engine, "a:1:2"), "[$index [$index a 1] 2]");
    assert_eq!(parsed(&mut engine, "1..5"), "[(1 . range) 5]");
    assert_eq!(
        parsed(&mut engine, "1 ## 2 ## 3"),
        "[(1 . ##) [(2 . ##) 3]]"
    );
}

#[test]
fn test_parser_assignments() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "x = 10"), "[$set x 10]");
    assert_eq!(parsed(&mut engine, "x += 5"), "[$opset + x 5]");
    assert_eq!(parsed(&mut engine, "x.p = 5"), "[$set (x . p) 5]");
    assert_eq!(parsed(&mut engine, "x:1 = 5"), "[$set [$index x 1] 5]");
}

#[test]
fn test_parser_object_literals() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, "new { }"), "[$new Object null]");
    assert_eq!(
        parsed(&mut engine, "new { x:10 y:20 z:5 + 7 }"),
        "[$new Object [[x 10] [y 20] [z [(5 . +) 7]]]]"
    );
    assert_eq!(
        parsed(&mut engine, "z = { x:10 y:20 }"),
        "[$set z [$new Object [[x 10] [y 20]]]]"
    );
    assert_eq!(
        parsed(&mut engine, "new { x:|x| x + 1 y:20 }"),
        "[$new Object [[x [$fn [x] [(x . +) 1]]] [y 20]]]"
    );
    assert_eq!(
        parsed(&mut engine, "new { x:10 y:(''Foo'':2) z:20 }"),
        "[$new Object [[x 10] [y [$index \"Foo\" 2]] [z 20]]]"
    );
}

#[test]
fn test_parser_object_literal_member_ambiguity_is_an_error() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "new { x:10 y:''Foo'':2 z:20 }");
}

#[test]
fn test_parser_new_with_base_chain() {
    let mut engine = Engine::new();
    declare(&mut engine, "SomeNamespace");
    assert_eq!(
        parsed(&mut engine, "new SomeNamespace.SomeClass.SomeNestedClass { }"),
        "[$new ((SomeNamespace . SomeClass) . SomeNestedClass) null]"
    );
}

#[test]
fn test_parser_undeclared_variable_is_an_error() {
    let mut engine = Engine::new();
    parse_fails(&mut engine, "bogus");
}

#[test]
fn test_parser_assignment_declares_the_name() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "counter = 1\ncounter + 1"),
        "[$progn [$set counter 1] [(counter . +) 1]]"
    );
}

#[test]
fn test_parser_dynamic_string_interpolation() {
    let mut engine = Engine::new();
    assert_eq!(
        parsed(&mut engine, "x = 1\n\"x is {x}!\""),
        "[$progn [$set x 1] [([(List . of) \"x is \" x \"!\"] . join)]]"
    );
}

#[test]
fn test_parser_empty_input() {
    let mut engine = Engine::new();
    assert_eq!(parsed(&mut engine, ""), "null");
}
