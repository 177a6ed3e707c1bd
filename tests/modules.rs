use smile::{Engine, EvalResult, Value};

#[test]
fn test_modules_load_and_evaluate() {
    let mut engine = Engine::new();

    let module = engine.load_module("greeter", "greeting = \"hello\"\ngreeting", &[]);
    assert!(module.ok, "{:?}", module.messages);
    assert_eq!(module.name.as_str(), "greeter");
    assert_eq!(
        engine.stringify(&module.expression),
        "[$progn [$set greeting \"hello\"] greeting]"
    );

    // The host installs the module by evaluating its expression in the
    // global closure.
    let program = engine
        .compile(&module.expression, "<module greeter>")
        .expect("module compiles");
    match engine.run_program(program) {
        EvalResult::Value(Value::Str(s)) => assert_eq!(s.as_str(), "hello"),
        other => panic!("expected the module's value, got {:?}", other),
    }

    let greeting = engine.intern("greeting");
    assert_eq!(
        engine.get_global_variable(greeting),
        Some(Value::Str("hello".into()))
    );
}

#[test]
fn test_modules_see_their_extern_declarations() {
    let mut engine = Engine::new();

    // Without the extern declaration, the name is unresolved.
    let module = engine.load_module("uses-host", "1 + host-value", &[]);
    assert!(!module.ok);

    let module = engine.load_module("uses-host", "1 + host-value", &["host-value"]);
    assert!(module.ok, "{:?}", module.messages);
}

#[test]
fn test_modules_report_parse_errors() {
    let mut engine = Engine::new();
    let module = engine.load_module("broken", "1 +", &[]);
    assert!(!module.ok);
    assert!(!module.messages.is_empty());
}

#[test]
fn test_modules_do_not_leak_declarations() {
    let mut engine = Engine::new();

    let module = engine.load_module("leaky", "#syntax STMT: [sneak] => 1\nsneak", &[]);
    assert!(module.ok, "{:?}", module.messages);

    // Neither the module's syntax rule nor its globals affect the
    // engine's own parses.
    let outcome = engine.parse("sneak", "test.sm");
    assert!(!outcome.is_ok());
}
