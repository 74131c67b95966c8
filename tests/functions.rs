//! Function lowering: direct calls, trampolines, indirect calls,
//! builtins and the export surface.

mod support;

use support::*;
use tscript_wasm::ast::{BinaryOperator, Expression, Statement, TypeNode};
use tscript_wasm::compiler::Options;
use tscript_wasm::diagnostics::DiagnosticCode;
use tscript_wasm::module::NativeType;

fn add_body() -> Vec<Statement> {
    vec![Statement::ret(Some(Expression::binary(
        BinaryOperator::Add,
        Expression::ident("a"),
        Expression::ident("b"),
    )))]
}

#[test]
fn exported_add_lowers_to_a_single_i32_add() {
    let compiled = compile_one(vec![export_func(
        "add",
        vec![param("a", "i32"), param("b", "i32")],
        "i32",
        add_body(),
    )]);
    let function = &compiled.module.functions["src/add"];
    assert_eq!(function.params, vec![NativeType::I32, NativeType::I32]);
    assert_eq!(function.result, NativeType::I32);
    let body = body_text(&compiled, "src/add");
    assert!(
        body.contains("(i32.add (local.get 0) (local.get 1))"),
        "unexpected body: {body}"
    );
    assert!(compiled
        .module
        .function_exports
        .contains(&("add".into(), "src/add".into())));
}

#[test]
fn small_integer_returns_are_wrapped() {
    // export function f(): u8 { let x: u8 = 250; return x + 10 }
    let compiled = compile_one(vec![export_func(
        "f",
        vec![],
        "u8",
        vec![
            let_var("x", Some("u8"), Some(Expression::int(250))),
            Statement::ret(Some(Expression::binary(
                BinaryOperator::Add,
                Expression::ident("x"),
                Expression::int(10),
            ))),
        ],
    )]);
    let function = &compiled.module.functions["src/f"];
    assert_eq!(function.result, NativeType::I32);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(i32.and (i32.add (local.get 0) (i32.const 10)) (i32.const 255))"),
        "unexpected body: {body}"
    );
}

#[test]
fn omitted_optional_arguments_go_through_a_trampoline() {
    // function g(a: i32, b: i32 = 5): i32 { return a + b }; g(1)
    let compiled = compile_one(vec![
        func(
            "g",
            vec![param("a", "i32"), opt_param("b", "i32", Expression::int(5))],
            "i32",
            add_body(),
        ),
        export_func(
            "h",
            vec![],
            "i32",
            vec![Statement::ret(Some(Expression::call(
                Expression::ident("g"),
                vec![Expression::int(1)],
            )))],
        ),
    ]);
    let trampoline = &compiled.module.functions["src/g|trampoline"];
    assert_eq!(
        trampoline.params,
        vec![NativeType::I32, NativeType::I32, NativeType::I32]
    );
    assert_eq!(trampoline.result, NativeType::I32);
    let trampoline_body = body_text(&compiled, "src/g|trampoline");
    assert!(
        trampoline_body.contains("(local.set 1 (i32.const 5))"),
        "default initializer missing: {trampoline_body}"
    );
    assert!(
        trampoline_body.contains("(call $src/g (local.get 0) (local.get 1))"),
        "original call missing: {trampoline_body}"
    );
    let caller = body_text(&compiled, "src/h");
    assert!(
        caller.contains("(call $src/g|trampoline (i32.const 1) (i32.const 0) (i32.const 0))"),
        "unexpected call site: {caller}"
    );
}

#[test]
fn full_calls_bypass_the_trampoline() {
    let compiled = compile_one(vec![
        func(
            "g",
            vec![param("a", "i32"), opt_param("b", "i32", Expression::int(5))],
            "i32",
            add_body(),
        ),
        export_func(
            "h",
            vec![],
            "i32",
            vec![Statement::ret(Some(Expression::call(
                Expression::ident("g"),
                vec![Expression::int(1), Expression::int(2)],
            )))],
        ),
    ]);
    assert!(!compiled.module.functions.contains_key("src/g|trampoline"));
    let caller = body_text(&compiled, "src/h");
    assert!(caller.contains("(call $src/g (i32.const 1) (i32.const 2))"));
}

#[test]
fn shared_callees_are_compiled_once() {
    let call_g = |value: i64| {
        Statement::ret(Some(Expression::call(
            Expression::ident("g"),
            vec![Expression::int(value)],
        )))
    };
    let compiled = compile_one(vec![
        func(
            "g",
            vec![param("a", "i32")],
            "i32",
            vec![Statement::ret(Some(Expression::ident("a")))],
        ),
        export_func("f1", vec![], "i32", vec![call_g(1)]),
        export_func("f2", vec![], "i32", vec![call_g(2)]),
    ]);
    let instances = compiled
        .module
        .functions
        .keys()
        .filter(|k| k.as_str() == "src/g")
        .count();
    assert_eq!(instances, 1);
}

#[test]
fn generic_functions_compile_per_type_argument() {
    let mut id_decl = function_decl(
        "id",
        vec![param("value", "T")],
        "T",
        Some(vec![Statement::ret(Some(Expression::ident("value")))]),
        Default::default(),
    );
    id_decl.type_parameters.push("T".into());
    id_decl.return_type = Some(ty("T"));
    let call = |type_name: &str, argument: Expression| Expression::Call {
        callee: Box::new(Expression::ident("id")),
        type_arguments: vec![TypeNode::named(type_name)],
        arguments: vec![argument],
        range: Default::default(),
    };
    let compiled = compile_one(vec![
        Statement::Function(std::rc::Rc::new(id_decl)),
        export_func(
            "f",
            vec![],
            "f64",
            vec![
                Statement::expr(call("i32", Expression::int(1))),
                Statement::ret(Some(call("f64", Expression::float(1.5)))),
            ],
        ),
    ]);
    assert!(compiled.module.functions.contains_key("src/id<i32>"));
    assert!(compiled.module.functions.contains_key("src/id<f64>"));
}

#[test]
fn function_references_call_indirectly_through_the_table() {
    // let f = add; f(1, 2)
    let compiled = compile_one(vec![
        func(
            "add",
            vec![param("a", "i32"), param("b", "i32")],
            "i32",
            add_body(),
        ),
        export_func(
            "main",
            vec![],
            "i32",
            vec![
                let_var("f", None, Some(Expression::ident("add"))),
                Statement::ret(Some(Expression::call(
                    Expression::ident("f"),
                    vec![Expression::int(1), Expression::int(2)],
                ))),
            ],
        ),
    ]);
    assert_eq!(compiled.module.table, vec!["src/add".to_string()]);
    let body = body_text(&compiled, "src/main");
    assert!(
        body.contains("(call_indirect (type $ii_i) (i32.const 1) (i32.const 2) (local.get 0))"),
        "unexpected body: {body}"
    );
}

#[test]
fn taking_an_address_twice_reuses_the_table_index() {
    let compiled = compile_one(vec![
        func(
            "add",
            vec![param("a", "i32"), param("b", "i32")],
            "i32",
            add_body(),
        ),
        export_func(
            "main",
            vec![],
            "i32",
            vec![
                let_var("f", None, Some(Expression::ident("add"))),
                let_var("g", None, Some(Expression::ident("add"))),
                Statement::ret(Some(Expression::call(
                    Expression::ident("f"),
                    vec![Expression::int(1), Expression::int(2)],
                ))),
            ],
        ),
    ]);
    assert_eq!(compiled.module.table.len(), 1);
}

#[test]
fn arity_violations_are_reported() {
    let error = compile_err(vec![
        func(
            "g",
            vec![param("a", "i32")],
            "i32",
            vec![Statement::ret(Some(Expression::ident("a")))],
        ),
        export_func(
            "h",
            vec![],
            "i32",
            vec![Statement::ret(Some(Expression::call(
                Expression::ident("g"),
                vec![Expression::int(1), Expression::int(2)],
            )))],
        ),
    ]);
    assert!(has_diagnostic(&error, DiagnosticCode::ArityMismatch));
}

#[test]
fn bodiless_functions_become_imports() {
    let compiled = compile_one(vec![
        declare_func("log", vec![param("value", "i32")], "void"),
        export_func(
            "main",
            vec![],
            "void",
            vec![Statement::expr(Expression::call(
                Expression::ident("log"),
                vec![Expression::int(1)],
            ))],
        ),
    ]);
    let import = &compiled.module.function_imports["src/log"];
    assert_eq!(import.module, "env");
    assert_eq!(import.base, "log");
}

#[test]
fn assert_lowers_to_a_conditional_trap() {
    let body = vec![Statement::expr(Expression::call(
        Expression::ident("assert"),
        vec![Expression::ident("x")],
    ))];
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "void",
        body.clone(),
    )]);
    let text = body_text(&compiled, "src/f");
    assert!(
        text.contains("(if (i32.eqz (local.get 0)) (unreachable))"),
        "unexpected body: {text}"
    );

    let compiled = compile_with(
        vec![export_func("f", vec![param("x", "i32")], "void", body)],
        Options {
            no_assert: true,
            ..Options::default()
        },
    );
    let text = body_text(&compiled, "src/f");
    assert!(text.contains("(nop)"), "assert should be a no-op: {text}");
}

#[test]
fn sizeof_folds_to_the_byte_size() {
    let call = Expression::Call {
        callee: Box::new(Expression::ident("sizeof")),
        type_arguments: vec![TypeNode::named("f64")],
        arguments: vec![],
        range: Default::default(),
    };
    let compiled = compile_one(vec![export_func(
        "f",
        vec![],
        "usize",
        vec![Statement::ret(Some(call))],
    )]);
    let text = body_text(&compiled, "src/f");
    assert!(text.contains("(i32.const 8)"), "unexpected body: {text}");
}

#[test]
fn tree_shaking_skips_unexported_declarations() {
    let sources = || {
        vec![
            func("hidden", vec![], "i32", vec![Statement::ret(Some(Expression::int(1)))]),
            export_func("shown", vec![], "i32", vec![Statement::ret(Some(Expression::int(2)))]),
        ]
    };
    let compiled = compile_one(sources());
    assert!(!compiled.module.functions.contains_key("src/hidden"));
    assert!(compiled.module.functions.contains_key("src/shown"));

    let compiled = compile_with(
        sources(),
        Options {
            no_tree_shaking: true,
            ..Options::default()
        },
    );
    assert!(compiled.module.functions.contains_key("src/hidden"));
}
