//! Control flow: the return analyzer, loop labels, switch lowering and
//! the refused constructs.

mod support;

use support::*;
use tscript_wasm::ast::{
    BinaryOperator, Expression, Range, Statement, SwitchCase,
};
use tscript_wasm::diagnostics::DiagnosticCode;

fn returning(value: i64) -> Statement {
    Statement::ret(Some(Expression::int(value)))
}

fn if_stmt(condition: Expression, then: Statement, otherwise: Option<Statement>) -> Statement {
    Statement::If {
        condition,
        if_true: Box::new(then),
        if_false: otherwise.map(Box::new),
        range: Range::default(),
    }
}

#[test]
fn both_arms_returning_satisfies_the_analyzer() {
    compile_one(vec![export_func(
        "f",
        vec![param("c", "i32")],
        "i32",
        vec![if_stmt(
            Expression::ident("c"),
            returning(1),
            Some(returning(2)),
        )],
    )]);
}

#[test]
fn one_sided_if_does_not_prove_returns() {
    let error = compile_err(vec![export_func(
        "f",
        vec![param("c", "i32")],
        "i32",
        vec![if_stmt(Expression::ident("c"), returning(1), None)],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::FunctionMustReturn));
}

#[test]
fn while_never_propagates_returns() {
    // Even a constant-true condition does not count; the asymmetry with
    // `for` is deliberate.
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "i32",
        vec![Statement::While {
            condition: Expression::int(1),
            body: Box::new(returning(1)),
            range: Range::default(),
        }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::FunctionMustReturn));
}

#[test]
fn do_while_propagates_returns() {
    compile_one(vec![export_func(
        "f",
        vec![],
        "i32",
        vec![Statement::Do {
            body: Box::new(returning(1)),
            condition: Expression::int(0),
            range: Range::default(),
        }],
    )]);
}

#[test]
fn condition_free_for_loops_prove_returns_and_hint_unreachable() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![],
        "i32",
        vec![Statement::For {
            initializer: None,
            condition: None,
            incrementor: None,
            body: Box::new(returning(1)),
            range: Range::default(),
        }],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.ends_with("(unreachable))"), "missing hint: {body}");
}

#[test]
fn loops_emit_break_and_continue_labels() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("c", "i32")],
        "void",
        vec![Statement::While {
            condition: Expression::ident("c"),
            body: Box::new(Statement::block(vec![
                if_stmt(
                    Expression::ident("c"),
                    Statement::Continue { label: None, range: Range::default() },
                    None,
                ),
                Statement::Break { label: None, range: Range::default() },
            ])),
            range: Range::default(),
        }],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(loop $continue|0"), "body: {body}");
    assert!(body.contains("(block $break|0"), "body: {body}");
    assert!(body.contains("(br $continue|0)"), "body: {body}");
    assert!(body.contains("(br $break|0)"), "body: {body}");
}

#[test]
fn break_outside_a_loop_is_an_error() {
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "void",
        vec![Statement::Break { label: None, range: Range::default() }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::BreakOutsideLoop));
}

#[test]
fn labeled_break_is_refused() {
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "void",
        vec![Statement::While {
            condition: Expression::int(1),
            body: Box::new(Statement::Break {
                label: Some("outer".into()),
                range: Range::default(),
            }),
            range: Range::default(),
        }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::LabelsNotSupported));
}

#[test]
fn try_and_interfaces_are_refused() {
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "void",
        vec![Statement::Try { range: Range::default() }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::OperationNotSupported));

    let error = compile_err(vec![Statement::Interface {
        name: "I".into(),
        range: Range::default(),
    }]);
    assert!(has_diagnostic(&error, DiagnosticCode::OperationNotSupported));
}

#[test]
fn throw_counts_as_a_terminating_path() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("c", "i32")],
        "i32",
        vec![if_stmt(
            Expression::ident("c"),
            returning(1),
            Some(Statement::Throw {
                value: Expression::int(0),
                range: Range::default(),
            }),
        )],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(unreachable)"), "body: {body}");
}

fn case(label: Option<Expression>, statements: Vec<Statement>) -> SwitchCase {
    SwitchCase { label, statements, range: Range::default() }
}

#[test]
fn switch_with_default_and_returning_cases_proves_returns() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "i32",
        vec![Statement::Switch {
            condition: Expression::ident("x"),
            cases: vec![
                case(Some(Expression::int(0)), vec![returning(10)]),
                case(None, vec![returning(20)]),
            ],
            range: Range::default(),
        }],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(block $case0|0"), "body: {body}");
    assert!(body.contains("(block $case1|0"), "body: {body}");
    assert!(body.contains("(block $break|0"), "body: {body}");
    assert!(
        body.contains("(br_if $case0|0 (i32.eq (local.get 1) (i32.const 0)))"),
        "selector missing: {body}"
    );
}

#[test]
fn switch_with_breaking_case_does_not_prove_returns() {
    let error = compile_err(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "i32",
        vec![Statement::Switch {
            condition: Expression::ident("x"),
            cases: vec![
                case(
                    Some(Expression::int(0)),
                    vec![Statement::Break { label: None, range: Range::default() }],
                ),
                case(None, vec![returning(20)]),
            ],
            range: Range::default(),
        }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::FunctionMustReturn));
}

#[test]
fn switch_without_default_does_not_prove_returns() {
    let error = compile_err(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "i32",
        vec![Statement::Switch {
            condition: Expression::ident("x"),
            cases: vec![case(Some(Expression::int(0)), vec![returning(1)])],
            range: Range::default(),
        }],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::FunctionMustReturn));
}

#[test]
fn const_locals_fold_into_virtual_locals() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![],
        "i32",
        vec![
            const_var("k", None, Expression::int(5)),
            Statement::ret(Some(Expression::binary(
                BinaryOperator::Mul,
                Expression::ident("k"),
                Expression::ident("k"),
            ))),
        ],
    )]);
    let function = &compiled.module.functions["src/f"];
    assert!(function.locals.is_empty(), "virtual locals take no slot");
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(i32.mul (i32.const 5) (i32.const 5))"),
        "body: {body}"
    );
}

#[test]
fn duplicate_locals_in_one_scope_are_rejected() {
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "void",
        vec![
            let_var("x", Some("i32"), Some(Expression::int(1))),
            let_var("x", Some("i32"), Some(Expression::int(2))),
        ],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::DuplicateName));
}

#[test]
fn block_scopes_allow_shadowing_in_nested_blocks() {
    compile_one(vec![export_func(
        "f",
        vec![],
        "void",
        vec![
            let_var("x", Some("i32"), Some(Expression::int(1))),
            Statement::block(vec![let_var("x", Some("i64"), Some(Expression::int(2)))]),
        ],
    )]);
}
