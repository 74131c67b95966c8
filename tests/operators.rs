//! Operator lowering: logical short-circuits, ternaries, compound
//! assignment, increments and the signedness-sensitive opcode families.

mod support;

use support::*;
use tscript_wasm::ast::{BinaryOperator, Expression, Range, Statement, UnaryOperator};
use tscript_wasm::diagnostics::DiagnosticCode;

fn ret(expression: Expression) -> Statement {
    Statement::ret(Some(expression))
}

#[test]
fn logical_and_clones_a_side_effect_free_left_operand() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "i32"), param("b", "i32")],
        "i32",
        vec![ret(Expression::binary(
            BinaryOperator::LogicalAnd,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(if (local.get 0) (local.get 1) (local.get 0))"),
        "body: {body}"
    );
}

#[test]
fn logical_or_preserves_the_left_value_in_the_taken_arm() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "i32"), param("b", "i32")],
        "i32",
        vec![ret(Expression::binary(
            BinaryOperator::LogicalOr,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(if (local.get 0) (local.get 0) (local.get 1))"),
        "body: {body}"
    );
}

#[test]
fn logical_operands_with_side_effects_are_teed() {
    let compiled = compile_one(vec![
        func("g", vec![], "i32", vec![ret(Expression::int(1))]),
        export_func(
            "f",
            vec![param("b", "i32")],
            "i32",
            vec![ret(Expression::binary(
                BinaryOperator::LogicalAnd,
                Expression::call(Expression::ident("g"), vec![]),
                Expression::ident("b"),
            ))],
        ),
    ]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(if (local.tee 1 (call $src/g)) (local.get 0) (local.get 1))"),
        "body: {body}"
    );
}

#[test]
fn ternaries_unify_their_arm_types() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("c", "i32")],
        "f64",
        vec![ret(Expression::Ternary {
            condition: Box::new(Expression::ident("c")),
            if_then: Box::new(Expression::float(1.5)),
            if_else: Box::new(Expression::int(2)),
            range: Range::default(),
        })],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(if (local.get 0) (f64.const 1.5) (f64.convert_i32_s (i32.const 2)))"),
        "body: {body}"
    );
}

#[test]
fn unsigned_types_select_unsigned_opcodes() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "u32"), param("b", "u32")],
        "bool",
        vec![ret(Expression::binary(
            BinaryOperator::Lt,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(i32.lt_u"), "body: {body}");

    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "u32"), param("b", "u32")],
        "u32",
        vec![ret(Expression::binary(
            BinaryOperator::Div,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(i32.div_u"), "body: {body}");
}

#[test]
fn shifts_take_the_left_operands_type() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "i64"), param("b", "i32")],
        "i64",
        vec![ret(Expression::binary(
            BinaryOperator::Shl,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(i64.shl (local.get 0) (i64.extend_i32_s (local.get 1)))"),
        "body: {body}"
    );

    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("a", "u32"), param("b", "i32")],
        "u32",
        vec![ret(Expression::binary(
            BinaryOperator::Shr,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(i32.shr_u"), "body: {body}");
}

#[test]
fn float_modulo_is_refused() {
    let error = compile_err(vec![export_func(
        "f",
        vec![param("a", "f64"), param("b", "f64")],
        "f64",
        vec![ret(Expression::binary(
            BinaryOperator::Rem,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::ModuloOnFloats));
}

#[test]
fn mixed_incompatible_operands_are_reported() {
    let error = compile_err(vec![export_func(
        "f",
        vec![param("a", "i64"), param("b", "u64")],
        "i64",
        vec![ret(Expression::binary(
            BinaryOperator::Add,
            Expression::ident("a"),
            Expression::ident("b"),
        ))],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::OperatorCannotBeApplied));
}

#[test]
fn compound_assignment_wraps_small_results() {
    // x += 10 on a u8 local normalizes before the store-back.
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "u8")],
        "u8",
        vec![
            Statement::expr(Expression::compound_assign(
                BinaryOperator::Add,
                Expression::ident("x"),
                Expression::int(10),
            )),
            ret(Expression::ident("x")),
        ],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains(
            "(local.set 0 (i32.and (i32.add (local.get 0) (i32.const 10)) (i32.const 255)))"
        ),
        "body: {body}"
    );
}

#[test]
fn postfix_increment_yields_the_previous_value() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "i32",
        vec![ret(Expression::UnaryPostfix {
            operator: UnaryOperator::Increment,
            operand: Box::new(Expression::ident("x")),
            range: Range::default(),
        })],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains(
            "(block (local.set 0 (i32.add (local.tee 1 (local.get 0)) (i32.const 1))) \
             (local.get 1))"
        ),
        "body: {body}"
    );
}

#[test]
fn prefix_increment_in_statement_position_sets_without_tee() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "void",
        vec![Statement::expr(Expression::unary(
            UnaryOperator::Increment,
            Expression::ident("x"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(local.set 0 (i32.add (local.get 0) (i32.const 1)))"),
        "body: {body}"
    );
}

#[test]
fn negated_literals_fold_at_the_minus_site() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![],
        "i64",
        vec![ret(Expression::unary(
            UnaryOperator::Minus,
            Expression::IntegerLiteral {
                value: i64::MIN,
                range: Range::default(),
            },
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    // -(i64::MIN) wraps back to i64::MIN, which stays representable.
    assert!(
        body.contains("(i64.const -9223372036854775808)"),
        "body: {body}"
    );
}

#[test]
fn logical_not_produces_bool() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i64")],
        "bool",
        vec![ret(Expression::unary(
            UnaryOperator::Not,
            Expression::ident("x"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(i32.eqz (i64.ne (local.get 0) (i64.const 0)))"),
        "body: {body}"
    );
}

#[test]
fn bitwise_not_wraps_small_types() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "u8")],
        "u8",
        vec![ret(Expression::unary(
            UnaryOperator::BitwiseNot,
            Expression::ident("x"),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(i32.and (i32.xor (local.get 0) (i32.const -1)) (i32.const 255))"),
        "body: {body}"
    );
}

#[test]
fn assignments_tee_when_their_value_is_consumed() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "i32")],
        "i32",
        vec![ret(Expression::assign(
            Expression::ident("x"),
            Expression::int(3),
        ))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(local.tee 0 (i32.const 3))"),
        "body: {body}"
    );
}

#[test]
fn assigning_to_a_constant_is_an_error() {
    let error = compile_err(vec![export_func(
        "f",
        vec![],
        "void",
        vec![
            const_var("k", None, Expression::int(1)),
            Statement::expr(Expression::assign(
                Expression::ident("k"),
                Expression::int(2),
            )),
        ],
    )]);
    assert!(has_diagnostic(&error, DiagnosticCode::CannotAssignToConstant));
}

#[test]
fn int_to_float_conversion_uses_source_signedness() {
    let compiled = compile_one(vec![export_func(
        "f",
        vec![param("x", "u32")],
        "f64",
        vec![ret(Expression::ident("x"))],
    )]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(f64.convert_i32_u (local.get 0))"),
        "body: {body}"
    );
}
