//! Classes: `new` lowering, field layout, methods, accessors, operators
//! and inheritance.

mod support;

use std::rc::Rc;

use support::*;
use tscript_wasm::ast::{
    ClassDeclaration, ClassMember, DeclarationFlags, Expression, FieldDeclaration, Range,
    Statement, TypeNode,
};
use tscript_wasm::diagnostics::DiagnosticCode;

fn field(name: &str, type_name: &str, initializer: Option<Expression>) -> ClassMember {
    ClassMember::Field(FieldDeclaration {
        name: name.into(),
        type_annotation: TypeNode::named(type_name),
        initializer,
        flags: DeclarationFlags::empty(),
        range: Range::default(),
    })
}

fn method(
    name: &str,
    parameters: Vec<tscript_wasm::ast::ParameterDeclaration>,
    return_type: &str,
    body: Vec<Statement>,
    flags: DeclarationFlags,
) -> ClassMember {
    ClassMember::Method(function_decl(name, parameters, return_type, Some(body), flags))
}

fn class(name: &str, members: Vec<ClassMember>) -> Statement {
    Statement::Class(Rc::new(ClassDeclaration {
        name: name.into(),
        type_parameters: vec![],
        extends: None,
        members,
        flags: DeclarationFlags::empty(),
        range: Range::default(),
    }))
}

fn this_property(name: &str) -> Expression {
    Expression::property(Expression::This { range: Range::default() }, name)
}

fn allocator() -> Statement {
    declare_func("allocate_memory", vec![param("size", "usize")], "usize")
}

#[test]
fn new_allocates_initializes_and_constructs() {
    let point = class(
        "Point",
        vec![
            field("x", "i32", Some(Expression::int(1))),
            field("y", "i32", None),
            method(
                "constructor",
                vec![param("y", "i32")],
                "void",
                vec![Statement::expr(Expression::assign(
                    this_property("y"),
                    Expression::ident("y"),
                ))],
                DeclarationFlags::CONSTRUCTOR,
            ),
            method(
                "getX",
                vec![],
                "i32",
                vec![Statement::ret(Some(this_property("x")))],
                DeclarationFlags::empty(),
            ),
        ],
    );
    let compiled = compile_one(vec![
        allocator(),
        point,
        export_func(
            "make",
            vec![],
            "i32",
            vec![
                let_var(
                    "p",
                    None,
                    Some(Expression::New {
                        class: Box::new(Expression::ident("Point")),
                        type_arguments: vec![],
                        arguments: vec![Expression::int(2)],
                        range: Range::default(),
                    }),
                ),
                Statement::ret(Some(Expression::binary(
                    tscript_wasm::ast::BinaryOperator::Add,
                    Expression::call(Expression::property(Expression::ident("p"), "getX"), vec![]),
                    Expression::property(Expression::ident("p"), "y"),
                ))),
            ],
        ),
    ]);
    assert!(compiled.module.functions.contains_key("src/Point#constructor"));
    assert!(compiled.module.functions.contains_key("src/Point#getX"));
    let body = body_text(&compiled, "src/make");
    assert!(
        body.contains("(call $src/allocate_memory (i32.const 8))"),
        "allocation missing: {body}"
    );
    assert!(
        body.contains("(i32.store (local.get 0) (i32.const 1))"),
        "field initializer missing: {body}"
    );
    assert!(
        body.contains("(call $src/Point#constructor (local.get 0) (i32.const 2))"),
        "constructor call missing: {body}"
    );
    assert!(
        body.contains("(i32.load offset=4 (local.get 1))"),
        "field load missing: {body}"
    );
    assert!(
        body.contains("(call $src/Point#getX (local.get 1))"),
        "method call missing: {body}"
    );
    // The constructor stores through its receiver.
    let ctor = body_text(&compiled, "src/Point#constructor");
    assert!(
        ctor.contains("(i32.store offset=4 (local.get 0) (local.get 1))"),
        "ctor: {ctor}"
    );
}

#[test]
fn accessors_lower_to_getter_and_setter_calls() {
    let boxed = class(
        "Boxed",
        vec![
            field("_v", "i32", None),
            method(
                "v",
                vec![],
                "i32",
                vec![Statement::ret(Some(this_property("_v")))],
                DeclarationFlags::GET,
            ),
            method(
                "v",
                vec![param("value", "i32")],
                "void",
                vec![Statement::expr(Expression::assign(
                    this_property("_v"),
                    Expression::ident("value"),
                ))],
                DeclarationFlags::SET,
            ),
        ],
    );
    let compiled = compile_one(vec![
        allocator(),
        boxed,
        export_func(
            "f",
            vec![],
            "i32",
            vec![
                let_var(
                    "b",
                    None,
                    Some(Expression::New {
                        class: Box::new(Expression::ident("Boxed")),
                        type_arguments: vec![],
                        arguments: vec![],
                        range: Range::default(),
                    }),
                ),
                Statement::expr(Expression::assign(
                    Expression::property(Expression::ident("b"), "v"),
                    Expression::int(5),
                )),
                Statement::ret(Some(Expression::property(Expression::ident("b"), "v"))),
            ],
        ),
    ]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(call $src/Boxed#set:v (local.get 1) (i32.const 5))"),
        "setter call missing: {body}"
    );
    assert!(
        body.contains("(call $src/Boxed#get:v (local.get 1))"),
        "getter call missing: {body}"
    );
}

#[test]
fn assignment_in_value_position_calls_setter_then_getter() {
    let boxed = class(
        "Boxed",
        vec![
            field("_v", "i32", None),
            method(
                "v",
                vec![],
                "i32",
                vec![Statement::ret(Some(this_property("_v")))],
                DeclarationFlags::GET,
            ),
            method(
                "v",
                vec![param("value", "i32")],
                "void",
                vec![Statement::expr(Expression::assign(
                    this_property("_v"),
                    Expression::ident("value"),
                ))],
                DeclarationFlags::SET,
            ),
        ],
    );
    let compiled = compile_one(vec![
        allocator(),
        boxed,
        export_func(
            "f",
            vec![param("b", "Boxed")],
            "i32",
            vec![Statement::ret(Some(Expression::assign(
                Expression::property(Expression::ident("b"), "v"),
                Expression::int(5),
            )))],
        ),
    ]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains(
            "(block (call $src/Boxed#set:v (local.get 0) (i32.const 5)) \
             (call $src/Boxed#get:v (local.get 0)))"
        ),
        "tee form missing: {body}"
    );
}

#[test]
fn indexed_operators_drive_element_access() {
    let buffer = class(
        "Buf",
        vec![
            method(
                "[]",
                vec![param("i", "i32")],
                "i32",
                vec![Statement::ret(Some(Expression::ident("i")))],
                DeclarationFlags::empty(),
            ),
            method(
                "[]=",
                vec![param("i", "i32"), param("v", "i32")],
                "void",
                vec![Statement::Empty { range: Range::default() }],
                DeclarationFlags::empty(),
            ),
        ],
    );
    let compiled = compile_one(vec![
        allocator(),
        buffer,
        export_func(
            "f",
            vec![param("b", "Buf")],
            "i32",
            vec![
                Statement::expr(Expression::assign(
                    Expression::ElementAccess {
                        target: Box::new(Expression::ident("b")),
                        index: Box::new(Expression::int(1)),
                        range: Range::default(),
                    },
                    Expression::int(2),
                )),
                Statement::ret(Some(Expression::ElementAccess {
                    target: Box::new(Expression::ident("b")),
                    index: Box::new(Expression::int(3)),
                    range: Range::default(),
                })),
            ],
        ),
    ]);
    let body = body_text(&compiled, "src/f");
    assert!(
        body.contains("(call $src/Buf#[]= (local.get 0) (i32.const 1) (i32.const 2))"),
        "indexed set missing: {body}"
    );
    assert!(
        body.contains("(call $src/Buf#[] (local.get 0) (i32.const 3))"),
        "indexed get missing: {body}"
    );
}

#[test]
fn readonly_fields_reject_assignment() {
    let holder = Statement::Class(Rc::new(ClassDeclaration {
        name: "Holder".into(),
        type_parameters: vec![],
        extends: None,
        members: vec![ClassMember::Field(FieldDeclaration {
            name: "id".into(),
            type_annotation: TypeNode::named("i32"),
            initializer: None,
            flags: DeclarationFlags::READONLY,
            range: Range::default(),
        })],
        flags: DeclarationFlags::empty(),
        range: Range::default(),
    }));
    let error = compile_err(vec![
        allocator(),
        holder,
        export_func(
            "f",
            vec![param("h", "Holder")],
            "void",
            vec![Statement::expr(Expression::assign(
                Expression::property(Expression::ident("h"), "id"),
                Expression::int(1),
            ))],
        ),
    ]);
    assert!(has_diagnostic(&error, DiagnosticCode::ReadonlyAssignment));
}

#[test]
fn missing_setter_is_reported() {
    let boxed = class(
        "Boxed",
        vec![
            field("_v", "i32", None),
            method(
                "v",
                vec![],
                "i32",
                vec![Statement::ret(Some(this_property("_v")))],
                DeclarationFlags::GET,
            ),
        ],
    );
    let error = compile_err(vec![
        allocator(),
        boxed,
        export_func(
            "f",
            vec![param("b", "Boxed")],
            "void",
            vec![Statement::expr(Expression::assign(
                Expression::property(Expression::ident("b"), "v"),
                Expression::int(5),
            ))],
        ),
    ]);
    assert!(has_diagnostic(&error, DiagnosticCode::PropertyWithoutSetter));
}

#[test]
fn derived_classes_extend_the_base_layout() {
    let base = class("A", vec![field("a", "i32", None)]);
    let derived = Statement::Class(Rc::new(ClassDeclaration {
        name: "B".into(),
        type_parameters: vec![],
        extends: Some(TypeNode::named("A")),
        members: vec![field("b", "i32", None)],
        flags: DeclarationFlags::empty(),
        range: Range::default(),
    }));
    let compiled = compile_one(vec![
        allocator(),
        base,
        derived,
        func(
            "first",
            vec![param("p", "A")],
            "i32",
            vec![Statement::ret(Some(Expression::property(
                Expression::ident("p"),
                "a",
            )))],
        ),
        export_func(
            "f",
            vec![param("x", "B")],
            "i32",
            vec![Statement::ret(Some(Expression::binary(
                tscript_wasm::ast::BinaryOperator::Add,
                Expression::call(Expression::ident("first"), vec![Expression::ident("x")]),
                Expression::property(Expression::ident("x"), "b"),
            )))],
        ),
    ]);
    let body = body_text(&compiled, "src/f");
    // The inherited field sits before the derived one.
    assert!(
        body.contains("(i32.load offset=4 (local.get 0))"),
        "derived field offset: {body}"
    );
    assert!(
        body.contains("(call $src/first (local.get 0))"),
        "upcast argument: {body}"
    );
}
