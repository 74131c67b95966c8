//! Static memory layout: string interning, array segments, HEAP_BASE and
//! the memory-related options.

mod support;

use support::*;
use tscript_wasm::ast::{Expression, Statement, TypeNode};
use tscript_wasm::compiler::Options;
use tscript_wasm::diagnostics::DiagnosticCode;
use tscript_wasm::module::{Expr, NativeType};
use tscript_wasm::Target;

fn return_string(name: &str, value: &str) -> Statement {
    export_func(
        name,
        vec![],
        "usize",
        vec![Statement::ret(Some(Expression::string(value)))],
    )
}

#[test]
fn identical_string_literals_share_one_segment() {
    let compiled = compile_sources(
        vec![
            ("a", true, vec![return_string("fa", "hello")]),
            ("b", true, vec![return_string("fb", "hello")]),
        ],
        Options::default(),
    )
    .expect("compiles cleanly");
    let memory = compiled.module.memory.as_ref().expect("memory is set up");
    assert_eq!(memory.segments.len(), 1);
    let segment = &memory.segments[0];
    assert_eq!(segment.offset, 4);
    // 4-byte little-endian length prefix, then UTF-16 code units.
    assert_eq!(segment.data.len(), 4 + 2 * 5);
    assert_eq!(&segment.data[..4], &5u32.to_le_bytes());
    assert_eq!(&segment.data[4..6], &(b'h' as u16).to_le_bytes());
    for name in ["a/fa", "b/fb"] {
        let body = body_text(&compiled, name);
        assert!(body.contains("(i32.const 4)"), "body of {name}: {body}");
    }
}

#[test]
fn segments_are_aligned_and_monotonic() {
    let compiled = compile_one(vec![return_string("f1", "a"), return_string("f2", "b")]);
    let memory = compiled.module.memory.as_ref().expect("memory is set up");
    assert_eq!(memory.segments.len(), 2);
    assert_eq!(memory.segments[0].offset, 4);
    // 4 + 6 bytes = 10, aligned up to the next 4-byte boundary.
    assert_eq!(memory.segments[1].offset, 12);
    assert!(memory.segments[0].offset < memory.segments[1].offset);
}

#[test]
fn heap_base_is_aligned_to_pointer_width() {
    let compiled = compile_one(vec![return_string("f", "a")]);
    let heap_base = &compiled.module.globals["HEAP_BASE"];
    assert!(!heap_base.mutable);
    assert_eq!(heap_base.ty, NativeType::I32);
    match compiled.module.expr(heap_base.init) {
        Expr::I32Const(value) => assert_eq!(value % 4, 0),
        other => panic!("HEAP_BASE must be a literal constant, got {other:?}"),
    }
    assert!(compiled
        .module
        .global_exports
        .contains(&("HEAP_BASE".into(), "HEAP_BASE".into())));
    let memory = compiled.module.memory.as_ref().unwrap();
    assert_eq!(memory.initial, 1);
    assert_eq!(memory.export_name.as_deref(), Some("memory"));
}

#[test]
fn memory_base_offsets_static_data() {
    let compiled = compile_with(
        vec![return_string("f", "x")],
        Options {
            memory_base: 1024,
            ..Options::default()
        },
    );
    let memory = compiled.module.memory.as_ref().unwrap();
    assert_eq!(memory.segments[0].offset, 1024);
}

#[test]
fn memory_can_be_imported_or_omitted() {
    let compiled = compile_with(
        vec![return_string("f", "x")],
        Options {
            import_memory: true,
            ..Options::default()
        },
    );
    assert_eq!(
        compiled.module.memory_import,
        Some(("env".into(), "memory".into()))
    );

    let compiled = compile_with(
        vec![return_string("f", "x")],
        Options {
            no_memory: true,
            ..Options::default()
        },
    );
    assert!(compiled.module.memory.is_none());
    assert!(compiled.module.globals.contains_key("HEAP_BASE"));
}

#[test]
fn wasm64_widens_pointers_and_heap_base() {
    let sizeof_usize = Expression::Call {
        callee: Box::new(Expression::ident("sizeof")),
        type_arguments: vec![TypeNode::named("usize")],
        arguments: vec![],
        range: Default::default(),
    };
    let compiled = compile_with(
        vec![export_func(
            "f",
            vec![],
            "usize",
            vec![Statement::ret(Some(sizeof_usize))],
        )],
        Options {
            target: Target::Wasm64,
            ..Options::default()
        },
    );
    assert_eq!(compiled.module.globals["HEAP_BASE"].ty, NativeType::I64);
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(i64.const 8)"), "body: {body}");
}

#[test]
fn constant_array_literals_become_static_segments() {
    let array_class = tscript_wasm::ast::ClassDeclaration {
        name: "Arr".into(),
        type_parameters: vec!["T".into()],
        extends: None,
        members: vec![],
        flags: Default::default(),
        range: Default::default(),
    };
    let compiled = compile_one(vec![
        Statement::Class(std::rc::Rc::new(array_class)),
        Statement::Function(std::rc::Rc::new(tscript_wasm::ast::FunctionDeclaration {
            name: "f".into(),
            type_parameters: vec![],
            parameters: vec![],
            return_type: Some(TypeNode::with_arguments("Arr", vec![TypeNode::named("i32")])),
            body: Some(vec![Statement::ret(Some(Expression::ArrayLiteral {
                elements: vec![Expression::int(1), Expression::int(2), Expression::int(3)],
                range: Default::default(),
            }))]),
            flags: tscript_wasm::ast::DeclarationFlags::EXPORT,
            range: Default::default(),
        })),
    ]);
    let memory = compiled.module.memory.as_ref().unwrap();
    assert_eq!(memory.segments.len(), 1);
    assert_eq!(memory.segments[0].offset, 4);
    assert_eq!(
        memory.segments[0].data,
        vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]
    );
    let body = body_text(&compiled, "src/f");
    assert!(body.contains("(i32.const 4)"), "body: {body}");
}

#[test]
fn dynamic_array_literals_warn_and_fall_back() {
    let array_class = tscript_wasm::ast::ClassDeclaration {
        name: "Arr".into(),
        type_parameters: vec!["T".into()],
        extends: None,
        members: vec![],
        flags: Default::default(),
        range: Default::default(),
    };
    let compiled = compile_one(vec![
        Statement::Class(std::rc::Rc::new(array_class)),
        declare_func("seed", vec![], "i32"),
        Statement::Function(std::rc::Rc::new(tscript_wasm::ast::FunctionDeclaration {
            name: "f".into(),
            type_parameters: vec![],
            parameters: vec![],
            return_type: Some(TypeNode::with_arguments("Arr", vec![TypeNode::named("i32")])),
            body: Some(vec![Statement::ret(Some(Expression::ArrayLiteral {
                elements: vec![
                    Expression::int(1),
                    Expression::call(Expression::ident("seed"), vec![]),
                ],
                range: Default::default(),
            }))]),
            flags: tscript_wasm::ast::DeclarationFlags::EXPORT,
            range: Default::default(),
        })),
    ]);
    assert!(has_warning(
        &compiled,
        DiagnosticCode::NonConstantArrayLiteral
    ));
}
