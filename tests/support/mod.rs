//! Fixture helpers standing in for the front end: tests construct
//! resolved sources by hand and feed them through the compiler.
#![allow(dead_code)]

use std::rc::Rc;

use tscript_wasm::ast::{
    DeclarationFlags, Expression, FunctionDeclaration, ParameterDeclaration, Range, Statement,
    TypeNode, VariableDeclaration, VariableStatement,
};
use tscript_wasm::compiler::{CompileError, CompiledModule, Compiler, Options};
use tscript_wasm::diagnostics::DiagnosticCode;
use tscript_wasm::program::Program;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ty(name: &str) -> TypeNode {
    TypeNode::named(name)
}

pub fn param(name: &str, type_name: &str) -> ParameterDeclaration {
    ParameterDeclaration {
        name: name.into(),
        type_annotation: ty(type_name),
        initializer: None,
        is_rest: false,
        range: Range::default(),
    }
}

pub fn opt_param(name: &str, type_name: &str, initializer: Expression) -> ParameterDeclaration {
    ParameterDeclaration {
        initializer: Some(initializer),
        ..param(name, type_name)
    }
}

pub fn function_decl(
    name: &str,
    parameters: Vec<ParameterDeclaration>,
    return_type: &str,
    body: Option<Vec<Statement>>,
    flags: DeclarationFlags,
) -> FunctionDeclaration {
    FunctionDeclaration {
        name: name.into(),
        type_parameters: Vec::new(),
        parameters,
        return_type: Some(ty(return_type)),
        body,
        flags,
        range: Range::default(),
    }
}

pub fn func(
    name: &str,
    parameters: Vec<ParameterDeclaration>,
    return_type: &str,
    body: Vec<Statement>,
) -> Statement {
    Statement::Function(Rc::new(function_decl(
        name,
        parameters,
        return_type,
        Some(body),
        DeclarationFlags::empty(),
    )))
}

pub fn export_func(
    name: &str,
    parameters: Vec<ParameterDeclaration>,
    return_type: &str,
    body: Vec<Statement>,
) -> Statement {
    Statement::Function(Rc::new(function_decl(
        name,
        parameters,
        return_type,
        Some(body),
        DeclarationFlags::EXPORT,
    )))
}

pub fn declare_func(name: &str, parameters: Vec<ParameterDeclaration>, return_type: &str) -> Statement {
    Statement::Function(Rc::new(function_decl(
        name,
        parameters,
        return_type,
        None,
        DeclarationFlags::DECLARE,
    )))
}

pub fn variable(
    name: &str,
    annotation: Option<&str>,
    initializer: Option<Expression>,
    flags: DeclarationFlags,
) -> Statement {
    Statement::Variable(VariableStatement {
        declarations: vec![VariableDeclaration {
            name: name.into(),
            type_annotation: annotation.map(ty),
            initializer,
            range: Range::default(),
        }],
        flags,
        range: Range::default(),
    })
}

pub fn let_var(name: &str, annotation: Option<&str>, initializer: Option<Expression>) -> Statement {
    variable(name, annotation, initializer, DeclarationFlags::LET)
}

pub fn const_var(name: &str, annotation: Option<&str>, initializer: Expression) -> Statement {
    variable(name, annotation, Some(initializer), DeclarationFlags::CONST)
}

pub fn compile_sources(
    sources: Vec<(&str, bool, Vec<Statement>)>,
    options: Options,
) -> Result<CompiledModule, CompileError> {
    init();
    let mut program = Program::new();
    for (path, is_entry, statements) in sources {
        program.add_source(path, is_entry, statements);
    }
    Compiler::compile(&mut program, options)
}

pub fn compile_one(statements: Vec<Statement>) -> CompiledModule {
    compile_with(statements, Options::default())
}

pub fn compile_with(statements: Vec<Statement>, options: Options) -> CompiledModule {
    compile_sources(vec![("src", true, statements)], options)
        .unwrap_or_else(|e| panic!("unexpected compile errors: {:#?}", e.diagnostics))
}

pub fn compile_err(statements: Vec<Statement>) -> CompileError {
    match compile_sources(vec![("src", true, statements)], Options::default()) {
        Ok(_) => panic!("expected compilation to report errors"),
        Err(error) => error,
    }
}

pub fn body_text(compiled: &CompiledModule, name: &str) -> String {
    let function = compiled.module.functions.get(name).unwrap_or_else(|| {
        panic!(
            "no function '{name}' in module; have {:?}",
            compiled.module.functions.keys().collect::<Vec<_>>()
        )
    });
    compiled.module.expr_to_string(function.body)
}

pub fn has_diagnostic(error: &CompileError, code: DiagnosticCode) -> bool {
    error.diagnostics.iter().any(|d| d.code == code)
}

pub fn has_warning(compiled: &CompiledModule, code: DiagnosticCode) -> bool {
    compiled.diagnostics.iter().any(|d| d.code == code)
}
