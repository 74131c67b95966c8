//! The lowering engine.
//!
//! The driver walks entry sources (or, in exhaustive mode, everything),
//! lowers declarations into module-level items and function bodies, and
//! finalizes static memory, the function table and the synthetic start
//! function. Statement and expression lowering live in the sibling
//! modules and attach to the same [`Compiler`] through separate `impl`
//! blocks, mirroring how a translator is split from its section walker.

mod conversions;
mod expressions;
mod flow;
mod statements;
mod trampolines;

use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use thiserror::Error;

pub use flow::{Flow, FlowFlags, ScopedLocal};

use crate::ast::{Range, Statement};
use crate::diagnostics::{
    DiagnosticCategory, DiagnosticCode, DiagnosticMessage, Diagnostics,
};
use crate::module::{
    ExprRef, IrConstant, MemorySegment, Module, NativeType,
};
use crate::program::{
    ConstantValue, ElementData, ElementFlags, ElementId, Local, Program,
};
use crate::types::{Signature, Target, Type};

/// How an expression result is reconciled with its contextual type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionKind {
    /// Retain the expression's own type; the context is only a hint.
    None,
    /// Convert, checking assignability and reporting when it fails.
    Implicit,
    /// Convert unconditionally (an explicit cast).
    Explicit,
}

/// Recognized compiler options.
#[derive(Clone, Debug)]
pub struct Options {
    pub target: Target,
    /// Compile every declaration rather than only reachable ones.
    pub no_tree_shaking: bool,
    /// Replace assertions with no-ops.
    pub no_assert: bool,
    /// Do not set up a default memory section.
    pub no_memory: bool,
    /// Import memory from `env.memory` instead of defining it.
    pub import_memory: bool,
    /// Start offset for static memory; defaults past the null page slot.
    pub memory_base: u32,
    /// Name of the allocator builtin used by `new`.
    pub allocate_impl: String,
    /// Name of the free builtin.
    pub free_impl: String,
    /// Record per-expression source ranges.
    pub source_map: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            target: Target::Wasm32,
            no_tree_shaking: false,
            no_assert: false,
            no_memory: false,
            import_memory: false,
            memory_base: 0,
            allocate_impl: "allocate_memory".into(),
            free_impl: "free_memory".into(),
            source_map: false,
        }
    }
}

/// A successfully produced module together with non-fatal diagnostics.
#[derive(Debug)]
pub struct CompiledModule {
    pub module: Module,
    pub diagnostics: Vec<DiagnosticMessage>,
}

fn error_count(diagnostics: &[DiagnosticMessage]) -> usize {
    diagnostics
        .iter()
        .filter(|d| d.category == DiagnosticCategory::Error)
        .count()
}

/// Compilation finished but the module is semantically invalid. The
/// module is still returned for inspection.
#[derive(Debug, Error)]
#[error("compilation failed with {} error(s)", error_count(.diagnostics))]
pub struct CompileError {
    pub module: Module,
    pub diagnostics: Vec<DiagnosticMessage>,
}

/// Saved transient lowering context, restored after any nested lowering.
struct LoweringCtx {
    function: ElementId,
    enum_: Option<ElementId>,
    ty: Type,
    source: usize,
    flow: Flow,
}

/// The compiler instance. Owns the module under construction and borrows
/// the program model it lowers.
pub struct Compiler<'p> {
    pub(crate) program: &'p mut Program,
    pub(crate) options: Options,
    pub(crate) module: Module,
    pub(crate) diagnostics: Diagnostics,

    compiled_sources: HashSet<String>,
    pub(crate) start_body: Vec<ExprRef>,
    start_function: ElementId,

    pub(crate) current_function: ElementId,
    pub(crate) current_enum: Option<ElementId>,
    pub(crate) current_type: Type,
    pub(crate) current_source: usize,
    pub(crate) flow: Flow,

    memory_offset: u64,
    memory_segments: Vec<MemorySegment>,
    string_offsets: HashMap<String, u64>,

    function_table: Vec<ElementId>,
}

impl<'p> Compiler<'p> {
    /// Compiles `program` into a module. Returns `Err` when any
    /// error-severity diagnostic was produced; the invalid module is
    /// carried along for inspection either way.
    pub fn compile(
        program: &'p mut Program,
        options: Options,
    ) -> Result<CompiledModule, CompileError> {
        let mut diagnostics = Diagnostics::new();
        program.initialize(&mut diagnostics);
        let mut compiler = Compiler::new(program, options, diagnostics);
        compiler.run();
        compiler.finish()
    }

    fn new(program: &'p mut Program, options: Options, diagnostics: Diagnostics) -> Compiler<'p> {
        let start_signature = program.add_signature(Signature {
            this_type: None,
            parameter_types: Vec::new(),
            parameter_names: Vec::new(),
            return_type: Type::VOID,
            required_parameters: 0,
            has_rest: false,
        });
        let start_function =
            program.add_synthetic_function("start", start_signature, Vec::new(), None);
        let pointer_bytes = u64::from(options.target.pointer_size() / 8);
        // The first slot is reserved so that address 0 reads as null.
        let memory_offset = u64::from(options.memory_base).max(pointer_bytes);
        Compiler {
            program,
            options,
            module: Module::new(),
            diagnostics,
            compiled_sources: HashSet::new(),
            start_body: Vec::new(),
            start_function,
            current_function: start_function,
            current_enum: None,
            current_type: Type::VOID,
            current_source: 0,
            flow: Flow::new(),
            memory_offset,
            memory_segments: Vec::new(),
            string_offsets: HashMap::new(),
            function_table: Vec::new(),
        }
    }

    fn finish(self) -> Result<CompiledModule, CompileError> {
        let diagnostics = self.diagnostics.into_messages();
        if error_count(&diagnostics) > 0 {
            Err(CompileError { module: self.module, diagnostics })
        } else {
            Ok(CompiledModule { module: self.module, diagnostics })
        }
    }

    fn run(&mut self) {
        let exhaustive = self.options.no_tree_shaking;
        for index in 0..self.program.sources.len() {
            let source = &self.program.sources[index];
            if exhaustive || source.is_entry {
                self.compile_source_index(index);
            }
        }
        self.make_start_function();
        self.write_function_table();
        self.finalize_memory();
    }

    // --- driver --------------------------------------------------------

    fn compile_source_by_path(&mut self, path: &str, range: Range) {
        match self.program.source_index_of(path) {
            Some(index) => self.compile_source_index(index),
            None => self.error(
                DiagnosticCode::UnresolvableIdentifier,
                range,
                format!("cannot find source '{path}'"),
            ),
        }
    }

    fn compile_source_index(&mut self, index: usize) {
        let path = self.program.sources[index].normalized_path.clone();
        if !self.compiled_sources.insert(path.clone()) {
            return;
        }
        trace!("compiling source {path}");
        let previous_source = self.current_source;
        self.current_source = index;
        let statements = self.program.sources[index].statements.clone();
        for statement in &statements {
            self.compile_top_level_statement(statement, &path);
        }
        self.current_source = previous_source;
    }

    fn compile_top_level_statement(&mut self, statement: &Statement, path: &str) {
        let exhaustive = self.options.no_tree_shaking;
        match statement {
            Statement::Import(import) => {
                self.compile_source_by_path(&import.path, import.range);
            }
            Statement::Export(export) => {
                let from = export.path.clone().unwrap_or_else(|| path.to_string());
                if export.path.is_some() {
                    self.compile_source_by_path(&from, export.range);
                }
                for member in &export.members {
                    let internal = format!("{from}/{}", member.name);
                    match self.program.elements.get(&internal).copied() {
                        Some(id) => {
                            self.compile_element_as_export(
                                id,
                                member.external_name.clone(),
                                member.range,
                            );
                        }
                        None => {
                            // Already reported during initialization.
                        }
                    }
                }
            }
            Statement::Variable(decl) => {
                for var in &decl.declarations {
                    let internal = format!("{path}/{}", var.name);
                    if let Some(&id) = self.program.elements.get(&internal) {
                        if exhaustive || self.program.elem(id).flags.contains(ElementFlags::EXPORTED)
                        {
                            self.compile_global(id);
                            self.maybe_export_declaration(id);
                        }
                    }
                }
            }
            Statement::Function(decl) => {
                let internal = format!("{path}/{}", decl.name);
                if let Some(&id) = self.program.elements.get(&internal) {
                    let flags = self.program.elem(id).flags;
                    // A parameterized declaration is never emitted without
                    // a type-argument application.
                    if flags.contains(ElementFlags::GENERIC) {
                        return;
                    }
                    if exhaustive || flags.contains(ElementFlags::EXPORTED) {
                        if self
                            .compile_function_using_type_arguments(id, &[], decl.range)
                            .is_some()
                        {
                            self.maybe_export_declaration(id);
                        }
                    }
                }
            }
            Statement::Enum(decl) => {
                let internal = format!("{path}/{}", decl.name);
                if let Some(&id) = self.program.elements.get(&internal) {
                    if exhaustive || self.program.elem(id).flags.contains(ElementFlags::EXPORTED) {
                        self.compile_enum(id);
                    }
                }
            }
            Statement::Class(decl) => {
                let internal = format!("{path}/{}", decl.name);
                if let Some(&id) = self.program.elements.get(&internal) {
                    let flags = self.program.elem(id).flags;
                    if flags.contains(ElementFlags::GENERIC) {
                        return;
                    }
                    if exhaustive || flags.contains(ElementFlags::EXPORTED) {
                        // Classes materialize as type placeholders only;
                        // members compile on demand.
                        self.program.resolve_class_type_arguments(
                            id,
                            &[],
                            self.options.target,
                            decl.range,
                            &mut self.diagnostics,
                        );
                    }
                }
            }
            Statement::Namespace(decl) => {
                let internal = format!("{path}/{}", decl.name);
                if let Some(&id) = self.program.elements.get(&internal) {
                    if exhaustive || self.program.elem(id).flags.contains(ElementFlags::EXPORTED) {
                        self.compile_namespace(id);
                    }
                }
            }
            Statement::Interface { name, range } => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    *range,
                    format!("interfaces are not supported ('{name}')"),
                );
            }
            _ => {
                // Not a declaration: becomes part of the start function,
                // in source order.
                debug_assert_eq!(self.current_function, self.start_function);
                let compiled = self.compile_statement(statement);
                self.start_body.push(compiled);
            }
        }
    }

    /// Adds the module export for a declaration carrying the `export`
    /// modifier, under its declared name.
    fn maybe_export_declaration(&mut self, id: ElementId) {
        if self.program.elem(id).flags.contains(ElementFlags::EXPORTED) {
            let name = self.program.elem(id).simple_name.clone();
            let range = Range::default();
            self.compile_element_as_export(id, name, range);
        }
    }

    fn compile_element_as_export(&mut self, id: ElementId, external: String, range: Range) {
        match &self.program.elem(id).data {
            ElementData::FunctionPrototype(_) => {
                if self.program.elem(id).flags.contains(ElementFlags::GENERIC) {
                    return;
                }
                if let Some(instance) = self.compile_function_using_type_arguments(id, &[], range) {
                    let internal = self.program.elem(instance).internal_name.clone();
                    if !self.module.function_exports.iter().any(|(e, _)| *e == external) {
                        self.module.add_function_export(internal, external);
                    }
                }
            }
            ElementData::Global(_) => {
                if self.compile_global(id) {
                    let element = self.program.elem(id);
                    let internal = element.internal_name.clone();
                    if self.module.globals.get(&internal).map(|g| g.mutable) == Some(false) {
                        if !self.module.global_exports.iter().any(|(e, _)| *e == external) {
                            self.module.add_global_export(internal, external);
                        }
                    } else {
                        self.warning(
                            DiagnosticCode::MutableGlobalExport,
                            range,
                            format!("mutable global '{external}' cannot be exported"),
                        );
                    }
                }
            }
            ElementData::Enum(_) => {
                self.compile_enum(id);
            }
            ElementData::Namespace(_) => {
                self.compile_namespace(id);
            }
            ElementData::ClassPrototype(_) => {
                if !self.program.elem(id).flags.contains(ElementFlags::GENERIC) {
                    self.program.resolve_class_type_arguments(
                        id,
                        &[],
                        self.options.target,
                        range,
                        &mut self.diagnostics,
                    );
                }
            }
            _ => {}
        }
    }

    fn compile_namespace(&mut self, id: ElementId) {
        let members: Vec<ElementId> = match &self.program.elem(id).data {
            ElementData::Namespace(data) => data.members.values().copied().collect(),
            _ => panic!("element is not a namespace"),
        };
        let exhaustive = self.options.no_tree_shaking;
        for member in members {
            let flags = self.program.elem(member).flags;
            if !exhaustive && !flags.contains(ElementFlags::EXPORTED) {
                continue;
            }
            match &self.program.elem(member).data {
                ElementData::Global(_) => {
                    self.compile_global(member);
                }
                ElementData::Enum(_) => {
                    self.compile_enum(member);
                }
                ElementData::FunctionPrototype(_) => {
                    if !flags.contains(ElementFlags::GENERIC) {
                        self.compile_function_using_type_arguments(
                            member,
                            &[],
                            Range::default(),
                        );
                    }
                }
                ElementData::ClassPrototype(_) => {
                    if !flags.contains(ElementFlags::GENERIC) {
                        self.program.resolve_class_type_arguments(
                            member,
                            &[],
                            self.options.target,
                            Range::default(),
                            &mut self.diagnostics,
                        );
                    }
                }
                ElementData::Namespace(_) => self.compile_namespace(member),
                _ => {}
            }
        }
    }

    // --- globals and enums ---------------------------------------------

    /// Compiles a global variable. Returns whether the element is usable
    /// afterwards (its type resolved).
    pub(crate) fn compile_global(&mut self, id: ElementId) -> bool {
        let element = self.program.elem(id);
        if element.flags.contains(ElementFlags::COMPILED) {
            return matches!(
                &element.data,
                ElementData::Global(data) if data.resolved_type.is_some()
            );
        }
        self.program.elem_mut(id).flags |= ElementFlags::COMPILED;

        let (annotation, initializer, range) = match &self.program.elem(id).data {
            ElementData::Global(data) => (
                data.type_annotation.clone(),
                data.initializer.clone(),
                data.range,
            ),
            _ => panic!("element is not a global"),
        };
        let flags = self.program.elem(id).flags;
        let internal = self.program.elem(id).internal_name.clone();
        let simple = self.program.elem(id).simple_name.clone();
        trace!("compiling global {internal}");

        // Initializers lower in the start function's scope.
        let ctx = self.enter_context(self.start_function);

        let mut compiled_init: Option<ExprRef> = None;
        let ty = if let Some(node) = &annotation {
            match self.program.resolve_type(
                node,
                None,
                self.options.target,
                &mut self.diagnostics,
            ) {
                Some(ty) if !ty.is_void() => ty,
                Some(_) => {
                    self.error(
                        DiagnosticCode::TypeExpected,
                        range,
                        "a global cannot be of type 'void'",
                    );
                    self.leave_context(ctx);
                    return false;
                }
                None => {
                    self.leave_context(ctx);
                    return false;
                }
            }
        } else if let Some(init) = &initializer {
            let compiled = self.compile_expression(init, Type::VOID, ConversionKind::None, true);
            if self.current_type.is_void() {
                self.error(
                    DiagnosticCode::CannotInferType,
                    range,
                    format!("cannot infer a type for '{simple}' from a void initializer"),
                );
                self.leave_context(ctx);
                return false;
            }
            compiled_init = Some(compiled);
            self.current_type
        } else {
            self.error(
                DiagnosticCode::CannotInferType,
                range,
                format!("'{simple}' needs a type annotation or an initializer"),
            );
            self.leave_context(ctx);
            return false;
        };

        if let ElementData::Global(data) = &mut self.program.elem_mut(id).data {
            data.resolved_type = Some(ty);
        }

        if flags.contains(ElementFlags::DECLARED) {
            self.leave_context(ctx);
            if flags.contains(ElementFlags::CONSTANT) {
                let type_name = ty.native_type();
                self.module
                    .add_global_import(internal, "env", simple, type_name);
                return true;
            }
            self.error(
                DiagnosticCode::MutableGlobalImport,
                range,
                format!("mutable global '{simple}' cannot be imported"),
            );
            return false;
        }

        let native = ty.native_type();
        match &initializer {
            Some(init) => {
                let compiled = match compiled_init {
                    Some(expr) => expr,
                    None => self.compile_expression(init, ty, ConversionKind::Implicit, true),
                };
                match self.precompute(compiled) {
                    Some(constant) => {
                        let value = constant_to_value(constant);
                        if flags.contains(ElementFlags::CONSTANT) {
                            self.program.elem_mut(id).flags |= ElementFlags::INLINED;
                            if let ElementData::Global(data) =
                                &mut self.program.elem_mut(id).data
                            {
                                data.constant_value = Some(value);
                            }
                            // Still emitted (immutably) when the constant
                            // is part of the export surface.
                            if flags.contains(ElementFlags::EXPORTED) {
                                let init = self.make_constant(ty, value);
                                self.module.add_global(internal, native, false, init);
                            }
                        } else {
                            let init = self.make_constant(ty, value);
                            self.module.add_global(internal, native, true, init);
                        }
                    }
                    None => {
                        if flags.contains(ElementFlags::CONSTANT) {
                            self.warning(
                                DiagnosticCode::ConstantGlobalNotFoldable,
                                range,
                                format!(
                                    "initializer of constant '{simple}' is not foldable; \
                                     compiling as mutable"
                                ),
                            );
                        }
                        let zero = self.zero_of(native);
                        self.module.add_global(internal.clone(), native, true, zero);
                        let assign = self.module.global_set(internal, compiled);
                        self.start_body.push(assign);
                    }
                }
            }
            None => {
                let zero = self.zero_of(native);
                self.module.add_global(internal, native, true, zero);
            }
        }
        self.leave_context(ctx);
        true
    }

    pub(crate) fn compile_enum(&mut self, id: ElementId) -> bool {
        if self.program.elem(id).flags.contains(ElementFlags::COMPILED) {
            return true;
        }
        self.program.elem_mut(id).flags |= ElementFlags::COMPILED;
        trace!("compiling enum {}", self.program.elem(id).internal_name);

        let values = match &self.program.elem(id).data {
            ElementData::Enum(data) => data.values.clone(),
            _ => panic!("element is not an enum"),
        };
        let ctx = self.enter_context(self.start_function);
        self.current_enum = Some(id);

        let mut previous: Option<ElementId> = None;
        for value_id in values {
            let (initializer, internal) = {
                let element = self.program.elem(value_id);
                let data = match &element.data {
                    ElementData::EnumValue(data) => data,
                    _ => panic!("element is not an enum value"),
                };
                (data.initializer.clone(), element.internal_name.clone())
            };
            match initializer {
                Some(expr) => {
                    let compiled =
                        self.compile_expression(&expr, Type::I32, ConversionKind::Implicit, true);
                    match self.precompute(compiled) {
                        Some(IrConstant::I32(value)) => {
                            self.set_enum_constant(value_id, i64::from(value));
                        }
                        _ => {
                            // Runtime-initialized i32 global, filled in by
                            // the start function.
                            let zero = self.zero_of(NativeType::I32);
                            self.module
                                .add_global(internal.clone(), NativeType::I32, true, zero);
                            let assign = self.module.global_set(internal, compiled);
                            self.start_body.push(assign);
                        }
                    }
                }
                None => match previous {
                    None => self.set_enum_constant(value_id, 0),
                    Some(prev_id) => {
                        let prev_constant = match &self.program.elem(prev_id).data {
                            ElementData::EnumValue(data) => data.constant_value,
                            _ => unreachable!(),
                        };
                        match prev_constant {
                            Some(value) => {
                                self.set_enum_constant(value_id, value.wrapping_add(1));
                            }
                            None => {
                                let prev_internal =
                                    self.program.elem(prev_id).internal_name.clone();
                                let zero = self.zero_of(NativeType::I32);
                                self.module.add_global(
                                    internal.clone(),
                                    NativeType::I32,
                                    true,
                                    zero,
                                );
                                let get =
                                    self.module.global_get(prev_internal, NativeType::I32);
                                let one = self.module.i32_const(1);
                                let next = self.module.binary(
                                    crate::module::BinaryOp::AddI32,
                                    get,
                                    one,
                                );
                                let assign = self.module.global_set(internal, next);
                                self.start_body.push(assign);
                            }
                        }
                    }
                },
            }
            self.program.elem_mut(value_id).flags |= ElementFlags::COMPILED;
            previous = Some(value_id);
        }
        self.leave_context(ctx);
        true
    }

    fn set_enum_constant(&mut self, value_id: ElementId, value: i64) {
        let element = self.program.elem_mut(value_id);
        element.flags |= ElementFlags::INLINED;
        match &mut element.data {
            ElementData::EnumValue(data) => data.constant_value = Some(value),
            _ => unreachable!(),
        }
    }

    // --- functions -----------------------------------------------------

    /// Resolves a prototype with the given type arguments and compiles
    /// the resulting concrete instance exactly once.
    pub(crate) fn compile_function_using_type_arguments(
        &mut self,
        prototype: ElementId,
        type_arguments: &[Type],
        range: Range,
    ) -> Option<ElementId> {
        let instance = self.program.resolve_using_type_arguments(
            prototype,
            type_arguments,
            self.options.target,
            range,
            &mut self.diagnostics,
        )?;
        if self.compile_function_instance(instance) {
            Some(instance)
        } else {
            None
        }
    }

    /// Compiles a concrete function instance. Re-entry short-circuits.
    pub(crate) fn compile_function_instance(&mut self, id: ElementId) -> bool {
        if self.program.elem(id).flags.contains(ElementFlags::COMPILED) {
            return true;
        }
        self.program.elem_mut(id).flags |= ElementFlags::COMPILED;

        let internal = self.program.elem(id).internal_name.clone();
        let simple = self.program.elem(id).simple_name.clone();
        debug!("compiling function {internal}");

        let data = self.program.function_data(id);
        let signature = self.program.signature(data.signature).clone();
        let declaration = data
            .prototype
            .map(|proto| match &self.program.elem(proto).data {
                ElementData::FunctionPrototype(p) => p.declaration.clone(),
                _ => panic!("prototype element is not a function prototype"),
            });

        let params = signature.native_params();
        let result = signature.return_type.native_type();
        let type_name = self.module.add_function_type(&params, result);

        let body_statements = declaration.as_ref().and_then(|d| d.body.clone());
        match body_statements {
            None => {
                // Bodiless functions are imports.
                self.module
                    .add_function_import(internal, "env", simple, type_name);
                true
            }
            Some(statements) => {
                let declaration = declaration.expect("body implies a declaration");
                let ctx = self.enter_context(id);
                self.current_source = declaration.range.source as usize;

                let mut children = Vec::with_capacity(statements.len());
                for statement in &statements {
                    children.push(self.compile_statement(statement));
                }

                let returns = self.flow.is(FlowFlags::RETURNS);
                if !signature.return_type.is_void() {
                    if returns {
                        // All paths return; hint the validator that the
                        // fall-through edge is dead.
                        let ends_returning = children.last().is_some_and(|&last| {
                            matches!(
                                self.module.expr_type(last),
                                NativeType::Unreachable
                            )
                        });
                        if !ends_returning {
                            let hint = self.module.unreachable();
                            children.push(hint);
                        }
                    } else {
                        self.error(
                            DiagnosticCode::FunctionMustReturn,
                            declaration.range,
                            format!(
                                "function '{simple}' must return a value of type '{}'",
                                signature.return_type
                            ),
                        );
                    }
                }
                self.leave_context(ctx);

                let data = self.program.function_data(id);
                let locals: Vec<NativeType> = data.locals[data.param_count..]
                    .iter()
                    .map(|l| l.ty.native_type())
                    .collect();
                let body = self.module.block(None, children, result);
                self.module.add_function(internal, type_name, locals, body);
                true
            }
        }
    }

    /// First use of a function's address appends it to the table.
    pub(crate) fn ensure_function_table_index(&mut self, id: ElementId) -> u32 {
        if let Some(index) = self.program.function_data(id).table_index {
            return index;
        }
        self.compile_function_instance(id);
        let index = self.function_table.len() as u32;
        self.function_table.push(id);
        self.program.function_data_mut(id).table_index = Some(index);
        trace!(
            "function {} takes table index {index}",
            self.program.elem(id).internal_name
        );
        index
    }

    fn write_function_table(&mut self) {
        if self.function_table.is_empty() {
            return;
        }
        let entries = self
            .function_table
            .iter()
            .map(|&id| self.program.elem(id).internal_name.clone())
            .collect();
        self.module.set_function_table(entries);
    }

    // --- start function and memory -------------------------------------

    fn make_start_function(&mut self) {
        if self.start_body.is_empty() {
            return;
        }
        let children = std::mem::take(&mut self.start_body);
        let body = self.module.block(None, children, NativeType::None);
        let type_name = self.module.add_function_type(&[], NativeType::None);
        let data = self.program.function_data(self.start_function);
        let locals: Vec<NativeType> = data.locals[data.param_count..]
            .iter()
            .map(|l| l.ty.native_type())
            .collect();
        self.module.add_function("start", type_name, locals, body);
        self.module.set_start("start");
    }

    fn finalize_memory(&mut self) {
        let pointer_bytes = u64::from(self.options.target.pointer_size() / 8);
        self.memory_offset = align_offset(self.memory_offset, pointer_bytes);
        let heap_base = if pointer_bytes == 8 {
            self.module.i64_const(self.memory_offset as i64)
        } else {
            self.module.i32_const(self.memory_offset as i32)
        };
        let native = if pointer_bytes == 8 {
            NativeType::I64
        } else {
            NativeType::I32
        };
        self.module.add_global("HEAP_BASE", native, false, heap_base);
        self.module.add_global_export("HEAP_BASE", "HEAP_BASE");

        if self.options.no_memory {
            return;
        }
        if self.options.import_memory {
            self.module.add_memory_import("env", "memory");
        }
        let pages = self.memory_offset.div_ceil(0x1_0000).max(1) as u32;
        let maximum = self.options.target.max_pages();
        let segments = std::mem::take(&mut self.memory_segments);
        self.module
            .set_memory(pages, maximum, segments, Some("memory".into()));
        trace!("memory laid out: {pages} page(s), HEAP_BASE={}", self.memory_offset);
    }

    /// Hands out the next aligned static offset and records the segment.
    pub(crate) fn add_memory_segment(&mut self, data: Vec<u8>, alignment: u64) -> u64 {
        let offset = align_offset(self.memory_offset, alignment);
        self.memory_offset = offset + data.len() as u64;
        self.memory_segments.push(MemorySegment { offset, data });
        offset
    }

    /// Interns a string literal: identical values share one segment.
    /// Layout is a 4-byte little-endian length prefix followed by UTF-16
    /// code units.
    pub(crate) fn intern_string(&mut self, value: &str) -> u64 {
        if let Some(&offset) = self.string_offsets.get(value) {
            return offset;
        }
        let units: Vec<u16> = value.encode_utf16().collect();
        let mut data = Vec::with_capacity(4 + units.len() * 2);
        data.extend_from_slice(&(units.len() as u32).to_le_bytes());
        for unit in units {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        let offset = self.add_memory_segment(data, 4);
        self.string_offsets.insert(value.to_string(), offset);
        offset
    }

    // --- precompute bridge ---------------------------------------------

    /// Folds an expression by emitting it as the body of a private
    /// function, running the backend's precompute pass on it and reading
    /// the result back. The function is removed afterwards.
    pub(crate) fn precompute(&mut self, expr: ExprRef) -> Option<IrConstant> {
        const PRECOMPUTE_FUNCTION: &str = "precompute|tmp";
        let ty = self.module.expr_type(expr);
        if matches!(ty, NativeType::None | NativeType::Unreachable) {
            return None;
        }
        let type_name = self.module.add_function_type(&[], ty);
        self.module
            .add_function(PRECOMPUTE_FUNCTION, type_name, Vec::new(), expr);
        self.module.run_passes(&["precompute"], PRECOMPUTE_FUNCTION);
        let body = self.module.functions[PRECOMPUTE_FUNCTION].body;
        let constant = self.module.constant_value(body);
        self.module.remove_function(PRECOMPUTE_FUNCTION);
        constant
    }

    // --- context plumbing ----------------------------------------------

    fn enter_context(&mut self, function: ElementId) -> LoweringCtx {
        let saved = LoweringCtx {
            function: self.current_function,
            enum_: self.current_enum.take(),
            ty: self.current_type,
            source: self.current_source,
            flow: std::mem::take(&mut self.flow),
        };
        self.current_function = function;
        self.current_type = Type::VOID;
        self.flow = Flow::new();
        saved
    }

    fn leave_context(&mut self, saved: LoweringCtx) {
        self.current_function = saved.function;
        self.current_enum = saved.enum_;
        self.current_type = saved.ty;
        self.current_source = saved.source;
        self.flow = saved.flow;
    }

    pub(crate) fn current_signature(&self) -> &Signature {
        let data = self.program.function_data(self.current_function);
        self.program.signature(data.signature)
    }

    pub(crate) fn next_label_id(&mut self) -> u32 {
        let data = self.program.function_data_mut(self.current_function);
        let id = data.next_label;
        data.next_label += 1;
        id
    }

    // --- locals and temporaries ----------------------------------------

    /// Adds a real local slot to the current function.
    pub(crate) fn add_local(&mut self, name: String, ty: Type) -> u32 {
        let data = self.program.function_data_mut(self.current_function);
        let index = data.locals.len() as i32;
        data.locals.push(Local {
            name,
            index,
            ty,
            constant_value: None,
        });
        index as u32
    }

    /// Allocates (or reuses) a temporary slot of the given type.
    pub(crate) fn get_temp_local(&mut self, ty: Type) -> u32 {
        let native = ty.native_type();
        let data = self.program.function_data_mut(self.current_function);
        if let Some(position) = data
            .free_temps
            .iter()
            .position(|&slot| data.locals[slot].ty.native_type() == native)
        {
            let slot = data.free_temps.swap_remove(position);
            data.locals[slot].ty = ty;
            data.locals[slot].index as u32
        } else {
            let index = data.locals.len() as i32;
            data.locals.push(Local {
                name: format!("temp{index}"),
                index,
                ty,
                constant_value: None,
            });
            index as u32
        }
    }

    /// Allocates a temporary and immediately releases it, so the very
    /// next expression may reuse the slot.
    pub(crate) fn get_and_free_temp_local(&mut self, ty: Type) -> u32 {
        let index = self.get_temp_local(ty);
        self.free_temp_local(index);
        index
    }

    pub(crate) fn free_temp_local(&mut self, index: u32) {
        let data = self.program.function_data_mut(self.current_function);
        data.free_temps.push(index as usize);
    }

    // --- small shared helpers ------------------------------------------

    pub(crate) fn error(&mut self, code: DiagnosticCode, range: Range, message: impl Into<String>) {
        self.diagnostics.error(code, range, message);
    }

    pub(crate) fn warning(
        &mut self,
        code: DiagnosticCode,
        range: Range,
        message: impl Into<String>,
    ) {
        self.diagnostics.warning(code, range, message);
    }

    pub(crate) fn usize_type(&self) -> Type {
        Type::usize_type(self.options.target)
    }

    pub(crate) fn zero_of(&mut self, native: NativeType) -> ExprRef {
        match native {
            NativeType::I64 => self.module.i64_const(0),
            NativeType::F32 => self.module.f32_const(0.0),
            NativeType::F64 => self.module.f64_const(0.0),
            _ => self.module.i32_const(0),
        }
    }

    /// Materializes a cached constant in the native projection of `ty`.
    pub(crate) fn make_constant(&mut self, ty: Type, value: ConstantValue) -> ExprRef {
        match (ty.native_type(), value) {
            (NativeType::I32, ConstantValue::Integer(v)) => self.module.i32_const(v as i32),
            (NativeType::I64, ConstantValue::Integer(v)) => self.module.i64_const(v),
            (NativeType::F32, ConstantValue::Float(v)) => self.module.f32_const(v as f32),
            (NativeType::F64, ConstantValue::Float(v)) => self.module.f64_const(v),
            (NativeType::F32, ConstantValue::Integer(v)) => self.module.f32_const(v as f32),
            (NativeType::F64, ConstantValue::Integer(v)) => self.module.f64_const(v as f64),
            (NativeType::I32, ConstantValue::Float(v)) => self.module.i32_const(v as i32),
            (NativeType::I64, ConstantValue::Float(v)) => self.module.i64_const(v as i64),
            _ => unreachable!("constant of a void type"),
        }
    }

    /// An `unreachable` placeholder with `currentType` forced to the
    /// contextual type, so the outer analyzer can continue.
    pub(crate) fn error_expression(&mut self, contextual: Type) -> ExprRef {
        self.current_type = contextual;
        self.module.unreachable()
    }

}

fn align_offset(offset: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

pub(crate) fn constant_to_value(constant: IrConstant) -> ConstantValue {
    match constant {
        IrConstant::I32(v) => ConstantValue::Integer(i64::from(v)),
        IrConstant::I64(v) => ConstantValue::Integer(v),
        IrConstant::F32(v) => ConstantValue::Float(f64::from(v)),
        IrConstant::F64(v) => ConstantValue::Float(v),
    }
}
