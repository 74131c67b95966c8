//! Expression lowering.
//!
//! This is the large match at the heart of the compiler. Every handler
//! leaves `currentType` set to the static type of what it emitted; the
//! shared tail then reconciles that type with the contextual one by
//! inserting conversions. The `wrap` flag records whether a small-integer
//! result must be normalized here or whether the consumer wraps anyway.

use smallvec::SmallVec;

use crate::ast::{BinaryOperator, Expression, Range, TypeNode, UnaryOperator};
use crate::diagnostics::DiagnosticCode;
use crate::module::{BinaryOp, Expr, ExprRef, IrConstant, NativeType, UnaryOp};
use crate::program::{ElementData, ElementFlags, ElementId};
use crate::types::{Type, TypeKind};

use super::{Compiler, ConversionKind};

/// A value being assigned: either still syntax, or already lowered (used
/// by increment/decrement and compound forms).
enum AssignValue<'a> {
    Ast(&'a Expression),
    Compiled(ExprRef, Type),
}

fn integer_fits(value: i64, ty: &Type) -> bool {
    match ty.kind {
        TypeKind::Bool => (0..=1).contains(&value),
        TypeKind::I8 => i64::from(i8::MIN) <= value && value <= i64::from(i8::MAX),
        TypeKind::I16 => i64::from(i16::MIN) <= value && value <= i64::from(i16::MAX),
        TypeKind::I32 => i64::from(i32::MIN) <= value && value <= i64::from(i32::MAX),
        TypeKind::I64 => true,
        TypeKind::U8 => (0..=0xff).contains(&value),
        TypeKind::U16 => (0..=0xffff).contains(&value),
        TypeKind::U32 => (0..=0xffff_ffff).contains(&value),
        TypeKind::U64 => true,
        TypeKind::Isize => {
            ty.size == 64 || (i64::from(i32::MIN) <= value && value <= i64::from(i32::MAX))
        }
        TypeKind::Usize => ty.size == 64 || (0..=0xffff_ffff).contains(&value),
        _ => false,
    }
}

impl Compiler<'_> {
    /// Compiles one expression. `contextual` is the type the surrounding
    /// code expects, `kind` decides whether a conversion is inserted, and
    /// `wrap` whether a small-integer result must be normalized here.
    pub(crate) fn compile_expression(
        &mut self,
        expression: &Expression,
        contextual: Type,
        kind: ConversionKind,
        wrap: bool,
    ) -> ExprRef {
        let compiled = match expression {
            Expression::Null { .. } => {
                let ty = if contextual.is_reference() {
                    contextual
                } else {
                    self.usize_type()
                };
                self.current_type = ty;
                self.zero_of(ty.native_type())
            }
            Expression::True { .. } => {
                self.current_type = Type::BOOL;
                self.module.i32_const(1)
            }
            Expression::False { .. } => {
                self.current_type = Type::BOOL;
                self.module.i32_const(0)
            }
            Expression::This { range } => self.compile_this(false, *range),
            Expression::Super { range } => self.compile_this(true, *range),
            Expression::Identifier { name, range } => {
                self.compile_identifier(name, contextual, *range)
            }
            Expression::IntegerLiteral { value, .. } => {
                self.compile_integer_literal(*value, contextual)
            }
            Expression::FloatLiteral { value, .. } => {
                self.compile_float_literal(*value, contextual)
            }
            Expression::StringLiteral { value, .. } => {
                let offset = self.intern_string(value);
                let ty = self.program.string_type.unwrap_or(self.usize_type());
                self.current_type = ty;
                self.make_pointer_constant(offset)
            }
            Expression::ArrayLiteral { elements, range } => {
                self.compile_array_literal(elements, contextual, *range)
            }
            Expression::Parenthesized { inner, .. } => {
                return self.compile_expression(inner, contextual, kind, wrap);
            }
            Expression::PropertyAccess { target, property, range } => {
                self.compile_property_access(target, property, contextual, *range)
            }
            Expression::ElementAccess { target, index, range } => {
                self.compile_element_access(target, index, *range)
            }
            Expression::Call { callee, type_arguments, arguments, range } => {
                self.compile_call(callee, type_arguments, arguments, contextual, *range)
            }
            Expression::New { class, type_arguments, arguments, range } => {
                self.compile_new(class, type_arguments, arguments, *range)
            }
            Expression::UnaryPrefix { operator, operand, range } => {
                self.compile_unary_prefix(*operator, operand, contextual, wrap, *range)
            }
            Expression::UnaryPostfix { operator, operand, range } => {
                self.compile_unary_postfix(*operator, operand, contextual, *range)
            }
            Expression::Binary { operator, left, right, range } => {
                self.compile_binary(*operator, left, right, contextual, wrap, *range)
            }
            Expression::Assignment { operator, target, value, range } => match operator {
                None => self.compile_assignment(target, AssignValue::Ast(value), contextual, *range),
                Some(op) => {
                    // Compound forms lower as if plain, then go through
                    // the assignment machinery.
                    let desugared = Expression::Binary {
                        operator: *op,
                        left: target.clone(),
                        right: value.clone(),
                        range: *range,
                    };
                    self.compile_assignment(
                        target,
                        AssignValue::Ast(&desugared),
                        contextual,
                        *range,
                    )
                }
            },
            Expression::Ternary { condition, if_then, if_else, range } => {
                self.compile_ternary(condition, if_then, if_else, contextual, *range)
            }
        };
        let compiled = if kind != ConversionKind::None && self.current_type != contextual {
            self.convert_expression(
                compiled,
                self.current_type,
                contextual,
                kind == ConversionKind::Explicit,
                expression.range(),
            )
        } else {
            compiled
        };
        if self.options.source_map {
            let name = self
                .program
                .elem(self.current_function)
                .internal_name
                .clone();
            self.module
                .add_debug_location(name, compiled, expression.range());
        }
        compiled
    }

    // --- identifiers and element references ----------------------------

    fn lookup_param(&self, name: &str) -> Option<(u32, Type)> {
        let data = self.program.function_data(self.current_function);
        data.locals[..data.param_count]
            .iter()
            .find(|l| l.name == name)
            .map(|l| (l.index as u32, l.ty))
    }

    fn compile_this(&mut self, as_super: bool, range: Range) -> ExprRef {
        let data = self.program.function_data(self.current_function);
        let this_type = self.program.signature(data.signature).this_type;
        match this_type {
            Some(ty) => {
                let ty = if as_super {
                    let base = ty.class.and_then(|c| self.program.class(c).base);
                    match base {
                        Some(base) => Type::class_type(base, self.options.target),
                        None => {
                            self.error(
                                DiagnosticCode::UnresolvableIdentifier,
                                range,
                                "'super' requires a base class",
                            );
                            return self.error_expression(ty);
                        }
                    }
                } else {
                    ty
                };
                self.current_type = ty;
                self.module.local_get(0, ty.native_type())
            }
            None => {
                self.error(
                    DiagnosticCode::UnresolvableIdentifier,
                    range,
                    if as_super {
                        "'super' is only allowed in instance methods"
                    } else {
                        "'this' is only allowed in instance methods"
                    },
                );
                self.error_expression(self.usize_type())
            }
        }
    }

    fn compile_identifier(&mut self, name: &str, contextual: Type, range: Range) -> ExprRef {
        if let Some(scoped) = self.flow.lookup_scoped(name).cloned() {
            self.current_type = scoped.ty;
            return if scoped.index < 0 {
                let value = scoped
                    .constant_value
                    .expect("virtual local without a cached constant");
                self.make_constant(scoped.ty, value)
            } else {
                self.module
                    .local_get(scoped.index as u32, scoped.ty.native_type())
            };
        }
        if let Some((index, ty)) = self.lookup_param(name) {
            self.current_type = ty;
            return self.module.local_get(index, ty.native_type());
        }
        match self
            .program
            .resolve_identifier(name, self.current_source, self.current_enum)
        {
            Some(id) => self.compile_element_reference(id, contextual, range),
            None => {
                self.error(
                    DiagnosticCode::UnresolvableIdentifier,
                    range,
                    format!("cannot find name '{name}'"),
                );
                self.error_expression(contextual)
            }
        }
    }

    fn compile_element_reference(
        &mut self,
        id: ElementId,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        match &self.program.elem(id).data {
            ElementData::Global(_) => {
                if !self.compile_global(id) {
                    return self.error_expression(contextual);
                }
                let element = self.program.elem(id);
                let internal = element.internal_name.clone();
                let (ty, constant) = match &element.data {
                    ElementData::Global(data) => (
                        data.resolved_type.expect("compiled global without a type"),
                        data.constant_value,
                    ),
                    _ => unreachable!(),
                };
                self.current_type = ty;
                if element.flags.contains(ElementFlags::INLINED) {
                    let value = constant.expect("inlined global without a cached value");
                    self.make_constant(ty, value)
                } else {
                    self.module.global_get(internal, ty.native_type())
                }
            }
            ElementData::EnumValue(data) => {
                let owner = data.owner;
                if !self.program.elem(id).flags.contains(ElementFlags::COMPILED) {
                    if self.current_enum == Some(owner) {
                        self.error(
                            DiagnosticCode::ForwardEnumReference,
                            range,
                            format!(
                                "enum value '{}' is referenced before it is initialized",
                                self.program.elem(id).simple_name
                            ),
                        );
                        return self.error_expression(Type::I32);
                    }
                    self.compile_enum(owner);
                }
                let element = self.program.elem(id);
                let internal = element.internal_name.clone();
                let constant = match &element.data {
                    ElementData::EnumValue(data) => data.constant_value,
                    _ => unreachable!(),
                };
                self.current_type = Type::I32;
                match constant {
                    Some(value) => self.module.i32_const(value as i32),
                    None => self.module.global_get(internal, NativeType::I32),
                }
            }
            ElementData::FunctionPrototype(_) => {
                if self.program.elem(id).flags.contains(ElementFlags::GENERIC) {
                    self.error(
                        DiagnosticCode::TypeArgumentMismatch,
                        range,
                        "a generic function cannot be referenced without type arguments",
                    );
                    return self.error_expression(contextual);
                }
                match self.program.resolve_using_type_arguments(
                    id,
                    &[],
                    self.options.target,
                    range,
                    &mut self.diagnostics,
                ) {
                    Some(instance) => self.compile_function_reference(instance),
                    None => self.error_expression(contextual),
                }
            }
            ElementData::Function(_) => self.compile_function_reference(id),
            _ => {
                self.error(
                    DiagnosticCode::UnresolvableIdentifier,
                    range,
                    format!(
                        "'{}' cannot be used as a value",
                        self.program.elem(id).simple_name
                    ),
                );
                self.error_expression(contextual)
            }
        }
    }

    fn compile_function_reference(&mut self, instance: ElementId) -> ExprRef {
        let index = self.ensure_function_table_index(instance);
        let signature = self.program.function_data(instance).signature;
        self.current_type = Type::function_type(signature);
        self.module.i32_const(index as i32)
    }

    // --- literals -------------------------------------------------------

    fn compile_integer_literal(&mut self, value: i64, contextual: Type) -> ExprRef {
        let ty = if contextual.is_integer() && integer_fits(value, &contextual) {
            contextual
        } else if integer_fits(value, &Type::I32) {
            Type::I32
        } else {
            Type::I64
        };
        self.current_type = ty;
        match ty.native_type() {
            NativeType::I64 => self.module.i64_const(value),
            _ => self.module.i32_const(value as i32),
        }
    }

    fn compile_float_literal(&mut self, value: f64, contextual: Type) -> ExprRef {
        if contextual.kind == TypeKind::F32 {
            self.current_type = Type::F32;
            self.module.f32_const(value as f32)
        } else {
            self.current_type = Type::F64;
            self.module.f64_const(value)
        }
    }

    fn make_pointer_constant(&mut self, offset: u64) -> ExprRef {
        if self.options.target.pointer_size() == 64 {
            self.module.i64_const(offset as i64)
        } else {
            self.module.i32_const(offset as i32)
        }
    }

    fn compile_array_literal(
        &mut self,
        elements: &[Expression],
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        let element_type = contextual.class.and_then(|class_id| {
            let class = self.program.class(class_id);
            let parameter = class.prototype.and_then(|p| match &self.program.elem(p).data {
                ElementData::ClassPrototype(data) => {
                    data.declaration.type_parameters.first().cloned()
                }
                _ => None,
            });
            parameter.and_then(|name| class.type_arguments.get(&name).copied())
        });
        let Some(element_type) = element_type else {
            self.error(
                DiagnosticCode::OperationNotSupported,
                range,
                "an array literal requires a contextual array class with an element type",
            );
            return self.error_expression(contextual);
        };
        let size = element_type.byte_size() as usize;
        let mut bytes = Vec::with_capacity(elements.len() * size);
        let mut all_constant = true;
        for element in elements {
            let compiled =
                self.compile_expression(element, element_type, ConversionKind::Implicit, true);
            match self.precompute(compiled) {
                Some(constant) => {
                    let encoded: [u8; 8] = match constant {
                        IrConstant::I32(v) => i64::from(v).to_le_bytes(),
                        IrConstant::I64(v) => v.to_le_bytes(),
                        IrConstant::F32(v) => u64::from(v.to_bits()).to_le_bytes(),
                        IrConstant::F64(v) => v.to_bits().to_le_bytes(),
                    };
                    bytes.extend_from_slice(&encoded[..size]);
                }
                None => all_constant = false,
            }
        }
        if !all_constant {
            // The dynamic case is left for a later revision.
            self.warning(
                DiagnosticCode::NonConstantArrayLiteral,
                range,
                "array literals with non-constant elements are not supported yet",
            );
            return self.error_expression(contextual);
        }
        let offset = self.add_memory_segment(bytes, size.max(1) as u64);
        self.current_type = contextual;
        self.make_pointer_constant(offset)
    }

    // --- property and element access ------------------------------------

    /// Resolves an expression that names a container (namespace, enum or
    /// class prototype) rather than a runtime value.
    fn resolve_static_element(&self, expression: &Expression) -> Option<ElementId> {
        let resolved = match expression {
            Expression::Identifier { name, .. } => {
                self.program
                    .resolve_identifier(name, self.current_source, self.current_enum)
            }
            Expression::PropertyAccess { target, property, .. } => self
                .resolve_static_element(target)
                .and_then(|container| self.program.resolve_property(container, property)),
            Expression::Parenthesized { inner, .. } => {
                return self.resolve_static_element(inner);
            }
            _ => None,
        }?;
        match &self.program.elem(resolved).data {
            ElementData::Namespace(_)
            | ElementData::Enum(_)
            | ElementData::ClassPrototype(_) => Some(resolved),
            _ => None,
        }
    }

    fn compile_property_access(
        &mut self,
        target: &Expression,
        property: &str,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        if let Some(container) = self.resolve_static_element(target) {
            return match self.program.resolve_property(container, property) {
                Some(member) => self.compile_element_reference(member, contextual, range),
                None => {
                    self.error(
                        DiagnosticCode::UnresolvableMember,
                        range,
                        format!(
                            "'{}' has no member '{property}'",
                            self.program.elem(container).simple_name
                        ),
                    );
                    self.error_expression(contextual)
                }
            };
        }
        let this = self.compile_expression(target, Type::VOID, ConversionKind::None, true);
        let target_type = self.current_type;
        self.compile_instance_property_get(this, target_type, property, range)
    }

    fn compile_instance_property_get(
        &mut self,
        this: ExprRef,
        target_type: Type,
        property: &str,
        range: Range,
    ) -> ExprRef {
        let Some(class) = target_type.class else {
            self.error(
                DiagnosticCode::UnresolvableMember,
                range,
                format!("type '{target_type}' has no member '{property}'"),
            );
            return self.error_expression(Type::I32);
        };
        if let Some((owner, index)) = self.program.lookup_field(class, property) {
            let field = &self.program.class(owner).fields[index];
            let (ty, offset) = (field.ty, field.offset);
            self.current_type = ty;
            return self.module.load(
                ty.byte_size() as u8,
                ty.is_signed_integer(),
                offset,
                ty.native_type(),
                this,
            );
        }
        if let Some(getter) = self.program.lookup_getter(class, property) {
            if let Some(instance) = self.program.resolve_using_type_arguments(
                getter,
                &[],
                self.options.target,
                range,
                &mut self.diagnostics,
            ) {
                return self.compile_direct_call(instance, Some(this), &[], range);
            }
            return self.error_expression(Type::I32);
        }
        self.error(
            DiagnosticCode::UnresolvableMember,
            range,
            format!(
                "class '{}' has no member '{property}'",
                self.program.class(class).name
            ),
        );
        self.error_expression(Type::I32)
    }

    fn compile_element_access(
        &mut self,
        target: &Expression,
        index: &Expression,
        range: Range,
    ) -> ExprRef {
        let this = self.compile_expression(target, Type::VOID, ConversionKind::None, true);
        let target_type = self.current_type;
        let Some(class) = target_type.class else {
            self.error(
                DiagnosticCode::MissingIndexedAccess,
                range,
                format!("type '{target_type}' has no '[]' operator"),
            );
            return self.error_expression(Type::I32);
        };
        let Some(getter) = self.program.lookup_indexed_get(class) else {
            self.error(
                DiagnosticCode::MissingIndexedAccess,
                range,
                format!(
                    "class '{}' has no '[]' operator",
                    self.program.class(class).name
                ),
            );
            return self.error_expression(Type::I32);
        };
        match self.program.resolve_using_type_arguments(
            getter,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) {
            Some(instance) => {
                self.compile_direct_call(instance, Some(this), std::slice::from_ref(index), range)
            }
            None => self.error_expression(Type::I32),
        }
    }

    // --- calls ----------------------------------------------------------

    fn resolve_type_arguments(&mut self, nodes: &[TypeNode]) -> Option<Vec<Type>> {
        let contextual = self
            .program
            .function_data(self.current_function)
            .type_arguments
            .clone();
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.push(self.program.resolve_type(
                node,
                Some(&contextual),
                self.options.target,
                &mut self.diagnostics,
            )?);
        }
        Some(out)
    }

    fn compile_call(
        &mut self,
        callee: &Expression,
        type_arguments: &[TypeNode],
        arguments: &[Expression],
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        match callee {
            Expression::Parenthesized { inner, .. } => {
                return self.compile_call(inner, type_arguments, arguments, contextual, range);
            }
            Expression::Identifier { name, .. } => {
                if self.flow.lookup_scoped(name).is_none() && self.lookup_param(name).is_none() {
                    return match self.program.resolve_identifier(
                        name,
                        self.current_source,
                        self.current_enum,
                    ) {
                        Some(id) => match &self.program.elem(id).data {
                            ElementData::FunctionPrototype(_) => self.compile_prototype_call(
                                id,
                                None,
                                type_arguments,
                                arguments,
                                contextual,
                                range,
                            ),
                            ElementData::Global(_) => {
                                let value = self.compile_element_reference(id, contextual, range);
                                let ty = self.current_type;
                                self.compile_indirect_call(value, ty, arguments, range)
                            }
                            _ => {
                                self.error(
                                    DiagnosticCode::NotCallable,
                                    range,
                                    format!("'{name}' is not callable"),
                                );
                                self.error_expression(contextual)
                            }
                        },
                        None => {
                            self.error(
                                DiagnosticCode::UnresolvableIdentifier,
                                range,
                                format!("cannot find name '{name}'"),
                            );
                            self.error_expression(contextual)
                        }
                    };
                }
            }
            Expression::PropertyAccess { target, property, .. } => {
                if let Some(container) = self.resolve_static_element(target) {
                    return match self.program.resolve_property(container, property) {
                        Some(member) => match &self.program.elem(member).data {
                            ElementData::FunctionPrototype(_) => self.compile_prototype_call(
                                member,
                                None,
                                type_arguments,
                                arguments,
                                contextual,
                                range,
                            ),
                            _ => {
                                let value =
                                    self.compile_element_reference(member, contextual, range);
                                let ty = self.current_type;
                                self.compile_indirect_call(value, ty, arguments, range)
                            }
                        },
                        None => {
                            self.error(
                                DiagnosticCode::UnresolvableMember,
                                range,
                                format!("no member '{property}' to call"),
                            );
                            self.error_expression(contextual)
                        }
                    };
                }
                let this = self.compile_expression(target, Type::VOID, ConversionKind::None, true);
                let target_type = self.current_type;
                if let Some(class) = target_type.class {
                    if let Some(method) = self.program.lookup_method(class, property) {
                        return self.compile_prototype_call(
                            method,
                            Some(this),
                            type_arguments,
                            arguments,
                            contextual,
                            range,
                        );
                    }
                }
                // A field or accessor holding a function value.
                let value = self.compile_instance_property_get(this, target_type, property, range);
                let ty = self.current_type;
                return self.compile_indirect_call(value, ty, arguments, range);
            }
            _ => {}
        }
        // Anything else evaluates to a first-class function value.
        let value = self.compile_expression(callee, Type::VOID, ConversionKind::None, true);
        let ty = self.current_type;
        self.compile_indirect_call(value, ty, arguments, range)
    }

    fn compile_prototype_call(
        &mut self,
        prototype: ElementId,
        this: Option<ExprRef>,
        type_arguments: &[TypeNode],
        arguments: &[Expression],
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        if self.program.elem(prototype).flags.contains(ElementFlags::BUILTIN) {
            return self.compile_builtin_call(prototype, type_arguments, arguments, range);
        }
        let Some(resolved_args) = self.resolve_type_arguments(type_arguments) else {
            return self.error_expression(contextual);
        };
        match self.program.resolve_using_type_arguments(
            prototype,
            &resolved_args,
            self.options.target,
            range,
            &mut self.diagnostics,
        ) {
            Some(instance) => self.compile_direct_call(instance, this, arguments, range),
            None => self.error_expression(contextual),
        }
    }

    /// Lowers a direct call, synthesizing the optional-argument
    /// trampoline when fewer arguments than parameters are supplied.
    pub(crate) fn compile_direct_call(
        &mut self,
        instance: ElementId,
        this: Option<ExprRef>,
        arguments: &[Expression],
        range: Range,
    ) -> ExprRef {
        self.compile_function_instance(instance);
        let signature = {
            let data = self.program.function_data(instance);
            self.program.signature(data.signature).clone()
        };
        let return_type = signature.return_type;
        debug_assert_eq!(
            this.is_some(),
            signature.this_type.is_some(),
            "receiver presence must match the signature"
        );
        if signature.has_rest {
            self.error(
                DiagnosticCode::RestParametersNotSupported,
                range,
                "rest parameters are not supported",
            );
            return self.error_expression(return_type);
        }
        if arguments.len() < signature.required_parameters {
            self.error(
                DiagnosticCode::ArityMismatch,
                range,
                format!(
                    "expected at least {} argument(s) but got {}",
                    signature.required_parameters,
                    arguments.len()
                ),
            );
            return self.error_expression(return_type);
        }
        if arguments.len() > signature.parameter_types.len() {
            self.error(
                DiagnosticCode::ArityMismatch,
                range,
                format!(
                    "expected at most {} argument(s) but got {}",
                    signature.parameter_types.len(),
                    arguments.len()
                ),
            );
            return self.error_expression(return_type);
        }

        let mut operands: SmallVec<[ExprRef; 8]> = SmallVec::new();
        operands.extend(this);
        for (argument, ty) in arguments.iter().zip(signature.parameter_types.iter()) {
            let compiled = self.compile_expression(argument, *ty, ConversionKind::Implicit, true);
            operands.push(compiled);
        }

        let target = if arguments.len() < signature.parameter_types.len() {
            // The trampoline fills the gap: missing operands are zeroed
            // and a trailing i32 carries how many optional arguments were
            // actually provided.
            let trampoline = self.ensure_trampoline(instance);
            for ty in &signature.parameter_types[arguments.len()..] {
                let zero = self.zero_of(ty.native_type());
                operands.push(zero);
            }
            let provided = (arguments.len() - signature.required_parameters) as i32;
            let count = self.module.i32_const(provided);
            operands.push(count);
            self.program.elem(trampoline).internal_name.clone()
        } else {
            self.program.elem(instance).internal_name.clone()
        };
        self.current_type = return_type;
        self.module
            .call(target, operands.into_vec(), return_type.native_type())
    }

    fn compile_indirect_call(
        &mut self,
        index: ExprRef,
        callee_type: Type,
        arguments: &[Expression],
        range: Range,
    ) -> ExprRef {
        let Some(signature_id) = callee_type.signature else {
            self.error(
                DiagnosticCode::NotCallable,
                range,
                format!("a value of type '{callee_type}' is not callable"),
            );
            return self.error_expression(Type::I32);
        };
        let signature = self.program.signature(signature_id).clone();
        let return_type = signature.return_type;
        if signature.this_type.is_some() {
            self.error(
                DiagnosticCode::NotCallable,
                range,
                "a bound method cannot be called through a function value",
            );
            return self.error_expression(return_type);
        }
        if signature.has_rest {
            self.error(
                DiagnosticCode::RestParametersNotSupported,
                range,
                "rest parameters are not supported",
            );
            return self.error_expression(return_type);
        }
        // Indirect calls have no trampoline: all arguments are required.
        if arguments.len() != signature.parameter_types.len() {
            self.error(
                DiagnosticCode::ArityMismatch,
                range,
                format!(
                    "expected {} argument(s) but got {}",
                    signature.parameter_types.len(),
                    arguments.len()
                ),
            );
            return self.error_expression(return_type);
        }
        let mut operands = Vec::with_capacity(arguments.len());
        for (argument, ty) in arguments.iter().zip(signature.parameter_types.iter()) {
            operands.push(self.compile_expression(argument, *ty, ConversionKind::Implicit, true));
        }
        let params = signature.native_params();
        let type_name = self
            .module
            .add_function_type(&params, return_type.native_type());
        self.current_type = return_type;
        self.module
            .call_indirect(index, operands, type_name, return_type.native_type())
    }

    fn compile_builtin_call(
        &mut self,
        prototype: ElementId,
        type_arguments: &[TypeNode],
        arguments: &[Expression],
        range: Range,
    ) -> ExprRef {
        let name = self.program.elem(prototype).simple_name.clone();
        match name.as_str() {
            "assert" => {
                if arguments.len() != 1 {
                    self.error(
                        DiagnosticCode::ArityMismatch,
                        range,
                        "assert expects exactly one argument",
                    );
                    return self.error_expression(Type::VOID);
                }
                if self.options.no_assert {
                    self.current_type = Type::VOID;
                    return self.module.nop();
                }
                let condition = self.compile_condition(&arguments[0]);
                let failed = self.module.unary(UnaryOp::EqzI32, condition);
                let trap = self.module.unreachable();
                self.current_type = Type::VOID;
                self.module.if_(failed, trap, None, NativeType::None)
            }
            "sizeof" => {
                if type_arguments.len() != 1 {
                    self.error(
                        DiagnosticCode::TypeArgumentMismatch,
                        range,
                        "sizeof expects exactly one type argument",
                    );
                    return self.error_expression(self.usize_type());
                }
                match self.resolve_type_arguments(type_arguments) {
                    Some(types) => {
                        let size = u64::from(types[0].byte_size());
                        self.current_type = self.usize_type();
                        self.make_pointer_constant(size)
                    }
                    None => self.error_expression(self.usize_type()),
                }
            }
            other => {
                self.error(
                    DiagnosticCode::BuiltinMissing,
                    range,
                    format!("unknown builtin '{other}'"),
                );
                self.error_expression(Type::VOID)
            }
        }
    }

    // --- new ------------------------------------------------------------

    fn compile_new(
        &mut self,
        class_expression: &Expression,
        type_arguments: &[TypeNode],
        arguments: &[Expression],
        range: Range,
    ) -> ExprRef {
        let prototype = match class_expression {
            Expression::Identifier { name, .. } => {
                match self
                    .program
                    .resolve_identifier(name, self.current_source, self.current_enum)
                {
                    Some(id)
                        if matches!(
                            self.program.elem(id).data,
                            ElementData::ClassPrototype(_)
                        ) =>
                    {
                        id
                    }
                    _ => {
                        self.error(
                            DiagnosticCode::NotCallable,
                            range,
                            format!("'{name}' does not name a class"),
                        );
                        return self.error_expression(self.usize_type());
                    }
                }
            }
            _ => {
                self.error(
                    DiagnosticCode::NotCallable,
                    range,
                    "'new' expects a class name",
                );
                return self.error_expression(self.usize_type());
            }
        };
        let Some(resolved_args) = self.resolve_type_arguments(type_arguments) else {
            return self.error_expression(self.usize_type());
        };
        let Some(class) = self.program.resolve_class_type_arguments(
            prototype,
            &resolved_args,
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(self.usize_type());
        };
        let class_type = Type::class_type(class, self.options.target);

        // The platform allocator hands out the instance memory.
        let allocate_impl = self.options.allocate_impl.clone();
        let Some(allocator) = self.program.find_function_prototype(&allocate_impl) else {
            self.error(
                DiagnosticCode::BuiltinMissing,
                range,
                format!("allocator '{allocate_impl}' is not present"),
            );
            return self.error_expression(class_type);
        };
        let Some(allocator) = self.program.resolve_using_type_arguments(
            allocator,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(class_type);
        };
        self.compile_function_instance(allocator);
        let allocator_name = self.program.elem(allocator).internal_name.clone();

        let size = self.program.class(class).size.max(1);
        let native = class_type.native_type();
        let temp = self.get_temp_local(class_type);
        let size_expr = self.make_pointer_constant(u64::from(size));
        let allocation = self
            .module
            .call(allocator_name, vec![size_expr], native);
        let tee = self.module.local_tee(temp, allocation, native);
        let mut children = vec![tee];

        // Field initializers store into the fresh instance, base class
        // fields first.
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(id) = current {
            chain.push(id);
            current = self.program.class(id).base;
        }
        for &class_id in chain.iter().rev() {
            for index in 0..self.program.class(class_id).fields.len() {
                let field = &self.program.class(class_id).fields[index];
                let (ty, offset, initializer) = (field.ty, field.offset, field.initializer.clone());
                if let Some(initializer) = initializer {
                    let ptr = self.module.local_get(temp, native);
                    let value =
                        self.compile_expression(&initializer, ty, ConversionKind::Implicit, true);
                    let store = self.module.store(
                        ty.byte_size() as u8,
                        offset,
                        ptr,
                        value,
                        ty.native_type(),
                    );
                    children.push(store);
                }
            }
        }

        match self.program.lookup_constructor(class) {
            Some(constructor) => {
                if let Some(instance) = self.program.resolve_using_type_arguments(
                    constructor,
                    &[],
                    self.options.target,
                    range,
                    &mut self.diagnostics,
                ) {
                    let this = self.module.local_get(temp, native);
                    let call = self.compile_direct_call(instance, Some(this), arguments, range);
                    children.push(call);
                }
            }
            None => {
                if !arguments.is_empty() {
                    self.error(
                        DiagnosticCode::ArityMismatch,
                        range,
                        format!(
                            "class '{}' has no constructor",
                            self.program.class(class).name
                        ),
                    );
                }
            }
        }

        let result = self.module.local_get(temp, native);
        children.push(result);
        self.free_temp_local(temp);
        self.current_type = class_type;
        self.module.block(None, children, native)
    }

    // --- unary ----------------------------------------------------------

    fn compile_unary_prefix(
        &mut self,
        operator: UnaryOperator,
        operand: &Expression,
        contextual: Type,
        wrap: bool,
        range: Range,
    ) -> ExprRef {
        match operator {
            UnaryOperator::Plus => {
                self.compile_expression(operand, contextual, ConversionKind::None, wrap)
            }
            UnaryOperator::Minus => {
                // Negation of a literal folds here so that the minimum
                // signed value is representable.
                match operand {
                    Expression::IntegerLiteral { value, .. } => {
                        self.compile_integer_literal(value.wrapping_neg(), contextual)
                    }
                    Expression::FloatLiteral { value, .. } => {
                        self.compile_float_literal(-value, contextual)
                    }
                    _ => {
                        let compiled =
                            self.compile_expression(operand, contextual, ConversionKind::None, false);
                        let ty = self.current_type;
                        if ty.is_float() {
                            let op = if ty.kind == TypeKind::F32 {
                                UnaryOp::NegF32
                            } else {
                                UnaryOp::NegF64
                            };
                            self.module.unary(op, compiled)
                        } else {
                            let zero = self.zero_of(ty.native_type());
                            let op = if ty.native_type() == NativeType::I64 {
                                BinaryOp::SubI64
                            } else {
                                BinaryOp::SubI32
                            };
                            let negated = self.module.binary(op, zero, compiled);
                            if wrap && ty.is_small_integer() {
                                self.ensure_small_integer_wrap(negated, ty)
                            } else {
                                negated
                            }
                        }
                    }
                }
            }
            UnaryOperator::Not => {
                let compiled =
                    self.compile_expression(operand, Type::VOID, ConversionKind::None, true);
                let ty = self.current_type;
                let truthy = self.make_is_truthy(compiled, ty);
                self.current_type = Type::BOOL;
                self.module.unary(UnaryOp::EqzI32, truthy)
            }
            UnaryOperator::BitwiseNot => {
                let compiled =
                    self.compile_expression(operand, contextual, ConversionKind::None, false);
                let ty = self.current_type;
                if !ty.is_integer() {
                    self.error(
                        DiagnosticCode::OperatorCannotBeApplied,
                        range,
                        format!("operator '~' cannot be applied to type '{ty}'"),
                    );
                    return self.error_expression(contextual);
                }
                let inverted = if ty.native_type() == NativeType::I64 {
                    let ones = self.module.i64_const(-1);
                    self.module.binary(BinaryOp::XorI64, compiled, ones)
                } else {
                    let ones = self.module.i32_const(-1);
                    self.module.binary(BinaryOp::XorI32, compiled, ones)
                };
                if wrap && ty.is_small_integer() {
                    self.ensure_small_integer_wrap(inverted, ty)
                } else {
                    inverted
                }
            }
            UnaryOperator::Increment => {
                self.compile_increment_decrement(operand, true, false, contextual, range)
            }
            UnaryOperator::Decrement => {
                self.compile_increment_decrement(operand, false, false, contextual, range)
            }
        }
    }

    fn compile_unary_postfix(
        &mut self,
        operator: UnaryOperator,
        operand: &Expression,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        match operator {
            UnaryOperator::Increment => {
                self.compile_increment_decrement(operand, true, true, contextual, range)
            }
            UnaryOperator::Decrement => {
                self.compile_increment_decrement(operand, false, true, contextual, range)
            }
            _ => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    range,
                    "unsupported postfix operator",
                );
                self.error_expression(contextual)
            }
        }
    }

    fn compile_increment_decrement(
        &mut self,
        operand: &Expression,
        increment: bool,
        postfix: bool,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        let consumed = !contextual.is_void();
        let current = self.compile_expression(operand, Type::VOID, ConversionKind::None, true);
        let ty = self.current_type;
        let native = ty.native_type();
        let one = match native {
            NativeType::I64 => self.module.i64_const(1),
            NativeType::F32 => self.module.f32_const(1.0),
            NativeType::F64 => self.module.f64_const(1.0),
            _ => self.module.i32_const(1),
        };
        let op = match (native, increment) {
            (NativeType::I64, true) => BinaryOp::AddI64,
            (NativeType::I64, false) => BinaryOp::SubI64,
            (NativeType::F32, true) => BinaryOp::AddF32,
            (NativeType::F32, false) => BinaryOp::SubF32,
            (NativeType::F64, true) => BinaryOp::AddF64,
            (NativeType::F64, false) => BinaryOp::SubF64,
            (_, true) => BinaryOp::AddI32,
            (_, false) => BinaryOp::SubI32,
        };
        if postfix && consumed {
            // The value before the bump is the result: park it in a temp,
            // write back the bumped value, read the temp.
            let temp = self.get_temp_local(ty);
            let parked = self.module.local_tee(temp, current, native);
            let mut bumped = self.module.binary(op, parked, one);
            if ty.is_small_integer() {
                bumped = self.ensure_small_integer_wrap(bumped, ty);
            }
            let assign =
                self.compile_assignment(operand, AssignValue::Compiled(bumped, ty), Type::VOID, range);
            let result = self.module.local_get(temp, native);
            self.free_temp_local(temp);
            self.current_type = ty;
            self.module
                .block(None, [assign, result], native)
        } else {
            let mut bumped = self.module.binary(op, current, one);
            if ty.is_small_integer() {
                bumped = self.ensure_small_integer_wrap(bumped, ty);
            }
            let assign_contextual = if consumed { ty } else { Type::VOID };
            self.compile_assignment(
                operand,
                AssignValue::Compiled(bumped, ty),
                assign_contextual,
                range,
            )
        }
    }

    // --- binary ---------------------------------------------------------

    fn compile_binary(
        &mut self,
        operator: BinaryOperator,
        left: &Expression,
        right: &Expression,
        contextual: Type,
        wrap: bool,
        range: Range,
    ) -> ExprRef {
        use BinaryOperator as B;
        match operator {
            B::LogicalAnd | B::LogicalOr => {
                self.compile_logical(operator, left, right, contextual, range)
            }
            B::Shl | B::Shr | B::ShrU => {
                self.compile_shift(operator, left, right, contextual, wrap, range)
            }
            B::Eq | B::Ne | B::Lt | B::Gt | B::Le | B::Ge => {
                let lexpr = self.compile_expression(left, Type::VOID, ConversionKind::None, true);
                let lty = self.current_type;
                let rexpr = self.compile_expression(right, lty, ConversionKind::None, true);
                let rty = self.current_type;
                let Some(common) = Type::common_compatible(&lty, &rty, self.program) else {
                    self.error(
                        DiagnosticCode::OperatorCannotBeApplied,
                        range,
                        format!("operator cannot be applied to types '{lty}' and '{rty}'"),
                    );
                    return self.error_expression(Type::BOOL);
                };
                let lexpr = self.convert_expression(lexpr, lty, common, true, range);
                let rexpr = self.convert_expression(rexpr, rty, common, true, range);
                let op = comparison_op(operator, &common);
                self.current_type = Type::BOOL;
                self.module.binary(op, lexpr, rexpr)
            }
            B::Add | B::Sub | B::Mul | B::Div | B::Rem | B::BitwiseAnd | B::BitwiseOr
            | B::BitwiseXor => {
                // Division and remainder need normalized operands; the
                // wrap-after family tolerates dirty high bits.
                let operand_wrap = matches!(operator, B::Div | B::Rem);
                let lexpr =
                    self.compile_expression(left, contextual, ConversionKind::None, operand_wrap);
                let lty = self.current_type;
                let rexpr = self.compile_expression(right, lty, ConversionKind::None, operand_wrap);
                let rty = self.current_type;
                let Some(common) = Type::common_compatible(&lty, &rty, self.program) else {
                    self.error(
                        DiagnosticCode::OperatorCannotBeApplied,
                        range,
                        format!("operator cannot be applied to types '{lty}' and '{rty}'"),
                    );
                    return self.error_expression(contextual);
                };
                if common.is_float() {
                    if operator == B::Rem {
                        self.error(
                            DiagnosticCode::ModuloOnFloats,
                            range,
                            "operator '%' cannot be applied to floating-point operands",
                        );
                        return self.error_expression(common);
                    }
                    if matches!(operator, B::BitwiseAnd | B::BitwiseOr | B::BitwiseXor) {
                        self.error(
                            DiagnosticCode::OperatorCannotBeApplied,
                            range,
                            format!("bitwise operator cannot be applied to type '{common}'"),
                        );
                        return self.error_expression(common);
                    }
                }
                let lexpr = self.convert_expression(lexpr, lty, common, true, range);
                let rexpr = self.convert_expression(rexpr, rty, common, true, range);
                let op = arithmetic_op(operator, &common);
                let result = self.module.binary(op, lexpr, rexpr);
                self.current_type = common;
                let needs_wrap = wrap
                    && common.is_small_integer()
                    && matches!(
                        operator,
                        B::Add | B::Sub | B::Mul | B::BitwiseAnd | B::BitwiseOr | B::BitwiseXor
                    );
                if needs_wrap {
                    self.ensure_small_integer_wrap(result, common)
                } else {
                    result
                }
            }
        }
    }

    fn compile_shift(
        &mut self,
        operator: BinaryOperator,
        left: &Expression,
        right: &Expression,
        contextual: Type,
        wrap: bool,
        range: Range,
    ) -> ExprRef {
        use BinaryOperator as B;
        // A right shift reads the operand's high bits; a left shift's
        // result is wrapped after the fact instead.
        let operand_wrap = operator != B::Shl;
        let lexpr = self.compile_expression(left, contextual, ConversionKind::None, operand_wrap);
        let lty = self.current_type;
        if !lty.is_integer() {
            self.error(
                DiagnosticCode::OperatorCannotBeApplied,
                range,
                format!("shift operator cannot be applied to type '{lty}'"),
            );
            return self.error_expression(contextual);
        }
        let rexpr = self.compile_expression(right, lty, ConversionKind::None, true);
        let rty = self.current_type;
        // Shifts take the left operand's type, not the common type.
        let rexpr = self.convert_expression(rexpr, rty, lty, true, range);
        self.current_type = lty;
        let long = lty.native_type() == NativeType::I64;
        let op = match operator {
            B::Shl => {
                if long {
                    BinaryOp::ShlI64
                } else {
                    BinaryOp::ShlI32
                }
            }
            B::Shr => match (long, lty.is_signed_integer()) {
                (true, true) => BinaryOp::ShrSI64,
                (true, false) => BinaryOp::ShrUI64,
                (false, true) => BinaryOp::ShrSI32,
                (false, false) => BinaryOp::ShrUI32,
            },
            _ => {
                if long {
                    BinaryOp::ShrUI64
                } else {
                    BinaryOp::ShrUI32
                }
            }
        };
        let result = self.module.binary(op, lexpr, rexpr);
        if wrap && operator == B::Shl && lty.is_small_integer() {
            self.ensure_small_integer_wrap(result, lty)
        } else {
            result
        }
    }

    fn compile_logical(
        &mut self,
        operator: BinaryOperator,
        left: &Expression,
        right: &Expression,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        let lexpr = self.compile_expression(left, Type::VOID, ConversionKind::None, true);
        let lty = self.current_type;
        let rexpr = self.compile_expression(right, lty, ConversionKind::None, true);
        let rty = self.current_type;
        let Some(common) = Type::common_compatible(&lty, &rty, self.program) else {
            self.error(
                DiagnosticCode::OperatorCannotBeApplied,
                range,
                format!("operator cannot be applied to types '{lty}' and '{rty}'"),
            );
            return self.error_expression(contextual);
        };
        let lexpr = self.convert_expression(lexpr, lty, common, true, range);
        let rexpr = self.convert_expression(rexpr, rty, common, true, range);
        let native = common.native_type();

        // The left value is read twice: once as the condition, once as
        // the preserved result. Clone when side-effect free, tee through
        // a temporary otherwise.
        let (first_read, second_read) = if self.is_side_effect_free(lexpr) {
            let copy = self.module.clone_expression(lexpr);
            (lexpr, copy)
        } else {
            let temp = self.get_and_free_temp_local(common);
            let tee = self.module.local_tee(temp, lexpr, native);
            let reread = self.module.local_get(temp, native);
            (tee, reread)
        };
        let condition = self.make_is_truthy(first_read, common);
        self.current_type = common;
        match operator {
            BinaryOperator::LogicalAnd => {
                self.module.if_(condition, rexpr, Some(second_read), native)
            }
            _ => self.module.if_(condition, second_read, Some(rexpr), native),
        }
    }

    fn is_side_effect_free(&self, expr: ExprRef) -> bool {
        matches!(
            self.module.expr(expr),
            Expr::I32Const(_)
                | Expr::I64Const(_)
                | Expr::F32Const(_)
                | Expr::F64Const(_)
                | Expr::LocalGet { .. }
                | Expr::GlobalGet { .. }
        )
    }

    fn compile_ternary(
        &mut self,
        condition: &Expression,
        if_then: &Expression,
        if_else: &Expression,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        let condition = self.compile_condition(condition);
        if !contextual.is_void() {
            let then_expr =
                self.compile_expression(if_then, contextual, ConversionKind::Implicit, true);
            let else_expr =
                self.compile_expression(if_else, contextual, ConversionKind::Implicit, true);
            self.current_type = contextual;
            return self.module.if_(
                condition,
                then_expr,
                Some(else_expr),
                contextual.native_type(),
            );
        }
        let then_expr = self.compile_expression(if_then, Type::VOID, ConversionKind::None, true);
        let tty = self.current_type;
        let else_expr = self.compile_expression(if_else, tty, ConversionKind::None, true);
        let ety = self.current_type;
        let Some(common) = Type::common_compatible(&tty, &ety, self.program) else {
            self.error(
                DiagnosticCode::OperatorCannotBeApplied,
                range,
                format!("ternary arms have incompatible types '{tty}' and '{ety}'"),
            );
            return self.error_expression(tty);
        };
        let then_expr = self.convert_expression(then_expr, tty, common, true, range);
        let else_expr = self.convert_expression(else_expr, ety, common, true, range);
        self.current_type = common;
        self.module
            .if_(condition, then_expr, Some(else_expr), common.native_type())
    }

    // --- assignment -----------------------------------------------------

    fn assignment_value(&mut self, value: AssignValue, ty: Type, range: Range) -> ExprRef {
        match value {
            AssignValue::Ast(expression) => {
                self.compile_expression(expression, ty, ConversionKind::Implicit, true)
            }
            AssignValue::Compiled(expr, from) => {
                self.convert_expression(expr, from, ty, false, range)
            }
        }
    }

    fn compile_assignment(
        &mut self,
        target: &Expression,
        value: AssignValue,
        contextual: Type,
        range: Range,
    ) -> ExprRef {
        let tee = !contextual.is_void();
        match target {
            Expression::Parenthesized { inner, .. } => {
                self.compile_assignment(inner, value, contextual, range)
            }
            Expression::Identifier { name, .. } => {
                if let Some(scoped) = self.flow.lookup_scoped(name).cloned() {
                    if scoped.is_const || scoped.index < 0 {
                        self.error(
                            DiagnosticCode::CannotAssignToConstant,
                            range,
                            format!("cannot assign to constant '{name}'"),
                        );
                        return self.error_expression(contextual);
                    }
                    let compiled = self.assignment_value(value, scoped.ty, range);
                    let index = scoped.index as u32;
                    return if tee {
                        self.current_type = scoped.ty;
                        self.module
                            .local_tee(index, compiled, scoped.ty.native_type())
                    } else {
                        self.current_type = Type::VOID;
                        self.module.local_set(index, compiled)
                    };
                }
                if let Some((index, ty)) = self.lookup_param(name) {
                    let compiled = self.assignment_value(value, ty, range);
                    return if tee {
                        self.current_type = ty;
                        self.module.local_tee(index, compiled, ty.native_type())
                    } else {
                        self.current_type = Type::VOID;
                        self.module.local_set(index, compiled)
                    };
                }
                match self.program.resolve_identifier(
                    name,
                    self.current_source,
                    self.current_enum,
                ) {
                    Some(id) => self.compile_element_assignment(id, value, tee, range),
                    None => {
                        self.error(
                            DiagnosticCode::UnresolvableIdentifier,
                            range,
                            format!("cannot find name '{name}'"),
                        );
                        self.error_expression(contextual)
                    }
                }
            }
            Expression::PropertyAccess { target: object, property, .. } => {
                if let Some(container) = self.resolve_static_element(object) {
                    return match self.program.resolve_property(container, property) {
                        Some(member) => self.compile_element_assignment(member, value, tee, range),
                        None => {
                            self.error(
                                DiagnosticCode::UnresolvableMember,
                                range,
                                format!("no member '{property}' to assign to"),
                            );
                            self.error_expression(contextual)
                        }
                    };
                }
                self.compile_instance_property_assignment(object, property, value, tee, range)
            }
            Expression::ElementAccess { target: object, index, .. } => {
                self.compile_indexed_assignment(object, index, value, tee, range)
            }
            _ => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    range,
                    "expression is not a valid assignment target",
                );
                self.error_expression(contextual)
            }
        }
    }

    fn compile_element_assignment(
        &mut self,
        id: ElementId,
        value: AssignValue,
        tee: bool,
        range: Range,
    ) -> ExprRef {
        match &self.program.elem(id).data {
            ElementData::Global(_) => {
                if !self.compile_global(id) {
                    return self.error_expression(Type::VOID);
                }
                let element = self.program.elem(id);
                if element.flags.contains(ElementFlags::CONSTANT) {
                    let name = element.simple_name.clone();
                    self.error(
                        DiagnosticCode::CannotAssignToConstant,
                        range,
                        format!("cannot assign to constant '{name}'"),
                    );
                    return self.error_expression(Type::VOID);
                }
                let internal = element.internal_name.clone();
                let ty = match &element.data {
                    ElementData::Global(data) => {
                        data.resolved_type.expect("compiled global without a type")
                    }
                    _ => unreachable!(),
                };
                let compiled = self.assignment_value(value, ty, range);
                let set = self.module.global_set(internal.clone(), compiled);
                if tee {
                    let get = self.module.global_get(internal, ty.native_type());
                    self.current_type = ty;
                    self.module.block(None, [set, get], ty.native_type())
                } else {
                    self.current_type = Type::VOID;
                    set
                }
            }
            ElementData::EnumValue(_) => {
                self.error(
                    DiagnosticCode::CannotAssignToConstant,
                    range,
                    "cannot assign to an enum value",
                );
                self.error_expression(Type::VOID)
            }
            _ => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    range,
                    "element is not a valid assignment target",
                );
                self.error_expression(Type::VOID)
            }
        }
    }

    fn compile_instance_property_assignment(
        &mut self,
        object: &Expression,
        property: &str,
        value: AssignValue,
        tee: bool,
        range: Range,
    ) -> ExprRef {
        let this = self.compile_expression(object, Type::VOID, ConversionKind::None, true);
        let target_type = self.current_type;
        let Some(class) = target_type.class else {
            self.error(
                DiagnosticCode::UnresolvableMember,
                range,
                format!("type '{target_type}' has no member '{property}'"),
            );
            return self.error_expression(Type::VOID);
        };
        if let Some((owner, index)) = self.program.lookup_field(class, property) {
            let field = &self.program.class(owner).fields[index];
            let (ty, offset, readonly) = (field.ty, field.offset, field.readonly);
            if readonly {
                self.error(
                    DiagnosticCode::ReadonlyAssignment,
                    range,
                    format!("cannot assign to readonly field '{property}'"),
                );
                return self.error_expression(Type::VOID);
            }
            let native = ty.native_type();
            let bytes = ty.byte_size() as u8;
            let compiled = self.assignment_value(value, ty, range);
            return if tee {
                let temp = self.get_temp_local(ty);
                let parked = self.module.local_tee(temp, compiled, native);
                let store = self.module.store(bytes, offset, this, parked, native);
                let reread = self.module.local_get(temp, native);
                self.free_temp_local(temp);
                self.current_type = ty;
                self.module.block(None, [store, reread], native)
            } else {
                self.current_type = Type::VOID;
                self.module.store(bytes, offset, this, compiled, native)
            };
        }
        let Some(setter) = self.program.lookup_setter(class, property) else {
            self.error(
                DiagnosticCode::PropertyWithoutSetter,
                range,
                format!("property '{property}' has no setter"),
            );
            return self.error_expression(Type::VOID);
        };
        let Some(setter) = self.program.resolve_using_type_arguments(
            setter,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(Type::VOID);
        };
        self.compile_function_instance(setter);
        let setter_name = self.program.elem(setter).internal_name.clone();
        let value_type = {
            let data = self.program.function_data(setter);
            let signature = self.program.signature(data.signature);
            signature.parameter_types.first().copied().unwrap_or(Type::I32)
        };
        let compiled = self.assignment_value(value, value_type, range);
        if !tee {
            self.current_type = Type::VOID;
            return self
                .module
                .call(setter_name, vec![this, compiled], NativeType::None);
        }
        // Tee form calls the setter, then the getter; the receiver is
        // evaluated once and shared through a temp when it has side
        // effects.
        let Some(getter) = self.program.lookup_getter(class, property) else {
            self.error(
                DiagnosticCode::PropertyWithoutSetter,
                range,
                format!("property '{property}' has no getter to produce the assigned value"),
            );
            return self.error_expression(Type::VOID);
        };
        let Some(getter) = self.program.resolve_using_type_arguments(
            getter,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(Type::VOID);
        };
        self.compile_function_instance(getter);
        let getter_name = self.program.elem(getter).internal_name.clone();
        let getter_type = {
            let data = self.program.function_data(getter);
            self.program.signature(data.signature).return_type
        };
        let object_native = target_type.native_type();
        let (first_this, second_this) = if self.is_side_effect_free(this) {
            let copy = self.module.clone_expression(this);
            (this, copy)
        } else {
            let temp = self.get_and_free_temp_local(target_type);
            let tee_this = self.module.local_tee(temp, this, object_native);
            let reread = self.module.local_get(temp, object_native);
            (tee_this, reread)
        };
        let set_call = self
            .module
            .call(setter_name, vec![first_this, compiled], NativeType::None);
        let get_call = self
            .module
            .call(getter_name, vec![second_this], getter_type.native_type());
        self.current_type = getter_type;
        self.module
            .block(None, [set_call, get_call], getter_type.native_type())
    }

    fn compile_indexed_assignment(
        &mut self,
        object: &Expression,
        index: &Expression,
        value: AssignValue,
        tee: bool,
        range: Range,
    ) -> ExprRef {
        let this = self.compile_expression(object, Type::VOID, ConversionKind::None, true);
        let target_type = self.current_type;
        let Some(class) = target_type.class else {
            self.error(
                DiagnosticCode::MissingIndexedAccess,
                range,
                format!("type '{target_type}' has no '[]=' operator"),
            );
            return self.error_expression(Type::VOID);
        };
        let Some(setter) = self.program.lookup_indexed_set(class) else {
            self.error(
                DiagnosticCode::MissingIndexedAccess,
                range,
                format!(
                    "class '{}' has no '[]=' operator",
                    self.program.class(class).name
                ),
            );
            return self.error_expression(Type::VOID);
        };
        let Some(setter) = self.program.resolve_using_type_arguments(
            setter,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(Type::VOID);
        };
        self.compile_function_instance(setter);
        let setter_name = self.program.elem(setter).internal_name.clone();
        let (index_type, value_type) = {
            let data = self.program.function_data(setter);
            let signature = self.program.signature(data.signature);
            (
                signature.parameter_types.first().copied().unwrap_or(Type::I32),
                signature.parameter_types.get(1).copied().unwrap_or(Type::I32),
            )
        };
        let index_expr = self.compile_expression(index, index_type, ConversionKind::Implicit, true);
        let compiled = self.assignment_value(value, value_type, range);
        if !tee {
            self.current_type = Type::VOID;
            return self.module.call(
                setter_name,
                vec![this, index_expr, compiled],
                NativeType::None,
            );
        }
        // Tee form re-reads through the `[]` operator with identical
        // operands.
        let Some(getter) = self.program.lookup_indexed_get(class) else {
            self.error(
                DiagnosticCode::MissingIndexedAccess,
                range,
                format!(
                    "class '{}' has no '[]' operator to produce the assigned value",
                    self.program.class(class).name
                ),
            );
            return self.error_expression(Type::VOID);
        };
        let Some(getter) = self.program.resolve_using_type_arguments(
            getter,
            &[],
            self.options.target,
            range,
            &mut self.diagnostics,
        ) else {
            return self.error_expression(Type::VOID);
        };
        self.compile_function_instance(getter);
        let getter_name = self.program.elem(getter).internal_name.clone();
        let getter_type = {
            let data = self.program.function_data(getter);
            self.program.signature(data.signature).return_type
        };
        let object_native = target_type.native_type();
        let index_native = index_type.native_type();
        let object_temp = self.get_temp_local(target_type);
        let index_temp = self.get_temp_local(index_type);
        let object_tee = self.module.local_tee(object_temp, this, object_native);
        let index_tee = self.module.local_tee(index_temp, index_expr, index_native);
        let set_call = self.module.call(
            setter_name,
            vec![object_tee, index_tee, compiled],
            NativeType::None,
        );
        let object_reread = self.module.local_get(object_temp, object_native);
        let index_reread = self.module.local_get(index_temp, index_native);
        let get_call = self.module.call(
            getter_name,
            vec![object_reread, index_reread],
            getter_type.native_type(),
        );
        self.free_temp_local(object_temp);
        self.free_temp_local(index_temp);
        self.current_type = getter_type;
        self.module
            .block(None, [set_call, get_call], getter_type.native_type())
    }
}

fn comparison_op(operator: BinaryOperator, ty: &Type) -> BinaryOp {
    use BinaryOperator as B;
    let signed = ty.is_signed_integer();
    match ty.native_type() {
        NativeType::I64 => match (operator, signed) {
            (B::Eq, _) => BinaryOp::EqI64,
            (B::Ne, _) => BinaryOp::NeI64,
            (B::Lt, true) => BinaryOp::LtSI64,
            (B::Lt, false) => BinaryOp::LtUI64,
            (B::Le, true) => BinaryOp::LeSI64,
            (B::Le, false) => BinaryOp::LeUI64,
            (B::Gt, true) => BinaryOp::GtSI64,
            (B::Gt, false) => BinaryOp::GtUI64,
            (B::Ge, true) => BinaryOp::GeSI64,
            (B::Ge, false) => BinaryOp::GeUI64,
            _ => unreachable!("not a comparison operator"),
        },
        NativeType::F32 => match operator {
            B::Eq => BinaryOp::EqF32,
            B::Ne => BinaryOp::NeF32,
            B::Lt => BinaryOp::LtF32,
            B::Le => BinaryOp::LeF32,
            B::Gt => BinaryOp::GtF32,
            B::Ge => BinaryOp::GeF32,
            _ => unreachable!("not a comparison operator"),
        },
        NativeType::F64 => match operator {
            B::Eq => BinaryOp::EqF64,
            B::Ne => BinaryOp::NeF64,
            B::Lt => BinaryOp::LtF64,
            B::Le => BinaryOp::LeF64,
            B::Gt => BinaryOp::GtF64,
            B::Ge => BinaryOp::GeF64,
            _ => unreachable!("not a comparison operator"),
        },
        _ => match (operator, signed) {
            (B::Eq, _) => BinaryOp::EqI32,
            (B::Ne, _) => BinaryOp::NeI32,
            (B::Lt, true) => BinaryOp::LtSI32,
            (B::Lt, false) => BinaryOp::LtUI32,
            (B::Le, true) => BinaryOp::LeSI32,
            (B::Le, false) => BinaryOp::LeUI32,
            (B::Gt, true) => BinaryOp::GtSI32,
            (B::Gt, false) => BinaryOp::GtUI32,
            (B::Ge, true) => BinaryOp::GeSI32,
            (B::Ge, false) => BinaryOp::GeUI32,
            _ => unreachable!("not a comparison operator"),
        },
    }
}

fn arithmetic_op(operator: BinaryOperator, ty: &Type) -> BinaryOp {
    use BinaryOperator as B;
    let signed = ty.is_signed_integer();
    match ty.native_type() {
        NativeType::I64 => match (operator, signed) {
            (B::Add, _) => BinaryOp::AddI64,
            (B::Sub, _) => BinaryOp::SubI64,
            (B::Mul, _) => BinaryOp::MulI64,
            (B::Div, true) => BinaryOp::DivSI64,
            (B::Div, false) => BinaryOp::DivUI64,
            (B::Rem, true) => BinaryOp::RemSI64,
            (B::Rem, false) => BinaryOp::RemUI64,
            (B::BitwiseAnd, _) => BinaryOp::AndI64,
            (B::BitwiseOr, _) => BinaryOp::OrI64,
            (B::BitwiseXor, _) => BinaryOp::XorI64,
            _ => unreachable!("not an arithmetic operator"),
        },
        NativeType::F32 => match operator {
            B::Add => BinaryOp::AddF32,
            B::Sub => BinaryOp::SubF32,
            B::Mul => BinaryOp::MulF32,
            B::Div => BinaryOp::DivF32,
            _ => unreachable!("not a float operator"),
        },
        NativeType::F64 => match operator {
            B::Add => BinaryOp::AddF64,
            B::Sub => BinaryOp::SubF64,
            B::Mul => BinaryOp::MulF64,
            B::Div => BinaryOp::DivF64,
            _ => unreachable!("not a float operator"),
        },
        _ => match (operator, signed) {
            (B::Add, _) => BinaryOp::AddI32,
            (B::Sub, _) => BinaryOp::SubI32,
            (B::Mul, _) => BinaryOp::MulI32,
            (B::Div, true) => BinaryOp::DivSI32,
            (B::Div, false) => BinaryOp::DivUI32,
            (B::Rem, true) => BinaryOp::RemSI32,
            (B::Rem, false) => BinaryOp::RemUI32,
            (B::BitwiseAnd, _) => BinaryOp::AndI32,
            (B::BitwiseOr, _) => BinaryOp::OrI32,
            (B::BitwiseXor, _) => BinaryOp::XorI32,
            _ => unreachable!("not an arithmetic operator"),
        },
    }
}
