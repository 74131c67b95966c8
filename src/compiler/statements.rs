//! Statement lowering.
//!
//! Every handler keeps the flow analyzer honest: it pushes the frames the
//! construct owns, merges the child flags the construct propagates, and
//! emits the label-addressed block/loop structure the break and continue
//! lowerings target.

use crate::ast::{
    DeclarationFlags, Statement, SwitchCase, VariableStatement,
};
use crate::diagnostics::DiagnosticCode;
use crate::module::{BinaryOp, ExprRef, NativeType};
use crate::types::Type;

use super::flow::{FlowFlags, ScopedLocal};
use super::{Compiler, ConversionKind};

impl Compiler<'_> {
    pub(crate) fn compile_statement(&mut self, statement: &Statement) -> ExprRef {
        let compiled = match statement {
            Statement::Block { statements, .. } => self.compile_block(statements),
            Statement::Break { label, range } => {
                if label.is_some() {
                    self.error(
                        DiagnosticCode::LabelsNotSupported,
                        *range,
                        "labeled break is not supported",
                    );
                    return self.module.unreachable();
                }
                match self.flow.break_label().map(str::to_string) {
                    Some(target) => {
                        self.flow.set(FlowFlags::POSSIBLY_BREAKS);
                        self.module.br(target, None)
                    }
                    None => {
                        self.error(
                            DiagnosticCode::BreakOutsideLoop,
                            *range,
                            "'break' is only allowed inside a loop or switch",
                        );
                        self.module.unreachable()
                    }
                }
            }
            Statement::Continue { label, range } => {
                if label.is_some() {
                    self.error(
                        DiagnosticCode::LabelsNotSupported,
                        *range,
                        "labeled continue is not supported",
                    );
                    return self.module.unreachable();
                }
                match self.flow.continue_label().map(str::to_string) {
                    Some(target) => {
                        self.flow.set(FlowFlags::POSSIBLY_CONTINUES);
                        self.module.br(target, None)
                    }
                    None => {
                        self.error(
                            DiagnosticCode::ContinueOutsideLoop,
                            *range,
                            "'continue' is only allowed inside a loop",
                        );
                        self.module.unreachable()
                    }
                }
            }
            Statement::Do { body, condition, .. } => self.compile_do(body, condition),
            Statement::Empty { .. } => self.module.nop(),
            Statement::Expression { expression, .. } => {
                self.compile_expression(expression, Type::VOID, ConversionKind::Implicit, false)
            }
            Statement::For { initializer, condition, incrementor, body, .. } => {
                self.compile_for(
                    initializer.as_deref(),
                    condition.as_ref(),
                    incrementor.as_ref(),
                    body,
                )
            }
            Statement::If { condition, if_true, if_false, .. } => {
                self.compile_if(condition, if_true, if_false.as_deref())
            }
            Statement::Return { value, range } => {
                self.flow.set(FlowFlags::RETURNS);
                let return_type = self.current_signature().return_type;
                match value {
                    Some(value) if !return_type.is_void() => {
                        let compiled = self.compile_expression(
                            value,
                            return_type,
                            ConversionKind::Implicit,
                            true,
                        );
                        self.module.ret(Some(compiled))
                    }
                    Some(value) => {
                        // Value in a void function: evaluate, drop, return.
                        let dropped = self.compile_expression(
                            value,
                            Type::VOID,
                            ConversionKind::Implicit,
                            false,
                        );
                        let ret = self.module.ret(None);
                        self.module.block(None, [dropped, ret], NativeType::None)
                    }
                    None => {
                        if !return_type.is_void() {
                            self.error(
                                DiagnosticCode::FunctionMustReturn,
                                *range,
                                format!("a value of type '{return_type}' must be returned"),
                            );
                        }
                        self.module.ret(None)
                    }
                }
            }
            Statement::Switch { condition, cases, .. } => self.compile_switch(condition, cases),
            Statement::Throw { .. } => {
                // No exception model yet: a throw traps and, for flow
                // purposes, never falls through.
                self.flow
                    .set(FlowFlags::POSSIBLY_THROWS | FlowFlags::RETURNS);
                self.module.unreachable()
            }
            Statement::Try { range } => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    *range,
                    "try/catch/finally is not supported",
                );
                self.module.unreachable()
            }
            Statement::While { condition, body, .. } => self.compile_while(condition, body),
            Statement::Variable(decl) => self.compile_local_variables(decl),
            other => {
                self.error(
                    DiagnosticCode::OperationNotSupported,
                    other.range(),
                    "declarations are not supported inside function bodies",
                );
                self.module.unreachable()
            }
        };
        if self.options.source_map {
            let name = self
                .program
                .elem(self.current_function)
                .internal_name
                .clone();
            self.module
                .add_debug_location(name, compiled, statement.range());
        }
        compiled
    }

    fn compile_block(&mut self, statements: &[Statement]) -> ExprRef {
        self.flow.enter_scope();
        let children: Vec<ExprRef> = statements
            .iter()
            .map(|s| self.compile_statement(s))
            .collect();
        let flags = self.flow.leave();
        // Breaks and continues bubble up to the construct that binds
        // their label; returns propagate directly.
        self.flow.inherit(flags);
        self.module.block(None, children, NativeType::None)
    }

    fn compile_if(
        &mut self,
        condition: &crate::ast::Expression,
        if_true: &Statement,
        if_false: Option<&Statement>,
    ) -> ExprRef {
        let condition = self.compile_condition(condition);

        self.flow.enter_scope();
        let then_expr = self.compile_statement(if_true);
        let then_flags = self.flow.leave();

        let (else_expr, else_flags) = match if_false {
            Some(if_false) => {
                self.flow.enter_scope();
                let compiled = self.compile_statement(if_false);
                (Some(compiled), self.flow.leave())
            }
            None => (None, FlowFlags::empty()),
        };

        // Only when both arms return does the conditional as a whole.
        let both_return = then_flags & else_flags & FlowFlags::RETURNS;
        let possibly = (then_flags | else_flags)
            & (FlowFlags::POSSIBLY_BREAKS
                | FlowFlags::POSSIBLY_CONTINUES
                | FlowFlags::POSSIBLY_THROWS);
        self.flow.inherit(both_return | possibly);

        self.module
            .if_(condition, then_expr, else_expr, NativeType::None)
    }

    fn compile_while(&mut self, condition: &crate::ast::Expression, body: &Statement) -> ExprRef {
        let id = self.next_label_id();
        let break_label = format!("break|{id}");
        let continue_label = format!("continue|{id}");
        self.flow
            .enter_loop(break_label.clone(), continue_label.clone());

        let condition = self.compile_condition(condition);
        let exit_condition = self.module.unary(crate::module::UnaryOp::EqzI32, condition);
        let exit = self.module.br(break_label.clone(), Some(exit_condition));
        let body = self.compile_statement(body);
        let repeat = self.module.br(continue_label.clone(), None);

        let flags = self.flow.leave();
        // The body may never run; only throws escape the loop's flags.
        self.flow.inherit(flags & FlowFlags::POSSIBLY_THROWS);

        let loop_body = self
            .module
            .block(None, [exit, body, repeat], NativeType::None);
        let looped = self.module.loop_(Some(continue_label), loop_body);
        self.module
            .block(Some(break_label), [looped], NativeType::None)
    }

    fn compile_do(&mut self, body: &Statement, condition: &crate::ast::Expression) -> ExprRef {
        let id = self.next_label_id();
        let break_label = format!("break|{id}");
        let continue_label = format!("continue|{id}");
        self.flow
            .enter_loop(break_label.clone(), continue_label.clone());

        let body = self.compile_statement(body);
        let condition = self.compile_condition(condition);
        let repeat = self.module.br(continue_label.clone(), Some(condition));

        let flags = self.flow.leave();
        // The body runs at least once, so it shares its returns with the
        // enclosing scope.
        self.flow
            .inherit(flags & (FlowFlags::RETURNS | FlowFlags::POSSIBLY_THROWS));

        let loop_body = self.module.block(None, [body, repeat], NativeType::None);
        let looped = self.module.loop_(Some(continue_label), loop_body);
        self.module
            .block(Some(break_label), [looped], NativeType::None)
    }

    fn compile_for(
        &mut self,
        initializer: Option<&Statement>,
        condition: Option<&crate::ast::Expression>,
        incrementor: Option<&crate::ast::Expression>,
        body: &Statement,
    ) -> ExprRef {
        // The initializer gets a scope of its own so its locals cover the
        // whole loop.
        self.flow.enter_scope();
        let initializer = initializer.map(|s| self.compile_statement(s));

        let id = self.next_label_id();
        let break_label = format!("break|{id}");
        let continue_label = format!("continue|{id}");
        self.flow
            .enter_loop(break_label.clone(), continue_label.clone());

        let exit = condition.map(|condition| {
            let condition = self.compile_condition(condition);
            let exit_condition = self.module.unary(crate::module::UnaryOp::EqzI32, condition);
            self.module.br(break_label.clone(), Some(exit_condition))
        });
        let body = self.compile_statement(body);
        let incrementor = incrementor.map(|incrementor| {
            self.compile_expression(incrementor, Type::VOID, ConversionKind::Implicit, false)
        });
        let repeat = self.module.br(continue_label.clone(), None);

        let flags = self.flow.leave();
        // An omitted condition makes the loop always-true: its body is
        // guaranteed to run and its returns count.
        let mut inherited = flags & FlowFlags::POSSIBLY_THROWS;
        if condition.is_none() {
            inherited |= flags & FlowFlags::RETURNS;
        }
        self.flow.inherit(inherited);

        let mut loop_children = Vec::with_capacity(4);
        loop_children.extend(exit);
        loop_children.push(body);
        loop_children.extend(incrementor);
        loop_children.push(repeat);
        let loop_body = self.module.block(None, loop_children, NativeType::None);
        let looped = self.module.loop_(Some(continue_label), loop_body);

        let scope_flags = self.flow.leave();
        self.flow.inherit(scope_flags);

        let mut children = Vec::with_capacity(2);
        children.extend(initializer);
        let inner = self
            .module
            .block(Some(break_label), [looped], NativeType::None);
        children.push(inner);
        self.module.block(None, children, NativeType::None)
    }

    fn compile_switch(
        &mut self,
        condition: &crate::ast::Expression,
        cases: &[SwitchCase],
    ) -> ExprRef {
        let condition = self.compile_expression(condition, Type::I32, ConversionKind::Implicit, true);
        let id = self.next_label_id();
        let break_label = format!("break|{id}");
        let case_label = |index: usize| format!("case{index}|{id}");

        // A temporary holds the tested value across the per-case
        // comparisons.
        let temp = self.get_temp_local(Type::I32);
        let mut selector: Vec<ExprRef> = Vec::with_capacity(cases.len() + 2);
        let set = self.module.local_set(temp, condition);
        selector.push(set);
        let mut default_index = None;
        for (index, case) in cases.iter().enumerate() {
            match &case.label {
                Some(label) => {
                    let label =
                        self.compile_expression(label, Type::I32, ConversionKind::Implicit, true);
                    let tested = self.module.local_get(temp, NativeType::I32);
                    let matches = self.module.binary(BinaryOp::EqI32, tested, label);
                    let jump = self.module.br(case_label(index), Some(matches));
                    selector.push(jump);
                }
                None => default_index = Some(index),
            }
        }
        let fallback = match default_index {
            Some(index) => case_label(index),
            None => break_label.clone(),
        };
        let jump = self.module.br(fallback, None);
        selector.push(jump);

        // Wrap outwards: each case body lands after the block carrying
        // its label, falling through into the next case.
        let mut children = selector;
        let mut case_flags = Vec::with_capacity(cases.len());
        for (index, case) in cases.iter().enumerate() {
            let inner = self
                .module
                .block(Some(case_label(index)), children, NativeType::None);
            children = vec![inner];
            self.flow.enter_break_context(break_label.clone());
            for statement in &case.statements {
                let compiled = self.compile_statement(statement);
                children.push(compiled);
            }
            case_flags.push(self.flow.leave());
        }
        self.free_temp_local(temp);

        // With a default present, the switch returns when no case can
        // escape without returning: every body either returns or falls
        // through, and the final body returns.
        let has_default = default_index.is_some();
        let all_paths_return = has_default
            && case_flags.iter().all(|f| {
                f.contains(FlowFlags::RETURNS) || !f.contains(FlowFlags::POSSIBLY_BREAKS)
            })
            && case_flags
                .last()
                .is_some_and(|f| f.contains(FlowFlags::RETURNS));
        if all_paths_return {
            self.flow.set(FlowFlags::RETURNS);
        }
        let throws = case_flags
            .iter()
            .fold(FlowFlags::empty(), |acc, f| acc | *f)
            & FlowFlags::POSSIBLY_THROWS;
        self.flow.inherit(throws);

        self.module
            .block(Some(break_label), children, NativeType::None)
    }

    fn compile_local_variables(&mut self, statement: &VariableStatement) -> ExprRef {
        let is_const = statement.flags.contains(DeclarationFlags::CONST);
        let mut initializers: Vec<ExprRef> = Vec::new();
        for decl in &statement.declarations {
            let contextual_args = self
                .program
                .function_data(self.current_function)
                .type_arguments
                .clone();
            let annotated = match &decl.type_annotation {
                Some(node) => {
                    match self.program.resolve_type(
                        node,
                        Some(&contextual_args),
                        self.options.target,
                        &mut self.diagnostics,
                    ) {
                        Some(ty) => Some(ty),
                        None => continue,
                    }
                }
                None => None,
            };

            let compiled = match &decl.initializer {
                Some(init) => {
                    let contextual = annotated.unwrap_or(Type::VOID);
                    let kind = if annotated.is_some() {
                        ConversionKind::Implicit
                    } else {
                        ConversionKind::None
                    };
                    Some(self.compile_expression(init, contextual, kind, true))
                }
                None => None,
            };
            let ty = match annotated {
                Some(ty) => ty,
                None if compiled.is_some() => {
                    if self.current_type.is_void() {
                        self.error(
                            DiagnosticCode::CannotInferType,
                            decl.range,
                            format!("cannot infer a type for '{}'", decl.name),
                        );
                        continue;
                    }
                    self.current_type
                }
                None => {
                    self.error(
                        DiagnosticCode::CannotInferType,
                        decl.range,
                        format!("'{}' needs a type annotation or an initializer", decl.name),
                    );
                    continue;
                }
            };

            // A foldable const initializer produces a virtual local: no
            // slot, reads expand to the literal.
            if is_const {
                if let Some(compiled) = compiled {
                    if let Some(constant) = self.precompute(compiled) {
                        let value = super::constant_to_value(constant);
                        let added = self.flow.add_scoped_local(
                            decl.name.clone(),
                            ScopedLocal {
                                index: -1,
                                ty,
                                constant_value: Some(value),
                                is_const: true,
                            },
                        );
                        if !added {
                            self.error(
                                DiagnosticCode::DuplicateName,
                                decl.range,
                                format!("duplicate local '{}'", decl.name),
                            );
                        }
                        continue;
                    }
                }
            }

            let index = self.add_local(decl.name.clone(), ty);
            let added = self.flow.add_scoped_local(
                decl.name.clone(),
                ScopedLocal {
                    index: index as i32,
                    ty,
                    constant_value: None,
                    is_const,
                },
            );
            if !added {
                self.error(
                    DiagnosticCode::DuplicateName,
                    decl.range,
                    format!("duplicate local '{}'", decl.name),
                );
                continue;
            }
            if let Some(compiled) = compiled {
                let set = self.module.local_set(index, compiled);
                initializers.push(set);
            }
        }
        match initializers.len() {
            0 => self.module.nop(),
            1 => initializers[0],
            _ => self.module.block(None, initializers, NativeType::None),
        }
    }
}
