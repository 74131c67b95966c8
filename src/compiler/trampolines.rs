//! Trampoline synthesis for calls that omit optional arguments.
//!
//! A trampoline shares the original's parameter list plus one trailing
//! i32 telling how many optional arguments the caller actually provided.
//! Its body is a nested block structure acting as a jump table: landing
//! at depth N executes the default initializers for the parameters the
//! caller left out, then calls the original with the fully filled vector.

use log::trace;

use crate::module::{BinaryOp, ExprRef, NativeType};
use crate::program::{ElementData, ElementFlags, ElementId, Local};
use crate::types::{Signature, Type};

use super::{Compiler, ConversionKind};

impl Compiler<'_> {
    /// Returns the trampoline for `original`, synthesizing it on first
    /// use. The trampoline is cached on the function element.
    pub(crate) fn ensure_trampoline(&mut self, original: ElementId) -> ElementId {
        if let Some(trampoline) = self.program.function_data(original).trampoline {
            return trampoline;
        }
        self.compile_function_instance(original);

        let (signature, class, prototype) = {
            let data = self.program.function_data(original);
            (
                self.program.signature(data.signature).clone(),
                data.class,
                data.prototype,
            )
        };
        let internal = self.program.elem(original).internal_name.clone();
        let trampoline_name = format!("{internal}|trampoline");
        trace!("synthesizing trampoline {trampoline_name}");

        let declaration = prototype.map(|proto| match &self.program.elem(proto).data {
            ElementData::FunctionPrototype(data) => data.declaration.clone(),
            _ => panic!("prototype element is not a function prototype"),
        });

        let required = signature.required_parameters;
        let optional_count = signature.parameter_types.len() - required;
        assert!(optional_count > 0, "trampoline for a function without optional parameters");

        let mut parameter_types = signature.parameter_types.clone();
        parameter_types.push(Type::I32);
        let mut parameter_names = signature.parameter_names.clone();
        parameter_names.push("numOptional".into());
        let trampoline_signature = self.program.add_signature(Signature {
            this_type: signature.this_type,
            parameter_types: parameter_types.clone(),
            parameter_names,
            return_type: signature.return_type,
            required_parameters: parameter_types.len(),
            has_rest: false,
        });

        let this_offset = usize::from(signature.this_type.is_some());
        let mut locals = Vec::with_capacity(parameter_types.len() + this_offset);
        let mut index = 0i32;
        if let Some(this) = signature.this_type {
            locals.push(Local {
                name: "this".into(),
                index,
                ty: this,
                constant_value: None,
            });
            index += 1;
        }
        for (ty, name) in parameter_types.iter().zip(
            signature
                .parameter_names
                .iter()
                .map(String::as_str)
                .chain(["numOptional"]),
        ) {
            locals.push(Local {
                name: name.to_string(),
                index,
                ty: *ty,
                constant_value: None,
            });
            index += 1;
        }
        let trampoline =
            self.program
                .add_synthetic_function(trampoline_name.clone(), trampoline_signature, locals, class);
        self.program.function_data_mut(original).trampoline = Some(trampoline);

        // Default initializers compile in the trampoline's own scope so
        // they see `this` and may introduce locals.
        let ctx = self.enter_context(trampoline);

        let count_index = (this_offset + signature.parameter_types.len()) as u32;
        let label = |provided: usize| format!("{provided}of{optional_count}|{trampoline_name}");

        let mut children: Vec<ExprRef> = Vec::with_capacity(optional_count + 2);
        for provided in 0..optional_count {
            let count = self.module.local_get(count_index, NativeType::I32);
            let expected = self.module.i32_const(provided as i32);
            let matches = self.module.binary(BinaryOp::EqI32, count, expected);
            let jump = self.module.br(label(provided), Some(matches));
            children.push(jump);
        }
        let all_provided = self.module.br(label(optional_count), None);
        children.push(all_provided);

        for missing in 0..optional_count {
            let wrapper = self
                .module
                .block(Some(label(missing)), children, NativeType::None);
            children = vec![wrapper];
            let parameter_index = required + missing;
            let ty = signature.parameter_types[parameter_index];
            let value = match declaration
                .as_ref()
                .and_then(|d| d.parameters[parameter_index].initializer.clone())
            {
                Some(initializer) => {
                    self.compile_expression(&initializer, ty, ConversionKind::Implicit, true)
                }
                None => self.zero_of(ty.native_type()),
            };
            let slot = (this_offset + parameter_index) as u32;
            let fill = self.module.local_set(slot, value);
            children.push(fill);
        }
        let done = self
            .module
            .block(Some(label(optional_count)), children, NativeType::None);
        children = vec![done];

        let full_arity = this_offset + signature.parameter_types.len();
        let mut operands = Vec::with_capacity(full_arity);
        for slot in 0..full_arity {
            let ty = self.program.function_data(trampoline).locals[slot]
                .ty
                .native_type();
            let get = self.module.local_get(slot as u32, ty);
            operands.push(get);
        }
        let return_native = signature.return_type.native_type();
        let call = self.module.call(internal, operands, return_native);
        if signature.return_type.is_void() {
            children.push(call);
        } else {
            let ret = self.module.ret(Some(call));
            children.push(ret);
        }
        self.leave_context(ctx);

        let mut params = signature.native_params();
        params.push(NativeType::I32);
        let type_name = self.module.add_function_type(&params, return_native);
        let extra_locals: Vec<NativeType> = {
            let data = self.program.function_data(trampoline);
            data.locals[data.param_count..]
                .iter()
                .map(|l| l.ty.native_type())
                .collect()
        };
        let body = self.module.block(None, children, return_native);
        self.module
            .add_function(trampoline_name, type_name, extra_locals, body);
        self.program.elem_mut(trampoline).flags |= ElementFlags::COMPILED;
        trampoline
    }
}
