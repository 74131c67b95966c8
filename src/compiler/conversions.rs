//! The numeric bridge: small-integer wrapping, truthiness and the
//! conversion matrix.
//!
//! Sub-word integers live in i32 slots with possibly dirty high bits
//! after arithmetic. Whoever produces such a value either normalizes it
//! (shift pairs for signed, masks for unsigned) or hands the obligation
//! to a consumer that wraps anyway; the `wrap` flag threaded through
//! expression lowering carries that decision.

use crate::ast::{Expression, Range};
use crate::diagnostics::DiagnosticCode;
use crate::module::{BinaryOp, ExprRef, NativeType, UnaryOp};
use crate::types::{Type, TypeKind};

use super::{Compiler, ConversionKind};

impl Compiler<'_> {
    /// Normalizes a small-integer value: sign-extends i8/i16 via a shift
    /// pair, masks u8/u16/bool.
    pub(crate) fn ensure_small_integer_wrap(&mut self, expr: ExprRef, ty: Type) -> ExprRef {
        match ty.kind {
            TypeKind::I8 => self.wrap_shift(expr, 24),
            TypeKind::I16 => self.wrap_shift(expr, 16),
            TypeKind::U8 => self.wrap_mask(expr, 0xff),
            TypeKind::U16 => self.wrap_mask(expr, 0xffff),
            TypeKind::Bool => self.wrap_mask(expr, 0x1),
            _ => expr,
        }
    }

    fn wrap_shift(&mut self, expr: ExprRef, bits: i32) -> ExprRef {
        let amount = self.module.i32_const(bits);
        let shifted = self.module.binary(BinaryOp::ShlI32, expr, amount);
        let amount = self.module.i32_const(bits);
        self.module.binary(BinaryOp::ShrSI32, shifted, amount)
    }

    fn wrap_mask(&mut self, expr: ExprRef, mask: i32) -> ExprRef {
        let mask = self.module.i32_const(mask);
        self.module.binary(BinaryOp::AndI32, expr, mask)
    }

    /// Reduces a value to an i32 condition: non-zero means taken.
    pub(crate) fn make_is_truthy(&mut self, expr: ExprRef, ty: Type) -> ExprRef {
        match ty.native_type() {
            NativeType::I64 => {
                let zero = self.module.i64_const(0);
                self.module.binary(BinaryOp::NeI64, expr, zero)
            }
            NativeType::F32 => {
                let zero = self.module.f32_const(0.0);
                self.module.binary(BinaryOp::NeF32, expr, zero)
            }
            NativeType::F64 => {
                let zero = self.module.f64_const(0.0);
                self.module.binary(BinaryOp::NeF64, expr, zero)
            }
            _ => expr,
        }
    }

    /// Compiles a statement or operator condition down to an i32 truth
    /// value.
    pub(crate) fn compile_condition(&mut self, expr: &Expression) -> ExprRef {
        let compiled = self.compile_expression(expr, Type::I32, ConversionKind::None, true);
        let ty = self.current_type;
        self.make_is_truthy(compiled, ty)
    }

    /// Inserts the conversion from `from` to `to`. Implicit conversions
    /// additionally check assignability and report, but still emit so the
    /// outer analysis can continue. Sets `currentType` to `to`.
    pub(crate) fn convert_expression(
        &mut self,
        expr: ExprRef,
        from: Type,
        to: Type,
        explicit: bool,
        range: Range,
    ) -> ExprRef {
        if from == to {
            self.current_type = to;
            return expr;
        }
        if from.is_void() {
            self.error(
                DiagnosticCode::UnexpectedVoid,
                range,
                "an expression of type 'void' cannot be converted",
            );
            return self.error_expression(to);
        }
        if to.is_void() {
            self.current_type = Type::VOID;
            return self.module.drop_(expr);
        }
        // Literal constants narrow silently; they wrap to the target
        // representation instead of flagging the site.
        if !explicit
            && !from.is_assignable_to(&to, self.program)
            && self.module.constant_value(expr).is_none()
        {
            self.error(
                DiagnosticCode::TypeNotAssignable,
                range,
                format!("type '{from}' is not assignable to type '{to}'"),
            );
        }
        self.current_type = to;

        if from.is_float() {
            if to.is_float() {
                return if from.size < to.size {
                    self.module.unary(UnaryOp::PromoteF32, expr)
                } else {
                    self.module.unary(UnaryOp::DemoteF64, expr)
                };
            }
            // float to int: truncate with the target's signedness and
            // width, then normalize small targets.
            let op = match (from.size, to.is_long_integer(), to.is_signed_integer()) {
                (32, false, true) => UnaryOp::TruncSF32ToI32,
                (32, false, false) => UnaryOp::TruncUF32ToI32,
                (32, true, true) => UnaryOp::TruncSF32ToI64,
                (32, true, false) => UnaryOp::TruncUF32ToI64,
                (_, false, true) => UnaryOp::TruncSF64ToI32,
                (_, false, false) => UnaryOp::TruncUF64ToI32,
                (_, true, true) => UnaryOp::TruncSF64ToI64,
                (_, true, false) => UnaryOp::TruncUF64ToI64,
            };
            let truncated = self.module.unary(op, expr);
            return self.ensure_small_integer_wrap(truncated, to);
        }

        if to.is_float() {
            // int to float: convert with the source's signedness and
            // width.
            let op = match (from.is_long_integer(), from.is_signed_integer(), to.size) {
                (false, true, 32) => UnaryOp::ConvertSI32ToF32,
                (false, false, 32) => UnaryOp::ConvertUI32ToF32,
                (true, true, 32) => UnaryOp::ConvertSI64ToF32,
                (true, false, 32) => UnaryOp::ConvertUI64ToF32,
                (false, true, _) => UnaryOp::ConvertSI32ToF64,
                (false, false, _) => UnaryOp::ConvertUI32ToF64,
                (true, true, _) => UnaryOp::ConvertSI64ToF64,
                (true, false, _) => UnaryOp::ConvertUI64ToF64,
            };
            return self.module.unary(op, expr);
        }

        // int to int.
        if from.is_long_integer() && !to.is_long_integer() {
            let wrapped = self.module.unary(UnaryOp::WrapI64, expr);
            return self.ensure_small_integer_wrap(wrapped, to);
        }
        if !from.is_long_integer() && to.is_long_integer() {
            let op = if to.is_signed_integer() {
                UnaryOp::ExtendSI32
            } else {
                UnaryOp::ExtendUI32
            };
            return self.module.unary(op, expr);
        }
        // Same native width: a wrap is only needed when the target is
        // small and the value range actually shrinks or flips sign.
        if to.is_small_integer()
            && (to.size < from.size
                || (to.size == from.size
                    && to.is_signed_integer() != from.is_signed_integer()))
        {
            return self.ensure_small_integer_wrap(expr, to);
        }
        expr
    }
}
