//! The WebAssembly IR module under construction.
//!
//! Expressions live in one arena per module and are addressed by
//! [`ExprRef`], so trees can reference subtrees without ownership cycles.
//! The builder surface mirrors what a structured-control-flow backend
//! needs: blocks, loops, ifs, breaks, the operator families, local and
//! global access, and the module-level sections.
//!
//! Two pieces matter beyond plain construction: the `precompute` pass,
//! which evaluates a side-effect-free function body down to a literal
//! constant (the lowering code round-trips initializers through it), and
//! the text form, a WAT-flavored rendering used by tests and humans.

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::ast::Range;

/// Native WebAssembly value types, plus the two pseudo types the IR
/// tracks: `None` for void expressions and `Unreachable` for expressions
/// that never yield a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeType {
    None,
    I32,
    I64,
    F32,
    F64,
    Unreachable,
}

impl NativeType {
    fn mangle(self) -> char {
        match self {
            NativeType::I32 => 'i',
            NativeType::I64 => 'j',
            NativeType::F32 => 'f',
            NativeType::F64 => 'd',
            NativeType::None | NativeType::Unreachable => 'v',
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            NativeType::I32 => "i32",
            NativeType::I64 => "i64",
            NativeType::F32 => "f32",
            NativeType::F64 => "f64",
            NativeType::None | NativeType::Unreachable => "none",
        }
    }
}

/// Handle to an expression in the module's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExprRef(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[rustfmt::skip]
pub enum BinaryOp {
    AddI32, SubI32, MulI32, DivSI32, DivUI32, RemSI32, RemUI32,
    AndI32, OrI32, XorI32, ShlI32, ShrSI32, ShrUI32,
    EqI32, NeI32, LtSI32, LtUI32, LeSI32, LeUI32, GtSI32, GtUI32, GeSI32, GeUI32,
    AddI64, SubI64, MulI64, DivSI64, DivUI64, RemSI64, RemUI64,
    AndI64, OrI64, XorI64, ShlI64, ShrSI64, ShrUI64,
    EqI64, NeI64, LtSI64, LtUI64, LeSI64, LeUI64, GtSI64, GtUI64, GeSI64, GeUI64,
    AddF32, SubF32, MulF32, DivF32, EqF32, NeF32, LtF32, LeF32, GtF32, GeF32,
    AddF64, SubF64, MulF64, DivF64, EqF64, NeF64, LtF64, LeF64, GtF64, GeF64,
}

impl BinaryOp {
    /// Result type of the operation.
    pub fn result_type(self) -> NativeType {
        use BinaryOp::*;
        match self {
            AddI32 | SubI32 | MulI32 | DivSI32 | DivUI32 | RemSI32 | RemUI32 | AndI32 | OrI32
            | XorI32 | ShlI32 | ShrSI32 | ShrUI32 => NativeType::I32,
            AddI64 | SubI64 | MulI64 | DivSI64 | DivUI64 | RemSI64 | RemUI64 | AndI64 | OrI64
            | XorI64 | ShlI64 | ShrSI64 | ShrUI64 => NativeType::I64,
            AddF32 | SubF32 | MulF32 | DivF32 => NativeType::F32,
            AddF64 | SubF64 | MulF64 | DivF64 => NativeType::F64,
            // comparisons
            _ => NativeType::I32,
        }
    }

    fn name(self) -> &'static str {
        use BinaryOp::*;
        match self {
            AddI32 => "i32.add", SubI32 => "i32.sub", MulI32 => "i32.mul",
            DivSI32 => "i32.div_s", DivUI32 => "i32.div_u",
            RemSI32 => "i32.rem_s", RemUI32 => "i32.rem_u",
            AndI32 => "i32.and", OrI32 => "i32.or", XorI32 => "i32.xor",
            ShlI32 => "i32.shl", ShrSI32 => "i32.shr_s", ShrUI32 => "i32.shr_u",
            EqI32 => "i32.eq", NeI32 => "i32.ne",
            LtSI32 => "i32.lt_s", LtUI32 => "i32.lt_u",
            LeSI32 => "i32.le_s", LeUI32 => "i32.le_u",
            GtSI32 => "i32.gt_s", GtUI32 => "i32.gt_u",
            GeSI32 => "i32.ge_s", GeUI32 => "i32.ge_u",
            AddI64 => "i64.add", SubI64 => "i64.sub", MulI64 => "i64.mul",
            DivSI64 => "i64.div_s", DivUI64 => "i64.div_u",
            RemSI64 => "i64.rem_s", RemUI64 => "i64.rem_u",
            AndI64 => "i64.and", OrI64 => "i64.or", XorI64 => "i64.xor",
            ShlI64 => "i64.shl", ShrSI64 => "i64.shr_s", ShrUI64 => "i64.shr_u",
            EqI64 => "i64.eq", NeI64 => "i64.ne",
            LtSI64 => "i64.lt_s", LtUI64 => "i64.lt_u",
            LeSI64 => "i64.le_s", LeUI64 => "i64.le_u",
            GtSI64 => "i64.gt_s", GtUI64 => "i64.gt_u",
            GeSI64 => "i64.ge_s", GeUI64 => "i64.ge_u",
            AddF32 => "f32.add", SubF32 => "f32.sub", MulF32 => "f32.mul", DivF32 => "f32.div",
            EqF32 => "f32.eq", NeF32 => "f32.ne",
            LtF32 => "f32.lt", LeF32 => "f32.le", GtF32 => "f32.gt", GeF32 => "f32.ge",
            AddF64 => "f64.add", SubF64 => "f64.sub", MulF64 => "f64.mul", DivF64 => "f64.div",
            EqF64 => "f64.eq", NeF64 => "f64.ne",
            LtF64 => "f64.lt", LeF64 => "f64.le", GtF64 => "f64.gt", GeF64 => "f64.ge",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[rustfmt::skip]
pub enum UnaryOp {
    EqzI32, EqzI64,
    WrapI64,
    ExtendSI32, ExtendUI32,
    TruncSF32ToI32, TruncUF32ToI32, TruncSF64ToI32, TruncUF64ToI32,
    TruncSF32ToI64, TruncUF32ToI64, TruncSF64ToI64, TruncUF64ToI64,
    ConvertSI32ToF32, ConvertUI32ToF32, ConvertSI64ToF32, ConvertUI64ToF32,
    ConvertSI32ToF64, ConvertUI32ToF64, ConvertSI64ToF64, ConvertUI64ToF64,
    PromoteF32, DemoteF64,
    NegF32, NegF64,
}

impl UnaryOp {
    pub fn result_type(self) -> NativeType {
        use UnaryOp::*;
        match self {
            EqzI32 | EqzI64 | WrapI64 | TruncSF32ToI32 | TruncUF32ToI32 | TruncSF64ToI32
            | TruncUF64ToI32 => NativeType::I32,
            ExtendSI32 | ExtendUI32 | TruncSF32ToI64 | TruncUF32ToI64 | TruncSF64ToI64
            | TruncUF64ToI64 => NativeType::I64,
            ConvertSI32ToF32 | ConvertUI32ToF32 | ConvertSI64ToF32 | ConvertUI64ToF32
            | DemoteF64 | NegF32 => NativeType::F32,
            ConvertSI32ToF64 | ConvertUI32ToF64 | ConvertSI64ToF64 | ConvertUI64ToF64
            | PromoteF32 | NegF64 => NativeType::F64,
        }
    }

    fn name(self) -> &'static str {
        use UnaryOp::*;
        match self {
            EqzI32 => "i32.eqz", EqzI64 => "i64.eqz",
            WrapI64 => "i32.wrap_i64",
            ExtendSI32 => "i64.extend_i32_s", ExtendUI32 => "i64.extend_i32_u",
            TruncSF32ToI32 => "i32.trunc_f32_s", TruncUF32ToI32 => "i32.trunc_f32_u",
            TruncSF64ToI32 => "i32.trunc_f64_s", TruncUF64ToI32 => "i32.trunc_f64_u",
            TruncSF32ToI64 => "i64.trunc_f32_s", TruncUF32ToI64 => "i64.trunc_f32_u",
            TruncSF64ToI64 => "i64.trunc_f64_s", TruncUF64ToI64 => "i64.trunc_f64_u",
            ConvertSI32ToF32 => "f32.convert_i32_s", ConvertUI32ToF32 => "f32.convert_i32_u",
            ConvertSI64ToF32 => "f32.convert_i64_s", ConvertUI64ToF32 => "f32.convert_i64_u",
            ConvertSI32ToF64 => "f64.convert_i32_s", ConvertUI32ToF64 => "f64.convert_i32_u",
            ConvertSI64ToF64 => "f64.convert_i64_s", ConvertUI64ToF64 => "f64.convert_i64_u",
            PromoteF32 => "f64.promote_f32", DemoteF64 => "f32.demote_f64",
            NegF32 => "f32.neg", NegF64 => "f64.neg",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Expr {
    Nop,
    Unreachable,
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    LocalGet { index: u32, ty: NativeType },
    LocalSet { index: u32, value: ExprRef },
    LocalTee { index: u32, value: ExprRef, ty: NativeType },
    GlobalGet { name: String, ty: NativeType },
    GlobalSet { name: String, value: ExprRef },
    Load { bytes: u8, signed: bool, offset: u32, ty: NativeType, ptr: ExprRef },
    Store { bytes: u8, offset: u32, ptr: ExprRef, value: ExprRef, ty: NativeType },
    Binary { op: BinaryOp, left: ExprRef, right: ExprRef },
    Unary { op: UnaryOp, value: ExprRef },
    Block { name: Option<String>, children: SmallVec<[ExprRef; 4]>, ty: NativeType },
    Loop { name: Option<String>, body: ExprRef },
    If { condition: ExprRef, if_true: ExprRef, if_false: Option<ExprRef>, ty: NativeType },
    Break { label: String, condition: Option<ExprRef> },
    Return { value: Option<ExprRef> },
    Call { target: String, operands: Vec<ExprRef>, ty: NativeType },
    CallIndirect { target: ExprRef, operands: Vec<ExprRef>, type_name: String, ty: NativeType },
    Drop { value: ExprRef },
}

/// A literal value extracted from a constant expression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IrConstant {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

#[derive(Clone, Debug)]
pub struct IrFunction {
    pub name: String,
    pub type_name: String,
    pub params: Vec<NativeType>,
    pub result: NativeType,
    /// Additional locals beyond the parameters.
    pub locals: Vec<NativeType>,
    pub body: ExprRef,
}

#[derive(Clone, Debug)]
pub struct FunctionImport {
    pub module: String,
    pub base: String,
    pub type_name: String,
}

#[derive(Clone, Debug)]
pub struct GlobalImport {
    pub module: String,
    pub base: String,
    pub ty: NativeType,
}

#[derive(Clone, Debug)]
pub struct IrGlobal {
    pub ty: NativeType,
    pub mutable: bool,
    pub init: ExprRef,
}

#[derive(Clone, Debug)]
pub struct MemorySegment {
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MemoryInfo {
    pub initial: u32,
    pub maximum: u32,
    pub segments: Vec<MemorySegment>,
    pub export_name: Option<String>,
}

/// The module under construction.
#[derive(Debug, Default)]
pub struct Module {
    exprs: Vec<Expr>,
    pub function_types: IndexMap<String, (Vec<NativeType>, NativeType)>,
    pub functions: IndexMap<String, IrFunction>,
    pub function_imports: IndexMap<String, FunctionImport>,
    pub global_imports: IndexMap<String, GlobalImport>,
    pub globals: IndexMap<String, IrGlobal>,
    pub function_exports: Vec<(String, String)>,
    pub global_exports: Vec<(String, String)>,
    pub memory: Option<MemoryInfo>,
    pub memory_import: Option<(String, String)>,
    pub table: Vec<String>,
    pub start: Option<String>,
    pub debug_locations: Vec<(String, ExprRef, Range)>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    fn alloc(&mut self, expr: Expr) -> ExprRef {
        let index = u32::try_from(self.exprs.len()).expect("expression arena overflow");
        self.exprs.push(expr);
        ExprRef(index)
    }

    pub fn expr(&self, r: ExprRef) -> &Expr {
        &self.exprs[r.0 as usize]
    }

    // --- expression constructors -------------------------------------

    pub fn nop(&mut self) -> ExprRef {
        self.alloc(Expr::Nop)
    }

    pub fn unreachable(&mut self) -> ExprRef {
        self.alloc(Expr::Unreachable)
    }

    pub fn i32_const(&mut self, value: i32) -> ExprRef {
        self.alloc(Expr::I32Const(value))
    }

    pub fn i64_const(&mut self, value: i64) -> ExprRef {
        self.alloc(Expr::I64Const(value))
    }

    pub fn f32_const(&mut self, value: f32) -> ExprRef {
        self.alloc(Expr::F32Const(value))
    }

    pub fn f64_const(&mut self, value: f64) -> ExprRef {
        self.alloc(Expr::F64Const(value))
    }

    pub fn local_get(&mut self, index: u32, ty: NativeType) -> ExprRef {
        self.alloc(Expr::LocalGet { index, ty })
    }

    pub fn local_set(&mut self, index: u32, value: ExprRef) -> ExprRef {
        self.alloc(Expr::LocalSet { index, value })
    }

    pub fn local_tee(&mut self, index: u32, value: ExprRef, ty: NativeType) -> ExprRef {
        self.alloc(Expr::LocalTee { index, value, ty })
    }

    pub fn global_get(&mut self, name: impl Into<String>, ty: NativeType) -> ExprRef {
        self.alloc(Expr::GlobalGet { name: name.into(), ty })
    }

    pub fn global_set(&mut self, name: impl Into<String>, value: ExprRef) -> ExprRef {
        self.alloc(Expr::GlobalSet { name: name.into(), value })
    }

    pub fn load(
        &mut self,
        bytes: u8,
        signed: bool,
        offset: u32,
        ty: NativeType,
        ptr: ExprRef,
    ) -> ExprRef {
        self.alloc(Expr::Load { bytes, signed, offset, ty, ptr })
    }

    pub fn store(
        &mut self,
        bytes: u8,
        offset: u32,
        ptr: ExprRef,
        value: ExprRef,
        ty: NativeType,
    ) -> ExprRef {
        self.alloc(Expr::Store { bytes, offset, ptr, value, ty })
    }

    pub fn binary(&mut self, op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        self.alloc(Expr::Binary { op, left, right })
    }

    pub fn unary(&mut self, op: UnaryOp, value: ExprRef) -> ExprRef {
        self.alloc(Expr::Unary { op, value })
    }

    pub fn block(
        &mut self,
        name: Option<String>,
        children: impl IntoIterator<Item = ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.alloc(Expr::Block { name, children: children.into_iter().collect(), ty })
    }

    pub fn loop_(&mut self, name: Option<String>, body: ExprRef) -> ExprRef {
        self.alloc(Expr::Loop { name, body })
    }

    pub fn if_(
        &mut self,
        condition: ExprRef,
        if_true: ExprRef,
        if_false: Option<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.alloc(Expr::If { condition, if_true, if_false, ty })
    }

    pub fn br(&mut self, label: impl Into<String>, condition: Option<ExprRef>) -> ExprRef {
        self.alloc(Expr::Break { label: label.into(), condition })
    }

    pub fn ret(&mut self, value: Option<ExprRef>) -> ExprRef {
        self.alloc(Expr::Return { value })
    }

    pub fn call(
        &mut self,
        target: impl Into<String>,
        operands: Vec<ExprRef>,
        ty: NativeType,
    ) -> ExprRef {
        self.alloc(Expr::Call { target: target.into(), operands, ty })
    }

    pub fn call_indirect(
        &mut self,
        target: ExprRef,
        operands: Vec<ExprRef>,
        type_name: impl Into<String>,
        ty: NativeType,
    ) -> ExprRef {
        self.alloc(Expr::CallIndirect { target, operands, type_name: type_name.into(), ty })
    }

    pub fn drop_(&mut self, value: ExprRef) -> ExprRef {
        self.alloc(Expr::Drop { value })
    }

    /// Deep copy of an expression tree within this module's arena.
    pub fn clone_expression(&mut self, r: ExprRef) -> ExprRef {
        let expr = self.expr(r).clone();
        let copy = match expr {
            Expr::LocalSet { index, value } => {
                let value = self.clone_expression(value);
                Expr::LocalSet { index, value }
            }
            Expr::LocalTee { index, value, ty } => {
                let value = self.clone_expression(value);
                Expr::LocalTee { index, value, ty }
            }
            Expr::GlobalSet { name, value } => {
                let value = self.clone_expression(value);
                Expr::GlobalSet { name, value }
            }
            Expr::Load { bytes, signed, offset, ty, ptr } => {
                let ptr = self.clone_expression(ptr);
                Expr::Load { bytes, signed, offset, ty, ptr }
            }
            Expr::Store { bytes, offset, ptr, value, ty } => {
                let ptr = self.clone_expression(ptr);
                let value = self.clone_expression(value);
                Expr::Store { bytes, offset, ptr, value, ty }
            }
            Expr::Binary { op, left, right } => {
                let left = self.clone_expression(left);
                let right = self.clone_expression(right);
                Expr::Binary { op, left, right }
            }
            Expr::Unary { op, value } => {
                let value = self.clone_expression(value);
                Expr::Unary { op, value }
            }
            Expr::Block { name, children, ty } => {
                let children = children
                    .iter()
                    .map(|&c| self.clone_expression(c))
                    .collect();
                Expr::Block { name, children, ty }
            }
            Expr::Loop { name, body } => {
                let body = self.clone_expression(body);
                Expr::Loop { name, body }
            }
            Expr::If { condition, if_true, if_false, ty } => {
                let condition = self.clone_expression(condition);
                let if_true = self.clone_expression(if_true);
                let if_false = if_false.map(|e| self.clone_expression(e));
                Expr::If { condition, if_true, if_false, ty }
            }
            Expr::Break { label, condition } => {
                let condition = condition.map(|e| self.clone_expression(e));
                Expr::Break { label, condition }
            }
            Expr::Return { value } => {
                let value = value.map(|e| self.clone_expression(e));
                Expr::Return { value }
            }
            Expr::Call { target, operands, ty } => {
                let operands = operands
                    .iter()
                    .map(|&o| self.clone_expression(o))
                    .collect();
                Expr::Call { target, operands, ty }
            }
            Expr::CallIndirect { target, operands, type_name, ty } => {
                let target = self.clone_expression(target);
                let operands = operands
                    .iter()
                    .map(|&o| self.clone_expression(o))
                    .collect();
                Expr::CallIndirect { target, operands, type_name, ty }
            }
            Expr::Drop { value } => {
                let value = self.clone_expression(value);
                Expr::Drop { value }
            }
            leaf @ (Expr::Nop
            | Expr::Unreachable
            | Expr::I32Const(_)
            | Expr::I64Const(_)
            | Expr::F32Const(_)
            | Expr::F64Const(_)
            | Expr::LocalGet { .. }
            | Expr::GlobalGet { .. }) => leaf,
        };
        self.alloc(copy)
    }

    /// Static type of an expression.
    pub fn expr_type(&self, r: ExprRef) -> NativeType {
        match self.expr(r) {
            Expr::Nop | Expr::LocalSet { .. } | Expr::GlobalSet { .. } | Expr::Store { .. }
            | Expr::Drop { .. } => NativeType::None,
            Expr::Unreachable | Expr::Break { .. } | Expr::Return { .. } => {
                NativeType::Unreachable
            }
            Expr::I32Const(_) => NativeType::I32,
            Expr::I64Const(_) => NativeType::I64,
            Expr::F32Const(_) => NativeType::F32,
            Expr::F64Const(_) => NativeType::F64,
            Expr::LocalGet { ty, .. }
            | Expr::LocalTee { ty, .. }
            | Expr::GlobalGet { ty, .. }
            | Expr::Load { ty, .. }
            | Expr::Block { ty, .. }
            | Expr::If { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::CallIndirect { ty, .. } => *ty,
            Expr::Loop { .. } => NativeType::None,
            Expr::Binary { op, .. } => op.result_type(),
            Expr::Unary { op, .. } => op.result_type(),
        }
    }

    /// The literal behind a constant expression, if it is one.
    pub fn constant_value(&self, r: ExprRef) -> Option<IrConstant> {
        match self.expr(r) {
            Expr::I32Const(v) => Some(IrConstant::I32(*v)),
            Expr::I64Const(v) => Some(IrConstant::I64(*v)),
            Expr::F32Const(v) => Some(IrConstant::F32(*v)),
            Expr::F64Const(v) => Some(IrConstant::F64(*v)),
            _ => None,
        }
    }

    // --- module sections ----------------------------------------------

    /// Registers (or reuses) the function type for the given shape and
    /// returns its name.
    pub fn add_function_type(&mut self, params: &[NativeType], result: NativeType) -> String {
        let mut name = String::with_capacity(params.len() + 2);
        if params.is_empty() {
            name.push('v');
        } else {
            name.extend(params.iter().map(|p| p.mangle()));
        }
        name.push('_');
        name.push(result.mangle());
        self.function_types
            .entry(name.clone())
            .or_insert_with(|| (params.to_vec(), result));
        name
    }

    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        locals: Vec<NativeType>,
        body: ExprRef,
    ) -> &IrFunction {
        let name = name.into();
        let type_name = type_name.into();
        let (params, result) = self.function_types[&type_name].clone();
        let function = IrFunction {
            name: name.clone(),
            type_name,
            params,
            result,
            locals,
            body,
        };
        self.functions.insert(name.clone(), function);
        &self.functions[&name]
    }

    pub fn remove_function(&mut self, name: &str) {
        self.functions.shift_remove(name);
    }

    pub fn add_function_import(
        &mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        base: impl Into<String>,
        type_name: impl Into<String>,
    ) {
        self.function_imports.insert(
            name.into(),
            FunctionImport {
                module: module.into(),
                base: base.into(),
                type_name: type_name.into(),
            },
        );
    }

    pub fn add_global_import(
        &mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        base: impl Into<String>,
        ty: NativeType,
    ) {
        self.global_imports.insert(
            name.into(),
            GlobalImport { module: module.into(), base: base.into(), ty },
        );
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: NativeType,
        mutable: bool,
        init: ExprRef,
    ) {
        self.globals.insert(name.into(), IrGlobal { ty, mutable, init });
    }


    pub fn add_function_export(&mut self, internal: impl Into<String>, external: impl Into<String>) {
        self.function_exports.push((external.into(), internal.into()));
    }

    pub fn add_global_export(&mut self, internal: impl Into<String>, external: impl Into<String>) {
        self.global_exports.push((external.into(), internal.into()));
    }

    pub fn set_memory(
        &mut self,
        initial: u32,
        maximum: u32,
        segments: Vec<MemorySegment>,
        export_name: Option<String>,
    ) {
        self.memory = Some(MemoryInfo { initial, maximum, segments, export_name });
    }

    pub fn add_memory_import(&mut self, module: impl Into<String>, base: impl Into<String>) {
        self.memory_import = Some((module.into(), base.into()));
    }

    pub fn set_function_table(&mut self, entries: Vec<String>) {
        self.table = entries;
    }

    pub fn set_start(&mut self, name: impl Into<String>) {
        self.start = Some(name.into());
    }

    pub fn add_debug_location(&mut self, function: impl Into<String>, expr: ExprRef, range: Range) {
        self.debug_locations.push((function.into(), expr, range));
    }

    // --- passes --------------------------------------------------------

    /// Runs the named optimization passes over one function. Only
    /// `precompute` is implemented; it evaluates the body and, when the
    /// result is a literal, replaces the body with that constant.
    pub fn run_passes(&mut self, passes: &[&str], function: &str) {
        for pass in passes {
            match *pass {
                "precompute" => self.precompute_function(function),
                other => panic!("unknown pass: {other}"),
            }
        }
    }

    fn precompute_function(&mut self, function: &str) {
        let Some(func) = self.functions.get(function) else {
            return;
        };
        if let Some(constant) = self.evaluate(func.body) {
            let body = match constant {
                IrConstant::I32(v) => self.i32_const(v),
                IrConstant::I64(v) => self.i64_const(v),
                IrConstant::F32(v) => self.f32_const(v),
                IrConstant::F64(v) => self.f64_const(v),
            };
            self.functions
                .get_mut(function)
                .expect("function vanished during precompute")
                .body = body;
        }
    }

    /// Evaluates a side-effect-free expression to a literal. Anything
    /// that may trap, read state or produce no value yields `None`.
    fn evaluate(&self, r: ExprRef) -> Option<IrConstant> {
        match self.expr(r) {
            Expr::I32Const(v) => Some(IrConstant::I32(*v)),
            Expr::I64Const(v) => Some(IrConstant::I64(*v)),
            Expr::F32Const(v) => Some(IrConstant::F32(*v)),
            Expr::F64Const(v) => Some(IrConstant::F64(*v)),
            Expr::Binary { op, left, right } => {
                let left = self.evaluate(*left)?;
                let right = self.evaluate(*right)?;
                evaluate_binary(*op, left, right)
            }
            Expr::Unary { op, value } => {
                let value = self.evaluate(*value)?;
                evaluate_unary(*op, value)
            }
            Expr::Block { children, .. } if children.len() == 1 => self.evaluate(children[0]),
            Expr::If { condition, if_true, if_false, .. } => {
                let condition = self.evaluate(*condition)?;
                let taken = match condition {
                    IrConstant::I32(v) => v != 0,
                    IrConstant::I64(v) => v != 0,
                    _ => return None,
                };
                if taken {
                    self.evaluate(*if_true)
                } else {
                    self.evaluate((*if_false)?)
                }
            }
            _ => None,
        }
    }
}

fn evaluate_binary(op: BinaryOp, left: IrConstant, right: IrConstant) -> Option<IrConstant> {
    use BinaryOp::*;
    use IrConstant::*;
    let value = match (op, left, right) {
        (AddI32, I32(a), I32(b)) => I32(a.wrapping_add(b)),
        (SubI32, I32(a), I32(b)) => I32(a.wrapping_sub(b)),
        (MulI32, I32(a), I32(b)) => I32(a.wrapping_mul(b)),
        (DivSI32, I32(a), I32(b)) => I32(a.checked_div(b)?),
        (DivUI32, I32(a), I32(b)) => I32(((a as u32).checked_div(b as u32)?) as i32),
        (RemSI32, I32(a), I32(b)) => {
            if b == 0 {
                return None;
            }
            I32(a.wrapping_rem(b))
        }
        (RemUI32, I32(a), I32(b)) => I32(((a as u32).checked_rem(b as u32)?) as i32),
        (AndI32, I32(a), I32(b)) => I32(a & b),
        (OrI32, I32(a), I32(b)) => I32(a | b),
        (XorI32, I32(a), I32(b)) => I32(a ^ b),
        (ShlI32, I32(a), I32(b)) => I32(a.wrapping_shl(b as u32)),
        (ShrSI32, I32(a), I32(b)) => I32(a.wrapping_shr(b as u32)),
        (ShrUI32, I32(a), I32(b)) => I32(((a as u32).wrapping_shr(b as u32)) as i32),
        (EqI32, I32(a), I32(b)) => I32((a == b) as i32),
        (NeI32, I32(a), I32(b)) => I32((a != b) as i32),
        (LtSI32, I32(a), I32(b)) => I32((a < b) as i32),
        (LtUI32, I32(a), I32(b)) => I32(((a as u32) < b as u32) as i32),
        (LeSI32, I32(a), I32(b)) => I32((a <= b) as i32),
        (LeUI32, I32(a), I32(b)) => I32((a as u32 <= b as u32) as i32),
        (GtSI32, I32(a), I32(b)) => I32((a > b) as i32),
        (GtUI32, I32(a), I32(b)) => I32((a as u32 > b as u32) as i32),
        (GeSI32, I32(a), I32(b)) => I32((a >= b) as i32),
        (GeUI32, I32(a), I32(b)) => I32((a as u32 >= b as u32) as i32),
        (AddI64, I64(a), I64(b)) => I64(a.wrapping_add(b)),
        (SubI64, I64(a), I64(b)) => I64(a.wrapping_sub(b)),
        (MulI64, I64(a), I64(b)) => I64(a.wrapping_mul(b)),
        (DivSI64, I64(a), I64(b)) => I64(a.checked_div(b)?),
        (DivUI64, I64(a), I64(b)) => I64(((a as u64).checked_div(b as u64)?) as i64),
        (RemSI64, I64(a), I64(b)) => {
            if b == 0 {
                return None;
            }
            I64(a.wrapping_rem(b))
        }
        (RemUI64, I64(a), I64(b)) => I64(((a as u64).checked_rem(b as u64)?) as i64),
        (AndI64, I64(a), I64(b)) => I64(a & b),
        (OrI64, I64(a), I64(b)) => I64(a | b),
        (XorI64, I64(a), I64(b)) => I64(a ^ b),
        (ShlI64, I64(a), I64(b)) => I64(a.wrapping_shl(b as u32)),
        (ShrSI64, I64(a), I64(b)) => I64(a.wrapping_shr(b as u32)),
        (ShrUI64, I64(a), I64(b)) => I64(((a as u64).wrapping_shr(b as u32)) as i64),
        (EqI64, I64(a), I64(b)) => I32((a == b) as i32),
        (NeI64, I64(a), I64(b)) => I32((a != b) as i32),
        (LtSI64, I64(a), I64(b)) => I32((a < b) as i32),
        (LtUI64, I64(a), I64(b)) => I32(((a as u64) < b as u64) as i32),
        (LeSI64, I64(a), I64(b)) => I32((a <= b) as i32),
        (GeSI64, I64(a), I64(b)) => I32((a >= b) as i32),
        (GeUI64, I64(a), I64(b)) => I32((a as u64 >= b as u64) as i32),
        (GtSI64, I64(a), I64(b)) => I32((a > b) as i32),
        (GtUI64, I64(a), I64(b)) => I32((a as u64 > b as u64) as i32),
        (LeUI64, I64(a), I64(b)) => I32((a as u64 <= b as u64) as i32),
        (AddF32, F32(a), F32(b)) => F32(a + b),
        (SubF32, F32(a), F32(b)) => F32(a - b),
        (MulF32, F32(a), F32(b)) => F32(a * b),
        (DivF32, F32(a), F32(b)) => F32(a / b),
        (EqF32, F32(a), F32(b)) => I32((a == b) as i32),
        (NeF32, F32(a), F32(b)) => I32((a != b) as i32),
        (LtF32, F32(a), F32(b)) => I32((a < b) as i32),
        (LeF32, F32(a), F32(b)) => I32((a <= b) as i32),
        (GtF32, F32(a), F32(b)) => I32((a > b) as i32),
        (GeF32, F32(a), F32(b)) => I32((a >= b) as i32),
        (AddF64, F64(a), F64(b)) => F64(a + b),
        (SubF64, F64(a), F64(b)) => F64(a - b),
        (MulF64, F64(a), F64(b)) => F64(a * b),
        (DivF64, F64(a), F64(b)) => F64(a / b),
        (EqF64, F64(a), F64(b)) => I32((a == b) as i32),
        (NeF64, F64(a), F64(b)) => I32((a != b) as i32),
        (LtF64, F64(a), F64(b)) => I32((a < b) as i32),
        (LeF64, F64(a), F64(b)) => I32((a <= b) as i32),
        (GtF64, F64(a), F64(b)) => I32((a > b) as i32),
        (GeF64, F64(a), F64(b)) => I32((a >= b) as i32),
        _ => return None,
    };
    Some(value)
}

fn evaluate_unary(op: UnaryOp, value: IrConstant) -> Option<IrConstant> {
    use IrConstant::*;
    use UnaryOp::*;
    let result = match (op, value) {
        (EqzI32, I32(v)) => I32((v == 0) as i32),
        (EqzI64, I64(v)) => I32((v == 0) as i32),
        (WrapI64, I64(v)) => I32(v as i32),
        (ExtendSI32, I32(v)) => I64(v as i64),
        (ExtendUI32, I32(v)) => I64(v as u32 as i64),
        (TruncSF32ToI32, F32(v)) => I32(trunc_to_i64(v as f64, i32::MIN as f64, i32::MAX as f64)? as i32),
        (TruncUF32ToI32, F32(v)) => I32(trunc_to_i64(v as f64, 0.0, u32::MAX as f64)? as u32 as i32),
        (TruncSF64ToI32, F64(v)) => I32(trunc_to_i64(v, i32::MIN as f64, i32::MAX as f64)? as i32),
        (TruncUF64ToI32, F64(v)) => I32(trunc_to_i64(v, 0.0, u32::MAX as f64)? as u32 as i32),
        (TruncSF32ToI64, F32(v)) => I64(trunc_to_i64(v as f64, i64::MIN as f64, i64::MAX as f64)?),
        (TruncUF32ToI64, F32(v)) => I64(trunc_to_u64(v as f64)? as i64),
        (TruncSF64ToI64, F64(v)) => I64(trunc_to_i64(v, i64::MIN as f64, i64::MAX as f64)?),
        (TruncUF64ToI64, F64(v)) => I64(trunc_to_u64(v)? as i64),
        (ConvertSI32ToF32, I32(v)) => F32(v as f32),
        (ConvertUI32ToF32, I32(v)) => F32(v as u32 as f32),
        (ConvertSI64ToF32, I64(v)) => F32(v as f32),
        (ConvertUI64ToF32, I64(v)) => F32(v as u64 as f32),
        (ConvertSI32ToF64, I32(v)) => F64(v as f64),
        (ConvertUI32ToF64, I32(v)) => F64(v as u32 as f64),
        (ConvertSI64ToF64, I64(v)) => F64(v as f64),
        (ConvertUI64ToF64, I64(v)) => F64(v as u64 as f64),
        (PromoteF32, F32(v)) => F64(v as f64),
        (DemoteF64, F64(v)) => F32(v as f32),
        (NegF32, F32(v)) => F32(-v),
        (NegF64, F64(v)) => F64(-v),
        _ => return None,
    };
    Some(result)
}

fn trunc_to_i64(value: f64, min: f64, max: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    let truncated = value.trunc();
    if truncated < min || truncated > max {
        return None;
    }
    Some(truncated as i64)
}

fn trunc_to_u64(value: f64) -> Option<u64> {
    if !value.is_finite() {
        return None;
    }
    let truncated = value.trunc();
    if truncated < 0.0 || truncated > u64::MAX as f64 {
        return None;
    }
    Some(truncated as u64)
}

// --- text form ---------------------------------------------------------

impl Module {
    /// Renders one expression as a compact s-expression.
    pub fn expr_to_string(&self, r: ExprRef) -> String {
        let mut out = String::new();
        self.write_expr(&mut out, r);
        out
    }

    fn write_expr(&self, out: &mut String, r: ExprRef) {
        use std::fmt::Write;
        match self.expr(r) {
            Expr::Nop => out.push_str("(nop)"),
            Expr::Unreachable => out.push_str("(unreachable)"),
            Expr::I32Const(v) => {
                let _ = write!(out, "(i32.const {v})");
            }
            Expr::I64Const(v) => {
                let _ = write!(out, "(i64.const {v})");
            }
            Expr::F32Const(v) => {
                let _ = write!(out, "(f32.const {v})");
            }
            Expr::F64Const(v) => {
                let _ = write!(out, "(f64.const {v})");
            }
            Expr::LocalGet { index, .. } => {
                let _ = write!(out, "(local.get {index})");
            }
            Expr::LocalSet { index, value } => {
                let _ = write!(out, "(local.set {index} ");
                self.write_expr(out, *value);
                out.push(')');
            }
            Expr::LocalTee { index, value, .. } => {
                let _ = write!(out, "(local.tee {index} ");
                self.write_expr(out, *value);
                out.push(')');
            }
            Expr::GlobalGet { name, .. } => {
                let _ = write!(out, "(global.get ${name})");
            }
            Expr::GlobalSet { name, value } => {
                let _ = write!(out, "(global.set ${name} ");
                self.write_expr(out, *value);
                out.push(')');
            }
            Expr::Load { bytes, signed, offset, ty, ptr } => {
                let _ = write!(out, "({}", load_name(*ty, *bytes, *signed));
                if *offset != 0 {
                    let _ = write!(out, " offset={offset}");
                }
                out.push(' ');
                self.write_expr(out, *ptr);
                out.push(')');
            }
            Expr::Store { bytes, offset, ptr, value, ty } => {
                let _ = write!(out, "({}", store_name(*ty, *bytes));
                if *offset != 0 {
                    let _ = write!(out, " offset={offset}");
                }
                out.push(' ');
                self.write_expr(out, *ptr);
                out.push(' ');
                self.write_expr(out, *value);
                out.push(')');
            }
            Expr::Binary { op, left, right } => {
                let _ = write!(out, "({} ", op.name());
                self.write_expr(out, *left);
                out.push(' ');
                self.write_expr(out, *right);
                out.push(')');
            }
            Expr::Unary { op, value } => {
                let _ = write!(out, "({} ", op.name());
                self.write_expr(out, *value);
                out.push(')');
            }
            Expr::Block { name, children, .. } => {
                out.push_str("(block");
                if let Some(name) = name {
                    let _ = write!(out, " ${name}");
                }
                for &child in children {
                    out.push(' ');
                    self.write_expr(out, child);
                }
                out.push(')');
            }
            Expr::Loop { name, body } => {
                out.push_str("(loop");
                if let Some(name) = name {
                    let _ = write!(out, " ${name}");
                }
                out.push(' ');
                self.write_expr(out, *body);
                out.push(')');
            }
            Expr::If { condition, if_true, if_false, .. } => {
                out.push_str("(if ");
                self.write_expr(out, *condition);
                out.push(' ');
                self.write_expr(out, *if_true);
                if let Some(if_false) = if_false {
                    out.push(' ');
                    self.write_expr(out, *if_false);
                }
                out.push(')');
            }
            Expr::Break { label, condition } => {
                match condition {
                    Some(condition) => {
                        let _ = write!(out, "(br_if ${label} ");
                        self.write_expr(out, *condition);
                        out.push(')');
                    }
                    None => {
                        let _ = write!(out, "(br ${label})");
                    }
                }
            }
            Expr::Return { value } => match value {
                Some(value) => {
                    out.push_str("(return ");
                    self.write_expr(out, *value);
                    out.push(')');
                }
                None => out.push_str("(return)"),
            },
            Expr::Call { target, operands, .. } => {
                let _ = write!(out, "(call ${target}");
                for &operand in operands {
                    out.push(' ');
                    self.write_expr(out, operand);
                }
                out.push(')');
            }
            Expr::CallIndirect { target, operands, type_name, .. } => {
                let _ = write!(out, "(call_indirect (type ${type_name})");
                for &operand in operands {
                    out.push(' ');
                    self.write_expr(out, operand);
                }
                out.push(' ');
                self.write_expr(out, *target);
                out.push(')');
            }
            Expr::Drop { value } => {
                out.push_str("(drop ");
                self.write_expr(out, *value);
                out.push(')');
            }
        }
    }
}

fn load_name(ty: NativeType, bytes: u8, signed: bool) -> String {
    let prefix = ty.keyword();
    let full = match ty {
        NativeType::I32 => 4,
        NativeType::I64 => 8,
        NativeType::F32 => 4,
        NativeType::F64 => 8,
        _ => 0,
    };
    if bytes as u32 * 8 >= full * 8 || matches!(ty, NativeType::F32 | NativeType::F64) {
        format!("{prefix}.load")
    } else {
        format!("{prefix}.load{}_{}", bytes as u32 * 8, if signed { "s" } else { "u" })
    }
}

fn store_name(ty: NativeType, bytes: u8) -> String {
    let prefix = ty.keyword();
    let full = match ty {
        NativeType::I32 => 4,
        NativeType::I64 => 8,
        _ => 0,
    };
    if matches!(ty, NativeType::F32 | NativeType::F64) || bytes >= full {
        format!("{prefix}.store")
    } else {
        format!("{prefix}.store{}", bytes as u32 * 8)
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "(module")?;
        for (name, (params, result)) in &self.function_types {
            write!(f, "  (type ${name} (func")?;
            if !params.is_empty() {
                write!(f, " (param")?;
                for p in params {
                    write!(f, " {}", p.keyword())?;
                }
                write!(f, ")")?;
            }
            if *result != NativeType::None {
                write!(f, " (result {})", result.keyword())?;
            }
            writeln!(f, "))")?;
        }
        if let Some((module, base)) = &self.memory_import {
            writeln!(f, "  (import \"{module}\" \"{base}\" (memory 1))")?;
        }
        for (name, import) in &self.function_imports {
            writeln!(
                f,
                "  (import \"{}\" \"{}\" (func ${} (type ${})))",
                import.module, import.base, name, import.type_name
            )?;
        }
        for (name, import) in &self.global_imports {
            writeln!(
                f,
                "  (import \"{}\" \"{}\" (global ${} {}))",
                import.module, import.base, name, import.ty.keyword()
            )?;
        }
        if let Some(memory) = &self.memory {
            writeln!(f, "  (memory $0 {} {})", memory.initial, memory.maximum)?;
            for segment in &memory.segments {
                write!(f, "  (data (i32.const {}) \"", segment.offset)?;
                for byte in &segment.data {
                    if byte.is_ascii_graphic() && *byte != b'"' && *byte != b'\\' {
                        write!(f, "{}", *byte as char)?;
                    } else {
                        write!(f, "\\{byte:02x}")?;
                    }
                }
                writeln!(f, "\")")?;
            }
            if let Some(export) = &memory.export_name {
                writeln!(f, "  (export \"{export}\" (memory $0))")?;
            }
        }
        if !self.table.is_empty() {
            writeln!(f, "  (table $0 {} funcref)", self.table.len())?;
            write!(f, "  (elem (i32.const 0)")?;
            for entry in &self.table {
                write!(f, " ${entry}")?;
            }
            writeln!(f, ")")?;
        }
        for (name, global) in &self.globals {
            let ty = global.ty.keyword();
            if global.mutable {
                write!(f, "  (global ${name} (mut {ty}) ")?;
            } else {
                write!(f, "  (global ${name} {ty} ")?;
            }
            writeln!(f, "{})", self.expr_to_string(global.init))?;
        }
        for (external, internal) in &self.function_exports {
            writeln!(f, "  (export \"{external}\" (func ${internal}))")?;
        }
        for (external, internal) in &self.global_exports {
            writeln!(f, "  (export \"{external}\" (global ${internal}))")?;
        }
        if let Some(start) = &self.start {
            writeln!(f, "  (start ${start})")?;
        }
        for (name, function) in &self.functions {
            write!(f, "  (func ${name} (type ${})", function.type_name)?;
            if !function.params.is_empty() {
                write!(f, " (param")?;
                for p in &function.params {
                    write!(f, " {}", p.keyword())?;
                }
                write!(f, ")")?;
            }
            if function.result != NativeType::None {
                write!(f, " (result {})", function.result.keyword())?;
            }
            if !function.locals.is_empty() {
                write!(f, " (local")?;
                for l in &function.locals {
                    write!(f, " {}", l.keyword())?;
                }
                write!(f, ")")?;
            }
            writeln!(f)?;
            writeln!(f, "    {}", self.expr_to_string(function.body))?;
            writeln!(f, "  )")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_type_names_are_deduplicated() {
        let mut module = Module::new();
        let a = module.add_function_type(&[NativeType::I32, NativeType::I32], NativeType::I32);
        let b = module.add_function_type(&[NativeType::I32, NativeType::I32], NativeType::I32);
        assert_eq!(a, "ii_i");
        assert_eq!(a, b);
        assert_eq!(module.function_types.len(), 1);
        let c = module.add_function_type(&[], NativeType::None);
        assert_eq!(c, "v_v");
    }

    #[test]
    fn precompute_folds_arithmetic() {
        let mut module = Module::new();
        let two = module.i32_const(2);
        let three = module.i32_const(3);
        let sum = module.binary(BinaryOp::AddI32, two, three);
        let ty = module.add_function_type(&[], NativeType::I32);
        module.add_function("fold", ty, Vec::new(), sum);
        module.run_passes(&["precompute"], "fold");
        let body = module.functions["fold"].body;
        assert_eq!(module.constant_value(body), Some(IrConstant::I32(5)));
    }

    #[test]
    fn precompute_refuses_division_by_zero() {
        let mut module = Module::new();
        let one = module.i32_const(1);
        let zero = module.i32_const(0);
        let div = module.binary(BinaryOp::DivSI32, one, zero);
        let ty = module.add_function_type(&[], NativeType::I32);
        module.add_function("trap", ty, Vec::new(), div);
        module.run_passes(&["precompute"], "trap");
        let body = module.functions["trap"].body;
        assert_eq!(module.constant_value(body), None);
    }

    #[test]
    fn precompute_is_idempotent_on_constants() {
        let mut module = Module::new();
        let k = module.i32_const(7);
        let ty = module.add_function_type(&[], NativeType::I32);
        module.add_function("k", ty, Vec::new(), k);
        module.run_passes(&["precompute"], "k");
        let body = module.functions["k"].body;
        assert_eq!(module.constant_value(body), Some(IrConstant::I32(7)));
        module.run_passes(&["precompute"], "k");
        let body = module.functions["k"].body;
        assert_eq!(module.constant_value(body), Some(IrConstant::I32(7)));
    }

    #[test]
    fn clone_expression_copies_whole_trees() {
        let mut module = Module::new();
        let a = module.local_get(0, NativeType::I32);
        let b = module.i32_const(1);
        let sum = module.binary(BinaryOp::AddI32, a, b);
        let copy = module.clone_expression(sum);
        assert_ne!(sum, copy);
        assert_eq!(module.expr_to_string(sum), module.expr_to_string(copy));
    }

    #[test]
    fn text_form_of_simple_body() {
        let mut module = Module::new();
        let a = module.local_get(0, NativeType::I32);
        let b = module.local_get(1, NativeType::I32);
        let sum = module.binary(BinaryOp::AddI32, a, b);
        assert_eq!(
            module.expr_to_string(sum),
            "(i32.add (local.get 0) (local.get 1))"
        );
    }

    #[test]
    fn load_and_store_names_include_width() {
        assert_eq!(load_name(NativeType::I32, 1, true), "i32.load8_s");
        assert_eq!(load_name(NativeType::I32, 2, false), "i32.load16_u");
        assert_eq!(load_name(NativeType::I32, 4, false), "i32.load");
        assert_eq!(load_name(NativeType::F64, 8, false), "f64.load");
        assert_eq!(store_name(NativeType::I32, 1), "i32.store8");
        assert_eq!(store_name(NativeType::I64, 8), "i64.store");
    }

    #[test]
    fn truncation_rejects_out_of_range_values() {
        assert_eq!(
            evaluate_unary(UnaryOp::TruncSF64ToI32, IrConstant::F64(3.9)),
            Some(IrConstant::I32(3))
        );
        assert_eq!(
            evaluate_unary(UnaryOp::TruncSF64ToI32, IrConstant::F64(1e12)),
            None
        );
        assert_eq!(
            evaluate_unary(UnaryOp::TruncUF64ToI32, IrConstant::F64(-1.0)),
            None
        );
    }
}
