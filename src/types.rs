//! Semantic types, call signatures and the numeric lattice.
//!
//! Every concrete type projects onto one of the four native WebAssembly
//! value types; sub-word integers ("small" integers) all project to `i32`
//! and carry a wrapping obligation tracked by the lowering code.

use bitflags::bitflags;

use crate::module::NativeType;
use crate::program::{ClassId, Program, SignatureId};

/// Compilation target, selecting the pointer/memory model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Wasm32,
    Wasm64,
}

impl Target {
    /// Pointer width in bits.
    pub fn pointer_size(self) -> u32 {
        match self {
            Target::Wasm32 => 32,
            Target::Wasm64 => 64,
        }
    }

    /// Upper bound on linear memory, in 64 KiB pages.
    pub fn max_pages(self) -> u32 {
        match self {
            Target::Wasm32 => 0x1_0000,
            Target::Wasm64 => 0x100_0000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    Bool,
    F32,
    F64,
    Void,
}

bitflags! {
    /// Derived classification bits, mirroring the lattice axes the
    /// lowering code branches on.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TypeFlags: u16 {
        const SIGNED  = 1 << 0;
        const INTEGER = 1 << 1;
        const FLOAT   = 1 << 2;
        const SMALL   = 1 << 3;
        const LONG    = 1 << 4;
        const POINTER = 1 << 5;
    }
}

/// A semantic type. Plain numeric types are plain values; reference types
/// additionally carry a class index and function types a signature index,
/// both pointing into the [`Program`] arenas so that no ownership cycles
/// can form.
#[derive(Clone, Copy, Debug)]
pub struct Type {
    pub kind: TypeKind,
    /// Size in bits. Fixed by the kind except for `isize`/`usize`, where
    /// it records the target pointer width.
    pub size: u32,
    pub class: Option<ClassId>,
    pub signature: Option<SignatureId>,
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && self.class == other.class
            && self.signature == other.signature
    }
}

impl Eq for Type {}

impl Type {
    const fn basic(kind: TypeKind, size: u32) -> Type {
        Type {
            kind,
            size,
            class: None,
            signature: None,
        }
    }

    pub const I8: Type = Type::basic(TypeKind::I8, 8);
    pub const I16: Type = Type::basic(TypeKind::I16, 16);
    pub const I32: Type = Type::basic(TypeKind::I32, 32);
    pub const I64: Type = Type::basic(TypeKind::I64, 64);
    pub const U8: Type = Type::basic(TypeKind::U8, 8);
    pub const U16: Type = Type::basic(TypeKind::U16, 16);
    pub const U32: Type = Type::basic(TypeKind::U32, 32);
    pub const U64: Type = Type::basic(TypeKind::U64, 64);
    pub const BOOL: Type = Type::basic(TypeKind::Bool, 1);
    pub const F32: Type = Type::basic(TypeKind::F32, 32);
    pub const F64: Type = Type::basic(TypeKind::F64, 64);
    pub const VOID: Type = Type::basic(TypeKind::Void, 0);

    /// The target-dependent signed pointer-sized integer.
    pub fn isize_type(target: Target) -> Type {
        Type::basic(TypeKind::Isize, target.pointer_size())
    }

    /// The target-dependent unsigned pointer-sized integer.
    pub fn usize_type(target: Target) -> Type {
        Type::basic(TypeKind::Usize, target.pointer_size())
    }

    /// A reference to an instance of `class`, represented as a pointer.
    pub fn class_type(class: ClassId, target: Target) -> Type {
        Type {
            class: Some(class),
            ..Type::usize_type(target)
        }
    }

    /// A first-class function, represented as a table index.
    pub fn function_type(signature: SignatureId) -> Type {
        Type {
            signature: Some(signature),
            ..Type::U32
        }
    }

    pub fn flags(&self) -> TypeFlags {
        match self.kind {
            TypeKind::I8 | TypeKind::I16 => {
                TypeFlags::SIGNED | TypeFlags::INTEGER | TypeFlags::SMALL
            }
            TypeKind::I32 => TypeFlags::SIGNED | TypeFlags::INTEGER,
            TypeKind::I64 => TypeFlags::SIGNED | TypeFlags::INTEGER | TypeFlags::LONG,
            TypeKind::Isize => {
                let mut flags = TypeFlags::SIGNED | TypeFlags::INTEGER | TypeFlags::POINTER;
                if self.size == 64 {
                    flags |= TypeFlags::LONG;
                }
                flags
            }
            TypeKind::U8 | TypeKind::U16 | TypeKind::Bool => {
                TypeFlags::INTEGER | TypeFlags::SMALL
            }
            TypeKind::U32 => TypeFlags::INTEGER,
            TypeKind::U64 => TypeFlags::INTEGER | TypeFlags::LONG,
            TypeKind::Usize => {
                let mut flags = TypeFlags::INTEGER | TypeFlags::POINTER;
                if self.size == 64 {
                    flags |= TypeFlags::LONG;
                }
                flags
            }
            TypeKind::F32 | TypeKind::F64 => TypeFlags::FLOAT,
            TypeKind::Void => TypeFlags::empty(),
        }
    }

    pub fn is_integer(&self) -> bool {
        self.flags().contains(TypeFlags::INTEGER)
    }

    pub fn is_float(&self) -> bool {
        self.flags().contains(TypeFlags::FLOAT)
    }

    pub fn is_signed_integer(&self) -> bool {
        self.flags().contains(TypeFlags::SIGNED | TypeFlags::INTEGER)
    }

    pub fn is_small_integer(&self) -> bool {
        self.flags().contains(TypeFlags::SMALL)
    }

    pub fn is_long_integer(&self) -> bool {
        self.flags().contains(TypeFlags::LONG)
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }

    pub fn is_reference(&self) -> bool {
        self.class.is_some()
    }

    pub fn is_function(&self) -> bool {
        self.signature.is_some()
    }

    /// Size in bytes as laid out in linear memory.
    pub fn byte_size(&self) -> u32 {
        match self.kind {
            TypeKind::Bool => 1,
            _ => self.size / 8,
        }
    }

    /// Projection onto the native WebAssembly value types.
    pub fn native_type(&self) -> NativeType {
        match self.kind {
            TypeKind::I8
            | TypeKind::I16
            | TypeKind::I32
            | TypeKind::U8
            | TypeKind::U16
            | TypeKind::U32
            | TypeKind::Bool => NativeType::I32,
            TypeKind::I64 | TypeKind::U64 => NativeType::I64,
            TypeKind::Isize | TypeKind::Usize => {
                if self.size == 64 {
                    NativeType::I64
                } else {
                    NativeType::I32
                }
            }
            TypeKind::F32 => NativeType::F32,
            TypeKind::F64 => NativeType::F64,
            TypeKind::Void => NativeType::None,
        }
    }

    /// Whether a value of this type may be used where `target` is expected
    /// without an explicit cast.
    pub fn is_assignable_to(&self, target: &Type, program: &Program) -> bool {
        if self == target {
            return true;
        }
        if self.is_reference() && target.is_reference() {
            let mut current = self.class;
            while let Some(id) = current {
                if Some(id) == target.class {
                    return true;
                }
                current = program.class(id).base;
            }
            return false;
        }
        if self.is_reference() || target.is_reference() {
            return false;
        }
        if self.is_function() || target.is_function() {
            return self.signature == target.signature;
        }
        let from = self.flags();
        let to = target.flags();
        if from.contains(TypeFlags::INTEGER) && to.contains(TypeFlags::INTEGER) {
            return if from.contains(TypeFlags::SIGNED) == to.contains(TypeFlags::SIGNED) {
                self.size <= target.size
            } else if to.contains(TypeFlags::SIGNED) {
                // unsigned fits into a strictly wider signed type
                self.size < target.size
            } else {
                false
            };
        }
        if from.contains(TypeFlags::INTEGER) && to.contains(TypeFlags::FLOAT) {
            // f64 represents 32-bit integers exactly, f32 only 16-bit ones
            return if target.kind == TypeKind::F64 {
                self.size <= 32
            } else {
                self.size <= 16
            };
        }
        if from.contains(TypeFlags::FLOAT) && to.contains(TypeFlags::FLOAT) {
            return self.size <= target.size;
        }
        false
    }

    /// The least common type two operands of a binary expression unify to,
    /// if any.
    pub fn common_compatible(left: &Type, right: &Type, program: &Program) -> Option<Type> {
        if left == right {
            Some(*left)
        } else if left.is_assignable_to(right, program) {
            Some(*right)
        } else if right.is_assignable_to(left, program) {
            Some(*left)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self.kind {
            TypeKind::I8 => "i8",
            TypeKind::I16 => "i16",
            TypeKind::I32 => "i32",
            TypeKind::I64 => "i64",
            TypeKind::Isize => "isize",
            TypeKind::U8 => "u8",
            TypeKind::U16 => "u16",
            TypeKind::U32 => "u32",
            TypeKind::U64 => "u64",
            TypeKind::Usize => "usize",
            TypeKind::Bool => "bool",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Void => "void",
        };
        f.write_str(name)
    }
}

/// The shape of a callable: parameter types, optional receiver, return
/// type and the number of parameters that must be supplied at a call site.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub this_type: Option<Type>,
    pub parameter_types: Vec<Type>,
    pub parameter_names: Vec<String>,
    pub return_type: Type,
    pub required_parameters: usize,
    pub has_rest: bool,
}

impl Signature {
    /// Total number of operands a full direct call passes, including the
    /// receiver when present.
    pub fn full_arity(&self) -> usize {
        self.parameter_types.len() + usize::from(self.this_type.is_some())
    }

    /// Native parameter projection, receiver first.
    pub fn native_params(&self) -> Vec<NativeType> {
        let mut params = Vec::with_capacity(self.full_arity());
        if let Some(this) = &self.this_type {
            params.push(this.native_type());
        }
        params.extend(self.parameter_types.iter().map(Type::native_type));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_projection_of_small_integers() {
        for ty in [Type::I8, Type::I16, Type::U8, Type::U16, Type::BOOL] {
            assert!(ty.is_small_integer());
            assert_eq!(ty.native_type(), NativeType::I32);
        }
        assert_eq!(Type::I64.native_type(), NativeType::I64);
        assert_eq!(Type::F32.native_type(), NativeType::F32);
    }

    #[test]
    fn pointer_width_follows_target() {
        assert_eq!(Type::usize_type(Target::Wasm32).native_type(), NativeType::I32);
        assert_eq!(Type::usize_type(Target::Wasm64).native_type(), NativeType::I64);
        assert!(Type::usize_type(Target::Wasm64).is_long_integer());
        assert!(!Type::usize_type(Target::Wasm32).is_long_integer());
    }

    #[test]
    fn integer_assignability_follows_sign_and_width() {
        let program = Program::new();
        assert!(Type::I8.is_assignable_to(&Type::I32, &program));
        assert!(Type::U8.is_assignable_to(&Type::I16, &program));
        assert!(!Type::I8.is_assignable_to(&Type::U32, &program));
        assert!(!Type::I64.is_assignable_to(&Type::I32, &program));
        assert!(Type::U16.is_assignable_to(&Type::F32, &program));
        assert!(!Type::U32.is_assignable_to(&Type::F32, &program));
        assert!(Type::U32.is_assignable_to(&Type::F64, &program));
        assert!(Type::F32.is_assignable_to(&Type::F64, &program));
        assert!(!Type::F64.is_assignable_to(&Type::F32, &program));
    }

    #[test]
    fn common_type_prefers_the_wider_operand() {
        let program = Program::new();
        assert_eq!(
            Type::common_compatible(&Type::I8, &Type::I32, &program),
            Some(Type::I32)
        );
        assert_eq!(
            Type::common_compatible(&Type::I32, &Type::F64, &program),
            Some(Type::F64)
        );
        assert_eq!(
            Type::common_compatible(&Type::U32, &Type::I64, &program),
            Some(Type::I64)
        );
        assert_eq!(Type::common_compatible(&Type::I64, &Type::U64, &program), None);
    }

    #[test]
    fn bool_is_a_byte_in_memory() {
        assert_eq!(Type::BOOL.byte_size(), 1);
        assert_eq!(Type::I16.byte_size(), 2);
        assert_eq!(Type::F64.byte_size(), 8);
    }
}
