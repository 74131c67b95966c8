//! The resolved program model ("Program oracle").
//!
//! Name resolution and type checking happen ahead of lowering; what the
//! compiler sees is this arena of named elements, classes and signatures,
//! all referencing each other through plain indices so that the cyclic
//! shape class ↔ method ↔ signature ↔ class never turns into an ownership
//! cycle. The compiler is the only mutator of compilation-state flags.

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use indexmap::IndexMap;

use crate::ast::{
    ClassDeclaration, ClassMember, DeclarationFlags, EnumDeclaration, Expression,
    FunctionDeclaration, NamespaceDeclaration, Range, Statement, TypeNode, VariableStatement,
};
use crate::diagnostics::{DiagnosticCode, Diagnostics};
use crate::types::{Signature, Target, Type};

/// Handle to an element in the program arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElementId(u32);

/// Handle to a class instance in the class arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

/// Handle to a resolved signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SignatureId(u32);

/// Separates the path from the simple name in internal names.
pub const PATH_DELIMITER: &str = "/";
/// Separates a parent element from a static member.
pub const STATIC_DELIMITER: &str = ".";
/// Separates a class from an instance member.
pub const INSTANCE_DELIMITER: &str = "#";

bitflags! {
    /// State and modifier bits of an element. The compilation-state bits
    /// (`COMPILED`, `INLINED`) are owned by the compiler; the rest is
    /// fixed during initialization.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ElementFlags: u32 {
        const COMPILED = 1 << 0;
        const INLINED  = 1 << 1;
        const CONSTANT = 1 << 2;
        const EXPORTED = 1 << 3;
        const DECLARED = 1 << 4;
        const BUILTIN  = 1 << 5;
        const INSTANCE = 1 << 6;
        const GENERIC  = 1 << 7;
        const STATIC   = 1 << 8;
        const READONLY = 1 << 9;
    }
}

/// A constant value cached on a global, local or enum value once its
/// initializer has been folded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstantValue {
    Integer(i64),
    Float(f64),
}

/// One slot (or virtual slot) of a function.
#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    /// Index of the slot; `-1` for virtual (inlined) locals.
    pub index: i32,
    pub ty: Type,
    pub constant_value: Option<ConstantValue>,
}

#[derive(Clone, Debug)]
pub struct GlobalData {
    pub type_annotation: Option<TypeNode>,
    pub initializer: Option<Rc<Expression>>,
    pub resolved_type: Option<Type>,
    pub constant_value: Option<ConstantValue>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct EnumData {
    pub values: Vec<ElementId>,
}

#[derive(Clone, Debug)]
pub struct EnumValueData {
    pub owner: ElementId,
    pub index: u32,
    pub initializer: Option<Rc<Expression>>,
    pub constant_value: Option<i64>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct FunctionPrototypeData {
    pub declaration: Rc<FunctionDeclaration>,
    /// Concrete instances by type-argument key.
    pub instances: HashMap<String, ElementId>,
    /// Set for methods: the class instance the prototype belongs to.
    pub class: Option<ClassId>,
}

#[derive(Clone, Debug)]
pub struct FunctionData {
    /// The prototype this instance was resolved from; `None` for
    /// synthetic functions (start, trampolines).
    pub prototype: Option<ElementId>,
    pub signature: SignatureId,
    /// All locals, parameters first (receiver at index 0 when present).
    pub locals: Vec<Local>,
    /// Number of parameter slots, including the receiver.
    pub param_count: usize,
    pub type_arguments: HashMap<String, Type>,
    pub class: Option<ClassId>,
    pub table_index: Option<u32>,
    pub trampoline: Option<ElementId>,
    /// Slot indices currently available for temporary reuse.
    pub free_temps: Vec<usize>,
    /// Per-function label context counter.
    pub next_label: u32,
}

#[derive(Clone, Debug)]
pub struct ClassPrototypeData {
    pub declaration: Rc<ClassDeclaration>,
    pub instances: HashMap<String, ClassId>,
}

#[derive(Clone, Debug, Default)]
pub struct NamespaceData {
    pub members: IndexMap<String, ElementId>,
}

#[derive(Clone, Debug)]
pub enum ElementData {
    Global(GlobalData),
    Enum(EnumData),
    EnumValue(EnumValueData),
    FunctionPrototype(FunctionPrototypeData),
    Function(FunctionData),
    ClassPrototype(ClassPrototypeData),
    Namespace(NamespaceData),
}

/// A named, resolved symbol.
#[derive(Clone, Debug)]
pub struct Element {
    pub internal_name: String,
    pub simple_name: String,
    pub flags: ElementFlags,
    pub data: ElementData,
}

/// A field of a class instance, laid out in linear memory.
#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub offset: u32,
    pub readonly: bool,
    pub initializer: Option<Rc<Expression>>,
    pub range: Range,
}

/// A concrete (possibly generic-instantiated) class.
#[derive(Clone, Debug)]
pub struct Class {
    pub name: String,
    pub internal_name: String,
    pub prototype: Option<ElementId>,
    pub base: Option<ClassId>,
    pub type_arguments: HashMap<String, Type>,
    pub fields: Vec<Field>,
    pub methods: IndexMap<String, ElementId>,
    pub getters: IndexMap<String, ElementId>,
    pub setters: IndexMap<String, ElementId>,
    pub constructor: Option<ElementId>,
    pub indexed_get: Option<ElementId>,
    pub indexed_set: Option<ElementId>,
    /// Instance size in bytes.
    pub size: u32,
}

/// One translation unit.
#[derive(Clone, Debug)]
pub struct Source {
    pub normalized_path: String,
    pub is_entry: bool,
    pub statements: Vec<Rc<Statement>>,
    /// Local name → internal name of the imported element.
    pub imports: HashMap<String, String>,
}

/// The resolved program model supplied to the compiler.
#[derive(Debug, Default)]
pub struct Program {
    pub sources: Vec<Source>,
    pub elements: IndexMap<String, ElementId>,
    pub exports: IndexMap<String, ElementId>,
    arena: Vec<Element>,
    classes: Vec<Class>,
    signatures: Vec<Signature>,
    /// The semantic type of string literals, when a string class exists.
    pub string_type: Option<Type>,
    initialized: bool,
}

fn align_offset(offset: u32, alignment: u32) -> u32 {
    (offset + alignment - 1) & !(alignment - 1)
}

impl Program {
    pub fn new() -> Program {
        let mut program = Program::default();
        program.register_builtins();
        program
    }

    fn register_builtins(&mut self) {
        let assert_decl = FunctionDeclaration {
            name: "assert".into(),
            type_parameters: Vec::new(),
            parameters: vec![crate::ast::ParameterDeclaration {
                name: "condition".into(),
                type_annotation: TypeNode::named("bool"),
                initializer: None,
                is_rest: false,
                range: Range::default(),
            }],
            return_type: Some(TypeNode::named("void")),
            body: None,
            flags: DeclarationFlags::BUILTIN,
            range: Range::default(),
        };
        let sizeof_decl = FunctionDeclaration {
            name: "sizeof".into(),
            type_parameters: vec!["T".into()],
            parameters: Vec::new(),
            return_type: Some(TypeNode::named("usize")),
            body: None,
            flags: DeclarationFlags::BUILTIN,
            range: Range::default(),
        };
        for decl in [assert_decl, sizeof_decl] {
            let name = decl.name.clone();
            let generic = !decl.type_parameters.is_empty();
            let mut flags = ElementFlags::BUILTIN;
            if generic {
                flags |= ElementFlags::GENERIC;
            }
            self.add_element(
                name.clone(),
                name,
                flags,
                ElementData::FunctionPrototype(FunctionPrototypeData {
                    declaration: Rc::new(decl),
                    instances: HashMap::new(),
                    class: None,
                }),
            );
        }
    }

    pub fn add_source(
        &mut self,
        normalized_path: impl Into<String>,
        is_entry: bool,
        statements: Vec<Statement>,
    ) {
        self.sources.push(Source {
            normalized_path: normalized_path.into(),
            is_entry,
            statements: statements.into_iter().map(Rc::new).collect(),
            imports: HashMap::new(),
        });
    }

    // --- arena access --------------------------------------------------

    pub fn elem(&self, id: ElementId) -> &Element {
        &self.arena[id.0 as usize]
    }

    pub fn elem_mut(&mut self, id: ElementId) -> &mut Element {
        &mut self.arena[id.0 as usize]
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.0 as usize]
    }

    pub fn signature(&self, id: SignatureId) -> &Signature {
        &self.signatures[id.0 as usize]
    }

    pub fn add_signature(&mut self, signature: Signature) -> SignatureId {
        let id = SignatureId(self.signatures.len() as u32);
        self.signatures.push(signature);
        id
    }

    fn add_element(
        &mut self,
        internal_name: String,
        simple_name: String,
        flags: ElementFlags,
        data: ElementData,
    ) -> ElementId {
        let id = ElementId(self.arena.len() as u32);
        self.arena.push(Element {
            internal_name: internal_name.clone(),
            simple_name,
            flags,
            data,
        });
        self.elements.insert(internal_name, id);
        id
    }

    /// Registers an element that is not looked up by name (function and
    /// class instances).
    fn add_anonymous_element(&mut self, element: Element) -> ElementId {
        let id = ElementId(self.arena.len() as u32);
        self.arena.push(element);
        id
    }

    pub fn function_data(&self, id: ElementId) -> &FunctionData {
        match &self.elem(id).data {
            ElementData::Function(data) => data,
            _ => panic!("element is not a function instance"),
        }
    }

    pub fn function_data_mut(&mut self, id: ElementId) -> &mut FunctionData {
        match &mut self.elem_mut(id).data {
            ElementData::Function(data) => data,
            _ => panic!("element is not a function instance"),
        }
    }

    // --- initialization ------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Performs the name-resolution phase: walks all sources and creates
    /// the module-level elements the compiler will look up. Safe to call
    /// once; later calls are no-ops.
    pub fn initialize(&mut self, diags: &mut Diagnostics) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        for index in 0..self.sources.len() {
            let source = &self.sources[index];
            let path = source.normalized_path.clone();
            let statements = source.statements.clone();
            for statement in &statements {
                self.initialize_statement(statement, &path, None, index, diags);
            }
        }
        // Export statements are handled after all declarations exist so
        // that re-exports across sources resolve.
        for index in 0..self.sources.len() {
            let source = &self.sources[index];
            let path = source.normalized_path.clone();
            let statements = source.statements.clone();
            for statement in &statements {
                if let Statement::Export(export) = statement.as_ref() {
                    let from = export.path.clone().unwrap_or_else(|| path.clone());
                    for member in &export.members {
                        let internal =
                            format!("{from}{PATH_DELIMITER}{name}", name = member.name);
                        if let Some(&id) = self.elements.get(&internal) {
                            self.elem_mut(id).flags |= ElementFlags::EXPORTED;
                            self.exports.insert(internal, id);
                        } else {
                            diags.error(
                                DiagnosticCode::UnresolvableIdentifier,
                                member.range,
                                format!("cannot find exported name '{}'", member.name),
                            );
                        }
                    }
                }
            }
        }
    }

    fn initialize_statement(
        &mut self,
        statement: &Statement,
        path: &str,
        namespace: Option<ElementId>,
        source_index: usize,
        diags: &mut Diagnostics,
    ) {
        let prefix = match namespace {
            Some(ns) => format!("{}{STATIC_DELIMITER}", self.elem(ns).internal_name),
            None => format!("{path}{PATH_DELIMITER}"),
        };
        match statement {
            Statement::Variable(decl) => {
                self.initialize_globals(decl, &prefix, namespace, diags);
            }
            Statement::Function(decl) => {
                self.initialize_function(decl.clone(), &prefix, namespace, None, diags);
            }
            Statement::Class(decl) => {
                self.initialize_class(decl.clone(), &prefix, namespace, diags);
            }
            Statement::Enum(decl) => {
                self.initialize_enum(decl, &prefix, namespace, diags);
            }
            Statement::Namespace(decl) => {
                self.initialize_namespace(decl, &prefix, namespace, source_index, diags);
            }
            Statement::Import(import) => {
                for decl in &import.declarations {
                    let internal = format!(
                        "{}{PATH_DELIMITER}{}",
                        import.path, decl.external_name
                    );
                    self.sources[source_index]
                        .imports
                        .insert(decl.name.clone(), internal);
                }
            }
            _ => {}
        }
    }

    fn declaration_flags(flags: DeclarationFlags) -> ElementFlags {
        let mut out = ElementFlags::empty();
        if flags.contains(DeclarationFlags::EXPORT) {
            out |= ElementFlags::EXPORTED;
        }
        if flags.contains(DeclarationFlags::DECLARE) {
            out |= ElementFlags::DECLARED;
        }
        if flags.contains(DeclarationFlags::CONST) {
            out |= ElementFlags::CONSTANT;
        }
        if flags.contains(DeclarationFlags::READONLY) {
            out |= ElementFlags::READONLY;
        }
        if flags.contains(DeclarationFlags::STATIC) {
            out |= ElementFlags::STATIC;
        }
        if flags.contains(DeclarationFlags::BUILTIN) {
            out |= ElementFlags::BUILTIN;
        }
        out
    }

    fn initialize_globals(
        &mut self,
        statement: &VariableStatement,
        prefix: &str,
        namespace: Option<ElementId>,
        diags: &mut Diagnostics,
    ) {
        for decl in &statement.declarations {
            let internal = format!("{prefix}{}", decl.name);
            if self.elements.contains_key(&internal) {
                diags.error(
                    DiagnosticCode::DuplicateName,
                    decl.range,
                    format!("duplicate declaration '{}'", decl.name),
                );
                continue;
            }
            let id = self.add_element(
                internal,
                decl.name.clone(),
                Self::declaration_flags(statement.flags),
                ElementData::Global(GlobalData {
                    type_annotation: decl.type_annotation.clone(),
                    initializer: decl.initializer.clone().map(Rc::new),
                    resolved_type: None,
                    constant_value: None,
                    range: decl.range,
                }),
            );
            self.add_to_namespace(namespace, id);
            if statement.flags.contains(DeclarationFlags::EXPORT) {
                let internal = self.elem(id).internal_name.clone();
                self.exports.insert(internal, id);
            }
        }
    }

    fn initialize_function(
        &mut self,
        declaration: Rc<FunctionDeclaration>,
        prefix: &str,
        namespace: Option<ElementId>,
        class: Option<ClassId>,
        diags: &mut Diagnostics,
    ) -> Option<ElementId> {
        let internal = format!("{prefix}{}", declaration.name);
        if self.elements.contains_key(&internal) {
            diags.error(
                DiagnosticCode::DuplicateName,
                declaration.range,
                format!("duplicate declaration '{}'", declaration.name),
            );
            return None;
        }
        let mut flags = Self::declaration_flags(declaration.flags);
        if !declaration.type_parameters.is_empty() {
            flags |= ElementFlags::GENERIC;
        }
        let exported = declaration.flags.contains(DeclarationFlags::EXPORT);
        let id = self.add_element(
            internal.clone(),
            declaration.name.clone(),
            flags,
            ElementData::FunctionPrototype(FunctionPrototypeData {
                declaration,
                instances: HashMap::new(),
                class,
            }),
        );
        self.add_to_namespace(namespace, id);
        if exported {
            self.exports.insert(internal, id);
        }
        Some(id)
    }

    fn initialize_class(
        &mut self,
        declaration: Rc<ClassDeclaration>,
        prefix: &str,
        namespace: Option<ElementId>,
        diags: &mut Diagnostics,
    ) {
        let internal = format!("{prefix}{}", declaration.name);
        if self.elements.contains_key(&internal) {
            diags.error(
                DiagnosticCode::DuplicateName,
                declaration.range,
                format!("duplicate declaration '{}'", declaration.name),
            );
            return;
        }
        let mut flags = Self::declaration_flags(declaration.flags);
        if !declaration.type_parameters.is_empty() {
            flags |= ElementFlags::GENERIC;
        }
        let exported = declaration.flags.contains(DeclarationFlags::EXPORT);
        let id = self.add_element(
            internal.clone(),
            declaration.name.clone(),
            flags,
            ElementData::ClassPrototype(ClassPrototypeData {
                declaration: declaration.clone(),
                instances: HashMap::new(),
            }),
        );
        self.add_to_namespace(namespace, id);
        if exported {
            self.exports.insert(internal.clone(), id);
        }
        // Static members become elements of their own, addressed with the
        // static delimiter.
        let static_prefix = format!("{internal}{STATIC_DELIMITER}");
        for member in &declaration.members {
            match member {
                ClassMember::Field(field)
                    if field.flags.contains(DeclarationFlags::STATIC) =>
                {
                    let statement = VariableStatement {
                        declarations: vec![crate::ast::VariableDeclaration {
                            name: field.name.clone(),
                            type_annotation: Some(field.type_annotation.clone()),
                            initializer: field.initializer.clone(),
                            range: field.range,
                        }],
                        flags: field.flags,
                        range: field.range,
                    };
                    self.initialize_globals(&statement, &static_prefix, None, diags);
                }
                ClassMember::Method(method)
                    if method.flags.contains(DeclarationFlags::STATIC) =>
                {
                    self.initialize_function(
                        Rc::new(method.clone()),
                        &static_prefix,
                        None,
                        None,
                        diags,
                    );
                }
                _ => {}
            }
        }
    }

    fn initialize_enum(
        &mut self,
        declaration: &EnumDeclaration,
        prefix: &str,
        namespace: Option<ElementId>,
        diags: &mut Diagnostics,
    ) {
        let internal = format!("{prefix}{}", declaration.name);
        if self.elements.contains_key(&internal) {
            diags.error(
                DiagnosticCode::DuplicateName,
                declaration.range,
                format!("duplicate declaration '{}'", declaration.name),
            );
            return;
        }
        let flags = Self::declaration_flags(declaration.flags);
        let exported = declaration.flags.contains(DeclarationFlags::EXPORT);
        let id = self.add_element(
            internal.clone(),
            declaration.name.clone(),
            flags,
            ElementData::Enum(EnumData { values: Vec::new() }),
        );
        self.add_to_namespace(namespace, id);
        if exported {
            self.exports.insert(internal.clone(), id);
        }
        let mut values = Vec::with_capacity(declaration.values.len());
        for (index, value) in declaration.values.iter().enumerate() {
            let value_internal = format!("{internal}{STATIC_DELIMITER}{}", value.name);
            let value_id = self.add_element(
                value_internal,
                value.name.clone(),
                ElementFlags::CONSTANT,
                ElementData::EnumValue(EnumValueData {
                    owner: id,
                    index: index as u32,
                    initializer: value.value.clone().map(Rc::new),
                    constant_value: None,
                    range: value.range,
                }),
            );
            values.push(value_id);
        }
        match &mut self.elem_mut(id).data {
            ElementData::Enum(data) => data.values = values,
            _ => unreachable!(),
        }
    }

    fn initialize_namespace(
        &mut self,
        declaration: &NamespaceDeclaration,
        prefix: &str,
        namespace: Option<ElementId>,
        source_index: usize,
        diags: &mut Diagnostics,
    ) {
        let internal = format!("{prefix}{}", declaration.name);
        let id = match self.elements.get(&internal) {
            // Namespaces merge.
            Some(&existing) => existing,
            None => {
                let flags = Self::declaration_flags(declaration.flags);
                let id = self.add_element(
                    internal.clone(),
                    declaration.name.clone(),
                    flags,
                    ElementData::Namespace(NamespaceData::default()),
                );
                self.add_to_namespace(namespace, id);
                if declaration.flags.contains(DeclarationFlags::EXPORT) {
                    self.exports.insert(internal, id);
                }
                id
            }
        };
        for member in &declaration.members {
            self.initialize_statement(member, "", Some(id), source_index, diags);
        }
    }

    fn add_to_namespace(&mut self, namespace: Option<ElementId>, member: ElementId) {
        if let Some(ns) = namespace {
            let name = self.elem(member).simple_name.clone();
            match &mut self.elem_mut(ns).data {
                ElementData::Namespace(data) => {
                    data.members.insert(name, member);
                }
                _ => panic!("parent element is not a namespace"),
            }
        }
    }

    // --- resolvers -----------------------------------------------------

    /// Resolves a type annotation, looking through the contextual type
    /// arguments of the enclosing generic instance first.
    pub fn resolve_type(
        &mut self,
        node: &TypeNode,
        contextual: Option<&HashMap<String, Type>>,
        target: Target,
        diags: &mut Diagnostics,
    ) -> Option<Type> {
        if let Some(map) = contextual {
            if let Some(ty) = map.get(&node.name) {
                return Some(*ty);
            }
        }
        let ty = match node.name.as_str() {
            "i8" => Some(Type::I8),
            "i16" => Some(Type::I16),
            "i32" => Some(Type::I32),
            "i64" => Some(Type::I64),
            "isize" => Some(Type::isize_type(target)),
            "u8" => Some(Type::U8),
            "u16" => Some(Type::U16),
            "u32" => Some(Type::U32),
            "u64" => Some(Type::U64),
            "usize" => Some(Type::usize_type(target)),
            "bool" => Some(Type::BOOL),
            "f32" => Some(Type::F32),
            "f64" => Some(Type::F64),
            "void" => Some(Type::VOID),
            "string" => Some(self.string_type.unwrap_or(Type::usize_type(target))),
            _ => None,
        };
        if ty.is_some() {
            return ty;
        }
        let element = self.find_type_element(&node.name);
        match element {
            Some(id) => match &self.elem(id).data {
                ElementData::Enum(_) => Some(Type::I32),
                ElementData::ClassPrototype(_) => {
                    let mut args = Vec::with_capacity(node.type_arguments.len());
                    for argument in &node.type_arguments {
                        args.push(self.resolve_type(argument, contextual, target, diags)?);
                    }
                    let class =
                        self.resolve_class_type_arguments(id, &args, target, node.range, diags)?;
                    Some(Type::class_type(class, target))
                }
                _ => {
                    diags.error(
                        DiagnosticCode::TypeExpected,
                        node.range,
                        format!("'{}' does not name a type", node.name),
                    );
                    None
                }
            },
            None => {
                diags.error(
                    DiagnosticCode::TypeExpected,
                    node.range,
                    format!("cannot find type '{}'", node.name),
                );
                None
            }
        }
    }

    fn find_type_element(&self, name: &str) -> Option<ElementId> {
        if let Some(&id) = self.elements.get(name) {
            return Some(id);
        }
        self.elements.values().copied().find(|&id| {
            let element = self.elem(id);
            element.simple_name == name
                && matches!(
                    element.data,
                    ElementData::ClassPrototype(_) | ElementData::Enum(_)
                )
        })
    }

    /// Resolves an identifier to a module-level element. Function locals
    /// and flow-scoped names are the compiler's business and are looked
    /// up before calling this.
    pub fn resolve_identifier(
        &self,
        name: &str,
        source_index: usize,
        current_enum: Option<ElementId>,
    ) -> Option<ElementId> {
        if let Some(enum_id) = current_enum {
            if let ElementData::Enum(data) = &self.elem(enum_id).data {
                for &value in &data.values {
                    if self.elem(value).simple_name == name {
                        return Some(value);
                    }
                }
            }
        }
        let source = &self.sources[source_index];
        if let Some(internal) = source.imports.get(name) {
            if let Some(&id) = self.elements.get(internal) {
                return Some(id);
            }
        }
        let qualified = format!(
            "{}{PATH_DELIMITER}{name}",
            source.normalized_path
        );
        if let Some(&id) = self.elements.get(&qualified) {
            return Some(id);
        }
        self.elements.get(name).copied()
    }

    /// Resolves a static property access on a namespace, enum or class
    /// prototype.
    pub fn resolve_property(&self, target: ElementId, property: &str) -> Option<ElementId> {
        match &self.elem(target).data {
            ElementData::Namespace(data) => data.members.get(property).copied(),
            ElementData::Enum(data) => data
                .values
                .iter()
                .copied()
                .find(|&value| self.elem(value).simple_name == property),
            ElementData::ClassPrototype(_) => {
                let key = format!(
                    "{}{STATIC_DELIMITER}{property}",
                    self.elem(target).internal_name
                );
                self.elements.get(&key).copied()
            }
            _ => None,
        }
    }

    // --- generic instantiation -----------------------------------------

    fn type_arguments_key(types: &[Type]) -> String {
        let mut key = String::new();
        for (i, ty) in types.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(&ty.to_string());
        }
        key
    }

    /// Resolves a function prototype with the given type arguments to a
    /// concrete instance, creating and caching it on first use.
    pub fn resolve_using_type_arguments(
        &mut self,
        prototype: ElementId,
        type_arguments: &[Type],
        target: Target,
        report_range: Range,
        diags: &mut Diagnostics,
    ) -> Option<ElementId> {
        let (declaration, class) = match &self.elem(prototype).data {
            ElementData::FunctionPrototype(data) => {
                (data.declaration.clone(), data.class)
            }
            _ => panic!("element is not a function prototype"),
        };
        if declaration.type_parameters.len() != type_arguments.len() {
            diags.error(
                DiagnosticCode::TypeArgumentMismatch,
                report_range,
                format!(
                    "expected {} type argument(s) but got {}",
                    declaration.type_parameters.len(),
                    type_arguments.len()
                ),
            );
            return None;
        }
        let key = Self::type_arguments_key(type_arguments);
        if let ElementData::FunctionPrototype(data) = &self.elem(prototype).data {
            if let Some(&instance) = data.instances.get(&key) {
                return Some(instance);
            }
        }

        let mut type_map: HashMap<String, Type> = match class {
            Some(class) => self.class(class).type_arguments.clone(),
            None => HashMap::new(),
        };
        for (parameter, argument) in declaration
            .type_parameters
            .iter()
            .zip(type_arguments.iter())
        {
            type_map.insert(parameter.clone(), *argument);
        }

        let this_type = match class {
            Some(class) if !declaration.flags.contains(DeclarationFlags::STATIC) => {
                Some(Type::class_type(class, target))
            }
            _ => None,
        };
        let mut parameter_types = Vec::with_capacity(declaration.parameters.len());
        let mut parameter_names = Vec::with_capacity(declaration.parameters.len());
        let mut required_parameters = declaration.parameters.len();
        let mut has_rest = false;
        let mut seen_optional = false;
        for (index, parameter) in declaration.parameters.iter().enumerate() {
            let ty =
                self.resolve_type(&parameter.type_annotation, Some(&type_map), target, diags)?;
            parameter_types.push(ty);
            parameter_names.push(parameter.name.clone());
            if parameter.is_rest {
                has_rest = true;
            }
            if parameter.initializer.is_some() && !seen_optional {
                seen_optional = true;
                required_parameters = index;
            }
        }
        let return_type = match &declaration.return_type {
            Some(node) => self.resolve_type(node, Some(&type_map), target, diags)?,
            None => Type::VOID,
        };
        let signature = self.add_signature(Signature {
            this_type,
            parameter_types: parameter_types.clone(),
            parameter_names,
            return_type,
            required_parameters,
            has_rest,
        });

        let mut locals = Vec::with_capacity(parameter_types.len() + 1);
        let mut index = 0i32;
        if let Some(this) = this_type {
            locals.push(Local {
                name: "this".into(),
                index,
                ty: this,
                constant_value: None,
            });
            index += 1;
        }
        for (ty, parameter) in parameter_types.iter().zip(declaration.parameters.iter()) {
            locals.push(Local {
                name: parameter.name.clone(),
                index,
                ty: *ty,
                constant_value: None,
            });
            index += 1;
        }

        let prototype_element = self.elem(prototype);
        let internal_name = if type_arguments.is_empty() {
            prototype_element.internal_name.clone()
        } else {
            format!("{}<{key}>", prototype_element.internal_name)
        };
        let simple_name = prototype_element.simple_name.clone();
        let mut flags = prototype_element.flags & !ElementFlags::GENERIC;
        if this_type.is_some() {
            flags |= ElementFlags::INSTANCE;
        }
        let param_count = locals.len();
        let instance = self.add_anonymous_element(Element {
            internal_name,
            simple_name,
            flags,
            data: ElementData::Function(FunctionData {
                prototype: Some(prototype),
                signature,
                locals,
                param_count,
                type_arguments: type_map,
                class,
                table_index: None,
                trampoline: None,
                free_temps: Vec::new(),
                next_label: 0,
            }),
        });
        match &mut self.elem_mut(prototype).data {
            ElementData::FunctionPrototype(data) => {
                data.instances.insert(key, instance);
            }
            _ => unreachable!(),
        }
        Some(instance)
    }

    /// Resolves a class prototype with the given type arguments to a
    /// concrete class, computing the field layout and member prototypes.
    pub fn resolve_class_type_arguments(
        &mut self,
        prototype: ElementId,
        type_arguments: &[Type],
        target: Target,
        report_range: Range,
        diags: &mut Diagnostics,
    ) -> Option<ClassId> {
        let declaration = match &self.elem(prototype).data {
            ElementData::ClassPrototype(data) => data.declaration.clone(),
            _ => panic!("element is not a class prototype"),
        };
        if declaration.type_parameters.len() != type_arguments.len() {
            diags.error(
                DiagnosticCode::TypeArgumentMismatch,
                report_range,
                format!(
                    "expected {} type argument(s) but got {}",
                    declaration.type_parameters.len(),
                    type_arguments.len()
                ),
            );
            return None;
        }
        let key = Self::type_arguments_key(type_arguments);
        if let ElementData::ClassPrototype(data) = &self.elem(prototype).data {
            if let Some(&instance) = data.instances.get(&key) {
                return Some(instance);
            }
        }

        let mut type_map: HashMap<String, Type> = HashMap::new();
        for (parameter, argument) in declaration
            .type_parameters
            .iter()
            .zip(type_arguments.iter())
        {
            type_map.insert(parameter.clone(), *argument);
        }

        let base = match &declaration.extends {
            Some(node) => {
                let ty = self.resolve_type(node, Some(&type_map), target, diags)?;
                match ty.class {
                    Some(base) => Some(base),
                    None => {
                        diags.error(
                            DiagnosticCode::TypeExpected,
                            node.range,
                            format!("'{}' is not a class type", node.name),
                        );
                        return None;
                    }
                }
            }
            None => None,
        };

        let prototype_element = self.elem(prototype);
        let internal_name = if type_arguments.is_empty() {
            prototype_element.internal_name.clone()
        } else {
            format!("{}<{key}>", prototype_element.internal_name)
        };
        let name = prototype_element.simple_name.clone();

        // Reserve the class slot first so member prototypes can refer to
        // it by index.
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class {
            name,
            internal_name: internal_name.clone(),
            prototype: Some(prototype),
            base,
            type_arguments: type_map.clone(),
            fields: Vec::new(),
            methods: IndexMap::new(),
            getters: IndexMap::new(),
            setters: IndexMap::new(),
            constructor: None,
            indexed_get: None,
            indexed_set: None,
            size: 0,
        });
        match &mut self.elem_mut(prototype).data {
            ElementData::ClassPrototype(data) => {
                data.instances.insert(key, id);
            }
            _ => unreachable!(),
        }

        let mut offset = base.map(|b| self.class(b).size).unwrap_or(0);
        let mut fields = Vec::new();
        let mut methods = IndexMap::new();
        let mut getters = IndexMap::new();
        let mut setters = IndexMap::new();
        let mut constructor = None;
        let mut indexed_get = None;
        let mut indexed_set = None;
        for member in &declaration.members {
            match member {
                ClassMember::Field(field) => {
                    if field.flags.contains(DeclarationFlags::STATIC) {
                        continue;
                    }
                    let ty = self.resolve_type(
                        &field.type_annotation,
                        Some(&type_map),
                        target,
                        diags,
                    )?;
                    let size = ty.byte_size();
                    offset = align_offset(offset, size);
                    fields.push(Field {
                        name: field.name.clone(),
                        ty,
                        offset,
                        readonly: field.flags.contains(DeclarationFlags::READONLY),
                        initializer: field.initializer.clone().map(Rc::new),
                        range: field.range,
                    });
                    offset += size;
                }
                ClassMember::Method(method) => {
                    if method.flags.contains(DeclarationFlags::STATIC) {
                        continue;
                    }
                    // Accessors share their property's name; the internal
                    // name keeps them apart.
                    let accessor = if method.flags.contains(DeclarationFlags::GET) {
                        "get:"
                    } else if method.flags.contains(DeclarationFlags::SET) {
                        "set:"
                    } else {
                        ""
                    };
                    let member_internal = format!(
                        "{internal_name}{INSTANCE_DELIMITER}{accessor}{}",
                        method.name
                    );
                    let mut flags = Self::declaration_flags(method.flags);
                    if !method.type_parameters.is_empty() {
                        flags |= ElementFlags::GENERIC;
                    }
                    let member_id = self.add_anonymous_element(Element {
                        internal_name: member_internal,
                        simple_name: method.name.clone(),
                        flags,
                        data: ElementData::FunctionPrototype(FunctionPrototypeData {
                            declaration: Rc::new(method.clone()),
                            instances: HashMap::new(),
                            class: Some(id),
                        }),
                    });
                    if method.flags.contains(DeclarationFlags::CONSTRUCTOR) {
                        constructor = Some(member_id);
                    } else if method.flags.contains(DeclarationFlags::GET) {
                        getters.insert(method.name.clone(), member_id);
                    } else if method.flags.contains(DeclarationFlags::SET) {
                        setters.insert(method.name.clone(), member_id);
                    } else if method.name == "[]" {
                        indexed_get = Some(member_id);
                    } else if method.name == "[]=" {
                        indexed_set = Some(member_id);
                    } else {
                        methods.insert(method.name.clone(), member_id);
                    }
                }
            }
        }

        let class = self.class_mut(id);
        class.fields = fields;
        class.methods = methods;
        class.getters = getters;
        class.setters = setters;
        class.constructor = constructor;
        class.indexed_get = indexed_get;
        class.indexed_set = indexed_set;
        class.size = offset;
        Some(id)
    }

    // --- member lookup along the base chain ----------------------------

    pub fn lookup_field(&self, class: ClassId, name: &str) -> Option<(ClassId, usize)> {
        let mut current = Some(class);
        while let Some(id) = current {
            let class = self.class(id);
            if let Some(index) = class.fields.iter().position(|f| f.name == name) {
                return Some((id, index));
            }
            current = class.base;
        }
        None
    }

    pub fn lookup_method(&self, class: ClassId, name: &str) -> Option<ElementId> {
        self.lookup_member(class, |c| c.methods.get(name).copied())
    }

    pub fn lookup_getter(&self, class: ClassId, name: &str) -> Option<ElementId> {
        self.lookup_member(class, |c| c.getters.get(name).copied())
    }

    pub fn lookup_setter(&self, class: ClassId, name: &str) -> Option<ElementId> {
        self.lookup_member(class, |c| c.setters.get(name).copied())
    }

    pub fn lookup_indexed_get(&self, class: ClassId) -> Option<ElementId> {
        self.lookup_member(class, |c| c.indexed_get)
    }

    pub fn lookup_indexed_set(&self, class: ClassId) -> Option<ElementId> {
        self.lookup_member(class, |c| c.indexed_set)
    }

    pub fn lookup_constructor(&self, class: ClassId) -> Option<ElementId> {
        self.class(class).constructor
    }

    fn lookup_member(
        &self,
        class: ClassId,
        get: impl Fn(&Class) -> Option<ElementId>,
    ) -> Option<ElementId> {
        let mut current = Some(class);
        while let Some(id) = current {
            let class = self.class(id);
            if let Some(member) = get(class) {
                return Some(member);
            }
            current = class.base;
        }
        None
    }

    /// Creates a synthetic function instance that has no source-level
    /// prototype: the start function and trampolines.
    pub fn add_synthetic_function(
        &mut self,
        internal_name: impl Into<String>,
        signature: SignatureId,
        locals: Vec<Local>,
        class: Option<ClassId>,
    ) -> ElementId {
        let internal_name = internal_name.into();
        let simple_name = internal_name
            .rsplit(PATH_DELIMITER)
            .next()
            .unwrap_or(&internal_name)
            .to_string();
        let param_count = locals.len();
        self.add_anonymous_element(Element {
            internal_name,
            simple_name,
            flags: ElementFlags::empty(),
            data: ElementData::Function(FunctionData {
                prototype: None,
                signature,
                locals,
                param_count,
                type_arguments: HashMap::new(),
                class,
                table_index: None,
                trampoline: None,
                free_temps: Vec::new(),
                next_label: 0,
            }),
        })
    }

    /// Finds a top-level function prototype by simple name, used to
    /// locate runtime builtins such as the allocator.
    pub fn find_function_prototype(&self, simple_name: &str) -> Option<ElementId> {
        self.elements.values().copied().find(|&id| {
            let element = self.elem(id);
            element.simple_name == simple_name
                && matches!(element.data, ElementData::FunctionPrototype(_))
        })
    }


    pub fn source_index_of(&self, normalized_path: &str) -> Option<usize> {
        self.sources
            .iter()
            .position(|s| s.normalized_path == normalized_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{EnumValueDeclaration, FieldDeclaration, ParameterDeclaration};

    fn function_decl(name: &str, params: Vec<ParameterDeclaration>) -> FunctionDeclaration {
        FunctionDeclaration {
            name: name.into(),
            type_parameters: Vec::new(),
            parameters: params,
            return_type: Some(TypeNode::named("i32")),
            body: Some(Vec::new()),
            flags: DeclarationFlags::empty(),
            range: Range::default(),
        }
    }

    fn param(name: &str, ty: &str) -> ParameterDeclaration {
        ParameterDeclaration {
            name: name.into(),
            type_annotation: TypeNode::named(ty),
            initializer: None,
            is_rest: false,
            range: Range::default(),
        }
    }

    #[test]
    fn initialize_registers_declarations_by_internal_name() {
        let mut program = Program::new();
        program.add_source(
            "src",
            true,
            vec![Statement::Function(Rc::new(function_decl("add", vec![])))],
        );
        let mut diags = Diagnostics::new();
        program.initialize(&mut diags);
        assert!(!diags.has_errors());
        assert!(program.elements.contains_key("src/add"));
    }

    #[test]
    fn function_instances_are_cached_per_type_arguments() {
        let mut program = Program::new();
        let mut decl = function_decl("id", vec![param("value", "T")]);
        decl.type_parameters.push("T".into());
        decl.return_type = Some(TypeNode::named("T"));
        program.add_source("src", true, vec![Statement::Function(Rc::new(decl))]);
        let mut diags = Diagnostics::new();
        program.initialize(&mut diags);
        let proto = program.elements["src/id"];
        let a = program
            .resolve_using_type_arguments(
                proto,
                &[Type::I32],
                Target::Wasm32,
                Range::default(),
                &mut diags,
            )
            .unwrap();
        let b = program
            .resolve_using_type_arguments(
                proto,
                &[Type::I32],
                Target::Wasm32,
                Range::default(),
                &mut diags,
            )
            .unwrap();
        let c = program
            .resolve_using_type_arguments(
                proto,
                &[Type::F64],
                Target::Wasm32,
                Range::default(),
                &mut diags,
            )
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let signature = program.signature(program.function_data(c).signature);
        assert_eq!(signature.parameter_types, vec![Type::F64]);
        assert_eq!(signature.return_type, Type::F64);
    }

    #[test]
    fn class_layout_aligns_fields() {
        let mut program = Program::new();
        let decl = ClassDeclaration {
            name: "Point".into(),
            type_parameters: Vec::new(),
            extends: None,
            members: vec![
                ClassMember::Field(FieldDeclaration {
                    name: "tag".into(),
                    type_annotation: TypeNode::named("u8"),
                    initializer: None,
                    flags: DeclarationFlags::empty(),
                    range: Range::default(),
                }),
                ClassMember::Field(FieldDeclaration {
                    name: "x".into(),
                    type_annotation: TypeNode::named("f64"),
                    initializer: None,
                    flags: DeclarationFlags::empty(),
                    range: Range::default(),
                }),
                ClassMember::Field(FieldDeclaration {
                    name: "y".into(),
                    type_annotation: TypeNode::named("i32"),
                    initializer: None,
                    flags: DeclarationFlags::empty(),
                    range: Range::default(),
                }),
            ],
            flags: DeclarationFlags::empty(),
            range: Range::default(),
        };
        program.add_source("src", true, vec![Statement::Class(Rc::new(decl))]);
        let mut diags = Diagnostics::new();
        program.initialize(&mut diags);
        let proto = program.elements["src/Point"];
        let class = program
            .resolve_class_type_arguments(proto, &[], Target::Wasm32, Range::default(), &mut diags)
            .unwrap();
        let class = program.class(class);
        assert_eq!(class.fields[0].offset, 0);
        assert_eq!(class.fields[1].offset, 8);
        assert_eq!(class.fields[2].offset, 16);
        assert_eq!(class.size, 20);
    }

    #[test]
    fn enum_values_resolve_in_declaration_order() {
        let mut program = Program::new();
        let decl = EnumDeclaration {
            name: "Kind".into(),
            values: vec![
                EnumValueDeclaration {
                    name: "A".into(),
                    value: None,
                    range: Range::default(),
                },
                EnumValueDeclaration {
                    name: "B".into(),
                    value: None,
                    range: Range::default(),
                },
            ],
            flags: DeclarationFlags::empty(),
            range: Range::default(),
        };
        program.add_source("src", true, vec![Statement::Enum(decl)]);
        let mut diags = Diagnostics::new();
        program.initialize(&mut diags);
        let enum_id = program.elements["src/Kind"];
        let value = program.resolve_property(enum_id, "B").unwrap();
        match &program.elem(value).data {
            ElementData::EnumValue(data) => assert_eq!(data.index, 1),
            _ => panic!("expected enum value"),
        }
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let mut program = Program::new();
        program.add_source(
            "src",
            true,
            vec![
                Statement::Function(Rc::new(function_decl("f", vec![]))),
                Statement::Function(Rc::new(function_decl("f", vec![]))),
            ],
        );
        let mut diags = Diagnostics::new();
        program.initialize(&mut diags);
        assert!(diags.has_errors());
    }
}
