//! Resolved syntax nodes handed over by the front end.
//!
//! The compiler consumes these the way a code translator consumes a
//! decoded operator stream: as passive input. There is no parser here;
//! the front end (or a test fixture) constructs the nodes directly.

use std::rc::Rc;

use bitflags::bitflags;

/// Byte range within one source, used for diagnostics and source maps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub source: u32,
    pub start: u32,
    pub end: u32,
}

impl Range {
    pub fn new(source: u32, start: u32, end: u32) -> Range {
        Range { source, start, end }
    }
}

/// An unresolved type annotation, resolved on demand against the program's
/// named types and the contextual type arguments of the enclosing
/// generic instance.
#[derive(Clone, Debug)]
pub struct TypeNode {
    pub name: String,
    pub type_arguments: Vec<TypeNode>,
    pub range: Range,
}

impl TypeNode {
    pub fn named(name: impl Into<String>) -> TypeNode {
        TypeNode {
            name: name.into(),
            type_arguments: Vec::new(),
            range: Range::default(),
        }
    }

    pub fn with_arguments(name: impl Into<String>, type_arguments: Vec<TypeNode>) -> TypeNode {
        TypeNode {
            name: name.into(),
            type_arguments,
            range: Range::default(),
        }
    }
}

bitflags! {
    /// Modifiers attached to declarations.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeclarationFlags: u16 {
        const EXPORT      = 1 << 0;
        const DECLARE     = 1 << 1;
        const CONST       = 1 << 2;
        const LET         = 1 << 3;
        const STATIC      = 1 << 4;
        const READONLY    = 1 << 5;
        const GET         = 1 << 6;
        const SET         = 1 << 7;
        const CONSTRUCTOR = 1 << 8;
        const BUILTIN     = 1 << 9;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
    Plus,
    Minus,
    Not,
    BitwiseNot,
    Increment,
    Decrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    ShrU,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    LogicalAnd,
    LogicalOr,
}

#[derive(Clone, Debug)]
pub enum Expression {
    Null { range: Range },
    True { range: Range },
    False { range: Range },
    This { range: Range },
    Super { range: Range },
    Identifier { name: String, range: Range },
    IntegerLiteral { value: i64, range: Range },
    FloatLiteral { value: f64, range: Range },
    StringLiteral { value: String, range: Range },
    ArrayLiteral { elements: Vec<Expression>, range: Range },
    Parenthesized { inner: Box<Expression>, range: Range },
    PropertyAccess { target: Box<Expression>, property: String, range: Range },
    ElementAccess { target: Box<Expression>, index: Box<Expression>, range: Range },
    Call {
        callee: Box<Expression>,
        type_arguments: Vec<TypeNode>,
        arguments: Vec<Expression>,
        range: Range,
    },
    New {
        class: Box<Expression>,
        type_arguments: Vec<TypeNode>,
        arguments: Vec<Expression>,
        range: Range,
    },
    UnaryPrefix { operator: UnaryOperator, operand: Box<Expression>, range: Range },
    UnaryPostfix { operator: UnaryOperator, operand: Box<Expression>, range: Range },
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
        range: Range,
    },
    /// `target = value`, or a compound form when `operator` is set.
    Assignment {
        operator: Option<BinaryOperator>,
        target: Box<Expression>,
        value: Box<Expression>,
        range: Range,
    },
    Ternary {
        condition: Box<Expression>,
        if_then: Box<Expression>,
        if_else: Box<Expression>,
        range: Range,
    },
}

impl Expression {
    pub fn range(&self) -> Range {
        match self {
            Expression::Null { range }
            | Expression::True { range }
            | Expression::False { range }
            | Expression::This { range }
            | Expression::Super { range }
            | Expression::Identifier { range, .. }
            | Expression::IntegerLiteral { range, .. }
            | Expression::FloatLiteral { range, .. }
            | Expression::StringLiteral { range, .. }
            | Expression::ArrayLiteral { range, .. }
            | Expression::Parenthesized { range, .. }
            | Expression::PropertyAccess { range, .. }
            | Expression::ElementAccess { range, .. }
            | Expression::Call { range, .. }
            | Expression::New { range, .. }
            | Expression::UnaryPrefix { range, .. }
            | Expression::UnaryPostfix { range, .. }
            | Expression::Binary { range, .. }
            | Expression::Assignment { range, .. }
            | Expression::Ternary { range, .. } => *range,
        }
    }

    // Terse constructors, standing in for the parser when fixtures build
    // programs by hand.

    pub fn ident(name: impl Into<String>) -> Expression {
        Expression::Identifier { name: name.into(), range: Range::default() }
    }

    pub fn int(value: i64) -> Expression {
        Expression::IntegerLiteral { value, range: Range::default() }
    }

    pub fn float(value: f64) -> Expression {
        Expression::FloatLiteral { value, range: Range::default() }
    }

    pub fn string(value: impl Into<String>) -> Expression {
        Expression::StringLiteral { value: value.into(), range: Range::default() }
    }

    pub fn binary(operator: BinaryOperator, left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            operator,
            left: Box::new(left),
            right: Box::new(right),
            range: Range::default(),
        }
    }

    pub fn unary(operator: UnaryOperator, operand: Expression) -> Expression {
        Expression::UnaryPrefix {
            operator,
            operand: Box::new(operand),
            range: Range::default(),
        }
    }

    pub fn assign(target: Expression, value: Expression) -> Expression {
        Expression::Assignment {
            operator: None,
            target: Box::new(target),
            value: Box::new(value),
            range: Range::default(),
        }
    }

    pub fn compound_assign(
        operator: BinaryOperator,
        target: Expression,
        value: Expression,
    ) -> Expression {
        Expression::Assignment {
            operator: Some(operator),
            target: Box::new(target),
            value: Box::new(value),
            range: Range::default(),
        }
    }

    pub fn call(callee: Expression, arguments: Vec<Expression>) -> Expression {
        Expression::Call {
            callee: Box::new(callee),
            type_arguments: Vec::new(),
            arguments,
            range: Range::default(),
        }
    }

    pub fn property(target: Expression, property: impl Into<String>) -> Expression {
        Expression::PropertyAccess {
            target: Box::new(target),
            property: property.into(),
            range: Range::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VariableDeclaration {
    pub name: String,
    pub type_annotation: Option<TypeNode>,
    pub initializer: Option<Expression>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct VariableStatement {
    pub declarations: Vec<VariableDeclaration>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct ParameterDeclaration {
    pub name: String,
    pub type_annotation: TypeNode,
    pub initializer: Option<Expression>,
    pub is_rest: bool,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct FunctionDeclaration {
    pub name: String,
    pub type_parameters: Vec<String>,
    pub parameters: Vec<ParameterDeclaration>,
    pub return_type: Option<TypeNode>,
    pub body: Option<Vec<Statement>>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct FieldDeclaration {
    pub name: String,
    pub type_annotation: TypeNode,
    pub initializer: Option<Expression>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub enum ClassMember {
    Field(FieldDeclaration),
    /// Methods, accessors (`GET`/`SET` flags), the constructor
    /// (`CONSTRUCTOR` flag) and the `[]`/`[]=` operators by name.
    Method(FunctionDeclaration),
}

#[derive(Clone, Debug)]
pub struct ClassDeclaration {
    pub name: String,
    pub type_parameters: Vec<String>,
    pub extends: Option<TypeNode>,
    pub members: Vec<ClassMember>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct EnumValueDeclaration {
    pub name: String,
    pub value: Option<Expression>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct EnumDeclaration {
    pub name: String,
    pub values: Vec<EnumValueDeclaration>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct NamespaceDeclaration {
    pub name: String,
    pub members: Vec<Statement>,
    pub flags: DeclarationFlags,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct ImportDeclaration {
    pub name: String,
    pub external_name: String,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct ImportStatement {
    pub declarations: Vec<ImportDeclaration>,
    pub path: String,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct ExportMember {
    pub name: String,
    pub external_name: String,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct ExportStatement {
    pub members: Vec<ExportMember>,
    /// Set for re-exports (`export { a } from "other"`).
    pub path: Option<String>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub struct SwitchCase {
    /// `None` marks the `default` case.
    pub label: Option<Expression>,
    pub statements: Vec<Statement>,
    pub range: Range,
}

#[derive(Clone, Debug)]
pub enum Statement {
    Block { statements: Vec<Statement>, range: Range },
    Break { label: Option<String>, range: Range },
    Continue { label: Option<String>, range: Range },
    Do { body: Box<Statement>, condition: Expression, range: Range },
    Empty { range: Range },
    Expression { expression: Expression, range: Range },
    For {
        initializer: Option<Box<Statement>>,
        condition: Option<Expression>,
        incrementor: Option<Expression>,
        body: Box<Statement>,
        range: Range,
    },
    If {
        condition: Expression,
        if_true: Box<Statement>,
        if_false: Option<Box<Statement>>,
        range: Range,
    },
    Return { value: Option<Expression>, range: Range },
    Switch { condition: Expression, cases: Vec<SwitchCase>, range: Range },
    Throw { value: Expression, range: Range },
    Try { range: Range },
    While { condition: Expression, body: Box<Statement>, range: Range },
    Variable(VariableStatement),
    Function(Rc<FunctionDeclaration>),
    Class(Rc<ClassDeclaration>),
    Enum(EnumDeclaration),
    Namespace(NamespaceDeclaration),
    Interface { name: String, range: Range },
    Import(ImportStatement),
    Export(ExportStatement),
}

impl Statement {
    pub fn range(&self) -> Range {
        match self {
            Statement::Block { range, .. }
            | Statement::Break { range, .. }
            | Statement::Continue { range, .. }
            | Statement::Do { range, .. }
            | Statement::Empty { range }
            | Statement::Expression { range, .. }
            | Statement::For { range, .. }
            | Statement::If { range, .. }
            | Statement::Return { range, .. }
            | Statement::Switch { range, .. }
            | Statement::Throw { range, .. }
            | Statement::Try { range }
            | Statement::While { range, .. }
            | Statement::Interface { range, .. } => *range,
            Statement::Variable(decl) => decl.range,
            Statement::Function(decl) => decl.range,
            Statement::Class(decl) => decl.range,
            Statement::Enum(decl) => decl.range,
            Statement::Namespace(decl) => decl.range,
            Statement::Import(decl) => decl.range,
            Statement::Export(decl) => decl.range,
        }
    }

    /// Whether this statement declares something at module level rather
    /// than contributing code to the start function.
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            Statement::Variable(_)
                | Statement::Function(_)
                | Statement::Class(_)
                | Statement::Enum(_)
                | Statement::Namespace(_)
                | Statement::Interface { .. }
                | Statement::Import(_)
                | Statement::Export(_)
        )
    }

    pub fn expr(expression: Expression) -> Statement {
        Statement::Expression { expression, range: Range::default() }
    }

    pub fn ret(value: Option<Expression>) -> Statement {
        Statement::Return { value, range: Range::default() }
    }

    pub fn block(statements: Vec<Statement>) -> Statement {
        Statement::Block { statements, range: Range::default() }
    }
}
