//! Diagnostic codes and the sink that collects them.
//!
//! Compilation never aborts on a semantic problem. Offending constructs
//! lower to an `unreachable` placeholder and a message is pushed into the
//! sink, so that a single run surfaces as many findings as possible.

use std::fmt;

use thiserror::Error;

use crate::ast::Range;

/// Severity of a reported message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticCategory {
    Info,
    Warning,
    Error,
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DiagnosticCategory::Info => write!(f, "info"),
            DiagnosticCategory::Warning => write!(f, "warning"),
            DiagnosticCategory::Error => write!(f, "error"),
        }
    }
}

/// Stable identifiers for every message the compiler can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticCode {
    OperationNotSupported = 100,
    OperatorCannotBeApplied = 101,
    TypeNotAssignable = 102,
    TypeExpected = 103,
    CannotInferType = 104,
    UnexpectedVoid = 105,
    ModuloOnFloats = 106,

    UnresolvableIdentifier = 200,
    UnresolvableMember = 201,
    DuplicateName = 202,
    NotCallable = 203,
    ArityMismatch = 204,
    TypeArgumentMismatch = 205,
    RestParametersNotSupported = 206,
    BuiltinMissing = 207,

    MutableGlobalImport = 300,
    ConstantGlobalNotFoldable = 301,
    CannotAssignToConstant = 302,
    ReadonlyAssignment = 303,
    PropertyWithoutSetter = 304,
    MissingIndexedAccess = 305,
    ForwardEnumReference = 306,
    NonConstantArrayLiteral = 307,
    MutableGlobalExport = 308,

    FunctionMustReturn = 400,
    BreakOutsideLoop = 401,
    ContinueOutsideLoop = 402,
    LabelsNotSupported = 403,
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// One reported finding with its source range.
#[derive(Clone, Debug, Error)]
#[error("{category} TS{code}: {message}")]
pub struct DiagnosticMessage {
    pub code: DiagnosticCode,
    pub category: DiagnosticCategory,
    pub message: String,
    pub range: Range,
}

/// Collects messages emitted while compiling one program.
#[derive(Debug, Default)]
pub struct Diagnostics {
    messages: Vec<DiagnosticMessage>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &mut self,
        category: DiagnosticCategory,
        code: DiagnosticCode,
        range: Range,
        message: impl Into<String>,
    ) {
        let message = DiagnosticMessage {
            code,
            category,
            message: message.into(),
            range,
        };
        log::debug!("{message}");
        self.messages.push(message);
    }

    pub fn error(&mut self, code: DiagnosticCode, range: Range, message: impl Into<String>) {
        self.emit(DiagnosticCategory::Error, code, range, message);
    }

    pub fn warning(&mut self, code: DiagnosticCode, range: Range, message: impl Into<String>) {
        self.emit(DiagnosticCategory::Warning, code, range, message);
    }

    pub fn info(&mut self, code: DiagnosticCode, range: Range, message: impl Into<String>) {
        self.emit(DiagnosticCategory::Info, code, range, message);
    }

    pub fn has_errors(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.category == DiagnosticCategory::Error)
    }

    pub fn messages(&self) -> &[DiagnosticMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<DiagnosticMessage> {
        self.messages
    }
}
