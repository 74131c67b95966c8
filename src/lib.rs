//! Compiler from TScript — a statically-typed, class-based,
//! TypeScript-like language with generics — into WebAssembly IR.
//!
//! The crate is the lowering engine of a larger toolchain: it consumes a
//! fully parsed and semantically resolved [`program::Program`] and walks
//! its declarations and expressions, emitting a typed intermediate
//! representation ([`module::Module`]) suitable for a WebAssembly
//! backend. Lexing, parsing and type checking are out of scope; test
//! fixtures construct resolved programs directly.
//!
//! The interesting machinery:
//!
//! - the numeric bridge with its small-integer wrapping discipline and
//!   the implicit/explicit conversion matrix ([`compiler`]),
//! - the flow analyzer proving "all paths return" and tracking
//!   break/continue scopes,
//! - direct and indirect call lowering with per-callee trampolines that
//!   dispatch on the number of supplied optional arguments,
//! - static memory layout with string interning and `HEAP_BASE`,
//! - precompute-driven constant folding of initializers.
//!
//! ```
//! use tscript_wasm::ast::{Expression, Statement};
//! use tscript_wasm::compiler::{Compiler, Options};
//! use tscript_wasm::program::Program;
//!
//! let mut program = Program::new();
//! program.add_source("main", true, vec![Statement::expr(Expression::int(42))]);
//! let compiled = Compiler::compile(&mut program, Options::default()).unwrap();
//! assert!(compiled.module.start.is_some());
//! ```

pub mod ast;
pub mod compiler;
pub mod diagnostics;
pub mod module;
pub mod program;
pub mod types;

pub use compiler::{CompileError, CompiledModule, Compiler, Options};
pub use diagnostics::{DiagnosticCategory, DiagnosticCode, DiagnosticMessage};
pub use module::Module;
pub use program::Program;
pub use types::{Target, Type};
