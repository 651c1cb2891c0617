//! Glyph: a small DSL for HTTP and WebSocket handlers.
//!
//! Source is lexed, parsed into an [`ast::Module`], compiled per route into
//! [`bytecode`] modules, and executed on the stack [`vm::Vm`]. The
//! [`interpreter`] runs the same AST directly.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod host;
pub mod interpreter;
pub mod lexer;
pub mod ops;
pub mod parser;
pub mod reload;
pub mod value;
pub mod vm;

pub use compiler::{CompileError, CompiledProgram, Compiler, OptLevel};
pub use host::{HostCallBridge, HostError};
pub use value::Value;
pub use vm::{Vm, VmConfig, VmError};
