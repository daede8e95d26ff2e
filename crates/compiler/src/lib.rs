//! Lox compiler: scanner and single-pass Pratt parser/emitter.
//!
//! `compile` turns source text into a top-level `ObjFunction` allocated on
//! the caller's heap, collecting `[line N] Error at 'lexeme': message`
//! diagnostics along the way. There is no AST; bytecode is emitted while the
//! tokens stream by.

mod compiler;
mod scanner;

pub use compiler::{CompileError, CompileOptions, MAX_LOCALS, MAX_UPVALUES, compile};
pub use scanner::{Scanner, Token, TokenKind};
