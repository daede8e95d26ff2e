//! Lox VM: the dispatch loop, calling convention, exception unwinding, and
//! the native/sentinel standard library.
//!
//! `Vm::interpret` is the host entry point: compile, push the top-level
//! frame, run to completion. One `Vm` is one interpreter instance; dropping
//! it releases every heap object, and the REPL's `reset` is just a fresh
//! `Vm`.

mod natives;
mod vm;

pub use natives::{MethodDef, NativeDef, SentinelDef, StlEntry, build_stl};
pub use vm::{FRAMES_MAX, InterpretError, RuntimeError, STACK_MAX, Vm, VmOptions};
