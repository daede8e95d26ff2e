//! Lox Core: runtime foundation for the Lox bytecode interpreter.
//!
//! This crate provides everything below the compiler and the dispatch loop:
//!
//! - `value` / `nanbox`: the tagged value representation. The default is a
//!   tagged union; the `nanbox` feature swaps in the 8-byte NaN-boxed
//!   encoding. Both expose an identical API and nothing else may depend on
//!   the choice.
//! - `object`: heap object model (common header, `GcRef` handles, the twelve
//!   object kinds, the primitive stringifier)
//! - `chunk`: bytecode chunks, opcodes, and the compressed line map
//! - `table`: the open-addressing `Value`-keyed hash table and string
//!   interning support
//! - `heap`: the object heap, temp roots, and the precise mark-and-sweep
//!   collector
//! - `debug`: the disassembler

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;

#[cfg(not(feature = "nanbox"))]
mod value;
#[cfg(not(feature = "nanbox"))]
pub use value::{Value, values_equal};

#[cfg(feature = "nanbox")]
mod nanbox;
#[cfg(feature = "nanbox")]
pub use nanbox::{Value, values_equal};

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{
    GcRef, NativeFn, NativeResult, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjException,
    ObjFunction, ObjHashmap, ObjHeader, ObjInstance, ObjKind, ObjNative, ObjSlice, ObjString,
    ObjUpvalue, UpvalueState, format_number, function_name, print_value,
};
pub use table::Table;
