//! Heap object model.
//!
//! Every heap object starts with an [`ObjHeader`]: a kind tag, the GC mark
//! bit, a lock bit (bootstrap objects are never collected), and the intrusive
//! `next` link that threads all live objects into the heap's single object
//! list. Concrete objects are `#[repr(C)]` structs whose first field is the
//! header, so an object pointer can be viewed as an `ObjHeader` pointer and
//! downcast again once the kind has been checked.
//!
//! [`GcRef`] is the raw handle handed around the interpreter: a copyable
//! pointer with identity equality. The heap owns the allocation; a `GcRef`
//! stays valid as long as the object is reachable from the roots at every
//! collection point.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::Value;
use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::table::Table;

/// Raw handle to a garbage-collected object.
pub struct GcRef<T>(NonNull<T>);

impl<T> GcRef<T> {
    /// # Safety
    ///
    /// `ptr` must point to a live heap allocation of `T`.
    pub unsafe fn from_ptr(ptr: *mut T) -> GcRef<T> {
        GcRef(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }

    pub(crate) fn cast<U>(self) -> GcRef<U> {
        GcRef(self.0.cast())
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcRef<T> {}

impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcRef<T> {}

impl<T> Deref for GcRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.0.as_ref() }
    }
}

impl<T> DerefMut for GcRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.0.as_mut() }
    }
}

impl<T> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjKind {
    String,
    Upvalue,
    Function,
    Native,
    Closure,
    Class,
    Instance,
    BoundMethod,
    Exception,
    Array,
    Slice,
    Hashmap,
}

/// Common header of every heap object; always the first field.
#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub marked: bool,
    /// Locked objects survive collection even when unreachable. Set for
    /// everything allocated while the STL bootstraps.
    pub locked: bool,
    pub next: *mut ObjHeader,
}

/// Marker for `#[repr(C)]` structs whose first field is an [`ObjHeader`].
pub trait ObjPayload {}

impl ObjPayload for ObjHeader {}
impl ObjPayload for ObjString {}
impl ObjPayload for ObjUpvalue {}
impl ObjPayload for ObjFunction {}
impl ObjPayload for ObjNative {}
impl ObjPayload for ObjClosure {}
impl ObjPayload for ObjClass {}
impl ObjPayload for ObjInstance {}
impl ObjPayload for ObjBoundMethod {}
impl ObjPayload for ObjException {}
impl ObjPayload for ObjArray {}
impl ObjPayload for ObjSlice {}
impl ObjPayload for ObjHashmap {}

impl<T: ObjPayload> GcRef<T> {
    /// Upcast to the common header view.
    pub fn as_obj(self) -> GcRef<ObjHeader> {
        self.cast()
    }
}

impl<T: ObjPayload> From<GcRef<T>> for Value {
    fn from(obj: GcRef<T>) -> Value {
        Value::object(obj.cast())
    }
}

impl GcRef<ObjHeader> {
    pub fn kind(self) -> ObjKind {
        self.kind
    }

    pub fn as_string(self) -> GcRef<ObjString> {
        debug_assert!(self.kind == ObjKind::String);
        self.cast()
    }

    pub fn as_upvalue(self) -> GcRef<ObjUpvalue> {
        debug_assert!(self.kind == ObjKind::Upvalue);
        self.cast()
    }

    pub fn as_function(self) -> GcRef<ObjFunction> {
        debug_assert!(self.kind == ObjKind::Function);
        self.cast()
    }

    pub fn as_native(self) -> GcRef<ObjNative> {
        debug_assert!(self.kind == ObjKind::Native);
        self.cast()
    }

    pub fn as_closure(self) -> GcRef<ObjClosure> {
        debug_assert!(self.kind == ObjKind::Closure);
        self.cast()
    }

    pub fn as_class(self) -> GcRef<ObjClass> {
        debug_assert!(self.kind == ObjKind::Class);
        self.cast()
    }

    pub fn as_instance(self) -> GcRef<ObjInstance> {
        debug_assert!(self.kind == ObjKind::Instance);
        self.cast()
    }

    pub fn as_bound_method(self) -> GcRef<ObjBoundMethod> {
        debug_assert!(self.kind == ObjKind::BoundMethod);
        self.cast()
    }

    pub fn as_exception(self) -> GcRef<ObjException> {
        debug_assert!(self.kind == ObjKind::Exception);
        self.cast()
    }

    pub fn as_array(self) -> GcRef<ObjArray> {
        debug_assert!(self.kind == ObjKind::Array);
        self.cast()
    }

    pub fn as_slice(self) -> GcRef<ObjSlice> {
        debug_assert!(self.kind == ObjKind::Slice);
        self.cast()
    }

    pub fn as_hashmap(self) -> GcRef<ObjHashmap> {
        debug_assert!(self.kind == ObjKind::Hashmap);
        self.cast()
    }
}

// Kind checks and casts straight off a Value.
impl Value {
    #[inline]
    fn is_obj_kind(self, kind: ObjKind) -> bool {
        self.is_obj() && self.as_obj().kind == kind
    }

    pub fn is_string(self) -> bool {
        self.is_obj_kind(ObjKind::String)
    }
    pub fn is_function(self) -> bool {
        self.is_obj_kind(ObjKind::Function)
    }
    pub fn is_native(self) -> bool {
        self.is_obj_kind(ObjKind::Native)
    }
    pub fn is_closure(self) -> bool {
        self.is_obj_kind(ObjKind::Closure)
    }
    pub fn is_class(self) -> bool {
        self.is_obj_kind(ObjKind::Class)
    }
    pub fn is_instance(self) -> bool {
        self.is_obj_kind(ObjKind::Instance)
    }
    pub fn is_bound_method(self) -> bool {
        self.is_obj_kind(ObjKind::BoundMethod)
    }
    pub fn is_exception(self) -> bool {
        self.is_obj_kind(ObjKind::Exception)
    }
    pub fn is_array(self) -> bool {
        self.is_obj_kind(ObjKind::Array)
    }
    pub fn is_slice(self) -> bool {
        self.is_obj_kind(ObjKind::Slice)
    }
    pub fn is_hashmap(self) -> bool {
        self.is_obj_kind(ObjKind::Hashmap)
    }

    pub fn as_string(self) -> GcRef<ObjString> {
        self.as_obj().as_string()
    }
    pub fn as_function(self) -> GcRef<ObjFunction> {
        self.as_obj().as_function()
    }
    pub fn as_native(self) -> GcRef<ObjNative> {
        self.as_obj().as_native()
    }
    pub fn as_closure(self) -> GcRef<ObjClosure> {
        self.as_obj().as_closure()
    }
    pub fn as_class(self) -> GcRef<ObjClass> {
        self.as_obj().as_class()
    }
    pub fn as_instance(self) -> GcRef<ObjInstance> {
        self.as_obj().as_instance()
    }
    pub fn as_bound_method(self) -> GcRef<ObjBoundMethod> {
        self.as_obj().as_bound_method()
    }
    pub fn as_exception(self) -> GcRef<ObjException> {
        self.as_obj().as_exception()
    }
    pub fn as_array(self) -> GcRef<ObjArray> {
        self.as_obj().as_array()
    }
    pub fn as_slice(self) -> GcRef<ObjSlice> {
        self.as_obj().as_slice()
    }
    pub fn as_hashmap(self) -> GcRef<ObjHashmap> {
        self.as_obj().as_hashmap()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", print_value(*self))
    }
}

/// Strings cache their FNV-1a hash at interning time, which makes hash-table
/// lookups O(1) after the one-time computation.
#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u32,
    pub chars: String,
}

/// A closure's capture cell. Open upvalues index into the VM value stack and
/// sit on the VM's open list, sorted by descending stack index with at most
/// one node per slot. Closing moves the live value into the cell itself.
#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
    pub next: *mut ObjUpvalue,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

/// Compiled function. Immutable once compilation of its body ends.
#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: usize,
    pub upvalue_count: usize,
    /// Marks the synthetic function a `try` block compiles into; the throw
    /// unwinder stops at the innermost frame whose function carries this.
    pub from_try: bool,
    pub chunk: Chunk,
    pub name: Option<GcRef<ObjString>>,
}

/// Host function installed into the STL at VM startup.
///
/// `args[0]` is the receiver slot (the callee for plain calls, the receiver
/// for sentinel-class method dispatch); the declared arguments follow.
pub type NativeFn = fn(&mut Heap, &mut [Value]) -> NativeResult;

/// Explicit native outcome, replacing the original's empty-value sentinel
/// convention.
pub enum NativeResult {
    Return(Value),
    Throw(Value),
}

#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    /// Declared arity; -1 accepts any number of arguments.
    pub arity: i32,
    pub function: NativeFn,
    pub name: GcRef<ObjString>,
}

#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: GcRef<ObjFunction>,
    /// Always exactly `function.upvalue_count` entries once constructed.
    pub upvalues: Vec<GcRef<ObjUpvalue>>,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: GcRef<ObjString>,
    pub methods: Table,
    pub statics: Table,
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: GcRef<ObjClass>,
    pub fields: Table,
}

/// `this`/receiver paired with a function, closure, or native.
#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: GcRef<ObjHeader>,
}

#[repr(C)]
pub struct ObjException {
    pub header: ObjHeader,
    pub payload: Value,
}

#[repr(C)]
pub struct ObjArray {
    pub header: ObjHeader,
    pub elements: Vec<Value>,
}

/// Subscript range descriptor. Each component is a number or nil (meaning
/// "default"); step is never zero.
#[repr(C)]
pub struct ObjSlice {
    pub header: ObjHeader,
    pub start: Value,
    pub end: Value,
    pub step: Value,
}

#[repr(C)]
pub struct ObjHashmap {
    pub header: ObjHeader,
    pub data: Table,
}

/// Footprint of an object including its owned buffers, used for the GC's
/// allocation accounting.
pub fn obj_size(obj: GcRef<ObjHeader>) -> usize {
    match obj.kind() {
        ObjKind::String => {
            mem::size_of::<ObjString>() + obj.as_string().chars.capacity()
        }
        ObjKind::Upvalue => mem::size_of::<ObjUpvalue>(),
        ObjKind::Function => {
            let function = obj.as_function();
            mem::size_of::<ObjFunction>()
                + function.chunk.code.capacity()
                + function.chunk.constants.capacity() * mem::size_of::<Value>()
        }
        ObjKind::Native => mem::size_of::<ObjNative>(),
        ObjKind::Closure => {
            mem::size_of::<ObjClosure>()
                + obj.as_closure().upvalues.capacity() * mem::size_of::<GcRef<ObjUpvalue>>()
        }
        ObjKind::Class => {
            let class = obj.as_class();
            mem::size_of::<ObjClass>()
                + (class.methods.capacity() + class.statics.capacity()) * mem::size_of::<[Value; 2]>()
        }
        ObjKind::Instance => {
            mem::size_of::<ObjInstance>()
                + obj.as_instance().fields.capacity() * mem::size_of::<[Value; 2]>()
        }
        ObjKind::BoundMethod => mem::size_of::<ObjBoundMethod>(),
        ObjKind::Exception => mem::size_of::<ObjException>(),
        ObjKind::Array => {
            mem::size_of::<ObjArray>() + obj.as_array().elements.capacity() * mem::size_of::<Value>()
        }
        ObjKind::Slice => mem::size_of::<ObjSlice>(),
        ObjKind::Hashmap => {
            mem::size_of::<ObjHashmap>()
                + obj.as_hashmap().data.capacity() * mem::size_of::<[Value; 2]>()
        }
    }
}

/// Render a number the way the language prints it: integral values without a
/// fractional part, everything else in Rust's shortest-roundtrip form.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub fn function_name(function: GcRef<ObjFunction>) -> String {
    match function.name {
        Some(name) => format!("<fn {}>", name.chars),
        None => "<script>".to_string(),
    }
}

/// The built-in stringifier used by `print` and the `string` native when no
/// user `toString` applies.
pub fn print_value(value: Value) -> String {
    if value.is_empty() {
        return "<empty>".to_string();
    }
    if value.is_nil() {
        return "nil".to_string();
    }
    if value.is_bool() {
        return if value.as_bool() { "true" } else { "false" }.to_string();
    }
    if value.is_number() {
        return format_number(value.as_number());
    }

    let obj = value.as_obj();
    match obj.kind() {
        ObjKind::String => obj.as_string().chars.clone(),
        ObjKind::Upvalue => "<upvalue>".to_string(),
        ObjKind::Function => function_name(obj.as_function()),
        ObjKind::Native => format!("<fn {}>", obj.as_native().name.chars),
        ObjKind::Closure => function_name(obj.as_closure().function),
        ObjKind::Class => format!("<class {}>", obj.as_class().name.chars),
        ObjKind::Instance => format!("<{} instance>", obj.as_instance().class.name.chars),
        ObjKind::BoundMethod => print_value(Value::object(obj.as_bound_method().method)),
        ObjKind::Exception => {
            format!("Exception: {}", print_value(obj.as_exception().payload))
        }
        ObjKind::Array => {
            let parts: Vec<String> = obj
                .as_array()
                .elements
                .iter()
                .map(|&element| print_value(element))
                .collect();
            format!("[{}]", parts.join(", "))
        }
        ObjKind::Slice => {
            let slice = obj.as_slice();
            format!(
                "Slice({}, {}, {})",
                print_value(slice.start),
                print_value(slice.end),
                print_value(slice.step)
            )
        }
        ObjKind::Hashmap => {
            let parts: Vec<String> = obj
                .as_hashmap()
                .data
                .iter()
                .map(|(k, v)| format!("{}: {}", print_value(k), print_value(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}
