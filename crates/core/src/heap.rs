//! Object heap and precise mark-and-sweep collector.
//!
//! Every allocation is linked into one intrusive list threaded through the
//! object headers; the heap also owns the long-lived tables that double as
//! GC roots (`globals`, `stl`, the weak string intern set, the interned
//! `init` name) and a protected temp-root stack the compiler parks its
//! in-progress functions on.
//!
//! Allocation never collects on its own. The two collection entry points are
//! explicit so the caller that knows the full root set drives the cycle:
//!
//! - the compiler calls [`Heap::maybe_collect`] before allocating — at
//!   compile time nothing lives outside the heap-owned roots;
//! - the VM pre-marks its stack, frames, and open upvalues with
//!   [`Heap::mark_value`] / [`Heap::mark_object`] and then calls
//!   [`Heap::collect`].
//!
//! Either way the collection runs *before* the allocation that would trip the
//! threshold, and afterwards `next_gc = bytes_allocated * 2`.

use std::ptr;

use tracing::{debug, trace};

use crate::Value;
use crate::object::{
    GcRef, NativeFn, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjException, ObjFunction,
    ObjHashmap, ObjHeader, ObjInstance, ObjKind, ObjNative, ObjSlice, ObjString, ObjUpvalue,
    UpvalueState, obj_size,
};
use crate::table::{Table, hash_bytes};

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    /// Head of the intrusive all-objects list.
    objects: *mut ObjHeader,
    /// Weak intern set: string keys, nil values. Reaped each cycle.
    pub strings: Table,
    /// User top-level bindings.
    pub globals: Table,
    /// Built-ins; consulted after `globals`, written only at bootstrap.
    pub stl: Table,
    /// The interned `"init"` name, looked up on every constructor call.
    pub init_string: Value,
    gray: Vec<GcRef<ObjHeader>>,
    temp_roots: Vec<Value>,
    bytes_allocated: usize,
    next_gc: usize,
    /// While set, every allocation is locked against collection.
    bootstrap: bool,
    lambda_counter: u32,
    /// Collect at every opportunity instead of on threshold.
    pub stress: bool,
    /// Dump every allocation, free, and collection cycle to stderr.
    pub log_gc: bool,
}

impl Heap {
    pub fn new() -> Heap {
        let mut heap = Heap {
            objects: ptr::null_mut(),
            strings: Table::new(),
            globals: Table::new(),
            stl: Table::new(),
            init_string: Value::nil(),
            gray: Vec::new(),
            temp_roots: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            bootstrap: false,
            lambda_counter: 0,
            stress: false,
            log_gc: false,
        };
        let mut init = heap.copy_string("init");
        init.header.locked = true;
        heap.init_string = Value::from(init);
        heap
    }

    fn header(&self, kind: ObjKind) -> ObjHeader {
        ObjHeader {
            kind,
            marked: false,
            locked: self.bootstrap,
            next: ptr::null_mut(),
        }
    }

    /// Links a freshly boxed object into the object list.
    ///
    /// `T` must be `#[repr(C)]` with an `ObjHeader` as its first field; the
    /// `new_*` constructors below are the only callers.
    fn allocate<T>(&mut self, object: T) -> GcRef<T> {
        let ptr = Box::into_raw(Box::new(object));
        let header = ptr as *mut ObjHeader;
        unsafe {
            (*header).next = self.objects;
        }
        self.objects = header;

        let gc = unsafe { GcRef::from_ptr(ptr) };
        let kind = unsafe { (*header).kind };
        let size = obj_size(unsafe { GcRef::from_ptr(header) });
        self.bytes_allocated += size;
        if self.log_gc {
            eprintln!("{:p} allocate {} for {:?}", header, size, kind);
        }
        trace!(ptr = ?header, size, kind = ?kind, "allocate");
        gc
    }

    fn allocate_string(&mut self, chars: String, hash: u32) -> GcRef<ObjString> {
        let header = self.header(ObjKind::String);
        let string = self.allocate(ObjString {
            header,
            hash,
            chars,
        });
        self.strings.set(Value::from(string), Value::nil());
        string
    }

    /// Interns a copy of `chars`, returning the canonical object.
    pub fn copy_string(&mut self, chars: &str) -> GcRef<ObjString> {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(interned) = self.strings.find_string(chars, hash) {
            return interned;
        }
        self.allocate_string(chars.to_string(), hash)
    }

    /// Interns an owned buffer, dropping it when an equal string exists.
    pub fn take_string(&mut self, chars: String) -> GcRef<ObjString> {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(interned) = self.strings.find_string(&chars, hash) {
            return interned;
        }
        self.allocate_string(chars, hash)
    }

    /// Synthesizes the next anonymous-function name. The counter is
    /// process-local VM state; a VM reset builds a fresh heap and so resets
    /// it.
    pub fn lambda_name(&mut self) -> GcRef<ObjString> {
        self.lambda_counter += 1;
        self.take_string(format!("lambda{}", self.lambda_counter))
    }

    pub fn new_function(
        &mut self,
        name: Option<GcRef<ObjString>>,
        from_try: bool,
    ) -> GcRef<ObjFunction> {
        let header = self.header(ObjKind::Function);
        self.allocate(ObjFunction {
            header,
            arity: 0,
            upvalue_count: 0,
            from_try,
            chunk: crate::chunk::Chunk::new(),
            name,
        })
    }

    pub fn new_native(
        &mut self,
        function: NativeFn,
        arity: i32,
        name: GcRef<ObjString>,
    ) -> GcRef<ObjNative> {
        let header = self.header(ObjKind::Native);
        self.allocate(ObjNative {
            header,
            arity,
            function,
            name,
        })
    }

    pub fn new_closure(&mut self, function: GcRef<ObjFunction>) -> GcRef<ObjClosure> {
        let header = self.header(ObjKind::Closure);
        let upvalue_count = function.upvalue_count;
        self.allocate(ObjClosure {
            header,
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        })
    }

    pub fn new_upvalue(&mut self, state: UpvalueState) -> GcRef<ObjUpvalue> {
        let header = self.header(ObjKind::Upvalue);
        self.allocate(ObjUpvalue {
            header,
            state,
            next: ptr::null_mut(),
        })
    }

    pub fn new_class(&mut self, name: GcRef<ObjString>) -> GcRef<ObjClass> {
        let header = self.header(ObjKind::Class);
        self.allocate(ObjClass {
            header,
            name,
            methods: Table::new(),
            statics: Table::new(),
        })
    }

    pub fn new_instance(&mut self, class: GcRef<ObjClass>) -> GcRef<ObjInstance> {
        let header = self.header(ObjKind::Instance);
        self.allocate(ObjInstance {
            header,
            class,
            fields: Table::new(),
        })
    }

    pub fn new_bound_method(
        &mut self,
        receiver: Value,
        method: GcRef<ObjHeader>,
    ) -> GcRef<ObjBoundMethod> {
        let header = self.header(ObjKind::BoundMethod);
        self.allocate(ObjBoundMethod {
            header,
            receiver,
            method,
        })
    }

    pub fn new_exception(&mut self, payload: Value) -> GcRef<ObjException> {
        let header = self.header(ObjKind::Exception);
        self.allocate(ObjException { header, payload })
    }

    pub fn new_array(&mut self, elements: Vec<Value>) -> GcRef<ObjArray> {
        let header = self.header(ObjKind::Array);
        self.allocate(ObjArray { header, elements })
    }

    pub fn new_slice(&mut self, start: Value, end: Value, step: Value) -> GcRef<ObjSlice> {
        let header = self.header(ObjKind::Slice);
        self.allocate(ObjSlice {
            header,
            start,
            end,
            step,
        })
    }

    pub fn new_hashmap(&mut self) -> GcRef<ObjHashmap> {
        let header = self.header(ObjKind::Hashmap);
        self.allocate(ObjHashmap {
            header,
            data: Table::new(),
        })
    }

    /// Protects a value across upcoming allocations (the compiler keeps its
    /// whole in-progress function chain here).
    pub fn push_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_root(&mut self) {
        self.temp_roots.pop();
    }

    /// Everything allocated between these two calls is locked against
    /// collection; used while the STL installs.
    pub fn begin_bootstrap(&mut self) {
        self.bootstrap = true;
    }

    pub fn end_bootstrap(&mut self) {
        self.bootstrap = false;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects on the intrusive list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut object = self.objects;
        while !object.is_null() {
            count += 1;
            object = unsafe { (*object).next };
        }
        count
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Collection entry point for contexts where nothing lives outside the
    /// heap-owned roots (compilation, bootstrap). The VM must not use this.
    pub fn maybe_collect(&mut self) {
        if self.should_collect() {
            self.collect();
        }
    }

    fn mark_value_raw(gray: &mut Vec<GcRef<ObjHeader>>, value: Value) {
        if value.is_obj() {
            Self::mark_object_raw(gray, value.as_obj());
        }
    }

    fn mark_object_raw(gray: &mut Vec<GcRef<ObjHeader>>, mut obj: GcRef<ObjHeader>) {
        if obj.marked {
            return;
        }
        obj.marked = true;
        gray.push(obj);
    }

    pub fn mark_value(&mut self, value: Value) {
        Self::mark_value_raw(&mut self.gray, value);
    }

    pub fn mark_object(&mut self, obj: GcRef<ObjHeader>) {
        Self::mark_object_raw(&mut self.gray, obj);
    }

    fn mark_own_roots(&mut self) {
        let gray = &mut self.gray;
        for (key, value) in self.globals.iter() {
            Self::mark_value_raw(gray, key);
            Self::mark_value_raw(gray, value);
        }
        for (key, value) in self.stl.iter() {
            Self::mark_value_raw(gray, key);
            Self::mark_value_raw(gray, value);
        }
        Self::mark_value_raw(gray, self.init_string);
        for index in 0..self.temp_roots.len() {
            Self::mark_value_raw(gray, self.temp_roots[index]);
        }
    }

    /// Marks an already-gray object's referents gray.
    fn blacken(&mut self, obj: GcRef<ObjHeader>) {
        let gray = &mut self.gray;
        match obj.kind() {
            ObjKind::String => {}
            ObjKind::Native => {
                Self::mark_object_raw(gray, obj.as_native().name.as_obj());
            }
            ObjKind::Upvalue => {
                if let UpvalueState::Closed(value) = obj.as_upvalue().state {
                    Self::mark_value_raw(gray, value);
                }
                // An open upvalue's slot is already a stack root.
            }
            ObjKind::Function => {
                let function = obj.as_function();
                if let Some(name) = function.name {
                    Self::mark_object_raw(gray, name.as_obj());
                }
                for &constant in &function.chunk.constants {
                    Self::mark_value_raw(gray, constant);
                }
            }
            ObjKind::Closure => {
                let closure = obj.as_closure();
                Self::mark_object_raw(gray, closure.function.as_obj());
                for &upvalue in &closure.upvalues {
                    Self::mark_object_raw(gray, upvalue.as_obj());
                }
            }
            ObjKind::Class => {
                let class = obj.as_class();
                Self::mark_object_raw(gray, class.name.as_obj());
                for (key, value) in class.methods.iter() {
                    Self::mark_value_raw(gray, key);
                    Self::mark_value_raw(gray, value);
                }
                for (key, value) in class.statics.iter() {
                    Self::mark_value_raw(gray, key);
                    Self::mark_value_raw(gray, value);
                }
            }
            ObjKind::Instance => {
                let instance = obj.as_instance();
                Self::mark_object_raw(gray, instance.class.as_obj());
                for (key, value) in instance.fields.iter() {
                    Self::mark_value_raw(gray, key);
                    Self::mark_value_raw(gray, value);
                }
            }
            ObjKind::BoundMethod => {
                let bound = obj.as_bound_method();
                Self::mark_value_raw(gray, bound.receiver);
                Self::mark_object_raw(gray, bound.method);
            }
            ObjKind::Exception => {
                Self::mark_value_raw(gray, obj.as_exception().payload);
            }
            ObjKind::Array => {
                for &element in &obj.as_array().elements {
                    Self::mark_value_raw(gray, element);
                }
            }
            ObjKind::Slice => {
                let slice = obj.as_slice();
                Self::mark_value_raw(gray, slice.start);
                Self::mark_value_raw(gray, slice.end);
                Self::mark_value_raw(gray, slice.step);
            }
            ObjKind::Hashmap => {
                for (key, value) in obj.as_hashmap().data.iter() {
                    Self::mark_value_raw(gray, key);
                    Self::mark_value_raw(gray, value);
                }
            }
        }
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn sweep(&mut self) {
        let mut previous: *mut ObjHeader = ptr::null_mut();
        let mut object = self.objects;
        unsafe {
            while !object.is_null() {
                if (*object).marked || (*object).locked {
                    (*object).marked = false;
                    previous = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if previous.is_null() {
                        self.objects = object;
                    } else {
                        (*previous).next = object;
                    }
                    self.free_object(unreached);
                }
            }
        }
    }

    /// Finishes a collection cycle. Callers with roots outside the heap (the
    /// VM) must have pre-marked them with `mark_value`/`mark_object`.
    pub fn collect(&mut self) {
        let before = self.bytes_allocated;
        if self.log_gc {
            eprintln!("-- gc begin ({} bytes)", before);
        }
        trace!(bytes = before, "gc begin");

        self.mark_own_roots();
        self.trace_references();
        self.strings.remove_white();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if self.log_gc {
            eprintln!(
                "-- gc end (freed {}, {} live, next at {})",
                before.saturating_sub(self.bytes_allocated),
                self.bytes_allocated,
                self.next_gc
            );
        }
        debug!(
            freed = before.saturating_sub(self.bytes_allocated),
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    unsafe fn free_object(&mut self, obj: *mut ObjHeader) {
        let gc = unsafe { GcRef::from_ptr(obj) };
        let size = obj_size(gc);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        if self.log_gc {
            eprintln!("{:p} free {} for {:?}", obj, size, gc.kind());
        }
        trace!(ptr = ?obj, size, kind = ?gc.kind(), "free");

        unsafe {
            match gc.kind() {
                ObjKind::String => drop(Box::from_raw(obj as *mut ObjString)),
                ObjKind::Upvalue => drop(Box::from_raw(obj as *mut ObjUpvalue)),
                ObjKind::Function => drop(Box::from_raw(obj as *mut ObjFunction)),
                ObjKind::Native => drop(Box::from_raw(obj as *mut ObjNative)),
                ObjKind::Closure => drop(Box::from_raw(obj as *mut ObjClosure)),
                ObjKind::Class => drop(Box::from_raw(obj as *mut ObjClass)),
                ObjKind::Instance => drop(Box::from_raw(obj as *mut ObjInstance)),
                ObjKind::BoundMethod => drop(Box::from_raw(obj as *mut ObjBoundMethod)),
                ObjKind::Exception => drop(Box::from_raw(obj as *mut ObjException)),
                ObjKind::Array => drop(Box::from_raw(obj as *mut ObjArray)),
                ObjKind::Slice => drop(Box::from_raw(obj as *mut ObjSlice)),
                ObjKind::Hashmap => drop(Box::from_raw(obj as *mut ObjHashmap)),
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut object = self.objects;
        while !object.is_null() {
            let next = unsafe { (*object).next };
            unsafe { self.free_object(object) };
            object = next;
        }
        self.objects = ptr::null_mut();
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_returns_identical_objects() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        let c = heap.take_string("hello".to_string());
        assert_eq!(a, b);
        assert_eq!(a, c);
        let d = heap.copy_string("world");
        assert!(a != d);
        assert!(crate::values_equal(Value::from(a), Value::from(b)));
    }

    #[test]
    fn test_collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let baseline = heap.object_count();
        for i in 0..100 {
            heap.take_string(format!("garbage-{}", i));
        }
        assert_eq!(heap.object_count(), baseline + 100);
        heap.collect();
        assert_eq!(heap.object_count(), baseline);
    }

    #[test]
    fn test_temp_roots_survive_collection() {
        let mut heap = Heap::new();
        let kept = heap.copy_string("kept");
        heap.push_root(Value::from(kept));
        heap.take_string("doomed".to_string());
        heap.collect();
        // The rooted string is still interned, the other is gone.
        assert_eq!(heap.copy_string("kept"), kept);
        assert!(
            heap.strings
                .find_string("doomed", hash_bytes(b"doomed"))
                .is_none()
        );
        heap.pop_root();
    }

    #[test]
    fn test_globals_are_roots() {
        let mut heap = Heap::new();
        let name = heap.copy_string("answer");
        heap.push_root(Value::from(name));
        let value = heap.copy_string("forty-two");
        heap.globals.set(Value::from(name), Value::from(value));
        heap.pop_root();
        heap.collect();
        assert_eq!(
            heap.globals.get(Value::from(name)).map(|v| v.as_string()),
            Some(value)
        );
    }

    #[test]
    fn test_locked_objects_survive_unreachable() {
        let mut heap = Heap::new();
        heap.begin_bootstrap();
        let locked = heap.copy_string("builtin");
        heap.end_bootstrap();
        heap.collect();
        // Still interned even though nothing referenced it.
        assert_eq!(heap.copy_string("builtin"), locked);
    }

    #[test]
    fn test_reachability_through_containers() {
        let mut heap = Heap::new();
        let element = heap.copy_string("element");
        heap.push_root(Value::from(element));
        let array = heap.new_array(vec![Value::from(element)]);
        heap.pop_root();
        heap.push_root(Value::from(array));
        heap.collect();
        assert_eq!(heap.copy_string("element"), element);
        heap.pop_root();
    }

    #[test]
    fn test_bytes_accounting_shrinks_after_collect() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        for i in 0..50 {
            heap.take_string(format!("transient-{}", i));
        }
        assert!(heap.bytes_allocated() > before);
        heap.collect();
        assert_eq!(heap.bytes_allocated(), before);
    }
}
