//! Native functions and sentinel classes: the STL.
//!
//! `build_stl` returns an ordered registration table — global natives plus
//! sentinel class definitions with their methods and statics — which the VM
//! consumes once at startup. Everything allocated during the install is
//! locked against collection, so built-ins can never be swept out from under
//! the interpreter.
//!
//! Sentinel classes are the method-dispatch targets for primitive receivers:
//! `"abc".length()` routes to the `String` sentinel, `[1].append(2)` to
//! `Array`. A sentinel's native `init` returns the built-in object itself,
//! which is how `Array(…)`, `Slice(…)`, `Exception(…)`, and `Hashmap()`
//! construct values rather than plain instances.
//!
//! Convention: `args[0]` is the receiver slot (the callee for plain calls),
//! declared arguments follow; arity -1 accepts anything.

use std::time::{SystemTime, UNIX_EPOCH};

use lox_core::heap::Heap;
use lox_core::object::{GcRef, NativeFn, NativeResult, ObjClass, ObjKind, ObjSlice, print_value};
use lox_core::Value;

use crate::vm::Vm;

pub struct NativeDef {
    pub name: &'static str,
    pub arity: i32,
    pub function: NativeFn,
}

pub struct MethodDef {
    pub name: &'static str,
    pub arity: i32,
    pub function: NativeFn,
    pub is_static: bool,
}

pub struct SentinelDef {
    pub name: &'static str,
    pub methods: &'static [MethodDef],
}

pub enum StlEntry {
    Native(NativeDef),
    Sentinel(SentinelDef),
}

const fn native(name: &'static str, arity: i32, function: NativeFn) -> StlEntry {
    StlEntry::Native(NativeDef {
        name,
        arity,
        function,
    })
}

const fn method(name: &'static str, arity: i32, function: NativeFn) -> MethodDef {
    MethodDef {
        name,
        arity,
        function,
        is_static: false,
    }
}

const fn sentinel(name: &'static str, methods: &'static [MethodDef]) -> StlEntry {
    StlEntry::Sentinel(SentinelDef { name, methods })
}

const NUMBER_METHODS: &[MethodDef] = &[
    method("floor", 0, number_floor),
    method("ceil", 0, number_ceil),
    method("abs", 0, number_abs),
    method("sqrt", 0, number_sqrt),
];

const STRING_METHODS: &[MethodDef] = &[
    method("length", 0, string_length),
    method("get", 1, string_get),
    method("contains", 1, string_contains),
    method("add", 1, string_add),
    method("greater", 1, string_greater),
    method("less", 1, string_less),
];

const FUNCTION_METHODS: &[MethodDef] = &[
    method("name", 0, function_name_method),
    method("arity", 0, function_arity),
];

const EXCEPTION_METHODS: &[MethodDef] = &[
    method("init", 1, exception_init),
    method("payload", 0, exception_payload),
];

const ARRAY_METHODS: &[MethodDef] = &[
    method("init", -1, array_init),
    method("append", 1, array_append),
    method("pop", 0, array_pop),
    method("length", 0, array_length),
    method("get", 1, array_get),
    method("set", 2, array_set),
];

const SLICE_METHODS: &[MethodDef] = &[
    method("init", 3, slice_init),
    method("start", 0, slice_start),
    method("end", 0, slice_end),
    method("step", 0, slice_step),
];

const HASHMAP_METHODS: &[MethodDef] = &[
    method("init", 0, hashmap_init),
    method("get", 1, hashmap_get),
    method("set", 2, hashmap_set),
    method("remove", 1, hashmap_remove),
    method("has", 1, hashmap_has),
    method("length", 0, hashmap_length),
    method("keys", 0, hashmap_keys),
];

/// The ordered registration table the VM installs at startup.
pub fn build_stl() -> Vec<StlEntry> {
    vec![
        native("clock", 0, clock_native),
        native("string", 1, string_native),
        native("concatenate", -1, concatenate_native),
        native("type", 1, type_native),
        native("hasMethod", 2, has_method_native),
        sentinel("Boolean", &[]),
        sentinel("Number", NUMBER_METHODS),
        sentinel("String", STRING_METHODS),
        sentinel("Function", FUNCTION_METHODS),
        sentinel("Exception", EXCEPTION_METHODS),
        sentinel("Array", ARRAY_METHODS),
        sentinel("Slice", SLICE_METHODS),
        sentinel("Hashmap", HASHMAP_METHODS),
    ]
}

pub(crate) fn install_stl(vm: &mut Vm) {
    vm.heap.begin_bootstrap();
    for entry in build_stl() {
        match entry {
            StlEntry::Native(def) => {
                let name = vm.heap.copy_string(def.name);
                let native = vm.heap.new_native(def.function, def.arity, name);
                vm.heap.stl.set(Value::from(name), Value::from(native));
            }
            StlEntry::Sentinel(def) => {
                let name = vm.heap.copy_string(def.name);
                let mut class = vm.heap.new_class(name);
                for m in def.methods {
                    let method_name = vm.heap.copy_string(m.name);
                    let native = vm.heap.new_native(m.function, m.arity, method_name);
                    class
                        .methods
                        .set(Value::from(method_name), Value::from(native));
                    if m.is_static {
                        class
                            .statics
                            .set(Value::from(method_name), Value::from(native));
                    }
                }
                vm.heap.stl.set(Value::from(name), Value::from(class));
            }
        }
    }
    vm.heap.end_bootstrap();
}

/// Sentinel class name for a primitive receiver, if it has one.
fn sentinel_name(value: Value) -> Option<&'static str> {
    if value.is_bool() {
        return Some("Boolean");
    }
    if value.is_number() {
        return Some("Number");
    }
    if value.is_obj() {
        return match value.as_obj().kind() {
            ObjKind::String => Some("String"),
            ObjKind::Function | ObjKind::Closure | ObjKind::Native | ObjKind::BoundMethod => {
                Some("Function")
            }
            ObjKind::Exception => Some("Exception"),
            ObjKind::Array => Some("Array"),
            ObjKind::Slice => Some("Slice"),
            ObjKind::Hashmap => Some("Hashmap"),
            _ => None,
        };
    }
    None
}

/// The dispatch target for a primitive receiver. Sentinel names are interned
/// and locked at bootstrap, so the lookup never allocates.
pub(crate) fn sentinel_class(heap: &mut Heap, value: Value) -> Option<GcRef<ObjClass>> {
    let name = sentinel_name(value)?;
    let key = Value::from(heap.copy_string(name));
    heap.stl
        .get(key)
        .filter(|found| found.is_class())
        .map(|found| found.as_class())
}

/// Does `value` respond to `name`? Instances consult fields then class
/// methods, classes their statics, primitives their sentinel class.
pub(crate) fn has_method(heap: &mut Heap, value: Value, name: Value) -> bool {
    if value.is_instance() {
        let instance = value.as_instance();
        return instance.fields.get(name).is_some()
            || instance.class.methods.get(name).is_some();
    }
    if value.is_class() {
        return value.as_class().statics.get(name).is_some();
    }
    match sentinel_class(heap, value) {
        Some(class) => class.methods.get(name).is_some(),
        None => false,
    }
}

fn throw(heap: &mut Heap, message: String) -> NativeResult {
    let payload = Value::from(heap.take_string(message));
    NativeResult::Throw(Value::from(heap.new_exception(payload)))
}

fn return_string(heap: &mut Heap, text: String) -> NativeResult {
    NativeResult::Return(Value::from(heap.take_string(text)))
}

// ----------------------------------------------------------------------
// Global natives
// ----------------------------------------------------------------------

fn clock_native(_heap: &mut Heap, _args: &mut [Value]) -> NativeResult {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    NativeResult::Return(Value::number(seconds))
}

/// The primitive stringifier exposed to programs; also what interpolation
/// applies to every `${…}` operand.
fn string_native(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let value = args[1];
    if value.is_string() {
        return NativeResult::Return(value);
    }
    return_string(heap, print_value(value))
}

/// Variadic string fusion; the backend of string interpolation.
fn concatenate_native(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut text = String::new();
    for &arg in &args[1..] {
        if !arg.is_string() {
            return throw(heap, "concatenate expects string arguments.".to_string());
        }
        text.push_str(&arg.as_string().chars);
    }
    return_string(heap, text)
}

fn type_native(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let value = args[1];
    if value.is_instance() {
        return NativeResult::Return(Value::from(value.as_instance().class));
    }
    if value.is_class() {
        return NativeResult::Return(value);
    }
    match sentinel_class(heap, value) {
        Some(class) => NativeResult::Return(Value::from(class)),
        None => NativeResult::Return(Value::nil()),
    }
}

fn has_method_native(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let value = args[1];
    let name = args[2];
    if !name.is_string() {
        return throw(heap, "hasMethod expects a method name string.".to_string());
    }
    let result = has_method(heap, value, name);
    NativeResult::Return(Value::boolean(result))
}

// ----------------------------------------------------------------------
// Number
// ----------------------------------------------------------------------

fn number_receiver(heap: &mut Heap, args: &[Value]) -> Result<f64, NativeResult> {
    let receiver = args[0];
    if !receiver.is_number() {
        return Err(throw(heap, "Receiver must be a number.".to_string()));
    }
    Ok(receiver.as_number())
}

fn number_floor(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match number_receiver(heap, args) {
        Ok(n) => NativeResult::Return(Value::number(n.floor())),
        Err(thrown) => thrown,
    }
}

fn number_ceil(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match number_receiver(heap, args) {
        Ok(n) => NativeResult::Return(Value::number(n.ceil())),
        Err(thrown) => thrown,
    }
}

fn number_abs(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match number_receiver(heap, args) {
        Ok(n) => NativeResult::Return(Value::number(n.abs())),
        Err(thrown) => thrown,
    }
}

fn number_sqrt(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match number_receiver(heap, args) {
        Ok(n) => NativeResult::Return(Value::number(n.sqrt())),
        Err(thrown) => thrown,
    }
}

// ----------------------------------------------------------------------
// String
// ----------------------------------------------------------------------

fn string_receiver(
    heap: &mut Heap,
    args: &[Value],
) -> Result<GcRef<lox_core::object::ObjString>, NativeResult> {
    let receiver = args[0];
    if !receiver.is_string() {
        return Err(throw(heap, "Receiver must be a string.".to_string()));
    }
    Ok(receiver.as_string())
}

fn string_length(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match string_receiver(heap, args) {
        Ok(string) => NativeResult::Return(Value::number(string.chars.len() as f64)),
        Err(thrown) => thrown,
    }
}

fn string_get(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let string = match string_receiver(heap, args) {
        Ok(string) => string,
        Err(thrown) => return thrown,
    };
    let bytes = string.chars.as_bytes();
    let index = args[1];
    if index.is_number() {
        let i = index.as_number();
        if i.fract() != 0.0 || i < 0.0 || i >= bytes.len() as f64 {
            return throw(heap, "String index out of bounds.".to_string());
        }
        let text = String::from_utf8_lossy(&bytes[i as usize..i as usize + 1]).into_owned();
        return return_string(heap, text);
    }
    if index.is_slice() {
        let taken = match resolve_slice(bytes.len(), index.as_slice()) {
            Ok(indices) => indices,
            Err(message) => return throw(heap, message),
        };
        let selected: Vec<u8> = taken.into_iter().map(|i| bytes[i]).collect();
        return return_string(heap, String::from_utf8_lossy(&selected).into_owned());
    }
    throw(heap, "String subscript must be a number or a slice.".to_string())
}

fn string_contains(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let string = match string_receiver(heap, args) {
        Ok(string) => string,
        Err(thrown) => return thrown,
    };
    if !args[1].is_string() {
        return throw(heap, "contains expects a string argument.".to_string());
    }
    let needle = args[1].as_string();
    NativeResult::Return(Value::boolean(string.chars.contains(&needle.chars[..])))
}

/// Operator-method fallback for `+` on strings: coerce and concatenate.
fn string_add(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let string = match string_receiver(heap, args) {
        Ok(string) => string,
        Err(thrown) => return thrown,
    };
    let other = args[1];
    let other_text = if other.is_string() {
        other.as_string().chars.clone()
    } else {
        print_value(other)
    };
    return_string(heap, format!("{}{}", string.chars, other_text))
}

fn string_greater(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    string_compare(heap, args, true)
}

fn string_less(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    string_compare(heap, args, false)
}

fn string_compare(heap: &mut Heap, args: &mut [Value], greater: bool) -> NativeResult {
    let string = match string_receiver(heap, args) {
        Ok(string) => string,
        Err(thrown) => return thrown,
    };
    if !args[1].is_string() {
        return throw(heap, "Strings compare only against strings.".to_string());
    }
    let other = args[1].as_string();
    let result = if greater {
        string.chars > other.chars
    } else {
        string.chars < other.chars
    };
    NativeResult::Return(Value::boolean(result))
}

// ----------------------------------------------------------------------
// Function
// ----------------------------------------------------------------------

fn function_name_method(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let receiver = args[0];
    if !receiver.is_obj() {
        return throw(heap, "Receiver must be a function.".to_string());
    }
    let obj = receiver.as_obj();
    let text = match obj.kind() {
        ObjKind::Function => print_value(receiver),
        ObjKind::Closure => print_value(receiver),
        ObjKind::Native => format!("<fn {}>", obj.as_native().name.chars),
        ObjKind::BoundMethod => print_value(Value::object(obj.as_bound_method().method)),
        _ => return throw(heap, "Receiver must be a function.".to_string()),
    };
    return_string(heap, text)
}

fn function_arity(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let receiver = args[0];
    if !receiver.is_obj() {
        return throw(heap, "Receiver must be a function.".to_string());
    }
    let obj = receiver.as_obj();
    let arity = match obj.kind() {
        ObjKind::Function => obj.as_function().arity as f64,
        ObjKind::Closure => obj.as_closure().function.arity as f64,
        ObjKind::Native => obj.as_native().arity as f64,
        ObjKind::BoundMethod => {
            let method = obj.as_bound_method().method;
            match method.kind() {
                ObjKind::Function => method.as_function().arity as f64,
                ObjKind::Closure => method.as_closure().function.arity as f64,
                ObjKind::Native => method.as_native().arity as f64,
                _ => return throw(heap, "Receiver must be a function.".to_string()),
            }
        }
        _ => return throw(heap, "Receiver must be a function.".to_string()),
    };
    NativeResult::Return(Value::number(arity))
}

// ----------------------------------------------------------------------
// Exception
// ----------------------------------------------------------------------

fn exception_init(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    NativeResult::Return(Value::from(heap.new_exception(args[1])))
}

fn exception_payload(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let receiver = args[0];
    if !receiver.is_exception() {
        return throw(heap, "Receiver must be an exception.".to_string());
    }
    NativeResult::Return(receiver.as_exception().payload)
}

// ----------------------------------------------------------------------
// Array
// ----------------------------------------------------------------------

fn array_init(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let elements = args[1..].to_vec();
    NativeResult::Return(Value::from(heap.new_array(elements)))
}

fn array_receiver(
    heap: &mut Heap,
    args: &[Value],
) -> Result<GcRef<lox_core::object::ObjArray>, NativeResult> {
    let receiver = args[0];
    if !receiver.is_array() {
        return Err(throw(heap, "Receiver must be an array.".to_string()));
    }
    Ok(receiver.as_array())
}

fn array_append(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut array = match array_receiver(heap, args) {
        Ok(array) => array,
        Err(thrown) => return thrown,
    };
    array.elements.push(args[1]);
    NativeResult::Return(args[0])
}

fn array_pop(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut array = match array_receiver(heap, args) {
        Ok(array) => array,
        Err(thrown) => return thrown,
    };
    match array.elements.pop() {
        Some(value) => NativeResult::Return(value),
        None => throw(heap, "Cannot pop from an empty array.".to_string()),
    }
}

fn array_length(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match array_receiver(heap, args) {
        Ok(array) => NativeResult::Return(Value::number(array.elements.len() as f64)),
        Err(thrown) => thrown,
    }
}

fn array_index(heap: &mut Heap, value: Value, len: usize) -> Result<usize, NativeResult> {
    if !value.is_number() {
        return Err(throw(heap, "Array index must be a number.".to_string()));
    }
    let n = value.as_number();
    if n.fract() != 0.0 || n < 0.0 || n >= len as f64 {
        return Err(throw(heap, "Array index out of bounds.".to_string()));
    }
    Ok(n as usize)
}

fn array_get(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let array = match array_receiver(heap, args) {
        Ok(array) => array,
        Err(thrown) => return thrown,
    };
    let index = args[1];
    if index.is_slice() {
        let taken = match resolve_slice(array.elements.len(), index.as_slice()) {
            Ok(indices) => indices,
            Err(message) => return throw(heap, message),
        };
        let selected: Vec<Value> = taken.into_iter().map(|i| array.elements[i]).collect();
        return NativeResult::Return(Value::from(heap.new_array(selected)));
    }
    match array_index(heap, index, array.elements.len()) {
        Ok(i) => NativeResult::Return(array.elements[i]),
        Err(thrown) => thrown,
    }
}

fn array_set(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut array = match array_receiver(heap, args) {
        Ok(array) => array,
        Err(thrown) => return thrown,
    };
    match array_index(heap, args[1], array.elements.len()) {
        Ok(i) => {
            array.elements[i] = args[2];
            NativeResult::Return(args[2])
        }
        Err(thrown) => thrown,
    }
}

// ----------------------------------------------------------------------
// Slice
// ----------------------------------------------------------------------

fn slice_component(heap: &mut Heap, value: Value) -> Result<Value, NativeResult> {
    if value.is_nil() || value.is_number() {
        Ok(value)
    } else {
        Err(throw(
            heap,
            "Slice components must be numbers or nil.".to_string(),
        ))
    }
}

fn slice_init(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let start = match slice_component(heap, args[1]) {
        Ok(value) => value,
        Err(thrown) => return thrown,
    };
    let end = match slice_component(heap, args[2]) {
        Ok(value) => value,
        Err(thrown) => return thrown,
    };
    let step = match slice_component(heap, args[3]) {
        Ok(value) => value,
        Err(thrown) => return thrown,
    };
    if step.is_number() && step.as_number() == 0.0 {
        return throw(heap, "Slice step cannot be zero.".to_string());
    }
    NativeResult::Return(Value::from(heap.new_slice(start, end, step)))
}

fn slice_receiver(heap: &mut Heap, args: &[Value]) -> Result<GcRef<ObjSlice>, NativeResult> {
    let receiver = args[0];
    if !receiver.is_slice() {
        return Err(throw(heap, "Receiver must be a slice.".to_string()));
    }
    Ok(receiver.as_slice())
}

fn slice_start(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match slice_receiver(heap, args) {
        Ok(slice) => NativeResult::Return(slice.start),
        Err(thrown) => thrown,
    }
}

fn slice_end(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match slice_receiver(heap, args) {
        Ok(slice) => NativeResult::Return(slice.end),
        Err(thrown) => thrown,
    }
}

fn slice_step(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match slice_receiver(heap, args) {
        Ok(slice) => NativeResult::Return(slice.step),
        Err(thrown) => thrown,
    }
}

/// Expands a slice over a sequence of `len` elements into concrete indices.
/// Start and end default to the full range in the step's direction; the end
/// bound is exclusive; out-of-range positions are skipped.
fn resolve_slice(len: usize, slice: GcRef<ObjSlice>) -> Result<Vec<usize>, String> {
    let step = if slice.step.is_nil() {
        1.0
    } else {
        slice.step.as_number()
    };
    if step == 0.0 || step.fract() != 0.0 {
        return Err("Slice step must be a non-zero whole number.".to_string());
    }
    let step = step as i64;

    let (default_start, default_end) = if step > 0 {
        (0, len as i64)
    } else {
        (len as i64 - 1, -1)
    };
    let component = |value: Value, default: i64| -> Result<i64, String> {
        if value.is_nil() {
            Ok(default)
        } else if value.as_number().fract() != 0.0 {
            Err("Slice bounds must be whole numbers.".to_string())
        } else {
            Ok(value.as_number() as i64)
        }
    };
    let start = component(slice.start, default_start)?;
    let end = component(slice.end, default_end)?;

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        if i >= 0 && (i as usize) < len {
            indices.push(i as usize);
        }
        i += step;
    }
    Ok(indices)
}

// ----------------------------------------------------------------------
// Hashmap
// ----------------------------------------------------------------------

fn hashmap_init(heap: &mut Heap, _args: &mut [Value]) -> NativeResult {
    NativeResult::Return(Value::from(heap.new_hashmap()))
}

fn hashmap_receiver(
    heap: &mut Heap,
    args: &[Value],
) -> Result<GcRef<lox_core::object::ObjHashmap>, NativeResult> {
    let receiver = args[0];
    if !receiver.is_hashmap() {
        return Err(throw(heap, "Receiver must be a hashmap.".to_string()));
    }
    Ok(receiver.as_hashmap())
}

fn hashmap_key(heap: &mut Heap, key: Value) -> Result<Value, NativeResult> {
    if key.is_empty() {
        return Err(throw(heap, "Hashmap keys must be hashable values.".to_string()));
    }
    Ok(key)
}

fn hashmap_get(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let map = match hashmap_receiver(heap, args) {
        Ok(map) => map,
        Err(thrown) => return thrown,
    };
    let key = match hashmap_key(heap, args[1]) {
        Ok(key) => key,
        Err(thrown) => return thrown,
    };
    NativeResult::Return(map.data.get(key).unwrap_or(Value::nil()))
}

fn hashmap_set(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut map = match hashmap_receiver(heap, args) {
        Ok(map) => map,
        Err(thrown) => return thrown,
    };
    let key = match hashmap_key(heap, args[1]) {
        Ok(key) => key,
        Err(thrown) => return thrown,
    };
    map.data.set(key, args[2]);
    NativeResult::Return(args[2])
}

fn hashmap_remove(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let mut map = match hashmap_receiver(heap, args) {
        Ok(map) => map,
        Err(thrown) => return thrown,
    };
    NativeResult::Return(Value::boolean(map.data.delete(args[1])))
}

fn hashmap_has(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let map = match hashmap_receiver(heap, args) {
        Ok(map) => map,
        Err(thrown) => return thrown,
    };
    NativeResult::Return(Value::boolean(map.data.get(args[1]).is_some()))
}

fn hashmap_length(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    match hashmap_receiver(heap, args) {
        Ok(map) => NativeResult::Return(Value::number(map.data.len() as f64)),
        Err(thrown) => thrown,
    }
}

fn hashmap_keys(heap: &mut Heap, args: &mut [Value]) -> NativeResult {
    let map = match hashmap_receiver(heap, args) {
        Ok(map) => map,
        Err(thrown) => return thrown,
    };
    let keys: Vec<Value> = map.data.iter().map(|(key, _)| key).collect();
    NativeResult::Return(Value::from(heap.new_array(keys)))
}
