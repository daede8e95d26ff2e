//! The bytecode virtual machine.
//!
//! A fixed-capacity frame stack over a shared value stack: slot 0 of every
//! frame is the callee (or `this` for methods), arguments and locals follow.
//! The dispatch loop keeps the instruction pointer in a local and writes it
//! back to the frame only before operations that can transfer control, so
//! stack traces always carry the right line.
//!
//! Runtime errors come in two flavors: *throwable* errors unwind to the
//! innermost frame whose function came from a `try` block (truncating both
//! stacks, pushing the payload, and resuming in the catch), while *fatal*
//! errors (stack overflow, negating a non-number, a missing STL entry)
//! abort interpretation with a stack trace.

use std::fmt;
use std::io::{self, Write};
use std::ptr;

use tracing::debug;

use lox_compiler::{CompileError, CompileOptions, compile};
use lox_core::chunk::OpCode;
use lox_core::debug::disassemble_instruction;
use lox_core::heap::Heap;
use lox_core::object::{
    GcRef, NativeResult, ObjClass, ObjFunction, ObjHeader, ObjKind, ObjNative, ObjUpvalue,
    UpvalueState, print_value,
};
use lox_core::{Value, values_equal};

use crate::natives;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Dump the stack and each instruction to stderr while running.
    pub trace_execution: bool,
    /// Dump every compiled function's disassembly to stderr.
    pub print_code: bool,
    /// Collect on every allocation opportunity.
    pub stress_gc: bool,
    /// Dump allocations, frees, and collection cycles to stderr.
    pub log_gc: bool,
    /// Treat `0`, `""`, and the empty sentinel as falsy as well.
    pub extended_falseness: bool,
}

struct CallFrame {
    /// The running function or closure.
    function: GcRef<ObjHeader>,
    ip: usize,
    slots: usize,
}

impl CallFrame {
    fn function_obj(&self) -> GcRef<ObjFunction> {
        if self.function.kind() == ObjKind::Function {
            self.function.as_function()
        } else {
            self.function.as_closure().function
        }
    }
}

#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    /// `[line N] in f` per live frame, innermost first, outermost last.
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for line in &self.trace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                let mut first = true;
                for error in errors {
                    if !first {
                        writeln!(f)?;
                    }
                    write!(f, "{}", error)?;
                    first = false;
                }
                Ok(())
            }
            InterpretError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending stack index with
    /// at most one node per slot.
    open_upvalues: *mut ObjUpvalue,
    options: VmOptions,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Vm {
        Vm::with_output(options, Box::new(io::stdout()))
    }

    /// A VM whose `print` output goes to `out`; how the tests observe runs.
    pub fn with_output(options: VmOptions, out: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        heap.stress = options.stress_gc;
        heap.log_gc = options.log_gc;
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: ptr::null_mut(),
            options,
            out,
        };
        natives::install_stl(&mut vm);
        debug!(stl = vm.heap.stl.len(), "vm initialized");
        vm
    }

    /// Compiles and runs `source`. With `eval_expr`, top-level expression
    /// statements print their non-nil values (the REPL mode).
    pub fn interpret(&mut self, source: &str, eval_expr: bool) -> Result<(), InterpretError> {
        let options = CompileOptions {
            eval_expr,
            print_code: self.options.print_code,
        };
        let function =
            compile(&mut self.heap, source, options).map_err(InterpretError::Compile)?;

        self.push(Value::from(function))
            .map_err(InterpretError::Runtime)?;
        self.frames.push(CallFrame {
            function: function.as_obj(),
            ip: 0,
            slots: self.stack.len() - 1,
        });

        match self.run() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.reset();
                Err(InterpretError::Runtime(error))
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = ptr::null_mut();
    }

    // ------------------------------------------------------------------
    // Stack and frames
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == STACK_MAX {
            return Err(self.fatal("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame_function(&self) -> GcRef<ObjFunction> {
        self.frames[self.frames.len() - 1].function_obj()
    }

    fn save_ip(&mut self, ip: usize) {
        let last = self.frames.len() - 1;
        self.frames[last].ip = ip;
    }

    fn load_ip(&self) -> usize {
        self.frames[self.frames.len() - 1].ip
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    fn stack_trace(&self) -> Vec<String> {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = frame.function_obj();
            let offset = frame.ip.saturating_sub(1);
            let line = function.chunk.get_line(offset);
            let name = match function.name {
                Some(name) => name.chars.clone(),
                None => "<script>".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, name));
        }
        trace
    }

    /// A non-catchable error: unwinds everything.
    fn fatal(&self, message: &str) -> RuntimeError {
        RuntimeError {
            message: message.to_string(),
            trace: self.stack_trace(),
        }
    }

    fn uncaught(&self, payload: Value) -> RuntimeError {
        let message = if payload.is_exception() {
            format!("Uncaught {}", print_value(payload))
        } else {
            format!("Uncaught Exception: {}", print_value(payload))
        };
        RuntimeError {
            message,
            trace: self.stack_trace(),
        }
    }

    /// Unwinds the stacks to the innermost `try` frame. `Ok` means the catch
    /// handler is set up and dispatch can continue; `Err` is an uncaught
    /// exception. The thrown payload must be on top of the stack.
    fn throw_value(&mut self) -> Result<(), RuntimeError> {
        let payload = self.peek(0);

        let mut target = None;
        for index in (0..self.frames.len()).rev() {
            if self.frames[index].function_obj().from_try {
                target = Some(index);
                break;
            }
        }
        let Some(index) = target.filter(|&index| index > 0) else {
            return Err(self.uncaught(payload));
        };

        // Drop the try frame and everything above it. Captured slots in the
        // doomed region are lifted first so closures keep their values.
        let slots = self.frames[index].slots;
        self.close_upvalues(slots);
        self.frames.truncate(index);
        self.stack.truncate(slots);
        self.stack.push(payload);

        // Resume past the Pop/Jump pair that follows TryCall.
        let last = self.frames.len() - 1;
        self.frames[last].ip += 4;
        Ok(())
    }

    /// Wraps a message in an exception object and throws it.
    fn runtime_exception(&mut self, message: String) -> Result<(), RuntimeError> {
        self.maybe_gc();
        let payload = Value::from(self.heap.take_string(message));
        self.push(payload)?;
        let exception = Value::from(self.heap.new_exception(payload));
        let top = self.stack.len() - 1;
        self.stack[top] = exception;
        self.throw_value()
    }

    // ------------------------------------------------------------------
    // Garbage collection entry
    // ------------------------------------------------------------------

    /// Pre-marks every VM root and hands the cycle to the heap. Call before
    /// any allocation made while user values are live on the stack.
    fn maybe_gc(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        for index in 0..self.stack.len() {
            let value = self.stack[index];
            self.heap.mark_value(value);
        }
        for index in 0..self.frames.len() {
            let function = self.frames[index].function;
            self.heap.mark_object(function);
        }
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            unsafe {
                self.heap.mark_object(GcRef::from_ptr(upvalue).as_obj());
                upvalue = (*upvalue).next;
            }
        }
        self.heap.collect();
    }

    // ------------------------------------------------------------------
    // Calling convention
    // ------------------------------------------------------------------

    fn call(
        &mut self,
        callee: GcRef<ObjHeader>,
        function: GcRef<ObjFunction>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        if function.arity != arg_count {
            let name = match function.name {
                Some(name) => name.chars.clone(),
                None => "<script>".to_string(),
            };
            return self.runtime_exception(format!(
                "<fn {}> expected {} arguments but got {}.",
                name, function.arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.fatal("Stack overflow."));
        }
        self.frames.push(CallFrame {
            function: callee,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_native(
        &mut self,
        native: GcRef<ObjNative>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        if native.arity >= 0 && native.arity as usize != arg_count {
            return self.runtime_exception(format!(
                "<fn {}> expected {} arguments but got {}.",
                native.name.chars, native.arity, arg_count
            ));
        }
        // Natives may allocate; collect with full roots before handing over.
        self.maybe_gc();
        let base = self.stack.len() - arg_count;
        let function = native.function;
        let result = {
            let heap = &mut self.heap;
            let args = &mut self.stack[base - 1..];
            function(heap, args)
        };
        match result {
            NativeResult::Return(value) => {
                self.stack.truncate(base - 1);
                self.push(value)
            }
            NativeResult::Throw(payload) => {
                self.stack.truncate(base - 1);
                self.push(payload)?;
                self.throw_value()
            }
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if callee.is_obj() {
            let obj = callee.as_obj();
            match obj.kind() {
                ObjKind::Native => return self.call_native(obj.as_native(), arg_count),
                ObjKind::Function => return self.call(obj, obj.as_function(), arg_count),
                ObjKind::Closure => return self.call(obj, obj.as_closure().function, arg_count),
                ObjKind::Class => {
                    let class = obj.as_class();
                    self.maybe_gc();
                    let instance = self.heap.new_instance(class);
                    let receiver = self.stack.len() - arg_count - 1;
                    self.stack[receiver] = Value::from(instance);
                    if let Some(initializer) = class.methods.get(self.heap.init_string) {
                        return self.call_value(initializer, arg_count);
                    }
                    if arg_count != 0 {
                        return self.runtime_exception(format!(
                            "<class {}> initializer expected 0 arguments but got {}.",
                            class.name.chars, arg_count
                        ));
                    }
                    return Ok(());
                }
                ObjKind::BoundMethod => {
                    let bound = obj.as_bound_method();
                    let receiver = self.stack.len() - arg_count - 1;
                    self.stack[receiver] = bound.receiver;
                    return self.call_value(Value::object(bound.method), arg_count);
                }
                _ => {}
            }
        }
        self.runtime_exception("Object is not callable.".to_string())
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef<ObjClass>,
        name: Value,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        match class.methods.get(name) {
            Some(method) => self.call_value(method, arg_count),
            None => self.runtime_exception(format!(
                "Undefined property '{}'.",
                name.as_string().chars
            )),
        }
    }

    /// Fused property lookup + call. Instances consult fields before class
    /// methods; classes expose statics only; primitives route to their
    /// sentinel class.
    fn invoke(&mut self, name: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        if receiver.is_instance() {
            let instance = receiver.as_instance();
            if let Some(field) = instance.fields.get(name) {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = field;
                return self.call_value(field, arg_count);
            }
            return self.invoke_from_class(instance.class, name, arg_count);
        }
        if receiver.is_class() {
            let class = receiver.as_class();
            if let Some(value) = class.statics.get(name) {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = value;
                return self.call_value(value, arg_count);
            }
            return self.runtime_exception(format!(
                "No static method of name '{}'.",
                name.as_string().chars
            ));
        }
        match natives::sentinel_class(&mut self.heap, receiver) {
            Some(class) => self.invoke_from_class(class, name, arg_count),
            None => self.runtime_exception("Object does not have methods.".to_string()),
        }
    }

    fn bind_method(&mut self, class: GcRef<ObjClass>, name: Value) -> Result<(), RuntimeError> {
        let Some(method) = class.methods.get(name) else {
            return self.runtime_exception(format!(
                "Undefined property '{}'.",
                name.as_string().chars
            ));
        };
        self.maybe_gc();
        let bound = self.heap.new_bound_method(self.peek(0), method.as_obj());
        self.pop();
        self.push(Value::from(bound))
    }

    // ------------------------------------------------------------------
    // Upvalue lifetime
    // ------------------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> GcRef<ObjUpvalue> {
        unsafe {
            let mut previous: *mut ObjUpvalue = ptr::null_mut();
            let mut upvalue = self.open_upvalues;
            while !upvalue.is_null() {
                match (*upvalue).state {
                    UpvalueState::Open(index) if index > slot => {
                        previous = upvalue;
                        upvalue = (*upvalue).next;
                    }
                    _ => break,
                }
            }
            if !upvalue.is_null() {
                if let UpvalueState::Open(index) = (*upvalue).state {
                    if index == slot {
                        // One open upvalue per slot, shared by every capture.
                        return GcRef::from_ptr(upvalue);
                    }
                }
            }

            self.maybe_gc();
            let mut created = self.heap.new_upvalue(UpvalueState::Open(slot));
            created.next = upvalue;
            if previous.is_null() {
                self.open_upvalues = created.as_ptr();
            } else {
                (*previous).next = created.as_ptr();
            }
            created
        }
    }

    /// Detaches every open upvalue at or above `boundary`, moving the live
    /// stack value into the cell.
    fn close_upvalues(&mut self, boundary: usize) {
        unsafe {
            while !self.open_upvalues.is_null() {
                let upvalue = self.open_upvalues;
                let index = match (*upvalue).state {
                    UpvalueState::Open(index) => index,
                    UpvalueState::Closed(_) => break,
                };
                if index < boundary {
                    break;
                }
                (*upvalue).state = UpvalueState::Closed(self.stack[index]);
                self.open_upvalues = (*upvalue).next;
                (*upvalue).next = ptr::null_mut();
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch helpers
    // ------------------------------------------------------------------

    fn is_falsey(&self, value: Value) -> bool {
        if value.is_nil() {
            return true;
        }
        if value.is_bool() {
            return !value.as_bool();
        }
        if self.options.extended_falseness {
            if value.is_empty() {
                return true;
            }
            if value.is_number() && value.as_number() == 0.0 {
                return true;
            }
            if value.is_string() && value.as_string().chars.is_empty() {
                return true;
            }
        }
        false
    }

    /// Numeric fast path, string concatenation for `+`, then the operator
    /// method of the left operand (`add`, `subtract`, ..., `greater`,
    /// `less`) via `invoke`.
    fn binary_op(&mut self, ip: &mut usize, op: OpCode) -> Result<(), RuntimeError> {
        if self.peek(0).is_number() && self.peek(1).is_number() {
            let b = self.pop().as_number();
            let a = self.pop().as_number();
            let result = match op {
                OpCode::Add => Value::number(a + b),
                OpCode::Subtract => Value::number(a - b),
                OpCode::Multiply => Value::number(a * b),
                OpCode::Divide => Value::number(a / b),
                OpCode::Greater => Value::boolean(a > b),
                _ => Value::boolean(a < b),
            };
            return self.push(result);
        }

        if op == OpCode::Add && self.peek(0).is_string() && self.peek(1).is_string() {
            self.maybe_gc();
            let b = self.peek(0).as_string();
            let a = self.peek(1).as_string();
            let result = self.heap.take_string(format!("{}{}", a.chars, b.chars));
            self.pop();
            self.pop();
            return self.push(Value::from(result));
        }

        let method = match op {
            OpCode::Add => "add",
            OpCode::Subtract => "subtract",
            OpCode::Multiply => "multiply",
            OpCode::Divide => "divide",
            OpCode::Greater => "greater",
            _ => "less",
        };
        let name = Value::from(self.heap.copy_string(method));
        self.save_ip(*ip);
        self.invoke(name, 1)?;
        *ip = self.load_ip();
        Ok(())
    }

    fn trace_instruction(&self, function: GcRef<ObjFunction>, ip: usize) {
        let mut line = String::from("          ");
        for index in 0..self.stack.len() {
            line.push_str(&format!("[ {} ]", print_value(self.stack[index])));
        }
        eprintln!("{}", line);
        let (text, _) = disassemble_instruction(&function.chunk, ip);
        eprintln!("{}", text);
    }

    // ------------------------------------------------------------------
    // The dispatch loop
    // ------------------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        let mut ip = self.load_ip();
        loop {
            let function = self.frame_function();
            if self.options.trace_execution {
                self.trace_instruction(function, ip);
            }

            let byte = function.chunk.code[ip];
            ip += 1;
            // Keep the frame's ip current so traces point at this op.
            self.save_ip(ip);

            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.fatal(&format!("Unknown opcode 0x{:02x}.", byte)));
            };

            match op {
                OpCode::Constant => {
                    let constant = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    self.push(constant)?;
                }
                OpCode::Nil => self.push(Value::nil())?,
                OpCode::True => self.push(Value::boolean(true))?,
                OpCode::False => self.push(Value::boolean(false))?,
                OpCode::Duplicate => {
                    let distance = function.chunk.code[ip] as usize;
                    ip += 1;
                    self.push(self.peek(distance))?;
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let count = function.chunk.code[ip] as usize;
                    ip += 1;
                    let len = self.stack.len();
                    self.stack.truncate(len - count);
                }

                OpCode::DefineGlobal => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let value = self.peek(0);
                    self.heap.globals.set(name, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let found = self
                        .heap
                        .globals
                        .get(name)
                        .or_else(|| self.heap.stl.get(name));
                    match found {
                        Some(value) => self.push(value)?,
                        None => {
                            self.save_ip(ip);
                            self.runtime_exception(format!(
                                "Undefined variable '{}'.",
                                name.as_string().chars
                            ))?;
                            ip = self.load_ip();
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let value = self.peek(0);
                    if self.heap.globals.set(name, value) {
                        // New key: assignment to an undeclared global.
                        self.heap.globals.delete(name);
                        self.save_ip(ip);
                        self.runtime_exception(format!(
                            "Undefined variable '{}'.",
                            name.as_string().chars
                        ))?;
                        ip = self.load_ip();
                    }
                }
                OpCode::GetLocal => {
                    let slot = function.chunk.code[ip] as usize;
                    ip += 1;
                    let base = self.frames[self.frames.len() - 1].slots;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::SetLocal => {
                    let slot = function.chunk.code[ip] as usize;
                    ip += 1;
                    let base = self.frames[self.frames.len() - 1].slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = function.chunk.code[ip] as usize;
                    ip += 1;
                    let closure = self.frames[self.frames.len() - 1].function.as_closure();
                    let value = match closure.upvalues[slot].state {
                        UpvalueState::Open(index) => self.stack[index],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = function.chunk.code[ip] as usize;
                    ip += 1;
                    let closure = self.frames[self.frames.len() - 1].function.as_closure();
                    let mut upvalue = closure.upvalues[slot];
                    let value = self.peek(0);
                    match upvalue.state {
                        UpvalueState::Open(index) => self.stack[index] = value,
                        UpvalueState::Closed(_) => upvalue.state = UpvalueState::Closed(value),
                    }
                }
                OpCode::GetStl => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    match self.heap.stl.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(self.fatal(&format!(
                                "Undefined STL identifier '{}'.",
                                name.as_string().chars
                            )));
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(values_equal(a, b)))?;
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => {
                    self.binary_op(&mut ip, op)?;
                }

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(self.is_falsey(value)))?;
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        self.save_ip(ip);
                        return Err(self.fatal("Operand must be a number."));
                    }
                    let value = self.pop().as_number();
                    self.push(Value::number(-value))?;
                }

                OpCode::Print | OpCode::PrintExpr => {
                    if op == OpCode::PrintExpr && self.peek(0).is_nil() {
                        self.pop();
                    } else if self.has_to_string(self.peek(0)) {
                        // Run toString in its own frame, then re-execute this
                        // instruction with the stringified value on top.
                        ip -= 1;
                        self.save_ip(ip);
                        let name = Value::from(self.heap.copy_string("toString"));
                        self.invoke(name, 0)?;
                        ip = self.load_ip();
                    } else {
                        let value = self.pop();
                        let _ = writeln!(self.out, "{}", print_value(value));
                    }
                }

                OpCode::JumpIfFalse => {
                    let jump = ((function.chunk.code[ip] as usize) << 8)
                        | function.chunk.code[ip + 1] as usize;
                    ip += 2;
                    if self.is_falsey(self.peek(0)) {
                        ip += jump;
                    }
                }
                OpCode::Jump => {
                    let jump = ((function.chunk.code[ip] as usize) << 8)
                        | function.chunk.code[ip + 1] as usize;
                    ip += 2;
                    ip += jump;
                }
                OpCode::Loop => {
                    let jump = ((function.chunk.code[ip] as usize) << 8)
                        | function.chunk.code[ip + 1] as usize;
                    ip += 2;
                    ip -= jump;
                }

                OpCode::Call => {
                    let arg_count = function.chunk.code[ip] as usize;
                    ip += 1;
                    self.save_ip(ip);
                    self.call_value(self.peek(arg_count), arg_count)?;
                    ip = self.load_ip();
                }
                OpCode::Closure => {
                    let constant = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    self.maybe_gc();
                    let mut closure = self.heap.new_closure(constant.as_function());
                    self.push(Value::from(closure))?;
                    let upvalue_count = closure.function.upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = function.chunk.code[ip] != 0;
                        let index = function.chunk.code[ip + 1] as usize;
                        ip += 2;
                        let upvalue = if is_local {
                            let base = self.frames[self.frames.len() - 1].slots;
                            self.capture_upvalue(base + index)
                        } else {
                            let enclosing =
                                self.frames[self.frames.len() - 1].function.as_closure();
                            enclosing.upvalues[index]
                        };
                        closure.upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots = self.frames[self.frames.len() - 1].slots;
                    self.close_upvalues(slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // Pop the script function itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slots);
                    self.push(result)?;
                    ip = self.load_ip();
                }

                OpCode::TryCall => {
                    self.save_ip(ip);
                    self.call_value(self.peek(0), 0)?;
                    ip = self.load_ip();
                }
                OpCode::Throw => {
                    self.save_ip(ip);
                    self.throw_value()?;
                    ip = self.load_ip();
                }

                OpCode::Class => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    self.maybe_gc();
                    let class = self.heap.new_class(name.as_string());
                    self.push(Value::from(class))?;
                }
                OpCode::GetProperty => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    self.save_ip(ip);
                    let target = self.peek(0);
                    if target.is_instance() {
                        let instance = target.as_instance();
                        if let Some(value) = instance.fields.get(name) {
                            self.pop();
                            self.push(value)?;
                        } else {
                            self.bind_method(instance.class, name)?;
                        }
                    } else if target.is_class() {
                        // Statics need no binding.
                        match target.as_class().statics.get(name) {
                            Some(value) => {
                                self.pop();
                                self.push(value)?;
                            }
                            None => {
                                self.runtime_exception(format!(
                                    "No static method of name '{}'.",
                                    name.as_string().chars
                                ))?;
                            }
                        }
                    } else {
                        match natives::sentinel_class(&mut self.heap, target) {
                            Some(class) => self.bind_method(class, name)?,
                            None => {
                                self.runtime_exception(
                                    "This object does not have properties.".to_string(),
                                )?;
                            }
                        }
                    }
                    ip = self.load_ip();
                }
                OpCode::SetProperty => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    if !self.peek(1).is_instance() {
                        self.save_ip(ip);
                        self.runtime_exception("Only instances have fields.".to_string())?;
                        ip = self.load_ip();
                    } else {
                        let mut instance = self.peek(1).as_instance();
                        instance.fields.set(name, self.peek(0));
                        let value = self.pop();
                        self.pop();
                        self.push(value)?;
                    }
                }
                OpCode::Method => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let method = self.peek(0);
                    let mut class = self.peek(1).as_class();
                    class.methods.set(name, method);
                    self.pop();
                }
                OpCode::StaticMethod => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let method = self.peek(0);
                    let mut class = self.peek(1).as_class();
                    class.methods.set(name, method);
                    class.statics.set(name, method);
                    self.pop();
                }
                OpCode::Invoke => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    let arg_count = function.chunk.code[ip + 1] as usize;
                    ip += 2;
                    self.save_ip(ip);
                    self.invoke(name, arg_count)?;
                    ip = self.load_ip();
                }
                OpCode::Inherit => {
                    let predecessor = self.peek(1);
                    if predecessor.is_class() {
                        let superclass = predecessor.as_class();
                        let mut subclass = self.peek(0).as_class();
                        if superclass != subclass {
                            superclass.methods.add_all_to(&mut subclass.methods);
                            superclass.statics.add_all_to(&mut subclass.statics);
                        }
                        // The superclass stays behind, bound as `super`.
                        self.pop();
                    } else {
                        self.save_ip(ip);
                        self.runtime_exception(
                            "Superclass must be a class or an array of classes.".to_string(),
                        )?;
                        ip = self.load_ip();
                    }
                }
                OpCode::InheritMultiple => {
                    let superclasses = self.peek(1);
                    let mut subclass = self.peek(0).as_class();
                    let mut bad_element = false;
                    if superclasses.is_array() {
                        let array = superclasses.as_array();
                        for index in 0..array.elements.len() {
                            if !array.elements[index].is_class() {
                                bad_element = true;
                                break;
                            }
                        }
                        if !bad_element {
                            // Declaration order; later entries win collisions.
                            for index in 0..array.elements.len() {
                                let superclass = array.elements[index].as_class();
                                if superclass == subclass {
                                    continue;
                                }
                                superclass.methods.add_all_to(&mut subclass.methods);
                                superclass.statics.add_all_to(&mut subclass.statics);
                            }
                            self.pop();
                        }
                    } else {
                        bad_element = true;
                    }
                    if bad_element {
                        self.save_ip(ip);
                        self.runtime_exception(
                            "Element must be a class for multiple inheritance.".to_string(),
                        )?;
                        ip = self.load_ip();
                    }
                }
                OpCode::GetSuper => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    ip += 1;
                    let superclass = self.pop();
                    self.save_ip(ip);
                    if superclass.is_class() {
                        self.bind_method(superclass.as_class(), name)?;
                    } else {
                        self.runtime_exception("Superclass must be a class.".to_string())?;
                    }
                    ip = self.load_ip();
                }
                OpCode::SuperInvoke => {
                    let name = function.chunk.constants[function.chunk.code[ip] as usize];
                    let arg_count = function.chunk.code[ip + 1] as usize;
                    ip += 2;
                    let superclass = self.pop();
                    self.save_ip(ip);
                    if superclass.is_class() {
                        self.invoke_from_class(superclass.as_class(), name, arg_count)?;
                    } else {
                        self.runtime_exception("Superclass must be a class.".to_string())?;
                    }
                    ip = self.load_ip();
                }
            }
        }
    }

    /// `print` consults this before falling back to the primitive
    /// stringifier; the built-in sentinels define no `toString`, which is
    /// what ends the re-dispatch once a string is on top.
    fn has_to_string(&mut self, value: Value) -> bool {
        let key = Value::from(self.heap.copy_string("toString"));
        natives::has_method(&mut self.heap, value, key)
    }
}
