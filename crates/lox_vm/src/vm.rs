//! The stack-based bytecode interpreter.
//!
//! Grounded almost file-for-file on the original implementation's
//! `runtime/vm.c`: a value stack, a bounded stack of call frames, the
//! global variable table, and the open-upvalue list, restructured into
//! an owned `Vm` struct (no global singleton) per this crate's explicit
//! redesign decision. `concatenate()`'s number-to-string coercion is
//! deliberately not carried over — `ADD` on a number and a string is a
//! runtime error here, not an implicit conversion.

use crate::chunk::read_u16;
use crate::compiler;
use crate::error::{InterpretError, RuntimeError};
use crate::memory::Heap;
use crate::opcode::OpCode;
use crate::stdlib;
use crate::table::Table;
use crate::value::{ObjRef, ObjType, UpvalueLocation, Value};

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0 (the receiver for
    /// methods, otherwise the first declared local/parameter).
    slots: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<ObjRef>,
    init_string: ObjRef,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
        };
        stdlib::register_natives(&mut vm);
        vm
    }

    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.stress = stress;
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        self.dump_roots_for_compile();
        let compiled = compiler::compile(source, &mut self.heap);
        self.heap.clear_roots();
        let function = compiled.map_err(InterpretError::Compile)?;

        self.push(Value::Obj(function)).map_err(InterpretError::Runtime)?;
        self.maybe_collect();
        let closure = self.heap.alloc_closure(function, Vec::new());
        self.pop();
        self.push(Value::Obj(closure)).map_err(InterpretError::Runtime)?;
        self.call(closure, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    /// Hands the compiler a snapshot of every root this `Vm` currently
    /// holds, so a collection triggered mid-compile (stress mode, or a
    /// REPL line that tips the heap over threshold) doesn't sweep away
    /// state left over from an earlier `interpret` call — the compiler
    /// itself only knows about its own in-progress function chain.
    fn dump_roots_for_compile(&mut self) {
        for &v in &self.stack {
            if let Value::Obj(o) = v {
                self.heap.push_root(o);
            }
        }
        for frame in &self.frames {
            self.heap.push_root(frame.closure);
        }
        let mut up = self.open_upvalues;
        while let Some(u) = up {
            self.heap.push_root(u);
            up = u.as_upvalue().next_open;
        }
        for (key, value) in self.globals.iter() {
            self.heap.push_root(key);
            if let Value::Obj(o) = value {
                self.heap.push_root(o);
            }
        }
        self.heap.push_root(self.init_string);
    }

    // ---- stack plumbing ----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- the dispatch loop ----

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame_index = self.frames.len() - 1;
            self.trace_instruction(frame_index);

            let op = OpCode::from_u16(self.read_word(frame_index));
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(frame_index);
                    self.push(v)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_word(frame_index) as usize;
                    let base = self.frames[frame_index].slots;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_word(frame_index) as usize;
                    let base = self.frames[frame_index].slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant(frame_index);
                    match self.globals.get(name) {
                        Some(v) => self.push(v)?,
                        None => return Err(self.runtime_error(format!("Undefined variable '{}'.", name.as_string().chars))),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant(frame_index);
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant(frame_index);
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", name.as_string().chars)));
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_word(frame_index) as usize;
                    let upvalue = self.frames[frame_index].closure.as_closure().upvalues[idx];
                    let value = match upvalue.as_upvalue().location {
                        UpvalueLocation::Open(i) => self.stack[i],
                        UpvalueLocation::Closed(v) => v,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_word(frame_index) as usize;
                    let upvalue = self.frames[frame_index].closure.as_closure().upvalues[idx];
                    let value = self.peek(0);
                    match upvalue.as_upvalue().location {
                        UpvalueLocation::Open(i) => self.stack[i] = value,
                        UpvalueLocation::Closed(_) => upvalue.as_upvalue_mut().location = UpvalueLocation::Closed(value),
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant(frame_index);
                    let receiver = self.peek(0);
                    let Value::Obj(o) = receiver else {
                        return Err(self.runtime_error("Only instances have properties.".to_string()));
                    };
                    if o.tag() != ObjType::Instance {
                        return Err(self.runtime_error("Only instances have properties.".to_string()));
                    }
                    let instance = o.as_instance();
                    if let Some(value) = instance.fields.get(name) {
                        self.pop();
                        self.push(value)?;
                    } else {
                        self.bind_method(instance.class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant(frame_index);
                    let target = self.peek(1);
                    let Value::Obj(o) = target else {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    };
                    if o.tag() != ObjType::Instance {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    }
                    let value = self.peek(0);
                    o.as_instance_mut().fields.set(name, value);
                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant(frame_index);
                    let Value::Obj(superclass) = self.pop() else { unreachable!() };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.number_binary_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.number_binary_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.number_binary_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.number_binary_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.number_binary_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()))?;
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n))?;
                        }
                        None => return Err(self.runtime_error("Operand must be a number.".to_string())),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    println!("{v}");
                }
                OpCode::Jump => {
                    let offset = self.read_word(frame_index) as usize;
                    self.frames[frame_index].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_word(frame_index) as usize;
                    if self.peek(0).is_falsey() {
                        self.frames[frame_index].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_word(frame_index) as usize;
                    self.frames[frame_index].ip -= offset;
                }
                OpCode::Call => {
                    let argc = self.read_word(frame_index) as u8;
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant(frame_index);
                    let argc = self.read_word(frame_index) as u8;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant(frame_index);
                    let argc = self.read_word(frame_index) as u8;
                    let Value::Obj(superclass) = self.pop() else { unreachable!() };
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    self.make_closure(frame_index)?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string_constant(frame_index);
                    self.maybe_collect();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::Obj(class))?;
                }
                OpCode::Inherit => {
                    let Value::Obj(superclass) = self.peek(1) else {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    };
                    if superclass.tag() != ObjType::Class {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    }
                    let Value::Obj(subclass) = self.peek(0) else { unreachable!() };
                    superclass.as_class().methods.copy_into(&mut subclass.as_class_mut().methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant(frame_index);
                    self.define_method(name);
                }
            }
        }
    }

    fn read_word(&mut self, frame_index: usize) -> u16 {
        let frame = &mut self.frames[frame_index];
        let function = frame.closure.as_closure().function.as_function();
        let word = read_u16(&function.chunk.code, frame.ip);
        frame.ip += 1;
        word
    }

    fn read_constant(&mut self, frame_index: usize) -> Value {
        let ix = self.read_word(frame_index) as usize;
        let function = self.frames[frame_index].closure.as_closure().function.as_function();
        function.chunk.constants[ix]
    }

    fn read_string_constant(&mut self, frame_index: usize) -> ObjRef {
        match self.read_constant(frame_index) {
            Value::Obj(o) if o.tag() == ObjType::String => o,
            _ => unreachable!("non-string name constant"),
        }
    }

    // ---- arithmetic ----

    fn number_binary_op(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let (b, a) = (self.peek(0), self.peek(1));
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(f(a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let (b, a) = (self.peek(0), self.peek(1));
        if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            return self.push(Value::Number(a + b));
        }
        if let (Some(a), Some(b)) = (a.as_string(), b.as_string()) {
            let mut concatenated = String::with_capacity(a.chars.len() + b.chars.len());
            concatenated.push_str(&a.chars);
            concatenated.push_str(&b.chars);
            self.pop();
            self.pop();
            self.maybe_collect();
            let result = self.heap.intern_owned(concatenated);
            return self.push(Value::Obj(result));
        }
        Err(self.runtime_error("Operands must be two numbers or two strings.".to_string()))
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let Value::Obj(o) = callee else {
            return Err(self.runtime_error("Can only call functions and classes.".to_string()));
        };
        match o.tag() {
            ObjType::Closure => self.call(o, argc),
            ObjType::Native => self.call_native(o, argc),
            ObjType::Class => self.instantiate(o, argc),
            ObjType::BoundMethod => {
                let bound = o.as_bound_method();
                let base = self.stack.len() - argc as usize - 1;
                self.stack[base] = bound.receiver;
                self.call(bound.method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call(&mut self, closure: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function = closure.as_closure().function.as_function();
        if argc as usize != function.arity as usize {
            return Err(self.runtime_error(format!("Expected {} arguments but got {argc}.", function.arity)));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slots = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let base = self.stack.len() - argc as usize;
        let result = (native.as_native().function)(&self.stack[base..]);
        match result {
            Ok(value) => {
                self.stack.truncate(base - 1);
                self.push(value)
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn instantiate(&mut self, class: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        self.maybe_collect();
        let instance = self.heap.alloc_instance(class);
        let base = self.stack.len() - argc as usize - 1;
        self.stack[base] = Value::Obj(instance);
        match class.as_class().methods.get(self.init_string) {
            Some(Value::Obj(init)) => self.call(init, argc),
            _ => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let Value::Obj(o) = receiver else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };
        if o.tag() != ObjType::Instance {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }
        let instance = o.as_instance();
        if let Some(value) = instance.fields.get(name) {
            let base = self.stack.len() - argc as usize - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(instance.class, name, argc)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        match class.as_class().methods.get(name) {
            Some(Value::Obj(method)) => self.call(method, argc),
            _ => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_string().chars))),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let method = match class.as_class().methods.get(name) {
            Some(Value::Obj(m)) => m,
            _ => return Err(self.runtime_error(format!("Undefined property '{}'.", name.as_string().chars))),
        };
        self.maybe_collect();
        let receiver = self.pop();
        let bound = self.heap.alloc_bound_method(receiver, method);
        self.push(Value::Obj(bound))
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let Value::Obj(class) = self.peek(1) else { unreachable!() };
        class.as_class_mut().methods.set(name, method);
        self.pop();
    }

    fn make_closure(&mut self, frame_index: usize) -> Result<(), RuntimeError> {
        let Value::Obj(function_ref) = self.read_constant(frame_index) else { unreachable!() };
        let upvalue_count = function_ref.as_function().upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_word(frame_index) != 0;
            let index = self.read_word(frame_index) as usize;
            if is_local {
                let base = self.frames[frame_index].slots;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                upvalues.push(self.frames[frame_index].closure.as_closure().upvalues[index]);
            }
        }
        self.maybe_collect();
        let closure = self.heap.alloc_closure(function_ref, upvalues);
        self.push(Value::Obj(closure))
    }

    // ---- upvalues ----

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(up) = current {
            let loc = match up.as_upvalue().location {
                UpvalueLocation::Open(i) => i,
                UpvalueLocation::Closed(_) => unreachable!("closed upvalue in open list"),
            };
            if loc <= stack_index {
                break;
            }
            prev = Some(up);
            current = up.as_upvalue().next_open;
        }

        if let Some(up) = current {
            if let UpvalueLocation::Open(i) = up.as_upvalue().location {
                if i == stack_index {
                    return up;
                }
            }
        }

        self.maybe_collect();
        let created = self.heap.alloc_upvalue(stack_index);
        created.as_upvalue_mut().next_open = current;
        match prev {
            Some(p) => p.as_upvalue_mut().next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, from: usize) {
        while let Some(up) = self.open_upvalues {
            let idx = match up.as_upvalue().location {
                UpvalueLocation::Open(i) => i,
                UpvalueLocation::Closed(_) => break,
            };
            if idx < from {
                break;
            }
            let value = self.stack[idx];
            up.as_upvalue_mut().location = UpvalueLocation::Closed(value);
            self.open_upvalues = up.as_upvalue().next_open;
        }
    }

    // ---- natives ----

    /// Interns `name`, allocates an `ObjNative` wrapping `function`, and
    /// installs it as a global. Keeps both freshly-allocated values
    /// pushed on the stack while the global table grows, so a collection
    /// triggered by either allocation (or by the table insert below) can't
    /// sweep either of them out from under us.
    pub fn define_native(&mut self, name: &'static str, function: crate::value::NativeFn) {
        self.maybe_collect();
        let name_ref = self.heap.intern(name);
        self.push(Value::Obj(name_ref)).expect("native registration never overflows an empty stack");
        let native_ref = self.heap.alloc_native(name, function);
        self.push(Value::Obj(native_ref)).expect("native registration never overflows an empty stack");
        self.globals.set(name_ref, Value::Obj(native_ref));
        self.pop();
        self.pop();
    }

    // ---- garbage collection ----

    fn mark_roots(&mut self) {
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut up = self.open_upvalues;
        while let Some(u) = up {
            self.heap.mark_object(u);
            up = u.as_upvalue().next_open;
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_object(self.init_string);
    }

    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.heap.collect_garbage();
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // ---- errors & tracing ----

    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_closure().function.as_function();
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(-1);
            let name = match function.name {
                Some(n) => format!("{}()", n.as_string().chars),
                None => "script".to_string(),
            };
            trace.push(format!("[line {line}] in {name}"));
        }
        tracing::error!(target: "lox_vm::vm", %message, "runtime error");
        self.reset_stack();
        RuntimeError { message, trace }
    }

    fn trace_instruction(&self, frame_index: usize) {
        if !tracing::enabled!(target: "trace_exec", tracing::Level::TRACE) {
            return;
        }
        let frame = &self.frames[frame_index];
        let stack_repr: String = self.stack.iter().map(|v| format!("[ {v} ]")).collect();
        println!("          {stack_repr}");
        frame.closure.as_closure().function.as_function().chunk.disassemble_instruction(frame.ip);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
