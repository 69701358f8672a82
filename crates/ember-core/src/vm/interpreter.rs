//! The opcode dispatch loop (spec §4.D/§4.E).
//!
//! One `step()` call executes exactly one instruction. Every arm that can
//! fail with a catchable Ember-level error routes through [`Vm::throw_error`]
//! instead of returning `Err` directly, so `try`/`catch` sees VM-internal
//! failures (division by zero, undefined properties, arity mismatches...)
//! the same way it sees a user `throw`. Only the genuinely non-catchable
//! cases from spec §7 — operand-stack overflow (a `Memory` error, raised by
//! `Vm::push`) and call-stack overflow — bypass that path and return `Err`
//! straight out of `step`.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{Chunk, ConstValue, OpCode, UpvalueSource};
use crate::error::{EmberError, ErrorCode, Result, StackFrame};
use crate::value::Value;

use super::{CallFrame, Handler, Vm, MAX_CALL_DEPTH, MAX_HANDLERS};

fn const_str(chunk: &Chunk, idx: usize) -> Result<&str> {
    match &chunk.constants[idx] {
        ConstValue::Str(s) => Ok(s.as_str()),
        _ => Err(EmberError::internal("expected a string constant")),
    }
}

impl Vm {
    /// Runs instructions until the call-frame stack depth drops back to
    /// `floor` — `0` for a top-level `eval`, or the depth captured just
    /// before a nested call (e.g. a constructor's `init`) for a call that
    /// must complete before the caller proceeds.
    pub(crate) fn execute(&mut self, floor: usize) -> Result<()> {
        while self.frames.len() > floor {
            self.check_gas()?;
            self.maybe_collect();
            self.step()?;
        }
        Ok(())
    }

    fn check_gas(&mut self) -> Result<()> {
        if let Some(g) = self.gas_left {
            if g == 0 {
                return self.throw_error(EmberError::runtime("gas budget exhausted"));
            }
            self.gas_left = Some(g - 1);
        }
        Ok(())
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = self.collect_roots();
        self.heap.collect_garbage(roots.iter());
        self.interner.sweep(&self.heap);
    }

    /// Forces a collection cycle outside the normal `should_collect`
    /// threshold, so a host (or a test) can observe the live-object count
    /// after dropping its own references (spec §8's GC-liveness scenario).
    pub fn collect_garbage(&mut self) -> crate::heap::GcStats {
        let roots = self.collect_roots();
        let stats = self.heap.collect_garbage(roots.iter());
        self.interner.sweep(&self.heap);
        stats
    }

    fn collect_roots(&self) -> Vec<Value> {
        let mut roots = self.stack.clone();
        roots.extend(self.globals.values().copied());
        for f in &self.frames {
            if let Some(fr) = f.function {
                roots.push(Value::Function(fr));
            }
        }
        roots
    }

    fn capture_stack_trace(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| StackFrame { function_name: f.function_name.clone(), line: f.chunk.line_for_offset(f.ip) })
            .collect()
    }

    /// Wraps a VM-internal error in an `Exception` value and feeds it
    /// through the same unwind path a user `throw` takes.
    fn throw_error(&mut self, err: EmberError) -> Result<()> {
        let value = self.exception_value(err);
        self.throw(value)
    }

    fn exception_value(&mut self, err: EmberError) -> Value {
        let exc_type = match err.code() {
            ErrorCode::Type => "Type",
            ErrorCode::Runtime => "Runtime",
            ErrorCode::System => "System",
            _ => "Error",
        };
        let line = self.frames.last().map(|f| f.chunk.line_for_offset(f.ip)).unwrap_or(0);
        let r = self.heap.alloc_exception(exc_type.to_string(), err.message().to_string(), line, Value::Nil);
        Value::Exception(r)
    }

    /// Handler-stack unwind for a thrown value (spec §4.F): pop handlers
    /// until one owns a frame still on the stack, discard frames above it,
    /// truncate the operand stack to its depth at `try`-entry, push the
    /// thrown value, and resume at the catch target. An exhausted handler
    /// stack means the throw is uncaught.
    fn throw(&mut self, value: Value) -> Result<()> {
        loop {
            let handler = match self.handlers.pop() {
                Some(h) => h,
                None => {
                    let trace = self.capture_stack_trace();
                    let msg = value.print(&self.heap);
                    self.frames.clear();
                    self.stack.clear();
                    return Err(EmberError::runtime(format!("uncaught exception: {msg}")).with_call_stack(trace));
                }
            };
            if handler.frame_index >= self.frames.len() {
                continue; // stale: its frame already unwound via Return
            }
            while self.frames.len() > handler.frame_index + 1 {
                let popped = self.frames.pop().expect("frame exists above handler");
                if self.handlers.len() > popped.handler_base {
                    self.handlers.truncate(popped.handler_base);
                }
            }
            self.stack.truncate(handler.stack_depth);
            self.stack.push(value);
            self.frames[handler.frame_index].ip = handler.catch_target;
            return Ok(());
        }
    }

    /// Calls any callable `Value` — a compiled function, a native, a class
    /// (constructing an instance), or a bound method — pushing its result
    /// (or a new call frame, for plain functions) onto the operand stack.
    pub(crate) fn invoke_value(&mut self, callee: Value, this: Option<Value>, args: Vec<Value>) -> Result<()> {
        match callee {
            Value::Function(r) => {
                let arity = self.heap.function_arity(r) as usize;
                if arity != args.len() {
                    let plural = if arity == 1 { "" } else { "s" };
                    return self.throw_error(EmberError::runtime(format!(
                        "expected {arity} argument{plural} but got {}",
                        args.len()
                    )));
                }
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(EmberError::runtime("call stack overflow"));
                }
                let chunk = self.heap.function_chunk(r);
                let fname = self.heap.function_name(r).to_string();
                let base = self.stack.len();
                self.push(this.unwrap_or(Value::Nil))?;
                for a in args {
                    self.push(a)?;
                }
                let mut frame = CallFrame::new(chunk, base, fname, self.handlers.len());
                frame.function = Some(r);
                self.frames.push(frame);
                Ok(())
            }
            Value::Native(f) => match f(self, &args) {
                Ok(v) => self.push(v),
                Err(e) if e.is_catchable() => self.throw_error(e),
                Err(e) => Err(e),
            },
            Value::Class(r) => {
                let instref = self.heap.alloc_instance(r);
                let instance_val = Value::Instance(instref);
                match self.heap.class_find_method(r, "init") {
                    Some(init_val) => {
                        let floor = self.frames.len();
                        self.invoke_value(init_val, Some(instance_val), args)?;
                        self.execute(floor)?;
                        self.pop()?; // discard init's own return value
                    }
                    None if !args.is_empty() => {
                        let name = self.heap.class_name(r).to_string();
                        return self.throw_error(EmberError::runtime(format!(
                            "class '{name}' has no initializer but {} argument(s) were given",
                            args.len()
                        )));
                    }
                    None => {}
                }
                self.push(instance_val)
            }
            Value::BoundMethod(r) => {
                let receiver = self.heap.bound_method_receiver(r);
                let method = self.heap.bound_method_method(r);
                self.invoke_value(method, Some(receiver), args)
            }
            other => self.throw_error(EmberError::type_error(format!("'{}' is not callable", other.kind()))),
        }
    }

    /// Resolves a method-call target for `OpCode::Invoke`: instance fields
    /// shadow methods (spec §4.C), so a callable field wins over a method of
    /// the same name and is called unbound (`this` = `None`).
    fn resolve_invoke_target(&mut self, receiver: Value, name: &str) -> Result<(Value, Option<Value>)> {
        match receiver {
            Value::Instance(r) => {
                if let Some(v) = self.heap.instance_get_field(r, name) {
                    Ok((v, None))
                } else if let Some(m) = self.heap.class_find_method(self.heap.instance_class(r), name) {
                    Ok((m, Some(receiver)))
                } else {
                    Err(EmberError::runtime(format!("undefined method '{name}'")))
                }
            }
            _ => Err(EmberError::type_error(format!("cannot invoke method '{name}' on a {}", receiver.kind()))),
        }
    }

    fn step(&mut self) -> Result<()> {
        let frame_idx = self.frames.len() - 1;
        let chunk = Rc::clone(&self.frames[frame_idx].chunk);
        let ip = self.frames[frame_idx].ip;
        let base = self.frames[frame_idx].base;
        let function = self.frames[frame_idx].function;
        let byte = chunk.read_u8(ip);
        let op = OpCode::try_from(byte)
            .map_err(|b| EmberError::internal(format!("invalid opcode byte {b} at offset {ip}")))?;
        let next_ip = ip + 1 + op.operand_len();

        match op {
            OpCode::Pop => {
                self.frames[frame_idx].ip = next_ip;
                self.pop()?;
            }
            OpCode::Dup => {
                self.frames[frame_idx].ip = next_ip;
                let v = self.peek()?;
                self.push(v)?;
            }
            OpCode::Swap => {
                self.frames[frame_idx].ip = next_ip;
                let len = self.stack.len();
                if len < 2 {
                    return Err(EmberError::internal("SWAP needs two operands on the stack"));
                }
                self.stack.swap(len - 1, len - 2);
            }
            OpCode::LoadConst => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let v = match &chunk.constants[idx] {
                    ConstValue::Number(n) => Value::Number(*n),
                    ConstValue::Str(s) => Value::Str(self.interner.intern(&mut self.heap, s.as_bytes())),
                    ConstValue::Function(_) => {
                        return Err(EmberError::internal("LOAD_CONST on a function prototype"));
                    }
                };
                self.push(v)?;
            }
            OpCode::LoadNil => {
                self.frames[frame_idx].ip = next_ip;
                self.push(Value::Nil)?;
            }
            OpCode::LoadTrue => {
                self.frames[frame_idx].ip = next_ip;
                self.push(Value::Bool(true))?;
            }
            OpCode::LoadFalse => {
                self.frames[frame_idx].ip = next_ip;
                self.push(Value::Bool(false))?;
            }
            OpCode::Add => {
                self.frames[frame_idx].ip = next_ip;
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y))?,
                    (Value::Str(_), _) | (_, Value::Str(_)) => {
                        let s = format!("{}{}", a.print(&self.heap), b.print(&self.heap));
                        let r = self.interner.intern(&mut self.heap, s.as_bytes());
                        self.push(Value::Str(r))?;
                    }
                    _ => self
                        .throw_error(EmberError::type_error(format!("cannot add {} and {}", a.kind(), b.kind())))?,
                }
            }
            OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                self.frames[frame_idx].ip = next_ip;
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => match op {
                        OpCode::Sub => self.push(Value::Number(x - y))?,
                        OpCode::Mul => self.push(Value::Number(x * y))?,
                        OpCode::Div => {
                            if y == 0.0 {
                                self.throw_error(EmberError::runtime("division by zero"))?;
                            } else {
                                self.push(Value::Number(x / y))?;
                            }
                        }
                        OpCode::Mod => {
                            if y == 0.0 {
                                self.throw_error(EmberError::runtime("division by zero"))?;
                            } else {
                                self.push(Value::Number(x % y))?;
                            }
                        }
                        _ => unreachable!(),
                    },
                    _ => self.throw_error(EmberError::type_error(format!(
                        "{} requires two numbers, got {} and {}",
                        op.mnemonic(),
                        a.kind(),
                        b.kind()
                    )))?,
                }
            }
            OpCode::Neg => {
                self.frames[frame_idx].ip = next_ip;
                let a = self.pop()?;
                match a {
                    Value::Number(n) => self.push(Value::Number(-n))?,
                    _ => self.throw_error(EmberError::type_error(format!("cannot negate a {}", a.kind())))?,
                }
            }
            OpCode::Not => {
                self.frames[frame_idx].ip = next_ip;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_falsy()))?;
            }
            OpCode::Eq | OpCode::NotEq => {
                self.frames[frame_idx].ip = next_ip;
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.value_eq(&b, &self.heap);
                self.push(Value::Bool(if op == OpCode::Eq { eq } else { !eq }))?;
            }
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                self.frames[frame_idx].ip = next_ip;
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        let r = match op {
                            OpCode::Lt => x < y,
                            OpCode::Le => x <= y,
                            OpCode::Gt => x > y,
                            OpCode::Ge => x >= y,
                            _ => unreachable!(),
                        };
                        self.push(Value::Bool(r))?;
                    }
                    _ => self.throw_error(EmberError::type_error(format!(
                        "comparison requires two numbers, got {} and {}",
                        a.kind(),
                        b.kind()
                    )))?,
                }
            }
            OpCode::Jump => {
                let target = chunk.read_u16(ip + 1) as usize;
                self.frames[frame_idx].ip = target;
            }
            OpCode::JumpIfFalse => {
                let cond = self.pop()?;
                let target = chunk.read_u16(ip + 1) as usize;
                self.frames[frame_idx].ip = if cond.is_falsy() { target } else { next_ip };
            }
            OpCode::Loop => {
                let target = chunk.read_u16(ip + 1) as usize;
                self.frames[frame_idx].ip = target;
            }
            OpCode::GetLocal => {
                self.frames[frame_idx].ip = next_ip;
                let slot = chunk.read_u8(ip + 1) as usize;
                let v = self.stack[base + slot];
                self.push(v)?;
            }
            OpCode::SetLocal => {
                self.frames[frame_idx].ip = next_ip;
                let slot = chunk.read_u8(ip + 1) as usize;
                let v = self.peek()?;
                self.stack[base + slot] = v;
            }
            OpCode::GetGlobal => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?;
                match self.globals.get(name).copied() {
                    Some(v) => self.push(v)?,
                    None => self.throw_error(EmberError::runtime(format!("undefined variable '{name}'")))?,
                }
            }
            OpCode::SetGlobal => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let v = self.peek()?;
                if self.globals.contains_key(&name) {
                    self.globals.insert(name, v);
                } else {
                    self.throw_error(EmberError::runtime(format!("undefined variable '{name}'")))?;
                }
            }
            OpCode::DefineGlobal => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let v = self.pop()?;
                self.globals.insert(name, v);
            }
            OpCode::GetUpvalue => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u8(ip + 1) as usize;
                let f = function.ok_or_else(|| EmberError::internal("GET_UPVALUE outside a closure"))?;
                let v = self.heap.function_upvalue(f, idx);
                self.push(v)?;
            }
            OpCode::Call => {
                let argc = chunk.read_u8(ip + 1) as usize;
                self.frames[frame_idx].ip = next_ip;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop()?);
                }
                args.reverse();
                let callee = self.pop()?;
                self.invoke_value(callee, None, args)?;
            }
            OpCode::Invoke => {
                let idx = chunk.read_u16(ip + 1) as usize;
                let argc = chunk.read_u8(ip + 3) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                self.frames[frame_idx].ip = next_ip;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop()?);
                }
                args.reverse();
                let receiver = self.pop()?;
                match self.resolve_invoke_target(receiver, &name) {
                    Ok((callee, this)) => self.invoke_value(callee, this, args)?,
                    Err(e) if e.is_catchable() => self.throw_error(e)?,
                    Err(e) => return Err(e),
                }
            }
            OpCode::Return => {
                let value = self.pop()?;
                let popped = self.frames.pop().expect("RETURN with no active frame");
                if self.handlers.len() > popped.handler_base {
                    self.handlers.truncate(popped.handler_base);
                }
                self.stack.truncate(popped.base);
                self.push(value)?;
            }
            OpCode::NewArray => {
                self.frames[frame_idx].ip = next_ip;
                let count = chunk.read_u16(ip + 1) as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop()?);
                }
                items.reverse();
                let r = self.heap.alloc_array(items);
                self.push(Value::Array(r))?;
            }
            OpCode::NewMap => {
                self.frames[frame_idx].ip = next_ip;
                let count = chunk.read_u16(ip + 1) as usize;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let v = self.pop()?;
                    let k = self.pop()?;
                    pairs.push((k, v));
                }
                pairs.reverse();
                let r = self.heap.alloc_map();
                for (k, v) in pairs {
                    self.heap.map_insert(r, k, v);
                }
                self.push(Value::Map(r))?;
            }
            OpCode::GetIndex => {
                self.frames[frame_idx].ip = next_ip;
                let index = self.pop()?;
                let container = self.pop()?;
                match container {
                    Value::Array(r) => match index {
                        Value::Number(n) if n >= 0.0 => {
                            let v = self.heap.array_get(r, n as usize);
                            self.push(v.unwrap_or(Value::Nil))?;
                        }
                        Value::Number(_) => self.push(Value::Nil)?,
                        _ => self.throw_error(EmberError::type_error("array index must be a number"))?,
                    },
                    Value::Map(r) => {
                        let v = self.heap.map_get(r, &index);
                        self.push(v.unwrap_or(Value::Nil))?;
                    }
                    _ => self
                        .throw_error(EmberError::type_error(format!("cannot index a {}", container.kind())))?,
                }
            }
            OpCode::SetIndex => {
                self.frames[frame_idx].ip = next_ip;
                let value = self.pop()?;
                let index = self.pop()?;
                let container = self.pop()?;
                match container {
                    Value::Array(r) => match index {
                        Value::Number(n) if n >= 0.0 => {
                            let i = n as usize;
                            let len = self.heap.array_len(r);
                            if i < len {
                                self.heap.array_set(r, i, value);
                                self.push(value)?;
                            } else if i == len {
                                self.heap.array_push(r, value);
                                self.push(value)?;
                            } else {
                                self.throw_error(EmberError::runtime("array index out of bounds"))?;
                            }
                        }
                        _ => self
                            .throw_error(EmberError::type_error("array index must be a non-negative number"))?,
                    },
                    Value::Map(r) => {
                        self.heap.map_insert(r, index, value);
                        self.push(value)?;
                    }
                    _ => self
                        .throw_error(EmberError::type_error(format!("cannot index a {}", container.kind())))?,
                }
            }
            OpCode::Throw => {
                self.frames[frame_idx].ip = next_ip;
                let value = self.pop()?;
                self.throw(value)?;
            }
            OpCode::PushHandler => {
                self.frames[frame_idx].ip = next_ip;
                let catch_target = chunk.read_u16(ip + 1) as usize;
                let finally_target = chunk.read_u16(ip + 3);
                if self.handlers.len() >= MAX_HANDLERS {
                    return Err(EmberError::runtime("handler stack overflow"));
                }
                self.handlers.push(Handler::new(frame_idx, catch_target, finally_target, self.stack.len()));
            }
            OpCode::PopHandler => {
                self.frames[frame_idx].ip = next_ip;
                self.handlers.pop();
            }
            OpCode::EndFinally => {
                // No-op marker. The compiler only reaches here by ordinary
                // fallthrough — normal completion of the try or catch block.
                // A `break`/`continue`/`return`/rethrow inside a try/catch
                // body instead compiles its own copy of the finally block at
                // the exit site (see `Compiler::replay_finally`) rather than
                // reusing this one, since each needs to resume somewhere
                // other than here afterwards. `finally_target` on `Handler`
                // is accordingly not consulted by the interpreter — the
                // compiler drives every abnormal exit's finally replay
                // itself, including a throw raised directly inside a catch
                // block (a second handler wraps the catch body for exactly
                // that case; see `Compiler::try_statement`).
                self.frames[frame_idx].ip = next_ip;
            }
            OpCode::Class => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let r = self.heap.alloc_class(name, HashMap::new(), None);
                self.push(Value::Class(r))?;
            }
            OpCode::Inherit => {
                self.frames[frame_idx].ip = next_ip;
                let sub_val = self.pop()?;
                let super_val = self.pop()?;
                match (super_val, sub_val) {
                    (Value::Class(sup), Value::Class(sub)) => self.heap.class_set_superclass(sub, sup),
                    _ => self.throw_error(EmberError::type_error("superclass must be a class"))?,
                }
            }
            OpCode::Method => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let func = self.pop()?;
                let class_val = self.peek()?;
                match class_val {
                    Value::Class(r) => self.heap.class_add_method(r, name, func),
                    _ => return Err(EmberError::internal("METHOD with no class beneath it on the stack")),
                }
            }
            OpCode::GetProperty => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let target = self.pop()?;
                match target {
                    Value::Instance(r) => {
                        if let Some(v) = self.heap.instance_get_field(r, &name) {
                            self.push(v)?;
                        } else if let Some(m) = self.heap.class_find_method(self.heap.instance_class(r), &name) {
                            let bm = self.heap.alloc_bound_method(target, m);
                            self.push(Value::BoundMethod(bm))?;
                        } else {
                            self.throw_error(EmberError::runtime(format!("undefined property '{name}'")))?;
                        }
                    }
                    Value::Exception(r) => match name.as_str() {
                        "type" => {
                            let s = self.heap.exception_type(r).to_string();
                            let v = self.intern_str(&s);
                            self.push(v)?;
                        }
                        "message" => {
                            let s = self.heap.exception_message(r).to_string();
                            let v = self.intern_str(&s);
                            self.push(v)?;
                        }
                        "line" => {
                            let line = self.heap.exception_line(r);
                            self.push(Value::Number(line as f64))?;
                        }
                        "payload" => {
                            let v = self.heap.exception_payload(r);
                            self.push(v)?;
                        }
                        _ => self
                            .throw_error(EmberError::runtime(format!("undefined property '{name}' on exception")))?,
                    },
                    _ => self.throw_error(EmberError::type_error(format!(
                        "cannot read property '{name}' of a {}",
                        target.kind()
                    )))?,
                }
            }
            OpCode::SetProperty => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let value = self.pop()?;
                let target = self.pop()?;
                match target {
                    Value::Instance(r) => {
                        self.heap.instance_set_field(r, name, value);
                        self.push(value)?;
                    }
                    _ => self.throw_error(EmberError::type_error(format!(
                        "cannot set property '{name}' on a {}",
                        target.kind()
                    )))?,
                }
            }
            OpCode::GetSuper => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let name = const_str(&chunk, idx)?.to_string();
                let this_val = self.pop()?;
                match this_val {
                    Value::Instance(r) => {
                        let this_class = self.heap.instance_class(r);
                        match self.heap.class_superclass(this_class) {
                            Some(sup) => match self.heap.class_find_method(sup, &name) {
                                Some(m) => {
                                    let bm = self.heap.alloc_bound_method(this_val, m);
                                    self.push(Value::BoundMethod(bm))?;
                                }
                                None => self
                                    .throw_error(EmberError::runtime(format!("undefined property '{name}' on super")))?,
                            },
                            None => self.throw_error(EmberError::runtime("no superclass"))?,
                        }
                    }
                    _ => return Err(EmberError::internal("GET_SUPER with a non-instance 'this'")),
                }
            }
            OpCode::MakeClosure => {
                self.frames[frame_idx].ip = next_ip;
                let idx = chunk.read_u16(ip + 1) as usize;
                let proto = match &chunk.constants[idx] {
                    ConstValue::Function(p) => p.clone(),
                    _ => return Err(EmberError::internal("MAKE_CLOSURE on a non-function constant")),
                };
                let mut captured = Vec::with_capacity(proto.upvalues.len());
                for src in &proto.upvalues {
                    let v = match src {
                        UpvalueSource::Local(slot) => self.stack[base + *slot as usize],
                        UpvalueSource::Upvalue(up_idx) => {
                            let encl = function
                                .ok_or_else(|| EmberError::internal("nested upvalue capture with no enclosing closure"))?;
                            self.heap.function_upvalue(encl, *up_idx as usize)
                        }
                    };
                    captured.push(v);
                }
                let r = self.heap.alloc_function(proto.name.clone(), proto.arity, Rc::clone(&proto.chunk), captured);
                self.push(Value::Function(r))?;
            }
            OpCode::Halt => {
                self.frames.clear();
            }
        }
        Ok(())
    }
}
