//! The stack-machine interpreter (spec §4.E/§4.F).
//!
//! `Vm` owns every piece of mutable runtime state — the heap, the string
//! interner, the sandboxed filesystem, the operand stack, the call-frame
//! stack, globals, and the handler stack for `try`/`catch`/`finally` — and
//! drives them all from the single dispatch loop in `interpreter.rs`.

mod exceptions;
mod frame;
mod interpreter;
mod native;

pub use exceptions::Handler;
pub use frame::CallFrame;
pub use native::NativeFn;

use std::collections::HashMap;

use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::compiler::compile_str;
use crate::error::{EmberError, Result};
use crate::heap::Heap;
use crate::intern::Interner;
use crate::value::Value;
use crate::vfs::Vfs;

/// Hard bounds from spec §4.E's boundary-behavior table.
pub const MAX_STACK: usize = 256;
pub const MAX_CALL_DEPTH: usize = 64;
pub const MAX_HANDLERS: usize = 32;

/// Tunables a host can set before running any script.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Per-`eval`/`call` instruction budget. Exhausting it raises a catchable
    /// runtime exception (so `finally` blocks still run) rather than
    /// aborting outright.
    pub gas_limit: Option<u64>,
    /// When set, the dispatch loop logs each executed opcode via `tracing`.
    pub trace: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { gas_limit: None, trace: false }
    }
}

/// The Ember virtual machine.
pub struct Vm {
    heap: Heap,
    interner: Interner,
    vfs: Vfs,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    handlers: Vec<Handler>,
    gas_left: Option<u64>,
    options: VmOptions,
    error: Option<EmberError>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            interner: Interner::new(),
            vfs: Vfs::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            handlers: Vec::new(),
            gas_left: options.gas_limit,
            options,
            error: None,
        };
        vm.globals.insert("__import__".to_string(), Value::Native(native::default_import));
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut Vfs {
        &mut self.vfs
    }

    pub fn register_native(&mut self, name: impl Into<String>, f: NativeFn) {
        self.globals.insert(name.into(), Value::Native(f));
    }

    pub fn define_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn get_error(&self) -> Option<&EmberError> {
        self.error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Interns a host string into a `Value::Str`. Exposed so natives can
    /// build string results without reaching into `heap`/`interner` directly.
    pub fn intern_str(&mut self, s: &str) -> Value {
        Value::Str(self.interner.intern(&mut self.heap, s.as_bytes()))
    }

    /// Compiles and runs `src` as a top-level program.
    pub fn eval(&mut self, src: &str) -> Result<()> {
        self.clear_error();
        let chunk = self.compile(src)?;
        let result = self.run_script(chunk);
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    /// Calls a previously defined global function by name.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        self.clear_error();
        let callee = self
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| EmberError::runtime(format!("undefined function '{name}'")))?;
        let floor = self.frames.len();
        let result = self.invoke_value(callee, None, args.to_vec()).and_then(|()| self.execute(floor));
        match result {
            Ok(()) => Ok(self.stack.pop().unwrap_or(Value::Nil)),
            Err(e) => {
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn compile(&self, src: &str) -> Result<Rc<Chunk>> {
        compile_str(src, "<script>")
    }

    fn run_script(&mut self, chunk: Rc<Chunk>) -> Result<()> {
        self.gas_left = self.options.gas_limit;
        let frame = CallFrame::new(chunk, 0, "<script>", 0);
        self.frames.push(frame);
        self.execute(0)?;
        self.stack.pop();
        debug_assert!(self.stack.is_empty(), "script left values on the operand stack");
        Ok(())
    }

    // --- operand stack helpers ---------------------------------------

    pub(crate) fn push(&mut self, v: Value) -> Result<()> {
        if self.stack.len() >= MAX_STACK {
            return Err(EmberError::memory("operand stack overflow"));
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| EmberError::internal("operand stack underflow"))
    }

    pub(crate) fn peek(&self) -> Result<Value> {
        self.stack.last().copied().ok_or_else(|| EmberError::internal("operand stack underflow"))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
