//! Call frames (spec §4.E: "each call pushes `(function_name, source_location,
//! saved_ip, saved_chunk, saved_local_base)`").

use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::heap::ObjRef;

/// One function activation record.
pub struct CallFrame {
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    /// Stack index of local slot 0 for this activation.
    pub base: usize,
    pub function_name: String,
    /// Handler-stack length at call time; a `Return` truncates handlers back
    /// to this so a forgotten `PopHandler` in the callee can never leak a
    /// handler into the caller's frame.
    pub handler_base: usize,
    /// The `FunctionObj` this frame is executing, if any (the top-level
    /// script frame has none). Needed to resolve `GetUpvalue`/nested
    /// `MakeClosure` captures and to keep the function's own upvalues rooted
    /// for the GC while it's on the call stack.
    pub function: Option<ObjRef>,
}

impl CallFrame {
    pub fn new(chunk: Rc<Chunk>, base: usize, function_name: impl Into<String>, handler_base: usize) -> Self {
        CallFrame { chunk, ip: 0, base, function_name: function_name.into(), handler_base, function: None }
    }
}
