//! ember-vm — embedding facade over [`ember_core`].
//!
//! `ember-core` owns the interpreter; this crate is the thin surface a host
//! application actually links against (spec §6's "minimum embedding API"):
//! construct a [`Vm`], feed it source with [`Vm::eval`], call a defined
//! global with [`Vm::call`], and register natives with
//! [`Vm::register_native`]. Everything else (the opcode set, the GC, the
//! VFS sandbox) stays an implementation detail of `ember-core`.
//!
//! A minimal `print`/`clock` native module is provided by [`install_stdlib`]
//! for hosts that don't want to hand-roll their own — the teacher's
//! `VmOptions::with_stdlib` toggle, expressed here as an explicit opt-in call
//! instead of a hidden constructor flag, since `ember-core::Vm` has no
//! knowledge of what a "stdlib" is.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub use ember_core::{EmberError, ErrorCode, Heap, ObjRef, Value, Vm};
pub use ember_core::vm::VmOptions;

use std::time::{SystemTime, UNIX_EPOCH};

/// Registers a small native module (`print`, `clock`) that most embedders
/// want without writing their own. Mirrors the teacher's `DefaultHost`:
/// `print` writes to stdout, `clock` returns a monotonic-ish wall-clock
/// reading in seconds.
pub fn install_stdlib(vm: &mut Vm) {
    vm.register_native("print", native_print);
    vm.register_native("clock", native_clock);
    vm.register_native("read_file", native_read_file);
    vm.register_native("write_file", native_write_file);
    vm.register_native("file_exists", native_file_exists);
}

fn native_print(vm: &mut Vm, args: &[Value]) -> ember_core::Result<Value> {
    let heap = vm.heap();
    let rendered: Vec<String> = args.iter().map(|v| v.print(heap)).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Nil)
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> ember_core::Result<Value> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    Ok(Value::Number(secs))
}

fn arg_str(vm: &Vm, args: &[Value], idx: usize, who: &str) -> ember_core::Result<String> {
    match args.get(idx) {
        Some(Value::Str(r)) => Ok(String::from_utf8_lossy(vm.heap().str_bytes(*r)).into_owned()),
        _ => Err(EmberError::type_error(format!("{who}: expected a string argument"))),
    }
}

/// Reads a sandboxed path (spec §4.C). Denied or missing paths yield `nil`
/// rather than raising, matching the VFS's own "never raise" contract.
fn native_read_file(vm: &mut Vm, args: &[Value]) -> ember_core::Result<Value> {
    let path = arg_str(vm, args, 0, "read_file")?;
    match vm.vfs().read_file(&path) {
        Some(bytes) => Ok(vm.intern_str(&String::from_utf8_lossy(&bytes))),
        None => Ok(Value::Nil),
    }
}

fn native_write_file(vm: &mut Vm, args: &[Value]) -> ember_core::Result<Value> {
    let path = arg_str(vm, args, 0, "write_file")?;
    let contents = arg_str(vm, args, 1, "write_file")?;
    Ok(Value::Bool(vm.vfs_mut().write_file(&path, contents.as_bytes())))
}

fn native_file_exists(vm: &mut Vm, args: &[Value]) -> ember_core::Result<Value> {
    let path = arg_str(vm, args, 0, "file_exists")?;
    Ok(Value::Bool(vm.vfs().exists(&path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_runs_a_trivial_script() {
        let mut vm = Vm::new();
        vm.eval("let x = 1 + 2;").unwrap();
    }

    #[test]
    fn stdlib_print_does_not_error() {
        let mut vm = Vm::new();
        install_stdlib(&mut vm);
        vm.eval("print(\"hello\");").unwrap();
    }
}
