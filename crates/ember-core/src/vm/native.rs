//! Native-function ABI (spec §6): "a native receives `(VM, argc, argv)` and
//! returns a `Value`; it must not resize or retain `argv`."

use crate::error::Result;
use crate::value::Value;

use super::Vm;

/// A host-supplied callable, installed as a global via [`Vm::register_native`].
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value>;

/// Default `__import__`: module resolution is out of scope for this crate
/// (spec §1), so unless a host registers its own `__import__` this raises an
/// `Import` diagnostic rather than silently doing nothing.
pub(super) fn default_import(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let path = args.first().map(|v| v.print(vm.heap())).unwrap_or_else(|| "nil".to_string());
    Err(crate::error::EmberError::import(format!("no module resolver registered to import \"{path}\"")))
}
