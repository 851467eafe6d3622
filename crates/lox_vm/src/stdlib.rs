//! Built-in native function registration.
//!
//! The specification requires exactly one: `clock() -> Number`. Natives
//! are plain `fn` pointers (no VM-context capture needed yet), matching
//! the object model's `ObjNative { name, function }` shape.

use std::time::Instant;

use once_time::process_start;

use crate::value::Value;
use crate::vm::Vm;

mod once_time {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();

    pub fn process_start() -> Instant {
        *START.get_or_init(Instant::now)
    }
}

fn clock_native(_args: &[Value]) -> Result<Value, String> {
    let elapsed = Instant::now().duration_since(process_start());
    Ok(Value::Number(elapsed.as_secs_f64()))
}

/// Registers every built-in native into `vm`'s globals table. Called
/// once by `Vm::new` before any user code runs.
pub fn register_natives(vm: &mut Vm) {
    vm.define_native("clock", clock_native);
}
