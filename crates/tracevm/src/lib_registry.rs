// Library registration.
//
// Native functions register either straight into the globals table (the
// base library) or into a named module table. Every registered function
// is also appended to the C-function cache, whose indices back the
// optimizer's LOAD_GLOBAL rewrite.

use crate::gc::AllocError;
use crate::value::Value;
use crate::vm::{globals_table, Global, NativeFn};

/// One registration entry.
pub struct Reg {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Shorthand for building registration tables.
#[macro_export]
macro_rules! lib_funcs {
    ($($name:expr => $func:expr),* $(,)?) => {
        &[
            $($crate::lib_registry::Reg { name: $name, func: $func }),*
        ]
    };
}

/// Register `funcs` under `libname` (or into the globals when `None`).
pub fn register_library(
    g: &Global,
    libname: Option<&str>,
    funcs: &[Reg],
) -> Result<(), AllocError> {
    let gt = globals_table(g);
    let target = match libname {
        None => gt,
        Some(name) => {
            let module = g.objects.new_table()?;
            let key = g.intern(name)?;
            let sp = g.strings.lock();
            let globals = g.table(gt);
            globals
                .lock()
                .set(&sp, &key, Value::Table(module))
                .map_err(|_| AllocError)?;
            let tb = g.table(module);
            tb.lock()
                .resize(&sp, 0, funcs.len())
                .map_err(|_| AllocError)?;
            module
        }
    };

    for reg in funcs {
        let fname = g.intern(reg.name)?;
        let fv = Value::NativeFunc(reg.func);
        {
            let sp = g.strings.lock();
            let tb = g.table(target);
            tb.lock().set(&sp, &fname, fv).map_err(|_| AllocError)?;
        }
        g.cfunction_add(fv)?;
    }
    Ok(())
}
