// os library.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::value::Value;
use crate::vm::{runtime_error, set_next_as_exit, Global, KResult, State, VmError};

pub fn init(g: &Global) -> Result<(), crate::gc::AllocError> {
    crate::lib_registry::register_library(
        g,
        Some("os"),
        crate::lib_funcs! {
            "sleep" => lib_sleep,
        },
    )
}

/// `os.sleep(ms)`. Only the main state may block; a pending stop turns
/// the sleep into session exit.
fn lib_sleep(g: &Global, ks: &mut State) -> KResult<i32> {
    if !ks.is_main {
        return Ok(0);
    }
    let ms = match ks.arg(1) {
        Value::Number(n) if n >= 0 => n as u64,
        _ => {
            return Err(runtime_error(
                g,
                ks,
                format_args!("wrong type of argument 1"),
            ));
        }
    };
    let mut slept = 0;
    while slept < ms {
        let chunk = (ms - slept).min(10);
        std::thread::sleep(Duration::from_millis(chunk));
        slept += chunk;
        if g.stop.load(Ordering::Relaxed) {
            g.exit.store(true, Ordering::Relaxed);
            set_next_as_exit(ks);
            return Err(VmError::Exit);
        }
        if g.exit.load(Ordering::Relaxed) {
            break;
        }
    }
    Ok(0)
}
