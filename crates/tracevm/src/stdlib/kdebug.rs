// kdebug library: probe registration and teardown.

use crate::probe::{end_probes, run_trace_end, start_probe_by_id};
use crate::stdlib::base::check_function;
use crate::value::Value;
use crate::vm::{close_closure_upvals, runtime_error, Global, KResult, State};

pub fn init(g: &Global) -> Result<(), crate::gc::AllocError> {
    crate::lib_registry::register_library(
        g,
        Some("kdebug"),
        crate::lib_funcs! {
            "probe_by_id" => lib_probe_by_id,
            "probe_end" => lib_probe_end,
            "traceoff" => lib_traceoff,
        },
    )
}

/// `kdebug.probe_by_id(ids, fn)`: for each id in the comma/space
/// separated list, open per-CPU tracepoint counters dispatching into the
/// closure.
fn lib_probe_by_id(g: &Global, ks: &mut State) -> KResult<i32> {
    let ids = match ks.arg(1) {
        Value::Str(id) => g.get_string(id),
        _ => {
            return Err(runtime_error(
                g,
                ks,
                format_args!("wrong type of argument 1"),
            ));
        }
    };
    let cl = check_function(g, ks, 2)?;
    // the handler must not chase this state's stack from another CPU
    close_closure_upvals(g, ks, cl);

    let garc = g.arc();
    for tok in ids.as_str().split([',', ' ']) {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        let Ok(id) = tok.parse::<u64>() else {
            continue;
        };
        if let Err(e) = start_probe_by_id(&garc, id, cl) {
            let msg = format!("unable create tracepoint event {}: {}\n", id, e);
            g.transport.write(ks.cpu, msg.as_bytes());
        }
    }
    Ok(0)
}

/// `kdebug.probe_end(fn)`: record a closure to run at session end.
fn lib_probe_end(g: &Global, ks: &mut State) -> KResult<i32> {
    if ks.arg_nr() == 0 {
        return Ok(0);
    }
    let cl = check_function(g, ks, 1)?;
    close_closure_upvals(g, ks, cl);
    *g.trace_end_closure.lock() = Some(cl);
    Ok(0)
}

/// `kdebug.traceoff()`: unregister everything, synchronize, then run the
/// recorded end closure. Calling it twice is a no-op the second time.
fn lib_traceoff(g: &Global, ks: &mut State) -> KResult<i32> {
    end_probes(g);
    run_trace_end(g, ks);
    Ok(0)
}
