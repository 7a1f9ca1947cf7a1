// timer library: periodic and profiling handler invocation.

use std::sync::atomic::Ordering;

use crate::stdlib::base::check_function;
use crate::timer::start_timer;
use crate::value::Value;
use crate::vm::{close_closure_upvals, runtime_error, Global, KResult, State};

const NSEC_PER_SEC: u64 = 1_000_000_000;
const NSEC_PER_MSEC: u64 = 1_000_000;
const NSEC_PER_USEC: u64 = 1_000;

/// Sampling period `timer.profile` arms on every traced CPU.
const PROFILE_PERIOD_NS: u64 = 10 * NSEC_PER_MSEC;

pub fn init(g: &Global) -> Result<(), crate::gc::AllocError> {
    crate::lib_registry::register_library(
        g,
        Some("timer"),
        crate::lib_funcs! {
            "s" => lib_second,
            "sec" => lib_second,
            "ms" => lib_msecond,
            "msec" => lib_msecond,
            "us" => lib_usecond,
            "usec" => lib_usecond,
            "ns" => lib_nsecond,
            "nsec" => lib_nsecond,
            "profile" => lib_profile,
        },
    )
}

fn arm(g: &Global, ks: &mut State, period_ns: u64, cl: Value, cpu: usize) -> KResult<()> {
    close_closure_upvals(g, ks, cl);
    let t = start_timer(&g.arc(), period_ns, cl, cpu)
        .map_err(|_| runtime_error(g, ks, format_args!("cannot create timer")))?;
    g.timers.lock().push(t);
    Ok(())
}

fn set_timer(g: &Global, ks: &mut State, factor: u64) -> KResult<i32> {
    let n = match ks.arg(1) {
        Value::Number(n) if n > 0 => n as u64,
        _ => {
            return Err(runtime_error(
                g,
                ks,
                format_args!("wrong type of argument 1"),
            ));
        }
    };
    let cl = check_function(g, ks, 2)?;
    // spread timers over the traced CPUs
    let idx = g.next_timer_cpu.fetch_add(1, Ordering::Relaxed) % g.cpumask.len();
    arm(g, ks, factor.saturating_mul(n), cl, g.cpumask[idx])?;
    Ok(0)
}

fn lib_second(g: &Global, ks: &mut State) -> KResult<i32> {
    set_timer(g, ks, NSEC_PER_SEC)
}

fn lib_msecond(g: &Global, ks: &mut State) -> KResult<i32> {
    set_timer(g, ks, NSEC_PER_MSEC)
}

fn lib_usecond(g: &Global, ks: &mut State) -> KResult<i32> {
    set_timer(g, ks, NSEC_PER_USEC)
}

fn lib_nsecond(g: &Global, ks: &mut State) -> KResult<i32> {
    set_timer(g, ks, 1)
}

/// `timer.profile(fn)`: a sampling timer on every CPU in the mask.
fn lib_profile(g: &Global, ks: &mut State) -> KResult<i32> {
    let cl = check_function(g, ks, 1)?;
    let cpus = g.cpumask.clone();
    for cpu in cpus {
        arm(g, ks, PROFILE_PERIOD_NS, cl, cpu)?;
    }
    Ok(0)
}
