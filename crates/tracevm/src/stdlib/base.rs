// Base library: output, table helpers, task/CPU introspection,
// aggregation entry points.

use crate::gc::{string_hash, Backtrace, TableId};
use crate::limits::{MAX_BACKTRACE_FRAMES, PAGE_SIZE};
use crate::ptable;
use crate::strfmt::{show_value, strfmt, SeqBuf};
use crate::value::Value;
use crate::vm::{
    self, mem_error, runtime_error, scratch_buf, set_next_as_exit, Global, KResult, State,
};

pub fn init(g: &Global) -> Result<(), crate::gc::AllocError> {
    crate::lib_registry::register_library(
        g,
        None,
        crate::lib_funcs! {
            "pairs" => lib_pairs,
            "len" => lib_len,
            "print" => lib_print,
            "printf" => lib_printf,
            "trace_printk" => lib_trace_printk,
            "in_interrupt" => lib_in_interrupt,
            "exit" => lib_exit,
            "pid" => lib_pid,
            "execname" => lib_execname,
            "cpu" => lib_cpu,
            "num_cpus" => lib_num_cpus,
            "arch" => lib_arch,
            "kernel_v" => lib_kernel_v,
            "user_string" => lib_user_string,
            "count" => lib_count,
            "histogram" => lib_histogram,
            "ptable" => lib_ptable,
            "sort" => lib_sort,
            "backtrace" => lib_backtrace,
            "gettimeofday_us" => lib_gettimeofday_us,
        },
    )
}

// ---- argument checking ----------------------------------------------

fn wrong_arg(g: &Global, ks: &mut State, n: usize) -> crate::vm::VmError {
    runtime_error(g, ks, format_args!("wrong type of argument {}", n))
}

fn check_table(g: &Global, ks: &mut State, n: usize) -> KResult<TableId> {
    match ks.arg(n) {
        Value::Table(id) => Ok(id),
        _ => Err(wrong_arg(g, ks, n)),
    }
}

fn check_number(g: &Global, ks: &mut State, n: usize) -> KResult<i64> {
    match ks.arg(n) {
        Value::Number(v) => Ok(v),
        _ => Err(wrong_arg(g, ks, n)),
    }
}

pub(crate) fn check_function(g: &Global, ks: &mut State, n: usize) -> KResult<Value> {
    let v = ks.arg(n);
    if v.is_function() {
        Ok(v)
    } else {
        Err(wrong_arg(g, ks, n))
    }
}

// ---- traversal ------------------------------------------------------

/// Iterator body handed out by `pairs`: next (key, value) in traversal
/// order, or the sorted chain when a sorted view exists.
fn lib_next(g: &Global, ks: &mut State) -> KResult<i32> {
    let t = check_table(g, ks, 1)?;
    let key = ks.arg(2);
    let r = {
        let sp = g.strings.lock();
        let tb = g.table(t);
        let data = tb.lock();
        if data.has_sorted_view() {
            Ok(data.sort_next(&sp, &key))
        } else {
            data.next(&sp, &key)
        }
    };
    match r.map_err(|e| vm::table_err(g, ks, e))? {
        Some((k, v)) => {
            ks.push(k);
            ks.push(v);
            Ok(2)
        }
        None => {
            ks.push(Value::Nil);
            Ok(1)
        }
    }
}

fn lib_pairs(g: &Global, ks: &mut State) -> KResult<i32> {
    let t = check_table(g, ks, 1)?;
    ks.push(Value::NativeFunc(lib_next));
    ks.push(Value::Table(t));
    ks.push(Value::Nil);
    Ok(3)
}

fn lib_len(g: &Global, ks: &mut State) -> KResult<i32> {
    let len = match ks.arg(1) {
        Value::Table(id) => g.table(id).lock().length(),
        Value::Str(id) => g.get_string(id).len() as i64,
        other => {
            return Err(runtime_error(
                g,
                ks,
                format_args!("cannot get length of type {}", other.type_name()),
            ));
        }
    };
    ks.push(Value::Number(len));
    Ok(1)
}

// ---- output ---------------------------------------------------------

fn lib_print(g: &Global, ks: &mut State) -> KResult<i32> {
    let mut buf = scratch_buf(g, ks);
    let mut seq = SeqBuf::new(&mut buf[..PAGE_SIZE]);
    let n = ks.arg_nr();
    for i in 1..=n {
        if i > 1 {
            seq.putc(b'\t');
        }
        let v = ks.arg(i);
        show_value(g, ks, &v, &mut seq);
    }
    seq.putc(b'\n');
    g.transport.write(ks.cpu, seq.as_bytes());
    Ok(0)
}

fn timestamp_prefix(seq: &mut SeqBuf<'_>) {
    let us = chrono::Utc::now().timestamp_micros();
    use std::fmt::Write as _;
    let _ = write!(seq, "[{}.{:06}] ", us / 1_000_000, us % 1_000_000);
}

/// Composes into the state's scratch buffer, one transport write.
fn lib_printf(g: &Global, ks: &mut State) -> KResult<i32> {
    let mut buf = scratch_buf(g, ks);
    let mut seq = SeqBuf::new(&mut buf[..PAGE_SIZE]);
    if g.parm.print_timestamp {
        timestamp_prefix(&mut seq);
    }
    strfmt(g, ks, &mut seq)?;
    g.transport.write(ks.cpu, seq.as_bytes());
    Ok(0)
}

/// Like printf, but into the host's own trace stream instead of the
/// session transport.
fn lib_trace_printk(g: &Global, ks: &mut State) -> KResult<i32> {
    let mut buf = scratch_buf(g, ks);
    let mut seq = SeqBuf::new(&mut buf[..PAGE_SIZE]);
    strfmt(g, ks, &mut seq)?;
    log::info!(
        target: "tracevm::trace",
        "{}",
        String::from_utf8_lossy(seq.as_bytes())
    );
    Ok(0)
}

fn lib_exit(g: &Global, ks: &mut State) -> KResult<i32> {
    use std::sync::atomic::Ordering;
    g.stop.store(true, Ordering::Relaxed);
    g.exit.store(true, Ordering::Relaxed);
    set_next_as_exit(ks);
    // do not execute bytecode any more on this state
    Err(crate::vm::VmError::Exit)
}

// ---- task / cpu introspection ---------------------------------------

fn lib_pid(g: &Global, ks: &mut State) -> KResult<i32> {
    let pid = g.pid(ks);
    ks.push(Value::Number(pid));
    Ok(1)
}

fn lib_execname(g: &Global, ks: &mut State) -> KResult<i32> {
    let comm = g.comm(ks);
    let v = g.intern(&comm).map_err(|_| mem_error(g, ks))?;
    ks.push(v);
    Ok(1)
}

fn lib_cpu(_g: &Global, ks: &mut State) -> KResult<i32> {
    let cpu = ks.cpu;
    ks.push(Value::Number(cpu as i64));
    Ok(1)
}

fn lib_num_cpus(g: &Global, ks: &mut State) -> KResult<i32> {
    ks.push(Value::Number(g.ncpus as i64));
    Ok(1)
}

fn lib_in_interrupt(_g: &Global, ks: &mut State) -> KResult<i32> {
    let v = ks.context.in_interrupt() as i64;
    ks.push(Value::Number(v));
    Ok(1)
}

fn lib_arch(g: &Global, ks: &mut State) -> KResult<i32> {
    let v = g.intern(std::env::consts::ARCH).map_err(|_| mem_error(g, ks))?;
    ks.push(v);
    Ok(1)
}

fn lib_kernel_v(g: &Global, ks: &mut State) -> KResult<i32> {
    let rel = g.backend.kernel_release();
    let v = g.intern(&rel).map_err(|_| mem_error(g, ks))?;
    ks.push(v);
    Ok(1)
}

fn lib_user_string(g: &Global, ks: &mut State) -> KResult<i32> {
    let addr = check_number(g, ks, 1)?;
    let s = g
        .backend
        .read_user_string(addr as u64, 256)
        .unwrap_or_default();
    let v = g.intern(&s).map_err(|_| mem_error(g, ks))?;
    ks.push(v);
    Ok(1)
}

fn lib_gettimeofday_us(_g: &Global, ks: &mut State) -> KResult<i32> {
    let us = chrono::Utc::now().timestamp_micros();
    ks.push(Value::Number(us));
    Ok(1)
}

// ---- aggregation ----------------------------------------------------

/// `count(t, k [, n])`: add `n` (default 1) to the numeric slot at `k`,
/// seeding a missing slot with `n`.
fn lib_count(g: &Global, ks: &mut State) -> KResult<i32> {
    let t = check_table(g, ks, 1)?;
    let key = ks.arg(2);
    let n = if ks.arg_nr() > 2 {
        check_number(g, ks, 3)?
    } else {
        1
    };
    let r = {
        let sp = g.strings.lock();
        let tb = g.table(t);
        let mut data = tb.lock();
        data.atomic_inc(&sp, &key, n)
    };
    r.map_err(|e| vm::table_err(g, ks, e))?;
    Ok(0)
}

fn lib_histogram(g: &Global, ks: &mut State) -> KResult<i32> {
    match ks.arg(1) {
        Value::Table(id) => ptable::table_histogram(g, ks, id)?,
        Value::PTable(id) => {
            let pt = g.objects.ptable(id);
            ptable::ptable_histogram(g, ks, &pt)?;
        }
        _ => return Err(wrong_arg(g, ks, 1)),
    }
    Ok(0)
}

/// `ptable([narr [, nrec]])`: a fresh per-CPU aggregation table.
fn lib_ptable(g: &Global, ks: &mut State) -> KResult<i32> {
    let narr = if ks.arg_nr() >= 1 {
        check_number(g, ks, 1)?.max(0) as usize
    } else {
        0
    };
    let nrec = if ks.arg_nr() >= 2 {
        check_number(g, ks, 2)?.max(0) as usize
    } else {
        0
    };
    let v = ptable::ptable_value(g, ks, narr, nrec)?;
    ks.push(v);
    Ok(1)
}

/// `sort(t [, cmp])`: materialize the sorted view (default: numeric
/// ascending of values); `pairs` then walks it.
fn lib_sort(g: &Global, ks: &mut State) -> KResult<i32> {
    let t = check_table(g, ks, 1)?;
    let cmp = if ks.arg_nr() >= 2 {
        Some(check_function(g, ks, 2)?)
    } else {
        None
    };
    vm::table_sort(g, ks, t, cmp)?;
    Ok(0)
}

/// `backtrace([max])`: capture the current stack through the host.
fn lib_backtrace(g: &Global, ks: &mut State) -> KResult<i32> {
    let max = if ks.arg_nr() >= 1 {
        check_number(g, ks, 1)?.clamp(1, MAX_BACKTRACE_FRAMES as i64) as usize
    } else {
        MAX_BACKTRACE_FRAMES
    };
    let entries = if ks.is_main {
        let mut frames = Vec::new();
        g.backend.collect_backtrace(max, &mut frames);
        frames
    } else {
        let scratch = &g.pcpu[ks.cpu].slots[ks.context.bit()].btrace;
        let mut frames = scratch.lock();
        frames.clear();
        g.backend.collect_backtrace(max, &mut frames);
        frames.clone()
    };
    let mut bytes = Vec::with_capacity(entries.len() * 8);
    for e in &entries {
        bytes.extend_from_slice(&e.to_le_bytes());
    }
    let digest = string_hash(&bytes, g.strings.lock().seed());
    let id = g
        .objects
        .new_btrace(Backtrace { entries })
        .map_err(|_| mem_error(g, ks))?;
    ks.push(Value::Btrace { id, digest });
    Ok(1)
}
