// The bytecode interpreter.
//
// Single-loop design: `'newframe` reloads the frame context (closure,
// proto, base, saved pc) and the inner loop dispatches instructions.
// Calls into script functions push a frame and continue at `'newframe`;
// native calls run inline. The saved program counter is re-read after any
// native call so forced-exit patching (`set_next_as_exit`) takes effect at
// the next dispatch.
//
// Arithmetic is 64-bit integer only. Errors never unwind with a payload:
// the diagnostic goes out through the transport at the raise site and a
// one-byte `VmError` propagates to the outermost entry (`run`), which
// absorbs it.

use std::sync::atomic::Ordering;

use crate::event;
use crate::gc::TableId;
use crate::limits::{EXEC_COUNT_LIMIT, FIELDS_PER_FLUSH, MIN_STACK, PAGE_SIZE};
use crate::ptable;
use crate::value::{Closure, TableError, Value};
use crate::vm::call_info::{call_status::*, CallInfo};
use crate::vm::opcode::*;
use crate::vm::state::{
    checkstack, close_upvals, find_upval, mem_error, runtime_error, with_scratch, Global, State,
};
use crate::vm::{KResult, VmError};

pub enum PreCall {
    /// A native function ran to completion and its results were folded.
    Native,
    /// A script frame was pushed; the caller resumes the dispatch loop.
    Frame,
}

/// Call protocol entry: dispatch on the callee's tag.
pub fn precall(g: &Global, ks: &mut State, func: usize, nresults: i32) -> KResult<PreCall> {
    match ks.stack[func] {
        Value::NativeFunc(f) => {
            checkstack(g, ks, MIN_STACK)?;
            ks.frames.push(CallInfo {
                func,
                base: func + 1,
                top: ks.top + MIN_STACK,
                nresults,
                pc: 0,
                status: 0,
            });
            let n = f(g, ks)?;
            debug_assert!(n >= 0 && (n as usize) <= ks.top);
            let first = ks.top - n as usize;
            poscall(ks, first);
            Ok(PreCall::Native)
        }
        Value::Closure(cid) => {
            let cl = g.objects.closure(cid);
            let proto = g.objects.proto(cl.proto);
            let maxstack = proto.maxstacksize as usize;
            checkstack(g, ks, maxstack + proto.numparams as usize + 1)?;
            // complete missing arguments
            let mut n = ks.top - func - 1;
            while n < proto.numparams as usize {
                ks.push(Value::Nil);
                n += 1;
            }
            let base = if proto.is_vararg {
                adjust_varargs(ks, proto.numparams as usize, n)
            } else {
                func + 1
            };
            let top = base + maxstack;
            ks.frames.push(CallInfo {
                func,
                base,
                top,
                nresults,
                pc: 0,
                status: CIST_SCRIPT,
            });
            ks.top = top;
            Ok(PreCall::Frame)
        }
        _ => Err(runtime_error(
            g,
            ks,
            format_args!("attempt to call nil function"),
        )),
    }
}

/// Move the fixed parameters of a vararg frame above the actual
/// arguments; the extras stay below the new base.
fn adjust_varargs(ks: &mut State, nfixargs: usize, actual: usize) -> usize {
    let fixed = ks.top - actual;
    let base = ks.top;
    for i in 0..nfixargs {
        let v = ks.stack[fixed + i];
        ks.push(v);
        ks.stack[fixed + i] = Value::Nil;
    }
    base
}

/// Fold call results into the caller: pops the frame and copies the
/// results over the function slot. Returns false when the caller takes
/// however many results there are.
fn poscall(ks: &mut State, mut first: usize) -> bool {
    let ci = ks.frames.pop().expect("poscall without frame");
    let mut res = ci.func;
    let wanted = ci.nresults;
    let mut i = wanted;
    while i != 0 && first < ks.top {
        ks.stack[res] = ks.stack[first];
        res += 1;
        first += 1;
        i -= 1;
    }
    while i > 0 {
        ks.stack[res] = Value::Nil;
        res += 1;
        i -= 1;
    }
    ks.top = res;
    wanted != -1
}

/// Call the value at stack slot `func`. Propagates interpreter errors.
pub fn call(g: &Global, ks: &mut State, func: usize, nresults: i32) -> KResult<()> {
    if matches!(precall(g, ks, func, nresults)?, PreCall::Frame) {
        execute(g, ks)
    } else {
        Ok(())
    }
}

/// Outermost call entry (script startup, probe/timer handlers): runtime
/// errors were already reported and patched, exit is a session flag, so
/// nothing propagates further.
pub fn run(g: &Global, ks: &mut State, func: usize, nresults: i32) {
    match call(g, ks, func, nresults) {
        Ok(()) => {}
        Err(VmError::Runtime) | Err(VmError::Memory) | Err(VmError::Exit) => {}
    }
}

#[inline(always)]
fn rk(stack: &[Value], k: &[Value], base: usize, x: usize) -> Value {
    if is_k(x) {
        k[index_k(x)]
    } else {
        stack[base + x]
    }
}

/// `<` over numbers and strings; anything else is false.
fn less_than(g: &Global, l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a < b,
        (Value::Str(a), Value::Str(b)) => {
            let sp = g.strings.lock();
            sp.get_ref(*a).as_str() < sp.get_ref(*b).as_str()
        }
        _ => false,
    }
}

fn less_equal(g: &Global, l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a <= b,
        (Value::Str(a), Value::Str(b)) => {
            let sp = g.strings.lock();
            sp.get_ref(*a).as_str() <= sp.get_ref(*b).as_str()
        }
        _ => false,
    }
}

/// Table read dispatch (tables and aggregation tables).
pub fn gettable(g: &Global, ks: &mut State, t: Value, key: &Value) -> KResult<Value> {
    match t {
        Value::Table(id) => {
            let sp = g.strings.lock();
            let tb = g.table(id);
            let v = tb.lock().get(&sp, key);
            Ok(v)
        }
        Value::PTable(id) => {
            let pt = g.objects.ptable(id);
            Ok(match ptable::ptable_get(g, ks, &pt, key)? {
                Some(sd) => Value::Stat(sd),
                None => Value::Nil,
            })
        }
        Value::Nil => Err(runtime_error(
            g,
            ks,
            format_args!("attempt to access nil table"),
        )),
        other => Err(runtime_error(
            g,
            ks,
            format_args!("attempt to index a {} value", other.type_name()),
        )),
    }
}

pub(crate) fn table_err(g: &Global, ks: &mut State, e: TableError) -> VmError {
    match e {
        TableError::NilKey => runtime_error(g, ks, format_args!("table index is nil")),
        TableError::EventEscape => runtime_error(
            g,
            ks,
            format_args!("event values cannot be stored in a table"),
        ),
        TableError::Overflow => runtime_error(g, ks, format_args!("table overflow")),
        TableError::InvalidNext => {
            runtime_error(g, ks, format_args!("invalid table key to next"))
        }
    }
}

/// Table write dispatch.
pub fn settable(g: &Global, ks: &mut State, t: Value, key: &Value, val: Value) -> KResult<()> {
    match t {
        Value::Table(id) => {
            let r = {
                let sp = g.strings.lock();
                let tb = g.table(id);
                let mut data = tb.lock();
                data.set(&sp, key, val)
            };
            r.map_err(|e| table_err(g, ks, e))
        }
        Value::PTable(id) => {
            let pt = g.objects.ptable(id);
            ptable::ptable_set(g, ks, &pt, key, &val)
        }
        Value::Nil => Err(runtime_error(
            g,
            ks,
            format_args!("attempt to access nil table"),
        )),
        other => Err(runtime_error(
            g,
            ks,
            format_args!("attempt to index a {} value", other.type_name()),
        )),
    }
}

/// `CONCAT` registers base+b ..= base+c through the per-context scratch
/// buffer; the result lands in base+b. Bounded by one page.
fn concat(g: &Global, ks: &mut State, base: usize, b: usize, c: usize) -> KResult<()> {
    let vals: Vec<Value> = ks.stack[base + b..=base + c].to_vec();
    let mut len = 0usize;
    for v in &vals {
        match v {
            Value::Str(id) => len += g.strings.lock().get_ref(*id).len(),
            _ => {
                return Err(runtime_error(
                    g,
                    ks,
                    format_args!("cannot concat non-string"),
                ));
            }
        }
    }
    if len >= PAGE_SIZE {
        return Err(runtime_error(
            g,
            ks,
            format_args!("too long string concatenation"),
        ));
    }
    let sv = with_scratch(g, ks, |buf| {
        let mut sp = g.strings.lock();
        let mut off = 0;
        for v in &vals {
            if let Value::Str(id) = v {
                let ts = sp.get_ref(*id);
                let bytes = ts.as_str().as_bytes();
                buf[off..off + bytes.len()].copy_from_slice(bytes);
                off += bytes.len();
            }
        }
        // the scratch holds a concatenation of valid utf-8 strings
        let s = unsafe { std::str::from_utf8_unchecked(&buf[..len]) };
        sp.new_str(s)
    })
    .map_err(|_| mem_error(g, ks))?;
    ks.stack[base + b] = Value::Str(sv);
    Ok(())
}

/// The main dispatch loop.
pub fn execute(g: &Global, ks: &mut State) -> KResult<()> {
    let mut exec_count: u32 = 0;

    'newframe: loop {
        let frame_idx = ks.frames.len() - 1;
        let ci = ks.frames[frame_idx];
        let mut pc = ci.pc;
        let base = ci.base;
        let cl = match ks.stack[ci.func] {
            Value::Closure(cid) => g.objects.closure(cid),
            _ => return Ok(()),
        };
        let proto = g.objects.proto(cl.proto);
        let k = &proto.k;
        let code = &proto.code;

        macro_rules! save_pc {
            () => {
                ks.frames[frame_idx].pc = pc;
            };
        }
        macro_rules! reload_pc {
            () => {
                pc = ks.frames[frame_idx].pc;
            };
        }

        loop {
            // dead-loop detection / cooperative checkpoint
            exec_count += 1;
            if exec_count >= EXEC_COUNT_LIMIT {
                if !ks.is_main {
                    return Err(runtime_error(
                        g,
                        ks,
                        format_args!(
                            "non-mainthread executing too much, \
                             please try to enlarge execution limit"
                        ),
                    ));
                }
                std::thread::yield_now();
                if g.stop.load(Ordering::Relaxed) || g.exit.load(Ordering::Relaxed) {
                    return Ok(());
                }
                exec_count = 0;
            }

            // a patched (or runaway) pc decodes as EXIT
            let instr = if pc < code.len() { code[pc] } else { EXIT_INSTR };
            pc = pc.wrapping_add(1);
            let ra = base + get_a(instr);

            match get_op(instr) {
                OpCode::Move => {
                    ks.stack[ra] = ks.stack[base + get_b(instr)];
                }
                OpCode::LoadK => {
                    ks.stack[ra] = k[get_bx(instr)];
                }
                OpCode::LoadKx => {
                    let ax = get_ax(if pc < code.len() { code[pc] } else { 0 });
                    pc += 1;
                    ks.stack[ra] = k[ax];
                }
                OpCode::LoadBool => {
                    ks.stack[ra] = Value::Boolean(get_b(instr) != 0);
                    if get_c(instr) != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let b = get_b(instr);
                    for i in 0..=b {
                        ks.stack[ra + i] = Value::Nil;
                    }
                }
                OpCode::GetUpval => {
                    let cell = g.objects.upval(cl.upvals[get_b(instr)]);
                    ks.stack[ra] = cell.read(&ks.stack);
                }
                OpCode::SetUpval => {
                    let cell = g.objects.upval(cl.upvals[get_b(instr)]);
                    let v = ks.stack[ra];
                    cell.write(&mut ks.stack, v);
                }
                OpCode::GetTabUp => {
                    let cell = g.objects.upval(cl.upvals[get_b(instr)]);
                    let t = cell.read(&ks.stack);
                    let key = rk(&ks.stack, k, base, get_c(instr));
                    let v = gettable(g, ks, t, &key)?;
                    ks.stack[ra] = v;
                }
                OpCode::GetTable => {
                    let t = ks.stack[base + get_b(instr)];
                    let key = rk(&ks.stack, k, base, get_c(instr));
                    let v = gettable(g, ks, t, &key)?;
                    ks.stack[ra] = v;
                }
                OpCode::SetTabUp => {
                    let cell = g.objects.upval(cl.upvals[get_a(instr)]);
                    let t = cell.read(&ks.stack);
                    let key = rk(&ks.stack, k, base, get_b(instr));
                    let val = rk(&ks.stack, k, base, get_c(instr));
                    settable(g, ks, t, &key, val)?;
                }
                OpCode::SetTable => {
                    let t = ks.stack[ra];
                    let key = rk(&ks.stack, k, base, get_b(instr));
                    let val = rk(&ks.stack, k, base, get_c(instr));
                    settable(g, ks, t, &key, val)?;
                }
                OpCode::NewTable => {
                    let b = get_b(instr);
                    let c = get_c(instr);
                    let tv = g.new_table_value().map_err(|_| mem_error(g, ks))?;
                    ks.stack[ra] = tv;
                    if b != 0 || c != 0 {
                        let sp = g.strings.lock();
                        let tb = g.table(tv.as_table_id().expect("fresh table"));
                        let r = tb.lock().resize(&sp, fb2int(b), fb2int(c));
                        drop(sp);
                        r.map_err(|e| table_err(g, ks, e))?;
                    }
                }
                OpCode::SelfOp => {
                    let rb = ks.stack[base + get_b(instr)];
                    ks.stack[ra + 1] = rb;
                    let key = rk(&ks.stack, k, base, get_c(instr));
                    let v = gettable(g, ks, rb, &key)?;
                    ks.stack[ra] = v;
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                    let op = get_op(instr);
                    let vb = rk(&ks.stack, k, base, get_b(instr));
                    let vc = rk(&ks.stack, k, base, get_c(instr));
                    let (Value::Number(nb), Value::Number(nc)) = (vb, vc) else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("cannot make arith operation"),
                        ));
                    };
                    let r = match op {
                        OpCode::Add => nb.wrapping_add(nc),
                        OpCode::Sub => nb.wrapping_sub(nc),
                        OpCode::Mul => nb.wrapping_mul(nc),
                        OpCode::Div => {
                            if nc == 0 {
                                return Err(runtime_error(
                                    g,
                                    ks,
                                    format_args!("divide 0 arith operation"),
                                ));
                            }
                            nb.wrapping_div(nc)
                        }
                        OpCode::Mod => {
                            if nc == 0 {
                                return Err(runtime_error(
                                    g,
                                    ks,
                                    format_args!("mod 0 arith operation"),
                                ));
                            }
                            nb.wrapping_rem(nc)
                        }
                        _ => unreachable!(),
                    };
                    ks.stack[ra] = Value::Number(r);
                }
                OpCode::Pow => {
                    return Err(runtime_error(
                        g,
                        ks,
                        format_args!("pow arith operation is not supported"),
                    ));
                }
                OpCode::Unm => {
                    let rb = ks.stack[base + get_b(instr)];
                    match rb {
                        Value::Number(n) => ks.stack[ra] = Value::Number(n.wrapping_neg()),
                        _ => {
                            return Err(runtime_error(
                                g,
                                ks,
                                format_args!("cannot make arith operation"),
                            ));
                        }
                    }
                }
                OpCode::Not => {
                    let rb = ks.stack[base + get_b(instr)];
                    ks.stack[ra] = Value::Boolean(rb.is_false());
                }
                OpCode::Len => {
                    let rb = ks.stack[base + get_b(instr)];
                    let len = match rb {
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
                    ks.stack[ra] = Value::Number(len);
                }
                OpCode::Concat => {
                    concat(g, ks, base, get_b(instr), get_c(instr))?;
                }
                OpCode::Jmp => {
                    pc = (pc as i64 + get_sbx(instr) as i64) as usize;
                }
                OpCode::Eq => {
                    let vb = rk(&ks.stack, k, base, get_b(instr));
                    let vc = rk(&ks.stack, k, base, get_c(instr));
                    let eq = {
                        let sp = g.strings.lock();
                        vb.raw_equal(&vc, &sp)
                    };
                    if eq != (get_a(instr) != 0) {
                        pc += 1;
                    } else {
                        let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                        pc = (pc as i64 + get_sbx(next) as i64 + 1) as usize;
                    }
                }
                OpCode::Lt => {
                    let vb = rk(&ks.stack, k, base, get_b(instr));
                    let vc = rk(&ks.stack, k, base, get_c(instr));
                    if less_than(g, &vb, &vc) != (get_a(instr) != 0) {
                        pc += 1;
                    } else {
                        let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                        pc = (pc as i64 + get_sbx(next) as i64 + 1) as usize;
                    }
                }
                OpCode::Le => {
                    let vb = rk(&ks.stack, k, base, get_b(instr));
                    let vc = rk(&ks.stack, k, base, get_c(instr));
                    if less_equal(g, &vb, &vc) != (get_a(instr) != 0) {
                        pc += 1;
                    } else {
                        let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                        pc = (pc as i64 + get_sbx(next) as i64 + 1) as usize;
                    }
                }
                OpCode::Test => {
                    let cond = if get_c(instr) != 0 {
                        ks.stack[ra].is_false()
                    } else {
                        !ks.stack[ra].is_false()
                    };
                    if cond {
                        pc += 1;
                    } else {
                        let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                        pc = (pc as i64 + get_sbx(next) as i64 + 1) as usize;
                    }
                }
                OpCode::TestSet => {
                    let rb = ks.stack[base + get_b(instr)];
                    let cond = if get_c(instr) != 0 {
                        rb.is_false()
                    } else {
                        !rb.is_false()
                    };
                    if cond {
                        pc += 1;
                    } else {
                        ks.stack[ra] = rb;
                        let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                        pc = (pc as i64 + get_sbx(next) as i64 + 1) as usize;
                    }
                }
                OpCode::Call => {
                    let b = get_b(instr);
                    let nresults = get_c(instr) as i32 - 1;
                    if b != 0 {
                        ks.top = ra + b;
                    }
                    save_pc!();
                    match precall(g, ks, ra, nresults)? {
                        PreCall::Native => {
                            if nresults >= 0 {
                                ks.top = ks.frames[frame_idx].top;
                            }
                            reload_pc!();
                        }
                        PreCall::Frame => {
                            // flag checked at return time, see OP_RETURN
                            ks.frames.last_mut().expect("new frame").status |= CIST_REENTRY;
                            continue 'newframe;
                        }
                    }
                }
                OpCode::TailCall => {
                    let b = get_b(instr);
                    if b != 0 {
                        ks.top = ra + b;
                    }
                    save_pc!();
                    match precall(g, ks, ra, -1)? {
                        PreCall::Native => {
                            reload_pc!();
                        }
                        PreCall::Frame => {
                            // put the called frame in place of the caller
                            let nidx = ks.frames.len() - 1;
                            let oidx = nidx - 1;
                            debug_assert_eq!(oidx, frame_idx);
                            close_upvals(g, ks, ks.frames[oidx].base);

                            let nci = ks.frames[nidx];
                            let ofunc = ks.frames[oidx].func;
                            let nfunc = nci.func;
                            let ncl = ks.stack[nfunc].as_closure_id().expect("tail callee");
                            let nparams =
                                g.objects.proto(g.objects.closure(ncl).proto).numparams as usize;
                            let lim = nci.base + nparams;
                            for i in 0..lim - nfunc {
                                ks.stack[ofunc + i] = ks.stack[nfunc + i];
                            }
                            let shift = nfunc - ofunc;
                            let oci = &mut ks.frames[oidx];
                            oci.base = nci.base - shift;
                            oci.top = ks.top - shift;
                            oci.pc = nci.pc;
                            ks.top = oci.top;
                            ks.frames.pop();
                            continue 'newframe;
                        }
                    }
                }
                OpCode::Return => {
                    let b = get_b(instr);
                    if b != 0 {
                        ks.top = ra + b - 1;
                    }
                    close_upvals(g, ks, base);
                    let reentry = ks.frames[frame_idx].status & CIST_REENTRY != 0;
                    let fixed = poscall(ks, ra);
                    if !reentry {
                        // called from external invocation
                        return Ok(());
                    }
                    if fixed {
                        ks.top = ks.ci().top;
                    }
                    continue 'newframe;
                }
                OpCode::ForLoop => {
                    let (Value::Number(idx0), Value::Number(limit), Value::Number(step)) =
                        (ks.stack[ra], ks.stack[ra + 1], ks.stack[ra + 2])
                    else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("'for' loop variable must be a number"),
                        ));
                    };
                    let idx = idx0.wrapping_add(step);
                    let cont = if step > 0 { idx <= limit } else { limit <= idx };
                    if cont {
                        pc = (pc as i64 + get_sbx(instr) as i64) as usize;
                        ks.stack[ra] = Value::Number(idx);
                        ks.stack[ra + 3] = Value::Number(idx);
                    }
                }
                OpCode::ForPrep => {
                    let Value::Number(init) = ks.stack[ra] else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("'for' initial value must be a number"),
                        ));
                    };
                    let Value::Number(_) = ks.stack[ra + 1] else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("'for' limit must be a number"),
                        ));
                    };
                    let Value::Number(step) = ks.stack[ra + 2] else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("'for' step must be a number"),
                        ));
                    };
                    ks.stack[ra] = Value::Number(init.wrapping_sub(step));
                    pc = (pc as i64 + get_sbx(instr) as i64) as usize;
                }
                OpCode::TForCall => {
                    let cb = ra + 3;
                    ks.stack[cb + 2] = ks.stack[ra + 2];
                    ks.stack[cb + 1] = ks.stack[ra + 1];
                    ks.stack[cb] = ks.stack[ra];
                    ks.top = cb + 3; // func + 2 args (state and control)
                    save_pc!();
                    call(g, ks, cb, get_c(instr) as i32)?;
                    reload_pc!();
                    ks.top = ks.frames[frame_idx].top;
                    // fall through into the paired TFORLOOP
                    let next = if pc < code.len() { code[pc] } else { EXIT_INSTR };
                    pc = pc.wrapping_add(1);
                    let ra2 = base + get_a(next);
                    if !ks.stack[ra2 + 1].is_nil() {
                        ks.stack[ra2] = ks.stack[ra2 + 1];
                        pc = (pc as i64 + get_sbx(next) as i64) as usize;
                    }
                }
                OpCode::TForLoop => {
                    if !ks.stack[ra + 1].is_nil() {
                        ks.stack[ra] = ks.stack[ra + 1];
                        pc = (pc as i64 + get_sbx(instr) as i64) as usize;
                    }
                }
                OpCode::SetList => {
                    let mut n = get_b(instr);
                    let mut c = get_c(instr);
                    if n == 0 {
                        n = ks.top - ra - 1;
                    }
                    if c == 0 {
                        c = get_ax(if pc < code.len() { code[pc] } else { 0 });
                        pc += 1;
                    }
                    let Value::Table(tid) = ks.stack[ra] else {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("attempt to set list on a non-table value"),
                        ));
                    };
                    let mut last = (c - 1) * FIELDS_PER_FLUSH + n;
                    let r = {
                        let sp = g.strings.lock();
                        let tb = g.table(tid);
                        let mut data = tb.lock();
                        let mut r = Ok(());
                        for i in (1..=n).rev() {
                            r = data.set_int(&sp, last as i64, ks.stack[ra + i]);
                            if r.is_err() {
                                break;
                            }
                            last -= 1;
                        }
                        r
                    };
                    r.map_err(|e| table_err(g, ks, e))?;
                    ks.top = ks.frames[frame_idx].top;
                }
                OpCode::Closure => {
                    let pid = proto.p[get_bx(instr)];
                    let child = g.objects.proto(pid);
                    let mut upvals = Vec::with_capacity(child.upvalues.len());
                    for desc in &child.upvalues {
                        if desc.instack {
                            upvals.push(find_upval(g, ks, base + desc.idx as usize)?);
                        } else {
                            upvals.push(cl.upvals[desc.idx as usize]);
                        }
                    }
                    let cid = g
                        .objects
                        .new_closure(Closure {
                            proto: pid,
                            upvals,
                        })
                        .map_err(|_| mem_error(g, ks))?;
                    ks.stack[ra] = Value::Closure(cid);
                }
                OpCode::Vararg => {
                    let b = get_b(instr) as i64 - 1;
                    let n = (base as i64 - ci.func as i64) - proto.numparams as i64 - 1;
                    let n = n.max(0);
                    let count = if b < 0 {
                        checkstack(g, ks, n as usize)?;
                        ks.top = ra + n as usize;
                        n
                    } else {
                        b
                    };
                    for j in 0..count {
                        ks.stack[ra + j as usize] = if j < n {
                            ks.stack[(base as i64 - n + j) as usize]
                        } else {
                            Value::Nil
                        };
                    }
                }
                OpCode::ExtraArg => {
                    return Ok(());
                }
                OpCode::Event => {
                    let b = get_b(instr);
                    let rb = ks.stack[base + b];
                    if b == 0 && matches!(rb, Value::Event) {
                        event::handle(g, ks, get_c(instr), ra)?;
                    } else {
                        // normal GETTABLE path: the operand names the field
                        let name = event::field_name(get_c(instr));
                        let key = g.intern(name).map_err(|_| mem_error(g, ks))?;
                        let v = gettable(g, ks, rb, &key)?;
                        ks.stack[ra] = v;
                    }
                }
                OpCode::LoadGlobal => {
                    ks.stack[ra] = g.cfunction_get(get_c(instr));
                }
                OpCode::Exit => {
                    return Ok(());
                }
            }
        }
    }
}

// ---- sorted view driver --------------------------------------------

/// Order all present entries of a table and install the sorted chain.
/// The comparator runs outside the table lock: entries are snapshotted,
/// ordered (insertion into the chain, one entry at a time), and the
/// chain written back in one locked step.
pub fn table_sort(g: &Global, ks: &mut State, tid: TableId, cmp: Option<Value>) -> KResult<()> {
    let snapshot = g.table(tid).lock().entries();

    let mut ordered: Vec<(Value, Value)> = Vec::with_capacity(snapshot.len());
    for (key, val) in snapshot {
        let mut at = ordered.len();
        for (i, (_, other)) in ordered.iter().enumerate() {
            let before = match cmp {
                None => {
                    // default: numeric ascending of values
                    !matches!(
                        (other, &val),
                        (Value::Number(a), Value::Number(b)) if a < b
                    )
                }
                Some(f) => !closure_compare(g, ks, f, *other, val)?,
            };
            if before {
                at = i;
                break;
            }
        }
        ordered.insert(at, (key, val));
    }

    g.table(tid).lock().install_sorted(&ordered);
    Ok(())
}

fn closure_compare(g: &Global, ks: &mut State, f: Value, v1: Value, v2: Value) -> KResult<bool> {
    checkstack(g, ks, 4)?;
    let func = ks.top;
    ks.push(f);
    ks.push(v1);
    ks.push(v2);
    call(g, ks, func, 1)?;
    let res = !ks.stack[ks.top - 1].is_false();
    ks.top = func;
    Ok(res)
}
