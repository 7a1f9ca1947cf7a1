// Event model: field accessors over the live trace payload.
//
// When a probe fires, the dispatcher builds an `Event` descriptor on its
// own stack (call descriptor, raw payload pointer and size, optional
// register context) and parks it on the receiving child state for the
// duration of the handler. The language sees a closed set of field names,
// each mapped to a native accessor; the optimizer rewrites known field
// reads into `EVENT` instructions that call the accessor directly.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use smol_str::SmolStr;

use crate::value::Value;
use crate::vm::{mem_error, runtime_error, Global, KResult, State};

/// One field of a trace event, as described by the host facility.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: SmolStr,
    pub ftype: SmolStr,
    pub offset: u16,
    pub size: u16,
    pub is_signed: bool,
}

/// The host-side descriptor of a trace event class.
#[derive(Debug, Clone)]
pub struct EventCall {
    /// Tracepoint id the session subscribed with.
    pub id: u64,
    pub name: SmolStr,
    pub print_fmt: String,
    pub fields: Vec<FieldDesc>,
}

/// Register context captured at the probe site. The host fills what it
/// has; `ax` doubles as the return-value register.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegContext {
    pub ax: u64,
    pub orig_ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub bp: u64,
    pub sp: u64,
    pub ip: u64,
    pub flags: u64,
}

impl RegContext {
    #[inline]
    pub fn return_value(&self) -> i64 {
        self.ax as i64
    }

    #[inline]
    pub fn set_return_value(&mut self, v: i64) {
        self.ax = v as u64;
    }

    pub fn dump(&self) -> String {
        format!(
            "{{ax: 0x{:x}, orig_ax: 0x{:x}, bx: 0x{:x}, cx: 0x{:x}, dx: 0x{:x}, \
             si: 0x{:x}, di: 0x{:x}, bp: 0x{:x}, ip: 0x{:x}, flags: 0x{:x}, sp: 0x{:x}}}",
            self.ax,
            self.orig_ax,
            self.bx,
            self.cx,
            self.dx,
            self.si,
            self.di,
            self.bp,
            self.ip,
            self.flags,
            self.sp,
        )
    }
}

// The payload and register pointers stay valid exactly as long as the
// probe callback frame that created the Event, and the Event never
// outlives its handler invocation. The wrappers exist so a child state
// (which holds the Event while the handler runs) stays Send.
#[derive(Debug, Clone, Copy)]
struct RawPayload(*const u8);
unsafe impl Send for RawPayload {}
unsafe impl Sync for RawPayload {}

#[derive(Debug, Clone, Copy)]
struct RawRegs(*mut RegContext);
unsafe impl Send for RawRegs {}
unsafe impl Sync for RawRegs {}

/// Stack-only descriptor of a currently firing probe. Invalid after the
/// handler returns; it is never stored into tables or other persistent
/// structures.
#[derive(Clone)]
pub struct Event {
    pub call: Arc<EventCall>,
    entry: RawPayload,
    pub entry_size: usize,
    regs: RawRegs,
    pub pid: i64,
    pub comm: SmolStr,
}

impl Event {
    /// `entry`/`regs` must outlive the handler invocation this event is
    /// handed to.
    pub(crate) fn new(
        call: Arc<EventCall>,
        entry: *const u8,
        entry_size: usize,
        regs: *mut RegContext,
        pid: i64,
        comm: SmolStr,
    ) -> Event {
        Event {
            call,
            entry: RawPayload(entry),
            entry_size,
            regs: RawRegs(regs),
            pid,
            comm,
        }
    }

    fn payload(&self) -> &[u8] {
        if self.entry.0.is_null() {
            return &[];
        }
        // SAFETY: the dispatcher keeps the payload alive for the whole
        // handler invocation; see Event::new.
        unsafe { std::slice::from_raw_parts(self.entry.0, self.entry_size) }
    }

    fn regs(&self) -> Option<&RegContext> {
        // SAFETY: as for payload().
        unsafe { self.regs.0.as_ref() }
    }

    fn regs_mut(&self) -> Option<&mut RegContext> {
        // SAFETY: as for payload(); the register context is owned by the
        // single probe callback currently running this handler.
        unsafe { self.regs.0.as_mut() }
    }

    fn read_field(&self, offset: usize, size: usize, signed: bool) -> Option<i64> {
        let payload = self.payload();
        let bytes = payload.get(offset..offset + size)?;
        Some(match (size, signed) {
            (1, false) => bytes[0] as i64,
            (1, true) => bytes[0] as i8 as i64,
            (2, false) => u16::from_le_bytes(bytes.try_into().ok()?) as i64,
            (2, true) => i16::from_le_bytes(bytes.try_into().ok()?) as i64,
            (4, false) => u32::from_le_bytes(bytes.try_into().ok()?) as i64,
            (4, true) => i32::from_le_bytes(bytes.try_into().ok()?) as i64,
            (8, _) => i64::from_le_bytes(bytes.try_into().ok()?),
            _ => return None,
        })
    }
}

// Raw syscall payload layout: the common trace-entry header, then the
// syscall number, then up to six arguments.
const SC_HEADER_SIZE: usize = 8;
const SC_NR_OFFSET: usize = SC_HEADER_SIZE;
const SC_ARGS_OFFSET: usize = SC_HEADER_SIZE + 8;

fn sc_nr(e: &Event) -> Option<i64> {
    e.read_field(SC_NR_OFFSET, 4, true)
}

fn sc_arg(e: &Event, n: usize) -> Option<i64> {
    debug_assert!((1..=6).contains(&n));
    e.read_field(SC_ARGS_OFFSET + 8 * (n - 1), 8, false)
}

// ---- the accessor table ---------------------------------------------

type Accessor = fn(&Global, &mut State, &Event, usize) -> KResult<()>;

fn event_name(g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    let v = g.intern(&e.call.name).map_err(|_| mem_error(g, ks))?;
    ks.stack[ra] = v;
    Ok(())
}

fn event_tostring(_g: &Global, ks: &mut State, _e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = Value::NativeFunc(event_fn_tostring);
    Ok(())
}

/// `e.tostring()` body: format the payload through the host's
/// pretty-printer into a handler-local string.
fn event_fn_tostring(g: &Global, ks: &mut State) -> KResult<i32> {
    let Some(e) = ks.current_event.clone() else {
        ks.push(Value::Nil);
        return Ok(1);
    };
    match g.backend.format_event(&e.call, e.payload()) {
        Some(s) => {
            let v = g.new_local_string(ks, &s).map_err(|_| mem_error(g, ks))?;
            ks.push(v);
        }
        None => ks.push(Value::Nil),
    }
    Ok(1)
}

fn event_format(g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    let v = g.intern(&e.call.print_fmt).map_err(|_| mem_error(g, ks))?;
    ks.stack[ra] = v;
    Ok(())
}

fn event_sc_nr(_g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = match sc_nr(e) {
        Some(nr) => Value::Number(nr),
        None => Value::Nil,
    };
    Ok(())
}

macro_rules! event_sc_argfn {
    ($fname:ident, $n:expr) => {
        fn $fname(_g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
            ks.stack[ra] = match sc_arg(e, $n) {
                Some(v) => Value::Number(v),
                None => Value::Nil,
            };
            Ok(())
        }
    };
}

event_sc_argfn!(event_sc_arg1, 1);
event_sc_argfn!(event_sc_arg2, 2);
event_sc_argfn!(event_sc_arg3, 3);
event_sc_argfn!(event_sc_arg4, 4);
event_sc_argfn!(event_sc_arg5, 5);
event_sc_argfn!(event_sc_arg6, 6);

fn event_regstr(g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    let s = match e.regs() {
        Some(regs) => regs.dump(),
        None => String::new(),
    };
    let v = g.intern(&s).map_err(|_| mem_error(g, ks))?;
    ks.stack[ra] = v;
    Ok(())
}

fn event_retval(_g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = match e.regs() {
        Some(regs) => Value::Number(regs.return_value()),
        None => Value::Nil,
    };
    Ok(())
}

fn event_set_retval(_g: &Global, ks: &mut State, _e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = Value::NativeFunc(event_fn_set_retval);
    Ok(())
}

/// `e.set_retval(n)` body: write a return value into the register
/// context.
fn event_fn_set_retval(g: &Global, ks: &mut State) -> KResult<i32> {
    let Some(e) = ks.current_event.clone() else {
        return Ok(0);
    };
    let Value::Number(n) = ks.arg(1) else {
        return Err(runtime_error(g, ks, format_args!("wrong type of argument 1")));
    };
    if let Some(regs) = e.regs_mut() {
        regs.set_return_value(n);
    }
    Ok(0)
}

fn event_allfield(g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    let mut s = String::new();
    for f in &e.call.fields {
        s.push_str(&format!(
            "[{}-{}-{}-{}-{}] ",
            f.name, f.ftype, f.offset, f.size, f.is_signed as u8
        ));
    }
    let v = g.new_local_string(ks, &s).map_err(|_| mem_error(g, ks))?;
    ks.stack[ra] = v;
    Ok(())
}

fn event_fieldnum(_g: &Global, ks: &mut State, e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = Value::Number(e.call.fields.len() as i64);
    Ok(())
}

fn event_field(_g: &Global, ks: &mut State, _e: &Event, ra: usize) -> KResult<()> {
    ks.stack[ra] = Value::NativeFunc(event_fn_fieldn);
    Ok(())
}

/// `e.field(n)` body: fetch the n-th field (1-based) by its descriptor.
fn event_fn_fieldn(g: &Global, ks: &mut State) -> KResult<i32> {
    let Some(e) = ks.current_event.clone() else {
        ks.push(Value::Nil);
        return Ok(1);
    };
    let Value::Number(index) = ks.arg(1) else {
        return Err(runtime_error(g, ks, format_args!("wrong type of argument 1")));
    };
    let v = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| e.call.fields.get(i))
        .and_then(|f| e.read_field(f.offset as usize, f.size as usize, f.is_signed))
        .map(Value::Number)
        .unwrap_or(Value::Nil);
    ks.push(v);
    Ok(1)
}

static EVENT_FTBL: &[(&str, Accessor)] = &[
    ("name", event_name),
    ("tostring", event_tostring),
    ("format", event_format),
    ("sc_nr", event_sc_nr),
    ("sc_arg1", event_sc_arg1),
    ("sc_arg2", event_sc_arg2),
    ("sc_arg3", event_sc_arg3),
    ("sc_arg4", event_sc_arg4),
    ("sc_arg5", event_sc_arg5),
    ("sc_arg6", event_sc_arg6),
    ("regstr", event_regstr),
    ("retval", event_retval),
    ("set_retval", event_set_retval),
    ("allfield", event_allfield),
    ("fieldnum", event_fieldnum),
    ("field", event_field),
];

/// Ordinal of a recognized event field, for the optimizer.
pub fn field_index(name: &str) -> Option<usize> {
    static INDEX: OnceLock<HashMap<&'static str, usize, ahash::RandomState>> = OnceLock::new();
    INDEX
        .get_or_init(|| {
            EVENT_FTBL
                .iter()
                .enumerate()
                .map(|(i, (name, _))| (*name, i))
                .collect()
        })
        .get(name)
        .copied()
}

/// Field name for an `EVENT` operand (used by the table-fallback path).
pub fn field_name(index: usize) -> &'static str {
    EVENT_FTBL[index.min(EVENT_FTBL.len() - 1)].0
}

/// `EVENT Ra, Rb, index`: invoke the accessor directly on the state's
/// current event.
pub fn handle(g: &Global, ks: &mut State, index: usize, ra: usize) -> KResult<()> {
    let Some(e) = ks.current_event.clone() else {
        return Err(runtime_error(
            g,
            ks,
            format_args!("no event in this context"),
        ));
    };
    if index >= EVENT_FTBL.len() {
        return Err(runtime_error(g, ks, format_args!("bad event field index")));
    }
    EVENT_FTBL[index].1(g, ks, &e, ra)
}
