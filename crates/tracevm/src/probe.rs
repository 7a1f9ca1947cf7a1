// Probe dispatch: the host-facility capability traits, the per-context
// reentrancy guard, and the path from a fired sample to a handler
// invocation on a borrowed child state.
//
// Four execution contexts are distinguished; each CPU holds one
// reentrancy slot per context. A probe firing into a busy slot is
// silently dropped: blocking could deadlock inside NMI context, and a
// lost event is the documented trade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smol_str::SmolStr;
use thiserror::Error;

use crate::event::{Event, EventCall, RegContext};
use crate::value::Value;
use crate::vm;
use crate::vm::{exit_thread, Global};

/// Execution context a probe fired in, most to least constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ExecContext {
    Nmi = 0,
    HardIrq = 1,
    SoftIrq = 2,
    Process = 3,
}

impl ExecContext {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn bit(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_bit(bit: usize) -> ExecContext {
        match bit {
            0 => ExecContext::Nmi,
            1 => ExecContext::HardIrq,
            2 => ExecContext::SoftIrq,
            _ => ExecContext::Process,
        }
    }

    #[inline]
    pub fn in_interrupt(self) -> bool {
        !matches!(self, ExecContext::Process)
    }
}

// Sample-type bits requested from the host counter.
pub const SAMPLE_RAW: u32 = 1 << 0;
pub const SAMPLE_TIME: u32 = 1 << 1;
pub const SAMPLE_CPU: u32 = 1 << 2;
pub const SAMPLE_PERIOD: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Tracepoint,
}

/// What the dispatcher asks the host facility to open.
#[derive(Debug, Clone)]
pub struct CounterAttr {
    pub kind: CounterKind,
    /// Tracepoint id.
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u32,
}

/// A fired sample, handed to the overflow callback by the host facility.
/// The raw pointers are valid for the duration of the callback only.
pub struct Sample {
    pub call: Arc<EventCall>,
    pub raw: *const u8,
    pub raw_len: usize,
    /// Null when the host has no register context for this event.
    pub regs: *mut RegContext,
    pub cpu: usize,
    pub context: ExecContext,
    /// Task the event fired in.
    pub pid: i64,
    pub comm: SmolStr,
}

pub type OverflowFn = Arc<dyn Fn(&Sample) + Send + Sync>;

#[derive(Debug, Error)]
#[error("trace backend: {0}")]
pub struct BackendError(pub String);

/// The host tracing facility, consumed as a capability.
pub trait TraceBackend: Send + Sync {
    /// Open (enabled-on-`enable`) one per-CPU counter delivering overflow
    /// callbacks.
    fn open_counter(
        &self,
        attr: &CounterAttr,
        cpu: usize,
        cb: OverflowFn,
    ) -> Result<Box<dyn CounterHandle>, BackendError>;

    /// Wait until no callback of an unregistered counter can still be
    /// running.
    fn synchronize(&self) {}

    /// Resolve a kernel text address (histogram symbolization).
    fn lookup_symbol(&self, _addr: u64) -> Option<String> {
        None
    }

    /// Pretty-print an event payload (`e.tostring()`).
    fn format_event(&self, _call: &EventCall, _raw: &[u8]) -> Option<String> {
        None
    }

    /// Copy a NUL-terminated string from traced-task memory.
    fn read_user_string(&self, _addr: u64, _max: usize) -> Option<String> {
        None
    }

    /// Collect up to `max` return addresses of the current stack.
    fn collect_backtrace(&self, _max: usize, _out: &mut Vec<u64>) {}

    fn current_pid(&self) -> i64 {
        std::process::id() as i64
    }

    fn current_comm(&self) -> SmolStr {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| SmolStr::new(n.to_string_lossy())))
            .unwrap_or_else(|| SmolStr::new("unknown"))
    }

    fn kernel_release(&self) -> SmolStr {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|s| SmolStr::new(s.trim()))
            .unwrap_or_else(|_| SmolStr::new("unknown"))
    }

    /// Liveness of the traced task (the end-of-session wait loop polls
    /// this).
    fn task_alive(&self, pid: i64) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    /// Tell a workload task the launcher parked for us to start running
    /// (called once when the session enters its wait loop).
    fn resume_task(&self, _pid: i64) {}
}

pub trait CounterHandle: Send {
    fn enable(&self);
    fn disable(&self);
}

/// A registered per-CPU probe binding.
pub struct ProbeEvent {
    pub id: u64,
    pub cpu: usize,
    pub cl: Value,
    pub counter: Box<dyn CounterHandle>,
}

/// Holds one (CPU, context) reentrancy slot. Acquire fails when the same
/// context on the same CPU is already inside a handler.
pub(crate) struct RecursionGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RecursionGuard<'a> {
    pub(crate) fn acquire(g: &'a Global, cpu: usize, ctx: ExecContext) -> Option<Self> {
        let flag = &g.pcpu[cpu].slots[ctx.bit()].recursion;
        // acquire pairs with the release in drop; the mark must be
        // visible before any per-context state is touched
        if flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RecursionGuard { flag })
        } else {
            None
        }
    }
}

impl Drop for RecursionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Invoke a handler closure on the per-context child state of `cpu`.
/// Used by both the probe path (with an event) and timers (without).
pub(crate) fn call_probe_closure(
    g: &Arc<Global>,
    cl: Value,
    event: Option<Event>,
    cpu: usize,
    ctx: ExecContext,
) {
    let Some(_slot) = RecursionGuard::acquire(g, cpu, ctx) else {
        return;
    };
    let mut ks = g.pcpu[cpu].slots[ctx.bit()].state.lock();
    ks.reset();

    let func = ks.top;
    ks.push(cl);
    if event.is_some() {
        if let Value::Closure(cid) = cl {
            let proto = g.objects.proto(g.objects.closure(cid).proto);
            if proto.numparams > 0 {
                ks.push(Value::Event);
            }
        }
    }
    ks.current_event = event;

    vm::run(g, &mut ks, func, 0);

    ks.current_event = None;
    exit_thread(g, &mut ks);
}

/// Overflow callback body: filter, guard, and hand the sample to the
/// handler closure.
pub(crate) fn dispatch_sample(g: &Arc<Global>, cl: Value, s: &Sample) {
    if s.cpu >= g.ncpus {
        return;
    }
    // a timer closure owns this CPU's child states right now
    if g.pcpu[s.cpu].in_timer.load(Ordering::Acquire) {
        return;
    }
    // tracing our own session would recurse through the transport
    if s.pid == g.transport.pid() {
        return;
    }
    if g.parm.trace_pid != -1 && s.pid != g.parm.trace_pid {
        return;
    }
    let event = Event::new(
        s.call.clone(),
        s.raw,
        s.raw_len,
        s.regs,
        s.pid,
        s.comm.clone(),
    );
    call_probe_closure(g, cl, Some(event), s.cpu, s.context);
}

/// Open one per-CPU tracepoint counter set for `id`, dispatching into
/// `cl`. Failures are reported per CPU; already-opened counters stay.
pub fn start_probe_by_id(g: &Arc<Global>, id: u64, cl: Value) -> Result<(), BackendError> {
    log::debug!("enable tracepoint event id: {}", id);
    let attr = CounterAttr {
        kind: CounterKind::Tracepoint,
        config: id,
        sample_period: 1,
        sample_type: SAMPLE_RAW | SAMPLE_TIME | SAMPLE_CPU | SAMPLE_PERIOD,
    };
    for &cpu in &g.cpumask {
        let weak = g.weak_self.clone();
        let cb: OverflowFn = Arc::new(move |s: &Sample| {
            if let Some(g) = weak.upgrade() {
                dispatch_sample(&g, cl, s);
            }
        });
        let counter = g.backend.open_counter(&attr, cpu, cb)?;
        counter.enable();
        g.probe_events.lock().push(ProbeEvent {
            id,
            cpu,
            cl,
            counter,
        });
    }
    Ok(())
}

/// Disable and release every registered probe, then synchronize so no
/// callback is still in flight.
pub fn end_probes(g: &Global) {
    let events = std::mem::take(&mut *g.probe_events.lock());
    for pe in &events {
        log::debug!("disable tracepoint event id: {} on cpu {}", pe.id, pe.cpu);
        pe.counter.disable();
    }
    g.backend.synchronize();
    drop(events);
}

/// Run the recorded trace-end closure on the given state, once.
pub fn run_trace_end(g: &Global, ks: &mut crate::vm::State) {
    if let Some(cl) = g.trace_end_closure.lock().take() {
        let func = ks.top;
        ks.push(cl);
        vm::run(g, ks, func, 0);
    }
}
