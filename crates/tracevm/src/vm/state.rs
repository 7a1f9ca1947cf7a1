// Execution states and the session-global structure.
//
// The main state is the session singleton: it owns the string pool, the
// object arena, the registry and globals, the C-function cache, the
// probe/timer lists and the per-CPU scratch pools. Child states live in
// per-(CPU x context) slots, are borrowed by the dispatcher for one
// handler invocation, and are reset but not freed between firings.
//
// There are no process-wide globals: every interpreter operation takes the
// session explicitly.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::event::Event;
use crate::gc::{AllocError, ObjectPool, ProtoId, StrId, StringPool, TStr, TableId, UpvalId};
use crate::limits::{
    BASIC_STACK_SIZE, CFUNCTION_CACHE_SIZE, MAX_STACK, MIN_STACK, PERCPU_BUFFER_SIZE,
};
use crate::probe::{ExecContext, ProbeEvent, TraceBackend};
use crate::session::SessionParm;
use crate::timer::TimerHandle;
use crate::transport::Transport;
use crate::value::image::ImageProto;
use crate::value::{Proto, Table, Value};
use crate::vm::call_info::{CallInfo, EXIT_PC};
use crate::vm::{KResult, VmError};

/// Registry slot of the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Per-(CPU, context) scratch: the reentrancy slot, the reusable child
/// execution state, the general scratch buffer and the backtrace scratch.
pub struct CtxSlot {
    pub recursion: AtomicBool,
    pub state: spin::Mutex<State>,
    pub buffer: spin::Mutex<Box<[u8]>>,
    pub btrace: spin::Mutex<Vec<u64>>,
}

pub struct PerCpu {
    pub slots: [CtxSlot; ExecContext::COUNT],
    /// Set while a timer closure runs on this CPU; tracepoint samples
    /// racing with it are dropped.
    pub in_timer: AtomicBool,
}

impl PerCpu {
    fn new(cpu: usize) -> PerCpu {
        PerCpu {
            slots: std::array::from_fn(|ctx| CtxSlot {
                recursion: AtomicBool::new(false),
                state: spin::Mutex::new(State::new_child(cpu, ExecContext::from_bit(ctx))),
                buffer: spin::Mutex::new(vec![0u8; PERCPU_BUFFER_SIZE].into_boxed_slice()),
                btrace: spin::Mutex::new(Vec::new()),
            }),
            in_timer: AtomicBool::new(false),
        }
    }
}

pub struct Global {
    pub(crate) weak_self: Weak<Global>,
    pub parm: SessionParm,
    pub backend: Arc<dyn TraceBackend>,
    pub transport: Transport,

    pub strings: Mutex<StringPool>,
    pub objects: ObjectPool,
    pub registry: TableId,
    pub globals: TableId,
    cfunc_cache: Mutex<Vec<Value>>,

    /// CPUs the session traces (narrowed by the `trace_cpu` parameter).
    pub cpumask: Vec<usize>,
    /// All CPUs the session allocates per-CPU state for.
    pub ncpus: usize,
    pub pcpu: Vec<PerCpu>,

    pub probe_events: Mutex<Vec<ProbeEvent>>,
    pub timers: Mutex<Vec<TimerHandle>>,
    pub trace_end_closure: Mutex<Option<Value>>,
    pub trace_enabled: AtomicBool,
    pub next_timer_cpu: AtomicUsize,

    /// Session is tearing down.
    pub exit: AtomicBool,
    /// Main state should leave its wait loop.
    pub stop: AtomicBool,

    /// Scratch for main-state concat/printf (children use their slot's).
    pub main_buffer: Mutex<Box<[u8]>>,
}

impl Global {
    /// Build the session-global structure. The caller wraps it with
    /// `Arc::new_cyclic` so callbacks can hold a weak reference back.
    pub(crate) fn new(
        weak_self: Weak<Global>,
        parm: SessionParm,
        backend: Arc<dyn TraceBackend>,
        transport: Transport,
        ncpus: usize,
        cpumask: Vec<usize>,
        seed: u32,
    ) -> Result<Global, AllocError> {
        let strings = StringPool::new(seed);
        let objects = ObjectPool::new();
        let registry = objects.new_table()?;
        let globals = objects.new_table()?;
        let pcpu = (0..ncpus).map(PerCpu::new).collect();
        Ok(Global {
            weak_self,
            parm,
            backend,
            transport,
            strings: Mutex::new(strings),
            objects,
            registry,
            globals,
            cfunc_cache: Mutex::new(Vec::with_capacity(CFUNCTION_CACHE_SIZE)),
            cpumask,
            ncpus,
            pcpu,
            probe_events: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            trace_end_closure: Mutex::new(None),
            trace_enabled: AtomicBool::new(false),
            next_timer_cpu: AtomicUsize::new(0),
            exit: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            main_buffer: Mutex::new(vec![0u8; PERCPU_BUFFER_SIZE].into_boxed_slice()),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Global> {
        self.weak_self.upgrade().expect("session gone")
    }

    // ---- strings ----------------------------------------------------

    /// Intern or allocate a session-lived string.
    pub fn intern(&self, s: &str) -> Result<Value, AllocError> {
        Ok(Value::Str(self.strings.lock().new_str(s)?))
    }

    /// Allocate a long string whose lifetime ends with the running
    /// handler (attached to the state's localgc list).
    pub fn new_local_string(&self, ks: &mut State, s: &str) -> Result<Value, AllocError> {
        let id = self.strings.lock().new_long(s)?;
        if !ks.is_main {
            ks.localgc.push(id);
        }
        Ok(Value::Str(id))
    }

    pub fn get_string(&self, id: StrId) -> Arc<TStr> {
        self.strings.lock().get(id)
    }

    // ---- objects ----------------------------------------------------

    pub fn table(&self, id: TableId) -> Arc<Table> {
        self.objects.table(id)
    }

    pub fn new_table_value(&self) -> Result<Value, AllocError> {
        Ok(Value::Table(self.objects.new_table()?))
    }

    // ---- the C-function cache ---------------------------------------

    /// Append a registered builtin; the cache index feeds LOAD_GLOBAL.
    pub fn cfunction_add(&self, v: Value) -> Result<usize, AllocError> {
        let mut cache = self.cfunc_cache.lock();
        if cache.len() >= CFUNCTION_CACHE_SIZE {
            return Err(AllocError);
        }
        cache.push(v);
        Ok(cache.len() - 1)
    }

    pub fn cfunction_get(&self, index: usize) -> Value {
        self.cfunc_cache.lock()[index]
    }

    /// Slot of a cached function equal to `v`, if any.
    pub fn cfunction_index(&self, v: &Value) -> Option<usize> {
        let sp = self.strings.lock();
        let cache = self.cfunc_cache.lock();
        cache.iter().position(|c| c.raw_equal(v, &sp))
    }

    pub fn cfunction_count(&self) -> usize {
        self.cfunc_cache.lock().len()
    }

    // ---- proto installation -----------------------------------------

    /// Move a loaded (and optimized) proto tree into the arena.
    pub fn install_proto(&self, ip: ImageProto) -> Result<ProtoId, AllocError> {
        let mut children = Vec::with_capacity(ip.protos.len());
        for child in ip.protos {
            children.push(self.install_proto(child)?);
        }
        self.objects.new_proto(Proto {
            code: ip.code,
            k: ip.k,
            p: children,
            numparams: ip.numparams,
            is_vararg: ip.is_vararg,
            maxstacksize: ip.maxstacksize,
            upvalues: ip.upvalues,
            lineinfo: ip.lineinfo,
            locvars: ip.locvars,
            source: ip.source,
        })
    }

    pub fn comm(&self, ks: &State) -> SmolStr {
        match &ks.current_event {
            Some(e) => e.comm.clone(),
            None => self.backend.current_comm(),
        }
    }

    pub fn pid(&self, ks: &State) -> i64 {
        match &ks.current_event {
            Some(e) => e.pid,
            None => self.backend.current_pid(),
        }
    }
}

/// An execution state: a register stack plus its frame list. One main
/// state per session, one child per (CPU, context) slot.
pub struct State {
    pub stack: Vec<Value>,
    pub top: usize,
    pub frames: Vec<CallInfo>,
    /// Open upvalue cells into this stack, ordered by descending slot.
    pub openupval: Vec<(usize, UpvalId)>,
    /// Long strings to release when the current handler exits.
    pub localgc: Vec<StrId>,
    pub current_event: Option<Event>,
    pub cpu: usize,
    pub context: ExecContext,
    pub is_main: bool,
}

impl State {
    pub fn new_main() -> State {
        let mut ks = State {
            stack: Vec::new(),
            top: 0,
            frames: Vec::new(),
            openupval: Vec::new(),
            localgc: Vec::new(),
            current_event: None,
            cpu: 0,
            context: ExecContext::Process,
            is_main: true,
        };
        ks.init_stack();
        ks
    }

    pub fn new_child(cpu: usize, context: ExecContext) -> State {
        let mut ks = State {
            stack: Vec::new(),
            top: 0,
            frames: Vec::new(),
            openupval: Vec::new(),
            localgc: Vec::new(),
            current_event: None,
            cpu,
            context,
            is_main: false,
        };
        ks.init_stack();
        ks
    }

    fn init_stack(&mut self) {
        self.stack.clear();
        self.stack.resize(BASIC_STACK_SIZE, Value::Nil);
        self.top = 0;
        // the base frame owns a nil function slot
        self.stack[0] = Value::Nil;
        self.top = 1;
        self.frames.clear();
        self.frames.push(CallInfo::base_frame(self.top + MIN_STACK));
    }

    /// Reset a child for reuse by the next firing. Allocations shrink
    /// back to the basic stack but the Vec capacity is kept.
    pub fn reset(&mut self) {
        debug_assert!(!self.is_main);
        debug_assert!(self.localgc.is_empty());
        self.openupval.clear();
        self.current_event = None;
        self.init_stack();
    }

    #[inline]
    pub fn ci(&self) -> &CallInfo {
        self.frames.last().expect("frame list empty")
    }

    #[inline]
    pub fn ci_mut(&mut self) -> &mut CallInfo {
        self.frames.last_mut().expect("frame list empty")
    }

    #[inline]
    pub fn push(&mut self, v: Value) {
        debug_assert!(self.top < self.stack.len());
        self.stack[self.top] = v;
        self.top += 1;
    }

    // ---- native argument access -------------------------------------

    /// n-th argument of the running native (1-based).
    #[inline]
    pub fn arg(&self, n: usize) -> Value {
        self.stack[self.ci().func + n]
    }

    #[inline]
    pub fn arg_nr(&self) -> usize {
        self.top - self.ci().func - 1
    }
}

// ---- error reporting ------------------------------------------------

/// Report a runtime error: write the diagnostic through the transport and
/// patch the two innermost saved program counters to EXIT. The returned
/// value is what the raise site propagates.
pub fn runtime_error(g: &Global, ks: &mut State, args: std::fmt::Arguments<'_>) -> VmError {
    let msg = format!("error: {}\n", args);
    g.transport.write(ks.cpu, msg.as_bytes());
    set_next_as_exit(ks);
    VmError::Runtime
}

/// Report allocation-ceiling exhaustion.
pub fn mem_error(g: &Global, ks: &mut State) -> VmError {
    let _ = runtime_error(g, ks, format_args!("out of memory"));
    VmError::Memory
}

/// Force the interpreter out: patch the saved pc of the current frame and
/// of its caller (the caller matters when the current frame is a native
/// invoked from the interpreter).
pub fn set_next_as_exit(ks: &mut State) {
    let depth = ks.frames.len();
    if depth == 0 {
        return;
    }
    ks.frames[depth - 1].pc = EXIT_PC;
    if depth >= 2 {
        ks.frames[depth - 2].pc = EXIT_PC;
    }
}

/// Grow the stack so at least `n` slots sit above `top`. Oversteps the
/// hard cap with a runtime error.
pub fn checkstack(g: &Global, ks: &mut State, n: usize) -> KResult<()> {
    if ks.stack.len() - ks.top > n {
        return Ok(());
    }
    let needed = ks.top + n;
    if needed > MAX_STACK {
        return Err(runtime_error(g, ks, format_args!("stack overflow")));
    }
    let newsize = (ks.stack.len() * 2).clamp(needed, MAX_STACK);
    ks.stack.resize(newsize, Value::Nil);
    Ok(())
}

/// Find or create an open upvalue for a stack slot. The open list is
/// ordered by descending slot, so the scan stops at the first entry at or
/// below `level`.
pub fn find_upval(g: &Global, ks: &mut State, level: usize) -> KResult<UpvalId> {
    let mut insert_at = ks.openupval.len();
    for (i, &(slot, id)) in ks.openupval.iter().enumerate() {
        if slot == level {
            return Ok(id);
        }
        if slot < level {
            insert_at = i;
            break;
        }
    }
    let id = g
        .objects
        .new_upval(crate::value::UpvalCell::open(level))
        .map_err(|_| mem_error(g, ks))?;
    ks.openupval.insert(insert_at, (level, id));
    Ok(id)
}

/// Close every open upvalue at or above `level`.
pub fn close_upvals(g: &Global, ks: &mut State, level: usize) {
    while let Some(&(slot, id)) = ks.openupval.first() {
        if slot < level {
            break;
        }
        g.objects.upval(id).close(&ks.stack);
        ks.openupval.remove(0);
    }
}

/// Close the open upvalues of one closure (used when a closure is handed
/// to probe, timer, or trace-end registration so a handler never chases
/// another state's stack).
pub fn close_closure_upvals(g: &Global, ks: &mut State, cl: Value) {
    let Some(cid) = cl.as_closure_id() else {
        return;
    };
    let closure = g.objects.closure(cid);
    for &uid in &closure.upvals {
        let cell = g.objects.upval(uid);
        cell.close(&ks.stack);
        ks.openupval.retain(|&(_, id)| id != uid);
    }
}

/// Free handler-local allocations; called when a child state leaves its
/// handler (and for the main state at teardown).
pub fn exit_thread(g: &Global, ks: &mut State) {
    if !ks.localgc.is_empty() {
        let mut sp = g.strings.lock();
        for id in ks.localgc.drain(..) {
            sp.release(id);
        }
    }
}

/// Run `f` over the state's scratch buffer: the per-context buffer for a
/// child (exclusive while its reentrancy slot is held), the session's own
/// buffer for the main state.
pub fn with_scratch<R>(g: &Global, ks: &State, f: impl FnOnce(&mut [u8]) -> R) -> R {
    if ks.is_main {
        let mut buf = g.main_buffer.lock();
        f(&mut buf)
    } else {
        let mut buf = g.pcpu[ks.cpu].slots[ks.context.bit()].buffer.lock();
        f(&mut buf)
    }
}

/// Held scratch buffer (guard form of [`with_scratch`], for callers that
/// need the state mutably while composing into the buffer).
pub enum ScratchGuard<'g> {
    Main(parking_lot::MutexGuard<'g, Box<[u8]>>),
    Slot(spin::MutexGuard<'g, Box<[u8]>>),
}

impl std::ops::Deref for ScratchGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ScratchGuard::Main(g) => g,
            ScratchGuard::Slot(g) => g,
        }
    }
}

impl std::ops::DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ScratchGuard::Main(g) => g,
            ScratchGuard::Slot(g) => g,
        }
    }
}

pub fn scratch_buf<'g>(g: &'g Global, ks: &State) -> ScratchGuard<'g> {
    if ks.is_main {
        ScratchGuard::Main(g.main_buffer.lock())
    } else {
        ScratchGuard::Slot(g.pcpu[ks.cpu].slots[ks.context.bit()].buffer.lock())
    }
}

/// Fetch the globals table out of the registry (the cached id and the
/// registry entry always agree).
pub fn globals_table(g: &Global) -> TableId {
    let reg = g.table(g.registry);
    let v = reg.lock().get_int(RIDX_GLOBALS);
    v.as_table_id().unwrap_or(g.globals)
}
