// Shared test harness: an in-memory trace backend plus bytecode assembly
// helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::event::{EventCall, FieldDesc, RegContext};
use crate::probe::{
    BackendError, CounterAttr, CounterHandle, ExecContext, OverflowFn, Sample, TraceBackend,
};
use crate::value::image::{Const, ProtoBuilder};
use crate::vm::opcode::*;
use crate::{Session, SessionParm};

pub const TEST_SESSION_PID: i64 = 4242;

pub struct OpenCounter {
    pub id: u64,
    pub cpu: usize,
    pub enabled: Arc<AtomicBool>,
    pub cb: OverflowFn,
}

/// An in-memory host facility: counters are recorded, firing is driven by
/// the test.
#[derive(Default)]
pub struct TestBackend {
    pub counters: Mutex<Vec<OpenCounter>>,
    pub calls: Mutex<HashMap<u64, Arc<EventCall>>>,
    pub symbols: Mutex<HashMap<u64, String>>,
    pub stack: Mutex<Vec<u64>>,
    pub alive_pids: Mutex<Vec<i64>>,
}

struct TestCounter {
    enabled: Arc<AtomicBool>,
}

impl CounterHandle for TestCounter {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

impl TestBackend {
    pub fn register_call(&self, call: EventCall) {
        self.calls.lock().insert(call.id, Arc::new(call));
    }

    fn call_for(&self, id: u64) -> Arc<EventCall> {
        self.calls.lock().entry(id).or_insert_with(|| {
            Arc::new(EventCall {
                id,
                name: SmolStr::new(format!("event-{}", id)),
                print_fmt: String::new(),
                fields: Vec::new(),
            })
        }).clone()
    }

    /// Fire every enabled counter bound to (id, cpu).
    pub fn fire(
        &self,
        id: u64,
        cpu: usize,
        context: ExecContext,
        payload: &[u8],
        pid: i64,
        comm: &str,
    ) {
        self.fire_with_regs(id, cpu, context, payload, pid, comm, std::ptr::null_mut());
    }

    pub fn fire_with_regs(
        &self,
        id: u64,
        cpu: usize,
        context: ExecContext,
        payload: &[u8],
        pid: i64,
        comm: &str,
        regs: *mut RegContext,
    ) {
        let call = self.call_for(id);
        let cbs: Vec<OverflowFn> = self
            .counters
            .lock()
            .iter()
            .filter(|c| c.id == id && c.cpu == cpu && c.enabled.load(Ordering::SeqCst))
            .map(|c| c.cb.clone())
            .collect();
        for cb in cbs {
            let sample = Sample {
                call: call.clone(),
                raw: payload.as_ptr(),
                raw_len: payload.len(),
                regs,
                cpu,
                context,
                pid,
                comm: SmolStr::new(comm),
            };
            cb(&sample);
        }
    }

    pub fn enabled_counters(&self) -> usize {
        self.counters
            .lock()
            .iter()
            .filter(|c| c.enabled.load(Ordering::SeqCst))
            .count()
    }
}

impl TraceBackend for TestBackend {
    fn open_counter(
        &self,
        attr: &CounterAttr,
        cpu: usize,
        cb: OverflowFn,
    ) -> Result<Box<dyn CounterHandle>, BackendError> {
        let enabled = Arc::new(AtomicBool::new(false));
        self.counters.lock().push(OpenCounter {
            id: attr.config,
            cpu,
            enabled: enabled.clone(),
            cb,
        });
        Ok(Box::new(TestCounter { enabled }))
    }

    fn lookup_symbol(&self, addr: u64) -> Option<String> {
        self.symbols.lock().get(&addr).cloned()
    }

    fn format_event(&self, call: &EventCall, raw: &[u8]) -> Option<String> {
        Some(format!("{}: {} bytes", call.name, raw.len()))
    }

    fn collect_backtrace(&self, max: usize, out: &mut Vec<u64>) {
        let frames = self.stack.lock();
        out.extend(frames.iter().take(max));
    }

    fn current_pid(&self) -> i64 {
        TEST_SESSION_PID
    }

    fn current_comm(&self) -> SmolStr {
        SmolStr::new("tracevm-test")
    }

    fn task_alive(&self, pid: i64) -> bool {
        self.alive_pids.lock().contains(&pid)
    }
}

pub fn test_session() -> (Session, Arc<TestBackend>) {
    test_session_with_parm(SessionParm::default())
}

pub fn test_session_with_parm(parm: SessionParm) -> (Session, Arc<TestBackend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(TestBackend::default());
    if parm.trace_pid != -1 {
        backend.alive_pids.lock().push(parm.trace_pid);
    }
    let session = Session::new(parm, backend.clone()).expect("session");
    (session, backend)
}

/// Raw syscall-entry payload: common header, syscall number, six args.
pub fn sc_payload(nr: i32, args: [u64; 6]) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    out.extend_from_slice(&nr.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    for a in args {
        out.extend_from_slice(&a.to_le_bytes());
    }
    out
}

pub fn syscall_call(id: u64, name: &str) -> EventCall {
    EventCall {
        id,
        name: SmolStr::new(name),
        print_fmt: format!("\"{}\"", name),
        fields: vec![
            FieldDesc {
                name: SmolStr::new("common_pid"),
                ftype: SmolStr::new("int"),
                offset: 4,
                size: 4,
                is_signed: true,
            },
            FieldDesc {
                name: SmolStr::new("nr"),
                ftype: SmolStr::new("int"),
                offset: 8,
                size: 4,
                is_signed: true,
            },
        ],
    }
}

// ---- bytecode assembly ----------------------------------------------

/// Constant-pool operand.
pub fn k(i: usize) -> usize {
    rk_as_k(i)
}

pub struct Pb {
    pub p: ProtoBuilder,
}

impl Pb {
    pub fn new(maxstack: u8) -> Pb {
        Pb {
            p: ProtoBuilder {
                maxstacksize: maxstack,
                ..Default::default()
            },
        }
    }

    pub fn params(mut self, n: u8) -> Pb {
        self.p.numparams = n;
        self
    }

    pub fn upval(mut self, name: &str, instack: bool, idx: u8) -> Pb {
        self.p.upvalues.push((name.to_string(), instack, idx));
        self
    }

    /// Main-chunk shape: one upvalue binding the globals.
    pub fn env(self) -> Pb {
        self.upval("_ENV", false, 0)
    }

    pub fn konst(mut self, c: Const) -> Pb {
        self.p.k.push(c);
        self
    }

    pub fn num(self, n: i64) -> Pb {
        self.konst(Const::Num(n))
    }

    pub fn str(self, s: &str) -> Pb {
        self.konst(Const::Str(s.to_string()))
    }

    pub fn code(mut self, code: Vec<u32>) -> Pb {
        self.p.code = code;
        self
    }

    pub fn child(mut self, child: Pb) -> Pb {
        self.p.protos.push(child.p);
        self
    }

    pub fn build(self) -> ProtoBuilder {
        self.p
    }
}

/// Run a one-chunk image through a fresh session and return the drained
/// transport output.
pub fn run_script(main: ProtoBuilder) -> String {
    let image = crate::write_image(&main);
    let (session, _backend) = test_session();
    let out = session.run(&image).expect("session run");
    String::from_utf8_lossy(&out).into_owned()
}

/// Read a global out of a live session.
pub fn global_get(g: &crate::Global, name: &str) -> crate::Value {
    let key = g.intern(name).expect("intern");
    let sp = g.strings.lock();
    let tb = g.table(g.globals);
    let v = tb.lock().get(&sp, &key);
    v
}
