// Session lifecycle.
//
// `Session::new` builds the main state and every session-wide resource
// (transport, registry, C-function cache, string pool, per-CPU scratch,
// library surface). `load` verifies and installs the bytecode image and
// runs the peephole pass; `start` runs the script, which registers
// handlers; `wait` polls until the operator or the traced task finishes;
// `finish` tears everything down in the fixed order: probes first (a
// handler may still hold object references), then timers, then the
// trace-end closure, then the pools go down with the session.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;

use crate::gc::AllocError;
use crate::limits::WAIT_POLL_MS;
use crate::probe::{end_probes, run_trace_end, TraceBackend};
use crate::timer::exit_timers;
use crate::transport::Transport;
use crate::value::image::{load_image, LoadError};
use crate::value::{Closure, UpvalCell, Value};
use crate::vm::{self, optimize_code, Global, State, RIDX_GLOBALS};

/// Launch parameters handed over by the external launcher.
#[derive(Debug, Clone)]
pub struct SessionParm {
    /// Trace only this task (-1: no filter).
    pub trace_pid: i64,
    /// Trace only this CPU (-1: all).
    pub trace_cpu: i64,
    pub verbose: bool,
    pub print_timestamp: bool,
    /// The traced task is a workload the launcher started for us.
    pub workload: bool,
    pub argv: Vec<String>,
}

impl Default for SessionParm {
    fn default() -> Self {
        SessionParm {
            trace_pid: -1,
            trace_cpu: -1,
            verbose: false,
            print_timestamp: false,
            workload: false,
            argv: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot find pid {0}")]
    TaskNotFound(i64),
    #[error("cpu {0} is not online")]
    CpuOffline(i64),
    #[error(transparent)]
    Image(#[from] LoadError),
    #[error("resource allocation failed")]
    Alloc,
}

impl From<AllocError> for SessionError {
    fn from(_: AllocError) -> Self {
        SessionError::Alloc
    }
}

/// Lets the embedder (a signal handler, typically) stop the wait loop.
#[derive(Clone)]
pub struct StopHandle(Weak<Global>);

impl StopHandle {
    pub fn stop(&self) {
        if let Some(g) = self.0.upgrade() {
            g.stop.store(true, Ordering::Relaxed);
        }
    }
}

pub struct Session {
    g: Arc<Global>,
    main: State,
    main_closure: Option<Value>,
}

impl Session {
    pub fn new(parm: SessionParm, backend: Arc<dyn TraceBackend>) -> Result<Session, SessionError> {
        let ncpus = num_cpus::get();
        let cpumask: Vec<usize> = if parm.trace_cpu == -1 {
            (0..ncpus).collect()
        } else {
            let cpu = parm.trace_cpu;
            if cpu < 0 || cpu as usize >= ncpus {
                return Err(SessionError::CpuOffline(cpu));
            }
            vec![cpu as usize]
        };
        if parm.trace_pid != -1 && !backend.task_alive(parm.trace_pid) {
            return Err(SessionError::TaskNotFound(parm.trace_pid));
        }

        let transport = Transport::new(ncpus, backend.current_pid());
        let seed: u32 = rand::random();
        let g = Arc::new_cyclic(|weak| {
            // two tables out of a fresh arena cannot hit the ceiling
            Global::new(
                weak.clone(),
                parm,
                backend,
                transport,
                ncpus,
                cpumask,
                seed,
            )
            .expect("fresh arena")
        });

        let main = State::new_main();
        init_registry(&g)?;
        init_arguments(&g)?;
        crate::stdlib::open_all(&g)?;
        g.trace_enabled.store(true, Ordering::Relaxed);
        log::debug!(
            "session ready: {} cpus, tracing {:?}, {} builtins",
            g.ncpus,
            g.cpumask,
            g.cfunction_count()
        );

        Ok(Session {
            g,
            main,
            main_closure: None,
        })
    }

    pub fn global(&self) -> &Arc<Global> {
        &self.g
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::downgrade(&self.g))
    }

    /// Verify the image, run the optimization pass, and build the main
    /// closure (its first upvalue binds the globals table).
    pub fn load(&mut self, image: &[u8]) -> Result<(), SessionError> {
        let mut ip = {
            let mut sp = self.g.strings.lock();
            load_image(&mut sp, image)?
        };
        optimize_code(&self.g, &mut ip);

        let nup = ip.upvalues.len();
        let pid = self.g.install_proto(ip)?;
        let mut upvals = Vec::with_capacity(nup);
        for i in 0..nup {
            let v = if i == 0 {
                Value::Table(self.g.globals)
            } else {
                Value::Nil
            };
            upvals.push(self.g.objects.new_upval(UpvalCell::closed(v))?);
        }
        let cid = self.g.objects.new_closure(Closure {
            proto: pid,
            upvals,
        })?;
        self.main_closure = Some(Value::Closure(cid));
        Ok(())
    }

    /// Run the script's main chunk on the main state: this is where the
    /// script registers its probes and timers.
    pub fn start(&mut self) {
        let Some(cl) = self.main_closure else {
            return;
        };
        let func = self.main.top;
        self.main.push(cl);
        vm::run(&self.g, &mut self.main, func, 0);
    }

    /// Wait for the operator (stop handle) or the traced task to finish,
    /// polling every 100 ms.
    pub fn wait(&mut self) {
        if self.g.exit.load(Ordering::Relaxed) {
            return;
        }
        self.g
            .transport
            .write(self.main.cpu, b"Press Control-C to stop.\n");
        self.g.stop.store(false, Ordering::Relaxed);
        if self.g.parm.workload && self.g.parm.trace_pid != -1 {
            // the launcher parked the workload until tracing is live
            self.g.backend.resume_task(self.g.parm.trace_pid);
        }
        loop {
            std::thread::sleep(Duration::from_millis(WAIT_POLL_MS));
            if self.g.stop.load(Ordering::Relaxed) || self.g.exit.load(Ordering::Relaxed) {
                break;
            }
            let pid = self.g.parm.trace_pid;
            if pid != -1 && !self.g.backend.task_alive(pid) {
                break;
            }
        }
        self.g.transport.write(self.main.cpu, b"\n");
    }

    /// Ordered teardown; returns everything the transport still holds.
    pub fn finish(mut self) -> Vec<u8> {
        self.g.exit.store(true, Ordering::Relaxed);
        if self.g.trace_enabled.swap(false, Ordering::Relaxed) {
            end_probes(&self.g);
            exit_timers(&self.g);
            run_trace_end(&self.g, &mut self.main);
        } else {
            exit_timers(&self.g);
        }
        vm::exit_thread(&self.g, &mut self.main);
        // string pool, arena, per-CPU pools and the transport go down
        // with the session
        self.g.transport.drain_all()
    }

    /// Load, run, wait if any handler is registered, tear down.
    pub fn run(mut self, image: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.load(image)?;
        self.start();
        let has_handlers = !self.g.probe_events.lock().is_empty()
            || !self.g.timers.lock().is_empty();
        if has_handlers {
            self.wait();
        }
        Ok(self.finish())
    }

    /// Main-state access for embedders that drive calls directly.
    pub fn main_state(&mut self) -> &mut State {
        &mut self.main
    }

    pub fn main_closure(&self) -> Option<Value> {
        self.main_closure
    }
}

/// Registry setup: the globals table sits at a fixed registry slot.
fn init_registry(g: &Global) -> Result<(), AllocError> {
    let sp = g.strings.lock();
    let reg = g.table(g.registry);
    let mut data = reg.lock();
    data.resize(&sp, 2, 0).map_err(|_| AllocError)?;
    data.set_int(&sp, RIDX_GLOBALS, Value::Table(g.globals))
        .map_err(|_| AllocError)?;
    Ok(())
}

/// Expose launch arguments as the global `arg` table, numbers parsed.
fn init_arguments(g: &Global) -> Result<(), AllocError> {
    let arg_tbl = g.objects.new_table()?;
    let key = g.intern("arg")?;
    {
        let sp = g.strings.lock();
        let globals = g.table(g.globals);
        globals
            .lock()
            .set(&sp, &key, Value::Table(arg_tbl))
            .map_err(|_| AllocError)?;
    }
    if g.parm.argv.is_empty() {
        return Ok(());
    }
    let argv = g.parm.argv.clone();
    for (i, a) in argv.iter().enumerate() {
        let v = match a.parse::<i64>() {
            Ok(n) => Value::Number(n),
            Err(_) => g.intern(a)?,
        };
        let sp = g.strings.lock();
        let tb = g.table(arg_tbl);
        tb.lock()
            .set_int(&sp, i as i64, v)
            .map_err(|_| AllocError)?;
    }
    Ok(())
}
