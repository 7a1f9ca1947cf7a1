// Timers: periodic handler invocations on their own callback threads.
//
// A timer fires through the same reentrancy path as probes, with the
// per-CPU "tracing in progress" flag raised so a tracepoint cannot race
// the timer closure for the same child state. The timer self-rearms by
// its receive timeout; cancellation is a message on the channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::probe::{call_probe_closure, ExecContext};
use crate::value::Value;
use crate::vm::Global;

pub struct TimerHandle {
    pub period_ns: u64,
    pub cpu: usize,
    cancel: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn cancel(mut self) {
        let _ = self.cancel.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Arm a periodic timer running `cl` on `cpu`'s hard-irq context slot.
pub fn start_timer(
    g: &Arc<Global>,
    period_ns: u64,
    cl: Value,
    cpu: usize,
) -> std::io::Result<TimerHandle> {
    let weak = g.weak_self.clone();
    let (tx, rx) = bounded::<()>(1);
    let period = Duration::from_nanos(period_ns.max(1));
    let thread = std::thread::Builder::new()
        .name(format!("tracevm-timer-{}", cpu))
        .spawn(move || loop {
            match rx.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(g) = weak.upgrade() else {
                        break;
                    };
                    if g.exit.load(Ordering::Relaxed) {
                        break;
                    }
                    // keep tracepoints away from this CPU's child states
                    // while the closure runs
                    g.pcpu[cpu].in_timer.store(true, Ordering::Release);
                    call_probe_closure(&g, cl, None, cpu, ExecContext::HardIrq);
                    g.pcpu[cpu].in_timer.store(false, Ordering::Release);
                }
                _ => break,
            }
        })?;
    log::debug!("armed timer, period {} ns on cpu {}", period_ns, cpu);
    Ok(TimerHandle {
        period_ns,
        cpu,
        cancel: tx,
        thread: Some(thread),
    })
}

/// Cancel every live timer and join its callback thread.
pub fn exit_timers(g: &Global) {
    let timers = std::mem::take(&mut *g.timers.lock());
    for t in timers {
        log::debug!("cancel timer, period {} ns on cpu {}", t.period_ns, t.cpu);
        t.cancel();
    }
}
