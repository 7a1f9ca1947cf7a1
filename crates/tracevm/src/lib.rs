// tracevm
// A dynamic-tracing scripting engine: a register-based bytecode VM with
// tagged values, hybrid tables and per-CPU aggregation, dispatched from
// live trace events through a reentrancy-guarded probe path, streaming
// output over a per-CPU transport.

#[cfg(test)]
mod test;

pub mod event;
pub mod gc;
pub mod lib_registry;
pub mod limits;
pub mod probe;
pub mod ptable;
pub mod session;
pub mod stdlib;
pub mod strfmt;
pub mod timer;
pub mod transport;
pub mod value;
pub mod vm;

pub use event::{Event, EventCall, FieldDesc, RegContext};
pub use probe::{
    BackendError, CounterAttr, CounterHandle, CounterKind, ExecContext, OverflowFn, Sample,
    TraceBackend,
};
pub use session::{Session, SessionError, SessionParm, StopHandle};
pub use value::image::{emit_header, write_image, Const, LoadError, ProtoBuilder};
pub use value::{StatData, Value};
pub use vm::{Global, KResult, NativeFn, OpCode, State, VmError};
