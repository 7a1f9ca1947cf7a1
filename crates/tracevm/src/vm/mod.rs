// The tracing virtual machine: instruction encoding, call frames,
// execution states and the dispatch loop.

pub mod call_info;
mod error;
mod execute;
pub mod opcode;
mod optimize;
mod state;

pub use error::{KResult, VmError};
pub use execute::{call, execute, gettable, precall, run, settable, table_sort, PreCall};
pub(crate) use execute::table_err;
pub use opcode::OpCode;
pub use optimize::optimize_code;
pub use state::{
    checkstack, close_closure_upvals, close_upvals, exit_thread, find_upval, globals_table,
    mem_error, runtime_error, scratch_buf, set_next_as_exit, with_scratch, CtxSlot, Global,
    PerCpu, ScratchGuard, State, RIDX_GLOBALS,
};

/// A native handler: reads its arguments from the frame's function slot,
/// pushes its results, returns how many it pushed.
pub type NativeFn = fn(&Global, &mut State) -> KResult<i32>;
