// Engine-wide limits and tunables.
// A tracing session is a bounded event: allocations grow monotonically and
// are freed en masse at teardown, so every growth path checks a hard ceiling
// instead of collecting.

/// Page granularity used for scratch buffers and concat/format limits.
pub const PAGE_SIZE: usize = 4096;

/// Per-(CPU, context) general scratch buffer.
pub const PERCPU_BUFFER_SIZE: usize = 3 * PAGE_SIZE;

/// Hard cap on any execution stack, in value slots.
pub const MAX_STACK: usize = 15_000;

/// Headroom a native function is guaranteed above its arguments.
pub const MIN_STACK: usize = 20;

/// Initial stack size for a fresh execution state.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;

/// Instruction checkpoint interval: child states are rejected here, the main
/// state yields to the host scheduler and polls for termination.
pub const EXEC_COUNT_LIMIT: u32 = 10_000;

/// Strings at or below this length are interned; longer ones are allocated
/// individually and never interned.
pub const SHORT_STRING_MAX: usize = 40;

/// Initial bucket count of the interned-string table.
pub const INIT_STRING_TABLE_SIZE: usize = 512;

/// log2 of the largest hash part a table may grow to.
pub const MAX_HASH_BITS: u32 = 30;

/// Largest array-part index that `rehash` will consider for the array part.
pub const MAX_ARRAY_SIZE: usize = 1 << MAX_HASH_BITS;

/// Capacity of the C-function cache populated during library registration.
pub const CFUNCTION_CACHE_SIZE: usize = 128;

/// Rows printed by `histogram`.
pub const HISTOGRAM_TOP_ENTRIES: usize = 20;

/// Hash-part size preallocated for each per-CPU aggregation table.
pub const PTABLE_HASH_SIZE: usize = 2000;

/// Elements flushed per SETLIST batch.
pub const FIELDS_PER_FLUSH: usize = 50;

/// Ceiling on GC objects owned by one session (tables, closures, upvalue
/// cells, protos, backtraces). Requests past it are rejected as runtime
/// errors rather than growing without bound inside a probe handler.
pub const MAX_GC_OBJECTS: usize = 1 << 20;

/// Ceiling on bytes held by the string pool.
pub const MAX_STRING_BYTES: usize = 64 << 20;

/// Per-CPU transport subchannel capacity (subbuffer size x count).
pub const TRANSPORT_SUBCHANNEL_SIZE: usize = PAGE_SIZE * 10;

/// Frames collected into a backtrace value at most.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// End-of-session wait loop polling interval.
pub const WAIT_POLL_MS: u64 = 100;
