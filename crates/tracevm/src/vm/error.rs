// Interpreter error values.
//
// There is no catch/throw in the language and the interpreter never
// unwinds with a payload: the diagnostic is written to the transport at
// the raise site and the saved program counters of the two innermost
// frames are patched to EXIT. What propagates through Rust results is a
// one-byte discriminant.

pub type KResult<T> = Result<T, VmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Runtime error; the diagnostic has already been written to the
    /// transport and the frame chain patched to EXIT.
    Runtime,
    /// Allocation ceiling hit; reported like a runtime error.
    Memory,
    /// `exit()` or a termination signal: the session is shutting down.
    Exit,
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Runtime => write!(f, "runtime error"),
            VmError::Memory => write!(f, "out of memory"),
            VmError::Exit => write!(f, "exit"),
        }
    }
}

impl std::error::Error for VmError {}
