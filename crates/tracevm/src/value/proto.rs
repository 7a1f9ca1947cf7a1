// Compiled function prototypes.

use smol_str::SmolStr;

use crate::gc::ProtoId;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: SmolStr,
    /// Captured from the enclosing function's stack (true) or from its
    /// upvalue vector (false).
    pub instack: bool,
    pub idx: u8,
}

#[derive(Debug, Clone)]
pub struct LocVar {
    pub name: SmolStr,
    pub startpc: u32,
    pub endpc: u32,
}

/// An installed prototype: immutable once in the arena. The load-time
/// optimization pass runs on the image form, before installation.
pub struct Proto {
    pub code: Vec<u32>,
    pub k: Vec<Value>,
    pub p: Vec<ProtoId>,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    pub upvalues: Vec<UpvalDesc>,
    pub lineinfo: Vec<u32>,
    pub locvars: Vec<LocVar>,
    pub source: Option<SmolStr>,
}
