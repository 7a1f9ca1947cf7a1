// Bytecode image writer and loader.
//
// The image is produced off-line by the compiler front end and consumed
// here. The header pins down every property the interpreter depends on
// (endianness, word sizes, integral numbers); the loader rejects any image
// whose header bytes do not match this build exactly. Body layout per
// proto: params/vararg/stack metadata, code, constants, upvalue
// descriptors, nested protos, then debug info.

use smol_str::SmolStr;
use thiserror::Error;

use crate::gc::StringPool;
use crate::value::proto::{LocVar, UpvalDesc};
use crate::value::Value;

pub const IMAGE_MAGIC: [u8; 4] = *b"\x1btvm";
pub const IMAGE_VERSION: u8 = 0x03;
pub const IMAGE_FORMAT: u8 = 0;
const ENDIAN_LITTLE: u8 = 1;
const SIZEOF_INT: u8 = 4;
const SIZEOF_SIZET: u8 = 8;
const SIZEOF_INSTRUCTION: u8 = 4;
const SIZEOF_NUMBER: u8 = 8;
const INTEGRAL_NUMBERS: u8 = 1;
pub const IMAGE_TAIL: [u8; 6] = *b"\x19\x93\r\n\x1a\n";

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("bad image header")]
    BadHeader,
    #[error("truncated image")]
    Truncated,
    #[error("unknown constant tag {0}")]
    BadConstant(u8),
    #[error("image string is not valid utf-8")]
    BadString,
    #[error("image exceeds the session allocation ceiling")]
    Alloc,
}

/// A loaded prototype, still mutable: the peephole optimization pass
/// rewrites `code` in place before the tree is installed into the arena.
pub struct ImageProto {
    pub code: Vec<u32>,
    pub k: Vec<Value>,
    pub protos: Vec<ImageProto>,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    pub upvalues: Vec<UpvalDesc>,
    pub lineinfo: Vec<u32>,
    pub locvars: Vec<LocVar>,
    pub source: Option<SmolStr>,
}

// ---- writer ---------------------------------------------------------

/// Constant in the off-line form of a proto.
#[derive(Debug, Clone)]
pub enum Const {
    Nil,
    Bool(bool),
    Num(i64),
    Str(String),
}

/// Off-line form of a proto, used by the compiler back end (and tests) to
/// assemble images.
#[derive(Default)]
pub struct ProtoBuilder {
    pub code: Vec<u32>,
    pub k: Vec<Const>,
    pub protos: Vec<ProtoBuilder>,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    /// (name, instack, idx)
    pub upvalues: Vec<(String, bool, u8)>,
    pub lineinfo: Vec<u32>,
    pub source: Option<String>,
}

/// The exact header bytes this build accepts.
pub fn emit_header() -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend_from_slice(&IMAGE_MAGIC);
    out.push(IMAGE_VERSION);
    out.push(IMAGE_FORMAT);
    out.push(ENDIAN_LITTLE);
    out.push(SIZEOF_INT);
    out.push(SIZEOF_SIZET);
    out.push(SIZEOF_INSTRUCTION);
    out.push(SIZEOF_NUMBER);
    out.push(INTEGRAL_NUMBERS);
    out.extend_from_slice(&IMAGE_TAIL);
    out
}

pub fn write_image(main: &ProtoBuilder) -> Vec<u8> {
    let mut out = emit_header();
    write_proto(&mut out, main);
    out
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn write_proto(out: &mut Vec<u8>, p: &ProtoBuilder) {
    out.push(p.numparams);
    out.push(p.is_vararg as u8);
    out.push(p.maxstacksize);

    write_u32(out, p.code.len() as u32);
    for &i in &p.code {
        write_u32(out, i);
    }

    write_u32(out, p.k.len() as u32);
    for c in &p.k {
        match c {
            Const::Nil => out.push(TAG_NIL),
            Const::Bool(false) => out.push(TAG_FALSE),
            Const::Bool(true) => out.push(TAG_TRUE),
            Const::Num(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Const::Str(s) => {
                out.push(TAG_STRING);
                write_str(out, s);
            }
        }
    }

    write_u32(out, p.upvalues.len() as u32);
    for (name, instack, idx) in &p.upvalues {
        write_str(out, name);
        out.push(*instack as u8);
        out.push(*idx);
    }

    write_u32(out, p.protos.len() as u32);
    for child in &p.protos {
        write_proto(out, child);
    }

    match &p.source {
        Some(s) => write_str(out, s),
        None => write_u32(out, 0),
    }
    write_u32(out, p.lineinfo.len() as u32);
    for &l in &p.lineinfo {
        write_u32(out, l);
    }
    // local variable descriptors are not emitted by the current front end
    write_u32(out, 0);
}

// ---- loader ---------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, LoadError> {
        let b = *self.data.get(self.pos).ok_or(LoadError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let end = self.pos.checked_add(4).ok_or(LoadError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(LoadError::Truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, LoadError> {
        let end = self.pos.checked_add(8).ok_or(LoadError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(LoadError::Truncated)?;
        self.pos = end;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos.checked_add(n).ok_or(LoadError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(LoadError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn str(&mut self) -> Result<&'a str, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| LoadError::BadString)
    }

    /// An element count; bounded by the remaining bytes so a corrupt count
    /// cannot drive a huge preallocation.
    fn count(&mut self) -> Result<usize, LoadError> {
        let n = self.u32()? as usize;
        if n > self.data.len() - self.pos {
            return Err(LoadError::Truncated);
        }
        Ok(n)
    }
}

/// Verify the header bytes against this build.
pub fn check_header(data: &[u8]) -> Result<usize, LoadError> {
    let expected = emit_header();
    if data.len() < expected.len() || data[..expected.len()] != expected[..] {
        return Err(LoadError::BadHeader);
    }
    Ok(expected.len())
}

/// Load an image: header check, then the proto tree. String constants are
/// interned into the session pool as they are read.
pub fn load_image(sp: &mut StringPool, data: &[u8]) -> Result<ImageProto, LoadError> {
    let body = check_header(data)?;
    let mut r = Reader {
        data,
        pos: body,
    };
    load_proto(sp, &mut r)
}

fn load_proto(sp: &mut StringPool, r: &mut Reader<'_>) -> Result<ImageProto, LoadError> {
    let numparams = r.u8()?;
    let is_vararg = r.u8()? != 0;
    let maxstacksize = r.u8()?;

    let ncode = r.count()?;
    let mut code = Vec::with_capacity(ncode);
    for _ in 0..ncode {
        code.push(r.u32()?);
    }

    let nk = r.count()?;
    let mut k = Vec::with_capacity(nk);
    for _ in 0..nk {
        let tag = r.u8()?;
        k.push(match tag {
            TAG_NIL => Value::Nil,
            TAG_FALSE => Value::Boolean(false),
            TAG_TRUE => Value::Boolean(true),
            TAG_NUMBER => Value::Number(r.i64()?),
            TAG_STRING => {
                let s = r.str()?;
                Value::Str(sp.new_str(s).map_err(|_| LoadError::Alloc)?)
            }
            other => return Err(LoadError::BadConstant(other)),
        });
    }

    let nup = r.count()?;
    let mut upvalues = Vec::with_capacity(nup);
    for _ in 0..nup {
        let name = SmolStr::new(r.str()?);
        let instack = r.u8()? != 0;
        let idx = r.u8()?;
        upvalues.push(UpvalDesc {
            name,
            instack,
            idx,
        });
    }

    let np = r.count()?;
    let mut protos = Vec::with_capacity(np);
    for _ in 0..np {
        protos.push(load_proto(sp, r)?);
    }

    let source = {
        let s = r.str()?;
        if s.is_empty() {
            None
        } else {
            Some(SmolStr::new(s))
        }
    };
    let nline = r.count()?;
    let mut lineinfo = Vec::with_capacity(nline);
    for _ in 0..nline {
        lineinfo.push(r.u32()?);
    }
    let nloc = r.count()?;
    let mut locvars = Vec::with_capacity(nloc);
    for _ in 0..nloc {
        let name = SmolStr::new(r.str()?);
        let startpc = r.u32()?;
        let endpc = r.u32()?;
        locvars.push(LocVar {
            name,
            startpc,
            endpc,
        });
    }

    Ok(ImageProto {
        code,
        k,
        protos,
        numparams,
        is_vararg,
        maxstacksize,
        upvalues,
        lineinfo,
        locvars,
        source,
    })
}
