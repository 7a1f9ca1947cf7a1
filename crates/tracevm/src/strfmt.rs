// printf-style formatting and value display.
//
// `printf` composes its whole output into a scratch-backed sequence
// buffer and the caller hands it to the transport in one write. Supported
// conversions: %c %d %i %o %u %x %X %s with the usual flag/width/
// precision syntax; integers are implicitly 64-bit. Unknown conversions
// are runtime errors.

use std::fmt::Write as _;

use crate::value::Value;
use crate::vm::{runtime_error, Global, KResult, State};

/// A bounded, truncating byte sink over borrowed scratch.
pub struct SeqBuf<'a> {
    buf: &'a mut [u8],
    len: usize,
    full: bool,
}

impl<'a> SeqBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> SeqBuf<'a> {
        SeqBuf {
            buf,
            len: 0,
            full: false,
        }
    }

    pub fn put(&mut self, bytes: &[u8]) {
        let room = self.buf.len() - self.len;
        if bytes.len() > room {
            self.full = true;
        }
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    pub fn putc(&mut self, b: u8) {
        self.put(&[b]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflowed(&self) -> bool {
        self.full
    }
}

impl std::fmt::Write for SeqBuf<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.put(s.as_bytes());
        Ok(())
    }
}

// ---- format specifications ------------------------------------------

#[derive(Default, Clone, Copy)]
struct FormatSpec {
    minus: bool,
    plus: bool,
    space: bool,
    hash: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

/// Parse one `%...X` item after the escape; returns the spec and the
/// conversion character, advancing `pos` past it.
fn scanformat(
    g: &Global,
    ks: &mut State,
    fmt: &[u8],
    pos: &mut usize,
) -> KResult<(FormatSpec, u8)> {
    let mut spec = FormatSpec::default();
    let mut nflags = 0;
    loop {
        match fmt.get(*pos) {
            Some(b'-') => spec.minus = true,
            Some(b'+') => spec.plus = true,
            Some(b' ') => spec.space = true,
            Some(b'#') => spec.hash = true,
            Some(b'0') => spec.zero = true,
            _ => break,
        }
        *pos += 1;
        nflags += 1;
        if nflags >= 5 {
            return Err(runtime_error(
                g,
                ks,
                format_args!("invalid format (repeated flags)"),
            ));
        }
    }
    // width: two digits at most
    for _ in 0..2 {
        if let Some(d) = fmt.get(*pos).filter(|b| b.is_ascii_digit()) {
            spec.width = spec.width * 10 + (d - b'0') as usize;
            *pos += 1;
        }
    }
    if fmt.get(*pos) == Some(&b'.') {
        *pos += 1;
        let mut prec = 0;
        for _ in 0..2 {
            if let Some(d) = fmt.get(*pos).filter(|b| b.is_ascii_digit()) {
                prec = prec * 10 + (d - b'0') as usize;
                *pos += 1;
            }
        }
        spec.precision = Some(prec);
    }
    if fmt.get(*pos).is_some_and(|b| b.is_ascii_digit()) {
        return Err(runtime_error(
            g,
            ks,
            format_args!("invalid format (width or precision too long)"),
        ));
    }
    let conv = *fmt.get(*pos).ok_or_else(|| {
        runtime_error(g, ks, format_args!("invalid format (ends in '%')"))
    })?;
    *pos += 1;
    Ok((spec, conv))
}

/// Emit `body` (sign/prefix/digits already split out) under the spec's
/// padding rules.
fn pad_number(seq: &mut SeqBuf<'_>, spec: &FormatSpec, sign: &str, prefix: &str, digits: &str) {
    let zeros = spec
        .precision
        .map(|p| p.saturating_sub(digits.len()))
        .unwrap_or(0);
    let body_len = sign.len() + prefix.len() + zeros + digits.len();
    let pad = spec.width.saturating_sub(body_len);

    if spec.minus {
        seq.put(sign.as_bytes());
        seq.put(prefix.as_bytes());
        for _ in 0..zeros {
            seq.putc(b'0');
        }
        seq.put(digits.as_bytes());
        for _ in 0..pad {
            seq.putc(b' ');
        }
    } else if spec.zero && spec.precision.is_none() {
        seq.put(sign.as_bytes());
        seq.put(prefix.as_bytes());
        for _ in 0..pad + zeros {
            seq.putc(b'0');
        }
        seq.put(digits.as_bytes());
    } else {
        for _ in 0..pad {
            seq.putc(b' ');
        }
        seq.put(sign.as_bytes());
        seq.put(prefix.as_bytes());
        for _ in 0..zeros {
            seq.putc(b'0');
        }
        seq.put(digits.as_bytes());
    }
}

fn check_num_arg(g: &Global, ks: &mut State, n: usize) -> KResult<i64> {
    match ks.arg(n) {
        Value::Number(v) => Ok(v),
        _ => Err(runtime_error(
            g,
            ks,
            format_args!("bad argument #{}: (not a number)", n),
        )),
    }
}

/// Format the running native's arguments (arg 1 is the format string)
/// into `seq`.
pub fn strfmt(g: &Global, ks: &mut State, seq: &mut SeqBuf<'_>) -> KResult<()> {
    let fmt_ts = match ks.arg(1) {
        Value::Str(id) => g.get_string(id),
        _ => {
            return Err(runtime_error(
                g,
                ks,
                format_args!("bad argument #1: (string expected)"),
            ));
        }
    };
    let fmt = fmt_ts.as_str().as_bytes();
    let argnum = ks.arg_nr();
    let mut arg = 1;
    let mut pos = 0;

    while pos < fmt.len() {
        let b = fmt[pos];
        if b != b'%' {
            seq.putc(b);
            pos += 1;
            continue;
        }
        pos += 1;
        if fmt.get(pos) == Some(&b'%') {
            seq.putc(b'%');
            pos += 1;
            continue;
        }

        arg += 1;
        if arg > argnum {
            return Err(runtime_error(
                g,
                ks,
                format_args!("bad argument #{}: (no value)", arg),
            ));
        }
        let (spec, conv) = scanformat(g, ks, fmt, &mut pos)?;
        match conv {
            b'c' => {
                let n = check_num_arg(g, ks, arg)?;
                let ch = [(n as u8)];
                let pad = spec.width.saturating_sub(1);
                if spec.minus {
                    seq.put(&ch);
                    for _ in 0..pad {
                        seq.putc(b' ');
                    }
                } else {
                    for _ in 0..pad {
                        seq.putc(b' ');
                    }
                    seq.put(&ch);
                }
            }
            b'd' | b'i' => {
                let n = check_num_arg(g, ks, arg)?;
                let mut itoa_buf = itoa::Buffer::new();
                let digits = itoa_buf.format(n.unsigned_abs());
                let sign = if n < 0 {
                    "-"
                } else if spec.plus {
                    "+"
                } else if spec.space {
                    " "
                } else {
                    ""
                };
                pad_number(seq, &spec, sign, "", digits);
            }
            b'u' => {
                let n = check_num_arg(g, ks, arg)? as u64;
                let mut itoa_buf = itoa::Buffer::new();
                pad_number(seq, &spec, "", "", itoa_buf.format(n));
            }
            b'o' => {
                let n = check_num_arg(g, ks, arg)? as u64;
                let digits = format!("{:o}", n);
                let prefix = if spec.hash && n != 0 { "0" } else { "" };
                pad_number(seq, &spec, "", prefix, &digits);
            }
            b'x' => {
                let n = check_num_arg(g, ks, arg)? as u64;
                let digits = format!("{:x}", n);
                let prefix = if spec.hash && n != 0 { "0x" } else { "" };
                pad_number(seq, &spec, "", prefix, &digits);
            }
            b'X' => {
                let n = check_num_arg(g, ks, arg)? as u64;
                let digits = format!("{:X}", n);
                let prefix = if spec.hash && n != 0 { "0X" } else { "" };
                pad_number(seq, &spec, "", prefix, &digits);
            }
            b's' => {
                let ts = match ks.arg(arg) {
                    Value::Str(id) => g.get_string(id),
                    _ => {
                        return Err(runtime_error(
                            g,
                            ks,
                            format_args!("bad argument #{}: (string expected)", arg),
                        ));
                    }
                };
                let s = ts.as_str().as_bytes();
                if spec.precision.is_none() && s.len() >= 100 {
                    // long string without precision: keep it as is
                    seq.put(s);
                } else {
                    let s = match spec.precision {
                        Some(p) => &s[..s.len().min(p)],
                        None => s,
                    };
                    let pad = spec.width.saturating_sub(s.len());
                    if spec.minus {
                        seq.put(s);
                        for _ in 0..pad {
                            seq.putc(b' ');
                        }
                    } else {
                        for _ in 0..pad {
                            seq.putc(b' ');
                        }
                        seq.put(s);
                    }
                }
            }
            other => {
                return Err(runtime_error(
                    g,
                    ks,
                    format_args!("invalid option '%{}' to 'format'", other as char),
                ));
            }
        }
    }
    Ok(())
}

// ---- value display --------------------------------------------------

/// Print a value the way `print` shows it: strings quoted, tables dumped
/// entry per line, stats slots as their accumulator summary.
pub fn show_value(g: &Global, ks: &State, v: &Value, seq: &mut SeqBuf<'_>) {
    match v {
        Value::Nil => seq.put(b"nil"),
        Value::Boolean(b) => seq.put(if *b { b"true" } else { b"false" }),
        Value::Number(n) => {
            let mut buf = itoa::Buffer::new();
            seq.put(buf.format(*n).as_bytes());
        }
        Value::LightPtr(p) => {
            let _ = write!(seq, "0x{:x}", p);
        }
        Value::NativeFunc(f) => {
            let _ = write!(seq, "function: 0x{:x}", *f as usize);
        }
        Value::Str(id) => {
            let ts = g.get_string(*id);
            seq.putc(b'"');
            seq.put(ts.as_str().as_bytes());
            seq.putc(b'"');
        }
        Value::Table(id) => table_dump(g, ks, *id, seq),
        Value::Closure(id) => {
            let _ = write!(seq, "function: {:x}", id.0);
        }
        Value::Proto(id) => {
            let _ = write!(seq, "proto: {:x}", id.0);
        }
        Value::Upval(id) => {
            let _ = write!(seq, "upval: {:x}", id.0);
        }
        Value::Event => {
            match ks
                .current_event
                .as_ref()
                .and_then(|e| g.backend.format_event(&e.call, &[]))
            {
                Some(s) => seq.put(s.as_bytes()),
                None => seq.put(b"event"),
            }
        }
        Value::Stat(sd) => statdata_dump(sd, seq),
        Value::Btrace { id, .. } => {
            let bt = g.objects.btrace(*id);
            for addr in &bt.entries {
                match g.backend.lookup_symbol(*addr) {
                    Some(sym) => {
                        let _ = write!(seq, "\n{}", sym);
                    }
                    None => {
                        let _ = write!(seq, "\n0x{:x}", addr);
                    }
                }
            }
            seq.putc(b'\n');
        }
        Value::PTable(id) => {
            let _ = write!(seq, "ptable: {:x}", id.0);
        }
    }
}

/// `key:\tvalue` per entry, array part first.
pub fn table_dump(g: &Global, ks: &State, tid: crate::gc::TableId, seq: &mut SeqBuf<'_>) {
    let entries = g.table(tid).lock().entries();
    for (key, val) in entries {
        show_value(g, ks, &key, seq);
        seq.put(b":\t");
        show_value(g, ks, &val, seq);
        seq.putc(b'\n');
    }
}

pub fn statdata_dump(sd: &crate::value::StatData, seq: &mut SeqBuf<'_>) {
    let avg = if sd.count != 0 { sd.sum / sd.count } else { 0 };
    let _ = write!(
        seq,
        "[count: {:6} sum: {:6} max: {:6} min: {:6} avg: {:6}]",
        sd.count, sd.sum, sd.max, sd.min, avg
    );
}
