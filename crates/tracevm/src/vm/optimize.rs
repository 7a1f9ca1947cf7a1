// Load-time peephole pass.
//
// Runs once over each proto of a freshly loaded image, before
// installation:
//
//   GETTABLE r, r0, K(name)  ->  EVENT r, r0, index
//     when `name` is a recognized event field; the runtime type check in
//     EVENT preserves plain-table semantics when r0 is not an event.
//
//   GETTABUP r, _ENV, K(name)  ->  LOAD_GLOBAL r, slot
//     when the global currently bound to `name` is a registered builtin;
//     `slot` is its index in the C-function cache. The binding is fixed
//     here: later reassignment of the global name does not undo it.

use crate::event;
use crate::value::image::ImageProto;
use crate::value::Value;
use crate::vm::opcode::*;
use crate::vm::state::{globals_table, Global};

pub fn optimize_code(g: &Global, f: &mut ImageProto) {
    for i in 0..f.code.len() {
        let instr = f.code[i];
        match get_op(instr) {
            OpCode::GetTable => {
                if get_b(instr) == 0 && is_k(get_c(instr)) {
                    if let Some(Value::Str(id)) = f.k.get(index_k(get_c(instr))).copied() {
                        let name = g.get_string(id);
                        if let Some(index) = event::field_index(name.as_str()) {
                            let mut ni = instr;
                            set_opcode(&mut ni, OpCode::Event);
                            set_arg_c(&mut ni, index);
                            f.code[i] = ni;
                        }
                    }
                }
            }
            OpCode::GetTabUp => {
                if get_b(instr) == 0 && is_k(get_c(instr)) {
                    if let Some(key @ Value::Str(_)) = f.k.get(index_k(get_c(instr))).copied() {
                        let gt = globals_table(g);
                        let v = {
                            let sp = g.strings.lock();
                            let tb = g.table(gt);
                            let v = tb.lock().get(&sp, &key);
                            v
                        };
                        if !v.is_nil() {
                            if let Some(slot) = g.cfunction_index(&v) {
                                let mut ni = instr;
                                set_opcode(&mut ni, OpCode::LoadGlobal);
                                set_arg_c(&mut ni, slot);
                                f.code[i] = ni;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // continue into nested protos
    for child in &mut f.protos {
        optimize_code(g, child);
    }
}
