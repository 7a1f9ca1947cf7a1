// Interpreter behavior driven through loaded images: arithmetic, loops,
// calls, tail calls, concat and stack limits, the EVENT fallback.

use crate::test::util::*;
use crate::value::image::Const;
use crate::value::Value;
use crate::vm::opcode::*;
use crate::vm::{checkstack, State};
use crate::limits::MAX_STACK;

#[test]
fn test_divide_by_zero_stops_cleanly() {
    let main = Pb::new(4)
        .env()
        .num(10)
        .num(0)
        .code(vec![
            iabx(OpCode::LoadK, 0, 0),
            iabx(OpCode::LoadK, 1, 1),
            iabc(OpCode::Div, 2, 0, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let out = run_script(main);
    assert!(
        out.contains("divide 0 arith operation"),
        "missing diagnostic in {:?}",
        out
    );
}

#[test]
fn test_mod_by_zero() {
    let main = Pb::new(4)
        .env()
        .num(10)
        .num(0)
        .code(vec![
            iabx(OpCode::LoadK, 0, 0),
            iabx(OpCode::LoadK, 1, 1),
            iabc(OpCode::Mod, 2, 0, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert!(run_script(main).contains("mod 0 arith operation"));
}

#[test]
fn test_pow_is_rejected() {
    let main = Pb::new(4)
        .env()
        .num(2)
        .code(vec![
            iabx(OpCode::LoadK, 0, 0),
            iabc(OpCode::Pow, 1, 0, 0),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert!(run_script(main).contains("pow arith operation is not supported"));
}

#[test]
fn test_arith_stores_global() {
    let main = Pb::new(6)
        .env()
        .str("answer")
        .num(7)
        .num(6)
        .code(vec![
            iabx(OpCode::LoadK, 0, 1),
            iabx(OpCode::LoadK, 1, 2),
            iabc(OpCode::Mul, 2, 0, 1),
            iabc(OpCode::SetTabUp, 0, k(0), 2),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    s.start();
    let v = global_get(s.global(), "answer");
    assert_eq!(v.as_number(), Some(42));
    s.finish();
}

#[test]
fn test_numeric_for_loop() {
    // sum = 0; for i = 1, 10 do sum = sum + i end
    let main = Pb::new(8)
        .env()
        .str("sum")
        .num(1)
        .num(10)
        .num(0)
        .code(vec![
            iabx(OpCode::LoadK, 0, 1),          // init
            iabx(OpCode::LoadK, 1, 2),          // limit
            iabx(OpCode::LoadK, 2, 1),          // step
            iabx(OpCode::LoadK, 4, 3),          // acc
            iasbx(OpCode::ForPrep, 0, 1),
            iabc(OpCode::Add, 4, 4, 3),         // body: acc += i
            iasbx(OpCode::ForLoop, 0, -2),
            iabc(OpCode::SetTabUp, 0, k(0), 4),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    s.start();
    assert_eq!(global_get(s.global(), "sum").as_number(), Some(55));
    s.finish();
}

#[test]
fn test_tailcall_runs_in_constant_frames() {
    // f(n): if n == 0 then return 42 end; return f(n - 1)
    let f = Pb::new(6)
        .params(1)
        .upval("_ENV", false, 0)
        .num(0)
        .num(1)
        .str("f")
        .num(42)
        .code(vec![
            iabc(OpCode::Eq, 1, 0, k(0)),
            iasbx(OpCode::Jmp, 0, 4),
            iabc(OpCode::GetTabUp, 2, 0, k(2)),
            iabc(OpCode::Sub, 3, 0, k(1)),
            iabc(OpCode::TailCall, 2, 2, 0),
            iabc(OpCode::Return, 2, 0, 0),
            iabx(OpCode::LoadK, 1, 3),
            iabc(OpCode::Return, 1, 2, 0),
        ]);
    // a depth this large overflows the stack unless frames are reused
    let main = Pb::new(6)
        .env()
        .str("f")
        .num(100_000)
        .str("result")
        .code(vec![
            iabx(OpCode::Closure, 0, 0),
            iabc(OpCode::SetTabUp, 0, k(0), 0),
            iabc(OpCode::GetTabUp, 1, 0, k(0)),
            iabx(OpCode::LoadK, 2, 1),
            iabc(OpCode::Call, 1, 2, 2),
            iabc(OpCode::SetTabUp, 0, k(2), 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .child(f)
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    s.start();
    assert_eq!(global_get(s.global(), "result").as_number(), Some(42));
    let out = s.finish();
    assert!(!String::from_utf8_lossy(&out).contains("error"));
}

#[test]
fn test_deep_recursion_overflows() {
    // f(): return 1 + f() -- no tail position, frames accumulate
    let f = Pb::new(20)
        .upval("_ENV", false, 0)
        .str("f")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabc(OpCode::Call, 0, 1, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ]);
    let main = Pb::new(6)
        .env()
        .str("f")
        .code(vec![
            iabx(OpCode::Closure, 0, 0),
            iabc(OpCode::SetTabUp, 0, k(0), 0),
            iabc(OpCode::GetTabUp, 1, 0, k(0)),
            iabc(OpCode::Call, 1, 1, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .child(f)
        .build();
    assert!(run_script(main).contains("stack overflow"));
}

#[test]
fn test_stack_limit_boundary() {
    let (s, _b) = test_session();
    let g = s.global().clone();
    let mut ks = State::new_main();
    checkstack(&g, &mut ks, 14_998).unwrap();
    checkstack(&g, &mut ks, 14_999).unwrap();
    assert_eq!(ks.stack.len(), MAX_STACK);
    // one more slot is refused
    assert!(checkstack(&g, &mut ks, MAX_STACK).is_err());
    let out = g.transport.drain_all();
    assert!(String::from_utf8_lossy(&out).contains("stack overflow"));
}

#[test]
fn test_concat_within_page() {
    let main = Pb::new(6)
        .env()
        .str("len")
        .konst(Const::Str("a".repeat(2048)))
        .konst(Const::Str("b".repeat(2047)))
        .code(vec![
            iabx(OpCode::LoadK, 0, 1),
            iabx(OpCode::LoadK, 1, 2),
            iabc(OpCode::Concat, 0, 0, 1),
            iabc(OpCode::Len, 2, 0, 0),
            iabc(OpCode::SetTabUp, 0, k(0), 2),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    s.start();
    assert_eq!(global_get(s.global(), "len").as_number(), Some(4095));
    let out = s.finish();
    assert!(!String::from_utf8_lossy(&out).contains("error"));
}

#[test]
fn test_concat_page_overflow() {
    let main = Pb::new(6)
        .env()
        .konst(Const::Str("a".repeat(2048)))
        .konst(Const::Str("b".repeat(2048)))
        .code(vec![
            iabx(OpCode::LoadK, 0, 0),
            iabx(OpCode::LoadK, 1, 1),
            iabc(OpCode::Concat, 0, 0, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert!(run_script(main).contains("too long string concatenation"));
}

#[test]
fn test_concat_non_string() {
    let main = Pb::new(6)
        .env()
        .num(1)
        .num(2)
        .code(vec![
            iabx(OpCode::LoadK, 0, 0),
            iabx(OpCode::LoadK, 1, 1),
            iabc(OpCode::Concat, 0, 0, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert!(run_script(main).contains("cannot concat non-string"));
}

#[test]
fn test_call_nil_reports() {
    let main = Pb::new(4)
        .env()
        .code(vec![
            iabc(OpCode::LoadNil, 0, 0, 0),
            iabc(OpCode::Call, 0, 1, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert!(run_script(main).contains("attempt to call nil function"));
}

#[test]
fn test_event_instruction_falls_back_to_table() {
    // R0 is a plain table carrying a "name" entry; the specialized
    // instruction must behave exactly like the table read it replaced
    let main = Pb::new(6)
        .env()
        .str("name")
        .num(5)
        .str("out")
        .code(vec![
            iabc(OpCode::NewTable, 0, 0, 0),
            iabc(OpCode::SetTable, 0, k(0), k(1)),
            iabc(OpCode::Event, 1, 0, 0),
            iabc(OpCode::SetTabUp, 0, k(2), 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    s.start();
    assert_eq!(global_get(s.global(), "out").as_number(), Some(5));
    s.finish();
}

#[test]
fn test_sort_then_pairs_walks_ascending() {
    // t = {a=30, b=10, c=20}; sort(t); collect values via pairs
    let (s, _b) = test_session();
    let g = s.global().clone();
    let tid = g.objects.new_table().unwrap();
    {
        let keys: Vec<Value> = ["a", "b", "c"]
            .iter()
            .map(|n| g.intern(n).unwrap())
            .collect();
        let sp = g.strings.lock();
        let tb = g.table(tid);
        let mut d = tb.lock();
        d.set(&sp, &keys[0], Value::Number(30)).unwrap();
        d.set(&sp, &keys[1], Value::Number(10)).unwrap();
        d.set(&sp, &keys[2], Value::Number(20)).unwrap();
    }
    let mut ks = State::new_main();
    crate::vm::table_sort(&g, &mut ks, tid, None).unwrap();

    let mut walked = Vec::new();
    let mut key = Value::Nil;
    loop {
        let next = {
            let sp = g.strings.lock();
            let tb = g.table(tid);
            let n = tb.lock().sort_next(&sp, &key);
            n
        };
        match next {
            Some((nk, v)) => {
                walked.push(v.as_number().unwrap());
                key = nk;
            }
            None => break,
        }
    }
    assert_eq!(walked, vec![10, 20, 30]);
}
