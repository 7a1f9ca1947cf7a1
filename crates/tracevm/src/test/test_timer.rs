// Timer callbacks: periodic firing into the handler path, cancellation
// at teardown.

use std::time::Duration;

use crate::test::util::*;
use crate::vm::opcode::*;

/// t = {}; timer.ms(5, function() count(t, "tick") end);
/// kdebug.probe_end(function() print(t) end)
fn timer_script() -> Vec<u8> {
    let handler = Pb::new(6)
        .upval("_ENV", false, 0)
        .upval("t", true, 0)
        .str("count")
        .str("tick")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabc(OpCode::GetUpval, 1, 1, 0),
            iabx(OpCode::LoadK, 2, 1),
            iabc(OpCode::Call, 0, 3, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ]);
    let endfn = Pb::new(4)
        .upval("_ENV", false, 0)
        .upval("t", true, 0)
        .str("print")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabc(OpCode::GetUpval, 1, 1, 0),
            iabc(OpCode::Call, 0, 2, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ]);
    let main = Pb::new(8)
        .env()
        .str("timer")
        .str("ms")
        .num(5)
        .str("kdebug")
        .str("probe_end")
        .code(vec![
            iabc(OpCode::NewTable, 0, 0, 0),
            iabc(OpCode::GetTabUp, 1, 0, k(0)),
            iabc(OpCode::GetTable, 1, 1, k(1)),
            iabx(OpCode::LoadK, 2, 2),
            iabx(OpCode::Closure, 3, 0),
            iabc(OpCode::Call, 1, 3, 1),
            iabc(OpCode::GetTabUp, 1, 0, k(3)),
            iabc(OpCode::GetTable, 1, 1, k(4)),
            iabx(OpCode::Closure, 2, 1),
            iabc(OpCode::Call, 1, 2, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .child(handler)
        .child(endfn)
        .build();
    crate::write_image(&main)
}

#[test]
fn test_timer_fires_and_cancels() {
    let (mut s, _backend) = test_session();
    s.load(&timer_script()).unwrap();
    s.start();
    let g = s.global().clone();
    assert_eq!(g.timers.lock().len(), 1);

    // let the 5 ms timer fire a few times
    std::thread::sleep(Duration::from_millis(60));

    let out = String::from_utf8_lossy(&s.finish()).into_owned();
    assert!(out.contains("\"tick\":\t"), "timer never fired: {:?}", out);
    assert!(g.timers.lock().is_empty(), "timers survived teardown");
}

#[test]
fn test_timer_handler_counts_multiple_fires() {
    let (mut s, _backend) = test_session();
    s.load(&timer_script()).unwrap();
    s.start();
    let g = s.global().clone();

    std::thread::sleep(Duration::from_millis(80));
    crate::timer::exit_timers(&g);

    // read the captured table through the timer closure's upvalue: by
    // now the count is stable
    let out = String::from_utf8_lossy(&s.finish()).into_owned();
    let tick_line = out
        .lines()
        .find(|l| l.contains("\"tick\":"))
        .unwrap_or_else(|| panic!("no tick line in {:?}", out));
    let count: i64 = tick_line
        .rsplit('\t')
        .next()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    assert!(count >= 2, "expected several fires, saw {}", count);
}
