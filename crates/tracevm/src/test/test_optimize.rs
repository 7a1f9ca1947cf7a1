// The load-time peephole pass: LOAD_GLOBAL and EVENT rewrites.

use crate::test::util::*;
use crate::value::Value;
use crate::vm::opcode::*;

#[test]
fn test_global_builtin_becomes_load_global() {
    // R0 = print; _ENV.x = R0
    let main = Pb::new(4)
        .env()
        .str("print")
        .str("x")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabc(OpCode::SetTabUp, 0, k(1), 0),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();

    let g = s.global().clone();
    let cl = s.main_closure().unwrap().as_closure_id().unwrap();
    let proto = g.objects.proto(g.objects.closure(cl).proto);
    assert_eq!(get_op(proto.code[0]), OpCode::LoadGlobal);

    let print_v = global_get(&g, "print");
    let slot = g.cfunction_index(&print_v).expect("print is cached");
    assert_eq!(get_c(proto.code[0]), slot);

    // executing the rewritten instruction yields the same value the
    // original lookup would have
    s.start();
    let x = global_get(&g, "x");
    let sp = g.strings.lock();
    assert!(x.raw_equal(&print_v, &sp));
    drop(sp);
    s.finish();
}

#[test]
fn test_unknown_global_stays_gettabup() {
    let main = Pb::new(4)
        .env()
        .str("no_such_builtin")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    let g = s.global();
    let cl = s.main_closure().unwrap().as_closure_id().unwrap();
    let proto = g.objects.proto(g.objects.closure(cl).proto);
    assert_eq!(get_op(proto.code[0]), OpCode::GetTabUp);
}

#[test]
fn test_event_field_read_becomes_event_op() {
    // a handler body reading e.sc_nr through register 0
    let handler = Pb::new(4)
        .params(1)
        .upval("_ENV", false, 0)
        .str("sc_nr")
        .code(vec![
            iabc(OpCode::GetTable, 1, 0, k(0)),
            iabc(OpCode::Return, 0, 1, 0),
        ]);
    let main = Pb::new(4)
        .env()
        .code(vec![
            iabx(OpCode::Closure, 0, 0),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .child(handler)
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    let g = s.global();
    let cl = s.main_closure().unwrap().as_closure_id().unwrap();
    let main_proto = g.objects.proto(g.objects.closure(cl).proto);
    let handler_proto = g.objects.proto(main_proto.p[0]);
    assert_eq!(get_op(handler_proto.code[0]), OpCode::Event);
    assert_eq!(
        get_c(handler_proto.code[0]),
        crate::event::field_index("sc_nr").unwrap()
    );
}

#[test]
fn test_non_field_name_stays_gettable() {
    let handler = Pb::new(4)
        .params(1)
        .upval("_ENV", false, 0)
        .str("no_such_field")
        .code(vec![
            iabc(OpCode::GetTable, 1, 0, k(0)),
            iabc(OpCode::Return, 0, 1, 0),
        ]);
    let main = Pb::new(4)
        .env()
        .code(vec![
            iabx(OpCode::Closure, 0, 0),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .child(handler)
        .build();
    let image = crate::write_image(&main);
    let (mut s, _b) = test_session();
    s.load(&image).unwrap();
    let g = s.global();
    let cl = s.main_closure().unwrap().as_closure_id().unwrap();
    let main_proto = g.objects.proto(g.objects.closure(cl).proto);
    let handler_proto = g.objects.proto(main_proto.p[0]);
    assert_eq!(get_op(handler_proto.code[0]), OpCode::GetTable);
}
