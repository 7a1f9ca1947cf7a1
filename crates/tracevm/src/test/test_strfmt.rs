// printf formatting through the full stack.

use crate::test::util::*;
use crate::value::image::Const;
use crate::vm::opcode::*;

/// Build `printf(fmt, args...)` as a one-chunk script.
fn printf_script(fmt: &str, args: &[Const]) -> Vec<u8> {
    let mut pb = Pb::new((4 + args.len()) as u8)
        .env()
        .str("printf")
        .str(fmt);
    for a in args {
        pb = pb.konst(a.clone());
    }
    let mut code = vec![
        iabc(OpCode::GetTabUp, 0, 0, k(0)),
        iabx(OpCode::LoadK, 1, 1),
    ];
    for (i, _) in args.iter().enumerate() {
        code.push(iabx(OpCode::LoadK, 2 + i, 2 + i));
    }
    code.push(iabc(OpCode::Call, 0, 2 + args.len(), 1));
    code.push(iabc(OpCode::Return, 0, 1, 0));
    crate::write_image(&pb.code(code).build())
}

fn printf_out(fmt: &str, args: &[Const]) -> String {
    let image = printf_script(fmt, args);
    let (session, _b) = test_session();
    let out = session.run(&image).expect("run");
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_basic_conversions() {
    let out = printf_out(
        "%d-%s|%05d|%x|%X|%o|%u|%c%%\n",
        &[
            Const::Num(42),
            Const::Str("hi".to_string()),
            Const::Num(7),
            Const::Num(255),
            Const::Num(255),
            Const::Num(8),
            Const::Num(3),
            Const::Num(65),
        ],
    );
    assert_eq!(out, "42-hi|00007|ff|FF|10|3|A%\n");
}

#[test]
fn test_negative_and_sign_flags() {
    assert_eq!(
        printf_out("%d %+d % d", &[Const::Num(-5), Const::Num(5), Const::Num(5)]),
        "-5 +5  5"
    );
}

#[test]
fn test_width_and_alignment() {
    assert_eq!(
        printf_out("[%6d][%-6d][%6s]", &[
            Const::Num(42),
            Const::Num(42),
            Const::Str("ab".to_string()),
        ]),
        "[    42][42    ][    ab]"
    );
}

#[test]
fn test_precision() {
    assert_eq!(
        printf_out("%.5d|%.3s", &[Const::Num(42), Const::Str("abcdef".to_string())]),
        "00042|abc"
    );
}

#[test]
fn test_hash_prefixes() {
    assert_eq!(
        printf_out("%#x %#o %#x", &[Const::Num(255), Const::Num(8), Const::Num(0)]),
        "0xff 010 0"
    );
}

#[test]
fn test_invalid_conversion_is_runtime_error() {
    let out = printf_out("%v", &[Const::Num(1)]);
    assert!(out.contains("invalid option"), "output: {:?}", out);
}

#[test]
fn test_missing_argument() {
    let out = printf_out("%d %d", &[Const::Num(1)]);
    assert!(out.contains("no value"), "output: {:?}", out);
}

#[test]
fn test_wrong_argument_type() {
    let out = printf_out("%d", &[Const::Str("nan".to_string())]);
    assert!(out.contains("not a number"), "output: {:?}", out);
}

#[test]
fn test_print_formats_values() {
    // print(1, "a", true, nil)
    let main = Pb::new(8)
        .env()
        .str("print")
        .num(1)
        .str("a")
        .code(vec![
            iabc(OpCode::GetTabUp, 0, 0, k(0)),
            iabx(OpCode::LoadK, 1, 1),
            iabx(OpCode::LoadK, 2, 2),
            iabc(OpCode::LoadBool, 3, 1, 0),
            iabc(OpCode::LoadNil, 4, 0, 0),
            iabc(OpCode::Call, 0, 5, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .build();
    assert_eq!(run_script(main), "1\t\"a\"\ttrue\tnil\n");
}

#[test]
fn test_print_dumps_tables() {
    // t = {} ; t[1] = 10; t["x"] = 20; print(t)
    let main = Pb::new(6)
        .env()
        .str("print")
        .num(10)
        .str("x")
        .num(20)
        .code(vec![
            iabc(OpCode::NewTable, 0, 0, 0),
            iabc(OpCode::SetTable, 0, k(4), k(1)),
            iabc(OpCode::SetTable, 0, k(2), k(3)),
            iabc(OpCode::GetTabUp, 1, 0, k(0)),
            iabc(OpCode::Move, 2, 0, 0),
            iabc(OpCode::Call, 1, 2, 1),
            iabc(OpCode::Return, 0, 1, 0),
        ])
        .konst(Const::Num(1))
        .build();
    let out = run_script(main);
    assert!(out.contains("1:\t10"), "output: {:?}", out);
    assert!(out.contains("\"x\":\t20"), "output: {:?}", out);
}
