//! End-to-end binding and call tests.
//!
//! Covers the full path from descriptor text to a foreign call:
//! - Binding against the process image and against code addresses
//! - Scalar, string and buffer marshalling
//! - Return assertions and on-failure hooks
//! - Stub sites for every bind-time failure mode

use veneer_engine::{CallError, CallSite, Linker, Promises, Value};

extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
    a.wrapping_add(b).wrapping_add(c)
}

extern "C" fn mix(a: f64, b: f32) -> f64 {
    a + b as f64
}

extern "C" fn always_zero(_: i32) -> i32 {
    0
}

// ===== Address bindings =====

#[test]
fn test_scalar_marshalling() {
    let target = add3 as extern "C" fn(i64, i64, i64) -> i64 as usize;
    let site = CallSite::for_address(target, "add3", "func(long,long,long)long", Promises::NONE);
    let ret = site
        .call(&mut [Value::I64(1), Value::I64(-2), Value::I64(40)])
        .unwrap();
    assert!(matches!(ret, Value::I64(39)));
}

#[test]
fn test_float_widths() {
    let target = mix as extern "C" fn(f64, f32) -> f64 as usize;
    let site = CallSite::for_address(target, "mix", "func(double,float)double", Promises::NONE);
    let ret = site
        .call(&mut [Value::F64(1.5), Value::F32(0.25)])
        .unwrap();
    match ret {
        Value::F64(v) => assert_eq!(v, 1.75),
        other => panic!("unexpected result {other:?}"),
    }

    // Integer values coerce into float slots.
    let ret = site.call(&mut [Value::I32(2), Value::F32(0.5)]).unwrap();
    match ret {
        Value::F64(v) => assert_eq!(v, 2.5),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_inverted_return_flips_truthiness() {
    let target = always_zero as extern "C" fn(i32) -> i32 as usize;
    let site = CallSite::for_address(target, "always_zero", "func(int)!int", Promises::NONE);
    let ret = site.call(&mut [Value::I32(5)]).unwrap();
    assert!(matches!(ret, Value::Bool(true)));
}

#[test]
fn test_rebinding_gives_independent_equivalent_sites() {
    let target = add3 as extern "C" fn(i64, i64, i64) -> i64 as usize;
    let source = "func(long,long,long)long";
    let first = CallSite::for_address(target, "add3", source, Promises::NONE);
    let second = CallSite::for_address(target, "add3", source, Promises::NONE);

    assert_eq!(first.dispatch_kind(), second.dispatch_kind());
    assert_eq!(first.code_string(), second.code_string());

    let mut args = [Value::I64(10), Value::I64(20), Value::I64(12)];
    let a = first.call(&mut args.clone()).unwrap();
    let b = second.call(&mut args).unwrap();
    assert!(matches!(a, Value::I64(42)));
    assert!(matches!(b, Value::I64(42)));

    // Sites do not share registration state.
    assert_eq!(first.registered_callbacks(), 0);
    assert_eq!(second.registered_callbacks(), 0);
}

#[test]
fn test_eleven_arguments_rejected_at_bind() {
    let source = "func(int,int,int,int,int,int,int,int,int,int,int)int";
    let site = CallSite::for_address(0x1000, "wide", source, Promises::NONE);
    let err = site.bind_error().unwrap();
    assert!(err.to_string().contains("too many arguments"));
}

#[test]
fn test_unsupported_assertion_rune_stubs_site() {
    let site = CallSite::for_address(0x1000, "odd", "func(&char~@2,int)int", Promises::NONE);
    let err = site.bind_error().unwrap();
    let text = err.to_string();
    assert!(text.contains("currently unsupported"), "got: {text}");
}

#[test]
fn test_wide_struct_argument_stubs_site() {
    // A three-word aggregate decomposes past what value dispatch takes.
    let site = CallSite::for_address(0x1000, "wide", "func(struct[24])int", Promises::NONE);
    let err = site.bind_error().unwrap();
    assert!(err
        .to_string()
        .contains("only value arguments are supported"));
}

// ===== Process bindings (libc) =====

#[cfg(unix)]
mod libc_bound {
    use super::*;

    #[test]
    fn test_strlen_round_trip() {
        let linker = Linker::this().unwrap();
        let site = linker.bind("strlen", "func(#char)size_t", Promises::NONE);
        assert!(site.bind_error().is_none());
        let ret = site.call(&mut [Value::Str("veneer".into())]).unwrap();
        match ret {
            Value::U64(n) => assert_eq!(n, 6),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_toupper_scalar() {
        let linker = Linker::this().unwrap();
        let site = linker.bind("toupper", "func(int)int", Promises::NONE);
        let ret = site.call(&mut [Value::I32('q' as i32)]).unwrap();
        assert!(matches!(ret, Value::I32(v) if v == 'Q' as i32));
    }

    #[test]
    fn test_buffer_write_through() {
        let linker = Linker::this().unwrap();
        let site = linker.bind("strcpy", "func(&void,#char)&void", Promises::NONE);
        let mut args = [Value::Bytes(vec![0u8; 16]), Value::Str("copied".into())];
        let ret = site.call(&mut args).unwrap();
        assert!(matches!(ret, Value::Ptr(p) if !p.is_null()));
        match &args[0] {
            Value::Bytes(bytes) => assert_eq!(&bytes[..7], b"copied\0"),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_symbol_overrides_name() {
        let linker = Linker::this().unwrap();
        let site = linker.bind("whatever", "strlen func(#char)size_t", Promises::NONE);
        let ret = site.call(&mut [Value::Str("abc".into())]).unwrap();
        assert!(matches!(ret, Value::U64(3)));
    }

    #[test]
    fn test_return_assertion_failure_without_hook() {
        let linker = Linker::this().unwrap();
        // access(2) returns 0 on success; asserting equality with the
        // mode argument turns the -1 failure into a native error.
        let site = linker.bind("access", "func(#char,int)int=@2", Promises::NONE);
        let err = site
            .call(&mut [Value::Str("/veneer-no-such-path".into()), Value::I32(0)])
            .unwrap_err();
        match err {
            CallError::Native { symbol, code } => {
                assert_eq!(symbol, "access");
                assert_eq!(code, -1);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_on_failure_hook_supplies_code() {
        let linker = Linker::this().unwrap();
        // The hook gets the failing call's first argument; strlen of the
        // path is a deterministic stand-in for an errno fetch.
        let site = linker.bind(
            "access",
            "func(#char,int)int=@2; strlen(@1)",
            Promises::NONE,
        );
        let path = "/veneer-no-such-path";
        let err = site
            .call(&mut [Value::Str(path.into()), Value::I32(0)])
            .unwrap_err();
        match err {
            CallError::Native { code, .. } => assert_eq!(code, path.len() as i64),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_assertion_success_passes_value_through() {
        let linker = Linker::this().unwrap();
        let site = linker.bind("access", "func(#char,int)int=@2", Promises::NONE);
        let ret = site
            .call(&mut [Value::Str("/".into()), Value::I32(0)])
            .unwrap();
        assert!(matches!(ret, Value::I32(0)));
    }

    #[test]
    fn test_missing_hook_symbol_stubs_site() {
        let linker = Linker::this().unwrap();
        let site = linker.bind(
            "access",
            "func(#char,int)int=@2; veneer_no_hook(@1)",
            Promises::NONE,
        );
        assert!(site.bind_error().is_some());
    }
}

// ===== Library candidate lists =====

#[cfg(target_os = "linux")]
mod candidates {
    use super::*;

    #[test]
    fn test_first_missing_candidate_falls_through() {
        let linker = Linker::open("veneer-definitely-missing.so, libm.so.6").unwrap();
        assert_eq!(linker.library().path(), "libm.so.6");
        let site = linker.bind("cos", "func(double)double", Promises::NONE);
        let ret = site.call(&mut [Value::F64(0.0)]).unwrap();
        match ret {
            Value::F64(v) => assert_eq!(v, 1.0),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_candidates_report_last_error() {
        let err = Linker::open("veneer-missing-a.so,veneer-missing-b.so").unwrap_err();
        assert!(err.to_string().contains("library not available"));
    }
}
