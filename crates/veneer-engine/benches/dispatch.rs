use criterion::{black_box, criterion_group, criterion_main, Criterion};
use veneer_engine::{CallSite, LinkOptions, Promises, Strategy, Value};

extern "C" fn mac(a: i64, b: i64, c: i64) -> i64 {
    a.wrapping_mul(b).wrapping_add(c)
}

extern "C" fn count(text: *const std::ffi::c_char) -> i64 {
    let mut n = 0;
    unsafe {
        while *text.add(n as usize) != 0 {
            n += 1;
        }
    }
    n
}

const MAC_DESC: &str = "func(long,long,long)long";

fn mac_target() -> usize {
    mac as extern "C" fn(i64, i64, i64) -> i64 as usize
}

fn bench_vm_dispatch(c: &mut Criterion) {
    let site = CallSite::for_address_with(
        mac_target(),
        "mac",
        MAC_DESC,
        Promises::NO_MANAGED_RETURN,
        LinkOptions {
            strategy: Strategy::VmOnly,
        },
    );

    c.bench_function("dispatch_vm", |b| {
        b.iter(|| {
            let mut args = [
                Value::I64(black_box(3)),
                Value::I64(black_box(5)),
                Value::I64(black_box(7)),
            ];
            site.call(&mut args).unwrap()
        });
    });
}

fn bench_jit_dispatch(c: &mut Criterion) {
    let site = CallSite::for_address_with(
        mac_target(),
        "mac",
        MAC_DESC,
        Promises::NO_MANAGED_RETURN,
        LinkOptions {
            strategy: Strategy::JitOnly,
        },
    );
    // Hosts without a trampoline backend skip this benchmark.
    if site.bind_error().is_some() {
        return;
    }

    c.bench_function("dispatch_jit", |b| {
        b.iter(|| {
            let mut args = [
                Value::I64(black_box(3)),
                Value::I64(black_box(5)),
                Value::I64(black_box(7)),
            ];
            site.call(&mut args).unwrap()
        });
    });
}

fn bench_string_marshalling(c: &mut Criterion) {
    let target = count as extern "C" fn(*const std::ffi::c_char) -> i64 as usize;
    let site = CallSite::for_address(target, "count", "func(#char)long", Promises::NONE);

    c.bench_function("dispatch_string_arg", |b| {
        b.iter(|| {
            let mut args = [Value::Str(black_box("the quick brown fox".to_string()))];
            site.call(&mut args).unwrap()
        });
    });
}

fn bench_bind(c: &mut Criterion) {
    let target = mac_target();
    c.bench_function("bind_descriptor", |b| {
        b.iter(|| {
            CallSite::for_address(
                black_box(target),
                "mac",
                black_box("read func(&void[=@2],size_t=@1,size_t)size_t"),
                Promises::NONE,
            )
        });
    });
}

criterion_group!(
    benches,
    bench_vm_dispatch,
    bench_jit_dispatch,
    bench_string_marshalling,
    bench_bind
);
criterion_main!(benches);
