//! Breakpoints hit for real, in functions assembled into code caves
#![cfg(target_arch = "x86_64")]

use std::sync::atomic::{AtomicUsize, Ordering};

use hackpoints::{count, Engine, EngineOptions, HandlerDirectory, RegisterSnapshot, Resume};
use serde_json::{json, Value};

/// `lea rax, [rdi + rsi]; ret`
const ADD: &str = "48 8d 04 37 c3";

type Add = extern "sysv64" fn(usize, usize) -> usize;

static NOOP_HITS: AtomicUsize = AtomicUsize::new(0);

fn bp_noop(_regs: &mut RegisterSnapshot, _info: &Value) -> Resume {
    NOOP_HITS.fetch_add(1, Ordering::SeqCst);
    Resume::Continue
}

/// Scales the first argument by `factor`
fn bp_scale(regs: &mut RegisterSnapshot, info: &Value) -> Resume {
    let factor = RegisterSnapshot::param(info, "factor").unwrap_or(1);
    if let Some(reg) = regs.register_from(info, "reg") {
        *reg *= factor;
    }
    Resume::cave_exec_flag(info)
}

/// Returns `value` from the hooked function without running it
fn bp_return(regs: &mut RegisterSnapshot, info: &Value) -> Resume {
    regs.rax = RegisterSnapshot::param(info, "value").unwrap_or(0);
    // pop the caller's return address, as `ret` would
    regs.rsp += 8;
    regs.retaddr = unsafe { *(regs.rsp as *const usize) };
    Resume::Skip
}

fn engine() -> Engine {
    let handlers = HandlerDirectory::new()
        .with("BP_noop", bp_noop)
        .and_then(|h| h.with("BP_scale", bp_scale))
        .and_then(|h| h.with("BP_return", bp_return))
        .unwrap();
    Engine::new(EngineOptions::default(), handlers)
}

/// Assembles `add` into a cave of `engine`
fn add(engine: &mut Engine, name: &str) -> (usize, Add) {
    assert!(engine.apply_codecaves(&json!({ name: ADD })));
    let address = engine.cave(name).unwrap();
    (address, unsafe { std::mem::transmute::<usize, Add>(address) })
}

#[test]
/// A handler that changes nothing leaves the function's behavior alone
fn test_noop() {
    let mut engine = engine();
    let (address, add) = add(&mut engine, "noop");
    let original = unsafe { std::slice::from_raw_parts(address as *const u8, 5) }.to_vec();

    assert!(engine.apply_breakpoints(&json!({ "codecave:noop": { "handler": "noop" } })));
    assert!(engine.is_installed(address));

    let hits = NOOP_HITS.load(Ordering::SeqCst);
    assert_eq!(add(3, 4), 7);
    assert_eq!(add(usize::MAX, 2), 1);
    assert_eq!(NOOP_HITS.load(Ordering::SeqCst), hits + 2);

    assert!(engine.remove_all());
    let restored = unsafe { std::slice::from_raw_parts(address as *const u8, 5) };
    assert_eq!(restored, original);
    assert_eq!(add(3, 4), 7);
}

#[test]
/// Register changes are seen by the relocated instructions
fn test_continue() {
    let mut engine = engine();
    let (_, add) = add(&mut engine, "scale");

    assert!(engine.apply_breakpoints(&json!({
        "codecave:scale": [
            { "handler": "scale#rdi", "reg": "rdi", "factor": 2 },
            { "handler": "scale#rsi", "reg": "RSI", "factor": "0x10" }
        ]
    })));
    assert_eq!(add(3, 4), 3 * 2 + 4 * 0x10);
}

#[test]
/// Skip returns to the handler's address with the handler's stack
fn test_skip() {
    let mut engine = engine();
    let (_, add) = add(&mut engine, "skip");

    assert!(engine.apply_breakpoints(&json!({
        "codecave:skip": [
            { "handler": "scale", "reg": "rdi", "factor": 2 },
            { "handler": "return", "value": 42 }
        ]
    })));
    for _ in 0..3 {
        assert_eq!(add(3, 4), 42);
    }
}

#[test]
/// cave_exec: false with a handler that only changes state
fn test_cave_exec_flag() {
    let mut engine = engine();
    let (address, add) = add(&mut engine, "flag");

    // `return` supplies the result the skipped instructions would have computed
    assert!(engine.apply_breakpoints(&json!({
        format!("{address:#x}"): [
            { "handler": "scale", "reg": "rax", "factor": 0, "cave_exec": false },
            { "handler": "return", "value": 5 }
        ]
    })));
    assert_eq!(add(1, 1), 5);
}

#[test]
fn test_count() {
    let config = json!({
        "0x1000": [{ "handler": "a" }, { "handler": "b" }, { "handler": "c" }],
        "0x2000": { "handler": "d" }
    });
    assert_eq!(count(&config), 4);
}
